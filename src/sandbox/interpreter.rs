//! Tree-walking evaluator.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;

use super::ast::{
    Arg, BinOp, BoolOp, CmpOp, Comprehension, Constant, ExceptHandler, Expr, FStringPart, Module,
    Param, ParamKind, Stmt, StmtKind, Target, UnaryOp,
};
use super::value::{
    DictMap, Function, FunctionBody, HashKey, Scope, SetMap, Value,
};
use super::{Exception, SandboxPolicy, ScriptError, TraceFrame, builtins, format, methods};

/// The wall clock is consulted once per this many steps.
const DEADLINE_CHECK_INTERVAL: u64 = 1024;

pub(crate) enum Flow {
    Normal,
    Return(Value),
    Break,
    Continue,
}

pub(crate) struct Frame {
    locals: Scope,
    enclosing: Rc<Vec<Scope>>,
    module_level: bool,
    function: Rc<str>,
    line: Cell<usize>,
}

/// Evaluated call arguments.
#[derive(Debug, Default)]
pub(crate) struct CallArgs {
    pub positional: Vec<Value>,
    pub keywords: Vec<(String, Value)>,
}

impl CallArgs {
    pub fn new(positional: Vec<Value>) -> Self {
        Self {
            positional,
            keywords: Vec::new(),
        }
    }

    /// Remove and return keyword `name`.
    pub fn keyword(&mut self, name: &str) -> Option<Value> {
        let idx = self.keywords.iter().position(|(key, _)| key == name)?;
        Some(self.keywords.remove(idx).1)
    }

    /// Check the positional count and that no unknown keywords remain.
    pub fn expect(&self, func: &str, min: usize, max: usize) -> Result<(), ScriptError> {
        if let Some((key, _)) = self.keywords.first() {
            return Err(ScriptError::raise(
                "TypeError",
                format!("{func}() got an unexpected keyword argument '{key}'"),
            ));
        }
        let given = self.positional.len();
        if given < min || given > max {
            let expected = if min == max {
                format!("exactly {min}")
            } else if max == usize::MAX {
                format!("at least {min}")
            } else if given < min {
                format!("at least {min}")
            } else {
                format!("at most {max}")
            };
            let noun = if expected.ends_with(" 1") {
                "argument"
            } else {
                "arguments"
            };
            return Err(ScriptError::raise(
                "TypeError",
                format!("{func}() takes {expected} {noun} ({given} given)"),
            ));
        }
        Ok(())
    }

    pub fn arg(&self, idx: usize) -> Option<&Value> {
        self.positional.get(idx)
    }
}

pub(crate) struct Interpreter {
    policy: SandboxPolicy,
    deadline: Instant,
    steps: u64,
    depth: usize,
    globals: Scope,
    /// Exceptions currently being handled, for bare `raise`.
    handling: Vec<Rc<Exception>>,
}

impl Interpreter {
    pub fn new(policy: SandboxPolicy, deadline: Instant) -> Self {
        Self {
            policy,
            deadline,
            steps: 0,
            depth: 0,
            globals: Rc::new(RefCell::new(HashMap::new())),
            handling: Vec::new(),
        }
    }

    pub fn set_deadline(&mut self, deadline: Instant) {
        self.deadline = deadline;
    }

    pub fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    pub fn tick(&mut self) -> Result<(), ScriptError> {
        self.steps += 1;
        if let Some(max) = self.policy.limits.max_steps
            && self.steps > max
        {
            return Err(ScriptError::StepLimit(max));
        }
        if self.steps % DEADLINE_CHECK_INTERVAL == 0 && Instant::now() >= self.deadline {
            return Err(ScriptError::Timeout);
        }
        Ok(())
    }

    pub fn check_len(&self, len: usize) -> Result<(), ScriptError> {
        let max = self.policy.limits.max_collection_len;
        if len > max {
            return Err(ScriptError::raise(
                "MemoryError",
                format!("collection size {len} exceeds the limit of {max}"),
            ));
        }
        Ok(())
    }

    fn module_frame(&self) -> Frame {
        Frame {
            locals: self.globals.clone(),
            enclosing: Rc::new(Vec::new()),
            module_level: true,
            function: Rc::from("<module>"),
            line: Cell::new(0),
        }
    }

    pub fn run_module(&mut self, module: &Module) -> Result<(), ScriptError> {
        self.steps = 0;
        let frame = self.module_frame();
        self.exec_block(&module.body, &frame)
            .map(|_| ())
            .map_err(|err| annotate(err, &frame))
    }

    pub fn has_callable(&self, name: &str) -> bool {
        matches!(
            self.globals.borrow().get(name),
            Some(Value::Function(_) | Value::Builtin(_) | Value::Method(_))
        )
    }

    /// Call a global by name. Each top-level call gets a fresh step budget.
    pub fn call_global(
        &mut self,
        name: &str,
        positional: Vec<Value>,
        keywords: Vec<(String, Value)>,
    ) -> Result<Value, ScriptError> {
        self.steps = 0;
        self.depth = 0;
        let func = self.globals.borrow().get(name).cloned().ok_or_else(|| {
            ScriptError::raise("NameError", format!("name '{name}' is not defined"))
        })?;
        self.call_value(
            &func,
            CallArgs {
                positional,
                keywords,
            },
        )
    }

    // ── statements ──

    fn exec_block(&mut self, body: &[Stmt], frame: &Frame) -> Result<Flow, ScriptError> {
        for stmt in body {
            let flow = self.exec_stmt(stmt, frame)?;
            if !matches!(flow, Flow::Normal) {
                return Ok(flow);
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt, frame: &Frame) -> Result<Flow, ScriptError> {
        self.tick()?;
        frame.line.set(stmt.line);
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.eval(expr, frame)?;
            }
            StmtKind::Assign { targets, value } => {
                let value = self.eval(value, frame)?;
                for target in targets {
                    self.assign(target, value.clone(), frame)?;
                }
            }
            StmtKind::AugAssign { target, op, value } => {
                self.aug_assign(target, *op, value, frame)?;
            }
            StmtKind::FunctionDef(def) => {
                let func = self.make_function(
                    FunctionBody::Def(def.clone()),
                    &def.name,
                    &def.params,
                    frame,
                )?;
                frame.locals.borrow_mut().insert(def.name.clone(), func);
            }
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr, frame)?,
                    None => Value::None,
                };
                return Ok(Flow::Return(value));
            }
            StmtKind::If { test, body, orelse } => {
                return if self.eval(test, frame)?.truthy() {
                    self.exec_block(body, frame)
                } else {
                    self.exec_block(orelse, frame)
                };
            }
            StmtKind::While { test, body } => loop {
                self.tick()?;
                if !self.eval(test, frame)?.truthy() {
                    break;
                }
                match self.exec_block(body, frame)? {
                    Flow::Break => break,
                    Flow::Return(value) => return Ok(Flow::Return(value)),
                    Flow::Normal | Flow::Continue => {}
                }
            },
            StmtKind::For { target, iter, body } => {
                let iterable = self.eval(iter, frame)?;
                return self.exec_for(target, iterable, body, frame);
            }
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
            StmtKind::Pass => {}
            StmtKind::Import(aliases) => {
                for alias in aliases {
                    let module = builtins::import(&alias.name, self.policy.host)?;
                    let bound = alias.asname.clone().unwrap_or_else(|| alias.name.clone());
                    frame.locals.borrow_mut().insert(bound, module);
                }
            }
            StmtKind::ImportFrom { module, names } => {
                let Value::Module(module_name) = builtins::import(module, self.policy.host)? else {
                    return Err(ScriptError::raise(
                        "ImportError",
                        format!("No module named '{module}'"),
                    ));
                };
                for alias in names {
                    if alias.name == "*" {
                        return Err(ScriptError::raise(
                            "ImportError",
                            "wildcard imports are not supported",
                        ));
                    }
                    let value = builtins::module_attr(module_name, &alias.name).ok_or_else(|| {
                        ScriptError::raise(
                            "ImportError",
                            format!("cannot import name '{}' from '{module}'", alias.name),
                        )
                    })?;
                    let bound = alias.asname.clone().unwrap_or_else(|| alias.name.clone());
                    frame.locals.borrow_mut().insert(bound, value);
                }
            }
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => return self.exec_try(body, handlers, orelse, finalbody, frame),
            StmtKind::Raise(expr) => return Err(self.raise_error(expr.as_ref(), frame)?),
            StmtKind::Assert { test, msg } => {
                if !self.eval(test, frame)?.truthy() {
                    let message = match msg {
                        Some(msg) => self.eval(msg, frame)?.py_str(),
                        None => String::new(),
                    };
                    return Err(ScriptError::raise("AssertionError", message));
                }
            }
            StmtKind::Delete(targets) => {
                for target in targets {
                    self.delete(target, frame)?;
                }
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_for(
        &mut self,
        target: &Target,
        iterable: Value,
        body: &[Stmt],
        frame: &Frame,
    ) -> Result<Flow, ScriptError> {
        let run = |interp: &mut Self, item: Value| -> Result<Option<Flow>, ScriptError> {
            interp.tick()?;
            interp.assign(target, item, frame)?;
            Ok(match interp.exec_block(body, frame)? {
                Flow::Break => Some(Flow::Normal),
                Flow::Return(value) => Some(Flow::Return(value)),
                Flow::Normal | Flow::Continue => None,
            })
        };
        if let Value::Range(range) = iterable {
            for idx in 0..range.len() {
                if let Some(flow) = run(self, Value::Int(range.get(idx)))? {
                    return Ok(flow);
                }
            }
        } else {
            for item in self.iterate(&iterable)? {
                if let Some(flow) = run(self, item)? {
                    return Ok(flow);
                }
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_try(
        &mut self,
        body: &[Stmt],
        handlers: &[ExceptHandler],
        orelse: &[Stmt],
        finalbody: &[Stmt],
        frame: &Frame,
    ) -> Result<Flow, ScriptError> {
        let outcome = match self.exec_block(body, frame) {
            Ok(Flow::Normal) => self.exec_block(orelse, frame),
            Ok(flow) => Ok(flow),
            Err(ScriptError::Raised(exc)) => self.handle_exception(exc, handlers, frame),
            Err(other) => return Err(other),
        };
        if finalbody.is_empty() || outcome.as_ref().is_err_and(ScriptError::is_fatal) {
            return outcome;
        }
        match self.exec_block(finalbody, frame)? {
            Flow::Normal => outcome,
            overriding => Ok(overriding),
        }
    }

    fn handle_exception(
        &mut self,
        exc: Exception,
        handlers: &[ExceptHandler],
        frame: &Frame,
    ) -> Result<Flow, ScriptError> {
        for handler in handlers {
            let matched = match &handler.kind {
                None => true,
                Some(kind) => {
                    let kind = self.eval(kind, frame)?;
                    handler_matches(&kind, &exc)?
                }
            };
            if !matched {
                continue;
            }
            frame.line.set(handler.line);
            let exc = Rc::new(exc);
            if let Some(name) = &handler.name {
                frame
                    .locals
                    .borrow_mut()
                    .insert(name.clone(), Value::Exception(exc.clone()));
            }
            self.handling.push(exc);
            let result = self.exec_block(&handler.body, frame);
            self.handling.pop();
            return result;
        }
        Err(ScriptError::Raised(exc))
    }

    fn raise_error(
        &mut self,
        expr: Option<&Expr>,
        frame: &Frame,
    ) -> Result<ScriptError, ScriptError> {
        let Some(expr) = expr else {
            return Ok(match self.handling.last() {
                Some(exc) => ScriptError::Raised(exc.as_ref().clone()),
                None => ScriptError::raise("RuntimeError", "No active exception to reraise"),
            });
        };
        Ok(match self.eval(expr, frame)? {
            Value::Exception(exc) => {
                ScriptError::Raised(Exception::new(exc.kind.clone(), exc.message.clone()))
            }
            Value::ExceptionType(kind) => ScriptError::Raised(Exception::new(kind.as_ref(), "")),
            _ => ScriptError::raise("TypeError", "exceptions must derive from BaseException"),
        })
    }

    // ── bindings ──

    fn lookup(&self, name: &str, frame: &Frame) -> Result<Value, ScriptError> {
        if let Some(value) = frame.locals.borrow().get(name) {
            return Ok(value.clone());
        }
        if !frame.module_level {
            for scope in frame.enclosing.iter() {
                if let Some(value) = scope.borrow().get(name) {
                    return Ok(value.clone());
                }
            }
            if let Some(value) = self.globals.borrow().get(name) {
                return Ok(value.clone());
            }
        }
        builtins::global(name).ok_or_else(|| {
            ScriptError::raise("NameError", format!("name '{name}' is not defined"))
        })
    }

    fn assign(&mut self, target: &Target, value: Value, frame: &Frame) -> Result<(), ScriptError> {
        match target {
            Target::Name(name) => {
                frame.locals.borrow_mut().insert(name.clone(), value);
                Ok(())
            }
            Target::Tuple(targets) => {
                let items = self.iterate(&value)?;
                if items.len() < targets.len() {
                    return Err(ScriptError::raise(
                        "ValueError",
                        format!(
                            "not enough values to unpack (expected {}, got {})",
                            targets.len(),
                            items.len()
                        ),
                    ));
                }
                if items.len() > targets.len() {
                    return Err(ScriptError::raise(
                        "ValueError",
                        format!("too many values to unpack (expected {})", targets.len()),
                    ));
                }
                for (target, item) in targets.iter().zip(items) {
                    self.assign(target, item, frame)?;
                }
                Ok(())
            }
            Target::Subscript { value: container, index } => {
                let container = self.eval(container, frame)?;
                if let Expr::Slice { lower, upper, step } = index {
                    let bounds = self.slice_bounds(lower, upper, step, frame)?;
                    return self.assign_slice(&container, bounds, value);
                }
                let index = self.eval(index, frame)?;
                self.set_item(&container, index, value)
            }
            Target::Attribute { value: object, attr } => {
                let object = self.eval(object, frame)?;
                Err(ScriptError::raise(
                    "AttributeError",
                    format!("'{}' object attribute '{attr}' is read-only", object.type_name()),
                ))
            }
        }
    }

    fn aug_assign(
        &mut self,
        target: &Target,
        op: BinOp,
        value: &Expr,
        frame: &Frame,
    ) -> Result<(), ScriptError> {
        match target {
            Target::Name(name) => {
                let current = self.lookup(name, frame)?;
                let rhs = self.eval(value, frame)?;
                let result = self.inplace_op(op, current, &rhs)?;
                frame.locals.borrow_mut().insert(name.clone(), result);
                Ok(())
            }
            Target::Subscript { value: container, index } => {
                let container = self.eval(container, frame)?;
                let index = self.eval(index, frame)?;
                let current = self.get_item(&container, &index)?;
                let rhs = self.eval(value, frame)?;
                let result = self.inplace_op(op, current, &rhs)?;
                self.set_item(&container, index, result)
            }
            Target::Attribute { attr, .. } => Err(ScriptError::raise(
                "AttributeError",
                format!("attribute '{attr}' is read-only"),
            )),
            Target::Tuple(_) => Err(ScriptError::raise(
                "TypeError",
                "illegal expression for augmented assignment",
            )),
        }
    }

    fn inplace_op(&mut self, op: BinOp, current: Value, rhs: &Value) -> Result<Value, ScriptError> {
        if op == BinOp::Add
            && let Value::List(items) = &current
        {
            let extra = self.iterate(rhs)?;
            let len = items.borrow().len() + extra.len();
            self.check_len(len)?;
            items.borrow_mut().extend(extra);
            return Ok(current);
        }
        self.binary_op(op, &current, rhs)
    }

    fn delete(&mut self, target: &Target, frame: &Frame) -> Result<(), ScriptError> {
        match target {
            Target::Name(name) => match frame.locals.borrow_mut().remove(name) {
                Some(_) => Ok(()),
                None => Err(ScriptError::raise(
                    "NameError",
                    format!("name '{name}' is not defined"),
                )),
            },
            Target::Tuple(targets) => {
                for target in targets {
                    self.delete(target, frame)?;
                }
                Ok(())
            }
            Target::Subscript { value, index } => {
                let container = self.eval(value, frame)?;
                let index = self.eval(index, frame)?;
                match &container {
                    Value::List(items) => {
                        let len = items.borrow().len();
                        let idx = int_index(&index, "list")
                            .and_then(|i| normalize_index(i, len).ok_or_else(|| {
                                ScriptError::raise("IndexError", "list assignment index out of range")
                            }))?;
                        items.borrow_mut().remove(idx);
                        Ok(())
                    }
                    Value::Dict(map) => {
                        let key = index.hash_key()?;
                        match map.borrow_mut().shift_remove(&key) {
                            Some(_) => Ok(()),
                            None => Err(ScriptError::raise("KeyError", index.py_repr())),
                        }
                    }
                    other => Err(ScriptError::raise(
                        "TypeError",
                        format!("'{}' object does not support item deletion", other.type_name()),
                    )),
                }
            }
            Target::Attribute { attr, .. } => Err(ScriptError::raise(
                "AttributeError",
                format!("cannot delete attribute '{attr}'"),
            )),
        }
    }

    fn capture(frame: &Frame) -> Rc<Vec<Scope>> {
        if frame.module_level {
            return Rc::new(Vec::new());
        }
        let mut chain = Vec::with_capacity(frame.enclosing.len() + 1);
        chain.push(frame.locals.clone());
        chain.extend(frame.enclosing.iter().cloned());
        Rc::new(chain)
    }

    fn make_function(
        &mut self,
        body: FunctionBody,
        name: &str,
        params: &[Param],
        frame: &Frame,
    ) -> Result<Value, ScriptError> {
        let mut defaults = Vec::with_capacity(params.len());
        for param in params {
            defaults.push(match &param.default {
                Some(expr) => Some(self.eval(expr, frame)?),
                None => None,
            });
        }
        Ok(Value::Function(Rc::new(Function {
            name: Rc::from(name),
            body,
            defaults,
            enclosing: Self::capture(frame),
        })))
    }

    // ── calls ──

    pub fn call_value(&mut self, func: &Value, args: CallArgs) -> Result<Value, ScriptError> {
        match func {
            Value::Function(func) => self.call_function(func.clone(), args),
            Value::Builtin(name) => builtins::call(self, *name, args),
            Value::Method(method) => methods::call(self, &method.receiver, method.name, args),
            Value::ExceptionType(kind) => {
                args.expect(kind, 0, usize::MAX)?;
                let message = match args.positional.as_slice() {
                    [] => String::new(),
                    [single] => single.py_str(),
                    many => Value::tuple(many.to_vec()).py_repr(),
                };
                Ok(Value::Exception(Rc::new(Exception::new(kind.as_ref(), message))))
            }
            other => Err(ScriptError::raise(
                "TypeError",
                format!("'{}' object is not callable", other.type_name()),
            )),
        }
    }

    fn call_function(&mut self, func: Rc<Function>, args: CallArgs) -> Result<Value, ScriptError> {
        self.tick()?;
        if self.depth >= self.policy.limits.max_call_depth {
            return Err(ScriptError::raise(
                "RecursionError",
                "maximum recursion depth exceeded",
            ));
        }
        let locals = bind_arguments(&func, args)?;
        let line = match &func.body {
            FunctionBody::Def(def) => def.line,
            FunctionBody::Lambda(_) => 0,
        };
        let frame = Frame {
            locals: Rc::new(RefCell::new(locals)),
            enclosing: func.enclosing.clone(),
            module_level: false,
            function: func.name.clone(),
            line: Cell::new(line),
        };
        self.depth += 1;
        let result = match &func.body {
            FunctionBody::Def(def) => self.exec_block(&def.body, &frame).map(|flow| match flow {
                Flow::Return(value) => value,
                _ => Value::None,
            }),
            FunctionBody::Lambda(lambda) => self.eval(&lambda.body, &frame),
        };
        self.depth -= 1;
        result.map_err(|err| annotate(err, &frame))
    }

    fn eval_args(&mut self, args: &[Arg], frame: &Frame) -> Result<CallArgs, ScriptError> {
        let mut out = CallArgs::default();
        for arg in args {
            match arg {
                Arg::Positional(expr) => out.positional.push(self.eval(expr, frame)?),
                Arg::Keyword(name, expr) => {
                    let value = self.eval(expr, frame)?;
                    out.keywords.push((name.clone(), value));
                }
                Arg::Star(expr) => {
                    let value = self.eval(expr, frame)?;
                    out.positional.extend(self.iterate(&value)?);
                }
                Arg::DoubleStar(expr) => match self.eval(expr, frame)? {
                    Value::Dict(map) => {
                        for (key, value) in map.borrow().values() {
                            let Value::Str(key) = key else {
                                return Err(ScriptError::raise(
                                    "TypeError",
                                    "keywords must be strings",
                                ));
                            };
                            out.keywords.push((key.to_string(), value.clone()));
                        }
                    }
                    other => {
                        return Err(ScriptError::raise(
                            "TypeError",
                            format!(
                                "argument after ** must be a mapping, not {}",
                                other.type_name()
                            ),
                        ));
                    }
                },
            }
        }
        Ok(out)
    }

    // ── expressions ──

    pub fn eval(&mut self, expr: &Expr, frame: &Frame) -> Result<Value, ScriptError> {
        match expr {
            Expr::Constant(constant) => Ok(match constant {
                Constant::None => Value::None,
                Constant::Bool(b) => Value::Bool(*b),
                Constant::Int(i) => Value::Int(*i),
                Constant::Float(f) => Value::Float(*f),
                Constant::Str(s) => Value::str(s.as_str()),
            }),
            Expr::FString(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        FStringPart::Literal(text) => out.push_str(text),
                        FStringPart::Expr {
                            expr,
                            conversion,
                            spec,
                        } => {
                            let value = self.eval(expr, frame)?;
                            let value = match conversion {
                                Some('r') | Some('a') => Value::str(value.py_repr()),
                                Some('s') => Value::str(value.py_str()),
                                _ => value,
                            };
                            out.push_str(&format::format_value(
                                &value,
                                spec.as_deref().unwrap_or(""),
                            )?);
                        }
                    }
                    self.check_len(out.len())?;
                }
                Ok(Value::str(out))
            }
            Expr::Name(name) => self.lookup(name, frame),
            Expr::List(items) => Ok(Value::list(self.eval_all(items, frame)?)),
            Expr::Tuple(items) => Ok(Value::tuple(self.eval_all(items, frame)?)),
            Expr::Set(items) => {
                let mut set = SetMap::new();
                for value in self.eval_all(items, frame)? {
                    set.insert(value.hash_key()?, value);
                }
                Ok(Value::set(set))
            }
            Expr::Dict(entries) => {
                let mut map = DictMap::new();
                for (key, value) in entries {
                    let key = self.eval(key, frame)?;
                    let value = self.eval(value, frame)?;
                    dict_insert(&mut map, key, value)?;
                }
                Ok(Value::dict(map))
            }
            Expr::Attribute { value, attr } => {
                let value = self.eval(value, frame)?;
                get_attr(&value, attr)
            }
            Expr::Subscript { value, index } => {
                let container = self.eval(value, frame)?;
                if let Expr::Slice { lower, upper, step } = index.as_ref() {
                    let bounds = self.slice_bounds(lower, upper, step, frame)?;
                    return self.slice(&container, bounds);
                }
                let index = self.eval(index, frame)?;
                self.get_item(&container, &index)
            }
            Expr::Slice { .. } => Err(ScriptError::raise(
                "TypeError",
                "slice expressions are only valid inside subscripts",
            )),
            Expr::Call { func, args } => {
                let callee = self.eval(func, frame)?;
                let args = self.eval_args(args, frame)?;
                self.call_value(&callee, args)
            }
            Expr::BinOp { op, left, right } => {
                let left = self.eval(left, frame)?;
                let right = self.eval(right, frame)?;
                self.binary_op(*op, &left, &right)
            }
            Expr::UnaryOp { op, operand } => {
                let operand = self.eval(operand, frame)?;
                unary_op(*op, &operand)
            }
            Expr::BoolOp { op, left, right } => {
                let left = self.eval(left, frame)?;
                match (op, left.truthy()) {
                    (BoolOp::And, false) | (BoolOp::Or, true) => Ok(left),
                    _ => self.eval(right, frame),
                }
            }
            Expr::Compare { left, ops } => {
                let mut left = self.eval(left, frame)?;
                for (op, right) in ops {
                    let right = self.eval(right, frame)?;
                    if !self.compare(*op, &left, &right)? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Ok(Value::Bool(true))
            }
            Expr::IfExp { test, body, orelse } => {
                if self.eval(test, frame)?.truthy() {
                    self.eval(body, frame)
                } else {
                    self.eval(orelse, frame)
                }
            }
            Expr::Lambda(lambda) => self.make_function(
                FunctionBody::Lambda(lambda.clone()),
                "<lambda>",
                &lambda.params,
                frame,
            ),
            Expr::ListComp { elt, generators } => {
                let scope = self.comprehension_frame(frame);
                let mut out = Vec::new();
                self.comprehension(generators, &scope, &mut |interp, frame| {
                    out.push(interp.eval(elt, frame)?);
                    interp.check_len(out.len())
                })?;
                Ok(Value::list(out))
            }
            Expr::SetComp { elt, generators } => {
                let scope = self.comprehension_frame(frame);
                let mut out = SetMap::new();
                self.comprehension(generators, &scope, &mut |interp, frame| {
                    let value = interp.eval(elt, frame)?;
                    out.insert(value.hash_key()?, value);
                    interp.check_len(out.len())
                })?;
                Ok(Value::set(out))
            }
            Expr::DictComp {
                key,
                value,
                generators,
            } => {
                let scope = self.comprehension_frame(frame);
                let mut out = DictMap::new();
                self.comprehension(generators, &scope, &mut |interp, frame| {
                    let key = interp.eval(key, frame)?;
                    let value = interp.eval(value, frame)?;
                    dict_insert(&mut out, key, value)?;
                    interp.check_len(out.len())
                })?;
                Ok(Value::dict(out))
            }
        }
    }

    fn eval_all(&mut self, items: &[Expr], frame: &Frame) -> Result<Vec<Value>, ScriptError> {
        let values = items
            .iter()
            .map(|item| self.eval(item, frame))
            .collect::<Result<Vec<_>, _>>()?;
        self.check_len(values.len())?;
        Ok(values)
    }

    fn comprehension_frame(&self, frame: &Frame) -> Frame {
        Frame {
            locals: Rc::new(RefCell::new(HashMap::new())),
            enclosing: Self::capture(frame),
            module_level: false,
            function: frame.function.clone(),
            line: Cell::new(frame.line.get()),
        }
    }

    fn comprehension(
        &mut self,
        generators: &[Comprehension],
        frame: &Frame,
        emit: &mut dyn FnMut(&mut Self, &Frame) -> Result<(), ScriptError>,
    ) -> Result<(), ScriptError> {
        let Some((first, rest)) = generators.split_first() else {
            return emit(self, frame);
        };
        let iterable = self.eval(&first.iter, frame)?;
        'items: for item in self.iterate(&iterable)? {
            self.tick()?;
            self.assign(&first.target, item, frame)?;
            for cond in &first.ifs {
                if !self.eval(cond, frame)?.truthy() {
                    continue 'items;
                }
            }
            self.comprehension(rest, frame, emit)?;
        }
        Ok(())
    }

    /// Materialize an iterable, respecting the collection size cap.
    pub fn iterate(&self, value: &Value) -> Result<Vec<Value>, ScriptError> {
        match value {
            Value::List(items) => Ok(items.borrow().clone()),
            Value::Tuple(items) => Ok(items.as_ref().clone()),
            Value::Str(s) => Ok(s.chars().map(|c| Value::str(c.to_string())).collect()),
            Value::Dict(map) => Ok(map.borrow().values().map(|(k, _)| k.clone()).collect()),
            Value::Set(map) => Ok(map.borrow().values().cloned().collect()),
            Value::Range(range) => {
                let len = range.len();
                self.check_len(len)?;
                Ok((0..len).map(|i| Value::Int(range.get(i))).collect())
            }
            other => Err(ScriptError::raise(
                "TypeError",
                format!("'{}' object is not iterable", other.type_name()),
            )),
        }
    }

    // ── subscripts ──

    pub fn get_item(&self, container: &Value, index: &Value) -> Result<Value, ScriptError> {
        match container {
            Value::List(items) => {
                let items = items.borrow();
                let idx = int_index(index, "list")?;
                normalize_index(idx, items.len())
                    .map(|i| items[i].clone())
                    .ok_or_else(|| ScriptError::raise("IndexError", "list index out of range"))
            }
            Value::Tuple(items) => {
                let idx = int_index(index, "tuple")?;
                normalize_index(idx, items.len())
                    .map(|i| items[i].clone())
                    .ok_or_else(|| ScriptError::raise("IndexError", "tuple index out of range"))
            }
            Value::Str(s) => {
                let idx = int_index(index, "string")?;
                let len = s.chars().count();
                normalize_index(idx, len)
                    .and_then(|i| s.chars().nth(i))
                    .map(|c| Value::str(c.to_string()))
                    .ok_or_else(|| ScriptError::raise("IndexError", "string index out of range"))
            }
            Value::Range(range) => {
                let idx = int_index(index, "range object")?;
                normalize_index(idx, range.len())
                    .map(|i| Value::Int(range.get(i)))
                    .ok_or_else(|| {
                        ScriptError::raise("IndexError", "range object index out of range")
                    })
            }
            Value::Dict(map) => {
                let key = index.hash_key()?;
                map.borrow()
                    .get(&key)
                    .map(|(_, value)| value.clone())
                    .ok_or_else(|| ScriptError::raise("KeyError", index.py_repr()))
            }
            other => Err(ScriptError::raise(
                "TypeError",
                format!("'{}' object is not subscriptable", other.type_name()),
            )),
        }
    }

    fn set_item(&self, container: &Value, index: Value, value: Value) -> Result<(), ScriptError> {
        match container {
            Value::List(items) => {
                let mut items = items.borrow_mut();
                let idx = int_index(&index, "list")?;
                let len = items.len();
                let slot = normalize_index(idx, len).ok_or_else(|| {
                    ScriptError::raise("IndexError", "list assignment index out of range")
                })?;
                items[slot] = value;
                Ok(())
            }
            Value::Dict(map) => {
                let len = map.borrow().len();
                self.check_len(len + 1)?;
                dict_insert(&mut map.borrow_mut(), index, value)
            }
            other => Err(ScriptError::raise(
                "TypeError",
                format!("'{}' object does not support item assignment", other.type_name()),
            )),
        }
    }

    fn slice_bounds(
        &mut self,
        lower: &Option<Box<Expr>>,
        upper: &Option<Box<Expr>>,
        step: &Option<Box<Expr>>,
        frame: &Frame,
    ) -> Result<SliceBounds, ScriptError> {
        let mut bound = |expr: &Option<Box<Expr>>| -> Result<Option<i64>, ScriptError> {
            let Some(expr) = expr else {
                return Ok(None);
            };
            match self.eval(expr, frame)? {
                Value::None => Ok(None),
                value => value.as_int().map(Some).ok_or_else(|| {
                    ScriptError::raise(
                        "TypeError",
                        "slice indices must be integers or None",
                    )
                }),
            }
        };
        Ok(SliceBounds {
            start: bound(lower)?,
            stop: bound(upper)?,
            step: bound(step)?,
        })
    }

    fn slice(&self, container: &Value, bounds: SliceBounds) -> Result<Value, ScriptError> {
        match container {
            Value::List(items) => {
                let items = items.borrow();
                let picked = bounds.indices(items.len())?;
                Ok(Value::list(picked.into_iter().map(|i| items[i].clone()).collect()))
            }
            Value::Tuple(items) => {
                let picked = bounds.indices(items.len())?;
                Ok(Value::tuple(picked.into_iter().map(|i| items[i].clone()).collect()))
            }
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                let picked = bounds.indices(chars.len())?;
                Ok(Value::str(picked.into_iter().map(|i| chars[i]).collect::<String>()))
            }
            Value::Range(range) => {
                let picked = bounds.indices(range.len())?;
                Ok(Value::list(
                    picked.into_iter().map(|i| Value::Int(range.get(i))).collect(),
                ))
            }
            other => Err(ScriptError::raise(
                "TypeError",
                format!("'{}' object is not subscriptable", other.type_name()),
            )),
        }
    }

    fn assign_slice(
        &self,
        container: &Value,
        bounds: SliceBounds,
        value: Value,
    ) -> Result<(), ScriptError> {
        let Value::List(items) = container else {
            return Err(ScriptError::raise(
                "TypeError",
                format!(
                    "'{}' object does not support slice assignment",
                    container.type_name()
                ),
            ));
        };
        if bounds.step.is_some_and(|step| step != 1) {
            return Err(ScriptError::raise(
                "ValueError",
                "extended slice assignment is not supported",
            ));
        }
        let replacement = self.iterate(&value)?;
        let len = items.borrow().len();
        let clamp = |bound: Option<i64>, default: usize| -> usize {
            match bound {
                None => default,
                Some(b) if b < 0 => (b + len as i64).max(0) as usize,
                Some(b) => (b as usize).min(len),
            }
        };
        let start = clamp(bounds.start, 0);
        let stop = clamp(bounds.stop, len).max(start);
        self.check_len(len - (stop - start) + replacement.len())?;
        items.borrow_mut().splice(start..stop, replacement);
        Ok(())
    }

    // ── operators ──

    fn compare(&mut self, op: CmpOp, left: &Value, right: &Value) -> Result<bool, ScriptError> {
        use std::cmp::Ordering::{Equal, Greater, Less};
        Ok(match op {
            CmpOp::Eq => left.py_eq(right),
            CmpOp::NotEq => !left.py_eq(right),
            CmpOp::Lt => matches!(left.py_cmp(right)?, Some(Less)),
            CmpOp::LtE => matches!(left.py_cmp(right)?, Some(Less | Equal)),
            CmpOp::Gt => matches!(left.py_cmp(right)?, Some(Greater)),
            CmpOp::GtE => matches!(left.py_cmp(right)?, Some(Greater | Equal)),
            CmpOp::In => contains(right, left)?,
            CmpOp::NotIn => !contains(right, left)?,
            CmpOp::Is => left.is_same(right),
            CmpOp::IsNot => !left.is_same(right),
        })
    }

    pub fn binary_op(&mut self, op: BinOp, left: &Value, right: &Value) -> Result<Value, ScriptError> {
        if let (Value::Bool(a), Value::Bool(b)) = (left, right) {
            match op {
                BinOp::BitAnd => return Ok(Value::Bool(*a & *b)),
                BinOp::BitOr => return Ok(Value::Bool(*a | *b)),
                BinOp::BitXor => return Ok(Value::Bool(*a ^ *b)),
                _ => {}
            }
        }
        if let (Some(a), Some(b)) = (left.as_int(), right.as_int()) {
            return int_op(op, a, b);
        }
        if let (Some(a), Some(b)) = (left.as_float(), right.as_float()) {
            return float_op(op, a, b);
        }
        match (op, left, right) {
            (BinOp::Add, Value::Str(a), Value::Str(b)) => {
                self.check_len(a.len() + b.len())?;
                Ok(Value::str(format!("{a}{b}")))
            }
            (BinOp::Add, Value::List(a), Value::List(b)) => {
                let mut items = a.borrow().clone();
                items.extend(b.borrow().iter().cloned());
                self.check_len(items.len())?;
                Ok(Value::list(items))
            }
            (BinOp::Add, Value::Tuple(a), Value::Tuple(b)) => {
                let mut items = a.as_ref().clone();
                items.extend(b.iter().cloned());
                self.check_len(items.len())?;
                Ok(Value::tuple(items))
            }
            (BinOp::Mul, Value::Str(s), n) | (BinOp::Mul, n, Value::Str(s)) if n.as_int().is_some() => {
                let count = n.as_int().unwrap_or(0).max(0) as usize;
                self.check_len(s.len().saturating_mul(count))?;
                Ok(Value::str(s.repeat(count)))
            }
            (BinOp::Mul, Value::List(items), n) | (BinOp::Mul, n, Value::List(items))
                if n.as_int().is_some() =>
            {
                let items = items.borrow().clone();
                Ok(Value::list(self.repeat(&items, n.as_int().unwrap_or(0))?))
            }
            (BinOp::Mul, Value::Tuple(items), n) | (BinOp::Mul, n, Value::Tuple(items))
                if n.as_int().is_some() =>
            {
                Ok(Value::tuple(self.repeat(items, n.as_int().unwrap_or(0))?))
            }
            (BinOp::Mod, Value::Str(template), args) => {
                let out = format::percent_format(template, args)?;
                self.check_len(out.len())?;
                Ok(Value::str(out))
            }
            (BinOp::Sub | BinOp::BitOr | BinOp::BitAnd | BinOp::BitXor, Value::Set(a), Value::Set(b)) => {
                let (a, b) = (a.borrow(), b.borrow());
                let out: SetMap = match op {
                    BinOp::Sub => a
                        .iter()
                        .filter(|(k, _)| !b.contains_key(*k))
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                    BinOp::BitAnd => a
                        .iter()
                        .filter(|(k, _)| b.contains_key(*k))
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                    BinOp::BitOr => a
                        .iter()
                        .chain(b.iter())
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                    _ => a
                        .iter()
                        .filter(|(k, _)| !b.contains_key(*k))
                        .chain(b.iter().filter(|(k, _)| !a.contains_key(*k)))
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                };
                Ok(Value::set(out))
            }
            (BinOp::BitOr, Value::Dict(a), Value::Dict(b)) => {
                let mut out = a.borrow().clone();
                for (key, entry) in b.borrow().iter() {
                    out.insert(key.clone(), entry.clone());
                }
                Ok(Value::dict(out))
            }
            _ => Err(ScriptError::raise(
                "TypeError",
                format!(
                    "unsupported operand type(s) for {}: '{}' and '{}'",
                    op.symbol(),
                    left.type_name(),
                    right.type_name()
                ),
            )),
        }
    }

    fn repeat(&self, items: &[Value], count: i64) -> Result<Vec<Value>, ScriptError> {
        if items.is_empty() || count <= 0 {
            return Ok(Vec::new());
        }
        let count = count as usize;
        self.check_len(items.len().saturating_mul(count))?;
        let mut out = Vec::with_capacity(items.len() * count);
        for _ in 0..count {
            out.extend_from_slice(items);
        }
        Ok(out)
    }
}

/// Parsed `[start:stop:step]`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SliceBounds {
    pub start: Option<i64>,
    pub stop: Option<i64>,
    pub step: Option<i64>,
}

impl SliceBounds {
    /// Indices selected from a sequence of length `len`.
    pub fn indices(&self, len: usize) -> Result<Vec<usize>, ScriptError> {
        let step = self.step.unwrap_or(1);
        if step == 0 {
            return Err(ScriptError::raise("ValueError", "slice step cannot be zero"));
        }
        let len = len as i64;
        let mut out = Vec::new();
        if step > 0 {
            let clamp = |b: Option<i64>, default: i64| match b {
                None => default,
                Some(b) if b < 0 => (b + len).max(0),
                Some(b) => b.min(len),
            };
            let (mut i, stop) = (clamp(self.start, 0), clamp(self.stop, len));
            while i < stop {
                out.push(i as usize);
                let Some(next) = i.checked_add(step) else {
                    break;
                };
                i = next;
            }
        } else {
            let clamp = |b: Option<i64>, default: i64| match b {
                None => default,
                Some(b) if b < 0 => (b + len).max(-1),
                Some(b) => b.min(len - 1),
            };
            let (mut i, stop) = (clamp(self.start, len - 1), clamp(self.stop, -1));
            while i > stop {
                out.push(i as usize);
                let Some(next) = i.checked_add(step) else {
                    break;
                };
                i = next;
            }
        }
        Ok(out)
    }
}

fn annotate(err: ScriptError, frame: &Frame) -> ScriptError {
    match err {
        ScriptError::Raised(mut exc) if frame.line.get() > 0 => {
            exc.trace.push(TraceFrame {
                line: frame.line.get(),
                function: frame.function.to_string(),
            });
            ScriptError::Raised(exc)
        }
        other => other,
    }
}

fn handler_matches(kind: &Value, exc: &Exception) -> Result<bool, ScriptError> {
    match kind {
        Value::ExceptionType(name) => Ok(exc.is_instance_of(name)),
        Value::Tuple(kinds) => {
            for kind in kinds.iter() {
                if handler_matches(kind, exc)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(ScriptError::raise(
            "TypeError",
            "catching classes that do not inherit from BaseException is not allowed",
        )),
    }
}

fn bind_arguments(func: &Function, args: CallArgs) -> Result<HashMap<String, Value>, ScriptError> {
    let params = func.params();
    let name = &func.name;
    let mut locals = HashMap::with_capacity(params.len());
    let given = args.positional.len();
    let mut positional = args.positional.into_iter();
    let mut var_args = None;
    let mut kw_args: Option<(String, DictMap)> = None;

    for param in params {
        match param.kind {
            ParamKind::Normal if var_args.is_none() => {
                if let Some(value) = positional.next() {
                    locals.insert(param.name.clone(), value);
                }
            }
            ParamKind::Normal => {}
            ParamKind::VarArgs => {
                var_args = Some((param.name.clone(), positional.by_ref().collect::<Vec<_>>()));
            }
            ParamKind::KwArgs => kw_args = Some((param.name.clone(), DictMap::new())),
        }
    }
    if positional.next().is_some() {
        let accepted = params
            .iter()
            .filter(|p| p.kind == ParamKind::Normal)
            .count();
        return Err(ScriptError::raise(
            "TypeError",
            format!("{name}() takes {accepted} positional arguments but {given} were given"),
        ));
    }
    if let Some((param, rest)) = var_args {
        locals.insert(param, Value::tuple(rest));
    }

    for (key, value) in args.keywords {
        let is_param = params
            .iter()
            .any(|p| p.kind == ParamKind::Normal && p.name == key);
        if is_param {
            if locals.contains_key(&key) {
                return Err(ScriptError::raise(
                    "TypeError",
                    format!("{name}() got multiple values for argument '{key}'"),
                ));
            }
            locals.insert(key, value);
        } else if let Some((_, extra)) = kw_args.as_mut() {
            let key_value = Value::str(key.as_str());
            extra.insert(HashKey::Str(Rc::from(key.as_str())), (key_value, value));
        } else {
            return Err(ScriptError::raise(
                "TypeError",
                format!("{name}() got an unexpected keyword argument '{key}'"),
            ));
        }
    }

    let mut missing = Vec::new();
    for (param, default) in params.iter().zip(&func.defaults) {
        if param.kind != ParamKind::Normal || locals.contains_key(&param.name) {
            continue;
        }
        match default {
            Some(value) => {
                locals.insert(param.name.clone(), value.clone());
            }
            None => missing.push(format!("'{}'", param.name)),
        }
    }
    if !missing.is_empty() {
        let noun = if missing.len() == 1 {
            "argument"
        } else {
            "arguments"
        };
        let listed = match missing.split_last() {
            Some((last, rest)) if !rest.is_empty() => format!("{} and {last}", rest.join(", ")),
            _ => missing.join(""),
        };
        return Err(ScriptError::raise(
            "TypeError",
            format!(
                "{name}() missing {} required positional {noun}: {listed}",
                missing.len()
            ),
        ));
    }
    if let Some((param, extra)) = kw_args {
        locals.insert(param, Value::dict(extra));
    }
    Ok(locals)
}

fn get_attr(value: &Value, attr: &str) -> Result<Value, ScriptError> {
    if attr.starts_with("__") {
        return Err(ScriptError::raise(
            "AttributeError",
            format!("attribute '{attr}' is not accessible"),
        ));
    }
    match value {
        Value::Module(module) => builtins::module_attr(module, attr).ok_or_else(|| {
            ScriptError::raise(
                "AttributeError",
                format!("module '{module}' has no attribute '{attr}'"),
            )
        }),
        Value::Exception(exc) if attr == "args" => {
            let args = if exc.message.is_empty() {
                Vec::new()
            } else {
                vec![Value::str(exc.message.as_str())]
            };
            Ok(Value::tuple(args))
        }
        _ => match methods::lookup(value, attr) {
            Some(name) => Ok(Value::Method(Rc::new(super::value::BoundMethod {
                receiver: value.clone(),
                name,
            }))),
            None => Err(ScriptError::raise(
                "AttributeError",
                format!("'{}' object has no attribute '{attr}'", value.type_name()),
            )),
        },
    }
}

/// Insert keeping the first key object for an existing entry.
pub(crate) fn dict_insert(map: &mut DictMap, key: Value, value: Value) -> Result<(), ScriptError> {
    match map.entry(key.hash_key()?) {
        indexmap::map::Entry::Occupied(mut entry) => entry.get_mut().1 = value,
        indexmap::map::Entry::Vacant(entry) => {
            entry.insert((key, value));
        }
    }
    Ok(())
}

pub(crate) fn contains(container: &Value, item: &Value) -> Result<bool, ScriptError> {
    match container {
        Value::Str(haystack) => match item {
            Value::Str(needle) => Ok(haystack.contains(needle.as_ref())),
            other => Err(ScriptError::raise(
                "TypeError",
                format!(
                    "'in <string>' requires string as left operand, not {}",
                    other.type_name()
                ),
            )),
        },
        Value::List(items) => Ok(items.borrow().iter().any(|v| v.py_eq(item))),
        Value::Tuple(items) => Ok(items.iter().any(|v| v.py_eq(item))),
        Value::Dict(map) => Ok(map.borrow().contains_key(&item.hash_key()?)),
        Value::Set(map) => Ok(map.borrow().contains_key(&item.hash_key()?)),
        Value::Range(range) => Ok(match item {
            Value::Float(f) if f.fract() == 0.0 => range.contains(*f as i64),
            other => other.as_int().is_some_and(|i| range.contains(i)),
        }),
        other => Err(ScriptError::raise(
            "TypeError",
            format!("argument of type '{}' is not iterable", other.type_name()),
        )),
    }
}

fn int_index(index: &Value, what: &str) -> Result<i64, ScriptError> {
    index.as_int().ok_or_else(|| {
        ScriptError::raise(
            "TypeError",
            format!(
                "{what} indices must be integers or slices, not {}",
                index.type_name()
            ),
        )
    })
}

pub(crate) fn normalize_index(idx: i64, len: usize) -> Option<usize> {
    let idx = if idx < 0 { idx as i128 + len as i128 } else { idx as i128 };
    (idx >= 0 && idx < len as i128).then_some(idx as usize)
}

fn overflow() -> ScriptError {
    ScriptError::raise("OverflowError", "integer overflow")
}

fn int_op(op: BinOp, a: i64, b: i64) -> Result<Value, ScriptError> {
    let zero = |what: &str| ScriptError::raise("ZeroDivisionError", what.to_string());
    let value = match op {
        BinOp::Add => a.checked_add(b).ok_or_else(overflow)?,
        BinOp::Sub => a.checked_sub(b).ok_or_else(overflow)?,
        BinOp::Mul => a.checked_mul(b).ok_or_else(overflow)?,
        BinOp::Div => {
            if b == 0 {
                return Err(zero("division by zero"));
            }
            return Ok(Value::Float(a as f64 / b as f64));
        }
        BinOp::FloorDiv => {
            if b == 0 {
                return Err(zero("integer division or modulo by zero"));
            }
            let q = a.checked_div(b).ok_or_else(overflow)?;
            if a % b != 0 && ((a < 0) != (b < 0)) {
                q - 1
            } else {
                q
            }
        }
        BinOp::Mod => {
            if b == 0 {
                return Err(zero("integer modulo by zero"));
            }
            let r = a.checked_rem(b).ok_or_else(overflow)?;
            if r != 0 && ((r < 0) != (b < 0)) { r + b } else { r }
        }
        BinOp::Pow => {
            if b < 0 {
                if a == 0 {
                    return Err(zero("0.0 cannot be raised to a negative power"));
                }
                return Ok(Value::Float((a as f64).powf(b as f64)));
            }
            let exp = u32::try_from(b).map_err(|_| overflow())?;
            a.checked_pow(exp).ok_or_else(overflow)?
        }
        BinOp::LShift | BinOp::RShift if b < 0 => {
            return Err(ScriptError::raise("ValueError", "negative shift count"));
        }
        BinOp::LShift => {
            if a == 0 {
                0
            } else if b >= 63 {
                return Err(overflow());
            } else {
                let shifted = a << b;
                if shifted >> b != a {
                    return Err(overflow());
                }
                shifted
            }
        }
        BinOp::RShift => {
            if b >= 64 {
                if a < 0 { -1 } else { 0 }
            } else {
                a >> b
            }
        }
        BinOp::BitAnd => a & b,
        BinOp::BitOr => a | b,
        BinOp::BitXor => a ^ b,
    };
    Ok(Value::Int(value))
}

fn float_op(op: BinOp, a: f64, b: f64) -> Result<Value, ScriptError> {
    let zero = |what: &str| ScriptError::raise("ZeroDivisionError", what.to_string());
    let value = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Err(zero("float division by zero"));
            }
            a / b
        }
        BinOp::FloorDiv => {
            if b == 0.0 {
                return Err(zero("float floor division by zero"));
            }
            (a / b).floor()
        }
        BinOp::Mod => {
            if b == 0.0 {
                return Err(zero("float modulo"));
            }
            let r = a % b;
            if r != 0.0 && ((r < 0.0) != (b < 0.0)) { r + b } else { r }
        }
        BinOp::Pow => {
            if a == 0.0 && b < 0.0 {
                return Err(zero("0.0 cannot be raised to a negative power"));
            }
            if a < 0.0 && b.fract() != 0.0 {
                return Err(ScriptError::raise("ValueError", "math domain error"));
            }
            let result = a.powf(b);
            if result.is_infinite() && a.is_finite() && b.is_finite() {
                return Err(ScriptError::raise("OverflowError", "numerical result out of range"));
            }
            result
        }
        _ => {
            return Err(ScriptError::raise(
                "TypeError",
                format!(
                    "unsupported operand type(s) for {}: 'float' and 'float'",
                    op.symbol()
                ),
            ));
        }
    };
    Ok(Value::Float(value))
}

fn unary_op(op: UnaryOp, operand: &Value) -> Result<Value, ScriptError> {
    let bad = || {
        ScriptError::raise(
            "TypeError",
            format!(
                "bad operand type for unary {}: '{}'",
                match op {
                    UnaryOp::Neg => "-",
                    UnaryOp::Pos => "+",
                    UnaryOp::Invert => "~",
                    UnaryOp::Not => "not",
                },
                operand.type_name()
            ),
        )
    };
    match op {
        UnaryOp::Not => Ok(Value::Bool(!operand.truthy())),
        UnaryOp::Neg => match operand {
            Value::Float(f) => Ok(Value::Float(-f)),
            other => {
                let i = other.as_int().ok_or_else(bad)?;
                Ok(Value::Int(i.checked_neg().ok_or_else(overflow)?))
            }
        },
        UnaryOp::Pos => match operand {
            Value::Float(f) => Ok(Value::Float(*f)),
            other => other.as_int().map(Value::Int).ok_or_else(bad),
        },
        UnaryOp::Invert => operand.as_int().map(|i| Value::Int(!i)).ok_or_else(bad),
    }
}
