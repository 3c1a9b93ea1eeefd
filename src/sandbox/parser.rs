//! Recursive-descent parser producing [`ast::Module`](super::ast::Module).

use std::sync::Arc;

use super::ScriptError;
use super::ast::*;
use super::lexer::{Tok, Token, tokenize};

/// Deepest expression nesting accepted before parsing gives up.
const MAX_NESTING: usize = 50;

/// Parse a full source file.
pub fn parse_module(source: &str) -> Result<Module, ScriptError> {
    let tokens = tokenize(source)?;
    Parser::new(tokens).module()
}

/// Parse a single expression (used for f-string replacement fields).
pub fn parse_expression(source: &str, line: usize) -> Result<Expr, ScriptError> {
    let mut tokens = tokenize(source.trim()).map_err(|e| relocate(e, line))?;
    for token in &mut tokens {
        token.line = line;
    }
    let mut parser = Parser::new(tokens);
    let expr = parser.testlist()?;
    parser.eat_newlines();
    if !matches!(parser.peek(), Tok::Eof) {
        return Err(parser.error("invalid syntax in f-string expression"));
    }
    Ok(expr)
}

fn relocate(err: ScriptError, line: usize) -> ScriptError {
    match err {
        ScriptError::Syntax { message, .. } => ScriptError::Syntax { line, message },
        other => other,
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    // ── token helpers ───────────────────────────────────────────────────

    fn peek(&self) -> &Tok {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Tok {
        self.tokens
            .get(self.pos + offset)
            .or_else(|| self.tokens.last())
            .map(|t| &t.tok)
            .unwrap_or(&Tok::Eof)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.line)
            .unwrap_or(1)
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn error(&self, message: impl Into<String>) -> ScriptError {
        ScriptError::Syntax {
            line: self.line(),
            message: message.into(),
        }
    }

    fn unexpected(&self) -> ScriptError {
        let found = match self.peek() {
            Tok::Name(n) => format!("name '{n}'"),
            Tok::Keyword(k) => format!("'{k}'"),
            Tok::Op(op) => format!("'{op}'"),
            Tok::Int(_) | Tok::Float(_) => "number".to_string(),
            Tok::Str(_) | Tok::FStr(_) => "string".to_string(),
            Tok::Newline => "end of line".to_string(),
            Tok::Indent => "unexpected indent".to_string(),
            Tok::Dedent => "unindent".to_string(),
            Tok::Eof => "end of file".to_string(),
        };
        self.error(format!("invalid syntax near {found}"))
    }

    fn check_op(&self, op: &str) -> bool {
        matches!(self.peek(), Tok::Op(o) if *o == op)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.check_op(op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> Result<(), ScriptError> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{op}'")))
        }
    }

    fn check_kw(&self, kw: &str) -> bool {
        matches!(self.peek(), Tok::Keyword(k) if *k == kw)
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.check_kw(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_kw(&mut self, kw: &str) -> Result<(), ScriptError> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{kw}'")))
        }
    }

    fn expect_name(&mut self) -> Result<String, ScriptError> {
        match self.peek().clone() {
            Tok::Name(name) => {
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.error("expected a name")),
        }
    }

    fn eat_newlines(&mut self) {
        while matches!(self.peek(), Tok::Newline) {
            self.pos += 1;
        }
    }

    fn enter(&mut self) -> Result<(), ScriptError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(self.error("expression nested too deeply"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    // ── statements ──────────────────────────────────────────────────────

    fn module(&mut self) -> Result<Module, ScriptError> {
        let mut body = Vec::new();
        loop {
            match self.peek() {
                Tok::Eof => break,
                Tok::Newline => self.pos += 1,
                Tok::Indent => return Err(self.error("unexpected indent")),
                _ => body.extend(self.statement()?),
            }
        }
        Ok(Module { body })
    }

    fn statement(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        let line = self.line();
        let kind = match self.peek() {
            Tok::Keyword("def") => StmtKind::FunctionDef(Arc::new(self.function_def()?)),
            Tok::Keyword("if") => {
                self.pos += 1;
                self.if_rest()?
            }
            Tok::Keyword("while") => {
                self.pos += 1;
                let test = self.test()?;
                let body = self.block()?;
                if self.check_kw("else") {
                    return Err(self.error("'while ... else' is not supported"));
                }
                StmtKind::While { test, body }
            }
            Tok::Keyword("for") => {
                self.pos += 1;
                let target = self.target_list()?;
                self.expect_kw("in")?;
                let iter = self.testlist()?;
                let body = self.block()?;
                if self.check_kw("else") {
                    return Err(self.error("'for ... else' is not supported"));
                }
                StmtKind::For { target, iter, body }
            }
            Tok::Keyword("try") => self.try_stmt()?,
            Tok::Keyword(
                kw @ ("class" | "with" | "global" | "nonlocal" | "yield" | "async" | "await"),
            ) => {
                return Err(self.error(format!("'{kw}' is not supported")));
            }
            Tok::Op("@") => return Err(self.error("decorators are not supported")),
            _ => return self.simple_statements(),
        };
        Ok(vec![Stmt { line, kind }])
    }

    fn simple_statements(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        let mut stmts = vec![self.simple_statement()?];
        while self.eat_op(";") {
            if matches!(self.peek(), Tok::Newline | Tok::Eof) {
                break;
            }
            stmts.push(self.simple_statement()?);
        }
        match self.peek() {
            Tok::Newline => {
                self.pos += 1;
                Ok(stmts)
            }
            Tok::Eof | Tok::Dedent => Ok(stmts),
            _ => Err(self.unexpected()),
        }
    }

    fn simple_statement(&mut self) -> Result<Stmt, ScriptError> {
        let line = self.line();
        let kind = match self.peek() {
            Tok::Keyword("pass") => {
                self.pos += 1;
                StmtKind::Pass
            }
            Tok::Keyword("break") => {
                self.pos += 1;
                StmtKind::Break
            }
            Tok::Keyword("continue") => {
                self.pos += 1;
                StmtKind::Continue
            }
            Tok::Keyword("return") => {
                self.pos += 1;
                if self.at_statement_end() {
                    StmtKind::Return(None)
                } else {
                    StmtKind::Return(Some(self.testlist()?))
                }
            }
            Tok::Keyword("raise") => {
                self.pos += 1;
                if self.at_statement_end() {
                    StmtKind::Raise(None)
                } else {
                    let exc = self.test()?;
                    if self.eat_kw("from") {
                        self.test()?;
                    }
                    StmtKind::Raise(Some(exc))
                }
            }
            Tok::Keyword("assert") => {
                self.pos += 1;
                let test = self.test()?;
                let msg = if self.eat_op(",") {
                    Some(self.test()?)
                } else {
                    None
                };
                StmtKind::Assert { test, msg }
            }
            Tok::Keyword("del") => {
                self.pos += 1;
                match self.target_list()? {
                    Target::Tuple(targets) => StmtKind::Delete(targets),
                    target => StmtKind::Delete(vec![target]),
                }
            }
            Tok::Keyword("import") => {
                self.pos += 1;
                let mut names = vec![self.import_alias(true)?];
                while self.eat_op(",") {
                    names.push(self.import_alias(true)?);
                }
                StmtKind::Import(names)
            }
            Tok::Keyword("from") => self.import_from()?,
            Tok::Keyword(kw @ ("global" | "nonlocal" | "yield" | "await")) => {
                return Err(self.error(format!("'{kw}' is not supported")));
            }
            _ => self.expression_statement()?,
        };
        Ok(Stmt { line, kind })
    }

    fn at_statement_end(&self) -> bool {
        matches!(self.peek(), Tok::Newline | Tok::Eof | Tok::Dedent | Tok::Op(";"))
    }

    fn expression_statement(&mut self) -> Result<StmtKind, ScriptError> {
        let first = self.testlist()?;
        if let Tok::Op(op) = self.peek()
            && let Some(bin) = augmented_op(op)
        {
            self.pos += 1;
            let target = self.to_target(first)?;
            if matches!(target, Target::Tuple(_)) {
                return Err(self.error("illegal expression for augmented assignment"));
            }
            let value = self.testlist()?;
            return Ok(StmtKind::AugAssign {
                target,
                op: bin,
                value,
            });
        }
        if self.check_op(":") {
            return Err(self.error("annotated assignments are not supported"));
        }
        if !self.check_op("=") {
            return Ok(StmtKind::Expr(first));
        }

        let mut exprs = vec![first];
        while self.eat_op("=") {
            exprs.push(self.testlist()?);
        }
        let value = exprs.pop().ok_or_else(|| self.unexpected())?;
        let targets = exprs
            .into_iter()
            .map(|e| self.to_target(e))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(StmtKind::Assign { targets, value })
    }

    fn to_target(&self, expr: Expr) -> Result<Target, ScriptError> {
        match expr {
            Expr::Name(name) => Ok(Target::Name(name)),
            Expr::Subscript { value, index } => Ok(Target::Subscript {
                value: *value,
                index: *index,
            }),
            Expr::Attribute { value, attr } => Ok(Target::Attribute {
                value: *value,
                attr,
            }),
            Expr::Tuple(items) | Expr::List(items) => items
                .into_iter()
                .map(|item| self.to_target(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Target::Tuple),
            _ => Err(self.error("cannot assign to expression")),
        }
    }

    fn import_alias(&mut self, dotted: bool) -> Result<Alias, ScriptError> {
        let mut name = self.expect_name()?;
        while dotted && self.eat_op(".") {
            name.push('.');
            name.push_str(&self.expect_name()?);
        }
        let asname = if self.eat_kw("as") {
            Some(self.expect_name()?)
        } else {
            None
        };
        Ok(Alias { name, asname })
    }

    fn import_from(&mut self) -> Result<StmtKind, ScriptError> {
        self.expect_kw("from")?;
        if self.check_op(".") || self.check_op("...") {
            return Err(self.error("relative imports are not supported"));
        }
        let module = self.import_alias(true)?;
        if module.asname.is_some() {
            return Err(self.unexpected());
        }
        self.expect_kw("import")?;
        let mut names = Vec::new();
        if self.eat_op("*") {
            names.push(Alias {
                name: "*".to_string(),
                asname: None,
            });
        } else {
            let parens = self.eat_op("(");
            loop {
                names.push(self.import_alias(false)?);
                if !self.eat_op(",") {
                    break;
                }
                if parens && self.check_op(")") {
                    break;
                }
            }
            if parens {
                self.expect_op(")")?;
            }
        }
        Ok(StmtKind::ImportFrom {
            module: module.name,
            names,
        })
    }

    fn block(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        self.expect_op(":")?;
        if !matches!(self.peek(), Tok::Newline) {
            return self.simple_statements();
        }
        self.pos += 1;
        self.eat_newlines();
        if !matches!(self.peek(), Tok::Indent) {
            return Err(self.error("expected an indented block"));
        }
        self.pos += 1;
        let mut body = Vec::new();
        loop {
            match self.peek() {
                Tok::Dedent => {
                    self.pos += 1;
                    break;
                }
                Tok::Eof => break,
                Tok::Newline => self.pos += 1,
                _ => body.extend(self.statement()?),
            }
        }
        Ok(body)
    }

    fn if_rest(&mut self) -> Result<StmtKind, ScriptError> {
        let test = self.test()?;
        let body = self.block()?;
        let orelse = if self.check_kw("elif") {
            let line = self.line();
            self.pos += 1;
            vec![Stmt {
                line,
                kind: self.if_rest()?,
            }]
        } else if self.eat_kw("else") {
            self.block()?
        } else {
            Vec::new()
        };
        Ok(StmtKind::If { test, body, orelse })
    }

    fn try_stmt(&mut self) -> Result<StmtKind, ScriptError> {
        self.expect_kw("try")?;
        let body = self.block()?;
        let mut handlers = Vec::new();
        while self.check_kw("except") {
            let line = self.line();
            self.pos += 1;
            let (kind, name) = if self.check_op(":") {
                (None, None)
            } else {
                let kind = self.test()?;
                let name = if self.eat_kw("as") {
                    Some(self.expect_name()?)
                } else {
                    None
                };
                (Some(kind), name)
            };
            let body = self.block()?;
            handlers.push(ExceptHandler {
                line,
                kind,
                name,
                body,
            });
        }
        let orelse = if !handlers.is_empty() && self.eat_kw("else") {
            self.block()?
        } else {
            Vec::new()
        };
        let finalbody = if self.eat_kw("finally") {
            self.block()?
        } else {
            Vec::new()
        };
        if handlers.is_empty() && finalbody.is_empty() {
            return Err(self.error("expected 'except' or 'finally' block"));
        }
        Ok(StmtKind::Try {
            body,
            handlers,
            orelse,
            finalbody,
        })
    }

    fn function_def(&mut self) -> Result<FunctionDef, ScriptError> {
        let line = self.line();
        self.expect_kw("def")?;
        let name = self.expect_name()?;
        self.expect_op("(")?;
        let params = self.params(")", true)?;
        self.expect_op(")")?;
        if self.eat_op("->") {
            self.test()?;
        }
        let body = self.block()?;
        Ok(FunctionDef {
            name,
            params,
            body,
            line,
        })
    }

    /// Parameter list up to (not including) `end`.
    fn params(&mut self, end: &str, annotations: bool) -> Result<Vec<Param>, ScriptError> {
        let mut params: Vec<Param> = Vec::new();
        while !self.check_op(end) {
            let kind = if self.eat_op("**") {
                ParamKind::KwArgs
            } else if self.eat_op("*") {
                ParamKind::VarArgs
            } else {
                ParamKind::Normal
            };
            let name = self.expect_name()?;
            if annotations && self.eat_op(":") {
                self.test()?;
            }
            let default = if kind == ParamKind::Normal && self.eat_op("=") {
                Some(self.test()?)
            } else {
                None
            };
            if params.iter().any(|p| p.name == name) {
                return Err(self.error(format!("duplicate argument '{name}'")));
            }
            if default.is_none()
                && kind == ParamKind::Normal
                && params.iter().any(|p| p.default.is_some())
            {
                return Err(self.error("non-default argument follows default argument"));
            }
            params.push(Param {
                name,
                kind,
                default,
            });
            if !self.eat_op(",") {
                break;
            }
        }
        Ok(params)
    }

    /// Targets of `for` / `del`: comma-separated, stopping before `in`.
    fn target_list(&mut self) -> Result<Target, ScriptError> {
        let first = self.bitor()?;
        if !self.check_op(",") {
            return self.to_target(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.check_kw("in") || self.at_statement_end() {
                break;
            }
            items.push(self.bitor()?);
        }
        self.to_target(Expr::Tuple(items))
    }

    // ── expressions ─────────────────────────────────────────────────────

    /// `test (',' test)* [',']`, producing a tuple when a comma appears.
    fn testlist(&mut self) -> Result<Expr, ScriptError> {
        let first = self.test()?;
        if !self.check_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_expression_end() {
                break;
            }
            items.push(self.test()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn at_expression_end(&self) -> bool {
        matches!(
            self.peek(),
            Tok::Newline
                | Tok::Eof
                | Tok::Dedent
                | Tok::Op(")" | "]" | "}" | "=" | ":" | ";")
        ) || matches!(self.peek(), Tok::Op(op) if augmented_op(op).is_some())
    }

    fn test(&mut self) -> Result<Expr, ScriptError> {
        self.enter()?;
        let result = self.test_inner();
        self.leave();
        result
    }

    fn test_inner(&mut self) -> Result<Expr, ScriptError> {
        if self.check_kw("lambda") {
            return self.lambda();
        }
        let body = self.or_test()?;
        if !self.eat_kw("if") {
            return Ok(body);
        }
        let test = self.or_test()?;
        self.expect_kw("else")?;
        let orelse = self.test()?;
        Ok(Expr::IfExp {
            test: Box::new(test),
            body: Box::new(body),
            orelse: Box::new(orelse),
        })
    }

    fn lambda(&mut self) -> Result<Expr, ScriptError> {
        self.expect_kw("lambda")?;
        let params = self.params(":", false)?;
        self.expect_op(":")?;
        let body = self.test()?;
        Ok(Expr::Lambda(Arc::new(Lambda { params, body })))
    }

    fn or_test(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.and_test()?;
        while self.eat_kw("or") {
            let right = self.and_test()?;
            left = Expr::BoolOp {
                op: BoolOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn and_test(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.not_test()?;
        while self.eat_kw("and") {
            let right = self.not_test()?;
            left = Expr::BoolOp {
                op: BoolOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn not_test(&mut self) -> Result<Expr, ScriptError> {
        if !self.eat_kw("not") {
            return self.comparison();
        }
        self.enter()?;
        let operand = self.not_test();
        self.leave();
        Ok(Expr::UnaryOp {
            op: UnaryOp::Not,
            operand: Box::new(operand?),
        })
    }

    fn comparison_op(&mut self) -> Option<CmpOp> {
        let op = match self.peek() {
            Tok::Op("==") => CmpOp::Eq,
            Tok::Op("!=") => CmpOp::NotEq,
            Tok::Op("<") => CmpOp::Lt,
            Tok::Op("<=") => CmpOp::LtE,
            Tok::Op(">") => CmpOp::Gt,
            Tok::Op(">=") => CmpOp::GtE,
            Tok::Keyword("in") => CmpOp::In,
            Tok::Keyword("not") if matches!(self.peek_at(1), Tok::Keyword("in")) => {
                self.pos += 1;
                CmpOp::NotIn
            }
            Tok::Keyword("is") => {
                if matches!(self.peek_at(1), Tok::Keyword("not")) {
                    self.pos += 1;
                    CmpOp::IsNot
                } else {
                    CmpOp::Is
                }
            }
            _ => return None,
        };
        self.pos += 1;
        Some(op)
    }

    fn comparison(&mut self) -> Result<Expr, ScriptError> {
        let left = self.bitor()?;
        let mut ops = Vec::new();
        while let Some(op) = self.comparison_op() {
            ops.push((op, self.bitor()?));
        }
        if ops.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare {
                left: Box::new(left),
                ops,
            })
        }
    }

    fn binary_level(
        &mut self,
        table: &[(&str, BinOp)],
        next: fn(&mut Self) -> Result<Expr, ScriptError>,
    ) -> Result<Expr, ScriptError> {
        let mut left = next(self)?;
        'outer: loop {
            for (symbol, op) in table {
                if self.eat_op(symbol) {
                    let right = next(self)?;
                    left = Expr::BinOp {
                        op: *op,
                        left: Box::new(left),
                        right: Box::new(right),
                    };
                    continue 'outer;
                }
            }
            return Ok(left);
        }
    }

    fn bitor(&mut self) -> Result<Expr, ScriptError> {
        self.binary_level(&[("|", BinOp::BitOr)], Self::bitxor)
    }

    fn bitxor(&mut self) -> Result<Expr, ScriptError> {
        self.binary_level(&[("^", BinOp::BitXor)], Self::bitand)
    }

    fn bitand(&mut self) -> Result<Expr, ScriptError> {
        self.binary_level(&[("&", BinOp::BitAnd)], Self::shift)
    }

    fn shift(&mut self) -> Result<Expr, ScriptError> {
        self.binary_level(
            &[("<<", BinOp::LShift), (">>", BinOp::RShift)],
            Self::arith,
        )
    }

    fn arith(&mut self) -> Result<Expr, ScriptError> {
        self.binary_level(&[("+", BinOp::Add), ("-", BinOp::Sub)], Self::term)
    }

    fn term(&mut self) -> Result<Expr, ScriptError> {
        self.binary_level(
            &[
                ("*", BinOp::Mul),
                ("//", BinOp::FloorDiv),
                ("/", BinOp::Div),
                ("%", BinOp::Mod),
            ],
            Self::factor,
        )
    }

    fn factor(&mut self) -> Result<Expr, ScriptError> {
        let op = match self.peek() {
            Tok::Op("-") => UnaryOp::Neg,
            Tok::Op("+") => UnaryOp::Pos,
            Tok::Op("~") => UnaryOp::Invert,
            _ => return self.power(),
        };
        self.pos += 1;
        self.enter()?;
        let operand = self.factor();
        self.leave();
        let operand = operand?;
        // Fold negative literals so `-5` stays a constant.
        match (op, operand) {
            (UnaryOp::Neg, Expr::Constant(Constant::Int(v))) if v != i64::MIN => {
                Ok(Expr::Constant(Constant::Int(-v)))
            }
            (UnaryOp::Neg, Expr::Constant(Constant::Float(v))) => {
                Ok(Expr::Constant(Constant::Float(-v)))
            }
            (op, operand) => Ok(Expr::UnaryOp {
                op,
                operand: Box::new(operand),
            }),
        }
    }

    fn power(&mut self) -> Result<Expr, ScriptError> {
        let base = self.atom_expr()?;
        if !self.eat_op("**") {
            return Ok(base);
        }
        let exponent = self.factor()?;
        Ok(Expr::BinOp {
            op: BinOp::Pow,
            left: Box::new(base),
            right: Box::new(exponent),
        })
    }

    fn atom_expr(&mut self) -> Result<Expr, ScriptError> {
        let mut expr = self.atom()?;
        loop {
            if self.eat_op("(") {
                let args = self.call_args()?;
                expr = Expr::Call {
                    func: Box::new(expr),
                    args,
                };
            } else if self.eat_op("[") {
                let index = self.subscript_list()?;
                self.expect_op("]")?;
                expr = Expr::Subscript {
                    value: Box::new(expr),
                    index: Box::new(index),
                };
            } else if self.eat_op(".") {
                let attr = self.expect_name()?;
                expr = Expr::Attribute {
                    value: Box::new(expr),
                    attr,
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn call_args(&mut self) -> Result<Vec<Arg>, ScriptError> {
        let mut args = Vec::new();
        while !self.check_op(")") {
            if self.eat_op("**") {
                args.push(Arg::DoubleStar(self.test()?));
            } else if self.eat_op("*") {
                args.push(Arg::Star(self.test()?));
            } else if let Tok::Name(name) = self.peek().clone()
                && matches!(self.peek_at(1), Tok::Op("="))
            {
                self.pos += 2;
                args.push(Arg::Keyword(name, self.test()?));
            } else {
                let value = self.test()?;
                if self.check_kw("for") {
                    let generators = self.comprehension()?;
                    args.push(Arg::Positional(Expr::ListComp {
                        elt: Box::new(value),
                        generators,
                    }));
                } else {
                    args.push(Arg::Positional(value));
                }
            }
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        Ok(args)
    }

    fn subscript_list(&mut self) -> Result<Expr, ScriptError> {
        let first = self.subscript()?;
        if !self.check_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.check_op("]") {
                break;
            }
            items.push(self.subscript()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn subscript(&mut self) -> Result<Expr, ScriptError> {
        let lower = if self.check_op(":") {
            None
        } else {
            let expr = self.test()?;
            if !self.check_op(":") {
                return Ok(expr);
            }
            Some(Box::new(expr))
        };
        self.expect_op(":")?;
        let slice_part = |p: &mut Self| -> Result<Option<Box<Expr>>, ScriptError> {
            if p.check_op(":") || p.check_op("]") || p.check_op(",") {
                Ok(None)
            } else {
                Ok(Some(Box::new(p.test()?)))
            }
        };
        let upper = slice_part(self)?;
        let step = if self.eat_op(":") {
            slice_part(self)?
        } else {
            None
        };
        Ok(Expr::Slice { lower, upper, step })
    }

    fn comprehension(&mut self) -> Result<Vec<Comprehension>, ScriptError> {
        let mut generators = Vec::new();
        while self.eat_kw("for") {
            let target = self.target_list()?;
            self.expect_kw("in")?;
            let iter = self.or_test()?;
            let mut ifs = Vec::new();
            while self.eat_kw("if") {
                ifs.push(self.or_test()?);
            }
            generators.push(Comprehension { target, iter, ifs });
        }
        Ok(generators)
    }

    fn atom(&mut self) -> Result<Expr, ScriptError> {
        let line = self.line();
        match self.advance() {
            Tok::Name(name) => Ok(Expr::Name(name)),
            Tok::Int(v) => Ok(Expr::Constant(Constant::Int(v))),
            Tok::Float(v) => Ok(Expr::Constant(Constant::Float(v))),
            Tok::Keyword("None") => Ok(Expr::Constant(Constant::None)),
            Tok::Keyword("True") => Ok(Expr::Constant(Constant::Bool(true))),
            Tok::Keyword("False") => Ok(Expr::Constant(Constant::Bool(false))),
            Tok::Str(first) => self.string_concat(vec![FStringPart::Literal(first)], line),
            Tok::FStr(raw) => {
                let parts = parse_fstring(&raw, line)?;
                self.string_concat(parts, line)
            }
            Tok::Op("(") => self.paren_atom(),
            Tok::Op("[") => self.list_atom(),
            Tok::Op("{") => self.brace_atom(),
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.unexpected())
            }
        }
    }

    /// Adjacent literals concatenate; the result is a plain constant unless
    /// an f-string took part.
    fn string_concat(
        &mut self,
        mut parts: Vec<FStringPart>,
        line: usize,
    ) -> Result<Expr, ScriptError> {
        loop {
            match self.peek().clone() {
                Tok::Str(s) => {
                    self.pos += 1;
                    parts.push(FStringPart::Literal(s));
                }
                Tok::FStr(raw) => {
                    self.pos += 1;
                    parts.extend(parse_fstring(&raw, line)?);
                }
                _ => break,
            }
        }
        if parts.iter().all(|p| matches!(p, FStringPart::Literal(_))) {
            let text = parts
                .into_iter()
                .map(|p| match p {
                    FStringPart::Literal(s) => s,
                    FStringPart::Expr { .. } => String::new(),
                })
                .collect();
            Ok(Expr::Constant(Constant::Str(text)))
        } else {
            Ok(Expr::FString(parts))
        }
    }

    fn paren_atom(&mut self) -> Result<Expr, ScriptError> {
        if self.eat_op(")") {
            return Ok(Expr::Tuple(Vec::new()));
        }
        let first = self.test()?;
        if self.check_kw("for") {
            let generators = self.comprehension()?;
            self.expect_op(")")?;
            return Ok(Expr::ListComp {
                elt: Box::new(first),
                generators,
            });
        }
        if self.eat_op(")") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.check_op(")") {
                break;
            }
            items.push(self.test()?);
        }
        self.expect_op(")")?;
        Ok(Expr::Tuple(items))
    }

    fn list_atom(&mut self) -> Result<Expr, ScriptError> {
        if self.eat_op("]") {
            return Ok(Expr::List(Vec::new()));
        }
        let first = self.test()?;
        if self.check_kw("for") {
            let generators = self.comprehension()?;
            self.expect_op("]")?;
            return Ok(Expr::ListComp {
                elt: Box::new(first),
                generators,
            });
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.check_op("]") {
                break;
            }
            items.push(self.test()?);
        }
        self.expect_op("]")?;
        Ok(Expr::List(items))
    }

    fn brace_atom(&mut self) -> Result<Expr, ScriptError> {
        if self.eat_op("}") {
            return Ok(Expr::Dict(Vec::new()));
        }
        let first = self.test()?;
        if self.eat_op(":") {
            let value = self.test()?;
            if self.check_kw("for") {
                let generators = self.comprehension()?;
                self.expect_op("}")?;
                return Ok(Expr::DictComp {
                    key: Box::new(first),
                    value: Box::new(value),
                    generators,
                });
            }
            let mut entries = vec![(first, value)];
            while self.eat_op(",") {
                if self.check_op("}") {
                    break;
                }
                let key = self.test()?;
                self.expect_op(":")?;
                entries.push((key, self.test()?));
            }
            self.expect_op("}")?;
            return Ok(Expr::Dict(entries));
        }
        if self.check_kw("for") {
            let generators = self.comprehension()?;
            self.expect_op("}")?;
            return Ok(Expr::SetComp {
                elt: Box::new(first),
                generators,
            });
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.check_op("}") {
                break;
            }
            items.push(self.test()?);
        }
        self.expect_op("}")?;
        Ok(Expr::Set(items))
    }
}

fn augmented_op(op: &str) -> Option<BinOp> {
    Some(match op {
        "+=" => BinOp::Add,
        "-=" => BinOp::Sub,
        "*=" => BinOp::Mul,
        "/=" => BinOp::Div,
        "//=" => BinOp::FloorDiv,
        "%=" => BinOp::Mod,
        "**=" => BinOp::Pow,
        "&=" => BinOp::BitAnd,
        "|=" => BinOp::BitOr,
        "^=" => BinOp::BitXor,
        "<<=" => BinOp::LShift,
        ">>=" => BinOp::RShift,
        _ => return None,
    })
}

/// Split an f-string body into literal text and replacement fields.
fn parse_fstring(raw: &str, line: usize) -> Result<Vec<FStringPart>, ScriptError> {
    let syntax = |message: &str| ScriptError::Syntax {
        line,
        message: format!("f-string: {message}"),
    };
    let mut parts = Vec::new();
    let mut literal = String::new();
    let chars: Vec<char> = raw.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '{' if chars.get(i + 1) == Some(&'{') => {
                literal.push('{');
                i += 2;
            }
            '}' if chars.get(i + 1) == Some(&'}') => {
                literal.push('}');
                i += 2;
            }
            '}' => return Err(syntax("single '}' is not allowed")),
            '{' => {
                if !literal.is_empty() {
                    parts.push(FStringPart::Literal(std::mem::take(&mut literal)));
                }
                i += 1;
                let start = i;
                let mut nesting = 0usize;
                let mut in_quote: Option<char> = None;
                let mut conversion_at = None;
                let mut spec_at = None;
                while i < chars.len() {
                    let c = chars[i];
                    if let Some(q) = in_quote {
                        if c == q {
                            in_quote = None;
                        }
                    } else {
                        match c {
                            '\'' | '"' => in_quote = Some(c),
                            '(' | '[' | '{' => nesting += 1,
                            ')' | ']' => nesting = nesting.saturating_sub(1),
                            '}' if nesting > 0 => nesting -= 1,
                            '}' => break,
                            '!' if nesting == 0
                                && spec_at.is_none()
                                && chars.get(i + 1) != Some(&'=') =>
                            {
                                conversion_at = Some(i)
                            }
                            ':' if nesting == 0 && spec_at.is_none() => spec_at = Some(i),
                            _ => {}
                        }
                    }
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(syntax("expecting '}'"));
                }
                let end = i;
                let expr_end = conversion_at.or(spec_at).unwrap_or(end);
                let expr_src: String = chars[start..expr_end].iter().collect();
                if expr_src.trim().is_empty() {
                    return Err(syntax("empty expression not allowed"));
                }
                let conversion = match conversion_at {
                    Some(at) => match chars.get(at + 1) {
                        Some(c @ ('r' | 's' | 'a')) => Some(*c),
                        _ => return Err(syntax("invalid conversion character")),
                    },
                    None => None,
                };
                let spec = spec_at.map(|at| chars[at + 1..end].iter().collect::<String>());
                parts.push(FStringPart::Expr {
                    expr: parse_expression(&expr_src, line)?,
                    conversion,
                    spec,
                });
                i = end + 1;
            }
            c => {
                literal.push(c);
                i += 1;
            }
        }
    }
    if !literal.is_empty() {
        parts.push(FStringPart::Literal(literal));
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(source: &str) -> Module {
        parse_module(source).unwrap()
    }

    fn expr(source: &str) -> Expr {
        parse_expression(source, 1).unwrap()
    }

    #[test]
    fn test_function_def_with_defaults() {
        let module = parse("def greet(name, punct='!'):\n    return 'hi ' + name + punct\n");
        assert_eq!(module.top_level_functions(), vec!["greet"]);
        let StmtKind::FunctionDef(def) = &module.body[0].kind else {
            panic!("expected def");
        };
        assert_eq!(def.params.len(), 2);
        assert_eq!(
            def.params[1].default,
            Some(Expr::Constant(Constant::Str("!".into())))
        );
    }

    #[test]
    fn test_precedence() {
        assert_eq!(
            expr("1 + 2 * 3"),
            Expr::BinOp {
                op: BinOp::Add,
                left: Box::new(Expr::Constant(Constant::Int(1))),
                right: Box::new(Expr::BinOp {
                    op: BinOp::Mul,
                    left: Box::new(Expr::Constant(Constant::Int(2))),
                    right: Box::new(Expr::Constant(Constant::Int(3))),
                }),
            }
        );
        // Unary minus binds looser than **.
        assert_eq!(
            expr("-2 ** 2"),
            Expr::UnaryOp {
                op: UnaryOp::Neg,
                operand: Box::new(Expr::BinOp {
                    op: BinOp::Pow,
                    left: Box::new(Expr::Constant(Constant::Int(2))),
                    right: Box::new(Expr::Constant(Constant::Int(2))),
                }),
            }
        );
    }

    #[test]
    fn test_chained_comparison_and_membership() {
        let Expr::Compare { ops, .. } = expr("0 <= x < 10") else {
            panic!("expected comparison");
        };
        assert_eq!(ops.len(), 2);
        let Expr::Compare { ops, .. } = expr("a not in b") else {
            panic!("expected comparison");
        };
        assert_eq!(ops[0].0, CmpOp::NotIn);
        let Expr::Compare { ops, .. } = expr("a is not None") else {
            panic!("expected comparison");
        };
        assert_eq!(ops[0].0, CmpOp::IsNot);
    }

    #[test]
    fn test_slices_and_calls() {
        assert!(matches!(
            expr("text[::-1]"),
            Expr::Subscript { index, .. } if matches!(*index, Expr::Slice { lower: None, upper: None, step: Some(_) })
        ));
        let Expr::Call { args, .. } = expr("sorted(xs, key=lambda x: -x, reverse=True)") else {
            panic!("expected call");
        };
        assert!(matches!(&args[1], Arg::Keyword(name, Expr::Lambda(_)) if name == "key"));
        assert!(matches!(&args[2], Arg::Keyword(name, _) if name == "reverse"));
    }

    #[test]
    fn test_comprehensions() {
        assert!(matches!(
            expr("[x * 2 for x in xs if x > 0]"),
            Expr::ListComp { generators, .. } if generators.len() == 1 && generators[0].ifs.len() == 1
        ));
        assert!(matches!(expr("{k: v for k, v in d.items()}"), Expr::DictComp { .. }));
        assert!(matches!(expr("{x for x in xs}"), Expr::SetComp { .. }));
        assert!(matches!(expr("sum(x for x in xs)"), Expr::Call { .. }));
    }

    #[test]
    fn test_fstring_parts() {
        let Expr::FString(parts) = expr("f'{name!r} is {age:>3} {{ok}}'") else {
            panic!("expected f-string");
        };
        assert_eq!(
            parts,
            vec![
                FStringPart::Expr {
                    expr: Expr::Name("name".into()),
                    conversion: Some('r'),
                    spec: None,
                },
                FStringPart::Literal(" is ".into()),
                FStringPart::Expr {
                    expr: Expr::Name("age".into()),
                    conversion: None,
                    spec: Some(">3".into()),
                },
                FStringPart::Literal(" {ok}".into()),
            ]
        );
    }

    #[test]
    fn test_statements() {
        let module = parse(
            "import math as m, json\n\
             from string import ascii_lowercase\n\
             a, b = 1, 2\n\
             a += 1\n\
             for i, ch in enumerate('ab'):\n    pass\n\
             while a < 10:\n    a += 1\n    if a == 5: break\n\
             try:\n    x = 1 / 0\nexcept ZeroDivisionError as e:\n    x = 0\nelse:\n    pass\nfinally:\n    y = 1\n\
             if a:\n    pass\nelif b:\n    pass\nelse:\n    pass\n\
             del a\n\
             assert b, 'msg'\n",
        );
        let kinds: Vec<&str> = module
            .body
            .iter()
            .map(|s| match &s.kind {
                StmtKind::Import(_) => "import",
                StmtKind::ImportFrom { .. } => "from",
                StmtKind::Assign { .. } => "assign",
                StmtKind::AugAssign { .. } => "aug",
                StmtKind::For { .. } => "for",
                StmtKind::While { .. } => "while",
                StmtKind::Try { .. } => "try",
                StmtKind::If { .. } => "if",
                StmtKind::Delete(_) => "del",
                StmtKind::Assert { .. } => "assert",
                _ => "other",
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                "import", "from", "assign", "aug", "for", "while", "try", "if", "del", "assert"
            ]
        );
    }

    #[test]
    fn test_syntax_errors_carry_line() {
        let err = parse_module("def f(:\n    pass\n").unwrap_err();
        assert!(matches!(err, ScriptError::Syntax { line: 1, .. }));
        let err = parse_module("x = 1\ny = = 2\n").unwrap_err();
        assert!(matches!(err, ScriptError::Syntax { line: 2, .. }));
        assert!(parse_module("class A:\n    pass\n").is_err());
        assert!(parse_module("def f():\nreturn 1\n").is_err());
        assert!(parse_module("f() = 3\n").is_err());
    }

    #[test]
    fn test_deep_nesting_rejected() {
        let source = format!("x = {}1{}\n", "(".repeat(200), ")".repeat(200));
        assert!(parse_module(&source).is_err());
    }
}
