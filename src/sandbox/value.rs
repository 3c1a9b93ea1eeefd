//! Runtime values.
//!
//! Values are single-threaded (`Rc`/`RefCell`); they never leave the worker
//! thread that runs an [`Instance`](super::Instance). Results cross back to
//! async code as strings or `serde_json::Value`.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use indexmap::IndexMap;

use super::ast::{FunctionDef, Lambda};
use super::format::format_float;
use super::{Exception, ScriptError};

/// Mutable name bindings of one frame.
pub type Scope = Rc<RefCell<HashMap<String, Value>>>;

/// Insertion-ordered dict storage; the original key is kept for iteration.
pub type DictMap = IndexMap<HashKey, (Value, Value)>;

/// Insertion-ordered set storage.
pub type SetMap = IndexMap<HashKey, Value>;

/// Containers nested deeper than this render as `...`.
const MAX_RENDER_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HashKey {
    None,
    Int(i64),
    Float(u64),
    Str(Rc<str>),
    Tuple(Vec<HashKey>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeValue {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl RangeValue {
    pub fn len(&self) -> usize {
        let span = if self.step > 0 {
            (self.stop as i128 - self.start as i128 + self.step as i128 - 1) / self.step as i128
        } else {
            (self.start as i128 - self.stop as i128 - self.step as i128 - 1) / (-(self.step as i128))
        };
        span.max(0).min(usize::MAX as i128) as usize
    }

    /// Item at `index`, which must be below [`len`](Self::len). Items of a
    /// range always lie between its bounds, so only the intermediate
    /// product needs the wider type.
    pub fn get(&self, index: usize) -> i64 {
        debug_assert!(index < self.len());
        (self.start as i128 + self.step as i128 * index as i128) as i64
    }

    pub fn contains(&self, value: i64) -> bool {
        let in_bounds = if self.step > 0 {
            value >= self.start && value < self.stop
        } else {
            value <= self.start && value > self.stop
        };
        in_bounds && (value as i128 - self.start as i128) % self.step as i128 == 0
    }
}

#[derive(Debug, Clone)]
pub enum FunctionBody {
    Def(Arc<FunctionDef>),
    Lambda(Arc<Lambda>),
}

/// A user-defined function or lambda with its captured scope chain.
#[derive(Debug)]
pub struct Function {
    pub name: Rc<str>,
    pub body: FunctionBody,
    /// Evaluated defaults, aligned with the parameter list.
    pub defaults: Vec<Option<Value>>,
    /// Enclosing function scopes, innermost first. Empty at module level.
    pub enclosing: Rc<Vec<Scope>>,
}

impl Function {
    pub fn params(&self) -> &[super::ast::Param] {
        match &self.body {
            FunctionBody::Def(def) => &def.params,
            FunctionBody::Lambda(lambda) => &lambda.params,
        }
    }
}

/// A method looked up on a builtin value, e.g. `"abc".upper`.
#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    pub name: &'static str,
}

#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    List(Rc<RefCell<Vec<Value>>>),
    Tuple(Rc<Vec<Value>>),
    Dict(Rc<RefCell<DictMap>>),
    Set(Rc<RefCell<SetMap>>),
    Range(RangeValue),
    Function(Rc<Function>),
    /// Builtin function or type, by its static name (`"len"`, `"math.sqrt"`).
    Builtin(&'static str),
    Method(Rc<BoundMethod>),
    Module(&'static str),
    ExceptionType(Rc<str>),
    Exception(Rc<Exception>),
}

impl Value {
    pub fn str(s: impl Into<Rc<str>>) -> Value {
        Value::Str(s.into())
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(Rc::new(items))
    }

    pub fn dict(map: DictMap) -> Value {
        Value::Dict(Rc::new(RefCell::new(map)))
    }

    pub fn set(map: SetMap) -> Value {
        Value::Set(Rc::new(RefCell::new(map)))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Set(_) => "set",
            Value::Range(_) => "range",
            Value::Function(_) => "function",
            Value::Builtin(_) => "builtin_function_or_method",
            Value::Method(_) => "method",
            Value::Module(_) => "module",
            Value::ExceptionType(_) => "type",
            Value::Exception(_) => "exception",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.borrow().is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            Value::Dict(map) => !map.borrow().is_empty(),
            Value::Set(map) => !map.borrow().is_empty(),
            Value::Range(range) => range.len() > 0,
            _ => true,
        }
    }

    /// Integer view of ints and bools.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    /// Float view of any number.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            Value::Bool(b) => Some(*b as i64 as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_) | Value::Bool(_))
    }

    pub fn hash_key(&self) -> Result<HashKey, ScriptError> {
        match self {
            Value::None => Ok(HashKey::None),
            Value::Bool(b) => Ok(HashKey::Int(*b as i64)),
            Value::Int(i) => Ok(HashKey::Int(*i)),
            Value::Float(f) => {
                if f.fract() == 0.0 && f.abs() < 9.2e18 {
                    Ok(HashKey::Int(*f as i64))
                } else {
                    Ok(HashKey::Float(f.to_bits()))
                }
            }
            Value::Str(s) => Ok(HashKey::Str(s.clone())),
            Value::Tuple(items) => items
                .iter()
                .map(Value::hash_key)
                .collect::<Result<Vec<_>, _>>()
                .map(HashKey::Tuple),
            other => Err(ScriptError::raise(
                "TypeError",
                format!("unhashable type: '{}'", other.type_name()),
            )),
        }
    }

    /// Structural equality following the usual numeric tower.
    pub fn py_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (a, b) if a.is_number() && b.is_number() => match (a.as_int(), b.as_int()) {
                (Some(x), Some(y)) => x == y,
                _ => a.as_float() == b.as_float(),
            },
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                Rc::ptr_eq(a, b) || seq_eq(&a.borrow(), &b.borrow())
            }
            (Value::Tuple(a), Value::Tuple(b)) => seq_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len()
                    && a.iter().all(|(key, (_, value))| {
                        b.get(key).is_some_and(|(_, other)| value.py_eq(other))
                    })
            }
            (Value::Set(a), Value::Set(b)) => {
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.keys().all(|key| b.contains_key(key))
            }
            (Value::Range(a), Value::Range(b)) => a == b,
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            (Value::Module(a), Value::Module(b)) => a == b,
            (Value::ExceptionType(a), Value::ExceptionType(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Exception(a), Value::Exception(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Identity for `is`.
    pub fn is_same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => Rc::ptr_eq(a, b) || a == b,
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Tuple(a), Value::Tuple(b)) => Rc::ptr_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => Rc::ptr_eq(a, b),
            (Value::Set(a), Value::Set(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            (Value::Module(a), Value::Module(b)) => a == b,
            (Value::ExceptionType(a), Value::ExceptionType(b)) => a == b,
            (Value::Exception(a), Value::Exception(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Ordering for `<`, `sorted()` and friends. `Ok(None)` means unordered (NaN).
    pub fn py_cmp(&self, other: &Value) -> Result<Option<Ordering>, ScriptError> {
        match (self, other) {
            (a, b) if a.is_number() && b.is_number() => match (a.as_int(), b.as_int()) {
                (Some(x), Some(y)) => Ok(Some(x.cmp(&y))),
                _ => Ok(a.as_float().partial_cmp(&b.as_float())),
            },
            (Value::Str(a), Value::Str(b)) => Ok(Some(a.cmp(b))),
            (Value::List(a), Value::List(b)) => seq_cmp(&a.borrow(), &b.borrow()),
            (Value::Tuple(a), Value::Tuple(b)) => seq_cmp(a, b),
            (Value::Set(a), Value::Set(b)) => {
                let (a, b) = (a.borrow(), b.borrow());
                let a_sub_b = a.keys().all(|k| b.contains_key(k));
                let b_sub_a = b.keys().all(|k| a.contains_key(k));
                Ok(match (a_sub_b, b_sub_a) {
                    (true, true) => Some(Ordering::Equal),
                    (true, false) => Some(Ordering::Less),
                    (false, true) => Some(Ordering::Greater),
                    (false, false) => None,
                })
            }
            (a, b) => Err(ScriptError::raise(
                "TypeError",
                format!(
                    "'<' not supported between instances of '{}' and '{}'",
                    a.type_name(),
                    b.type_name()
                ),
            )),
        }
    }

    /// `str(value)`.
    pub fn py_str(&self) -> String {
        match self {
            Value::Str(s) => s.to_string(),
            Value::Exception(exc) => exc.message.clone(),
            other => other.py_repr(),
        }
    }

    /// `repr(value)`.
    pub fn py_repr(&self) -> String {
        let mut out = String::new();
        self.render(&mut out, 0);
        out
    }

    fn render(&self, out: &mut String, depth: usize) {
        if depth > MAX_RENDER_DEPTH {
            out.push_str("...");
            return;
        }
        match self {
            Value::None => out.push_str("None"),
            Value::Bool(true) => out.push_str("True"),
            Value::Bool(false) => out.push_str("False"),
            Value::Int(i) => out.push_str(&i.to_string()),
            Value::Float(f) => out.push_str(&format_float(*f)),
            Value::Str(s) => out.push_str(&repr_str(s)),
            Value::List(items) => {
                out.push('[');
                render_items(&items.borrow(), out, depth);
                out.push(']');
            }
            Value::Tuple(items) => {
                out.push('(');
                render_items(items, out, depth);
                if items.len() == 1 {
                    out.push(',');
                }
                out.push(')');
            }
            Value::Dict(map) => {
                out.push('{');
                for (i, (key, value)) in map.borrow().values().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    key.render(out, depth + 1);
                    out.push_str(": ");
                    value.render(out, depth + 1);
                }
                out.push('}');
            }
            Value::Set(map) => {
                let map = map.borrow();
                if map.is_empty() {
                    out.push_str("set()");
                    return;
                }
                out.push('{');
                for (i, value) in map.values().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    value.render(out, depth + 1);
                }
                out.push('}');
            }
            Value::Range(r) if r.step == 1 => {
                out.push_str(&format!("range({}, {})", r.start, r.stop));
            }
            Value::Range(r) => {
                out.push_str(&format!("range({}, {}, {})", r.start, r.stop, r.step));
            }
            Value::Function(f) => out.push_str(&format!("<function {}>", f.name)),
            Value::Builtin(name) if super::builtins::is_type(name) => {
                out.push_str(&format!("<class '{name}'>"))
            }
            Value::Builtin(name) => out.push_str(&format!("<built-in function {name}>")),
            Value::Method(m) => out.push_str(&format!(
                "<built-in method {} of {} object>",
                m.name,
                m.receiver.type_name()
            )),
            Value::Module(name) => out.push_str(&format!("<module '{name}'>")),
            Value::ExceptionType(name) => out.push_str(&format!("<class '{name}'>")),
            Value::Exception(exc) => {
                out.push_str(&format!("{}({})", exc.kind, repr_str(&exc.message)))
            }
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Value {
        match value {
            serde_json::Value::Null => Value::None,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::str(s.as_str()),
            serde_json::Value::Array(items) => {
                Value::list(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => {
                let mut dict = DictMap::new();
                for (key, value) in map {
                    let key_value = Value::str(key.as_str());
                    dict.insert(
                        HashKey::Str(Rc::from(key.as_str())),
                        (key_value, Value::from_json(value)),
                    );
                }
                Value::dict(dict)
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        self.to_json_depth(0)
    }

    fn to_json_depth(&self, depth: usize) -> serde_json::Value {
        use serde_json::Value as J;
        if depth > MAX_RENDER_DEPTH {
            return J::Null;
        }
        match self {
            Value::None => J::Null,
            Value::Bool(b) => J::Bool(*b),
            Value::Int(i) => J::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(J::Number)
                .unwrap_or(J::Null),
            Value::Str(s) => J::String(s.to_string()),
            Value::List(items) => J::Array(
                items
                    .borrow()
                    .iter()
                    .map(|v| v.to_json_depth(depth + 1))
                    .collect(),
            ),
            Value::Tuple(items) => {
                J::Array(items.iter().map(|v| v.to_json_depth(depth + 1)).collect())
            }
            Value::Set(map) => J::Array(
                map.borrow()
                    .values()
                    .map(|v| v.to_json_depth(depth + 1))
                    .collect(),
            ),
            Value::Dict(map) => J::Object(
                map.borrow()
                    .values()
                    .map(|(key, value)| (key.py_str(), value.to_json_depth(depth + 1)))
                    .collect(),
            ),
            other => J::String(other.py_repr()),
        }
    }
}

fn seq_eq(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.py_eq(y))
}

fn seq_cmp(a: &[Value], b: &[Value]) -> Result<Option<Ordering>, ScriptError> {
    for (x, y) in a.iter().zip(b) {
        if x.py_eq(y) {
            continue;
        }
        return x.py_cmp(y);
    }
    Ok(Some(a.len().cmp(&b.len())))
}

fn render_items(items: &[Value], out: &mut String, depth: usize) {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        item.render(out, depth + 1);
    }
}

/// Quote a string the way `repr()` does.
pub fn repr_str(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                out.push_str(&format!("\\x{:02x}", c as u32))
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_repr_matches_python() {
        let dict = Value::from_json(&serde_json::json!({"a": [1, 2.5, null, true], "b": "it's"}));
        assert_eq!(dict.py_repr(), r#"{'a': [1, 2.5, None, True], 'b': "it's"}"#);
        assert_eq!(Value::tuple(vec![Value::Int(1)]).py_repr(), "(1,)");
        assert_eq!(Value::set(SetMap::new()).py_repr(), "set()");
        assert_eq!(Value::Float(3.0).py_str(), "3.0");
        assert_eq!(Value::str("a\nb").py_repr(), "'a\\nb'");
        assert_eq!(Value::str("plain").py_str(), "plain");
    }

    #[test]
    fn test_numeric_equality_and_hashing() {
        assert!(Value::Int(1).py_eq(&Value::Float(1.0)));
        assert!(Value::Bool(true).py_eq(&Value::Int(1)));
        assert_eq!(
            Value::Float(2.0).hash_key().unwrap(),
            Value::Int(2).hash_key().unwrap()
        );
        assert!(Value::list(vec![]).hash_key().is_err());
    }

    #[test]
    fn test_ordering() {
        let a = Value::tuple(vec![Value::Int(1), Value::str("b")]);
        let b = Value::tuple(vec![Value::Int(1), Value::str("c")]);
        assert_eq!(a.py_cmp(&b).unwrap(), Some(Ordering::Less));
        assert_eq!(
            Value::Float(f64::NAN).py_cmp(&Value::Int(1)).unwrap(),
            None
        );
        assert!(Value::str("a").py_cmp(&Value::Int(1)).is_err());
    }

    #[test]
    fn test_range_len_and_contains() {
        let r = RangeValue {
            start: 10,
            stop: 0,
            step: -3,
        };
        assert_eq!(r.len(), 4);
        assert!(r.contains(4));
        assert!(!r.contains(5));
        let empty = RangeValue {
            start: 5,
            stop: 5,
            step: 1,
        };
        assert_eq!(empty.len(), 0);
    }

    #[test]
    fn test_range_near_integer_limits() {
        let r = RangeValue {
            start: -i64::MAX,
            stop: i64::MAX,
            step: 1 << 62,
        };
        assert_eq!(r.len(), 4);
        assert_eq!(r.get(3), 4_611_686_018_427_387_905);
        assert!(r.contains(-i64::MAX + (1 << 62)));
        assert!(!r.contains(i64::MAX - 1));

        let down = RangeValue {
            start: i64::MAX,
            stop: i64::MIN,
            step: -(1 << 62),
        };
        assert_eq!(down.len(), 4);
        assert_eq!(down.get(3), -4_611_686_018_427_387_905);
        assert!(down.contains(i64::MAX - (1 << 62)));
    }

    #[test]
    fn test_json_round_trip_preserves_shape() {
        let json = serde_json::json!({"items": [1, "two", {"three": 3.5}], "ok": false});
        assert_eq!(Value::from_json(&json).to_json(), json);
    }
}
