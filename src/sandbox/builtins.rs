//! Global builtins and importable modules.

use std::cmp::Ordering;
use std::rc::Rc;
use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use super::format::{format_float, format_value};
use super::interpreter::{CallArgs, Interpreter, dict_insert};
use super::value::{DictMap, RangeValue, SetMap, Value};
use super::{EXCEPTION_KINDS, HostAccess, ScriptError};

/// Globally visible builtin names. Type names double as constructors.
const FUNCTIONS: &[&str] = &[
    "abs", "all", "any", "bin", "bool", "callable", "chr", "dict", "divmod", "enumerate", "filter",
    "float", "format", "hex", "int", "isinstance", "len", "list", "map", "max", "min", "oct",
    "ord", "pow", "print", "range", "repr", "reversed", "round", "set", "sorted", "str", "sum",
    "tuple", "type", "zip", "HookResult",
];

const MODULE_FUNCTIONS: &[&str] = &[
    "math.sqrt", "math.floor", "math.ceil", "math.trunc", "math.fabs", "math.pow", "math.exp",
    "math.log", "math.log2", "math.log10", "math.sin", "math.cos", "math.tan", "math.asin",
    "math.acos", "math.atan", "math.atan2", "math.hypot", "math.isnan", "math.isinf",
    "math.isfinite", "math.degrees", "math.radians", "math.gcd", "math.factorial",
    "math.isclose", "math.copysign", "math.prod", "math.fsum", "json.dumps", "json.loads",
    "time.time", "time.monotonic", "os.getenv",
];

pub(super) fn is_type(name: &str) -> bool {
    matches!(
        name,
        "bool"
            | "dict"
            | "float"
            | "int"
            | "list"
            | "set"
            | "str"
            | "tuple"
            | "range"
            | "type"
            | "NoneType"
            | "function"
            | "builtin_function_or_method"
            | "method"
            | "module"
            | "exception"
    )
}

/// Resolve a name that is not bound in any scope.
pub(super) fn global(name: &str) -> Option<Value> {
    if let Some(func) = FUNCTIONS.iter().find(|f| **f == name) {
        return Some(Value::Builtin(*func));
    }
    EXCEPTION_KINDS
        .iter()
        .find(|k| **k == name)
        .map(|kind| Value::ExceptionType(Rc::from(*kind)))
}

pub(super) fn import(name: &str, host: HostAccess) -> Result<Value, ScriptError> {
    match name {
        "math" => Ok(Value::Module("math")),
        "json" => Ok(Value::Module("json")),
        "string" => Ok(Value::Module("string")),
        "time" if host.clock => Ok(Value::Module("time")),
        "os" if host.env => Ok(Value::Module("os")),
        "time" | "os" => Err(ScriptError::raise(
            "ImportError",
            format!("module '{name}' is not available in the sandbox"),
        )),
        _ => Err(ScriptError::raise(
            "ImportError",
            format!("No module named '{name}'"),
        )),
    }
}

pub(super) fn module_attr(module: &str, attr: &str) -> Option<Value> {
    let constant = match (module, attr) {
        ("math", "pi") => Some(Value::Float(std::f64::consts::PI)),
        ("math", "e") => Some(Value::Float(std::f64::consts::E)),
        ("math", "tau") => Some(Value::Float(std::f64::consts::TAU)),
        ("math", "inf") => Some(Value::Float(f64::INFINITY)),
        ("math", "nan") => Some(Value::Float(f64::NAN)),
        ("string", "ascii_lowercase") => Some(Value::str("abcdefghijklmnopqrstuvwxyz")),
        ("string", "ascii_uppercase") => Some(Value::str("ABCDEFGHIJKLMNOPQRSTUVWXYZ")),
        ("string", "ascii_letters") => Some(Value::str(
            "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ",
        )),
        ("string", "digits") => Some(Value::str("0123456789")),
        ("string", "hexdigits") => Some(Value::str("0123456789abcdefABCDEF")),
        ("string", "octdigits") => Some(Value::str("01234567")),
        ("string", "punctuation") => Some(Value::str("!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~")),
        ("string", "whitespace") => Some(Value::str(" \t\n\r\x0b\x0c")),
        _ => None,
    };
    if constant.is_some() {
        return constant;
    }
    MODULE_FUNCTIONS
        .iter()
        .find(|full| {
            full.split_once('.')
                .is_some_and(|(m, f)| m == module && f == attr)
        })
        .map(|full| Value::Builtin(*full))
}

fn type_error(message: impl Into<String>) -> ScriptError {
    ScriptError::raise("TypeError", message)
}

fn value_error(message: impl Into<String>) -> ScriptError {
    ScriptError::raise("ValueError", message)
}

fn expect_int(value: &Value, func: &str) -> Result<i64, ScriptError> {
    value.as_int().ok_or_else(|| {
        type_error(format!(
            "{func}() argument must be int, not {}",
            value.type_name()
        ))
    })
}

fn expect_float(value: &Value, func: &str) -> Result<f64, ScriptError> {
    value.as_float().ok_or_else(|| {
        type_error(format!(
            "{func}() argument must be a real number, not {}",
            value.type_name()
        ))
    })
}

fn expect_str<'a>(value: &'a Value, func: &str) -> Result<&'a str, ScriptError> {
    value.as_str().ok_or_else(|| {
        type_error(format!(
            "{func}() argument must be str, not {}",
            value.type_name()
        ))
    })
}

fn first(args: &CallArgs) -> Value {
    args.arg(0).cloned().unwrap_or(Value::None)
}

pub(super) fn call(
    interp: &mut Interpreter,
    name: &'static str,
    mut args: CallArgs,
) -> Result<Value, ScriptError> {
    if let Some((module, func)) = name.split_once('.') {
        return call_module(interp, module, func, args);
    }
    match name {
        "abs" => {
            args.expect(name, 1, 1)?;
            match first(&args) {
                Value::Float(f) => Ok(Value::Float(f.abs())),
                other => {
                    let i = expect_int(&other, name)?;
                    i.checked_abs()
                        .map(Value::Int)
                        .ok_or_else(|| ScriptError::raise("OverflowError", "integer overflow"))
                }
            }
        }
        "all" | "any" => {
            args.expect(name, 1, 1)?;
            let items = interp.iterate(&first(&args))?;
            let want = name == "any";
            Ok(Value::Bool(if want {
                items.iter().any(Value::truthy)
            } else {
                items.iter().all(Value::truthy)
            }))
        }
        "bin" | "hex" | "oct" => {
            args.expect(name, 1, 1)?;
            let i = expect_int(&first(&args), name)?;
            let sign = if i < 0 { "-" } else { "" };
            let magnitude = i.unsigned_abs();
            Ok(Value::str(match name {
                "bin" => format!("{sign}0b{magnitude:b}"),
                "hex" => format!("{sign}0x{magnitude:x}"),
                _ => format!("{sign}0o{magnitude:o}"),
            }))
        }
        "bool" => {
            args.expect(name, 0, 1)?;
            Ok(Value::Bool(args.arg(0).is_some_and(Value::truthy)))
        }
        "callable" => {
            args.expect(name, 1, 1)?;
            Ok(Value::Bool(matches!(
                first(&args),
                Value::Function(_) | Value::Builtin(_) | Value::Method(_) | Value::ExceptionType(_)
            )))
        }
        "chr" => {
            args.expect(name, 1, 1)?;
            let code = expect_int(&first(&args), name)?;
            u32::try_from(code)
                .ok()
                .and_then(char::from_u32)
                .map(|c| Value::str(c.to_string()))
                .ok_or_else(|| value_error("chr() arg not in range(0x110000)"))
        }
        "dict" => {
            let keywords = std::mem::take(&mut args.keywords);
            args.expect(name, 0, 1)?;
            let mut map = DictMap::new();
            if let Some(source) = args.arg(0) {
                dict_update(interp, &mut map, source)?;
            }
            for (key, value) in keywords {
                dict_insert(&mut map, Value::str(key), value)?;
            }
            Ok(Value::dict(map))
        }
        "divmod" => {
            args.expect(name, 2, 2)?;
            let (a, b) = (&args.positional[0], &args.positional[1]);
            let q = interp.binary_op(super::ast::BinOp::FloorDiv, a, b)?;
            let r = interp.binary_op(super::ast::BinOp::Mod, a, b)?;
            Ok(Value::tuple(vec![q, r]))
        }
        "enumerate" => {
            let start = args.keyword("start");
            args.expect(name, 1, 2)?;
            let start = match start.or_else(|| args.arg(1).cloned()) {
                Some(v) => expect_int(&v, name)?,
                None => 0,
            };
            let items = interp.iterate(&first(&args))?;
            Ok(Value::list(
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, item)| Value::tuple(vec![Value::Int(start + i as i64), item]))
                    .collect(),
            ))
        }
        "filter" => {
            args.expect(name, 2, 2)?;
            let func = args.positional[0].clone();
            let mut out = Vec::new();
            for item in interp.iterate(&args.positional[1])? {
                interp.tick()?;
                let keep = match &func {
                    Value::None => item.truthy(),
                    f => interp.call_value(f, CallArgs::new(vec![item.clone()]))?.truthy(),
                };
                if keep {
                    out.push(item);
                }
            }
            Ok(Value::list(out))
        }
        "float" => {
            args.expect(name, 0, 1)?;
            match args.arg(0) {
                None => Ok(Value::Float(0.0)),
                Some(Value::Str(s)) => parse_float(s).map(Value::Float),
                Some(other) => expect_float(other, name).map(Value::Float),
            }
        }
        "format" => {
            args.expect(name, 1, 2)?;
            let spec = match args.arg(1) {
                Some(spec) => expect_str(spec, name)?.to_string(),
                None => String::new(),
            };
            Ok(Value::str(format_value(&first(&args), &spec)?))
        }
        "int" => {
            let base = args.keyword("base");
            args.expect(name, 0, 2)?;
            let base = base.or_else(|| args.arg(1).cloned());
            match (args.arg(0), base) {
                (None, _) => Ok(Value::Int(0)),
                (Some(Value::Str(s)), base) => {
                    let base = match base {
                        Some(b) => expect_int(&b, name)?,
                        None => 10,
                    };
                    parse_int(s, base).map(Value::Int)
                }
                (Some(_), Some(_)) => Err(type_error("int() can't convert non-string with explicit base")),
                (Some(Value::Float(f)), None) => float_to_int(*f).map(Value::Int),
                (Some(other), None) => expect_int(other, name).map(Value::Int),
            }
        }
        "isinstance" => {
            args.expect(name, 2, 2)?;
            Ok(Value::Bool(is_instance(&args.positional[0], &args.positional[1])?))
        }
        "len" => {
            args.expect(name, 1, 1)?;
            let len = match &args.positional[0] {
                Value::Str(s) => s.chars().count(),
                Value::List(items) => items.borrow().len(),
                Value::Tuple(items) => items.len(),
                Value::Dict(map) => map.borrow().len(),
                Value::Set(map) => map.borrow().len(),
                Value::Range(range) => range.len(),
                other => {
                    return Err(type_error(format!(
                        "object of type '{}' has no len()",
                        other.type_name()
                    )));
                }
            };
            Ok(Value::Int(len as i64))
        }
        "list" | "tuple" => {
            args.expect(name, 0, 1)?;
            let items = match args.arg(0) {
                Some(source) => interp.iterate(source)?,
                None => Vec::new(),
            };
            Ok(if name == "list" {
                Value::list(items)
            } else {
                Value::tuple(items)
            })
        }
        "set" => {
            args.expect(name, 0, 1)?;
            let mut set = SetMap::new();
            if let Some(source) = args.arg(0) {
                for item in interp.iterate(source)? {
                    set.insert(item.hash_key()?, item);
                }
            }
            Ok(Value::set(set))
        }
        "map" => {
            args.expect(name, 2, usize::MAX)?;
            let func = args.positional[0].clone();
            let columns = args.positional[1..]
                .iter()
                .map(|source| interp.iterate(source))
                .collect::<Result<Vec<_>, _>>()?;
            let len = columns.iter().map(Vec::len).min().unwrap_or(0);
            let mut out = Vec::with_capacity(len);
            for i in 0..len {
                interp.tick()?;
                let row = columns.iter().map(|column| column[i].clone()).collect();
                out.push(interp.call_value(&func, CallArgs::new(row))?);
            }
            Ok(Value::list(out))
        }
        "max" | "min" => extremum(interp, name, args),
        "ord" => {
            args.expect(name, 1, 1)?;
            let s = expect_str(&args.positional[0], name)?;
            let mut chars = s.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Ok(Value::Int(c as i64)),
                _ => Err(type_error(format!(
                    "ord() expected a character, but string of length {} found",
                    s.chars().count()
                ))),
            }
        }
        "pow" => {
            let modulus = args.keyword("mod");
            args.expect(name, 2, 3)?;
            let modulus = modulus.or_else(|| args.arg(2).cloned());
            match modulus {
                None | Some(Value::None) => interp.binary_op(
                    super::ast::BinOp::Pow,
                    &args.positional[0],
                    &args.positional[1],
                ),
                Some(m) => {
                    let base = expect_int(&args.positional[0], name)?;
                    let exp = expect_int(&args.positional[1], name)?;
                    let m = expect_int(&m, name)?;
                    mod_pow(base, exp, m).map(Value::Int)
                }
            }
        }
        "print" => {
            let sep = args.keyword("sep");
            let end = args.keyword("end");
            args.expect(name, 0, usize::MAX)?;
            let sep = sep.map(|s| s.py_str()).unwrap_or_else(|| " ".to_string());
            let end = end.map(|s| s.py_str()).unwrap_or_default();
            let line = args
                .positional
                .iter()
                .map(Value::py_str)
                .collect::<Vec<_>>()
                .join(&sep);
            tracing::debug!(target: "toolforge::sandbox", output = %format!("{line}{end}"), "script print");
            Ok(Value::None)
        }
        "range" => {
            args.expect(name, 1, 3)?;
            let ints = args
                .positional
                .iter()
                .map(|v| expect_int(v, name))
                .collect::<Result<Vec<_>, _>>()?;
            let (start, stop, step) = match ints.as_slice() {
                [stop] => (0, *stop, 1),
                [start, stop] => (*start, *stop, 1),
                [start, stop, step] => (*start, *stop, *step),
                _ => unreachable!("arity checked above"),
            };
            if step == 0 {
                return Err(value_error("range() arg 3 must not be zero"));
            }
            Ok(Value::Range(RangeValue { start, stop, step }))
        }
        "repr" => {
            args.expect(name, 1, 1)?;
            Ok(Value::str(args.positional[0].py_repr()))
        }
        "reversed" => {
            args.expect(name, 1, 1)?;
            let source = &args.positional[0];
            if !matches!(
                source,
                Value::List(_) | Value::Tuple(_) | Value::Str(_) | Value::Range(_) | Value::Dict(_)
            ) {
                return Err(type_error(format!(
                    "'{}' object is not reversible",
                    source.type_name()
                )));
            }
            let mut items = interp.iterate(source)?;
            items.reverse();
            Ok(Value::list(items))
        }
        "round" => {
            let ndigits = args.keyword("ndigits");
            args.expect(name, 1, 2)?;
            let ndigits = ndigits.or_else(|| args.arg(1).cloned());
            round(&args.positional[0], ndigits)
        }
        "sorted" => {
            let key = args.keyword("key");
            let reverse = args.keyword("reverse").is_some_and(|v| v.truthy());
            args.expect(name, 1, 1)?;
            let mut items = interp.iterate(&args.positional[0])?;
            sort_values(interp, &mut items, key.as_ref(), reverse)?;
            Ok(Value::list(items))
        }
        "str" => {
            args.expect(name, 0, 1)?;
            Ok(Value::str(args.arg(0).map(Value::py_str).unwrap_or_default()))
        }
        "sum" => {
            let start = args.keyword("start");
            args.expect(name, 1, 2)?;
            let mut total = start
                .or_else(|| args.arg(1).cloned())
                .unwrap_or(Value::Int(0));
            if matches!(total, Value::Str(_)) {
                return Err(type_error(
                    "sum() can't sum strings [use ''.join(seq) instead]",
                ));
            }
            for item in interp.iterate(&args.positional[0])? {
                interp.tick()?;
                total = interp.binary_op(super::ast::BinOp::Add, &total, &item)?;
            }
            Ok(total)
        }
        "type" => {
            args.expect(name, 1, 1)?;
            Ok(match &args.positional[0] {
                Value::Exception(exc) => Value::ExceptionType(Rc::from(exc.kind.as_str())),
                other => Value::Builtin(other.type_name()),
            })
        }
        "zip" => {
            args.expect(name, 0, usize::MAX)?;
            let columns = args
                .positional
                .iter()
                .map(|source| interp.iterate(source))
                .collect::<Result<Vec<_>, _>>()?;
            let len = columns.iter().map(Vec::len).min().unwrap_or(0);
            Ok(Value::list(
                (0..len)
                    .map(|i| Value::tuple(columns.iter().map(|c| c[i].clone()).collect()))
                    .collect(),
            ))
        }
        "HookResult" => {
            let blocked = args.keyword("blocked");
            let message = args.keyword("message");
            args.expect(name, 0, 2)?;
            let blocked = blocked
                .or_else(|| args.arg(0).cloned())
                .is_some_and(|v| v.truthy());
            let message = message
                .or_else(|| args.arg(1).cloned())
                .map(|v| v.py_str())
                .unwrap_or_default();
            let mut map = DictMap::new();
            dict_insert(&mut map, Value::str("blocked"), Value::Bool(blocked))?;
            dict_insert(&mut map, Value::str("message"), Value::str(message))?;
            Ok(Value::dict(map))
        }
        other => Err(type_error(format!("cannot create '{other}' instances"))),
    }
}

pub(super) fn dict_update(interp: &Interpreter, map: &mut DictMap, source: &Value) -> Result<(), ScriptError> {
    if let Value::Dict(other) = source {
        for (key, value) in other.borrow().values() {
            dict_insert(map, key.clone(), value.clone())?;
        }
        return Ok(());
    }
    for (i, pair) in interp.iterate(source)?.into_iter().enumerate() {
        let items = interp.iterate(&pair)?;
        let [key, value]: [Value; 2] = items.try_into().map_err(|items: Vec<Value>| {
            value_error(format!(
                "dictionary update sequence element #{i} has length {}; 2 is required",
                items.len()
            ))
        })?;
        dict_insert(map, key, value)?;
    }
    interp.check_len(map.len())
}

fn extremum(interp: &mut Interpreter, name: &str, mut args: CallArgs) -> Result<Value, ScriptError> {
    let key = args.keyword("key").filter(|k| !matches!(k, Value::None));
    let default = args.keyword("default");
    args.expect(name, 1, usize::MAX)?;
    let items = if args.positional.len() == 1 {
        interp.iterate(&args.positional[0])?
    } else {
        args.positional
    };
    let want = if name == "max" {
        Ordering::Greater
    } else {
        Ordering::Less
    };
    let mut best: Option<(Value, Value)> = None;
    for item in items {
        let rank = match &key {
            Some(key) => interp.call_value(key, CallArgs::new(vec![item.clone()]))?,
            None => item.clone(),
        };
        let replace = match &best {
            None => true,
            Some((best_rank, _)) => rank.py_cmp(best_rank)? == Some(want),
        };
        if replace {
            best = Some((rank, item));
        }
    }
    match (best, default) {
        (Some((_, item)), _) => Ok(item),
        (None, Some(default)) => Ok(default),
        (None, None) => Err(value_error(format!("{name}() arg is an empty sequence"))),
    }
}

/// Stable sort with an optional key function. Comparison errors surface as
/// `TypeError`; unordered pairs (NaN) compare equal.
pub(super) fn sort_values(
    interp: &mut Interpreter,
    items: &mut Vec<Value>,
    key: Option<&Value>,
    reverse: bool,
) -> Result<(), ScriptError> {
    let keys: Vec<Value> = match key {
        Some(func) if !matches!(func, Value::None) => items
            .iter()
            .map(|item| interp.call_value(func, CallArgs::new(vec![item.clone()])))
            .collect::<Result<_, _>>()?,
        _ => items.clone(),
    };
    let mut order: Vec<usize> = (0..items.len()).collect();
    merge_sort(&mut order, &mut |a, b| {
        let ordering = keys[a].py_cmp(&keys[b])?.unwrap_or(Ordering::Equal);
        Ok(if reverse { ordering.reverse() } else { ordering })
    })?;
    let sorted = order.into_iter().map(|i| items[i].clone()).collect();
    *items = sorted;
    Ok(())
}

/// Bottom-up merge sort over indices with a fallible comparator.
fn merge_sort(
    order: &mut Vec<usize>,
    cmp: &mut dyn FnMut(usize, usize) -> Result<Ordering, ScriptError>,
) -> Result<(), ScriptError> {
    let len = order.len();
    let mut buffer = order.clone();
    let mut width = 1;
    while width < len {
        let mut start = 0;
        while start < len {
            let mid = (start + width).min(len);
            let end = (start + 2 * width).min(len);
            let (mut left, mut right, mut out) = (start, mid, start);
            while left < mid && right < end {
                if cmp(order[right], order[left])? == Ordering::Less {
                    buffer[out] = order[right];
                    right += 1;
                } else {
                    buffer[out] = order[left];
                    left += 1;
                }
                out += 1;
            }
            buffer[out..out + (mid - left)].copy_from_slice(&order[left..mid]);
            out += mid - left;
            buffer[out..out + (end - right)].copy_from_slice(&order[right..end]);
            start = end;
        }
        std::mem::swap(order, &mut buffer);
        width *= 2;
    }
    Ok(())
}

fn is_instance(value: &Value, class: &Value) -> Result<bool, ScriptError> {
    match class {
        Value::Builtin(type_name) if is_type(type_name) => Ok(match *type_name {
            "int" => matches!(value, Value::Int(_) | Value::Bool(_)),
            other => value.type_name() == other,
        }),
        Value::ExceptionType(kind) => Ok(matches!(value, Value::Exception(exc) if exc.is_instance_of(kind))),
        Value::Tuple(classes) => {
            for class in classes.iter() {
                if is_instance(value, class)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(type_error(
            "isinstance() arg 2 must be a type, a tuple of types, or a union",
        )),
    }
}

fn parse_int(text: &str, base: i64) -> Result<i64, ScriptError> {
    let invalid = || {
        value_error(format!(
            "invalid literal for int() with base {base}: {}",
            super::value::repr_str(text)
        ))
    };
    if base != 0 && !(2..=36).contains(&base) {
        return Err(value_error("int() base must be >= 2 and <= 36, or 0"));
    }
    let trimmed = text.trim();
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let lower = digits.to_ascii_lowercase();
    let (radix, body) = match (base, lower.get(..2)) {
        (0 | 16, Some("0x")) => (16, &digits[2..]),
        (0 | 8, Some("0o")) => (8, &digits[2..]),
        (0 | 2, Some("0b")) => (2, &digits[2..]),
        (0, _) => (10, digits),
        (b, _) => (b as u32, digits),
    };
    let body: String = body.chars().filter(|c| *c != '_').collect();
    if body.is_empty() || body.starts_with(['+', '-']) {
        return Err(invalid());
    }
    let magnitude = i64::from_str_radix(&body, radix).map_err(|_| invalid())?;
    Ok(if negative { -magnitude } else { magnitude })
}

fn parse_float(text: &str) -> Result<f64, ScriptError> {
    let trimmed = text.trim();
    let normalized = trimmed.to_ascii_lowercase().replace('_', "");
    let parsed = match normalized.trim_start_matches(['+', '-']) {
        "inf" | "infinity" => Some(if normalized.starts_with('-') {
            f64::NEG_INFINITY
        } else {
            f64::INFINITY
        }),
        "nan" => Some(f64::NAN),
        _ => normalized.parse::<f64>().ok(),
    };
    parsed.ok_or_else(|| {
        value_error(format!(
            "could not convert string to float: {}",
            super::value::repr_str(text)
        ))
    })
}

fn float_to_int(f: f64) -> Result<i64, ScriptError> {
    if f.is_nan() {
        return Err(value_error("cannot convert float NaN to integer"));
    }
    if f.is_infinite() || f.abs() >= 9.223_372_036_854_775_807e18 {
        return Err(ScriptError::raise(
            "OverflowError",
            "cannot convert float infinity to integer",
        ));
    }
    Ok(f.trunc() as i64)
}

fn round(value: &Value, ndigits: Option<Value>) -> Result<Value, ScriptError> {
    let ndigits = match ndigits {
        None | Some(Value::None) => None,
        Some(n) => Some(expect_int(&n, "round")?),
    };
    match (value, ndigits) {
        (Value::Float(f), None) => float_to_int(f.round_ties_even()).map(Value::Int),
        (Value::Float(f), Some(n)) => {
            let scale = 10f64.powi(n.clamp(-308, 308) as i32);
            let rounded = (f * scale).round_ties_even() / scale;
            Ok(Value::Float(if rounded.is_finite() { rounded } else { *f }))
        }
        (other, _) => expect_int(other, "round").map(Value::Int),
    }
}

fn mod_pow(base: i64, exp: i64, modulus: i64) -> Result<i64, ScriptError> {
    if modulus == 0 {
        return Err(value_error("pow() 3rd argument cannot be 0"));
    }
    if exp < 0 {
        return Err(value_error("pow() negative exponent with modulus is not supported"));
    }
    let m = modulus as i128;
    let mut result: i128 = 1;
    let mut b = (base as i128).rem_euclid(m);
    let mut e = exp;
    while e > 0 {
        if e & 1 == 1 {
            result = (result * b).rem_euclid(m);
        }
        b = (b * b).rem_euclid(m);
        e >>= 1;
    }
    let mut result = result.rem_euclid(m);
    if modulus < 0 && result != 0 {
        result += m;
    }
    Ok(result as i64)
}

fn call_module(
    interp: &mut Interpreter,
    module: &str,
    func: &str,
    mut args: CallArgs,
) -> Result<Value, ScriptError> {
    let qualified = format!("{module}.{func}");
    let name = qualified.as_str();
    let float_arg = |args: &CallArgs, idx: usize| expect_float(&args.positional[idx], name);
    let domain = || value_error("math domain error");

    match (module, func) {
        ("math", "sqrt" | "exp" | "sin" | "cos" | "tan" | "asin" | "acos" | "atan" | "fabs"
        | "degrees" | "radians" | "log2" | "log10") => {
            args.expect(name, 1, 1)?;
            let x = float_arg(&args, 0)?;
            let result = match func {
                "sqrt" if x < 0.0 => return Err(domain()),
                "sqrt" => x.sqrt(),
                "exp" => x.exp(),
                "sin" => x.sin(),
                "cos" => x.cos(),
                "tan" => x.tan(),
                "asin" | "acos" if !(-1.0..=1.0).contains(&x) => return Err(domain()),
                "asin" => x.asin(),
                "acos" => x.acos(),
                "atan" => x.atan(),
                "fabs" => x.abs(),
                "degrees" => x.to_degrees(),
                "radians" => x.to_radians(),
                "log2" | "log10" if x <= 0.0 => return Err(domain()),
                "log2" => x.log2(),
                _ => x.log10(),
            };
            Ok(Value::Float(result))
        }
        ("math", "floor" | "ceil" | "trunc") => {
            args.expect(name, 1, 1)?;
            match &args.positional[0] {
                Value::Float(f) => float_to_int(match func {
                    "floor" => f.floor(),
                    "ceil" => f.ceil(),
                    _ => f.trunc(),
                })
                .map(Value::Int),
                other => expect_int(other, name).map(Value::Int),
            }
        }
        ("math", "log") => {
            args.expect(name, 1, 2)?;
            let x = float_arg(&args, 0)?;
            if x <= 0.0 {
                return Err(domain());
            }
            match args.arg(1) {
                Some(base) => {
                    let base = expect_float(base, name)?;
                    if base <= 0.0 || base == 1.0 {
                        return Err(domain());
                    }
                    Ok(Value::Float(x.ln() / base.ln()))
                }
                None => Ok(Value::Float(x.ln())),
            }
        }
        ("math", "pow" | "atan2" | "copysign") => {
            args.expect(name, 2, 2)?;
            let (x, y) = (float_arg(&args, 0)?, float_arg(&args, 1)?);
            Ok(Value::Float(match func {
                "pow" => x.powf(y),
                "atan2" => x.atan2(y),
                _ => x.copysign(y),
            }))
        }
        ("math", "hypot") => {
            args.expect(name, 0, usize::MAX)?;
            let mut total = 0.0f64;
            for i in 0..args.positional.len() {
                total = total.hypot(float_arg(&args, i)?);
            }
            Ok(Value::Float(total))
        }
        ("math", "isnan" | "isinf" | "isfinite") => {
            args.expect(name, 1, 1)?;
            let x = float_arg(&args, 0)?;
            Ok(Value::Bool(match func {
                "isnan" => x.is_nan(),
                "isinf" => x.is_infinite(),
                _ => x.is_finite(),
            }))
        }
        ("math", "gcd") => {
            args.expect(name, 0, usize::MAX)?;
            let mut acc: u64 = 0;
            for value in &args.positional {
                let mut b = expect_int(value, name)?.unsigned_abs();
                let mut a = acc;
                while b != 0 {
                    (a, b) = (b, a % b);
                }
                acc = a;
            }
            i64::try_from(acc)
                .map(Value::Int)
                .map_err(|_| ScriptError::raise("OverflowError", "integer overflow"))
        }
        ("math", "factorial") => {
            args.expect(name, 1, 1)?;
            let n = expect_int(&args.positional[0], name)?;
            if n < 0 {
                return Err(value_error("factorial() not defined for negative values"));
            }
            (1..=n)
                .try_fold(1i64, |acc, k| acc.checked_mul(k))
                .map(Value::Int)
                .ok_or_else(|| ScriptError::raise("OverflowError", "integer overflow"))
        }
        ("math", "isclose") => {
            let rel_tol = args.keyword("rel_tol");
            let abs_tol = args.keyword("abs_tol");
            args.expect(name, 2, 2)?;
            let (a, b) = (float_arg(&args, 0)?, float_arg(&args, 1)?);
            let rel_tol = rel_tol.map_or(Ok(1e-9), |v| expect_float(&v, name))?;
            let abs_tol = abs_tol.map_or(Ok(0.0), |v| expect_float(&v, name))?;
            let close = a == b
                || (a - b).abs() <= (rel_tol * a.abs().max(b.abs())).max(abs_tol);
            Ok(Value::Bool(close))
        }
        ("math", "prod") => {
            let start = args.keyword("start");
            args.expect(name, 1, 1)?;
            let mut total = start.unwrap_or(Value::Int(1));
            for item in interp.iterate(&args.positional[0])? {
                total = interp.binary_op(super::ast::BinOp::Mul, &total, &item)?;
            }
            Ok(total)
        }
        ("math", "fsum") => {
            args.expect(name, 1, 1)?;
            let mut total = 0.0;
            for item in interp.iterate(&args.positional[0])? {
                total += expect_float(&item, name)?;
            }
            Ok(Value::Float(total))
        }
        ("json", "dumps") => {
            let indent = args.keyword("indent");
            let sort_keys = args.keyword("sort_keys").is_some_and(|v| v.truthy());
            args.expect(name, 1, 1)?;
            let indent = match indent {
                None | Some(Value::None) => None,
                Some(v) => Some(expect_int(&v, name)?.clamp(0, 32) as usize),
            };
            let mut out = String::new();
            json_dump(&args.positional[0], indent, sort_keys, 0, &mut out)?;
            interp.check_len(out.len())?;
            Ok(Value::str(out))
        }
        ("json", "loads") => {
            args.expect(name, 1, 1)?;
            let text = expect_str(&args.positional[0], name)?;
            interp.check_len(text.len())?;
            serde_json::from_str::<serde_json::Value>(text)
                .map(|json| Value::from_json(&json))
                .map_err(|e| value_error(format!("Invalid JSON: {e}")))
        }
        ("time", "time") => {
            args.expect(name, 0, 0)?;
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0);
            Ok(Value::Float(now))
        }
        ("time", "monotonic") => {
            args.expect(name, 0, 0)?;
            static ORIGIN: OnceLock<Instant> = OnceLock::new();
            let origin = ORIGIN.get_or_init(Instant::now);
            Ok(Value::Float(origin.elapsed().as_secs_f64()))
        }
        ("os", "getenv") => {
            let default = args.keyword("default");
            args.expect(name, 1, 2)?;
            let key = expect_str(&args.positional[0], name)?;
            let default = default
                .or_else(|| args.arg(1).cloned())
                .unwrap_or(Value::None);
            Ok(std::env::var(key).map(Value::str).unwrap_or(default))
        }
        _ => Err(ScriptError::raise(
            "AttributeError",
            format!("module '{module}' has no attribute '{func}'"),
        )),
    }
}

const MAX_JSON_DEPTH: usize = 64;

fn json_dump(
    value: &Value,
    indent: Option<usize>,
    sort_keys: bool,
    depth: usize,
    out: &mut String,
) -> Result<(), ScriptError> {
    if depth > MAX_JSON_DEPTH {
        return Err(value_error("Circular reference detected"));
    }
    let newline = |out: &mut String, level: usize| {
        if let Some(width) = indent {
            out.push('\n');
            out.extend(std::iter::repeat_n(' ', width * level));
        }
    };
    let item_sep = if indent.is_some() { "," } else { ", " };
    match value {
        Value::None => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Int(i) => out.push_str(&i.to_string()),
        Value::Float(f) => out.push_str(&json_float(*f)),
        Value::Str(s) => out.push_str(&json_string(s)),
        Value::List(_) | Value::Tuple(_) => {
            let items = match value {
                Value::List(items) => items.borrow().clone(),
                Value::Tuple(items) => items.as_ref().clone(),
                _ => Vec::new(),
            };
            if items.is_empty() {
                out.push_str("[]");
                return Ok(());
            }
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(item_sep);
                }
                newline(out, depth + 1);
                json_dump(item, indent, sort_keys, depth + 1, out)?;
            }
            newline(out, depth);
            out.push(']');
        }
        Value::Dict(map) => {
            let mut entries = Vec::with_capacity(map.borrow().len());
            for (key, value) in map.borrow().values() {
                let key = match key {
                    Value::Str(s) => s.to_string(),
                    Value::Int(i) => i.to_string(),
                    Value::Float(f) => json_float(*f),
                    Value::Bool(b) => b.to_string(),
                    Value::None => "null".to_string(),
                    other => {
                        return Err(type_error(format!(
                            "keys must be str, int, float, bool or None, not {}",
                            other.type_name()
                        )));
                    }
                };
                entries.push((key, value.clone()));
            }
            if entries.is_empty() {
                out.push_str("{}");
                return Ok(());
            }
            if sort_keys {
                entries.sort_by(|a, b| a.0.cmp(&b.0));
            }
            out.push('{');
            for (i, (key, value)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push_str(item_sep);
                }
                newline(out, depth + 1);
                out.push_str(&json_string(key));
                out.push_str(": ");
                json_dump(value, indent, sort_keys, depth + 1, out)?;
            }
            newline(out, depth);
            out.push('}');
        }
        other => {
            return Err(type_error(format!(
                "Object of type {} is not JSON serializable",
                other.type_name()
            )));
        }
    }
    Ok(())
}

fn json_float(f: f64) -> String {
    if f.is_nan() {
        "NaN".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        format_float(f)
    }
}

/// JSON string literal with non-ASCII escaped, as `json.dumps` does by default.
fn json_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            c if c.is_ascii() && c >= ' ' => out.push(c),
            c => {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    out.push_str(&format!("\\u{unit:04x}"));
                }
            }
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{Program, SandboxPolicy};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn eval(expr: &str) -> Result<Value, ScriptError> {
        eval_with(expr, SandboxPolicy::sandboxed(1_000_000))
    }

    fn eval_with(expr: &str, policy: SandboxPolicy) -> Result<Value, ScriptError> {
        let source = format!("import math\nimport json\nimport string\ndef main():\n    return {expr}\n");
        let program = Program::compile(&source)?;
        let mut interp = Interpreter::new(policy, Instant::now() + Duration::from_secs(5));
        interp.run_module(program.module())?;
        interp.call_global("main", Vec::new(), Vec::new())
    }

    fn show(expr: &str) -> String {
        eval(expr).expect("evaluates").py_repr()
    }

    #[test]
    fn test_conversions() {
        assert_eq!(show("int(' 42 ')"), "42");
        assert_eq!(show("int('ff', 16)"), "255");
        assert_eq!(show("int(-3.9)"), "-3");
        assert_eq!(show("float('1e3')"), "1000.0");
        assert_eq!(show("str(1.5) + str(None)"), "'1.5None'");
        assert_eq!(show("bool([]), bool('x')"), "(False, True)");
        assert_eq!(show("hex(255), oct(8), bin(-5)"), "('0xff', '0o10', '-0b101')");
        assert!(eval("int('abc')").is_err());
    }

    #[test]
    fn test_sequences() {
        assert_eq!(show("sorted([3, 1, 2], reverse=True)"), "[3, 2, 1]");
        assert_eq!(show("sorted(['bb', 'a', 'ccc'], key=len)"), "['a', 'bb', 'ccc']");
        assert_eq!(show("list(zip([1, 2, 3], 'ab'))"), "[(1, 'a'), (2, 'b')]");
        assert_eq!(show("list(enumerate('ab', start=1))"), "[(1, 'a'), (2, 'b')]");
        assert_eq!(show("list(map(lambda x: x * 2, [1, 2]))"), "[2, 4]");
        assert_eq!(show("list(filter(None, [0, 1, '', 'x']))"), "[1, 'x']");
        assert_eq!(show("max([1, 5, 3]), min(4, 2, 8), max([], default=0)"), "(5, 2, 0)");
        assert_eq!(show("sum([1, 2, 3]), sum([0.5, 0.5])"), "(6, 1.0)");
        assert_eq!(show("list(reversed(range(3)))"), "[2, 1, 0]");
        assert_eq!(show("len({'a': 1}), len('héllo')"), "(1, 5)");
        assert!(eval("sorted([1, 'a'])").is_err());
    }

    #[test]
    fn test_rounding_is_bankers() {
        assert_eq!(show("round(2.5), round(3.5), round(-0.5)"), "(2, 4, 0)");
        assert_eq!(show("round(3.14159, 2)"), "3.14");
        assert_eq!(show("divmod(-7, 2)"), "(-4, 1)");
        assert_eq!(show("pow(3, 4, 5)"), "1");
    }

    #[test]
    fn test_isinstance_and_type() {
        assert_eq!(show("isinstance(True, int), isinstance(1, (str, float))"), "(True, False)");
        assert_eq!(show("type([]) == list"), "True");
        assert_eq!(show("isinstance(ValueError('x'), Exception)"), "True");
    }

    #[test]
    fn test_math_module() {
        assert_eq!(show("math.floor(2.7), math.ceil(2.1), math.gcd(12, 18)"), "(2, 3, 6)");
        assert_eq!(show("math.factorial(10)"), "3628800");
        assert_eq!(show("round(math.pi, 4)"), "3.1416");
        match eval("math.sqrt(-1)") {
            Err(ScriptError::Raised(exc)) => assert_eq!(exc.to_string(), "ValueError: math domain error"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_json_module_matches_python_layout() {
        assert_eq!(
            eval("json.dumps({'b': [1, 2.0, None], 'a': 'é'})").unwrap().py_str(),
            r#"{"b": [1, 2.0, null], "a": "\u00e9"}"#
        );
        assert_eq!(
            eval("json.dumps({'b': 1, 'a': [True]}, indent=2, sort_keys=True)").unwrap().py_str(),
            "{\n  \"a\": [\n    true\n  ],\n  \"b\": 1\n}"
        );
        assert_eq!(show("json.loads('{\"x\": [1, 2]}')['x'][1]"), "2");
        assert!(eval("json.dumps({1, 2})").is_err());
    }

    #[test]
    fn test_string_module_constants() {
        assert_eq!(show("len(string.ascii_letters), string.digits"), "(52, '0123456789')");
    }

    #[test]
    fn test_host_modules_follow_policy() {
        let source = "import time\ndef main():\n    return time.time() > 0\n";
        let program = Program::compile(source).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);

        let mut sandboxed = Interpreter::new(SandboxPolicy::sandboxed(1000), deadline);
        assert!(sandboxed.run_module(program.module()).is_err());

        let mut local = Interpreter::new(SandboxPolicy::local(), deadline);
        local.run_module(program.module()).unwrap();
        let result = local.call_global("main", Vec::new(), Vec::new()).unwrap();
        assert!(result.truthy());
    }

    #[test]
    fn test_hook_result_builds_dict() {
        assert_eq!(
            show("HookResult(blocked=True, message='no')"),
            "{'blocked': True, 'message': 'no'}"
        );
    }

    #[test]
    fn test_merge_sort_is_stable() {
        let mut order: Vec<usize> = (0..6).collect();
        let keys = [2, 1, 2, 0, 1, 0];
        merge_sort(&mut order, &mut |a, b| Ok(keys[a].cmp(&keys[b]))).unwrap();
        assert_eq!(order, vec![3, 5, 1, 4, 0, 2]);
    }
}
