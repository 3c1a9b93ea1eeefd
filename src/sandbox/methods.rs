//! Methods on builtin value types.

use std::rc::Rc;

use super::builtins::{dict_update, sort_values};
use super::format::format_template;
use super::interpreter::{CallArgs, Interpreter, dict_insert, normalize_index};
use super::value::{SetMap, Value};
use super::ScriptError;

const STR_METHODS: &[&str] = &[
    "capitalize", "casefold", "center", "count", "endswith", "find", "format", "index",
    "isalnum", "isalpha", "isdecimal", "isdigit", "islower", "isnumeric", "isspace", "istitle",
    "isupper", "join", "ljust", "lower", "lstrip", "partition", "removeprefix", "removesuffix",
    "replace", "rfind", "rindex", "rjust", "rpartition", "rsplit", "rstrip", "split",
    "splitlines", "startswith", "strip", "swapcase", "title", "upper", "zfill",
];

const LIST_METHODS: &[&str] = &[
    "append", "clear", "copy", "count", "extend", "index", "insert", "pop", "remove", "reverse",
    "sort",
];

const TUPLE_METHODS: &[&str] = &["count", "index"];

const DICT_METHODS: &[&str] = &[
    "clear", "copy", "get", "items", "keys", "pop", "popitem", "setdefault", "update", "values",
];

const SET_METHODS: &[&str] = &[
    "add", "clear", "copy", "difference", "discard", "intersection", "isdisjoint", "issubset",
    "issuperset", "pop", "remove", "symmetric_difference", "union", "update",
];

pub(super) fn lookup(value: &Value, attr: &str) -> Option<&'static str> {
    let table: &[&'static str] = match value {
        Value::Str(_) => STR_METHODS,
        Value::List(_) => LIST_METHODS,
        Value::Tuple(_) => TUPLE_METHODS,
        Value::Dict(_) => DICT_METHODS,
        Value::Set(_) => SET_METHODS,
        Value::Float(_) => &["is_integer"],
        Value::Int(_) => &["bit_length"],
        _ => return None,
    };
    table.iter().find(|m| **m == attr).copied()
}

fn type_error(message: impl Into<String>) -> ScriptError {
    ScriptError::raise("TypeError", message)
}

fn str_arg<'a>(args: &'a CallArgs, idx: usize, method: &str) -> Result<&'a str, ScriptError> {
    match args.arg(idx) {
        Some(Value::Str(s)) => Ok(s),
        Some(other) => Err(type_error(format!(
            "{method}() argument must be str, not {}",
            other.type_name()
        ))),
        None => Err(type_error(format!("{method}() missing required argument"))),
    }
}

fn opt_str_arg<'a>(
    args: &'a CallArgs,
    idx: usize,
    method: &str,
) -> Result<Option<&'a str>, ScriptError> {
    match args.arg(idx) {
        None | Some(Value::None) => Ok(None),
        Some(_) => str_arg(args, idx, method).map(Some),
    }
}

fn int_arg(args: &CallArgs, idx: usize, default: i64) -> Result<i64, ScriptError> {
    match args.arg(idx) {
        None | Some(Value::None) => Ok(default),
        Some(v) => v.as_int().ok_or_else(|| {
            type_error(format!(
                "'{}' object cannot be interpreted as an integer",
                v.type_name()
            ))
        }),
    }
}

/// Optional end index, where `None` means the end of the string.
fn end_arg(args: &CallArgs, idx: usize) -> Result<Option<i64>, ScriptError> {
    match args.arg(idx) {
        None | Some(Value::None) => Ok(None),
        Some(_) => int_arg(args, idx, 0).map(Some),
    }
}

pub(super) fn call(
    interp: &mut Interpreter,
    receiver: &Value,
    name: &'static str,
    args: CallArgs,
) -> Result<Value, ScriptError> {
    interp.tick()?;
    match receiver {
        Value::Str(s) => str_method(interp, s, name, args),
        Value::List(_) => list_method(interp, receiver, name, args),
        Value::Tuple(items) => sequence_method(items, name, args),
        Value::Dict(_) => dict_method(interp, receiver, name, args),
        Value::Set(_) => set_method(interp, receiver, name, args),
        Value::Float(f) => {
            args.expect(name, 0, 0)?;
            Ok(Value::Bool(f.is_finite() && f.fract() == 0.0))
        }
        Value::Int(i) => {
            args.expect(name, 0, 0)?;
            Ok(Value::Int(i64::from(64 - i.unsigned_abs().leading_zeros())))
        }
        other => Err(ScriptError::raise(
            "AttributeError",
            format!("'{}' object has no attribute '{name}'", other.type_name()),
        )),
    }
}

// ── str ──

/// Char-indexed slice bounds, clamped like Python's `s[start:end]`.
fn char_window(s: &str, start: i64, end: Option<i64>) -> (usize, usize) {
    let len = s.chars().count() as i64;
    let clamp = |idx: i64| if idx < 0 { (idx + len).max(0) } else { idx.min(len) };
    let start = clamp(start) as usize;
    let end = end.map_or(len, clamp) as usize;
    (start, end.max(start))
}

fn byte_offset(s: &str, char_idx: usize) -> usize {
    s.char_indices().nth(char_idx).map_or(s.len(), |(i, _)| i)
}

fn char_index(s: &str, byte_idx: usize) -> usize {
    s[..byte_idx].chars().count()
}

fn find(
    s: &str,
    args: &CallArgs,
    method: &str,
    reverse: bool,
) -> Result<Option<usize>, ScriptError> {
    let needle = str_arg(args, 0, method)?;
    let (start, end) = char_window(s, int_arg(args, 1, 0)?, end_arg(args, 2)?);
    let (lo, hi) = (byte_offset(s, start), byte_offset(s, end));
    let window = &s[lo..hi];
    let found = if reverse {
        window.rfind(needle)
    } else {
        window.find(needle)
    };
    Ok(found.map(|offset| char_index(s, lo + offset)))
}

fn split_whitespace(s: &str, maxsplit: i64, reverse: bool) -> Vec<Value> {
    let words: Vec<&str> = s.split_whitespace().collect();
    if maxsplit < 0 || (maxsplit as usize) >= words.len() {
        return words.into_iter().map(Value::str).collect();
    }
    let maxsplit = maxsplit as usize;
    if reverse {
        let mut rest = s.trim_end();
        let mut tail = Vec::new();
        for _ in 0..maxsplit {
            let Some(idx) = rest.rfind(char::is_whitespace) else {
                break;
            };
            let word_start = idx + rest[idx..].chars().next().map_or(1, char::len_utf8);
            tail.push(Value::str(&rest[word_start..]));
            rest = rest[..idx].trim_end();
        }
        tail.push(Value::str(rest.trim_start()));
        tail.reverse();
        tail
    } else {
        let mut rest = s.trim_start();
        let mut out = Vec::new();
        for _ in 0..maxsplit {
            let Some(idx) = rest.find(char::is_whitespace) else {
                break;
            };
            out.push(Value::str(&rest[..idx]));
            rest = rest[idx..].trim_start();
        }
        out.push(Value::str(rest.trim_end()));
        out
    }
}

fn split(s: &str, mut args: CallArgs, method: &'static str) -> Result<Value, ScriptError> {
    let sep = args.keyword("sep");
    let maxsplit = args.keyword("maxsplit");
    args.expect(method, 0, 2)?;
    if let Some(sep) = sep {
        args.positional.insert(0, sep);
    }
    if let Some(maxsplit) = maxsplit {
        if args.positional.is_empty() {
            args.positional.push(Value::None);
        }
        args.positional.insert(1, maxsplit);
    }
    let reverse = method == "rsplit";
    let maxsplit = int_arg(&args, 1, -1)?;
    let parts = match opt_str_arg(&args, 0, method)? {
        None => split_whitespace(s, maxsplit, reverse),
        Some("") => return Err(ScriptError::raise("ValueError", "empty separator")),
        Some(sep) => {
            let parts: Vec<&str> = match (maxsplit < 0, reverse) {
                (true, _) => s.split(sep).collect(),
                (false, false) => s.splitn(maxsplit as usize + 1, sep).collect(),
                (false, true) => {
                    let mut parts: Vec<&str> = s.rsplitn(maxsplit as usize + 1, sep).collect();
                    parts.reverse();
                    parts
                }
            };
            parts.into_iter().map(Value::str).collect()
        }
    };
    Ok(Value::list(parts))
}

fn strip_chars<'a>(s: &'a str, chars: Option<&str>, left: bool, right: bool) -> &'a str {
    let matches = |c: char| match chars {
        Some(set) => set.contains(c),
        None => c.is_whitespace(),
    };
    let s = if left { s.trim_start_matches(matches) } else { s };
    if right { s.trim_end_matches(matches) } else { s }
}

fn pad(
    interp: &Interpreter,
    s: &str,
    mut args: CallArgs,
    method: &str,
) -> Result<Value, ScriptError> {
    args.expect(method, 1, 2)?;
    let width = int_arg(&args, 0, 0)?.max(0) as usize;
    interp.check_len(width)?;
    let fill = match args.arg(1) {
        Some(_) => {
            let fill = str_arg(&args, 1, method)?;
            let mut chars = fill.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => c,
                _ => {
                    return Err(type_error(
                        "The fill character must be exactly one character long",
                    ));
                }
            }
        }
        None => ' ',
    };
    let len = s.chars().count();
    if width <= len {
        return Ok(Value::str(s));
    }
    let total = width - len;
    let (left, right) = match method {
        "ljust" => (0, total),
        "rjust" => (total, 0),
        _ => {
            let left = total / 2 + (total & width & 1);
            (left, total - left)
        }
    };
    let fill = |n: usize| std::iter::repeat_n(fill, n).collect::<String>();
    Ok(Value::str(format!("{}{s}{}", fill(left), fill(right))))
}

fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_cased = false;
    for c in s.chars() {
        if prev_cased {
            out.extend(c.to_lowercase());
        } else {
            out.extend(c.to_uppercase());
        }
        prev_cased = c.is_alphabetic();
    }
    out
}

fn str_method(
    interp: &mut Interpreter,
    s: &Rc<str>,
    name: &'static str,
    mut args: CallArgs,
) -> Result<Value, ScriptError> {
    let text: &str = s;
    let predicate = |test: fn(char) -> bool| !text.is_empty() && text.chars().all(test);
    let result = match name {
        "upper" | "lower" | "casefold" | "swapcase" | "title" | "capitalize" => {
            args.expect(name, 0, 0)?;
            Value::str(match name {
                "upper" => text.to_uppercase(),
                "lower" | "casefold" => text.to_lowercase(),
                "swapcase" => text
                    .chars()
                    .flat_map(|c| -> Vec<char> {
                        if c.is_uppercase() {
                            c.to_lowercase().collect()
                        } else {
                            c.to_uppercase().collect()
                        }
                    })
                    .collect(),
                "title" => title_case(text),
                _ => {
                    let mut chars = text.chars();
                    match chars.next() {
                        Some(first) => first
                            .to_uppercase()
                            .chain(chars.flat_map(char::to_lowercase))
                            .collect(),
                        None => String::new(),
                    }
                }
            })
        }
        "strip" | "lstrip" | "rstrip" => {
            args.expect(name, 0, 1)?;
            let chars = opt_str_arg(&args, 0, name)?;
            Value::str(strip_chars(text, chars, name != "rstrip", name != "lstrip"))
        }
        "split" | "rsplit" => return split(text, args, name),
        "splitlines" => {
            let keepends = args.keyword("keepends").is_some_and(|v| v.truthy());
            args.expect(name, 0, 1)?;
            let keepends = keepends || args.arg(0).is_some_and(Value::truthy);
            let mut lines = Vec::new();
            let mut rest = text;
            while !rest.is_empty() {
                let (line, ending, next) = match rest.find(['\n', '\r']) {
                    Some(idx) => {
                        let ending_len = if rest[idx..].starts_with("\r\n") { 2 } else { 1 };
                        (&rest[..idx], &rest[idx..idx + ending_len], &rest[idx + ending_len..])
                    }
                    None => (rest, "", ""),
                };
                lines.push(Value::str(if keepends {
                    format!("{line}{ending}")
                } else {
                    line.to_string()
                }));
                rest = next;
            }
            Value::list(lines)
        }
        "join" => {
            args.expect(name, 1, 1)?;
            let items = interp.iterate(&args.positional[0])?;
            let mut parts = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                match item {
                    Value::Str(part) => parts.push(part.to_string()),
                    other => {
                        return Err(type_error(format!(
                            "sequence item {i}: expected str instance, {} found",
                            other.type_name()
                        )));
                    }
                }
            }
            let joined = parts.join(text);
            interp.check_len(joined.len())?;
            Value::str(joined)
        }
        "replace" => {
            args.expect(name, 2, 3)?;
            let old = str_arg(&args, 0, name)?;
            let new = str_arg(&args, 1, name)?;
            let count = int_arg(&args, 2, -1)?;
            let replaced = if count < 0 {
                text.replace(old, new)
            } else {
                text.replacen(old, new, count as usize)
            };
            interp.check_len(replaced.len())?;
            Value::str(replaced)
        }
        "startswith" | "endswith" => {
            args.expect(name, 1, 3)?;
            let (start, end) = char_window(text, int_arg(&args, 1, 0)?, end_arg(&args, 2)?);
            let window = &text[byte_offset(text, start)..byte_offset(text, end)];
            let candidates = match &args.positional[0] {
                Value::Tuple(items) => items.as_ref().clone(),
                other => vec![other.clone()],
            };
            let mut hit = false;
            for candidate in candidates {
                let Value::Str(affix) = candidate else {
                    return Err(type_error(format!(
                        "{name} first arg must be str or a tuple of str, not {}",
                        candidate.type_name()
                    )));
                };
                hit |= if name == "startswith" {
                    window.starts_with(affix.as_ref())
                } else {
                    window.ends_with(affix.as_ref())
                };
            }
            Value::Bool(hit)
        }
        "find" | "rfind" => {
            args.expect(name, 1, 3)?;
            let found = find(text, &args, name, name == "rfind")?;
            Value::Int(found.map_or(-1, |i| i as i64))
        }
        "index" | "rindex" => {
            args.expect(name, 1, 3)?;
            match find(text, &args, name, name == "rindex")? {
                Some(i) => Value::Int(i as i64),
                None => return Err(ScriptError::raise("ValueError", "substring not found")),
            }
        }
        "count" => {
            args.expect(name, 1, 1)?;
            let needle = str_arg(&args, 0, name)?;
            let count = if needle.is_empty() {
                text.chars().count() + 1
            } else {
                text.matches(needle).count()
            };
            Value::Int(count as i64)
        }
        "isdigit" | "isdecimal" | "isnumeric" => {
            args.expect(name, 0, 0)?;
            Value::Bool(match name {
                "isnumeric" => predicate(char::is_numeric),
                _ => predicate(|c| c.is_ascii_digit()),
            })
        }
        "isalpha" => {
            args.expect(name, 0, 0)?;
            Value::Bool(predicate(char::is_alphabetic))
        }
        "isalnum" => {
            args.expect(name, 0, 0)?;
            Value::Bool(predicate(char::is_alphanumeric))
        }
        "isspace" => {
            args.expect(name, 0, 0)?;
            Value::Bool(predicate(char::is_whitespace))
        }
        "isupper" | "islower" => {
            args.expect(name, 0, 0)?;
            let has_cased = text.chars().any(|c| c.is_uppercase() || c.is_lowercase());
            let no_opposite = if name == "isupper" {
                !text.chars().any(char::is_lowercase)
            } else {
                !text.chars().any(char::is_uppercase)
            };
            Value::Bool(has_cased && no_opposite)
        }
        "istitle" => {
            args.expect(name, 0, 0)?;
            Value::Bool(text.chars().any(char::is_alphabetic) && title_case(text) == text)
        }
        "center" | "ljust" | "rjust" => return pad(interp, text, args, name),
        "zfill" => {
            args.expect(name, 1, 1)?;
            let width = int_arg(&args, 0, 0)?.max(0) as usize;
            interp.check_len(width)?;
            let len = text.chars().count();
            if width <= len {
                Value::str(text)
            } else {
                let (sign, digits) = match text.chars().next() {
                    Some(c @ ('+' | '-')) => (c.to_string(), &text[1..]),
                    _ => (String::new(), text),
                };
                Value::str(format!("{sign}{}{digits}", "0".repeat(width - len)))
            }
        }
        "partition" | "rpartition" => {
            args.expect(name, 1, 1)?;
            let sep = str_arg(&args, 0, name)?;
            if sep.is_empty() {
                return Err(ScriptError::raise("ValueError", "empty separator"));
            }
            let found = if name == "partition" {
                text.find(sep)
            } else {
                text.rfind(sep)
            };
            let parts = match (found, name) {
                (Some(idx), _) => [&text[..idx], sep, &text[idx + sep.len()..]],
                (None, "partition") => [text, "", ""],
                (None, _) => ["", "", text],
            };
            Value::tuple(parts.into_iter().map(Value::str).collect())
        }
        "removeprefix" | "removesuffix" => {
            args.expect(name, 1, 1)?;
            let affix = str_arg(&args, 0, name)?;
            let stripped = if name == "removeprefix" {
                text.strip_prefix(affix)
            } else {
                text.strip_suffix(affix)
            };
            Value::str(stripped.unwrap_or(text))
        }
        "format" => {
            let keywords = std::mem::take(&mut args.keywords);
            let formatted = format_template(text, &args.positional, &keywords)?;
            interp.check_len(formatted.len())?;
            Value::str(formatted)
        }
        _ => unreachable!("lookup only yields known str methods"),
    };
    Ok(result)
}

// ── tuple / shared sequence ──

fn sequence_method(items: &[Value], name: &str, args: CallArgs) -> Result<Value, ScriptError> {
    args.expect(name, 1, 1)?;
    let needle = &args.positional[0];
    match name {
        "count" => Ok(Value::Int(
            items.iter().filter(|item| item.py_eq(needle)).count() as i64,
        )),
        _ => items
            .iter()
            .position(|item| item.py_eq(needle))
            .map(|i| Value::Int(i as i64))
            .ok_or_else(|| ScriptError::raise("ValueError", "x not in sequence")),
    }
}

// ── list ──

fn list_method(
    interp: &mut Interpreter,
    receiver: &Value,
    name: &'static str,
    mut args: CallArgs,
) -> Result<Value, ScriptError> {
    let Value::List(list) = receiver else {
        unreachable!("list_method called on a list");
    };
    match name {
        "append" => {
            args.expect(name, 1, 1)?;
            interp.check_len(list.borrow().len() + 1)?;
            list.borrow_mut().push(args.positional.remove(0));
        }
        "extend" => {
            args.expect(name, 1, 1)?;
            let items = interp.iterate(&args.positional[0])?;
            interp.check_len(list.borrow().len() + items.len())?;
            list.borrow_mut().extend(items);
        }
        "insert" => {
            args.expect(name, 2, 2)?;
            let len = list.borrow().len() as i64;
            interp.check_len(len as usize + 1)?;
            let idx = int_arg(&args, 0, 0)?;
            let idx = if idx < 0 { (idx + len).max(0) } else { idx.min(len) };
            let value = args.positional.remove(1);
            list.borrow_mut().insert(idx as usize, value);
        }
        "pop" => {
            args.expect(name, 0, 1)?;
            let idx = int_arg(&args, 0, -1)?;
            let mut items = list.borrow_mut();
            if items.is_empty() {
                return Err(ScriptError::raise("IndexError", "pop from empty list"));
            }
            let idx = normalize_index(idx, items.len())
                .ok_or_else(|| ScriptError::raise("IndexError", "pop index out of range"))?;
            return Ok(items.remove(idx));
        }
        "remove" => {
            args.expect(name, 1, 1)?;
            let needle = &args.positional[0];
            let pos = list.borrow().iter().position(|item| item.py_eq(needle));
            match pos {
                Some(idx) => {
                    list.borrow_mut().remove(idx);
                }
                None => {
                    return Err(ScriptError::raise(
                        "ValueError",
                        "list.remove(x): x not in list",
                    ));
                }
            }
        }
        "index" | "count" => {
            let items = list.borrow().clone();
            return sequence_method(&items, name, args);
        }
        "reverse" => {
            args.expect(name, 0, 0)?;
            list.borrow_mut().reverse();
        }
        "sort" => {
            let key = args.keyword("key");
            let reverse = args.keyword("reverse").is_some_and(|v| v.truthy());
            args.expect(name, 0, 0)?;
            let mut items = list.borrow().clone();
            sort_values(interp, &mut items, key.as_ref(), reverse)?;
            *list.borrow_mut() = items;
        }
        "copy" => {
            args.expect(name, 0, 0)?;
            return Ok(Value::list(list.borrow().clone()));
        }
        "clear" => {
            args.expect(name, 0, 0)?;
            list.borrow_mut().clear();
        }
        _ => unreachable!("lookup only yields known list methods"),
    }
    Ok(Value::None)
}

// ── dict ──

fn dict_method(
    interp: &mut Interpreter,
    receiver: &Value,
    name: &'static str,
    mut args: CallArgs,
) -> Result<Value, ScriptError> {
    let Value::Dict(dict) = receiver else {
        unreachable!("dict_method called on a dict");
    };
    let key_error = |key: &Value| ScriptError::raise("KeyError", key.py_repr());
    match name {
        "get" => {
            args.expect(name, 1, 2)?;
            let key = args.positional[0].hash_key()?;
            let default = args.arg(1).cloned().unwrap_or(Value::None);
            Ok(dict
                .borrow()
                .get(&key)
                .map(|(_, value)| value.clone())
                .unwrap_or(default))
        }
        "keys" | "values" | "items" => {
            args.expect(name, 0, 0)?;
            let map = dict.borrow();
            let entries = map.values().map(|(key, value)| match name {
                "keys" => key.clone(),
                "values" => value.clone(),
                _ => Value::tuple(vec![key.clone(), value.clone()]),
            });
            Ok(Value::list(entries.collect()))
        }
        "pop" => {
            args.expect(name, 1, 2)?;
            let key = args.positional[0].hash_key()?;
            let removed = dict.borrow_mut().shift_remove(&key);
            match (removed, args.arg(1)) {
                (Some((_, value)), _) => Ok(value),
                (None, Some(default)) => Ok(default.clone()),
                (None, None) => Err(key_error(&args.positional[0])),
            }
        }
        "popitem" => {
            args.expect(name, 0, 0)?;
            let last = dict.borrow_mut().pop();
            last.map(|(_, (key, value))| Value::tuple(vec![key, value]))
                .ok_or_else(|| ScriptError::raise("KeyError", "'popitem(): dictionary is empty'"))
        }
        "setdefault" => {
            args.expect(name, 1, 2)?;
            let key = args.positional[0].clone();
            let hash = key.hash_key()?;
            if let Some((_, value)) = dict.borrow().get(&hash) {
                return Ok(value.clone());
            }
            let default = args.arg(1).cloned().unwrap_or(Value::None);
            interp.check_len(dict.borrow().len() + 1)?;
            dict.borrow_mut().insert(hash, (key, default.clone()));
            Ok(default)
        }
        "update" => {
            let keywords = std::mem::take(&mut args.keywords);
            args.expect(name, 0, 1)?;
            let mut map = dict.borrow().clone();
            if let Some(source) = args.arg(0) {
                dict_update(interp, &mut map, source)?;
            }
            for (key, value) in keywords {
                dict_insert(&mut map, Value::str(key), value)?;
            }
            interp.check_len(map.len())?;
            *dict.borrow_mut() = map;
            Ok(Value::None)
        }
        "copy" => {
            args.expect(name, 0, 0)?;
            Ok(Value::dict(dict.borrow().clone()))
        }
        "clear" => {
            args.expect(name, 0, 0)?;
            dict.borrow_mut().clear();
            Ok(Value::None)
        }
        _ => unreachable!("lookup only yields known dict methods"),
    }
}

// ── set ──

fn to_set(interp: &Interpreter, value: &Value) -> Result<SetMap, ScriptError> {
    if let Value::Set(set) = value {
        return Ok(set.borrow().clone());
    }
    let mut out = SetMap::new();
    for item in interp.iterate(value)? {
        out.insert(item.hash_key()?, item);
    }
    Ok(out)
}

fn set_method(
    interp: &mut Interpreter,
    receiver: &Value,
    name: &'static str,
    args: CallArgs,
) -> Result<Value, ScriptError> {
    let Value::Set(set) = receiver else {
        unreachable!("set_method called on a set");
    };
    match name {
        "add" => {
            args.expect(name, 1, 1)?;
            let item = args.positional[0].clone();
            let key = item.hash_key()?;
            interp.check_len(set.borrow().len() + 1)?;
            set.borrow_mut().entry(key).or_insert(item);
            Ok(Value::None)
        }
        "remove" | "discard" => {
            args.expect(name, 1, 1)?;
            let key = args.positional[0].hash_key()?;
            let removed = set.borrow_mut().shift_remove(&key);
            if removed.is_none() && name == "remove" {
                return Err(ScriptError::raise("KeyError", args.positional[0].py_repr()));
            }
            Ok(Value::None)
        }
        "pop" => {
            args.expect(name, 0, 0)?;
            let first = set.borrow_mut().shift_remove_index(0);
            first
                .map(|(_, item)| item)
                .ok_or_else(|| ScriptError::raise("KeyError", "'pop from an empty set'"))
        }
        "union" | "intersection" | "difference" | "symmetric_difference" | "update" => {
            args.expect(name, 0, usize::MAX)?;
            let mut acc = set.borrow().clone();
            for other in &args.positional {
                let other = to_set(interp, other)?;
                acc = match name {
                    "union" | "update" => {
                        let mut merged = acc;
                        for (key, item) in other {
                            merged.entry(key).or_insert(item);
                        }
                        merged
                    }
                    "intersection" => acc
                        .into_iter()
                        .filter(|(key, _)| other.contains_key(key))
                        .collect(),
                    "difference" => acc
                        .into_iter()
                        .filter(|(key, _)| !other.contains_key(key))
                        .collect(),
                    _ => {
                        let mut merged: SetMap = acc
                            .iter()
                            .filter(|(key, _)| !other.contains_key(*key))
                            .map(|(key, item)| (key.clone(), item.clone()))
                            .collect();
                        for (key, item) in other {
                            if !acc.contains_key(&key) {
                                merged.insert(key, item);
                            }
                        }
                        merged
                    }
                };
                interp.check_len(acc.len())?;
            }
            if name == "update" {
                *set.borrow_mut() = acc;
                Ok(Value::None)
            } else {
                Ok(Value::set(acc))
            }
        }
        "issubset" | "issuperset" | "isdisjoint" => {
            args.expect(name, 1, 1)?;
            let other = to_set(interp, &args.positional[0])?;
            let mine = set.borrow();
            Ok(Value::Bool(match name {
                "issubset" => mine.keys().all(|key| other.contains_key(key)),
                "issuperset" => other.keys().all(|key| mine.contains_key(key)),
                _ => !mine.keys().any(|key| other.contains_key(key)),
            }))
        }
        "copy" => {
            args.expect(name, 0, 0)?;
            Ok(Value::set(set.borrow().clone()))
        }
        "clear" => {
            args.expect(name, 0, 0)?;
            set.borrow_mut().clear();
            Ok(Value::None)
        }
        _ => unreachable!("lookup only yields known set methods"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{Program, SandboxPolicy};
    use pretty_assertions::assert_eq;
    use std::time::{Duration, Instant};

    fn run(body: &str) -> Result<Value, ScriptError> {
        let source = format!("def main():\n{body}\n");
        let program = Program::compile(&source)?;
        let mut interp = Interpreter::new(
            SandboxPolicy::sandboxed(1_000_000),
            Instant::now() + Duration::from_secs(5),
        );
        interp.run_module(program.module())?;
        interp.call_global("main", Vec::new(), Vec::new())
    }

    fn show(expr: &str) -> String {
        run(&format!("    return {expr}")).expect("evaluates").py_repr()
    }

    // ── str ──

    #[test]
    fn test_str_case_and_strip() {
        assert_eq!(show("'Hello World'.upper()"), "'HELLO WORLD'");
        assert_eq!(show("'hello world'.title()"), "'Hello World'");
        assert_eq!(show("'hELLO'.capitalize()"), "'Hello'");
        assert_eq!(show("'  pad  '.strip()"), "'pad'");
        assert_eq!(show("'xxhixx'.lstrip('x')"), "'hixx'");
    }

    #[test]
    fn test_str_split_variants() {
        assert_eq!(show("'  a  b c '.split()"), "['a', 'b', 'c']");
        assert_eq!(show("'a,b,,c'.split(',')"), "['a', 'b', '', 'c']");
        assert_eq!(show("'a b c d'.split(maxsplit=2)"), "['a', 'b', 'c d']");
        assert_eq!(show("'a.b.c'.rsplit('.', 1)"), "['a.b', 'c']");
        assert_eq!(show("'one\\ntwo\\r\\nthree'.splitlines()"), "['one', 'two', 'three']");
    }

    #[test]
    fn test_str_search() {
        assert_eq!(show("'hello'.find('l'), 'hello'.rfind('l'), 'hello'.find('z')"), "(2, 3, -1)");
        assert_eq!(show("'héllo'.index('l')"), "2");
        assert_eq!(show("'banana'.count('an')"), "2");
        assert_eq!(show("'test.py'.endswith(('.rs', '.py'))"), "True");
        assert_eq!(show("'a=b=c'.partition('=')"), "('a', '=', 'b=c')");
        assert!(run("    return 'abc'.index('z')").is_err());
    }

    #[test]
    fn test_str_join_replace_pad() {
        assert_eq!(show("'-'.join(['a', 'b', 'c'])"), "'a-b-c'");
        assert_eq!(show("'aaa'.replace('a', 'b', 2)"), "'bba'");
        assert_eq!(show("'ab'.center(6, '*')"), "'**ab**'");
        assert_eq!(show("'abc'.center(6)"), "' abc  '");
        assert_eq!(show("'-42'.zfill(5)"), "'-0042'");
        assert_eq!(show("'{} is {n}'.format('x', n=3)"), "'x is 3'");
        assert!(run("    return ', '.join([1, 2])").is_err());
    }

    #[test]
    fn test_padding_widths_are_bounded() {
        for expr in ["'a'.ljust(10 ** 15)", "'a'.center(10 ** 15)", "'7'.zfill(10 ** 15)"] {
            match run(&format!("    return {expr}")) {
                Err(ScriptError::Raised(exc)) => assert_eq!(exc.kind, "MemoryError"),
                other => panic!("{expr} should raise MemoryError, got {other:?}"),
            }
        }
    }

    // ── list ──

    #[test]
    fn test_list_mutation() {
        let body = "    xs = [3, 1, 2]\n    xs.append(4)\n    xs.insert(0, 9)\n    xs.remove(1)\n    last = xs.pop()\n    xs.sort()\n    return xs, last";
        assert_eq!(run(body).unwrap().py_repr(), "([2, 3, 9], 4)");
    }

    #[test]
    fn test_list_sort_with_key_is_stable() {
        let body = "    xs = ['bb', 'a', 'cc', 'd']\n    xs.sort(key=len, reverse=True)\n    return xs";
        assert_eq!(run(body).unwrap().py_repr(), "['bb', 'cc', 'a', 'd']");
    }

    #[test]
    fn test_pop_empty_list_raises_index_error() {
        match run("    return [].pop()") {
            Err(ScriptError::Raised(exc)) => assert_eq!(exc.kind, "IndexError"),
            other => panic!("unexpected {other:?}"),
        }
    }

    // ── dict / set ──

    #[test]
    fn test_dict_methods() {
        let body = "    d = {'a': 1}\n    d.update(b=2)\n    d.setdefault('c', 3)\n    v = d.pop('a')\n    return v, d.get('z', 0), list(d.items())";
        assert_eq!(run(body).unwrap().py_repr(), "(1, 0, [('b', 2), ('c', 3)])");
    }

    #[test]
    fn test_missing_dict_key_raises_key_error() {
        match run("    return {}.pop('k')") {
            Err(ScriptError::Raised(exc)) => assert_eq!(exc.to_string(), "KeyError: 'k'"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_set_algebra() {
        assert_eq!(show("sorted({1, 2, 3}.intersection([2, 3, 4]))"), "[2, 3]");
        assert_eq!(show("sorted({1, 2}.union({3}))"), "[1, 2, 3]");
        assert_eq!(show("sorted({1, 2, 3}.symmetric_difference({3, 4}))"), "[1, 2, 4]");
        assert_eq!(show("{1}.issubset([1, 2])"), "True");
    }

    #[test]
    fn test_number_methods() {
        assert_eq!(show("(2.0).is_integer(), (255).bit_length()"), "(True, 8)");
    }
}
