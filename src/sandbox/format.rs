//! Number rendering and the three string formatting dialects scripts use:
//! format specs (`format(x, ".2f")`, f-strings), `str.format` templates and
//! printf-style `%` interpolation.

use super::ScriptError;
use super::value::Value;

/// `repr()` of a float: shortest round-trip digits, exponent form outside
/// `1e-4 <= |x| < 1e16`.
pub fn format_float(x: f64) -> String {
    if x.is_nan() {
        return "nan".to_string();
    }
    if x.is_infinite() {
        return if x > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if x == 0.0 {
        return if x.is_sign_negative() { "-0.0" } else { "0.0" }.to_string();
    }
    let sci = format!("{:e}", x);
    let (mantissa, exp) = split_exponent(&sci);
    if (-4..16).contains(&exp) {
        let fixed = format!("{}", x);
        if fixed.contains('.') {
            fixed
        } else {
            format!("{fixed}.0")
        }
    } else {
        format!("{mantissa}e{}", exponent_suffix(exp))
    }
}

fn split_exponent(sci: &str) -> (&str, i32) {
    match sci.split_once(['e', 'E']) {
        Some((mantissa, exp)) => (mantissa, exp.parse().unwrap_or(0)),
        None => (sci, 0),
    }
}

fn exponent_suffix(exp: i32) -> String {
    let sign = if exp < 0 { '-' } else { '+' };
    format!("{sign}{:02}", exp.abs())
}

#[derive(Debug, Clone, PartialEq)]
struct Spec {
    fill: char,
    align: Option<char>,
    sign: char,
    alternate: bool,
    zero: bool,
    width: usize,
    grouping: Option<char>,
    precision: Option<usize>,
    kind: Option<char>,
}

impl Default for Spec {
    fn default() -> Self {
        Self {
            fill: ' ',
            align: None,
            sign: '-',
            alternate: false,
            zero: false,
            width: 0,
            grouping: None,
            precision: None,
            kind: None,
        }
    }
}

fn invalid_spec(spec: &str) -> ScriptError {
    ScriptError::raise("ValueError", format!("Invalid format specifier '{spec}'"))
}

fn parse_spec(spec: &str) -> Result<Spec, ScriptError> {
    let chars: Vec<char> = spec.chars().collect();
    let mut out = Spec::default();
    let mut i = 0;

    let is_align = |c: char| matches!(c, '<' | '>' | '^' | '=');
    if chars.len() >= 2 && is_align(chars[1]) {
        out.fill = chars[0];
        out.align = Some(chars[1]);
        i = 2;
    } else if chars.first().copied().is_some_and(is_align) {
        out.align = Some(chars[0]);
        i = 1;
    }
    if let Some(&c) = chars.get(i)
        && matches!(c, '+' | '-' | ' ')
    {
        out.sign = c;
        i += 1;
    }
    if chars.get(i) == Some(&'#') {
        out.alternate = true;
        i += 1;
    }
    if chars.get(i) == Some(&'0') {
        out.zero = true;
        i += 1;
    }
    let start = i;
    while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
        i += 1;
    }
    if i > start {
        let digits: String = chars[start..i].iter().collect();
        out.width = digits.parse().map_err(|_| invalid_spec(spec))?;
    }
    if let Some(&c) = chars.get(i)
        && matches!(c, ',' | '_')
    {
        out.grouping = Some(c);
        i += 1;
    }
    if chars.get(i) == Some(&'.') {
        i += 1;
        let start = i;
        while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
            i += 1;
        }
        if i == start {
            return Err(ScriptError::raise("ValueError", "Format specifier missing precision"));
        }
        let digits: String = chars[start..i].iter().collect();
        out.precision = Some(digits.parse().map_err(|_| invalid_spec(spec))?);
    }
    if let Some(&c) = chars.get(i) {
        out.kind = Some(c);
        i += 1;
    }
    if i != chars.len() || out.width > 10_000 {
        return Err(invalid_spec(spec));
    }
    Ok(out)
}

/// `format(value, spec)`.
pub fn format_value(value: &Value, spec: &str) -> Result<String, ScriptError> {
    if spec.is_empty() {
        return Ok(value.py_str());
    }
    let parsed = parse_spec(spec)?;
    match value {
        Value::Str(s) => format_text(s, &parsed),
        Value::Bool(b) => format_int(*b as i64, &parsed),
        Value::Int(i) => format_int(*i, &parsed),
        Value::Float(f) => format_float_spec(*f, &parsed),
        other => Err(ScriptError::raise(
            "TypeError",
            format!(
                "unsupported format string passed to {}.__format__",
                other.type_name()
            ),
        )),
    }
}

fn unknown_code(kind: char, type_name: &str) -> ScriptError {
    ScriptError::raise(
        "ValueError",
        format!("Unknown format code '{kind}' for object of type '{type_name}'"),
    )
}

fn format_text(s: &str, spec: &Spec) -> Result<String, ScriptError> {
    if let Some(kind) = spec.kind
        && kind != 's'
    {
        return Err(unknown_code(kind, "str"));
    }
    let text: String = match spec.precision {
        Some(p) => s.chars().take(p).collect(),
        None => s.to_string(),
    };
    Ok(pad(&text, spec.fill, spec.align.unwrap_or('<'), spec.width))
}

fn format_int(i: i64, spec: &Spec) -> Result<String, ScriptError> {
    let magnitude = i.unsigned_abs();
    let body = match spec.kind {
        None | Some('d') | Some('n') => magnitude.to_string(),
        Some('x') => prefixed(spec, "0x", format!("{magnitude:x}")),
        Some('X') => prefixed(spec, "0X", format!("{magnitude:X}")),
        Some('o') => prefixed(spec, "0o", format!("{magnitude:o}")),
        Some('b') => prefixed(spec, "0b", format!("{magnitude:b}")),
        Some('c') => {
            let c = u32::try_from(i)
                .ok()
                .and_then(char::from_u32)
                .ok_or_else(|| ScriptError::raise("OverflowError", "%c arg not in range"))?;
            return Ok(pad(&c.to_string(), spec.fill, spec.align.unwrap_or('<'), spec.width));
        }
        Some('e' | 'E' | 'f' | 'F' | 'g' | 'G' | '%') => {
            return format_float_spec(i as f64, spec);
        }
        Some(kind) => return Err(unknown_code(kind, "int")),
    };
    Ok(finish_number(i < 0, body, spec))
}

fn prefixed(spec: &Spec, prefix: &str, digits: String) -> String {
    if spec.alternate {
        format!("{prefix}{digits}")
    } else {
        digits
    }
}

fn format_float_spec(x: f64, spec: &Spec) -> Result<String, ScriptError> {
    let negative = x.is_sign_negative() && !x.is_nan();
    let magnitude = x.abs();
    let upper = matches!(spec.kind, Some('E' | 'F' | 'G'));
    let body = if !magnitude.is_finite() {
        let text = if magnitude.is_nan() { "nan" } else { "inf" };
        let text = if upper {
            text.to_uppercase()
        } else {
            text.to_string()
        };
        if spec.kind == Some('%') {
            format!("{text}%")
        } else {
            text
        }
    } else {
        match spec.kind {
            None => match spec.precision {
                Some(p) => general(magnitude, p, spec.alternate, false),
                None => format_float(magnitude),
            },
            Some('f' | 'F') => format!("{:.*}", spec.precision.unwrap_or(6), magnitude),
            Some('e' | 'E') => {
                let text = scientific(magnitude, spec.precision.unwrap_or(6));
                if upper { text.to_uppercase() } else { text }
            }
            Some('g' | 'G') => {
                let text = general(magnitude, spec.precision.unwrap_or(6), spec.alternate, true);
                if upper { text.to_uppercase() } else { text }
            }
            Some('%') => format!("{:.*}%", spec.precision.unwrap_or(6), magnitude * 100.0),
            Some(kind) => return Err(unknown_code(kind, "float")),
        }
    };
    Ok(finish_number(negative, body, spec))
}

fn scientific(x: f64, precision: usize) -> String {
    let raw = format!("{:.*e}", precision, x);
    let (mantissa, exp) = split_exponent(&raw);
    format!("{mantissa}e{}", exponent_suffix(exp))
}

/// `g` presentation. `strip_always` distinguishes an explicit `g` from the
/// implicit presentation used when only a precision is given.
fn general(x: f64, precision: usize, alternate: bool, strip_always: bool) -> String {
    let p = precision.max(1);
    let exp = if x == 0.0 {
        0
    } else {
        split_exponent(&format!("{:.*e}", p - 1, x)).1
    };
    let strip = |s: String| -> String {
        if alternate || !s.contains('.') {
            return s;
        }
        let trimmed = s.trim_end_matches('0').trim_end_matches('.');
        if !strip_always && !trimmed.contains('.') && trimmed.len() < s.len() {
            format!("{trimmed}.0")
        } else {
            trimmed.to_string()
        }
    };
    if exp >= -4 && (exp as i64) < p as i64 {
        let decimals = (p as i64 - 1 - exp as i64).max(0) as usize;
        strip(format!("{:.*}", decimals, x))
    } else {
        let raw = format!("{:.*e}", p - 1, x);
        let (mantissa, exp) = split_exponent(&raw);
        format!("{}e{}", strip(mantissa.to_string()), exponent_suffix(exp))
    }
}

fn group_digits(body: &str, separator: char) -> String {
    let digits_end = body
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(body.len());
    let (int_part, rest) = body.split_at(digits_end);
    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, c) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(separator);
        }
        grouped.push(c);
    }
    grouped.push_str(rest);
    grouped
}

fn finish_number(negative: bool, body: String, spec: &Spec) -> String {
    let body = match spec.grouping {
        Some(sep) => group_digits(&body, sep),
        None => body,
    };
    let sign = match (negative, spec.sign) {
        (true, _) => "-",
        (false, '+') => "+",
        (false, ' ') => " ",
        _ => "",
    };
    let (fill, align) = match spec.align {
        Some(align) => (spec.fill, align),
        None if spec.zero => ('0', '='),
        None => (spec.fill, '>'),
    };
    if align == '=' {
        let len = sign.chars().count() + body.chars().count();
        let padding: String = std::iter::repeat_n(fill, spec.width.saturating_sub(len)).collect();
        return format!("{sign}{padding}{body}");
    }
    pad(&format!("{sign}{body}"), fill, align, spec.width)
}

fn pad(text: &str, fill: char, align: char, width: usize) -> String {
    let len = text.chars().count();
    if len >= width {
        return text.to_string();
    }
    let total = width - len;
    let (left, right) = match align {
        '>' | '=' => (total, 0),
        '^' => (total / 2, total - total / 2),
        _ => (0, total),
    };
    let mut out = String::with_capacity(width);
    out.extend(std::iter::repeat_n(fill, left));
    out.push_str(text);
    out.extend(std::iter::repeat_n(fill, right));
    out
}

/// Printf-style `template % args`.
pub fn percent_format(template: &str, args: &Value) -> Result<String, ScriptError> {
    let positional: Vec<Value> = match args {
        Value::Tuple(items) => items.as_ref().clone(),
        Value::Dict(_) => Vec::new(),
        other => vec![other.clone()],
    };
    let mapping = match args {
        Value::Dict(_) => Some(args),
        _ => None,
    };
    let mut next = 0usize;
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::with_capacity(template.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        i += 1;
        if c != '%' {
            out.push(c);
            continue;
        }
        if chars.get(i) == Some(&'%') {
            out.push('%');
            i += 1;
            continue;
        }
        let mut key = None;
        if chars.get(i) == Some(&'(') {
            let close = chars[i..]
                .iter()
                .position(|&c| c == ')')
                .ok_or_else(|| ScriptError::raise("ValueError", "incomplete format key"))?;
            key = Some(chars[i + 1..i + close].iter().collect::<String>());
            i += close + 1;
        }
        let mut spec = Spec::default();
        let mut left = false;
        while let Some(&flag) = chars.get(i) {
            match flag {
                '-' => left = true,
                '+' | ' ' => spec.sign = flag,
                '0' => spec.zero = true,
                '#' => spec.alternate = true,
                _ => break,
            }
            i += 1;
        }
        let start = i;
        while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
            i += 1;
        }
        if i > start {
            spec.width = chars[start..i]
                .iter()
                .collect::<String>()
                .parse()
                .unwrap_or(0);
        }
        if chars.get(i) == Some(&'.') {
            i += 1;
            let start = i;
            while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
                i += 1;
            }
            spec.precision = Some(
                chars[start..i]
                    .iter()
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0),
            );
        }
        let kind = *chars
            .get(i)
            .ok_or_else(|| ScriptError::raise("ValueError", "incomplete format"))?;
        i += 1;
        if left {
            spec.align = Some('<');
            spec.zero = false;
        }

        let arg = match (&key, mapping) {
            (Some(key), Some(Value::Dict(map))) => {
                let hash = Value::str(key.as_str()).hash_key()?;
                map.borrow()
                    .get(&hash)
                    .map(|(_, v)| v.clone())
                    .ok_or_else(|| ScriptError::raise("KeyError", super::value::repr_str(key)))?
            }
            (Some(_), _) => {
                return Err(ScriptError::raise("TypeError", "format requires a mapping"));
            }
            (None, Some(map)) => map.clone(),
            (None, None) => {
                let arg = positional.get(next).cloned().ok_or_else(|| {
                    ScriptError::raise("TypeError", "not enough arguments for format string")
                })?;
                next += 1;
                arg
            }
        };

        let piece = match kind {
            's' | 'r' | 'a' => {
                let text = if kind == 's' { arg.py_str() } else { arg.py_repr() };
                spec.kind = None;
                spec.align = Some(spec.align.unwrap_or('>'));
                format_text(&text, &spec)?
            }
            'd' | 'i' | 'u' => {
                spec.kind = Some('d');
                format_int(percent_int(&arg, kind)?, &spec)?
            }
            'x' | 'X' | 'o' => {
                spec.kind = Some(kind);
                format_int(percent_int(&arg, kind)?, &spec)?
            }
            'c' => {
                spec.kind = None;
                let text = match &arg {
                    Value::Str(s) if s.chars().count() == 1 => s.to_string(),
                    other => {
                        let code = percent_int(other, kind)?;
                        u32::try_from(code)
                            .ok()
                            .and_then(char::from_u32)
                            .map(String::from)
                            .ok_or_else(|| ScriptError::raise("OverflowError", "%c arg not in range"))?
                    }
                };
                format_text(&text, &spec)?
            }
            'f' | 'F' | 'e' | 'E' | 'g' | 'G' => {
                spec.kind = Some(kind);
                let x = arg.as_float().ok_or_else(|| {
                    ScriptError::raise(
                        "TypeError",
                        format!("must be real number, not {}", arg.type_name()),
                    )
                })?;
                format_float_spec(x, &spec)?
            }
            other => {
                return Err(ScriptError::raise(
                    "ValueError",
                    format!("unsupported format character '{other}'"),
                ));
            }
        };
        out.push_str(&piece);
    }
    if mapping.is_none() && next < positional.len() {
        return Err(ScriptError::raise(
            "TypeError",
            "not all arguments converted during string formatting",
        ));
    }
    Ok(out)
}

fn percent_int(arg: &Value, kind: char) -> Result<i64, ScriptError> {
    match arg {
        Value::Float(f) if kind == 'd' || kind == 'i' || kind == 'u' => Ok(f.trunc() as i64),
        other => other.as_int().ok_or_else(|| {
            ScriptError::raise(
                "TypeError",
                format!(
                    "%{kind} format: an integer is required, not {}",
                    other.type_name()
                ),
            )
        }),
    }
}

/// `template.format(*args, **kwargs)`.
pub fn format_template(
    template: &str,
    args: &[Value],
    kwargs: &[(String, Value)],
) -> Result<String, ScriptError> {
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::with_capacity(template.len());
    let mut auto_index = 0usize;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '{' if chars.get(i + 1) == Some(&'{') => {
                out.push('{');
                i += 2;
            }
            '}' if chars.get(i + 1) == Some(&'}') => {
                out.push('}');
                i += 2;
            }
            '}' => {
                return Err(ScriptError::raise(
                    "ValueError",
                    "Single '}' encountered in format string",
                ));
            }
            '{' => {
                let close = chars[i..].iter().position(|&c| c == '}').ok_or_else(|| {
                    ScriptError::raise("ValueError", "Single '{' encountered in format string")
                })?;
                let field: String = chars[i + 1..i + close].iter().collect();
                i += close + 1;
                out.push_str(&render_field(&field, args, kwargs, &mut auto_index)?);
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Ok(out)
}

fn render_field(
    field: &str,
    args: &[Value],
    kwargs: &[(String, Value)],
    auto_index: &mut usize,
) -> Result<String, ScriptError> {
    let (head, spec) = match field.split_once(':') {
        Some((head, spec)) => (head, spec),
        None => (field, ""),
    };
    let (name, conversion) = match head.split_once('!') {
        Some((name, conv)) => (name, Some(conv)),
        None => (head, None),
    };
    let (base, index) = match name.split_once('[') {
        Some((base, rest)) => (base, Some(rest.trim_end_matches(']'))),
        None => (name, None),
    };

    let mut value = if base.is_empty() {
        let idx = *auto_index;
        *auto_index += 1;
        positional_arg(args, idx)?
    } else if let Ok(idx) = base.parse::<usize>() {
        positional_arg(args, idx)?
    } else {
        kwargs
            .iter()
            .find(|(key, _)| key == base)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| ScriptError::raise("KeyError", super::value::repr_str(base)))?
    };

    if let Some(index) = index {
        value = match &value {
            Value::Dict(map) => {
                let key = Value::str(index).hash_key()?;
                map.borrow()
                    .get(&key)
                    .map(|(_, v)| v.clone())
                    .ok_or_else(|| ScriptError::raise("KeyError", super::value::repr_str(index)))?
            }
            Value::List(_) | Value::Tuple(_) => {
                let idx: usize = index.parse().map_err(|_| {
                    ScriptError::raise("TypeError", "list indices must be integers")
                })?;
                let item = match &value {
                    Value::List(items) => items.borrow().get(idx).cloned(),
                    Value::Tuple(items) => items.get(idx).cloned(),
                    _ => None,
                };
                item.ok_or_else(|| ScriptError::raise("IndexError", "index out of range"))?
            }
            other => {
                return Err(ScriptError::raise(
                    "TypeError",
                    format!("'{}' object is not subscriptable", other.type_name()),
                ));
            }
        };
    }

    let value = match conversion {
        Some("r") | Some("a") => Value::str(value.py_repr()),
        Some("s") => Value::str(value.py_str()),
        None => value,
        Some(other) => {
            return Err(ScriptError::raise(
                "ValueError",
                format!("Unknown conversion specifier {other}"),
            ));
        }
    };
    format_value(&value, spec)
}

fn positional_arg(args: &[Value], idx: usize) -> Result<Value, ScriptError> {
    args.get(idx).cloned().ok_or_else(|| {
        ScriptError::raise(
            "IndexError",
            format!("Replacement index {idx} out of range for positional args tuple"),
        )
    })
}
