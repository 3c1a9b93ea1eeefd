//! Tokenizer for the script language.
//!
//! Individual token classes (names, numbers, string literals) are recognized
//! with `nom` scanners; the driver loop around them tracks indentation and
//! bracket depth to emit `Indent` / `Dedent` / `Newline` the way an
//! indentation-structured language needs.

use nom::IResult;
use nom::branch::alt;
use nom::bytes::complete::{tag, tag_no_case, take_while, take_while1};
use nom::character::complete::{char, digit0, digit1, hex_digit1, one_of};
use nom::combinator::{map, opt, recognize};
use nom::error::{ErrorKind, ParseError};
use nom::sequence::{pair, preceded, tuple};

use super::ScriptError;

pub const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if",
    "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try",
    "while", "with", "yield",
];

/// Longest operators first so prefixes never shadow them.
const OPERATORS: &[&str] = &[
    "**=", "//=", ">>=", "<<=", "...", "**", "//", "==", "!=", "<=", ">=", "+=", "-=", "*=", "/=",
    "%=", "&=", "|=", "^=", "->", ":=", "<<", ">>", "+", "-", "*", "/", "%", "<", ">", "=", "(",
    ")", "[", "]", "{", "}", ",", ":", ".", ";", "@", "&", "|", "^", "~",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Name(String),
    Keyword(&'static str),
    Int(i64),
    Float(f64),
    Str(String),
    /// Body of an f-string with escapes already processed.
    FStr(String),
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub line: usize,
}

#[derive(Debug)]
struct ScanError<'a> {
    #[allow(dead_code)]
    input: &'a str,
    message: Option<&'static str>,
}

impl<'a> ParseError<&'a str> for ScanError<'a> {
    fn from_error_kind(input: &'a str, _kind: ErrorKind) -> Self {
        Self {
            input,
            message: None,
        }
    }

    fn append(_input: &'a str, _kind: ErrorKind, other: Self) -> Self {
        other
    }
}

type ScanResult<'a, T> = IResult<&'a str, T, ScanError<'a>>;

fn fail<'a, T>(input: &'a str, message: &'static str) -> ScanResult<'a, T> {
    Err(nom::Err::Failure(ScanError {
        input,
        message: Some(message),
    }))
}

fn identifier(input: &str) -> ScanResult<'_, &str> {
    recognize(pair(
        take_while1(|c: char| c.is_alphabetic() || c == '_'),
        take_while(|c: char| c.is_alphanumeric() || c == '_'),
    ))(input)
}

fn word(input: &str) -> ScanResult<'_, Tok> {
    map(identifier, |name: &str| {
        match KEYWORDS.iter().find(|k| **k == name) {
            Some(keyword) => Tok::Keyword(*keyword),
            None => Tok::Name(name.to_string()),
        }
    })(input)
}

fn hex_literal(input: &str) -> ScanResult<'_, &str> {
    preceded(alt((tag("0x"), tag("0X"))), hex_digit1)(input)
}

fn decimal_literal(input: &str) -> ScanResult<'_, &str> {
    recognize(pair(
        alt((
            recognize(pair(digit1, opt(pair(char('.'), digit0)))),
            recognize(pair(char('.'), digit1)),
        )),
        opt(tuple((one_of("eE"), opt(one_of("+-")), digit1))),
    ))(input)
}

fn number(input: &str) -> ScanResult<'_, Tok> {
    if let Ok((rest, digits)) = hex_literal(input) {
        return match i64::from_str_radix(digits, 16) {
            Ok(value) => Ok((rest, Tok::Int(value))),
            Err(_) => fail(input, "integer literal too large"),
        };
    }
    let (rest, text) = decimal_literal(input)?;
    if text.contains(['.', 'e', 'E']) {
        match text.parse::<f64>() {
            Ok(value) => Ok((rest, Tok::Float(value))),
            Err(_) => fail(input, "invalid float literal"),
        }
    } else {
        match text.parse::<i64>() {
            Ok(value) => Ok((rest, Tok::Int(value))),
            Err(_) => fail(input, "integer literal too large"),
        }
    }
}

fn string_prefix(input: &str) -> ScanResult<'_, &str> {
    alt((
        tag_no_case("rf"),
        tag_no_case("fr"),
        tag_no_case("rb"),
        tag_no_case("br"),
        tag_no_case("r"),
        tag_no_case("f"),
        tag_no_case("b"),
        tag_no_case("u"),
    ))(input)
}

fn quote(input: &str) -> ScanResult<'_, &str> {
    alt((tag("\"\"\""), tag("'''"), tag("\""), tag("'")))(input)
}

fn string_literal(input: &str) -> ScanResult<'_, Tok> {
    let (rest, prefix) = opt(string_prefix)(input)?;
    let (body, delim) = quote(rest)?;
    let prefix = prefix.unwrap_or("").to_ascii_lowercase();
    if prefix.contains('b') {
        return fail(input, "bytes literals are not supported");
    }
    match string_body(body, delim, prefix.contains('r')) {
        Ok((rest, text)) if prefix.contains('f') => Ok((rest, Tok::FStr(text))),
        Ok((rest, text)) => Ok((rest, Tok::Str(text))),
        Err(message) => fail(input, message),
    }
}

fn read_hex_escape(
    iter: &mut std::str::CharIndices<'_>,
    digits: usize,
) -> Result<char, &'static str> {
    let mut code = 0u32;
    for _ in 0..digits {
        let Some((_, h)) = iter.next() else {
            return Err("truncated escape sequence");
        };
        let Some(d) = h.to_digit(16) else {
            return Err("invalid escape sequence");
        };
        code = code * 16 + d;
    }
    char::from_u32(code).ok_or("invalid escape sequence")
}

/// Scan a string body up to its closing delimiter, processing escapes.
fn string_body<'a>(
    body: &'a str,
    delim: &str,
    raw: bool,
) -> Result<(&'a str, String), &'static str> {
    let mut out = String::new();
    let mut iter = body.char_indices();
    while let Some((i, c)) = iter.next() {
        if body[i..].starts_with(delim) {
            return Ok((&body[i + delim.len()..], out));
        }
        match c {
            '\n' if delim.len() == 1 => return Err("unterminated string literal"),
            '\\' => {
                let Some((_, next)) = iter.next() else {
                    return Err("unterminated string literal");
                };
                if raw {
                    out.push('\\');
                    out.push(next);
                    continue;
                }
                match next {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    '0' => out.push('\0'),
                    'a' => out.push('\x07'),
                    'b' => out.push('\x08'),
                    'f' => out.push('\x0c'),
                    'v' => out.push('\x0b'),
                    '\\' | '\'' | '"' => out.push(next),
                    '\n' => {}
                    'x' => out.push(read_hex_escape(&mut iter, 2)?),
                    'u' => out.push(read_hex_escape(&mut iter, 4)?),
                    'U' => out.push(read_hex_escape(&mut iter, 8)?),
                    other => {
                        out.push('\\');
                        out.push(other);
                    }
                }
            }
            _ => out.push(c),
        }
    }
    Err("unterminated string literal")
}

fn token(input: &str) -> ScanResult<'_, Tok> {
    alt((string_literal, number, word))(input)
}

/// Measure leading indentation. Tabs advance to the next multiple of 8.
fn indentation(input: &str) -> (&str, usize) {
    let mut width = 0;
    for (i, c) in input.char_indices() {
        match c {
            ' ' => width += 1,
            '\t' => width = (width / 8 + 1) * 8,
            '\x0c' => width = 0,
            _ => return (&input[i..], width),
        }
    }
    ("", width)
}

fn skip_comment(input: &str) -> &str {
    match input.find('\n') {
        Some(idx) => &input[idx..],
        None => "",
    }
}

struct Lexer {
    tokens: Vec<Token>,
    indents: Vec<usize>,
    depth: usize,
    line: usize,
}

impl Lexer {
    fn error(&self, message: impl Into<String>) -> ScriptError {
        ScriptError::Syntax {
            line: self.line,
            message: message.into(),
        }
    }

    fn push(&mut self, tok: Tok) {
        self.tokens.push(Token {
            tok,
            line: self.line,
        });
    }

    fn push_newline(&mut self) {
        if !matches!(
            self.tokens.last(),
            None | Some(Token {
                tok: Tok::Newline,
                ..
            })
        ) {
            self.push(Tok::Newline);
        }
    }

    fn indent_to(&mut self, width: usize) -> Result<(), ScriptError> {
        let current = self.indents.last().copied().unwrap_or(0);
        if width > current {
            self.indents.push(width);
            self.push(Tok::Indent);
        } else if width < current {
            while width < self.indents.last().copied().unwrap_or(0) {
                self.indents.pop();
                self.push(Tok::Dedent);
            }
            if width != self.indents.last().copied().unwrap_or(0) {
                return Err(self.error("unindent does not match any outer indentation level"));
            }
        }
        Ok(())
    }

    fn scan<'a>(&mut self, rest: &'a str) -> Result<&'a str, ScriptError> {
        match token(rest) {
            Ok((after, tok)) => {
                let consumed = &rest[..rest.len() - after.len()];
                self.push(tok);
                self.line += consumed.matches('\n').count();
                Ok(after)
            }
            Err(nom::Err::Failure(e)) => Err(self.error(e.message.unwrap_or("invalid token"))),
            Err(_) => {
                let Some(op) = OPERATORS.iter().find(|op| rest.starts_with(**op)) else {
                    let c = rest.chars().next().unwrap_or(' ');
                    return Err(self.error(format!("invalid character '{c}'")));
                };
                match *op {
                    "(" | "[" | "{" => self.depth += 1,
                    ")" | "]" | "}" => self.depth = self.depth.saturating_sub(1),
                    _ => {}
                }
                self.push(Tok::Op(*op));
                Ok(&rest[op.len()..])
            }
        }
    }

    fn run(&mut self, source: &str) -> Result<(), ScriptError> {
        let mut rest = source;
        let mut line_start = true;
        loop {
            if line_start && self.depth == 0 {
                let (after, width) = indentation(rest);
                match after.chars().next() {
                    None => break,
                    Some('\n') => {
                        rest = &after[1..];
                        self.line += 1;
                        continue;
                    }
                    Some('#') => {
                        rest = skip_comment(after);
                        continue;
                    }
                    Some(_) => {
                        self.indent_to(width)?;
                        rest = after;
                        line_start = false;
                    }
                }
            }

            rest = rest.trim_start_matches([' ', '\t', '\x0c']);
            let Some(c) = rest.chars().next() else {
                break;
            };
            match c {
                '#' => rest = skip_comment(rest),
                '\n' => {
                    rest = &rest[1..];
                    if self.depth == 0 {
                        self.push_newline();
                        line_start = true;
                    }
                    self.line += 1;
                }
                '\\' if rest[1..].starts_with('\n') => {
                    rest = &rest[2..];
                    self.line += 1;
                }
                _ => rest = self.scan(rest)?,
            }
        }

        if self.depth > 0 {
            return Err(self.error("unexpected EOF: unclosed bracket"));
        }
        self.push_newline();
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Tok::Dedent);
        }
        self.push(Tok::Eof);
        Ok(())
    }
}

/// Split source text into tokens.
pub fn tokenize(source: &str) -> Result<Vec<Token>, ScriptError> {
    let normalized = source.replace("\r\n", "\n");
    let mut lexer = Lexer {
        tokens: Vec::new(),
        indents: vec![0],
        depth: 0,
        line: 1,
    };
    lexer.run(&normalized)?;
    Ok(lexer.tokens)
}
