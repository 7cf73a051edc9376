use std::collections::HashMap;

use value::{scan_number, Value};

use crate::source_map::SourceMap;

/// Bound on nesting depth of aggregate literals.
const RECURSION_GUARD: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    Ok,
    UnexpectedEos,
    Error,
}

#[derive(Debug)]
pub enum ParseOutcome {
    Parsed { value: Value, map: SourceMap },
    Failed { message: &'static str },
}

/// Result of reading one form. `bytes_read` is how far into the input the
/// reader got: one past the form on success, the offending byte on a
/// structural error, the full length when the input ran out mid-form.
#[derive(Debug)]
pub struct ParseResult {
    pub status: ParseStatus,
    pub bytes_read: usize,
    pub outcome: ParseOutcome,
}

impl ParseResult {
    pub fn into_parsed(self) -> Result<(Value, SourceMap), &'static str> {
        match self.outcome {
            ParseOutcome::Parsed { value, map } => Ok((value, map)),
            ParseOutcome::Failed { message } => Err(message),
        }
    }

    pub fn error_message(&self) -> Option<&'static str> {
        match &self.outcome {
            ParseOutcome::Failed { message } => Some(message),
            _ => None,
        }
    }
}

/// Reads the first form from a byte buffer.
pub fn parse(src: &[u8]) -> ParseResult {
    let mut parser = Parser {
        src,
        pos: 0,
        stack: Vec::new(),
    };

    match parser.parse_form(RECURSION_GUARD) {
        Ok(()) => {
            let (value, map) = parser.stack.pop().expect("one parsed form on the stack");
            ParseResult {
                status: ParseStatus::Ok,
                bytes_read: parser.pos,
                outcome: ParseOutcome::Parsed { value, map },
            }
        }
        Err(Fail::Eos) => ParseResult {
            status: ParseStatus::UnexpectedEos,
            bytes_read: src.len(),
            outcome: ParseOutcome::Failed {
                message: "unexpected end of source",
            },
        },
        Err(Fail::At { message, pos }) => ParseResult {
            status: ParseStatus::Error,
            bytes_read: pos,
            outcome: ParseOutcome::Failed { message },
        },
    }
}

pub fn parse_str(src: &str) -> ParseResult {
    parse(src.as_bytes())
}

fn is_whitespace(c: u8) -> bool {
    matches!(c, b' ' | b'\t' | b'\n' | b'\r' | b'\0' | b',')
}

// Note the overlap with the whitespace set: a comma inside a token is a
// symbol character, a comma between tokens is whitespace.
fn is_symbol_char(c: u8) -> bool {
    matches!(c,
        b'a'..=b'z'
        | b'A'..=b'Z'
        | b'0'..=b':'
        | b'<'..=b'@'
        | b'*'..=b'/'
        | b'$'..=b'&'
        | b'_' | b'^' | b'!')
}

fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'A'..=b'F' => Some(10 + c - b'A'),
        b'a'..=b'f' => Some(10 + c - b'a'),
        _ => None,
    }
}

fn quote(x: Value) -> Value {
    Value::tuple(vec![Value::symbol("quote"), x])
}

enum Fail {
    /// Input exhausted mid-form; reported against the full input length.
    Eos,
    /// Structural error at a byte offset.
    At { message: &'static str, pos: usize },
}

/// Sub-mappings collected by an aggregate, if any. `None` marks an atom.
enum Sub {
    None,
    Seq(Vec<SourceMap>),
    Assoc(HashMap<Value, (SourceMap, SourceMap)>),
}

#[derive(Clone, Copy, PartialEq)]
enum AggregateKind {
    Tuple,
    Array,
    Struct,
    Table,
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
    /// Parsed forms paired with their mappings, in source order.
    stack: Vec<(Value, SourceMap)>,
}

impl<'a> Parser<'a> {
    /// Parses one form and pushes its value/mapping pair onto the stack.
    fn parse_form(&mut self, depth: u32) -> Result<(), Fail> {
        if depth == 0 {
            return Err(Fail::At {
                message: "recursed too deeply in parsing",
                pos: self.pos,
            });
        }

        // Skip whitespace while counting quote shorthands; a comment sends us
        // back around without dropping quotes already seen.
        let mut qcount = 0usize;
        loop {
            while let Some(&b) = self.src.get(self.pos) {
                if b == b'\'' {
                    qcount += 1;
                } else if !is_whitespace(b) {
                    break;
                }
                self.pos += 1;
            }
            match self.src.get(self.pos) {
                None => return Err(Fail::Eos),
                Some(b'#') => {
                    while self.pos < self.src.len() && self.src[self.pos] != b'\n' {
                        self.pos += 1;
                    }
                }
                Some(_) => break,
            }
        }

        let mapstart = self.pos;

        let (value, sub) = match self.src[self.pos] {
            b'"' => self.string_literal()?,
            b'(' => self.aggregate(depth, AggregateKind::Tuple)?,
            b'[' => self.aggregate(depth, AggregateKind::Array)?,
            b'{' => self.aggregate(depth, AggregateKind::Struct)?,
            // '@' opens a table only when the brace is immediately adjacent.
            b'@' if self.src.get(self.pos + 1) == Some(&b'{') => {
                self.aggregate(depth, AggregateKind::Table)?
            }
            _ => self.atom()?,
        };

        let map = match sub {
            Sub::None => SourceMap::Atom {
                start: mapstart,
                end: self.pos,
            },
            Sub::Seq(elems) => SourceMap::Seq {
                start: mapstart,
                end: self.pos,
                elems,
            },
            Sub::Assoc(entries) => SourceMap::Assoc {
                start: mapstart,
                end: self.pos,
                entries,
            },
        };

        // Quote wrappings share the inner form's mapping.
        let mut value = value;
        for _ in 0..qcount {
            value = quote(value);
        }

        self.stack.push((value, map));
        Ok(())
    }

    fn atom(&mut self) -> Result<(Value, Sub), Fail> {
        let start = self.pos;
        if !is_symbol_char(self.src[start]) {
            return Err(Fail::At {
                message: "unexpected character",
                pos: start,
            });
        }

        let mut end = start;
        while end < self.src.len() && is_symbol_char(self.src[end]) {
            end += 1;
        }
        let token = &self.src[start..end];

        let value = match scan_number(token) {
            Some(num) => num,
            None => match token {
                b"nil" => Value::Nil,
                b"false" => Value::Boolean(false),
                b"true" => Value::Boolean(true),
                _ => {
                    if token[0].is_ascii_digit() {
                        return Err(Fail::At {
                            message: "symbols cannot start with digits",
                            pos: start,
                        });
                    }
                    Value::symbol(token)
                }
            },
        };

        self.pos = end;
        Ok((value, Sub::None))
    }

    fn string_literal(&mut self) -> Result<(Value, Sub), Fail> {
        let src = self.src;
        self.pos += 1;
        let start = self.pos;

        // Pre-scan to the closing quote, validating escape shapes.
        let mut end = start;
        let mut has_escape = false;
        while end < src.len() && src[end] != b'"' {
            if src[end] == b'\\' {
                has_escape = true;
                end += 1;
                if end >= src.len() {
                    return Err(Fail::Eos);
                }
                end += if src[end] == b'h' { 3 } else { 1 };
                if end >= src.len() {
                    return Err(Fail::Eos);
                }
            } else {
                end += 1;
            }
        }
        if end >= src.len() {
            return Err(Fail::Eos);
        }

        let value = if has_escape {
            let mut buf = Vec::with_capacity(end - start);
            let mut i = start;
            while i < end {
                let b = src[i];
                i += 1;
                if b != b'\\' {
                    buf.push(b);
                    continue;
                }
                let escape = src[i];
                i += 1;
                match escape {
                    b'n' => buf.push(b'\n'),
                    b'r' => buf.push(b'\r'),
                    b't' => buf.push(b'\t'),
                    b'f' => buf.push(0x0C),
                    b'0' => buf.push(b'\0'),
                    b'"' => buf.push(b'"'),
                    b'\'' => buf.push(b'\''),
                    b'z' => buf.push(b'\0'),
                    b'e' => buf.push(0x1B),
                    b'h' => {
                        let hi = hex_digit(src[i]);
                        let lo = hex_digit(src[i + 1]);
                        i += 2;
                        match (hi, lo) {
                            (Some(hi), Some(lo)) => buf.push(16 * hi + lo),
                            _ => {
                                return Err(Fail::At {
                                    message: "invalid hex escape in string",
                                    pos: i,
                                })
                            }
                        }
                    }
                    _ => {
                        return Err(Fail::At {
                            message: "unknown string escape sequence",
                            pos: i,
                        })
                    }
                }
            }
            Value::string(buf)
        } else {
            Value::string(&src[start..end])
        };

        self.pos = end + 1;
        Ok((value, Sub::None))
    }

    fn aggregate(&mut self, depth: u32, kind: AggregateKind) -> Result<(Value, Sub), Fail> {
        let close = match kind {
            AggregateKind::Tuple => b')',
            AggregateKind::Array => b']',
            AggregateKind::Struct | AggregateKind::Table => b'}',
        };
        self.pos += if kind == AggregateKind::Table { 2 } else { 1 };

        let base = self.stack.len();
        loop {
            while self.pos < self.src.len() && is_whitespace(self.src[self.pos]) {
                self.pos += 1;
            }
            if self.pos >= self.src.len() {
                return Err(Fail::Eos);
            }
            if self.src[self.pos] == close {
                break;
            }
            self.parse_form(depth - 1)?;
        }
        self.pos += 1;

        let n = self.stack.len() - base;
        match kind {
            AggregateKind::Tuple | AggregateKind::Array => {
                let mut values = Vec::with_capacity(n);
                let mut maps = Vec::with_capacity(n);
                for (v, m) in self.stack.drain(base..) {
                    values.push(v);
                    maps.push(m);
                }
                let value = if kind == AggregateKind::Tuple {
                    Value::tuple(values)
                } else {
                    Value::array(values)
                };
                Ok((value, Sub::Seq(maps)))
            }
            AggregateKind::Struct | AggregateKind::Table => {
                if n % 2 == 1 {
                    return Err(Fail::At {
                        message: "struct literal needs an even number of arguments",
                        pos: self.pos,
                    });
                }
                let mut entries = HashMap::with_capacity(n / 2);
                let mut map_entries = HashMap::with_capacity(n / 2);
                // Pairs come off the top in reverse source order, so with a
                // duplicate key the textually first pair lands last and wins.
                while self.stack.len() > base {
                    let (val, val_map) = self.stack.pop().expect("pair value");
                    let (key, key_map) = self.stack.pop().expect("pair key");
                    map_entries.insert(key.clone(), (key_map, val_map));
                    entries.insert(key, val);
                }
                let value = if kind == AggregateKind::Struct {
                    Value::Struct(std::rc::Rc::new(entries))
                } else {
                    Value::Table(std::rc::Rc::new(std::cell::RefCell::new(entries)))
                };
                Ok((value, Sub::Assoc(map_entries)))
            }
        }
    }
}
