//! Lua table literal encoding and best-effort decoding.
//!
//! Used to move card snapshots through the store as text the interpreter can
//! read natively. The decoder also accepts loosely JSON-shaped input.
//!
//! A table whose entries are all positional decodes as an array; every other
//! table (including `{}`) decodes as an object. An empty array therefore
//! comes back as an empty object.
//!
//! Nesting deeper than [`MAX_DEPTH`] is rejected like any other malformed
//! input.

use serde_json::{Map, Number, Value};

/// Deepest table nesting the decoder accepts.
pub const MAX_DEPTH: usize = 128;

const LUA_KEYWORDS: &[&str] = &[
    "and", "break", "do", "else", "elseif", "end", "false", "for", "function", "goto", "if", "in",
    "local", "nil", "not", "or", "repeat", "return", "then", "true", "until", "while",
];

fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_') && !LUA_KEYWORDS.contains(&key)
}

fn push_quoted(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                out.push_str(&format!("\\{:03}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

fn encode_into(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("nil"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                out.push_str(&i.to_string());
            } else if let Some(u) = n.as_u64() {
                out.push_str(&u.to_string());
            } else {
                out.push_str(&format!("{:?}", n.as_f64().unwrap_or(0.0)));
            }
        }
        Value::String(s) => push_quoted(out, s),
        Value::Array(items) => {
            out.push('{');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                encode_into(out, item);
            }
            out.push('}');
        }
        Value::Object(map) => {
            out.push('{');
            for (i, (key, item)) in map.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                if is_identifier(key) {
                    out.push_str(key);
                } else {
                    out.push('[');
                    push_quoted(out, key);
                    out.push(']');
                }
                out.push('=');
                encode_into(out, item);
            }
            out.push('}');
        }
    }
}

/// Encode a host value as Lua literal text.
pub fn to_embedded_table(value: &Value) -> String {
    let mut out = String::new();
    encode_into(&mut out, value);
    out
}

/// Decode Lua literal (or JSON-ish) text. Malformed input yields `None`.
pub fn parse_embedded_literal(text: &str) -> Option<Value> {
    let mut parser = LiteralParser {
        src: text.as_bytes(),
        pos: 0,
        depth: 0,
    };
    let value = parser.value()?;
    parser.skip_trivia();
    if parser.pos == parser.src.len() {
        Some(value)
    } else {
        None
    }
}

enum Key {
    Positional,
    Named(String),
}

struct LiteralParser<'a> {
    src: &'a [u8],
    pos: usize,
    depth: usize,
}

impl LiteralParser<'_> {
    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn eat(&mut self, b: u8) -> bool {
        if self.peek() == Some(b) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(b) if b.is_ascii_whitespace() => self.pos += 1,
                Some(b'-') if self.peek_at(1) == Some(b'-') => {
                    while let Some(b) = self.peek() {
                        self.pos += 1;
                        if b == b'\n' {
                            break;
                        }
                    }
                }
                _ => return,
            }
        }
    }

    fn keyword(&mut self, word: &str) -> bool {
        let end = self.pos + word.len();
        if self.src.get(self.pos..end) != Some(word.as_bytes()) {
            return false;
        }
        let boundary = self
            .src
            .get(end)
            .map_or(true, |b| !(b.is_ascii_alphanumeric() || *b == b'_'));
        if boundary {
            self.pos = end;
        }
        boundary
    }

    fn value(&mut self) -> Option<Value> {
        self.skip_trivia();
        match self.peek()? {
            b'{' => self.nested(Self::table),
            b'[' if matches!(self.peek_at(1), Some(b'[') | Some(b'=')) => {
                self.long_string().map(Value::String)
            }
            b'[' => self.nested(Self::json_array),
            b'"' | b'\'' => self.string().map(Value::String),
            b'-' | b'0'..=b'9' | b'.' => self.number(),
            _ => {
                if self.keyword("nil") || self.keyword("null") {
                    Some(Value::Null)
                } else if self.keyword("true") {
                    Some(Value::Bool(true))
                } else if self.keyword("false") {
                    Some(Value::Bool(false))
                } else {
                    None
                }
            }
        }
    }

    fn nested(&mut self, parse: fn(&mut Self) -> Option<Value>) -> Option<Value> {
        if self.depth >= MAX_DEPTH {
            return None;
        }
        self.depth += 1;
        let value = parse(self);
        self.depth -= 1;
        value
    }

    fn number(&mut self) -> Option<Value> {
        let start = self.pos;
        let negative = self.eat(b'-');

        if self.peek() == Some(b'0') && matches!(self.peek_at(1), Some(b'x') | Some(b'X')) {
            self.pos += 2;
            let digits_start = self.pos;
            while self.peek().is_some_and(|b| b.is_ascii_hexdigit()) {
                self.pos += 1;
            }
            let digits = std::str::from_utf8(&self.src[digits_start..self.pos]).ok()?;
            let magnitude = i64::from_str_radix(digits, 16).ok()?;
            return Some(Value::from(if negative { -magnitude } else { magnitude }));
        }

        let mut is_float = false;
        while let Some(b) = self.peek() {
            match b {
                b'0'..=b'9' => {}
                b'.' | b'e' | b'E' => is_float = true,
                b'+' | b'-' if matches!(self.src[self.pos - 1], b'e' | b'E') => {}
                _ => break,
            }
            self.pos += 1;
        }

        let text = std::str::from_utf8(&self.src[start..self.pos]).ok()?;
        if !is_float {
            if let Ok(i) = text.parse::<i64>() {
                return Some(Value::from(i));
            }
            if let Ok(u) = text.parse::<u64>() {
                return Some(Value::from(u));
            }
        }
        let f = text.parse::<f64>().ok()?;
        Number::from_f64(f).map(Value::Number)
    }

    fn string(&mut self) -> Option<String> {
        let quote = self.peek()?;
        self.pos += 1;
        let mut buf: Vec<u8> = Vec::new();

        loop {
            let b = self.peek()?;
            self.pos += 1;
            match b {
                _ if b == quote => break,
                b'\n' => return None,
                b'\\' => self.escape(&mut buf)?,
                _ => buf.push(b),
            }
        }

        String::from_utf8(buf).ok()
    }

    fn escape(&mut self, buf: &mut Vec<u8>) -> Option<()> {
        let b = self.peek()?;
        self.pos += 1;
        match b {
            b'n' => buf.push(b'\n'),
            b't' => buf.push(b'\t'),
            b'r' => buf.push(b'\r'),
            b'a' => buf.push(0x07),
            b'b' => buf.push(0x08),
            b'f' => buf.push(0x0c),
            b'v' => buf.push(0x0b),
            b'\\' | b'"' | b'\'' | b'/' => buf.push(b),
            b'\n' => buf.push(b'\n'),
            b'z' => {
                while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
                    self.pos += 1;
                }
            }
            b'x' => {
                let hex = std::str::from_utf8(self.src.get(self.pos..self.pos + 2)?).ok()?;
                buf.push(u8::from_str_radix(hex, 16).ok()?);
                self.pos += 2;
            }
            b'0'..=b'9' => {
                let mut code = u32::from(b - b'0');
                for _ in 0..2 {
                    match self.peek() {
                        Some(d @ b'0'..=b'9') => {
                            code = code * 10 + u32::from(d - b'0');
                            self.pos += 1;
                        }
                        _ => break,
                    }
                }
                buf.push(u8::try_from(code).ok()?);
            }
            b'u' => {
                let c = if self.eat(b'{') {
                    let start = self.pos;
                    while self.peek().is_some_and(|b| b.is_ascii_hexdigit()) {
                        self.pos += 1;
                    }
                    let hex = std::str::from_utf8(&self.src[start..self.pos]).ok()?;
                    if !self.eat(b'}') {
                        return None;
                    }
                    char::from_u32(u32::from_str_radix(hex, 16).ok()?)?
                } else {
                    let high = self.hex4()?;
                    if (0xD800..0xDC00).contains(&high) {
                        if !(self.eat(b'\\') && self.eat(b'u')) {
                            return None;
                        }
                        let low = self.hex4()?;
                        if !(0xDC00..0xE000).contains(&low) {
                            return None;
                        }
                        char::from_u32(0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00))?
                    } else {
                        char::from_u32(high)?
                    }
                };
                let mut tmp = [0u8; 4];
                buf.extend_from_slice(c.encode_utf8(&mut tmp).as_bytes());
            }
            _ => return None,
        }
        Some(())
    }

    fn hex4(&mut self) -> Option<u32> {
        let hex = std::str::from_utf8(self.src.get(self.pos..self.pos + 4)?).ok()?;
        let code = u32::from_str_radix(hex, 16).ok()?;
        self.pos += 4;
        Some(code)
    }

    /// `[[...]]` or `[==[...]==]`.
    fn long_string(&mut self) -> Option<String> {
        self.pos += 1;
        let mut level = 0;
        while self.eat(b'=') {
            level += 1;
        }
        if !self.eat(b'[') {
            return None;
        }
        // A newline right after the opening bracket is skipped.
        if self.peek() == Some(b'\r') {
            self.pos += 1;
        }
        if self.peek() == Some(b'\n') {
            self.pos += 1;
        }

        let mut close = Vec::with_capacity(level + 2);
        close.push(b']');
        close.extend(std::iter::repeat(b'=').take(level));
        close.push(b']');

        let rest = &self.src[self.pos..];
        let end = rest.windows(close.len()).position(|w| w == close.as_slice())?;
        let text = String::from_utf8(rest[..end].to_vec()).ok()?;
        self.pos += end + close.len();
        Some(text)
    }

    fn identifier(&mut self) -> Option<String> {
        let start = self.pos;
        match self.peek()? {
            b if b.is_ascii_alphabetic() || b == b'_' => self.pos += 1,
            _ => return None,
        }
        while self
            .peek()
            .is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            self.pos += 1;
        }
        Some(String::from_utf8_lossy(&self.src[start..self.pos]).into_owned())
    }

    fn key_text(value: &Value) -> Option<String> {
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    fn table_key(&mut self) -> Option<Key> {
        let save = self.pos;
        match self.peek()? {
            b'[' if !matches!(self.peek_at(1), Some(b'[') | Some(b'=')) => {
                self.pos += 1;
                let key = self.value()?;
                self.skip_trivia();
                if !self.eat(b']') {
                    return None;
                }
                self.skip_trivia();
                if !self.eat(b'=') {
                    return None;
                }
                Some(Key::Named(Self::key_text(&key)?))
            }
            b'"' | b'\'' => {
                let key = self.string()?;
                self.skip_trivia();
                if self.eat(b':') || (self.peek() == Some(b'=') && self.peek_at(1) != Some(b'=')) {
                    if self.peek() == Some(b'=') {
                        self.pos += 1;
                    }
                    Some(Key::Named(key))
                } else {
                    self.pos = save;
                    Some(Key::Positional)
                }
            }
            b if b.is_ascii_alphabetic() || b == b'_' => {
                let ident = self.identifier()?;
                self.skip_trivia();
                if self.peek() == Some(b'=') && self.peek_at(1) != Some(b'=') {
                    self.pos += 1;
                    Some(Key::Named(ident))
                } else {
                    self.pos = save;
                    Some(Key::Positional)
                }
            }
            _ => Some(Key::Positional),
        }
    }

    fn table(&mut self) -> Option<Value> {
        self.pos += 1;
        let mut positional: Vec<Value> = Vec::new();
        let mut named: Vec<(String, Value)> = Vec::new();

        loop {
            self.skip_trivia();
            if self.eat(b'}') {
                break;
            }

            match self.table_key()? {
                Key::Positional => positional.push(self.value()?),
                Key::Named(key) => named.push((key, self.value()?)),
            }

            self.skip_trivia();
            if self.eat(b',') || self.eat(b';') {
                continue;
            }
            if self.eat(b'}') {
                break;
            }
            return None;
        }

        if named.is_empty() && !positional.is_empty() {
            return Some(Value::Array(positional));
        }

        let mut map = Map::new();
        for (i, item) in positional.into_iter().enumerate() {
            map.insert((i + 1).to_string(), item);
        }
        for (key, item) in named {
            map.insert(key, item);
        }
        Some(Value::Object(map))
    }

    fn json_array(&mut self) -> Option<Value> {
        self.pos += 1;
        let mut items = Vec::new();
        loop {
            self.skip_trivia();
            if self.eat(b']') {
                break;
            }
            items.push(self.value()?);
            self.skip_trivia();
            if self.eat(b',') {
                continue;
            }
            if self.eat(b']') {
                break;
            }
            return None;
        }
        Some(Value::Array(items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_card() {
        let card = json!({"__Name": "Alice", "type": "Maid", "宠爱": 5, "end": true});
        let text = to_embedded_table(&card);
        assert!(text.contains("__Name=\"Alice\""));
        assert!(text.contains("[\"宠爱\"]=5"));
        // Keywords cannot be bare keys.
        assert!(text.contains("[\"end\"]=true"));
    }

    #[test]
    fn test_encode_escapes() {
        let text = to_embedded_table(&json!("a\"b\\c\nd\u{1}"));
        assert_eq!(text, r#""a\"b\\c\nd\001""#);
    }

    #[test]
    fn test_roundtrip_nested() {
        let value = json!({
            "name": "Alice",
            "stats": {"HP": 12, "ratio": 0.5, "tags": ["a", "b c", "\"quoted\""]},
            "nothing": null,
            "flag": false,
            "neg": -3,
            "list": [1, [2, 3], {"k": "v"}]
        });
        let decoded = parse_embedded_literal(&to_embedded_table(&value)).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_parse_lua_forms() {
        let value = parse_embedded_literal(
            r#"{ name = 'Bob', ["with space"] = "x\65\u{4E2D}", [3] = 0x10; list = {1, 2,}, -- comment
                 long = [==[a]]b]==] }"#,
        )
        .unwrap();
        assert_eq!(
            value,
            json!({"name": "Bob", "with space": "xA中", "3": 16, "list": [1, 2], "long": "a]]b"})
        );
    }

    #[test]
    fn test_parse_json_forms() {
        let value =
            parse_embedded_literal(r#"{"a": [1, 2.5, null], "b": {"c": "\u00e9\ud83d\ude00"}}"#)
                .unwrap();
        assert_eq!(value, json!({"a": [1, 2.5, null], "b": {"c": "é😀"}}));
    }

    #[test]
    fn test_mixed_table_becomes_object() {
        let value = parse_embedded_literal(r#"{"x", y = 1}"#).unwrap();
        assert_eq!(value, json!({"1": "x", "y": 1}));
        assert_eq!(parse_embedded_literal("{}").unwrap(), json!({}));
    }

    #[test]
    fn test_empty_array_decodes_as_object() {
        let value = json!({"a": [], "b": [[]]});
        assert_eq!(to_embedded_table(&value), "{a={},b={{}}}");
        assert_eq!(
            parse_embedded_literal(&to_embedded_table(&value)).unwrap(),
            json!({"a": {}, "b": [{}]})
        );
    }

    #[test]
    fn test_nesting_limit() {
        let at_limit = format!("{}{}", "{".repeat(MAX_DEPTH), "}".repeat(MAX_DEPTH));
        assert!(parse_embedded_literal(&at_limit).is_some());

        let too_deep = format!("{}{}", "[ ".repeat(MAX_DEPTH + 1), "]".repeat(MAX_DEPTH + 1));
        assert_eq!(parse_embedded_literal(&too_deep), None);
    }

    #[test]
    fn test_unbounded_nesting_rejected() {
        assert_eq!(parse_embedded_literal(&"{".repeat(200_000)), None);
        assert_eq!(parse_embedded_literal(&"{x=".repeat(200_000)), None);
        assert_eq!(parse_embedded_literal(&"[ ".repeat(200_000)), None);
    }

    #[test]
    fn test_malformed_returns_none() {
        for text in [
            "",
            "{name=}",
            "{name=\"unterminated}",
            "{1, 2",
            "{a=1} trailing",
            "{a=1 b=2}",
            "function() end",
            "\"bad \\q escape\"",
            "\"\\300\"",
        ] {
            assert_eq!(parse_embedded_literal(text), None, "input: {text}");
        }
    }
}
