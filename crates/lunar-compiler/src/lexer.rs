/// Pull-based lexer for Lua 5.4 source bytes.
///
/// The lexer keeps a primed current token and at most one token of
/// lookahead; the parser needs the lookahead in exactly one place (table
/// constructor fields, `Name =` vs an expression starting with a name).
/// It also owns the [`StringInterner`] for the whole compile session, so
/// names and string literals flow to the code generator as `StringId`s.
use crate::token::{SpannedToken, Token};
use lunar_core::string::StringInterner;
use std::fmt;

/// Lexical error: malformed token or unfinished construct.
#[derive(Clone, Debug, PartialEq)]
pub struct LexError {
    pub message: String,
    pub line: u32,
    /// Text of the offending token, as far as it was scanned.
    pub near: String,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} near '{}'", self.line, self.message, self.near)
    }
}

impl std::error::Error for LexError {}

/// Result of probing for a `[=*[` long-bracket opener.
enum LongBracket {
    /// A proper opener with this many `=` signs.
    Level(u32),
    /// `[=` with no second `[`: reserved, always an error.
    Malformed,
    /// Just a plain `[`.
    NotBracket,
}

pub struct Lexer<'a> {
    source: &'a [u8],
    pos: usize,
    line: u32,
    current: SpannedToken,
    current_text: String,
    ahead: Option<(SpannedToken, String)>,
    pub strings: StringInterner,
    /// Line of the previous consumed token (PUC's `lastline`).
    pub lastline: u32,
}

impl<'a> Lexer<'a> {
    /// Create a lexer and prime the first token.
    pub fn new(source: &'a [u8]) -> Result<Self, LexError> {
        let mut lexer = Lexer {
            source,
            pos: 0,
            line: 1,
            current: SpannedToken {
                token: Token::Eof,
                line: 1,
            },
            current_text: String::new(),
            ahead: None,
            strings: StringInterner::new(),
            lastline: 1,
        };
        let (tok, text) = lexer.scan()?;
        lexer.current = tok;
        lexer.current_text = text;
        Ok(lexer)
    }

    /// The current token.
    pub fn current(&self) -> &Token {
        &self.current.token
    }

    /// Line the current token starts on.
    pub fn current_line(&self) -> u32 {
        self.current.line
    }

    /// Raw source text of the current token, for `near '...'` messages.
    pub fn token_text(&self) -> &str {
        &self.current_text
    }

    /// Consume the current token and advance.
    pub fn next(&mut self) -> Result<(), LexError> {
        self.lastline = self.current.line;
        match self.ahead.take() {
            Some((tok, text)) => {
                self.current = tok;
                self.current_text = text;
            }
            None => {
                let (tok, text) = self.scan()?;
                self.current = tok;
                self.current_text = text;
            }
        }
        Ok(())
    }

    /// Look one token past the current one without consuming anything.
    pub fn peek_ahead(&mut self) -> Result<&Token, LexError> {
        if self.ahead.is_none() {
            self.ahead = Some(self.scan()?);
        }
        match &self.ahead {
            Some((tok, _)) => Ok(&tok.token),
            None => unreachable!(),
        }
    }

    /// Give up the interner at the end of compilation.
    pub fn into_strings(self) -> StringInterner {
        self.strings
    }

    // ---- Character-level helpers ----

    fn peek(&self) -> Option<u8> {
        self.source.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.source.get(self.pos + offset).copied()
    }

    /// Consume one byte. A `\n\r` or `\r\n` pair counts as a single
    /// newline and is consumed whole.
    fn advance_char(&mut self) -> Option<u8> {
        let ch = self.source.get(self.pos).copied()?;
        self.pos += 1;
        if ch == b'\n' || ch == b'\r' {
            let other = if ch == b'\n' { b'\r' } else { b'\n' };
            if self.peek() == Some(other) {
                self.pos += 1;
            }
            self.line += 1;
        }
        Some(ch)
    }

    fn error(&self, message: impl Into<String>, near_start: usize) -> LexError {
        let near = if near_start < self.pos {
            String::from_utf8_lossy(&self.source[near_start..self.pos]).into_owned()
        } else {
            "<eof>".to_string()
        };
        LexError {
            message: message.into(),
            line: self.line,
            near,
        }
    }

    // ---- Token scanning ----

    fn scan(&mut self) -> Result<(SpannedToken, String), LexError> {
        self.skip_whitespace_and_comments()?;
        let start = self.pos;
        let line = self.line;
        let token = self.scan_token(start)?;
        let text = if self.pos > start {
            String::from_utf8_lossy(&self.source[start..self.pos]).into_owned()
        } else {
            "<eof>".to_string()
        };
        Ok((SpannedToken { token, line }, text))
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<(), LexError> {
        loop {
            while let Some(ch) = self.peek() {
                if matches!(ch, b' ' | b'\t' | b'\n' | b'\r' | b'\x0B' | b'\x0C') {
                    self.advance_char();
                } else {
                    break;
                }
            }
            if self.peek() == Some(b'-') && self.peek_at(1) == Some(b'-') {
                self.advance_char();
                self.advance_char();
                let start = self.pos;
                match self.check_long_bracket() {
                    LongBracket::Level(level) => {
                        self.open_long_bracket(level);
                        self.long_bracket_content(level, None, start)
                            .map_err(|mut e| {
                                e.message = "unfinished long comment".to_string();
                                e
                            })?;
                    }
                    _ => {
                        // line comment
                        while let Some(ch) = self.peek() {
                            if ch == b'\n' || ch == b'\r' {
                                break;
                            }
                            self.advance_char();
                        }
                    }
                }
                continue;
            }
            return Ok(());
        }
    }

    /// Probe (without consuming) for a long-bracket opener at `[`.
    fn check_long_bracket(&self) -> LongBracket {
        if self.peek() != Some(b'[') {
            return LongBracket::NotBracket;
        }
        let mut level = 0u32;
        let mut offset = 1;
        while self.peek_at(offset) == Some(b'=') {
            level += 1;
            offset += 1;
        }
        match self.peek_at(offset) {
            Some(b'[') => LongBracket::Level(level),
            _ if level > 0 => LongBracket::Malformed,
            _ => LongBracket::NotBracket,
        }
    }

    /// Consume a long-bracket opener whose level was already checked.
    fn open_long_bracket(&mut self, level: u32) {
        for _ in 0..level + 2 {
            self.advance_char();
        }
    }

    /// Read the body of a long string or comment up to the matching
    /// `]=*]`. Collects bytes when `out` is given (strings); skips for
    /// comments. Newlines are normalized to `\n`.
    fn long_bracket_content(
        &mut self,
        level: u32,
        mut out: Option<&mut Vec<u8>>,
        start: usize,
    ) -> Result<(), LexError> {
        // A newline directly after the opener is not part of the content.
        if matches!(self.peek(), Some(b'\n') | Some(b'\r')) {
            self.advance_char();
        }
        loop {
            match self.peek() {
                None => return Err(self.error("unfinished long string", start)),
                Some(b']') => {
                    let mut offset = 1;
                    let mut count = 0;
                    while self.peek_at(offset) == Some(b'=') {
                        count += 1;
                        offset += 1;
                    }
                    if count == level && self.peek_at(offset) == Some(b']') {
                        for _ in 0..level + 2 {
                            self.advance_char();
                        }
                        return Ok(());
                    }
                    self.advance_char();
                    if let Some(buf) = out.as_deref_mut() {
                        buf.push(b']');
                    }
                }
                Some(ch) => {
                    self.advance_char();
                    if let Some(buf) = out.as_deref_mut() {
                        buf.push(if ch == b'\r' { b'\n' } else { ch });
                    }
                }
            }
        }
    }

    fn scan_token(&mut self, start: usize) -> Result<Token, LexError> {
        let ch = match self.peek() {
            Some(ch) => ch,
            None => return Ok(Token::Eof),
        };
        match ch {
            b'0'..=b'9' => self.read_numeral(start),
            b'.' => {
                if matches!(self.peek_at(1), Some(b'0'..=b'9')) {
                    return self.read_numeral(start);
                }
                self.advance_char();
                if self.peek() == Some(b'.') {
                    self.advance_char();
                    if self.peek() == Some(b'.') {
                        self.advance_char();
                        Ok(Token::DotDotDot)
                    } else {
                        Ok(Token::DotDot)
                    }
                } else {
                    Ok(Token::Dot)
                }
            }
            b'"' | b'\'' => self.read_short_string(ch, start),
            b'[' => match self.check_long_bracket() {
                LongBracket::Level(level) => {
                    self.open_long_bracket(level);
                    let mut bytes = Vec::new();
                    self.long_bracket_content(level, Some(&mut bytes), start)?;
                    Ok(Token::String(self.strings.intern(&bytes)))
                }
                LongBracket::Malformed => {
                    self.advance_char();
                    while self.peek() == Some(b'=') {
                        self.advance_char();
                    }
                    Err(self.error("invalid long string delimiter", start))
                }
                LongBracket::NotBracket => {
                    self.advance_char();
                    Ok(Token::LBracket)
                }
            },
            b'A'..=b'Z' | b'a'..=b'z' | b'_' => {
                while let Some(c) = self.peek() {
                    if c.is_ascii_alphanumeric() || c == b'_' {
                        self.advance_char();
                    } else {
                        break;
                    }
                }
                // identifier characters are ASCII, so this cannot fail
                let text = std::str::from_utf8(&self.source[start..self.pos]).unwrap_or("");
                match Token::keyword_from_str(text) {
                    Some(kw) => Ok(kw),
                    None => Ok(Token::Name(self.strings.intern(text.as_bytes()))),
                }
            }
            b'+' => self.single(Token::Plus),
            b'-' => self.single(Token::Minus),
            b'*' => self.single(Token::Star),
            b'%' => self.single(Token::Percent),
            b'^' => self.single(Token::Caret),
            b'#' => self.single(Token::Hash),
            b'&' => self.single(Token::Ampersand),
            b'|' => self.single(Token::Pipe),
            b'(' => self.single(Token::LParen),
            b')' => self.single(Token::RParen),
            b'{' => self.single(Token::LBrace),
            b'}' => self.single(Token::RBrace),
            b']' => self.single(Token::RBracket),
            b';' => self.single(Token::Semi),
            b',' => self.single(Token::Comma),
            b'/' => self.pair(b'/', Token::FloorDiv, Token::Slash),
            b':' => self.pair(b':', Token::DoubleColon, Token::Colon),
            b'=' => self.pair(b'=', Token::Equal, Token::Assign),
            b'~' => self.pair(b'=', Token::NotEqual, Token::Tilde),
            b'<' => {
                self.advance_char();
                match self.peek() {
                    Some(b'=') => self.single(Token::LessEq),
                    Some(b'<') => self.single(Token::ShiftLeft),
                    _ => Ok(Token::Less),
                }
            }
            b'>' => {
                self.advance_char();
                match self.peek() {
                    Some(b'=') => self.single(Token::GreaterEq),
                    Some(b'>') => self.single(Token::ShiftRight),
                    _ => Ok(Token::Greater),
                }
            }
            _ => {
                self.advance_char();
                Err(self.error("unexpected symbol", start))
            }
        }
    }

    fn single(&mut self, tok: Token) -> Result<Token, LexError> {
        self.advance_char();
        Ok(tok)
    }

    /// Two-character operator when the next byte matches, else the
    /// one-character token.
    fn pair(&mut self, second: u8, double: Token, single: Token) -> Result<Token, LexError> {
        self.advance_char();
        if self.peek() == Some(second) {
            self.advance_char();
            Ok(double)
        } else {
            Ok(single)
        }
    }

    // ---- Numerals ----

    /// Scan a numeral liberally, then validate. Everything that looks
    /// number-ish is consumed first (digits, hex digits, dots, exponent
    /// markers with signs); the text either parses or the whole blob is a
    /// `malformed number`. This is why `3..4` is an error in Lua.
    fn read_numeral(&mut self, start: usize) -> Result<Token, LexError> {
        let hex = self.peek() == Some(b'0') && matches!(self.peek_at(1), Some(b'x') | Some(b'X'));
        let expo: [u8; 2] = if hex { [b'p', b'P'] } else { [b'e', b'E'] };
        if hex {
            self.advance_char();
            self.advance_char();
        }
        while let Some(c) = self.peek() {
            if expo.contains(&c) {
                self.advance_char();
                if matches!(self.peek(), Some(b'+') | Some(b'-')) {
                    self.advance_char();
                }
            } else if c.is_ascii_hexdigit() || c == b'.' {
                self.advance_char();
            } else {
                break;
            }
        }
        // A numeral must not run into identifier characters.
        let mut trailing_garbage = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' {
                trailing_garbage = true;
                self.advance_char();
            } else {
                break;
            }
        }
        let text = std::str::from_utf8(&self.source[start..self.pos]).unwrap_or("");
        if trailing_garbage {
            return Err(self.error("malformed number", start));
        }
        match Self::str_to_number(text) {
            Some(tok) => Ok(tok),
            None => Err(self.error("malformed number", start)),
        }
    }

    /// Validate and convert a scanned numeral.
    fn str_to_number(text: &str) -> Option<Token> {
        if let Some(rest) = text
            .strip_prefix("0x")
            .or_else(|| text.strip_prefix("0X"))
        {
            if rest.contains(['.', 'p', 'P']) {
                return Self::parse_hex_float(rest).map(Token::Float);
            }
            if rest.is_empty() {
                return None;
            }
            // Hex integers wrap around on overflow.
            let mut acc = 0u64;
            for c in rest.bytes() {
                let d = (c as char).to_digit(16)?;
                acc = acc.wrapping_mul(16).wrapping_add(d as u64);
            }
            return Some(Token::Integer(acc as i64));
        }
        if text.contains(['.', 'e', 'E']) {
            return text.parse::<f64>().ok().map(Token::Float);
        }
        match text.parse::<i64>() {
            Ok(i) => Some(Token::Integer(i)),
            // A decimal integer too large for i64 becomes a float.
            Err(_) => text.parse::<f64>().ok().map(Token::Float),
        }
    }

    /// `AAA.BBBpEEE` with hex mantissa and decimal binary exponent.
    fn parse_hex_float(rest: &str) -> Option<f64> {
        let mut mantissa = 0.0f64;
        let mut exp = 0i32;
        let mut seen_digit = false;
        let mut seen_dot = false;
        let mut bytes = rest.bytes().peekable();
        while let Some(&c) = bytes.peek() {
            if c == b'.' {
                if seen_dot {
                    return None;
                }
                seen_dot = true;
                bytes.next();
            } else if c.is_ascii_hexdigit() {
                mantissa = mantissa * 16.0 + (c as char).to_digit(16)? as f64;
                if seen_dot {
                    exp -= 4;
                }
                seen_digit = true;
                bytes.next();
            } else {
                break;
            }
        }
        if !seen_digit {
            return None;
        }
        match bytes.next() {
            None => {}
            Some(b'p') | Some(b'P') => {
                let mut sign = 1i32;
                match bytes.peek() {
                    Some(b'+') => {
                        bytes.next();
                    }
                    Some(b'-') => {
                        sign = -1;
                        bytes.next();
                    }
                    _ => {}
                }
                let mut e = 0i32;
                let mut any = false;
                for c in bytes {
                    let d = (c as char).to_digit(10)?;
                    e = e.saturating_mul(10).saturating_add(d as i32);
                    any = true;
                }
                if !any {
                    return None;
                }
                exp = exp.saturating_add(sign.saturating_mul(e));
            }
            Some(_) => return None,
        }
        Some(mantissa * 2.0f64.powi(exp))
    }

    // ---- Strings ----

    fn read_short_string(&mut self, quote: u8, start: usize) -> Result<Token, LexError> {
        self.advance_char(); // opening quote
        let mut bytes = Vec::new();
        loop {
            let ch = match self.peek() {
                None => return Err(self.error("unfinished string", start)),
                Some(c) => c,
            };
            match ch {
                b'\n' | b'\r' => return Err(self.error("unfinished string", start)),
                c if c == quote => {
                    self.advance_char();
                    return Ok(Token::String(self.strings.intern(&bytes)));
                }
                b'\\' => {
                    self.advance_char();
                    self.read_escape(&mut bytes, start)?;
                }
                c => {
                    self.advance_char();
                    bytes.push(c);
                }
            }
        }
    }

    fn read_escape(&mut self, bytes: &mut Vec<u8>, start: usize) -> Result<(), LexError> {
        let ch = match self.peek() {
            None => return Err(self.error("unfinished string", start)),
            Some(c) => c,
        };
        match ch {
            b'a' => self.push_escape(bytes, 0x07),
            b'b' => self.push_escape(bytes, 0x08),
            b'f' => self.push_escape(bytes, 0x0C),
            b'n' => self.push_escape(bytes, b'\n'),
            b'r' => self.push_escape(bytes, b'\r'),
            b't' => self.push_escape(bytes, b'\t'),
            b'v' => self.push_escape(bytes, 0x0B),
            b'\\' => self.push_escape(bytes, b'\\'),
            b'"' => self.push_escape(bytes, b'"'),
            b'\'' => self.push_escape(bytes, b'\''),
            b'\n' | b'\r' => {
                self.advance_char();
                bytes.push(b'\n');
            }
            b'x' => {
                self.advance_char();
                let mut val = 0u32;
                for _ in 0..2 {
                    let d = self
                        .peek()
                        .and_then(|c| (c as char).to_digit(16))
                        .ok_or_else(|| self.error("hexadecimal digit expected", start))?;
                    val = val * 16 + d;
                    self.advance_char();
                }
                bytes.push(val as u8);
            }
            b'0'..=b'9' => {
                let mut val = 0u32;
                for _ in 0..3 {
                    match self.peek().and_then(|c| (c as char).to_digit(10)) {
                        Some(d) => {
                            val = val * 10 + d;
                            self.advance_char();
                        }
                        None => break,
                    }
                }
                if val > 255 {
                    return Err(self.error("decimal escape too large", start));
                }
                bytes.push(val as u8);
            }
            b'z' => {
                self.advance_char();
                while let Some(c) = self.peek() {
                    if matches!(c, b' ' | b'\t' | b'\n' | b'\r' | b'\x0B' | b'\x0C') {
                        self.advance_char();
                    } else {
                        break;
                    }
                }
            }
            b'u' => {
                self.advance_char();
                if self.peek() != Some(b'{') {
                    return Err(self.error("missing '{' in \\u{xxxx}", start));
                }
                self.advance_char();
                let mut val: u32 = self
                    .peek()
                    .and_then(|c| (c as char).to_digit(16))
                    .ok_or_else(|| self.error("hexadecimal digit expected", start))?;
                self.advance_char();
                while let Some(d) = self.peek().and_then(|c| (c as char).to_digit(16)) {
                    if val >= 0x8000000 {
                        return Err(self.error("UTF-8 value too large", start));
                    }
                    val = val * 16 + d;
                    self.advance_char();
                }
                if self.peek() != Some(b'}') {
                    return Err(self.error("missing '}' in \\u{xxxx}", start));
                }
                self.advance_char();
                push_utf8_escape(bytes, val);
            }
            _ => {
                self.advance_char();
                return Err(self.error("invalid escape sequence", start));
            }
        }
        Ok(())
    }

    fn push_escape(&mut self, bytes: &mut Vec<u8>, b: u8) {
        self.advance_char();
        bytes.push(b);
    }
}

/// Lua's liberal UTF-8 encoding: up to 6 bytes, accepts the full 31-bit
/// range (the luaO_utf8esc algorithm).
fn push_utf8_escape(out: &mut Vec<u8>, x: u32) {
    if x < 0x80 {
        out.push(x as u8);
        return;
    }
    let mut buf = [0u8; 6];
    let mut n = 0;
    let mut x = x;
    let mut mfb = 0x3fu32; // bits that fit the first byte
    loop {
        buf[n] = 0x80 | (x & 0x3f) as u8;
        n += 1;
        x >>= 6;
        mfb >>= 1;
        if x <= mfb {
            break;
        }
    }
    out.push((!mfb << 1) as u8 | x as u8);
    for i in (0..n).rev() {
        out.push(buf[i]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_tokens(src: &str) -> Vec<Token> {
        let mut lexer = Lexer::new(src.as_bytes()).expect("prime");
        let mut out = Vec::new();
        loop {
            let tok = *lexer.current();
            if tok == Token::Eof {
                return out;
            }
            out.push(tok);
            lexer.next().expect("advance");
        }
    }

    fn lex_single(src: &str) -> Token {
        let toks = lex_tokens(src);
        assert_eq!(toks.len(), 1, "expected one token from {src:?}: {toks:?}");
        toks[0]
    }

    fn lex_string(src: &str) -> Vec<u8> {
        let mut lexer = Lexer::new(src.as_bytes()).expect("prime");
        match *lexer.current() {
            Token::String(id) => lexer.strings.get_bytes(id).to_vec(),
            other => panic!("expected string token, got {other:?}"),
        }
    }

    fn lex_error(src: &str) -> LexError {
        let mut lexer = match Lexer::new(src.as_bytes()) {
            Err(e) => return e,
            Ok(l) => l,
        };
        loop {
            if *lexer.current() == Token::Eof {
                panic!("expected lex error in {src:?}");
            }
            if let Err(e) = lexer.next() {
                return e;
            }
        }
    }

    #[test]
    fn test_keywords_and_names() {
        assert_eq!(
            lex_tokens("while undef do end"),
            vec![Token::While, Token::Undef, Token::Do, Token::End]
        );
        let toks = lex_tokens("foo _bar baz2");
        assert!(matches!(toks[0], Token::Name(_)));
        assert!(matches!(toks[2], Token::Name(_)));
    }

    #[test]
    fn test_name_interning_dedups() {
        let mut lexer = Lexer::new(b"abc abc").unwrap();
        let id1 = match *lexer.current() {
            Token::Name(id) => id,
            _ => panic!(),
        };
        lexer.next().unwrap();
        let id2 = match *lexer.current() {
            Token::Name(id) => id,
            _ => panic!(),
        };
        assert_eq!(id1, id2);
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            lex_tokens("<= >= == ~= << >> // ... .. . :: :"),
            vec![
                Token::LessEq,
                Token::GreaterEq,
                Token::Equal,
                Token::NotEqual,
                Token::ShiftLeft,
                Token::ShiftRight,
                Token::FloorDiv,
                Token::DotDotDot,
                Token::DotDot,
                Token::Dot,
                Token::DoubleColon,
                Token::Colon,
            ]
        );
    }

    #[test]
    fn test_integers() {
        assert_eq!(lex_single("42"), Token::Integer(42));
        assert_eq!(lex_single("0"), Token::Integer(0));
        assert_eq!(lex_single("0xFF"), Token::Integer(255));
        assert_eq!(lex_single("0X10"), Token::Integer(16));
    }

    #[test]
    fn test_hex_wraps() {
        // 17 hex digits wrap modulo 2^64
        assert_eq!(
            lex_single("0x10000000000000001"),
            Token::Integer(1)
        );
        assert_eq!(lex_single("0xFFFFFFFFFFFFFFFF"), Token::Integer(-1));
    }

    #[test]
    fn test_decimal_overflow_becomes_float() {
        assert_eq!(
            lex_single("9223372036854775808"),
            Token::Float(9.223372036854776e18)
        );
    }

    #[test]
    fn test_floats() {
        assert_eq!(lex_single("3.5"), Token::Float(3.5));
        assert_eq!(lex_single(".5"), Token::Float(0.5));
        assert_eq!(lex_single("1e2"), Token::Float(100.0));
        assert_eq!(lex_single("1E-2"), Token::Float(0.01));
        assert_eq!(lex_single("3."), Token::Float(3.0));
    }

    #[test]
    fn test_hex_floats() {
        assert_eq!(lex_single("0x1p4"), Token::Float(16.0));
        assert_eq!(lex_single("0x1.8"), Token::Float(1.5));
        assert_eq!(lex_single("0x.8"), Token::Float(0.5));
        assert_eq!(lex_single("0xAp-1"), Token::Float(5.0));
    }

    #[test]
    fn test_malformed_numbers() {
        assert_eq!(lex_error("3..4").message, "malformed number");
        assert_eq!(lex_error("0x").message, "malformed number");
        assert_eq!(lex_error("1e").message, "malformed number");
        assert_eq!(lex_error("5x7").message, "malformed number");
        assert_eq!(lex_error("1.5.2").message, "malformed number");
    }

    #[test]
    fn test_malformed_number_near_text() {
        let e = lex_error("return 5x7");
        assert_eq!(e.near, "5x7");
    }

    #[test]
    fn test_short_strings() {
        assert_eq!(lex_string("\"hello\""), b"hello");
        assert_eq!(lex_string("'world'"), b"world");
        assert_eq!(lex_string("\"it's\""), b"it's");
        assert_eq!(lex_string("''"), b"");
    }

    #[test]
    fn test_escapes() {
        assert_eq!(lex_string(r#""\a\b\f\n\r\t\v""#), b"\x07\x08\x0C\n\r\t\x0B");
        assert_eq!(lex_string(r#""\\\"""#), b"\\\"");
        assert_eq!(lex_string(r#""\x41\x62""#), b"Ab");
        assert_eq!(lex_string(r#""\65\066\9""#), b"AB\t");
        // \z eats every whitespace byte that follows, newlines included
        assert_eq!(lex_string("\"a\\z  \n\t b\""), b"ab");
        assert_eq!(lex_string("\"a\\\nb\""), b"a\nb");
    }

    #[test]
    fn test_unicode_escapes() {
        assert_eq!(lex_string(r#""\u{48}""#), b"H");
        assert_eq!(lex_string(r#""\u{20AC}""#), "€".as_bytes());
        // Lua accepts the full 31-bit range with its own 6-byte encoding
        assert_eq!(
            lex_string(r#""\u{7FFFFFFF}""#),
            &[0xFD, 0xBF, 0xBF, 0xBF, 0xBF, 0xBF]
        );
    }

    #[test]
    fn test_escape_errors() {
        assert_eq!(lex_error(r#""\q""#).message, "invalid escape sequence");
        assert_eq!(lex_error(r#""\xg""#).message, "hexadecimal digit expected");
        assert_eq!(lex_error(r#""\256""#).message, "decimal escape too large");
        assert_eq!(lex_error(r#""\u41}""#).message, "missing '{' in \\u{xxxx}");
        assert_eq!(
            lex_error(r#""\u{110000000}""#).message,
            "UTF-8 value too large"
        );
        assert_eq!(lex_error("\"abc").message, "unfinished string");
        assert_eq!(lex_error("\"abc\ndef\"").message, "unfinished string");
    }

    #[test]
    fn test_long_strings() {
        assert_eq!(lex_string("[[hello]]"), b"hello");
        assert_eq!(lex_string("[==[a]b]=]c]==]"), b"a]b]=]c");
        // first newline is skipped
        assert_eq!(lex_string("[[\nhello]]"), b"hello");
        // no escape processing
        assert_eq!(lex_string(r"[[a\nb]]"), br"a\nb");
    }

    #[test]
    fn test_long_string_newline_normalization() {
        assert_eq!(lex_string("[[a\r\nb\rc]]"), b"a\nb\nc");
    }

    #[test]
    fn test_long_string_errors() {
        assert_eq!(lex_error("[[abc").message, "unfinished long string");
        assert_eq!(lex_error("[=[abc]]").message, "unfinished long string");
        assert_eq!(lex_error("[=x").message, "invalid long string delimiter");
    }

    #[test]
    fn test_comments() {
        assert_eq!(lex_tokens("-- comment\n42"), vec![Token::Integer(42)]);
        assert_eq!(lex_tokens("--[[ long\ncomment ]]42"), vec![Token::Integer(42)]);
        assert_eq!(
            lex_tokens("--[==[ ]] still comment ]==]42"),
            vec![Token::Integer(42)]
        );
        assert_eq!(lex_tokens("1 --[[mid]] 2").len(), 2);
        assert_eq!(lex_error("--[[never ends").message, "unfinished long comment");
    }

    #[test]
    fn test_line_counting() {
        let mut lexer = Lexer::new(b"a\nb\r\nc\n\rd\re").unwrap();
        let mut lines = Vec::new();
        while *lexer.current() != Token::Eof {
            lines.push(lexer.current_line());
            lexer.next().unwrap();
        }
        assert_eq!(lines, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_lookahead() {
        let mut lexer = Lexer::new(b"a = 1").unwrap();
        assert!(matches!(*lexer.current(), Token::Name(_)));
        assert_eq!(*lexer.peek_ahead().unwrap(), Token::Assign);
        // current unchanged, then advance goes through the buffered token
        assert!(matches!(*lexer.current(), Token::Name(_)));
        lexer.next().unwrap();
        assert_eq!(*lexer.current(), Token::Assign);
        assert_eq!(lexer.token_text(), "=");
        lexer.next().unwrap();
        assert_eq!(*lexer.current(), Token::Integer(1));
    }

    #[test]
    fn test_token_text() {
        let mut lexer = Lexer::new(b"1.000 then").unwrap();
        assert_eq!(lexer.token_text(), "1.000");
        lexer.next().unwrap();
        assert_eq!(lexer.token_text(), "then");
        lexer.next().unwrap();
        assert_eq!(lexer.token_text(), "<eof>");
    }

    #[test]
    fn test_lastline() {
        let mut lexer = Lexer::new(b"a\nb").unwrap();
        lexer.next().unwrap(); // consume 'a'
        assert_eq!(lexer.lastline, 1);
        assert_eq!(lexer.current_line(), 2);
    }

    #[test]
    fn test_unexpected_symbol() {
        assert_eq!(lex_error("$").message, "unexpected symbol");
        assert_eq!(lex_error("a ? b").message, "unexpected symbol");
    }

    #[test]
    fn test_empty_source() {
        assert_eq!(lex_tokens(""), vec![]);
        assert_eq!(lex_tokens("   \n\t  "), vec![]);
        assert_eq!(lex_tokens("-- only a comment"), vec![]);
    }
}
