use crate::error::{Error, Result};
use crate::token::{Position, Token, TokenKind};
use std::collections::VecDeque;

/// Lazy tokenizer with an arbitrary look-ahead queue.
pub struct Lexer<'a> {
    program: &'a str,
    cursor: usize,
    line: usize,
    column: usize,
    peeked: VecDeque<Token<'a>>,
}

type LResult<'a> = Result<Token<'a>>;

impl<'a> Lexer<'a> {
    pub fn new(program: &'a str) -> Self {
        Lexer {
            program,
            cursor: 0,
            line: 1,
            column: 1,
            peeked: VecDeque::new(),
        }
    }

    /// Get the next token. This consumes the token.
    pub fn next_token(&mut self) -> LResult<'a> {
        match self.peeked.pop_front() {
            Some(token) => Ok(token),
            None => self.lex_token(),
        }
    }

    /// Look `count` tokens ahead without consuming anything. `peek(1)` is the
    /// token `next_token` would return.
    pub fn peek(&mut self, count: usize) -> LResult<'a> {
        while self.peeked.len() < count {
            let token = self.lex_token()?;
            self.peeked.push_back(token);
        }
        Ok(self.peeked[count - 1])
    }

    fn lex_token(&mut self) -> LResult<'a> {
        self.trim()?;

        let position = self.position();
        let ch = match self.next_char(true) {
            Some(ch) => ch,
            None => return Ok(Token::new(TokenKind::Eof, "", position)),
        };

        match ch {
            b'"' | b'\'' => self.read_str_literal(ch),
            b'[' if self.char_at(1) == Some(b'[') => self.read_long_string(),
            b'.' if self.char_at(1).map_or(false, |c| c.is_ascii_digit()) => self.read_number(),
            ch if ch.is_ascii_digit() => self.read_number(),
            ch if ch.is_ascii_alphabetic() || ch == b'_' => self.read_token(),
            _ => self.read_symbol(),
        }
    }

    /// Trim whitespace and comments
    fn trim(&mut self) -> Result<()> {
        loop {
            match self.next_char(true) {
                Some(ch) if ch.is_ascii_whitespace() => {
                    self.bump();
                }
                Some(b'-') if self.char_at(1) == Some(b'-') => {
                    let position = self.position();
                    self.bump();
                    self.bump();
                    if self.starts_with("[[") {
                        self.skip_until("]]")
                            .ok_or_else(|| Error::syntax(position, "Unfinished long comment"))?;
                    } else {
                        while let Some(ch) = self.next_char(false) {
                            if ch == b'\n' {
                                break;
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// Read a decimal or hexadecimal number
    fn read_number(&mut self) -> LResult<'a> {
        let position = self.position();
        let start_pos = self.cursor;

        if self.starts_with("0x") || self.starts_with("0X") {
            self.bump();
            self.bump();
            while self.next_char(true).map_or(false, |c| c.is_ascii_hexdigit()) {
                self.bump();
            }
        } else {
            while self.next_char(true).map_or(false, |c| c.is_ascii_digit()) {
                self.bump();
            }
            if self.next_char(true) == Some(b'.') && self.char_at(1) != Some(b'.') {
                self.bump();
                while self.next_char(true).map_or(false, |c| c.is_ascii_digit()) {
                    self.bump();
                }
            }
            if let Some(b'e' | b'E') = self.next_char(true) {
                self.bump();
                if let Some(b'+' | b'-') = self.next_char(true) {
                    self.bump();
                }
                while self.next_char(true).map_or(false, |c| c.is_ascii_digit()) {
                    self.bump();
                }
            }
        }

        let text = &self.program[start_pos..self.cursor];
        if parse_number(text).is_none() {
            return Err(Error::syntax(
                position,
                format!("Malformed number '{}'", text),
            ));
        }

        Ok(Token::new(TokenKind::Number, text, position))
    }

    /// Read a string literal delimited by `quote`. Escapes are validated here
    /// and resolved later by [`unescape`].
    fn read_str_literal(&mut self, quote: u8) -> LResult<'a> {
        let position = self.position();
        self.bump();
        let start_pos = self.cursor;

        loop {
            match self.next_char(false) {
                // Strings cannot continue from next line
                None | Some(b'\n') => {
                    return Err(Error::syntax(position, "String literal is not finished properly"))
                }
                Some(b'\\') => {
                    let escape_position = self.position();
                    match self.next_char(false) {
                        Some(b'n' | b't' | b'r' | b'a' | b'b' | b'0' | b'\\' | b'"' | b'\'' | b'\n') => {}
                        _ => return Err(Error::syntax(escape_position, "Invalid escape sequence")),
                    }
                }
                Some(ch) if ch == quote => break,
                Some(_) => {}
            }
        }

        let str_lit = &self.program[start_pos..self.cursor - 1];
        Ok(Token::new(TokenKind::String, str_lit, position))
    }

    /// Read a `[[ ... ]]` string
    fn read_long_string(&mut self) -> LResult<'a> {
        let position = self.position();
        self.bump();
        self.bump();
        let start_pos = self.cursor;

        let end_pos = self
            .skip_until("]]")
            .ok_or_else(|| Error::syntax(position, "Unfinished long string"))?;

        let mut text = &self.program[start_pos..end_pos];
        if let Some(stripped) = text.strip_prefix('\n') {
            text = stripped;
        } else if let Some(stripped) = text.strip_prefix("\r\n") {
            text = stripped;
        }

        Ok(Token::new(TokenKind::LongString, text, position))
    }

    /// Read an identifier or keyword
    fn read_token(&mut self) -> LResult<'a> {
        let position = self.position();
        let start_pos = self.cursor;
        while let Some(ch) = self.next_char(true) {
            // Only alphanumeric characters and '_'
            if !ch.is_ascii_alphanumeric() && ch != b'_' {
                break;
            }
            self.bump();
        }

        let token_str = &self.program[start_pos..self.cursor];
        Ok(Token::word(token_str, position))
    }

    fn read_symbol(&mut self) -> LResult<'a> {
        let position = self.position();
        let start_pos = self.cursor;
        let program = self.program;
        let bytes = program.as_bytes();

        if let Some(double) = bytes.get(start_pos..start_pos + 2) {
            if let Some(kind) = TokenKind::double_symbol(double) {
                self.bump();
                self.bump();
                return Ok(Token::new(kind, &program[start_pos..self.cursor], position));
            }
        }

        let ch = bytes[start_pos];
        match TokenKind::single_symbol(ch) {
            Some(kind) => {
                self.bump();
                Ok(Token::new(kind, &program[start_pos..self.cursor], position))
            }
            None => {
                let unexpected = program[start_pos..].chars().next().unwrap_or('?');
                Err(Error::syntax(
                    position,
                    format!("Unexpected character '{}'", unexpected),
                ))
            }
        }
    }

    /// Advance past the next occurrence of `terminator`, returning the byte
    /// offset where it started.
    fn skip_until(&mut self, terminator: &str) -> Option<usize> {
        while self.cursor < self.program.len() {
            if self.starts_with(terminator) {
                let found = self.cursor;
                for _ in 0..terminator.len() {
                    self.bump();
                }
                return Some(found);
            }
            self.bump();
        }
        None
    }

    fn starts_with(&self, prefix: &str) -> bool {
        self.program.as_bytes()[self.cursor..].starts_with(prefix.as_bytes())
    }

    fn position(&self) -> Position {
        Position::new(self.line, self.column)
    }

    fn char_at(&self, offset: usize) -> Option<u8> {
        self.program.as_bytes().get(self.cursor + offset).copied()
    }

    /// Consume one byte, keeping line and column up to date.
    fn bump(&mut self) {
        if let Some(ch) = self.char_at(0) {
            self.cursor += 1;
            if ch == b'\n' {
                self.line += 1;
                self.column = 1;
            } else if ch & 0xC0 != 0x80 {
                // Continuation bytes of a UTF-8 sequence share one column
                self.column += 1;
            }
        }
    }

    /// Get the next char and advance the cursor if `peek` is false
    fn next_char(&mut self, peek: bool) -> Option<u8> {
        let ch = self.char_at(0)?;
        if !peek {
            self.bump();
        }
        Some(ch)
    }
}

/// Parse the text of a number literal, or a string being coerced to a number.
pub fn parse_number(text: &str) -> Option<f64> {
    let text = text.trim();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };

    let value = if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        if hex.is_empty() {
            return None;
        }
        u64::from_str_radix(hex, 16).ok()? as f64
    } else {
        let first = digits.bytes().next()?;
        if !first.is_ascii_digit() && first != b'.' {
            // Rejects "inf", "NaN" and friends that f64 parsing accepts
            return None;
        }
        digits.parse::<f64>().ok()?
    };

    Some(if negative { -value } else { value })
}

/// Resolve the escapes of a string literal lexed by [`Lexer`].
pub fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }

        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('a') => out.push('\x07'),
            Some('b') => out.push('\x08'),
            Some('0') => out.push('\0'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}
