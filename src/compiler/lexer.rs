//! Tokenizer. A simple one-character-lookahead scanner over the source
//! bytes; since the schema language is ASCII-only this walks `&[u8]`
//! rather than chars.

use crate::compiler::token::{keyword, Token, TokenKind};
use crate::error::{Error, ErrorContext, ErrorKind, Result};

pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: u32,
    column: u32,
}

struct LexCtx {
    line: u32,
    column: u32,
}
impl ErrorContext for LexCtx {
    fn error_context(&self) -> String {
        format!("line {} column {}", self.line, self.column)
    }
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Lexer { src: src.as_bytes(), pos: 0, line: 1, column: 1 }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, off: usize) -> Option<u8> {
        self.src.get(self.pos + off).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(b)
    }

    fn err(&self, line: u32, column: u32, msg: impl Into<String>) -> Error {
        Error::new(ErrorKind::Lex, Some(LexCtx { line, column }.error_context()), msg.into())
    }

    /// Skip plain whitespace and `//`/`/* */` comments, returning any
    /// `///` doc comment text encountered immediately before the next
    /// real token (only the last one is kept; a doc comment attaches to
    /// the definition that immediately follows it).
    fn skip_trivia(&mut self) -> Result<Option<String>> {
        let mut pending_doc: Option<String> = None;
        loop {
            match self.peek() {
                Some(b' ') | Some(b'\t') | Some(b'\r') | Some(b'\n') => {
                    self.bump();
                }
                Some(b'/') if self.peek_at(1) == Some(b'/') && self.peek_at(2) == Some(b'/') => {
                    self.bump();
                    self.bump();
                    self.bump();
                    if self.peek() == Some(b' ') {
                        self.bump();
                    }
                    let start = self.pos;
                    while !matches!(self.peek(), None | Some(b'\n')) {
                        self.bump();
                    }
                    let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap_or("").to_string();
                    pending_doc = Some(text);
                }
                Some(b'/') if self.peek_at(1) == Some(b'/') => {
                    while !matches!(self.peek(), None | Some(b'\n')) {
                        self.bump();
                    }
                    pending_doc = None;
                }
                Some(b'/') if self.peek_at(1) == Some(b'*') => {
                    let (line, column) = (self.line, self.column);
                    self.bump();
                    self.bump();
                    loop {
                        match self.peek() {
                            None => return Err(self.err(line, column, "unterminated block comment")),
                            Some(b'*') if self.peek_at(1) == Some(b'/') => {
                                self.bump();
                                self.bump();
                                break;
                            }
                            _ => {
                                self.bump();
                            }
                        }
                    }
                    pending_doc = None;
                }
                _ => break,
            }
        }
        Ok(pending_doc)
    }

    fn number(&mut self) -> Result<TokenKind> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.bump();
        }
        if self.peek() == Some(b'0') && matches!(self.peek_at(1), Some(b'x') | Some(b'X')) {
            self.bump();
            self.bump();
            let hex_start = self.pos;
            while matches!(self.peek(), Some(b) if b.is_ascii_hexdigit()) {
                self.bump();
            }
            let text = std::str::from_utf8(&self.src[hex_start..self.pos]).unwrap();
            let mut v = i64::from_str_radix(text, 16)
                .map_err(|e| self.err(self.line, self.column, format!("bad hex literal: {}", e)))?;
            if self.src[start] == b'-' {
                v = -v;
            }
            return Ok(TokenKind::Int(v));
        }
        while matches!(self.peek(), Some(b) if b.is_ascii_digit()) {
            self.bump();
        }
        let mut is_float = false;
        if self.peek() == Some(b'.') && matches!(self.peek_at(1), Some(b) if b.is_ascii_digit()) {
            is_float = true;
            self.bump();
            while matches!(self.peek(), Some(b) if b.is_ascii_digit()) {
                self.bump();
            }
        }
        if matches!(self.peek(), Some(b'e') | Some(b'E')) {
            is_float = true;
            self.bump();
            if matches!(self.peek(), Some(b'+') | Some(b'-')) {
                self.bump();
            }
            while matches!(self.peek(), Some(b) if b.is_ascii_digit()) {
                self.bump();
            }
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
        if is_float {
            let v: f64 = text.parse().map_err(|_| self.err(self.line, self.column, format!("bad float literal {}", text)))?;
            Ok(TokenKind::Float(v))
        } else {
            let v: i64 = text.parse().map_err(|_| self.err(self.line, self.column, format!("integer literal {} out of range", text)))?;
            Ok(TokenKind::Int(v))
        }
    }

    fn string_lit(&mut self) -> Result<TokenKind> {
        let (line, column) = (self.line, self.column);
        self.bump(); // opening quote
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(self.err(line, column, "unterminated string literal")),
                Some(b'"') => break,
                Some(b'\\') => match self.bump() {
                    Some(b'n') => out.push('\n'),
                    Some(b't') => out.push('\t'),
                    Some(b'"') => out.push('"'),
                    Some(b'\\') => out.push('\\'),
                    Some(other) => out.push(other as char),
                    None => return Err(self.err(line, column, "unterminated string literal")),
                },
                Some(b) => out.push(b as char),
            }
        }
        Ok(TokenKind::Str(out))
    }

    fn ident(&mut self) -> TokenKind {
        let start = self.pos;
        while matches!(self.peek(), Some(b) if b.is_ascii_alphanumeric() || b == b'_') {
            self.bump();
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap().to_string();
        keyword(&text).unwrap_or(TokenKind::Ident(text))
    }

    /// Tokenize the whole source into a flat vector ending with `Eof`.
    /// Doc comments are emitted as their own `TokenKind::DocComment`
    /// tokens so the parser can attach the most recent one to the next
    /// definition.
    pub fn tokenize(mut self) -> Result<Vec<Token>> {
        let mut out = Vec::new();
        loop {
            let doc = self.skip_trivia()?;
            let (line, column) = (self.line, self.column);
            if let Some(text) = doc {
                out.push(Token { kind: TokenKind::DocComment(text), line, column });
            }
            let (line, column) = (self.line, self.column);
            let kind = match self.peek() {
                None => TokenKind::Eof,
                Some(b) if b.is_ascii_digit() => self.number()?,
                Some(b'-') if matches!(self.peek_at(1), Some(b) if b.is_ascii_digit()) => self.number()?,
                Some(b'"') => self.string_lit()?,
                Some(b) if b.is_ascii_alphabetic() || b == b'_' => self.ident(),
                Some(b'{') => { self.bump(); TokenKind::LBrace }
                Some(b'}') => { self.bump(); TokenKind::RBrace }
                Some(b'[') => { self.bump(); TokenKind::LBracket }
                Some(b']') => { self.bump(); TokenKind::RBracket }
                Some(b'(') => { self.bump(); TokenKind::LParen }
                Some(b')') => { self.bump(); TokenKind::RParen }
                Some(b';') => { self.bump(); TokenKind::Semi }
                Some(b':') => { self.bump(); TokenKind::Colon }
                Some(b',') => { self.bump(); TokenKind::Comma }
                Some(b'@') => { self.bump(); TokenKind::At }
                Some(b'.') => { self.bump(); TokenKind::Dot }
                Some(b'~') => { self.bump(); TokenKind::Tilde }
                Some(b'^') => { self.bump(); TokenKind::Caret }
                Some(b'=') => {
                    self.bump();
                    if self.peek() == Some(b'=') { self.bump(); TokenKind::EqEq } else { TokenKind::Eq }
                }
                Some(b'!') => {
                    self.bump();
                    if self.peek() == Some(b'=') { self.bump(); TokenKind::NotEq } else { TokenKind::Bang }
                }
                Some(b'<') => {
                    self.bump();
                    match self.peek() {
                        Some(b'=') => { self.bump(); TokenKind::Le }
                        Some(b'<') => { self.bump(); TokenKind::Shl }
                        _ => TokenKind::Lt,
                    }
                }
                Some(b'>') => {
                    self.bump();
                    match self.peek() {
                        Some(b'=') => { self.bump(); TokenKind::Ge }
                        Some(b'>') => { self.bump(); TokenKind::Shr }
                        _ => TokenKind::Gt,
                    }
                }
                Some(b'&') => {
                    self.bump();
                    if self.peek() == Some(b'&') { self.bump(); TokenKind::AmpAmp } else { TokenKind::Amp }
                }
                Some(b'|') => {
                    self.bump();
                    if self.peek() == Some(b'|') { self.bump(); TokenKind::PipePipe } else { TokenKind::Pipe }
                }
                Some(other) => {
                    self.bump();
                    return Err(self.err(line, column, format!("unrecognized byte {:#04x} ({:?})", other, other as char)));
                }
            };
            let is_eof = kind == TokenKind::Eof;
            out.push(Token { kind, line, column });
            if is_eof {
                break;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        Lexer::new(src).tokenize().unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn struct_header_tokens() {
        let ks = kinds("struct Foo { }");
        assert_eq!(ks, vec![
            TokenKind::Struct,
            TokenKind::Ident("Foo".into()),
            TokenKind::LBrace,
            TokenKind::RBrace,
            TokenKind::Eof,
        ]);
    }

    #[test]
    fn numeric_literals() {
        let ks = kinds("0x1F 42 3.5 -1");
        assert_eq!(ks[0], TokenKind::Int(0x1F));
        assert_eq!(ks[1], TokenKind::Int(42));
        assert_eq!(ks[2], TokenKind::Float(3.5));
        // leading '-' immediately before a digit folds into the literal.
        assert_eq!(ks[3], TokenKind::Int(-1));
    }

    #[test]
    fn negative_hex_literal() {
        let ks = kinds("-0x10");
        assert_eq!(ks[0], TokenKind::Int(-16));
    }

    #[test]
    fn doc_comment_attaches_before_next_token() {
        let toks = Lexer::new("/// a field\nfield: u8;").tokenize().unwrap();
        assert_eq!(toks[0].kind, TokenKind::DocComment("a field".into()));
    }

    #[test]
    fn line_comment_is_discarded() {
        let ks = kinds("// not a doc\nstruct X {}");
        assert_eq!(ks[0], TokenKind::Struct);
    }

    #[test]
    fn block_comment_is_discarded() {
        let ks = kinds("/* hi */ struct X {}");
        assert_eq!(ks[0], TokenKind::Struct);
    }

    #[test]
    fn string_literal_with_escape() {
        let ks = kinds("\"a\\nb\"");
        assert_eq!(ks[0], TokenKind::Str("a\nb".into()));
    }

    #[test]
    fn two_char_operators() {
        let ks = kinds("== != <= >= && || << >>");
        assert_eq!(ks, vec![
            TokenKind::EqEq, TokenKind::NotEq, TokenKind::Le, TokenKind::Ge,
            TokenKind::AmpAmp, TokenKind::PipePipe, TokenKind::Shl, TokenKind::Shr,
            TokenKind::Eof,
        ]);
    }

    #[test]
    fn unrecognized_byte_is_lex_error() {
        let err = Lexer::new("struct $").tokenize().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Lex);
    }
}
