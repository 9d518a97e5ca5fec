//! Recursive-descent parser. Turns a token stream into the top-level
//! items of one source file: `@version`/`@import`/
//! `@big_endian`/`@little_endian` file-level statements, and `struct`/
//! `enum`/`packet` definitions. Import resolution, cross-file name
//! registries, and codegen all happen one layer up, in `compiler::mod`,
//! since a single file's parse doesn't know the names its imports define.

use std::collections::HashMap;

use crate::compiler::ast::{
    ArraySpec, Decorator, EndianSpec, EnumDef, EnumEntry, FieldDecl, FieldType, Item, LenArg,
    Literal, PacketDef, StringSpec, StructDef, SwitchCase,
};
use crate::compiler::expr;
use crate::compiler::lexer::Lexer;
use crate::compiler::token::{Cursor, Token, TokenKind};
use crate::error::{Error, ErrorContext, ErrorKind, Result};
use crate::vm::opcode::ScalarType;

/// One `@import "path";` statement, resolved by the caller (`compiler::mod`).
#[derive(Debug, Clone)]
pub struct ImportStmt {
    pub path: String,
    pub line: u32,
}

/// Everything one source file's parse produces, before imports are
/// resolved and definitions merged across files.
#[derive(Debug, Clone, Default)]
pub struct ParsedFile {
    pub version: Option<u8>,
    pub default_endian: Option<EndianSpec>,
    pub imports: Vec<ImportStmt>,
    pub structs: Vec<StructDef>,
    pub enums: Vec<EnumDef>,
    pub packets: Vec<PacketDef>,
}

struct ParseCtx {
    line: u32,
    column: u32,
}
impl ErrorContext for ParseCtx {
    fn error_context(&self) -> String {
        format!("line {} column {}", self.line, self.column)
    }
}

pub struct Parser<'a> {
    cur: Cursor<'a>,
    /// Populated as `///` doc comments are consumed; attached to the next
    /// struct/enum/enum-value/packet/field definition.
    pending_doc: Option<String>,
    enums_so_far: HashMap<String, EnumDef>,
}

fn err(cur: &Cursor, msg: impl Into<String>) -> Error {
    Error::new(ErrorKind::Parse, Some(ParseCtx { line: cur.line(), column: cur.column() }.error_context()), msg.into())
}

fn scalar_keyword(s: &str) -> Option<ScalarType> {
    Some(match s {
        "u8" | "uint8" => ScalarType::U8,
        "u16" | "uint16" => ScalarType::U16,
        "u32" | "uint32" => ScalarType::U32,
        "u64" | "uint64" => ScalarType::U64,
        "i8" | "int8" => ScalarType::I8,
        "i16" | "int16" => ScalarType::I16,
        "i32" | "int32" => ScalarType::I32,
        "i64" | "int64" => ScalarType::I64,
        "f32" | "float32" => ScalarType::F32,
        "f64" | "float64" => ScalarType::F64,
        "bool" => ScalarType::Bool,
        _ => return None,
    })
}

impl<'a> Parser<'a> {
    pub fn new(toks: &'a [Token]) -> Self {
        Parser { cur: Cursor::new(toks), pending_doc: None, enums_so_far: HashMap::new() }
    }

    /// Tokenizes `src` and parses a whole file, collecting as many
    /// `CompilerError`-shaped diagnostics as possible rather than stopping
    /// at the first one: a failed definition is skipped by resyncing to
    /// the next file-level boundary (`struct`/`enum`/`packet`/`@`/eof).
    /// Returns the parsed file plus every diagnostic collected along the
    /// way, each tagged with the `ErrorKind` it was raised with (`Lex` for
    /// a tokenizer failure, `Parse` for everything `parse_top_item` rejects)
    /// so a caller with `CompileOptions::json_diagnostics` set can surface
    /// the error kind as a structured field rather than only prose.
    pub fn parse_source(src: &str) -> (ParsedFile, Vec<(u32, u32, String, ErrorKind)>) {
        let toks = match Lexer::new(src).tokenize() {
            Ok(t) => t,
            Err(e) => return (ParsedFile::default(), vec![(0, 0, format!("{}", e), e.kind())]),
        };
        let mut parser = Parser::new(&toks);
        let mut file = ParsedFile::default();
        let mut errors = Vec::new();
        loop {
            parser.skip_docs();
            if parser.cur.at_eof() {
                break;
            }
            let (line, column) = (parser.cur.line(), parser.cur.column());
            if let Err(e) = parser.parse_top_item(&mut file) {
                errors.push((line, column, format!("{}", e), e.kind()));
                parser.resync_top_level();
            }
        }
        (file, errors)
    }

    fn skip_docs(&mut self) {
        while let TokenKind::DocComment(text) = self.cur.peek().clone() {
            self.pending_doc = Some(text);
            self.cur.bump();
        }
    }

    fn take_doc(&mut self) -> Option<String> {
        self.pending_doc.take()
    }

    fn resync_top_level(&mut self) {
        loop {
            match self.cur.peek() {
                TokenKind::Eof | TokenKind::Struct | TokenKind::Enum | TokenKind::Packet | TokenKind::At => break,
                _ => {
                    self.cur.bump();
                }
            }
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> Result<()> {
        if self.cur.peek() == kind {
            self.cur.bump();
            Ok(())
        } else {
            Err(err(&self.cur, format!("expected {}, found {:?}", what, self.cur.peek())))
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<String> {
        match self.cur.peek().clone() {
            TokenKind::Ident(s) => {
                self.cur.bump();
                Ok(s)
            }
            other => Err(err(&self.cur, format!("expected {}, found {:?}", what, other))),
        }
    }

    fn expect_int(&mut self, what: &str) -> Result<i64> {
        match self.cur.peek().clone() {
            TokenKind::Int(v) => {
                self.cur.bump();
                Ok(v)
            }
            other => Err(err(&self.cur, format!("expected {}, found {:?}", what, other))),
        }
    }

    fn expect_number(&mut self) -> Result<Literal> {
        match self.cur.peek().clone() {
            TokenKind::Int(v) => {
                self.cur.bump();
                Ok(Literal::Int(v))
            }
            TokenKind::Float(v) => {
                self.cur.bump();
                Ok(Literal::Float(v))
            }
            other => Err(err(&self.cur, format!("expected number, found {:?}", other))),
        }
    }

    fn parse_top_item(&mut self, file: &mut ParsedFile) -> Result<()> {
        match self.cur.peek().clone() {
            TokenKind::At => self.parse_top_decorator(file),
            TokenKind::Struct => {
                let s = self.parse_struct()?;
                file.structs.push(s);
                Ok(())
            }
            TokenKind::Enum => {
                let e = self.parse_enum()?;
                self.enums_so_far.insert(e.name.clone(), e.clone());
                file.enums.push(e);
                Ok(())
            }
            TokenKind::Packet => {
                let p = self.parse_packet()?;
                file.packets.push(p);
                Ok(())
            }
            other => Err(err(&self.cur, format!("expected struct/enum/packet/decorator, found {:?}", other))),
        }
    }

    fn parse_top_decorator(&mut self, file: &mut ParsedFile) -> Result<()> {
        self.cur.bump(); // '@'
        let name = self.expect_ident("decorator name")?;
        match name.as_str() {
            "version" => {
                self.expect(&TokenKind::LParen, "'('")?;
                let v = self.expect_int("version number")?;
                self.expect(&TokenKind::RParen, "')'")?;
                self.expect(&TokenKind::Semi, "';'")?;
                file.version = Some(v as u8);
            }
            "import" => {
                let line = self.cur.line();
                let path = match self.cur.peek().clone() {
                    TokenKind::Str(s) => {
                        self.cur.bump();
                        s
                    }
                    other => return Err(err(&self.cur, format!("expected import path string, found {:?}", other))),
                };
                self.expect(&TokenKind::Semi, "';'")?;
                file.imports.push(ImportStmt { path, line });
            }
            "big_endian" => {
                self.expect(&TokenKind::Semi, "';'")?;
                file.default_endian = Some(EndianSpec::Big);
            }
            "little_endian" => {
                self.expect(&TokenKind::Semi, "';'")?;
                file.default_endian = Some(EndianSpec::Little);
            }
            other => Err(err(&self.cur, format!("unknown file-level decorator '@{}'", other)))?,
        }
        Ok(())
    }

    fn parse_struct(&mut self) -> Result<StructDef> {
        let doc = self.take_doc();
        let line = self.cur.line();
        self.cur.bump(); // 'struct'
        let name = self.expect_ident("struct name")?;
        let mut unaligned_bytes = false;
        // Struct-level decorators, e.g. `struct Foo @unaligned_bytes { ... }`.
        while matches!(self.cur.peek(), TokenKind::At) {
            self.cur.bump();
            let dname = self.expect_ident("struct decorator name")?;
            if dname == "unaligned_bytes" {
                unaligned_bytes = true;
            } else {
                return Err(err(&self.cur, format!("unknown struct decorator '@{}'", dname)));
            }
        }
        self.expect(&TokenKind::LBrace, "'{'")?;
        let items = self.parse_items()?;
        self.expect(&TokenKind::RBrace, "'}'")?;
        Ok(StructDef { name, line, doc, unaligned_bytes, items })
    }

    fn parse_packet(&mut self) -> Result<PacketDef> {
        let doc = self.take_doc();
        let line = self.cur.line();
        self.cur.bump(); // 'packet'
        let name = self.expect_ident("packet name")?;
        self.expect(&TokenKind::LBrace, "'{'")?;
        let items = self.parse_items()?;
        self.expect(&TokenKind::RBrace, "'}'")?;
        Ok(PacketDef { name, line, doc, items })
    }

    fn parse_enum(&mut self) -> Result<EnumDef> {
        let doc = self.take_doc();
        let line = self.cur.line();
        self.cur.bump(); // 'enum'
        let name = self.expect_ident("enum name")?;
        self.expect(&TokenKind::Colon, "':'")?;
        let ty_name = self.expect_ident("enum underlying type")?;
        let underlying = scalar_keyword(&ty_name).ok_or_else(|| err(&self.cur, format!("'{}' is not a valid enum underlying type", ty_name)))?;
        self.expect(&TokenKind::LBrace, "'{'")?;
        let mut entries = Vec::new();
        let mut next_value = 0i64;
        loop {
            self.skip_docs();
            if matches!(self.cur.peek(), TokenKind::RBrace) {
                break;
            }
            let entry_doc = self.take_doc();
            let ename = self.expect_ident("enum value name")?;
            let value = if matches!(self.cur.peek(), TokenKind::Eq) {
                self.cur.bump();
                self.expect_int("enum value")?
            } else {
                next_value
            };
            if entries.iter().any(|e: &EnumEntry| e.name == ename) {
                return Err(err(&self.cur, format!("duplicate enum value name '{}'", ename)));
            }
            entries.push(EnumEntry { name: ename, value, doc: entry_doc });
            next_value = value + 1;
            if matches!(self.cur.peek(), TokenKind::Comma) {
                self.cur.bump();
            } else {
                break;
            }
        }
        self.skip_docs();
        self.expect(&TokenKind::RBrace, "'}'")?;
        Ok(EnumDef { name, line, doc, underlying, entries })
    }

    fn parse_items(&mut self) -> Result<Vec<Item>> {
        let mut items = Vec::new();
        loop {
            self.skip_docs();
            if matches!(self.cur.peek(), TokenKind::RBrace | TokenKind::Eof) {
                break;
            }
            items.push(self.parse_item()?);
        }
        Ok(items)
    }

    fn parse_item(&mut self) -> Result<Item> {
        match self.cur.peek().clone() {
            TokenKind::If => self.parse_if(),
            TokenKind::Switch => self.parse_switch(),
            TokenKind::At if self.is_standalone_pad_or_fill() => self.parse_pad_or_fill(),
            _ => self.parse_field().map(Item::Field),
        }
    }

    /// `@pad(...)`/`@fill(...)` are the only decorators allowed to start a
    /// standalone statement (no type/identifier follows); every other `@`
    /// at item position begins a field's decorator list.
    fn is_standalone_pad_or_fill(&self) -> bool {
        matches!(self.cur.peek_at(1), TokenKind::Ident(n) if n == "pad" || n == "fill")
    }

    fn parse_pad_or_fill(&mut self) -> Result<Item> {
        self.cur.bump(); // '@'
        let name = self.expect_ident("'pad' or 'fill'")?;
        self.expect(&TokenKind::LParen, "'('")?;
        let item = if name == "pad" {
            let bits = self.expect_int("pad bit count")?;
            Item::Pad(bits as u32)
        } else {
            let value = if matches!(self.cur.peek(), TokenKind::RParen) { 0 } else { self.expect_int("fill byte value")? };
            Item::Fill(value as u8)
        };
        self.expect(&TokenKind::RParen, "')'")?;
        self.expect(&TokenKind::Semi, "';'")?;
        Ok(item)
    }

    fn parse_if(&mut self) -> Result<Item> {
        self.cur.bump(); // 'if'
        self.expect(&TokenKind::LParen, "'('")?;
        let cond = expr::parse_expr(&mut self.cur, &self.enums_so_far)?;
        self.expect(&TokenKind::RParen, "')'")?;
        self.expect(&TokenKind::LBrace, "'{'")?;
        let then_body = self.parse_items()?;
        self.expect(&TokenKind::RBrace, "'}'")?;
        let else_body = if matches!(self.cur.peek(), TokenKind::Else) {
            self.cur.bump();
            self.expect(&TokenKind::LBrace, "'{'")?;
            let body = self.parse_items()?;
            self.expect(&TokenKind::RBrace, "'}'")?;
            body
        } else {
            Vec::new()
        };
        Ok(Item::If { cond, then_body, else_body })
    }

    fn parse_switch(&mut self) -> Result<Item> {
        self.cur.bump(); // 'switch'
        self.expect(&TokenKind::LParen, "'('")?;
        let key = self.expect_ident("switch discriminant field name")?;
        self.expect(&TokenKind::RParen, "')'")?;
        self.expect(&TokenKind::LBrace, "'{'")?;
        let mut cases = Vec::new();
        let mut default = Vec::new();
        loop {
            self.skip_docs();
            match self.cur.peek().clone() {
                TokenKind::Case => {
                    self.cur.bump();
                    let value = self.parse_case_label()?;
                    self.expect(&TokenKind::LBrace, "'{'")?;
                    let body = self.parse_items()?;
                    self.expect(&TokenKind::RBrace, "'}'")?;
                    cases.push(SwitchCase { value, body });
                }
                TokenKind::Default => {
                    self.cur.bump();
                    self.expect(&TokenKind::LBrace, "'{'")?;
                    default = self.parse_items()?;
                    self.expect(&TokenKind::RBrace, "'}'")?;
                }
                TokenKind::RBrace => break,
                other => return Err(err(&self.cur, format!("expected 'case'/'default'/'}}', found {:?}", other))),
            }
        }
        self.expect(&TokenKind::RBrace, "'}'")?;
        Ok(Item::Switch { key, cases, default })
    }

    fn parse_case_label(&mut self) -> Result<i64> {
        match self.cur.peek().clone() {
            TokenKind::Int(v) => {
                self.cur.bump();
                self.expect(&TokenKind::Colon, "':'")?;
                Ok(v)
            }
            TokenKind::Ident(enum_name) => {
                self.cur.bump();
                self.expect(&TokenKind::Dot, "'.'")?;
                let value_name = self.expect_ident("enum value name")?;
                self.expect(&TokenKind::Colon, "':'")?;
                let def = self.enums_so_far.get(&enum_name).ok_or_else(|| err(&self.cur, format!("unknown enum '{}'", enum_name)))?;
                let entry = def.entries.iter().find(|e| e.name == value_name).ok_or_else(|| err(&self.cur, format!("enum '{}' has no value '{}'", enum_name, value_name)))?;
                Ok(entry.value)
            }
            other => Err(err(&self.cur, format!("expected case label, found {:?}", other))),
        }
    }

    fn parse_field(&mut self) -> Result<FieldDecl> {
        let doc = self.take_doc();
        let line = self.cur.line();
        let mut decorators = Vec::new();
        while matches!(self.cur.peek(), TokenKind::At) {
            decorators.push(self.parse_field_decorator()?);
        }
        let ty_name = self.expect_ident("field type")?;
        let ty = if let Some(st) = scalar_keyword(&ty_name) {
            FieldType::Scalar(st)
        } else if ty_name == "string" {
            FieldType::Str
        } else if ty_name == "bytes" {
            FieldType::Bytes
        } else {
            FieldType::Named(ty_name)
        };
        let name = self.expect_ident("field name")?;

        let bit_width = if matches!(self.cur.peek(), TokenKind::Colon) {
            self.cur.bump();
            Some(self.expect_int("bit width")? as u8)
        } else {
            None
        };

        let mut array = None;
        if matches!(self.cur.peek(), TokenKind::LBracket) {
            self.cur.bump();
            if matches!(self.cur.peek(), TokenKind::Int(_)) {
                let n = self.expect_int("array count")?;
                array = Some(ArraySpec::Fixed(n as u32));
            }
            self.expect(&TokenKind::RBracket, "']'")?;
            if array.is_none() {
                array = Some(self.parse_array_modifier(&decorators)?);
            }
        }

        let mut string_spec = None;
        if matches!(&ty, FieldType::Str) {
            string_spec = Some(self.parse_string_spec()?);
        }

        self.expect(&TokenKind::Semi, "';'")?;
        Ok(FieldDecl { name, line, doc, ty, bit_width, array, string_spec, decorators })
    }

    /// After a bare `[]`, one of `prefix TYPE` / `until eof` must follow, or
    /// the field must carry an `@len(...)`/`@count(...)` decorator, the
    /// same length-policy rule a dynamically-sized string uses generalized
    /// to arrays of any element type.
    fn parse_array_modifier(&mut self, decorators: &[Decorator]) -> Result<ArraySpec> {
        match self.cur.peek().clone() {
            TokenKind::Ident(kw) if kw == "prefix" => {
                self.cur.bump();
                let width = self.expect_ident("prefix width (u8/u16/u32)")?;
                match width.as_str() {
                    "u8" => Ok(ArraySpec::PrefixU8),
                    "u16" => Ok(ArraySpec::PrefixU16),
                    "u32" => Ok(ArraySpec::PrefixU32),
                    other => Err(err(&self.cur, format!("'{}' is not a valid prefix width", other))),
                }
            }
            TokenKind::Ident(kw) if kw == "until" => {
                self.cur.bump();
                let what = self.expect_ident("'eof'")?;
                if what != "eof" {
                    return Err(err(&self.cur, "arrays only support 'until eof'"));
                }
                Ok(ArraySpec::Eof)
            }
            _ => {
                for d in decorators {
                    if let Decorator::Len(arg) = d {
                        return Ok(match arg {
                            LenArg::Name(name) => ArraySpec::Dynamic(name.clone()),
                            LenArg::Fixed(n) => ArraySpec::Fixed(*n),
                        });
                    }
                }
                Err(err(&self.cur, "variable-length array needs 'prefix TYPE', 'until eof', or an '@len(...)'/'@count(...)' decorator"))
            }
        }
    }

    fn parse_string_spec(&mut self) -> Result<StringSpec> {
        match self.cur.peek().clone() {
            TokenKind::Ident(kw) if kw == "prefix" => {
                self.cur.bump();
                let width = self.expect_ident("prefix width (u8/u16/u32)")?;
                match width.as_str() {
                    "u8" => Ok(StringSpec::PrefixU8),
                    "u16" => Ok(StringSpec::PrefixU16),
                    "u32" => Ok(StringSpec::PrefixU32),
                    other => Err(err(&self.cur, format!("'{}' is not a valid prefix width", other))),
                }
            }
            TokenKind::Ident(kw) if kw == "until" => {
                self.cur.bump();
                let term = self.expect_int("terminator value (must be 0)")?;
                if term != 0 {
                    return Err(err(&self.cur, "only 'until 0' (NUL-terminated) strings are supported"));
                }
                let max_len = if matches!(self.cur.peek(), TokenKind::Ident(kw) if kw == "max") {
                    self.cur.bump();
                    self.expect_int("max length")? as u16
                } else {
                    255
                };
                Ok(StringSpec::Null { max_len })
            }
            other => Err(err(&self.cur, format!("string field needs 'prefix TYPE' or 'until 0', found {:?}", other))),
        }
    }

    fn parse_field_decorator(&mut self) -> Result<Decorator> {
        self.cur.bump(); // '@'
        let name = self.expect_ident("decorator name")?;
        let dec = match name.as_str() {
            "big_endian" | "be" => Decorator::Endian(EndianSpec::Big),
            "little_endian" | "le" => Decorator::Endian(EndianSpec::Little),
            "optional" => Decorator::Optional,
            // `@count(N)` / `@len(N)` (fixed count) and `@len(name)` /
            // `@count(name)` (runtime count from a sibling field) are
            // interchangeable spellings of one decorator.
            "len" | "count" => {
                self.expect(&TokenKind::LParen, "'('")?;
                let arg = match self.cur.peek().clone() {
                    TokenKind::Ident(name) => {
                        self.cur.bump();
                        LenArg::Name(name)
                    }
                    TokenKind::Int(v) => {
                        self.cur.bump();
                        LenArg::Fixed(v as u32)
                    }
                    other => return Err(err(&self.cur, format!("expected field name or integer count, found {:?}", other))),
                };
                self.expect(&TokenKind::RParen, "')'")?;
                Decorator::Len(arg)
            }
            "const" => {
                self.expect(&TokenKind::LParen, "'('")?;
                let v = self.expect_number()?;
                self.expect(&TokenKind::RParen, "')'")?;
                Decorator::Const(v)
            }
            "match" => {
                self.expect(&TokenKind::LParen, "'('")?;
                let v = self.expect_number()?;
                self.expect(&TokenKind::RParen, "')'")?;
                Decorator::Match(v)
            }
            "range" => {
                self.expect(&TokenKind::LParen, "'('")?;
                let lo = self.expect_number()?;
                self.expect(&TokenKind::Comma, "','")?;
                let hi = self.expect_number()?;
                self.expect(&TokenKind::RParen, "')'")?;
                Decorator::Range(lo, hi)
            }
            "crc" => {
                self.expect(&TokenKind::LParen, "'('")?;
                let w = self.expect_int("crc width (16 or 32)")?;
                self.expect(&TokenKind::RParen, "')'")?;
                Decorator::Crc { width: w as u8 }
            }
            "crc_poly" => Decorator::CrcPoly(self.parse_int_arg()?),
            "crc_init" => Decorator::CrcInit(self.parse_int_arg()?),
            "crc_xor" => Decorator::CrcXor(self.parse_int_arg()?),
            "crc_refin" => Decorator::CrcRefIn(self.parse_bool_arg()?),
            "crc_refout" => Decorator::CrcRefOut(self.parse_bool_arg()?),
            "scale" => Decorator::Scale(self.parse_float_arg()?),
            "offset" => Decorator::Offset(self.parse_float_arg()?),
            "mul" => Decorator::Mul(self.parse_int_arg()?),
            "div" => Decorator::Div(self.parse_int_arg()?),
            "add" => Decorator::Add(self.parse_int_arg()?),
            "sub" => Decorator::Sub(self.parse_int_arg()?),
            "poly" => {
                self.expect(&TokenKind::LParen, "'('")?;
                let mut coeffs = Vec::new();
                loop {
                    coeffs.push(self.expect_number()?.as_f64());
                    if matches!(self.cur.peek(), TokenKind::Comma) {
                        self.cur.bump();
                    } else {
                        break;
                    }
                }
                self.expect(&TokenKind::RParen, "')'")?;
                Decorator::Poly(coeffs)
            }
            "spline" => {
                self.expect(&TokenKind::LParen, "'('")?;
                let mut points = Vec::new();
                loop {
                    self.expect(&TokenKind::LParen, "'('")?;
                    let x = self.expect_number()?.as_f64();
                    self.expect(&TokenKind::Comma, "','")?;
                    let y = self.expect_number()?.as_f64();
                    self.expect(&TokenKind::RParen, "')'")?;
                    points.push((x, y));
                    if matches!(self.cur.peek(), TokenKind::Comma) {
                        self.cur.bump();
                    } else {
                        break;
                    }
                }
                self.expect(&TokenKind::RParen, "')'")?;
                Decorator::Spline(points)
            }
            "unit" => {
                self.expect(&TokenKind::LParen, "'('")?;
                let text = match self.cur.peek().clone() {
                    TokenKind::Str(s) => {
                        self.cur.bump();
                        s
                    }
                    other => return Err(err(&self.cur, format!("expected unit string, found {:?}", other))),
                };
                self.expect(&TokenKind::RParen, "')'")?;
                Decorator::Unit(text)
            }
            other => return Err(err(&self.cur, format!("unknown field decorator '@{}'", other))),
        };
        Ok(dec)
    }

    fn parse_int_arg(&mut self) -> Result<i64> {
        self.expect(&TokenKind::LParen, "'('")?;
        let v = self.expect_int("integer argument")?;
        self.expect(&TokenKind::RParen, "')'")?;
        Ok(v)
    }

    fn parse_float_arg(&mut self) -> Result<f64> {
        self.expect(&TokenKind::LParen, "'('")?;
        let v = self.expect_number()?.as_f64();
        self.expect(&TokenKind::RParen, "')'")?;
        Ok(v)
    }

    fn parse_bool_arg(&mut self) -> Result<bool> {
        self.expect(&TokenKind::LParen, "'('")?;
        let v = match self.cur.peek().clone() {
            TokenKind::True => true,
            TokenKind::False => false,
            other => return Err(err(&self.cur, format!("expected true/false, found {:?}", other))),
        };
        self.cur.bump();
        self.expect(&TokenKind::RParen, "')'")?;
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_struct() {
        let (file, errors) = Parser::parse_source("struct Point {\n  u16 x;\n  u16 y;\n}\n");
        assert!(errors.is_empty(), "{:?}", errors);
        assert_eq!(file.structs.len(), 1);
        assert_eq!(file.structs[0].items.len(), 2);
    }

    #[test]
    fn parses_enum_with_explicit_and_implicit_values() {
        let (file, errors) = Parser::parse_source("enum Kind : u8 { A = 2, B, C = 10 }\n");
        assert!(errors.is_empty(), "{:?}", errors);
        let e = &file.enums[0];
        assert_eq!(e.entries[0].value, 2);
        assert_eq!(e.entries[1].value, 3);
        assert_eq!(e.entries[2].value, 10);
    }

    #[test]
    fn parses_field_with_decorators_and_array() {
        let src = "struct S {\n  @range(0,100) u8 count;\n  u8 items[] prefix u8;\n}\n";
        let (file, errors) = Parser::parse_source(src);
        assert!(errors.is_empty(), "{:?}", errors);
        let items = &file.structs[0].items;
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn parses_string_field_variants() {
        let src = "struct S {\n  string name prefix u16;\n  string label until 0 max 32;\n}\n";
        let (file, errors) = Parser::parse_source(src);
        assert!(errors.is_empty(), "{:?}", errors);
        match &file.structs[0].items[0] {
            Item::Field(f) => assert_eq!(f.string_spec, Some(StringSpec::PrefixU16)),
            _ => panic!(),
        }
        match &file.structs[0].items[1] {
            Item::Field(f) => assert_eq!(f.string_spec, Some(StringSpec::Null { max_len: 32 })),
            _ => panic!(),
        }
    }

    #[test]
    fn parses_pad_fill_if_switch() {
        let src = "packet P {\n  @pad(4);\n  @fill(0xFF);\n  u8 kind;\n  if (kind == 1) {\n    u8 extra;\n  } else {\n    u8 other;\n  }\n  switch (kind) {\n    case 1: { u8 a; }\n    default: { u8 b; }\n  }\n}\n";
        let (file, errors) = Parser::parse_source(src);
        assert!(errors.is_empty(), "{:?}", errors);
        let items = &file.packets[0].items;
        assert!(matches!(items[0], Item::Pad(4)));
        assert!(matches!(items[1], Item::Fill(0xFF)));
        assert!(matches!(items[3], Item::If { .. }));
        assert!(matches!(items[4], Item::Switch { .. }));
    }

    #[test]
    fn recovers_after_bad_field_and_keeps_parsing() {
        let src = "struct Bad {\n  @@@ garbage\n}\nstruct Good {\n  u8 x;\n}\n";
        let (file, errors) = Parser::parse_source(src);
        assert!(!errors.is_empty());
        assert!(file.structs.iter().any(|s| s.name == "Good"));
    }

    #[test]
    fn len_and_count_decorators_are_interchangeable() {
        let src = "struct S {\n  u8 n;\n  @len(n) u8 a[];\n  @count(n) u8 b[];\n  @count(4) u8 c[];\n  @len(4) u8 d[];\n}\n";
        let (file, errors) = Parser::parse_source(src);
        assert!(errors.is_empty(), "{:?}", errors);
        let items = &file.structs[0].items;
        for (idx, expected) in [(1, ArraySpec::Dynamic("n".into())), (2, ArraySpec::Dynamic("n".into())), (3, ArraySpec::Fixed(4)), (4, ArraySpec::Fixed(4))] {
            match &items[idx] {
                Item::Field(f) => assert_eq!(f.array, Some(expected)),
                _ => panic!(),
            }
        }
    }

    #[test]
    fn file_level_decorators() {
        let src = "@version(3);\n@big_endian;\n@import \"common.cds\";\nstruct S { u8 x; }\n";
        let (file, errors) = Parser::parse_source(src);
        assert!(errors.is_empty(), "{:?}", errors);
        assert_eq!(file.version, Some(3));
        assert_eq!(file.default_endian, Some(EndianSpec::Big));
        assert_eq!(file.imports.len(), 1);
        assert_eq!(file.imports[0].path, "common.cds");
    }
}
