//! Guard-expression parsing and lowering. Precedence, loosest to
//! tightest:
//! `|| > && > | > ^ > & > ==/!= > </>/<=/>= > <<,>> > unary > primary`.
//! Parsing produces an `ast::Expr` tree rather than bytecode directly, so a
//! guard living inside a struct can be re-lowered under a dotted key prefix
//! every time that struct is inlined, exactly like a field's own key id.

use std::collections::HashMap;

use crate::compiler::ast::{BinaryOp, EnumDef, Expr, UnaryOp};
use crate::compiler::interner::Interner;
use crate::compiler::token::{Cursor, TokenKind};
use crate::error::{Error, ErrorContext, ErrorKind, Result};
use crate::vm::opcode::Opcode;

struct ExprCtx {
    line: u32,
    column: u32,
}
impl ErrorContext for ExprCtx {
    fn error_context(&self) -> String {
        format!("line {} column {}", self.line, self.column)
    }
}

fn err(cur: &Cursor, msg: impl Into<String>) -> Error {
    Error::new(
        ErrorKind::Parse,
        Some(ExprCtx { line: cur.line(), column: cur.column() }.error_context()),
        msg.into(),
    )
}

/// Parses one guard expression starting at `cur`'s current position.
/// `enums` resolves `Enum.Value` sugar to its backing integer immediately,
/// since that lookup never depends on a struct inlining prefix.
pub fn parse_expr(cur: &mut Cursor, enums: &HashMap<String, EnumDef>) -> Result<Expr> {
    parse_or(cur, enums)
}

fn parse_or(cur: &mut Cursor, enums: &HashMap<String, EnumDef>) -> Result<Expr> {
    let mut lhs = parse_and(cur, enums)?;
    while matches!(cur.peek(), TokenKind::PipePipe) {
        cur.bump();
        let rhs = parse_and(cur, enums)?;
        lhs = Expr::Binary(BinaryOp::LogOr, Box::new(lhs), Box::new(rhs));
    }
    Ok(lhs)
}

fn parse_and(cur: &mut Cursor, enums: &HashMap<String, EnumDef>) -> Result<Expr> {
    let mut lhs = parse_bitor(cur, enums)?;
    while matches!(cur.peek(), TokenKind::AmpAmp) {
        cur.bump();
        let rhs = parse_bitor(cur, enums)?;
        lhs = Expr::Binary(BinaryOp::LogAnd, Box::new(lhs), Box::new(rhs));
    }
    Ok(lhs)
}

fn parse_bitor(cur: &mut Cursor, enums: &HashMap<String, EnumDef>) -> Result<Expr> {
    let mut lhs = parse_bitxor(cur, enums)?;
    while matches!(cur.peek(), TokenKind::Pipe) {
        cur.bump();
        let rhs = parse_bitxor(cur, enums)?;
        lhs = Expr::Binary(BinaryOp::BitOr, Box::new(lhs), Box::new(rhs));
    }
    Ok(lhs)
}

fn parse_bitxor(cur: &mut Cursor, enums: &HashMap<String, EnumDef>) -> Result<Expr> {
    let mut lhs = parse_bitand(cur, enums)?;
    while matches!(cur.peek(), TokenKind::Caret) {
        cur.bump();
        let rhs = parse_bitand(cur, enums)?;
        lhs = Expr::Binary(BinaryOp::BitXor, Box::new(lhs), Box::new(rhs));
    }
    Ok(lhs)
}

fn parse_bitand(cur: &mut Cursor, enums: &HashMap<String, EnumDef>) -> Result<Expr> {
    let mut lhs = parse_eq(cur, enums)?;
    while matches!(cur.peek(), TokenKind::Amp) {
        cur.bump();
        let rhs = parse_eq(cur, enums)?;
        lhs = Expr::Binary(BinaryOp::BitAnd, Box::new(lhs), Box::new(rhs));
    }
    Ok(lhs)
}

fn parse_eq(cur: &mut Cursor, enums: &HashMap<String, EnumDef>) -> Result<Expr> {
    let mut lhs = parse_cmp(cur, enums)?;
    loop {
        let op = match cur.peek() {
            TokenKind::EqEq => BinaryOp::Eq,
            TokenKind::NotEq => BinaryOp::Neq,
            _ => break,
        };
        cur.bump();
        let rhs = parse_cmp(cur, enums)?;
        lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
    }
    Ok(lhs)
}

fn parse_cmp(cur: &mut Cursor, enums: &HashMap<String, EnumDef>) -> Result<Expr> {
    let mut lhs = parse_shift(cur, enums)?;
    loop {
        let op = match cur.peek() {
            TokenKind::Lt => BinaryOp::Lt,
            TokenKind::Gt => BinaryOp::Gt,
            TokenKind::Le => BinaryOp::Le,
            TokenKind::Ge => BinaryOp::Ge,
            _ => break,
        };
        cur.bump();
        let rhs = parse_shift(cur, enums)?;
        lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
    }
    Ok(lhs)
}

fn parse_shift(cur: &mut Cursor, enums: &HashMap<String, EnumDef>) -> Result<Expr> {
    let mut lhs = parse_unary(cur, enums)?;
    loop {
        let op = match cur.peek() {
            TokenKind::Shl => BinaryOp::Shl,
            TokenKind::Shr => BinaryOp::Shr,
            _ => break,
        };
        cur.bump();
        let rhs = parse_unary(cur, enums)?;
        lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
    }
    Ok(lhs)
}

fn parse_unary(cur: &mut Cursor, enums: &HashMap<String, EnumDef>) -> Result<Expr> {
    match cur.peek() {
        TokenKind::Bang => {
            cur.bump();
            Ok(Expr::Unary(UnaryOp::Not, Box::new(parse_unary(cur, enums)?)))
        }
        TokenKind::Tilde => {
            cur.bump();
            Ok(Expr::Unary(UnaryOp::BitNot, Box::new(parse_unary(cur, enums)?)))
        }
        _ => parse_primary(cur, enums),
    }
}

fn parse_primary(cur: &mut Cursor, enums: &HashMap<String, EnumDef>) -> Result<Expr> {
    match cur.peek().clone() {
        TokenKind::Int(v) => {
            cur.bump();
            Ok(Expr::IntLit(v))
        }
        TokenKind::Float(v) => {
            cur.bump();
            Ok(Expr::FloatLit(v))
        }
        TokenKind::True => {
            cur.bump();
            Ok(Expr::IntLit(1))
        }
        TokenKind::False => {
            cur.bump();
            Ok(Expr::IntLit(0))
        }
        TokenKind::LParen => {
            cur.bump();
            let inner = parse_or(cur, enums)?;
            if !matches!(cur.peek(), TokenKind::RParen) {
                return Err(err(cur, "expected ')'"));
            }
            cur.bump();
            Ok(inner)
        }
        TokenKind::Ident(name) => {
            cur.bump();
            if matches!(cur.peek(), TokenKind::Dot) {
                cur.bump();
                let value_name = match cur.peek().clone() {
                    TokenKind::Ident(v) => v,
                    _ => return Err(err(cur, "expected enum value name after '.'")),
                };
                cur.bump();
                let def = enums
                    .get(&name)
                    .ok_or_else(|| err(cur, format!("unknown enum '{}'", name)))?;
                let entry = def
                    .entries
                    .iter()
                    .find(|e| e.name == value_name)
                    .ok_or_else(|| err(cur, format!("enum '{}' has no value '{}'", name, value_name)))?;
                Ok(Expr::IntLit(entry.value))
            } else {
                Ok(Expr::Ident(name))
            }
        }
        other => Err(err(cur, format!("unexpected token {:?} in expression", other))),
    }
}

/// Lowers `expr` into stack bytecode, appending it to `out`. Identifiers
/// resolve to `prefix.name` (dotted) when `prefix` is set, matching the key
/// id a sibling field would get under the same struct inlining.
pub fn lower_expr(out: &mut Vec<u8>, expr: &Expr, interner: &mut Interner, prefix: Option<&str>) {
    match expr {
        Expr::IntLit(v) => {
            out.push(Opcode::PushImm.as_u8());
            out.extend_from_slice(&(*v as u64).to_le_bytes());
        }
        Expr::FloatLit(v) => {
            out.push(Opcode::PushImm.as_u8());
            out.extend_from_slice(&v.to_bits().to_le_bytes());
        }
        Expr::Ident(name) => {
            let full = match prefix {
                Some(p) => format!("{}.{}", p, name),
                None => name.clone(),
            };
            let key = interner.intern(&full);
            out.push(Opcode::LoadCtx.as_u8());
            out.extend_from_slice(&key.to_le_bytes());
        }
        Expr::Unary(op, inner) => {
            lower_expr(out, inner, interner, prefix);
            out.push(match op {
                UnaryOp::Not => Opcode::LogNot.as_u8(),
                UnaryOp::BitNot => Opcode::BitNot.as_u8(),
            });
        }
        Expr::Binary(op, lhs, rhs) => {
            lower_expr(out, lhs, interner, prefix);
            lower_expr(out, rhs, interner, prefix);
            out.push(match op {
                BinaryOp::LogOr => Opcode::LogOr.as_u8(),
                BinaryOp::LogAnd => Opcode::LogAnd.as_u8(),
                BinaryOp::BitOr => Opcode::BitOr.as_u8(),
                BinaryOp::BitXor => Opcode::BitXor.as_u8(),
                BinaryOp::BitAnd => Opcode::BitAnd.as_u8(),
                BinaryOp::Eq => Opcode::Eq.as_u8(),
                BinaryOp::Neq => Opcode::Neq.as_u8(),
                BinaryOp::Lt => Opcode::Lt.as_u8(),
                BinaryOp::Gt => Opcode::Gt.as_u8(),
                BinaryOp::Le => Opcode::Lte.as_u8(),
                BinaryOp::Ge => Opcode::Gte.as_u8(),
                BinaryOp::Shl => Opcode::Shl.as_u8(),
                BinaryOp::Shr => Opcode::Shr.as_u8(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::lexer::Lexer;

    fn parse(src: &str) -> Expr {
        let toks = Lexer::new(src).tokenize().unwrap();
        let mut cur = Cursor::new(&toks);
        parse_expr(&mut cur, &HashMap::new()).unwrap()
    }

    #[test]
    fn precedence_or_binds_loosest() {
        let e = parse("a && b || c");
        match e {
            Expr::Binary(BinaryOp::LogOr, lhs, _) => {
                assert!(matches!(*lhs, Expr::Binary(BinaryOp::LogAnd, _, _)));
            }
            _ => panic!("expected top-level ||"),
        }
    }

    #[test]
    fn comparison_binds_tighter_than_equality() {
        let e = parse("a < b == c");
        match e {
            Expr::Binary(BinaryOp::Eq, lhs, _) => {
                assert!(matches!(*lhs, Expr::Binary(BinaryOp::Lt, _, _)));
            }
            _ => panic!("expected top-level =="),
        }
    }

    #[test]
    fn parens_override_precedence() {
        let e = parse("(a || b) && c");
        assert!(matches!(e, Expr::Binary(BinaryOp::LogAnd, _, _)));
    }

    #[test]
    fn enum_value_sugar_resolves_to_int_literal() {
        let mut enums = HashMap::new();
        enums.insert(
            "Kind".to_string(),
            EnumDef {
                name: "Kind".into(),
                line: 1,
                doc: None,
                underlying: crate::vm::opcode::ScalarType::U8,
                entries: vec![crate::compiler::ast::EnumEntry { name: "A".into(), value: 0, doc: None }, crate::compiler::ast::EnumEntry { name: "B".into(), value: 1, doc: None }],
            },
        );
        let toks = Lexer::new("kind == Kind.B").tokenize().unwrap();
        let mut cur = Cursor::new(&toks);
        let e = parse_expr(&mut cur, &enums).unwrap();
        match e {
            Expr::Binary(BinaryOp::Eq, _, rhs) => assert_eq!(*rhs, Expr::IntLit(1)),
            _ => panic!("expected =="),
        }
    }

    #[test]
    fn lowering_emits_loadctx_and_pushimm() {
        let e = parse("x == 5");
        let mut interner = Interner::new();
        let mut out = Vec::new();
        lower_expr(&mut out, &e, &mut interner, Some("parent"));
        assert_eq!(out[0], Opcode::LoadCtx.as_u8());
        assert_eq!(interner.get(0), Some("parent.x"));
        assert_eq!(*out.last().unwrap(), Opcode::Eq.as_u8());
    }
}
