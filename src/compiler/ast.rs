//! In-memory schema AST: struct/enum/packet definitions. The parser
//! builds these once per definition; codegen
//! (`compiler::parser::Parser::compile_items`) walks them to emit
//! bytecode, re-walking a struct's field list under a dotted key prefix
//! every time it's inlined rather than patching already-emitted bytes.

use crate::vm::opcode::ScalarType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndianSpec {
    Little,
    Big,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    Scalar(ScalarType),
    Str,
    Bytes,
    /// Reference to a struct or enum name, resolved against the
    /// compilation's definition registries at codegen time.
    Named(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
}

impl Literal {
    pub fn as_i64(self) -> i64 {
        match self {
            Literal::Int(v) => v,
            Literal::Float(v) => v as i64,
        }
    }
    pub fn as_f64(self) -> f64 {
        match self {
            Literal::Int(v) => v as f64,
            Literal::Float(v) => v,
        }
    }
}

/// How a variable-length array determines its element count.
#[derive(Debug, Clone, PartialEq)]
pub enum ArraySpec {
    Fixed(u32),
    PrefixU8,
    PrefixU16,
    PrefixU32,
    /// `until eof`: loop until the cursor reaches the end of the buffer
    /// (`ARR_EOF`).
    Eof,
    /// `@len(name)`: count supplied at runtime by the host via the named
    /// sibling field (`ARR_DYNAMIC`).
    Dynamic(String),
}

/// How a `string` field is terminated on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum StringSpec {
    PrefixU8,
    PrefixU16,
    PrefixU32,
    Null { max_len: u16 },
}

/// Argument to `@len(...)`/`@count(...)`: either a sibling field name
/// (runtime-supplied count, `ArraySpec::Dynamic`) or a literal fixed
/// count (`ArraySpec::Fixed`). `len` and `count` are interchangeable
/// spellings of the same decorator.
#[derive(Debug, Clone, PartialEq)]
pub enum LenArg {
    Name(String),
    Fixed(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decorator {
    Endian(EndianSpec),
    Optional,
    /// `@len(name)` / `@count(name)`: only meaningful on an array field;
    /// turns a `[]` suffix into `ArraySpec::Dynamic(name)` or, for a
    /// literal count, `ArraySpec::Fixed(n)`.
    Len(LenArg),
    Const(Literal),
    Match(Literal),
    Range(Literal, Literal),
    Crc { width: u8 },
    CrcPoly(i64),
    CrcInit(i64),
    CrcXor(i64),
    CrcRefIn(bool),
    CrcRefOut(bool),
    Scale(f64),
    Offset(f64),
    Mul(i64),
    Div(i64),
    Add(i64),
    Sub(i64),
    Poly(Vec<f64>),
    Spline(Vec<(f64, f64)>),
    /// Documentation-only.
    Unit(String),
}

#[derive(Debug, Clone)]
pub struct FieldDecl {
    pub name: String,
    pub line: u32,
    pub doc: Option<String>,
    pub ty: FieldType,
    pub bit_width: Option<u8>,
    pub array: Option<ArraySpec>,
    pub string_spec: Option<StringSpec>,
    pub decorators: Vec<Decorator>,
}

/// An expression AST node. Kept separate from bytecode so a guard
/// expression inside a struct can be re-lowered with a dotted key prefix
/// every time its enclosing struct is inlined, the same way a field's
/// own key id is.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    IntLit(i64),
    FloatLit(f64),
    /// Resolves to `LOAD_CTX(key_id)` of `prefix.name` (or bare `name` at
    /// top level) at lowering time.
    Ident(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    LogOr,
    LogAnd,
    BitOr,
    BitXor,
    BitAnd,
    Eq,
    Neq,
    Lt,
    Gt,
    Le,
    Ge,
    Shl,
    Shr,
}

/// One case of a `switch` body: either a bare integer or the resolved
/// value of an `Enum.Value` sugar reference (looked up against the enum
/// registry at parse time, since that resolution never depends on a key
/// prefix).
#[derive(Debug, Clone)]
pub struct SwitchCase {
    pub value: i64,
    pub body: Vec<Item>,
}

#[derive(Debug, Clone)]
pub enum Item {
    Field(FieldDecl),
    /// `@pad(bits);` as a standalone statement.
    Pad(u32),
    /// `@fill(value?);` as a standalone statement.
    Fill(u8),
    If {
        cond: Expr,
        then_body: Vec<Item>,
        else_body: Vec<Item>,
    },
    Switch {
        key: String,
        cases: Vec<SwitchCase>,
        default: Vec<Item>,
    },
}

#[derive(Debug, Clone)]
pub struct StructDef {
    pub name: String,
    pub line: u32,
    pub doc: Option<String>,
    /// `@unaligned_bytes`: every field must be a bitfield and the body's
    /// total bit width must be a multiple of 8.
    /// Checked at codegen time; emits no opcode of its own, since the
    /// bit-aligned I/O opcodes the body already uses are sufficient.
    pub unaligned_bytes: bool,
    pub items: Vec<Item>,
}

#[derive(Debug, Clone)]
pub struct EnumEntry {
    pub name: String,
    pub value: i64,
    pub doc: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EnumDef {
    pub name: String,
    pub line: u32,
    pub doc: Option<String>,
    pub underlying: ScalarType,
    pub entries: Vec<EnumEntry>,
}

#[derive(Debug, Clone)]
pub struct PacketDef {
    pub name: String,
    pub line: u32,
    pub doc: Option<String>,
    pub items: Vec<Item>,
}
