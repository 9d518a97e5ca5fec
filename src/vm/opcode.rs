//! IL opcode set. Hex values match the reference header exactly except for
//! three gaps the reference left unassigned (`ARR_EOF`, `ARR_DYNAMIC`,
//! `SWITCH_TABLE` are named in prose but never given a byte value) — those
//! three are assigned free slots here and the choice is recorded in
//! `DESIGN.md`.

use crate::error::{bail, Error, ErrorKind, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    // Category A: Meta & State
    Noop = 0x00,
    SetEndianLe = 0x01,
    SetEndianBe = 0x02,
    EnterStruct = 0x03,
    ExitStruct = 0x04,
    MetaVersion = 0x05,
    CtxQuery = 0x06,
    MetaName = 0x07,

    // Category B: Primitives (byte aligned)
    IoU8 = 0x10,
    IoU16 = 0x11,
    IoU32 = 0x12,
    IoU64 = 0x13,
    IoI8 = 0x14,
    IoI16 = 0x15,
    IoI32 = 0x16,
    IoI64 = 0x17,
    IoF32 = 0x18,
    IoF64 = 0x19,
    IoBool = 0x1A,

    // Category C: Bitfields & padding
    IoBitU = 0x20,
    IoBitI = 0x21,
    IoBitBool = 0x22,
    AlignPad = 0x23,
    AlignFill = 0x24,

    // Category D: Arrays & strings
    StrNull = 0x30,
    StrPreU8 = 0x31,
    StrPreU16 = 0x32,
    StrPreU32 = 0x33,
    ArrFixed = 0x34,
    ArrPreU8 = 0x35,
    ArrPreU16 = 0x36,
    ArrPreU32 = 0x37,
    ArrEnd = 0x38,
    RawBytes = 0x39,
    /// Not in the reference opcode table; see module doc comment.
    ArrEof = 0x3A,
    /// Not in the reference opcode table; see module doc comment.
    ArrDynamic = 0x3B,

    // Category E: Validation, transforms, CRC
    ConstCheck = 0x40,
    ConstWrite = 0x41,
    RangeCheck = 0x42,
    ScaleLin = 0x43,
    Crc16 = 0x44,
    TransAdd = 0x45,
    TransSub = 0x46,
    TransMul = 0x47,
    TransDiv = 0x48,
    Crc32 = 0x49,
    MarkOptional = 0x4A,
    EnumCheck = 0x4B,
    TransPoly = 0x4C,
    TransSpline = 0x4D,

    // Category F: Control flow
    JumpIfNot = 0x50,
    Switch = 0x51,
    Jump = 0x52,
    /// Not in the reference opcode table; see module doc comment.
    SwitchTable = 0x53,

    // Category G: Expression stack & ALU
    LoadCtx = 0x60,
    PushImm = 0x61,
    Pop = 0x62,
    BitAnd = 0x63,
    BitOr = 0x64,
    BitXor = 0x65,
    BitNot = 0x66,
    Shl = 0x67,
    Shr = 0x68,
    Eq = 0x69,
    Neq = 0x6A,
    Gt = 0x6B,
    Lt = 0x6C,
    Gte = 0x6D,
    Lte = 0x6E,
    LogAnd = 0x6F,
    LogOr = 0x70,
    LogNot = 0x71,
    StoreCtx = 0x72,
    Dup = 0x73,
    Swap = 0x74,
    FAdd = 0x75,
    FSub = 0x76,
    FMul = 0x77,
    FDiv = 0x78,
    FNeg = 0x79,
    Sin = 0x7A,
    Cos = 0x7B,
    Tan = 0x7C,
    Sqrt = 0x7D,
    Pow = 0x7E,
    Log = 0x7F,
    Abs = 0x80,
    Itof = 0x81,
    Ftoi = 0x82,
    Neg = 0x83,
    Add = 0x84,
    Sub = 0x85,
    Mul = 0x86,
    Div = 0x87,
    Mod = 0x88,
    EqF = 0x89,
    NeqF = 0x8A,
    GtF = 0x8B,
    LtF = 0x8C,
    GteF = 0x8D,
    LteF = 0x8E,
}

impl Opcode {
    pub fn from_u8(b: u8) -> Result<Opcode> {
        use Opcode::*;
        Ok(match b {
            0x00 => Noop,
            0x01 => SetEndianLe,
            0x02 => SetEndianBe,
            0x03 => EnterStruct,
            0x04 => ExitStruct,
            0x05 => MetaVersion,
            0x06 => CtxQuery,
            0x07 => MetaName,
            0x10 => IoU8,
            0x11 => IoU16,
            0x12 => IoU32,
            0x13 => IoU64,
            0x14 => IoI8,
            0x15 => IoI16,
            0x16 => IoI32,
            0x17 => IoI64,
            0x18 => IoF32,
            0x19 => IoF64,
            0x1A => IoBool,
            0x20 => IoBitU,
            0x21 => IoBitI,
            0x22 => IoBitBool,
            0x23 => AlignPad,
            0x24 => AlignFill,
            0x30 => StrNull,
            0x31 => StrPreU8,
            0x32 => StrPreU16,
            0x33 => StrPreU32,
            0x34 => ArrFixed,
            0x35 => ArrPreU8,
            0x36 => ArrPreU16,
            0x37 => ArrPreU32,
            0x38 => ArrEnd,
            0x39 => RawBytes,
            0x3A => ArrEof,
            0x3B => ArrDynamic,
            0x40 => ConstCheck,
            0x41 => ConstWrite,
            0x42 => RangeCheck,
            0x43 => ScaleLin,
            0x44 => Crc16,
            0x45 => TransAdd,
            0x46 => TransSub,
            0x47 => TransMul,
            0x48 => TransDiv,
            0x49 => Crc32,
            0x4A => MarkOptional,
            0x4B => EnumCheck,
            0x4C => TransPoly,
            0x4D => TransSpline,
            0x50 => JumpIfNot,
            0x51 => Switch,
            0x52 => Jump,
            0x53 => SwitchTable,
            0x60 => LoadCtx,
            0x61 => PushImm,
            0x62 => Pop,
            0x63 => BitAnd,
            0x64 => BitOr,
            0x65 => BitXor,
            0x66 => BitNot,
            0x67 => Shl,
            0x68 => Shr,
            0x69 => Eq,
            0x6A => Neq,
            0x6B => Gt,
            0x6C => Lt,
            0x6D => Gte,
            0x6E => Lte,
            0x6F => LogAnd,
            0x70 => LogOr,
            0x71 => LogNot,
            0x72 => StoreCtx,
            0x73 => Dup,
            0x74 => Swap,
            0x75 => FAdd,
            0x76 => FSub,
            0x77 => FMul,
            0x78 => FDiv,
            0x79 => FNeg,
            0x7A => Sin,
            0x7B => Cos,
            0x7C => Tan,
            0x7D => Sqrt,
            0x7E => Pow,
            0x7F => Log,
            0x80 => Abs,
            0x81 => Itof,
            0x82 => Ftoi,
            0x83 => Neg,
            0x84 => Add,
            0x85 => Sub,
            0x86 => Mul,
            0x87 => Div,
            0x88 => Mod,
            other => bail!(InvalidOp, None::<&crate::vm::context::VmContext>, "unknown opcode {:#04x}", other),
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// True for opcodes that require the cursor to be byte-aligned before
    /// they execute (primitives and array/string opcodes; bit-aligned I/O
    /// is exempt).
    pub fn requires_byte_alignment(self) -> bool {
        let b = self.as_u8();
        (0x10..0x20).contains(&b) || (0x30..0x3C).contains(&b)
    }
}

impl From<Opcode> for u8 {
    fn from(op: Opcode) -> u8 {
        op as u8
    }
}

impl TryFrom<u8> for Opcode {
    type Error = Error;
    fn try_from(b: u8) -> Result<Opcode> {
        Opcode::from_u8(b)
    }
}

/// Scalar type tag used inline by `CONST_CHECK`/`CONST_WRITE`/`RANGE_CHECK`/
/// `ENUM_CHECK` to say how wide the following value operand(s) are. Reuses
/// the primitive `IO_*` opcode bytes as the tag, per the reference
/// compiler's emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Bool,
}

impl ScalarType {
    pub fn byte_width(self) -> usize {
        match self {
            ScalarType::U8 | ScalarType::I8 | ScalarType::Bool => 1,
            ScalarType::U16 | ScalarType::I16 => 2,
            ScalarType::U32 | ScalarType::I32 | ScalarType::F32 => 4,
            ScalarType::U64 | ScalarType::I64 | ScalarType::F64 => 8,
        }
    }

    pub fn to_tag(self) -> u8 {
        match self {
            ScalarType::U8 => Opcode::IoU8.as_u8(),
            ScalarType::U16 => Opcode::IoU16.as_u8(),
            ScalarType::U32 => Opcode::IoU32.as_u8(),
            ScalarType::U64 => Opcode::IoU64.as_u8(),
            ScalarType::I8 => Opcode::IoI8.as_u8(),
            ScalarType::I16 => Opcode::IoI16.as_u8(),
            ScalarType::I32 => Opcode::IoI32.as_u8(),
            ScalarType::I64 => Opcode::IoI64.as_u8(),
            ScalarType::F32 => Opcode::IoF32.as_u8(),
            ScalarType::F64 => Opcode::IoF64.as_u8(),
            ScalarType::Bool => Opcode::IoBool.as_u8(),
        }
    }

    pub fn from_tag(tag: u8) -> Result<ScalarType> {
        Ok(match Opcode::from_u8(tag)? {
            Opcode::IoU8 => ScalarType::U8,
            Opcode::IoU16 => ScalarType::U16,
            Opcode::IoU32 => ScalarType::U32,
            Opcode::IoU64 => ScalarType::U64,
            Opcode::IoI8 => ScalarType::I8,
            Opcode::IoI16 => ScalarType::I16,
            Opcode::IoI32 => ScalarType::I32,
            Opcode::IoI64 => ScalarType::I64,
            Opcode::IoF32 => ScalarType::F32,
            Opcode::IoF64 => ScalarType::F64,
            Opcode::IoBool => ScalarType::Bool,
            _ => bail!(InvalidOp, None::<&crate::vm::context::VmContext>, "tag {:#04x} is not a scalar type", tag),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_assigned_byte() {
        for b in 0u16..=0x88 {
            let b = b as u8;
            if let Ok(op) = Opcode::from_u8(b) {
                assert_eq!(op.as_u8(), b);
            }
        }
    }

    #[test]
    fn rejects_unknown_opcode() {
        assert_eq!(Opcode::from_u8(0xEE).unwrap_err().kind(), ErrorKind::InvalidOp);
    }

    #[test]
    fn alignment_ranges() {
        assert!(Opcode::IoU32.requires_byte_alignment());
        assert!(Opcode::ArrFixed.requires_byte_alignment());
        assert!(Opcode::ArrDynamic.requires_byte_alignment());
        assert!(!Opcode::IoBitU.requires_byte_alignment());
        assert!(!Opcode::Jump.requires_byte_alignment());
    }
}
