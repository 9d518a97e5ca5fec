//! Error type shared by the VM and the compiler.
//!
//! Every fallible call site in this crate goes through one of the three
//! macros below rather than constructing `Error` variants by hand, so the
//! shape of an error (kind + optional context + message) stays uniform
//! whether it originates from the bytecode interpreter or the schema
//! compiler.

use std::fmt::{self, Display, Formatter};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// What went wrong. VM-side kinds cover bytecode execution failures; the
/// remaining kinds are raised by the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    /// Cursor/instruction pointer ran past the end of the data buffer or
    /// the bytecode.
    #[error("out of bounds")]
    Oob,
    /// Bytecode verifier encountered an opcode byte it doesn't recognize.
    #[error("invalid opcode")]
    InvalidOp,
    /// A `CONST_CHECK`, `RANGE_CHECK`, or `ENUM_CHECK` failed.
    #[error("validation failed")]
    Validation,
    /// The host callback returned an error.
    #[error("host callback error")]
    Callback,
    /// A transform or ALU opcode hit an illegal operation (e.g. division
    /// by zero, NaN from a spline lookup).
    #[error("arithmetic error")]
    Arithmetic,
    /// A `CRC_16`/`CRC_32` check did not match the bytes on the wire.
    #[error("crc mismatch")]
    CrcMismatch,
    /// The bounded loop stack or expression stack overflowed.
    #[error("stack overflow")]
    StackOverflow,
    /// A pop was attempted on an empty loop stack or expression stack.
    #[error("stack underflow")]
    StackUnderflow,
    /// Lexer encountered an unrecognized character.
    #[error("lex error")]
    Lex,
    /// Parser encountered an unexpected token.
    #[error("parse error")]
    Parse,
    /// A type name referenced by a field was never defined or imported.
    #[error("unknown type")]
    UnknownType,
    /// Two fields/variants in the same scope were given the same name.
    #[error("duplicate key")]
    DuplicateKey,
    /// A struct contains itself, directly or through a chain of fields.
    #[error("recursive struct")]
    RecursiveStruct,
    /// An `import` statement re-enters a file already being imported.
    #[error("import cycle")]
    ImportCycle,
    /// An `import` statement names a path that could not be resolved.
    #[error("import not found")]
    ImportNotFound,
    /// The IL container header failed magic/offset validation.
    #[error("malformed container")]
    MalformedContainer,
}

/// Implemented by whatever is passed as the `context` argument to
/// `error!`/`ensure!`/`bail!` (typically `&VmContext` or `&Parser`), so the
/// resulting `Error` carries a short snapshot of where it happened without
/// borrowing anything.
pub trait ErrorContext {
    fn error_context(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, context: Option<String>, message: String) -> Self {
        Error { kind, context, message }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match &self.context {
            Some(ctx) => write!(f, "{}: {} ({})", self.kind, self.message, ctx),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for Error {}

macro_rules! error {
    ($kind:ident, $ctx:expr, $($fmt:tt)*) => {
        $crate::error::Error::new(
            $crate::error::ErrorKind::$kind,
            ::std::option::Option::map($ctx, $crate::error::ErrorContext::error_context),
            format!($($fmt)*),
        )
    };
}

macro_rules! ensure {
    ($cond:expr, $kind:ident, $ctx:expr, $($fmt:tt)*) => {
        if !($cond) {
            return Err($crate::error::error!($kind, $ctx, $($fmt)*));
        }
    };
}

macro_rules! bail {
    ($kind:ident, $ctx:expr, $($fmt:tt)*) => {
        return Err($crate::error::error!($kind, $ctx, $($fmt)*))
    };
}

pub(crate) use error;
pub(crate) use ensure;
pub(crate) use bail;


#[cfg(test)]
mod tests {
    use super::*;

    struct Ctx(u32);
    impl ErrorContext for Ctx {
        fn error_context(&self) -> String {
            format!("ip={}", self.0)
        }
    }

    #[test]
    fn error_carries_context() {
        let ctx = Ctx(7);
        let e = error!(Oob, Some(&ctx), "cursor {} past end", 12);
        assert_eq!(e.kind(), ErrorKind::Oob);
        assert_eq!(e.context(), Some("ip=7"));
        assert_eq!(format!("{}", e), "out of bounds: cursor 12 past end (ip=7)");
    }

    #[test]
    fn bail_without_context() {
        fn f() -> Result<()> {
            bail!(InvalidOp, None::<&Ctx>, "opcode {:#x}", 0xff);
        }
        let e = f().unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidOp);
        assert!(e.context().is_none());
    }
}
