//! Concordia is a schema-driven binary serialization system. A small
//! declarative schema language (`compiler`) compiles struct/enum/packet
//! definitions down to a compact stack-based bytecode ("IL"), carried in
//! a [`container::Program`]. A single interpreter (`vm`) then walks that
//! bytecode twice over: once in `Mode::Encode` to turn host values into
//! wire bytes, once in `Mode::Decode` to turn wire bytes back into host
//! values — the same opcode stream drives both directions, so encoder
//! and decoder can never drift out of sync with each other.
//!
//! Typical usage:
//!
//! 1. compile a schema source string with [`compiler::compile`] into a
//!    [`container::Program`]
//! 2. implement [`vm::Host`] for whatever holds or produces field
//!    values (a struct binder, a JSON tree, …)
//! 3. call [`vm::execute`] with the program, a mode, a buffer, and the
//!    host

pub mod compiler;
pub mod container;
pub mod error;
pub mod vm;

pub use compiler::{compile, CompileOptions, CompileOutput, CompilerError, ImportResolver};
pub use container::Program;
pub use error::{Error, ErrorKind, Result};
pub use vm::{execute, Host, Mode, Slot};
