//! The on-disk IL image: header, string table, bytecode. This is the
//! boundary between the compiler and the VM — the VM only ever sees a
//! `Program` produced by `Program::load`, never the compiler's internal
//! string interner or definition registries.

use sha2::{Digest, Sha256};

use crate::error::{bail, ensure, Error, ErrorContext, ErrorKind, Result};

pub const MAGIC: [u8; 5] = *b"CNDIL";
pub const HEADER_LEN: usize = 16;
pub const DEFAULT_VERSION: u8 = 1;

/// A compiled schema: a dense string table plus a bytecode stream, both
/// immutable once built. Cheap to share across threads — `execute` only
/// ever borrows it.
#[derive(Debug, Clone)]
pub struct Program {
    pub version: u8,
    pub strings: Vec<String>,
    pub bytecode: Vec<u8>,
}

struct ContainerCtx<'a>(&'a str);
impl<'a> ErrorContext for ContainerCtx<'a> {
    fn error_context(&self) -> String {
        self.0.to_string()
    }
}

impl Program {
    pub fn new(version: u8, strings: Vec<String>, bytecode: Vec<u8>) -> Program {
        Program { version, strings, bytecode }
    }

    /// Look up a key id's name. Used for disassembly and error messages,
    /// never by the VM dispatch loop itself (which only ever threads the
    /// raw `u16` through to the host callback).
    pub fn key_name(&self, key_id: u16) -> Option<&str> {
        self.strings.get(key_id as usize).map(String::as_str)
    }

    pub fn key_id(&self, name: &str) -> Option<u16> {
        self.strings.iter().position(|s| s == name).map(|i| i as u16)
    }

    /// Serialize to the on-disk container format: 16-byte little-endian
    /// header, NUL-terminated string table, raw bytecode through EOF.
    pub fn write(&self) -> Vec<u8> {
        let mut strings_blob = Vec::new();
        for s in &self.strings {
            strings_blob.extend_from_slice(s.as_bytes());
            strings_blob.push(0);
        }

        let string_offset = HEADER_LEN as u32;
        let bytecode_offset = string_offset + strings_blob.len() as u32;

        let mut out = Vec::with_capacity(HEADER_LEN + strings_blob.len() + self.bytecode.len());
        out.extend_from_slice(&MAGIC);
        out.push(self.version);
        out.extend_from_slice(&(self.strings.len() as u16).to_le_bytes());
        out.extend_from_slice(&string_offset.to_le_bytes());
        out.extend_from_slice(&bytecode_offset.to_le_bytes());
        out.extend_from_slice(&strings_blob);
        out.extend_from_slice(&self.bytecode);
        out
    }

    /// Parse the on-disk container format. Validates the magic and that
    /// both offsets land inside the buffer before trusting them.
    pub fn load(data: &[u8]) -> Result<Program> {
        let ctx = ContainerCtx("container header");
        ensure!(data.len() >= HEADER_LEN, MalformedContainer, Some(&ctx),
            "image of {} bytes is shorter than the {}-byte header", data.len(), HEADER_LEN);
        ensure!(&data[0..5] == &MAGIC, MalformedContainer, Some(&ctx),
            "bad magic {:02x?}, expected {:02x?}", &data[0..5], MAGIC);

        let version = data[5];
        let string_count = u16::from_le_bytes([data[6], data[7]]);
        let string_offset = u32::from_le_bytes([data[8], data[9], data[10], data[11]]) as usize;
        let bytecode_offset = u32::from_le_bytes([data[12], data[13], data[14], data[15]]) as usize;

        ensure!(string_offset <= data.len() && bytecode_offset <= data.len(), MalformedContainer, Some(&ctx),
            "offsets (strings={}, bytecode={}) exceed image length {}", string_offset, bytecode_offset, data.len());
        ensure!(string_offset <= bytecode_offset, MalformedContainer, Some(&ctx),
            "string table offset {} falls after bytecode offset {}", string_offset, bytecode_offset);

        let mut strings = Vec::with_capacity(string_count as usize);
        let mut pos = string_offset;
        for _ in 0..string_count {
            let start = pos;
            while pos < bytecode_offset && data[pos] != 0 {
                pos += 1;
            }
            ensure!(pos < bytecode_offset, MalformedContainer, Some(&ctx),
                "string table entry starting at {} runs past bytecode offset {} without a terminator", start, bytecode_offset);
            let s = std::str::from_utf8(&data[start..pos]).map_err(|e| {
                Error::new(ErrorKind::MalformedContainer, Some(ctx.error_context()), format!("non-utf8 string table entry: {}", e))
            })?;
            strings.push(s.to_string());
            pos += 1;
        }

        let bytecode = data[bytecode_offset..].to_vec();
        Ok(Program { version, strings, bytecode })
    }

    /// Content-addressed identity for the compiled image, hashing the
    /// canonical on-disk bytes. Mirrors the teacher crate's
    /// `Schema::sha256`.
    pub fn content_hash(&self) -> [u8; 32] {
        let bytes = self.write();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        hasher.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_write_and_load() {
        let prog = Program::new(DEFAULT_VERSION, vec!["a".into(), "bb".into()], vec![0x10, 0x00, 0x00]);
        let bytes = prog.write();
        assert_eq!(&bytes[0..5], &MAGIC);
        let back = Program::load(&bytes).unwrap();
        assert_eq!(back.version, prog.version);
        assert_eq!(back.strings, prog.strings);
        assert_eq!(back.bytecode, prog.bytecode);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = Program::new(DEFAULT_VERSION, vec![], vec![]).write();
        bytes[0] = b'X';
        assert_eq!(Program::load(&bytes).unwrap_err().kind(), ErrorKind::MalformedContainer);
    }

    #[test]
    fn rejects_truncated_header() {
        assert_eq!(Program::load(&[1, 2, 3]).unwrap_err().kind(), ErrorKind::MalformedContainer);
    }

    #[test]
    fn content_hash_is_stable_for_identical_images() {
        let a = Program::new(DEFAULT_VERSION, vec!["k".into()], vec![0x00]);
        let b = Program::new(DEFAULT_VERSION, vec!["k".into()], vec![0x00]);
        assert_eq!(a.content_hash(), b.content_hash());
    }
}
