//! AST-to-bytecode emission. A struct is never emitted once and called
//! into — every
//! inline site (a `Named` field, or a top-level packet body) re-walks the
//! referenced definition's item list under a dotted key prefix, so a field
//! three levels deep gets the key id `"outer.middle.inner"` instead of a
//! bare `"inner"` that would collide across sibling instances.
//!
//! Per-field emission order, all confirmed against `vm::exec`'s dispatch
//! rather than assumed from decorator names alone:
//! endian override, one-shot transform, `MARK_OPTIONAL`, then exactly one
//! of (CRC opcode | `CONST_CHECK`/`CONST_WRITE` | the plain I/O opcode),
//! then `RANGE_CHECK`/`ENUM_CHECK` (both read `ctx.last_scalar`, which the
//! primary I/O opcode just set), then the endian restore.

use std::collections::HashMap;

use crate::compiler::ast::{
    ArraySpec, Decorator, EndianSpec, EnumDef, FieldDecl, FieldType, Item, Literal, PacketDef,
    StringSpec, StructDef, SwitchCase,
};
use crate::compiler::expr;
use crate::compiler::interner::Interner;
use crate::error::{ensure, Error, ErrorContext, ErrorKind, Result};
use crate::vm::crc::{
    CrcFlags, CRC16_DEFAULT_FLAGS, CRC16_DEFAULT_INIT, CRC16_DEFAULT_POLY, CRC16_DEFAULT_XOR,
    CRC32_DEFAULT_FLAGS, CRC32_DEFAULT_INIT, CRC32_DEFAULT_POLY, CRC32_DEFAULT_XOR,
};
use crate::vm::opcode::{Opcode, ScalarType};

/// The merged, cross-file definition tables codegen resolves `Named` field
/// types against. Built once by `compiler::mod` after import resolution.
#[derive(Debug, Default)]
pub struct Registries {
    pub structs: HashMap<String, StructDef>,
    pub enums: HashMap<String, EnumDef>,
}

struct GenCtx {
    line: u32,
}
impl ErrorContext for GenCtx {
    fn error_context(&self) -> String {
        format!("line {}", self.line)
    }
}

fn err(line: u32, msg: impl Into<String>) -> Error {
    Error::new(ErrorKind::Parse, Some(GenCtx { line }.error_context()), msg.into())
}

fn dotted(prefix: Option<&str>, name: &str) -> String {
    match prefix {
        Some(p) => format!("{}.{}", p, name),
        None => name.to_string(),
    }
}

fn patch_i32(out: &mut [u8], at: usize, v: i32) {
    out[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn emit_set_endian(out: &mut Vec<u8>, e: EndianSpec) {
    out.push(match e {
        EndianSpec::Little => Opcode::SetEndianLe.as_u8(),
        EndianSpec::Big => Opcode::SetEndianBe.as_u8(),
    });
}

fn is_signed(s: ScalarType) -> bool {
    matches!(s, ScalarType::I8 | ScalarType::I16 | ScalarType::I32 | ScalarType::I64)
}

/// Little-endian byte encoding of a literal under a given scalar type,
/// matching what the VM's `read_scalar_const`/const comparison expects —
/// floats go through `to_bits()` rather than a lossy numeric cast.
fn encode_scalar_literal(v: Literal, scalar: ScalarType) -> Vec<u8> {
    match scalar {
        ScalarType::U8 => vec![v.as_i64() as u8],
        ScalarType::I8 => vec![v.as_i64() as i8 as u8],
        ScalarType::Bool => vec![(v.as_i64() != 0) as u8],
        ScalarType::U16 => (v.as_i64() as u16).to_le_bytes().to_vec(),
        ScalarType::I16 => (v.as_i64() as i16).to_le_bytes().to_vec(),
        ScalarType::U32 => (v.as_i64() as u32).to_le_bytes().to_vec(),
        ScalarType::I32 => (v.as_i64() as i32).to_le_bytes().to_vec(),
        ScalarType::U64 => (v.as_i64() as u64).to_le_bytes().to_vec(),
        ScalarType::I64 => v.as_i64().to_le_bytes().to_vec(),
        ScalarType::F32 => (v.as_f64() as f32).to_bits().to_le_bytes().to_vec(),
        ScalarType::F64 => v.as_f64().to_bits().to_le_bytes().to_vec(),
    }
}

fn find_endian(f: &FieldDecl) -> Option<EndianSpec> {
    f.decorators.iter().find_map(|d| match d {
        Decorator::Endian(e) => Some(*e),
        _ => None,
    })
}
fn find_optional(f: &FieldDecl) -> bool {
    f.decorators.iter().any(|d| matches!(d, Decorator::Optional))
}
fn find_const(f: &FieldDecl) -> Option<Literal> {
    f.decorators.iter().find_map(|d| match d {
        Decorator::Const(v) => Some(*v),
        _ => None,
    })
}
fn find_match(f: &FieldDecl) -> Option<Literal> {
    f.decorators.iter().find_map(|d| match d {
        Decorator::Match(v) => Some(*v),
        _ => None,
    })
}
fn find_range(f: &FieldDecl) -> Option<(Literal, Literal)> {
    f.decorators.iter().find_map(|d| match d {
        Decorator::Range(lo, hi) => Some((*lo, *hi)),
        _ => None,
    })
}
fn find_crc_width(f: &FieldDecl) -> Option<u8> {
    f.decorators.iter().find_map(|d| match d {
        Decorator::Crc { width } => Some(*width),
        _ => None,
    })
}

/// Walks one definition's items into bytecode, holding the interner as a
/// separate mutable borrow from the (read-only, for the whole compile)
/// registries so recursive calls never alias `&mut self` against itself.
pub struct Codegen<'a> {
    pub interner: &'a mut Interner,
    regs: &'a Registries,
}

impl<'a> Codegen<'a> {
    pub fn new(interner: &'a mut Interner, regs: &'a Registries) -> Self {
        Codegen { interner, regs }
    }

    /// One packet compiles to one program body: `ENTER_STRUCT(packet name)`
    /// wrapping the packet's own items, `EXIT_STRUCT` at the end. There is
    /// no packet-selector opcode in the set, so a multi-packet schema
    /// produces one bytecode stream per packet rather than a single blob a
    /// caller would have to dispatch into by hand.
    pub fn compile_packet(&mut self, pkt: &PacketDef, file_endian: EndianSpec) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        emit_set_endian(&mut out, file_endian);
        let key = self.interner.intern(&pkt.name);
        out.push(Opcode::EnterStruct.as_u8());
        out.extend_from_slice(&key.to_le_bytes());
        let mut stack = vec![pkt.name.clone()];
        self.compile_items(&mut out, &pkt.items, Some(&pkt.name), file_endian, &mut stack)?;
        out.push(Opcode::ExitStruct.as_u8());
        Ok(out)
    }

    fn compile_items(
        &mut self,
        out: &mut Vec<u8>,
        items: &[Item],
        prefix: Option<&str>,
        ambient: EndianSpec,
        stack: &mut Vec<String>,
    ) -> Result<()> {
        for item in items {
            match item {
                Item::Field(f) => self.compile_field(out, f, prefix, ambient, stack)?,
                Item::Pad(bits) => {
                    out.push(Opcode::AlignPad.as_u8());
                    out.push(*bits as u8);
                }
                Item::Fill(v) => {
                    out.push(Opcode::AlignFill.as_u8());
                    out.push(*v);
                }
                Item::If { cond, then_body, else_body } => {
                    self.compile_if(out, cond, then_body, else_body, prefix, ambient, stack)?
                }
                Item::Switch { key, cases, default } => {
                    self.compile_switch(out, key, cases, default, prefix, ambient, stack)?
                }
            }
        }
        Ok(())
    }

    fn compile_if(
        &mut self,
        out: &mut Vec<u8>,
        cond: &crate::compiler::ast::Expr,
        then_body: &[Item],
        else_body: &[Item],
        prefix: Option<&str>,
        ambient: EndianSpec,
        stack: &mut Vec<String>,
    ) -> Result<()> {
        expr::lower_expr(out, cond, self.interner, prefix);
        out.push(Opcode::JumpIfNot.as_u8());
        let jif_patch = out.len();
        out.extend_from_slice(&0i32.to_le_bytes());
        let jif_next_ip = jif_patch + 4;

        self.compile_items(out, then_body, prefix, ambient, stack)?;

        if else_body.is_empty() {
            let target = out.len();
            patch_i32(out, jif_patch, (target as i64 - jif_next_ip as i64) as i32);
        } else {
            out.push(Opcode::Jump.as_u8());
            let jmp_patch = out.len();
            out.extend_from_slice(&0i32.to_le_bytes());
            let jmp_next_ip = jmp_patch + 4;

            let else_start = out.len();
            patch_i32(out, jif_patch, (else_start as i64 - jif_next_ip as i64) as i32);

            self.compile_items(out, else_body, prefix, ambient, stack)?;

            let end = out.len();
            patch_i32(out, jmp_patch, (end as i64 - jmp_next_ip as i64) as i32);
        }
        Ok(())
    }

    /// Two-phase codegen: every case body (plus the default body) is
    /// emitted first, each ending in an unconditional jump to a shared
    /// continuation point; the dispatch table — whose entries are
    /// *absolute* bytecode offsets, unlike every other jump in the set —
    /// is only emitted once those offsets are known, then the `SWITCH`
    /// instruction's own `table_off` (relative to its `next_ip`) is
    /// patched last. This matches the verifier's forward scan, which
    /// treats the table bytes as a data region the case bodies must never
    /// fall through into.
    fn compile_switch(
        &mut self,
        out: &mut Vec<u8>,
        key_name: &str,
        cases: &[SwitchCase],
        default: &[Item],
        prefix: Option<&str>,
        ambient: EndianSpec,
        stack: &mut Vec<String>,
    ) -> Result<()> {
        let full_key = dotted(prefix, key_name);
        let key_id = self.interner.intern(&full_key);

        out.push(Opcode::Switch.as_u8());
        out.extend_from_slice(&key_id.to_le_bytes());
        let table_off_patch = out.len();
        out.extend_from_slice(&0i32.to_le_bytes());
        let switch_next_ip = table_off_patch + 4;

        let mut body_starts = Vec::with_capacity(cases.len());
        let mut continuation_patches = Vec::with_capacity(cases.len() + 1);
        for case in cases {
            body_starts.push(out.len());
            self.compile_items(out, &case.body, prefix, ambient, stack)?;
            out.push(Opcode::Jump.as_u8());
            continuation_patches.push(out.len());
            out.extend_from_slice(&0i32.to_le_bytes());
        }

        let default_start = out.len();
        self.compile_items(out, default, prefix, ambient, stack)?;
        out.push(Opcode::Jump.as_u8());
        continuation_patches.push(out.len());
        out.extend_from_slice(&0i32.to_le_bytes());

        let table_start = out.len();
        out.extend_from_slice(&(cases.len() as u16).to_le_bytes());
        out.extend_from_slice(&(default_start as i32).to_le_bytes());
        for (case, &start) in cases.iter().zip(body_starts.iter()) {
            out.extend_from_slice(&case.value.to_le_bytes());
            out.extend_from_slice(&(start as i32).to_le_bytes());
        }

        patch_i32(out, table_off_patch, (table_start as i64 - switch_next_ip as i64) as i32);

        let continuation = out.len();
        for &patch_pos in &continuation_patches {
            let jmp_next_ip = patch_pos + 4;
            patch_i32(out, patch_pos, (continuation as i64 - jmp_next_ip as i64) as i32);
        }
        Ok(())
    }

    fn compile_field(
        &mut self,
        out: &mut Vec<u8>,
        f: &FieldDecl,
        prefix: Option<&str>,
        ambient: EndianSpec,
        stack: &mut Vec<String>,
    ) -> Result<()> {
        let full_name = dotted(prefix, &f.name);
        let key = self.interner.intern(&full_name);
        let mark_optional = find_optional(f);

        match &f.ty {
            FieldType::Bytes => {
                let n = match &f.array {
                    Some(ArraySpec::Fixed(n)) => *n,
                    _ => return Err(err(f.line, "a 'bytes' field needs a fixed '[N]' length")),
                };
                if mark_optional {
                    out.push(Opcode::MarkOptional.as_u8());
                }
                out.push(Opcode::RawBytes.as_u8());
                out.extend_from_slice(&key.to_le_bytes());
                out.extend_from_slice(&n.to_le_bytes());
                Ok(())
            }
            FieldType::Str => {
                let spec = f
                    .string_spec
                    .as_ref()
                    .ok_or_else(|| err(f.line, "string field is missing a 'prefix'/'until' spec"))?;
                if mark_optional {
                    out.push(Opcode::MarkOptional.as_u8());
                }
                match spec {
                    StringSpec::PrefixU8 => {
                        out.push(Opcode::StrPreU8.as_u8());
                        out.extend_from_slice(&key.to_le_bytes());
                    }
                    StringSpec::PrefixU16 => {
                        out.push(Opcode::StrPreU16.as_u8());
                        out.extend_from_slice(&key.to_le_bytes());
                    }
                    StringSpec::PrefixU32 => {
                        out.push(Opcode::StrPreU32.as_u8());
                        out.extend_from_slice(&key.to_le_bytes());
                    }
                    StringSpec::Null { max_len } => {
                        out.push(Opcode::StrNull.as_u8());
                        out.extend_from_slice(&key.to_le_bytes());
                        out.extend_from_slice(&max_len.to_le_bytes());
                    }
                }
                Ok(())
            }
            FieldType::Scalar(st) => {
                if let Some(spec) = &f.array {
                    self.emit_array_start(out, spec, key, prefix)?;
                    self.compile_scalar_body(out, f, key, *st, None, ambient, mark_optional)?;
                    out.push(Opcode::ArrEnd.as_u8());
                } else {
                    self.compile_scalar_body(out, f, key, *st, None, ambient, mark_optional)?;
                }
                Ok(())
            }
            FieldType::Named(name) => {
                if let Some(sdef) = self.regs.structs.get(name).cloned() {
                    ensure!(
                        !stack.contains(name),
                        RecursiveStruct,
                        None::<&GenCtx>,
                        "struct '{}' contains itself",
                        name
                    );
                    if let Some(spec) = &f.array {
                        self.emit_array_start(out, spec, key, prefix)?;
                        self.compile_struct_inline(out, &sdef, &full_name, ambient, stack)?;
                        out.push(Opcode::ArrEnd.as_u8());
                    } else {
                        self.compile_struct_inline(out, &sdef, &full_name, ambient, stack)?;
                    }
                    Ok(())
                } else if let Some(edef) = self.regs.enums.get(name).cloned() {
                    let st = edef.underlying;
                    let values: Vec<i64> = edef.entries.iter().map(|e| e.value).collect();
                    if let Some(spec) = &f.array {
                        self.emit_array_start(out, spec, key, prefix)?;
                        self.compile_scalar_body(out, f, key, st, Some(&values), ambient, mark_optional)?;
                        out.push(Opcode::ArrEnd.as_u8());
                    } else {
                        self.compile_scalar_body(out, f, key, st, Some(&values), ambient, mark_optional)?;
                    }
                    Ok(())
                } else {
                    Err(err(f.line, format!("unknown type '{}'", name)))
                }
            }
        }
    }

    /// Note: none of the array-start opcodes gate on `MARK_OPTIONAL` the
    /// way a scalar I/O opcode does (`vm::exec::begin_io` is never called
    /// for them) — `@optional` on an array field only ever reaches the
    /// *first* I/O opcode inside the loop body, and leaks onto whatever
    /// comes after the field if the body never runs. Documented as a known
    /// limitation in `DESIGN.md` rather than engineered around, since doing
    /// so would require a new opcode.
    fn emit_array_start(&mut self, out: &mut Vec<u8>, spec: &ArraySpec, key: u16, prefix: Option<&str>) -> Result<()> {
        match spec {
            ArraySpec::Fixed(n) => {
                out.push(Opcode::ArrFixed.as_u8());
                out.extend_from_slice(&key.to_le_bytes());
                out.extend_from_slice(&n.to_le_bytes());
            }
            ArraySpec::PrefixU8 => {
                out.push(Opcode::ArrPreU8.as_u8());
                out.extend_from_slice(&key.to_le_bytes());
            }
            ArraySpec::PrefixU16 => {
                out.push(Opcode::ArrPreU16.as_u8());
                out.extend_from_slice(&key.to_le_bytes());
            }
            ArraySpec::PrefixU32 => {
                out.push(Opcode::ArrPreU32.as_u8());
                out.extend_from_slice(&key.to_le_bytes());
            }
            ArraySpec::Eof => {
                out.push(Opcode::ArrEof.as_u8());
                out.extend_from_slice(&key.to_le_bytes());
            }
            ArraySpec::Dynamic(refname) => {
                let full_ref = dotted(prefix, refname);
                let ref_key = self.interner.intern(&full_ref);
                out.push(Opcode::ArrDynamic.as_u8());
                out.extend_from_slice(&key.to_le_bytes());
                out.extend_from_slice(&ref_key.to_le_bytes());
            }
        }
        Ok(())
    }

    fn compile_struct_inline(
        &mut self,
        out: &mut Vec<u8>,
        def: &StructDef,
        prefix: &str,
        ambient: EndianSpec,
        stack: &mut Vec<String>,
    ) -> Result<()> {
        if def.unaligned_bytes {
            check_unaligned_bytes(def)?;
        }
        stack.push(def.name.clone());
        let key = self.interner.intern(prefix);
        out.push(Opcode::EnterStruct.as_u8());
        out.extend_from_slice(&key.to_le_bytes());
        self.compile_items(out, &def.items, Some(prefix), ambient, stack)?;
        out.push(Opcode::ExitStruct.as_u8());
        stack.pop();
        Ok(())
    }

    /// One field's scalar/enum I/O, shared by array and non-array
    /// emission. `enum_values`, when set, produces a trailing
    /// `ENUM_CHECK` listing every declared entry value after the I/O.
    fn compile_scalar_body(
        &mut self,
        out: &mut Vec<u8>,
        f: &FieldDecl,
        key: u16,
        scalar: ScalarType,
        enum_values: Option<&[i64]>,
        ambient: EndianSpec,
        mark_optional: bool,
    ) -> Result<()> {
        let endian_override = find_endian(f);
        if let Some(e) = endian_override {
            emit_set_endian(out, e);
        }

        self.emit_transform(out, f)?;

        if mark_optional {
            out.push(Opcode::MarkOptional.as_u8());
        }

        let crc_width = find_crc_width(f);
        if let Some(width) = crc_width {
            self.emit_crc(out, f, width)?;
        } else if let Some(v) = find_const(f) {
            emit_const(out, key, v, scalar, Opcode::ConstCheck);
        } else if let Some(v) = find_match(f) {
            // `@const` and `@match` are strict synonyms (spec.md §4.2): both
            // validate the decoded value against the declared constant.
            // CONST_WRITE keeps a distinct opcode byte from CONST_CHECK
            // (matching the opcode table's `40/41 CONST_CHECK/WRITE` row)
            // but `handle_const` in `vm/exec.rs` validates for both.
            emit_const(out, key, v, scalar, Opcode::ConstWrite);
        } else {
            emit_primitive_io(out, key, f, scalar)?;
        }

        // RANGE_CHECK/ENUM_CHECK both read ctx.last_scalar, set by whichever
        // I/O opcode just ran; a CRC opcode never sets it, so skip both when
        // this field's primary I/O was a checksum.
        if crc_width.is_none() {
            if let Some((lo, hi)) = find_range(f) {
                out.push(Opcode::RangeCheck.as_u8());
                out.push(scalar.to_tag());
                out.extend_from_slice(&encode_scalar_literal(lo, scalar));
                out.extend_from_slice(&encode_scalar_literal(hi, scalar));
            }
            if let Some(values) = enum_values {
                out.push(Opcode::EnumCheck.as_u8());
                out.push(scalar.to_tag());
                out.extend_from_slice(&(values.len() as u16).to_le_bytes());
                for v in values {
                    out.extend_from_slice(&encode_scalar_literal(Literal::Int(*v), scalar));
                }
            }
        }

        if endian_override.is_some() {
            emit_set_endian(out, ambient);
        }
        Ok(())
    }

    /// Exactly one transform opcode is emitted per field, since
    /// `vm::context::VmContext::pending_transform` is a single slot the
    /// next I/O opcode consumes and clears — stacking two would silently
    /// discard the first. Priority when a field somehow carries more than
    /// one transform decorator: linear scale/offset, then polynomial, then
    /// spline, then a bare add/sub/mul/div.
    fn emit_transform(&mut self, out: &mut Vec<u8>, f: &FieldDecl) -> Result<()> {
        let scale = f.decorators.iter().find_map(|d| match d {
            Decorator::Scale(v) => Some(*v),
            _ => None,
        });
        let offset = f.decorators.iter().find_map(|d| match d {
            Decorator::Offset(v) => Some(*v),
            _ => None,
        });
        if scale.is_some() || offset.is_some() {
            out.push(Opcode::ScaleLin.as_u8());
            out.extend_from_slice(&scale.unwrap_or(1.0).to_bits().to_le_bytes());
            out.extend_from_slice(&offset.unwrap_or(0.0).to_bits().to_le_bytes());
            return Ok(());
        }

        if let Some(coeffs) = f.decorators.iter().find_map(|d| match d {
            Decorator::Poly(c) => Some(c.clone()),
            _ => None,
        }) {
            ensure!(
                coeffs.len() <= 255,
                Parse,
                None::<&GenCtx>,
                "@poly takes at most 255 coefficients, got {}",
                coeffs.len()
            );
            out.push(Opcode::TransPoly.as_u8());
            out.push(coeffs.len() as u8);
            for c in &coeffs {
                out.extend_from_slice(&c.to_bits().to_le_bytes());
            }
            return Ok(());
        }

        if let Some(points) = f.decorators.iter().find_map(|d| match d {
            Decorator::Spline(p) => Some(p.clone()),
            _ => None,
        }) {
            ensure!(
                points.len() <= 255,
                Parse,
                None::<&GenCtx>,
                "@spline takes at most 255 points, got {}",
                points.len()
            );
            out.push(Opcode::TransSpline.as_u8());
            out.push(points.len() as u8);
            for (x, y) in &points {
                out.extend_from_slice(&x.to_bits().to_le_bytes());
                out.extend_from_slice(&y.to_bits().to_le_bytes());
            }
            return Ok(());
        }

        if let Some(v) = f.decorators.iter().find_map(|d| match d {
            Decorator::Add(v) => Some(*v),
            _ => None,
        }) {
            out.push(Opcode::TransAdd.as_u8());
            out.extend_from_slice(&v.to_le_bytes());
            return Ok(());
        }
        if let Some(v) = f.decorators.iter().find_map(|d| match d {
            Decorator::Sub(v) => Some(*v),
            _ => None,
        }) {
            out.push(Opcode::TransSub.as_u8());
            out.extend_from_slice(&v.to_le_bytes());
            return Ok(());
        }
        if let Some(v) = f.decorators.iter().find_map(|d| match d {
            Decorator::Mul(v) => Some(*v),
            _ => None,
        }) {
            out.push(Opcode::TransMul.as_u8());
            out.extend_from_slice(&v.to_le_bytes());
            return Ok(());
        }
        if let Some(v) = f.decorators.iter().find_map(|d| match d {
            Decorator::Div(v) => Some(*v),
            _ => None,
        }) {
            out.push(Opcode::TransDiv.as_u8());
            out.extend_from_slice(&v.to_le_bytes());
            return Ok(());
        }

        Ok(())
    }

    /// `@crc(16|32)` replaces the field's normal I/O entirely — the opcode
    /// carries no key, since the checksum is delivered to the host through
    /// a fixed sentinel key the VM owns, not the field's own key id.
    /// Parameters default to the catalog variant named in `vm::crc`'s own
    /// constants, overridden individually by any `@crc_*` decorator.
    fn emit_crc(&mut self, out: &mut Vec<u8>, f: &FieldDecl, width: u8) -> Result<()> {
        let (default_poly, default_init, default_xor, default_flags, op) = match width {
            16 => (
                CRC16_DEFAULT_POLY as u32,
                CRC16_DEFAULT_INIT as u32,
                CRC16_DEFAULT_XOR as u32,
                CRC16_DEFAULT_FLAGS,
                Opcode::Crc16,
            ),
            32 => (CRC32_DEFAULT_POLY, CRC32_DEFAULT_INIT, CRC32_DEFAULT_XOR, CRC32_DEFAULT_FLAGS, Opcode::Crc32),
            other => return Err(err(f.line, format!("@crc width must be 16 or 32, got {}", other))),
        };

        let poly = f
            .decorators
            .iter()
            .find_map(|d| if let Decorator::CrcPoly(v) = d { Some(*v as u32) } else { None })
            .unwrap_or(default_poly);
        let init = f
            .decorators
            .iter()
            .find_map(|d| if let Decorator::CrcInit(v) = d { Some(*v as u32) } else { None })
            .unwrap_or(default_init);
        let xorout = f
            .decorators
            .iter()
            .find_map(|d| if let Decorator::CrcXor(v) = d { Some(*v as u32) } else { None })
            .unwrap_or(default_xor);
        let refin = f
            .decorators
            .iter()
            .find_map(|d| if let Decorator::CrcRefIn(v) = d { Some(*v) } else { None })
            .unwrap_or(default_flags.refin);
        let refout = f
            .decorators
            .iter()
            .find_map(|d| if let Decorator::CrcRefOut(v) = d { Some(*v) } else { None })
            .unwrap_or(default_flags.refout);
        let flags = CrcFlags { refin, refout };

        out.push(op.as_u8());
        if width == 16 {
            out.extend_from_slice(&(poly as u16).to_le_bytes());
            out.extend_from_slice(&(init as u16).to_le_bytes());
            out.extend_from_slice(&(xorout as u16).to_le_bytes());
        } else {
            out.extend_from_slice(&poly.to_le_bytes());
            out.extend_from_slice(&init.to_le_bytes());
            out.extend_from_slice(&xorout.to_le_bytes());
        }
        out.push(flags.to_byte());
        Ok(())
    }
}

fn emit_const(out: &mut Vec<u8>, key: u16, v: Literal, scalar: ScalarType, op: Opcode) {
    out.push(op.as_u8());
    out.extend_from_slice(&key.to_le_bytes());
    out.push(scalar.to_tag());
    out.extend_from_slice(&encode_scalar_literal(v, scalar));
}

fn emit_primitive_io(out: &mut Vec<u8>, key: u16, f: &FieldDecl, scalar: ScalarType) -> Result<()> {
    if let Some(bits) = f.bit_width {
        let op = match scalar {
            ScalarType::Bool => Opcode::IoBitBool,
            ScalarType::F32 | ScalarType::F64 => {
                return Err(err(f.line, "bitfields are not supported on floating point fields"))
            }
            s if is_signed(s) => Opcode::IoBitI,
            _ => Opcode::IoBitU,
        };
        out.push(op.as_u8());
        out.extend_from_slice(&key.to_le_bytes());
        out.push(bits);
    } else {
        let op = match scalar {
            ScalarType::U8 => Opcode::IoU8,
            ScalarType::U16 => Opcode::IoU16,
            ScalarType::U32 => Opcode::IoU32,
            ScalarType::U64 => Opcode::IoU64,
            ScalarType::I8 => Opcode::IoI8,
            ScalarType::I16 => Opcode::IoI16,
            ScalarType::I32 => Opcode::IoI32,
            ScalarType::I64 => Opcode::IoI64,
            ScalarType::F32 => Opcode::IoF32,
            ScalarType::F64 => Opcode::IoF64,
            ScalarType::Bool => Opcode::IoBool,
        };
        out.push(op.as_u8());
        out.extend_from_slice(&key.to_le_bytes());
    }
    Ok(())
}

/// `@unaligned_bytes` is a compile-time-only check: it
/// emits no opcode of its own, it only rejects a struct whose fields don't
/// actually pack to a whole number of bytes. Only the struct's own direct
/// fields count towards the total — a nested struct or conditional branch
/// contributes 0 or a variable number of bits depending on runtime data, so
/// it can't be folded into a single compile-time sum and is left out of the
/// check (its own fields, if also bit-packed, are checked independently if
/// that nested struct itself carries `@unaligned_bytes`).
fn check_unaligned_bytes(def: &StructDef) -> Result<()> {
    let mut total = 0u32;
    for item in &def.items {
        if let Item::Field(f) = item {
            let width = f
                .bit_width
                .ok_or_else(|| err(f.line, format!("field '{}' in @unaligned_bytes struct '{}' needs an explicit bit width", f.name, def.name)))?;
            total += width as u32;
        }
    }
    if total % 8 != 0 {
        return Err(err(def.line, format!("@unaligned_bytes struct '{}' totals {} bits, not a multiple of 8", def.name, total)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ast::EnumEntry;
    use crate::vm::verifier::verify;

    fn field(name: &str, ty: FieldType) -> FieldDecl {
        FieldDecl { name: name.to_string(), line: 1, doc: None, ty, bit_width: None, array: None, string_spec: None, decorators: Vec::new() }
    }

    #[test]
    fn compiles_simple_packet_and_passes_verifier() {
        let pkt = PacketDef {
            name: "Ping".into(),
            line: 1,
            doc: None,
            items: vec![Item::Field(field("seq", FieldType::Scalar(ScalarType::U32)))],
        };
        let regs = Registries::default();
        let mut interner = Interner::new();
        let mut gen = Codegen::new(&mut interner, &regs);
        let bc = gen.compile_packet(&pkt, EndianSpec::Little).unwrap();
        verify(&bc).unwrap();
        assert_eq!(interner.get(0), Some("Ping"));
        assert_eq!(interner.get(1), Some("Ping.seq"));
    }

    #[test]
    fn const_decorator_emits_const_check() {
        let mut f = field("magic", FieldType::Scalar(ScalarType::U8));
        f.decorators.push(Decorator::Const(Literal::Int(7)));
        let pkt = PacketDef { name: "Hdr".into(), line: 1, doc: None, items: vec![Item::Field(f)] };
        let regs = Registries::default();
        let mut interner = Interner::new();
        let mut gen = Codegen::new(&mut interner, &regs);
        let bc = gen.compile_packet(&pkt, EndianSpec::Little).unwrap();
        verify(&bc).unwrap();
        assert!(bc.contains(&Opcode::ConstCheck.as_u8()));
    }

    #[test]
    fn match_decorator_emits_const_write_which_still_validates() {
        // `@match` keeps its own opcode byte (CONST_WRITE) rather than
        // collapsing onto CONST_CHECK, but per spec.md §4.2 it validates
        // the decoded value exactly like `@const` does — see
        // `const_write_validates_on_decode_same_as_const_check` in
        // `vm/exec.rs` for the decode-time behavior.
        let mut f = field("reserved", FieldType::Scalar(ScalarType::U8));
        f.decorators.push(Decorator::Match(Literal::Int(0)));
        let pkt = PacketDef { name: "Hdr".into(), line: 1, doc: None, items: vec![Item::Field(f)] };
        let regs = Registries::default();
        let mut interner = Interner::new();
        let mut gen = Codegen::new(&mut interner, &regs);
        let bc = gen.compile_packet(&pkt, EndianSpec::Little).unwrap();
        verify(&bc).unwrap();
        assert!(bc.contains(&Opcode::ConstWrite.as_u8()));
        assert!(!bc.contains(&Opcode::ConstCheck.as_u8()));
    }

    #[test]
    fn struct_field_inlines_with_dotted_keys() {
        let inner = StructDef {
            name: "Point".into(),
            line: 1,
            doc: None,
            unaligned_bytes: false,
            items: vec![Item::Field(field("x", FieldType::Scalar(ScalarType::U16)))],
        };
        let mut regs = Registries::default();
        regs.structs.insert("Point".into(), inner);
        let pkt = PacketDef {
            name: "Move".into(),
            line: 1,
            doc: None,
            items: vec![Item::Field(field("pos", FieldType::Named("Point".into())))],
        };
        let mut interner = Interner::new();
        let mut gen = Codegen::new(&mut interner, &regs);
        let bc = gen.compile_packet(&pkt, EndianSpec::Little).unwrap();
        verify(&bc).unwrap();
        assert!(interner.get(1).map(|s| s == "Move.pos").unwrap_or(false));
        assert!(interner.get(2).map(|s| s == "Move.pos.x").unwrap_or(false));
    }

    #[test]
    fn recursive_struct_is_rejected() {
        let recursive = StructDef {
            name: "Node".into(),
            line: 1,
            doc: None,
            unaligned_bytes: false,
            items: vec![Item::Field(field("child", FieldType::Named("Node".into())))],
        };
        let mut regs = Registries::default();
        regs.structs.insert("Node".into(), recursive);
        let pkt = PacketDef {
            name: "Tree".into(),
            line: 1,
            doc: None,
            items: vec![Item::Field(field("root", FieldType::Named("Node".into())))],
        };
        let mut interner = Interner::new();
        let mut gen = Codegen::new(&mut interner, &regs);
        let err = gen.compile_packet(&pkt, EndianSpec::Little).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RecursiveStruct);
    }

    #[test]
    fn enum_field_emits_underlying_io_and_enum_check() {
        let e = EnumDef {
            name: "Kind".into(),
            line: 1,
            doc: None,
            underlying: ScalarType::U8,
            entries: vec![EnumEntry { name: "A".into(), value: 0, doc: None }, EnumEntry { name: "B".into(), value: 1, doc: None }],
        };
        let mut regs = Registries::default();
        regs.enums.insert("Kind".into(), e);
        let pkt = PacketDef {
            name: "Msg".into(),
            line: 1,
            doc: None,
            items: vec![Item::Field(field("kind", FieldType::Named("Kind".into())))],
        };
        let mut interner = Interner::new();
        let mut gen = Codegen::new(&mut interner, &regs);
        let bc = gen.compile_packet(&pkt, EndianSpec::Little).unwrap();
        verify(&bc).unwrap();
        assert!(bc.contains(&Opcode::IoU8.as_u8()));
        assert!(bc.contains(&Opcode::EnumCheck.as_u8()));
    }

    #[test]
    fn switch_bodies_never_fall_through_into_the_table() {
        let pkt = PacketDef {
            name: "Msg".into(),
            line: 1,
            doc: None,
            items: vec![
                Item::Field(field("kind", FieldType::Scalar(ScalarType::U8))),
                Item::Switch {
                    key: "kind".into(),
                    cases: vec![
                        SwitchCase { value: 0, body: vec![Item::Field(field("a", FieldType::Scalar(ScalarType::U8)))] },
                        SwitchCase { value: 1, body: vec![Item::Field(field("b", FieldType::Scalar(ScalarType::U16)))] },
                    ],
                    default: vec![Item::Field(field("c", FieldType::Scalar(ScalarType::U32)))],
                },
            ],
        };
        let regs = Registries::default();
        let mut interner = Interner::new();
        let mut gen = Codegen::new(&mut interner, &regs);
        let bc = gen.compile_packet(&pkt, EndianSpec::Little).unwrap();
        verify(&bc).unwrap();
    }

    #[test]
    fn unaligned_bytes_struct_requires_byte_aligned_total() {
        let mut f1 = field("a", FieldType::Scalar(ScalarType::U8));
        f1.bit_width = Some(3);
        let mut f2 = field("b", FieldType::Scalar(ScalarType::U8));
        f2.bit_width = Some(4);
        let bad = StructDef { name: "Flags".into(), line: 1, doc: None, unaligned_bytes: true, items: vec![Item::Field(f1), Item::Field(f2)] };
        let err = check_unaligned_bytes(&bad).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
    }

    #[test]
    fn range_check_follows_primitive_io() {
        let mut f = field("level", FieldType::Scalar(ScalarType::U8));
        f.decorators.push(Decorator::Range(Literal::Int(0), Literal::Int(10)));
        let pkt = PacketDef { name: "Hdr".into(), line: 1, doc: None, items: vec![Item::Field(f)] };
        let regs = Registries::default();
        let mut interner = Interner::new();
        let mut gen = Codegen::new(&mut interner, &regs);
        let bc = gen.compile_packet(&pkt, EndianSpec::Little).unwrap();
        verify(&bc).unwrap();
        let io_pos = bc.iter().position(|&b| b == Opcode::IoU8.as_u8()).unwrap();
        let range_pos = bc.iter().position(|&b| b == Opcode::RangeCheck.as_u8()).unwrap();
        assert!(range_pos > io_pos);
    }
}
