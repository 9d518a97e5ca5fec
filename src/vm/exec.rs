//! The VM core loop: fetch one opcode byte, advance the instruction
//! pointer, dispatch. `execute` runs the verifier first (a
//! verified program cannot fetch past `bytecode_len`), then drives a
//! `VmContext` through the bytecode until `ip` reaches the end.

use std::io::Write as IoWrite;

use crate::container::Program;
use crate::error::{bail, ensure, Error, ErrorContext, ErrorKind, Result};
use crate::vm::callback::{Host, Slot, KEY_CRC_RESULT};
use crate::vm::context::{Endian, LoopFrame, Mode, VmContext};
use crate::vm::crc::{self, CrcFlags};
use crate::vm::opcode::{Opcode, ScalarType};
use crate::vm::transform::Transform;
use crate::vm::verifier::{self, operand_len, read_switch_table, read_switch_table_dense};

fn read_u16(bc: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bc[at], bc[at + 1]])
}
fn read_u32(bc: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bc[at], bc[at + 1], bc[at + 2], bc[at + 3]])
}
fn read_i32(bc: &[u8], at: usize) -> i32 {
    read_u32(bc, at) as i32
}
fn read_u64(bc: &[u8], at: usize) -> u64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(&bc[at..at + 8]);
    u64::from_le_bytes(a)
}
fn read_i64(bc: &[u8], at: usize) -> i64 {
    read_u64(bc, at) as i64
}
fn read_f64(bc: &[u8], at: usize) -> f64 {
    f64::from_bits(read_u64(bc, at))
}

/// `true` if bytes are available for this I/O and it should proceed
/// normally; `false` if they aren't but `@optional` was set (the flag is
/// always consumed here, one-shot, regardless of the outcome). Errors
/// with `Oob` if bytes are missing and `@optional` was not set.
fn begin_io(ctx: &mut VmContext, available: bool) -> Result<bool> {
    let optional = ctx.pending_optional;
    ctx.pending_optional = false;
    if available {
        Ok(true)
    } else if optional {
        Ok(false)
    } else {
        Err(Error::new(ErrorKind::Oob, Some(ctx.error_context()), "field I/O exceeds buffer and is not @optional".into()))
    }
}

/// Scan forward from `body_start` (the first byte after an array/string
/// opening opcode) to the position right after the matching `ARR_END`,
/// skipping any switch-table data regions along the way exactly like the
/// verifier does. Used to skip a loop body entirely when its runtime
/// count is zero, since the compiled body is emitted once and relies on
/// the VM, not a stored skip distance, to elide it.
fn skip_array_body(bc: &[u8], body_start: usize) -> Result<usize> {
    let mut ip = body_start;
    let mut depth: i32 = 1;
    let mut data_regions: Vec<(usize, usize)> = Vec::new();
    while depth > 0 {
        if let Some(&(_, end)) = data_regions.iter().find(|&&(s, e)| ip >= s && ip < e) {
            ip = end;
            continue;
        }
        ensure!(ip < bc.len(), Oob, None::<&crate::vm::context::VmContext>, "array body runs past bytecode end while skipping");
        let op = Opcode::from_u8(bc[ip])?;
        let operand_start = ip + 1;
        let opnd_len = operand_len(op, bc, operand_start)?;
        let next_ip = operand_start + opnd_len;
        match op {
            Opcode::ArrFixed | Opcode::ArrPreU8 | Opcode::ArrPreU16 | Opcode::ArrPreU32 | Opcode::ArrEof | Opcode::ArrDynamic => {
                depth += 1;
            }
            Opcode::ArrEnd => {
                depth -= 1;
            }
            Opcode::Switch | Opcode::SwitchTable => {
                let table_off = read_i32(bc, operand_start + 2);
                let table_start = (next_ip as i64 + table_off as i64) as usize;
                let layout = if op == Opcode::Switch {
                    read_switch_table(bc, table_start)?
                } else {
                    read_switch_table_dense(bc, table_start)?
                };
                data_regions.push((table_start, table_start + layout.len));
            }
            _ => {}
        }
        ip = next_ip;
    }
    Ok(ip)
}

fn host_query_u64(ctx: &mut VmContext, key: u16) -> Result<u64> {
    let mut v = 0u64;
    ctx.host.io(key, Opcode::CtxQuery, Slot::Query(&mut v))?;
    Ok(v)
}

fn endian_bytes_u16(e: Endian, v: u16) -> [u8; 2] {
    match e {
        Endian::Little => v.to_le_bytes(),
        Endian::Big => v.to_be_bytes(),
    }
}
fn endian_bytes_u32(e: Endian, v: u32) -> [u8; 4] {
    match e {
        Endian::Little => v.to_le_bytes(),
        Endian::Big => v.to_be_bytes(),
    }
}
fn endian_u16(e: Endian, b: &[u8]) -> u16 {
    let a = [b[0], b[1]];
    match e {
        Endian::Little => u16::from_le_bytes(a),
        Endian::Big => u16::from_be_bytes(a),
    }
}
fn endian_u32(e: Endian, b: &[u8]) -> u32 {
    let a = [b[0], b[1], b[2], b[3]];
    match e {
        Endian::Little => u32::from_le_bytes(a),
        Endian::Big => u32::from_be_bytes(a),
    }
}

/// Generates the ENCODE/DECODE bodies for one integer primitive I/O
/// opcode. All eight integer widths share this shape (ask/deliver via a
/// typed `Slot`, apply any pending transform through the `i64` round
/// trip, serialize with the stream's current endianness); only the
/// native type and slot variant differ.
macro_rules! io_int {
    ($ctx:expr, $key:expr, $op:expr, $ty:ty, $slot:ident, $width:expr) => {{
        let available = $ctx.bytes_available($width);
        if begin_io($ctx, available)? {
            match $ctx.mode {
                Mode::Encode => {
                    let mut v: $ty = 0 as $ty;
                    $ctx.host.io($key, $op, Slot::$slot(&mut v))?;
                    let raw = match $ctx.pending_transform.take() {
                        Some(t) => t.to_wire_i64(v as i64)? as $ty,
                        None => v,
                    };
                    let bytes = if $ctx.endian == Endian::Little { (raw as $ty).to_le_bytes() } else { (raw as $ty).to_be_bytes() };
                    $ctx.write_bytes(&bytes)?;
                    $ctx.last_scalar = raw as i64;
                }
                Mode::Decode => {
                    let bytes = $ctx.read_bytes($width)?.to_vec();
                    let mut arr = [0u8; $width];
                    arr.copy_from_slice(&bytes);
                    let raw: $ty = if $ctx.endian == Endian::Little { <$ty>::from_le_bytes(arr) } else { <$ty>::from_be_bytes(arr) };
                    $ctx.last_scalar = raw as i64;
                    let eng = match $ctx.pending_transform.take() {
                        Some(t) => t.from_wire_i64(raw as i64)? as $ty,
                        None => raw,
                    };
                    let mut v = eng;
                    $ctx.host.io($key, $op, Slot::$slot(&mut v))?;
                }
            }
        } else {
            $ctx.pending_transform = None;
            if $ctx.mode == Mode::Decode {
                let mut v: $ty = 0 as $ty;
                $ctx.host.io($key, $op, Slot::$slot(&mut v))?;
            }
        }
    }};
}

/// One step of the dispatch loop: fetch/decode the opcode at `ctx.ip`,
/// execute it, and leave `ctx.ip` pointing at the next instruction (or at
/// a jump target, for control-flow opcodes).
fn step(program: &Program, ctx: &mut VmContext) -> Result<()> {
    let bc = &program.bytecode;
    let op = Opcode::from_u8(bc[ctx.ip])?;
    if op.requires_byte_alignment() {
        ctx.align_to_byte();
    }
    ctx.trace_line(&format!("{:?} @ ip={} cursor={}", op, ctx.ip, ctx.cursor));

    let operand_start = ctx.ip + 1;
    let opnd_len = operand_len(op, bc, operand_start)?;
    let mut next_ip = operand_start + opnd_len;

    match op {
        Opcode::Noop | Opcode::MetaVersion => {}
        Opcode::SetEndianLe => ctx.set_endian(Endian::Little),
        Opcode::SetEndianBe => ctx.set_endian(Endian::Big),
        Opcode::EnterStruct => {
            let key = read_u16(bc, operand_start);
            ctx.crc_span_stack.push(ctx.crc_span_start);
            ctx.crc_span_start = Some(ctx.cursor);
            ctx.host.io(key, op, Slot::Notify)?;
        }
        Opcode::ExitStruct => {
            ctx.host.io(0, op, Slot::Notify)?;
            ctx.crc_span_start = ctx.crc_span_stack.pop().flatten();
        }
        Opcode::MetaName => {}
        Opcode::CtxQuery | Opcode::LoadCtx => {
            let key = read_u16(bc, operand_start);
            let v = host_query_u64(ctx, key)?;
            ctx.push_expr(v)?;
        }
        Opcode::StoreCtx => {
            let key = read_u16(bc, operand_start);
            let v = ctx.pop_expr()?;
            ctx.host.io(key, op, Slot::Store(v))?;
        }

        Opcode::IoU8 => io_int!(ctx, read_u16(bc, operand_start), op, u8, U8, 1),
        Opcode::IoU16 => io_int!(ctx, read_u16(bc, operand_start), op, u16, U16, 2),
        Opcode::IoU32 => io_int!(ctx, read_u16(bc, operand_start), op, u32, U32, 4),
        Opcode::IoU64 => io_int!(ctx, read_u16(bc, operand_start), op, u64, U64, 8),
        Opcode::IoI8 => io_int!(ctx, read_u16(bc, operand_start), op, i8, I8, 1),
        Opcode::IoI16 => io_int!(ctx, read_u16(bc, operand_start), op, i16, I16, 2),
        Opcode::IoI32 => io_int!(ctx, read_u16(bc, operand_start), op, i32, I32, 4),
        Opcode::IoI64 => io_int!(ctx, read_u16(bc, operand_start), op, i64, I64, 8),
        Opcode::IoBool => {
            let key = read_u16(bc, operand_start);
            let available = ctx.bytes_available(1);
            if begin_io(ctx, available)? {
                match ctx.mode {
                    Mode::Encode => {
                        let mut v = false;
                        ctx.host.io(key, op, Slot::Bool(&mut v))?;
                        ctx.write_bytes(&[v as u8])?;
                    }
                    Mode::Decode => {
                        let b = ctx.read_bytes(1)?[0];
                        ensure!(b == 0 || b == 1, Validation, Some(&*ctx), "bool byte {} is not 0 or 1", b);
                        let mut v = b != 0;
                        ctx.host.io(key, op, Slot::Bool(&mut v))?;
                    }
                }
            } else if ctx.mode == Mode::Decode {
                let mut v = false;
                ctx.host.io(key, op, Slot::Bool(&mut v))?;
            }
        }
        Opcode::IoF32 => {
            let key = read_u16(bc, operand_start);
            let available = ctx.bytes_available(4);
            if begin_io(ctx, available)? {
                match ctx.mode {
                    Mode::Encode => {
                        let mut v: f32 = 0.0;
                        ctx.host.io(key, op, Slot::F32(&mut v))?;
                        let raw = match ctx.pending_transform.take() {
                            Some(t) => t.to_wire_f64(v as f64)? as f32,
                            None => v,
                        };
                        ctx.write_bytes(&if ctx.endian == Endian::Little { raw.to_le_bytes() } else { raw.to_be_bytes() })?;
                    }
                    Mode::Decode => {
                        let bytes = ctx.read_bytes(4)?.to_vec();
                        let mut arr = [0u8; 4];
                        arr.copy_from_slice(&bytes);
                        let raw = if ctx.endian == Endian::Little { f32::from_le_bytes(arr) } else { f32::from_be_bytes(arr) };
                        let eng = match ctx.pending_transform.take() {
                            Some(t) => t.from_wire_f64(raw as f64)? as f32,
                            None => raw,
                        };
                        let mut v = eng;
                        ctx.host.io(key, op, Slot::F32(&mut v))?;
                    }
                }
            } else {
                ctx.pending_transform = None;
                if ctx.mode == Mode::Decode {
                    let mut v: f32 = 0.0;
                    ctx.host.io(key, op, Slot::F32(&mut v))?;
                }
            }
        }
        Opcode::IoF64 => {
            let key = read_u16(bc, operand_start);
            let available = ctx.bytes_available(8);
            if begin_io(ctx, available)? {
                match ctx.mode {
                    Mode::Encode => {
                        let mut v: f64 = 0.0;
                        ctx.host.io(key, op, Slot::F64(&mut v))?;
                        let raw = match ctx.pending_transform.take() {
                            Some(t) => t.to_wire_f64(v)?,
                            None => v,
                        };
                        ctx.write_bytes(&if ctx.endian == Endian::Little { raw.to_le_bytes() } else { raw.to_be_bytes() })?;
                    }
                    Mode::Decode => {
                        let bytes = ctx.read_bytes(8)?.to_vec();
                        let mut arr = [0u8; 8];
                        arr.copy_from_slice(&bytes);
                        let raw = if ctx.endian == Endian::Little { f64::from_le_bytes(arr) } else { f64::from_be_bytes(arr) };
                        let eng = match ctx.pending_transform.take() {
                            Some(t) => t.from_wire_f64(raw)?,
                            None => raw,
                        };
                        let mut v = eng;
                        ctx.host.io(key, op, Slot::F64(&mut v))?;
                    }
                }
            } else {
                ctx.pending_transform = None;
                if ctx.mode == Mode::Decode {
                    let mut v: f64 = 0.0;
                    ctx.host.io(key, op, Slot::F64(&mut v))?;
                }
            }
        }

        Opcode::IoBitU | Opcode::IoBitI | Opcode::IoBitBool => {
            let key = read_u16(bc, operand_start);
            let bits = bc[operand_start + 2] as u32;
            ensure!(bits <= 64, InvalidOp, Some(&*ctx), "bitfield width {} exceeds 64", bits);
            let available = ctx.bits_available(bits);
            if begin_io(ctx, available)? {
                match ctx.mode {
                    Mode::Encode => {
                        let raw: u64 = match op {
                            Opcode::IoBitBool => {
                                let mut v = false;
                                ctx.host.io(key, op, Slot::Bool(&mut v))?;
                                v as u64
                            }
                            Opcode::IoBitI => {
                                let mut v: i64 = 0;
                                ctx.host.io(key, op, Slot::BitI(&mut v))?;
                                truncate_bits(v as u64, bits)
                            }
                            _ => {
                                let mut v: u64 = 0;
                                ctx.host.io(key, op, Slot::BitU(&mut v))?;
                                truncate_bits(v, bits)
                            }
                        };
                        ctx.write_bits(raw, bits)?;
                        ctx.last_scalar = sign_extend(raw, bits);
                    }
                    Mode::Decode => {
                        let raw = ctx.read_bits(bits)?;
                        ctx.last_scalar = sign_extend(raw, bits);
                        match op {
                            Opcode::IoBitBool => {
                                ensure!(raw == 0 || raw == 1, Validation, Some(&*ctx), "bit-bool value {} is not 0/1", raw);
                                let mut v = raw != 0;
                                ctx.host.io(key, op, Slot::Bool(&mut v))?;
                            }
                            Opcode::IoBitI => {
                                let mut v = sign_extend(raw, bits);
                                ctx.host.io(key, op, Slot::BitI(&mut v))?;
                            }
                            _ => {
                                let mut v = raw;
                                ctx.host.io(key, op, Slot::BitU(&mut v))?;
                            }
                        }
                    }
                }
            } else if ctx.mode == Mode::Decode {
                match op {
                    Opcode::IoBitBool => {
                        let mut v = false;
                        ctx.host.io(key, op, Slot::Bool(&mut v))?;
                    }
                    Opcode::IoBitI => {
                        let mut v: i64 = 0;
                        ctx.host.io(key, op, Slot::BitI(&mut v))?;
                    }
                    _ => {
                        let mut v: u64 = 0;
                        ctx.host.io(key, op, Slot::BitU(&mut v))?;
                    }
                }
            }
        }
        Opcode::AlignPad => {
            let n = bc[operand_start] as u32;
            ctx.pad_bits(n)?;
        }
        Opcode::AlignFill => {
            let v = bc[operand_start];
            ctx.fill_to_byte(v)?;
        }

        Opcode::StrNull => {
            let key = read_u16(bc, operand_start);
            let max_len = read_u16(bc, operand_start + 2) as usize;
            handle_str_null(ctx, key, op, max_len)?;
        }
        Opcode::StrPreU8 => handle_str_prefixed(ctx, read_u16(bc, operand_start), op, 1)?,
        Opcode::StrPreU16 => handle_str_prefixed(ctx, read_u16(bc, operand_start), op, 2)?,
        Opcode::StrPreU32 => handle_str_prefixed(ctx, read_u16(bc, operand_start), op, 4)?,

        Opcode::ArrFixed => {
            let key = read_u16(bc, operand_start);
            let count = read_u32(bc, operand_start + 2);
            ctx.host.io(key, op, Slot::Notify)?;
            if count == 0 {
                next_ip = skip_array_body(bc, next_ip)?;
            } else {
                ctx.push_loop(LoopFrame { start_ip: next_ip, remaining: count, until_eof: false })?;
            }
        }
        Opcode::ArrPreU8 | Opcode::ArrPreU16 | Opcode::ArrPreU32 => {
            let key = read_u16(bc, operand_start);
            let width = match op {
                Opcode::ArrPreU8 => 1,
                Opcode::ArrPreU16 => 2,
                _ => 4,
            };
            let count = handle_arr_prefix_count(ctx, key, op, width)?;
            if count == 0 {
                next_ip = skip_array_body(bc, next_ip)?;
            } else {
                ctx.push_loop(LoopFrame { start_ip: next_ip, remaining: count, until_eof: false })?;
            }
        }
        Opcode::ArrEof => {
            let key = read_u16(bc, operand_start);
            ctx.host.io(key, op, Slot::Notify)?;
            if ctx.cursor >= ctx.buffer.len() {
                next_ip = skip_array_body(bc, next_ip)?;
            } else {
                ctx.push_loop(LoopFrame { start_ip: next_ip, remaining: 0, until_eof: true })?;
            }
        }
        Opcode::ArrDynamic => {
            let key = read_u16(bc, operand_start);
            let ref_key = read_u16(bc, operand_start + 2);
            let raw = host_query_u64(ctx, ref_key)?;
            ensure!(raw <= u32::MAX as u64, Arithmetic, Some(&*ctx), "dynamic array count {} overflows u32", raw);
            let count = raw as u32;
            ctx.host.io(key, op, Slot::Notify)?;
            if count == 0 {
                next_ip = skip_array_body(bc, next_ip)?;
            } else {
                ctx.push_loop(LoopFrame { start_ip: next_ip, remaining: count, until_eof: false })?;
            }
        }
        Opcode::ArrEnd => {
            let frame = ctx.pop_loop()?;
            if frame.until_eof {
                if ctx.cursor >= ctx.buffer.len() {
                    ctx.host.io(0, op, Slot::Notify)?;
                } else {
                    ctx.loop_stack.push(frame);
                    next_ip = frame.start_ip;
                }
            } else {
                let remaining = frame.remaining - 1;
                if remaining == 0 {
                    ctx.host.io(0, op, Slot::Notify)?;
                } else {
                    ctx.loop_stack.push(LoopFrame { remaining, ..frame });
                    next_ip = frame.start_ip;
                }
            }
        }
        Opcode::RawBytes => {
            let key = read_u16(bc, operand_start);
            let count = read_u32(bc, operand_start + 2) as usize;
            let available = ctx.bytes_available(count);
            if begin_io(ctx, available)? {
                match ctx.mode {
                    Mode::Encode => {
                        let mut buf = vec![0u8; count];
                        ctx.host.io(key, op, Slot::StrEncode(&mut buf))?;
                        buf.resize(count, 0);
                        ctx.write_bytes(&buf)?;
                    }
                    Mode::Decode => {
                        let bytes = ctx.read_bytes(count)?.to_vec();
                        ctx.host.io(key, op, Slot::StrDecode(&bytes))?;
                    }
                }
            } else if ctx.mode == Mode::Decode {
                ctx.host.io(key, op, Slot::StrDecode(&[]))?;
            }
        }

        Opcode::ConstCheck | Opcode::ConstWrite => {
            let key = read_u16(bc, operand_start);
            let type_tag = bc[operand_start + 2];
            let scalar = ScalarType::from_tag(type_tag)?;
            let width = scalar.byte_width();
            let const_val = read_scalar_const(bc, operand_start + 3, scalar);
            handle_const(ctx, key, op, scalar, width, const_val)?;
        }
        Opcode::RangeCheck => {
            let type_tag = bc[operand_start];
            let scalar = ScalarType::from_tag(type_tag)?;
            let width = scalar.byte_width();
            let min = read_scalar_const(bc, operand_start + 1, scalar);
            let max = read_scalar_const(bc, operand_start + 1 + width, scalar);
            let raw = ctx.last_scalar;
            ensure!(raw >= min && raw <= max, Validation, Some(&*ctx), "value {} out of range [{},{}]", raw, min, max);
        }
        Opcode::ScaleLin => {
            let factor = read_f64(bc, operand_start);
            let offset = read_f64(bc, operand_start + 8);
            ctx.pending_transform = Some(Transform::Linear { factor, offset });
        }
        Opcode::TransAdd => ctx.pending_transform = Some(Transform::Add(read_i64(bc, operand_start))),
        Opcode::TransSub => ctx.pending_transform = Some(Transform::Sub(read_i64(bc, operand_start))),
        Opcode::TransMul => ctx.pending_transform = Some(Transform::Mul(read_i64(bc, operand_start))),
        Opcode::TransDiv => ctx.pending_transform = Some(Transform::Div(read_i64(bc, operand_start))),
        Opcode::TransPoly => {
            let count = bc[operand_start] as usize;
            let mut coeffs = Vec::with_capacity(count);
            for i in 0..count {
                coeffs.push(read_f64(bc, operand_start + 1 + i * 8));
            }
            ctx.pending_transform = Some(Transform::Poly(coeffs));
        }
        Opcode::TransSpline => {
            let count = bc[operand_start] as usize;
            let mut points = Vec::with_capacity(count);
            for i in 0..count {
                let x = read_f64(bc, operand_start + 1 + i * 16);
                let y = read_f64(bc, operand_start + 1 + i * 16 + 8);
                points.push((x, y));
            }
            ctx.pending_transform = Some(Transform::Spline(points));
        }
        Opcode::Crc16 => handle_crc16(ctx, bc, operand_start)?,
        Opcode::Crc32 => handle_crc32(ctx, bc, operand_start)?,
        Opcode::MarkOptional => ctx.pending_optional = true,
        Opcode::EnumCheck => {
            let type_tag = bc[operand_start];
            let scalar = ScalarType::from_tag(type_tag)?;
            let width = scalar.byte_width();
            let count = read_u16(bc, operand_start + 1) as usize;
            let mut allowed = Vec::with_capacity(count);
            for i in 0..count {
                allowed.push(read_scalar_const(bc, operand_start + 3 + i * width, scalar));
            }
            let raw = ctx.last_scalar;
            ensure!(allowed.contains(&raw), Validation, Some(&*ctx), "value {} is not one of the declared enum values", raw);
        }

        Opcode::JumpIfNot => {
            let off = read_i32(bc, operand_start);
            let v = ctx.pop_expr()?;
            if v == 0 {
                next_ip = (next_ip as i64 + off as i64) as usize;
            }
        }
        Opcode::Jump => {
            let off = read_i32(bc, operand_start);
            next_ip = (next_ip as i64 + off as i64) as usize;
        }
        Opcode::Switch | Opcode::SwitchTable => {
            let key = read_u16(bc, operand_start);
            let table_off = read_i32(bc, operand_start + 2);
            let table_start = (next_ip as i64 + table_off as i64) as usize;
            let discriminant = host_query_u64(ctx, key)? as i64;
            let target = if op == Opcode::Switch {
                let layout = read_switch_table(bc, table_start)?;
                let entries_start = table_start + 6;
                let mut found = None;
                for i in 0..layout.entry_offsets.len() {
                    let value = read_i64(bc, entries_start + i * 12);
                    if value == discriminant {
                        found = Some(layout.entry_offsets[i]);
                        break;
                    }
                }
                found.unwrap_or(layout.default_offset)
            } else {
                let layout = read_switch_table_dense(bc, table_start)?;
                let base = read_i64(bc, table_start);
                let idx = discriminant - base;
                if idx >= 0 && (idx as usize) < layout.entry_offsets.len() {
                    layout.entry_offsets[idx as usize]
                } else {
                    layout.default_offset
                }
            };
            next_ip = target as usize;
        }

        Opcode::PushImm => ctx.push_expr(read_u64(bc, operand_start))?,
        Opcode::Pop => {
            ctx.pop_expr()?;
        }
        Opcode::Dup => {
            let v = ctx.peek_expr()?;
            ctx.push_expr(v)?;
        }
        Opcode::Swap => {
            let b = ctx.pop_expr()?;
            let a = ctx.pop_expr()?;
            ctx.push_expr(b)?;
            ctx.push_expr(a)?;
        }
        Opcode::BitAnd => bin_u64(ctx, |a, b| Ok(a & b))?,
        Opcode::BitOr => bin_u64(ctx, |a, b| Ok(a | b))?,
        Opcode::BitXor => bin_u64(ctx, |a, b| Ok(a ^ b))?,
        Opcode::BitNot => {
            let a = ctx.pop_expr()?;
            ctx.push_expr(!a)?;
        }
        Opcode::Shl => bin_u64(ctx, |a, b| Ok(a.wrapping_shl((b & 63) as u32)))?,
        Opcode::Shr => bin_u64(ctx, |a, b| Ok(a.wrapping_shr((b & 63) as u32)))?,
        Opcode::Eq => bin_i64_cmp(ctx, |a, b| a == b)?,
        Opcode::Neq => bin_i64_cmp(ctx, |a, b| a != b)?,
        Opcode::Gt => bin_i64_cmp(ctx, |a, b| a > b)?,
        Opcode::Lt => bin_i64_cmp(ctx, |a, b| a < b)?,
        Opcode::Gte => bin_i64_cmp(ctx, |a, b| a >= b)?,
        Opcode::Lte => bin_i64_cmp(ctx, |a, b| a <= b)?,
        Opcode::LogAnd => bin_u64(ctx, |a, b| Ok(((a != 0) && (b != 0)) as u64))?,
        Opcode::LogOr => bin_u64(ctx, |a, b| Ok(((a != 0) || (b != 0)) as u64))?,
        Opcode::LogNot => {
            let a = ctx.pop_expr()?;
            ctx.push_expr((a == 0) as u64)?;
        }
        Opcode::FAdd => bin_f64(ctx, |a, b| Ok(a + b))?,
        Opcode::FSub => bin_f64(ctx, |a, b| Ok(a - b))?,
        Opcode::FMul => bin_f64(ctx, |a, b| Ok(a * b))?,
        Opcode::FDiv => bin_f64(ctx, |a, b| {
            ensure!(b != 0.0, Arithmetic, None::<&crate::vm::context::VmContext>, "float division by zero");
            Ok(a / b)
        })?,
        Opcode::FNeg => {
            let a = f64::from_bits(ctx.pop_expr()?);
            ctx.push_expr((-a).to_bits())?;
        }
        Opcode::Sin => un_f64(ctx, |a| Ok(a.sin()))?,
        Opcode::Cos => un_f64(ctx, |a| Ok(a.cos()))?,
        Opcode::Tan => un_f64(ctx, |a| Ok(a.tan()))?,
        Opcode::Sqrt => un_f64(ctx, |a| {
            ensure!(a >= 0.0, Arithmetic, None::<&crate::vm::context::VmContext>, "sqrt of negative value {}", a);
            Ok(a.sqrt())
        })?,
        Opcode::Pow => bin_f64(ctx, |a, b| Ok(a.powf(b)))?,
        Opcode::Log => un_f64(ctx, |a| {
            ensure!(a > 0.0, Arithmetic, None::<&crate::vm::context::VmContext>, "log of non-positive value {}", a);
            Ok(a.ln())
        })?,
        Opcode::Abs => un_f64(ctx, |a| Ok(a.abs()))?,
        Opcode::Itof => {
            let a = ctx.pop_expr()? as i64;
            ctx.push_expr((a as f64).to_bits())?;
        }
        Opcode::Ftoi => {
            let a = f64::from_bits(ctx.pop_expr()?);
            ctx.push_expr((a as i64) as u64)?;
        }
        Opcode::Neg => {
            let a = ctx.pop_expr()? as i64;
            ctx.push_expr((a.wrapping_neg()) as u64)?;
        }
        Opcode::Add => bin_i64(ctx, |a, b| a.checked_add(b).ok_or(()))?,
        Opcode::Sub => bin_i64(ctx, |a, b| a.checked_sub(b).ok_or(()))?,
        Opcode::Mul => bin_i64(ctx, |a, b| a.checked_mul(b).ok_or(()))?,
        Opcode::Div => {
            let b = ctx.pop_expr()? as i64;
            let a = ctx.pop_expr()? as i64;
            ensure!(b != 0, Arithmetic, Some(&*ctx), "integer division by zero");
            ctx.push_expr((a / b) as u64)?;
        }
        Opcode::Mod => {
            let b = ctx.pop_expr()? as i64;
            let a = ctx.pop_expr()? as i64;
            ensure!(b != 0, Arithmetic, Some(&*ctx), "integer modulus by zero");
            ctx.push_expr((a % b) as u64)?;
        }
        Opcode::EqF => bin_f64_cmp(ctx, |a, b| a == b)?,
        Opcode::NeqF => bin_f64_cmp(ctx, |a, b| a != b)?,
        Opcode::GtF => bin_f64_cmp(ctx, |a, b| a > b)?,
        Opcode::LtF => bin_f64_cmp(ctx, |a, b| a < b)?,
        Opcode::GteF => bin_f64_cmp(ctx, |a, b| a >= b)?,
        Opcode::LteF => bin_f64_cmp(ctx, |a, b| a <= b)?,
    }

    ctx.ip = next_ip;
    Ok(())
}

fn truncate_bits(v: u64, bits: u32) -> u64 {
    if bits >= 64 {
        v
    } else {
        v & ((1u64 << bits) - 1)
    }
}

fn sign_extend(v: u64, bits: u32) -> i64 {
    if bits == 0 || bits >= 64 {
        return v as i64;
    }
    let shift = 64 - bits;
    ((v << shift) as i64) >> shift
}

fn bin_u64(ctx: &mut VmContext, f: impl FnOnce(u64, u64) -> Result<u64>) -> Result<()> {
    let b = ctx.pop_expr()?;
    let a = ctx.pop_expr()?;
    let r = f(a, b)?;
    ctx.push_expr(r)
}

fn bin_i64(ctx: &mut VmContext, f: impl FnOnce(i64, i64) -> std::result::Result<i64, ()>) -> Result<()> {
    let b = ctx.pop_expr()? as i64;
    let a = ctx.pop_expr()? as i64;
    let r = f(a, b).map_err(|_| Error::new(ErrorKind::Arithmetic, Some(ctx.error_context()), "integer overflow".into()))?;
    ctx.push_expr(r as u64)
}

fn bin_i64_cmp(ctx: &mut VmContext, f: impl FnOnce(i64, i64) -> bool) -> Result<()> {
    let b = ctx.pop_expr()? as i64;
    let a = ctx.pop_expr()? as i64;
    ctx.push_expr(f(a, b) as u64)
}

fn bin_f64(ctx: &mut VmContext, f: impl FnOnce(f64, f64) -> Result<f64>) -> Result<()> {
    let b = f64::from_bits(ctx.pop_expr()?);
    let a = f64::from_bits(ctx.pop_expr()?);
    let r = f(a, b)?;
    ctx.push_expr(r.to_bits())
}

fn bin_f64_cmp(ctx: &mut VmContext, f: impl FnOnce(f64, f64) -> bool) -> Result<()> {
    let b = f64::from_bits(ctx.pop_expr()?);
    let a = f64::from_bits(ctx.pop_expr()?);
    ctx.push_expr(f(a, b) as u64)
}

fn un_f64(ctx: &mut VmContext, f: impl FnOnce(f64) -> Result<f64>) -> Result<()> {
    let a = f64::from_bits(ctx.pop_expr()?);
    let r = f(a)?;
    ctx.push_expr(r.to_bits())
}

fn read_scalar_const(bc: &[u8], at: usize, scalar: ScalarType) -> i64 {
    match scalar {
        ScalarType::U8 => bc[at] as i64,
        ScalarType::I8 => bc[at] as i8 as i64,
        ScalarType::Bool => bc[at] as i64,
        ScalarType::U16 => read_u16(bc, at) as i64,
        ScalarType::I16 => read_u16(bc, at) as i16 as i64,
        ScalarType::U32 => read_u32(bc, at) as i64,
        ScalarType::I32 => read_u32(bc, at) as i32 as i64,
        ScalarType::U64 => read_u64(bc, at) as i64,
        ScalarType::I64 => read_i64(bc, at),
        ScalarType::F32 => f32::from_bits(read_u32(bc, at)) as i64,
        ScalarType::F64 => read_f64(bc, at) as i64,
    }
}

fn handle_const(ctx: &mut VmContext, key: u16, op: Opcode, scalar: ScalarType, width: usize, const_val: i64) -> Result<()> {
    let available = ctx.bytes_available(width);
    if !begin_io(ctx, available)? {
        return Ok(());
    }
    match ctx.mode {
        Mode::Encode => {
            let bytes = scalar_to_bytes(const_val, scalar, ctx.endian);
            ctx.write_bytes(&bytes)?;
            ctx.last_scalar = const_val;
        }
        Mode::Decode => {
            let bytes = ctx.read_bytes(width)?.to_vec();
            let raw = bytes_to_scalar(&bytes, scalar, ctx.endian);
            ctx.last_scalar = raw;
            deliver_scalar(ctx, key, op, scalar, raw)?;
            // `@const`/`@match` are strict synonyms (spec.md §4.2): both
            // validate the decoded value against the declared constant,
            // whether it was emitted as CONST_CHECK or CONST_WRITE.
            ensure!(raw == const_val, Validation, Some(&*ctx), "field {} = {} does not match declared const {}", key, raw, const_val);
        }
    }
    Ok(())
}

/// Surfaces a const-field value to the host on decode (read-only) by
/// handing it through the `Slot` variant matching its declared scalar
/// type.
fn deliver_scalar(ctx: &mut VmContext, key: u16, op: Opcode, scalar: ScalarType, raw: i64) -> Result<()> {
    match scalar {
        ScalarType::U8 => ctx.host.io(key, op, Slot::U8(&mut (raw as u8))),
        ScalarType::I8 => ctx.host.io(key, op, Slot::I8(&mut (raw as i8))),
        ScalarType::Bool => ctx.host.io(key, op, Slot::Bool(&mut (raw != 0))),
        ScalarType::U16 => ctx.host.io(key, op, Slot::U16(&mut (raw as u16))),
        ScalarType::I16 => ctx.host.io(key, op, Slot::I16(&mut (raw as i16))),
        ScalarType::U32 => ctx.host.io(key, op, Slot::U32(&mut (raw as u32))),
        ScalarType::I32 => ctx.host.io(key, op, Slot::I32(&mut (raw as i32))),
        ScalarType::U64 => ctx.host.io(key, op, Slot::U64(&mut (raw as u64))),
        ScalarType::I64 => ctx.host.io(key, op, Slot::I64(&mut (raw))),
        ScalarType::F32 => ctx.host.io(key, op, Slot::F32(&mut (raw as f32))),
        ScalarType::F64 => ctx.host.io(key, op, Slot::F64(&mut (raw as f64))),
    }
}

fn scalar_to_bytes(v: i64, scalar: ScalarType, endian: Endian) -> Vec<u8> {
    match scalar {
        ScalarType::U8 | ScalarType::Bool => vec![v as u8],
        ScalarType::I8 => vec![v as i8 as u8],
        ScalarType::U16 => endian_bytes_u16(endian, v as u16).to_vec(),
        ScalarType::I16 => endian_bytes_u16(endian, v as i16 as u16).to_vec(),
        ScalarType::U32 => endian_bytes_u32(endian, v as u32).to_vec(),
        ScalarType::I32 => endian_bytes_u32(endian, v as i32 as u32).to_vec(),
        ScalarType::U64 | ScalarType::I64 => {
            let bytes = (v as u64).to_le_bytes();
            if endian == Endian::Little { bytes.to_vec() } else { (v as u64).to_be_bytes().to_vec() }
        }
        ScalarType::F32 => endian_bytes_u32(endian, (v as f32).to_bits()).to_vec(),
        ScalarType::F64 => {
            let bits = (v as f64).to_bits();
            if endian == Endian::Little { bits.to_le_bytes().to_vec() } else { bits.to_be_bytes().to_vec() }
        }
    }
}

fn bytes_to_scalar(bytes: &[u8], scalar: ScalarType, endian: Endian) -> i64 {
    match scalar {
        ScalarType::U8 | ScalarType::Bool => bytes[0] as i64,
        ScalarType::I8 => bytes[0] as i8 as i64,
        ScalarType::U16 => endian_u16(endian, bytes) as i64,
        ScalarType::I16 => endian_u16(endian, bytes) as i16 as i64,
        ScalarType::U32 => endian_u32(endian, bytes) as i64,
        ScalarType::I32 => endian_u32(endian, bytes) as i32 as i64,
        ScalarType::U64 | ScalarType::I64 => {
            let mut arr = [0u8; 8];
            arr.copy_from_slice(bytes);
            (if endian == Endian::Little { u64::from_le_bytes(arr) } else { u64::from_be_bytes(arr) }) as i64
        }
        ScalarType::F32 => f32::from_bits(endian_u32(endian, bytes)) as i64,
        ScalarType::F64 => {
            let mut arr = [0u8; 8];
            arr.copy_from_slice(bytes);
            (if endian == Endian::Little { f64::from_bits(u64::from_le_bytes(arr)) } else { f64::from_bits(u64::from_be_bytes(arr)) }) as i64
        }
    }
}

fn handle_str_null(ctx: &mut VmContext, key: u16, op: Opcode, max_len: usize) -> Result<()> {
    match ctx.mode {
        Mode::Encode => {
            let mut content = Vec::new();
            ctx.host.io(key, op, Slot::StrEncode(&mut content))?;
            content.truncate(max_len);
            let needed = content.len() + 1;
            if !begin_io(ctx, ctx.bytes_available(needed))? {
                return Ok(());
            }
            content.push(0);
            ctx.write_bytes(&content)?;
        }
        Mode::Decode => {
            let optional = ctx.pending_optional;
            ctx.pending_optional = false;
            if !ctx.bytes_available(1) {
                if optional {
                    ctx.host.io(key, op, Slot::StrDecode(&[]))?;
                    return Ok(());
                }
                bail!(Oob, Some(&*ctx), "STR_NULL at end of buffer");
            }
            let start = ctx.cursor;
            let limit = (start + max_len).min(ctx.buffer.len());
            let mut end = start;
            let mut terminated = false;
            while end < limit {
                if ctx.buffer[end] == 0 {
                    terminated = true;
                    break;
                }
                end += 1;
            }
            ensure!(terminated, Oob, Some(&*ctx), "STR_NULL has no terminator within max_len {}", max_len);
            let content = ctx.buffer[start..end].to_vec();
            ctx.cursor = end + 1;
            ctx.host.io(key, op, Slot::StrDecode(&content))?;
        }
    }
    Ok(())
}

fn handle_str_prefixed(ctx: &mut VmContext, key: u16, op: Opcode, prefix_width: usize) -> Result<()> {
    match ctx.mode {
        Mode::Encode => {
            let mut content = Vec::new();
            ctx.host.io(key, op, Slot::StrEncode(&mut content))?;
            let max = match prefix_width {
                1 => u8::MAX as usize,
                2 => u16::MAX as usize,
                _ => u32::MAX as usize,
            };
            ensure!(content.len() <= max, Arithmetic, Some(&*ctx), "string of {} bytes overflows {}-byte length prefix", content.len(), prefix_width);
            let needed = prefix_width + content.len();
            if !begin_io(ctx, ctx.bytes_available(needed))? {
                return Ok(());
            }
            write_prefix(ctx, content.len() as u32, prefix_width)?;
            ctx.write_bytes(&content)?;
        }
        Mode::Decode => {
            if !begin_io(ctx, ctx.bytes_available(prefix_width))? {
                ctx.host.io(key, op, Slot::StrDecode(&[]))?;
                return Ok(());
            }
            let len = read_prefix(ctx, prefix_width)? as usize;
            let content = ctx.read_bytes(len)?.to_vec();
            ctx.host.io(key, op, Slot::StrDecode(&content))?;
        }
    }
    Ok(())
}

fn write_prefix(ctx: &mut VmContext, len: u32, width: usize) -> Result<()> {
    match width {
        1 => ctx.write_bytes(&[len as u8]),
        2 => ctx.write_bytes(&endian_bytes_u16(ctx.endian, len as u16)),
        _ => ctx.write_bytes(&endian_bytes_u32(ctx.endian, len)),
    }
}

fn read_prefix(ctx: &mut VmContext, width: usize) -> Result<u32> {
    let bytes = ctx.read_bytes(width)?.to_vec();
    Ok(match width {
        1 => bytes[0] as u32,
        2 => endian_u16(ctx.endian, &bytes) as u32,
        _ => endian_u32(ctx.endian, &bytes),
    })
}

fn handle_arr_prefix_count(ctx: &mut VmContext, key: u16, op: Opcode, width: usize) -> Result<u32> {
    match ctx.mode {
        Mode::Encode => {
            let mut count: u32 = 0;
            ctx.host.io(key, op, Slot::Count(&mut count))?;
            let max = match width {
                1 => u8::MAX as u32,
                2 => u16::MAX as u32,
                _ => u32::MAX,
            };
            ensure!(count <= max, Arithmetic, Some(&*ctx), "array count {} overflows {}-byte length prefix", count, width);
            write_prefix(ctx, count, width)?;
            Ok(count)
        }
        Mode::Decode => {
            let count = read_prefix(ctx, width)?;
            let mut v = count;
            ctx.host.io(key, op, Slot::Count(&mut v))?;
            Ok(count)
        }
    }
}

fn handle_crc16(ctx: &mut VmContext, bc: &[u8], operand_start: usize) -> Result<()> {
    let poly = read_u16(bc, operand_start);
    let init = read_u16(bc, operand_start + 2);
    let xorout = read_u16(bc, operand_start + 4);
    let flags = CrcFlags::from_byte(bc[operand_start + 6]);
    ctx.align_to_byte();
    let span_start = ctx.crc_span_start.unwrap_or(0);
    let span_end = ctx.cursor;
    let data = ctx.buffer[span_start.min(span_end)..span_end].to_vec();
    let computed = crc::crc16(&data, poly, init, xorout, flags);
    match ctx.mode {
        Mode::Encode => {
            let mut v = computed;
            ctx.host.io(KEY_CRC_RESULT, Opcode::Crc16, Slot::U16(&mut v))?;
            ctx.write_bytes(&endian_bytes_u16(ctx.endian, v))?;
        }
        Mode::Decode => {
            let bytes = ctx.read_bytes(2)?.to_vec();
            let wire = endian_u16(ctx.endian, &bytes);
            let mut v = computed;
            ctx.host.io(KEY_CRC_RESULT, Opcode::Crc16, Slot::U16(&mut v))?;
            ensure!(wire == computed, CrcMismatch, Some(&*ctx), "CRC-16 mismatch: wire={:#06x} computed={:#06x}", wire, computed);
        }
    }
    Ok(())
}

fn handle_crc32(ctx: &mut VmContext, bc: &[u8], operand_start: usize) -> Result<()> {
    let poly = read_u32(bc, operand_start);
    let init = read_u32(bc, operand_start + 4);
    let xorout = read_u32(bc, operand_start + 8);
    let flags = CrcFlags::from_byte(bc[operand_start + 12]);
    ctx.align_to_byte();
    let span_start = ctx.crc_span_start.unwrap_or(0);
    let span_end = ctx.cursor;
    let data = ctx.buffer[span_start.min(span_end)..span_end].to_vec();
    let computed = crc::crc32(&data, poly, init, xorout, flags);
    match ctx.mode {
        Mode::Encode => {
            let mut v = computed;
            ctx.host.io(KEY_CRC_RESULT, Opcode::Crc32, Slot::U32(&mut v))?;
            ctx.write_bytes(&endian_bytes_u32(ctx.endian, v))?;
        }
        Mode::Decode => {
            let bytes = ctx.read_bytes(4)?.to_vec();
            let wire = endian_u32(ctx.endian, &bytes);
            let mut v = computed;
            ctx.host.io(KEY_CRC_RESULT, Opcode::Crc32, Slot::U32(&mut v))?;
            ensure!(wire == computed, CrcMismatch, Some(&*ctx), "CRC-32 mismatch: wire={:#010x} computed={:#010x}", wire, computed);
        }
    }
    Ok(())
}

/// Verify the bytecode, then drive it end to end against `buffer` via
/// `host`. Returns the final cursor: bytes written (ENCODE) or consumed
/// (DECODE).
pub fn execute(program: &Program, mode: Mode, buffer: &mut [u8], host: &mut dyn Host, trace: Option<&mut dyn IoWrite>) -> Result<usize> {
    verifier::verify(&program.bytecode)?;
    let mut ctx = VmContext::new(mode, buffer, host);
    ctx.trace = trace;
    while ctx.ip < program.bytecode.len() {
        step(program, &mut ctx)?;
    }
    Ok(ctx.cursor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::callback::Slot as S;

    struct U16Host(u16);
    impl Host for U16Host {
        fn io(&mut self, _key: u16, _op: Opcode, slot: Slot) -> Result<()> {
            if let S::U16(v) = slot {
                *v = self.0;
            }
            Ok(())
        }
    }

    struct Capture(Option<u16>);
    impl Host for Capture {
        fn io(&mut self, _key: u16, _op: Opcode, slot: Slot) -> Result<()> {
            if let S::U16(v) = slot {
                self.0 = Some(*v);
            }
            Ok(())
        }
    }

    fn prog(bc: Vec<u8>) -> Program {
        Program::new(1, vec!["f".into()], bc)
    }

    #[test]
    fn little_endian_u16_scenario() {
        let mut bc = vec![Opcode::SetEndianLe.as_u8(), Opcode::IoU16.as_u8()];
        bc.extend_from_slice(&1u16.to_le_bytes());
        let p = prog(bc);
        let mut buf = [0u8; 2];
        let mut host = U16Host(0x1234);
        execute(&p, Mode::Encode, &mut buf, &mut host, None).unwrap();
        assert_eq!(buf, [0x34, 0x12]);

        let mut cap = Capture(None);
        execute(&p, Mode::Decode, &mut buf, &mut cap, None).unwrap();
        assert_eq!(cap.0, Some(0x1234));
    }

    #[test]
    fn big_endian_u16_scenario() {
        let mut bc = vec![Opcode::SetEndianBe.as_u8(), Opcode::IoU16.as_u8()];
        bc.extend_from_slice(&1u16.to_le_bytes());
        let p = prog(bc);
        let mut buf = [0u8; 2];
        let mut host = U16Host(0x1234);
        execute(&p, Mode::Encode, &mut buf, &mut host, None).unwrap();
        assert_eq!(buf, [0x12, 0x34]);
    }

    struct BitHost(Vec<u64>, usize);
    impl Host for BitHost {
        fn io(&mut self, _key: u16, _op: Opcode, slot: Slot) -> Result<()> {
            if let S::BitU(v) = slot {
                *v = self.0[self.1];
                self.1 += 1;
            }
            Ok(())
        }
    }

    #[test]
    fn two_bits_then_pad_scenario() {
        let mut bc = Vec::new();
        bc.push(Opcode::IoBitU.as_u8());
        bc.extend_from_slice(&1u16.to_le_bytes());
        bc.push(1);
        bc.push(Opcode::IoBitU.as_u8());
        bc.extend_from_slice(&2u16.to_le_bytes());
        bc.push(1);
        bc.push(Opcode::AlignPad.as_u8());
        bc.push(6);
        let p = prog(bc);
        let mut buf = [0u8; 1];
        let mut host = BitHost(vec![1, 1], 0);
        let n = execute(&p, Mode::Encode, &mut buf, &mut host, None).unwrap();
        assert_eq!(buf[0], 0x03);
        assert_eq!(n, 1);
    }

    struct StrHost(&'static str);
    impl Host for StrHost {
        fn io(&mut self, _key: u16, _op: Opcode, slot: Slot) -> Result<()> {
            if let S::StrEncode(buf) = slot {
                buf.extend_from_slice(self.0.as_bytes());
            }
            Ok(())
        }
    }

    #[test]
    fn prefixed_string_scenario() {
        let mut bc = vec![Opcode::StrPreU8.as_u8()];
        bc.extend_from_slice(&1u16.to_le_bytes());
        let p = prog(bc);
        let mut buf = [0u8; 6];
        let mut host = StrHost("Hello");
        execute(&p, Mode::Encode, &mut buf, &mut host, None).unwrap();
        assert_eq!(buf, [0x05, b'H', b'e', b'l', b'l', b'o']);
    }

    struct NopHost;
    impl Host for NopHost {
        fn io(&mut self, _key: u16, _op: Opcode, _slot: Slot) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn crc16_over_nine_bytes() {
        let mut bc = Vec::new();
        bc.push(Opcode::ArrFixed.as_u8());
        bc.extend_from_slice(&1u16.to_le_bytes());
        bc.extend_from_slice(&9u32.to_le_bytes());
        bc.push(Opcode::IoU8.as_u8());
        bc.extend_from_slice(&2u16.to_le_bytes());
        bc.push(Opcode::ArrEnd.as_u8());
        bc.push(Opcode::Crc16.as_u8());
        bc.extend_from_slice(&crc::CRC16_DEFAULT_POLY.to_le_bytes());
        bc.extend_from_slice(&crc::CRC16_DEFAULT_INIT.to_le_bytes());
        bc.extend_from_slice(&crc::CRC16_DEFAULT_XOR.to_le_bytes());
        bc.push(crc::CRC16_DEFAULT_FLAGS.to_byte());
        let p = prog(bc);

        struct DigitHost(Vec<u8>, usize);
        impl Host for DigitHost {
            fn io(&mut self, _key: u16, _op: Opcode, slot: Slot) -> Result<()> {
                if let S::U8(v) = slot {
                    *v = self.0[self.1];
                    self.1 += 1;
                }
                Ok(())
            }
        }

        let mut buf = [0u8; 11];
        let mut host = DigitHost(b"123456789".to_vec(), 0);
        execute(&p, Mode::Encode, &mut buf, &mut host, None).unwrap();
        assert_eq!(&buf[9..11], &[0xB1, 0x29]);

        let mut host2 = NopHost;
        execute(&p, Mode::Decode, &mut buf, &mut host2, None).unwrap();
    }

    /// A nested `ENTER_STRUCT`/`EXIT_STRUCT` between the packet's own start
    /// and a `CRC_16` slot must not leave the nested struct's start as the
    /// checksummed span: `EXIT_STRUCT` should restore it back to the
    /// packet's own start.
    #[test]
    fn crc_span_survives_nested_struct_exit() {
        let mut bc = Vec::new();
        bc.push(Opcode::EnterStruct.as_u8());
        bc.extend_from_slice(&0u16.to_le_bytes());
        bc.push(Opcode::IoU8.as_u8());
        bc.extend_from_slice(&1u16.to_le_bytes());
        bc.push(Opcode::EnterStruct.as_u8());
        bc.extend_from_slice(&2u16.to_le_bytes());
        bc.push(Opcode::IoU8.as_u8());
        bc.extend_from_slice(&3u16.to_le_bytes());
        bc.push(Opcode::ExitStruct.as_u8());
        bc.push(Opcode::Crc16.as_u8());
        bc.extend_from_slice(&crc::CRC16_DEFAULT_POLY.to_le_bytes());
        bc.extend_from_slice(&crc::CRC16_DEFAULT_INIT.to_le_bytes());
        bc.extend_from_slice(&crc::CRC16_DEFAULT_XOR.to_le_bytes());
        bc.push(crc::CRC16_DEFAULT_FLAGS.to_byte());
        bc.push(Opcode::ExitStruct.as_u8());
        let p = prog(bc);

        struct TwoByteHost(u8, u8);
        impl Host for TwoByteHost {
            fn io(&mut self, key: u16, _op: Opcode, slot: Slot) -> Result<()> {
                if let S::U8(v) = slot {
                    *v = if key == 1 { self.0 } else { self.1 };
                }
                Ok(())
            }
        }

        let mut buf = [0u8; 4];
        let mut host = TwoByteHost(0x41, 0x42);
        execute(&p, Mode::Encode, &mut buf, &mut host, None).unwrap();
        let expected = crc::crc16(
            &[0x41, 0x42],
            crc::CRC16_DEFAULT_POLY,
            crc::CRC16_DEFAULT_INIT,
            crc::CRC16_DEFAULT_XOR,
            crc::CRC16_DEFAULT_FLAGS,
        );
        assert_eq!(u16::from_le_bytes([buf[2], buf[3]]), expected);
    }

    #[test]
    fn empty_fixed_array_executes_no_body() {
        let mut bc = Vec::new();
        bc.push(Opcode::ArrFixed.as_u8());
        bc.extend_from_slice(&1u16.to_le_bytes());
        bc.extend_from_slice(&0u32.to_le_bytes());
        bc.push(Opcode::IoU8.as_u8());
        bc.extend_from_slice(&2u16.to_le_bytes());
        bc.push(Opcode::ArrEnd.as_u8());
        let p = prog(bc);
        let mut buf = [9u8; 1];
        let mut host = NopHost;
        let n = execute(&p, Mode::Encode, &mut buf, &mut host, None).unwrap();
        assert_eq!(n, 0);
        assert_eq!(buf[0], 9);
    }

    #[test]
    fn optional_at_end_of_buffer_yields_zero_on_decode() {
        let mut bc = vec![Opcode::MarkOptional.as_u8(), Opcode::IoU16.as_u8()];
        bc.extend_from_slice(&1u16.to_le_bytes());
        let p = prog(bc);
        let mut buf: [u8; 0] = [];
        let mut cap = Capture(None);
        execute(&p, Mode::Decode, &mut buf, &mut cap, None).unwrap();
        assert_eq!(cap.0, Some(0));
    }

    #[test]
    fn oob_without_optional_at_end_of_buffer() {
        let bc = {
            let mut b = vec![Opcode::IoU16.as_u8()];
            b.extend_from_slice(&1u16.to_le_bytes());
            b
        };
        let p = prog(bc);
        let mut buf: [u8; 0] = [];
        let mut host = U16Host(5);
        let err = execute(&p, Mode::Encode, &mut buf, &mut host, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Oob);
    }

    #[test]
    fn const_write_validates_on_decode_same_as_const_check() {
        // `@match(V)` lowers to CONST_WRITE rather than CONST_CHECK, but
        // per spec.md §4.2 the two decorators are strict synonyms: both
        // must reject a mismatching decoded value.
        let mut bc = vec![Opcode::ConstWrite.as_u8()];
        bc.extend_from_slice(&1u16.to_le_bytes());
        bc.push(ScalarType::U8.to_tag());
        bc.push(0x42);
        let p = prog(bc);

        let mut buf = [0x42u8];
        let mut host = NopHost;
        execute(&p, Mode::Decode, &mut buf, &mut host, None).expect("matching byte decodes");

        let mut buf = [0x43u8];
        let err = execute(&p, Mode::Decode, &mut buf, &mut host, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn integer_division_by_zero_is_arithmetic_error() {
        let mut bc = Vec::new();
        bc.push(Opcode::PushImm.as_u8());
        bc.extend_from_slice(&5u64.to_le_bytes());
        bc.push(Opcode::PushImm.as_u8());
        bc.extend_from_slice(&0u64.to_le_bytes());
        bc.push(Opcode::Div.as_u8());
        let p = prog(bc);
        let mut buf: [u8; 0] = [];
        let mut host = NopHost;
        let err = execute(&p, Mode::Encode, &mut buf, &mut host, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Arithmetic);
    }
}
