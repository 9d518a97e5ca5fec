//! End-to-end round-trip over a packet combining every major feature:
//! nested struct, fixed array, prefixed array, a null-terminated string,
//! an enum, a scaled scalar, and a trailing CRC-32.

use concordia::vm::Opcode;
use concordia::{compile, execute, CompileOptions, Host, Mode, Program, Slot};

const SCHEMA: &str = r#"
enum Status : u8 {
    Ok = 0,
    Warning = 1,
    Error = 2,
}

struct Vec3 {
    f32 x;
    f32 y;
    f32 z;
}

packet KitchenSink {
    u32 magic;
    u32 timestamp;
    Vec3 pos;
    u8 tag[4];
    u16 counts[] prefix u8;
    string label until 0 max 33;
    Status status;
    @scale(0.1) u8 percent;
    @crc(32) u32 checksum;
}
"#;

#[derive(Clone, Debug, PartialEq)]
struct Fixture {
    magic: u32,
    timestamp: u32,
    pos: (f32, f32, f32),
    tag: [u8; 4],
    counts: Vec<u16>,
    label: String,
    status: u8,
    /// Engineering value the host sees through `@scale(0.1)`: the VM
    /// applies the transform, so the host reads/writes `15`, not the
    /// wire byte `150`.
    percent_eng: u8,
}

fn fixture() -> Fixture {
    Fixture {
        magic: 0xC0FFEE,
        timestamp: 1_700_000_000,
        pos: (1.5, -2.25, 3.0),
        tag: [0xDE, 0xAD, 0xBE, 0xEF],
        counts: vec![100, 200, 300],
        label: "hello concordia".to_string(),
        status: 2,
        percent_eng: 15,
    }
}

/// Reads `Fixture`'s fields out onto the wire during `Mode::Encode`,
/// dispatching by the field's dotted key name rather than call order.
struct EncodeHost<'p> {
    program: &'p Program,
    data: Fixture,
    tag_pos: usize,
    counts_pos: usize,
}

impl<'p> EncodeHost<'p> {
    fn new(program: &'p Program, data: Fixture) -> Self {
        EncodeHost { program, data, tag_pos: 0, counts_pos: 0 }
    }
}

impl<'p> Host for EncodeHost<'p> {
    fn io(&mut self, key: u16, _op: Opcode, slot: Slot) -> concordia::error::Result<()> {
        let name = self.program.key_name(key).unwrap_or("");
        match slot {
            Slot::U32(v) => match name {
                "KitchenSink.magic" => *v = self.data.magic,
                "KitchenSink.timestamp" => *v = self.data.timestamp,
                _ => {}
            },
            Slot::F32(v) => match name {
                "KitchenSink.pos.x" => *v = self.data.pos.0,
                "KitchenSink.pos.y" => *v = self.data.pos.1,
                "KitchenSink.pos.z" => *v = self.data.pos.2,
                _ => {}
            },
            Slot::U8(v) => match name {
                "KitchenSink.tag" => {
                    *v = self.data.tag[self.tag_pos];
                    self.tag_pos += 1;
                }
                "KitchenSink.status" => *v = self.data.status,
                "KitchenSink.percent" => *v = self.data.percent_eng,
                _ => {}
            },
            Slot::Count(v) => {
                if name == "KitchenSink.counts" {
                    *v = self.data.counts.len() as u32;
                }
            }
            Slot::U16(v) => {
                if name == "KitchenSink.counts" {
                    *v = self.data.counts[self.counts_pos];
                    self.counts_pos += 1;
                }
            }
            Slot::StrEncode(buf) => {
                if name == "KitchenSink.label" {
                    buf.extend_from_slice(self.data.label.as_bytes());
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Writes whatever the VM decoded off the wire into a `Fixture` during
/// `Mode::Decode`.
#[derive(Default)]
struct DecodeHost<'p> {
    program: Option<&'p Program>,
    tag_pos: usize,
    counts: Vec<u16>,
    magic: u32,
    timestamp: u32,
    pos: (f32, f32, f32),
    tag: [u8; 4],
    label: String,
    status: u8,
    percent_eng: u8,
}

impl<'p> DecodeHost<'p> {
    fn new(program: &'p Program) -> Self {
        DecodeHost { program: Some(program), ..Default::default() }
    }

    fn into_fixture(self) -> Fixture {
        Fixture {
            magic: self.magic,
            timestamp: self.timestamp,
            pos: self.pos,
            tag: self.tag,
            counts: self.counts,
            label: self.label,
            status: self.status,
            percent_eng: self.percent_eng,
        }
    }
}

impl<'p> Host for DecodeHost<'p> {
    fn io(&mut self, key: u16, _op: Opcode, slot: Slot) -> concordia::error::Result<()> {
        let name = self.program.and_then(|p| p.key_name(key)).unwrap_or("").to_string();
        match slot {
            Slot::U32(v) => match name.as_str() {
                "KitchenSink.magic" => self.magic = *v,
                "KitchenSink.timestamp" => self.timestamp = *v,
                _ => {}
            },
            Slot::F32(v) => match name.as_str() {
                "KitchenSink.pos.x" => self.pos.0 = *v,
                "KitchenSink.pos.y" => self.pos.1 = *v,
                "KitchenSink.pos.z" => self.pos.2 = *v,
                _ => {}
            },
            Slot::U8(v) => match name.as_str() {
                "KitchenSink.tag" => {
                    self.tag[self.tag_pos] = *v;
                    self.tag_pos += 1;
                }
                "KitchenSink.status" => self.status = *v,
                "KitchenSink.percent" => self.percent_eng = *v,
                _ => {}
            },
            Slot::Count(_) => {}
            Slot::U16(v) => {
                if name == "KitchenSink.counts" {
                    self.counts.push(*v);
                }
            }
            Slot::StrDecode(bytes) => {
                if name == "KitchenSink.label" {
                    self.label = String::from_utf8_lossy(bytes).into_owned();
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[test]
fn kitchen_sink_round_trips_and_checksums() {
    let out = compile(SCHEMA, &CompileOptions::default()).expect("schema compiles");
    assert_eq!(out.programs.len(), 1);
    let (name, program) = &out.programs[0];
    assert_eq!(name, "KitchenSink");

    let input = fixture();
    let mut buf = [0u8; 128];

    let mut encode_host = EncodeHost::new(program, input.clone());
    let written = execute(program, Mode::Encode, &mut buf, &mut encode_host, None).expect("encode");
    assert!(written > 0);

    let mut decode_host = DecodeHost::new(program);
    let read = execute(program, Mode::Decode, &mut buf, &mut decode_host, None).expect("decode");
    assert_eq!(read, written);

    let decoded = decode_host.into_fixture();
    assert_eq!(decoded, input);
}

/// Feeding back a deliberately corrupted buffer must fail with a CRC
/// mismatch rather than silently decoding wrong values.
#[test]
fn corrupted_wire_bytes_fail_crc_check() {
    let out = compile(SCHEMA, &CompileOptions::default()).expect("schema compiles");
    let (_, program) = &out.programs[0];

    let mut buf = [0u8; 128];
    let mut encode_host = EncodeHost::new(program, fixture());
    let written = execute(program, Mode::Encode, &mut buf, &mut encode_host, None).expect("encode");

    buf[0] ^= 0xFF;

    let mut decode_host = DecodeHost::new(program);
    let err = execute(program, Mode::Decode, &mut buf[..written], &mut decode_host, None).unwrap_err();
    assert_eq!(err.kind(), concordia::ErrorKind::CrcMismatch);
}
