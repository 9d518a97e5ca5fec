//! The schema compiler front end. [`compile`] takes one schema source
//! string, pulls in whatever it `@import`s, resolves struct/enum/packet
//! names into a single merged registry, and hands each top-level
//! `packet` to [`codegen::Codegen`] to produce one
//! [`crate::container::Program`] per packet.

pub mod ast;
pub mod codegen;
pub mod expr;
pub mod interner;
pub mod lexer;
pub mod parser;
pub mod token;

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::compiler::ast::EndianSpec;
use crate::compiler::codegen::{Codegen, Registries};
use crate::compiler::interner::Interner;
use crate::compiler::parser::{ParsedFile, Parser};
use crate::container::{Program, DEFAULT_VERSION};
use crate::error::{Error, ErrorKind};
use crate::vm::verify;

/// One parse/codegen diagnostic. `file` names the origin a resolver handed
/// back (or `"<input>"`/`"<merged>"` for the root source and whole-unit
/// checks that don't belong to a single file). `kind` is populated with the
/// structured error kind only when `CompileOptions::json_diagnostics` is
/// set, for a consumer (the out-of-scope LSP) that wants to switch on the
/// failure category rather than parse prose; `compile` always reports every
/// diagnostic's `line`/`column`/`message` regardless of the flag.
#[derive(Debug, Clone)]
pub struct CompilerError {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub message: String,
    pub kind: Option<ErrorKind>,
}

/// `Some(kind)` when `options.json_diagnostics` is set, `None` otherwise —
/// the single gate every `CompilerError` construction site uses to decide
/// whether to populate its structured `kind` field.
fn diag_kind(options: &CompileOptions, kind: ErrorKind) -> Option<ErrorKind> {
    if options.json_diagnostics {
        Some(kind)
    } else {
        None
    }
}

impl fmt::Display for CompilerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}:{}: {}", self.file, self.line, self.column, self.message)
    }
}

/// Resolves an `@import "path";` statement relative to whatever file it
/// appeared in, returning a canonical id for cycle tracking plus the
/// imported file's source text. The library itself never touches a
/// filesystem; callers that want `@import` to work supply one of these.
pub trait ImportResolver {
    fn resolve(&self, from: &str, path: &str) -> Result<(String, String), String>;
}

/// The default resolver, used when a caller doesn't need `@import` at all.
/// Any `@import` statement under it becomes an `ImportNotFound` diagnostic.
pub struct NullResolver;

impl ImportResolver for NullResolver {
    fn resolve(&self, _from: &str, path: &str) -> Result<(String, String), String> {
        Err(format!("no import resolver configured for '{}'", path))
    }
}

pub struct CompileOptions {
    /// When set, `CompileOutput::trace` collects a line per file parsed and
    /// per packet compiled. Kept as a plain `Vec<String>` collected after
    /// the fact rather than a live `&mut dyn Write` sink, since a sink
    /// would have to outlive every recursive `@import` call along with the
    /// registries and interner — a simplification over a logging-crate
    /// subscriber, noted in `DESIGN.md`.
    pub verbose: bool,
    /// When set, every `CompilerError` this compile produces has its `kind`
    /// field populated, so a consumer serializing diagnostics to JSON can
    /// switch on the failure category instead of parsing `message` prose.
    pub json_diagnostics: bool,
    pub resolver: Box<dyn ImportResolver>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions { verbose: false, json_diagnostics: false, resolver: Box::new(NullResolver) }
    }
}

pub struct CompileOutput {
    /// One compiled program per top-level `packet`, in source order. There
    /// is no packet-selector opcode in the bytecode set, so a schema
    /// defining more than one packet produces more than one `Program`
    /// rather than a single blob a caller would have to dispatch into.
    pub programs: Vec<(String, Program)>,
    pub trace: Vec<String>,
}

fn load_file(
    src: &str,
    origin: &str,
    options: &CompileOptions,
    merged: &mut ParsedFile,
    imported: &mut HashSet<String>,
    import_stack: &mut Vec<String>,
    errors: &mut Vec<CompilerError>,
    trace: &mut Vec<String>,
) {
    let (file, parse_errors) = Parser::parse_source(src);
    for (line, column, message, kind) in parse_errors {
        errors.push(CompilerError { file: origin.to_string(), line, column, message, kind: diag_kind(options, kind) });
    }
    if options.verbose {
        trace.push(format!(
            "parsed {} ({} structs, {} enums, {} packets)",
            origin,
            file.structs.len(),
            file.enums.len(),
            file.packets.len()
        ));
    }

    if merged.version.is_none() {
        merged.version = file.version;
    }
    if merged.default_endian.is_none() {
        merged.default_endian = file.default_endian;
    }
    let imports = file.imports.clone();
    merged.structs.extend(file.structs);
    merged.enums.extend(file.enums);
    merged.packets.extend(file.packets);

    for imp in &imports {
        if import_stack.contains(&imp.path) {
            errors.push(CompilerError {
                file: origin.to_string(),
                line: imp.line,
                column: 0,
                message: format!("import cycle at '{}'", imp.path),
                kind: diag_kind(options, ErrorKind::ImportCycle),
            });
            continue;
        }
        match options.resolver.resolve(origin, &imp.path) {
            Ok((canonical, text)) => {
                if imported.contains(&canonical) {
                    continue;
                }
                imported.insert(canonical.clone());
                import_stack.push(imp.path.clone());
                load_file(&text, &canonical, options, merged, imported, import_stack, errors, trace);
                import_stack.pop();
            }
            Err(message) => {
                errors.push(CompilerError { file: origin.to_string(), line: imp.line, column: 0, message, kind: diag_kind(options, ErrorKind::ImportNotFound) });
            }
        }
    }
}

/// Compiles one schema source string, resolving `@import`s through
/// `options.resolver`. Returns one `Program` per top-level `packet` on
/// success, or every diagnostic collected across parsing, name resolution,
/// and codegen on failure — never just the first.
pub fn compile(source: &str, options: &CompileOptions) -> Result<CompileOutput, Vec<CompilerError>> {
    let mut trace = Vec::new();
    let mut merged = ParsedFile::default();
    let mut imported = HashSet::new();
    let mut import_stack = vec!["<input>".to_string()];
    let mut errors = Vec::new();

    load_file(source, "<input>", options, &mut merged, &mut imported, &mut import_stack, &mut errors, &mut trace);

    if !errors.is_empty() {
        return Err(errors);
    }

    let mut structs = HashMap::new();
    for s in &merged.structs {
        if structs.insert(s.name.clone(), s.clone()).is_some() {
            errors.push(CompilerError { file: "<merged>".into(), line: s.line, column: 0, message: format!("duplicate struct name '{}'", s.name), kind: diag_kind(options, ErrorKind::DuplicateKey) });
        }
    }
    let mut enums = HashMap::new();
    for e in &merged.enums {
        if enums.insert(e.name.clone(), e.clone()).is_some() {
            errors.push(CompilerError { file: "<merged>".into(), line: e.line, column: 0, message: format!("duplicate enum name '{}'", e.name), kind: diag_kind(options, ErrorKind::DuplicateKey) });
        }
    }
    for name in structs.keys() {
        if enums.contains_key(name) {
            errors.push(CompilerError { file: "<merged>".into(), line: 0, column: 0, message: format!("'{}' is defined as both a struct and an enum", name), kind: diag_kind(options, ErrorKind::DuplicateKey) });
        }
    }
    let mut seen_packets = HashSet::new();
    for p in &merged.packets {
        if !seen_packets.insert(p.name.clone()) {
            errors.push(CompilerError { file: "<merged>".into(), line: p.line, column: 0, message: format!("duplicate packet name '{}'", p.name), kind: diag_kind(options, ErrorKind::DuplicateKey) });
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    let regs = Registries { structs, enums };
    let file_endian = merged.default_endian.unwrap_or(EndianSpec::Little);
    let version = merged.version.unwrap_or(DEFAULT_VERSION);

    let mut interner = Interner::new();
    let mut packet_bytecode: Vec<(String, Vec<u8>)> = Vec::new();
    for pkt in &merged.packets {
        let mut gen = Codegen::new(&mut interner, &regs);
        match gen.compile_packet(pkt, file_endian) {
            Ok(bc) => {
                if let Err(e) = verify(&bc) {
                    errors.push(internal_error(pkt.line, &pkt.name, &e, options));
                } else {
                    if options.verbose {
                        trace.push(format!("compiled packet '{}' ({} bytecode bytes)", pkt.name, bc.len()));
                    }
                    packet_bytecode.push((pkt.name.clone(), bc));
                }
            }
            Err(e) => errors.push(CompilerError { file: "<merged>".into(), line: pkt.line, column: 0, message: format!("{}", e), kind: diag_kind(options, e.kind()) }),
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    let strings = interner.into_vec();
    let programs = packet_bytecode.into_iter().map(|(name, bc)| (name, Program::new(version, strings.clone(), bc))).collect();

    Ok(CompileOutput { programs, trace })
}

fn internal_error(line: u32, packet: &str, e: &Error, options: &CompileOptions) -> CompilerError {
    CompilerError {
        file: "<merged>".into(),
        line,
        column: 0,
        message: format!("internal codegen error compiling packet '{}': {}", packet, e),
        kind: diag_kind(options, e.kind()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_one_program_per_packet() {
        let src = "packet Ping {\n  u32 seq;\n}\npacket Pong {\n  u32 seq;\n  u8 ok;\n}\n";
        let out = compile(src, &CompileOptions::default()).unwrap();
        assert_eq!(out.programs.len(), 2);
        assert_eq!(out.programs[0].0, "Ping");
        assert_eq!(out.programs[1].0, "Pong");
    }

    #[test]
    fn reports_every_parse_error_not_just_the_first() {
        let src = "struct Bad1 {\n  @@@ garbage\n}\nstruct Bad2 {\n  @@@ garbage\n}\n";
        let errs = compile(src, &CompileOptions::default()).unwrap_err();
        assert!(errs.len() >= 2);
    }

    #[test]
    fn rejects_duplicate_struct_names() {
        let src = "struct S { u8 a; }\nstruct S { u8 b; }\npacket P { S s; }\n";
        let errs = compile(src, &CompileOptions::default()).unwrap_err();
        assert!(errs.iter().any(|e| e.message.contains("duplicate struct name")));
    }

    #[test]
    fn json_diagnostics_gates_the_structured_kind_field() {
        let src = "struct S { u8 a; }\nstruct S { u8 b; }\npacket P { S s; }\n";
        let errs = compile(src, &CompileOptions::default()).unwrap_err();
        assert!(errs.iter().all(|e| e.kind.is_none()));

        let options = CompileOptions { json_diagnostics: true, ..CompileOptions::default() };
        let errs = compile(src, &options).unwrap_err();
        assert!(errs.iter().any(|e| e.kind == Some(ErrorKind::DuplicateKey)));
    }

    #[test]
    fn unresolved_import_is_reported() {
        let src = "@import \"missing.cds\";\npacket P { u8 x; }\n";
        let errs = compile(src, &CompileOptions::default()).unwrap_err();
        assert!(errs.iter().any(|e| e.message.contains("no import resolver configured")));
    }

    struct MapResolver(HashMap<&'static str, &'static str>);
    impl ImportResolver for MapResolver {
        fn resolve(&self, _from: &str, path: &str) -> Result<(String, String), String> {
            self.0.get(path).map(|s| (path.to_string(), s.to_string())).ok_or_else(|| format!("no such file '{}'", path))
        }
    }

    #[test]
    fn imported_struct_is_visible_to_the_importing_file() {
        let mut files = HashMap::new();
        files.insert("common.cds", "struct Header {\n  u8 version;\n}\n");
        let src = "@import \"common.cds\";\npacket P {\n  Header hdr;\n}\n";
        let options = CompileOptions { resolver: Box::new(MapResolver(files)), ..CompileOptions::default() };
        let out = compile(src, &options).unwrap();
        assert_eq!(out.programs.len(), 1);
    }

    #[test]
    fn import_cycle_is_rejected() {
        let mut files = HashMap::new();
        files.insert("a.cds", "@import \"b.cds\";\nstruct A { u8 x; }\n");
        files.insert("b.cds", "@import \"a.cds\";\nstruct B { u8 y; }\n");
        let src = "@import \"a.cds\";\npacket P { u8 x; }\n";
        let options = CompileOptions { resolver: Box::new(MapResolver(files)), ..CompileOptions::default() };
        let errs = compile(src, &options).unwrap_err();
        assert!(errs.iter().any(|e| e.message.contains("import cycle")));
    }
}
