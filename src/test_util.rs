//! Shared test fixtures: an in-memory wasm object builder, an `ar` archive
//! builder, and an RAII temp directory for driver-level tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use wasm_encoder::{
    ConstExpr, CustomSection, DataSection, ElementSection, Elements, EntityType, ExportKind,
    ExportSection, FunctionSection, GlobalSection, GlobalType, ImportSection, MemorySection,
    MemoryType, Module, RawSection, RefType, SectionId, TableSection, TableType, TypeSection,
    ValType,
};
use wasmparser::SymbolFlags;

use crate::wasm::encoder::{encode_sleb128_fixed, encode_uleb128_fixed, OutputBuffer};
use crate::wasm::types::*;

enum Body {
    /// Raw instruction bytes between the locals declaration and `end`.
    Plain(Vec<u8>),
    /// `call <target>` with a 5-byte padded LEB and a matching relocation.
    Call(u32),
    /// `i32.const <addr>` (5-byte padded SLEB, GLOBAL_ADDR_SLEB reloc
    /// against a file-space global index) followed by `drop`.
    GlobalAddr(u32),
}

struct FunctionDef {
    type_index: u32,
    name: String,
    body: Body,
}

enum ImportDef {
    Function { name: String, sig_index: u32 },
    Global { name: String },
}

/// Builds relocatable wasm objects the way the upstream compiler would:
/// standard sections via `wasm_encoder` with minimal LEBs, except the
/// relocatable code fields, which are 5-byte padded; every function gets an
/// export and a debug name.
pub struct ObjectBuilder {
    types: Vec<(Vec<ValType>, Option<ValType>)>,
    imports: Vec<ImportDef>,
    functions: Vec<FunctionDef>,
    tables: Vec<u32>,
    memories: Vec<u32>,
    globals: Vec<(WasmGlobal, Option<String>)>,
    data_segments: Vec<(i32, Vec<u8>)>,
    elems: Vec<Vec<u32>>,
    weak_names: Vec<String>,
}

impl ObjectBuilder {
    pub fn new() -> Self {
        ObjectBuilder {
            types: Vec::new(),
            imports: Vec::new(),
            functions: Vec::new(),
            tables: Vec::new(),
            memories: Vec::new(),
            globals: Vec::new(),
            data_segments: Vec::new(),
            elems: Vec::new(),
            weak_names: Vec::new(),
        }
    }

    pub fn sig(mut self, params: &[ValType], result: Option<ValType>) -> Self {
        self.types.push((params.to_vec(), result));
        self
    }

    pub fn import_function(mut self, name: &str, sig_index: u32) -> Self {
        self.imports.push(ImportDef::Function { name: name.to_string(), sig_index });
        self
    }

    pub fn import_global(mut self, name: &str) -> Self {
        self.imports.push(ImportDef::Global { name: name.to_string() });
        self
    }

    pub fn function(mut self, type_index: u32, name: &str, body: &[u8]) -> Self {
        self.functions.push(FunctionDef {
            type_index,
            name: name.to_string(),
            body: Body::Plain(body.to_vec()),
        });
        self
    }

    /// A function whose body calls the file-space function index `target`.
    pub fn function_calling(mut self, type_index: u32, name: &str, target: u32) -> Self {
        self.functions.push(FunctionDef {
            type_index,
            name: name.to_string(),
            body: Body::Call(target),
        });
        self
    }

    /// A function whose body takes the address of the file-space global
    /// index `global` (a data symbol).
    pub fn function_loading_global(
        mut self,
        type_index: u32,
        name: &str,
        global: u32,
    ) -> Self {
        self.functions.push(FunctionDef {
            type_index,
            name: name.to_string(),
            body: Body::GlobalAddr(global),
        });
        self
    }

    pub fn table(mut self, initial: u32) -> Self {
        self.tables.push(initial);
        self
    }

    pub fn memory(mut self, pages: u32) -> Self {
        self.memories.push(pages);
        self
    }

    pub fn global(
        mut self,
        ty: ValType,
        mutable: bool,
        init: WasmInitExpr,
        export: Option<&str>,
    ) -> Self {
        self.globals.push((
            WasmGlobal { ty, mutable, init },
            export.map(str::to_string),
        ));
        self
    }

    pub fn data_segment(mut self, offset: i32, content: &[u8]) -> Self {
        self.data_segments.push((offset, content.to_vec()));
        self
    }

    pub fn elem(mut self, functions: &[u32]) -> Self {
        self.elems.push(functions.to_vec());
        self
    }

    /// Mark a symbol weak via the "linking" section.
    pub fn weak(mut self, name: &str) -> Self {
        self.weak_names.push(name.to_string());
        self
    }

    pub fn build(self) -> Vec<u8> {
        let num_function_imports = self
            .imports
            .iter()
            .filter(|i| matches!(i, ImportDef::Function { .. }))
            .count() as u32;
        let num_global_imports = self.imports.len() as u32 - num_function_imports;

        // Code payload and relocations, offsets relative to the payload
        // start (which includes the function-count prefix). Built by hand:
        // the relocatable fields must keep their padded widths.
        let mut code = OutputBuffer::new();
        let mut relocations: Vec<WasmRelocation> = Vec::new();
        code.write_uleb128(self.functions.len() as u32);
        for func in &self.functions {
            let mut body: Vec<u8> = vec![0x00]; // no locals
            let mut field: Option<(u32, usize, u32)> = None;
            match &func.body {
                Body::Plain(extra) => body.extend_from_slice(extra),
                Body::Call(target) => {
                    body.push(0x10); // call
                    let mut padded = [0u8; 5];
                    encode_uleb128_fixed(*target, &mut padded);
                    field = Some((R_WEBASSEMBLY_FUNCTION_INDEX_LEB, body.len(), *target));
                    body.extend_from_slice(&padded);
                }
                Body::GlobalAddr(global) => {
                    body.push(0x41); // i32.const
                    let mut padded = [0u8; 5];
                    encode_sleb128_fixed(0, &mut padded);
                    field = Some((R_WEBASSEMBLY_GLOBAL_ADDR_SLEB, body.len(), *global));
                    body.extend_from_slice(&padded);
                    body.push(0x1a); // drop
                }
            }
            body.push(0x0b); // end

            code.write_uleb128(body.len() as u32);
            let body_start = code.tell();
            if let Some((ty, pos, index)) = field {
                relocations.push(WasmRelocation {
                    ty,
                    offset: (body_start + pos) as u32,
                    index,
                    addend: 0,
                });
            }
            code.write_bytes(&body);
        }

        let mut module = Module::new();

        if !self.types.is_empty() {
            let mut types = TypeSection::new();
            for (params, result) in &self.types {
                types.function(params.iter().copied(), result.iter().copied());
            }
            module.section(&types);
        }

        if !self.imports.is_empty() {
            let mut imports = ImportSection::new();
            for import in &self.imports {
                match import {
                    ImportDef::Function { name, sig_index } => {
                        imports.import("env", name, EntityType::Function(*sig_index));
                    }
                    ImportDef::Global { name } => {
                        imports.import(
                            "env",
                            name,
                            EntityType::Global(GlobalType {
                                val_type: ValType::I32,
                                mutable: false,
                                shared: false,
                            }),
                        );
                    }
                }
            }
            module.section(&imports);
        }

        if !self.functions.is_empty() {
            let mut functions = FunctionSection::new();
            for func in &self.functions {
                functions.function(func.type_index);
            }
            module.section(&functions);
        }

        if !self.tables.is_empty() {
            let mut tables = TableSection::new();
            for &initial in &self.tables {
                tables.table(TableType {
                    element_type: RefType::FUNCREF,
                    table64: false,
                    minimum: initial as u64,
                    maximum: Some(initial as u64),
                });
            }
            module.section(&tables);
        }

        if !self.memories.is_empty() {
            let mut memories = MemorySection::new();
            for &pages in &self.memories {
                memories.memory(MemoryType {
                    minimum: pages as u64,
                    maximum: None,
                    memory64: false,
                    shared: false,
                    page_size_log2: None,
                });
            }
            module.section(&memories);
        }

        if !self.globals.is_empty() {
            let mut globals = GlobalSection::new();
            for (global, _) in &self.globals {
                globals.global(
                    GlobalType {
                        val_type: global.ty,
                        mutable: global.mutable,
                        shared: false,
                    },
                    &global.init.to_const_expr(),
                );
            }
            module.section(&globals);
        }

        let global_exports: Vec<(u32, &str)> = self
            .globals
            .iter()
            .enumerate()
            .filter_map(|(i, (_, name))| {
                name.as_deref().map(|n| (num_global_imports + i as u32, n))
            })
            .collect();
        if !self.functions.is_empty() || !global_exports.is_empty() {
            let mut exports = ExportSection::new();
            for (i, func) in self.functions.iter().enumerate() {
                exports.export(&func.name, ExportKind::Func, num_function_imports + i as u32);
            }
            for (index, name) in &global_exports {
                exports.export(name, ExportKind::Global, *index);
            }
            module.section(&exports);
        }

        if !self.elems.is_empty() {
            let mut elements = ElementSection::new();
            for functions in &self.elems {
                elements.active(None, &ConstExpr::i32_const(0), Elements::Functions(functions));
            }
            module.section(&elements);
        }

        if !self.functions.is_empty() {
            module.section(&RawSection {
                id: SectionId::Code.into(),
                data: code.as_bytes(),
            });
        }

        if !self.data_segments.is_empty() {
            let mut data = DataSection::new();
            for (offset, content) in &self.data_segments {
                data.active(0, &ConstExpr::i32_const(*offset), content.iter().copied());
            }
            module.section(&data);
        }

        // "name" custom section: function names for imports and locals.
        let mut names: Vec<(u32, &str)> = Vec::new();
        let mut import_func = 0u32;
        for import in &self.imports {
            if let ImportDef::Function { name, .. } = import {
                names.push((import_func, name));
                import_func += 1;
            }
        }
        for (i, func) in self.functions.iter().enumerate() {
            names.push((num_function_imports + i as u32, &func.name));
        }
        if !names.is_empty() {
            let mut sub = OutputBuffer::new();
            sub.write_uleb128(names.len() as u32);
            for (index, name) in &names {
                sub.write_uleb128(*index);
                sub.write_str(name);
            }
            let mut payload = OutputBuffer::new();
            payload.write_u8(WASM_NAMES_FUNCTION);
            payload.write_uleb128(sub.as_bytes().len() as u32);
            payload.write_bytes(sub.as_bytes());
            module.section(&CustomSection {
                name: "name".into(),
                data: payload.into_bytes().into(),
            });
        }

        if !self.weak_names.is_empty() {
            let mut sub = OutputBuffer::new();
            sub.write_uleb128(self.weak_names.len() as u32);
            for name in &self.weak_names {
                sub.write_str(name);
                sub.write_uleb128(SymbolFlags::BINDING_WEAK.bits());
            }
            let mut payload = OutputBuffer::new();
            payload.write_u8(WASM_SYMBOL_INFO);
            payload.write_uleb128(sub.as_bytes().len() as u32);
            payload.write_bytes(sub.as_bytes());
            module.section(&CustomSection {
                name: "linking".into(),
                data: payload.into_bytes().into(),
            });
        }

        if !relocations.is_empty() {
            let mut payload = OutputBuffer::new();
            payload.write_uleb128(u8::from(SectionId::Code) as u32);
            payload.write_uleb128(relocations.len() as u32);
            for reloc in &relocations {
                payload.write_uleb128(reloc.ty);
                payload.write_uleb128(reloc.offset);
                payload.write_uleb128(reloc.index);
                if reloc_has_addend(reloc.ty) {
                    payload.write_uleb128(reloc.addend);
                }
            }
            module.section(&CustomSection {
                name: "reloc.CODE".into(),
                data: payload.into_bytes().into(),
            });
        }

        module.finish()
    }
}

// ── Archive builder ──────────────────────────────────────────────────────────

/// Build a GNU `ar` archive from `(member name, data, defined symbols)`
/// triples, including the symbol index and an extended name table when any
/// member name exceeds the 16-byte header field.
pub fn build_archive(members: &[(&str, Vec<u8>, Vec<&str>)]) -> Vec<u8> {
    // Name fields and the extended name table.
    let mut extended = Vec::new();
    let mut name_fields = Vec::new();
    for (name, _, _) in members {
        if name.len() > 15 {
            name_fields.push(format!("/{}", extended.len()));
            extended.extend_from_slice(name.as_bytes());
            extended.extend_from_slice(b"/\n");
        } else {
            name_fields.push(format!("{}/", name));
        }
    }

    // Symbol index size: count, offsets, NUL-terminated names.
    let sym_count: usize = members.iter().map(|(_, _, syms)| syms.len()).sum();
    let symtab_size = 4
        + 4 * sym_count
        + members
            .iter()
            .flat_map(|(_, _, syms)| syms.iter())
            .map(|s| s.len() + 1)
            .sum::<usize>();

    // Lay out member header offsets.
    let mut pos = 8 + 60 + symtab_size + symtab_size % 2;
    if !extended.is_empty() {
        pos += 60 + extended.len() + extended.len() % 2;
    }
    let mut header_offsets = Vec::new();
    for (_, data, _) in members {
        header_offsets.push(pos);
        pos += 60 + data.len() + data.len() % 2;
    }

    // Symbol index payload.
    let mut symtab = Vec::new();
    symtab.extend_from_slice(&(sym_count as u32).to_be_bytes());
    for (i, (_, _, syms)) in members.iter().enumerate() {
        for _ in syms {
            symtab.extend_from_slice(&(header_offsets[i] as u32).to_be_bytes());
        }
    }
    for (_, _, syms) in members {
        for sym in syms {
            symtab.extend_from_slice(sym.as_bytes());
            symtab.push(0);
        }
    }

    let mut out = Vec::new();
    out.extend_from_slice(b"!<arch>\n");
    write_ar_header(&mut out, "/", symtab.len());
    out.extend_from_slice(&symtab);
    if symtab.len() % 2 != 0 {
        out.push(b'\n');
    }
    if !extended.is_empty() {
        write_ar_header(&mut out, "//", extended.len());
        out.extend_from_slice(&extended);
        if extended.len() % 2 != 0 {
            out.push(b'\n');
        }
    }
    for ((_, data, _), field) in members.iter().zip(&name_fields) {
        write_ar_header(&mut out, field, data.len());
        out.extend_from_slice(data);
        if data.len() % 2 != 0 {
            out.push(b'\n');
        }
    }
    out
}

fn write_ar_header(out: &mut Vec<u8>, name_field: &str, size: usize) {
    out.extend_from_slice(format!("{:<16}", name_field).as_bytes());
    out.extend_from_slice(format!("{:<12}", 0).as_bytes());
    out.extend_from_slice(format!("{:<6}", 0).as_bytes());
    out.extend_from_slice(format!("{:<6}", 0).as_bytes());
    out.extend_from_slice(format!("{:<8}", 644).as_bytes());
    out.extend_from_slice(format!("{:<10}", size).as_bytes());
    out.extend_from_slice(b"`\n");
}

// ── Temp directories ─────────────────────────────────────────────────────────

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// RAII temp directory; removed with its contents on drop.
pub struct TempDir {
    path: PathBuf,
}

impl TempDir {
    pub fn new(prefix: &str) -> Self {
        let id = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "{}_{}_{}",
            prefix,
            std::process::id(),
            id
        ));
        std::fs::create_dir_all(&path).expect("failed to create temp dir");
        TempDir { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a file under the directory and return its path.
    pub fn write(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.path.join(name);
        std::fs::write(&path, bytes).expect("failed to write temp file");
        path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}
