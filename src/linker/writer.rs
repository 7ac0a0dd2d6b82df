//! Output module writer.
//!
//! Runs the emission phases over the resolved symbol table: import
//! calculation, per-object index-space offsets, symbol index assignment,
//! linear-memory layout, then section emission in the canonical order with
//! relocations applied to copied code payloads. Section payloads are built
//! with `wasm_encoder` and framed with the 5-byte padded size fields the
//! output format uses. Optional custom sections carry relocation metadata
//! (`reloc.CODE`) and debug function names (`name`).

use fxhash::FxHashSet;
use wasm_encoder::{
    CodeSection, ConstExpr, CustomSection, DataSection, ElementSection, Elements, EntityType,
    ExportKind, ExportSection, FunctionSection, GlobalSection, GlobalType, ImportSection,
    MemorySection, MemoryType, RefType, SectionId, TableSection, TableType, TypeSection, ValType,
};
use wasmparser::{BinaryReader, WasmFeatures};

use crate::common::error::Diagnostics;
use crate::linker::config::Config;
use crate::linker::input::InputFile;
use crate::linker::reloc::apply_code_relocations;
use crate::linker::symbols::SymbolTable;
use crate::wasm::encoder::{uleb128_size, OutputBuffer};
use crate::wasm::types::*;

fn round_up_to_page_size(size: u32) -> u32 {
    (size + WASM_PAGE_SIZE - 1) & !(WASM_PAGE_SIZE - 1)
}

/// Writes the linked module. Construct once per link, call `run()`, and
/// persist the returned bytes.
pub struct Writer<'a, 'b> {
    config: &'a mut Config,
    symtab: &'a mut SymbolTable,
    files: &'a mut Vec<InputFile>,
    diag: &'a mut Diagnostics<'b>,

    total_types: u32,
    total_functions: u32,
    total_globals: u32,
    total_memory_pages: u32,
    total_table_length: u32,
    total_exports: u32,
    total_elements: u32,
    total_data_segments: u32,
    total_code_relocations: u32,
    /// Accumulated but not yet emitted; only `reloc.CODE` is produced.
    #[allow(dead_code)]
    total_data_relocations: u32,

    /// Symbols that remain imports in the output, in discovery order.
    function_imports: Vec<usize>,
    global_imports: Vec<usize>,
}

impl<'a, 'b> Writer<'a, 'b> {
    pub fn new(
        config: &'a mut Config,
        symtab: &'a mut SymbolTable,
        files: &'a mut Vec<InputFile>,
        diag: &'a mut Diagnostics<'b>,
    ) -> Self {
        Writer {
            config,
            symtab,
            files,
            diag,
            total_types: 0,
            total_functions: 0,
            total_globals: 0,
            total_memory_pages: 0,
            total_table_length: 0,
            total_exports: 0,
            total_elements: 0,
            total_data_segments: 0,
            total_code_relocations: 0,
            total_data_relocations: 0,
            function_imports: Vec::new(),
            global_imports: Vec::new(),
        }
    }

    /// Run the emission phases and return the output module bytes.
    pub fn run(mut self) -> Result<Vec<u8>, String> {
        self.diag.log("-- calculateImports");
        self.calculate_imports();
        self.diag.log("-- calculateOffsets");
        self.calculate_offsets()?;
        self.diag.log("-- assignSymbolIndexes");
        self.assign_symbol_indexes()?;
        self.diag.log("-- layoutMemory");
        self.layout_memory();

        if self.diag.verbose {
            self.dump_info();
        }

        self.diag.log("-- writeSections");
        let mut out = OutputBuffer::new();
        out.write_bytes(&WASM_MAGIC);
        out.write_u32(WASM_VERSION);

        self.write_type_section(&mut out);
        self.write_import_section(&mut out)?;
        self.write_function_section(&mut out);
        self.write_table_section(&mut out);
        self.write_memory_section(&mut out);
        self.write_global_section(&mut out);
        self.write_export_section(&mut out)?;
        self.write_start_section(&mut out);
        self.write_elem_section(&mut out);
        self.write_code_section(&mut out)?;
        self.write_data_section(&mut out)?;

        if self.config.emit_relocs || self.config.relocatable {
            self.write_reloc_section(&mut out);
        }
        if !self.config.strip_debug && !self.config.strip_all {
            self.write_name_section(&mut out);
        }

        Ok(out.into_bytes())
    }

    // ── Phase A: import calculation ──────────────────────────────────────────

    /// Assign dense import indices to every referenced symbol that is still
    /// undefined, in object-then-symbol order. Function and global imports
    /// are numbered independently.
    fn calculate_imports(&mut self) {
        let object_files = self.symtab.object_files.clone();
        for file_id in object_files {
            let symbols = self.files[file_id].object().symbols.clone();
            for sym_id in symbols {
                let sym = self.symtab.symbol(sym_id);
                if sym.has_output_index() || sym.is_defined() {
                    continue;
                }
                if sym.is_function() {
                    let index = self.function_imports.len() as u32;
                    self.symtab.symbol_mut(sym_id).set_output_index(index);
                    self.function_imports.push(sym_id);
                } else {
                    let index = self.global_imports.len() as u32;
                    self.symtab.symbol_mut(sym_id).set_output_index(index);
                    self.global_imports.push(sym_id);
                }
            }
        }
    }

    // ── Phase B: index-space offsets ─────────────────────────────────────────

    /// Walk objects in input order and assign each its base offsets into the
    /// output type/function/global spaces, accumulating section totals.
    fn calculate_offsets(&mut self) -> Result<(), String> {
        self.total_globals = self.config.synthetic_globals.len() as u32;

        let object_files = self.symtab.object_files.clone();
        for file_id in object_files {
            let obj = self.files[file_id].object_mut();
            let display = obj.display_name();

            obj.type_index_offset = self.total_types;
            self.total_types += obj.wasm.types.len() as u32;

            obj.function_index_offset = (self.function_imports.len() as u32)
                .wrapping_sub(obj.num_function_imports())
                .wrapping_add(self.total_functions);
            self.total_functions += obj.wasm.functions.len() as u32;

            if self.config.relocatable {
                obj.global_index_offset = (self.global_imports.len() as u32)
                    .wrapping_sub(obj.num_global_imports())
                    .wrapping_add(self.total_globals);
                self.total_globals += obj.wasm.globals.len() as u32;
            }

            if obj.wasm.memories.len() > 1 {
                return Err(format!("{}: contains more than one memory", display));
            }

            match obj.wasm.tables.len() {
                0 => {}
                1 => self.total_table_length += obj.wasm.tables[0].limits.initial,
                _ => return Err(format!("{}: contains more than one table", display)),
            }

            self.total_exports += obj.wasm.exports.len() as u32;

            match obj.wasm.elements.len() {
                0 => {}
                1 => {
                    let segment = &obj.wasm.elements[0];
                    if segment.table_index != 0 {
                        return Err(format!("{}: unsupported table index", display));
                    }
                    if segment.offset != WasmInitExpr::I32Const(0) {
                        return Err(format!("{}: unsupported segment offset", display));
                    }
                    self.total_elements += segment.functions.len() as u32;
                }
                _ => {
                    return Err(format!(
                        "{}: contains more than one element segment",
                        display
                    ))
                }
            }

            self.total_data_segments += obj.wasm.data_segments.len() as u32;

            if let Some(code) = &obj.wasm.code_section {
                self.total_code_relocations += code.relocations.len() as u32;
            }
            if let Some(data) = &obj.wasm.data_section {
                self.total_data_relocations += data.relocations.len() as u32;
            }
        }
        Ok(())
    }

    // ── Phase C: symbol index assignment ─────────────────────────────────────

    /// Give every defined, not-yet-indexed symbol its output index from the
    /// owning object's base offset plus its file-space index.
    fn assign_symbol_indexes(&mut self) -> Result<(), String> {
        let object_files = self.symtab.object_files.clone();
        for file_id in object_files {
            let symbols = self.files[file_id].object().symbols.clone();
            for sym_id in symbols {
                let (is_function, owner) = {
                    let sym = self.symtab.symbol(sym_id);
                    if sym.has_output_index() || !sym.is_defined() {
                        continue;
                    }
                    (sym.is_function(), sym.file)
                };
                let Some(owner) = owner else { continue };

                let file_index = {
                    let sym = self.symtab.symbol(sym_id);
                    if is_function {
                        sym.function_index(self.files)?
                    } else {
                        sym.global_index(self.files)?
                    }
                };
                let obj = self.files[owner].object();
                let output_index = if is_function {
                    obj.function_index_offset.wrapping_add(file_index)
                } else {
                    obj.global_index_offset.wrapping_add(file_index)
                };

                let sym = self.symtab.symbol_mut(sym_id);
                sym.set_output_index(output_index);
                self.diag.log(&format!(
                    "assigning index for: {}: {} kind={}",
                    self.symtab.symbol(sym_id).name,
                    output_index,
                    self.symtab.symbol(sym_id).kind.as_str()
                ));
            }
        }
        Ok(())
    }

    // ── Phase D: memory layout ───────────────────────────────────────────────

    /// Lay out linear memory: page 0 is reserved, the stack grows down from
    /// `stack_top` in executables, then each object's static data follows in
    /// input order.
    fn layout_memory(&mut self) {
        let mut memory_ptr: u32 = WASM_PAGE_SIZE;

        if !self.config.relocatable {
            self.diag.log(&format!("stack_base = {:#x}", memory_ptr));
            memory_ptr += self.config.z_stack_size;
            if let Some((_, global)) = self.config.synthetic_globals.first_mut() {
                global.init = WasmInitExpr::I32Const(memory_ptr as i32);
            }
            self.diag.log(&format!("stack_top = {:#x}", memory_ptr));
        }

        let object_files = self.symtab.object_files.clone();
        for file_id in object_files {
            let obj = self.files[file_id].object_mut();
            let initial = match obj.wasm.memories.first() {
                Some(memory) if memory.initial > 0 => memory.initial,
                _ => continue,
            };
            obj.data_offset = memory_ptr;
            memory_ptr += initial * WASM_PAGE_SIZE;
        }

        let mem_size = round_up_to_page_size(memory_ptr);
        self.total_memory_pages = mem_size / WASM_PAGE_SIZE;
        self.diag.log(&format!("mem size  = {:#x}", mem_size));
        self.diag.log(&format!("mem pages = {:#x}", self.total_memory_pages));
    }

    fn dump_info(&mut self) {
        for &file_id in &self.symtab.object_files {
            let obj = self.files[file_id].object();
            self.diag.log(&format!(
                "{}: types={} functions={} globals={} type_off={} func_off={} data_off={:#x}",
                obj.display_name(),
                obj.wasm.types.len(),
                obj.wasm.functions.len(),
                obj.wasm.globals.len(),
                obj.type_index_offset,
                obj.function_index_offset,
                obj.data_offset,
            ));
        }
    }

    // ── Phase E: section emission ────────────────────────────────────────────

    fn write_type_section(&mut self, out: &mut OutputBuffer) {
        let mut types = TypeSection::new();
        for &file_id in &self.symtab.object_files {
            for sig in &self.files[file_id].object().wasm.types {
                types.function(
                    sig.param_types.iter().copied(),
                    sig.return_type.iter().copied(),
                );
            }
        }
        out.write_section(&types);
    }

    fn write_import_section(&mut self, out: &mut OutputBuffer) -> Result<(), String> {
        if self.function_imports.is_empty() && self.global_imports.is_empty() {
            return Ok(());
        }

        let mut imports = ImportSection::new();
        for &sym_id in &self.function_imports {
            let sym = self.symtab.symbol(sym_id);
            let file_id = sym
                .file
                .ok_or_else(|| format!("undefined function has no object: {}", sym.name))?;
            let sig_index = sym.function_type_index(self.files)?;
            let type_index = self.files[file_id].object().relocate_type_index(sig_index);
            imports.import("env", &sym.name, EntityType::Function(type_index));
        }
        for &sym_id in &self.global_imports {
            let sym = self.symtab.symbol(sym_id);
            // The source global's type is not tracked through resolution;
            // imports are emitted as immutable i32 placeholders.
            imports.import(
                "env",
                &sym.name,
                EntityType::Global(GlobalType {
                    val_type: ValType::I32,
                    mutable: false,
                    shared: false,
                }),
            );
        }
        out.write_section(&imports);
        Ok(())
    }

    fn write_function_section(&mut self, out: &mut OutputBuffer) {
        if self.total_functions == 0 {
            return;
        }
        let mut functions = FunctionSection::new();
        for &file_id in &self.symtab.object_files {
            let obj = self.files[file_id].object();
            for &sig in &obj.wasm.functions {
                functions.function(obj.relocate_type_index(sig));
            }
        }
        out.write_section(&functions);
    }

    fn write_table_section(&mut self, out: &mut OutputBuffer) {
        if self.total_table_length == 0 {
            return;
        }
        let mut tables = TableSection::new();
        tables.table(TableType {
            element_type: RefType::FUNCREF,
            table64: false,
            minimum: self.total_table_length as u64,
            maximum: Some(self.total_table_length as u64),
        });
        out.write_section(&tables);
    }

    fn write_memory_section(&mut self, out: &mut OutputBuffer) {
        let mut memories = MemorySection::new();
        memories.memory(MemoryType {
            minimum: self.total_memory_pages as u64,
            maximum: None,
            memory64: false,
            shared: false,
            page_size_log2: None,
        });
        out.write_section(&memories);
    }

    fn write_global_section(&mut self, out: &mut OutputBuffer) {
        let mut globals = GlobalSection::new();
        for (_, global) in &self.config.synthetic_globals {
            globals.global(
                GlobalType { val_type: global.ty, mutable: global.mutable, shared: false },
                &global.init.to_const_expr(),
            );
        }
        if self.config.relocatable {
            for &file_id in &self.symtab.object_files {
                for global in &self.files[file_id].object().wasm.globals {
                    globals.global(
                        GlobalType {
                            val_type: global.ty,
                            mutable: global.mutable,
                            shared: false,
                        },
                        &global.init.to_const_expr(),
                    );
                }
            }
        }
        out.write_section(&globals);
    }

    fn write_export_section(&mut self, out: &mut OutputBuffer) -> Result<(), String> {
        let export_memory = !self.config.relocatable;
        let export_other = self.config.relocatable;
        let export_entry = !self.config.entry.is_empty();

        let mut num_exports: u32 = 0;
        if export_memory {
            num_exports += 1;
        }
        if export_entry {
            num_exports += 1;
        }
        if export_other {
            num_exports += self.total_exports;
        }
        if num_exports == 0 {
            return Ok(());
        }

        let mut exports = ExportSection::new();

        if export_memory {
            exports.export("memory", ExportKind::Memory, 0);
        }

        if export_entry {
            let sym_id = self
                .symtab
                .find(&self.config.entry)
                .ok_or_else(|| format!("entry point not found: {}", self.config.entry))?;
            let sym = self.symtab.symbol(sym_id);
            if !sym.is_function() {
                return Err(format!("entry point is not a function: {}", sym.name));
            }
            exports.export(&self.config.export_entry_as, ExportKind::Func, sym.output_index());
        }

        if export_other {
            for &file_id in &self.symtab.object_files {
                let obj = self.files[file_id].object();
                for export in &obj.wasm.exports {
                    if export.kind == ExportKind::Table {
                        return Err(format!(
                            "{}: unsupported export kind: {:?}",
                            obj.display_name(),
                            export.kind
                        ));
                    }
                    exports.export(&export.name, export.kind, export.index);
                }
            }
        }

        out.write_section(&exports);
        Ok(())
    }

    /// Reserved; start functions are handled via the exported entry point.
    fn write_start_section(&mut self, _out: &mut OutputBuffer) {}

    fn write_elem_section(&mut self, out: &mut OutputBuffer) {
        if self.total_elements == 0 {
            return;
        }
        // Segment function indices are carried through unmapped; callers
        // are expected to hold table-relative references.
        let mut functions: Vec<u32> = Vec::with_capacity(self.total_elements as usize);
        for &file_id in &self.symtab.object_files {
            for segment in &self.files[file_id].object().wasm.elements {
                functions.extend_from_slice(&segment.functions);
            }
        }

        let mut elements = ElementSection::new();
        elements.active(None, &ConstExpr::i32_const(0), Elements::Functions(&functions));
        out.write_section(&elements);
    }

    fn write_code_section(&mut self, out: &mut OutputBuffer) -> Result<(), String> {
        if self.total_functions == 0 {
            return Ok(());
        }
        let mut code = CodeSection::new();
        let mut emitted: usize = 0;

        let object_files = self.symtab.object_files.clone();
        for file_id in object_files {
            if self.files[file_id].object().wasm.code_section.is_none() {
                continue;
            }
            self.files[file_id].object_mut().code_section_offset = emitted as u32;

            let obj = self.files[file_id].object();
            let section = match &obj.wasm.code_section {
                Some(section) => section,
                None => continue,
            };
            let mut content = section.content.clone();
            apply_code_relocations(obj, self.symtab, self.files, &mut content, self.diag)?;

            // Re-emit the object's bodies one by one; its function-count
            // prefix is dropped and the merged section carries one count.
            let mut reader = BinaryReader::new(&content, 0, WasmFeatures::default());
            let count = reader
                .read_var_u32()
                .map_err(|e| format!("{}: {}", obj.display_name(), e))?;
            for _ in 0..count {
                let size = reader
                    .read_var_u32()
                    .map_err(|e| format!("{}: {}", obj.display_name(), e))?;
                let body = reader
                    .read_bytes(size as usize)
                    .map_err(|e| format!("{}: {}", obj.display_name(), e))?;
                code.raw(body);
                emitted += uleb128_size(size as u64) + size as usize;
            }
        }
        out.write_section(&code);
        Ok(())
    }

    fn write_data_section(&mut self, out: &mut OutputBuffer) -> Result<(), String> {
        if self.total_data_segments == 0 {
            return Ok(());
        }
        let mut data = DataSection::new();

        for &file_id in &self.symtab.object_files {
            let obj = self.files[file_id].object();
            if obj.wasm.data_segments.len() > 1 {
                return Err(format!(
                    "{}: contains more than one data segment",
                    obj.display_name()
                ));
            }
            for segment in &obj.wasm.data_segments {
                let base = segment.offset.as_i32().ok_or_else(|| {
                    format!("{}: unsupported segment offset", obj.display_name())
                })?;
                let new_offset = base.wrapping_add(obj.data_offset as i32);
                data.active(
                    segment.index,
                    &ConstExpr::i32_const(new_offset),
                    segment.content.iter().copied(),
                );
            }
        }

        out.write_section(&data);
        Ok(())
    }

    fn write_reloc_section(&mut self, out: &mut OutputBuffer) {
        if self.total_code_relocations == 0 {
            return;
        }
        let mut payload = OutputBuffer::new();
        payload.write_uleb128(u8::from(SectionId::Code) as u32);
        payload.write_uleb128(self.total_code_relocations);

        for &file_id in &self.symtab.object_files {
            let obj = self.files[file_id].object();
            let code = match &obj.wasm.code_section {
                Some(code) => code,
                None => continue,
            };
            for reloc in &code.relocations {
                payload.write_uleb128(reloc.ty);
                payload.write_uleb128(obj.relocate_code_offset(reloc.offset));
                let index = match reloc.ty {
                    R_WEBASSEMBLY_TYPE_INDEX_LEB => obj.relocate_type_index(reloc.index),
                    R_WEBASSEMBLY_FUNCTION_INDEX_LEB => {
                        obj.relocate_function_index(self.symtab, reloc.index)
                    }
                    R_WEBASSEMBLY_TABLE_INDEX_I32 | R_WEBASSEMBLY_TABLE_INDEX_SLEB => {
                        obj.relocate_table_index(reloc.index)
                    }
                    _ => obj.relocate_global_index(self.symtab, reloc.index),
                };
                payload.write_uleb128(index);
                if reloc_has_addend(reloc.ty) {
                    payload.write_uleb128(reloc.addend);
                }
            }
        }

        out.write_section(&CustomSection {
            name: "reloc.CODE".into(),
            data: payload.into_bytes().into(),
        });
    }

    fn write_name_section(&mut self, out: &mut OutputBuffer) {
        // Counting pass; the set also dedups names shared across objects.
        let mut written: FxHashSet<usize> = FxHashSet::default();
        let mut name_count: u32 = 0;
        for &file_id in &self.symtab.object_files {
            let obj = self.files[file_id].object();
            for rec in &obj.wasm.symbols {
                if rec.ty != WasmSymbolType::DebugFunctionName {
                    continue;
                }
                if obj.is_resolved_function_import(self.symtab, rec.element_index) {
                    continue;
                }
                if let Some(sym_id) = self.symtab.find(&rec.name) {
                    if !written.insert(sym_id) {
                        continue;
                    }
                }
                name_count += 1;
            }
        }

        // The subsection size is framed like a section so it can be
        // backpatched, which `wasm_encoder`'s name-section builder does not
        // model.
        let section = out.begin_section(SectionId::Custom.into());
        out.write_str("name");
        let subsection = out.begin_section(WASM_NAMES_FUNCTION);
        out.write_uleb128(name_count);

        // Imports must appear before any local function names.
        for imported in [true, false] {
            for &file_id in &self.symtab.object_files {
                let obj = self.files[file_id].object();
                for rec in &obj.wasm.symbols {
                    if rec.ty != WasmSymbolType::DebugFunctionName {
                        continue;
                    }
                    if obj.is_imported_function(rec.element_index) != imported {
                        continue;
                    }
                    if obj.is_resolved_function_import(self.symtab, rec.element_index) {
                        continue;
                    }
                    if let Some(sym_id) = self.symtab.find(&rec.name) {
                        if !written.remove(&sym_id) {
                            continue;
                        }
                    }
                    out.write_uleb128(
                        obj.relocate_function_index(self.symtab, rec.element_index),
                    );
                    out.write_str(&rec.name);
                }
            }
        }
        out.end_section(subsection);
        out.end_section(section);
    }
}

/// Write the linked module to `Config.OutputFile`, replacing any existing
/// file. Emission failures inside the writer are fatal; failure to write
/// the output file is a recoverable error.
pub fn write_result(
    config: &mut Config,
    symtab: &mut SymbolTable,
    files: &mut Vec<InputFile>,
    diag: &mut Diagnostics,
) -> Result<(), String> {
    let bytes = Writer::new(config, symtab, files, diag).run()?;
    diag.log(&format!("writing: {}", config.output_file));
    let _ = std::fs::remove_file(&config.output_file);
    if let Err(e) = std::fs::write(&config.output_file, &bytes) {
        diag.error(&format!("failed to open {}: {}", config.output_file, e));
    }
    Ok(())
}
