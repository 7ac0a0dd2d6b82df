//! Symbols and the symbol table.
//!
//! Symbols are arena-allocated in insertion order and referenced by index;
//! the table maps each name (hashed once per lookup) to its symbol. Input
//! files are added in argument order, and archive members are pulled in at
//! the moment a lazy symbol is resolved, so numbering is deterministic.

use fxhash::{FxHashMap, FxHashSet};
use wasmparser::SymbolFlags;

use crate::common::error::Diagnostics;
use crate::linker::config::Config;
use crate::linker::input::{InputFile, ObjectFile};
use crate::wasm::reader;
use crate::wasm::types::{WasmSymbol, WasmSymbolType, WASM_MAGIC};

/// The five-way symbol kind. Kinds only transition along the resolution
/// rules in `SymbolTable`; once a symbol leaves `Lazy` its archive cookie is
/// unused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    DefinedFunction,
    DefinedGlobal,
    UndefinedFunction,
    UndefinedGlobal,
    Lazy,
}

impl SymbolKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SymbolKind::DefinedFunction => "DefinedFunction",
            SymbolKind::DefinedGlobal => "DefinedGlobal",
            SymbolKind::UndefinedFunction => "UndefinedFunction",
            SymbolKind::UndefinedGlobal => "UndefinedGlobal",
            SymbolKind::Lazy => "Lazy",
        }
    }
}

/// The fields of the underlying wasm symbol record a `Symbol` needs after
/// resolution.
#[derive(Debug, Clone, Copy)]
pub struct SymRecord {
    pub ty: WasmSymbolType,
    pub element_index: u32,
    pub flags: SymbolFlags,
}

impl SymRecord {
    fn from_wasm(rec: &WasmSymbol) -> Self {
        SymRecord { ty: rec.ty, element_index: rec.element_index, flags: rec.flags }
    }
}

/// A linker symbol. `file` is `None` for synthetic symbols injected by the
/// driver.
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    pub file: Option<usize>,
    pub rec: Option<SymRecord>,
    /// Archive member cookie, meaningful only while `kind` is `Lazy`.
    pub archive_offset: usize,
    output_index: u32,
    output_index_set: bool,
}

impl Symbol {
    fn new(name: &str) -> Self {
        Symbol {
            name: name.to_string(),
            kind: SymbolKind::UndefinedFunction,
            file: None,
            rec: None,
            archive_offset: 0,
            output_index: 0,
            output_index_set: false,
        }
    }

    pub fn is_defined(&self) -> bool {
        matches!(self.kind, SymbolKind::DefinedFunction | SymbolKind::DefinedGlobal)
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self.kind, SymbolKind::UndefinedFunction | SymbolKind::UndefinedGlobal)
    }

    pub fn is_lazy(&self) -> bool {
        self.kind == SymbolKind::Lazy
    }

    pub fn is_function(&self) -> bool {
        matches!(self.kind, SymbolKind::DefinedFunction | SymbolKind::UndefinedFunction)
    }

    /// Weakness comes from the underlying wasm record; synthetic symbols are
    /// never weak.
    pub fn is_weak(&self) -> bool {
        self.rec
            .map(|r| r.flags.contains(SymbolFlags::BINDING_WEAK))
            .unwrap_or(false)
    }

    pub fn has_output_index(&self) -> bool {
        self.output_index_set
    }

    pub fn output_index(&self) -> u32 {
        assert!(self.output_index_set, "output index not assigned: {}", self.name);
        self.output_index
    }

    /// Output indices are assigned exactly once.
    pub fn set_output_index(&mut self, index: u32) {
        assert!(!self.output_index_set, "output index already assigned: {}", self.name);
        self.output_index = index;
        self.output_index_set = true;
    }

    fn update(&mut self, kind: SymbolKind, file: Option<usize>, rec: Option<SymRecord>) {
        self.kind = kind;
        self.file = file;
        self.rec = rec;
    }

    /// File-space function index of a defined function (the export's index).
    pub fn function_index(&self, files: &[InputFile]) -> Result<u32, String> {
        self.export_index(files)
    }

    /// File-space global index of a defined global (the export's index).
    pub fn global_index(&self, files: &[InputFile]) -> Result<u32, String> {
        self.export_index(files)
    }

    fn export_index(&self, files: &[InputFile]) -> Result<u32, String> {
        let (file, rec) = self.require_record()?;
        let obj = files[file].object();
        obj.wasm
            .exports
            .get(rec.element_index as usize)
            .map(|e| e.index)
            .ok_or_else(|| format!("{}: export record out of range", obj.name))
    }

    /// Type index of an undefined function (the import's signature index).
    pub fn function_type_index(&self, files: &[InputFile]) -> Result<u32, String> {
        let (file, rec) = self.require_record()?;
        files[file].object().import_signature(rec.element_index)
    }

    fn require_record(&self) -> Result<(usize, SymRecord), String> {
        match (self.file, self.rec) {
            (Some(file), Some(rec)) => Ok((file, rec)),
            _ => Err(format!("no object record for symbol: {}", self.name)),
        }
    }
}

/// Insertion-ordered name → symbol mapping with the resolution rules.
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    map: FxHashMap<String, usize>,
    /// File ids of parsed objects, in the order they joined the link.
    pub object_files: Vec<usize>,
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable {
            symbols: Vec::new(),
            map: FxHashMap::default(),
            object_files: Vec::new(),
        }
    }

    pub fn symbol(&self, id: usize) -> &Symbol {
        &self.symbols[id]
    }

    pub fn symbol_mut(&mut self, id: usize) -> &mut Symbol {
        &mut self.symbols[id]
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.map.get(name).copied()
    }

    /// Look up or create the symbol slot for `name`.
    pub fn insert(&mut self, name: &str) -> (usize, bool) {
        match self.map.get(name) {
            Some(&id) => (id, false),
            None => {
                let id = self.symbols.len();
                self.symbols.push(Symbol::new(name));
                self.map.insert(name.to_string(), id);
                (id, true)
            }
        }
    }

    /// Add an input file: parse its symbols into the table, pulling in
    /// archive members as lazy symbols resolve. Objects are appended to the
    /// object list.
    pub fn add_file(
        &mut self,
        files: &mut Vec<InputFile>,
        diag: &mut Diagnostics,
        file_id: usize,
    ) -> Result<(), String> {
        diag.log(&format!("processing {}", files[file_id].display_name()));
        match &files[file_id] {
            InputFile::Object(_) => {
                self.parse_object_symbols(files, diag, file_id)?;
                self.object_files.push(file_id);
            }
            InputFile::Archive(archive) => {
                let entries: Vec<(String, usize)> = archive
                    .index
                    .symbols
                    .iter()
                    .map(|s| (s.name.clone(), s.member_offset))
                    .collect();
                for (name, member_offset) in entries {
                    self.add_lazy(files, diag, file_id, &name, member_offset)?;
                }
            }
        }
        Ok(())
    }

    fn parse_object_symbols(
        &mut self,
        files: &mut Vec<InputFile>,
        diag: &mut Diagnostics,
        file_id: usize,
    ) -> Result<(), String> {
        let records = files[file_id].object().wasm.symbols.clone();
        let mut function_imports = Vec::new();
        let mut global_imports = Vec::new();
        let mut symbols = Vec::new();

        for rec in &records {
            match rec.ty {
                WasmSymbolType::FunctionImport => {
                    let id = self.add_undefined(files, diag, file_id, rec)?;
                    function_imports.push(id);
                    symbols.push(id);
                }
                WasmSymbolType::GlobalImport => {
                    let id = self.add_undefined(files, diag, file_id, rec)?;
                    global_imports.push(id);
                    symbols.push(id);
                }
                WasmSymbolType::FunctionExport | WasmSymbolType::GlobalExport => {
                    let id = self.add_defined(files, diag, file_id, rec)?;
                    symbols.push(id);
                }
                WasmSymbolType::DebugFunctionName => {}
            }
        }

        let obj = files[file_id].object_mut();
        obj.function_imports = function_imports;
        obj.global_imports = global_imports;
        obj.symbols = symbols;
        Ok(())
    }

    /// Record a definition from `file_id`. Resolution against an existing
    /// entry: undefined and lazy entries are replaced; between definitions,
    /// a weak newcomer yields, a weak incumbent is replaced, and two strong
    /// definitions conflict.
    pub fn add_defined(
        &mut self,
        files: &mut Vec<InputFile>,
        diag: &mut Diagnostics,
        file_id: usize,
        rec: &WasmSymbol,
    ) -> Result<usize, String> {
        let kind = if rec.ty == WasmSymbolType::GlobalExport {
            SymbolKind::DefinedGlobal
        } else {
            SymbolKind::DefinedFunction
        };
        let (id, was_inserted) = self.insert(&rec.name);
        if was_inserted {
            self.symbols[id].update(kind, Some(file_id), Some(SymRecord::from_wasm(rec)));
            return Ok(id);
        }

        if !self.symbols[id].is_defined() {
            // The existing entry is undefined or lazy; the definition
            // replaces it.
            self.check_symbol_types(files, diag, id, file_id, rec)?;
            self.symbols[id].update(kind, Some(file_id), Some(SymRecord::from_wasm(rec)));
        } else if rec.is_weak() {
            // The new definition is weak; keep the existing one.
        } else if self.symbols[id].is_weak() {
            self.symbols[id].update(kind, Some(file_id), Some(SymRecord::from_wasm(rec)));
        } else {
            self.report_duplicate(files, diag, id, file_id);
        }
        Ok(id)
    }

    /// Record an undefined reference from `file_id`. An existing lazy entry
    /// triggers the archive member load; an existing definition satisfies
    /// the reference after a type check.
    pub fn add_undefined(
        &mut self,
        files: &mut Vec<InputFile>,
        diag: &mut Diagnostics,
        file_id: usize,
        rec: &WasmSymbol,
    ) -> Result<usize, String> {
        let kind = if rec.ty == WasmSymbolType::GlobalImport {
            SymbolKind::UndefinedGlobal
        } else {
            SymbolKind::UndefinedFunction
        };
        let (id, was_inserted) = self.insert(&rec.name);
        if was_inserted {
            self.symbols[id].update(kind, Some(file_id), Some(SymRecord::from_wasm(rec)));
            return Ok(id);
        }

        if self.symbols[id].is_lazy() {
            let archive_id = self.symbols[id]
                .file
                .ok_or_else(|| format!("lazy symbol without archive: {}", rec.name))?;
            let member_offset = self.symbols[id].archive_offset;
            self.load_archive_member(files, diag, archive_id, member_offset, &rec.name)?;
        } else if self.symbols[id].is_defined() {
            self.check_symbol_types(files, diag, id, file_id, rec)?;
        }
        Ok(id)
    }

    /// Synthetic defined global, injected by the driver.
    pub fn add_defined_global(&mut self, diag: &mut Diagnostics, name: &str) -> usize {
        let (id, was_inserted) = self.insert(name);
        if was_inserted {
            self.symbols[id].update(SymbolKind::DefinedGlobal, None, None);
        } else if self.symbols[id].is_function() {
            diag.error(&format!("symbol type mismatch: {}", name));
        }
        id
    }

    /// Synthetic undefined function, injected by the driver.
    pub fn add_undefined_function(&mut self, diag: &mut Diagnostics, name: &str) -> usize {
        let (id, was_inserted) = self.insert(name);
        if was_inserted {
            self.symbols[id].update(SymbolKind::UndefinedFunction, None, None);
        } else if !self.symbols[id].is_function() {
            diag.error(&format!("symbol type mismatch: {}", name));
        }
        id
    }

    /// Record that `name` can be loaded from a member of `archive_id`. An
    /// existing undefined reference pulls the member in immediately.
    pub fn add_lazy(
        &mut self,
        files: &mut Vec<InputFile>,
        diag: &mut Diagnostics,
        archive_id: usize,
        name: &str,
        member_offset: usize,
    ) -> Result<(), String> {
        let (id, was_inserted) = self.insert(name);
        if was_inserted {
            self.symbols[id].update(SymbolKind::Lazy, Some(archive_id), None);
            self.symbols[id].archive_offset = member_offset;
        } else if self.symbols[id].is_undefined() {
            self.load_archive_member(files, diag, archive_id, member_offset, name)?;
        }
        Ok(())
    }

    /// Pull in the archive member at `member_offset` and feed it through the
    /// symbol table. Each member is loaded at most once.
    fn load_archive_member(
        &mut self,
        files: &mut Vec<InputFile>,
        diag: &mut Diagnostics,
        archive_id: usize,
        member_offset: usize,
        sym_name: &str,
    ) -> Result<(), String> {
        let (member_name, bytes, parent_name) = {
            let archive = match &mut files[archive_id] {
                InputFile::Archive(a) => a,
                InputFile::Object(o) => {
                    return Err(format!("lazy symbol in non-archive file: {}", o.name))
                }
            };
            if !archive.seen.insert(member_offset) {
                return Ok(());
            }
            let member = archive.index.member_at(member_offset).ok_or_else(|| {
                format!("{}: no archive member for symbol {}", archive.name, sym_name)
            })?;
            (
                member.name.clone(),
                archive.data[member.offset..member.offset + member.size].to_vec(),
                archive.name.clone(),
            )
        };

        if bytes.len() < 4 || bytes[0..4] != WASM_MAGIC {
            diag.error(&format!("unknown file type: {}({})", parent_name, member_name));
            return Ok(());
        }

        let wasm = reader::parse_object(&bytes, &member_name)?;
        let mut obj = ObjectFile::new(member_name, wasm);
        obj.parent_name = Some(parent_name);
        let new_id = files.len();
        files.push(InputFile::Object(obj));
        diag.log(&format!("loaded {} for {}", files[new_id].display_name(), sym_name));
        self.add_file(files, diag, new_id)
    }

    /// A name may not be defined as both a function and a global across
    /// files. Lazy incumbents are exempt.
    fn check_symbol_types(
        &mut self,
        files: &[InputFile],
        diag: &mut Diagnostics,
        existing_id: usize,
        new_file_id: usize,
        rec: &WasmSymbol,
    ) -> Result<(), String> {
        let existing = &self.symbols[existing_id];
        if existing.is_lazy() {
            return Ok(());
        }
        if existing.is_function() != rec.is_function() {
            diag.error(&format!("symbol type mismatch: {}", rec.name));
            let existing_side = match existing.file {
                Some(f) => files[f].display_name(),
                None => "(internal)".to_string(),
            };
            let existing_family = if existing.is_function() { "Function" } else { "Global" };
            diag.error(&format!("{}: {}", existing_side, existing_family));
            let new_family = if rec.is_function() { "Function" } else { "Global" };
            return Err(format!("{}: {}", files[new_file_id].display_name(), new_family));
        }
        Ok(())
    }

    fn report_duplicate(
        &mut self,
        files: &[InputFile],
        diag: &mut Diagnostics,
        existing_id: usize,
        new_file_id: usize,
    ) {
        let existing = &self.symbols[existing_id];
        let existing_side = match existing.file {
            Some(f) => files[f].display_name(),
            None => "(internal)".to_string(),
        };
        diag.error(&format!(
            "duplicate symbol: {} in {} and in {}",
            existing.name,
            existing_side,
            files[new_file_id].display_name()
        ));
    }

    /// Gather every undefined symbol not in the allowed set; if any exist,
    /// warn per referencing object and fail the link.
    pub fn report_remaining_undefines(
        &self,
        files: &[InputFile],
        config: &Config,
        diag: &mut Diagnostics,
    ) -> Result<(), String> {
        let mut undefs: FxHashSet<usize> = FxHashSet::default();
        for (id, sym) in self.symbols.iter().enumerate() {
            if sym.is_undefined() && !config.allow_undefined_symbols.contains(&sym.name) {
                undefs.insert(id);
            }
        }
        if undefs.is_empty() {
            return Ok(());
        }

        for &file_id in &self.object_files {
            let obj = files[file_id].object();
            for &sym_id in &obj.symbols {
                if undefs.contains(&sym_id) {
                    diag.warn(&format!(
                        "{}: undefined symbol: {}",
                        obj.display_name(),
                        self.symbols[sym_id].name
                    ));
                }
            }
        }
        for (id, sym) in self.symbols.iter().enumerate() {
            if undefs.contains(&id) && sym.file.is_none() {
                diag.warn(&format!("undefined symbol: {}", sym.name));
            }
        }

        Err("link failed".to_string())
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}
