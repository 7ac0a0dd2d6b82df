//! Input file model.
//!
//! An input is either a parsed wasm object or an archive of such objects.
//! Each object records its per-space base offsets into the output module and
//! provides the index relocation helpers used when patching code payloads
//! and emitting `reloc.CODE`.

use crate::wasm::archive::ArchiveIndex;
use crate::wasm::types::{WasmImportKind, WasmInitExpr, WasmObject};
use fxhash::FxHashSet;

use super::symbols::SymbolTable;

/// A parsed wasm object participating in the link.
pub struct ObjectFile {
    pub name: String,
    /// Name of the archive this member was pulled from, if any.
    pub parent_name: Option<String>,
    pub wasm: WasmObject,

    // Per-space base offsets into the output module, set by the writer.
    pub type_index_offset: u32,
    pub function_index_offset: u32,
    pub global_index_offset: u32,
    /// Byte offset of this object's code within the output code section
    /// contents.
    pub code_section_offset: u32,
    /// Linear-memory address where this object's static data begins.
    pub data_offset: u32,

    /// Symbols for this object's function imports, in import order.
    pub function_imports: Vec<usize>,
    /// Symbols for this object's global imports, in import order.
    pub global_imports: Vec<usize>,
    /// Every linkage symbol this object contributed, in record order.
    pub symbols: Vec<usize>,
}

impl ObjectFile {
    pub fn new(name: String, wasm: WasmObject) -> Self {
        ObjectFile {
            name,
            parent_name: None,
            wasm,
            type_index_offset: 0,
            function_index_offset: 0,
            global_index_offset: 0,
            code_section_offset: 0,
            data_offset: 0,
            function_imports: Vec::new(),
            global_imports: Vec::new(),
            symbols: Vec::new(),
        }
    }

    /// Display name, qualified by the parent archive when pulled from one.
    pub fn display_name(&self) -> String {
        match &self.parent_name {
            Some(parent) => format!("{}({})", parent, self.name),
            None => self.name.clone(),
        }
    }

    pub fn num_function_imports(&self) -> u32 {
        self.wasm.num_function_imports()
    }

    pub fn num_global_imports(&self) -> u32 {
        self.wasm.num_global_imports()
    }

    /// Whether a file-space function index refers to one of this object's
    /// imports.
    pub fn is_imported_function(&self, index: u32) -> bool {
        index < self.num_function_imports()
    }

    /// Whether a file-space function index refers to an import that was
    /// resolved to a definition elsewhere in the link.
    pub fn is_resolved_function_import(&self, symtab: &SymbolTable, index: u32) -> bool {
        self.is_imported_function(index)
            && symtab.symbol(self.function_imports[index as usize]).is_defined()
    }

    // ── Index relocation ─────────────────────────────────────────────────────
    //
    // File-space indices include the file's own imports; output indices are
    // dense over the merged module. The per-space offsets are computed with
    // the file's own import count subtracted, so adding a file-space index
    // lands on the dense output slot; the intermediate value can wrap.

    pub fn relocate_type_index(&self, index: u32) -> u32 {
        self.type_index_offset + index
    }

    pub fn relocate_function_index(&self, symtab: &SymbolTable, index: u32) -> u32 {
        if self.is_imported_function(index) {
            symtab.symbol(self.function_imports[index as usize]).output_index()
        } else {
            self.function_index_offset.wrapping_add(index)
        }
    }

    pub fn relocate_global_index(&self, symtab: &SymbolTable, index: u32) -> u32 {
        if index < self.num_global_imports() {
            symtab.symbol(self.global_imports[index as usize]).output_index()
        } else {
            self.global_index_offset.wrapping_add(index)
        }
    }

    /// Single merged table; segment offsets are always zero.
    pub fn relocate_table_index(&self, index: u32) -> u32 {
        index
    }

    pub fn relocate_code_offset(&self, offset: u32) -> u32 {
        self.code_section_offset + offset
    }

    /// Linear-memory address of the data symbol behind a file-space global
    /// index: the owning object's data base plus the global's constant
    /// initializer.
    pub fn get_global_address(
        &self,
        symtab: &SymbolTable,
        files: &[InputFile],
        index: u32,
    ) -> Result<u32, String> {
        let num_imports = self.num_global_imports();
        if index < num_imports {
            let sym = symtab.symbol(self.global_imports[index as usize]);
            if !sym.is_defined() {
                return Err(format!(
                    "cannot compute address of undefined symbol: {}",
                    sym.name
                ));
            }
            let file_id = sym.file.ok_or_else(|| {
                format!("cannot compute address of synthetic symbol: {}", sym.name)
            })?;
            let obj = files[file_id].object();
            let global_index = sym.global_index(files)?;
            obj.local_global_address(global_index)
        } else {
            self.local_global_address(index)
        }
    }

    fn local_global_address(&self, index: u32) -> Result<u32, String> {
        let local = index
            .checked_sub(self.num_global_imports())
            .and_then(|i| self.wasm.globals.get(i as usize))
            .ok_or_else(|| format!("{}: global index out of range: {}", self.name, index))?;
        match local.init {
            WasmInitExpr::I32Const(v) => Ok(self.data_offset.wrapping_add(v as u32)),
            _ => Err(format!(
                "{}: global has non-constant address initializer",
                self.name
            )),
        }
    }

    /// Signature index of a file-space function import, for the IMPORT
    /// section.
    pub fn import_signature(&self, import_element: u32) -> Result<u32, String> {
        match self.wasm.imports.get(import_element as usize).map(|i| &i.kind) {
            Some(WasmImportKind::Function { sig_index }) => Ok(*sig_index),
            _ => Err(format!(
                "{}: import record {} is not a function",
                self.name, import_element
            )),
        }
    }
}

/// An archive of wasm objects, pulled in lazily via its symbol index.
pub struct ArchiveFile {
    pub name: String,
    pub data: Vec<u8>,
    pub index: ArchiveIndex,
    /// Member header offsets already loaded; each member is pulled in at
    /// most once.
    pub seen: FxHashSet<usize>,
}

impl ArchiveFile {
    pub fn new(name: String, data: Vec<u8>, index: ArchiveIndex) -> Self {
        ArchiveFile { name, data, index, seen: FxHashSet::default() }
    }
}

/// An input file participating in the link.
pub enum InputFile {
    Object(ObjectFile),
    Archive(ArchiveFile),
}

impl InputFile {
    pub fn name(&self) -> &str {
        match self {
            InputFile::Object(o) => &o.name,
            InputFile::Archive(a) => &a.name,
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            InputFile::Object(o) => o.display_name(),
            InputFile::Archive(a) => a.name.clone(),
        }
    }

    /// The object view; panics on archives. Callers only reach this for
    /// file ids recorded in the object list.
    pub fn object(&self) -> &ObjectFile {
        match self {
            InputFile::Object(o) => o,
            InputFile::Archive(a) => {
                panic!("input file is not an object: {}", a.name)
            }
        }
    }

    pub fn object_mut(&mut self) -> &mut ObjectFile {
        match self {
            InputFile::Object(o) => o,
            InputFile::Archive(a) => {
                panic!("input file is not an object: {}", a.name)
            }
        }
    }
}
