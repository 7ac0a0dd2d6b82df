//! Linker-side view of a relocatable wasm object.
//!
//! The structures here are what the link pipeline operates on: the section
//! lists a `WasmObject` exposes, the symbol records synthesized from its
//! import/export/name sections, and the relocation entries of its `reloc.*`
//! sections. Scalar value types and export kinds are the `wasm_encoder`
//! types; symbol flags are `wasmparser`'s. Index spaces (type, function,
//! global, table, memory, element) are separate dense numberings per kind.

use wasm_encoder::{ConstExpr, ExportKind, ValType};
use wasmparser::SymbolFlags;

pub const WASM_MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6d];
pub const WASM_VERSION: u32 = 1;
pub const WASM_PAGE_SIZE: u32 = 65536;

// ── Custom section subsection ids ────────────────────────────────────────────

/// "name" section: function-names subsection.
pub const WASM_NAMES_FUNCTION: u8 = 1;
/// "linking" section: symbol info subsection (`(name, flags)` pairs).
pub const WASM_SYMBOL_INFO: u8 = 2;

// ── Relocation types ─────────────────────────────────────────────────────────
//
// The numbering of the object format's `reloc.*` entries; kept as named
// constants because these records are produced and consumed outside the
// standard sections.

pub const R_WEBASSEMBLY_FUNCTION_INDEX_LEB: u32 = 0;
pub const R_WEBASSEMBLY_TABLE_INDEX_SLEB: u32 = 1;
pub const R_WEBASSEMBLY_TABLE_INDEX_I32: u32 = 2;
pub const R_WEBASSEMBLY_GLOBAL_ADDR_LEB: u32 = 3;
pub const R_WEBASSEMBLY_GLOBAL_ADDR_SLEB: u32 = 4;
pub const R_WEBASSEMBLY_GLOBAL_ADDR_I32: u32 = 5;
pub const R_WEBASSEMBLY_TYPE_INDEX_LEB: u32 = 6;
pub const R_WEBASSEMBLY_GLOBAL_INDEX_LEB: u32 = 7;

/// Whether a relocation type carries an explicit addend in `reloc.*`
/// sections.
pub fn reloc_has_addend(ty: u32) -> bool {
    matches!(
        ty,
        R_WEBASSEMBLY_GLOBAL_ADDR_LEB
            | R_WEBASSEMBLY_GLOBAL_ADDR_SLEB
            | R_WEBASSEMBLY_GLOBAL_ADDR_I32
    )
}

// ── Parsed-module structures ─────────────────────────────────────────────────

/// A function signature: parameter types and at most one result type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WasmSignature {
    pub param_types: Vec<ValType>,
    /// `None` encodes a void result.
    pub return_type: Option<ValType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WasmLimits {
    pub initial: u32,
    pub maximum: Option<u32>,
}

/// A funcref table; element types are validated at parse time.
#[derive(Debug, Clone, Copy)]
pub struct WasmTable {
    pub limits: WasmLimits,
}

/// A constant initializer expression. Anything else in an init position is a
/// fatal format error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WasmInitExpr {
    I32Const(i32),
    I64Const(i64),
    GetGlobal(u32),
}

impl WasmInitExpr {
    /// The i32 literal value, for positions that require one (segment
    /// offsets, data layout).
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            WasmInitExpr::I32Const(v) => Some(*v),
            _ => None,
        }
    }

    pub fn to_const_expr(&self) -> ConstExpr {
        match self {
            WasmInitExpr::I32Const(v) => ConstExpr::i32_const(*v),
            WasmInitExpr::I64Const(v) => ConstExpr::i64_const(*v),
            WasmInitExpr::GetGlobal(g) => ConstExpr::global_get(*g),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WasmGlobal {
    pub ty: ValType,
    pub mutable: bool,
    pub init: WasmInitExpr,
}

#[derive(Debug, Clone)]
pub enum WasmImportKind {
    Function { sig_index: u32 },
    Global { ty: ValType, mutable: bool },
}

#[derive(Debug, Clone)]
pub struct WasmImport {
    pub module: String,
    pub field: String,
    pub kind: WasmImportKind,
}

#[derive(Debug, Clone)]
pub struct WasmExport {
    pub name: String,
    pub kind: ExportKind,
    pub index: u32,
}

#[derive(Debug, Clone)]
pub struct WasmElemSegment {
    pub table_index: u32,
    pub offset: WasmInitExpr,
    pub functions: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct WasmDataSegment {
    pub index: u32,
    pub offset: WasmInitExpr,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct WasmRelocation {
    pub ty: u32,
    pub offset: u32,
    pub index: u32,
    pub addend: u32,
}

/// A raw section payload together with the relocations that apply to it.
#[derive(Debug, Clone, Default)]
pub struct WasmRelocatableSection {
    pub content: Vec<u8>,
    pub relocations: Vec<WasmRelocation>,
}

// ── Symbol records ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WasmSymbolType {
    FunctionImport,
    GlobalImport,
    FunctionExport,
    GlobalExport,
    /// A function name from the "name" custom section; not a linkage symbol.
    DebugFunctionName,
}

/// A symbol record synthesized from an object's import/export/name sections.
#[derive(Debug, Clone)]
pub struct WasmSymbol {
    pub name: String,
    pub ty: WasmSymbolType,
    /// Index into the imports array (import symbols), the exports array
    /// (export symbols), or the function index space (debug names).
    pub element_index: u32,
    pub flags: SymbolFlags,
}

impl WasmSymbol {
    pub fn is_weak(&self) -> bool {
        self.flags.contains(SymbolFlags::BINDING_WEAK)
    }

    pub fn is_function(&self) -> bool {
        matches!(
            self.ty,
            WasmSymbolType::FunctionImport | WasmSymbolType::FunctionExport
        )
    }
}

// ── Parsed module view ───────────────────────────────────────────────────────

/// A parsed relocatable wasm object.
#[derive(Debug, Clone, Default)]
pub struct WasmObject {
    pub types: Vec<WasmSignature>,
    pub imports: Vec<WasmImport>,
    /// Type indices of locally defined functions, in function order.
    pub functions: Vec<u32>,
    pub tables: Vec<WasmTable>,
    pub memories: Vec<WasmLimits>,
    pub globals: Vec<WasmGlobal>,
    pub exports: Vec<WasmExport>,
    pub elements: Vec<WasmElemSegment>,
    pub data_segments: Vec<WasmDataSegment>,
    /// Raw code section payload (including the leading function-count LEB)
    /// plus its relocation list, if a code section is present.
    pub code_section: Option<WasmRelocatableSection>,
    /// Raw data section payload plus its relocation list, if present.
    pub data_section: Option<WasmRelocatableSection>,
    /// Symbol records in section order: imports, exports, debug names.
    pub symbols: Vec<WasmSymbol>,
}

impl WasmObject {
    pub fn num_function_imports(&self) -> u32 {
        self.imports
            .iter()
            .filter(|i| matches!(i.kind, WasmImportKind::Function { .. }))
            .count() as u32
    }

    pub fn num_global_imports(&self) -> u32 {
        self.imports
            .iter()
            .filter(|i| matches!(i.kind, WasmImportKind::Global { .. }))
            .count() as u32
    }
}
