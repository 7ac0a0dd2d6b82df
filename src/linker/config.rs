//! Process-wide linker configuration.
//!
//! Created at link entry, populated by the CLI layer, and passed by
//! reference down the pipeline. Lives for exactly one link invocation.

use crate::wasm::types::{WasmGlobal, WASM_PAGE_SIZE};
use fxhash::FxHashSet;

/// Linker configuration. Field meanings follow the recognized CLI surface:
/// `-o`, `--entry`, `--allow-undefined`, `--emit-relocs`, `--relocatable`,
/// `--strip-all`, `--strip-debug`, `--initial-memory`, `--max-memory`,
/// `-z stack-size`, `-L`, `--sysroot`, `--verbose`, `--color-diagnostics`.
#[derive(Debug)]
pub struct Config {
    pub output_file: String,
    /// Entry symbol name; defaults to `_start` for executable output.
    pub entry: String,
    /// Name the entry function is exported under. Defaults to the entry
    /// symbol name.
    pub export_entry_as: String,
    pub allow_undefined: bool,
    pub emit_relocs: bool,
    pub relocatable: bool,
    pub strip_all: bool,
    pub strip_debug: bool,
    pub verbose: bool,
    pub color_diagnostics: bool,
    pub search_paths: Vec<String>,
    pub sysroot: String,
    /// `--initial-memory` / `--max-memory` in pages. Accepted for
    /// compatibility; memory sizing is currently derived from layout.
    pub initial_memory: u32,
    pub max_memory: u32,
    /// Stack size in bytes (`-z stack-size=`), default one wasm page.
    pub z_stack_size: u32,
    pub allow_undefined_symbols: FxHashSet<String>,
    /// Globals injected by the driver (symbol id, initial record). The stack
    /// pointer, when present, is entry 0.
    pub synthetic_globals: Vec<(usize, WasmGlobal)>,
}

impl Config {
    pub fn new() -> Self {
        Config {
            output_file: String::new(),
            entry: String::new(),
            export_entry_as: String::new(),
            allow_undefined: false,
            emit_relocs: false,
            relocatable: false,
            strip_all: false,
            strip_debug: false,
            verbose: false,
            color_diagnostics: false,
            search_paths: Vec::new(),
            sysroot: String::new(),
            initial_memory: 0,
            max_memory: 0,
            z_stack_size: WASM_PAGE_SIZE,
            allow_undefined_symbols: FxHashSet::default(),
            synthetic_globals: Vec::new(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
