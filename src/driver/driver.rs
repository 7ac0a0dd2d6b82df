//! Link pipeline orchestration.
//!
//! In order: parse arguments, inject the synthetic entry/stack-pointer
//! symbols for executable output, load inputs in argument order (resolving
//! `-l` against the search paths), feed everything through the symbol
//! table, check for remaining undefines, and hand off to the writer.

use std::io::Write;

use crate::common::error::Diagnostics;
use crate::driver::cli::{self, InputItem};
use crate::linker::config::Config;
use crate::linker::input::{ArchiveFile, InputFile, ObjectFile};
use crate::linker::symbols::SymbolTable;
use crate::linker::writer;
use crate::wasm::archive::{parse_archive, ARCHIVE_MAGIC};
use crate::wasm::reader;
use crate::wasm::types::{WasmGlobal, WasmInitExpr};
use wasm_encoder::ValType;

/// Link entry point. Returns true iff no errors were recorded.
pub fn link(args: &[String], error_sink: &mut dyn Write) -> bool {
    let mut diag = Diagnostics::new(error_sink);
    let mut config = Config::new();
    match run_link(args, &mut config, &mut diag) {
        Ok(()) => !diag.has_errors(),
        Err(msg) => {
            diag.fatal(&msg);
            false
        }
    }
}

fn run_link(
    args: &[String],
    config: &mut Config,
    diag: &mut Diagnostics,
) -> Result<(), String> {
    let inputs = match cli::parse_args(args, config, diag)? {
        Some(inputs) => inputs,
        None => return Ok(()),
    };

    let mut symtab = SymbolTable::new();
    let mut files: Vec<InputFile> = Vec::new();

    add_synthetic_symbols(config, &mut symtab, diag);

    for item in &inputs {
        match item {
            InputItem::File(path) => add_file(&mut files, path, diag)?,
            InputItem::Library(name) => match cli::search_library(name, config) {
                Some(path) => add_file(&mut files, &path, diag)?,
                None => diag.error(&format!("unable to find library -l{}", name)),
            },
        }
    }
    if diag.has_errors() {
        return Ok(());
    }

    // Feed every input through the symbol table. Archive members pulled in
    // along the way are appended past the initial inputs and processed
    // inside the lazy resolution itself.
    let initial_count = files.len();
    for file_id in 0..initial_count {
        symtab.add_file(&mut files, diag, file_id)?;
    }

    if !config.allow_undefined && !config.relocatable {
        symtab.report_remaining_undefines(&files, config, diag)?;
    }
    if diag.has_errors() {
        return Ok(());
    }

    writer::write_result(config, &mut symtab, &mut files, diag)
}

/// For executable output, inject the undefined entry function and the
/// `__stack_pointer` global. The stack pointer's initializer is patched to
/// `stack_top` during memory layout.
pub fn add_synthetic_symbols(
    config: &mut Config,
    symtab: &mut SymbolTable,
    diag: &mut Diagnostics,
) {
    if config.relocatable {
        return;
    }
    if config.entry.is_empty() {
        config.entry = "_start".to_string();
    }
    if config.export_entry_as.is_empty() {
        config.export_entry_as = config.entry.clone();
    }

    let entry = config.entry.clone();
    diag.log(&format!("injecting undefined func: {}", entry));
    symtab.add_undefined_function(diag, &entry);

    diag.log("injecting global: __stack_pointer");
    let sym_id = symtab.add_defined_global(diag, "__stack_pointer");
    symtab
        .symbol_mut(sym_id)
        .set_output_index(config.synthetic_globals.len() as u32);
    config.synthetic_globals.push((
        sym_id,
        WasmGlobal {
            ty: ValType::I32,
            mutable: true,
            init: WasmInitExpr::I32Const(0),
        },
    ));
}

/// Load one input path, detecting archives by magic. Read failures are
/// recoverable errors; malformed contents are fatal.
fn add_file(
    files: &mut Vec<InputFile>,
    path: &str,
    diag: &mut Diagnostics,
) -> Result<(), String> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) => {
            diag.error(&format!("cannot open {}: {}", path, e));
            return Ok(());
        }
    };

    if data.len() >= ARCHIVE_MAGIC.len() && &data[..ARCHIVE_MAGIC.len()] == ARCHIVE_MAGIC {
        let index = parse_archive(&data, path)?;
        files.push(InputFile::Archive(ArchiveFile::new(path.to_string(), data, index)));
    } else {
        let wasm = reader::parse_object(&data, path)?;
        files.push(InputFile::Object(ObjectFile::new(path.to_string(), wasm)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{build_archive, ObjectBuilder, TempDir};
    use crate::wasm::reader::parse_object;
    use crate::wasm::types::{WasmSymbolType, WASM_PAGE_SIZE};
    use wasm_encoder::ExportKind;

    fn start_object() -> Vec<u8> {
        ObjectBuilder::new()
            .sig(&[], None)
            .function(0, "_start", &[])
            .build()
    }

    fn run(dir: &TempDir, args: &[&str]) -> (bool, String) {
        let mut full: Vec<String> = vec!["wasmld".to_string()];
        full.extend(args.iter().map(|s| s.to_string()));
        full.push("-o".to_string());
        full.push(dir.path().join("a.out").to_string_lossy().into_owned());
        let mut sink = Vec::new();
        let ok = link(&full, &mut sink);
        (ok, String::from_utf8(sink).unwrap())
    }

    fn output(dir: &TempDir) -> Vec<u8> {
        std::fs::read(dir.path().join("a.out")).unwrap()
    }

    #[test]
    fn test_link_executable_from_files() {
        let dir = TempDir::new("wasmld_drv_exe");
        let main = dir.write("main.o", &start_object());

        let (ok, errs) = run(&dir, &[main.to_str().unwrap()]);
        assert!(ok, "{}", errs);

        let module = parse_object(&output(&dir), "a.out").unwrap();
        assert!(module
            .exports
            .iter()
            .any(|e| e.name == "memory" && e.kind == ExportKind::Memory));
        assert!(module.exports.iter().any(|e| e.name == "_start"));
        assert_eq!(module.memories[0].initial, 2);
    }

    #[test]
    fn test_missing_input_is_error_not_crash() {
        let dir = TempDir::new("wasmld_drv_missing");
        let (ok, errs) = run(&dir, &["nonexistent.o"]);
        assert!(!ok);
        assert!(errs.contains("cannot open nonexistent.o"), "{}", errs);
    }

    #[test]
    fn test_duplicate_symbol_fails_link() {
        let dir = TempDir::new("wasmld_drv_dup");
        let a = dir.write("a.o", &start_object());
        let b = dir.write("b.o", &start_object());

        let (ok, errs) = run(&dir, &[a.to_str().unwrap(), b.to_str().unwrap()]);
        assert!(!ok);
        assert!(errs.contains("duplicate symbol: _start"), "{}", errs);
    }

    #[test]
    fn test_undefined_symbol_fails_with_per_site_warning() {
        let dir = TempDir::new("wasmld_drv_undef");
        let main = dir.write(
            "main.o",
            &ObjectBuilder::new()
                .sig(&[], None)
                .import_function("bar", 0)
                .function_calling(0, "_start", 0)
                .build(),
        );

        let (ok, errs) = run(&dir, &[main.to_str().unwrap()]);
        assert!(!ok);
        assert!(errs.contains("undefined symbol: bar"), "{}", errs);
        assert!(errs.contains("link failed"), "{}", errs);
    }

    #[test]
    fn test_allow_undefined_flag() {
        let dir = TempDir::new("wasmld_drv_allow");
        let main = dir.write(
            "main.o",
            &ObjectBuilder::new()
                .sig(&[], None)
                .import_function("bar", 0)
                .function_calling(0, "_start", 0)
                .build(),
        );

        let (ok, errs) = run(&dir, &["--allow-undefined", main.to_str().unwrap()]);
        assert!(ok, "{}", errs);
        let module = parse_object(&output(&dir), "a.out").unwrap();
        assert!(module.imports.iter().any(|i| i.field == "bar"));
    }

    #[test]
    fn test_archive_pull_in_both_orders() {
        let dir = TempDir::new("wasmld_drv_ar");
        let bar_def = ObjectBuilder::new()
            .sig(&[], None)
            .function(0, "bar", &[])
            .build();
        let main = dir.write(
            "main.o",
            &ObjectBuilder::new()
                .sig(&[], None)
                .import_function("bar", 0)
                .function_calling(0, "_start", 0)
                .build(),
        );
        let lib = dir.write("libx.a", &build_archive(&[("x.o", bar_def, vec!["bar"])]));

        let (ok, errs) = run(&dir, &[main.to_str().unwrap(), lib.to_str().unwrap()]);
        assert!(ok, "{}", errs);
        let module = parse_object(&output(&dir), "a.out").unwrap();
        assert!(module.imports.is_empty());
        assert_eq!(module.functions.len(), 2);

        // Reverse order: lazy first, then the undefined reference loads it.
        let (ok, errs) = run(&dir, &[lib.to_str().unwrap(), main.to_str().unwrap()]);
        assert!(ok, "{}", errs);
        let module = parse_object(&output(&dir), "a.out").unwrap();
        assert!(module.imports.is_empty());
    }

    #[test]
    fn test_library_via_dash_l() {
        let dir = TempDir::new("wasmld_drv_l");
        let bar_def = ObjectBuilder::new()
            .sig(&[], None)
            .function(0, "bar", &[])
            .build();
        dir.write("libx.a", &build_archive(&[("x.o", bar_def, vec!["bar"])]));
        let main = dir.write(
            "main.o",
            &ObjectBuilder::new()
                .sig(&[], None)
                .import_function("bar", 0)
                .function_calling(0, "_start", 0)
                .build(),
        );

        let (ok, errs) = run(
            &dir,
            &[
                main.to_str().unwrap(),
                "-L",
                dir.path().to_str().unwrap(),
                "-lx",
            ],
        );
        assert!(ok, "{}", errs);

        let (ok, errs) = run(&dir, &[main.to_str().unwrap(), "-lmissing"]);
        assert!(!ok);
        assert!(errs.contains("unable to find library -lmissing"), "{}", errs);
    }

    #[test]
    fn test_relocatable_link_is_idempotent() {
        let dir = TempDir::new("wasmld_drv_idem");
        let input = dir.write(
            "in.o",
            &ObjectBuilder::new()
                .sig(&[], None)
                .import_function("ext", 0)
                .function_calling(0, "caller", 0)
                .build(),
        );

        let (ok, errs) = run(&dir, &["--relocatable", input.to_str().unwrap()]);
        assert!(ok, "{}", errs);
        let first = output(&dir);

        let relinked = dir.write("first.wasm", &first);
        let (ok, errs) = run(&dir, &["--relocatable", relinked.to_str().unwrap()]);
        assert!(ok, "{}", errs);

        // Index offsets are zero on the second pass, so everything except
        // the always-present memory section survives unchanged.
        let m1 = parse_object(&first, "first").unwrap();
        let m2 = parse_object(&output(&dir), "second").unwrap();
        assert_eq!(m1.types, m2.types);
        assert_eq!(m1.functions, m2.functions);
        assert_eq!(m2.imports.len(), 1);
        assert_eq!(m2.imports[0].field, "ext");
        assert_eq!(m1.exports.len(), m2.exports.len());
        let c1 = m1.code_section.as_ref().unwrap();
        let c2 = m2.code_section.as_ref().unwrap();
        assert_eq!(c1.content, c2.content);
        assert_eq!(c1.relocations.len(), c2.relocations.len());
        for (a, b) in c1.relocations.iter().zip(c2.relocations.iter()) {
            assert_eq!((a.ty, a.offset, a.index), (b.ty, b.offset, b.index));
        }
    }

    #[test]
    fn test_strip_all_removes_names() {
        let dir = TempDir::new("wasmld_drv_strip");
        let main = dir.write("main.o", &start_object());

        let (ok, errs) = run(&dir, &["--strip-all", main.to_str().unwrap()]);
        assert!(ok, "{}", errs);
        let module = parse_object(&output(&dir), "a.out").unwrap();
        assert!(module
            .symbols
            .iter()
            .all(|s| s.ty != WasmSymbolType::DebugFunctionName));
    }

    #[test]
    fn test_custom_entry_name() {
        let dir = TempDir::new("wasmld_drv_entry");
        let main = dir.write(
            "main.o",
            &ObjectBuilder::new().sig(&[], None).function(0, "begin", &[]).build(),
        );

        let (ok, errs) = run(&dir, &["--entry", "begin", main.to_str().unwrap()]);
        assert!(ok, "{}", errs);
        let module = parse_object(&output(&dir), "a.out").unwrap();
        assert!(module.exports.iter().any(|e| e.name == "begin"));
    }

    #[test]
    fn test_stack_size_flag() {
        let dir = TempDir::new("wasmld_drv_stack");
        let main = dir.write("main.o", &start_object());

        let (ok, errs) = run(
            &dir,
            &["-z", "stack-size=262144", main.to_str().unwrap()],
        );
        assert!(ok, "{}", errs);
        let module = parse_object(&output(&dir), "a.out").unwrap();
        assert_eq!(module.memories[0].initial, 1 + 262144 / WASM_PAGE_SIZE);
    }

    #[test]
    fn test_output_replaces_existing_file() {
        let dir = TempDir::new("wasmld_drv_replace");
        std::fs::write(dir.path().join("a.out"), b"stale").unwrap();
        let main = dir.write("main.o", &start_object());

        let (ok, errs) = run(&dir, &[main.to_str().unwrap()]);
        assert!(ok, "{}", errs);
        assert_ne!(output(&dir), b"stale");
    }

    #[test]
    fn test_version_flag_short_circuits() {
        let mut sink = Vec::new();
        let ok = link(
            &["wasmld".to_string(), "--version".to_string()],
            &mut sink,
        );
        assert!(ok);
    }
}
