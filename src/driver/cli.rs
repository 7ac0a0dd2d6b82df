//! CLI argument parsing for the linker command line.
//!
//! Design: a simple `while` loop with a flat `match` on each argument. No
//! external parser library is used. Unknown options are fatal; query flags
//! (`--version`, `--help`) exit before any input is required. `-l` requests
//! are kept in argument order and resolved against the search paths after
//! the whole command line is parsed, so a later `-L` still applies.

use std::path::PathBuf;

use crate::common::error::{ColorMode, Diagnostics};
use crate::linker::config::Config;

/// An input request from the command line, in argument order.
#[derive(Debug)]
pub enum InputItem {
    /// A positional object or archive path.
    File(String),
    /// A `-l` library to resolve against the search paths.
    Library(String),
}

/// Parse the command line into `config`, returning the ordered input list.
/// `Ok(None)` means an early exit was handled (`--version`, `--help`, or an
/// unreadable `--allow-undefined-file`).
pub fn parse_args(
    args: &[String],
    config: &mut Config,
    diag: &mut Diagnostics,
) -> Result<Option<Vec<InputItem>>, String> {
    let mut inputs = Vec::new();
    let mut color = ColorMode::Auto;
    let mut print_version = false;
    let mut exit_after_version = false;

    let mut i = 1;
    while i < args.len() {
        let arg = args[i].as_str();
        match arg {
            "-o" => config.output_file = take_value(args, &mut i, "-o")?,
            "--entry" => config.entry = take_value(args, &mut i, "--entry")?,
            _ if arg.starts_with("--entry=") => {
                config.entry = arg["--entry=".len()..].to_string()
            }
            "-l" => inputs.push(InputItem::Library(take_value(args, &mut i, "-l")?)),
            _ if arg.starts_with("-l") => {
                inputs.push(InputItem::Library(arg[2..].to_string()))
            }
            "-L" => config.search_paths.push(take_value(args, &mut i, "-L")?),
            _ if arg.starts_with("-L") => {
                config.search_paths.push(arg[2..].to_string())
            }
            "--sysroot" => config.sysroot = take_value(args, &mut i, "--sysroot")?,
            _ if arg.starts_with("--sysroot=") => {
                config.sysroot = arg["--sysroot=".len()..].to_string()
            }
            "--allow-undefined" => config.allow_undefined = true,
            "--allow-undefined-file" => {
                let path = take_value(args, &mut i, "--allow-undefined-file")?;
                if !load_allow_undefined_file(&path, config, diag) {
                    return Ok(None);
                }
            }
            _ if arg.starts_with("--allow-undefined-file=") => {
                let path = arg["--allow-undefined-file=".len()..].to_string();
                if !load_allow_undefined_file(&path, config, diag) {
                    return Ok(None);
                }
            }
            "--emit-relocs" => config.emit_relocs = true,
            "--relocatable" => config.relocatable = true,
            "--strip-all" => config.strip_all = true,
            "--strip-debug" => config.strip_debug = true,
            "--verbose" => config.verbose = true,
            _ if arg.starts_with("--initial-memory=") => {
                config.initial_memory =
                    parse_integer("--initial-memory", &arg["--initial-memory=".len()..])?
            }
            _ if arg.starts_with("--max-memory=") => {
                config.max_memory =
                    parse_integer("--max-memory", &arg["--max-memory=".len()..])?
            }
            "-z" => {
                let value = take_value(args, &mut i, "-z")?;
                match value.strip_prefix("stack-size=") {
                    Some(size) => config.z_stack_size = parse_integer("stack-size", size)?,
                    None => return Err(format!("unknown -z value: {}", value)),
                }
            }
            "--color-diagnostics" => color = ColorMode::Always,
            "--no-color-diagnostics" => color = ColorMode::Never,
            _ if arg.starts_with("--color-diagnostics=") => {
                color = match &arg["--color-diagnostics=".len()..] {
                    "auto" => ColorMode::Auto,
                    "always" => ColorMode::Always,
                    "never" => ColorMode::Never,
                    other => {
                        return Err(format!("unknown option: --color-diagnostics={}", other))
                    }
                }
            }
            "--version" => {
                print_version = true;
                exit_after_version = true;
            }
            "-v" => print_version = true,
            "--help" => {
                print_help();
                return Ok(None);
            }
            "-mllvm" => {
                // Forwarded to underlying machinery; there is none here.
                let _ = take_value(args, &mut i, "-mllvm")?;
            }
            _ if arg.starts_with('-') => return Err(format!("unknown argument: {}", arg)),
            _ => inputs.push(InputItem::File(arg.to_string())),
        }
        i += 1;
    }

    config.color_diagnostics = color.resolve();
    diag.color = config.color_diagnostics;
    diag.verbose = config.verbose;

    if config.output_file.is_empty() {
        config.output_file = "a.out".to_string();
    }

    if print_version {
        println!("wasmld {}", env!("CARGO_PKG_VERSION"));
        if exit_after_version {
            return Ok(None);
        }
    }

    if inputs.is_empty() {
        return Err("no input files".to_string());
    }

    Ok(Some(inputs))
}

fn take_value(args: &[String], i: &mut usize, flag: &str) -> Result<String, String> {
    *i += 1;
    args.get(*i)
        .cloned()
        .ok_or_else(|| format!("{}: missing argument", flag))
}

fn parse_integer(flag: &str, value: &str) -> Result<u32, String> {
    value
        .parse()
        .map_err(|_| format!("{}: number expected, but got {}", flag, value))
}

/// Load a newline-separated symbol list into the allowed-undefined set.
/// Returns false (after reporting) if the file cannot be read.
fn load_allow_undefined_file(path: &str, config: &mut Config, diag: &mut Diagnostics) -> bool {
    match std::fs::read_to_string(path) {
        Ok(text) => {
            for line in text.lines() {
                if !line.is_empty() {
                    config.allow_undefined_symbols.insert(line.to_string());
                }
            }
            true
        }
        Err(e) => {
            diag.error(&format!("cannot open {}: {}", path, e));
            false
        }
    }
}

/// Find a file under `dir`, expanding a leading `=` against the sysroot.
fn find_file(dir: &str, file: &str, config: &Config) -> Option<String> {
    let base = match dir.strip_prefix('=') {
        Some(rest) => PathBuf::from(&config.sysroot).join(rest),
        None => PathBuf::from(dir),
    };
    let path = base.join(file);
    if path.exists() {
        Some(path.to_string_lossy().into_owned())
    } else {
        None
    }
}

fn find_from_search_paths(file: &str, config: &Config) -> Option<String> {
    config
        .search_paths
        .iter()
        .find_map(|dir| find_file(dir, file, config))
}

/// Resolve `-lname` to `lib<name>.a` over the search paths, or the exact
/// file when the name starts with `:`.
pub fn search_library(name: &str, config: &Config) -> Option<String> {
    if let Some(exact) = name.strip_prefix(':') {
        return find_from_search_paths(exact, config);
    }
    config
        .search_paths
        .iter()
        .find_map(|dir| find_file(dir, &format!("lib{}.a", name), config))
}

fn print_help() {
    println!("Usage: wasmld [options] file...");
    println!();
    println!("Options:");
    println!("  -o <path>                    output file (default a.out)");
    println!("  -l <name>                    link against library lib<name>.a");
    println!("  -L <dir>                     add a library search path");
    println!("  --sysroot <path>             sysroot for `=` search path prefixes");
    println!("  --entry <name>               entry symbol name (default _start)");
    println!("  --allow-undefined            allow undefined symbols");
    println!("  --allow-undefined-file <p>   newline-separated allowed undefines");
    println!("  --emit-relocs                keep relocations in the output");
    println!("  --relocatable                produce a relinkable object");
    println!("  --strip-all                  omit all debug sections");
    println!("  --strip-debug                omit the name section");
    println!("  --initial-memory=<pages>     initial memory size");
    println!("  --max-memory=<pages>         maximum memory size");
    println!("  -z stack-size=<bytes>        stack size (default one page)");
    println!("  --color-diagnostics[=mode]   auto, always, or never");
    println!("  --no-color-diagnostics       same as --color-diagnostics=never");
    println!("  --verbose                    trace link phases");
    println!("  --version, -v                print version");
    println!("  --help                       print this message");
}
