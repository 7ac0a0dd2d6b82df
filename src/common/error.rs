//! Diagnostic infrastructure for the linker.
//!
//! Three severities drive the link pipeline:
//! - `warn`: reported, link continues, does not set the error flag.
//! - `error`: reported, increments the error count; the writer is skipped
//!   once any error has been recorded.
//! - fatal: modeled as `Err(String)` propagated with `?` up to `link()`,
//!   which reports it and aborts the link.
//!
//! Messages are rendered to the caller-supplied diagnostic sink with
//! optional ANSI severity coloring.

use std::io::Write;

/// How `--color-diagnostics` was requested on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    /// Resolve `auto` against the terminal capability of stderr.
    pub fn resolve(self) -> bool {
        use std::io::IsTerminal;
        match self {
            ColorMode::Always => true,
            ColorMode::Never => false,
            ColorMode::Auto => std::io::stderr().is_terminal(),
        }
    }
}

/// Collects and renders linker diagnostics.
///
/// Threaded by mutable reference through the driver, symbol table, and
/// writer. The error count gates the writer: once it is non-zero the driver
/// stops before emission.
pub struct Diagnostics<'a> {
    sink: &'a mut dyn Write,
    error_count: usize,
    pub color: bool,
    pub verbose: bool,
}

impl<'a> Diagnostics<'a> {
    pub fn new(sink: &'a mut dyn Write) -> Self {
        Diagnostics { sink, error_count: 0, color: false, verbose: false }
    }

    /// Report a warning. Does not affect the error count.
    pub fn warn(&mut self, msg: &str) {
        self.render("warning", "\x1b[1;35m", msg);
    }

    /// Report an error and record it. The link continues, but the writer
    /// will not run.
    pub fn error(&mut self, msg: &str) {
        self.render("error", "\x1b[1;31m", msg);
        self.error_count += 1;
    }

    /// Render a fatal message. Callers return `Err` alongside to unwind the
    /// pipeline; `link()` uses this for the final report.
    pub fn fatal(&mut self, msg: &str) {
        self.render("error", "\x1b[1;31m", msg);
        self.error_count += 1;
    }

    /// Verbose-only trace line.
    pub fn log(&mut self, msg: &str) {
        if self.verbose {
            let _ = writeln!(self.sink, "wasmld: {}", msg);
        }
    }

    pub fn has_errors(&self) -> bool {
        self.error_count > 0
    }

    pub fn error_count(&self) -> usize {
        self.error_count
    }

    fn render(&mut self, severity: &str, color: &str, msg: &str) {
        let result = if self.color {
            writeln!(self.sink, "wasmld: {}{}:\x1b[0m {}", color, severity, msg)
        } else {
            writeln!(self.sink, "wasmld: {}: {}", severity, msg)
        };
        let _ = result;
    }
}
