//! A static linker for WebAssembly object files.
//!
//! Given relocatable wasm objects (and `ar` archives of them), resolves
//! symbols across the inputs and emits a single module whose sections are a
//! consistent merge of the inputs, with cross-file references patched to the
//! merged index spaces. Output is either an executable module (synthesized
//! stack pointer, exported memory and entry function) or a relocatable
//! module that preserves and rewrites relocation metadata.

pub mod common;
pub mod driver;
pub mod linker;
pub mod wasm;

#[cfg(test)]
mod test_util;

pub use driver::driver::link;
