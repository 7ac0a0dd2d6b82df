//! The link pipeline: configuration, the symbol table and its resolution
//! rules, the input file model, relocation application, and the output
//! writer.

pub mod config;
pub mod input;
pub mod reloc;
pub mod symbols;
pub mod writer;
