//! Code relocation application.
//!
//! Walks an object's code relocations and rewrites each referenced field in
//! a copy of the code payload. LEB fields are re-encoded at their original
//! 5-byte padded width so instruction lengths are preserved; the upstream
//! compiler only emits relocatable fields in that form.

use crate::common::error::Diagnostics;
use crate::linker::input::{InputFile, ObjectFile};
use crate::linker::symbols::SymbolTable;
use crate::wasm::encoder::{encode_sleb128_fixed, encode_uleb128_fixed};
use crate::wasm::types::*;

/// Width of a relocatable LEB field.
const RELOC_FIELD_SIZE: usize = 5;

/// Apply `obj`'s code relocations in place on `data` (a copy of its code
/// section payload).
pub fn apply_code_relocations(
    obj: &ObjectFile,
    symtab: &SymbolTable,
    files: &[InputFile],
    data: &mut [u8],
    diag: &mut Diagnostics,
) -> Result<(), String> {
    let relocations = match &obj.wasm.code_section {
        Some(code) => &code.relocations,
        None => return Ok(()),
    };

    for reloc in relocations {
        let new_value: i64 = match reloc.ty {
            R_WEBASSEMBLY_TYPE_INDEX_LEB => obj.relocate_type_index(reloc.index) as i64,
            R_WEBASSEMBLY_FUNCTION_INDEX_LEB => {
                obj.relocate_function_index(symtab, reloc.index) as i64
            }
            R_WEBASSEMBLY_TABLE_INDEX_I32 | R_WEBASSEMBLY_TABLE_INDEX_SLEB => {
                obj.relocate_table_index(reloc.index) as i64 + reloc.addend as i64
            }
            R_WEBASSEMBLY_GLOBAL_INDEX_LEB => {
                obj.relocate_global_index(symtab, reloc.index) as i64 + reloc.addend as i64
            }
            R_WEBASSEMBLY_GLOBAL_ADDR_LEB
            | R_WEBASSEMBLY_GLOBAL_ADDR_SLEB
            | R_WEBASSEMBLY_GLOBAL_ADDR_I32 => {
                let addr = obj
                    .get_global_address(symtab, files, reloc.index)
                    .map_err(|e| format!("{}: {}", obj.display_name(), e))?;
                addr as i64 + reloc.addend as i64
            }
            _ => {
                return Err(format!(
                    "{}: unhandled relocation type: {}",
                    obj.display_name(),
                    reloc.ty
                ))
            }
        };

        diag.log(&format!(
            "apply reloc type={} offset={:#x} new={}",
            reloc.ty, reloc.offset, new_value
        ));

        let offset = reloc.offset as usize;
        if offset + RELOC_FIELD_SIZE > data.len() {
            return Err(format!(
                "{}: relocation offset {:#x} out of bounds",
                obj.display_name(),
                reloc.offset
            ));
        }
        let field = &mut data[offset..offset + RELOC_FIELD_SIZE];

        match reloc.ty {
            R_WEBASSEMBLY_TYPE_INDEX_LEB
            | R_WEBASSEMBLY_FUNCTION_INDEX_LEB
            | R_WEBASSEMBLY_GLOBAL_ADDR_LEB
            | R_WEBASSEMBLY_GLOBAL_INDEX_LEB => {
                if new_value < 0 || new_value > u32::MAX as i64 {
                    return Err(format!(
                        "{}: relocated value out of unsigned range: {}",
                        obj.display_name(),
                        new_value
                    ));
                }
                encode_uleb128_fixed(new_value as u32, field);
            }
            R_WEBASSEMBLY_TABLE_INDEX_SLEB | R_WEBASSEMBLY_GLOBAL_ADDR_SLEB => {
                if new_value < i32::MIN as i64 || new_value > i32::MAX as i64 {
                    return Err(format!(
                        "{}: relocated value out of signed range: {}",
                        obj.display_name(),
                        new_value
                    ));
                }
                encode_sleb128_fixed(new_value as i32, field);
            }
            R_WEBASSEMBLY_TABLE_INDEX_I32 | R_WEBASSEMBLY_GLOBAL_ADDR_I32 => {
                return Err(format!(
                    "{}: i32 relocations are unimplemented",
                    obj.display_name()
                ));
            }
            _ => unreachable!(),
        }
    }

    Ok(())
}
