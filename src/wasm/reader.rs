//! Relocatable wasm object parser.
//!
//! Built on `wasmparser`: the standard sections come from its payload
//! readers and the "name" section from `NameSectionReader`. The two
//! linker-metadata custom sections the object format carries (`linking`
//! symbol info and `reloc.*`) predate the parser's own linking support, so
//! their payloads are walked with `BinaryReader`. Symbol records are
//! synthesized in section order: one per function/global import, one per
//! function/global export, then one per debug function name.

use wasm_encoder::{ExportKind, SectionId, ValType};
use wasmparser::{
    BinaryReader, DataKind, ElementItems, ElementKind, ExternalKind, Name, NameSectionReader,
    Operator, Parser, Payload, SymbolFlags, TypeRef, WasmFeatures,
};

use super::types::*;

fn err(name: &str, msg: impl std::fmt::Display) -> String {
    format!("{}: {}", name, msg)
}

/// Restrict a parsed value type to the four scalar types the object format
/// carries.
fn scalar_val_type(name: &str, ty: wasmparser::ValType) -> Result<ValType, String> {
    match ty {
        wasmparser::ValType::I32 => Ok(ValType::I32),
        wasmparser::ValType::I64 => Ok(ValType::I64),
        wasmparser::ValType::F32 => Ok(ValType::F32),
        wasmparser::ValType::F64 => Ok(ValType::F64),
        other => Err(err(name, format!("invalid value type: {:?}", other))),
    }
}

/// A constant initializer expression; anything else is a fatal format
/// error.
fn parse_init_expr(name: &str, expr: &wasmparser::ConstExpr) -> Result<WasmInitExpr, String> {
    let mut ops = expr.get_operators_reader();
    let init = match ops.read().map_err(|e| err(name, e))? {
        Operator::I32Const { value } => WasmInitExpr::I32Const(value),
        Operator::I64Const { value } => WasmInitExpr::I64Const(value),
        Operator::GlobalGet { global_index } => WasmInitExpr::GetGlobal(global_index),
        other => return Err(err(name, format!("unknown opcode in init expr: {:?}", other))),
    };
    match ops.read().map_err(|e| err(name, e))? {
        Operator::End => Ok(init),
        _ => Err(err(name, "init expr not terminated")),
    }
}

/// Parse a relocatable wasm object file.
pub fn parse_object(data: &[u8], source_name: &str) -> Result<WasmObject, String> {
    let mut obj = WasmObject::default();
    let mut import_symbols: Vec<WasmSymbol> = Vec::new();
    let mut export_symbols: Vec<WasmSymbol> = Vec::new();
    let mut name_symbols: Vec<WasmSymbol> = Vec::new();
    let mut symbol_flags: Vec<(String, SymbolFlags)> = Vec::new();

    for payload in Parser::new(0).parse_all(data) {
        match payload.map_err(|e| err(source_name, e))? {
            Payload::Version { num, .. } => {
                if num as u32 != WASM_VERSION {
                    return Err(err(
                        source_name,
                        format!("unknown wasm version: {}", num),
                    ));
                }
            }
            Payload::TypeSection(reader) => {
                for ty in reader.into_iter_err_on_gc_types() {
                    let func = ty.map_err(|e| err(source_name, e))?;
                    let param_types = func
                        .params()
                        .iter()
                        .map(|&p| scalar_val_type(source_name, p))
                        .collect::<Result<Vec<_>, _>>()?;
                    let return_type = match func.results() {
                        [] => None,
                        [single] => Some(scalar_val_type(source_name, *single)?),
                        _ => return Err(err(source_name, "multiple results not supported")),
                    };
                    obj.types.push(WasmSignature { param_types, return_type });
                }
            }
            Payload::ImportSection(reader) => {
                for (i, import) in reader.into_iter().enumerate() {
                    let import = import.map_err(|e| err(source_name, e))?;
                    let kind = match import.ty {
                        TypeRef::Func(sig_index) => {
                            import_symbols.push(WasmSymbol {
                                name: import.name.to_string(),
                                ty: WasmSymbolType::FunctionImport,
                                element_index: i as u32,
                                flags: SymbolFlags::empty(),
                            });
                            WasmImportKind::Function { sig_index }
                        }
                        TypeRef::Global(global) => {
                            import_symbols.push(WasmSymbol {
                                name: import.name.to_string(),
                                ty: WasmSymbolType::GlobalImport,
                                element_index: i as u32,
                                flags: SymbolFlags::empty(),
                            });
                            WasmImportKind::Global {
                                ty: scalar_val_type(source_name, global.content_type)?,
                                mutable: global.mutable,
                            }
                        }
                        other => {
                            return Err(err(
                                source_name,
                                format!("unsupported import kind: {:?}", other),
                            ))
                        }
                    };
                    obj.imports.push(WasmImport {
                        module: import.module.to_string(),
                        field: import.name.to_string(),
                        kind,
                    });
                }
            }
            Payload::FunctionSection(reader) => {
                for sig in reader {
                    obj.functions.push(sig.map_err(|e| err(source_name, e))?);
                }
            }
            Payload::TableSection(reader) => {
                for table in reader {
                    let table = table.map_err(|e| err(source_name, e))?;
                    if table.ty.element_type != wasmparser::RefType::FUNCREF {
                        return Err(err(source_name, "invalid table element type"));
                    }
                    obj.tables.push(WasmTable {
                        limits: WasmLimits {
                            initial: table.ty.initial as u32,
                            maximum: table.ty.maximum.map(|m| m as u32),
                        },
                    });
                }
            }
            Payload::MemorySection(reader) => {
                for memory in reader {
                    let memory = memory.map_err(|e| err(source_name, e))?;
                    obj.memories.push(WasmLimits {
                        initial: memory.initial as u32,
                        maximum: memory.maximum.map(|m| m as u32),
                    });
                }
            }
            Payload::GlobalSection(reader) => {
                for global in reader {
                    let global = global.map_err(|e| err(source_name, e))?;
                    obj.globals.push(WasmGlobal {
                        ty: scalar_val_type(source_name, global.ty.content_type)?,
                        mutable: global.ty.mutable,
                        init: parse_init_expr(source_name, &global.init_expr)?,
                    });
                }
            }
            Payload::ExportSection(reader) => {
                for (i, export) in reader.into_iter().enumerate() {
                    let export = export.map_err(|e| err(source_name, e))?;
                    let kind = match export.kind {
                        ExternalKind::Func => {
                            export_symbols.push(WasmSymbol {
                                name: export.name.to_string(),
                                ty: WasmSymbolType::FunctionExport,
                                element_index: i as u32,
                                flags: SymbolFlags::empty(),
                            });
                            ExportKind::Func
                        }
                        ExternalKind::Global => {
                            export_symbols.push(WasmSymbol {
                                name: export.name.to_string(),
                                ty: WasmSymbolType::GlobalExport,
                                element_index: i as u32,
                                flags: SymbolFlags::empty(),
                            });
                            ExportKind::Global
                        }
                        ExternalKind::Table => ExportKind::Table,
                        ExternalKind::Memory => ExportKind::Memory,
                        other => {
                            return Err(err(
                                source_name,
                                format!("unsupported export kind: {:?}", other),
                            ))
                        }
                    };
                    obj.exports.push(WasmExport {
                        name: export.name.to_string(),
                        kind,
                        index: export.index,
                    });
                }
            }
            Payload::ElementSection(reader) => {
                for element in reader {
                    let element = element.map_err(|e| err(source_name, e))?;
                    let (table_index, offset_expr) = match element.kind {
                        ElementKind::Active { table_index, offset_expr } => {
                            (table_index.unwrap_or(0), offset_expr)
                        }
                        _ => return Err(err(source_name, "unsupported element segment")),
                    };
                    let functions = match element.items {
                        ElementItems::Functions(items) => items
                            .into_iter()
                            .collect::<Result<Vec<u32>, _>>()
                            .map_err(|e| err(source_name, e))?,
                        ElementItems::Expressions(..) => {
                            return Err(err(source_name, "unsupported element segment"))
                        }
                    };
                    obj.elements.push(WasmElemSegment {
                        table_index,
                        offset: parse_init_expr(source_name, &offset_expr)?,
                        functions,
                    });
                }
            }
            Payload::DataSection(reader) => {
                let range = reader.range();
                obj.data_section = Some(WasmRelocatableSection {
                    content: data[range.start..range.end].to_vec(),
                    relocations: Vec::new(),
                });
                for segment in reader {
                    let segment = segment.map_err(|e| err(source_name, e))?;
                    let (index, offset_expr) = match segment.kind {
                        DataKind::Active { memory_index, offset_expr } => {
                            (memory_index, offset_expr)
                        }
                        DataKind::Passive => {
                            return Err(err(source_name, "unsupported data segment"))
                        }
                    };
                    obj.data_segments.push(WasmDataSegment {
                        index,
                        offset: parse_init_expr(source_name, &offset_expr)?,
                        content: segment.data.to_vec(),
                    });
                }
            }
            Payload::CodeSectionStart { range, .. } => {
                obj.code_section = Some(WasmRelocatableSection {
                    content: data[range.start..range.end].to_vec(),
                    relocations: Vec::new(),
                });
            }
            Payload::CodeSectionEntry(_) => {}
            Payload::CustomSection(custom) => match custom.name() {
                "reloc.CODE" | "reloc.DATA" => {
                    let relocs = read_relocations(source_name, custom.data())?;
                    let target = if custom.name() == "reloc.CODE" {
                        &mut obj.code_section
                    } else {
                        &mut obj.data_section
                    };
                    match target {
                        Some(section) => section.relocations = relocs,
                        None => {
                            return Err(err(
                                source_name,
                                format!("{} without target section", custom.name()),
                            ))
                        }
                    }
                }
                "name" => {
                    let reader = NameSectionReader::new(BinaryReader::new(
                        custom.data(),
                        custom.data_offset(),
                        WasmFeatures::default(),
                    ));
                    for subsection in reader {
                        let subsection = subsection.map_err(|e| err(source_name, e))?;
                        if let Name::Function(names) = subsection {
                            for naming in names {
                                let naming = naming.map_err(|e| err(source_name, e))?;
                                name_symbols.push(WasmSymbol {
                                    name: naming.name.to_string(),
                                    ty: WasmSymbolType::DebugFunctionName,
                                    element_index: naming.index,
                                    flags: SymbolFlags::empty(),
                                });
                            }
                        }
                    }
                }
                "linking" => read_linking_section(source_name, custom.data(), &mut symbol_flags)?,
                _ => {}
            },
            Payload::StartSection { .. } | Payload::End(_) => {}
            _ => {}
        }
    }

    obj.symbols.extend(import_symbols);
    obj.symbols.extend(export_symbols);
    obj.symbols.extend(name_symbols);

    // Apply "linking" symbol flags by name.
    for (name, flags) in symbol_flags {
        for sym in obj.symbols.iter_mut().filter(|s| s.name == name) {
            sym.flags |= flags;
        }
    }

    Ok(obj)
}

/// Read a `reloc.*` payload: target section id, count, then entries.
fn read_relocations(source_name: &str, data: &[u8]) -> Result<Vec<WasmRelocation>, String> {
    let mut reader = BinaryReader::new(data, 0, WasmFeatures::default());
    let target = reader.read_var_u32().map_err(|e| err(source_name, e))?;
    if target != u8::from(SectionId::Code) as u32 && target != u8::from(SectionId::Data) as u32 {
        return Err(err(
            source_name,
            format!("invalid reloc target section: {}", target),
        ));
    }
    let count = reader.read_var_u32().map_err(|e| err(source_name, e))?;
    let mut relocs = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let ty = reader.read_var_u32().map_err(|e| err(source_name, e))?;
        if ty > R_WEBASSEMBLY_GLOBAL_INDEX_LEB {
            return Err(err(source_name, format!("unhandled relocation type: {}", ty)));
        }
        let offset = reader.read_var_u32().map_err(|e| err(source_name, e))?;
        let index = reader.read_var_u32().map_err(|e| err(source_name, e))?;
        let addend = if reloc_has_addend(ty) {
            reader.read_var_u32().map_err(|e| err(source_name, e))?
        } else {
            0
        };
        relocs.push(WasmRelocation { ty, offset, index, addend });
    }
    Ok(relocs)
}

/// Read the "linking" section's SYMBOL_INFO subsection: `(name, flags)`
/// pairs applied to matching symbols after parsing.
fn read_linking_section(
    source_name: &str,
    data: &[u8],
    out: &mut Vec<(String, SymbolFlags)>,
) -> Result<(), String> {
    let mut reader = BinaryReader::new(data, 0, WasmFeatures::default());
    while !reader.eof() {
        let subsection = reader.read_u8().map_err(|e| err(source_name, e))?;
        let size = reader.read_var_u32().map_err(|e| err(source_name, e))?;
        let payload = reader
            .read_bytes(size as usize)
            .map_err(|e| err(source_name, e))?;
        if subsection == WASM_SYMBOL_INFO {
            let mut payload = BinaryReader::new(payload, 0, WasmFeatures::default());
            let count = payload.read_var_u32().map_err(|e| err(source_name, e))?;
            for _ in 0..count {
                let name = payload.read_string().map_err(|e| err(source_name, e))?;
                let flags = payload.read_var_u32().map_err(|e| err(source_name, e))?;
                out.push((name.to_string(), SymbolFlags::from_bits_truncate(flags)));
            }
        }
    }
    Ok(())
}
