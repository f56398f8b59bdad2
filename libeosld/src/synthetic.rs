//! Linker-synthesized startup functions.
//!
//! All bodies are emitted directly as wasm bytecode and installed into the
//! synthetic function entities; the code section copies them out verbatim.
//! Index assignment must have completed before anything here runs, because
//! the emitted `call` instructions encode absolute function indices.

use crate::args::Args;
use crate::diagnostics::Diagnostics;
use crate::error::Result;
use crate::input_data::InitFunction;
use crate::input_data::ObjectFile;
use crate::layout::OutputSegment;
use crate::symbol::SymbolKind;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolId;
use eosld_utils::wasm::opcode;
use eosld_utils::wasm::write_sleb128;
use eosld_utils::wasm::write_uleb128;
use eosld_utils::wasm::Signature;

/// Wraps a finished body in its ULEB128 size prefix and installs it.
pub fn create_function(db: &mut SymbolDb, id: SymbolId, content: Vec<u8>) {
    let mut body = Vec::with_capacity(content.len() + 4);
    write_uleb128(&mut body, content.len() as u64);
    body.extend_from_slice(&content);
    db.set_function_body(id, body);
}

fn emit_call(out: &mut Vec<u8>, index: u32) {
    out.push(opcode::CALL);
    write_uleb128(out, u64::from(index));
}

/// `__wasm_init_memory`: copies every passive segment except `.tdata` into
/// place and drops it.
pub fn create_init_memory_function(db: &mut SymbolDb, segments: &[OutputSegment]) {
    let Some(id) = db.well_known.init_memory else {
        return;
    };
    let mut os = Vec::new();
    write_uleb128(&mut os, 0); // no locals

    for seg in segments {
        if seg.is_passive() && seg.name != ".tdata" {
            os.push(opcode::I32_CONST);
            write_sleb128(&mut os, seg.start_va as i64);
            os.push(opcode::I32_CONST);
            write_sleb128(&mut os, 0);
            os.push(opcode::I32_CONST);
            write_sleb128(&mut os, seg.size as i64);
            os.push(opcode::MISC_PREFIX);
            write_uleb128(&mut os, u64::from(opcode::MEMORY_INIT));
            write_uleb128(&mut os, u64::from(seg.index));
            os.push(0); // memory index
            os.push(opcode::MISC_PREFIX);
            write_uleb128(&mut os, u64::from(opcode::DATA_DROP));
            write_uleb128(&mut os, u64::from(seg.index));
        }
    }
    os.push(opcode::END);
    create_function(db, id, os);
}

/// `__wasm_apply_relocs`: for PIC output, applies data relocations at
/// startup, before any constructor runs. Each input segment contributes its
/// own application code.
pub fn create_apply_relocations_function(
    db: &mut SymbolDb,
    objects: &[ObjectFile],
    segments: &[OutputSegment],
) {
    let Some(id) = db.well_known.apply_relocs else {
        return;
    };
    let mut os = Vec::new();
    write_uleb128(&mut os, 0);
    for seg in segments {
        for &(file, index) in &seg.inputs {
            objects[file].segments[index].emit_relocation_code(&mut os, seg.start_va);
        }
    }
    os.push(opcode::END);
    create_function(db, id, os);
}

/// `__wasm_call_ctors`: memory/reloc initialization followed by every init
/// function in priority order.
pub fn create_call_ctors_function(
    db: &mut SymbolDb,
    args: &Args,
    init_functions: &[InitFunction],
) -> Result {
    let Some(id) = db.well_known.call_ctors else {
        return Ok(());
    };
    if !db.symbol(id).is_live() {
        return Ok(());
    }

    let mut os = Vec::new();
    write_uleb128(&mut os, 0);

    if args.passive_segments {
        if let Some(init_memory) = db.well_known.init_memory {
            emit_call(&mut os, db.symbol(init_memory).function_index()?);
        }
    }
    if args.is_pic {
        if let Some(apply_relocs) = db.well_known.apply_relocs {
            emit_call(&mut os, db.symbol(apply_relocs).function_index()?);
        }
    }
    for init in init_functions {
        emit_call(&mut os, db.symbol(init.symbol).function_index()?);
    }
    os.push(opcode::END);
    create_function(db, id, os);
    Ok(())
}

/// `__wasm_init_tls`: local 0 is the destination pointer; publishes it as
/// `__tls_base` and copies the `.tdata` template there.
pub fn create_init_tls_function(db: &mut SymbolDb, segments: &[OutputSegment]) -> Result {
    let Some(id) = db.well_known.init_tls else {
        return Ok(());
    };
    if !db.symbol(id).is_live() {
        return Ok(());
    }

    let tls_seg = segments.iter().find(|seg| seg.name == ".tdata");

    let mut os = Vec::new();
    write_uleb128(&mut os, 0);
    if let Some(seg) = tls_seg {
        let Some(tls_base) = db.well_known.tls_base else {
            anyhow::bail!("internal error: __wasm_init_tls synthesized without __tls_base");
        };
        os.push(opcode::LOCAL_GET);
        write_uleb128(&mut os, 0);
        os.push(opcode::GLOBAL_SET);
        write_uleb128(&mut os, u64::from(db.symbol(tls_base).global_index()?));

        os.push(opcode::LOCAL_GET);
        write_uleb128(&mut os, 0);
        os.push(opcode::I32_CONST);
        write_sleb128(&mut os, 0);
        os.push(opcode::I32_CONST);
        write_sleb128(&mut os, seg.size as i64);
        os.push(opcode::MISC_PREFIX);
        write_uleb128(&mut os, u64::from(opcode::MEMORY_INIT));
        write_uleb128(&mut os, u64::from(seg.index));
        os.push(0);
    }
    os.push(opcode::END);
    create_function(db, id, os);
    Ok(())
}

/// Collects init functions from every object's linking metadata, in
/// discovery order, then stable-sorts by ascending priority so that ties
/// keep their discovery order.
pub fn calculate_init_functions(
    args: &Args,
    diagnostics: &Diagnostics,
    db: &SymbolDb,
    objects: &[ObjectFile],
) -> Vec<InitFunction> {
    if !args.relocatable {
        let live = db
            .well_known
            .call_ctors
            .is_some_and(|id| db.symbol(id).is_live());
        if !live {
            return Vec::new();
        }
    }

    let mut init_functions = Vec::new();
    for obj in objects {
        for init in &obj.init_functions {
            let symbol = db.symbol(init.symbol);
            if !symbol.is_live() {
                continue;
            }
            if let SymbolKind::DefinedFunction { func, .. } = symbol.kind {
                if *db.function_signature(objects, func) != Signature::default() {
                    diagnostics.error(format!("invalid signature for init func: {}", symbol.name));
                }
            }
            init_functions.push(*init);
        }
    }

    init_functions.sort_by_key(|init| init.priority);
    init_functions
}
