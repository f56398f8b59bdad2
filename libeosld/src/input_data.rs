//! The input-object model the writer consumes.
//!
//! Parsing lives upstream; what arrives here is already decoded into plain
//! data. Objects refer to symbols through [`SymbolId`] handles assigned when
//! the symbol table was built, and the segment planner later records each
//! input segment's placement directly on the segment.

use crate::alignment::Alignment;
use crate::symbol_db::SymbolId;
use eosld_utils::wasm::opcode;
use eosld_utils::wasm::reloc;
use eosld_utils::wasm::write_sleb128;
use eosld_utils::wasm::write_uleb128;
use eosld_utils::wasm::Signature;
use smallvec::SmallVec;

/// A relocation carried by an input chunk. For `R_WASM_TYPE_INDEX_LEB` the
/// index names an entry of the owning object's type table; for every other
/// kind it is an index into the owning object's symbol list.
#[derive(Debug, Clone, Copy)]
pub struct Relocation {
    pub ty: u8,
    pub offset: u64,
    pub index: u32,
    pub addend: i64,
}

#[derive(Debug)]
pub struct InputSegment {
    pub name: String,
    pub alignment: Alignment,
    pub live: bool,
    pub data: Vec<u8>,
    /// Most chunks carry only a handful of relocations.
    pub relocations: SmallVec<[Relocation; 4]>,

    /// Assigned by the segment planner.
    pub output_segment: Option<u32>,
    pub output_offset: u64,
}

impl InputSegment {
    pub fn new(name: impl Into<String>, alignment: Alignment, data: Vec<u8>) -> InputSegment {
        InputSegment {
            name: name.into(),
            alignment,
            live: true,
            data,
            relocations: SmallVec::new(),
            output_segment: None,
            output_offset: 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Emits startup code that applies this segment's relocations in place.
    /// Only reached for PIC output. Relocation *values* are resolved
    /// upstream and arrive via the addend, so each entry becomes a plain
    /// store to the relocated address.
    pub fn emit_relocation_code(&self, out: &mut Vec<u8>, segment_va: u64) {
        for r in &self.relocations {
            let address = segment_va + self.output_offset + r.offset;
            out.push(opcode::I32_CONST);
            write_sleb128(out, address as i64);
            out.push(opcode::I32_CONST);
            write_sleb128(out, r.addend);
            out.push(opcode::I32_STORE);
            write_uleb128(out, 2); // align=4
            write_uleb128(out, 0); // offset=0
        }
    }
}

/// A function defined by an input object. `body` is the complete code-entry
/// byte string, including its own ULEB128 size prefix, with relocations
/// already applied.
#[derive(Debug)]
pub struct InputFunction {
    pub name: String,
    /// Index into the owning object's type table.
    pub type_index: u32,
    pub body: Vec<u8>,
    pub relocations: SmallVec<[Relocation; 4]>,
    pub index: Option<u32>,
}

impl InputFunction {
    pub fn new(name: impl Into<String>, type_index: u32, body: Vec<u8>) -> InputFunction {
        InputFunction {
            name: name.into(),
            type_index,
            body,
            relocations: SmallVec::new(),
            index: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum InitExpr {
    I32Const(i32),
    I64Const(i64),
}

impl InitExpr {
    pub fn encode(&self, out: &mut Vec<u8>) {
        match *self {
            InitExpr::I32Const(v) => {
                out.push(opcode::I32_CONST);
                write_sleb128(out, i64::from(v));
            }
            InitExpr::I64Const(v) => {
                out.push(opcode::I64_CONST);
                write_sleb128(out, v);
            }
        }
        out.push(opcode::END);
    }
}

#[derive(Debug)]
pub struct InputGlobal {
    pub ty: crate::symbol::GlobalType,
    pub init: InitExpr,
    pub index: Option<u32>,
}

#[derive(Debug)]
pub struct InputEvent {
    pub attribute: u32,
    /// Index into the owning object's type table.
    pub type_index: u32,
    pub index: Option<u32>,
}

#[derive(Debug)]
pub struct InputCustomSection {
    pub name: String,
    pub data: Vec<u8>,
    pub relocations: SmallVec<[Relocation; 4]>,
}

/// One `WASM_INIT_FUNCS` entry from an object's linking metadata.
#[derive(Debug, Clone, Copy)]
pub struct InitFunction {
    pub priority: u32,
    pub symbol: SymbolId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeaturePolicy {
    Used,
    Required,
    Disallowed,
}

#[derive(Debug, Clone)]
pub struct FeatureEntry {
    pub policy: FeaturePolicy,
    pub name: String,
}

#[derive(Debug, Default)]
pub struct ProducerInfo {
    pub languages: Vec<(String, String)>,
    pub processed_by: Vec<(String, String)>,
    pub sdks: Vec<(String, String)>,
}

#[derive(Default)]
pub struct ObjectFile {
    pub name: String,
    pub types: Vec<Signature>,
    /// Which type-table entries relocations actually reference; populated by
    /// the relocation scan.
    pub type_is_used: Vec<bool>,
    /// Object type index -> output type index, filled in by type
    /// calculation.
    pub type_map: Vec<Option<u32>>,
    pub segments: Vec<InputSegment>,
    pub functions: Vec<InputFunction>,
    pub globals: Vec<InputGlobal>,
    pub events: Vec<InputEvent>,
    pub custom_sections: Vec<InputCustomSection>,
    pub target_features: Vec<FeatureEntry>,
    pub init_functions: Vec<InitFunction>,
    pub producers: ProducerInfo,
    /// Object-local symbol index -> symbol table id.
    pub symbols: Vec<SymbolId>,
    /// Raw ABI JSON blob, empty when the object carries none.
    pub abi: String,
    /// Declared actions, `action_name:handler_symbol`.
    pub actions: Vec<String>,
    /// Declared notification handlers, `code::action_name:handler_symbol`.
    pub notify: Vec<String>,
    /// Declared sync-call entries, `call_name:handler_symbol`.
    pub sync_calls: Vec<String>,
}

impl ObjectFile {
    pub fn new(name: impl Into<String>) -> ObjectFile {
        ObjectFile {
            name: name.into(),
            ..ObjectFile::default()
        }
    }

    /// Registers a signature in the object's type table and returns its
    /// object-local index.
    pub fn add_type(&mut self, signature: Signature) -> u32 {
        let index = self.types.len() as u32;
        self.types.push(signature);
        self.type_is_used.push(false);
        self.type_map.push(None);
        index
    }

    /// Marks a type as referenced by relocations; used by tests and by the
    /// relocation scan.
    pub fn mark_type_used(&mut self, index: u32) {
        self.type_is_used[index as usize] = true;
    }

    /// Count of relocations attached to any function body.
    pub fn num_code_relocations(&self) -> usize {
        self.functions.iter().map(|f| f.relocations.len()).sum()
    }

    /// Count of relocations attached to any live data segment.
    pub fn num_data_relocations(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| s.live)
            .map(|s| s.relocations.len())
            .sum()
    }
}

/// Builds a minimal valid function body: no locals, `end`. Handy for tests
/// and for objects whose code arrives pre-encoded elsewhere.
pub fn trivial_function_body() -> Vec<u8> {
    let mut content = Vec::new();
    write_uleb128(&mut content, 0); // no locals
    content.push(opcode::END);
    let mut body = Vec::new();
    write_uleb128(&mut body, content.len() as u64);
    body.extend_from_slice(&content);
    body
}

/// True when the relocation kind consumes a table slot for its target
/// function.
pub fn is_table_index_reloc(ty: u8) -> bool {
    matches!(
        ty,
        reloc::R_WASM_TABLE_INDEX_SLEB | reloc::R_WASM_TABLE_INDEX_I32
    )
}
