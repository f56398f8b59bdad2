//! Output sections and their binary encodings.
//!
//! The writer stages section contents in the structs below while the
//! pipeline runs, then flattens each into an [`OutputSection`] record: the
//! section id, the fully encoded body, and (after the finalize pass) the
//! file offset. Section kinds are closed-world here; there is no dynamic
//! dispatch, every encoder is a straight-line function over staged state.

use crate::args::Args;
use crate::error::Result;
use crate::input_data::InitFunction;
use crate::input_data::ObjectFile;
use crate::input_data::ProducerInfo;
use crate::layout::MemoryLayout;
use crate::layout::OutputSegment;
use crate::symbol::FuncRef;
use crate::symbol::GlobalRef;
use crate::symbol::SymbolKind;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolId;
use anyhow::bail;
use eosld_utils::wasm;
use eosld_utils::wasm::linking;
use eosld_utils::wasm::opcode;
use eosld_utils::wasm::section;
use eosld_utils::wasm::write_sleb128;
use eosld_utils::wasm::write_str;
use eosld_utils::wasm::write_uleb128;
use eosld_utils::wasm::Limits;
use eosld_utils::wasm::Signature;
use foldhash::HashMap as FoldHashMap;
use foldhash::HashMapExt as _;
use hashbrown::HashMap;
use itertools::Itertools;
use std::collections::BTreeSet;
use std::fmt::Display;

/// A finalized section: id, encoded body, and its place in the file.
#[derive(Debug)]
pub struct OutputSection {
    pub id: u8,
    pub name: Option<String>,
    /// Encoded body. For custom sections this starts with the encoded name.
    pub body: Vec<u8>,
    /// Section id byte plus the ULEB128 body size; computed by `finalize`.
    pub header: Vec<u8>,
    pub offset: u64,
    pub section_index: u32,
}

impl OutputSection {
    pub fn new(id: u8, body: Vec<u8>) -> OutputSection {
        OutputSection {
            id,
            name: None,
            body,
            header: Vec::new(),
            offset: 0,
            section_index: 0,
        }
    }

    pub fn custom(name: &str, payload: Vec<u8>) -> OutputSection {
        let mut body = Vec::with_capacity(name.len() + payload.len() + 4);
        write_str(&mut body, name);
        body.extend_from_slice(&payload);
        OutputSection {
            id: section::CUSTOM,
            name: Some(name.to_owned()),
            body,
            header: Vec::new(),
            offset: 0,
            section_index: 0,
        }
    }

    /// Fixes the section at `offset` and returns its total file size.
    pub fn finalize(&mut self, offset: u64) -> u64 {
        self.offset = offset;
        self.header.clear();
        self.header.push(self.id);
        write_uleb128(&mut self.header, self.body.len() as u64);
        self.file_size()
    }

    pub fn file_size(&self) -> u64 {
        (self.header.len() + self.body.len()) as u64
    }

    /// Copies the section into its file range. `buf` must be exactly
    /// `file_size` bytes.
    pub fn write_to(&self, buf: &mut [u8]) {
        let (header, body) = buf.split_at_mut(self.header.len());
        header.copy_from_slice(&self.header);
        body.copy_from_slice(&self.body);
    }
}

impl Display for OutputSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "custom({name})"),
            None => write!(f, "id={}", self.id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WasmExport {
    pub name: String,
    pub kind: u8,
    pub index: u32,
}

/// Deduplicated signature table.
#[derive(Default)]
pub struct TypeSection {
    pub types: Vec<Signature>,
    dedup: HashMap<Signature, u32>,
}

impl TypeSection {
    pub fn register(&mut self, signature: &Signature) -> u32 {
        if let Some(&index) = self.dedup.get(signature) {
            return index;
        }
        let index = self.types.len() as u32;
        self.types.push(signature.clone());
        self.dedup.insert(signature.clone(), index);
        index
    }

    pub fn lookup(&self, signature: &Signature) -> Option<u32> {
        self.dedup.get(signature).copied()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        write_uleb128(&mut body, self.types.len() as u64);
        for sig in &self.types {
            sig.encode(&mut body);
        }
        body
    }
}

/// Symbols that became imports. Sealed before index assignment because every
/// other index space starts after the imported entries.
#[derive(Default)]
pub struct ImportSection {
    pub symbols: Vec<SymbolId>,
    sealed: bool,
    num_functions: u32,
    num_globals: u32,
    num_events: u32,
}

impl ImportSection {
    pub fn add_import(&mut self, db: &mut SymbolDb, id: SymbolId) -> Result {
        if self.sealed {
            bail!(
                "internal error: import added after the import section was sealed: `{}`",
                db.symbol(id).name
            );
        }
        let accepted = match &mut db.symbol_mut(id).kind {
            SymbolKind::UndefinedFunction { index, .. } => {
                *index = Some(self.num_functions);
                self.num_functions += 1;
                true
            }
            SymbolKind::UndefinedGlobal { index, .. } => {
                *index = Some(self.num_globals);
                self.num_globals += 1;
                true
            }
            _ => false,
        };
        if !accepted {
            bail!(
                "internal error: symbol `{}` cannot be imported",
                db.symbol(id).name
            );
        }
        self.symbols.push(id);
        Ok(())
    }

    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn num_imported_functions(&self) -> u32 {
        self.num_functions
    }

    pub fn num_imported_globals(&self) -> u32 {
        self.num_globals
    }

    pub fn num_imported_events(&self) -> u32 {
        self.num_events
    }

    pub fn is_needed(&self, args: &Args) -> bool {
        !self.symbols.is_empty() || args.import_memory
    }

    pub fn encode(
        &self,
        args: &Args,
        db: &SymbolDb,
        types: &TypeSection,
        memory: &MemoryLayout,
    ) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        let count = self.symbols.len() as u64 + u64::from(args.import_memory);
        write_uleb128(&mut body, count);

        if args.import_memory {
            write_str(&mut body, "env");
            write_str(&mut body, "memory");
            body.push(wasm::export_kind::MEMORY);
            Limits {
                min: memory.num_pages,
                max: memory.max_pages,
                shared: args.shared_memory,
            }
            .encode(&mut body);
        }

        for &id in &self.symbols {
            let symbol = db.symbol(id);
            write_str(&mut body, "env");
            write_str(&mut body, &symbol.name);
            match &symbol.kind {
                SymbolKind::UndefinedFunction { signature, .. } => {
                    body.push(wasm::export_kind::FUNCTION);
                    let Some(type_index) = types.lookup(signature) else {
                        bail!(
                            "internal error: unregistered import signature for `{}`",
                            symbol.name
                        );
                    };
                    write_uleb128(&mut body, u64::from(type_index));
                }
                SymbolKind::UndefinedGlobal { ty, .. } => {
                    body.push(wasm::export_kind::GLOBAL);
                    body.push(ty.val_type.byte());
                    body.push(u8::from(ty.mutable));
                }
                _ => bail!("internal error: non-importable symbol `{}`", symbol.name),
            }
        }
        Ok(body)
    }
}

/// Defined functions in index order: synthetic first, then object functions
/// in object iteration order.
#[derive(Default)]
pub struct FunctionSection {
    pub functions: Vec<FuncRef>,
    /// Output type index per function; filled by type calculation.
    pub type_indices: Vec<u32>,
}

impl FunctionSection {
    pub fn add_function(&mut self, func: FuncRef) {
        self.functions.push(func);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        write_uleb128(&mut body, self.type_indices.len() as u64);
        for &type_index in &self.type_indices {
            write_uleb128(&mut body, u64::from(type_index));
        }
        body
    }
}

/// Defined globals in index order, plus the "fake" immutable globals that
/// stand in for exported data symbols.
#[derive(Default)]
pub struct GlobalSection {
    pub globals: Vec<GlobalRef>,
    pub fake_globals: Vec<SymbolId>,
}

impl GlobalSection {
    pub fn num_defined_globals(&self) -> u32 {
        self.globals.len() as u32
    }

    pub fn encode(&self, db: &SymbolDb, objects: &[ObjectFile]) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        write_uleb128(&mut body, (self.globals.len() + self.fake_globals.len()) as u64);
        for global in &self.globals {
            match *global {
                GlobalRef::Synthetic(i) => {
                    let g = &db.synthetic_globals[i];
                    body.push(g.ty.val_type.byte());
                    body.push(u8::from(g.ty.mutable));
                    match g.ty.val_type {
                        eosld_utils::wasm::ValType::I64 => {
                            body.push(opcode::I64_CONST);
                            write_sleb128(&mut body, g.init);
                        }
                        _ => {
                            body.push(opcode::I32_CONST);
                            write_sleb128(&mut body, g.init);
                        }
                    }
                    body.push(opcode::END);
                }
                GlobalRef::Object { file, global } => {
                    let g = &objects[file].globals[global];
                    body.push(g.ty.val_type.byte());
                    body.push(u8::from(g.ty.mutable));
                    g.init.encode(&mut body);
                }
            }
        }
        // Exported data symbols become immutable i32 globals holding their
        // virtual address.
        for &id in &self.fake_globals {
            let symbol = db.symbol(id);
            body.push(eosld_utils::wasm::ValType::I32.byte());
            body.push(0);
            body.push(opcode::I32_CONST);
            write_sleb128(&mut body, symbol.virtual_address()? as i64);
            body.push(opcode::END);
        }
        Ok(body)
    }
}

#[derive(Default)]
pub struct EventSection {
    pub events: Vec<crate::symbol::EventRef>,
}

impl EventSection {
    pub fn encode(&self, objects: &[ObjectFile], types: &TypeSection) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        write_uleb128(&mut body, self.events.len() as u64);
        for event_ref in &self.events {
            let event = &objects[event_ref.file].events[event_ref.event];
            let signature = &objects[event_ref.file].types[event.type_index as usize];
            let Some(type_index) = types.lookup(signature) else {
                bail!("internal error: unregistered event signature");
            };
            write_uleb128(&mut body, u64::from(event.attribute));
            write_uleb128(&mut body, u64::from(type_index));
        }
        Ok(body)
    }
}

#[derive(Default)]
pub struct ExportSection {
    pub exports: Vec<WasmExport>,
}

impl ExportSection {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        write_uleb128(&mut body, self.exports.len() as u64);
        for export in &self.exports {
            write_str(&mut body, &export.name);
            body.push(export.kind);
            write_uleb128(&mut body, u64::from(export.index));
        }
        body
    }
}

/// Functions whose address is taken through table-index relocations. They
/// occupy table slots starting at `table_base`.
#[derive(Default)]
pub struct ElemSection {
    pub table_base: u32,
    pub indirect_functions: Vec<SymbolId>,
}

impl ElemSection {
    pub fn add(&mut self, id: SymbolId) {
        if !self.indirect_functions.contains(&id) {
            self.indirect_functions.push(id);
        }
    }

    pub fn num_table_entries(&self) -> u32 {
        self.table_base + self.indirect_functions.len() as u32
    }

    pub fn encode(&self, db: &SymbolDb) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        write_uleb128(&mut body, 1); // one active segment, table 0
        write_uleb128(&mut body, 0);
        body.push(opcode::I32_CONST);
        write_sleb128(&mut body, i64::from(self.table_base));
        body.push(opcode::END);
        write_uleb128(&mut body, self.indirect_functions.len() as u64);
        for &id in &self.indirect_functions {
            write_uleb128(&mut body, u64::from(db.symbol(id).function_index()?));
        }
        Ok(body)
    }
}

pub fn encode_table_section(num_entries: u32) -> Vec<u8> {
    let mut body = Vec::new();
    write_uleb128(&mut body, 1);
    body.push(0x70); // funcref
    Limits {
        min: u64::from(num_entries),
        max: Some(u64::from(num_entries)),
        shared: false,
    }
    .encode(&mut body);
    body
}

pub fn encode_memory_section(args: &Args, memory: &MemoryLayout) -> Vec<u8> {
    let mut body = Vec::new();
    write_uleb128(&mut body, 1);
    Limits {
        min: memory.num_pages,
        max: memory.max_pages,
        shared: args.shared_memory,
    }
    .encode(&mut body);
    body
}

pub fn encode_data_count_section(num_segments: u32) -> Vec<u8> {
    let mut body = Vec::new();
    write_uleb128(&mut body, u64::from(num_segments));
    body
}

/// `dylink` payload for PIC/shared output.
pub fn encode_dylink_section(memory: &MemoryLayout, table_size: u32) -> Vec<u8> {
    let mut body = Vec::new();
    write_uleb128(&mut body, memory.mem_size);
    write_uleb128(&mut body, u64::from(memory.mem_align));
    write_uleb128(&mut body, u64::from(table_size));
    write_uleb128(&mut body, 0); // table alignment
    write_uleb128(&mut body, 0); // no needed libraries
    body
}

/// Encodes the code section and records each function body's offset within
/// the section body, for relocation mirroring.
pub fn encode_code_section(
    functions: &[FuncRef],
    db: &SymbolDb,
    objects: &[ObjectFile],
) -> (Vec<u8>, Vec<u64>) {
    let mut body = Vec::new();
    let mut offsets = Vec::with_capacity(functions.len());
    write_uleb128(&mut body, functions.len() as u64);
    for func in functions {
        offsets.push(body.len() as u64);
        let bytes: &[u8] = match *func {
            FuncRef::Synthetic(i) => &db.synthetic_functions[i].body,
            FuncRef::Object { file, func } => &objects[file].functions[func].body,
        };
        body.extend_from_slice(bytes);
    }
    (body, offsets)
}

/// Encodes the data section and records, for every placed input segment,
/// the offset of its bytes within the section body.
pub fn encode_data_section(
    segments: &[OutputSegment],
    objects: &[ObjectFile],
) -> (Vec<u8>, FoldHashMap<(usize, usize), u64>) {
    let mut body = Vec::new();
    let mut input_offsets = FoldHashMap::new();
    write_uleb128(&mut body, segments.len() as u64);
    for seg in segments {
        write_uleb128(&mut body, u64::from(seg.init_flags));
        if !seg.is_passive() {
            body.push(opcode::I32_CONST);
            write_sleb128(&mut body, seg.start_va as i64);
            body.push(opcode::END);
        }
        write_uleb128(&mut body, seg.size);
        let data_start = body.len() as u64;
        let mut written = 0u64;
        for &(file, index) in &seg.inputs {
            let input = &objects[file].segments[index];
            // Inter-segment alignment padding.
            body.resize((data_start + input.output_offset) as usize, 0);
            input_offsets.insert((file, index), body.len() as u64);
            body.extend_from_slice(&input.data);
            written = input.output_offset + input.size();
        }
        debug_assert_eq!(written, seg.size);
    }
    (body, input_offsets)
}

/// Concatenates grouped input custom sections, recording each input's
/// offset within the payload.
pub fn encode_custom_payload(
    inputs: &[(usize, usize)],
    objects: &[ObjectFile],
) -> (Vec<u8>, Vec<u64>) {
    let mut payload = Vec::new();
    let mut offsets = Vec::with_capacity(inputs.len());
    for &(file, index) in inputs {
        offsets.push(payload.len() as u64);
        payload.extend_from_slice(&objects[file].custom_sections[index].data);
    }
    (payload, offsets)
}

/// The `linking` custom section of relocatable output.
#[derive(Default)]
pub struct LinkingSection {
    pub entries: Vec<SymbolId>,
    index_of: FoldHashMap<SymbolId, u32>,
}

impl LinkingSection {
    pub fn add_to_symtab(&mut self, id: SymbolId) {
        if self.index_of.contains_key(&id) {
            return;
        }
        self.index_of.insert(id, self.entries.len() as u32);
        self.entries.push(id);
    }

    pub fn symbol_index(&self, id: SymbolId) -> Option<u32> {
        self.index_of.get(&id).copied()
    }

    pub fn encode(
        &self,
        db: &SymbolDb,
        objects: &[ObjectFile],
        segments: &[OutputSegment],
        init_functions: &[InitFunction],
    ) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        write_uleb128(&mut body, u64::from(linking::VERSION));

        if !self.entries.is_empty() {
            let mut payload = Vec::new();
            write_uleb128(&mut payload, self.entries.len() as u64);
            for &id in &self.entries {
                let symbol = db.symbol(id);
                let mut flags = 0u32;
                if symbol.is_weak() {
                    flags |= linking::WASM_SYM_BINDING_WEAK;
                }
                if symbol.is_local() {
                    flags |= linking::WASM_SYM_BINDING_LOCAL;
                }
                if symbol.is_hidden() {
                    flags |= linking::WASM_SYM_VISIBILITY_HIDDEN;
                }
                if symbol.is_undefined() {
                    flags |= linking::WASM_SYM_UNDEFINED;
                }
                match &symbol.kind {
                    SymbolKind::DefinedFunction { .. } => {
                        payload.push(linking::SYMTAB_FUNCTION);
                        write_uleb128(&mut payload, u64::from(flags));
                        write_uleb128(&mut payload, u64::from(symbol.function_index()?));
                        write_str(&mut payload, &symbol.name);
                    }
                    SymbolKind::UndefinedFunction { .. } => {
                        payload.push(linking::SYMTAB_FUNCTION);
                        write_uleb128(&mut payload, u64::from(flags));
                        write_uleb128(&mut payload, u64::from(symbol.function_index()?));
                    }
                    SymbolKind::DefinedGlobal { .. } => {
                        payload.push(linking::SYMTAB_GLOBAL);
                        write_uleb128(&mut payload, u64::from(flags));
                        write_uleb128(&mut payload, u64::from(symbol.global_index()?));
                        write_str(&mut payload, &symbol.name);
                    }
                    SymbolKind::UndefinedGlobal { .. } => {
                        payload.push(linking::SYMTAB_GLOBAL);
                        write_uleb128(&mut payload, u64::from(flags));
                        write_uleb128(&mut payload, u64::from(symbol.global_index()?));
                    }
                    SymbolKind::DefinedEvent { .. } => {
                        payload.push(linking::SYMTAB_EVENT);
                        write_uleb128(&mut payload, u64::from(flags));
                        write_uleb128(&mut payload, u64::from(symbol.event_index()?));
                        write_str(&mut payload, &symbol.name);
                    }
                    SymbolKind::DefinedData { location, size, .. } => {
                        payload.push(linking::SYMTAB_DATA);
                        write_uleb128(&mut payload, u64::from(flags));
                        write_str(&mut payload, &symbol.name);
                        let Some(location) = location else {
                            bail!(
                                "internal error: segment-less data symbol `{}` in symtab",
                                symbol.name
                            );
                        };
                        let input = &objects[location.file].segments[location.segment];
                        let Some(out_segment) = input.output_segment else {
                            bail!(
                                "internal error: unplaced data symbol `{}` in symtab",
                                symbol.name
                            );
                        };
                        write_uleb128(&mut payload, u64::from(out_segment));
                        write_uleb128(&mut payload, input.output_offset + location.offset);
                        write_uleb128(&mut payload, *size);
                    }
                    SymbolKind::Section { section_index } => {
                        payload.push(linking::SYMTAB_SECTION);
                        write_uleb128(&mut payload, u64::from(flags));
                        write_uleb128(&mut payload, u64::from(*section_index));
                    }
                }
            }
            body.push(linking::WASM_SYMBOL_TABLE);
            write_uleb128(&mut body, payload.len() as u64);
            body.extend_from_slice(&payload);
        }

        if !segments.is_empty() {
            let mut payload = Vec::new();
            write_uleb128(&mut payload, segments.len() as u64);
            for seg in segments {
                write_str(&mut payload, &seg.name);
                write_uleb128(&mut payload, u64::from(seg.alignment.exponent));
                write_uleb128(&mut payload, 0); // flags
            }
            body.push(linking::WASM_SEGMENT_INFO);
            write_uleb128(&mut body, payload.len() as u64);
            body.extend_from_slice(&payload);
        }

        if !init_functions.is_empty() {
            let mut payload = Vec::new();
            write_uleb128(&mut payload, init_functions.len() as u64);
            for init in init_functions {
                let Some(index) = self.symbol_index(init.symbol) else {
                    bail!("internal error: init function missing from symtab");
                };
                write_uleb128(&mut payload, u64::from(init.priority));
                write_uleb128(&mut payload, u64::from(index));
            }
            body.push(linking::WASM_INIT_FUNCS);
            write_uleb128(&mut body, payload.len() as u64);
            body.extend_from_slice(&payload);
        }

        Ok(body)
    }
}

/// The function-names subsection of the `name` custom section.
pub fn encode_name_section(
    db: &SymbolDb,
    imports: &ImportSection,
    functions: &FunctionSection,
    objects: &[ObjectFile],
) -> Vec<u8> {
    let mut entries: Vec<(u32, &str)> = Vec::new();
    let mut import_index = 0u32;
    for &id in &imports.symbols {
        let symbol = db.symbol(id);
        if symbol.is_function() {
            entries.push((import_index, &symbol.name));
            import_index += 1;
        }
    }
    let num_imported = imports.num_imported_functions();
    for (i, func) in functions.functions.iter().enumerate() {
        let name: &str = match *func {
            FuncRef::Synthetic(s) => &db.synthetic_functions[s].name,
            FuncRef::Object { file, func } => &objects[file].functions[func].name,
        };
        if !name.is_empty() {
            entries.push((num_imported + i as u32, name));
        }
    }

    let mut subsection = Vec::new();
    write_uleb128(&mut subsection, entries.len() as u64);
    for (index, name) in &entries {
        write_uleb128(&mut subsection, u64::from(*index));
        write_str(&mut subsection, name);
    }

    let mut body = Vec::new();
    body.push(1); // function names subsection
    write_uleb128(&mut body, subsection.len() as u64);
    body.extend_from_slice(&subsection);
    body
}

/// Tool-version lists merged across the inputs, first occurrence of a name
/// wins.
#[derive(Default)]
pub struct ProducersSection {
    languages: Vec<(String, String)>,
    processed_by: Vec<(String, String)>,
    sdks: Vec<(String, String)>,
}

impl ProducersSection {
    pub fn add_info(&mut self, info: &ProducerInfo) {
        self.languages.extend(info.languages.iter().cloned());
        self.processed_by.extend(info.processed_by.iter().cloned());
        self.sdks.extend(info.sdks.iter().cloned());
    }

    pub fn is_needed(&self) -> bool {
        !self.languages.is_empty() || !self.processed_by.is_empty() || !self.sdks.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let fields = [
            ("language", &self.languages),
            ("processed-by", &self.processed_by),
            ("sdk", &self.sdks),
        ];
        let mut body = Vec::new();
        let non_empty = fields.iter().filter(|(_, list)| !list.is_empty()).count();
        write_uleb128(&mut body, non_empty as u64);
        for (field, list) in fields {
            if list.is_empty() {
                continue;
            }
            let unique: Vec<&(String, String)> =
                list.iter().unique_by(|(name, _)| name.clone()).collect();
            write_str(&mut body, field);
            write_uleb128(&mut body, unique.len() as u64);
            for (name, version) in unique {
                write_str(&mut body, name);
                write_str(&mut body, version);
            }
        }
        body
    }
}

#[derive(Default)]
pub struct TargetFeaturesSection {
    pub features: BTreeSet<String>,
}

impl TargetFeaturesSection {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        write_uleb128(&mut body, self.features.len() as u64);
        for feature in &self.features {
            body.push(wasm::feature_prefix::USED);
            write_str(&mut body, feature);
        }
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eosld_utils::wasm::ValType;

    #[test]
    fn type_section_deduplicates_structurally() {
        let mut types = TypeSection::default();
        let a = Signature::new(vec![ValType::I64], vec![]);
        let b = Signature::new(vec![ValType::I64], vec![]);
        let c = Signature::new(vec![ValType::I32], vec![]);
        assert_eq!(types.register(&a), 0);
        assert_eq!(types.register(&b), 0);
        assert_eq!(types.register(&c), 1);
        assert_eq!(types.types.len(), 2);

        let body = types.encode();
        assert_eq!(body[0], 2);
    }

    #[test]
    fn finalized_section_layout() {
        let mut sec = OutputSection::new(section::TYPE, vec![0xaa; 300]);
        let size = sec.finalize(8);
        // id byte + two-byte ULEB length + payload
        assert_eq!(size, 1 + 2 + 300);
        assert_eq!(sec.header[0], section::TYPE);

        let mut buf = vec![0u8; size as usize];
        sec.write_to(&mut buf);
        assert_eq!(buf[0], section::TYPE);
        assert_eq!(&buf[3..], &sec.body[..]);
    }

    #[test]
    fn custom_section_body_starts_with_name() {
        let sec = OutputSection::custom("producers", vec![1, 2, 3]);
        assert_eq!(sec.body[0] as usize, "producers".len());
        assert_eq!(&sec.body[1..10], b"producers");
        assert_eq!(&sec.body[10..], [1, 2, 3]);
    }

    #[test]
    fn producers_merge_first_wins() {
        let mut producers = ProducersSection::default();
        producers.add_info(&ProducerInfo {
            languages: vec![("C++".to_owned(), "14".to_owned())],
            processed_by: vec![("clang".to_owned(), "9.0".to_owned())],
            sdks: vec![],
        });
        producers.add_info(&ProducerInfo {
            languages: vec![("C++".to_owned(), "17".to_owned())],
            processed_by: vec![("eosio-cpp".to_owned(), "1.7".to_owned())],
            sdks: vec![],
        });
        let body = producers.encode();
        // Two non-empty fields.
        assert_eq!(body[0], 2);
        // "language" has a single entry: the first-seen C++ version.
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("14"));
        assert!(!text.contains("17"));
    }

    #[test]
    fn elem_section_dedups_and_counts_from_table_base() {
        let mut db = SymbolDb::new();
        let id = db.add_synthetic_function(
            "f",
            Signature::default(),
            crate::symbol::Visibility::Hidden,
        );
        let mut elem = ElemSection {
            table_base: 1,
            ..ElemSection::default()
        };
        elem.add(id);
        elem.add(id);
        assert_eq!(elem.indirect_functions.len(), 1);
        assert_eq!(elem.num_table_entries(), 2);
    }

    #[test]
    fn target_features_sorted_with_plus_prefix() {
        let mut sec = TargetFeaturesSection::default();
        sec.features.insert("sign-ext".to_owned());
        sec.features.insert("bulk-memory".to_owned());
        let body = sec.encode();
        assert_eq!(body[0], 2);
        assert_eq!(body[1], b'+');
        // BTreeSet iteration puts bulk-memory first.
        assert_eq!(&body[3..14], b"bulk-memory");
    }
}
