//! The writer: turns a resolved symbol table and a set of input objects
//! into the output `.wasm` binary and its merged `.abi` side-file.
//!
//! The pipeline is strictly forward; every stage publishes state the later
//! stages read, and nothing is mutated after `finalize_sections`. Index
//! assignment must complete before any function body is synthesized, since
//! emitted bytecode encodes absolute indices. Two checkpoints consult the
//! diagnostics: after dispatcher emission and after the output buffer is
//! opened; past either checkpoint with a clean slate, the only remaining
//! failures are I/O.

use crate::abi::AbiMerger;
use crate::args::Args;
use crate::diagnostics::Diagnostics;
use crate::dispatch;
use crate::error::Result;
use crate::file_writer::SizedOutput;
use crate::input_data::is_table_index_reloc;
use crate::input_data::InitFunction;
use crate::input_data::ObjectFile;
use crate::layout;
use crate::layout::MemoryLayout;
use crate::layout::OutputSegment;
use crate::output_sections::encode_code_section;
use crate::output_sections::encode_custom_payload;
use crate::output_sections::encode_data_count_section;
use crate::output_sections::encode_data_section;
use crate::output_sections::encode_dylink_section;
use crate::output_sections::encode_memory_section;
use crate::output_sections::encode_name_section;
use crate::output_sections::encode_table_section;
use crate::output_sections::ElemSection;
use crate::output_sections::EventSection;
use crate::output_sections::ExportSection;
use crate::output_sections::FunctionSection;
use crate::output_sections::GlobalSection;
use crate::output_sections::ImportSection;
use crate::output_sections::LinkingSection;
use crate::output_sections::OutputSection;
use crate::output_sections::ProducersSection;
use crate::output_sections::TargetFeaturesSection;
use crate::output_sections::TypeSection;
use crate::output_sections::WasmExport;
use crate::symbol::EventRef;
use crate::symbol::FuncRef;
use crate::symbol::GlobalRef;
use crate::symbol::Symbol;
use crate::symbol::SymbolKind;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolId;
use crate::synthetic;
use anyhow::bail;
use eosld_utils::wasm;
use eosld_utils::wasm::reloc;
use eosld_utils::wasm::section;
use eosld_utils::wasm::write_sleb128;
use eosld_utils::wasm::write_uleb128;
use eosld_utils::wasm::WASM_MAGIC;
use eosld_utils::wasm::WASM_VERSION;
use foldhash::HashMap as FoldHashMap;
use indexmap::IndexMap;
use rayon::iter::IndexedParallelIterator;
use rayon::iter::IntoParallelIterator;
use rayon::iter::IntoParallelRefIterator;
use rayon::iter::ParallelIterator;

/// Writes the linked module (and its ABI) for an already-resolved symbol
/// table. Non-fatal problems are reported through `diagnostics`; the
/// returned error aggregates them, or carries a fatal failure directly.
pub fn write_output(
    args: &Args,
    objects: &mut [ObjectFile],
    db: &mut SymbolDb,
    diagnostics: &Diagnostics,
) -> Result {
    let writer = Writer {
        global_base: if args.relocatable || args.is_pic {
            0
        } else {
            args.global_base
        },
        // For PIC the table base is assigned by the loader; otherwise start
        // at 1 so that calling table index 0 always traps.
        table_base: if args.is_pic { 0 } else { 1 },
        args,
        diagnostics,
        db,
        objects,
        abis: Vec::new(),
        segments: Vec::new(),
        init_functions: Vec::new(),
        memory: MemoryLayout::default(),
        types: TypeSection::default(),
        imports: ImportSection::default(),
        functions: FunctionSection::default(),
        globals: GlobalSection::default(),
        events: EventSection::default(),
        exports: ExportSection::default(),
        elem: ElemSection::default(),
        linking: LinkingSection::default(),
        producers: ProducersSection::default(),
        target_features: TargetFeaturesSection::default(),
        output_sections: Vec::new(),
        header: Vec::new(),
        file_size: 0,
    };
    writer.run()
}

struct Writer<'a> {
    args: &'a Args,
    diagnostics: &'a Diagnostics,
    db: &'a mut SymbolDb,
    objects: &'a mut [ObjectFile],

    global_base: u64,
    table_base: u32,
    abis: Vec<String>,
    segments: Vec<OutputSegment>,
    init_functions: Vec<InitFunction>,
    memory: MemoryLayout,

    types: TypeSection,
    imports: ImportSection,
    functions: FunctionSection,
    globals: GlobalSection,
    events: EventSection,
    exports: ExportSection,
    elem: ElemSection,
    linking: LinkingSection,
    producers: ProducersSection,
    target_features: TargetFeaturesSection,

    output_sections: Vec<OutputSection>,
    header: Vec<u8>,
    file_size: u64,
}

impl Writer<'_> {
    #[tracing::instrument(skip_all, name = "Write output")]
    fn run(mut self) -> Result {
        self.elem.table_base = self.table_base;

        self.segments =
            layout::create_output_segments(self.args, self.objects, &mut self.abis);
        self.populate_producers();
        self.target_features.features =
            crate::features::reconcile_features(self.args, self.diagnostics, self.objects);
        self.calculate_imports()?;

        self.memory = layout::layout_memory(
            self.args,
            self.global_base,
            self.diagnostics,
            self.db,
            &mut self.segments,
        );
        layout::assign_data_symbol_addresses(self.db, self.objects, &self.segments);

        if !self.args.relocatable {
            // __start_/__stop_ symbols need final addresses, so this has to
            // follow memory layout.
            for seg in &self.segments {
                layout::add_start_stop_symbols(self.db, seg);
            }
        }

        self.scan_relocations();
        self.assign_indexes()?;
        self.init_functions = synthetic::calculate_init_functions(
            self.args,
            self.diagnostics,
            self.db,
            self.objects,
        );

        if !self.args.relocatable {
            if self.args.passive_segments {
                synthetic::create_init_memory_function(self.db, &self.segments);
            }
            if self.args.is_pic {
                synthetic::create_apply_relocations_function(
                    self.db,
                    self.objects,
                    &self.segments,
                );
            }
            synthetic::create_call_ctors_function(self.db, self.args, &self.init_functions)?;
        }
        if !self.args.relocatable && self.args.shared_memory && !self.args.shared {
            synthetic::create_init_tls_function(self.db, &self.segments)?;
        }

        if self.db.well_known.entry.is_some() {
            if let Err(error) =
                dispatch::create_dispatch_function(self.db, self.objects, self.args.stack_canary)
            {
                self.diagnostics.error(format!("{error:#}"));
            }
        }
        if self.db.well_known.sync_call_entry.is_some() {
            if let Err(error) = dispatch::create_sync_call_dispatch_function(
                self.db,
                self.objects,
                self.args.stack_canary,
            ) {
                self.diagnostics.error(format!("{error:#}"));
            }
        }
        self.diagnostics.check()?;

        self.calculate_types();
        self.calculate_exports()?;
        let custom_groups = self.calculate_custom_sections();
        self.populate_symtab();
        self.add_sections(custom_groups)?;

        tracing::debug!(
            defined_functions = self.functions.functions.len(),
            defined_globals = self.globals.globals.len(),
            defined_events = self.events.events.len(),
            function_imports = self.imports.num_imported_functions(),
            global_imports = self.imports.num_imported_globals(),
            event_imports = self.imports.num_imported_events(),
            "writer totals"
        );

        self.create_header();
        self.finalize_sections();

        tracing::debug!("writing: {}", self.args.output_file.display());
        let mut output = match SizedOutput::new(&self.args.output_file, self.file_size) {
            Ok(output) => output,
            Err(error) => {
                self.diagnostics.error(format!("{error:#}"));
                return self.diagnostics.check();
            }
        };

        self.write_header(&mut output);
        self.write_sections(&mut output);
        self.diagnostics.check()?;

        self.write_abi()?;
        output.commit()
    }

    fn populate_producers(&mut self) {
        for obj in self.objects.iter() {
            self.producers.add_info(&obj.producers);
        }
    }

    /// A symbol becomes an import iff it is an undefined, live reference
    /// from a regular object and is not a discardable weak reference.
    #[tracing::instrument(skip_all, name = "Calculate imports")]
    fn calculate_imports(&mut self) -> Result {
        let candidates: Vec<SymbolId> = self
            .db
            .iter()
            .filter(|(_, sym)| {
                sym.is_undefined()
                    && sym.is_live()
                    && sym.is_used_in_regular_obj()
                    && !(sym.is_weak() && !self.args.relocatable)
            })
            .map(|(id, _)| id)
            .collect();
        for id in candidates {
            tracing::debug!("import: {}", self.db.symbol(id).name);
            self.imports.add_import(self.db, id)?;
        }
        Ok(())
    }

    /// Marks relocation-referenced types and collects address-taken
    /// functions into the table.
    #[tracing::instrument(skip_all, name = "Scan relocations")]
    fn scan_relocations(&mut self) {
        let Writer {
            objects, db, elem, ..
        } = self;
        for obj in objects.iter_mut() {
            let mut used_types = Vec::new();
            let mut table_targets = Vec::new();
            {
                let all_relocations = obj
                    .functions
                    .iter()
                    .map(|f| &f.relocations)
                    .chain(obj.segments.iter().map(|s| &s.relocations))
                    .chain(obj.custom_sections.iter().map(|c| &c.relocations));
                for relocations in all_relocations {
                    for r in relocations {
                        if r.ty == reloc::R_WASM_TYPE_INDEX_LEB {
                            used_types.push(r.index);
                        } else if is_table_index_reloc(r.ty) {
                            if let Some(&id) = obj.symbols.get(r.index as usize) {
                                table_targets.push(id);
                            }
                        }
                    }
                }
            }
            for index in used_types {
                obj.mark_type_used(index);
            }
            for id in table_targets {
                if db.symbol(id).is_function() {
                    elem.add(id);
                }
            }
        }
    }

    /// Seals the import section and lays out the function, global and event
    /// index spaces: imports, then synthetic entities, then object entities
    /// in object iteration order. Caches the result on every symbol.
    #[tracing::instrument(skip_all, name = "Assign indexes")]
    fn assign_indexes(&mut self) -> Result {
        self.imports.seal();
        let Writer {
            db,
            objects,
            functions,
            globals,
            events,
            imports,
            ..
        } = self;

        let mut func_index = imports.num_imported_functions();
        for (i, func) in db.synthetic_functions.iter_mut().enumerate() {
            func.index = Some(func_index);
            func_index += 1;
            functions.add_function(FuncRef::Synthetic(i));
        }
        let mut global_index = imports.num_imported_globals();
        for (i, global) in db.synthetic_globals.iter_mut().enumerate() {
            global.index = Some(global_index);
            global_index += 1;
            globals.globals.push(GlobalRef::Synthetic(i));
        }
        let mut event_index = imports.num_imported_events();

        for (file, obj) in objects.iter_mut().enumerate() {
            for (i, func) in obj.functions.iter_mut().enumerate() {
                func.index = Some(func_index);
                func_index += 1;
                functions.add_function(FuncRef::Object { file, func: i });
            }
        }
        for (file, obj) in objects.iter_mut().enumerate() {
            for (i, global) in obj.globals.iter_mut().enumerate() {
                global.index = Some(global_index);
                global_index += 1;
                globals.globals.push(GlobalRef::Object { file, global: i });
            }
        }
        for (file, obj) in objects.iter_mut().enumerate() {
            for (i, event) in obj.events.iter_mut().enumerate() {
                event.index = Some(event_index);
                event_index += 1;
                events.events.push(EventRef { file, event: i });
            }
        }

        // Cache the assigned indices on the defining symbols; the dispatcher
        // emitters read them from there.
        for raw in 0..db.num_symbols() {
            let id = SymbolId::from_usize(raw);
            match db.symbol(id).kind {
                SymbolKind::DefinedFunction { func, .. } => {
                    let index = match func {
                        FuncRef::Synthetic(i) => db.synthetic_functions[i].index,
                        FuncRef::Object { file, func } => objects[file].functions[func].index,
                    };
                    if let SymbolKind::DefinedFunction { index: slot, .. } =
                        &mut db.symbol_mut(id).kind
                    {
                        *slot = index;
                    }
                }
                SymbolKind::DefinedGlobal { global, .. } => {
                    let index = match global {
                        GlobalRef::Synthetic(i) => db.synthetic_globals[i].index,
                        GlobalRef::Object { file, global } => objects[file].globals[global].index,
                    };
                    if let SymbolKind::DefinedGlobal { index: slot, .. } =
                        &mut db.symbol_mut(id).kind
                    {
                        *slot = index;
                    }
                }
                SymbolKind::DefinedEvent { event, .. } => {
                    let index = objects[event.file].events[event.event].index;
                    if let SymbolKind::DefinedEvent { index: slot, .. } =
                        &mut db.symbol_mut(id).kind
                    {
                        *slot = index;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// The output type table is the union of relocation-referenced object
    /// types, import signatures, and the signatures of every defined
    /// function and event.
    #[tracing::instrument(skip_all, name = "Calculate types")]
    fn calculate_types(&mut self) {
        for obj in self.objects.iter_mut() {
            for i in 0..obj.types.len() {
                if obj.type_is_used[i] {
                    obj.type_map[i] = Some(self.types.register(&obj.types[i]));
                }
            }
        }

        for i in 0..self.imports.symbols.len() {
            let id = self.imports.symbols[i];
            if let SymbolKind::UndefinedFunction { signature, .. } = &self.db.symbol(id).kind {
                self.types.register(signature);
            }
        }

        for i in 0..self.functions.functions.len() {
            let signature = self
                .db
                .function_signature(self.objects, self.functions.functions[i]);
            let type_index = self.types.register(signature);
            self.functions.type_indices.push(type_index);
        }

        for i in 0..self.events.events.len() {
            let event = self.events.events[i];
            let obj = &self.objects[event.file];
            let signature = &obj.types[obj.events[event.event].type_index as usize];
            self.types.register(signature);
        }
    }

    #[tracing::instrument(skip_all, name = "Calculate exports")]
    fn calculate_exports(&mut self) -> Result {
        if self.args.relocatable {
            return Ok(());
        }
        let Writer {
            args,
            db,
            objects,
            imports,
            globals,
            exports,
            ..
        } = self;

        if !args.import_memory {
            exports.exports.push(WasmExport {
                name: "memory".to_owned(),
                kind: wasm::export_kind::MEMORY,
                index: 0,
            });
        }
        if args.export_table {
            exports.exports.push(WasmExport {
                name: "__indirect_function_table".to_owned(),
                kind: wasm::export_kind::TABLE,
                index: 0,
            });
        }

        let mut fake_global_index =
            imports.num_imported_globals() + globals.num_defined_globals();
        let mut fake_globals = Vec::new();
        for (id, symbol) in db.iter() {
            if !symbol.is_defined() || !symbol.is_live() || symbol.is_local() {
                continue;
            }
            if symbol.is_hidden() && !args.export_all {
                continue;
            }
            let export = match &symbol.kind {
                SymbolKind::DefinedFunction { .. } => WasmExport {
                    name: symbol.name.clone(),
                    kind: wasm::export_kind::FUNCTION,
                    index: symbol.function_index()?,
                },
                SymbolKind::DefinedGlobal { global, .. } => {
                    let mutable = match *global {
                        GlobalRef::Synthetic(i) => db.synthetic_globals[i].ty.mutable,
                        GlobalRef::Object { file, global } => {
                            objects[file].globals[global].ty.mutable
                        }
                    };
                    if mutable {
                        // Mutable globals aren't exportable; only the stack
                        // and TLS base pointers should ever be created
                        // mutable.
                        crate::debug_assert_bail!(
                            Some(id) == db.well_known.stack_pointer
                                || Some(id) == db.well_known.tls_base,
                            "unexpected mutable global `{}`",
                            symbol.name
                        );
                        continue;
                    }
                    WasmExport {
                        name: symbol.name.clone(),
                        kind: wasm::export_kind::GLOBAL,
                        index: symbol.global_index()?,
                    }
                }
                SymbolKind::DefinedEvent { .. } => WasmExport {
                    name: symbol.name.clone(),
                    kind: wasm::export_kind::EVENT,
                    index: symbol.event_index()?,
                },
                SymbolKind::DefinedData { .. } => {
                    let export = WasmExport {
                        name: symbol.name.clone(),
                        kind: wasm::export_kind::GLOBAL,
                        index: fake_global_index,
                    };
                    fake_globals.push(id);
                    fake_global_index += 1;
                    export
                }
                SymbolKind::Section { .. }
                | SymbolKind::UndefinedFunction { .. }
                | SymbolKind::UndefinedGlobal { .. } => continue,
            };
            tracing::debug!("export: {}", export.name);
            exports.exports.push(export);
        }
        globals.fake_globals = fake_globals;
        Ok(())
    }

    /// Groups input custom sections by name, skipping the ones the linker
    /// synthesizes itself and, when stripping, debug info.
    #[tracing::instrument(skip_all, name = "Calculate custom sections")]
    fn calculate_custom_sections(&self) -> IndexMap<String, Vec<(usize, usize)>> {
        let strip_debug = self.args.strip_debug || self.args.strip_all;
        let mut groups: IndexMap<String, Vec<(usize, usize)>> = IndexMap::new();
        for (file, obj) in self.objects.iter().enumerate() {
            for (index, custom) in obj.custom_sections.iter().enumerate() {
                let name = custom.name.as_str();
                // These are known to the linker and synthesized rather than
                // blindly copied.
                if matches!(name, "linking" | "name" | "producers" | "target_features")
                    || name.starts_with("reloc.")
                {
                    continue;
                }
                if strip_debug && name.starts_with(".debug_") {
                    continue;
                }
                groups.entry(name.to_owned()).or_default().push((file, index));
            }
        }
        groups
    }

    fn populate_symtab(&mut self) {
        if !self.args.relocatable && !self.args.emit_relocs {
            return;
        }
        let Writer { db, linking, .. } = self;
        for (id, symbol) in db.iter() {
            if !symbol.is_used_in_regular_obj() || !symbol.is_live() {
                continue;
            }
            // Synthesized address symbols have no segment to reference.
            if let SymbolKind::DefinedData { location: None, .. } = &symbol.kind {
                continue;
            }
            linking.add_to_symtab(id);
        }
    }

    fn add_section(&mut self, mut section: OutputSection) -> u32 {
        let index = self.output_sections.len() as u32;
        section.section_index = index;
        tracing::debug!("addSection: {section}");
        self.output_sections.push(section);
        index
    }

    /// Assembles the final section list in canonical order.
    #[tracing::instrument(skip_all, name = "Add sections")]
    fn add_sections(&mut self, custom_groups: IndexMap<String, Vec<(usize, usize)>>) -> Result {
        if self.args.is_pic || self.args.shared {
            let body = encode_dylink_section(&self.memory, self.elem.num_table_entries());
            self.add_section(OutputSection::custom("dylink", body));
        }
        if !self.types.types.is_empty() {
            let body = self.types.encode();
            self.add_section(OutputSection::new(section::TYPE, body));
        }
        if self.imports.is_needed(self.args) {
            let body = self
                .imports
                .encode(self.args, self.db, &self.types, &self.memory)?;
            self.add_section(OutputSection::new(section::IMPORT, body));
        }
        if !self.functions.functions.is_empty() {
            let body = self.functions.encode();
            self.add_section(OutputSection::new(section::FUNCTION, body));
        }
        self.add_section(OutputSection::new(
            section::TABLE,
            encode_table_section(self.elem.num_table_entries()),
        ));
        if !self.args.import_memory {
            self.add_section(OutputSection::new(
                section::MEMORY,
                encode_memory_section(self.args, &self.memory),
            ));
        }
        if !self.globals.globals.is_empty() || !self.globals.fake_globals.is_empty() {
            let body = self.globals.encode(self.db, self.objects)?;
            self.add_section(OutputSection::new(section::GLOBAL, body));
        }
        if !self.events.events.is_empty() {
            let body = self.events.encode(self.objects, &self.types)?;
            self.add_section(OutputSection::new(section::EVENT, body));
        }
        if !self.exports.exports.is_empty() {
            let body = self.exports.encode();
            self.add_section(OutputSection::new(section::EXPORT, body));
        }
        if !self.elem.indirect_functions.is_empty() {
            let body = self.elem.encode(self.db)?;
            self.add_section(OutputSection::new(section::ELEM, body));
        }
        if self.segments.iter().any(OutputSegment::is_passive) {
            self.add_section(OutputSection::new(
                section::DATA_COUNT,
                encode_data_count_section(self.segments.len() as u32),
            ));
        }

        let mut code_section = None;
        if !self.functions.functions.is_empty() {
            let (body, offsets) = encode_code_section(
                &self.functions.functions,
                self.db,
                self.objects,
            );
            let index = self.add_section(OutputSection::new(section::CODE, body));
            code_section = Some((index, offsets));
        }
        let mut data_section = None;
        if !self.segments.is_empty() {
            let (body, input_offsets) = encode_data_section(&self.segments, self.objects);
            let index = self.add_section(OutputSection::new(section::DATA, body));
            data_section = Some((index, input_offsets));
        }

        let relocatable_output = self.args.relocatable || self.args.emit_relocs;
        let mut customs = Vec::new();
        for (name, inputs) in custom_groups {
            let (payload, offsets) = encode_custom_payload(&inputs, self.objects);
            let payload_len = payload.len() as u64;
            let section = OutputSection::custom(&name, payload);
            // Relocation offsets are relative to the section body, which
            // starts with the encoded name.
            let name_size = section.body.len() as u64 - payload_len;
            let index = self.add_section(section);
            if relocatable_output {
                let id = self.db.add(Symbol::new(
                    name.clone(),
                    SymbolKind::Section {
                        section_index: index,
                    },
                ).local());
                self.linking.add_to_symtab(id);
            }
            customs.push((index, name, inputs, offsets, name_size));
        }

        if relocatable_output {
            let body = self.linking.encode(
                self.db,
                self.objects,
                &self.segments,
                &self.init_functions,
            )?;
            self.add_section(OutputSection::custom("linking", body));
            self.create_reloc_sections(code_section, data_section, &customs)?;
        }

        let have_names =
            !self.functions.functions.is_empty() || self.imports.num_imported_functions() > 0;
        if !self.args.strip_all {
            if have_names {
                let body =
                    encode_name_section(self.db, &self.imports, &self.functions, self.objects);
                self.add_section(OutputSection::custom("name", body));
            }
            if self.producers.is_needed() {
                let body = self.producers.encode();
                self.add_section(OutputSection::custom("producers", body));
            }
        }
        if !self.target_features.features.is_empty() {
            let body = self.target_features.encode();
            self.add_section(OutputSection::custom("target_features", body));
        }
        Ok(())
    }

    /// Synthesizes a `reloc.*` mirror for every output section that still
    /// carries relocations.
    fn create_reloc_sections(
        &mut self,
        code_section: Option<(u32, Vec<u64>)>,
        data_section: Option<(u32, FoldHashMap<(usize, usize), u64>)>,
        customs: &[(u32, String, Vec<(usize, usize)>, Vec<u64>, u64)],
    ) -> Result {
        if let Some((target_index, body_offsets)) = code_section {
            let mut entries = Vec::new();
            for (func, &body_offset) in self.functions.functions.iter().zip(&body_offsets) {
                let FuncRef::Object { file, func } = *func else {
                    continue;
                };
                let obj = &self.objects[file];
                for r in &obj.functions[func].relocations {
                    entries.push(self.translate_relocation(file, r, body_offset)?);
                }
            }
            if !entries.is_empty() {
                let body = encode_reloc_body(target_index, &entries);
                self.add_section(OutputSection::custom("reloc.CODE", body));
            }
        }

        if let Some((target_index, input_offsets)) = data_section {
            let mut entries = Vec::new();
            for seg in &self.segments {
                for &(file, index) in &seg.inputs {
                    let Some(&body_offset) = input_offsets.get(&(file, index)) else {
                        continue;
                    };
                    for r in &self.objects[file].segments[index].relocations {
                        entries.push(self.translate_relocation(file, r, body_offset)?);
                    }
                }
            }
            if !entries.is_empty() {
                let body = encode_reloc_body(target_index, &entries);
                self.add_section(OutputSection::custom("reloc.DATA", body));
            }
        }

        let mut reloc_customs = Vec::new();
        for (target_index, name, inputs, offsets, name_size) in customs {
            let mut entries = Vec::new();
            for (&(file, index), &payload_offset) in inputs.iter().zip(offsets) {
                for r in &self.objects[file].custom_sections[index].relocations {
                    entries.push(self.translate_relocation(
                        file,
                        r,
                        name_size + payload_offset,
                    )?);
                }
            }
            if !entries.is_empty() {
                let body = encode_reloc_body(*target_index, &entries);
                reloc_customs.push((format!("reloc.{name}"), body));
            }
        }
        for (name, body) in reloc_customs {
            self.add_section(OutputSection::custom(&name, body));
        }
        Ok(())
    }

    /// Rewrites an input relocation into output terms: chunk-relative offset
    /// to section-relative, object symbol/type index to symtab/output index.
    fn translate_relocation(
        &self,
        file: usize,
        r: &crate::input_data::Relocation,
        chunk_offset: u64,
    ) -> Result<RelocEntry> {
        let obj = &self.objects[file];
        let index = if r.ty == reloc::R_WASM_TYPE_INDEX_LEB {
            let Some(Some(mapped)) = obj.type_map.get(r.index as usize) else {
                bail!("internal error: relocation against unregistered type in {}", obj.name);
            };
            *mapped
        } else {
            let Some(&symbol) = obj.symbols.get(r.index as usize) else {
                bail!("internal error: relocation symbol out of range in {}", obj.name);
            };
            let Some(symtab_index) = self.linking.symbol_index(symbol) else {
                bail!(
                    "internal error: relocation against `{}` which is not in the symtab",
                    self.db.symbol(symbol).name
                );
            };
            symtab_index
        };
        Ok(RelocEntry {
            ty: r.ty,
            offset: chunk_offset + r.offset,
            index,
            addend: r.addend,
        })
    }

    fn create_header(&mut self) {
        self.header.extend_from_slice(&WASM_MAGIC);
        wasm::write_u32_le(&mut self.header, WASM_VERSION);
        self.file_size += self.header.len() as u64;
    }

    #[tracing::instrument(skip_all, name = "Finalize sections")]
    fn finalize_sections(&mut self) {
        for section in &mut self.output_sections {
            let size = section.finalize(self.file_size);
            self.file_size += size;
        }
    }

    fn write_header(&self, output: &mut SizedOutput) {
        output.out[..self.header.len()].copy_from_slice(&self.header);
    }

    /// Every section writes into its own disjoint range of the buffer;
    /// offsets were fixed by `finalize_sections`, so no synchronization is
    /// needed.
    #[tracing::instrument(skip_all, name = "Write sections")]
    fn write_sections(&self, output: &mut SizedOutput) {
        let mut rest: &mut [u8] = &mut output.out[self.header.len()..];
        let mut file_pos = self.header.len() as u64;
        let mut chunks = Vec::with_capacity(self.output_sections.len());
        for section in &self.output_sections {
            debug_assert_eq!(section.offset, file_pos);
            let (chunk, tail) =
                std::mem::take(&mut rest).split_at_mut(section.file_size() as usize);
            chunks.push(chunk);
            file_pos += section.file_size();
            rest = tail;
        }
        self.output_sections
            .par_iter()
            .zip(chunks.into_par_iter())
            .for_each(|(section, chunk)| section.write_to(chunk));
    }

    /// Folds the collected ABI blobs and writes the `.abi` side-file. The
    /// merger is seeded with the last ABI and then folds every ABI including
    /// the seed; the merge is key-union so the double application of the
    /// seed is harmless.
    #[tracing::instrument(skip_all, name = "Write ABI")]
    fn write_abi(&self) -> Result {
        let Some(last) = self.abis.last() else {
            return Ok(());
        };
        let Ok(seed) = serde_json::from_str(last) else {
            tracing::warn!("failed to write ABI");
            return Ok(());
        };
        let mut merger = AbiMerger::new(seed);
        for abi in &self.abis {
            let Ok(parsed) = serde_json::from_str(abi) else {
                tracing::warn!("failed to write ABI");
                return Ok(());
            };
            let merged = merger.merge(parsed)?;
            merger.set_abi(merged);
        }

        let path = self.args.abi_output_file();
        let text = merger.abi_string()?;
        if let Err(error) = std::fs::write(&path, text) {
            self.diagnostics
                .error(format!("failed to open {}: {error}", path.display()));
        }
        Ok(())
    }
}

struct RelocEntry {
    ty: u8,
    offset: u64,
    index: u32,
    addend: i64,
}

fn encode_reloc_body(target_section: u32, entries: &[RelocEntry]) -> Vec<u8> {
    let mut body = Vec::new();
    write_uleb128(&mut body, u64::from(target_section));
    write_uleb128(&mut body, entries.len() as u64);
    for entry in entries {
        body.push(entry.ty);
        write_uleb128(&mut body, entry.offset);
        write_uleb128(&mut body, u64::from(entry.index));
        if reloc::has_addend(entry.ty) {
            write_sleb128(&mut body, entry.addend);
        }
    }
    body
}
