//! Data-segment planning and linear-memory layout.
//!
//! The default memory layout is, from low to high:
//!
//!  - initialized data (starting at `global_base`)
//!  - explicit stack (`z_stack_size`)
//!  - heap start / unallocated
//!
//! `stack_first` places the stack before any static data, which makes stack
//! overflow trap immediately instead of silently overwriting globals, at the
//! cost of larger offsets on every static load and store.

use crate::alignment;
use crate::alignment::Alignment;
use crate::args::Args;
use crate::diagnostics::Diagnostics;
use crate::input_data::ObjectFile;
use crate::symbol::SymbolKind;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolId;
use eosld_utils::utils::align_to;
use eosld_utils::utils::is_valid_c_identifier;
use eosld_utils::wasm::SEGMENT_IS_PASSIVE;
use eosld_utils::wasm::WASM_PAGE_SIZE;
use indexmap::IndexMap;

/// Input segments merged under one canonical name.
#[derive(Debug)]
pub struct OutputSegment {
    pub name: String,
    pub index: u32,
    pub alignment: Alignment,
    pub size: u64,
    pub start_va: u64,
    pub init_flags: u32,
    /// `(file, segment)` handles into the input objects, in merge order.
    pub inputs: Vec<(usize, usize)>,
}

impl OutputSegment {
    pub fn is_passive(&self) -> bool {
        self.init_flags & SEGMENT_IS_PASSIVE != 0
    }

    pub fn num_relocations(&self, objects: &[ObjectFile]) -> usize {
        self.inputs
            .iter()
            .map(|&(file, seg)| objects[file].segments[seg].relocations.len())
            .sum()
    }
}

/// Canonical output name for an input data segment.
pub fn output_segment_name<'a>(args: &Args, name: &'a str) -> &'a str {
    // With PIC code we only support a single data segment since there is
    // only a single __memory_base to use as a base address.
    if args.is_pic {
        return ".data";
    }
    // There is only one thread-local segment, so .tbss must merge into
    // .tdata so they share offsets, even under --no-merge-data-segments.
    if name.starts_with(".tdata") || name.starts_with(".tbss") {
        return ".tdata";
    }
    if !args.merge_data_segments {
        return name;
    }
    if name.starts_with(".text.") {
        return ".text";
    }
    if name.starts_with(".data.") {
        return ".data";
    }
    if name.starts_with(".bss.") {
        return ".bss";
    }
    if name.starts_with(".rodata.") {
        return ".rodata";
    }
    name
}

/// Groups live input segments into output segments and collects each
/// object's ABI blob. Records the assigned output segment and offset on
/// every placed input segment.
#[tracing::instrument(skip_all, name = "Create output segments")]
pub fn create_output_segments(
    args: &Args,
    objects: &mut [ObjectFile],
    abis: &mut Vec<String>,
) -> Vec<OutputSegment> {
    let mut segments: Vec<OutputSegment> = Vec::new();
    let mut by_name: IndexMap<String, usize> = IndexMap::new();

    for (file, obj) in objects.iter_mut().enumerate() {
        if !obj.abi.is_empty() {
            abis.push(obj.abi.clone());
        }
        for (seg_index, segment) in obj.segments.iter_mut().enumerate() {
            if !segment.live {
                continue;
            }
            let name = output_segment_name(args, &segment.name);
            let slot = *by_name.entry(name.to_owned()).or_insert_with(|| {
                let index = segments.len();
                tracing::debug!("new segment: {name}");
                let passive = args.passive_segments || name == ".tdata";
                segments.push(OutputSegment {
                    name: name.to_owned(),
                    index: index as u32,
                    alignment: alignment::MIN,
                    size: 0,
                    start_va: 0,
                    init_flags: if passive { SEGMENT_IS_PASSIVE } else { 0 },
                    inputs: Vec::new(),
                });
                index
            });

            let out = &mut segments[slot];
            out.alignment = out.alignment.max(segment.alignment);
            out.size = segment.alignment.align_up(out.size);
            segment.output_segment = Some(out.index);
            segment.output_offset = out.size;
            out.size += segment.size();
            out.inputs.push((file, seg_index));
        }
    }
    segments
}

/// The memory shape the memory and dylink sections publish.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryLayout {
    pub num_pages: u64,
    pub max_pages: Option<u64>,
    pub mem_size: u64,
    pub mem_align: u8,
}

fn place_stack(args: &Args, diagnostics: &Diagnostics, db: &mut SymbolDb, memory_ptr: &mut u64) {
    if args.relocatable || args.is_pic {
        return;
    }
    *memory_ptr = alignment::STACK.align_up(*memory_ptr);
    if !alignment::STACK.is_aligned(args.z_stack_size) {
        diagnostics.error(format!(
            "stack size must be {}-byte aligned",
            alignment::STACK.value()
        ));
    }
    tracing::debug!("mem: stack size  = {}", args.z_stack_size);
    tracing::debug!("mem: stack base  = {memory_ptr}");
    *memory_ptr += args.z_stack_size;
    if let Some(sp) = db.well_known.stack_pointer {
        db.set_global_init(sp, *memory_ptr as i64);
    }
    tracing::debug!("mem: stack top   = {memory_ptr}");
}

fn set_va_if_live(db: &mut SymbolDb, id: Option<SymbolId>, va: u64) {
    if let Some(id) = id {
        if db.symbol(id).is_live() {
            db.set_virtual_address(id, va);
        }
    }
}

/// Fixes the memory layout of the output binary: assigns a start address to
/// every output segment and to the explicit stack region, and publishes the
/// well-known layout symbols.
#[tracing::instrument(skip_all, name = "Layout memory")]
pub fn layout_memory(
    args: &Args,
    global_base: u64,
    diagnostics: &Diagnostics,
    db: &mut SymbolDb,
    segments: &mut [OutputSegment],
) -> MemoryLayout {
    let mut memory_ptr: u64 = 0;

    if args.stack_first {
        place_stack(args, diagnostics, db, &mut memory_ptr);
    } else {
        memory_ptr = global_base;
        tracing::debug!("mem: global base = {global_base}");
    }

    set_va_if_live(db, db.well_known.global_base, global_base);

    let data_start = memory_ptr;
    // __dso_handle points at the start of the data segments; any unique
    // address would do.
    set_va_if_live(db, db.well_known.dso_handle, data_start);

    let mut mem_align = 0u8;
    for seg in segments.iter_mut() {
        mem_align = mem_align.max(seg.alignment.exponent);
        memory_ptr = seg.alignment.align_up(memory_ptr);
        seg.start_va = memory_ptr;
        tracing::debug!(
            "mem: {:<15} offset={:<8} size={:<8} align={}",
            seg.name,
            memory_ptr,
            seg.size,
            seg.alignment.exponent
        );
        memory_ptr += seg.size;

        if seg.name == ".tdata" {
            if let Some(tls_size) = db.well_known.tls_size {
                db.set_global_init(tls_size, seg.size as i64);
            }
        }
    }

    set_va_if_live(db, db.well_known.data_end, memory_ptr);
    tracing::debug!("mem: static data = {}", memory_ptr - data_start);

    if args.shared {
        return MemoryLayout {
            num_pages: 0,
            max_pages: None,
            mem_size: memory_ptr,
            mem_align,
        };
    }

    if !args.stack_first {
        place_stack(args, diagnostics, db, &mut memory_ptr);
    }

    // __heap_base directly follows the stack or global data, so a
    // malloc/brk implementation can grow the heap from there.
    tracing::debug!("mem: heap base   = {memory_ptr}");
    set_va_if_live(db, db.well_known.heap_base, memory_ptr);

    if args.initial_memory != 0 {
        if args.initial_memory % WASM_PAGE_SIZE != 0 {
            diagnostics.error(format!(
                "initial memory must be {WASM_PAGE_SIZE}-byte aligned"
            ));
        }
        if memory_ptr > args.initial_memory {
            diagnostics.error(format!("initial memory too small, {memory_ptr} bytes needed"));
        } else {
            memory_ptr = args.initial_memory;
        }
    }

    let mem_size = memory_ptr;
    let num_pages = align_to(memory_ptr, WASM_PAGE_SIZE) / WASM_PAGE_SIZE;
    tracing::debug!("mem: total pages = {num_pages}");

    // Check the maximum if explicitly supplied or required by shared memory.
    let mut max_pages = None;
    if args.max_memory != 0 || args.shared_memory {
        if args.max_memory % WASM_PAGE_SIZE != 0 {
            diagnostics.error(format!(
                "maximum memory must be {WASM_PAGE_SIZE}-byte aligned"
            ));
        }
        if memory_ptr > args.max_memory {
            diagnostics.error(format!("maximum memory too small, {memory_ptr} bytes needed"));
        }
        max_pages = Some(args.max_memory / WASM_PAGE_SIZE);
        tracing::debug!("mem: max pages   = {}", args.max_memory / WASM_PAGE_SIZE);
    }

    MemoryLayout {
        num_pages,
        max_pages,
        mem_size,
        mem_align,
    }
}

/// Computes virtual addresses for data symbols that live inside placed
/// segments. Must run after `layout_memory`.
pub fn assign_data_symbol_addresses(
    db: &mut SymbolDb,
    objects: &[ObjectFile],
    segments: &[OutputSegment],
) {
    for raw in 0..db.num_symbols() {
        let id = SymbolId::from_usize(raw);
        let SymbolKind::DefinedData {
            location: Some(location),
            ..
        } = db.symbol(id).kind
        else {
            continue;
        };
        let segment = &objects[location.file].segments[location.segment];
        let Some(out_index) = segment.output_segment else {
            continue;
        };
        let va = segments[out_index as usize].start_va + segment.output_offset + location.offset;
        db.set_virtual_address(id, va);
    }
}

/// If a section name is valid as a C identifier (rare, because of the
/// leading '.'), define `__start_<name>` and `__stop_<name>` at its bounds
/// for any code that asked for them.
pub fn add_start_stop_symbols(db: &mut SymbolDb, seg: &OutputSegment) {
    if !is_valid_c_identifier(&seg.name) {
        return;
    }
    db.add_optional_data_symbol(&format!("__start_{}", seg.name), seg.start_va);
    db.add_optional_data_symbol(&format!("__stop_{}", seg.name), seg.start_va + seg.size);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input_data::InputSegment;
    use crate::symbol_db::create_synthetic_symbols;
    use crate::symbol_db::SymbolDb;

    fn seg(name: &str, align: u64, size: usize) -> InputSegment {
        InputSegment::new(name, Alignment::new(align).unwrap(), vec![0xaa; size])
    }

    fn plan(args: &Args, objects: &mut [ObjectFile]) -> Vec<OutputSegment> {
        let mut abis = Vec::new();
        create_output_segments(args, objects, &mut abis)
    }

    #[test]
    fn canonical_names() {
        let args = Args::default();
        assert_eq!(output_segment_name(&args, ".data.foo"), ".data");
        assert_eq!(output_segment_name(&args, ".rodata.str1.1"), ".rodata");
        assert_eq!(output_segment_name(&args, ".tbss.x"), ".tdata");
        assert_eq!(output_segment_name(&args, ".tdata"), ".tdata");
        assert_eq!(output_segment_name(&args, ".custom"), ".custom");

        let no_merge = Args {
            merge_data_segments: false,
            ..Args::default()
        };
        assert_eq!(output_segment_name(&no_merge, ".data.foo"), ".data.foo");
        assert_eq!(output_segment_name(&no_merge, ".tbss.x"), ".tdata");

        let pic = Args {
            is_pic: true,
            ..Args::default()
        };
        assert_eq!(output_segment_name(&pic, ".rodata.str1.1"), ".data");
        assert_eq!(output_segment_name(&pic, ".tdata"), ".data");
    }

    #[test]
    fn merges_and_places_input_segments() {
        let args = Args::default();
        let mut obj = ObjectFile::new("a.o");
        obj.segments.push(seg(".data.a", 4, 10));
        obj.segments.push(seg(".data.b", 8, 3));
        let mut dead = seg(".data.dead", 1, 100);
        dead.live = false;
        obj.segments.push(dead);
        let mut objects = vec![obj];

        let segments = plan(&args, &mut objects);
        assert_eq!(segments.len(), 1);
        let out = &segments[0];
        assert_eq!(out.name, ".data");
        assert_eq!(out.alignment.value(), 8);
        // 10 bytes, aligned up to 16 for the second input, plus 3.
        assert_eq!(out.size, 19);
        assert_eq!(objects[0].segments[0].output_offset, 0);
        assert_eq!(objects[0].segments[1].output_offset, 16);
        assert!(objects[0].segments[2].output_segment.is_none());
    }

    #[test]
    fn tdata_and_tbss_merge_into_one_passive_segment() {
        let args = Args::default();
        let mut obj = ObjectFile::new("a.o");
        obj.segments.push(seg(".tdata", 4, 8));
        obj.segments.push(seg(".tbss", 4, 4));
        let mut objects = vec![obj];

        let segments = plan(&args, &mut objects);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].name, ".tdata");
        assert!(segments[0].is_passive());
    }

    #[test]
    fn collects_abis_once_per_object() {
        let args = Args::default();
        let mut a = ObjectFile::new("a.o");
        a.abi = "{\"version\":\"eosio::abi/1.1\"}".to_owned();
        a.segments.push(seg(".data.x", 1, 1));
        a.segments.push(seg(".data.y", 1, 1));
        let b = ObjectFile::new("b.o");
        let mut objects = vec![a, b];

        let mut abis = Vec::new();
        create_output_segments(&args, &mut objects, &mut abis);
        assert_eq!(abis.len(), 1);
    }

    #[test]
    fn default_layout_places_data_then_stack_then_heap() {
        let args = Args::default();
        let diagnostics = Diagnostics::new();
        let mut db = SymbolDb::new();
        create_synthetic_symbols(&mut db, &args, &[]);

        let mut obj = ObjectFile::new("a.o");
        obj.segments.push(seg(".data", 16, 100));
        let mut objects = vec![obj];
        let mut segments = plan(&args, &mut objects);

        let layout = layout_memory(&args, args.global_base, &diagnostics, &mut db, &mut segments);
        assert!(!diagnostics.has_errors());
        assert_eq!(segments[0].start_va, 1024);

        let data_end = db
            .symbol(db.well_known.data_end.unwrap())
            .virtual_address()
            .unwrap();
        assert_eq!(data_end, 1124);

        let heap_base = db
            .symbol(db.well_known.heap_base.unwrap())
            .virtual_address()
            .unwrap();
        // Stack: aligned data end + 64 KiB.
        assert_eq!(heap_base, 1136 + 65536);
        assert_eq!(layout.num_pages, 2);
    }

    #[test]
    fn stack_first_layout() {
        let args = Args {
            stack_first: true,
            z_stack_size: 65536,
            global_base: 1024,
            ..Args::default()
        };
        let diagnostics = Diagnostics::new();
        let mut db = SymbolDb::new();
        create_synthetic_symbols(&mut db, &args, &[]);

        let mut obj = ObjectFile::new("a.o");
        obj.segments.push(seg(".data", 16, 1024));
        let mut objects = vec![obj];
        let mut segments = plan(&args, &mut objects);

        layout_memory(&args, args.global_base, &diagnostics, &mut db, &mut segments);
        assert!(!diagnostics.has_errors());

        // Stack occupies [0, 65536); __stack_pointer starts at its top.
        assert_eq!(db.synthetic_globals[0].init, 65536);
        assert_eq!(segments[0].start_va, 65536);
        let data_end = db
            .symbol(db.well_known.data_end.unwrap())
            .virtual_address()
            .unwrap();
        assert!(data_end >= 66560);
    }

    #[test]
    fn tdata_sets_tls_size_init() {
        let args = Args {
            shared_memory: true,
            max_memory: 2 * 65536,
            ..Args::default()
        };
        let diagnostics = Diagnostics::new();
        let mut db = SymbolDb::new();
        create_synthetic_symbols(&mut db, &args, &[]);

        let mut obj = ObjectFile::new("a.o");
        obj.segments.push(seg(".tdata", 4, 24));
        let mut objects = vec![obj];
        let mut segments = plan(&args, &mut objects);

        layout_memory(&args, args.global_base, &diagnostics, &mut db, &mut segments);
        let tls_size = db.well_known.tls_size.unwrap();
        let crate::symbol::SymbolKind::DefinedGlobal {
            global: crate::symbol::GlobalRef::Synthetic(i),
            ..
        } = db.symbol(tls_size).kind
        else {
            panic!("tls_size should be a synthetic global");
        };
        assert_eq!(db.synthetic_globals[i].init, 24);
    }

    #[test]
    fn misaligned_stack_size_is_reported() {
        let args = Args {
            z_stack_size: 1000,
            ..Args::default()
        };
        let diagnostics = Diagnostics::new();
        let mut db = SymbolDb::new();
        create_synthetic_symbols(&mut db, &args, &[]);
        let mut segments = Vec::new();
        layout_memory(&args, args.global_base, &diagnostics, &mut db, &mut segments);
        assert!(diagnostics
            .messages()
            .iter()
            .any(|m| m.contains("stack size must be 16-byte aligned")));
    }

    #[test]
    fn undersized_initial_memory_is_reported() {
        let args = Args {
            initial_memory: 65536,
            ..Args::default()
        };
        let diagnostics = Diagnostics::new();
        let mut db = SymbolDb::new();
        create_synthetic_symbols(&mut db, &args, &[]);

        let mut obj = ObjectFile::new("a.o");
        obj.segments.push(seg(".data", 1, 100_000));
        let mut objects = vec![obj];
        let mut segments = plan(&args, &mut objects);

        layout_memory(&args, args.global_base, &diagnostics, &mut db, &mut segments);
        assert!(diagnostics
            .messages()
            .iter()
            .any(|m| m.contains("initial memory too small")));
    }

    #[test]
    fn segment_addresses_respect_alignment_and_do_not_overlap() {
        let args = Args {
            merge_data_segments: false,
            ..Args::default()
        };
        let diagnostics = Diagnostics::new();
        let mut db = SymbolDb::new();
        create_synthetic_symbols(&mut db, &args, &[]);

        let mut obj = ObjectFile::new("a.o");
        obj.segments.push(seg(".rodata", 16, 7));
        obj.segments.push(seg(".data", 64, 100));
        obj.segments.push(seg(".bss", 8, 3));
        let mut objects = vec![obj];
        let mut segments = plan(&args, &mut objects);

        layout_memory(&args, args.global_base, &diagnostics, &mut db, &mut segments);
        for pair in segments.windows(2) {
            assert!(pair[0].start_va + pair[0].size <= pair[1].start_va);
        }
        for seg in &segments {
            assert_eq!(seg.start_va % seg.alignment.value(), 0);
        }
    }

    #[test]
    fn start_stop_symbols_only_for_c_identifiers() {
        let mut db = SymbolDb::new();
        db.add(crate::symbol::Symbol::new(
            "__start_mysec",
            SymbolKind::UndefinedGlobal {
                ty: crate::symbol::GlobalType {
                    val_type: eosld_utils::wasm::ValType::I32,
                    mutable: false,
                },
                index: None,
            },
        ));

        let mysec = OutputSegment {
            name: "mysec".to_owned(),
            index: 0,
            alignment: alignment::MIN,
            size: 16,
            start_va: 2048,
            init_flags: 0,
            inputs: Vec::new(),
        };
        add_start_stop_symbols(&mut db, &mysec);
        let id = db.find("__start_mysec").unwrap();
        assert_eq!(db.symbol(id).virtual_address().unwrap(), 2048);

        let dotted = OutputSegment {
            name: ".data".to_owned(),
            ..mysec
        };
        add_start_stop_symbols(&mut db, &dotted);
        assert!(db.find("__start_.data").is_none());
    }
}
