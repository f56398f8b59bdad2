//! Id-addressed symbol storage.
//!
//! The writer never chases pointers between symbols, sections and objects;
//! everything is a `SymbolId` into this table. The table also owns the
//! entities the linker itself synthesizes (stub functions and globals) so
//! that they can be indexed alongside object-provided ones.

use crate::args::Args;
use crate::symbol::FuncRef;
use crate::symbol::GlobalRef;
use crate::symbol::GlobalType;
use crate::symbol::Symbol;
use crate::symbol::SymbolKind;
use crate::symbol::Visibility;
use eosld_utils::wasm::Signature;
use eosld_utils::wasm::ValType;
use foldhash::HashMap as FoldHashMap;
use foldhash::HashMapExt as _;
use std::fmt::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolId(u32);

impl SymbolId {
    pub fn from_usize(raw: usize) -> SymbolId {
        SymbolId(raw as u32)
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl Display for SymbolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// A function the linker fabricates. The body is installed later, already
/// wrapped in its ULEB128 size prefix.
#[derive(Debug)]
pub struct SyntheticFunction {
    pub name: String,
    pub signature: Signature,
    pub body: Vec<u8>,
    pub index: Option<u32>,
}

#[derive(Debug)]
pub struct SyntheticGlobal {
    pub ty: GlobalType,
    pub init: i64,
    pub index: Option<u32>,
}

/// Handles to the symbols the writer reads or writes by name. Absent
/// entries mean the corresponding feature is off for this link.
#[derive(Debug, Default)]
pub struct WellKnown {
    pub stack_pointer: Option<SymbolId>,
    pub tls_base: Option<SymbolId>,
    pub tls_size: Option<SymbolId>,
    pub global_base: Option<SymbolId>,
    pub dso_handle: Option<SymbolId>,
    pub data_end: Option<SymbolId>,
    pub heap_base: Option<SymbolId>,
    pub call_ctors: Option<SymbolId>,
    pub init_memory: Option<SymbolId>,
    pub apply_relocs: Option<SymbolId>,
    pub init_tls: Option<SymbolId>,
    pub stack_canary: Option<SymbolId>,
    pub entry: Option<SymbolId>,
    pub sync_call_entry: Option<SymbolId>,
}

#[derive(Default)]
pub struct SymbolDb {
    symbols: Vec<Symbol>,
    names: FoldHashMap<String, SymbolId>,
    pub synthetic_functions: Vec<SyntheticFunction>,
    pub synthetic_globals: Vec<SyntheticGlobal>,
    pub well_known: WellKnown,
}

impl SymbolDb {
    pub fn new() -> SymbolDb {
        SymbolDb {
            symbols: Vec::new(),
            names: FoldHashMap::new(),
            synthetic_functions: Vec::new(),
            synthetic_globals: Vec::new(),
            well_known: WellKnown::default(),
        }
    }

    /// Adds a symbol, replacing any existing symbol with the same name.
    /// Resolution has already run, so a replacement is always an upgrade
    /// (e.g. an undefined reference becoming a linker-synthesized
    /// definition).
    pub fn add(&mut self, symbol: Symbol) -> SymbolId {
        if let Some(&id) = self.names.get(&symbol.name) {
            self.symbols[id.as_usize()] = symbol;
            return id;
        }
        let id = SymbolId::from_usize(self.symbols.len());
        self.names.insert(symbol.name.clone(), id);
        self.symbols.push(symbol);
        id
    }

    pub fn find(&self, name: &str) -> Option<SymbolId> {
        self.names.get(name).copied()
    }

    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.as_usize()]
    }

    pub fn symbol_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id.as_usize()]
    }

    pub fn num_symbols(&self) -> usize {
        self.symbols.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SymbolId, &Symbol)> {
        self.symbols
            .iter()
            .enumerate()
            .map(|(raw, sym)| (SymbolId::from_usize(raw), sym))
    }

    /// True when `name` is missing or only referenced, never defined.
    pub fn is_undefined(&self, name: &str) -> bool {
        match self.find(name) {
            Some(id) => self.symbol(id).is_undefined(),
            None => true,
        }
    }

    pub fn add_synthetic_function(
        &mut self,
        name: &str,
        signature: Signature,
        visibility: Visibility,
    ) -> SymbolId {
        let func = self.synthetic_functions.len();
        self.synthetic_functions.push(SyntheticFunction {
            name: name.to_owned(),
            signature,
            body: Vec::new(),
            index: None,
        });
        let mut symbol = Symbol::new(
            name,
            SymbolKind::DefinedFunction {
                func: FuncRef::Synthetic(func),
                index: None,
            },
        );
        symbol.visibility = visibility;
        self.add(symbol)
    }

    pub fn add_synthetic_global(
        &mut self,
        name: &str,
        ty: GlobalType,
        init: i64,
        visibility: Visibility,
    ) -> SymbolId {
        let global = self.synthetic_globals.len();
        self.synthetic_globals.push(SyntheticGlobal {
            ty,
            init,
            index: None,
        });
        let mut symbol = Symbol::new(
            name,
            SymbolKind::DefinedGlobal {
                global: GlobalRef::Synthetic(global),
                index: None,
            },
        );
        symbol.visibility = visibility;
        self.add(symbol)
    }

    fn add_synthetic_data_symbol(&mut self, name: &str) -> SymbolId {
        self.add(
            Symbol::new(
                name,
                SymbolKind::DefinedData {
                    location: None,
                    size: 0,
                    virtual_address: None,
                },
            )
            .hidden(),
        )
    }

    /// Defines `name` at `virtual_address`, but only if something already
    /// refers to it without defining it. Used for the per-segment
    /// `__start_*`/`__stop_*` symbols.
    pub fn add_optional_data_symbol(&mut self, name: &str, virtual_address: u64) {
        let Some(id) = self.find(name) else { return };
        if self.symbol(id).is_defined() {
            return;
        }
        let symbol = self.symbol_mut(id);
        symbol.kind = SymbolKind::DefinedData {
            location: None,
            size: 0,
            virtual_address: Some(virtual_address),
        };
        symbol.visibility = Visibility::Hidden;
    }

    pub fn set_virtual_address(&mut self, id: SymbolId, va: u64) {
        if let SymbolKind::DefinedData {
            virtual_address, ..
        } = &mut self.symbol_mut(id).kind
        {
            *virtual_address = Some(va);
        }
    }

    /// Rewrites the init expression of a synthetic global
    /// (`__stack_pointer`, `__tls_size`). A no-op for anything else.
    pub fn set_global_init(&mut self, id: SymbolId, value: i64) {
        if let SymbolKind::DefinedGlobal {
            global: GlobalRef::Synthetic(i),
            ..
        } = self.symbol(id).kind
        {
            self.synthetic_globals[i].init = value;
        }
    }

    /// Signature of a defined function's entity, wherever it lives.
    pub fn function_signature<'a>(
        &'a self,
        objects: &'a [crate::input_data::ObjectFile],
        func: FuncRef,
    ) -> &'a Signature {
        match func {
            FuncRef::Synthetic(i) => &self.synthetic_functions[i].signature,
            FuncRef::Object { file, func } => {
                let f = &objects[file].functions[func];
                &objects[file].types[f.type_index as usize]
            }
        }
    }

    /// Installs a synthesized body into a synthetic function symbol.
    pub fn set_function_body(&mut self, id: SymbolId, body: Vec<u8>) {
        if let SymbolKind::DefinedFunction {
            func: FuncRef::Synthetic(i),
            ..
        } = self.symbol(id).kind
        {
            self.synthetic_functions[i].body = body;
        }
    }
}

/// Creates the linker-defined symbols this configuration needs, including
/// the dispatcher entry points when the inputs leave them undefined. Must
/// run after object symbols are registered and before the writer pipeline;
/// index assignment has to see every synthetic function.
pub fn create_synthetic_symbols(db: &mut SymbolDb, args: &Args, objects: &[crate::input_data::ObjectFile]) {
    // Relocatable output carries init functions and layout in the linking
    // section instead of synthesized definitions.
    if args.relocatable {
        return;
    }

    let void = Signature::default();
    let i32_mut = GlobalType {
        val_type: ValType::I32,
        mutable: true,
    };
    let i32_const = GlobalType {
        val_type: ValType::I32,
        mutable: false,
    };

    db.well_known.call_ctors =
        Some(db.add_synthetic_function("__wasm_call_ctors", void.clone(), Visibility::Hidden));
    db.well_known.stack_pointer =
        Some(db.add_synthetic_global("__stack_pointer", i32_mut, 0, Visibility::Hidden));

    if args.passive_segments {
        db.well_known.init_memory = Some(db.add_synthetic_function(
            "__wasm_init_memory",
            void.clone(),
            Visibility::Hidden,
        ));
    }
    if args.is_pic {
        db.well_known.apply_relocs = Some(db.add_synthetic_function(
            "__wasm_apply_relocs",
            void.clone(),
            Visibility::Hidden,
        ));
    }
    if args.shared_memory && !args.relocatable && !args.shared {
        db.well_known.init_tls = Some(db.add_synthetic_function(
            "__wasm_init_tls",
            Signature::new(vec![ValType::I32], vec![]),
            Visibility::Exported,
        ));
        db.well_known.tls_base =
            Some(db.add_synthetic_global("__tls_base", i32_mut, 0, Visibility::Hidden));
        db.well_known.tls_size =
            Some(db.add_synthetic_global("__tls_size", i32_const, 0, Visibility::Hidden));
    }
    if args.stack_canary {
        let i64_mut = GlobalType {
            val_type: ValType::I64,
            mutable: true,
        };
        db.well_known.stack_canary =
            Some(db.add_synthetic_global("__stack_canary", i64_mut, 0, Visibility::Hidden));
    }

    db.well_known.global_base = Some(db.add_synthetic_data_symbol("__global_base"));
    db.well_known.dso_handle = Some(db.add_synthetic_data_symbol("__dso_handle"));
    db.well_known.data_end = Some(db.add_synthetic_data_symbol("__data_end"));
    db.well_known.heap_base = Some(db.add_synthetic_data_symbol("__heap_base"));

    // Dispatcher entry points are synthesized only when the contract leaves
    // them undefined (and, for sync calls, actually registers calls).
    if !args.other_model && db.is_undefined("apply") {
        db.well_known.entry = Some(db.add_synthetic_function(
            "apply",
            Signature::new(vec![ValType::I64, ValType::I64, ValType::I64], vec![]),
            Visibility::Exported,
        ));
    }
    let has_sync_calls = objects.iter().any(|obj| !obj.sync_calls.is_empty());
    if has_sync_calls && db.is_undefined("sync_call") {
        db.well_known.sync_call_entry = Some(db.add_synthetic_function(
            "sync_call",
            Signature::new(
                vec![ValType::I64, ValType::I64, ValType::I32],
                vec![ValType::I64],
            ),
            Visibility::Exported,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_replaces_existing_name() {
        let mut db = SymbolDb::new();
        let first = db.add(Symbol::new(
            "apply",
            SymbolKind::UndefinedFunction {
                signature: Signature::default(),
                index: None,
            },
        ));
        assert!(db.is_undefined("apply"));

        let second = db.add_synthetic_function("apply", Signature::default(), Visibility::Exported);
        assert_eq!(first, second);
        assert!(!db.is_undefined("apply"));
        assert_eq!(db.num_symbols(), 1);
    }

    #[test]
    fn optional_data_symbol_only_upgrades_references() {
        let mut db = SymbolDb::new();
        // Nothing refers to it: stays absent.
        db.add_optional_data_symbol("__start_mysec", 1024);
        assert!(db.find("__start_mysec").is_none());

        let id = db.add(Symbol::new(
            "__start_mysec",
            SymbolKind::UndefinedGlobal {
                ty: GlobalType {
                    val_type: ValType::I32,
                    mutable: false,
                },
                index: None,
            },
        ));
        db.add_optional_data_symbol("__start_mysec", 1024);
        assert_eq!(db.symbol(id).virtual_address().unwrap(), 1024);
    }

    #[test]
    fn synthetic_symbols_respect_configuration() {
        let mut db = SymbolDb::new();
        create_synthetic_symbols(&mut db, &Args::default(), &[]);
        assert!(db.well_known.call_ctors.is_some());
        assert!(db.well_known.stack_pointer.is_some());
        assert!(db.well_known.init_memory.is_none());
        assert!(db.well_known.init_tls.is_none());

        let mut db = SymbolDb::new();
        let args = Args {
            passive_segments: true,
            shared_memory: true,
            stack_canary: true,
            ..Args::default()
        };
        create_synthetic_symbols(&mut db, &args, &[]);
        assert!(db.well_known.init_memory.is_some());
        assert!(db.well_known.init_tls.is_some());
        assert!(db.well_known.tls_size.is_some());
        assert!(db.well_known.stack_canary.is_some());
    }
}
