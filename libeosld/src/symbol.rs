//! Symbols, as seen by the output writer.
//!
//! By the time this crate runs, resolution has already picked a winner for
//! every name, so a symbol is either a definition (pointing at the entity
//! that defines it) or an undefined reference that may become an import.
//! Entities live in the input objects or in the synthetic pools owned by
//! [`crate::symbol_db::SymbolDb`]; symbols refer to them through small
//! copyable handles rather than pointers.

use crate::error::Result;
use anyhow::bail;
use bitflags::bitflags;
use eosld_utils::wasm::Signature;
use eosld_utils::wasm::ValType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    #[default]
    Exported,
    Hidden,
    Local,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SymbolFlags: u8 {
        const LIVE = 1 << 0;
        const USED_IN_REGULAR_OBJ = 1 << 1;
        const WEAK = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalType {
    pub val_type: ValType,
    pub mutable: bool,
}

/// Where a defined function's entity lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncRef {
    Synthetic(usize),
    Object { file: usize, func: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalRef {
    Synthetic(usize),
    Object { file: usize, global: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRef {
    pub file: usize,
    pub event: usize,
}

/// Position of a data symbol within its input segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataLocation {
    pub file: usize,
    pub segment: usize,
    pub offset: u64,
}

#[derive(Debug, Clone)]
pub enum SymbolKind {
    DefinedFunction {
        func: FuncRef,
        /// Absolute function index, assigned once the import section seals.
        index: Option<u32>,
    },
    DefinedGlobal {
        global: GlobalRef,
        index: Option<u32>,
    },
    DefinedData {
        /// `None` for linker-synthesized addresses (`__heap_base` and
        /// friends, `__start_*`/`__stop_*`).
        location: Option<DataLocation>,
        size: u64,
        virtual_address: Option<u64>,
    },
    DefinedEvent {
        event: EventRef,
        index: Option<u32>,
    },
    /// Stands for an output section in relocatable output.
    Section { section_index: u32 },
    UndefinedFunction {
        signature: Signature,
        index: Option<u32>,
    },
    UndefinedGlobal {
        ty: GlobalType,
        index: Option<u32>,
    },
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub visibility: Visibility,
    pub flags: SymbolFlags,
    pub kind: SymbolKind,
}

impl Symbol {
    pub fn new(name: impl Into<String>, kind: SymbolKind) -> Symbol {
        Symbol {
            name: name.into(),
            visibility: Visibility::default(),
            flags: SymbolFlags::LIVE | SymbolFlags::USED_IN_REGULAR_OBJ,
            kind,
        }
    }

    pub fn hidden(mut self) -> Symbol {
        self.visibility = Visibility::Hidden;
        self
    }

    pub fn local(mut self) -> Symbol {
        self.visibility = Visibility::Local;
        self
    }

    pub fn weak(mut self) -> Symbol {
        self.flags |= SymbolFlags::WEAK;
        self
    }

    pub fn dead(mut self) -> Symbol {
        self.flags.remove(SymbolFlags::LIVE);
        self
    }

    pub fn is_live(&self) -> bool {
        self.flags.contains(SymbolFlags::LIVE)
    }

    pub fn is_weak(&self) -> bool {
        self.flags.contains(SymbolFlags::WEAK)
    }

    pub fn is_used_in_regular_obj(&self) -> bool {
        self.flags.contains(SymbolFlags::USED_IN_REGULAR_OBJ)
    }

    pub fn is_hidden(&self) -> bool {
        self.visibility == Visibility::Hidden
    }

    pub fn is_local(&self) -> bool {
        self.visibility == Visibility::Local
    }

    pub fn is_defined(&self) -> bool {
        !self.is_undefined()
    }

    pub fn is_undefined(&self) -> bool {
        matches!(
            self.kind,
            SymbolKind::UndefinedFunction { .. } | SymbolKind::UndefinedGlobal { .. }
        )
    }

    pub fn is_function(&self) -> bool {
        matches!(
            self.kind,
            SymbolKind::DefinedFunction { .. } | SymbolKind::UndefinedFunction { .. }
        )
    }

    pub fn is_data(&self) -> bool {
        matches!(self.kind, SymbolKind::DefinedData { .. })
    }

    /// Absolute function index of a function symbol. An error here is a
    /// sequencing bug: indices exist only after `assign_indexes` has run.
    pub fn function_index(&self) -> Result<u32> {
        match &self.kind {
            SymbolKind::DefinedFunction { index: Some(i), .. }
            | SymbolKind::UndefinedFunction { index: Some(i), .. } => Ok(*i),
            _ => bail!("internal error: no function index for `{}`", self.name),
        }
    }

    pub fn global_index(&self) -> Result<u32> {
        match &self.kind {
            SymbolKind::DefinedGlobal { index: Some(i), .. }
            | SymbolKind::UndefinedGlobal { index: Some(i), .. } => Ok(*i),
            _ => bail!("internal error: no global index for `{}`", self.name),
        }
    }

    pub fn event_index(&self) -> Result<u32> {
        match &self.kind {
            SymbolKind::DefinedEvent { index: Some(i), .. } => Ok(*i),
            _ => bail!("internal error: no event index for `{}`", self.name),
        }
    }

    pub fn virtual_address(&self) -> Result<u64> {
        match &self.kind {
            SymbolKind::DefinedData {
                virtual_address: Some(va),
                ..
            } => Ok(*va),
            _ => bail!("internal error: no virtual address for `{}`", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_live_and_exported() {
        let sym = Symbol::new(
            "apply",
            SymbolKind::UndefinedFunction {
                signature: Signature::default(),
                index: None,
            },
        );
        assert!(sym.is_live());
        assert!(sym.is_used_in_regular_obj());
        assert!(!sym.is_weak());
        assert!(sym.is_undefined());
        assert!(!sym.is_hidden());
    }

    #[test]
    fn index_access_before_assignment_is_an_error() {
        let sym = Symbol::new(
            "f",
            SymbolKind::DefinedFunction {
                func: FuncRef::Synthetic(0),
                index: None,
            },
        );
        assert!(sym.function_index().is_err());
    }
}
