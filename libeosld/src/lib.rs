//! Output-synthesis core of the eosld WebAssembly linker.
//!
//! The command-line driver, input parsing and symbol resolution live
//! upstream; this crate takes a resolved [`symbol_db::SymbolDb`] plus the
//! decoded input objects and produces the final `.wasm` module together
//! with the merged `.abi` side-file.

pub mod abi;
pub mod alignment;
pub mod args;
pub mod diagnostics;
pub(crate) mod dispatch;
pub mod error;
pub(crate) mod features;
pub(crate) mod file_writer;
pub mod input_data;
pub(crate) mod layout;
pub(crate) mod output_sections;
pub mod symbol;
pub mod symbol_db;
pub(crate) mod synthetic;
pub(crate) mod wasm_writer;

pub use crate::alignment::Alignment;
pub use crate::args::Args;
pub use crate::diagnostics::Diagnostics;
pub use crate::error::Result;
pub use crate::input_data::ObjectFile;
pub use crate::symbol_db::create_synthetic_symbols;
pub use crate::symbol_db::SymbolDb;
pub use crate::wasm_writer::write_output;

/// Links the given objects into `args.output_file`.
///
/// Convenience wrapper that owns the diagnostics: every reported problem
/// ends up aggregated in the returned error.
pub fn link_output(args: &Args, objects: &mut [ObjectFile], db: &mut SymbolDb) -> Result {
    let diagnostics = Diagnostics::new();
    write_output(args, objects, db, &diagnostics)
}
