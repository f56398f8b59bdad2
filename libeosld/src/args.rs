//! Linker configuration.
//!
//! Option parsing happens in the command-line driver; by the time this crate
//! runs, everything has been reduced to the flat set of knobs below. The
//! defaults match what the driver passes for a plain contract link.

use std::path::Path;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Args {
    pub output_file: PathBuf,

    pub relocatable: bool,
    pub is_pic: bool,
    pub shared: bool,
    pub shared_memory: bool,
    pub stack_first: bool,
    pub strip_debug: bool,
    pub strip_all: bool,
    pub passive_segments: bool,
    pub merge_data_segments: bool,
    pub emit_relocs: bool,
    pub import_memory: bool,
    pub export_table: bool,
    pub export_all: bool,

    pub check_features: bool,
    /// Explicit target-feature set. When present it overrides inference from
    /// the input objects.
    pub features: Option<Vec<String>>,

    pub z_stack_size: u64,
    pub global_base: u64,
    pub initial_memory: u64,
    pub max_memory: u64,

    /// Insert the time-seeded stack canary around dispatcher bodies.
    pub stack_canary: bool,
    /// The contract supplies its own entry point; never synthesize the
    /// action/notification dispatcher.
    pub other_model: bool,
}

impl Default for Args {
    fn default() -> Args {
        Args {
            output_file: PathBuf::from("a.out"),
            relocatable: false,
            is_pic: false,
            shared: false,
            shared_memory: false,
            stack_first: false,
            strip_debug: false,
            strip_all: false,
            passive_segments: false,
            merge_data_segments: true,
            emit_relocs: false,
            import_memory: false,
            export_table: false,
            export_all: false,
            check_features: true,
            features: None,
            z_stack_size: 65536,
            global_base: 1024,
            initial_memory: 0,
            max_memory: 0,
            stack_canary: false,
            other_model: false,
        }
    }
}

impl Args {
    pub fn with_output(path: impl AsRef<Path>) -> Args {
        Args {
            output_file: path.as_ref().to_path_buf(),
            ..Args::default()
        }
    }

    /// Path of the merged ABI side-file: the output path with its extension
    /// replaced by `.abi`.
    pub fn abi_output_file(&self) -> PathBuf {
        self.output_file.with_extension("abi")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_path_replaces_extension() {
        let args = Args::with_output("out/token.wasm");
        assert_eq!(args.abi_output_file(), PathBuf::from("out/token.abi"));

        let args = Args::with_output("token");
        assert_eq!(args.abi_output_file(), PathBuf::from("token.abi"));
    }
}
