//! End-to-end writer tests: build in-memory contract objects, link them to
//! a real file, and walk the emitted module's sections.

use eosld_utils::wasm::Signature;
use eosld_utils::wasm::ValType;
use libeosld::create_synthetic_symbols;
use libeosld::input_data::InputFunction;
use libeosld::input_data::InputSegment;
use libeosld::input_data::ProducerInfo;
use libeosld::link_output;
use libeosld::symbol::FuncRef;
use libeosld::symbol::Symbol;
use libeosld::symbol::SymbolKind;
use libeosld::Args;
use libeosld::ObjectFile;
use libeosld::SymbolDb;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

/// Makes the writer's phase logs visible under `RUST_LOG`. Tests share one
/// process, so only the first call installs the subscriber.
fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Reader<'a> {
        Reader { bytes, pos: 0 }
    }

    fn u8(&mut self) -> u8 {
        let b = self.bytes[self.pos];
        self.pos += 1;
        b
    }

    fn uleb(&mut self) -> u64 {
        let mut rest = &self.bytes[self.pos..];
        let before = rest.len();
        let value = leb128::read::unsigned(&mut rest).unwrap();
        self.pos += before - rest.len();
        value
    }

    fn take(&mut self, n: usize) -> &'a [u8] {
        let chunk = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        chunk
    }

    fn str(&mut self) -> String {
        let len = self.uleb() as usize;
        String::from_utf8(self.take(len).to_vec()).unwrap()
    }

    fn done(&self) -> bool {
        self.pos == self.bytes.len()
    }
}

struct Section {
    id: u8,
    name: Option<String>,
    payload: Vec<u8>,
}

/// Parses the module header and splits the byte stream into sections,
/// asserting that every ULEB-prefixed length is consistent.
fn parse_sections(bytes: &[u8]) -> Vec<Section> {
    let mut r = Reader::new(bytes);
    assert_eq!(r.take(4), b"\0asm", "wasm magic");
    assert_eq!(r.take(4), 1u32.to_le_bytes(), "wasm version");

    let mut sections = Vec::new();
    while !r.done() {
        let id = r.u8();
        let size = r.uleb() as usize;
        let mut body = Reader::new(r.take(size));
        let name = (id == 0).then(|| body.str());
        sections.push(Section {
            id,
            name,
            payload: body.bytes[body.pos..].to_vec(),
        });
    }
    sections
}

/// Rank of each non-custom section id in the canonical module order.
fn rank(id: u8) -> usize {
    [1u8, 2, 3, 4, 5, 6, 13, 7, 8, 9, 12, 10, 11]
        .iter()
        .position(|&x| x == id)
        .unwrap_or_else(|| panic!("unknown section id {id}"))
}

fn assert_canonical_order(sections: &[Section]) {
    let mut last_rank = None;
    let mut seen_custom_tail = false;
    for section in sections {
        if section.id == 0 {
            seen_custom_tail = true;
            continue;
        }
        assert!(
            !seen_custom_tail,
            "standard section id {} after custom sections",
            section.id
        );
        let r = rank(section.id);
        if let Some(last) = last_rank {
            assert!(r > last, "section id {} out of order", section.id);
        }
        last_rank = Some(r);
    }
}

fn exports(sections: &[Section]) -> Vec<(String, u8, u32)> {
    let Some(section) = sections.iter().find(|s| s.id == 7) else {
        return Vec::new();
    };
    let mut r = Reader::new(&section.payload);
    let count = r.uleb();
    (0..count)
        .map(|_| {
            let name = r.str();
            let kind = r.u8();
            let index = r.uleb() as u32;
            (name, kind, index)
        })
        .collect()
}

fn import_function(db: &mut SymbolDb, name: &str, params: Vec<ValType>, results: Vec<ValType>) {
    db.add(Symbol::new(
        name,
        SymbolKind::UndefinedFunction {
            signature: Signature::new(params, results),
            index: None,
        },
    ));
}

fn define_object_function(
    db: &mut SymbolDb,
    obj: &mut ObjectFile,
    name: &str,
    params: Vec<ValType>,
    results: Vec<ValType>,
) {
    let type_index = obj.add_type(Signature::new(params, results));
    let func = obj.functions.len();
    obj.functions.push(InputFunction::new(
        name,
        type_index,
        libeosld::input_data::trivial_function_body(),
    ));
    db.add(
        Symbol::new(
            name,
            SymbolKind::DefinedFunction {
                func: FuncRef::Object { file: 0, func },
                index: None,
            },
        )
        .hidden(),
    );
}

fn seg(name: &str, align: u64, data: Vec<u8>) -> InputSegment {
    InputSegment::new(name, libeosld::Alignment::new(align).unwrap(), data)
}

#[test]
fn links_a_token_contract() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let args = Args::with_output(dir.path().join("token.wasm"));

    let mut obj = ObjectFile::new("token.o");
    obj.abi = r#"{"version":"eosio::abi/1.1","actions":[{"name":"transfer","type":"transfer"}]}"#
        .to_owned();
    obj.producers.languages.push(("C++".to_owned(), "17".to_owned()));
    obj.producers
        .processed_by
        .push(("eosio-cpp".to_owned(), "1.8".to_owned()));
    obj.segments.push(seg(".data.balances", 8, vec![0; 16]));
    obj.segments.push(seg(".rodata.str1.1", 1, b"token".to_vec()));
    obj.actions = vec![
        "transfer:transfer_handler".to_owned(),
        "issue:issue_handler".to_owned(),
    ];

    let mut db = SymbolDb::new();
    import_function(
        &mut db,
        "eosio_set_contract_name",
        vec![ValType::I64],
        vec![],
    );
    import_function(
        &mut db,
        "eosio_assert_code",
        vec![ValType::I32, ValType::I64],
        vec![],
    );
    define_object_function(
        &mut db,
        &mut obj,
        "transfer_handler",
        vec![ValType::I64, ValType::I64],
        vec![],
    );
    define_object_function(
        &mut db,
        &mut obj,
        "issue_handler",
        vec![ValType::I64, ValType::I64],
        vec![],
    );

    let mut objects = vec![obj];
    create_synthetic_symbols(&mut db, &args, &objects);
    link_output(&args, &mut objects, &mut db).unwrap();

    let bytes = std::fs::read(&args.output_file).unwrap();
    let sections = parse_sections(&bytes);
    assert_canonical_order(&sections);

    let ids: Vec<u8> = sections.iter().map(|s| s.id).collect();
    for expected in [1, 2, 3, 4, 5, 6, 7, 10, 11] {
        assert!(ids.contains(&expected), "missing section id {expected}");
    }
    let custom_names: Vec<&str> = sections
        .iter()
        .filter_map(|s| s.name.as_deref())
        .collect();
    assert_eq!(custom_names, ["name", "producers"]);

    // memory is exported under its well-known name; the dispatcher entry is
    // exported as a function; hidden handlers are not.
    let exports = exports(&sections);
    assert!(exports.iter().any(|(n, k, i)| n == "memory" && *k == 2 && *i == 0));
    let apply = exports
        .iter()
        .find(|(n, k, _)| n == "apply" && *k == 0)
        .expect("apply must be exported");
    // Two imports, then __wasm_call_ctors, then apply.
    assert_eq!(apply.2, 3);
    assert!(!exports.iter().any(|(n, _, _)| n == "transfer_handler"));

    // Type table is deduplicated: set_contract(i64), assert(i32,i64),
    // handler(i64,i64) x2 shared, ctors(), apply(i64 x3).
    let type_section = sections.iter().find(|s| s.id == 1).unwrap();
    assert_eq!(type_section.payload[0], 5);

    // Both data segments survive under their canonical names.
    let data_section = sections.iter().find(|s| s.id == 11).unwrap();
    assert_eq!(data_section.payload[0], 2);

    // The merged ABI lands next to the binary.
    let abi: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(args.abi_output_file()).unwrap()).unwrap();
    assert_eq!(abi["version"], "eosio::abi/1.1");
    assert_eq!(abi["actions"][0]["name"], "transfer");
}

#[test]
fn relocatable_link_emits_linking_section_and_no_abi() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let args = Args {
        relocatable: true,
        ..Args::with_output(dir.path().join("combined.o"))
    };

    let mut obj = ObjectFile::new("part.o");
    obj.segments.push(seg(".data.x", 4, vec![1, 2, 3, 4]));

    let mut db = SymbolDb::new();
    define_object_function(&mut db, &mut obj, "helper", vec![], vec![]);

    let mut objects = vec![obj];
    create_synthetic_symbols(&mut db, &args, &objects);
    link_output(&args, &mut objects, &mut db).unwrap();

    let bytes = std::fs::read(&args.output_file).unwrap();
    let sections = parse_sections(&bytes);
    assert_canonical_order(&sections);

    // No dispatcher and no exports in relocatable output.
    assert!(exports(&sections).is_empty());
    assert!(!sections.iter().any(|s| s.id == 7));
    let custom_names: Vec<&str> = sections
        .iter()
        .filter_map(|s| s.name.as_deref())
        .collect();
    assert!(custom_names.contains(&"linking"));

    // No ABI was collected, so no side-file is written.
    assert!(!args.abi_output_file().exists());
}

#[test]
fn sync_call_contract_exports_sync_entry() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let args = Args {
        // The contract brings its own apply; only sync dispatch is
        // synthesized.
        other_model: true,
        ..Args::with_output(dir.path().join("vault.wasm"))
    };

    let mut obj = ObjectFile::new("vault.o");
    obj.sync_calls = vec!["withdraw:withdraw_handler".to_owned()];

    let mut db = SymbolDb::new();
    import_function(
        &mut db,
        "eosio_set_contract_name",
        vec![ValType::I64],
        vec![],
    );
    import_function(
        &mut db,
        "__eos_get_sync_call_data_",
        vec![ValType::I32],
        vec![ValType::I32],
    );
    import_function(
        &mut db,
        "__eos_get_sync_call_data_header_",
        vec![ValType::I32],
        vec![ValType::I32],
    );
    define_object_function(
        &mut db,
        &mut obj,
        "withdraw_handler",
        vec![ValType::I64, ValType::I64, ValType::I32, ValType::I32],
        vec![ValType::I64],
    );

    let mut objects = vec![obj];
    create_synthetic_symbols(&mut db, &args, &objects);
    link_output(&args, &mut objects, &mut db).unwrap();

    let bytes = std::fs::read(&args.output_file).unwrap();
    let sections = parse_sections(&bytes);
    assert_canonical_order(&sections);
    let exports = exports(&sections);
    assert!(exports.iter().any(|(n, k, _)| n == "sync_call" && *k == 0));
    assert!(!exports.iter().any(|(n, _, _)| n == "apply"));
}

#[test]
fn conflicting_feature_policies_fail_the_link() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let args = Args {
        other_model: true,
        ..Args::with_output(dir.path().join("broken.wasm"))
    };

    let mut a = ObjectFile::new("a.o");
    a.target_features.push(libeosld::input_data::FeatureEntry {
        policy: libeosld::input_data::FeaturePolicy::Used,
        name: "atomics".to_owned(),
    });
    let mut b = ObjectFile::new("b.o");
    b.target_features.push(libeosld::input_data::FeatureEntry {
        policy: libeosld::input_data::FeaturePolicy::Disallowed,
        name: "atomics".to_owned(),
    });

    let mut db = SymbolDb::new();
    let mut objects = vec![a, b];
    create_synthetic_symbols(&mut db, &args, &objects);
    let err = link_output(&args, &mut objects, &mut db).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("'atomics' feature is used in a.o")
        || message.contains("Target feature 'atomics' used in a.o"));
    assert!(message.contains("disallowed by b.o"));
    assert!(!args.output_file.exists());
}

#[test]
fn producer_info_is_merged_across_objects() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let args = Args {
        other_model: true,
        ..Args::with_output(dir.path().join("merged.wasm"))
    };

    let mut a = ObjectFile::new("a.o");
    a.producers = ProducerInfo {
        languages: vec![("C++".to_owned(), "17".to_owned())],
        processed_by: vec![("clang".to_owned(), "9".to_owned())],
        sdks: vec![],
    };
    let mut b = ObjectFile::new("b.o");
    b.producers = ProducerInfo {
        languages: vec![("C++".to_owned(), "14".to_owned())],
        processed_by: vec![("eosio-cpp".to_owned(), "1.8".to_owned())],
        sdks: vec![],
    };

    let mut db = SymbolDb::new();
    let mut objects = vec![a, b];
    create_synthetic_symbols(&mut db, &args, &objects);
    link_output(&args, &mut objects, &mut db).unwrap();

    let bytes = std::fs::read(&args.output_file).unwrap();
    let sections = parse_sections(&bytes);
    let producers = sections
        .iter()
        .find(|s| s.name.as_deref() == Some("producers"))
        .expect("producers section present");
    let mut r = Reader::new(&producers.payload);
    assert_eq!(r.uleb(), 2); // language + processed-by
    assert_eq!(r.str(), "language");
    assert_eq!(r.uleb(), 1); // C++ deduplicated, first version wins
    assert_eq!(r.str(), "C++");
    assert_eq!(r.str(), "17");
    assert_eq!(r.str(), "processed-by");
    assert_eq!(r.uleb(), 2); // clang and eosio-cpp both survive
}
