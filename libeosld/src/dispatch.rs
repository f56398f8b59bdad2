//! Contract entry-point synthesis.
//!
//! When a contract leaves `apply` (or `sync_call`) undefined, the linker
//! fabricates the dispatcher: a chain of nested `if`/`else` blocks comparing
//! the incoming 64-bit name against every declared handler. The chain calls
//! straight into the handler functions, so absolute function indices must be
//! assigned before anything here runs.
//!
//! `apply(receiver, code, action)` splits on `receiver == code`: the
//! then-branch dispatches the contract's own actions, the else-branch
//! dispatches notifications grouped by the notifying code, with `*`
//! wildcard handlers in the trailing else. `sync_call(sender, receiver,
//! data_size)` validates the versioned call-data header, then compares the
//! hashed function name at header offset 8 against every registered call.

use crate::error::Result;
use crate::input_data::ObjectFile;
use crate::symbol_db::SymbolDb;
use anyhow::bail;
use eosld_utils::names::hash_id;
use eosld_utils::names::string_to_name;
use eosld_utils::wasm::opcode;
use eosld_utils::wasm::write_sleb128;
use eosld_utils::wasm::write_uleb128;
use eosld_utils::wasm::ValType;
use eosld_utils::wasm::BLOCK_TYPE_VOID;
use indexmap::IndexMap;
use indexmap::IndexSet;

const EOSIO_COMPILER_ERROR_BASE: u64 = 8_000_000_000_000_000_000;
pub const EOSIO_ERROR_NO_ACTION: u64 = EOSIO_COMPILER_ERROR_BASE;
pub const EOSIO_ERROR_ONERROR: u64 = EOSIO_COMPILER_ERROR_BASE + 1;
pub const EOSIO_CANARY_FAILURE: u64 = EOSIO_COMPILER_ERROR_BASE + 2;

/// Status returned by the sync-call entry point when the call ran to
/// completion.
pub const SYNC_CALL_EXECUTED: i64 = 0;

/// Error statuses returned by the sync-call entry point. Must be ≤ -10000.
pub const SYNC_CALL_UNSUPPORTED_HEADER_VERSION: i64 = -10000;
pub const SYNC_CALL_UNKNOWN_FUNCTION: i64 = -10001;

// Parameter locals shared by both dispatchers.
const LOCAL_RECEIVER: u32 = 0;
const LOCAL_CODE: u32 = 1;
const LOCAL_ACTION: u32 = 2;

// sync_call: params sender/receiver/data_size, then two scratch locals.
const LOCAL_SENDER: u32 = 0;
const LOCAL_SC_RECEIVER: u32 = 1;
const LOCAL_DATA_SIZE: u32 = 2;
const LOCAL_DATA: u32 = 3;
const LOCAL_HEADER: u32 = 4;

fn op(out: &mut Vec<u8>, byte: u8) {
    out.push(byte);
}

fn local_get(out: &mut Vec<u8>, index: u32) {
    op(out, opcode::LOCAL_GET);
    write_uleb128(out, u64::from(index));
}

fn local_set(out: &mut Vec<u8>, index: u32) {
    op(out, opcode::LOCAL_SET);
    write_uleb128(out, u64::from(index));
}

fn call(out: &mut Vec<u8>, index: u32) {
    op(out, opcode::CALL);
    write_uleb128(out, u64::from(index));
}

fn i32_const(out: &mut Vec<u8>, value: i64) {
    op(out, opcode::I32_CONST);
    write_sleb128(out, value);
}

fn i64_const(out: &mut Vec<u8>, value: i64) {
    op(out, opcode::I64_CONST);
    write_sleb128(out, value);
}

fn if_void(out: &mut Vec<u8>) {
    op(out, opcode::IF);
    op(out, BLOCK_TYPE_VOID);
}

fn mem_arg(out: &mut Vec<u8>, align: u32, offset: u32) {
    write_uleb128(out, u64::from(align));
    write_uleb128(out, u64::from(offset));
}

/// Bookkeeping for a flat `if`/`else if`/… chain: emits the `else` that
/// chains each test into the previous one and remembers how many `end`s the
/// chain owes.
#[derive(Default)]
struct IfChain {
    need_else: bool,
    count: u32,
}

impl IfChain {
    /// Call before emitting a test; chains it into the previous one.
    fn enter(&mut self, out: &mut Vec<u8>) {
        if self.need_else {
            op(out, opcode::ELSE);
        }
        self.need_else = true;
        self.count += 1;
    }

    fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Closes every `if` the chain opened.
    fn close(self, out: &mut Vec<u8>) {
        for _ in 0..self.count {
            op(out, opcode::END);
        }
    }
}

fn required_function_index(db: &SymbolDb, name: &str) -> Result<u32> {
    let Some(id) = db.find(name) else {
        bail!("internal error: dispatcher helper `{name}` not found");
    };
    db.symbol(id).function_index()
}

fn optional_function_index(db: &SymbolDb, name: &str) -> Result<Option<u32>> {
    match db.find(name) {
        Some(id) => Ok(Some(db.symbol(id).function_index()?)),
        None => Ok(None),
    }
}

fn canary_address(db: &SymbolDb) -> Result<i64> {
    let Some(data_end) = db.well_known.data_end else {
        bail!("internal error: stack canary requested without __data_end");
    };
    // The canary slot sits just past the data segments.
    Ok(db.symbol(data_end).virtual_address()? as i64 + 8)
}

fn canary_global_index(db: &SymbolDb) -> Result<u32> {
    let Some(canary) = db.well_known.stack_canary else {
        bail!("internal error: stack canary requested without __stack_canary");
    };
    db.symbol(canary).global_index()
}

/// Seeds `__stack_canary` from `current_time()` and mirrors it to linear
/// memory at `__data_end + 8`.
fn emit_canary_prologue(out: &mut Vec<u8>, db: &SymbolDb) -> Result {
    let canary = canary_global_index(db)?;
    let Some(time_idx) = optional_function_index(db, "current_time")? else {
        bail!("internal error, current_time not found");
    };

    call(out, time_idx);
    op(out, opcode::GLOBAL_SET);
    write_uleb128(out, u64::from(canary));

    i32_const(out, canary_address(db)?);
    op(out, opcode::GLOBAL_GET);
    write_uleb128(out, u64::from(canary));
    op(out, opcode::I64_STORE);
    mem_arg(out, 3, 0);
    Ok(())
}

/// Reloads the mirrored canary and asserts it still matches the global.
fn emit_canary_epilogue(out: &mut Vec<u8>, db: &SymbolDb, assert_idx: u32) -> Result {
    let canary = canary_global_index(db)?;

    op(out, opcode::GLOBAL_GET);
    write_uleb128(out, u64::from(canary));
    i32_const(out, canary_address(db)?);
    op(out, opcode::I64_LOAD);
    mem_arg(out, 3, 0);
    op(out, opcode::I64_NE);
    if_void(out);
    i32_const(out, 0);
    i64_const(out, EOSIO_CANARY_FAILURE as i64);
    call(out, assert_idx);
    op(out, opcode::END);
    Ok(())
}

/// Splits a handler declaration `name:function_symbol` and emits one test of
/// the chain: `if (local[name_local] == name(name)) call function(receiver,
/// code)`.
fn emit_handler_test(
    out: &mut Vec<u8>,
    chain: &mut IfChain,
    db: &SymbolDb,
    declaration: &str,
) -> Result {
    let Some((name, function)) = declaration.split_once(':') else {
        bail!("internal error: malformed handler declaration `{declaration}`");
    };
    chain.enter(out);
    i64_const(out, string_to_name(name) as i64);
    local_get(out, LOCAL_ACTION);
    op(out, opcode::I64_EQ);
    if_void(out);
    local_get(out, LOCAL_RECEIVER);
    local_get(out, LOCAL_CODE);
    let Some(index) = optional_function_index(db, function)? else {
        bail!("internal error: dispatch handler `{function}` not found");
    };
    call(out, index);
    Ok(())
}

fn emit_action_dispatch(
    out: &mut Vec<u8>,
    db: &SymbolDb,
    objects: &[ObjectFile],
    assert_idx: Option<u32>,
    post_idx: Option<u32>,
) -> Result {
    let mut chain = IfChain::default();
    let mut dispatched: IndexSet<&str> = IndexSet::new();

    for obj in objects {
        for action in &obj.actions {
            let name = action.split(':').next().unwrap_or(action.as_str());
            if dispatched.insert(name) {
                emit_handler_test(out, &mut chain, db, action)?;
            }
        }
    }
    if !chain.is_empty() {
        op(out, opcode::ELSE);
    }

    // No matching action: fail, unless the contract is eosio itself.
    local_get(out, LOCAL_RECEIVER);
    i64_const(out, string_to_name("eosio") as i64);
    op(out, opcode::I64_NE);
    if_void(out);

    let Some(assert_idx) = assert_idx else {
        bail!("cannot synthesize dispatcher: `eosio_assert_code` is not defined");
    };
    i32_const(out, 0);
    i64_const(out, EOSIO_ERROR_NO_ACTION as i64);
    call(out, assert_idx);

    if let Some(post_idx) = post_idx {
        op(out, opcode::ELSE);
        local_get(out, LOCAL_RECEIVER);
        local_get(out, LOCAL_CODE);
        local_get(out, LOCAL_ACTION);
        call(out, post_idx);
    }
    op(out, opcode::END);

    chain.close(out);
    Ok(())
}

fn emit_notify_dispatch(
    out: &mut Vec<u8>,
    db: &SymbolDb,
    objects: &[ObjectFile],
    assert_idx: Option<u32>,
    post_idx: Option<u32>,
) -> Result {
    // Group handlers by notifying code name; first declaration wins.
    let mut dispatched: IndexSet<&str> = IndexSet::new();
    let mut handlers: IndexMap<&str, Vec<&str>> = IndexMap::new();
    for obj in objects {
        for declaration in &obj.notify {
            if !dispatched.insert(declaration.as_str()) {
                continue;
            }
            // <code>::<action>:<handler_symbol>
            let Some((code, rest)) = declaration.split_once("::") else {
                bail!("internal error: malformed notify declaration `{declaration}`");
            };
            handlers.entry(code).or_default().push(rest);
        }
    }

    let has_onerror_handler = handlers
        .get("eosio")
        .is_some_and(|rests| rests.iter().any(|r| r.split(':').next() == Some("onerror")));

    // Without an explicit eosio::onerror handler, a deferred-transaction
    // failure notification must abort rather than be silently ignored.
    if !has_onerror_handler {
        let Some(assert_idx) = assert_idx else {
            bail!("cannot synthesize dispatcher: `eosio_assert_code` is not defined");
        };
        i64_const(out, string_to_name("eosio") as i64);
        local_get(out, LOCAL_CODE);
        op(out, opcode::I64_EQ);
        if_void(out);
        i64_const(out, string_to_name("onerror") as i64);
        local_get(out, LOCAL_ACTION);
        op(out, opcode::I64_EQ);
        if_void(out);
        i32_const(out, 0);
        i64_const(out, EOSIO_ERROR_ONERROR as i64);
        call(out, assert_idx);
        op(out, opcode::END);
        op(out, opcode::END);
    }

    let mut outer = IfChain::default();
    for (&code, rests) in &handlers {
        if code == "*" {
            continue;
        }
        outer.enter(out);
        i64_const(out, string_to_name(code) as i64);
        local_get(out, LOCAL_CODE);
        op(out, opcode::I64_EQ);
        if_void(out);
        let mut inner = IfChain::default();
        for &rest in rests {
            emit_handler_test(out, &mut inner, db, rest)?;
        }
        inner.close(out);
    }
    if !outer.is_empty() {
        op(out, opcode::ELSE);
    }

    let mut wildcard = IfChain::default();
    if let Some(rests) = handlers.get("*") {
        for &rest in rests {
            emit_handler_test(out, &mut wildcard, db, rest)?;
        }
    }

    if let Some(post_idx) = post_idx {
        // post_dispatch runs in the innermost else of the wildcard chain;
        // with no wildcard handlers the trailing else of the code chain
        // already provides the context.
        if !wildcard.is_empty() {
            op(out, opcode::ELSE);
        }
        local_get(out, LOCAL_RECEIVER);
        local_get(out, LOCAL_CODE);
        local_get(out, LOCAL_ACTION);
        call(out, post_idx);
    }

    wildcard.close(out);
    outer.close(out);
    Ok(())
}

/// Synthesizes the `apply(receiver, code, action)` dispatcher body.
#[tracing::instrument(skip_all, name = "Synthesize action dispatcher")]
pub fn create_dispatch_function(
    db: &mut SymbolDb,
    objects: &[ObjectFile],
    stack_canary: bool,
) -> Result {
    let Some(entry) = db.well_known.entry else {
        bail!("internal error: dispatcher requested without an entry symbol");
    };

    let contract_idx = required_function_index(db, "eosio_set_contract_name")?;
    let assert_idx = optional_function_index(db, "eosio_assert_code")?;
    let pre_idx = optional_function_index(db, "pre_dispatch")?;
    let post_idx = optional_function_index(db, "post_dispatch")?;
    let ctors_idx = optional_function_index(db, "__wasm_call_ctors")?;
    let finalize_idx = optional_function_index(db, "__cxa_finalize")?;

    let mut out = Vec::new();
    write_uleb128(&mut out, 0); // no locals

    local_get(&mut out, LOCAL_RECEIVER);
    call(&mut out, contract_idx);

    if let Some(ctors_idx) = ctors_idx {
        call(&mut out, ctors_idx);
    }

    if stack_canary {
        emit_canary_prologue(&mut out, db)?;
    }

    // pre_dispatch gates the whole dispatch: a zero return skips it.
    if let Some(pre_idx) = pre_idx {
        local_get(&mut out, LOCAL_RECEIVER);
        local_get(&mut out, LOCAL_CODE);
        local_get(&mut out, LOCAL_ACTION);
        call(&mut out, pre_idx);
        if_void(&mut out);
    }

    local_get(&mut out, LOCAL_RECEIVER);
    local_get(&mut out, LOCAL_CODE);
    op(&mut out, opcode::I64_EQ);
    if_void(&mut out);

    emit_action_dispatch(&mut out, db, objects, assert_idx, post_idx)?;

    op(&mut out, opcode::ELSE);

    emit_notify_dispatch(&mut out, db, objects, assert_idx, post_idx)?;

    op(&mut out, opcode::END);

    if stack_canary {
        let Some(assert_idx) = assert_idx else {
            bail!("cannot synthesize dispatcher: `eosio_assert_code` is not defined");
        };
        emit_canary_epilogue(&mut out, db, assert_idx)?;
    }

    if let Some(finalize_idx) = finalize_idx {
        i32_const(&mut out, 0); // NULL: run every destructor
        call(&mut out, finalize_idx);
    }

    if pre_idx.is_some() {
        op(&mut out, opcode::END);
    }
    op(&mut out, opcode::END);

    crate::synthetic::create_function(db, entry, out);
    Ok(())
}

/// Emits one registered call's test: fetch the payload, validate the header
/// version, compare the hashed function name, and invoke the target.
fn emit_sync_call_test(
    out: &mut Vec<u8>,
    chain: &mut IfChain,
    db: &SymbolDb,
    declaration: &str,
    get_data_idx: u32,
    get_header_idx: u32,
) -> Result {
    let Some((name, function)) = declaration.split_once(':') else {
        bail!("internal error: malformed sync-call declaration `{declaration}`");
    };
    chain.enter(out);

    // data = __eos_get_sync_call_data_(data_size)
    local_get(out, LOCAL_DATA_SIZE);
    call(out, get_data_idx);
    local_set(out, LOCAL_DATA);

    // header = __eos_get_sync_call_data_header_(data)
    local_get(out, LOCAL_DATA);
    call(out, get_header_idx);
    local_set(out, LOCAL_HEADER);

    // Supported header version is 0; anything else fails the call.
    local_get(out, LOCAL_HEADER);
    op(out, opcode::I32_LOAD);
    mem_arg(out, 2, 0);
    if_void(out);
    i64_const(out, SYNC_CALL_UNSUPPORTED_HEADER_VERSION);
    op(out, opcode::RETURN);
    op(out, opcode::END);

    // The hashed function name sits at header offset 8.
    local_get(out, LOCAL_HEADER);
    i32_const(out, 8);
    op(out, opcode::I32_ADD);
    op(out, opcode::I64_LOAD);
    mem_arg(out, 3, 0);

    i64_const(out, hash_id(name) as i64);
    op(out, opcode::I64_EQ);
    if_void(out);

    local_get(out, LOCAL_SENDER);
    local_get(out, LOCAL_SC_RECEIVER);
    local_get(out, LOCAL_DATA_SIZE);
    local_get(out, LOCAL_DATA);
    let Some(index) = optional_function_index(db, function)? else {
        bail!("internal error: sync call function `{function}` not found");
    };
    call(out, index);
    Ok(())
}

/// Synthesizes the `sync_call(sender, receiver, data_size)` dispatcher body.
#[tracing::instrument(skip_all, name = "Synthesize sync-call dispatcher")]
pub fn create_sync_call_dispatch_function(
    db: &mut SymbolDb,
    objects: &[ObjectFile],
    stack_canary: bool,
) -> Result {
    let Some(entry) = db.well_known.sync_call_entry else {
        bail!("internal error: sync-call dispatcher requested without an entry symbol");
    };

    let contract_idx = required_function_index(db, "eosio_set_contract_name")?;
    let ctors_idx = optional_function_index(db, "__wasm_call_ctors")?;
    let finalize_idx = optional_function_index(db, "__cxa_finalize")?;
    let Some(get_data_idx) = optional_function_index(db, "__eos_get_sync_call_data_")? else {
        bail!("internal error: __eos_get_sync_call_data_ not found");
    };
    let Some(get_header_idx) = optional_function_index(db, "__eos_get_sync_call_data_header_")?
    else {
        bail!("internal error: __eos_get_sync_call_data_header_ not found");
    };

    let mut out = Vec::new();
    // Two scratch i32 locals after the three parameters: data and header.
    write_uleb128(&mut out, 1);
    write_uleb128(&mut out, 2);
    op(&mut out, ValType::I32.byte());

    local_get(&mut out, LOCAL_SC_RECEIVER);
    call(&mut out, contract_idx);

    if let Some(ctors_idx) = ctors_idx {
        call(&mut out, ctors_idx);
    }

    if stack_canary {
        emit_canary_prologue(&mut out, db)?;
    }

    let mut chain = IfChain::default();
    let mut dispatched: IndexSet<&str> = IndexSet::new();
    for obj in objects {
        for declaration in &obj.sync_calls {
            let name = declaration.split(':').next().unwrap_or(declaration.as_str());
            if dispatched.insert(name) {
                emit_sync_call_test(
                    &mut out,
                    &mut chain,
                    db,
                    declaration,
                    get_data_idx,
                    get_header_idx,
                )?;
            }
        }
    }
    if chain.is_empty() {
        bail!("internal error: sync-call dispatcher requested with no registered calls");
    }

    // No registered name matched the header's function id.
    op(&mut out, opcode::ELSE);
    i64_const(&mut out, SYNC_CALL_UNKNOWN_FUNCTION);
    op(&mut out, opcode::RETURN);
    chain.close(&mut out);

    if stack_canary {
        let Some(assert_idx) = optional_function_index(db, "eosio_assert_code")? else {
            bail!("cannot synthesize dispatcher: `eosio_assert_code` is not defined");
        };
        emit_canary_epilogue(&mut out, db, assert_idx)?;
    }

    if let Some(finalize_idx) = finalize_idx {
        i32_const(&mut out, 0);
        call(&mut out, finalize_idx);
    }

    i64_const(&mut out, SYNC_CALL_EXECUTED);
    op(&mut out, opcode::END);

    crate::synthetic::create_function(db, entry, out);
    Ok(())
}
