//! Host functions exposed to contracts under the `contract` namespace
//!
//! | import | signature |
//! |---|---|
//! | `input_len` | `() -> i32` |
//! | `input_read` | `(dst: i32)` |
//! | `set_call_result` | `(ptr: i32, len: i32)` |
//! | `state_get` | `(key_ptr: i32, key_len: i32) -> i64` |
//! | `state_read_value` | `(dst: i32, cap: i32) -> i32` |
//! | `state_set` | `(key_ptr: i32, key_len: i32, val_ptr: i32, val_len: i32)` |
//! | `state_delete` | `(key_ptr: i32, key_len: i32)` |
//! | `call_contract` | `(id_ptr: i32, fn_ptr: i32, fn_len: i32, args_ptr: i32, args_len: i32) -> i32` |
//! | `return_data_len` | `() -> i32` |
//! | `return_data_read` | `(dst: i32)` |
//! | `abort` | `(code: i32)` |
//!
//! Every call charges `host_call_fuel` plus `byte_fuel` per byte moved.
//! Out-of-bounds pointers and oversized keys, values or results trap.

use std::sync::Arc;

use anyhow::Result;
use wasmtime::{Caller, Extern, Linker, Memory};

use super::session::{self, Session};
use super::{ContractHost, HostFault, MemoryLimiter, HOST_NAMESPACE};
use crate::{ContractId, RuntimeConfig, CONTRACT_ID_LEN};

/// Per-store state visible to host functions
pub(crate) struct HostContext {
    pub(super) host: Arc<dyn ContractHost>,
    pub(super) config: Arc<RuntimeConfig>,
    pub(super) contract: ContractId,
    pub(super) session: Session,
    pub(super) limiter: MemoryLimiter,
    input: Vec<u8>,
    output: Vec<u8>,
    /// Value found by the last `state_get`
    cached_value: Option<Vec<u8>>,
    /// Result of the last nested call
    pub(super) return_data: Vec<u8>,
}

impl HostContext {
    pub(super) fn new(
        host: Arc<dyn ContractHost>,
        contract: ContractId,
        input: Vec<u8>,
        session: Session,
        config: Arc<RuntimeConfig>,
    ) -> Self {
        HostContext {
            limiter: MemoryLimiter::new(config.max_memory_bytes),
            host,
            config,
            contract,
            session,
            input,
            output: Vec::new(),
            cached_value: None,
            return_data: Vec::new(),
        }
    }

    /// Give back the session and the result bytes
    pub(super) fn finish(self) -> (Session, Vec<u8>) {
        (self.session, self.output)
    }
}

pub(super) fn register(linker: &mut Linker<HostContext>) -> Result<()> {
    linker.func_wrap(HOST_NAMESPACE, "input_len", input_len)?;
    linker.func_wrap(HOST_NAMESPACE, "input_read", input_read)?;
    linker.func_wrap(HOST_NAMESPACE, "set_call_result", set_call_result)?;
    linker.func_wrap(HOST_NAMESPACE, "state_get", state_get)?;
    linker.func_wrap(HOST_NAMESPACE, "state_read_value", state_read_value)?;
    linker.func_wrap(HOST_NAMESPACE, "state_set", state_set)?;
    linker.func_wrap(HOST_NAMESPACE, "state_delete", state_delete)?;
    linker.func_wrap(HOST_NAMESPACE, "call_contract", call_contract)?;
    linker.func_wrap(HOST_NAMESPACE, "return_data_len", return_data_len)?;
    linker.func_wrap(HOST_NAMESPACE, "return_data_read", return_data_read)?;
    linker.func_wrap(HOST_NAMESPACE, "abort", abort)?;
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────

fn misuse(msg: impl Into<String>) -> anyhow::Error {
    HostFault::Misuse(msg.into()).into()
}

fn memory(caller: &mut Caller<'_, HostContext>) -> Result<Memory> {
    caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| misuse("module exports no memory"))
}

/// Charge the flat host call cost plus `bytes` worth of transfer
fn charge(caller: &mut Caller<'_, HostContext>, bytes: usize) -> Result<()> {
    let config = &caller.data().config;
    let cost = config
        .host_call_fuel
        .saturating_add(config.byte_fuel.saturating_mul(bytes as u64));
    let fuel = caller.get_fuel()?;
    if fuel < cost {
        caller.set_fuel(0)?;
        return Err(HostFault::OutOfBudget("fuel exhausted in host call".into()).into());
    }
    caller.set_fuel(fuel - cost)?;
    Ok(())
}

fn checked_len(len: i32, ceiling: usize, what: &str) -> Result<usize> {
    if len < 0 {
        return Err(misuse(format!("negative {} length", what)));
    }
    let len = len as usize;
    if len > ceiling {
        return Err(misuse(format!(
            "{} of {} bytes exceeds limit of {} bytes",
            what, len, ceiling
        )));
    }
    Ok(len)
}

fn read_memory(memory: &Memory, caller: &Caller<'_, HostContext>, ptr: i32, len: usize) -> Result<Vec<u8>> {
    if ptr < 0 {
        return Err(misuse("negative pointer"));
    }
    let start = ptr as usize;
    let end = start
        .checked_add(len)
        .ok_or_else(|| misuse("memory range overflows"))?;
    let data = memory.data(caller);
    data.get(start..end)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| misuse("memory access out of bounds"))
}

fn write_memory(memory: &Memory, caller: &mut Caller<'_, HostContext>, ptr: i32, bytes: &[u8]) -> Result<()> {
    if ptr < 0 {
        return Err(misuse("negative pointer"));
    }
    let start = ptr as usize;
    let end = start
        .checked_add(bytes.len())
        .ok_or_else(|| misuse("memory range overflows"))?;
    let data = memory.data_mut(caller);
    let target = data
        .get_mut(start..end)
        .ok_or_else(|| misuse("memory access out of bounds"))?;
    target.copy_from_slice(bytes);
    Ok(())
}

// ── Arguments and results ─────────────────────────────────

fn input_len(mut caller: Caller<'_, HostContext>) -> Result<i32> {
    charge(&mut caller, 0)?;
    Ok(caller.data().input.len() as i32)
}

fn input_read(mut caller: Caller<'_, HostContext>, dst: i32) -> Result<()> {
    let input = caller.data().input.clone();
    charge(&mut caller, input.len())?;
    let memory = memory(&mut caller)?;
    write_memory(&memory, &mut caller, dst, &input)
}

fn set_call_result(mut caller: Caller<'_, HostContext>, ptr: i32, len: i32) -> Result<()> {
    let len = checked_len(len, caller.data().config.max_result_bytes, "result")?;
    charge(&mut caller, len)?;
    let memory = memory(&mut caller)?;
    let bytes = read_memory(&memory, &caller, ptr, len)?;
    caller.data_mut().output = bytes;
    Ok(())
}

// ── State ─────────────────────────────────────────────────

fn read_key(caller: &mut Caller<'_, HostContext>, ptr: i32, len: i32) -> Result<Vec<u8>> {
    let len = checked_len(len, caller.data().config.max_key_bytes, "key")?;
    charge(caller, len)?;
    let memory = memory(caller)?;
    read_memory(&memory, caller, ptr, len)
}

fn state_get(mut caller: Caller<'_, HostContext>, key_ptr: i32, key_len: i32) -> Result<i64> {
    let key = read_key(&mut caller, key_ptr, key_len)?;
    let ctx = caller.data();
    let value = ctx.session.read(ctx.host.as_ref(), &ctx.contract, &key)?;
    let found = value.as_ref().map(|v| v.len() as i64).unwrap_or(-1);
    caller.data_mut().cached_value = value;
    Ok(found)
}

fn state_read_value(mut caller: Caller<'_, HostContext>, dst: i32, cap: i32) -> Result<i32> {
    if cap < 0 {
        return Err(misuse("negative capacity"));
    }
    let value = caller
        .data()
        .cached_value
        .clone()
        .ok_or_else(|| misuse("state_read_value without a preceding successful state_get"))?;
    let count = value.len().min(cap as usize);
    charge(&mut caller, count)?;
    let memory = memory(&mut caller)?;
    write_memory(&memory, &mut caller, dst, &value[..count])?;
    Ok(count as i32)
}

fn state_set(
    mut caller: Caller<'_, HostContext>,
    key_ptr: i32,
    key_len: i32,
    value_ptr: i32,
    value_len: i32,
) -> Result<()> {
    let value_len = checked_len(value_len, caller.data().config.max_value_bytes, "value")?;
    let key = read_key(&mut caller, key_ptr, key_len)?;
    charge(&mut caller, value_len)?;
    let memory = memory(&mut caller)?;
    let value = read_memory(&memory, &caller, value_ptr, value_len)?;

    let ctx = caller.data_mut();
    let contract = ctx.contract;
    ctx.session.overlay.writes_mut(contract).put(key, value);
    Ok(())
}

fn state_delete(mut caller: Caller<'_, HostContext>, key_ptr: i32, key_len: i32) -> Result<()> {
    let key = read_key(&mut caller, key_ptr, key_len)?;
    let ctx = caller.data_mut();
    let contract = ctx.contract;
    ctx.session.overlay.writes_mut(contract).delete(key);
    Ok(())
}

// ── Cross-contract calls ──────────────────────────────────

fn call_contract(
    mut caller: Caller<'_, HostContext>,
    id_ptr: i32,
    fn_ptr: i32,
    fn_len: i32,
    args_ptr: i32,
    args_len: i32,
) -> Result<i32> {
    let fn_len = checked_len(fn_len, caller.data().config.max_key_bytes, "function name")?;
    let args_len = checked_len(args_len, caller.data().config.max_value_bytes, "arguments")?;
    charge(&mut caller, CONTRACT_ID_LEN + fn_len + args_len)?;

    let memory = memory(&mut caller)?;
    let id_bytes = read_memory(&memory, &caller, id_ptr, CONTRACT_ID_LEN)?;
    let name = read_memory(&memory, &caller, fn_ptr, fn_len)?;
    let args = read_memory(&memory, &caller, args_ptr, args_len)?;

    let callee = match ContractId::from_slice(&id_bytes) {
        Ok(id) => id,
        Err(_) => return Ok(super::nested_status::UNKNOWN_CONTRACT),
    };
    let function = match String::from_utf8(name) {
        Ok(function) => function,
        Err(_) => return Ok(super::nested_status::UNKNOWN_FUNCTION),
    };

    session::call_nested(&mut caller, callee, &function, args)
}

fn return_data_len(mut caller: Caller<'_, HostContext>) -> Result<i32> {
    charge(&mut caller, 0)?;
    Ok(caller.data().return_data.len() as i32)
}

fn return_data_read(mut caller: Caller<'_, HostContext>, dst: i32) -> Result<()> {
    let data = caller.data().return_data.clone();
    charge(&mut caller, data.len())?;
    let memory = memory(&mut caller)?;
    write_memory(&memory, &mut caller, dst, &data)
}

fn abort(_caller: Caller<'_, HostContext>, code: i32) -> Result<()> {
    Err(HostFault::Abort(code).into())
}
