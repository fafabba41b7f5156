//! Per-invocation session: write overlay, call stack and held locks
//!
//! A top-level call owns exactly one session. Nested calls move it into the
//! callee's store and take it back afterwards; a failed callee has its
//! overlay and executed set restored to the checkpoint taken before it ran.
//! Its lock stays held until the session ends.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use wasmtime::Caller;

use super::host::HostContext;
use super::{nested_status, ContractHost, HostFault};
use crate::locks::ContractLock;
use crate::store::CommitBatch;
use crate::{ContractId, Error, Result};

#[derive(Debug, Default)]
pub(crate) struct Session {
    /// Pending writes of every contract run so far
    pub overlay: CommitBatch,
    stack: Vec<ContractId>,
    locks: BTreeMap<ContractId, ContractLock>,
    executed: BTreeSet<ContractId>,
}

/// Session state a failed callee must not leave behind
pub(crate) struct Checkpoint {
    overlay: CommitBatch,
    executed: BTreeSet<ContractId>,
}

impl Session {
    /// Session for a top-level call that already holds the target's lock
    pub fn with_lock(lock: ContractLock) -> Self {
        let mut session = Session::default();
        session.hold(lock);
        session
    }

    pub fn enter(&mut self, id: ContractId) {
        self.stack.push(id);
    }

    pub fn leave(&mut self) {
        self.stack.pop();
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn on_stack(&self, id: &ContractId) -> bool {
        self.stack.contains(id)
    }

    pub fn holds(&self, id: &ContractId) -> bool {
        self.locks.contains_key(id)
    }

    pub fn hold(&mut self, lock: ContractLock) {
        self.locks.insert(*lock.id(), lock);
    }

    /// Record that an execution of `id` returned successfully
    pub fn complete(&mut self, id: ContractId) {
        self.executed.insert(id);
    }

    /// Contracts with a successful execution that was not rolled back,
    /// in identity order
    pub fn executed(&self) -> Vec<ContractId> {
        self.executed.iter().copied().collect()
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            overlay: self.overlay.clone(),
            executed: self.executed.clone(),
        }
    }

    pub fn restore(&mut self, checkpoint: Checkpoint) {
        self.overlay = checkpoint.overlay;
        self.executed = checkpoint.executed;
    }

    /// Value of `key` as the running contract sees it: pending writes first,
    /// committed state otherwise
    pub fn read(
        &self,
        host: &dyn ContractHost,
        contract: &ContractId,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        if let Some(pending) = self.overlay.writes(contract).and_then(|ws| ws.get(key)) {
            return Ok(pending.map(<[u8]>::to_vec));
        }
        host.read_committed(contract, key)
    }
}

/// Run `function` of `callee` on behalf of the contract behind `caller`.
///
/// Returns a [`nested_status`] code for failures the caller may handle and
/// an error for failures that end the whole invocation.
pub(super) fn call_nested(
    caller: &mut Caller<'_, HostContext>,
    callee: ContractId,
    function: &str,
    args: Vec<u8>,
) -> anyhow::Result<i32> {
    let host = caller.data().host.clone();
    let max_depth = caller.data().config.max_call_depth as usize;
    let lock_timeout = Duration::from_millis(caller.data().config.lock_timeout_ms);
    let origin = caller.data().contract;
    caller.data_mut().return_data.clear();

    let session = &caller.data().session;
    if session.depth() >= max_depth {
        tracing::debug!(caller = %origin.short(), callee = %callee.short(), "nested call depth exceeded");
        return Ok(nested_status::DEPTH_EXCEEDED);
    }
    if session.on_stack(&callee) {
        tracing::debug!(caller = %origin.short(), callee = %callee.short(), "reentrant call refused");
        return Ok(nested_status::REENTRANT);
    }
    let module = match host.module(&callee) {
        Some(module) => module,
        None => return Ok(nested_status::UNKNOWN_CONTRACT),
    };
    if !module.has_entry_point(function) {
        return Ok(nested_status::UNKNOWN_FUNCTION);
    }
    if !session.holds(&callee) {
        match host.locks().try_lock_for(callee, lock_timeout) {
            Some(lock) => caller.data_mut().session.hold(lock),
            None => {
                tracing::debug!(callee = %callee.short(), "callee busy, nested call refused");
                return Ok(nested_status::BUSY);
            }
        }
    }

    let session = std::mem::take(&mut caller.data_mut().session);
    let checkpoint = session.checkpoint();
    let fuel = caller.get_fuel()?;

    let execution = host
        .sandbox()
        .execute(host.clone(), &module, function, args, fuel, session);
    let mut session = execution.session;
    caller.set_fuel(execution.fuel_left)?;

    match execution.result {
        Ok(output) => {
            let ctx = caller.data_mut();
            ctx.session = session;
            ctx.return_data = output;
            Ok(nested_status::OK)
        }
        Err(err) => {
            session.restore(checkpoint);
            caller.data_mut().session = session;
            match err {
                Error::BudgetExceeded(reason) => Err(HostFault::OutOfBudget(reason).into()),
                Error::Storage(_) => Err(err.into()),
                other => {
                    tracing::warn!(
                        caller = %origin.short(),
                        callee = %callee.short(),
                        function,
                        error = %other,
                        "nested call rolled back"
                    );
                    Ok(nested_status::TRAPPED)
                }
            }
        }
    }
}
