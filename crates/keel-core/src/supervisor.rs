//! Runtime Supervisor — the process-wide runtime behind the C boundary
//!
//! `init_runtime` may be called any number of times with the same
//! configuration; the first call builds the runtime and later calls are
//! no-ops. A different configuration fails with `AlreadyInitialized`. There
//! is no teardown: the supervisor lives for the rest of the process.

use once_cell::sync::OnceCell;

use crate::bridge::{BufferHandle, BufferLease, BufferRegistry, InvocationRequest};
use crate::runtime::Runtime;
use crate::{ContractId, Error, Result, RuntimeConfig};

static SUPERVISOR: OnceCell<Supervisor> = OnceCell::new();

/// A runtime plus the registry of buffers issued on its behalf
#[derive(Debug)]
pub struct Supervisor {
    runtime: Runtime,
    buffers: BufferRegistry,
}

/// Initialize the process-wide supervisor from configuration text
pub fn init_runtime(config_text: &str) -> Result<&'static Supervisor> {
    let config = RuntimeConfig::parse(config_text)?;
    let supervisor = SUPERVISOR.get_or_try_init(|| {
        tracing::info!(durable = config.data_dir.is_some(), "initializing runtime");
        Supervisor::new(config.clone())
    })?;
    if supervisor.config() != &config {
        return Err(Error::AlreadyInitialized);
    }
    Ok(supervisor)
}

/// The initialized supervisor
pub fn global() -> Result<&'static Supervisor> {
    SUPERVISOR.get().ok_or(Error::NotInitialized)
}

impl Supervisor {
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        Ok(Supervisor {
            runtime: Runtime::open(config)?,
            buffers: BufferRegistry::new(),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        self.runtime.config()
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn buffers(&self) -> &BufferRegistry {
        &self.buffers
    }

    pub fn deploy(&self, code: &[u8]) -> Result<ContractId> {
        self.runtime.deploy(code)
    }

    /// Run a validated request; the result bytes are leased to the caller
    pub fn call(&self, request: &InvocationRequest) -> Result<BufferLease> {
        let outcome = self.runtime.call_with_budget(
            &request.contract,
            &request.function,
            &request.args,
            request.budget,
        )?;
        Ok(self.buffers.issue(outcome.output))
    }

    /// Committed state encoded as a snapshot, leased to the caller
    pub fn get_state(&self, id: &ContractId) -> Result<BufferLease> {
        let snapshot = self.runtime.get_state(id)?;
        Ok(self.buffers.issue(snapshot.encode()))
    }

    pub fn release(&self, handle: BufferHandle) -> Result<()> {
        self.buffers.release(handle)
    }

    pub fn release_ptr(&self, ptr: *const u8) -> Result<()> {
        self.buffers.release_ptr(ptr)
    }
}
