//! Execution Sandbox — metered, isolated execution of contract entry points
//!
//! Each invocation gets a fresh wasmtime `Store` built from the module's
//! pre-linked instance template. The store carries a [`HostContext`] that
//! owns the call's [`Session`] (write overlay, call stack, held locks) while
//! the contract runs; the session is handed back when execution ends so the
//! runtime can commit or drop it.
//!
//! # Failure classification
//!
//! ```text
//! Trap::OutOfFuel, HostFault::OutOfBudget      → BudgetExceeded
//! memory growth past max_memory_bytes          → BudgetExceeded
//! HostFault::Abort, HostFault::Misuse, traps   → ExecutionTrapped
//! ```

mod host;
mod session;

use std::sync::Arc;

use wasmtime::{Config, Engine, Linker, ResourceLimiter, Store, Trap};

use crate::loader::LoadedModule;
use crate::locks::ContractLocks;
use crate::{ContractId, Error, Result, RuntimeConfig};

pub(crate) use host::HostContext;
pub(crate) use session::Session;

/// Import namespace every host function lives in
pub const HOST_NAMESPACE: &str = "contract";

/// Status codes `call_contract` returns to the calling contract
pub mod nested_status {
    pub const OK: i32 = 0;
    pub const UNKNOWN_CONTRACT: i32 = -1;
    pub const UNKNOWN_FUNCTION: i32 = -2;
    pub const TRAPPED: i32 = -3;
    pub const REENTRANT: i32 = -4;
    pub const BUSY: i32 = -5;
    pub const DEPTH_EXCEEDED: i32 = -6;
}

/// What the sandbox needs from the runtime while a contract runs
pub(crate) trait ContractHost: Send + Sync {
    fn sandbox(&self) -> &Sandbox;

    fn module(&self, id: &ContractId) -> Option<Arc<LoadedModule>>;

    /// Committed value of `key` in `id`'s state
    fn read_committed(&self, id: &ContractId, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn locks(&self) -> &ContractLocks;
}

/// Errors raised by host functions and the memory limiter.
/// They travel through wasmtime as `anyhow` errors and are recovered in
/// [`classify`].
#[derive(Debug, thiserror::Error)]
pub(crate) enum HostFault {
    #[error("{0}")]
    OutOfBudget(String),

    #[error("memory growth to {desired} bytes exceeds ceiling of {ceiling} bytes")]
    MemoryCeiling { desired: usize, ceiling: usize },

    #[error("contract aborted with code {0}")]
    Abort(i32),

    #[error("{0}")]
    Misuse(String),
}

/// Enforces the linear memory ceiling of one store
#[derive(Debug)]
pub(crate) struct MemoryLimiter {
    ceiling: usize,
    exceeded: bool,
}

impl MemoryLimiter {
    pub(crate) fn new(ceiling: usize) -> Self {
        MemoryLimiter {
            ceiling,
            exceeded: false,
        }
    }
}

/// Table elements a contract may allocate
pub(crate) const MAX_TABLE_ELEMENTS: u32 = 10_000;

impl ResourceLimiter for MemoryLimiter {
    fn memory_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        if desired > self.ceiling {
            self.exceeded = true;
            return Err(HostFault::MemoryCeiling {
                desired,
                ceiling: self.ceiling,
            }
            .into());
        }
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: u32,
        desired: u32,
        _maximum: Option<u32>,
    ) -> anyhow::Result<bool> {
        Ok(desired <= MAX_TABLE_ELEMENTS)
    }
}

/// Outcome of one execution. The session always comes back, successful or not.
pub(crate) struct Execution {
    pub session: Session,
    pub fuel_left: u64,
    pub result: Result<Vec<u8>>,
}

/// Shared engine plus the linker holding every host function
pub struct Sandbox {
    engine: Engine,
    linker: Linker<HostContext>,
    config: Arc<RuntimeConfig>,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("max_memory_bytes", &self.config.max_memory_bytes)
            .field("max_call_depth", &self.config.max_call_depth)
            .finish()
    }
}

impl Sandbox {
    pub fn new(config: Arc<RuntimeConfig>) -> Result<Self> {
        let mut engine_config = Config::new();
        engine_config.consume_fuel(true);
        // Identical inputs must produce identical state on every host
        engine_config.cranelift_nan_canonicalization(true);
        let engine = Engine::new(&engine_config)
            .map_err(|e| Error::InvalidConfig(format!("failed to create engine: {}", e)))?;

        let mut linker = Linker::new(&engine);
        host::register(&mut linker)
            .map_err(|e| Error::InvalidConfig(format!("failed to link host functions: {}", e)))?;

        Ok(Sandbox {
            engine,
            linker,
            config,
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub(crate) fn linker(&self) -> &Linker<HostContext> {
        &self.linker
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Run `function` of `module` with `fuel`, buffering writes in `session`
    pub(crate) fn execute(
        &self,
        host: Arc<dyn ContractHost>,
        module: &LoadedModule,
        function: &str,
        input: Vec<u8>,
        fuel: u64,
        mut session: Session,
    ) -> Execution {
        session.enter(*module.id());
        let context = HostContext::new(host, *module.id(), input, session, self.config.clone());
        let mut store = Store::new(&self.engine, context);
        store.limiter(|ctx| &mut ctx.limiter);

        let run = store
            .set_fuel(fuel)
            .and_then(|()| run_entry_point(&mut store, module, function));
        let fuel_left = store.get_fuel().unwrap_or(0);

        let context = store.into_data();
        let memory_exceeded = context.limiter.exceeded;
        let (mut session, output) = context.finish();
        session.leave();

        let result = match run {
            Ok(()) => {
                session.complete(*module.id());
                Ok(output)
            }
            Err(err) => Err(classify(err, memory_exceeded)),
        };

        tracing::debug!(
            contract = %module.id().short(),
            function,
            fuel_used = fuel.saturating_sub(fuel_left),
            ok = result.is_ok(),
            "executed entry point"
        );

        Execution {
            session,
            fuel_left,
            result,
        }
    }
}

fn run_entry_point(
    store: &mut Store<HostContext>,
    module: &LoadedModule,
    function: &str,
) -> anyhow::Result<()> {
    let instance = module.instance_pre().instantiate(&mut *store)?;
    let entry = instance.get_typed_func::<(), ()>(&mut *store, function)?;
    entry.call(&mut *store, ())
}

/// Map an engine error onto the public taxonomy
pub(crate) fn classify(err: anyhow::Error, memory_exceeded: bool) -> Error {
    if let Some(fault) = err.downcast_ref::<HostFault>() {
        return match fault {
            HostFault::OutOfBudget(_) | HostFault::MemoryCeiling { .. } => {
                Error::BudgetExceeded(fault.to_string())
            }
            HostFault::Abort(_) | HostFault::Misuse(_) => Error::ExecutionTrapped(fault.to_string()),
        };
    }
    if memory_exceeded {
        return Error::BudgetExceeded("memory ceiling reached".into());
    }
    if let Some(trap) = err.downcast_ref::<Trap>() {
        if matches!(trap, Trap::OutOfFuel) {
            return Error::BudgetExceeded("fuel exhausted".into());
        }
        return Error::ExecutionTrapped(trap.to_string());
    }
    if let Some(error) = err.downcast_ref::<Error>() {
        return error.clone();
    }
    Error::ExecutionTrapped(format!("{:#}", err))
}
