//! Runtime — deploy, call and read contracts against one state store
//!
//! A [`Runtime`] is cheap to clone and safe to share across threads. Calls to
//! the same contract are serialized by its lock; calls to unrelated
//! contracts run in parallel on the callers' threads.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::loader::{self, LoadedModule, ModuleInfo};
use crate::locks::ContractLocks;
use crate::registry::ModuleRegistry;
use crate::sandbox::{ContractHost, Sandbox, Session};
use crate::store::{CompactionStats, FileStore, MemoryStore, StateSnapshot, StateStore};
use crate::{ContractId, Error, Result, RuntimeConfig};

/// Result bytes of a successful call plus its receipt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOutcome {
    pub output: Vec<u8>,
    pub receipt: CallReceipt,
}

/// Accounting for one committed call
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CallReceipt {
    pub fuel_used: u64,
    /// Key writes committed across all contracts
    pub writes: usize,
    /// Contracts that ran to completion during the call, nested callees
    /// included; a callee that failed and was rolled back is left out
    pub contracts: Vec<ContractId>,
    #[serde(with = "duration_micros")]
    pub elapsed: Duration,
}

mod duration_micros {
    use std::time::Duration;

    pub fn serialize<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_micros() as u64)
    }
}

struct RuntimeInner {
    config: Arc<RuntimeConfig>,
    sandbox: Sandbox,
    registry: ModuleRegistry,
    store: Arc<dyn StateStore>,
    /// Same store as `store` when it is file-backed, for compaction
    file_store: Option<Arc<FileStore>>,
    locks: ContractLocks,
}

impl ContractHost for RuntimeInner {
    fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    fn module(&self, id: &ContractId) -> Option<Arc<LoadedModule>> {
        self.registry.get(id)
    }

    fn read_committed(&self, id: &ContractId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.store.read(id, key)
    }

    fn locks(&self) -> &ContractLocks {
        &self.locks
    }
}

#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("contracts", &self.inner.registry.len())
            .field("durable", &self.inner.file_store.is_some())
            .finish()
    }
}

impl Runtime {
    /// Open a runtime. With `data_dir` set, state and modules are recovered
    /// from the directory; otherwise everything lives in memory.
    pub fn open(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        match &config.data_dir {
            Some(dir) => {
                let file_store = Arc::new(FileStore::open(dir, config.sync_writes)?);
                let store: Arc<dyn StateStore> = file_store.clone();
                Self::build(config, store, Some(file_store))
            }
            None => Self::build(config, Arc::new(MemoryStore::new()), None),
        }
    }

    /// Open a runtime on a caller-provided store
    pub fn with_store(config: RuntimeConfig, store: Arc<dyn StateStore>) -> Result<Self> {
        config.validate()?;
        Self::build(config, store, None)
    }

    fn build(
        config: RuntimeConfig,
        store: Arc<dyn StateStore>,
        file_store: Option<Arc<FileStore>>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let runtime = Runtime {
            inner: Arc::new(RuntimeInner {
                sandbox: Sandbox::new(config.clone())?,
                config,
                registry: ModuleRegistry::new(),
                store,
                file_store,
                locks: ContractLocks::new(),
            }),
        };
        runtime.recover()?;
        Ok(runtime)
    }

    /// Re-register every module the store knows about
    fn recover(&self) -> Result<()> {
        let recorded = self.inner.store.modules()?;
        if recorded.is_empty() {
            return Ok(());
        }
        let mut restored = 0usize;
        for (id, code) in recorded {
            if ContractId::for_module(&code) != id {
                tracing::warn!(contract = %id, "recorded module does not match its identity, skipping");
                continue;
            }
            match loader::load(&self.inner.sandbox, &code) {
                Ok(module) => {
                    self.inner.registry.insert(module);
                    restored += 1;
                }
                Err(e) => {
                    tracing::warn!(contract = %id, error = %e, "recorded module no longer loads, skipping");
                }
            }
        }
        tracing::info!(contracts = restored, "recovered deployed contracts");
        Ok(())
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    // ── Deploy ────────────────────────────────────────────

    /// Validate and register a module, returning its identity.
    /// Deploying identical bytes again returns the same identity.
    pub fn deploy(&self, code: &[u8]) -> Result<ContractId> {
        let limit = self.inner.config.max_module_bytes;
        if code.len() > limit {
            return Err(Error::ResourceExhausted(format!(
                "module is {} bytes, limit is {} bytes",
                code.len(),
                limit
            )));
        }
        let id = ContractId::for_module(code);
        if self.inner.registry.contains(&id) {
            tracing::debug!(contract = %id.short(), "module already deployed");
            return Ok(id);
        }

        let module = loader::load(&self.inner.sandbox, code)?;
        let entry_points = module.entry_points().count();
        self.inner.store.record_module(&id, code)?;
        if self.inner.registry.insert(module) {
            tracing::info!(
                contract = %id,
                size = code.len(),
                entry_points,
                "deployed contract"
            );
        }
        Ok(id)
    }

    /// Validate a module without deploying it
    pub fn inspect(&self, code: &[u8]) -> Result<ModuleInfo> {
        Ok(loader::load(&self.inner.sandbox, code)?.info())
    }

    pub fn module_info(&self, id: &ContractId) -> Result<ModuleInfo> {
        self.inner
            .registry
            .get(id)
            .map(|module| module.info())
            .ok_or_else(|| Error::UnknownContract(id.to_hex()))
    }

    /// Deployed identities, in deployment order
    pub fn contracts(&self) -> Vec<ContractId> {
        self.inner.registry.ids()
    }

    // ── Call ──────────────────────────────────────────────

    /// Call an entry point with the default budget
    pub fn call(&self, id: &ContractId, function: &str, args: &[u8]) -> Result<CallOutcome> {
        self.call_with_budget(id, function, args, self.inner.config.default_budget)
    }

    /// Call an entry point with an explicit fuel budget.
    ///
    /// Writes commit atomically when the call succeeds and are discarded
    /// when it fails for any reason.
    pub fn call_with_budget(
        &self,
        id: &ContractId,
        function: &str,
        args: &[u8],
        budget: u64,
    ) -> Result<CallOutcome> {
        if budget == 0 || budget > self.inner.config.max_budget {
            return Err(Error::InvalidArgument(format!(
                "budget must be between 1 and {}",
                self.inner.config.max_budget
            )));
        }
        let module = self
            .inner
            .registry
            .get(id)
            .ok_or_else(|| Error::UnknownContract(id.to_hex()))?;
        if !module.has_entry_point(function) {
            return Err(Error::UnknownFunction(function.to_string()));
        }

        let started = Instant::now();
        let session = Session::with_lock(self.inner.locks.lock(*id));
        let host: Arc<dyn ContractHost> = self.inner.clone();
        let execution =
            self.inner
                .sandbox
                .execute(host, &module, function, args.to_vec(), budget, session);
        let fuel_used = budget.saturating_sub(execution.fuel_left);

        let output = match execution.result {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(
                    contract = %id.short(),
                    function,
                    fuel_used,
                    error = %e,
                    "call failed, writes rolled back"
                );
                return Err(e);
            }
        };

        // Locks stay held until the batch is committed
        let mut session = execution.session;
        let contracts = session.executed();
        let mut batch = std::mem::take(&mut session.overlay);
        batch.prune();
        let writes = batch.write_count();
        self.inner.store.commit(&batch)?;
        drop(session);

        let receipt = CallReceipt {
            fuel_used,
            writes,
            contracts,
            elapsed: started.elapsed(),
        };
        tracing::debug!(
            contract = %id.short(),
            function,
            fuel_used,
            writes,
            output_len = output.len(),
            "call committed"
        );
        Ok(CallOutcome { output, receipt })
    }

    // ── State ─────────────────────────────────────────────

    /// Committed state of a deployed contract
    pub fn get_state(&self, id: &ContractId) -> Result<StateSnapshot> {
        if !self.inner.registry.contains(id) {
            return Err(Error::UnknownContract(id.to_hex()));
        }
        self.inner.store.snapshot(id)
    }

    /// Compact the durable log. `None` when the runtime is not file-backed.
    pub fn compact(&self) -> Result<Option<CompactionStats>> {
        match &self.inner.file_store {
            Some(store) => store.compact().map(Some),
            None => Ok(None),
        }
    }
}
