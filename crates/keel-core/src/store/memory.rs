//! In-memory state store — lives as long as the process

use parking_lot::RwLock;

use super::{CommitBatch, StateSnapshot, StateStore, StateTable};
use crate::{ContractId, Result};

/// Non-durable [`StateStore`] used when no data directory is configured
#[derive(Debug, Default)]
pub struct MemoryStore {
    table: StateTable,
    modules: RwLock<Vec<(ContractId, Vec<u8>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identities of every contract that has committed state
    pub fn contracts_with_state(&self) -> Vec<ContractId> {
        self.table.contract_ids()
    }
}

impl StateStore for MemoryStore {
    fn read(&self, id: &ContractId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.table.read(id, key))
    }

    fn snapshot(&self, id: &ContractId) -> Result<StateSnapshot> {
        Ok(self.table.snapshot(id))
    }

    fn commit(&self, batch: &CommitBatch) -> Result<()> {
        self.table.apply(batch);
        Ok(())
    }

    fn record_module(&self, id: &ContractId, code: &[u8]) -> Result<()> {
        let mut modules = self.modules.write();
        if !modules.iter().any(|(known, _)| known == id) {
            modules.push((*id, code.to_vec()));
        }
        Ok(())
    }

    fn modules(&self) -> Result<Vec<(ContractId, Vec<u8>)>> {
        Ok(self.modules.read().clone())
    }
}
