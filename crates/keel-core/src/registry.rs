//! Registry of deployed contracts
//!
//! Lookups happen on every call, so modules sit in a concurrent map; a
//! separate list keeps deployment order for listings.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::loader::LoadedModule;
use crate::ContractId;

#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: DashMap<ContractId, Arc<LoadedModule>>,
    order: RwLock<Vec<ContractId>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &ContractId) -> Option<Arc<LoadedModule>> {
        self.modules.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &ContractId) -> bool {
        self.modules.contains_key(id)
    }

    /// Register a module. Returns `false` when the identity was already known.
    pub fn insert(&self, module: LoadedModule) -> bool {
        let id = *module.id();
        let mut order = self.order.write();
        if self.modules.contains_key(&id) {
            return false;
        }
        self.modules.insert(id, Arc::new(module));
        order.push(id);
        true
    }

    /// Identities in deployment order
    pub fn ids(&self) -> Vec<ContractId> {
        self.order.read().clone()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}
