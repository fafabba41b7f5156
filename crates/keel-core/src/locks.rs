//! Per-contract execution locks
//!
//! A contract is "held" from the start of an invocation that touches it until
//! that invocation commits or rolls back. Top-level calls wait for the lock;
//! nested calls wait at most `lock_timeout_ms` and fail instead of deadlocking.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::ContractId;

#[derive(Debug, Default)]
struct LockTable {
    held: Mutex<HashSet<ContractId>>,
    released: Condvar,
}

/// Shared table of held contracts
#[derive(Debug, Clone, Default)]
pub struct ContractLocks {
    table: Arc<LockTable>,
}

impl ContractLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `id` is free, then hold it
    pub fn lock(&self, id: ContractId) -> ContractLock {
        let mut held = self.table.held.lock();
        while held.contains(&id) {
            self.table.released.wait(&mut held);
        }
        held.insert(id);
        ContractLock {
            table: self.table.clone(),
            id,
        }
    }

    /// Hold `id`, waiting at most `timeout`
    pub fn try_lock_for(&self, id: ContractId, timeout: Duration) -> Option<ContractLock> {
        let deadline = Instant::now() + timeout;
        let mut held = self.table.held.lock();
        while held.contains(&id) {
            if self
                .table
                .released
                .wait_until(&mut held, deadline)
                .timed_out()
            {
                if held.contains(&id) {
                    return None;
                }
                break;
            }
        }
        held.insert(id);
        Some(ContractLock {
            table: self.table.clone(),
            id,
        })
    }

    pub fn is_held(&self, id: &ContractId) -> bool {
        self.table.held.lock().contains(id)
    }
}

/// RAII guard: releases the contract and wakes waiters on drop
#[derive(Debug)]
pub struct ContractLock {
    table: Arc<LockTable>,
    id: ContractId,
}

impl ContractLock {
    pub fn id(&self) -> &ContractId {
        &self.id
    }
}

impl Drop for ContractLock {
    fn drop(&mut self) {
        let mut held = self.table.held.lock();
        held.remove(&self.id);
        drop(held);
        self.table.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn id(n: u8) -> ContractId {
        ContractId::from_bytes([n; 32])
    }

    #[test]
    fn test_lock_release_on_drop() {
        let locks = ContractLocks::new();
        let guard = locks.lock(id(1));
        assert!(locks.is_held(&id(1)));
        assert!(!locks.is_held(&id(2)));
        drop(guard);
        assert!(!locks.is_held(&id(1)));
    }

    #[test]
    fn test_try_lock_times_out_while_held() {
        let locks = ContractLocks::new();
        let _guard = locks.lock(id(1));
        let start = Instant::now();
        assert!(locks.try_lock_for(id(1), Duration::from_millis(20)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert!(locks.try_lock_for(id(2), Duration::from_millis(20)).is_some());
    }

    #[test]
    fn test_waiter_acquires_after_release() {
        let locks = ContractLocks::new();
        let guard = locks.lock(id(1));
        let waiter = {
            let locks = locks.clone();
            thread::spawn(move || locks.try_lock_for(id(1), Duration::from_secs(5)).is_some())
        };
        thread::sleep(Duration::from_millis(10));
        drop(guard);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_lock_serializes_holders() {
        let locks = ContractLocks::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let locks = locks.clone();
                let inside = inside.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        let _guard = locks.lock(id(9));
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
