//! Keel Core - sandboxed contract execution engine
//!
//! Loads WebAssembly contracts, runs their entry points under a fuel budget
//! and a memory ceiling, and mediates every access to their persistent state.
//! Bindings (the C ABI used from Go, the CLI) are thin layers over this crate.
//!
//! # Architecture
//!
//! ```text
//! init ─→ Supervisor ─→ Runtime ─┬─→ Loader   (validate + pre-link → ContractId)
//!                                ├─→ Sandbox  (fuel, memory ceiling, host ABI)
//!                                │     └─→ Session overlay ─┐
//!                                └─→ StateStore ←─ commit ──┘
//!          Bridge: validates raw requests, leases result buffers
//! ```
//!
//! # Guarantees
//!
//! - **Deterministic identity**: a contract is addressed by SHA-256 of its bytes
//! - **Atomic**: a call's writes become visible together or not at all
//! - **Bounded**: every call runs under a fuel budget and a memory ceiling
//! - **Isolated**: a contract only sees its own keys; other contracts are
//!   reachable only through `call_contract`

pub mod bridge;
pub mod config;
pub mod error;
pub mod identity;
pub mod loader;
pub mod locks;
pub mod registry;
pub mod runtime;
pub mod sandbox;
pub mod store;
pub mod supervisor;
#[cfg(any(test, feature = "testing"))]
#[doc(hidden)]
pub mod testing;

pub use bridge::{BufferHandle, BufferLease, BufferRegistry, InvocationRequest};
pub use config::RuntimeConfig;
pub use error::{Error, Result, Status};
pub use identity::{ContractId, CONTRACT_ID_LEN};
pub use loader::{LoadedModule, ModuleInfo};
pub use runtime::{CallOutcome, CallReceipt, Runtime};
pub use store::{CompactionStats, FileStore, MemoryStore, StateSnapshot, StateStore, WriteSet};
pub use supervisor::Supervisor;
