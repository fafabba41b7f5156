//! Host Bridge — request validation and result buffer ownership
//!
//! Requests arrive as raw pointers and lengths from a foreign caller. They
//! are validated here before anything reaches the runtime.
//!
//! Result buffers are allocated by the bridge and owned by it until the
//! caller releases them. Each buffer is registered under a handle that is
//! never reused and under its address:
//!
//! - releasing by handle is exact: a handle below the issue counter that is
//!   no longer live was already released (`DoubleRelease`), anything else was
//!   never issued (`ForeignRelease`)
//! - releasing by address is backed by a quarantine: a released buffer is
//!   kept allocated until it falls out of a bounded ring, so its address
//!   cannot be handed out again while it is remembered and a stale second
//!   release is `DoubleRelease` rather than a release of some newer buffer
//!
//! Nothing the registry does not own is ever freed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::ffi::CStr;
use std::os::raw::c_char;

use parking_lot::Mutex;

use crate::{ContractId, Error, Result, RuntimeConfig};

// ── Request validation ────────────────────────────────────

/// A validated call request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationRequest {
    pub contract: ContractId,
    pub function: String,
    pub args: Vec<u8>,
    pub budget: u64,
}

impl InvocationRequest {
    /// Validate request parts. `budget` of `None` selects the configured default.
    pub fn new(
        contract: &[u8],
        function: Option<&[u8]>,
        args: &[u8],
        budget: Option<u64>,
        config: &RuntimeConfig,
    ) -> Result<Self> {
        let contract = ContractId::from_slice(contract)?;
        let function = match function {
            None => return Err(Error::InvalidArgument("function name is null".into())),
            Some([]) => return Err(Error::InvalidArgument("function name is empty".into())),
            Some(bytes) => std::str::from_utf8(bytes)
                .map_err(|_| Error::InvalidArgument("function name is not valid UTF-8".into()))?
                .to_string(),
        };
        let budget = budget.unwrap_or(config.default_budget);
        if budget == 0 {
            return Err(Error::InvalidArgument("budget must be > 0".into()));
        }
        if budget > config.max_budget {
            return Err(Error::InvalidArgument(format!(
                "budget {} exceeds max_budget {}",
                budget, config.max_budget
            )));
        }
        Ok(InvocationRequest {
            contract,
            function,
            args: args.to_vec(),
            budget,
        })
    }

    /// Validate a request made of raw foreign pointers.
    ///
    /// # Safety
    /// Non-null pointers must be valid for reads of their stated lengths;
    /// `function` must be null or point to a NUL-terminated string.
    pub unsafe fn from_raw(
        contract_ptr: *const u8,
        contract_len: usize,
        function: *const c_char,
        args_ptr: *const u8,
        args_len: usize,
        budget: Option<u64>,
        config: &RuntimeConfig,
    ) -> Result<Self> {
        let contract = raw_slice(contract_ptr, contract_len, "contract identity")?;
        let function = if function.is_null() {
            None
        } else {
            Some(CStr::from_ptr(function).to_bytes())
        };
        let args = raw_slice(args_ptr, args_len, "arguments")?;
        Self::new(contract, function, args, budget, config)
    }
}

/// Borrow `len` bytes at `ptr`. Null with length 0 is the empty slice;
/// null with a non-zero length is rejected.
///
/// # Safety
/// A non-null `ptr` must be valid for reads of `len` bytes for `'a`.
pub unsafe fn raw_slice<'a>(ptr: *const u8, len: usize, what: &str) -> Result<&'a [u8]> {
    if ptr.is_null() {
        if len == 0 {
            return Ok(&[]);
        }
        return Err(Error::InvalidArgument(format!(
            "{} pointer is null but length is {}",
            what, len
        )));
    }
    if len > isize::MAX as usize {
        return Err(Error::InvalidArgument(format!("{} length is too large", what)));
    }
    Ok(std::slice::from_raw_parts(ptr, len))
}

/// Read a contract identity from a raw pointer and length
///
/// # Safety
/// Same contract as [`raw_slice`].
pub unsafe fn contract_id_from_raw(ptr: *const u8, len: usize) -> Result<ContractId> {
    if ptr.is_null() || len == 0 {
        return Err(Error::InvalidArgument("contract identity is null or empty".into()));
    }
    ContractId::from_slice(raw_slice(ptr, len, "contract identity")?)
}

// ── Result buffers ────────────────────────────────────────

/// Handle of an issued buffer. `0` is never issued.
pub type BufferHandle = u64;

/// An issued buffer as seen by the foreign caller.
/// Empty results are a null pointer with length 0 and handle 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLease {
    pub handle: BufferHandle,
    pub ptr: *mut u8,
    pub len: usize,
}

impl BufferLease {
    pub fn empty() -> Self {
        BufferLease {
            handle: 0,
            ptr: std::ptr::null_mut(),
            len: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ptr.is_null()
    }
}

/// Released buffers held back from the allocator, by count
const QUARANTINE_BUFFERS: usize = 4096;

/// Released buffers held back from the allocator, by total size
const QUARANTINE_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug)]
struct Buffers {
    live: HashMap<BufferHandle, Box<[u8]>>,
    by_addr: HashMap<usize, BufferHandle>,
    /// Released buffers, oldest first. Still allocated, so their addresses
    /// cannot belong to a live buffer.
    quarantine: VecDeque<Box<[u8]>>,
    quarantined_addrs: HashSet<usize>,
    quarantined_bytes: usize,
    next_handle: BufferHandle,
}

impl Buffers {
    fn quarantine(&mut self, buffer: Box<[u8]>) {
        self.quarantined_addrs.insert(buffer.as_ptr() as usize);
        self.quarantined_bytes += buffer.len();
        self.quarantine.push_back(buffer);
        // The newest entry always stays so its own double release is caught
        while self.quarantine.len() > 1
            && (self.quarantine.len() > QUARANTINE_BUFFERS
                || self.quarantined_bytes > QUARANTINE_BYTES)
        {
            if let Some(oldest) = self.quarantine.pop_front() {
                self.quarantined_addrs.remove(&(oldest.as_ptr() as usize));
                self.quarantined_bytes -= oldest.len();
            }
        }
    }

    fn free(&mut self, handle: BufferHandle) -> bool {
        match self.live.remove(&handle) {
            Some(buffer) => {
                self.by_addr.remove(&(buffer.as_ptr() as usize));
                self.quarantine(buffer);
                true
            }
            None => false,
        }
    }
}

/// Owner of every buffer handed across the boundary
#[derive(Debug)]
pub struct BufferRegistry {
    buffers: Mutex<Buffers>,
}

impl Default for BufferRegistry {
    fn default() -> Self {
        BufferRegistry {
            buffers: Mutex::new(Buffers {
                live: HashMap::new(),
                by_addr: HashMap::new(),
                quarantine: VecDeque::new(),
                quarantined_addrs: HashSet::new(),
                quarantined_bytes: 0,
                next_handle: 1,
            }),
        }
    }
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `bytes` and hand out a lease for them
    pub fn issue(&self, bytes: Vec<u8>) -> BufferLease {
        if bytes.is_empty() {
            return BufferLease::empty();
        }
        let mut boxed = bytes.into_boxed_slice();
        let ptr = boxed.as_mut_ptr();
        let len = boxed.len();

        let mut buffers = self.buffers.lock();
        let handle = buffers.next_handle;
        buffers.next_handle += 1;
        buffers.by_addr.insert(ptr as usize, handle);
        buffers.live.insert(handle, boxed);
        BufferLease { handle, ptr, len }
    }

    /// Release by handle. Handle 0 (the empty lease) is a no-op.
    pub fn release(&self, handle: BufferHandle) -> Result<()> {
        if handle == 0 {
            return Ok(());
        }
        let mut buffers = self.buffers.lock();
        if buffers.free(handle) {
            return Ok(());
        }
        let err = if handle < buffers.next_handle {
            Error::DoubleRelease(format!("handle {}", handle))
        } else {
            Error::ForeignRelease(format!("handle {}", handle))
        };
        tracing::warn!(handle, error = %err, "rejected buffer release");
        Err(err)
    }

    /// Release by address. Null is a no-op.
    pub fn release_ptr(&self, ptr: *const u8) -> Result<()> {
        if ptr.is_null() {
            return Ok(());
        }
        let addr = ptr as usize;
        let mut buffers = self.buffers.lock();
        if let Some(handle) = buffers.by_addr.get(&addr).copied() {
            buffers.free(handle);
            return Ok(());
        }
        let err = if buffers.quarantined_addrs.contains(&addr) {
            Error::DoubleRelease(format!("{:#x}", addr))
        } else {
            Error::ForeignRelease(format!("{:#x}", addr))
        };
        tracing::warn!(addr = %format!("{:#x}", addr), error = %err, "rejected buffer release");
        Err(err)
    }

    /// Number of buffers not yet released
    pub fn live_count(&self) -> usize {
        self.buffers.lock().live.len()
    }

    pub fn live_bytes(&self) -> usize {
        self.buffers.lock().live.values().map(|b| b.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RuntimeConfig {
        RuntimeConfig::default()
    }

    fn valid_id() -> [u8; 32] {
        [7; 32]
    }

    #[test]
    fn test_request_validation() {
        let config = config();
        let ok = InvocationRequest::new(&valid_id(), Some(&b"run"[..]), b"x", None, &config).unwrap();
        assert_eq!(ok.function, "run");
        assert_eq!(ok.budget, config.default_budget);

        let run: Option<&[u8]> = Some(&b"run"[..]);
        let cases: [(&[u8], Option<&[u8]>, Option<u64>); 9] = [
            (&[], run, None),
            (&[7; 31], run, None),
            (&[7; 33], run, None),
            (&[0; 32], run, None),
            (&[7; 32], None, None),
            (&[7; 32], Some(&b""[..]), None),
            (&[7; 32], Some(&[0xff_u8, 0xfe][..]), None),
            (&[7; 32], run, Some(0)),
            (&[7; 32], run, Some(config.max_budget + 1)),
        ];
        for (contract, function, budget) in cases {
            let err = InvocationRequest::new(contract, function, &[], budget, &config).unwrap_err();
            assert!(matches!(err, Error::InvalidArgument(_)), "{:?}", err);
        }
    }

    #[test]
    fn test_raw_pointer_consistency() {
        let config = config();
        let id = valid_id();
        let name = b"run\0";
        unsafe {
            let ok = InvocationRequest::from_raw(
                id.as_ptr(),
                32,
                name.as_ptr() as *const c_char,
                std::ptr::null(),
                0,
                None,
                &config,
            )
            .unwrap();
            assert!(ok.args.is_empty());

            let err = InvocationRequest::from_raw(
                id.as_ptr(),
                32,
                name.as_ptr() as *const c_char,
                std::ptr::null(),
                4,
                None,
                &config,
            )
            .unwrap_err();
            assert!(matches!(err, Error::InvalidArgument(_)));

            let err = InvocationRequest::from_raw(
                std::ptr::null(),
                0,
                name.as_ptr() as *const c_char,
                std::ptr::null(),
                0,
                None,
                &config,
            )
            .unwrap_err();
            assert!(matches!(err, Error::InvalidArgument(_)));

            assert!(contract_id_from_raw(std::ptr::null(), 32).is_err());
            assert!(contract_id_from_raw(id.as_ptr(), 0).is_err());
            assert_eq!(
                contract_id_from_raw(id.as_ptr(), 32).unwrap(),
                ContractId::from_bytes(id)
            );
        }
    }

    #[test]
    fn test_issue_and_release_by_handle() {
        let registry = BufferRegistry::new();
        let lease = registry.issue(vec![1, 2, 3]);
        assert_eq!(lease.len, 3);
        assert_eq!(
            unsafe { std::slice::from_raw_parts(lease.ptr, lease.len) },
            &[1, 2, 3]
        );
        assert_eq!(registry.live_count(), 1);

        registry.release(lease.handle).unwrap();
        assert_eq!(registry.live_count(), 0);
        assert!(matches!(
            registry.release(lease.handle),
            Err(Error::DoubleRelease(_))
        ));
        assert!(matches!(registry.release(999), Err(Error::ForeignRelease(_))));
    }

    #[test]
    fn test_release_by_pointer() {
        let registry = BufferRegistry::new();
        let lease = registry.issue(vec![9; 16]);
        registry.release_ptr(lease.ptr).unwrap();
        assert!(matches!(
            registry.release_ptr(lease.ptr),
            Err(Error::DoubleRelease(_))
        ));

        let foreign = [0u8; 4];
        assert!(matches!(
            registry.release_ptr(foreign.as_ptr()),
            Err(Error::ForeignRelease(_))
        ));
        assert!(registry.release_ptr(std::ptr::null()).is_ok());
    }

    #[test]
    fn test_empty_result_is_null_lease() {
        let registry = BufferRegistry::new();
        let lease = registry.issue(Vec::new());
        assert!(lease.is_empty());
        assert_eq!(lease.len, 0);
        assert_eq!(registry.live_count(), 0);
        registry.release(lease.handle).unwrap();
    }

    #[test]
    fn test_double_release_leaves_other_buffers_intact() {
        let registry = BufferRegistry::new();
        let a = registry.issue(vec![1; 8]);
        let b = registry.issue(vec![2; 8]);
        registry.release(a.handle).unwrap();
        assert!(registry.release(a.handle).is_err());
        assert_eq!(registry.live_count(), 1);
        assert_eq!(registry.live_bytes(), 8);
        assert_eq!(unsafe { std::slice::from_raw_parts(b.ptr, b.len) }, &[2; 8]);
        registry.release(b.handle).unwrap();
    }

    #[test]
    fn test_stale_release_never_frees_a_newer_buffer() {
        let registry = BufferRegistry::new();
        for round in 0..100u8 {
            let a = registry.issue(vec![round; 32]);
            registry.release_ptr(a.ptr).unwrap();

            let b = registry.issue(vec![round.wrapping_add(1); 32]);
            assert_ne!(a.ptr, b.ptr, "released address reissued in round {}", round);
            assert!(matches!(
                registry.release_ptr(a.ptr),
                Err(Error::DoubleRelease(_))
            ));

            assert_eq!(registry.live_count(), 1);
            assert_eq!(
                unsafe { std::slice::from_raw_parts(b.ptr, b.len) },
                &[round.wrapping_add(1); 32][..]
            );
            registry.release_ptr(b.ptr).unwrap();
        }
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn test_quarantine_is_bounded() {
        let registry = BufferRegistry::new();
        for i in 0..(QUARANTINE_BUFFERS + 100) {
            let lease = registry.issue(vec![i as u8; 8]);
            registry.release(lease.handle).unwrap();
        }
        let buffers = registry.buffers.lock();
        assert_eq!(buffers.quarantine.len(), QUARANTINE_BUFFERS);
        assert_eq!(buffers.quarantined_addrs.len(), QUARANTINE_BUFFERS);
        assert_eq!(buffers.quarantined_bytes, QUARANTINE_BUFFERS * 8);
    }

    #[test]
    fn test_oversized_release_stays_detectable() {
        let registry = BufferRegistry::new();
        let big = registry.issue(vec![1; QUARANTINE_BYTES + 1]);
        registry.release_ptr(big.ptr).unwrap();
        assert!(matches!(
            registry.release_ptr(big.ptr),
            Err(Error::DoubleRelease(_))
        ));

        // The next release pushes it out of the byte budget
        let small = registry.issue(vec![2; 8]);
        registry.release(small.handle).unwrap();
        let buffers = registry.buffers.lock();
        assert_eq!(buffers.quarantine.len(), 1);
        assert_eq!(buffers.quarantined_bytes, 8);
    }
}
