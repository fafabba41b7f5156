//! C-FFI layer for Keel — used by Go (cgo) and other FFI consumers.
//!
//! ZERO logic here. All calls delegate to `keel-core`.
//!
//! # Status Contract
//!
//! Every function that can fail returns an `int32_t` status: `0` on success,
//! otherwise the code of the failure (see `include/keel.h`). The message of
//! the most recent failure on the calling thread is available from
//! `keel_last_error()`. Panics never cross the boundary; they surface as
//! status `99`.
//!
//! # Memory Contract
//!
//! Result bytes are written to caller-provided out-parameters as a pointer
//! and a length. The runtime owns the bytes until the caller hands the
//! pointer back to `keel_free_buffer()` (or `keel_release_buffer()`), exactly
//! once. Empty results are a null pointer with length 0 and need no release.
//! Strings from `keel_last_error()` are freed with `keel_free_string()`.

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::panic::{self, AssertUnwindSafe};

use keel_core::bridge::{contract_id_from_raw, raw_slice};
use keel_core::supervisor::{self, Supervisor};
use keel_core::{BufferLease, Error, InvocationRequest, Result, Status, CONTRACT_ID_LEN};

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(message: String) {
    let message = CString::new(message.replace('\0', " ")).unwrap_or_default();
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(message));
}

fn clear_last_error() {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = None);
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run `f`, converting its outcome (or a panic) into a status code
fn guard<F: FnOnce() -> Result<()>>(f: F) -> i32 {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => {
            clear_last_error();
            Status::Ok.code()
        }
        Ok(Err(e)) => {
            let status = e.status();
            set_last_error(e.to_string());
            status.code()
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(%message, "panic caught at the C boundary");
            set_last_error(format!("internal error: {}", message));
            Status::Internal.code()
        }
    }
}

/// Helper: convert a C string pointer to a Rust &str.
/// A null pointer is `None`; invalid UTF-8 is rejected.
unsafe fn cstr_to_str<'a>(ptr: *const c_char, what: &str) -> Result<Option<&'a str>> {
    if ptr.is_null() {
        return Ok(None);
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map(Some)
        .map_err(|_| Error::InvalidArgument(format!("{} is not valid UTF-8", what)))
}

/// Reset both out-parameters so callers never see stale values on failure
unsafe fn reset_out(out_ptr: *mut *mut u8, out_len: *mut usize) -> Result<()> {
    if out_ptr.is_null() || out_len.is_null() {
        return Err(Error::InvalidArgument("output pointers must not be null".into()));
    }
    *out_ptr = std::ptr::null_mut();
    *out_len = 0;
    Ok(())
}

unsafe fn write_out(lease: BufferLease, out_ptr: *mut *mut u8, out_len: *mut usize) {
    *out_ptr = lease.ptr;
    *out_len = lease.len;
}

fn install_logging(supervisor: &Supervisor) {
    if let Some(filter) = &supervisor.config().log_filter {
        // A host process may already own a subscriber; keep theirs
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
            .with_writer(std::io::stderr)
            .try_init();
    }
}

/// Initialize the process-wide runtime from JSON configuration text.
/// Null or empty text selects the defaults. Calling again with an equal
/// configuration is a no-op; a different configuration fails with
/// `KEEL_ALREADY_INITIALIZED`.
///
/// # Safety
/// `config` must be null or a valid null-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn keel_init_runtime(config: *const c_char) -> i32 {
    guard(|| {
        let text = cstr_to_str(config, "configuration")?.unwrap_or("");
        let supervisor = supervisor::init_runtime(text)?;
        install_logging(supervisor);
        Ok(())
    })
}

/// Deploy module bytes. On success the 32-byte contract identity is written
/// to `id_out`.
///
/// # Safety
/// `code` must be valid for reads of `code_len` bytes; `id_out` must be
/// valid for writes of 32 bytes.
#[no_mangle]
pub unsafe extern "C" fn keel_deploy_contract(
    code: *const u8,
    code_len: usize,
    id_out: *mut u8,
) -> i32 {
    guard(|| {
        if id_out.is_null() {
            return Err(Error::InvalidArgument("identity output pointer is null".into()));
        }
        let supervisor = supervisor::global()?;
        let code = raw_slice(code, code_len, "module")?;
        let id = supervisor.deploy(code)?;
        std::ptr::copy_nonoverlapping(id.as_bytes().as_ptr(), id_out, CONTRACT_ID_LEN);
        Ok(())
    })
}

/// Call an entry point under the configured default budget.
///
/// # Safety
/// See [`keel_call_contract_with_budget`].
#[no_mangle]
pub unsafe extern "C" fn keel_call_contract(
    id: *const u8,
    id_len: usize,
    function: *const c_char,
    args: *const u8,
    args_len: usize,
    out_ptr: *mut *mut u8,
    out_len: *mut usize,
) -> i32 {
    call(id, id_len, function, args, args_len, None, out_ptr, out_len)
}

/// Call an entry point under an explicit fuel budget.
///
/// # Safety
/// `id` must be valid for reads of `id_len` bytes and `args` for `args_len`
/// bytes (null is allowed when the length is 0). `function` must be a valid
/// null-terminated C string. `out_ptr` and `out_len` must be valid for writes.
/// A non-null result must be released with `keel_free_buffer()`.
#[no_mangle]
pub unsafe extern "C" fn keel_call_contract_with_budget(
    id: *const u8,
    id_len: usize,
    function: *const c_char,
    args: *const u8,
    args_len: usize,
    budget: u64,
    out_ptr: *mut *mut u8,
    out_len: *mut usize,
) -> i32 {
    call(id, id_len, function, args, args_len, Some(budget), out_ptr, out_len)
}

#[allow(clippy::too_many_arguments)]
unsafe fn call(
    id: *const u8,
    id_len: usize,
    function: *const c_char,
    args: *const u8,
    args_len: usize,
    budget: Option<u64>,
    out_ptr: *mut *mut u8,
    out_len: *mut usize,
) -> i32 {
    guard(|| {
        reset_out(out_ptr, out_len)?;
        let supervisor = supervisor::global()?;
        if id.is_null() || id_len == 0 {
            return Err(Error::InvalidArgument("contract identity is null or empty".into()));
        }
        let request = InvocationRequest::from_raw(
            id,
            id_len,
            function,
            args,
            args_len,
            budget,
            supervisor.config(),
        )?;
        let lease = supervisor.call(&request)?;
        write_out(lease, out_ptr, out_len);
        Ok(())
    })
}

/// Read the committed state of a contract as an encoded snapshot.
///
/// # Safety
/// `id` must be valid for reads of `id_len` bytes. `out_ptr` and `out_len`
/// must be valid for writes. A non-null result must be released with
/// `keel_free_buffer()`.
#[no_mangle]
pub unsafe extern "C" fn keel_get_state(
    id: *const u8,
    id_len: usize,
    out_ptr: *mut *mut u8,
    out_len: *mut usize,
) -> i32 {
    guard(|| {
        reset_out(out_ptr, out_len)?;
        let supervisor = supervisor::global()?;
        let id = contract_id_from_raw(id, id_len)?;
        let lease = supervisor.get_state(&id)?;
        write_out(lease, out_ptr, out_len);
        Ok(())
    })
}

/// Release a result buffer and report the outcome: `KEEL_DOUBLE_RELEASE`
/// and `KEEL_FOREIGN_RELEASE` flag misuse without touching memory. Null is a
/// no-op.
///
/// # Safety
/// `ptr` must be null or a pointer previously returned through an out-parameter.
#[no_mangle]
pub unsafe extern "C" fn keel_release_buffer(ptr: *mut u8) -> i32 {
    guard(|| {
        if ptr.is_null() {
            return Ok(());
        }
        supervisor::global()?.release_ptr(ptr)
    })
}

/// Release a result buffer. Misuse is detected, logged and ignored.
///
/// # Safety
/// Same contract as [`keel_release_buffer`].
#[no_mangle]
pub unsafe extern "C" fn keel_free_buffer(ptr: *mut u8) {
    let _ = keel_release_buffer(ptr);
}

/// Message of the last failure on this thread, or null if the last call
/// succeeded. The caller must free it with `keel_free_string()`.
#[no_mangle]
pub extern "C" fn keel_last_error() -> *mut c_char {
    LAST_ERROR.with(|slot| match slot.borrow().as_ref() {
        Some(message) => message.clone().into_raw(),
        None => std::ptr::null_mut(),
    })
}

/// Free a string previously returned by `keel_last_error()`.
///
/// # Safety
/// `ptr` must be a pointer previously returned by `keel_last_error()`,
/// or null (in which case this is a no-op).
#[no_mangle]
pub unsafe extern "C" fn keel_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::testing::{counter_wat_salted, decode_u64};
    use keel_core::StateSnapshot;

    // Every test shares the process-wide runtime, so all initialize with the
    // same configuration and deploy their own salted counter.
    const CONFIG: &[u8] = b"{\"default_budget\": 5000000}\0";

    fn init() {
        let status = unsafe { keel_init_runtime(CONFIG.as_ptr() as *const c_char) };
        assert_eq!(status, 0, "init failed: {:?}", last_error());
    }

    fn last_error() -> Option<String> {
        let ptr = keel_last_error();
        if ptr.is_null() {
            return None;
        }
        let message = unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned();
        unsafe { keel_free_string(ptr) };
        Some(message)
    }

    fn deploy(salt: &str) -> [u8; CONTRACT_ID_LEN] {
        let code = wat::parse_str(counter_wat_salted(salt)).unwrap();
        let mut id = [0u8; CONTRACT_ID_LEN];
        let status = unsafe { keel_deploy_contract(code.as_ptr(), code.len(), id.as_mut_ptr()) };
        assert_eq!(status, 0);
        id
    }

    fn call(id: &[u8], function: &str) -> (i32, *mut u8, usize) {
        let name = CString::new(function).unwrap();
        let mut ptr = std::ptr::null_mut();
        let mut len = 0usize;
        let status = unsafe {
            keel_call_contract(
                id.as_ptr(),
                id.len(),
                name.as_ptr(),
                std::ptr::null(),
                0,
                &mut ptr,
                &mut len,
            )
        };
        (status, ptr, len)
    }

    fn take(ptr: *mut u8, len: usize) -> Vec<u8> {
        let bytes = unsafe { std::slice::from_raw_parts(ptr, len) }.to_vec();
        assert_eq!(unsafe { keel_release_buffer(ptr) }, 0);
        bytes
    }

    // ── Init ──────────────────────────────────────────────

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();
        assert!(last_error().is_none());
    }

    #[test]
    fn test_init_with_different_config_fails() {
        init();
        let other = b"{\"default_budget\": 7}\0";
        let status = unsafe { keel_init_runtime(other.as_ptr() as *const c_char) };
        assert_eq!(status, Status::AlreadyInitialized.code());
        assert!(last_error().unwrap().contains("already initialized"));
    }

    // ── Counter scenario ──────────────────────────────────

    #[test]
    fn test_counter_through_c_abi() {
        init();
        let id = deploy("ffi-counter");

        for expected in 1..=2u64 {
            let (status, ptr, len) = call(&id, "increment");
            assert_eq!(status, 0);
            assert_eq!(decode_u64(&take(ptr, len)), Some(expected));
        }

        let mut ptr = std::ptr::null_mut();
        let mut len = 0usize;
        let status = unsafe { keel_get_state(id.as_ptr(), id.len(), &mut ptr, &mut len) };
        assert_eq!(status, 0);
        let snapshot = StateSnapshot::decode(&take(ptr, len)).unwrap();
        assert_eq!(snapshot.version, 2);
        assert_eq!(snapshot.get(b"count"), Some(&2u64.to_le_bytes()[..]));
    }

    #[test]
    fn test_deploy_is_idempotent() {
        init();
        assert_eq!(deploy("ffi-idempotent"), deploy("ffi-idempotent"));
        assert_ne!(deploy("ffi-idempotent"), deploy("ffi-other"));
    }

    // ── Failures ──────────────────────────────────────────

    #[test]
    fn test_failures_map_to_status_codes() {
        init();
        let id = deploy("ffi-failures");

        let (status, ptr, len) = call(&id, "missing");
        assert_eq!(status, Status::UnknownFunction.code());
        assert!(ptr.is_null());
        assert_eq!(len, 0);
        assert!(last_error().unwrap().contains("missing"));

        let (status, _, _) = call(&id, "increment_then_spin");
        assert_eq!(status, Status::BudgetExceeded.code());

        let (status, _, _) = call(&id, "increment_then_trap");
        assert_eq!(status, Status::ExecutionTrapped.code());

        let (status, _, _) = call(&[7u8; CONTRACT_ID_LEN], "increment");
        assert_eq!(status, Status::UnknownContract.code());

        // Failed calls left nothing behind
        let (status, ptr, len) = call(&id, "get");
        assert_eq!(status, 0);
        assert_eq!(decode_u64(&take(ptr, len)), Some(0));
    }

    #[test]
    fn test_invalid_arguments() {
        init();
        let id = deploy("ffi-arguments");
        let name = CString::new("increment").unwrap();
        let mut ptr = std::ptr::null_mut();
        let mut len = 0usize;

        let (status, _, _) = call(&id[..31], "increment");
        assert_eq!(status, Status::InvalidArgument.code());
        let (status, _, _) = call(&[0u8; CONTRACT_ID_LEN], "increment");
        assert_eq!(status, Status::InvalidArgument.code());
        let (status, _, _) = call(&id, "");
        assert_eq!(status, Status::InvalidArgument.code());

        // Null function name
        let status = unsafe {
            keel_call_contract(id.as_ptr(), id.len(), std::ptr::null(), std::ptr::null(), 0, &mut ptr, &mut len)
        };
        assert_eq!(status, Status::InvalidArgument.code());

        // Null argument pointer with a non-zero length
        let status = unsafe {
            keel_call_contract(id.as_ptr(), id.len(), name.as_ptr(), std::ptr::null(), 4, &mut ptr, &mut len)
        };
        assert_eq!(status, Status::InvalidArgument.code());

        // Zero budget
        let status = unsafe {
            keel_call_contract_with_budget(
                id.as_ptr(),
                id.len(),
                name.as_ptr(),
                std::ptr::null(),
                0,
                0,
                &mut ptr,
                &mut len,
            )
        };
        assert_eq!(status, Status::InvalidArgument.code());

        // Null out-parameters
        let status = unsafe {
            keel_call_contract(
                id.as_ptr(),
                id.len(),
                name.as_ptr(),
                std::ptr::null(),
                0,
                std::ptr::null_mut(),
                &mut len,
            )
        };
        assert_eq!(status, Status::InvalidArgument.code());
    }

    #[test]
    fn test_echo_with_explicit_budget() {
        init();
        let id = deploy("ffi-echo");
        let name = CString::new("echo").unwrap();
        let args = b"payload";
        let mut ptr = std::ptr::null_mut();
        let mut len = 0usize;
        let status = unsafe {
            keel_call_contract_with_budget(
                id.as_ptr(),
                id.len(),
                name.as_ptr(),
                args.as_ptr(),
                args.len(),
                1_000_000,
                &mut ptr,
                &mut len,
            )
        };
        assert_eq!(status, 0);
        assert_eq!(take(ptr, len), b"payload");
    }

    // ── Buffers ───────────────────────────────────────────

    #[test]
    fn test_release_misuse_is_detected() {
        init();
        let id = deploy("ffi-release");
        let (status, ptr, _) = call(&id, "increment");
        assert_eq!(status, 0);

        assert_eq!(unsafe { keel_release_buffer(ptr) }, 0);
        assert_eq!(
            unsafe { keel_release_buffer(ptr) },
            Status::DoubleRelease.code()
        );

        let mut local = [0u8; 8];
        assert_eq!(
            unsafe { keel_release_buffer(local.as_mut_ptr()) },
            Status::ForeignRelease.code()
        );

        // Null is a no-op; free_buffer swallows misuse
        assert_eq!(unsafe { keel_release_buffer(std::ptr::null_mut()) }, 0);
        unsafe { keel_free_buffer(std::ptr::null_mut()) };
        unsafe { keel_free_buffer(local.as_mut_ptr()) };
    }

    #[test]
    fn test_empty_result_is_null() {
        init();
        let id = deploy("ffi-empty");
        let (status, ptr, len) = call(&id, "reset");
        assert_eq!(status, 0);
        assert!(ptr.is_null());
        assert_eq!(len, 0);
        unsafe { keel_free_buffer(ptr) };
    }

    #[test]
    fn test_header_status_codes_match() {
        let header = include_str!("../include/keel.h");
        let expected = [
            ("KEEL_OK", Status::Ok),
            ("KEEL_ALREADY_INITIALIZED", Status::AlreadyInitialized),
            ("KEEL_NOT_INITIALIZED", Status::NotInitialized),
            ("KEEL_INVALID_CONFIG", Status::InvalidConfig),
            ("KEEL_INVALID_MODULE", Status::InvalidModule),
            ("KEEL_RESOURCE_EXHAUSTED", Status::ResourceExhausted),
            ("KEEL_UNKNOWN_CONTRACT", Status::UnknownContract),
            ("KEEL_UNKNOWN_FUNCTION", Status::UnknownFunction),
            ("KEEL_BUDGET_EXCEEDED", Status::BudgetExceeded),
            ("KEEL_EXECUTION_TRAPPED", Status::ExecutionTrapped),
            ("KEEL_INVALID_ARGUMENT", Status::InvalidArgument),
            ("KEEL_DOUBLE_RELEASE", Status::DoubleRelease),
            ("KEEL_FOREIGN_RELEASE", Status::ForeignRelease),
            ("KEEL_STORAGE", Status::Storage),
            ("KEEL_INTERNAL", Status::Internal),
        ];
        for (name, status) in expected {
            let line = format!("#define {} {}\n", name, status.code());
            assert!(header.contains(&line), "keel.h is missing `{}`", line.trim());
        }
    }

    #[test]
    fn test_last_error_cleared_on_success() {
        init();
        let id = deploy("ffi-last-error");
        let (status, _, _) = call(&id, "missing");
        assert_ne!(status, 0);
        let (status, ptr, len) = call(&id, "get");
        assert_eq!(status, 0);
        take(ptr, len);
        assert!(last_error().is_none());
    }
}
