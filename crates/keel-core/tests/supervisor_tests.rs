//! Process-wide supervisor lifecycle
//!
//! The supervisor is a process global, so the whole lifecycle runs in one
//! test inside its own test binary.

use keel_core::supervisor::{global, init_runtime};
use keel_core::testing::{decode_u64, COUNTER_WAT};
use keel_core::{Error, InvocationRequest, StateSnapshot, Status};

#[test]
fn test_supervisor_lifecycle() {
    // Before init
    assert_eq!(global().unwrap_err(), Error::NotInitialized);
    assert_eq!(Error::NotInitialized.status(), Status::NotInitialized);

    // Bad configuration leaves the process uninitialized
    let err = init_runtime(r#"{"max_call_depth": 0}"#).unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));
    assert!(global().is_err());

    // First init, then an equal configuration is a no-op
    let config = r#"{"default_budget": 2000000}"#;
    let supervisor = init_runtime(config).unwrap();
    assert!(init_runtime("{ \"default_budget\": 2000000 }").is_ok());
    assert_eq!(init_runtime("").unwrap_err(), Error::AlreadyInitialized);
    assert!(std::ptr::eq(supervisor, global().unwrap()));

    // Deploy, call, read, release
    let id = supervisor
        .deploy(&wat::parse_str(COUNTER_WAT).unwrap())
        .unwrap();
    let request = InvocationRequest::new(
        id.as_bytes(),
        Some(&b"increment"[..]),
        &[],
        None,
        supervisor.config(),
    )
    .unwrap();
    assert_eq!(request.budget, 2_000_000);

    for expected in 1..=2u64 {
        let lease = supervisor.call(&request).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(lease.ptr, lease.len) };
        assert_eq!(decode_u64(bytes), Some(expected));
        supervisor.release(lease.handle).unwrap();
    }

    let lease = supervisor.get_state(&id).unwrap();
    let snapshot =
        StateSnapshot::decode(unsafe { std::slice::from_raw_parts(lease.ptr, lease.len) }).unwrap();
    assert_eq!(snapshot.get(b"count"), Some(&2u64.to_le_bytes()[..]));
    supervisor.release(lease.handle).unwrap();
    assert_eq!(
        supervisor.release(lease.handle).unwrap_err().status(),
        Status::DoubleRelease
    );
    assert_eq!(supervisor.buffers().live_count(), 0);
}
