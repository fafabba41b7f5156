//! WAT fixtures shared by unit tests, integration tests and the bindings.
//!
//! All contracts use the `contract` host namespace. Counter values and
//! results are little-endian `u64`s.

/// Counter contract keeping a `u64` under the key `count`.
///
/// Entry points: `increment` and `get` return the counter; the
/// `increment_then_*` variants bump the counter and then fail in a specific
/// way; `echo` returns its arguments; `reset` deletes the key; `oob` reads
/// past linear memory; `bad_pointer` hands the host an out-of-bounds key.
pub const COUNTER_WAT: &str = r#"
(module
  (import "contract" "input_len" (func $input_len (result i32)))
  (import "contract" "input_read" (func $input_read (param i32)))
  (import "contract" "set_call_result" (func $set_result (param i32 i32)))
  (import "contract" "state_get" (func $state_get (param i32 i32) (result i64)))
  (import "contract" "state_read_value" (func $state_read (param i32 i32) (result i32)))
  (import "contract" "state_set" (func $state_set (param i32 i32 i32 i32)))
  (import "contract" "state_delete" (func $state_delete (param i32 i32)))
  (import "contract" "abort" (func $abort (param i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "count")

  (func $load (result i64)
    (if (i64.lt_s (call $state_get (i32.const 0) (i32.const 5)) (i64.const 0))
      (then (return (i64.const 0))))
    (drop (call $state_read (i32.const 16) (i32.const 8)))
    (i64.load (i32.const 16)))

  (func $store (param $n i64)
    (i64.store (i32.const 16) (local.get $n))
    (call $state_set (i32.const 0) (i32.const 5) (i32.const 16) (i32.const 8)))

  (func $bump (result i64)
    (local $n i64)
    (local.set $n (i64.add (call $load) (i64.const 1)))
    (call $store (local.get $n))
    (local.get $n))

  (func $return_u64 (param $n i64)
    (i64.store (i32.const 32) (local.get $n))
    (call $set_result (i32.const 32) (i32.const 8)))

  (func (export "increment") (call $return_u64 (call $bump)))
  (func (export "get") (call $return_u64 (call $load)))
  (func (export "reset") (call $state_delete (i32.const 0) (i32.const 5)))

  (func (export "increment_then_spin")
    (drop (call $bump))
    (loop $spin (br $spin)))
  (func (export "increment_then_trap")
    (drop (call $bump))
    unreachable)
  (func (export "increment_then_abort")
    (drop (call $bump))
    (call $abort (i32.const 42)))
  (func (export "increment_then_grow")
    (drop (call $bump))
    (drop (memory.grow (i32.const 1000))))

  (func (export "oob")
    (drop (i32.load (i32.const 0x7ffffff0))))
  (func (export "bad_pointer")
    (call $state_set (i32.const 0x7ffffff0) (i32.const 5) (i32.const 16) (i32.const 8)))

  (func (export "echo")
    (local $len i32)
    (local.set $len (call $input_len))
    (call $input_read (i32.const 1024))
    (call $set_result (i32.const 1024) (local.get $len)))

  (func (export "add") (param i32 i32) (result i32)
    (i32.add (local.get 0) (local.get 1)))
)
"#;

/// Counter with an extra data segment, giving it a distinct identity
pub fn counter_wat_salted(salt: &str) -> String {
    COUNTER_WAT.replacen(
        r#"(data (i32.const 0) "count")"#,
        &format!(
            r#"(data (i32.const 0) "count") (data (i32.const 48) "{}")"#,
            salt
        ),
        1,
    )
}

/// Contract that forwards to the contract whose 32-byte identity is passed
/// as arguments.
///
/// Every entry point first writes `calls = 1` to its own state. The
/// `forward_*` entry points return `[status i32][callee result]`;
/// `forward_then_trap` traps after a successful nested call.
pub const CALLER_WAT: &str = r#"
(module
  (import "contract" "input_read" (func $input_read (param i32)))
  (import "contract" "call_contract" (func $call (param i32 i32 i32 i32 i32) (result i32)))
  (import "contract" "return_data_len" (func $rd_len (result i32)))
  (import "contract" "return_data_read" (func $rd_read (param i32)))
  (import "contract" "set_call_result" (func $set_result (param i32 i32)))
  (import "contract" "state_set" (func $state_set (param i32 i32 i32 i32)))
  (memory (export "memory") 1)
  (data (i32.const 64) "increment")
  (data (i32.const 80) "increment_then_trap")
  (data (i32.const 112) "increment_then_spin")
  (data (i32.const 144) "calls")
  (data (i32.const 160) "missing")

  (func $forward (param $fn i32) (param $len i32) (result i32)
    (call $input_read (i32.const 0))
    (call $call (i32.const 0) (local.get $fn) (local.get $len) (i32.const 0) (i32.const 0)))

  (func $report (param $status i32)
    (i32.store (i32.const 256) (local.get $status))
    (call $rd_read (i32.const 260))
    (call $set_result (i32.const 256) (i32.add (i32.const 4) (call $rd_len))))

  (func $mark
    (i32.store8 (i32.const 200) (i32.const 1))
    (call $state_set (i32.const 144) (i32.const 5) (i32.const 200) (i32.const 1)))

  (func (export "forward_increment")
    (call $mark)
    (call $report (call $forward (i32.const 64) (i32.const 9))))
  (func (export "forward_trap")
    (call $mark)
    (call $report (call $forward (i32.const 80) (i32.const 19))))
  (func (export "forward_spin")
    (call $mark)
    (call $report (call $forward (i32.const 112) (i32.const 19))))
  (func (export "forward_missing")
    (call $mark)
    (call $report (call $forward (i32.const 160) (i32.const 7))))
  (func (export "forward_then_trap")
    (call $mark)
    (drop (call $forward (i32.const 64) (i32.const 9)))
    unreachable)
)
"#;

/// Decode a little-endian `u64` result
pub fn decode_u64(bytes: &[u8]) -> Option<u64> {
    Some(u64::from_le_bytes(bytes.try_into().ok()?))
}
