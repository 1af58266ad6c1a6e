//! Host-provided imports and the safe wrappers the rest of the kernel
//! calls through.
//!
//! On `wasm32` these are real `extern "C"` imports resolved by the host
//! runtime at instantiation time. Everywhere else — i.e. whenever this
//! crate is built as a plain `rlib` for `cargo test` — the same function
//! names are backed by [`fake_host`], an in-process `FxHashMap`-backed
//! store standing in for the host's external-table storage, keyed the
//! same way a `HashMap<u32, HashMap<Vec<u8>, Vec<u8>>>` behind the
//! `ext_table_*` entry points would be, minus any real cross-process
//! boundary since native tests call these functions in-process.

#[cfg(target_arch = "wasm32")]
mod imports {
    extern "C" {
        pub fn ext_table_set(
            table_id: u32,
            key_ptr: *const u8,
            key_len: u32,
            val_ptr: *const u8,
            val_len: u32,
        ) -> i32;
        pub fn ext_table_get(
            table_id: u32,
            key_ptr: *const u8,
            key_len: u32,
            val_ptr: *mut u8,
            max_len: u32,
        ) -> i32;
        pub fn ext_table_delete(table_id: u32, key_ptr: *const u8, key_len: u32) -> i32;
        pub fn ext_table_size(table_id: u32) -> u32;
        pub fn ext_table_keys(table_id: u32, buf_ptr: *mut u8, max_len: u32) -> i32;
        pub fn time_now() -> i64;
    }
}

/// Store `val` under `key` in external table `table_id`. Returns `0` on
/// success, non-zero on failure — callers log failure instead of raising
/// a Lua error, since a storage hiccup shouldn't abort the script that
/// triggered it.
pub fn ext_table_set(table_id: u32, key: &[u8], val: &[u8]) -> i32 {
    #[cfg(target_arch = "wasm32")]
    unsafe {
        imports::ext_table_set(
            table_id,
            key.as_ptr(),
            key.len() as u32,
            val.as_ptr(),
            val.len() as u32,
        )
    }
    #[cfg(not(target_arch = "wasm32"))]
    {
        fake_host::ext_table_set(table_id, key, val)
    }
}

/// Copies the value stored under `key` into `out`. Returns the number of
/// bytes written (`>= 0`) on a hit, `-1` on a miss or if `out` is too
/// small to hold the value.
pub fn ext_table_get(table_id: u32, key: &[u8], out: &mut [u8]) -> i32 {
    #[cfg(target_arch = "wasm32")]
    unsafe {
        imports::ext_table_get(
            table_id,
            key.as_ptr(),
            key.len() as u32,
            out.as_mut_ptr(),
            out.len() as u32,
        )
    }
    #[cfg(not(target_arch = "wasm32"))]
    {
        fake_host::ext_table_get(table_id, key, out)
    }
}

pub fn ext_table_delete(table_id: u32, key: &[u8]) -> i32 {
    #[cfg(target_arch = "wasm32")]
    unsafe {
        imports::ext_table_delete(table_id, key.as_ptr(), key.len() as u32)
    }
    #[cfg(not(target_arch = "wasm32"))]
    {
        fake_host::ext_table_delete(table_id, key)
    }
}

pub fn ext_table_size(table_id: u32) -> u32 {
    #[cfg(target_arch = "wasm32")]
    unsafe {
        imports::ext_table_size(table_id)
    }
    #[cfg(not(target_arch = "wasm32"))]
    {
        fake_host::ext_table_size(table_id)
    }
}

/// Serializes all keys of `table_id` into `out` as length-prefixed byte
/// strings, a format only host-side tooling parses — the guest never
/// reads this back. Returns bytes written, or `-1` on overflow.
pub fn ext_table_keys(table_id: u32, out: &mut [u8]) -> i32 {
    #[cfg(target_arch = "wasm32")]
    unsafe {
        imports::ext_table_keys(table_id, out.as_mut_ptr(), out.len() as u32)
    }
    #[cfg(not(target_arch = "wasm32"))]
    {
        fake_host::ext_table_keys(table_id, out)
    }
}

pub fn time_now() -> i64 {
    #[cfg(target_arch = "wasm32")]
    unsafe {
        imports::time_now()
    }
    #[cfg(not(target_arch = "wasm32"))]
    {
        fake_host::time_now()
    }
}

/// In-process fake host used by the native test suite. Not reachable from
/// a `wasm32` build.
#[cfg(not(target_arch = "wasm32"))]
pub mod fake_host {
    use rustc_hash::FxHashMap;
    use std::cell::RefCell;

    type Row = FxHashMap<Vec<u8>, Vec<u8>>;

    thread_local! {
        static TABLES: RefCell<FxHashMap<u32, Row>> = RefCell::new(FxHashMap::default());
    }

    /// Drops all stored tables. Tests call this to start from a clean
    /// slate instead of relying on process-per-test isolation.
    pub fn reset() {
        TABLES.with(|t| t.borrow_mut().clear());
    }

    pub fn ext_table_set(table_id: u32, key: &[u8], val: &[u8]) -> i32 {
        TABLES.with(|t| {
            t.borrow_mut()
                .entry(table_id)
                .or_default()
                .insert(key.to_vec(), val.to_vec());
        });
        0
    }

    pub fn ext_table_get(table_id: u32, key: &[u8], out: &mut [u8]) -> i32 {
        TABLES.with(|t| match t.borrow().get(&table_id).and_then(|row| row.get(key)) {
            Some(val) if val.len() <= out.len() => {
                out[..val.len()].copy_from_slice(val);
                val.len() as i32
            }
            _ => -1,
        })
    }

    pub fn ext_table_delete(table_id: u32, key: &[u8]) -> i32 {
        TABLES.with(|t| {
            if let Some(row) = t.borrow_mut().get_mut(&table_id) {
                row.remove(key);
            }
        });
        0
    }

    pub fn ext_table_size(table_id: u32) -> u32 {
        TABLES.with(|t| t.borrow().get(&table_id).map_or(0, |row| row.len() as u32))
    }

    pub fn ext_table_keys(table_id: u32, out: &mut [u8]) -> i32 {
        TABLES.with(|t| {
            let tables = t.borrow();
            let Some(row) = tables.get(&table_id) else {
                return 0;
            };
            let mut buf = Vec::new();
            for key in row.keys() {
                buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
                buf.extend_from_slice(key);
            }
            if buf.len() > out.len() {
                return -1;
            }
            out[..buf.len()].copy_from_slice(&buf);
            buf.len() as i32
        })
    }

    pub fn time_now() -> i64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        fake_host::reset();
        assert_eq!(ext_table_set(1, b"x", b"hello"), 0);
        let mut out = [0u8; 16];
        let n = ext_table_get(1, b"x", &mut out);
        assert_eq!(n, 5);
        assert_eq!(&out[..5], b"hello");
    }

    #[test]
    fn get_miss_returns_negative_one() {
        fake_host::reset();
        let mut out = [0u8; 16];
        assert_eq!(ext_table_get(1, b"missing", &mut out), -1);
    }

    #[test]
    fn delete_removes_entry() {
        fake_host::reset();
        ext_table_set(2, b"k", b"v");
        assert_eq!(ext_table_delete(2, b"k"), 0);
        let mut out = [0u8; 4];
        assert_eq!(ext_table_get(2, b"k", &mut out), -1);
    }

    #[test]
    fn size_reflects_entry_count() {
        fake_host::reset();
        ext_table_set(3, b"a", b"1");
        ext_table_set(3, b"b", b"2");
        assert_eq!(ext_table_size(3), 2);
    }
}
