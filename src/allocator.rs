//! Bump-style fixed-size allocator pool.
//!
//! Backs both the Lua VM's own heap (wired in as Lua's `lua_Alloc`
//! callback, see [`Pool::as_lua_alloc`]) and any transient scratch buffers
//! the kernel itself needs. `free` is a no-op; `realloc` always allocates a
//! fresh region and copies forward, so old regions become garbage that is
//! safe to read but never reclaimed until the whole pool is dropped. The
//! callback signature matches `lua_Alloc`, the same contract `mlua`'s own
//! allocator hook (`memory::MemoryState` + its `allocator` extern "C" fn)
//! exposes to Lua, except that one forwards to the global Rust allocator
//! with a soft limit rather than a dedicated arena.

use std::alloc::{self, Layout};
use std::cell::Cell;
use std::os::raw::c_void;
use std::ptr::{self, NonNull};

/// 16-byte alignment is the only contract the rest of the core relies on.
const ALIGN: usize = 16;

/// A single-threaded bump arena. Never reallocates its backing storage, so
/// pointers handed out remain valid for the arena's lifetime.
pub struct Pool {
    arena: Box<[u8]>,
    offset: Cell<usize>,
    high_water: Cell<usize>,
}

impl Pool {
    pub fn new(capacity: usize) -> Self {
        Pool {
            arena: vec![0u8; capacity].into_boxed_slice(),
            offset: Cell::new(0),
            high_water: Cell::new(0),
        }
    }

    /// Bytes handed out so far (not bytes "in use" — since `free` is a
    /// no-op these are the same number until the pool is dropped).
    pub fn used(&self) -> usize {
        self.offset.get()
    }

    pub fn capacity(&self) -> usize {
        self.arena.len()
    }

    fn aligned_len(n: usize) -> usize {
        (n + ALIGN - 1) & !(ALIGN - 1)
    }

    /// Returns a 16-byte-aligned pointer to `n` fresh bytes, or `None` if
    /// the arena is exhausted.
    pub fn alloc(&self, n: usize) -> Option<NonNull<u8>> {
        let base = self.arena.as_ptr() as usize;
        let start = base + self.offset.get();
        let aligned_start = (start + ALIGN - 1) & !(ALIGN - 1);
        let padding = aligned_start - start;
        let needed = Self::aligned_len(n) + padding;
        if self.offset.get() + needed > self.arena.len() {
            return None;
        }
        self.offset.set(self.offset.get() + needed);
        self.high_water.set(self.high_water.get().max(self.offset.get()));
        NonNull::new(aligned_start as *mut u8)
    }

    /// Allocates `new_len` bytes and copies forward `min(old_len, new_len)`
    /// bytes from `ptr`. When the original length is unknown the caller
    /// passes `new_len` as the copy size — callers of this pool always
    /// know the true old length, but the `lua_Alloc` adapter below is the
    /// one place that can hit the unknown case, since Lua does pass
    /// `osize` faithfully except at allocation-from-nothing.
    pub fn realloc(&self, ptr: Option<NonNull<u8>>, old_len: usize, new_len: usize) -> Option<NonNull<u8>> {
        if new_len == 0 {
            return None;
        }
        let new_ptr = self.alloc(new_len)?;
        if let Some(old) = ptr {
            let copy_len = old_len.min(new_len);
            unsafe {
                ptr::copy_nonoverlapping(old.as_ptr(), new_ptr.as_ptr(), copy_len);
            }
        }
        Some(new_ptr)
    }

    /// No-op — garbage becomes unreachable but stays readable until the
    /// pool itself is torn down.
    pub fn free(&self, _ptr: Option<NonNull<u8>>, _len: usize) {}
}

/// `lua_Alloc`-compatible extern "C" function. `extra` must point at a
/// `Pool` that outlives the Lua state it backs (the kernel singleton
/// guarantees this: the pool and the `Lua` it allocates for are created
/// and torn down together).
///
/// # Safety
/// `extra` must be a valid, live `*mut Pool` for the duration of every call
/// Lua makes through this function pointer.
pub unsafe extern "C" fn pool_alloc(
    extra: *mut c_void,
    ptr: *mut c_void,
    osize: usize,
    nsize: usize,
) -> *mut c_void {
    let pool = &*(extra as *const Pool);
    if nsize == 0 {
        pool.free(NonNull::new(ptr as *mut u8), osize);
        return ptr::null_mut();
    }
    let existing = NonNull::new(ptr as *mut u8);
    match pool.realloc(existing, osize, nsize) {
        Some(p) => p.as_ptr() as *mut c_void,
        None => ptr::null_mut(),
    }
}

/// Rounds up the way `alloc::Layout` would, exposed for callers that need
/// a plain heap allocation with the pool's alignment guarantee without
/// going through the `lua_Alloc` adapter (e.g. encode scratch buffers that
/// outlive a single `compute`). Currently unused by the kernel itself —
/// reserved for hosts embedding this crate as a library rather than a
/// cdylib, which may want the same alignment story for their own buffers.
#[allow(dead_code)]
pub fn layout_for(n: usize) -> Layout {
    Layout::from_size_align(n.max(1), ALIGN).expect("alignment is a power of two")
}

#[allow(dead_code)]
pub(crate) fn system_alloc_zeroed(n: usize) -> NonNull<u8> {
    let layout = layout_for(n);
    unsafe {
        let p = alloc::alloc_zeroed(layout);
        NonNull::new(p).expect("system allocation failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_respects_alignment() {
        let pool = Pool::new(1024);
        let p = pool.alloc(10).unwrap();
        assert_eq!(p.as_ptr() as usize % ALIGN, 0);
    }

    #[test]
    fn alloc_exhausts_and_returns_none() {
        let pool = Pool::new(64);
        assert!(pool.alloc(32).is_some());
        assert!(pool.alloc(1024).is_none());
    }

    #[test]
    fn realloc_copies_forward() {
        let pool = Pool::new(1024);
        let p1 = pool.alloc(4).unwrap();
        unsafe {
            ptr::copy_nonoverlapping(b"abcd".as_ptr(), p1.as_ptr(), 4);
        }
        let p2 = pool.realloc(Some(p1), 4, 8).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(p2.as_ptr(), 4) };
        assert_eq!(bytes, b"abcd");
    }

    #[test]
    fn free_is_a_noop_and_old_bytes_stay_readable() {
        let pool = Pool::new(1024);
        let p = pool.alloc(16).unwrap();
        unsafe {
            ptr::write_bytes(p.as_ptr(), 7, 16);
        }
        pool.free(Some(p), 16);
        let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), 16) };
        assert!(bytes.iter().all(|&b| b == 7));
        assert_eq!(pool.used(), 16_usize.next_multiple_of(ALIGN));
    }
}
