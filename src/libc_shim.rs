//! Minimal C standard library stubs for the `wasm32-unknown-unknown` guest
//! target: only the subset Lua itself transitively requires, supplied as
//! hand-written stubs rather than a general-purpose libc.
//!
//! `wasm32-unknown-unknown` has no libc. The vendored Lua 5.4 C sources
//! `mlua` compiles still call a handful of `<string.h>`/`<stdlib.h>`
//! functions directly (not through the `lua_Alloc` hook, which only covers
//! allocation) — mostly `memcpy`/`memmove`/`memset`/`memcmp` and a few
//! `str*` helpers used by `lstrlib.c` and `lauxlib.c`. Everything else
//! (`malloc`, `free`, `realloc`, file I/O) is intentionally absent: Lua is
//! built with its own allocator and its `io`/`os` libraries are never
//! opened, so nothing should reference them. If the linker reports an
//! undefined symbol beyond this list when targeting wasm32, the fix is to
//! add the one missing stub here, not to widen the standard library
//! surface the guest exposes to Lua.
//!
//! On every other target this module compiles to nothing; the host
//! platform's real libc (via `std`) is used instead, which is what lets
//! the native test suite in `tests/` link and run at all.

#![cfg(target_arch = "wasm32")]

use std::os::raw::{c_char, c_int, c_void};

#[no_mangle]
pub unsafe extern "C" fn memcpy(dest: *mut c_void, src: *const c_void, n: usize) -> *mut c_void {
    std::ptr::copy_nonoverlapping(src as *const u8, dest as *mut u8, n);
    dest
}

#[no_mangle]
pub unsafe extern "C" fn memmove(dest: *mut c_void, src: *const c_void, n: usize) -> *mut c_void {
    std::ptr::copy(src as *const u8, dest as *mut u8, n);
    dest
}

#[no_mangle]
pub unsafe extern "C" fn memset(dest: *mut c_void, c: c_int, n: usize) -> *mut c_void {
    std::ptr::write_bytes(dest as *mut u8, c as u8, n);
    dest
}

#[no_mangle]
pub unsafe extern "C" fn memcmp(a: *const c_void, b: *const c_void, n: usize) -> c_int {
    let a = std::slice::from_raw_parts(a as *const u8, n);
    let b = std::slice::from_raw_parts(b as *const u8, n);
    match a.cmp(b) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }
}

#[no_mangle]
pub unsafe extern "C" fn strlen(s: *const c_char) -> usize {
    let mut len = 0usize;
    while *s.add(len) != 0 {
        len += 1;
    }
    len
}

#[no_mangle]
pub unsafe extern "C" fn strcmp(a: *const c_char, b: *const c_char) -> c_int {
    let mut i = 0isize;
    loop {
        let ca = *a.offset(i) as u8;
        let cb = *b.offset(i) as u8;
        if ca != cb {
            return ca as c_int - cb as c_int;
        }
        if ca == 0 {
            return 0;
        }
        i += 1;
    }
}

#[no_mangle]
pub unsafe extern "C" fn strncmp(a: *const c_char, b: *const c_char, n: usize) -> c_int {
    for i in 0..n {
        let ca = *a.add(i) as u8;
        let cb = *b.add(i) as u8;
        if ca != cb {
            return ca as c_int - cb as c_int;
        }
        if ca == 0 {
            return 0;
        }
    }
    0
}

#[no_mangle]
pub unsafe extern "C" fn strchr(s: *const c_char, c: c_int) -> *mut c_char {
    let mut i = 0isize;
    loop {
        let ch = *s.offset(i);
        if ch as c_int == c {
            return s.offset(i) as *mut c_char;
        }
        if ch == 0 {
            return std::ptr::null_mut();
        }
        i += 1;
    }
}

#[no_mangle]
pub unsafe extern "C" fn abort() -> ! {
    // No process to terminate from inside the guest; trap instead so the
    // host sees a clean WASM `unreachable` rather than a hang.
    std::arch::wasm32::unreachable()
}
