//! Exported ABI surface: the guest functions a WASM host calls directly.
//!
//! Every function here is `#[no_mangle] pub extern "C"`, the calling
//! convention a WASM host links against. They're all thin: the real logic
//! lives in [`crate::kernel::GuestKernel`]; this module only owns the
//! process-wide singleton and the raw-pointer/integer marshaling the ABI
//! boundary requires.
//!
//! The singleton is a `thread_local! { RefCell<Option<GuestKernel>> }`
//! rather than a bare `static mut GuestKernel`. Execution is expected to
//! stay single-threaded and non-reentrant — but a WASM module instantiated
//! by some hosts still technically runs on a Rust `std` thread, and
//! `RefCell`'s runtime borrow checks turn "the host accidentally reenters
//! a guest call while one is already running" (which would be undefined
//! behaviour with a bare `static mut`) into a clean panic instead. The cost
//! is one `thread_local` lookup per export, which is immaterial next to
//! constructing a Lua VM or running a script.

use crate::kernel::{GuestKernel, KernelOptions, MemoryStats};
use std::cell::RefCell;

thread_local! {
    static KERNEL: RefCell<Option<GuestKernel>> = RefCell::new(None);
}

fn with_kernel<R>(default: R, f: impl FnOnce(&GuestKernel) -> R) -> R {
    KERNEL.with(|cell| match &*cell.borrow() {
        Some(kernel) => f(kernel),
        None => default,
    })
}

/// Idempotent: returns `0` on success, including when already initialized,
/// and negative on allocator failure.
#[no_mangle]
pub extern "C" fn init() -> i32 {
    KERNEL.with(|cell| {
        if cell.borrow().is_some() {
            return 0;
        }
        match GuestKernel::new(KernelOptions::default()) {
            Ok(kernel) => {
                *cell.borrow_mut() = Some(kernel);
                0
            }
            Err(e) => {
                log::error!(target: "lua_guest_runtime", "init failed: {e}");
                -1
            }
        }
    })
}

#[no_mangle]
pub extern "C" fn get_buffer_ptr() -> *mut u8 {
    with_kernel(std::ptr::null_mut(), |k| k.buffer_ptr())
}

#[no_mangle]
pub extern "C" fn get_buffer_size() -> u32 {
    with_kernel(0, |k| k.buffer_size())
}

/// `ptr` is accepted only to match the host-side call shape; the real
/// buffer is always the one `get_buffer_ptr` returns, since its address is
/// fixed for the process lifetime.
#[no_mangle]
pub extern "C" fn compute(_ptr: *mut u8, len: u32) -> i32 {
    with_kernel(-1, |k| k.compute(len as usize))
}

#[no_mangle]
pub extern "C" fn get_memory_stats(out: *mut MemoryStats) {
    if out.is_null() {
        return;
    }
    let stats = with_kernel(
        MemoryStats {
            io_buffer_size: 0,
            lua_memory_used: 0,
            wasm_pages: 0,
        },
        |k| k.memory_stats(),
    );
    unsafe {
        std::ptr::write(out, stats);
    }
}

#[no_mangle]
pub extern "C" fn run_gc() {
    with_kernel((), |k| k.run_gc());
}

#[no_mangle]
pub extern "C" fn get_home_table_id() -> u32 {
    with_kernel(0, |k| k.home_table_id())
}

/// Alias for [`get_home_table_id`], kept for hosts that still refer to the
/// legacy `Memory` name.
#[no_mangle]
pub extern "C" fn get_memory_table_id() -> u32 {
    get_home_table_id()
}

#[no_mangle]
pub extern "C" fn attach_home_table(id: u32) {
    with_kernel((), |k| k.attach_home_table(id));
}

/// Alias for [`attach_home_table`], kept for hosts that still refer to the
/// legacy `Memory` name.
#[no_mangle]
pub extern "C" fn attach_memory_table(id: u32) {
    attach_home_table(id);
}

#[no_mangle]
pub extern "C" fn get_io_table_id() -> u32 {
    with_kernel(0, |k| k.io_table_id())
}

#[no_mangle]
pub extern "C" fn clear_io_table() {
    with_kernel((), |k| k.clear_io_table());
}

#[no_mangle]
pub extern "C" fn sync_external_table_counter(next_id: u32) {
    with_kernel((), |k| k.sync_external_table_counter(next_id));
}

#[no_mangle]
pub extern "C" fn set_memory_alias_enabled(enabled: i32) {
    with_kernel((), |k| k.set_memory_alias_enabled(enabled != 0));
}
