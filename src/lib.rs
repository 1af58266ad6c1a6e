//! Guest-side runtime kernel: a Lua 5.4 interpreter embedded in a
//! sandboxed WebAssembly module, talking to its host through a
//! fixed-address I/O buffer, a host-backed external-table facade, and a
//! tagged binary value codec.
//!
//! This crate has two audiences. Compiled for `wasm32-unknown-unknown`
//! (`cdylib`), it's a complete guest module: every symbol in [`abi`] is
//! exported to whatever runtime instantiates it, and [`host`]'s
//! `extern "C"` imports are resolved by that runtime at instantiation
//! time. Compiled as a plain `rlib` for any other target — which is what
//! `cargo test` does — [`host::fake_host`] stands in for those imports
//! in-process, so [`kernel::GuestKernel`] can be exercised directly
//! without a WASM runtime at all.
//!
//! Module map, roughly leaves-first:
//!
//! - [`allocator`] — the bump-arena pool backing the Lua heap.
//! - [`codec`] — the tagged value codec.
//! - [`ext_table`] — the external-table facade.
//! - [`function_codec`] — Lua bytecode and native-function handles.
//! - [`capture`] — `print`/error capture.
//! - [`kernel`] — the `init`/`compute` lifecycle and globals bootstrap.
//! - [`abi`] — the exported `extern "C"` surface gluing the above to a
//!   process-wide singleton.
//! - [`host`] — the host-provided imports `ext_table`/`kernel` call
//!   through, plus the native test double.
//! - [`buffer`] — the fixed-size I/O buffer the host and guest share.
//! - [`error`] — the crate's error type and its wire-message rendering.
//! - [`libc_shim`] — `wasm32`-only C library stubs the vendored Lua
//!   sources need.

pub mod abi;
pub mod allocator;
pub mod buffer;
pub mod capture;
pub mod codec;
pub mod error;
pub mod ext_table;
pub mod function_codec;
pub mod globals;
pub mod host;
pub mod kernel;
pub mod libc_shim;

pub use error::{ErrorKind, KernelError, KernelResult, SerializationErrorKind};
pub use kernel::{GuestKernel, KernelOptions};
