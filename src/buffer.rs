//! Fixed-address I/O buffer shared between host and guest.
//!
//! The host and guest exchange every payload — Lua source on `compute`'s
//! way in, the encoded reply on its way out — through one fixed-size
//! buffer at a stable address, rather than passing pointers across the
//! ABI per call. `get_buffer_ptr`/`get_buffer_size` (wired up in
//! `abi.rs`) let the host discover where to write and how much room
//! there is; this module only owns the storage and the bounds-checked
//! read/write primitives over it.

use crate::error::{KernelError, SerializationErrorKind};

/// 64 KiB, chosen so the buffer addresses a whole number of WASM pages
/// without wasting most of one.
pub const IO_BUFFER_SIZE: usize = 64 * 1024;

/// A fixed-capacity byte buffer the host writes into and reads out of at a
/// stable address. `capacity` is configurable (via [`crate::KernelOptions`])
/// so tests can shrink it to exercise the "buffer too small" boundary
/// without allocating a 64 KiB Lua source string.
pub struct IoBuffer {
    bytes: Box<[u8]>,
}

impl IoBuffer {
    pub fn new(capacity: usize) -> Self {
        IoBuffer {
            bytes: vec![0u8; capacity].into_boxed_slice(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.bytes.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.bytes.as_mut_ptr()
    }

    /// Reads `len` bytes starting at the buffer's base — the shape every
    /// `compute` call uses to pull the Lua source the host just wrote.
    pub fn read(&self, len: usize) -> Result<&[u8], KernelError> {
        self.bytes.get(..len).ok_or_else(|| {
            KernelError::serialization(
                SerializationErrorKind::BufferTooSmall,
                format!(
                    "requested {} bytes but buffer capacity is {}",
                    len,
                    self.bytes.len()
                ),
            )
        })
    }

    /// Writes `data` at the buffer's base, zero-padding the remainder.
    /// Returns `BufferTooSmall` rather than truncating silently — a
    /// truncated reply would be indistinguishable from a short, valid one.
    pub fn write(&mut self, data: &[u8]) -> Result<(), KernelError> {
        if data.len() > self.bytes.len() {
            return Err(KernelError::serialization(
                SerializationErrorKind::BufferTooSmall,
                format!(
                    "reply is {} bytes but buffer capacity is {}",
                    data.len(),
                    self.bytes.len()
                ),
            ));
        }
        self.bytes[..data.len()].copy_from_slice(data);
        for b in &mut self.bytes[data.len()..] {
            *b = 0;
        }
        Ok(())
    }
}
