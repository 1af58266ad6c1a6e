//! Output capture and error capture.
//!
//! `OutputCapture` backs the replacement `print` installed during `init`;
//! `ErrorCapture` truncates and tags whatever error text a failed
//! protected call produces. Both are owned by the kernel singleton and
//! reset at the start of every `compute`.

use crate::error::ErrorKind;
use bstr::{BString, ByteVec};
use mlua::Value;
use std::fmt::Write as _;

/// Accumulates `print` output up to a fixed capacity. Once full, the
/// overflow flag is sticky and further pushes are dropped outright — the
/// buffer never grows and never truncates mid-push.
///
/// Stored as a [`BString`] rather than a plain `Vec<u8>`: captured `print`
/// output is Lua bytes, not necessarily UTF-8 (per §4.2's string policy),
/// and `bstr` is the crate `mlua` itself reaches for to represent exactly
/// that — a byte string that behaves like text everywhere it safely can.
///
/// The capacity passed in is expected to already exclude headroom for the
/// trailing `...` marker and the reply header (the kernel sizes it as
/// `IO_BUFFER_SIZE` minus that headroom) — `emit` always appends the
/// marker on overflow without re-checking room, because that headroom is
/// the caller's guarantee, not this type's problem.
pub struct OutputCapture {
    bytes: BString,
    capacity: usize,
    overflow: bool,
}

impl OutputCapture {
    pub fn new(capacity: usize) -> Self {
        OutputCapture {
            bytes: BString::from(Vec::with_capacity(capacity)),
            capacity,
            overflow: false,
        }
    }

    pub fn reset(&mut self) {
        self.bytes.clear();
        self.overflow = false;
    }

    /// Appends `data` if it fits in the remaining capacity; otherwise sets
    /// the sticky overflow flag and drops it entirely.
    pub fn push(&mut self, data: &[u8]) {
        if self.overflow {
            return;
        }
        if self.bytes.len() + data.len() > self.capacity {
            self.overflow = true;
            return;
        }
        self.bytes.push_str(data);
    }

    /// Captured bytes plus the `...` marker if the sticky flag is set.
    pub fn emit(&self) -> Vec<u8> {
        if self.overflow {
            let mut out = self.bytes.clone();
            out.push_str("...");
            out.into()
        } else {
            self.bytes.clone().into()
        }
    }
}

/// Renders one `print` call's arguments tab-separated and
/// newline-terminated, with per-type formatting rules. Lua strings are
/// copied as raw bytes (they are not necessarily UTF-8); every other type
/// is rendered as UTF-8 text.
pub fn format_print_args(args: &[Value]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            out.push(b'\t');
        }
        match arg {
            Value::Nil => out.extend_from_slice(b"nil"),
            Value::Boolean(b) => out.extend_from_slice(if *b { b"true" } else { b"false" }),
            Value::Integer(n) => {
                let _ = write!(TextSink(&mut out), "{n}");
            }
            Value::Number(n) => {
                if n.fract() == 0.0 && n.is_finite() {
                    let _ = write!(TextSink(&mut out), "{}", *n as i64);
                } else {
                    let _ = write!(TextSink(&mut out), "{n}");
                }
            }
            Value::String(s) => out.extend_from_slice(&s.as_bytes()),
            other => {
                let _ = write!(TextSink(&mut out), "{}", other.type_name());
            }
        }
    }
    out.push(b'\n');
    out
}

/// Adapts `Vec<u8>` to `fmt::Write` so the formatting above can reuse
/// Rust's numeric `Display` impls without an intermediate `String`.
struct TextSink<'a>(&'a mut Vec<u8>);

impl std::fmt::Write for TextSink<'_> {
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        self.0.extend_from_slice(s.as_bytes());
        Ok(())
    }
}

/// Truncates `data` to `capacity` bytes, replacing the final 3 bytes with
/// `...` if it didn't fit.
pub fn truncate_with_marker(data: &[u8], capacity: usize) -> Vec<u8> {
    if data.len() <= capacity {
        data.to_vec()
    } else {
        let keep = capacity.saturating_sub(3);
        let mut out = Vec::with_capacity(capacity);
        out.extend_from_slice(&data[..keep]);
        out.extend_from_slice(b"...");
        out
    }
}

/// Last captured error: text plus the kind tag used to classify it.
pub struct ErrorCapture {
    pub kind: ErrorKind,
    pub message: Vec<u8>,
}

impl ErrorCapture {
    pub fn new(kind: ErrorKind, raw_message: &[u8], capacity: usize) -> Self {
        ErrorCapture {
            kind,
            message: truncate_with_marker(raw_message, capacity),
        }
    }
}
