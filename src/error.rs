//! Error kinds surfaced across the guest/host boundary.
//!
//! `compute` never returns a structured error object to the host — only a
//! negative byte count and a plain-text message. This type exists so the
//! kernel's internal plumbing has something typed to propagate with `?`,
//! and so the rendered message's first word reliably identifies the kind
//! for callers that want to pattern-match on it.

use std::fmt;

/// Coarse-grained error kind reported across the guest/host boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    CompilationError,
    RuntimeError,
    SerializationError(SerializationErrorKind),
    AllocationError,
}

/// Sub-kinds that all collapse into `SerializationError` on the wire, but
/// are kept distinct internally for logging and for tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializationErrorKind {
    BufferTooSmall,
    InvalidFormat,
    TypeMismatch,
    CircularReference,
    MaxDepthExceeded,
    TableTooLarge,
}

impl ErrorKind {
    /// Stable, machine-matchable name; also the first word of the
    /// rendered message, so callers can identify the kind by splitting
    /// the message text.
    pub fn kind_name(self) -> &'static str {
        match self {
            ErrorKind::CompilationError => "CompilationError",
            ErrorKind::RuntimeError => "RuntimeError",
            ErrorKind::SerializationError(_) => "SerializationError",
            ErrorKind::AllocationError => "AllocationError",
        }
    }

    fn detail(self) -> Option<&'static str> {
        match self {
            ErrorKind::SerializationError(sub) => Some(match sub {
                SerializationErrorKind::BufferTooSmall => "BufferTooSmall",
                SerializationErrorKind::InvalidFormat => "InvalidFormat",
                SerializationErrorKind::TypeMismatch => "TypeMismatch",
                SerializationErrorKind::CircularReference => "CircularReference",
                SerializationErrorKind::MaxDepthExceeded => "MaxDepthExceeded",
                SerializationErrorKind::TableTooLarge => "TableTooLarge",
            }),
            _ => None,
        }
    }
}

/// The error carried internally by every fallible kernel operation.
#[derive(Debug, Clone)]
pub struct KernelError {
    pub kind: ErrorKind,
    pub message: String,
}

impl KernelError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        KernelError {
            kind,
            message: message.into(),
        }
    }

    pub fn serialization(sub: SerializationErrorKind, message: impl Into<String>) -> Self {
        KernelError::new(ErrorKind::SerializationError(sub), message)
    }

    pub fn allocation(message: impl Into<String>) -> Self {
        KernelError::new(ErrorKind::AllocationError, message)
    }

    /// Render as the text that goes verbatim into the error buffer.
    /// Truncation to the buffer's capacity happens at the call site, not
    /// here, since only the caller knows how much room is left.
    pub fn to_wire_message(&self) -> String {
        match self.kind.detail() {
            Some(detail) => format!("{}({}): {}", self.kind.kind_name(), detail, self.message),
            None => format!("{}: {}", self.kind.kind_name(), self.message),
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire_message())
    }
}

impl std::error::Error for KernelError {}

impl From<mlua::Error> for KernelError {
    fn from(err: mlua::Error) -> Self {
        let kind = match &err {
            mlua::Error::SyntaxError { .. } => ErrorKind::CompilationError,
            mlua::Error::MemoryError(_) => ErrorKind::AllocationError,
            _ => ErrorKind::RuntimeError,
        };
        KernelError::new(kind, err.to_string())
    }
}

pub type KernelResult<T> = Result<T, KernelError>;
