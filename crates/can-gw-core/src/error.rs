//! Library-facing error types.
//!
//! The core exposes concrete, matchable variants via `thiserror`; the
//! binary crate wraps these in `anyhow::Result` at its edges the same way
//! the original `main.rs`/`run.rs` do.

use thiserror::Error;

/// Why opening a CAN interface failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenKind {
    NotFound,
    PermissionDenied,
    AlreadyInUse,
    Other,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to open interface {channel:?}: {kind:?}")]
    Open { channel: String, kind: OpenKind },

    #[error("I/O error on CAN link: {0}")]
    Io(#[from] std::io::Error),

    #[error("no mock link registered for channel {0:?}")]
    NoMockLink(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
