//! Error kinds surfaced to the user (spec.md §7).
//!
//! Grounded on the teacher's `err.rs`, which already reaches for
//! `thiserror` rather than hand-rolling `Display`/`Error` impls.

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum TcpError {
    #[error("connection is already open")]
    AlreadyConnected,

    #[error("not connected")]
    NotConnected,

    #[error("receive-buffer pool exhausted")]
    NoBuffer,

    #[error("local address already in use")]
    AddrInUse,

    #[error("connection refused")]
    ConnRefused,

    #[error("connection reset by peer")]
    ConnReset,

    #[error("connection aborted")]
    ConnAborted,

    #[error("timed out")]
    TimedOut,

    #[error("operation would block")]
    WouldBlock,

    #[error("invalid argument")]
    InvalidArg,

    #[error("address family not supported")]
    FamilyUnsupported,
}

pub type Result<T> = std::result::Result<T, TcpError>;
