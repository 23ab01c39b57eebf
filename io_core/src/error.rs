//! Error taxonomy for the I/O core, grounded on the `ConnectionError` shape used
//! by teacher framing code: a small `thiserror` tree instead of a single catch-all.

use std::fmt;
use std::io;

/// Top-level error returned by fallible operations throughout this crate.
#[derive(thiserror::Error, Debug)]
pub enum IoCoreError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    StreamState(#[from] StreamStateError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("subprocess timed out: {argv:?}")]
    SubprocessTimeout { argv: Vec<String> },
}

impl IoCoreError {
    pub fn into_io_error(self) -> io::Error {
        match self {
            IoCoreError::Io(err) => err,
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

/// Why a payload stream or read operation ended without delivering its result.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectionErrorKind {
    /// The consumer's await/iteration was cancelled.
    Cancelled,
    /// The producer gave up on behalf of the consumer (consumer-side abort fed back as EOF).
    Aborted,
    /// EOF arrived while a read that required more bytes (`read_exactly`, `read_until`) was active.
    Eof,
}

impl fmt::Display for ConnectionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectionErrorKind::Cancelled => "cancelled",
            ConnectionErrorKind::Aborted => "aborted",
            ConnectionErrorKind::Eof => "connection closed before the read completed",
        };
        f.write_str(text)
    }
}

/// Raised to a payload stream consumer, or out of `read_exactly`/`read_until`, when the
/// stream terminated abnormally. Carries the reason and, where applicable, the source error.
#[derive(thiserror::Error, Debug)]
#[error("{kind}")]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    #[source]
    pub source: Option<anyhow::Error>,
}

impl ConnectionError {
    pub fn cancelled() -> Self {
        Self { kind: ConnectionErrorKind::Cancelled, source: None }
    }

    pub fn aborted() -> Self {
        Self { kind: ConnectionErrorKind::Aborted, source: None }
    }

    pub fn eof() -> Self {
        Self { kind: ConnectionErrorKind::Eof, source: None }
    }

    pub fn eof_with(source: impl Into<anyhow::Error>) -> Self {
        Self { kind: ConnectionErrorKind::Eof, source: Some(source.into()) }
    }
}

/// Misuse of the payload-stream wait-mode or reader-attachment contract (§7 item 5): switching
/// between whole/chunk mode, or attaching a second reader while one is active.
#[derive(thiserror::Error, Debug)]
pub enum StreamStateError {
    #[error("payload stream is already being consumed in {existing:?} mode, cannot switch to {requested:?}")]
    WaitModeMismatch { existing: &'static str, requested: &'static str },

    #[error("protocol already has an active reader attached")]
    ReaderAlreadyActive,
}

/// TLS errors, tagged with whether the handshake had already completed, since the
/// recovery path differs (§4.8: pre-handshake failures go to the handshake waiter,
/// post-handshake failures fatal-error the underlying transport).
#[derive(thiserror::Error, Debug)]
pub enum TlsError {
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] rustls::Error),

    #[error("TLS error after handshake: {0}")]
    PostHandshake(#[source] rustls::Error),

    #[error("TLS I/O error: {0}")]
    Io(#[source] io::Error),
}

impl TlsError {
    pub fn is_pre_handshake(&self) -> bool {
        matches!(self, TlsError::Handshake(_))
    }
}
