use std::net::SocketAddr;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ResolveError>;

/// Errors produced while answering a single downstream query.
///
/// The quiet-decline kinds (`WontResolve`, `NotCached`, `NoSuitableRecords`)
/// mean "I can't answer this" and are never surfaced to the client; transport
/// kinds cause the attempt to be retried elsewhere; `Timeout` becomes
/// SERVFAIL.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// A resolver declined the query. Carries per-attempt errors for
    /// diagnostics when several connections were tried.
    #[error("{reason}")]
    WontResolve {
        reason: String,
        attempts: Vec<String>,
    },

    #[error("{0} not found in cache")]
    NotCached(String),

    #[error("no suitable records found in cache")]
    NoSuitableRecords,

    /// The race deadline expired with no winner.
    #[error("deadline expired before any resolver answered")]
    Timeout,

    /// The connection exited while a request was pending or about to start.
    #[error("connection is no longer serving requests")]
    ConnectionGone,

    #[error("stream reset before the response completed")]
    StreamReset,

    #[error("bad HTTP exchange: {0}")]
    BadHttp(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("malformed DNS message: {0}")]
    Malformed(String),

    #[error("cache backend error: {0}")]
    Cache(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ResolveError {
    pub fn wont_resolve(reason: impl Into<String>) -> Self {
        ResolveError::WontResolve {
            reason: reason.into(),
            attempts: Vec::new(),
        }
    }

    /// Quiet declines are swallowed by the dispatcher rather than logged as
    /// failures or surfaced downstream.
    pub fn is_decline(&self) -> bool {
        matches!(
            self,
            ResolveError::WontResolve { .. }
                | ResolveError::NotCached(_)
                | ResolveError::NoSuitableRecords
        )
    }
}

/// Unrecoverable startup problems: bad configuration or bind failures.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("cannot bind {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },

    #[error("no UDP listener could be started")]
    NoListeners,

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}
