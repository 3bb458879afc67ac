//! Error kinds for the router's own fallible operations: a `thiserror`
//! enum with one variant per failure mode, carrying enough context to
//! log usefully and to decide the right reaction.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("i/o error talking to backend {backend}: {source}")]
    BackendIo {
        backend: String,
        #[source]
        source: std::io::Error,
    },

    #[error("protocol error on backend {backend}: {reason}")]
    Protocol { backend: String, reason: String },

    #[error("backend {backend} can't be connected: {reason}")]
    CannotConnect { backend: String, reason: String },

    #[error(
        "session-command history is disabled and commands have already run; refusing to attach {backend}"
    )]
    HistoryAlreadyDiverged { backend: String },

    #[error("backend {later} returned a response diverging from the one already recorded at position {position}")]
    SessionCommandDivergence { later: String, position: u64 },

    #[error("no suitable backend available for target {target}")]
    NoSuitableBackend { target: String },

    #[error("session-command history limit ({limit}) exceeded; history has been disabled")]
    HistoryLimitExceeded { limit: usize },

    #[error("causal read timed out waiting for gtid {gtid} after {timeout_ms}ms")]
    CausalReadTimeout { gtid: String, timeout_ms: u64 },

    #[error("configuration contradiction: {reason}")]
    ConfigurationContradiction { reason: String },

    #[error("client connection terminated: {reason}")]
    ClientTerminated { reason: String },

    #[error("query queue exceeded its backpressure limit ({limit})")]
    QueueOverflow { limit: usize },
}

pub type RouterResult<T> = Result<T, RouterError>;
