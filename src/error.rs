use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy surfaced by the client.
///
/// Every variant is cheap to clone: a single wire failure fans out to all
/// in-flight completions on that wire, so the same error value is delivered
/// many times.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The server replied with an error frame. The message is propagated
    /// verbatim, prefix included (`ERR ...`, `WRONGTYPE ...`).
    #[error("server error: {0}")]
    Server(String),

    /// The connection died underneath outstanding requests: I/O failure,
    /// unexpected EOF, or handshake failure.
    #[error("connection broken: {0}")]
    ConnBroken(String),

    /// The peer violated the RESP protocol. Fatal for the owning wire.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The client was closed; all pending completions terminate with this.
    #[error("client is closing")]
    Closing,

    /// A deadline elapsed before the operation finished.
    #[error("operation timed out")]
    Timeout,

    /// Keys of a multi-key command hash to different cluster slots.
    #[error("keys map to different cluster slots")]
    CrossSlot,

    /// The dedicated wire pool cannot grow and nothing is available.
    #[error("dedicated wire pool exhausted")]
    PoolExhausted,

    /// No reachable node can serve the request (empty slot mapping, all
    /// seeds down, or sentinel discovery failed).
    #[error("no reachable endpoint: {0}")]
    NoEndpoint(String),

    /// Invalid client configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Command construction misuse, e.g. an empty token list or a
    /// non-cacheable command passed to `do_cache`.
    #[error("invalid command: {0}")]
    Command(String),

    /// Underlying socket error, preserved with its source.
    #[error("io error: {0}")]
    Io(Arc<io::Error>),
}

impl Error {
    /// True when retrying the command on a fresh wire may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::ConnBroken(_) | Error::Io(_))
    }

    pub(crate) fn broken(reason: impl Into<String>) -> Self {
        Error::ConnBroken(reason.into())
    }

    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        Error::Protocol(reason.into())
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn fan_out_clones_preserve_message() {
        let err = Error::broken("peer reset");
        let clone = err.clone();
        assert_eq!(format!("{err}"), format!("{clone}"));
        assert!(err.is_retriable());
    }

    #[test]
    fn server_errors_are_not_retriable() {
        assert!(!Error::Server("ERR bad".into()).is_retriable());
        assert!(!Error::CrossSlot.is_retriable());
    }
}
