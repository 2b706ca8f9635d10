//! Error taxonomy shared by every client operation.

use std::sync::Arc;

/// All failures surfaced by the client. Cloneable so one outcome can be handed to
/// every caller sharing a single in-flight operation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SoulseekError {
    /// Empty or malformed identifying input; raised before any I/O.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Operation not permitted in the current client or transfer state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("transfer not found: {0}")]
    TransferNotFound(String),
    /// The peer refused a transfer for a reason other than queueing it.
    #[error("transfer rejected: {0}")]
    TransferRejected(String),
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Arc<std::io::Error>>,
    },
    #[error("connection read error: {message}")]
    ConnectionRead {
        message: String,
        #[source]
        source: Option<Arc<std::io::Error>>,
    },
    #[error("connection write error: {message}")]
    ConnectionWrite {
        message: String,
        #[source]
        source: Option<Arc<std::io::Error>>,
    },
    /// Envelope or payload could not be decoded.
    #[error("message read error: {0}")]
    MessageRead(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("user offline: {0}")]
    UserOffline(String),
    /// Unexpected fault during an operation, with the original cause kept.
    #[error("{message}")]
    Wrapped {
        message: String,
        #[source]
        source: Box<SoulseekError>,
    },
}

impl SoulseekError {
    pub fn connection(message: impl Into<String>, source: Option<std::io::Error>) -> Self {
        SoulseekError::Connection {
            message: message.into(),
            source: source.map(Arc::new),
        }
    }

    pub fn read(message: impl Into<String>, source: Option<std::io::Error>) -> Self {
        SoulseekError::ConnectionRead {
            message: message.into(),
            source: source.map(Arc::new),
        }
    }

    pub fn write(message: impl Into<String>, source: Option<std::io::Error>) -> Self {
        SoulseekError::ConnectionWrite {
            message: message.into(),
            source: source.map(Arc::new),
        }
    }

    pub fn wrap(message: impl Into<String>, source: SoulseekError) -> Self {
        SoulseekError::Wrapped {
            message: message.into(),
            source: Box::new(source),
        }
    }

    /// Timeout, cancellation and offline failures are never wrapped; callers branch on them.
    pub fn passes_through(&self) -> bool {
        matches!(
            self,
            SoulseekError::Timeout(_) | SoulseekError::Cancelled(_) | SoulseekError::UserOffline(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SoulseekError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn wrapped_keeps_cause() {
        let inner = SoulseekError::connection("refused", None);
        let err = SoulseekError::wrap("failed to get place in queue", inner);
        let source = err.source().expect("wrapped error has a source");
        assert!(source.to_string().contains("refused"));
    }

    #[test]
    fn io_source_is_exposed() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = SoulseekError::read("remote closed", Some(io));
        assert!(err.source().is_some());
    }

    #[test]
    fn pass_through_classification() {
        assert!(SoulseekError::Timeout("x".into()).passes_through());
        assert!(SoulseekError::Cancelled("x".into()).passes_through());
        assert!(SoulseekError::UserOffline("x".into()).passes_through());
        assert!(!SoulseekError::TransferNotFound("x".into()).passes_through());
        assert!(!SoulseekError::connection("x", None).passes_through());
    }
}
