//! Error Types
//!
//! Errors surfaced by the stream tube client. Accept failures are not
//! returned from any call: they are reported once through
//! [`TubeClientEvent::TubeClosed`](crate::events::TubeClientEvent::TubeClosed)
//! carrying the [`AcceptError`] name and message.

use thiserror::Error;

use crate::config::ConfigError;

/// Errors returned by [`StreamTubeClient`](crate::client::StreamTubeClient) operations
#[derive(Debug, Error)]
pub enum TubeClientError {
    /// The client was created without any peer-to-peer or room services
    #[error("a stream tube client needs at least one peer-to-peer or room service")]
    NoServices,

    /// The engine task is gone (client dropped or runtime shut down)
    #[error("stream tube client engine has stopped")]
    EngineStopped,

    /// Configuration could not be loaded or was invalid
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Failure reported by a tube when accepting it
///
/// `name` is the bus error name (for example
/// `org.freedesktop.Telepathy.Error.NotAvailable`), `message` the human readable
/// detail. Both are passed through to the caller unchanged.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{name}: {message}")]
pub struct AcceptError {
    /// Error name
    pub name: String,
    /// Error message
    pub message: String,
}

impl AcceptError {
    /// Create a new accept error
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_error_display() {
        let err = AcceptError::new("NotSupported", "no sockets for you");
        assert_eq!(err.to_string(), "NotSupported: no sockets for you");
    }

    #[test]
    fn test_config_error_is_transparent() {
        let err: TubeClientError =
            ConfigError::ValidationError("empty service list".to_string()).into();
        assert_eq!(
            err.to_string(),
            "Invalid configuration: empty service list"
        );
    }
}
