//! Error types for heimdall-shard.

use thiserror::Error;

/// Errors that can occur in shard and pool operations.
#[derive(Debug, Error)]
pub enum ShardError {
    /// Opening or using the gateway transport failed.
    #[error("gateway connection failed: {0}")]
    GatewayConnection(String),

    /// The bootstrap fetch failed or returned unusable data.
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The gateway closed with a code that rules out reconnecting.
    #[error("reconnection impossible: gateway closed with code {code}")]
    ReconnectionImpossible {
        /// The close code.
        code: u16,
    },

    /// The shard task is gone.
    #[error("shard {0} is not running")]
    ShardStopped(u32),

    /// The downstream sink failed.
    #[error("sink error: {0}")]
    Sink(String),

    /// HTTP error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] heimdall_proto::ProtoError),
}

/// Result type for shard operations.
pub type Result<T> = std::result::Result<T, ShardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnection_impossible_display() {
        let err = ShardError::ReconnectionImpossible { code: 4004 };
        assert_eq!(
            err.to_string(),
            "reconnection impossible: gateway closed with code 4004"
        );
    }

    #[test]
    fn test_protocol_error_conversion() {
        let err: ShardError = heimdall_proto::ProtoError::MissingField("op").into();
        assert!(matches!(err, ShardError::Protocol(_)));
        assert!(err.to_string().contains("missing required field: op"));
    }
}
