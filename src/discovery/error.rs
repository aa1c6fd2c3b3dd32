// Failure taxonomy for discovery rounds
use std::net::SocketAddr;

use crate::cluster::ClusterName;
use crate::executor::RejectedExecution;
use crate::transport::TransportError;

/// Discovery errors. Every one of these stays local to the peer it concerns;
/// none of them ends a round.
#[derive(Debug, thiserror::Error)]
pub enum PingError {
    #[error("already closed: {0}")]
    AlreadyClosed(String),

    #[error("failed to connect to {address}: {reason}")]
    ConnectFailure { address: SocketAddr, reason: String },

    #[error("remote error: {0}")]
    RemoteError(String),

    #[error("mismatched cluster names; request: [{request}], local: [{local}]")]
    ProtocolMismatch { request: ClusterName, local: ClusterName },

    #[error("ping execution rejected: {0}")]
    RejectedExecution(#[from] RejectedExecution),

    #[error("serialization error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl PingError {
    /// Failures that are part of normal operation and only worth a trace line
    pub fn is_expected(&self) -> bool {
        matches!(self, PingError::AlreadyClosed(_) | PingError::ConnectFailure { .. })
    }
}

impl From<TransportError> for PingError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Connect { address, reason } | TransportError::Handshake { address, reason } => {
                PingError::ConnectFailure { address, reason }
            }
            TransportError::ConnectionClosed(address) => PingError::ConnectFailure {
                address,
                reason: "connection closed".to_string(),
            },
            TransportError::NodeNotConnected(node) => PingError::Unexpected(format!("node {} is not connected", node)),
            // the peer is shutting down or its round already finished
            TransportError::Remote(message) if message.starts_with("already closed") => PingError::AlreadyClosed(message),
            TransportError::Remote(message) => PingError::RemoteError(message),
            TransportError::UnknownAction(action) => PingError::RemoteError(format!("unknown action [{}]", action)),
            TransportError::Codec(e) => PingError::Codec(e),
            other @ (TransportError::Timeout { .. } | TransportError::Io(_)) => PingError::Unexpected(other.to_string()),
        }
    }
}

impl From<PingError> for String {
    fn from(err: PingError) -> String {
        err.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_transport_errors_map_onto_taxonomy() {
        let address: SocketAddr = "10.0.0.1:9300".parse().unwrap();
        let connect: PingError = TransportError::Connect { address, reason: "refused".into() }.into();
        assert!(matches!(connect, PingError::ConnectFailure { .. }));
        assert!(connect.is_expected());

        let remote: PingError = TransportError::Remote("boom".into()).into();
        assert!(matches!(remote, PingError::RemoteError(_)));
        assert!(!remote.is_expected());

        let shutting_down: PingError = TransportError::Remote("already closed: node is shutting down".into()).into();
        assert!(matches!(shutting_down, PingError::AlreadyClosed(_)));

        let timeout: PingError = TransportError::Timeout {
            action: "internal:discovery/ping".into(),
            timeout: Duration::from_secs(1),
        }
        .into();
        assert!(matches!(timeout, PingError::Unexpected(_)));
    }

    #[test]
    fn test_mismatch_message_names_both_clusters() {
        let err = PingError::ProtocolMismatch {
            request: ClusterName::new("other"),
            local: ClusterName::new("main"),
        };
        assert_eq!(err.to_string(), "mismatched cluster names; request: [other], local: [main]");
    }
}
