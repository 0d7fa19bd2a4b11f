/// Protocol-level errors for EBUS.
///
/// Wraps peer-stack transport errors and adds the bus-engine error kinds
/// surfaced by the admission, routing, and dispatch layers.
use serde::{Deserialize, Serialize};

use crate::types::NodeId;

#[derive(Debug, thiserror::Error)]
pub enum EbusError {
    #[error("no route to node {node_id}")]
    NodeNotFound { node_id: NodeId },

    #[error("group policy denied: {message}")]
    GroupPermission { message: String },

    #[error("conflicting route for node {node_id}: already reachable via a different hop")]
    Conflict { node_id: NodeId },

    #[error("node {node_id} is not ready: {reason}")]
    NotReady { node_id: NodeId, reason: String },

    #[error("peer-stack connection dropped: {reason}")]
    PeerStackFailure { reason: String },

    #[error("malformed publisher call path: {reason}")]
    Malformed { reason: String },

    #[error("internal precondition violated: {0}")]
    Internal(String),

    #[error("bus is closed")]
    Closed,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl From<rmp_serde::encode::Error> for EbusError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        EbusError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for EbusError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        EbusError::Deserialization(e.to_string())
    }
}

/// Wire-shaped, round-trippable form of `EbusError` (see the `errors over
/// the wire` interface). Carries enough structure to reconstruct a typed
/// error on the far side, with a generic fallback for unrecognized kinds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    GroupPermission,
    Conflict,
    NotReady,
    PeerStackFailure,
    Malformed,
    Internal,
    Generic,
}

impl ErrorPayload {
    pub fn to_bytes(&self) -> Vec<u8> {
        rmp_serde::to_vec(self).expect("ErrorPayload serialization cannot fail")
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, EbusError> {
        rmp_serde::from_slice(data).map_err(Into::into)
    }
}

impl From<&EbusError> for ErrorPayload {
    fn from(err: &EbusError) -> Self {
        let (kind, details) = match err {
            EbusError::NodeNotFound { node_id } => (ErrorKind::NotFound, Some(node_id.clone())),
            EbusError::GroupPermission { .. } => (ErrorKind::GroupPermission, None),
            EbusError::Conflict { node_id } => (ErrorKind::Conflict, Some(node_id.clone())),
            EbusError::NotReady { node_id, .. } => (ErrorKind::NotReady, Some(node_id.clone())),
            EbusError::PeerStackFailure { .. } => (ErrorKind::PeerStackFailure, None),
            EbusError::Malformed { .. } => (ErrorKind::Malformed, None),
            EbusError::Internal(_) => (ErrorKind::Internal, None),
            _ => (ErrorKind::Generic, None),
        };
        ErrorPayload {
            kind,
            message: err.to_string(),
            details,
        }
    }
}

impl From<ErrorPayload> for EbusError {
    fn from(payload: ErrorPayload) -> Self {
        let node_id = payload.details.clone().unwrap_or_default();
        match payload.kind {
            ErrorKind::NotFound => EbusError::NodeNotFound { node_id },
            ErrorKind::GroupPermission => EbusError::GroupPermission {
                message: payload.message,
            },
            ErrorKind::Conflict => EbusError::Conflict { node_id },
            ErrorKind::NotReady => EbusError::NotReady {
                node_id,
                reason: payload.message,
            },
            ErrorKind::PeerStackFailure => EbusError::PeerStackFailure {
                reason: payload.message,
            },
            ErrorKind::Malformed => EbusError::Malformed {
                reason: payload.message,
            },
            ErrorKind::Internal => EbusError::Internal(payload.message),
            ErrorKind::Generic => EbusError::Internal(payload.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_not_found() {
        let err = EbusError::NodeNotFound {
            node_id: "n1".into(),
        };
        assert_eq!(err.to_string(), "no route to node n1");
    }

    #[test]
    fn display_conflict() {
        let err = EbusError::Conflict {
            node_id: "n1".into(),
        };
        assert!(err.to_string().contains("n1"));
    }

    #[test]
    fn error_payload_roundtrip_preserves_kind_and_message() {
        let original = EbusError::GroupPermission {
            message: "denied by deny-list".into(),
        };
        let payload = ErrorPayload::from(&original);
        let bytes = payload.to_bytes();
        let decoded = ErrorPayload::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.kind, ErrorKind::GroupPermission);
        assert_eq!(decoded.message, "denied by deny-list");

        let reconstructed: EbusError = decoded.into();
        assert!(matches!(reconstructed, EbusError::GroupPermission { .. }));
    }

    #[test]
    fn error_payload_roundtrip_preserves_node_id_detail() {
        let original = EbusError::NodeNotFound {
            node_id: "bob".into(),
        };
        let payload = ErrorPayload::from(&original);
        let bytes = payload.to_bytes();
        let decoded = ErrorPayload::from_bytes(&bytes).unwrap();
        let reconstructed: EbusError = decoded.into();
        match reconstructed {
            EbusError::NodeNotFound { node_id } => assert_eq!(node_id, "bob"),
            other => panic!("expected NodeNotFound, got {other:?}"),
        }
    }
}
