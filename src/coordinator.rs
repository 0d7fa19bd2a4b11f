/// ProtocolCoordinator — owns pending-ack bookkeeping for outbound
/// control-plane requests and classifies inbound control messages by
/// kind for the bus actor loop.
use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::error::EbusError;
use crate::protocol::ControlMessage;
use crate::types::CorrelationId;

pub enum ControlEventKind {
    SubscriptionUpdate,
    NodeAnnouncement,
    NodeUnavailable,
    Handshake,
    Ack,
    Nack,
}

impl ControlEventKind {
    pub fn classify(message: &ControlMessage) -> Self {
        match message {
            ControlMessage::SubUpdate { .. } => ControlEventKind::SubscriptionUpdate,
            ControlMessage::NodeAnnouncement { .. } => ControlEventKind::NodeAnnouncement,
            ControlMessage::NodeUnavailable { .. } => ControlEventKind::NodeUnavailable,
            ControlMessage::Handshake { .. } | ControlMessage::HandshakeResponse { .. } => {
                ControlEventKind::Handshake
            }
            ControlMessage::Ack { .. } => ControlEventKind::Ack,
            ControlMessage::Nack { .. } => ControlEventKind::Nack,
        }
    }
}

pub struct ProtocolCoordinator {
    pending: HashMap<CorrelationId, oneshot::Sender<Result<(), EbusError>>>,
}

impl ProtocolCoordinator {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }

    /// Register a pending ack for `correlation_id`, returning the future
    /// side the caller awaits. The bus actor sends `message` and then
    /// keeps processing other work while this resolves.
    pub fn register_pending(
        &mut self,
        correlation_id: CorrelationId,
    ) -> oneshot::Receiver<Result<(), EbusError>> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation_id, tx);
        rx
    }

    /// Resolve a pending request with a successful ack.
    pub fn resolve_ack(&mut self, correlation_id: CorrelationId) {
        if let Some(tx) = self.pending.remove(&correlation_id) {
            let _ = tx.send(Ok(()));
        }
    }

    /// Reject a pending request, reconstructing a typed error from the
    /// nack's error payload.
    pub fn resolve_nack(&mut self, correlation_id: CorrelationId, error: EbusError) {
        if let Some(tx) = self.pending.remove(&correlation_id) {
            let _ = tx.send(Err(error));
        }
    }

    /// Reject every outstanding pending ack, e.g. when the adjacent
    /// connection drops or the bus closes.
    pub fn reject_all(&mut self, reason: &str) {
        for (_, tx) in self.pending.drain() {
            let _ = tx.send(Err(EbusError::PeerStackFailure {
                reason: reason.to_string(),
            }));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Default for ProtocolCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
