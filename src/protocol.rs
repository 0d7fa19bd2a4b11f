use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{EbusError, ErrorPayload};
use crate::types::{now_ms, BusId, BusPublicId, CallId, CorrelationId, Group, NodeId, Topic};

/// Top-level wire message exchanged between adjacent bus instances over a
/// peer-stack connection. Serialized as MessagePack — the connection
/// transports opaque bytes, never parses payload content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum WireMessage {
    Control(ControlMessage),
    Data(DataMessage),
}

impl WireMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, EbusError> {
        rmp_serde::to_vec(self).map_err(Into::into)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, EbusError> {
        rmp_serde::from_slice(data).map_err(Into::into)
    }
}

/// Control-plane messages propagate RIB changes across one hop and expect
/// a correlated ack before the sender considers the change committed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ControlMessage {
    /// Sent by a newly-registered adjacent bus to introduce itself before
    /// any RIB traffic is exchanged.
    Handshake {
        correlation_id: CorrelationId,
        bus_public_id: BusPublicId,
    },
    HandshakeResponse {
        correlation_id: CorrelationId,
        bus_public_id: BusPublicId,
    },
    NodeAnnouncement {
        correlation_id: CorrelationId,
        node_id: NodeId,
        groups: BTreeSet<Group>,
        timestamp: u64,
    },
    /// A node's route is withdrawn: deregistered locally, or purged on
    /// disconnect from the hop that announced it.
    NodeUnavailable {
        correlation_id: CorrelationId,
        node_id: NodeId,
        timestamp: u64,
    },
    SubUpdate {
        correlation_id: CorrelationId,
        node_id: NodeId,
        topic: Topic,
        subscribed: bool,
        timestamp: u64,
    },
    Ack {
        correlation_id: CorrelationId,
    },
    Nack {
        correlation_id: CorrelationId,
        error: ErrorPayload,
    },
}

impl ControlMessage {
    pub fn correlation_id(&self) -> CorrelationId {
        match self {
            ControlMessage::Handshake { correlation_id, .. }
            | ControlMessage::HandshakeResponse { correlation_id, .. }
            | ControlMessage::NodeAnnouncement { correlation_id, .. }
            | ControlMessage::NodeUnavailable { correlation_id, .. }
            | ControlMessage::SubUpdate { correlation_id, .. }
            | ControlMessage::Ack { correlation_id }
            | ControlMessage::Nack { correlation_id, .. } => *correlation_id,
        }
    }

    pub fn handshake(bus_public_id: BusPublicId) -> Self {
        ControlMessage::Handshake {
            correlation_id: CorrelationId::new(),
            bus_public_id,
        }
    }

    pub fn handshake_response(correlation_id: CorrelationId, bus_public_id: BusPublicId) -> Self {
        ControlMessage::HandshakeResponse {
            correlation_id,
            bus_public_id,
        }
    }

    pub fn announce(node_id: NodeId, groups: BTreeSet<Group>) -> Self {
        ControlMessage::NodeAnnouncement {
            correlation_id: CorrelationId::new(),
            node_id,
            groups,
            timestamp: now_ms(),
        }
    }

    pub fn unavailable(node_id: NodeId) -> Self {
        ControlMessage::NodeUnavailable {
            correlation_id: CorrelationId::new(),
            node_id,
            timestamp: now_ms(),
        }
    }

    pub fn sub_update(node_id: NodeId, topic: Topic, subscribed: bool) -> Self {
        ControlMessage::SubUpdate {
            correlation_id: CorrelationId::new(),
            node_id,
            topic,
            subscribed,
            timestamp: now_ms(),
        }
    }
}

/// Data-plane messages carry application payloads: direct P2P calls and
/// topic broadcasts, plus their asynchronous result/completion signals.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum DataMessage {
    P2p {
        source_id: NodeId,
        source_groups: BTreeSet<Group>,
        destination_id: NodeId,
        payload: P2pPayload,
    },
    Broadcast {
        source_id: NodeId,
        source_groups: BTreeSet<Group>,
        topic: Topic,
        payload: BroadcastPayload,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum P2pPayload {
    Ask {
        call_id: CallId,
        path: String,
        args: Vec<u8>,
    },
    Tell {
        path: String,
        args: Vec<u8>,
    },
    AckResult {
        call_id: CallId,
        result: Result<Vec<u8>, ErrorPayload>,
    },
    AckFin {
        call_id: CallId,
    },
}

/// A broadcast `ask` session is identified by `call_id` and may receive
/// any number of `AckResult` fragments from a given downstream hop before
/// that hop signals `AckFin`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum BroadcastPayload {
    Ask {
        call_id: CallId,
        path: String,
        args: Vec<u8>,
    },
    Tell {
        path: String,
        args: Vec<u8>,
    },
    AckResult {
        call_id: CallId,
        node_id: NodeId,
        result: Result<Vec<u8>, ErrorPayload>,
    },
    AckFin {
        call_id: CallId,
    },
}
