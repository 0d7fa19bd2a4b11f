//! EBUS: a hierarchical, tree-structured message bus.
//!
//! Federates local `Bus` instances into one logical network of
//! addressable nodes, supporting typed point-to-point RPC (`ask`
//! request/response and `tell` fire-and-forget) and topic-based
//! publish/subscribe with result aggregation (`all` fan-in and `tell`
//! broadcast). Each bus hosts local nodes and may connect upward to a
//! single parent bus and downward to zero or more child buses over
//! opaque duplex transports, forming a spanning tree.
//!
//! Wire format: MessagePack (compact binary), via `rmp-serde`.

pub mod bridge;
pub mod bus;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod local_node;
pub mod node;
pub mod p2p;
pub mod protocol;
pub mod pubsub;
pub mod routing;
pub mod transport;
pub mod types;

pub use bridge::{BridgeManager, BridgePolicy};
pub use bus::{Bus, BusConfig, BusHandle};
pub use dispatch::{DispatchEngine, DispatchValue, PinHandle, StreamHandle};
pub use error::{EbusError, ErrorKind, ErrorPayload};
pub use node::{Node, P2pClient, PublishCall, PublisherClient, SubscriptionHandle};
pub use protocol::{BroadcastPayload, ControlMessage, DataMessage, P2pPayload, WireMessage};
pub use pubsub::AggregatedResult;
pub use routing::{RouteVia, RoutingTable};
pub use transport::{InMemoryPeerStack, PeerStack};
pub use types::{
    now_ms, BusId, BusPublicId, CallId, CorrelationId, Group, NodeId, Topic, DEFAULT_GROUP,
};
