/// Thin, user-facing facade over a `BusHandle`: the shapes an embedding
/// application actually constructs and holds onto, as opposed to the
/// bus-internal command/action types in `bus.rs`.
use std::collections::BTreeSet;

use tokio_stream::wrappers::ReceiverStream;

use crate::bus::BusHandle;
use crate::dispatch::DispatchValue;
use crate::error::EbusError;
use crate::local_node::{P2pHandler, SubscriptionHandler};
use crate::pubsub::AggregatedResult;
use crate::types::{Group, NodeId, Topic};

/// A locally-registered node, addressable by `id` across the whole tree.
#[derive(Clone)]
pub struct Node {
    bus: BusHandle,
    id: NodeId,
}

impl Node {
    pub async fn register(
        bus: BusHandle,
        id: NodeId,
        groups: Option<BTreeSet<Group>>,
        api: Option<P2pHandler>,
    ) -> Result<Self, EbusError> {
        bus.register_node(id.clone(), groups, api).await?;
        Ok(Self { bus, id })
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Issue a point-to-point request and await the target's reply.
    pub async fn ask(&self, target: NodeId, path: &str, args: Vec<u8>) -> Result<DispatchValue, EbusError> {
        self.bus
            .ask(self.id.clone(), target, path.to_string(), args)
            .await
    }

    /// Fire-and-forget point-to-point message.
    pub async fn tell(&self, target: NodeId, path: &str, args: Vec<u8>) -> Result<(), EbusError> {
        self.bus
            .tell(self.id.clone(), target, path.to_string(), args)
            .await
    }

    /// Subscribe this node to `topic`, installing `handler` to answer
    /// broadcasts that reach it.
    pub async fn subscribe(
        &self,
        topic: Topic,
        handler: SubscriptionHandler,
    ) -> Result<SubscriptionHandle, EbusError> {
        self.bus
            .subscribe(self.id.clone(), topic.clone(), handler)
            .await?;
        Ok(SubscriptionHandle {
            bus: self.bus.clone(),
            node_id: self.id.clone(),
            topic,
        })
    }

    /// Start building a publish call on `topic`.
    pub fn publisher(&self, topic: Topic) -> PublisherClient {
        PublisherClient {
            bus: self.bus.clone(),
            source_id: self.id.clone(),
            topic,
            loopback: None,
        }
    }

    /// Build a client for point-to-point calls addressed to `target`,
    /// without first building a publish-style call through `publisher`.
    pub fn connect_to(&self, target: NodeId) -> P2pClient {
        P2pClient {
            bus: self.bus.clone(),
            source_id: self.id.clone(),
            target,
        }
    }

    /// Withdraw this node's route and remove its record from the bus it
    /// is registered on. The node handle is consumed: nothing can be done
    /// with it afterward.
    pub async fn close(self) -> Result<(), EbusError> {
        self.bus.close_node(self.id).await
    }
}

/// Point-to-point client bound to one (source, target) pair, an
/// alternative to `Node::ask`/`Node::tell` for callers that want to reuse
/// the same target across several calls without repeating its id.
pub struct P2pClient {
    bus: BusHandle,
    source_id: NodeId,
    target: NodeId,
}

impl P2pClient {
    pub async fn ask(&self, path: &str, args: Vec<u8>) -> Result<DispatchValue, EbusError> {
        self.bus
            .ask(self.source_id.clone(), self.target.clone(), path.to_string(), args)
            .await
    }

    pub async fn tell(&self, path: &str, args: Vec<u8>) -> Result<(), EbusError> {
        self.bus
            .tell(self.source_id.clone(), self.target.clone(), path.to_string(), args)
            .await
    }
}

/// Returned by `Node::subscribe`; dropping it does not unsubscribe —
/// call `unsubscribe` explicitly, matching the teacher's pattern of
/// exposing lifecycle operations as deliberate calls rather than relying
/// on Drop for network-visible side effects.
pub struct SubscriptionHandle {
    bus: BusHandle,
    node_id: NodeId,
    topic: Topic,
}

impl SubscriptionHandle {
    pub async fn unsubscribe(self) -> Result<bool, EbusError> {
        self.bus.unsubscribe(self.node_id, self.topic).await
    }
}

/// Builder-style publish client: `publisher.call(path, args).all()` /
/// `.tell()`. EBUS targets a statically-typed host language rather than
/// dynamic member access, so the call path is a plain string argument
/// instead of a proxy method name.
pub struct PublisherClient {
    bus: BusHandle,
    source_id: NodeId,
    topic: Topic,
    loopback: Option<bool>,
}

impl PublisherClient {
    pub fn loopback(mut self, enabled: bool) -> Self {
        self.loopback = Some(enabled);
        self
    }

    pub fn call(self, path: &str, args: Vec<u8>) -> PublishCall {
        PublishCall {
            bus: self.bus,
            source_id: self.source_id,
            topic: self.topic,
            path: path.to_string(),
            args,
            loopback: self.loopback,
        }
    }
}

pub struct PublishCall {
    bus: BusHandle,
    source_id: NodeId,
    topic: Topic,
    path: String,
    args: Vec<u8>,
    loopback: Option<bool>,
}

impl PublishCall {
    /// Broadcast `ask`: fan out to every downstream target and aggregate
    /// their results as they arrive.
    pub async fn all(self) -> Result<ReceiverStream<AggregatedResult>, EbusError> {
        self.bus
            .publish_all(self.source_id, self.topic, self.path, self.args, self.loopback)
            .await
    }

    /// Broadcast `tell`: fire-and-forget to every downstream target.
    pub async fn tell(self) -> Result<(), EbusError> {
        self.bus
            .publish_tell(self.source_id, self.topic, self.path, self.args, self.loopback)
            .await
    }
}
