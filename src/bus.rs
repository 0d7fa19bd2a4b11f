/// Bus — the single-writer actor integrating routing, bridges, local
/// nodes, P2P, and pub/sub into one event loop.
///
/// Grounded in the teacher's runtime: one task owns all mutable state and
/// is driven exclusively by commands arriving on its `mpsc` channel. Every
/// other module in this crate is a pure decision engine or I/O handle
/// that the bus actor calls into; nothing outside this file ever touches
/// `RoutingTable`, `BridgeManager`, or `LocalNodeManager` directly.
///
/// Adjacent connections (parent or child) are driven by a small pump task
/// spawned per bridge (see `spawn_bridge_pump`): it owns the `PeerStack`
/// exclusively, forwarding inbound messages into this actor via
/// `deliver_inbound` and draining `BridgeManager`'s egress channel
/// outbound. The bus actor itself never calls `PeerStack::recv`.
use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::bridge::BridgeManager;
use crate::coordinator::ProtocolCoordinator;
use crate::dispatch::{DispatchEngine, DispatchValue};
use crate::error::{EbusError, ErrorKind, ErrorPayload};
use crate::local_node::{LocalNodeManager, P2pCall, P2pHandler, P2pOutcome, SubscriptionHandler};
use crate::p2p::{NextHop, P2pHandlerState, RouteOutcome};
use crate::protocol::{BroadcastPayload, ControlMessage, DataMessage, P2pPayload, WireMessage};
use crate::pubsub::{execute_local_targets, resolve_targets, AggregatedResult, SessionManager, Target};
use crate::routing::{RouteVia, RoutingAction, RoutingRollback, RoutingTable};
use crate::transport::PeerStack;
use crate::types::{BusId, BusPublicId, CallId, CorrelationId, Group, NodeId, Topic};

/// Egress channel capacity for a freshly-established bridge, parent or
/// child. Not exposed in `BusConfig`: it bounds one pump task's outbound
/// buffer, not an application-visible tunable.
const BRIDGE_EGRESS_CAPACITY: usize = 32;

/// Tunables for one `Bus` instance, constructed programmatically by the
/// embedding application — there is no file-based config loading here,
/// that belongs to the out-of-scope outer orchestration layer.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Capacity of the bus actor's internal command channel.
    pub command_channel_capacity: usize,
    /// Capacity of a broadcast `ask` session's result sink.
    pub session_channel_capacity: usize,
    /// How long a broadcast `ask` session waits for stragglers before it
    /// is considered stalled (diagnostic only; sessions do not time out
    /// on their own — see Open Questions).
    pub session_warn_after: Duration,
    pub default_loopback: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            command_channel_capacity: 256,
            session_channel_capacity: 64,
            session_warn_after: Duration::from_secs(10),
            default_loopback: true,
        }
    }
}

/// What to do with the outcome of a parent-bound routing commit once it
/// resolves: ack or nack the hop that originated the change.
enum CommitTarget {
    Wire { to: BusId, correlation_id: CorrelationId },
    None,
}

pub enum BusCommand {
    RegisterNode {
        id: NodeId,
        groups: Option<BTreeSet<Group>>,
        api: Option<P2pHandler>,
        reply: oneshot::Sender<Result<(), EbusError>>,
    },
    Subscribe {
        node_id: NodeId,
        topic: Topic,
        handler: SubscriptionHandler,
        reply: oneshot::Sender<Result<(), EbusError>>,
    },
    Unsubscribe {
        node_id: NodeId,
        topic: Topic,
        reply: oneshot::Sender<Result<bool, EbusError>>,
    },
    Ask {
        source_id: NodeId,
        target_id: NodeId,
        path: String,
        args: Vec<u8>,
        reply: oneshot::Sender<Result<DispatchValue, EbusError>>,
    },
    Tell {
        source_id: NodeId,
        target_id: NodeId,
        path: String,
        args: Vec<u8>,
        reply: oneshot::Sender<Result<(), EbusError>>,
    },
    PublishAll {
        source_id: NodeId,
        topic: Topic,
        path: String,
        args: Vec<u8>,
        loopback: Option<bool>,
        reply: oneshot::Sender<mpsc::Receiver<AggregatedResult>>,
    },
    PublishTell {
        source_id: NodeId,
        topic: Topic,
        path: String,
        args: Vec<u8>,
        loopback: Option<bool>,
        reply: oneshot::Sender<Result<(), EbusError>>,
    },
    CloseNode {
        id: NodeId,
        reply: oneshot::Sender<Result<(), EbusError>>,
    },
    BridgeChild {
        egress: mpsc::Sender<WireMessage>,
        allow_list: Option<BTreeSet<Group>>,
        deny_list: Option<BTreeSet<Group>>,
        reply: oneshot::Sender<u64>,
    },
    SetParent {
        egress: mpsc::Sender<WireMessage>,
    },
    ParentDisconnected,
    InboundWireMessage {
        from: RouteVia,
        message: WireMessage,
    },
    ChildDisconnected {
        bus_id: u64,
    },
    RoutingCommitResolved {
        ack_action: Option<(BusId, CorrelationId)>,
        rollback: RoutingRollback,
        result: Result<(), EbusError>,
    },
    Shutdown,
}

/// Clone-able facade handed to the embedding application. Every method
/// sends a command across the bus actor's channel and awaits the reply,
/// matching the teacher's `RuntimeHandle` pattern.
#[derive(Clone)]
pub struct BusHandle {
    tx: mpsc::Sender<BusCommand>,
    public_id: BusPublicId,
}

impl BusHandle {
    pub fn public_id(&self) -> BusPublicId {
        self.public_id
    }

    pub async fn register_node(
        &self,
        id: NodeId,
        groups: Option<BTreeSet<Group>>,
        api: Option<P2pHandler>,
    ) -> Result<(), EbusError> {
        let (reply, rx) = oneshot::channel();
        self.send(BusCommand::RegisterNode {
            id,
            groups,
            api,
            reply,
        })
        .await?;
        rx.await.map_err(channel_closed)?
    }

    pub async fn subscribe(
        &self,
        node_id: NodeId,
        topic: Topic,
        handler: SubscriptionHandler,
    ) -> Result<(), EbusError> {
        let (reply, rx) = oneshot::channel();
        self.send(BusCommand::Subscribe {
            node_id,
            topic,
            handler,
            reply,
        })
        .await?;
        rx.await.map_err(channel_closed)?
    }

    pub async fn unsubscribe(&self, node_id: NodeId, topic: Topic) -> Result<bool, EbusError> {
        let (reply, rx) = oneshot::channel();
        self.send(BusCommand::Unsubscribe {
            node_id,
            topic,
            reply,
        })
        .await?;
        rx.await.map_err(channel_closed)?
    }

    pub async fn ask(
        &self,
        source_id: NodeId,
        target_id: NodeId,
        path: String,
        args: Vec<u8>,
    ) -> Result<DispatchValue, EbusError> {
        let (reply, rx) = oneshot::channel();
        self.send(BusCommand::Ask {
            source_id,
            target_id,
            path,
            args,
            reply,
        })
        .await?;
        rx.await.map_err(channel_closed)?
    }

    pub async fn tell(
        &self,
        source_id: NodeId,
        target_id: NodeId,
        path: String,
        args: Vec<u8>,
    ) -> Result<(), EbusError> {
        let (reply, rx) = oneshot::channel();
        self.send(BusCommand::Tell {
            source_id,
            target_id,
            path,
            args,
            reply,
        })
        .await?;
        rx.await.map_err(channel_closed)?
    }

    pub async fn publish_all(
        &self,
        source_id: NodeId,
        topic: Topic,
        path: String,
        args: Vec<u8>,
        loopback: Option<bool>,
    ) -> Result<ReceiverStream<AggregatedResult>, EbusError> {
        let (reply, rx) = oneshot::channel();
        self.send(BusCommand::PublishAll {
            source_id,
            topic,
            path,
            args,
            loopback,
            reply,
        })
        .await?;
        let receiver = rx.await.map_err(channel_closed)?;
        Ok(ReceiverStream::new(receiver))
    }

    pub async fn publish_tell(
        &self,
        source_id: NodeId,
        topic: Topic,
        path: String,
        args: Vec<u8>,
        loopback: Option<bool>,
    ) -> Result<(), EbusError> {
        let (reply, rx) = oneshot::channel();
        self.send(BusCommand::PublishTell {
            source_id,
            topic,
            path,
            args,
            loopback,
            reply,
        })
        .await?;
        rx.await.map_err(channel_closed)?
    }

    /// Close and deregister a locally-hosted node: withdraws its route
    /// from the RIB, propagating unavailability to every adjacent hop.
    pub async fn close_node(&self, id: NodeId) -> Result<(), EbusError> {
        let (reply, rx) = oneshot::channel();
        self.send(BusCommand::CloseNode { id, reply }).await?;
        rx.await.map_err(channel_closed)?
    }

    /// Register `stack` as a new child bridge. A dedicated pump task owns
    /// `stack` from here on; the bus actor only ever holds the egress
    /// half, via `BridgeManager`.
    pub async fn bridge(
        &self,
        stack: Box<dyn PeerStack>,
        allow_list: Option<BTreeSet<Group>>,
        deny_list: Option<BTreeSet<Group>>,
    ) -> Result<u64, EbusError> {
        let (egress, egress_rx) = mpsc::channel(BRIDGE_EGRESS_CAPACITY);
        let (reply, rx) = oneshot::channel();
        self.send(BusCommand::BridgeChild {
            egress,
            allow_list,
            deny_list,
            reply,
        })
        .await?;
        let bus_id = rx.await.map_err(channel_closed)?;
        spawn_bridge_pump(self.clone(), stack, egress_rx, RouteVia::Child(bus_id));
        Ok(bus_id)
    }

    /// Connect `stack` as this bus's parent and start its pump task. The
    /// bus initiates a handshake on the new link as soon as it's set.
    pub async fn connect_parent(&self, stack: Box<dyn PeerStack>) -> Result<(), EbusError> {
        let (egress, egress_rx) = mpsc::channel(BRIDGE_EGRESS_CAPACITY);
        self.send(BusCommand::SetParent { egress }).await?;
        spawn_bridge_pump(self.clone(), stack, egress_rx, RouteVia::Parent);
        Ok(())
    }

    /// Feed a message received on an adjacent bridge into the bus actor.
    /// Called exclusively by a bridge's pump task.
    pub async fn deliver_inbound(&self, from: RouteVia, message: WireMessage) {
        let _ = self
            .tx
            .send(BusCommand::InboundWireMessage { from, message })
            .await;
    }

    pub async fn notify_child_disconnected(&self, bus_id: u64) {
        let _ = self.tx.send(BusCommand::ChildDisconnected { bus_id }).await;
    }

    pub async fn notify_parent_disconnected(&self) {
        let _ = self.tx.send(BusCommand::ParentDisconnected).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(BusCommand::Shutdown).await;
    }

    async fn send(&self, command: BusCommand) -> Result<(), EbusError> {
        self.tx.send(command).await.map_err(|_| EbusError::Closed)
    }
}

fn channel_closed<T>(_: oneshot::error::RecvError) -> EbusError {
    EbusError::Closed
}

/// Own `stack` exclusively and multiplex it against the bus actor: every
/// inbound message is handed to `deliver_inbound`, every message placed
/// on `egress_rx` is written out. Exits (and notifies the bus of a
/// disconnect) once either half closes.
fn spawn_bridge_pump(
    handle: BusHandle,
    mut stack: Box<dyn PeerStack>,
    mut egress_rx: mpsc::Receiver<WireMessage>,
    hop: RouteVia,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                inbound = stack.recv() => {
                    match inbound {
                        Some(message) => handle.deliver_inbound(hop, message).await,
                        None => break,
                    }
                }
                outbound = egress_rx.recv() => {
                    match outbound {
                        Some(message) => {
                            if stack.send(message).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        match hop {
            RouteVia::Child(bus_id) => handle.notify_child_disconnected(bus_id).await,
            RouteVia::Parent | RouteVia::Local => handle.notify_parent_disconnected().await,
        }
    });
}

/// Owns every piece of mutable bus state. Spawned as a single tokio task;
/// never shared across tasks.
pub struct Bus {
    config: BusConfig,
    public_id: BusPublicId,
    routing: RoutingTable,
    bridges: BridgeManager,
    locals: LocalNodeManager,
    p2p: P2pHandlerState,
    sessions: SessionManager,
    coordinator: ProtocolCoordinator,
    dispatch: DispatchEngine,
    self_tx: mpsc::Sender<BusCommand>,
}

impl Bus {
    pub fn spawn(config: BusConfig) -> BusHandle {
        let public_id = BusPublicId::new();
        let (tx, rx) = mpsc::channel(config.command_channel_capacity);
        let bus = Bus {
            config,
            public_id,
            routing: RoutingTable::new(),
            bridges: BridgeManager::new(),
            locals: LocalNodeManager::new(),
            p2p: P2pHandlerState::new(),
            sessions: SessionManager::new(),
            coordinator: ProtocolCoordinator::new(),
            dispatch: DispatchEngine::new(),
            self_tx: tx.clone(),
        };
        tokio::spawn(bus.run(rx));
        BusHandle { tx, public_id }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<BusCommand>) {
        info!(bus = %self.public_id, "bus actor started");
        while let Some(command) = rx.recv().await {
            match command {
                BusCommand::Shutdown => {
                    self.coordinator.reject_all("bus shutting down");
                    self.p2p.reject_all("bus shutting down");
                    break;
                }
                other => self.handle_command(other).await,
            }
        }
        info!(bus = %self.public_id, "bus actor stopped");
    }

    async fn handle_command(&mut self, command: BusCommand) {
        match command {
            BusCommand::RegisterNode {
                id,
                groups,
                api,
                reply,
            } => {
                let result = self.locals.register_node(id.clone(), groups, api);
                if result.is_ok() {
                    let node_groups = self
                        .locals
                        .get_local_node_groups(&id)
                        .cloned()
                        .unwrap_or_default();
                    let actions = self.routing.announce_node(
                        RouteVia::Local,
                        CorrelationId::new(),
                        id,
                        Some(node_groups),
                        &self.bridges.child_ids(),
                        self.bridges.has_parent(),
                        None,
                        None,
                    );
                    self.execute_routing_actions(actions).await;
                }
                let _ = reply.send(result);
            }
            BusCommand::Subscribe {
                node_id,
                topic,
                handler,
                reply,
            } => {
                let result = self.locals.add_subscription(&node_id, topic.clone(), handler);
                if result.is_ok() {
                    let actions = self.routing.update_subscription(
                        RouteVia::Local,
                        CorrelationId::new(),
                        node_id,
                        topic,
                        true,
                        self.bridges.has_parent(),
                    );
                    self.execute_routing_actions(actions).await;
                }
                let _ = reply.send(result);
            }
            BusCommand::Unsubscribe {
                node_id,
                topic,
                reply,
            } => {
                let result = self.locals.remove_subscription(&node_id, &topic);
                if matches!(result, Ok(true)) {
                    let actions = self.routing.update_subscription(
                        RouteVia::Local,
                        CorrelationId::new(),
                        node_id,
                        topic,
                        false,
                        self.bridges.has_parent(),
                    );
                    self.execute_routing_actions(actions).await;
                }
                let _ = reply.send(result);
            }
            BusCommand::Ask {
                source_id,
                target_id,
                path,
                args,
                reply,
            } => {
                let outcome = self.dispatch_local_or_remote_ask(source_id, target_id, path, args).await;
                let _ = reply.send(outcome);
            }
            BusCommand::Tell {
                source_id,
                target_id,
                path,
                args,
                reply,
            } => {
                let outcome = self.dispatch_local_or_remote_tell(source_id, target_id, path, args).await;
                let _ = reply.send(outcome);
            }
            BusCommand::PublishAll {
                source_id,
                topic,
                path,
                args,
                loopback,
                reply,
            } => {
                let rx = self
                    .publish(source_id, topic, path, args, loopback, true)
                    .await;
                let _ = reply.send(rx);
            }
            BusCommand::PublishTell {
                source_id,
                topic,
                path,
                args,
                loopback,
                reply,
            } => {
                self.publish(source_id, topic, path, args, loopback, false)
                    .await;
                let _ = reply.send(Ok(()));
            }
            BusCommand::CloseNode { id, reply } => {
                let result = self.close_node_internal(id).await;
                let _ = reply.send(result);
            }
            BusCommand::BridgeChild {
                egress,
                allow_list,
                deny_list,
                reply,
            } => {
                let bus_id = self.bridges.bridge(egress, allow_list, deny_list);
                let _ = reply.send(bus_id);
                self.initiate_handshake_to(RouteVia::Child(bus_id)).await;
            }
            BusCommand::SetParent { egress } => {
                self.bridges.set_parent(egress);
                self.initiate_handshake_to(RouteVia::Parent).await;
            }
            BusCommand::ParentDisconnected => {
                self.bridges.clear_parent();
                self.coordinator.reject_all("parent bridge disconnected");
                warn!("parent bridge disconnected");
            }
            BusCommand::InboundWireMessage { from, message } => {
                self.handle_inbound(from, message).await;
            }
            BusCommand::ChildDisconnected { bus_id } => {
                let removed = self.routing.purge_child(bus_id);
                self.bridges.remove_child(bus_id);
                if !removed.is_empty() {
                    warn!(bus_id, count = removed.len(), "purged routes after child disconnect");
                }
            }
            BusCommand::RoutingCommitResolved {
                ack_action,
                rollback,
                result,
            } => {
                if let Err(ref e) = result {
                    debug!(error = %e, "routing commit rejected upstream, rolling back");
                    self.apply_rollback(&rollback);
                }
                if let Some((to, correlation_id)) = ack_action {
                    let message = match result {
                        Ok(()) => WireMessage::Control(ControlMessage::Ack { correlation_id }),
                        Err(e) => WireMessage::Control(ControlMessage::Nack {
                            correlation_id,
                            error: (&e).into(),
                        }),
                    };
                    self.forward_control(to, message).await;
                }
            }
            BusCommand::Shutdown => unreachable!("handled in run()"),
        }
    }

    async fn dispatch_local_or_remote_ask(
        &mut self,
        source_id: NodeId,
        target_id: NodeId,
        path: String,
        args: Vec<u8>,
    ) -> Result<DispatchValue, EbusError> {
        if self.locals.has_node(&target_id) {
            let source_groups = self
                .locals
                .get_local_node_groups(&source_id)
                .cloned()
                .unwrap_or_default();
            match self.locals.execute_p2p_procedure(
                &target_id,
                &source_id,
                &source_groups,
                P2pCall::Ask(DispatchValue::Scalar(args)),
            ) {
                P2pOutcome::Result(result) => result,
                P2pOutcome::NoReply => Ok(DispatchValue::Scalar(vec![])),
            }
        } else if let Some(route) = self.routing.get_node_route(&target_id).cloned() {
            let source_groups = self
                .locals
                .get_local_node_groups(&source_id)
                .cloned()
                .unwrap_or_default();
            let call_id = CallId::new(&source_id);
            let rx = self.p2p.register_ask(call_id.clone());
            debug!(%call_id, %target_id, "forwarding p2p ask to remote hop");
            let message = WireMessage::Data(DataMessage::P2p {
                source_id,
                source_groups,
                destination_id: target_id,
                payload: P2pPayload::Ask {
                    call_id: call_id.clone(),
                    path,
                    args,
                },
            });
            if let Err(e) = self.forward_data(route.via, message).await {
                self.p2p
                    .resolve(&call_id, Err(EbusError::PeerStackFailure { reason: e }));
            }
            rx.await.map_err(|_| EbusError::Closed)?
        } else {
            Err(EbusError::NodeNotFound { node_id: target_id })
        }
    }

    async fn dispatch_local_or_remote_tell(
        &mut self,
        source_id: NodeId,
        target_id: NodeId,
        path: String,
        args: Vec<u8>,
    ) -> Result<(), EbusError> {
        if self.locals.has_node(&target_id) {
            let source_groups = self
                .locals
                .get_local_node_groups(&source_id)
                .cloned()
                .unwrap_or_default();
            let _ = self.locals.execute_p2p_procedure(
                &target_id,
                &source_id,
                &source_groups,
                P2pCall::Tell(DispatchValue::Scalar(args)),
            );
            Ok(())
        } else if let Some(route) = self.routing.get_node_route(&target_id).cloned() {
            let source_groups = self
                .locals
                .get_local_node_groups(&source_id)
                .cloned()
                .unwrap_or_default();
            let message = WireMessage::Data(DataMessage::P2p {
                source_id,
                source_groups,
                destination_id: target_id,
                payload: P2pPayload::Tell { path, args },
            });
            self.forward_data(route.via, message)
                .await
                .map_err(|reason| EbusError::PeerStackFailure { reason })
        } else {
            Err(EbusError::NodeNotFound { node_id: target_id })
        }
    }

    async fn publish(
        &mut self,
        source_id: NodeId,
        topic: Topic,
        path: String,
        args: Vec<u8>,
        loopback: Option<bool>,
        is_ask: bool,
    ) -> mpsc::Receiver<AggregatedResult> {
        let _ = path;
        let loopback = loopback.unwrap_or(self.config.default_loopback);
        let source_groups = self
            .locals
            .get_local_node_groups(&source_id)
            .cloned()
            .unwrap_or_default();

        let targets = resolve_targets(
            &self.routing,
            &self.bridges,
            &topic,
            RouteVia::Local,
            &source_groups,
            loopback,
            Some(&source_id),
        );

        let (tx, rx) = mpsc::channel(self.config.session_channel_capacity);
        if targets.is_empty() {
            return rx;
        }

        let local_ids: Vec<NodeId> = targets
            .iter()
            .filter_map(|t| match t {
                Target::Local(id) => Some(id.clone()),
                _ => None,
            })
            .collect();
        let remote_ids: HashSet<u64> = targets
            .iter()
            .filter_map(|t| match t {
                Target::Remote(id) => Some(*id),
                _ => None,
            })
            .collect();

        if is_ask {
            let call_id = CallId::new(&source_id);
            self.sessions.register(
                call_id.clone(),
                RouteVia::Local,
                remote_ids.clone(),
                local_ids.len(),
                tx.clone(),
            );

            for (node_id, outcome) in execute_local_targets(
                &self.locals,
                &self.dispatch,
                DispatchValue::Scalar(args.clone()),
                &local_ids,
                &source_id,
                &source_groups,
                &topic,
                true,
            ) {
                let result = match outcome {
                    Some(Ok(Some(value))) => AggregatedResult::Success {
                        node_id,
                        value: as_bytes(value),
                    },
                    Some(Ok(None)) => continue,
                    Some(Err(e)) => AggregatedResult::Failure {
                        node_id,
                        error: e.to_string(),
                    },
                    None => continue,
                };
                self.sessions.record_local_result(&call_id, result).await;
            }

            for bus_id in remote_ids {
                let payload = BroadcastPayload::Ask {
                    call_id: call_id.clone(),
                    path: String::new(),
                    args: args.clone(),
                };
                self.send_broadcast(bus_id, source_id.clone(), source_groups.clone(), topic.clone(), payload)
                    .await;
            }
        } else {
            execute_local_targets(
                &self.locals,
                &self.dispatch,
                DispatchValue::Scalar(args.clone()),
                &local_ids,
                &source_id,
                &source_groups,
                &topic,
                false,
            );
            for bus_id in remote_ids {
                let payload = BroadcastPayload::Tell {
                    path: String::new(),
                    args: args.clone(),
                };
                self.send_broadcast(bus_id, source_id.clone(), source_groups.clone(), topic.clone(), payload)
                    .await;
            }
        }
        rx
    }

    async fn send_broadcast(
        &self,
        bus_id: u64,
        source_id: NodeId,
        source_groups: BTreeSet<Group>,
        topic: Topic,
        payload: BroadcastPayload,
    ) {
        let message = WireMessage::Data(DataMessage::Broadcast {
            source_id,
            source_groups,
            topic,
            payload,
        });
        let result = if bus_id == crate::routing::PARENT_BUS_ID {
            self.bridges.send_to_parent(message).await
        } else {
            self.bridges.send_to_child(bus_id, message).await
        };
        if let Err(e) = result {
            warn!(bus_id, error = %e, "broadcast egress failed");
        }
    }

    /// Forward a data-plane message one hop toward `hop`. `Local` is
    /// never a valid destination here: a local target is always
    /// dispatched directly, never framed onto the wire.
    async fn forward_data(&self, hop: RouteVia, message: WireMessage) -> Result<(), String> {
        match hop {
            RouteVia::Child(bus_id) => self.bridges.send_to_child(bus_id, message).await,
            RouteVia::Parent => self.bridges.send_to_parent(message).await,
            RouteVia::Local => Err("cannot forward a data message to a local hop".to_string()),
        }
    }

    async fn close_node_internal(&mut self, id: NodeId) -> Result<(), EbusError> {
        self.locals.close_node(&id)?;
        let actions = self.routing.retract_node(
            RouteVia::Local,
            id,
            &self.bridges.child_ids(),
            self.bridges.has_parent(),
        );
        self.execute_routing_actions(actions).await;
        Ok(())
    }

    /// Send a `Handshake` to a freshly-connected hop and register its
    /// correlation id; the reply is awaited on a detached task since the
    /// bus actor cannot block `handle_command` on it.
    async fn initiate_handshake_to(&mut self, hop: RouteVia) {
        let correlation_id = CorrelationId::new();
        let rx = self.coordinator.register_pending(correlation_id);
        let message = WireMessage::Control(ControlMessage::Handshake {
            correlation_id,
            bus_public_id: self.public_id,
        });
        let send_result = match hop {
            RouteVia::Child(bus_id) => self.bridges.send_to_child(bus_id, message).await,
            RouteVia::Parent | RouteVia::Local => self.bridges.send_to_parent(message).await,
        };
        if let Err(e) = send_result {
            warn!(?hop, error = %e, "handshake send failed");
            self.coordinator
                .resolve_nack(correlation_id, EbusError::PeerStackFailure { reason: e });
            return;
        }
        tokio::spawn(async move {
            match rx.await {
                Ok(Ok(())) => debug!(?hop, "handshake acknowledged"),
                Ok(Err(e)) => warn!(?hop, error = %e, "handshake rejected"),
                Err(_) => warn!(?hop, "handshake future dropped before resolving"),
            }
        });
    }

    async fn handle_inbound(&mut self, from: RouteVia, message: WireMessage) {
        match message {
            WireMessage::Control(control) => self.handle_inbound_control(from, control).await,
            WireMessage::Data(DataMessage::P2p {
                source_id,
                source_groups,
                destination_id,
                payload,
            }) => {
                self.handle_inbound_p2p(from, source_id, source_groups, destination_id, payload)
                    .await;
            }
            WireMessage::Data(DataMessage::Broadcast {
                source_id,
                source_groups,
                topic,
                payload,
            }) => {
                self.handle_inbound_broadcast(from, source_id, source_groups, topic, payload)
                    .await;
            }
        }
    }

    async fn handle_inbound_control(&mut self, from: RouteVia, control: ControlMessage) {
        match control {
            ControlMessage::Handshake {
                correlation_id,
                bus_public_id,
            } => {
                debug!(peer = %bus_public_id, ?from, "handshake received");
                let reply = WireMessage::Control(ControlMessage::handshake_response(
                    correlation_id,
                    self.public_id,
                ));
                self.forward_from(from, reply).await;
            }
            ControlMessage::HandshakeResponse {
                correlation_id,
                bus_public_id,
            } => {
                debug!(peer = %bus_public_id, "handshake acknowledged by peer");
                self.coordinator.resolve_ack(correlation_id);
            }
            ControlMessage::NodeAnnouncement {
                correlation_id,
                node_id,
                groups,
                ..
            } => {
                let policy = match from {
                    RouteVia::Child(bus_id) => self.bridges.get_bridge_policy(bus_id).cloned(),
                    _ => None,
                };
                let actions = self.routing.announce_node(
                    from,
                    correlation_id,
                    node_id.clone(),
                    Some(groups),
                    &self.bridges.child_ids(),
                    self.bridges.has_parent(),
                    policy.as_ref().and_then(|p| p.allow_list.as_ref()),
                    policy.as_ref().and_then(|p| p.deny_list.as_ref()),
                );
                self.commit_or_relay(from, actions, RoutingRollback::NodeAnnounce { node_id })
                    .await;
            }
            ControlMessage::NodeUnavailable { node_id, .. } => {
                let actions = self.routing.retract_node(
                    from,
                    node_id,
                    &self.bridges.child_ids(),
                    self.bridges.has_parent(),
                );
                self.execute_routing_actions(actions).await;
            }
            ControlMessage::SubUpdate {
                correlation_id,
                node_id,
                topic,
                subscribed,
                ..
            } => {
                let actions = self.routing.update_subscription(
                    from,
                    correlation_id,
                    node_id.clone(),
                    topic.clone(),
                    subscribed,
                    self.bridges.has_parent(),
                );
                self.commit_or_relay(
                    from,
                    actions,
                    RoutingRollback::Subscription {
                        from_hop: from,
                        node_id,
                        topic,
                        subscribed,
                    },
                )
                .await;
            }
            ControlMessage::Ack { correlation_id } => {
                self.coordinator.resolve_ack(correlation_id);
            }
            ControlMessage::Nack {
                correlation_id,
                error,
            } => {
                self.coordinator.resolve_nack(correlation_id, error.into());
            }
        }
    }

    /// Apply routing actions produced by an inbound `NodeAnnouncement` or
    /// `SubUpdate`, holding back the ack to `from_hop` until any upstream
    /// propagation to the parent has itself been acked. A parent nack or
    /// unreachable parent rolls the tentative change back before the
    /// originating hop ever sees success.
    async fn commit_or_relay(
        &mut self,
        from_hop: RouteVia,
        actions: Vec<RoutingAction>,
        rollback: RoutingRollback,
    ) {
        if let Some(reject) = actions
            .iter()
            .find(|a| matches!(a, RoutingAction::Reject { .. }))
            .cloned()
        {
            if let RoutingAction::Reject {
                to,
                correlation_id,
                reason,
            } = reject
            {
                let error = EbusError::GroupPermission { message: reason };
                self.forward_control(
                    to,
                    WireMessage::Control(ControlMessage::Nack {
                        correlation_id,
                        error: (&error).into(),
                    }),
                )
                .await;
            }
            return;
        }

        let mut ack_action = None;
        let mut parent_propagation = None;
        let mut sideways = Vec::new();
        for action in actions {
            match &action {
                RoutingAction::Ack { to, correlation_id } => ack_action = Some((*to, *correlation_id)),
                RoutingAction::PropagateAnnouncement { to, .. }
                | RoutingAction::PropagateSubUpdate { to, .. }
                | RoutingAction::PropagateUnavailable { to, .. }
                    if *to == crate::routing::PARENT_BUS_ID =>
                {
                    parent_propagation = Some(action.clone());
                }
                RoutingAction::None => {}
                _ => sideways.push(action),
            }
        }

        for action in sideways {
            self.execute_routing_action(action).await;
        }

        let Some(propagation) = parent_propagation else {
            if let Some((to, correlation_id)) = ack_action {
                self.forward_control(to, WireMessage::Control(ControlMessage::Ack { correlation_id }))
                    .await;
            }
            return;
        };

        let correlation_id = routing_action_correlation_id(&propagation);
        let message = routing_action_to_message(&propagation);
        let ack_rx = self.coordinator.register_pending(correlation_id);

        if let Err(e) = self.bridges.send_to_parent(message).await {
            warn!(error = %e, "parent unreachable, rolling back tentative routing commit");
            self.apply_rollback(&rollback);
            self.coordinator
                .resolve_nack(correlation_id, EbusError::PeerStackFailure { reason: e.clone() });
            if let Some((to, cid)) = ack_action {
                let error = EbusError::PeerStackFailure { reason: e };
                self.forward_control(
                    to,
                    WireMessage::Control(ControlMessage::Nack {
                        correlation_id: cid,
                        error: (&error).into(),
                    }),
                )
                .await;
            }
            return;
        }

        let target = match ack_action {
            Some((to, cid)) => CommitTarget::Wire { to, correlation_id: cid },
            None => CommitTarget::None,
        };
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = ack_rx.await.unwrap_or(Err(EbusError::Closed));
            let ack_action = match target {
                CommitTarget::Wire { to, correlation_id } => Some((to, correlation_id)),
                CommitTarget::None => None,
            };
            let _ = self_tx
                .send(BusCommand::RoutingCommitResolved {
                    ack_action,
                    rollback,
                    result,
                })
                .await;
        });
    }

    fn apply_rollback(&mut self, rollback: &RoutingRollback) {
        match rollback {
            RoutingRollback::NodeAnnounce { node_id } => self.routing.rollback_node_announce(node_id),
            RoutingRollback::Subscription {
                from_hop,
                node_id,
                topic,
                subscribed,
            } => {
                self.routing
                    .rollback_subscription(*from_hop, node_id, topic, *subscribed);
            }
        }
    }

    async fn execute_routing_actions(&mut self, actions: Vec<RoutingAction>) {
        for action in actions {
            self.execute_routing_action(action).await;
        }
    }

    async fn execute_routing_action(&mut self, action: RoutingAction) {
        match action {
            RoutingAction::PropagateAnnouncement { .. }
            | RoutingAction::PropagateSubUpdate { .. }
            | RoutingAction::PropagateUnavailable { .. } => {
                let to = routing_action_to(&action);
                let message = routing_action_to_message(&action);
                self.forward_control(to, message).await;
            }
            RoutingAction::Ack { to, correlation_id } => {
                self.forward_control(to, WireMessage::Control(ControlMessage::Ack { correlation_id }))
                    .await;
            }
            RoutingAction::Reject {
                to,
                correlation_id,
                reason,
            } => {
                let error = EbusError::GroupPermission { message: reason };
                self.forward_control(
                    to,
                    WireMessage::Control(ControlMessage::Nack {
                        correlation_id,
                        error: (&error).into(),
                    }),
                )
                .await;
            }
            RoutingAction::None => {}
        }
    }

    async fn forward_control(&self, to: u64, message: WireMessage) {
        let result = if to == crate::routing::PARENT_BUS_ID {
            self.bridges.send_to_parent(message).await
        } else {
            self.bridges.send_to_child(to, message).await
        };
        if let Err(e) = result {
            warn!(to, error = %e, "control-plane forward failed");
        }
    }

    async fn handle_inbound_p2p(
        &mut self,
        from: RouteVia,
        source_id: NodeId,
        source_groups: BTreeSet<Group>,
        destination_id: NodeId,
        payload: P2pPayload,
    ) {
        let next_hop = if self.locals.has_node(&destination_id) {
            NextHop::Local
        } else if let Some(route) = self.routing.get_node_route(&destination_id) {
            NextHop::Remote(route.via)
        } else {
            NextHop::None
        };

        let replying_node_id = source_id.clone();
        let message = crate::p2p::P2pMessage {
            source_id,
            source_groups,
            destination_id,
            payload,
        };
        let outcome = self
            .p2p
            .route_p2p_message(message, next_hop, |cid| self.sessions.is_tracked(cid));

        match outcome {
            RouteOutcome::ExecuteLocal(msg) => self.execute_local_p2p(from, msg).await,
            RouteOutcome::DeliverToSession(call_id, payload) => match payload {
                P2pPayload::AckResult { result, .. } => {
                    let aggregated = match result {
                        Ok(bytes) => AggregatedResult::Success {
                            node_id: replying_node_id,
                            value: bytes,
                        },
                        Err(e) => AggregatedResult::Failure {
                            node_id: replying_node_id,
                            error: e.message,
                        },
                    };
                    self.sessions.record_remote_result(&call_id, aggregated).await;
                }
                P2pPayload::AckFin { .. } => {
                    let bus_id = match from {
                        RouteVia::Child(id) => id,
                        RouteVia::Parent | RouteVia::Local => crate::routing::PARENT_BUS_ID,
                    };
                    self.sessions.record_remote_fin(&call_id, bus_id);
                }
                _ => {}
            },
            RouteOutcome::ResolvePending(call_id, result) => self.p2p.resolve(&call_id, result),
            RouteOutcome::Forward(hop, msg) => {
                let wire = WireMessage::Data(DataMessage::P2p {
                    source_id: msg.source_id,
                    source_groups: msg.source_groups,
                    destination_id: msg.destination_id,
                    payload: msg.payload,
                });
                if let Err(e) = self.forward_data(hop, wire).await {
                    warn!(error = %e, "p2p forward failed");
                }
            }
            RouteOutcome::Drop => {}
            RouteOutcome::SynthesizeNotFound(msg) => self.synthesize_p2p_not_found(from, msg).await,
        }
    }

    /// Execute a P2P call against a locally-hosted node whose caller is
    /// on the other side of `from`; an `ask` gets its result framed back
    /// onto the wire, a `tell` needs no reply.
    async fn execute_local_p2p(&mut self, from: RouteVia, message: crate::p2p::P2pMessage) {
        let crate::p2p::P2pMessage {
            source_id,
            source_groups,
            destination_id,
            payload,
        } = message;
        match payload {
            P2pPayload::Ask { call_id, args, .. } => {
                let outcome = self.locals.execute_p2p_procedure(
                    &destination_id,
                    &source_id,
                    &source_groups,
                    P2pCall::Ask(DispatchValue::Scalar(args)),
                );
                let result = match outcome {
                    P2pOutcome::Result(r) => r,
                    P2pOutcome::NoReply => Ok(DispatchValue::Scalar(Vec::new())),
                };
                let wire_result = result.map(as_bytes).map_err(|e| (&e).into());
                let reply = WireMessage::Data(DataMessage::P2p {
                    source_id: destination_id,
                    source_groups,
                    destination_id: source_id,
                    payload: P2pPayload::AckResult {
                        call_id,
                        result: wire_result,
                    },
                });
                if let Err(e) = self.forward_data(from, reply).await {
                    warn!(error = %e, "p2p ack delivery failed");
                }
            }
            P2pPayload::Tell { args, .. } => {
                let _ = self.locals.execute_p2p_procedure(
                    &destination_id,
                    &source_id,
                    &source_groups,
                    P2pCall::Tell(DispatchValue::Scalar(args)),
                );
            }
            P2pPayload::AckResult { .. } | P2pPayload::AckFin { .. } => {}
        }
    }

    async fn synthesize_p2p_not_found(&self, from: RouteVia, message: crate::p2p::P2pMessage) {
        if let P2pPayload::Ask { call_id, .. } = message.payload {
            let error = EbusError::NodeNotFound {
                node_id: message.destination_id.clone(),
            };
            let reply = WireMessage::Data(DataMessage::P2p {
                source_id: message.destination_id,
                source_groups: message.source_groups,
                destination_id: message.source_id,
                payload: P2pPayload::AckResult {
                    call_id,
                    result: Err((&error).into()),
                },
            });
            if let Err(e) = self.forward_data(from, reply).await {
                warn!(error = %e, "p2p not-found reply delivery failed");
            }
        }
    }

    async fn handle_inbound_broadcast(
        &mut self,
        from: RouteVia,
        source_id: NodeId,
        source_groups: BTreeSet<Group>,
        topic: Topic,
        payload: BroadcastPayload,
    ) {
        match payload {
            BroadcastPayload::Ask { call_id, args, .. } => {
                let targets = resolve_targets(
                    &self.routing,
                    &self.bridges,
                    &topic,
                    from,
                    &source_groups,
                    false,
                    None,
                );
                let local_ids: Vec<NodeId> = targets
                    .iter()
                    .filter_map(|t| match t {
                        Target::Local(id) => Some(id.clone()),
                        _ => None,
                    })
                    .collect();
                let remote_ids: HashSet<u64> = targets
                    .iter()
                    .filter_map(|t| match t {
                        Target::Remote(id) => Some(*id),
                        _ => None,
                    })
                    .collect();

                let (tx, mut drain_rx) = mpsc::channel(self.config.session_channel_capacity);
                self.sessions.register(
                    call_id.clone(),
                    from,
                    remote_ids.clone(),
                    local_ids.len(),
                    tx,
                );

                for (node_id, outcome) in execute_local_targets(
                    &self.locals,
                    &self.dispatch,
                    DispatchValue::Scalar(args.clone()),
                    &local_ids,
                    &source_id,
                    &source_groups,
                    &topic,
                    true,
                ) {
                    let result = match outcome {
                        Some(Ok(Some(value))) => AggregatedResult::Success {
                            node_id,
                            value: as_bytes(value),
                        },
                        Some(Ok(None)) => continue,
                        Some(Err(e)) => AggregatedResult::Failure {
                            node_id,
                            error: e.to_string(),
                        },
                        None => continue,
                    };
                    self.sessions.record_local_result(&call_id, result).await;
                }

                // Relay the ask onward to every other downstream hop with
                // a subscriber, so a multi-hop fan-out still reaches them.
                for bus_id in &remote_ids {
                    let relay_payload = BroadcastPayload::Ask {
                        call_id: call_id.clone(),
                        path: String::new(),
                        args: args.clone(),
                    };
                    self.send_broadcast(
                        *bus_id,
                        source_id.clone(),
                        source_groups.clone(),
                        topic.clone(),
                        relay_payload,
                    )
                    .await;
                }

                // This bus is now a relay for `call_id`: drain whatever
                // the session collects (local results plus anything the
                // relayed hops report back) and forward each fragment,
                // then the final fin, back toward `from`.
                if let Some(egress) = self.egress_for(from) {
                    tokio::spawn(async move {
                        while let Some(result) = drain_rx.recv().await {
                            let relayed = match result {
                                AggregatedResult::Success { node_id, value } => BroadcastPayload::AckResult {
                                    call_id: call_id.clone(),
                                    node_id,
                                    result: Ok(value),
                                },
                                AggregatedResult::Failure { node_id, error } => BroadcastPayload::AckResult {
                                    call_id: call_id.clone(),
                                    node_id,
                                    result: Err(ErrorPayload {
                                        kind: ErrorKind::Internal,
                                        message: error,
                                        details: None,
                                    }),
                                },
                            };
                            let wire = WireMessage::Data(DataMessage::Broadcast {
                                source_id: source_id.clone(),
                                source_groups: source_groups.clone(),
                                topic: topic.clone(),
                                payload: relayed,
                            });
                            if egress.send(wire).await.is_err() {
                                return;
                            }
                        }
                        let fin = WireMessage::Data(DataMessage::Broadcast {
                            source_id,
                            source_groups,
                            topic,
                            payload: BroadcastPayload::AckFin { call_id },
                        });
                        let _ = egress.send(fin).await;
                    });
                } else {
                    warn!(?from, "no egress available to relay broadcast ask results");
                }
            }
            BroadcastPayload::Tell { args, .. } => {
                let targets = resolve_targets(
                    &self.routing,
                    &self.bridges,
                    &topic,
                    from,
                    &source_groups,
                    false,
                    None,
                );
                let local_ids: Vec<NodeId> = targets
                    .iter()
                    .filter_map(|t| match t {
                        Target::Local(id) => Some(id.clone()),
                        _ => None,
                    })
                    .collect();
                let remote_ids: HashSet<u64> = targets
                    .iter()
                    .filter_map(|t| match t {
                        Target::Remote(id) => Some(*id),
                        _ => None,
                    })
                    .collect();
                execute_local_targets(
                    &self.locals,
                    &self.dispatch,
                    DispatchValue::Scalar(args.clone()),
                    &local_ids,
                    &source_id,
                    &source_groups,
                    &topic,
                    false,
                );
                for bus_id in remote_ids {
                    let relay_payload = BroadcastPayload::Tell {
                        path: String::new(),
                        args: args.clone(),
                    };
                    self.send_broadcast(
                        bus_id,
                        source_id.clone(),
                        source_groups.clone(),
                        topic.clone(),
                        relay_payload,
                    )
                    .await;
                }
            }
            BroadcastPayload::AckResult {
                call_id,
                node_id,
                result,
            } => {
                let aggregated = match result {
                    Ok(bytes) => AggregatedResult::Success { node_id, value: bytes },
                    Err(e) => AggregatedResult::Failure {
                        node_id,
                        error: e.message,
                    },
                };
                self.sessions.record_remote_result(&call_id, aggregated).await;
            }
            BroadcastPayload::AckFin { call_id } => {
                if let RouteVia::Child(bus_id) = from {
                    self.sessions.record_remote_fin(&call_id, bus_id);
                } else if from == RouteVia::Parent {
                    self.sessions.record_remote_fin(&call_id, crate::routing::PARENT_BUS_ID);
                }
            }
        }
    }

    /// Forward a broadcast fragment toward `origin`, the opposite
    /// direction from which it arrived.
    async fn forward_from(&self, from: RouteVia, message: WireMessage) {
        match from {
            RouteVia::Child(bus_id) => {
                if let Err(e) = self.bridges.send_to_child(bus_id, message).await {
                    warn!(bus_id, error = %e, "broadcast fragment forward failed");
                }
            }
            RouteVia::Parent | RouteVia::Local => {
                if let Err(e) = self.bridges.send_to_parent(message).await {
                    warn!(error = %e, "broadcast fragment forward to parent failed");
                }
            }
        }
    }

    /// Clone of the egress channel toward `hop`, for handing off to a
    /// detached task that needs to keep sending after this command
    /// finishes (e.g. a relay session's result drain).
    fn egress_for(&self, hop: RouteVia) -> Option<mpsc::Sender<WireMessage>> {
        match hop {
            RouteVia::Child(bus_id) => self.bridges.child_egress_sender(bus_id),
            RouteVia::Parent | RouteVia::Local => self.bridges.parent_egress_sender(),
        }
    }
}

fn routing_action_to(action: &RoutingAction) -> u64 {
    match action {
        RoutingAction::PropagateAnnouncement { to, .. }
        | RoutingAction::PropagateSubUpdate { to, .. }
        | RoutingAction::PropagateUnavailable { to, .. }
        | RoutingAction::Ack { to, .. }
        | RoutingAction::Reject { to, .. } => *to,
        RoutingAction::None => crate::routing::PARENT_BUS_ID,
    }
}

fn routing_action_correlation_id(action: &RoutingAction) -> CorrelationId {
    match action {
        RoutingAction::PropagateAnnouncement { correlation_id, .. }
        | RoutingAction::PropagateSubUpdate { correlation_id, .. }
        | RoutingAction::PropagateUnavailable { correlation_id, .. } => *correlation_id,
        _ => unreachable!("commit_or_relay only holds a Propagate* action pending"),
    }
}

fn routing_action_to_message(action: &RoutingAction) -> WireMessage {
    match action.clone() {
        RoutingAction::PropagateAnnouncement {
            node_id,
            groups,
            correlation_id,
            ..
        } => WireMessage::Control(ControlMessage::NodeAnnouncement {
            correlation_id,
            node_id,
            groups,
            timestamp: crate::types::now_ms(),
        }),
        RoutingAction::PropagateSubUpdate {
            node_id,
            topic,
            subscribed,
            correlation_id,
            ..
        } => WireMessage::Control(ControlMessage::SubUpdate {
            correlation_id,
            node_id,
            topic,
            subscribed,
            timestamp: crate::types::now_ms(),
        }),
        RoutingAction::PropagateUnavailable {
            node_id,
            correlation_id,
            ..
        } => WireMessage::Control(ControlMessage::NodeUnavailable {
            correlation_id,
            node_id,
            timestamp: crate::types::now_ms(),
        }),
        _ => unreachable!("commit_or_relay only holds a Propagate* action pending"),
    }
}

fn as_bytes(value: DispatchValue) -> Vec<u8> {
    match value {
        DispatchValue::Scalar(bytes) => bytes,
        _ => Vec::new(),
    }
}
