/// PubSubHandler — publish flow and session aggregation for topic-based
/// broadcast `all`/`tell`.
///
/// A `Session` is exclusively owned by this module: it tracks one
/// in-flight broadcast `ask`, counting down local targets and remote
/// targets independently until every target has reported its final
/// fan-in, at which point the session's sink is closed.
use std::collections::{BTreeSet, HashMap, HashSet};

use tokio::sync::mpsc;

use crate::bridge::BridgeManager;
use crate::dispatch::{DispatchEngine, DispatchValue};
use crate::error::EbusError;
use crate::local_node::{LocalNodeManager, P2pCall};
use crate::routing::{RouteVia, RoutingTable};
use crate::types::{BusId, CallId, Group, NodeId, Topic};

/// One result fragment delivered to a broadcast `ask`'s caller.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregatedResult {
    Success { node_id: NodeId, value: Vec<u8> },
    Failure { node_id: NodeId, error: String },
}

struct Session {
    origin: RouteVia,
    remote_targets: HashSet<BusId>,
    finished_remote: HashSet<BusId>,
    pending_local: usize,
    sink: mpsc::Sender<AggregatedResult>,
}

impl Session {
    fn is_complete(&self) -> bool {
        self.pending_local == 0 && self.finished_remote.len() == self.remote_targets.len()
    }
}

pub struct SessionManager {
    sessions: HashMap<CallId, Session>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }

    pub fn is_tracked(&self, call_id: &CallId) -> bool {
        self.sessions.contains_key(call_id)
    }

    pub fn register(
        &mut self,
        call_id: CallId,
        origin: RouteVia,
        remote_targets: HashSet<BusId>,
        pending_local: usize,
        sink: mpsc::Sender<AggregatedResult>,
    ) {
        self.sessions.insert(
            call_id,
            Session {
                origin,
                remote_targets,
                finished_remote: HashSet::new(),
                pending_local,
                sink,
            },
        );
    }

    /// Record one local result; decrements `pending_local`. Closes and
    /// removes the session if it has now completed.
    pub async fn record_local_result(&mut self, call_id: &CallId, result: AggregatedResult) {
        let done = if let Some(session) = self.sessions.get_mut(call_id) {
            let _ = session.sink.send(result).await;
            session.pending_local = session.pending_local.saturating_sub(1);
            session.is_complete()
        } else {
            false
        };
        if done {
            self.sessions.remove(call_id);
        }
    }

    /// Record one fragment received from a remote target via `ack_result`.
    pub async fn record_remote_result(&mut self, call_id: &CallId, result: AggregatedResult) {
        if let Some(session) = self.sessions.get_mut(call_id) {
            let _ = session.sink.send(result).await;
        }
    }

    /// Mark a remote target finished (`ack_fin`). Closes and removes the
    /// session if it has now completed.
    pub fn record_remote_fin(&mut self, call_id: &CallId, bus_id: BusId) {
        let done = if let Some(session) = self.sessions.get_mut(call_id) {
            session.finished_remote.insert(bus_id);
            session.is_complete()
        } else {
            false
        };
        if done {
            self.sessions.remove(call_id);
        }
    }

    pub fn origin(&self, call_id: &CallId) -> Option<RouteVia> {
        self.sessions.get(call_id).map(|s| s.origin)
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// A single broadcast target, local or remote, resolved by the publish
/// flow before dispatch-cloning the call's arguments.
pub enum Target {
    Local(NodeId),
    Remote(BusId),
}

/// Resolve the full target set for one incoming (or locally-initiated)
/// broadcast, following §4.7's publish flow steps 1-3.
pub fn resolve_targets(
    routing: &RoutingTable,
    bridges: &BridgeManager,
    topic: &Topic,
    source: RouteVia,
    source_groups: &BTreeSet<Group>,
    loopback: bool,
    source_node_id: Option<&NodeId>,
) -> Vec<Target> {
    let downstream = routing.get_broadcast_downstream(topic, source);
    let filtered_children = bridges.filter_downstream_children(&downstream, source_groups);

    let mut targets: Vec<Target> = filtered_children.into_iter().map(Target::Remote).collect();
    if routing.should_forward_to_parent(topic, source) {
        targets.push(Target::Remote(crate::routing::PARENT_BUS_ID));
    }

    let local_targets: Vec<NodeId> = match source {
        RouteVia::Local => {
            let mut subs = routing.get_local_subscribers(topic);
            if !loopback {
                if let Some(origin) = source_node_id {
                    subs.retain(|id| id != origin);
                }
            }
            subs
        }
        _ => routing.get_local_subscribers(topic),
    };
    targets.extend(local_targets.into_iter().map(Target::Local));
    targets
}

/// Execute the local half of a publish flow: dispatch-clone the argument
/// to every local target and invoke each one's subscription handler.
pub fn execute_local_targets(
    locals: &LocalNodeManager,
    dispatch: &DispatchEngine,
    arg: DispatchValue,
    targets: &[NodeId],
    source_id: &NodeId,
    source_groups: &BTreeSet<Group>,
    topic: &Topic,
    is_ask: bool,
) -> Vec<(NodeId, Option<Result<Option<DispatchValue>, EbusError>>)> {
    if targets.is_empty() {
        return Vec::new();
    }
    let copies = dispatch.dispatch(arg, targets.len());
    targets
        .iter()
        .zip(copies)
        .map(|(node_id, copy)| {
            let outcome = if is_ask {
                locals.execute_broadcast_procedure(node_id, source_id, source_groups, topic, copy)
            } else {
                let _ = locals.execute_broadcast_procedure(
                    node_id,
                    source_id,
                    source_groups,
                    topic,
                    copy,
                );
                None
            };
            (node_id.clone(), outcome)
        })
        .collect()
}

/// Shape of a broadcast `tell` executed via the Local Node Manager's
/// generic P2P entry point, used when a subscriber has no dedicated
/// broadcast handler and instead shares its P2P API (kept distinct from
/// `execute_broadcast_procedure` since `tell` never needs a result).
pub fn execute_local_tell(
    locals: &LocalNodeManager,
    arg: DispatchValue,
    target: &NodeId,
    source_id: &NodeId,
    source_groups: &BTreeSet<Group>,
) {
    let _ = locals.execute_p2p_procedure(target, source_id, source_groups, P2pCall::Tell(arg));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_ok(node_id: &str) -> AggregatedResult {
        AggregatedResult::Success {
            node_id: node_id.to_string(),
            value: vec![],
        }
    }

    #[tokio::test]
    async fn session_completes_once_local_drained_and_remotes_fin() {
        let mut sessions = SessionManager::new();
        let (tx, mut rx) = mpsc::channel(16);
        let call_id = CallId::new("n1");
        sessions.register(
            call_id.clone(),
            RouteVia::Local,
            HashSet::from([1, 2]),
            1,
            tx,
        );
        assert!(sessions.is_tracked(&call_id));

        sessions.record_local_result(&call_id, result_ok("local1")).await;
        assert!(sessions.is_tracked(&call_id));

        sessions.record_remote_fin(&call_id, 1);
        assert!(sessions.is_tracked(&call_id));

        sessions.record_remote_fin(&call_id, 2);
        assert!(!sessions.is_tracked(&call_id));

        let received = rx.recv().await.unwrap();
        assert_eq!(received, result_ok("local1"));
    }

    #[test]
    fn resolve_targets_excludes_origin_when_loopback_disabled() {
        let mut routing = RoutingTable::new();
        routing.update_subscription(
            RouteVia::Local,
            crate::types::CorrelationId::new(),
            "n1".to_string(),
            "room".to_string(),
            true,
            false,
        );
        routing.update_subscription(
            RouteVia::Local,
            crate::types::CorrelationId::new(),
            "n2".to_string(),
            "room".to_string(),
            true,
            false,
        );
        let bridges = BridgeManager::new();
        let targets = resolve_targets(
            &routing,
            &bridges,
            &"room".to_string(),
            RouteVia::Local,
            &BTreeSet::from(["".to_string()]),
            false,
            Some(&"n1".to_string()),
        );
        let local_ids: Vec<NodeId> = targets
            .into_iter()
            .filter_map(|t| match t {
                Target::Local(id) => Some(id),
                _ => None,
            })
            .collect();
        assert_eq!(local_ids, vec!["n2".to_string()]);
    }

    #[test]
    fn execute_local_targets_returns_empty_vec_for_no_targets() {
        let locals = LocalNodeManager::new();
        let dispatch = DispatchEngine::new();
        let result = execute_local_targets(
            &locals,
            &dispatch,
            DispatchValue::Scalar(vec![]),
            &[],
            &"n1".to_string(),
            &BTreeSet::from(["".to_string()]),
            &"room".to_string(),
            true,
        );
        assert!(result.is_empty());
    }
}
