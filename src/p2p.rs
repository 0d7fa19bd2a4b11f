/// P2pHandler — routes point-to-point `ask`/`tell` traffic hop by hop
/// and tracks locally-initiated `ask` calls awaiting a reply.
use std::collections::{BTreeSet, HashMap};

use tokio::sync::oneshot;

use crate::dispatch::DispatchValue;
use crate::error::EbusError;
use crate::protocol::P2pPayload;
use crate::routing::RouteVia;
use crate::types::{CallId, Group, NodeId};

pub enum NextHop {
    Local,
    Remote(RouteVia),
    None,
}

pub struct P2pMessage {
    pub source_id: NodeId,
    pub source_groups: BTreeSet<Group>,
    pub destination_id: NodeId,
    pub payload: P2pPayload,
}

/// What `route_p2p_message` wants the bus actor to do next. Routing
/// itself never touches I/O — it hands back an instruction.
pub enum RouteOutcome {
    /// Execute locally via the Local Node Manager.
    ExecuteLocal(P2pMessage),
    /// Hand this response to the pub/sub session manager instead of the
    /// P2P pending map — it belongs to a broadcast session.
    DeliverToSession(CallId, P2pPayload),
    /// Resolve (or reject) a locally-pending `ask`.
    ResolvePending(CallId, Result<DispatchValue, EbusError>),
    /// Forward unchanged to the given remote hop.
    Forward(RouteVia, P2pMessage),
    /// No hop and no reply expected (a `tell` with no route).
    Drop,
    /// No hop for an `ask`: synthesize a not-found reply back to source.
    SynthesizeNotFound(P2pMessage),
}

pub struct P2pHandlerState {
    pending: HashMap<CallId, oneshot::Sender<Result<DispatchValue, EbusError>>>,
}

impl P2pHandlerState {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }

    /// Fail-fast checks before constructing a client for `target`. Group
    /// overlap is checked optimistically: if target groups are unknown,
    /// the call proceeds and the final check happens at the target's
    /// Local Node Manager.
    pub fn create_p2p_client(
        next_hop: NextHop,
        source_groups: &BTreeSet<Group>,
        target_groups: Option<&BTreeSet<Group>>,
        target_id: &NodeId,
    ) -> Result<(), EbusError> {
        if matches!(next_hop, NextHop::None) {
            return Err(EbusError::NodeNotFound {
                node_id: target_id.clone(),
            });
        }
        if let Some(target_groups) = target_groups {
            if !crate::types::groups_intersect(source_groups, target_groups) {
                return Err(EbusError::GroupPermission {
                    message: format!("no shared group with {target_id}"),
                });
            }
        }
        Ok(())
    }

    /// Register a pending entry for a newly-issued `ask`, returning the
    /// future the caller awaits.
    pub fn register_ask(
        &mut self,
        call_id: CallId,
    ) -> oneshot::Receiver<Result<DispatchValue, EbusError>> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(call_id, tx);
        rx
    }

    pub fn is_pending(&self, call_id: &CallId) -> bool {
        self.pending.contains_key(call_id)
    }

    pub fn resolve(&mut self, call_id: &CallId, result: Result<DispatchValue, EbusError>) {
        if let Some(tx) = self.pending.remove(call_id) {
            let _ = tx.send(result);
        }
    }

    /// Reject every pending `ask`, e.g. when the hosting node is removed.
    pub fn reject_all(&mut self, reason: &str) {
        for (_, tx) in self.pending.drain() {
            let _ = tx.send(Err(EbusError::PeerStackFailure {
                reason: reason.to_string(),
            }));
        }
    }

    /// Decide what to do with an inbound P2P message, given the next hop
    /// for its destination and whether the matching call id currently
    /// belongs to a broadcast session.
    pub fn route_p2p_message(
        &self,
        message: P2pMessage,
        next_hop: NextHop,
        call_id_owned_by_session: impl Fn(&CallId) -> bool,
    ) -> RouteOutcome {
        match next_hop {
            NextHop::Local => match &message.payload {
                P2pPayload::Ask { .. } | P2pPayload::Tell { .. } => {
                    RouteOutcome::ExecuteLocal(message)
                }
                P2pPayload::AckResult { call_id, .. } | P2pPayload::AckFin { call_id } => {
                    if call_id_owned_by_session(call_id) {
                        RouteOutcome::DeliverToSession(call_id.clone(), message.payload)
                    } else if self.is_pending(call_id) {
                        let result = match &message.payload {
                            P2pPayload::AckResult { result, .. } => result
                                .clone()
                                .map(DispatchValue::Scalar)
                                .map_err(EbusError::from),
                            P2pPayload::AckFin { .. } => Err(EbusError::Internal(
                                "ack_fin received for a plain P2P ask".to_string(),
                            )),
                            _ => unreachable!(),
                        };
                        RouteOutcome::ResolvePending(call_id.clone(), result)
                    } else {
                        RouteOutcome::Drop
                    }
                }
            },
            NextHop::Remote(hop) => RouteOutcome::Forward(hop, message),
            NextHop::None => match &message.payload {
                P2pPayload::Ask { .. } => RouteOutcome::SynthesizeNotFound(message),
                _ => RouteOutcome::Drop,
            },
        }
    }
}

impl Default for P2pHandlerState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_p2p_client_fails_fast_without_route() {
        let err = P2pHandlerState::create_p2p_client(
            NextHop::None,
            &BTreeSet::from(["".to_string()]),
            None,
            &"missing".to_string(),
        )
        .unwrap_err();
        assert!(matches!(err, EbusError::NodeNotFound { .. }));
    }

    #[test]
    fn create_p2p_client_rejects_disjoint_known_target_groups() {
        let err = P2pHandlerState::create_p2p_client(
            NextHop::Remote(RouteVia::Parent),
            &BTreeSet::from(["g1".to_string()]),
            Some(&BTreeSet::from(["g2".to_string()])),
            &"n1".to_string(),
        )
        .unwrap_err();
        assert!(matches!(err, EbusError::GroupPermission { .. }));
    }

    #[test]
    fn create_p2p_client_proceeds_optimistically_without_known_target_groups() {
        P2pHandlerState::create_p2p_client(
            NextHop::Remote(RouteVia::Parent),
            &BTreeSet::from(["g1".to_string()]),
            None,
            &"n1".to_string(),
        )
        .unwrap();
    }

    #[test]
    fn route_with_no_hop_and_ask_synthesizes_not_found() {
        let state = P2pHandlerState::new();
        let message = P2pMessage {
            source_id: "n1".to_string(),
            source_groups: BTreeSet::from(["".to_string()]),
            destination_id: "missing".to_string(),
            payload: P2pPayload::Ask {
                call_id: CallId::new("n1"),
                path: "greet".to_string(),
                args: vec![],
            },
        };
        let outcome = state.route_p2p_message(message, NextHop::None, |_| false);
        assert!(matches!(outcome, RouteOutcome::SynthesizeNotFound(_)));
    }

    #[test]
    fn route_with_no_hop_and_tell_drops() {
        let state = P2pHandlerState::new();
        let message = P2pMessage {
            source_id: "n1".to_string(),
            source_groups: BTreeSet::from(["".to_string()]),
            destination_id: "missing".to_string(),
            payload: P2pPayload::Tell {
                path: "greet".to_string(),
                args: vec![],
            },
        };
        let outcome = state.route_p2p_message(message, NextHop::None, |_| false);
        assert!(matches!(outcome, RouteOutcome::Drop));
    }
}
