/// LocalNodeManager — owns every node actually hosted by this bus
/// instance and the application-supplied handlers that answer P2P and
/// pub/sub traffic addressed to them.
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::dispatch::DispatchValue;
use crate::error::EbusError;
use crate::types::{normalize_groups, groups_intersect, Group, NodeId, Topic};

/// Context handed to a node's handler on every invocation: who sent this,
/// under which groups, and (for pub/sub) which topic it arrived on.
pub struct HandlerContext {
    pub source_node_id: NodeId,
    pub source_groups: BTreeSet<Group>,
    pub local_node_id: NodeId,
    pub topic: Option<Topic>,
}

/// What a node's handler does with a call: either it produces a result
/// (`ask`) or it runs for effect only (`tell`). Returning `Err` from an
/// `ask` handler surfaces as a typed failure to the caller.
pub type P2pHandler =
    Box<dyn Fn(&HandlerContext, DispatchValue) -> Result<DispatchValue, EbusError> + Send + Sync>;
pub type SubscriptionHandler =
    Box<dyn Fn(&HandlerContext, DispatchValue) -> Result<Option<DispatchValue>, EbusError> + Send + Sync>;

struct NodeRecord {
    groups: BTreeSet<Group>,
    api: Option<P2pHandler>,
    subscriptions: HashMap<Topic, SubscriptionHandler>,
    closing: bool,
}

pub enum P2pCall {
    Ask(DispatchValue),
    Tell(DispatchValue),
}

pub enum P2pOutcome {
    Result(Result<DispatchValue, EbusError>),
    NoReply,
}

pub struct LocalNodeManager {
    nodes: HashMap<NodeId, NodeRecord>,
}

impl LocalNodeManager {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
        }
    }

    pub fn register_node(
        &mut self,
        id: NodeId,
        groups: Option<BTreeSet<Group>>,
        api: Option<P2pHandler>,
    ) -> Result<(), EbusError> {
        if self.nodes.contains_key(&id) {
            return Err(EbusError::Conflict { node_id: id });
        }
        self.nodes.insert(
            id,
            NodeRecord {
                groups: normalize_groups(groups),
                api,
                subscriptions: HashMap::new(),
                closing: false,
            },
        );
        Ok(())
    }

    pub fn update_node_api(&mut self, id: &NodeId, api: P2pHandler) -> Result<(), EbusError> {
        let record = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| EbusError::NodeNotFound { node_id: id.clone() })?;
        record.api = Some(api);
        Ok(())
    }

    pub fn add_subscription(
        &mut self,
        id: &NodeId,
        topic: Topic,
        handler: SubscriptionHandler,
    ) -> Result<(), EbusError> {
        let record = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| EbusError::NodeNotFound { node_id: id.clone() })?;
        record.subscriptions.insert(topic, handler);
        Ok(())
    }

    pub fn remove_subscription(&mut self, id: &NodeId, topic: &Topic) -> Result<bool, EbusError> {
        let record = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| EbusError::NodeNotFound { node_id: id.clone() })?;
        Ok(record.subscriptions.remove(topic).is_some())
    }

    pub fn get_topics_for_node(&self, id: &NodeId) -> Vec<Topic> {
        self.nodes
            .get(id)
            .map(|r| r.subscriptions.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn mark_as_closing(&mut self, id: &NodeId) -> Result<(), EbusError> {
        let record = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| EbusError::NodeNotFound { node_id: id.clone() })?;
        record.closing = true;
        Ok(())
    }

    /// Remove a node's record entirely, returning the topics it had been
    /// subscribed to so the caller can fold their withdrawal into routing.
    pub fn close_node(&mut self, id: &NodeId) -> Result<Vec<Topic>, EbusError> {
        let record = self
            .nodes
            .remove(id)
            .ok_or_else(|| EbusError::NodeNotFound { node_id: id.clone() })?;
        Ok(record.subscriptions.into_keys().collect())
    }

    pub fn has_node(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn get_local_node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().cloned().collect()
    }

    pub fn get_local_node_groups(&self, id: &NodeId) -> Option<&BTreeSet<Group>> {
        self.nodes.get(id).map(|r| &r.groups)
    }

    /// Every topic with at least one local subscriber.
    pub fn subscribed_topics(&self) -> HashSet<Topic> {
        self.nodes
            .values()
            .flat_map(|r| r.subscriptions.keys().cloned())
            .collect()
    }

    /// Final admission check plus dispatch to the target node's P2P API.
    pub fn execute_p2p_procedure(
        &self,
        target: &NodeId,
        source_id: &NodeId,
        source_groups: &BTreeSet<Group>,
        call: P2pCall,
    ) -> P2pOutcome {
        let record = match self.nodes.get(target) {
            Some(r) => r,
            None => {
                return P2pOutcome::Result(Err(EbusError::NodeNotFound {
                    node_id: target.clone(),
                }))
            }
        };
        if record.closing {
            return P2pOutcome::Result(Err(EbusError::NotReady {
                node_id: target.clone(),
                reason: "node is closing".to_string(),
            }));
        }
        if !groups_intersect(&record.groups, source_groups) {
            return P2pOutcome::Result(Err(EbusError::GroupPermission {
                message: format!("{source_id} has no shared group with {target}"),
            }));
        }
        let handler = match &record.api {
            Some(h) => h,
            None => {
                return P2pOutcome::Result(Err(EbusError::NotReady {
                    node_id: target.clone(),
                    reason: "node has no registered P2P API".to_string(),
                }))
            }
        };
        let ctx = HandlerContext {
            source_node_id: source_id.clone(),
            source_groups: source_groups.clone(),
            local_node_id: target.clone(),
            topic: None,
        };
        match call {
            P2pCall::Ask(arg) => P2pOutcome::Result(handler(&ctx, arg)),
            P2pCall::Tell(arg) => {
                let _ = handler(&ctx, arg);
                P2pOutcome::NoReply
            }
        }
    }

    /// Same admission check as `execute_p2p_procedure`, scoped to one
    /// topic's subscription. Returns `None` if the node has no matching
    /// subscription, so the caller's session simply ignores it.
    pub fn execute_broadcast_procedure(
        &self,
        target: &NodeId,
        source_id: &NodeId,
        source_groups: &BTreeSet<Group>,
        topic: &Topic,
        arg: DispatchValue,
    ) -> Option<Result<Option<DispatchValue>, EbusError>> {
        let record = self.nodes.get(target)?;
        if record.closing {
            return Some(Err(EbusError::NotReady {
                node_id: target.clone(),
                reason: "node is closing".to_string(),
            }));
        }
        if !groups_intersect(&record.groups, source_groups) {
            return Some(Err(EbusError::GroupPermission {
                message: format!("{source_id} has no shared group with {target}"),
            }));
        }
        let handler = record.subscriptions.get(topic)?;
        let ctx = HandlerContext {
            source_node_id: source_id.clone(),
            source_groups: source_groups.clone(),
            local_node_id: target.clone(),
            topic: Some(topic.clone()),
        };
        Some(handler(&ctx, arg))
    }
}

impl Default for LocalNodeManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_node_rejects_duplicate_id() {
        let mut mgr = LocalNodeManager::new();
        mgr.register_node("n1".to_string(), None, None).unwrap();
        let err = mgr.register_node("n1".to_string(), None, None).unwrap_err();
        assert!(matches!(err, EbusError::Conflict { .. }));
    }

    #[test]
    fn register_node_defaults_to_default_group() {
        let mut mgr = LocalNodeManager::new();
        mgr.register_node("n1".to_string(), None, None).unwrap();
        assert_eq!(
            mgr.get_local_node_groups(&"n1".to_string()).unwrap(),
            &BTreeSet::from(["".to_string()])
        );
    }

    #[test]
    fn execute_p2p_procedure_rejects_disjoint_groups() {
        let mut mgr = LocalNodeManager::new();
        mgr.register_node(
            "n1".to_string(),
            Some(BTreeSet::from(["g1".to_string()])),
            Some(Box::new(|_ctx, v| Ok(v))),
        )
        .unwrap();
        let outcome = mgr.execute_p2p_procedure(
            &"n1".to_string(),
            &"caller".to_string(),
            &BTreeSet::from(["g2".to_string()]),
            P2pCall::Ask(DispatchValue::Scalar(vec![])),
        );
        match outcome {
            P2pOutcome::Result(Err(EbusError::GroupPermission { .. })) => {}
            _ => panic!("expected group permission rejection"),
        }
    }

    #[test]
    fn execute_p2p_procedure_rejects_after_mark_as_closing() {
        let mut mgr = LocalNodeManager::new();
        mgr.register_node(
            "n1".to_string(),
            None,
            Some(Box::new(|_ctx, v| Ok(v))),
        )
        .unwrap();
        mgr.mark_as_closing(&"n1".to_string()).unwrap();
        let outcome = mgr.execute_p2p_procedure(
            &"n1".to_string(),
            &"caller".to_string(),
            &BTreeSet::from(["".to_string()]),
            P2pCall::Ask(DispatchValue::Scalar(vec![])),
        );
        assert!(matches!(
            outcome,
            P2pOutcome::Result(Err(EbusError::NotReady { .. }))
        ));
    }

    #[test]
    fn close_node_removes_record_and_returns_its_topics() {
        let mut mgr = LocalNodeManager::new();
        mgr.register_node("n1".to_string(), None, None).unwrap();
        mgr.add_subscription(&"n1".to_string(), "room".to_string(), Box::new(|_ctx, v| Ok(Some(v))))
            .unwrap();
        let topics = mgr.close_node(&"n1".to_string()).unwrap();
        assert_eq!(topics, vec!["room".to_string()]);
        assert!(!mgr.has_node(&"n1".to_string()));
    }

    #[test]
    fn close_node_rejects_unknown_node() {
        let mut mgr = LocalNodeManager::new();
        let err = mgr.close_node(&"missing".to_string()).unwrap_err();
        assert!(matches!(err, EbusError::NodeNotFound { .. }));
    }

    #[test]
    fn execute_broadcast_procedure_returns_none_without_matching_subscription() {
        let mut mgr = LocalNodeManager::new();
        mgr.register_node("n1".to_string(), None, None).unwrap();
        let outcome = mgr.execute_broadcast_procedure(
            &"n1".to_string(),
            &"caller".to_string(),
            &BTreeSet::from(["".to_string()]),
            &"room".to_string(),
            DispatchValue::Scalar(vec![]),
        );
        assert!(outcome.is_none());
    }
}
