/// BridgeManager — owns the egress half of one connection per adjacent
/// bus (the parent, and each child) and applies group admission policy to
/// broadcast traffic at egress.
///
/// The manager never touches a `PeerStack` directly: each bridge's actual
/// connection is driven by a dedicated pump task (spawned by
/// `BusHandle::bridge`/`connect_parent`) that owns the `PeerStack`
/// exclusively and relays inbound messages into the bus actor while
/// draining this manager's egress channel outbound. That split lets a
/// bridge's send and receive halves run concurrently without contending
/// over `PeerStack::recv`'s `&mut self` requirement.
use std::collections::{BTreeSet, HashMap};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::{DataMessage, WireMessage};
use crate::types::{groups_intersect, BusId, Group};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgePolicy {
    pub allow_list: Option<BTreeSet<Group>>,
    pub deny_list: Option<BTreeSet<Group>>,
}

impl BridgePolicy {
    /// True iff a message carrying `source_groups` is admitted by this
    /// policy. Deny takes precedence; if an allow-list is configured, at
    /// least one source group must appear in it.
    pub fn admits(&self, source_groups: &BTreeSet<Group>) -> bool {
        if let Some(deny) = &self.deny_list {
            if groups_intersect(source_groups, deny) {
                return false;
            }
        }
        if let Some(allow) = &self.allow_list {
            if !groups_intersect(source_groups, allow) {
                return false;
            }
        }
        true
    }
}

struct ChildBridge {
    egress: mpsc::Sender<WireMessage>,
    policy: BridgePolicy,
}

/// Owns every adjacent connection's egress channel this bus instance has:
/// at most one parent, and any number of children keyed by their assigned
/// `BusId`.
pub struct BridgeManager {
    next_bus_id: BusId,
    parent: Option<mpsc::Sender<WireMessage>>,
    children: HashMap<BusId, ChildBridge>,
}

impl BridgeManager {
    pub fn new() -> Self {
        Self {
            next_bus_id: 0,
            parent: None,
            children: HashMap::new(),
        }
    }

    /// Register a new child bridge's egress channel, assigning it the
    /// next `BusId`. Resolves as soon as the handle is registered — it
    /// does not wait for any application-level handshake.
    pub fn bridge(
        &mut self,
        egress: mpsc::Sender<WireMessage>,
        allow_list: Option<BTreeSet<Group>>,
        deny_list: Option<BTreeSet<Group>>,
    ) -> BusId {
        let bus_id = self.next_bus_id;
        self.next_bus_id += 1;
        self.children.insert(
            bus_id,
            ChildBridge {
                egress,
                policy: BridgePolicy {
                    allow_list,
                    deny_list,
                },
            },
        );
        debug!(bus_id, "child bridge registered");
        bus_id
    }

    pub fn set_parent(&mut self, egress: mpsc::Sender<WireMessage>) {
        self.parent = Some(egress);
    }

    pub fn clear_parent(&mut self) {
        self.parent = None;
    }

    pub fn has_parent(&self) -> bool {
        self.parent.is_some()
    }

    /// Clone of the parent egress channel, for callers that need to hand
    /// off a sender to a task outside the bus actor (e.g. a relay fan-in
    /// drain) rather than going through `send_to_parent`.
    pub fn parent_egress_sender(&self) -> Option<mpsc::Sender<WireMessage>> {
        self.parent.clone()
    }

    /// Clone of a specific child's egress channel, see `parent_egress_sender`.
    pub fn child_egress_sender(&self, bus_id: BusId) -> Option<mpsc::Sender<WireMessage>> {
        self.children.get(&bus_id).map(|c| c.egress.clone())
    }

    pub fn child_ids(&self) -> Vec<BusId> {
        self.children.keys().copied().collect()
    }

    pub fn get_bridge_policy(&self, bus_id: BusId) -> Option<&BridgePolicy> {
        self.children.get(&bus_id).map(|c| &c.policy)
    }

    /// Pre-filter a candidate list of children using each bridge's
    /// policy, avoiding needless cloning downstream in the dispatch path.
    pub fn filter_downstream_children(
        &self,
        bus_ids: &[BusId],
        source_groups: &BTreeSet<Group>,
    ) -> Vec<BusId> {
        bus_ids
            .iter()
            .copied()
            .filter(|id| {
                self.children
                    .get(id)
                    .map(|c| c.policy.admits(source_groups))
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Egress to the parent. Broadcasts are not policy-checked against
    /// the parent: the parent is trusted by this bus. Fails if there is
    /// no parent bridge.
    pub async fn send_to_parent(&self, message: WireMessage) -> Result<(), String> {
        match &self.parent {
            Some(egress) => egress
                .send(message)
                .await
                .map_err(|_| "parent bridge channel closed".to_string()),
            None => Err("no parent bridge registered".to_string()),
        }
    }

    /// Egress to a specific child. Broadcast messages are checked
    /// against that child's policy and silently dropped on rejection;
    /// control-plane and P2P messages are forwarded unconditionally.
    pub async fn send_to_child(&self, bus_id: BusId, message: WireMessage) -> Result<(), String> {
        let child = self
            .children
            .get(&bus_id)
            .ok_or_else(|| format!("no child bridge {bus_id}"))?;

        if let WireMessage::Data(DataMessage::Broadcast { source_groups, .. }) = &message {
            if !child.policy.admits(source_groups) {
                warn!(bus_id, "broadcast egress rejected by bridge policy");
                return Ok(());
            }
        }
        child
            .egress
            .send(message)
            .await
            .map_err(|_| format!("child bridge {bus_id} channel closed"))
    }

    /// Drop a child bridge, e.g. after its underlying stack closes.
    pub fn remove_child(&mut self, bus_id: BusId) -> bool {
        self.children.remove(&bus_id).is_some()
    }
}

impl Default for BridgeManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BroadcastPayload, ControlMessage};

    fn broadcast(groups: BTreeSet<Group>) -> WireMessage {
        WireMessage::Data(DataMessage::Broadcast {
            source_id: "n1".to_string(),
            source_groups: groups,
            topic: "room".to_string(),
            payload: BroadcastPayload::Tell {
                path: "hello".to_string(),
                args: vec![],
            },
        })
    }

    #[test]
    fn bridge_policy_deny_takes_precedence_over_allow() {
        let policy = BridgePolicy {
            allow_list: Some(BTreeSet::from(["g1".to_string()])),
            deny_list: Some(BTreeSet::from(["g1".to_string()])),
        };
        assert!(!policy.admits(&BTreeSet::from(["g1".to_string()])));
    }

    #[test]
    fn bridge_policy_admits_when_no_lists_configured() {
        let policy = BridgePolicy::default();
        assert!(policy.admits(&BTreeSet::from(["anything".to_string()])));
    }

    #[test]
    fn bridge_policy_rejects_disjoint_from_allow_list() {
        let policy = BridgePolicy {
            allow_list: Some(BTreeSet::from(["g1".to_string()])),
            deny_list: None,
        };
        assert!(!policy.admits(&BTreeSet::from(["g2".to_string()])));
    }

    #[test]
    fn bridge_assigns_sequential_bus_ids() {
        let mut mgr = BridgeManager::new();
        let (tx_a, _rx_a) = mpsc::channel(4);
        let (tx_c, _rx_c) = mpsc::channel(4);
        let id1 = mgr.bridge(tx_a, None, None);
        let id2 = mgr.bridge(tx_c, None, None);
        assert_eq!(id1, 0);
        assert_eq!(id2, 1);
    }

    #[tokio::test]
    async fn send_to_child_silently_drops_broadcast_denied_by_policy() {
        let mut mgr = BridgeManager::new();
        let (tx, mut rx) = mpsc::channel(4);
        let deny = BTreeSet::from(["blocked".to_string()]);
        let bus_id = mgr.bridge(tx, None, Some(deny));

        let msg = broadcast(BTreeSet::from(["blocked".to_string()]));
        mgr.send_to_child(bus_id, msg).await.unwrap();

        // Nothing should have arrived on the other end.
        tokio::time::timeout(std::time::Duration::from_millis(20), rx.recv())
            .await
            .expect_err("no message should have been delivered");
    }

    #[tokio::test]
    async fn send_to_child_forwards_control_messages_unconditionally() {
        let mut mgr = BridgeManager::new();
        let (tx, mut rx) = mpsc::channel(4);
        let deny = BTreeSet::from(["blocked".to_string()]);
        let bus_id = mgr.bridge(tx, None, Some(deny));

        let msg = WireMessage::Control(ControlMessage::announce(
            "n1".to_string(),
            BTreeSet::from(["blocked".to_string()]),
        ));
        mgr.send_to_child(bus_id, msg.clone()).await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received, msg);
    }

    #[test]
    fn filter_downstream_children_excludes_policy_rejected_ids() {
        let mut mgr = BridgeManager::new();
        let (tx_a, _rx_a) = mpsc::channel(4);
        let (tx_c, _rx_c) = mpsc::channel(4);
        let allow_only_g1 = BTreeSet::from(["g1".to_string()]);
        let id1 = mgr.bridge(tx_a, Some(allow_only_g1), None);
        let id2 = mgr.bridge(tx_c, None, None);

        let filtered =
            mgr.filter_downstream_children(&[id1, id2], &BTreeSet::from(["g2".to_string()]));
        assert_eq!(filtered, vec![id2]);
    }
}
