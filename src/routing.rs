/// RoutingTable — pure decision engine for the distributed routing
/// information base (RIB).
///
/// No I/O: every method returns a `Vec<RoutingAction>` describing what the
/// caller (the bus actor loop) must do next — forward a control message
/// upstream/downstream, or surface an admission rejection. State changes
/// are applied tentatively and rolled back if a downstream propagation
/// step is rejected, so the RIB never commits a change that didn't reach
/// every affected hop.
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::types::{groups_intersect, normalize_groups, BusId, CorrelationId, Group, NodeId, Topic};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingAction {
    /// Forward a node-announcement to a specific downstream hop.
    PropagateAnnouncement {
        to: BusId,
        node_id: NodeId,
        groups: BTreeSet<Group>,
        correlation_id: CorrelationId,
    },
    /// Forward a sub-update to a specific downstream hop.
    PropagateSubUpdate {
        to: BusId,
        node_id: NodeId,
        topic: Topic,
        subscribed: bool,
        correlation_id: CorrelationId,
    },
    /// Forward a node-unavailability withdrawal to a specific downstream hop.
    PropagateUnavailable {
        to: BusId,
        node_id: NodeId,
        correlation_id: CorrelationId,
    },
    /// Ack a previously received control message back to its source hop.
    Ack { to: BusId, correlation_id: CorrelationId },
    /// Reject a previously received control message, rolling back any
    /// tentative state the caller already applied.
    Reject {
        to: BusId,
        correlation_id: CorrelationId,
        reason: String,
    },
    /// No further action required.
    None,
}

/// Enough information to undo a tentative RIB mutation if the subsequent
/// upstream propagation is nacked or the parent hop is unreachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingRollback {
    NodeAnnounce {
        node_id: NodeId,
    },
    Subscription {
        from_hop: RouteVia,
        node_id: NodeId,
        topic: Topic,
        subscribed: bool,
    },
}

/// One entry in the node routing table: which hop(s) can reach `node_id`
/// and what groups it publicly carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRoute {
    pub node_id: NodeId,
    pub groups: BTreeSet<Group>,
    pub via: RouteVia,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteVia {
    Local,
    Parent,
    Child(BusId),
}

pub struct RoutingTable {
    /// Every node reachable from this bus instance, local or remote.
    node_routes: HashMap<NodeId, NodeRoute>,
    /// For each topic, which downstream children (and whether the parent)
    /// have at least one subscriber somewhere past that hop.
    remote_topic_hops: HashMap<Topic, HashSet<BusId>>,
    parent_topic_hops: HashSet<Topic>,
    /// Locally-registered nodes' own subscriptions, by topic.
    local_node_subscriptions: HashMap<Topic, HashSet<NodeId>>,
    /// Which child bus owns a given node_id, for purge-on-disconnect.
    child_bus_node_map: HashMap<BusId, HashSet<NodeId>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self {
            node_routes: HashMap::new(),
            remote_topic_hops: HashMap::new(),
            parent_topic_hops: HashSet::new(),
            local_node_subscriptions: HashMap::new(),
            child_bus_node_map: HashMap::new(),
        }
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn get_node_route(&self, node_id: &NodeId) -> Option<&NodeRoute> {
        self.node_routes.get(node_id)
    }

    pub fn get_node_groups(&self, node_id: &NodeId) -> Option<&BTreeSet<Group>> {
        self.node_routes.get(node_id).map(|r| &r.groups)
    }

    pub fn has_route(&self, node_id: &NodeId) -> bool {
        self.node_routes.contains_key(node_id)
    }

    /// Downstream children (by `BusId`) to forward a broadcast for `topic`
    /// to, excluding `from`.
    pub fn get_broadcast_downstream(&self, topic: &Topic, from: RouteVia) -> Vec<BusId> {
        self.remote_topic_hops
            .get(topic)
            .into_iter()
            .flatten()
            .copied()
            .filter(|bus_id| from != RouteVia::Child(*bus_id))
            .collect()
    }

    pub fn should_forward_to_parent(&self, topic: &Topic, from: RouteVia) -> bool {
        from != RouteVia::Parent && self.parent_topic_hops.contains(topic)
    }

    pub fn get_local_subscribers(&self, topic: &Topic) -> Vec<NodeId> {
        self.local_node_subscriptions
            .get(topic)
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }

    // ── Node announcement ─────────────────────────────────────────────

    /// Handle a node-announcement arriving from `from_hop`. Admission is
    /// checked against `local_allow`/`local_deny` (deny takes precedence);
    /// on success the route is applied tentatively and propagated to every
    /// other hop in `downstream_hops` (and to the parent, unless the
    /// announcement itself came from the parent).
    pub fn announce_node(
        &mut self,
        from_hop: RouteVia,
        correlation_id: CorrelationId,
        node_id: NodeId,
        groups: Option<BTreeSet<Group>>,
        downstream_children: &[BusId],
        has_parent: bool,
        allow: Option<&BTreeSet<Group>>,
        deny: Option<&BTreeSet<Group>>,
    ) -> Vec<RoutingAction> {
        let groups = normalize_groups(groups);

        if let Some(deny) = deny {
            if groups_intersect(&groups, deny) {
                return vec![reject(from_hop, correlation_id, "denied by deny-list".into())];
            }
        }
        if let Some(allow) = allow {
            if !groups_intersect(&groups, allow) {
                return vec![reject(
                    from_hop,
                    correlation_id,
                    "not in allow-list".into(),
                )];
            }
        }

        if let Some(existing) = self.node_routes.get(&node_id) {
            if existing.via != via_from(from_hop) {
                return vec![reject(
                    from_hop,
                    correlation_id,
                    "conflicting route: node already reachable via a different hop".into(),
                )];
            }
        }

        self.node_routes.insert(
            node_id.clone(),
            NodeRoute {
                node_id: node_id.clone(),
                groups: groups.clone(),
                via: via_from(from_hop),
            },
        );
        if let RouteVia::Child(bus_id) = via_from(from_hop) {
            self.child_bus_node_map
                .entry(bus_id)
                .or_default()
                .insert(node_id.clone());
        }

        let mut actions = vec![ack(from_hop, correlation_id)];
        for &child in downstream_children {
            if RouteVia::Child(child) == from_hop {
                continue;
            }
            actions.push(RoutingAction::PropagateAnnouncement {
                to: child,
                node_id: node_id.clone(),
                groups: groups.clone(),
                correlation_id,
            });
        }
        if has_parent && from_hop != RouteVia::Parent {
            actions.push(RoutingAction::PropagateAnnouncement {
                to: PARENT_BUS_ID,
                node_id,
                groups,
                correlation_id,
            });
        }
        actions
    }

    /// Undo a tentative `announce_node` application after the upstream hop
    /// nacked it or became unreachable.
    pub fn rollback_node_announce(&mut self, node_id: &NodeId) {
        if let Some(route) = self.node_routes.remove(node_id) {
            if let RouteVia::Child(bus_id) = route.via {
                if let Some(owned) = self.child_bus_node_map.get_mut(&bus_id) {
                    owned.remove(node_id);
                }
            }
        }
    }

    /// Withdraw a node's route (local deregistration, or an explicit
    /// `close()`), propagating unavailability to every hop that isn't the
    /// one the withdrawal came from.
    pub fn retract_node(
        &mut self,
        from_hop: RouteVia,
        node_id: NodeId,
        downstream_children: &[BusId],
        has_parent: bool,
    ) -> Vec<RoutingAction> {
        self.rollback_node_announce(&node_id);

        let correlation_id = CorrelationId::new();
        let mut actions = Vec::new();
        for &child in downstream_children {
            if RouteVia::Child(child) == from_hop {
                continue;
            }
            actions.push(RoutingAction::PropagateUnavailable {
                to: child,
                node_id: node_id.clone(),
                correlation_id,
            });
        }
        if has_parent && from_hop != RouteVia::Parent {
            actions.push(RoutingAction::PropagateUnavailable {
                to: PARENT_BUS_ID,
                node_id,
                correlation_id,
            });
        }
        actions
    }

    // ── Subscription update ───────────────────────────────────────────

    fn has_interest(&self, topic: &Topic) -> bool {
        self.local_node_subscriptions
            .get(topic)
            .is_some_and(|set| !set.is_empty())
            || self
                .remote_topic_hops
                .get(topic)
                .is_some_and(|set| !set.is_empty())
    }

    fn apply_subscription_mutation(
        &mut self,
        from_hop: RouteVia,
        node_id: &NodeId,
        topic: &Topic,
        subscribed: bool,
    ) {
        match from_hop {
            RouteVia::Local => {
                let set = self.local_node_subscriptions.entry(topic.clone()).or_default();
                if subscribed {
                    set.insert(node_id.clone());
                } else {
                    set.remove(node_id);
                }
            }
            RouteVia::Child(bus_id) => {
                let set = self.remote_topic_hops.entry(topic.clone()).or_default();
                if subscribed {
                    set.insert(bus_id);
                } else {
                    set.remove(&bus_id);
                }
            }
            RouteVia::Parent => {
                if subscribed {
                    self.parent_topic_hops.insert(topic.clone());
                } else {
                    self.parent_topic_hops.remove(topic);
                }
            }
        }
    }

    /// Apply a subscription change from `from_hop`. Upstream propagation
    /// only fires when the bus's *overall* interest in the topic
    /// (`has_local ∨ has_remote`) actually flips — a redundant subscribe or
    /// one covered by another downstream hop never reaches the parent.
    /// Interest flows upward only: there is no sideways fan-out to other
    /// downstream children, since each child reports its own interest to
    /// this bus directly.
    pub fn update_subscription(
        &mut self,
        from_hop: RouteVia,
        correlation_id: CorrelationId,
        node_id: NodeId,
        topic: Topic,
        subscribed: bool,
        has_parent: bool,
    ) -> Vec<RoutingAction> {
        let was_interested = self.has_interest(&topic);
        self.apply_subscription_mutation(from_hop, &node_id, &topic, subscribed);
        let is_interested = self.has_interest(&topic);

        let mut actions = vec![ack(from_hop, correlation_id)];
        if has_parent && from_hop != RouteVia::Parent && was_interested != is_interested {
            actions.push(RoutingAction::PropagateSubUpdate {
                to: PARENT_BUS_ID,
                node_id,
                topic,
                subscribed: is_interested,
                correlation_id,
            });
        }
        actions
    }

    /// Undo a tentative `update_subscription` application by reapplying the
    /// inverse mutation.
    pub fn rollback_subscription(
        &mut self,
        from_hop: RouteVia,
        node_id: &NodeId,
        topic: &Topic,
        subscribed: bool,
    ) {
        self.apply_subscription_mutation(from_hop, node_id, topic, !subscribed);
    }

    // ── Disconnect cleanup ─────────────────────────────────────────────

    /// Purge every route and subscription hop owned by a child bus that
    /// just disconnected. Returns the set of node ids that became
    /// unreachable, so the caller can notify interested parties.
    pub fn purge_child(&mut self, bus_id: BusId) -> Vec<NodeId> {
        let removed: Vec<NodeId> = self
            .child_bus_node_map
            .remove(&bus_id)
            .into_iter()
            .flatten()
            .collect();
        for node_id in &removed {
            self.node_routes.remove(node_id);
        }
        for hops in self.remote_topic_hops.values_mut() {
            hops.remove(&bus_id);
        }
        removed
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Sentinel `BusId` used in `RoutingAction`s destined for the parent hop
/// rather than a specific downstream child.
pub const PARENT_BUS_ID: BusId = u64::MAX;

fn via_from(hop: RouteVia) -> RouteVia {
    hop
}

fn ack(from_hop: RouteVia, correlation_id: CorrelationId) -> RoutingAction {
    match from_hop {
        RouteVia::Child(bus_id) => RoutingAction::Ack {
            to: bus_id,
            correlation_id,
        },
        RouteVia::Parent => RoutingAction::Ack {
            to: PARENT_BUS_ID,
            correlation_id,
        },
        RouteVia::Local => RoutingAction::None,
    }
}

fn reject(from_hop: RouteVia, correlation_id: CorrelationId, reason: String) -> RoutingAction {
    match from_hop {
        RouteVia::Child(bus_id) => RoutingAction::Reject {
            to: bus_id,
            correlation_id,
            reason,
        },
        RouteVia::Parent => RoutingAction::Reject {
            to: PARENT_BUS_ID,
            correlation_id,
            reason,
        },
        RouteVia::Local => RoutingAction::None,
    }
}
