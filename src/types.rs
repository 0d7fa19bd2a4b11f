use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque node identifier, unique across the entire connected tree.
pub type NodeId = String;

/// Opaque topic identifier for publish/subscribe.
pub type Topic = String;

/// Locally unique integer identifying one child-bridge connection.
pub type BusId = u64;

/// A group tag gating admission. `""` is the default group every node
/// carries unless it specifies otherwise.
pub type Group = String;

/// Process-lifetime identifier for a bus instance, unique within a process
/// and stable for the life of the `Bus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BusPublicId(pub Uuid);

impl BusPublicId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BusPublicId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BusPublicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A call identifier for a locally-initiated `ask`: `"<sourceNodeId>:<uuid>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub String);

impl CallId {
    pub fn new(source_node_id: &str) -> Self {
        Self(format!("{source_node_id}:{}", Uuid::new_v4()))
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A correlation identifier for one control-plane request/ack pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

/// Which hop a message arrived from, or should be routed to.
///
/// `Child` carries the `BusId` of the specific downstream bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageSource {
    Local,
    Parent,
    Child(BusId),
}

impl MessageSource {
    pub fn is_local(&self) -> bool {
        matches!(self, MessageSource::Local)
    }

    pub fn is_parent(&self) -> bool {
        matches!(self, MessageSource::Parent)
    }

    pub fn child_bus_id(&self) -> Option<BusId> {
        match self {
            MessageSource::Child(id) => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Display for MessageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageSource::Local => write!(f, "local"),
            MessageSource::Parent => write!(f, "parent"),
            MessageSource::Child(id) => write!(f, "child:{id}"),
        }
    }
}

/// Current time in epoch milliseconds.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The default group every node belongs to unless it opts into others.
pub const DEFAULT_GROUP: &str = "";

/// Build a group set defaulting to `{DEFAULT_GROUP}` when empty.
pub fn normalize_groups(groups: Option<BTreeSet<Group>>) -> BTreeSet<Group> {
    match groups {
        Some(g) if !g.is_empty() => g,
        _ => BTreeSet::from([DEFAULT_GROUP.to_string()]),
    }
}

/// True iff two group sets share at least one member.
pub fn groups_intersect(a: &BTreeSet<Group>, b: &BTreeSet<Group>) -> bool {
    a.intersection(b).next().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_id_carries_source_prefix() {
        let id = CallId::new("alice");
        assert!(id.0.starts_with("alice:"));
    }

    #[test]
    fn normalize_groups_defaults_to_empty_string() {
        let groups = normalize_groups(None);
        assert_eq!(groups, BTreeSet::from([DEFAULT_GROUP.to_string()]));
    }

    #[test]
    fn normalize_groups_keeps_explicit_set() {
        let groups = normalize_groups(Some(BTreeSet::from(["g1".to_string()])));
        assert_eq!(groups, BTreeSet::from(["g1".to_string()]));
    }

    #[test]
    fn groups_intersect_detects_overlap() {
        let a = BTreeSet::from(["g1".to_string(), "g2".to_string()]);
        let b = BTreeSet::from(["g2".to_string()]);
        assert!(groups_intersect(&a, &b));
        let c = BTreeSet::from(["g3".to_string()]);
        assert!(!groups_intersect(&a, &c));
    }

    #[test]
    fn message_source_helpers() {
        assert!(MessageSource::Local.is_local());
        assert!(MessageSource::Parent.is_parent());
        assert_eq!(MessageSource::Child(7).child_bus_id(), Some(7));
        assert_eq!(MessageSource::Local.child_bus_id(), None);
    }
}
