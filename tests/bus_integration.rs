/// Integration tests driving two `Bus` instances wired as parent/child
/// over in-memory `PeerStack` pairs, covering the routing and pub/sub
/// scenarios the bus engine is specified against: cross-hop P2P `ask`,
/// conflicting route rejection, deny-list admission, broadcast fan-in,
/// and routing cleanup on disconnect.
use std::collections::BTreeSet;
use std::time::Duration;

use ebus::{
    Bus, BusConfig, BusHandle, CorrelationId, DispatchValue, EbusError, InMemoryPeerStack, RouteVia,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
}

#[tokio::test]
async fn direct_ask_resolves_not_found_for_unknown_target() {
    init_tracing();
    let bus = Bus::spawn(BusConfig::default());
    bus.register_node("caller".to_string(), None, None)
        .await
        .unwrap();

    let err = bus
        .ask(
            "caller".to_string(),
            "ghost".to_string(),
            "greet".to_string(),
            vec![1, 2, 3],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EbusError::NodeNotFound { .. }));
}

#[tokio::test]
async fn local_ask_round_trips_through_registered_handler() {
    init_tracing();
    let bus = Bus::spawn(BusConfig::default());
    bus.register_node("caller".to_string(), None, None)
        .await
        .unwrap();
    bus.register_node(
        "echo".to_string(),
        None,
        Some(Box::new(|_ctx, value| Ok(value))),
    )
    .await
    .unwrap();

    let result = bus
        .ask(
            "caller".to_string(),
            "echo".to_string(),
            "greet".to_string(),
            vec![9, 9, 9],
        )
        .await
        .unwrap();
    match result {
        DispatchValue::Scalar(bytes) => assert_eq!(bytes, vec![9, 9, 9]),
        _ => panic!("expected scalar echo"),
    }
}

#[tokio::test]
async fn register_node_rejects_conflicting_id() {
    init_tracing();
    let bus = Bus::spawn(BusConfig::default());
    bus.register_node("dup".to_string(), None, None)
        .await
        .unwrap();
    let err = bus
        .register_node("dup".to_string(), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EbusError::Conflict { .. }));
}

/// Wire two live buses together over an in-memory duplex pair and give
/// the handshake and any in-flight control messages time to settle.
async fn wire_parent_child(parent: &BusHandle, child: &BusHandle) {
    let (parent_side, child_side) = InMemoryPeerStack::pair(32);
    parent.bridge(Box::new(parent_side), None, None).await.unwrap();
    child.connect_parent(Box::new(child_side)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn bridging_two_buses_allows_control_plane_exchange() {
    init_tracing();
    let parent = Bus::spawn(BusConfig::default());
    let child = Bus::spawn(BusConfig::default());
    wire_parent_child(&parent, &child).await;

    child
        .register_node(
            "child-node".to_string(),
            None,
            Some(Box::new(|_ctx, value| Ok(value))),
        )
        .await
        .unwrap();
    // Let the node-announcement's atomic ack round trip up to the parent.
    tokio::time::sleep(Duration::from_millis(100)).await;

    parent.register_node("caller".to_string(), None, None).await.unwrap();
    let result = parent
        .ask(
            "caller".to_string(),
            "child-node".to_string(),
            "greet".to_string(),
            vec![4, 5, 6],
        )
        .await
        .unwrap();
    match result {
        DispatchValue::Scalar(bytes) => assert_eq!(bytes, vec![4, 5, 6]),
        _ => panic!("expected scalar echo relayed across the bridge"),
    }
}

#[tokio::test]
async fn bridge_deny_list_blocks_node_announcement_admission() {
    init_tracing();
    let parent = Bus::spawn(BusConfig::default());
    let child = Bus::spawn(BusConfig::default());

    let (parent_side, child_side) = InMemoryPeerStack::pair(32);
    parent
        .bridge(
            Box::new(parent_side),
            None,
            Some(BTreeSet::from(["blocked".to_string()])),
        )
        .await
        .unwrap();
    child.connect_parent(Box::new(child_side)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    child
        .register_node(
            "blocked-node".to_string(),
            Some(BTreeSet::from(["blocked".to_string()])),
            Some(Box::new(|_ctx, value| Ok(value))),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    parent.register_node("caller".to_string(), None, None).await.unwrap();
    let err = parent
        .ask(
            "caller".to_string(),
            "blocked-node".to_string(),
            "greet".to_string(),
            vec![],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EbusError::NodeNotFound { .. }));
}

#[tokio::test]
async fn broadcast_ask_fans_in_across_a_bridge_from_a_child_subscriber() {
    init_tracing();
    use tokio_stream::StreamExt;

    let parent = Bus::spawn(BusConfig::default());
    let child = Bus::spawn(BusConfig::default());
    wire_parent_child(&parent, &child).await;

    child.register_node("listener".to_string(), None, None).await.unwrap();
    child
        .subscribe(
            "listener".to_string(),
            "room".to_string(),
            Box::new(|_ctx, value| Ok(Some(value))),
        )
        .await
        .unwrap();
    // Let the sub-update's upward propagation settle before publishing.
    tokio::time::sleep(Duration::from_millis(100)).await;

    parent.register_node("publisher".to_string(), None, None).await.unwrap();
    let mut stream = parent
        .publish_all(
            "publisher".to_string(),
            "room".to_string(),
            "notify".to_string(),
            vec![3, 1, 4],
            None,
        )
        .await
        .unwrap();

    let first = tokio::time::timeout(Duration::from_millis(500), stream.next())
        .await
        .expect("session should not hang")
        .expect("expected one aggregated result relayed back across the bridge");
    match first {
        ebus::AggregatedResult::Success { node_id, value } => {
            assert_eq!(node_id, "listener");
            assert_eq!(value, vec![3, 1, 4]);
        }
        ebus::AggregatedResult::Failure { .. } => panic!("expected success"),
    }
}

#[tokio::test]
async fn child_disconnect_purges_its_routes_from_the_parent() {
    init_tracing();
    let parent = Bus::spawn(BusConfig::default());
    let child = Bus::spawn(BusConfig::default());
    wire_parent_child(&parent, &child).await;

    child
        .register_node(
            "ephemeral".to_string(),
            None,
            Some(Box::new(|_ctx, value| Ok(value))),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    parent.register_node("caller".to_string(), None, None).await.unwrap();
    parent
        .ask(
            "caller".to_string(),
            "ephemeral".to_string(),
            "greet".to_string(),
            vec![1],
        )
        .await
        .expect("route should be live before the child disconnects");

    // Dropping the child bus drops its bridge manager, which closes the
    // egress half its pump task is reading from, which in turn drops its
    // end of the in-memory stack and surfaces as a close on the parent's
    // side of the pair.
    child.shutdown().await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let err = parent
        .ask(
            "caller".to_string(),
            "ephemeral".to_string(),
            "greet".to_string(),
            vec![1],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EbusError::NodeNotFound { .. }));
}

#[tokio::test]
async fn stream_multicast_errors_every_consumer_when_one_cancels() {
    init_tracing();
    use ebus::{DispatchEngine, StreamHandle};

    let engine = DispatchEngine::new();
    let source = StreamHandle::from_values(vec![vec![1u8], vec![2u8], vec![3u8]]);
    let copies = engine.dispatch(DispatchValue::Stream(source), 2);
    let mut copies = copies.into_iter().map(|v| match v {
        DispatchValue::Stream(h) => h,
        _ => panic!("expected stream handles back from a stream dispatch"),
    });
    let mut first = copies.next().unwrap();
    let mut second = copies.next().unwrap();

    // Cancel the first consumer by dropping it after its first chunk.
    assert_eq!(first.next_chunk().await, Some(Ok(vec![1])));
    drop(first);

    // The surviving consumer gets its already-buffered chunk, then an
    // error instead of a silent close once the source aborts.
    assert_eq!(second.next_chunk().await, Some(Ok(vec![1])));
    let outcome = second.next_chunk().await;
    assert!(matches!(outcome, Some(Err(_))), "expected sibling to be errored, got {outcome:?}");
}

#[tokio::test]
async fn publish_all_with_no_subscribers_completes_immediately() {
    init_tracing();
    let bus = Bus::spawn(BusConfig::default());
    bus.register_node("publisher".to_string(), None, None)
        .await
        .unwrap();

    use tokio_stream::StreamExt;
    let mut stream = bus
        .publish_all(
            "publisher".to_string(),
            "room".to_string(),
            "notify".to_string(),
            vec![1],
            None,
        )
        .await
        .unwrap();
    let timeout = tokio::time::timeout(Duration::from_millis(200), stream.next()).await;
    assert_eq!(timeout, Ok(None));
}

#[tokio::test]
async fn publish_all_aggregates_local_subscriber_result() {
    init_tracing();
    use tokio_stream::StreamExt;

    let bus = Bus::spawn(BusConfig::default());
    bus.register_node("publisher".to_string(), None, None)
        .await
        .unwrap();
    bus.register_node("listener".to_string(), None, None)
        .await
        .unwrap();
    bus.subscribe(
        "listener".to_string(),
        "room".to_string(),
        Box::new(|_ctx, value| Ok(Some(value))),
    )
    .await
    .unwrap();

    let mut stream = bus
        .publish_all(
            "publisher".to_string(),
            "room".to_string(),
            "notify".to_string(),
            vec![7],
            None,
        )
        .await
        .unwrap();

    let first = tokio::time::timeout(Duration::from_millis(200), stream.next())
        .await
        .expect("session should not hang")
        .expect("expected one aggregated result");
    match first {
        ebus::AggregatedResult::Success { node_id, value } => {
            assert_eq!(node_id, "listener");
            assert_eq!(value, vec![7]);
        }
        ebus::AggregatedResult::Failure { .. } => panic!("expected success"),
    }
}

#[tokio::test]
async fn publish_tell_does_not_require_a_result_sink() {
    init_tracing();
    let bus = Bus::spawn(BusConfig::default());
    bus.register_node("publisher".to_string(), None, None)
        .await
        .unwrap();
    bus.register_node("listener".to_string(), None, None)
        .await
        .unwrap();
    bus.subscribe(
        "listener".to_string(),
        "room".to_string(),
        Box::new(|_ctx, _value| Ok(None)),
    )
    .await
    .unwrap();

    bus.publish_tell(
        "publisher".to_string(),
        "room".to_string(),
        "notify".to_string(),
        vec![1],
        None,
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn unsubscribe_removes_node_from_future_broadcasts() {
    init_tracing();
    use tokio_stream::StreamExt;

    let bus = Bus::spawn(BusConfig::default());
    bus.register_node("publisher".to_string(), None, None)
        .await
        .unwrap();
    bus.register_node("listener".to_string(), None, None)
        .await
        .unwrap();
    bus.subscribe(
        "listener".to_string(),
        "room".to_string(),
        Box::new(|_ctx, value| Ok(Some(value))),
    )
    .await
    .unwrap();
    assert!(bus.unsubscribe("listener".to_string(), "room".to_string()).await.unwrap());

    let mut stream = bus
        .publish_all(
            "publisher".to_string(),
            "room".to_string(),
            "notify".to_string(),
            vec![1],
            None,
        )
        .await
        .unwrap();
    let timeout = tokio::time::timeout(Duration::from_millis(200), stream.next()).await;
    assert_eq!(timeout, Ok(None));
}

#[tokio::test]
async fn group_disjoint_source_and_target_rejects_p2p_ask() {
    init_tracing();
    let bus = Bus::spawn(BusConfig::default());
    bus.register_node(
        "caller".to_string(),
        Some(BTreeSet::from(["team-a".to_string()])),
        None,
    )
    .await
    .unwrap();
    bus.register_node(
        "target".to_string(),
        Some(BTreeSet::from(["team-b".to_string()])),
        Some(Box::new(|_ctx, value| Ok(value))),
    )
    .await
    .unwrap();

    let err = bus
        .ask(
            "caller".to_string(),
            "target".to_string(),
            "greet".to_string(),
            vec![],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EbusError::GroupPermission { .. }));
}

#[test]
fn correlation_ids_are_unique_per_control_exchange() {
    let a = CorrelationId::new();
    let b = CorrelationId::new();
    assert_ne!(a, b);
}

#[test]
fn route_via_equality_distinguishes_hops() {
    assert_ne!(RouteVia::Local, RouteVia::Parent);
    assert_ne!(RouteVia::Child(1), RouteVia::Child(2));
    assert_eq!(RouteVia::Child(1), RouteVia::Child(1));
}
