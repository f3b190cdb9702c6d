//! Cross-node portal pairs over an in-memory transport.

use std::sync::atomic::Ordering;

use weft_node::{ApiError, MemoryTransport, Node, connect_nodes, connect_nodes_with_transports};

mod common;

#[test]
fn remote_ping() {
    let node_a = Node::new();
    let node_b = Node::new();
    let (transport_a, transport_b) = MemoryTransport::pair();
    let a_to_b = common::count_messages(&transport_a);

    let (mut portals_a, mut portals_b) =
        connect_nodes_with_transports(&node_a, &node_b, transport_a, transport_b, 1).unwrap();
    let p1 = portals_a.remove(0);
    let p2 = portals_b.remove(0);

    p1.put(b"hi", Vec::new(), None).unwrap();
    let (data, attachments) = p2.get().unwrap();
    assert_eq!(data, b"hi");
    assert!(attachments.is_empty());

    p1.close();
    let status = p2.query_status();
    assert!(status.peer_closed);
    assert!(status.dead);

    // The whole exchange took exactly one parcel and one closure on the
    // wire, and nothing else.
    assert_eq!(a_to_b.accept_parcel.load(Ordering::SeqCst), 1);
    assert_eq!(a_to_b.route_closed.load(Ordering::SeqCst), 1);
    assert_eq!(a_to_b.total(), 2);
}

#[test]
fn multiple_initial_portals_are_independent() {
    let node_a = Node::new();
    let node_b = Node::new();
    let (portals_a, portals_b) = connect_nodes(&node_a, &node_b, 3).unwrap();

    for (i, portal) in portals_a.iter().enumerate() {
        portal.put(&[i as u8], Vec::new(), None).unwrap();
    }
    for (i, portal) in portals_b.iter().enumerate() {
        let (data, _) = portal.get().unwrap();
        assert_eq!(data, vec![i as u8]);
    }
}

#[test]
fn remote_delivery_is_ordered() {
    let node_a = Node::new();
    let node_b = Node::new();
    let (mut portals_a, mut portals_b) = connect_nodes(&node_a, &node_b, 1).unwrap();
    let p1 = portals_a.remove(0);
    let p2 = portals_b.remove(0);

    for i in 0..50u32 {
        p1.put(&i.to_be_bytes(), Vec::new(), None).unwrap();
    }
    for i in 0..50u32 {
        let (data, _) = p2.get().unwrap();
        assert_eq!(data, i.to_be_bytes());
    }
}

#[test]
fn closure_arrives_after_queued_parcels() {
    let node_a = Node::new();
    let node_b = Node::new();
    let (transport_a, transport_b) = MemoryTransport::pair();
    let transport_b_handle = std::sync::Arc::clone(&transport_b);

    let (mut portals_a, mut portals_b) =
        connect_nodes_with_transports(&node_a, &node_b, transport_a, transport_b, 1).unwrap();
    let p1 = portals_a.remove(0);
    let p2 = portals_b.remove(0);

    // Hold delivery into B while A sends and closes.
    transport_b_handle.pause();
    p1.put(b"one", Vec::new(), None).unwrap();
    p1.put(b"two", Vec::new(), None).unwrap();
    p1.close();

    assert!(matches!(p2.get(), Err(ApiError::Unavailable)));
    transport_b_handle.resume();

    let (data, _) = p2.get().unwrap();
    assert_eq!(data, b"one");
    let (data, _) = p2.get().unwrap();
    assert_eq!(data, b"two");
    assert!(matches!(p2.get(), Err(ApiError::NotFound)));
    assert!(p2.query_status().dead);
}

#[test]
fn duplicate_connection_is_rejected() {
    let node_a = Node::new();
    let node_b = Node::new();
    connect_nodes(&node_a, &node_b, 0).unwrap();
    assert!(matches!(
        connect_nodes(&node_a, &node_b, 0),
        Err(ApiError::AlreadyExists)
    ));
}

#[test]
fn too_many_initial_portals_is_invalid() {
    let node_a = Node::new();
    let node_b = Node::new();
    assert!(matches!(
        connect_nodes(&node_a, &node_b, 64),
        Err(ApiError::InvalidArgument)
    ));
}
