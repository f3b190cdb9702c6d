//! Transport failure: routes die cleanly, nothing leaks.

use std::sync::Arc;

use weft_node::{
    ApiError, Attachment, MemoryTransport, Node, Portal, connect_nodes,
    connect_nodes_with_transports,
};

mod common;

fn take_portal(attachments: Vec<Attachment>) -> Portal {
    let mut attachments = attachments;
    match attachments.remove(0) {
        Attachment::Portal(portal) => portal,
        Attachment::Box(_) => panic!("expected a portal attachment"),
    }
}

#[test]
fn severed_transport_kills_the_route() {
    let node_a = Node::new();
    let node_b = Node::new();
    let (t_a, t_b) = MemoryTransport::pair();
    let (mut portals_a, mut portals_b) =
        connect_nodes_with_transports(&node_a, &node_b, t_a.clone(), t_b, 1).unwrap();
    let p1 = portals_a.remove(0);
    let p2 = portals_b.remove(0);

    p1.put(b"delivered", Vec::new(), None).unwrap();
    t_a.sever();

    // Both ends observe peer-closed + dead; the delivered parcel is gone
    // with the route (its direction was force-terminated).
    let status = p1.query_status();
    assert!(status.peer_closed && status.dead);
    let status = p2.query_status();
    assert!(status.peer_closed && status.dead);
    assert!(matches!(p2.get(), Err(ApiError::NotFound)));

    // The node links are gone from both registries.
    assert!(node_a.get_link(node_b.name()).is_none());
    assert!(node_b.get_link(node_a.name()).is_none());

    // Sends after death fail without side effects.
    let error = p1.put(b"too late", Vec::new(), None).unwrap_err();
    assert_eq!(error.error, ApiError::NotFound);
}

/// The A↔B transport drops mid-bypass. C still observes a
/// clean death and no routers leak.
#[test]
fn disconnection_mid_bypass_is_clean() {
    let node_a = Node::new();
    let node_b = Node::new();
    let node_c = Node::new();

    let (t_ab_a, t_ab_b) = MemoryTransport::pair();
    let (mut qa, mut qb) =
        connect_nodes_with_transports(&node_a, &node_b, t_ab_a.clone(), t_ab_b, 1).unwrap();
    let (qa, qb) = (qa.remove(0), qb.remove(0));

    let (mut rb, mut rc) = connect_nodes(&node_b, &node_c, 1).unwrap();
    let (rb, rc) = (rb.remove(0), rc.remove(0));

    // Pre-connect A↔C with A's endpoint paused: the second-hop bypass
    // stalls with the proxy on B still live.
    let (t_ca_c, t_ca_a) = MemoryTransport::pair();
    t_ca_a.pause();
    connect_nodes_with_transports(&node_c, &node_a, t_ca_c, t_ca_a.clone(), 0).unwrap();

    let (p1, p2) = Portal::pair(&node_a);
    qa.put(b"", vec![Attachment::Portal(p2)], None).unwrap();
    let (_, attachments) = qb.get().unwrap();
    let p2_on_b = take_portal(attachments);
    let proxy_on_b = Arc::downgrade(p2_on_b.router());
    rb.put(b"", vec![Attachment::Portal(p2_on_b)], None).unwrap();
    let (_, attachments) = rc.get().unwrap();
    let p2_on_c = take_portal(attachments);

    // Kill A↔B while the bypass is half-negotiated.
    t_ab_a.sever();

    let status = p1.query_status();
    assert!(status.peer_closed && status.dead);
    let status = p2_on_c.query_status();
    assert!(status.peer_closed && status.dead);
    assert!(proxy_on_b.upgrade().is_none(), "proxy on B leaked");

    // The stalled bypass messages surface at A now; they must be absorbed
    // without reviving anything.
    t_ca_a.resume();
    assert!(p1.query_status().dead);
    assert!(matches!(p2_on_c.get(), Err(ApiError::NotFound)));
}

#[test]
fn parcels_in_paused_transport_are_dropped_with_the_route() {
    let node_a = Node::new();
    let node_b = Node::new();
    let (t_a, t_b) = MemoryTransport::pair();
    let (mut portals_a, mut portals_b) =
        connect_nodes_with_transports(&node_a, &node_b, t_a.clone(), t_b.clone(), 1).unwrap();
    let p1 = portals_a.remove(0);
    let p2 = portals_b.remove(0);

    t_b.pause();
    p1.put(b"never arrives", Vec::new(), None).unwrap();
    t_a.sever();

    assert!(p2.query_status().dead);
    assert!(matches!(p2.get(), Err(ApiError::NotFound)));
}
