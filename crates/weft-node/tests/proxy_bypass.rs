//! Proxy creation and elimination when portals travel across nodes.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use weft_node::{
    ApiError, Attachment, MemoryTransport, Node, Portal, connect_nodes,
    connect_nodes_with_transports,
};

mod common;

fn take_portal(attachments: Vec<Attachment>) -> Portal {
    let mut attachments = attachments;
    assert_eq!(attachments.len(), 1, "expected exactly one attachment");
    match attachments.remove(0) {
        Attachment::Portal(portal) => portal,
        Attachment::Box(_) => panic!("expected a portal attachment"),
    }
}

/// Send a portal two hops (A → B → C) and verify both intermediate proxies
/// are eliminated, leaving a direct A↔C link.
#[test]
fn forwarded_portal_is_bypassed_to_a_direct_link() {
    let node_a = Node::new();
    let node_b = Node::new();
    let node_c = Node::new();
    common::install_introducer(&[&node_a, &node_b, &node_c]);

    let (mut qa, mut qb) = connect_nodes(&node_a, &node_b, 1).unwrap();
    let (qa, qb) = (qa.remove(0), qb.remove(0));
    let (mut rb, mut rc) = connect_nodes(&node_b, &node_c, 1).unwrap();
    let (rb, rc) = (rb.remove(0), rc.remove(0));

    let (p1, p2) = Portal::pair(&node_a);
    let proxy_on_a = Arc::downgrade(p2.router());
    qa.put(b"", vec![Attachment::Portal(p2)], None).unwrap();

    let (_, attachments) = qb.get().unwrap();
    let p2_on_b = take_portal(attachments);
    let proxy_on_b = Arc::downgrade(p2_on_b.router());
    rb.put(b"", vec![Attachment::Portal(p2_on_b)], None).unwrap();

    let (_, attachments) = rc.get().unwrap();
    let p2_on_c = take_portal(attachments);

    // Both proxies must be gone and the endpoints must sit on one direct
    // central link between A and C.
    assert!(proxy_on_a.upgrade().is_none(), "proxy on A leaked");
    assert!(proxy_on_b.upgrade().is_none(), "proxy on B leaked");
    assert!(node_a.get_link(node_c.name()).is_some(), "no A-C link");
    assert!(p1.router().is_on_central_remote_link());
    assert!(p2_on_c.router().is_on_central_remote_link());

    // The route still works in both directions.
    p1.put(b"down", Vec::new(), None).unwrap();
    let (data, _) = p2_on_c.get().unwrap();
    assert_eq!(data, b"down");
    p2_on_c.put(b"up", Vec::new(), None).unwrap();
    let (data, _) = p1.get().unwrap();
    assert_eq!(data, b"up");

    p1.close();
    assert!(matches!(p2_on_c.get(), Err(ApiError::NotFound)));
    assert!(p2_on_c.query_status().dead);
}

/// Parcels sent while the portal is mid-forwarding must
/// arrive in order, split between the decaying path and the new direct
/// link at the negotiated length.
#[test]
fn in_flight_parcels_split_across_decaying_and_new_paths() {
    let node_a = Node::new();
    let node_b = Node::new();
    let node_c = Node::new();

    // A↔B instrumented; A↔C pre-connected with A's endpoint paused so the
    // second-hop bypass stalls before A adopts the direct link.
    let (t_ab_a, t_ab_b) = MemoryTransport::pair();
    let a_to_b = common::count_messages(&t_ab_a);
    let (mut qa, mut qb) = connect_nodes_with_transports(
        &node_a,
        &node_b,
        t_ab_a.clone(),
        t_ab_b,
        1,
    )
    .unwrap();
    let (qa, qb) = (qa.remove(0), qb.remove(0));

    let (mut rb, mut rc) = connect_nodes(&node_b, &node_c, 1).unwrap();
    let (rb, rc) = (rb.remove(0), rc.remove(0));

    let (t_ca_c, t_ca_a) = MemoryTransport::pair();
    let a_to_c = common::count_messages(&t_ca_a);
    t_ca_a.pause();
    connect_nodes_with_transports(&node_c, &node_a, t_ca_c, t_ca_a.clone(), 0).unwrap();

    // Move the portal to C. The bypass negotiation stalls in A's paused
    // queue, leaving the proxy on B carrying traffic.
    let (p1, p2) = Portal::pair(&node_a);
    qa.put(b"", vec![Attachment::Portal(p2)], None).unwrap();
    let (_, attachments) = qb.get().unwrap();
    rb.put(b"", vec![Attachment::Portal(take_portal(attachments))], None)
        .unwrap();
    let (_, attachments) = rc.get().unwrap();
    let p2_on_c = take_portal(attachments);

    // These three ride the old path through the proxy on B.
    for i in 0..3u8 {
        p1.put(&[i], Vec::new(), None).unwrap();
    }
    assert_eq!(a_to_c.accept_parcel.load(Ordering::SeqCst), 0);

    // Unstall the bypass; everything from here rides the direct link.
    t_ca_a.resume();
    for i in 3..5u8 {
        p1.put(&[i], Vec::new(), None).unwrap();
    }

    for i in 0..5u8 {
        let (data, _) = p2_on_c.get().unwrap();
        assert_eq!(data, vec![i], "parcel {i} out of order");
    }

    // Path split: exactly the last two parcels took the direct link, and
    // the portal transfer plus the first three took the old path.
    assert_eq!(a_to_c.accept_parcel.load(Ordering::SeqCst), 2);
    assert_eq!(a_to_b.accept_parcel.load(Ordering::SeqCst), 4);

    assert!(p1.router().is_on_central_remote_link());
    assert!(p2_on_c.router().is_on_central_remote_link());
}

/// The sender closes immediately after forwarding; the
/// final sequence length must survive the proxy chain.
#[test]
fn closure_during_forwarding_preserves_sequence_length() {
    let node_a = Node::new();
    let node_b = Node::new();
    let node_c = Node::new();
    common::install_introducer(&[&node_a, &node_b, &node_c]);

    let (mut qa, mut qb) = connect_nodes(&node_a, &node_b, 1).unwrap();
    let (qa, qb) = (qa.remove(0), qb.remove(0));
    let (mut rb, mut rc) = connect_nodes(&node_b, &node_c, 1).unwrap();
    let (rb, rc) = (rb.remove(0), rc.remove(0));

    let (p1, p2) = Portal::pair(&node_a);
    let proxy_on_a = Arc::downgrade(p2.router());
    qa.put(b"", vec![Attachment::Portal(p2)], None).unwrap();

    // Two parcels, then close, all before the portal moves on to C.
    p1.put(b"m0", Vec::new(), None).unwrap();
    p1.put(b"m1", Vec::new(), None).unwrap();
    p1.close();

    let (_, attachments) = qb.get().unwrap();
    let p2_on_b = take_portal(attachments);
    let proxy_on_b = Arc::downgrade(p2_on_b.router());
    rb.put(b"", vec![Attachment::Portal(p2_on_b)], None).unwrap();

    let (_, attachments) = rc.get().unwrap();
    let p2_on_c = take_portal(attachments);

    // C sees the closure with the right count: both parcels, then the end.
    let status = p2_on_c.query_status();
    assert!(status.peer_closed);
    assert!(!status.dead);
    assert_eq!(status.num_local_parcels, 2);

    let (data, _) = p2_on_c.get().unwrap();
    assert_eq!(data, b"m0");
    let (data, _) = p2_on_c.get().unwrap();
    assert_eq!(data, b"m1");
    assert!(matches!(p2_on_c.get(), Err(ApiError::NotFound)));
    assert!(p2_on_c.query_status().dead);

    // Sends against the closed route fail cleanly.
    let error = p2_on_c.put(b"too late", Vec::new(), None).unwrap_err();
    assert_eq!(error.error, ApiError::NotFound);

    assert!(proxy_on_a.upgrade().is_none(), "proxy on A leaked");
    assert!(proxy_on_b.upgrade().is_none(), "proxy on B leaked");
}

/// A single-hop transfer: the proxy left on A must be bypassed even with
/// the peer local to it.
#[test]
fn local_peer_bypass_after_single_hop() {
    let node_a = Node::new();
    let node_b = Node::new();
    let (mut qa, mut qb) = connect_nodes(&node_a, &node_b, 1).unwrap();
    let (qa, qb) = (qa.remove(0), qb.remove(0));

    let (p1, p2) = Portal::pair(&node_a);
    let proxy_on_a = Arc::downgrade(p2.router());
    qa.put(b"", vec![Attachment::Portal(p2)], None).unwrap();
    let (_, attachments) = qb.get().unwrap();
    let p2_on_b = take_portal(attachments);

    assert!(proxy_on_a.upgrade().is_none(), "proxy on A leaked");
    assert!(p1.router().is_on_central_remote_link());
    assert!(p2_on_b.router().is_on_central_remote_link());

    // Heavy traffic still flows correctly after the bypass.
    for i in 0..32u32 {
        p1.put(&i.to_be_bytes(), Vec::new(), None).unwrap();
        p2_on_b.put(&i.to_be_bytes(), Vec::new(), None).unwrap();
    }
    for i in 0..32u32 {
        assert_eq!(p2_on_b.get().unwrap().0, i.to_be_bytes());
        assert_eq!(p1.get().unwrap().0, i.to_be_bytes());
    }
}
