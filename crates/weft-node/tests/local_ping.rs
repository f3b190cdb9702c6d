//! Same-process portal pairs: ordered delivery, status transitions, traps,
//! and the two-phase receive.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use weft_node::{ApiError, Node, Portal, PutLimits, TrapConditions};

mod common;

#[test]
fn local_ping() {
    let node = Node::new();
    let (p1, p2) = Portal::pair(&node);

    p1.put(b"hi", Vec::new(), None).unwrap();
    let (data, attachments) = p2.get().unwrap();
    assert_eq!(data, b"hi");
    assert!(attachments.is_empty());

    p1.close();
    let status = p2.query_status();
    assert!(status.peer_closed);
    assert!(status.dead);
}

#[test]
fn delivery_is_ordered_and_complete() {
    let node = Node::new();
    let (p1, p2) = Portal::pair(&node);

    for i in 0..100u32 {
        p1.put(&i.to_be_bytes(), Vec::new(), None).unwrap();
    }
    for i in 0..100u32 {
        let (data, _) = p2.get().unwrap();
        assert_eq!(data, i.to_be_bytes());
    }
    assert!(matches!(p2.get(), Err(ApiError::Unavailable)));
}

#[test]
fn get_before_put_reports_unavailable_then_not_found() {
    let node = Node::new();
    let (p1, p2) = Portal::pair(&node);

    assert!(matches!(p2.get(), Err(ApiError::Unavailable)));
    p1.close();
    assert!(matches!(p2.get(), Err(ApiError::NotFound)));
    assert!(p2.query_status().dead);
}

#[test]
fn put_to_closed_peer_returns_attachments() {
    let node = Node::new();
    let (p1, p2) = Portal::pair(&node);
    let (x1, _x2) = Portal::pair(&node);
    p2.close();

    let error = p1
        .put(b"late", vec![weft_node::Attachment::Portal(x1)], None)
        .unwrap_err();
    assert_eq!(error.error, ApiError::NotFound);
    assert_eq!(error.attachments.len(), 1);
}

#[test]
fn portal_cannot_travel_over_itself_or_its_peer() {
    let node = Node::new();
    let (p1, p2) = Portal::pair(&node);

    let error = p1
        .put(b"", vec![weft_node::Attachment::Portal(p2)], None)
        .unwrap_err();
    assert_eq!(error.error, ApiError::InvalidArgument);

    // The refused attachment is handed back usable.
    let [weft_node::Attachment::Portal(p2)] = &error.attachments[..] else {
        panic!("expected the portal back");
    };
    p1.put(b"still alive", Vec::new(), None).unwrap();
    let (data, _) = p2.get().unwrap();
    assert_eq!(data, b"still alive");
}

#[test]
fn put_limits_are_enforced() {
    let node = Node::new();
    let (p1, p2) = Portal::pair(&node);
    let limits = PutLimits {
        max_queued_parcels: 2,
        max_queued_bytes: 8,
    };

    p1.put(b"aaaa", Vec::new(), Some(&limits)).unwrap();
    let error = p1.put(b"bbbbbbb", Vec::new(), Some(&limits)).unwrap_err();
    assert_eq!(error.error, ApiError::ResourceExhausted);

    // Consuming makes room again.
    let (data, _) = p2.get().unwrap();
    assert_eq!(data, b"aaaa");
    p1.put(b"bbbb", Vec::new(), Some(&limits)).unwrap();
}

#[test]
fn two_phase_put_fills_a_parcel_in_place() {
    let node = Node::new();
    let (p1, p2) = Portal::pair(&node);

    let mut parcel = p1.allocate_parcel(16, None).unwrap();
    parcel.data_mut().extend_from_slice(b"built in place");
    parcel.attach(weft_node::Attachment::Box(weft_node::DriverObject::Blob(
        vec![9],
    )));
    p1.send_parcel(parcel).unwrap();

    let (data, attachments) = p2.get().unwrap();
    assert_eq!(data, b"built in place");
    assert_eq!(attachments.len(), 1);

    // Allocation against a closed peer is refused.
    p2.close();
    assert!(matches!(
        p1.allocate_parcel(4, None),
        Err(ApiError::NotFound)
    ));
}

#[test]
fn allocate_parcel_respects_limits() {
    let node = Node::new();
    let (p1, p2) = Portal::pair(&node);
    let limits = PutLimits {
        max_queued_parcels: 4,
        max_queued_bytes: 8,
    };

    p1.put(b"12345678", Vec::new(), Some(&limits)).unwrap();
    assert!(matches!(
        p1.allocate_parcel(1, Some(&limits)),
        Err(ApiError::ResourceExhausted)
    ));

    p2.get().unwrap();
    let parcel = p1.allocate_parcel(4, Some(&limits)).unwrap();
    p1.send_parcel(parcel).unwrap();
}

#[test]
fn two_phase_get_is_zero_copy_and_stateful() {
    let node = Node::new();
    let (p1, p2) = Portal::pair(&node);

    assert!(matches!(p2.begin_get(), Err(ApiError::Unavailable)));
    assert!(matches!(p2.commit_get(0), Err(ApiError::FailedPrecondition)));
    assert!(matches!(p2.abort_get(), Err(ApiError::FailedPrecondition)));

    p1.put(b"payload", Vec::new(), None).unwrap();

    let (view, num_objects) = p2.begin_get().unwrap();
    assert_eq!(&view[..], b"payload");
    assert_eq!(num_objects, 0);
    assert!(matches!(p2.begin_get(), Err(ApiError::AlreadyExists)));

    // Abort leaves the parcel queued.
    p2.abort_get().unwrap();
    let (view, _) = p2.begin_get().unwrap();
    assert_eq!(&view[..], b"payload");
    assert!(matches!(p2.commit_get(999), Err(ApiError::OutOfRange)));
    let attachments = p2.commit_get(view.len()).unwrap();
    assert!(attachments.is_empty());

    assert!(matches!(p2.get(), Err(ApiError::Unavailable)));
}

#[test]
fn traps_fire_on_new_parcel_and_peer_closure() {
    let node = Node::new();
    let (p1, p2) = Portal::pair(&node);

    let fired = Arc::new(AtomicU32::new(0));
    let captured = Arc::clone(&fired);
    p2.trap(
        TrapConditions::NEW_LOCAL_PARCEL,
        Arc::new(move |event| {
            assert!(event.conditions.contains(TrapConditions::NEW_LOCAL_PARCEL));
            assert_eq!(event.status.num_local_parcels, 1);
            captured.fetch_add(1, Ordering::SeqCst);
        }),
        1,
    )
    .unwrap();

    p1.put(b"ping", Vec::new(), None).unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // One-shot: a second parcel does not re-fire.
    p1.put(b"ping again", Vec::new(), None).unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    let closed = Arc::new(AtomicU32::new(0));
    let captured = Arc::clone(&closed);
    p2.trap(
        TrapConditions::PEER_CLOSED,
        Arc::new(move |event| {
            assert!(event.conditions.contains(TrapConditions::PEER_CLOSED));
            captured.fetch_add(1, Ordering::SeqCst);
        }),
        2,
    )
    .unwrap();

    p1.close();
    assert_eq!(closed.load(Ordering::SeqCst), 1);

    // A trap on an already-satisfied condition is refused.
    assert!(matches!(
        p2.trap(TrapConditions::PEER_CLOSED, Arc::new(|_| {}), 3),
        Err(ApiError::FailedPrecondition)
    ));
}

#[test]
fn status_counts_local_parcels_and_bytes() {
    let node = Node::new();
    let (p1, p2) = Portal::pair(&node);

    p1.put(b"12345", Vec::new(), None).unwrap();
    p1.put(b"678", Vec::new(), None).unwrap();

    let status = p2.query_status();
    assert_eq!(status.num_local_parcels, 2);
    assert_eq!(status.num_local_bytes, 8);

    let peer_view = p1.query_status();
    assert_eq!(peer_view.num_remote_parcels, 2);
    assert_eq!(peer_view.num_remote_bytes, 8);

    p2.get().unwrap();
    let status = p2.query_status();
    assert_eq!(status.num_local_parcels, 1);
    assert_eq!(status.num_local_bytes, 3);
}

#[test]
fn boxes_roundtrip_through_a_parcel() {
    let node = Node::new();
    let (p1, p2) = Portal::pair(&node);

    p1.put(
        b"with box",
        vec![weft_node::Attachment::Box(weft_node::DriverObject::Blob(
            vec![1, 2, 3],
        ))],
        None,
    )
    .unwrap();

    let (data, attachments) = p2.get().unwrap();
    assert_eq!(data, b"with box");
    let [weft_node::Attachment::Box(weft_node::DriverObject::Blob(blob))] = &attachments[..]
    else {
        panic!("expected one box attachment");
    };
    assert_eq!(blob, &vec![1, 2, 3]);
}
