//! Shared helpers for the fabric integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use weft_core::types::NodeName;
use weft_node::{MemoryTransport, Node, connect_nodes};
use weft_router::node::Introducer;
use weft_router::wire::{Envelope, Message};
use weft_router::TransportMessage;

/// Per-message-type counters observed on one transport direction.
#[derive(Default)]
pub struct WireCounts {
    pub accept_parcel: AtomicUsize,
    pub route_closed: AtomicUsize,
    pub route_disconnected: AtomicUsize,
    pub flush_router: AtomicUsize,
    pub bypass: AtomicUsize,
    pub other: AtomicUsize,
}

impl WireCounts {
    pub fn total(&self) -> usize {
        self.accept_parcel.load(Ordering::SeqCst)
            + self.route_closed.load(Ordering::SeqCst)
            + self.route_disconnected.load(Ordering::SeqCst)
            + self.flush_router.load(Ordering::SeqCst)
            + self.bypass.load(Ordering::SeqCst)
            + self.other.load(Ordering::SeqCst)
    }
}

/// Attach a decoding probe to `transport`, counting transmitted messages.
pub fn count_messages(transport: &MemoryTransport) -> Arc<WireCounts> {
    let counts = Arc::new(WireCounts::default());
    let captured = Arc::clone(&counts);
    transport.set_probe(Arc::new(move |message: &TransportMessage| {
        let envelope = Envelope::decode(&message.data).expect("probe saw a malformed envelope");
        let counter = match envelope.message {
            Message::AcceptParcel { .. } => &captured.accept_parcel,
            Message::RouteClosed { .. } => &captured.route_closed,
            Message::RouteDisconnected { .. } => &captured.route_disconnected,
            Message::FlushRouter { .. } => &captured.flush_router,
            Message::BypassPeer { .. }
            | Message::AcceptBypassLink { .. }
            | Message::BypassPeerWithLink { .. }
            | Message::StopProxying { .. }
            | Message::ProxyWillStop { .. }
            | Message::StopProxyingToLocalPeer { .. } => &captured.bypass,
            Message::AddLinkStateBuffer { .. } => &captured.other,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    counts
}

/// Install an introducer on every node that connects any two of them on
/// demand, standing in for the out-of-scope brokerage layer.
pub fn install_introducer(nodes: &[&Arc<Node>]) {
    let registry: HashMap<NodeName, Arc<Node>> = nodes
        .iter()
        .map(|node| (node.name(), Arc::clone(node)))
        .collect();
    let introducer: Introducer = Arc::new(move |requester, remote, callback| {
        let Some(target) = registry.get(&remote) else {
            callback(None);
            return;
        };
        if requester.get_link(remote).is_none()
            && connect_nodes(requester, target, 0).is_err()
        {
            callback(None);
            return;
        }
        callback(requester.get_link(remote));
    });
    for node in nodes {
        node.set_introducer(Arc::clone(&introducer));
    }
}
