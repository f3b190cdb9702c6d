//! The abstract channel between two adjacent routers.
//!
//! A [`RouterLink`] hides whether the peer router lives in this process
//! ([`LocalRouterLink`]) or across a node link ([`RemoteRouterLink`]). The
//! capability set splits into two groups with different re-entrancy rules:
//!
//! - **Delivery and lifecycle operations** (`accept_parcel`,
//!   `accept_route_closure`, `accept_route_disconnected`, `deactivate`,
//!   `flush_other_side_if_waiting`, and the bypass messages) may re-enter a
//!   router synchronously. They must never be invoked while holding a
//!   router mutex; callers stage them and invoke after release.
//! - **Link-state operations** (`mark_side_stable`, the lock family, queue
//!   state) touch only the lock-free shared cell and are safe under a
//!   router mutex.
//!
//! [`LocalRouterLink`]: crate::local_link::LocalRouterLink
//! [`RemoteRouterLink`]: crate::remote_link::RemoteRouterLink

use std::sync::Arc;

use weft_core::fragment::LinkStateFragment;
use weft_core::link_state::QueueState;
use weft_core::sequence::SequenceNumber;
use weft_core::types::{LinkType, NodeName, SublinkId};

use crate::parcel::Parcel;
use crate::remote_link::RemoteRouterLink;
use crate::router::Router;

pub trait RouterLink: Send + Sync {
    fn link_type(&self) -> LinkType;

    /// The peer router when it lives in this process.
    fn local_peer(&self) -> Option<Arc<Router>>;

    /// This link as a remote link, when it is one.
    fn as_remote(&self) -> Option<Arc<RemoteRouterLink>> {
        None
    }

    // --- delivery and lifecycle (re-entrant; never call under a router
    // --- mutex)

    /// Deliver one parcel to the peer router.
    fn accept_parcel(&self, parcel: Parcel);

    /// Tell the peer router its inbound sequence ends at `sequence_length`.
    fn accept_route_closure(&self, sequence_length: SequenceNumber);

    /// Tell the peer router the route is dead.
    fn accept_route_disconnected(&self);

    /// If the other side recorded a failed lock attempt, clear it and get
    /// that side flushed. Returns whether a nudge was issued.
    fn flush_other_side_if_waiting(&self) -> bool;

    /// Sever this link's registration so it can be dropped.
    fn deactivate(&self);

    // --- link-state cell operations (lock-free; safe under a router mutex)

    /// Flag this side of the link as stable in the shared cell.
    fn mark_side_stable(&self);

    /// Take the mutation lock for a bypass, stamping which node may follow
    /// up with a replacement link.
    fn try_lock_for_bypass(&self, bypass_request_source: NodeName) -> bool;

    /// Take the mutation lock to close the route from this side.
    fn try_lock_for_closure(&self) -> bool;

    /// Release a previously acquired mutation lock.
    fn unlock(&self);

    /// Whether `bypass_request_source` matches the node stamped by the
    /// other side's bypass lock.
    fn can_node_request_bypass(&self, bypass_request_source: NodeName) -> bool;

    /// Publish this side's inbound queue occupancy.
    fn update_inbound_queue_state(&self, state: QueueState);

    /// The occupancy last published by the other side.
    fn peer_queue_state(&self) -> QueueState;

    // --- bypass protocol messages (only meaningful on remote links)

    /// Ask the peer (a proxy's inward neighbor) to route around the proxy
    /// at `(bypass_target_node, bypass_target_sublink)`.
    fn bypass_peer(&self, bypass_target_node: NodeName, bypass_target_sublink: SublinkId);

    /// Tell the proxy on the other side to stop proxying at the negotiated
    /// sequence lengths.
    fn stop_proxying(
        &self,
        inbound_sequence_length: SequenceNumber,
        outbound_sequence_length: SequenceNumber,
    );

    /// Tell the peer that the proxy between us will stop forwarding inbound
    /// parcels at `inbound_sequence_length`.
    fn proxy_will_stop(&self, inbound_sequence_length: SequenceNumber);

    /// Hand the peer a ready-made replacement link for bypassing the proxy
    /// on this side.
    fn bypass_peer_with_link(
        &self,
        new_sublink: SublinkId,
        new_link_state: LinkStateFragment,
        inbound_sequence_length: SequenceNumber,
    );

    /// Local-peer variant of `stop_proxying`: the proxy conspires with its
    /// in-process outward peer, so only the outbound length is negotiated.
    fn stop_proxying_to_local_peer(&self, outbound_sequence_length: SequenceNumber);

    /// Human-readable identity for logs.
    fn describe(&self) -> String;
}

/// Whether two link handles refer to the same link object.
pub fn same_link(a: &dyn RouterLink, b: &dyn RouterLink) -> bool {
    std::ptr::addr_eq(a as *const dyn RouterLink, b as *const dyn RouterLink)
}
