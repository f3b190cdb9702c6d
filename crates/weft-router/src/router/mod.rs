//! The per-endpoint routing state machine.
//!
//! A router is *terminal* while a portal owns it, and becomes a *proxy*
//! when its portal is serialized away to another node. Every router carries
//! two sequenced parcel queues (one per direction), an outward edge toward
//! the route's other end, an inward edge iff it is a proxy, and an optional
//! bridge installed by a merge.
//!
//! # Locking
//!
//! One mutex guards all of a router's state. No re-entrant link operation
//! is ever invoked with a router mutex held — work is staged under the lock
//! and performed after release ([`flush`] is the canonical pattern). The
//! debug build enforces this with a thread-local count of held router
//! mutexes, checked by every re-entrant `RouterLink` entry point.
//!
//! [`flush`]: Router::flush

mod bypass;
mod flush;
mod serialize;

use std::cell::Cell;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};

use weft_core::link_state::QueueState;
use weft_core::sequence::SequenceNumber;
use weft_core::types::LinkType;

use crate::edge::RouteEdge;
use crate::error::ApiError;
use crate::link::{RouterLink, same_link};
use crate::local_link::{InitialLinkState, LocalRouterLink};
use crate::multi_lock::lock_two;
use crate::parcel::{Parcel, ParcelObject, ParcelQueue};
use crate::remote_link::RemoteRouterLink;
use crate::trap::{TrapConditions, TrapEventDispatcher, TrapHandler, TrapSet, UpdateReason};

pub use crate::trap::PortalStatus;

/// Limits applied to an outbound put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutLimits {
    pub max_queued_parcels: usize,
    pub max_queued_bytes: usize,
}

/// A parcel refused by [`Router::send_outbound_parcel`], handed back so the
/// caller can release its attachments.
#[derive(Debug)]
pub struct SendError {
    pub error: ApiError,
    pub parcel: Parcel,
}

/// How a flush was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushBehavior {
    /// An ordinary flush after a state change.
    Default,
    /// Also attempt proxy bypass even if no local state changed; used when
    /// a new link may have unblocked the other side.
    ForceBypassAttempt,
}

pub(crate) struct RouterState {
    pub(crate) outbound_parcels: ParcelQueue,
    pub(crate) inbound_parcels: ParcelQueue,
    pub(crate) outward_edge: RouteEdge,
    /// Present iff this router is a proxy.
    pub(crate) inward_edge: Option<RouteEdge>,
    /// Present only between a merge and the completion of bridge bypass.
    pub(crate) bridge: Option<RouteEdge>,
    pub(crate) status: PortalStatus,
    pub(crate) traps: TrapSet,
    pub(crate) is_disconnected: bool,
}

thread_local! {
    static ROUTER_MUTEXES_HELD: Cell<usize> = const { Cell::new(0) };
}

/// Debug check that the calling thread holds no router mutex. Invoked by
/// every re-entrant `RouterLink` operation.
pub fn assert_no_router_mutex_held() {
    debug_assert_eq!(
        ROUTER_MUTEXES_HELD.get(),
        0,
        "re-entrant RouterLink operation invoked under a router mutex"
    );
}

pub(crate) struct RouterStateGuard<'a> {
    inner: MutexGuard<'a, RouterState>,
}

impl Deref for RouterStateGuard<'_> {
    type Target = RouterState;

    fn deref(&self) -> &RouterState {
        &self.inner
    }
}

impl DerefMut for RouterStateGuard<'_> {
    fn deref_mut(&mut self) -> &mut RouterState {
        &mut self.inner
    }
}

impl Drop for RouterStateGuard<'_> {
    fn drop(&mut self) {
        ROUTER_MUTEXES_HELD.set(ROUTER_MUTEXES_HELD.get() - 1);
    }
}

pub struct Router {
    state: Mutex<RouterState>,
}

impl Router {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RouterState {
                outbound_parcels: ParcelQueue::new(),
                inbound_parcels: ParcelQueue::new(),
                outward_edge: RouteEdge::default(),
                inward_edge: None,
                bridge: None,
                status: PortalStatus::default(),
                traps: TrapSet::new(),
                is_disconnected: false,
            }),
        })
    }

    pub(crate) fn lock_state(&self) -> RouterStateGuard<'_> {
        let inner = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        ROUTER_MUTEXES_HELD.set(ROUTER_MUTEXES_HELD.get() + 1);
        RouterStateGuard { inner }
    }

    pub fn is_peer_closed(&self) -> bool {
        self.lock_state().status.peer_closed
    }

    pub fn is_route_dead(&self) -> bool {
        self.lock_state().status.dead
    }

    /// Whether this terminal router sits directly on a stable central link
    /// to another node. Primarily an observability hook for tests: after
    /// proxy bypass settles, both ends of a cross-node route satisfy this.
    pub fn is_on_central_remote_link(&self) -> bool {
        let state = self.lock_state();
        debug_assert!(state.inward_edge.is_none());
        state.outward_edge.is_stable()
            && state.outward_edge.primary_link().is_some_and(|link| {
                link.link_type().is_central() && link.local_peer().is_none()
            })
    }

    pub fn has_local_peer(&self, other: &Arc<Router>) -> bool {
        self.lock_state()
            .outward_edge
            .get_local_peer()
            .is_some_and(|peer| Arc::ptr_eq(&peer, other))
    }

    /// Portal-visible status, folding in the peer's published queue state
    /// when a central link is up.
    pub fn query_status(&self) -> PortalStatus {
        let state = self.lock_state();
        let mut status = state.status.clone();
        if state.inward_edge.is_none()
            && let Some(outward) = state.outward_edge.primary_link()
            && outward.link_type().is_central()
        {
            let peer = outward.peer_queue_state();
            status.num_remote_parcels =
                state.outbound_parcels.num_available_elements() + peer.num_parcels as usize;
            status.num_remote_bytes =
                state.outbound_parcels.total_available_bytes() + peer.num_bytes as usize;
        }
        status
    }

    /// Bytes a put may still enqueue under `limits`, considering both the
    /// local outbound queue and what the peer has not yet consumed.
    pub fn outbound_capacity_in_bytes(&self, limits: &PutLimits) -> usize {
        if limits.max_queued_bytes == 0 || limits.max_queued_parcels == 0 {
            return 0;
        }
        let state = self.lock_state();
        let mut num_queued_parcels = state.outbound_parcels.num_available_elements();
        let mut num_queued_bytes = state.outbound_parcels.total_available_bytes();
        if let Some(outward) = state.outward_edge.primary_link()
            && outward.link_type().is_central()
        {
            let peer = outward.peer_queue_state();
            num_queued_parcels += peer.num_parcels as usize;
            num_queued_bytes += peer.num_bytes as usize;
        }
        if num_queued_parcels >= limits.max_queued_parcels {
            return 0;
        }
        limits.max_queued_bytes.saturating_sub(num_queued_bytes)
    }

    /// Install the outward link. When both edges are already stable the new
    /// link is immediately marked stable from this side, which may unblock
    /// bypass on the other side.
    pub fn set_outward_link(self: &Arc<Self>, link: Arc<dyn RouterLink>) {
        let mut rejected = Some(link);
        {
            let mut state = self.lock_state();
            let link = rejected.take().expect("link is present on entry");
            if link.link_type().is_central()
                && state.outward_edge.is_stable()
                && state.inward_edge.as_ref().is_none_or(RouteEdge::is_stable)
            {
                link.mark_side_stable();
            }
            if state.is_disconnected {
                rejected = Some(link);
            } else {
                state.outward_edge.set_primary_link(link);
            }
        }

        if let Some(link) = rejected {
            // This router was disconnected before the link arrived; the far
            // side must find out.
            link.accept_route_disconnected();
            link.deactivate();
            return;
        }
        self.flush(FlushBehavior::ForceBypassAttempt);
    }

    /// Send a parcel toward the peer portal, assigning its sequence number.
    pub fn send_outbound_parcel(self: &Arc<Self>, mut parcel: Parcel) -> Result<(), SendError> {
        let mut direct: Option<(Arc<dyn RouterLink>, Parcel)> = None;
        {
            let mut state = self.lock_state();
            let state = &mut *state;
            if state.inbound_parcels.final_length().is_some() {
                // A finalized inbound sequence means the peer is gone.
                return Err(SendError {
                    error: ApiError::NotFound,
                    parcel,
                });
            }

            let sequence_number = state.outbound_parcels.sequence_length();
            parcel.set_sequence_number(sequence_number);
            if let Some(link) = state.outward_edge.primary_link().cloned()
                && state.outbound_parcels.maybe_skip(sequence_number)
            {
                // Nothing queued ahead of this parcel and a live link:
                // transmit without the queueing detour.
                direct = Some((link, parcel));
            } else {
                tracing::trace!(%parcel, "queueing outbound parcel");
                let pushed = state.outbound_parcels.push(sequence_number, parcel);
                debug_assert!(pushed);
            }
        }

        match direct {
            Some((link, parcel)) => link.accept_parcel(parcel),
            None => self.flush(FlushBehavior::Default),
        }
        Ok(())
    }

    /// Close this end of the route. The closure propagates once the final
    /// parcel has been flushed out.
    pub fn close_route(self: &Arc<Self>) {
        let mut dispatcher = TrapEventDispatcher::new();
        {
            let mut state = self.lock_state();
            let final_length = state.outbound_parcels.sequence_length();
            state.outbound_parcels.set_final_length(final_length);
            state.traps.remove_all(&mut dispatcher);
        }
        self.flush(FlushBehavior::Default);
    }

    /// Deliver a parcel traveling toward this end's portal. Out-of-range
    /// pushes are absorbed: disconnection can truncate sequences with
    /// parcels still in flight.
    pub fn accept_inbound_parcel(self: &Arc<Self>, parcel: Parcel) -> bool {
        let mut dispatcher = TrapEventDispatcher::new();
        {
            let mut state = self.lock_state();
            let state = &mut *state;
            let sequence_number = parcel.sequence_number();
            if !state.inbound_parcels.push(sequence_number, parcel) {
                return true;
            }

            if state.inward_edge.is_none() {
                state.status.num_local_parcels = state.inbound_parcels.num_available_elements();
                state.status.num_local_bytes = state.inbound_parcels.total_available_bytes();
                state.traps.update(
                    &state.status,
                    UpdateReason::NewLocalParcel,
                    &mut dispatcher,
                );
                publish_queue_state(state);
            }
        }
        self.flush(FlushBehavior::Default);
        true
    }

    /// Forward a parcel traveling away from this end. Only proxies see
    /// these; the queue tracks the full sequence so the proxy knows with
    /// certainty when forwarding is complete.
    pub fn accept_outbound_parcel(self: &Arc<Self>, parcel: Parcel) -> bool {
        {
            let mut state = self.lock_state();
            let sequence_number = parcel.sequence_number();
            if !state.outbound_parcels.push(sequence_number, parcel) {
                return true;
            }
        }
        self.flush(FlushBehavior::Default);
        true
    }

    /// Handle a route closure announced over a link of type `link_type`.
    /// Duplicate announcements for an early-terminated sequence are
    /// absorbed.
    pub fn accept_route_closure_from(
        self: &Arc<Self>,
        link_type: LinkType,
        sequence_length: SequenceNumber,
    ) -> bool {
        let mut dispatcher = TrapEventDispatcher::new();
        {
            let mut state = self.lock_state();
            let state = &mut *state;
            if link_type.is_outward() {
                if !state.inbound_parcels.set_final_length(sequence_length) {
                    tracing::debug!("discarding inbound route closure");
                    return state
                        .inbound_parcels
                        .final_length()
                        .is_some_and(|length| length <= sequence_length);
                }
                if state.inward_edge.is_none() && state.bridge.is_none() {
                    state.status.peer_closed = true;
                    if state.inbound_parcels.is_fully_consumed() {
                        state.status.dead = true;
                    }
                    state
                        .traps
                        .update(&state.status, UpdateReason::PeerClosed, &mut dispatcher);
                }
            } else if link_type.is_peripheral_inward() {
                if !state.outbound_parcels.set_final_length(sequence_length) {
                    tracing::debug!("discarding outbound route closure");
                    return state
                        .outbound_parcels
                        .final_length()
                        .is_some_and(|length| length <= sequence_length);
                }
            } else if link_type.is_bridge() {
                if !state.outbound_parcels.set_final_length(sequence_length) {
                    return false;
                }
                state.bridge = None;
            }
        }
        self.flush(FlushBehavior::Default);
        true
    }

    /// Handle loss of the route in the direction of `link_type`: terminate
    /// the affected sequence, drop every link, and propagate the
    /// disconnection over all of them.
    pub fn accept_route_disconnected_from(self: &Arc<Self>, link_type: LinkType) -> bool {
        let mut dispatcher = TrapEventDispatcher::new();
        let mut forwarding_links: Vec<Arc<dyn RouterLink>> = Vec::new();
        {
            let mut state = self.lock_state();
            let state = &mut *state;
            tracing::debug!(%link_type, "router disconnected");

            state.is_disconnected = true;
            if link_type.is_peripheral_inward() {
                state.outbound_parcels.force_terminate();
            } else {
                state.inbound_parcels.force_terminate();
            }

            forwarding_links.extend(state.outward_edge.release_primary_link());
            forwarding_links.extend(state.outward_edge.release_decaying_link());
            if let Some(inward) = state.inward_edge.as_mut() {
                forwarding_links.extend(inward.release_primary_link());
                forwarding_links.extend(inward.release_decaying_link());
            } else if let Some(bridge) = state.bridge.as_mut() {
                forwarding_links.extend(bridge.release_primary_link());
                forwarding_links.extend(bridge.release_decaying_link());
            } else {
                state.status.peer_closed = true;
                if state.inbound_parcels.is_fully_consumed() {
                    state.status.dead = true;
                }
                state
                    .traps
                    .update(&state.status, UpdateReason::PeerClosed, &mut dispatcher);
            }
        }

        for link in forwarding_links {
            tracing::debug!(link = link.describe(), "forwarding disconnection");
            link.accept_route_disconnected();
            link.deactivate();
        }
        self.flush(FlushBehavior::Default);
        true
    }

    /// A remote link died with its node link. Drop whichever edge slot held
    /// it, then run the ordinary disconnect path.
    pub fn notify_link_disconnected(self: &Arc<Self>, link: &Arc<RemoteRouterLink>) {
        let link_dyn: &dyn RouterLink = link.as_ref();
        {
            let mut state = self.lock_state();
            let state = &mut *state;
            let matches = |slot: Option<&Arc<dyn RouterLink>>| {
                slot.is_some_and(|held| same_link(held.as_ref(), link_dyn))
            };
            if matches(state.outward_edge.primary_link()) {
                state.outward_edge.release_primary_link();
            } else if matches(state.outward_edge.decaying_link()) {
                state.outward_edge.release_decaying_link();
            } else if let Some(inward) = state.inward_edge.as_mut() {
                if matches(inward.primary_link()) {
                    inward.release_primary_link();
                } else if matches(inward.decaying_link()) {
                    inward.release_decaying_link();
                }
            }
        }

        if link.link_type().is_outward() {
            self.accept_route_disconnected_from(LinkType::PeripheralOutward);
        } else {
            self.accept_route_disconnected_from(LinkType::PeripheralInward);
        }
    }

    /// Pop the next in-order parcel for the application.
    pub fn get_next_inbound_parcel(&self) -> Result<Parcel, ApiError> {
        let mut dispatcher = TrapEventDispatcher::new();
        let parcel;
        {
            let mut state = self.lock_state();
            let state = &mut *state;
            if state.inbound_parcels.is_fully_consumed() {
                return Err(ApiError::NotFound);
            }
            let Some(next) = state.inbound_parcels.pop() else {
                return Err(ApiError::Unavailable);
            };
            parcel = next;
            note_local_consumption(state, &mut dispatcher);
        }
        Ok(parcel)
    }

    /// Expose the next in-order parcel without consuming it (two-phase
    /// receive).
    pub fn begin_get(&self) -> Result<(Arc<[u8]>, usize), ApiError> {
        let state = self.lock_state();
        if state.inward_edge.is_some() {
            return Err(ApiError::InvalidArgument);
        }
        match state.inbound_parcels.next_element() {
            Some(parcel) => Ok((parcel.share_data(), parcel.num_objects())),
            None => Err(ApiError::Unavailable),
        }
    }

    /// Consume the parcel exposed by [`begin_get`](Self::begin_get),
    /// returning its attachments.
    pub fn commit_get(&self, num_bytes_consumed: usize) -> Result<Vec<ParcelObject>, ApiError> {
        let mut dispatcher = TrapEventDispatcher::new();
        let objects;
        {
            let mut state = self.lock_state();
            let state = &mut *state;
            if state.inward_edge.is_some() {
                return Err(ApiError::InvalidArgument);
            }
            let Some(head) = state.inbound_parcels.next_element() else {
                return Err(ApiError::FailedPrecondition);
            };
            if num_bytes_consumed > head.data_size() {
                return Err(ApiError::OutOfRange);
            }
            let mut parcel = state
                .inbound_parcels
                .pop()
                .expect("head element checked above");
            objects = parcel.take_objects();
            note_local_consumption(state, &mut dispatcher);
        }
        Ok(objects)
    }

    /// Install an observer on this router's portal-visible state.
    pub fn trap(
        &self,
        conditions: TrapConditions,
        handler: TrapHandler,
        context: u64,
    ) -> Result<(), ApiError> {
        let mut state = self.lock_state();
        let state = &mut *state;
        state
            .traps
            .add(conditions, handler, context, &state.status)
            .map_err(|_satisfied| ApiError::FailedPrecondition)
    }

    /// Splice this route to `other`'s route with a bridge. Neither router
    /// may have carried traffic or be anything but terminal.
    pub fn merge_route(self: &Arc<Self>, other: &Arc<Router>) -> Result<(), ApiError> {
        if Arc::ptr_eq(self, other) || self.has_local_peer(other) {
            return Err(ApiError::InvalidArgument);
        }

        {
            let (mut a, mut b) = lock_two(self, other);
            if a.inward_edge.is_some()
                || b.inward_edge.is_some()
                || a.bridge.is_some()
                || b.bridge.is_some()
            {
                return Err(ApiError::InvalidArgument);
            }
            if a.inbound_parcels.current_sequence_number() > SequenceNumber::ZERO
                || a.outbound_parcels.sequence_length() > SequenceNumber::ZERO
                || b.inbound_parcels.current_sequence_number() > SequenceNumber::ZERO
                || b.outbound_parcels.sequence_length() > SequenceNumber::ZERO
            {
                return Err(ApiError::FailedPrecondition);
            }

            let (link_a, link_b) = LocalRouterLink::create_pair(
                LinkType::Bridge,
                (Arc::clone(self), Arc::clone(other)),
                InitialLinkState::Unstable,
            );
            let mut bridge_a = RouteEdge::default();
            bridge_a.set_primary_link(link_a);
            a.bridge = Some(bridge_a);
            let mut bridge_b = RouteEdge::default();
            bridge_b.set_primary_link(link_b);
            b.bridge = Some(bridge_b);
        }

        self.flush(FlushBehavior::Default);
        Ok(())
    }
}

/// Update portal counters after consuming a parcel and let the peer see
/// the new queue state.
fn note_local_consumption(state: &mut RouterState, dispatcher: &mut TrapEventDispatcher) {
    state.status.num_local_parcels = state.inbound_parcels.num_available_elements();
    state.status.num_local_bytes = state.inbound_parcels.total_available_bytes();
    if state.inbound_parcels.is_fully_consumed() {
        state.status.dead = true;
    }
    state
        .traps
        .update(&state.status, UpdateReason::LocalParcelConsumed, dispatcher);
    publish_queue_state(state);
}

/// Publish local queue occupancy through the central outward link, if any.
fn publish_queue_state(state: &RouterState) {
    if let Some(outward) = state.outward_edge.primary_link()
        && outward.link_type().is_central()
    {
        outward.update_inbound_queue_state(QueueState {
            num_parcels: state.status.num_local_parcels as u32,
            num_bytes: state.status.num_local_bytes as u32,
        });
    }
}
