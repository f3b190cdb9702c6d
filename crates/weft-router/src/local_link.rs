//! Link between two routers in the same process.

use std::fmt;
use std::sync::{Arc, Mutex};

use weft_core::fragment::LinkStateFragment;
use weft_core::link_state::{QueueState, RouterLinkState};
use weft_core::sequence::SequenceNumber;
use weft_core::types::{LinkSide, LinkType, NodeName, SublinkId};

use crate::link::RouterLink;
use crate::parcel::Parcel;
use crate::router::{FlushBehavior, Router, assert_no_router_mutex_held};

/// Whether a freshly created pair starts with both sides stable.
///
/// A brand-new portal pair has no history and is stable immediately. Links
/// created to replace a decaying path start unstable; each side marks
/// itself stable once its decaying links drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialLinkState {
    Stable,
    Unstable,
}

/// State shared by the two ends of a local link: the routers themselves and
/// one in-memory link-state cell.
struct SharedState {
    link_type: LinkType,
    link_state: RouterLinkState,
    routers: Mutex<[Option<Arc<Router>>; 2]>,
}

impl SharedState {
    fn router(&self, side: LinkSide) -> Option<Arc<Router>> {
        let routers = lock_ignoring_poison(&self.routers);
        routers[side_index(side)].clone()
    }

    fn drop_router(&self, side: LinkSide) {
        let mut routers = lock_ignoring_poison(&self.routers);
        routers[side_index(side)] = None;
    }
}

fn side_index(side: LinkSide) -> usize {
    if side.is_side_a() { 0 } else { 1 }
}

fn lock_ignoring_poison<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// One side of an in-process link.
pub struct LocalRouterLink {
    side: LinkSide,
    state: Arc<SharedState>,
}

impl LocalRouterLink {
    /// Create both sides of a new local link between `routers`. Local links
    /// are only ever central or bridge links.
    pub fn create_pair(
        link_type: LinkType,
        routers: (Arc<Router>, Arc<Router>),
        initial_state: InitialLinkState,
    ) -> (Arc<dyn RouterLink>, Arc<dyn RouterLink>) {
        debug_assert!(matches!(link_type, LinkType::Central | LinkType::Bridge));
        let state = Arc::new(SharedState {
            link_type,
            link_state: RouterLinkState::new(),
            routers: Mutex::new([Some(routers.0), Some(routers.1)]),
        });
        if initial_state == InitialLinkState::Stable {
            state.link_state.set_side_stable(LinkSide::A);
            state.link_state.set_side_stable(LinkSide::B);
        }
        let side_a: Arc<dyn RouterLink> = Arc::new(Self {
            side: LinkSide::A,
            state: Arc::clone(&state),
        });
        let side_b: Arc<dyn RouterLink> = Arc::new(Self {
            side: LinkSide::B,
            state,
        });
        (side_a, side_b)
    }
}

impl RouterLink for LocalRouterLink {
    fn link_type(&self) -> LinkType {
        self.state.link_type
    }

    fn local_peer(&self) -> Option<Arc<Router>> {
        self.state.router(self.side.opposite())
    }

    fn accept_parcel(&self, parcel: Parcel) {
        assert_no_router_mutex_held();
        let Some(receiver) = self.state.router(self.side.opposite()) else {
            return;
        };
        match self.state.link_type {
            LinkType::Central => {
                receiver.accept_inbound_parcel(parcel);
            }
            LinkType::Bridge => {
                // Parcels crossing a bridge leave on the other route's
                // outbound direction.
                receiver.accept_outbound_parcel(parcel);
            }
            LinkType::PeripheralInward | LinkType::PeripheralOutward => {
                debug_assert!(false, "local links are never peripheral");
            }
        }
    }

    fn accept_route_closure(&self, sequence_length: SequenceNumber) {
        assert_no_router_mutex_held();
        if let Some(receiver) = self.state.router(self.side.opposite()) {
            receiver.accept_route_closure_from(self.state.link_type, sequence_length);
        }
    }

    fn accept_route_disconnected(&self) {
        assert_no_router_mutex_held();
        if let Some(receiver) = self.state.router(self.side.opposite()) {
            receiver.accept_route_disconnected_from(self.state.link_type);
        }
    }

    fn flush_other_side_if_waiting(&self) -> bool {
        assert_no_router_mutex_held();
        let other_side = self.side.opposite();
        if !self.state.link_state.reset_waiting_bit(other_side) {
            return false;
        }
        if let Some(router) = self.state.router(other_side) {
            router.flush(FlushBehavior::ForceBypassAttempt);
        }
        true
    }

    fn deactivate(&self) {
        assert_no_router_mutex_held();
        self.state.drop_router(self.side);
    }

    fn mark_side_stable(&self) {
        self.state.link_state.set_side_stable(self.side);
    }

    fn try_lock_for_bypass(&self, bypass_request_source: NodeName) -> bool {
        if !self.state.link_state.try_lock(self.side) {
            return false;
        }
        self.state
            .link_state
            .set_allowed_bypass_request_source(bypass_request_source);
        true
    }

    fn try_lock_for_closure(&self) -> bool {
        self.state.link_state.try_lock(self.side)
    }

    fn unlock(&self) {
        self.state.link_state.unlock(self.side);
    }

    fn can_node_request_bypass(&self, bypass_request_source: NodeName) -> bool {
        let link_state = &self.state.link_state;
        link_state.is_locked_by(self.side.opposite())
            && link_state.allowed_bypass_request_source() == bypass_request_source
    }

    fn update_inbound_queue_state(&self, state: QueueState) {
        self.state.link_state.update_queue_state(self.side, state);
    }

    fn peer_queue_state(&self) -> QueueState {
        self.state.link_state.queue_state(self.side.opposite())
    }

    fn bypass_peer(&self, _bypass_target_node: NodeName, _bypass_target_sublink: SublinkId) {
        debug_assert!(false, "bypass_peer is never sent over a local link");
    }

    fn stop_proxying(
        &self,
        _inbound_sequence_length: SequenceNumber,
        _outbound_sequence_length: SequenceNumber,
    ) {
        debug_assert!(false, "stop_proxying is never sent over a local link");
    }

    fn proxy_will_stop(&self, _inbound_sequence_length: SequenceNumber) {
        debug_assert!(false, "proxy_will_stop is never sent over a local link");
    }

    fn bypass_peer_with_link(
        &self,
        _new_sublink: SublinkId,
        _new_link_state: LinkStateFragment,
        _inbound_sequence_length: SequenceNumber,
    ) {
        debug_assert!(false, "bypass_peer_with_link is never sent over a local link");
    }

    fn stop_proxying_to_local_peer(&self, _outbound_sequence_length: SequenceNumber) {
        debug_assert!(
            false,
            "stop_proxying_to_local_peer is never sent over a local link"
        );
    }

    fn describe(&self) -> String {
        format!("{} {}-side local link", self.state.link_type, self.side)
    }
}

impl fmt::Debug for LocalRouterLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalRouterLink")
            .field("side", &self.side)
            .field("link_type", &self.state.link_type)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_shares_one_link_state() {
        let (a, b) = LocalRouterLink::create_pair(
            LinkType::Central,
            (Router::new(), Router::new()),
            InitialLinkState::Unstable,
        );
        // Neither side can lock until both are stable.
        assert!(!a.try_lock_for_closure());
        a.mark_side_stable();
        assert!(!b.try_lock_for_closure());
        b.mark_side_stable();
        assert!(b.try_lock_for_closure());
        assert!(!a.try_lock_for_closure());
    }

    #[test]
    fn stable_pair_is_lockable_immediately() {
        let (a, _b) = LocalRouterLink::create_pair(
            LinkType::Central,
            (Router::new(), Router::new()),
            InitialLinkState::Stable,
        );
        assert!(a.try_lock_for_closure());
    }

    #[test]
    fn local_peer_resolves_opposite_router() {
        let router_a = Router::new();
        let router_b = Router::new();
        let (a, b) = LocalRouterLink::create_pair(
            LinkType::Central,
            (Arc::clone(&router_a), Arc::clone(&router_b)),
            InitialLinkState::Stable,
        );
        assert!(Arc::ptr_eq(&a.local_peer().unwrap(), &router_b));
        assert!(Arc::ptr_eq(&b.local_peer().unwrap(), &router_a));

        // Deactivating one side hides that side's router from the peer.
        b.deactivate();
        assert!(a.local_peer().is_none());
        assert!(b.local_peer().is_some());
    }

    #[test]
    fn queue_state_is_visible_across_the_pair() {
        let (a, b) = LocalRouterLink::create_pair(
            LinkType::Central,
            (Router::new(), Router::new()),
            InitialLinkState::Stable,
        );
        a.update_inbound_queue_state(QueueState {
            num_parcels: 2,
            num_bytes: 64,
        });
        assert_eq!(
            b.peer_queue_state(),
            QueueState {
                num_parcels: 2,
                num_bytes: 64
            }
        );
    }

    #[test]
    fn bypass_authorization_requires_peer_lock() {
        let (a, b) = LocalRouterLink::create_pair(
            LinkType::Central,
            (Router::new(), Router::new()),
            InitialLinkState::Stable,
        );
        let source = NodeName::random();
        assert!(!b.can_node_request_bypass(source));
        assert!(a.try_lock_for_bypass(source));
        assert!(b.can_node_request_bypass(source));
        assert!(!b.can_node_request_bypass(NodeName::random()));
        // The locking side itself is not authorized by its own stamp.
        assert!(!a.can_node_request_bypass(source));
    }
}
