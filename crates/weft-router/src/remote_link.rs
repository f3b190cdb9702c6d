//! Link to a router on another node, multiplexed over a node link.
//!
//! Every capability is translated into a wire message on the owning
//! [`NodeLink`]. The link-state fragment backing a central link may be
//! *pending* when the link is created — its buffer not yet shared with this
//! side — in which case the link parks a one-shot waiter and finishes
//! installing the state when the buffer arrives. A `MarkSideStable` that
//! happens in the meantime is remembered and replayed.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use weft_core::fragment::{LinkStateFragment, LinkStateRef};
use weft_core::link_state::QueueState;
use weft_core::sequence::SequenceNumber;
use weft_core::types::{LinkSide, LinkType, NodeName, SublinkId};

use crate::link::RouterLink;
use crate::node_link::NodeLink;
use crate::parcel::{Parcel, ParcelObject};
use crate::router::{FlushBehavior, Router, assert_no_router_mutex_held};
use crate::wire::{HandleType, Message, RouterDescriptor};

pub struct RemoteRouterLink {
    self_ref: Weak<RemoteRouterLink>,
    node_link: Arc<NodeLink>,
    sublink: SublinkId,
    link_type: LinkType,
    side: LinkSide,
    link_state: Mutex<Option<LinkStateRef>>,
    /// Records an early `mark_side_stable` so it can be applied once the
    /// link-state fragment becomes addressable.
    side_is_stable: AtomicBool,
}

impl RemoteRouterLink {
    /// Create a new remote link. Central links must be given a link-state
    /// fragment; peripheral links must not.
    pub(crate) fn new(
        node_link: Arc<NodeLink>,
        sublink: SublinkId,
        link_state: Option<LinkStateFragment>,
        link_type: LinkType,
        side: LinkSide,
    ) -> Arc<Self> {
        debug_assert_eq!(link_type.is_central(), link_state.is_some());
        let link = Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            node_link,
            sublink,
            link_type,
            side,
            link_state: Mutex::new(None),
            side_is_stable: AtomicBool::new(false),
        });
        if let Some(fragment) = link_state {
            link.set_link_state(fragment);
        }
        link
    }

    pub fn node_link(&self) -> &Arc<NodeLink> {
        &self.node_link
    }

    pub fn sublink(&self) -> SublinkId {
        self.sublink
    }

    pub fn side(&self) -> LinkSide {
        self.side
    }

    /// Adopt the link-state fragment. A pending fragment parks a waiter on
    /// its buffer and re-enters here once the mapping arrives.
    pub fn set_link_state(self: &Arc<Self>, fragment: LinkStateFragment) {
        debug_assert!(self.link_type.is_central());
        match fragment {
            LinkStateFragment::Pending(descriptor) => {
                let memory = Arc::clone(self.node_link.memory());
                let link = Arc::clone(self);
                self.node_link.memory().wait_for_buffer(
                    descriptor.buffer_id,
                    Box::new(move || match memory.get_fragment(descriptor) {
                        Some(fragment) => link.set_link_state(fragment),
                        None => {
                            tracing::error!(
                                link = link.describe(),
                                ?descriptor,
                                "link-state fragment resolved out of bounds"
                            );
                        }
                    }),
                );
            }
            LinkStateFragment::Addressable(state) => {
                {
                    let mut slot = lock_ignoring_poison(&self.link_state);
                    debug_assert!(slot.is_none(), "link state adopted twice");
                    *slot = Some(state);
                }
                // Replay a stability mark that raced the buffer share.
                if self.side_is_stable.load(Ordering::Acquire) {
                    self.mark_side_stable();
                }
                if let Some(router) = self.node_link.get_router(self.sublink) {
                    router.flush(FlushBehavior::Default);
                }
            }
        }
    }

    fn state(&self) -> Option<LinkStateRef> {
        lock_ignoring_poison(&self.link_state).clone()
    }

    fn transmit(&self, message: Message) {
        self.node_link.transmit(message, Vec::new());
    }
}

fn lock_ignoring_poison<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl RouterLink for RemoteRouterLink {
    fn link_type(&self) -> LinkType {
        self.link_type
    }

    fn local_peer(&self) -> Option<Arc<Router>> {
        None
    }

    fn as_remote(&self) -> Option<Arc<RemoteRouterLink>> {
        self.self_ref.upgrade()
    }

    fn accept_parcel(&self, mut parcel: Parcel) {
        assert_no_router_mutex_held();

        // Serialize attachments. Portals become router descriptors and turn
        // their routers into proxies; boxes contribute driver objects.
        let objects = parcel.take_objects();
        let mut handle_types = Vec::with_capacity(objects.len());
        let mut new_routers = Vec::new();
        let mut driver_objects = Vec::new();
        let mut routers_to_proxy: Vec<(Arc<Router>, RouterDescriptor)> = Vec::new();
        for object in objects {
            match object {
                ParcelObject::Portal(router) => {
                    let descriptor = router.serialize_new_router(&self.node_link);
                    handle_types.push(HandleType::Portal);
                    new_routers.push(descriptor.clone());
                    routers_to_proxy.push((router, descriptor));
                }
                ParcelObject::Box(object) => {
                    handle_types.push(HandleType::Box);
                    driver_objects.push(object);
                }
            }
        }

        tracing::trace!(link = self.describe(), %parcel, "transmitting parcel");

        let num_driver_objects = driver_objects.len() as u32;
        self.node_link.transmit(
            Message::AcceptParcel {
                sublink: self.sublink,
                sequence_number: parcel.sequence_number(),
                data: parcel.data().to_vec(),
                handle_types,
                new_routers,
                num_driver_objects,
            },
            driver_objects,
        );

        // Only now that the descriptors are on the wire may the serialized
        // routers start proxying: the peer cannot route messages for a
        // sublink it has never heard of.
        for (router, descriptor) in routers_to_proxy {
            router.begin_proxying_to_new_router(&self.node_link, &descriptor);
        }
    }

    fn accept_route_closure(&self, sequence_length: SequenceNumber) {
        assert_no_router_mutex_held();
        self.transmit(Message::RouteClosed {
            sublink: self.sublink,
            sequence_length,
        });
    }

    fn accept_route_disconnected(&self) {
        assert_no_router_mutex_held();
        self.transmit(Message::RouteDisconnected {
            sublink: self.sublink,
        });
    }

    fn flush_other_side_if_waiting(&self) -> bool {
        assert_no_router_mutex_held();
        let Some(state) = self.state() else {
            return false;
        };
        if !state.reset_waiting_bit(self.side.opposite()) {
            return false;
        }
        self.transmit(Message::FlushRouter {
            sublink: self.sublink,
        });
        true
    }

    fn deactivate(&self) {
        assert_no_router_mutex_held();
        self.node_link.remove_sublink(self.sublink);
    }

    fn mark_side_stable(&self) {
        self.side_is_stable.store(true, Ordering::Release);
        if let Some(state) = self.state() {
            state.set_side_stable(self.side);
        }
    }

    fn try_lock_for_bypass(&self, bypass_request_source: NodeName) -> bool {
        let Some(state) = self.state() else {
            return false;
        };
        if !state.try_lock(self.side) {
            return false;
        }
        state.set_allowed_bypass_request_source(bypass_request_source);
        true
    }

    fn try_lock_for_closure(&self) -> bool {
        self.state().is_some_and(|state| state.try_lock(self.side))
    }

    fn unlock(&self) {
        if let Some(state) = self.state() {
            state.unlock(self.side);
        }
    }

    fn can_node_request_bypass(&self, bypass_request_source: NodeName) -> bool {
        self.state().is_some_and(|state| {
            state.is_locked_by(self.side.opposite())
                && state.allowed_bypass_request_source() == bypass_request_source
        })
    }

    fn update_inbound_queue_state(&self, queue_state: QueueState) {
        if let Some(state) = self.state() {
            state.update_queue_state(self.side, queue_state);
        }
    }

    fn peer_queue_state(&self) -> QueueState {
        self.state()
            .map(|state| state.queue_state(self.side.opposite()))
            .unwrap_or_default()
    }

    fn bypass_peer(&self, bypass_target_node: NodeName, bypass_target_sublink: SublinkId) {
        assert_no_router_mutex_held();
        self.transmit(Message::BypassPeer {
            sublink: self.sublink,
            bypass_target_node,
            bypass_target_sublink,
        });
    }

    fn stop_proxying(
        &self,
        inbound_sequence_length: SequenceNumber,
        outbound_sequence_length: SequenceNumber,
    ) {
        assert_no_router_mutex_held();
        self.transmit(Message::StopProxying {
            sublink: self.sublink,
            inbound_sequence_length,
            outbound_sequence_length,
        });
    }

    fn proxy_will_stop(&self, inbound_sequence_length: SequenceNumber) {
        assert_no_router_mutex_held();
        self.transmit(Message::ProxyWillStop {
            sublink: self.sublink,
            inbound_sequence_length,
        });
    }

    fn bypass_peer_with_link(
        &self,
        new_sublink: SublinkId,
        new_link_state: LinkStateFragment,
        inbound_sequence_length: SequenceNumber,
    ) {
        assert_no_router_mutex_held();
        self.transmit(Message::BypassPeerWithLink {
            sublink: self.sublink,
            new_sublink,
            new_link_state: new_link_state.descriptor(),
            inbound_sequence_length,
        });
    }

    fn stop_proxying_to_local_peer(&self, outbound_sequence_length: SequenceNumber) {
        assert_no_router_mutex_held();
        self.transmit(Message::StopProxyingToLocalPeer {
            sublink: self.sublink,
            outbound_sequence_length,
        });
    }

    fn describe(&self) -> String {
        format!(
            "{} link from {} to {} via sublink {}",
            self.link_type,
            self.node_link.local_node_name(),
            self.node_link.remote_node_name(),
            self.sublink
        )
    }
}

impl fmt::Debug for RemoteRouterLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteRouterLink")
            .field("sublink", &self.sublink)
            .field("link_type", &self.link_type)
            .field("side", &self.side)
            .finish_non_exhaustive()
    }
}
