//! Turning a router into a descriptor and back, when its portal crosses a
//! node link.

use std::sync::Arc;

use weft_core::types::{LinkSide, LinkType};

use crate::link::RouterLink;
use crate::node_link::NodeLink;
use crate::trap::TrapEventDispatcher;
use crate::wire::RouterDescriptor;

use super::{FlushBehavior, Router};

impl Router {
    /// Prepare this router for transmission to the node behind
    /// `to_node_link`.
    ///
    /// The router becomes a proxy here and now: an inward edge is installed
    /// (still linkless, so no traffic flows yet) and a remote link is
    /// pre-registered on the new sublink so that the destination can talk
    /// about it the moment the descriptor lands. The inward edge gets its
    /// link only in [`begin_proxying_to_new_router`], after the descriptor
    /// is actually on the wire.
    ///
    /// [`begin_proxying_to_new_router`]: Self::begin_proxying_to_new_router
    pub fn serialize_new_router(
        self: &Arc<Self>,
        to_node_link: &Arc<NodeLink>,
    ) -> RouterDescriptor {
        let mut dispatcher = TrapEventDispatcher::new();
        let new_sublink = to_node_link.memory().allocate_sublink_ids(1);
        let mut descriptor = RouterDescriptor {
            new_sublink,
            next_outgoing_sequence_number: Default::default(),
            next_incoming_sequence_number: Default::default(),
            peer_closed: false,
            closed_peer_sequence_length: Default::default(),
        };
        {
            let mut state = self.lock_state();
            let state = &mut *state;
            state.traps.remove_all(&mut dispatcher);

            descriptor.next_outgoing_sequence_number = state.outbound_parcels.sequence_length();
            descriptor.next_incoming_sequence_number =
                state.inbound_parcels.current_sequence_number();

            // Install the inward edge with no link: from this point the
            // router no longer looks terminal, which matters to anything
            // that races with the transmission below.
            let mut inward_edge = crate::edge::RouteEdge::default();

            if state.status.peer_closed {
                descriptor.peer_closed = true;
                debug_assert!(state.inbound_parcels.final_length().is_some());
                let final_length = state.inbound_parcels.final_length().unwrap_or_default();
                descriptor.closed_peer_sequence_length = final_length;

                // The new inward link will never carry anything beyond what
                // is already known, so let it decay the moment it exists.
                inward_edge.begin_primary_link_decay();
                inward_edge.set_length_to_decaying_link(final_length);
                inward_edge
                    .set_length_from_decaying_link(state.outbound_parcels.current_sequence_number());
            }
            state.inward_edge = Some(inward_edge);

            // Register the sublink now so that peer messages about it find
            // this router, but do not hand the link to the inward edge yet:
            // nothing may be transmitted on the sublink before the
            // descriptor itself.
            let new_link = to_node_link.add_remote_router_link(
                new_sublink,
                None,
                LinkType::PeripheralInward,
                LinkSide::A,
                Arc::clone(self),
            );
            if let Some(link) = new_link {
                tracing::debug!(link = link.describe(), "extending route to a new router");
            }
        }
        descriptor
    }

    /// Start forwarding to the router described by an earlier
    /// [`serialize_new_router`](Self::serialize_new_router), now that its
    /// descriptor has been transmitted.
    pub fn begin_proxying_to_new_router(
        self: &Arc<Self>,
        to_node_link: &Arc<NodeLink>,
        descriptor: &RouterDescriptor,
    ) {
        let mut rejected_link = None;
        if let Some(sublink) = to_node_link.get_sublink(descriptor.new_sublink) {
            let new_router_link = sublink.router_link;
            {
                let mut state = self.lock_state();
                let state = &mut *state;
                debug_assert!(state.inward_edge.is_some());

                if state.outbound_parcels.final_length().is_none() && !state.is_disconnected {
                    tracing::debug!(
                        link = new_router_link.describe(),
                        "proxying to the new router"
                    );
                    if let Some(inward) = state.inward_edge.as_mut() {
                        inward.set_primary_link(new_router_link);
                        if let Some(outward) = state.outward_edge.primary_link()
                            && state.outward_edge.is_stable()
                            && inward.is_stable()
                        {
                            outward.mark_side_stable();
                        }
                    }
                } else {
                    // The route died while the descriptor was in flight;
                    // the new router must find out.
                    rejected_link = Some(new_router_link);
                }
            }

            if let Some(link) = rejected_link {
                tracing::debug!(link = link.describe(), "dropping link to the new router");
                link.accept_route_disconnected();
                link.deactivate();
                return;
            }
        }

        // Inbound parcels may have queued while the descriptor was in
        // flight; give them a chance to move.
        self.flush(FlushBehavior::ForceBypassAttempt);
    }

    /// Reconstruct a terminal router from a received descriptor.
    ///
    /// Returns `None` only for a descriptor no well-behaved peer produces.
    pub fn deserialize(
        descriptor: &RouterDescriptor,
        from_node_link: &Arc<NodeLink>,
    ) -> Option<Arc<Router>> {
        let router = Router::new();
        let mut disconnected = false;
        {
            let mut state = router.lock_state();
            let state = &mut *state;
            state
                .outbound_parcels
                .reset_initial_sequence_number(descriptor.next_outgoing_sequence_number);
            state
                .inbound_parcels
                .reset_initial_sequence_number(descriptor.next_incoming_sequence_number);
            if descriptor.peer_closed {
                state.status.peer_closed = true;
                if !state
                    .inbound_parcels
                    .set_final_length(descriptor.closed_peer_sequence_length)
                {
                    return None;
                }
                if state.inbound_parcels.is_fully_consumed() {
                    state.status.dead = true;
                }
            }

            let new_link = from_node_link.add_remote_router_link(
                descriptor.new_sublink,
                None,
                LinkType::PeripheralOutward,
                LinkSide::B,
                Arc::clone(&router),
            );
            match new_link {
                Some(link) => {
                    tracing::debug!(
                        link = link.describe(),
                        "route extended to a deserialized router"
                    );
                    state.outward_edge.set_primary_link(link);
                }
                // The node link died or the sublink id was reused. The
                // latter implies a misbehaving peer but is harmless to
                // absorb as an immediate disconnect.
                None if !descriptor.peer_closed => disconnected = true,
                None => {}
            }
        }

        if disconnected {
            tracing::debug!("new router disconnected immediately after deserialization");
            router.accept_route_disconnected_from(LinkType::PeripheralOutward);
        }
        router.flush(FlushBehavior::ForceBypassAttempt);
        Some(router)
    }
}
