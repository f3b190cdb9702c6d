//! The single reconciliation routine run after any router state change.

use std::sync::Arc;

use weft_core::sequence::SequenceNumber;

use crate::edge::RouteEdge;
use crate::link::RouterLink;
use crate::parcel::{Parcel, ParcelQueue};

use super::{FlushBehavior, Router};

/// A parcel staged for transmission once the router mutex is released.
type ParcelToFlush = (Arc<dyn RouterLink>, Parcel);

/// Pop every parcel from `queue` whose destined link on `edge` is already
/// known, stopping at the first one whose destination is still being
/// negotiated. Popped parcels accumulate in `parcels`.
fn collect_parcels_to_flush(
    queue: &mut ParcelQueue,
    edge: &RouteEdge,
    parcels: &mut Vec<ParcelToFlush>,
) {
    while queue.has_next_element() {
        let n = queue.current_sequence_number();
        let link = if edge.should_transmit_on_decaying_link(n) {
            edge.decaying_link()
        } else {
            edge.primary_link()
        };
        let Some(link) = link else {
            return;
        };
        let Some(parcel) = queue.pop() else {
            return;
        };
        parcels.push((Arc::clone(link), parcel));
    }
}

impl Router {
    /// Reconcile queued work with the current link topology.
    ///
    /// Everything that can re-enter another router — parcel transmission,
    /// closure propagation, link deactivation, bypass initiation — is
    /// staged under the mutex and performed after release.
    pub fn flush(self: &Arc<Self>, behavior: FlushBehavior) {
        let outward_link;
        let inward_link;
        let mut bridge_link = None;
        let decaying_outward_link;
        let decaying_inward_link;
        let mut dead_outward_link = None;
        let mut dead_inward_link = None;
        let mut dead_bridge_link = None;
        let mut final_inward_sequence_length: Option<SequenceNumber> = None;
        let mut final_outward_sequence_length: Option<SequenceNumber> = None;
        let on_central_link;
        let mut inward_link_decayed = false;
        let mut outward_link_decayed = false;
        let mut dropped_last_decaying_link = false;
        let mut parcels_to_flush: Vec<ParcelToFlush> = Vec::new();
        {
            let mut state = self.lock_state();
            let state = &mut *state;

            outward_link = state.outward_edge.primary_link().cloned();
            inward_link = state
                .inward_edge
                .as_ref()
                .and_then(|edge| edge.primary_link().cloned());
            decaying_outward_link = state.outward_edge.decaying_link().cloned();
            decaying_inward_link = state
                .inward_edge
                .as_ref()
                .and_then(|edge| edge.decaying_link().cloned());
            on_central_link = outward_link
                .as_ref()
                .is_some_and(|link| link.link_type().is_central());
            if let Some(bridge) = state.bridge.as_ref() {
                // A bridge has either a primary link or a decaying link,
                // never both.
                bridge_link = bridge.primary_link().or(bridge.decaying_link()).cloned();
            }

            collect_parcels_to_flush(
                &mut state.outbound_parcels,
                &state.outward_edge,
                &mut parcels_to_flush,
            );
            let outbound_sequence_length_sent = state.outbound_parcels.current_sequence_number();
            let inbound_sequence_length_received = state.inbound_parcels.sequence_length();
            if state
                .outward_edge
                .maybe_finish_decay(outbound_sequence_length_sent, inbound_sequence_length_received)
            {
                tracing::debug!(
                    sent = %outbound_sequence_length_sent,
                    received = %inbound_sequence_length_received,
                    "outward link fully decayed"
                );
                outward_link_decayed = true;
            }

            if let Some(inward) = state.inward_edge.as_mut() {
                collect_parcels_to_flush(
                    &mut state.inbound_parcels,
                    inward,
                    &mut parcels_to_flush,
                );
                let inbound_sequence_length_sent = state.inbound_parcels.current_sequence_number();
                let outbound_sequence_length_received = state.outbound_parcels.sequence_length();
                if inward.maybe_finish_decay(
                    inbound_sequence_length_sent,
                    outbound_sequence_length_received,
                ) {
                    tracing::debug!(
                        sent = %inbound_sequence_length_sent,
                        received = %outbound_sequence_length_received,
                        "inward link fully decayed"
                    );
                    inward_link_decayed = true;
                }
            } else if bridge_link.is_some()
                && let Some(bridge) = state.bridge.as_ref()
            {
                collect_parcels_to_flush(
                    &mut state.inbound_parcels,
                    bridge,
                    &mut parcels_to_flush,
                );
            }

            let bridge_decayed = match state.bridge.as_mut() {
                Some(bridge) => bridge.maybe_finish_decay(
                    state.inbound_parcels.current_sequence_number(),
                    state.outbound_parcels.current_sequence_number(),
                ),
                None => false,
            };
            if bridge_decayed {
                state.bridge = None;
            }

            // Dropping the last decaying link may leave this router fully
            // stable, which unblocks bypass attempts on the other side of
            // the central link.
            let inward_edge_stable = decaying_inward_link.is_none() || inward_link_decayed;
            let outward_edge_stable =
                outward_link.is_some() && (decaying_outward_link.is_none() || outward_link_decayed);
            let both_edges_stable = inward_edge_stable && outward_edge_stable;
            let either_link_decayed = inward_link_decayed || outward_link_decayed;
            if on_central_link && either_link_decayed && both_edges_stable {
                if let Some(outward) = outward_link.as_ref() {
                    outward.mark_side_stable();
                }
                dropped_last_decaying_link = true;
            }

            if on_central_link
                && state.outbound_parcels.is_fully_consumed()
                && outward_link
                    .as_ref()
                    .is_some_and(|link| link.try_lock_for_closure())
            {
                // This end has nothing more to send and the peer is not
                // mid-mutation: the route can be closed from here. The
                // closure itself is sent below, after the mutex drops.
                final_outward_sequence_length = state.outbound_parcels.final_length();
                dead_outward_link = state.outward_edge.release_primary_link();
            } else if !state.inbound_parcels.expects_more_elements() {
                // The other end is gone and everything it sent has arrived;
                // the outward link has no further use.
                dead_outward_link = state.outward_edge.release_primary_link();
            }

            if state.inbound_parcels.is_fully_consumed() {
                // Nothing further will arrive or be forwarded inward, so
                // closure can propagate inward and the inward link can go.
                final_inward_sequence_length = state.inbound_parcels.final_length();
                if let Some(inward) = state.inward_edge.as_mut() {
                    dead_inward_link = inward.release_primary_link();
                } else {
                    dead_bridge_link = bridge_link.take();
                    state.bridge = None;
                }
            }
        }

        for (link, parcel) in parcels_to_flush {
            link.accept_parcel(parcel);
        }

        if outward_link_decayed
            && let Some(link) = decaying_outward_link.as_ref()
        {
            link.deactivate();
        }
        if inward_link_decayed
            && let Some(link) = decaying_inward_link.as_ref()
        {
            link.deactivate();
        }

        if bridge_link.is_some()
            && outward_link.is_some()
            && inward_link.is_none()
            && (decaying_inward_link.is_none() || inward_link_decayed)
            && (decaying_outward_link.is_none() || outward_link_decayed)
        {
            self.maybe_start_bridge_bypass();
        }

        let outward_link_dead = dead_outward_link.is_some();
        if let Some(link) = dead_outward_link {
            if let Some(length) = final_outward_sequence_length {
                tracing::debug!(link = link.describe(), %length, "closing route outward");
                link.accept_route_closure(length);
            }
            link.deactivate();
        }
        if let Some(link) = dead_inward_link {
            if let Some(length) = final_inward_sequence_length {
                link.accept_route_closure(length);
            }
            link.deactivate();
        }
        if let Some(link) = dead_bridge_link {
            if let Some(length) = final_inward_sequence_length {
                link.accept_route_closure(length);
            }
        }

        if outward_link_dead || !on_central_link {
            return;
        }

        if !dropped_last_decaying_link && behavior != FlushBehavior::ForceBypassAttempt {
            // No relevant state change, so no new bypass opportunity.
            return;
        }

        if inward_link.is_some() && self.maybe_start_self_bypass() {
            return;
        }

        if let Some(outward) = outward_link {
            outward.flush_other_side_if_waiting();
        }
    }
}
