//! The proxy-bypass protocol: teaching a proxy's neighbors to talk to each
//! other directly so the proxy can decay away.
//!
//! Roles, for one bypass: `P` is the proxy, `I` its inward peer (one hop
//! toward the moved portal), `O` its outward peer. `P` initiates by locking
//! the `P↔O` link state, stamping `I`'s node name as the only node allowed
//! to follow up with a replacement link. The replacement negotiates a pair
//! of sequence lengths that split traffic exactly once between the old
//! path and the new link; the old links then decay under the ordinary
//! flush machinery.
//!
//! Merge bridges reuse the same machinery with the bridge pair acting as a
//! two-router proxy, in three variants by locality of the two outward
//! peers.

use std::sync::Arc;

use weft_core::fragment::LinkStateFragment;
use weft_core::sequence::SequenceNumber;
use weft_core::types::{LinkSide, LinkType, NodeName, SublinkId};

use crate::link::{RouterLink, same_link};
use crate::local_link::{InitialLinkState, LocalRouterLink};
use crate::multi_lock::{lock_four, lock_three, lock_two};
use crate::node_link::NodeLink;
use crate::remote_link::RemoteRouterLink;

use super::{FlushBehavior, Router};

impl Router {
    /// Handle `BypassPeer` at `I`: the proxy behind `requestor` wants out,
    /// and the replacement route goes to
    /// `(bypass_target_node, bypass_target_sublink)` — `O`'s side of the
    /// `P↔O` link.
    pub fn bypass_peer(
        self: &Arc<Self>,
        requestor: &Arc<RemoteRouterLink>,
        bypass_target_node: NodeName,
        bypass_target_sublink: SublinkId,
    ) -> bool {
        let from_node_link = Arc::clone(requestor.node_link());

        // Only our own outward peer may ask us to bypass it.
        {
            let state = self.lock_state();
            let Some(outward_link) = state.outward_edge.primary_link() else {
                // Already disconnected by some other failure along the
                // route; not the requestor's fault.
                return true;
            };
            if !same_link(outward_link.as_ref(), requestor.as_ref()) {
                tracing::error!(
                    requestor = requestor.describe(),
                    "rejecting bypass request from a link that is not our outward peer"
                );
                return false;
            }
        }

        if bypass_target_node != from_node_link.local_node_name() {
            // `O` lives on a third node: we need a link to it, possibly via
            // introduction.
            if let Some(link_to_target) = from_node_link.node().get_link(bypass_target_node) {
                let fragment = link_to_target.memory().try_allocate_router_link_state();
                return self.bypass_peer_with_new_remote_link(
                    Arc::clone(requestor),
                    link_to_target,
                    bypass_target_sublink,
                    fragment,
                );
            }

            let router = Arc::clone(self);
            let requestor = Arc::clone(requestor);
            from_node_link.node().establish_link(
                bypass_target_node,
                Box::new(move |link_to_target| {
                    let Some(link_to_target) = link_to_target else {
                        tracing::error!("disconnecting router after failed introduction");
                        router.accept_route_disconnected_from(LinkType::PeripheralOutward);
                        return;
                    };
                    let fragment = link_to_target.memory().try_allocate_router_link_state();
                    router.bypass_peer_with_new_remote_link(
                        requestor,
                        link_to_target,
                        bypass_target_sublink,
                        fragment,
                    );
                }),
            );
            return true;
        }

        // `O` lives on our own node.
        self.bypass_peer_with_new_local_link(requestor, bypass_target_sublink)
    }

    /// `I`'s half of a remote bypass: decay the old outward link toward the
    /// proxy, open a replacement central link to `O`'s node, and hand `O`
    /// everything it needs over `AcceptBypassLink`.
    fn bypass_peer_with_new_remote_link(
        self: &Arc<Self>,
        requestor: Arc<RemoteRouterLink>,
        node_link: Arc<NodeLink>,
        bypass_target_sublink: SublinkId,
        new_link_state: Option<LinkStateFragment>,
    ) -> bool {
        let Some(new_link_state) = new_link_state else {
            // No capacity for a new link state yet; retry when allocation
            // completes.
            let router = Arc::clone(self);
            let memory = Arc::clone(node_link.memory());
            let node_link_for_retry = Arc::clone(&node_link);
            memory.allocate_router_link_state(Box::new(move |fragment| {
                router.bypass_peer_with_new_remote_link(
                    requestor,
                    node_link_for_retry,
                    bypass_target_sublink,
                    Some(fragment),
                );
            }));
            return true;
        };

        let new_sublink = node_link.memory().allocate_sublink_ids(1);
        let length_to_decaying_link;
        let new_link;
        {
            let mut state = self.lock_state();
            let state = &mut *state;
            if state.outward_edge.primary_link().is_none() || state.is_disconnected {
                // Disconnected while setting this up; not the requestor's
                // fault.
                return true;
            }
            if !state.outward_edge.begin_primary_link_decay() {
                tracing::error!("rejecting bypass: outward link is already decaying");
                return false;
            }

            // Everything already sent through the proxy stays on the old
            // path; everything beyond rides the new link.
            length_to_decaying_link = state.outbound_parcels.current_sequence_number();
            state
                .outward_edge
                .set_length_to_decaying_link(length_to_decaying_link);
            // The initiator of a bypass takes side A of the new link.
            new_link = node_link.add_remote_router_link(
                new_sublink,
                Some(new_link_state.clone()),
                LinkType::Central,
                LinkSide::A,
                Arc::clone(self),
            );
        }

        let Some(new_link) = new_link else {
            self.accept_route_disconnected_from(LinkType::Central);
            return true;
        };

        tracing::debug!(
            proxy = %requestor.node_link().remote_node_name(),
            target = %node_link.remote_node_name(),
            %new_sublink,
            %length_to_decaying_link,
            "sending bypass link to the proxy's outward peer"
        );
        node_link.transmit(
            crate::wire::Message::AcceptBypassLink {
                proxy_node: requestor.node_link().remote_node_name(),
                proxy_sublink: bypass_target_sublink,
                inbound_sequence_length: length_to_decaying_link,
                new_sublink,
                new_link_state: new_link_state.descriptor(),
            },
            Vec::new(),
        );

        // Installed only after the message above is on the wire: a parcel
        // racing onto `new_sublink` first would be unroutable at `O`.
        self.set_outward_link(new_link);
        true
    }

    /// Handle `AcceptBypassLink` / `BypassPeerWithLink` at `O`: adopt the
    /// replacement link and tell the proxy (and, for a three-node bypass,
    /// our new peer) where traffic splits.
    pub fn accept_bypass_link(
        self: &Arc<Self>,
        new_node_link: &Arc<NodeLink>,
        new_sublink: SublinkId,
        new_link_state: LinkStateFragment,
        inbound_sequence_length_from_bypassed_link: SequenceNumber,
    ) -> bool {
        let length_to_proxy_from_us;
        let old_link;
        let new_link;
        {
            let mut state = self.lock_state();
            let state = &mut *state;
            if state.is_disconnected || state.outward_edge.primary_link().is_none() {
                tracing::debug!("discarding bypass link for an already-disconnected route");
                return true;
            }

            let outward_link = state
                .outward_edge
                .primary_link()
                .cloned()
                .expect("checked above");
            let Some(remote_outward) = outward_link.as_remote() else {
                // Only a remote outward peer can be bypassed this way.
                tracing::debug!("rejecting unexpected bypass link");
                return false;
            };
            old_link = remote_outward;

            if !Arc::ptr_eq(old_link.node_link(), new_node_link)
                && !outward_link.can_node_request_bypass(new_node_link.remote_node_name())
            {
                // The new link must either come from the same node as the
                // old one, or from the node the proxy stamped when locking.
                tracing::error!("rejecting unauthorized bypass");
                return false;
            }

            length_to_proxy_from_us = state.outbound_parcels.current_sequence_number();
            if !state.outward_edge.begin_primary_link_decay() {
                tracing::error!("rejecting bypass: outward link is already decaying");
                return false;
            }

            // The bypass initiator took side A, so we take side B.
            new_link = new_node_link.add_remote_router_link(
                new_sublink,
                Some(new_link_state),
                LinkType::Central,
                LinkSide::B,
                Arc::clone(self),
            );
            if let Some(link) = new_link.as_ref() {
                tracing::debug!(
                    old = old_link.describe(),
                    new = link.describe(),
                    %length_to_proxy_from_us,
                    length_from_proxy = %inbound_sequence_length_from_bypassed_link,
                    "bypassing the proxy on the other end of the old link"
                );
                state
                    .outward_edge
                    .set_length_to_decaying_link(length_to_proxy_from_us);
                state
                    .outward_edge
                    .set_length_from_decaying_link(inbound_sequence_length_from_bypassed_link);
                let adopted: Arc<dyn RouterLink> = link.clone();
                state.outward_edge.set_primary_link(adopted);
            }
        }

        let Some(new_link) = new_link else {
            self.accept_route_disconnected_from(LinkType::Central);
            return true;
        };

        if Arc::ptr_eq(new_link.node_link(), old_link.node_link()) {
            // The proxy sits between us and the same node the new link goes
            // to: it has already conspired with its local outward peer, and
            // only needs to know when to stop.
            old_link.stop_proxying_to_local_peer(length_to_proxy_from_us);
        } else {
            old_link.stop_proxying(
                length_to_proxy_from_us,
                inbound_sequence_length_from_bypassed_link,
            );
            new_link.proxy_will_stop(length_to_proxy_from_us);
        }

        self.flush(FlushBehavior::Default);
        true
    }

    /// Handle `StopProxying` at `P`: both negotiated lengths are in; record
    /// them on every decaying edge so flushes can finish the decay.
    pub fn stop_proxying(
        self: &Arc<Self>,
        inbound_sequence_length: SequenceNumber,
        outbound_sequence_length: SequenceNumber,
    ) -> bool {
        let mut bridge_peer = None;
        {
            let mut state = self.lock_state();
            let state = &mut *state;
            if state.outward_edge.is_stable() {
                // A proxy starts decaying its links before asking to be
                // bypassed and never adopts new ones; a stable edge means
                // this request is bogus.
                tracing::error!("rejecting stop_proxying on a non-proxying router");
                return false;
            }

            if let Some(bridge) = state.bridge.as_ref() {
                // The other half of the bridge pair needs the same lengths.
                bridge_peer = bridge.get_decaying_local_peer();
                if bridge_peer.is_none() {
                    return false;
                }
            } else if state.inward_edge.as_ref().is_none_or(|edge| edge.is_stable()) {
                return false;
            } else if let Some(inward) = state.inward_edge.as_mut() {
                inward.set_length_to_decaying_link(inbound_sequence_length);
                inward.set_length_from_decaying_link(outbound_sequence_length);
                state
                    .outward_edge
                    .set_length_to_decaying_link(outbound_sequence_length);
                state
                    .outward_edge
                    .set_length_from_decaying_link(inbound_sequence_length);
            }
        }

        if let Some(bridge_peer) = bridge_peer.as_ref() {
            let (mut a, mut b) = lock_two(self, bridge_peer);
            let bridges_decaying = a.bridge.as_ref().is_some_and(|bridge| !bridge.is_stable())
                && b.bridge.as_ref().is_some_and(|bridge| !bridge.is_stable());
            if !bridges_decaying {
                // The bridge is being (or has been) torn down; nothing to
                // record.
                return true;
            }
            if let Some(bridge) = a.bridge.as_mut() {
                bridge.set_length_to_decaying_link(inbound_sequence_length);
                bridge.set_length_from_decaying_link(outbound_sequence_length);
            }
            a.outward_edge
                .set_length_to_decaying_link(outbound_sequence_length);
            a.outward_edge
                .set_length_from_decaying_link(inbound_sequence_length);
            if let Some(bridge) = b.bridge.as_mut() {
                bridge.set_length_to_decaying_link(outbound_sequence_length);
                bridge.set_length_from_decaying_link(inbound_sequence_length);
            }
            b.outward_edge
                .set_length_to_decaying_link(inbound_sequence_length);
            b.outward_edge
                .set_length_from_decaying_link(outbound_sequence_length);
        }

        self.flush(FlushBehavior::Default);
        if let Some(bridge_peer) = bridge_peer {
            bridge_peer.flush(FlushBehavior::Default);
        }
        true
    }

    /// Handle `ProxyWillStop` at `I`: the proxy's inbound forwarding ends
    /// at `inbound_sequence_length`.
    pub fn notify_proxy_will_stop(
        self: &Arc<Self>,
        inbound_sequence_length: SequenceNumber,
    ) -> bool {
        {
            let mut state = self.lock_state();
            if state.outward_edge.is_stable() {
                // Either bogus, or we already lost every link to
                // disconnection; only the former is a violation.
                return state.is_disconnected;
            }

            tracing::debug!(
                %inbound_sequence_length,
                "bypassed proxy will stop forwarding inbound parcels"
            );
            state
                .outward_edge
                .set_length_from_decaying_link(inbound_sequence_length);
        }

        self.flush(FlushBehavior::Default);
        true
    }

    /// Handle `StopProxyingToLocalPeer` at `P` whose outward peer shares
    /// its node: record the single negotiated outbound length across the
    /// local router pair (or triple, with a bridge).
    pub fn stop_proxying_to_local_peer(
        self: &Arc<Self>,
        outbound_sequence_length: SequenceNumber,
    ) -> bool {
        let local_peer;
        let bridge_peer;
        {
            let state = self.lock_state();
            if let Some(bridge) = state.bridge.as_ref() {
                bridge_peer = bridge.get_decaying_local_peer();
                local_peer = None;
            } else if let Some(decaying) = state.outward_edge.decaying_link() {
                local_peer = decaying.local_peer();
                bridge_peer = None;
            } else {
                // Ignore if we have been unexpectedly disconnected.
                return state.is_disconnected;
            }
        }

        if let (Some(peer), None) = (local_peer.as_ref(), bridge_peer.as_ref()) {
            // Common case: no bridge.
            let (mut a, mut b) = lock_two(self, peer);
            let our_link = a.outward_edge.decaying_link().cloned();
            let peer_link = b.outward_edge.decaying_link().cloned();
            let (Some(our_link), Some(peer_link)) = (our_link, peer_link) else {
                // Either router got disconnected in the meantime.
                return true;
            };

            let links_consistent = our_link
                .local_peer()
                .is_some_and(|router| Arc::ptr_eq(&router, peer))
                && peer_link
                    .local_peer()
                    .is_some_and(|router| Arc::ptr_eq(&router, self));
            if a.inward_edge.is_none() || !links_consistent {
                tracing::error!("rejecting stop_proxying_to_local_peer at an invalid proxy");
                return false;
            }

            tracing::debug!(%outbound_sequence_length, "stopping proxy to local peer");
            b.outward_edge
                .set_length_from_decaying_link(outbound_sequence_length);
            a.outward_edge
                .set_length_to_decaying_link(outbound_sequence_length);
            if let Some(inward) = a.inward_edge.as_mut() {
                inward.set_length_from_decaying_link(outbound_sequence_length);
            }

            drop((a, b));
            self.flush(FlushBehavior::Default);
            peer.flush(FlushBehavior::Default);
            return true;
        }

        let Some(bridge_peer) = bridge_peer else {
            tracing::error!("rejecting stop_proxying_to_local_peer with no local peer");
            return false;
        };

        // Bridge case: this router, its bridge peer, and the bridge peer's
        // local outward peer all participate.
        let peer = {
            let state = bridge_peer.lock_state();
            if state.outward_edge.is_stable() {
                return false;
            }
            let Some(peer) = state.outward_edge.get_decaying_local_peer() else {
                return false;
            };
            peer
        };

        {
            let (mut a, mut peer_state, mut b) = lock_three(self, &peer, &bridge_peer);
            if a.outward_edge.is_stable()
                || peer_state.outward_edge.is_stable()
                || b.outward_edge.is_stable()
            {
                return false;
            }

            peer_state
                .outward_edge
                .set_length_from_decaying_link(outbound_sequence_length);
            a.outward_edge
                .set_length_from_decaying_link(outbound_sequence_length);
            if let Some(bridge) = a.bridge.as_mut() {
                bridge.set_length_to_decaying_link(outbound_sequence_length);
            }
            b.outward_edge
                .set_length_to_decaying_link(outbound_sequence_length);
            if let Some(bridge) = b.bridge.as_mut() {
                bridge.set_length_from_decaying_link(outbound_sequence_length);
            }
        }

        self.flush(FlushBehavior::Default);
        peer.flush(FlushBehavior::Default);
        bridge_peer.flush(FlushBehavior::Default);
        true
    }

    /// Called at the end of a flush when this router is a proxy on a
    /// central link: try to get ourselves bypassed.
    pub(crate) fn maybe_start_self_bypass(self: &Arc<Self>) -> bool {
        let remote_inward_link;
        let local_outward_peer;
        let mut remote_outward_link = None;
        {
            let state = self.lock_state();
            let Some(inward_edge) = state.inward_edge.as_ref() else {
                return false;
            };
            // Only a proxy with stable links can be bypassed.
            let Some(inward_link) = inward_edge.primary_link() else {
                return false;
            };
            if !inward_edge.is_stable() {
                return false;
            }
            let Some(outward_link) = state.outward_edge.primary_link() else {
                return false;
            };
            let Some(remote_inward) = inward_link.as_remote() else {
                return false;
            };

            let inward_peer_name = remote_inward.node_link().remote_node_name();
            if !outward_link.try_lock_for_bypass(inward_peer_name) {
                tracing::debug!(
                    outward = outward_link.describe(),
                    "proxy bypass blocked by a busy link"
                );
                return false;
            }

            remote_inward_link = remote_inward;
            local_outward_peer = outward_link.local_peer();
            if local_outward_peer.is_none() {
                remote_outward_link = outward_link.as_remote();
            }
        }

        if let Some(remote_outward_link) = remote_outward_link {
            // Remote outward peer: decay both links and ask the inward peer
            // to bypass us.
            {
                let mut state = self.lock_state();
                let state = &mut *state;
                let inward_ok = state
                    .inward_edge
                    .as_ref()
                    .is_some_and(|edge| edge.primary_link().is_some());
                if !inward_ok || state.outward_edge.primary_link().is_none() {
                    // Disconnected since the check above.
                    return false;
                }
                state.outward_edge.begin_primary_link_decay();
                if let Some(inward) = state.inward_edge.as_mut() {
                    inward.begin_primary_link_decay();
                }
            }

            tracing::debug!(
                inward = remote_inward_link.describe(),
                outward = remote_outward_link.describe(),
                "proxy requesting its own bypass"
            );
            remote_inward_link.bypass_peer(
                remote_outward_link.node_link().remote_node_name(),
                remote_outward_link.sublink(),
            );
            return true;
        }

        let Some(local_outward_peer) = local_outward_peer else {
            return false;
        };
        let fragment = remote_inward_link
            .node_link()
            .memory()
            .try_allocate_router_link_state();
        self.start_self_bypass_to_local_peer(&local_outward_peer, &remote_inward_link, fragment)
    }

    /// Self-bypass when `O` shares this node: build the replacement link
    /// ourselves (a remote link between `I` and `O`), send it to `I`, and
    /// only then install it at `O`.
    fn start_self_bypass_to_local_peer(
        self: &Arc<Self>,
        local_outward_peer: &Arc<Router>,
        inward_link: &Arc<RemoteRouterLink>,
        new_link_state: Option<LinkStateFragment>,
    ) -> bool {
        let Some(new_link_state) = new_link_state else {
            let router = Arc::clone(self);
            let peer = Arc::clone(local_outward_peer);
            let inward = Arc::clone(inward_link);
            let memory = Arc::clone(inward_link.node_link().memory());
            memory.allocate_router_link_state(Box::new(move |fragment| {
                router.start_self_bypass_to_local_peer(&peer, &inward, Some(fragment));
            }));
            return true;
        };

        let new_sublink = inward_link.node_link().memory().allocate_sublink_ids(1);
        let length_from_outward_peer;
        let new_link;
        {
            let (mut a, mut peer) = lock_two(self, local_outward_peer);
            let peer = &mut *peer;
            let a = &mut *a;

            let links_up =
                a.outward_edge.primary_link().is_some() && peer.outward_edge.primary_link().is_some();
            if !links_up || a.is_disconnected || peer.is_disconnected {
                tracing::debug!("proxy bypass blocked by closure or disconnection");
                return false;
            }

            debug_assert!(
                a.outward_edge
                    .get_local_peer()
                    .is_some_and(|router| Arc::ptr_eq(&router, local_outward_peer))
            );
            debug_assert!(
                peer.outward_edge
                    .get_local_peer()
                    .is_some_and(|router| Arc::ptr_eq(&router, self))
            );

            tracing::debug!(
                inward = inward_link.describe(),
                "proxy requesting its own bypass toward a local outward peer"
            );

            // Decay our links and the local peer's link to us; the split in
            // both directions is the peer's outbound length at this
            // instant.
            length_from_outward_peer = peer.outbound_parcels.current_sequence_number();
            peer.outward_edge.begin_primary_link_decay();
            peer.outward_edge
                .set_length_to_decaying_link(length_from_outward_peer);
            a.outward_edge.begin_primary_link_decay();
            a.outward_edge
                .set_length_from_decaying_link(length_from_outward_peer);
            if let Some(inward) = a.inward_edge.as_mut() {
                inward.begin_primary_link_decay();
                inward.set_length_to_decaying_link(length_from_outward_peer);
            }

            new_link = inward_link.node_link().add_remote_router_link(
                new_sublink,
                Some(new_link_state.clone()),
                LinkType::Central,
                LinkSide::A,
                Arc::clone(local_outward_peer),
            );
        }

        let Some(new_link) = new_link else {
            self.accept_route_disconnected_from(LinkType::Central);
            return false;
        };

        // `I` must learn the sublink before any parcel can flow on it, so
        // the message strictly precedes installing the link at `O`.
        inward_link.bypass_peer_with_link(new_sublink, new_link_state, length_from_outward_peer);
        local_outward_peer.set_outward_link(new_link);
        true
    }

    /// Called from flush on a bridge router whose edges have settled: try
    /// to splice the two routes' outward peers directly together.
    pub(crate) fn maybe_start_bridge_bypass(self: &Arc<Self>) {
        let second_bridge;
        {
            let state = self.lock_state();
            let Some(bridge) = state.bridge.as_ref() else {
                return;
            };
            if !bridge.is_stable() {
                return;
            }
            let Some(peer) = bridge.get_local_peer() else {
                return;
            };
            second_bridge = peer;
        }

        let first_local_peer;
        let second_local_peer;
        let first_remote_link;
        let second_remote_link;
        {
            let (a, b) = lock_two(self, &second_bridge);
            let Some(link_to_first_peer) = a.outward_edge.primary_link().cloned() else {
                return;
            };
            let Some(link_to_second_peer) = b.outward_edge.primary_link().cloned() else {
                return;
            };

            first_local_peer = link_to_first_peer.local_peer();
            first_remote_link = link_to_first_peer.as_remote();
            let first_peer_node_name = first_remote_link
                .as_ref()
                .map(|link| link.node_link().remote_node_name())
                .unwrap_or_else(|| NodeName::new([0; 16]));

            second_local_peer = link_to_second_peer.local_peer();
            second_remote_link = link_to_second_peer.as_remote();
            let second_peer_node_name = second_remote_link
                .as_ref()
                .map(|link| link.node_link().remote_node_name())
                .unwrap_or_else(|| NodeName::new([0; 16]));

            // Lock both outward links; the names stamped authorize the
            // peers to accept each other's replacement link.
            if !link_to_first_peer.try_lock_for_bypass(second_peer_node_name) {
                return;
            }
            if !link_to_second_peer.try_lock_for_bypass(first_peer_node_name) {
                link_to_first_peer.unlock();
                return;
            }
        }

        match (first_local_peer, second_local_peer) {
            // Case 1: both outward peers are remote. Equivalent to a remote
            // self-bypass with the bridge pair standing in for the proxy.
            (None, None) => {
                {
                    let (mut a, mut b) = lock_two(self, &second_bridge);
                    a.outward_edge.begin_primary_link_decay();
                    b.outward_edge.begin_primary_link_decay();
                    if let Some(bridge) = a.bridge.as_mut() {
                        bridge.begin_primary_link_decay();
                    }
                    if let Some(bridge) = b.bridge.as_mut() {
                        bridge.begin_primary_link_decay();
                    }
                }
                let (Some(first_remote), Some(second_remote)) =
                    (first_remote_link, second_remote_link)
                else {
                    return;
                };
                second_remote.bypass_peer(
                    first_remote.node_link().remote_node_name(),
                    first_remote.sublink(),
                );
            }

            // Case 2: exactly one outward peer is local; the bridge router
            // on that side drives, with the fragment drawn from the remote
            // side's memory.
            (Some(_), None) => {
                let Some(second_remote) = second_remote_link else {
                    return;
                };
                let fragment = second_remote
                    .node_link()
                    .memory()
                    .try_allocate_router_link_state();
                self.start_bridge_bypass_from_local_peer(fragment);
            }
            (None, Some(_)) => {
                let Some(first_remote) = first_remote_link else {
                    return;
                };
                let fragment = first_remote
                    .node_link()
                    .memory()
                    .try_allocate_router_link_state();
                second_bridge.start_bridge_bypass_from_local_peer(fragment);
            }

            // Case 3: everything is local to this node; the whole bypass is
            // one critical section over all four routers.
            (Some(first_peer), Some(second_peer)) => {
                self.finish_local_bridge_bypass(&second_bridge, &first_peer, &second_peer);
            }
        }
    }

    /// Bridge bypass case 2 driver: this bridge router's outward peer is
    /// local, the other bridge router's outward peer is remote.
    pub(crate) fn start_bridge_bypass_from_local_peer(
        self: &Arc<Self>,
        link_state: Option<LinkStateFragment>,
    ) {
        let local_peer;
        let other_bridge;
        {
            let state = self.lock_state();
            let Some(bridge) = state.bridge.as_ref() else {
                return;
            };
            if !bridge.is_stable() {
                return;
            }
            let (Some(peer), Some(other)) =
                (state.outward_edge.get_local_peer(), bridge.get_local_peer())
            else {
                return;
            };
            local_peer = peer;
            other_bridge = other;
        }

        let remote_link = {
            let state = other_bridge.lock_state();
            let Some(link) = state.outward_edge.primary_link() else {
                return;
            };
            let Some(remote) = link.as_remote() else {
                return;
            };
            remote
        };

        let Some(link_state) = link_state else {
            let router = Arc::clone(self);
            let memory = Arc::clone(remote_link.node_link().memory());
            memory.allocate_router_link_state(Box::new(move |fragment| {
                router.start_bridge_bypass_from_local_peer(Some(fragment));
            }));
            return;
        };

        // We now hold all three local routers, a remote link to the other
        // route's outward peer, and a fresh link state: enough to build the
        // replacement link ourselves.
        let node_link_to_peer = Arc::clone(remote_link.node_link());
        let bypass_sublink = node_link_to_peer.memory().allocate_sublink_ids(1);
        let new_link = node_link_to_peer.add_remote_router_link(
            bypass_sublink,
            Some(link_state.clone()),
            LinkType::Central,
            LinkSide::A,
            Arc::clone(&local_peer),
        );
        let length_from_local_peer;
        {
            let (mut a, mut other, mut peer) = lock_three(self, &other_bridge, &local_peer);
            let a = &mut *a;

            length_from_local_peer = peer.outbound_parcels.current_sequence_number();

            peer.outward_edge.begin_primary_link_decay();
            peer.outward_edge
                .set_length_to_decaying_link(length_from_local_peer);

            other.outward_edge.begin_primary_link_decay();
            other
                .outward_edge
                .set_length_to_decaying_link(length_from_local_peer);

            if let Some(bridge) = a.bridge.as_mut() {
                bridge.begin_primary_link_decay();
                bridge.set_length_to_decaying_link(length_from_local_peer);
            }
            a.outward_edge.begin_primary_link_decay();
            a.outward_edge
                .set_length_from_decaying_link(length_from_local_peer);

            if let Some(bridge) = other.bridge.as_mut() {
                bridge.begin_primary_link_decay();
                bridge.set_length_from_decaying_link(length_from_local_peer);
            }
        }

        let Some(new_link) = new_link else {
            self.accept_route_disconnected_from(LinkType::Central);
            return;
        };

        remote_link.bypass_peer_with_link(bypass_sublink, link_state, length_from_local_peer);
        local_peer.set_outward_link(new_link);
        self.flush(FlushBehavior::Default);
        other_bridge.flush(FlushBehavior::Default);
        local_peer.flush(FlushBehavior::Default);
    }

    /// Bridge bypass case 3: all four routers are local, so the bypass is a
    /// single synchronous splice.
    fn finish_local_bridge_bypass(
        self: &Arc<Self>,
        second_bridge: &Arc<Router>,
        first_peer: &Arc<Router>,
        second_peer: &Arc<Router>,
    ) {
        {
            let (mut a, mut b, mut first, mut second) =
                lock_four(self, second_bridge, first_peer, second_peer);
            let a = &mut *a;
            let b = &mut *b;

            let length_from_first_peer = first.outbound_parcels.current_sequence_number();
            let length_from_second_peer = second.outbound_parcels.current_sequence_number();

            first.outward_edge.begin_primary_link_decay();
            first
                .outward_edge
                .set_length_to_decaying_link(length_from_first_peer);
            first
                .outward_edge
                .set_length_from_decaying_link(length_from_second_peer);

            second.outward_edge.begin_primary_link_decay();
            second
                .outward_edge
                .set_length_to_decaying_link(length_from_second_peer);
            second
                .outward_edge
                .set_length_from_decaying_link(length_from_first_peer);

            a.outward_edge.begin_primary_link_decay();
            a.outward_edge
                .set_length_to_decaying_link(length_from_second_peer);
            a.outward_edge
                .set_length_from_decaying_link(length_from_first_peer);

            b.outward_edge.begin_primary_link_decay();
            b.outward_edge
                .set_length_to_decaying_link(length_from_first_peer);
            b.outward_edge
                .set_length_from_decaying_link(length_from_second_peer);

            if let Some(bridge) = a.bridge.as_mut() {
                bridge.begin_primary_link_decay();
                bridge.set_length_to_decaying_link(length_from_first_peer);
                bridge.set_length_from_decaying_link(length_from_second_peer);
            }
            if let Some(bridge) = b.bridge.as_mut() {
                bridge.begin_primary_link_decay();
                bridge.set_length_to_decaying_link(length_from_second_peer);
                bridge.set_length_from_decaying_link(length_from_first_peer);
            }

            let (link_a, link_b) = LocalRouterLink::create_pair(
                LinkType::Central,
                (Arc::clone(first_peer), Arc::clone(second_peer)),
                InitialLinkState::Unstable,
            );
            first.outward_edge.set_primary_link(link_a);
            second.outward_edge.set_primary_link(link_b);
        }

        self.flush(FlushBehavior::Default);
        second_bridge.flush(FlushBehavior::Default);
        first_peer.flush(FlushBehavior::Default);
        second_peer.flush(FlushBehavior::Default);
    }

    /// `BypassPeer` at `I` when the proxy's outward peer `O` lives on
    /// *this* node: splice `self` and `O` with a new local link and tell
    /// the proxy to stop.
    fn bypass_peer_with_new_local_link(
        self: &Arc<Self>,
        requestor: &Arc<RemoteRouterLink>,
        bypass_target_sublink: SublinkId,
    ) -> bool {
        let from_node_link = Arc::clone(requestor.node_link());
        let Some(new_local_peer) = from_node_link.get_router(bypass_target_sublink) else {
            // The peer may already be gone by the time this arrives.
            self.accept_route_disconnected_from(LinkType::PeripheralOutward);
            return true;
        };

        let link_from_new_local_peer_to_proxy;
        let length_to_proxy_from_us;
        let length_from_proxy_to_us;
        {
            let (mut a, mut peer) = lock_two(self, &new_local_peer);
            let a = &mut *a;
            let peer = &mut *peer;

            length_from_proxy_to_us = peer.outbound_parcels.current_sequence_number();
            length_to_proxy_from_us = a.outbound_parcels.current_sequence_number();

            tracing::debug!(
                %length_to_proxy_from_us,
                %length_from_proxy_to_us,
                "bypassing a proxy via a new local link"
            );

            let Some(peer_link) = peer.outward_edge.primary_link().cloned() else {
                return true;
            };
            if a.outward_edge.primary_link().is_none()
                || a.is_disconnected
                || peer.is_disconnected
            {
                return true;
            }
            link_from_new_local_peer_to_proxy = peer_link;

            if !a.outward_edge.begin_primary_link_decay()
                || !peer.outward_edge.begin_primary_link_decay()
            {
                tracing::error!("rejecting bypass: a link is already decaying");
                return false;
            }
            a.outward_edge
                .set_length_to_decaying_link(length_to_proxy_from_us);
            a.outward_edge
                .set_length_from_decaying_link(length_from_proxy_to_us);
            peer.outward_edge
                .set_length_to_decaying_link(length_from_proxy_to_us);
            peer.outward_edge
                .set_length_from_decaying_link(length_to_proxy_from_us);

            // The new link stays unstable until both decaying proxy links
            // drain.
            let (link_a, link_b) = LocalRouterLink::create_pair(
                LinkType::Central,
                (Arc::clone(self), Arc::clone(&new_local_peer)),
                InitialLinkState::Unstable,
            );
            a.outward_edge.set_primary_link(link_a);
            peer.outward_edge.set_primary_link(link_b);
        }

        link_from_new_local_peer_to_proxy
            .stop_proxying(length_from_proxy_to_us, length_to_proxy_from_us);

        self.flush(FlushBehavior::Default);
        new_local_peer.flush(FlushBehavior::Default);
        true
    }
}
