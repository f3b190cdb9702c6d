//! Wiring two nodes together over a transport.
//!
//! Connection is deliberately simple: the initiating side allocates the
//! primary shared buffer, both sides build a `NodeLink` over their end of
//! the transport, and the requested number of initial portal pairs is laid
//! out over the reserved sublinks and link-state cells at the front of the
//! primary buffer. Anything fancier — brokered introduction, handshakes,
//! protocol negotiation — lives outside the routing core.

use std::sync::Arc;

use weft_core::fragment::{LinkStateFragment, MAX_INITIAL_PORTALS};
use weft_core::types::{LinkSide, LinkType, SublinkId};
use weft_router::{ApiError, Node, NodeLink, NodeLinkMemory, Router, Transport};

use crate::memory_transport::MemoryTransport;
use crate::portal::Portal;

/// Connect `node_a` and `node_b` with an in-memory transport, returning
/// `num_initial_portals` portal pairs (one end on each node).
pub fn connect_nodes(
    node_a: &Arc<Node>,
    node_b: &Arc<Node>,
    num_initial_portals: usize,
) -> Result<(Vec<Portal>, Vec<Portal>), ApiError> {
    let (transport_a, transport_b) = MemoryTransport::pair();
    connect_nodes_with_transports(node_a, node_b, transport_a, transport_b, num_initial_portals)
}

/// Connect two nodes over a caller-supplied transport pair. Tests use this
/// to interpose probed or paused transports.
pub fn connect_nodes_with_transports(
    node_a: &Arc<Node>,
    node_b: &Arc<Node>,
    transport_a: Arc<dyn Transport>,
    transport_b: Arc<dyn Transport>,
    num_initial_portals: usize,
) -> Result<(Vec<Portal>, Vec<Portal>), ApiError> {
    if num_initial_portals > MAX_INITIAL_PORTALS {
        return Err(ApiError::InvalidArgument);
    }

    let (memory_a, primary) = NodeLinkMemory::allocate();
    let memory_b = NodeLinkMemory::new(primary);

    let link_a = NodeLink::create(
        Arc::clone(node_a),
        LinkSide::A,
        node_b.name(),
        memory_a,
        transport_a,
    );
    let link_b = NodeLink::create(
        Arc::clone(node_b),
        LinkSide::B,
        node_a.name(),
        memory_b,
        transport_b,
    );
    if !node_a.add_link(Arc::clone(&link_a)) {
        return Err(ApiError::AlreadyExists);
    }
    if !node_b.add_link(Arc::clone(&link_b)) {
        node_a.remove_link(node_b.name());
        return Err(ApiError::AlreadyExists);
    }
    link_a.activate();
    link_b.activate();

    let mut portals_a = Vec::with_capacity(num_initial_portals);
    let mut portals_b = Vec::with_capacity(num_initial_portals);
    for index in 0..num_initial_portals {
        let sublink = SublinkId(index as u64);
        portals_a.push(initial_portal(node_a, &link_a, sublink, index, LinkSide::A)?);
        portals_b.push(initial_portal(node_b, &link_b, sublink, index, LinkSide::B)?);
    }

    tracing::info!(
        a = %node_a.name(),
        b = %node_b.name(),
        portals = num_initial_portals,
        "nodes connected"
    );
    Ok((portals_a, portals_b))
}

fn initial_portal(
    node: &Arc<Node>,
    link: &Arc<NodeLink>,
    sublink: SublinkId,
    index: usize,
    side: LinkSide,
) -> Result<Portal, ApiError> {
    let router = Router::new();
    let state = link
        .memory()
        .initial_link_state(index)
        .ok_or(ApiError::InvalidArgument)?;
    let router_link = link
        .add_remote_router_link(
            sublink,
            Some(LinkStateFragment::Addressable(state)),
            LinkType::Central,
            side,
            Arc::clone(&router),
        )
        .ok_or(ApiError::AlreadyExists)?;
    router.set_outward_link(router_link);
    Ok(Portal::adopt(Arc::clone(node), router))
}
