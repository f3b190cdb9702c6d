//! Multiplexes many router links over one transport.
//!
//! A `NodeLink` owns the transport to one remote node and a map from
//! [`SublinkId`] to the [`RemoteRouterLink`] / receiving [`Router`] pair
//! registered under it. Inbound messages are decoded and dispatched to the
//! receiving router; any protocol violation is fatal and disconnects the
//! whole node link, which in turn disconnects every route running over it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use weft_core::fragment::LinkStateFragment;
use weft_core::sequence::SequenceNumber;
use weft_core::types::{LinkSide, LinkType, NodeName, SublinkId};

use crate::link::RouterLink;
use crate::memory::NodeLinkMemory;
use crate::node::Node;
use crate::parcel::{Parcel, ParcelObject};
use crate::remote_link::RemoteRouterLink;
use crate::router::{FlushBehavior, Router};
use crate::transport::{DriverObject, Transport, TransportListener, TransportMessage};
use crate::wire::{Envelope, HandleType, Message, RouterDescriptor};

/// One sublink registration: the link object and the router that receives
/// messages addressed to it.
#[derive(Clone)]
pub struct Sublink {
    pub router_link: Arc<RemoteRouterLink>,
    pub receiver: Arc<Router>,
}

pub struct NodeLink {
    self_ref: Weak<NodeLink>,
    node: Arc<Node>,
    link_side: LinkSide,
    remote_node_name: NodeName,
    memory: Arc<NodeLinkMemory>,
    transport: Arc<dyn Transport>,
    sublinks: Mutex<HashMap<SublinkId, Sublink>>,
    active: AtomicBool,
    next_transmit_sequence: AtomicU64,
}

impl NodeLink {
    pub fn create(
        node: Arc<Node>,
        link_side: LinkSide,
        remote_node_name: NodeName,
        memory: Arc<NodeLinkMemory>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            node,
            link_side,
            remote_node_name,
            memory,
            transport,
            sublinks: Mutex::new(HashMap::new()),
            active: AtomicBool::new(true),
            next_transmit_sequence: AtomicU64::new(0),
        })
    }

    /// Attach this link to its transport. Until activation, inbound
    /// messages are buffered by the transport.
    pub fn activate(self: &Arc<Self>) {
        self.memory.set_node_link(self);
        let self_as_listener: Arc<dyn TransportListener> = self.clone();
        let listener: Weak<dyn TransportListener> = Arc::downgrade(&self_as_listener);
        self.transport.set_listener(listener);
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn link_side(&self) -> LinkSide {
        self.link_side
    }

    pub fn local_node_name(&self) -> NodeName {
        self.node.name()
    }

    pub fn remote_node_name(&self) -> NodeName {
        self.remote_node_name
    }

    pub fn memory(&self) -> &Arc<NodeLinkMemory> {
        &self.memory
    }

    fn arc(&self) -> Arc<NodeLink> {
        self.self_ref
            .upgrade()
            .expect("node link methods run on a live Arc")
    }

    /// Register a new remote router link on `sublink`. Returns `None` when
    /// the link is dead or the sublink id is already taken — the latter is
    /// a validation signal, since well-behaved nodes never reuse ids.
    pub fn add_remote_router_link(
        &self,
        sublink: SublinkId,
        link_state: Option<LinkStateFragment>,
        link_type: LinkType,
        side: LinkSide,
        receiver: Arc<Router>,
    ) -> Option<Arc<RemoteRouterLink>> {
        if !self.active.load(Ordering::Acquire) {
            return None;
        }
        let link = RemoteRouterLink::new(self.arc(), sublink, link_state, link_type, side);
        let mut sublinks = lock(&self.sublinks);
        if sublinks.contains_key(&sublink) {
            return None;
        }
        sublinks.insert(
            sublink,
            Sublink {
                router_link: Arc::clone(&link),
                receiver,
            },
        );
        Some(link)
    }

    pub fn remove_sublink(&self, sublink: SublinkId) {
        lock(&self.sublinks).remove(&sublink);
    }

    pub fn get_sublink(&self, sublink: SublinkId) -> Option<Sublink> {
        lock(&self.sublinks).get(&sublink).cloned()
    }

    pub fn get_router(&self, sublink: SublinkId) -> Option<Arc<Router>> {
        Some(self.get_sublink(sublink)?.receiver)
    }

    /// Stamp and transmit one message.
    pub fn transmit(&self, message: Message, objects: Vec<DriverObject>) {
        let envelope = Envelope {
            transmit_sequence: self.next_transmit_sequence.fetch_add(1, Ordering::Relaxed),
            message,
        };
        let wire_message = TransportMessage {
            data: envelope.encode(),
            objects,
        };
        if let Err(error) = self.transport.transmit(wire_message) {
            tracing::debug!(%error, "dropping transmission on dead transport");
        }
    }

    /// Tear this link down without notifying routers. Used when the routers
    /// are being told separately, or when there are none left.
    pub fn deactivate(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        lock(&self.sublinks).clear();
        self.transport.deactivate();
        self.node.remove_link(self.remote_node_name);
    }

    /// Fatal teardown: every attached router observes a disconnection.
    fn disconnect(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        let sublinks: Vec<Sublink> = {
            let mut map = lock(&self.sublinks);
            map.drain().map(|(_, sublink)| sublink).collect()
        };
        self.transport.deactivate();
        self.node.remove_link(self.remote_node_name);

        tracing::debug!(
            remote = %self.remote_node_name,
            routes = sublinks.len(),
            "node link disconnected"
        );
        for sublink in sublinks {
            sublink.receiver.notify_link_disconnected(&sublink.router_link);
        }
    }

    fn dispatch(&self, envelope: Envelope, objects: Vec<DriverObject>) -> bool {
        match envelope.message {
            Message::AcceptParcel {
                sublink,
                sequence_number,
                data,
                handle_types,
                new_routers,
                num_driver_objects,
            } => self.on_accept_parcel(
                sublink,
                sequence_number,
                data,
                handle_types,
                new_routers,
                num_driver_objects,
                objects,
            ),
            Message::RouteClosed {
                sublink,
                sequence_length,
            } => {
                // The sublink may be gone already if the application closed
                // the router; that is not an error.
                let Some(sublink) = self.get_sublink(sublink) else {
                    return true;
                };
                sublink
                    .receiver
                    .accept_route_closure_from(sublink.router_link.link_type(), sequence_length)
            }
            Message::RouteDisconnected { sublink } => {
                let Some(sublink) = self.get_sublink(sublink) else {
                    return true;
                };
                sublink
                    .receiver
                    .accept_route_disconnected_from(sublink.router_link.link_type())
            }
            Message::FlushRouter { sublink } => {
                if let Some(router) = self.get_router(sublink) {
                    router.flush(FlushBehavior::Default);
                }
                true
            }
            Message::BypassPeer {
                sublink,
                bypass_target_node,
                bypass_target_sublink,
            } => {
                let Some(sublink) = self.get_sublink(sublink) else {
                    return true;
                };
                sublink.receiver.bypass_peer(
                    &sublink.router_link,
                    bypass_target_node,
                    bypass_target_sublink,
                )
            }
            Message::AcceptBypassLink {
                proxy_node,
                proxy_sublink,
                inbound_sequence_length,
                new_sublink,
                new_link_state,
            } => {
                // The proxy is identified by its sublink on OUR link to its
                // node; the replacement link rides this node link.
                let Some(link_to_proxy) = self.node.get_link(proxy_node) else {
                    tracing::debug!(%proxy_node, "discarding bypass link for unknown proxy node");
                    return true;
                };
                let Some(proxy_sublink) = link_to_proxy.get_sublink(proxy_sublink) else {
                    return true;
                };
                let Some(fragment) = self.memory.get_fragment(new_link_state) else {
                    return false;
                };
                proxy_sublink.receiver.accept_bypass_link(
                    &self.arc(),
                    new_sublink,
                    fragment,
                    inbound_sequence_length,
                )
            }
            Message::BypassPeerWithLink {
                sublink,
                new_sublink,
                new_link_state,
                inbound_sequence_length,
            } => {
                let Some(sublink) = self.get_sublink(sublink) else {
                    return true;
                };
                let Some(fragment) = self.memory.get_fragment(new_link_state) else {
                    return false;
                };
                sublink.receiver.accept_bypass_link(
                    &self.arc(),
                    new_sublink,
                    fragment,
                    inbound_sequence_length,
                )
            }
            Message::StopProxying {
                sublink,
                inbound_sequence_length,
                outbound_sequence_length,
            } => {
                let Some(sublink) = self.get_sublink(sublink) else {
                    return true;
                };
                sublink
                    .receiver
                    .stop_proxying(inbound_sequence_length, outbound_sequence_length)
            }
            Message::ProxyWillStop {
                sublink,
                inbound_sequence_length,
            } => {
                let Some(sublink) = self.get_sublink(sublink) else {
                    return true;
                };
                sublink
                    .receiver
                    .notify_proxy_will_stop(inbound_sequence_length)
            }
            Message::StopProxyingToLocalPeer {
                sublink,
                outbound_sequence_length,
            } => {
                let Some(sublink) = self.get_sublink(sublink) else {
                    return true;
                };
                sublink
                    .receiver
                    .stop_proxying_to_local_peer(outbound_sequence_length)
            }
            Message::AddLinkStateBuffer { buffer_id } => {
                if objects.len() != 1 {
                    return false;
                }
                match objects.into_iter().next() {
                    Some(DriverObject::Memory(buffer)) => self.memory.add_buffer(buffer_id, buffer),
                    _ => false,
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_accept_parcel(
        &self,
        sublink: SublinkId,
        sequence_number: SequenceNumber,
        data: Vec<u8>,
        handle_types: Vec<HandleType>,
        new_routers: Vec<RouterDescriptor>,
        num_driver_objects: u32,
        objects: Vec<DriverObject>,
    ) -> bool {
        let num_portals = handle_types
            .iter()
            .filter(|h| matches!(h, HandleType::Portal))
            .count();
        let num_boxes = handle_types.len() - num_portals;
        if num_portals != new_routers.len()
            || num_boxes != num_driver_objects as usize
            || objects.len() != num_driver_objects as usize
        {
            tracing::error!(%sublink, "parcel attachment counts are inconsistent");
            return false;
        }

        let Some(sublink_entry) = self.get_sublink(sublink) else {
            // The router may have been closed locally while this parcel was
            // in flight.
            return true;
        };

        let mut descriptors = new_routers.into_iter();
        let mut driver_objects = objects.into_iter();
        let mut parcel_objects = Vec::with_capacity(handle_types.len());
        for handle_type in handle_types {
            match handle_type {
                HandleType::Portal => {
                    let descriptor = descriptors.next().expect("counts validated above");
                    let Some(router) = Router::deserialize(&descriptor, &self.arc()) else {
                        return false;
                    };
                    parcel_objects.push(ParcelObject::Portal(router));
                }
                HandleType::Box => {
                    let object = driver_objects.next().expect("counts validated above");
                    parcel_objects.push(ParcelObject::Box(object));
                }
            }
        }

        let mut parcel = Parcel::new(Arc::from(data), parcel_objects);
        parcel.set_sequence_number(sequence_number);

        tracing::trace!(%sublink, %parcel, "parcel received");

        if sublink_entry.router_link.link_type().is_outward() {
            sublink_entry.receiver.accept_inbound_parcel(parcel)
        } else {
            sublink_entry.receiver.accept_outbound_parcel(parcel)
        }
    }
}

impl TransportListener for NodeLink {
    fn on_transport_message(&self, message: TransportMessage) -> bool {
        if !self.active.load(Ordering::Acquire) {
            return true;
        }
        let envelope = match Envelope::decode(&message.data) {
            Ok(envelope) => envelope,
            Err(error) => {
                tracing::error!(%error, remote = %self.remote_node_name, "malformed message");
                self.disconnect();
                return false;
            }
        };
        if self.dispatch(envelope, message.objects) {
            return true;
        }
        tracing::error!(
            remote = %self.remote_node_name,
            "protocol violation; disconnecting node link"
        );
        self.disconnect();
        false
    }

    fn on_transport_error(&self) {
        self.disconnect();
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
