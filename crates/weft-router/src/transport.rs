//! The seam between the routing core and a transport driver.
//!
//! The core never touches sockets or pipes. It hands a [`TransportMessage`]
//! to a [`Transport`] and receives peer messages through a
//! [`TransportListener`], on whatever thread the driver chooses. Driver
//! objects (shared-memory buffers, boxed application objects) travel
//! out-of-band next to the serialized bytes; a real byte-stream driver
//! would marshal them, the in-memory driver passes them through.

use std::sync::{Arc, Weak};

use weft_core::fragment::LinkStateBuffer;

use crate::error::TransportError;

/// An object attached to a transmission, conveyed by the driver rather
/// than by the wire bytes.
#[derive(Debug, Clone)]
pub enum DriverObject {
    /// A handle to a shared buffer of link-state cells.
    Memory(Arc<LinkStateBuffer>),
    /// An opaque application object boxed into a parcel.
    Blob(Vec<u8>),
}

/// One unit of transmission: serialized message bytes plus attached driver
/// objects.
#[derive(Debug, Clone)]
pub struct TransportMessage {
    pub data: Vec<u8>,
    pub objects: Vec<DriverObject>,
}

/// A bidirectional, in-order, reliable message transport between two nodes.
pub trait Transport: Send + Sync {
    /// Transmit one message to the peer.
    fn transmit(&self, message: TransportMessage) -> Result<(), TransportError>;

    /// Register the listener for inbound messages. Messages arriving before
    /// registration must be buffered, not dropped.
    fn set_listener(&self, listener: Weak<dyn TransportListener>);

    /// Tear the transport down. The peer observes a transport error.
    fn deactivate(&self);
}

/// Receiver half of the transport seam, implemented by the node link.
pub trait TransportListener: Send + Sync {
    /// Handle one inbound message. Returning false signals a protocol
    /// violation; the listener is expected to have torn itself down.
    fn on_transport_message(&self, message: TransportMessage) -> bool;

    /// The transport failed or the peer vanished.
    fn on_transport_error(&self);
}
