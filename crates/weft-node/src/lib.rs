//! Application surface of the weft fabric.
//!
//! This crate wraps the routing core in the pieces an application touches:
//! [`Portal`]s over terminal routers, [`connect_nodes`] to join two nodes
//! over a transport with a set of initial portal pairs, the in-memory
//! [`MemoryTransport`] used for same-machine fabrics and tests, and tracing
//! setup.
//!
//! [`Portal`]: portal::Portal
//! [`connect_nodes`]: connect::connect_nodes
//! [`MemoryTransport`]: memory_transport::MemoryTransport

pub mod connect;
pub mod logging;
pub mod memory_transport;
pub mod portal;

pub use connect::{connect_nodes, connect_nodes_with_transports};
pub use memory_transport::MemoryTransport;
pub use portal::{Attachment, PendingParcel, Portal, PutError};

pub use weft_core::types::NodeName;
pub use weft_router::{
    ApiError, DriverObject, Node, PortalStatus, PutLimits, TrapConditions, TrapEvent, TrapHandler,
};
