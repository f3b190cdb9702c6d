//! Dynamic routing core of the weft fabric.
//!
//! A route is a chain of [`Router`]s connected by links, carrying ordered
//! [`Parcel`]s in both directions between two terminal routers. Sending a
//! portal to another process extends its route with proxy routers; this
//! crate's central job is to transport parcels correctly while the proxy
//! bypass protocol removes those proxies again, even with traffic in
//! flight.
//!
//! The crate is callback-driven and multi-threaded: transport reads arrive
//! on whatever thread the driver provides and re-enter the routing core
//! directly. Every router guards its state with one mutex and follows a
//! strict staging discipline — no re-entrant link operation is ever invoked
//! with a router mutex held.
//!
//! [`Router`]: router::Router
//! [`Parcel`]: parcel::Parcel

pub mod edge;
pub mod error;
pub mod link;
pub mod local_link;
pub mod memory;
mod multi_lock;
pub mod node;
pub mod node_link;
pub mod parcel;
pub mod remote_link;
pub mod router;
pub mod transport;
pub mod trap;
pub mod wire;

pub use edge::RouteEdge;
pub use error::{ApiError, TransportError, WireError};
pub use link::RouterLink;
pub use local_link::{InitialLinkState, LocalRouterLink};
pub use memory::NodeLinkMemory;
pub use node::Node;
pub use node_link::NodeLink;
pub use parcel::{Parcel, ParcelObject, ParcelQueue};
pub use remote_link::RemoteRouterLink;
pub use router::{FlushBehavior, PortalStatus, PutLimits, Router, SendError};
pub use transport::{DriverObject, Transport, TransportListener, TransportMessage};
pub use trap::{TrapConditions, TrapEvent, TrapHandler};
