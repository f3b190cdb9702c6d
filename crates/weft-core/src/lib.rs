//! Foundation types for the weft message-passing fabric.
//!
//! This crate holds the pieces of the fabric that carry no routing logic of
//! their own: identifier newtypes, the gap-tolerant [`SequencedQueue`], the
//! lock-free [`RouterLinkState`] cell shared by the two ends of a central
//! link, and the fragment machinery that addresses link-state cells inside
//! shared buffers.
//!
//! [`SequencedQueue`]: queue::SequencedQueue
//! [`RouterLinkState`]: link_state::RouterLinkState

pub mod fragment;
pub mod link_state;
pub mod queue;
pub mod sequence;
pub mod types;

pub use fragment::{FragmentDescriptor, LinkStateBuffer, LinkStateFragment, LinkStateRef};
pub use link_state::{LinkStatus, QueueState, RouterLinkState};
pub use queue::{Sequenced, SequencedQueue};
pub use sequence::SequenceNumber;
pub use types::{BufferId, InvalidLength, LinkSide, LinkType, NodeName, SublinkId};
