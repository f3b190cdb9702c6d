//! Shared memory management for one node link.
//!
//! Each side of a node link owns a `NodeLinkMemory` mapping the same
//! buffers: the primary buffer created at connection, plus any expansion
//! buffers allocated later. Fragments referencing a buffer can arrive
//! before the buffer itself; consumers park one-shot waiters keyed on the
//! buffer id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use weft_core::fragment::{
    FragmentDescriptor, LinkStateBuffer, LinkStateFragment, LinkStateRef, MAX_INITIAL_PORTALS,
    PRIMARY_BUFFER_ID,
};
use weft_core::types::{BufferId, SublinkId};

use crate::node_link::NodeLink;
use crate::transport::DriverObject;
use crate::wire::Message;

type BufferWaiter = Box<dyn FnOnce() + Send>;

pub struct NodeLinkMemory {
    primary: Arc<LinkStateBuffer>,
    buffers: Mutex<HashMap<BufferId, Arc<LinkStateBuffer>>>,
    buffer_waiters: Mutex<HashMap<BufferId, Vec<BufferWaiter>>>,
    node_link: Mutex<Weak<NodeLink>>,
}

impl NodeLinkMemory {
    /// Adopt `primary` as this side's view of the link's primary buffer.
    /// Both sides of a link are constructed over the same buffer.
    pub fn new(primary: Arc<LinkStateBuffer>) -> Arc<Self> {
        let mut buffers = HashMap::new();
        buffers.insert(PRIMARY_BUFFER_ID, Arc::clone(&primary));
        Arc::new(Self {
            primary,
            buffers: Mutex::new(buffers),
            buffer_waiters: Mutex::new(HashMap::new()),
            node_link: Mutex::new(Weak::new()),
        })
    }

    /// Allocate a primary buffer and the memory for the side that creates
    /// the link. The buffer is then shared with the other side.
    pub fn allocate() -> (Arc<Self>, Arc<LinkStateBuffer>) {
        let primary = Arc::new(LinkStateBuffer::new_primary());
        (Self::new(Arc::clone(&primary)), primary)
    }

    pub(crate) fn set_node_link(&self, link: &Arc<NodeLink>) {
        *lock(&self.node_link) = Arc::downgrade(link);
    }

    /// Mint `count` consecutive sublink ids from the shared generator.
    pub fn allocate_sublink_ids(&self, count: u64) -> SublinkId {
        self.primary.allocate_sublink_ids(count)
    }

    /// Mint a fresh buffer id from the shared generator.
    pub fn allocate_buffer_id(&self) -> BufferId {
        self.primary.allocate_buffer_id()
    }

    /// The reserved link-state cell for initial portal `index`.
    pub fn initial_link_state(&self, index: usize) -> Option<LinkStateRef> {
        if index >= MAX_INITIAL_PORTALS {
            return None;
        }
        LinkStateRef::new(
            Arc::clone(&self.primary),
            FragmentDescriptor {
                buffer_id: PRIMARY_BUFFER_ID,
                index: index as u32,
            },
        )
    }

    /// Try to claim a fresh link-state cell from any mapped buffer.
    pub fn try_allocate_router_link_state(&self) -> Option<LinkStateFragment> {
        let buffers = lock(&self.buffers);
        for (&buffer_id, buffer) in buffers.iter() {
            if let Some(index) = buffer.allocate_cell() {
                let descriptor = FragmentDescriptor { buffer_id, index };
                let state = LinkStateRef::new(Arc::clone(buffer), descriptor)
                    .expect("freshly allocated cell is in bounds");
                return Some(LinkStateFragment::Addressable(state));
            }
        }
        None
    }

    /// Claim a link-state cell, expanding capacity when every mapped buffer
    /// is full. `callback` may run synchronously on the calling thread; the
    /// caller must not hold a router mutex.
    pub fn allocate_router_link_state(&self, callback: Box<dyn FnOnce(LinkStateFragment) + Send>) {
        if let Some(fragment) = self.try_allocate_router_link_state() {
            callback(fragment);
            return;
        }

        let Some(link) = lock(&self.node_link).upgrade() else {
            tracing::debug!("dropping link-state allocation: node link is gone");
            return;
        };

        let buffer = Arc::new(LinkStateBuffer::new_expansion());
        let buffer_id = self.primary.allocate_buffer_id();

        tracing::debug!(%buffer_id, "expanding link-state capacity");

        // Share the new buffer with the remote side before registering it
        // locally: a fragment allocated from the buffer must never reach
        // the peer ahead of the buffer itself.
        link.transmit(
            Message::AddLinkStateBuffer { buffer_id },
            vec![DriverObject::Memory(Arc::clone(&buffer))],
        );
        self.add_buffer(buffer_id, buffer);

        match self.try_allocate_router_link_state() {
            Some(fragment) => callback(fragment),
            None => tracing::debug!("link-state allocation failed after expansion"),
        }
    }

    /// Register a buffer shared by the peer (or just created locally) and
    /// fire any waiters parked on its id. Fails on id collision, which on a
    /// live link is a protocol violation.
    pub fn add_buffer(&self, buffer_id: BufferId, buffer: Arc<LinkStateBuffer>) -> bool {
        {
            let mut buffers = lock(&self.buffers);
            if buffers.contains_key(&buffer_id) {
                return false;
            }
            buffers.insert(buffer_id, buffer);
        }
        let waiters = lock(&self.buffer_waiters).remove(&buffer_id);
        if let Some(waiters) = waiters {
            tracing::trace!(%buffer_id, count = waiters.len(), "buffer arrived; firing waiters");
            for waiter in waiters {
                waiter();
            }
        }
        true
    }

    /// Resolve a fragment descriptor against the mapped buffers.
    ///
    /// Returns `Pending` when the buffer has not arrived yet, and `None`
    /// when the buffer is known but the index is out of bounds (only a
    /// misbehaving peer produces that).
    pub fn get_fragment(&self, descriptor: FragmentDescriptor) -> Option<LinkStateFragment> {
        let buffer = lock(&self.buffers).get(&descriptor.buffer_id).cloned();
        match buffer {
            Some(buffer) => {
                LinkStateRef::new(buffer, descriptor).map(LinkStateFragment::Addressable)
            }
            None => Some(LinkStateFragment::Pending(descriptor)),
        }
    }

    /// Invoke `waiter` once `buffer_id` is mapped. Runs synchronously when
    /// the buffer is already present.
    pub fn wait_for_buffer(&self, buffer_id: BufferId, waiter: BufferWaiter) {
        {
            let mut waiters = lock(&self.buffer_waiters);
            if !lock(&self.buffers).contains_key(&buffer_id) {
                waiters.entry(buffer_id).or_default().push(waiter);
                return;
            }
        }
        waiter();
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
