//! Shared buffers of link-state cells and the fragments that address them.
//!
//! A [`LinkStateBuffer`] models one mapped region of memory shared by the
//! two ends of a node link: a small header of shared id generators plus a
//! slab of [`RouterLinkState`] cells. Cells are addressed across the link by
//! [`FragmentDescriptor`]s, which resolve locally to a [`LinkStateRef`].
//!
//! Buffers can arrive out of order relative to the fragments that reference
//! them, so a fragment is either `Addressable` or still `Pending` its
//! buffer; consumers register one-shot waiters with the owning memory until
//! the mapping shows up.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::link_state::RouterLinkState;
use crate::types::{BufferId, SublinkId};

/// Number of link-state cells in the primary buffer.
pub const PRIMARY_BUFFER_CELLS: usize = 64;

/// Number of link-state cells in each expansion buffer.
pub const EXPANSION_BUFFER_CELLS: usize = 256;

/// Cells at the front of the primary buffer reserved for a node link's
/// initial portals. This also floors the shared sublink id generator, so
/// neither side can collide with an initial sublink regardless of how many
/// initial portals the other side asked for.
pub const MAX_INITIAL_PORTALS: usize = 12;

/// The id of the primary buffer on every node link.
pub const PRIMARY_BUFFER_ID: BufferId = BufferId(0);

/// One region of memory shared by both ends of a node link.
///
/// The generator fields are meaningful only on the primary buffer; they let
/// either side mint buffer and sublink ids spontaneously, without
/// synchronization or risk of collision.
#[derive(Debug)]
pub struct LinkStateBuffer {
    next_buffer_id: AtomicU64,
    next_sublink_id: AtomicU64,
    next_free_cell: AtomicU32,
    cells: Vec<RouterLinkState>,
}

impl LinkStateBuffer {
    /// Create the primary buffer for a new node link.
    pub fn new_primary() -> Self {
        Self {
            // Buffer id 0 is the primary buffer itself.
            next_buffer_id: AtomicU64::new(1),
            next_sublink_id: AtomicU64::new(MAX_INITIAL_PORTALS as u64),
            next_free_cell: AtomicU32::new(MAX_INITIAL_PORTALS as u32),
            cells: (0..PRIMARY_BUFFER_CELLS)
                .map(|_| RouterLinkState::new())
                .collect(),
        }
    }

    /// Create an expansion buffer.
    pub fn new_expansion() -> Self {
        Self {
            next_buffer_id: AtomicU64::new(0),
            next_sublink_id: AtomicU64::new(0),
            next_free_cell: AtomicU32::new(0),
            cells: (0..EXPANSION_BUFFER_CELLS)
                .map(|_| RouterLinkState::new())
                .collect(),
        }
    }

    /// Mint a fresh buffer id. Only meaningful on the primary buffer.
    pub fn allocate_buffer_id(&self) -> BufferId {
        BufferId(self.next_buffer_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Mint `count` consecutive sublink ids, returning the first. Only
    /// meaningful on the primary buffer.
    pub fn allocate_sublink_ids(&self, count: u64) -> SublinkId {
        SublinkId(self.next_sublink_id.fetch_add(count, Ordering::Relaxed))
    }

    /// Claim the next free cell, or `None` when the buffer is exhausted.
    pub fn allocate_cell(&self) -> Option<u32> {
        self.next_free_cell
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |next| {
                (usize::try_from(next).ok()? < self.cells.len()).then_some(next + 1)
            })
            .ok()
    }

    pub fn cell(&self, index: u32) -> Option<&RouterLinkState> {
        self.cells.get(index as usize)
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }
}

/// Addresses one link-state cell within a node link's shared buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct FragmentDescriptor {
    pub buffer_id: BufferId,
    pub index: u32,
}

/// A resolved reference to a link-state cell. Cheap to clone; keeps its
/// buffer alive and remembers its descriptor for re-serialization.
#[derive(Clone)]
#[must_use]
pub struct LinkStateRef {
    buffer: Arc<LinkStateBuffer>,
    descriptor: FragmentDescriptor,
}

impl LinkStateRef {
    /// Resolve `descriptor` against `buffer`. Fails if the index is out of
    /// bounds, which a well-behaved peer never produces.
    pub fn new(buffer: Arc<LinkStateBuffer>, descriptor: FragmentDescriptor) -> Option<Self> {
        buffer.cell(descriptor.index)?;
        Some(Self { buffer, descriptor })
    }

    pub fn descriptor(&self) -> FragmentDescriptor {
        self.descriptor
    }
}

impl Deref for LinkStateRef {
    type Target = RouterLinkState;

    fn deref(&self) -> &RouterLinkState {
        // The index was bounds-checked at construction.
        &self.buffer.cells[self.descriptor.index as usize]
    }
}

impl fmt::Debug for LinkStateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkStateRef")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// A link-state fragment as seen by one side of a node link: resolved, or
/// still waiting for its backing buffer to be shared.
#[derive(Debug, Clone)]
#[must_use]
pub enum LinkStateFragment {
    Pending(FragmentDescriptor),
    Addressable(LinkStateRef),
}

impl LinkStateFragment {
    pub fn descriptor(&self) -> FragmentDescriptor {
        match self {
            Self::Pending(descriptor) => *descriptor,
            Self::Addressable(state) => state.descriptor(),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }

    pub fn as_addressable(&self) -> Option<&LinkStateRef> {
        match self {
            Self::Pending(_) => None,
            Self::Addressable(state) => Some(state),
        }
    }
}
