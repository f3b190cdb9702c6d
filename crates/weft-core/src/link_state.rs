//! The shared state cell at the heart of a central link.
//!
//! Both ends of a central (or merge-created) link observe one
//! [`RouterLinkState`] living in memory shared between their processes. The
//! cell carries the handshake that serializes route mutation: each side
//! advertises stability, and an exclusive lock gates both route closure and
//! proxy bypass so the two can never race.
//!
//! # Bit protocol
//!
//! The status word holds three bits per side:
//!
//! - `STABLE`: this side has no decaying links and does not expect to
//!   install any; set once per decay cycle, cleared only by re-creation.
//! - `LOCKED`: this side holds the mutation lock. [`try_lock`] succeeds only
//!   when both `STABLE` bits are set and neither `LOCKED` bit is.
//! - `WAITING`: this side wanted the lock and lost. The winning side clears
//!   the bit when its own work completes and nudges the loser to retry.
//!
//! All transitions are single-word compare-and-swap. Writes that gate a
//! subsequent lock attempt are release operations; reads that act on
//! another side's writes are acquire operations. The 128-bit bypass source
//! name is written only under the lock, fenced as described on
//! [`set_allowed_bypass_request_source`].
//!
//! [`try_lock`]: RouterLinkState::try_lock
//! [`set_allowed_bypass_request_source`]: RouterLinkState::set_allowed_bypass_request_source

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering, fence};

use crate::types::{LinkSide, NodeName};

/// Raw status bits. Exposed for tests and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStatus(pub u32);

impl LinkStatus {
    pub const STABLE_A: u32 = 1 << 0;
    pub const STABLE_B: u32 = 1 << 1;
    pub const LOCKED_A: u32 = 1 << 2;
    pub const LOCKED_B: u32 = 1 << 3;
    pub const WAITING_A: u32 = 1 << 4;
    pub const WAITING_B: u32 = 1 << 5;

    const STABLE_BOTH: u32 = Self::STABLE_A | Self::STABLE_B;
    const LOCKED_EITHER: u32 = Self::LOCKED_A | Self::LOCKED_B;

    fn stable_bit(side: LinkSide) -> u32 {
        match side {
            LinkSide::A => Self::STABLE_A,
            LinkSide::B => Self::STABLE_B,
        }
    }

    fn locked_bit(side: LinkSide) -> u32 {
        match side {
            LinkSide::A => Self::LOCKED_A,
            LinkSide::B => Self::LOCKED_B,
        }
    }

    fn waiting_bit(side: LinkSide) -> u32 {
        match side {
            LinkSide::A => Self::WAITING_A,
            LinkSide::B => Self::WAITING_B,
        }
    }
}

/// Peer-visible inbound queue occupancy, one per side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueState {
    pub num_parcels: u32,
    pub num_bytes: u32,
}

impl QueueState {
    fn pack(self) -> u64 {
        (u64::from(self.num_parcels) << 32) | u64::from(self.num_bytes)
    }

    fn unpack(word: u64) -> Self {
        Self {
            num_parcels: (word >> 32) as u32,
            num_bytes: word as u32,
        }
    }
}

/// The shared cell for one central link. Fixed-size and built entirely from
/// atomics, so a reference can be handed to both sides without a lock.
#[derive(Debug)]
pub struct RouterLinkState {
    status: AtomicU32,
    /// 128-bit node name, split across two words. Written only while the
    /// writer holds a `LOCKED` bit; see the fence pairing below.
    allowed_bypass_request_source: [AtomicU64; 2],
    /// Per-side inbound queue occupancy, `[A, B]`.
    queue_states: [AtomicU64; 2],
}

impl Default for RouterLinkState {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterLinkState {
    pub fn new() -> Self {
        Self {
            status: AtomicU32::new(0),
            allowed_bypass_request_source: [AtomicU64::new(0), AtomicU64::new(0)],
            queue_states: [AtomicU64::new(0), AtomicU64::new(0)],
        }
    }

    pub fn status(&self) -> LinkStatus {
        LinkStatus(self.status.load(Ordering::Acquire))
    }

    /// Mark `side` as stable. Idempotent.
    pub fn set_side_stable(&self, side: LinkSide) {
        self.status
            .fetch_or(LinkStatus::stable_bit(side), Ordering::Release);
    }

    /// Attempt to take the mutation lock for `side`.
    ///
    /// Succeeds only when both sides are stable and neither holds the lock.
    /// On failure the caller's `WAITING` bit is raised instead, so the side
    /// that won (or that has yet to stabilize) knows to nudge us when the
    /// link settles.
    pub fn try_lock(&self, side: LinkSide) -> bool {
        let locked = LinkStatus::locked_bit(side);
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            if current & LinkStatus::STABLE_BOTH != LinkStatus::STABLE_BOTH
                || current & LinkStatus::LOCKED_EITHER != 0
            {
                self.status
                    .fetch_or(LinkStatus::waiting_bit(side), Ordering::AcqRel);
                return false;
            }
            match self.status.compare_exchange_weak(
                current,
                current | locked,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Release the mutation lock held by `side`.
    pub fn unlock(&self, side: LinkSide) {
        self.status
            .fetch_and(!LinkStatus::locked_bit(side), Ordering::Release);
    }

    pub fn is_locked_by(&self, side: LinkSide) -> bool {
        self.status.load(Ordering::Acquire) & LinkStatus::locked_bit(side) != 0
    }

    /// Clear `side`'s `WAITING` bit, returning whether it was set.
    pub fn reset_waiting_bit(&self, side: LinkSide) -> bool {
        let waiting = LinkStatus::waiting_bit(side);
        self.status.fetch_and(!waiting, Ordering::AcqRel) & waiting != 0
    }

    /// Record which node is allowed to follow up the in-progress bypass.
    ///
    /// Must only be called while holding the lock for one side. The release
    /// fence is balanced by the acquire fence in
    /// [`allowed_bypass_request_source`](Self::allowed_bypass_request_source).
    pub fn set_allowed_bypass_request_source(&self, source: NodeName) {
        let bytes = source.as_ref();
        let lo = u64::from_le_bytes(bytes[..8].try_into().expect("slice is exactly 8 bytes"));
        let hi = u64::from_le_bytes(bytes[8..].try_into().expect("slice is exactly 8 bytes"));
        self.allowed_bypass_request_source[0].store(lo, Ordering::Relaxed);
        self.allowed_bypass_request_source[1].store(hi, Ordering::Relaxed);
        fence(Ordering::Release);
    }

    /// Read the stamped bypass source. Balanced by the release fence in
    /// [`set_allowed_bypass_request_source`](Self::set_allowed_bypass_request_source).
    pub fn allowed_bypass_request_source(&self) -> NodeName {
        fence(Ordering::Acquire);
        let lo = self.allowed_bypass_request_source[0].load(Ordering::Relaxed);
        let hi = self.allowed_bypass_request_source[1].load(Ordering::Relaxed);
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&lo.to_le_bytes());
        bytes[8..].copy_from_slice(&hi.to_le_bytes());
        NodeName::new(bytes)
    }

    /// Publish `side`'s inbound queue occupancy for the peer to observe.
    pub fn update_queue_state(&self, side: LinkSide, state: QueueState) {
        let index = if side.is_side_a() { 0 } else { 1 };
        self.queue_states[index].store(state.pack(), Ordering::Release);
    }

    /// Read the occupancy last published by `side`.
    pub fn queue_state(&self, side: LinkSide) -> QueueState {
        let index = if side.is_side_a() { 0 } else { 1 };
        QueueState::unpack(self.queue_states[index].load(Ordering::Acquire))
    }
}
