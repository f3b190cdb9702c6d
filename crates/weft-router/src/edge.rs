//! One router's side of one route direction.
//!
//! A [`RouteEdge`] owns up to two links at a time: the primary link carrying
//! new traffic, and a decaying link draining the tail of a superseded path.
//! Decay is parameterized by two negotiated sequence lengths — everything
//! below `length_to_decaying_link` must still leave on the old link, and the
//! old link is expected to deliver everything below
//! `length_from_decaying_link` — so both sides agree exactly which parcel is
//! the last to travel the old way.

use std::fmt;
use std::sync::Arc;

use weft_core::sequence::SequenceNumber;

use crate::link::RouterLink;
use crate::router::Router;

#[derive(Default)]
#[must_use]
pub struct RouteEdge {
    primary_link: Option<Arc<dyn RouterLink>>,
    decaying_link: Option<Arc<dyn RouterLink>>,
    length_to_decaying_link: Option<SequenceNumber>,
    length_from_decaying_link: Option<SequenceNumber>,
    /// Decay was requested before any primary link existed; the next link
    /// installed lands directly in the decaying slot.
    decay_deferred: bool,
}

impl RouteEdge {
    pub fn primary_link(&self) -> Option<&Arc<dyn RouterLink>> {
        self.primary_link.as_ref()
    }

    pub fn decaying_link(&self) -> Option<&Arc<dyn RouterLink>> {
        self.decaying_link.as_ref()
    }

    pub fn length_to_decaying_link(&self) -> Option<SequenceNumber> {
        self.length_to_decaying_link
    }

    pub fn length_from_decaying_link(&self) -> Option<SequenceNumber> {
        self.length_from_decaying_link
    }

    /// An edge is stable when nothing on it is decaying or scheduled to.
    pub fn is_stable(&self) -> bool {
        self.decaying_link.is_none() && !self.decay_deferred
    }

    /// Install a new primary link. If decay was deferred, the link lands in
    /// the decaying slot instead and begins draining immediately.
    pub fn set_primary_link(&mut self, link: Arc<dyn RouterLink>) {
        debug_assert!(self.primary_link.is_none());
        if self.decay_deferred {
            debug_assert!(self.decaying_link.is_none());
            self.decay_deferred = false;
            self.decaying_link = Some(link);
        } else {
            self.primary_link = Some(link);
        }
    }

    pub fn release_primary_link(&mut self) -> Option<Arc<dyn RouterLink>> {
        self.primary_link.take()
    }

    pub fn release_decaying_link(&mut self) -> Option<Arc<dyn RouterLink>> {
        self.decaying_link.take()
    }

    pub fn get_local_peer(&self) -> Option<Arc<Router>> {
        self.primary_link.as_ref()?.local_peer()
    }

    pub fn get_decaying_local_peer(&self) -> Option<Arc<Router>> {
        self.decaying_link.as_ref()?.local_peer()
    }

    /// Move the primary link into the decaying slot, or defer decay when no
    /// primary link is installed yet. Fails if a decay is already in
    /// progress: an edge never has two decaying links.
    pub fn begin_primary_link_decay(&mut self) -> bool {
        if self.decaying_link.is_some() || self.decay_deferred {
            return false;
        }
        match self.primary_link.take() {
            Some(link) => self.decaying_link = Some(link),
            None => self.decay_deferred = true,
        }
        true
    }

    /// First sequence number that must NOT use the decaying link. Set at
    /// most once per decay cycle.
    pub fn set_length_to_decaying_link(&mut self, length: SequenceNumber) {
        debug_assert!(self.length_to_decaying_link.is_none());
        self.length_to_decaying_link = Some(length);
    }

    /// Final sequence length expected FROM the decaying link. Set at most
    /// once per decay cycle.
    pub fn set_length_from_decaying_link(&mut self, length: SequenceNumber) {
        debug_assert!(self.length_from_decaying_link.is_none());
        self.length_from_decaying_link = Some(length);
    }

    /// Whether sequence number `n` must travel on the decaying link.
    ///
    /// While the split point is still unknown, everything stays on the old
    /// link: the negotiation that produces `length_to_decaying_link` is the
    /// same one that authorizes traffic on the new link.
    pub fn should_transmit_on_decaying_link(&self, n: SequenceNumber) -> bool {
        (self.decaying_link.is_some() || self.decay_deferred)
            && self.length_to_decaying_link.is_none_or(|length| n < length)
    }

    /// Drop the decaying link once both negotiated lengths have been met.
    /// Idempotent; returns true only on the transition.
    pub fn maybe_finish_decay(
        &mut self,
        sequence_length_sent: SequenceNumber,
        sequence_length_received: SequenceNumber,
    ) -> bool {
        if self.decaying_link.is_none() {
            return false;
        }
        let (Some(length_to), Some(length_from)) =
            (self.length_to_decaying_link, self.length_from_decaying_link)
        else {
            return false;
        };
        if sequence_length_sent >= length_to && sequence_length_received >= length_from {
            self.decaying_link = None;
            self.length_to_decaying_link = None;
            self.length_from_decaying_link = None;
            true
        } else {
            false
        }
    }
}

impl fmt::Debug for RouteEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteEdge")
            .field("has_primary", &self.primary_link.is_some())
            .field("has_decaying", &self.decaying_link.is_some())
            .field("length_to_decaying_link", &self.length_to_decaying_link)
            .field("length_from_decaying_link", &self.length_from_decaying_link)
            .field("decay_deferred", &self.decay_deferred)
            .finish()
    }
}
