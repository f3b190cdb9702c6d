//! Gap-tolerant in-order queue keyed by sequence numbers.
//!
//! A [`SequencedQueue`] accepts elements at arbitrary sequence numbers at or
//! beyond the current head and releases them strictly in order. It tracks an
//! optional final sequence length beyond which no element may be pushed, so
//! the consumer can tell the difference between "nothing available right
//! now" and "this sequence is complete".
//!
//! Elements arriving out of order are parked until the gap before them
//! fills. During link decay a single direction is fed by two links at once,
//! so gaps are routine rather than exceptional.

use std::collections::BTreeMap;

use crate::sequence::SequenceNumber;

/// Accounting hook for queued elements.
///
/// `size_in_bytes` feeds the queue's byte counter, which the router
/// publishes to the peer through the shared link state.
pub trait Sequenced {
    fn size_in_bytes(&self) -> usize {
        0
    }
}

/// A queue of `T` keyed by [`SequenceNumber`].
///
/// `current` designates the next element to pop. The *sequence length* is
/// `current` plus the number of contiguously available elements; it is the
/// sequence number the next locally produced element would take.
#[derive(Debug, Default)]
#[must_use]
pub struct SequencedQueue<T> {
    entries: BTreeMap<SequenceNumber, T>,
    current: SequenceNumber,
    final_length: Option<SequenceNumber>,
    /// Number of contiguously available elements starting at `current`.
    num_available: usize,
    /// Total byte size of the contiguously available elements.
    available_bytes: usize,
}

impl<T: Sequenced> SequencedQueue<T> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            current: SequenceNumber::ZERO,
            final_length: None,
            num_available: 0,
            available_bytes: 0,
        }
    }

    /// The sequence number of the next element to pop.
    pub fn current_sequence_number(&self) -> SequenceNumber {
        self.current
    }

    /// `current` plus the contiguously available run. This is the sequence
    /// number the next locally assigned element takes, and the length a
    /// closure at this instant would declare.
    pub fn sequence_length(&self) -> SequenceNumber {
        self.current + self.num_available as u64
    }

    pub fn final_length(&self) -> Option<SequenceNumber> {
        self.final_length
    }

    pub fn has_next_element(&self) -> bool {
        self.num_available > 0
    }

    pub fn num_available_elements(&self) -> usize {
        self.num_available
    }

    pub fn total_available_bytes(&self) -> usize {
        self.available_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether every element of a finalized sequence has been popped.
    pub fn is_fully_consumed(&self) -> bool {
        self.final_length == Some(self.current)
    }

    /// Whether elements not yet present are still expected to arrive.
    pub fn expects_more_elements(&self) -> bool {
        match self.final_length {
            Some(final_length) => self.sequence_length() < final_length,
            None => true,
        }
    }

    /// Rebase an untouched queue at `n`. Used when a router is reconstructed
    /// from a descriptor mid-route.
    pub fn reset_initial_sequence_number(&mut self, n: SequenceNumber) {
        debug_assert!(self.entries.is_empty() && self.final_length.is_none());
        self.current = n;
    }

    /// Insert `element` at sequence number `n`.
    ///
    /// Returns false without mutating the queue if `n` is below `current`,
    /// already occupied, or at/beyond the final length. Rejection is not a
    /// fault: disconnection can truncate a sequence while elements are still
    /// in flight.
    pub fn push(&mut self, n: SequenceNumber, element: T) -> bool {
        if n < self.current {
            return false;
        }
        if let Some(final_length) = self.final_length
            && n >= final_length
        {
            return false;
        }
        if self.entries.contains_key(&n) {
            return false;
        }

        self.entries.insert(n, element);

        // Extend the contiguous run if this push filled the next hole. A
        // single push can connect a parked suffix, so keep walking.
        if n == self.sequence_length() {
            let mut next = n;
            while let Some(entry) = self.entries.get(&next) {
                self.num_available += 1;
                self.available_bytes += entry.size_in_bytes();
                next = next.next();
            }
        }
        true
    }

    /// Pop the next in-order element, if present.
    pub fn pop(&mut self) -> Option<T> {
        let element = self.entries.remove(&self.current)?;
        self.current = self.current.next();
        self.num_available -= 1;
        self.available_bytes -= element.size_in_bytes();
        Some(element)
    }

    /// A reference to the next in-order element, if present.
    pub fn next_element(&self) -> Option<&T> {
        self.entries.get(&self.current)
    }

    /// Advance past `n` without storing an element. Succeeds only when `n`
    /// is the current head, the queue is empty, and `n` is below any final
    /// length. This is the fast path for an uncontended send, where the
    /// element goes straight to a link instead of through the queue.
    pub fn maybe_skip(&mut self, n: SequenceNumber) -> bool {
        if n != self.current || !self.entries.is_empty() {
            return false;
        }
        if let Some(final_length) = self.final_length
            && n >= final_length
        {
            return false;
        }
        self.current = self.current.next();
        true
    }

    /// Declare the total length of this sequence.
    ///
    /// Fails if a final length was already set, if `length` would cut off
    /// the consumed or stored prefix, or if it would leave a gap beyond the
    /// highest stored element (elements on one link are delivered in order,
    /// so a closure can never outrun them).
    pub fn set_final_length(&mut self, length: SequenceNumber) -> bool {
        if self.final_length.is_some() || length < self.sequence_length() {
            return false;
        }
        if let Some((&highest, _)) = self.entries.last_key_value()
            && length != highest.next()
        {
            return false;
        }
        self.final_length = Some(length);
        true
    }

    /// Terminate the sequence at the current head, dropping any parked
    /// elements. Used on route disconnection.
    pub fn force_terminate(&mut self) {
        self.entries.clear();
        self.num_available = 0;
        self.available_bytes = 0;
        self.final_length = Some(self.current);
    }
}
