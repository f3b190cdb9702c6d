//! Parcels: the ordered unit of transport along a route.

use std::fmt;
use std::sync::Arc;

use weft_core::queue::{Sequenced, SequencedQueue};
use weft_core::sequence::SequenceNumber;

use crate::router::Router;
use crate::transport::DriverObject;

/// An object attached to a parcel.
pub enum ParcelObject {
    /// A portal in transit. Carrying the router directly lets a proxy
    /// forward the attachment without knowing about the API wrapper.
    Portal(Arc<Router>),
    /// An opaque boxed driver object.
    Box(DriverObject),
}

impl fmt::Debug for ParcelObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Portal(_) => write!(f, "Portal"),
            Self::Box(_) => write!(f, "Box"),
        }
    }
}

/// One ordered unit of data and attachments.
///
/// The payload is sealed behind an `Arc` when the parcel is created, so
/// proxies forward it and two-phase receives expose it without copying.
#[derive(Debug)]
#[must_use]
pub struct Parcel {
    sequence_number: SequenceNumber,
    data: Arc<[u8]>,
    objects: Vec<ParcelObject>,
}

impl Parcel {
    pub fn new(data: Arc<[u8]>, objects: Vec<ParcelObject>) -> Self {
        Self {
            sequence_number: SequenceNumber::ZERO,
            data,
            objects,
        }
    }

    pub fn from_bytes(data: &[u8]) -> Self {
        Self::new(Arc::from(data), Vec::new())
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        self.sequence_number
    }

    pub fn set_sequence_number(&mut self, n: SequenceNumber) {
        self.sequence_number = n;
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// A zero-copy handle to the payload.
    pub fn share_data(&self) -> Arc<[u8]> {
        Arc::clone(&self.data)
    }

    pub fn data_size(&self) -> usize {
        self.data.len()
    }

    pub fn objects(&self) -> &[ParcelObject] {
        &self.objects
    }

    pub fn num_objects(&self) -> usize {
        self.objects.len()
    }

    /// Take ownership of the attachments, leaving the parcel bare.
    pub fn take_objects(&mut self) -> Vec<ParcelObject> {
        std::mem::take(&mut self.objects)
    }
}

impl fmt::Display for Parcel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "parcel {} ({} bytes, {} objects)",
            self.sequence_number,
            self.data.len(),
            self.objects.len()
        )
    }
}

impl Sequenced for Parcel {
    fn size_in_bytes(&self) -> usize {
        self.data.len()
    }
}

/// The queue type used for both directions of every router.
pub type ParcelQueue = SequencedQueue<Parcel>;
