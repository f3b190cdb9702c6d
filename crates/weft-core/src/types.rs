//! Newtype wrappers for fabric identifiers.
//!
//! These types provide type safety, preventing accidental mixing of the
//! various 64-bit identifiers that flow through the fabric, and give node
//! names a stable formatting.

use core::fmt;

/// Helper to write lowercase hex without the `hex` crate.
fn fmt_hex(bytes: &[u8], f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for byte in bytes {
        write!(f, "{:02x}", byte)?;
    }
    Ok(())
}

/// A 128-bit node name, unique per process within a connected fabric.
///
/// Names are generated randomly at node creation; the probability of a
/// collision between any two nodes is negligible.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[must_use]
pub struct NodeName([u8; 16]);

impl NodeName {
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random name.
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl AsRef<[u8]> for NodeName {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<&[u8]> for NodeName {
    type Error = InvalidLength;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let arr: [u8; 16] = bytes.try_into().map_err(|_| InvalidLength {
            expected: 16,
            actual: bytes.len(),
        })?;
        Ok(Self(arr))
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_hex(&self.0, f)
    }
}

impl fmt::Debug for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeName(")?;
        fmt_hex(&self.0[..4], f)?;
        write!(f, "..)")
    }
}

/// Identifies one router-to-router link multiplexed over a node link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[must_use]
pub struct SublinkId(pub u64);

impl fmt::Display for SublinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one shared buffer within a node link's memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[must_use]
pub struct BufferId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One of the two ends of a link. The two ends of any link always hold
/// opposite sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum LinkSide {
    A,
    B,
}

impl LinkSide {
    pub fn opposite(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }

    pub fn is_side_a(self) -> bool {
        matches!(self, Self::A)
    }
}

impl fmt::Display for LinkSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::B => write!(f, "B"),
        }
    }
}

/// The role a link plays on a route.
///
/// A central link spans the two innermost routers of a route and is the only
/// kind of link (besides a bridge) that carries a [`RouterLinkState`].
/// Peripheral links connect a proxy to the rest of its route and exist only
/// until the proxy is bypassed. A bridge splices two routes joined by a
/// merge.
///
/// [`RouterLinkState`]: crate::link_state::RouterLinkState
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum LinkType {
    Central,
    PeripheralInward,
    PeripheralOutward,
    Bridge,
}

impl LinkType {
    /// Whether parcels arriving over this link travel toward the terminal
    /// router (the inbound direction).
    pub fn is_outward(self) -> bool {
        matches!(self, Self::Central | Self::PeripheralOutward)
    }

    pub fn is_peripheral_inward(self) -> bool {
        matches!(self, Self::PeripheralInward)
    }

    pub fn is_central(self) -> bool {
        matches!(self, Self::Central)
    }

    pub fn is_bridge(self) -> bool {
        matches!(self, Self::Bridge)
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Central => write!(f, "central"),
            Self::PeripheralInward => write!(f, "peripheral-inward"),
            Self::PeripheralOutward => write!(f, "peripheral-outward"),
            Self::Bridge => write!(f, "bridge"),
        }
    }
}

/// Error returned when a byte slice has the wrong length for a newtype.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidLength {
    pub expected: usize,
    pub actual: usize,
}

impl fmt::Display for InvalidLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid length: expected {} bytes, got {}",
            self.expected, self.actual
        )
    }
}

impl std::error::Error for InvalidLength {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_name_random_unique() {
        let a = NodeName::random();
        let b = NodeName::random();
        assert_ne!(a, b);
    }

    #[test]
    fn test_node_name_try_from_valid() {
        let bytes = [7u8; 16];
        let name = NodeName::try_from(bytes.as_ref()).unwrap();
        assert_eq!(name.as_ref(), &bytes);
    }

    #[test]
    fn test_node_name_try_from_invalid() {
        let bytes = [7u8; 15];
        let err = NodeName::try_from(bytes.as_ref()).unwrap_err();
        assert_eq!(err.expected, 16);
        assert_eq!(err.actual, 15);
    }

    #[test]
    fn test_node_name_display_hex() {
        let name = NodeName::new([
            0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45,
            0x67, 0x89,
        ]);
        assert_eq!(format!("{name}"), "abcdef0123456789abcdef0123456789");
        assert_eq!(format!("{name:?}"), "NodeName(abcdef01..)");
    }

    #[test]
    fn test_link_side_opposite() {
        assert_eq!(LinkSide::A.opposite(), LinkSide::B);
        assert_eq!(LinkSide::B.opposite(), LinkSide::A);
        assert!(LinkSide::A.is_side_a());
        assert!(!LinkSide::B.is_side_a());
    }

    #[test]
    fn test_link_type_predicates() {
        assert!(LinkType::Central.is_outward());
        assert!(LinkType::PeripheralOutward.is_outward());
        assert!(!LinkType::PeripheralInward.is_outward());
        assert!(!LinkType::Bridge.is_outward());
        assert!(LinkType::PeripheralInward.is_peripheral_inward());
        assert!(LinkType::Central.is_central());
        assert!(LinkType::Bridge.is_bridge());
    }
}
