//! Error types for the routing core.

/// Errors surfaced to the portal API.
///
/// These deliberately carry no payload: the kind alone tells the caller
/// everything it can act on, and the variants map one-to-one onto the
/// fabric's stable result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("resource limits exhausted")]
    ResourceExhausted,
    #[error("peer closed or not found")]
    NotFound,
    #[error("nothing available yet")]
    Unavailable,
    #[error("operation not valid in this state")]
    FailedPrecondition,
    #[error("operation already in progress")]
    AlreadyExists,
    #[error("out of range")]
    OutOfRange,
}

/// Errors produced while decoding a node link message.
///
/// Any of these on a live link is a protocol violation: a well-behaved peer
/// never produces them, so the receiving node link disconnects.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("message too short: need at least {min} bytes, got {actual}")]
    TooShort { min: usize, actual: usize },
    #[error("unknown message type: {0:#04x}")]
    UnknownMessageType(u8),
    #[error("message length mismatch: {trailing} trailing bytes")]
    TrailingBytes { trailing: usize },
    #[error("invalid handle type: {0:#04x}")]
    InvalidHandleType(u8),
}

/// Errors surfaced by a transport driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport disconnected")]
    Disconnected,
}
