//! Error taxonomy shared by every verb in the crate.

/// Failures surfaced by channel and allocator operations.
///
/// Callers decide whether to retry; nothing in this crate retries internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Malformed request: unknown channel id, oversized length, misaligned
    /// or out-of-range address.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The named channel or manager does not exist on this endpoint.
    #[error("no such channel")]
    NotFound,

    /// The channel exists but the handshake has not completed (or recovery
    /// tore it down), so the ring state cannot be trusted yet.
    #[error("channel not ready")]
    NotReady,

    /// A non-blocking call found nothing to do, or a blocking call lost a
    /// race after its wakeup and should be retried.
    #[error("operation would block")]
    WouldBlock,

    /// The deadline expired before the condition held.
    #[error("timed out")]
    TimedOut,

    /// The wait was torn down underneath the caller (endpoint shutdown or
    /// channel destruction).
    #[error("interrupted")]
    Interrupted,

    /// A fixed resource ran out: message ring full, pool empty on a
    /// non-blocking path, allocator out of space.
    #[error("resource exhausted: {0}")]
    Exhausted(&'static str),

    /// The peer closed the channel. Distinct from [`Error::TimedOut`]: the
    /// peer is gone, not merely slow.
    #[error("closed by peer")]
    Closed,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
