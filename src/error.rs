use thiserror::Error;

/// Errors surfaced by the congestion control core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendSideError {
    /// Feedback or a sent notification referenced a packet that was never
    /// added or has already been evicted from the history window.
    #[error("unknown packet (seq {0})")]
    UnknownPacket(u16),
    /// A feedback batch whose base sequence precedes everything we still
    /// remember. The whole batch is dropped.
    #[error("feedback out of order")]
    FeedbackOutOfOrder,
    /// The pacer queue is at its configured length; the packet was rejected.
    #[error("pacer queue overflow")]
    QueueOverflow,
    /// A packet sat in the pacer queue longer than the configured limit.
    #[error("pacer queue stalled")]
    QueueStalled,
    /// Bitrate constraints are unusable. Stored as a string so the variant
    /// stays Clone/Eq.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}
