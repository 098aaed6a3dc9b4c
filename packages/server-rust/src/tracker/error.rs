/// Errors from admitting a request into tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TrackError {
    #[error("tracking registry is shut down")]
    Closed,
    #[error("request is already wrapped by a live tracker")]
    AlreadyTracked,
}

/// Errors from [`OperationTracker::reply`](super::OperationTracker::reply).
#[derive(Debug, thiserror::Error)]
pub enum ReplyError {
    #[error("request has no connection to reply on")]
    NoConnection,
    #[error("failed to encode reply: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("connection outbound queue is full")]
    Backpressure,
    #[error("connection closed")]
    Disconnected,
}
