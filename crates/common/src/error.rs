use thiserror::Error;

/// Canonical error taxonomy used across shuffle-service crates.
///
/// Classification guidance:
/// - `PushData*`: producer-visible push failures; callers match on the kind
///   to decide between retrying the same location, switching to the peer
///   replica, or requesting a fresh epoch
/// - `SoftSplit` / `HardSplit` / `StageEnd`: partition lifecycle statuses a
///   worker returns instead of accepting a push
/// - `Fetch*` / `Integrity*`: consumer-side read failures surfaced to the
///   compute framework to trigger stage retry
/// - `BufferExhausted` / `FlusherBackPressure` / `WorkerBusy`: bounded-resource
///   rejections; callers back off and retry
/// - [`RssError::Io`]: raw filesystem/network IO failures from std APIs
#[derive(Debug, Error)]
pub enum RssError {
    /// Flusher rejected the write or the disk failed on the primary replica.
    #[error("push data write failed on primary: {0}")]
    PushDataWriteFailPrimary(String),

    /// The replica push could not be completed after retries.
    #[error("push data write failed on replica: {0}")]
    PushDataWriteFailReplica(String),

    /// TCP connect or reset while pushing.
    #[error("push data connection failed: {0}")]
    PushDataConnectionFail(String),

    /// A pushed batch stayed in flight longer than the configured timeout.
    #[error("push data timed out: {0}")]
    PushDataTimeout(String),

    /// The worker rate-capped this user or itself.
    #[error("push rejected by congestion control: {0}")]
    PushDataCongestControl(String),

    /// Partition exceeded the split threshold; the current epoch stays
    /// writable while a new epoch is assigned.
    #[error("partition soft split requested: {0}")]
    SoftSplit(String),

    /// Partition exceeded the split threshold; the current epoch rejects
    /// further pushes until the epoch is bumped.
    #[error("partition hard split: {0}")]
    HardSplit(String),

    /// The registry closed this partition; the producer terminates cleanly.
    #[error("stage already ended: {0}")]
    StageEnd(String),

    /// Reader could not fetch a chunk after exhausting retries.
    #[error("fetch failed: {0}")]
    FetchFail(String),

    /// Aggregated commit metadata digest did not match the delivered bytes.
    #[error("integrity mismatch: {0}")]
    IntegrityMismatch(String),

    /// Commit metadata missing for one or more committed map attempts.
    #[error("integrity incomplete: {0}")]
    IntegrityIncomplete(String),

    /// No buffer became available within the acquire timeout.
    #[error("buffer pool exhausted: {0}")]
    BufferExhausted(String),

    /// The flusher queue stayed full for the submit timeout, or the flusher
    /// was stopped by a disk error.
    #[error("flusher back-pressure: {0}")]
    FlusherBackPressure(String),

    /// The partition file writer was aborted by a flush failure.
    #[error("writer aborted: {0}")]
    WriterAborted(String),

    /// Worker has no capacity for the request right now.
    #[error("worker busy: {0}")]
    WorkerBusy(String),

    /// Both the primary and the replica location are unreachable.
    #[error("replica unavailable: {0}")]
    ReplicaUnavailable(String),

    /// Invalid or inconsistent configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Valid request for behavior not implemented in this build.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RssError {
    /// Whether a producer may retry this failure against another location
    /// (peer replica or a freshly assigned epoch).
    pub fn is_push_retryable(&self) -> bool {
        matches!(
            self,
            RssError::PushDataWriteFailPrimary(_)
                | RssError::PushDataWriteFailReplica(_)
                | RssError::PushDataConnectionFail(_)
                | RssError::PushDataTimeout(_)
                | RssError::WorkerBusy(_)
        )
    }
}

/// Standard result alias.
pub type Result<T> = std::result::Result<T, RssError>;
