use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure modes of a tracking session.
#[derive(Debug, Error)]
pub enum Error {
    /// The caller passed something malformed: mismatched point/label counts,
    /// a box without `clear_old_points`, a mask of the wrong rank, a frame
    /// index outside the video, or an empty prompt.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not legal in the session's current phase, e.g.
    /// registering a new object after tracking has started.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Internal bookkeeping broke an invariant. The offending call is
    /// aborted and the session is left as it was.
    #[error("consistency violation: {0}")]
    ConsistencyViolation(String),

    /// A numeric post-processing step produced unusable values. Callers on
    /// non-essential paths log this and fall back to the unprocessed data.
    #[error("numeric degradation in {stage}: {reason}")]
    NumericDegradation {
        stage: &'static str,
        reason: String,
    },

    #[error(transparent)]
    Backend(#[from] candle_core::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}
