use thiserror::Error;

use crate::interpolation::Method;

pub type Result<T> = std::result::Result<T, Error>;

/// Typed failures surfaced by evaluation.
///
/// Remote-I/O failures are retried with bounded exponential backoff before
/// surfacing as [`Error::UpstreamUnavailable`]. An empty source intersection
/// is not an error; it fills with NaN.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid coordinates: {0}")]
    InvalidCoordinates(String),

    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("no interpolator for method `{method}` from ({src}) to ({dst})")]
    InterpolationUnavailable {
        method: Method,
        src: String,
        dst: String,
    },

    #[error("upstream source unavailable after {attempts} attempt(s)")]
    UpstreamUnavailable {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("cache entry corrupt: {0}")]
    CacheCorrupt(String),

    #[error("evaluation cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Configuration(String),
}
