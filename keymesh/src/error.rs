//! Error types for keymesh.

use std::fmt;

/// Error type for collective index operations.
///
/// Errors are parallel-consistent: when any rank's input is rejected, every
/// rank in the group returns an error from the same call. Ranks whose own
/// input was clean report [`Error::PeerBadInput`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The root rank's span list is not strictly increasing or contains an
    /// empty interval.
    InvalidSpans,
    /// `generate_new_keys` was called with the wrong number of per-span
    /// request counts.
    RequestCountMismatch { got: usize, expected: usize },
    /// `update_keys` was given keys that fall outside every span.
    KeysOutsideSpans { bad: usize, total: usize },
    /// A span cannot satisfy the requested key count.
    SpanExhausted {
        span: usize,
        requested: u64,
        available: u64,
    },
    /// This rank's input was valid but another rank reported bad input.
    PeerBadInput,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidSpans => {
                write!(f, "Partition bounds contain an invalid or overlapping span")
            }
            Error::RequestCountMismatch { got, expected } => {
                write!(
                    f,
                    "Request count mismatch: got {} per-span counts, index has {} spans",
                    got, expected
                )
            }
            Error::KeysOutsideSpans { bad, total } => {
                write!(f, "{} of {} added keys fall outside every span", bad, total)
            }
            Error::SpanExhausted {
                span,
                requested,
                available,
            } => {
                write!(
                    f,
                    "Span {} exhausted: {} keys requested, {} available",
                    span, requested, available
                )
            }
            Error::PeerBadInput => write!(f, "Another rank reported bad input"),
        }
    }
}

impl std::error::Error for Error {}

/// Result type for keymesh operations.
pub type Result<T> = std::result::Result<T, Error>;
