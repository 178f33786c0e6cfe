//! Error classification for filesystem listings and HTTP calls
//!
//! Every network-facing collaborator reports failures as a [`FetchError`].
//! [`classify`] decides, as a pure function of the error, whether the
//! operation may be retried, must fail the current item, or must stop the
//! process.

use std::error::Error as StdError;
use std::io;
use thiserror::Error;

/// Failures of a single filesystem listing or extraction request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The peer violated the protocol or sent a malformed response
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The request could not even be constructed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    /// The transport explicitly reported a temporary condition
    #[error("Temporary failure: {0}")]
    Temporary(String),

    /// Dialing failed (unknown host, no route, ...)
    #[error("Dial failed: {0}")]
    Dial(String),

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Connection reset: {0}")]
    ConnectionReset(String),

    #[error("Unexpected status {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

/// What to do about a failed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Poison the item and stop the process
    Fatal,
    /// Fail the current item, propagate to the caller
    NonRetryable,
    /// Sleep and try the same operation again
    Retryable,
}

/// Classifies an error
///
/// | Error | Class |
/// |-------|-------|
/// | Protocol / malformed response | Fatal |
/// | Request construction | Fatal |
/// | Timeout | NonRetryable |
/// | Temporary, dial, connection refused, connection reset | Retryable |
/// | Anything else | NonRetryable |
pub fn classify(err: &FetchError) -> ErrorClass {
    match err {
        FetchError::Protocol(_) | FetchError::InvalidRequest(_) => ErrorClass::Fatal,
        FetchError::Timeout(_) => ErrorClass::NonRetryable,
        FetchError::Temporary(_)
        | FetchError::Dial(_)
        | FetchError::ConnectionRefused(_)
        | FetchError::ConnectionReset(_) => ErrorClass::Retryable,
        FetchError::Status { .. }
        | FetchError::Decode(_)
        | FetchError::Cancelled
        | FetchError::Other(_) => ErrorClass::NonRetryable,
    }
}

impl FetchError {
    /// Maps a reqwest error onto the fetch error taxonomy
    ///
    /// Timeouts win over everything else; then the first `io::Error` in the
    /// source chain decides; remaining connect failures count as dial errors.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        let message = err.to_string();

        if err.is_timeout() {
            return Self::Timeout(message);
        }

        if err.is_builder() {
            return Self::InvalidRequest(message);
        }

        if let Some(io_err) = find_io_error(&err) {
            match io_err.kind() {
                io::ErrorKind::ConnectionRefused => return Self::ConnectionRefused(message),
                io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                    return Self::ConnectionReset(message)
                }
                io::ErrorKind::TimedOut => return Self::Timeout(message),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => {
                    return Self::Temporary(message)
                }
                _ => {}
            }
        }

        if err.is_connect() {
            return Self::Dial(message);
        }

        if err.is_decode() {
            return Self::Decode(message);
        }

        Self::Other(message)
    }
}

/// Walks the source chain looking for the underlying IO error
fn find_io_error<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a io::Error> {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            return Some(io_err);
        }
        current = e.source();
    }
    None
}
