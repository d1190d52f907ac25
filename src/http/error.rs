//! Error types for outbound HTTP calls.
//!
//! [`HttpError`] separates the three ways a request can fail: the deadline
//! ran out, the server answered with a non-2xx status, or the transport
//! itself failed. The retry layer treats all of them as one consumed attempt;
//! only the deadline is classified differently, and it is tagged here at the
//! point of detection.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HttpError {
    /// The request did not finish before the caller's deadline.
    #[error("request timed out")]
    Timeout,

    /// The server answered with a non-success status.
    /// Carries the status code and the response body.
    #[error("upstream returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// Underlying transport failure (DNS, connection refused, TLS).
    #[error("network error: {0}")]
    Network(reqwest::Error),

    /// The response body was not what the caller expected.
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for HttpError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            HttpError::Timeout
        } else {
            HttpError::Network(err)
        }
    }
}

impl HttpError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, HttpError::Timeout)
    }
}
