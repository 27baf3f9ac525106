//! Typed error taxonomy for DSS and peer-USS calls, sharpened from bare
//! `anyhow::Error` at the HTTP-transport boundary into the kinds callers need
//! to branch on (auth failure vs. conflict vs. transient unreachability).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DssError {
    #[error("DSS auth failed: {0}")]
    Auth(String),

    #[error("DSS client error {code}: {message}")]
    Client { code: u16, message: String },

    #[error("DSS rejected the request due to an airspace-key mismatch (409)")]
    Conflict,

    #[error("DSS unreachable: {0}")]
    Unreachable(String),

    #[error("DSS call timed out")]
    Timeout,
}

impl DssError {
    /// True when a retry with backoff is worth attempting (transport-level
    /// failure), false when the caller should surface the error as-is.
    pub fn is_transient(&self) -> bool {
        matches!(self, DssError::Unreachable(_) | DssError::Timeout)
    }
}
