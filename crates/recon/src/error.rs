//! Error types for the reconciliation engine.
//!
//! The taxonomy follows the failure domains of the system:
//!
//! - [`ReconError::Api`]: the processor answered with a `Failure` ACK. Never
//!   retried here; the orchestrator turns it into a failed order plus a
//!   diagnostic note.
//! - [`ReconError::Transport`]: the HTTPS call itself failed (network,
//!   timeout). Same treatment as an API failure at the orchestrator.
//! - [`ReconError::Validation`]: a webhook payload we cannot act on
//!   (unknown transaction type, unresolvable correlation token). The caller
//!   acknowledges the delivery as a no-op so the processor stops retrying.
//! - [`ReconError::Store`]: the order/subscription collaborator failed. The
//!   only class of error that should surface as a retryable 5xx.
//!
//! State conflicts (marking a paid order paid, cancelling a cancelled
//! subscription) are deliberately not errors: stores treat them as benign
//! no-ops because webhook delivery is at-least-once.

use thiserror::Error;

/// Result alias used throughout the engine.
pub type ReconResult<T> = Result<T, ReconError>;

#[derive(Debug, Error)]
pub enum ReconError {
    /// Processor-reported error code and message from a synchronous call.
    #[error("processor error {code}: {message}")]
    Api { code: String, message: String },

    /// Network failure or timeout talking to the processor.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Malformed or unresolvable inbound data (webhook payloads, responses).
    #[error("validation error: {0}")]
    Validation(String),

    /// Order/subscription store failure.
    #[error("store error: {0}")]
    Store(String),

    /// Missing or invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<sqlx::Error> for ReconError {
    fn from(err: sqlx::Error) -> Self {
        ReconError::Store(err.to_string())
    }
}

impl ReconError {
    /// Whether the error is safe to acknowledge to the processor's
    /// notification channel without triggering a redelivery.
    pub fn is_acknowledgeable(&self) -> bool {
        matches!(self, ReconError::Validation(_))
    }
}
