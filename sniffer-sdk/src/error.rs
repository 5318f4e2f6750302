//! Errors returned by lifecycle operations of the agent.
//!
//! Span operations never return errors: they degrade instead. Only the
//! operations an operator calls explicitly (flush, shutdown, configuration
//! updates) report failures.
use std::sync::PoisonError;
use std::time::Duration;

/// Errors from agent lifecycle operations.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum SdkError {
    /// The component was already shut down.
    #[error("already shut down")]
    AlreadyShutdown,

    /// The operation did not complete within its time budget.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Delivering one or more batches failed.
    #[error("failed to deliver {0} segment batch(es)")]
    DeliveryFailed(u64),

    /// A configuration value was rejected.
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    /// Other failures not covered by the variants above.
    #[error("internal failure: {0}")]
    InternalFailure(String),
}

impl<T> From<PoisonError<T>> for SdkError {
    fn from(err: PoisonError<T>) -> Self {
        SdkError::InternalFailure(format!("mutex poisoned: {err}"))
    }
}

/// Result of agent lifecycle operations.
pub type SdkResult<T = ()> = Result<T, SdkError>;
