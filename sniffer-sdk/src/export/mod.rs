//! Reporter interface for sealed segments.
use crate::trace::Segment;
use futures_util::future::BoxFuture;
use std::fmt::Debug;
use std::time::Duration;

/// Describes why a batch could not be delivered.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReportError {
    /// The reporter did not answer in time. The batch may or may not have
    /// reached the collector.
    #[error("report timed out after {0:?}")]
    Timeout(Duration),

    /// The collector could not be reached; nothing was delivered.
    #[error("collector unavailable: {0}")]
    Unavailable(String),

    /// The collector refused the batch.
    #[error("batch rejected: {0}")]
    Rejected(String),
}

impl ReportError {
    /// Whether the batch may already have been delivered. Ambiguous failures
    /// are redelivered at most once.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, ReportError::Timeout(_))
    }
}

/// Outcome of one [`SegmentReporter::send`] call.
pub type ReportResult = Result<(), ReportError>;

/// `SegmentReporter` moves batches of sealed segments to a remote collector.
///
/// The dispatcher calls it from its worker threads, possibly from several
/// workers at once, and always under a timeout.
pub trait SegmentReporter: Send + Sync + Debug {
    /// Sends a batch.
    ///
    /// Implementations copy or serialize what they need from `batch` before
    /// returning and do the I/O inside the returned future: the timeout only
    /// bounds the future, not the call itself.
    ///
    /// A batch whose previous attempt timed out may be sent a second time, so
    /// the collector side must tolerate one duplicate delivery.
    fn send(&self, batch: &[Segment]) -> BoxFuture<'static, ReportResult>;

    /// Called once when the pipeline shuts down.
    fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeouts_are_ambiguous() {
        assert!(ReportError::Timeout(Duration::from_secs(1)).is_ambiguous());
        assert!(!ReportError::Unavailable("down".into()).is_ambiguous());
        assert!(!ReportError::Rejected("too large".into()).is_ambiguous());
    }
}
