//! Per-stage outcome tracking

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The outcome of one pipeline stage for one work item.
///
/// A summary is serialized into the work item's state blob after every
/// stage, so a worker picking the item up after a crash can see exactly
/// which stages ran, how often, and what went wrong.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkSummary {
    /// True once the stage that produces this summary has started.
    pub attempted: bool,

    /// Attempt counter, starting at one on the first run.
    pub attempt_number: u32,

    /// Errors collected during this stage.
    pub errors: Vec<String>,

    /// When the attempt started. None means the stage has not run.
    pub started_at: Option<DateTime<Utc>>,

    /// When the attempt finished. The attempt may have finished without
    /// succeeding; check `succeeded()`.
    pub finished_at: Option<DateTime<Utc>>,

    /// Whether a failed stage should be retried. Defaults to true because
    /// transient errors are far more common than fatal ones; fatal errors
    /// (invalid bags, missing prerequisites) set this to false.
    pub retry: bool,

    /// At least one recorded error means the work item can never succeed
    /// without operator intervention.
    pub error_is_fatal: bool,
}

impl WorkSummary {
    pub fn new() -> Self {
        Self {
            retry: true,
            ..Self::default()
        }
    }

    /// Mark the beginning of an attempt.
    pub fn start(&mut self) {
        self.attempted = true;
        self.attempt_number += 1;
        self.started_at = Some(Utc::now());
        self.finished_at = None;
    }

    pub fn started(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn finished(&self) -> bool {
        self.finished_at.is_some()
    }

    pub fn succeeded(&self) -> bool {
        self.finished() && self.errors.is_empty()
    }

    pub fn add_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    /// Record an error that no retry can fix.
    pub fn add_fatal_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
        self.error_is_fatal = true;
        self.retry = false;
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Drop errors from a previous attempt before retrying.
    pub fn clear_errors(&mut self) {
        self.errors.clear();
        self.error_is_fatal = false;
    }

    pub fn first_error(&self) -> Option<&str> {
        self.errors.first().map(String::as_str)
    }

    pub fn all_errors_as_string(&self) -> String {
        self.errors.join("\n")
    }

    pub fn run_time(&self) -> chrono::Duration {
        match self.started_at {
            None => chrono::Duration::zero(),
            Some(start) => self.finished_at.unwrap_or_else(Utc::now) - start,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let mut summary = WorkSummary::new();
        assert!(!summary.attempted);
        assert!(summary.retry);
        assert!(!summary.started());
        assert!(!summary.finished());
        assert!(!summary.succeeded());

        summary.start();
        assert!(summary.attempted);
        assert_eq!(summary.attempt_number, 1);
        assert!(summary.started());
        assert!(!summary.succeeded());

        summary.finish();
        assert!(summary.finished());
        assert!(summary.succeeded());

        summary.start();
        assert_eq!(summary.attempt_number, 2);
        assert!(!summary.finished());
    }

    #[test]
    fn test_errors() {
        let mut summary = WorkSummary::new();
        summary.start();
        summary.add_error("first");
        summary.add_error("second");
        summary.finish();

        assert!(summary.has_errors());
        assert!(!summary.succeeded());
        assert_eq!(summary.first_error(), Some("first"));
        assert_eq!(summary.all_errors_as_string(), "first\nsecond");

        summary.clear_errors();
        assert!(!summary.has_errors());
        assert_eq!(summary.first_error(), None);
    }

    #[test]
    fn test_fatal_error_disables_retry() {
        let mut summary = WorkSummary::new();
        summary.add_fatal_error("bad bag");
        assert!(summary.error_is_fatal);
        assert!(!summary.retry);

        summary.clear_errors();
        assert!(!summary.error_is_fatal);
    }

    #[test]
    fn test_serialization_round_trip() {
        let mut summary = WorkSummary::new();
        summary.start();
        summary.add_error("oops");
        let json = serde_json::to_string(&summary).unwrap();
        let back: WorkSummary = serde_json::from_str(&json).unwrap();
        assert_eq!(back.attempt_number, 1);
        assert_eq!(back.errors, vec!["oops".to_string()]);
        assert!(back.retry);
    }
}
