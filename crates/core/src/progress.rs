use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

/// The outcome of a passed lesson session, as submitted to the progress store.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ProgressReport {
    pub lesson_id: String,
    /// Percentage in `[0, 100]`.
    pub score: f32,
    /// Percentage in `[0, 100]`.
    pub accuracy: f32,
    #[serde(rename = "duration")]
    pub duration_secs: u64,
    #[serde(skip)]
    pub successes: u32,
}

/// Persists lesson progress somewhere outside the process.
///
/// The tracker never calls this itself; whoever owns the tracker runs the save
/// and reports the outcome back through `AttemptTracker::complete_save`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProgressSaver: Send + Sync {
    async fn save_progress(&self, report: ProgressReport) -> Result<()>;
}
