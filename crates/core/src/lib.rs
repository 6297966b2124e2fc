//! Core lesson logic shared by the streaming client and the lesson service.
//!
//! Nothing in this crate performs I/O. Side effects (saving progress, fetching
//! profile data) are described here and executed by the runtime that owns the
//! connection.

pub mod lesson;
pub mod prediction;
pub mod progress;
pub mod store;
pub mod threshold;
pub mod tracker;

pub use prediction::{LabelProb, Mode, Model, PredictionResult};
pub use progress::{ProgressReport, ProgressSaver};
pub use threshold::ThresholdPolicy;
pub use tracker::{AttemptOutcome, AttemptResult, AttemptTracker, SaveState, TrackerConfig};
