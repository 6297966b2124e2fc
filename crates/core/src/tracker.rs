//! Auto-pass lesson tracking.
//!
//! The tracker turns a stream of predictions into lesson progress: it filters
//! noise, scores each prediction against the target sign, enforces a quiet
//! period after every accepted success and asks its owner to save progress
//! once the success quota is met. Saving is a one-shot per session; a failed
//! save rolls the latch back so a later success can try again.

use crate::prediction::{Mode, PredictionResult};
use crate::progress::ProgressReport;
use crate::threshold::ThresholdPolicy;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Hand confidence at or below this value means no hand was really in frame.
pub const MIN_HAND_CONFIDENCE: f32 = 0.5;

/// Tunables for one tracker instance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerConfig {
    /// Accepted successes needed to pass the lesson.
    pub required_successes: u32,
    /// Minimum gap between two accepted successes.
    pub cooldown: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            required_successes: 5,
            cooldown: Duration::from_millis(2000),
        }
    }
}

/// One accepted attempt. Never modified once recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptResult {
    pub correct: bool,
    pub confidence: f32,
    pub predicted_label: String,
}

/// Progress-save latch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaveState {
    #[default]
    NotSaved,
    /// A save is in flight; no other save may start until it resolves.
    Saving,
    Saved,
}

/// Everything the tracker knows about the current lesson session.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub success_count: u32,
    pub attempt_history: Vec<AttemptResult>,
    pub last_success: Option<Instant>,
    pub save: SaveState,
    /// The most recent save failure, cleared on reset or a successful save.
    pub last_error: Option<String>,
}

/// Why a prediction was thrown away without being scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseReason {
    NoLabel,
    NoConfidence,
    NoHand,
}

/// Permission to run exactly one progress save.
///
/// Tickets carry the tracker generation they were issued under; completing a
/// ticket after the tracker has been reset has no effect.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveTicket {
    generation: u64,
    pub report: ProgressReport,
}

/// What happened to one ingested prediction.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Ignored(NoiseReason),
    /// Wrong sign, or the right sign below the passing threshold.
    Missed {
        predicted: String,
        confidence: f32,
        threshold: f32,
    },
    /// A success inside the quiet period after the previous one.
    CoolingDown,
    Accepted {
        successes: u32,
    },
    /// An accepted success that also met the quota; the owner must run the
    /// save described by the ticket.
    QuotaReached(SaveTicket),
}

/// How a finished save landed.
#[derive(Debug, Clone, PartialEq)]
pub enum SaveResolution {
    Saved,
    RolledBack(String),
    /// The tracker was reset while the save was in flight.
    Stale,
}

pub struct AttemptTracker {
    config: TrackerConfig,
    policy: ThresholdPolicy,
    lesson_id: String,
    started_at: Instant,
    generation: u64,
    state: SessionState,
}

impl AttemptTracker {
    pub fn new(
        lesson_id: impl Into<String>,
        config: TrackerConfig,
        policy: ThresholdPolicy,
        now: Instant,
    ) -> Self {
        Self {
            config,
            policy,
            lesson_id: lesson_id.into(),
            started_at: now,
            generation: 0,
            state: SessionState::default(),
        }
    }

    pub fn lesson_id(&self) -> &str {
        &self.lesson_id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn is_passed(&self) -> bool {
        self.state.success_count >= self.config.required_successes
    }

    /// Scores one prediction against `target`.
    ///
    /// `mode` is the mode the client currently runs with; it is used when the
    /// result itself does not say which mode produced it.
    pub fn ingest(
        &mut self,
        result: &PredictionResult,
        target: &str,
        mode: Mode,
        now: Instant,
    ) -> AttemptOutcome {
        let Some(predicted) = result.top_label.as_deref() else {
            return AttemptOutcome::Ignored(NoiseReason::NoLabel);
        };
        let confidence = result.confidence.unwrap_or(0.0);
        if confidence <= 0.0 {
            return AttemptOutcome::Ignored(NoiseReason::NoConfidence);
        }
        if result.hand_confidence.unwrap_or(0.0) <= MIN_HAND_CONFIDENCE {
            return AttemptOutcome::Ignored(NoiseReason::NoHand);
        }

        let threshold = self
            .policy
            .threshold(result.mode.unwrap_or(mode), result.model, predicted);
        let matches = predicted.to_lowercase() == target.to_lowercase();
        if !matches || confidence < threshold {
            debug!(predicted, target, confidence, threshold, "Attempt missed");
            return AttemptOutcome::Missed {
                predicted: predicted.to_string(),
                confidence,
                threshold,
            };
        }

        if let Some(last) = self.state.last_success {
            if now.saturating_duration_since(last) <= self.config.cooldown {
                return AttemptOutcome::CoolingDown;
            }
        }

        self.state.last_success = Some(now);
        self.state.attempt_history.push(AttemptResult {
            correct: true,
            confidence,
            predicted_label: predicted.to_string(),
        });
        self.state.success_count += 1;
        let successes = self.state.success_count;
        info!(
            lesson_id = %self.lesson_id,
            successes,
            required = self.config.required_successes,
            confidence,
            "Accepted success"
        );

        if successes >= self.config.required_successes && self.state.save == SaveState::NotSaved {
            self.state.save = SaveState::Saving;
            let report = ProgressReport {
                lesson_id: self.lesson_id.clone(),
                score: 100.0,
                accuracy: 100.0,
                duration_secs: now.saturating_duration_since(self.started_at).as_secs(),
                successes: self.config.required_successes,
            };
            info!(lesson_id = %self.lesson_id, "Quota reached, requesting progress save");
            return AttemptOutcome::QuotaReached(SaveTicket {
                generation: self.generation,
                report,
            });
        }

        AttemptOutcome::Accepted { successes }
    }

    /// Reports the outcome of the save a `QuotaReached` ticket asked for.
    pub fn complete_save<E: std::fmt::Display>(
        &mut self,
        ticket: &SaveTicket,
        outcome: Result<(), E>,
    ) -> SaveResolution {
        if ticket.generation != self.generation || self.state.save != SaveState::Saving {
            debug!(lesson_id = %ticket.report.lesson_id, "Discarding save outcome for a reset session");
            return SaveResolution::Stale;
        }
        match outcome {
            Ok(()) => {
                self.state.save = SaveState::Saved;
                self.state.last_error = None;
                info!(lesson_id = %self.lesson_id, "Progress saved");
                SaveResolution::Saved
            }
            Err(e) => {
                let message = e.to_string();
                self.state.save = SaveState::NotSaved;
                self.state.last_error = Some(message.clone());
                warn!(lesson_id = %self.lesson_id, error = %message, "Progress save failed, latch released");
                SaveResolution::RolledBack(message)
            }
        }
    }

    /// Starts the lesson over.
    pub fn retry(&mut self, now: Instant) {
        info!(lesson_id = %self.lesson_id, "Retrying lesson");
        self.reset(now);
    }

    /// Switches to `lesson_id`, resetting the session if it is a different lesson.
    /// Returns whether a reset happened.
    pub fn begin_lesson(&mut self, lesson_id: &str, now: Instant) -> bool {
        if self.lesson_id == lesson_id {
            return false;
        }
        info!(from = %self.lesson_id, to = %lesson_id, "Lesson changed");
        self.lesson_id = lesson_id.to_string();
        self.reset(now);
        true
    }

    fn reset(&mut self, now: Instant) {
        self.generation += 1;
        self.started_at = now;
        self.state = SessionState::default();
    }
}
