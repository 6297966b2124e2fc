//! The lesson event loop.
//!
//! One task owns the `AttemptTracker`. Predictions from the inference client,
//! learner commands and finished progress saves all arrive here and are
//! handled one at a time, so the tracker never needs a lock.

use anyhow::{Result, bail};
use async_trait::async_trait;
use sign_realtime::{ClientEvent, StreamingInferenceClient};
use signstream_core::lesson::Lesson;
use signstream_core::progress::ProgressSaver;
use signstream_core::threshold::ThresholdPolicy;
use signstream_core::tracker::{
    AttemptOutcome, AttemptTracker, SaveResolution, SaveState, SaveTicket, TrackerConfig,
};
use signstream_core::{Mode, Model};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// The part of the inference client a session drives.
#[async_trait]
pub trait InferenceLink: Send + Sync {
    /// Points the backend at a lesson: classifier mode, model and target hint.
    async fn configure(&self, mode: Mode, model: Model, target: Option<String>);
}

#[async_trait]
impl InferenceLink for StreamingInferenceClient {
    async fn configure(&self, mode: Mode, model: Model, target: Option<String>) {
        self.set_mode(mode).await;
        self.set_model(model).await;
        self.set_target(target).await;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    Retry,
    SwitchLesson(Lesson),
    Stop,
}

/// What the UI layer needs to redraw.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Connection { connected: bool },
    Prediction {
        label: Option<String>,
        confidence: Option<f32>,
    },
    Success { successes: u32, required: u32 },
    Saving,
    Saved,
    SaveFailed(String),
    Reset { lesson_id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub lesson_id: String,
    pub successes: u32,
    pub passed: bool,
    pub saved: bool,
    pub last_error: Option<String>,
}

pub struct LessonSession {
    pub link: Arc<dyn InferenceLink>,
    pub saver: Arc<dyn ProgressSaver>,
    pub tracker: TrackerConfig,
    pub policy: ThresholdPolicy,
}

type SaveDone = (SaveTicket, Result<(), String>);

fn now() -> std::time::Instant {
    Instant::now().into_std()
}

async fn publish(updates: &mpsc::Sender<SessionUpdate>, update: SessionUpdate) {
    // A closed receiver just means nobody is watching.
    let _ = updates.send(update).await;
}

async fn configure_for(link: &dyn InferenceLink, lesson: &Lesson) {
    link.configure(
        lesson.mode(),
        lesson.model(),
        Some(lesson.target_sign().to_string()),
    )
    .await;
}

fn spawn_save(saver: Arc<dyn ProgressSaver>, ticket: SaveTicket, done: mpsc::Sender<SaveDone>) {
    tokio::spawn(async move {
        let outcome = saver
            .save_progress(ticket.report.clone())
            .await
            .map_err(|e| e.to_string());
        let _ = done.send((ticket, outcome)).await;
    });
}

/// Runs one lesson until `Stop` arrives or the command channel closes.
///
/// `events` must be subscribed before the client connects so no result is
/// missed. An in-flight progress save is waited for before returning.
pub async fn run_lesson_session(
    session: LessonSession,
    mut lesson: Lesson,
    mut events: broadcast::Receiver<ClientEvent>,
    mut commands: mpsc::Receiver<SessionCommand>,
    updates: mpsc::Sender<SessionUpdate>,
) -> Result<SessionSummary> {
    let LessonSession {
        link,
        saver,
        tracker: tracker_config,
        policy,
    } = session;
    let (save_tx, mut save_rx) = mpsc::channel::<SaveDone>(4);
    let mut tracker = AttemptTracker::new(lesson.lesson_id.clone(), tracker_config, policy, now());

    configure_for(link.as_ref(), &lesson).await;
    info!(lesson_id = %lesson.lesson_id, target = %lesson.target_sign(), "Lesson session started");

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(SessionCommand::Retry) => {
                    tracker.retry(now());
                    publish(&updates, SessionUpdate::Reset { lesson_id: lesson.lesson_id.clone() }).await;
                }
                Some(SessionCommand::SwitchLesson(next)) => {
                    if tracker.begin_lesson(&next.lesson_id, now()) {
                        lesson = next;
                        configure_for(link.as_ref(), &lesson).await;
                        publish(&updates, SessionUpdate::Reset { lesson_id: lesson.lesson_id.clone() }).await;
                    }
                }
                Some(SessionCommand::Stop) | None => break,
            },
            event = events.recv() => match event {
                Ok(ClientEvent::Result(result)) => {
                    publish(&updates, SessionUpdate::Prediction {
                        label: result.top_label.clone(),
                        confidence: result.confidence,
                    }).await;
                    match tracker.ingest(&result, lesson.target_sign(), lesson.mode(), now()) {
                        AttemptOutcome::Accepted { successes } => {
                            let required = tracker.config().required_successes;
                            publish(&updates, SessionUpdate::Success { successes, required }).await;
                        }
                        AttemptOutcome::QuotaReached(ticket) => {
                            let required = tracker.config().required_successes;
                            let successes = tracker.state().success_count;
                            publish(&updates, SessionUpdate::Success { successes, required }).await;
                            publish(&updates, SessionUpdate::Saving).await;
                            spawn_save(saver.clone(), ticket, save_tx.clone());
                        }
                        AttemptOutcome::Ignored(_)
                        | AttemptOutcome::Missed { .. }
                        | AttemptOutcome::CoolingDown => {}
                    }
                }
                Ok(ClientEvent::Connected) => {
                    publish(&updates, SessionUpdate::Connection { connected: true }).await;
                }
                Ok(ClientEvent::Disconnected) => {
                    publish(&updates, SessionUpdate::Connection { connected: false }).await;
                }
                Ok(ClientEvent::Error(e)) => debug!(error = %e, "Inference client reported an error"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Session fell behind the inference stream");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    bail!("Inference client stopped during lesson {}", lesson.lesson_id);
                }
            },
            Some((ticket, outcome)) = save_rx.recv() => {
                resolve_save(&mut tracker, &ticket, outcome, &updates).await;
            },
        }
    }

    drop(save_tx);
    // Saves started before a reset may still land first; they resolve as stale.
    while tracker.state().save == SaveState::Saving {
        info!("Waiting for the progress save to finish");
        let Some((ticket, outcome)) = save_rx.recv().await else {
            break;
        };
        resolve_save(&mut tracker, &ticket, outcome, &updates).await;
    }

    let state = tracker.state();
    Ok(SessionSummary {
        lesson_id: tracker.lesson_id().to_string(),
        successes: state.success_count,
        passed: tracker.is_passed(),
        saved: state.save == SaveState::Saved,
        last_error: state.last_error.clone(),
    })
}

async fn resolve_save(
    tracker: &mut AttemptTracker,
    ticket: &SaveTicket,
    outcome: Result<(), String>,
    updates: &mpsc::Sender<SessionUpdate>,
) {
    match tracker.complete_save(ticket, outcome) {
        SaveResolution::Saved => publish(updates, SessionUpdate::Saved).await,
        SaveResolution::RolledBack(message) => {
            publish(updates, SessionUpdate::SaveFailed(message)).await;
        }
        SaveResolution::Stale => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use mockall::{Sequence, mock};
    use signstream_core::prediction::PredictionResult;
    use signstream_core::progress::ProgressReport;
    use std::sync::Mutex;
    use std::time::Duration;

    mock! {
        Saver {}
        #[async_trait]
        impl ProgressSaver for Saver {
            async fn save_progress(&self, report: ProgressReport) -> Result<()>;
        }
    }

    #[derive(Default)]
    struct RecordingLink {
        configured: Mutex<Vec<(Mode, Model, Option<String>)>>,
    }

    #[async_trait]
    impl InferenceLink for RecordingLink {
        async fn configure(&self, mode: Mode, model: Model, target: Option<String>) {
            self.configured.lock().unwrap().push((mode, model, target));
        }
    }

    fn lesson(id: &str, category: &str) -> Lesson {
        serde_json::from_value(serde_json::json!({
            "lesson_id": id,
            "title": id,
            "category": category,
        }))
        .unwrap()
    }

    fn hit(label: &str) -> ClientEvent {
        ClientEvent::Result(PredictionResult {
            top_label: Some(label.to_string()),
            confidence: Some(0.95),
            candidates: vec![],
            motion_score: None,
            hand_confidence: Some(0.9),
            feature_count: 336,
            mode: Some(Mode::Letters),
            model: Model::Letters,
        })
    }

    struct Harness {
        link: Arc<RecordingLink>,
        events: broadcast::Sender<ClientEvent>,
        commands: mpsc::Sender<SessionCommand>,
        updates: mpsc::Receiver<SessionUpdate>,
        task: tokio::task::JoinHandle<Result<SessionSummary>>,
    }

    /// Succeeds after sleeping for the next queued delay.
    struct SlowSaver {
        delays: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl ProgressSaver for SlowSaver {
        async fn save_progress(&self, _report: ProgressReport) -> Result<()> {
            let delay = self.delays.lock().unwrap().remove(0);
            tokio::time::sleep(delay).await;
            Ok(())
        }
    }

    fn start(saver: impl ProgressSaver + 'static, lesson: Lesson) -> Harness {
        let link = Arc::new(RecordingLink::default());
        let (events, events_rx) = broadcast::channel(16);
        let (commands, commands_rx) = mpsc::channel(4);
        let (updates_tx, updates) = mpsc::channel(64);
        let session = LessonSession {
            link: link.clone(),
            saver: Arc::new(saver),
            tracker: TrackerConfig {
                required_successes: 2,
                cooldown: Duration::from_millis(2000),
            },
            policy: ThresholdPolicy::default(),
        };
        let task = tokio::spawn(run_lesson_session(
            session, lesson, events_rx, commands_rx, updates_tx,
        ));
        Harness {
            link,
            events,
            commands,
            updates,
            task,
        }
    }

    /// Next update that is not a live prediction echo.
    async fn next_update(updates: &mut mpsc::Receiver<SessionUpdate>) -> SessionUpdate {
        loop {
            match updates.recv().await.unwrap() {
                SessionUpdate::Prediction { .. } => continue,
                update => return update,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_saves_once_and_summary_reports_it() {
        let mut saver = MockSaver::new();
        saver
            .expect_save_progress()
            .withf(|report| report.lesson_id == "letters_A")
            .times(1)
            .returning(|_| Ok(()));
        let mut h = start(saver, lesson("letters_A", "letters"));

        h.events.send(hit("A")).unwrap();
        assert_eq!(
            next_update(&mut h.updates).await,
            SessionUpdate::Success { successes: 1, required: 2 }
        );

        // Inside the cooldown: echoed but not counted.
        tokio::time::advance(Duration::from_millis(500)).await;
        h.events.send(hit("A")).unwrap();
        assert!(matches!(h.updates.recv().await, Some(SessionUpdate::Prediction { .. })));

        tokio::time::advance(Duration::from_millis(2000)).await;
        h.events.send(hit("a")).unwrap();
        assert_eq!(
            next_update(&mut h.updates).await,
            SessionUpdate::Success { successes: 2, required: 2 }
        );
        assert_eq!(next_update(&mut h.updates).await, SessionUpdate::Saving);
        assert_eq!(next_update(&mut h.updates).await, SessionUpdate::Saved);

        // Further successes never trigger another save.
        tokio::time::advance(Duration::from_millis(2500)).await;
        h.events.send(hit("A")).unwrap();
        assert_eq!(
            next_update(&mut h.updates).await,
            SessionUpdate::Success { successes: 3, required: 2 }
        );

        h.commands.send(SessionCommand::Stop).await.unwrap();
        let summary = h.task.await.unwrap().unwrap();
        assert_eq!(
            summary,
            SessionSummary {
                lesson_id: "letters_A".to_string(),
                successes: 3,
                passed: true,
                saved: true,
                last_error: None,
            }
        );
        assert_eq!(
            h.link.configured.lock().unwrap()[0],
            (Mode::Letters, Model::Letters, Some("A".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_save_rolls_back_and_retries_on_next_success() {
        let mut saver = MockSaver::new();
        let mut seq = Sequence::new();
        saver
            .expect_save_progress()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(anyhow!("Lesson not found")));
        saver
            .expect_save_progress()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        let mut h = start(saver, lesson("letters_B", "letters"));

        for _ in 0..2 {
            h.events.send(hit("B")).unwrap();
            next_update(&mut h.updates).await;
            tokio::time::advance(Duration::from_millis(2500)).await;
        }
        assert_eq!(next_update(&mut h.updates).await, SessionUpdate::Saving);
        assert_eq!(
            next_update(&mut h.updates).await,
            SessionUpdate::SaveFailed("Lesson not found".to_string())
        );

        h.events.send(hit("B")).unwrap();
        assert_eq!(
            next_update(&mut h.updates).await,
            SessionUpdate::Success { successes: 3, required: 2 }
        );
        assert_eq!(next_update(&mut h.updates).await, SessionUpdate::Saving);
        assert_eq!(next_update(&mut h.updates).await, SessionUpdate::Saved);

        h.commands.send(SessionCommand::Stop).await.unwrap();
        let summary = h.task.await.unwrap().unwrap();
        assert!(summary.saved);
        assert_eq!(summary.last_error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_lesson_resets_and_reconfigures() {
        let mut saver = MockSaver::new();
        saver.expect_save_progress().never();
        let mut h = start(saver, lesson("letters_C", "letters"));

        h.events.send(hit("C")).unwrap();
        next_update(&mut h.updates).await;

        h.commands
            .send(SessionCommand::SwitchLesson(lesson("gesture_MORE", "gesture")))
            .await
            .unwrap();
        assert_eq!(
            next_update(&mut h.updates).await,
            SessionUpdate::Reset {
                lesson_id: "gesture_MORE".to_string()
            }
        );

        // Same lesson again is a no-op.
        h.commands
            .send(SessionCommand::SwitchLesson(lesson("gesture_MORE", "gesture")))
            .await
            .unwrap();
        h.commands.send(SessionCommand::Stop).await.unwrap();

        let summary = h.task.await.unwrap().unwrap();
        assert_eq!(summary.lesson_id, "gesture_MORE");
        assert_eq!(summary.successes, 0);
        let configured = h.link.configured.lock().unwrap();
        assert_eq!(configured.len(), 2);
        assert_eq!(
            configured[1],
            (Mode::Letters, Model::Gestures, Some("MORE".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_discards_progress_and_connection_is_reported() {
        let mut saver = MockSaver::new();
        saver.expect_save_progress().never();
        let mut h = start(saver, lesson("numbers_3", "numbers"));

        h.events.send(ClientEvent::Connected).unwrap();
        assert_eq!(
            next_update(&mut h.updates).await,
            SessionUpdate::Connection { connected: true }
        );

        h.commands.send(SessionCommand::Retry).await.unwrap();
        assert_eq!(
            next_update(&mut h.updates).await,
            SessionUpdate::Reset {
                lesson_id: "numbers_3".to_string()
            }
        );

        drop(h.commands);
        let summary = h.task.await.unwrap().unwrap();
        assert!(!summary.passed);
        assert_eq!(
            h.link.configured.lock().unwrap()[0].0,
            Mode::Numbers
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_past_a_save_made_stale_by_retry() {
        // The save from before the retry finishes first.
        let saver = SlowSaver {
            delays: Mutex::new(vec![Duration::from_secs(10), Duration::from_secs(20)]),
        };
        let mut h = start(saver, lesson("letters_D", "letters"));

        for round in 0..2 {
            for _ in 0..2 {
                h.events.send(hit("D")).unwrap();
                next_update(&mut h.updates).await;
                tokio::time::advance(Duration::from_millis(2500)).await;
            }
            assert_eq!(next_update(&mut h.updates).await, SessionUpdate::Saving);
            if round == 0 {
                h.commands.send(SessionCommand::Retry).await.unwrap();
                assert_eq!(
                    next_update(&mut h.updates).await,
                    SessionUpdate::Reset {
                        lesson_id: "letters_D".to_string()
                    }
                );
            }
        }

        h.commands.send(SessionCommand::Stop).await.unwrap();
        let summary = h.task.await.unwrap().unwrap();
        assert!(summary.saved);
        assert_eq!(summary.successes, 2);
        assert_eq!(next_update(&mut h.updates).await, SessionUpdate::Saved);
    }
}
