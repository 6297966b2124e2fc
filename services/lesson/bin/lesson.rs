//! Practice one sign lesson from the terminal.
//!
//! This binary is responsible for:
//! 1. Loading configuration and the lesson metadata.
//! 2. Connecting to the inference backend and streaming frames to it.
//! 3. Running the lesson loop until the learner quits or presses Ctrl+C.
//! 4. Reporting the result and pointing at the next lesson.

use anyhow::Context;
use clap::Parser;
use sign_realtime::{ClientConfig, StreamingInferenceClient};
use signstream_core::lesson::neighbours;
use signstream_core::threshold::ThresholdPolicy;
use signstream_core::tracker::TrackerConfig;
use signstream_lesson::{
    config::Config,
    frames::{DirectoryFrames, run_frame_producer},
    session::{LessonSession, SessionCommand, SessionUpdate, run_lesson_session},
    state::AppContext,
};
use std::{path::PathBuf, sync::Arc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(version, about = "Practice a sign language lesson against the inference backend")]
struct Args {
    /// Lesson to practice, e.g. `letters_A` or `gesture_MORE`.
    lesson_id: String,
    /// Directory of JPEG frames standing in for the camera.
    #[arg(long)]
    frames: PathBuf,
    /// Frames per second; defaults to FRAME_RATE.
    #[arg(long)]
    fps: Option<u32>,
}

/// Listens for the `Ctrl+C` signal and asks the lesson to stop.
async fn shutdown_signal(commands: mpsc::Sender<SessionCommand>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        return;
    }
    info!("Received shutdown signal. Stopping lesson...");
    let _ = commands.send(SessionCommand::Stop).await;
}

/// `r` retries the lesson, `q` quits.
async fn read_commands(commands: mpsc::Sender<SessionCommand>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let command = match line.trim() {
            "r" => SessionCommand::Retry,
            "q" => SessionCommand::Stop,
            "" => continue,
            other => {
                warn!(input = other, "Unknown command; use 'r' to retry or 'q' to quit");
                continue;
            }
        };
        if commands.send(command).await.is_err() {
            break;
        }
    }
}

async fn print_updates(mut updates: mpsc::Receiver<SessionUpdate>) {
    while let Some(update) = updates.recv().await {
        match update {
            SessionUpdate::Connection { connected: true } => println!("Connected to inference backend"),
            SessionUpdate::Connection { connected: false } => println!("Connection lost, reconnecting..."),
            SessionUpdate::Prediction { .. } => {}
            SessionUpdate::Success { successes, required } => {
                println!("Correct! {successes}/{required}");
            }
            SessionUpdate::Saving => println!("Lesson passed, saving progress..."),
            SessionUpdate::Saved => println!("Progress saved"),
            SessionUpdate::SaveFailed(message) => println!("Could not save progress: {message}"),
            SessionUpdate::Reset { lesson_id } => println!("Starting {lesson_id} over"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();

    let fps = args.fps.unwrap_or(config.frame_rate);
    if fps == 0 {
        anyhow::bail!("--fps must be greater than zero");
    }
    let ctx = AppContext::new(config);

    // --- 3. Load the lesson and the learner's profile ---
    let lesson = ctx
        .api
        .lesson(&args.lesson_id)
        .await
        .with_context(|| format!("Failed to load lesson {}", args.lesson_id))?;
    if ctx.refresh_user().await.is_none() {
        warn!("Continuing without a profile");
    }
    let frames = DirectoryFrames::open(&args.frames)?;
    println!(
        "{}: sign '{}' ({} correct attempts to pass). Type 'r' to retry, 'q' to quit.",
        lesson.title,
        lesson.target_sign(),
        ctx.config.required_successes
    );

    // --- 4. Start the client, session and frame producer ---
    let client = StreamingInferenceClient::spawn(ClientConfig {
        mode: lesson.mode(),
        model: lesson.model(),
        reconnect_delay: ctx.config.reconnect_delay,
        ..ClientConfig::new(ctx.config.inference_ws_url.clone())
    });
    let events = client.subscribe();
    let (commands_tx, commands_rx) = mpsc::channel(8);
    let (updates_tx, updates_rx) = mpsc::channel(64);

    let session = LessonSession {
        link: Arc::new(client.clone()),
        saver: Arc::new(ctx.api.clone()),
        tracker: TrackerConfig {
            required_successes: ctx.config.required_successes,
            cooldown: ctx.config.success_cooldown,
        },
        policy: ThresholdPolicy::default(),
    };
    let session_handle = tokio::spawn(run_lesson_session(
        session,
        lesson.clone(),
        events,
        commands_rx,
        updates_tx,
    ));
    client.connect().await;

    let producer = tokio::spawn(run_frame_producer(frames, client.clone(), fps));
    let printer = tokio::spawn(print_updates(updates_rx));
    let stdin_handle = tokio::spawn(read_commands(commands_tx.clone()));
    let signal_handle = tokio::spawn(shutdown_signal(commands_tx));

    // --- 5. Wait for the lesson to end, then clean up ---
    let summary = session_handle.await.context("Lesson task panicked")?;
    producer.abort();
    stdin_handle.abort();
    signal_handle.abort();
    client.shutdown().await;
    let _ = printer.await;
    let summary = summary?;

    info!(
        lesson_id = %summary.lesson_id,
        successes = summary.successes,
        saved = summary.saved,
        "Lesson finished"
    );
    if let Some(e) = &summary.last_error {
        println!("Last save error: {e}");
    }
    if !summary.passed {
        return Ok(());
    }

    if summary.saved {
        if let Some(stats) = ctx.refresh_stats().await {
            println!(
                "{} of {} lessons completed, {} XP total",
                stats.completed_lessons, stats.total_lessons, stats.total_xp
            );
        }
    }
    match ctx.api.all_lessons().await {
        Ok(lessons) => {
            let (_, next) = neighbours(&lesson.lesson_id, &lesson.category, &lessons);
            match next {
                Some(next) => println!("Next up: {next}"),
                None => println!("That was the last lesson in {}", lesson.category),
            }
        }
        Err(e) => warn!(error = %e, "Could not load the lesson list"),
    }
    Ok(())
}
