//! Frame capture side of a lesson: pulls JPEG frames from a source at a fixed
//! rate and offers them to the inference socket.

use anyhow::{Context, Result, bail};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use sign_realtime::StreamingInferenceClient;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, trace, warn};

/// Produces JPEG-encoded frames.
pub trait FrameSource: Send {
    /// The next frame, or `None` when nothing is ready this tick.
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Cycles through the `.jpg`/`.jpeg` files of a directory in name order.
pub struct DirectoryFrames {
    files: Vec<PathBuf>,
    cursor: usize,
}

impl DirectoryFrames {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read frame directory {}", dir.display()))?
        {
            let path = entry?.path();
            let is_jpeg = path
                .extension()
                .and_then(|s| s.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"));
            if path.is_file() && is_jpeg {
                files.push(path);
            }
        }
        if files.is_empty() {
            bail!("No JPEG frames found in {}", dir.display());
        }
        files.sort();
        info!(count = files.len(), dir = %dir.display(), "Loaded frame directory");
        Ok(Self { files, cursor: 0 })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FrameSource for DirectoryFrames {
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let path = &self.files[self.cursor];
        self.cursor = (self.cursor + 1) % self.files.len();
        let bytes =
            std::fs::read(path).with_context(|| format!("Failed to read frame {}", path.display()))?;
        Ok(Some(bytes))
    }
}

/// Where encoded frames go.
pub trait FrameSink: Send + Sync {
    fn is_open(&self) -> bool;
    /// Offers one base64 frame; returns whether it was accepted.
    fn offer(&self, frame_b64: String) -> bool;
}

impl FrameSink for StreamingInferenceClient {
    fn is_open(&self) -> bool {
        self.is_connected()
    }

    fn offer(&self, frame_b64: String) -> bool {
        self.send_frame(frame_b64)
    }
}

/// Plain base64 of the JPEG bytes, no `data:` prefix.
pub fn encode_frame(jpeg: &[u8]) -> String {
    STANDARD.encode(jpeg)
}

/// Offers one frame per tick at `fps` until the task is aborted. Ticks while
/// the sink is not open do nothing, a frame the source fails to produce is
/// skipped, and ticks missed under load are skipped rather than bunched up.
pub async fn run_frame_producer<S, K>(mut source: S, sink: K, fps: u32)
where
    S: FrameSource,
    K: FrameSink,
{
    let period = Duration::from_secs(1) / fps.max(1);
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    debug!(fps, period_ms = period.as_millis() as u64, "Frame producer started");

    let mut sent: u64 = 0;
    loop {
        ticker.tick().await;
        if !sink.is_open() {
            continue;
        }
        let jpeg = match source.next_frame() {
            Ok(Some(jpeg)) => jpeg,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = ?e, "Skipping unreadable frame");
                continue;
            }
        };
        if sink.offer(encode_frame(&jpeg)) {
            sent += 1;
            trace!(sent, "Frame offered");
        }
    }
}
