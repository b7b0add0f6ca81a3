use std::time::Duration;

use async_stream::stream;
use futures::Stream;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

pub mod phase {
    pub const SAFETY_CHECK: &str = "Safety check…";
    pub const CHECKING: &str = "Checking…";
    pub const LOCKING: &str = "Locking…";
    pub const SETTING_METADATA: &str = "Setting metadata…";
    pub const UPLOADING: &str = "Uploading…";
    pub const DOWNLOADING: &str = "Downloading…";
    pub const FINALIZING: &str = "Finalizing…";
    pub const UNLOCKING: &str = "Unlocking…";
    pub const AWAITING_CONFIRMATION: &str = "Waiting for confirmation…";
    pub const CANCELLING: &str = "Cancelling…";
    pub const DONE: &str = "Done";
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct LogLine {
    level: String,
    msg: String,
    stats: Option<RawStats>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default, rename_all = "camelCase")]
struct RawStats {
    bytes: u64,
    total_bytes: u64,
    speed: f64,
    elapsed_time: f64,
    errors: u64,
    fatal_error: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TransferProgress {
    pub bytes: u64,
    /// `None` while the total is unknown; render as indeterminate.
    pub total_bytes: Option<u64>,
    /// Bytes per second.
    pub speed: f64,
    pub eta: Option<Duration>,
    pub elapsed: Duration,
    pub errors: u64,
    pub fatal: bool,
    pub phase: String,
}

impl TransferProgress {
    pub fn new(bytes: u64, total_bytes: Option<u64>, speed: f64, phase: &str) -> Self {
        Self {
            bytes,
            total_bytes,
            speed,
            eta: eta(bytes, total_bytes, speed),
            elapsed: Duration::ZERO,
            errors: 0,
            fatal: false,
            phase: phase.to_string(),
        }
    }

    pub fn is_indeterminate(&self) -> bool {
        self.total_bytes.is_none()
    }

    pub fn fraction(&self) -> Option<f64> {
        self.total_bytes
            .map(|total| (self.bytes as f64 / total as f64).clamp(0.0, 1.0))
    }

    pub fn percent(&self) -> Option<u8> {
        self.fraction().map(|f| (f * 100.0).round() as u8)
    }

    pub fn speed_mib(&self) -> f64 {
        self.speed / 1024.0 / 1024.0
    }
}

fn eta(bytes: u64, total: Option<u64>, speed: f64) -> Option<Duration> {
    let total = total?;
    if speed <= 0.0 || !speed.is_finite() {
        return None;
    }
    let remaining = total.saturating_sub(bytes) as f64;
    Some(Duration::from_secs_f64(remaining / speed))
}

/// Maps one line of transfer-utility output to a progress record.
///
/// Lines that are not JSON, or JSON log lines without a `stats` object, yield
/// `None`; they are diagnostics interleaved with the stats.
pub fn translate(line: &str, phase: &str) -> Option<TransferProgress> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    let parsed: LogLine = serde_json::from_str(line).ok()?;
    let stats = parsed.stats?;
    let total = (stats.total_bytes > 0).then_some(stats.total_bytes);
    let mut progress = TransferProgress::new(stats.bytes, total, stats.speed, phase);
    if stats.elapsed_time.is_finite() && stats.elapsed_time > 0.0 {
        progress.elapsed = Duration::from_secs_f64(stats.elapsed_time);
    }
    progress.errors = stats.errors;
    progress.fatal = stats.fatal_error;
    Some(progress)
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransferLine {
    Progress(TransferProgress),
    Error(String),
}

pub fn classify(line: &str, phase: &str) -> Option<TransferLine> {
    if let Some(progress) = translate(line, phase) {
        return Some(TransferLine::Progress(progress));
    }
    let parsed: LogLine = serde_json::from_str(line.trim()).ok()?;
    match parsed.level.as_str() {
        "error" | "critical" if !parsed.msg.is_empty() => Some(TransferLine::Error(parsed.msg)),
        _ => None,
    }
}

/// Streams progress records and errors out of a line-oriented reader,
/// skipping noise.
pub fn progress_lines<R>(reader: R, phase: String) -> impl Stream<Item = TransferLine>
where
    R: AsyncRead + Unpin + Send,
{
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    stream! {
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    if let Some(item) = classify(&line, &phase) {
                        yield item;
                    }
                }
                Err(e) => {
                    log::debug!("stopped reading transfer output: {e}");
                    break;
                }
            }
        }
    }
}

pub fn phase_percent(label: &str) -> Option<u8> {
    match label {
        phase::SAFETY_CHECK | phase::CHECKING | phase::LOCKING => Some(0),
        phase::SETTING_METADATA => Some(5),
        phase::UPLOADING => Some(10),
        phase::DOWNLOADING => Some(5),
        phase::FINALIZING => Some(90),
        phase::UNLOCKING => Some(95),
        phase::DONE => Some(100),
        _ => None,
    }
}

/// Places transfer progress inside the window reserved for the transfer itself:
/// 10–90 for uploads, 5–95 for downloads.
pub fn scaled_percent(progress: &TransferProgress) -> Option<u8> {
    let (start, span) = match progress.phase.as_str() {
        phase::DOWNLOADING => (5.0, 90.0),
        _ => (10.0, 80.0),
    };
    progress
        .fraction()
        .map(|f| (start + f * span).round() as u8)
}
