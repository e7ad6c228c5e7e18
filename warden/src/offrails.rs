//! Off-rails detection for supervised agent sessions.
//!
//! The detector judges liveness from two signals only:
//!
//! - **Silence**: every successful write through an [`ActivityWriter`] stamps
//!   a shared activity clock. A background monitor wakes every check interval,
//!   warns once the session has been silent for `silence_warn`, and cancels it
//!   once silent for `silence_abort` (zero disables the abort).
//! - **Error loops**: [`ToolErrorRecorder::record`] groups tool errors by a
//!   normalized key and cancels once one key reaches `error_repeat`.
//!
//! Wrappers and recorders hold only a handle onto the detector's shared state,
//! never the detector itself, so ownership stays one-directional.

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::cancel::{CancelCause, CancelToken, TriggerKind};

pub const DEFAULT_SILENCE_ABORT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_SILENCE_WARN: Duration = Duration::from_secs(45);
pub const DEFAULT_ERROR_REPEAT: u32 = 3;
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Errors are grouped by their first 200 characters.
const ERROR_KEY_MAX_CHARS: usize = 200;
const ERROR_PREVIEW_CHARS: usize = 120;

/// Thresholds for the detector. Zero values for `silence_warn`,
/// `error_repeat` and `check_interval` fall back to the defaults; a zero
/// `silence_abort` disables the silence abort entirely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffRailsConfig {
    pub silence_abort: Duration,
    pub silence_warn: Duration,
    pub error_repeat: u32,
    pub check_interval: Duration,
}

impl Default for OffRailsConfig {
    fn default() -> Self {
        Self {
            silence_abort: DEFAULT_SILENCE_ABORT,
            silence_warn: DEFAULT_SILENCE_WARN,
            error_repeat: DEFAULT_ERROR_REPEAT,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }
}

impl OffRailsConfig {
    pub fn with_defaults(mut self) -> Self {
        if self.silence_warn.is_zero() {
            self.silence_warn = DEFAULT_SILENCE_WARN;
        }
        if self.error_repeat == 0 {
            self.error_repeat = DEFAULT_ERROR_REPEAT;
        }
        if self.check_interval.is_zero() {
            self.check_interval = DEFAULT_CHECK_INTERVAL;
        }
        self
    }

    fn abort_enabled(&self) -> bool {
        !self.silence_abort.is_zero()
    }
}

/// Destination for operator-facing `[off-rails]` alert lines.
pub type AlertSink = Box<dyn Write + Send>;

/// Liveness and error-loop monitor for one session.
pub struct OffRailsDetector {
    shared: Arc<Shared>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    config: OffRailsConfig,
    clock: ActivityClock,
    // Grouping key -> occurrences. Increment and threshold check happen under this lock.
    error_counts: Mutex<HashMap<String, u32>>,
    cancel: CancelToken,
    alert: Mutex<AlertSink>,
    stop: StopSignal,
}

impl OffRailsDetector {
    /// Create a detector whose activity clock starts at "now".
    pub fn new(config: OffRailsConfig, cancel: CancelToken, alert: AlertSink) -> Self {
        let config = config.with_defaults();
        debug!(
            silence_abort_secs = config.silence_abort.as_secs(),
            silence_warn_secs = config.silence_warn.as_secs(),
            error_repeat = config.error_repeat,
            check_interval_ms = config.check_interval.as_millis() as u64,
            "off-rails detector configured"
        );
        Self {
            shared: Arc::new(Shared {
                config,
                clock: ActivityClock::new(),
                error_counts: Mutex::new(HashMap::new()),
                cancel,
                alert: Mutex::new(alert),
                stop: StopSignal::default(),
            }),
            monitor: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &OffRailsConfig {
        &self.shared.config
    }

    /// Launch the background silence monitor. Calling it twice is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut monitor = self.monitor.lock().unwrap_or_else(PoisonError::into_inner);
        if monitor.is_some() {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("offrails-monitor".to_string())
            .spawn(move || monitor_loop(&shared))
            .context("spawn off-rails monitor")?;
        *monitor = Some(handle);
        Ok(())
    }

    /// Halt the monitor and wait for it to exit. Safe to call repeatedly, or
    /// without a prior [`start`](Self::start). Tool errors recorded after this
    /// point are ignored.
    pub fn stop(&self) {
        self.shared.stop.stop();
        let handle = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            warn!("off-rails monitor panicked");
        }
    }

    /// Decorate `sink` so every successful non-empty write counts as activity.
    pub fn wrap<W: Write>(&self, sink: W) -> ActivityWriter<W> {
        ActivityWriter {
            inner: sink,
            clock: self.shared.clock.clone(),
        }
    }

    /// A cloneable handle the output classifier uses to report tool errors.
    pub fn tool_error_recorder(&self) -> ToolErrorRecorder {
        ToolErrorRecorder {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn record_tool_error(&self, text: &str) {
        self.shared.record_tool_error(text);
    }

    /// The most recent activity stamp.
    pub fn last_activity(&self) -> Instant {
        self.shared.clock.last_activity()
    }
}

impl Drop for OffRailsDetector {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn record_tool_error(&self, text: &str) {
        if self.stop.is_stopped() {
            debug!("ignoring tool error reported after detector stop");
            return;
        }
        let Some(key) = normalize_error(text) else {
            return;
        };

        let count = {
            let mut counts = self
                .error_counts
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let count = counts.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };
        debug!(count, "tool error recorded");

        if count >= self.config.error_repeat {
            let msg = format!("same error repeated {count} times");
            warn!(count, "tool error loop detected");
            self.alert(&format!(
                "[off-rails] {msg}: {}",
                preview(&key, ERROR_PREVIEW_CHARS)
            ));
            self.cancel.cancel(CancelCause::new(
                TriggerKind::ErrorLoop,
                format!("error loop: {msg}"),
            ));
        }
    }

    fn alert(&self, line: &str) {
        let mut sink = self.alert.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = writeln!(sink, "{line}").and_then(|()| sink.flush()) {
            debug!(err = %err, "failed to write off-rails alert");
        }
    }
}

fn monitor_loop(shared: &Shared) {
    let cfg = &shared.config;
    let mut warned = false;
    loop {
        if shared.stop.wait(cfg.check_interval) {
            debug!("off-rails monitor stopped");
            return;
        }
        let silence = shared.clock.silence();

        if !warned && silence >= cfg.silence_warn {
            if cfg.abort_enabled() {
                let remaining = cfg.silence_abort.saturating_sub(silence);
                shared.alert(&format!(
                    "[off-rails] no output for {} (abort in {})",
                    round_secs(silence),
                    round_secs(remaining)
                ));
            } else {
                shared.alert(&format!(
                    "[off-rails] no output for {}; still running...",
                    round_secs(silence)
                ));
            }
            warn!(silence_secs = silence.as_secs(), "session silent");
            warned = true;
        }

        if cfg.abort_enabled() && silence >= cfg.silence_abort {
            shared.alert(&format!(
                "[off-rails] aborting: no output for {} (threshold {})",
                round_secs(silence),
                round_secs(cfg.silence_abort)
            ));
            info!(silence_secs = silence.as_secs(), "cancelling silent session");
            shared.cancel.cancel(CancelCause::new(
                TriggerKind::Silence,
                format!("no output for {}", round_secs(silence)),
            ));
            return;
        }

        if silence < cfg.silence_warn {
            warned = false;
        }
    }
}

/// Monotonic activity stamp shared by every wrapper of one detector.
///
/// Stored as milliseconds since the detector was created. Writers only ever
/// raise it (`fetch_max`), so concurrent writers cannot move it backwards.
#[derive(Debug, Clone)]
struct ActivityClock {
    origin: Instant,
    last_ms: Arc<AtomicU64>,
}

impl ActivityClock {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    fn touch(&self) {
        let now_ms = u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_ms.fetch_max(now_ms, Ordering::Relaxed);
    }

    fn last_activity(&self) -> Instant {
        self.origin + Duration::from_millis(self.last_ms.load(Ordering::Relaxed))
    }

    fn silence(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_activity())
    }
}

#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    changed: Condvar,
}

impl StopSignal {
    fn stop(&self) {
        let mut stopped = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        *stopped = true;
        self.changed.notify_all();
    }

    fn is_stopped(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block for `timeout` or until stopped; returns whether stop was requested.
    fn wait(&self, timeout: Duration) -> bool {
        let stopped = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        let (stopped, _) = self
            .changed
            .wait_timeout_while(stopped, timeout, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *stopped
    }
}

/// A byte sink decorator that marks detector activity on successful writes.
#[derive(Debug)]
pub struct ActivityWriter<W> {
    inner: W,
    clock: ActivityClock,
}

impl<W> ActivityWriter<W> {
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for ActivityWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        if n > 0 {
            self.clock.touch();
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Handle for feeding tool errors into a detector's error-loop counter.
#[derive(Clone)]
pub struct ToolErrorRecorder {
    shared: Arc<Shared>,
}

impl ToolErrorRecorder {
    pub fn record(&self, text: &str) {
        self.shared.record_tool_error(text);
    }
}

/// Grouping key for a tool error: trimmed, capped at 200 characters.
/// Blank errors produce no key. Paths and timestamps are not stripped.
pub fn normalize_error(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(ERROR_KEY_MAX_CHARS).collect())
}

fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

/// Human-readable duration rounded to whole seconds (`4m 15s`).
pub fn round_secs(duration: Duration) -> String {
    let secs = duration.as_secs() + u64::from(duration.subsec_millis() >= 500);
    humantime::format_duration(Duration::from_secs(secs)).to_string()
}
