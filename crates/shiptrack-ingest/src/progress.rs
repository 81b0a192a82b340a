//! Stage progress reporting
//!
//! Workers hand every post-settle [`ProgressSnapshot`] to a
//! [`ProgressReporter`], which forwards it to a [`ProgressSink`] only when the
//! percentage has advanced by at least the configured step (and always once at
//! 100). Sink failures are logged and dropped. A slow sink never holds up
//! the workers that feed the reporter.

use indicatif::{ProgressBar, ProgressStyle};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use tracing::{info, warn};

use crate::queue::ProgressSnapshot;

/// Destination for progress reports
pub trait ProgressSink: Send + Sync {
    fn report(&self, stage: &str, snapshot: &ProgressSnapshot) -> anyhow::Result<()>;
}

/// Emits progress as structured log events
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn report(&self, stage: &str, snapshot: &ProgressSnapshot) -> anyhow::Result<()> {
        info!(
            stage,
            percent = snapshot.percent(),
            total = snapshot.total,
            remaining = snapshot.remaining,
            failed = snapshot.failed,
            "{}",
            snapshot.status_line()
        );
        Ok(())
    }
}

/// Terminal progress bar, one per stage
#[derive(Default)]
pub struct ConsoleSink {
    current: Mutex<Option<(String, ProgressBar)>>,
}

impl ConsoleSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn create_bar(stage: &str, total: u64) -> ProgressBar {
        let pb = ProgressBar::new(total);
        let style = ProgressStyle::default_bar()
            .template("{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        pb.set_style(style);
        pb.set_message(format!("{} stage", stage));
        pb
    }
}

impl ProgressSink for ConsoleSink {
    fn report(&self, stage: &str, snapshot: &ProgressSnapshot) -> anyhow::Result<()> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);

        let same_stage = matches!(current.as_ref(), Some((name, _)) if name == stage);
        if !same_stage {
            if let Some((_, previous)) = current.take() {
                previous.finish();
            }
            *current = Some((
                stage.to_string(),
                Self::create_bar(stage, snapshot.total as u64),
            ));
        }

        if let Some((_, pb)) = current.as_ref() {
            pb.set_length(snapshot.total as u64);
            pb.set_position(snapshot.total.saturating_sub(snapshot.remaining) as u64);
            pb.set_message(format!("{}: {}", stage, snapshot.status_line()));
            if snapshot.is_complete() {
                pb.finish();
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct ReportState {
    last_reported: Option<u8>,
    pending: Option<ProgressSnapshot>,
}

/// Rate-limits and orders progress reports for one stage
///
/// The decision to report is taken under a short lock; delivery to the sink
/// happens outside it. Only one caller delivers at a time, and a caller that
/// finds delivery busy leaves its snapshot behind for the active deliverer
/// instead of waiting.
pub struct ProgressReporter {
    stage: String,
    step: u8,
    state: Mutex<ReportState>,
    delivering: Mutex<()>,
    sink: Arc<dyn ProgressSink>,
}

impl ProgressReporter {
    pub fn new(stage: impl Into<String>, step: u8, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            stage: stage.into(),
            step: step.max(1),
            state: Mutex::new(ReportState::default()),
            delivering: Mutex::new(()),
            sink,
        }
    }

    fn state(&self) -> MutexGuard<'_, ReportState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Consider a snapshot for reporting; returns the percent if it was accepted.
    ///
    /// Reported values never decrease even when snapshots from concurrent
    /// workers arrive out of order. An accepted value may be superseded by a
    /// later one before the sink sees it, but the final 100 always arrives.
    pub fn observe(&self, snapshot: &ProgressSnapshot) -> Option<u8> {
        let percent = snapshot.percent();
        {
            let mut state = self.state();
            let due = match state.last_reported {
                None => true,
                Some(prev) if percent <= prev => false,
                Some(_) if percent == 100 => true,
                Some(prev) => percent - prev >= self.step,
            };
            if !due {
                return None;
            }
            state.last_reported = Some(percent);
            state.pending = Some(*snapshot);
        }

        self.deliver();
        Some(percent)
    }

    fn deliver(&self) {
        loop {
            let guard = match self.delivering.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => return,
            };

            loop {
                // State lock is released before the sink runs
                let next = self.state().pending.take();
                let Some(snapshot) = next else {
                    break;
                };
                if let Err(e) = self.sink.report(&self.stage, &snapshot) {
                    warn!(stage = %self.stage, percent = snapshot.percent(), error = %e, "Progress sink failed");
                }
            }
            drop(guard);

            // A snapshot left while we were releasing would otherwise be stranded
            if self.state().pending.is_none() {
                return;
            }
        }
    }

    pub fn last_reported(&self) -> Option<u8> {
        self.state().last_reported
    }
}
