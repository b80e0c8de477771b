//! Progress accounting and terminal output for a capture run
//!
//! Completions arrive from many tasks at once; [`ProgressReporter`] funnels
//! them through one mutex so counters, the ETA window and the output stream
//! are only ever touched by one completion at a time.
//!
//! On an interactive terminal a single progress line is redrawn in place.
//! Error lines are queued and written on their own line just before the next
//! redraw (and at the end of the run), so a redraw never erases them. When
//! output is not interactive every completion becomes its own line.

use crate::{format_duration, CaptureTask, TaskFailure};
use std::collections::VecDeque;
use std::io::{IsTerminal, Write};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

/// Number of recent task durations the ETA is averaged over.
pub const ETA_WINDOW: usize = 20;

/// Upper bound on the samples needed before an ETA is shown.
const ETA_MIN_SAMPLES: usize = 5;

/// Moving-average completion estimate.
///
/// Only used for display; scheduling never looks at it.
#[derive(Debug, Clone, Default)]
pub struct EtaEstimator {
    window: VecDeque<Duration>,
    samples: usize,
}

impl EtaEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, duration: Duration) {
        if self.window.len() == ETA_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(duration);
        self.samples += 1;
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    /// Samples needed before an estimate is trusted: 10% of the run, capped at 5.
    pub fn required_samples(total: usize) -> usize {
        ETA_MIN_SAMPLES.min((total + 9) / 10)
    }

    pub fn average(&self) -> Option<Duration> {
        if self.window.is_empty() {
            return None;
        }
        let sum: Duration = self.window.iter().sum();
        Some(sum / self.window.len() as u32)
    }

    /// Remaining wall-clock time, assuming `concurrency` tasks overlap.
    pub fn estimate(&self, remaining: usize, total: usize, concurrency: usize) -> Option<Duration> {
        if self.samples == 0 || self.samples < Self::required_samples(total) {
            return None;
        }
        let average = self.average()?;
        let seconds = average.as_secs_f64() * remaining as f64 / concurrency.max(1) as f64;
        Some(Duration::from_secs_f64(seconds))
    }
}

/// Where progress output goes.
pub trait ProgressSink: Send {
    /// Replace the current progress line.
    fn rewrite_line(&mut self, line: &str);

    /// Write a line of its own, below any progress line.
    fn append_line(&mut self, line: &str);

    /// Called once when the run ends.
    fn finish(&mut self);
}

/// Writes to stdout, using carriage return + clear-line for rewrites.
#[derive(Debug, Default)]
pub struct TerminalSink {
    line_open: bool,
}

impl TerminalSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressSink for TerminalSink {
    fn rewrite_line(&mut self, line: &str) {
        let mut out = std::io::stdout().lock();
        let _ = write!(out, "\r\x1b[2K{line}");
        let _ = out.flush();
        self.line_open = true;
    }

    fn append_line(&mut self, line: &str) {
        let mut out = std::io::stdout().lock();
        if self.line_open {
            let _ = write!(out, "\r\x1b[2K");
            self.line_open = false;
        }
        let _ = writeln!(out, "{line}");
    }

    fn finish(&mut self) {
        if self.line_open {
            println!();
            self.line_open = false;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// A person is watching a terminal; redraw one progress line.
    Interactive,
    /// Logs or CI; one line per completion.
    Plain,
}

impl OutputMode {
    /// Interactive when stdout is a terminal and no CI marker is set.
    pub fn detect() -> Self {
        let ci = std::env::var("CI")
            .map(|value| !value.is_empty() && value != "0" && value != "false")
            .unwrap_or(false);
        Self::from_environment(std::io::stdout().is_terminal(), ci)
    }

    pub fn from_environment(is_terminal: bool, ci: bool) -> Self {
        if is_terminal && !ci {
            OutputMode::Interactive
        } else {
            OutputMode::Plain
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub elapsed: Duration,
    pub eta: Option<Duration>,
}

impl ProgressSnapshot {
    pub fn succeeded(&self) -> usize {
        self.completed - self.failed
    }
}

struct ReporterState {
    completed: usize,
    failed: usize,
    eta: EtaEstimator,
    pending_errors: Vec<String>,
    sink: Box<dyn ProgressSink>,
}

pub struct ProgressReporter {
    total: usize,
    concurrency: usize,
    mode: OutputMode,
    started: Instant,
    state: Mutex<ReporterState>,
}

impl ProgressReporter {
    pub fn new(total: usize, concurrency: usize, mode: OutputMode, sink: Box<dyn ProgressSink>) -> Self {
        Self {
            total,
            concurrency,
            mode,
            started: Instant::now(),
            state: Mutex::new(ReporterState {
                completed: 0,
                failed: 0,
                eta: EtaEstimator::new(),
                pending_errors: Vec::new(),
                sink,
            }),
        }
    }

    /// A reporter writing to the real terminal in the detected mode.
    pub fn for_terminal(total: usize, concurrency: usize) -> Self {
        Self::new(total, concurrency, OutputMode::detect(), Box::new(TerminalSink::new()))
    }

    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    pub fn record_success(&self, task: &CaptureTask, duration: Duration) {
        let mut state = self.lock();
        state.completed += 1;
        state.eta.record(duration);
        debug!(task = %task.label(), ?duration, "Task completed");

        match self.mode {
            OutputMode::Interactive => self.redraw(&mut state),
            OutputMode::Plain => {
                let line = format!(
                    "{} ✓ {} ({})",
                    self.counter(&state),
                    task.label(),
                    format_duration(duration)
                );
                state.sink.append_line(&line);
            }
        }
    }

    pub fn record_failure(&self, failure: &TaskFailure) {
        let mut state = self.lock();
        state.completed += 1;
        state.failed += 1;
        let message = format!("✗ {} @ {}: {}", failure.page, failure.viewport, failure.error);

        match self.mode {
            OutputMode::Interactive => {
                state.pending_errors.push(message);
                self.redraw(&mut state);
            }
            OutputMode::Plain => {
                let line = format!("{} {}", self.counter(&state), message);
                state.sink.append_line(&line);
            }
        }
    }

    /// An out-of-band message such as a retry notice. Does not count as a
    /// completion; on an interactive terminal it waits for the next redraw.
    pub fn note(&self, message: impl Into<String>) {
        let message = message.into();
        let mut state = self.lock();
        match self.mode {
            OutputMode::Interactive => state.pending_errors.push(message),
            OutputMode::Plain => state.sink.append_line(&message),
        }
    }

    /// Flush anything still queued and close the output.
    pub fn finish(&self) -> ProgressSnapshot {
        let mut state = self.lock();
        flush_errors(&mut state);
        state.sink.finish();
        self.snapshot_of(&state)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let state = self.lock();
        self.snapshot_of(&state)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ReporterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn redraw(&self, state: &mut ReporterState) {
        flush_errors(state);
        let line = self.progress_line(state);
        state.sink.rewrite_line(&line);
    }

    fn counter(&self, state: &ReporterState) -> String {
        format!("[{}/{}]", state.completed, self.total)
    }

    fn progress_line(&self, state: &ReporterState) -> String {
        let percent = if self.total == 0 {
            100
        } else {
            state.completed * 100 / self.total
        };
        let mut line = format!("{} {}%", self.counter(state), percent);
        if state.failed > 0 {
            line.push_str(&format!(" | {} failed", state.failed));
        }
        if let Some(eta) = self.eta_of(state) {
            line.push_str(&format!(" | ETA {}", format_duration(eta)));
        }
        line
    }

    fn eta_of(&self, state: &ReporterState) -> Option<Duration> {
        let remaining = self.total.saturating_sub(state.completed);
        state.eta.estimate(remaining, self.total, self.concurrency)
    }

    fn snapshot_of(&self, state: &ReporterState) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.total,
            completed: state.completed,
            failed: state.failed,
            elapsed: self.started.elapsed(),
            eta: self.eta_of(state),
        }
    }
}

fn flush_errors(state: &mut ReporterState) {
    for message in std::mem::take(&mut state.pending_errors) {
        state.sink.append_line(&message);
    }
}
