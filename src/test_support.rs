//! In-memory stand-ins for browser tabs, capture work and the terminal.

use crate::{
    CaptureError, CaptureTask, CaptureWork, ProgressSink, Resource, ResourceFactory, ResourcePool,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

#[derive(Debug, Default)]
struct Counters {
    created: AtomicUsize,
    closed: AtomicUsize,
    resets: AtomicUsize,
    failing_creates: AtomicUsize,
    fail_resets: AtomicBool,
    panic_resets: AtomicBool,
}

#[derive(Debug)]
pub struct FakeTab {
    pub serial: usize,
    counters: Arc<Counters>,
}

#[async_trait]
impl Resource for FakeTab {
    async fn reset(&mut self) -> Result<(), CaptureError> {
        self.counters.resets.fetch_add(1, Ordering::SeqCst);
        if self.counters.panic_resets.load(Ordering::SeqCst) {
            panic!("reset panicked on tab {}", self.serial);
        }
        if self.counters.fail_resets.load(Ordering::SeqCst) {
            return Err(CaptureError::message("reset exploded"));
        }
        Ok(())
    }

    async fn close(self) -> Result<(), CaptureError> {
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
        Err(CaptureError::TargetClosed)
    }
}

#[derive(Debug, Default, Clone)]
pub struct FakeFactory {
    counters: Arc<Counters>,
}

impl FakeFactory {
    pub fn created(&self) -> usize {
        self.counters.created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.counters.closed.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.counters.resets.load(Ordering::SeqCst)
    }

    pub fn fail_next_creates(&self, count: usize) {
        self.counters.failing_creates.store(count, Ordering::SeqCst);
    }

    pub fn fail_resets(&self, fail: bool) {
        self.counters.fail_resets.store(fail, Ordering::SeqCst);
    }

    pub fn panic_on_reset(&self, panic: bool) {
        self.counters.panic_resets.store(panic, Ordering::SeqCst);
    }
}

#[async_trait]
impl ResourceFactory for FakeFactory {
    type Resource = FakeTab;

    async fn create(&self) -> Result<FakeTab, CaptureError> {
        tokio::task::yield_now().await;
        let failing = &self.counters.failing_creates;
        if failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CaptureError::Protocol("browser went away".to_string()));
        }
        let serial = self.counters.created.fetch_add(1, Ordering::SeqCst);
        Ok(FakeTab {
            serial,
            counters: self.counters.clone(),
        })
    }
}

/// Polls until `count` live waiters are queued on the pool.
pub async fn wait_for_waiters(pool: &ResourcePool<FakeFactory>, count: usize) {
    for _ in 0..10_000 {
        if pool.stats().await.waiting == count {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("pool never reached {count} waiters");
}

/// Capture work whose outcome is scripted per page path.
///
/// Each page maps to a list of errors consumed one per attempt; once the list
/// is empty the attempt succeeds.
#[derive(Default)]
pub struct ScriptedWork {
    scripts: Mutex<HashMap<String, Vec<CaptureError>>>,
    pub delay: Duration,
    pub attempts: AtomicUsize,
    pub retries_seen: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    panic_pages: Mutex<Vec<String>>,
}

impl ScriptedWork {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn fail(self, page: &str, errors: Vec<CaptureError>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(page.to_string(), errors);
        self
    }

    pub fn panic_on(self, page: &str) -> Self {
        self.panic_pages.lock().unwrap().push(page.to_string());
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureWork<FakeTab> for ScriptedWork {
    async fn capture(
        &self,
        _tab: &mut FakeTab,
        task: &CaptureTask,
        is_retry: bool,
    ) -> Result<(), CaptureError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if is_retry {
            self.retries_seen.fetch_add(1, Ordering::SeqCst);
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.panic_pages.lock().unwrap().contains(&task.page) {
            panic!("hook blew up on {}", task.page);
        }

        let next_error = {
            let mut scripts = self.scripts.lock().unwrap();
            scripts.get_mut(&task.page).and_then(|errors| {
                if errors.is_empty() {
                    None
                } else {
                    Some(errors.remove(0))
                }
            })
        };

        match next_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Records every line written, tagging in-place rewrites.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemorySink {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl ProgressSink for MemorySink {
    fn rewrite_line(&mut self, line: &str) {
        self.lines.lock().unwrap().push(format!("~{line}"));
    }

    fn append_line(&mut self, line: &str) {
        self.lines.lock().unwrap().push(line.to_string());
    }

    fn finish(&mut self) {
        self.lines.lock().unwrap().push("<end>".to_string());
    }
}

/// Gauge handle that remembers every value it was set to.
#[derive(Debug, Default)]
pub struct RecordingGauge {
    values: Mutex<Vec<f64>>,
}

impl RecordingGauge {
    pub fn values(&self) -> Vec<f64> {
        self.values.lock().unwrap().clone()
    }
}

impl metrics::GaugeFn for RecordingGauge {
    fn increment(&self, value: f64) {
        let mut values = self.values.lock().unwrap();
        let last = values.last().copied().unwrap_or(0.0);
        values.push(last + value);
    }

    fn decrement(&self, value: f64) {
        self.increment(-value);
    }

    fn set(&self, value: f64) {
        self.values.lock().unwrap().push(value);
    }
}

/// Counts events at WARN or above.
#[derive(Debug, Clone, Default)]
pub struct WarningCounter {
    count: Arc<AtomicUsize>,
}

impl WarningCounter {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl<S: Subscriber> Layer<S> for WarningCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() <= Level::WARN {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }
}
