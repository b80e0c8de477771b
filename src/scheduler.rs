//! Bounded-concurrency execution of capture tasks
//!
//! A semaphore admits at most `concurrency` tasks at a time; every admitted
//! task checks a resource out of the pool, runs the [`CaptureWork`] on it and
//! gives it back. A failure that looks resource-specific (see
//! [`CaptureError::is_transient`]) discards the resource and retries the task
//! exactly once on a fresh one. Every task ends as exactly one success or one
//! [`TaskFailure`]; nothing aborts the run except draining the pool.

use crate::{
    CaptureError, CaptureTask, CaptureWork, Metrics, OutputMode, Pooled, ProgressReporter,
    ResourceFactory, ResourcePool, RunnerError,
};
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

/// One task that did not produce a capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskFailure {
    pub page: String,
    pub viewport: String,
    pub error: String,
}

impl TaskFailure {
    fn new(task: &CaptureTask, error: impl Into<String>) -> Self {
        Self {
            page: task.page.clone(),
            viewport: task.viewport.name.clone(),
            error: error.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub completed: usize,
    pub succeeded: usize,
    pub failures: Vec<TaskFailure>,
}

impl RunSummary {
    pub fn failures(&self) -> &[TaskFailure] {
        &self.failures
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct TaskScheduler<F: ResourceFactory, W> {
    pool: Arc<ResourcePool<F>>,
    work: Arc<W>,
    reporter: Arc<ProgressReporter>,
    metrics: Metrics,
    concurrency: usize,
}

impl<F: ResourceFactory, W> Clone for TaskScheduler<F, W> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            work: self.work.clone(),
            reporter: self.reporter.clone(),
            metrics: self.metrics.clone(),
            concurrency: self.concurrency,
        }
    }
}

impl<F, W> TaskScheduler<F, W>
where
    F: ResourceFactory,
    W: CaptureWork<F::Resource>,
{
    pub fn new(
        pool: Arc<ResourcePool<F>>,
        work: Arc<W>,
        reporter: Arc<ProgressReporter>,
        concurrency: usize,
    ) -> Result<Self, RunnerError> {
        if concurrency == 0 {
            return Err(RunnerError::InvalidConcurrency(concurrency));
        }

        Ok(Self {
            pool,
            work,
            reporter,
            metrics: Metrics::noop(),
            concurrency,
        })
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run every task and wait for all of them to settle.
    ///
    /// A new task is admitted as soon as any running one finishes; there are
    /// no batches. Failures are collected, never propagated.
    pub async fn run(&self, tasks: Vec<CaptureTask>) -> RunSummary {
        let total = tasks.len();
        info!(tasks = total, concurrency = self.concurrency, "Starting capture run");

        let limiter = Arc::new(Semaphore::new(self.concurrency));
        let mut running = JoinSet::new();
        let mut failures = Vec::new();

        for task in tasks {
            // reap finished tasks while waiting for a free permit
            let permit = loop {
                tokio::select! {
                    permit = limiter.clone().acquire_owned() => break permit,
                    Some(joined) = running.join_next() => collect(joined, &mut failures),
                }
            };
            let Ok(permit) = permit else {
                break;
            };

            let scheduler = self.clone();
            running.spawn(async move {
                let _permit = permit;
                let started = Instant::now();

                let outcome = match AssertUnwindSafe(scheduler.run_task(&task, started))
                    .catch_unwind()
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(panic) => {
                        let error = CaptureError::Panicked(panic_message(panic.as_ref()));
                        Some(scheduler.fail(&task, started, error.to_string()))
                    }
                };

                scheduler.metrics.record_pool(&scheduler.pool.stats().await);
                outcome
            });
        }

        while let Some(joined) = running.join_next().await {
            collect(joined, &mut failures);
        }

        let snapshot = self.reporter.finish();
        self.metrics.record_pool(&self.pool.stats().await);

        info!(
            completed = snapshot.completed,
            failed = failures.len(),
            elapsed = ?snapshot.elapsed,
            "Capture run finished"
        );

        RunSummary {
            completed: snapshot.completed,
            succeeded: snapshot.succeeded(),
            failures,
        }
    }

    /// Run one task to its single outcome. `None` means success.
    async fn run_task(&self, task: &CaptureTask, started: Instant) -> Option<TaskFailure> {
        let mut held = match self.pool.acquire().await {
            Ok(Some(resource)) => resource,
            Ok(None) => return Some(self.fail(task, started, CaptureError::PoolDrained.to_string())),
            Err(err) => return Some(self.fail(task, started, err.to_string())),
        };

        let mut is_retry = false;
        loop {
            let attempt = AssertUnwindSafe(self.work.capture(&mut *held, task, is_retry))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(CaptureError::Panicked(panic_message(panic.as_ref()))));

            let err = match attempt {
                Ok(()) => {
                    let elapsed = started.elapsed();
                    self.give_back(held).await;
                    self.metrics.record_task(elapsed, true);
                    self.reporter.record_success(task, elapsed);
                    return None;
                }
                Err(err) => err,
            };

            if !is_retry && err.is_transient() {
                if self.on_terminal() {
                    debug!(task = %task.label(), error = %err, "Transient failure, retrying on a fresh resource");
                } else {
                    warn!(task = %task.label(), error = %err, "Transient failure, retrying on a fresh resource");
                }
                self.metrics.record_retry();
                self.reporter.note(format!("↻ {}: {} (retrying)", task.label(), err));

                self.pool.discard(held).await;
                held = match self.pool.acquire().await {
                    Ok(Some(fresh)) => fresh,
                    // no replacement: the original error stands
                    Ok(None) | Err(_) => return Some(self.fail(task, started, err.to_string())),
                };
                is_retry = true;
                continue;
            }

            self.give_back(held).await;
            let message = if is_retry {
                format!("{err} (after retry)")
            } else {
                err.to_string()
            };
            return Some(self.fail(task, started, message));
        }
    }

    /// Release a resource, swallowing a panic from its reset or close. The
    /// pool reclaims the slot of a checkout lost that way.
    async fn give_back(&self, held: Pooled<F::Resource>) {
        if let Err(panic) = AssertUnwindSafe(self.pool.release(held)).catch_unwind().await {
            warn!(panic = %panic_message(panic.as_ref()), "Resource cleanup panicked, dropping it");
        }
    }

    fn fail(&self, task: &CaptureTask, started: Instant, error: String) -> TaskFailure {
        let failure = TaskFailure::new(task, error);
        if self.on_terminal() {
            debug!(task = %task.label(), error = %failure.error, "Task failed");
        } else {
            warn!(task = %task.label(), error = %failure.error, "Task failed");
        }
        self.metrics.record_task(started.elapsed(), false);
        self.reporter.record_failure(&failure);
        failure
    }

    /// Per-task events already reach the screen through the reporter; on a
    /// terminal they only go to the debug log so they never tear the
    /// progress line.
    fn on_terminal(&self) -> bool {
        self.reporter.mode() == OutputMode::Interactive
    }
}

fn collect(joined: Result<Option<TaskFailure>, JoinError>, failures: &mut Vec<TaskFailure>) {
    match joined {
        Ok(Some(failure)) => failures.push(failure),
        Ok(None) => {}
        Err(e) => error!("Capture task was cancelled: {}", e),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeFactory, MemorySink, RecordingGauge, ScriptedWork, WarningCounter};
    use crate::Viewport;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn task(page: &str) -> CaptureTask {
        CaptureTask {
            page: page.to_string(),
            viewport: Viewport::default(),
            hook: None,
            url: format!("http://localhost{page}"),
            options: Default::default(),
        }
    }

    fn tasks(pages: &[&str]) -> Vec<CaptureTask> {
        pages.iter().map(|p| task(p)).collect()
    }

    struct Harness {
        pool: Arc<ResourcePool<FakeFactory>>,
        work: Arc<ScriptedWork>,
        sink: MemorySink,
        scheduler: TaskScheduler<FakeFactory, ScriptedWork>,
    }

    fn harness(work: ScriptedWork, pool_size: usize, concurrency: usize, total: usize) -> Harness {
        let pool = Arc::new(ResourcePool::new(FakeFactory::default(), pool_size, None).unwrap());
        let work = Arc::new(work);
        let sink = MemorySink::default();
        let reporter = Arc::new(ProgressReporter::new(
            total,
            concurrency,
            OutputMode::Plain,
            Box::new(sink.clone()),
        ));
        let scheduler = TaskScheduler::new(pool.clone(), work.clone(), reporter, concurrency).unwrap();
        Harness {
            pool,
            work,
            sink,
            scheduler,
        }
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let pool = Arc::new(ResourcePool::new(FakeFactory::default(), 1, None).unwrap());
        let reporter = Arc::new(ProgressReporter::new(
            0,
            1,
            OutputMode::Plain,
            Box::new(MemorySink::default()),
        ));
        let result = TaskScheduler::new(pool, Arc::new(ScriptedWork::default()), reporter, 0);
        assert!(matches!(result, Err(RunnerError::InvalidConcurrency(0))));
    }

    #[tokio::test]
    async fn test_all_tasks_succeed() {
        let h = harness(ScriptedWork::default(), 2, 2, 4);
        let summary = h.scheduler.run(tasks(&["/a", "/b", "/c", "/d"])).await;

        assert!(summary.is_success());
        assert_eq!(summary.completed, 4);
        assert_eq!(summary.succeeded, 4);
        assert_eq!(h.work.attempts(), 4);
        assert!(h.pool.factory().created() <= 2);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_once_on_fresh_resource() {
        let work = ScriptedWork::default().fail("/flaky", vec![CaptureError::TargetClosed]);
        let h = harness(work, 1, 1, 1);

        let summary = h.scheduler.run(tasks(&["/flaky"])).await;

        assert!(summary.failures().is_empty());
        assert_eq!(summary.succeeded, 1);
        assert_eq!(h.work.attempts(), 2);
        assert_eq!(h.work.retries_seen.load(Ordering::SeqCst), 1);
        assert_eq!(h.pool.stats().await.checkouts, 2);
        // the first tab was discarded, a second one created
        assert_eq!(h.pool.factory().closed(), 1);
        assert_eq!(h.pool.factory().created(), 2);
        assert_eq!(h.pool.stats().await.total, 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let work = ScriptedWork::default().fail(
            "/broken",
            vec![CaptureError::message("selector not found")],
        );
        let h = harness(work, 1, 1, 1);

        let summary = h.scheduler.run(tasks(&["/broken"])).await;

        assert_eq!(h.work.attempts(), 1);
        assert_eq!(h.pool.stats().await.checkouts, 1);
        assert_eq!(
            summary.failures(),
            &[TaskFailure {
                page: "/broken".to_string(),
                viewport: "desktop".to_string(),
                error: "selector not found".to_string(),
            }]
        );
        assert_eq!(h.pool.factory().closed(), 0);
    }

    #[tokio::test]
    async fn test_second_transient_failure_is_final() {
        let work = ScriptedWork::default().fail(
            "/slow",
            vec![
                CaptureError::Timeout(Duration::from_secs(30)),
                CaptureError::Timeout(Duration::from_secs(30)),
            ],
        );
        let h = harness(work, 1, 1, 1);

        let summary = h.scheduler.run(tasks(&["/slow"])).await;

        assert_eq!(h.work.attempts(), 2);
        assert_eq!(summary.failures().len(), 1);
        assert_eq!(
            summary.failures()[0].error,
            "Navigation timeout after 30s (after retry)"
        );
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_limit() {
        let h = harness(ScriptedWork::with_delay(Duration::from_millis(20)), 2, 2, 5);
        let summary = h.scheduler.run(tasks(&["/1", "/2", "/3", "/4", "/5"])).await;

        assert_eq!(summary.completed, 5);
        assert!(summary.is_success());
        assert!(h.work.max_in_flight() <= 2);
        assert_eq!(h.pool.stats().await.total, 2);

        let lines = h.sink.lines();
        for page in ["/1", "/2", "/3", "/4", "/5"] {
            assert!(lines.iter().any(|l| l.contains(&format!("✓ {page} @ desktop"))));
        }
    }

    #[tokio::test]
    async fn test_pool_smaller_than_concurrency_queues_tasks() {
        let h = harness(ScriptedWork::with_delay(Duration::from_millis(10)), 1, 3, 3);
        let summary = h.scheduler.run(tasks(&["/1", "/2", "/3"])).await;

        assert_eq!(summary.succeeded, 3);
        assert_eq!(h.work.max_in_flight(), 1);
        assert_eq!(h.pool.factory().created(), 1);
    }

    #[tokio::test]
    async fn test_drain_fails_waiting_tasks() {
        let h = harness(ScriptedWork::with_delay(Duration::from_millis(50)), 1, 3, 3);

        let pool = h.pool.clone();
        let drainer = tokio::spawn(async move {
            crate::test_support::wait_for_waiters(&pool, 2).await;
            pool.drain().await;
        });

        let summary = h.scheduler.run(tasks(&["/1", "/2", "/3"])).await;
        drainer.await.unwrap();

        assert_eq!(summary.completed, 3);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failures().len(), 2);
        assert!(summary.failures().iter().all(|f| f.error == "pool drained"));
        // the in-flight tab was closed when it came back
        assert_eq!(h.pool.factory().closed(), 1);
    }

    #[tokio::test]
    async fn test_panicking_work_becomes_a_failure() {
        let work = ScriptedWork::default().panic_on("/bad");
        let h = harness(work, 1, 1, 2);

        let summary = h.scheduler.run(tasks(&["/bad", "/good"])).await;

        assert_eq!(summary.completed, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failures().len(), 1);
        assert_eq!(summary.failures()[0].page, "/bad");
        assert!(summary.failures()[0].error.contains("hook blew up on /bad"));
        // the tab survived the panic and served the next task
        assert_eq!(h.pool.factory().created(), 1);
    }

    #[tokio::test]
    async fn test_failed_replacement_keeps_original_error() {
        let work = ScriptedWork::default().fail("/flaky", vec![CaptureError::TargetClosed]);
        let h = harness(work, 1, 1, 1);

        // first create succeeds, the replacement after discard does not
        let pool = h.pool.clone();
        let first = pool.acquire().await.unwrap().unwrap();
        pool.release(first).await;
        pool.factory().fail_next_creates(1);

        let summary = h.scheduler.run(tasks(&["/flaky"])).await;

        assert_eq!(h.work.attempts(), 1);
        assert_eq!(summary.failures().len(), 1);
        assert_eq!(summary.failures()[0].error, "Target closed");
    }

    #[tokio::test]
    async fn test_empty_task_list() {
        let h = harness(ScriptedWork::default(), 1, 1, 0);
        let summary = h.scheduler.run(Vec::new()).await;

        assert_eq!(summary.completed, 0);
        assert!(summary.is_success());
        assert_eq!(h.pool.factory().created(), 0);
        assert_eq!(h.sink.lines(), vec!["<end>"]);
    }

    #[tokio::test]
    async fn test_panicking_cleanup_is_not_a_task_failure() {
        let h = harness(ScriptedWork::with_delay(Duration::from_millis(5)), 1, 2, 3);
        h.pool.factory().panic_on_reset(true);

        let summary = tokio::time::timeout(Duration::from_secs(5), h.scheduler.run(tasks(&["/1", "/2", "/3"])))
            .await
            .expect("run must not hang when a reset panics");

        assert_eq!(summary.completed, 3);
        assert_eq!(summary.succeeded, 3);
        assert!(summary.is_success());
        // each lost tab freed its slot for a fresh one
        assert_eq!(h.pool.factory().created(), 3);
        assert!(h.sink.lines().iter().any(|l| l.starts_with("[3/3]")));
    }

    #[tokio::test]
    async fn test_pool_gauges_follow_the_run() {
        let waiting = Arc::new(RecordingGauge::default());
        let total = Arc::new(RecordingGauge::default());
        let metrics = Metrics {
            pool_waiting: ::metrics::Gauge::from_arc(waiting.clone()),
            pool_total: ::metrics::Gauge::from_arc(total.clone()),
            ..Metrics::noop()
        };

        let h = harness(ScriptedWork::with_delay(Duration::from_millis(10)), 1, 3, 3);
        let scheduler = h.scheduler.clone().with_metrics(metrics);
        let summary = scheduler.run(tasks(&["/1", "/2", "/3"])).await;

        assert!(summary.is_success());
        // recorded per completion, so the queue shows up mid-run
        assert!(waiting.values().len() >= 3);
        assert!(waiting.values().iter().any(|&v| v >= 1.0));
        assert_eq!(total.values().last(), Some(&1.0));
    }

    #[tokio::test]
    async fn test_terminal_mode_keeps_task_errors_out_of_the_log() {
        use tracing_subscriber::layer::SubscriberExt;

        async fn warnings_during_run(mode: OutputMode) -> usize {
            let counter = WarningCounter::default();
            let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(counter.clone()));

            let work = ScriptedWork::default()
                .fail("/flaky", vec![CaptureError::TargetClosed])
                .fail("/broken", vec![CaptureError::message("selector not found")]);
            let pool = Arc::new(ResourcePool::new(FakeFactory::default(), 1, None).unwrap());
            let reporter = Arc::new(ProgressReporter::new(2, 1, mode, Box::new(MemorySink::default())));
            let scheduler = TaskScheduler::new(pool, Arc::new(work), reporter, 1).unwrap();

            let summary = scheduler.run(tasks(&["/flaky", "/broken"])).await;
            assert_eq!(summary.failures().len(), 1);
            counter.count()
        }

        assert_eq!(warnings_during_run(OutputMode::Interactive).await, 0);
        assert_eq!(warnings_during_run(OutputMode::Plain).await, 2);
    }
}
