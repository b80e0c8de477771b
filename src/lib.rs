//! # Screenshot Runner
//!
//! Visual-regression screenshot capture across many pages and viewports,
//! scheduled onto a small, strictly bounded pool of reusable headless Chrome
//! tabs.
//!
//! ## How a run works
//!
//! - **Task set**: every page path is crossed with the viewports configured
//!   for it, producing one [`CaptureTask`] per (page, viewport).
//! - **Resource pool**: [`ResourcePool`] creates tabs lazily up to its size,
//!   serves waiters in FIFO order, resets a tab between tasks, optionally
//!   replaces it after a number of uses, and can be drained to unblock
//!   everyone still waiting.
//! - **Scheduler**: [`TaskScheduler`] keeps at most `concurrency` tasks in
//!   flight and admits the next one as soon as any finishes. A timeout, a
//!   closed target or a protocol error discards the tab and retries the task
//!   once on a fresh one; anything else is recorded as a failure.
//! - **Progress**: [`ProgressReporter`] rewrites one status line with an ETA
//!   on a terminal, or logs one line per completion when output is piped or
//!   running under CI. Errors are never overwritten by the status line.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use screenshot_runner::{
//!     build_tasks, Config, PageCapture, ProgressReporter, ResourcePool, TabFactory, TaskScheduler,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config {
//!         base_url: "http://localhost:4000".to_string(),
//!         concurrency: 4,
//!         ..Default::default()
//!     };
//!     let tasks = build_tasks(&["/".to_string(), "/about".to_string()], &config)?;
//!
//!     let factory = TabFactory::launch(&config).await?;
//!     let pool = Arc::new(ResourcePool::new(factory, config.pool_size(), config.recycle_after)?);
//!     let reporter = Arc::new(ProgressReporter::for_terminal(tasks.len(), config.concurrency));
//!     let scheduler = TaskScheduler::new(
//!         pool.clone(),
//!         Arc::new(PageCapture::new(&config)),
//!         reporter,
//!         config.concurrency,
//!     )?;
//!
//!     let summary = scheduler.run(tasks).await;
//!     pool.shutdown().await;
//!     pool.factory().shutdown().await;
//!
//!     println!("{} failed", summary.failures().len());
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! screenshot-runner --config shots.json run --pages pages.txt --concurrency 4 --recycle-after 50
//! screenshot-runner tasks --pages pages.txt --base-url http://localhost:4000
//! ```

/// Configuration and settings for a capture run
pub mod config;

/// Error types for tasks and runs
pub mod error;

/// The resource abstraction the pool manages
pub mod resource;

/// Bounded, FIFO-fair pool of reusable resources
pub mod resource_pool;

/// Chrome tabs as pooled resources
pub mod browser;

/// Expansion of pages into capture tasks
pub mod tasks;

/// Per-task capture work
pub mod capture;

/// Bounded-concurrency task execution with retry
pub mod scheduler;

/// Progress line, ETA and completion log
pub mod progress;

/// Metrics collection and export
pub mod metrics;

/// JSON report of a finished run
pub mod report;

/// Command-line interface
pub mod cli;

/// Utility functions
pub mod utils;

#[cfg(test)]
mod test_support;


pub use browser::*;
pub use capture::*;
pub use cli::*;
pub use config::*;
pub use error::*;
pub use self::metrics::*;
pub use progress::*;
pub use report::*;
pub use resource::*;
pub use resource_pool::*;
pub use scheduler::*;
pub use tasks::*;
pub use utils::*;
