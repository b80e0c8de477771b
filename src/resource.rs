//! The boundary between the pool and whatever it pools.
//!
//! The pool never looks inside a resource; it only creates, resets and
//! closes it. [`crate::browser`] provides the Chrome tab implementation.

use crate::CaptureError;
use async_trait::async_trait;

/// A stateful, expensive handle that can be reused across tasks.
#[async_trait]
pub trait Resource: Sized + Send + 'static {
    /// Clear per-task state (cookies, storage, current page).
    ///
    /// Best effort: the pool logs and ignores failures.
    async fn reset(&mut self) -> Result<(), CaptureError>;

    /// Release the underlying handle. Failures are ignored by the pool.
    async fn close(self) -> Result<(), CaptureError>;
}

/// Creates fresh resources on demand, up to the pool's size.
#[async_trait]
pub trait ResourceFactory: Send + Sync + 'static {
    type Resource: Resource;

    async fn create(&self) -> Result<Self::Resource, CaptureError>;
}
