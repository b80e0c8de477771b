//! Bounded pool of reusable browser tabs
//!
//! The pool creates resources lazily up to its size, hands freed resources
//! straight to the longest-waiting caller, optionally replaces a resource
//! after a fixed number of uses, and can be drained to unblock everyone
//! still waiting. All bookkeeping (`available`, `waiting`, `total`) lives in
//! one [`PoolState`] behind a single mutex that is never held across an
//! await; factory, reset and close calls always run with it released.
//!
//! Each unit of capacity is a [`Slot`] that travels with the resource it was
//! created for, through reuse and recycling. Dropping a slot frees it, so a
//! checkout that is lost (an aborted task, a panicking reset) still gives its
//! capacity back to the pool.

use crate::{CaptureError, Resource, ResourceFactory, RunnerError};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

type Shared<R> = Arc<Mutex<PoolState<R>>>;

/// One unit of pool capacity.
///
/// Dropping it hands the capacity to the oldest waiter, or shrinks `total`
/// when nobody is waiting. Slots from before a drain free nothing.
struct Slot<R> {
    generation: u64,
    pool: Option<Weak<Mutex<PoolState<R>>>>,
}

impl<R> Slot<R> {
    fn new(generation: u64, pool: &Shared<R>) -> Self {
        Self {
            generation,
            pool: Some(Arc::downgrade(pool)),
        }
    }

    /// Drop without freeing; `total` has already been adjusted.
    fn retire(mut self) {
        self.pool = None;
    }
}

impl<R> Drop for Slot<R> {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take().and_then(|pool| pool.upgrade()) {
            free_slot(&pool, self.generation);
        }
    }
}

/// A resource checked out of the pool.
///
/// Give it back with [`ResourcePool::release`], or with
/// [`ResourcePool::discard`] when it is presumed broken. A checkout that is
/// simply dropped frees its capacity; the resource itself is dropped without
/// being closed.
pub struct Pooled<R> {
    id: u64,
    use_count: usize,
    slot: Slot<R>,
    resource: R,
}

impl<R> Pooled<R> {
    /// Identifier assigned at creation; a recycled replacement gets a new one.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of times this resource has been handed to a caller.
    pub fn use_count(&self) -> usize {
        self.use_count
    }

    fn generation(&self) -> u64 {
        self.slot.generation
    }
}

impl<R> Deref for Pooled<R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.resource
    }
}

impl<R> DerefMut for Pooled<R> {
    fn deref_mut(&mut self) -> &mut R {
        &mut self.resource
    }
}

impl<R> fmt::Debug for Pooled<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("id", &self.id)
            .field("use_count", &self.use_count)
            .field("generation", &self.generation())
            .finish()
    }
}

/// What a queued `acquire` is woken with. A waiter whose sender is dropped
/// without a grant has been drained.
enum Grant<R> {
    /// A freed resource, handed over without passing through `available`.
    Resource(Pooled<R>),
    /// Capacity freed by a failed creation or a lost resource; the waiter
    /// creates the resource itself.
    Slot(Slot<R>),
}

struct PoolState<R> {
    available: VecDeque<Pooled<R>>,
    waiters: VecDeque<oneshot::Sender<Grant<R>>>,
    /// Resources created and not yet destroyed, including ones being created.
    total: usize,
    recycled: usize,
    checkouts: usize,
    /// Bumped by every drain; resources from an older generation are closed
    /// on release instead of re-entering the pool.
    generation: u64,
    next_id: u64,
    /// Set by `shutdown`; every later acquire resolves to `None`.
    closed: bool,
}

impl<R> PoolState<R> {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Offer `grant` to the waiters in FIFO order, skipping any that gave up.
    /// Hands it back if nobody took it.
    fn offer(&mut self, mut grant: Grant<R>) -> Option<Grant<R>> {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.send(grant) {
                Ok(()) => return None,
                Err(returned) => grant = returned,
            }
        }
        Some(grant)
    }
}

fn lock_state<R>(state: &Mutex<PoolState<R>>) -> MutexGuard<'_, PoolState<R>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Give a freed capacity slot to the oldest waiter, or shrink `total`.
fn free_slot<R>(shared: &Shared<R>, generation: u64) {
    // anything left over is dropped after the lock is released
    let unclaimed = {
        let mut state = lock_state(shared);
        if generation != state.generation {
            return;
        }

        match state.offer(Grant::Slot(Slot::new(generation, shared))) {
            None => {
                debug!(waiting = state.waiters.len(), "Handed freed slot to waiter");
                None
            }
            Some(Grant::Slot(slot)) => {
                state.total = state.total.saturating_sub(1);
                slot.retire();
                None
            }
            other => other,
        }
    };
    drop(unclaimed);
}

/// Point-in-time snapshot of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub available: usize,
    pub waiting: usize,
    pub total: usize,
    pub size: usize,
    pub recycled: usize,
    /// Resources handed out so far, reused or fresh.
    pub checkouts: usize,
}

/// Outcome of the locked part of `acquire`.
enum Checkout<R> {
    Ready(Pooled<R>),
    Create(u64, Slot<R>),
    Wait(oneshot::Receiver<Grant<R>>),
    Closed,
}

pub struct ResourcePool<F: ResourceFactory> {
    factory: F,
    size: usize,
    recycle_after: Option<usize>,
    state: Shared<F::Resource>,
}

impl<F: ResourceFactory> ResourcePool<F> {
    pub fn new(factory: F, size: usize, recycle_after: Option<usize>) -> Result<Self, RunnerError> {
        if size == 0 {
            return Err(RunnerError::Configuration(
                "Pool size must be greater than 0".to_string(),
            ));
        }
        if recycle_after == Some(0) {
            return Err(RunnerError::Configuration(
                "recycle_after must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            factory,
            size,
            recycle_after,
            state: Arc::new(Mutex::new(PoolState {
                available: VecDeque::new(),
                waiters: VecDeque::new(),
                total: 0,
                recycled: 0,
                checkouts: 0,
                generation: 0,
                next_id: 0,
                closed: false,
            })),
        })
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Check out a resource.
    ///
    /// Returns an idle resource if there is one, creates a new one while the
    /// pool is below its size, and otherwise waits in FIFO order for one to be
    /// released. Resolves to `Ok(None)` when the pool is drained while waiting.
    /// A factory error is returned to this caller only; its capacity slot is
    /// passed on to the next waiter.
    ///
    /// Dropping the future at any point loses nothing: a grant that arrives
    /// for a cancelled acquire frees its slot again.
    pub async fn acquire(&self) -> Result<Option<Pooled<F::Resource>>, CaptureError> {
        let entry = match self.checkout() {
            Checkout::Ready(entry) => entry,
            Checkout::Create(id, slot) => self.create_in_slot(id, slot).await?,
            Checkout::Wait(receiver) => match receiver.await {
                Ok(Grant::Resource(mut entry)) => {
                    entry.use_count += 1;
                    entry
                }
                Ok(Grant::Slot(slot)) => {
                    let id = self.lock().next_id();
                    self.create_in_slot(id, slot).await?
                }
                Err(_) => return Ok(None),
            },
            Checkout::Closed => return Ok(None),
        };

        self.lock().checkouts += 1;
        Ok(Some(entry))
    }

    fn checkout(&self) -> Checkout<F::Resource> {
        let mut state = self.lock();

        if state.closed {
            return Checkout::Closed;
        }

        if let Some(mut entry) = state.available.pop_front() {
            entry.use_count += 1;
            debug!(resource = entry.id, uses = entry.use_count, "Reusing pooled resource");
            return Checkout::Ready(entry);
        }

        if state.total < self.size {
            state.total += 1;
            let id = state.next_id();
            return Checkout::Create(id, Slot::new(state.generation, &self.state));
        }

        let (sender, receiver) = oneshot::channel();
        state.waiters.push_back(sender);
        debug!(waiting = state.waiters.len(), "Pool exhausted, queueing acquire");
        Checkout::Wait(receiver)
    }

    /// Return a resource after use.
    ///
    /// The resource is reset first (failures are ignored), replaced if it has
    /// reached the recycle threshold, then handed to the oldest waiter or put
    /// back as available.
    pub async fn release(&self, mut entry: Pooled<F::Resource>) {
        if let Err(err) = entry.resource.reset().await {
            debug!(resource = entry.id, error = %err, "Reset failed, keeping resource");
        }

        if self.is_stale(&entry) {
            debug!(resource = entry.id, "Released after drain, closing");
            close_quietly(entry).await;
            return;
        }

        let due_for_recycle = self
            .recycle_after
            .map_or(false, |limit| entry.use_count % limit == 0);

        let entry = if due_for_recycle {
            match self.recycle(entry).await {
                Some(fresh) => fresh,
                None => return,
            }
        } else {
            entry
        };

        self.hand_off(entry).await;
    }

    /// Close a resource the caller no longer trusts and free its slot.
    pub async fn discard(&self, entry: Pooled<F::Resource>) {
        debug!(resource = entry.id, "Discarding resource");
        close_quietly(entry).await;
    }

    /// Close every idle resource and wake every waiter with `None`.
    ///
    /// Resources checked out at this point are closed when they come back.
    /// The pool can be used again afterwards and starts from zero resources.
    pub async fn drain(&self) {
        let (idle, waiters) = {
            let mut state = self.lock();
            state.generation += 1;
            state.total = 0;
            (
                std::mem::take(&mut state.available),
                std::mem::take(&mut state.waiters),
            )
        };

        info!(idle = idle.len(), waiters = waiters.len(), "Draining resource pool");

        // a dropped sender resolves its waiter to `None`
        drop(waiters);
        for entry in idle {
            close_quietly(entry).await;
        }
    }

    /// Drain the pool for good: acquires made afterwards resolve to `None`
    /// instead of creating new resources.
    pub async fn shutdown(&self) {
        self.lock().closed = true;
        self.drain().await;
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            available: state.available.len(),
            waiting: state.waiters.iter().filter(|w| !w.is_closed()).count(),
            total: state.total,
            size: self.size,
            recycled: state.recycled,
            checkouts: state.checkouts,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<F::Resource>> {
        lock_state(&self.state)
    }

    async fn create_in_slot(
        &self,
        id: u64,
        slot: Slot<F::Resource>,
    ) -> Result<Pooled<F::Resource>, CaptureError> {
        match self.factory.create().await {
            Ok(resource) => {
                debug!(resource = id, "Created pooled resource");
                Ok(Pooled {
                    id,
                    use_count: 1,
                    slot,
                    resource,
                })
            }
            Err(err) => {
                warn!(error = %err, "Failed to create pooled resource");
                drop(slot);
                Err(err)
            }
        }
    }

    async fn recycle(&self, entry: Pooled<F::Resource>) -> Option<Pooled<F::Resource>> {
        let Pooled {
            id: old_id,
            use_count: uses,
            slot,
            resource,
        } = entry;
        if let Err(err) = resource.close().await {
            debug!(resource = old_id, error = %err, "Ignoring close failure");
        }

        let id = {
            let mut state = self.lock();
            state.recycled += 1;
            state.next_id()
        };
        debug!(resource = old_id, uses, "Recycling resource");

        match self.factory.create().await {
            Ok(resource) => Some(Pooled {
                id,
                use_count: 0,
                slot,
                resource,
            }),
            Err(err) => {
                warn!(error = %err, "Replacement failed, pool capacity reduced");
                drop(slot);
                None
            }
        }
    }

    async fn hand_off(&self, entry: Pooled<F::Resource>) {
        let unclaimed = {
            let mut state = self.lock();

            if entry.generation() != state.generation {
                Some(Grant::Resource(entry))
            } else {
                match state.offer(Grant::Resource(entry)) {
                    None => {
                        debug!(waiting = state.waiters.len(), "Handed resource to waiter");
                        None
                    }
                    Some(Grant::Resource(entry)) => {
                        state.available.push_back(entry);
                        None
                    }
                    other => other,
                }
            }
        };

        // only a resource from before a drain comes back out
        if let Some(Grant::Resource(stale)) = unclaimed {
            close_quietly(stale).await;
        }
    }

    fn is_stale(&self, entry: &Pooled<F::Resource>) -> bool {
        self.lock().generation != entry.generation()
    }
}

/// Close the resource, then give up its slot.
async fn close_quietly<R: Resource>(entry: Pooled<R>) {
    let Pooled { id, slot, resource, .. } = entry;
    if let Err(err) = resource.close().await {
        debug!(resource = id, error = %err, "Ignoring close failure");
    }
    drop(slot);
}
