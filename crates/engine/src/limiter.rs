//! Bounded-parallelism scheduler for async work units.
//!
//! Work submitted through [`Limiter::run`] executes once the active
//! count drops below the limit; excess submissions queue in FIFO order.
//! Failures propagate individually — a failing unit never cancels its
//! peers. The limit can be raised or lowered live, and the pending
//! queue can be cleared without touching running units.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

/// Errors produced by the limiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LimiterError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The unit's queue slot was discarded by [`Limiter::clear_queue`]
    /// before it started.
    #[error("queued work was cleared before it started")]
    Cleared,
}

struct LimiterState {
    limit: usize,
    active: usize,
    queue: VecDeque<oneshot::Sender<Permit>>,
}

/// Grant handle; releasing it (drop) frees a slot and wakes the next
/// waiter in submission order.
struct Permit {
    inner: Option<Arc<Mutex<LimiterState>>>,
}

impl Permit {
    fn new(inner: Arc<Mutex<LimiterState>>) -> Self {
        Self { inner: Some(inner) }
    }

    /// Neutralizes the permit without releasing a slot. Used when a
    /// grant bounces off a dropped waiter while the state lock is held.
    fn disarm(&mut self) {
        self.inner = None;
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            let mut state = inner.lock().unwrap();
            state.active -= 1;
            grant_waiters(&mut state, &inner);
        }
    }
}

/// Hands slots to queued waiters while capacity remains.
fn grant_waiters(state: &mut LimiterState, inner: &Arc<Mutex<LimiterState>>) {
    while state.active < state.limit {
        let Some(tx) = state.queue.pop_front() else {
            break;
        };
        state.active += 1;
        let permit = Permit::new(Arc::clone(inner));
        if let Err(mut bounced) = tx.send(permit) {
            // Waiter gave up before its turn; take the slot back.
            bounced.disarm();
            state.active -= 1;
        }
    }
}

/// FIFO bounded-parallelism scheduler. Cheap to clone.
#[derive(Clone)]
pub struct Limiter {
    inner: Arc<Mutex<LimiterState>>,
}

impl Limiter {
    /// Creates a limiter allowing `limit` concurrent units. `limit`
    /// must be at least 1.
    pub fn new(limit: usize) -> Result<Self, LimiterError> {
        if limit == 0 {
            return Err(LimiterError::InvalidArgument(
                "concurrency limit must be at least 1".into(),
            ));
        }
        Ok(Self {
            inner: Arc::new(Mutex::new(LimiterState {
                limit,
                active: 0,
                queue: VecDeque::new(),
            })),
        })
    }

    /// Runs `fut` under the limit, queueing FIFO when saturated.
    ///
    /// Returns [`LimiterError::Cleared`] if the queue slot was
    /// discarded before the unit started; otherwise yields the
    /// future's own output (errors included) untouched.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, LimiterError>
    where
        F: Future,
    {
        let permit = self.acquire().await?;
        let out = fut.await;
        drop(permit);
        Ok(out)
    }

    async fn acquire(&self) -> Result<Permit, LimiterError> {
        let rx = {
            let mut state = self.inner.lock().unwrap();
            if state.active < state.limit {
                state.active += 1;
                return Ok(Permit::new(Arc::clone(&self.inner)));
            }
            let (tx, rx) = oneshot::channel();
            state.queue.push_back(tx);
            rx
        };
        rx.await.map_err(|_| LimiterError::Cleared)
    }

    /// Applies a new limit to subsequent acquisitions; already-active
    /// units finish under their old grant.
    pub fn update_limit(&self, limit: usize) -> Result<(), LimiterError> {
        if limit == 0 {
            return Err(LimiterError::InvalidArgument(
                "concurrency limit must be at least 1".into(),
            ));
        }
        let mut state = self.inner.lock().unwrap();
        state.limit = limit;
        grant_waiters(&mut state, &self.inner);
        Ok(())
    }

    pub fn limit(&self) -> usize {
        self.inner.lock().unwrap().limit
    }

    /// Units currently executing.
    pub fn active_count(&self) -> usize {
        self.inner.lock().unwrap().active
    }

    /// Units queued but not yet started.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    /// Discards all pending-but-not-started units; active units keep
    /// running. Cleared units resolve with [`LimiterError::Cleared`].
    pub fn clear_queue(&self) {
        let drained: Vec<_> = {
            let mut state = self.inner.lock().unwrap();
            state.queue.drain(..).collect()
        };
        drop(drained);
    }
}
