//! Typed lifecycle event bus.
//!
//! Handlers run synchronously in registration order; a panicking
//! handler is isolated and logged so the rest of the chain still
//! fires. There is no backpressure and no replay — subscribers only
//! see events emitted after they register.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::progress::TaskProgress;

/// Everything a task reports over its lifetime.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Start,
    Progress(TaskProgress),
    ChunkSuccess { chunk_index: u32 },
    ChunkError { chunk_index: u32, error: String },
    HashProgress { percent: u8 },
    HashComplete { hash: String },
    Success { file_url: String },
    Error { error: String },
    Pause,
    Resume,
    Cancel,
}

/// Discriminant used for keyed subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Start,
    Progress,
    ChunkSuccess,
    ChunkError,
    HashProgress,
    HashComplete,
    Success,
    Error,
    Pause,
    Resume,
    Cancel,
}

impl TaskEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TaskEvent::Start => EventKind::Start,
            TaskEvent::Progress(_) => EventKind::Progress,
            TaskEvent::ChunkSuccess { .. } => EventKind::ChunkSuccess,
            TaskEvent::ChunkError { .. } => EventKind::ChunkError,
            TaskEvent::HashProgress { .. } => EventKind::HashProgress,
            TaskEvent::HashComplete { .. } => EventKind::HashComplete,
            TaskEvent::Success { .. } => EventKind::Success,
            TaskEvent::Error { .. } => EventKind::Error,
            TaskEvent::Pause => EventKind::Pause,
            TaskEvent::Resume => EventKind::Resume,
            TaskEvent::Cancel => EventKind::Cancel,
        }
    }
}

/// Callback invoked with each matching event.
pub type EventHandler = Box<dyn Fn(&TaskEvent) + Send + Sync>;

/// Identifies a subscription for [`EventBus::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Registration {
    id: HandlerId,
    handler: Arc<dyn Fn(&TaskEvent) + Send + Sync>,
}

struct BusState {
    next_id: u64,
    by_kind: HashMap<EventKind, Vec<Registration>>,
    wildcard: Vec<Registration>,
}

/// Synchronous typed pub/sub. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    state: Arc<Mutex<BusState>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                next_id: 0,
                by_kind: HashMap::new(),
                wildcard: Vec::new(),
            })),
        }
    }

    /// Subscribes to one event kind.
    pub fn on(&self, kind: EventKind, handler: EventHandler) -> HandlerId {
        let handler: Arc<dyn Fn(&TaskEvent) + Send + Sync> = Arc::from(handler);
        let mut state = self.state.lock().unwrap();
        let id = HandlerId(state.next_id);
        state.next_id += 1;
        state
            .by_kind
            .entry(kind)
            .or_default()
            .push(Registration { id, handler });
        id
    }

    /// Subscribes to every event kind.
    pub fn on_any(&self, handler: EventHandler) -> HandlerId {
        let handler: Arc<dyn Fn(&TaskEvent) + Send + Sync> = Arc::from(handler);
        let mut state = self.state.lock().unwrap();
        let id = HandlerId(state.next_id);
        state.next_id += 1;
        state.wildcard.push(Registration { id, handler });
        id
    }

    /// Removes a subscription; unknown ids are ignored.
    pub fn off(&self, id: HandlerId) {
        let mut state = self.state.lock().unwrap();
        for regs in state.by_kind.values_mut() {
            regs.retain(|r| r.id != id);
        }
        state.wildcard.retain(|r| r.id != id);
    }

    /// Dispatches `event` to keyed handlers first, then wildcards,
    /// each group in registration order. A panicking handler does not
    /// stop the chain.
    pub fn emit(&self, event: &TaskEvent) {
        // Snapshot under the lock so handlers may re-subscribe freely.
        let handlers: Vec<Arc<dyn Fn(&TaskEvent) + Send + Sync>> = {
            let state = self.state.lock().unwrap();
            let keyed = state
                .by_kind
                .get(&event.kind())
                .into_iter()
                .flat_map(|regs| regs.iter());
            keyed
                .chain(state.wildcard.iter())
                .map(|r| Arc::clone(&r.handler))
                .collect()
        };

        for handler in handlers {
            let result = catch_unwind(AssertUnwindSafe(|| handler(event)));
            if result.is_err() {
                warn!(kind = ?event.kind(), "event handler panicked; continuing");
            }
        }
    }
}
