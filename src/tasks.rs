//! Bookkeeping for the background tasks of one chatbot.
//!
//! Every stage of a pipeline registers itself here while it runs. The registry
//! reports when it goes from idle to busy and back, and can ask every live
//! task to stop. Stopping is cooperative: tasks observe their
//! [`CancellationToken`] at stage boundaries.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Completion,
    Translation,
    Speech,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Completion => "completion",
            Stage::Translation => "translation",
            Stage::Speech => "speech",
        };
        f.write_str(name)
    }
}

/// Handle of a registered task. Handles are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TaskId(u64);

struct Entry {
    stage: Stage,
    token: CancellationToken,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    live: BTreeMap<TaskId, Entry>,
}

type StatusListener = Box<dyn Fn(bool) + Send + Sync>;

struct Shared {
    inner: Mutex<Inner>,
    on_status: StatusListener,
}

#[derive(Clone)]
pub struct TaskRegistry {
    shared: Arc<Shared>,
}

impl TaskRegistry {
    /// `on_status(true)` fires when the first task registers, `on_status(false)`
    /// when the last one leaves. The listener runs under the registry lock so
    /// notifications come out in transition order; keep it short and never
    /// call back into the registry from it.
    pub fn new(on_status: impl Fn(bool) + Send + Sync + 'static) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::default()),
                on_status: Box::new(on_status),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a running task. The task stays registered until the returned
    /// guard is dropped.
    pub fn register(&self, stage: Stage, token: CancellationToken) -> TaskGuard {
        let mut inner = self.lock();
        let id = TaskId(inner.next_id);
        inner.next_id += 1;
        inner.live.insert(id, Entry { stage, token });
        debug!(task = id.0, %stage, live = inner.live.len(), "task registered");
        if inner.live.len() == 1 {
            (self.shared.on_status)(true);
        }
        TaskGuard {
            registry: self.clone(),
            id,
        }
    }

    /// Removes a task. Unknown or already removed handles are ignored.
    pub fn remove(&self, id: TaskId) {
        let mut inner = self.lock();
        if let Some(entry) = inner.live.remove(&id) {
            debug!(task = id.0, stage = %entry.stage, live = inner.live.len(), "task removed");
            if inner.live.is_empty() {
                (self.shared.on_status)(false);
            }
        }
    }

    /// Asks every registered task to stop. Tasks stay registered until they
    /// notice and finish.
    pub fn cancel_all(&self) {
        let inner = self.lock();
        for entry in inner.live.values() {
            entry.token.cancel();
        }
        if !inner.live.is_empty() {
            debug!(live = inner.live.len(), "cancelled all tasks");
        }
    }

    pub fn len(&self) -> usize {
        self.lock().live.len()
    }

    pub fn is_busy(&self) -> bool {
        !self.lock().live.is_empty()
    }

    pub fn stages(&self) -> Vec<Stage> {
        self.lock().live.values().map(|e| e.stage).collect()
    }
}

/// Deregisters its task when dropped, including on panic or abort.
pub struct TaskGuard {
    registry: TaskRegistry,
    id: TaskId,
}

impl TaskGuard {
    pub fn id(&self) -> TaskId {
        self.id
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
