//! Change journal and watch delivery.
//!
//! A transaction stages one [`Event`] per mutation. After a successful
//! commit the journal hands the batch to every watch registered for the
//! kind. Each watch owns a bounded queue drained by its own delivery task,
//! so a slow handler only delays itself; when its queue is full the watch
//! is dropped and told so with [`WatchError::Overflow`].

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::resource::Resource;

/// Default number of undelivered commit batches a watch may hold.
pub const DEFAULT_QUEUE_SIZE: usize = 250;

/// How long closing waits for a handler to take `end` before aborting it.
const END_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Created,
    Updated,
    Deleted,
}

/// A committed change to one row.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: u64,
    pub action: Action,
    pub kind: String,
    /// New state for created/updated, removed state for deleted.
    pub resource: Resource,
    /// Previous state for updates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prior: Option<Resource>,
}

impl Event {
    pub(crate) fn new(action: Action, resource: Resource, prior: Option<Resource>) -> Self {
        Self {
            id: 0,
            action,
            kind: resource.kind.clone(),
            resource,
            prior,
        }
    }

    /// Revision the row had before this change.
    pub fn prior_revision(&self) -> Option<i64> {
        match self.action {
            Action::Created => None,
            Action::Updated => self.prior.as_ref().map(|p| p.revision),
            Action::Deleted => Some(self.resource.revision),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WatchError {
    /// The watch fell behind and its queue was discarded.
    #[error("full queue")]
    Overflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    /// Deliver every existing row as `created` before parity.
    pub snapshot: bool,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self { snapshot: true }
    }
}

/// Receives the events of one watch, one call at a time.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    fn options(&self) -> WatchOptions {
        WatchOptions::default()
    }

    async fn started(&self, _watch: u64) {}

    /// Snapshot delivered; live events follow.
    async fn parity(&self) {}

    async fn created(&self, _event: &Event) {}

    async fn updated(&self, _event: &Event) {}

    async fn deleted(&self, _event: &Event) {}

    async fn error(&self, _error: &WatchError) {}

    /// Last call; nothing is delivered afterwards.
    async fn end(&self) {}
}

type Batch = Vec<Event>;

#[derive(Default)]
struct WatchState {
    ended: AtomicBool,
    overflow: AtomicBool,
}

struct Registration {
    id: u64,
    kind: String,
    tx: mpsc::Sender<Batch>,
    state: Arc<WatchState>,
}

#[derive(Default)]
struct Registry {
    watches: Vec<Registration>,
    /// Delivery tasks by watch id, kept until closed or stopped.
    tasks: HashMap<u64, JoinHandle<()>>,
    closed: bool,
}

pub(crate) struct Journal {
    registry: Mutex<Registry>,
    queue_size: usize,
    serial: AtomicU64,
    next_watch: AtomicU64,
}

impl Journal {
    pub(crate) fn new(queue_size: usize) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            queue_size: queue_size.max(1),
            serial: AtomicU64::new(1),
            next_watch: AtomicU64::new(1),
        }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        // Registry updates never panic midway, a poisoned lock is still consistent.
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_serial(&self) -> u64 {
        self.serial.fetch_add(1, Ordering::Relaxed)
    }

    /// Fan out a committed batch. Must be called with the store write
    /// lock held so batches reach every queue in commit order.
    pub(crate) fn report(&self, mut events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        for event in &mut events {
            event.id = self.next_serial();
        }

        let mut registry = self.registry();
        registry.watches.retain(|w| {
            let batch: Batch = events.iter().filter(|e| e.kind == w.kind).cloned().collect();
            if batch.is_empty() {
                return true;
            }
            match w.tx.try_send(batch) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(watch = w.id, kind = %w.kind, "Watch queue full, dropping watch");
                    w.state.overflow.store(true, Ordering::SeqCst);
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    w.state.ended.store(true, Ordering::SeqCst);
                    false
                }
            }
        });
    }

    fn end(&self, id: u64) {
        let mut registry = self.registry();
        registry.watches.retain(|w| {
            if w.id == id {
                w.state.ended.store(true, Ordering::SeqCst);
                false
            } else {
                true
            }
        });
    }

    /// End every watch; further registrations are still accepted.
    pub(crate) fn end_all(&self) {
        let mut registry = self.registry();
        for w in registry.watches.drain(..) {
            w.state.ended.store(true, Ordering::SeqCst);
        }
    }

    /// End every watch, refuse new ones and wait for every delivery task
    /// to finish. A handler that does not return within [`END_GRACE`] is
    /// aborted. Nothing is delivered once this returns.
    pub(crate) async fn close(&self) {
        let tasks: Vec<(u64, JoinHandle<()>)> = {
            let mut registry = self.registry();
            for w in registry.watches.drain(..) {
                w.state.ended.store(true, Ordering::SeqCst);
            }
            registry.closed = true;
            registry.tasks.drain().collect()
        };
        for (id, mut task) in tasks {
            if tokio::time::timeout(END_GRACE, &mut task).await.is_err() {
                warn!(watch = id, "Watch handler did not end in time, aborting");
                task.abort();
                let _ = task.await;
            }
        }
    }

    fn take_task(&self, id: u64) -> Option<JoinHandle<()>> {
        self.registry().tasks.remove(&id)
    }

    fn is_delivering(&self, id: u64) -> bool {
        self.registry()
            .tasks
            .get(&id)
            .is_some_and(|t| !t.is_finished())
    }

    pub(crate) fn watch_count(&self) -> usize {
        self.registry().watches.len()
    }

    /// Register a handler and spawn its delivery task. `snapshot` is
    /// delivered as `created` events ahead of live changes.
    pub(crate) fn start(
        self: &Arc<Self>,
        kind: &str,
        handler: Arc<dyn EventHandler>,
        snapshot: Vec<Resource>,
    ) -> Option<Watch> {
        let snapshot: Vec<Event> = snapshot
            .into_iter()
            .map(|r| {
                let mut event = Event::new(Action::Created, r, None);
                event.id = self.next_serial();
                event
            })
            .collect();

        let mut registry = self.registry();
        if registry.closed {
            return None;
        }
        let id = self.next_watch.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_size);
        let state = Arc::new(WatchState::default());
        registry.watches.push(Registration {
            id,
            kind: kind.to_string(),
            tx,
            state: state.clone(),
        });
        registry.tasks.retain(|_, t| !t.is_finished());
        let task = tokio::spawn(deliver(handler, id, snapshot, rx, state.clone()));
        registry.tasks.insert(id, task);
        drop(registry);

        debug!(watch = id, kind, "Watch started");
        Some(Watch {
            id,
            kind: kind.to_string(),
            journal: self.clone(),
            state,
        })
    }
}

async fn deliver(
    handler: Arc<dyn EventHandler>,
    id: u64,
    snapshot: Vec<Event>,
    mut rx: mpsc::Receiver<Batch>,
    state: Arc<WatchState>,
) {
    let ended = || state.ended.load(Ordering::SeqCst);
    let overflowed = || state.overflow.load(Ordering::SeqCst);

    handler.started(id).await;
    for event in &snapshot {
        if ended() {
            handler.end().await;
            return;
        }
        handler.created(event).await;
    }
    handler.parity().await;

    'live: while let Some(batch) = rx.recv().await {
        for event in &batch {
            if overflowed() || ended() {
                break 'live;
            }
            match event.action {
                Action::Created => handler.created(event).await,
                Action::Updated => handler.updated(event).await,
                Action::Deleted => handler.deleted(event).await,
            }
        }
    }

    if overflowed() && !ended() {
        handler.error(&WatchError::Overflow).await;
    }
    handler.end().await;
    debug!(watch = id, "Watch ended");
}

/// Handle to a registered watch. Dropping it ends the watch.
pub struct Watch {
    id: u64,
    kind: String,
    journal: Arc<Journal>,
    state: Arc<WatchState>,
}

impl Watch {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// False once ended, overflowed or the delivery task finished.
    pub fn is_alive(&self) -> bool {
        !self.state.ended.load(Ordering::SeqCst)
            && !self.state.overflow.load(Ordering::SeqCst)
            && self.journal.is_delivering(self.id)
    }

    /// Stop delivery. Pending events are discarded and the handler
    /// receives `end`.
    pub fn end(&self) {
        self.journal.end(self.id);
    }

    /// End the watch and wait until the handler has seen `end`.
    pub async fn stop(self) {
        self.end();
        if let Some(task) = self.journal.take_task(self.id) {
            let _ = task.await;
        }
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        self.journal.end(self.id);
    }
}

impl std::fmt::Debug for Watch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watch")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}
