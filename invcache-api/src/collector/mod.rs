//! Per-provider collector.
//!
//! Drives the provider cache through
//! `Started → Load → Loaded → Parity → Refresh ⇄ Refresh`; any failure
//! drops to `Error`, waits the retry interval and starts again at `Load`.
//! Parity is reached once a full snapshot has been applied and the change
//! logging watches are installed. Reads are only served at parity.

mod events;
pub mod reconcile;

use chrono::{DateTime, Utc};
use invcache_store::{Store, StoreError, Watch};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;

pub use events::ChangeLogger;
pub use reconcile::Changes;

use crate::providers::Provider;
use crate::registry::ProviderModel;
use crate::upstream::{Upstream, UpstreamError, Version};

/// Consecutive store failures after which `Load` starts from empty tables.
const STORE_RESET_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Started,
    Load,
    Loaded,
    Parity,
    Refresh,
    Error,
}

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("collector shut down")]
    Shutdown,
}

impl CollectorError {
    fn is_store_fatal(&self) -> bool {
        matches!(self, CollectorError::Store(e) if e.is_fatal())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorSettings {
    /// Pause between refreshes. Zero disables polling; only resets refresh.
    pub refresh_interval: Duration,
    pub retry_interval: Duration,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(300),
            retry_interval: Duration::from_secs(5),
        }
    }
}

/// Point-in-time view of a collector.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CollectorStatus {
    pub provider: Provider,
    pub phase: Phase,
    pub parity: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub last_refresh: Option<DateTime<Utc>>,
    pub last_changes: Changes,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct State {
    phase: Phase,
    started_at: Option<DateTime<Utc>>,
    last_refresh: Option<DateTime<Utc>>,
    last_changes: Changes,
    last_error: Option<String>,
}

pub struct Collector {
    provider: Provider,
    model: Arc<ProviderModel>,
    store: Store,
    upstream: Arc<dyn Upstream>,
    settings: CollectorSettings,
    parity: AtomicBool,
    state: std::sync::Mutex<State>,
    refresh_lock: Mutex<()>,
    reset_tx: mpsc::Sender<()>,
    reset_rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
    shutdown_tx: watch::Sender<bool>,
    stopped: AtomicBool,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
    watches: Mutex<Vec<Watch>>,
    store_failures: AtomicU32,
}

impl Collector {
    pub fn new(
        provider: Provider,
        model: Arc<ProviderModel>,
        store: Store,
        upstream: Arc<dyn Upstream>,
        settings: CollectorSettings,
    ) -> Arc<Self> {
        let (reset_tx, reset_rx) = mpsc::channel(1);
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            provider,
            model,
            store,
            upstream,
            settings,
            parity: AtomicBool::new(false),
            state: std::sync::Mutex::new(State {
                phase: Phase::Started,
                started_at: None,
                last_refresh: None,
                last_changes: Changes::default(),
                last_error: None,
            }),
            refresh_lock: Mutex::new(()),
            reset_tx,
            reset_rx: std::sync::Mutex::new(Some(reset_rx)),
            shutdown_tx,
            stopped: AtomicBool::new(false),
            task: std::sync::Mutex::new(None),
            watches: Mutex::new(Vec::new()),
            store_failures: AtomicU32::new(0),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    pub fn model(&self) -> &Arc<ProviderModel> {
        &self.model
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn settings(&self) -> CollectorSettings {
        self.settings
    }

    pub fn has_parity(&self) -> bool {
        self.parity.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> Phase {
        self.state().phase
    }

    pub fn status(&self) -> CollectorStatus {
        let state = self.state();
        CollectorStatus {
            provider: self.provider.clone(),
            phase: state.phase,
            parity: self.has_parity(),
            started_at: state.started_at,
            last_refresh: state.last_refresh,
            last_changes: state.last_changes,
            last_error: state.last_error.clone(),
        }
    }

    /// Spawn the collector task. Calling it again has no effect.
    pub fn start(self: &Arc<Self>) {
        let Some(reset_rx) = self
            .reset_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            return;
        };
        let shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(Arc::clone(self).run(reset_rx, shutdown));
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Ask for a refresh soon. Requests made while one is pending collapse
    /// into it. Before parity the collector restarts at `Load` instead.
    pub fn reset(&self) {
        if self.reset_tx.try_send(()).is_ok() {
            debug!(provider = %self.provider.name, "Refresh requested");
        }
    }

    /// Connection probe against the upstream.
    pub async fn test(&self) -> Result<u16, UpstreamError> {
        self.upstream.test().await
    }

    pub async fn version(&self) -> Result<Version, UpstreamError> {
        self.upstream.version().await
    }

    /// Stop the collector task and its watches, then close the store.
    /// Nothing is delivered to watches once this returns. Idempotent.
    pub async fn shutdown(&self, remove: bool) -> Result<(), StoreError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown_tx.send_replace(true);
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.end_watches().await;
        self.parity.store(false, Ordering::SeqCst);
        self.store.close(remove).await?;
        info!(provider = %self.provider.name, uid = %self.provider.uid, "Collector shut down");
        Ok(())
    }

    async fn run(self: Arc<Self>, mut reset_rx: mpsc::Receiver<()>, mut shutdown: watch::Receiver<bool>) {
        info!(
            provider = %self.provider.name,
            uid = %self.provider.uid,
            provider_type = %self.provider.provider_type,
            "Collector started"
        );
        self.state().started_at = Some(Utc::now());

        let mut phase = Phase::Started;
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.state().phase = phase;
            let next = match phase {
                Phase::Started => Ok(Phase::Load),
                Phase::Load => self.load(&mut shutdown).await.map(|_| Phase::Loaded),
                Phase::Loaded => {
                    if take_reset(&mut reset_rx) {
                        info!(provider = %self.provider.name, "Reset before parity, reloading");
                        Ok(Phase::Load)
                    } else {
                        self.refresh(&mut shutdown).await.map(|_| Phase::Parity)
                    }
                }
                Phase::Parity => {
                    if take_reset(&mut reset_rx) {
                        info!(provider = %self.provider.name, "Reset before parity, reloading");
                        Ok(Phase::Load)
                    } else {
                        self.begin_watches().await.map(|_| Phase::Refresh)
                    }
                }
                Phase::Refresh => match self.refresh(&mut shutdown).await {
                    Ok(_) => self
                        .wait(&mut reset_rx, &mut shutdown)
                        .await
                        .map(|_| Phase::Refresh),
                    Err(e) => Err(e),
                },
                Phase::Error => {
                    let retry = self.settings.retry_interval;
                    cancellable(&mut shutdown, async {
                        tokio::time::sleep(retry).await;
                        Ok::<_, CollectorError>(())
                    })
                    .await
                    .map(|_| Phase::Load)
                }
            };

            phase = match next {
                Ok(next) => next,
                Err(CollectorError::Shutdown) => break,
                Err(e) => {
                    if e.is_store_fatal() {
                        self.store_failures.fetch_add(1, Ordering::SeqCst);
                    }
                    error!(
                        provider = %self.provider.name,
                        phase = ?phase,
                        "Collector failed: {}. Retrying in {:?}",
                        e,
                        self.settings.retry_interval
                    );
                    self.parity.store(false, Ordering::SeqCst);
                    self.state().last_error = Some(e.to_string());
                    Phase::Error
                }
            };
        }
        info!(provider = %self.provider.name, "Collector stopped");
    }

    /// Initial population. After repeated store failures the tables are
    /// recreated first.
    async fn load(&self, shutdown: &mut watch::Receiver<bool>) -> Result<(), CollectorError> {
        if self.store_failures.load(Ordering::SeqCst) >= STORE_RESET_THRESHOLD {
            warn!(provider = %self.provider.name, "Repeated store failures, resetting cache");
            self.end_watches().await;
            self.store.reset().await?;
            self.store_failures.store(0, Ordering::SeqCst);
        }
        let changes = self.sync(shutdown).await?;
        info!(
            provider = %self.provider.name,
            created = changes.created,
            updated = changes.updated,
            deleted = changes.deleted,
            "Inventory loaded"
        );
        Ok(())
    }

    /// One refresh cycle. Skipped when another is running.
    async fn refresh(&self, shutdown: &mut watch::Receiver<bool>) -> Result<(), CollectorError> {
        let changes = self.sync(shutdown).await?;
        if changes.is_empty() {
            debug!(provider = %self.provider.name, "Inventory refresh complete, no changes");
        } else {
            info!(
                provider = %self.provider.name,
                created = changes.created,
                updated = changes.updated,
                deleted = changes.deleted,
                "Inventory refresh complete"
            );
        }
        Ok(())
    }

    /// Fetch and apply every kind, one transaction per kind.
    async fn sync(&self, shutdown: &mut watch::Receiver<bool>) -> Result<Changes, CollectorError> {
        let Ok(_guard) = self.refresh_lock.try_lock() else {
            debug!(provider = %self.provider.name, "Refresh already running, skipped");
            return Ok(Changes::default());
        };

        let mut total = Changes::default();
        for kind in &self.model.kinds {
            let documents = match cancellable(shutdown, async {
                Ok::<_, CollectorError>(self.upstream.list(kind).await?)
            })
            .await
            {
                Ok(documents) => documents,
                Err(CollectorError::Upstream(e)) if e.is_malformed() => {
                    warn!(provider = %self.provider.name, kind = kind.name(), "Skipping kind: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let changes = cancellable(shutdown, async {
                Ok::<_, CollectorError>(reconcile::apply(&self.store, kind, &documents).await?)
            })
            .await?;
            if !changes.is_empty() {
                debug!(
                    provider = %self.provider.name,
                    kind = kind.name(),
                    created = changes.created,
                    updated = changes.updated,
                    deleted = changes.deleted,
                    "Kind reconciled"
                );
            }
            total.add(changes);
        }

        self.store_failures.store(0, Ordering::SeqCst);
        let mut state = self.state();
        state.last_refresh = Some(Utc::now());
        state.last_changes = total;
        state.last_error = None;
        Ok(total)
    }

    /// Replace the change logging watches and declare parity.
    async fn begin_watches(&self) -> Result<(), CollectorError> {
        self.end_watches().await;
        let mut installed = Vec::new();
        for kind in self.model.kinds.iter().filter(|k| k.watch) {
            let handler = Arc::new(ChangeLogger::new(&self.provider.name, kind.name()));
            installed.push(self.store.watch(kind.name(), handler).await?);
        }
        *self.watches.lock().await = installed;
        self.parity.store(true, Ordering::SeqCst);
        info!(provider = %self.provider.name, "Parity reached");
        Ok(())
    }

    async fn end_watches(&self) {
        let stale: Vec<Watch> = self.watches.lock().await.drain(..).collect();
        for watch in stale {
            watch.stop().await;
        }
    }

    /// Sleep until the next refresh is due or a reset arrives.
    async fn wait(
        &self,
        reset_rx: &mut mpsc::Receiver<()>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), CollectorError> {
        let interval = self.settings.refresh_interval;
        cancellable(shutdown, async {
            if interval.is_zero() {
                reset_rx.recv().await;
            } else {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = reset_rx.recv() => {}
                }
            }
            Ok::<_, CollectorError>(())
        })
        .await
    }
}

/// Consume a pending reset request.
fn take_reset(reset_rx: &mut mpsc::Receiver<()>) -> bool {
    reset_rx.try_recv().is_ok()
}

/// Run `fut` unless shutdown is signalled first.
async fn cancellable<T, F>(shutdown: &mut watch::Receiver<bool>, fut: F) -> Result<T, CollectorError>
where
    F: Future<Output = Result<T, CollectorError>>,
{
    tokio::select! {
        result = fut => result,
        _ = shutdown.wait_for(|stop| *stop) => Err(CollectorError::Shutdown),
    }
}
