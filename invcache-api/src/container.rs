//! Process-wide set of collectors, keyed by provider UID.

use futures::future::join_all;
use invcache_store::{Store, StoreError, StoreOptions};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::collector::{Collector, CollectorSettings};
use crate::config::Settings;
use crate::providers::{Provider, ProviderRegistry};
use crate::registry::{ModelRegistry, ProviderModel};
use crate::upstream::UpstreamFactory;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("unsupported provider type: {0}")]
    UnsupportedType(String),

    #[error("invalid provider: {0}")]
    InvalidProvider(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Container {
    collectors: RwLock<HashMap<String, Arc<Collector>>>,
    /// Serializes `add` so a cache file is opened by one collector at a
    /// time. Readers never take it.
    adding: Mutex<()>,
    settings: Settings,
    models: Arc<ModelRegistry>,
    providers: Arc<ProviderRegistry>,
    upstreams: UpstreamFactory,
}

impl Container {
    pub fn new(
        settings: Settings,
        models: Arc<ModelRegistry>,
        providers: Arc<ProviderRegistry>,
        upstreams: UpstreamFactory,
    ) -> Self {
        Self {
            collectors: RwLock::new(HashMap::new()),
            adding: Mutex::new(()),
            settings,
            models,
            providers,
            upstreams,
        }
    }

    pub fn provider_registry(&self) -> &Arc<ProviderRegistry> {
        &self.providers
    }

    pub fn store_path(&self, uid: &str) -> PathBuf {
        self.settings.data_dir.join(format!("{}.db", uid))
    }

    /// Model for a provider type: dynamic types first, then built-ins.
    pub async fn model_for(&self, provider_type: &str) -> Option<Arc<ProviderModel>> {
        if let Some(dynamic) = self.providers.get(provider_type).await {
            return Some(Arc::new(ProviderModel::dynamic(
                provider_type,
                &dynamic.columns,
            )));
        }
        self.models.get(provider_type)
    }

    /// Collector for `provider`, started if new. An existing collector for
    /// the same UID is returned as is.
    pub async fn add(&self, provider: Provider) -> Result<Arc<Collector>, ContainerError> {
        if let Some(existing) = self.get(&provider.uid).await {
            return Ok(existing);
        }

        let _adding = self.adding.lock().await;
        if let Some(existing) = self.get(&provider.uid).await {
            return Ok(existing);
        }
        // The store is opened without the map lock held.
        let collector = self.build(provider).await?;
        self.collectors
            .write()
            .await
            .insert(collector.provider().uid.clone(), collector.clone());

        collector.start();
        info!(
            uid = %collector.provider().uid,
            name = %collector.provider().name,
            provider_type = %collector.provider().provider_type,
            "Provider added"
        );
        Ok(collector)
    }

    async fn build(&self, provider: Provider) -> Result<Arc<Collector>, ContainerError> {
        if provider.uid.is_empty()
            || provider.uid.contains(['/', '\\'])
            || provider.uid.starts_with('.')
        {
            return Err(ContainerError::InvalidProvider(format!(
                "uid {:?}",
                provider.uid
            )));
        }
        let model = self
            .model_for(&provider.provider_type)
            .await
            .ok_or_else(|| ContainerError::UnsupportedType(provider.provider_type.clone()))?;

        let store = Store::open_with(
            self.store_path(&provider.uid),
            model.schema(),
            StoreOptions {
                truncate: true,
                watch_queue: self.settings.watch_queue,
            },
        )
        .await?;
        let settings = CollectorSettings {
            refresh_interval: self.refresh_interval(&provider).await,
            retry_interval: self.settings.retry_interval,
        };
        let upstream = self.upstreams.create(&provider);
        Ok(Collector::new(provider, model, store, upstream, settings))
    }

    /// Provider override, then dynamic type override, then the default.
    async fn refresh_interval(&self, provider: &Provider) -> Duration {
        if let Some(secs) = provider.refresh_interval {
            return Duration::from_secs(secs);
        }
        if let Some(secs) = self
            .providers
            .get(&provider.provider_type)
            .await
            .and_then(|d| d.refresh_interval)
        {
            return Duration::from_secs(secs);
        }
        self.settings.refresh_interval
    }

    pub async fn get(&self, uid: &str) -> Option<Arc<Collector>> {
        self.collectors.read().await.get(uid).cloned()
    }

    /// All collectors, ordered by UID.
    pub async fn list(&self) -> Vec<Arc<Collector>> {
        let mut collectors: Vec<Arc<Collector>> =
            self.collectors.read().await.values().cloned().collect();
        collectors.sort_by(|a, b| a.provider().uid.cmp(&b.provider().uid));
        collectors
    }

    /// Remove a provider, stop its collector and delete its cache file.
    pub async fn delete(&self, uid: &str) -> bool {
        let removed = self.collectors.write().await.remove(uid);
        match removed {
            Some(collector) => {
                if let Err(e) = collector.shutdown(true).await {
                    warn!(uid, "Failed to close provider cache: {}", e);
                }
                info!(uid, "Provider deleted");
                true
            }
            None => false,
        }
    }

    /// Re-create the collector when the provider definition changed.
    pub async fn replace(&self, provider: Provider) -> Result<Arc<Collector>, ContainerError> {
        if let Some(existing) = self.get(&provider.uid).await {
            if existing.provider() == &provider {
                return Ok(existing);
            }
            self.delete(&provider.uid).await;
        }
        self.add(provider).await
    }

    /// Stop every collector concurrently. Cache files are kept.
    pub async fn shutdown(&self) {
        let collectors: Vec<Arc<Collector>> = self
            .collectors
            .write()
            .await
            .drain()
            .map(|(_, c)| c)
            .collect();
        let results = join_all(collectors.iter().map(|c| c.shutdown(false))).await;
        for (collector, result) in collectors.iter().zip(results) {
            if let Err(e) = result {
                warn!(uid = %collector.provider().uid, "Failed to close provider cache: {}", e);
            }
        }
        info!(count = collectors.len(), "All collectors stopped");
    }
}
