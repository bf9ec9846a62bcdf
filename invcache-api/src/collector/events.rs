use async_trait::async_trait;
use invcache_store::{Event, EventHandler, WatchError, WatchOptions};
use tracing::{debug, info, warn};

/// Logs the live changes of one kind.
pub struct ChangeLogger {
    provider: String,
    kind: String,
}

impl ChangeLogger {
    pub fn new(provider: &str, kind: &str) -> Self {
        Self {
            provider: provider.to_string(),
            kind: kind.to_string(),
        }
    }
}

#[async_trait]
impl EventHandler for ChangeLogger {
    fn options(&self) -> WatchOptions {
        WatchOptions { snapshot: false }
    }

    async fn started(&self, watch: u64) {
        debug!(provider = %self.provider, kind = %self.kind, watch, "Event watch started");
    }

    async fn parity(&self) {
        debug!(provider = %self.provider, kind = %self.kind, "Event watch parity");
    }

    async fn created(&self, event: &Event) {
        info!(
            provider = %self.provider,
            kind = %self.kind,
            id = %event.resource.id,
            name = %event.resource.name,
            "Created"
        );
    }

    async fn updated(&self, event: &Event) {
        debug!(
            provider = %self.provider,
            kind = %self.kind,
            id = %event.resource.id,
            revision = event.resource.revision,
            "Updated"
        );
    }

    async fn deleted(&self, event: &Event) {
        info!(
            provider = %self.provider,
            kind = %self.kind,
            id = %event.resource.id,
            name = %event.resource.name,
            "Deleted"
        );
    }

    async fn error(&self, error: &WatchError) {
        warn!(provider = %self.provider, kind = %self.kind, "Event watch failed: {}", error);
    }

    async fn end(&self) {
        debug!(provider = %self.provider, kind = %self.kind, "Event watch ended");
    }
}
