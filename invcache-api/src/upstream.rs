//! Upstream inventory sources.
//!
//! Provider-specific SDK adapters implement [`Upstream`] and are registered
//! with the [`UpstreamFactory`] by provider type. Any type without an
//! adapter is read over HTTP from its service: `GET /vms`, `/networks`, ...
//! each returning a JSON array of documents.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use utoipa::ToSchema;

use crate::providers::{DEFAULT_HEALTH_PATH, Provider, ProviderRegistry};
use crate::registry::KindModel;

/// Bound for full inventory fetches.
pub const INVENTORY_TIMEOUT: Duration = Duration::from_secs(300);
/// Bound for health, version and other control-plane calls.
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{url} returned {status}")]
    Status { url: String, status: u16 },

    #[error("malformed response from {url}: {reason}")]
    Malformed { url: String, reason: String },

    #[error("no service url for provider {0}")]
    NotConfigured(String),
}

impl UpstreamError {
    /// The service answered, but not with a usable document.
    pub fn is_malformed(&self) -> bool {
        matches!(self, UpstreamError::Malformed { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Product {
    pub name: String,
    pub vendor: String,
}

/// Upstream product version. Empty when the service does not report one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Version {
    pub major: String,
    pub minor: String,
    pub build: String,
    pub revision: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<Product>,
}

impl Version {
    /// Parse `{"version": {...}, "product": {...}}`; scalar fields may be
    /// strings or numbers.
    pub fn from_json(doc: &Json) -> Self {
        let text = |node: Option<&Json>, key: &str| -> String {
            match node.and_then(|n| n.get(key)) {
                Some(Json::String(s)) => s.clone(),
                Some(Json::Number(n)) => n.to_string(),
                _ => String::new(),
            }
        };
        let version = doc.get("version");
        let product = doc.get("product").map(|p| Product {
            name: text(Some(p), "name"),
            vendor: text(Some(p), "vendor"),
        });
        Self {
            major: text(version, "major"),
            minor: text(version, "minor"),
            build: text(version, "build"),
            revision: text(version, "revision"),
            product,
        }
    }
}

/// Source of full inventory snapshots for one provider.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Every document of a kind.
    async fn list(&self, kind: &KindModel) -> Result<Vec<Json>, UpstreamError>;

    /// Connection probe, returning the HTTP-like status.
    async fn test(&self) -> Result<u16, UpstreamError>;

    async fn version(&self) -> Result<Version, UpstreamError>;
}

/// Plain GET probe used for health checks.
pub async fn probe(client: &reqwest::Client, url: &str) -> Result<u16, UpstreamError> {
    let response = client.get(url).timeout(CONTROL_TIMEOUT).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(UpstreamError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    Ok(status.as_u16())
}

/// Reads a provider service over HTTP.
pub struct HttpUpstream {
    client: reqwest::Client,
    provider: Provider,
    registry: Arc<ProviderRegistry>,
}

impl HttpUpstream {
    pub fn new(client: reqwest::Client, provider: Provider, registry: Arc<ProviderRegistry>) -> Self {
        Self {
            client,
            provider,
            registry,
        }
    }

    /// Base URL and health path. Dynamic types are looked up on every call
    /// so a service URL update takes effect on the next fetch.
    async fn endpoint(&self) -> Result<(String, String), UpstreamError> {
        let dynamic = self.registry.get(&self.provider.provider_type).await;
        let base = self
            .provider
            .url
            .clone()
            .filter(|u| !u.is_empty())
            .or_else(|| dynamic.as_ref().map(|d| d.service_url.clone()))
            .ok_or_else(|| UpstreamError::NotConfigured(self.provider.uid.clone()))?;
        let health = dynamic
            .map(|d| d.health_check_path)
            .unwrap_or_else(|| DEFAULT_HEALTH_PATH.to_string());
        Ok((base.trim_end_matches('/').to_string(), health))
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn list(&self, kind: &KindModel) -> Result<Vec<Json>, UpstreamError> {
        let (base, _) = self.endpoint().await?;
        let url = format!("{}/{}", base, kind.path);
        let response = self
            .client
            .get(&url)
            .timeout(INVENTORY_TIMEOUT)
            .send()
            .await?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(UpstreamError::Status {
                url,
                status: status.as_u16(),
            });
        }
        let body = response.bytes().await?;
        let doc: Json = serde_json::from_slice(&body).map_err(|e| UpstreamError::Malformed {
            url: url.clone(),
            reason: e.to_string(),
        })?;
        match doc {
            Json::Array(items) => {
                debug!(url = %url, count = items.len(), "Fetched inventory");
                Ok(items)
            }
            _ => Err(UpstreamError::Malformed {
                url,
                reason: "expected a JSON array".to_string(),
            }),
        }
    }

    async fn test(&self) -> Result<u16, UpstreamError> {
        let (base, health) = self.endpoint().await?;
        probe(&self.client, &format!("{}{}", base, health)).await
    }

    async fn version(&self) -> Result<Version, UpstreamError> {
        let (base, _) = self.endpoint().await?;
        let url = format!("{}/version", base);
        let response = self
            .client
            .get(&url)
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(Version::default());
        }
        if !status.is_success() {
            return Err(UpstreamError::Status {
                url,
                status: status.as_u16(),
            });
        }
        let doc: Json = response.json().await.map_err(|e| UpstreamError::Malformed {
            url,
            reason: e.to_string(),
        })?;
        Ok(Version::from_json(&doc))
    }
}

/// Builds an upstream for a provider.
pub type Adapter = Arc<dyn Fn(&Provider) -> Arc<dyn Upstream> + Send + Sync>;

pub struct UpstreamFactory {
    client: reqwest::Client,
    registry: Arc<ProviderRegistry>,
    adapters: HashMap<String, Adapter>,
}

impl UpstreamFactory {
    pub fn new(client: reqwest::Client, registry: Arc<ProviderRegistry>) -> Self {
        Self {
            client,
            registry,
            adapters: HashMap::new(),
        }
    }

    /// Use `adapter` for every provider of `provider_type`.
    pub fn register(&mut self, provider_type: &str, adapter: Adapter) {
        self.adapters.insert(provider_type.to_string(), adapter);
    }

    pub fn create(&self, provider: &Provider) -> Arc<dyn Upstream> {
        match self.adapters.get(&provider.provider_type) {
            Some(adapter) => adapter(provider),
            None => Arc::new(HttpUpstream::new(
                self.client.clone(),
                provider.clone(),
                self.registry.clone(),
            )),
        }
    }
}
