//! Provider definitions and the dynamic provider type registry.

use invcache_store::Column;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;
use utoipa::ToSchema;

use crate::upstream::{UpstreamError, probe};

pub const DEFAULT_HEALTH_PATH: &str = "/test_connection";

/// A provider instance whose inventory is cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    #[serde(default)]
    pub uid: String,
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(rename = "type")]
    pub provider_type: String,
    /// Service URL. Dynamic providers fall back to their type's URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Seconds between refreshes; overrides the process default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_interval: Option<u64>,
}

fn default_health_path() -> String {
    DEFAULT_HEALTH_PATH.to_string()
}

/// A provider type served by an external service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DynamicType {
    #[serde(rename = "type")]
    pub provider_type: String,
    pub service_url: String,
    #[serde(default = "default_health_path")]
    pub health_check_path: String,
    /// Seconds between refreshes for providers of this type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_interval: Option<u64>,
    /// Extra change-detection columns, keyed by kind.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[schema(value_type = Object)]
    pub columns: BTreeMap<String, Vec<Column>>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown provider type: {0}")]
    UnknownType(String),

    #[error("invalid service url: {0}")]
    InvalidUrl(String),

    #[error("health check failed: {0}")]
    HealthCheck(#[from] UpstreamError),
}

/// Dynamic provider types and their services.
pub struct ProviderRegistry {
    types: RwLock<HashMap<String, DynamicType>>,
    client: reqwest::Client,
}

impl ProviderRegistry {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            types: RwLock::new(HashMap::new()),
            client,
        }
    }

    /// Add or replace a type.
    pub async fn register_type(&self, mut dynamic: DynamicType) -> Result<(), RegistryError> {
        validate_url(&dynamic.service_url)?;
        if !dynamic.health_check_path.starts_with('/') {
            dynamic.health_check_path = format!("/{}", dynamic.health_check_path);
        }
        info!(
            provider_type = %dynamic.provider_type,
            url = %dynamic.service_url,
            "Registered dynamic provider type"
        );
        self.types
            .write()
            .await
            .insert(dynamic.provider_type.clone(), dynamic);
        Ok(())
    }

    /// Point a type at a new service. The new service must pass a health
    /// check first; on failure the old URL stays in place.
    pub async fn update_service_url(
        &self,
        provider_type: &str,
        url: &str,
    ) -> Result<(), RegistryError> {
        validate_url(url)?;
        let health = self
            .get(provider_type)
            .await
            .ok_or_else(|| RegistryError::UnknownType(provider_type.to_string()))?
            .health_check_path;
        probe(
            &self.client,
            &format!("{}{}", url.trim_end_matches('/'), health),
        )
        .await?;

        let mut types = self.types.write().await;
        let entry = types
            .get_mut(provider_type)
            .ok_or_else(|| RegistryError::UnknownType(provider_type.to_string()))?;
        entry.service_url = url.to_string();
        info!(provider_type, url, "Updated dynamic provider service url");
        Ok(())
    }

    pub async fn unregister(&self, provider_type: &str) -> bool {
        let removed = self.types.write().await.remove(provider_type).is_some();
        if removed {
            info!(provider_type, "Unregistered dynamic provider type");
        }
        removed
    }

    pub async fn get(&self, provider_type: &str) -> Option<DynamicType> {
        self.types.read().await.get(provider_type).cloned()
    }

    pub async fn is_dynamic(&self, provider_type: &str) -> bool {
        self.types.read().await.contains_key(provider_type)
    }

    pub async fn list(&self) -> Vec<DynamicType> {
        let mut types: Vec<DynamicType> = self.types.read().await.values().cloned().collect();
        types.sort_by(|a, b| a.provider_type.cmp(&b.provider_type));
        types
    }
}

fn validate_url(url: &str) -> Result<(), RegistryError> {
    match reqwest::Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        _ => Err(RegistryError::InvalidUrl(url.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn acme(url: &str) -> DynamicType {
        DynamicType {
            provider_type: "acme".into(),
            service_url: url.into(),
            health_check_path: "health".into(),
            refresh_interval: None,
            columns: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let registry = ProviderRegistry::new(reqwest::Client::new());
        registry
            .register_type(acme("http://127.0.0.1:9000"))
            .await
            .unwrap();
        assert!(registry.is_dynamic("acme").await);
        assert_eq!(
            registry.get("acme").await.unwrap().health_check_path,
            "/health"
        );
        assert!(registry.unregister("acme").await);
        assert!(!registry.unregister("acme").await);
        assert!(!registry.is_dynamic("acme").await);
    }

    #[tokio::test]
    async fn test_register_rejects_bad_url() {
        let registry = ProviderRegistry::new(reqwest::Client::new());
        assert!(matches!(
            registry.register_type(acme("not a url")).await,
            Err(RegistryError::InvalidUrl(_))
        ));
        assert!(matches!(
            registry.register_type(acme("ftp://host/")).await,
            Err(RegistryError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_update_unknown_type() {
        let registry = ProviderRegistry::new(reqwest::Client::new());
        assert!(matches!(
            registry
                .update_service_url("nope", "http://127.0.0.1:1")
                .await,
            Err(RegistryError::UnknownType(_))
        ));
    }

    #[test]
    fn test_provider_json() {
        let p: Provider = serde_json::from_value(json!({
            "uid": "u1", "name": "p", "namespace": "ns", "type": "acme", "refreshInterval": 60
        }))
        .unwrap();
        assert_eq!(p.provider_type, "acme");
        assert_eq!(p.refresh_interval, Some(60));
        assert!(p.url.is_none());

        let d: DynamicType = serde_json::from_value(json!({
            "type": "acme",
            "serviceUrl": "http://svc",
            "columns": {"vm": [{"name": "firmware", "type": "text", "sources": ["firmware"]}]}
        }))
        .unwrap();
        assert_eq!(d.health_check_path, DEFAULT_HEALTH_PATH);
        assert_eq!(d.columns["vm"][0].name, "firmware");
    }
}
