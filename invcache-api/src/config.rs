//! Runtime settings and the optional provider bootstrap file.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::providers::{DynamicType, Provider};

/// Settings shared by the container and its collectors.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub refresh_interval: Duration,
    pub retry_interval: Duration,
    pub watch_queue: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/inventory"),
            refresh_interval: Duration::from_secs(300),
            retry_interval: Duration::from_secs(5),
            watch_queue: invcache_store::journal::DEFAULT_QUEUE_SIZE,
        }
    }
}

/// Providers and dynamic types to register at startup.
///
/// ```json
/// {
///   "dynamicTypes": [{"type": "acme", "serviceUrl": "http://acme:8080"}],
///   "providers": [{"uid": "1b2c", "name": "lab", "namespace": "mtv", "type": "acme"}]
/// }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bootstrap {
    #[serde(default)]
    pub dynamic_types: Vec<DynamicType>,
    #[serde(default)]
    pub providers: Vec<Provider>,
}

impl Bootstrap {
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_bootstrap_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("providers.json");
        tokio::fs::write(
            &path,
            r#"{"dynamicTypes":[{"type":"acme","serviceUrl":"http://acme:8080"}],
                "providers":[{"uid":"u1","name":"lab","type":"acme"}]}"#,
        )
        .await
        .unwrap();

        let bootstrap = Bootstrap::load(&path).await.unwrap();
        assert_eq!(bootstrap.dynamic_types.len(), 1);
        assert_eq!(bootstrap.providers[0].uid, "u1");
        assert_eq!(bootstrap.providers[0].namespace, "");

        assert!(Bootstrap::load(&dir.path().join("missing.json")).await.is_err());
    }
}
