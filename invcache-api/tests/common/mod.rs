//! Shared test utilities for invcache-api integration tests.

#![allow(dead_code)]

use axum::{
    Json, Router,
    extract::{Path, RawQuery, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use futures::StreamExt;
use invcache_api::rest::{AppState, create_router};
use invcache_api::{Container, ModelRegistry, ProviderRegistry, Settings, UpstreamFactory};
use reqwest::{Client, Response as ReqwestResponse};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Allocate an available port for testing.
pub fn allocate_port() -> u16 {
    portpicker::pick_unused_port().expect("No available port")
}

async fn serve(router: Router) -> (SocketAddr, tokio::sync::oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("Server error");
    });
    (addr, shutdown_tx)
}

/// Fake provider service: serves collections from memory, a health check,
/// and `/echo`, which reports the forwarded provider headers.
#[derive(Clone, Default)]
pub struct Sidecar {
    collections: Arc<Mutex<HashMap<String, Value>>>,
}

impl Sidecar {
    pub fn set(&self, collection: &str, items: Value) {
        self.collections
            .lock()
            .unwrap()
            .insert(collection.to_string(), items);
    }

    pub async fn spawn(self) -> SidecarServer {
        let router = Router::new()
            .route("/{collection}", get(sidecar_get))
            .with_state(self.clone());
        let (addr, shutdown_tx) = serve(router).await;
        SidecarServer {
            addr,
            sidecar: self,
            shutdown_tx,
        }
    }
}

async fn sidecar_get(
    State(sidecar): State<Sidecar>,
    Path(collection): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    match collection.as_str() {
        "test_connection" => StatusCode::OK.into_response(),
        "echo" => Json(json!({
            "name": header("x-forklift-provider-name"),
            "namespace": header("x-forklift-provider-namespace"),
            "uid": header("x-forklift-provider-uid"),
            "query": query,
        }))
        .into_response(),
        _ => {
            let items = sidecar
                .collections
                .lock()
                .unwrap()
                .get(&collection)
                .cloned()
                .unwrap_or_else(|| json!([]));
            Json(items).into_response()
        }
    }
}

pub struct SidecarServer {
    pub addr: SocketAddr,
    pub sidecar: Sidecar,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl SidecarServer {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Inventory server on an ephemeral port with a throwaway data directory.
pub struct TestServer {
    pub addr: SocketAddr,
    pub client: Client,
    pub container: Arc<Container>,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
    _dir: TempDir,
}

impl TestServer {
    pub async fn spawn() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let settings = Settings {
            data_dir: dir.path().to_path_buf(),
            // Refreshes only happen on request.
            refresh_interval: Duration::ZERO,
            retry_interval: Duration::from_millis(100),
            ..Settings::default()
        };

        let client = reqwest::Client::new();
        let models = Arc::new(ModelRegistry::builtin());
        let providers = Arc::new(ProviderRegistry::new(client.clone()));
        let container = Arc::new(Container::new(
            settings,
            models.clone(),
            providers.clone(),
            UpstreamFactory::new(client.clone(), providers.clone()),
        ));
        let app_state = Arc::new(AppState {
            container: container.clone(),
            providers,
            models,
            client,
        });

        let (addr, shutdown_tx) = serve(create_router(app_state)).await;

        Self {
            addr,
            client: Client::new(),
            container,
            shutdown_tx,
            _dir: dir,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Perform a GET request.
    pub async fn get(&self, path: &str) -> ReqwestResponse {
        self.client
            .get(format!("{}{}", self.base_url(), path))
            .send()
            .await
            .expect("Request failed")
    }

    /// Perform a POST request with JSON body.
    pub async fn post_json<T: Serialize>(&self, path: &str, body: &T) -> ReqwestResponse {
        self.client
            .post(format!("{}{}", self.base_url(), path))
            .json(body)
            .send()
            .await
            .expect("Request failed")
    }

    /// Perform a PUT request with JSON body.
    pub async fn put_json<T: Serialize>(&self, path: &str, body: &T) -> ReqwestResponse {
        self.client
            .put(format!("{}{}", self.base_url(), path))
            .json(body)
            .send()
            .await
            .expect("Request failed")
    }

    /// Perform a DELETE request.
    pub async fn delete(&self, path: &str) -> ReqwestResponse {
        self.client
            .delete(format!("{}{}", self.base_url(), path))
            .send()
            .await
            .expect("Request failed")
    }

    /// Register a dynamic provider type served by `url`.
    pub async fn add_dynamic_type(&self, provider_type: &str, url: &str) {
        let response = self
            .post_json(
                "/dynamic-types",
                &json!({"type": provider_type, "serviceUrl": url}),
            )
            .await;
        assert_eq!(response.status(), 201);
    }

    /// Add a provider; `url` is omitted for dynamic types.
    pub async fn add_provider(&self, provider_type: &str, uid: &str, url: Option<&str>) {
        let mut body = json!({
            "uid": uid,
            "name": format!("{}-name", uid),
            "namespace": "mtv",
            "type": provider_type,
        });
        if let Some(url) = url {
            body["url"] = json!(url);
        }
        let response = self.post_json("/providers", &body).await;
        assert_eq!(response.status(), 201);
    }

    /// Poll the provider until its collector reports parity.
    pub async fn wait_for_parity(&self, provider_type: &str, uid: &str) {
        let server = self;
        self.wait_until(move || async move {
            let body: Value = server
                .get(&format!("/providers/{}/{}", provider_type, uid))
                .await
                .json()
                .await
                .unwrap();
            body["parity"] == json!(true)
        })
        .await;
    }

    /// Poll `check` every 50ms for up to 10s.
    pub async fn wait_until<F, Fut>(&self, check: F)
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("condition not reached within 10s");
    }

    pub async fn shutdown(self) {
        self.container.shutdown().await;
        let _ = self.shutdown_tx.send(());
    }
}

/// Reads newline-delimited JSON from a streaming response.
pub struct Lines {
    stream: futures::stream::BoxStream<'static, reqwest::Result<axum::body::Bytes>>,
    buffer: Vec<u8>,
}

impl Lines {
    pub fn new(response: ReqwestResponse) -> Self {
        Self {
            stream: response.bytes_stream().boxed(),
            buffer: Vec::new(),
        }
    }

    /// Next line, or `None` when the stream ended. Fails after 10s.
    pub async fn next(&mut self) -> Option<Value> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                return Some(serde_json::from_slice(&line).expect("Invalid JSON line"));
            }
            let chunk = tokio::time::timeout(Duration::from_secs(10), self.stream.next())
                .await
                .expect("Timed out waiting for a watch line")?;
            self.buffer.extend_from_slice(&chunk.expect("Stream error"));
        }
    }

    /// Next line whose action is not `parity`.
    pub async fn next_change(&mut self) -> Option<Value> {
        loop {
            let line = self.next().await?;
            if line["action"] != "parity" {
                return Some(line);
            }
        }
    }
}
