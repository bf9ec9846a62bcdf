use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use invcache_store::StoreError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::collector::{Collector, CollectorStatus};
use crate::container::{Container, ContainerError};
use crate::providers::{DynamicType, Provider, ProviderRegistry, RegistryError};
use crate::registry::{ModelRegistry, ProviderModel};

/// Shared application state
pub struct AppState {
    pub container: Arc<Container>,
    pub providers: Arc<ProviderRegistry>,
    pub models: Arc<ModelRegistry>,
    /// Client for proxied requests to dynamic provider services.
    pub client: reqwest::Client,
}

impl AppState {
    /// Collector for `uid`, provided it is of `provider_type`.
    pub async fn collector(
        &self,
        provider_type: &str,
        uid: &str,
    ) -> Result<Arc<Collector>, ApiError> {
        match self.container.get(uid).await {
            Some(c) if c.provider().provider_type == provider_type => Ok(c),
            _ => Err(ApiError::unknown_provider(provider_type, uid)),
        }
    }
}

/// Machine-readable cause, sent in the `Reason` header and the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub enum Reason {
    UnknownProvider,
    NotReady,
    Forbidden,
    NotFound,
    BadRequest,
    Upstream,
    Internal,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::UnknownProvider => "UnknownProvider",
            Reason::NotReady => "NotReady",
            Reason::Forbidden => "Forbidden",
            Reason::NotFound => "NotFound",
            Reason::BadRequest => "BadRequest",
            Reason::Upstream => "Upstream",
            Reason::Internal => "Internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Reason::UnknownProvider | Reason::NotFound => StatusCode::NOT_FOUND,
            Reason::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            Reason::Forbidden => StatusCode::FORBIDDEN,
            Reason::BadRequest => StatusCode::BAD_REQUEST,
            Reason::Upstream => StatusCode::BAD_GATEWAY,
            Reason::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// API error response
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiError {
    #[serde(skip)]
    pub status: u16,
    pub error: String,
    pub reason: Reason,
}

impl ApiError {
    pub fn new(reason: Reason, error: impl Into<String>) -> Self {
        Self {
            status: reason.status().as_u16(),
            error: error.into(),
            reason,
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status.as_u16();
        self
    }

    pub fn unknown_provider(provider_type: &str, uid: &str) -> Self {
        Self::new(
            Reason::UnknownProvider,
            format!("provider {}/{} not found", provider_type, uid),
        )
    }

    pub fn not_ready(uid: &str) -> Self {
        Self::new(
            Reason::NotReady,
            format!("provider {} inventory not ready", uid),
        )
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::new(Reason::NotFound, what)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(Reason::BadRequest, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(Reason::Internal, msg)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let reason = self.reason.as_str();
        (status, [("reason", reason)], Json(self)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(msg) => ApiError::not_found(msg),
            StoreError::UnknownKind(kind) => ApiError::not_found(format!("unknown kind {}", kind)),
            StoreError::Predicate(msg) => ApiError::bad_request(msg),
            StoreError::InvalidSchema(msg) => ApiError::bad_request(msg),
            StoreError::Closed => ApiError::new(Reason::NotReady, "provider cache closed"),
            other => ApiError::internal(other.to_string()),
        }
    }
}

impl From<ContainerError> for ApiError {
    fn from(e: ContainerError) -> Self {
        match e {
            ContainerError::UnsupportedType(_) | ContainerError::InvalidProvider(_) => {
                ApiError::bad_request(e.to_string())
            }
            ContainerError::Store(e) => e.into(),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::UnknownType(_) => ApiError::not_found(e.to_string()),
            RegistryError::InvalidUrl(_) => ApiError::bad_request(e.to_string()),
            RegistryError::HealthCheck(_) => ApiError::new(Reason::Upstream, e.to_string()),
        }
    }
}

// === Version ===

/// Version information
#[derive(Serialize, ToSchema)]
pub struct VersionInfo {
    pub version: String,
}

/// Get service version
#[utoipa::path(
    get,
    path = "/version",
    responses(
        (status = 200, description = "Service version", body = VersionInfo)
    ),
    tag = "system"
)]
pub async fn get_version() -> Json<VersionInfo> {
    Json(VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// === Providers ===

/// Collector status plus row counts per collection.
#[derive(Serialize, ToSchema)]
pub struct ProviderDetail {
    #[serde(flatten)]
    pub status: CollectorStatus,
    /// Empty until the collector reaches parity.
    pub inventory: BTreeMap<String, u64>,
}

/// List cached providers
#[utoipa::path(
    get,
    path = "/providers",
    responses(
        (status = 200, description = "Providers and their collector status", body = Vec<CollectorStatus>)
    ),
    tag = "providers"
)]
pub async fn list_providers(State(state): State<Arc<AppState>>) -> Json<Vec<CollectorStatus>> {
    let collectors = state.container.list().await;
    Json(collectors.iter().map(|c| c.status()).collect())
}

/// List cached providers of one type
#[utoipa::path(
    get,
    path = "/providers/{provider_type}",
    params(("provider_type" = String, Path, description = "Provider type")),
    responses(
        (status = 200, description = "Providers of the type", body = Vec<CollectorStatus>)
    ),
    tag = "providers"
)]
pub async fn list_providers_by_type(
    State(state): State<Arc<AppState>>,
    Path(provider_type): Path<String>,
) -> Json<Vec<CollectorStatus>> {
    let collectors = state.container.list().await;
    Json(
        collectors
            .iter()
            .filter(|c| c.provider().provider_type == provider_type)
            .map(|c| c.status())
            .collect(),
    )
}

/// Get a provider
#[utoipa::path(
    get,
    path = "/providers/{provider_type}/{uid}",
    params(
        ("provider_type" = String, Path, description = "Provider type"),
        ("uid" = String, Path, description = "Provider UID")
    ),
    responses(
        (status = 200, description = "Provider status", body = ProviderDetail),
        (status = 404, description = "Unknown provider", body = ApiError)
    ),
    tag = "providers"
)]
pub async fn get_provider(
    State(state): State<Arc<AppState>>,
    Path((provider_type, uid)): Path<(String, String)>,
) -> Result<Json<ProviderDetail>, ApiError> {
    let collector = state.collector(&provider_type, &uid).await?;
    let mut inventory = BTreeMap::new();
    if collector.has_parity() {
        for kind in &collector.model().kinds {
            let n = collector.store().count(kind.name(), None).await?;
            inventory.insert(kind.path.clone(), n);
        }
    }
    Ok(Json(ProviderDetail {
        status: collector.status(),
        inventory,
    }))
}

/// Add or replace a provider
///
/// A missing UID is generated. Posting an unchanged definition is a no-op;
/// a changed one restarts the collector from an empty cache.
#[utoipa::path(
    post,
    path = "/providers",
    request_body = Provider,
    responses(
        (status = 201, description = "Provider added", body = CollectorStatus),
        (status = 400, description = "Invalid provider or unsupported type", body = ApiError)
    ),
    tag = "providers"
)]
pub async fn create_provider(
    State(state): State<Arc<AppState>>,
    Json(mut provider): Json<Provider>,
) -> Result<impl IntoResponse, ApiError> {
    if provider.uid.is_empty() {
        provider.uid = uuid::Uuid::new_v4().to_string();
    }
    let collector = state.container.replace(provider).await?;
    Ok((StatusCode::CREATED, Json(collector.status())))
}

/// Remove a provider and its cache
#[utoipa::path(
    delete,
    path = "/providers/{provider_type}/{uid}",
    params(
        ("provider_type" = String, Path, description = "Provider type"),
        ("uid" = String, Path, description = "Provider UID")
    ),
    responses(
        (status = 204, description = "Provider removed"),
        (status = 404, description = "Unknown provider", body = ApiError)
    ),
    tag = "providers"
)]
pub async fn delete_provider(
    State(state): State<Arc<AppState>>,
    Path((provider_type, uid)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    state.collector(&provider_type, &uid).await?;
    state.container.delete(&uid).await;
    Ok(StatusCode::NO_CONTENT)
}

// === Dynamic provider types ===

/// List dynamic provider types
#[utoipa::path(
    get,
    path = "/dynamic-types",
    responses(
        (status = 200, description = "Registered dynamic types", body = Vec<DynamicType>)
    ),
    tag = "dynamic-types"
)]
pub async fn list_dynamic_types(State(state): State<Arc<AppState>>) -> Json<Vec<DynamicType>> {
    Json(state.providers.list().await)
}

/// Register a dynamic provider type
#[utoipa::path(
    post,
    path = "/dynamic-types",
    request_body = DynamicType,
    responses(
        (status = 201, description = "Type registered", body = DynamicType),
        (status = 400, description = "Invalid type definition", body = ApiError)
    ),
    tag = "dynamic-types"
)]
pub async fn register_dynamic_type(
    State(state): State<Arc<AppState>>,
    Json(dynamic): Json<DynamicType>,
) -> Result<impl IntoResponse, ApiError> {
    if state.models.get(&dynamic.provider_type).is_some() {
        return Err(ApiError::bad_request(format!(
            "{} is a built-in provider type",
            dynamic.provider_type
        )));
    }
    ProviderModel::dynamic(&dynamic.provider_type, &dynamic.columns)
        .schema()
        .validate()?;

    let provider_type = dynamic.provider_type.clone();
    state.providers.register_type(dynamic).await?;
    let registered = state
        .providers
        .get(&provider_type)
        .await
        .ok_or_else(|| ApiError::internal("type vanished after registration"))?;
    Ok((StatusCode::CREATED, Json(registered)))
}

/// New service location for a dynamic type.
#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceUrlRequest {
    pub service_url: String,
}

/// Move a dynamic type to a new service
///
/// The new service must answer its health check before it is accepted.
#[utoipa::path(
    put,
    path = "/dynamic-types/{provider_type}/service-url",
    params(("provider_type" = String, Path, description = "Dynamic provider type")),
    request_body = ServiceUrlRequest,
    responses(
        (status = 200, description = "Service URL updated", body = DynamicType),
        (status = 404, description = "Unknown type", body = ApiError),
        (status = 502, description = "Health check failed", body = ApiError)
    ),
    tag = "dynamic-types"
)]
pub async fn update_service_url(
    State(state): State<Arc<AppState>>,
    Path(provider_type): Path<String>,
    Json(req): Json<ServiceUrlRequest>,
) -> Result<Json<DynamicType>, ApiError> {
    state
        .providers
        .update_service_url(&provider_type, &req.service_url)
        .await?;
    state
        .providers
        .get(&provider_type)
        .await
        .map(Json)
        .ok_or_else(|| RegistryError::UnknownType(provider_type).into())
}

/// Unregister a dynamic provider type
#[utoipa::path(
    delete,
    path = "/dynamic-types/{provider_type}",
    params(("provider_type" = String, Path, description = "Dynamic provider type")),
    responses(
        (status = 204, description = "Type removed"),
        (status = 403, description = "Providers of the type still exist", body = ApiError),
        (status = 404, description = "Unknown type", body = ApiError)
    ),
    tag = "dynamic-types"
)]
pub async fn unregister_dynamic_type(
    State(state): State<Arc<AppState>>,
    Path(provider_type): Path<String>,
) -> Result<StatusCode, ApiError> {
    let in_use = state
        .container
        .list()
        .await
        .iter()
        .filter(|c| c.provider().provider_type == provider_type)
        .count();
    if in_use > 0 {
        return Err(ApiError::new(
            Reason::Forbidden,
            format!("{} providers of type {} still exist", in_use, provider_type),
        ));
    }
    if !state.providers.unregister(&provider_type).await {
        return Err(RegistryError::UnknownType(provider_type).into());
    }
    Ok(StatusCode::NO_CONTENT)
}
