use axum::{
    Json, Router,
    routing::{any, delete, get, put},
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use super::handlers::{self, AppState};
use super::router;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Inventory cache API",
        version = "0.1.0",
        description = "Cached provider inventory: list, get and watch provider entities, manage providers and dynamic provider types."
    ),
    tags(
        (name = "system", description = "System information"),
        (name = "providers", description = "Provider lifecycle and collector status"),
        (name = "dynamic-types", description = "Provider types served by external services")
    ),
    paths(
        handlers::get_version,
        handlers::list_providers,
        handlers::list_providers_by_type,
        handlers::get_provider,
        handlers::create_provider,
        handlers::delete_provider,
        handlers::list_dynamic_types,
        handlers::register_dynamic_type,
        handlers::update_service_url,
        handlers::unregister_dynamic_type,
    ),
    components(schemas(
        handlers::ApiError,
        handlers::Reason,
        handlers::VersionInfo,
        handlers::ProviderDetail,
        handlers::ServiceUrlRequest,
        crate::providers::Provider,
        crate::providers::DynamicType,
        crate::collector::CollectorStatus,
        crate::collector::Phase,
        crate::collector::reconcile::Changes,
        crate::upstream::Version,
        crate::upstream::Product,
    ))
)]
pub struct ApiDoc;

async fn openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/version", get(handlers::get_version))
        .route(
            "/providers",
            get(handlers::list_providers).post(handlers::create_provider),
        )
        .route(
            "/providers/{provider_type}",
            get(handlers::list_providers_by_type),
        )
        .route(
            "/providers/{provider_type}/{uid}",
            get(handlers::get_provider).delete(handlers::delete_provider),
        )
        .route(
            "/providers/{provider_type}/{uid}/{*path}",
            any(router::dispatch),
        )
        .route(
            "/dynamic-types",
            get(handlers::list_dynamic_types).post(handlers::register_dynamic_type),
        )
        .route(
            "/dynamic-types/{provider_type}",
            delete(handlers::unregister_dynamic_type),
        )
        .route(
            "/dynamic-types/{provider_type}/service-url",
            put(handlers::update_service_url),
        )
        .route("/api-docs/openapi.json", get(openapi))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
