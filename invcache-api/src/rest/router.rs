//! Per-provider request routing.
//!
//! Everything below `/providers/{type}/{uid}/` lands here. Requests are
//! served from the provider's cache, or, for dynamic provider types on
//! paths that are not cached, forwarded to the provider service.

use axum::{
    Json,
    extract::{Path, Query, Request, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use super::handlers::{ApiError, AppState, Reason};
use super::inventory::{self, InventoryQuery};
use super::{proxy, watch};
use crate::collector::Collector;

/// Bound for every non-watch request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Collections served from the cache for dynamic providers.
const HOT_PATHS: [&str; 4] = ["vms", "networks", "storages", "disks"];

pub async fn dispatch(
    State(state): State<Arc<AppState>>,
    Path((provider_type, uid, path)): Path<(String, String, String)>,
    request: Request,
) -> Response {
    let collector = match state.collector(&provider_type, &uid).await {
        Ok(c) => c,
        Err(e) => return e.into_response(),
    };
    let query = match Query::<InventoryQuery>::try_from_uri(request.uri()) {
        Ok(Query(q)) => q,
        Err(e) => return ApiError::bad_request(e.body_text()).into_response(),
    };
    let segments: Vec<String> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();

    // Watches are long-lived and bounded by their own deadline.
    if query.is_watch() && request.method() == Method::GET && segments.len() == 1 {
        let Some(kind) = collector.model().by_path(&segments[0]) else {
            return ApiError::not_found(format!("unknown collection {}", segments[0]))
                .into_response();
        };
        let raw = state.providers.is_dynamic(&provider_type).await;
        return watch::serve(&collector, kind, &query, request.headers(), raw)
            .await
            .into_response();
    }

    let routed = route(&state, collector, &segments, query, request);
    match tokio::time::timeout(REQUEST_TIMEOUT, routed).await {
        Ok(result) => result.into_response(),
        Err(_) => ApiError::internal("request timed out")
            .with_status(StatusCode::GATEWAY_TIMEOUT)
            .into_response(),
    }
}

async fn route(
    state: &AppState,
    collector: Arc<Collector>,
    segments: &[String],
    query: InventoryQuery,
    request: Request,
) -> Result<Response, ApiError> {
    let parts: Vec<&str> = segments.iter().map(String::as_str).collect();
    let method = request.method().clone();

    if method == Method::POST && parts == ["refresh"] {
        collector.reset();
        return Ok(Json(json!({"refresh": "requested"})).into_response());
    }

    let dynamic = state
        .providers
        .get(&collector.provider().provider_type)
        .await;
    if let Some(dynamic) = dynamic {
        let hot = parts
            .first()
            .filter(|p| HOT_PATHS.contains(p))
            .and_then(|p| collector.model().by_path(p));
        return match (hot, parts.as_slice()) {
            (Some(kind), [_]) if method == Method::GET => {
                require_parity(&collector)?;
                let response = inventory::list_raw(&collector, kind, &query).await?;
                collector.reset();
                Ok(response)
            }
            (Some(kind), [_, id]) if method == Method::GET => {
                require_parity(&collector)?;
                inventory::get_raw(&collector, kind, id).await
            }
            _ => {
                let service_url = collector
                    .provider()
                    .url
                    .clone()
                    .filter(|u| !u.is_empty())
                    .unwrap_or(dynamic.service_url);
                proxy::forward(
                    &state.client,
                    collector.provider(),
                    &service_url,
                    &segments.join("/"),
                    request,
                )
                .await
            }
        };
    }

    if method == Method::GET && parts == ["version"] {
        let version = collector
            .version()
            .await
            .map_err(|e| ApiError::new(Reason::Upstream, e.to_string()))?;
        return Ok(Json(version).into_response());
    }

    match parts.as_slice() {
        ["tree"] => {
            require_get(&method)?;
            require_parity(&collector)?;
            inventory::tree(&collector, &query).await
        }
        ["workloads", id] => {
            require_get(&method)?;
            require_parity(&collector)?;
            inventory::workload(&collector, id).await
        }
        [collection] | [collection, _] => {
            let kind = collector
                .model()
                .by_path(collection)
                .ok_or_else(|| ApiError::not_found(format!("unknown collection {}", collection)))?;
            require_get(&method)?;
            require_parity(&collector)?;
            match parts.as_slice() {
                [_, id] => inventory::get(&collector, kind, id, &query).await,
                _ => inventory::list(&collector, kind, &query).await,
            }
        }
        _ => Err(ApiError::not_found(format!(
            "unknown path {}",
            segments.join("/")
        ))),
    }
}

fn require_parity(collector: &Collector) -> Result<(), ApiError> {
    if collector.has_parity() {
        Ok(())
    } else {
        Err(ApiError::not_ready(&collector.provider().uid))
    }
}

/// The cache is read-only.
fn require_get(method: &Method) -> Result<(), ApiError> {
    if method == Method::GET {
        Ok(())
    } else {
        Err(ApiError::new(
            Reason::Forbidden,
            format!("{} not allowed on cached inventory", method),
        ))
    }
}
