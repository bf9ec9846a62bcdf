//! Watch streams: one JSON object per line over a long-lived response.
//!
//! ```text
//! {"action":"started","watch":7}
//! {"action":"created","id":12,"kind":"vm","resource":{...}}
//! {"action":"parity"}
//! {"action":"updated","id":13,"kind":"vm","resource":{...},"prior":{...},"priorRevision":1}
//! {"action":"error","error":"full queue"}
//! {"action":"end"}
//! ```

use async_trait::async_trait;
use axum::{
    body::{Body, Bytes},
    http::{HeaderMap, header::CONTENT_TYPE},
    response::Response,
};
use invcache_store::{Event, EventHandler, Resource, WatchError, WatchOptions};
use serde_json::{Value as Json, json};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use super::handlers::ApiError;
use super::inventory::{InventoryQuery, Level, provider_link, render};
use crate::collector::Collector;
use crate::registry::KindModel;

pub const CONTENT_TYPE_STREAM: &str = "application/stream+json";
pub const WATCH_OPTIONS_HEADER: &str = "x-watch-options";

/// Streams are closed after this long; clients reconnect.
const WATCH_LIFETIME: Duration = Duration::from_secs(280);
/// Lines buffered between the watch and the response body.
const STREAM_BUFFER: usize = 64;

/// `snapshot=false` in `X-Watch-Options` asks for live events only.
pub fn snapshot_requested(headers: &HeaderMap) -> bool {
    headers
        .get_all(WATCH_OPTIONS_HEADER)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|option| option.split_once('='))
        .filter(|(key, _)| key.trim().eq_ignore_ascii_case("snapshot"))
        .last()
        .map(|(_, value)| !matches!(value.trim(), "false" | "0" | "no"))
        .unwrap_or(true)
}

struct StreamHandler {
    tx: mpsc::Sender<Bytes>,
    snapshot: bool,
    /// Collection link, e.g. `/providers/vsphere/u1/vms`.
    link: String,
    level: Level,
    /// Send stored documents as is instead of rendered resources.
    raw: bool,
}

impl StreamHandler {
    fn resource(&self, resource: &Resource) -> Option<Json> {
        if self.raw {
            resource.document().ok()
        } else {
            render(
                resource,
                self.level,
                &format!("{}/{}", self.link, resource.id),
            )
        }
    }

    async fn send(&self, line: Json) {
        let mut bytes = line.to_string().into_bytes();
        bytes.push(b'\n');
        // A closed channel means the client went away; the watch is ended
        // when the response body is dropped.
        let _ = self.tx.send(Bytes::from(bytes)).await;
    }

    async fn change(&self, action: &str, event: &Event) {
        let Some(resource) = self.resource(&event.resource) else {
            debug!(kind = %event.kind, id = %event.resource.id, "Skipping undecodable event");
            return;
        };
        let mut line = json!({
            "action": action,
            "id": event.id,
            "kind": event.kind,
            "resource": resource,
        });
        if let Some(prior) = event.prior.as_ref().and_then(|p| self.resource(p)) {
            line["prior"] = prior;
        }
        if let Some(revision) = event.prior_revision() {
            line["priorRevision"] = json!(revision);
        }
        self.send(line).await;
    }
}

#[async_trait]
impl EventHandler for StreamHandler {
    fn options(&self) -> WatchOptions {
        WatchOptions {
            snapshot: self.snapshot,
        }
    }

    async fn started(&self, watch: u64) {
        self.send(json!({"action": "started", "watch": watch})).await;
    }

    async fn parity(&self) {
        self.send(json!({"action": "parity"})).await;
    }

    async fn created(&self, event: &Event) {
        self.change("created", event).await;
    }

    async fn updated(&self, event: &Event) {
        self.change("updated", event).await;
    }

    async fn deleted(&self, event: &Event) {
        self.change("deleted", event).await;
    }

    async fn error(&self, error: &WatchError) {
        self.send(json!({"action": "error", "error": error.to_string()}))
            .await;
    }

    async fn end(&self) {
        self.send(json!({"action": "end"})).await;
    }
}

/// `GET …/<kind>?watch`
pub async fn serve(
    collector: &Collector,
    kind: &KindModel,
    query: &InventoryQuery,
    headers: &HeaderMap,
    raw: bool,
) -> Result<Response, ApiError> {
    let snapshot = snapshot_requested(headers);
    if snapshot && !collector.has_parity() {
        return Err(ApiError::not_ready(&collector.provider().uid));
    }
    let level = query.level(Level::Full)?;

    let (tx, mut rx) = mpsc::channel::<Bytes>(STREAM_BUFFER);
    let handler = Arc::new(StreamHandler {
        tx,
        snapshot,
        link: format!("{}/{}", provider_link(collector), kind.path),
        level,
        raw,
    });
    let watch = collector.store().watch(kind.name(), handler).await?;
    debug!(
        uid = %collector.provider().uid,
        kind = %kind.name(),
        watch = watch.id(),
        snapshot,
        "Watch stream opened"
    );

    let stream = async_stream::stream! {
        // Dropping the stream ends the watch.
        let _watch = watch;
        let deadline = tokio::time::sleep(WATCH_LIFETIME);
        tokio::pin!(deadline);
        loop {
            let line = tokio::select! {
                line = rx.recv() => line,
                _ = &mut deadline => None,
            };
            match line {
                Some(line) => yield Ok::<_, Infallible>(line),
                None => break,
            }
        }
    };

    Response::builder()
        .header(CONTENT_TYPE, CONTENT_TYPE_STREAM)
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_snapshot_requested() {
        let mut headers = HeaderMap::new();
        assert!(snapshot_requested(&headers));

        headers.insert(WATCH_OPTIONS_HEADER, HeaderValue::from_static("snapshot=false"));
        assert!(!snapshot_requested(&headers));

        headers.insert(
            WATCH_OPTIONS_HEADER,
            HeaderValue::from_static("foo=bar, snapshot=true"),
        );
        assert!(snapshot_requested(&headers));
    }
}
