//! REST API integration tests for invcache-api.
//!
//! Each test runs the inventory server and a fake provider service on
//! ephemeral ports.

mod common;

use common::{Lines, Sidecar, TestServer};
use serde_json::{Value, json};

fn vms() -> Value {
    json!([
        {"id": "vm-1", "name": "web", "cpus": 2, "powerState": "on", "path": "/dc/web",
         "disks": [{"id": "disk-1", "datastore": {"id": "ds-1"}}],
         "nics": [{"mac": "aa:bb", "network": {"id": "net-1"}}]},
        {"id": "vm-2", "name": "db", "cpus": 8, "powerState": "off", "path": "/dc/db",
         "concerns": [{"label": "shared disk"}]}
    ])
}

async fn sidecar() -> common::SidecarServer {
    let sidecar = Sidecar::default();
    sidecar.set("vms", vms());
    sidecar.set("networks", json!([{"id": "net-1", "name": "prod"}]));
    sidecar.set("storages", json!([{"id": "ds-1", "name": "fast", "capacity": 100}]));
    sidecar.set("disks", json!([{"id": "disk-1", "name": "root", "capacity": 10}]));
    sidecar.spawn().await
}

fn reason(response: &reqwest::Response) -> String {
    response
        .headers()
        .get("reason")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

// =============================================================================
// System & providers
// =============================================================================

#[tokio::test]
async fn test_get_version() {
    let server = TestServer::spawn().await;

    let response = server.get("/version").await;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert!(!body["version"].as_str().unwrap().is_empty());

    let response = server.get("/api-docs/openapi.json").await;
    assert_eq!(response.status(), 200);
    let doc: Value = response.json().await.unwrap();
    assert!(doc["paths"]["/providers"].is_object());

    server.shutdown().await;
}

#[tokio::test]
async fn test_provider_lifecycle() {
    let server = TestServer::spawn().await;
    let upstream = sidecar().await;

    let response = server
        .post_json(
            "/providers",
            &json!({"name": "lab", "type": "ova", "url": upstream.url()}),
        )
        .await;
    assert_eq!(response.status(), 201);
    let created: Value = response.json().await.unwrap();
    let uid = created["provider"]["uid"].as_str().unwrap().to_string();
    assert!(!uid.is_empty());

    let list: Value = server.get("/providers").await.json().await.unwrap();
    assert_eq!(list.as_array().unwrap().len(), 1);
    let by_type: Value = server.get("/providers/vsphere").await.json().await.unwrap();
    assert!(by_type.as_array().unwrap().is_empty());

    server.wait_for_parity("ova", &uid).await;
    let detail: Value = server
        .get(&format!("/providers/ova/{}", uid))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(detail["parity"], true);
    assert_eq!(detail["inventory"]["vms"], 2);

    let response = server.delete(&format!("/providers/ova/{}", uid)).await;
    assert_eq!(response.status(), 204);
    let response = server.get(&format!("/providers/ova/{}", uid)).await;
    assert_eq!(response.status(), 404);

    let response = server
        .post_json("/providers", &json!({"uid": "x", "name": "x", "type": "nope"}))
        .await;
    assert_eq!(response.status(), 400);
    assert_eq!(reason(&response), "BadRequest");

    server.shutdown().await;
    upstream.shutdown();
}

#[tokio::test]
async fn test_unknown_provider() {
    let server = TestServer::spawn().await;

    let response = server.get("/providers/ova/missing/vms").await;
    assert_eq!(response.status(), 404);
    assert_eq!(reason(&response), "UnknownProvider");
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["reason"], "UnknownProvider");
    assert!(body["error"].is_string());

    server.shutdown().await;
}

#[tokio::test]
async fn test_not_ready_before_parity() {
    let server = TestServer::spawn().await;
    // Nothing listens here, so the collector never loads.
    let dead = format!("http://127.0.0.1:{}", common::allocate_port());
    server.add_provider("ova", "p1", Some(&dead)).await;

    let response = server.get("/providers/ova/p1/vms").await;
    assert_eq!(response.status(), 503);
    assert_eq!(reason(&response), "NotReady");

    let response = server.get("/providers/ova/p1/vms?watch=1").await;
    assert_eq!(response.status(), 503);

    // Type segment must match the provider.
    let response = server.get("/providers/vsphere/p1/vms").await;
    assert_eq!(response.status(), 404);
    assert_eq!(reason(&response), "UnknownProvider");

    server.shutdown().await;
}

// =============================================================================
// Cached inventory
// =============================================================================

#[tokio::test]
async fn test_list_filters_and_detail() {
    let server = TestServer::spawn().await;
    let upstream = sidecar().await;
    server.add_provider("ova", "p1", Some(&upstream.url())).await;
    server.wait_for_parity("ova", "p1").await;

    let items: Value = server.get("/providers/ova/p1/vms").await.json().await.unwrap();
    let items = items.as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["id"], "vm-1");
    assert_eq!(items[0]["selfLink"], "/providers/ova/p1/vms/vm-1");
    assert_eq!(items[0]["revision"], 1);
    assert!(items[0].get("cpus").is_none());

    let items: Value = server
        .get("/providers/ova/p1/vms?detail=1&name=db")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(items[0]["cpus"], 8);
    assert_eq!(items[0]["power_state"], "off");
    assert!(items[0].get("object").is_none());

    let items: Value = server
        .get("/providers/ova/p1/vms?detail=max&search=we")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(items.as_array().unwrap().len(), 1);
    assert_eq!(items[0]["object"]["path"], "/dc/web");
    assert_eq!(items[0]["concerns"], json!([]));

    let items: Value = server
        .get("/providers/ova/p1/vms?path=/dc/d")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(items[0]["id"], "vm-2");

    let items: Value = server
        .get("/providers/ova/p1/vms?name=&search=")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(items.as_array().unwrap().len(), 2);

    let items: Value = server
        .get("/providers/ova/p1/vms?limit=1&offset=1")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(items.as_array().unwrap().len(), 1);
    assert_eq!(items[0]["id"], "vm-2");

    let response = server.get("/providers/ova/p1/vms?limit=-1").await;
    assert_eq!(response.status(), 400);
    assert_eq!(reason(&response), "BadRequest");

    let response = server.get("/providers/ova/p1/vms?detail=lots").await;
    assert_eq!(response.status(), 400);

    let response = server.get("/providers/ova/p1/hosts").await;
    assert_eq!(response.status(), 404);

    server.shutdown().await;
    upstream.shutdown();
}

#[tokio::test]
async fn test_get_by_id() {
    let server = TestServer::spawn().await;
    let upstream = sidecar().await;
    server.add_provider("ova", "p1", Some(&upstream.url())).await;
    server.wait_for_parity("ova", "p1").await;

    let response = server.get("/providers/ova/p1/vms/vm-2").await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["revision"], "1");
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["object"]["name"], "db");
    assert_eq!(body["concerns"][0]["label"], "shared disk");

    let response = server.get("/providers/ova/p1/vms/vm-9").await;
    assert_eq!(response.status(), 404);
    assert_eq!(reason(&response), "NotFound");

    let response = server.delete("/providers/ova/p1/vms/vm-2").await;
    assert_eq!(response.status(), 403);
    assert_eq!(reason(&response), "Forbidden");

    server.shutdown().await;
    upstream.shutdown();
}

#[tokio::test]
async fn test_refresh_applies_updates_and_deletes() {
    let server = TestServer::spawn().await;
    let upstream = sidecar().await;
    server.add_provider("ova", "p1", Some(&upstream.url())).await;
    server.wait_for_parity("ova", "p1").await;

    upstream.sidecar.set(
        "vms",
        json!([{"id": "vm-1", "name": "web", "cpus": 4, "powerState": "on"}]),
    );
    let response = server
        .post_json("/providers/ova/p1/refresh", &json!({}))
        .await;
    assert_eq!(response.status(), 200);

    let srv = &server;
    server
        .wait_until(move || async move {
            srv.get("/providers/ova/p1/vms/vm-2").await.status() == 404
        })
        .await;

    let response = server.get("/providers/ova/p1/vms/vm-1").await;
    assert_eq!(response.headers()["revision"], "2");
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["object"]["cpus"], 4);

    server.shutdown().await;
    upstream.shutdown();
}

#[tokio::test]
async fn test_tree_and_workload() {
    let server = TestServer::spawn().await;
    let upstream = sidecar().await;
    server.add_provider("ova", "p1", Some(&upstream.url())).await;
    server.wait_for_parity("ova", "p1").await;

    let tree: Value = server.get("/providers/ova/p1/tree").await.json().await.unwrap();
    assert_eq!(tree["kind"], "provider");
    assert_eq!(tree["id"], "p1");
    let children = tree["children"].as_array().unwrap();
    assert_eq!(children.len(), 2);
    assert_eq!(children[0]["kind"], "vm");

    let response = server.get("/providers/ova/p1/workloads/vm-1").await;
    assert_eq!(response.status(), 200);
    let workload: Value = response.json().await.unwrap();
    assert_eq!(workload["disks"][0]["disk"]["name"], "root");
    assert_eq!(workload["disks"][0]["storage"]["name"], "fast");
    assert_eq!(workload["nics"][0]["network"]["name"], "prod");
    assert_eq!(workload["networks"][0]["id"], "net-1");
    assert_eq!(workload["concerns"], json!([]));

    let response = server.get("/providers/ova/p1/workloads/vm-9").await;
    assert_eq!(response.status(), 404);

    server.shutdown().await;
    upstream.shutdown();
}

// =============================================================================
// Watches
// =============================================================================

#[tokio::test]
async fn test_watch_snapshot_then_live() {
    let server = TestServer::spawn().await;
    let upstream = sidecar().await;
    server.add_provider("ova", "p1", Some(&upstream.url())).await;
    server.wait_for_parity("ova", "p1").await;

    let response = server.get("/providers/ova/p1/vms?watch=1").await;
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"],
        "application/stream+json"
    );
    let mut lines = Lines::new(response);

    assert_eq!(lines.next().await.unwrap()["action"], "started");
    let first = lines.next().await.unwrap();
    assert_eq!(first["action"], "created");
    assert_eq!(first["resource"]["id"], "vm-1");
    assert_eq!(lines.next().await.unwrap()["action"], "created");
    assert_eq!(lines.next().await.unwrap()["action"], "parity");

    let mut changed = vms();
    changed[0]["cpus"] = json!(16);
    upstream.sidecar.set("vms", changed);
    server
        .post_json("/providers/ova/p1/refresh", &json!({}))
        .await;

    let update = lines.next().await.unwrap();
    assert_eq!(update["action"], "updated");
    assert_eq!(update["resource"]["object"]["cpus"], 16);
    assert_eq!(update["prior"]["object"]["cpus"], 2);
    assert_eq!(update["priorRevision"], 1);

    // Removing the provider ends the stream.
    server.delete("/providers/ova/p1").await;
    assert_eq!(lines.next().await.unwrap()["action"], "end");
    assert!(lines.next().await.is_none());

    server.shutdown().await;
    upstream.shutdown();
}

#[tokio::test]
async fn test_watch_live_only() {
    let server = TestServer::spawn().await;
    let upstream = sidecar().await;
    server.add_provider("ova", "p1", Some(&upstream.url())).await;
    server.wait_for_parity("ova", "p1").await;

    let response = server
        .client
        .get(format!("{}/providers/ova/p1/vms?watch=1", server.base_url()))
        .header("X-Watch-Options", "snapshot=false")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let mut lines = Lines::new(response);
    assert_eq!(lines.next().await.unwrap()["action"], "started");

    let mut more = vms();
    more.as_array_mut()
        .unwrap()
        .push(json!({"id": "vm-3", "name": "cache"}));
    upstream.sidecar.set("vms", more);
    server
        .post_json("/providers/ova/p1/refresh", &json!({}))
        .await;

    let created = lines.next_change().await.unwrap();
    assert_eq!(created["action"], "created");
    assert_eq!(created["resource"]["id"], "vm-3");

    server.shutdown().await;
    upstream.shutdown();
}

// =============================================================================
// Dynamic providers
// =============================================================================

#[tokio::test]
async fn test_dynamic_cached_paths_are_raw() {
    let server = TestServer::spawn().await;
    let upstream = sidecar().await;
    server.add_dynamic_type("acme", &upstream.url()).await;
    server.add_provider("acme", "d1", None).await;
    server.wait_for_parity("acme", "d1").await;

    let items: Value = server.get("/providers/acme/d1/vms").await.json().await.unwrap();
    assert_eq!(items, vms());

    let items: Value = server
        .get("/providers/acme/d1/vms?name=db")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(items, json!([vms()[1]]));

    // Empty filters are ignored.
    let items: Value = server
        .get("/providers/acme/d1/vms?id=&name=")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(items, vms());

    let items: Value = server
        .get("/providers/acme/d1/vms?id=&name=db")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(items, json!([vms()[1]]));

    let response = server.get("/providers/acme/d1/disks/disk-1").await;
    assert_eq!(response.status(), 200);
    let disk: Value = response.json().await.unwrap();
    assert_eq!(disk, json!({"id": "disk-1", "name": "root", "capacity": 10}));

    // Each cached read schedules a refresh.
    upstream.sidecar.set("vms", json!([]));
    server.get("/providers/acme/d1/vms").await;
    let srv = &server;
    server
        .wait_until(move || async move {
            let items: Value = srv
                .get("/providers/acme/d1/vms")
                .await
                .json()
                .await
                .unwrap();
            items == json!([])
        })
        .await;

    server.shutdown().await;
    upstream.shutdown();
}

#[tokio::test]
async fn test_dynamic_proxy() {
    let server = TestServer::spawn().await;
    let upstream = sidecar().await;
    server.add_dynamic_type("acme", &upstream.url()).await;
    server.add_provider("acme", "d1", None).await;

    let response = server.get("/providers/acme/d1/echo?page=2").await;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["name"], "d1-name");
    assert_eq!(body["namespace"], "mtv");
    assert_eq!(body["uid"], "d1");
    assert_eq!(body["query"], "page=2");

    server.shutdown().await;
    upstream.shutdown();
}

#[tokio::test]
async fn test_dynamic_proxy_unreachable() {
    let server = TestServer::spawn().await;
    let dead = format!("http://127.0.0.1:{}", common::allocate_port());
    server.add_dynamic_type("acme", &dead).await;
    server.add_provider("acme", "d1", None).await;

    let response = server.get("/providers/acme/d1/hosts").await;
    assert_eq!(response.status(), 502);
    assert_eq!(reason(&response), "Upstream");

    server.shutdown().await;
}

#[tokio::test]
async fn test_dynamic_type_endpoints() {
    let server = TestServer::spawn().await;
    let upstream = sidecar().await;
    server.add_dynamic_type("acme", &upstream.url()).await;

    let types: Value = server.get("/dynamic-types").await.json().await.unwrap();
    assert_eq!(types[0]["type"], "acme");
    assert_eq!(types[0]["healthCheckPath"], "/test_connection");

    let response = server
        .post_json(
            "/dynamic-types",
            &json!({"type": "vsphere", "serviceUrl": upstream.url()}),
        )
        .await;
    assert_eq!(response.status(), 400);

    let response = server
        .post_json(
            "/dynamic-types",
            &json!({"type": "bad", "serviceUrl": upstream.url(),
                    "columns": {"vm": [{"name": "drop table", "type": "text", "sources": ["x"]}]}}),
        )
        .await;
    assert_eq!(response.status(), 400);

    // A service that fails its health check is refused.
    let dead = format!("http://127.0.0.1:{}", common::allocate_port());
    let response = server
        .put_json(
            "/dynamic-types/acme/service-url",
            &json!({"serviceUrl": dead}),
        )
        .await;
    assert_eq!(response.status(), 502);
    let types: Value = server.get("/dynamic-types").await.json().await.unwrap();
    assert_eq!(types[0]["serviceUrl"], upstream.url());

    let response = server
        .put_json(
            "/dynamic-types/acme/service-url",
            &json!({"serviceUrl": upstream.url()}),
        )
        .await;
    tokio_test::assert_ok!(response.error_for_status());

    server.add_provider("acme", "d1", None).await;
    let response = server.delete("/dynamic-types/acme").await;
    assert_eq!(response.status(), 403);
    assert_eq!(reason(&response), "Forbidden");

    server.delete("/providers/acme/d1").await;
    let response = server.delete("/dynamic-types/acme").await;
    assert_eq!(response.status(), 204);
    let response = server.delete("/dynamic-types/acme").await;
    assert_eq!(response.status(), 404);

    server.shutdown().await;
    upstream.shutdown();
}
