//! Cached inventory reads: list, get, tree and workload views.

use axum::{
    Json,
    http::{HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
};
use invcache_store::{Detail, ListOptions, Page, Predicate, Resource, Store, StoreError};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use super::handlers::ApiError;
use crate::collector::Collector;
use crate::registry::{KindModel, Role};

/// How much of each resource a response carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    /// `id`, `name`, `selfLink`, `revision`.
    Summary,
    /// Summary plus change-detection columns.
    Columns,
    /// Columns plus `object` and `concerns`.
    Full,
}

impl Level {
    pub fn parse(raw: Option<&str>, default: Level) -> Result<Level, ApiError> {
        match raw {
            None | Some("") => Ok(default),
            Some("0") => Ok(Level::Summary),
            Some("1") => Ok(Level::Columns),
            Some("max") | Some("all") => Ok(Level::Full),
            Some(n) => match n.parse::<u32>() {
                Ok(n) if n >= 2 => Ok(Level::Full),
                _ => Err(ApiError::bad_request(format!("invalid detail: {}", n))),
            },
        }
    }
}

/// Query parameters of collection and view routes.
#[derive(Debug, Default, Deserialize)]
pub struct InventoryQuery {
    pub id: Option<String>,
    pub name: Option<String>,
    pub search: Option<String>,
    pub path: Option<String>,
    pub limit: Option<String>,
    pub offset: Option<String>,
    pub detail: Option<String>,
    pub watch: Option<String>,
}

impl InventoryQuery {
    pub fn is_watch(&self) -> bool {
        matches!(self.watch.as_deref(), Some(v) if v != "0" && v != "false")
    }

    pub fn level(&self, default: Level) -> Result<Level, ApiError> {
        Level::parse(self.detail.as_deref(), default)
    }

    pub fn page(&self) -> Result<Page, ApiError> {
        let number = |name: &str, raw: &Option<String>| -> Result<Option<u64>, ApiError> {
            raw.as_deref()
                .map(|v| {
                    v.parse::<u64>().map_err(|_| {
                        ApiError::bad_request(format!("{} must be a non-negative integer", name))
                    })
                })
                .transpose()
        };
        let limit = number("limit", &self.limit)?;
        let offset = number("offset", &self.offset)?.unwrap_or(0);
        Ok(Page::new(limit, offset))
    }

    /// Filters from `id`, `name`, `search` and `path`. Empty values are
    /// ignored.
    pub fn predicate(&self) -> Option<Predicate> {
        let mut all = self.identity();
        if let Some(search) = non_empty(&self.search) {
            all.push(Predicate::contains("name", search));
        }
        if let Some(path) = non_empty(&self.path) {
            all.push(Predicate::prefix("path", path));
        }
        Predicate::all(all)
    }

    /// Exact `id` and `name` filters.
    fn identity(&self) -> Vec<Predicate> {
        let mut all = Vec::new();
        if let Some(id) = non_empty(&self.id) {
            all.push(Predicate::eq("id", id));
        }
        if let Some(name) = non_empty(&self.name) {
            all.push(Predicate::eq("name", name));
        }
        all
    }
}

fn non_empty(raw: &Option<String>) -> Option<&str> {
    raw.as_deref().filter(|v| !v.is_empty())
}

/// `selfLink` base for a provider: `/providers/{type}/{uid}`.
pub fn provider_link(collector: &Collector) -> String {
    format!(
        "/providers/{}/{}",
        collector.provider().provider_type,
        collector.provider().uid
    )
}

pub fn self_link(collector: &Collector, kind: &KindModel, id: &str) -> String {
    format!("{}/{}/{}", provider_link(collector), kind.path, id)
}

/// Render a resource at `level`. `None` when the stored document cannot be
/// decoded.
pub fn render(resource: &Resource, level: Level, self_link: &str) -> Option<Value> {
    let mut out = Map::new();
    out.insert("id".into(), Value::String(resource.id.clone()));
    out.insert("name".into(), Value::String(resource.name.clone()));
    out.insert("selfLink".into(), Value::String(self_link.to_string()));
    out.insert("revision".into(), json!(resource.revision));
    if level >= Level::Columns {
        for (name, value) in &resource.columns {
            out.insert(name.clone(), serde_json::to_value(value).unwrap_or(Value::Null));
        }
    }
    if level == Level::Full {
        let doc = match resource.document() {
            Ok(doc) => doc,
            Err(e) => {
                debug!(kind = %resource.kind, id = %resource.id, "Skipping undecodable row: {}", e);
                return None;
            }
        };
        out.insert("concerns".into(), concerns(&doc));
        out.insert("object".into(), doc);
    }
    Some(Value::Object(out))
}

fn concerns(doc: &Value) -> Value {
    doc.get("concerns").cloned().unwrap_or_else(|| json!([]))
}

fn store_detail(level: Level) -> Detail {
    if level == Level::Full {
        Detail::Full
    } else {
        Detail::Summary
    }
}

fn with_revision(body: Value, revision: i64) -> Response {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&revision.to_string()) {
        headers.insert("revision", value);
    }
    (headers, Json(body)).into_response()
}

/// `GET …/<kind>`
pub async fn list(
    collector: &Collector,
    kind: &KindModel,
    query: &InventoryQuery,
) -> Result<Response, ApiError> {
    let level = query.level(Level::Summary)?;
    let mut options = ListOptions::new()
        .detail(store_detail(level))
        .page(query.page()?);
    if let Some(predicate) = query.predicate() {
        options = options.predicate(predicate);
    }
    let rows = collector.store().list(kind.name(), &options).await?;
    let items: Vec<Value> = rows
        .iter()
        .filter_map(|r| render(r, level, &self_link(collector, kind, &r.id)))
        .collect();
    Ok(Json(items).into_response())
}

/// `GET …/<kind>/<id>`
pub async fn get(
    collector: &Collector,
    kind: &KindModel,
    id: &str,
    query: &InventoryQuery,
) -> Result<Response, ApiError> {
    let level = query.level(Level::Full)?;
    let resource = collector.store().get(kind.name(), id).await?;
    let body = render(&resource, level, &self_link(collector, kind, id))
        .ok_or_else(|| ApiError::internal(format!("{} {} is corrupt", kind.name(), id)))?;
    Ok(with_revision(body, resource.revision))
}

/// Raw upstream-shaped documents, filtered by `id` and `name`.
pub async fn list_raw(
    collector: &Collector,
    kind: &KindModel,
    query: &InventoryQuery,
) -> Result<Response, ApiError> {
    let mut options = ListOptions::new();
    if let Some(predicate) = Predicate::all(query.identity()) {
        options = options.predicate(predicate);
    }
    let rows = collector.store().list(kind.name(), &options).await?;
    let docs: Vec<Value> = rows
        .iter()
        .filter_map(|r| match r.document() {
            Ok(doc) => Some(doc),
            Err(e) => {
                debug!(kind = %r.kind, id = %r.id, "Skipping undecodable row: {}", e);
                None
            }
        })
        .collect();
    Ok(Json(docs).into_response())
}

/// Raw upstream-shaped document by id.
pub async fn get_raw(
    collector: &Collector,
    kind: &KindModel,
    id: &str,
) -> Result<Response, ApiError> {
    let resource = collector.store().get(kind.name(), id).await?;
    let doc = resource
        .document()
        .map_err(|e| ApiError::internal(format!("{} {}: {}", kind.name(), id, e)))?;
    Ok(with_revision(doc, resource.revision))
}

// === Tree ===

struct Entry<'a> {
    kind: &'a KindModel,
    resource: Resource,
}

/// `GET …/tree`
///
/// Kinds flagged for the tree hang under their parent kind; rows whose
/// parent is not cached hang under the provider node.
pub async fn tree(collector: &Collector, query: &InventoryQuery) -> Result<Response, ApiError> {
    let level = query.level(Level::Summary)?;
    let store = collector.store();
    let kinds: Vec<&KindModel> = collector.model().kinds.iter().filter(|k| k.tree).collect();

    let mut loaded: HashMap<(String, String), Entry> = HashMap::new();
    let mut order: Vec<(String, String)> = Vec::new();
    for kind in &kinds {
        for resource in store.list(kind.name(), &ListOptions::new()).await? {
            let key = (kind.name().to_string(), resource.id.clone());
            order.push(key.clone());
            loaded.insert(key, Entry { kind, resource });
        }
    }

    let mut children: HashMap<(String, String), Vec<(String, String)>> = HashMap::new();
    let mut roots = Vec::new();
    for key in &order {
        let Some(entry) = loaded.get(key) else { continue };
        let parent = entry.kind.parent.as_ref().and_then(|p| {
            let doc = entry.resource.document().ok()?;
            Some((p.kind.clone(), p.resolve(&doc)?))
        });
        match parent {
            Some(parent) if loaded.contains_key(&parent) => {
                children.entry(parent).or_default().push(key.clone())
            }
            _ => roots.push(key.clone()),
        }
    }

    let mut visited = HashSet::new();
    let nodes: Vec<Value> = roots
        .iter()
        .filter_map(|key| node(collector, key, level, &loaded, &children, &mut visited))
        .collect();
    let root = json!({
        "kind": "provider",
        "id": collector.provider().uid,
        "name": collector.provider().name,
        "selfLink": provider_link(collector),
        "children": nodes,
    });
    Ok(Json(root).into_response())
}

fn node(
    collector: &Collector,
    key: &(String, String),
    level: Level,
    loaded: &HashMap<(String, String), Entry>,
    children: &HashMap<(String, String), Vec<(String, String)>>,
    visited: &mut HashSet<(String, String)>,
) -> Option<Value> {
    if !visited.insert(key.clone()) {
        return None;
    }
    let entry = loaded.get(key)?;
    let link = self_link(collector, entry.kind, &entry.resource.id);
    let mut rendered = render(&entry.resource, level, &link)?;
    let kids: Vec<Value> = children
        .get(key)
        .map(|keys| {
            keys.iter()
                .filter_map(|k| node(collector, k, level, loaded, children, visited))
                .collect()
        })
        .unwrap_or_default();
    if let Value::Object(map) = &mut rendered {
        map.insert("kind".into(), Value::String(entry.kind.name().to_string()));
        map.insert("children".into(), Value::Array(kids));
    }
    Some(rendered)
}

// === Workloads ===

/// Id referenced by a document field: a string, or an object with `id`.
fn reference(value: Option<&Value>) -> Option<&str> {
    match value? {
        Value::String(id) => Some(id),
        Value::Object(map) => map.get("id").and_then(Value::as_str),
        _ => None,
    }
}

async fn lookup(store: &Store, kind: Option<&KindModel>, id: &str) -> Option<Value> {
    let kind = kind?;
    match store.get(kind.name(), id).await {
        Ok(resource) => resource.document().ok(),
        Err(StoreError::NotFound(_)) => None,
        Err(e) => {
            debug!(kind = %kind.name(), id, "Reference lookup failed: {}", e);
            None
        }
    }
}

/// `GET …/workloads/<id>`: a VM with its disks, NICs and networks resolved
/// against the cache.
pub async fn workload(collector: &Collector, id: &str) -> Result<Response, ApiError> {
    let model = collector.model();
    let vm = model
        .by_role(Role::Workload)
        .ok_or_else(|| ApiError::not_found("provider has no workload kind"))?;
    let disk_kind = model.by_role(Role::Disk);
    let storage_kind = model.by_role(Role::Storage);
    let network_kind = model.by_role(Role::Network);
    let store = collector.store();

    let resource = store.get(vm.name(), id).await?;
    let doc = resource
        .document()
        .map_err(|e| ApiError::internal(format!("{} {}: {}", vm.name(), id, e)))?;

    let mut disks = Vec::new();
    for entry in doc.get("disks").and_then(Value::as_array).into_iter().flatten() {
        let mut disk = entry.clone();
        if let Value::Object(map) = &mut disk {
            if let Some(ref_id) = reference(Some(entry)) {
                if let Some(found) = lookup(store, disk_kind, ref_id).await {
                    map.insert("disk".into(), found);
                }
            }
            let storage_ref = ["datastore", "storage", "storageDomain"]
                .iter()
                .find_map(|field| reference(entry.get(*field)));
            if let Some(storage_id) = storage_ref {
                if let Some(found) = lookup(store, storage_kind, storage_id).await {
                    map.insert("storage".into(), found);
                }
            }
        }
        disks.push(disk);
    }

    let mut nics = Vec::new();
    let mut network_ids: Vec<String> = Vec::new();
    for entry in doc.get("nics").and_then(Value::as_array).into_iter().flatten() {
        let mut nic = entry.clone();
        if let (Value::Object(map), Some(network_id)) = (&mut nic, reference(entry.get("network")))
        {
            if !network_ids.iter().any(|n| n == network_id) {
                network_ids.push(network_id.to_string());
            }
            if let Some(found) = lookup(store, network_kind, network_id).await {
                map.insert("network".into(), found);
            }
        }
        nics.push(nic);
    }
    for entry in doc.get("networks").and_then(Value::as_array).into_iter().flatten() {
        if let Some(network_id) = reference(Some(entry)) {
            if !network_ids.iter().any(|n| n == network_id) {
                network_ids.push(network_id.to_string());
            }
        }
    }
    let mut networks = Vec::new();
    for network_id in &network_ids {
        if let Some(found) = lookup(store, network_kind, network_id).await {
            networks.push(found);
        }
    }

    let body = json!({
        "id": resource.id,
        "name": resource.name,
        "revision": resource.revision,
        "selfLink": format!("{}/workloads/{}", provider_link(collector), resource.id),
        "concerns": concerns(&doc),
        "disks": disks,
        "nics": nics,
        "networks": networks,
        "object": doc,
    });
    Ok(with_revision(body, resource.revision))
}
