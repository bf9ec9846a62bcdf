//! Model registry: which kinds each provider type caches and how.

use invcache_store::{Column, KindSpec, Schema};
use serde::Serialize;
use serde_json::Value as Json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// What a kind means to the workload and tree views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Workload,
    Network,
    Storage,
    Disk,
    Other,
}

/// Containment of a kind inside another for the inventory tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Parent {
    pub kind: String,
    /// Document path holding the parent id, or an object with an `id`.
    pub reference: String,
}

impl Parent {
    fn new(kind: &str, reference: &str) -> Self {
        Self {
            kind: kind.to_string(),
            reference: reference.to_string(),
        }
    }

    /// Parent id referenced by a document.
    pub fn resolve(&self, doc: &Json) -> Option<String> {
        match invcache_store::schema::lookup(doc, &self.reference)? {
            Json::String(id) => Some(id.clone()),
            Json::Object(map) => map.get("id").and_then(Json::as_str).map(String::from),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KindModel {
    pub spec: KindSpec,
    /// Collection segment in REST paths, e.g. `vms`.
    pub path: String,
    pub role: Role,
    /// Hot kinds get a logging watch at parity.
    pub watch: bool,
    /// Shown in the inventory tree.
    pub tree: bool,
    pub parent: Option<Parent>,
}

impl KindModel {
    fn new(name: &str, path: &str, role: Role, columns: Vec<Column>) -> Self {
        Self {
            spec: KindSpec::new(name, columns),
            path: path.to_string(),
            role,
            watch: role != Role::Other,
            tree: false,
            parent: None,
        }
    }

    fn in_tree(mut self) -> Self {
        self.tree = true;
        self
    }

    fn under(mut self, kind: &str, reference: &str) -> Self {
        self.tree = true;
        self.parent = Some(Parent::new(kind, reference));
        self
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }
}

/// All kinds of one provider type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderModel {
    pub provider_type: String,
    pub kinds: Vec<KindModel>,
}

impl ProviderModel {
    pub fn new(provider_type: &str, kinds: Vec<KindModel>) -> Self {
        Self {
            provider_type: provider_type.to_string(),
            kinds,
        }
    }

    /// Store layout for a provider of this type.
    pub fn schema(&self) -> Schema {
        Schema::new(self.kinds.iter().map(|k| k.spec.clone()).collect())
    }

    pub fn kind(&self, name: &str) -> Option<&KindModel> {
        self.kinds.iter().find(|k| k.spec.name == name)
    }

    pub fn by_path(&self, path: &str) -> Option<&KindModel> {
        self.kinds.iter().find(|k| k.path == path)
    }

    pub fn by_role(&self, role: Role) -> Option<&KindModel> {
        self.kinds.iter().find(|k| k.role == role)
    }

    /// Standard layout used by sidecar and dynamic providers:
    /// `vms`, `networks`, `storages`, `disks`.
    pub fn standard(provider_type: &str) -> Self {
        Self::new(
            provider_type,
            vec![
                vm("vm", "vms").in_tree(),
                KindModel::new("network", "networks", Role::Network, vec![]),
                KindModel::new("storage", "storages", Role::Storage, storage_columns()),
                KindModel::new("disk", "disks", Role::Disk, disk_columns()),
            ],
        )
    }

    /// Standard layout plus extra change-detection columns per kind.
    pub fn dynamic(provider_type: &str, extra: &BTreeMap<String, Vec<Column>>) -> Self {
        let mut model = Self::standard(provider_type);
        for kind in &mut model.kinds {
            if let Some(columns) = extra.get(&kind.spec.name) {
                for column in columns {
                    if kind.spec.column(&column.name).is_none() {
                        kind.spec.columns.push(column.clone());
                    }
                }
            }
        }
        model
    }
}

fn vm(name: &str, path: &str) -> KindModel {
    KindModel::new(
        name,
        path,
        Role::Workload,
        vec![
            Column::integer("cpus", &["cpus", "cpuCount"]),
            Column::integer("memory", &["memory", "memoryMB"]),
            Column::text("power_state", &["powerState"]),
        ],
    )
}

fn storage_columns() -> Vec<Column> {
    vec![Column::integer("capacity", &["capacity"])]
}

fn disk_columns() -> Vec<Column> {
    vec![
        Column::integer("capacity", &["capacity", "provisionedSize", "size"]),
        Column::boolean("shared", &["shared"]),
    ]
}

fn vsphere() -> ProviderModel {
    ProviderModel::new(
        "vsphere",
        vec![
            KindModel::new("datacenter", "datacenters", Role::Other, vec![]).in_tree(),
            KindModel::new("cluster", "clusters", Role::Other, vec![])
                .under("datacenter", "datacenter"),
            KindModel::new("host", "hosts", Role::Other, vec![]).under("cluster", "cluster"),
            vm("vm", "vms").under("host", "host"),
            KindModel::new("network", "networks", Role::Network, vec![]),
            KindModel::new("datastore", "datastores", Role::Storage, storage_columns()),
        ],
    )
}

fn ovirt() -> ProviderModel {
    ProviderModel::new(
        "ovirt",
        vec![
            KindModel::new("datacenter", "datacenters", Role::Other, vec![]).in_tree(),
            KindModel::new("cluster", "clusters", Role::Other, vec![])
                .under("datacenter", "dataCenter"),
            KindModel::new("host", "hosts", Role::Other, vec![]).under("cluster", "cluster"),
            vm("vm", "vms").under("cluster", "cluster"),
            KindModel::new("network", "networks", Role::Network, vec![]),
            KindModel::new(
                "storagedomain",
                "storagedomains",
                Role::Storage,
                storage_columns(),
            ),
            KindModel::new("disk", "disks", Role::Disk, disk_columns()),
        ],
    )
}

fn openstack() -> ProviderModel {
    ProviderModel::new(
        "openstack",
        vec![
            KindModel::new("project", "projects", Role::Other, vec![]).in_tree(),
            vm("vm", "vms").under("project", "tenantID"),
            KindModel::new("network", "networks", Role::Network, vec![]),
            KindModel::new("volumetype", "volumetypes", Role::Storage, vec![]),
            KindModel::new("volume", "volumes", Role::Disk, disk_columns()),
        ],
    )
}

fn openshift() -> ProviderModel {
    ProviderModel::new(
        "openshift",
        vec![
            KindModel::new("namespace", "namespaces", Role::Other, vec![]).in_tree(),
            vm("vm", "vms").under("namespace", "namespace"),
            KindModel::new(
                "networkattachmentdefinition",
                "networkattachmentdefinitions",
                Role::Network,
                vec![],
            ),
            KindModel::new("storageclass", "storageclasses", Role::Storage, vec![]),
        ],
    )
}

/// Provider type → model. Built-in types are registered up front; dynamic
/// types are resolved through the provider registry instead.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    models: HashMap<String, Arc<ProviderModel>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for model in [
            vsphere(),
            ovirt(),
            openstack(),
            openshift(),
            ProviderModel::standard("ova"),
            ProviderModel::standard("hyperv"),
            ProviderModel::standard("ec2"),
        ] {
            registry.register(model);
        }
        registry
    }

    pub fn register(&mut self, model: ProviderModel) {
        self.models
            .insert(model.provider_type.clone(), Arc::new(model));
    }

    pub fn get(&self, provider_type: &str) -> Option<Arc<ProviderModel>> {
        self.models.get(provider_type).cloned()
    }

    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.models.keys().cloned().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtin_schemas_are_valid() {
        let registry = ModelRegistry::builtin();
        for t in registry.types() {
            let model = registry.get(&t).unwrap();
            model.schema().validate().unwrap();
            assert!(model.by_role(Role::Workload).is_some(), "{} has no vms", t);
        }
    }

    #[test]
    fn test_standard_paths() {
        let model = ProviderModel::standard("ova");
        for path in ["vms", "networks", "storages", "disks"] {
            assert!(model.by_path(path).is_some());
        }
        assert_eq!(model.by_path("vms").unwrap().name(), "vm");
        assert!(model.by_path("hosts").is_none());
    }

    #[test]
    fn test_dynamic_extra_columns() {
        let mut extra = BTreeMap::new();
        extra.insert(
            "vm".to_string(),
            vec![
                Column::text("firmware", &["firmware"]),
                Column::integer("cpus", &["other"]),
            ],
        );
        let model = ProviderModel::dynamic("acme", &extra);
        let vm = model.kind("vm").unwrap();
        assert!(vm.spec.column("firmware").is_some());
        // Existing columns are not redefined.
        assert_eq!(vm.spec.column("cpus").unwrap().sources, ["cpus", "cpuCount"]);
        model.schema().validate().unwrap();
    }

    #[test]
    fn test_parent_resolve() {
        let p = Parent::new("host", "host");
        assert_eq!(p.resolve(&json!({"host": "h1"})), Some("h1".into()));
        assert_eq!(p.resolve(&json!({"host": {"id": "h2"}})), Some("h2".into()));
        assert_eq!(p.resolve(&json!({"host": 3})), None);
        assert_eq!(p.resolve(&json!({})), None);
    }
}
