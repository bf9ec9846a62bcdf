//! Snapshot reconciliation: bring one kind's table in line with a full
//! upstream listing.

use invcache_store::{ListOptions, Resource, Store, StoreError};
use serde::Serialize;
use serde_json::Value as Json;
use std::collections::BTreeMap;
use tracing::debug;
use utoipa::ToSchema;

use crate::registry::KindModel;

/// Row counts produced by one reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct Changes {
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        self.created == 0 && self.updated == 0 && self.deleted == 0
    }

    pub fn add(&mut self, other: Changes) {
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
    }
}

/// Apply a full listing of `kind` in one transaction.
///
/// Documents without a string `id`/`name` are skipped; a repeated id keeps
/// the last document. Rows whose document is unchanged are left alone,
/// changed rows are updated, and rows missing from the listing are deleted.
pub async fn apply(
    store: &Store,
    kind: &KindModel,
    documents: &[Json],
) -> Result<Changes, StoreError> {
    let name = kind.name();
    let mut desired: BTreeMap<String, Resource> = BTreeMap::new();
    for doc in documents {
        match kind.spec.resource(doc) {
            Ok(resource) => {
                desired.insert(resource.id.clone(), resource);
            }
            Err(e) => debug!(kind = name, error = %e, "Skipping upstream document"),
        }
    }

    let mut tx = store.begin().await?;
    let mut existing: BTreeMap<String, Resource> = tx
        .list(name, &ListOptions::default())
        .await?
        .into_iter()
        .map(|r| (r.id.clone(), r))
        .collect();

    let mut changes = Changes::default();
    for (id, want) in desired {
        match existing.remove(&id) {
            Some(have) => {
                if have.same_document(&want) {
                    continue;
                }
                let columns = have.changed_columns(&want);
                if !columns.is_empty() {
                    debug!(kind = name, id = %id, columns = ?columns, "Columns changed");
                }
                tx.update(want).await?;
                changes.updated += 1;
            }
            None => {
                tx.insert(want).await?;
                changes.created += 1;
            }
        }
    }
    for id in existing.keys() {
        tx.delete(name, id).await?;
        changes.deleted += 1;
    }

    if tx.staged() == 0 {
        tx.end().await?;
    } else {
        tx.commit().await?;
    }
    Ok(changes)
}
