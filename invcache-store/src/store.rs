use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::query::Query;
use sqlx::{Executor, Row, Sqlite, Transaction};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::journal::{Action, DEFAULT_QUEUE_SIZE, Event, EventHandler, Journal, Watch};
use crate::predicate::Predicate;
use crate::query::{Detail, ListOptions, Page};
use crate::resource::Resource;
use crate::schema::{ColumnType, KindSpec, Schema, Value, quote};

#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Discard any existing file before opening.
    pub truncate: bool,
    /// Per-watch queue capacity, in commit batches.
    pub watch_queue: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            truncate: false,
            watch_queue: DEFAULT_QUEUE_SIZE,
        }
    }
}

/// SQLite-backed cache of one provider's inventory.
///
/// Writes go through [`Tx`] and are serialized by a store-wide lock;
/// reads use the connection pool directly and never wait for writers.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    pool: SqlitePool,
    schema: Arc<Schema>,
    journal: Arc<Journal>,
    write: Arc<Mutex<()>>,
    closed: AtomicBool,
}

impl Store {
    pub async fn open(path: impl AsRef<Path>, schema: Schema, truncate: bool) -> Result<Self> {
        Self::open_with(
            path,
            schema,
            StoreOptions {
                truncate,
                ..Default::default()
            },
        )
        .await
    }

    pub async fn open_with(
        path: impl AsRef<Path>,
        schema: Schema,
        options: StoreOptions,
    ) -> Result<Self> {
        schema.validate()?;
        let path = path.as_ref().to_path_buf();
        if options.truncate {
            remove_files(&path).await?;
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let connect = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect)
            .await?;

        let store = Self {
            inner: Arc::new(Inner {
                path,
                pool,
                schema: Arc::new(schema),
                journal: Arc::new(Journal::new(options.watch_queue)),
                write: Arc::new(Mutex::new(())),
                closed: AtomicBool::new(false),
            }),
        };
        store.migrate().await?;
        debug!(path = %store.inner.path.display(), "Store opened");
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        for kind in &self.inner.schema.kinds {
            for statement in kind.ddl() {
                sqlx::query(&statement).execute(&self.inner.pool).await?;
            }
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Begin a write transaction. Only one is open per store at a time.
    pub async fn begin(&self) -> Result<Tx> {
        self.ensure_open()?;
        let guard = self.inner.write.clone().lock_owned().await;
        let tx = self.inner.pool.begin().await?;
        Ok(Tx {
            tx: Some(tx),
            schema: self.inner.schema.clone(),
            journal: self.inner.journal.clone(),
            staged: Vec::new(),
            _guard: guard,
        })
    }

    pub async fn get(&self, kind: &str, id: &str) -> Result<Resource> {
        self.ensure_open()?;
        let spec = self.inner.schema.kind(kind)?;
        select_one(&self.inner.pool, spec, id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("{} {}", kind, id)))
    }

    pub async fn list(&self, kind: &str, options: &ListOptions) -> Result<Vec<Resource>> {
        self.ensure_open()?;
        let spec = self.inner.schema.kind(kind)?;
        select(&self.inner.pool, spec, options).await
    }

    pub async fn count(&self, kind: &str, predicate: Option<&Predicate>) -> Result<u64> {
        self.ensure_open()?;
        let spec = self.inner.schema.kind(kind)?;
        let mut args = Vec::new();
        let condition = match predicate {
            None => Some("1".to_string()),
            Some(p) => p.to_sql(spec, &mut args),
        };
        match condition {
            Some(condition) => {
                let sql = format!(
                    "SELECT COUNT(*) AS n FROM {} WHERE {}",
                    quote(&spec.name),
                    condition
                );
                let row = bind(sqlx::query(&sql), &args)
                    .fetch_one(&self.inner.pool)
                    .await?;
                Ok(row.try_get::<i64, _>("n")?.max(0) as u64)
            }
            None => {
                let options = ListOptions {
                    detail: Detail::Full,
                    predicate: predicate.cloned(),
                    page: Page::default(),
                };
                Ok(select(&self.inner.pool, spec, &options).await?.len() as u64)
            }
        }
    }

    /// Register a handler for changes to `kind`.
    ///
    /// Unless the handler opts out, it first receives every existing row
    /// as `created`, then `parity`, then live changes. The snapshot is read
    /// under the write lock so no commit falls between snapshot and
    /// registration.
    pub async fn watch(&self, kind: &str, handler: Arc<dyn EventHandler>) -> Result<Watch> {
        self.ensure_open()?;
        let spec = self.inner.schema.kind(kind)?;
        let _guard = self.inner.write.lock().await;
        let snapshot = if handler.options().snapshot {
            select(&self.inner.pool, spec, &ListOptions::default()).await?
        } else {
            Vec::new()
        };
        self.inner
            .journal
            .start(kind, handler, snapshot)
            .ok_or(StoreError::Closed)
    }

    /// Number of live watches.
    pub fn watch_count(&self) -> usize {
        self.inner.journal.watch_count()
    }

    /// Drop and recreate every table. Live watches are ended.
    pub async fn reset(&self) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.inner.write.lock().await;
        self.inner.journal.end_all();
        for kind in &self.inner.schema.kinds {
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote(&kind.name)))
                .execute(&self.inner.pool)
                .await?;
        }
        self.migrate().await?;
        info!(path = %self.inner.path.display(), "Store reset");
        Ok(())
    }

    /// End all watches, wait for their handlers to see `end`, then close
    /// the pool; optionally delete the file. Closing twice is a no-op.
    pub async fn close(&self, remove: bool) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let _guard = self.inner.write.lock().await;
            self.inner.journal.close().await;
        }
        self.inner.pool.close().await;
        if remove {
            remove_files(&self.inner.path).await?;
        }
        debug!(path = %self.inner.path.display(), remove, "Store closed");
        Ok(())
    }
}

/// A write transaction. Changes become visible, and their events are
/// reported, on [`Tx::commit`]. Dropping without committing rolls back.
pub struct Tx {
    tx: Option<Transaction<'static, Sqlite>>,
    schema: Arc<Schema>,
    journal: Arc<Journal>,
    staged: Vec<Event>,
    _guard: OwnedMutexGuard<()>,
}

impl Tx {
    fn conn(&mut self) -> Result<&mut Transaction<'static, Sqlite>> {
        self.tx.as_mut().ok_or(StoreError::Closed)
    }

    pub async fn get(&mut self, kind: &str, id: &str) -> Result<Option<Resource>> {
        let schema = self.schema.clone();
        let spec = schema.kind(kind)?;
        select_one(&mut **self.conn()?, spec, id).await
    }

    pub async fn list(&mut self, kind: &str, options: &ListOptions) -> Result<Vec<Resource>> {
        let schema = self.schema.clone();
        let spec = schema.kind(kind)?;
        select(&mut **self.conn()?, spec, options).await
    }

    /// Insert a new row with revision 1.
    pub async fn insert(&mut self, mut resource: Resource) -> Result<Resource> {
        let schema = self.schema.clone();
        let spec = schema.kind(&resource.kind)?;
        resource.revision = 1;

        let mut names = vec!["id", "name", "revision", "object"]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>();
        names.extend(spec.columns.iter().map(|c| quote(&c.name)));
        let marks = vec!["?"; names.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote(&spec.name),
            names.join(", "),
            marks
        );
        let args = row_args(spec, &resource);
        let result = bind(sqlx::query(&sql), &args)
            .execute(&mut **self.conn()?)
            .await;
        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(StoreError::Conflict(format!(
                    "{} {}",
                    resource.kind, resource.id
                )));
            }
            Err(e) => return Err(e.into()),
        }

        self.staged
            .push(Event::new(Action::Created, resource.clone(), None));
        Ok(resource)
    }

    /// Replace an existing row, bumping its revision.
    pub async fn update(&mut self, mut resource: Resource) -> Result<Resource> {
        let prior = self
            .get(&resource.kind, &resource.id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("{} {}", resource.kind, resource.id)))?;
        let schema = self.schema.clone();
        let spec = schema.kind(&resource.kind)?;
        resource.revision = prior.revision + 1;

        let mut assignments = vec![
            "name = ?".to_string(),
            "revision = ?".to_string(),
            "object = ?".to_string(),
        ];
        assignments.extend(spec.columns.iter().map(|c| format!("{} = ?", quote(&c.name))));
        let sql = format!(
            "UPDATE {} SET {} WHERE id = ?",
            quote(&spec.name),
            assignments.join(", ")
        );
        let mut args = row_args(spec, &resource);
        let id = args.remove(0);
        args.push(id);
        bind(sqlx::query(&sql), &args)
            .execute(&mut **self.conn()?)
            .await?;

        self.staged
            .push(Event::new(Action::Updated, resource.clone(), Some(prior)));
        Ok(resource)
    }

    /// Delete a row, returning its last state.
    pub async fn delete(&mut self, kind: &str, id: &str) -> Result<Resource> {
        let prior = self
            .get(kind, id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("{} {}", kind, id)))?;
        let sql = format!("DELETE FROM {} WHERE id = ?", quote(kind));
        sqlx::query(&sql)
            .bind(id)
            .execute(&mut **self.conn()?)
            .await?;

        self.staged
            .push(Event::new(Action::Deleted, prior.clone(), None));
        Ok(prior)
    }

    /// Number of mutations staged so far.
    pub fn staged(&self) -> usize {
        self.staged.len()
    }

    /// Commit and report the staged events to watches.
    pub async fn commit(mut self) -> Result<()> {
        let tx = self.tx.take().ok_or(StoreError::Closed)?;
        tx.commit().await?;
        let events = std::mem::take(&mut self.staged);
        self.journal.report(events);
        Ok(())
    }

    /// Roll back. Nothing is reported.
    pub async fn end(mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}

fn row_args(spec: &KindSpec, resource: &Resource) -> Vec<Value> {
    let mut args = vec![
        Value::Text(resource.id.clone()),
        Value::Text(resource.name.clone()),
        Value::Int(resource.revision),
        Value::Text(resource.object.clone()),
    ];
    args.extend(
        spec.columns
            .iter()
            .map(|c| resource.columns.get(&c.name).cloned().unwrap_or(Value::Null)),
    );
    args
}

fn bind<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    args: &'q [Value],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for arg in args {
        query = match arg {
            Value::Null => query.bind(None::<i64>),
            Value::Bool(b) => query.bind(*b),
            Value::Int(i) => query.bind(*i),
            Value::Float(f) => query.bind(*f),
            Value::Text(s) => query.bind(s.as_str()),
        };
    }
    query
}

fn decode(spec: &KindSpec, row: &SqliteRow) -> Result<Resource> {
    let mut columns = std::collections::BTreeMap::new();
    for c in &spec.columns {
        let name = c.name.as_str();
        let value = match c.ty {
            ColumnType::Integer => row.try_get::<Option<i64>, _>(name)?.map(Value::Int),
            ColumnType::Bool => row.try_get::<Option<bool>, _>(name)?.map(Value::Bool),
            ColumnType::Text => row.try_get::<Option<String>, _>(name)?.map(Value::Text),
        };
        columns.insert(c.name.clone(), value.unwrap_or(Value::Null));
    }
    Ok(Resource {
        kind: spec.name.clone(),
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        revision: row.try_get("revision")?,
        object: row.try_get("object")?,
        columns,
    })
}

async fn select_one<'c, E>(executor: E, spec: &KindSpec, id: &str) -> Result<Option<Resource>>
where
    E: Executor<'c, Database = Sqlite>,
{
    let sql = format!(
        "SELECT {} FROM {} WHERE id = ?",
        spec.select_list(true),
        quote(&spec.name)
    );
    let row = sqlx::query(&sql).bind(id).fetch_optional(executor).await?;
    row.map(|r| decode(spec, &r)).transpose()
}

async fn select<'c, E>(executor: E, spec: &KindSpec, options: &ListOptions) -> Result<Vec<Resource>>
where
    E: Executor<'c, Database = Sqlite>,
{
    let mut args = Vec::new();
    let compiled = match &options.predicate {
        None => Some(None),
        Some(p) => p.to_sql(spec, &mut args).map(Some),
    };

    match compiled {
        Some(condition) => {
            let mut sql = format!(
                "SELECT {} FROM {}",
                spec.select_list(options.detail == Detail::Full),
                quote(&spec.name)
            );
            if let Some(condition) = condition {
                sql.push_str(&format!(" WHERE {}", condition));
            }
            sql.push_str(" ORDER BY id");
            if !options.page.is_unbounded() {
                sql.push_str(" LIMIT ? OFFSET ?");
                let limit = options
                    .page
                    .limit
                    .and_then(|l| i64::try_from(l).ok())
                    .unwrap_or(-1);
                args.push(Value::Int(limit));
                args.push(Value::Int(
                    i64::try_from(options.page.offset).unwrap_or(i64::MAX),
                ));
            }
            let rows = bind(sqlx::query(&sql), &args).fetch_all(executor).await?;
            rows.iter().map(|r| decode(spec, r)).collect()
        }
        None => {
            // Predicate reads the document: filter after decoding.
            let sql = format!(
                "SELECT {} FROM {} ORDER BY id",
                spec.select_list(true),
                quote(&spec.name)
            );
            let rows = sqlx::query(&sql).fetch_all(executor).await?;
            let predicate = options.predicate.as_ref();
            let mut matched = Vec::new();
            for row in &rows {
                let mut resource = decode(spec, row)?;
                let doc = match resource.document() {
                    Ok(doc) => doc,
                    Err(e) => {
                        debug!(kind = %spec.name, id = %resource.id, error = %e, "Skipping undecodable row");
                        continue;
                    }
                };
                if predicate.is_some_and(|p| !p.matches(&resource, Some(&doc))) {
                    continue;
                }
                if options.detail == Detail::Summary {
                    resource.object = "null".to_string();
                }
                matched.push(resource);
            }
            Ok(options.page.apply(matched))
        }
    }
}

async fn remove_files(path: &Path) -> Result<()> {
    let mut candidates = vec![path.to_path_buf()];
    for suffix in ["-wal", "-shm", "-journal"] {
        let mut name = path.as_os_str().to_owned();
        name.push(suffix);
        candidates.push(PathBuf::from(name));
    }
    for candidate in candidates {
        match tokio::fs::remove_file(&candidate).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
