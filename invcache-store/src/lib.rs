//! Embedded per-provider inventory cache.
//!
//! One SQLite file per provider, one table per kind. Rows keep the
//! provider document verbatim next to a few indexed change-detection
//! columns. Committed changes are journaled to watches.

pub mod error;
pub mod journal;
pub mod predicate;
pub mod query;
pub mod resource;
pub mod schema;
pub mod store;

pub use error::{Result, StoreError};
pub use journal::{Action, Event, EventHandler, Watch, WatchError, WatchOptions};
pub use predicate::Predicate;
pub use query::{Detail, ListOptions, Page};
pub use resource::Resource;
pub use schema::{Column, ColumnType, DocumentError, KindSpec, Schema, Value};
pub use store::{Store, StoreOptions, Tx};
