//! Document collection abstraction.
//!
//! The queue engine talks to its backing store only through [`Collection`].
//! Every method is a single round trip, and each single-document write is
//! atomic. Nothing here spans multiple documents in a transaction.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{
    IndexSpec, NewTask, Selector, SortSpec, TaskDocument, UpdateOutcome, UpsertResult,
};

pub use memory::MemoryCollection;
pub use postgres::{ConnectOptions, Db, PgCollection};

/// A named collection of task documents.
#[async_trait]
pub trait Collection: Send + Sync {
    /// Collection (table) name.
    fn name(&self) -> &str;

    /// Create the backing storage if it does not exist yet.
    async fn ensure(&self) -> Result<()>;

    /// Store a new document, assigning its id.
    async fn insert_one(&self, task: NewTask) -> Result<TaskDocument>;

    /// Oldest document matching `selector`.
    async fn find_one(&self, selector: &Selector) -> Result<Option<TaskDocument>>;

    /// Up to `limit` matching documents in `sort` order.
    async fn find(
        &self,
        selector: &Selector,
        sort: &SortSpec,
        limit: usize,
    ) -> Result<Vec<TaskDocument>>;

    async fn count(&self, selector: &Selector) -> Result<u64>;

    /// Set `finished_at` on every matching document.
    async fn set_finished(&self, selector: &Selector, at: DateTime<Utc>) -> Result<UpdateOutcome>;

    /// Remove every matching document, returning how many went.
    async fn delete_many(&self, selector: &Selector) -> Result<u64>;

    /// Replace payload and priority of documents whose `payload[key]` equals
    /// the new task's, or insert the task when none does.
    async fn upsert_by_payload_key(&self, key: &str, task: NewTask) -> Result<UpsertResult>;

    /// Create an index if it does not exist; returns its name.
    async fn create_index(&self, index: &IndexSpec) -> Result<String>;
}
