//! Queue engine. The public API for submitting and consuming tasks.
//!
//! One generic engine serves every queue type; what differs between types
//! (collection, schema, sort, indexes) is a [`QueueConfig`] value. The engine
//! holds no locks and starts no background work: every call is a single
//! round trip to the collection (or a loop of independent ones for
//! `put_bulk`), and every failure is returned to the caller.
//!
//! `get` is a read-only peek. Nothing is claimed, so concurrent consumers can
//! receive the same pending task; delivery is at-least-once.

pub mod index;

use std::future::Future;
use std::time::Instant;

use serde_json::Value;
use tracing::{Instrument, Span};

use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::model::{
    self, BulkOutcome, DeleteOutcome, NewTask, PutOutcome, Selector, SortSpec, TaskDocument,
    TaskId, UpdateOutcome, UpsertResult,
};
use crate::schema::{FieldError, Payload, Schema, ValidationErrors};
use crate::store::{Collection, MemoryCollection};
use crate::telemetry::metrics::{self, queue_label};
use crate::telemetry::queue::{finish_operation, record_result, start_operation_span};
use opentelemetry::KeyValue;

pub use index::IndexManager;

/// A priority task queue over one collection.
pub struct Queue<C> {
    collection: C,
    config: QueueConfig,
}

impl Queue<MemoryCollection> {
    /// Queue backed by a fresh in-memory collection (for testing).
    pub fn in_memory(config: QueueConfig) -> Self {
        let collection = MemoryCollection::new(config.name.clone());
        Self::new(collection, config)
    }
}

impl<C: Collection> Queue<C> {
    pub fn new(collection: C, config: QueueConfig) -> Self {
        Self { collection, config }
    }

    pub fn name(&self) -> &str {
        self.collection.name()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn schema(&self) -> &Schema {
        &self.config.schema
    }

    pub fn collection(&self) -> &C {
        &self.collection
    }

    pub fn sort_spec(&self) -> &SortSpec {
        &self.config.sort
    }

    /// Change the retrieval order for subsequent `get` calls.
    pub fn set_sort(&mut self, sort: SortSpec) {
        self.config.sort = sort;
    }

    pub fn with_sort(mut self, sort: SortSpec) -> Self {
        self.set_sort(sort);
        self
    }

    // -----------------------------------------------------------------------
    // Producers
    // -----------------------------------------------------------------------

    /// Validate `payload` and store it as a new pending task.
    ///
    /// With a non-empty `selector`, an existing document matching it is
    /// returned instead and nothing is written. An empty selector never
    /// deduplicates.
    pub async fn put(
        &self,
        payload: Payload,
        priority: i32,
        selector: Selector,
    ) -> Result<PutOutcome> {
        self.observe("put", self.put_inner(payload, priority, selector))
            .await
    }

    /// `put`, deduplicating on the values of `keys` in the normalized payload.
    pub async fn put_keyed(
        &self,
        payload: Payload,
        priority: i32,
        keys: &[&str],
    ) -> Result<PutOutcome> {
        self.observe("put_keyed", async {
            let normalized = self.normalize(&payload)?;
            let mut selector = Selector::new();
            let mut errors = ValidationErrors::new();
            for key in keys {
                match normalized.get(*key) {
                    Some(value) => selector = selector.payload_eq(*key, value.clone()),
                    None => errors.push(*key, FieldError::Missing),
                }
            }
            if !errors.is_empty() {
                self.count_submitted("invalid");
                return Err(Error::Validation(errors));
            }
            self.put_inner(normalized, priority, selector).await
        })
        .await
    }

    async fn put_inner(
        &self,
        payload: Payload,
        priority: i32,
        selector: Selector,
    ) -> Result<PutOutcome> {
        let payload = self.normalize(&payload)?;
        let task = NewTask::new(payload, priority);

        if !selector.is_empty() {
            if let Some(existing) = self.collection.find_one(&selector).await? {
                tracing::debug!(id = %existing.id, "task already queued");
                self.count_submitted("duplicate");
                return Ok(PutOutcome::Existing(existing));
            }
        }

        let doc = self.collection.insert_one(task).await?;
        tracing::debug!(id = %doc.id, priority, "task added");
        self.count_submitted("inserted");
        Ok(PutOutcome::Inserted(doc))
    }

    /// Upsert many payloads keyed on `payload[dedup_key]`.
    ///
    /// All payloads are validated before anything is written. The upserts are
    /// independent: if the store fails part way, earlier ones stay committed.
    pub async fn put_bulk(
        &self,
        payloads: Vec<Payload>,
        dedup_key: &str,
        priority: i32,
    ) -> Result<BulkOutcome> {
        self.observe("put_bulk", self.put_bulk_inner(payloads, dedup_key, priority))
            .await
    }

    async fn put_bulk_inner(
        &self,
        payloads: Vec<Payload>,
        dedup_key: &str,
        priority: i32,
    ) -> Result<BulkOutcome> {
        let mut errors = ValidationErrors::new();
        let mut tasks = Vec::with_capacity(payloads.len());

        for (i, payload) in payloads.iter().enumerate() {
            match self.config.schema.normalized(payload) {
                Ok(normalized) if normalized.get(dedup_key).is_none_or(Value::is_null) => {
                    errors.push(format!("[{i}].{dedup_key}"), FieldError::Missing);
                }
                Ok(normalized) => tasks.push(NewTask::new(normalized, priority)),
                Err(e) => errors.extend_prefixed(&format!("[{i}]"), e),
            }
        }
        if !errors.is_empty() {
            self.count_submitted("invalid");
            return Err(Error::Validation(errors));
        }

        let mut outcome = BulkOutcome::default();
        for task in tasks {
            match self.collection.upsert_by_payload_key(dedup_key, task).await? {
                UpsertResult::Inserted(_) => outcome.inserted += 1,
                UpsertResult::Updated { matched } => outcome.updated += matched,
            }
        }

        let queue = queue_label(self.name());
        metrics::tasks_upserted().add(
            outcome.inserted,
            &[queue.clone(), KeyValue::new("result", "inserted")],
        );
        metrics::tasks_upserted().add(outcome.updated, &[queue, KeyValue::new("result", "updated")]);
        record_result(
            &Span::current(),
            &format!("inserted={} updated={}", outcome.inserted, outcome.updated),
        );
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Consumers
    // -----------------------------------------------------------------------

    /// Up to `length` documents matching `selector`, in the queue's sort
    /// order. Nothing is claimed or changed.
    pub async fn get(&self, length: usize, selector: Selector) -> Result<Vec<TaskDocument>> {
        self.observe("get", async {
            if length == 0 {
                return Ok(Vec::new());
            }
            let docs = self
                .collection
                .find(&selector, &self.config.sort, length)
                .await?;
            record_result(&Span::current(), &format!("{} documents", docs.len()));
            Ok(docs)
        })
        .await
    }

    /// Up to `length` pending documents.
    pub async fn get_pending(&self, length: usize) -> Result<Vec<TaskDocument>> {
        self.get(length, Selector::pending()).await
    }

    /// Set `finished_at` to now on every document matching `selector`.
    ///
    /// Not idempotent: a document that is already done gets a new timestamp.
    pub async fn mark_done(&self, selector: Selector) -> Result<UpdateOutcome> {
        self.observe("mark_done", async {
            require_filter(&selector, "mark_done")?;
            let outcome = self.collection.set_finished(&selector, model::now()).await?;
            metrics::tasks_completed().add(outcome.modified, &[queue_label(self.name())]);
            record_result(&Span::current(), &format!("matched={}", outcome.matched));
            Ok(outcome)
        })
        .await
    }

    /// Remove every document matching `selector`. No match is not an error.
    pub async fn delete(&self, selector: Selector) -> Result<DeleteOutcome> {
        self.observe("delete", async {
            require_filter(&selector, "delete")?;
            let deleted = self.collection.delete_many(&selector).await?;
            metrics::tasks_deleted().add(deleted, &[queue_label(self.name())]);
            record_result(&Span::current(), &format!("deleted={deleted}"));
            Ok(DeleteOutcome { deleted })
        })
        .await
    }

    /// Remove every document in the queue.
    pub async fn purge(&self) -> Result<u64> {
        self.observe("purge", async {
            let deleted = self.collection.delete_many(&Selector::new()).await?;
            tracing::info!(deleted, "queue purged");
            Ok(deleted)
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Inspection and setup
    // -----------------------------------------------------------------------

    /// Total number of documents, pending or done.
    pub async fn size(&self) -> Result<u64> {
        self.collection.count(&Selector::new()).await
    }

    pub async fn count(&self, selector: Selector) -> Result<u64> {
        self.collection.count(&selector).await
    }

    pub async fn find_by_id(&self, id: TaskId) -> Result<Option<TaskDocument>> {
        self.collection.find_one(&Selector::by_id(id)).await
    }

    /// Create the configured indexes. Call once at setup.
    pub async fn create_indexes(&self) -> Result<Vec<String>> {
        self.observe("create_indexes", async {
            if !index::covers_sort(&self.config.indexes, &self.config.sort) {
                tracing::warn!(
                    sort = ?self.config.sort,
                    "no index leads with the queue's first sort field"
                );
            }
            IndexManager::new(&self.collection)
                .ensure(&self.config.indexes)
                .await
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn normalize(&self, payload: &Payload) -> Result<Payload> {
        self.config.schema.normalized(payload).map_err(|errors| {
            tracing::debug!(queue = self.name(), %errors, "payload rejected");
            self.count_submitted("invalid");
            Error::Validation(errors)
        })
    }

    fn count_submitted(&self, result: &'static str) {
        record_result(&Span::current(), result);
        metrics::tasks_submitted().add(
            1,
            &[queue_label(self.name()), KeyValue::new("result", result)],
        );
    }

    /// Run one operation inside its span, recording duration and status.
    async fn observe<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let span = start_operation_span(self.name(), operation);
        let started = Instant::now();
        let result = fut.instrument(span).await;
        finish_operation(self.name(), operation, started, result.is_ok());
        if let Err(e) = &result {
            if !matches!(e, Error::Validation(_) | Error::InvalidSelector(_)) {
                tracing::warn!(queue = self.name(), operation, error = %e, "queue operation failed");
            }
        }
        result
    }
}

/// Destructive operations must name what they touch.
fn require_filter(selector: &Selector, operation: &str) -> Result<()> {
    if selector.is_empty() {
        Err(Error::InvalidSelector(format!(
            "{operation} requires a non-empty selector"
        )))
    } else {
        Ok(())
    }
}
