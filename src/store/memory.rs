//! In-memory collection.
//!
//! Mirrors the Postgres collection's semantics (filters, ordering including
//! nulls, keyed upsert) so the queue engine can be exercised without a
//! database. Clones share the same documents.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard};

use super::Collection;
use crate::error::{Error, Result};
use crate::model::{
    Direction, IndexSpec, NewTask, Selector, SortField, SortSpec, TaskDocument, TaskId,
    UpdateOutcome, UpsertResult, jsonb_cmp,
};

#[derive(Default)]
struct MemoryState {
    /// Documents in insertion order.
    docs: Vec<TaskDocument>,
    indexes: BTreeSet<String>,
}

/// A collection held in process memory.
#[derive(Clone)]
pub struct MemoryCollection {
    name: String,
    state: Arc<Mutex<MemoryState>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryCollection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(MemoryState::default())),
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make every subsequent call fail as if the store were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, AtomicOrdering::SeqCst);
    }

    /// Names of the indexes created so far.
    pub async fn index_names(&self) -> Result<Vec<String>> {
        let state = self.lock().await?;
        Ok(state.indexes.iter().cloned().collect())
    }

    /// Every document, in insertion order.
    pub async fn snapshot(&self) -> Result<Vec<TaskDocument>> {
        let state = self.lock().await?;
        Ok(state.docs.clone())
    }

    async fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        if self.unavailable.load(AtomicOrdering::SeqCst) {
            return Err(Error::StoreUnavailable(format!(
                "memory collection '{}' is offline",
                self.name
            )));
        }
        Ok(self.state.lock().await)
    }
}

#[async_trait]
impl Collection for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ensure(&self) -> Result<()> {
        self.lock().await.map(|_| ())
    }

    async fn insert_one(&self, task: NewTask) -> Result<TaskDocument> {
        let mut state = self.lock().await?;
        let doc = task.into_document(TaskId::new());
        state.docs.push(doc.clone());
        Ok(doc)
    }

    async fn find_one(&self, selector: &Selector) -> Result<Option<TaskDocument>> {
        let state = self.lock().await?;
        Ok(state
            .docs
            .iter()
            .filter(|d| selector.matches(d))
            .min_by_key(|d| d.created_at)
            .cloned())
    }

    async fn find(
        &self,
        selector: &Selector,
        sort: &SortSpec,
        limit: usize,
    ) -> Result<Vec<TaskDocument>> {
        let state = self.lock().await?;
        let mut matched: Vec<TaskDocument> = state
            .docs
            .iter()
            .filter(|d| selector.matches(d))
            .cloned()
            .collect();
        matched.sort_by(|a, b| compare_documents(a, b, sort));
        matched.truncate(limit);
        Ok(matched)
    }

    async fn count(&self, selector: &Selector) -> Result<u64> {
        let state = self.lock().await?;
        Ok(state.docs.iter().filter(|d| selector.matches(d)).count() as u64)
    }

    async fn set_finished(&self, selector: &Selector, at: DateTime<Utc>) -> Result<UpdateOutcome> {
        let mut state = self.lock().await?;
        let mut outcome = UpdateOutcome::default();
        for doc in state.docs.iter_mut().filter(|d| selector.matches(d)) {
            outcome.matched += 1;
            if doc.finished_at != Some(at) {
                doc.finished_at = Some(at);
                outcome.modified += 1;
            }
        }
        Ok(outcome)
    }

    async fn delete_many(&self, selector: &Selector) -> Result<u64> {
        let mut state = self.lock().await?;
        let before = state.docs.len();
        state.docs.retain(|d| !selector.matches(d));
        Ok((before - state.docs.len()) as u64)
    }

    async fn upsert_by_payload_key(&self, key: &str, task: NewTask) -> Result<UpsertResult> {
        let key_value = task
            .payload
            .get(key)
            .cloned()
            .ok_or_else(|| Error::Other(format!("upsert payload has no '{key}' field")))?;

        let mut state = self.lock().await?;
        let mut matched = 0;
        for doc in state
            .docs
            .iter_mut()
            .filter(|d| {
                d.payload
                    .get(key)
                    .is_some_and(|v| jsonb_cmp(v, &key_value) == Ordering::Equal)
            })
        {
            doc.payload = task.payload.clone();
            doc.priority = task.priority;
            matched += 1;
        }

        if matched > 0 {
            return Ok(UpsertResult::Updated { matched });
        }

        let id = TaskId::new();
        state.docs.push(task.into_document(id));
        Ok(UpsertResult::Inserted(id))
    }

    async fn create_index(&self, index: &IndexSpec) -> Result<String> {
        let mut state = self.lock().await?;
        let name = index.name(&self.name);
        state.indexes.insert(name.clone());
        Ok(name)
    }
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

/// Order two documents by `sort`. Equal documents keep insertion order
/// because the sort is stable.
fn compare_documents(a: &TaskDocument, b: &TaskDocument, sort: &SortSpec) -> Ordering {
    for key in sort.keys() {
        let ord = match &key.field {
            SortField::Priority => a.priority.cmp(&b.priority),
            SortField::CreatedAt => a.created_at.cmp(&b.created_at),
            SortField::FinishedAt => {
                nulls_last(a.finished_at.as_ref(), b.finished_at.as_ref(), |x, y| x.cmp(y))
            }
            SortField::Payload(name) => {
                nulls_last(a.payload.get(name), b.payload.get(name), |x, y| jsonb_cmp(x, y))
            }
        };
        let ord = match key.direction {
            Direction::Asc => ord,
            Direction::Desc => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Absent values sort after present ones.
fn nulls_last<T>(a: Option<T>, b: Option<T>, cmp: impl Fn(&T, &T) -> Ordering) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => cmp(&a, &b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
