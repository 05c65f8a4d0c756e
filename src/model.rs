//! Core data model.
//!
//! A task document is one queued unit of work: a validated payload, a
//! priority, the time it was created and, once done, the time it finished.
//! There is no in-progress state; `finished_at == None` means pending.

use std::cmp::Ordering;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::schema::Payload;

// ---------------------------------------------------------------------------
// Task document
// ---------------------------------------------------------------------------

/// A stored task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDocument {
    /// Assigned by the collection on insert.
    pub id: TaskId,

    pub created_at: DateTime<Utc>,

    /// `None` while pending.
    pub finished_at: Option<DateTime<Utc>>,

    /// Higher = more urgent.
    pub priority: i32,

    /// Normalized against the queue's schema at insertion time.
    pub payload: Payload,
}

impl TaskDocument {
    pub fn is_pending(&self) -> bool {
        self.finished_at.is_none()
    }
}

/// A task that has not been stored yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub priority: i32,
    pub payload: Payload,
}

impl NewTask {
    /// A pending task created now.
    pub fn new(payload: Payload, priority: i32) -> Self {
        Self {
            created_at: now(),
            finished_at: None,
            priority,
            payload,
        }
    }

    pub fn into_document(self, id: TaskId) -> TaskDocument {
        TaskDocument {
            id,
            created_at: self.created_at,
            finished_at: self.finished_at,
            priority: self.priority,
            payload: self.payload,
        }
    }
}

/// Current time at the precision Postgres `timestamptz` stores (microseconds).
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Newtype for task document IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(TaskId)
    }
}

// ---------------------------------------------------------------------------
// Selector
// ---------------------------------------------------------------------------

/// One predicate of a selector.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Id(TaskId),
    /// `finished_at` is null.
    Pending,
    /// `finished_at` is set.
    Done,
    Priority(i32),
    /// Top-level payload field equals `value`.
    Payload { field: String, value: Value },
    CreatedBefore(DateTime<Utc>),
    CreatedAfter(DateTime<Utc>),
}

impl Filter {
    pub fn matches(&self, doc: &TaskDocument) -> bool {
        match self {
            Filter::Id(id) => doc.id == *id,
            Filter::Pending => doc.finished_at.is_none(),
            Filter::Done => doc.finished_at.is_some(),
            Filter::Priority(p) => doc.priority == *p,
            Filter::Payload { field, value } => doc
                .payload
                .get(field)
                .is_some_and(|stored| jsonb_cmp(stored, value) == Ordering::Equal),
            Filter::CreatedBefore(t) => doc.created_at < *t,
            Filter::CreatedAfter(t) => doc.created_at > *t,
        }
    }
}

/// Conjunction of filters. Empty matches every document.
///
/// Build a new value for each call; selectors are plain data and never shared
/// between operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selector {
    filters: Vec<Filter>,
}

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_id(id: TaskId) -> Self {
        Self::new().filter(Filter::Id(id))
    }

    pub fn pending() -> Self {
        Self::new().filter(Filter::Pending)
    }

    pub fn done() -> Self {
        Self::new().filter(Filter::Done)
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn payload_eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(Filter::Payload {
            field: field.into(),
            value: value.into(),
        })
    }

    pub fn priority(self, priority: i32) -> Self {
        self.filter(Filter::Priority(priority))
    }

    pub fn created_before(self, t: DateTime<Utc>) -> Self {
        self.filter(Filter::CreatedBefore(t))
    }

    pub fn created_after(self, t: DateTime<Utc>) -> Self {
        self.filter(Filter::CreatedAfter(t))
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn matches(&self, doc: &TaskDocument) -> bool {
        self.filters.iter().all(|f| f.matches(doc))
    }
}

// ---------------------------------------------------------------------------
// Sorting and indexes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Asc => write!(f, "asc"),
            Direction::Desc => write!(f, "desc"),
        }
    }
}

/// A document field that can be sorted or indexed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SortField {
    Priority,
    CreatedAt,
    FinishedAt,
    /// Top-level payload field, written `payload.<name>`.
    Payload(String),
}

impl SortField {
    /// Payload field reference. Names are restricted to `[A-Za-z0-9_]`.
    pub fn payload(name: &str) -> Result<Self> {
        if is_plain_name(name) {
            Ok(SortField::Payload(name.to_string()))
        } else {
            Err(Error::Config(format!("invalid payload field name '{name}'")))
        }
    }

    /// Short form used in index names.
    pub(crate) fn slug(&self) -> String {
        match self {
            SortField::Priority => "priority".to_string(),
            SortField::CreatedAt => "created_at".to_string(),
            SortField::FinishedAt => "finished_at".to_string(),
            SortField::Payload(name) => format!("payload_{name}"),
        }
    }
}

impl std::str::FromStr for SortField {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "priority" => Ok(SortField::Priority),
            "created_at" => Ok(SortField::CreatedAt),
            "finished_at" => Ok(SortField::FinishedAt),
            other => match other.strip_prefix("payload.") {
                Some(name) => SortField::payload(name),
                None => Err(Error::Config(format!("unknown sort field '{other}'"))),
            },
        }
    }
}

impl TryFrom<String> for SortField {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<SortField> for String {
    fn from(field: SortField) -> Self {
        field.to_string()
    }
}

impl std::fmt::Display for SortField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SortField::Priority => write!(f, "priority"),
            SortField::CreatedAt => write!(f, "created_at"),
            SortField::FinishedAt => write!(f, "finished_at"),
            SortField::Payload(name) => write!(f, "payload.{name}"),
        }
    }
}

/// One (field, direction) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortKey {
    pub field: SortField,
    #[serde(default)]
    pub direction: Direction,
}

impl SortKey {
    pub fn asc(field: SortField) -> Self {
        Self {
            field,
            direction: Direction::Asc,
        }
    }

    pub fn desc(field: SortField) -> Self {
        Self {
            field,
            direction: Direction::Desc,
        }
    }
}

/// Retrieval order.
///
/// Missing values (a pending `finished_at`, an absent payload field) sort
/// after every value in ascending order and before every value in
/// descending order. A payload field holding JSON `null` is a value, and the
/// smallest one: it sorts first ascending. Ties fall back to insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SortSpec(pub Vec<SortKey>);

impl SortSpec {
    pub fn new(keys: Vec<SortKey>) -> Self {
        Self(keys)
    }

    pub fn keys(&self) -> &[SortKey] {
        &self.0
    }
}

impl Default for SortSpec {
    /// Most urgent first, oldest first among equals.
    fn default() -> Self {
        Self(vec![
            SortKey::desc(SortField::Priority),
            SortKey::asc(SortField::CreatedAt),
        ])
    }
}

/// A (possibly compound) secondary index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndexSpec(pub Vec<SortKey>);

impl IndexSpec {
    pub fn single(key: SortKey) -> Self {
        Self(vec![key])
    }

    pub fn keys(&self) -> &[SortKey] {
        &self.0
    }

    /// `{priority: desc}`, `{created_at: asc}`, `{finished_at: desc}`.
    pub fn recommended() -> Vec<IndexSpec> {
        vec![
            IndexSpec::single(SortKey::desc(SortField::Priority)),
            IndexSpec::single(SortKey::asc(SortField::CreatedAt)),
            IndexSpec::single(SortKey::desc(SortField::FinishedAt)),
        ]
    }

    /// Deterministic index name, e.g. `tasks_priority_desc_idx`.
    pub fn name(&self, collection: &str) -> String {
        let mut name = collection.to_string();
        for key in &self.0 {
            name.push('_');
            name.push_str(&key.field.slug());
            name.push('_');
            name.push_str(&key.direction.to_string());
        }
        name.push_str("_idx");
        name
    }
}

pub(crate) fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// JSONB ordering: null < string < number < boolean < array < object.
///
/// Numbers compare by value, so `1` equals `1.0`. Arrays compare by length
/// first, objects by pair count and then pairwise in JSONB key order
/// (shorter keys first).
pub(crate) fn jsonb_cmp(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::String(_) => 1,
            Value::Number(_) => 2,
            Value::Bool(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x.len().cmp(&y.len()).then_with(|| {
            x.iter()
                .zip(y)
                .map(|(x, y)| jsonb_cmp(x, y))
                .find(|o| o.is_ne())
                .unwrap_or(Ordering::Equal)
        }),
        (Value::Object(x), Value::Object(y)) => {
            fn storage_order(m: &Payload) -> Vec<(&String, &Value)> {
                let mut pairs: Vec<(&String, &Value)> = m.iter().collect();
                pairs.sort_by(|(k1, _), (k2, _)| k1.len().cmp(&k2.len()).then_with(|| k1.cmp(k2)));
                pairs
            }
            x.len().cmp(&y.len()).then_with(|| {
                storage_order(x)
                    .into_iter()
                    .zip(storage_order(y))
                    .map(|((kx, vx), (ky, vy))| {
                        kx.len()
                            .cmp(&ky.len())
                            .then_with(|| kx.cmp(ky))
                            .then_with(|| jsonb_cmp(vx, vy))
                    })
                    .find(|o| o.is_ne())
                    .unwrap_or(Ordering::Equal)
            })
        }
        (x, y) => rank(x).cmp(&rank(y)),
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// What `put` did.
#[derive(Debug, Clone, PartialEq)]
pub enum PutOutcome {
    /// A new document was stored.
    Inserted(TaskDocument),
    /// A document matching the selector already existed; nothing was written.
    Existing(TaskDocument),
}

impl PutOutcome {
    pub fn is_inserted(&self) -> bool {
        matches!(self, PutOutcome::Inserted(_))
    }

    pub fn document(&self) -> &TaskDocument {
        match self {
            PutOutcome::Inserted(doc) | PutOutcome::Existing(doc) => doc,
        }
    }

    pub fn into_document(self) -> TaskDocument {
        match self {
            PutOutcome::Inserted(doc) | PutOutcome::Existing(doc) => doc,
        }
    }
}

/// Match/modify counts of an update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpdateOutcome {
    pub matched: u64,
    pub modified: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeleteOutcome {
    pub deleted: u64,
}

/// Aggregate result of a bulk upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BulkOutcome {
    pub inserted: u64,
    pub updated: u64,
}

impl BulkOutcome {
    pub fn total(&self) -> u64 {
        self.inserted + self.updated
    }
}

/// Result of one keyed upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertResult {
    Inserted(TaskId),
    Updated { matched: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(priority: i32, payload: Value) -> TaskDocument {
        let Value::Object(payload) = payload else {
            panic!("payload must be an object");
        };
        NewTask::new(payload, priority).into_document(TaskId::new())
    }

    #[test]
    fn empty_selector_matches_everything() {
        let d = doc(0, json!({"key": "a"}));
        assert!(Selector::new().matches(&d));
        assert!(Selector::new().is_empty());
    }

    #[test]
    fn selector_is_a_conjunction() {
        let d = doc(3, json!({"key": "a", "n": 1}));
        assert!(Selector::pending().payload_eq("key", "a").matches(&d));
        assert!(!Selector::pending().payload_eq("key", "b").matches(&d));
        assert!(!Selector::done().payload_eq("key", "a").matches(&d));
        assert!(Selector::new().priority(3).payload_eq("n", 1).matches(&d));
        assert!(!Selector::new().payload_eq("missing", Value::Null).matches(&d));
        assert!(Selector::by_id(d.id).matches(&d));
    }

    #[test]
    fn payload_equality_compares_numbers_by_value() {
        let d = doc(0, json!({"rank": 1.0, "tags": [2, "x"], "meta": {"n": 3}}));
        assert!(Selector::new().payload_eq("rank", 1).matches(&d));
        assert!(Selector::new().payload_eq("tags", json!([2.0, "x"])).matches(&d));
        assert!(Selector::new().payload_eq("meta", json!({"n": 3.0})).matches(&d));
        assert!(!Selector::new().payload_eq("rank", "1").matches(&d));
        assert!(!Selector::new().payload_eq("rank", 1.5).matches(&d));
    }

    #[test]
    fn jsonb_order_puts_null_first_and_ranks_types() {
        let ordered = [json!(null), json!("a"), json!(-1), json!(2.5), json!(false), json!([]), json!({})];
        for pair in ordered.windows(2) {
            assert_eq!(jsonb_cmp(&pair[0], &pair[1]), Ordering::Less, "{pair:?}");
        }
        assert_eq!(jsonb_cmp(&json!({"bb": 1, "a": 2}), &json!({"a": 2, "bb": 1})), Ordering::Equal);
    }

    #[test]
    fn new_tasks_use_microsecond_timestamps() {
        let task = NewTask::new(Payload::new(), 0);
        assert_eq!(task.created_at.timestamp_subsec_nanos() % 1_000, 0);
    }

    #[test]
    fn created_bounds_are_strict() {
        let d = doc(0, json!({}));
        assert!(!Selector::new().created_before(d.created_at).matches(&d));
        assert!(!Selector::new().created_after(d.created_at).matches(&d));
        assert!(
            Selector::new()
                .created_before(d.created_at + chrono::Duration::seconds(1))
                .matches(&d)
        );
    }

    #[test]
    fn sort_field_parses_and_displays() {
        assert_eq!("priority".parse::<SortField>().unwrap(), SortField::Priority);
        assert_eq!(
            "payload.key".parse::<SortField>().unwrap(),
            SortField::Payload("key".into())
        );
        assert_eq!(SortField::Payload("key".into()).to_string(), "payload.key");
        assert!("payload.bad-name".parse::<SortField>().is_err());
        assert!("payload.".parse::<SortField>().is_err());
        assert!("updated_at".parse::<SortField>().is_err());
    }

    #[test]
    fn sort_key_deserializes_with_default_direction() {
        let key: SortKey = serde_json::from_value(json!({"field": "created_at"})).unwrap();
        assert_eq!(key, SortKey::asc(SortField::CreatedAt));
        let key: SortKey =
            serde_json::from_value(json!({"field": "priority", "direction": "desc"})).unwrap();
        assert_eq!(key, SortKey::desc(SortField::Priority));
    }

    #[test]
    fn default_sort_is_priority_desc_then_created_asc() {
        let spec = SortSpec::default();
        assert_eq!(
            spec.keys(),
            &[
                SortKey::desc(SortField::Priority),
                SortKey::asc(SortField::CreatedAt)
            ]
        );
    }

    #[test]
    fn index_names_are_deterministic() {
        let compound = IndexSpec(vec![
            SortKey::asc(SortField::FinishedAt),
            SortKey::desc(SortField::Payload("key".into())),
        ]);
        assert_eq!(
            compound.name("tasks"),
            "tasks_finished_at_asc_payload_key_desc_idx"
        );
        let names: Vec<_> = IndexSpec::recommended()
            .iter()
            .map(|i| i.name("q"))
            .collect();
        assert_eq!(
            names,
            ["q_priority_desc_idx", "q_created_at_asc_idx", "q_finished_at_desc_idx"]
        );
    }
}
