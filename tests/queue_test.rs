//! Integration tests for the queue engine over the in-memory collection.

use docq::config::QueueConfig;
use docq::error::Error;
use docq::model::{
    BulkOutcome, Direction, PutOutcome, Selector, SortField, SortKey, SortSpec, UpdateOutcome,
};
use docq::schema::{FieldError, FieldKind, FieldRule, Payload, Schema};
use docq::store::MemoryCollection;
use docq::Queue;
use serde_json::{Value, json};

fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

fn task_schema() -> Schema {
    Schema::new()
        .field("key", FieldRule::required(FieldKind::String))
        .field("required_value", FieldRule::required(FieldKind::String))
        .field(
            "default_value",
            FieldRule::new(FieldKind::String).default_value("nope"),
        )
}

fn test_queue() -> Queue<MemoryCollection> {
    Queue::in_memory(QueueConfig::new("queue_queue", task_schema()))
}

fn valid(key: &str) -> Payload {
    payload(json!({"key": key, "required_value": "yes"}))
}

// ---------------------------------------------------------------------------
// put
// ---------------------------------------------------------------------------

#[tokio::test]
async fn put_on_empty_queue_creates_one_document() {
    let q = test_queue();

    let outcome = q
        .put(valid("alpha"), 5, Selector::new())
        .await
        .unwrap();

    let PutOutcome::Inserted(doc) = outcome else {
        panic!("expected Inserted, got {outcome:?}");
    };
    assert_eq!(doc.priority, 5);
    assert!(doc.is_pending());
    assert_eq!(doc.payload["default_value"], json!("nope"));
    assert_eq!(q.size().await.unwrap(), 1);
}

#[tokio::test]
async fn invalid_payload_is_rejected_without_a_write() {
    let q = test_queue();
    for key in ["a", "b", "c", "d", "e", "f", "g"] {
        q.put(valid(key), 0, Selector::new()).await.unwrap();
    }
    assert_eq!(q.size().await.unwrap(), 7);

    let err = q
        .put(payload(json!({"key": "test"})), 0, Selector::new())
        .await
        .unwrap_err();

    let errors = err.validation_errors().expect("validation error");
    assert_eq!(errors.get("required_value"), Some(&[FieldError::Missing][..]));
    assert_eq!(q.size().await.unwrap(), 7);
}

#[tokio::test]
async fn validation_reports_all_fields_at_once() {
    let q = test_queue();
    let err = q
        .put(payload(json!({"key": 1, "stray": "x"})), 0, Selector::new())
        .await
        .unwrap_err();

    let errors = err.validation_errors().unwrap();
    assert_eq!(errors.len(), 3);
    assert!(errors.get("key").is_some());
    assert!(errors.get("required_value").is_some());
    assert!(errors.get("stray").is_some());
}

#[tokio::test]
async fn put_with_same_selector_twice_dedups() {
    let q = test_queue();
    let selector = || Selector::new().payload_eq("key", "alpha");

    let first = q.put(valid("alpha"), 1, selector()).await.unwrap();
    let second = q.put(valid("alpha"), 9, selector()).await.unwrap();

    assert!(first.is_inserted());
    let PutOutcome::Existing(existing) = second else {
        panic!("expected Existing, got {second:?}");
    };
    assert_eq!(existing.id, first.document().id);
    assert_eq!(existing.priority, 1);
    assert_eq!(q.size().await.unwrap(), 1);
}

#[tokio::test]
async fn put_with_empty_selector_never_dedups() {
    let q = test_queue();
    q.put(valid("alpha"), 0, Selector::new()).await.unwrap();
    q.put(valid("alpha"), 0, Selector::new()).await.unwrap();
    assert_eq!(q.size().await.unwrap(), 2);
}

#[tokio::test]
async fn put_keyed_dedups_on_normalized_fields() {
    let q = test_queue();
    q.put_keyed(valid("alpha"), 0, &["key", "default_value"])
        .await
        .unwrap();
    let again = q
        .put_keyed(valid("alpha"), 0, &["key", "default_value"])
        .await
        .unwrap();
    assert!(!again.is_inserted());

    let other = q
        .put_keyed(
            payload(json!({"key": "alpha", "required_value": "yes", "default_value": "yep"})),
            0,
            &["key", "default_value"],
        )
        .await
        .unwrap();
    assert!(other.is_inserted());
    assert_eq!(q.size().await.unwrap(), 2);
}

#[tokio::test]
async fn failed_put_propagates_store_error_and_leaves_size() {
    let q = test_queue();
    q.put(valid("a"), 0, Selector::new()).await.unwrap();

    q.collection().set_unavailable(true);
    let err = q.put(valid("b"), 0, Selector::new()).await.unwrap_err();
    assert!(err.is_unavailable());
    let err = q.get(10, Selector::new()).await.unwrap_err();
    assert!(matches!(err, Error::StoreUnavailable(_)));
    q.collection().set_unavailable(false);

    assert_eq!(q.size().await.unwrap(), 1);
}

// ---------------------------------------------------------------------------
// get
// ---------------------------------------------------------------------------

#[tokio::test]
async fn get_filters_and_limits() {
    let q = test_queue();
    for (i, key) in ["a", "b", "c", "d", "e", "f"].iter().enumerate() {
        let required = if i < 5 { "yes" } else { "no" };
        q.put(
            payload(json!({"key": key, "required_value": required})),
            0,
            Selector::new(),
        )
        .await
        .unwrap();
    }

    let filter = || Selector::new().payload_eq("required_value", "yes");
    let docs = q.get(4, filter()).await.unwrap();

    assert_eq!(docs.len(), 4);
    assert!(docs.iter().all(|d| d.payload["required_value"] == json!("yes")));
    assert_eq!(q.count(filter()).await.unwrap(), 5);
    assert_eq!(q.get(100, filter()).await.unwrap().len(), 5);
}

#[tokio::test]
async fn get_orders_by_priority_then_age() {
    let q = test_queue();
    q.put(valid("low-old"), 0, Selector::new()).await.unwrap();
    q.put(valid("high-old"), 10, Selector::new()).await.unwrap();
    q.put(valid("high-new"), 10, Selector::new()).await.unwrap();
    q.put(valid("mid"), 5, Selector::new()).await.unwrap();

    let keys: Vec<Value> = q
        .get(10, Selector::new())
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.payload["key"].clone())
        .collect();

    assert_eq!(keys, vec![json!("high-old"), json!("high-new"), json!("mid"), json!("low-old")]);
}

#[tokio::test]
async fn ascending_timestamp_sort_is_non_decreasing() {
    let mut q = test_queue();
    for key in ["a", "b", "c", "d", "e"] {
        q.put(valid(key), 3, Selector::new()).await.unwrap();
    }
    q.set_sort(SortSpec::new(vec![SortKey::asc(SortField::CreatedAt)]));

    let docs = q.get(5, Selector::new()).await.unwrap();
    assert!(docs.windows(2).all(|w| w[0].created_at <= w[1].created_at));
}

#[tokio::test]
async fn get_sorts_on_payload_fields() {
    let q = Queue::in_memory(QueueConfig::new(
        "ranked",
        Schema::new().field("rank", FieldRule::required(FieldKind::Integer)),
    ))
    .with_sort(SortSpec::new(vec![SortKey {
        field: SortField::Payload("rank".into()),
        direction: Direction::Desc,
    }]));

    for rank in [3, 7, 1] {
        q.put(payload(json!({ "rank": rank })), 0, Selector::new())
            .await
            .unwrap();
    }

    let ranks: Vec<Value> = q
        .get(3, Selector::new())
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.payload["rank"].clone())
        .collect();
    assert_eq!(ranks, vec![json!(7), json!(3), json!(1)]);
}

#[tokio::test]
async fn payload_filters_compare_numbers_by_value() {
    let q = Queue::in_memory(QueueConfig::new(
        "scored",
        Schema::new().field("score", FieldRule::required(FieldKind::Number)),
    ));
    q.put(payload(json!({"score": 1.0})), 0, Selector::new())
        .await
        .unwrap();
    q.put(payload(json!({"score": 2})), 0, Selector::new())
        .await
        .unwrap();

    let docs = q
        .get(10, Selector::new().payload_eq("score", 1))
        .await
        .unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].payload["score"], json!(1.0));

    let dup = q
        .put(payload(json!({"score": 2.0})), 0, Selector::new().payload_eq("score", 2.0))
        .await
        .unwrap();
    assert!(!dup.is_inserted());
}

#[tokio::test]
async fn get_is_a_peek_and_zero_length_is_empty() {
    let q = test_queue();
    q.put(valid("a"), 0, Selector::new()).await.unwrap();

    let first = q.get_pending(1).await.unwrap();
    let second = q.get_pending(1).await.unwrap();
    assert_eq!(first, second);
    assert!(q.get(0, Selector::new()).await.unwrap().is_empty());
    assert!(
        q.get(5, Selector::new().payload_eq("key", "nothing"))
            .await
            .unwrap()
            .is_empty()
    );
}

// ---------------------------------------------------------------------------
// mark_done / delete
// ---------------------------------------------------------------------------

#[tokio::test]
async fn mark_done_finishes_exactly_one_document() {
    let q = test_queue();
    for key in ["a", "b", "c"] {
        q.put(valid(key), 0, Selector::new()).await.unwrap();
    }
    let pending_before = q.count(Selector::pending()).await.unwrap();
    let target = q.get_pending(1).await.unwrap().remove(0);

    let outcome = q.mark_done(Selector::by_id(target.id)).await.unwrap();

    assert_eq!(outcome, UpdateOutcome { matched: 1, modified: 1 });
    let done = q.find_by_id(target.id).await.unwrap().unwrap();
    assert!(done.finished_at.is_some());
    assert_eq!(q.count(Selector::pending()).await.unwrap(), pending_before - 1);
    assert!(!q
        .get_pending(10)
        .await
        .unwrap()
        .iter()
        .any(|d| d.id == target.id));
}

#[tokio::test]
async fn mark_done_twice_overwrites_the_timestamp() {
    let q = test_queue();
    let doc = q
        .put(valid("a"), 0, Selector::new())
        .await
        .unwrap()
        .into_document();

    q.mark_done(Selector::by_id(doc.id)).await.unwrap();
    let first = q.find_by_id(doc.id).await.unwrap().unwrap().finished_at;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let outcome = q.mark_done(Selector::by_id(doc.id)).await.unwrap();
    let second = q.find_by_id(doc.id).await.unwrap().unwrap().finished_at;

    assert_eq!(outcome.matched, 1);
    assert!(second > first);
}

#[tokio::test]
async fn mark_done_without_match_is_zero_not_error() {
    let q = test_queue();
    let outcome = q
        .mark_done(Selector::by_id(docq::TaskId::new()))
        .await
        .unwrap();
    assert_eq!(outcome, UpdateOutcome::default());
}

#[tokio::test]
async fn delete_removes_only_existing_documents() {
    let q = test_queue();
    let doc = q
        .put(valid("a"), 0, Selector::new())
        .await
        .unwrap()
        .into_document();
    q.put(valid("b"), 0, Selector::new()).await.unwrap();

    assert_eq!(q.delete(Selector::by_id(doc.id)).await.unwrap().deleted, 1);
    assert_eq!(q.size().await.unwrap(), 1);
    assert_eq!(q.delete(Selector::by_id(doc.id)).await.unwrap().deleted, 0);
    assert_eq!(q.size().await.unwrap(), 1);
}

#[tokio::test]
async fn destructive_operations_refuse_empty_selectors() {
    let q = test_queue();
    q.put(valid("a"), 0, Selector::new()).await.unwrap();

    assert!(matches!(
        q.delete(Selector::new()).await,
        Err(Error::InvalidSelector(_))
    ));
    assert!(matches!(
        q.mark_done(Selector::new()).await,
        Err(Error::InvalidSelector(_))
    ));
    assert_eq!(q.size().await.unwrap(), 1);
    assert_eq!(q.purge().await.unwrap(), 1);
    assert_eq!(q.size().await.unwrap(), 0);
}

// ---------------------------------------------------------------------------
// put_bulk
// ---------------------------------------------------------------------------

fn batch() -> Vec<Payload> {
    ["a", "b", "c", "d"].into_iter().map(valid).collect()
}

#[tokio::test]
async fn put_bulk_inserts_then_updates() {
    let q = test_queue();

    let first = q.put_bulk(batch(), "key", 10).await.unwrap();
    assert_eq!(first, BulkOutcome { inserted: 4, updated: 0 });
    assert_eq!(q.size().await.unwrap(), 4);

    let second = q.put_bulk(batch(), "key", 10).await.unwrap();
    assert_eq!(second, BulkOutcome { inserted: 0, updated: 4 });
    assert_eq!(q.size().await.unwrap(), 4);
    assert_eq!(second.total(), first.total());
}

#[tokio::test]
async fn put_bulk_updates_payload_and_priority_in_place() {
    let q = test_queue();
    let original = q
        .put(valid("a"), 1, Selector::new())
        .await
        .unwrap()
        .into_document();
    q.mark_done(Selector::by_id(original.id)).await.unwrap();

    let changed = payload(json!({"key": "a", "required_value": "changed"}));
    let outcome = q.put_bulk(vec![changed], "key", 7).await.unwrap();
    assert_eq!(outcome, BulkOutcome { inserted: 0, updated: 1 });

    let doc = q.find_by_id(original.id).await.unwrap().unwrap();
    assert_eq!(doc.priority, 7);
    assert_eq!(doc.payload["required_value"], json!("changed"));
    assert_eq!(doc.created_at, original.created_at);
    assert!(doc.finished_at.is_some());
}

#[tokio::test]
async fn put_bulk_validates_whole_batch_before_writing() {
    let q = test_queue();
    let mut payloads = batch();
    payloads.push(payload(json!({"key": "e"})));
    payloads.push(payload(json!({"required_value": "yes"})));

    let err = q.put_bulk(payloads, "key", 0).await.unwrap_err();

    let errors = err.validation_errors().unwrap();
    assert_eq!(errors.get("[4].required_value"), Some(&[FieldError::Missing][..]));
    assert_eq!(errors.get("[5].key"), Some(&[FieldError::Missing][..]));
    assert_eq!(q.size().await.unwrap(), 0);
}

#[tokio::test]
async fn put_bulk_requires_the_dedup_key() {
    let q = Queue::in_memory(QueueConfig::new(
        "loose",
        Schema::new().allow_unknown(true),
    ));
    let err = q
        .put_bulk(vec![payload(json!({"other": 1}))], "key", 0)
        .await
        .unwrap_err();
    assert_eq!(
        err.validation_errors().unwrap().get("[0].key"),
        Some(&[FieldError::Missing][..])
    );
}

// ---------------------------------------------------------------------------
// indexes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_indexes_is_idempotent() {
    let q = test_queue();
    let names = q.create_indexes().await.unwrap();
    assert_eq!(
        names,
        [
            "queue_queue_priority_desc_idx",
            "queue_queue_created_at_asc_idx",
            "queue_queue_finished_at_desc_idx"
        ]
    );
    q.create_indexes().await.unwrap();
    assert_eq!(q.collection().index_names().await.unwrap().len(), 3);
}
