//! # docq
//!
//! Priority task queue whose tasks are stored as documents in a collection.
//!
//! Producers `put` schema-validated payloads (optionally deduplicated against
//! existing tasks) or upsert batches with `put_bulk`; consumers `get` an
//! ordered batch of pending tasks and `mark_done` each one. Collections are
//! Postgres tables with a JSONB payload, or in-memory for tests.

pub mod config;
pub mod error;
pub mod model;
pub mod queue;
pub mod schema;
pub mod store;
pub mod telemetry;

pub use error::{Error, Result};
pub use model::{Selector, SortSpec, TaskDocument, TaskId};
pub use queue::Queue;
