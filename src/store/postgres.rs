//! Postgres-backed document collections.
//!
//! Each queue type lives in its own table: a UUID id, the two timestamps,
//! the priority, a `jsonb` payload and an identity `seq` that breaks ordering
//! ties in insertion order. Selectors compile to parameterized
//! `WHERE` clauses; only table names and payload sort/index fields are spliced
//! into SQL, and those are checked to be plain identifiers first.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use super::Collection;
use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::model::{
    Direction, Filter, IndexSpec, NewTask, Selector, SortField, SortKey, SortSpec, TaskDocument,
    TaskId, UpdateOutcome, UpsertResult, is_plain_name,
};
use crate::queue::Queue;

const COLUMNS: &str = "id, created_at, finished_at, priority, payload";

/// Longest table name accepted, leaving room for index name suffixes.
const MAX_NAME_LEN: usize = 48;

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Connection settings.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub max_connections: u32,
    /// Run a liveness query right after connecting.
    pub check_availability: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            check_availability: false,
        }
    }
}

/// Database handle. Owns the connection pool and hands out collections.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str, options: &ConnectOptions) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(options.max_connections)
            .connect(url)
            .await?;
        let db = Self { pool };
        if options.check_availability {
            db.health_check().await?;
        }
        Ok(db)
    }

    /// Liveness check: `SELECT 1`.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Handle to the named collection. Does not touch the database.
    pub fn collection(&self, name: &str) -> Result<PgCollection> {
        check_table_name(name)?;
        Ok(PgCollection {
            pool: self.pool.clone(),
            name: name.to_string(),
        })
    }

    /// Ensure the queue's table exists and return an engine over it.
    pub async fn open_queue(&self, config: QueueConfig) -> Result<Queue<PgCollection>> {
        let collection = self.collection(&config.name)?;
        collection.ensure().await?;
        Ok(Queue::new(collection, config))
    }
}

fn check_table_name(name: &str) -> Result<()> {
    let starts_ok = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if starts_ok && is_plain_name(name) && name.len() <= MAX_NAME_LEN {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "invalid collection name '{name}': expected [A-Za-z_][A-Za-z0-9_]*, at most {MAX_NAME_LEN} chars"
        )))
    }
}

// ---------------------------------------------------------------------------
// Collection
// ---------------------------------------------------------------------------

/// One queue table.
#[derive(Clone)]
pub struct PgCollection {
    pool: PgPool,
    name: String,
}

#[async_trait]
impl Collection for PgCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ensure(&self) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id          UUID PRIMARY KEY,
                created_at  TIMESTAMPTZ NOT NULL,
                finished_at TIMESTAMPTZ,
                priority    INTEGER NOT NULL DEFAULT 0,
                payload     JSONB NOT NULL,
                seq         BIGINT GENERATED ALWAYS AS IDENTITY
            )",
            self.name
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_one(&self, task: NewTask) -> Result<TaskDocument> {
        let sql = format!(
            "INSERT INTO {} ({COLUMNS}) VALUES ($1, $2, $3, $4, $5) RETURNING {COLUMNS}",
            self.name
        );
        let row: TaskRow = sqlx::query_as(&sql)
            .bind(TaskId::new().0)
            .bind(task.created_at)
            .bind(task.finished_at)
            .bind(task.priority)
            .bind(Value::Object(task.payload))
            .fetch_one(&self.pool)
            .await?;
        row.try_into_document()
    }

    async fn find_one(&self, selector: &Selector) -> Result<Option<TaskDocument>> {
        let mut qb = select_builder(&self.name, selector);
        qb.push(" ORDER BY created_at ASC, seq ASC LIMIT 1");
        let row = qb.build_query_as::<TaskRow>().fetch_optional(&self.pool).await?;
        row.map(TaskRow::try_into_document).transpose()
    }

    async fn find(
        &self,
        selector: &Selector,
        sort: &SortSpec,
        limit: usize,
    ) -> Result<Vec<TaskDocument>> {
        let mut qb = find_builder(&self.name, selector, sort, limit)?;
        let rows = qb.build_query_as::<TaskRow>().fetch_all(&self.pool).await?;
        rows.into_iter().map(TaskRow::try_into_document).collect()
    }

    async fn count(&self, selector: &Selector) -> Result<u64> {
        let mut qb = QueryBuilder::new(format!("SELECT COUNT(*) FROM {}", self.name));
        push_where(&mut qb, selector);
        let (count,) = qb.build_query_as::<(i64,)>().fetch_one(&self.pool).await?;
        Ok(count as u64)
    }

    async fn set_finished(&self, selector: &Selector, at: DateTime<Utc>) -> Result<UpdateOutcome> {
        let mut qb = QueryBuilder::new(format!("UPDATE {} SET finished_at = ", self.name));
        qb.push_bind(at);
        push_where(&mut qb, selector);
        let affected = qb.build().execute(&self.pool).await?.rows_affected();
        Ok(UpdateOutcome {
            matched: affected,
            modified: affected,
        })
    }

    async fn delete_many(&self, selector: &Selector) -> Result<u64> {
        let mut qb = QueryBuilder::new(format!("DELETE FROM {}", self.name));
        push_where(&mut qb, selector);
        Ok(qb.build().execute(&self.pool).await?.rows_affected())
    }

    async fn upsert_by_payload_key(&self, key: &str, task: NewTask) -> Result<UpsertResult> {
        let key_value = task
            .payload
            .get(key)
            .cloned()
            .ok_or_else(|| Error::Other(format!("upsert payload has no '{key}' field")))?;
        let id = TaskId::new();

        // Single statement: update every keyed match, insert only if none.
        let sql = format!(
            "WITH updated AS (
                UPDATE {t} SET payload = $1, priority = $2
                WHERE payload -> $3::text = $4::jsonb
                RETURNING id
            ),
            inserted AS (
                INSERT INTO {t} ({COLUMNS})
                SELECT $5::uuid, $6::timestamptz, NULL::timestamptz, $2::integer, $1::jsonb
                WHERE NOT EXISTS (SELECT 1 FROM updated)
                RETURNING id
            )
            SELECT (SELECT COUNT(*) FROM updated), (SELECT id FROM inserted)",
            t = self.name
        );
        let (updated, inserted): (i64, Option<Uuid>) = sqlx::query_as(&sql)
            .bind(Value::Object(task.payload))
            .bind(task.priority)
            .bind(key)
            .bind(key_value)
            .bind(id.0)
            .bind(task.created_at)
            .fetch_one(&self.pool)
            .await?;

        match inserted {
            Some(id) => Ok(UpsertResult::Inserted(TaskId(id))),
            None => Ok(UpsertResult::Updated {
                matched: updated as u64,
            }),
        }
    }

    async fn create_index(&self, index: &IndexSpec) -> Result<String> {
        if index.keys().is_empty() {
            return Err(Error::Config("index needs at least one key".to_string()));
        }
        let name = index.name(&self.name);
        let columns = index
            .keys()
            .iter()
            .map(sort_key_sql)
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        let sql = format!(
            "CREATE INDEX IF NOT EXISTS {name} ON {} ({columns})",
            self.name
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(name)
    }
}

// ---------------------------------------------------------------------------
// SQL building
// ---------------------------------------------------------------------------

fn select_builder<'a>(table: &str, selector: &Selector) -> QueryBuilder<'a, Postgres> {
    let mut qb = QueryBuilder::new(format!("SELECT {COLUMNS} FROM {table}"));
    push_where(&mut qb, selector);
    qb
}

/// `SELECT … ORDER BY <sort>, seq LIMIT n`.
fn find_builder<'a>(
    table: &str,
    selector: &Selector,
    sort: &SortSpec,
    limit: usize,
) -> Result<QueryBuilder<'a, Postgres>> {
    let mut qb = select_builder(table, selector);
    qb.push(" ORDER BY ");
    for key in sort.keys() {
        push_sort_key(&mut qb, key)?;
        qb.push(", ");
    }
    qb.push("seq ASC LIMIT ");
    qb.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
    Ok(qb)
}

/// Append ` WHERE …` for a non-empty selector.
fn push_where(qb: &mut QueryBuilder<'_, Postgres>, selector: &Selector) {
    for (i, filter) in selector.filters().iter().enumerate() {
        qb.push(if i == 0 { " WHERE " } else { " AND " });
        match filter {
            Filter::Id(id) => {
                qb.push("id = ").push_bind(id.0);
            }
            Filter::Pending => {
                qb.push("finished_at IS NULL");
            }
            Filter::Done => {
                qb.push("finished_at IS NOT NULL");
            }
            Filter::Priority(p) => {
                qb.push("priority = ").push_bind(*p);
            }
            Filter::Payload { field, value } => {
                qb.push("payload -> ")
                    .push_bind(field.clone())
                    .push("::text = ")
                    .push_bind(value.clone())
                    .push("::jsonb");
            }
            Filter::CreatedBefore(t) => {
                qb.push("created_at < ").push_bind(*t);
            }
            Filter::CreatedAfter(t) => {
                qb.push("created_at > ").push_bind(*t);
            }
        }
    }
}

fn push_sort_key(qb: &mut QueryBuilder<'_, Postgres>, key: &SortKey) -> Result<()> {
    qb.push(sort_key_sql(key)?);
    Ok(())
}

/// `priority DESC`, `(payload -> 'key') ASC`, …
fn sort_key_sql(key: &SortKey) -> Result<String> {
    let column = match &key.field {
        SortField::Priority => "priority".to_string(),
        SortField::CreatedAt => "created_at".to_string(),
        SortField::FinishedAt => "finished_at".to_string(),
        SortField::Payload(name) => {
            if !is_plain_name(name) {
                return Err(Error::Config(format!("invalid payload field name '{name}'")));
            }
            format!("(payload -> '{name}')")
        }
    };
    let direction = match key.direction {
        Direction::Asc => "ASC",
        Direction::Desc => "DESC",
    };
    Ok(format!("{column} {direction}"))
}

// ---------------------------------------------------------------------------
// Row parsing
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    priority: i32,
    payload: Value,
}

impl TaskRow {
    fn try_into_document(self) -> Result<TaskDocument> {
        let Value::Object(payload) = self.payload else {
            return Err(Error::Other(format!(
                "task {} has a non-object payload",
                self.id
            )));
        };
        Ok(TaskDocument {
            id: TaskId(self.id),
            created_at: self.created_at,
            finished_at: self.finished_at,
            priority: self.priority,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn table_names_must_be_identifiers() {
        assert!(check_table_name("crawl_tasks").is_ok());
        assert!(check_table_name("_q1").is_ok());
        assert!(check_table_name("1q").is_err());
        assert!(check_table_name("tasks; DROP TABLE x").is_err());
        assert!(check_table_name("").is_err());
        assert!(check_table_name(&"q".repeat(MAX_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn empty_selector_has_no_where_clause() {
        let qb = select_builder("tasks", &Selector::new());
        assert_eq!(qb.sql(), format!("SELECT {COLUMNS} FROM tasks"));
    }

    #[test]
    fn selector_compiles_to_bound_conditions() {
        let selector = Selector::pending()
            .payload_eq("required_value", json!("yes"))
            .priority(5);
        let mut qb = QueryBuilder::new("DELETE FROM tasks");
        push_where(&mut qb, &selector);
        assert_eq!(
            qb.sql(),
            "DELETE FROM tasks WHERE finished_at IS NULL AND payload -> $1::text = $2::jsonb AND priority = $3"
        );
    }

    #[test]
    fn find_breaks_ties_by_insertion_sequence() {
        let qb = find_builder("tasks", &Selector::pending(), &SortSpec::default(), 5).unwrap();
        assert_eq!(
            qb.sql(),
            format!(
                "SELECT {COLUMNS} FROM tasks WHERE finished_at IS NULL \
                 ORDER BY priority DESC, created_at ASC, seq ASC LIMIT $1"
            )
        );
    }

    #[test]
    fn sort_keys_render_with_direction() {
        assert_eq!(
            sort_key_sql(&SortKey::desc(SortField::Priority)).unwrap(),
            "priority DESC"
        );
        assert_eq!(
            sort_key_sql(&SortKey::asc(SortField::Payload("key".into()))).unwrap(),
            "(payload -> 'key') ASC"
        );
        assert!(sort_key_sql(&SortKey::asc(SortField::Payload("k' OR 1=1".into()))).is_err());
    }
}
