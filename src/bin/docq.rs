//! docq CLI: operator interface to queue collections.

use clap::{Parser, Subcommand};
use docq::config::secrets::ExposeSecret;
use docq::config::{Config, QueueRegistry};
use docq::model::{PutOutcome, Selector, TaskDocument, TaskId};
use docq::schema::Payload;
use docq::store::{Db, PgCollection};
use docq::telemetry::{TelemetryConfig, init_telemetry};
use docq::Queue;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "docq", about = "Priority task queue over document collections")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the queue definitions found in the queue directory
    Queues,
    /// Create the queue's collection and indexes
    Init {
        /// Queue name
        queue: String,
    },
    /// Submit one task
    Put {
        /// Queue name
        queue: String,
        /// JSON object payload
        payload: String,
        /// Priority (higher = more urgent)
        #[arg(long, default_value_t = 0)]
        priority: i32,
        /// Payload field to deduplicate on (repeatable)
        #[arg(long = "dedup")]
        dedup: Vec<String>,
    },
    /// Show the next tasks in queue order
    Get {
        /// Queue name
        queue: String,
        /// Maximum tasks to show
        #[arg(long, default_value_t = 10)]
        limit: usize,
        /// Include finished tasks
        #[arg(long)]
        all: bool,
        /// Payload filter `field=value` (value parsed as JSON, else string)
        #[arg(long = "where")]
        filters: Vec<String>,
    },
    /// Mark a task done
    Done {
        /// Queue name
        queue: String,
        /// Task ID
        id: String,
    },
    /// Delete a task
    Delete {
        /// Queue name
        queue: String,
        /// Task ID
        id: String,
    },
    /// Upsert tasks from a JSON array or JSON-lines file
    Bulk {
        /// Queue name
        queue: String,
        /// Input file
        file: PathBuf,
        /// Payload field used as the dedup key
        #[arg(long)]
        key: String,
        /// Priority applied to the whole batch
        #[arg(long, default_value_t = 0)]
        priority: i32,
    },
    /// Count tasks
    Size {
        /// Queue name
        queue: String,
        /// Count only pending tasks
        #[arg(long)]
        pending: bool,
    },
}

impl Command {
    fn queue(&self) -> Option<&str> {
        match self {
            Command::Queues => None,
            Command::Init { queue }
            | Command::Put { queue, .. }
            | Command::Get { queue, .. }
            | Command::Done { queue, .. }
            | Command::Delete { queue, .. }
            | Command::Bulk { queue, .. }
            | Command::Size { queue, .. } => Some(queue),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "docq".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let registry = QueueRegistry::load_from_dir(&config.queue_dir)?;

    let Some(name) = cli.command.queue() else {
        for name in registry.names() {
            println!("{name}");
        }
        return Ok(());
    };
    let Some(queue_config) = registry.get(name) else {
        anyhow::bail!(
            "no queue named '{name}' in {}",
            config.queue_dir.display()
        );
    };

    let db = Db::connect(config.database_url.expose_secret(), &config.connect_options()).await?;
    let queue = db.open_queue(queue_config.clone()).await?;

    match cli.command {
        Command::Queues => Ok(()),
        Command::Init { .. } => cmd_init(&queue).await,
        Command::Put {
            payload,
            priority,
            dedup,
            ..
        } => cmd_put(&queue, &payload, priority, &dedup).await,
        Command::Get {
            limit,
            all,
            filters,
            ..
        } => cmd_get(&queue, limit, all, &filters).await,
        Command::Done { id, .. } => cmd_done(&queue, &id).await,
        Command::Delete { id, .. } => cmd_delete(&queue, &id).await,
        Command::Bulk {
            file,
            key,
            priority,
            ..
        } => cmd_bulk(&queue, &file, &key, priority).await,
        Command::Size { pending, .. } => cmd_size(&queue, pending).await,
    }
}

async fn cmd_init(queue: &Queue<PgCollection>) -> anyhow::Result<()> {
    let indexes = queue.create_indexes().await?;
    println!("Collection: {}", queue.name());
    for index in indexes {
        println!("Index:      {index}");
    }
    Ok(())
}

async fn cmd_put(
    queue: &Queue<PgCollection>,
    payload: &str,
    priority: i32,
    dedup: &[String],
) -> anyhow::Result<()> {
    let payload = parse_payload(payload)?;
    let keys: Vec<&str> = dedup.iter().map(String::as_str).collect();

    let outcome = if keys.is_empty() {
        queue.put(payload, priority, Selector::new()).await?
    } else {
        queue.put_keyed(payload, priority, &keys).await?
    };

    match outcome {
        PutOutcome::Inserted(doc) => println!("Inserted: {} (priority {})", doc.id, doc.priority),
        PutOutcome::Existing(doc) => println!("Exists:   {} (no new task)", doc.id),
    }
    Ok(())
}

async fn cmd_get(
    queue: &Queue<PgCollection>,
    limit: usize,
    all: bool,
    filters: &[String],
) -> anyhow::Result<()> {
    let mut selector = if all {
        Selector::new()
    } else {
        Selector::pending()
    };
    for filter in filters {
        let Some((field, raw)) = filter.split_once('=') else {
            anyhow::bail!("filter '{filter}' is not field=value");
        };
        let value = serde_json::from_str(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
        selector = selector.payload_eq(field, value);
    }

    let docs = queue.get(limit, selector).await?;
    if docs.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<4}  {:<16}  {:<16}  PAYLOAD",
        "ID", "PRI", "CREATED", "FINISHED"
    );
    println!("{}", "-".repeat(100));
    for doc in &docs {
        print_row(doc)?;
    }
    println!("\n{} task(s)", docs.len());
    Ok(())
}

fn print_row(doc: &TaskDocument) -> anyhow::Result<()> {
    let finished = doc
        .finished_at
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{:<36}  {:<4}  {:<16}  {:<16}  {}",
        doc.id,
        doc.priority,
        doc.created_at.format("%Y-%m-%d %H:%M"),
        finished,
        serde_json::to_string(&doc.payload)?
    );
    Ok(())
}

async fn cmd_done(queue: &Queue<PgCollection>, id: &str) -> anyhow::Result<()> {
    let id: TaskId = id.parse()?;
    let outcome = queue.mark_done(Selector::by_id(id)).await?;
    if outcome.matched == 0 {
        println!("No task {id}");
    } else {
        println!("Done: {id}");
    }
    Ok(())
}

async fn cmd_delete(queue: &Queue<PgCollection>, id: &str) -> anyhow::Result<()> {
    let id: TaskId = id.parse()?;
    let outcome = queue.delete(Selector::by_id(id)).await?;
    println!("Deleted {} task(s)", outcome.deleted);
    Ok(())
}

async fn cmd_bulk(
    queue: &Queue<PgCollection>,
    file: &Path,
    key: &str,
    priority: i32,
) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(file)?;
    let payloads = parse_batch(&content)?;
    let outcome = queue.put_bulk(payloads, key, priority).await?;
    println!(
        "Inserted: {}  Updated: {}  Total: {}",
        outcome.inserted,
        outcome.updated,
        outcome.total()
    );
    Ok(())
}

async fn cmd_size(queue: &Queue<PgCollection>, pending: bool) -> anyhow::Result<()> {
    let n = if pending {
        queue.count(Selector::pending()).await?
    } else {
        queue.size().await?
    };
    println!("{n}");
    Ok(())
}

fn parse_payload(raw: &str) -> anyhow::Result<Payload> {
    match serde_json::from_str(raw)? {
        serde_json::Value::Object(map) => Ok(map),
        other => anyhow::bail!("payload must be a JSON object, got {other}"),
    }
}

/// A JSON array of objects, or one object per line.
fn parse_batch(content: &str) -> anyhow::Result<Vec<Payload>> {
    if content.trim_start().starts_with('[') {
        let values: Vec<serde_json::Value> = serde_json::from_str(content)?;
        return values
            .into_iter()
            .map(|v| parse_payload(&v.to_string()))
            .collect();
    }
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_payload)
        .collect()
}
