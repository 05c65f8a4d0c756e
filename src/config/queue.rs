//! Queue type definitions.
//!
//! A queue type is data, not code: a collection name, a payload schema, a
//! sort specification and the indexes to provision. Definitions are loaded
//! from TOML:
//!
//! ```toml
//! [queue]
//! name = "crawl_tasks"
//! sort = [{ field = "priority", direction = "desc" }, { field = "created_at" }]
//!
//! [queue.schema]
//! key = { type = "string", required = true }
//! default_value = { type = "string", default = "nope" }
//! ```

use crate::error::{Error, Result};
use crate::model::{IndexSpec, SortSpec};
use crate::schema::{FieldRule, Schema};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct QueueFile {
    queue: RawQueueConfig,
}

#[derive(Debug, Deserialize)]
struct RawQueueConfig {
    name: String,
    #[serde(default)]
    allow_unknown: bool,
    #[serde(default)]
    schema: BTreeMap<String, FieldRule>,
    #[serde(default)]
    sort: SortSpec,
    #[serde(default = "IndexSpec::recommended")]
    indexes: Vec<IndexSpec>,
}

/// Everything that distinguishes one queue type from another.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Collection (table) name.
    pub name: String,
    pub schema: Schema,
    pub sort: SortSpec,
    pub indexes: Vec<IndexSpec>,
}

impl QueueConfig {
    /// Default sort and the recommended indexes.
    pub fn new(name: impl Into<String>, schema: Schema) -> Self {
        Self {
            name: name.into(),
            schema,
            sort: SortSpec::default(),
            indexes: IndexSpec::recommended(),
        }
    }

    pub fn with_sort(mut self, sort: SortSpec) -> Self {
        self.sort = sort;
        self
    }

    pub fn with_indexes(mut self, indexes: Vec<IndexSpec>) -> Self {
        self.indexes = indexes;
        self
    }

    /// Parse a `[queue]` TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: QueueFile = toml::from_str(content)
            .map_err(|e| Error::Config(format!("bad queue config: {e}")))?;
        Self::try_from(file.queue)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }
}

impl TryFrom<RawQueueConfig> for QueueConfig {
    type Error = Error;

    fn try_from(raw: RawQueueConfig) -> Result<Self> {
        if raw.name.trim().is_empty() {
            return Err(Error::Config("queue name must not be empty".to_string()));
        }
        let schema = Schema::from_fields(raw.schema).allow_unknown(raw.allow_unknown);
        schema.validate_defaults()?;
        Ok(Self {
            name: raw.name,
            schema,
            sort: raw.sort,
            indexes: raw.indexes,
        })
    }
}

/// Loaded queue definitions, indexed by name.
#[derive(Debug, Default)]
pub struct QueueRegistry {
    queues: HashMap<String, QueueConfig>,
}

impl QueueRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load all `.toml` files from a directory.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let mut registry = Self::empty();

        let entries = std::fs::read_dir(dir).map_err(|e| {
            Error::Config(format!("cannot read queue dir {}: {e}", dir.display()))
        })?;

        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "toml") {
                registry.insert(QueueConfig::load(&path)?)?;
            }
        }

        Ok(registry)
    }

    /// Add a definition; names must be unique.
    pub fn insert(&mut self, config: QueueConfig) -> Result<()> {
        if self.queues.contains_key(&config.name) {
            return Err(Error::Config(format!(
                "queue '{}' is defined more than once",
                config.name
            )));
        }
        self.queues.insert(config.name.clone(), config);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&QueueConfig> {
        self.queues.get(name)
    }

    /// Sorted queue names.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.queues.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
