//! Index provisioning.
//!
//! Creates the secondary indexes a queue's retrieval pattern needs. Runs once
//! at setup; creating an index that already exists is a no-op.

use std::collections::HashSet;

use crate::error::Result;
use crate::model::{IndexSpec, SortSpec};
use crate::store::Collection;

/// Ensures index specifications exist on one collection.
pub struct IndexManager<'a, C: ?Sized> {
    collection: &'a C,
}

impl<'a, C: Collection + ?Sized> IndexManager<'a, C> {
    pub fn new(collection: &'a C) -> Self {
        Self { collection }
    }

    /// Create every index in `specs` that does not exist yet. Returns the
    /// index names in declaration order, duplicates dropped.
    pub async fn ensure(&self, specs: &[IndexSpec]) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        let mut names = Vec::with_capacity(specs.len());

        for spec in specs {
            if !seen.insert(spec.name(self.collection.name())) {
                continue;
            }
            let name = self.collection.create_index(spec).await?;
            tracing::debug!(collection = self.collection.name(), index = %name, "index ensured");
            names.push(name);
        }

        Ok(names)
    }
}

/// True when some index leads with the sort's first field. A single-column
/// btree serves both directions.
pub fn covers_sort(indexes: &[IndexSpec], sort: &SortSpec) -> bool {
    let Some(first) = sort.keys().first() else {
        return true;
    };
    indexes
        .iter()
        .any(|index| index.keys().first().is_some_and(|k| k.field == first.field))
}
