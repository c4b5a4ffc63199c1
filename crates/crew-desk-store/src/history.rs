use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crew_desk_domain::{now_utc, DateTimeUtc, HistoryCategory, RecordId};
use serde::{Deserialize, Serialize};

use crate::fsio::{read_json, update_json};
use crate::StoreResult;

pub const DEFAULT_MAX_PER_CATEGORY: usize = 100;

const SCHEMA_VERSION: &str = "history.v1";

/// One pipeline run as recorded in the history log.
///
/// `output_exists` is never persisted; it is recomputed from the filesystem
/// whenever records are handed out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HistoryRecord {
    pub id: RecordId,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: DateTimeUtc,
    pub category: HistoryCategory,
    pub inputs: Vec<String>,
    pub output_path: Option<PathBuf>,
    pub succeeded: bool,
    pub error_message: Option<String>,
    #[serde(skip)]
    pub output_exists: bool,
}

impl HistoryRecord {
    fn refreshed(mut self) -> Self {
        self.output_exists = self.output_path.as_deref().is_some_and(Path::exists);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct CategoryStats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl CategoryStats {
    #[must_use]
    pub fn success_rate_label(&self) -> String {
        if self.total == 0 {
            return "0%".to_string();
        }
        #[allow(clippy::cast_precision_loss)]
        let rate = self.succeeded as f64 / self.total as f64 * 100.0;
        format!("{rate:.1}%")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct HistoryDocument {
    schema_version: String,
    categories: BTreeMap<HistoryCategory, Vec<HistoryRecord>>,
}

impl Default for HistoryDocument {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            categories: HistoryCategory::ALL
                .into_iter()
                .map(|category| (category, Vec::new()))
                .collect(),
        }
    }
}

/// JSON-file log of pipeline runs, newest first within each category.
#[derive(Debug)]
pub struct HistoryLog {
    path: PathBuf,
    max_per_category: usize,
    document: HistoryDocument,
}

impl HistoryLog {
    /// Open the log at `path`, starting empty when the file does not exist yet.
    ///
    /// # Errors
    /// Returns `StoreError` when the file exists but cannot be read or parsed.
    pub fn open(path: impl Into<PathBuf>, max_per_category: usize) -> StoreResult<Self> {
        let path = path.into();
        let document = read_json::<HistoryDocument>(&path)?.unwrap_or_default();
        tracing::debug!(
            path = %path.display(),
            records = document.categories.values().map(Vec::len).sum::<usize>(),
            "opened history log"
        );
        Ok(Self {
            path,
            max_per_category,
            document,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn max_per_category(&self) -> usize {
        self.max_per_category
    }

    /// Record a run at the front of its category, evicting the oldest beyond the cap.
    ///
    /// # Errors
    /// Returns `StoreError` when the log cannot be persisted; the log is then unchanged.
    pub fn add(
        &mut self,
        category: HistoryCategory,
        inputs: Vec<String>,
        output_path: Option<PathBuf>,
        succeeded: bool,
        error_message: Option<String>,
    ) -> StoreResult<HistoryRecord> {
        let record = HistoryRecord {
            id: RecordId::new(),
            timestamp: now_utc(),
            category,
            inputs,
            output_path,
            succeeded,
            error_message,
            output_exists: false,
        };

        let max = self.max_per_category;
        self.mutate(|document| {
            let records = document.categories.entry(category).or_default();
            records.insert(0, record.clone());
            if records.len() > max {
                let evicted = records.len() - max;
                records.truncate(max);
                tracing::debug!(category = %category, evicted, "evicted oldest history records");
            }
        })?;

        Ok(record.refreshed())
    }

    /// Records newest first, optionally narrowed to one category.
    ///
    /// A `limit` of zero yields no records.
    #[must_use]
    pub fn list(
        &self,
        category: Option<HistoryCategory>,
        limit: Option<usize>,
        succeeded_only: bool,
    ) -> Vec<HistoryRecord> {
        let mut records: Vec<&HistoryRecord> = match category {
            Some(category) => self
                .document
                .categories
                .get(&category)
                .map(|records| records.iter().collect())
                .unwrap_or_default(),
            None => {
                let mut all: Vec<&HistoryRecord> =
                    self.document.categories.values().flatten().collect();
                all.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
                all
            }
        };

        if succeeded_only {
            records.retain(|record| record.succeeded);
        }
        if let Some(limit) = limit {
            records.truncate(limit);
        }

        records
            .into_iter()
            .cloned()
            .map(HistoryRecord::refreshed)
            .collect()
    }

    #[must_use]
    pub fn get(&self, id: RecordId) -> Option<HistoryRecord> {
        self.document
            .categories
            .values()
            .flatten()
            .find(|record| record.id == id)
            .cloned()
            .map(HistoryRecord::refreshed)
    }

    /// Remove one record by id. Returns whether a record was removed.
    ///
    /// # Errors
    /// Returns `StoreError` when the log cannot be persisted.
    pub fn delete(&mut self, id: RecordId) -> StoreResult<bool> {
        self.mutate(|document| {
            let mut removed = false;
            for records in document.categories.values_mut() {
                let before = records.len();
                records.retain(|record| record.id != id);
                removed |= records.len() != before;
            }
            removed
        })
    }

    /// Drop every record in `category`, or in all categories when `None`.
    ///
    /// # Errors
    /// Returns `StoreError` when the log cannot be persisted.
    pub fn clear(&mut self, category: Option<HistoryCategory>) -> StoreResult<()> {
        self.mutate(|document| match category {
            Some(category) => {
                document.categories.insert(category, Vec::new());
            }
            None => *document = HistoryDocument::default(),
        })
    }

    #[must_use]
    pub fn statistics(&self) -> BTreeMap<HistoryCategory, CategoryStats> {
        let mut stats: BTreeMap<HistoryCategory, CategoryStats> = HistoryCategory::ALL
            .into_iter()
            .map(|category| (category, CategoryStats::default()))
            .collect();
        for (category, records) in &self.document.categories {
            let entry = stats.entry(*category).or_default();
            entry.total = records.len();
            entry.succeeded = records.iter().filter(|record| record.succeeded).count();
            entry.failed = entry.total - entry.succeeded;
        }
        stats
    }

    /// Apply `apply` to the on-disk document and adopt the result.
    fn mutate<R, F>(&mut self, apply: F) -> StoreResult<R>
    where
        F: FnOnce(&mut HistoryDocument) -> R,
    {
        let (document, result) = update_json(&self.path, apply)?;
        self.document = document;
        Ok(result)
    }
}
