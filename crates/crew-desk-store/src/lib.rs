#![forbid(unsafe_code)]

use std::path::PathBuf;

use thiserror::Error;

mod articles;
mod fsio;
mod history;
mod prompts;

pub use articles::{extract_urls, ReadArticleLog, READ_ARTICLE_WINDOW};
pub use history::{CategoryStats, HistoryLog, HistoryRecord, DEFAULT_MAX_PER_CATEGORY};
pub use prompts::{PromptOverrides, DEFAULT_GLOBAL_RULES};

/// Failure of a durable store read or write.
///
/// A store that returns one of these from a mutating call keeps its previous
/// in-memory state.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("store document at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize store document: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;
