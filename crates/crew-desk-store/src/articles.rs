use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crew_desk_domain::{now_utc, DateTimeUtc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::fsio::{read_json, update_json};
use crate::StoreResult;

/// How many of the most recent URLs the news hunt is told to skip.
pub const READ_ARTICLE_WINDOW: usize = 50;

const TRAILING_PUNCTUATION: [char; 7] = ['.', ',', ';', ':', '!', '?', '*'];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct ReadArticle {
    url: String,
    #[serde(with = "time::serde::rfc3339")]
    recorded_at: DateTimeUtc,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ArticleDocument {
    #[serde(default)]
    articles: Vec<ReadArticle>,
}

/// Articles already covered by earlier news reports, oldest first.
#[derive(Debug)]
pub struct ReadArticleLog {
    path: PathBuf,
    document: ArticleDocument,
}

impl ReadArticleLog {
    /// # Errors
    /// Returns `StoreError` when an existing file cannot be read or parsed.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let document = read_json::<ArticleDocument>(&path)?.unwrap_or_default();
        Ok(Self { path, document })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.document.articles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.document.articles.is_empty()
    }

    #[must_use]
    pub fn urls(&self) -> Vec<String> {
        self.document
            .articles
            .iter()
            .map(|article| article.url.clone())
            .collect()
    }

    /// The newest `count` URLs, oldest of those first.
    #[must_use]
    pub fn recent(&self, count: usize) -> Vec<String> {
        let skip = self.document.articles.len().saturating_sub(count);
        self.document
            .articles
            .iter()
            .skip(skip)
            .map(|article| article.url.clone())
            .collect()
    }

    /// Append URLs not seen before. Returns how many were added.
    ///
    /// URLs recorded through other handles since this one was opened count as seen.
    ///
    /// # Errors
    /// Returns `StoreError` when the log cannot be persisted; it is then unchanged.
    pub fn record<I, S>(&mut self, urls: I) -> StoreResult<usize>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let urls: Vec<String> = urls.into_iter().map(Into::into).collect();
        if urls.is_empty() {
            return Ok(0);
        }

        let recorded_at = now_utc();
        let (document, added) = update_json(&self.path, |document: &mut ArticleDocument| {
            let mut seen: HashSet<String> = document
                .articles
                .iter()
                .map(|article| article.url.clone())
                .collect();
            let before = document.articles.len();
            document.articles.extend(
                urls.into_iter()
                    .filter(|url| seen.insert(url.clone()))
                    .map(|url| ReadArticle { url, recorded_at }),
            );
            document.articles.len() - before
        })?;
        self.document = document;
        tracing::info!(added, total = self.len(), "recorded read articles");
        Ok(added)
    }

    /// # Errors
    /// Returns `StoreError` when the empty log cannot be persisted.
    pub fn clear(&mut self) -> StoreResult<()> {
        let (document, ()) = update_json(&self.path, |document: &mut ArticleDocument| {
            *document = ArticleDocument::default();
        })?;
        self.document = document;
        Ok(())
    }
}

fn url_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r#"https?://[^\s<>()\[\]"'`]+"#).ok())
        .as_ref()
}

/// Distinct http(s) URLs in `text`, in order of first appearance.
#[must_use]
pub fn extract_urls(text: &str) -> Vec<String> {
    let Some(pattern) = url_pattern() else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    pattern
        .find_iter(text)
        .map(|m| m.as_str().trim_end_matches(TRAILING_PUNCTUATION))
        .filter(|url| seen.insert(url.to_string()))
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{extract_urls, ReadArticleLog};

    #[test]
    fn extract_urls_from_markdown_report() {
        let report = "1. [Model release](https://example.com/a?x=1). See https://example.org/b, \
                      and again (https://example.com/a?x=1).";
        assert_eq!(
            extract_urls(report),
            vec![
                "https://example.com/a?x=1".to_string(),
                "https://example.org/b".to_string(),
            ]
        );
    }

    #[test]
    fn record_skips_known_urls_and_recent_is_windowed() {
        let path = std::env::temp_dir()
            .join(format!("crew-desk-articles-{}", ulid::Ulid::new()))
            .join("read_articles.json");
        let mut log = ReadArticleLog::open(&path).unwrap_or_else(|_| unreachable!());
        assert!(log.is_empty());

        assert!(matches!(log.record(["u1", "u2", "u1"]), Ok(2)));
        assert!(matches!(log.record(["u2", "u3"]), Ok(1)));
        assert_eq!(log.recent(2), vec!["u2".to_string(), "u3".to_string()]);

        let reopened = ReadArticleLog::open(&path).unwrap_or_else(|_| unreachable!());
        assert_eq!(reopened.len(), 3);

        assert!(log.clear().is_ok());
        assert!(ReadArticleLog::open(&path)
            .unwrap_or_else(|_| unreachable!())
            .is_empty());
    }

    #[test]
    fn urls_recorded_by_another_handle_are_not_duplicated() {
        let path = std::env::temp_dir()
            .join(format!("crew-desk-articles-{}", ulid::Ulid::new()))
            .join("read_articles.json");
        let mut first = ReadArticleLog::open(&path).unwrap_or_else(|err| panic!("{err}"));
        let mut second = ReadArticleLog::open(&path).unwrap_or_else(|err| panic!("{err}"));

        assert!(matches!(first.record(["u1"]), Ok(1)));
        assert!(matches!(second.record(["u1", "u2"]), Ok(1)));
        assert_eq!(second.urls(), vec!["u1".to_string(), "u2".to_string()]);
    }
}
