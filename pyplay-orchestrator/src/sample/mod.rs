//! Sample cache: lazily fetched, memoized example programs
//!
//! A sample's text is fetched on first use and kept for the rest of the session.
//! Failed fetches leave nothing behind, so the next call simply tries again.

mod fetch;

#[cfg(test)]
pub(crate) mod gated;

pub use fetch::{FetchError, Fetcher, FsFetcher, HttpFetcher, PreloadedFetcher};

use crate::manifest::Manifest;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Errors from loading a sample
#[derive(Error, Debug)]
pub enum SampleError {
    #[error("Sample not found: {0}")]
    NotFound(String),

    #[error("Failed to fetch sample '{id}': {source}")]
    FetchFailed {
        id: String,
        #[source]
        source: FetchError,
    },
}

/// A loaded example program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub id: String,
    pub display_name: String,
    pub group: String,
    pub source_path: String,
    pub source_text: String,
}

/// Memoizing loader for manifest samples
pub struct SampleCache {
    manifest: Arc<Manifest>,
    fetcher: Arc<dyn Fetcher>,
    entries: DashMap<String, Arc<Sample>>,
}

impl SampleCache {
    pub fn new(manifest: Arc<Manifest>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            manifest,
            fetcher,
            entries: DashMap::new(),
        }
    }

    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.manifest
    }

    /// Load a sample by id, fetching it on first use
    pub async fn load_sample(&self, id: &str) -> Result<Arc<Sample>, SampleError> {
        if let Some(cached) = self.get(id) {
            debug!(sample = id, "Sample cache hit");
            return Ok(cached);
        }

        let entry = self
            .manifest
            .find(id)
            .ok_or_else(|| SampleError::NotFound(id.to_string()))?;

        debug!(sample = id, path = %entry.path, "Sample cache miss, fetching");
        let text = self
            .fetcher
            .fetch(&entry.path)
            .await
            .map_err(|source| SampleError::FetchFailed {
                id: id.to_string(),
                source,
            })?;

        let sample = Arc::new(Sample {
            id: entry.id.clone(),
            display_name: entry.display_name.clone(),
            group: entry.group.clone(),
            source_path: entry.path.clone(),
            source_text: text,
        });

        // Two uncached loads of one id may race; the first stored text stays
        let stored = Arc::clone(
            self.entries
                .entry(id.to_string())
                .or_insert(sample)
                .value(),
        );
        info!(sample = id, bytes = stored.source_text.len(), "Sample loaded");
        Ok(stored)
    }

    /// Cached sample, without fetching
    pub fn get(&self, id: &str) -> Option<Arc<Sample>> {
        self.entries.get(id).map(|s| Arc::clone(s.value()))
    }

    pub fn is_cached(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Number of cached samples
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::SampleEntry;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Serves fixed texts and records every path it was asked for
    struct RecordingFetcher {
        texts: HashMap<String, String>,
        calls: Mutex<Vec<String>>,
        fail: Mutex<bool>,
    }

    impl RecordingFetcher {
        fn new(texts: &[(&str, &str)]) -> Self {
            Self {
                texts: texts
                    .iter()
                    .map(|(p, t)| (p.to_string(), t.to_string()))
                    .collect(),
                calls: Mutex::new(Vec::new()),
                fail: Mutex::new(false),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn set_failing(&self, fail: bool) {
            *self.fail.lock().unwrap() = fail;
        }
    }

    #[async_trait]
    impl Fetcher for RecordingFetcher {
        async fn fetch(&self, path: &str) -> Result<String, FetchError> {
            self.calls.lock().unwrap().push(path.to_string());
            if *self.fail.lock().unwrap() {
                return Err(FetchError::Status {
                    url: path.to_string(),
                    status: 503,
                });
            }
            self.texts.get(path).cloned().ok_or_else(|| FetchError::Status {
                url: path.to_string(),
                status: 404,
            })
        }
    }

    fn manifest() -> Arc<Manifest> {
        Arc::new(
            Manifest::new(vec![
                SampleEntry::new("-", "Add", "test-add", "../test_add.py"),
                SampleEntry::new("-", "For loop", "test-for", "../test_for.py"),
            ])
            .unwrap(),
        )
    }

    fn fetcher() -> Arc<RecordingFetcher> {
        Arc::new(RecordingFetcher::new(&[
            ("../test_add.py", "print(114 + 514)\n"),
            ("../test_for.py", "for i in range(3):\n    print(i)\n"),
        ]))
    }

    #[tokio::test]
    async fn test_load_fetches_once() {
        let fetcher = fetcher();
        let cache = SampleCache::new(manifest(), fetcher.clone());

        let first = cache.load_sample("test-add").await.unwrap();
        assert_eq!(first.source_text, "print(114 + 514)\n");
        assert_eq!(first.display_name, "Add");

        for _ in 0..3 {
            let again = cache.load_sample("test-add").await.unwrap();
            assert_eq!(again.source_text, first.source_text);
        }
        assert_eq!(fetcher.calls(), vec!["../test_add.py".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_id_not_found() {
        let fetcher = fetcher();
        let cache = SampleCache::new(manifest(), fetcher.clone());

        let err = cache.load_sample("test-missing").await.unwrap_err();
        assert!(matches!(err, SampleError::NotFound(ref id) if id == "test-missing"));
        assert!(cache.is_empty());
        assert!(fetcher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_failure_not_cached_and_retried() {
        let fetcher = fetcher();
        let cache = SampleCache::new(manifest(), fetcher.clone());

        fetcher.set_failing(true);
        let err = cache.load_sample("test-for").await.unwrap_err();
        assert!(matches!(err, SampleError::FetchFailed { .. }));
        assert!(!cache.is_cached("test-for"));

        fetcher.set_failing(false);
        let sample = cache.load_sample("test-for").await.unwrap();
        assert!(sample.source_text.starts_with("for i"));
        assert_eq!(fetcher.calls().len(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_samples_cached_independently() {
        let cache = SampleCache::new(manifest(), fetcher());
        cache.load_sample("test-add").await.unwrap();
        assert!(cache.is_cached("test-add"));
        assert!(!cache.is_cached("test-for"));
        assert!(cache.get("test-for").is_none());
    }
}
