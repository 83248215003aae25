//! Fetchers: "give me the text at this path, or fail"

use async_trait::async_trait;
use reqwest::{Client, Url};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Transport-level failure while fetching sample text
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("GET {url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid sample path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },
}

/// Source of sample text
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Return the full text at `path`
    async fn fetch(&self, path: &str) -> Result<String, FetchError>;
}

/// Reads sample paths relative to a directory
pub struct FsFetcher {
    root: PathBuf,
}

impl FsFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Fetcher for FsFetcher {
    async fn fetch(&self, path: &str) -> Result<String, FetchError> {
        let full = self.root.join(path);
        debug!(path = %full.display(), "Reading sample from disk");
        tokio::fs::read_to_string(&full)
            .await
            .map_err(|source| FetchError::Io {
                path: full.display().to_string(),
                source,
            })
    }
}

/// Fetches sample paths over HTTP, resolving them against a base URL
pub struct HttpFetcher {
    client: Client,
    base_url: Url,
}

impl HttpFetcher {
    /// Create a fetcher; relative paths such as `../test_add.py` resolve like
    /// links on a page served from `base_url`
    pub fn new(base_url: &str) -> Result<Self, FetchError> {
        let base_url = Url::parse(base_url).map_err(|e| FetchError::InvalidPath {
            path: base_url.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            client: Client::builder().build()?,
            base_url,
        })
    }

    fn resolve(&self, path: &str) -> Result<Url, FetchError> {
        self.base_url
            .join(path)
            .map_err(|e| FetchError::InvalidPath {
                path: path.to_string(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, path: &str) -> Result<String, FetchError> {
        let url = self.resolve(path)?;
        debug!(url = %url, "Fetching sample over HTTP");

        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        Ok(response.text().await?)
    }
}

/// Serves inline, pre-supplied texts without a round trip and falls through to
/// `inner` for everything else
pub struct PreloadedFetcher {
    preloaded: HashMap<String, String>,
    inner: Arc<dyn Fetcher>,
}

impl PreloadedFetcher {
    pub fn new(preloaded: HashMap<String, String>, inner: Arc<dyn Fetcher>) -> Self {
        Self { preloaded, inner }
    }

    pub fn is_preloaded(&self, path: &str) -> bool {
        self.preloaded.contains_key(path)
    }
}

#[async_trait]
impl Fetcher for PreloadedFetcher {
    async fn fetch(&self, path: &str) -> Result<String, FetchError> {
        if let Some(text) = self.preloaded.get(path) {
            debug!(path, "Serving preloaded sample");
            return Ok(text.clone());
        }
        self.inner.fetch(path).await
    }
}
