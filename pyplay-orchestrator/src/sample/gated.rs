//! Fetcher whose responses are released by the test, in any order

use super::fetch::{FetchError, Fetcher};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;

pub(crate) type Gate = oneshot::Sender<Result<String, FetchError>>;

#[derive(Default)]
pub(crate) struct GatedFetcher {
    waiting: Mutex<HashMap<String, oneshot::Receiver<Result<String, FetchError>>>>,
}

impl GatedFetcher {
    /// Arm `path`; its fetch resolves with whatever is sent through the gate
    pub(crate) fn gate(&self, path: &str) -> Gate {
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().unwrap().insert(path.to_string(), rx);
        tx
    }
}

/// Failure a gate can release
pub(crate) fn unreachable(path: &str) -> FetchError {
    FetchError::Status {
        url: format!("http://samples.invalid/{path}"),
        status: 503,
    }
}

#[async_trait]
impl Fetcher for GatedFetcher {
    async fn fetch(&self, path: &str) -> Result<String, FetchError> {
        let rx = self.waiting.lock().unwrap().remove(path);
        match rx {
            Some(rx) => rx.await.unwrap_or_else(|_| Err(unreachable(path))),
            None => Err(unreachable(path)),
        }
    }
}
