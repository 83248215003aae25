//! Selection router: selection -> sample load -> source buffer
//!
//! Every selection bumps a [`GenerationToken`] and starts a load task tagged
//! with it. Finished loads come back as [`LoadOutcome`]s over a channel and
//! are applied only while their token is still current, so a quick run of
//! selections ends with the last one in the buffer whatever order the
//! fetches complete in.

use crate::editor::SourceBuffer;
use crate::sample::{Sample, SampleCache, SampleError};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Selection generation; only the latest one may touch the buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GenerationToken(u64);

impl GenerationToken {
    fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for GenerationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// A finished sample load
#[derive(Debug)]
pub struct LoadOutcome {
    pub generation: GenerationToken,
    pub id: String,
    pub result: Result<Arc<Sample>, SampleError>,
}

/// What happened to a load outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// The sample's text is now in the buffer
    Loaded(Arc<Sample>),
    /// Superseded by a later selection; nothing changed
    Stale,
}

/// Sample id addressed by a fragment such as `#test-add`; `None` when empty
pub fn parse_fragment(fragment: &str) -> Option<&str> {
    let id = fragment.trim().trim_start_matches('#').trim();
    (!id.is_empty()).then_some(id)
}

pub struct SelectionRouter {
    cache: Arc<SampleCache>,
    default_id: String,
    current: GenerationToken,
    selected: Option<String>,
    in_flight: usize,
    outcomes_tx: mpsc::UnboundedSender<LoadOutcome>,
    outcomes_rx: mpsc::UnboundedReceiver<LoadOutcome>,
}

impl SelectionRouter {
    /// Router over `cache`; an empty fragment selects `default_id`, or the
    /// manifest's first entry when that is `None`
    pub fn new(cache: Arc<SampleCache>, default_id: Option<String>) -> Self {
        let default_id =
            default_id.unwrap_or_else(|| cache.manifest().default_id().to_string());
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        Self {
            cache,
            default_id,
            current: GenerationToken::default(),
            selected: None,
            in_flight: 0,
            outcomes_tx,
            outcomes_rx,
        }
    }

    /// Select `id` and start loading it. Must be called inside a tokio runtime.
    pub fn select(&mut self, id: impl Into<String>) -> GenerationToken {
        let id = id.into();
        self.current = self.current.next();
        let generation = self.current;
        self.selected = Some(id.clone());
        self.in_flight += 1;
        debug!(sample = %id, generation = generation.value(), "Selection changed");

        let cache = Arc::clone(&self.cache);
        let tx = self.outcomes_tx.clone();
        tokio::spawn(async move {
            let result = cache.load_sample(&id).await;
            // The router may be gone already; nothing to deliver to then
            let _ = tx.send(LoadOutcome {
                generation,
                id,
                result,
            });
        });
        generation
    }

    /// Select whatever the address fragment names
    pub fn select_fragment(&mut self, fragment: &str) -> GenerationToken {
        let id = self.resolve_fragment(fragment).to_string();
        self.select(id)
    }

    /// Id a fragment selects, falling back to the default sample
    pub fn resolve_fragment<'a>(&'a self, fragment: &'a str) -> &'a str {
        parse_fragment(fragment).unwrap_or(&self.default_id)
    }

    /// Next finished load, in completion order
    pub async fn next_outcome(&mut self) -> LoadOutcome {
        match self.outcomes_rx.recv().await {
            Some(outcome) => {
                self.in_flight = self.in_flight.saturating_sub(1);
                outcome
            }
            // The router holds a sender, so the channel never closes
            None => std::future::pending().await,
        }
    }

    /// Apply a finished load to `buffer` if it is still current
    ///
    /// A stale outcome is dropped silently, failed or not. A current failure
    /// is returned and leaves the buffer untouched.
    pub fn apply(
        &mut self,
        outcome: LoadOutcome,
        buffer: &mut SourceBuffer,
    ) -> Result<Applied, SampleError> {
        if outcome.generation != self.current {
            debug!(
                sample = %outcome.id,
                generation = outcome.generation.value(),
                current = self.current.value(),
                "Discarding stale sample load"
            );
            return Ok(Applied::Stale);
        }

        let sample = outcome.result.inspect_err(|e| {
            warn!(sample = %outcome.id, "Sample load failed: {}", e);
        })?;
        buffer.set_value(sample.source_text.as_str());
        info!(sample = %sample.id, "Sample applied to editor");
        Ok(Applied::Loaded(sample))
    }

    pub fn current(&self) -> GenerationToken {
        self.current
    }

    /// Id of the latest selection
    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn default_id(&self) -> &str {
        &self.default_id
    }

    /// Whether any started load has not been received yet
    pub fn is_loading(&self) -> bool {
        self.in_flight > 0
    }

    pub fn cache(&self) -> &Arc<SampleCache> {
        &self.cache
    }
}
