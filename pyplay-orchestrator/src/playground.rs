//! Playground: the UI controller
//!
//! Composes the execution proxy, the selection router and the source buffer.
//! Everything runs on one task; [`Playground::step`] waits for the next
//! channel delivery or sample load and applies it before returning, so state
//! only changes between steps.

use crate::context::interpreter_factory;
use crate::editor::SourceBuffer;
use crate::manifest::Manifest;
use crate::output::{OutputBuffer, OutputSink};
use crate::protocol::RequestId;
use crate::proxy::{ExecutionProxy, LifecycleEvent, ProxyError, ProxyState};
use crate::router::{Applied, GenerationToken, LoadOutcome, SelectionRouter};
use crate::sample::Sample;
use crate::{ConfigError, PlaygroundConfig};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info};

/// Appended to the output panel once the interpreter is up
pub const READY_BANNER: &str = "Python runtime initialization complete\n";

/// Finished runs remembered for status queries
const RUN_HISTORY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Error,
}

/// User-visible message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub severity: Severity,
    pub message: String,
}

impl Notification {
    fn info(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Info,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
        }
    }
}

/// Where a run is in its lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Finished,
    Failed { error: String },
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Finished | RunStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunRecord {
    pub id: RequestId,
    #[serde(flatten)]
    pub status: RunStatus,
}

/// Something a step changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaygroundEvent {
    Lifecycle(LifecycleEvent),
    SampleLoaded(Arc<Sample>),
    SampleFailed { id: String, error: String },
    StaleLoadDiscarded { id: String },
}

pub struct Playground<S: OutputSink = OutputBuffer> {
    proxy: ExecutionProxy<S>,
    router: SelectionRouter,
    source: SourceBuffer,
    notifications: Vec<Notification>,
    runs: VecDeque<RunRecord>,
}

impl Playground<OutputBuffer> {
    /// Playground with an output panel buffer, built from configuration. The
    /// panel greets with [`READY_BANNER`] once the interpreter is up.
    pub fn from_config(config: &PlaygroundConfig) -> Result<Self, ConfigError> {
        let mut playground = Self::from_config_with_sink(config, OutputBuffer::new())?;
        playground
            .proxy
            .set_ready_banner(Some(READY_BANNER.to_string()));
        Ok(playground)
    }
}

impl<S: OutputSink> Playground<S> {
    pub fn from_config_with_sink(config: &PlaygroundConfig, sink: S) -> Result<Self, ConfigError> {
        let manifest = Arc::new(config.load_manifest()?);
        let cache = Arc::new(config.sample_cache(manifest)?);
        let router = SelectionRouter::new(cache, config.default_sample.clone());
        let proxy = ExecutionProxy::with_sink(
            interpreter_factory(&config.interpreter),
            config.interpreter.output,
            sink,
        )
        .max_request_id(config.max_request_id);
        Ok(Self::new(proxy, router))
    }

    pub fn new(proxy: ExecutionProxy<S>, router: SelectionRouter) -> Self {
        Self {
            proxy,
            router,
            source: SourceBuffer::new(),
            notifications: Vec::new(),
            runs: VecDeque::new(),
        }
    }

    /// Page-load behaviour: bring the context up and select what the fragment
    /// names (the default sample when it is empty)
    pub fn start(&mut self, fragment: &str) -> GenerationToken {
        if let Err(e) = self.proxy.initialize() {
            self.notify(Notification::error(e.to_string()));
        }
        let generation = self.router.select_fragment(fragment);
        info!(sample = self.router.selected().unwrap_or_default(), "Playground started");
        generation
    }

    pub fn select(&mut self, id: impl Into<String>) -> GenerationToken {
        self.router.select(id)
    }

    pub fn select_fragment(&mut self, fragment: &str) -> GenerationToken {
        self.router.select_fragment(fragment)
    }

    /// Run the current editor text
    pub fn run(&mut self) -> Result<RequestId, ProxyError> {
        let snapshot = self.source.snapshot();
        self.run_source(snapshot)
    }

    /// Run `source` without touching the editor
    pub fn run_source(&mut self, source: impl Into<String>) -> Result<RequestId, ProxyError> {
        match self.proxy.run(source) {
            Ok(id) => {
                self.record(id, RunStatus::Pending);
                Ok(id)
            }
            Err(e) => {
                self.notify(Notification::error(e.to_string()));
                Err(e)
            }
        }
    }

    /// Wait for the next message or load, apply it and report what changed
    pub async fn step(&mut self) -> Vec<PlaygroundEvent> {
        tokio::select! {
            events = self.proxy.process_next() => {
                events.into_iter().map(|e| self.on_lifecycle(e)).collect()
            }
            outcome = self.router.next_outcome() => vec![self.on_load(outcome)],
        }
    }

    /// Nothing in flight: no pending load, no outstanding run, context not
    /// starting. `step` would wait for outside input.
    pub fn is_idle(&self) -> bool {
        !self.router.is_loading()
            && !self.proxy.is_busy()
            && *self.proxy.state() != ProxyState::Starting
    }

    /// Step until idle, collecting events
    pub async fn settle(&mut self) -> Vec<PlaygroundEvent> {
        let mut events = Vec::new();
        while !self.is_idle() {
            events.extend(self.step().await);
        }
        events
    }

    /// Step until run `id` reaches a terminal status
    pub async fn wait_for(&mut self, id: RequestId) -> RunStatus {
        loop {
            match self.run_status(id) {
                Some(status) if status.is_terminal() => return status,
                None => {
                    return RunStatus::Failed {
                        error: format!("unknown run {}", id),
                    };
                }
                _ => {}
            }
            self.step().await;
        }
    }

    fn on_lifecycle(&mut self, event: LifecycleEvent) -> PlaygroundEvent {
        match &event {
            LifecycleEvent::Ready => self.notify(Notification::info("Interpreter ready")),
            LifecycleEvent::Unavailable { error } => {
                self.notify(Notification::error(format!("Interpreter unavailable: {}", error)));
            }
            LifecycleEvent::Started { id } => self.record(*id, RunStatus::Running),
            LifecycleEvent::Finished { id } => self.record(*id, RunStatus::Finished),
            LifecycleEvent::Failed { id, error } => {
                self.record(
                    *id,
                    RunStatus::Failed {
                        error: error.clone(),
                    },
                );
                self.notify(Notification::error(format!("Run {} failed: {}", id, error)));
            }
        }
        PlaygroundEvent::Lifecycle(event)
    }

    fn on_load(&mut self, outcome: LoadOutcome) -> PlaygroundEvent {
        let id = outcome.id.clone();
        match self.router.apply(outcome, &mut self.source) {
            Ok(Applied::Loaded(sample)) => PlaygroundEvent::SampleLoaded(sample),
            Ok(Applied::Stale) => PlaygroundEvent::StaleLoadDiscarded { id },
            Err(e) => {
                let error = e.to_string();
                self.notify(Notification::error(error.clone()));
                PlaygroundEvent::SampleFailed { id, error }
            }
        }
    }

    fn record(&mut self, id: RequestId, status: RunStatus) {
        // Ids wrap, so a reused id starts a fresh record
        if status == RunStatus::Pending {
            self.runs.retain(|r| r.id != id);
        }
        match self.runs.iter_mut().rev().find(|r| r.id == id) {
            Some(record) => record.status = status,
            None => {
                // Only settled runs are forgotten; live ones stay until they end
                if self.runs.len() >= RUN_HISTORY
                    && let Some(oldest) = self.runs.iter().position(|r| r.status.is_terminal())
                {
                    self.runs.remove(oldest);
                }
                self.runs.push_back(RunRecord { id, status });
            }
        }
    }

    fn notify(&mut self, notification: Notification) {
        debug!(severity = ?notification.severity, message = %notification.message, "Notification");
        self.notifications.push(notification);
    }

    pub fn run_status(&self, id: RequestId) -> Option<RunStatus> {
        self.runs
            .iter()
            .rev()
            .find(|r| r.id == id)
            .map(|r| r.status.clone())
    }

    /// Recent runs, oldest first
    pub fn runs(&self) -> impl Iterator<Item = &RunRecord> {
        self.runs.iter()
    }

    pub fn source(&self) -> &SourceBuffer {
        &self.source
    }

    /// User edit of the editor text
    pub fn edit_source(&mut self, text: impl Into<String>) {
        self.source.edit(text);
    }

    pub fn output(&self) -> &S {
        self.proxy.sink()
    }

    pub fn proxy(&self) -> &ExecutionProxy<S> {
        &self.proxy
    }

    pub fn proxy_mut(&mut self) -> &mut ExecutionProxy<S> {
        &mut self.proxy
    }

    pub fn router(&self) -> &SelectionRouter {
        &self.router
    }

    pub fn manifest(&self) -> &Arc<Manifest> {
        self.router.cache().manifest()
    }

    pub fn notifications(&self) -> &[Notification] {
        &self.notifications
    }

    /// Remove and return pending notifications
    pub fn take_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.notifications)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::OutputMode;
    use crate::context::scripted::scripted;
    use crate::manifest::builtin_sources;
    use crate::sample::{FsFetcher, PreloadedFetcher, SampleCache};

    fn playground() -> Playground {
        let manifest = Arc::new(Manifest::builtin().unwrap());
        let fetcher = Arc::new(PreloadedFetcher::new(
            builtin_sources(),
            Arc::new(FsFetcher::new("/nonexistent")),
        ));
        let router = SelectionRouter::new(Arc::new(SampleCache::new(manifest, fetcher)), None);
        let (factory, _) = scripted();
        let proxy = ExecutionProxy::new(factory, OutputMode::Line).ready_banner(READY_BANNER);
        Playground::new(proxy, router)
    }

    #[tokio::test]
    async fn test_start_loads_default_sample_and_context() {
        let mut playground = playground();
        playground.start("");
        let events = playground.settle().await;

        assert!(events.contains(&PlaygroundEvent::Lifecycle(LifecycleEvent::Ready)));
        assert!(events.iter().any(
            |e| matches!(e, PlaygroundEvent::SampleLoaded(sample) if sample.id == "test-add")
        ));
        assert_eq!(
            playground.source().text(),
            builtin_sources()["test_add.py"].as_str()
        );
        assert_eq!(playground.output().contents(), READY_BANNER);
        assert_eq!(
            playground.notifications(),
            &[Notification::info("Interpreter ready")]
        );
    }

    #[tokio::test]
    async fn test_run_editor_snapshot() {
        let mut playground = playground();
        playground.edit_source("print hello\nerr warning");
        let id = playground.run().unwrap();
        // Later edits do not affect the run already issued
        playground.edit_source("print changed");

        assert_eq!(playground.wait_for(id).await, RunStatus::Finished);
        assert_eq!(
            playground.output().chunks(),
            &[READY_BANNER, "hello\n", "warning\n"]
        );
        assert!(playground.is_idle());
    }

    #[tokio::test]
    async fn test_failed_run_notifies_and_context_stays_usable() {
        let mut playground = playground();
        let failing = playground
            .run_source("raise ZeroDivisionError: division by zero")
            .unwrap();
        assert_eq!(
            playground.wait_for(failing).await,
            RunStatus::Failed {
                error: "ZeroDivisionError: division by zero".to_string()
            }
        );
        assert!(playground.take_notifications().contains(&Notification::error(
            format!("Run {} failed: ZeroDivisionError: division by zero", failing)
        )));

        let next = playground.run_source("print again").unwrap();
        assert_eq!(playground.wait_for(next).await, RunStatus::Finished);
        assert_eq!(playground.runs().count(), 2);
    }

    #[tokio::test]
    async fn test_unknown_sample_notifies_and_keeps_source() {
        let mut playground = playground();
        playground.edit_source("mine");
        playground.select("missing");
        let events = playground.settle().await;

        assert_eq!(
            events,
            vec![PlaygroundEvent::SampleFailed {
                id: "missing".to_string(),
                error: "Sample not found: missing".to_string()
            }]
        );
        assert_eq!(playground.source().text(), "mine");
        assert_eq!(playground.notifications().len(), 1);
    }

    #[tokio::test]
    async fn test_rapid_reselection_keeps_last() {
        let mut playground = playground();
        playground.select("test-for");
        playground.select("test-while");
        playground.select_fragment("#test-raise");
        playground.settle().await;
        assert_eq!(
            playground.source().text(),
            builtin_sources()["test_raise.py"].as_str()
        );
    }

    #[tokio::test]
    async fn test_history_keeps_live_runs() {
        let mut playground = playground();
        // Queued behind the context start, so none has settled yet
        let ids: Vec<_> = (0..RUN_HISTORY + 6)
            .map(|i| playground.run_source(format!("print {i}")).unwrap())
            .collect();
        assert_eq!(playground.runs().count(), RUN_HISTORY + 6);

        assert_eq!(playground.wait_for(ids[0]).await, RunStatus::Finished);
        playground.settle().await;
        assert!(playground.runs().all(|r| r.status == RunStatus::Finished));

        // New runs push out the oldest settled ones
        let next = playground.run_source("print more").unwrap();
        assert_eq!(playground.runs().count(), RUN_HISTORY + 6);
        assert_eq!(playground.run_status(ids[0]), None);
        assert_eq!(playground.runs().last().map(|r| r.id), Some(next));
    }

    #[tokio::test]
    async fn test_wait_for_unknown_run() {
        let mut playground = playground();
        assert!(matches!(
            playground.wait_for(RequestId(42)).await,
            RunStatus::Failed { .. }
        ));
    }
}
