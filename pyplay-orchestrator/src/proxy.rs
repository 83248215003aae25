//! Execution proxy: the UI-side handle to the execution context
//!
//! The proxy owns the context's channels and the request-id counter. Runs
//! issued before the context reports ready are queued and flushed in order
//! once it does. Incoming output goes to the [`OutputSink`]; lifecycle
//! messages are turned into [`LifecycleEvent`]s for observers.

use crate::context::{ContextHandle, ExecutionContext, InterpreterFactory, OutputMode};
use crate::output::{OutputBuffer, OutputSink};
use crate::protocol::{ContextMessage, HostMessage, RequestId};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Errors from issuing runs
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Execution context unavailable: {0}")]
    ContextUnavailable(String),

    #[error("Failed to start execution context: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Request id {0} is still outstanding")]
    RequestIdInUse(RequestId),

    #[error("Execution context channel closed")]
    ChannelClosed,
}

/// What observers are told about the context and its runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// The interpreter is loaded and queued runs have been sent
    Ready,
    /// The context cannot run anything, ever again this session
    Unavailable { error: String },
    Started { id: RequestId },
    Finished { id: RequestId },
    Failed { id: RequestId, error: String },
}

impl LifecycleEvent {
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            LifecycleEvent::Started { id }
            | LifecycleEvent::Finished { id }
            | LifecycleEvent::Failed { id, .. } => Some(*id),
            LifecycleEvent::Ready | LifecycleEvent::Unavailable { .. } => None,
        }
    }
}

/// Proxy side of the context lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyState {
    /// No context yet; the first run or `initialize` creates it
    Idle,
    /// Context spawned, waiting for `initialized`
    Starting,
    Ready,
    /// Context failed to load or went away
    Failed(String),
}

/// Wrapping request-id allocator
///
/// Ids run `1, 2, .., max, 0, 1, ..`. An id still outstanding is never handed
/// out again.
#[derive(Debug, Clone)]
pub struct RequestIds {
    next: u64,
    max: u64,
}

impl RequestIds {
    pub fn new(max: u64) -> Self {
        Self::starting_at(1.min(max), max)
    }

    /// Allocator whose next id is `next`
    pub fn starting_at(next: u64, max: u64) -> Self {
        Self {
            next: next.min(max),
            max,
        }
    }

    pub fn allocate(&mut self, outstanding: &HashSet<RequestId>) -> Result<RequestId, ProxyError> {
        let id = RequestId(self.next);
        if outstanding.contains(&id) {
            return Err(ProxyError::RequestIdInUse(id));
        }
        self.next = if self.next >= self.max { 0 } else { self.next + 1 };
        Ok(id)
    }
}

type OutputHandler = Box<dyn FnMut(&str) + Send>;
type LifecycleHandler = Box<dyn FnMut(&LifecycleEvent) + Send>;

/// UI-side handle to the single execution context of a session
pub struct ExecutionProxy<S: OutputSink = OutputBuffer> {
    factory: Option<InterpreterFactory>,
    mode: OutputMode,
    context: Option<ContextHandle>,
    state: ProxyState,
    ids: RequestIds,
    /// Every run without a terminal event yet, queued ones included
    outstanding: HashSet<RequestId>,
    /// Runs waiting for the context to report ready
    pending: VecDeque<HostMessage>,
    ready_banner: Option<String>,
    sink: S,
    output_handlers: Vec<OutputHandler>,
    lifecycle_handlers: Vec<LifecycleHandler>,
}

impl ExecutionProxy<OutputBuffer> {
    pub fn new(factory: InterpreterFactory, mode: OutputMode) -> Self {
        Self::with_sink(factory, mode, OutputBuffer::new())
    }
}

impl<S: OutputSink> ExecutionProxy<S> {
    pub fn with_sink(factory: InterpreterFactory, mode: OutputMode, sink: S) -> Self {
        Self {
            factory: Some(factory),
            mode,
            context: None,
            state: ProxyState::Idle,
            ids: RequestIds::new(u64::MAX),
            outstanding: HashSet::new(),
            pending: VecDeque::new(),
            ready_banner: None,
            sink,
            output_handlers: Vec::new(),
            lifecycle_handlers: Vec::new(),
        }
    }

    /// Wrap request ids after `max`
    pub fn max_request_id(mut self, max: u64) -> Self {
        self.ids = RequestIds::new(max);
        self
    }

    /// Text appended to the sink when the context reports ready
    pub fn ready_banner(mut self, banner: impl Into<String>) -> Self {
        self.set_ready_banner(Some(banner.into()));
        self
    }

    pub fn set_ready_banner(&mut self, banner: Option<String>) {
        self.ready_banner = banner;
    }

    /// Observe every output chunk, after it reached the sink
    pub fn on_output(&mut self, handler: impl FnMut(&str) + Send + 'static) {
        self.output_handlers.push(Box::new(handler));
    }

    /// Observe every lifecycle event
    pub fn on_lifecycle(&mut self, handler: impl FnMut(&LifecycleEvent) + Send + 'static) {
        self.lifecycle_handlers.push(Box::new(handler));
    }

    /// Create the session's execution context. Only the first call spawns it.
    pub fn initialize(&mut self) -> Result<(), ProxyError> {
        match &self.state {
            ProxyState::Idle => {}
            ProxyState::Failed(reason) => {
                return Err(ProxyError::ContextUnavailable(reason.clone()));
            }
            ProxyState::Starting | ProxyState::Ready => return Ok(()),
        }

        let factory = self.factory.take().ok_or_else(|| {
            ProxyError::ContextUnavailable("no interpreter configured".to_string())
        })?;
        let handle = ExecutionContext::spawn(factory, self.mode).map_err(|e| {
            self.state = ProxyState::Failed(e.to_string());
            ProxyError::Spawn(e)
        })?;

        info!("Execution context starting");
        self.context = Some(handle);
        self.state = ProxyState::Starting;
        Ok(())
    }

    /// Issue a run of `source`. Returns as soon as the request is sent or queued.
    pub fn run(&mut self, source: impl Into<String>) -> Result<RequestId, ProxyError> {
        self.initialize()?;
        let id = self.ids.allocate(&self.outstanding)?;
        let message = HostMessage::Execute {
            id,
            data: source.into(),
        };
        self.outstanding.insert(id);

        if self.state == ProxyState::Ready {
            if let Err(e) = self.send(message) {
                self.outstanding.remove(&id);
                return Err(e);
            }
            debug!(id = %id, "Run sent");
        } else {
            debug!(id = %id, queued = self.pending.len() + 1, "Run queued until context is ready");
            self.pending.push_back(message);
        }
        Ok(id)
    }

    fn send(&self, message: HostMessage) -> Result<(), ProxyError> {
        let context = self.context.as_ref().ok_or(ProxyError::ChannelClosed)?;
        context.send(message).map_err(|_| ProxyError::ChannelClosed)
    }

    /// Next message from the context. Never resolves while there is no context.
    pub async fn recv(&mut self) -> Option<ContextMessage> {
        match self.context.as_mut() {
            Some(context) => context.recv().await,
            None => std::future::pending().await,
        }
    }

    /// Wait for the next message and apply it
    pub async fn process_next(&mut self) -> Vec<LifecycleEvent> {
        match self.recv().await {
            Some(message) => self.dispatch(message),
            None => self.disconnected(),
        }
    }

    /// Apply one message from the context: output goes to the sink, lifecycle
    /// messages become events and reach the observers
    pub fn dispatch(&mut self, message: ContextMessage) -> Vec<LifecycleEvent> {
        let events = match message {
            ContextMessage::Initialized => self.on_initialized(),
            ContextMessage::InitFailed { error } => {
                error!(error = %error, "Execution context failed to initialize");
                self.fail_all(error)
            }
            ContextMessage::Output { text } => {
                self.sink.append(&text);
                for handler in &mut self.output_handlers {
                    handler(&text);
                }
                Vec::new()
            }
            ContextMessage::ExecStart { id } => vec![LifecycleEvent::Started { id }],
            ContextMessage::ExecFinished { id } => {
                self.settle(id);
                vec![LifecycleEvent::Finished { id }]
            }
            ContextMessage::ExecError { id, error } => {
                self.settle(id);
                warn!(id = %id, error = %error, "Run failed");
                vec![LifecycleEvent::Failed { id, error }]
            }
        };
        self.notify(&events);
        events
    }

    /// The context's event channel closed
    pub fn disconnected(&mut self) -> Vec<LifecycleEvent> {
        self.context = None;
        if matches!(self.state, ProxyState::Failed(_)) {
            return Vec::new();
        }
        warn!("Execution context exited");
        let events = self.fail_all("execution context exited".to_string());
        self.notify(&events);
        events
    }

    fn on_initialized(&mut self) -> Vec<LifecycleEvent> {
        self.state = ProxyState::Ready;
        info!(queued = self.pending.len(), "Execution context ready");
        if let Some(banner) = &self.ready_banner {
            self.sink.append(banner);
        }

        let mut events = vec![LifecycleEvent::Ready];
        while let Some(message) = self.pending.pop_front() {
            let HostMessage::Execute { id, .. } = &message;
            let id = *id;
            if self.send(message).is_err() {
                self.outstanding.remove(&id);
                events.push(LifecycleEvent::Failed {
                    id,
                    error: ProxyError::ChannelClosed.to_string(),
                });
            }
        }
        events
    }

    /// Enter the failed state and fail every outstanding run with `reason`
    fn fail_all(&mut self, reason: String) -> Vec<LifecycleEvent> {
        self.state = ProxyState::Failed(reason.clone());
        self.pending.clear();

        let mut failed: Vec<_> = self.outstanding.drain().collect();
        failed.sort();
        let mut events = vec![LifecycleEvent::Unavailable {
            error: reason.clone(),
        }];
        events.extend(failed.into_iter().map(|id| LifecycleEvent::Failed {
            id,
            error: reason.clone(),
        }));
        events
    }

    fn settle(&mut self, id: RequestId) {
        if !self.outstanding.remove(&id) {
            warn!(id = %id, "Terminal event for unknown request");
        }
    }

    fn notify(&mut self, events: &[LifecycleEvent]) {
        for event in events {
            for handler in &mut self.lifecycle_handlers {
                handler(event);
            }
        }
    }

    pub fn state(&self) -> &ProxyState {
        &self.state
    }

    /// Whether any run is still waiting for its terminal event
    pub fn is_busy(&self) -> bool {
        !self.outstanding.is_empty()
    }

    /// Outstanding request ids in ascending order
    pub fn outstanding(&self) -> Vec<RequestId> {
        let mut ids: Vec<_> = self.outstanding.iter().copied().collect();
        ids.sort();
        ids
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }
}
