//! Session actor: one playground shared by many callers
//!
//! The [`Playground`] lives on its own task and is driven through a command
//! channel with `oneshot` replies, so HTTP handlers never touch it directly.
//! Between commands the task keeps stepping the playground.

use crate::manifest::Manifest;
use crate::playground::{Notification, Playground, RunRecord};
use crate::protocol::RequestId;
use crate::proxy::ProxyError;
use crate::sample::SampleCache;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

const COMMAND_BUFFER: usize = 64;

/// Errors from talking to a session
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session has shut down")]
    Closed,

    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

/// Result of a selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Selection {
    pub id: String,
    pub generation: u64,
}

/// Editor state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceView {
    pub text: String,
    pub version: u64,
    pub selected: Option<String>,
    pub generation: u64,
    /// A sample load is still in flight
    pub loading: bool,
}

/// A slice of an append-only list, plus the index to ask for next time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: usize,
}

impl<T: Clone> Page<T> {
    fn since(all: &[T], since: usize) -> Self {
        let start = since.min(all.len());
        Self {
            items: all[start..].to_vec(),
            next: all.len(),
        }
    }
}

#[derive(Debug)]
enum Command {
    Select {
        fragment: String,
        reply: oneshot::Sender<Selection>,
    },
    Source {
        reply: oneshot::Sender<SourceView>,
    },
    Edit {
        text: String,
        reply: oneshot::Sender<SourceView>,
    },
    Run {
        source: Option<String>,
        reply: oneshot::Sender<Result<RequestId, ProxyError>>,
    },
    Output {
        since: usize,
        reply: oneshot::Sender<Page<String>>,
    },
    Notifications {
        since: usize,
        reply: oneshot::Sender<Page<Notification>>,
    },
    Runs {
        reply: oneshot::Sender<Vec<RunRecord>>,
    },
}

/// Cloneable handle to a running session
#[derive(Clone)]
pub struct Session {
    commands: mpsc::Sender<Command>,
    cache: Arc<SampleCache>,
}

impl Session {
    /// Move `playground` onto its own task and start it on `fragment`
    pub fn spawn(mut playground: Playground, fragment: &str) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let cache = Arc::clone(playground.router().cache());
        playground.start(fragment);
        tokio::spawn(drive(playground, rx));
        Self {
            commands: tx,
            cache,
        }
    }

    pub fn manifest(&self) -> &Arc<Manifest> {
        self.cache.manifest()
    }

    /// The session's sample cache; safe to use from any task
    pub fn cache(&self) -> &Arc<SampleCache> {
        &self.cache
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Select by fragment (`#id`, `id`, or empty for the default sample)
    pub async fn select(&self, fragment: impl Into<String>) -> Result<Selection, SessionError> {
        let fragment = fragment.into();
        self.request(|reply| Command::Select { fragment, reply }).await
    }

    pub async fn source(&self) -> Result<SourceView, SessionError> {
        self.request(|reply| Command::Source { reply }).await
    }

    pub async fn edit(&self, text: impl Into<String>) -> Result<SourceView, SessionError> {
        let text = text.into();
        self.request(|reply| Command::Edit { text, reply }).await
    }

    /// Run `source`, or the editor text when `None`
    pub async fn run(&self, source: Option<String>) -> Result<RequestId, SessionError> {
        Ok(self.request(|reply| Command::Run { source, reply }).await??)
    }

    pub async fn output(&self, since: usize) -> Result<Page<String>, SessionError> {
        self.request(|reply| Command::Output { since, reply }).await
    }

    pub async fn notifications(&self, since: usize) -> Result<Page<Notification>, SessionError> {
        self.request(|reply| Command::Notifications { since, reply })
            .await
    }

    pub async fn runs(&self) -> Result<Vec<RunRecord>, SessionError> {
        self.request(|reply| Command::Runs { reply }).await
    }
}

async fn drive(mut playground: Playground, mut commands: mpsc::Receiver<Command>) {
    info!("Session started");
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => handle(&mut playground, command),
                None => break,
            },
            _ = playground.step() => {}
        }
    }
    info!("All session handles dropped, session ending");
}

fn handle(playground: &mut Playground, command: Command) {
    debug!(command = ?command, "Session command");
    // A caller that stopped waiting is not an error
    match command {
        Command::Select { fragment, reply } => {
            let generation = playground.select_fragment(&fragment);
            let id = playground.router().selected().unwrap_or_default().to_string();
            let _ = reply.send(Selection {
                id,
                generation: generation.value(),
            });
        }
        Command::Source { reply } => {
            let _ = reply.send(source_view(playground));
        }
        Command::Edit { text, reply } => {
            playground.edit_source(text);
            let _ = reply.send(source_view(playground));
        }
        Command::Run { source, reply } => {
            let result = match source {
                Some(source) => playground.run_source(source),
                None => playground.run(),
            };
            let _ = reply.send(result);
        }
        Command::Output { since, reply } => {
            let _ = reply.send(Page::since(playground.output().chunks(), since));
        }
        Command::Notifications { since, reply } => {
            let _ = reply.send(Page::since(playground.notifications(), since));
        }
        Command::Runs { reply } => {
            let _ = reply.send(playground.runs().cloned().collect());
        }
    }
}

fn source_view(playground: &Playground) -> SourceView {
    let router = playground.router();
    SourceView {
        text: playground.source().snapshot(),
        version: playground.source().version(),
        selected: router.selected().map(str::to_string),
        generation: router.current().value(),
        loading: router.is_loading(),
    }
}
