//! Execution context: the isolated worker hosting the interpreter
//!
//! The context runs on its own OS thread and talks to the UI side only through
//! two channels: [`HostMessage`]s in, [`ContextMessage`]s out. It has a single
//! thread of control, so requests are executed one at a time in channel order.

mod interpreter;
mod process;

#[cfg(feature = "embedded-python")]
mod embedded;

#[cfg(test)]
pub(crate) mod scripted;

pub use interpreter::{
    Interpreter, InterpreterError, InterpreterFactory, ModuleName, ModuleNamer, OutputChannel,
    OutputMode, StreamWriter,
};
pub use process::{ProcessConfig, ProcessInterpreter};

#[cfg(feature = "embedded-python")]
pub use embedded::{EmbeddedConfig, EmbeddedInterpreter};

use crate::protocol::{ContextMessage, HostMessage, RequestId};
use crate::{InterpreterBackend, InterpreterConfig};
use std::panic::{AssertUnwindSafe, catch_unwind};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Lifecycle of the context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Uninitialized,
    Initializing,
    Ready,
    Executing,
    /// Interpreter failed to load; terminal
    Failed,
}

/// UI-side ends of the context's channels
pub struct ContextHandle {
    requests: mpsc::UnboundedSender<HostMessage>,
    events: mpsc::UnboundedReceiver<ContextMessage>,
}

impl ContextHandle {
    /// Queue a message for the context. Fails only if the context has exited.
    pub fn send(&self, message: HostMessage) -> Result<(), HostMessage> {
        self.requests.send(message).map_err(|e| e.0)
    }

    /// Next message from the context; `None` once it has exited and drained
    pub async fn recv(&mut self) -> Option<ContextMessage> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ContextMessage> {
        self.events.try_recv().ok()
    }
}

/// State owned by the context thread
pub struct ExecutionContext {
    state: ContextState,
    interpreter: Option<Box<dyn Interpreter>>,
    names: ModuleNamer,
    output: OutputChannel,
    events: mpsc::UnboundedSender<ContextMessage>,
}

impl ExecutionContext {
    pub fn new(events: mpsc::UnboundedSender<ContextMessage>, mode: OutputMode) -> Self {
        Self {
            state: ContextState::Uninitialized,
            interpreter: None,
            names: ModuleNamer::new(),
            output: OutputChannel::new(events.clone(), mode),
            events,
        }
    }

    /// Start the context thread. The interpreter is built on that thread.
    pub fn spawn(factory: InterpreterFactory, mode: OutputMode) -> std::io::Result<ContextHandle> {
        let (request_tx, mut request_rx) = mpsc::unbounded_channel::<HostMessage>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        std::thread::Builder::new()
            .name("pyplay-context".to_string())
            .spawn(move || {
                let mut context = ExecutionContext::new(event_tx, mode);
                if !context.initialize(factory) {
                    return;
                }
                while let Some(message) = request_rx.blocking_recv() {
                    context.handle(message);
                }
                debug!("Request channel closed, execution context exiting");
            })?;

        Ok(ContextHandle {
            requests: request_tx,
            events: event_rx,
        })
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    /// Load the interpreter; emits `initialized` or `init_failed`
    pub fn initialize(&mut self, factory: InterpreterFactory) -> bool {
        self.state = ContextState::Initializing;
        info!("Loading interpreter");

        let loaded = catch_unwind(AssertUnwindSafe(factory))
            .unwrap_or_else(|payload| Err(InterpreterError::Panicked(panic_message(&payload))));

        match loaded {
            Ok(interpreter) => {
                info!(interpreter = interpreter.name(), "Execution context ready");
                self.interpreter = Some(interpreter);
                self.state = ContextState::Ready;
                self.emit(ContextMessage::Initialized);
                true
            }
            Err(e) => {
                error!("Interpreter failed to initialize: {}", e);
                self.state = ContextState::Failed;
                self.emit(ContextMessage::InitFailed {
                    error: e.to_string(),
                });
                false
            }
        }
    }

    pub fn handle(&mut self, message: HostMessage) {
        match message {
            HostMessage::Execute { id, data } => self.execute(id, &data),
        }
    }

    fn execute(&mut self, id: RequestId, source: &str) {
        let Some(interpreter) = self.interpreter.as_mut() else {
            warn!(id = %id, state = ?self.state, "Execute received without an interpreter");
            self.emit(ContextMessage::ExecError {
                id,
                error: "interpreter is not initialized".to_string(),
            });
            return;
        };

        self.state = ContextState::Executing;
        send_event(&self.events, ContextMessage::ExecStart { id });
        let module = self.names.fresh();
        debug!(
            id = %id,
            module = %module,
            executions = self.names.issued(),
            "Execution start"
        );

        let output = &self.output;
        let ran = catch_unwind(AssertUnwindSafe(|| {
            interpreter.execute(&module, source, output)
        }))
        .unwrap_or_else(|payload| Err(InterpreterError::Panicked(panic_message(&payload))));

        let cleaned = catch_unwind(AssertUnwindSafe(|| interpreter.cleanup(&module)))
            .unwrap_or_else(|payload| Err(InterpreterError::Panicked(panic_message(&payload))));

        let outcome = match (ran, cleaned) {
            (Err(e), cleaned) => {
                if let Err(ce) = cleaned {
                    warn!(id = %id, module = %module, "Cleanup after failed run also failed: {}", ce);
                }
                Err(e)
            }
            (Ok(()), cleaned) => cleaned,
        };

        self.state = ContextState::Ready;
        match outcome {
            Ok(()) => {
                debug!(id = %id, "Execution finished");
                self.emit(ContextMessage::ExecFinished { id });
            }
            Err(e) => {
                let mut error = e.to_string();
                if error.trim().is_empty() {
                    error = "execution failed".to_string();
                }
                debug!(id = %id, error = %error, "Execution error");
                self.emit(ContextMessage::ExecError { id, error });
            }
        }
    }

    fn emit(&self, message: ContextMessage) {
        send_event(&self.events, message);
    }
}

fn send_event(events: &mpsc::UnboundedSender<ContextMessage>, message: ContextMessage) {
    if events.send(message).is_err() {
        debug!("UI side has gone away, message dropped");
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Build the interpreter factory selected by configuration
pub fn interpreter_factory(config: &InterpreterConfig) -> InterpreterFactory {
    let scratch_dir = config.scratch_dir();
    match config.backend {
        InterpreterBackend::Process => {
            let process = ProcessConfig {
                program: config.program.clone(),
                args: config.args.clone(),
                scratch_dir,
            };
            Box::new(move || {
                let interpreter = ProcessInterpreter::new(process)?;
                Ok(Box::new(interpreter) as Box<dyn Interpreter>)
            })
        }
        #[cfg(feature = "embedded-python")]
        InterpreterBackend::Embedded => {
            let embedded = EmbeddedConfig {
                scratch_dir,
                setup: config.setup.clone(),
                cleanup_hook: config.cleanup_hook.clone(),
            };
            Box::new(move || {
                let interpreter = EmbeddedInterpreter::new(embedded)?;
                Ok(Box::new(interpreter) as Box<dyn Interpreter>)
            })
        }
        #[cfg(not(feature = "embedded-python"))]
        InterpreterBackend::Embedded => Box::new(|| {
            Err(InterpreterError::Init(
                "embedded backend requires the `embedded-python` feature".to_string(),
            ))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::scripted::scripted;

    fn execute(id: u64, data: &str) -> HostMessage {
        HostMessage::Execute {
            id: RequestId(id),
            data: data.to_string(),
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ContextMessage>) -> Vec<ContextMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn output(text: &str) -> ContextMessage {
        ContextMessage::Output {
            text: text.to_string(),
        }
    }

    #[test]
    fn test_state_machine_and_sequence() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut context = ExecutionContext::new(tx, OutputMode::Line);
        assert_eq!(context.state(), ContextState::Uninitialized);

        let (factory, cleaned) = scripted();
        assert!(context.initialize(factory));
        assert_eq!(context.state(), ContextState::Ready);

        context.handle(execute(1, "print 2"));
        assert_eq!(context.state(), ContextState::Ready);
        assert_eq!(
            drain(&mut rx),
            vec![
                ContextMessage::Initialized,
                ContextMessage::ExecStart { id: RequestId(1) },
                output("2\n"),
                ContextMessage::ExecFinished { id: RequestId(1) },
            ]
        );
        assert_eq!(cleaned.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_error_keeps_context_usable() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut context = ExecutionContext::new(tx, OutputMode::Line);
        let (factory, cleaned) = scripted();
        context.initialize(factory);
        drain(&mut rx);

        context.handle(execute(5, "print before\nraise ZeroDivisionError: division by zero"));
        context.handle(execute(6, "print after"));

        assert_eq!(
            drain(&mut rx),
            vec![
                ContextMessage::ExecStart { id: RequestId(5) },
                output("before\n"),
                ContextMessage::ExecError {
                    id: RequestId(5),
                    error: "ZeroDivisionError: division by zero".to_string(),
                },
                ContextMessage::ExecStart { id: RequestId(6) },
                output("after\n"),
                ContextMessage::ExecFinished { id: RequestId(6) },
            ]
        );
        // Cleanup runs for failed executions too
        assert_eq!(cleaned.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_panic_in_binding_becomes_exec_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut context = ExecutionContext::new(tx, OutputMode::Line);
        let (factory, _) = scripted();
        context.initialize(factory);
        drain(&mut rx);

        context.handle(execute(1, "panic"));
        context.handle(execute(2, "print ok"));
        let messages = drain(&mut rx);
        assert!(matches!(
            &messages[1],
            ContextMessage::ExecError { id: RequestId(1), error } if error.contains("binding exploded")
        ));
        assert_eq!(
            messages.last(),
            Some(&ContextMessage::ExecFinished { id: RequestId(2) })
        );
    }

    #[test]
    fn test_empty_error_message_replaced() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut context = ExecutionContext::new(tx, OutputMode::Line);
        let (factory, _) = scripted();
        context.initialize(factory);
        drain(&mut rx);

        context.handle(execute(3, "raise "));
        let messages = drain(&mut rx);
        assert_eq!(
            messages.last(),
            Some(&ContextMessage::ExecError {
                id: RequestId(3),
                error: "execution failed".to_string()
            })
        );
    }

    #[test]
    fn test_init_failure_reported() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut context = ExecutionContext::new(tx, OutputMode::Line);
        let factory: InterpreterFactory =
            Box::new(|| Err(InterpreterError::Init("no python here".to_string())));

        assert!(!context.initialize(factory));
        assert_eq!(context.state(), ContextState::Failed);
        assert_eq!(
            drain(&mut rx),
            vec![ContextMessage::InitFailed {
                error: "Interpreter failed to start: no python here".to_string()
            }]
        );
    }

    #[test]
    fn test_execute_after_ui_side_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut context = ExecutionContext::new(tx, OutputMode::Line);
        let (factory, cleaned) = scripted();
        context.initialize(factory);
        drop(rx);

        // Every event of the run is dropped, but the run itself completes
        context.handle(execute(1, "print lost"));
        assert_eq!(context.state(), ContextState::Ready);
        assert_eq!(cleaned.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_spawned_context_processes_in_send_order() {
        let (factory, _) = scripted();
        let mut handle = ExecutionContext::spawn(factory, OutputMode::Line).unwrap();

        // Sent before the context reports ready; the channel keeps them in order
        for id in 1..=3 {
            handle
                .send(execute(id, &format!("print run {id}\nerr note {id}")))
                .unwrap();
        }

        let mut seen = Vec::new();
        while let Some(msg) = handle.recv().await {
            let done = msg == ContextMessage::ExecFinished { id: RequestId(3) };
            seen.push(msg);
            if done {
                break;
            }
        }

        assert_eq!(seen[0], ContextMessage::Initialized);
        let lifecycle: Vec<_> = seen.iter().filter_map(|m| m.request_id()).collect();
        assert_eq!(
            lifecycle,
            vec![
                RequestId(1),
                RequestId(1),
                RequestId(2),
                RequestId(2),
                RequestId(3),
                RequestId(3)
            ]
        );
        let texts: Vec<_> = seen
            .iter()
            .filter_map(|m| match m {
                ContextMessage::Output { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(
            texts,
            vec!["run 1\n", "note 1\n", "run 2\n", "note 2\n", "run 3\n", "note 3\n"]
        );
    }

    #[cfg(not(feature = "embedded-python"))]
    #[test]
    fn test_embedded_backend_without_feature() {
        let config = InterpreterConfig {
            backend: InterpreterBackend::Embedded,
            ..InterpreterConfig::default()
        };
        let factory = interpreter_factory(&config);
        assert!(matches!(factory(), Err(InterpreterError::Init(_))));
    }
}
