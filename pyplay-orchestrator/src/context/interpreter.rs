//! Interpreter seam and output capture for the execution context

use crate::protocol::ContextMessage;
use serde::Deserialize;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

/// Errors raised while starting or driving an interpreter
#[derive(Error, Debug)]
pub enum InterpreterError {
    #[error("Interpreter failed to start: {0}")]
    Init(String),

    /// The executed program raised; the message is what the user sees
    #[error("{0}")]
    Raised(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Interpreter binding panicked: {0}")]
    Panicked(String),
}

/// An external interpreter driven by the execution context
///
/// Implementations run on the context thread and may block.
pub trait Interpreter: Send {
    /// Name for logging
    fn name(&self) -> &str;

    /// Execute `source` as a freshly loaded module named `module`, writing
    /// captured stdout/stderr through writers obtained from `output`
    fn execute(
        &mut self,
        module: &ModuleName,
        source: &str,
        output: &OutputChannel,
    ) -> Result<(), InterpreterError>;

    /// Release anything the execution of `module` left behind
    fn cleanup(&mut self, module: &ModuleName) -> Result<(), InterpreterError>;
}

/// Deferred interpreter construction, run on the context thread
pub type InterpreterFactory =
    Box<dyn FnOnce() -> Result<Box<dyn Interpreter>, InterpreterError> + Send>;

/// Synthetic module identifier for one execution
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleName(String);

impl ModuleName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name the module's source is written to
    pub fn file_name(&self) -> String {
        format!("{}.py", self.0)
    }
}

impl fmt::Display for ModuleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hands out random module names, one per execution
#[derive(Debug, Default)]
pub struct ModuleNamer {
    issued: u64,
}

impl ModuleNamer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fresh(&mut self) -> ModuleName {
        self.issued += 1;
        // Leading letter keeps it a valid Python identifier
        ModuleName(format!("m{}", Uuid::new_v4().simple()))
    }

    /// Names handed out so far
    pub fn issued(&self) -> u64 {
        self.issued
    }
}

/// How captured writes are framed into `output` messages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// One message per complete line; a trailing partial line is sent when the
    /// writer is flushed at the end of the execution
    #[default]
    Line,
    /// Every write is forwarded as-is
    Raw,
}

/// Sending side of the output side-channel
#[derive(Debug, Clone)]
pub struct OutputChannel {
    tx: mpsc::UnboundedSender<ContextMessage>,
    mode: OutputMode,
}

impl OutputChannel {
    pub fn new(tx: mpsc::UnboundedSender<ContextMessage>, mode: OutputMode) -> Self {
        Self { tx, mode }
    }

    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    /// A writer for one captured stream (stdout or stderr)
    pub fn writer(&self) -> StreamWriter {
        StreamWriter {
            channel: self.clone(),
            pending: String::new(),
        }
    }

    fn emit(&self, text: String) {
        if text.is_empty() {
            return;
        }
        if self.tx.send(ContextMessage::Output { text }).is_err() {
            trace!("Output dropped, UI side has gone away");
        }
    }
}

/// Per-stream writer; flushes whatever is pending when dropped
#[derive(Debug)]
pub struct StreamWriter {
    channel: OutputChannel,
    pending: String,
}

impl StreamWriter {
    pub fn write(&mut self, text: &str) {
        match self.channel.mode {
            OutputMode::Raw => self.channel.emit(text.to_string()),
            OutputMode::Line => {
                self.pending.push_str(text);
                while let Some(pos) = self.pending.find('\n') {
                    let line: String = self.pending.drain(..=pos).collect();
                    self.channel.emit(line);
                }
            }
        }
    }

    pub fn flush(&mut self) {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            self.channel.emit(rest);
        }
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn drain(rx: &mut mpsc::UnboundedReceiver<ContextMessage>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let ContextMessage::Output { text } = msg {
                out.push(text);
            }
        }
        out
    }

    #[test]
    fn test_line_mode_frames_lines() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = OutputChannel::new(tx, OutputMode::Line);
        let mut writer = channel.writer();

        writer.write("2");
        assert!(drain(&mut rx).is_empty());
        writer.write("\n");
        writer.write("a\nb\nc");
        assert_eq!(drain(&mut rx), vec!["2\n", "a\n", "b\n"]);

        drop(writer);
        assert_eq!(drain(&mut rx), vec!["c"]);
    }

    #[test]
    fn test_raw_mode_forwards_writes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = OutputChannel::new(tx, OutputMode::Raw);
        let mut writer = channel.writer();
        writer.write("2");
        writer.write("");
        writer.write("\n");
        assert_eq!(drain(&mut rx), vec!["2", "\n"]);
    }

    #[test]
    fn test_module_names_unique() {
        let mut namer = ModuleNamer::new();
        let names: HashSet<_> = (0..100).map(|_| namer.fresh()).collect();
        assert_eq!(names.len(), 100);
        assert_eq!(namer.issued(), 100);
        for name in &names {
            assert!(name.as_str().starts_with('m'));
            assert!(name.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
            assert!(name.file_name().ends_with(".py"));
        }
    }

    #[test]
    fn test_output_mode_parse() {
        #[derive(Deserialize)]
        struct Wrapper {
            output: OutputMode,
        }
        let w: Wrapper = toml::from_str("output = \"raw\"").unwrap();
        assert_eq!(w.output, OutputMode::Raw);
        assert_eq!(OutputMode::default(), OutputMode::Line);
    }
}
