//! Message protocol between the UI side and the execution context
//!
//! Both directions are closed tagged unions. Messages travel in-process over
//! channels as typed values; the serde representation is the JSON wire form
//! (`{"type": "exec_start", "id": 3}`) used by the HTTP surface and logs.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one run invocation, end to end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl RequestId {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Messages sent from the UI side to the execution context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    /// Run `data` as request `id`
    Execute { id: RequestId, data: String },
}

/// Messages emitted by the execution context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContextMessage {
    /// Interpreter loaded, the context accepts work
    Initialized,
    /// Interpreter failed to load; the context has exited
    InitFailed { error: String },
    /// A chunk of captured stdout/stderr text
    Output { text: String },
    /// Request `id` began executing
    ExecStart { id: RequestId },
    /// Request `id` completed normally
    ExecFinished { id: RequestId },
    /// Request `id` raised an error
    ExecError { id: RequestId, error: String },
}

impl ContextMessage {
    /// Request this message belongs to, if any. Output is not tied to a request.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            ContextMessage::ExecStart { id }
            | ContextMessage::ExecFinished { id }
            | ContextMessage::ExecError { id, .. } => Some(*id),
            ContextMessage::Initialized
            | ContextMessage::InitFailed { .. }
            | ContextMessage::Output { .. } => None,
        }
    }

    /// Whether this is the final lifecycle message for its request
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ContextMessage::ExecFinished { .. } | ContextMessage::ExecError { .. }
        )
    }
}
