//! Output sink: append-only display buffer for captured program output
//!
//! The buffer is read-only to the user. Appends go through [`Writable`], a
//! guard that lifts the read-only flag for its lifetime and puts it back on
//! drop, so the flag is restored on every exit path including unwinding.

use std::io::Write;
use thiserror::Error;

/// Errors from touching the output buffer
#[derive(Error, Debug, PartialEq, Eq)]
pub enum OutputError {
    #[error("Output buffer is read-only")]
    ReadOnly,
}

/// Anything that can receive output chunks in arrival order
pub trait OutputSink: Send {
    fn append(&mut self, text: &str);
}

/// Ordered, append-only chunk buffer
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    chunks: Vec<String>,
    contents: String,
    read_only: bool,
    revealed_line: usize,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self {
            chunks: Vec::new(),
            contents: String::new(),
            read_only: true,
            revealed_line: 1,
        }
    }

    /// Temporarily allow mutation; read-only comes back when the guard drops
    pub fn writable(&mut self) -> Writable<'_> {
        let restore = self.read_only;
        self.read_only = false;
        Writable {
            buffer: self,
            restore,
        }
    }

    /// Run `f` with mutation allowed
    pub fn with_writable<R>(&mut self, f: impl FnOnce(&mut Writable<'_>) -> R) -> R {
        let mut scope = self.writable();
        f(&mut scope)
    }

    /// Insert text as the user would; refused while read-only
    pub fn insert(&mut self, text: &str) -> Result<(), OutputError> {
        if self.read_only {
            return Err(OutputError::ReadOnly);
        }
        self.push_chunk(text);
        Ok(())
    }

    fn push_chunk(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.chunks.push(text.to_string());
        self.contents.push_str(text);
        self.revealed_line = self.line_count();
    }

    pub fn chunks(&self) -> &[String] {
        &self.chunks
    }

    /// Chunks appended at or after index `since`
    pub fn chunks_since(&self, since: usize) -> &[String] {
        &self.chunks[since.min(self.chunks.len())..]
    }

    pub fn contents(&self) -> &str {
        &self.contents
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Line the view was last scrolled to
    pub fn revealed_line(&self) -> usize {
        self.revealed_line
    }

    /// Number of lines, counting an unterminated trailing line
    pub fn line_count(&self) -> usize {
        self.contents.matches('\n').count() + 1
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputSink for OutputBuffer {
    fn append(&mut self, text: &str) {
        self.with_writable(|scope| scope.push(text));
    }
}

/// Scoped mutation access to an [`OutputBuffer`]
pub struct Writable<'a> {
    buffer: &'a mut OutputBuffer,
    restore: bool,
}

impl Writable<'_> {
    pub fn push(&mut self, text: &str) {
        // Same path as user edits; succeeds only while the guard holds
        let _ = self.buffer.insert(text);
    }
}

impl Drop for Writable<'_> {
    fn drop(&mut self) {
        self.buffer.read_only = self.restore;
    }
}

/// Writes chunks straight to a terminal or any `io::Write`
pub struct TerminalSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> TerminalSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl TerminalSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> OutputSink for TerminalSink<W> {
    fn append(&mut self, text: &str) {
        if let Err(e) = self
            .writer
            .write_all(text.as_bytes())
            .and_then(|_| self.writer.flush())
        {
            tracing::warn!("Failed to write output: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    #[test]
    fn test_append_preserves_order() {
        let mut buffer = OutputBuffer::new();
        buffer.append("C1");
        buffer.append("C2\n");
        buffer.append("C3");
        assert_eq!(buffer.chunks(), &["C1", "C2\n", "C3"]);
        assert_eq!(buffer.contents(), "C1C2\nC3");
        assert_eq!(buffer.chunks_since(1), &["C2\n", "C3"]);
        assert!(buffer.chunks_since(10).is_empty());
    }

    #[test]
    fn test_user_insert_refused() {
        let mut buffer = OutputBuffer::new();
        assert_eq!(buffer.insert("typed"), Err(OutputError::ReadOnly));
        assert!(buffer.contents().is_empty());
    }

    #[test]
    fn test_read_only_restored_after_append() {
        let mut buffer = OutputBuffer::new();
        buffer.append("x\n");
        assert!(buffer.is_read_only());
        assert_eq!(buffer.insert("y"), Err(OutputError::ReadOnly));
    }

    #[test]
    fn test_read_only_restored_on_panic() {
        let mut buffer = OutputBuffer::new();
        let result = catch_unwind(AssertUnwindSafe(|| {
            let _: () = buffer.with_writable(|scope| {
                scope.push("partial");
                panic!("append failed")
            });
        }));
        assert!(result.is_err());
        assert!(buffer.is_read_only());
        assert_eq!(buffer.contents(), "partial");
    }

    #[test]
    fn test_reveals_last_line() {
        let mut buffer = OutputBuffer::new();
        buffer.append("one\ntwo\n");
        assert_eq!(buffer.revealed_line(), 3);
        buffer.append("three");
        assert_eq!(buffer.revealed_line(), 3);
    }

    #[test]
    fn test_terminal_sink_writes_through() {
        let mut sink = TerminalSink::new(Vec::new());
        sink.append("2\n");
        sink.append("done\n");
        assert_eq!(sink.into_inner(), b"2\ndone\n");
    }
}
