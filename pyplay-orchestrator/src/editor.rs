//! Source buffer: the text model behind the editor panel

/// Cursor position, 1-based like editor line/column numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub const START: Position = Position { line: 1, column: 1 };
}

/// Editable source text with view state
#[derive(Debug, Clone)]
pub struct SourceBuffer {
    text: String,
    scroll_top: usize,
    cursor: Position,
    version: u64,
}

impl SourceBuffer {
    pub fn new() -> Self {
        Self {
            text: String::new(),
            scroll_top: 0,
            cursor: Position::START,
            version: 0,
        }
    }

    /// Replace the whole text and reset view state to the start
    pub fn set_value(&mut self, text: impl Into<String>) {
        self.text = text.into();
        self.scroll_top = 0;
        self.cursor = Position::START;
        self.version += 1;
    }

    /// User edit: replace the text but keep the view where it is
    pub fn edit(&mut self, text: impl Into<String>) {
        self.text = text.into();
        let last = self.line_count();
        self.cursor.line = self.cursor.line.min(last);
        self.scroll_top = self.scroll_top.min(last.saturating_sub(1));
        self.version += 1;
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Snapshot handed to a run request
    pub fn snapshot(&self) -> String {
        self.text.clone()
    }

    /// Zero-based index of the first visible line
    pub fn scroll_top(&self) -> usize {
        self.scroll_top
    }

    pub fn scroll_to(&mut self, line: usize) {
        self.scroll_top = line.min(self.line_count().saturating_sub(1));
    }

    pub fn cursor(&self) -> Position {
        self.cursor
    }

    pub fn move_cursor(&mut self, position: Position) {
        self.cursor = Position {
            line: position.line.clamp(1, self.line_count()),
            column: position.column.max(1),
        };
    }

    /// Bumped on every text change
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn line_count(&self) -> usize {
        self.text.lines().count().max(1)
    }
}

impl Default for SourceBuffer {
    fn default() -> Self {
        Self::new()
    }
}
