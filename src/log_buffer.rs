use std::fmt::Write as _;

use log::Level;

const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub level: Level,
    pub message: String,
}

/// Log lines of a single request, kept in memory so they can be shown on the page.
///
/// Every line is also forwarded to the `log` facade. Lines beyond the capacity are only forwarded.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    lines: Vec<LogLine>,
    capacity: usize,
    dropped: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        LogBuffer::with_capacity(DEFAULT_CAPACITY)
    }
}

impl LogBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        LogBuffer {
            lines: Vec::new(),
            capacity,
            dropped: 0,
        }
    }

    pub fn record(&mut self, level: Level, message: impl Into<String>) {
        let message = message.into();
        log::log!(target: "edge_flags", level, "{message}");
        if self.lines.len() < self.capacity {
            self.lines.push(LogLine { level, message });
        } else {
            self.dropped += 1;
        }
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.record(Level::Info, message);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.record(Level::Warn, message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.record(Level::Error, message);
    }

    pub fn lines(&self) -> &[LogLine] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// One `LEVEL message` line per entry, followed by a count of dropped lines if any.
    pub fn to_text(&self) -> String {
        let mut text = String::new();
        for line in &self.lines {
            let _ = writeln!(text, "{:<5} {}", line.level, line.message);
        }
        if self.dropped > 0 {
            let _ = writeln!(text, "... {} more", self.dropped);
        }
        text
    }
}
