//! Operator-facing launch log
//!
//! The embedding host supplies a [`LaunchListener`]; the launcher writes
//! human-readable, timestamped lines to it through [`Progress`], which also
//! mirrors every line to `tracing`.

use std::sync::Arc;

use parking_lot::Mutex;

/// Sink for launch progress text.
pub trait LaunchListener: Send + Sync {
    fn info(&self, line: &str);

    fn error(&self, line: &str);
}

/// Writes lines to stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrListener;

impl LaunchListener for StderrListener {
    fn info(&self, line: &str) {
        eprintln!("{}", line);
    }

    fn error(&self, line: &str) {
        eprintln!("ERROR: {}", line);
    }
}

/// Severity of a recorded line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Error,
}

/// Keeps every line in memory.
#[derive(Debug, Default)]
pub struct MemoryListener {
    lines: Mutex<Vec<(LogLevel, String)>>,
}

impl MemoryListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn lines(&self) -> Vec<(LogLevel, String)> {
        self.lines.lock().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.lines
            .lock()
            .iter()
            .filter(|(level, _)| *level == LogLevel::Error)
            .map(|(_, line)| line.clone())
            .collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.lock().iter().any(|(_, line)| line.contains(needle))
    }
}

impl LaunchListener for MemoryListener {
    fn info(&self, line: &str) {
        self.lines.lock().push((LogLevel::Info, line.to_string()));
    }

    fn error(&self, line: &str) {
        self.lines.lock().push((LogLevel::Error, line.to_string()));
    }
}

/// Timestamping front-end to a [`LaunchListener`].
#[derive(Clone)]
pub struct Progress {
    sink: Arc<dyn LaunchListener>,
}

impl Progress {
    pub fn new(sink: Arc<dyn LaunchListener>) -> Self {
        Self { sink }
    }

    pub fn info(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::info!("[ssh-launch] {}", message);
        self.sink.info(&format!("{} {}", timestamp(), message));
    }

    pub fn error(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::error!("[ssh-launch] {}", message);
        self.sink.error(&format!("{} {}", timestamp(), message));
    }

    /// Forward multi-line remote output, one listener line per input line.
    pub fn output(&self, text: &str) {
        for line in text.lines() {
            self.sink.info(line);
        }
    }
}

/// `[MM/DD/YY HH:MM:SS]`
fn timestamp() -> String {
    chrono::Local::now().format("[%m/%d/%y %H:%M:%S]").to_string()
}
