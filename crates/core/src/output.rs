use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub const DEFAULT_MAX_LINES: usize = 1000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LineKind {
    #[serde(rename = "normal")]
    Normal,
    #[serde(rename = "error")]
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputLine {
    pub text: String,
    pub kind: LineKind,
}

/// Output and progress of a single run.
///
/// Only the coordinator mutates a sink; everything else sees clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSink {
    lines: VecDeque<OutputLine>,
    max_lines: usize,
    progress: Option<f64>,
    finished: bool,
    error: Option<String>,
}

impl Default for OutputSink {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINES)
    }
}

impl OutputSink {
    pub fn new(max_lines: usize) -> Self {
        let max_lines = max_lines.max(1);
        Self {
            lines: VecDeque::with_capacity(max_lines.min(DEFAULT_MAX_LINES)),
            max_lines,
            progress: None,
            finished: false,
            error: None,
        }
    }

    /// Append a chunk of output. Each newline-separated piece becomes a line;
    /// a trailing empty piece is not recorded.
    pub fn on_chunk(&mut self, text: &str, kind: LineKind) {
        for line in text.split_terminator('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            self.push(OutputLine {
                text: line.to_string(),
                kind,
            });
        }
    }

    fn push(&mut self, line: OutputLine) {
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    /// Record a progress fraction, clamped to [0, 1]. Values are taken as
    /// reported, even when they move backwards. NaN is ignored.
    pub fn on_progress(&mut self, fraction: f64) {
        if fraction.is_nan() {
            return;
        }
        self.progress = Some(fraction.clamp(0.0, 1.0));
    }

    pub fn on_complete(&mut self, error: Option<String>) {
        self.finished = true;
        match error {
            None => {
                self.progress = Some(1.0);
                self.error = None;
            }
            Some(message) => self.error = Some(message),
        }
    }

    pub fn lines(&self) -> impl Iterator<Item = &OutputLine> {
        self.lines.iter()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn progress(&self) -> Option<f64> {
        self.progress
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn succeeded(&self) -> bool {
        self.finished && self.error.is_none()
    }

    /// All retained lines joined with newlines.
    pub fn text(&self) -> String {
        self.lines
            .iter()
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}
