//! Line-oriented progress parser for renderer and tool output.
//!
//! The parser is pull-based: the caller hands it one line at a time and it
//! never blocks. Frame numbers are recognised by an ordered table of
//! [`FramePattern`]s evaluated first-match-wins, so the table order is part
//! of the contract (renderer output formats differ by engine and version).

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::error::CoreError;
use crate::types::FrameNumber;

/// Recognised "tile finished" marker, e.g. `Rendered 12/64 Tiles`.
static TILE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Rendered (\d+)/(\d+) Tiles").expect("valid tile pattern"));

/// Built-in frame patterns, in evaluation order.
const DEFAULT_FRAME_PATTERNS: &[(&str, &str)] = &[
    ("cycles_fra", r"Fra:(\d+)"),
    ("saved_file", r"Saved: '.*render_(\d+)\..*'"),
    ("rendering_n_of_total", r"Rendering (\d+) / (\d+)"),
    ("frame_n", r"Frame (\d+)"),
];

static DEFAULT_PATTERNS: LazyLock<Vec<FramePattern>> = LazyLock::new(|| {
    DEFAULT_FRAME_PATTERNS
        .iter()
        .map(|(name, pattern)| FramePattern::new(*name, pattern).expect("valid built-in pattern"))
        .collect()
});

/// One entry of the frame-pattern table. Capture group 1 must hold the
/// frame number.
#[derive(Debug, Clone)]
pub struct FramePattern {
    name: String,
    regex: Regex,
}

impl FramePattern {
    pub fn new(name: impl Into<String>, pattern: &str) -> Result<Self, CoreError> {
        let regex = Regex::new(pattern)
            .map_err(|e| CoreError::Configuration(format!("Invalid frame pattern: {e}")))?;
        if regex.captures_len() < 2 {
            return Err(CoreError::Configuration(format!(
                "Frame pattern '{pattern}' needs a capture group for the frame number"
            )));
        }
        Ok(Self {
            name: name.into(),
            regex,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn frame_in(&self, line: &str) -> Option<FrameNumber> {
        self.regex
            .captures(line)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }
}

/// The built-in frame pattern table.
pub fn default_frame_patterns() -> Vec<FramePattern> {
    DEFAULT_PATTERNS.clone()
}

/// Progress carried by a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressEvent {
    FrameCompleted { frame: FrameNumber },
    TileProgress { done: u32, total: u32 },
}

/// Error or warning marker carried by a line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "line", rename_all = "snake_case")]
pub enum Diagnostic {
    Error(String),
    Warning(String),
}

/// Everything the parser extracted from one line. Both fields `None` is
/// the "no event" outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineEvents {
    pub progress: Option<ProgressEvent>,
    pub diagnostic: Option<Diagnostic>,
    /// Name of the frame pattern behind a `FrameCompleted` event.
    pub pattern: Option<String>,
}

impl LineEvents {
    pub fn is_empty(&self) -> bool {
        self.progress.is_none() && self.diagnostic.is_none()
    }
}

/// Stateful parser for one output stream.
///
/// Remembers the last reported frame so that out-of-order or stale lines
/// never move progress backwards.
#[derive(Debug, Clone)]
pub struct StreamProgressParser {
    patterns: Vec<FramePattern>,
    last_frame: Option<FrameNumber>,
}

impl Default for StreamProgressParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamProgressParser {
    /// Parser using [`default_frame_patterns`].
    pub fn new() -> Self {
        Self::with_patterns(default_frame_patterns())
    }

    /// Parser using a caller-supplied pattern table.
    pub fn with_patterns(patterns: Vec<FramePattern>) -> Self {
        Self {
            patterns,
            last_frame: None,
        }
    }

    pub fn last_frame(&self) -> Option<FrameNumber> {
        self.last_frame
    }

    /// Classify one line of output.
    pub fn parse_line(&mut self, line: &str) -> LineEvents {
        let diagnostic = classify_diagnostic(line);
        let matched = self
            .patterns
            .iter()
            .find_map(|p| p.frame_in(line).map(|frame| (p.name(), frame)));

        match matched {
            Some((name, frame)) => {
                if self.last_frame.is_some_and(|last| frame < last) {
                    return LineEvents {
                        diagnostic,
                        ..LineEvents::default()
                    };
                }
                let pattern = Some(name.to_string());
                self.last_frame = Some(frame);
                LineEvents {
                    progress: Some(ProgressEvent::FrameCompleted { frame }),
                    diagnostic,
                    pattern,
                }
            }
            None => LineEvents {
                progress: tile_progress(line),
                diagnostic,
                pattern: None,
            },
        }
    }
}

fn tile_progress(line: &str) -> Option<ProgressEvent> {
    let caps = TILE_PATTERN.captures(line)?;
    let done = caps.get(1)?.as_str().parse().ok()?;
    let total = caps.get(2)?.as_str().parse().ok()?;
    Some(ProgressEvent::TileProgress { done, total })
}

/// Error markers win over warning markers; matching is case-sensitive.
fn classify_diagnostic(line: &str) -> Option<Diagnostic> {
    if line.contains("ERROR") || line.contains("Error") {
        Some(Diagnostic::Error(line.to_string()))
    } else if line.contains("WARNING") || line.contains("Warning") {
        Some(Diagnostic::Warning(line.to_string()))
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
