//! Ingestion progress reporting.
//!
//! Reports observable progress during batch ingestion so users see which
//! file is being processed, how much is left, and when the index is up to
//! date. Progress is emitted on **stderr** so stdout remains parseable for
//! scripts.
//!
//! The engine publishes events through the [`ProgressReporter`] trait; it
//! never knows which frontend (human terminal, JSON consumer, nothing) is
//! listening.

use std::io::Write;

/// A single progress event during ingestion.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// A file is being split into chunks.
    Chunking {
        current: u64,
        total: u64,
        file: String,
    },
    /// A file's chunks are being embedded and inserted.
    Embedding {
        current: u64,
        total: u64,
        file: String,
    },
    /// The batch finished (normally, cancelled, or budget-stopped).
    Done { total: u64 },
}

/// Reports ingestion progress. Implementations write to stderr.
pub trait ProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the ingestion pipeline.
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr:
/// `"index 12 / 340  embedding  docs/setup.md"`.
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Chunking {
                current,
                total,
                file,
            } => format!(
                "index {} / {}  chunking  {}\n",
                format_number(*current),
                format_number(*total),
                file
            ),
            ProgressEvent::Embedding {
                current,
                total,
                file,
            } => format!(
                "index {} / {}  embedding  {}\n",
                format_number(*current),
                format_number(*total),
                file
            ),
            ProgressEvent::Done { total } => {
                format!("index done  {} files\n", format_number(*total))
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Chunking {
                current,
                total,
                file,
            } => serde_json::json!({
                "event": "progress",
                "phase": "chunking",
                "current": current,
                "total": total,
                "file": file
            }),
            ProgressEvent::Embedding {
                current,
                total,
                file,
            } => serde_json::json!({
                "event": "progress",
                "phase": "embedding",
                "current": current,
                "total": total,
                "file": file
            }),
            ProgressEvent::Done { total } => serde_json::json!({
                "event": "progress",
                "phase": "done",
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Group digits with commas for human-readable counters.
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Build a reporter for this mode. Caller passes it to batch ingestion.
    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(1), "1");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234), "1,234");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
