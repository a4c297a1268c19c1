//! Result sinks: JSON documents to stdout or files, plus auto-save
//! filename derivation.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
#[allow(unused)]
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("unable to serialize result: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unable to write result: {0}")]
    Io(#[from] std::io::Error),
}

/// Where the JSON document goes: `-` on the command line selects stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSink {
    Stdout,
    File(PathBuf),
}

impl OutputSink {
    pub fn parse(spec: &str) -> Self {
        if spec == "-" {
            OutputSink::Stdout
        } else {
            OutputSink::File(PathBuf::from(spec))
        }
    }
}

/// Serializes `result` to the sink and returns a human description of the
/// destination for the summary line.
pub fn write_json<T: Serialize>(result: &T, sink: &OutputSink) -> Result<String, ReportError> {
    let mut json = serde_json::to_vec_pretty(result)?;
    json.push(b'\n');
    match sink {
        OutputSink::Stdout => {
            std::io::stdout().write_all(&json)?;
            Ok("stdout".to_string())
        }
        OutputSink::File(path) => {
            let mut file = std::fs::File::create(path)?;
            file.write_all(&json)?;
            file.flush()?;
            Ok(path.display().to_string())
        }
    }
}

/// Auto-save filename: `{sanitized_labels}_{YYYY-MM-DD-HHMMSS}.json` in
/// the data directory.
pub fn auto_save_path(data_dir: &Path, labels: &str, start: DateTime<Utc>) -> PathBuf {
    let id = sanitize_labels(labels);
    let stamp = start.format("%Y-%m-%d-%H%M%S");
    if id.is_empty() {
        data_dir.join(format!("{stamp}.json"))
    } else {
        data_dir.join(format!("{id}_{stamp}.json"))
    }
}

/// Keeps `[A-Za-z0-9_-]`, collapsing every other run of characters into a
/// single underscore.
fn sanitize_labels(labels: &str) -> String {
    let mut out = String::with_capacity(labels.len());
    for c in labels.chars() {
        if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
            out.push(c);
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}
