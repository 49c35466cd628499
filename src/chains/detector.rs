//! Continuation detection over a single transcript file.
//!
//! A transcript is newline-delimited JSON, one event per line. When a session
//! hits its context limit the assistant writes a compaction boundary record
//! (`type: "system"`, `subtype: "compact_boundary"`) carrying the `sessionId`
//! it was written under. A boundary stamped with a foreign session id makes
//! the file a child of that session; a boundary stamped with the file's own id
//! marks the file as a parent and names the successor in its free text.

use std::path::Path;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

use crate::error::DetectionError;

const BOUNDARY_SUBTYPE: &str = "compact_boundary";

static UUID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b")
        .expect("UUID pattern is valid")
});

static SESSION_ID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$")
        .expect("session id pattern is valid")
});

/// A successor session named by one of the file's own boundary records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Successor {
    /// The continuing session.
    pub session_id: String,
    /// Timestamp of the boundary that named it.
    pub boundary_at: Option<DateTime<Utc>>,
}

/// Continuation signals extracted from one transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    /// Session id derived from the file name.
    pub session_id: String,
    /// Whether the file continues another session.
    pub is_child: bool,
    /// The session this file continues.
    pub parent_id: Option<String>,
    /// Boundary timestamp at which the continuation started.
    pub child_started_at: Option<DateTime<Utc>>,
    /// Whether the file spawned at least one successor.
    pub is_parent: bool,
    /// Successors named by the file's own boundaries, in file order.
    pub successors: Vec<Successor>,
    /// Timestamp of the last boundary record in the file.
    pub last_boundary: Option<DateTime<Utc>>,
    /// Number of boundary records seen.
    pub boundary_count: usize,
    /// Boundary-looking lines that failed to parse.
    pub skipped_lines: usize,
}

impl DetectionResult {
    /// A result carrying no continuation data.
    pub fn empty(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            is_child: false,
            parent_id: None,
            child_started_at: None,
            is_parent: false,
            successors: Vec::new(),
            last_boundary: None,
            boundary_count: 0,
            skipped_lines: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
struct BoundaryRecord {
    #[serde(rename = "type")]
    record_type: Option<String>,
    subtype: Option<String>,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    timestamp: Option<String>,
    content: Option<Value>,
    message: Option<Value>,
}

impl BoundaryRecord {
    fn is_boundary(&self) -> bool {
        self.record_type.as_deref() == Some("system")
            && self.subtype.as_deref() == Some(BOUNDARY_SUBTYPE)
    }

    fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    fn text(&self) -> String {
        let mut text = String::new();
        if let Some(content) = &self.content {
            collect_text(content, &mut text);
        }
        if let Some(content) = self.message.as_ref().and_then(|m| m.get("content")) {
            collect_text(content, &mut text);
        }
        text
    }
}

fn collect_text(value: &Value, out: &mut String) {
    match value {
        Value::String(s) => {
            out.push_str(s);
            out.push('\n');
        }
        Value::Array(parts) => {
            for part in parts {
                match part {
                    Value::String(_) => collect_text(part, out),
                    Value::Object(_) => {
                        if let Some(text) = part.get("text") {
                            collect_text(text, out);
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
}

/// Whether `id` has the hyphenated UUID shape session ids use.
pub fn is_valid_session_id(id: &str) -> bool {
    SESSION_ID_PATTERN.is_match(id)
}

/// Session id of a transcript: its file stem, lowercased.
pub fn session_id_from_path(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.to_ascii_lowercase())
}

/// First UUID in `text` other than `exclude`.
pub fn extract_successor_id(text: &str, exclude: &str) -> Option<String> {
    UUID_PATTERN
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .find(|id| !id.eq_ignore_ascii_case(exclude))
}

/// Detect continuation signals, degrading any failure to an empty result.
pub async fn detect(path: &Path) -> DetectionResult {
    match try_detect(path).await {
        Ok(result) => result,
        Err(e) => {
            warn!(error = %e, "Transcript unreadable; treating as having no continuation data");
            DetectionResult::empty(session_id_from_path(path).unwrap_or_default())
        }
    }
}

/// Detect continuation signals, streaming the file line by line.
///
/// Malformed lines are skipped individually; only failing to open or read
/// the file is an error.
pub async fn try_detect(path: &Path) -> Result<DetectionResult, DetectionError> {
    let io_err = |source| DetectionError::Io {
        path: path.display().to_string(),
        source,
    };

    let own_id = session_id_from_path(path).unwrap_or_default();
    let mut result = DetectionResult::empty(own_id.clone());

    let file = File::open(path).await.map_err(io_err)?;
    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    let mut line_no = 0usize;

    loop {
        buf.clear();
        let read = reader.read_until(b'\n', &mut buf).await.map_err(io_err)?;
        if read == 0 {
            break;
        }
        line_no += 1;

        let Ok(line) = std::str::from_utf8(&buf) else {
            debug!(line = line_no, "Skipping non-UTF-8 transcript line");
            continue;
        };
        // Cheap pre-filter: only boundary records are worth parsing
        if !line.contains(BOUNDARY_SUBTYPE) {
            continue;
        }

        let record: BoundaryRecord = match serde_json::from_str(line.trim()) {
            Ok(record) => record,
            Err(e) => {
                debug!(line = line_no, error = %e, "Skipping malformed transcript line");
                result.skipped_lines += 1;
                continue;
            }
        };
        if !record.is_boundary() {
            continue;
        }

        apply_boundary(&mut result, &own_id, &record);
    }

    debug!(
        session_id = %result.session_id,
        is_child = result.is_child,
        is_parent = result.is_parent,
        boundaries = result.boundary_count,
        "Transcript scanned"
    );

    Ok(result)
}

fn apply_boundary(result: &mut DetectionResult, own_id: &str, record: &BoundaryRecord) {
    result.boundary_count += 1;
    let at = record.timestamp();
    if at.is_some() {
        result.last_boundary = at;
    }

    let Some(stamped) = record.session_id.as_deref() else {
        return;
    };

    if !stamped.eq_ignore_ascii_case(own_id) {
        // The latest foreign boundary names the immediate parent
        result.is_child = true;
        result.parent_id = Some(stamped.to_ascii_lowercase());
        result.child_started_at = at;
        return;
    }

    if let Some(successor) = extract_successor_id(&record.text(), own_id) {
        result.is_parent = true;
        if !result.successors.iter().any(|s| s.session_id == successor) {
            result.successors.push(Successor {
                session_id: successor,
                boundary_at: at,
            });
        }
    }
}
