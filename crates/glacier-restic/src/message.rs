//! Messages printed by `restic backup --json`.
//!
//! restic writes one JSON object per line, tagged by `message_type`.
//! Anything that is not a JSON object (warnings, stray text) is ignored.

use serde::Deserialize;
use serde_json::Value;

/// A single line of `restic backup --json` output.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum BackupMessage {
    Status(StatusUpdate),
    Summary(BackupSummary),
    Error(ErrorMessage),
    #[serde(other)]
    Other,
}

/// Periodic progress report.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct StatusUpdate {
    /// Completion, 0.0 to 1.0.
    pub percent_done: f64,
    pub total_files: u64,
    pub files_done: u64,
    pub total_bytes: u64,
    pub bytes_done: u64,
    pub error_count: u64,
    pub current_files: Vec<String>,
}

/// Final report of a backup run.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackupSummary {
    pub files_new: u64,
    pub files_changed: u64,
    pub files_unmodified: u64,
    pub data_added: u64,
    pub total_files_processed: u64,
    pub total_bytes_processed: u64,
    pub snapshot_id: Option<String>,
}

/// A per-file error reported during the run.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ErrorMessage {
    /// Either a string or `{"message": "..."}` depending on restic version.
    pub error: Value,
    pub during: String,
    pub item: String,
}

impl ErrorMessage {
    pub fn message(&self) -> String {
        match &self.error {
            Value::String(text) => text.clone(),
            Value::Object(map) => map
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| self.error.to_string()),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// Parse one output line. Returns `None` for lines that are not JSON objects.
pub fn parse_line(line: &str) -> Option<BackupMessage> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    serde_json::from_str(line).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_line() {
        let line = r#"{"message_type":"status","percent_done":0.25,"total_files":8,"files_done":2,"total_bytes":4096,"bytes_done":1024,"current_files":["/data/a"]}"#;
        let Some(BackupMessage::Status(status)) = parse_line(line) else {
            panic!("expected status");
        };
        assert_eq!(status.percent_done, 0.25);
        assert_eq!(status.files_done, 2);
        assert_eq!(status.current_files, vec!["/data/a"]);
        assert_eq!(status.error_count, 0);
    }

    #[test]
    fn test_summary_line() {
        let line = r#"{"message_type":"summary","files_new":3,"files_changed":1,"files_unmodified":10,"data_added":512,"total_files_processed":14,"total_bytes_processed":90000,"snapshot_id":"4f2a9c1d"}"#;
        assert_eq!(
            parse_line(line),
            Some(BackupMessage::Summary(BackupSummary {
                files_new: 3,
                files_changed: 1,
                files_unmodified: 10,
                data_added: 512,
                total_files_processed: 14,
                total_bytes_processed: 90000,
                snapshot_id: Some("4f2a9c1d".to_string()),
            }))
        );
    }

    #[test]
    fn test_error_line_shapes() {
        let nested = r#"{"message_type":"error","error":{"message":"permission denied"},"during":"archival","item":"/data/secret"}"#;
        let Some(BackupMessage::Error(error)) = parse_line(nested) else {
            panic!("expected error");
        };
        assert_eq!(error.message(), "permission denied");
        assert_eq!(error.item, "/data/secret");

        let flat = r#"{"message_type":"error","error":"file vanished","during":"scan","item":"/x"}"#;
        let Some(BackupMessage::Error(error)) = parse_line(flat) else {
            panic!("expected error");
        };
        assert_eq!(error.message(), "file vanished");
    }

    #[test]
    fn test_unknown_and_garbage_lines() {
        assert_eq!(
            parse_line(r#"{"message_type":"verbose_status","action":"new"}"#),
            Some(BackupMessage::Other)
        );
        assert_eq!(parse_line("using parent snapshot 1234"), None);
        assert_eq!(parse_line("{ truncated"), None);
        assert_eq!(parse_line(""), None);
    }
}
