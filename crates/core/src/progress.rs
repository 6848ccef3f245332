//! Progress extraction from restic output.
//!
//! `restic backup --json` prints one JSON object per line tagged by
//! `message_type`. Without `--json` restic prints status lines such as
//! `[0:12] 45.67%  120 files 1.2 GiB, total 300 files 4.0 GiB`.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "message_type")]
pub enum BackupMessage {
    #[serde(rename = "status")]
    Status {
        #[serde(default)]
        percent_done: f64,
        #[serde(default)]
        total_files: u64,
        #[serde(default)]
        files_done: u64,
        #[serde(default)]
        total_bytes: u64,
        #[serde(default)]
        bytes_done: u64,
    },
    #[serde(rename = "summary")]
    Summary {
        #[serde(default)]
        files_new: u64,
        #[serde(default)]
        files_changed: u64,
        #[serde(default)]
        files_unmodified: u64,
        #[serde(default)]
        data_added: u64,
        #[serde(default)]
        snapshot_id: Option<String>,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: Option<ErrorDetail>,
        #[serde(default)]
        during: Option<String>,
        #[serde(default)]
        item: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ErrorDetail {
    #[serde(default)]
    pub message: String,
}

impl BackupMessage {
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if !line.starts_with('{') {
            return None;
        }
        serde_json::from_str(line).ok()
    }
}

/// Progress fraction reported by a single output line, if it carries one.
/// The value is returned as restic printed it; clamping is the sink's job.
pub fn parse_progress(line: &str) -> Option<f64> {
    if let Some(message) = BackupMessage::parse(line) {
        return match message {
            BackupMessage::Status { percent_done, .. } => Some(percent_done),
            BackupMessage::Summary { .. } => Some(1.0),
            BackupMessage::Error { .. } => None,
        };
    }

    parse_percent(line)
}

fn parse_percent(line: &str) -> Option<f64> {
    let line = line.trim_start();
    // human status lines start with the elapsed time, e.g. "[1:02:03]"
    let rest = line.strip_prefix('[')?;
    let (_, rest) = rest.split_once(']')?;
    let token = rest.split_whitespace().next()?;
    let number = token.strip_suffix('%')?;
    number.parse::<f64>().ok().map(|p| p / 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(r#"{"message_type":"status","percent_done":0.25,"total_files":4,"files_done":1}"#, Some(0.25))]
    #[case(r#"{"message_type":"summary","files_new":3,"snapshot_id":"4f2a9c"}"#, Some(1.0))]
    #[case(r#"{"message_type":"error","error":{"message":"permission denied"},"during":"archival","item":"/data/x"}"#, None)]
    #[case(r#"{"message_type":"verbose_status","action":"new"}"#, None)]
    #[case("[0:12] 45.67%  120 files 1.2 GiB, total 300 files 4.0 GiB", Some(0.4567))]
    #[case("[1:02:03] 100.00%  done", Some(1.0))]
    #[case("repository 1a2b3c opened (version 2)", None)]
    #[case("50% of something", None)]
    #[case("", None)]
    fn test_parse_progress(#[case] line: &str, #[case] expected: Option<f64>) {
        match (parse_progress(line), expected) {
            (Some(actual), Some(expected)) => assert!((actual - expected).abs() < 1e-9),
            (actual, expected) => assert_eq!(actual, expected),
        }
    }

    #[test]
    fn test_summary_carries_snapshot_id() {
        let message = BackupMessage::parse(
            r#"{"message_type":"summary","files_new":3,"files_changed":1,"data_added":1024,"snapshot_id":"4f2a9c"}"#,
        )
        .unwrap();
        match message {
            BackupMessage::Summary { snapshot_id, files_new, .. } => {
                assert_eq!(snapshot_id.as_deref(), Some("4f2a9c"));
                assert_eq!(files_new, 3);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }
}
