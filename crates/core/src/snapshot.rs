use crate::{DeckError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One entry of `restic snapshots --json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotSummary {
    pub id: String,
    #[serde(default)]
    pub short_id: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl SnapshotSummary {
    /// The short id restic shows in tables; older restic versions leave
    /// `short_id` out of the JSON.
    pub fn display_id(&self) -> &str {
        if !self.short_id.is_empty() {
            &self.short_id
        } else {
            self.id.get(..8).unwrap_or(&self.id)
        }
    }
}

/// Parse snapshot listing output, newest first.
pub fn parse_snapshots(json: &str) -> Result<Vec<SnapshotSummary>> {
    let trimmed = json.trim();
    // restic prints "null" for an empty repository in some versions
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }

    let mut snapshots: Vec<SnapshotSummary> = serde_json::from_str(trimmed)?;
    snapshots.sort_by(|a, b| b.time.cmp(&a.time));
    Ok(snapshots)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResticVersion {
    pub version: String,
    pub go_version: Option<String>,
    pub platform: Option<String>,
}

/// Parse `restic version` output, e.g.
/// `restic 0.16.4 compiled with go1.21.6 on darwin/arm64`.
pub fn parse_version(output: &str) -> Result<ResticVersion> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|l| l.starts_with("restic "))
        .ok_or_else(|| DeckError::Parse(format!("unexpected version output: {}", output.trim())))?;

    let mut words = line.split_whitespace().skip(1);
    let version = words
        .next()
        .ok_or_else(|| DeckError::Parse("missing version number".to_string()))?
        .to_string();

    let rest: Vec<&str> = words.collect();
    let go_version = rest
        .windows(2)
        .find(|w| w[0] == "with")
        .map(|w| w[1].to_string());
    let platform = rest
        .windows(2)
        .find(|w| w[0] == "on")
        .map(|w| w[1].to_string());

    Ok(ResticVersion {
        version,
        go_version,
        platform,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const LISTING: &str = r#"[
        {"time":"2024-03-01T10:00:00.123456789+01:00","tree":"aa","paths":["/data"],"hostname":"mac","username":"me","id":"0f1e2d3c4b5a69788796a5b4c3d2e1f00f1e2d3c4b5a69788796a5b4c3d2e1f0","short_id":"0f1e2d3c"},
        {"time":"2024-03-02T10:00:00Z","tree":"bb","paths":["/data","/etc"],"hostname":"mac","tags":["daily"],"id":"1234567890abcdef1234567890abcdef1234567890abcdef1234567890abcdef"}
    ]"#;

    #[test]
    fn test_parse_snapshots_newest_first() {
        let snapshots = parse_snapshots(LISTING).unwrap();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].display_id(), "12345678");
        assert_eq!(snapshots[0].tags, vec!["daily".to_string()]);
        assert_eq!(snapshots[1].display_id(), "0f1e2d3c");
        assert_eq!(snapshots[1].username.as_deref(), Some("me"));
    }

    #[test]
    fn test_display_id_with_multibyte_id() {
        let listing = r#"[{"time":"2024-03-02T10:00:00Z","id":"aééééb"},
                          {"time":"2024-03-01T10:00:00Z","id":"abc"}]"#;
        let snapshots = parse_snapshots(listing).unwrap();
        assert_eq!(snapshots[0].display_id(), "aééééb");
        assert_eq!(snapshots[1].display_id(), "abc");
    }

    #[test]
    fn test_parse_empty_listing() {
        assert!(parse_snapshots("[]").unwrap().is_empty());
        assert!(parse_snapshots("null\n").unwrap().is_empty());
        assert!(parse_snapshots("").unwrap().is_empty());
        assert!(parse_snapshots("not json").is_err());
    }

    #[test]
    fn test_parse_version() {
        let output = "restic 0.16.4 compiled with go1.21.6 on darwin/arm64\n";
        let version = parse_version(output).unwrap();
        assert_eq!(
            version,
            ResticVersion {
                version: "0.16.4".to_string(),
                go_version: Some("go1.21.6".to_string()),
                platform: Some("darwin/arm64".to_string()),
            }
        );

        assert!(matches!(parse_version("command not found"), Err(DeckError::Parse(_))));
    }
}
