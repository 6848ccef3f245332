use crate::snapshot::SnapshotSummary;
use crate::{DeckError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Directories every restic repository has next to its `config` file.
const REPOSITORY_DIRS: &[&str] = &["data", "index", "keys", "snapshots"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanResult {
    pub path: PathBuf,
    /// The full repository layout is present.
    pub valid: bool,
    pub snapshots: Vec<SnapshotSummary>,
}

pub struct RepositoryScanner {
    max_depth: usize,
}

impl RepositoryScanner {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    /// Find restic repositories under `root`. A directory counts as a
    /// candidate when it has a `config` file and at least one of the
    /// repository directories; candidates are not descended into.
    pub fn scan(&self, root: &Path) -> Result<Vec<ScanResult>> {
        if !root.is_dir() {
            return Err(DeckError::InvalidConfiguration(format!(
                "{} is not a directory",
                root.display()
            )));
        }

        debug!("Scanning {} for repositories (depth {})", root.display(), self.max_depth);
        let mut results = Vec::new();
        let mut walker = WalkDir::new(root)
            .max_depth(self.max_depth)
            .follow_links(false)
            .into_iter();

        while let Some(entry) = walker.next() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };

            if !entry.file_type().is_dir() {
                continue;
            }

            if let Some(valid) = inspect(entry.path()) {
                debug!("Found repository at {} (valid: {})", entry.path().display(), valid);
                results.push(ScanResult {
                    path: entry.path().to_path_buf(),
                    valid,
                    snapshots: Vec::new(),
                });
                walker.skip_current_dir();
            }
        }

        debug!("Scan found {} repositories", results.len());
        Ok(results)
    }
}

/// `None` if `dir` is not a repository at all, otherwise whether its layout
/// is complete.
fn inspect(dir: &Path) -> Option<bool> {
    if !dir.join("config").is_file() {
        return None;
    }

    let present = REPOSITORY_DIRS
        .iter()
        .filter(|name| dir.join(name).is_dir())
        .count();

    match present {
        0 => None,
        n => Some(n == REPOSITORY_DIRS.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn make_repo(path: &Path, dirs: &[&str]) {
        fs::create_dir_all(path).unwrap();
        fs::write(path.join("config"), b"binary").unwrap();
        for dir in dirs {
            fs::create_dir_all(path.join(dir)).unwrap();
        }
    }

    #[test]
    fn test_scan_finds_repositories() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        make_repo(&root.join("laptop"), REPOSITORY_DIRS);
        make_repo(&root.join("nested").join("broken"), &["data", "keys"]);
        fs::create_dir_all(root.join("photos").join("2024")).unwrap();
        fs::write(root.join("photos").join("config"), b"not a repo").unwrap();

        let mut results = RepositoryScanner::new(3).scan(root).unwrap();
        results.sort_by(|a, b| a.path.cmp(&b.path));

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].path, root.join("laptop"));
        assert!(results[0].valid);
        assert_eq!(results[1].path, root.join("nested").join("broken"));
        assert!(!results[1].valid);
        assert!(results.iter().all(|r| r.snapshots.is_empty()));
    }

    #[test]
    fn test_scan_does_not_descend_into_repositories() {
        let temp_dir = TempDir::new().unwrap();
        let repo = temp_dir.path().join("repo");
        make_repo(&repo, REPOSITORY_DIRS);
        // looks like a repository but lives inside one
        make_repo(&repo.join("data").join("inner"), REPOSITORY_DIRS);

        let results = RepositoryScanner::new(5).scan(temp_dir.path()).unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_scan_respects_depth() {
        let temp_dir = TempDir::new().unwrap();
        make_repo(&temp_dir.path().join("a").join("b").join("c"), REPOSITORY_DIRS);

        assert!(RepositoryScanner::new(2).scan(temp_dir.path()).unwrap().is_empty());
        assert_eq!(RepositoryScanner::new(3).scan(temp_dir.path()).unwrap().len(), 1);
    }

    #[test]
    fn test_scan_root_must_be_directory() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("file");
        fs::write(&file, b"").unwrap();
        assert!(RepositoryScanner::new(3).scan(&file).is_err());
    }
}
