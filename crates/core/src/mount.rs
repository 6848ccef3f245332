use crate::{DeckError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MountPoint {
    pub path: PathBuf,
    pub repository: String,
    pub snapshot: Option<String>,
    pub started_at: DateTime<Utc>,
    /// Run serving this mount.
    pub run: Uuid,
}

impl MountPoint {
    pub fn new(
        path: impl Into<PathBuf>,
        repository: impl Into<String>,
        snapshot: Option<String>,
        run: Uuid,
    ) -> Self {
        Self {
            path: path.into(),
            repository: repository.into(),
            snapshot,
            started_at: Utc::now(),
            run,
        }
    }

    /// Where the requested content can be browsed.
    pub fn browse_path(&self) -> PathBuf {
        match self.snapshot {
            Some(ref id) => self.path.join("ids").join(id),
            None => self.path.clone(),
        }
    }
}

/// Live mounts keyed by mount path.
#[derive(Debug, Clone, Default)]
pub struct MountRegistry {
    mounts: BTreeMap<PathBuf, MountPoint>,
}

impl MountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mount. An occupied path is a conflict and the existing
    /// entry stays as it was.
    pub fn mount(&mut self, mount: MountPoint) -> Result<()> {
        if self.mounts.contains_key(&mount.path) {
            return Err(DeckError::MountConflict(mount.path));
        }
        self.mounts.insert(mount.path.clone(), mount);
        Ok(())
    }

    pub fn unmount(&mut self, path: &Path) -> Result<MountPoint> {
        self.mounts
            .remove(path)
            .ok_or_else(|| DeckError::NotMounted(path.to_path_buf()))
    }

    /// Drop the entry served by `run`, if there still is one.
    pub fn remove_run(&mut self, run: Uuid) -> Option<MountPoint> {
        let path = self
            .mounts
            .values()
            .find(|m| m.run == run)
            .map(|m| m.path.clone())?;
        self.mounts.remove(&path)
    }

    pub fn list(&self) -> Vec<MountPoint> {
        self.mounts.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mount_at(path: &str, repository: &str) -> MountPoint {
        MountPoint::new(path, repository, None, Uuid::new_v4())
    }

    #[test]
    fn test_conflict_keeps_existing_entry() {
        let mut registry = MountRegistry::new();
        let first = mount_at("/Volumes/restic", "/repo-a");
        registry.mount(first.clone()).unwrap();

        let err = registry.mount(mount_at("/Volumes/restic", "/repo-b")).unwrap_err();
        assert!(matches!(
            err,
            DeckError::MountConflict(ref p) if p == Path::new("/Volumes/restic")
        ));
        assert_eq!(registry.list(), vec![first]);
    }

    #[test]
    fn test_unmount_removes_only_that_path() {
        let mut registry = MountRegistry::new();
        registry.mount(mount_at("/mnt/a", "/repo")).unwrap();
        registry.mount(mount_at("/mnt/b", "/repo")).unwrap();
        registry.mount(mount_at("/mnt/c", "/other")).unwrap();

        let removed = registry.unmount(Path::new("/mnt/b")).unwrap();
        assert_eq!(removed.path, PathBuf::from("/mnt/b"));

        let remaining: Vec<PathBuf> = registry.list().into_iter().map(|m| m.path).collect();
        assert_eq!(remaining, vec![PathBuf::from("/mnt/a"), PathBuf::from("/mnt/c")]);

        assert!(matches!(
            registry.unmount(Path::new("/mnt/b")),
            Err(DeckError::NotMounted(_))
        ));
    }

    #[test]
    fn test_remount_after_unmount() {
        let mut registry = MountRegistry::new();
        registry.mount(mount_at("/mnt/a", "/repo")).unwrap();
        registry.unmount(Path::new("/mnt/a")).unwrap();
        assert!(registry.mount(mount_at("/mnt/a", "/repo")).is_ok());
    }

    #[test]
    fn test_remove_by_run() {
        let mut registry = MountRegistry::new();
        let mount = mount_at("/mnt/a", "/repo");
        let run = mount.run;
        registry.mount(mount).unwrap();
        registry.mount(mount_at("/mnt/b", "/repo")).unwrap();

        assert!(registry.remove_run(run).is_some());
        assert!(registry.remove_run(run).is_none());
        let remaining: Vec<PathBuf> = registry.list().into_iter().map(|m| m.path).collect();
        assert_eq!(remaining, vec![PathBuf::from("/mnt/b")]);
    }

    #[test]
    fn test_browse_path() {
        let snapshot = Some("0f1e2d3c".to_string());
        let mount = MountPoint::new("/mnt/a", "/repo", snapshot, Uuid::new_v4());
        assert_eq!(mount.browse_path(), PathBuf::from("/mnt/a/ids/0f1e2d3c"));
    }
}
