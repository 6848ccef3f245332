use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CloudProvider {
    #[serde(rename = "s3")]
    S3,
    #[serde(rename = "b2")]
    B2,
    #[serde(rename = "azure")]
    Azure,
    #[serde(rename = "gcs")]
    GoogleCloudStorage,
    #[serde(rename = "swift")]
    Swift,
    #[serde(rename = "rclone")]
    Rclone,
    #[serde(rename = "sftp")]
    Sftp,
    #[serde(rename = "rest")]
    RestServer,
    #[serde(rename = "icloud")]
    ICloud,
    #[serde(rename = "dropbox")]
    Dropbox,
    #[serde(rename = "google_drive")]
    GoogleDrive,
    #[serde(rename = "onedrive")]
    OneDrive,
    #[serde(rename = "box")]
    Box,
}

impl CloudProvider {
    /// Guess the provider from a repository location: either a restic
    /// backend prefix or a local folder kept in sync by a cloud client.
    pub fn detect(location: &str) -> Option<Self> {
        let backends = [
            ("s3:", CloudProvider::S3),
            ("b2:", CloudProvider::B2),
            ("azure:", CloudProvider::Azure),
            ("gs:", CloudProvider::GoogleCloudStorage),
            ("swift:", CloudProvider::Swift),
            ("rclone:", CloudProvider::Rclone),
            ("sftp:", CloudProvider::Sftp),
            ("rest:", CloudProvider::RestServer),
        ];
        let backend = backends
            .iter()
            .find(|(prefix, _)| location.starts_with(prefix));
        if let Some((_, provider)) = backend {
            return Some(*provider);
        }

        let path = Path::new(location);
        if path_contains(path, &["Library", "Mobile Documents"]) {
            return Some(CloudProvider::ICloud);
        }

        let components: Vec<String> = path
            .components()
            .filter_map(|c| match c {
                Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();

        // ~/Library/CloudStorage/<Provider>-<account>
        if let Some(pos) = components.iter().position(|c| c == "CloudStorage") {
            if let Some(folder) = components.get(pos + 1) {
                let folder = folder.to_lowercase();
                let synced = [
                    ("dropbox", CloudProvider::Dropbox),
                    ("googledrive", CloudProvider::GoogleDrive),
                    ("onedrive", CloudProvider::OneDrive),
                    ("box", CloudProvider::Box),
                ];
                let found = synced.iter().find(|(name, _)| folder.starts_with(name));
                if let Some((_, provider)) = found {
                    return Some(*provider);
                }
            }
        }

        components.iter().find_map(|c| match c.as_str() {
            "Dropbox" => Some(CloudProvider::Dropbox),
            "Google Drive" => Some(CloudProvider::GoogleDrive),
            "OneDrive" => Some(CloudProvider::OneDrive),
            _ => None,
        })
    }
}

impl std::fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CloudProvider::S3 => "S3",
            CloudProvider::B2 => "B2",
            CloudProvider::Azure => "Azure",
            CloudProvider::GoogleCloudStorage => "GCS",
            CloudProvider::Swift => "Swift",
            CloudProvider::Rclone => "rclone",
            CloudProvider::Sftp => "SFTP",
            CloudProvider::RestServer => "REST server",
            CloudProvider::ICloud => "iCloud",
            CloudProvider::Dropbox => "Dropbox",
            CloudProvider::GoogleDrive => "Google Drive",
            CloudProvider::OneDrive => "OneDrive",
            CloudProvider::Box => "Box",
        };
        f.write_str(name)
    }
}

fn path_contains(path: &Path, sequence: &[&str]) -> bool {
    let names: Vec<_> = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    names
        .windows(sequence.len())
        .any(|w| w.iter().zip(sequence).all(|(a, b)| a == b))
}

/// A known repository. The password is never part of it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Repository {
    pub path: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_provider: Option<CloudProvider>,
}

impl Repository {
    pub fn new(path: impl Into<String>, name: impl Into<String>) -> Self {
        let path = path.into();
        let cloud_provider = CloudProvider::detect(&path);
        Self {
            path,
            name: name.into(),
            cloud_provider,
        }
    }

    /// A repository named after the last component of its location.
    pub fn from_path(path: impl Into<String>) -> Self {
        let path = path.into();
        let name = Path::new(&path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.clone());
        Self::new(path, name)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    repositories: Vec<Repository>,
}

/// The persisted list of known repositories.
#[derive(Debug, Clone)]
pub struct RepositoryCatalog {
    file: PathBuf,
}

impl RepositoryCatalog {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self { file: file.into() }
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    /// Load all repositories, de-duplicated by path (later entries win) and
    /// sorted by path. A missing file is an empty catalog.
    pub async fn load(&self) -> Result<Vec<Repository>> {
        let content = match tokio::fs::read_to_string(&self.file).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No catalog at {}", self.file.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let parsed: CatalogFile = if content.trim().is_empty() {
            CatalogFile::default()
        } else {
            serde_yaml::from_str(&content)?
        };

        let repositories = dedupe(parsed.repositories);
        debug!("Loaded {} repositories from {}", repositories.len(), self.file.display());
        Ok(repositories)
    }

    /// Replace the stored catalog with `repositories`.
    pub async fn save(&self, repositories: &[Repository]) -> Result<()> {
        if let Some(parent) = self.file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = CatalogFile {
            repositories: dedupe(repositories.to_vec()),
        };
        let content = serde_yaml::to_string(&file)?;

        let tmp = self.file.with_extension("yaml.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.file).await?;

        debug!("Saved {} repositories to {}", file.repositories.len(), self.file.display());
        Ok(())
    }

    /// Add or replace the entry with the same path.
    pub async fn upsert(&self, repository: Repository) -> Result<Vec<Repository>> {
        let mut repositories = self.load().await?;
        repositories.retain(|r| r.path != repository.path);
        repositories.push(repository);
        let repositories = dedupe(repositories);
        self.save(&repositories).await?;
        Ok(repositories)
    }

    /// Remove the entry for `path`. Returns whether one existed.
    pub async fn remove(&self, path: &str) -> Result<bool> {
        let mut repositories = self.load().await?;
        let before = repositories.len();
        repositories.retain(|r| r.path != path);
        let removed = repositories.len() != before;
        if removed {
            self.save(&repositories).await?;
        }
        Ok(removed)
    }
}

fn dedupe(repositories: Vec<Repository>) -> Vec<Repository> {
    let by_path: BTreeMap<String, Repository> = repositories
        .into_iter()
        .map(|r| (r.path.clone(), r))
        .collect();
    by_path.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    #[rstest]
    #[case("s3:s3.amazonaws.com/bucket/restic", Some(CloudProvider::S3))]
    #[case("b2:bucket:path", Some(CloudProvider::B2))]
    #[case("rclone:remote:backups", Some(CloudProvider::Rclone))]
    #[case("sftp:user@host:/srv/restic", Some(CloudProvider::Sftp))]
    #[case("/Users/me/Library/Mobile Documents/com~apple~CloudDocs/restic", Some(CloudProvider::ICloud))]
    #[case("/Users/me/Library/CloudStorage/Dropbox/restic", Some(CloudProvider::Dropbox))]
    #[case("/Users/me/Library/CloudStorage/GoogleDrive-me@example.com/My Drive/restic", Some(CloudProvider::GoogleDrive))]
    #[case("/Users/me/Library/CloudStorage/OneDrive-Personal/restic", Some(CloudProvider::OneDrive))]
    #[case("/home/me/Dropbox/restic", Some(CloudProvider::Dropbox))]
    #[case("/Volumes/Backup/restic", None)]
    #[case("/home/me/dropbox-notes", None)]
    fn test_detect_provider(#[case] location: &str, #[case] expected: Option<CloudProvider>) {
        assert_eq!(CloudProvider::detect(location), expected);
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let catalog = RepositoryCatalog::new(temp_dir.path().join("repositories.yaml"));
        assert!(catalog.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_overwrites_and_dedupes() {
        let temp_dir = TempDir::new().unwrap();
        let catalog = RepositoryCatalog::new(temp_dir.path().join("nested").join("repositories.yaml"));

        catalog
            .save(&[
                Repository::new("/b", "B"),
                Repository::new("/a", "A"),
                Repository::new("/b", "B renamed"),
            ])
            .await
            .unwrap();

        let loaded = catalog.load().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].path, "/a");
        assert_eq!(loaded[1].name, "B renamed");

        catalog.save(&[Repository::new("/c", "C")]).await.unwrap();
        let loaded = catalog.load().await.unwrap();
        assert_eq!(loaded, vec![Repository::new("/c", "C")]);
    }

    #[tokio::test]
    async fn test_upsert_and_remove() {
        let temp_dir = TempDir::new().unwrap();
        let catalog = RepositoryCatalog::new(temp_dir.path().join("repositories.yaml"));

        catalog.upsert(Repository::from_path("/backups/laptop")).await.unwrap();
        let all = catalog
            .upsert(Repository::new("s3:host/bucket", "Offsite"))
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, "laptop");
        assert_eq!(all[1].cloud_provider, Some(CloudProvider::S3));

        assert!(catalog.remove("/backups/laptop").await.unwrap());
        assert!(!catalog.remove("/backups/laptop").await.unwrap());
        assert_eq!(catalog.load().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_never_contains_password_field() {
        let temp_dir = TempDir::new().unwrap();
        let catalog = RepositoryCatalog::new(temp_dir.path().join("repositories.yaml"));
        catalog.save(&[Repository::new("/repo", "Repo")]).await.unwrap();

        let content = std::fs::read_to_string(catalog.file()).unwrap();
        assert!(content.contains("path: /repo"));
        assert!(!content.contains("password"));
    }
}
