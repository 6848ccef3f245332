use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeckError {
    #[error("restic is not installed or could not be found")]
    ToolNotInstalled,

    #[error("Failed to start process: {0}")]
    SpawnFailure(String),

    #[error("Process exited with status {code}")]
    NonZeroExit { code: i32, output: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Failed to retrieve secret: {0}")]
    SecretRetrieval(String),

    #[error("Something is already mounted at {}", .0.display())]
    MountConflict(PathBuf),

    #[error("Nothing is mounted at {}", .0.display())]
    NotMounted(PathBuf),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Coordinator is no longer running")]
    CoordinatorStopped,

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl DeckError {
    /// Message suitable for showing to a person. For a failed restic run
    /// the last line restic printed is usually the actual reason.
    pub fn user_message(&self) -> String {
        match self {
            DeckError::ToolNotInstalled => {
                "restic was not found. Install it (e.g. `brew install restic`) \
                 or set restic.binary in the config."
                    .to_string()
            }
            DeckError::NonZeroExit { code, output } => {
                match output.lines().rev().map(str::trim).find(|l| !l.is_empty()) {
                    Some(last) => format!("restic failed (exit code {}): {}", code, last),
                    None => format!("restic failed with exit code {}", code),
                }
            }
            DeckError::MountConflict(path) => {
                format!("{} is already in use by another mount", path.display())
            }
            DeckError::Cancelled => "Cancelled".to_string(),
            other => other.to_string(),
        }
    }

    /// Exit code of the failed process, if the error came from one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            DeckError::NonZeroExit { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, DeckError>;
