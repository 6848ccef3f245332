use crate::{DeckError, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Install locations checked before `PATH`. GUI apps on macOS start with a
/// minimal `PATH` that usually misses Homebrew.
const WELL_KNOWN_LOCATIONS: &[&str] = &[
    "/opt/homebrew/bin/restic",
    "/usr/local/bin/restic",
    "/usr/bin/restic",
    "/opt/local/bin/restic",
];

/// Find the restic executable.
///
/// A configured path must exist; it is not second-guessed by the search.
pub fn locate_restic(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        return if is_executable(path) {
            debug!("Using configured restic at {}", path.display());
            Ok(path.to_path_buf())
        } else {
            Err(DeckError::ToolNotInstalled)
        };
    }

    locate_in(WELL_KNOWN_LOCATIONS.iter().map(Path::new))
        .or_else(|| which::which("restic").ok())
        .map(|path| {
            debug!("Found restic at {}", path.display());
            path
        })
        .ok_or(DeckError::ToolNotInstalled)
}

fn locate_in<'a>(candidates: impl Iterator<Item = &'a Path>) -> Option<PathBuf> {
    candidates.filter(|p| is_executable(p)).map(Path::to_path_buf).next()
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
