use crate::config::Channel;
use crate::error::Error;
use crate::version::SCHEMA_VERSION;
use std::path::{Path, PathBuf};

/// Find the project root by walking up from `cwd` looking for `package.json`.
///
/// Returns the first directory containing one, or `None`.
#[must_use]
pub fn project_root(cwd: &Path) -> Option<PathBuf> {
    let mut current = cwd.to_path_buf();

    loop {
        if current.join("package.json").is_file() {
            return Some(current);
        }

        if !current.pop() {
            return None;
        }
    }
}

/// Like [`project_root`], but an error when nothing is found.
///
/// # Errors
/// Returns `Error::ProjectNotFound` if no ancestor has a `package.json`.
pub fn require_project_root(cwd: &Path) -> Result<PathBuf, Error> {
    project_root(cwd).ok_or_else(|| Error::ProjectNotFound {
        start: cwd.to_path_buf(),
    })
}

/// Get the cache directory for nodelink.
///
/// Uses platform-appropriate locations with versioning:
/// - Linux: `$XDG_CACHE_HOME/nodelink/v{N}/{channel}` or `~/.cache/nodelink/v{N}/{channel}`
/// - macOS: `~/Library/Caches/nodelink/v{N}/{channel}`
/// - Windows: `%LOCALAPPDATA%\nodelink\v{N}\{channel}`
#[must_use]
pub fn cache_dir(channel: Channel) -> PathBuf {
    let base = dirs_next::cache_dir().map_or_else(
        || {
            dirs_next::home_dir().map_or_else(
                || PathBuf::from(".nodelink-cache"),
                |p| p.join(".cache").join("nodelink"),
            )
        },
        |p| p.join("nodelink"),
    );

    base.join(format!("v{SCHEMA_VERSION}"))
        .join(channel.as_str())
}

/// Default root of the shared package store.
#[must_use]
pub fn store_dir(channel: Channel) -> PathBuf {
    cache_dir(channel).join("store")
}
