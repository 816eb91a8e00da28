//! Package content sources.
//!
//! A [`SourceProvider`] places the content of one package inside a staging
//! directory owned by the store. The store renames the returned package
//! root into place once the provider succeeds, so a provider never writes
//! to a live entry.

use super::error::PkgError;
use super::identity::PackageIdentity;
use super::lockfile::LockResolution;
use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::GzDecoder;
use reqwest::Client;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tar::Archive;
use tracing::debug;
use url::Url;

/// Maximum tarball size (200 MB).
pub const MAX_TARBALL_SIZE: u64 = 200 * 1024 * 1024;

/// Default npm registry URL.
pub const DEFAULT_REGISTRY: &str = "https://registry.npmjs.org/";

const DOWNLOAD_TIMEOUT_SECS: u64 = 30;

/// Fetches and extracts package content.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Populate `staging` (an existing, empty directory) with the package
    /// content for `identity` and return the package root inside it.
    ///
    /// # Errors
    /// Returns `PKG_FETCH_FAILED` if the content cannot be obtained.
    async fn provide(
        &self,
        identity: &PackageIdentity,
        staging: &Path,
    ) -> Result<PathBuf, PkgError>;
}

/// Downloads a gzip tarball and extracts it.
#[derive(Debug, Clone)]
pub struct TarballSource {
    client: Client,
    url: String,
    max_bytes: u64,
}

impl TarballSource {
    /// A source for the tarball at `url`.
    #[must_use]
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            max_bytes: MAX_TARBALL_SIZE,
        }
    }

    /// Override the download size limit.
    #[must_use]
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    async fn download(&self) -> Result<Bytes, PkgError> {
        let response = self
            .client
            .get(&self.url)
            .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| PkgError::fetch_failed(format!("Failed to download '{}': {e}", self.url)))?;

        if !response.status().is_success() {
            return Err(PkgError::fetch_failed(format!(
                "Download failed with status {} for '{}'",
                response.status(),
                self.url
            )));
        }

        if let Some(len) = response.content_length() {
            if len > self.max_bytes {
                return Err(PkgError::fetch_failed(format!(
                    "Tarball too large: {len} bytes (max: {})",
                    self.max_bytes
                )));
            }
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| PkgError::fetch_failed(format!("Failed to read response body: {e}")))?;

        if bytes.len() as u64 > self.max_bytes {
            return Err(PkgError::fetch_failed(format!(
                "Tarball too large: {} bytes (max: {})",
                bytes.len(),
                self.max_bytes
            )));
        }

        Ok(bytes)
    }
}

#[async_trait]
impl SourceProvider for TarballSource {
    async fn provide(
        &self,
        identity: &PackageIdentity,
        staging: &Path,
    ) -> Result<PathBuf, PkgError> {
        debug!(package = %identity, url = %self.url, "downloading tarball");
        let bytes = self.download().await?;
        unpack_tarball(&bytes, staging)
    }
}

/// Copies a package from a local directory.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    dir: PathBuf,
}

impl DirectorySource {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl SourceProvider for DirectorySource {
    async fn provide(
        &self,
        identity: &PackageIdentity,
        staging: &Path,
    ) -> Result<PathBuf, PkgError> {
        if !self.dir.is_dir() {
            return Err(PkgError::fetch_failed(format!(
                "Source directory for {identity} not found: {}",
                self.dir.display()
            )));
        }
        debug!(package = %identity, dir = %self.dir.display(), "copying directory");

        let dest = staging.join("package");
        nodelink_util::fs::copy_dir_all(&self.dir, &dest).map_err(|e| {
            PkgError::fetch_failed(format!(
                "Failed to copy {} for {identity}: {e}",
                self.dir.display()
            ))
        })?;
        Ok(dest)
    }
}

/// Dispatches each identity to the source its lockfile resolution names.
#[derive(Debug, Clone)]
pub struct LockfileSource {
    client: Client,
    registry: Url,
    project_root: PathBuf,
    resolutions: BTreeMap<PackageIdentity, LockResolution>,
}

impl LockfileSource {
    /// Create a source over `resolutions`.
    ///
    /// Relative `file:`/`link:` paths resolve against `project_root`.
    ///
    /// # Errors
    /// Returns an error if the registry URL is invalid.
    pub fn new(
        client: Client,
        registry: &str,
        project_root: impl Into<PathBuf>,
        resolutions: BTreeMap<PackageIdentity, LockResolution>,
    ) -> Result<Self, PkgError> {
        Ok(Self {
            client,
            registry: parse_registry(registry)?,
            project_root: project_root.into(),
            resolutions,
        })
    }

    /// Registry tarball URL for a registry-resolved identity.
    ///
    /// # Errors
    /// Returns an error if the URL cannot be built.
    pub fn registry_tarball_url(
        &self,
        identity: &PackageIdentity,
        registry: &str,
    ) -> Result<String, PkgError> {
        let base = if registry.is_empty() {
            self.registry.clone()
        } else {
            parse_registry(registry)?
        };
        let path = format!(
            "{}/-/{}-{}.tgz",
            identity.name,
            identity.unscoped_name(),
            identity.version
        );
        base.join(&path)
            .map(String::from)
            .map_err(|e| PkgError::fetch_failed(format!("Invalid tarball URL for {identity}: {e}")))
    }
}

#[async_trait]
impl SourceProvider for LockfileSource {
    async fn provide(
        &self,
        identity: &PackageIdentity,
        staging: &Path,
    ) -> Result<PathBuf, PkgError> {
        let resolution = self.resolutions.get(identity).ok_or_else(|| {
            PkgError::fetch_failed(format!("No resolution recorded for {identity}"))
        })?;

        match resolution {
            LockResolution::Registry { registry } => {
                let url = self.registry_tarball_url(identity, registry)?;
                TarballSource::new(self.client.clone(), url)
                    .provide(identity, staging)
                    .await
            }
            LockResolution::Tarball { url } => {
                TarballSource::new(self.client.clone(), url.clone())
                    .provide(identity, staging)
                    .await
            }
            LockResolution::File { path } | LockResolution::Link { path } => {
                DirectorySource::new(self.project_root.join(path))
                    .provide(identity, staging)
                    .await
            }
            LockResolution::Git { url, .. } => Err(PkgError::fetch_failed(format!(
                "Git sources are not supported: {identity} ({url})"
            ))),
        }
    }
}

fn parse_registry(registry: &str) -> Result<Url, PkgError> {
    // Url::join drops the last segment unless the base ends in '/'
    let normalized = if registry.ends_with('/') {
        registry.to_string()
    } else {
        format!("{registry}/")
    };
    Url::parse(&normalized)
        .map_err(|e| PkgError::fetch_failed(format!("Invalid registry URL '{registry}': {e}")))
}

/// Extract a gzip tarball into `staging` and return its package root.
///
/// # Errors
/// Returns `PKG_FETCH_FAILED` for malformed archives, absolute or
/// escaping entry paths, or archives without a single top-level directory.
pub fn unpack_tarball(bytes: &[u8], staging: &Path) -> Result<PathBuf, PkgError> {
    let mut archive = Archive::new(GzDecoder::new(bytes));
    let entries = archive
        .entries()
        .map_err(|e| PkgError::fetch_failed(format!("Failed to read tarball entries: {e}")))?;

    for entry in entries {
        let mut entry = entry
            .map_err(|e| PkgError::fetch_failed(format!("Failed to read tarball entry: {e}")))?;
        let path = entry
            .path()
            .map_err(|e| PkgError::fetch_failed(format!("Failed to read entry path: {e}")))?
            .into_owned();

        if path.is_absolute() {
            return Err(PkgError::fetch_failed(format!(
                "Tarball contains absolute path: {}",
                path.display()
            )));
        }
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(PkgError::fetch_failed(format!(
                "Tarball contains path traversal: {}",
                path.display()
            )));
        }

        let dest = staging.join(&path);
        let kind = entry.header().entry_type();

        if kind.is_dir() {
            fs::create_dir_all(&dest)?;
        } else if kind.is_file() {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = File::create(&dest)?;
            io::copy(&mut entry, &mut file)?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Ok(mode) = entry.header().mode() {
                    let _ = fs::set_permissions(&dest, fs::Permissions::from_mode(mode & 0o777));
                }
            }
        }
        // Symlinks, hardlinks and devices are skipped
    }

    find_package_root(staging)
}

/// npm tarballs nest everything under `package/`; some (e.g. `@types/*`)
/// use another single top-level directory instead.
fn find_package_root(staging: &Path) -> Result<PathBuf, PkgError> {
    let package_dir = staging.join("package");
    if package_dir.is_dir() {
        return Ok(package_dir);
    }

    let dirs: Vec<PathBuf> = fs::read_dir(staging)?
        .filter_map(Result::ok)
        .filter(|e| {
            e.file_type().is_ok_and(|t| t.is_dir())
                && !e.file_name().to_string_lossy().starts_with('.')
        })
        .map(|e| e.path())
        .collect();

    match dirs.as_slice() {
        [only] => Ok(only.clone()),
        [] => Err(PkgError::fetch_failed(
            "Tarball does not contain any top-level directory",
        )),
        many => Err(PkgError::fetch_failed(format!(
            "Tarball contains {} top-level directories, expected 1",
            many.len()
        ))),
    }
}
