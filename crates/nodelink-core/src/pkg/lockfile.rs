//! Lockfile types for deterministic package installation.
//!
//! The lockfile is the persisted form of a project's resolved dependency
//! graph: every package identity reachable from the project's roots, the
//! exact identity each dependency edge points at, and how to fetch it.
//! Installs consume a lockfile; installs and uninstalls rewrite it.
//!
//! ## File Format
//!
//! The lockfile is a JSON file named `nodelink.lock`:
//!
//! ```json
//! {
//!   "lockfile_version": 1,
//!   "root": { "name": "my-project", "version": "1.0.0" },
//!   "dependencies": {
//!     "camelcase-keys": { "range": "^3.0.0", "kind": "dep", "resolved": "3.0.0" }
//!   },
//!   "packages": {
//!     "camelcase-keys@3.0.0": {
//!       "version": "3.0.0",
//!       "dependencies": { "camelcase": "3.0.0", "map-obj": "1.0.1" }
//!     },
//!     "is-array@1.0.1#a83102a9c117983e": {
//!       "version": "1.0.1",
//!       "resolution": { "tarball": { "url": "http://registry.npmjs.org/is-array/-/is-array-1.0.1.tgz" } }
//!     }
//!   }
//! }
//! ```
//!
//! Dependency edges store a *reference* (`version` or
//! `version#content_key`), so `name@reference` is always a key of
//! `packages`.
//!
//! Tarball and git packages are keyed by their locator. Local (`file`,
//! `link`) packages are keyed by a digest of their directory, taken by
//! [`Lockfile::pin_local_sources`] when a lockfile is installed; until
//! then they carry a provisional key derived from their path.

use super::identity::PackageIdentity;
use super::error::PkgError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

/// Schema version for the lockfile format.
pub const PKG_LOCK_SCHEMA_VERSION: u32 = 1;

/// Lockfile filename.
pub const LOCKFILE_NAME: &str = "nodelink.lock";

/// Lockfile error codes.
pub mod codes {
    /// Lockfile not found at the expected path.
    pub const PKG_LOCK_NOT_FOUND: &str = "PKG_LOCK_NOT_FOUND";
    /// Lockfile has invalid JSON.
    pub const PKG_LOCK_INVALID_JSON: &str = "PKG_LOCK_INVALID_JSON";
    /// Lockfile schema version mismatch.
    pub const PKG_LOCK_VERSION_MISMATCH: &str = "PKG_LOCK_VERSION_MISMATCH";
    /// A key or edge does not name a valid package identity.
    pub const PKG_LOCK_INVALID_KEY: &str = "PKG_LOCK_INVALID_KEY";
    /// Lockfile write failed.
    pub const PKG_LOCK_WRITE_FAILED: &str = "PKG_LOCK_WRITE_FAILED";
}

/// Information about the root package (from package.json).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRoot {
    /// Package name from package.json.
    pub name: String,
    /// Package version from package.json.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl LockRoot {
    /// Create a new root entry.
    #[must_use]
    pub fn new(name: impl Into<String>, version: Option<String>) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

/// Metadata about the lockfile itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LockMeta {
    /// Version of nodelink that generated this lockfile.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodelink_version: Option<String>,
}

/// How a package was resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockResolution {
    /// Resolved from npm registry.
    Registry {
        /// Registry URL (empty string = default registry).
        #[serde(skip_serializing_if = "String::is_empty", default)]
        registry: String,
    },
    /// Resolved from a tarball URL.
    Tarball {
        /// URL to the tarball.
        url: String,
    },
    /// Resolved from a git repository.
    Git {
        /// Git URL.
        url: String,
        /// Commit hash or ref.
        #[serde(rename = "ref")]
        git_ref: String,
    },
    /// Resolved from the local filesystem.
    File {
        /// Path to the package directory, relative to the project root.
        path: String,
    },
    /// Linked from another location (workspace package).
    Link {
        /// Path to the linked package, relative to the project root.
        path: String,
    },
}

impl Default for LockResolution {
    fn default() -> Self {
        Self::Registry {
            registry: String::new(),
        }
    }
}

impl LockResolution {
    /// Content key for non-registry sources.
    ///
    /// Registry payloads are fully identified by name and version and
    /// get no key. For local sources this is only the provisional,
    /// path-derived key; see [`LockPackage::pinned_identity`].
    #[must_use]
    pub fn content_key(&self) -> Option<String> {
        let locator = match self {
            Self::Registry { .. } => return None,
            Self::Tarball { url } => url.clone(),
            Self::Git { url, git_ref } => format!("{url}#{git_ref}"),
            Self::File { path } | Self::Link { path } => path.clone(),
        };
        Some(nodelink_util::hash::content_key(&locator))
    }

    /// Project-relative directory of a local source.
    #[must_use]
    pub fn local_path(&self) -> Option<&str> {
        match self {
            Self::File { path } | Self::Link { path } => Some(path.as_str()),
            _ => None,
        }
    }
}

/// A locked package entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockPackage {
    /// Resolved version string.
    pub version: String,
    /// Subresource integrity hash (e.g., "sha512-..."), when known.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub integrity: String,
    /// How this package was resolved.
    #[serde(default, skip_serializing_if = "is_default_resolution")]
    pub resolution: LockResolution,
    /// Runtime dependencies (name -> resolved reference).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,
    /// Declared executables (name -> path inside the package).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub bin: BTreeMap<String, String>,
}

fn is_default_resolution(r: &LockResolution) -> bool {
    matches!(r, LockResolution::Registry { registry } if registry.is_empty())
}

impl LockPackage {
    /// Create a new locked package entry.
    #[must_use]
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            integrity: String::new(),
            resolution: LockResolution::default(),
            dependencies: BTreeMap::new(),
            bin: BTreeMap::new(),
        }
    }

    /// Set the resolution method.
    #[must_use]
    pub fn with_resolution(mut self, resolution: LockResolution) -> Self {
        self.resolution = resolution;
        self
    }

    /// Add a dependency edge to an exact identity.
    pub fn add_dependency(&mut self, target: &PackageIdentity) {
        self.dependencies
            .insert(target.name.clone(), target.reference());
    }

    /// Declare an executable.
    pub fn add_bin(&mut self, name: impl Into<String>, path: impl Into<String>) {
        self.bin.insert(name.into(), path.into());
    }

    /// The identity this entry describes under `name`.
    ///
    /// # Errors
    /// Returns an error if the name or version is invalid.
    pub fn identity(&self, name: &str) -> Result<PackageIdentity, PkgError> {
        let identity = PackageIdentity::new(name, &self.version)?;
        match self.resolution.content_key() {
            Some(key) => identity.with_content_key(key),
            None => Ok(identity),
        }
    }

    /// The identity this entry describes, with a local source keyed by
    /// the current content of its directory under `project_root`.
    ///
    /// # Errors
    /// Returns `PKG_FETCH_FAILED` if a local source directory cannot be
    /// read, or an error if the name or version is invalid.
    pub fn pinned_identity(
        &self,
        name: &str,
        project_root: &Path,
    ) -> Result<PackageIdentity, PkgError> {
        let Some(path) = self.resolution.local_path() else {
            return self.identity(name);
        };
        let dir = project_root.join(path);
        let digest = nodelink_util::hash::blake3_dir(&dir).map_err(|e| {
            PkgError::fetch_failed(format!(
                "Cannot read local source of {name}@{} at {}: {e}",
                self.version,
                dir.display()
            ))
        })?;
        PackageIdentity::new(name, &self.version)?
            .with_content_key(nodelink_util::hash::content_key(&digest))
    }

    /// Whether `identity` is an acceptable key for this entry.
    ///
    /// Local keys depend on directory content and cannot be recomputed
    /// here; any content key with the right version is accepted.
    ///
    /// # Errors
    /// Returns an error if the entry's own identity is invalid.
    pub fn is_keyed_by(&self, identity: &PackageIdentity) -> Result<bool, PkgError> {
        if self.resolution.local_path().is_some() {
            return Ok(identity.version == self.version && identity.content_key.is_some());
        }
        Ok(self.identity(&identity.name)? == *identity)
    }
}

/// A declared dependency from the root package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockDep {
    /// The version range as specified in package.json.
    pub range: String,
    /// Dependency kind: "dep", "dev", or "optional".
    pub kind: String,
    /// The resolved reference (`name@resolved` is a key in `packages`).
    pub resolved: String,
}

impl LockDep {
    /// Create a new root dependency.
    #[must_use]
    pub fn new(
        range: impl Into<String>,
        kind: impl Into<String>,
        resolved: impl Into<String>,
    ) -> Self {
        Self {
            range: range.into(),
            kind: kind.into(),
            resolved: resolved.into(),
        }
    }
}

/// The complete lockfile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lockfile {
    /// Schema version for the lockfile format.
    pub lockfile_version: u32,
    /// Metadata about the lockfile.
    #[serde(default, skip_serializing_if = "is_default_meta")]
    pub meta: LockMeta,
    /// Information about the root package.
    pub root: LockRoot,
    /// Root-level dependencies (name -> `LockDep`).
    #[serde(default)]
    pub dependencies: BTreeMap<String, LockDep>,
    /// All locked packages (key = identity key).
    #[serde(default)]
    pub packages: BTreeMap<String, LockPackage>,
}

fn is_default_meta(m: &LockMeta) -> bool {
    m.nodelink_version.is_none()
}

impl Lockfile {
    /// Create a new empty lockfile.
    #[must_use]
    pub fn new(root: LockRoot) -> Self {
        Self {
            lockfile_version: PKG_LOCK_SCHEMA_VERSION,
            meta: LockMeta::default(),
            root,
            dependencies: BTreeMap::new(),
            packages: BTreeMap::new(),
        }
    }

    /// Add a package to the lockfile, returning its identity.
    ///
    /// # Errors
    /// Returns an error if the name or version is invalid.
    pub fn add_package(
        &mut self,
        name: &str,
        pkg: LockPackage,
    ) -> Result<PackageIdentity, PkgError> {
        let identity = pkg.identity(name)?;
        self.packages.insert(identity.key(), pkg);
        Ok(identity)
    }

    /// Add a package keyed by [`LockPackage::pinned_identity`].
    ///
    /// # Errors
    /// Returns an error if a local source cannot be read or the name or
    /// version is invalid.
    pub fn add_pinned_package(
        &mut self,
        name: &str,
        pkg: LockPackage,
        project_root: &Path,
    ) -> Result<PackageIdentity, PkgError> {
        let identity = pkg.pinned_identity(name, project_root)?;
        self.packages.insert(identity.key(), pkg);
        Ok(identity)
    }

    /// Re-key every local package by the current content of its source
    /// directory, repointing the edges and root dependencies that named
    /// the old key. Keys that are already current are left alone.
    ///
    /// # Errors
    /// Returns `PKG_FETCH_FAILED` if a local source cannot be read, or
    /// `PKG_LOCK_INVALID_KEY` for a malformed key.
    pub fn pin_local_sources(&mut self, project_root: &Path) -> Result<(), PkgError> {
        let mut renamed: BTreeMap<String, PackageIdentity> = BTreeMap::new();
        for (key, pkg) in &self.packages {
            if pkg.resolution.local_path().is_none() {
                continue;
            }
            let current = PackageIdentity::parse_key(key)
                .map_err(|e| PkgError::new(codes::PKG_LOCK_INVALID_KEY, e.message().to_string()))?;
            let pinned = pkg.pinned_identity(&current.name, project_root)?;
            if pinned != current {
                renamed.insert(key.clone(), pinned);
            }
        }
        if renamed.is_empty() {
            return Ok(());
        }

        let moved: Vec<(String, LockPackage)> = renamed
            .iter()
            .filter_map(|(old, new)| self.packages.remove(old).map(|pkg| (new.key(), pkg)))
            .collect();
        self.packages.extend(moved);

        let repoint = |name: &str, reference: &mut String| {
            if let Some(new) = renamed.get(&format!("{name}@{reference}")) {
                *reference = new.reference();
            }
        };
        for pkg in self.packages.values_mut() {
            for (name, reference) in &mut pkg.dependencies {
                repoint(name, reference);
            }
        }
        for (name, dep) in &mut self.dependencies {
            repoint(name, &mut dep.resolved);
        }
        Ok(())
    }

    /// Add a root dependency on an exact identity.
    pub fn add_dependency(
        &mut self,
        target: &PackageIdentity,
        range: impl Into<String>,
        kind: impl Into<String>,
    ) {
        self.dependencies.insert(
            target.name.clone(),
            LockDep::new(range, kind, target.reference()),
        );
    }

    /// Overlay `other`: its packages are added and its root dependencies
    /// replace same-named ones.
    pub fn merge(&mut self, other: Lockfile) {
        self.packages.extend(other.packages);
        self.dependencies.extend(other.dependencies);
    }

    /// Drop the named root dependencies.
    pub fn remove_dependencies(&mut self, names: &[String]) {
        for name in names {
            self.dependencies.remove(name);
        }
    }

    /// Keep only the packages in `keep`.
    pub fn retain_packages(&mut self, keep: &BTreeSet<PackageIdentity>) {
        let keys: BTreeSet<String> = keep.iter().map(PackageIdentity::key).collect();
        self.packages.retain(|key, _| keys.contains(key));
    }

    /// Get a package by identity.
    #[must_use]
    pub fn get_package(&self, identity: &PackageIdentity) -> Option<&LockPackage> {
        self.packages.get(&identity.key())
    }

    /// Read a lockfile from a path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn read_from(path: &Path) -> Result<Self, LockfileError> {
        let content = fs::read_to_string(path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                LockfileError::new(
                    codes::PKG_LOCK_NOT_FOUND,
                    format!("Lockfile not found: {}", path.display()),
                )
            } else {
                LockfileError::new(
                    codes::PKG_LOCK_INVALID_JSON,
                    format!("Failed to read lockfile: {e}"),
                )
            }
        })?;

        let lockfile = Self::from_json(&content)?;

        if lockfile.lockfile_version != PKG_LOCK_SCHEMA_VERSION {
            return Err(LockfileError::new(
                codes::PKG_LOCK_VERSION_MISMATCH,
                format!(
                    "Lockfile version {} not supported (expected {})",
                    lockfile.lockfile_version, PKG_LOCK_SCHEMA_VERSION
                ),
            ));
        }

        Ok(lockfile)
    }

    /// Read a lockfile if one exists.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn read_optional(path: &Path) -> Result<Option<Self>, LockfileError> {
        match Self::read_from(path) {
            Ok(lockfile) => Ok(Some(lockfile)),
            Err(e) if e.code() == codes::PKG_LOCK_NOT_FOUND => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Write the lockfile to a path atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write_to(&self, path: &Path) -> Result<(), LockfileError> {
        let mut content = serde_json::to_string_pretty(self).map_err(|e| {
            LockfileError::new(
                codes::PKG_LOCK_WRITE_FAILED,
                format!("Failed to serialize lockfile: {e}"),
            )
        })?;
        content.push('\n');

        nodelink_util::fs::atomic_write(path, content.as_bytes()).map_err(|e| {
            LockfileError::new(
                codes::PKG_LOCK_WRITE_FAILED,
                format!("Failed to write lockfile: {e}"),
            )
        })
    }

    /// Deserialize from JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid.
    pub fn from_json(json: &str) -> Result<Self, LockfileError> {
        serde_json::from_str(json).map_err(|e| {
            LockfileError::new(
                codes::PKG_LOCK_INVALID_JSON,
                format!("Invalid lockfile JSON: {e}"),
            )
        })
    }

    /// Record the generating nodelink version.
    pub fn stamp(&mut self) {
        self.meta.nodelink_version = Some(crate::version::VERSION.to_string());
    }
}

impl Default for Lockfile {
    fn default() -> Self {
        Self::new(LockRoot::new("unknown", None))
    }
}

/// Lockfile error.
#[derive(Debug)]
pub struct LockfileError {
    code: &'static str,
    message: String,
}

impl LockfileError {
    /// Create a new error.
    #[must_use]
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Get the error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// Get the error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for LockfileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for LockfileError {}
