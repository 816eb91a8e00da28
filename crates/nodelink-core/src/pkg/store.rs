//! Content-addressable package store.
//!
//! One store is shared by every project on the machine. Each package
//! identity owns one entry:
//!
//! ```text
//! <store>/<name>/<version>[+<content_key>]/
//!     package/     extracted content, never modified once in place
//!     refs.json    identity and the set of (project, node) referents
//! ```
//!
//! Scoped names nest as `@scope/name`. Entries appear only through an
//! atomic rename of a fully populated staging directory (`.tmp-*`), so
//! an interrupted fetch leaves at most staging debris that listing
//! ignores and [`Store::prune`] removes.
//!
//! All operations on one identity serialize on that identity's async
//! mutex. Deletion re-reads the referent set under the lock, so a prune
//! racing `add_reference` always leaves the entry in place, and
//! [`Store::ensure_referenced`] places and references an entry in one
//! lock hold so a fresh entry is never visible unreferenced.

use super::error::PkgError;
use super::identity::PackageIdentity;
use super::manifest::Manifest;
use super::source::SourceProvider;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};
use walkdir::WalkDir;

const PACKAGE_DIR: &str = "package";
const REFS_FILE: &str = "refs.json";
const STAGING_PREFIX: &str = ".tmp-";

/// One holder of a store entry: a node in some project's graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Referent {
    /// Project id (canonical project root).
    pub project: String,
    /// Graph node within that project (its identity key).
    pub node: String,
}

impl Referent {
    #[must_use]
    pub fn new(project: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            node: node.into(),
        }
    }
}

/// A store entry as recorded on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreEntry {
    pub identity: PackageIdentity,
    #[serde(default)]
    pub referents: BTreeSet<Referent>,
}

/// An entry as reported by [`Store::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreListing {
    pub identity: PackageIdentity,
    pub path: PathBuf,
    pub referents: usize,
    pub size_bytes: u64,
}

/// Outcome of [`Store::ensure_referenced`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    /// Content path of the entry.
    pub path: PathBuf,
    /// Whether this call fetched the content rather than finding it.
    pub fresh: bool,
}

/// Result of a garbage-collection sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneSummary {
    /// Entries deleted because nothing referenced them.
    pub removed: Vec<PackageIdentity>,
    /// Leftover staging directories deleted.
    pub staging_removed: usize,
}

/// The shared package store.
#[derive(Debug)]
pub struct Store {
    root: PathBuf,
    locks: Mutex<HashMap<PackageIdentity, Arc<AsyncMutex<()>>>>,
}

impl Store {
    /// Open (creating if needed) the store rooted at `root`.
    ///
    /// # Errors
    /// Returns an error if the root directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, PkgError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            PkgError::store_error(format!(
                "Failed to create store at {}: {e}",
                root.display()
            ))
        })?;
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// The store root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the entry for `identity`.
    #[must_use]
    pub fn entry_dir(&self, identity: &PackageIdentity) -> PathBuf {
        let mut dir = self.root.clone();
        // '/' only ever appears as the scope separator of a validated name
        for part in identity.name.split('/') {
            dir.push(part);
        }
        dir.join(identity.store_dir_name())
    }

    fn package_dir(&self, identity: &PackageIdentity) -> PathBuf {
        self.entry_dir(identity).join(PACKAGE_DIR)
    }

    fn refs_path(&self, identity: &PackageIdentity) -> PathBuf {
        self.entry_dir(identity).join(REFS_FILE)
    }

    fn identity_lock(&self, identity: &PackageIdentity) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(identity.clone()).or_default())
    }

    /// Drop the lock of a deleted entry unless someone holds or awaits it.
    fn forget_lock(&self, identity: &PackageIdentity) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(identity)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(identity);
        }
    }

    /// Content path of `identity`, if present.
    #[must_use]
    pub fn path(&self, identity: &PackageIdentity) -> Option<PathBuf> {
        let dir = self.package_dir(identity);
        dir.is_dir().then_some(dir)
    }

    /// Make sure the content for `identity` is in the store.
    ///
    /// An existing entry is returned as-is and `source` is not called.
    /// Otherwise `source` fills a staging directory which is renamed into
    /// place after declared executables are marked executable.
    ///
    /// # Errors
    /// Returns `PKG_FETCH_FAILED` if the source fails (no entry is left
    /// behind) or `PKG_STORE_ERROR` if the entry cannot be placed.
    pub async fn ensure(
        &self,
        identity: &PackageIdentity,
        source: &dyn SourceProvider,
    ) -> Result<PathBuf, PkgError> {
        let lock = self.identity_lock(identity);
        let _guard = lock.lock().await;
        Ok(self.ensure_locked(identity, source).await?.path)
    }

    /// [`ensure`](Self::ensure) and [`add_reference`](Self::add_reference)
    /// in one hold of the identity lock.
    ///
    /// `fresh` in the result tells whether this call placed the content;
    /// across all callers exactly one placement of an entry is fresh.
    ///
    /// # Errors
    /// As [`ensure`](Self::ensure), or `PKG_STORE_ERROR` if the referent
    /// file cannot be written.
    pub async fn ensure_referenced(
        &self,
        identity: &PackageIdentity,
        source: &dyn SourceProvider,
        referent: &Referent,
    ) -> Result<Placement, PkgError> {
        let lock = self.identity_lock(identity);
        let _guard = lock.lock().await;

        let placement = self.ensure_locked(identity, source).await?;
        self.reference_locked(identity, referent)?;
        Ok(placement)
    }

    async fn ensure_locked(
        &self,
        identity: &PackageIdentity,
        source: &dyn SourceProvider,
    ) -> Result<Placement, PkgError> {
        let dest = self.package_dir(identity);
        if dest.is_dir() {
            debug!(package = %identity, "store hit");
            return Ok(Placement {
                path: dest,
                fresh: false,
            });
        }

        let entry_dir = self.entry_dir(identity);
        fs::create_dir_all(&entry_dir).map_err(|e| {
            PkgError::store_error(format!("Failed to create {}: {e}", entry_dir.display()))
        })?;

        // Recorded first so `prune` can find debris of an interrupted fetch
        if !self.refs_path(identity).exists() {
            self.write_entry(&StoreEntry {
                identity: identity.clone(),
                referents: BTreeSet::new(),
            })?;
        }

        let staging = entry_dir.join(nodelink_util::fs::temp_name(STAGING_PREFIX));
        fs::create_dir_all(&staging)?;

        let result = self.place(identity, source, &staging, &dest).await;
        // Whatever the outcome, staging is debris now
        let _ = nodelink_util::fs::remove_path(&staging);
        let fresh = result?;

        debug!(package = %identity, path = %dest.display(), fresh, "stored");
        Ok(Placement { path: dest, fresh })
    }

    /// Fill `staging` from `source` and rename the result to `dest`.
    /// Returns `false` if another process won the rename.
    async fn place(
        &self,
        identity: &PackageIdentity,
        source: &dyn SourceProvider,
        staging: &Path,
        dest: &Path,
    ) -> Result<bool, PkgError> {
        let content = source.provide(identity, staging).await?;
        if !content.starts_with(staging) || !content.is_dir() {
            return Err(PkgError::fetch_failed(format!(
                "Source for {identity} produced no package directory"
            )));
        }

        mark_bins_executable(identity, &content);

        match fs::rename(&content, dest) {
            Ok(()) => Ok(true),
            // Another process placed it first; identical by construction
            Err(_) if dest.is_dir() => Ok(false),
            Err(e) => Err(PkgError::store_error(format!(
                "Failed to move {identity} into the store: {e}"
            ))),
        }
    }

    fn read_entry(&self, identity: &PackageIdentity) -> Result<StoreEntry, PkgError> {
        let path = self.refs_path(identity);
        match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                PkgError::store_error(format!("Corrupt {}: {e}", path.display()))
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(StoreEntry {
                identity: identity.clone(),
                referents: BTreeSet::new(),
            }),
            Err(e) => Err(PkgError::store_error(format!(
                "Failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    fn write_entry(&self, entry: &StoreEntry) -> Result<(), PkgError> {
        let path = self.refs_path(&entry.identity);
        let json = serde_json::to_vec_pretty(entry)
            .map_err(|e| PkgError::store_error(format!("Failed to serialize referents: {e}")))?;
        nodelink_util::fs::atomic_write(&path, &json).map_err(|e| {
            PkgError::store_error(format!("Failed to write {}: {e}", path.display()))
        })
    }

    /// Referents currently holding `identity`.
    ///
    /// # Errors
    /// Returns an error if the referent file is unreadable.
    pub async fn referents(&self, identity: &PackageIdentity) -> Result<BTreeSet<Referent>, PkgError> {
        let lock = self.identity_lock(identity);
        let _guard = lock.lock().await;
        Ok(self.read_entry(identity)?.referents)
    }

    /// Register `referent` on `identity`. Adding an existing referent is a no-op.
    ///
    /// # Errors
    /// Returns `PKG_STORE_ERROR` if the entry is not in the store or the
    /// referent file cannot be written.
    pub async fn add_reference(
        &self,
        identity: &PackageIdentity,
        referent: &Referent,
    ) -> Result<(), PkgError> {
        let lock = self.identity_lock(identity);
        let _guard = lock.lock().await;
        self.reference_locked(identity, referent)
    }

    fn reference_locked(
        &self,
        identity: &PackageIdentity,
        referent: &Referent,
    ) -> Result<(), PkgError> {
        if !self.package_dir(identity).is_dir() {
            return Err(PkgError::store_error(format!(
                "Cannot reference {identity}: not in the store"
            )));
        }

        let mut entry = self.read_entry(identity)?;
        if entry.referents.insert(referent.clone()) {
            self.write_entry(&entry)?;
        }
        Ok(())
    }

    /// Remove `referent` from `identity`.
    ///
    /// Returns `true` if the entry is now unreferenced and can be swept.
    /// Nothing is deleted here.
    ///
    /// # Errors
    /// Returns an error if the referent file cannot be read or written.
    pub async fn remove_reference(
        &self,
        identity: &PackageIdentity,
        referent: &Referent,
    ) -> Result<bool, PkgError> {
        let lock = self.identity_lock(identity);
        let _guard = lock.lock().await;

        if !self.entry_dir(identity).exists() {
            return Ok(true);
        }

        let mut entry = self.read_entry(identity)?;
        if entry.referents.remove(referent) {
            self.write_entry(&entry)?;
        }
        Ok(entry.referents.is_empty())
    }

    /// Delete the given entries if they are still unreferenced.
    ///
    /// Returns the identities actually removed.
    ///
    /// # Errors
    /// Returns `PKG_STORE_ERROR` if an entry cannot be deleted.
    pub async fn prune_identities(
        &self,
        identities: &[PackageIdentity],
    ) -> Result<Vec<PackageIdentity>, PkgError> {
        let mut removed = Vec::new();

        for identity in identities {
            let lock = self.identity_lock(identity);
            let pruned = {
                let _guard = lock.lock().await;
                self.prune_locked(identity)?
            };
            drop(lock);

            if pruned {
                self.forget_lock(identity);
                removed.push(identity.clone());
            }
        }

        Ok(removed)
    }

    fn prune_locked(&self, identity: &PackageIdentity) -> Result<bool, PkgError> {
        let entry_dir = self.entry_dir(identity);
        if !entry_dir.exists() {
            return Ok(false);
        }
        if !self.read_entry(identity)?.referents.is_empty() {
            debug!(package = %identity, "still referenced, keeping");
            return Ok(false);
        }

        fs::remove_dir_all(&entry_dir).map_err(|e| {
            PkgError::store_error(format!("Failed to remove {}: {e}", entry_dir.display()))
        })?;
        self.remove_empty_parents(&entry_dir);
        debug!(package = %identity, "pruned");
        Ok(true)
    }

    /// Sweep the whole store: delete unreferenced entries and leftover
    /// staging directories.
    ///
    /// # Errors
    /// Returns an error if the store cannot be scanned or an entry cannot
    /// be deleted.
    pub async fn prune(&self) -> Result<PruneSummary, PkgError> {
        let mut summary = PruneSummary::default();
        let mut candidates = Vec::new();

        for (identity, entry_dir) in self.scan()? {
            let lock = self.identity_lock(&identity);
            let _guard = lock.lock().await;

            // Staging dirs only exist while `ensure` holds this lock
            for staging in staging_dirs(&entry_dir) {
                if nodelink_util::fs::remove_path(&staging)? {
                    summary.staging_removed += 1;
                }
            }
            candidates.push(identity);
        }

        summary.removed = self.prune_identities(&candidates).await?;
        Ok(summary)
    }

    /// Every entry with content in place.
    ///
    /// # Errors
    /// Returns an error if the store cannot be scanned.
    pub fn list(&self) -> Result<Vec<StoreListing>, PkgError> {
        let mut listings = Vec::new();

        for (identity, _) in self.scan()? {
            let Some(path) = self.path(&identity) else {
                continue;
            };
            let referents = self.read_entry(&identity)?.referents.len();
            let size_bytes = WalkDir::new(&path)
                .into_iter()
                .filter_map(Result::ok)
                .filter(|e| e.file_type().is_file())
                .filter_map(|e| e.metadata().ok())
                .map(|m| m.len())
                .sum();

            listings.push(StoreListing {
                identity,
                path,
                referents,
                size_bytes,
            });
        }

        listings.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok(listings)
    }

    /// Find every entry directory and the identity it holds.
    fn scan(&self) -> Result<Vec<(PackageIdentity, PathBuf)>, PkgError> {
        let mut found = Vec::new();
        for name_dir in child_dirs(&self.root)? {
            let file_name = dir_name(&name_dir);
            if file_name.starts_with('@') {
                for scoped in child_dirs(&name_dir)? {
                    self.scan_versions(&scoped, &mut found)?;
                }
            } else {
                self.scan_versions(&name_dir, &mut found)?;
            }
        }
        Ok(found)
    }

    fn scan_versions(
        &self,
        name_dir: &Path,
        found: &mut Vec<(PackageIdentity, PathBuf)>,
    ) -> Result<(), PkgError> {
        for entry_dir in child_dirs(name_dir)? {
            let refs = entry_dir.join(REFS_FILE);
            let Ok(content) = fs::read_to_string(&refs) else {
                continue;
            };
            match serde_json::from_str::<StoreEntry>(&content) {
                Ok(entry) if self.entry_dir(&entry.identity) == entry_dir => {
                    found.push((entry.identity, entry_dir));
                }
                Ok(_) | Err(_) => {
                    warn!(path = %refs.display(), "ignoring unrecognized store entry");
                }
            }
        }
        Ok(())
    }

    /// Remove now-empty name and scope directories above an entry.
    fn remove_empty_parents(&self, entry_dir: &Path) {
        let mut dir = entry_dir.parent();
        while let Some(d) = dir {
            if d == self.root || fs::remove_dir(d).is_err() {
                break;
            }
            dir = d.parent();
        }
    }
}

/// Set execute bits on each `bin` target the package declares.
///
/// Runs on staged content only; live entries are never touched.
fn mark_bins_executable(identity: &PackageIdentity, content: &Path) {
    let manifest = match Manifest::read_dir(content) {
        Ok(m) => m,
        Err(e) => {
            debug!(package = %identity, error = %e, "no readable manifest, skipping bin modes");
            return;
        }
    };

    for (name, target) in &manifest.bin {
        if let Err(e) = nodelink_util::fs::make_executable(&content.join(target)) {
            warn!(package = %identity, bin = %name, error = %e, "cannot mark bin executable");
        }
    }
}

fn child_dirs(dir: &Path) -> Result<Vec<PathBuf>, PkgError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(PkgError::store_error(format!(
                "Failed to read {}: {e}",
                dir.display()
            )))
        }
    };

    Ok(entries
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .map(|e| e.path())
        .filter(|p| !dir_name(p).starts_with('.'))
        .collect())
}

fn staging_dirs(entry_dir: &Path) -> Vec<PathBuf> {
    fs::read_dir(entry_dir)
        .into_iter()
        .flatten()
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| dir_name(p).starts_with(STAGING_PREFIX))
        .collect()
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
