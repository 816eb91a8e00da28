//! Projection of a dependency graph onto `node_modules`.
//!
//! Each root gets a directory link (symlink on Unix, junction on Windows)
//! at `node_modules/<name>` pointing at its store entry. Every executable
//! declared by a reachable package gets an entry in `node_modules/.bin`:
//! a relative symlink on Unix, a `.cmd` shim on Windows.
//!
//! Links that already point at the right place are left alone, so
//! linking an unchanged graph touches nothing.

use super::error::PkgError;
use super::graph::DependencyGraph;
use super::store::Store;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Name of the executables directory.
pub const BIN_DIR: &str = ".bin";

/// Shim suffixes that may accompany a `.bin` entry.
const SHIM_SUFFIXES: [&str; 2] = [".cmd", ".ps1"];

/// What a link or unlink pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkSummary {
    /// Entries created or rewritten.
    pub linked: usize,
    /// Entries already correct.
    pub unchanged: usize,
    /// Entries removed.
    pub removed: usize,
}

impl LinkSummary {
    /// Whether the pass changed nothing on disk.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.linked == 0 && self.removed == 0
    }
}

/// Materializes graphs into one project's `node_modules`.
#[derive(Debug, Clone)]
pub struct Linker {
    node_modules: PathBuf,
}

impl Linker {
    #[must_use]
    pub fn new(node_modules: impl Into<PathBuf>) -> Self {
        Self {
            node_modules: node_modules.into(),
        }
    }

    /// The `node_modules` directory.
    #[must_use]
    pub fn node_modules(&self) -> &Path {
        &self.node_modules
    }

    /// The `.bin` directory.
    #[must_use]
    pub fn bin_dir(&self) -> PathBuf {
        self.node_modules.join(BIN_DIR)
    }

    /// Where the root `name` is linked.
    #[must_use]
    pub fn module_path(&self, name: &str) -> PathBuf {
        let mut path = self.node_modules.clone();
        for part in name.split('/') {
            path.push(part);
        }
        path
    }

    /// Create or verify every link `graph` implies.
    ///
    /// # Errors
    /// Returns `PKG_LINK_FAILED` if a package is missing from the store or
    /// a link cannot be replaced, `NODE_MODULES_WRITE_FAILED` if a
    /// directory cannot be created.
    pub fn link(&self, graph: &DependencyGraph, store: &Store) -> Result<LinkSummary, PkgError> {
        let mut summary = LinkSummary::default();
        create_dir(&self.node_modules)?;

        for name in graph.roots().keys() {
            let Some(identity) = graph.root_identity(name) else {
                continue;
            };
            let target = store.path(identity).ok_or_else(|| {
                PkgError::link_failed(format!("{identity} is not in the store"))
            })?;

            let link_path = self.module_path(name);
            if let Some(parent) = link_path.parent() {
                create_dir(parent)?;
            }
            record(&mut summary, ensure_dir_link(&target, &link_path)?);
        }

        let owners = graph.bin_owners();
        if !owners.is_empty() {
            create_dir(&self.bin_dir())?;
        }
        for (name, owner) in &owners {
            validate_bin_name(name)?;
            let package = store.path(&owner.owner).ok_or_else(|| {
                PkgError::link_failed(format!("{} is not in the store", owner.owner))
            })?;
            let target = package.join(validate_bin_target(&owner.path)?);
            record(&mut summary, self.ensure_bin(name, &target)?);
        }

        debug!(
            linked = summary.linked,
            unchanged = summary.unchanged,
            "link pass done"
        );
        Ok(summary)
    }

    /// Remove the links `before` implies and `after` no longer does.
    ///
    /// Module links go for every name that stops being a root. Bin entries
    /// go for every name no package reachable in `after` declares; all
    /// forms (plain, `.cmd`, `.ps1`) are checked and missing ones are fine.
    ///
    /// # Errors
    /// Returns `PKG_LINK_FAILED` if an existing entry cannot be removed.
    pub fn unlink(
        &self,
        before: &DependencyGraph,
        after: &DependencyGraph,
    ) -> Result<LinkSummary, PkgError> {
        let mut summary = LinkSummary::default();
        let mut scopes = BTreeSet::new();

        for name in before.roots().keys() {
            if after.has_root(name) {
                continue;
            }
            if remove_entry(&self.module_path(name))? {
                summary.removed += 1;
            }
            if let Some((scope, _)) = name.split_once('/') {
                scopes.insert(scope.to_string());
            }
        }

        let still_owned = after.bin_owners();
        for name in before.bin_owners().keys() {
            if still_owned.contains_key(name) {
                continue;
            }
            summary.removed += self.remove_bin(name)?;
        }

        for scope in scopes {
            remove_if_empty(&self.node_modules.join(scope));
        }
        remove_if_empty(&self.bin_dir());

        debug!(removed = summary.removed, "unlink pass done");
        Ok(summary)
    }

    #[cfg(unix)]
    fn ensure_bin(&self, name: &str, target: &Path) -> Result<bool, PkgError> {
        let bin_dir = self.bin_dir();
        let link_path = bin_dir.join(name);
        let relative = pathdiff::diff_paths(target, &bin_dir).unwrap_or_else(|| target.to_path_buf());

        if fs::read_link(&link_path).is_ok_and(|current| current == relative) {
            return Ok(false);
        }

        remove_entry(&link_path)?;
        std::os::unix::fs::symlink(&relative, &link_path).map_err(|e| {
            PkgError::link_failed(format!(
                "Failed to link {} to {}: {e}",
                link_path.display(),
                relative.display()
            ))
        })?;
        Ok(true)
    }

    #[cfg(windows)]
    fn ensure_bin(&self, name: &str, target: &Path) -> Result<bool, PkgError> {
        let shim_path = self.bin_dir().join(format!("{name}.cmd"));
        let shim = format!("@node \"{}\" %*\r\n", target.display());

        if fs::read_to_string(&shim_path).is_ok_and(|current| current == shim) {
            return Ok(false);
        }

        nodelink_util::fs::atomic_write(&shim_path, shim.as_bytes()).map_err(|e| {
            PkgError::node_modules_write_failed(format!(
                "Failed to write {}: {e}",
                shim_path.display()
            ))
        })?;
        Ok(true)
    }

    /// Remove every form of a `.bin` entry, returning how many existed.
    fn remove_bin(&self, name: &str) -> Result<usize, PkgError> {
        let bin_dir = self.bin_dir();
        let mut removed = 0;
        let plain = bin_dir.join(name);
        let shims = SHIM_SUFFIXES.iter().map(|s| bin_dir.join(format!("{name}{s}")));

        for path in std::iter::once(plain).chain(shims) {
            if remove_entry(&path)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn record(summary: &mut LinkSummary, changed: bool) {
    if changed {
        summary.linked += 1;
    } else {
        summary.unchanged += 1;
    }
}

fn create_dir(dir: &Path) -> Result<(), PkgError> {
    fs::create_dir_all(dir).map_err(|e| {
        PkgError::node_modules_write_failed(format!("Failed to create {}: {e}", dir.display()))
    })
}

fn remove_entry(path: &Path) -> Result<bool, PkgError> {
    nodelink_util::fs::remove_path(path)
        .map_err(|e| PkgError::link_failed(format!("Failed to remove {}: {e}", path.display())))
}

fn remove_if_empty(dir: &Path) {
    // Fails harmlessly when the directory is missing or still has entries
    let _ = fs::remove_dir(dir);
}

fn validate_bin_name(name: &str) -> Result<(), PkgError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(PkgError::link_failed(format!("Unsafe bin name '{name}'")));
    }
    Ok(())
}

/// Bin targets must stay inside the owning package.
fn validate_bin_target(path: &str) -> Result<&Path, PkgError> {
    let target = Path::new(path);
    let escapes = target.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if path.is_empty() || escapes {
        return Err(PkgError::link_failed(format!("Unsafe bin target '{path}'")));
    }
    Ok(target)
}

/// Point `link` at `target`, replacing whatever is there unless it
/// already does. Returns whether anything changed.
fn ensure_dir_link(target: &Path, link: &Path) -> Result<bool, PkgError> {
    if dir_link_target(link).is_some_and(|current| same_path(&current, target)) {
        return Ok(false);
    }

    remove_entry(link)?;
    create_dir_link(target, link)?;
    Ok(true)
}

fn dir_link_target(link: &Path) -> Option<PathBuf> {
    #[cfg(windows)]
    {
        if let Ok(target) = junction::get_target(link) {
            return Some(target);
        }
    }
    fs::read_link(link).ok()
}

fn same_path(a: &Path, b: &Path) -> bool {
    dunce::simplified(a) == dunce::simplified(b)
}

/// Create a directory link (symlink on Unix, junction on Windows).
fn create_dir_link(src: &Path, dst: &Path) -> Result<(), PkgError> {
    symlink_dir(src, dst).map_err(|e| {
        PkgError::link_failed(format!(
            "Failed to link {} to {}: {e}",
            dst.display(),
            src.display()
        ))
    })
}

#[cfg(unix)]
fn symlink_dir(src: &Path, dst: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(src, dst)
}

#[cfg(windows)]
fn symlink_dir(src: &Path, dst: &Path) -> io::Result<()> {
    junction::create(src, dst)
}
