//! Uninstall orchestrator.
//!
//! Removes roots from a project, then everything that became unreachable:
//! links, `.bin` entries, store references and, when no other project
//! holds them, store entries. The lockfile is rewritten next and the
//! manifest last, so an interrupted uninstall can simply be repeated.

use super::error::{codes, PkgError};
use super::graph::DependencyGraph;
use super::identity::PackageIdentity;
use super::install::release;
use super::link::LinkSummary;
use super::lockfile::Lockfile;
use super::manifest::{remove_dependencies, Manifest};
use super::project::{PkgContext, Project};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Uninstall behavior switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct UninstallOptions {
    /// Fail before changing anything if a name is not installed.
    pub strict: bool,
}

/// A requested name that is neither a root nor a declared dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnknownPackage {
    pub name: String,
    pub code: &'static str,
    pub message: String,
}

impl UnknownPackage {
    fn new(name: &str) -> Self {
        let err = PkgError::not_installed(name);
        Self {
            name: name.to_string(),
            code: err.code(),
            message: err.message().to_string(),
        }
    }
}

/// What an uninstall did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UninstallReport {
    /// Roots removed from the graph.
    pub removed_roots: Vec<String>,
    /// Names only the manifest still declared.
    pub stale: Vec<String>,
    pub unknown: Vec<UnknownPackage>,
    /// Identities no longer reachable from any root.
    pub orphans: Vec<PackageIdentity>,
    /// Store entries deleted because nothing references them any more.
    pub pruned: Vec<PackageIdentity>,
    pub link: LinkSummary,
    pub manifest_updated: bool,
}

impl UninstallReport {
    /// Whether the call changed nothing.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.removed_roots.is_empty()
            && self.orphans.is_empty()
            && self.link.is_noop()
            && !self.manifest_updated
    }
}

/// Remove `names` from `project`.
///
/// # Errors
/// In strict mode, fails with `PKG_GRAPH_INTEGRITY` before touching
/// anything if a name is unknown. Otherwise fails only on filesystem,
/// store, lockfile or manifest errors.
pub async fn uninstall(
    ctx: &PkgContext,
    project: &Project,
    names: &[String],
    options: UninstallOptions,
) -> Result<UninstallReport, PkgError> {
    if names.is_empty() {
        return Err(PkgError::args_invalid("No packages given to uninstall"));
    }

    let _guard = ctx.locks.lock(project).await;
    info!(project = %project.id(), packages = ?names, "uninstall");

    let lockfile = Lockfile::read_optional(&project.lockfile_path())?;
    let before = match &lockfile {
        Some(lockfile) => DependencyGraph::from_lockfile(lockfile)?,
        None => DependencyGraph::empty(),
    };
    let manifest = match Manifest::read(&project.manifest_path()) {
        Ok(manifest) => Some(manifest),
        Err(e) if e.code() == codes::PKG_PACKAGE_JSON_NOT_FOUND => None,
        Err(e) => return Err(e),
    };

    let mut report = UninstallReport::default();
    let mut seen = BTreeSet::new();
    for name in names {
        if !seen.insert(name.as_str()) {
            continue;
        }
        if before.has_root(name) {
            report.removed_roots.push(name.clone());
        } else if manifest.as_ref().is_some_and(|m| m.declares(name)) {
            report.stale.push(name.clone());
        } else {
            report.unknown.push(UnknownPackage::new(name));
        }
    }

    if options.strict && !report.unknown.is_empty() {
        let unknown: Vec<&str> = report.unknown.iter().map(|u| u.name.as_str()).collect();
        return Err(PkgError::not_installed(&unknown.join(", ")));
    }
    for unknown in &report.unknown {
        warn!(package = %unknown.name, "not installed, skipping");
    }

    let after = before.remove_roots(&report.removed_roots);
    let orphans = DependencyGraph::orphans(&before, &after);
    debug!(orphans = orphans.len(), "computed orphans");

    let linker = project.linker();
    report.link = linker.unlink(&before, &after)?;
    if !after.roots().is_empty() {
        // Bins whose owner changed with the removal get their new target
        let relinked = linker.link(&after, &ctx.store)?;
        report.link.linked += relinked.linked;
        report.link.unchanged += relinked.unchanged;
    }

    let (released, pruned) = release(ctx, project, &orphans).await?;
    report.orphans = released;
    report.pruned = pruned;

    if let Some(mut lockfile) = lockfile {
        if !report.removed_roots.is_empty() {
            lockfile.remove_dependencies(&report.removed_roots);
            lockfile.retain_packages(&after.reachable_set());
            lockfile.stamp();
            lockfile.write_to(&project.lockfile_path())?;
        }
    }

    if manifest.is_some() {
        let mut targets = report.removed_roots.clone();
        targets.extend(report.stale.iter().cloned());
        if !targets.is_empty() {
            report.manifest_updated =
                !remove_dependencies(&project.manifest_path(), &targets)?.is_empty();
        }
    }

    info!(
        project = %project.id(),
        removed = report.removed_roots.len(),
        orphans = report.orphans.len(),
        pruned = report.pruned.len(),
        "uninstall complete"
    );
    Ok(report)
}
