//! Install orchestrator.
//!
//! Takes an already resolved graph (a lockfile), merges its roots into the
//! project, places every reachable package in the store, projects the
//! result into `node_modules`, and runs lifecycles for store entries this
//! install placed. An entry shared with another project is built once,
//! by whichever install placed it. The lockfile and then the manifest are
//! written last, so a failed install leaves both untouched.

use super::error::PkgError;
use super::graph::DependencyGraph;
use super::identity::PackageIdentity;
use super::lifecycle::{run_lifecycle, LifecyclePlan};
use super::link::LinkSummary;
use super::lockfile::{LockRoot, Lockfile};
use super::manifest::{save_dependencies, Manifest};
use super::project::{PkgContext, Project};
use super::source::LockfileSource;
use super::store::Placement;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Install behavior switches.
#[derive(Debug, Clone, Copy)]
pub struct InstallOptions {
    /// Record requested roots in the project manifest.
    pub save: bool,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self { save: true }
    }
}

/// What an install did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InstallReport {
    /// Identities the project did not have before.
    pub added: Vec<PackageIdentity>,
    /// Store entries this install fetched.
    pub placed: Vec<PackageIdentity>,
    /// Identities dropped because a root was replaced.
    pub removed: Vec<PackageIdentity>,
    /// Store entries deleted along with them.
    pub pruned: Vec<PackageIdentity>,
    /// Lifecycles run, in order.
    pub lifecycles: Vec<LifecycleRun>,
    pub link: LinkSummary,
    pub manifest_updated: bool,
}

/// A lifecycle executed during install.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleRun {
    pub identity: PackageIdentity,
    pub plan: LifecyclePlan,
}

/// Install the graph described by `requested` into `project`.
///
/// Roots in `requested` replace same-named roots of the project; other
/// existing roots are kept.
///
/// # Errors
/// Fails with `PKG_FETCH_FAILED`, `PKG_LINK_FAILED`,
/// `PKG_LIFECYCLE_SCRIPT_FAILED` or `PKG_GRAPH_INTEGRITY`; the lockfile
/// and manifest are not written in any of those cases.
pub async fn install(
    ctx: &PkgContext,
    project: &Project,
    mut requested: Lockfile,
    options: InstallOptions,
) -> Result<InstallReport, PkgError> {
    let _guard = ctx.locks.lock(project).await;
    info!(project = %project.id(), roots = requested.dependencies.len(), "install");

    requested.pin_local_sources(project.root())?;

    let previous = Lockfile::read_optional(&project.lockfile_path())?;
    let before = match &previous {
        Some(lockfile) => DependencyGraph::from_lockfile(lockfile)?,
        None => DependencyGraph::empty(),
    };

    let saved: BTreeMap<String, String> = requested
        .dependencies
        .iter()
        .map(|(name, dep)| (name.clone(), dep.range.clone()))
        .collect();

    let mut lockfile = previous.unwrap_or_else(|| Lockfile::new(project_root_entry(project)));
    lockfile.merge(requested);
    let after = DependencyGraph::from_lockfile(&lockfile)?;
    let reachable = after.reachable_set();
    lockfile.retain_packages(&reachable);

    let mut report = InstallReport {
        added: reachable
            .difference(&before.reachable_set())
            .cloned()
            .collect(),
        ..InstallReport::default()
    };

    match apply(ctx, project, &lockfile, &before, &after).await {
        Ok(applied) => {
            report.placed = applied.placed;
            report.link = applied.link;
            report.lifecycles = applied.lifecycles;
        }
        Err(e) => {
            rollback(ctx, project, &before, &after, &report.added).await;
            return Err(e);
        }
    }

    // Replaced packages are released only once the new graph is in place
    let orphans = DependencyGraph::orphans(&before, &after);
    let (removed, pruned) = release(ctx, project, &orphans).await?;
    report.removed = removed;
    report.pruned = pruned;

    lockfile.stamp();
    lockfile.write_to(&project.lockfile_path())?;
    if options.save && !saved.is_empty() {
        report.manifest_updated = save_dependencies(&project.manifest_path(), &saved)?;
    }

    info!(
        project = %project.id(),
        added = report.added.len(),
        removed = report.removed.len(),
        "install complete"
    );
    Ok(report)
}

/// Re-project `node_modules` from the project's lockfile.
///
/// Missing store entries are fetched again. No lifecycle runs, not even
/// for those.
///
/// # Errors
/// Returns an error if the lockfile is unreadable or a package cannot be
/// placed or linked.
pub async fn relink(ctx: &PkgContext, project: &Project) -> Result<LinkSummary, PkgError> {
    let _guard = ctx.locks.lock(project).await;

    let Some(lockfile) = Lockfile::read_optional(&project.lockfile_path())? else {
        return Ok(LinkSummary::default());
    };
    let graph = DependencyGraph::from_lockfile(&lockfile)?;
    let reachable = graph.reachable_set();

    place_all(ctx, project, &lockfile, &reachable).await?;
    project.linker().link(&graph, &ctx.store)
}

struct Applied {
    placed: Vec<PackageIdentity>,
    link: LinkSummary,
    lifecycles: Vec<LifecycleRun>,
}

/// Place, link and run lifecycles for `after`.
async fn apply(
    ctx: &PkgContext,
    project: &Project,
    lockfile: &Lockfile,
    before: &DependencyGraph,
    after: &DependencyGraph,
) -> Result<Applied, PkgError> {
    let fresh = place_all(ctx, project, lockfile, &after.reachable_set()).await?;

    let linker = project.linker();
    linker.unlink(before, after)?;
    let link = linker.link(after, &ctx.store)?;

    let lifecycles = run_lifecycles(ctx, project, &fresh).await?;
    Ok(Applied {
        placed: fresh.into_iter().collect(),
        link,
        lifecycles,
    })
}

/// Best-effort return to `before` after a failed install.
async fn rollback(
    ctx: &PkgContext,
    project: &Project,
    before: &DependencyGraph,
    after: &DependencyGraph,
    added: &[PackageIdentity],
) {
    let linker = project.linker();
    if let Err(e) = linker.unlink(after, before) {
        warn!(project = %project.id(), error = %e, "rollback: cannot remove new links");
    }
    if !before.roots().is_empty() {
        if let Err(e) = linker.link(before, &ctx.store) {
            warn!(project = %project.id(), error = %e, "rollback: cannot restore links");
        }
    }

    let added: BTreeSet<PackageIdentity> = added.iter().cloned().collect();
    if let Err(e) = release(ctx, project, &added).await {
        warn!(project = %project.id(), error = %e, "rollback: cannot release references");
    }
}

fn project_root_entry(project: &Project) -> LockRoot {
    match Manifest::read(&project.manifest_path()) {
        Ok(manifest) => LockRoot::new(
            manifest.name.unwrap_or_else(|| "unnamed".to_string()),
            manifest.version,
        ),
        Err(_) => LockRoot::new("unnamed", None),
    }
}

/// Ensure every reachable identity is in the store and referenced by
/// this project.
///
/// Returns the identities whose content was fetched by this call.
async fn place_all(
    ctx: &PkgContext,
    project: &Project,
    lockfile: &Lockfile,
    reachable: &BTreeSet<PackageIdentity>,
) -> Result<BTreeSet<PackageIdentity>, PkgError> {
    let resolutions = reachable
        .iter()
        .filter_map(|id| {
            lockfile
                .get_package(id)
                .map(|pkg| (id.clone(), pkg.resolution.clone()))
        })
        .collect();
    let source = LockfileSource::new(
        ctx.http.clone(),
        &ctx.registry,
        project.root(),
        resolutions,
    )?;

    let results: Vec<Result<(PackageIdentity, Placement), PkgError>> = stream::iter(reachable)
        .map(|id| {
            let source = &source;
            async move {
                let placement = ctx
                    .store
                    .ensure_referenced(id, source, &project.referent(id))
                    .await?;
                Ok::<_, PkgError>((id.clone(), placement))
            }
        })
        .buffer_unordered(ctx.concurrency.max(1))
        .collect()
        .await;

    let mut fresh = BTreeSet::new();
    for result in results {
        let (id, placement) = result?;
        if placement.fresh {
            fresh.insert(id);
        }
    }
    debug!(packages = reachable.len(), fresh = fresh.len(), "placed");
    Ok(fresh)
}

/// Drop this project's references on `orphans` and sweep the entries
/// nobody references any more.
///
/// Returns the released identities and the ones deleted from the store.
pub(crate) async fn release(
    ctx: &PkgContext,
    project: &Project,
    orphans: &BTreeSet<PackageIdentity>,
) -> Result<(Vec<PackageIdentity>, Vec<PackageIdentity>), PkgError> {
    let mut unreferenced = Vec::new();
    for id in orphans {
        if ctx.store.remove_reference(id, &project.referent(id)).await? {
            unreferenced.push(id.clone());
        }
    }
    let pruned = ctx.store.prune_identities(&unreferenced).await?;
    Ok((orphans.iter().cloned().collect(), pruned))
}

async fn run_lifecycles(
    ctx: &PkgContext,
    project: &Project,
    fresh: &BTreeSet<PackageIdentity>,
) -> Result<Vec<LifecycleRun>, PkgError> {
    let options = ctx.lifecycle_options(project);
    let mut runs = Vec::new();

    for id in fresh {
        let root = ctx
            .store
            .path(id)
            .ok_or_else(|| PkgError::store_error(format!("{id} vanished from the store")))?;
        let mut manifest = Manifest::read_dir(&root).unwrap_or_default();
        manifest.name.get_or_insert_with(|| id.name.clone());
        manifest.version.get_or_insert_with(|| id.version.clone());

        if let Some(plan) = run_lifecycle(&root, &manifest, ctx.runner.as_ref(), &options).await? {
            runs.push(LifecycleRun {
                identity: id.clone(),
                plan,
            });
        }
    }

    Ok(runs)
}
