//! Package installation core.
//!
//! - A shared, content-addressed store of extracted packages with
//!   per-project reference counting
//! - The per-project dependency graph and its persisted form, the lockfile
//! - Projection of the graph onto `node_modules`, including `.bin` entries
//! - Install and uninstall orchestration, lifecycle scripts included

pub mod error;
pub mod graph;
pub mod identity;
pub mod install;
pub mod lifecycle;
pub mod link;
pub mod lockfile;
pub mod manifest;
pub mod project;
pub mod source;
pub mod store;
pub mod uninstall;

pub use error::{codes as pkg_codes, PkgError};
pub use graph::{BinTarget, DependencyGraph, GraphNode, ResolvedPackage, ResolvedPackages, RootDep, RootSpec};
pub use identity::PackageIdentity;
pub use install::{install, relink, InstallOptions, InstallReport, LifecycleRun};
pub use lifecycle::{
    run_lifecycle, LifecycleOptions, LifecyclePlan, LifecycleStep, ProcessRunner,
    ScriptError, ScriptInvocation, ScriptRunner,
};
pub use link::{LinkSummary, Linker, BIN_DIR};
pub use lockfile::{
    codes as lockfile_codes, LockDep, LockMeta, LockPackage, LockResolution, LockRoot, Lockfile,
    LockfileError, LOCKFILE_NAME, PKG_LOCK_SCHEMA_VERSION,
};
pub use manifest::{Manifest, MANIFEST_NAME};
pub use project::{PkgContext, Project, ProjectLocks, DEFAULT_CONCURRENCY};
pub use source::{
    DirectorySource, LockfileSource, SourceProvider, TarballSource, DEFAULT_REGISTRY,
    MAX_TARBALL_SIZE,
};
pub use store::{Placement, PruneSummary, Referent, Store, StoreEntry, StoreListing};
pub use uninstall::{uninstall, UninstallOptions, UninstallReport, UnknownPackage};
