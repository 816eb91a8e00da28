//! Projects and the state shared by install and uninstall.

use super::error::PkgError;
use crate::config::Config;
use super::identity::PackageIdentity;
use super::lifecycle::{LifecycleOptions, ProcessRunner, ScriptRunner, DEFAULT_NODE_GYP};
use super::link::Linker;
use super::lockfile::LOCKFILE_NAME;
use super::manifest::MANIFEST_NAME;
use super::source::DEFAULT_REGISTRY;
use super::store::{Referent, Store};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Default number of packages fetched at once.
pub const DEFAULT_CONCURRENCY: usize = 16;

/// One project directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    root: PathBuf,
    id: String,
}

impl Project {
    /// Open the project rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created or resolved.
    pub fn open(root: &Path) -> Result<Self, PkgError> {
        std::fs::create_dir_all(root).map_err(|e| {
            PkgError::node_modules_write_failed(format!(
                "Failed to create project directory {}: {e}",
                root.display()
            ))
        })?;
        let root = dunce::canonicalize(root)?;
        let id = root.to_string_lossy().into_owned();
        Ok(Self { root, id })
    }

    /// Canonical project root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Identifier used for store referents and locking.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_NAME)
    }

    #[must_use]
    pub fn lockfile_path(&self) -> PathBuf {
        self.root.join(LOCKFILE_NAME)
    }

    #[must_use]
    pub fn node_modules(&self) -> PathBuf {
        self.root.join("node_modules")
    }

    #[must_use]
    pub fn linker(&self) -> Linker {
        Linker::new(self.node_modules())
    }

    /// The referent this project holds on `identity`.
    #[must_use]
    pub fn referent(&self, identity: &PackageIdentity) -> Referent {
        Referent::new(&self.id, identity.key())
    }
}

/// Per-project mutual exclusion.
///
/// Graph mutation and `node_modules` projection for one project happen
/// under its lock; different projects never wait on each other here.
#[derive(Debug, Default)]
pub struct ProjectLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ProjectLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for and take the lock of `project`.
    pub async fn lock(&self, project: &Project) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(project.id().to_string()).or_default())
        };
        lock.lock_owned().await
    }
}

/// Everything an orchestrator needs besides the project itself.
#[derive(Clone)]
pub struct PkgContext {
    pub store: Arc<Store>,
    pub locks: Arc<ProjectLocks>,
    pub runner: Arc<dyn ScriptRunner>,
    pub http: reqwest::Client,
    pub registry: String,
    pub concurrency: usize,
    pub ignore_scripts: bool,
    pub node_gyp: String,
}

impl PkgContext {
    /// A context over `store` with default settings.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(store: Arc<Store>) -> Result<Self, PkgError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .user_agent(concat!("nodelink/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PkgError::fetch_failed(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            store,
            locks: Arc::new(ProjectLocks::new()),
            runner: Arc::new(ProcessRunner),
            http,
            registry: DEFAULT_REGISTRY.to_string(),
            concurrency: DEFAULT_CONCURRENCY,
            ignore_scripts: false,
            node_gyp: DEFAULT_NODE_GYP.to_string(),
        })
    }

    /// A context for `config`, opening the store it names.
    ///
    /// # Errors
    /// Returns an error if the store or the HTTP client cannot be set up.
    pub fn from_config(config: &Config) -> Result<Self, PkgError> {
        let store = Store::open(config.store_root())?;
        let mut ctx = Self::new(Arc::new(store))?.with_registry(config.registry.clone());
        ctx.concurrency = config.concurrency.max(1);
        ctx.ignore_scripts = config.ignore_scripts;
        ctx.node_gyp.clone_from(&config.node_gyp);
        Ok(ctx)
    }

    #[must_use]
    pub fn with_runner(mut self, runner: Arc<dyn ScriptRunner>) -> Self {
        self.runner = runner;
        self
    }

    #[must_use]
    pub fn with_registry(mut self, registry: impl Into<String>) -> Self {
        self.registry = registry.into();
        self
    }

    /// Lifecycle options for `project`.
    #[must_use]
    pub fn lifecycle_options(&self, project: &Project) -> LifecycleOptions {
        LifecycleOptions {
            ignore_scripts: self.ignore_scripts,
            node_gyp: self.node_gyp.clone(),
            ..LifecycleOptions::for_node_modules(&project.node_modules())
        }
    }
}

impl std::fmt::Debug for PkgContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkgContext")
            .field("store", &self.store.root())
            .field("registry", &self.registry)
            .field("concurrency", &self.concurrency)
            .field("ignore_scripts", &self.ignore_scripts)
            .finish_non_exhaustive()
    }
}
