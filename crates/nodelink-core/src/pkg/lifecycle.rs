//! Install lifecycle for freshly placed packages.
//!
//! Which hooks run is decided once per package by [`LifecyclePlan::detect`]:
//!
//! | plan                      | steps                                        |
//! |---------------------------|----------------------------------------------|
//! | `HasInstallScript`        | `install`                                    |
//! | `HasNativeDescriptorOnly` | `node-gyp rebuild`, `preinstall`, `postinstall` |
//! | `PlainLifecycle`          | `preinstall`, `postinstall`                  |
//!
//! A declared `install` script owns the whole native build, so nothing
//! else runs next to it. Undeclared hooks are skipped.

use super::error::PkgError;
use super::link::BIN_DIR;
use super::manifest::Manifest;
use async_trait::async_trait;
use serde::Serialize;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Native build descriptor probed at the package root.
pub const NATIVE_DESCRIPTOR: &str = "binding.gyp";

/// Default native build command.
pub const DEFAULT_NODE_GYP: &str = "node-gyp";

/// What to run for one package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePlan {
    HasInstallScript,
    HasNativeDescriptorOnly,
    PlainLifecycle,
}

/// One step of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStep {
    /// Run the named manifest script, if declared.
    Script(&'static str),
    /// Run the native build tool with `rebuild`.
    NativeRebuild,
}

impl LifecycleStep {
    /// Name used in logs, errors and `npm_lifecycle_event`.
    #[must_use]
    pub fn event(&self) -> &'static str {
        match *self {
            Self::Script(name) => name,
            Self::NativeRebuild => "rebuild",
        }
    }
}

impl LifecyclePlan {
    /// Decide the plan for the package at `package_root`.
    ///
    /// A missing `binding.gyp` is normal. Any other error while probing it
    /// is logged and treated as present.
    #[must_use]
    pub fn detect(package_root: &Path, manifest: &Manifest) -> Self {
        if manifest.script("install").is_some() {
            return Self::HasInstallScript;
        }

        match fs::metadata(package_root.join(NATIVE_DESCRIPTOR)) {
            Ok(_) => Self::HasNativeDescriptorOnly,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Self::PlainLifecycle,
            Err(e) => {
                warn!(
                    package = %manifest.display_id(),
                    error = %e,
                    "cannot probe {NATIVE_DESCRIPTOR}, attempting rebuild"
                );
                Self::HasNativeDescriptorOnly
            }
        }
    }

    /// The fixed step sequence for this plan.
    #[must_use]
    pub fn steps(self) -> &'static [LifecycleStep] {
        use LifecycleStep::{NativeRebuild, Script};
        match self {
            Self::HasInstallScript => &[Script("install")],
            Self::HasNativeDescriptorOnly => {
                &[NativeRebuild, Script("preinstall"), Script("postinstall")]
            }
            Self::PlainLifecycle => &[Script("preinstall"), Script("postinstall")],
        }
    }
}

/// A command to run for a lifecycle step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptInvocation {
    /// Package the step belongs to (`name@version`).
    pub package: String,
    /// Lifecycle event (`install`, `preinstall`, `postinstall`, `rebuild`).
    pub event: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Extra environment on top of the inherited one.
    pub env: Vec<(String, OsString)>,
}

/// Why a command did not succeed.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("exited with code {0}")]
    Exit(i32),
    #[error("terminated by a signal")]
    Signal,
}

/// Runs lifecycle commands.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    /// Run `invocation` to completion.
    ///
    /// # Errors
    /// Returns an error unless the command exits with status zero.
    async fn run(&self, invocation: &ScriptInvocation) -> Result<(), ScriptError>;
}

/// Runs commands as child processes, logging their output.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl ScriptRunner for ProcessRunner {
    async fn run(&self, invocation: &ScriptInvocation) -> Result<(), ScriptError> {
        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .current_dir(&invocation.cwd)
            .envs(invocation.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ScriptError::Spawn {
                program: invocation.program.clone(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (status, (), ()) = tokio::join!(
            child.wait(),
            stream_lines(stdout, &invocation.package, &invocation.event),
            stream_lines(stderr, &invocation.package, &invocation.event),
        );

        let status = status.map_err(|source| ScriptError::Spawn {
            program: invocation.program.clone(),
            source,
        })?;
        match status.code() {
            Some(0) => Ok(()),
            Some(code) => Err(ScriptError::Exit(code)),
            None => Err(ScriptError::Signal),
        }
    }
}

async fn stream_lines<R: AsyncRead + Unpin>(reader: Option<R>, package: &str, event: &str) {
    let Some(reader) = reader else {
        return;
    };
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(package, event, "{line}");
    }
}

/// Knobs for running lifecycles.
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Skip every hook.
    pub ignore_scripts: bool,
    /// Native build command (invoked with `rebuild`).
    pub node_gyp: String,
    /// Project `node_modules/.bin`, prepended to `PATH`.
    pub bin_dir: Option<PathBuf>,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            ignore_scripts: false,
            node_gyp: DEFAULT_NODE_GYP.to_string(),
            bin_dir: None,
        }
    }
}

impl LifecycleOptions {
    /// Options for a project whose links live in `node_modules`.
    #[must_use]
    pub fn for_node_modules(node_modules: &Path) -> Self {
        Self {
            bin_dir: Some(node_modules.join(BIN_DIR)),
            ..Self::default()
        }
    }
}

/// Run the lifecycle of the package at `package_root`.
///
/// Returns the plan that was executed, or `None` when scripts are
/// disabled.
///
/// # Errors
/// Returns `PKG_LIFECYCLE_SCRIPT_FAILED` naming the package and the step
/// on the first failing step; later steps do not run.
pub async fn run_lifecycle(
    package_root: &Path,
    manifest: &Manifest,
    runner: &dyn ScriptRunner,
    options: &LifecycleOptions,
) -> Result<Option<LifecyclePlan>, PkgError> {
    let package = manifest.display_id();
    if options.ignore_scripts {
        debug!(package = %package, "scripts disabled");
        return Ok(None);
    }

    let plan = LifecyclePlan::detect(package_root, manifest);
    debug!(package = %package, plan = ?plan, "lifecycle plan");

    for step in plan.steps() {
        let Some(invocation) = invocation(step, package_root, manifest, options) else {
            continue;
        };
        info!(package = %package, event = step.event(), "running lifecycle step");
        runner.run(&invocation).await.map_err(|e| {
            let script = match step {
                LifecycleStep::Script(name) => manifest.script(name).unwrap_or(name).to_string(),
                LifecycleStep::NativeRebuild => format!("{} rebuild", options.node_gyp),
            };
            PkgError::lifecycle_failed(
                &package,
                &format!("{} ({script})", step.event()),
                &e.to_string(),
            )
        })?;
    }

    Ok(Some(plan))
}

fn invocation(
    step: &LifecycleStep,
    package_root: &Path,
    manifest: &Manifest,
    options: &LifecycleOptions,
) -> Option<ScriptInvocation> {
    let (program, args) = match step {
        LifecycleStep::Script(name) => {
            let body = manifest.script(name)?;
            let (shell, flag) = if cfg!(windows) {
                ("cmd.exe", "/C")
            } else {
                ("sh", "-c")
            };
            (shell.to_string(), vec![flag.to_string(), body.to_string()])
        }
        LifecycleStep::NativeRebuild => (options.node_gyp.clone(), vec!["rebuild".to_string()]),
    };

    Some(ScriptInvocation {
        package: manifest.display_id(),
        event: step.event().to_string(),
        program,
        args,
        cwd: package_root.to_path_buf(),
        env: script_env(step, manifest, options),
    })
}

fn script_env(
    step: &LifecycleStep,
    manifest: &Manifest,
    options: &LifecycleOptions,
) -> Vec<(String, OsString)> {
    let mut env = vec![(
        "npm_lifecycle_event".to_string(),
        OsString::from(step.event()),
    )];
    if let Some(name) = &manifest.name {
        env.push(("npm_package_name".to_string(), name.into()));
    }
    if let Some(version) = &manifest.version {
        env.push(("npm_package_version".to_string(), version.into()));
    }

    if let Some(bin_dir) = &options.bin_dir {
        let mut paths = vec![bin_dir.clone()];
        if let Some(existing) = std::env::var_os("PATH") {
            paths.extend(std::env::split_paths(&existing));
        }
        match std::env::join_paths(paths) {
            Ok(path) => env.push(("PATH".to_string(), path)),
            Err(e) => warn!(error = %e, "cannot extend PATH for lifecycle scripts"),
        }
    }

    env
}
