use crate::error::Error;
use crate::paths;
use crate::pkg::lifecycle::DEFAULT_NODE_GYP;
use crate::pkg::{DEFAULT_CONCURRENCY, DEFAULT_REGISTRY};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable overriding the store location.
pub const STORE_DIR_ENV: &str = "NODELINK_STORE_DIR";

/// Environment variable overriding the registry base URL.
pub const REGISTRY_ENV: &str = "NODELINK_REGISTRY";

/// Runtime configuration for the nodelink CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Current working directory.
    pub cwd: PathBuf,

    /// Whether to emit JSON logs.
    pub json_logs: bool,

    /// Verbosity level (0 = INFO, 1 = DEBUG, 2+ = TRACE).
    pub verbosity: u8,

    /// Channel (dev, nightly, stable) - affects the default store path.
    pub channel: Channel,

    /// Store root; `None` means the platform default for `channel`.
    pub store_dir: Option<PathBuf>,

    /// Registry base URL for registry-resolved packages.
    pub registry: String,

    /// Packages fetched at once.
    pub concurrency: usize,

    /// Skip all lifecycle execution.
    pub ignore_scripts: bool,

    /// Command used for native rebuilds.
    pub node_gyp: String,
}

/// Release channel for cache/data directory namespacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    #[default]
    Stable,
    Nightly,
    Dev,
}

impl Channel {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::Nightly => "nightly",
            Self::Dev => "dev",
        }
    }
}

impl std::str::FromStr for Channel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stable" => Ok(Self::Stable),
            "nightly" => Ok(Self::Nightly),
            "dev" => Ok(Self::Dev),
            other => Err(Error::other(format!("Unknown channel: {other}"))),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            json_logs: false,
            verbosity: 0,
            channel: Channel::default(),
            store_dir: None,
            registry: DEFAULT_REGISTRY.to_string(),
            concurrency: DEFAULT_CONCURRENCY,
            ignore_scripts: false,
            node_gyp: DEFAULT_NODE_GYP.to_string(),
        }
    }
}

impl Config {
    /// Create a new config with the given working directory.
    #[must_use]
    pub fn new(cwd: PathBuf) -> Self {
        Self {
            cwd,
            ..Default::default()
        }
    }

    /// Apply `NODELINK_STORE_DIR` and `NODELINK_REGISTRY` when set.
    ///
    /// Explicit settings made afterwards still win.
    #[must_use]
    pub fn with_env(mut self) -> Self {
        if let Some(dir) = std::env::var_os(STORE_DIR_ENV).filter(|v| !v.is_empty()) {
            self.store_dir = Some(PathBuf::from(dir));
        }
        if let Ok(registry) = std::env::var(REGISTRY_ENV) {
            if !registry.is_empty() {
                self.registry = registry;
            }
        }
        self
    }

    /// Set verbosity level.
    #[must_use]
    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Set JSON log output.
    #[must_use]
    pub fn with_json_logs(mut self, json: bool) -> Self {
        self.json_logs = json;
        self
    }

    /// Set channel.
    #[must_use]
    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channel = channel;
        self
    }

    #[must_use]
    pub fn with_store_dir(mut self, dir: PathBuf) -> Self {
        self.store_dir = Some(dir);
        self
    }

    #[must_use]
    pub fn with_ignore_scripts(mut self, ignore: bool) -> Self {
        self.ignore_scripts = ignore;
        self
    }

    /// The store root in effect.
    #[must_use]
    pub fn store_root(&self) -> PathBuf {
        self.store_dir
            .clone()
            .unwrap_or_else(|| paths::store_dir(self.channel))
    }
}
