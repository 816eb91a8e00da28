//! Shared fixtures for orchestrator tests.
//!
//! A `Fixture` owns a project directory and a private store. Packages are
//! written under `<project>/vendor` and locked with `file` resolutions, so
//! installs never touch the network.

#![allow(dead_code)]

use async_trait::async_trait;
use nodelink_core::pkg::{
    LockPackage, LockResolution, LockRoot, Lockfile, PackageIdentity, PkgContext, Project,
    ScriptError, ScriptInvocation, ScriptRunner, Store,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Records every lifecycle command instead of running it.
#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<ScriptInvocation>>,
    fail_on: Mutex<Option<String>>,
}

impl RecordingRunner {
    /// `(package, event)` pairs in call order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| (c.package.clone(), c.event.clone()))
            .collect()
    }

    pub fn invocations(&self) -> Vec<ScriptInvocation> {
        self.calls.lock().unwrap().clone()
    }

    /// Make every step of `package` (`name@version`) fail.
    pub fn fail_package(&self, package: &str) {
        *self.fail_on.lock().unwrap() = Some(package.to_string());
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

#[async_trait]
impl ScriptRunner for RecordingRunner {
    async fn run(&self, invocation: &ScriptInvocation) -> Result<(), ScriptError> {
        self.calls.lock().unwrap().push(invocation.clone());
        if self.fail_on.lock().unwrap().as_deref() == Some(invocation.package.as_str()) {
            return Err(ScriptError::Exit(1));
        }
        Ok(())
    }
}

/// A package to write into the fixture and lock.
pub struct PackageDef {
    pub name: String,
    pub version: String,
    pub deps: Vec<PackageIdentity>,
    pub bins: BTreeMap<String, String>,
    pub scripts: BTreeMap<String, String>,
    pub native: bool,
}

impl PackageDef {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            deps: Vec::new(),
            bins: BTreeMap::new(),
            scripts: BTreeMap::new(),
            native: false,
        }
    }

    pub fn dep(mut self, id: &PackageIdentity) -> Self {
        self.deps.push(id.clone());
        self
    }

    pub fn bin(mut self, name: &str, path: &str) -> Self {
        self.bins.insert(name.to_string(), path.to_string());
        self
    }

    pub fn script(mut self, event: &str, body: &str) -> Self {
        self.scripts.insert(event.to_string(), body.to_string());
        self
    }

    pub fn native(mut self) -> Self {
        self.native = true;
        self
    }

    /// `package.json` contents for this package.
    pub fn manifest_json(&self) -> String {
        let mut manifest = serde_json::json!({
            "name": self.name,
            "version": self.version,
        });
        if !self.bins.is_empty() {
            manifest["bin"] = serde_json::to_value(&self.bins).unwrap();
        }
        if !self.scripts.is_empty() {
            manifest["scripts"] = serde_json::to_value(&self.scripts).unwrap();
        }
        if !self.deps.is_empty() {
            let deps: BTreeMap<&str, &str> = self
                .deps
                .iter()
                .map(|d| (d.name.as_str(), d.version.as_str()))
                .collect();
            manifest["dependencies"] = serde_json::to_value(deps).unwrap();
        }
        serde_json::to_string_pretty(&manifest).unwrap()
    }

    /// Write the package contents into `dir`.
    pub fn write_to(&self, dir: &Path) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join("package.json"), self.manifest_json()).unwrap();
        fs::write(dir.join("index.js"), format!("module.exports = '{}';\n", self.name)).unwrap();
        for path in self.bins.values() {
            let file = dir.join(path);
            fs::create_dir_all(file.parent().unwrap()).unwrap();
            fs::write(file, "#!/usr/bin/env node\nconsole.log('hi');\n").unwrap();
        }
        if self.native {
            fs::write(dir.join("binding.gyp"), "{ \"targets\": [] }\n").unwrap();
        }
    }

    /// The lockfile entry for this package with `resolution`.
    pub fn lock_entry(&self, resolution: LockResolution) -> LockPackage {
        let mut pkg = LockPackage::new(&self.version).with_resolution(resolution);
        for dep in &self.deps {
            pkg.add_dependency(dep);
        }
        for (name, path) in &self.bins {
            pkg.add_bin(name, path);
        }
        pkg
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub store_dir: TempDir,
    pub project: Project,
    pub ctx: PkgContext,
    pub runner: Arc<RecordingRunner>,
}

impl Fixture {
    pub fn new() -> Self {
        let store_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(store_dir.path()).unwrap());
        Self::with_store(store, store_dir)
    }

    /// A second project sharing `other`'s store.
    pub fn sharing_store(other: &Fixture) -> Project {
        let dir = other.dir.path().join("other-project");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("package.json"), r#"{"name": "other", "version": "1.0.0"}"#).unwrap();
        Project::open(&dir).unwrap()
    }

    fn with_store(store: Arc<Store>, store_dir: TempDir) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("app");
        fs::create_dir_all(&root).unwrap();
        fs::write(
            root.join("package.json"),
            r#"{"name": "app", "version": "1.0.0", "dependencies": {}}"#,
        )
        .unwrap();

        let runner = Arc::new(RecordingRunner::default());
        let ctx = PkgContext::new(store)
            .unwrap()
            .with_runner(Arc::clone(&runner) as Arc<dyn ScriptRunner>);
        let project = Project::open(&root).unwrap();

        Self {
            dir,
            store_dir,
            project,
            ctx,
            runner,
        }
    }

    pub fn root(&self) -> &Path {
        self.project.root()
    }

    pub fn node_modules(&self) -> PathBuf {
        self.project.node_modules()
    }

    pub fn new_lockfile() -> Lockfile {
        Lockfile::new(LockRoot::new("app", Some("1.0.0".to_string())))
    }

    /// Write `def` under the project's `vendor` dir and lock it there.
    ///
    /// The returned identity is keyed by the written content, as install
    /// will key it.
    pub fn add_local(&self, lockfile: &mut Lockfile, def: &PackageDef) -> PackageIdentity {
        let rel = write_vendored(self.root(), def);
        lockfile
            .add_pinned_package(
                &def.name,
                def.lock_entry(LockResolution::File { path: rel }),
                self.root(),
            )
            .unwrap()
    }

    /// Whether the store holds an entry for `id`.
    pub fn in_store(&self, id: &PackageIdentity) -> bool {
        self.ctx.store.path(id).is_some()
    }

    pub fn manifest(&self) -> serde_json::Value {
        let content = fs::read_to_string(self.project.manifest_path()).unwrap();
        serde_json::from_str(&content).unwrap()
    }

    /// Every path under the project's `node_modules`, sorted.
    pub fn node_modules_snapshot(&self) -> Vec<(PathBuf, Option<PathBuf>)> {
        let mut entries = Vec::new();
        if !self.node_modules().exists() {
            return entries;
        }
        for entry in walkdir::WalkDir::new(self.node_modules()).follow_links(false) {
            let entry = entry.unwrap();
            let target = fs::read_link(entry.path()).ok();
            entries.push((entry.path().to_path_buf(), target));
        }
        entries.sort();
        entries
    }
}

/// Write `def` under `<root>/vendor`, returning the path relative to
/// `root`.
pub fn write_vendored(root: &Path, def: &PackageDef) -> String {
    let rel = format!("vendor/{}-{}", def.name.replace('/', "+"), def.version);
    def.write_to(&root.join(&rel));
    rel
}

/// Gzipped tarball with `def` under `package/`.
pub fn tarball(def: &PackageDef) -> Vec<u8> {
    let staging = tempfile::tempdir().unwrap();
    def.write_to(&staging.path().join("package"));

    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder
        .append_dir_all("package", staging.path().join("package"))
        .unwrap();
    builder.into_inner().unwrap().finish().unwrap()
}

/// Serve `body` for every request until the runtime stops.
///
/// Returns the base URL.
pub async fn serve_bytes(body: Vec<u8>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let body = Arc::new(body);

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let body = Arc::clone(&body);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let _ = socket.read(&mut buf).await;
                let header = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(header.as_bytes()).await;
                let _ = socket.write_all(&body).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    format!("http://{addr}")
}
