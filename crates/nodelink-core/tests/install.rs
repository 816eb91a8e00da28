//! Install behavior: placement, linking, lifecycle dispatch and failure
//! handling.

mod support;

use nodelink_core::pkg::{
    install, InstallOptions, LifecyclePlan, LockResolution, Lockfile, PackageIdentity,
};
use std::fs;
use support::{serve_bytes, tarball, write_vendored, Fixture, PackageDef};

fn root(lockfile: &mut Lockfile, id: &PackageIdentity) {
    lockfile.add_dependency(id, format!("^{}", id.version), "dep");
}

#[tokio::test]
async fn test_install_places_links_and_records() {
    let fx = Fixture::new();
    let mut lockfile = Fixture::new_lockfile();
    let camelcase = fx.add_local(&mut lockfile, &PackageDef::new("camelcase", "3.0.0"));
    let keys = fx.add_local(
        &mut lockfile,
        &PackageDef::new("camelcase-keys", "3.0.0").dep(&camelcase),
    );
    root(&mut lockfile, &keys);

    let report = install(&fx.ctx, &fx.project, lockfile, InstallOptions::default())
        .await
        .unwrap();

    assert_eq!(report.added, vec![camelcase.clone(), keys.clone()]);
    assert_eq!(report.placed, report.added);
    assert!(report.removed.is_empty());
    assert!(report.manifest_updated);

    assert!(fx.in_store(&camelcase));
    assert!(fx.in_store(&keys));
    assert!(fx.node_modules().join("camelcase-keys/index.js").exists());
    // Only roots are linked at the top level
    assert!(!fx.node_modules().join("camelcase").exists());

    let written = Lockfile::read_from(&fx.project.lockfile_path()).unwrap();
    assert_eq!(written.packages.len(), 2);
    assert!(written.meta.nodelink_version.is_some());
    assert_eq!(fx.manifest()["dependencies"]["camelcase-keys"], "^3.0.0");

    let referents = fx.ctx.store.referents(&camelcase).await.unwrap();
    assert_eq!(referents.len(), 1);
    assert!(referents.iter().all(|r| r.project == fx.project.id()));
}

#[tokio::test]
async fn test_no_save_leaves_manifest_alone() {
    let fx = Fixture::new();
    let before = fs::read_to_string(fx.project.manifest_path()).unwrap();
    let mut lockfile = Fixture::new_lockfile();
    let id = fx.add_local(&mut lockfile, &PackageDef::new("is-positive", "1.0.0"));
    root(&mut lockfile, &id);

    let report = install(&fx.ctx, &fx.project, lockfile, InstallOptions { save: false })
        .await
        .unwrap();

    assert!(!report.manifest_updated);
    assert_eq!(fs::read_to_string(fx.project.manifest_path()).unwrap(), before);
    assert!(fx.project.lockfile_path().exists());
}

#[tokio::test]
async fn test_lifecycle_plans_dispatch_in_identity_order() {
    let fx = Fixture::new();
    let mut lockfile = Fixture::new_lockfile();
    let scripted = fx.add_local(
        &mut lockfile,
        &PackageDef::new("custom-build", "1.0.0")
            .native()
            .script("install", "make")
            .script("postinstall", "echo never"),
    );
    let native = fx.add_local(
        &mut lockfile,
        &PackageDef::new("addon", "2.0.0")
            .native()
            .script("postinstall", "echo done"),
    );
    let plain = fx.add_local(
        &mut lockfile,
        &PackageDef::new("plain", "0.1.0")
            .script("preinstall", "echo pre")
            .script("postinstall", "echo post"),
    );
    for id in [&scripted, &native, &plain] {
        root(&mut lockfile, id);
    }

    let report = install(&fx.ctx, &fx.project, lockfile, InstallOptions::default())
        .await
        .unwrap();

    let plans: Vec<(String, LifecyclePlan)> = report
        .lifecycles
        .iter()
        .map(|run| (run.identity.name.clone(), run.plan))
        .collect();
    assert_eq!(
        plans,
        vec![
            ("addon".to_string(), LifecyclePlan::HasNativeDescriptorOnly),
            ("custom-build".to_string(), LifecyclePlan::HasInstallScript),
            ("plain".to_string(), LifecyclePlan::PlainLifecycle),
        ]
    );

    let calls = fx.runner.calls();
    let expected = [
        ("addon@2.0.0", "rebuild"),
        ("addon@2.0.0", "postinstall"),
        ("custom-build@1.0.0", "install"),
        ("plain@0.1.0", "preinstall"),
        ("plain@0.1.0", "postinstall"),
    ];
    assert_eq!(
        calls,
        expected
            .iter()
            .map(|(p, e)| ((*p).to_string(), (*e).to_string()))
            .collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn test_lifecycle_runs_in_store_entry_with_bin_on_path() {
    let fx = Fixture::new();
    let mut lockfile = Fixture::new_lockfile();
    let id = fx.add_local(
        &mut lockfile,
        &PackageDef::new("has-hook", "1.0.0").script("postinstall", "node setup.js"),
    );
    root(&mut lockfile, &id);

    install(&fx.ctx, &fx.project, lockfile, InstallOptions::default())
        .await
        .unwrap();

    let invocations = fx.runner.invocations();
    assert_eq!(invocations.len(), 1);
    let call = &invocations[0];
    assert_eq!(call.cwd, fx.ctx.store.path(&id).unwrap());
    assert_eq!(call.args.last().map(String::as_str), Some("node setup.js"));

    let env = |key: &str| {
        call.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .unwrap()
    };
    assert_eq!(env("npm_lifecycle_event").to_str(), Some("postinstall"));
    assert_eq!(env("npm_package_name").to_str(), Some("has-hook"));
    let path = env("PATH");
    let first = std::env::split_paths(&path).next().unwrap();
    assert_eq!(first, fx.node_modules().join(".bin"));
}

#[tokio::test]
async fn test_lifecycle_runs_once_per_identity() {
    let fx = Fixture::new();
    let mut lockfile = Fixture::new_lockfile();
    let id = fx.add_local(
        &mut lockfile,
        &PackageDef::new("has-hook", "1.0.0").script("postinstall", "echo hi"),
    );
    root(&mut lockfile, &id);

    install(&fx.ctx, &fx.project, lockfile.clone(), InstallOptions::default())
        .await
        .unwrap();
    assert_eq!(fx.runner.calls().len(), 1);

    let report = install(&fx.ctx, &fx.project, lockfile, InstallOptions::default())
        .await
        .unwrap();
    assert!(report.added.is_empty());
    assert!(report.lifecycles.is_empty());
    assert_eq!(fx.runner.calls().len(), 1);
}

#[tokio::test]
async fn test_ignore_scripts_skips_lifecycles() {
    let mut fx = Fixture::new();
    fx.ctx.ignore_scripts = true;
    let mut lockfile = Fixture::new_lockfile();
    let id = fx.add_local(
        &mut lockfile,
        &PackageDef::new("addon", "1.0.0").native().script("install", "make"),
    );
    root(&mut lockfile, &id);

    let report = install(&fx.ctx, &fx.project, lockfile, InstallOptions::default())
        .await
        .unwrap();

    assert!(report.lifecycles.is_empty());
    assert!(fx.runner.calls().is_empty());
    assert!(fx.in_store(&id));
}

#[tokio::test]
async fn test_failed_lifecycle_rolls_back() {
    let fx = Fixture::new();
    let manifest_before = fs::read_to_string(fx.project.manifest_path()).unwrap();

    let mut lockfile = Fixture::new_lockfile();
    let ok = fx.add_local(&mut lockfile, &PackageDef::new("fine", "1.0.0"));
    let broken = fx.add_local(
        &mut lockfile,
        &PackageDef::new("broken", "1.0.0").script("install", "exit 1"),
    );
    root(&mut lockfile, &ok);
    root(&mut lockfile, &broken);
    fx.runner.fail_package("broken@1.0.0");

    let err = install(&fx.ctx, &fx.project, lockfile.clone(), InstallOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.code(), "PKG_LIFECYCLE_SCRIPT_FAILED");
    assert!(err.message().contains("broken@1.0.0"));
    assert!(err.message().contains("install"));

    assert!(!fx.project.lockfile_path().exists());
    assert_eq!(
        fs::read_to_string(fx.project.manifest_path()).unwrap(),
        manifest_before
    );
    assert!(!fx.node_modules().join("fine").exists());
    assert!(!fx.in_store(&ok));
    assert!(!fx.in_store(&broken));

    // A retry runs the lifecycle again
    fx.runner.fail_package("nothing@0.0.0");
    fx.runner.clear();
    install(&fx.ctx, &fx.project, lockfile, InstallOptions::default())
        .await
        .unwrap();
    assert_eq!(
        fx.runner.calls(),
        vec![("broken@1.0.0".to_string(), "install".to_string())]
    );
}

#[tokio::test]
async fn test_failed_fetch_changes_nothing() {
    let fx = Fixture::new();
    let mut lockfile = Fixture::new_lockfile();
    let present = fx.add_local(&mut lockfile, &PackageDef::new("present", "1.0.0"));
    // Nothing listens on port 1
    let missing = lockfile
        .add_package(
            "missing",
            PackageDef::new("missing", "1.0.0").lock_entry(LockResolution::Tarball {
                url: "http://127.0.0.1:1/missing-1.0.0.tgz".to_string(),
            }),
        )
        .unwrap();
    root(&mut lockfile, &present);
    root(&mut lockfile, &missing);

    let err = install(&fx.ctx, &fx.project, lockfile, InstallOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.code(), "PKG_FETCH_FAILED");
    assert!(!fx.project.lockfile_path().exists());
    assert!(!fx.node_modules().join("present").exists());
    assert!(!fx.in_store(&missing));
    // Fetched content is unreferenced and swept
    assert!(!fx.in_store(&present));
}

#[tokio::test]
async fn test_replacing_a_root_releases_the_old_version() {
    let fx = Fixture::new();

    let mut first = Fixture::new_lockfile();
    let old = fx.add_local(&mut first, &PackageDef::new("is-positive", "1.0.0"));
    let other = fx.add_local(&mut first, &PackageDef::new("is-negative", "2.1.0"));
    root(&mut first, &old);
    root(&mut first, &other);
    install(&fx.ctx, &fx.project, first, InstallOptions::default())
        .await
        .unwrap();

    let mut second = Fixture::new_lockfile();
    let new = fx.add_local(&mut second, &PackageDef::new("is-positive", "3.1.0"));
    root(&mut second, &new);
    let report = install(&fx.ctx, &fx.project, second, InstallOptions::default())
        .await
        .unwrap();

    assert_eq!(report.added, vec![new.clone()]);
    assert_eq!(report.removed, vec![old.clone()]);
    assert_eq!(report.pruned, vec![old.clone()]);
    assert!(!fx.in_store(&old));
    assert!(fx.in_store(&new));

    let target = fs::read_link(fx.node_modules().join("is-positive")).unwrap();
    assert_eq!(
        canonical(&target),
        canonical(&fx.ctx.store.path(&new).unwrap())
    );
    // Roots not mentioned in the request are kept
    assert!(fx.node_modules().join("is-negative/index.js").exists());
    assert_eq!(fx.manifest()["dependencies"]["is-positive"], "^3.1.0");
    assert_eq!(fx.manifest()["dependencies"]["is-negative"], "^2.1.0");
}

fn canonical(path: &std::path::Path) -> std::path::PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_installs_share_one_entry() {
    let fx = Fixture::new();
    let def = PackageDef::new("is-array", "1.0.1");
    let base = serve_bytes(tarball(&def)).await;

    let mut lockfile = Fixture::new_lockfile();
    let id = lockfile
        .add_package(
            "is-array",
            def.lock_entry(LockResolution::Tarball {
                url: format!("{base}/is-array-1.0.1.tgz"),
            }),
        )
        .unwrap();
    root(&mut lockfile, &id);

    let other = Fixture::sharing_store(&fx);
    let (a, b) = tokio::join!(
        install(&fx.ctx, &fx.project, lockfile.clone(), InstallOptions::default()),
        install(&fx.ctx, &other, lockfile, InstallOptions::default()),
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(fx.ctx.store.referents(&id).await.unwrap().len(), 2);
    let listing = fx.ctx.store.list().unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].identity, id);
    assert!(fx.node_modules().join("is-array/index.js").exists());
    assert!(other.node_modules().join("is-array/index.js").exists());
}

#[tokio::test]
async fn test_missing_local_source_fails_before_changes() {
    let fx = Fixture::new();
    let mut lockfile = Fixture::new_lockfile();
    let present = fx.add_local(&mut lockfile, &PackageDef::new("present", "1.0.0"));
    let missing = lockfile
        .add_package(
            "missing",
            PackageDef::new("missing", "1.0.0").lock_entry(LockResolution::File {
                path: "vendor/does-not-exist".to_string(),
            }),
        )
        .unwrap();
    root(&mut lockfile, &present);
    root(&mut lockfile, &missing);

    let err = install(&fx.ctx, &fx.project, lockfile, InstallOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.code(), "PKG_FETCH_FAILED");
    assert!(err.message().contains("does-not-exist"));
    assert!(!fx.project.lockfile_path().exists());
    assert!(fx.ctx.store.list().unwrap().is_empty());
}

#[tokio::test]
async fn test_install_keys_local_packages_by_content() {
    let fx = Fixture::new();
    let def = PackageDef::new("local-lib", "1.0.0");
    let rel = write_vendored(fx.root(), &def);

    let mut lockfile = Fixture::new_lockfile();
    let provisional = lockfile
        .add_package("local-lib", def.lock_entry(LockResolution::File { path: rel }))
        .unwrap();
    root(&mut lockfile, &provisional);

    let report = install(&fx.ctx, &fx.project, lockfile, InstallOptions::default())
        .await
        .unwrap();

    let written = Lockfile::read_from(&fx.project.lockfile_path()).unwrap();
    let (key, pkg) = written.packages.iter().next().unwrap();
    let pinned = pkg.pinned_identity("local-lib", fx.root()).unwrap();
    assert_eq!(*key, pinned.key());
    assert_ne!(pinned, provisional);
    assert_eq!(report.added, vec![pinned.clone()]);
    assert_eq!(
        written.dependencies["local-lib"].resolved,
        pinned.reference()
    );
    assert!(fx.in_store(&pinned));
}

#[tokio::test]
async fn test_same_local_path_with_different_content_is_not_shared() {
    let fx = Fixture::new();
    let other = Fixture::sharing_store(&fx);
    let def = PackageDef::new("local-lib", "1.0.0");

    let mut first = Fixture::new_lockfile();
    let first_id = fx.add_local(&mut first, &def);
    root(&mut first, &first_id);
    install(&fx.ctx, &fx.project, first, InstallOptions::default())
        .await
        .unwrap();

    // Same relative path and version, edited sources
    let rel = write_vendored(other.root(), &def);
    fs::write(
        other.root().join(&rel).join("index.js"),
        "module.exports = 'patched';\n",
    )
    .unwrap();
    let mut second = Fixture::new_lockfile();
    let second_id = second
        .add_pinned_package(
            "local-lib",
            def.lock_entry(LockResolution::File { path: rel }),
            other.root(),
        )
        .unwrap();
    root(&mut second, &second_id);
    let report = install(&fx.ctx, &other, second, InstallOptions::default())
        .await
        .unwrap();

    assert_ne!(first_id, second_id);
    assert_eq!(report.placed, vec![second_id.clone()]);
    assert!(fx.in_store(&first_id));
    assert!(fx.in_store(&second_id));

    let read = |root: std::path::PathBuf| {
        fs::read_to_string(root.join("local-lib").join("index.js")).unwrap()
    };
    assert_eq!(read(fx.node_modules()), "module.exports = 'local-lib';\n");
    assert_eq!(read(other.node_modules()), "module.exports = 'patched';\n");
}

#[tokio::test]
async fn test_shared_entry_is_built_once() {
    let fx = Fixture::new();
    let other = Fixture::sharing_store(&fx);
    let def = PackageDef::new("has-hook", "1.0.0").script("postinstall", "node build.js");

    let mut lockfile = Fixture::new_lockfile();
    let id = fx.add_local(&mut lockfile, &def);
    root(&mut lockfile, &id);
    write_vendored(other.root(), &def);

    let first = install(&fx.ctx, &fx.project, lockfile.clone(), InstallOptions::default())
        .await
        .unwrap();
    assert_eq!(first.lifecycles.len(), 1);

    let second = install(&fx.ctx, &other, lockfile, InstallOptions::default())
        .await
        .unwrap();
    assert_eq!(second.added, vec![id.clone()]);
    assert!(second.placed.is_empty());
    assert!(second.lifecycles.is_empty());
    assert_eq!(
        fx.runner.calls(),
        vec![("has-hook@1.0.0".to_string(), "postinstall".to_string())]
    );
    assert_eq!(fx.ctx.store.referents(&id).await.unwrap().len(), 2);
}
