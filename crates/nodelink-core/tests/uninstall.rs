//! Uninstall behavior: what leaves the store, `node_modules` and the
//! manifest, and what stays.

mod support;

use nodelink_core::pkg::{
    install, relink, uninstall, InstallOptions, LockResolution, Lockfile, PackageIdentity,
    UninstallOptions, LOCKFILE_NAME,
};
use std::fs;
use support::{serve_bytes, tarball, write_vendored, Fixture, PackageDef};

async fn install_lockfile(fx: &Fixture, lockfile: Lockfile) {
    install(&fx.ctx, &fx.project, lockfile, InstallOptions::default())
        .await
        .unwrap();
}

fn root(lockfile: &mut Lockfile, id: &PackageIdentity) {
    lockfile.add_dependency(id, format!("^{}", id.version), "dep");
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(ToString::to_string).collect()
}

fn linked(fx: &Fixture, name: &str) -> bool {
    fx.node_modules().join(name).symlink_metadata().is_ok()
}

#[tokio::test]
async fn test_uninstall_only_root_empties_everything() {
    let fx = Fixture::new();
    let mut lockfile = Fixture::new_lockfile();
    let positive = fx.add_local(&mut lockfile, &PackageDef::new("is-positive", "1.0.0"));
    root(&mut lockfile, &positive);
    install_lockfile(&fx, lockfile).await;

    assert!(fx.in_store(&positive));
    assert!(linked(&fx, "is-positive"));
    assert_eq!(fx.manifest()["dependencies"]["is-positive"], "^1.0.0");

    let report = uninstall(
        &fx.ctx,
        &fx.project,
        &names(&["is-positive"]),
        UninstallOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(report.removed_roots, vec!["is-positive"]);
    assert_eq!(report.pruned, vec![positive.clone()]);
    assert!(!fx.in_store(&positive));
    assert!(!linked(&fx, "is-positive"));
    assert_eq!(fx.manifest()["dependencies"], serde_json::json!({}));

    let lockfile = Lockfile::read_from(&fx.root().join(LOCKFILE_NAME)).unwrap();
    assert!(lockfile.dependencies.is_empty());
    assert!(lockfile.packages.is_empty());
}

#[tokio::test]
async fn test_uninstall_scoped_root() {
    let fx = Fixture::new();
    let mut lockfile = Fixture::new_lockfile();
    let logger = fx.add_local(&mut lockfile, &PackageDef::new("@zkochan/logger", "0.1.0"));
    root(&mut lockfile, &logger);
    install_lockfile(&fx, lockfile).await;

    assert!(fx.node_modules().join("@zkochan/logger/index.js").exists());

    uninstall(
        &fx.ctx,
        &fx.project,
        &names(&["@zkochan/logger"]),
        UninstallOptions::default(),
    )
    .await
    .unwrap();

    assert!(!fx.in_store(&logger));
    assert!(!linked(&fx, "@zkochan/logger"));
    // The emptied scope directory goes too
    assert!(!fx.node_modules().join("@zkochan").exists());
    assert_eq!(fx.manifest()["dependencies"], serde_json::json!({}));
}

#[tokio::test]
async fn test_uninstall_tarball_root_removes_content_addressed_entry() {
    let fx = Fixture::new();
    let def = PackageDef::new("is-array", "1.0.1");
    let base = serve_bytes(tarball(&def)).await;
    let url = format!("{base}/is-array/-/is-array-1.0.1.tgz");

    let mut lockfile = Fixture::new_lockfile();
    let id = lockfile
        .add_package(
            "is-array",
            def.lock_entry(LockResolution::Tarball { url: url.clone() }),
        )
        .unwrap();
    root(&mut lockfile, &id);
    install_lockfile(&fx, lockfile).await;

    assert!(id.content_key.is_some());
    let entry = fx.ctx.store.path(&id).unwrap();
    assert!(entry.join("package.json").exists());
    assert!(fx.node_modules().join("is-array/index.js").exists());

    uninstall(
        &fx.ctx,
        &fx.project,
        &names(&["is-array"]),
        UninstallOptions::default(),
    )
    .await
    .unwrap();

    assert!(!fx.in_store(&id));
    assert!(!entry.exists());
    assert!(!linked(&fx, "is-array"));
}

/// `camelcase-keys` -> `camelcase`, `map-obj`; plus independent `is-negative`.
fn camelcase_keys(fx: &Fixture, lockfile: &mut Lockfile) -> [PackageIdentity; 3] {
    let camelcase = fx.add_local(lockfile, &PackageDef::new("camelcase", "3.0.0"));
    let map_obj = fx.add_local(lockfile, &PackageDef::new("map-obj", "1.0.1"));
    let keys = fx.add_local(
        lockfile,
        &PackageDef::new("camelcase-keys", "3.0.0")
            .dep(&camelcase)
            .dep(&map_obj),
    );
    root(lockfile, &keys);
    [keys, camelcase, map_obj]
}

#[tokio::test]
async fn test_uninstall_removes_exclusive_transitives_and_keeps_sibling() {
    let fx = Fixture::new();
    let mut lockfile = Fixture::new_lockfile();
    let [keys, camelcase, map_obj] = camelcase_keys(&fx, &mut lockfile);
    let negative = fx.add_local(&mut lockfile, &PackageDef::new("is-negative", "2.1.0"));
    root(&mut lockfile, &negative);
    install_lockfile(&fx, lockfile).await;

    let negative_entry = fx.ctx.store.path(&negative).unwrap();
    let negative_link = fs::read_link(fx.node_modules().join("is-negative")).unwrap();

    let report = uninstall(
        &fx.ctx,
        &fx.project,
        &names(&["camelcase-keys"]),
        UninstallOptions::default(),
    )
    .await
    .unwrap();

    let mut expected = vec![keys.clone(), camelcase.clone(), map_obj.clone()];
    expected.sort();
    assert_eq!(report.orphans, expected);
    for id in [&keys, &camelcase, &map_obj] {
        assert!(!fx.in_store(id), "{id} should be pruned");
    }
    assert!(!linked(&fx, "camelcase-keys"));

    assert_eq!(fx.ctx.store.path(&negative), Some(negative_entry));
    assert_eq!(
        fs::read_link(fx.node_modules().join("is-negative")).unwrap(),
        negative_link
    );
    let manifest = fx.manifest();
    assert_eq!(manifest["dependencies"]["is-negative"], "^2.1.0");
    assert!(manifest["dependencies"].get("camelcase-keys").is_none());
}

#[tokio::test]
async fn test_uninstall_keeps_dependency_shared_with_surviving_root() {
    let fx = Fixture::new();
    let mut lockfile = Fixture::new_lockfile();
    let [keys, camelcase, map_obj] = camelcase_keys(&fx, &mut lockfile);
    let hastscript = fx.add_local(
        &mut lockfile,
        &PackageDef::new("hastscript", "3.0.0").dep(&camelcase),
    );
    root(&mut lockfile, &hastscript);
    install_lockfile(&fx, lockfile).await;

    let report = uninstall(
        &fx.ctx,
        &fx.project,
        &names(&["camelcase-keys"]),
        UninstallOptions::default(),
    )
    .await
    .unwrap();

    let mut expected = vec![keys.clone(), map_obj.clone()];
    expected.sort();
    assert_eq!(report.orphans, expected);
    assert!(!fx.in_store(&keys));
    assert!(!fx.in_store(&map_obj));
    assert!(fx.in_store(&camelcase));
    assert!(fx.in_store(&hastscript));

    let lockfile = Lockfile::read_from(&fx.root().join(LOCKFILE_NAME)).unwrap();
    assert!(lockfile.get_package(&camelcase).is_some());
    assert!(lockfile.get_package(&map_obj).is_none());
}

#[tokio::test]
async fn test_uninstall_unrelated_root_leaves_sibling_untouched() {
    let fx = Fixture::new();
    let mut lockfile = Fixture::new_lockfile();
    let not_positive = fx.add_local(&mut lockfile, &PackageDef::new("is-not-positive", "1.0.0"));
    let positive = fx.add_local(&mut lockfile, &PackageDef::new("is-positive", "3.1.0"));
    root(&mut lockfile, &not_positive);
    root(&mut lockfile, &positive);
    install_lockfile(&fx, lockfile).await;

    let before = fx.ctx.store.referents(&positive).await.unwrap();

    uninstall(
        &fx.ctx,
        &fx.project,
        &names(&["is-not-positive"]),
        UninstallOptions::default(),
    )
    .await
    .unwrap();

    assert!(!fx.in_store(&not_positive));
    assert!(fx.in_store(&positive));
    assert_eq!(fx.ctx.store.referents(&positive).await.unwrap(), before);
    assert!(fx.node_modules().join("is-positive/index.js").exists());
}

#[cfg(unix)]
#[tokio::test]
async fn test_uninstall_removes_bin_entries() {
    let fx = Fixture::new();
    let mut lockfile = Fixture::new_lockfile();
    let rimraf = fx.add_local(
        &mut lockfile,
        &PackageDef::new("rimraf", "2.5.1").bin("rimraf", "bin.js"),
    );
    root(&mut lockfile, &rimraf);
    install_lockfile(&fx, lockfile).await;

    let bin = fx.node_modules().join(".bin/rimraf");
    assert!(bin.symlink_metadata().is_ok());
    assert!(bin.exists(), "bin link should resolve");
    // Stray shim forms are cleaned up as well
    fs::write(fx.node_modules().join(".bin/rimraf.cmd"), "@node bin.js\r\n").unwrap();

    uninstall(
        &fx.ctx,
        &fx.project,
        &names(&["rimraf"]),
        UninstallOptions::default(),
    )
    .await
    .unwrap();

    let bin_dir = fx.node_modules().join(".bin");
    let leftovers: Vec<_> = fs::read_dir(&bin_dir)
        .map(|dir| dir.filter_map(Result::ok).map(|e| e.file_name()).collect())
        .unwrap_or_default();
    assert!(leftovers.is_empty(), "left in .bin: {leftovers:?}");
}

#[cfg(unix)]
#[tokio::test]
async fn test_uninstall_twice_is_a_noop() {
    let fx = Fixture::new();
    let mut lockfile = Fixture::new_lockfile();
    let [_, camelcase, _] = camelcase_keys(&fx, &mut lockfile);
    let negative = fx.add_local(
        &mut lockfile,
        &PackageDef::new("is-negative", "2.1.0").bin("is-negative", "cli.js"),
    );
    root(&mut lockfile, &negative);
    install_lockfile(&fx, lockfile).await;

    uninstall(
        &fx.ctx,
        &fx.project,
        &names(&["camelcase-keys"]),
        UninstallOptions::default(),
    )
    .await
    .unwrap();
    assert!(!fx.in_store(&camelcase));

    let snapshot = fx.node_modules_snapshot();
    let manifest = fs::read_to_string(fx.project.manifest_path()).unwrap();
    let lockfile = fs::read_to_string(fx.project.lockfile_path()).unwrap();

    let report = uninstall(
        &fx.ctx,
        &fx.project,
        &names(&["camelcase-keys"]),
        UninstallOptions::default(),
    )
    .await
    .unwrap();

    assert!(report.is_noop());
    assert_eq!(report.unknown.len(), 1);
    assert_eq!(fx.node_modules_snapshot(), snapshot);
    assert_eq!(
        fs::read_to_string(fx.project.manifest_path()).unwrap(),
        manifest
    );
    assert_eq!(
        fs::read_to_string(fx.project.lockfile_path()).unwrap(),
        lockfile
    );
}

#[cfg(unix)]
#[tokio::test]
async fn test_relink_twice_changes_nothing() {
    let fx = Fixture::new();
    let mut lockfile = Fixture::new_lockfile();
    camelcase_keys(&fx, &mut lockfile);
    install_lockfile(&fx, lockfile).await;

    let snapshot = fx.node_modules_snapshot();
    let first = relink(&fx.ctx, &fx.project).await.unwrap();
    let second = relink(&fx.ctx, &fx.project).await.unwrap();

    assert!(first.is_noop());
    assert!(second.is_noop());
    assert_eq!(fx.node_modules_snapshot(), snapshot);
}

#[tokio::test]
async fn test_relink_restores_deleted_links() {
    let fx = Fixture::new();
    let mut lockfile = Fixture::new_lockfile();
    let [keys, ..] = camelcase_keys(&fx, &mut lockfile);
    install_lockfile(&fx, lockfile).await;

    fs::remove_dir_all(fx.node_modules()).unwrap();
    let summary = relink(&fx.ctx, &fx.project).await.unwrap();

    assert!(summary.linked >= 1);
    assert!(fx.node_modules().join("camelcase-keys/index.js").exists());
    assert!(fx.in_store(&keys));
}

#[tokio::test]
async fn test_disconnected_cycle_is_orphaned() {
    let fx = Fixture::new();
    let mut lockfile = Fixture::new_lockfile();

    // cyc-a <-> cyc-b, reachable only through `entry`
    let a_def = PackageDef::new("cyc-a", "1.0.0");
    let a_rel = write_vendored(fx.root(), &a_def);
    let a_entry = a_def.lock_entry(LockResolution::File { path: a_rel });
    let a_id = a_entry.pinned_identity("cyc-a", fx.root()).unwrap();
    let b = fx.add_local(&mut lockfile, &PackageDef::new("cyc-b", "1.0.0").dep(&a_id));
    let a = lockfile
        .add_pinned_package("cyc-a", a_entry, fx.root())
        .unwrap();
    lockfile.packages.get_mut(&a.key()).unwrap().add_dependency(&b);
    assert_eq!(a, a_id);

    let entry = fx.add_local(&mut lockfile, &PackageDef::new("entry", "1.0.0").dep(&a));
    let other = fx.add_local(&mut lockfile, &PackageDef::new("other", "1.0.0"));
    root(&mut lockfile, &entry);
    root(&mut lockfile, &other);
    install_lockfile(&fx, lockfile).await;
    assert!(fx.in_store(&a));
    assert!(fx.in_store(&b));

    let report = uninstall(
        &fx.ctx,
        &fx.project,
        &names(&["entry"]),
        UninstallOptions::default(),
    )
    .await
    .unwrap();

    assert!(report.orphans.contains(&a));
    assert!(report.orphans.contains(&b));
    assert!(!fx.in_store(&a));
    assert!(!fx.in_store(&b));
    assert!(fx.in_store(&other));
}

#[tokio::test]
async fn test_strict_mode_rejects_unknown_before_changes() {
    let fx = Fixture::new();
    let mut lockfile = Fixture::new_lockfile();
    let positive = fx.add_local(&mut lockfile, &PackageDef::new("is-positive", "1.0.0"));
    root(&mut lockfile, &positive);
    install_lockfile(&fx, lockfile).await;

    let err = uninstall(
        &fx.ctx,
        &fx.project,
        &names(&["is-positive", "left-pad"]),
        UninstallOptions { strict: true },
    )
    .await
    .unwrap_err();

    assert_eq!(err.code(), "PKG_GRAPH_INTEGRITY");
    assert!(err.message().contains("left-pad"));
    assert!(fx.in_store(&positive));
    assert!(linked(&fx, "is-positive"));
    assert_eq!(fx.manifest()["dependencies"]["is-positive"], "^1.0.0");
}

#[tokio::test]
async fn test_lenient_mode_reports_unknown_and_proceeds() {
    let fx = Fixture::new();
    let mut lockfile = Fixture::new_lockfile();
    let positive = fx.add_local(&mut lockfile, &PackageDef::new("is-positive", "1.0.0"));
    root(&mut lockfile, &positive);
    install_lockfile(&fx, lockfile).await;

    let report = uninstall(
        &fx.ctx,
        &fx.project,
        &names(&["left-pad", "is-positive"]),
        UninstallOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(report.removed_roots, vec!["is-positive"]);
    assert_eq!(report.unknown.len(), 1);
    assert_eq!(report.unknown[0].name, "left-pad");
    assert_eq!(report.unknown[0].code, "PKG_GRAPH_INTEGRITY");
    assert!(!fx.in_store(&positive));
}

#[tokio::test]
async fn test_stale_manifest_entry_is_dropped() {
    let fx = Fixture::new();
    fs::write(
        fx.project.manifest_path(),
        r#"{"name": "app", "version": "1.0.0", "devDependencies": {"ghost": "^1.0.0"}}"#,
    )
    .unwrap();

    let report = uninstall(
        &fx.ctx,
        &fx.project,
        &names(&["ghost"]),
        UninstallOptions { strict: true },
    )
    .await
    .unwrap();

    assert_eq!(report.stale, vec!["ghost"]);
    assert!(report.manifest_updated);
    assert_eq!(fx.manifest()["devDependencies"], serde_json::json!({}));
}

#[tokio::test]
async fn test_entry_referenced_by_another_project_survives() {
    let fx = Fixture::new();
    let mut lockfile = Fixture::new_lockfile();
    let def = PackageDef::new("is-positive", "1.0.0");
    let positive = fx.add_local(&mut lockfile, &def);
    root(&mut lockfile, &positive);
    install_lockfile(&fx, lockfile.clone()).await;

    // Same content vendored there, so the identity and store entry are shared
    let other = Fixture::sharing_store(&fx);
    write_vendored(other.root(), &def);
    install(&fx.ctx, &other, lockfile, InstallOptions::default())
        .await
        .unwrap();
    assert_eq!(fx.ctx.store.referents(&positive).await.unwrap().len(), 2);

    let report = uninstall(
        &fx.ctx,
        &fx.project,
        &names(&["is-positive"]),
        UninstallOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(report.orphans, vec![positive.clone()]);
    assert!(report.pruned.is_empty());
    assert!(fx.in_store(&positive));
    assert!(!linked(&fx, "is-positive"));
    assert!(other.node_modules().join("is-positive/index.js").exists());

    let referents = fx.ctx.store.referents(&positive).await.unwrap();
    assert_eq!(referents.len(), 1);
    assert!(referents.iter().all(|r| r.project == other.id()));
}

#[tokio::test]
async fn test_uninstall_in_empty_project() {
    let fx = Fixture::new();

    let report = uninstall(
        &fx.ctx,
        &fx.project,
        &names(&["anything"]),
        UninstallOptions::default(),
    )
    .await
    .unwrap();

    assert!(report.is_noop());
    assert_eq!(report.unknown.len(), 1);
    assert!(!fx.project.lockfile_path().exists());
}
