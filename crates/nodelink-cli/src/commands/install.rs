use super::{block_on, context, fail, open_project, print_ok};
use miette::Result;
use nodelink_core::pkg::{
    install, InstallOptions, InstallReport, LifecyclePlan, Lockfile, PkgError,
};
use nodelink_core::Config;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug)]
pub struct InstallAction {
    /// Lockfile describing the graph to install; the project's own if unset.
    pub lockfile: Option<PathBuf>,
    pub save: bool,
}

pub fn run(config: &Config, action: InstallAction, json: bool) -> Result<()> {
    let project = open_project(&config.cwd).unwrap_or_else(|e| fail(&e, json));
    let ctx = context(config, json);

    let source = action
        .lockfile
        .map_or_else(|| project.lockfile_path(), |path| config.cwd.join(path));
    info!(project = %project.id(), lockfile = %source.display(), "install");

    let requested = Lockfile::read_from(&source)
        .map_err(PkgError::from)
        .unwrap_or_else(|e| fail(&e, json));
    let options = InstallOptions { save: action.save };

    match block_on(install(&ctx, &project, requested, options))? {
        Ok(report) if json => print_ok(&report),
        Ok(report) => {
            print_report(&report);
            Ok(())
        }
        Err(e) => fail(&e, json),
    }
}

fn print_report(report: &InstallReport) {
    for id in &report.added {
        println!("+ {id}");
    }
    for id in &report.removed {
        println!("- {id}");
    }
    for run in &report.lifecycles {
        if run.plan != LifecyclePlan::PlainLifecycle {
            println!("  built {} ({:?})", run.identity, run.plan);
        }
    }

    if report.added.is_empty() && report.removed.is_empty() {
        println!("Already up to date");
    } else {
        println!(
            "{} added, {} removed, {} pruned from store",
            report.added.len(),
            report.removed.len(),
            report.pruned.len()
        );
    }
}
