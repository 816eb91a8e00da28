use super::{block_on, context, fail, open_project, print_ok};
use miette::Result;
use nodelink_core::pkg::{uninstall, UninstallOptions, UninstallReport};
use nodelink_core::Config;

pub fn run(config: &Config, packages: &[String], strict: bool, json: bool) -> Result<()> {
    let project = open_project(&config.cwd).unwrap_or_else(|e| fail(&e, json));
    let ctx = context(config, json);
    let options = UninstallOptions { strict };

    match block_on(uninstall(&ctx, &project, packages, options))? {
        Ok(report) if json => print_ok(&report),
        Ok(report) => {
            print_report(&report);
            Ok(())
        }
        Err(e) => fail(&e, json),
    }
}

fn print_report(report: &UninstallReport) {
    for name in &report.removed_roots {
        println!("- {name}");
    }
    for name in &report.stale {
        println!("- {name} (manifest only)");
    }
    for unknown in &report.unknown {
        eprintln!("! {}: {} {}", unknown.name, unknown.code, unknown.message);
    }

    if report.is_noop() && report.stale.is_empty() {
        println!("Nothing to uninstall");
    } else {
        println!(
            "{} orphaned, {} pruned from store",
            report.orphans.len(),
            report.pruned.len()
        );
    }
}
