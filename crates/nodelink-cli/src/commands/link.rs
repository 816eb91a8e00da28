use super::{block_on, context, fail, open_project, print_ok};
use miette::Result;
use nodelink_core::pkg::relink;
use nodelink_core::Config;

/// Re-project `node_modules` from the project's lockfile.
pub fn run(config: &Config, json: bool) -> Result<()> {
    let project = open_project(&config.cwd).unwrap_or_else(|e| fail(&e, json));
    let ctx = context(config, json);

    match block_on(relink(&ctx, &project))? {
        Ok(summary) if json => print_ok(&summary),
        Ok(summary) if summary.is_noop() => {
            println!("node_modules is up to date");
            Ok(())
        }
        Ok(summary) => {
            println!("{} links written", summary.linked);
            Ok(())
        }
        Err(e) => fail(&e, json),
    }
}
