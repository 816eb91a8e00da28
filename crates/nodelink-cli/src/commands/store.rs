use super::{block_on, context, fail, print_ok};
use miette::Result;
use nodelink_core::Config;
use serde::Serialize;

#[derive(Debug, Clone, Copy)]
pub enum StoreAction {
    List,
    Prune,
}

#[derive(Serialize)]
struct StoreInfo<'a, T: Serialize> {
    root: &'a std::path::Path,
    entries: T,
}

pub fn run(config: &Config, action: StoreAction, json: bool) -> Result<()> {
    let ctx = context(config, json);
    let store = &ctx.store;

    match action {
        StoreAction::List => {
            let entries = store.list().unwrap_or_else(|e| fail(&e, json));
            if json {
                return print_ok(&StoreInfo {
                    root: store.root(),
                    entries: &entries,
                });
            }
            println!("{}", store.root().display());
            for entry in &entries {
                println!(
                    "  {}  {} refs  {} bytes",
                    entry.identity, entry.referents, entry.size_bytes
                );
            }
            println!("{} entries", entries.len());
            Ok(())
        }
        StoreAction::Prune => {
            let summary = block_on(store.prune())?.unwrap_or_else(|e| fail(&e, json));
            if json {
                return print_ok(&summary);
            }
            for id in &summary.removed {
                println!("- {id}");
            }
            println!(
                "{} entries removed, {} staging directories cleaned",
                summary.removed.len(),
                summary.staging_removed
            );
            Ok(())
        }
    }
}
