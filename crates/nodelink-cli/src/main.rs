#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::missing_errors_doc)]

mod commands;
mod logging;

use clap::Parser;
use commands::install::InstallAction;
use commands::store::StoreAction;
use nodelink_core::config::Channel;
use nodelink_core::Config;
use miette::Result;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "nodelink")]
#[command(author, version, about = "Content-addressed node_modules installer", long_about = None)]
struct Cli {
    /// Increase logging verbosity (-v for DEBUG, -vv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit JSON formatted output (stable, machine-readable)
    #[arg(long, global = true)]
    json: bool,

    /// Override the working directory
    #[arg(long, global = true, value_name = "PATH")]
    cwd: Option<PathBuf>,

    /// Store location (default: platform cache dir, or $NODELINK_STORE_DIR)
    #[arg(long, global = true, value_name = "PATH")]
    store_dir: Option<PathBuf>,

    /// Release channel, selects the default store
    #[arg(long, global = true, default_value = "stable")]
    channel: Channel,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Print version information
    Version,

    /// Install the graph described by a lockfile
    Install {
        /// Lockfile to install from (default: the project's own)
        #[arg(long, value_name = "PATH")]
        lockfile: Option<PathBuf>,

        /// Do not record installed roots in package.json
        #[arg(long)]
        no_save: bool,

        /// Skip lifecycle scripts and native rebuilds
        #[arg(long)]
        ignore_scripts: bool,
    },

    /// Remove packages and everything only they depended on
    #[command(alias = "remove", alias = "rm")]
    Uninstall {
        /// Package names
        #[arg(required = true)]
        packages: Vec<String>,

        /// Fail without changes if a package is not installed
        #[arg(long)]
        strict: bool,
    },

    /// Re-create node_modules links from the lockfile
    Link,

    /// Inspect or clean the shared store
    Store {
        #[command(subcommand)]
        store_cmd: StoreCommands,
    },
}

#[derive(clap::Subcommand, Debug)]
enum StoreCommands {
    /// List store entries and their reference counts
    List,
    /// Delete unreferenced entries and leftover staging directories
    Prune,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let cwd = cli
        .cwd
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));

    let mut config = Config::new(cwd)
        .with_env()
        .with_verbosity(cli.verbose)
        .with_json_logs(cli.json)
        .with_channel(cli.channel);
    if let Some(dir) = cli.store_dir {
        config = config.with_store_dir(dir);
    }

    // Version prints before logging so its output stays clean
    if matches!(cli.command, Commands::Version) {
        return commands::version::run(cli.json);
    }

    logging::init(config.verbosity, config.json_logs);

    match cli.command {
        Commands::Version => commands::version::run(cli.json),
        Commands::Install {
            lockfile,
            no_save,
            ignore_scripts,
        } => {
            let config = config.with_ignore_scripts(ignore_scripts);
            let action = InstallAction {
                lockfile,
                save: !no_save,
            };
            commands::install::run(&config, action, cli.json)
        }
        Commands::Uninstall { packages, strict } => {
            commands::uninstall::run(&config, &packages, strict, cli.json)
        }
        Commands::Link => commands::link::run(&config, cli.json),
        Commands::Store { store_cmd } => {
            let action = match store_cmd {
                StoreCommands::List => StoreAction::List,
                StoreCommands::Prune => StoreAction::Prune,
            };
            commands::store::run(&config, action, cli.json)
        }
    }
}
