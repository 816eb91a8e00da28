//! Subcommand implementations.
//!
//! Every command prints either human-readable text or, with `--json`, a
//! single JSON object on stdout. Failures exit with code 2.

pub mod install;
pub mod link;
pub mod store;
pub mod uninstall;
pub mod version;

use miette::{IntoDiagnostic, Result};
use nodelink_core::paths;
use nodelink_core::pkg::{PkgContext, PkgError, Project};
use nodelink_core::Config;
use serde::Serialize;
use std::path::Path;

/// Error part of the JSON envelope.
#[derive(Debug, Serialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

/// Stable JSON shape of every command result.
#[derive(Debug, Serialize)]
pub struct Envelope<'a, T: Serialize> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<&'a T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

/// Print a successful result.
pub fn print_ok<T: Serialize>(result: &T) -> Result<()> {
    let envelope = Envelope {
        ok: true,
        result: Some(result),
        error: None,
    };
    println!("{}", serde_json::to_string_pretty(&envelope).into_diagnostic()?);
    Ok(())
}

/// Report `err` and exit with code 2.
pub fn fail(err: &PkgError, json: bool) -> ! {
    if json {
        let envelope: Envelope<'_, ()> = Envelope {
            ok: false,
            result: None,
            error: Some(ErrorInfo {
                code: err.code().to_string(),
                message: err.message().to_string(),
            }),
        };
        match serde_json::to_string_pretty(&envelope) {
            Ok(out) => println!("{out}"),
            Err(_) => eprintln!("error: {err}"),
        }
    } else {
        eprintln!("error: {err}");
    }
    std::process::exit(2);
}

/// The project a command operates on: the nearest ancestor with a
/// `package.json`, or `cwd` itself.
pub fn open_project(cwd: &Path) -> Result<Project, PkgError> {
    let root = paths::project_root(cwd).unwrap_or_else(|| cwd.to_path_buf());
    Project::open(&root)
}

/// Run an async package operation to completion.
pub fn block_on<F: std::future::Future>(future: F) -> Result<F::Output> {
    let rt = tokio::runtime::Runtime::new().into_diagnostic()?;
    Ok(rt.block_on(future))
}

/// Context for `config`, or exit with the error.
pub fn context(config: &Config, json: bool) -> PkgContext {
    PkgContext::from_config(config).unwrap_or_else(|e| fail(&e, json))
}
