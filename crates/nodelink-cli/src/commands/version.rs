use miette::Result;
use nodelink_core::version::{version_string, SCHEMA_VERSION, VERSION};
use serde::Serialize;

#[derive(Serialize)]
struct VersionInfo {
    version: &'static str,
    schema_version: u32,
}

pub fn run(json: bool) -> Result<()> {
    if json {
        return super::print_ok(&VersionInfo {
            version: VERSION,
            schema_version: SCHEMA_VERSION,
        });
    }
    println!("{}", version_string());
    Ok(())
}
