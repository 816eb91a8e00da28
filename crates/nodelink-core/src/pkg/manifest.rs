//! Package.json reading and dependency rewriting.
//!
//! Reads the fields the installer needs (`name`, `version`, `scripts`,
//! `bin`, dependency maps) and rewrites dependency maps in place,
//! preserving every other field and the original key order.

use super::error::{codes, PkgError};
use super::identity::unscoped;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

/// Manifest file name.
pub const MANIFEST_NAME: &str = "package.json";

/// Dependency sections in ascending precedence order.
pub const DEPENDENCY_SECTIONS: [&str; 3] =
    ["optionalDependencies", "devDependencies", "dependencies"];

/// Fields of a package.json relevant to installation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub name: Option<String>,
    pub version: Option<String>,
    /// Script name -> command line.
    pub scripts: BTreeMap<String, String>,
    /// Executable name -> path relative to the package root.
    pub bin: BTreeMap<String, String>,
    pub dependencies: BTreeMap<String, String>,
    pub dev_dependencies: BTreeMap<String, String>,
    pub optional_dependencies: BTreeMap<String, String>,
    /// Problems found while extracting fields; never fatal.
    pub errors: Vec<ManifestFieldError>,
}

/// A malformed field encountered while reading a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestFieldError {
    /// Field or entry name.
    pub name: String,
    /// Error code.
    pub code: &'static str,
    /// Error message.
    pub message: String,
}

impl ManifestFieldError {
    fn new(name: impl Into<String>, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code,
            message: message.into(),
        }
    }

    fn invalid_value(name: &str, expected: &str, actual: &Value) -> Self {
        Self::new(
            name,
            codes::PKG_PACKAGE_JSON_INVALID,
            format!("expected {expected}, got {}", json_type_name(actual)),
        )
    }
}

impl Manifest {
    /// Read a manifest from disk.
    ///
    /// # Errors
    /// Returns `PkgError` if the file is missing or not a JSON object.
    pub fn read(path: &Path) -> Result<Self, PkgError> {
        let root = read_object(path)?;
        Ok(Self::from_object(&root))
    }

    /// Read the manifest at the root of a package directory.
    ///
    /// # Errors
    /// Returns `PkgError` if the file is missing or not a JSON object.
    pub fn read_dir(package_root: &Path) -> Result<Self, PkgError> {
        Self::read(&package_root.join(MANIFEST_NAME))
    }

    /// Parse a manifest from a JSON string.
    ///
    /// # Errors
    /// Returns `PkgError` if the string is not a JSON object.
    pub fn from_json_str(content: &str) -> Result<Self, PkgError> {
        let value: Value = serde_json::from_str(content)
            .map_err(|e| PkgError::package_json_invalid(format!("Invalid JSON: {e}")))?;
        let root = value
            .as_object()
            .ok_or_else(|| PkgError::package_json_invalid("package.json must be a JSON object"))?;
        Ok(Self::from_object(root))
    }

    fn from_object(root: &Map<String, Value>) -> Self {
        let mut manifest = Self {
            name: root.get("name").and_then(Value::as_str).map(String::from),
            version: root.get("version").and_then(Value::as_str).map(String::from),
            ..Self::default()
        };

        manifest.scripts = extract_string_map(root, "scripts", &mut manifest.errors);
        manifest.dependencies = extract_string_map(root, "dependencies", &mut manifest.errors);
        manifest.dev_dependencies =
            extract_string_map(root, "devDependencies", &mut manifest.errors);
        manifest.optional_dependencies =
            extract_string_map(root, "optionalDependencies", &mut manifest.errors);
        manifest.bin = extract_bin(root, manifest.name.as_deref(), &mut manifest.errors);

        manifest
    }

    /// Get a declared script, ignoring blank entries.
    #[must_use]
    pub fn script(&self, name: &str) -> Option<&str> {
        self.scripts
            .get(name)
            .map(String::as_str)
            .filter(|s| !s.trim().is_empty())
    }

    /// Whether `name` appears in any dependency section.
    #[must_use]
    pub fn declares(&self, name: &str) -> bool {
        self.dependencies.contains_key(name)
            || self.dev_dependencies.contains_key(name)
            || self.optional_dependencies.contains_key(name)
    }

    /// `name@version` for log and error messages.
    #[must_use]
    pub fn display_id(&self) -> String {
        match (&self.name, &self.version) {
            (Some(n), Some(v)) => format!("{n}@{v}"),
            (Some(n), None) => n.clone(),
            _ => "<unnamed>".to_string(),
        }
    }
}

/// Delete `names` from every dependency section of a manifest.
///
/// Sections are kept even when they become empty. The file is only
/// rewritten when something was actually removed, so repeating the call
/// is a no-op. Returns the names that were removed.
///
/// # Errors
/// Returns `PkgError` if the manifest cannot be read, parsed, or written.
pub fn remove_dependencies(path: &Path, names: &[String]) -> Result<Vec<String>, PkgError> {
    let mut root = read_object(path)?;
    let mut removed = Vec::new();

    for section in DEPENDENCY_SECTIONS {
        let Some(Value::Object(deps)) = root.get_mut(section) else {
            continue;
        };
        for name in names {
            if deps.remove(name).is_some() && !removed.contains(name) {
                removed.push(name.clone());
            }
        }
    }

    if !removed.is_empty() {
        write_object(path, root)?;
    }

    removed.sort();
    Ok(removed)
}

/// Record `deps` (name -> range) in the manifest.
///
/// A name already present in `devDependencies` or `optionalDependencies`
/// is updated there; anything else goes to `dependencies`. A missing
/// manifest is created. Returns whether the file changed.
///
/// # Errors
/// Returns `PkgError` if the manifest cannot be parsed or written.
pub fn save_dependencies(path: &Path, deps: &BTreeMap<String, String>) -> Result<bool, PkgError> {
    let mut root = match read_object(path) {
        Ok(root) => root,
        Err(e) if e.code() == codes::PKG_PACKAGE_JSON_NOT_FOUND => Map::new(),
        Err(e) => return Err(e),
    };
    let mut changed = false;

    for (name, range) in deps {
        let section = ["devDependencies", "optionalDependencies"]
            .into_iter()
            .find(|s| {
                root.get(*s)
                    .and_then(Value::as_object)
                    .is_some_and(|m| m.contains_key(name))
            })
            .unwrap_or("dependencies");

        let entry = root
            .entry(section)
            .or_insert_with(|| Value::Object(Map::new()));
        let Some(map) = entry.as_object_mut() else {
            return Err(PkgError::package_json_invalid(format!(
                "'{section}' must be an object, got {}",
                json_type_name(entry)
            )));
        };

        if map.get(name).and_then(Value::as_str) != Some(range.as_str()) {
            map.insert(name.clone(), Value::String(range.clone()));
            changed = true;
        }
    }

    if changed {
        write_object(path, root)?;
    }
    Ok(changed)
}

fn read_object(path: &Path) -> Result<Map<String, Value>, PkgError> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(PkgError::package_json_not_found(path));
        }
        Err(e) => {
            return Err(PkgError::package_json_invalid(format!(
                "Failed to read {}: {e}",
                path.display()
            )));
        }
    };

    match serde_json::from_str(&content) {
        Ok(Value::Object(root)) => Ok(root),
        Ok(_) => Err(PkgError::package_json_invalid(
            "package.json must be a JSON object",
        )),
        Err(e) => Err(PkgError::package_json_invalid(format!("Invalid JSON: {e}"))),
    }
}

fn write_object(path: &Path, root: Map<String, Value>) -> Result<(), PkgError> {
    let mut content = serde_json::to_string_pretty(&Value::Object(root))
        .map_err(|e| PkgError::package_json_invalid(format!("Failed to serialize: {e}")))?;
    content.push('\n');

    nodelink_util::fs::atomic_write(path, content.as_bytes()).map_err(|e| {
        PkgError::package_json_invalid(format!("Failed to write {}: {e}", path.display()))
    })
}

/// Extract a `{ string: string }` section, recording bad entries.
fn extract_string_map(
    root: &Map<String, Value>,
    section: &str,
    errors: &mut Vec<ManifestFieldError>,
) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();

    let Some(section_value) = root.get(section) else {
        return out;
    };

    let Some(section_obj) = section_value.as_object() else {
        errors.push(ManifestFieldError::invalid_value(
            section,
            "an object",
            section_value,
        ));
        return out;
    };

    for (name, value) in section_obj {
        if let Some(s) = value.as_str() {
            out.insert(name.clone(), s.to_string());
        } else {
            errors.push(ManifestFieldError::invalid_value(name, "string", value));
        }
    }

    out
}

/// Extract the `bin` field.
///
/// A string bin is named after the unscoped package name. Names that
/// could escape `.bin` are dropped.
fn extract_bin(
    root: &Map<String, Value>,
    pkg_name: Option<&str>,
    errors: &mut Vec<ManifestFieldError>,
) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();

    match root.get("bin") {
        None | Some(Value::Null) => {}
        Some(Value::String(path)) => {
            if let Some(name) = pkg_name {
                insert_bin(&mut out, unscoped(name), path, errors);
            } else {
                errors.push(ManifestFieldError::new(
                    "bin",
                    codes::PKG_PACKAGE_JSON_INVALID,
                    "string bin requires a package name",
                ));
            }
        }
        Some(Value::Object(map)) => {
            for (name, value) in map {
                match value.as_str() {
                    Some(path) => insert_bin(&mut out, unscoped(name), path, errors),
                    None => errors.push(ManifestFieldError::invalid_value(name, "string", value)),
                }
            }
        }
        Some(other) => errors.push(ManifestFieldError::invalid_value(
            "bin",
            "string or object",
            other,
        )),
    }

    out
}

fn insert_bin(
    out: &mut BTreeMap<String, String>,
    name: &str,
    path: &str,
    errors: &mut Vec<ManifestFieldError>,
) {
    let path = path.trim().trim_start_matches("./");
    let bad_name = name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\'])
        || name.chars().any(char::is_whitespace);
    let bad_path = path.is_empty()
        || Path::new(path).is_absolute()
        || path.split(['/', '\\']).any(|c| c == "..");

    if bad_name || bad_path {
        errors.push(ManifestFieldError::new(
            name,
            codes::PKG_PACKAGE_JSON_INVALID,
            format!("unsafe bin entry '{name}' -> '{path}'"),
        ));
        return;
    }

    out.insert(name.to_string(), path.to_string());
}

/// Get a human-readable type name for a JSON value.
fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
