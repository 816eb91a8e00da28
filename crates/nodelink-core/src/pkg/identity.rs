//! Package identity.
//!
//! A `PackageIdentity` names one immutable package payload:
//! - `is-negative@2.1.0` for registry packages
//! - `@zkochan/logger@0.1.0` for scoped registry packages
//! - `is-array@1.0.1#a83102a9c117983e` for non-registry sources, where the
//!   suffix is the content key derived from the source locator

use super::error::PkgError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one immutable package payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageIdentity {
    /// Full package name (e.g., "@scope/name" or "name").
    pub name: String,
    /// Exact resolved version.
    pub version: String,
    /// Disambiguates non-registry sources sharing name and version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_key: Option<String>,
}

impl PackageIdentity {
    /// Create a registry identity.
    ///
    /// # Errors
    /// Returns an error if the name or version is not usable as a path component.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Result<Self, PkgError> {
        let identity = Self {
            name: name.into(),
            version: version.into(),
            content_key: None,
        };
        validate_name(&identity.name)?;
        validate_segment("version", &identity.version)?;
        Ok(identity)
    }

    /// Attach a content key (non-registry source).
    ///
    /// # Errors
    /// Returns an error if the key is not usable as a path component.
    pub fn with_content_key(mut self, key: impl Into<String>) -> Result<Self, PkgError> {
        let key = key.into();
        validate_segment("content key", &key)?;
        self.content_key = Some(key);
        Ok(self)
    }

    /// Build an identity from a name and a resolved reference
    /// (`version` or `version#content_key`).
    ///
    /// # Errors
    /// Returns an error if either half is invalid.
    pub fn from_reference(name: &str, reference: &str) -> Result<Self, PkgError> {
        match reference.split_once('#') {
            Some((version, key)) => Self::new(name, version)?.with_content_key(key),
            None => Self::new(name, reference),
        }
    }

    /// Parse a canonical key (`name@reference`).
    ///
    /// # Errors
    /// Returns an error if the key has no version part.
    pub fn parse_key(key: &str) -> Result<Self, PkgError> {
        let key = key.trim();
        // Skip the leading '@' of a scope when looking for the separator
        let search_from = usize::from(key.starts_with('@'));
        let Some(at_pos) = key[search_from..].find('@').map(|p| p + search_from) else {
            return Err(PkgError::args_invalid(format!(
                "Invalid package key: missing version in '{key}'"
            )));
        };
        Self::from_reference(&key[..at_pos], &key[at_pos + 1..])
    }

    /// The resolved reference: `version` or `version#content_key`.
    #[must_use]
    pub fn reference(&self) -> String {
        match &self.content_key {
            Some(key) => format!("{}#{key}", self.version),
            None => self.version.clone(),
        }
    }

    /// Canonical string key: `name@reference`.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}@{}", self.name, self.reference())
    }

    /// Directory name used for this payload's version slot in the store.
    #[must_use]
    pub fn store_dir_name(&self) -> String {
        match &self.content_key {
            Some(key) => format!("{}+{key}", self.version),
            None => self.version.clone(),
        }
    }

    /// Check if this is a scoped package.
    #[must_use]
    pub fn is_scoped(&self) -> bool {
        self.name.starts_with('@')
    }

    /// Get the unscoped portion of the name.
    ///
    /// For `@scope/name`, returns `name`.
    /// For `react`, returns `react`.
    #[must_use]
    pub fn unscoped_name(&self) -> &str {
        unscoped(&self.name)
    }

    /// URL-encode the package name for registry requests.
    #[must_use]
    pub fn url_encoded_name(&self) -> String {
        self.name.replace('/', "%2F")
    }
}

impl fmt::Display for PackageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.reference())
    }
}

/// Get the unscoped portion of a package name.
#[must_use]
pub fn unscoped(name: &str) -> &str {
    if name.starts_with('@') {
        name.split_once('/').map_or(name, |(_, rest)| rest)
    } else {
        name
    }
}

/// Validate a package name for use as a `node_modules` and store path.
///
/// # Errors
/// Returns an error if the name is empty, malformed, or could escape its directory.
pub fn validate_name(name: &str) -> Result<(), PkgError> {
    if name.is_empty() {
        return Err(PkgError::args_invalid("Empty package name"));
    }

    if let Some(scoped) = name.strip_prefix('@') {
        let Some((scope, pkg)) = scoped.split_once('/') else {
            return Err(PkgError::args_invalid(format!(
                "Invalid scoped package: missing '/' in '{name}'"
            )));
        };
        validate_name_part(name, scope)?;
        validate_name_part(name, pkg)
    } else {
        validate_name_part(name, name)
    }
}

fn validate_name_part(full: &str, part: &str) -> Result<(), PkgError> {
    if part.is_empty() || part.starts_with('.') {
        return Err(PkgError::args_invalid(format!(
            "Invalid package name '{full}'"
        )));
    }

    // Basic validation: no spaces, no special chars except - _ . ~
    for c in part.chars() {
        if !c.is_alphanumeric() && !matches!(c, '-' | '_' | '.' | '~') {
            return Err(PkgError::args_invalid(format!(
                "Invalid character '{c}' in package name '{full}'"
            )));
        }
    }

    Ok(())
}

fn validate_segment(what: &str, value: &str) -> Result<(), PkgError> {
    if value.is_empty()
        || value == "."
        || value == ".."
        || value.contains(['/', '\\', '#', '@'])
        || value.chars().any(char::is_whitespace)
    {
        return Err(PkgError::args_invalid(format!("Invalid {what}: '{value}'")));
    }
    Ok(())
}
