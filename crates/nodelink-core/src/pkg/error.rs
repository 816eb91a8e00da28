//! Package manager error types.

use std::fmt;
use std::io;

/// Package manager error codes.
pub mod codes {
    /// A source provider could not fetch or extract a package.
    pub const PKG_FETCH_FAILED: &str = "PKG_FETCH_FAILED";
    /// A lifecycle script or native rebuild exited unsuccessfully.
    pub const PKG_LIFECYCLE_SCRIPT_FAILED: &str = "PKG_LIFECYCLE_SCRIPT_FAILED";
    /// The graph does not contain what the caller expected.
    pub const PKG_GRAPH_INTEGRITY: &str = "PKG_GRAPH_INTEGRITY";
    pub const PKG_LINK_FAILED: &str = "PKG_LINK_FAILED";
    pub const NODE_MODULES_WRITE_FAILED: &str = "NODE_MODULES_WRITE_FAILED";
    pub const PKG_STORE_ERROR: &str = "PKG_STORE_ERROR";
    pub const PKG_PACKAGE_JSON_NOT_FOUND: &str = "PKG_PACKAGE_JSON_NOT_FOUND";
    pub const PKG_PACKAGE_JSON_INVALID: &str = "PKG_PACKAGE_JSON_INVALID";
    pub const PKG_ARGS_INVALID: &str = "PKG_ARGS_INVALID";
}

/// Package manager error.
#[derive(Debug)]
pub struct PkgError {
    code: &'static str,
    message: String,
}

impl PkgError {
    /// Create a new error with the given code and message.
    #[must_use]
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Get the error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// Get the error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Create a fetch failed error.
    pub fn fetch_failed(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_FETCH_FAILED, msg)
    }

    /// Create a lifecycle script failure naming the package and the script.
    #[must_use]
    pub fn lifecycle_failed(package: &str, script: &str, detail: &str) -> Self {
        Self::new(
            codes::PKG_LIFECYCLE_SCRIPT_FAILED,
            format!("{package}: `{script}` failed: {detail}"),
        )
    }

    /// Create a graph integrity error.
    pub fn graph_integrity(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_GRAPH_INTEGRITY, msg)
    }

    /// Create a graph integrity error for a name that is not an installed root.
    #[must_use]
    pub fn not_installed(name: &str) -> Self {
        Self::graph_integrity(format!("Package is not a dependency of this project: {name}"))
    }

    /// Create a link failed error.
    pub fn link_failed(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_LINK_FAILED, msg)
    }

    /// Create a `node_modules` write failed error.
    pub fn node_modules_write_failed(msg: impl Into<String>) -> Self {
        Self::new(codes::NODE_MODULES_WRITE_FAILED, msg)
    }

    /// Create a store error.
    pub fn store_error(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_STORE_ERROR, msg)
    }

    /// Create a package.json not found error.
    #[must_use]
    pub fn package_json_not_found(path: &std::path::Path) -> Self {
        Self::new(
            codes::PKG_PACKAGE_JSON_NOT_FOUND,
            format!("package.json not found: {}", path.display()),
        )
    }

    /// Create a package.json invalid error.
    pub fn package_json_invalid(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_PACKAGE_JSON_INVALID, msg)
    }

    /// Create an args invalid error.
    pub fn args_invalid(msg: impl Into<String>) -> Self {
        Self::new(codes::PKG_ARGS_INVALID, msg)
    }

    /// Whether this error came from a filesystem projection step.
    #[must_use]
    pub fn is_filesystem(&self) -> bool {
        matches!(
            self.code,
            codes::PKG_LINK_FAILED | codes::NODE_MODULES_WRITE_FAILED
        )
    }
}

impl fmt::Display for PkgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for PkgError {}

impl From<io::Error> for PkgError {
    fn from(e: io::Error) -> Self {
        Self::new(codes::PKG_STORE_ERROR, e.to_string())
    }
}

impl From<reqwest::Error> for PkgError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::fetch_failed(format!("Request timed out: {e}"))
        } else if e.is_connect() {
            Self::fetch_failed(format!("Connection failed: {e}"))
        } else {
            Self::fetch_failed(e.to_string())
        }
    }
}

impl From<super::lockfile::LockfileError> for PkgError {
    fn from(e: super::lockfile::LockfileError) -> Self {
        Self::new(e.code(), e.message().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_format() {
        let err = PkgError::fetch_failed("boom");
        assert_eq!(err.code(), codes::PKG_FETCH_FAILED);
        assert!(err.to_string().contains(codes::PKG_FETCH_FAILED));
    }

    #[test]
    fn test_lifecycle_failed_names_package_and_script() {
        let err = PkgError::lifecycle_failed("sharp@0.32.0", "install", "exit code 1");
        assert_eq!(err.code(), codes::PKG_LIFECYCLE_SCRIPT_FAILED);
        assert!(err.message().contains("sharp@0.32.0"));
        assert!(err.message().contains("`install`"));
    }

    #[test]
    fn test_filesystem_classification() {
        assert!(PkgError::link_failed("x").is_filesystem());
        assert!(PkgError::node_modules_write_failed("x").is_filesystem());
        assert!(!PkgError::store_error("x").is_filesystem());
    }

    #[test]
    fn test_error_codes_uppercase() {
        let all_codes = [
            codes::PKG_FETCH_FAILED,
            codes::PKG_LIFECYCLE_SCRIPT_FAILED,
            codes::PKG_GRAPH_INTEGRITY,
            codes::PKG_LINK_FAILED,
            codes::NODE_MODULES_WRITE_FAILED,
            codes::PKG_STORE_ERROR,
            codes::PKG_PACKAGE_JSON_NOT_FOUND,
            codes::PKG_PACKAGE_JSON_INVALID,
            codes::PKG_ARGS_INVALID,
        ];

        for code in all_codes {
            assert!(
                code.chars().all(|c| c.is_uppercase() || c == '_'),
                "Error code '{code}' should be SCREAMING_SNAKE_CASE"
            );
        }
    }
}
