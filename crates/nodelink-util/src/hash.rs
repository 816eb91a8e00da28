use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use walkdir::WalkDir;

/// Number of hex characters kept for a content key.
pub const CONTENT_KEY_LEN: usize = 16;

/// Compute the BLAKE3 hash of a byte slice, returning the hex-encoded digest.
#[must_use]
pub fn blake3_bytes(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Compute the BLAKE3 hash of a file, returning the hex-encoded digest.
///
/// Streams the file content to minimize memory usage.
///
/// # Errors
/// Returns an error if the file cannot be opened or read.
pub fn blake3_file(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = blake3::Hasher::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}

/// Digest of a directory tree: every regular file's relative path and
/// content, in a fixed order.
///
/// Symlinks are skipped, matching [`crate::fs::copy_dir_all`], so the
/// digest covers exactly what a copy of the tree would contain.
///
/// # Errors
/// Returns an error if `dir` is not a readable directory.
pub fn blake3_dir(dir: &Path) -> io::Result<String> {
    if !dir.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} is not a directory", dir.display()),
        ));
    }

    let mut hasher = blake3::Hasher::new();
    for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(dir).map_err(io::Error::other)?;
        // Separator-independent so the digest is the same on every platform
        let parts: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect();
        hasher.update(parts.join("/").as_bytes());
        hasher.update(b"\0");
        hasher.update(blake3_file(entry.path())?.as_bytes());
        hasher.update(b"\n");
    }

    Ok(hasher.finalize().to_hex().to_string())
}

/// Derive a short, filesystem-safe content key from a source locator.
///
/// The locator is whatever uniquely names a non-registry payload: a
/// tarball URL, a git URL plus commit, or a directory digest. Two
/// locators that differ in any byte produce different keys.
#[must_use]
pub fn content_key(locator: &str) -> String {
    let mut key = blake3_bytes(locator.trim().as_bytes());
    key.truncate(CONTENT_KEY_LEN);
    key
}
