//! SHA-256 content hashing for files, directory trees, and JSON values.

use std::fs;
use std::io::{self, Read};
use std::path::Path;

use serde_json::Value;
use sha2::{Digest, Sha256};

use super::json::to_canonical_string;

/// Hashes a byte slice, returning the lowercase hex digest.
#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hashes a JSON value by hashing its canonical string form.
#[must_use]
pub fn hash_value(value: &Value) -> String {
    hash_bytes(to_canonical_string(value).as_bytes())
}

/// Hashes a regular file by streaming its contents.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be read.
pub fn hash_file(path: impl AsRef<Path>) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hashes a directory tree.
///
/// The digest is SHA-256 over the literal prefix `"dir\n"` followed by, for
/// each contained file in lexicographic relative-path order, the line pair
/// `"<relpath>\n<hex-file-hash>\n"`. Relative paths use `/` separators so the
/// digest is identical across platforms.
///
/// # Errors
///
/// Returns an I/O error if the tree cannot be walked or a file read.
pub fn hash_dir(path: impl AsRef<Path>) -> io::Result<String> {
    let root = path.as_ref();
    let mut files = Vec::new();
    collect_files(root, root, &mut files)?;
    files.sort();

    let mut hasher = Sha256::new();
    hasher.update(b"dir\n");
    for rel in files {
        let file_hash = hash_file(root.join(&rel))?;
        hasher.update(rel.replace('\\', "/").as_bytes());
        hasher.update(b"\n");
        hasher.update(file_hash.as_bytes());
        hasher.update(b"\n");
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hashes a path, dispatching on its kind.
///
/// # Errors
///
/// Returns an I/O error if the path does not exist or cannot be read.
pub fn hash_path(path: impl AsRef<Path>) -> io::Result<String> {
    let path = path.as_ref();
    let meta = fs::metadata(path)?;
    if meta.is_dir() {
        hash_dir(path)
    } else {
        hash_file(path)
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(root, &path, out)?;
        } else {
            let rel = path
                .strip_prefix(root)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
                .to_string_lossy()
                .replace('\\', "/");
            out.push(rel);
        }
    }
    Ok(())
}
