//! Gzip-compressed tar packing and unpacking for bundle blobs.

use std::fs;
use std::io::Cursor;
use std::path::Path;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use super::BundleError;

/// Packs a bundle directory into a `.tgz` byte vector.
///
/// Entries are added with paths relative to `dir`.
///
/// # Errors
///
/// Returns [`BundleError::Io`] on read failure.
pub fn pack(dir: impl AsRef<Path>) -> Result<Vec<u8>, BundleError> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(".", dir.as_ref())?;
    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

/// Unpacks `.tgz` bytes into `dest`, creating it if needed.
///
/// The tar reader refuses entries that would escape `dest` (absolute paths
/// or `..` traversal), so a hostile archive cannot write outside the
/// extraction root.
///
/// # Errors
///
/// Returns [`BundleError::Io`] on malformed archives or write failure.
pub fn unpack(bytes: &[u8], dest: impl AsRef<Path>) -> Result<(), BundleError> {
    let dest = dest.as_ref();
    fs::create_dir_all(dest)?;
    let decoder = GzDecoder::new(Cursor::new(bytes));
    let mut archive = tar::Archive::new(decoder);
    archive.unpack(dest)?;
    Ok(())
}

/// True when `bytes` start with the gzip magic.
#[must_use]
pub fn looks_like_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}
