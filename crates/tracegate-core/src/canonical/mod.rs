//! Canonical JSON serialization and content hashing.
//!
//! Everything that is content-addressed in a trace bundle flows through this
//! module. Two rules define cross-implementation equivalence:
//!
//! - **Canonical JSON**: object keys are sorted lexicographically at every
//!   depth, arrays preserve order, no inter-token whitespace, minimal string
//!   escaping.
//! - **Content hashes**: a regular file hashes to the SHA-256 of its bytes; a
//!   directory hashes to SHA-256 over the literal prefix `"dir\n"` followed by
//!   `"<relpath>\n<hex-file-hash>\n"` for each contained file in lexicographic
//!   relative-path order.

mod hash;
mod json;

pub use hash::{hash_bytes, hash_dir, hash_file, hash_path, hash_value};
pub use json::to_canonical_string;
