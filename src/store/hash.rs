// Content addressing - Git-blob style SHA-1 identifiers

//! Every identifier in the platform is the hex SHA-1 of
//! `"blob " + decimal(len) + "\0" + content`, exactly the scheme Git uses for
//! blobs. Entities are hashed over their canonical JSON serialization (keys
//! sorted, 4-space indent), so the identifier is deterministic and two
//! entities with identical canonical content collapse onto one identifier.

use std::path::Path;

use rand::RngCore;
use serde::Serialize;
use sha1::{Digest, Sha1};

use crate::{FlowError, Result};

/// Canonical JSON bytes: keys sorted, 4-space indent.
///
/// `serde_json::Value` objects keep their keys in a sorted map, so routing
/// every entity through a `Value` before serialization yields a stable byte
/// sequence regardless of struct field order.
pub fn canonical_json_bytes(value: &serde_json::Value) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut serializer)?;
    Ok(buf)
}

/// Git-blob SHA-1 of a byte sequence.
pub fn blob_hash_of_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("blob {}\0", bytes.len()).as_bytes());
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Git-blob SHA-1 of a file's content.
pub fn blob_hash_of_file(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).map_err(|_| FlowError::NotFound {
        kind: "file".to_string(),
        name: path.display().to_string(),
    })?;
    Ok(blob_hash_of_bytes(&bytes))
}

/// Git-blob SHA-1 of an entity's canonical JSON serialization.
pub fn blob_hash_of_json<T: Serialize>(entity: &T) -> Result<String> {
    let value = serde_json::to_value(entity)?;
    Ok(blob_hash_of_bytes(&canonical_json_bytes(&value)?))
}

/// A random 40-hex stand-in hash. Used where a content hash is required but
/// deliberately not computed, so re-registrations stay distinct.
pub fn random_sha1() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Smallest prefix length (in hex digits) that identifies every hash in the
/// set uniquely. Returns 40 if full hashes are needed.
pub fn min_unique_prefix_length<'a, I>(hashes: I) -> usize
where
    I: IntoIterator<Item = &'a str> + Clone,
{
    let total = hashes.clone().into_iter().count();
    for length in 1..=40 {
        let prefixes: std::collections::HashSet<&str> = hashes
            .clone()
            .into_iter()
            .map(|h| &h[..length.min(h.len())])
            .collect();
        if prefixes.len() == total {
            return length;
        }
    }
    40
}
