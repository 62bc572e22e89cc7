// Data entries - files and directories known to the platform

//! A data entry describes a file or directory the platform can mount into
//! containers or hand to script nodes. The descriptor part (name, type,
//! storage, hash flag, format, user path) comes from the client; the derived
//! attributes (`_path`, `_hash_of_content`) are computed at registration.
//!
//! Invariants enforced by the data registry:
//! - directories may be neither platform-stored nor content-hashed;
//! - with `hash = true` the content hash is recorded, and platform storage
//!   copies the file under a filename equal to that hash (physical dedup);
//! - with `hash = false` a random stand-in hash keeps re-registrations
//!   distinct.

use serde::{Deserialize, Serialize};

/// Whether a data entry is a file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    File,
    Directory,
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataType::File => write!(f, "file"),
            DataType::Directory => write!(f, "directory"),
        }
    }
}

/// A registered file or directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataEntry {
    pub name: String,

    #[serde(rename = "type")]
    pub data_type: DataType,

    pub storage: super::StorageKind,

    /// Whether the content hash was computed and recorded.
    pub hash: bool,

    /// Free-form format tag ("csv", "json", "any", ...).
    pub format: String,

    /// The path as supplied by the client.
    pub user_path: String,

    /// Internal path: the content hash for platform storage, the absolute
    /// user path for extern storage. Set at registration.
    #[serde(rename = "_path", skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Git-blob SHA-1 of the file content; only recorded when `hash` is true.
    #[serde(rename = "_hash_of_content", skip_serializing_if = "Option::is_none")]
    pub hash_of_content: Option<String>,
}

/// The client-facing registration descriptor (derived attributes absent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataDef {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    pub storage: super::StorageKind,
    pub hash: bool,
    pub format: String,
    pub user_path: String,
}

impl DataDef {
    /// Promote the descriptor to an entry with the derived attributes still
    /// unset; the data registry fills them in.
    pub fn into_entry(self) -> DataEntry {
        DataEntry {
            name: self.name,
            data_type: self.data_type,
            storage: self.storage,
            hash: self.hash,
            format: self.format,
            user_path: self.user_path,
            path: None,
            hash_of_content: None,
        }
    }
}
