// Channel descriptors - the typed connectors between nodes and workflows

//! Channels are the only way data moves through a workflow. Three transport
//! types exist: whole files, whole directories, and environment variables;
//! all transfer is fully materialized (no streaming).
//!
//! Three descriptor shapes share these types:
//!
//! - [`NodeChannel`]: a channel declared by a node definition, carrying the
//!   in-container target (`path_in_container` for mounts,
//!   `environment_var_in_container` for env values).
//! - [`ChannelDecl`]: a workflow-level channel (input/output/connect
//!   sections). Output and connect channels that materialize as directories
//!   additionally carry `storage`/`hash`/`user_path`.
//! - [`BindDecl`]: a workflow-level constant fixed at definition time, either
//!   a data referer or a literal environment-variable value.

use serde::{Deserialize, Serialize};

use super::Referer;

/// Transport type of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    File,
    Directory,
    EnvironmentVar,
}

impl ChannelType {
    /// File and directory channels materialize as mounts; environment
    /// variables do not.
    pub fn is_mountable(&self) -> bool {
        matches!(self, ChannelType::File | ChannelType::Directory)
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelType::File => write!(f, "file"),
            ChannelType::Directory => write!(f, "directory"),
            ChannelType::EnvironmentVar => write!(f, "environment_var"),
        }
    }
}

/// Where a data entry's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    /// Copied into the platform's content-addressed data directory.
    Platform,
    /// Referenced in place at a user-supplied path.
    Extern,
}

impl std::fmt::Display for StorageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageKind::Platform => write!(f, "platform"),
            StorageKind::Extern => write!(f, "extern"),
        }
    }
}

/// A channel as declared by a node definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeChannel {
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    pub format: String,

    /// Mount target inside the container; required for file/directory
    /// channels of image nodes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_in_container: Option<String>,

    /// Environment variable name inside the container; required for
    /// environment-variable channels, and for every channel of script nodes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment_var_in_container: Option<String>,
}

/// A workflow-level channel declaration (input/output/connect sections).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelDecl {
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    pub format: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageKind>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_path: Option<String>,
}

impl ChannelDecl {
    /// Storage mode with the platform default applied.
    pub fn storage_or_default(&self) -> StorageKind {
        self.storage.unwrap_or(StorageKind::Platform)
    }
}

/// A workflow-level constant supplied at definition time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BindDecl {
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    pub format: String,

    /// Data entry supplying a file/directory bind.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Referer>,

    /// Literal value supplying an environment-variable bind.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment_var_value: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_channel_type_wire_names() {
        assert_eq!(serde_json::to_value(ChannelType::File).unwrap(), "file");
        assert_eq!(
            serde_json::to_value(ChannelType::EnvironmentVar).unwrap(),
            "environment_var"
        );
    }

    #[test]
    fn test_node_channel_roundtrip() {
        let channel: NodeChannel = serde_json::from_value(json!({
            "type": "file",
            "format": "csv",
            "path_in_container": "/in"
        }))
        .unwrap();
        assert_eq!(channel.channel_type, ChannelType::File);
        assert_eq!(channel.path_in_container.as_deref(), Some("/in"));
        assert!(channel.environment_var_in_container.is_none());
    }

    #[test]
    fn test_channel_decl_storage_default() {
        let decl: ChannelDecl =
            serde_json::from_value(json!({ "type": "file", "format": "any" })).unwrap();
        assert_eq!(decl.storage_or_default(), StorageKind::Platform);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: Result<ChannelDecl, _> =
            serde_json::from_value(json!({ "type": "file", "format": "any", "typo": 1 }));
        assert!(result.is_err());
    }
}
