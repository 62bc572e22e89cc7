// Node definitions - the units of execution

//! A node is either an **image node** (a container image invoked with mounts
//! and environment variables) or a **script node** (a shell script stored as
//! a data entry, fed exclusively through environment variables). The node
//! registry pins image nodes to a digest at registration so later runs are
//! immune to tag drift, and records the script's data identifier for script
//! nodes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{NodeChannel, Referer};

/// Reference to a container image, by tag or by digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImageRef {
    NameVersion { name: String, version: String },
    Digest { hash: String },
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageRef::NameVersion { name, version } => write!(f, "{name}:{version}"),
            ImageRef::Digest { hash } => write!(f, "{hash}"),
        }
    }
}

/// The two node shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeKind {
    /// Container image node.
    Image { image: ImageRef },
    /// Shell script node; the script lives in the data table.
    /// Unavailable on Windows hosts.
    Script { bash: Referer },
}

/// A registered unit of execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDef {
    pub name: String,

    #[serde(flatten)]
    pub kind: NodeKind,

    /// Input channels by definition-local name.
    pub input: BTreeMap<String, NodeChannel>,

    /// Output channels by definition-local name. Must be disjoint from the
    /// input names.
    pub output: BTreeMap<String, NodeChannel>,

    /// Resolved image digest; set at registration for image nodes.
    #[serde(rename = "_image_id", skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,

    /// Identifier of the script data entry; set at registration for script
    /// nodes. The script's executable bit is set at registration (Unix only),
    /// which is a precondition for invoking the node.
    #[serde(rename = "_bash_id", skip_serializing_if = "Option::is_none")]
    pub bash_id: Option<String>,
}
