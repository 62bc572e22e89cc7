// Domain models for FlowForge
// Typed entity structures shared by the store, the engine and the server.

//! # Domain Models Module
//!
//! Everything the platform stores or accepts over the wire is a typed serde
//! structure defined here:
//!
//! - [`User`]: login name, display name, superuser flag
//! - [`DataEntry`]: a file or directory known to the platform
//! - [`NodeDef`]: a unit of execution (container image or shell script)
//! - [`WorkflowDef`]: a named graph of node usages over typed channels
//! - [`RunRecord`]: a workflow copy enriched with execution results
//! - [`Referer`]: `{name, version}` or identifier-prefix lookups
//!
//! Descriptors arriving from clients are deserialized with
//! [`parse_descriptor`], which reports serde rejections as the
//! `VALIDATION_ERROR` user error naming the descriptor kind. Tagged variants
//! (image vs script nodes, file vs directory vs environment-variable
//! channels) enforce the shape invariants at the type level.

pub mod channel;
pub mod data;
pub mod node;
pub mod referer;
pub mod run;
pub mod user;
pub mod workflow;

pub use channel::{BindDecl, ChannelDecl, ChannelType, NodeChannel, StorageKind};
pub use data::{DataDef, DataEntry, DataType};
pub use node::{ImageRef, NodeDef, NodeKind};
pub use referer::{Referer, VersionSelector};
pub use run::{RunDef, RunRecord};
pub use user::User;
pub use workflow::{NodeUsage, RefineDef, WorkflowDef};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{FlowError, Result};

/// A table entry: the entity itself plus the bookkeeping attributes stamped
/// at insertion time.
///
/// The three metadata attributes participate in the canonical serialization,
/// so they are part of the content the entity identifier is computed over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stored<T> {
    #[serde(flatten)]
    pub entity: T,

    /// Monotonic version per name within the owning table; first version is 1.
    #[serde(rename = "_version")]
    pub version: u32,

    /// Creation timestamp, `%Y-%m-%d %H:%M:%S%.6f`.
    #[serde(rename = "_date")]
    pub date: String,

    /// Identifier of the creating user.
    #[serde(rename = "_hash_of_creating_user")]
    pub hash_of_creating_user: String,
}

/// Deserialize a client-supplied `param` object against a named descriptor
/// shape. A serde rejection becomes the VALIDATION_ERROR user error.
pub fn parse_descriptor<T: DeserializeOwned>(
    param: serde_json::Value,
    definition_of: &str,
) -> Result<T> {
    serde_json::from_value(param).map_err(|e| FlowError::Validation {
        definition_of: definition_of.to_string(),
        error: e.to_string(),
    })
}
