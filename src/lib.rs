// FlowForge - a lightweight workflow execution platform
// Nodes (container images or shell scripts) are wired into workflows over
// named typed channels; runs interpret the workflow in topological order.

//! # FlowForge Library
//!
//! This is the library root for FlowForge. It wires together the three layers
//! of the platform:
//!
//! - **Domain models** ([`models`]): users, data entries, node definitions,
//!   workflow definitions, runs, and the referers used to look them up. All
//!   descriptors are typed serde structures; untyped maps never cross the API
//!   boundary.
//! - **Entity store** ([`store`]): Git-blob SHA-1 content addressing, the five
//!   in-memory tables with JSON persistence, the unique-prefix cache, and
//!   temp-dir bookkeeping.
//! - **Engine** ([`engine`]): the registries (user/data/node/workflow), the
//!   recursive run executor, the container-runtime seam, and the read-side
//!   view/query projections.
//!
//! The HTTP layer ([`server`]) is a thin axum dispatch over the engine: it
//! checks the authentication token, hands the `param` object to the engine,
//! and folds any [`FlowError`] into the response envelope.
//!
//! Every entity is content-addressed: its identifier is the hex SHA-1 of its
//! canonical JSON serialization wrapped in a Git-style `blob <len>\0` header.
//! Identifiers are stable and deduplicating - registering the same descriptor
//! twice yields the same identifier.

pub mod config;
pub mod engine;
pub mod models;
pub mod server;
pub mod store;

// Re-export the most commonly used types for a flat API.
pub use engine::runtime::{DockerRuntime, NodeRuntime, RunOutput};
pub use models::{
    BindDecl, ChannelDecl, ChannelType, DataEntry, DataType, ImageRef, NodeChannel, NodeDef,
    NodeUsage, Referer, RunRecord, StorageKind, Stored, User, VersionSelector, WorkflowDef,
};
pub use store::{EntityStore, StoreContext, TableKind};

use serde_json::json;
use thiserror::Error;

/// Error category reported to clients.
///
/// User errors result from invalid input, missing entities, unauthenticated
/// access, duplicate names, or invalid graphs. System errors indicate bugs or
/// environmental failures (container runtime unavailable, impossible internal
/// states) and carry a "contact the developer" hint in the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    UserError,
    SystemError,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::UserError => write!(f, "USER_ERROR"),
            ErrorCategory::SystemError => write!(f, "SYSTEM_ERROR"),
        }
    }
}

/// Tagged errors raised by the registries and the executor.
///
/// Every variant maps to a stable `msg` discriminator plus named parameters;
/// [`FlowError::report`] renders the `{category, msg, ...}` record for the
/// HTTP envelope and the CLI print. The discriminators are part of the wire
/// contract and must not change.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FlowError {
    /// An entity lookup failed (any table, files, images).
    #[error("{kind} not found: {name}")]
    NotFound { kind: String, name: String },

    /// An identifier prefix matched zero or several entities.
    #[error("hash prefix does not identify a unique entity: {prefix}")]
    InvalidHash { prefix: String },

    /// The authentication token is not a known user identifier.
    #[error("no user logged in")]
    NoUserLoggedIn,

    /// Only superusers may create users.
    #[error("operation requires superuser rights")]
    MustBeSuperuser,

    /// A user with this login name already exists.
    #[error("user already exists: {name}")]
    UserAlreadyExists { name: String },

    /// A channel name occurs in more than one workflow section.
    #[error("duplicate channel name: {name}")]
    DuplicateChannel { name: String },

    /// A descriptor did not deserialize against its named shape.
    #[error("validation of {definition_of} failed: {error}")]
    Validation { definition_of: String, error: String },

    /// The workflow graph is malformed (cycle, channel written twice, ...).
    #[error("invalid workflow: {reason}")]
    InvalidWorkflow { reason: String },

    /// A workflow-level channel is never referenced by any node usage.
    #[error("workflow channel unused: {channel_name}")]
    WorkflowChannelUnused { channel_name: String },

    /// A node usage references channels its definition does not declare.
    #[error("{node_type} usage does not match definition: {referer_name}")]
    UsageMismatch {
        node_type: String,
        referer_name: String,
    },

    /// A renaming target is not declared in any permissible workflow section.
    #[error("{node_type} {referer_name}: channel {channel_name} missing in workflow channels")]
    ChannelMissing {
        node_type: String,
        referer_name: String,
        channel_name: String,
    },

    /// An output/connect channel declaration is incomplete or over-specified.
    #[error("invalid channel definition")]
    InvalidChannelDef,

    /// A refinement replacement does not preserve the original shape.
    #[error("refinement does not match the refined workflow")]
    RefineMismatch,

    /// Directories may not be platform-stored or content-hashed.
    #[error("directory restriction violated: {path}")]
    DirectoryRestriction { path: String },

    /// A container image could not be resolved to a digest.
    #[error("image problem: {image_name}")]
    ImageProblem { image_name: String },

    /// An extern file no longer matches its recorded content hash.
    #[error("content hash mismatch: {path}")]
    HashMismatch { path: String },

    /// A stored path does not point at a readable file.
    #[error("no file or not found: {name}")]
    NoFileOrNotFound { name: String },

    /// The client sent a command the platform does not understand.
    #[error("invalid command")]
    InvalidCommand,

    /// Bugs, environmental failures, impossible internal states.
    #[error("system error: {details}")]
    System { details: String },
}

impl FlowError {
    /// Shorthand for the catch-all system error.
    pub fn system<S: Into<String>>(details: S) -> Self {
        FlowError::System {
            details: details.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            FlowError::System { .. } => ErrorCategory::SystemError,
            _ => ErrorCategory::UserError,
        }
    }

    /// Stable wire discriminator for this error.
    pub fn msg_key(&self) -> &'static str {
        match self {
            FlowError::NotFound { .. } => "NOT_FOUND",
            FlowError::InvalidHash { .. } => "INVALID_HASH",
            FlowError::NoUserLoggedIn => "NO_USER_LOGGED_IN",
            FlowError::MustBeSuperuser => "MUST_BE_SUPERUSER",
            FlowError::UserAlreadyExists { .. } => "USER_ALREADY_EXISTS",
            FlowError::DuplicateChannel { .. } => "DUPLICATE_CHANNEL",
            FlowError::Validation { .. } => "VALIDATION_ERROR",
            FlowError::InvalidWorkflow { .. } => "INVALID_WORKFLOW",
            FlowError::WorkflowChannelUnused { .. } => "WORKFLOW_CHANNEL_UNUSED",
            FlowError::UsageMismatch { .. } => "NODE_DEF_AND_USE_MISMATCH",
            FlowError::ChannelMissing { .. } => "NODE_CHANNEL_MISSING_IN_WF_CHANNELS",
            FlowError::InvalidChannelDef => "INVALID_CHANNEL_DEF",
            FlowError::RefineMismatch => "REFINE_MISMATCH",
            FlowError::DirectoryRestriction { .. } => "DIRECTORY_RESTRICTION",
            FlowError::ImageProblem { .. } => "IMAGE_PROBLEM",
            FlowError::HashMismatch { .. } => "HASH_MISMATCH",
            FlowError::NoFileOrNotFound { .. } => "NO_FILE_OR_NOT_FOUND",
            FlowError::InvalidCommand => "INVALID_COMMAND",
            FlowError::System { .. } => "SYSTEM_ERROR",
        }
    }

    /// Render the tagged error record for the response envelope:
    /// `{category, msg, ...named parameters}`.
    pub fn report(&self) -> serde_json::Value {
        let mut report = match self {
            FlowError::NotFound { kind, name } => json!({ "kind": kind, "name": name }),
            FlowError::InvalidHash { prefix } => json!({ "prefix": prefix }),
            FlowError::UserAlreadyExists { name } => json!({ "name": name }),
            FlowError::DuplicateChannel { name } => json!({ "name": name }),
            FlowError::Validation {
                definition_of,
                error,
            } => json!({ "definition_of": definition_of, "error": error }),
            FlowError::InvalidWorkflow { reason } => json!({ "reason": reason }),
            FlowError::WorkflowChannelUnused { channel_name } => {
                json!({ "channel_name": channel_name })
            }
            FlowError::UsageMismatch {
                node_type,
                referer_name,
            } => json!({ "node_type": node_type, "referer_name": referer_name }),
            FlowError::ChannelMissing {
                node_type,
                referer_name,
                channel_name,
            } => json!({
                "node_type": node_type,
                "referer_name": referer_name,
                "channel_name": channel_name
            }),
            FlowError::DirectoryRestriction { path } => json!({ "path": path }),
            FlowError::ImageProblem { image_name } => json!({ "image_name": image_name }),
            FlowError::HashMismatch { path } => json!({ "path": path }),
            FlowError::NoFileOrNotFound { name } => json!({ "name": name }),
            FlowError::System { details } => {
                json!({ "details": details, "hint": "please contact the developer" })
            }
            _ => json!({}),
        };
        let map = report.as_object_mut().expect("report is always an object");
        map.insert("category".into(), json!(self.category().to_string()));
        map.insert("msg".into(), json!(self.msg_key()));
        report
    }
}

impl From<std::io::Error> for FlowError {
    fn from(err: std::io::Error) -> Self {
        FlowError::System {
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        FlowError::System {
            details: err.to_string(),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FlowError>;
