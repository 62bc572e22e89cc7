// Workflow definitions - named graphs of node usages over typed channels

//! A workflow declares four channel sections at its boundary:
//!
//! - **input**: supplied externally for every run
//! - **output**: produced by the run
//! - **bind**: constants fixed at workflow-definition time
//! - **connect**: internal wires between node usages
//!
//! The channel-name spaces of the four sections are pairwise disjoint. Each
//! node usage references a node definition or a sub-workflow and maps the
//! referenced definition's channel names onto workflow-level channel names.
//! Validation and the derived topological order live in
//! [`crate::engine::workflow`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{BindDecl, ChannelDecl, Referer};

/// An occurrence of a node or sub-workflow inside a workflow.
///
/// Exactly one of `node` / `workflow` is set. The renaming maps go from the
/// referenced definition's channel names to this workflow's channel names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeUsage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<Referer>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow: Option<Referer>,

    #[serde(default)]
    pub input: BTreeMap<String, String>,

    #[serde(default)]
    pub output: BTreeMap<String, String>,

    /// Identifier of the referenced node definition; derived at registration.
    #[serde(rename = "_hash_of_node_def", skip_serializing_if = "Option::is_none")]
    pub hash_of_node_def: Option<String>,

    /// Identifier of the referenced sub-workflow; derived at registration.
    #[serde(
        rename = "_hash_of_workflow_def",
        skip_serializing_if = "Option::is_none"
    )]
    pub hash_of_workflow_def: Option<String>,
}

impl NodeUsage {
    /// Drop the derived definition pointers (used by refinement before
    /// re-validation).
    pub fn strip_derived(&mut self) {
        self.hash_of_node_def = None;
        self.hash_of_workflow_def = None;
    }
}

/// A named workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDef {
    pub name: String,

    #[serde(default)]
    pub input: BTreeMap<String, ChannelDecl>,

    #[serde(default)]
    pub output: BTreeMap<String, ChannelDecl>,

    #[serde(default)]
    pub bind: BTreeMap<String, BindDecl>,

    #[serde(default)]
    pub connect: BTreeMap<String, ChannelDecl>,

    /// Node usages by usage name.
    pub nodes: BTreeMap<String, NodeUsage>,

    /// Optional explicit ordering constraints: each entry `[a, b, c, ...]`
    /// adds edges a->b, a->c, ... on top of the data dependencies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<Vec<Vec<String>>>,

    /// Execution plan derived at registration: node-usage names, producers
    /// before consumers.
    #[serde(
        rename = "_topological_order",
        skip_serializing_if = "Option::is_none"
    )]
    pub topological_order: Option<Vec<String>>,
}

impl WorkflowDef {
    /// Drop every derived attribute, returning the workflow to its
    /// pre-validation descriptor form.
    pub fn strip_derived(&mut self) {
        self.topological_order = None;
        for usage in self.nodes.values_mut() {
            usage.strip_derived();
        }
    }
}

/// Descriptor for `refine`: structural substitution on an existing workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RefineDef {
    /// Name of the refined (new) workflow.
    pub name: String,

    /// The workflow to refine.
    pub workflow: Referer,

    /// Per usage name: replace the definition pointer with this node
    /// definition. The replacement's channel-name sets must equal the
    /// original's exactly.
    #[serde(default)]
    pub replace_by_node: BTreeMap<String, Referer>,

    /// Per usage name: replace with a sub-workflow definition.
    #[serde(default)]
    pub replace_by_workflow: BTreeMap<String, Referer>,

    /// Per bind channel: replace the descriptor. Type and format must match.
    #[serde(default)]
    pub replace_bind: BTreeMap<String, BindDecl>,
}
