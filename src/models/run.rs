// Runs - executed workflow instances

//! A run is a deep copy of a workflow taken at the moment of execution,
//! enriched with the originating workflow's identifier, a human-readable log,
//! the success flag, and the bindings of every file/directory channel that
//! was materialized. Runs share the name/version scheme of every other table
//! and are never mutated after insertion.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{Referer, WorkflowDef};

/// Descriptor for starting a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunDef {
    /// Name of the run, chosen by the caller.
    pub name: String,
    /// The workflow to execute.
    pub workflow: Referer,
}

/// An executed (or cancelled) workflow instance.
///
/// The embedded workflow copy is immutable once the run record is created;
/// the executor only ever appends to `log` and fills in `success` and
/// `channel_bindings`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    #[serde(flatten)]
    pub workflow: WorkflowDef,

    /// Identifier of the originating workflow.
    #[serde(rename = "_hash_of_workflow")]
    pub hash_of_workflow: String,

    /// Human-readable execution log.
    #[serde(rename = "_log", default, skip_serializing_if = "Vec::is_empty")]
    pub log: Vec<String>,

    /// True when every node usage completed; false when the walk was
    /// cancelled.
    #[serde(rename = "_success", skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,

    /// Workflow channel name -> identifier of the data entry that
    /// materialized it (file/directory channels only).
    #[serde(
        rename = "_channel_bindings",
        skip_serializing_if = "Option::is_none"
    )]
    pub channel_bindings: Option<BTreeMap<String, String>>,
}

impl RunRecord {
    /// Instantiate a run from a stored workflow.
    pub fn instantiate(mut workflow: WorkflowDef, run_name: &str, hash_of_workflow: &str) -> Self {
        workflow.name = run_name.to_string();
        RunRecord {
            workflow,
            hash_of_workflow: hash_of_workflow.to_string(),
            log: Vec::new(),
            success: None,
            channel_bindings: None,
        }
    }

    /// Append a line to the run log and emit it as a tracing event.
    pub fn add_log<S: Into<String>>(&mut self, message: S) {
        let message = message.into();
        tracing::info!(run = %self.workflow.name, "{message}");
        self.log.push(message);
    }
}
