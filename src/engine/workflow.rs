// Workflow registry - validation, topological ordering, refinement

//! Workflow validation runs in a fixed order; the first failure aborts with a
//! user error:
//!
//! 1. descriptor shape (serde)
//! 2. pairwise disjointness of the input/output/bind/connect name spaces
//! 3. per node-usage: resolve the referenced definition, check the renaming
//!    map only names channels the definition declares, check every renaming
//!    target is declared in a permissible workflow section (inputs read from
//!    input/bind/connect, outputs write to output/connect)
//! 4. every workflow-level channel is referenced by some usage
//! 5. output/connect declarations are complete (directories carry
//!    storage/hash/user_path, files must not)
//! 6. channel summary: exactly zero or one writer per channel, read-only
//!    channels are declared inputs, unread channels are declared outputs
//! 7. topological sort over producer->consumer edges plus explicit
//!    `sequence` edges; cycles are rejected
//!
//! Refinement deep-copies an existing workflow, strips the derived
//! attributes, applies the substitution maps, and re-runs the whole
//! validation.

use std::collections::{BTreeMap, BTreeSet};

use tracing::error;

use crate::models::{
    parse_descriptor, ChannelDecl, ChannelType, NodeUsage, RefineDef, Referer, WorkflowDef,
};
use crate::store::{EntityStore, TableKind};
use crate::{FlowError, Result};

/// Register a workflow from a client descriptor.
pub fn add_workflow(
    store: &EntityStore,
    param: serde_json::Value,
    logged_in_user: &str,
) -> Result<String> {
    let workflow: WorkflowDef = parse_descriptor(param, "workflow_def")?;
    register_workflow(store, workflow, logged_in_user)
}

/// Validate and store an already-typed workflow (also the tail end of
/// refinement).
pub fn register_workflow(
    store: &EntityStore,
    mut workflow: WorkflowDef,
    logged_in_user: &str,
) -> Result<String> {
    // derived attributes are recomputed here, never trusted from the caller
    workflow.strip_derived();

    assert_sections_disjoint(&workflow)?;

    for usage in workflow.nodes.values_mut() {
        resolve_and_check_usage(store, &workflow.input, &workflow.bind, &workflow.connect, &workflow.output, usage)?;
    }

    assert_all_channels_used(&workflow)?;
    assert_full_channel_defs(workflow.output.values())?;
    assert_full_channel_defs(workflow.connect.values())?;

    let connections = validate_graph(&workflow)?;
    let order = topological_order(&workflow, &connections)?;
    workflow.topological_order = Some(if order.is_empty() {
        if workflow.nodes.len() != 1 {
            return Err(FlowError::system(
                "inconsistency in topological sorting",
            ));
        }
        workflow.nodes.keys().cloned().collect()
    } else {
        order
    });

    warn_unbound_channels(store, &workflow);

    store.insert_workflow(workflow, logged_in_user)
}

/// Refine a workflow: structural substitution of node usages and bind
/// channels, then full re-validation. The refined workflow is stored as a new
/// entity; the original is untouched.
pub fn refine_workflow(
    store: &EntityStore,
    param: serde_json::Value,
    logged_in_user: &str,
) -> Result<String> {
    let refinement: RefineDef = parse_descriptor(param, "refine_def")?;
    let hash_of_workflow = store.resolve(TableKind::Workflow, &refinement.workflow)?;
    let mut workflow = store.get_workflow(&hash_of_workflow)?.entity;
    workflow.name = refinement.name.clone();
    workflow.strip_derived();

    for (usage_name, replacement) in &refinement.replace_by_node {
        let node_hash = store.resolve(TableKind::Node, replacement)?;
        let replacing = store.get_node(&node_hash)?.entity;
        apply_replacement(
            &mut workflow,
            usage_name,
            replacement,
            replacing.input.keys().cloned().collect(),
            replacing.output.keys().cloned().collect(),
            true,
        )?;
    }
    for (usage_name, replacement) in &refinement.replace_by_workflow {
        let workflow_hash = store.resolve(TableKind::Workflow, replacement)?;
        let replacing = store.get_workflow(&workflow_hash)?.entity;
        apply_replacement(
            &mut workflow,
            usage_name,
            replacement,
            replacing.input.keys().cloned().collect(),
            replacing.output.keys().cloned().collect(),
            false,
        )?;
    }
    for (channel_name, replacement) in &refinement.replace_bind {
        let current = workflow
            .bind
            .get(channel_name)
            .ok_or(FlowError::RefineMismatch)?;
        if current.channel_type != replacement.channel_type
            || current.format != replacement.format
        {
            return Err(FlowError::RefineMismatch);
        }
        workflow
            .bind
            .insert(channel_name.clone(), replacement.clone());
    }

    register_workflow(store, workflow, logged_in_user)
}

/// Swap a usage's definition pointer. The replacement's channel-name sets
/// must equal the usage's renaming key-sets exactly.
fn apply_replacement(
    workflow: &mut WorkflowDef,
    usage_name: &str,
    replacement: &Referer,
    replacing_inputs: BTreeSet<String>,
    replacing_outputs: BTreeSet<String>,
    as_node: bool,
) -> Result<()> {
    let usage = workflow
        .nodes
        .get_mut(usage_name)
        .ok_or(FlowError::RefineMismatch)?;
    let usage_inputs: BTreeSet<String> = usage.input.keys().cloned().collect();
    let usage_outputs: BTreeSet<String> = usage.output.keys().cloned().collect();
    if replacing_inputs != usage_inputs || replacing_outputs != usage_outputs {
        return Err(FlowError::RefineMismatch);
    }
    if as_node {
        usage.node = Some(replacement.clone());
        usage.workflow = None;
    } else {
        usage.workflow = Some(replacement.clone());
        usage.node = None;
    }
    Ok(())
}

/// The four channel-name spaces must be pairwise disjoint.
fn assert_sections_disjoint(workflow: &WorkflowDef) -> Result<()> {
    let mut seen: BTreeSet<&String> = BTreeSet::new();
    let sections = workflow
        .input
        .keys()
        .chain(workflow.output.keys())
        .chain(workflow.bind.keys())
        .chain(workflow.connect.keys());
    for name in sections {
        if !seen.insert(name) {
            return Err(FlowError::DuplicateChannel { name: name.clone() });
        }
    }
    Ok(())
}

/// Resolve a usage's definition, record its identifier, and check the
/// renaming maps against the definition and the workflow sections.
fn resolve_and_check_usage(
    store: &EntityStore,
    input: &BTreeMap<String, ChannelDecl>,
    bind: &BTreeMap<String, crate::models::BindDecl>,
    connect: &BTreeMap<String, ChannelDecl>,
    output: &BTreeMap<String, ChannelDecl>,
    usage: &mut NodeUsage,
) -> Result<()> {
    let (node_type, referer, def_inputs, def_outputs) = match (&usage.node, &usage.workflow) {
        (Some(node_referer), None) => {
            let hash = store.resolve(TableKind::Node, node_referer)?;
            let def = store.get_node(&hash)?.entity;
            usage.hash_of_node_def = Some(hash);
            (
                "node",
                node_referer.clone(),
                def.input.keys().cloned().collect::<BTreeSet<_>>(),
                def.output.keys().cloned().collect::<BTreeSet<_>>(),
            )
        }
        (None, Some(workflow_referer)) => {
            let hash = store.resolve(TableKind::Workflow, workflow_referer)?;
            let def = store.get_workflow(&hash)?.entity;
            usage.hash_of_workflow_def = Some(hash);
            (
                "sub workflow",
                workflow_referer.clone(),
                def.input.keys().cloned().collect::<BTreeSet<_>>(),
                def.output.keys().cloned().collect::<BTreeSet<_>>(),
            )
        }
        _ => {
            return Err(FlowError::InvalidWorkflow {
                reason: "node usage must reference exactly one node or workflow".to_string(),
            })
        }
    };

    // usage may not reference channels the definition does not declare
    let inputs_known = usage.input.keys().all(|k| def_inputs.contains(k));
    let outputs_known = usage.output.keys().all(|k| def_outputs.contains(k));
    if !inputs_known || !outputs_known {
        return Err(FlowError::UsageMismatch {
            node_type: node_type.to_string(),
            referer_name: referer.to_string(),
        });
    }

    // inputs read from input/bind/connect, outputs write to output/connect
    for target in usage.input.values() {
        if !input.contains_key(target) && !bind.contains_key(target) && !connect.contains_key(target)
        {
            return Err(FlowError::ChannelMissing {
                node_type: node_type.to_string(),
                referer_name: referer.to_string(),
                channel_name: target.clone(),
            });
        }
    }
    for target in usage.output.values() {
        if !output.contains_key(target) && !connect.contains_key(target) {
            return Err(FlowError::ChannelMissing {
                node_type: node_type.to_string(),
                referer_name: referer.to_string(),
                channel_name: target.clone(),
            });
        }
    }
    Ok(())
}

/// Every workflow-level channel must appear as a renaming target somewhere.
fn assert_all_channels_used(workflow: &WorkflowDef) -> Result<()> {
    let renamings: BTreeSet<&String> = workflow
        .nodes
        .values()
        .flat_map(|usage| usage.input.values().chain(usage.output.values()))
        .collect();
    let declared = workflow
        .input
        .keys()
        .chain(workflow.output.keys())
        .chain(workflow.bind.keys())
        .chain(workflow.connect.keys());
    for channel_name in declared {
        if !renamings.contains(channel_name) {
            return Err(FlowError::WorkflowChannelUnused {
                channel_name: channel_name.clone(),
            });
        }
    }
    Ok(())
}

/// Output/connect declarations that materialize as directories need
/// storage/hash/user_path; file declarations must not carry them.
fn assert_full_channel_defs<'a, I: Iterator<Item = &'a ChannelDecl>>(decls: I) -> Result<()> {
    for decl in decls {
        let over_specified =
            decl.storage.is_some() || decl.hash.is_some() || decl.user_path.is_some();
        match decl.channel_type {
            ChannelType::Directory => {
                if decl.storage.is_none() || decl.hash.is_none() || decl.user_path.is_none() {
                    return Err(FlowError::InvalidChannelDef);
                }
            }
            ChannelType::File => {
                if over_specified {
                    return Err(FlowError::InvalidChannelDef);
                }
            }
            ChannelType::EnvironmentVar => {}
        }
    }
    Ok(())
}

/// Readers and writers of one internal channel.
#[derive(Debug, Default, Clone)]
pub struct ChannelSummary {
    pub writers: BTreeSet<String>,
    pub readers: BTreeSet<String>,
}

/// Build the channel -> {writers, readers} summary and check it: a channel
/// nobody reads must be a workflow output, at most one usage writes a
/// channel, and written channels may not be declared inputs or binds.
fn validate_graph(workflow: &WorkflowDef) -> Result<BTreeMap<String, ChannelSummary>> {
    let mut connections: BTreeMap<String, ChannelSummary> = BTreeMap::new();
    for (usage_name, usage) in &workflow.nodes {
        for channel in usage.input.values() {
            connections
                .entry(channel.clone())
                .or_default()
                .readers
                .insert(usage_name.clone());
        }
        for channel in usage.output.values() {
            connections
                .entry(channel.clone())
                .or_default()
                .writers
                .insert(usage_name.clone());
        }
    }

    for (channel_name, summary) in &connections {
        if summary.readers.is_empty() && !workflow.output.contains_key(channel_name) {
            return Err(FlowError::InvalidWorkflow {
                reason: format!("channel \"{channel_name}\" not read"),
            });
        }
        if summary.writers.len() > 1 {
            return Err(FlowError::InvalidWorkflow {
                reason: format!("channel \"{channel_name}\" written more than once"),
            });
        }
        if !summary.writers.is_empty()
            && (workflow.input.contains_key(channel_name)
                || workflow.bind.contains_key(channel_name))
        {
            return Err(FlowError::InvalidWorkflow {
                reason: format!("channel \"{channel_name}\" forbidden to write"),
            });
        }
    }
    Ok(connections)
}

/// Kahn's algorithm over producer->consumer edges plus explicit sequence
/// edges. Returns usage names with producers before consumers. Usages that
/// touch no written channel and no sequence entry do not appear (the caller
/// handles the singleton case).
fn topological_order(
    workflow: &WorkflowDef,
    connections: &BTreeMap<String, ChannelSummary>,
) -> Result<Vec<String>> {
    let mut successors: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut nodes: BTreeSet<String> = BTreeSet::new();

    for summary in connections.values() {
        // at most one writer, validated above
        if let Some(writer) = summary.writers.iter().next() {
            nodes.insert(writer.clone());
            for reader in &summary.readers {
                nodes.insert(reader.clone());
                successors
                    .entry(writer.clone())
                    .or_default()
                    .insert(reader.clone());
            }
        }
    }

    if let Some(sequences) = &workflow.sequence {
        for sequence in sequences {
            if sequence.is_empty() {
                return Err(FlowError::InvalidWorkflow {
                    reason: "sequence no list of node names".to_string(),
                });
            }
            for usage_name in sequence {
                if !workflow.nodes.contains_key(usage_name) {
                    return Err(FlowError::InvalidWorkflow {
                        reason: "node in sequence unknown".to_string(),
                    });
                }
            }
            let first = &sequence[0];
            nodes.insert(first.clone());
            for later in &sequence[1..] {
                nodes.insert(later.clone());
                successors
                    .entry(first.clone())
                    .or_default()
                    .insert(later.clone());
            }
        }
    }

    let mut indegree: BTreeMap<String, usize> =
        nodes.iter().map(|name| (name.clone(), 0)).collect();
    for targets in successors.values() {
        for target in targets {
            *indegree.get_mut(target).expect("target registered") += 1;
        }
    }

    let mut ready: BTreeSet<String> = indegree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| name.clone())
        .collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(name) = ready.iter().next().cloned() {
        ready.remove(&name);
        if let Some(targets) = successors.get(&name) {
            for target in targets {
                let degree = indegree.get_mut(target).expect("target registered");
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(target.clone());
                }
            }
        }
        order.push(name);
    }

    if order.len() != nodes.len() {
        return Err(FlowError::InvalidWorkflow {
            reason: "cycle in operators in workflow".to_string(),
        });
    }
    Ok(order)
}

/// Log (but do not fail on) definition channels a usage leaves unbound.
pub fn warn_unbound_channels(store: &EntityStore, workflow: &WorkflowDef) {
    for usage in workflow.nodes.values() {
        let (what, def_channels) = if let Some(node_hash) = &usage.hash_of_node_def {
            match store.get_node(node_hash) {
                Ok(def) => (
                    "node",
                    (
                        def.entity.input.keys().cloned().collect::<Vec<_>>(),
                        def.entity.output.keys().cloned().collect::<Vec<_>>(),
                    ),
                ),
                Err(_) => continue,
            }
        } else if let Some(workflow_hash) = &usage.hash_of_workflow_def {
            match store.get_workflow(workflow_hash) {
                Ok(def) => (
                    "sub workflow",
                    (
                        def.entity.input.keys().cloned().collect::<Vec<_>>(),
                        def.entity.output.keys().cloned().collect::<Vec<_>>(),
                    ),
                ),
                Err(_) => continue,
            }
        } else {
            continue;
        };
        let (def_inputs, def_outputs) = def_channels;
        for channel_name in def_inputs {
            if !usage.input.contains_key(&channel_name) {
                error!(channel = %channel_name, what, direction = "input", "channel not bound");
            }
        }
        for channel_name in def_outputs {
            if !usage.output.contains_key(&channel_name) {
                error!(channel = %channel_name, what, direction = "output", "channel not bound");
            }
        }
    }
}
