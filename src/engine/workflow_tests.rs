//! Workflow validator tests: section disjointness, renaming checks, graph
//! rules, topological ordering with explicit sequences, and refinement.

use serde_json::json;

use super::test_support::{register_copy_node, register_data_file, FakeRuntime};
use super::workflow::{add_workflow, refine_workflow};
use crate::store::test_support::empty_store;
use crate::store::EntityStore;
use crate::FlowError;

/// Register a copy node plus a second node with custom channel names.
fn store_with_copy_node() -> (EntityStore, tempfile::TempDir) {
    let (store, guard) = empty_store();
    let runtime = FakeRuntime::copying();
    register_copy_node(&store, &runtime, "copy");
    (store, guard)
}

fn stored_order(store: &EntityStore, workflow_hash: &str) -> Vec<String> {
    store
        .get_workflow(workflow_hash)
        .unwrap()
        .entity
        .topological_order
        .unwrap()
}

/// Two independent copy usages: `first` reads input a1 / writes output b1,
/// `second` reads a2 / writes b2.
fn independent_pair(sequence: serde_json::Value) -> serde_json::Value {
    json!({
        "name": "pair",
        "input": {
            "a1": { "type": "file", "format": "any" },
            "a2": { "type": "file", "format": "any" }
        },
        "output": {
            "b1": { "type": "file", "format": "any" },
            "b2": { "type": "file", "format": "any" }
        },
        "bind": {},
        "connect": {},
        "nodes": {
            "first": {
                "node": { "name": "copy", "version": "latest" },
                "input": { "i": "a1" },
                "output": { "o": "b1" }
            },
            "second": {
                "node": { "name": "copy", "version": "latest" },
                "input": { "i": "a2" },
                "output": { "o": "b2" }
            }
        },
        "sequence": sequence
    })
}

#[test]
fn test_singleton_workflow_orders_as_singleton() {
    let (store, _guard) = store_with_copy_node();
    let workflow_hash = add_workflow(
        &store,
        json!({
            "name": "single",
            "input": { "a": { "type": "file", "format": "any" } },
            "output": { "b": { "type": "file", "format": "any" } },
            "bind": {},
            "connect": {},
            "nodes": {
                "only": {
                    "node": { "name": "copy", "version": "latest" },
                    "input": { "i": "a" },
                    "output": { "o": "b" }
                }
            }
        }),
        "tester",
    )
    .unwrap();
    assert_eq!(stored_order(&store, &workflow_hash), vec!["only"]);
}

#[test]
fn test_single_usage_without_channels_falls_back_to_singleton_order() {
    let (store, _guard) = empty_store();
    let runtime = FakeRuntime::copying();
    // a node with no channels at all
    super::node::add_node(
        &store,
        &runtime,
        json!({
            "name": "noop",
            "image": { "name": "noop", "version": "1.0" },
            "input": {},
            "output": {}
        }),
        "tester",
    )
    .unwrap();
    let workflow_hash = add_workflow(
        &store,
        json!({
            "name": "empty_graph",
            "input": {},
            "output": {},
            "bind": {},
            "connect": {},
            "nodes": {
                "only": {
                    "node": { "name": "noop", "version": "latest" },
                    "input": {},
                    "output": {}
                }
            }
        }),
        "tester",
    )
    .unwrap();
    assert_eq!(stored_order(&store, &workflow_hash), vec!["only"]);
}

#[test]
fn test_channel_name_in_two_sections_rejected() {
    let (store, _guard) = store_with_copy_node();
    let result = add_workflow(
        &store,
        json!({
            "name": "clash",
            "input": { "x": { "type": "file", "format": "any" } },
            "output": { "x": { "type": "file", "format": "any" } },
            "bind": {},
            "connect": {},
            "nodes": {
                "only": {
                    "node": { "name": "copy", "version": "latest" },
                    "input": { "i": "x" },
                    "output": { "o": "x" }
                }
            }
        }),
        "tester",
    );
    assert!(matches!(
        result,
        Err(FlowError::DuplicateChannel { name }) if name == "x"
    ));
}

#[test]
fn test_usage_referencing_unknown_definition_channel_rejected() {
    let (store, _guard) = store_with_copy_node();
    let result = add_workflow(
        &store,
        json!({
            "name": "bad",
            "input": { "a": { "type": "file", "format": "any" } },
            "output": { "b": { "type": "file", "format": "any" } },
            "bind": {},
            "connect": {},
            "nodes": {
                "only": {
                    "node": { "name": "copy", "version": "latest" },
                    "input": { "nonsense": "a" },
                    "output": { "o": "b" }
                }
            }
        }),
        "tester",
    );
    assert!(matches!(result, Err(FlowError::UsageMismatch { .. })));
}

#[test]
fn test_renaming_to_undeclared_channel_rejected() {
    let (store, _guard) = store_with_copy_node();
    let result = add_workflow(
        &store,
        json!({
            "name": "bad",
            "input": { "a": { "type": "file", "format": "any" } },
            "output": { "b": { "type": "file", "format": "any" } },
            "bind": {},
            "connect": {},
            "nodes": {
                "only": {
                    "node": { "name": "copy", "version": "latest" },
                    "input": { "i": "ghost" },
                    "output": { "o": "b" }
                }
            }
        }),
        "tester",
    );
    assert!(matches!(
        result,
        Err(FlowError::ChannelMissing { channel_name, .. }) if channel_name == "ghost"
    ));
}

#[test]
fn test_unused_workflow_channel_rejected() {
    let (store, _guard) = store_with_copy_node();
    let result = add_workflow(
        &store,
        json!({
            "name": "bad",
            "input": {
                "a": { "type": "file", "format": "any" },
                "unused": { "type": "file", "format": "any" }
            },
            "output": { "b": { "type": "file", "format": "any" } },
            "bind": {},
            "connect": {},
            "nodes": {
                "only": {
                    "node": { "name": "copy", "version": "latest" },
                    "input": { "i": "a" },
                    "output": { "o": "b" }
                }
            }
        }),
        "tester",
    );
    assert!(matches!(
        result,
        Err(FlowError::WorkflowChannelUnused { channel_name }) if channel_name == "unused"
    ));
}

#[test]
fn test_writing_an_input_channel_rejected() {
    let (store, _guard) = store_with_copy_node();
    let result = add_workflow(
        &store,
        json!({
            "name": "bad",
            "input": { "a": { "type": "file", "format": "any" } },
            "output": {},
            "bind": {},
            "connect": {},
            "nodes": {
                "only": {
                    "node": { "name": "copy", "version": "latest" },
                    "input": { "i": "a" },
                    "output": { "o": "a" }
                }
            }
        }),
        "tester",
    );
    // outputs may only target output/connect channels; "a" is an input
    assert!(matches!(
        result,
        Err(FlowError::ChannelMissing { channel_name, .. }) if channel_name == "a"
    ));
}

#[test]
fn test_channel_written_twice_rejected() {
    let (store, _guard) = store_with_copy_node();
    let result = add_workflow(
        &store,
        json!({
            "name": "bad",
            "input": {
                "a1": { "type": "file", "format": "any" },
                "a2": { "type": "file", "format": "any" }
            },
            "output": { "b": { "type": "file", "format": "any" } },
            "bind": {},
            "connect": {},
            "nodes": {
                "first": {
                    "node": { "name": "copy", "version": "latest" },
                    "input": { "i": "a1" },
                    "output": { "o": "b" }
                },
                "second": {
                    "node": { "name": "copy", "version": "latest" },
                    "input": { "i": "a2" },
                    "output": { "o": "b" }
                }
            }
        }),
        "tester",
    );
    assert!(matches!(result, Err(FlowError::InvalidWorkflow { reason })
        if reason.contains("written more than once")));
}

#[test]
fn test_unread_connect_channel_rejected() {
    let (store, _guard) = store_with_copy_node();
    let result = add_workflow(
        &store,
        json!({
            "name": "bad",
            "input": { "a": { "type": "file", "format": "any" } },
            "output": {},
            "bind": {},
            "connect": { "c": { "type": "file", "format": "any" } },
            "nodes": {
                "only": {
                    "node": { "name": "copy", "version": "latest" },
                    "input": { "i": "a" },
                    "output": { "o": "c" }
                }
            }
        }),
        "tester",
    );
    assert!(matches!(result, Err(FlowError::InvalidWorkflow { reason })
        if reason.contains("not read")));
}

#[test]
fn test_cycle_rejected() {
    let (store, _guard) = store_with_copy_node();
    // first writes x and reads y, second writes y and reads x
    let result = add_workflow(
        &store,
        json!({
            "name": "cyclic",
            "input": {},
            "output": {
                "x": { "type": "file", "format": "any" },
                "y": { "type": "file", "format": "any" }
            },
            "bind": {},
            "connect": {},
            "nodes": {
                "first": {
                    "node": { "name": "copy", "version": "latest" },
                    "input": { "i": "y" },
                    "output": { "o": "x" }
                },
                "second": {
                    "node": { "name": "copy", "version": "latest" },
                    "input": { "i": "x" },
                    "output": { "o": "y" }
                }
            }
        }),
        "tester",
    );
    assert!(matches!(result, Err(FlowError::InvalidWorkflow { reason })
        if reason.contains("cycle")));
}

#[test]
fn test_sequence_enforces_ordering() {
    let (store, _guard) = store_with_copy_node();
    // alphabetical order would put "first" before "second"; the sequence
    // demands the opposite
    let workflow_hash = add_workflow(
        &store,
        independent_pair(json!([["second", "first"]])),
        "tester",
    )
    .unwrap();
    assert_eq!(stored_order(&store, &workflow_hash), vec!["second", "first"]);
}

#[test]
fn test_sequence_cycle_rejected() {
    let (store, _guard) = store_with_copy_node();
    let result = add_workflow(
        &store,
        independent_pair(json!([["first", "second"], ["second", "first"]])),
        "tester",
    );
    assert!(matches!(result, Err(FlowError::InvalidWorkflow { reason })
        if reason.contains("cycle")));
}

#[test]
fn test_sequence_with_unknown_usage_rejected() {
    let (store, _guard) = store_with_copy_node();
    let result = add_workflow(
        &store,
        independent_pair(json!([["first", "ghost"]])),
        "tester",
    );
    assert!(matches!(result, Err(FlowError::InvalidWorkflow { reason })
        if reason.contains("unknown")));
}

#[test]
fn test_order_respects_producer_consumer_chain() {
    let (store, _guard) = store_with_copy_node();
    let workflow_hash = add_workflow(
        &store,
        json!({
            "name": "chain",
            "input": { "a": { "type": "file", "format": "any" } },
            "output": { "z": { "type": "file", "format": "any" } },
            "bind": {},
            "connect": { "c": { "type": "file", "format": "any" } },
            "nodes": {
                // named against alphabetical order on purpose
                "z_source": {
                    "node": { "name": "copy", "version": "latest" },
                    "input": { "i": "a" },
                    "output": { "o": "c" }
                },
                "a_sink": {
                    "node": { "name": "copy", "version": "latest" },
                    "input": { "i": "c" },
                    "output": { "o": "z" }
                }
            }
        }),
        "tester",
    )
    .unwrap();
    assert_eq!(stored_order(&store, &workflow_hash), vec!["z_source", "a_sink"]);
}

#[test]
fn test_registering_same_workflow_twice_is_idempotent() {
    let (store, _guard) = store_with_copy_node();
    let descriptor = independent_pair(json!([["first", "second"]]));
    let first = add_workflow(&store, descriptor.clone(), "tester").unwrap();
    let second = add_workflow(&store, descriptor, "tester").unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_directory_connect_requires_storage_attributes() {
    let (store, _guard) = store_with_copy_node();
    let result = add_workflow(
        &store,
        json!({
            "name": "bad",
            "input": { "a": { "type": "file", "format": "any" } },
            "output": {},
            "bind": {},
            "connect": { "c": { "type": "directory", "format": "any" } },
            "nodes": {
                "first": {
                    "node": { "name": "copy", "version": "latest" },
                    "input": { "i": "a" },
                    "output": { "o": "c" }
                },
                "second": {
                    "node": { "name": "copy", "version": "latest" },
                    "input": { "i": "c" },
                    "output": {}
                }
            }
        }),
        "tester",
    );
    assert!(matches!(result, Err(FlowError::InvalidChannelDef)));
}

// --- refinement -----------------------------------------------------------

/// Register a node with explicit channel names, all file channels.
fn register_node_with_channels(
    store: &EntityStore,
    name: &str,
    inputs: &[&str],
    outputs: &[&str],
) -> String {
    let runtime = FakeRuntime::copying();
    let input: serde_json::Map<String, serde_json::Value> = inputs
        .iter()
        .map(|c| {
            (
                c.to_string(),
                json!({ "type": "file", "format": "any", "path_in_container": format!("/{c}") }),
            )
        })
        .collect();
    let output: serde_json::Map<String, serde_json::Value> = outputs
        .iter()
        .map(|c| {
            (
                c.to_string(),
                json!({ "type": "file", "format": "any", "path_in_container": format!("/{c}") }),
            )
        })
        .collect();
    super::node::add_node(
        store,
        &runtime,
        json!({
            "name": name,
            "image": { "name": name, "version": "1.0" },
            "input": input,
            "output": output
        }),
        "tester",
    )
    .unwrap()
}

fn refinable_workflow(store: &EntityStore) -> String {
    register_node_with_channels(store, "base", &["a", "b"], &["c"]);
    add_workflow(
        store,
        json!({
            "name": "refinable",
            "input": {
                "wa": { "type": "file", "format": "any" },
                "wb": { "type": "file", "format": "any" }
            },
            "output": { "wc": { "type": "file", "format": "any" } },
            "bind": {},
            "connect": {},
            "nodes": {
                "step": {
                    "node": { "name": "base", "version": "latest" },
                    "input": { "a": "wa", "b": "wb" },
                    "output": { "c": "wc" }
                }
            }
        }),
        "tester",
    )
    .unwrap()
}

#[test]
fn test_refinement_with_matching_shape_succeeds() {
    let (store, _guard) = empty_store();
    let original = refinable_workflow(&store);
    register_node_with_channels(&store, "replacement", &["a", "b"], &["c"]);

    let refined = refine_workflow(
        &store,
        json!({
            "name": "refined",
            "workflow": { "hash": original },
            "replace_by_node": { "step": { "name": "replacement", "version": "latest" } }
        }),
        "tester",
    )
    .unwrap();

    let workflow = store.get_workflow(&refined).unwrap();
    assert_eq!(workflow.entity.name, "refined");
    let usage = &workflow.entity.nodes["step"];
    let node_def = store
        .get_node(usage.hash_of_node_def.as_ref().unwrap())
        .unwrap();
    assert_eq!(node_def.entity.name, "replacement");
    assert_ne!(refined, original);
}

#[test]
fn test_refinement_with_mismatched_shape_rejected() {
    let (store, _guard) = empty_store();
    let original = refinable_workflow(&store);
    register_node_with_channels(&store, "misfit", &["a", "d"], &["c"]);

    let result = refine_workflow(
        &store,
        json!({
            "name": "refined",
            "workflow": { "hash": original },
            "replace_by_node": { "step": { "name": "misfit", "version": "latest" } }
        }),
        "tester",
    );
    assert!(matches!(result, Err(FlowError::RefineMismatch)));
}

#[test]
fn test_refinement_of_unknown_usage_rejected() {
    let (store, _guard) = empty_store();
    let original = refinable_workflow(&store);
    register_node_with_channels(&store, "replacement", &["a", "b"], &["c"]);
    let result = refine_workflow(
        &store,
        json!({
            "name": "refined",
            "workflow": { "hash": original },
            "replace_by_node": { "ghost": { "name": "replacement", "version": "latest" } }
        }),
        "tester",
    );
    assert!(matches!(result, Err(FlowError::RefineMismatch)));
}

#[test]
fn test_replace_bind_requires_matching_type_and_format() {
    let (store, _guard) = empty_store();
    let runtime = FakeRuntime::copying();
    register_data_file(&store, "seed", b"seed-bytes");
    register_copy_node(&store, &runtime, "copy");
    register_data_file(&store, "other", b"other-bytes");

    let original = add_workflow(
        &store,
        super::test_support::singleton_workflow_descriptor("copy", "seed"),
        "tester",
    )
    .unwrap();

    // same type and format, different data: accepted
    let refined = refine_workflow(
        &store,
        json!({
            "name": "rebound",
            "workflow": { "hash": original },
            "replace_bind": {
                "ib": {
                    "type": "file",
                    "format": "any",
                    "data": { "name": "other", "version": "latest" }
                }
            }
        }),
        "tester",
    )
    .unwrap();
    assert_ne!(refined, original);

    // format drift: rejected
    let result = refine_workflow(
        &store,
        json!({
            "name": "rebound2",
            "workflow": { "hash": original },
            "replace_bind": {
                "ib": {
                    "type": "file",
                    "format": "csv",
                    "data": { "name": "other", "version": "latest" }
                }
            }
        }),
        "tester",
    );
    assert!(matches!(result, Err(FlowError::RefineMismatch)));
}
