//! Executor tests, run end-to-end against the runtime double: singleton
//! image runs, script runs, failure handling, sub-workflow recursion, and
//! the data entries captured from run outputs.

use serde_json::json;

use super::run::run_workflow;
use super::test_support::{
    register_copy_node, register_data_file, singleton_workflow_descriptor, FakeRuntime,
};
use super::workflow::add_workflow;
use crate::store::test_support::empty_store;
use crate::store::{hash, EntityStore, TableKind};
use crate::models::Referer;

/// Store with user, seed data "inp" (content "hello"), copy node, and the
/// singleton workflow registered.
fn singleton_fixture() -> (EntityStore, tempfile::TempDir, String) {
    let (store, guard) = empty_store();
    let runtime = FakeRuntime::copying();
    register_data_file(&store, "inp", b"hello");
    register_copy_node(&store, &runtime, "copy");
    let workflow_hash = add_workflow(
        &store,
        singleton_workflow_descriptor("copy", "inp"),
        "tester",
    )
    .unwrap();
    (store, guard, workflow_hash)
}

#[test]
fn test_singleton_run_copies_input_to_output() {
    let (store, _guard, _workflow_hash) = singleton_fixture();
    let runtime = FakeRuntime::copying();

    let run_hash = run_workflow(
        &store,
        &runtime,
        json!({ "name": "r1", "workflow": { "name": "single", "version": "latest" } }),
        "tester",
    )
    .unwrap();

    let run = store.get_run(&run_hash).unwrap();
    assert_eq!(run.entity.success, Some(true));

    let bindings = run.entity.channel_bindings.as_ref().unwrap();
    let produced_hash = bindings.get("oo").expect("output channel bound");
    let produced = store.get_data(produced_hash).unwrap().entity;
    // the produced artifact carries the content hash of "hello"
    assert_eq!(
        produced.hash_of_content.as_deref(),
        Some(hash::blob_hash_of_bytes(b"hello").as_str())
    );
}

#[test]
fn test_failed_node_cancels_run_without_raising() {
    let (store, _guard, _workflow_hash) = singleton_fixture();
    let runtime = FakeRuntime::failing();

    let run_hash = run_workflow(
        &store,
        &runtime,
        json!({ "name": "r1", "workflow": { "name": "single", "version": "latest" } }),
        "tester",
    )
    .unwrap();

    let run = store.get_run(&run_hash).unwrap();
    assert_eq!(run.entity.success, Some(false));
    assert!(run
        .entity
        .log
        .iter()
        .any(|line| line.contains("cancelled due to errors")));
}

#[test]
fn test_successful_run_binds_every_output_channel() {
    let (store, _guard, _workflow_hash) = singleton_fixture();
    let runtime = FakeRuntime::copying();
    let run_hash = run_workflow(
        &store,
        &runtime,
        json!({ "name": "r1", "workflow": { "name": "single", "version": "latest" } }),
        "tester",
    )
    .unwrap();

    let run = store.get_run(&run_hash).unwrap();
    let workflow = store.get_workflow(&run.entity.hash_of_workflow).unwrap();
    let bindings = run.entity.channel_bindings.as_ref().unwrap();
    for output_channel in workflow.entity.output.keys() {
        let data_hash = bindings
            .get(output_channel)
            .expect("every declared output is bound");
        assert!(store.get_data(data_hash).is_ok());
    }
}

#[test]
fn test_rerun_creates_fresh_run_and_data_entities() {
    let (store, _guard, _workflow_hash) = singleton_fixture();
    let runtime = FakeRuntime::copying();
    let descriptor = json!({ "name": "r1", "workflow": { "name": "single", "version": "latest" } });

    let first = run_workflow(&store, &runtime, descriptor.clone(), "tester").unwrap();
    let second = run_workflow(&store, &runtime, descriptor, "tester").unwrap();
    assert_ne!(first, second);
    assert_eq!(store.get_run(&first).unwrap().version, 1);
    assert_eq!(store.get_run(&second).unwrap().version, 2);

    // run outputs always become new data entities (per-run scratch paths)
    let first_out = store.get_run(&first).unwrap().entity.channel_bindings.unwrap()["oo"].clone();
    let second_out = store.get_run(&second).unwrap().entity.channel_bindings.unwrap()["oo"].clone();
    assert_ne!(first_out, second_out);
    // both carry identical content, deduplicated physically
    assert_eq!(
        store.get_data(&first_out).unwrap().entity.hash_of_content,
        store.get_data(&second_out).unwrap().entity.hash_of_content
    );
}

#[test]
fn test_run_log_records_start_command_and_finish() {
    let (store, _guard, _workflow_hash) = singleton_fixture();
    let runtime = FakeRuntime::copying();
    let run_hash = run_workflow(
        &store,
        &runtime,
        json!({ "name": "r1", "workflow": { "name": "single", "version": "latest" } }),
        "tester",
    )
    .unwrap();
    let log = store.get_run(&run_hash).unwrap().entity.log;
    assert!(log[0].contains("workflow r1 started"));
    assert!(log.iter().any(|line| line.starts_with("node: ")));
    assert!(log.iter().any(|line| line.starts_with("Running command: ")));
    assert!(log.last().unwrap().contains("finished successfully"));
}

#[test]
fn test_script_node_run_through_environment_variables() {
    let (store, _guard) = empty_store();
    let runtime = FakeRuntime::copying_env();
    register_data_file(&store, "inp", b"script-payload");
    register_data_file(&store, "the_script", b"#!/bin/sh\ncp \"$SRC\" \"$DST\"\n");

    super::node::add_node(
        &store,
        &runtime,
        json!({
            "name": "shcopy",
            "bash": { "name": "the_script", "version": "latest" },
            "input": { "src": { "type": "file", "format": "any", "environment_var_in_container": "SRC" } },
            "output": { "dst": { "type": "file", "format": "any", "environment_var_in_container": "DST" } }
        }),
        "tester",
    )
    .unwrap();

    add_workflow(
        &store,
        json!({
            "name": "script_flow",
            "input": {},
            "output": { "oo": { "type": "file", "format": "any" } },
            "bind": {
                "ib": {
                    "type": "file",
                    "format": "any",
                    "data": { "name": "inp", "version": "latest" }
                }
            },
            "connect": {},
            "nodes": {
                "step": {
                    "node": { "name": "shcopy", "version": "latest" },
                    "input": { "src": "ib" },
                    "output": { "dst": "oo" }
                }
            }
        }),
        "tester",
    )
    .unwrap();

    let run_hash = run_workflow(
        &store,
        &runtime,
        json!({ "name": "sr", "workflow": { "name": "script_flow", "version": "latest" } }),
        "tester",
    )
    .unwrap();

    let run = store.get_run(&run_hash).unwrap();
    assert_eq!(run.entity.success, Some(true));
    let produced = run.entity.channel_bindings.unwrap()["oo"].clone();
    assert_eq!(
        store
            .get_data(&produced)
            .unwrap()
            .entity
            .hash_of_content
            .as_deref(),
        Some(hash::blob_hash_of_bytes(b"script-payload").as_str())
    );
}

/// Sub-workflow scenario: the outer workflow feeds a copy node whose result
/// flows through connect channel A into sub-workflow S (alpha -> beta), and
/// S's beta comes back as outer output B.
#[test]
fn test_sub_workflow_outputs_project_into_enclosing_run() {
    let (store, _guard) = empty_store();
    let runtime = FakeRuntime::copying();
    register_data_file(&store, "inp", b"hello");
    register_copy_node(&store, &runtime, "copy");

    // sub-workflow S: input alpha, output beta
    add_workflow(
        &store,
        json!({
            "name": "S",
            "input": { "alpha": { "type": "file", "format": "any" } },
            "output": { "beta": { "type": "file", "format": "any" } },
            "bind": {},
            "connect": {},
            "nodes": {
                "inner": {
                    "node": { "name": "copy", "version": "latest" },
                    "input": { "i": "alpha" },
                    "output": { "o": "beta" }
                }
            }
        }),
        "tester",
    )
    .unwrap();

    // outer workflow O: bind -> U1 -> connect A -> S -> output B
    add_workflow(
        &store,
        json!({
            "name": "O",
            "input": {},
            "output": { "B": { "type": "file", "format": "any" } },
            "bind": {
                "seed": {
                    "type": "file",
                    "format": "any",
                    "data": { "name": "inp", "version": "latest" }
                }
            },
            "connect": { "A": { "type": "file", "format": "any" } },
            "nodes": {
                "produce": {
                    "node": { "name": "copy", "version": "latest" },
                    "input": { "i": "seed" },
                    "output": { "o": "A" }
                },
                "sub": {
                    "workflow": { "name": "S", "version": "latest" },
                    "input": { "alpha": "A" },
                    "output": { "beta": "B" }
                }
            }
        }),
        "tester",
    )
    .unwrap();

    let run_hash = run_workflow(
        &store,
        &runtime,
        json!({ "name": "outer_run", "workflow": { "name": "O", "version": "latest" } }),
        "tester",
    )
    .unwrap();

    let run = store.get_run(&run_hash).unwrap();
    assert_eq!(run.entity.success, Some(true));

    let bindings = run.entity.channel_bindings.unwrap();
    let produced_on_b = bindings.get("B").expect("sub-workflow output projected");
    assert_eq!(
        store
            .get_data(produced_on_b)
            .unwrap()
            .entity
            .hash_of_content
            .as_deref(),
        Some(hash::blob_hash_of_bytes(b"hello").as_str())
    );

    // the sub-run was stored under the usage name
    let sub_run_hash = store
        .resolve(TableKind::Run, &Referer::latest("sub"))
        .unwrap();
    let sub_run = store.get_run(&sub_run_hash).unwrap();
    assert_eq!(sub_run.entity.success, Some(true));
    assert!(run
        .entity
        .log
        .iter()
        .any(|line| line.contains("sub workflow \"sub\" finished")));
}

#[test]
fn test_failing_sub_workflow_cancels_outer_run() {
    let (store, _guard) = empty_store();
    let setup_runtime = FakeRuntime::copying();
    register_data_file(&store, "inp", b"hello");
    register_copy_node(&store, &setup_runtime, "copy");
    // a second copy-shaped node under a distinct image, so only the
    // sub-workflow's node can be made to fail
    super::node::add_node(
        &store,
        &setup_runtime,
        json!({
            "name": "brittle",
            "image": { "name": "brittle", "version": "1.0" },
            "input": { "i": { "type": "file", "format": "any", "path_in_container": "/in" } },
            "output": { "o": { "type": "file", "format": "any", "path_in_container": "/out" } }
        }),
        "tester",
    )
    .unwrap();

    add_workflow(
        &store,
        json!({
            "name": "S",
            "input": { "alpha": { "type": "file", "format": "any" } },
            "output": { "beta": { "type": "file", "format": "any" } },
            "bind": {},
            "connect": {},
            "nodes": {
                "inner": {
                    "node": { "name": "brittle", "version": "latest" },
                    "input": { "i": "alpha" },
                    "output": { "o": "beta" }
                }
            }
        }),
        "tester",
    )
    .unwrap();
    add_workflow(
        &store,
        json!({
            "name": "O",
            "input": {},
            "output": { "B": { "type": "file", "format": "any" } },
            "bind": {
                "seed": {
                    "type": "file",
                    "format": "any",
                    "data": { "name": "inp", "version": "latest" }
                }
            },
            "connect": { "A": { "type": "file", "format": "any" } },
            "nodes": {
                "produce": {
                    "node": { "name": "copy", "version": "latest" },
                    "input": { "i": "seed" },
                    "output": { "o": "A" }
                },
                "sub": {
                    "workflow": { "name": "S", "version": "latest" },
                    "input": { "alpha": "A" },
                    "output": { "beta": "B" }
                }
            }
        }),
        "tester",
    )
    .unwrap();

    // only the brittle image (used inside S) fails; the outer node succeeds
    let brittle_image = hash::blob_hash_of_bytes(b"brittle:1.0");
    let runtime = FakeRuntime::failing_for(brittle_image);
    let run_hash = run_workflow(
        &store,
        &runtime,
        json!({ "name": "outer_run", "workflow": { "name": "O", "version": "latest" } }),
        "tester",
    )
    .unwrap();

    let run = store.get_run(&run_hash).unwrap();
    assert_eq!(run.entity.success, Some(false));
    assert!(run
        .entity
        .log
        .iter()
        .any(|line| line.contains("sub workflow \"sub\" finished. Result: false")));

    // the cancelled sub-run is stored too, marked unsuccessful
    let sub_run_hash = store
        .resolve(TableKind::Run, &Referer::latest("sub"))
        .unwrap();
    assert_eq!(
        store.get_run(&sub_run_hash).unwrap().entity.success,
        Some(false)
    );
}

#[test]
fn test_many_inserts_keep_shrunk_hashes_unique() {
    let (store, _guard) = empty_store();
    let mut full_hashes = Vec::new();
    for i in 0..128 {
        let hash = store
            .insert_user(
                crate::models::User {
                    name: format!("user{i}"),
                    display_name: format!("User {i}"),
                    su: false,
                },
                "tester",
            )
            .unwrap();
        full_hashes.push(hash);
    }
    // burst-insert then read: the lazily recomputed prefix still separates
    // every identifier
    let length = store.min_unique_prefix_length();
    assert!(length >= 6 && length % 2 == 0);
    let shrunk: std::collections::BTreeSet<String> = full_hashes
        .iter()
        .map(|hash| store.shrink_hash(hash))
        .collect();
    assert_eq!(shrunk.len(), full_hashes.len());
    assert!(shrunk.iter().all(|prefix| prefix.len() == length));
}
