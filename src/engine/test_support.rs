//! Shared engine fixtures: a scriptable runtime double plus descriptor
//! builders used across the workflow and run test suites.

use std::path::{Path, PathBuf};

use serde_json::json;

use super::runtime::{NodeRuntime, RunOutput};
use crate::models::ImageRef;
use crate::store::EntityStore;
use crate::Result;

/// What the fake runtime does when a node is invoked.
pub enum FakeBehavior {
    /// Copy the mount at container path `from` to the mount at `to`.
    CopyMounts { from: String, to: String },
    /// Copy the file named by env var `from` to the file named by `to`
    /// (script-node shape).
    CopyEnv { from: String, to: String },
    /// Exit nonzero without touching anything.
    Fail,
}

/// Runtime double: deterministic digests, scripted node behavior, no
/// container daemon required.
pub struct FakeRuntime {
    pub behavior: FakeBehavior,
    /// Image id that always fails, regardless of behavior.
    pub fail_for_image: Option<String>,
}

impl FakeRuntime {
    pub fn copying() -> Self {
        FakeRuntime {
            behavior: FakeBehavior::CopyMounts {
                from: "/in".to_string(),
                to: "/out".to_string(),
            },
            fail_for_image: None,
        }
    }

    pub fn failing() -> Self {
        FakeRuntime {
            behavior: FakeBehavior::Fail,
            fail_for_image: None,
        }
    }

    pub fn copying_env() -> Self {
        FakeRuntime {
            behavior: FakeBehavior::CopyEnv {
                from: "SRC".to_string(),
                to: "DST".to_string(),
            },
            fail_for_image: None,
        }
    }

    /// Copying runtime that fails whenever the named image is invoked.
    pub fn failing_for(image_id: String) -> Self {
        let mut runtime = FakeRuntime::copying();
        runtime.fail_for_image = Some(image_id);
        runtime
    }

    fn perform(
        &self,
        command: String,
        mounts: &[(PathBuf, String)],
        envvars: &[(String, String)],
    ) -> Result<RunOutput> {
        let ok = |success| {
            Ok(RunOutput {
                command,
                success,
                exit_code: if success { Some(0) } else { Some(1) },
                stdout: String::new(),
                stderr: String::new(),
            })
        };
        match &self.behavior {
            FakeBehavior::CopyMounts { from, to } => {
                let source = mounts.iter().find(|(_, c)| c == from);
                let target = mounts.iter().find(|(_, c)| c == to);
                match (source, target) {
                    (Some((source, _)), Some((target, _))) => {
                        std::fs::copy(source, target)?;
                        ok(true)
                    }
                    _ => ok(false),
                }
            }
            FakeBehavior::CopyEnv { from, to } => {
                let source = envvars.iter().find(|(name, _)| name == from);
                let target = envvars.iter().find(|(name, _)| name == to);
                match (source, target) {
                    (Some((_, source)), Some((_, target))) => {
                        std::fs::copy(source, target)?;
                        ok(true)
                    }
                    _ => ok(false),
                }
            }
            FakeBehavior::Fail => ok(false),
        }
    }
}

impl NodeRuntime for FakeRuntime {
    fn resolve_image_digest(&self, image: &ImageRef) -> Result<String> {
        // deterministic per-image digest
        Ok(crate::store::hash::blob_hash_of_bytes(
            image.to_string().as_bytes(),
        ))
    }

    fn run_image(
        &self,
        image_id: &str,
        mounts: &[(PathBuf, String)],
        envvars: &[(String, String)],
    ) -> Result<RunOutput> {
        if self.fail_for_image.as_deref() == Some(image_id) {
            return Ok(RunOutput {
                command: format!("fake run --rm {image_id}"),
                success: false,
                exit_code: Some(1),
                stdout: String::new(),
                stderr: "scripted failure".to_string(),
            });
        }
        self.perform(format!("fake run --rm {image_id}"), mounts, envvars)
    }

    fn run_script(&self, script: &Path, envvars: &[(String, String)]) -> Result<RunOutput> {
        self.perform(format!("fake bash {}", script.display()), &[], envvars)
    }
}

/// Register a platform-stored, content-hashed file under `name`.
pub fn register_data_file(store: &EntityStore, name: &str, content: &[u8]) -> String {
    let base = store.ctx().base_dir.clone().expect("base dir configured");
    let file = base.join(format!("{name}.txt"));
    std::fs::write(&file, content).expect("write fixture file");
    super::data::add_data(
        store,
        json!({
            "name": name,
            "type": "file",
            "storage": "platform",
            "hash": true,
            "format": "txt",
            "user_path": format!("{name}.txt")
        }),
        "tester",
    )
    .expect("register fixture data")
}

/// Register an image node with one file input at `/in` and one file output at
/// `/out`.
pub fn register_copy_node(store: &EntityStore, runtime: &dyn NodeRuntime, name: &str) -> String {
    super::node::add_node(
        store,
        runtime,
        json!({
            "name": name,
            "image": { "name": "copier", "version": "1.0" },
            "input": { "i": { "type": "file", "format": "any", "path_in_container": "/in" } },
            "output": { "o": { "type": "file", "format": "any", "path_in_container": "/out" } }
        }),
        "tester",
    )
    .expect("register copy node")
}

/// A workflow with one copy-node usage reading bind channel `ib` (fed by the
/// named data entry) and writing output channel `oo`.
pub fn singleton_workflow_descriptor(node_name: &str, data_name: &str) -> serde_json::Value {
    json!({
        "name": "single",
        "input": {},
        "output": { "oo": { "type": "file", "format": "any" } },
        "bind": {
            "ib": {
                "type": "file",
                "format": "any",
                "data": { "name": data_name, "version": "latest" }
            }
        },
        "connect": {},
        "nodes": {
            "step": {
                "node": { "name": node_name, "version": "latest" },
                "input": { "i": "ib" },
                "output": { "o": "oo" }
            }
        }
    })
}
