// Node registry

//! Registers units of execution. Image nodes are pinned to their digest here,
//! so later runs are immune to tag drift; script nodes are resolved to their
//! stored script and made executable. Channel shapes are validated per node
//! kind: image nodes need an in-container mount path on every file/directory
//! channel, script nodes need an environment variable name on every channel.

use tracing::{info, warn};

use super::{data, runtime::NodeRuntime};
use crate::models::{parse_descriptor, ChannelType, NodeChannel, NodeDef, NodeKind};
use crate::store::{workspace, EntityStore, HostOs, TableKind};
use crate::{FlowError, Result};

use std::collections::BTreeMap;

const IMAGE_RESOLUTION_ATTEMPTS: u32 = 3;

/// Register a node definition.
pub fn add_node(
    store: &EntityStore,
    runtime: &dyn NodeRuntime,
    param: serde_json::Value,
    logged_in_user: &str,
) -> Result<String> {
    let mut node: NodeDef = parse_descriptor(param, "node_def")?;
    // derived attributes are computed here, never accepted from the client
    node.image_id = None;
    node.bash_id = None;

    assert_channel_names_disjoint(&node)?;

    match &node.kind {
        NodeKind::Image { image } => {
            require_channel_attr(&node.input, |c| c.path_in_container.is_some(), true)?;
            require_channel_attr(&node.output, |c| c.path_in_container.is_some(), true)?;
            let image = image.clone();
            node.image_id = Some(resolve_digest_with_retries(runtime, &image)?);
        }
        NodeKind::Script { bash } => {
            if store.ctx().host_os == HostOs::Windows {
                return Err(FlowError::system(
                    "bash nodes are not supported on windows",
                ));
            }
            require_channel_attr(
                &node.input,
                |c| c.environment_var_in_container.is_some(),
                false,
            )?;
            require_channel_attr(
                &node.output,
                |c| c.environment_var_in_container.is_some(),
                false,
            )?;
            let bash_id = store.resolve(TableKind::Data, bash)?;
            let script_path = data::path_by_hash(store, &bash_id)?;
            workspace::set_file_executable(&script_path);
            node.bash_id = Some(bash_id);
        }
    }

    store.insert_node(node, logged_in_user)
}

/// Input and output channel name-sets must be disjoint.
fn assert_channel_names_disjoint(node: &NodeDef) -> Result<()> {
    for name in node.input.keys() {
        if node.output.contains_key(name) {
            return Err(FlowError::DuplicateChannel { name: name.clone() });
        }
    }
    Ok(())
}

/// Every channel must carry its in-container target. With
/// `mountable_only`, environment-variable channels are exempt (image nodes);
/// otherwise the requirement covers every channel (script nodes).
fn require_channel_attr(
    channels: &BTreeMap<String, NodeChannel>,
    has_attr: impl Fn(&NodeChannel) -> bool,
    mountable_only: bool,
) -> Result<()> {
    for (name, channel) in channels {
        if mountable_only && channel.channel_type == ChannelType::EnvironmentVar {
            continue;
        }
        if !has_attr(channel) {
            return Err(FlowError::NotFound {
                kind: "in-container target in channel".to_string(),
                name: name.clone(),
            });
        }
    }
    Ok(())
}

/// Resolve an image to its digest, retrying runtime glitches up to three
/// times. A definitely-missing image is a user error and not retried.
fn resolve_digest_with_retries(
    runtime: &dyn NodeRuntime,
    image: &crate::models::ImageRef,
) -> Result<String> {
    let mut last_error = FlowError::ImageProblem {
        image_name: image.to_string(),
    };
    for attempt in 1..=IMAGE_RESOLUTION_ATTEMPTS {
        match runtime.resolve_image_digest(image) {
            Ok(digest) => {
                if attempt > 1 {
                    info!(image = %image, "container runtime access succeeded after retry");
                }
                return Ok(digest);
            }
            Err(e @ FlowError::ImageProblem { .. }) => return Err(e),
            Err(e) => {
                warn!(image = %image, error = %e, "container runtime access failed, retrying");
                last_error = e;
            }
        }
    }
    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ImageRef;
    use crate::store::test_support::empty_store;
    use serde_json::json;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Runtime double: resolves every image to a fixed digest after a
    /// configurable number of glitches.
    struct FlakyRuntime {
        failures_before_success: u32,
        calls: AtomicU32,
    }

    impl FlakyRuntime {
        fn new(failures_before_success: u32) -> Self {
            FlakyRuntime {
                failures_before_success,
                calls: AtomicU32::new(0),
            }
        }
    }

    impl NodeRuntime for FlakyRuntime {
        fn resolve_image_digest(&self, _image: &ImageRef) -> crate::Result<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                Err(FlowError::system("runtime glitch"))
            } else {
                Ok("d1gest".repeat(8))
            }
        }

        fn run_image(
            &self,
            _image_id: &str,
            _mounts: &[(PathBuf, String)],
            _envvars: &[(String, String)],
        ) -> crate::Result<crate::engine::runtime::RunOutput> {
            unreachable!("registration never runs images")
        }

        fn run_script(
            &self,
            _script: &Path,
            _envvars: &[(String, String)],
        ) -> crate::Result<crate::engine::runtime::RunOutput> {
            unreachable!("registration never runs scripts")
        }
    }

    fn image_node_descriptor() -> serde_json::Value {
        json!({
            "name": "copy",
            "image": { "name": "busybox", "version": "1.36" },
            "input": { "i": { "type": "file", "format": "any", "path_in_container": "/in" } },
            "output": { "o": { "type": "file", "format": "any", "path_in_container": "/out" } }
        })
    }

    #[test]
    fn test_image_node_records_digest() {
        let (store, _guard) = empty_store();
        let runtime = FlakyRuntime::new(0);
        let hash = add_node(&store, &runtime, image_node_descriptor(), "u").unwrap();
        let node = store.get_node(&hash).unwrap().entity;
        assert!(node.image_id.is_some());
        assert!(node.bash_id.is_none());
    }

    #[test]
    fn test_digest_resolution_retries_runtime_glitches() {
        let (store, _guard) = empty_store();
        let runtime = FlakyRuntime::new(2);
        let hash = add_node(&store, &runtime, image_node_descriptor(), "u").unwrap();
        assert!(store.get_node(&hash).is_ok());
        assert_eq!(runtime.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_digest_resolution_gives_up_after_three_attempts() {
        let (store, _guard) = empty_store();
        let runtime = FlakyRuntime::new(10);
        let result = add_node(&store, &runtime, image_node_descriptor(), "u");
        assert!(result.is_err());
        assert_eq!(runtime.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_overlapping_channel_names_rejected() {
        let (store, _guard) = empty_store();
        let runtime = FlakyRuntime::new(0);
        let result = add_node(
            &store,
            &runtime,
            json!({
                "name": "bad",
                "image": { "name": "busybox", "version": "1.36" },
                "input": { "x": { "type": "file", "format": "any", "path_in_container": "/in" } },
                "output": { "x": { "type": "file", "format": "any", "path_in_container": "/out" } }
            }),
            "u",
        );
        assert!(matches!(
            result,
            Err(FlowError::DuplicateChannel { name }) if name == "x"
        ));
    }

    #[test]
    fn test_file_channel_requires_mount_path() {
        let (store, _guard) = empty_store();
        let runtime = FlakyRuntime::new(0);
        let result = add_node(
            &store,
            &runtime,
            json!({
                "name": "bad",
                "image": { "name": "busybox", "version": "1.36" },
                "input": { "i": { "type": "file", "format": "any" } },
                "output": {}
            }),
            "u",
        );
        assert!(matches!(result, Err(FlowError::NotFound { .. })));
    }

    #[test]
    fn test_script_node_resolves_stored_script() {
        let (store, _guard) = empty_store();
        let base = store.ctx().base_dir.clone().unwrap();
        std::fs::write(base.join("prep.sh"), b"#!/bin/sh\necho ok\n").unwrap();
        crate::engine::data::add_data(
            &store,
            json!({
                "name": "prep_script",
                "type": "file",
                "storage": "platform",
                "hash": true,
                "format": "sh",
                "user_path": "prep.sh"
            }),
            "u",
        )
        .unwrap();

        let runtime = FlakyRuntime::new(0);
        let hash = add_node(
            &store,
            &runtime,
            json!({
                "name": "prep",
                "bash": { "name": "prep_script", "version": "latest" },
                "input": { "src": { "type": "file", "format": "any", "environment_var_in_container": "SRC" } },
                "output": {}
            }),
            "u",
        )
        .unwrap();
        let node = store.get_node(&hash).unwrap().entity;
        assert!(node.bash_id.is_some());
        assert!(node.image_id.is_none());
    }
}
