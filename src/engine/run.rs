// Run executor - the recursive interpreter over a workflow's topological order

//! A run deep-copies the resolved workflow, walks its recorded topological
//! order, and dispatches every node usage: terminal nodes (image or script)
//! are materialized into mounts/environment variables and handed to the
//! runtime, sub-workflows recurse into this same executor with renamed
//! bindings. Artifacts produced on output channels are captured as new
//! content-addressed data entries.
//!
//! A failing node does **not** raise: it is logged, the walk breaks, and the
//! run is stored with `_success = false`. Only genuinely broken internal
//! state escalates as a system error.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::info;

use super::runtime::NodeRuntime;
use super::{data, workflow};
use crate::models::{
    parse_descriptor, ChannelDecl, ChannelType, DataDef, DataType, NodeChannel, NodeKind,
    NodeUsage, RunDef, RunRecord, StorageKind,
};
use crate::store::{workspace, EntityStore, TableKind};
use crate::{FlowError, Result};

/// A value currently flowing through a workflow channel.
#[derive(Debug, Clone)]
pub enum Binding {
    /// A materialized file or directory, registered in the data table.
    Data {
        channel_type: ChannelType,
        hash_of_data: String,
    },
    /// A literal environment-variable value.
    Env { value: String },
}

/// Active channel-binding map: workflow channel name -> binding.
pub type Bindings = BTreeMap<String, Binding>;

/// Execute a run from a client descriptor (top-level entry; the binding map
/// starts empty).
pub fn run_workflow(
    store: &EntityStore,
    runtime: &dyn NodeRuntime,
    param: serde_json::Value,
    logged_in_user: &str,
) -> Result<String> {
    let run_def: RunDef = parse_descriptor(param, "run_def")?;
    let mut bindings = Bindings::new();
    execute_run(store, runtime, run_def, &mut bindings, logged_in_user)
}

/// Execute a run with bindings supplied by an enclosing context. Returns the
/// identifier of the stored run entity; inspect its `_success` flag for the
/// outcome.
pub fn execute_run(
    store: &EntityStore,
    runtime: &dyn NodeRuntime,
    run_def: RunDef,
    bindings: &mut Bindings,
    logged_in_user: &str,
) -> Result<String> {
    let hash_of_workflow = store.resolve(TableKind::Workflow, &run_def.workflow)?;
    let stored_workflow = store.get_workflow(&hash_of_workflow)?;
    let mut run = RunRecord::instantiate(stored_workflow.entity, &run_def.name, &hash_of_workflow);
    run.add_log(format!("*** workflow {} started ***", run.workflow.name));

    workflow::warn_unbound_channels(store, &run.workflow);

    let order = run.workflow.topological_order.clone().unwrap_or_default();
    let mut result = true;
    for usage_name in &order {
        run.add_log(format!("node: {usage_name}"));
        let usage = run
            .workflow
            .nodes
            .get(usage_name)
            .cloned()
            .ok_or_else(|| {
                FlowError::system(format!("usage {usage_name} missing from workflow copy"))
            })?;
        result = if usage.node.is_some() {
            run_terminal_node(store, runtime, &usage, &mut run, bindings, logged_in_user)?
        } else if usage.workflow.is_some() {
            run_sub_workflow(
                store,
                runtime,
                usage_name,
                &usage,
                &mut run,
                bindings,
                logged_in_user,
            )?
        } else {
            return Err(FlowError::system(format!(
                "usage {usage_name} references neither node nor workflow"
            )));
        };
        if !result {
            break;
        }
    }

    let data_bindings: BTreeMap<String, String> = bindings
        .iter()
        .filter_map(|(channel, binding)| match binding {
            Binding::Data { hash_of_data, .. } => Some((channel.clone(), hash_of_data.clone())),
            Binding::Env { .. } => None,
        })
        .collect();
    info!(number = data_bindings.len(), "data entities bound by run");
    run.channel_bindings = Some(data_bindings);
    run.success = Some(result);
    if result {
        run.add_log(format!(
            "*** workflow {} finished successfully ***",
            run.workflow.name
        ));
    } else {
        run.add_log(format!(
            "*** workflow {} cancelled due to errors ***",
            run.workflow.name
        ));
    }
    store.insert_run(run, logged_in_user)
}

/// A prepared output mount, remembered until after the child exits.
struct PendingOutput {
    wf_channel: String,
    local_path: PathBuf,
    decl: ChannelDecl,
}

fn run_terminal_node(
    store: &EntityStore,
    runtime: &dyn NodeRuntime,
    usage: &NodeUsage,
    run: &mut RunRecord,
    bindings: &mut Bindings,
    logged_in_user: &str,
) -> Result<bool> {
    let node_hash = usage
        .hash_of_node_def
        .as_ref()
        .ok_or_else(|| FlowError::system("node usage without resolved definition"))?;
    let node_def = store.get_node(node_hash)?.entity;

    let mut mounts: Vec<(PathBuf, String)> = Vec::new();
    let mut envvars: Vec<(String, String)> = Vec::new();
    let mut mount_checks: Vec<PathBuf> = Vec::new();

    for (def_channel, wf_channel) in &usage.input {
        let node_channel = node_def.input.get(def_channel).ok_or_else(|| {
            FlowError::system(format!("channel {def_channel} missing from node definition"))
        })?;

        if run.workflow.input.contains_key(wf_channel)
            || run.workflow.connect.contains_key(wf_channel)
        {
            let binding = bindings.get(wf_channel).cloned().ok_or_else(|| {
                FlowError::system(format!("channel {wf_channel} read, but not available"))
            })?;
            match binding {
                Binding::Data { hash_of_data, .. } => {
                    let paths = data::paths_by_hash(store, &hash_of_data)?;
                    attach_data(
                        node_channel,
                        &paths,
                        &mut mounts,
                        &mut envvars,
                        &mut mount_checks,
                    )?;
                }
                Binding::Env { value } => {
                    let var = require_env_var(node_channel)?;
                    envvars.push((var, value));
                }
            }
        } else if let Some(bind_decl) = run.workflow.bind.get(wf_channel) {
            match bind_decl.channel_type {
                ChannelType::File | ChannelType::Directory => {
                    let data_referer = bind_decl.data.as_ref().ok_or_else(|| {
                        FlowError::system(format!("invalid bind declaration for {wf_channel}"))
                    })?;
                    let hash_of_data = store.resolve(TableKind::Data, data_referer)?;
                    let paths = data::paths_by_hash(store, &hash_of_data)?;
                    attach_data(
                        node_channel,
                        &paths,
                        &mut mounts,
                        &mut envvars,
                        &mut mount_checks,
                    )?;
                }
                ChannelType::EnvironmentVar => {
                    let value = bind_decl.environment_var_value.clone().ok_or_else(|| {
                        FlowError::system(format!("invalid bind declaration for {wf_channel}"))
                    })?;
                    let var = require_env_var(node_channel)?;
                    envvars.push((var, value));
                }
            }
        } else {
            return Err(FlowError::system(format!("channel {def_channel} invalid")));
        }
    }

    let mut pending: Vec<PendingOutput> = Vec::new();
    for (def_channel, wf_channel) in &usage.output {
        let decl = run
            .workflow
            .output
            .get(wf_channel)
            .or_else(|| run.workflow.connect.get(wf_channel))
            .cloned()
            .ok_or_else(|| FlowError::system(format!("invalid channel \"{wf_channel}\"")))?;
        let node_channel = node_def.output.get(def_channel).ok_or_else(|| {
            FlowError::system(format!("channel {def_channel} missing from node definition"))
        })?;

        let platform = decl.storage_or_default() == StorageKind::Platform;
        let (local_path, mount_path) = match (platform, decl.channel_type) {
            (true, ChannelType::File) => {
                let (local_dir, mount_dir) = store.create_temp_dir()?;
                let local = local_dir.join(wf_channel);
                prepare_output_file(&local)?;
                (local, mount_dir.join(wf_channel))
            }
            (false, ChannelType::File) => {
                let path = required_user_path(&decl, wf_channel)?;
                prepare_output_file(&path)?;
                (path.clone(), path)
            }
            (false, ChannelType::Directory) => {
                let path = required_user_path(&decl, wf_channel)?;
                std::fs::create_dir_all(&path)?;
                (path.clone(), path)
            }
            _ => {
                return Err(FlowError::system(format!(
                    "invalid combination of \"storage\" and \"type\" for channel \"{wf_channel}\""
                )))
            }
        };

        let paths = data::DataPaths {
            local: local_path.clone(),
            for_mount: mount_path,
        };
        attach_data(
            node_channel,
            &paths,
            &mut mounts,
            &mut envvars,
            &mut mount_checks,
        )?;
        pending.push(PendingOutput {
            wf_channel: wf_channel.clone(),
            local_path,
            decl,
        });
    }

    for path in &mount_checks {
        if !path.is_file() && !path.is_dir() {
            let details = format!(
                "Mount error: {} is not a file or directory (only file and directory mounts are allowed)",
                path.display()
            );
            run.add_log(details.clone());
            return Err(FlowError::system(details));
        }
    }

    let invocation = match &node_def.kind {
        NodeKind::Image { .. } => {
            let image_id = node_def
                .image_id
                .as_ref()
                .ok_or_else(|| FlowError::system("image node without resolved digest"))?;
            runtime.run_image(image_id, &mounts, &envvars)
        }
        NodeKind::Script { .. } => {
            let bash_id = node_def
                .bash_id
                .as_ref()
                .ok_or_else(|| FlowError::system("script node without resolved script"))?;
            let script = data::path_by_hash(store, bash_id)?;
            runtime.run_script(&script, &envvars)
        }
    };

    let result = match invocation {
        Ok(output) => {
            run.add_log(format!("Running command: {}", output.command));
            let stdout = output.stdout.trim();
            if !stdout.is_empty() {
                run.add_log(format!("stdout: {stdout}"));
            }
            let stderr = output.stderr.trim();
            if !stderr.is_empty() {
                run.add_log(format!("stderr: {stderr}"));
            }
            if !output.success {
                run.add_log(format!(
                    "Error: node run failed with return code {}",
                    output
                        .exit_code
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "unknown".to_string())
                ));
            }
            output.success
        }
        // invocation errors are failures of this node, not of the request
        Err(e) => {
            run.add_log(format!("Error: runtime invocation failed: {e}"));
            false
        }
    };

    for output in pending {
        register_output(store, run, bindings, output, logged_in_user);
    }
    run.add_log(format!("node run finished. Success: {result}"));
    Ok(result)
}

/// Capture one produced artifact as a data entry and record its binding.
/// Missing artifacts are logged, never fatal.
fn register_output(
    store: &EntityStore,
    run: &mut RunRecord,
    bindings: &mut Bindings,
    output: PendingOutput,
    logged_in_user: &str,
) {
    let platform = output.decl.storage_or_default() == StorageKind::Platform;
    let data_type = match output.decl.channel_type {
        ChannelType::File => DataType::File,
        ChannelType::Directory => DataType::Directory,
        ChannelType::EnvironmentVar => {
            run.add_log(format!(
                "output channel \"{}\" was not generated and is not saved",
                output.wf_channel
            ));
            return;
        }
    };
    let def = DataDef {
        name: output.wf_channel.clone(),
        data_type,
        storage: if platform {
            StorageKind::Platform
        } else {
            StorageKind::Extern
        },
        // platform outputs carry the real content hash; extern outputs get
        // the random stand-in, creating a new entity per run
        hash: platform,
        format: "any".to_string(),
        user_path: output.local_path.display().to_string(),
    };
    match data::register(store, def, logged_in_user) {
        Ok(hash_of_data) => {
            bindings.insert(
                output.wf_channel,
                Binding::Data {
                    channel_type: output.decl.channel_type,
                    hash_of_data,
                },
            );
        }
        Err(_) => {
            run.add_log(format!(
                "output channel \"{}\" was not generated and is not saved",
                output.wf_channel
            ));
        }
    }
}

fn run_sub_workflow(
    store: &EntityStore,
    runtime: &dyn NodeRuntime,
    usage_name: &str,
    usage: &NodeUsage,
    run: &mut RunRecord,
    super_bindings: &mut Bindings,
    logged_in_user: &str,
) -> Result<bool> {
    let mut sub_bindings = Bindings::new();

    // project the enclosing bindings into the sub-workflow's channel space
    for (sub_channel, wf_channel) in &usage.input {
        if run.workflow.input.contains_key(wf_channel)
            || run.workflow.connect.contains_key(wf_channel)
        {
            let binding = super_bindings.get(wf_channel).cloned().ok_or_else(|| {
                FlowError::system(format!("channel {wf_channel} read, but not available"))
            })?;
            sub_bindings.insert(sub_channel.clone(), binding);
        } else {
            return Err(FlowError::system(format!(
                "no binding for channel {wf_channel}"
            )));
        }
    }

    let workflow_referer = usage
        .workflow
        .clone()
        .ok_or_else(|| FlowError::system("sub workflow usage without referer"))?;
    let sub_run_hash = execute_run(
        store,
        runtime,
        RunDef {
            name: usage_name.to_string(),
            workflow: workflow_referer,
        },
        &mut sub_bindings,
        logged_in_user,
    )?;
    let sub_run = store.get_run(&sub_run_hash)?;
    let result = sub_run.entity.success.unwrap_or(false);

    // project outputs back into the enclosing channel space
    for (sub_channel, wf_channel) in &usage.output {
        if super_bindings.contains_key(wf_channel) {
            return Err(FlowError::system(format!(
                "output channel {wf_channel} written twice"
            )));
        }
        match sub_bindings.get(sub_channel) {
            Some(binding) => {
                super_bindings.insert(wf_channel.clone(), binding.clone());
            }
            // a failed sub-run may legitimately not have produced its
            // outputs; the walk breaks right after
            None if !result => {}
            None => {
                return Err(FlowError::system(format!(
                    "channel {sub_channel} not produced by sub workflow"
                )))
            }
        }
    }

    run.add_log(format!(
        "sub workflow \"{usage_name}\" finished. Result: {result}, Hash: {}",
        store.shrink_hash(&sub_run_hash)
    ));
    Ok(result)
}

/// Route a file/directory source into the invocation: a mount when the node
/// channel declares an in-container path, an environment variable carrying
/// the host path when it declares a variable name (script nodes).
fn attach_data(
    node_channel: &NodeChannel,
    paths: &data::DataPaths,
    mounts: &mut Vec<(PathBuf, String)>,
    envvars: &mut Vec<(String, String)>,
    mount_checks: &mut Vec<PathBuf>,
) -> Result<()> {
    if let Some(container_path) = &node_channel.path_in_container {
        mounts.push((paths.for_mount.clone(), container_path.clone()));
        mount_checks.push(paths.local.clone());
        Ok(())
    } else if let Some(var) = &node_channel.environment_var_in_container {
        envvars.push((var.clone(), paths.local.display().to_string()));
        Ok(())
    } else {
        Err(FlowError::system(
            "channel has neither mount target nor environment variable",
        ))
    }
}

fn require_env_var(node_channel: &NodeChannel) -> Result<String> {
    node_channel
        .environment_var_in_container
        .clone()
        .ok_or_else(|| FlowError::system("channel has no environment variable name"))
}

fn required_user_path(decl: &ChannelDecl, wf_channel: &str) -> Result<PathBuf> {
    let path = decl.user_path.as_ref().ok_or_else(|| {
        FlowError::system(format!("channel \"{wf_channel}\" has no user_path"))
    })?;
    Ok(data::absolutize(Path::new(path)))
}

/// Create an empty, writable output file if none exists yet.
fn prepare_output_file(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::File::create(path)?;
    }
    workspace::set_file_writable(path);
    Ok(())
}
