// View/query - read-side projections over the entity tables

//! Projects a table to a 2D array of string cells with a table-specific
//! column list, optionally filtered by a regex over each entity's JSON
//! serialization and clipped to a row limit. Rows are ordered newest first.
//! Also: content fetch (with extern-hash verification) and file export.

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::models::Referer;
use crate::store::{hash, EntityStore, TableKind};
use crate::{FlowError, Result};

/// How a column value is rendered.
enum ColumnFormat {
    /// Stringify the raw value (objects render as their key list).
    Plain,
    /// Shrink an identifier to its unique prefix.
    Shrink,
    /// Render an image reference as `name:version`.
    Image,
}

/// Column list per table. `_HASH_` is the table key itself.
fn columns(kind: TableKind) -> &'static [(&'static str, ColumnFormat)] {
    use ColumnFormat::*;
    match kind {
        TableKind::User => &[("name", Plain), ("display_name", Plain), ("su", Plain)],
        TableKind::Data => &[
            ("_HASH_", Shrink),
            ("name", Plain),
            ("_version", Plain),
            ("type", Plain),
            ("storage", Plain),
            ("hash", Plain),
            ("user_path", Plain),
            ("_hash_of_content", Shrink),
        ],
        TableKind::Node => &[
            ("name", Plain),
            ("_version", Plain),
            ("image", Image),
            ("input", Plain),
            ("output", Plain),
        ],
        TableKind::Workflow => &[
            ("_HASH_", Shrink),
            ("name", Plain),
            ("_version", Plain),
            ("input", Plain),
            ("output", Plain),
            ("_topological_order", Plain),
        ],
        TableKind::Run => &[
            ("_HASH_", Shrink),
            ("name", Plain),
            ("_version", Plain),
            ("_success", Plain),
            ("_topological_order", Plain),
        ],
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(u64),
    Text(String),
}

#[derive(Debug, Clone, Deserialize)]
struct ViewParam {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    pattern: Option<String>,
    #[serde(default)]
    limit: Option<NumberOrText>,
}

/// Project a table into `{"table": [[cells...]]}`.
pub fn view_table(store: &EntityStore, param: Value) -> Result<Value> {
    let param: ViewParam = crate::models::parse_descriptor(param, "view_def")?;
    let kind = match param.name.as_deref().unwrap_or("run") {
        "user" => TableKind::User,
        "data" => TableKind::Data,
        "node" => TableKind::Node,
        "workflow" => TableKind::Workflow,
        "run" => TableKind::Run,
        _ => return Err(FlowError::InvalidCommand),
    };
    let pattern = match &param.pattern {
        Some(p) => Some(Regex::new(p).map_err(|e| FlowError::Validation {
            definition_of: "view_def".to_string(),
            error: e.to_string(),
        })?),
        None => None,
    };
    let limit = match param.limit {
        Some(NumberOrText::Number(n)) => Some(n as usize),
        Some(NumberOrText::Text(t)) => {
            Some(t.parse::<usize>().map_err(|_| FlowError::InvalidCommand)?)
        }
        None => None,
    };

    let specs = columns(kind);
    let header: Vec<String> = specs
        .iter()
        .map(|(key, _)| key.trim_start_matches('_').to_lowercase())
        .collect();

    let mut rows: Vec<(String, Vec<String>)> = Vec::new();
    for (entity_hash, value) in store.snapshot_values(kind) {
        if let Some(pattern) = &pattern {
            let serialized = serde_json::to_string(&value)?;
            if !pattern.is_match(&serialized) {
                continue;
            }
        }
        let mut row = Vec::with_capacity(specs.len());
        for (key, format) in specs {
            let cell = if *key == "_HASH_" {
                store.shrink_hash(&entity_hash)
            } else {
                match (value.get(key), format) {
                    (None, _) => String::new(),
                    (Some(v), ColumnFormat::Shrink) => {
                        store.shrink_hash(v.as_str().unwrap_or_default())
                    }
                    (Some(v), ColumnFormat::Image) => format!(
                        "{}:{}",
                        v.get("name").and_then(Value::as_str).unwrap_or("---"),
                        v.get("version").and_then(Value::as_str).unwrap_or("---")
                    ),
                    (Some(v), ColumnFormat::Plain) => cell_to_string(v),
                }
            };
            row.push(cell);
        }
        let date = value
            .get("_date")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        rows.push((date, row));
    }

    // newest first
    rows.sort_by(|a, b| b.0.cmp(&a.0));
    let mut table = vec![header];
    for (_, row) in rows.into_iter().take(limit.unwrap_or(usize::MAX)) {
        table.push(row);
    }
    Ok(json!({ "table": table }))
}

fn cell_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(map) => {
            let keys: Vec<&String> = map.keys().collect();
            format!("{keys:?}")
        }
        other => other.to_string(),
    }
}

/// Fetch the text content of a registered file:
/// `{"success", "name", "version", "hash", "content"}`. Extern entries with a
/// recorded content hash are verified against the bytes on disk.
pub fn get_data(store: &EntityStore, param: Value) -> Result<Value> {
    let referer: Referer = crate::models::parse_descriptor(param, "referer")?;
    let data_hash = store.resolve(TableKind::Data, &referer)?;
    let stored = store.get_data(&data_hash)?;
    let entry = &stored.entity;

    let internal_path = entry
        .path
        .as_deref()
        .ok_or_else(|| FlowError::system(format!("data entry {data_hash} has no recorded path")))?;
    let in_platform = entry.storage == crate::models::StorageKind::Platform;
    let path: PathBuf = if in_platform {
        store.ctx().data_dir.join(internal_path)
    } else {
        PathBuf::from(internal_path)
    };

    // platform blobs are read-only and named by their hash; only extern
    // content can drift and needs re-verification
    if entry.hash && !in_platform {
        let recorded = entry.hash_of_content.as_deref().unwrap_or_default();
        let actual = hash::blob_hash_of_file(&path)?;
        if actual != recorded {
            return Err(FlowError::HashMismatch {
                path: path.display().to_string(),
            });
        }
    }

    if !path.is_file() {
        return Err(FlowError::NoFileOrNotFound {
            name: path.display().to_string(),
        });
    }
    let content = std::fs::read_to_string(&path)?;
    Ok(json!({
        "success": true,
        "name": entry.name,
        "version": stored.version,
        "hash": store.shrink_hash(&data_hash),
        "content": content
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct ExportParam {
    #[serde(flatten)]
    referer: Referer,
    #[serde(default)]
    to: Option<String>,
}

/// Copy a registered file's content to a caller-supplied destination path.
pub fn export(store: &EntityStore, param: Value) -> Result<()> {
    let param: ExportParam = crate::models::parse_descriptor(param, "export_def")?;
    let target = param.to.ok_or(FlowError::InvalidCommand)?;
    let data_hash = store.resolve(TableKind::Data, &param.referer)?;
    let entry = store.get_data(&data_hash)?.entity;

    let source = Path::new(&entry.user_path);
    if !source.is_file() {
        return Err(FlowError::NoFileOrNotFound {
            name: entry.user_path.clone(),
        });
    }
    let target = PathBuf::from(target);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(source, &target)?;
    Ok(())
}

/// Resolve a referer against the workflow table first, then the run table.
fn workflow_or_run(store: &EntityStore, referer: &Referer) -> Result<(String, Value)> {
    if let Ok(entity_hash) = store.resolve(TableKind::Workflow, referer) {
        let value = serde_json::to_value(store.get_workflow(&entity_hash)?)?;
        return Ok((entity_hash, value));
    }
    if let Ok(entity_hash) = store.resolve(TableKind::Run, referer) {
        let value = serde_json::to_value(store.get_run(&entity_hash)?)?;
        return Ok((entity_hash, value));
    }
    Err(FlowError::NotFound {
        kind: "workflow or run".to_string(),
        name: referer.to_string(),
    })
}

/// The data entries referenced by a workflow or run, as a 2D table.
pub fn view_data_of(store: &EntityStore, param: Value) -> Result<Value> {
    let referer: Referer = crate::models::parse_descriptor(param, "referer")?;
    let (entity_hash, value) = workflow_or_run(store, &referer)?;

    let mut table = vec![vec![
        "hash".to_string(),
        "name in data table".to_string(),
        "version".to_string(),
        "data ...".to_string(),
    ]];
    let empty = serde_json::Map::new();
    let channel_bindings = value
        .get("_channel_bindings")
        .and_then(Value::as_object)
        .unwrap_or(&empty);
    if let Some(nodes) = value.get("nodes").and_then(Value::as_object) {
        for (usage_name, usage) in nodes {
            let outputs = usage.get("output").and_then(Value::as_object);
            for (def_channel, wf_channel) in outputs.into_iter().flatten() {
                let Some(wf_channel) = wf_channel.as_str() else {
                    continue;
                };
                if let Some(data_hash) = channel_bindings.get(wf_channel).and_then(Value::as_str) {
                    if let Ok(stored) = store.get_data(data_hash) {
                        table.push(vec![
                            store.shrink_hash(data_hash),
                            stored.entity.name.clone(),
                            stored.version.to_string(),
                            format!(
                                "output of channel \"{def_channel}\" of node \"{usage_name}\""
                            ),
                        ]);
                    }
                }
            }
        }
    }

    Ok(json!({
        "name": value.get("name"),
        "_version": value.get("_version"),
        "hash": store.shrink_hash(&entity_hash),
        "table": table
    }))
}

/// The log of a run (empty for entities that never ran).
pub fn view_log_of(store: &EntityStore, param: Value) -> Result<Value> {
    let referer: Referer = crate::models::parse_descriptor(param, "referer")?;
    let (entity_hash, value) = workflow_or_run(store, &referer)?;
    let log = value.get("_log").cloned().unwrap_or_else(|| json!([]));
    Ok(json!({
        "name": value.get("name"),
        "_version": value.get("_version"),
        "hash": store.shrink_hash(&entity_hash),
        "log": log
    }))
}
