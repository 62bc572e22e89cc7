// Data registry

//! Registration of files and directories as content or path-referenced data
//! entries, plus resolution of a stored entry to its on-disk location.
//!
//! Path rules: absolute paths must match the host OS shape (drive letter on
//! Windows, leading `/` elsewhere); relative paths resolve against the
//! configured base directory. When the platform itself runs in a container,
//! only absolute paths under `/temp_dir/` are accepted and extern storage is
//! rejected entirely.

use std::path::{Path, PathBuf};

use crate::models::{parse_descriptor, DataDef, DataEntry, DataType, StorageKind};
use crate::store::{hash, workspace, EntityStore, HostOs, StoreContext};
use crate::{FlowError, Result};

/// Local and mount-side location of a data entry's bytes. The two differ only
/// when the platform runs containerized and mount sources are resolved by the
/// host daemon.
#[derive(Debug, Clone)]
pub struct DataPaths {
    pub local: PathBuf,
    pub for_mount: PathBuf,
}

/// Register a data entry from a client descriptor.
pub fn add_data(
    store: &EntityStore,
    param: serde_json::Value,
    logged_in_user: &str,
) -> Result<String> {
    let def: DataDef = parse_descriptor(param, "data_def")?;
    register(store, def, logged_in_user)
}

/// Register a data entry from an already-typed descriptor (also used by the
/// run executor to capture produced artifacts).
pub fn register(store: &EntityStore, def: DataDef, logged_in_user: &str) -> Result<String> {
    let ctx = store.ctx();
    let user_path = resolve_user_path(ctx, &def.user_path)?;

    if ctx.in_container && def.storage == StorageKind::Extern {
        return Err(FlowError::system(
            "extern storage not supported when running in a container",
        ));
    }

    let store_in_platform = def.storage == StorageKind::Platform;
    let use_content_hash = def.hash;

    if def.data_type == DataType::Directory && (store_in_platform || use_content_hash) {
        return Err(FlowError::DirectoryRestriction {
            path: user_path.display().to_string(),
        });
    }

    let mut entry: DataEntry = def.into_entry();

    let content_hash = if use_content_hash {
        let content_hash = hash::blob_hash_of_file(&user_path)?;
        entry.hash_of_content = Some(content_hash.clone());
        content_hash
    } else {
        // random stand-in, so re-registrations stay distinct
        hash::random_sha1()
    };

    if store_in_platform {
        store_blob(&ctx.data_dir, &content_hash, &user_path)?;
        entry.path = Some(content_hash);
    } else {
        entry.path = Some(user_path.display().to_string());
    }

    store.insert_data(entry, logged_in_user)
}

/// On-disk location of a stored data entry, with existence verified.
pub fn paths_by_hash(store: &EntityStore, data_hash: &str) -> Result<DataPaths> {
    let ctx = store.ctx();
    let data = store.get_data(data_hash)?.entity;
    let internal_path = data.path.as_deref().ok_or_else(|| {
        FlowError::system(format!("data entry {data_hash} has no recorded path"))
    })?;

    match data.storage {
        StorageKind::Extern => {
            if ctx.in_container {
                return Err(FlowError::system(
                    "extern storage not supported when running in a container",
                ));
            }
            let path = PathBuf::from(internal_path);
            if path.exists() {
                return Ok(DataPaths {
                    local: path.clone(),
                    for_mount: path,
                });
            }
        }
        StorageKind::Platform => {
            let local = ctx.data_dir.join(internal_path);
            if local.exists() {
                let for_mount = match (&ctx.data_dir_for_mount, ctx.in_container) {
                    (Some(host_dir), true) => host_dir.join(internal_path),
                    _ => local.clone(),
                };
                return Ok(DataPaths { local, for_mount });
            }
        }
    }
    Err(FlowError::NotFound {
        kind: "data definition".to_string(),
        name: data_hash.to_string(),
    })
}

/// Local path of a stored data entry (no mount translation).
pub fn path_by_hash(store: &EntityStore, data_hash: &str) -> Result<PathBuf> {
    Ok(paths_by_hash(store, data_hash)?.local)
}

/// Resolve a user-supplied path: absolute paths are used verbatim after a
/// host-OS shape check, relative paths resolve against the base directory.
pub fn resolve_user_path(ctx: &StoreContext, user_path: &str) -> Result<PathBuf> {
    if is_absolute_path(ctx, user_path)? {
        Ok(absolutize(Path::new(user_path)))
    } else {
        let base_dir = ctx
            .base_dir
            .as_ref()
            .ok_or_else(|| FlowError::system("no base directory configured for relative paths"))?;
        Ok(base_dir.join(user_path))
    }
}

/// Host-OS aware absolute-path check with the container restrictions applied.
fn is_absolute_path(ctx: &StoreContext, path: &str) -> Result<bool> {
    let has_drive_letter = path.len() >= 2
        && path.as_bytes()[1] == b':'
        && path.as_bytes()[0].is_ascii_alphabetic();

    if has_drive_letter {
        return match ctx.host_os {
            HostOs::Windows if ctx.in_container => Err(FlowError::system(
                "no absolute paths when running in a container",
            )),
            HostOs::Windows => Ok(true),
            HostOs::Linux => Err(FlowError::system("windows path, but host is not windows")),
        };
    }
    if path.starts_with('/') {
        if ctx.in_container {
            return if path.starts_with("/temp_dir/") {
                Ok(true)
            } else {
                Err(FlowError::system(
                    "no absolute paths when running in a container",
                ))
            };
        }
        return match ctx.host_os {
            HostOs::Windows => Err(FlowError::system("linux path, but host is not linux")),
            HostOs::Linux => Ok(true),
        };
    }
    Ok(false)
}

/// Copy a file into the data directory under its content hash. Already-stored
/// content is left untouched (physical dedup); the blob is made read-only.
fn store_blob(data_dir: &Path, content_hash: &str, source: &Path) -> Result<()> {
    let dest = data_dir.join(content_hash);
    if dest.exists() {
        return Ok(());
    }
    std::fs::copy(source, &dest).map_err(|_| FlowError::NotFound {
        kind: "file".to_string(),
        name: content_hash.to_string(),
    })?;
    workspace::set_file_readonly(&dest);
    Ok(())
}

pub(crate) fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}
