// Configuration - layered TOML file + environment overrides

//! Settings are loaded from a TOML file (default `./flowforge.toml`) with
//! `FLOWFORGE_`-prefixed environment variables layered on top
//! (`FLOWFORGE_SERVER__PORT=9090` overrides `[server] port`). When the
//! platform itself runs inside a container the store paths are fixed to the
//! conventional mount points and the host-side mount prefixes come from the
//! environment.

use std::path::PathBuf;

use serde::Deserialize;

use crate::store::{HostOs, StoreContext};

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSettings {
    pub entity_store: String,
    pub data_dir: String,
    pub temp_dir: String,
    pub base_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
    pub file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSettings {
    /// Shell used to execute script nodes.
    pub bash: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub store: StoreSettings,
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub tools: ToolsSettings,
}

impl Settings {
    /// Load settings: defaults, then the TOML file (if present), then
    /// environment overrides.
    pub fn load(config_file: &str) -> anyhow::Result<Settings> {
        let settings = config::Config::builder()
            .set_default("store.entity_store", "./datastore/entity_store")?
            .set_default("store.data_dir", "./datastore/data_dir")?
            .set_default("store.temp_dir", "./datastore/temp_dir")?
            .set_default("store.base_dir", "./datastore/base_dir")?
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("logging.level", "info")?
            .set_default("tools.bash", "/bin/bash")?
            .add_source(config::File::with_name(config_file).required(false))
            .add_source(config::Environment::with_prefix("FLOWFORGE").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Derive the store context. Containerized processes use the
    /// conventional mount points and read the host-side mount prefixes from
    /// the environment.
    pub fn store_context(&self) -> StoreContext {
        let in_container = StoreContext::detect_container();
        if in_container {
            StoreContext {
                entity_store: PathBuf::from("/entity_store"),
                data_dir: PathBuf::from("/data_dir"),
                temp_dir: PathBuf::from("/temp_dir"),
                base_dir: Some(PathBuf::from("/base_dir")),
                data_dir_for_mount: std::env::var("FLOWFORGE_DATA_DIR_HOST")
                    .ok()
                    .map(PathBuf::from),
                temp_dir_for_mount: std::env::var("FLOWFORGE_TEMP_DIR_HOST")
                    .ok()
                    .map(PathBuf::from),
                host_os: HostOs::Linux,
                in_container,
            }
        } else {
            StoreContext {
                entity_store: PathBuf::from(&self.store.entity_store),
                data_dir: PathBuf::from(&self.store.data_dir),
                temp_dir: PathBuf::from(&self.store.temp_dir),
                base_dir: self.store.base_dir.as_ref().map(PathBuf::from),
                data_dir_for_mount: None,
                temp_dir_for_mount: None,
                host_os: HostOs::detect(),
                in_container,
            }
        }
    }
}
