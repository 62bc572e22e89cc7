// The entity store - five content-addressed tables with JSON persistence

//! The store owns five maps (user, data, node, workflow, run), each keyed by
//! entity identifier. Insertion stamps the bookkeeping attributes (version,
//! timestamp, creating user), computes the identifier from the finalized
//! entity, and invalidates the cached unique-prefix length.
//!
//! ## Concurrency
//!
//! All tables live behind one `RwLock`: insertions and unique-prefix
//! recomputation take the write lock, lookups take the read lock for the
//! duration of a single operation, and every result is cloned out of the
//! guard. The lock is never held across file copies, image pulls, or child
//! processes; only table persistence dumps the maps while holding the lock.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use super::{hash, workspace};
use crate::models::{
    DataEntry, NodeDef, Referer, RunRecord, Stored, User, VersionSelector, WorkflowDef,
};
use crate::{FlowError, Result};

/// Host operating system, as far as path shapes and script support are
/// concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOs {
    Linux,
    Windows,
}

impl HostOs {
    /// Derived from the process environment; `HOST_OPERATING_SYSTEM`
    /// overrides the compile target.
    pub fn detect() -> Self {
        match std::env::var("HOST_OPERATING_SYSTEM").ok().as_deref() {
            Some("windows") => HostOs::Windows,
            Some(_) => HostOs::Linux,
            None if cfg!(target_os = "windows") => HostOs::Windows,
            None => HostOs::Linux,
        }
    }
}

/// Directories and host facts the store and the engine operate against.
#[derive(Debug, Clone)]
pub struct StoreContext {
    /// Where the five table JSON files live.
    pub entity_store: PathBuf,
    /// Content-addressed file blobs (filename = 40-hex SHA-1).
    pub data_dir: PathBuf,
    /// Per-output scratch directories.
    pub temp_dir: PathBuf,
    /// Resolution base for relative user paths.
    pub base_dir: Option<PathBuf>,
    /// Host-side path of `data_dir` when the platform itself runs inside a
    /// container and mounts must be resolved by the host daemon.
    pub data_dir_for_mount: Option<PathBuf>,
    /// Host-side path of `temp_dir`, same purpose.
    pub temp_dir_for_mount: Option<PathBuf>,
    pub host_os: HostOs,
    pub in_container: bool,
}

impl StoreContext {
    pub fn detect_container() -> bool {
        Path::new("/.dockerenv").exists() || std::env::var("FLOWFORGE_IN_CONTAINER").is_ok()
    }
}

/// The five tables this store manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    User,
    Data,
    Node,
    Workflow,
    Run,
}

impl TableKind {
    pub const ALL: [TableKind; 5] = [
        TableKind::User,
        TableKind::Data,
        TableKind::Node,
        TableKind::Workflow,
        TableKind::Run,
    ];

    /// Base name of the persisted JSON file.
    pub fn file_name(&self) -> &'static str {
        match self {
            TableKind::User => "user",
            TableKind::Data => "data",
            TableKind::Node => "node",
            TableKind::Workflow => "workflow",
            TableKind::Run => "run",
        }
    }

    /// Human-readable entity kind for NOT_FOUND reports.
    pub fn entity_kind(&self) -> &'static str {
        match self {
            TableKind::User => "user",
            TableKind::Data => "data definition",
            TableKind::Node => "node definition",
            TableKind::Workflow => "workflow definition",
            TableKind::Run => "run definition",
        }
    }
}

/// Entities that carry a table-unique name for versioning.
pub trait Named {
    fn entity_name(&self) -> &str;
}

impl Named for User {
    fn entity_name(&self) -> &str {
        &self.name
    }
}

impl Named for DataEntry {
    fn entity_name(&self) -> &str {
        &self.name
    }
}

impl Named for NodeDef {
    fn entity_name(&self) -> &str {
        &self.name
    }
}

impl Named for WorkflowDef {
    fn entity_name(&self) -> &str {
        &self.name
    }
}

impl Named for RunRecord {
    fn entity_name(&self) -> &str {
        &self.workflow.name
    }
}

type Table<T> = BTreeMap<String, Stored<T>>;

#[derive(Default)]
struct Tables {
    user: Table<User>,
    data: Table<DataEntry>,
    node: Table<NodeDef>,
    workflow: Table<WorkflowDef>,
    run: Table<RunRecord>,

    /// Cached smallest even prefix length >= 6 that separates every live
    /// identifier. `None` means "recompute on next read".
    min_unique_prefix: Option<usize>,
    last_reported_prefix: Option<usize>,
}

/// The process-wide entity store.
pub struct EntityStore {
    ctx: StoreContext,
    tables: RwLock<Tables>,
}

impl EntityStore {
    /// Open the store: verify the configured directories exist and load the
    /// persisted tables. A missing table file starts that table empty;
    /// malformed JSON is a hard error.
    pub fn open(ctx: StoreContext) -> Result<Self> {
        for (label, dir) in [
            ("entity_store", &ctx.entity_store),
            ("data_dir", &ctx.data_dir),
            ("temp_dir", &ctx.temp_dir),
        ] {
            if !dir.is_dir() {
                return Err(FlowError::system(format!(
                    "{label} directory does not exist: {}",
                    dir.display()
                )));
            }
        }

        let tables = Tables {
            user: load_table(&ctx.entity_store, TableKind::User)?,
            data: load_table(&ctx.entity_store, TableKind::Data)?,
            node: load_table(&ctx.entity_store, TableKind::Node)?,
            workflow: load_table(&ctx.entity_store, TableKind::Workflow)?,
            run: load_table(&ctx.entity_store, TableKind::Run)?,
            min_unique_prefix: None,
            last_reported_prefix: None,
        };

        Ok(EntityStore {
            ctx,
            tables: RwLock::new(tables),
        })
    }

    pub fn ctx(&self) -> &StoreContext {
        &self.ctx
    }

    /// Serialize every table to its JSON file (sorted keys, 4-space indent).
    /// Files are made writable before the write and read-only after.
    pub fn persist(&self) -> Result<()> {
        let tables = self.tables.read().unwrap();
        persist_table(&self.ctx.entity_store, TableKind::User, &tables.user)?;
        persist_table(&self.ctx.entity_store, TableKind::Data, &tables.data)?;
        persist_table(&self.ctx.entity_store, TableKind::Node, &tables.node)?;
        persist_table(&self.ctx.entity_store, TableKind::Workflow, &tables.workflow)?;
        persist_table(&self.ctx.entity_store, TableKind::Run, &tables.run)?;
        Ok(())
    }

    /// Every authenticated operation asserts its token is a key in the user
    /// table.
    pub fn assert_user_exists(&self, token: &str) -> Result<()> {
        let tables = self.tables.read().unwrap();
        if tables.user.contains_key(token) {
            Ok(())
        } else {
            Err(FlowError::NoUserLoggedIn)
        }
    }

    pub fn insert_user(&self, user: User, creating_user: &str) -> Result<String> {
        let mut tables = self.tables.write().unwrap();
        let hash = enrich_and_store(&mut tables.user, user, creating_user)?;
        tables.min_unique_prefix = None;
        Ok(hash)
    }

    pub fn insert_data(&self, data: DataEntry, creating_user: &str) -> Result<String> {
        let mut tables = self.tables.write().unwrap();
        let hash = enrich_and_store(&mut tables.data, data, creating_user)?;
        tables.min_unique_prefix = None;
        Ok(hash)
    }

    pub fn insert_node(&self, node: NodeDef, creating_user: &str) -> Result<String> {
        let mut tables = self.tables.write().unwrap();
        let hash = enrich_and_store(&mut tables.node, node, creating_user)?;
        tables.min_unique_prefix = None;
        Ok(hash)
    }

    pub fn insert_workflow(&self, workflow: WorkflowDef, creating_user: &str) -> Result<String> {
        let mut tables = self.tables.write().unwrap();
        let hash = enrich_and_store(&mut tables.workflow, workflow, creating_user)?;
        tables.min_unique_prefix = None;
        Ok(hash)
    }

    pub fn insert_run(&self, run: RunRecord, creating_user: &str) -> Result<String> {
        let mut tables = self.tables.write().unwrap();
        let hash = enrich_and_store(&mut tables.run, run, creating_user)?;
        tables.min_unique_prefix = None;
        Ok(hash)
    }

    pub fn get_user(&self, hash: &str) -> Result<Stored<User>> {
        let tables = self.tables.read().unwrap();
        get_cloned(&tables.user, TableKind::User, hash)
    }

    pub fn get_data(&self, hash: &str) -> Result<Stored<DataEntry>> {
        let tables = self.tables.read().unwrap();
        get_cloned(&tables.data, TableKind::Data, hash)
    }

    pub fn get_node(&self, hash: &str) -> Result<Stored<NodeDef>> {
        let tables = self.tables.read().unwrap();
        get_cloned(&tables.node, TableKind::Node, hash)
    }

    pub fn get_workflow(&self, hash: &str) -> Result<Stored<WorkflowDef>> {
        let tables = self.tables.read().unwrap();
        get_cloned(&tables.workflow, TableKind::Workflow, hash)
    }

    pub fn get_run(&self, hash: &str) -> Result<Stored<RunRecord>> {
        let tables = self.tables.read().unwrap();
        get_cloned(&tables.run, TableKind::Run, hash)
    }

    /// Resolve a referer to the full identifier it denotes within one table.
    pub fn resolve(&self, kind: TableKind, referer: &Referer) -> Result<String> {
        let tables = self.tables.read().unwrap();
        match kind {
            TableKind::User => resolve_in(&tables.user, kind, referer),
            TableKind::Data => resolve_in(&tables.data, kind, referer),
            TableKind::Node => resolve_in(&tables.node, kind, referer),
            TableKind::Workflow => resolve_in(&tables.workflow, kind, referer),
            TableKind::Run => resolve_in(&tables.run, kind, referer),
        }
    }

    /// The smallest even prefix length >= 6 that separates every live entity
    /// identifier and recorded content hash. Recomputed lazily after inserts.
    pub fn min_unique_prefix_length(&self) -> usize {
        let mut tables = self.tables.write().unwrap();
        if let Some(length) = tables.min_unique_prefix {
            return length;
        }
        let hashes = collect_hashes(&tables);
        let raw = hash::min_unique_prefix_length(hashes.iter().map(|s| s.as_str()));
        let clamped = raw.max(6);
        let length = if clamped % 2 == 0 { clamped } else { clamped + 1 };
        if tables.last_reported_prefix != Some(length) {
            info!(number = length, "hex digits needed for unique identifiers");
            tables.last_reported_prefix = Some(length);
        }
        tables.min_unique_prefix = Some(length);
        length
    }

    /// Shortest unique prefix of an identifier for display.
    pub fn shrink_hash(&self, hash: &str) -> String {
        if hash.is_empty() {
            return "---".to_string();
        }
        let length = self.min_unique_prefix_length();
        hash.chars().take(length).collect()
    }

    /// Serialize a whole table for the read-side view projections.
    pub fn snapshot_values(&self, kind: TableKind) -> Vec<(String, serde_json::Value)> {
        let tables = self.tables.read().unwrap();
        match kind {
            TableKind::User => snapshot(&tables.user),
            TableKind::Data => snapshot(&tables.data),
            TableKind::Node => snapshot(&tables.node),
            TableKind::Workflow => snapshot(&tables.workflow),
            TableKind::Run => snapshot(&tables.run),
        }
    }

    /// Allocate a fresh scratch directory under `temp_dir`. Returns the local
    /// path and the path to use in mount arguments (they differ when the
    /// platform itself runs containerized).
    pub fn create_temp_dir(&self) -> Result<(PathBuf, PathBuf)> {
        workspace::create_temp_directory(
            &self.ctx.temp_dir,
            self.ctx.temp_dir_for_mount.as_deref(),
            self.ctx.in_container,
        )
    }

    /// Remove every scratch directory under `temp_dir` (process shutdown).
    pub fn remove_temp_directories(&self) -> Result<()> {
        workspace::remove_all_temp_directories(&self.ctx.temp_dir)
    }
}

/// Stamp the bookkeeping attributes, compute the identifier, insert.
///
/// If an entity with the same creator and identical descriptor content is
/// already stored, its identifier is returned unchanged - re-registration is
/// idempotent and version sequences stay gap-free.
fn enrich_and_store<T>(table: &mut Table<T>, entity: T, creating_user: &str) -> Result<String>
where
    T: Named + Serialize + PartialEq,
{
    for (existing_hash, stored) in table.iter() {
        if stored.hash_of_creating_user == creating_user && stored.entity == entity {
            return Ok(existing_hash.clone());
        }
    }
    let version = next_free_version(table, entity.entity_name());
    let stored = Stored {
        entity,
        version,
        date: timestamp(),
        hash_of_creating_user: creating_user.to_string(),
    };
    let hash = hash::blob_hash_of_json(&stored)?;
    table.insert(hash.clone(), stored);
    Ok(hash)
}

/// Next free version for a name: one past the highest stored version.
fn next_free_version<T: Named>(table: &Table<T>, name: &str) -> u32 {
    table
        .values()
        .filter(|stored| stored.entity.entity_name() == name)
        .map(|stored| stored.version)
        .max()
        .unwrap_or(0)
        + 1
}

fn get_cloned<T: Clone>(table: &Table<T>, kind: TableKind, hash: &str) -> Result<Stored<T>> {
    table.get(hash).cloned().ok_or_else(|| FlowError::NotFound {
        kind: kind.entity_kind().to_string(),
        name: hash.to_string(),
    })
}

fn resolve_in<T: Named>(table: &Table<T>, kind: TableKind, referer: &Referer) -> Result<String> {
    match referer {
        Referer::NameVersion(r) => {
            find_by_name_version(table, &r.name, r.version).ok_or_else(|| FlowError::NotFound {
                kind: kind.entity_kind().to_string(),
                name: r.name.clone(),
            })
        }
        Referer::Hash(r) => find_by_prefix(table, &r.hash),
    }
}

fn find_by_name_version<T: Named>(
    table: &Table<T>,
    name: &str,
    version: VersionSelector,
) -> Option<String> {
    let mut latest: Option<(u32, &String)> = None;
    for (hash, stored) in table.iter() {
        if stored.entity.entity_name() != name {
            continue;
        }
        if let VersionSelector::Number(wanted) = version {
            if stored.version == wanted {
                return Some(hash.clone());
            }
        }
        if latest.map_or(true, |(v, _)| stored.version > v) {
            latest = Some((stored.version, hash));
        }
    }
    match version {
        VersionSelector::Latest => latest.map(|(_, hash)| hash.clone()),
        VersionSelector::Number(_) => None,
    }
}

/// Unique-prefix resolution: zero matches and multiple matches are errors.
fn find_by_prefix<T>(table: &Table<T>, prefix: &str) -> Result<String> {
    let mut matches = table.keys().filter(|hash| hash.starts_with(prefix));
    match (matches.next(), matches.next()) {
        (Some(hash), None) => Ok(hash.clone()),
        _ => Err(FlowError::InvalidHash {
            prefix: prefix.to_string(),
        }),
    }
}

fn snapshot<T: Serialize>(table: &Table<T>) -> Vec<(String, serde_json::Value)> {
    table
        .iter()
        .filter_map(|(hash, stored)| {
            serde_json::to_value(stored)
                .ok()
                .map(|value| (hash.clone(), value))
        })
        .collect()
}

/// All live identifiers plus the recorded content hashes of data entities.
fn collect_hashes(tables: &Tables) -> BTreeSet<String> {
    let mut hashes: BTreeSet<String> = BTreeSet::new();
    hashes.extend(tables.user.keys().cloned());
    hashes.extend(tables.data.keys().cloned());
    hashes.extend(tables.node.keys().cloned());
    hashes.extend(tables.workflow.keys().cloned());
    hashes.extend(tables.run.keys().cloned());
    for stored in tables.data.values() {
        if let Some(content_hash) = &stored.entity.hash_of_content {
            hashes.insert(content_hash.clone());
        }
    }
    hashes
}

fn load_table<T: DeserializeOwned>(entity_store: &Path, kind: TableKind) -> Result<Table<T>> {
    let path = entity_store.join(format!("{}.json", kind.file_name()));
    if !path.exists() {
        return Ok(Table::new());
    }
    let text = std::fs::read_to_string(&path)?;
    serde_json::from_str(&text).map_err(|e| {
        FlowError::system(format!(
            "malformed table file {}: {e}",
            path.display()
        ))
    })
}

fn persist_table<T: Serialize>(entity_store: &Path, kind: TableKind, table: &Table<T>) -> Result<()> {
    let path = entity_store.join(format!("{}.json", kind.file_name()));
    let value = serde_json::to_value(table)?;
    let bytes = hash::canonical_json_bytes(&value)?;
    workspace::set_file_writable(&path);
    std::fs::write(&path, bytes)?;
    workspace::set_file_readonly(&path);
    info!(table = kind.file_name(), "stored table");
    Ok(())
}

fn timestamp() -> String {
    chrono::Local::now()
        .format("%Y-%m-%d %H:%M:%S%.6f")
        .to_string()
}
