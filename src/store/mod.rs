// The content-addressed entity store

//! # Entity Store Module
//!
//! Three concerns live here:
//!
//! - [`hash`]: Git-blob SHA-1 content addressing of bytes, files, and
//!   canonical JSON entities, plus the unique-prefix computation.
//! - [`store`]: the five in-memory tables (user, data, node, workflow, run)
//!   with JSON persistence, guarded mutation, and referer resolution.
//! - [`workspace`]: scratch-directory allocation and the read-only/writable
//!   permission flips used around persisted files and data blobs.

pub mod hash;
pub mod store;
pub mod workspace;

pub use store::{EntityStore, HostOs, Named, StoreContext, TableKind};

#[cfg(test)]
pub(crate) mod test_support {
    //! Shared fixtures: a store over throwaway directories.

    use super::{EntityStore, HostOs, StoreContext};
    use tempfile::TempDir;

    /// A fresh empty store rooted in a temporary directory tree. The guard
    /// must be kept alive for the duration of the test.
    pub fn empty_store() -> (EntityStore, TempDir) {
        let root = tempfile::tempdir().expect("create temp dir");
        let ctx = context_in(&root);
        let store = EntityStore::open(ctx).expect("open store");
        (store, root)
    }

    /// A store context over subdirectories of `root`.
    pub fn context_in(root: &TempDir) -> StoreContext {
        let entity_store = root.path().join("entity_store");
        let data_dir = root.path().join("data_dir");
        let temp_dir = root.path().join("temp_dir");
        let base_dir = root.path().join("base_dir");
        for dir in [&entity_store, &data_dir, &temp_dir, &base_dir] {
            std::fs::create_dir_all(dir).expect("create store dirs");
        }
        StoreContext {
            entity_store,
            data_dir,
            temp_dir,
            base_dir: Some(base_dir),
            data_dir_for_mount: None,
            temp_dir_for_mount: None,
            host_os: HostOs::Linux,
            in_container: false,
        }
    }
}
