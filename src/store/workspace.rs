// Scratch directories and file permission flips

//! Every platform file output of a run gets a fresh random-named directory
//! under the configured `temp_dir`. Name collisions are retried until a free
//! name is found. Scratch directories are removed wholesale on process
//! shutdown; there is no per-run cleanup.

use std::path::{Path, PathBuf};

use rand::Rng;
use tracing::info;

use crate::Result;

const TEMP_NAME_LENGTH: usize = 8;
const TEMP_NAME_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Create a new scratch directory. Returns the local path and the path to use
/// in container mount arguments; the two differ only when the platform itself
/// runs inside a container and the container runtime resolves mount sources
/// on the host.
pub fn create_temp_directory(
    temp_dir: &Path,
    temp_dir_for_mount: Option<&Path>,
    in_container: bool,
) -> Result<(PathBuf, PathBuf)> {
    loop {
        let name = random_name(TEMP_NAME_LENGTH);
        let path = temp_dir.join(&name);
        match std::fs::create_dir(&path) {
            Ok(()) => {
                let mount_path = match (in_container, temp_dir_for_mount) {
                    (true, Some(host_dir)) => host_dir.join(&name),
                    _ => path.clone(),
                };
                return Ok((path, mount_path));
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Remove every directory under `temp_dir`.
pub fn remove_all_temp_directories(temp_dir: &Path) -> Result<()> {
    for entry in std::fs::read_dir(temp_dir)? {
        let path = entry?.path();
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        }
    }
    info!("removed temporary directories");
    Ok(())
}

/// Make a file read-only for everyone. Missing files are ignored.
pub fn set_file_readonly(path: &Path) {
    if let Ok(metadata) = std::fs::metadata(path) {
        let mut permissions = metadata.permissions();
        permissions.set_readonly(true);
        let _ = std::fs::set_permissions(path, permissions);
    }
}

/// Set the executable bit (Unix only; script nodes are rejected on Windows
/// hosts before this matters). Missing files are ignored.
pub fn set_file_executable(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = std::fs::metadata(path) {
            let mut permissions = metadata.permissions();
            permissions.set_mode(permissions.mode() | 0o755);
            let _ = std::fs::set_permissions(path, permissions);
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

/// Make a file writable again. Missing files are ignored.
pub fn set_file_writable(path: &Path) {
    if let Ok(metadata) = std::fs::metadata(path) {
        let mut permissions = metadata.permissions();
        #[allow(clippy::permissions_set_readonly_false)]
        permissions.set_readonly(false);
        let _ = std::fs::set_permissions(path, permissions);
    }
}

fn random_name(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| TEMP_NAME_ALPHABET[rng.gen_range(0..TEMP_NAME_ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_directories_are_fresh_and_removable() {
        let root = tempfile::tempdir().unwrap();
        let (first, first_mount) = create_temp_directory(root.path(), None, false).unwrap();
        let (second, _) = create_temp_directory(root.path(), None, false).unwrap();
        assert!(first.is_dir());
        assert!(second.is_dir());
        assert_ne!(first, second);
        assert_eq!(first, first_mount);

        remove_all_temp_directories(root.path()).unwrap();
        assert!(!first.exists());
        assert!(!second.exists());
    }

    #[test]
    fn test_mount_path_uses_host_prefix_in_container() {
        let root = tempfile::tempdir().unwrap();
        let host = Path::new("/host/temp");
        let (local, mount) = create_temp_directory(root.path(), Some(host), true).unwrap();
        assert!(local.starts_with(root.path()));
        assert!(mount.starts_with(host));
        assert_eq!(local.file_name(), mount.file_name());
    }

    #[test]
    fn test_readonly_flip() {
        let root = tempfile::tempdir().unwrap();
        let file = root.path().join("blob");
        std::fs::write(&file, b"x").unwrap();
        set_file_readonly(&file);
        assert!(std::fs::metadata(&file).unwrap().permissions().readonly());
        set_file_writable(&file);
        assert!(!std::fs::metadata(&file).unwrap().permissions().readonly());
    }
}
