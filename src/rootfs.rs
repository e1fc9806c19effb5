//! Root filesystem staging shared by the local engine and the local runtime.

use crate::error::{DazzleError, Result};
use crate::image::layer::{apply_layer, Change};
use crate::image::StoredImage;
use crate::repository::Repository;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Variable pointing commands at the staged root filesystem
pub const ROOTFS_ENV: &str = "DAZZLE_ROOTFS";

/// Unpacks every layer of `images`, bottom to top, onto `root`
pub async fn materialize(repo: &dyn Repository, images: &[StoredImage], root: &Path) -> Result<()> {
    for image in images {
        for layer in &image.manifest.layers {
            let data = repo.read_blob(&layer.digest).await?;
            let target = root.to_path_buf();
            let digest = layer.digest.clone();
            tokio::task::spawn_blocking(move || apply_layer(&data, &target))
                .await
                .map_err(|e| DazzleError::repository("unpack", &digest, e))?
                .map_err(|e| DazzleError::repository("unpack", &digest, e))?;
        }
    }
    Ok(())
}

/// Maps an in-image path onto `root`. Relative paths are taken from `workdir`;
/// `..` never climbs above the root.
pub fn container_path(root: &Path, workdir: &str, path: &str) -> PathBuf {
    let joined = if path.starts_with('/') {
        PathBuf::from(path)
    } else {
        Path::new("/").join(workdir).join(path)
    };

    let mut out = root.to_path_buf();
    let mut depth = 0usize;
    for component in joined.components() {
        match component {
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
            Component::ParentDir if depth > 0 => {
                out.pop();
                depth -= 1;
            }
            _ => {}
        }
    }
    out
}

/// Environment for a command running against `root`: the host environment,
/// overlaid with the image env. Image `PATH` entries are mapped into the root
/// and put in front of the host `PATH`.
pub fn command_env(root: &Path, image_env: &[(String, String)]) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = image_env
        .iter()
        .filter(|(k, _)| k != "PATH")
        .cloned()
        .collect();

    let mut path = Vec::new();
    if let Some((_, image_path)) = image_env.iter().rev().find(|(k, _)| k == "PATH") {
        for entry in image_path.split(':').filter(|e| e.starts_with('/')) {
            path.push(container_path(root, "/", entry));
        }
    }
    if let Some(host) = std::env::var_os("PATH") {
        path.extend(std::env::split_paths(&host));
    }
    if let Ok(joined) = std::env::join_paths(path) {
        env.push(("PATH".to_string(), joined.to_string_lossy().into_owned()));
    }
    env.push((ROOTFS_ENV.to_string(), root.display().to_string()));
    env
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EntryState {
    Dir { mode: u32 },
    File { mode: u32, hash: blake3::Hash },
    Symlink { target: PathBuf },
}

/// Point-in-time view of a root filesystem
#[derive(Debug, Default)]
pub struct Snapshot {
    entries: BTreeMap<PathBuf, EntryState>,
}

#[cfg(unix)]
fn mode_of(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(meta: &fs::Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

pub fn snapshot(root: &Path) -> io::Result<Snapshot> {
    let mut entries = BTreeMap::new();
    for entry in WalkDir::new(root).follow_links(false).min_depth(1) {
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_path_buf();
        let meta = entry.path().symlink_metadata()?;
        let state = if meta.file_type().is_symlink() {
            EntryState::Symlink {
                target: fs::read_link(entry.path())?,
            }
        } else if meta.is_dir() {
            EntryState::Dir {
                mode: mode_of(&meta),
            }
        } else {
            let mut hasher = blake3::Hasher::new();
            io::copy(&mut fs::File::open(entry.path())?, &mut hasher)?;
            EntryState::File {
                mode: mode_of(&meta),
                hash: hasher.finalize(),
            }
        };
        entries.insert(rel, state);
    }
    Ok(Snapshot { entries })
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Changes turning `self` into `after`. A removed directory yields one
    /// delete for the directory, not one per child.
    pub fn diff(&self, after: &Snapshot) -> Vec<Change> {
        let mut changes = Vec::new();

        let mut deleted_dirs: Vec<&Path> = Vec::new();
        for (path, state) in &self.entries {
            if after.entries.contains_key(path) {
                continue;
            }
            if deleted_dirs.iter().any(|d| path.starts_with(d)) {
                continue;
            }
            if matches!(state, EntryState::Dir { .. }) {
                deleted_dirs.push(path);
            }
            changes.push(Change::Delete(path.clone()));
        }

        for (path, state) in &after.entries {
            if self.entries.get(path) != Some(state) {
                changes.push(Change::Upsert(path.clone()));
            }
        }

        changes.sort();
        changes
    }
}
