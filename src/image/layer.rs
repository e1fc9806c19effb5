use crate::image::sha256_bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Builder, EntryType, Header};

/// Prefix marking a deleted path inside a layer tarball
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// One filesystem change captured by a layer, relative to the rootfs
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Change {
    Upsert(PathBuf),
    Delete(PathBuf),
}

impl Change {
    pub fn path(&self) -> &Path {
        match self {
            Change::Upsert(p) | Change::Delete(p) => p,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LayerBlob {
    /// gzip-compressed tarball
    pub data: Vec<u8>,
    /// `sha256:` digest of the compressed tarball
    pub digest: String,
    /// `sha256:` digest of the uncompressed tarball
    pub diff_id: String,
}

impl LayerBlob {
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

fn normalized_header(entry_type: EntryType, mode: u32, size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_size(size);
    header.set_mode(mode);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header
}

#[cfg(unix)]
fn mode_of(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(meta: &fs::Metadata) -> u32 {
    if meta.is_dir() {
        0o755
    } else {
        0o644
    }
}

/// Packs the given changes of `root` into a reproducible gzip tarball.
///
/// Headers are normalized (mtime, uid and gid are zero) and entries are
/// written in sorted path order, so identical trees produce identical blobs.
pub fn write_layer(root: &Path, changes: &[Change]) -> io::Result<LayerBlob> {
    let mut sorted: Vec<&Change> = changes.iter().collect();
    sorted.sort_by(|a, b| a.path().cmp(b.path()));

    let mut builder = Builder::new(Vec::new());
    for change in sorted {
        match change {
            Change::Delete(rel) => {
                let name = rel
                    .file_name()
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty path"))?;
                let whiteout = rel.with_file_name(format!(
                    "{}{}",
                    WHITEOUT_PREFIX,
                    name.to_string_lossy()
                ));
                let mut header = normalized_header(EntryType::Regular, 0o644, 0);
                builder.append_data(&mut header, &whiteout, io::empty())?;
            }
            Change::Upsert(rel) => {
                let full = root.join(rel);
                let meta = fs::symlink_metadata(&full)?;
                let file_type = meta.file_type();
                if file_type.is_symlink() {
                    let target = fs::read_link(&full)?;
                    let mut header = normalized_header(EntryType::Symlink, 0o777, 0);
                    builder.append_link(&mut header, rel, &target)?;
                } else if file_type.is_dir() {
                    let mut header = normalized_header(EntryType::Directory, mode_of(&meta), 0);
                    builder.append_data(&mut header, rel, io::empty())?;
                } else {
                    let content = fs::read(&full)?;
                    let mut header =
                        normalized_header(EntryType::Regular, mode_of(&meta), content.len() as u64);
                    builder.append_data(&mut header, rel, content.as_slice())?;
                }
            }
        }
    }
    let tar = builder.into_inner()?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar)?;
    let data = encoder.finish()?;

    Ok(LayerBlob {
        digest: format!("sha256:{}", sha256_bytes(&data)),
        diff_id: format!("sha256:{}", sha256_bytes(&tar)),
        data,
    })
}

fn is_contained(rel: &Path) -> bool {
    rel.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Unpacks a gzip layer tarball onto `root`, honouring whiteouts
pub fn apply_layer(data: &[u8], root: &Path) -> io::Result<()> {
    let mut archive = Archive::new(GzDecoder::new(data));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let rel = entry.path()?.into_owned();
        if !is_contained(&rel) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("layer entry escapes rootfs: {}", rel.display()),
            ));
        }

        let whiteout = rel
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(WHITEOUT_PREFIX))
            .map(|n| rel.with_file_name(n));

        match whiteout {
            Some(target) => {
                let full = root.join(target);
                match fs::symlink_metadata(&full) {
                    Ok(meta) if meta.is_dir() => fs::remove_dir_all(&full)?,
                    Ok(_) => fs::remove_file(&full)?,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
            }
            None => {
                // a file may replace a symlink or a directory from a lower layer
                let full = root.join(&rel);
                if entry.header().entry_type() != EntryType::Directory {
                    if let Ok(meta) = fs::symlink_metadata(&full) {
                        if meta.is_dir() {
                            fs::remove_dir_all(&full)?;
                        } else {
                            fs::remove_file(&full)?;
                        }
                    }
                }
                entry.set_preserve_permissions(true);
                entry.unpack_in(root)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_identical_trees_produce_identical_blobs() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        for dir in [&a, &b] {
            fs::create_dir(dir.path().join("etc")).unwrap();
            fs::write(dir.path().join("etc").join("motd"), "hi").unwrap();
        }
        let changes = vec![
            Change::Upsert(PathBuf::from("etc/motd")),
            Change::Upsert(PathBuf::from("etc")),
        ];
        let first = write_layer(a.path(), &changes).unwrap();
        let second = write_layer(b.path(), &changes).unwrap();
        assert_eq!(first.digest, second.digest);
        assert_eq!(first.diff_id, second.diff_id);
        assert_eq!(first.data, second.data);
    }

    #[test]
    fn test_apply_honours_whiteouts() {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("new.txt"), "new").unwrap();
        let blob = write_layer(
            src.path(),
            &[
                Change::Upsert(PathBuf::from("new.txt")),
                Change::Delete(PathBuf::from("old.txt")),
            ],
        )
        .unwrap();

        let dst = TempDir::new().unwrap();
        fs::write(dst.path().join("old.txt"), "old").unwrap();
        apply_layer(&blob.data, dst.path()).unwrap();

        assert!(!dst.path().join("old.txt").exists());
        assert_eq!(fs::read_to_string(dst.path().join("new.txt")).unwrap(), "new");
    }
}
