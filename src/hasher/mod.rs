//! Build-context hashing.
//!
//! A context hash covers the relative path, kind, executable bit and content
//! of every entry the context's `.dockerignore` does not exclude, directories
//! and the ignore file itself included. Modification
//! times, ownership and the absolute location of the context never enter the
//! hash.

pub mod ignore;
pub mod walker;

pub use ignore::IgnoreRules;

use rayon::prelude::*;
use std::fs;
use std::io;
use std::path::Path;

#[cfg(unix)]
fn is_executable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &fs::Metadata) -> bool {
    false
}

fn hash_entry(root: &Path, rel: &Path) -> io::Result<String> {
    let full = root.join(rel);
    let meta = fs::symlink_metadata(&full)?;
    let mut hasher = blake3::Hasher::new();

    if meta.file_type().is_symlink() {
        hasher.update(b"symlink\0");
        hasher.update(fs::read_link(&full)?.to_string_lossy().as_bytes());
    } else if meta.is_dir() {
        hasher.update(b"dir\0");
    } else {
        hasher.update(if is_executable(&meta) { b"exec\0" } else { b"file\0" });
        let mut file = fs::File::open(&full)?;
        io::copy(&mut file, &mut hasher)?;
    }

    Ok(hasher.finalize().to_hex().to_string())
}

/// Hashes a build context directory
pub fn hash_context(root: &Path) -> io::Result<String> {
    let meta = fs::metadata(root)?;
    if !meta.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("build context {} is not a directory", root.display()),
        ));
    }

    let ignore = IgnoreRules::for_context(root)?;
    let entries = walker::walk_dir(root, &ignore)?;

    // par_iter keeps input order, so the fold below sees sorted paths
    let entry_hashes = entries
        .par_iter()
        .map(|rel| hash_entry(root, rel))
        .collect::<io::Result<Vec<_>>>()?;

    let mut hasher = blake3::Hasher::new();
    for (rel, entry_hash) in entries.iter().zip(entry_hashes) {
        let normalized = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        hasher.update(normalized.as_bytes());
        hasher.update(b"\0");
        hasher.update(entry_hash.as_bytes());
        hasher.update(b"\n");
    }
    Ok(hasher.finalize().to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_same_content_in_different_locations_hashes_equal() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        for dir in [&a, &b] {
            fs::write(dir.path().join("Dockerfile"), "RUN true\n").unwrap();
            fs::create_dir(dir.path().join("files")).unwrap();
            fs::write(dir.path().join("files").join("x"), "x").unwrap();
        }
        assert_eq!(hash_context(a.path()).unwrap(), hash_context(b.path()).unwrap());
    }

    #[test]
    fn test_content_change_changes_hash() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("Dockerfile"), "RUN true\n").unwrap();
        let before = hash_context(dir.path()).unwrap();
        fs::write(dir.path().join("Dockerfile"), "RUN false\n").unwrap();
        assert_ne!(before, hash_context(dir.path()).unwrap());
    }

    #[test]
    fn test_ignored_files_do_not_affect_hash() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("Dockerfile"), "RUN true\n").unwrap();
        fs::write(dir.path().join(".dockerignore"), "*.log\n").unwrap();
        let before = hash_context(dir.path()).unwrap();
        fs::write(dir.path().join("debug.log"), "noise").unwrap();
        assert_eq!(before, hash_context(dir.path()).unwrap());
    }

    #[test]
    fn test_empty_dir_and_ignore_rules_change_hash() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("Dockerfile"), "COPY . /src\n").unwrap();
        let bare = hash_context(dir.path()).unwrap();

        fs::create_dir(dir.path().join("empty")).unwrap();
        let with_dir = hash_context(dir.path()).unwrap();
        assert_ne!(bare, with_dir);

        fs::write(dir.path().join(".dockerignore"), "nothing-matches\n").unwrap();
        assert_ne!(with_dir, hash_context(dir.path()).unwrap());
    }

    #[test]
    fn test_rename_changes_hash() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a"), "same").unwrap();
        let before = hash_context(dir.path()).unwrap();
        fs::rename(dir.path().join("a"), dir.path().join("b")).unwrap();
        assert_ne!(before, hash_context(dir.path()).unwrap());
    }

    #[test]
    fn test_missing_context_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = hash_context(&dir.path().join("missing")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
