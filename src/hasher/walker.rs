use crate::hasher::ignore::IgnoreRules;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Walk a build context and return every non-ignored entry (files, symlinks
/// and directories, the ignore file included) as paths relative to `root`,
/// sorted for OS-independent determinism.
pub fn walk_dir(root: &Path, ignore: &IgnoreRules) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut walker = WalkDir::new(root).follow_links(false).min_depth(1).into_iter();

    while let Some(entry) = walker.next() {
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_path_buf();
        if ignore.is_ignored(&rel) {
            if entry.file_type().is_dir() {
                walker.skip_current_dir();
            }
            continue;
        }
        files.push(rel);
    }

    files.sort();
    Ok(files)
}
