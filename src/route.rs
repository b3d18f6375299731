use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::Context as _;

/// Moves `source` into `dest_dir` with a single rename, never overwriting:
/// on a name clash the stem gets `_1`, `_2`, ... appended.
///
/// Returns the path the file now lives at.
pub fn move_atomic(source: &Path, dest_dir: &Path) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dest_dir)
        .with_context(|| format!("create destination dir: {}", dest_dir.display()))?;

    let file_name = source
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("source must name a file: {}", source.display()))?;
    let target = free_destination(dest_dir, Path::new(file_name));

    std::fs::rename(source, &target).with_context(|| {
        format!("move {} -> {}", source.display(), target.display())
    })?;
    Ok(target)
}

fn free_destination(dest_dir: &Path, file_name: &Path) -> PathBuf {
    let candidate = dest_dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }

    let stem = file_name.file_stem().unwrap_or_default();
    let extension = file_name.extension();
    let mut n: u64 = 1;
    loop {
        let mut name = OsString::from(stem);
        name.push(format!("_{n}"));
        if let Some(extension) = extension {
            name.push(".");
            name.push(extension);
        }
        let candidate = dest_dir.join(name);
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}
