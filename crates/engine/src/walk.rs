use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use walkdir::WalkDir;

/// Absolute paths of every regular file under `roots`, root by root, in file
/// name order. Symlinks are not followed.
pub fn source_files(roots: &[PathBuf]) -> impl Iterator<Item = Result<PathBuf>> + '_ {
    roots
        .iter()
        .flat_map(|root| -> Box<dyn Iterator<Item = Result<PathBuf>>> {
            match fs::canonicalize(root).with_context(|| format!("resolve source {}", root.display())) {
                Ok(root) => Box::new(walk_root(root)),
                Err(err) => Box::new(std::iter::once(Err(err))),
            }
        })
}

fn walk_root(root: PathBuf) -> impl Iterator<Item = Result<PathBuf>> {
    WalkDir::new(&root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(move |entry| match entry {
            Ok(entry) if entry.file_type().is_file() => Some(Ok(entry.into_path())),
            Ok(_) => None,
            Err(err) => Some(Err(anyhow::Error::new(err).context(format!("walk {}", root.display())))),
        })
}
