use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MapError {
    #[error("source path is not absolute: {0}")]
    NotAbsolute(PathBuf),
    #[error("source path contains a parent reference: {0}")]
    ParentComponent(PathBuf),
    #[error("host name is not a single path component: {0:?}")]
    InvalidHost(String),
    #[error("mapped path {dest} escapes volume root {root}")]
    Escapes { dest: PathBuf, root: PathBuf },
}

/// Maps an absolute source path to its place inside a volume:
/// `volume_root / host / <source without root or drive marker>`.
///
/// Drive prefixes lose their separator characters (`C:` becomes `C`) rather
/// than being escaped. The result is always a strict descendant of
/// `volume_root`.
pub fn map_destination(source: &Path, host: &str, volume_root: &Path) -> Result<PathBuf, MapError> {
    let dest = volume_root.join(relative_destination(source, host)?);
    if !dest.starts_with(volume_root) || dest == volume_root {
        return Err(MapError::Escapes {
            dest,
            root: volume_root.to_path_buf(),
        });
    }
    Ok(dest)
}

/// Same mapping as [`map_destination`], relative to the volume root.
///
/// This is the form stored in catalogs so that a volume stays valid when it
/// is remounted elsewhere.
pub fn relative_destination(source: &Path, host: &str) -> Result<PathBuf, MapError> {
    if !source.is_absolute() {
        return Err(MapError::NotAbsolute(source.to_path_buf()));
    }
    validate_host(host)?;

    let mut rel = PathBuf::from(host);
    for component in source.components() {
        match component {
            Component::Prefix(prefix) => {
                let cleaned = strip_separators(prefix.as_os_str());
                if !cleaned.is_empty() {
                    rel.push(cleaned);
                }
            }
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir => return Err(MapError::ParentComponent(source.to_path_buf())),
            Component::Normal(part) => rel.push(part),
        }
    }

    Ok(rel)
}

fn validate_host(host: &str) -> Result<(), MapError> {
    let mut components = Path::new(host).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !host.contains(['/', '\\', ':']) => Ok(()),
        _ => Err(MapError::InvalidHost(host.to_owned())),
    }
}

fn strip_separators(raw: &std::ffi::OsStr) -> OsString {
    let text = raw.to_string_lossy();
    text.chars()
        .filter(|c| !matches!(c, ':' | '\\' | '/' | '?'))
        .collect::<String>()
        .into()
}
