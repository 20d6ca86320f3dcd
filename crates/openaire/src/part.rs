//! Part file naming and enumeration.
//!
//! A table directory holds raw parts (`<part>.json.gz`) as extracted from the
//! upstream archives and, when sanitization is configured, one sanitized part
//! (`<part>_NR.json.gz`) per raw part. The names alone decide which stage a
//! file belongs to.

use std::io;
use std::path::{Path, PathBuf};

/// Extension shared by every part.
pub const PART_EXTENSION: &str = ".json.gz";

/// Marker appended to the stem of a sanitized part.
pub const SANITIZED_MARKER: &str = "_NR";

/// Which stage produced a part file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartKind {
    Raw,
    Sanitized,
}

/// Classify a file name, or `None` if it is not a part.
///
/// Temp outputs (`*.json.gz.tmp`) and hidden files are never parts.
pub fn classify(name: &str) -> Option<PartKind> {
    if name.starts_with('.') {
        return None;
    }
    let stem = name.strip_suffix(PART_EXTENSION)?;
    if stem.is_empty() {
        return None;
    }
    if stem.ends_with(SANITIZED_MARKER) {
        Some(PartKind::Sanitized)
    } else {
        Some(PartKind::Raw)
    }
}

/// Name of the sanitized part produced from `raw`.
///
/// Returns `None` unless `raw` is a raw part, so a sanitized name is never
/// marked twice.
pub fn sanitized_name(raw: &str) -> Option<String> {
    match classify(raw)? {
        PartKind::Raw => {
            let stem = raw.strip_suffix(PART_EXTENSION)?;
            Some(format!("{stem}{SANITIZED_MARKER}{PART_EXTENSION}"))
        }
        PartKind::Sanitized => None,
    }
}

/// Name of the raw part a part was derived from.
///
/// Raw names map to themselves; sanitized names lose their marker.
pub fn raw_name(name: &str) -> Option<String> {
    match classify(name)? {
        PartKind::Raw => Some(name.to_string()),
        PartKind::Sanitized => {
            let stem = name
                .strip_suffix(PART_EXTENSION)?
                .strip_suffix(SANITIZED_MARKER)?;
            Some(format!("{stem}{PART_EXTENSION}"))
        }
    }
}

/// File name component of a path as UTF-8, if it has one.
pub fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}

/// List the parts of `kind` directly under `dir`, sorted by name.
///
/// A directory that does not exist yet has no parts.
pub fn list_parts(dir: &Path, kind: PartKind) -> io::Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut parts = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        if file_name(&path).and_then(classify) == Some(kind) {
            parts.push(path);
        }
    }
    parts.sort();
    Ok(parts)
}

/// Base names of the given paths.
pub fn names(paths: &[PathBuf]) -> Vec<String> {
    paths
        .iter()
        .filter_map(|p| file_name(p).map(str::to_string))
        .collect()
}
