//! Filesystem scanner
//!
//! Lists the migration directory without recursing and digests every regular
//! file. Whether a file is runnable is decided later by the registry.

use std::fs;
use std::path::Path;

use super::definitions::MigrationCandidate;
use super::hasher::content_digest;
use crate::error::{OrmError, OrmResult};

/// Candidates in `dir`, sorted by file name
pub fn scan(dir: &Path) -> OrmResult<Vec<MigrationCandidate>> {
    let entries = fs::read_dir(dir).map_err(|e| OrmError::io(dir, e))?;

    let mut candidates = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| OrmError::io(dir, e))?;
        let path = entry.path();

        // Follows symlinks, so a link to a directory is skipped too
        if path.is_dir() {
            tracing::debug!("Skipping directory {}", path.display());
            continue;
        }

        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            tracing::warn!("Skipping file with non UTF-8 name: {}", path.display());
            continue;
        };

        let digest = content_digest(&path)?;
        candidates.push(MigrationCandidate { name, path, digest });
    }

    candidates.sort_by(|a, b| a.name.cmp(&b.name));
    tracing::debug!("Found {} file(s) in {}", candidates.len(), dir.display());
    Ok(candidates)
}
