//! Content digests
//!
//! A migration is identified by the SHA-1 of its bytes, not by its name.

use sha1::{Digest, Sha1};
use std::fs::File;
use std::io;
use std::path::Path;

use crate::error::{OrmError, OrmResult};

/// Lowercase hex SHA-1 of the file at `path`
pub fn content_digest(path: &Path) -> OrmResult<String> {
    let mut file = File::open(path).map_err(|e| OrmError::io(path, e))?;
    let mut hasher = Sha1::new();
    io::copy(&mut file, &mut hasher).map_err(|e| OrmError::io(path, e))?;
    Ok(hex::encode(hasher.finalize()))
}
