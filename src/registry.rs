use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use crate::db::{self, Database};
use crate::error::Result;
use crate::Error;

/// Process-wide map of open databases, keyed by path.
///
/// Paths are treated as opaque identifiers: callers normalize them. The
/// mutex also makes `open` single-flight, so a racing open cannot spawn two
/// owners for one path.
fn stores() -> &'static Mutex<HashMap<PathBuf, Arc<Database>>> {
    static STORES: OnceLock<Mutex<HashMap<PathBuf, Arc<Database>>>> = OnceLock::new();
    STORES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Opens the database at `path`, or returns the handle that is already open.
pub fn open(path: impl AsRef<Path>) -> Result<Arc<Database>> {
    let path = path.as_ref().to_path_buf();
    let mut stores = stores().lock()?;
    if let Some(database) = stores.get(&path) {
        return Ok(Arc::clone(database));
    }
    let database = Arc::new(Database::open(&path)?);
    stores.insert(path, Arc::clone(&database));
    Ok(database)
}

/// Closes the database at `path`. Fails with [`Error::NotOpen`] if it is not
/// in the registry.
pub fn close(path: impl AsRef<Path>) -> Result<()> {
    let database = stores()
        .lock()?
        .remove(path.as_ref())
        .ok_or(Error::NotOpen)?;
    database.close()
}

/// Closes every open database.
pub fn close_all() -> Result<()> {
    let databases: Vec<Arc<Database>> = stores().lock()?.drain().map(|(_, db)| db).collect();
    for database in databases {
        database.close()?;
    }
    Ok(())
}

/// Closes the database at `path` (if open) and unlinks its files.
pub fn delete_file(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    match close(path) {
        Ok(()) | Err(Error::NotOpen) => {}
        Err(err) => return Err(err),
    }
    tracing::info!(path = %path.display(), "deleting database files");
    std::fs::remove_file(path)?;
    std::fs::remove_file(db::idx_path(path))?;
    // The lock file is an artifact of ours, not part of the database proper.
    let _ = std::fs::remove_file(db::lock_path(path));
    Ok(())
}

/// Stores `value` under `key`, opening the database if needed.
pub fn set(path: impl AsRef<Path>, key: &[u8], value: &[u8]) -> Result<()> {
    open(path)?.set(key, value)
}

/// Returns the value stored under `key`.
pub fn get(path: impl AsRef<Path>, key: &[u8]) -> Result<Vec<u8>> {
    open(path)?.get(key)
}

/// Removes `key`. Succeeds whether or not the key existed.
pub fn delete(path: impl AsRef<Path>, key: &[u8]) -> Result<()> {
    open(path)?.delete(key)
}

/// Whether `key` currently holds a value.
pub fn has(path: impl AsRef<Path>, key: &[u8]) -> Result<bool> {
    open(path)?.has(key)
}

/// Number of live keys.
pub fn count(path: impl AsRef<Path>) -> Result<u64> {
    open(path)?.count()
}

/// Ordered key enumeration; see [`Database::keys`].
pub fn keys(
    path: impl AsRef<Path>,
    from: Option<&[u8]>,
    limit: u32,
    offset: u32,
    ascending: bool,
) -> Result<Vec<Vec<u8>>> {
    open(path)?.keys(from, limit, offset, ascending)
}

/// Bulk write with one fsync per file at the end.
pub fn sets(path: impl AsRef<Path>, pairs: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
    open(path)?.sets(pairs)
}

/// Bulk read; missing keys are skipped.
pub fn gets(path: impl AsRef<Path>, keys: &[Vec<u8>]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    open(path)?.gets(keys)
}

/// Returns the next value of the monotonic counter stored under `key`.
pub fn counter(path: impl AsRef<Path>, key: &[u8]) -> Result<u64> {
    open(path)?.counter(key)
}
