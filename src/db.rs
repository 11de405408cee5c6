use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, SyncSender};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

use crate::config::{IDX_SUFFIX, LOCK_SUFFIX, REQUEST_QUEUE_CAPACITY};
use crate::datafile::DataFile;
use crate::error::Result;
use crate::flock::FileLock;
use crate::index::{KeyIndex, KeysQuery, Locator};
use crate::record::{LogReader, OP_DELETE, OP_SET};
use crate::worker::{self, Owner, Request};
use crate::Error;

/// Keys log path for a database path.
pub(crate) fn idx_path(path: &Path) -> PathBuf {
    append_suffix(path, IDX_SUFFIX)
}

/// Lock file path for a database path.
pub(crate) fn lock_path(path: &Path) -> PathBuf {
    append_suffix(path, LOCK_SUFFIX)
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Rebuilds the index from the keys log.
///
/// The cursor names each record's own offset, which becomes the key's
/// `key_record_offset` so later overwrites can rewrite it in place. The last
/// record for a key wins; unknown op codes are applied as neither set nor
/// delete. Returns where decoding stopped if trailing bytes were abandoned.
fn replay(log: &[u8], index: &mut KeyIndex) -> Option<usize> {
    let mut reader = LogReader::new(log);
    for (offset, record) in reader.by_ref() {
        match record.op {
            OP_SET => index.apply_set(
                record.key,
                Locator {
                    value_offset: record.value_offset,
                    value_size: record.value_size,
                    key_record_offset: offset,
                },
            ),
            OP_DELETE => {
                index.apply_delete(&record.key);
            }
            _ => {}
        }
    }
    reader.truncated().then(|| reader.offset())
}

/// A handle to one open database.
///
/// All operations are forwarded to the database's owner thread and block
/// until it replies, so a `Database` can be shared freely across threads.
/// Dropping the last handle closes the database as if [`close`] had been
/// called.
///
/// [`close`]: Database::close
pub struct Database {
    tx: SyncSender<Request>,
    worker: Mutex<Option<JoinHandle<()>>>,
    path: PathBuf,
    _lock: FileLock,
}

impl Database {
    /// Opens the database at `path`, creating files and parent directories
    /// as needed, replaying the keys log, and spawning the owner thread.
    ///
    /// Fails with [`Error::AlreadyOpen`] when another owner holds the path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        ensure_parent_dirs(&path)?;
        let lock = FileLock::lock(&lock_path(&path))?;

        let values = DataFile::open(&path)?;
        let mut log = DataFile::open(&idx_path(&path))?;

        let mut index = KeyIndex::default();
        let log_bytes = log.read_all()?;
        if let Some(offset) = replay(&log_bytes, &mut index) {
            tracing::warn!(
                path = %path.display(),
                offset,
                "keys log has a partial trailing record; replay stopped there"
            );
        }
        tracing::info!(path = %path.display(), keys = index.len(), "database opened");

        let (tx, rx) = mpsc::sync_channel(REQUEST_QUEUE_CAPACITY);
        let owner = Owner::new(values, log, index);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let handle = thread::Builder::new()
            .name(format!("emberdb-owner-{name}"))
            .spawn(move || worker::run(owner, rx))?;

        Ok(Database {
            tx,
            worker: Mutex::new(Some(handle)),
            path,
            _lock: lock,
        })
    }

    /// The database path (which is also the values file path).
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stores `value` under `key`, overwriting any previous value.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.request(|reply| Request::Set {
            key: key.to_vec(),
            value: value.to_vec(),
            reply,
        })?
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.request(|reply| Request::Get {
            key: key.to_vec(),
            reply,
        })?
    }

    /// Removes `key`. Succeeds whether or not the key existed.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.request(|reply| Request::Delete {
            key: key.to_vec(),
            reply,
        })?
    }

    /// Whether `key` currently holds a value.
    pub fn has(&self, key: &[u8]) -> Result<bool> {
        self.request(|reply| Request::Has {
            key: key.to_vec(),
            reply,
        })
    }

    /// Number of live keys.
    pub fn count(&self) -> Result<u64> {
        self.request(|reply| Request::Count { reply })
    }

    /// Ordered key enumeration.
    ///
    /// `from` anchors the scan: an exact key to continue after, or a prefix
    /// when its last byte is `*`. `limit` of zero means unbounded; `offset`
    /// skips positions in the iteration direction; `ascending` chooses it.
    pub fn keys(
        &self,
        from: Option<&[u8]>,
        limit: u32,
        offset: u32,
        ascending: bool,
    ) -> Result<Vec<Vec<u8>>> {
        let query = KeysQuery {
            from: from.map(<[u8]>::to_vec),
            limit,
            offset,
            ascending,
        };
        self.request(|reply| Request::Keys { query, reply })
    }

    /// Bulk write. Each file is fsynced once at the end instead of per pair.
    pub fn sets(&self, pairs: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        self.request(|reply| Request::SetMany { pairs, reply })?
    }

    /// Bulk read. Missing keys are skipped, not errors.
    pub fn gets(&self, keys: &[Vec<u8>]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.request(|reply| Request::GetMany {
            keys: keys.to_vec(),
            reply,
        })
    }

    /// Returns the next value of the monotonic counter stored under `key`.
    pub fn counter(&self, key: &[u8]) -> Result<u64> {
        self.request(|reply| Request::Counter {
            key: key.to_vec(),
            reply,
        })?
    }

    /// Shuts the owner down: the in-flight request finishes, counters are
    /// persisted, both files are synced and closed. Later operations on this
    /// handle return [`Error::NotOpen`]. Safe to call more than once.
    pub fn close(&self) -> Result<()> {
        let handle = self.worker.lock()?.take();
        if let Some(handle) = handle {
            let (reply_tx, reply_rx) = mpsc::sync_channel(1);
            if self.tx.send(Request::Shutdown { reply: reply_tx }).is_ok() {
                let _ = reply_rx.recv();
            }
            let _ = handle.join();
            tracing::debug!(path = %self.path.display(), "database closed");
        }
        Ok(())
    }

    fn request<T>(&self, build: impl FnOnce(SyncSender<T>) -> Request) -> Result<T> {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.tx.send(build(reply_tx)).map_err(|_| Error::NotOpen)?;
        reply_rx.recv().map_err(|_| Error::NotOpen)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn ensure_parent_dirs(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            let mut builder = std::fs::DirBuilder::new();
            builder.recursive(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::DirBuilderExt;
                builder.mode(crate::config::DIR_MODE);
            }
            builder.create(parent)?;
        }
    }
    Ok(())
}
