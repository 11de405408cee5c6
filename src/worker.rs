use std::collections::HashMap;
use std::sync::mpsc::{Receiver, SyncSender};

use crate::datafile::DataFile;
use crate::error::Result;
use crate::index::{KeyIndex, KeysQuery, Locator};
use crate::record::{KeyRecord, MAX_KEY_LEN};
use crate::Error;

/// One message to a database's owner. Every variant carries a rendezvous
/// sender the caller blocks on; replies to callers that gave up are dropped
/// on the floor.
pub(crate) enum Request {
    Set {
        key: Vec<u8>,
        value: Vec<u8>,
        reply: SyncSender<Result<()>>,
    },
    Get {
        key: Vec<u8>,
        reply: SyncSender<Result<Vec<u8>>>,
    },
    Delete {
        key: Vec<u8>,
        reply: SyncSender<Result<()>>,
    },
    Has {
        key: Vec<u8>,
        reply: SyncSender<bool>,
    },
    Count {
        reply: SyncSender<u64>,
    },
    Keys {
        query: KeysQuery,
        reply: SyncSender<Vec<Vec<u8>>>,
    },
    SetMany {
        pairs: Vec<(Vec<u8>, Vec<u8>)>,
        reply: SyncSender<Result<()>>,
    },
    GetMany {
        keys: Vec<Vec<u8>>,
        reply: SyncSender<Vec<(Vec<u8>, Vec<u8>)>>,
    },
    Counter {
        key: Vec<u8>,
        reply: SyncSender<Result<u64>>,
    },
    Shutdown {
        reply: SyncSender<()>,
    },
}

/// The single owner of one database's files and index.
///
/// All mutation and all reads go through this type, on one thread; request
/// ordering is whatever order messages leave the channel. That is the whole
/// concurrency story: no locks around the index, no racing readers during a
/// value slot reuse.
pub(crate) struct Owner {
    values: DataFile,
    log: DataFile,
    index: KeyIndex,
    counters: HashMap<Vec<u8>, u64>,
    scratch: Vec<u8>,
}

/// Drains requests until shutdown (or until every handle is gone), then
/// flushes counters and syncs both files.
pub(crate) fn run(mut owner: Owner, requests: Receiver<Request>) {
    while let Ok(request) = requests.recv() {
        match request {
            Request::Set { key, value, reply } => {
                let _ = reply.send(owner.set(&key, &value, true));
            }
            Request::Get { key, reply } => {
                let _ = reply.send(owner.get(&key));
            }
            Request::Delete { key, reply } => {
                let _ = reply.send(owner.delete(&key));
            }
            Request::Has { key, reply } => {
                let _ = reply.send(owner.index.contains(&key));
            }
            Request::Count { reply } => {
                let _ = reply.send(owner.index.len() as u64);
            }
            Request::Keys { query, reply } => {
                let _ = reply.send(owner.index.range(&query));
            }
            Request::SetMany { pairs, reply } => {
                let _ = reply.send(owner.set_many(&pairs));
            }
            Request::GetMany { keys, reply } => {
                let _ = reply.send(owner.get_many(&keys));
            }
            Request::Counter { key, reply } => {
                let _ = reply.send(owner.counter(&key));
            }
            Request::Shutdown { reply } => {
                owner.finish();
                let _ = reply.send(());
                return;
            }
        }
    }
    // Every sender dropped without an explicit shutdown: close anyway so
    // counters and buffered writes are not silently lost.
    owner.finish();
}

impl Owner {
    pub(crate) fn new(values: DataFile, log: DataFile, index: KeyIndex) -> Self {
        Owner {
            values,
            log,
            index,
            counters: HashMap::new(),
            scratch: Vec::new(),
        }
    }

    /// Writes one key/value pair.
    ///
    /// The value goes into the existing slot when it fits, otherwise to the
    /// end of the values file. The key record overwrites the key's previous
    /// record in place when one exists, otherwise it is appended. The index
    /// is only touched once both writes succeeded; a value written before a
    /// failed key-record write stays behind as unreferenced bytes.
    fn set(&mut self, key: &[u8], value: &[u8], sync: bool) -> Result<()> {
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Err(Error::InvalidKey);
        }
        let existing = self.index.get(key).copied();

        let value_offset = match existing {
            Some(locator) if locator.value_size as usize >= value.len() => {
                self.values
                    .write_at(value, u64::from(locator.value_offset), sync)?;
                locator.value_offset
            }
            _ => self.values.append(value, sync)? as u32,
        };

        let record = KeyRecord::set(key, value_offset, value.len() as u32);
        record.encode_into(&mut self.scratch)?;
        let key_record_offset = match existing {
            Some(locator) => {
                // Same key, same record size: safe to rewrite in place.
                self.log
                    .write_at(&self.scratch, u64::from(locator.key_record_offset), sync)?;
                locator.key_record_offset
            }
            None => self.log.append(&self.scratch, sync)? as u32,
        };

        self.index.apply_set(
            key.to_vec(),
            Locator {
                value_offset,
                value_size: value.len() as u32,
                key_record_offset,
            },
        );
        Ok(())
    }

    fn get(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        let locator = *self.index.get(key).ok_or(Error::KeyNotFound)?;
        self.values
            .read_at(u64::from(locator.value_offset), locator.value_size as usize)
    }

    /// Removes the key and appends a tombstone. Absent keys succeed
    /// silently; the tombstone is still written, matching replay semantics
    /// where the last record for a key wins.
    fn delete(&mut self, key: &[u8]) -> Result<()> {
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            // No such key can exist, nothing to remove.
            return Ok(());
        }
        self.index.apply_delete(key);
        let record = KeyRecord::delete(key);
        record.encode_into(&mut self.scratch)?;
        self.log.append(&self.scratch, true)?;
        Ok(())
    }

    /// Bulk set: per-pair writes skip fsync, then each file gets exactly one
    /// barrier, whether or not the batch ran to completion.
    fn set_many(&mut self, pairs: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        let mut outcome = Ok(());
        for (key, value) in pairs {
            if let Err(err) = self.set(key, value, false) {
                outcome = Err(err);
                break;
            }
        }
        let values_sync = self.values.sync();
        let log_sync = self.log.sync();
        outcome.and(values_sync).and(log_sync)
    }

    /// Bulk get: keys that are missing (or fail to read) are skipped.
    fn get_many(&mut self, keys: &[Vec<u8>]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut result = Vec::with_capacity(keys.len());
        for key in keys {
            if let Ok(value) = self.get(key) {
                result.push((key.clone(), value));
            }
        }
        result
    }

    /// Returns the next counter value for `key` and remembers it.
    ///
    /// On the first use of a key in this session the persisted value is
    /// consulted: if the key holds exactly eight bytes they are taken as a
    /// big-endian u64 and counting continues from there. Counters only reach
    /// disk at close.
    fn counter(&mut self, key: &[u8]) -> Result<u64> {
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Err(Error::InvalidKey);
        }
        let mut next = self.counters.get(key).copied().unwrap_or(0) + 1;
        if next == 1 {
            match self.get(key) {
                Ok(bytes) => {
                    if let Ok(persisted) = <[u8; 8]>::try_from(bytes.as_slice()) {
                        next = u64::from_be_bytes(persisted) + 1;
                    }
                }
                Err(Error::KeyNotFound) => {}
                Err(err) => return Err(err),
            }
        }
        self.counters.insert(key.to_vec(), next);
        Ok(next)
    }

    /// Close-time work: persist live counters through the normal set path
    /// (reusing their eight-byte slots), then one final barrier per file.
    fn finish(&mut self) {
        let counters: Vec<(Vec<u8>, u64)> =
            self.counters.drain().filter(|(_, v)| *v > 0).collect();
        for (key, value) in counters {
            if let Err(err) = self.set(&key, &value.to_be_bytes(), false) {
                tracing::warn!(error = %err, "failed to persist counter at close");
            }
        }
        if let Err(err) = self.values.sync() {
            tracing::warn!(error = %err, "values file sync failed at close");
        }
        if let Err(err) = self.log.sync() {
            tracing::warn!(error = %err, "keys log sync failed at close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_owner(dir: &TempDir) -> Owner {
        let values = DataFile::open(&dir.path().join("db")).expect("Failed to open values file");
        let log = DataFile::open(&dir.path().join("db.idx")).expect("Failed to open keys log");
        Owner::new(values, log, KeyIndex::default())
    }

    #[test]
    fn test_set_then_get() {
        let dir = TempDir::new().unwrap();
        let mut owner = create_owner(&dir);

        owner.set(b"hello", b"world", true).expect("Set failed");
        assert_eq!(owner.get(b"hello").unwrap(), b"world");
        assert_eq!(owner.get(b"missing"), Err(Error::KeyNotFound));
    }

    #[test]
    fn test_empty_value() {
        let dir = TempDir::new().unwrap();
        let mut owner = create_owner(&dir);

        owner.set(b"nothing", b"", true).unwrap();
        assert_eq!(owner.get(b"nothing").unwrap(), b"");
        assert!(owner.index.contains(b"nothing"));
    }

    #[test]
    fn test_overwrite_reuses_value_slot() {
        let dir = TempDir::new().unwrap();
        let mut owner = create_owner(&dir);

        owner.set(b"k", b"0123456789", true).unwrap();
        let len_after_first = owner.values.len();

        // Shrinking fits into the old slot: no file growth.
        owner.set(b"k", b"abcde", true).unwrap();
        assert_eq!(owner.values.len(), len_after_first);
        assert_eq!(owner.get(b"k").unwrap(), b"abcde");

        // The slot now counts five bytes, so six no longer fit.
        owner.set(b"k", b"012345", true).unwrap();
        assert_eq!(owner.values.len(), len_after_first + 6);
        assert_eq!(owner.get(b"k").unwrap(), b"012345");
    }

    #[test]
    fn test_overwrite_rewrites_key_record_in_place() {
        let dir = TempDir::new().unwrap();
        let mut owner = create_owner(&dir);

        owner.set(b"k", b"first", true).unwrap();
        let log_len = owner.log.len();
        owner.set(b"k", b"second-longer", true).unwrap();
        assert_eq!(owner.log.len(), log_len);
    }

    #[test]
    fn test_delete_removes_and_appends_tombstone() {
        let dir = TempDir::new().unwrap();
        let mut owner = create_owner(&dir);

        owner.set(b"k", b"v", true).unwrap();
        let log_len = owner.log.len();
        owner.delete(b"k").unwrap();
        assert_eq!(owner.get(b"k"), Err(Error::KeyNotFound));
        assert!(!owner.index.contains(b"k"));
        assert!(owner.log.len() > log_len);

        // Deleting again is fine and writes another tombstone.
        owner.delete(b"k").unwrap();
    }

    #[test]
    fn test_invalid_keys() {
        let dir = TempDir::new().unwrap();
        let mut owner = create_owner(&dir);

        assert_eq!(owner.set(b"", b"v", true), Err(Error::InvalidKey));
        let huge = vec![b'x'; MAX_KEY_LEN + 1];
        assert_eq!(owner.set(&huge, b"v", true), Err(Error::InvalidKey));
        assert_eq!(owner.counter(b""), Err(Error::InvalidKey));
        // Invalid keys cannot exist, so deleting one is a no-op.
        assert_eq!(owner.delete(&huge), Ok(()));
        assert_eq!(owner.log.len(), 0);
    }

    #[test]
    fn test_failed_key_record_write_leaves_index_untouched() {
        let dir = TempDir::new().unwrap();
        let mut owner = create_owner(&dir);

        owner.set(b"a", b"aaa", true).unwrap();
        let values_len = owner.values.len();

        owner.log.fail_next_write();
        let err = owner.set(b"b", b"bbb", true);
        assert!(matches!(err, Err(Error::Io(_))));

        // The value bytes landed but nothing references them.
        assert_eq!(owner.values.len(), values_len + 3);
        assert_eq!(owner.get(b"b"), Err(Error::KeyNotFound));
        assert_eq!(owner.index.len(), 1);

        // The key is writable again afterwards.
        owner.set(b"b", b"bbb", true).unwrap();
        assert_eq!(owner.get(b"b").unwrap(), b"bbb");
    }

    #[test]
    fn test_failed_value_write_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let mut owner = create_owner(&dir);

        owner.values.fail_next_write();
        assert!(matches!(owner.set(b"k", b"v", true), Err(Error::Io(_))));
        assert_eq!(owner.log.len(), 0);
        assert!(!owner.index.contains(b"k"));
    }

    #[test]
    fn test_set_many_returns_first_error() {
        let dir = TempDir::new().unwrap();
        let mut owner = create_owner(&dir);

        let pairs = vec![
            (b"one".to_vec(), b"1".to_vec()),
            (Vec::new(), b"2".to_vec()), // invalid key stops the batch
            (b"three".to_vec(), b"3".to_vec()),
        ];
        assert_eq!(owner.set_many(&pairs), Err(Error::InvalidKey));
        assert_eq!(owner.get(b"one").unwrap(), b"1");
        assert_eq!(owner.get(b"three"), Err(Error::KeyNotFound));
    }

    #[test]
    fn test_get_many_skips_missing() {
        let dir = TempDir::new().unwrap();
        let mut owner = create_owner(&dir);

        owner.set(b"a", b"1", true).unwrap();
        owner.set(b"c", b"3", true).unwrap();
        let result = owner.get_many(&[b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(
            result,
            vec![(b"a".to_vec(), b"1".to_vec()), (b"c".to_vec(), b"3".to_vec())]
        );
    }

    #[test]
    fn test_counter_increments() {
        let dir = TempDir::new().unwrap();
        let mut owner = create_owner(&dir);

        assert_eq!(owner.counter(b"c").unwrap(), 1);
        assert_eq!(owner.counter(b"c").unwrap(), 2);
        assert_eq!(owner.counter(b"c").unwrap(), 3);
    }

    #[test]
    fn test_counter_continues_from_persisted_value() {
        let dir = TempDir::new().unwrap();
        let mut owner = create_owner(&dir);

        owner.set(b"c", &7u64.to_be_bytes(), true).unwrap();
        assert_eq!(owner.counter(b"c").unwrap(), 8);
        assert_eq!(owner.counter(b"c").unwrap(), 9);
    }

    #[test]
    fn test_counter_ignores_non_numeric_value() {
        let dir = TempDir::new().unwrap();
        let mut owner = create_owner(&dir);

        owner.set(b"c", b"not a counter", true).unwrap();
        assert_eq!(owner.counter(b"c").unwrap(), 1);
    }

    #[test]
    fn test_finish_persists_counters() {
        let dir = TempDir::new().unwrap();
        let mut owner = create_owner(&dir);

        owner.counter(b"c").unwrap();
        owner.counter(b"c").unwrap();
        owner.finish();

        assert_eq!(owner.get(b"c").unwrap(), 2u64.to_be_bytes());
    }
}
