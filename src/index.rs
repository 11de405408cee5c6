use std::collections::HashMap;

/// Where a live key's current value and latest log record sit on disk.
///
/// `key_record_offset` is a weak back-reference: the keys log owns the
/// record bytes, the locator only remembers where the most recent set record
/// for this key was written so an overwrite can rewrite it in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Locator {
    pub value_offset: u32,
    pub value_size: u32,
    pub key_record_offset: u32,
}

/// Ordered key enumeration parameters.
///
/// A `from` key whose last byte is `*` switches the query to prefix mode:
/// the star is stripped and every key starting with the remainder matches,
/// the boundary key included. Without the star, `from` must match an
/// existing key exactly and is itself excluded from the result. `limit` of
/// zero means unbounded.
#[derive(Debug, Clone, Default)]
pub struct KeysQuery {
    pub from: Option<Vec<u8>>,
    pub limit: u32,
    pub offset: u32,
    pub ascending: bool,
}

/// The in-memory index of one database: a locator per live key plus the
/// same keys in a flat, lexicographically sorted sequence for range queries.
/// Mutated only by the owning worker, so no interior locking.
#[derive(Debug, Default)]
pub struct KeyIndex {
    locators: HashMap<Vec<u8>, Locator>,
    ordered: Vec<Vec<u8>>,
}

impl KeyIndex {
    pub fn get(&self, key: &[u8]) -> Option<&Locator> {
        self.locators.get(key)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.locators.contains_key(key)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    /// Inserts or overwrites the locator for `key`. New keys are spliced
    /// into the sorted sequence; existing keys only update their locator.
    pub fn apply_set(&mut self, key: Vec<u8>, locator: Locator) {
        if self.locators.insert(key.clone(), locator).is_none() {
            if let Err(pos) = self.ordered.binary_search(&key) {
                self.ordered.insert(pos, key);
            }
        }
    }

    /// Removes `key` from both structures. Returns whether it was present.
    pub fn apply_delete(&mut self, key: &[u8]) -> bool {
        if self.locators.remove(key).is_none() {
            return false;
        }
        if let Ok(pos) = self.ordered.binary_search_by(|k| k.as_slice().cmp(key)) {
            self.ordered.remove(pos);
        }
        true
    }

    /// Enumerates keys per `query`.
    ///
    /// Positions are computed on the sorted sequence: locate the anchor for
    /// `from` (exact match, or the edge of the prefixed run), step off it in
    /// the iteration direction unless prefix mode includes it, shift by
    /// `offset` in the same direction, then emit until `limit` is reached,
    /// the sequence ends, or a key falls off the prefix.
    pub fn range(&self, query: &KeysQuery) -> Vec<Vec<u8>> {
        let keys = &self.ordered;
        let len = keys.len() as isize;

        let (from, prefix_mode) = match query.from.as_deref() {
            Some(f) if f.last() == Some(&b'*') => (Some(&f[..f.len() - 1]), true),
            Some(f) => (Some(f), false),
            None => (None, false),
        };

        // Anchor position, -1 when there is nothing to anchor on.
        let mut found: isize = -1;
        if let Some(from) = from {
            if query.ascending || !prefix_mode {
                found = keys.partition_point(|k| k.as_slice() < from) as isize;
                if found == len {
                    found = -1;
                } else if !prefix_mode && keys[found as usize] != from {
                    found = -1;
                }
            } else {
                // Descending prefix scans start at the last key of the
                // prefixed run, located via the run's exclusive upper bound.
                found = match prefix_successor(from) {
                    Some(bound) => {
                        keys.partition_point(|k| k.as_slice() < bound.as_slice()) as isize - 1
                    }
                    None => len - 1,
                };
                if found >= 0 && !keys[found as usize].starts_with(from) {
                    found = -1;
                }
            }
        }

        let mut start: isize = if query.ascending {
            let s = match from {
                None => 0,
                Some(_) if found == -1 => len,
                Some(_) if prefix_mode => found,
                Some(_) => found + 1,
            };
            s + query.offset as isize
        } else {
            let s = match from {
                None => len - 1,
                Some(_) if found == -1 => -1,
                Some(_) if prefix_mode => found,
                Some(_) => found - 1,
            };
            s - query.offset as isize
        };

        let step: isize = if query.ascending { 1 } else { -1 };
        let mut result = Vec::new();
        while start >= 0 && start < len {
            let key = &keys[start as usize];
            if prefix_mode {
                // A key off the prefix ends the run; nothing beyond it can
                // match because the run is contiguous.
                if !key.starts_with(from.unwrap_or_default()) {
                    break;
                }
            }
            result.push(key.clone());
            if query.limit > 0 && result.len() as u32 == query.limit {
                break;
            }
            start += step;
        }
        result
    }
}

/// Smallest byte string greater than every string starting with `prefix`,
/// or None when the prefix is empty or all 0xff.
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    prefix.iter().rposition(|b| *b != 0xff).map(|i| {
        prefix[..i]
            .iter()
            .chain(std::iter::once(&(prefix[i] + 1)))
            .copied()
            .collect()
    })
}
