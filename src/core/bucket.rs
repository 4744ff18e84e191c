/*!
 * Buckets and the streaming partitioner
 *
 * A bucket is the unit of work handed to one rsync child: an ordered,
 * non-empty slice of the crawl bounded by entry count and aggregate size.
 */

use std::path::Path;

use crate::core::entry::Entry;

/// Sealed work unit. Invariants once sealed: `1 <= count <= max_entries`,
/// and `bytes <= max_bytes` unless the bucket is a single oversized entry.
#[derive(Debug, Clone)]
pub struct Bucket {
    pub id: u64,
    pub entries: Vec<Entry>,
    /// Sum of regular-file sizes
    pub bytes: u64,
}

impl Bucket {
    fn new(id: u64) -> Self {
        Self {
            id,
            entries: Vec::new(),
            bytes: 0,
        }
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Representative path for warnings and failure reports.
    pub fn first_path(&self) -> &Path {
        self.entries
            .first()
            .map(|entry| entry.path.as_path())
            .unwrap_or_else(|| Path::new("?"))
    }

    fn push(&mut self, entry: Entry) {
        self.bytes += entry.size;
        self.entries.push(entry);
    }

    fn would_exceed(&self, entry: &Entry, max_entries: usize, max_bytes: u64) -> bool {
        self.entries.len() + 1 > max_entries || self.bytes + entry.size > max_bytes
    }
}

/// Folds the entry stream into buckets. Pure streaming state machine; it
/// never blocks or allocates beyond the open bucket.
#[derive(Debug)]
pub struct Partitioner {
    max_entries: usize,
    max_bytes: u64,
    open: Bucket,
    sealed: u64,
}

impl Partitioner {
    pub fn new(max_entries: usize, max_bytes: u64) -> Self {
        debug_assert!(max_entries >= 1 && max_bytes >= 1);
        Self {
            max_entries,
            max_bytes,
            open: Bucket::new(1),
            sealed: 0,
        }
    }

    /// Accept one entry; returns the previously open bucket when accepting
    /// the entry had to seal it first. An entry bigger than the byte limit
    /// is still accepted and will end up alone in its bucket, because the
    /// next entry necessarily trips the byte check.
    pub fn push(&mut self, entry: Entry) -> Option<Bucket> {
        let sealed = if !self.open.is_empty()
            && self
                .open
                .would_exceed(&entry, self.max_entries, self.max_bytes)
        {
            Some(self.seal())
        } else {
            None
        };
        self.open.push(entry);
        sealed
    }

    /// End of the crawl: hand back the open bucket if it holds anything.
    pub fn finish(mut self) -> Option<Bucket> {
        if self.open.is_empty() {
            None
        } else {
            self.sealed += 1;
            Some(self.open)
        }
    }

    /// Buckets sealed so far (not counting the open one).
    pub fn sealed(&self) -> u64 {
        self.sealed
    }

    fn seal(&mut self) -> Bucket {
        self.sealed += 1;
        let next_id = self.open.id + 1;
        std::mem::replace(&mut self.open, Bucket::new(next_id))
    }
}
