use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::key::NodeKey;
use crate::value::NodeValue;

/// The authoritative store mapping node keys to computed values.
///
/// Entries move between three externally visible states: absent (never
/// computed), dirty (computed before, but an input changed since), and valid.
/// Lookups never block on other keys and never compute; a reader sees either
/// no entry, a dirty marker, or a fully formed value.
///
/// A monotonically increasing epoch, bumped once per invalidation batch,
/// resolves the race between a commit and a concurrent invalidation for the
/// same key: the invalidation wins. A computation captures the epoch before
/// it starts reading inputs; if an invalidation for its key lands after that
/// point, the committed entry is stored dirty and the key is recomputed on
/// its next request.
pub struct MemoTable {
    entries: RwLock<FxHashMap<NodeKey, MemoEntry>>,
    epoch: AtomicU64,
}

struct MemoEntry {
    /// The most recently computed value. `None` for keys that were
    /// invalidated while absent or in flight; such markers exist only to
    /// carry `dirtied` forward to the next commit.
    value: Option<NodeValue>,
    valid: bool,
    /// The epoch of the last invalidation that hit this key.
    dirtied: u64,
}

/// The externally visible state of a memo entry.
#[derive(Debug, Clone)]
pub enum Lookup {
    /// Never computed.
    Absent,
    /// Computed before, but an input changed since; must be recomputed
    /// before it can be served again.
    Dirty,
    /// Computed and unaffected by any later invalidation.
    Valid(NodeValue),
}

impl MemoTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
            epoch: AtomicU64::new(0),
        }
    }

    /// The current invalidation epoch.
    ///
    /// Captured before a computation starts; passed back to
    /// [`MemoTable::commit`] so that an invalidation landing mid-computation
    /// outranks the commit.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Look up the current state for a key.
    pub fn lookup(&self, key: &NodeKey) -> Lookup {
        match self.entries.read().get(key) {
            None => Lookup::Absent,
            Some(entry) => match &entry.value {
                None => Lookup::Absent,
                Some(value) if entry.valid => Lookup::Valid(value.clone()),
                Some(_) => Lookup::Dirty,
            },
        }
    }

    /// Store the value computed for a key.
    ///
    /// `started` is the epoch captured when the computation began. If an
    /// invalidation for this key landed after that point, the entry is
    /// stored dirty and the key will be recomputed on its next request.
    /// Returns whether the entry came out valid.
    pub fn commit(&self, key: &NodeKey, value: NodeValue, started: u64) -> bool {
        let mut entries = self.entries.write();
        let dirtied = entries.get(key).map_or(0, |entry| entry.dirtied);
        let valid = dirtied <= started;
        entries.insert(key.clone(), MemoEntry { value: Some(value), valid, dirtied });
        valid
    }

    /// Mark each key dirty, keeping already computed values around.
    ///
    /// Keys without an entry get a marker so that an in-flight computation
    /// for them still observes the invalidation at commit time.
    pub fn invalidate<'a>(&self, keys: impl IntoIterator<Item = &'a NodeKey>) {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let mut entries = self.entries.write();
        for key in keys {
            entries
                .entry(key.clone())
                .and_modify(|entry| {
                    entry.valid = false;
                    entry.dirtied = epoch;
                })
                .or_insert(MemoEntry { value: None, valid: false, dirtied: epoch });
        }
    }

    /// Drop all entries, including invalidation markers.
    pub fn reset(&self) {
        self.entries.write().clear();
    }
}

impl Default for MemoTable {
    fn default() -> Self {
        Self::new()
    }
}
