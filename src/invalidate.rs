use rustc_hash::{FxHashMap, FxHashSet};

use crate::key::NodeKey;
use crate::value::{ExternalId, NodeValue};

/// The reverse dependency index driving invalidation.
///
/// For every committed value the index records, per input, which keys read
/// it: from external artifact to reader, and from node key to dependent.
/// When an external input changes, the transitive closure of dependents over
/// this index is exactly the set of entries that can no longer be trusted.
///
/// Edges recorded for an older incarnation of a value are kept after
/// recomputation. A stale edge can only cause a spurious recomputation,
/// never a stale value.
pub(crate) struct ReverseIndex {
    by_external: FxHashMap<ExternalId, FxHashSet<NodeKey>>,
    by_key: FxHashMap<NodeKey, FxHashSet<NodeKey>>,
}

impl ReverseIndex {
    pub fn new() -> Self {
        Self {
            by_external: FxHashMap::default(),
            by_key: FxHashMap::default(),
        }
    }

    /// Record the inputs of a freshly computed value.
    pub fn record(&mut self, key: &NodeKey, value: &NodeValue) {
        for dep in value.dependencies() {
            self.by_key.entry(dep.clone()).or_default().insert(key.clone());
        }
        for input in value.external_inputs() {
            self.by_external.entry(input.clone()).or_default().insert(key.clone());
        }
    }

    /// All keys transitively affected by a change to the given externals.
    ///
    /// The walk keeps a visited set, so defensively recorded dependency
    /// cycles cannot loop it.
    pub fn affected(&self, changed: impl IntoIterator<Item = ExternalId>) -> FxHashSet<NodeKey> {
        let mut affected = FxHashSet::default();
        let mut queue: Vec<NodeKey> = Vec::new();

        for id in changed {
            if let Some(readers) = self.by_external.get(&id) {
                queue.extend(readers.iter().cloned());
            }
        }

        while let Some(key) = queue.pop() {
            if !affected.insert(key.clone()) {
                continue;
            }
            if let Some(dependents) = self.by_key.get(&key) {
                queue.extend(dependents.iter().cloned());
            }
        }

        affected
    }

    /// Forget all recorded edges.
    pub fn clear(&mut self) {
        self.by_external.clear();
        self.by_key.clear();
    }
}
