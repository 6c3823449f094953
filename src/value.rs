use std::any::Any;
use std::fmt::{self, Debug, Display, Formatter};
use std::sync::Arc;

use rustc_hash::FxHashSet;

use crate::key::NodeKey;

/// An opaque handle for an input owned outside the build graph.
///
/// External artifacts such as packages are loaded and versioned by their own
/// subsystems. The graph only records which of them a value was computed
/// from and reacts to change notifications for them; it never controls
/// their lifecycle.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ExternalId(Arc<str>);

impl ExternalId {
    /// Create an identifier from its stable name.
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// The identifier's name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ExternalId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl Debug for ExternalId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl Display for ExternalId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.pad(&self.0)
    }
}

/// The immutable result of evaluating a node key.
///
/// Bundles the computed result with the exact set of node keys and external
/// inputs that were read while computing it. The recorded sets drive
/// invalidation: under-recording would let stale values survive an input
/// change, so everything a computation reads must flow through its
/// evaluation context. Cloning is cheap; all parts are shared.
#[derive(Clone)]
pub struct NodeValue {
    result: Arc<dyn Any + Send + Sync>,
    dependencies: Arc<FxHashSet<NodeKey>>,
    external_inputs: Arc<FxHashSet<ExternalId>>,
}

impl NodeValue {
    /// Bundle a computed result with the inputs it was computed from.
    pub fn new(
        result: Arc<dyn Any + Send + Sync>,
        dependencies: impl IntoIterator<Item = NodeKey>,
        external_inputs: impl IntoIterator<Item = ExternalId>,
    ) -> Self {
        Self {
            result,
            dependencies: Arc::new(dependencies.into_iter().collect()),
            external_inputs: Arc::new(external_inputs.into_iter().collect()),
        }
    }

    /// Downcast the result to a concrete type.
    pub fn result<T: Any>(&self) -> Option<&T> {
        (*self.result).downcast_ref()
    }

    /// The node keys this value was computed from.
    pub fn dependencies(&self) -> impl ExactSizeIterator<Item = &NodeKey> {
        self.dependencies.iter()
    }

    /// The external inputs this value was computed from.
    pub fn external_inputs(&self) -> impl ExactSizeIterator<Item = &ExternalId> {
        self.external_inputs.iter()
    }

    /// Whether two values share the same underlying result allocation.
    pub fn shares_result(&self, other: &NodeValue) -> bool {
        Arc::ptr_eq(&self.result, &other.result)
    }
}

impl Debug for NodeValue {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("NodeValue")
            .field("dependencies", &self.dependencies.len())
            .field("external_inputs", &self.external_inputs.len())
            .finish_non_exhaustive()
    }
}
