use std::any::Any;
use std::fmt::{self, Debug, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::hash::hash128;

/// The function-kind tag of a node key.
///
/// Kinds form a closed set: each kind is declared as a constant and wired to
/// its computation function when the evaluator is set up. New node types
/// extend the tag set rather than subclassing anything.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct FunctionKind(&'static str);

impl FunctionKind {
    /// Declare a new kind tag.
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// The kind's name.
    pub fn name(self) -> &'static str {
        self.0
    }
}

impl Debug for FunctionKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.pad(self.0)
    }
}

impl Display for FunctionKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.pad(self.0)
    }
}

/// Payload data addressing one unit of work of some kind.
///
/// This is implemented for all hashable, immutable data. The structural hash
/// must cover everything that distinguishes two computations of the same
/// kind; order-independent fields therefore belong in containers that hash
/// in a canonical order, such as `BTreeSet`.
pub trait KeyPayload: Debug + Send + Sync + 'static {
    /// The payload's structural 128-bit hash.
    fn key_hash(&self) -> u128;

    /// The payload as `Any`, for downcasting in computation functions.
    fn as_any(&self) -> &(dyn Any + Send + Sync);
}

impl<T: Hash + Debug + Send + Sync + 'static> KeyPayload for T {
    fn key_hash(&self) -> u128 {
        // Hash the type as well so that equal data of two different payload
        // types cannot alias the same key.
        hash128(&(self.type_id(), self))
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}

/// An immutable identifier for one unit of cacheable work.
///
/// A key pairs a [`FunctionKind`] with payload data specific to that kind.
/// The payload's structural hash is computed once, at construction; equality
/// and hashing of keys then operate on the kind and that cached 128-bit
/// hash. As with all high-quality 128-bit hashes, the collision risk is
/// negligible, and key comparison stays cheap no matter how large the
/// payload is or how many keys are in flight.
#[derive(Clone)]
pub struct NodeKey {
    kind: FunctionKind,
    hash: u128,
    payload: Arc<dyn KeyPayload>,
}

impl NodeKey {
    /// Create a key from a kind and its payload data.
    pub fn new(kind: FunctionKind, payload: impl KeyPayload) -> Self {
        let hash = payload.key_hash();
        Self { kind, hash, payload: Arc::new(payload) }
    }

    /// The key's function kind.
    pub fn kind(&self) -> FunctionKind {
        self.kind
    }

    /// Downcast the payload to a concrete type.
    ///
    /// Computation functions use this to get at the typed request data for
    /// their kind.
    pub fn payload<T: KeyPayload>(&self) -> Option<&T> {
        self.payload.as_any().downcast_ref()
    }
}

impl Eq for NodeKey {}

impl PartialEq for NodeKey {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.hash == other.hash
    }
}

impl Hash for NodeKey {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        state.write_u128(self.hash);
    }
}

impl Debug for NodeKey {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}({:?})", self.kind, self.payload)
    }
}
