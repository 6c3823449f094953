use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

use crate::error::EvalError;
use crate::flight::{Claim, Flight, Flights};
use crate::invalidate::ReverseIndex;
use crate::key::{FunctionKind, NodeKey};
use crate::memo::{Lookup, MemoTable};
use crate::value::{ExternalId, NodeValue};

/// A computation function for one key kind.
///
/// Implementations produce the result addressed by a key. Everything the
/// computation reads must flow through the context: other graph nodes via
/// [`EvalContext::request_value`], externally owned artifacts via
/// [`EvalContext::record_external_input`]. An input read behind the
/// context's back makes later invalidation silently incomplete.
pub trait NodeFunction: Send + Sync + 'static {
    /// Compute the result for `key`.
    fn compute(&self, key: &NodeKey, ctx: &EvalContext) -> anyhow::Result<Arc<dyn Any + Send + Sync>>;
}

/// Resolves node keys to values, computing on miss and caching the rest.
///
/// The evaluator owns the memo table, the per-key in-flight coordination,
/// and the reverse dependency index. It may be shared freely across threads
/// (wrap it in an `Arc` once all kinds are registered); any number of
/// parallel requests for arbitrary keys are allowed, and concurrent
/// requests for the same key share a single computation.
pub struct Evaluator {
    functions: FxHashMap<FunctionKind, Arc<dyn NodeFunction>>,
    memo: MemoTable,
    flights: Flights,
    rdeps: Mutex<ReverseIndex>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Evaluator {
    /// Create an evaluator with no registered kinds.
    pub fn new() -> Self {
        Self {
            functions: FxHashMap::default(),
            memo: MemoTable::new(),
            flights: Flights::new(),
            rdeps: Mutex::new(ReverseIndex::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Register the computation function for a kind.
    ///
    /// A later registration for the same kind replaces the earlier one.
    pub fn register(&mut self, kind: FunctionKind, function: impl NodeFunction) {
        self.functions.insert(kind, Arc::new(function));
    }

    /// Register a plain function or closure for a kind.
    pub fn register_fn<F>(&mut self, kind: FunctionKind, function: F)
    where
        F: Fn(&NodeKey, &EvalContext) -> anyhow::Result<Arc<dyn Any + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        self.register(kind, FnFunction(function));
    }

    /// Resolve a key to its value.
    ///
    /// Serves the cached value when it is still valid; otherwise runs the
    /// computation function registered for the key's kind, records its
    /// dependencies, and commits the result. Fails with
    /// [`EvalError::UnknownKind`] for unregistered kinds,
    /// [`EvalError::Cycle`] when the key transitively requests itself, and
    /// [`EvalError::Computation`] when the function fails.
    pub fn evaluate(&self, key: &NodeKey) -> Result<NodeValue, EvalError> {
        self.evaluate_at(key, None)
    }

    /// React to a change of externally owned inputs.
    ///
    /// Marks every entry that transitively depended on one of the changed
    /// inputs dirty and returns the affected keys. Each of them is
    /// recomputed on its next request; unrelated entries are untouched.
    pub fn on_external_change(
        &self,
        changed: impl IntoIterator<Item = ExternalId>,
    ) -> Vec<NodeKey> {
        let affected = self.rdeps.lock().affected(changed);
        if !affected.is_empty() {
            self.memo.invalidate(affected.iter());
            debug!(count = affected.len(), "invalidated after external change");
        }
        affected.into_iter().collect()
    }

    /// The memo table's current state for a key.
    pub fn lookup(&self, key: &NodeKey) -> Lookup {
        self.memo.lookup(key)
    }

    /// Forget all cached values, recorded dependencies, and markers.
    pub fn reset(&self) {
        self.memo.reset();
        self.rdeps.lock().clear();
    }

    /// A snapshot of the evaluator's counters.
    pub fn stats(&self) -> EvalStats {
        EvalStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn evaluate_at(
        &self,
        key: &NodeKey,
        parent: Option<&Ancestry<'_>>,
    ) -> Result<NodeValue, EvalError> {
        // A key without a registered function is a wiring error, reported
        // before the memo table is even consulted.
        let Some(function) = self.functions.get(&key.kind()) else {
            return Err(EvalError::UnknownKind(key.kind()));
        };

        // Fast path: a valid cached value.
        if let Lookup::Valid(value) = self.memo.lookup(key) {
            trace!(key = ?key, "hit");
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }

        // Slow path: claim the computation rights for the key.
        let flight = match self.flights.claim(key) {
            Claim::Lead(flight) => flight,
            Claim::Joined(outcome) => {
                trace!(key = ?key, "joined in-flight computation");
                self.hits.fetch_add(1, Ordering::Relaxed);
                return outcome;
            }
        };

        // Another leader may have committed while we were claiming.
        if let Lookup::Valid(value) = self.memo.lookup(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            self.flights.finish(key, &flight, Ok(value.clone()));
            return Ok(value);
        }

        // A leader that unwinds must still release its followers.
        let guard = FlightGuard { evaluator: self, key, flight: &flight, armed: true };
        let outcome = self.compute(key, function.as_ref(), parent);
        guard.disarm();

        self.flights.finish(key, &flight, outcome.clone());
        outcome
    }

    /// Run the computation function for a key and commit the result.
    fn compute(
        &self,
        key: &NodeKey,
        function: &dyn NodeFunction,
        parent: Option<&Ancestry<'_>>,
    ) -> Result<NodeValue, EvalError> {
        debug!(key = ?key, "computing");
        self.misses.fetch_add(1, Ordering::Relaxed);

        // Capture the epoch before reading any input; an invalidation that
        // lands from here on outranks this computation's commit.
        let started = self.memo.epoch();

        let ctx = EvalContext {
            evaluator: self,
            ancestry: Ancestry { key, parent },
            dependencies: Mutex::new(FxHashSet::default()),
            external_inputs: Mutex::new(FxHashSet::default()),
        };

        let result = match function.compute(key, &ctx) {
            Ok(result) => result,
            // A failure that is itself an evaluation error (a cycle, or a
            // failure of a requested dependency) propagates unchanged.
            Err(source) => {
                return Err(match source.downcast::<EvalError>() {
                    Ok(inner) => inner,
                    Err(source) => EvalError::computation(key, source),
                });
            }
        };

        let value = NodeValue::new(
            result,
            ctx.dependencies.into_inner(),
            ctx.external_inputs.into_inner(),
        );

        // The reverse index must know the new edges before the entry can be
        // seen as valid; otherwise a change notification could slip through
        // between the two.
        self.rdeps.lock().record(key, &value);
        let valid = self.memo.commit(key, value.clone(), started);
        debug!(key = ?key, deps = value.dependencies().len(), valid, "committed");

        Ok(value)
    }
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of the evaluator's counters.
///
/// A hit is a request served without running the computation function,
/// whether from the memo table or by joining an in-flight computation. A
/// miss is one invocation of a computation function.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct EvalStats {
    pub hits: u64,
    pub misses: u64,
}

/// The per-computation view of the evaluator handed to node functions.
///
/// Records every input the computation reads, so that the committed value
/// carries its exact dependency set.
pub struct EvalContext<'a> {
    evaluator: &'a Evaluator,
    ancestry: Ancestry<'a>,
    dependencies: Mutex<FxHashSet<NodeKey>>,
    external_inputs: Mutex<FxHashSet<ExternalId>>,
}

impl EvalContext<'_> {
    /// Request another node's value, establishing a dependency edge.
    ///
    /// The requested key is evaluated through the same evaluator and thus
    /// shares its cache; its commit completes before this call returns.
    /// Fails with [`EvalError::Cycle`] when the request closes a cycle in
    /// the in-flight evaluation chain.
    pub fn request_value(&self, key: &NodeKey) -> Result<NodeValue, EvalError> {
        if self.ancestry.contains(key) {
            return Err(EvalError::Cycle { path: self.ancestry.cycle_through(key) });
        }
        let value = self.evaluator.evaluate_at(key, Some(&self.ancestry))?;
        self.dependencies.lock().insert(key.clone());
        Ok(value)
    }

    /// Record that the computation read an externally owned input.
    pub fn record_external_input(&self, id: ExternalId) {
        self.external_inputs.lock().insert(id);
    }
}

/// The chain of keys whose computations are in flight on this call stack.
struct Ancestry<'a> {
    key: &'a NodeKey,
    parent: Option<&'a Ancestry<'a>>,
}

impl Ancestry<'_> {
    fn contains(&self, key: &NodeKey) -> bool {
        self.iter().any(|ancestor| ancestor == key)
    }

    fn iter(&self) -> impl Iterator<Item = &NodeKey> {
        let mut current = Some(self);
        std::iter::from_fn(move || {
            let ancestry = current?;
            current = ancestry.parent;
            Some(ancestry.key)
        })
    }

    /// The key path from `key`'s in-flight frame down to the repeated
    /// request, in evaluation order.
    fn cycle_through(&self, key: &NodeKey) -> Arc<[NodeKey]> {
        let mut path: Vec<NodeKey> = self.iter().cloned().collect();
        path.reverse();
        let start = path.iter().position(|ancestor| ancestor == key).unwrap_or(0);
        path.drain(..start);
        path.push(key.clone());
        path.into()
    }
}

/// Adapts a plain function to [`NodeFunction`].
struct FnFunction<F>(F);

impl<F> NodeFunction for FnFunction<F>
where
    F: Fn(&NodeKey, &EvalContext) -> anyhow::Result<Arc<dyn Any + Send + Sync>>
        + Send
        + Sync
        + 'static,
{
    fn compute(&self, key: &NodeKey, ctx: &EvalContext) -> anyhow::Result<Arc<dyn Any + Send + Sync>> {
        (self.0)(key, ctx)
    }
}

/// Completes the flight with a failure when the leader unwinds.
struct FlightGuard<'a> {
    evaluator: &'a Evaluator,
    key: &'a NodeKey,
    flight: &'a Flight,
    armed: bool,
}

impl FlightGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let error = EvalError::computation(
                self.key,
                anyhow::anyhow!("computation function panicked"),
            );
            self.evaluator.flights.finish(self.key, self.flight, Err(error));
        }
    }
}
