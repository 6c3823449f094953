use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

use crate::error::EvalError;
use crate::key::NodeKey;
use crate::value::NodeValue;

/// The outcome of claiming the computation rights for a key.
pub(crate) enum Claim {
    /// The caller is the leader: it must compute and then finish the flight.
    Lead(Arc<Flight>),
    /// Another requester was already computing this key; its outcome is
    /// shared.
    Joined(Result<NodeValue, EvalError>),
}

/// Coordinates at most one in-flight computation per key.
///
/// The first requester for an uncached key becomes the leader and computes;
/// concurrent requesters for the same key block on the leader's completion
/// signal and share its value or failure. The map is locked only to insert
/// or remove flights; waiting and computing happen outside of it, so
/// computations for unrelated keys never contend and may freely recurse
/// into the evaluator.
pub(crate) struct Flights {
    inflight: Mutex<FxHashMap<NodeKey, Arc<Flight>>>,
}

impl Flights {
    pub fn new() -> Self {
        Self { inflight: Mutex::new(FxHashMap::default()) }
    }

    /// Claim the computation rights for a key, or wait for the current
    /// leader to finish and share its outcome.
    pub fn claim(&self, key: &NodeKey) -> Claim {
        let flight = {
            let mut inflight = self.inflight.lock();
            match inflight.get(key) {
                Some(flight) => flight.clone(),
                None => {
                    let flight = Arc::new(Flight::new());
                    inflight.insert(key.clone(), flight.clone());
                    return Claim::Lead(flight);
                }
            }
        };
        Claim::Joined(flight.wait())
    }

    /// Complete a flight and release all waiters.
    ///
    /// The entry is removed before the signal fires: a requester arriving
    /// afterwards starts a fresh claim and finds the committed value (or,
    /// after a failure, retries the computation).
    pub fn finish(&self, key: &NodeKey, flight: &Flight, outcome: Result<NodeValue, EvalError>) {
        self.inflight.lock().remove(key);
        flight.complete(outcome);
    }
}

/// A single-use completion signal for one key's computation.
pub(crate) struct Flight {
    outcome: Mutex<Option<Result<NodeValue, EvalError>>>,
    done: Condvar,
}

impl Flight {
    fn new() -> Self {
        Self { outcome: Mutex::new(None), done: Condvar::new() }
    }

    /// Block until the leader completes, then share its outcome.
    fn wait(&self) -> Result<NodeValue, EvalError> {
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(shared) = &*outcome {
                return shared.clone();
            }
            self.done.wait(&mut outcome);
        }
    }

    fn complete(&self, result: Result<NodeValue, EvalError>) {
        *self.outcome.lock() = Some(result);
        self.done.notify_all();
    }
}
