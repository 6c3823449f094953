use std::sync::Arc;

use thiserror::Error;

use crate::key::{FunctionKind, NodeKey};

/// An evaluation failure.
///
/// Errors are shared verbatim with every requester waiting on the failing
/// key and are never stored in the memo table: the key keeps its prior
/// state, so a later request may retry the computation.
#[derive(Debug, Clone, Error)]
pub enum EvalError {
    /// A key transitively requested itself while its own computation was
    /// still in flight. The path runs from the in-flight occurrence of the
    /// key down to the repeated request, so its first and last element are
    /// the same key.
    #[error("dependency cycle: {}", format_cycle(.path))]
    Cycle { path: Arc<[NodeKey]> },

    /// The computation function registered for the key's kind failed.
    #[error("computation of {key:?} failed: {source:#}")]
    Computation {
        key: NodeKey,
        source: Arc<anyhow::Error>,
    },

    /// No computation function is registered for the key's kind.
    #[error("no computation function registered for kind `{0}`")]
    UnknownKind(FunctionKind),
}

impl EvalError {
    pub(crate) fn computation(key: &NodeKey, source: anyhow::Error) -> Self {
        Self::Computation { key: key.clone(), source: Arc::new(source) }
    }

    /// The keys forming the cycle, if this is a cycle error.
    pub fn cycle(&self) -> Option<&[NodeKey]> {
        match self {
            Self::Cycle { path } => Some(path),
            _ => None,
        }
    }
}

fn format_cycle(path: &[NodeKey]) -> String {
    let mut out = String::new();
    for (i, key) in path.iter().enumerate() {
        if i > 0 {
            out.push_str(" -> ");
        }
        out.push_str(&format!("{key:?}"));
    }
    out
}
