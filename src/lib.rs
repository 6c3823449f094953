//! Demand-driven incremental evaluation for build graphs.
//!
//! A build graph addresses every computed artifact by an immutable
//! [`NodeKey`]: a function kind plus kind-specific payload data. Asking the
//! [`Evaluator`] for a key's value either serves a cached [`NodeValue`] or
//! runs the computation function registered for the key's kind, recording
//! every input the computation reads along the way. When an externally owned
//! input changes later, everything that transitively depended on it is
//! marked dirty and recomputed on its next request; everything else keeps
//! being served from cache.
//!
//! ```
//! use std::sync::Arc;
//!
//! use memograph::{EvalContext, Evaluator, FunctionKind, NodeKey};
//!
//! const LENGTH: FunctionKind = FunctionKind::new("length");
//!
//! let mut evaluator = Evaluator::new();
//! evaluator.register_fn(LENGTH, |key: &NodeKey, _: &EvalContext| {
//!     let word: &String = key.payload().unwrap();
//!     Ok(Arc::new(word.len()))
//! });
//!
//! let key = NodeKey::new(LENGTH, String::from("incremental"));
//! let value = evaluator.evaluate(&key).unwrap();
//! assert_eq!(value.result::<usize>(), Some(&11));
//! ```

mod config;
mod error;
mod eval;
mod flight;
mod hash;
mod invalidate;
mod key;
mod memo;
mod value;

pub use crate::config::{
    BuildConfiguration, BuildOptions, CONFIGURATION_COLLECTION, ConfigurationBuilder,
    ConfigurationCollection, ConfigurationCollectionResolver, ConfigurationCollectionValue,
    ConfigurationKey, Package, PackageLabel, PackageProvider,
};
pub use crate::error::EvalError;
pub use crate::eval::{EvalContext, EvalStats, Evaluator, NodeFunction};
pub use crate::key::{FunctionKind, KeyPayload, NodeKey};
pub use crate::memo::{Lookup, MemoTable};
pub use crate::value::{ExternalId, NodeValue};
