#![deny(clippy::all)]

//! Incremental, component-aware state serialization for interactive namespaces.
//!
//! A notebook-style execution namespace accumulates variables across cells; naively
//! re-serializing the whole namespace after every cell is wasteful and, for variables that
//! close over shared mutable state, not even well-defined. This crate tracks which variables
//! were touched or deleted since the last commit, partitions the reachable object graph into
//! connected components (so objects that share identity serialize and travel together), and
//! emits a minimal batch of atomic changes a consumer can apply or ship elsewhere.
//!
//! The four moving pieces, in the order a commit exercises them:
//! - [`walker::Walker`] computes the current component partition from the live roots.
//! - [`serializer::Serializer`] dumps each affected component through a shared,
//!   memo-backed pickler, or as a bare primitive payload for singleton scalar components.
//! - [`detector::ChangeDetector`] classifies each serialized variable so unchanged
//!   components don't produce a change.
//! - [`change::AtomicChange`] is the single-use unit of output; [`manager::StateManager`]
//!   orchestrates all of the above over a [`namespace::Namespace`]. Applying a change back
//!   into a namespace runs the pipeline in reverse through [`deserialize::Deserializer`],
//!   the serializer's inverse.
//!
//! Reducer implementations for the built-in value kinds live in [`value`]; third-party types
//! plug into the same [`varstate_dispatch::Dispatch`] table the built-ins use.

pub mod change;
pub mod config;
pub mod deserialize;
pub mod detector;
pub mod error;
pub mod manager;
pub mod namespace;
pub mod persist;
pub mod serializer;
pub mod value;
pub mod walker;

pub use change::{AtomicChange, Payload};
pub use config::WalkLimits;
pub use deserialize::{DefaultGlobalResolver, Deserializer, GlobalResolver};
pub use detector::{ChangeDetector, Verdict};
pub use error::{ChangeError, DetectError, WalkError};
pub use manager::StateManager;
pub use namespace::{DefaultPersistable, Namespace, Persistable};
pub use persist::{DefaultPrimitiveFormatter, PrimitiveFormatter};
pub use serializer::{Dump, Serializer, VarDecl};
pub use walker::Walker;

pub use varstate_dispatch::{
    ChunkedWriter, Constructor, Dispatch, ExternalReducer, MemoSnapshot, Object, Reduce,
    ReduceError, Reduction, TransactionalMemo,
};
