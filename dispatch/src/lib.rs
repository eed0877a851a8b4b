#![deny(clippy::all)]

//! The type-erased substrate the `varstate` engine builds on: the [`Reduce`]/[`Reduction`]
//! contract that every walked or serialized value implements, the [`Dispatch`] table that
//! lets third-party reducers override the generic per-object reduction, the
//! [`ChunkedWriter`] append-only byte sink, and the [`TransactionalMemo`] interning table
//! that backs the component serializer's per-variable rollback.
//!
//! Storage here is sharded by [`std::any::TypeId`], the same shape
//! `dyn_cache::sync`/`dyn_cache::local` use to shard cached query results, though where
//! `dyn-cache` shards *memoized function outputs*, this crate shards *reducer
//! implementations*.

mod memo;
mod reduce;
mod table;
mod writer;

pub use memo::{MemoSnapshot, TransactionalMemo};
pub use reduce::{Constructor, Object, Reduce, ReduceError, Reduction};
pub use table::{Dispatch, ExternalReducer};
pub use writer::ChunkedWriter;
