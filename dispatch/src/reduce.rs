use downcast_rs::{impl_downcast, Downcast};
use std::fmt::Debug;
use std::rc::Rc;

use crate::table::Dispatch;

/// A value reachable from a namespace root. Held behind `Rc` rather than `Arc`: the whole
/// engine is single-threaded cooperative (see the concurrency model), so there is no reason
/// to pay for atomic refcounting. Two handles denote the same object iff [`Rc::ptr_eq`]
/// holds; the walker and the transactional memo both key off `Rc::as_ptr(&handle) as usize`.
pub type Object = Rc<dyn Reduce>;

/// A value that can describe its own decomposition into a constructor plus child objects.
///
/// Built-in kinds (scalars, tuples, lists, sets, frozensets, dicts, functions, code objects,
/// modules, weak references, thread handles) implement this directly. User types that have
/// no [`ExternalReducer`](crate::ExternalReducer) registered for their `TypeId` fall back to
/// their own `reduce` impl, which is the "generic mechanism supplied by the object itself"
/// the dispatch contract names.
pub trait Reduce: Downcast + Debug {
    /// Produce this object's reduction, given the dispatch table in effect for the current
    /// serialization run (so a `Reduce` impl may recurse into third-party overrides for its
    /// own children rather than only ever using its own built-in behavior).
    ///
    /// Returns `Err` for an un-reducible object (no registered override and no sensible
    /// built-in decomposition); the walker and serializer both treat that as a per-object
    /// failure to be logged and isolated rather than a reason to abort the whole run.
    fn reduce(&self, dispatch: &Dispatch) -> Result<Reduction, ReduceError>;

    /// The runtime type name recorded in variable declarations and non-serialized-var
    /// diagnostics.
    fn type_name(&self) -> &'static str;
}

impl_downcast!(Reduce);

/// The outcome of reducing one object, mirroring the three shapes a reducer may return.
#[derive(Debug, Clone)]
pub enum Reduction {
    /// Treat as a constant leaf: no children, no memoization required, and the object is
    /// *unvisited* for the purposes of label accumulation across roots.
    Constant,
    /// Save by global reference: reconstruct via `import module; module.name`.
    GlobalRef { module: String, name: String },
    /// Reconstruct via `constructor(args..)`, optionally followed by restoring `state` and
    /// appending `list_items`/`dict_items` (the pickle `__setstate__`/`extend`/`update`
    /// protocol steps).
    Value {
        constructor: Constructor,
        args: Vec<Object>,
        state: Option<Object>,
        list_items: Vec<Object>,
        dict_items: Vec<(Object, Object)>,
    },
}

/// Identifies how a reduced value's constructor should be invoked on reconstruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constructor {
    Tuple,
    List,
    Set,
    FrozenSet,
    Dict,
    Function,
    Code,
    Module,
    WeakRef,
    /// A user type reconstructed by a registered or self-supplied reducer, named by its
    /// runtime type.
    Custom(String),
}

/// A reducer failed to decompose an object, or the object declares itself un-reducible.
#[derive(thiserror::Error, Debug, Clone)]
#[error("object of type `{type_name}` is not reducible: {reason}")]
pub struct ReduceError {
    pub type_name: &'static str,
    pub reason: String,
}

impl ReduceError {
    pub fn new(type_name: &'static str, reason: impl Into<String>) -> Self {
        Self { type_name, reason: reason.into() }
    }
}
