use hash_hasher::HashBuildHasher;
use hashbrown::HashMap;
use std::any::TypeId;
use std::rc::Rc;

use crate::reduce::{Object, ReduceError, Reduction};

/// A third-party override for the reduction of a specific runtime type, installed into a
/// [`Dispatch`] before a serialization run begins.
///
/// Unlike [`Reduce`](crate::Reduce), which a type implements once for itself, an
/// `ExternalReducer` is registered *against* a `TypeId` without requiring the target type to
/// know about the dispatch table at all. This is how a dataframe or tensor plug-in can
/// override the reduction of a type it doesn't own.
pub trait ExternalReducer {
    /// Reduce `obj`, which is guaranteed to be the concrete type this reducer was registered
    /// for.
    fn reduce(&self, obj: &Object, dispatch: &Dispatch) -> Result<Reduction, ReduceError>;
}

/// Maps a runtime type to a [`Reduce`](crate::Reduce) override. `TypeId`s are globally
/// unique and pre-hashed by rustc, so, as in `dyn_cache`'s per-type namespace sharding, we
/// use a pass-through [`HashBuildHasher`] rather than re-hashing them.
///
/// The table is copy-on-write per serializer instance: cloning a `Dispatch` is a cheap `Rc`
/// bump, and [`Dispatch::register`] only actually clones the underlying map the first time a
/// given instance diverges from whatever it was cloned from.
#[derive(Clone, Default)]
pub struct Dispatch {
    inner: Rc<HashMap<TypeId, Rc<dyn ExternalReducer>, HashBuildHasher>>,
}

impl Dispatch {
    /// Start a fresh table with no overrides; every type falls back to its own
    /// [`Reduce`](crate::Reduce) impl.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace the reducer for `ty`. Copy-on-write: if this table shares its
    /// backing map with another clone, the map is cloned first.
    pub fn register(&mut self, ty: TypeId, reducer: Rc<dyn ExternalReducer>) {
        Rc::make_mut(&mut self.inner).insert(ty, reducer);
    }

    /// Look up the override registered for `ty`, if any.
    pub fn get(&self, ty: TypeId) -> Option<&Rc<dyn ExternalReducer>> {
        self.inner.get(&ty)
    }

    /// Reduce `obj`: prefer a registered override for its concrete type, otherwise fall back
    /// to the object's own [`Reduce::reduce`](crate::Reduce::reduce).
    pub fn reduce(&self, obj: &Object) -> Result<Reduction, ReduceError> {
        if let Some(reducer) = self.get(obj.as_any().type_id()) {
            reducer.reduce(obj, self)
        } else {
            obj.reduce(self)
        }
    }

    /// Number of registered overrides, exposed mainly for tests.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
