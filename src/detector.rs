//! The two-stage change detector: classifies a variable's RAW live value and, failing that,
//! its PICKLED byte buffer into `NEW | CHANGED | UNCHANGED | CANT_HASH`.
//!
//! The RAW stage dispatches a hasher by `TypeId`, the same sharding shape as the reducer
//! dispatch table in `varstate_dispatch::Dispatch`, here mapping a type to "how do I hash
//! this object cheaply" instead of "how do I decompose this object."

use std::any::TypeId;
use std::hash::Hasher;

use ahash::AHasher;
use hash_hasher::HashBuildHasher;
use hashbrown::HashMap;
use std::rc::Rc;

use varstate_dispatch::Object;

use crate::error::DetectError;
use crate::value::Scalar;

/// The outcome of classifying one value at one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    New,
    Changed,
    Unchanged,
    CantHash,
}

/// A third-party (or built-in) hasher for the RAW stage, registered against a `TypeId`.
/// Returns `Err` if the object cannot be hashed safely (non-contiguous data, an unregistered
/// type, etc); the caller converts that to [`Verdict::CantHash`] rather than propagating it,
/// but the reason still reaches a `tracing` event via [`DetectError`] instead of being
/// swallowed.
pub trait RawHasher {
    fn hash_raw(&self, obj: &Object) -> Result<u64, DetectError>;
}

struct ScalarHasher;

impl RawHasher for ScalarHasher {
    fn hash_raw(&self, obj: &Object) -> Result<u64, DetectError> {
        let scalar = obj
            .as_any()
            .downcast_ref::<Scalar>()
            .ok_or_else(|| DetectError::new("unknown", "no RAW hasher registered for this type"))?;
        let mut hasher = AHasher::default();
        match scalar {
            Scalar::None => hasher.write_u8(0),
            Scalar::Bool(b) => hasher.write_u8(if *b { 1 } else { 2 }),
            Scalar::Int(i) => hasher.write_i64(*i),
            Scalar::Float(f) => hasher.write_u64(f.to_bits()),
            Scalar::Bytes(b) => hasher.write(b),
            Scalar::Str(s) => hasher.write(s.as_bytes()),
        }
        Ok(hasher.finish())
    }
}

/// Classifies changes to namespace variables across a transaction.
///
/// `begin()`/`end()` bracket a single commit: the RAW cache is populated during the
/// transaction and cleared at `end()`, so a name re-touched in a later, unrelated
/// transaction doesn't see a stale RAW verdict.
pub struct ChangeDetector {
    raw_hashers: HashMap<TypeId, Rc<dyn RawHasher>, HashBuildHasher>,
    stored_raw: HashMap<String, u64>,
    stored_pickled: HashMap<String, u64>,
    raw_cache: HashMap<String, Verdict>,
}

impl ChangeDetector {
    pub fn new() -> Self {
        let mut raw_hashers: HashMap<TypeId, Rc<dyn RawHasher>, HashBuildHasher> =
            HashMap::default();
        raw_hashers.insert(TypeId::of::<Scalar>(), Rc::new(ScalarHasher));
        Self {
            raw_hashers,
            stored_raw: HashMap::new(),
            stored_pickled: HashMap::new(),
            raw_cache: HashMap::new(),
        }
    }

    /// Register (or replace) the RAW-stage hasher for a type, e.g. a third-party dataframe
    /// or tensor value.
    pub fn register_raw_hasher(&mut self, ty: TypeId, hasher: Rc<dyn RawHasher>) {
        self.raw_hashers.insert(ty, hasher);
    }

    /// Clear the RAW cache at the start of a transaction.
    pub fn begin(&mut self) {
        self.raw_cache.clear();
    }

    /// Clear the RAW cache at the end of a transaction.
    pub fn end(&mut self) {
        self.raw_cache.clear();
    }

    /// Classify `name`'s live value at the RAW stage, caching the verdict for reuse by the
    /// PICKLED stage within the same transaction.
    pub fn classify_raw(&mut self, name: &str, value: &Object) -> Verdict {
        let hash = match self.raw_hashers.get(&value.as_any().type_id()) {
            Some(hasher) => hasher.hash_raw(value),
            None => Err(DetectError::new(
                "unknown",
                "no RAW hasher registered for this type",
            )),
        };

        let verdict = match hash {
            Err(err) => {
                tracing::debug!(var = %name, error = %err, "RAW hash unavailable, falling back to PICKLED");
                Verdict::CantHash
            }
            Ok(hash) => match self.stored_raw.insert(name.to_string(), hash) {
                None => Verdict::New,
                Some(previous) if previous == hash => Verdict::Unchanged,
                Some(_) => Verdict::Changed,
            },
        };
        self.raw_cache.insert(name.to_string(), verdict);
        verdict
    }

    /// Classify `name`'s serialized byte buffer at the PICKLED stage. If the RAW stage
    /// already produced a definite (non-`CantHash`) verdict for this name this transaction,
    /// that verdict is reused and no pickled hash is computed.
    pub fn classify_pickled(&mut self, name: &str, bytes: &[u8]) -> Verdict {
        if let Some(verdict) = self.raw_cache.get(name) {
            if *verdict != Verdict::CantHash {
                return *verdict;
            }
        }

        let mut hasher = AHasher::default();
        hasher.write(bytes);
        let hash = hasher.finish();

        match self.stored_pickled.insert(name.to_string(), hash) {
            None => Verdict::New,
            Some(previous) if previous == hash => Verdict::Unchanged,
            Some(_) => Verdict::Changed,
        }
    }

    /// Drop all remembered hashes for `name`, e.g. after the variable is deleted.
    pub fn forget(&mut self, name: &str) {
        self.stored_raw.remove(name);
        self.stored_pickled.remove(name);
        self.raw_cache.remove(name);
    }
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self::new()
    }
}
