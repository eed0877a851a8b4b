use varstate_dispatch::ReduceError;

/// A reducer failed (or an object declared itself un-reducible) while walking a specific
/// root. The walker catches this at the root boundary: the root's partial label set is kept,
/// the error is logged, and the overall walk continues with the remaining roots. This type
/// exists so the walker's internal handling is testable and so `tracing` events carry
/// structured detail, not to be propagated out of [`crate::walker::Walker::walk`].
#[derive(thiserror::Error, Debug, Clone)]
#[error("walking root `{root}`: {source}")]
pub struct WalkError {
    pub root: String,
    #[source]
    pub source: ReduceError,
}

/// A RAW-stage hasher declined to hash an object. Folded to [`crate::detector::Verdict::CantHash`]
/// at the call site rather than propagated: this is a classification outcome, not a failure
/// that should abort the commit, but it's kept as a concrete type so the reason reaches a
/// `tracing` event instead of being silently swallowed.
#[derive(thiserror::Error, Debug, Clone)]
#[error("cannot hash `{type_name}`: {reason}")]
pub struct DetectError {
    pub type_name: &'static str,
    pub reason: String,
}

impl DetectError {
    pub fn new(type_name: &'static str, reason: impl Into<String>) -> Self {
        Self { type_name, reason: reason.into() }
    }
}

/// An [`crate::change::AtomicChange`] could not be applied or transferred.
#[derive(thiserror::Error, Debug)]
pub enum ChangeError {
    /// `apply` or `transfer` was called a second time on the same change.
    #[error("data already processed")]
    AlreadyConsumed,
    /// The deserializer could not resolve a global reference while materializing a change.
    #[error("failed to import `{module}::{name}` while applying a change")]
    Import { module: String, name: String },
    /// The payload bytes were structurally invalid (truncated, bad tag, etc).
    #[error("malformed payload for `{var}`: {reason}")]
    Malformed { var: String, reason: String },
}
