//! Atomic changes: the units a commit emits and a consumer applies or ships elsewhere.
//! Each instance may be consumed exactly once, by either [`AtomicChange::apply`] or
//! [`AtomicChange::transfer`], never both, never twice.

use std::cell::Cell;

use bytes::Bytes;

use crate::deserialize::{DefaultGlobalResolver, Deserializer};
use crate::error::ChangeError;
use crate::namespace::Namespace;
use crate::serializer::VarDecl;
use crate::value::Scalar;

thread_local! {
    // A plain `Cell`, not an atomic: the engine is single-threaded cooperative (see the
    // concurrency model), so there is no other thread to race with.
    static NEXT_ID: Cell<u64> = Cell::new(1);
}

fn next_id() -> u64 {
    NEXT_ID.with(|cell| {
        let id = cell.get();
        cell.set(id + 1);
        id
    })
}

/// What a [`AtomicChange`] does when applied.
#[derive(Debug)]
pub enum Payload {
    Primitive { var: VarDecl, payload: Bytes },
    Component {
        all_vars: Vec<VarDecl>,
        serialized_vars: Vec<(String, Bytes)>,
        non_serialized_vars: std::collections::HashSet<String>,
    },
    Remove { name: String },
}

/// One atomic unit of a commit's output. Carries a unique id and a payload, and enforces
/// single consumption: after the first call to `apply` or `transfer`, any further call
/// fails with [`ChangeError::AlreadyConsumed`] rather than silently re-applying (or
/// re-shipping) the same data.
#[derive(Debug)]
pub struct AtomicChange {
    id: u64,
    payload: Cell<Option<Payload>>,
}

impl AtomicChange {
    pub fn new(payload: Payload) -> Self {
        Self { id: next_id(), payload: Cell::new(Some(payload)) }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Names this change touches, for ordering ("apply primitive/component changes, then
    /// removes") and diagnostics. Does not consume the change.
    pub fn names(&self) -> Vec<String> {
        // SAFETY-free peek: `Cell::take`/`set` round-trip without ever exposing `None` to a
        // caller, since we always put the value back immediately.
        let payload = self.payload.take();
        let names = match &payload {
            Some(Payload::Primitive { var, .. }) => vec![var.name.clone()],
            Some(Payload::Component { all_vars, .. }) => {
                all_vars.iter().map(|v| v.name.clone()).collect()
            }
            Some(Payload::Remove { name }) => vec![name.clone()],
            None => vec![],
        };
        self.payload.set(payload);
        names
    }

    /// Whether this is a [`Payload::Remove`], used to order removes last within a commit.
    pub fn is_remove(&self) -> bool {
        let payload = self.payload.take();
        let is_remove = matches!(payload, Some(Payload::Remove { .. }));
        self.payload.set(payload);
        is_remove
    }

    /// Materialize this change into `ns` with tracking disarmed, then clear dirtiness for the
    /// names it touched so applying a change doesn't itself look dirty to the next commit.
    pub fn apply(&self, ns: &mut Namespace) -> Result<(), ChangeError> {
        let payload = self.payload.take().ok_or(ChangeError::AlreadyConsumed)?;
        let names = match payload {
            Payload::Primitive { var, payload } => {
                let value = decode_primitive(&var, &payload)?;
                ns.disarmed(|ns| ns.set(var.name.clone(), value));
                vec![var.name]
            }
            Payload::Component { all_vars, serialized_vars, non_serialized_vars } => {
                // Decode every variable before touching `ns`, so a malformed or
                // unresolvable member aborts before any partial write lands.
                let resolver = DefaultGlobalResolver;
                let mut deserializer = Deserializer::new(&resolver);
                let mut decoded = Vec::with_capacity(serialized_vars.len());
                for (name, bytes) in &serialized_vars {
                    let value = deserializer.decode(name, bytes)?;
                    decoded.push((name.clone(), value));
                }

                let mut names = Vec::with_capacity(decoded.len() + non_serialized_vars.len());
                for (name, value) in decoded {
                    ns.disarmed(|ns| ns.set(name.clone(), value));
                    names.push(name);
                }
                names.extend(non_serialized_vars.iter().cloned());
                let _ = all_vars;
                names
            }
            Payload::Remove { name } => {
                ns.disarmed(|ns| ns.delete(&name));
                vec![name]
            }
        };
        ns.clear_dirty_for(names);
        Ok(())
    }

    /// Hand this change's payload to `sink` instead of applying it locally. Also single-use.
    pub fn transfer(&self, sink: &mut dyn FnMut(Payload)) -> Result<(), ChangeError> {
        let payload = self.payload.take().ok_or(ChangeError::AlreadyConsumed)?;
        sink(payload);
        Ok(())
    }
}

fn decode_primitive(var: &VarDecl, payload: &Bytes) -> Result<std::rc::Rc<Scalar>, ChangeError> {
    let malformed = || ChangeError::Malformed { var: var.name.clone(), reason: "truncated payload".into() };
    let tag = *payload.first().ok_or_else(malformed)?;
    let body = &payload[1..];
    let scalar = match tag {
        0 => Scalar::None,
        1 => Scalar::Bool(*body.first().ok_or_else(malformed)? != 0),
        2 => Scalar::Int(i64::from_le_bytes(body.try_into().map_err(|_| malformed())?)),
        3 => Scalar::Float(f64::from_le_bytes(body.try_into().map_err(|_| malformed())?)),
        4 => Scalar::Bytes(Bytes::copy_from_slice(body)),
        5 => Scalar::Str(String::from_utf8(body.to_vec()).map_err(|_| malformed())?),
        _ => return Err(malformed()),
    };
    Ok(std::rc::Rc::new(scalar))
}
