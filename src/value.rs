//! Built-in [`Reduce`] implementations mandated by the reducer dispatch contract: primitive
//! scalars, the four built-in containers, functions and their code objects, modules, weak
//! references, and thread handles. Third-party types never implement this trait directly;
//! they either implement `Reduce` themselves in a downstream crate or are overridden via an
//! [`ExternalReducer`](varstate_dispatch::ExternalReducer) registered in the [`Dispatch`]
//! table.

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;

use bytes::Bytes;
use varstate_dispatch::{Constructor, Dispatch, Object, Reduce, ReduceError, Reduction};

/// A constant leaf value: `None`, a bool, an integer, a float, a byte string, or a text
/// string. Never recurses and never accumulates labels across roots.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Bytes(Bytes),
    Str(String),
}

impl Reduce for Scalar {
    fn reduce(&self, _dispatch: &Dispatch) -> Result<Reduction, ReduceError> {
        Ok(Reduction::Constant)
    }

    fn type_name(&self) -> &'static str {
        match self {
            Scalar::None => "NoneType",
            Scalar::Bool(_) => "bool",
            Scalar::Int(_) => "int",
            Scalar::Float(_) => "float",
            Scalar::Bytes(_) => "bytes",
            Scalar::Str(_) => "str",
        }
    }
}

/// An immutable, fixed-size sequence. A tuple made entirely of constants is itself treated
/// as a constant: the walker need not visit its members, since there is nothing mutable or
/// shared to track. Any other tuple reduces normally with its elements as args.
#[derive(Debug, Clone)]
pub struct Tuple(pub Vec<Object>);

impl Reduce for Tuple {
    fn reduce(&self, dispatch: &Dispatch) -> Result<Reduction, ReduceError> {
        let mut all_constant = true;
        for child in &self.0 {
            if !matches!(dispatch.reduce(child)?, Reduction::Constant) {
                all_constant = false;
                break;
            }
        }
        if all_constant {
            return Ok(Reduction::Constant);
        }
        Ok(Reduction::Value {
            constructor: Constructor::Tuple,
            args: self.0.clone(),
            state: None,
            list_items: vec![],
            dict_items: vec![],
        })
    }

    fn type_name(&self) -> &'static str {
        "tuple"
    }
}

/// A mutable, ordered sequence. Reduced via the pickle `list_items` protocol step: an empty
/// list is constructed, then extended with each item in order.
#[derive(Debug, Default)]
pub struct List(pub RefCell<Vec<Object>>);

impl Reduce for List {
    fn reduce(&self, _dispatch: &Dispatch) -> Result<Reduction, ReduceError> {
        Ok(Reduction::Value {
            constructor: Constructor::List,
            args: vec![],
            state: None,
            list_items: self.0.borrow().clone(),
            dict_items: vec![],
        })
    }

    fn type_name(&self) -> &'static str {
        "list"
    }
}

/// A mutable set of distinct members (distinctness is the caller's responsibility; this
/// value is a container, not an enforcement point).
#[derive(Debug, Default)]
pub struct SetValue(pub RefCell<Vec<Object>>);

impl Reduce for SetValue {
    fn reduce(&self, _dispatch: &Dispatch) -> Result<Reduction, ReduceError> {
        Ok(Reduction::Value {
            constructor: Constructor::Set,
            args: vec![],
            state: None,
            list_items: self.0.borrow().clone(),
            dict_items: vec![],
        })
    }

    fn type_name(&self) -> &'static str {
        "set"
    }
}

/// An immutable set of distinct members.
#[derive(Debug)]
pub struct FrozenSetValue(pub Vec<Object>);

impl Reduce for FrozenSetValue {
    fn reduce(&self, _dispatch: &Dispatch) -> Result<Reduction, ReduceError> {
        Ok(Reduction::Value {
            constructor: Constructor::FrozenSet,
            args: vec![],
            state: None,
            list_items: self.0.clone(),
            dict_items: vec![],
        })
    }

    fn type_name(&self) -> &'static str {
        "frozenset"
    }
}

/// A mutable mapping, preserving insertion order.
#[derive(Debug, Default)]
pub struct DictValue(pub RefCell<Vec<(Object, Object)>>);

impl Reduce for DictValue {
    fn reduce(&self, _dispatch: &Dispatch) -> Result<Reduction, ReduceError> {
        Ok(Reduction::Value {
            constructor: Constructor::Dict,
            args: vec![],
            state: None,
            list_items: vec![],
            dict_items: self.0.borrow().clone(),
        })
    }

    fn type_name(&self) -> &'static str {
        "dict"
    }
}

/// A function's code: its referenced global names (free variables resolved against the
/// enclosing namespace at call time, per §9) plus an opaque identifier for its compiled
/// body. Always a constant leaf on its own; the walker special-cases code objects to
/// additionally fold `globals` into the current label set, modeling unresolved global
/// references inside the function body (see `walker::Walker`).
#[derive(Debug, Clone)]
pub struct CodeValue {
    pub qualname: String,
    pub globals: Vec<String>,
}

impl Reduce for CodeValue {
    fn reduce(&self, _dispatch: &Dispatch) -> Result<Reduction, ReduceError> {
        Ok(Reduction::Constant)
    }

    fn type_name(&self) -> &'static str {
        "code"
    }
}

/// A function object, reduced to its code plus its captured environment (the values of the
/// free variables closed over at definition time (*not* a snapshot of the whole namespace);
/// unresolved global names are instead recovered via `CodeValue::globals` at the walker
/// level).
#[derive(Debug, Clone)]
pub struct FunctionValue {
    pub code: Object,
    pub env: Vec<Object>,
}

impl Reduce for FunctionValue {
    fn reduce(&self, _dispatch: &Dispatch) -> Result<Reduction, ReduceError> {
        let mut args = Vec::with_capacity(1 + self.env.len());
        args.push(self.code.clone());
        args.extend(self.env.iter().cloned());
        Ok(Reduction::Value {
            constructor: Constructor::Function,
            args,
            state: None,
            list_items: vec![],
            dict_items: vec![],
        })
    }

    fn type_name(&self) -> &'static str {
        "function"
    }
}

/// A module, reduced to an import of its name rather than a snapshot of its contents.
#[derive(Debug, Clone)]
pub struct ModuleValue {
    pub name: String,
}

impl Reduce for ModuleValue {
    fn reduce(&self, _dispatch: &Dispatch) -> Result<Reduction, ReduceError> {
        Ok(Reduction::GlobalRef { module: self.name.clone(), name: self.name.clone() })
    }

    fn type_name(&self) -> &'static str {
        "module"
    }
}

/// A weak reference to another tracked object. The referent is a genuine child (the walker
/// must still be able to find it), unlike a thread handle or scalar.
#[derive(Debug, Clone)]
pub struct WeakRefValue {
    pub target: Object,
}

impl Reduce for WeakRefValue {
    fn reduce(&self, _dispatch: &Dispatch) -> Result<Reduction, ReduceError> {
        Ok(Reduction::Value {
            constructor: Constructor::WeakRef,
            args: vec![self.target.clone()],
            state: None,
            list_items: vec![],
            dict_items: vec![],
        })
    }

    fn type_name(&self) -> &'static str {
        "weakref"
    }
}

/// A threading primitive (lock, thread handle, condition variable, ...). Always a constant:
/// these have no meaningful persisted representation and no children to walk.
pub struct ThreadHandleValue {
    pub kind: &'static str,
}

impl fmt::Debug for ThreadHandleValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadHandleValue").field("kind", &self.kind).finish()
    }
}

impl Reduce for ThreadHandleValue {
    fn reduce(&self, _dispatch: &Dispatch) -> Result<Reduction, ReduceError> {
        Ok(Reduction::Constant)
    }

    fn type_name(&self) -> &'static str {
        self.kind
    }
}

/// A marker object a closure's captured environment can hold in place of a full snapshot of
/// the namespace it closes over. The serializer recognizes this type specially (before
/// generic dispatch) and writes a symbolic `"__ns__"` reference instead of recursing; the
/// deserializer resolves that reference back to the live namespace at load time. This is how
/// a function capturing its module's globals avoids embedding a copy of every global.
#[derive(Debug, Clone)]
pub struct NamespaceHandle;

impl Reduce for NamespaceHandle {
    fn reduce(&self, _dispatch: &Dispatch) -> Result<Reduction, ReduceError> {
        Ok(Reduction::Constant)
    }

    fn type_name(&self) -> &'static str {
        "namespace"
    }
}

/// The generic fallback for a user type with no dedicated reconstruction logic: holds the
/// pieces of a `Reduction::Value` so something can still be allocated for a
/// `Constructor::Custom` payload (e.g. one a [`crate::deserialize::Deserializer`]
/// reconstructs from the wire format) even without the original Rust type's own `Reduce`
/// impl available to rebuild it.
#[derive(Debug, Clone)]
pub struct OpaqueValue {
    pub type_name: String,
    pub args: Vec<Object>,
    pub state: Option<Object>,
    pub list_items: Vec<Object>,
    pub dict_items: Vec<(Object, Object)>,
}

impl Reduce for OpaqueValue {
    fn reduce(&self, _dispatch: &Dispatch) -> Result<Reduction, ReduceError> {
        Ok(Reduction::Value {
            constructor: Constructor::Custom(self.type_name.clone()),
            args: self.args.clone(),
            state: self.state.clone(),
            list_items: self.list_items.clone(),
            dict_items: self.dict_items.clone(),
        })
    }

    fn type_name(&self) -> &'static str {
        intern_type_name(&self.type_name)
    }
}

/// Leaks and interns a runtime type name once per distinct string. `Reduce::type_name` must
/// return `&'static str`, but an `OpaqueValue` rebuilt from wire bytes only learns its type
/// name at runtime; caching the leak keeps repeated decodes of the same custom type from
/// leaking more than once.
fn intern_type_name(name: &str) -> &'static str {
    thread_local! {
        static INTERNED: RefCell<HashSet<&'static str>> = RefCell::new(HashSet::new());
    }
    INTERNED.with(|set| {
        if let Some(&existing) = set.borrow().get(name) {
            return existing;
        }
        let leaked: &'static str = Box::leak(name.to_string().into_boxed_str());
        set.borrow_mut().insert(leaked);
        leaked
    })
}

/// An object with no sensible decomposition, used by tests and as the terminal case of
/// "un-reducible" for the error-handling scenarios in §7/§8.
#[derive(Debug)]
pub struct Unreducible {
    pub type_name: &'static str,
}

impl Reduce for Unreducible {
    fn reduce(&self, _dispatch: &Dispatch) -> Result<Reduction, ReduceError> {
        Err(ReduceError::new(self.type_name, "no reducer is registered and the object supplies none"))
    }

    fn type_name(&self) -> &'static str {
        self.type_name
    }
}
