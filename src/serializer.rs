//! The component serializer: turns a set of affected components into a lazy sequence of
//! [`Dump`]s, pickling non-primitive components through a shared, memo-backed writer so that
//! an object referenced by two variables in the same component is only emitted once.

use std::collections::HashSet;
use std::rc::Rc;

use varstate_dispatch::{
    ChunkedWriter, Constructor, Dispatch, Object, ReduceError, Reduction, TransactionalMemo,
};

use crate::namespace::Namespace;
use crate::persist::PrimitiveFormatter;
use crate::value::{NamespaceHandle, Scalar};

/// A variable's declared name and runtime type, carried alongside every dump so a consumer
/// can reconstruct or just display a change without touching the payload. Equality (and
/// hashing, via `name`) is by name alone: a variable's type can change across commits and
/// that shouldn't affect identity for the purposes of, e.g., deduplicating `all_vars`.
#[derive(Debug, Clone)]
pub struct VarDecl {
    pub name: String,
    pub type_name: &'static str,
}

impl PartialEq for VarDecl {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for VarDecl {}

/// One unit of serializer output.
#[derive(Debug)]
pub enum Dump {
    /// A singleton component holding a primitive value.
    Primitive { var: VarDecl, payload: bytes::Bytes },
    /// A (possibly multi-variable) component serialized through the pickle path.
    Component {
        all_vars: Vec<VarDecl>,
        serialized_vars: Vec<(String, bytes::Bytes)>,
        non_serialized_vars: HashSet<String>,
    },
}

/// Tag bytes for the component wire encoding. Not pickle-compatible; this crate owns both
/// ends of the format. `pub(crate)` so [`crate::deserialize`] can read back exactly the tags
/// written here.
pub(crate) mod tag {
    pub const MEMO_REF: u8 = 1;
    pub const NONE: u8 = 2;
    pub const BOOL: u8 = 3;
    pub const INT: u8 = 4;
    pub const FLOAT: u8 = 5;
    pub const BYTES: u8 = 6;
    pub const STR: u8 = 7;
    pub const GLOBAL_REF: u8 = 8;
    pub const VALUE: u8 = 9;
    pub const NS_REF: u8 = 10;
}

fn identity(obj: &Object) -> usize {
    Rc::as_ptr(obj) as *const () as usize
}

fn constructor_tag(c: &Constructor) -> (u8, Option<&str>) {
    match c {
        Constructor::Tuple => (0, None),
        Constructor::List => (1, None),
        Constructor::Set => (2, None),
        Constructor::FrozenSet => (3, None),
        Constructor::Dict => (4, None),
        Constructor::Function => (5, None),
        Constructor::Code => (6, None),
        Constructor::Module => (7, None),
        Constructor::WeakRef => (8, None),
        Constructor::Custom(name) => (9, Some(name.as_str())),
    }
}

fn write_len_prefixed(w: &mut ChunkedWriter, bytes: &[u8]) {
    w.write(&(bytes.len() as u32).to_le_bytes());
    w.write(bytes);
}

/// Encodes one component's variables into a shared [`ChunkedWriter`], consulting and
/// updating a shared [`TransactionalMemo`] so objects referenced by more than one variable
/// in the component are only ever written once.
struct Pickler<'a> {
    dispatch: &'a Dispatch,
    writer: &'a mut ChunkedWriter,
    memo: &'a mut TransactionalMemo,
}

impl<'a> Pickler<'a> {
    fn dump(&mut self, obj: &Object) -> Result<(), ReduceError> {
        if obj.as_any().downcast_ref::<NamespaceHandle>().is_some() {
            self.writer.write(&[tag::NS_REF]);
            return Ok(());
        }

        let id = identity(obj);
        if let Some(memo_id) = self.memo.get(id) {
            self.writer.write(&[tag::MEMO_REF]);
            self.writer.write(&memo_id.to_le_bytes());
            return Ok(());
        }

        if let Some(scalar) = obj.as_any().downcast_ref::<Scalar>() {
            self.write_scalar(scalar);
            return Ok(());
        }

        match self.dispatch.reduce(obj)? {
            Reduction::Constant => {
                // A non-Scalar constant (e.g. a CodeValue or thread handle): nothing
                // meaningful to persist beyond the marker itself.
                self.writer.write(&[tag::NONE]);
            }
            Reduction::GlobalRef { module, name } => {
                self.writer.write(&[tag::GLOBAL_REF]);
                write_len_prefixed(self.writer, module.as_bytes());
                write_len_prefixed(self.writer, name.as_bytes());
            }
            Reduction::Value { constructor, args, state, list_items, dict_items } => {
                let (memo_id, _) = self.memo.intern(id);
                self.writer.write(&[tag::VALUE]);
                self.writer.write(&memo_id.to_le_bytes());

                let (ctor_tag, custom_name) = constructor_tag(&constructor);
                self.writer.write(&[ctor_tag]);
                if let Some(name) = custom_name {
                    write_len_prefixed(self.writer, name.as_bytes());
                }

                self.writer.write(&(args.len() as u32).to_le_bytes());
                for arg in &args {
                    self.dump(arg)?;
                }

                self.writer.write(&[u8::from(state.is_some())]);
                if let Some(state) = &state {
                    self.dump(state)?;
                }

                self.writer.write(&(list_items.len() as u32).to_le_bytes());
                for item in &list_items {
                    self.dump(item)?;
                }

                self.writer.write(&(dict_items.len() as u32).to_le_bytes());
                for (k, v) in &dict_items {
                    self.dump(k)?;
                    self.dump(v)?;
                }
            }
        }
        Ok(())
    }

    fn write_scalar(&mut self, scalar: &Scalar) {
        match scalar {
            Scalar::None => self.writer.write(&[tag::NONE]),
            Scalar::Bool(b) => self.writer.write(&[tag::BOOL, u8::from(*b)]),
            Scalar::Int(i) => {
                self.writer.write(&[tag::INT]);
                self.writer.write(&i.to_le_bytes());
            }
            Scalar::Float(f) => {
                self.writer.write(&[tag::FLOAT]);
                self.writer.write(&f.to_le_bytes());
            }
            Scalar::Bytes(b) => {
                self.writer.write(&[tag::BYTES]);
                write_len_prefixed(self.writer, b);
            }
            Scalar::Str(s) => {
                self.writer.write(&[tag::STR]);
                write_len_prefixed(self.writer, s.as_bytes());
            }
        }
    }
}

/// Produces the affected set: the union of both partitions, merged into maximal groups (a
/// name present in a previous-partition component and a different current-partition
/// component pulls both into one group, since the two snapshots disagree about the
/// component's shape, so the whole merged name set must be treated as one unit), then
/// filtered down to the groups that intersect `dirty`.
fn affected_set(
    dirty: &HashSet<String>,
    prev_components: &[HashSet<String>],
    curr_components: &[HashSet<String>],
) -> Vec<HashSet<String>> {
    let mut index_of: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
    for component in prev_components.iter().chain(curr_components.iter()) {
        for name in component {
            let next = index_of.len();
            index_of.entry(name.as_str()).or_insert(next);
        }
    }
    let mut parent: Vec<usize> = (0..index_of.len()).collect();
    fn find(parent: &mut [usize], x: usize) -> usize {
        if parent[x] != x {
            parent[x] = find(parent, parent[x]);
        }
        parent[x]
    }

    for component in prev_components.iter().chain(curr_components.iter()) {
        let mut members = component.iter();
        if let Some(first) = members.next() {
            let root = find(&mut parent, index_of[first.as_str()]);
            for name in members {
                let idx = find(&mut parent, index_of[name.as_str()]);
                if idx != root {
                    parent[idx] = root;
                }
            }
        }
    }

    let mut groups: std::collections::HashMap<usize, HashSet<String>> = std::collections::HashMap::new();
    for (&name, &idx) in &index_of {
        let rep = find(&mut parent, idx);
        groups.entry(rep).or_default().insert(name.to_string());
    }

    groups
        .into_values()
        .filter(|group| group.iter().any(|name| dirty.contains(name)))
        .collect()
}

/// Orders the members of one component for the pickle path: primitives and values with no
/// outgoing references first, then lexicographically.
fn order_component<'n>(
    ns: &'n Namespace,
    component: &HashSet<String>,
    formatter: &dyn PrimitiveFormatter,
) -> Vec<(&'n str, &'n Object)> {
    let mut members: Vec<(&str, &Object)> = component
        .iter()
        .filter_map(|name| ns.get(name).map(|value| (name.as_str(), value)))
        .collect();
    members.sort_by(|(name_a, value_a), (name_b, value_b)| {
        let leaf_a = formatter.is_primitive(value_a);
        let leaf_b = formatter.is_primitive(value_b);
        leaf_b.cmp(&leaf_a).then_with(|| name_a.cmp(name_b))
    });
    members
}

/// Builds the lazy sequence of dumps for one commit.
pub struct Serializer<'a> {
    dispatch: &'a Dispatch,
    formatter: &'a dyn PrimitiveFormatter,
}

impl<'a> Serializer<'a> {
    pub fn new(dispatch: &'a Dispatch, formatter: &'a dyn PrimitiveFormatter) -> Self {
        Self { dispatch, formatter }
    }

    /// Produce one [`Dump`] per affected component. Borrows `ns` for its lifetime: per the
    /// concurrency model, the namespace must not be mutated while the returned iterator is
    /// alive.
    pub fn dump<'n: 'a>(
        &'a self,
        ns: &'n Namespace,
        dirty: &'a HashSet<String>,
        prev_components: &'a [HashSet<String>],
        curr_components: &'a [HashSet<String>],
    ) -> impl Iterator<Item = Dump> + 'a {
        affected_set(dirty, prev_components, curr_components)
            .into_iter()
            .filter_map(move |component| self.dump_component(ns, &component))
    }

    fn dump_component(&self, ns: &Namespace, component: &HashSet<String>) -> Option<Dump> {
        if component.len() == 1 {
            let name = component.iter().next().unwrap();
            let value = ns.get(name)?;
            if self.formatter.is_primitive(value) {
                let (payload, type_name) = self.formatter.primitive_var_repr(value);
                return Some(Dump::Primitive {
                    var: VarDecl { name: name.clone(), type_name },
                    payload,
                });
            }
        }

        let ordered = order_component(ns, component, self.formatter);
        let all_vars: Vec<VarDecl> = ordered
            .iter()
            .map(|(name, value)| VarDecl { name: name.to_string(), type_name: type_name_of(value) })
            .collect();

        let mut writer = ChunkedWriter::new();
        let mut memo = TransactionalMemo::new();
        let mut serialized_vars = Vec::new();
        let mut non_serialized_vars = HashSet::new();

        for (name, value) in ordered {
            let snapshot = memo.snapshot();
            let mut pickler = Pickler { dispatch: self.dispatch, writer: &mut writer, memo: &mut memo };
            match pickler.dump(value) {
                Ok(()) => {
                    serialized_vars.push((name.to_string(), writer.current_chunk()));
                    writer.reset();
                    memo.commit(snapshot);
                }
                Err(err) => {
                    tracing::warn!(var = %name, error = %err, "failed to serialize variable; rolled back");
                    writer.reset();
                    memo.rollback(snapshot);
                    non_serialized_vars.insert(name.to_string());
                }
            }
        }

        Some(Dump::Component { all_vars, serialized_vars, non_serialized_vars })
    }
}

fn type_name_of(value: &Object) -> &'static str {
    use varstate_dispatch::Reduce;
    value.type_name()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::DefaultPersistable;
    use crate::persist::DefaultPrimitiveFormatter;
    use crate::value::List;
    use std::cell::RefCell;

    fn scalar(n: i64) -> Object {
        Rc::new(Scalar::Int(n))
    }

    #[test]
    fn singleton_primitive_yields_primitive_dump() {
        let mut ns = Namespace::new();
        ns.set("x", scalar(1));
        let dispatch = Dispatch::new();
        let formatter = DefaultPrimitiveFormatter;
        let serializer = Serializer::new(&dispatch, &formatter);

        let dirty: HashSet<String> = ["x".to_string()].into_iter().collect();
        let components = vec![HashSet::from(["x".to_string()])];

        let dumps: Vec<_> = serializer.dump(&ns, &dirty, &[], &components).collect();
        assert_eq!(dumps.len(), 1);
        assert!(matches!(dumps[0], Dump::Primitive { .. }));
    }

    #[test]
    fn container_component_serializes_and_shares_memo() {
        let mut ns = Namespace::new();
        let shared: Object = Rc::new(List(RefCell::new(vec![scalar(1)])));
        ns.set("a", shared.clone());
        ns.set("wrapper", Rc::new(List(RefCell::new(vec![shared]))));

        let dispatch = Dispatch::new();
        let formatter = DefaultPrimitiveFormatter;
        let serializer = Serializer::new(&dispatch, &formatter);

        let dirty: HashSet<String> = ["a".to_string(), "wrapper".to_string()].into_iter().collect();
        let components = vec![HashSet::from(["a".to_string(), "wrapper".to_string()])];

        let dumps: Vec<_> = serializer.dump(&ns, &dirty, &[], &components).collect();
        assert_eq!(dumps.len(), 1);
        match &dumps[0] {
            Dump::Component { serialized_vars, non_serialized_vars, .. } => {
                assert_eq!(serialized_vars.len(), 2);
                assert!(non_serialized_vars.is_empty());
            }
            _ => panic!("expected a component dump"),
        }
    }

    #[test]
    fn persistable_and_dirty_filter_out_unrelated_components() {
        let formatter = DefaultPrimitiveFormatter;
        let _ = DefaultPersistable;
        let mut ns = Namespace::new();
        ns.set("a", scalar(1));
        ns.set("b", scalar(2));
        let dispatch = Dispatch::new();
        let serializer = Serializer::new(&dispatch, &formatter);

        let dirty: HashSet<String> = ["a".to_string()].into_iter().collect();
        let components = vec![HashSet::from(["a".to_string()]), HashSet::from(["b".to_string()])];

        let dumps: Vec<_> = serializer.dump(&ns, &dirty, &[], &components).collect();
        assert_eq!(dumps.len(), 1);
    }

    #[test]
    fn overlapping_snapshots_merge_into_one_affected_group() {
        // Previous partition said {a,b} was one component; current says b split off into its
        // own singleton. The two disagree about b's shape, so the merged affected group must
        // still be treated as one unit rather than processed as two separate dumps that could
        // race each other through the detector.
        let mut ns = Namespace::new();
        ns.set("a", scalar(1));
        ns.set("b", scalar(2));

        let dispatch = Dispatch::new();
        let formatter = DefaultPrimitiveFormatter;
        let serializer = Serializer::new(&dispatch, &formatter);

        let dirty: HashSet<String> = ["b".to_string()].into_iter().collect();
        let prev = vec![HashSet::from(["a".to_string(), "b".to_string()])];
        let curr = vec![HashSet::from(["a".to_string()]), HashSet::from(["b".to_string()])];

        let dumps: Vec<_> = serializer.dump(&ns, &dirty, &prev, &curr).collect();
        assert_eq!(dumps.len(), 1, "overlapping groups must merge rather than double-process a name");
    }
}
