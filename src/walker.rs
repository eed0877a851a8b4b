//! The reference walker: traverses the object graph reachable from namespace roots and
//! computes the connected-component partition of root names.
//!
//! Merging label sets that share a name is a disjoint-set-union over root names;
//! `UnionFind` below is the same incremental-merge shape as
//! `dyn_cache::dep_node::InnerDepNode::update_liveness`, which walks a dependent list and
//! transitively propagates a single `Live` bit from any reachable root. Here the propagated
//! payload is a *set of root indices* rather than a boolean, but the "follow links, fold a
//! value in from whatever you reach" structure is the same.

use downcast_rs::Downcast;
use hashbrown::HashMap;
use std::collections::HashSet;
use std::rc::Rc;

use varstate_dispatch::{Dispatch, Object, Reduction};

use crate::config::WalkLimits;
use crate::error::WalkError;
use crate::value::CodeValue;

fn identity(obj: &Object) -> usize {
    Rc::as_ptr(obj) as *const () as usize
}

/// A minimal union-find over a fixed universe of `0..n` indices, used to merge root indices
/// whenever the walker discovers they share an object.
struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self { parent: (0..n).collect() }
    }

    fn find(&mut self, x: usize) -> usize {
        if self.parent[x] != x {
            self.parent[x] = self.find(self.parent[x]);
        }
        self.parent[x]
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[ra] = rb;
        }
    }
}

/// Traverses the graph reachable from a set of named roots and reports which root names
/// share at least one reachable object.
pub struct Walker<'d> {
    dispatch: &'d Dispatch,
    limits: WalkLimits,
}

impl<'d> Walker<'d> {
    pub fn new(dispatch: &'d Dispatch, limits: WalkLimits) -> Self {
        Self { dispatch, limits }
    }

    /// Compute the connected-component partition of `roots`' names.
    ///
    /// Reducer failures on individual objects are logged and isolated to the root they
    /// occurred under (see [`WalkError`]); the root's label set survives with whatever was
    /// reached before the failure, and the walk continues with the remaining roots.
    pub fn walk(&self, roots: &HashMap<String, Object>) -> Vec<HashSet<String>> {
        let root_names: Vec<String> = roots.keys().cloned().collect();
        let index_of: HashMap<&str, usize> =
            root_names.iter().enumerate().map(|(i, n)| (n.as_str(), i)).collect();

        let mut uf = UnionFind::new(root_names.len());
        let mut object_labels: HashMap<usize, HashSet<usize>> = HashMap::new();
        // Holds a strong reference to every object visited this walk so its pointer cannot
        // be reused by an unrelated allocation before the walk finishes.
        let mut keep_alive: Vec<Object> = Vec::new();

        for (root_idx, name) in root_names.iter().enumerate() {
            let value = &roots[name];
            let mut current_labels: HashSet<usize> = HashSet::new();
            current_labels.insert(root_idx);
            let mut visited = 0usize;

            if let Err(source) = self.visit(
                value,
                root_idx,
                &index_of,
                &mut current_labels,
                &mut object_labels,
                &mut keep_alive,
                &mut visited,
            ) {
                let err = WalkError { root: name.clone(), source };
                tracing::warn!(
                    root = %err.root,
                    error = %err.source,
                    "reducer failed while walking root; partial component retained"
                );
            }

            for &label in &current_labels {
                uf.union(root_idx, label);
            }
        }

        let mut groups: HashMap<usize, HashSet<String>> = HashMap::new();
        for (i, name) in root_names.iter().enumerate() {
            let rep = uf.find(i);
            groups.entry(rep).or_default().insert(name.clone());
        }
        groups.into_values().collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn visit(
        &self,
        obj: &Object,
        current_root: usize,
        index_of: &HashMap<&str, usize>,
        current_labels: &mut HashSet<usize>,
        object_labels: &mut HashMap<usize, HashSet<usize>>,
        keep_alive: &mut Vec<Object>,
        visited: &mut usize,
    ) -> Result<(), varstate_dispatch::ReduceError> {
        // Code objects fold their referenced global names into the current label set and
        // are otherwise leaves: modeled outside the generic Constant/Value dispatch because
        // the side effect (adding names, not objects, to the label set) has no other home
        // in the reducer contract.
        if let Some(code) = obj.as_any().downcast_ref::<CodeValue>() {
            for global in &code.globals {
                if let Some(&idx) = index_of.get(global.as_str()) {
                    current_labels.insert(idx);
                }
            }
            return Ok(());
        }

        let id = identity(obj);
        if let Some(existing) = object_labels.get_mut(&id) {
            // Shortcut: this object already has labels from a previous visit (this root or
            // an earlier one). Union rather than recurse.
            existing.insert(current_root);
            current_labels.extend(existing.iter().copied());
            return Ok(());
        }

        if self.limits.is_exhausted(*visited) {
            // SUBTREE_LIMIT reached: abort this subtree, keeping whatever the root already
            // accumulated.
            return Ok(());
        }

        let reduction = self.dispatch.reduce(obj)?;

        match reduction {
            // Constants (and, by the same "unvisited" treatment, global/module references)
            // are never installed into `object_labels`: two roots that happen to reference
            // the same interned constant or the same module must not be merged into one
            // component on that basis alone.
            Reduction::Constant | Reduction::GlobalRef { .. } => {}
            Reduction::Value { args, state, list_items, dict_items, .. } => {
                *visited += 1;
                keep_alive.push(obj.clone());
                object_labels.insert(id, current_labels.clone());

                for child in args.iter().chain(state.iter()).chain(list_items.iter()) {
                    self.visit(
                        child,
                        current_root,
                        index_of,
                        current_labels,
                        object_labels,
                        keep_alive,
                        visited,
                    )?;
                }
                for (k, v) in &dict_items {
                    self.visit(
                        k,
                        current_root,
                        index_of,
                        current_labels,
                        object_labels,
                        keep_alive,
                        visited,
                    )?;
                    self.visit(
                        v,
                        current_root,
                        index_of,
                        current_labels,
                        object_labels,
                        keep_alive,
                        visited,
                    )?;
                }
            }
        }

        Ok(())
    }
}
