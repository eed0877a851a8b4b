use std::collections::HashSet;

use hashbrown::HashMap;
use varstate_dispatch::Object;

/// Hides internal/private names from the commit machinery. The default implementation hides
/// any name starting with `_`; a caller embedding this engine in a different notebook
/// convention can supply its own.
pub trait Persistable {
    fn is_persistable(&self, name: &str) -> bool;
}

/// The default persistable predicate: a name is persistable unless it starts with `_`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPersistable;

impl Persistable for DefaultPersistable {
    fn is_persistable(&self, name: &str) -> bool {
        !name.starts_with('_')
    }
}

/// The observed, mutation-tracked mapping from variable name to value.
///
/// Every mutating method honors `armed`: when armed (the default), writes and deletes
/// update `touched`/`deleted`; when disarmed, the same operations apply to the underlying
/// map without being recorded as transaction activity. [`crate::change::AtomicChange::apply`]
/// disarms the namespace while materializing a change, since applying a previously-emitted
/// change is not itself new transaction activity.
#[derive(Debug, Default)]
pub struct Namespace {
    vars: HashMap<String, Object>,
    touched: HashSet<String>,
    deleted: HashSet<String>,
    armed: bool,
}

impl Namespace {
    pub fn new() -> Self {
        Self { vars: HashMap::new(), touched: HashSet::new(), deleted: HashSet::new(), armed: true }
    }

    /// Run `f` with tracking disabled, restoring the previous `armed` state afterwards.
    pub fn disarmed<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let was_armed = self.armed;
        self.armed = false;
        let result = f(self);
        self.armed = was_armed;
        result
    }

    pub fn get(&self, name: &str) -> Option<&Object> {
        self.vars.get(name)
    }

    /// Insert or overwrite `name`. Clears it from `deleted` and, if armed, records it as
    /// touched.
    pub fn set(&mut self, name: impl Into<String>, value: Object) {
        let name = name.into();
        self.deleted.remove(&name);
        if self.armed {
            self.touched.insert(name.clone());
        }
        self.vars.insert(name, value);
    }

    /// Remove `name` if present. If armed, records it as both touched and deleted.
    pub fn delete(&mut self, name: &str) -> Option<Object> {
        let removed = self.vars.remove(name);
        if removed.is_some() && self.armed {
            self.touched.insert(name.to_string());
            self.deleted.insert(name.to_string());
        }
        removed
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Object)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn touched(&self) -> &HashSet<String> {
        &self.touched
    }

    pub fn deleted(&self) -> &HashSet<String> {
        &self.deleted
    }

    /// Names touched or deleted this transaction, filtered by `persistable`.
    pub fn dirty(&self, persistable: &dyn Persistable) -> HashSet<String> {
        self.touched
            .union(&self.deleted)
            .filter(|name| persistable.is_persistable(name))
            .cloned()
            .collect()
    }

    /// Every persistable root currently present in the namespace, for feeding the walker.
    pub fn persistable_roots(&self, persistable: &dyn Persistable) -> HashMap<String, Object> {
        self.vars
            .iter()
            .filter(|(name, _)| persistable.is_persistable(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    /// Clear `touched`/`deleted` at the end of a commit.
    pub fn clear_dirty(&mut self) {
        self.touched.clear();
        self.deleted.clear();
    }

    /// Clear dirtiness only for the given names, used by
    /// [`crate::change::AtomicChange::apply`] so that applying a change doesn't leave its
    /// own names marked dirty for the next commit.
    pub fn clear_dirty_for(&mut self, names: impl IntoIterator<Item = String>) {
        for name in names {
            self.touched.remove(&name);
            self.deleted.remove(&name);
        }
    }
}
