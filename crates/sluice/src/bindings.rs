//! Named values shared between the host and a program.

use std::collections::BTreeMap;

use crate::value::Value;

/// The caller's top-level names for one invocation.
///
/// Before a run, every binding becomes a global of the program. After a run
/// that got past compilation (whether it finished or raised), the program's
/// globals are written back, so the caller sees new and reassigned names.
/// A program that fails to compile leaves the bindings untouched.
///
/// Objects with no host representation come back as [`Value::Opaque`] and
/// are not rebound on the next run.
#[derive(Clone, Debug, Default)]
pub struct Bindings {
    vars: BTreeMap<String, Value>,
}

impl Bindings {
    /// No bindings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name`, returning the previous value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.vars.insert(name.into(), value.into())
    }

    /// The value bound to `name`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    /// Unbind `name`.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.vars.remove(name)
    }

    /// Whether `name` is bound.
    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    /// All bindings, sorted by name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of bindings.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Whether there are no bindings.
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub(crate) fn replace_all(&mut self, vars: impl IntoIterator<Item = (String, Value)>) {
        self.vars = vars.into_iter().collect();
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Bindings {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self {
            vars: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

impl IntoIterator for Bindings {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.vars.into_iter()
    }
}
