//! Variable scopes for expression evaluation.

use std::collections::BTreeMap;

use serde_json::Value;

/// A mapping from identifier to value with an optional parent scope.
///
/// Lookup walks the chain from the innermost scope outward; the first scope
/// that defines the identifier wins.
#[derive(Debug, Default)]
pub struct Scope<'a> {
    /// Enclosing scope, consulted when an identifier is not found here.
    pub parent: Option<&'a Scope<'a>>,
    /// Variables defined at this level.
    pub variables: BTreeMap<String, Value>,
}

impl<'a> Scope<'a> {
    /// An empty scope with no parent.
    #[must_use]
    pub fn root() -> Self {
        Self::default()
    }

    /// A scope with the given variables and no parent.
    #[must_use]
    pub fn new(variables: BTreeMap<String, Value>) -> Self {
        Self { parent: None, variables }
    }

    /// A child scope layered over `parent`.
    #[must_use]
    pub fn child_of(parent: &'a Scope<'a>, variables: BTreeMap<String, Value>) -> Self {
        Self { parent: Some(parent), variables }
    }

    /// Look up an identifier, walking parent scopes.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&Value> {
        match self.variables.get(name) {
            Some(value) => Some(value),
            None => self.parent.and_then(|p| p.lookup(name)),
        }
    }

    /// Insert a variable at this level, merging object values.
    ///
    /// When both the existing and new values are objects the new fields are
    /// merged in recursively; this is how sibling component exports under a
    /// shared name prefix (`counter.a`, `counter.b`) coexist in one scope
    /// tree.
    pub fn insert_nested(&mut self, path: &[String], value: Value) {
        debug_assert!(!path.is_empty());
        let nested = nest(&path[1..], value);
        merge_into(self.variables.entry(path[0].clone()).or_insert(Value::Null), nested);
    }
}

fn nest(path: &[String], value: Value) -> Value {
    let mut out = value;
    for segment in path.iter().rev() {
        let mut map = serde_json::Map::new();
        map.insert(segment.clone(), out);
        out = Value::Object(map);
    }
    out
}

fn merge_into(target: &mut Value, incoming: Value) {
    match (target, incoming) {
        (Value::Object(existing), Value::Object(new)) => {
            for (key, value) in new {
                merge_into(existing.entry(key).or_insert(Value::Null), value);
            }
        }
        (slot, incoming) => *slot = incoming,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_lookup_walks_parents() {
        let mut outer = Scope::root();
        outer.variables.insert("a".into(), json!(1));
        let mut inner = Scope::child_of(&outer, BTreeMap::new());
        inner.variables.insert("b".into(), json!(2));

        assert_eq!(inner.lookup("a"), Some(&json!(1)));
        assert_eq!(inner.lookup("b"), Some(&json!(2)));
        assert_eq!(inner.lookup("c"), None);
    }

    #[test]
    fn test_inner_scope_shadows() {
        let mut outer = Scope::root();
        outer.variables.insert("a".into(), json!(1));
        let mut inner = Scope::child_of(&outer, BTreeMap::new());
        inner.variables.insert("a".into(), json!(2));
        assert_eq!(inner.lookup("a"), Some(&json!(2)));
    }

    #[test]
    fn test_insert_nested_merges_siblings() {
        let mut scope = Scope::root();
        scope.insert_nested(
            &["counter".into(), "a".into()],
            json!({"out": 1}),
        );
        scope.insert_nested(
            &["counter".into(), "b".into()],
            json!({"out": 2}),
        );
        assert_eq!(
            scope.lookup("counter"),
            Some(&json!({"a": {"out": 1}, "b": {"out": 2}}))
        );
    }
}
