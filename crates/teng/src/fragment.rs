//! The caller-built data tree templates are executed against.
//!
//! Three mutually recursive kinds: [`Fragment`] (ordered name→value map),
//! [`FragmentList`] (ordered sequence of fragments) and [`FragmentValue`]
//! (scalar, nested fragment or fragment list). The tree is read-only during
//! execution; the engine only borrows it.

use indexmap::IndexMap;

/// Ordered mapping from names to fragment values. Iteration order is
/// insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fragment {
    items: IndexMap<String, FragmentValue>,
}

/// Ordered sequence of fragments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FragmentList {
    items: Vec<Fragment>,
}

/// A single named value inside a fragment.
///
/// A `Fragment` variant behaves as a list of length one when indexed
/// numerically; this keeps older templates that iterate single nested
/// fragments working.
#[derive(Debug, Clone, PartialEq)]
pub enum FragmentValue {
    Int(i64),
    Real(f64),
    String(String),
    Fragment(Box<Fragment>),
    List(FragmentList),
}

impl Fragment {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) an integer variable.
    pub fn add_int(&mut self, name: impl Into<String>, value: i64) {
        self.items.insert(name.into(), FragmentValue::Int(value));
    }

    /// Adds (or replaces) a real variable.
    pub fn add_real(&mut self, name: impl Into<String>, value: f64) {
        self.items.insert(name.into(), FragmentValue::Real(value));
    }

    /// Adds (or replaces) a string variable.
    pub fn add_string(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.items.insert(name.into(), FragmentValue::String(value.into()));
    }

    /// Adds a nested single fragment and returns it for population.
    pub fn add_fragment(&mut self, name: impl Into<String>) -> &mut Self {
        let entry = self
            .items
            .entry(name.into())
            .or_insert_with(|| FragmentValue::Fragment(Box::default()));
        if !matches!(entry, FragmentValue::Fragment(_)) {
            *entry = FragmentValue::Fragment(Box::default());
        }
        match entry {
            FragmentValue::Fragment(frag) => frag,
            _ => unreachable!("entry was just set to a fragment"),
        }
    }

    /// Adds a fragment list and returns it for population. Adding to a name
    /// that already holds a list appends to the existing list.
    pub fn add_fragment_list(&mut self, name: impl Into<String>) -> &mut FragmentList {
        let entry = self
            .items
            .entry(name.into())
            .or_insert_with(|| FragmentValue::List(FragmentList::default()));
        if !matches!(entry, FragmentValue::List(_)) {
            *entry = FragmentValue::List(FragmentList::default());
        }
        match entry {
            FragmentValue::List(list) => list,
            _ => unreachable!("entry was just set to a list"),
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FragmentValue> {
        self.items.get(name)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FragmentValue)> {
        self.items.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Builds a fragment tree from a JSON object.
    ///
    /// Objects map to fragments, arrays to fragment lists (every element
    /// must itself be an object), numbers to integers or reals, booleans to
    /// 0/1 and null to the empty string.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, FragmentJsonError> {
        let serde_json::Value::Object(map) = value else {
            return Err(FragmentJsonError::RootNotObject);
        };
        let mut frag = Self::new();
        for (name, item) in map {
            frag.insert_json(name, item)?;
        }
        Ok(frag)
    }

    fn insert_json(&mut self, name: &str, value: &serde_json::Value) -> Result<(), FragmentJsonError> {
        use serde_json::Value as Json;
        match value {
            Json::Null => self.add_string(name, ""),
            Json::Bool(b) => self.add_int(name, i64::from(*b)),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    self.add_int(name, i);
                } else {
                    self.add_real(name, n.as_f64().unwrap_or(0.0));
                }
            }
            Json::String(s) => self.add_string(name, s.clone()),
            Json::Object(map) => {
                let nested = self.add_fragment(name);
                for (child_name, child) in map {
                    nested.insert_json(child_name, child)?;
                }
            }
            Json::Array(items) => {
                let list = self.add_fragment_list(name);
                for item in items {
                    let Json::Object(map) = item else {
                        return Err(FragmentJsonError::ListItemNotObject { name: name.to_owned() });
                    };
                    let frag = list.add_fragment();
                    for (child_name, child) in map {
                        frag.insert_json(child_name, child)?;
                    }
                }
            }
        }
        Ok(())
    }
}

impl FragmentList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an empty fragment and returns it for population.
    pub fn add_fragment(&mut self) -> &mut Fragment {
        self.items.push(Fragment::new());
        self.items.last_mut().expect("list cannot be empty after push")
    }

    #[must_use]
    pub fn get(&self, idx: usize) -> Option<&Fragment> {
        self.items.get(idx)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Fragment> {
        self.items.iter()
    }
}

/// Error building a fragment tree from JSON.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FragmentJsonError {
    #[error("the root JSON value must be an object")]
    RootNotObject,
    #[error("every element of list '{name}' must be an object")]
    ListItemNotObject { name: String },
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn iteration_order_is_insertion_order() {
        let mut frag = Fragment::new();
        frag.add_string("z", "1");
        frag.add_string("a", "2");
        let names: Vec<_> = frag.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["z", "a"]);
    }

    #[test]
    fn from_json_builds_nested_tree() {
        let json = serde_json::json!({
            "title": "hi",
            "count": 3,
            "ratio": 0.5,
            "ok": true,
            "items": [{"this": "a"}, {"this": "b"}],
            "meta": {"lang": "en"},
        });
        let frag = Fragment::from_json(&json).unwrap();
        assert_eq!(frag.get("title"), Some(&FragmentValue::String("hi".into())));
        assert_eq!(frag.get("count"), Some(&FragmentValue::Int(3)));
        assert_eq!(frag.get("ok"), Some(&FragmentValue::Int(1)));
        match frag.get("items") {
            Some(FragmentValue::List(list)) => assert_eq!(list.len(), 2),
            other => panic!("expected list, got {other:?}"),
        }
        match frag.get("meta") {
            Some(FragmentValue::Fragment(meta)) => {
                assert_eq!(meta.get("lang"), Some(&FragmentValue::String("en".into())));
            }
            other => panic!("expected fragment, got {other:?}"),
        }
    }

    #[test]
    fn from_json_rejects_scalar_list_items() {
        let json = serde_json::json!({"items": [1, 2]});
        assert_eq!(
            Fragment::from_json(&json),
            Err(FragmentJsonError::ListItemNotObject { name: "items".into() })
        );
    }
}
