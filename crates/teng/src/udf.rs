//! User-defined function registry.
//!
//! Embedders register callables under dotted names; templates invoke them
//! as `udf.name(...)`. The interpreter consults the registry at `FUNC`
//! instructions whose name carries the `udf.` prefix; the optimizer never
//! folds them.

use ahash::AHashMap;

use crate::value::Value;

/// A registered callable. Arguments arrive in declaration order; the
/// result must own its data. A returned `Err` is logged as an error and
/// the call yields `undefined`.
pub type UdfCallable = Box<dyn Fn(&[Value<'_>]) -> Result<Value<'static>, String> + Send + Sync>;

/// Name→callable map for `udf.*` functions.
#[derive(Default)]
pub struct UdfRegistry {
    functions: AHashMap<String, UdfCallable>,
}

impl UdfRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callable under `name` (without the `udf.` prefix).
    pub fn register(&mut self, name: impl Into<String>, callable: UdfCallable) {
        self.functions.insert(name.into(), callable);
    }

    /// Looks a callable up by its name without the `udf.` prefix.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&UdfCallable> {
        self.functions.get(name)
    }
}

impl std::fmt::Debug for UdfRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdfRegistry").field("functions", &self.functions.keys().collect::<Vec<_>>()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_find() {
        let mut registry = UdfRegistry::new();
        registry.register("twice", Box::new(|args| Ok(Value::Int(args[0].integral() * 2))));
        let callable = registry.find("twice").unwrap();
        assert_eq!(callable(&[Value::Int(21)]).unwrap(), Value::Int(42));
        assert!(registry.find("missing").is_none());
    }
}
