//! # Execution Context
//!
//! The mutable field map of a single run. Seeded from the caller's inputs,
//! each node's outputs are merged in; a later write to a field shadows the
//! earlier value. One context lives for exactly one executor run.

use serde_json::Value;
use std::collections::BTreeMap;

/// Named field values, ordered by field name
pub type Fields = BTreeMap<String, Value>;

/// Field store for one run of a compiled graph
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    fields: Fields,
}

impl ExecutionContext {
    /// Create a context seeded with the run's inputs
    pub fn new(inputs: Fields) -> Self {
        Self { fields: inputs }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Extract the subset of fields a node declares as inputs.
    ///
    /// Returns the name of the first missing field on failure.
    pub fn select<'a>(&self, names: &'a [String]) -> std::result::Result<Fields, &'a str> {
        let mut selected = Fields::new();
        for name in names {
            match self.fields.get(name) {
                Some(value) => {
                    selected.insert(name.clone(), value.clone());
                }
                None => return Err(name.as_str()),
            }
        }
        Ok(selected)
    }

    /// Merge a node's outputs, shadowing earlier values
    pub fn merge(&mut self, outputs: &Fields) {
        for (name, value) in outputs {
            self.fields.insert(name.clone(), value.clone());
        }
    }

    pub fn snapshot(&self) -> Fields {
        self.fields.clone()
    }

    pub fn into_fields(self) -> Fields {
        self.fields
    }
}

/// Text used to match a field value against branch keys.
///
/// Strings match on their content; any other JSON value on its JSON text.
pub fn branch_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Build a field map from `(name, value)` pairs
pub fn fields<I, K, V>(pairs: I) -> Fields
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_shadows_earlier_values() {
        let mut ctx = ExecutionContext::new(fields([("content", "draft 1")]));
        ctx.merge(&fields([("content", "draft 2"), ("critique", "too short")]));

        assert_eq!(ctx.get("content"), Some(&json!("draft 2")));
        assert_eq!(ctx.get("critique"), Some(&json!("too short")));
    }

    #[test]
    fn test_select_reports_first_missing() {
        let ctx = ExecutionContext::new(fields([("content", "x")]));
        let names = vec!["content".to_string(), "critique".to_string()];

        assert_eq!(ctx.select(&names).unwrap_err(), "critique");
        assert_eq!(ctx.select(&names[..1]).unwrap().len(), 1);
    }

    #[test]
    fn test_branch_key() {
        assert_eq!(branch_key(&json!("PASS")), "PASS");
        assert_eq!(branch_key(&json!(true)), "true");
        assert_eq!(branch_key(&json!(3)), "3");
    }
}
