//! Equality selectors over row fields.

use crate::publication::Fields;
use serde_json::Value;

/// A conjunction of `field == value` clauses. The empty filter matches every
/// row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    clauses: Vec<(String, Value)>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::all().and(field, value)
    }

    pub fn and(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push((field.into(), value.into()));
        self
    }

    /// Build from a JSON selector object. Anything else selects every row.
    pub fn from_value(selector: &Value) -> Self {
        match selector {
            Value::Object(map) => Self {
                clauses: map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            },
            _ => Self::all(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Whether the row `id` with `fields` satisfies every clause. The `_id`
    /// field matches against the row id.
    pub fn matches(&self, id: &str, fields: &Fields) -> bool {
        self.clauses.iter().all(|(field, expected)| {
            if field == "_id" {
                return expected.as_str() == Some(id);
            }
            fields.get(field).unwrap_or(&Value::Null) == expected
        })
    }
}
