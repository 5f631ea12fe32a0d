use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum sample values retained per path.
pub const MAX_SAMPLE_VALUES: usize = 10;

/// Structural JSON type of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonType {
    Null,
    Boolean,
    Integer,
    Float,
    String,
    Array,
    Object,
}

impl JsonType {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(_) => Self::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => Self::Integer,
            Value::Number(_) => Self::Float,
            Value::String(_) => Self::String,
            Value::Array(_) => Self::Array,
            Value::Object(_) => Self::Object,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Boolean => "boolean",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::String => "string",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

/// Accumulated observations for one flattened path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldStatistics {
    pub presence_count: usize,
    pub null_count: usize,
    pub type_histogram: BTreeMap<JsonType, usize>,
    pub sample_values: Vec<Value>,
    pub max_string_length: usize,
}

impl FieldStatistics {
    pub fn observe(&mut self, value: &Value) {
        self.presence_count += 1;
        *self.type_histogram.entry(JsonType::of(value)).or_insert(0) += 1;

        match value {
            Value::Null => self.null_count += 1,
            Value::String(s) => {
                self.max_string_length = self.max_string_length.max(s.chars().count());
            }
            _ => {}
        }

        let scalar = !matches!(value, Value::Null | Value::Array(_) | Value::Object(_));
        if scalar
            && self.sample_values.len() < MAX_SAMPLE_VALUES
            && !self.sample_values.contains(value)
        {
            self.sample_values.push(value.clone());
        }
    }

    /// Most frequent type. Ties go to the type that sorts first.
    pub fn dominant_type(&self) -> Option<(JsonType, usize)> {
        self.type_histogram
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(t, n)| (*t, *n))
    }

    /// Dominant count over total observations.
    pub fn type_stability(&self) -> f64 {
        match self.dominant_type() {
            Some((_, count)) if self.presence_count > 0 => {
                count as f64 / self.presence_count as f64
            }
            _ => 0.0,
        }
    }
}

/// Per-path view in a [`SchemaReport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldReport {
    pub path: String,
    pub dominant_type: JsonType,
    pub type_stability: f64,
    pub presence_ratio: f64,
    pub null_ratio: f64,
    pub max_string_length: usize,
    pub type_histogram: BTreeMap<JsonType, usize>,
    pub sample_values: Vec<Value>,
    pub likely_foreign_key: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaReport {
    pub documents_analyzed: usize,
    pub field_stability: f64,
    pub type_stability: f64,
    /// SHA-256 hex over sorted `path:dominant_type` lines.
    pub structure_hash: String,
    pub fields: Vec<FieldReport>,
}

impl SchemaReport {
    pub fn field(&self, path: &str) -> Option<&FieldReport> {
        self.fields.iter().find(|f| f.path == path)
    }
}

/// Heuristic: the path's leaf name ends in `_id`/`_key` or contains `id`.
pub fn is_likely_foreign_key(path: &str) -> bool {
    let leaf = path
        .rsplit('.')
        .next()
        .unwrap_or(path)
        .trim_end_matches("[]")
        .to_lowercase();
    leaf.ends_with("_id") || leaf.ends_with("_key") || leaf.contains("id")
}
