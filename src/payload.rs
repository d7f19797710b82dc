/// Outbound document payloads and sanitization
///
/// Callers build writes as a [`Payload`] tree. Besides the usual JSON shapes
/// it carries an [`Payload::Unset`] sentinel for fields that were never
/// given a value. Drivers reject such fields outright, so every write goes
/// through [`sanitize`] before submission.
use serde_json::{Map, Number, Value};

/// JSON-like document data with an explicit "unset" sentinel
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// A field that has no value at all (distinct from `Null`)
    Unset,
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Sequence(Vec<Payload>),
    /// Ordered key/value pairs
    Mapping(Vec<(String, Payload)>),
}

impl Payload {
    /// Build a mapping from key/value pairs, keeping their order
    pub fn mapping<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Payload)>,
    {
        Payload::Mapping(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn is_unset(&self) -> bool {
        matches!(self, Payload::Unset)
    }

    /// True if an `Unset` appears anywhere in the tree
    pub fn contains_unset(&self) -> bool {
        match self {
            Payload::Unset => true,
            Payload::Sequence(items) => items.iter().any(Payload::contains_unset),
            Payload::Mapping(entries) => entries.iter().any(|(_, v)| v.contains_unset()),
            _ => false,
        }
    }

    /// Convert to JSON, mapping any remaining `Unset` to `null`
    ///
    /// Sanitize first; this conversion exists for payloads that are already clean.
    pub fn into_json(self) -> Value {
        match self {
            Payload::Unset | Payload::Null => Value::Null,
            Payload::Bool(b) => Value::Bool(b),
            Payload::Number(n) => Value::Number(n),
            Payload::String(s) => Value::String(s),
            Payload::Sequence(items) => {
                Value::Array(items.into_iter().map(Payload::into_json).collect())
            }
            Payload::Mapping(entries) => Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, v.into_json()))
                    .collect::<Map<String, Value>>(),
            ),
        }
    }

    /// Convert a sanitized top-level mapping into driver document data
    ///
    /// Documents are always mappings; any other shape yields `None`.
    pub fn into_document_data(self) -> Option<Map<String, Value>> {
        match self.into_json() {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Short name of the payload shape, for error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Unset => "unset",
            Payload::Null => "null",
            Payload::Bool(_) => "bool",
            Payload::Number(_) => "number",
            Payload::String(_) => "string",
            Payload::Sequence(_) => "sequence",
            Payload::Mapping(_) => "mapping",
        }
    }
}

/// Recursively strip `Unset` values
///
/// - mapping entries whose value is `Unset` are dropped
/// - `Unset` items inside a sequence become `Null` so positions stay stable
/// - a bare `Unset` root becomes `Null`
/// - `Null` is kept as-is, everything else is copied unchanged
///
/// The result never contains `Unset`, so sanitizing twice is a no-op.
pub fn sanitize(payload: &Payload) -> Payload {
    match payload {
        Payload::Unset => Payload::Null,
        Payload::Mapping(entries) => Payload::Mapping(
            entries
                .iter()
                .filter(|(_, v)| !v.is_unset())
                .map(|(k, v)| (k.clone(), sanitize(v)))
                .collect(),
        ),
        Payload::Sequence(items) => Payload::Sequence(items.iter().map(sanitize).collect()),
        other => other.clone(),
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Payload::Null,
            Value::Bool(b) => Payload::Bool(b),
            Value::Number(n) => Payload::Number(n),
            Value::String(s) => Payload::String(s),
            Value::Array(items) => Payload::Sequence(items.into_iter().map(Payload::from).collect()),
            Value::Object(map) => {
                Payload::Mapping(map.into_iter().map(|(k, v)| (k, Payload::from(v))).collect())
            }
        }
    }
}

impl<T: Into<Payload>> From<Option<T>> for Payload {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Payload::Unset)
    }
}

impl From<bool> for Payload {
    fn from(value: bool) -> Self {
        Payload::Bool(value)
    }
}

impl From<i64> for Payload {
    fn from(value: i64) -> Self {
        Payload::Number(value.into())
    }
}

impl From<u64> for Payload {
    fn from(value: u64) -> Self {
        Payload::Number(value.into())
    }
}

impl From<f64> for Payload {
    /// Non-finite floats have no JSON form and become `Null`
    fn from(value: f64) -> Self {
        Number::from_f64(value)
            .map(Payload::Number)
            .unwrap_or(Payload::Null)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::String(value.to_string())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::String(value)
    }
}
