//! Closed value kinds for dynamic dictionaries.
//!
//! Settings, layout items, and theme entries are maps from string keys to a
//! closed set of value kinds. Accessors fail softly: a kind mismatch yields
//! the caller's default rather than an error, matching the tolerant behavior
//! expected from configuration surfaces.

use std::collections::BTreeMap;

/// A dynamically typed value with a closed set of kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Boolean.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Raw bytes. Persists as a JSON array of numbers.
    Bytes(Vec<u8>),
    /// Ordered list of values.
    List(Vec<Value>),
    /// String-keyed map of values.
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// The boolean payload, or `default` on kind mismatch.
    #[must_use]
    pub fn bool_or(&self, default: bool) -> bool {
        match self {
            Self::Bool(b) => *b,
            _ => default,
        }
    }

    /// The integer payload, accepting a lossless float, or `default`.
    #[must_use]
    pub fn int_or(&self, default: i64) -> i64 {
        match self {
            Self::Int(i) => *i,
            Self::Float(f) if f.fract() == 0.0 => *f as i64,
            _ => default,
        }
    }

    /// The float payload, accepting an integer, or `default`.
    #[must_use]
    pub fn float_or(&self, default: f64) -> f64 {
        match self {
            Self::Float(f) => *f,
            Self::Int(i) => *i as f64,
            _ => default,
        }
    }

    /// The string payload, or `default` on kind mismatch.
    #[must_use]
    pub fn str_or<'a>(&'a self, default: &'a str) -> &'a str {
        match self {
            Self::Str(s) => s,
            _ => default,
        }
    }

    /// The byte payload. A list of in-range integers is accepted because
    /// bytes persist as a JSON array.
    #[must_use]
    pub fn bytes(&self) -> Option<Vec<u8>> {
        match self {
            Self::Bytes(b) => Some(b.clone()),
            Self::List(items) => items
                .iter()
                .map(|v| match v {
                    Self::Int(i) if (0..=255).contains(i) => Some(*i as u8),
                    _ => None,
                })
                .collect(),
            _ => None,
        }
    }

    /// The list payload, or an empty slice on kind mismatch.
    #[must_use]
    pub fn list(&self) -> &[Value] {
        match self {
            Self::List(items) => items,
            _ => &[],
        }
    }

    /// The map payload, if this value is a map.
    #[must_use]
    pub fn map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Convert to the JSON representation used on disk.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::Str(s) => serde_json::Value::String(s.clone()),
            Self::Bytes(b) => {
                serde_json::Value::Array(b.iter().map(|&x| serde_json::Value::from(x)).collect())
            },
            Self::List(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Self::Map(entries) => serde_json::Value::Object(
                entries.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Convert from a JSON value. `null` has no kind here and yields `None`.
    #[must_use]
    pub fn from_json(json: &serde_json::Value) -> Option<Self> {
        match json {
            serde_json::Value::Null => None,
            serde_json::Value::Bool(b) => Some(Self::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Self::Int(i))
                } else {
                    n.as_f64().map(Self::Float)
                }
            },
            serde_json::Value::String(s) => Some(Self::Str(s.clone())),
            serde_json::Value::Array(items) => {
                Some(Self::List(items.iter().filter_map(Self::from_json).collect()))
            },
            serde_json::Value::Object(entries) => Some(Self::Map(
                entries
                    .iter()
                    .filter_map(|(k, v)| Self::from_json(v).map(|v| (k.clone(), v)))
                    .collect(),
            )),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_fail_soft() {
        let v = Value::Str("not a number".to_string());
        assert_eq!(v.int_or(7), 7);
        assert!(!v.bool_or(false));
        assert_eq!(v.str_or("x"), "not a number");
    }

    #[test]
    fn numeric_coercion() {
        assert_eq!(Value::Float(3.0).int_or(0), 3);
        assert_eq!(Value::Float(3.5).int_or(0), 0);
        assert!((Value::Int(3).float_or(0.0) - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn bytes_round_trip_through_json() {
        let v = Value::Bytes(vec![1, 2, 255]);
        let json = v.to_json();
        let back = Value::from_json(&json).expect("non-null");
        assert_eq!(back.bytes(), Some(vec![1, 2, 255]));
    }

    #[test]
    fn json_round_trip_nested() {
        let mut map = BTreeMap::new();
        map.insert("enabled".to_string(), Value::Bool(true));
        map.insert("items".to_string(), Value::List(vec![Value::Int(1), Value::Str("two".into())]));
        let v = Value::Map(map);
        let back = Value::from_json(&v.to_json()).expect("non-null");
        assert_eq!(back, v);
    }
}
