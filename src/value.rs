//! Values carried by sweep coordinates and worker results.
//!
//! A single dynamically-typed enum covers every sample a sweep variable can
//! produce and every result a worker can return. Each variant has a
//! canonical text form that the persistent hash is built from, so two
//! structurally equal values always hash identically.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// A sweep sample or a worker result.
///
/// # Examples
///
/// ```
/// use sweepbench::Value;
///
/// let float_val = Value::Float(0.5);
/// let label = Value::from("fast");
///
/// assert_eq!(float_val.as_float(), Some(0.5));
/// assert_eq!(label.as_str(), Some("fast"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(#[serde(with = "float_repr")] f64),
    String(String),
    Time(DateTime<Utc>),
    Vector(#[serde(with = "float_repr::seq")] Vec<f64>),
    Json(serde_json::Value),
    Null,
}

impl Value {
    pub const fn is_bool(&self) -> bool {
        matches!(self, Self::Bool(_))
    }

    pub const fn is_int(&self) -> bool {
        matches!(self, Self::Int(_))
    }

    pub const fn is_float(&self) -> bool {
        matches!(self, Self::Float(_))
    }

    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view of the value. Integers and booleans widen to `f64`.
    #[allow(clippy::cast_precision_loss)]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            Self::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    pub const fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Time(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<&[f64]> {
        match self {
            Self::Vector(v) => Some(v),
            _ => None,
        }
    }

    /// Returns a human-readable type name.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Time(_) => "time",
            Self::Vector(_) => "vector",
            Self::Json(_) => "json",
            Self::Null => "null",
        }
    }

    /// Canonical text form used for persistent hashing.
    ///
    /// The form is prefixed with the type name so `Int(1)`, `Float(1.0)` and
    /// `String("1")` never collide.
    #[must_use]
    pub fn canonical(&self) -> String {
        match self {
            Self::Bool(v) => format!("bool:{v}"),
            Self::Int(v) => format!("int:{v}"),
            Self::Float(v) => format!("float:{}", canonical_float(*v)),
            Self::String(v) => format!("string:{}:{v}", v.len()),
            Self::Time(v) => format!("time:{}", v.to_rfc3339_opts(SecondsFormat::Nanos, true)),
            Self::Vector(v) => {
                let parts: Vec<String> = v.iter().map(|x| canonical_float(*x)).collect();
                format!("vector:{}:[{}]", v.len(), parts.join(","))
            }
            // serde_json maps are key-sorted, so this is already canonical.
            Self::Json(v) => format!("json:{v}"),
            Self::Null => "null".to_string(),
        }
    }
}

/// Shortest round-trip representation with `-0.0` folded onto `0.0`.
pub(crate) fn canonical_float(v: f64) -> String {
    if v == 0.0 {
        return "0.0".to_string();
    }
    format!("{v:?}")
}

impl Default for Value {
    fn default() -> Self {
        Self::Null
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v:?}"),
            Self::Time(v) => write!(f, "{}", v.to_rfc3339_opts(SecondsFormat::Secs, true)),
            Self::Vector(v) => write!(f, "vector[{}]", v.len()),
            Self::Json(v) => write!(f, "{v}"),
            Self::Null => write!(f, "null"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::Float(f64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Time(v)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Self::Vector(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

/// Serde helpers that keep non-finite floats intact through JSON.
///
/// serde_json writes `NaN` and infinities as `null`, which cannot be read
/// back as `f64`. Grids are NaN-filled until every cell is written, so
/// non-finite values are stored as the strings `"NaN"`, `"inf"`, `"-inf"`.
pub(crate) mod float_repr {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    /// Newtype carrying an `f64` through the non-finite-safe encoding.
    #[derive(Debug, Clone, Copy)]
    pub(crate) struct Float(pub f64);

    impl Serialize for Float {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serialize(&self.0, serializer)
        }
    }

    impl<'de> Deserialize<'de> for Float {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            deserialize(deserializer).map(Float)
        }
    }

    pub(crate) fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if value.is_sign_positive() {
            serializer.serialize_str("inf")
        } else {
            serializer.serialize_str("-inf")
        }
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(v) => Ok(v),
            Repr::Text(text) => match text.as_str() {
                "NaN" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(D::Error::custom(format!("invalid float literal '{other}'"))),
            },
        }
    }

    pub(crate) mod seq {
        use super::Float;
        use serde::{Deserialize, Deserializer, Serializer};

        pub(crate) fn serialize<S: Serializer>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
            serializer.collect_seq(values.iter().map(|v| Float(*v)))
        }

        pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
            let values = Vec::<Float>::deserialize(deserializer)?;
            Ok(values.into_iter().map(|v| v.0).collect())
        }
    }
}
