//! Worker contract.
//!
//! A worker receives one canonical input [`Record`] per grid cell and
//! returns a [`Record`] holding every declared result. Records are sorted
//! maps, so their persistent hash never depends on insertion order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::WorkerError;
use crate::hash::{Digest, HashFold, PersistentHash};
use crate::value::Value;

/// Named values passed to and returned from a worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(BTreeMap<String, Value>);

impl Record {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value, returning the previous one.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(name.into(), value.into())
    }

    /// Builder form of [`Record::insert`].
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.0.remove(name)
    }

    /// Float view of `name`; integers and booleans widen.
    pub fn float(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Value::as_float)
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_int)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl<K: Into<String>, V: Into<Value>> Extend<(K, V)> for Record {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        self.0.extend(iter.into_iter().map(|(k, v)| (k.into(), v.into())));
    }
}

impl IntoIterator for Record {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl PersistentHash for Record {
    fn persistent_hash(&self) -> Digest {
        let mut fold = HashFold::new();
        fold.push(&self.0.len());
        for (name, value) in &self.0 {
            fold.push(name.as_str());
            fold.push(value);
        }
        fold.finish()
    }
}

/// A benchmarked function.
///
/// Implementations must be safe to call from several pool threads at once.
pub trait Worker: Send + Sync {
    /// Evaluates one grid cell.
    fn call(&self, input: &Record) -> Result<Record, WorkerError>;
}

impl<F> Worker for F
where
    F: Fn(&Record) -> Result<Record, WorkerError> + Send + Sync,
{
    fn call(&self, input: &Record) -> Result<Record, WorkerError> {
        self(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash;
    use proptest::prelude::*;

    #[test]
    fn test_closure_is_worker() {
        let worker = |input: &Record| -> Result<Record, WorkerError> {
            let x = input.float("x").ok_or("missing x")?;
            Ok(Record::new().with("y", x * 2.0))
        };
        let out = worker.call(&Record::new().with("x", 1.5)).unwrap();
        assert_eq!(out.float("y"), Some(3.0));

        let err = worker.call(&Record::new()).unwrap_err();
        assert_eq!(err.message(), "missing x");
    }

    #[test]
    fn test_typed_getters() {
        let r = Record::new().with("n", 3i64).with("flag", true).with("label", "a");
        assert_eq!(r.int("n"), Some(3));
        assert_eq!(r.float("n"), Some(3.0));
        assert_eq!(r.bool("flag"), Some(true));
        assert_eq!(r.str("label"), Some("a"));
        assert_eq!(r.names().collect::<Vec<_>>(), vec!["flag", "label", "n"]);
    }

    #[test]
    fn test_record_hash_sensitive_to_values() {
        let a = Record::new().with("x", 1.0);
        let b = Record::new().with("x", 2.0);
        let c = Record::new().with("y", 1.0);
        assert_ne!(hash(&a), hash(&b));
        assert_ne!(hash(&a), hash(&c));
    }

    proptest! {
        #[test]
        fn prop_record_hash_is_order_independent(
            entries in prop::collection::btree_map("[a-z]{1,6}", -1.0e9f64..1.0e9, 0..12)
        ) {
            let forward: Record = entries.iter().map(|(k, v)| (k.clone(), *v)).collect();
            let reverse: Record = entries.iter().rev().map(|(k, v)| (k.clone(), *v)).collect();
            prop_assert_eq!(hash(&forward), hash(&reverse));
        }
    }
}
