//! Process-independent persistent hashing.
//!
//! Every cache key in sweepbench is a blake3 digest of a canonical text
//! form. Nothing here depends on `std::hash`, object identity or a
//! per-process seed, so a digest computed today matches one computed by a
//! different process tomorrow.
//!
//! Composite values are hashed by folding: the running digest and the
//! digest of the next part are hashed together. Folding is order
//! sensitive, so unordered collections must be sorted by key first.

use std::fmt;
use std::str::FromStr;

use blake3::Hasher;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::value::Value;

/// Length of a digest in bytes.
pub const DIGEST_LEN: usize = 32;

/// A persistent digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    /// Hashes raw bytes.
    #[must_use]
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    /// Hashes a string.
    #[must_use]
    pub fn of_str(s: &str) -> Self {
        Self::of_bytes(s.as_bytes())
    }

    /// Folds `part` into this digest: `hash(self || part)`.
    #[must_use]
    pub fn fold(self, part: Self) -> Self {
        let mut h = Hasher::new();
        h.update(&self.0);
        h.update(&part.0);
        Self(*h.finalize().as_bytes())
    }

    /// The digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Lowercase hex form, used as the on-disk cache key.
    #[must_use]
    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }

    /// Parses the lowercase hex form.
    pub fn from_hex(hex: &str) -> Option<Self> {
        blake3::Hash::from_hex(hex).ok().map(|h| Self(*h.as_bytes()))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", &self.to_hex()[..16])
    }
}

impl FromStr for Digest {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s).ok_or_else(|| format!("invalid digest: {s}"))
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Types with a process-independent digest.
pub trait PersistentHash {
    /// Computes the digest of this value's canonical form.
    fn persistent_hash(&self) -> Digest;
}

impl PersistentHash for Digest {
    fn persistent_hash(&self) -> Digest {
        *self
    }
}

impl PersistentHash for str {
    fn persistent_hash(&self) -> Digest {
        Digest::of_str(self)
    }
}

impl PersistentHash for String {
    fn persistent_hash(&self) -> Digest {
        Digest::of_str(self)
    }
}

impl PersistentHash for bool {
    fn persistent_hash(&self) -> Digest {
        Value::Bool(*self).persistent_hash()
    }
}

impl PersistentHash for i64 {
    fn persistent_hash(&self) -> Digest {
        Value::Int(*self).persistent_hash()
    }
}

impl PersistentHash for usize {
    fn persistent_hash(&self) -> Digest {
        Digest::of_str(&format!("int:{self}"))
    }
}

impl PersistentHash for f64 {
    fn persistent_hash(&self) -> Digest {
        Value::Float(*self).persistent_hash()
    }
}

impl PersistentHash for Value {
    fn persistent_hash(&self) -> Digest {
        Digest::of_str(&self.canonical())
    }
}

impl<T: PersistentHash + ?Sized> PersistentHash for &T {
    fn persistent_hash(&self) -> Digest {
        (**self).persistent_hash()
    }
}

impl<T: PersistentHash> PersistentHash for Option<T> {
    fn persistent_hash(&self) -> Digest {
        match self {
            Some(v) => Digest::of_str("some").fold(v.persistent_hash()),
            None => Digest::of_str("none"),
        }
    }
}

impl<T: PersistentHash> PersistentHash for [T] {
    fn persistent_hash(&self) -> Digest {
        let mut fold = HashFold::new();
        fold.push(&self.len());
        for item in self {
            fold.push(item);
        }
        fold.finish()
    }
}

impl<T: PersistentHash> PersistentHash for Vec<T> {
    fn persistent_hash(&self) -> Digest {
        self.as_slice().persistent_hash()
    }
}

impl<A: PersistentHash, B: PersistentHash> PersistentHash for (A, B) {
    fn persistent_hash(&self) -> Digest {
        HashFold::new().with(&self.0).with(&self.1).finish()
    }
}

/// Incremental composite hash: `running = hash(running || hash(part))`.
#[derive(Debug, Clone, Copy)]
pub struct HashFold {
    running: Digest,
}

impl HashFold {
    /// Starts a fold from the digest of the empty string.
    #[must_use]
    pub fn new() -> Self {
        Self {
            running: Digest::of_bytes(&[]),
        }
    }

    /// Folds the next part in.
    pub fn push<T: PersistentHash + ?Sized>(&mut self, part: &T) {
        self.running = self.running.fold(part.persistent_hash());
    }

    /// Builder form of [`HashFold::push`].
    #[must_use]
    pub fn with<T: PersistentHash + ?Sized>(mut self, part: &T) -> Self {
        self.push(part);
        self
    }

    /// The digest of everything folded so far.
    #[must_use]
    pub const fn finish(self) -> Digest {
        self.running
    }
}

impl Default for HashFold {
    fn default() -> Self {
        Self::new()
    }
}

/// Hashes any persistent-hashable value.
pub fn hash<T: PersistentHash + ?Sized>(value: &T) -> Digest {
    value.persistent_hash()
}
