//! Shard identifiers, shard-key values and chunk ranges
//!
//! Ranges are half-open `[min, max)` over [`KeyBound`], where `MinKey` sorts
//! below every value and `MaxKey` above every value.

use serde::{Deserialize, Serialize};

/// Shard identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(String);

impl ShardId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ShardId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// One component of a (possibly compound) shard key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyValue {
    Int(i64),
    Str(String),
}

impl std::fmt::Display for KeyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyValue::Int(v) => write!(f, "{}", v),
            KeyValue::Str(v) => write!(f, "{:?}", v),
        }
    }
}

/// Shard-key value of a document, one component per field of the pattern.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardKey(pub Vec<KeyValue>);

impl ShardKey {
    pub fn int(v: i64) -> Self {
        Self(vec![KeyValue::Int(v)])
    }

    pub fn str(v: impl Into<String>) -> Self {
        Self(vec![KeyValue::Str(v.into())])
    }

    pub fn arity(&self) -> usize {
        self.0.len()
    }
}

impl std::fmt::Display for ShardKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.len() == 1 {
            return write!(f, "{}", self.0[0]);
        }
        write!(f, "(")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", part)?;
        }
        write!(f, ")")
    }
}

impl From<i64> for ShardKey {
    fn from(v: i64) -> Self {
        Self::int(v)
    }
}

impl From<i32> for ShardKey {
    fn from(v: i32) -> Self {
        Self::int(i64::from(v))
    }
}

/// Chunk boundary.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyBound {
    MinKey,
    Value(ShardKey),
    MaxKey,
}

impl KeyBound {
    pub fn int(v: i64) -> Self {
        KeyBound::Value(ShardKey::int(v))
    }

    fn admits(&self, key: &ShardKey) -> bool {
        match self {
            KeyBound::MinKey | KeyBound::MaxKey => true,
            KeyBound::Value(v) => v.arity() == key.arity(),
        }
    }
}

impl std::fmt::Display for KeyBound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyBound::MinKey => write!(f, "MinKey"),
            KeyBound::Value(v) => write!(f, "{}", v),
            KeyBound::MaxKey => write!(f, "MaxKey"),
        }
    }
}

impl From<i64> for KeyBound {
    fn from(v: i64) -> Self {
        KeyBound::int(v)
    }
}

impl From<i32> for KeyBound {
    fn from(v: i32) -> Self {
        KeyBound::int(i64::from(v))
    }
}

/// Half-open key range `[min, max)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub min: KeyBound,
    pub max: KeyBound,
}

impl KeyRange {
    pub fn new(min: impl Into<KeyBound>, max: impl Into<KeyBound>) -> Self {
        Self {
            min: min.into(),
            max: max.into(),
        }
    }

    /// The whole key space.
    pub fn full() -> Self {
        Self::new(KeyBound::MinKey, KeyBound::MaxKey)
    }

    pub fn is_empty(&self) -> bool {
        self.min >= self.max
    }

    pub fn contains_key(&self, key: &ShardKey) -> bool {
        let bound = KeyBound::Value(key.clone());
        self.min <= bound && bound < self.max
    }

    pub fn contains_range(&self, other: &KeyRange) -> bool {
        self.min <= other.min && other.max <= self.max
    }

    pub fn overlaps(&self, other: &KeyRange) -> bool {
        self.min < other.max && other.min < self.max
    }

    /// Can keys of this arity fall inside the range?
    pub fn admits(&self, key: &ShardKey) -> bool {
        self.min.admits(key) && self.max.admits(key)
    }
}

impl std::fmt::Display for KeyRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.min, self.max)
    }
}

/// Split a namespace into `(database, collection)`.
pub fn split_namespace(ns: &str) -> (&str, Option<&str>) {
    match ns.split_once('.') {
        Some((db, coll)) => (db, Some(coll)),
        None => (ns, None),
    }
}

/// Validate a database or `db.collection` namespace.
pub fn validate_namespace(ns: &str) -> crate::Result<()> {
    if ns.is_empty() {
        return Err(crate::Error::InvalidCommand("namespace cannot be empty".into()));
    }
    if ns.len() > 255 {
        return Err(crate::Error::InvalidCommand(
            "namespace too long (max 255 bytes)".into(),
        ));
    }
    if ns.chars().any(|c| c.is_control() || c == '$' || c == ' ' || c == '/') {
        return Err(crate::Error::InvalidCommand(format!(
            "namespace {:?} contains invalid characters",
            ns
        )));
    }
    let (db, coll) = split_namespace(ns);
    if db.is_empty() || coll.is_some_and(str::is_empty) {
        return Err(crate::Error::InvalidCommand(format!(
            "namespace {:?} has an empty component",
            ns
        )));
    }
    Ok(())
}
