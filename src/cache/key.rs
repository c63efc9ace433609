//! Hierarchical cache keys.
//!
//! A key is an ordered list of tokens, e.g. `campaigns/list/{status=active}`.
//! Keys form a prefix tree: invalidating `campaigns` reaches every key that
//! starts with it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// A canonical parameter value.
///
/// Every variant is totally ordered so that keys can be compared, hashed
/// and sorted. Integral floats fold into `Int`; any other number keeps a
/// variant of its own, so values that are not deeply equal never collide.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
  Null,
  Bool(bool),
  Int(i64),
  /// Integers past `i64::MAX`
  UInt(u64),
  Float(FloatParam),
  Str(String),
  List(Vec<ParamValue>),
  Map(BTreeMap<String, ParamValue>),
}

impl ParamValue {
  /// Canonicalize a JSON value. Nulls are kept wherever they appear; only
  /// [`Params::from_json`] drops them, and only at the top level.
  pub fn from_json(value: &Value) -> Self {
    match value {
      Value::Null => Self::Null,
      Value::Bool(b) => Self::Bool(*b),
      Value::Number(n) => number_param(n),
      Value::String(s) => Self::Str(s.clone()),
      Value::Array(items) => Self::List(items.iter().map(ParamValue::from_json).collect()),
      Value::Object(map) => Self::Map(
        map
          .iter()
          .map(|(k, v)| (k.clone(), ParamValue::from_json(v)))
          .collect(),
      ),
    }
  }

  /// Render the value as it would appear in a query string.
  pub fn to_query_value(&self) -> String {
    match self {
      Self::Null => String::new(),
      Self::Bool(b) => b.to_string(),
      Self::Int(i) => i.to_string(),
      Self::UInt(u) => u.to_string(),
      Self::Float(f) => f.to_string(),
      Self::Str(s) => s.clone(),
      Self::List(items) => items
        .iter()
        .map(ParamValue::to_query_value)
        .collect::<Vec<_>>()
        .join(","),
      Self::Map(_) => serde_json::to_string(self).unwrap_or_default(),
    }
  }
}

fn number_param(n: &serde_json::Number) -> ParamValue {
  if let Some(i) = n.as_i64() {
    return ParamValue::Int(i);
  }
  if let Some(u) = n.as_u64() {
    return ParamValue::UInt(u);
  }
  match n.as_f64() {
    Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 => {
      ParamValue::Int(f as i64)
    }
    Some(f) => ParamValue::Float(FloatParam(f)),
    None => ParamValue::Str(n.to_string()),
  }
}

/// A non-integral number, compared and hashed by its bit pattern.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FloatParam(f64);

impl FloatParam {
  pub fn get(self) -> f64 {
    self.0
  }
}

impl PartialEq for FloatParam {
  fn eq(&self, other: &Self) -> bool {
    self.0.to_bits() == other.0.to_bits()
  }
}

impl Eq for FloatParam {}

impl PartialOrd for FloatParam {
  fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for FloatParam {
  fn cmp(&self, other: &Self) -> std::cmp::Ordering {
    self.0.total_cmp(&other.0)
  }
}

impl std::hash::Hash for FloatParam {
  fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
    self.0.to_bits().hash(state);
  }
}

impl fmt::Display for FloatParam {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl fmt::Display for ParamValue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Null => write!(f, "null"),
      Self::Bool(b) => write!(f, "{}", b),
      Self::Int(i) => write!(f, "{}", i),
      Self::UInt(u) => write!(f, "{}", u),
      Self::Float(x) => write!(f, "{}", x),
      Self::Str(s) => write!(f, "{}", s),
      Self::List(items) => {
        write!(f, "[")?;
        for (i, item) in items.iter().enumerate() {
          if i > 0 {
            write!(f, ",")?;
          }
          write!(f, "{}", item)?;
        }
        write!(f, "]")
      }
      Self::Map(map) => write!(f, "{}", Params(map.clone())),
    }
  }
}

impl From<bool> for ParamValue {
  fn from(b: bool) -> Self {
    Self::Bool(b)
  }
}

impl From<i64> for ParamValue {
  fn from(i: i64) -> Self {
    Self::Int(i)
  }
}

impl From<u32> for ParamValue {
  fn from(i: u32) -> Self {
    Self::Int(i64::from(i))
  }
}

impl From<u64> for ParamValue {
  fn from(i: u64) -> Self {
    i64::try_from(i).map(Self::Int).unwrap_or(Self::UInt(i))
  }
}

impl From<&str> for ParamValue {
  fn from(s: &str) -> Self {
    Self::Str(s.to_string())
  }
}

impl From<String> for ParamValue {
  fn from(s: String) -> Self {
    Self::Str(s)
  }
}

/// Canonicalized filter/parameter object.
///
/// Backed by a `BTreeMap`, so insertion order never affects equality.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Params(BTreeMap<String, ParamValue>);

impl Params {
  pub fn new() -> Self {
    Self::default()
  }

  /// Builder-style insert.
  pub fn with(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
    self.insert(name, value);
    self
  }

  /// Insert a value, replacing any previous value under the same name.
  pub fn insert(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) {
    self.0.insert(name.into(), value.into());
  }

  /// Insert only when the value is present.
  pub fn insert_opt<V: Into<ParamValue>>(&mut self, name: &str, value: Option<V>) {
    if let Some(value) = value {
      self.insert(name, value);
    }
  }

  /// Canonicalize a JSON object. Top-level `null` fields are dropped, so an
  /// absent filter and a null one share a key. Non-object values produce
  /// empty params.
  pub fn from_json(value: &Value) -> Self {
    let Value::Object(map) = value else {
      return Self::default();
    };
    Self(
      map
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.clone(), ParamValue::from_json(v)))
        .collect(),
    )
  }

  pub fn get(&self, name: &str) -> Option<&ParamValue> {
    self.0.get(name)
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
    self.0.iter()
  }

  /// Flatten into `(name, value)` pairs for a URL query string.
  pub fn to_query_pairs(&self) -> Vec<(String, String)> {
    self
      .0
      .iter()
      .map(|(k, v)| (k.clone(), v.to_query_value()))
      .collect()
  }
}

impl fmt::Display for Params {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{{")?;
    for (i, (k, v)) in self.0.iter().enumerate() {
      if i > 0 {
        write!(f, ",")?;
      }
      write!(f, "{}={}", k, v)?;
    }
    write!(f, "}}")
  }
}

/// One segment of a [`CacheKey`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyToken {
  Str(String),
  Int(i64),
  /// Ids past `i64::MAX`
  UInt(u64),
  Params(Params),
}

impl fmt::Display for KeyToken {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Str(s) => write!(f, "{}", s),
      Self::Int(i) => write!(f, "{}", i),
      Self::UInt(u) => write!(f, "{}", u),
      Self::Params(p) => write!(f, "{}", p),
    }
  }
}

impl From<&str> for KeyToken {
  fn from(s: &str) -> Self {
    Self::Str(s.to_string())
  }
}

impl From<String> for KeyToken {
  fn from(s: String) -> Self {
    Self::Str(s)
  }
}

impl From<&String> for KeyToken {
  fn from(s: &String) -> Self {
    Self::Str(s.clone())
  }
}

impl From<i64> for KeyToken {
  fn from(i: i64) -> Self {
    Self::Int(i)
  }
}

impl From<i32> for KeyToken {
  fn from(i: i32) -> Self {
    Self::Int(i64::from(i))
  }
}

impl From<u32> for KeyToken {
  fn from(i: u32) -> Self {
    Self::Int(i64::from(i))
  }
}

impl From<u64> for KeyToken {
  fn from(i: u64) -> Self {
    i64::try_from(i).map(Self::Int).unwrap_or(Self::UInt(i))
  }
}

impl From<Params> for KeyToken {
  fn from(p: Params) -> Self {
    Self::Params(p)
  }
}

/// Canonical, hierarchical identifier for a cached resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CacheKey(Vec<KeyToken>);

impl CacheKey {
  /// Root key for a resource kind.
  pub fn new(kind: impl Into<KeyToken>) -> Self {
    Self(vec![kind.into()])
  }

  /// Build a key from a resource kind followed by its segments.
  pub fn build<I, T>(kind: impl Into<KeyToken>, segments: I) -> Self
  where
    I: IntoIterator<Item = T>,
    T: Into<KeyToken>,
  {
    let mut key = Self::new(kind);
    key.0.extend(segments.into_iter().map(Into::into));
    key
  }

  /// Return a new key with one more segment appended.
  pub fn child(&self, segment: impl Into<KeyToken>) -> Self {
    let mut key = self.clone();
    key.push(segment);
    key
  }

  pub fn push(&mut self, segment: impl Into<KeyToken>) {
    self.0.push(segment.into());
  }

  pub fn tokens(&self) -> &[KeyToken] {
    &self.0
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// True when `prefix` equals this key or is one of its ancestors.
  pub fn starts_with(&self, prefix: &CacheKey) -> bool {
    self.0.starts_with(&prefix.0)
  }

  /// Strict ancestry: `self` is a proper prefix of `other`.
  pub fn is_ancestor_of(&self, other: &CacheKey) -> bool {
    self.0.len() < other.0.len() && other.starts_with(self)
  }

  pub fn parent(&self) -> Option<CacheKey> {
    if self.0.len() <= 1 {
      return None;
    }
    Some(Self(self.0[..self.0.len() - 1].to_vec()))
  }

  /// Short stable digest of the canonical form, used as a log field.
  pub fn fingerprint(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.to_string().as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..6])
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for (i, token) in self.0.iter().enumerate() {
      if i > 0 {
        write!(f, "/")?;
      }
      write!(f, "{}", token)?;
    }
    Ok(())
  }
}

/// Build a [`CacheKey`] from a list of segments.
///
/// ```ignore
/// let key = cache_key!["campaigns", "detail", 7];
/// ```
#[macro_export]
macro_rules! cache_key {
  ($kind:expr $(, $segment:expr)* $(,)?) => {{
    #[allow(unused_mut)]
    let mut key = $crate::cache::CacheKey::new($kind);
    $( key.push($segment); )*
    key
  }};
}
