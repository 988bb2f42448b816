//! Immutable, persistent, content-hashed JSON values.
//!
//! Two values with equal content are guaranteed to share one heap allocation
//! (hash-consing, via a process-wide intern table), so pointer equality is a
//! valid, cheap stand-in for "unchanged" throughout the subscription index
//! and the attached-info cache. Containers ([`im::Vector`] /
//! [`im::OrdMap`]) are persistent, so `with`/`without` share every subtree
//! untouched by the edit.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, LazyLock, Weak};

use im::{OrdMap, Vector};
use parking_lot::Mutex;

use crate::error::{ValueError, ValueResult};
use crate::path::{Path, PathElement};

#[derive(Clone)]
pub struct Value(Arc<Node>);

struct Node {
    hash: u64,
    kind: Kind,
    cache: Mutex<HashMap<&'static str, Box<dyn Any + Send + Sync>>>,
}

enum Kind {
    Null,
    Bool(bool),
    Int(i64),
    Float(u64),
    Str(Arc<str>),
    List(Vector<Value>),
    Map(OrdMap<Arc<str>, Value>),
}

fn kind_tag(kind: &Kind) -> &'static str {
    match kind {
        Kind::Null => "null",
        Kind::Bool(_) => "bool",
        Kind::Int(_) => "int",
        Kind::Float(_) => "float",
        Kind::Str(_) => "string",
        Kind::List(_) => "list",
        Kind::Map(_) => "map",
    }
}

/// Content hash used for hash-consing: a node's hash is derived from its
/// discriminant and its own data, folding in children by their already
/// computed hash rather than re-hashing the subtree (construction is
/// bottom-up, so children are interned, and therefore hashed, first).
fn compute_hash(kind: &Kind) -> u64 {
    let mut hasher = blake3::Hasher::new();
    match kind {
        Kind::Null => {
            hasher.update(&[0u8]);
        }
        Kind::Bool(b) => {
            hasher.update(&[1u8, *b as u8]);
        }
        Kind::Int(i) => {
            hasher.update(&[2u8]);
            hasher.update(&i.to_le_bytes());
        }
        Kind::Float(bits) => {
            hasher.update(&[3u8]);
            hasher.update(&bits.to_le_bytes());
        }
        Kind::Str(s) => {
            hasher.update(&[4u8]);
            hasher.update(s.as_bytes());
        }
        Kind::List(items) => {
            hasher.update(&[5u8]);
            hasher.update(&(items.len() as u64).to_le_bytes());
            for item in items {
                hasher.update(&item.0.hash.to_le_bytes());
            }
        }
        Kind::Map(entries) => {
            hasher.update(&[6u8]);
            hasher.update(&(entries.len() as u64).to_le_bytes());
            for (key, value) in entries {
                hasher.update(&(key.len() as u64).to_le_bytes());
                hasher.update(key.as_bytes());
                hasher.update(&value.0.hash.to_le_bytes());
            }
        }
    }
    let digest = hasher.finalize();
    u64::from_le_bytes(digest.as_bytes()[..8].try_into().unwrap())
}

fn kind_eq(a: &Kind, b: &Kind) -> bool {
    match (a, b) {
        (Kind::Null, Kind::Null) => true,
        (Kind::Bool(x), Kind::Bool(y)) => x == y,
        (Kind::Int(x), Kind::Int(y)) => x == y,
        (Kind::Float(x), Kind::Float(y)) => x == y,
        (Kind::Str(x), Kind::Str(y)) => x == y,
        (Kind::List(x), Kind::List(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| a == b)
        }
        (Kind::Map(x), Kind::Map(y)) => {
            x.len() == y.len()
                && x.iter()
                    .zip(y.iter())
                    .all(|((ka, va), (kb, vb))| ka == kb && va == vb)
        }
        _ => false,
    }
}

static INTERN_TABLE: LazyLock<Mutex<HashMap<u64, Vec<Weak<Node>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn intern(kind: Kind) -> Value {
    let hash = compute_hash(&kind);
    let mut table = INTERN_TABLE.lock();
    let bucket = table.entry(hash).or_default();
    bucket.retain(|weak| weak.strong_count() > 0);

    for weak in bucket.iter() {
        if let Some(existing) = weak.upgrade()
            && kind_eq(&existing.kind, &kind)
        {
            return Value(existing);
        }
    }

    let node = Arc::new(Node {
        hash,
        kind,
        cache: Mutex::new(HashMap::new()),
    });
    bucket.push(Arc::downgrade(&node));
    Value(node)
}

impl Value {
    pub fn null() -> Self {
        intern(Kind::Null)
    }

    pub fn bool(b: bool) -> Self {
        intern(Kind::Bool(b))
    }

    pub fn int(i: i64) -> Self {
        intern(Kind::Int(i))
    }

    pub fn float(f: f64) -> Self {
        intern(Kind::Float(f.to_bits()))
    }

    pub fn string(s: impl Into<Arc<str>>) -> Self {
        intern(Kind::Str(s.into()))
    }

    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        intern(Kind::List(items.into_iter().collect()))
    }

    pub fn map(entries: impl IntoIterator<Item = (String, Value)>) -> Self {
        let map: OrdMap<Arc<str>, Value> = entries
            .into_iter()
            .map(|(k, v)| (Arc::from(k.as_str()), v))
            .collect();
        intern(Kind::Map(map))
    }

    pub fn empty_map() -> Self {
        Self::map(std::iter::empty())
    }

    pub fn empty_list() -> Self {
        Self::list(std::iter::empty())
    }

    pub fn is_null(&self) -> bool {
        matches!(self.0.kind, Kind::Null)
    }

    pub fn is_map(&self) -> bool {
        matches!(self.0.kind, Kind::Map(_))
    }

    pub fn is_list(&self) -> bool {
        matches!(self.0.kind, Kind::List(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.0.kind {
            Kind::Bool(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self.0.kind {
            Kind::Int(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self.0.kind {
            Kind::Float(bits) => Some(f64::from_bits(bits)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.0.kind {
            Kind::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn list_len(&self) -> Option<usize> {
        match &self.0.kind {
            Kind::List(items) => Some(items.len()),
            _ => None,
        }
    }

    pub fn map_len(&self) -> Option<usize> {
        match &self.0.kind {
            Kind::Map(entries) => Some(entries.len()),
            _ => None,
        }
    }

    pub fn iter_list(&self) -> impl Iterator<Item = Value> + '_ {
        match &self.0.kind {
            Kind::List(items) => Box::new(items.iter().cloned()) as Box<dyn Iterator<Item = Value>>,
            _ => Box::new(std::iter::empty()),
        }
    }

    pub fn iter_map(&self) -> impl Iterator<Item = (&str, Value)> + '_ {
        match &self.0.kind {
            Kind::Map(entries) => {
                Box::new(entries.iter().map(|(k, v)| (k.as_ref(), v.clone())))
                    as Box<dyn Iterator<Item = (&str, Value)>>
            }
            _ => Box::new(std::iter::empty()),
        }
    }

    /// Child at `key` within a map, or `None` (Absent) if not a map or missing.
    pub fn get_key(&self, key: &str) -> Option<Value> {
        match &self.0.kind {
            Kind::Map(entries) => entries.get(key).cloned(),
            _ => None,
        }
    }

    /// Child at `index` within a list, or `None` (Absent) if not a list or out of range.
    pub fn get_index(&self, index: usize) -> Option<Value> {
        match &self.0.kind {
            Kind::List(items) => items.get(index).cloned(),
            _ => None,
        }
    }

    /// `get(value, key)` from §4.1: child at a single [`PathElement`].
    pub fn get(&self, element: &PathElement) -> Option<Value> {
        match element {
            PathElement::Key(key) => self.get_key(key),
            PathElement::Index(index) => self.get_index(*index),
        }
    }

    /// `with(value, key, child)`: substitute an existing map entry or list
    /// index, or insert a new map key. Does not grow a list past its length;
    /// callers that need append-on-equal-length semantics go through
    /// [`set_at_path`].
    pub fn with(&self, element: &PathElement, child: Value) -> ValueResult<Value> {
        match (element, &self.0.kind) {
            (PathElement::Key(key), Kind::Map(entries)) => {
                Ok(Self::map_from(entries.update(Arc::from(key.as_str()), child)))
            }
            (PathElement::Index(index), Kind::List(items)) => {
                if *index >= items.len() {
                    return Err(ValueError::IndexOutOfRange {
                        index: *index,
                        len: items.len(),
                    });
                }
                Ok(Self::list_from(items.update(*index, child)))
            }
            (PathElement::Key(_), _) => Err(ValueError::PathElementTypeMismatch {
                element: element.clone(),
                kind: kind_tag(&self.0.kind),
            }),
            (PathElement::Index(_), _) => Err(ValueError::PathElementTypeMismatch {
                element: element.clone(),
                kind: kind_tag(&self.0.kind),
            }),
        }
    }

    /// `without(value, key)`: delete a map entry, or remove a list index
    /// (indices above the hole shift down).
    pub fn without(&self, element: &PathElement) -> Value {
        match (element, &self.0.kind) {
            (PathElement::Key(key), Kind::Map(entries)) => {
                let mut updated = entries.clone();
                updated.remove(key);
                Self::map_from(updated)
            }
            (PathElement::Index(index), Kind::List(items)) => {
                if *index < items.len() {
                    let mut updated = items.clone();
                    updated.remove(*index);
                    Self::list_from(updated)
                } else {
                    self.clone()
                }
            }
            _ => self.clone(),
        }
    }

    pub fn push_back(&self, child: Value) -> ValueResult<Value> {
        match &self.0.kind {
            Kind::List(items) => {
                let mut updated = items.clone();
                updated.push_back(child);
                Ok(Self::list_from(updated))
            }
            _ => Err(ValueError::PathElementTypeMismatch {
                element: PathElement::Index(0),
                kind: kind_tag(&self.0.kind),
            }),
        }
    }

    fn list_from(items: Vector<Value>) -> Value {
        intern(Kind::List(items))
    }

    fn map_from(entries: OrdMap<Arc<str>, Value>) -> Value {
        intern(Kind::Map(entries))
    }

    /// Converts a foreign, serde-shaped JSON value into a [`Value`],
    /// rejecting anything outside the JSON primitive set and enforcing
    /// string keys (the `sanitize` step from §4.1).
    pub fn from_json(json: &serde_json::Value) -> ValueResult<Value> {
        Ok(match json {
            serde_json::Value::Null => Value::null(),
            serde_json::Value::Bool(b) => Value::bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::int(i)
                } else if let Some(f) = n.as_f64() {
                    Value::float(f)
                } else {
                    return Err(ValueError::NotJson(format!("unrepresentable number {n}")));
                }
            }
            serde_json::Value::String(s) => Value::string(s.as_str()),
            serde_json::Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(Value::from_json(item)?);
                }
                Value::list(out)
            }
            serde_json::Value::Object(entries) => {
                let mut out = Vec::with_capacity(entries.len());
                for (key, value) in entries {
                    out.push((key.clone(), Value::from_json(value)?));
                }
                Value::map(out)
            }
        })
    }

    pub fn to_json(&self) -> serde_json::Value {
        match &self.0.kind {
            Kind::Null => serde_json::Value::Null,
            Kind::Bool(b) => serde_json::Value::Bool(*b),
            Kind::Int(i) => serde_json::Value::Number((*i).into()),
            Kind::Float(bits) => serde_json::Number::from_f64(f64::from_bits(*bits))
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Kind::Str(s) => serde_json::Value::String(s.to_string()),
            Kind::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Kind::Map(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Reads or computes a memoized derived analysis, keyed by `key` and
    /// shared across every value with this one's content (the "attached
    /// info" cache from §4.3 / §9).
    pub fn cache_get_or_compute<T, F>(&self, key: &'static str, compute: F) -> T
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(&Value) -> T,
    {
        {
            let cache = self.0.cache.lock();
            if let Some(existing) = cache.get(key)
                && let Some(value) = existing.downcast_ref::<T>()
            {
                return value.clone();
            }
        }
        let computed = compute(self);
        let mut cache = self.0.cache.lock();
        cache.insert(key, Box::new(computed.clone()));
        computed
    }

    /// `true` if this is the same content-addressed instance as `other`
    /// (the identity-equality fast path from §3's invariants).
    pub fn is(&self, other: &Value) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// `setAtPath`: walks `path`, materializing intermediate mappings at
/// string-keyed gaps and sequences at integer-keyed gaps. `value = None`
/// means Absent (delete). Deleting into Absent yields the empty mapping.
pub fn set_at_path(data: Option<Value>, path: &[PathElement], value: Option<Value>) -> ValueResult<Value> {
    let Some((head, rest)) = path.split_first() else {
        return Ok(match value {
            Some(v) => v,
            None => Value::empty_map(),
        });
    };

    match head {
        PathElement::Key(key) => {
            let base = match data {
                Some(v) if v.is_map() => v,
                Some(other) => {
                    return Err(ValueError::PathElementTypeMismatch {
                        element: head.clone(),
                        kind: kind_tag(&other.0.kind),
                    });
                }
                None => Value::empty_map(),
            };

            if value.is_none() && rest.is_empty() {
                return Ok(base.without(head));
            }

            let child = base.get_key(key);
            let new_child = set_at_path(child, rest, value)?;
            base.with(head, new_child)
        }
        PathElement::Index(index) => {
            let base = match data {
                Some(v) if v.is_list() => v,
                Some(other) => {
                    return Err(ValueError::PathElementTypeMismatch {
                        element: head.clone(),
                        kind: kind_tag(&other.0.kind),
                    });
                }
                None => Value::empty_list(),
            };
            let len = base.list_len().unwrap_or(0);

            if value.is_none() && rest.is_empty() {
                if *index < len {
                    return Ok(base.without(head));
                }
                return Ok(base);
            }

            if *index > len {
                return Err(ValueError::IndexOutOfRange { index: *index, len });
            }

            if *index == len {
                let new_child = set_at_path(None, rest, value)?;
                return base.push_back(new_child);
            }

            let child = base.get_index(*index);
            let new_child = set_at_path(child, rest, value)?;
            base.with(head, new_child)
        }
    }
}

/// `getAtPath`: returns Absent (`None`) on any miss without raising.
pub fn get_at_path(data: Option<&Value>, path: &[PathElement]) -> Option<Value> {
    let mut current = data.cloned();
    for element in path {
        current = current.and_then(|value| value.get(element));
    }
    current
}

pub fn set_at_path_p(data: Option<Value>, path: &Path, value: Option<Value>) -> ValueResult<Value> {
    set_at_path(data, path.elements(), value)
}

pub fn get_at_path_p(data: Option<&Value>, path: &Path) -> Option<Value> {
    get_at_path(data, path.elements())
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash.hash(state);
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.kind {
            Kind::Null => write!(f, "null"),
            Kind::Bool(b) => write!(f, "{b}"),
            Kind::Int(i) => write!(f, "{i}"),
            Kind::Float(bits) => write!(f, "{}", f64::from_bits(*bits)),
            Kind::Str(s) => write!(f, "{s:?}"),
            Kind::List(items) => f.debug_list().entries(items.iter()).finish(),
            Kind::Map(entries) => f.debug_map().entries(entries.iter()).finish(),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::int(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::string(s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(elements: &[PathElement]) -> Path {
        Path::new(elements.iter().cloned())
    }

    #[test]
    fn primitive_round_trip() {
        let v = set_at_path_p(
            None,
            &path(&[PathElement::key("a"), PathElement::key("b")]),
            Some(Value::list([Value::int(1), Value::int(2), Value::int(3)])),
        )
        .unwrap();

        let got = get_at_path_p(
            Some(&v),
            &path(&[PathElement::key("a"), PathElement::key("b"), PathElement::index(1)]),
        );
        assert_eq!(got, Some(Value::int(2)));

        let miss = get_at_path_p(
            Some(&v),
            &path(&[PathElement::key("a"), PathElement::key("b"), PathElement::index(9)]),
        );
        assert_eq!(miss, None);
    }

    #[test]
    fn equal_values_are_pointer_equal() {
        let a = Value::map([("x".to_owned(), Value::int(1))]);
        let b = Value::map([("x".to_owned(), Value::int(1))]);
        assert!(a.is(&b));
        assert_eq!(a, b);
    }

    #[test]
    fn last_write_wins() {
        let p = path(&[PathElement::key("p")]);
        let v = Value::empty_map();
        let a = set_at_path_p(Some(v.clone()), &p, Some(Value::int(1))).unwrap();
        let via_a = set_at_path_p(Some(a), &p, Some(Value::int(2))).unwrap();
        let direct = set_at_path_p(Some(v), &p, Some(Value::int(2))).unwrap();
        assert_eq!(via_a, direct);
    }

    #[test]
    fn delete_removes_descendant() {
        let p = path(&[PathElement::key("a"), PathElement::key("b")]);
        let v = set_at_path_p(None, &p, Some(Value::int(1))).unwrap();
        let deleted = set_at_path_p(Some(v), &p, None).unwrap();
        assert_eq!(get_at_path_p(Some(&deleted), &p), None);
        assert_eq!(deleted.get_key("a").unwrap().map_len(), Some(0));
    }

    #[test]
    fn structural_sharing_on_sibling_edit() {
        let base = Value::map([
            ("a".to_owned(), Value::int(1)),
            ("b".to_owned(), Value::list([Value::int(1), Value::int(2)])),
        ]);
        let original_b = base.get_key("b").unwrap();

        let updated = set_at_path_p(
            Some(base),
            &path(&[PathElement::key("a")]),
            Some(Value::int(99)),
        )
        .unwrap();

        assert!(updated.get_key("b").unwrap().is(&original_b));
    }

    #[test]
    fn append_at_length_grows_list() {
        let v = Value::list([Value::int(1), Value::int(2)]);
        let p = path(&[PathElement::index(2)]);
        let grown = set_at_path_p(Some(v), &p, Some(Value::int(3))).unwrap();
        assert_eq!(grown.list_len(), Some(3));
        assert_eq!(grown.get_index(2), Some(Value::int(3)));
    }

    #[test]
    fn mismatched_path_element_errors() {
        let v = Value::map([("a".to_owned(), Value::int(1))]);
        let err = set_at_path_p(
            Some(v),
            &path(&[PathElement::index(0)]),
            Some(Value::int(2)),
        )
        .unwrap_err();
        assert!(matches!(err, ValueError::PathElementTypeMismatch { .. }));
    }

    #[test]
    fn json_round_trip() {
        let json = serde_json::json!({"a": {"b": [1, 2, 3]}});
        let v = Value::from_json(&json).unwrap();
        assert_eq!(v.to_json(), json);
    }
}
