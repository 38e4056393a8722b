//! Field values and their canonical ordering.
//!
//! Values of different types order by [`TypeOrder`]. Integers and doubles
//! share the number slot and compare numerically; NaN is a single
//! equivalence class that sorts below every other number.

use crate::key::DocumentKey;
use crate::mutation::FieldMask;
use crate::path::FieldPath;
use crate::version::Timestamp;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// The cross-type ordering slot of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TypeOrder {
    /// `null`
    Null = 0,
    /// `true` / `false`
    Boolean = 1,
    /// Integers and doubles.
    Number = 2,
    /// Server-assigned or client timestamps.
    Timestamp = 3,
    /// Placeholder for a pending server timestamp.
    ServerTimestamp = 4,
    /// UTF-8 strings.
    String = 5,
    /// Raw bytes.
    Bytes = 6,
    /// References to other documents.
    Reference = 7,
    /// Latitude/longitude pairs.
    GeoPoint = 8,
    /// Arrays.
    Array = 9,
    /// Nested maps.
    Map = 10,
}

/// A single field value stored in a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    /// The null value.
    Null,
    /// A boolean.
    Boolean(bool),
    /// A 64-bit signed integer.
    Integer(i64),
    /// A 64-bit float.
    Double(f64),
    /// A timestamp.
    Timestamp(Timestamp),
    /// A server timestamp that has not been resolved yet.
    ///
    /// `previous` holds the value the field had before the write so the
    /// application can choose to show it instead of the estimate.
    ServerTimestamp {
        /// Local time of the write that set this placeholder.
        local_write_time: Timestamp,
        /// Value of the field before the write, if any.
        previous: Option<Box<Value>>,
    },
    /// A string.
    String(String),
    /// A byte blob.
    Bytes(Vec<u8>),
    /// A reference to another document.
    Reference(DocumentKey),
    /// A geographic point.
    GeoPoint {
        /// Latitude in degrees.
        latitude: f64,
        /// Longitude in degrees.
        longitude: f64,
    },
    /// An ordered list of values.
    Array(Vec<Value>),
    /// A nested map.
    Map(ObjectValue),
}

impl Value {
    /// Returns the ordering slot of this value.
    #[must_use]
    pub fn type_order(&self) -> TypeOrder {
        match self {
            Value::Null => TypeOrder::Null,
            Value::Boolean(_) => TypeOrder::Boolean,
            Value::Integer(_) | Value::Double(_) => TypeOrder::Number,
            Value::Timestamp(_) => TypeOrder::Timestamp,
            Value::ServerTimestamp { .. } => TypeOrder::ServerTimestamp,
            Value::String(_) => TypeOrder::String,
            Value::Bytes(_) => TypeOrder::Bytes,
            Value::Reference(_) => TypeOrder::Reference,
            Value::GeoPoint { .. } => TypeOrder::GeoPoint,
            Value::Array(_) => TypeOrder::Array,
            Value::Map(_) => TypeOrder::Map,
        }
    }

    /// Returns true if this is a NaN double.
    #[must_use]
    pub fn is_nan(&self) -> bool {
        matches!(self, Value::Double(d) if d.is_nan())
    }

    /// Returns true for [`Value::Null`].
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns the elements if this is an array.
    #[must_use]
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(values) => Some(values),
            _ => None,
        }
    }

    /// Returns the nested map if this is a map.
    #[must_use]
    pub fn as_map(&self) -> Option<&ObjectValue> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Returns true if `self` is an array containing a value equal to `needle`.
    #[must_use]
    pub fn array_contains(&self, needle: &Value) -> bool {
        self.as_array()
            .is_some_and(|values| values.iter().any(|v| v == needle))
    }

    /// Compares two values using the canonical cross-type ordering.
    #[must_use]
    pub fn compare(&self, other: &Value) -> Ordering {
        let left = self.type_order();
        let right = other.type_order();
        if left != right {
            return left.cmp(&right);
        }

        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Double(a), Value::Double(b)) => compare_doubles(*a, *b),
            (Value::Integer(a), Value::Double(b)) => compare_mixed(*a, *b),
            (Value::Double(a), Value::Integer(b)) => compare_mixed(*b, *a).reverse(),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (
                Value::ServerTimestamp {
                    local_write_time: a,
                    ..
                },
                Value::ServerTimestamp {
                    local_write_time: b,
                    ..
                },
            ) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::Reference(a), Value::Reference(b)) => a.cmp(b),
            (
                Value::GeoPoint {
                    latitude: lat_a,
                    longitude: lng_a,
                },
                Value::GeoPoint {
                    latitude: lat_b,
                    longitude: lng_b,
                },
            ) => compare_doubles(*lat_a, *lat_b).then_with(|| compare_doubles(*lng_a, *lng_b)),
            (Value::Array(a), Value::Array(b)) => {
                for (left, right) in a.iter().zip(b) {
                    let cmp = left.compare(right);
                    if cmp != Ordering::Equal {
                        return cmp;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Map(a), Value::Map(b)) => a.compare(b),
            _ => Ordering::Equal,
        }
    }

    /// Returns a stable string form used to build canonical query ids.
    #[must_use]
    pub fn canonical_id(&self) -> String {
        let mut out = String::new();
        self.write_canonical(&mut out);
        out
    }

    fn write_canonical(&self, out: &mut String) {
        match self {
            Value::Null => out.push_str("null"),
            Value::Boolean(b) => {
                let _ = write!(out, "{b}");
            }
            Value::Integer(i) => {
                let _ = write!(out, "{i}");
            }
            Value::Double(d) => {
                let _ = write!(out, "{d:?}");
            }
            Value::Timestamp(ts) => {
                let _ = write!(out, "time({},{})", ts.seconds(), ts.nanos());
            }
            Value::ServerTimestamp {
                local_write_time, ..
            } => {
                let _ = write!(
                    out,
                    "server_time({},{})",
                    local_write_time.seconds(),
                    local_write_time.nanos()
                );
            }
            Value::String(s) => out.push_str(s),
            Value::Bytes(bytes) => {
                out.push_str("bytes(");
                for b in bytes {
                    let _ = write!(out, "{b:02x}");
                }
                out.push(')');
            }
            Value::Reference(key) => out.push_str(&key.path().canonical_string()),
            Value::GeoPoint {
                latitude,
                longitude,
            } => {
                let _ = write!(out, "geo({latitude:?},{longitude:?})");
            }
            Value::Array(values) => {
                out.push('[');
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    v.write_canonical(out);
                }
                out.push(']');
            }
            Value::Map(map) => {
                out.push('{');
                for (i, (k, v)) in map.fields().iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(k);
                    out.push(':');
                    v.write_canonical(out);
                }
                out.push('}');
            }
        }
    }
}

fn compare_doubles(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

fn compare_mixed(int: i64, double: f64) -> Ordering {
    // i64::MIN and i64::MAX + 1 are exactly representable as f64
    const LOWER: f64 = -9_223_372_036_854_775_808.0;
    const UPPER: f64 = 9_223_372_036_854_775_808.0;

    if double.is_nan() {
        return Ordering::Greater;
    }
    if double < LOWER {
        return Ordering::Greater;
    }
    if double >= UPPER {
        return Ordering::Less;
    }
    let truncated = double.trunc();
    match int.cmp(&(truncated as i64)) {
        Ordering::Equal => {
            let fraction = double - truncated;
            if fraction > 0.0 {
                Ordering::Less
            } else if fraction < 0.0 {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        }
        other => other,
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => {
                (a.is_nan() && b.is_nan()) || a.to_bits() == b.to_bits()
            }
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            (
                Value::ServerTimestamp {
                    local_write_time: a,
                    ..
                },
                Value::ServerTimestamp {
                    local_write_time: b,
                    ..
                },
            ) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Reference(a), Value::Reference(b)) => a == b,
            (
                Value::GeoPoint {
                    latitude: lat_a,
                    longitude: lng_a,
                },
                Value::GeoPoint {
                    latitude: lat_b,
                    longitude: lng_b,
                },
            ) => lat_a.to_bits() == lat_b.to_bits() && lng_a.to_bits() == lng_b.to_bits(),
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Timestamp> for Value {
    fn from(v: Timestamp) -> Self {
        Value::Timestamp(v)
    }
}

impl From<DocumentKey> for Value {
    fn from(v: DocumentKey) -> Self {
        Value::Reference(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

impl From<ObjectValue> for Value {
    fn from(v: ObjectValue) -> Self {
        Value::Map(v)
    }
}

/// An ordered map of field names to values: the body of a document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectValue {
    fields: BTreeMap<String, Value>,
}

impl ObjectValue {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the top-level fields.
    #[must_use]
    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    /// Returns true if there are no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Returns the value at `path`, descending into nested maps.
    ///
    /// The empty path returns `None`; use [`ObjectValue::fields`] instead.
    #[must_use]
    pub fn field(&self, path: &FieldPath) -> Option<&Value> {
        let (last, parents) = path.segments().split_last()?;
        let mut current = self;
        for segment in parents {
            current = current.fields.get(segment)?.as_map()?;
        }
        current.fields.get(last)
    }

    /// Sets the value at `path`, creating intermediate maps as needed.
    ///
    /// Non-map values on the way are replaced by maps.
    pub fn set(&mut self, path: &FieldPath, value: Value) {
        let Some((last, parents)) = path.segments().split_last() else {
            return;
        };
        let mut current = self;
        for segment in parents {
            let entry = current
                .fields
                .entry(segment.clone())
                .or_insert_with(|| Value::Map(ObjectValue::new()));
            if !matches!(entry, Value::Map(_)) {
                *entry = Value::Map(ObjectValue::new());
            }
            let Value::Map(next) = entry else {
                return;
            };
            current = next;
        }
        current.fields.insert(last.clone(), value);
    }

    /// Removes the value at `path`, if present.
    pub fn delete(&mut self, path: &FieldPath) {
        let Some((last, parents)) = path.segments().split_last() else {
            return;
        };
        let mut current = self;
        for segment in parents {
            match current.fields.get_mut(segment) {
                Some(Value::Map(next)) => current = next,
                _ => return,
            }
        }
        current.fields.remove(last);
    }

    /// Applies a batch of sets (`Some`) and deletes (`None`).
    pub fn set_all(&mut self, updates: BTreeMap<FieldPath, Option<Value>>) {
        for (path, value) in updates {
            match value {
                Some(value) => self.set(&path, value),
                None => self.delete(&path),
            }
        }
    }

    /// Returns the mask of every leaf field in this map.
    ///
    /// Empty nested maps count as leaves.
    #[must_use]
    pub fn field_mask(&self) -> FieldMask {
        let mut paths = Vec::new();
        collect_leaf_paths(self, &FieldPath::default(), &mut paths);
        FieldMask::new(paths)
    }

    /// Compares two maps key by key, then by size.
    #[must_use]
    pub fn compare(&self, other: &ObjectValue) -> Ordering {
        for ((k1, v1), (k2, v2)) in self.fields.iter().zip(&other.fields) {
            let cmp = k1.cmp(k2).then_with(|| v1.compare(v2));
            if cmp != Ordering::Equal {
                return cmp;
            }
        }
        self.fields.len().cmp(&other.fields.len())
    }
}

fn collect_leaf_paths(map: &ObjectValue, prefix: &FieldPath, out: &mut Vec<FieldPath>) {
    for (name, value) in &map.fields {
        let path = prefix.child(name.clone());
        match value {
            Value::Map(nested) if !nested.is_empty() => collect_leaf_paths(nested, &path, out),
            _ => out.push(path),
        }
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for ObjectValue {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}
