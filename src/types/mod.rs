use std::{cmp::Ordering, fmt};

use serde::{Deserialize, Serialize};

pub type Timestamp = i64;

// The storage key of a row. Sequence numbers are assigned per table, start at
// 1 and strictly increase, so no two stored rows share a key and ties on
// timestamp always break the same way.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RowKey {
    pub ts: Timestamp,
    pub seqnum: u64,
}

impl RowKey {
    pub fn new(ts: Timestamp, seqnum: u64) -> Self {
        RowKey { ts, seqnum }
    }

    // Sorts before every stored key with this timestamp.
    pub fn floor(ts: Timestamp) -> Self {
        RowKey { ts, seqnum: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Bool,
    Int,
    Double,
    Text,
}

impl ColumnType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnType::Int | ColumnType::Double)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bool" => Some(ColumnType::Bool),
            "int" | "bigint" => Some(ColumnType::Int),
            "double" | "float" => Some(ColumnType::Double),
            "text" | "binary" | "nchar" => Some(ColumnType::Text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    // NULL is accepted by every column type.
    pub fn fits(&self, ty: ColumnType) -> bool {
        matches!(
            (self, ty),
            (Value::Null, _)
                | (Value::Bool(_), ColumnType::Bool)
                | (Value::Int(_), ColumnType::Int)
                | (Value::Double(_), ColumnType::Double)
                | (Value::Text(_), ColumnType::Text)
        )
    }

    /// Whether a predicate may compare a column of type `ty` with this value.
    pub fn comparable_with(&self, ty: ColumnType) -> bool {
        match self {
            Value::Null => false,
            Value::Int(_) | Value::Double(_) => ty.is_numeric(),
            _ => self.fits(ty),
        }
    }

    /// Compares two values the way a column predicate does: numbers compare
    /// across int and double, NULL compares with nothing.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Double(a), Value::Double(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Double(b)) => (*a as f64).partial_cmp(b),
            (Value::Double(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "{:?}", v),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_owned())
    }
}

/// A row as seen by callers: the timestamp followed by the table's columns in
/// schema order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    pub ts: Timestamp,
    pub values: Vec<Value>,
}

impl Row {
    pub fn new<I, V>(ts: Timestamp, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Row {
            ts,
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ts)?;
        for v in &self.values {
            write!(f, " {}", v)?;
        }
        Ok(())
    }
}

/// Half-open time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeRange {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        TimeRange { start, end }
    }

    pub fn all() -> Self {
        TimeRange {
            start: Timestamp::MIN,
            end: Timestamp::MAX,
        }
    }

    pub fn from(start: Timestamp) -> Self {
        TimeRange {
            start,
            end: Timestamp::MAX,
        }
    }

    pub fn until(end: Timestamp) -> Self {
        TimeRange {
            start: Timestamp::MIN,
            end,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.start <= self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        self.start <= ts && ts < self.end
    }

    // Whether the closed interval [lo, hi] shares a point with this range.
    pub fn overlaps(&self, lo: Timestamp, hi: Timestamp) -> bool {
        lo < self.end && hi >= self.start
    }

    pub fn lower_key(&self) -> RowKey {
        RowKey::floor(self.start)
    }

    pub fn upper_key(&self) -> RowKey {
        RowKey::floor(self.end)
    }
}

impl Default for TimeRange {
    fn default() -> Self {
        TimeRange::all()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Order {
    #[default]
    Asc,
    Desc,
}

impl Order {
    // Whether `a` is emitted before `b` in this order.
    pub fn precedes<K: Ord>(&self, a: &K, b: &K) -> bool {
        match self {
            Order::Asc => a < b,
            Order::Desc => a > b,
        }
    }
}
