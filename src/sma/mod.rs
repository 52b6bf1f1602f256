//! Small materialized aggregates.
//!
//! A table with an [`SmaConfig`] keeps one [`BucketRecord`] per fixed-width
//! time bucket that holds at least one row, with count/sum/min/max for each
//! configured column. Records are maintained as rows are inserted, so they
//! always describe every live row of the table, buffered or flushed, and are
//! never recomputed on read.
//!
//! Updates are staged into an [`SmaDelta`] that holds private copies of the
//! touched buckets and is committed in one step, so a failed insert leaves
//! the index as it was.
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    types::{ColumnType, TimeRange, Timestamp, Value},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmaConfig {
    pub columns: Vec<String>,
    pub bucket_width: i64,
}

impl SmaConfig {
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>, bucket_width: i64) -> Self {
        SmaConfig {
            columns: columns.into_iter().map(Into::into).collect(),
            bucket_width,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SmaSum {
    Int(i64),
    Double(f64),
}

impl SmaSum {
    fn zero(ty: ColumnType) -> Self {
        match ty {
            ColumnType::Double => SmaSum::Double(0.0),
            _ => SmaSum::Int(0),
        }
    }

    // None on integer overflow.
    fn add(self, v: &Value) -> Option<Self> {
        match (self, v) {
            (SmaSum::Int(s), Value::Int(x)) => s.checked_add(*x).map(SmaSum::Int),
            (SmaSum::Double(s), v) => Some(SmaSum::Double(s + v.as_f64()?)),
            (s, _) => Some(s),
        }
    }

    fn sub(self, v: &Value) -> Option<Self> {
        match (self, v) {
            (SmaSum::Int(s), Value::Int(x)) => s.checked_sub(*x).map(SmaSum::Int),
            (SmaSum::Double(s), v) => Some(SmaSum::Double(s - v.as_f64()?)),
            (s, _) => Some(s),
        }
    }

    fn plus(self, other: SmaSum) -> Option<Self> {
        match (self, other) {
            (SmaSum::Int(a), SmaSum::Int(b)) => a.checked_add(b).map(SmaSum::Int),
            (a, b) => Some(SmaSum::Double(a.as_f64() + b.as_f64())),
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            SmaSum::Int(v) => *v as f64,
            SmaSum::Double(v) => *v,
        }
    }
}

/// Aggregate of the non-NULL values of one column. `min` and `max` are
/// [`Value::Null`] while `count` is zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnAggregate {
    pub column: String,
    pub count: u64,
    pub sum: SmaSum,
    pub min: Value,
    pub max: Value,
}

enum Retracted {
    Done,
    // The value was an extreme; min/max must be recomputed from the rows.
    Stale,
}

impl ColumnAggregate {
    pub fn empty(column: impl Into<String>, ty: ColumnType) -> Self {
        ColumnAggregate {
            column: column.into(),
            count: 0,
            sum: SmaSum::zero(ty),
            min: Value::Null,
            max: Value::Null,
        }
    }

    fn update(&mut self, v: &Value) -> Option<()> {
        if v.is_null() {
            return Some(());
        }
        self.sum = self.sum.add(v)?;
        self.count += 1;
        if self.min.is_null() || v.compare(&self.min) == Some(std::cmp::Ordering::Less) {
            self.min = v.clone();
        }
        if self.max.is_null() || v.compare(&self.max) == Some(std::cmp::Ordering::Greater) {
            self.max = v.clone();
        }
        Some(())
    }

    fn retract(&mut self, v: &Value) -> Option<Retracted> {
        if v.is_null() {
            return Some(Retracted::Done);
        }
        self.sum = self.sum.sub(v)?;
        self.count = self.count.saturating_sub(1);
        if self.count == 0 {
            self.min = Value::Null;
            self.max = Value::Null;
            return Some(Retracted::Done);
        }
        if v == &self.min || v == &self.max {
            return Some(Retracted::Stale);
        }
        Some(Retracted::Done)
    }

    /// Combines the aggregates of two disjoint sets of rows. Returns `None`
    /// if an integer sum overflows.
    pub fn merge(&self, other: &ColumnAggregate) -> Option<ColumnAggregate> {
        let pick = |a: &Value, b: &Value, want: std::cmp::Ordering| {
            if a.is_null() || b.compare(a) == Some(want) {
                b.clone()
            } else {
                a.clone()
            }
        };
        Some(ColumnAggregate {
            column: self.column.clone(),
            count: self.count + other.count,
            sum: self.sum.plus(other.sum)?,
            min: pick(&self.min, &other.min, std::cmp::Ordering::Less),
            max: pick(&self.max, &other.max, std::cmp::Ordering::Greater),
        })
    }

    pub fn avg(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum.as_f64() / self.count as f64)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketRecord {
    pub start: Timestamp,
    /// Rows in the bucket, NULLs included.
    pub rows: u64,
    pub columns: Vec<ColumnAggregate>,
}

impl BucketRecord {
    pub fn column(&self, name: &str) -> Option<&ColumnAggregate> {
        self.columns.iter().find(|c| c.column == name)
    }
}

// An SMA column resolved against the table schema.
#[derive(Debug, Clone)]
struct SmaColumn {
    name: String,
    idx: usize,
    ty: ColumnType,
}

/// Buckets touched by a batch of inserts, not yet visible.
#[derive(Debug, Default)]
pub struct SmaDelta {
    buckets: BTreeMap<Timestamp, BucketRecord>,
    stale: BTreeSet<Timestamp>,
}

impl SmaDelta {
    /// Buckets whose min or max lost a contributor and must be rebuilt with
    /// [`SmaIndex::rebuild`] before committing.
    pub fn stale_buckets(&self) -> Vec<Timestamp> {
        self.stale.iter().copied().collect()
    }
}

#[derive(Debug, Clone)]
pub struct SmaIndex {
    table: String,
    width: i64,
    columns: Vec<SmaColumn>,
    buckets: BTreeMap<Timestamp, BucketRecord>,
}

impl SmaIndex {
    /// `columns` maps each configured column to its position in the row's
    /// values and its type.
    pub fn new(
        table: impl Into<String>,
        config: &SmaConfig,
        columns: impl IntoIterator<Item = (usize, ColumnType)>,
    ) -> Self {
        SmaIndex {
            table: table.into(),
            width: config.bucket_width,
            columns: config
                .columns
                .iter()
                .zip(columns)
                .map(|(name, (idx, ty))| SmaColumn {
                    name: name.clone(),
                    idx,
                    ty,
                })
                .collect(),
            buckets: BTreeMap::new(),
        }
    }

    pub fn with_records(mut self, records: Vec<BucketRecord>) -> Self {
        self.buckets = records.into_iter().map(|r| (r.start, r)).collect();
        self
    }

    pub fn bucket_key(&self, ts: Timestamp) -> Result<Timestamp> {
        ts.checked_sub(ts.rem_euclid(self.width))
            .ok_or_else(|| self.overflow(ts))
    }

    // Exclusive end of the bucket starting at `start`.
    pub fn bucket_end(&self, start: Timestamp) -> Timestamp {
        start.saturating_add(self.width)
    }

    fn overflow(&self, ts: Timestamp) -> Error {
        Error::SmaOverflow {
            table: self.table.clone(),
            ts,
        }
    }

    fn empty_record(&self, start: Timestamp) -> BucketRecord {
        BucketRecord {
            start,
            rows: 0,
            columns: self
                .columns
                .iter()
                .map(|c| ColumnAggregate::empty(c.name.clone(), c.ty))
                .collect(),
        }
    }

    fn staged<'a>(&self, delta: &'a mut SmaDelta, start: Timestamp) -> &'a mut BucketRecord {
        delta.buckets.entry(start).or_insert_with(|| {
            self.buckets
                .get(&start)
                .cloned()
                .unwrap_or_else(|| self.empty_record(start))
        })
    }

    /// Stages the contribution of a new row.
    pub fn add(&self, delta: &mut SmaDelta, ts: Timestamp, values: &[Value]) -> Result<()> {
        let start = self.bucket_key(ts)?;
        let record = self.staged(delta, start);
        for (agg, col) in record.columns.iter_mut().zip(&self.columns) {
            let v = values.get(col.idx).unwrap_or(&Value::Null);
            agg.update(v).ok_or_else(|| self.overflow(ts))?;
        }
        record.rows += 1;
        Ok(())
    }

    /// Stages the removal of a row that is being replaced.
    pub fn retract(&self, delta: &mut SmaDelta, ts: Timestamp, values: &[Value]) -> Result<()> {
        let start = self.bucket_key(ts)?;
        let record = self.staged(delta, start);
        let mut stale = false;
        for (agg, col) in record.columns.iter_mut().zip(&self.columns) {
            let v = values.get(col.idx).unwrap_or(&Value::Null);
            match agg.retract(v).ok_or_else(|| self.overflow(ts))? {
                Retracted::Done => {}
                Retracted::Stale => stale = true,
            }
        }
        record.rows = record.rows.saturating_sub(1);
        if stale {
            delta.stale.insert(start);
        }
        Ok(())
    }

    /// Replaces a staged bucket with one computed from `rows`, the complete
    /// set of live rows in it.
    pub fn rebuild<'a, I>(&self, delta: &mut SmaDelta, start: Timestamp, rows: I) -> Result<()>
    where
        I: IntoIterator<Item = (Timestamp, &'a [Value])>,
    {
        let mut record = self.empty_record(start);
        for (ts, values) in rows {
            for (agg, col) in record.columns.iter_mut().zip(&self.columns) {
                let v = values.get(col.idx).unwrap_or(&Value::Null);
                agg.update(v).ok_or_else(|| self.overflow(ts))?;
            }
            record.rows += 1;
        }
        delta.buckets.insert(start, record);
        delta.stale.remove(&start);
        Ok(())
    }

    pub fn commit(&mut self, delta: SmaDelta) {
        debug_assert!(delta.stale.is_empty(), "committing stale sma buckets");
        for (start, record) in delta.buckets {
            if record.rows == 0 {
                self.buckets.remove(&start);
            } else {
                self.buckets.insert(start, record);
            }
        }
    }

    fn overlapping<'a>(&'a self, range: &TimeRange) -> impl Iterator<Item = &'a BucketRecord> + 'a {
        let end = range.end;
        let lo = if range.is_empty() {
            Timestamp::MAX
        } else {
            self.bucket_key(range.start).unwrap_or(Timestamp::MIN)
        };
        self.buckets
            .range(lo..)
            .map(|(_, r)| r)
            .take_while(move |r| r.start < end)
    }

    /// Buckets overlapping `range`, ascending, each reduced to `column`.
    /// `None` if `column` is not aggregated.
    pub fn query(&self, range: &TimeRange, column: &str) -> Option<Vec<BucketRecord>> {
        let pos = self.columns.iter().position(|c| c.name == column)?;
        Some(
            self.overlapping(range)
                .map(|r| BucketRecord {
                    start: r.start,
                    rows: r.rows,
                    columns: vec![r.columns[pos].clone()],
                })
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn records(&self) -> Vec<BucketRecord> {
        self.buckets.values().cloned().collect()
    }
}
