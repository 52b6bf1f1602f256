use std::cmp::Ordering;

use tracing::warn;

use crate::{
    catalog::Schema,
    error::{Error, Result},
    memtable::{BoxedIter, Entry, KVIter},
    types::{ColumnType, Order, Row, RowKey, TimeRange, Timestamp, Value},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    pub(crate) fn holds(self, ord: Ordering) -> bool {
        match self {
            CmpOp::Eq => ord == Ordering::Equal,
            CmpOp::Ne => ord != Ordering::Equal,
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::Le => ord != Ordering::Greater,
            CmpOp::Gt => ord == Ordering::Greater,
            CmpOp::Ge => ord != Ordering::Less,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "=" | "==" => CmpOp::Eq,
            "!=" | "<>" => CmpOp::Ne,
            "<" => CmpOp::Lt,
            "<=" => CmpOp::Le,
            ">" => CmpOp::Gt,
            ">=" => CmpOp::Ge,
            _ => return None,
        })
    }
}

/// A column condition. Comparisons never match a NULL column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare {
        column: String,
        op: CmpOp,
        value: Value,
    },
    IsNull(String),
    IsNotNull(String),
}

impl Predicate {
    pub fn compare(column: impl Into<String>, op: CmpOp, value: impl Into<Value>) -> Self {
        Predicate::Compare {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    pub(crate) fn column(&self) -> &str {
        match self {
            Predicate::Compare { column, .. } => column,
            Predicate::IsNull(column) | Predicate::IsNotNull(column) => column,
        }
    }
}

/// What to read from a table. The default reads every row in ascending
/// timestamp order.
#[derive(Debug, Clone, Default)]
pub struct ScanRequest {
    pub range: TimeRange,
    pub predicates: Vec<Predicate>,
    pub offset: i64,
    pub limit: Option<i64>,
    pub order: Order,
    pub projection: Option<Vec<String>>,
}

impl ScanRequest {
    pub fn new() -> Self {
        ScanRequest::default()
    }

    #[must_use]
    pub fn range(mut self, range: TimeRange) -> Self {
        self.range = range;
        self
    }

    #[must_use]
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    #[must_use]
    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn order(mut self, order: Order) -> Self {
        self.order = order;
        self
    }

    #[must_use]
    pub fn project<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.projection = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Checks the request against `schema` and resolves column names.
    pub(crate) fn bind(&self, schema: &Schema) -> Result<BoundScan> {
        if self.offset < 0 {
            return Err(Error::invalid(format!("negative offset {}", self.offset)));
        }
        if let Some(limit) = self.limit.filter(|l| *l < 0) {
            return Err(Error::invalid(format!("negative limit {}", limit)));
        }
        if !self.range.is_valid() {
            return Err(Error::invalid(format!(
                "time range starts at {} after its end {}",
                self.range.start, self.range.end
            )));
        }

        let mut range = self.range;
        let mut filters = Vec::with_capacity(self.predicates.len());
        for p in &self.predicates {
            let target = resolve(schema, p.column())?;
            let test = match p {
                Predicate::Compare { column, op, value } => {
                    let ty = match target {
                        Target::Ts => ColumnType::Int,
                        Target::Column(idx) => schema.columns[idx].ty,
                    };
                    if !value.comparable_with(ty) {
                        return Err(Error::invalid(format!(
                            "cannot compare column {} of type {:?} with {}",
                            column, ty, value
                        )));
                    }
                    if let (Target::Ts, Value::Int(ts)) = (target, value) {
                        range = narrow(range, *op, *ts);
                    }
                    Test::Compare(*op, value.clone())
                }
                Predicate::IsNull(_) => Test::IsNull,
                Predicate::IsNotNull(_) => Test::IsNotNull,
            };
            filters.push(BoundPredicate { target, test });
        }
        if !range.is_valid() {
            range = TimeRange::new(range.start, range.start);
        }

        let projection = match &self.projection {
            None => None,
            Some(cols) => Some(
                cols.iter()
                    .map(|c| {
                        schema
                            .column_index(c)
                            .ok_or_else(|| Error::invalid(format!("unknown column {:?}", c)))
                    })
                    .collect::<Result<Vec<_>>>()?,
            ),
        };

        Ok(BoundScan {
            range,
            filters,
            offset: self.offset as usize,
            limit: self.limit.map(|l| l as usize),
            order: self.order,
            projection,
        })
    }
}

fn resolve(schema: &Schema, column: &str) -> Result<Target> {
    if schema.is_ts_column(column) {
        return Ok(Target::Ts);
    }
    schema
        .column_index(column)
        .map(Target::Column)
        .ok_or_else(|| Error::invalid(format!("unknown column {:?}", column)))
}

// Shrinks `range` to the timestamps a predicate on the timestamp column can
// match, so blocks outside it are never read.
fn narrow(range: TimeRange, op: CmpOp, ts: Timestamp) -> TimeRange {
    let TimeRange { start, end } = range;
    let next = ts.saturating_add(1);
    match op {
        CmpOp::Eq => TimeRange::new(start.max(ts), end.min(next)),
        CmpOp::Lt => TimeRange::new(start, end.min(ts)),
        CmpOp::Le => TimeRange::new(start, end.min(next)),
        CmpOp::Gt => TimeRange::new(start.max(next), end),
        CmpOp::Ge => TimeRange::new(start.max(ts), end),
        CmpOp::Ne => range,
    }
}

#[derive(Debug, Clone, Copy)]
enum Target {
    Ts,
    Column(usize),
}

#[derive(Debug, Clone)]
enum Test {
    Compare(CmpOp, Value),
    IsNull,
    IsNotNull,
}

#[derive(Debug, Clone)]
pub(crate) struct BoundPredicate {
    target: Target,
    test: Test,
}

impl BoundPredicate {
    fn matches(&self, key: &RowKey, values: &[Value]) -> bool {
        let ts;
        let v = match self.target {
            Target::Ts => {
                ts = Value::Int(key.ts);
                &ts
            }
            Target::Column(idx) => values.get(idx).unwrap_or(&Value::Null),
        };
        match &self.test {
            Test::Compare(op, lit) => v.compare(lit).map_or(false, |ord| op.holds(ord)),
            Test::IsNull => v.is_null(),
            Test::IsNotNull => !v.is_null(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct BoundScan {
    pub(crate) range: TimeRange,
    pub(crate) filters: Vec<BoundPredicate>,
    pub(crate) offset: usize,
    pub(crate) limit: Option<usize>,
    pub(crate) order: Order,
    pub(crate) projection: Option<Vec<usize>>,
}

/// Shows only the newest version of each timestamp. Versions of a timestamp
/// are adjacent in the input: oldest first when ascending, newest first when
/// descending.
pub struct LatestIter<I> {
    inner: I,
    order: Order,
    current: Option<Entry>,
    filled: bool,
}

impl<I> LatestIter<I>
where
    I: KVIter<RowKey, Vec<Value>>,
{
    pub fn new(inner: I, order: Order) -> Self {
        LatestIter {
            inner,
            order,
            current: None,
            filled: false,
        }
    }

    fn fill(&mut self) -> anyhow::Result<()> {
        if self.filled {
            return Ok(());
        }
        self.current = None;
        let mut best = match self.inner.next()? {
            Some((k, v)) => (*k, v.clone()),
            None => {
                self.filled = true;
                return Ok(());
            }
        };
        loop {
            let same = match self.inner.peek()? {
                Some((k, _)) => k.ts == best.0.ts,
                None => false,
            };
            if !same {
                break;
            }
            match self.order {
                Order::Asc => {
                    if let Some((k, v)) = self.inner.next()? {
                        best = (*k, v.clone());
                    }
                }
                Order::Desc => {
                    self.inner.next()?;
                }
            }
        }
        self.current = Some(best);
        self.filled = true;
        Ok(())
    }
}

impl<I> KVIter<RowKey, Vec<Value>> for LatestIter<I>
where
    I: KVIter<RowKey, Vec<Value>>,
{
    fn next(&mut self) -> anyhow::Result<Option<(&RowKey, &Vec<Value>)>> {
        self.fill()?;
        self.filled = false;
        Ok(self.current.as_ref().map(|(k, v)| (k, v)))
    }

    fn peek(&mut self) -> anyhow::Result<Option<(&RowKey, &Vec<Value>)>> {
        self.fill()?;
        Ok(self.current.as_ref().map(|(k, v)| (k, v)))
    }
}

pub struct FilterIter<I> {
    inner: I,
    filters: Vec<BoundPredicate>,
}

impl<I> FilterIter<I>
where
    I: KVIter<RowKey, Vec<Value>>,
{
    pub(crate) fn new(inner: I, filters: Vec<BoundPredicate>) -> Self {
        FilterIter { inner, filters }
    }

    // Drops rows until the next one matches. Returns false at the end.
    fn skip_unmatched(&mut self) -> anyhow::Result<bool> {
        loop {
            let filters = &self.filters;
            let keep = match self.inner.peek()? {
                Some((k, v)) => filters.iter().all(|f| f.matches(k, v)),
                None => return Ok(false),
            };
            if keep {
                return Ok(true);
            }
            self.inner.next()?;
        }
    }
}

impl<I> KVIter<RowKey, Vec<Value>> for FilterIter<I>
where
    I: KVIter<RowKey, Vec<Value>>,
{
    fn next(&mut self) -> anyhow::Result<Option<(&RowKey, &Vec<Value>)>> {
        if !self.skip_unmatched()? {
            return Ok(None);
        }
        self.inner.next()
    }

    fn peek(&mut self) -> anyhow::Result<Option<(&RowKey, &Vec<Value>)>> {
        if !self.skip_unmatched()? {
            return Ok(None);
        }
        self.inner.peek()
    }
}

/// Rows of one table, produced lazily. Skipped rows are never copied, and
/// once the limit is reached nothing more is read. After an error the scan
/// is over.
pub struct TableScan {
    table: String,
    inner: BoxedIter,
    to_skip: usize,
    remaining: Option<usize>,
    projection: Option<Vec<usize>>,
    done: bool,
}

impl TableScan {
    pub(crate) fn new(table: String, inner: BoxedIter, bound: &BoundScan) -> Self {
        TableScan {
            table,
            inner,
            to_skip: bound.offset,
            remaining: bound.limit,
            projection: bound.projection.clone(),
            done: false,
        }
    }

    fn advance(&mut self) -> anyhow::Result<Option<Row>> {
        if self.remaining == Some(0) {
            return Ok(None);
        }
        while self.to_skip > 0 {
            if self.inner.next()?.is_none() {
                return Ok(None);
            }
            self.to_skip -= 1;
        }

        let projection = &self.projection;
        let row = match self.inner.next()? {
            Some((k, values)) => Row {
                ts: k.ts,
                values: match projection {
                    None => values.clone(),
                    Some(cols) => cols
                        .iter()
                        .map(|&i| values.get(i).cloned().unwrap_or_default())
                        .collect(),
                },
            },
            None => return Ok(None),
        };
        if let Some(n) = self.remaining.as_mut() {
            *n -= 1;
        }
        Ok(Some(row))
    }
}

impl Iterator for TableScan {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                warn!(table = %self.table, error = %e, "scan failed");
                Some(Err(Error::scan_failed(&self.table, e)))
            }
        }
    }
}
