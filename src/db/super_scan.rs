// Reads several child tables of a super table as one stream. Each child is
// read through its own snapshot and filters; the streams are merged on
// (timestamp, position of the child), children being ordered by id, and only
// then are offset and limit applied.
use tracing::warn;

use crate::{
    error::{Error, Result},
    memtable::{BoxedIter, KVIter, MergingIter},
    types::{Row, Timestamp, Value},
};

use super::scan::BoundScan;

/// A row of a super table scan, with the child table it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildRow {
    pub table: String,
    pub row: Row,
}

type ChildKey = (Timestamp, usize);

// One child's rows, keyed for merging with its siblings. Equal timestamps
// from different children come out in child order when ascending and in
// reverse child order when descending.
struct ChildIter {
    pos: usize,
    inner: BoxedIter,
    key: ChildKey,
}

impl KVIter<ChildKey, Vec<Value>> for ChildIter {
    fn next(&mut self) -> anyhow::Result<Option<(&ChildKey, &Vec<Value>)>> {
        match self.inner.next()? {
            Some((k, v)) => {
                self.key = (k.ts, self.pos);
                Ok(Some((&self.key, v)))
            }
            None => Ok(None),
        }
    }

    fn peek(&mut self) -> anyhow::Result<Option<(&ChildKey, &Vec<Value>)>> {
        match self.inner.peek()? {
            Some((k, v)) => {
                self.key = (k.ts, self.pos);
                Ok(Some((&self.key, v)))
            }
            None => Ok(None),
        }
    }
}

/// Rows of the selected child tables of a super table, merged by timestamp.
/// Rows are as wide as the super table's schema when the scan started:
/// children created before a column was added read it as NULL. After an
/// error the scan is over.
pub struct SuperTableScan {
    super_table: String,
    tables: Vec<String>,
    inner: MergingIter<ChildIter, ChildKey, Vec<Value>>,
    width: usize,
    to_skip: usize,
    remaining: Option<usize>,
    projection: Option<Vec<usize>>,
    done: bool,
}

impl SuperTableScan {
    pub(crate) fn new(
        super_table: String,
        children: Vec<(String, BoxedIter)>,
        bound: &BoundScan,
        width: usize,
    ) -> Self {
        let (tables, iters): (Vec<_>, Vec<_>) = children
            .into_iter()
            .enumerate()
            .map(|(pos, (name, inner))| {
                let it = ChildIter {
                    pos,
                    inner,
                    key: (0, pos),
                };
                (name, it)
            })
            .unzip();
        SuperTableScan {
            super_table,
            tables,
            inner: MergingIter::new(iters, bound.order),
            width,
            to_skip: bound.offset,
            remaining: bound.limit,
            projection: bound.projection.clone(),
            done: false,
        }
    }

    /// Names of the child tables being read, in id order.
    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    fn advance(&mut self) -> anyhow::Result<Option<ChildRow>> {
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
        let width = self.width;
        let (pos, row) = match self.inner.next()? {
            Some((&(ts, pos), values)) => {
                let values = match projection {
                    Some(cols) => cols
                        .iter()
                        .map(|&i| values.get(i).cloned().unwrap_or_default())
                        .collect(),
                    None => (0..width)
                        .map(|i| values.get(i).cloned().unwrap_or_default())
                        .collect(),
                };
                (pos, Row { ts, values })
            }
            None => return Ok(None),
        };
        if let Some(n) = self.remaining.as_mut() {
            *n -= 1;
        }
        Ok(Some(ChildRow {
            table: self.tables[pos].clone(),
            row,
        }))
    }
}

impl Iterator for SuperTableScan {
    type Item = Result<ChildRow>;

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
                warn!(super_table = %self.super_table, error = %e, "super table scan failed");
                Some(Err(Error::scan_failed(&self.super_table, e)))
            }
        }
    }
}
