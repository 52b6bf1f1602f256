use std::{marker::PhantomData, sync::Arc};

use crate::{
    config::DuplicatePolicy,
    types::{Order, RowKey, TimeRange, Timestamp, Value},
};

/// A pull iterator over key-ordered entries. The direction is fixed when the
/// iterator is built; `peek` returns what the next call to `next` will.
///
/// Both may fail, since some implementations load their data lazily from
/// disk.
pub trait KVIter<K, V> {
    fn next(&mut self) -> anyhow::Result<Option<(&K, &V)>>;
    fn peek(&mut self) -> anyhow::Result<Option<(&K, &V)>>;
}

impl<K, V, I> KVIter<K, V> for Box<I>
where
    I: KVIter<K, V> + ?Sized,
{
    fn next(&mut self) -> anyhow::Result<Option<(&K, &V)>> {
        (**self).next()
    }

    fn peek(&mut self) -> anyhow::Result<Option<(&K, &V)>> {
        (**self).peek()
    }
}

pub type Entry = (RowKey, Vec<Value>);

pub type BoxedIter = Box<dyn KVIter<RowKey, Vec<Value>> + Send>;

// Iterates the slice `lo..hi` of a shared, sorted vector.
#[derive(Debug)]
pub struct VecIter<K, V> {
    lo: usize,
    hi: usize,
    order: Order,
    contents: Arc<Vec<(K, V)>>,
}

impl<K, V> VecIter<K, V>
where
    K: Ord,
{
    pub fn new(v: Arc<Vec<(K, V)>>, order: Order) -> Self {
        Self {
            lo: 0,
            hi: v.len(),
            order,
            contents: v,
        }
    }

    // Only entries with lower <= key < upper.
    pub fn bounded(v: Arc<Vec<(K, V)>>, lower: &K, upper: &K, order: Order) -> Self {
        let lo = v.partition_point(|(k, _)| k < lower);
        let hi = std::cmp::max(lo, v.partition_point(|(k, _)| k < upper));
        Self {
            lo,
            hi,
            order,
            contents: v,
        }
    }
}

impl<K, V> KVIter<K, V> for VecIter<K, V>
where
    K: Ord,
{
    fn next(&mut self) -> anyhow::Result<Option<(&K, &V)>> {
        if self.lo >= self.hi {
            return Ok(None);
        }
        let idx = match self.order {
            Order::Asc => {
                self.lo += 1;
                self.lo - 1
            }
            Order::Desc => {
                self.hi -= 1;
                self.hi
            }
        };
        let v = &self.contents[idx];
        Ok(Some((&v.0, &v.1)))
    }

    fn peek(&mut self) -> anyhow::Result<Option<(&K, &V)>> {
        if self.lo >= self.hi {
            return Ok(None);
        }
        let idx = match self.order {
            Order::Asc => self.lo,
            Order::Desc => self.hi - 1,
        };
        let v = &self.contents[idx];
        Ok(Some((&v.0, &v.1)))
    }
}

pub struct MergingIter<I, K, V>
where
    K: Ord,
    I: KVIter<K, V>,
{
    iters: Vec<I>,
    order: Order,
    _marker: PhantomData<(K, V)>,
}

impl<I, K, V> MergingIter<I, K, V>
where
    K: Ord,
    I: KVIter<K, V>,
{
    pub fn new<J>(j: J, order: Order) -> Self
    where
        J: IntoIterator<Item = I>,
    {
        Self {
            iters: j.into_iter().collect(),
            order,
            _marker: PhantomData,
        }
    }

    // The source whose head comes first in scan order. Keys are unique across
    // sources, so there is never a tie to break.
    fn lowest(&mut self) -> anyhow::Result<Option<usize>> {
        let order = self.order;
        let mut lowest: Option<(usize, &K)> = None;

        for (idx, it) in self.iters.iter_mut().enumerate() {
            if let Some((k, _)) = it.peek()? {
                match lowest {
                    Some((_, best)) if !order.precedes(k, best) => {}
                    _ => lowest = Some((idx, k)),
                }
            }
        }

        Ok(lowest.map(|(x, _)| x))
    }
}

impl<I, K, V> KVIter<K, V> for MergingIter<I, K, V>
where
    I: KVIter<K, V>,
    K: Ord,
{
    fn peek(&mut self) -> anyhow::Result<Option<(&K, &V)>> {
        match self.lowest()? {
            Some(i) => self.iters[i].peek(),
            None => Ok(None),
        }
    }

    fn next(&mut self) -> anyhow::Result<Option<(&K, &V)>> {
        match self.lowest()? {
            Some(i) => self.iters[i].next(),
            None => Ok(None),
        }
    }
}

/// The mutable, in-memory tier of a table.
///
/// Rows are kept in a stack of sorted, immutable slabs whose sizes at least
/// halve towards the top. An insert pushes a one-row slab and merges it down
/// while the slab below is less than twice its size, so inserts at any
/// timestamp cost amortized O(log n) and cloning the buffer (a snapshot) only
/// clones the slab pointers. Readers holding a clone never see later inserts.
#[derive(Debug, Clone, Default)]
pub struct WriteBuffer {
    prev_seqnum: u64,
    len: usize,
    max_ts: Option<Timestamp>,
    entries: Vec<Arc<Vec<Entry>>>,
}

impl WriteBuffer {
    pub fn new() -> Self {
        WriteBuffer::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn max_ts(&self) -> Option<Timestamp> {
        self.max_ts
    }

    fn merge(lhs: &[Entry], rhs: &[Entry]) -> Arc<Vec<Entry>> {
        let mut out = Vec::with_capacity(lhs.len() + rhs.len());
        let mut lhs = lhs.iter();
        let mut rhs = rhs.iter();
        let mut left = lhs.next();
        let mut right = rhs.next();
        loop {
            match (left, right) {
                (None, None) => {
                    break;
                }
                (Some(l), None) => {
                    out.push(l.clone());
                    out.extend(lhs.cloned());
                    break;
                }
                (None, Some(r)) => {
                    out.push(r.clone());
                    out.extend(rhs.cloned());
                    break;
                }
                (Some(l), Some(r)) => {
                    if l.0 < r.0 {
                        out.push(l.clone());
                        left = lhs.next();
                    } else {
                        out.push(r.clone());
                        right = rhs.next();
                    }
                }
            }
        }

        Arc::new(out)
    }

    fn maybe_fix_at(&mut self, idx: usize) {
        if self.entries[idx].len() < self.entries[idx + 1].len() * 2 {
            let merged = Self::merge(&self.entries[idx], &self.entries[idx + 1]);
            self.entries.splice(idx..idx + 2, [merged]).for_each(drop);
        }
    }

    /// Callers hand out seqnums; they must be strictly increasing.
    pub fn insert(&mut self, key: RowKey, values: Vec<Value>) {
        debug_assert!(
            key.seqnum > self.prev_seqnum,
            "seqnums must be strictly increasing"
        );
        self.prev_seqnum = key.seqnum;
        self.len += 1;
        self.max_ts = Some(self.max_ts.map_or(key.ts, |m| m.max(key.ts)));
        self.entries.push(Arc::new(vec![(key, values)]));
        for i in (0..(self.entries.len() - 1)).rev() {
            self.maybe_fix_at(i);
        }
    }

    /// Every buffered row in key order, as one slab. Under
    /// [`DuplicatePolicy::Overwrite`] only the newest row per timestamp is
    /// kept, since the older ones can never be seen again.
    pub fn sorted(&self, policy: DuplicatePolicy) -> Vec<Entry> {
        let mut all: Vec<Entry> = self
            .entries
            .iter()
            .flat_map(|slab| slab.iter().cloned())
            .collect();
        all.sort_unstable_by_key(|(k, _)| *k);
        if policy == DuplicatePolicy::Overwrite {
            let mut deduped: Vec<Entry> = Vec::with_capacity(all.len());
            for e in all.drain(..) {
                match deduped.last_mut() {
                    Some(last) if last.0.ts == e.0.ts => *last = e,
                    _ => deduped.push(e),
                }
            }
            return deduped;
        }
        all
    }

    /// Removes and returns all buffered rows in key order, leaving the buffer
    /// empty.
    pub fn flush(&mut self, policy: DuplicatePolicy) -> Vec<Entry> {
        let rows = self.sorted(policy);
        self.clear();
        rows
    }

    /// Drops every buffered row. Seqnums handed out later must still be
    /// greater than the ones seen so far.
    pub fn clear(&mut self) {
        let prev_seqnum = self.prev_seqnum;
        *self = WriteBuffer::new();
        self.prev_seqnum = prev_seqnum;
    }

    pub fn scan(&self, range: &TimeRange, order: Order) -> MergingIter<VecIter<RowKey, Vec<Value>>, RowKey, Vec<Value>> {
        let (lower, upper) = (range.lower_key(), range.upper_key());
        MergingIter::new(
            self.entries
                .iter()
                .map(|e| VecIter::bounded(e.clone(), &lower, &upper, order)),
            order,
        )
    }
}
