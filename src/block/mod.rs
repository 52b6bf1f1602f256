// The immutable, on-disk tier of a table.
//
// A block is a file holding a bounded number of rows, ascending by key, and
// is never modified after it is written. Blocks written by one flush form a
// key-ordered sequence; a flush that starts past the end of the newest run
// extends it, a flush carrying older timestamps (retroactive inserts) starts
// a new run that overlaps the earlier ones. Reads concatenate the blocks of a
// run and merge the runs.
//
// Block metadata (key bounds, row count) lives in the manifest, so pruning by
// time range never touches a file, and a block's rows are only read once a
// scan actually reaches it.
use std::{collections::VecDeque, marker::PhantomData, sync::Arc};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::{Error, Result},
    fs::{DbDir, DbFile},
    memtable::{Entry, KVIter, MergingIter, VecIter},
    types::{Order, RowKey, TimeRange, Value},
};

pub mod reader;
pub mod writer;

pub type BlockId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub id: BlockId,
    pub file: String,
    pub min_key: RowKey,
    pub max_key: RowKey,
    pub rows: u32,
}

pub fn block_file_name(table_id: u64, id: BlockId) -> String {
    format!("blk-{}-{}", table_id, id)
}

#[derive(Debug, Clone)]
pub struct BlockStore {
    table: String,
    table_id: u64,
    capacity: usize,
    next_id: BlockId,
    runs: Vec<Vec<Arc<BlockMeta>>>,
}

impl BlockStore {
    pub fn new(table: impl Into<String>, table_id: u64, capacity: usize) -> Self {
        BlockStore {
            table: table.into(),
            table_id,
            capacity,
            next_id: 0,
            runs: Vec::new(),
        }
    }

    pub fn from_runs(
        table: impl Into<String>,
        table_id: u64,
        capacity: usize,
        next_id: BlockId,
        runs: Vec<Vec<BlockMeta>>,
    ) -> Self {
        BlockStore {
            table: table.into(),
            table_id,
            capacity,
            next_id,
            runs: runs
                .into_iter()
                .map(|run| run.into_iter().map(Arc::new).collect())
                .collect(),
        }
    }

    pub fn runs(&self) -> Vec<Vec<BlockMeta>> {
        self.runs
            .iter()
            .map(|run| run.iter().map(|b| (**b).clone()).collect())
            .collect()
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    pub fn next_id(&self) -> BlockId {
        self.next_id
    }

    pub fn blocks(&self) -> impl Iterator<Item = &BlockMeta> {
        self.runs.iter().flatten().map(|b| b.as_ref())
    }

    pub fn block_count(&self) -> usize {
        self.runs.iter().map(Vec::len).sum()
    }

    pub fn row_count(&self) -> u64 {
        self.blocks().map(|b| b.rows as u64).sum()
    }

    pub fn max_key(&self) -> Option<RowKey> {
        self.runs
            .iter()
            .filter_map(|run| run.last().map(|b| b.max_key))
            .max()
    }

    /// Persists `rows` as a new block and makes it part of the store.
    ///
    /// `rows` must be non-empty, hold at most the block capacity, and be
    /// strictly ascending by key.
    pub fn append_block<D: DbDir>(&mut self, dir: &D, rows: Vec<Entry>) -> Result<BlockId> {
        if rows.is_empty() {
            return Err(Error::invalid("cannot append an empty block"));
        }
        if rows.len() > self.capacity {
            return Err(Error::CapacityExceeded {
                table: self.table.clone(),
                rows: rows.len(),
                capacity: self.capacity,
            });
        }
        if let Some(position) = rows.windows(2).position(|w| w[0].0 >= w[1].0) {
            return Err(Error::OutOfOrder {
                table: self.table.clone(),
                position: position + 1,
            });
        }

        let id = self.next_id;
        let file = block_file_name(self.table_id, id);
        let footer = self
            .write_file(dir, &file, &rows)
            .map_err(|e| Error::disk_io(&self.table, "append_block", e))?;

        let meta = Arc::new(BlockMeta {
            id,
            file,
            min_key: footer.min_key,
            max_key: footer.max_key,
            rows: footer.rows,
        });
        self.next_id += 1;
        match self.runs.last_mut() {
            Some(run) if run.last().map_or(true, |b| b.max_key < meta.min_key) => run.push(meta),
            _ => self.runs.push(vec![meta]),
        }
        debug!(table = %self.table, block = id, rows = rows.len(), runs = self.runs.len(), "appended block");

        Ok(id)
    }

    fn write_file<D: DbDir>(
        &self,
        dir: &D,
        file: &str,
        rows: &[Entry],
    ) -> anyhow::Result<writer::BlockFooter> {
        let (footer, data) = writer::encode_block(rows)?;
        let mut f = dir
            .create(&file)?
            .ok_or_else(|| anyhow!("block file {} already exists", file))?;
        f.write(&data)?;
        f.sync()?;
        Ok(footer)
    }

    /// Rows with timestamps in `range`, in `order`. Blocks outside the range
    /// are never opened, and the ones inside are only read when reached.
    pub fn scan<D: DbDir>(&self, dir: &D, range: &TimeRange, order: Order) -> BlockScan<D> {
        let (lower, upper) = (range.lower_key(), range.upper_key());
        let levels = self.runs.iter().filter_map(|run| {
            let mut blocks: Vec<_> = run
                .iter()
                .filter(|b| range.overlaps(b.min_key.ts, b.max_key.ts))
                .map(|b| BlockIter::new(dir.clone(), b.clone(), lower, upper, order))
                .collect();
            if blocks.is_empty() {
                return None;
            }
            if order == Order::Desc {
                blocks.reverse();
            }
            Some(LevelIter::new(blocks))
        });
        MergingIter::new(levels.collect::<Vec<_>>(), order)
    }
}

pub type BlockScan<D> =
    MergingIter<LevelIter<RowKey, Vec<Value>, BlockIter<D>>, RowKey, Vec<Value>>;

// One block, read on first use.
pub struct BlockIter<D: DbDir> {
    dir: D,
    meta: Arc<BlockMeta>,
    lower: RowKey,
    upper: RowKey,
    order: Order,
    inner: Option<VecIter<RowKey, Vec<Value>>>,
}

impl<D: DbDir> BlockIter<D> {
    fn new(dir: D, meta: Arc<BlockMeta>, lower: RowKey, upper: RowKey, order: Order) -> Self {
        BlockIter {
            dir,
            meta,
            lower,
            upper,
            order,
            inner: None,
        }
    }

    fn open(&self) -> anyhow::Result<VecIter<RowKey, Vec<Value>>> {
        let file = self
            .dir
            .open(&self.meta.file)?
            .ok_or_else(|| anyhow!("block file {} is missing", self.meta.file))?;
        let (footer, rows) = reader::decode_block(&file.read_all()?)
            .map_err(|e| e.context(format!("reading block {}", self.meta.file)))?;
        if footer.rows != self.meta.rows || footer.min_key != self.meta.min_key {
            anyhow::bail!("block {} does not match its metadata", self.meta.file);
        }
        Ok(VecIter::bounded(
            Arc::new(rows),
            &self.lower,
            &self.upper,
            self.order,
        ))
    }

    fn loaded(&mut self) -> anyhow::Result<&mut VecIter<RowKey, Vec<Value>>> {
        let it = match self.inner.take() {
            Some(it) => it,
            None => self.open()?,
        };
        Ok(self.inner.insert(it))
    }
}

impl<D: DbDir> KVIter<RowKey, Vec<Value>> for BlockIter<D> {
    fn next(&mut self) -> anyhow::Result<Option<(&RowKey, &Vec<Value>)>> {
        self.loaded()?.next()
    }

    fn peek(&mut self) -> anyhow::Result<Option<(&RowKey, &Vec<Value>)>> {
        self.loaded()?.peek()
    }
}

// Concatenates iterators whose key ranges follow each other in scan order.
// Exhausted iterators are dropped as soon as they are passed, so a long scan
// holds at most one loaded block per run.
pub struct LevelIter<K, V, I>
where
    I: KVIter<K, V>,
{
    iters: VecDeque<I>,
    _marker: PhantomData<(K, V)>,
}

impl<K, V, I> LevelIter<K, V, I>
where
    I: KVIter<K, V>,
{
    pub fn new<C: IntoIterator<Item = I>>(c: C) -> Self {
        LevelIter {
            iters: c.into_iter().collect(),
            _marker: PhantomData,
        }
    }

    fn skip_exhausted(&mut self) -> anyhow::Result<()> {
        while let Some(front) = self.iters.front_mut() {
            if front.peek()?.is_some() {
                break;
            }
            self.iters.pop_front();
        }
        Ok(())
    }
}

impl<K, V, I> KVIter<K, V> for LevelIter<K, V, I>
where
    I: KVIter<K, V>,
{
    fn next(&mut self) -> anyhow::Result<Option<(&K, &V)>> {
        self.skip_exhausted()?;
        match self.iters.front_mut() {
            Some(it) => it.next(),
            None => Ok(None),
        }
    }

    fn peek(&mut self) -> anyhow::Result<Option<(&K, &V)>> {
        self.skip_exhausted()?;
        match self.iters.front_mut() {
            Some(it) => it.peek(),
            None => Ok(None),
        }
    }
}
