// The storage of one table: its Block Store, Write Buffer, WAL and SMA Index.
//
// A single writer (the `writer` mutex) inserts and flushes. Readers take the
// `state` lock only long enough to clone a `Snapshot`, which is a handful of
// `Arc`s; a flush installs its new blocks and empties the buffer in one
// write-locked step, so every snapshot sees each row in exactly one tier.
use std::{collections::BTreeMap, ops::RangeInclusive, sync::Arc};

use anyhow::anyhow;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    block::{block_file_name, BlockId, BlockMeta, BlockStore},
    catalog::TableMeta,
    config::{DuplicatePolicy, EngineConfig},
    error::{Error, Result},
    fs::DbDir,
    log::{InsertEntry, Log, LogReader},
    memtable::{BoxedIter, KVIter, MergingIter, WriteBuffer},
    root::Root,
    sma::{BucketRecord, SmaDelta, SmaIndex},
    types::{Order, Row, RowKey, TimeRange, Timestamp, Value},
};

use super::{
    scan::{BoundScan, FilterIter, LatestIter, TableScan},
    Manifest,
};

pub(crate) fn wal_file_name(table_id: u64, generation: u64) -> String {
    format!("wal-{}-{}", table_id, generation)
}

/// What the manifest records about one table's storage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct TabletManifest {
    pub(crate) runs: Vec<Vec<BlockMeta>>,
    pub(crate) next_block: BlockId,
    // Taken at flush, when the buffer is empty: WAL replay brings it up to date.
    pub(crate) sma: Vec<BucketRecord>,
    pub(crate) wals: Vec<String>,
    pub(crate) wal_generation: u64,
    pub(crate) next_seqnum: u64,
}

impl TabletManifest {
    pub(crate) fn files(&self) -> impl Iterator<Item = &str> {
        self.runs
            .iter()
            .flatten()
            .map(|b| b.file.as_str())
            .chain(self.wals.iter().map(String::as_str))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableStats {
    pub buffered_rows: usize,
    pub blocks: usize,
    pub runs: usize,
    pub block_rows: u64,
    pub sma_buckets: usize,
}

// Which rows are in which tier, as of one instant.
#[derive(Debug, Clone)]
struct Snapshot {
    buffer: WriteBuffer,
    blocks: Arc<BlockStore>,
}

impl Snapshot {
    fn max_ts(&self) -> Option<Timestamp> {
        let blocks = self.blocks.max_key().map(|k| k.ts);
        match (self.buffer.max_ts(), blocks) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    // Every stored version of every row in `range`, both tiers merged.
    fn merged<D: DbDir>(&self, dir: &D, range: &TimeRange, order: Order) -> BoxedIter {
        let blocks: BoxedIter = Box::new(self.blocks.scan(dir, range, order));
        let buffer: BoxedIter = Box::new(self.buffer.scan(range, order));
        Box::new(MergingIter::new([blocks, buffer], order))
    }

    fn newest_at<D: DbDir>(&self, dir: &D, ts: Timestamp) -> anyhow::Result<Option<Vec<Value>>> {
        let mut it = self.merged(dir, &TimeRange::new(ts, ts.saturating_add(1)), Order::Desc);
        Ok(it.next()?.map(|(_, v)| v.clone()))
    }

    fn live_rows<D: DbDir>(
        &self,
        dir: &D,
        range: &TimeRange,
    ) -> anyhow::Result<BTreeMap<Timestamp, Vec<Value>>> {
        let mut it = LatestIter::new(self.merged(dir, range, Order::Asc), Order::Asc);
        let mut out = BTreeMap::new();
        while let Some((k, v)) = it.next()? {
            out.insert(k.ts, v.clone());
        }
        Ok(out)
    }
}

#[derive(Debug)]
struct TabletState {
    data: Snapshot,
    sma: Option<SmaIndex>,
}

#[derive(Debug)]
struct Writer<D: DbDir> {
    wal: Log<D, InsertEntry>,
    wals: Vec<String>,
    // Highest generation handed out, whether or not its WAL made it into the
    // manifest.
    wal_generation: u64,
    next_seqnum: u64,
    // An append to `wal` failed, so it may end in part of a batch and must
    // not be appended to again.
    wal_broken: bool,
    dropped: bool,
}

impl<D: DbDir> Writer<D> {
    fn next_wal_name(&mut self, table_id: u64) -> String {
        self.wal_generation += 1;
        wal_file_name(table_id, self.wal_generation)
    }
}

#[derive(Debug)]
pub(crate) struct Tablet<D: DbDir> {
    pub(crate) meta: TableMeta,
    dir: D,
    config: EngineConfig,
    writer: Mutex<Writer<D>>,
    state: RwLock<TabletState>,
}

impl<D: DbDir> Tablet<D> {
    /// Storage for a new, empty table. The returned manifest entry must be
    /// persisted before the table is used.
    pub(crate) fn create(
        meta: TableMeta,
        dir: &D,
        config: &EngineConfig,
    ) -> Result<(Self, TabletManifest)> {
        let tm = TabletManifest {
            next_seqnum: 1,
            ..TabletManifest::default()
        };
        Self::open(meta, dir, config, &tm, Vec::new())
    }

    /// Rebuilds a table from its manifest entry, replaying its WALs into the
    /// write buffer, and starts a new WAL generation. The returned manifest
    /// entry lists the new WAL.
    pub(crate) fn recover(
        meta: TableMeta,
        dir: &D,
        config: &EngineConfig,
        tm: &TabletManifest,
    ) -> Result<(Self, TabletManifest)> {
        let io = |e: anyhow::Error| Error::disk_io(&meta.name, "recover", e);
        let mut batch = Vec::new();
        for wal in &tm.wals {
            let file = dir
                .open(wal)
                .map_err(io)?
                .ok_or_else(|| io(anyhow!("wal {} is missing", wal)))?;
            for entry in LogReader::<InsertEntry>::new(&file).map_err(io)? {
                batch.push(entry.map_err(io)?);
            }
        }
        Self::open(meta, dir, config, tm, batch)
    }

    fn open(
        meta: TableMeta,
        dir: &D,
        config: &EngineConfig,
        tm: &TabletManifest,
        replay: Vec<InsertEntry>,
    ) -> Result<(Self, TabletManifest)> {
        let blocks = BlockStore::from_runs(
            meta.name.clone(),
            meta.id,
            config.max_rows_per_block,
            tm.next_block,
            tm.runs.clone(),
        );
        let sma = meta.sma.as_ref().map(|c| {
            SmaIndex::new(meta.name.clone(), c, meta.sma_columns()).with_records(tm.sma.clone())
        });

        let mut next_seqnum = tm.next_seqnum.max(1);
        if let Some(last) = replay.last() {
            next_seqnum = next_seqnum.max(last.key.seqnum + 1);
        }
        let generation = if tm.wals.is_empty() {
            tm.wal_generation
        } else {
            tm.wal_generation + 1
        };
        let wal_name = wal_file_name(meta.id, generation);
        let wal = Log::create(dir, wal_name.clone(), next_seqnum - 1, config.sync_wal)
            .map_err(|e| Error::disk_io(&meta.name, "open_wal", e))?;
        let mut wals = tm.wals.clone();
        wals.push(wal_name);

        let tablet = Tablet {
            dir: dir.clone(),
            config: config.clone(),
            writer: Mutex::new(Writer {
                wal,
                wals: wals.clone(),
                wal_generation: generation,
                next_seqnum,
                wal_broken: false,
                dropped: false,
            }),
            state: RwLock::new(TabletState {
                data: Snapshot {
                    buffer: WriteBuffer::new(),
                    blocks: Arc::new(blocks),
                },
                sma,
            }),
            meta,
        };

        if !replay.is_empty() {
            info!(table = %tablet.meta.name, rows = replay.len(), wals = tm.wals.len(), "replaying wal");
            let delta = tablet.stage(&replay, "recover")?;
            tablet.apply(replay, delta);
        }

        let tm = TabletManifest {
            wals,
            wal_generation: generation,
            next_seqnum,
            ..tm.clone()
        };
        Ok((tablet, tm))
    }

    fn io_error(&self, op: &'static str, e: anyhow::Error) -> Error {
        Error::disk_io(&self.meta.name, op, e)
    }

    fn validate(&self, rows: &[Row]) -> Result<()> {
        let schema = &self.meta.schema;
        for (i, row) in rows.iter().enumerate() {
            if row.ts == Timestamp::MAX {
                return Err(Error::invalid(format!(
                    "row {}: timestamp {} is reserved",
                    i,
                    Timestamp::MAX
                )));
            }
            if row.values.len() != schema.columns.len() {
                return Err(Error::invalid(format!(
                    "row {}: table {} has {} columns, got {} values",
                    i,
                    self.meta.name,
                    schema.columns.len(),
                    row.values.len()
                )));
            }
            for (v, col) in row.values.iter().zip(&schema.columns) {
                if !v.fits(col.ty) {
                    return Err(Error::invalid(format!(
                        "row {}: column {} expects {:?}, got {}",
                        i, col.name, col.ty, v
                    )));
                }
                if matches!(v, Value::Double(d) if !d.is_finite()) {
                    return Err(Error::invalid(format!(
                        "row {}: column {} got non-finite {}",
                        i, col.name, v
                    )));
                }
            }
        }
        Ok(())
    }

    // Computes what `batch` does to the SMA Index without changing it. Under
    // `Overwrite`, each row first retracts the version it replaces.
    fn stage(&self, batch: &[InsertEntry], op: &'static str) -> Result<Option<SmaDelta>> {
        let state = self.state.read();
        let sma = match &state.sma {
            Some(sma) => sma,
            None => return Ok(None),
        };
        let data = &state.data;
        let mut delta = SmaDelta::default();

        if self.config.duplicate_policy == DuplicatePolicy::KeepAll {
            for e in batch {
                sma.add(&mut delta, e.key.ts, &e.values)?;
            }
            return Ok(Some(delta));
        }

        let known_max = data.max_ts();
        let mut pending: BTreeMap<Timestamp, &[Value]> = BTreeMap::new();
        for e in batch {
            let ts = e.key.ts;
            let replaced = match pending.get(&ts) {
                Some(prev) => Some(prev.to_vec()),
                None if known_max.map_or(false, |m| ts <= m) => data
                    .newest_at(&self.dir, ts)
                    .map_err(|e| self.io_error(op, e))?,
                None => None,
            };
            if let Some(old) = replaced {
                sma.retract(&mut delta, ts, &old)?;
            }
            sma.add(&mut delta, ts, &e.values)?;
            pending.insert(ts, &e.values);
        }

        for start in delta.stale_buckets() {
            let range = TimeRange::new(start, sma.bucket_end(start));
            let mut live = data
                .live_rows(&self.dir, &range)
                .map_err(|e| self.io_error(op, e))?;
            for (ts, values) in pending.range(range.start..range.end) {
                live.insert(*ts, values.to_vec());
            }
            debug!(table = %self.meta.name, bucket = start, rows = live.len(), "rebuilding sma bucket");
            sma.rebuild(
                &mut delta,
                start,
                live.iter().map(|(ts, v)| (*ts, v.as_slice())),
            )?;
        }
        Ok(Some(delta))
    }

    fn apply(&self, batch: Vec<InsertEntry>, delta: Option<SmaDelta>) {
        let mut guard = self.state.write();
        let state = &mut *guard;
        for e in batch {
            state.data.buffer.insert(e.key, e.values);
        }
        if let (Some(sma), Some(delta)) = (state.sma.as_mut(), delta) {
            sma.commit(delta);
        }
    }

    /// Validates, logs and applies `rows` as one batch: either all of them
    /// become visible or none do.
    pub(crate) fn insert(&self, rows: Vec<Row>, root: &Mutex<Root<Manifest, D>>) -> Result<usize> {
        self.validate(&rows)?;
        let mut writer = self.writer.lock();
        if writer.dropped {
            return Err(Error::table_not_found(&self.meta.name));
        }
        if rows.is_empty() {
            return Ok(0);
        }
        if writer.wal_broken {
            self.replace_wal(&mut writer, root)?;
        }
        let n = rows.len();

        let first = writer.next_seqnum;
        let batch: Vec<InsertEntry> = rows
            .into_iter()
            .zip(first..)
            .map(|(row, seqnum)| InsertEntry {
                key: RowKey::new(row.ts, seqnum),
                values: row.values,
            })
            .collect();

        let delta = self.stage(&batch, "insert")?;
        if let Err(e) = writer.wal.write_batch(&batch) {
            // Part of the batch may be on disk: its seqnums are spent.
            writer.next_seqnum = first + n as u64;
            writer.wal_broken = true;
            if let Err(replace_err) = self.replace_wal(&mut writer, root) {
                warn!(table = %self.meta.name, error = %replace_err, "failed to replace wal after failed append");
            }
            return Err(self.io_error("insert", e));
        }
        writer.next_seqnum = first + n as u64;
        self.apply(batch, delta);

        let buffered = self.state.read().data.buffer.len();
        debug!(table = %self.meta.name, rows = n, buffered, "inserted");
        if let Some(threshold) = self.config.flush_threshold_rows {
            if buffered >= threshold {
                // The rows are durable in the WAL either way.
                if let Err(e) = self.flush_locked(&mut writer, root) {
                    warn!(table = %self.meta.name, error = %e, "automatic flush failed");
                }
            }
        }
        Ok(n)
    }

    // Moves appends to a new WAL after one failed, so a torn record can only
    // ever be the last one of its file. The old WAL stays listed until the
    // next flush, since the rows before the tear are still needed.
    fn replace_wal(&self, writer: &mut Writer<D>, root: &Mutex<Root<Manifest, D>>) -> Result<()> {
        let wal_name = writer.next_wal_name(self.meta.id);
        let last_seqnum = writer.next_seqnum - 1;
        let wal = Log::create(&self.dir, wal_name.clone(), last_seqnum, self.config.sync_wal)
            .map_err(|e| self.io_error("replace_wal", e))?;

        let mut wals = writer.wals.clone();
        wals.push(wal_name.clone());
        let (generation, next_seqnum) = (writer.wal_generation, writer.next_seqnum);
        let committed = self.commit_manifest(root, "replace_wal", |tm| TabletManifest {
            wals: wals.clone(),
            wal_generation: generation,
            next_seqnum,
            ..tm.clone()
        });
        if let Err(e) = committed {
            if let Err(unlink_err) = self.dir.unlink(&wal_name) {
                warn!(table = %self.meta.name, file = %wal_name, error = %unlink_err, "failed to remove unused wal");
            }
            return Err(e);
        }

        writer.wal = wal;
        writer.wals = wals;
        writer.wal_broken = false;
        info!(table = %self.meta.name, wal = %wal_name, "replaced wal after failed append");
        Ok(())
    }

    // Replaces the table's manifest entry with `f` of the current one, unless
    // the table has been dropped in the meantime.
    fn commit_manifest<F>(
        &self,
        root: &Mutex<Root<Manifest, D>>,
        op: &'static str,
        f: F,
    ) -> Result<()>
    where
        F: FnOnce(&TabletManifest) -> TabletManifest,
    {
        let mut root = root.lock();
        let id = self.meta.id;
        let next = match root.data().tablets.get(&id) {
            Some(tm) => f(tm),
            None => return Err(Error::table_not_found(&self.meta.name)),
        };
        root.transform(|mut m| {
            m.tablets.insert(id, next);
            m
        })
        .map_err(|e| self.io_error(op, e))
    }

    /// Moves the write buffer into new blocks. Returns the number of rows
    /// written.
    pub(crate) fn flush(&self, root: &Mutex<Root<Manifest, D>>) -> Result<usize> {
        let mut writer = self.writer.lock();
        self.flush_locked(&mut writer, root)
    }

    fn flush_locked(&self, writer: &mut Writer<D>, root: &Mutex<Root<Manifest, D>>) -> Result<usize> {
        if writer.dropped {
            return Err(Error::table_not_found(&self.meta.name));
        }
        let (rows, mut blocks, sma) = {
            let state = self.state.read();
            if state.data.buffer.is_empty() {
                return Ok(0);
            }
            (
                state.data.buffer.sorted(self.config.duplicate_policy),
                (*state.data.blocks).clone(),
                state.sma.as_ref().map(SmaIndex::records).unwrap_or_default(),
            )
        };
        let n = rows.len();
        let first_block = blocks.next_id();

        let mut rows = rows.into_iter();
        loop {
            let chunk: Vec<_> = rows.by_ref().take(self.config.max_rows_per_block).collect();
            if chunk.is_empty() {
                break;
            }
            if let Err(e) = blocks.append_block(&self.dir, chunk) {
                self.discard(first_block..=blocks.next_id(), None);
                return Err(e);
            }
        }

        let wal_name = writer.next_wal_name(self.meta.id);
        let generation = writer.wal_generation;
        let wal = match Log::create(&self.dir, wal_name.clone(), writer.next_seqnum - 1, self.config.sync_wal) {
            Ok(wal) => wal,
            Err(e) => {
                self.discard(first_block..=blocks.next_id(), Some(&wal_name));
                return Err(self.io_error("flush", e));
            }
        };

        let tm = TabletManifest {
            runs: blocks.runs(),
            next_block: blocks.next_id(),
            sma,
            wals: vec![wal_name.clone()],
            wal_generation: generation,
            next_seqnum: writer.next_seqnum,
        };
        if let Err(e) = self.commit_manifest(root, "flush", |_| tm) {
            self.discard(first_block..=blocks.next_id(), Some(&wal_name));
            return Err(e);
        }

        let written = blocks.block_count() - self.state.read().data.blocks.block_count();
        {
            let mut state = self.state.write();
            state.data.blocks = Arc::new(blocks);
            state.data.buffer.clear();
        }
        writer.wal = wal;
        writer.wal_broken = false;
        let old = std::mem::replace(&mut writer.wals, vec![wal_name]);
        for f in old {
            if let Err(e) = self.dir.unlink(&f) {
                warn!(table = %self.meta.name, file = %f, error = %e, "failed to remove old wal");
            }
        }

        info!(table = %self.meta.name, rows = n, blocks = written, "flushed write buffer");
        Ok(n)
    }

    // Removes files of a flush that did not make it into the manifest.
    fn discard(&self, blocks: RangeInclusive<BlockId>, wal: Option<&str>) {
        let files = blocks
            .map(|id| block_file_name(self.meta.id, id))
            .chain(wal.map(str::to_owned));
        for f in files {
            if let Err(e) = self.dir.unlink(&f) {
                warn!(table = %self.meta.name, file = %f, error = %e, "failed to remove file of failed flush");
            }
        }
    }

    // The visible rows of a snapshot taken now that pass the filters, before
    // offset and limit.
    pub(crate) fn rows(&self, bound: &BoundScan) -> BoxedIter {
        let data = self.state.read().data.clone();
        let merged = data.merged(&self.dir, &bound.range, bound.order);
        let latest: BoxedIter = match self.config.duplicate_policy {
            DuplicatePolicy::Overwrite => Box::new(LatestIter::new(merged, bound.order)),
            DuplicatePolicy::KeepAll => merged,
        };
        if bound.filters.is_empty() {
            latest
        } else {
            Box::new(FilterIter::new(latest, bound.filters.clone()))
        }
    }

    pub(crate) fn scan(&self, bound: &BoundScan) -> TableScan {
        debug!(
            table = %self.meta.name,
            start = bound.range.start,
            end = bound.range.end,
            offset = bound.offset,
            limit = ?bound.limit,
            "scan"
        );
        TableScan::new(self.meta.name.clone(), self.rows(bound), bound)
    }

    pub(crate) fn query_sma(&self, range: &TimeRange, column: &str) -> Option<Vec<BucketRecord>> {
        self.state
            .read()
            .sma
            .as_ref()
            .and_then(|sma| sma.query(range, column))
    }

    pub(crate) fn stats(&self) -> TableStats {
        let state = self.state.read();
        TableStats {
            buffered_rows: state.data.buffer.len(),
            blocks: state.data.blocks.block_count(),
            runs: state.data.blocks.run_count(),
            block_rows: state.data.blocks.row_count(),
            sma_buckets: state.sma.as_ref().map_or(0, SmaIndex::len),
        }
    }

    /// Retires the table: runs `commit`, which removes it from the manifest,
    /// and returns every file it owned. Inserts and flushes through handles
    /// taken earlier fail from then on.
    pub(crate) fn retire<F>(&self, commit: F) -> Result<Vec<String>>
    where
        F: FnOnce() -> Result<()>,
    {
        let mut writer = self.writer.lock();
        commit()?;
        writer.dropped = true;
        let state = self.state.read();
        Ok(state
            .data
            .blocks
            .blocks()
            .map(|b| b.file.clone())
            .chain(writer.wals.iter().cloned())
            .collect())
    }
}
