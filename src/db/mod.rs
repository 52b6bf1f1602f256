use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    catalog::{Catalog, ColumnDef, TableMeta, TagFilter},
    config::EngineConfig,
    error::{Error, Result},
    fs::DbDir,
    root::{Root, ROOT_TMP},
    sma::{BucketRecord, SmaConfig},
    types::{Row, TimeRange, Value},
};

pub use self::{
    scan::{CmpOp, FilterIter, LatestIter, Predicate, ScanRequest, TableScan},
    super_scan::{ChildRow, SuperTableScan},
    tablet::TableStats,
};

use self::tablet::{Tablet, TabletManifest};

mod scan;
mod super_scan;
mod tablet;

#[cfg(test)]
mod engine_test;

// Errors that are not about any one table are reported against this name.
const ALL_TABLES: &str = "*";

/// Everything needed to find the database's data after a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct Manifest {
    pub(crate) catalog: Catalog,
    pub(crate) tablets: BTreeMap<u64, TabletManifest>,
}

/// A time-series storage engine over one directory.
///
/// Lock order: `catalog`, then `tablets`, then a table's writer, then `root`.
#[derive(Debug)]
pub struct Engine<D: DbDir> {
    dir: D,
    config: EngineConfig,
    root: Mutex<Root<Manifest, D>>,
    // Also serialises DDL: every catalog change holds the write lock.
    catalog: RwLock<Arc<Catalog>>,
    tablets: RwLock<HashMap<String, Arc<Tablet<D>>>>,
}

impl<D: DbDir> Engine<D> {
    /// Opens the database in `dir`, creating it if empty. Unflushed rows are
    /// recovered from the WALs, and files left behind by an interrupted flush
    /// or drop are removed.
    pub fn open(dir: D, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let io = |e: anyhow::Error| Error::disk_io(ALL_TABLES, "open", e);

        let mut root: Root<Manifest, D> = Root::load(dir.clone()).map_err(io)?;
        let manifest = root.data().clone();
        remove_orphans(&dir, &manifest).map_err(io)?;

        let mut tablets = HashMap::new();
        let mut next = manifest.clone();
        for meta in manifest.catalog.tables() {
            let (tablet, tm) = match manifest.tablets.get(&meta.id) {
                Some(tm) => Tablet::recover(meta.clone(), &dir, &config, tm)?,
                None => Tablet::create(meta.clone(), &dir, &config)?,
            };
            next.tablets.insert(meta.id, tm);
            tablets.insert(meta.name.clone(), Arc::new(tablet));
        }
        // Recovery started a new WAL for every table.
        if next != manifest {
            root.write(next).map_err(io)?;
        }
        info!(tables = tablets.len(), "opened database");

        Ok(Engine {
            dir,
            config,
            root: Mutex::new(root),
            catalog: RwLock::new(Arc::new(manifest.catalog)),
            tablets: RwLock::new(tablets),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalog(&self) -> Arc<Catalog> {
        self.catalog.read().clone()
    }

    fn tablet(&self, table: &str) -> Result<Arc<Tablet<D>>> {
        self.tablets
            .read()
            .get(table)
            .cloned()
            .ok_or_else(|| Error::table_not_found(table))
    }

    // Persists `next` as the catalog, alongside any storage changes made by
    // `f`, and makes it current.
    fn commit_catalog<F>(&self, current: &mut Arc<Catalog>, next: Catalog, f: F) -> Result<()>
    where
        F: FnOnce(&mut Manifest),
    {
        let persisted = next.clone();
        self.root
            .lock()
            .transform(|mut m| {
                m.catalog = persisted;
                f(&mut m);
                m
            })
            .map_err(|e| Error::disk_io(ALL_TABLES, "update_catalog", e))?;
        *current = Arc::new(next);
        Ok(())
    }

    pub fn create_super_table(
        &self,
        name: &str,
        ts_column: &str,
        columns: Vec<ColumnDef>,
        tags: Vec<ColumnDef>,
        sma: Option<SmaConfig>,
    ) -> Result<()> {
        let mut catalog = self.catalog.write();
        let mut next = (**catalog).clone();
        next.create_super_table(name, ts_column, columns, tags, sma)?;
        self.commit_catalog(&mut catalog, next, |_| {})?;
        info!(super_table = name, "created super table");
        Ok(())
    }

    /// Adds a column to a super table. Returns the new schema version, which
    /// only child tables created from now on use.
    pub fn add_column(&self, super_table: &str, column: ColumnDef) -> Result<u32> {
        let mut catalog = self.catalog.write();
        let mut next = (**catalog).clone();
        let version = next.add_column(super_table, column)?;
        self.commit_catalog(&mut catalog, next, |_| {})?;
        info!(super_table, version, "added column");
        Ok(version)
    }

    pub fn drop_super_table(&self, name: &str) -> Result<()> {
        let mut catalog = self.catalog.write();
        let mut next = (**catalog).clone();
        next.drop_super_table(name)?;
        self.commit_catalog(&mut catalog, next, |_| {})?;
        info!(super_table = name, "dropped super table");
        Ok(())
    }

    pub fn create_child_table(&self, name: &str, super_table: &str, tags: Vec<Value>) -> Result<()> {
        let mut catalog = self.catalog.write();
        let mut next = (**catalog).clone();
        let meta = next.create_child_table(name, super_table, tags)?.clone();
        self.install_table(&mut catalog, next, meta)
    }

    pub fn create_normal_table(
        &self,
        name: &str,
        ts_column: &str,
        columns: Vec<ColumnDef>,
        sma: Option<SmaConfig>,
    ) -> Result<()> {
        let mut catalog = self.catalog.write();
        let mut next = (**catalog).clone();
        let meta = next
            .create_normal_table(name, ts_column, columns, sma)?
            .clone();
        self.install_table(&mut catalog, next, meta)
    }

    fn install_table(&self, current: &mut Arc<Catalog>, next: Catalog, meta: TableMeta) -> Result<()> {
        let mut tablets = self.tablets.write();
        let (tablet, tm) = Tablet::create(meta.clone(), &self.dir, &self.config)?;
        let wals = tm.wals.clone();
        if let Err(e) = self.commit_catalog(current, next, |m| {
            m.tablets.insert(meta.id, tm);
        }) {
            for f in wals {
                if let Err(e) = self.dir.unlink(&f) {
                    warn!(table = %meta.name, file = %f, error = %e, "failed to remove wal");
                }
            }
            return Err(e);
        }
        tablets.insert(meta.name.clone(), Arc::new(tablet));
        info!(table = %meta.name, id = meta.id, super_id = ?meta.super_id(), "created table");
        Ok(())
    }

    /// Drops a table and deletes its data.
    pub fn drop_table(&self, name: &str) -> Result<()> {
        let mut catalog = self.catalog.write();
        let mut next = (**catalog).clone();
        let meta = next.drop_table(name)?;
        let mut tablets = self.tablets.write();
        let commit = || {
            self.commit_catalog(&mut catalog, next, |m| {
                m.tablets.remove(&meta.id);
            })
        };
        let files = match tablets.get(name) {
            Some(tablet) => tablet.retire(commit)?,
            None => {
                commit()?;
                Vec::new()
            }
        };
        tablets.remove(name);

        for f in &files {
            if let Err(e) = self.dir.unlink(f) {
                warn!(table = name, file = %f, error = %e, "failed to remove file of dropped table");
            }
        }
        info!(table = name, files = files.len(), "dropped table");
        Ok(())
    }

    /// Inserts `rows` as one batch; either every row is accepted or none is.
    /// Returns the number of rows inserted.
    pub fn insert(&self, table: &str, rows: Vec<Row>) -> Result<usize> {
        self.tablet(table)?.insert(rows, &self.root)
    }

    /// Flushes a table's write buffer into blocks. Returns the number of rows
    /// written.
    pub fn flush(&self, table: &str) -> Result<usize> {
        self.tablet(table)?.flush(&self.root)
    }

    pub fn flush_all(&self) -> Result<()> {
        let tablets: Vec<_> = self.tablets.read().values().cloned().collect();
        for tablet in tablets {
            tablet.flush(&self.root)?;
        }
        Ok(())
    }

    /// Starts a scan of `table`. The scan reads the table as it is now;
    /// later inserts and flushes do not affect it.
    pub fn scan(&self, table: &str, req: &ScanRequest) -> Result<TableScan> {
        let tablet = self.tablet(table)?;
        let bound = req.bind(&tablet.meta.schema)?;
        Ok(tablet.scan(&bound))
    }

    pub fn scan_collect(&self, table: &str, req: &ScanRequest) -> Result<Vec<Row>> {
        self.scan(table, req)?.collect()
    }

    /// Starts a scan of the child tables of `super_table` that `tags`
    /// selects, read as one table: rows are ordered by timestamp, then by
    /// child table id, and offset and limit count rows of the merged stream.
    /// Columns, predicates and projection refer to the super table's current
    /// schema.
    pub fn scan_super_table(
        &self,
        super_table: &str,
        tags: &TagFilter,
        req: &ScanRequest,
    ) -> Result<SuperTableScan> {
        let catalog = self.catalog();
        let schema = catalog.super_table(super_table)?.schema.clone();
        let bound = req.bind(&schema)?;
        let children = catalog.child_tables_where(super_table, tags)?;

        let tablets = self.tablets.read();
        let sources: Vec<_> = children
            .iter()
            .filter_map(|meta| {
                let tablet = tablets.get(&meta.name)?;
                Some((meta.name.clone(), tablet.rows(&bound)))
            })
            .collect();
        debug!(super_table, children = sources.len(), "super table scan");
        Ok(SuperTableScan::new(
            super_table.to_owned(),
            sources,
            &bound,
            schema.columns.len(),
        ))
    }

    /// SMA buckets of `column` overlapping `range`, ascending. `None` when
    /// the column has no SMA and the caller has to scan instead.
    pub fn query_sma(
        &self,
        table: &str,
        range: &TimeRange,
        column: &str,
    ) -> Result<Option<Vec<BucketRecord>>> {
        if !range.is_valid() {
            return Err(Error::invalid(format!(
                "time range starts at {} after its end {}",
                range.start, range.end
            )));
        }
        let result = self.tablet(table)?.query_sma(range, column);
        debug!(table, column, buckets = ?result.as_ref().map(Vec::len), "sma query");
        Ok(result)
    }

    pub fn table_stats(&self, table: &str) -> Result<TableStats> {
        Ok(self.tablet(table)?.stats())
    }
}

fn is_data_file(name: &str) -> bool {
    name.starts_with("blk-") || name.starts_with("wal-") || name == ROOT_TMP
}

// Deletes data files the manifest does not mention: blocks and WALs of a
// flush or table creation that never committed, and of dropped tables.
fn remove_orphans<D: DbDir>(dir: &D, manifest: &Manifest) -> anyhow::Result<()> {
    let live: HashSet<&str> = manifest
        .tablets
        .values()
        .flat_map(|tm| tm.files())
        .collect();
    for name in dir.ls()? {
        if is_data_file(&name) && !live.contains(name.as_str()) {
            debug!(file = %name, "removing orphaned file");
            dir.unlink(&name)?;
        }
    }
    Ok(())
}
