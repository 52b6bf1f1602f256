//! Super tables, child tables and normal tables.
//!
//! A super table is a versioned schema template; child tables hold its id and
//! a snapshot of the schema version current when they were created, never a
//! pointer back. The catalog is a plain value: the engine clones it, applies
//! a change, persists the result and swaps it in.
//!
//! Child tables are also indexed by tag value, so a query over a super table
//! can pick its children without looking at every one of them.
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use serde::{Deserialize, Serialize};

use crate::{
    db::{CmpOp, Predicate},
    encoding::encode_to_vec,
    error::{Error, Result},
    sma::SmaConfig,
    types::{ColumnType, Value},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub ty: ColumnType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        ColumnDef {
            name: name.into(),
            ty,
        }
    }
}

/// Column layout of a table. The timestamp column is implicit in every row
/// and not part of `columns`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub version: u32,
    pub ts_column: String,
    pub columns: Vec<ColumnDef>,
}

impl Schema {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn is_ts_column(&self, name: &str) -> bool {
        self.ts_column == name
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuperTable {
    pub id: u64,
    pub name: String,
    pub schema: Arc<Schema>,
    pub tags: Vec<ColumnDef>,
    pub sma: Option<SmaConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TableKind {
    Child { super_id: u64, tags: Vec<Value> },
    Normal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMeta {
    pub id: u64,
    pub name: String,
    pub schema: Arc<Schema>,
    pub kind: TableKind,
    pub sma: Option<SmaConfig>,
}

impl TableMeta {
    pub fn super_id(&self) -> Option<u64> {
        match self.kind {
            TableKind::Child { super_id, .. } => Some(super_id),
            TableKind::Normal => None,
        }
    }

    /// Position of each SMA column in the row values, with its type.
    pub fn sma_columns(&self) -> Vec<(usize, ColumnType)> {
        let sma = match &self.sma {
            Some(sma) => sma,
            None => return Vec::new(),
        };
        sma.columns
            .iter()
            .filter_map(|name| {
                let idx = self.schema.column_index(name)?;
                Some((idx, self.schema.columns[idx].ty))
            })
            .collect()
    }
}

fn check_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return Err(Error::invalid(format!("invalid {} name {:?}", kind, name)));
    }
    Ok(())
}

fn check_columns<'a>(ts_column: &str, columns: impl Iterator<Item = &'a ColumnDef>) -> Result<()> {
    check_name("column", ts_column)?;
    let mut seen = vec![ts_column];
    for c in columns {
        check_name("column", &c.name)?;
        if seen.contains(&c.name.as_str()) {
            return Err(Error::invalid(format!("duplicate column {:?}", c.name)));
        }
        seen.push(&c.name);
    }
    Ok(())
}

fn check_sma(schema: &Schema, sma: &Option<SmaConfig>) -> Result<()> {
    let sma = match sma {
        Some(sma) => sma,
        None => return Ok(()),
    };
    if sma.bucket_width <= 0 {
        return Err(Error::invalid("sma bucket width must be positive"));
    }
    if sma.columns.is_empty() {
        return Err(Error::invalid("sma needs at least one column"));
    }
    for name in &sma.columns {
        match schema.column(name) {
            Some(c) if c.ty.is_numeric() => {}
            Some(_) => {
                return Err(Error::invalid(format!("sma column {:?} is not numeric", name)))
            }
            None => return Err(Error::invalid(format!("unknown sma column {:?}", name))),
        }
    }
    Ok(())
}

/// Selects child tables of a super table by their tags. `All` keeps the
/// children matching every predicate and `Any` those matching at least one.
/// An empty `All` selects every child.
#[derive(Debug, Clone, PartialEq)]
pub enum TagFilter {
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
}

impl Default for TagFilter {
    fn default() -> Self {
        TagFilter::All(Vec::new())
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Posting {
    value: Value,
    tables: BTreeSet<u64>,
}

type Terms = BTreeMap<Vec<u8>, Posting>;

// Union of the postings whose value passes `keep`.
fn select(terms: &Terms, keep: impl Fn(&Value) -> bool) -> BTreeSet<u64> {
    terms
        .values()
        .filter(|posting| keep(&posting.value))
        .flat_map(|posting| posting.tables.iter().copied())
        .collect()
}

// For each super table and tag position, the children holding each distinct
// tag value, keyed by the value's encoding. Derived from the tables, so it is
// rebuilt on load rather than persisted.
#[derive(Debug, Clone, Default, PartialEq)]
struct TagIndex {
    postings: BTreeMap<(u64, usize), Terms>,
    // Super table id to its children, by id.
    children: BTreeMap<u64, BTreeMap<u64, String>>,
}

impl TagIndex {
    fn put(&mut self, meta: &TableMeta) {
        if let TableKind::Child { super_id, tags } = &meta.kind {
            self.children
                .entry(*super_id)
                .or_default()
                .insert(meta.id, meta.name.clone());
            for (pos, v) in tags.iter().enumerate() {
                self.postings
                    .entry((*super_id, pos))
                    .or_default()
                    .entry(encode_to_vec(v))
                    .or_insert_with(|| Posting {
                        value: v.clone(),
                        tables: BTreeSet::new(),
                    })
                    .tables
                    .insert(meta.id);
            }
        }
    }

    fn remove(&mut self, meta: &TableMeta) {
        if let TableKind::Child { super_id, tags } = &meta.kind {
            if let Some(children) = self.children.get_mut(super_id) {
                children.remove(&meta.id);
                if children.is_empty() {
                    self.children.remove(super_id);
                }
            }
            for (pos, v) in tags.iter().enumerate() {
                let terms = match self.postings.get_mut(&(*super_id, pos)) {
                    Some(terms) => terms,
                    None => continue,
                };
                let key = encode_to_vec(v);
                if let Some(posting) = terms.get_mut(&key) {
                    posting.tables.remove(&meta.id);
                    if posting.tables.is_empty() {
                        terms.remove(&key);
                    }
                }
            }
        }
    }

    // Ids of the children of `super_id` whose tag at `pos`, of type `ty`,
    // satisfies `p`. Equality on an exactly typed value is a single lookup;
    // other predicates visit each distinct value of the tag once.
    fn search(&self, super_id: u64, pos: usize, ty: ColumnType, p: &Predicate) -> BTreeSet<u64> {
        let terms = match self.postings.get(&(super_id, pos)) {
            Some(terms) => terms,
            None => return BTreeSet::new(),
        };
        let lookup = |v: &Value| -> BTreeSet<u64> {
            terms
                .get(&encode_to_vec(v))
                .map(|posting| posting.tables.clone())
                .unwrap_or_default()
        };
        match p {
            Predicate::Compare {
                op: CmpOp::Eq,
                value,
                ..
            } if value.fits(ty) && ty != ColumnType::Double => lookup(value),
            Predicate::Compare { op, value, .. } => select(terms, |v: &Value| {
                v.compare(value).map_or(false, |ord| op.holds(ord))
            }),
            Predicate::IsNull(_) => lookup(&Value::Null),
            Predicate::IsNotNull(_) => select(terms, |v: &Value| !v.is_null()),
        }
    }

    fn children(&self, super_id: u64) -> BTreeSet<u64> {
        self.children
            .get(&super_id)
            .map(|c| c.keys().copied().collect())
            .unwrap_or_default()
    }

    fn name(&self, super_id: u64, id: u64) -> Option<&str> {
        self.children.get(&super_id)?.get(&id).map(String::as_str)
    }
}

#[derive(Debug, Deserialize)]
struct StoredCatalog {
    next_id: u64,
    super_tables: BTreeMap<String, SuperTable>,
    tables: BTreeMap<String, TableMeta>,
}

impl From<StoredCatalog> for Catalog {
    fn from(stored: StoredCatalog) -> Self {
        let mut tag_index = TagIndex::default();
        for meta in stored.tables.values() {
            tag_index.put(meta);
        }
        Catalog {
            next_id: stored.next_id,
            super_tables: stored.super_tables,
            tables: stored.tables,
            tag_index,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "StoredCatalog")]
pub struct Catalog {
    next_id: u64,
    super_tables: BTreeMap<String, SuperTable>,
    tables: BTreeMap<String, TableMeta>,
    #[serde(skip)]
    tag_index: TagIndex,
}

impl Catalog {
    pub fn new() -> Self {
        Catalog::default()
    }

    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_free(&self, name: &str) -> Result<()> {
        check_name("table", name)?;
        if self.super_tables.contains_key(name) || self.tables.contains_key(name) {
            return Err(Error::TableExists {
                name: name.to_owned(),
            });
        }
        Ok(())
    }

    pub fn create_super_table(
        &mut self,
        name: &str,
        ts_column: &str,
        columns: Vec<ColumnDef>,
        tags: Vec<ColumnDef>,
        sma: Option<SmaConfig>,
    ) -> Result<&SuperTable> {
        self.check_free(name)?;
        check_columns(ts_column, columns.iter().chain(tags.iter()))?;
        let schema = Schema {
            version: 1,
            ts_column: ts_column.to_owned(),
            columns,
        };
        check_sma(&schema, &sma)?;

        let id = self.allocate_id();
        let st = SuperTable {
            id,
            name: name.to_owned(),
            schema: Arc::new(schema),
            tags,
            sma,
        };
        Ok(self.super_tables.entry(name.to_owned()).or_insert(st))
    }

    /// Appends a column to a super table's template. Existing child tables
    /// keep the schema version they were created with.
    pub fn add_column(&mut self, super_table: &str, column: ColumnDef) -> Result<u32> {
        let st = self
            .super_tables
            .get_mut(super_table)
            .ok_or_else(|| Error::table_not_found(super_table))?;
        let mut schema = (*st.schema).clone();
        schema.columns.push(column);
        check_columns(&schema.ts_column, schema.columns.iter().chain(st.tags.iter()))?;
        schema.version += 1;
        let version = schema.version;
        st.schema = Arc::new(schema);
        Ok(version)
    }

    pub fn create_child_table(
        &mut self,
        name: &str,
        super_table: &str,
        tags: Vec<Value>,
    ) -> Result<&TableMeta> {
        self.check_free(name)?;
        let st = self
            .super_tables
            .get(super_table)
            .ok_or_else(|| Error::table_not_found(super_table))?;
        if tags.len() != st.tags.len() {
            return Err(Error::invalid(format!(
                "super table {} has {} tags, got {}",
                super_table,
                st.tags.len(),
                tags.len()
            )));
        }
        for (v, def) in tags.iter().zip(&st.tags) {
            if !v.fits(def.ty) {
                return Err(Error::invalid(format!(
                    "tag {} expects {:?}, got {}",
                    def.name, def.ty, v
                )));
            }
        }

        let meta = TableMeta {
            id: 0,
            name: name.to_owned(),
            schema: st.schema.clone(),
            kind: TableKind::Child {
                super_id: st.id,
                tags,
            },
            sma: st.sma.clone(),
        };
        self.insert_table(meta)
    }

    pub fn create_normal_table(
        &mut self,
        name: &str,
        ts_column: &str,
        columns: Vec<ColumnDef>,
        sma: Option<SmaConfig>,
    ) -> Result<&TableMeta> {
        self.check_free(name)?;
        check_columns(ts_column, columns.iter())?;
        let schema = Schema {
            version: 1,
            ts_column: ts_column.to_owned(),
            columns,
        };
        check_sma(&schema, &sma)?;
        self.insert_table(TableMeta {
            id: 0,
            name: name.to_owned(),
            schema: Arc::new(schema),
            kind: TableKind::Normal,
            sma,
        })
    }

    fn insert_table(&mut self, mut meta: TableMeta) -> Result<&TableMeta> {
        meta.id = self.allocate_id();
        self.tag_index.put(&meta);
        Ok(self.tables.entry(meta.name.clone()).or_insert(meta))
    }

    pub fn drop_table(&mut self, name: &str) -> Result<TableMeta> {
        let meta = self
            .tables
            .remove(name)
            .ok_or_else(|| Error::table_not_found(name))?;
        self.tag_index.remove(&meta);
        Ok(meta)
    }

    /// Only a super table without child tables can be dropped.
    pub fn drop_super_table(&mut self, name: &str) -> Result<SuperTable> {
        let id = self.super_table(name)?.id;
        if self.tables.values().any(|t| t.super_id() == Some(id)) {
            return Err(Error::invalid(format!(
                "super table {} still has child tables",
                name
            )));
        }
        self.super_tables
            .remove(name)
            .ok_or_else(|| Error::table_not_found(name))
    }

    pub fn table(&self, name: &str) -> Result<&TableMeta> {
        self.tables
            .get(name)
            .ok_or_else(|| Error::table_not_found(name))
    }

    pub fn super_table(&self, name: &str) -> Result<&SuperTable> {
        self.super_tables
            .get(name)
            .ok_or_else(|| Error::table_not_found(name))
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableMeta> {
        self.tables.values()
    }

    pub fn children<'a>(&'a self, super_table: &str) -> Result<impl Iterator<Item = &'a TableMeta>> {
        let id = self.super_table(super_table)?.id;
        Ok(self.tables.values().filter(move |t| t.super_id() == Some(id)))
    }

    /// Child tables of `super_table` selected by `filter`, in id order.
    pub fn child_tables_where(
        &self,
        super_table: &str,
        filter: &TagFilter,
    ) -> Result<Vec<&TableMeta>> {
        let st = self.super_table(super_table)?;
        let (predicates, all) = match filter {
            TagFilter::All(p) => (p, true),
            TagFilter::Any(p) => (p, false),
        };

        let mut selected: Option<BTreeSet<u64>> = None;
        for p in predicates {
            let pos = st
                .tags
                .iter()
                .position(|t| t.name == p.column())
                .ok_or_else(|| {
                    Error::invalid(format!("super table {} has no tag {:?}", st.name, p.column()))
                })?;
            let ty = st.tags[pos].ty;
            if let Predicate::Compare { value, .. } = p {
                if !value.comparable_with(ty) {
                    return Err(Error::invalid(format!(
                        "cannot compare tag {} of type {:?} with {}",
                        p.column(),
                        ty,
                        value
                    )));
                }
            }
            let ids = self.tag_index.search(st.id, pos, ty, p);
            selected = Some(match selected {
                None => ids,
                Some(acc) if all => acc.intersection(&ids).copied().collect(),
                Some(acc) => acc.union(&ids).copied().collect(),
            });
        }

        let ids = match selected {
            Some(ids) => ids,
            None if all => self.tag_index.children(st.id),
            None => BTreeSet::new(),
        };
        Ok(ids
            .iter()
            .filter_map(|id| self.tag_index.name(st.id, *id))
            .filter_map(|name| self.tables.get(name))
            .collect())
    }
}
