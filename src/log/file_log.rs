use std::marker::PhantomData;

use anyhow::{bail, Context};

use crate::{
    encoding::{KeyReader, KeyWriter},
    fs::{DbDir, DbFile},
};

use super::LogEntry;

const LEN_PREFIX: usize = 4;

// Reads back every complete entry of a log. A trailing entry cut short by a
// crash mid-append is dropped; a complete entry that fails to decode is an
// error.
pub struct LogReader<E>
where
    E: LogEntry,
{
    data: Vec<u8>,
    idx: usize,
    reader: KeyReader,
    _marker: PhantomData<E>,
}

impl<E> LogReader<E>
where
    E: LogEntry,
{
    pub fn new<F: DbFile>(file: &F) -> anyhow::Result<Self> {
        Ok(Self {
            data: file.read_all()?,
            idx: 0,
            reader: KeyReader::new(),
            _marker: PhantomData,
        })
    }

    fn next_entry(&mut self) -> anyhow::Result<Option<E>> {
        if self.idx + LEN_PREFIX > self.data.len() {
            return Ok(None);
        }
        let mut buf = [0_u8; LEN_PREFIX];
        buf.copy_from_slice(&self.data[self.idx..self.idx + LEN_PREFIX]);
        let data_len = u32::from_le_bytes(buf) as usize;

        let start = self.idx + LEN_PREFIX;
        if start + data_len > self.data.len() {
            return Ok(None);
        }
        self.reader.load(&self.data[start..start + data_len]);
        let v = E::decode(&mut self.reader)?;
        if !self.reader.at_end() {
            bail!("log entry at offset {} has trailing bytes", self.idx);
        }
        self.idx = start + data_len;

        Ok(Some(v))
    }
}

impl<E> Iterator for LogReader<E>
where
    E: LogEntry,
{
    type Item = anyhow::Result<E>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

#[derive(Debug)]
pub struct Log<D, E>
where
    D: DbDir,
    E: LogEntry,
{
    file: D::DbFile,
    file_name: String,
    highest_seen_seqnum: u64,
    sync: bool,
    kw: KeyWriter,
    _marker: PhantomData<E>,
}

impl<D, E> Log<D, E>
where
    D: DbDir,
    E: LogEntry,
{
    pub fn create(dir: &D, file_name: String, lower_bound: u64, sync: bool) -> anyhow::Result<Self> {
        let mut file = match dir.create(&file_name)? {
            Some(f) => f,
            None => bail!("log {} already exists", file_name),
        };
        // Ensure the file is created.
        file.sync()?;
        Ok(Self {
            file,
            file_name,
            highest_seen_seqnum: lower_bound,
            sync,
            kw: KeyWriter::new(),
            _marker: PhantomData,
        })
    }

    // Appends a batch and makes it durable (when syncing is on) with a single
    // sync at the end.
    pub fn write_batch<'a, I>(&mut self, entries: I) -> anyhow::Result<()>
    where
        I: IntoIterator<Item = &'a E>,
        E: 'a,
    {
        let mut out = Vec::new();
        for e in entries {
            self.kw.clear();
            e.write_bytes(&mut self.kw);
            out.extend(&(self.kw.buf.len() as u32).to_le_bytes());
            out.extend(&self.kw.buf);
            self.highest_seen_seqnum = std::cmp::max(self.highest_seen_seqnum, e.seqnum());
        }
        self.file
            .write(&out)
            .with_context(|| format!("appending to {}", self.file_name))?;
        if self.sync {
            self.file
                .sync()
                .with_context(|| format!("syncing {}", self.file_name))?;
        }

        Ok(())
    }

    pub fn frontier(&self) -> u64 {
        self.highest_seen_seqnum + 1
    }
}
