use std::io::{Cursor, Write};

use crate::{
    encoding::{Encode, KeyWriter},
    memtable::Entry,
    types::RowKey,
};

pub(crate) const TRAILER_LEN: usize = 8;

// Writes each value as (suffix length, shared prefix length, suffix), sharing
// a prefix with the value written before it.
pub(crate) struct Writer<W>
where
    W: Write,
{
    w: W,
    kw: KeyWriter,
    prev_val: Vec<u8>,
}

impl<W> Writer<W>
where
    W: Write,
{
    pub(crate) fn new(w: W) -> Self {
        Writer {
            w,
            kw: KeyWriter::new(),
            prev_val: Vec::with_capacity(1024),
        }
    }

    pub(crate) fn write<T: Encode>(&mut self, t: &T) -> anyhow::Result<usize> {
        self.kw.clear();
        t.write_bytes(&mut self.kw);
        let mut buf = self.kw.replace(Vec::new());

        let shared_prefix_len = buf
            .iter()
            .zip(self.prev_val.iter())
            .take_while(|(a, b)| a == b)
            .count();

        self.w
            .write_all(&((buf.len() - shared_prefix_len) as u32).to_le_bytes())?;
        self.w
            .write_all(&(shared_prefix_len as u32).to_le_bytes())?;
        self.w.write_all(&buf[shared_prefix_len..])?;

        std::mem::swap(&mut buf, &mut self.prev_val);
        buf.clear();
        self.kw.replace(buf);

        Ok(8 + self.prev_val.len() - shared_prefix_len)
    }
}

/// Summary written after a block's entries and mirrored in the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockFooter {
    pub min_key: RowKey,
    pub max_key: RowKey,
    pub rows: u32,
}

// Layout: entries | footer | footer length (u32 LE) | entries length (u32 LE).
// `rows` must be non-empty and ascending by key.
pub fn encode_block(rows: &[Entry]) -> anyhow::Result<(BlockFooter, Vec<u8>)> {
    let (min_key, max_key) = match (rows.first(), rows.last()) {
        (Some(first), Some(last)) => (first.0, last.0),
        _ => anyhow::bail!("will only write non-empty blocks"),
    };

    let mut data = Vec::new();
    let mut data_len = 0;
    {
        let mut writer = Writer::new(Cursor::new(&mut data));
        for (k, v) in rows {
            data_len += writer.write(&(k, v))?;
        }
    }

    let footer = BlockFooter {
        min_key,
        max_key,
        rows: rows.len() as u32,
    };
    let mut kw = KeyWriter::new();
    (footer.min_key, (footer.max_key, footer.rows)).write_bytes(&mut kw);
    data.extend(&kw.buf);
    data.extend(&(kw.buf.len() as u32).to_le_bytes());
    data.extend(&(data_len as u32).to_le_bytes());

    Ok((footer, data))
}
