use anyhow::{bail, ensure};

use crate::{
    encoding::{Decode, KeyReader},
    memtable::Entry,
    types::RowKey,
};

use super::writer::{BlockFooter, TRAILER_LEN};

struct Reader<'a> {
    data: &'a [u8],
    idx: usize,
    buf: Vec<u8>,
    kr: KeyReader,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader {
            data,
            idx: 0,
            buf: Vec::with_capacity(1024),
            kr: KeyReader::new(),
        }
    }

    fn read_u32(&mut self) -> anyhow::Result<u32> {
        ensure!(self.idx + 4 <= self.data.len(), "truncated block entry header");
        let mut b = [0_u8; 4];
        b.copy_from_slice(&self.data[self.idx..self.idx + 4]);
        self.idx += 4;
        Ok(u32::from_le_bytes(b))
    }

    fn next<T: Decode>(&mut self) -> anyhow::Result<Option<T>> {
        if self.idx >= self.data.len() {
            return Ok(None);
        }
        let len = self.read_u32()? as usize;
        let prefix = self.read_u32()? as usize;
        ensure!(prefix <= self.buf.len(), "shared prefix longer than previous entry");
        ensure!(self.idx + len <= self.data.len(), "truncated block entry");

        self.buf.truncate(prefix);
        self.buf.extend(&self.data[self.idx..self.idx + len]);
        self.idx += len;

        self.kr.load(&self.buf);
        let v = T::decode(&mut self.kr)?;
        Ok(Some(v))
    }
}

pub fn read_footer(data: &[u8]) -> anyhow::Result<(BlockFooter, usize)> {
    if data.len() < TRAILER_LEN {
        bail!("block of {} bytes is too short", data.len());
    }
    let trailer = &data[data.len() - TRAILER_LEN..];
    let footer_len = u32::from_le_bytes(trailer[0..4].try_into()?) as usize;
    let data_len = u32::from_le_bytes(trailer[4..8].try_into()?) as usize;
    ensure!(
        data_len + footer_len + TRAILER_LEN == data.len(),
        "block trailer does not match block size"
    );

    let mut kr = KeyReader::new();
    kr.load(&data[data_len..data_len + footer_len]);
    let (min_key, (max_key, rows)) = <(RowKey, (RowKey, u32))>::decode(&mut kr)?;
    Ok((
        BlockFooter {
            min_key,
            max_key,
            rows,
        },
        data_len,
    ))
}

/// Decodes a whole block, checking it against its own footer.
pub fn decode_block(data: &[u8]) -> anyhow::Result<(BlockFooter, Vec<Entry>)> {
    let (footer, data_len) = read_footer(data)?;
    let mut reader = Reader::new(&data[..data_len]);
    let mut rows: Vec<Entry> = Vec::with_capacity(footer.rows as usize);
    while let Some(entry) = reader.next::<Entry>()? {
        if let Some(prev) = rows.last() {
            ensure!(prev.0 < entry.0, "block entries out of order");
        }
        rows.push(entry);
    }
    ensure!(
        rows.len() == footer.rows as usize,
        "block footer claims {} rows, found {}",
        footer.rows,
        rows.len()
    );
    match (rows.first(), rows.last()) {
        (Some(first), Some(last)) if first.0 == footer.min_key && last.0 == footer.max_key => {}
        _ => bail!("block key bounds do not match footer"),
    }
    Ok((footer, rows))
}
