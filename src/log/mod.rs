use crate::{
    encoding::{Decode, Encode, KeyReader, KeyWriter},
    types::{RowKey, Value},
};

pub(crate) mod file_log;

pub use file_log::{Log, LogReader};

pub trait LogEntry: std::fmt::Debug + Clone + Encode + Decode {
    fn seqnum(&self) -> u64;
}

/// One accepted row, as written ahead of being applied to a write buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertEntry {
    pub key: RowKey,
    pub values: Vec<Value>,
}

impl Encode for InsertEntry {
    fn write_bytes(&self, kw: &mut KeyWriter) {
        (&self.key, &self.values).write_bytes(kw);
    }
}

impl Decode for InsertEntry {
    fn decode(kr: &mut KeyReader) -> anyhow::Result<Self> {
        let (key, values) = <(RowKey, Vec<Value>)>::decode(kr)?;
        Ok(InsertEntry { key, values })
    }
}

impl LogEntry for InsertEntry {
    fn seqnum(&self) -> u64 {
        self.key.seqnum
    }
}
