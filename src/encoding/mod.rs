// Fields are written escaped and each one is terminated by SEPARATOR, so a
// reader can split an encoded buffer back into fields without knowing their
// types up front. Integers are written big-endian (signed ones with the sign
// bit flipped) so that encoded keys sort like the values they encode, which
// also makes consecutive keys share long prefixes inside a block.
use anyhow::bail;

use crate::types::{RowKey, Value};

const SEPARATOR: [u8; 2] = [0x00, 0x01];
const ESCAPED_00: [u8; 2] = [0x00, 0xff];

fn copy_escaped(mut from: &[u8], to: &mut Vec<u8>) {
    while !from.is_empty() {
        match from.iter().position(|x| *x == 0x00) {
            Some(idx) => {
                to.extend(&from[..idx + 1]);
                to.push(0xff);
                from = &from[(idx + 1)..];
            }
            None => {
                to.extend(from);
                return;
            }
        }
    }
}

fn copy_unescaped(mut from: &[u8], to: &mut Vec<u8>) {
    while !from.is_empty() {
        match from.windows(2).position(|w| w == ESCAPED_00) {
            Some(idx) => {
                to.extend(&from[..idx + 1]);
                from = &from[(idx + 2)..];
            }
            None => {
                to.extend(from);
                from = &from[from.len()..];
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct KeyWriter {
    pub(crate) buf: Vec<u8>,
}

impl KeyWriter {
    pub fn new() -> Self {
        KeyWriter { buf: Vec::new() }
    }

    pub fn clear(&mut self) {
        self.buf.clear()
    }

    pub fn replace(&mut self, mut v: Vec<u8>) -> Vec<u8> {
        std::mem::swap(&mut v, &mut self.buf);
        v
    }

    fn field(&mut self, buf: &[u8]) {
        copy_escaped(buf, &mut self.buf);
        self.buf.extend(SEPARATOR);
    }
}

#[derive(Debug, Default)]
pub struct KeyReader {
    buf: Vec<u8>,
    from: usize,
    scratch: Vec<u8>,
}

impl KeyReader {
    pub fn new() -> Self {
        KeyReader::default()
    }

    pub fn load(&mut self, buf: &[u8]) {
        self.buf.clear();
        self.buf.extend(buf);
        self.from = 0;
        self.scratch.clear();
    }

    pub fn at_end(&self) -> bool {
        self.from >= self.buf.len()
    }

    pub fn next(&mut self) -> anyhow::Result<&[u8]> {
        if self.at_end() {
            bail!("unexpected end of encoded data");
        }
        let split_position = match self.buf[self.from..]
            .windows(2)
            .position(|x| x == SEPARATOR)
        {
            Some(p) => p,
            None => bail!("unterminated field at offset {}", self.from),
        };

        self.scratch.clear();
        copy_unescaped(
            &self.buf[self.from..self.from + split_position],
            &mut self.scratch,
        );
        self.from += split_position + 2;

        Ok(&self.scratch)
    }
}

pub trait Encode: std::fmt::Debug {
    fn write_bytes(&self, kw: &mut KeyWriter);
}

pub trait Decode: Sized {
    fn decode(kr: &mut KeyReader) -> anyhow::Result<Self>;
}

pub fn encode_to_vec<T: Encode>(t: &T) -> Vec<u8> {
    let mut kw = KeyWriter::new();
    t.write_bytes(&mut kw);
    kw.buf
}

pub fn decode_from_slice<T: Decode>(buf: &[u8]) -> anyhow::Result<T> {
    let mut kr = KeyReader::new();
    kr.load(buf);
    let t = T::decode(&mut kr)?;
    if !kr.at_end() {
        bail!("trailing bytes after decoded value");
    }
    Ok(t)
}

impl Encode for u8 {
    fn write_bytes(&self, kw: &mut KeyWriter) {
        kw.field(&[*self])
    }
}

impl Decode for u8 {
    fn decode(kr: &mut KeyReader) -> anyhow::Result<Self> {
        let next = kr.next()?;
        Ok(Self::from_be_bytes(next.try_into()?))
    }
}

impl Encode for u32 {
    fn write_bytes(&self, kw: &mut KeyWriter) {
        kw.field(&self.to_be_bytes())
    }
}

impl Decode for u32 {
    fn decode(kr: &mut KeyReader) -> anyhow::Result<Self> {
        Ok(Self::from_be_bytes(kr.next()?.try_into()?))
    }
}

impl Encode for u64 {
    fn write_bytes(&self, kw: &mut KeyWriter) {
        kw.field(&self.to_be_bytes())
    }
}

impl Decode for u64 {
    fn decode(kr: &mut KeyReader) -> anyhow::Result<Self> {
        Ok(Self::from_be_bytes(kr.next()?.try_into()?))
    }
}

const SIGN_BIT: u64 = 1 << 63;

impl Encode for i64 {
    fn write_bytes(&self, kw: &mut KeyWriter) {
        kw.field(&((*self as u64) ^ SIGN_BIT).to_be_bytes())
    }
}

impl Decode for i64 {
    fn decode(kr: &mut KeyReader) -> anyhow::Result<Self> {
        let raw = u64::from_be_bytes(kr.next()?.try_into()?);
        Ok((raw ^ SIGN_BIT) as i64)
    }
}

impl Encode for f64 {
    fn write_bytes(&self, kw: &mut KeyWriter) {
        kw.field(&self.to_bits().to_be_bytes())
    }
}

impl Decode for f64 {
    fn decode(kr: &mut KeyReader) -> anyhow::Result<Self> {
        Ok(f64::from_bits(u64::from_be_bytes(kr.next()?.try_into()?)))
    }
}

impl Encode for bool {
    fn write_bytes(&self, kw: &mut KeyWriter) {
        kw.field(&[*self as u8])
    }
}

impl Decode for bool {
    fn decode(kr: &mut KeyReader) -> anyhow::Result<Self> {
        match kr.next()? {
            [0] => Ok(false),
            [1] => Ok(true),
            other => bail!("invalid bool encoding {:?}", other),
        }
    }
}

impl Encode for String {
    fn write_bytes(&self, kw: &mut KeyWriter) {
        kw.field(self.as_bytes())
    }
}

impl Decode for String {
    fn decode(kr: &mut KeyReader) -> anyhow::Result<Self> {
        let result = String::from_utf8(kr.next()?.to_vec())?;
        Ok(result)
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn write_bytes(&self, kw: &mut KeyWriter) {
        (self.len() as u32).write_bytes(kw);
        for v in self {
            v.write_bytes(kw);
        }
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(kr: &mut KeyReader) -> anyhow::Result<Self> {
        let len = u32::decode(kr)?;
        (0..len).map(|_| T::decode(kr)).collect()
    }
}

impl<A> Encode for &A
where
    A: Encode,
{
    fn write_bytes(&self, kw: &mut KeyWriter) {
        (*self).write_bytes(kw)
    }
}

impl<A, B> Encode for (A, B)
where
    A: Encode,
    B: Encode,
{
    fn write_bytes(&self, kw: &mut KeyWriter) {
        self.0.write_bytes(kw);
        self.1.write_bytes(kw);
    }
}

impl<A, B> Decode for (A, B)
where
    A: Decode,
    B: Decode,
{
    fn decode(kr: &mut KeyReader) -> anyhow::Result<Self> {
        let a = A::decode(kr)?;
        let b = B::decode(kr)?;
        Ok((a, b))
    }
}

impl Encode for RowKey {
    fn write_bytes(&self, kw: &mut KeyWriter) {
        self.ts.write_bytes(kw);
        self.seqnum.write_bytes(kw);
    }
}

impl Decode for RowKey {
    fn decode(kr: &mut KeyReader) -> anyhow::Result<Self> {
        let (ts, seqnum) = <(i64, u64)>::decode(kr)?;
        Ok(RowKey { ts, seqnum })
    }
}

impl Encode for Value {
    fn write_bytes(&self, kw: &mut KeyWriter) {
        match self {
            Value::Null => 0_u8.write_bytes(kw),
            Value::Bool(v) => (1_u8, v).write_bytes(kw),
            Value::Int(v) => (2_u8, v).write_bytes(kw),
            Value::Double(v) => (3_u8, v).write_bytes(kw),
            Value::Text(v) => (4_u8, v).write_bytes(kw),
        }
    }
}

impl Decode for Value {
    fn decode(kr: &mut KeyReader) -> anyhow::Result<Self> {
        Ok(match u8::decode(kr)? {
            0 => Value::Null,
            1 => Value::Bool(bool::decode(kr)?),
            2 => Value::Int(i64::decode(kr)?),
            3 => Value::Double(f64::decode(kr)?),
            4 => Value::Text(String::decode(kr)?),
            tag => bail!("invalid value tag {}", tag),
        })
    }
}
