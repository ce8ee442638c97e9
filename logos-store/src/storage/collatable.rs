//! Order-preserving composite key encoding.
//!
//! Encoded values compare bytewise in the same order as the values they
//! represent, so composite keys such as `[timestamp, doc_id]` can be range
//! scanned directly in RocksDB.
//!
//! ```text
//! tag  0x00  end of array / map
//! tag  0x01  null
//! tag  0x02  false            0x03  true
//! tag  0x04  integer          8 bytes BE, sign bit flipped
//! tag  0x05  double           8 bytes BE, IEEE 754 order-adjusted
//! tag  0x06  string / bytes   0x00 escaped as 0x00 0xFF, ends with 0x00 0x01
//! tag  0x07  array            elements..., 0x00
//! tag  0x08  map              key, value..., 0x00
//! ```
//!
//! Integers always sort before doubles; mixing the two in one key position
//! is not supported.

use crate::error::{Result, StoreError};

const TAG_END: u8 = 0x00;
const TAG_NULL: u8 = 0x01;
const TAG_FALSE: u8 = 0x02;
const TAG_TRUE: u8 = 0x03;
const TAG_INTEGER: u8 = 0x04;
const TAG_DOUBLE: u8 = 0x05;
const TAG_STRING: u8 = 0x06;
const TAG_ARRAY: u8 = 0x07;
const TAG_MAP: u8 = 0x08;

const ESCAPE: u8 = 0x00;
const ESCAPED_ZERO: u8 = 0xFF;
const STRING_END: u8 = 0x01;

const SIGN_BIT: u64 = 1u64 << 63;

/// Tag of the next value in an encoded key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollatableTag {
    End,
    Null,
    Bool,
    Integer,
    Double,
    String,
    Array,
    Map,
}

/// Builds an encoded key value by value.
#[derive(Debug, Clone, Default)]
pub struct CollatableBuilder {
    buf: Vec<u8>,
}

impl CollatableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_null(&mut self) -> &mut Self {
        self.buf.push(TAG_NULL);
        self
    }

    pub fn add_bool(&mut self, b: bool) -> &mut Self {
        self.buf.push(if b { TAG_TRUE } else { TAG_FALSE });
        self
    }

    pub fn add_int(&mut self, i: i64) -> &mut Self {
        self.buf.push(TAG_INTEGER);
        self.buf.extend_from_slice(&((i as u64) ^ SIGN_BIT).to_be_bytes());
        self
    }

    pub fn add_double(&mut self, f: f64) -> &mut Self {
        let bits = f.to_bits();
        let ordered = if bits & SIGN_BIT != 0 { !bits } else { bits | SIGN_BIT };
        self.buf.push(TAG_DOUBLE);
        self.buf.extend_from_slice(&ordered.to_be_bytes());
        self
    }

    pub fn add_string(&mut self, s: &str) -> &mut Self {
        self.add_bytes(s.as_bytes())
    }

    /// Arbitrary bytes share the string encoding.
    pub fn add_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.reserve(bytes.len() + 3);
        self.buf.push(TAG_STRING);
        for &b in bytes {
            if b == ESCAPE {
                self.buf.extend_from_slice(&[ESCAPE, ESCAPED_ZERO]);
            } else {
                self.buf.push(b);
            }
        }
        self.buf.extend_from_slice(&[ESCAPE, STRING_END]);
        self
    }

    pub fn begin_array(&mut self) -> &mut Self {
        self.buf.push(TAG_ARRAY);
        self
    }

    pub fn end_array(&mut self) -> &mut Self {
        self.buf.push(TAG_END);
        self
    }

    pub fn begin_map(&mut self) -> &mut Self {
        self.buf.push(TAG_MAP);
        self
    }

    pub fn end_map(&mut self) -> &mut Self {
        self.buf.push(TAG_END);
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Reads values back out of an encoded key, front to back.
#[derive(Debug, Clone)]
pub struct CollatableReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> CollatableReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn peek_tag(&self) -> Option<CollatableTag> {
        let tag = match *self.data.get(self.pos)? {
            TAG_END => CollatableTag::End,
            TAG_NULL => CollatableTag::Null,
            TAG_FALSE | TAG_TRUE => CollatableTag::Bool,
            TAG_INTEGER => CollatableTag::Integer,
            TAG_DOUBLE => CollatableTag::Double,
            TAG_STRING => CollatableTag::String,
            TAG_ARRAY => CollatableTag::Array,
            TAG_MAP => CollatableTag::Map,
            _ => return None,
        };
        Some(tag)
    }

    pub fn begin_array(&mut self) -> Result<()> {
        self.expect_tag(TAG_ARRAY, "array")
    }

    pub fn end_array(&mut self) -> Result<()> {
        self.expect_tag(TAG_END, "end of array")
    }

    pub fn begin_map(&mut self) -> Result<()> {
        self.expect_tag(TAG_MAP, "map")
    }

    pub fn end_map(&mut self) -> Result<()> {
        self.expect_tag(TAG_END, "end of map")
    }

    pub fn read_null(&mut self) -> Result<()> {
        self.expect_tag(TAG_NULL, "null")
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.take(1)?[0] {
            TAG_FALSE => Ok(false),
            TAG_TRUE => Ok(true),
            other => Err(unexpected("boolean", other)),
        }
    }

    pub fn read_int(&mut self) -> Result<i64> {
        self.expect_tag(TAG_INTEGER, "integer")?;
        let raw = self.read_u64()?;
        Ok((raw ^ SIGN_BIT) as i64)
    }

    pub fn read_double(&mut self) -> Result<f64> {
        self.expect_tag(TAG_DOUBLE, "double")?;
        let ordered = self.read_u64()?;
        let bits = if ordered & SIGN_BIT != 0 { ordered & !SIGN_BIT } else { !ordered };
        Ok(f64::from_bits(bits))
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        self.expect_tag(TAG_STRING, "string")?;
        let mut out = Vec::new();
        loop {
            let b = self.take(1)?[0];
            if b != ESCAPE {
                out.push(b);
                continue;
            }
            match self.take(1)?[0] {
                ESCAPED_ZERO => out.push(0),
                STRING_END => return Ok(out),
                other => return Err(unexpected("string escape", other)),
            }
        }
    }

    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|e| StoreError::corrupt("collatable string", e))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(buf))
    }

    fn expect_tag(&mut self, tag: u8, what: &str) -> Result<()> {
        let got = self.take(1)?[0];
        if got == tag {
            Ok(())
        } else {
            Err(unexpected(what, got))
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        if end > self.data.len() {
            return Err(StoreError::corrupt("collatable key", "truncated data"));
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }
}

fn unexpected(what: &str, tag: u8) -> StoreError {
    StoreError::corrupt("collatable key", format!("expected {what}, found tag 0x{tag:02x}"))
}
