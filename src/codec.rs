//! Binary encoding shared by replies, argument maps and remote signal payloads
//!
//! Integers are big-endian. A string is a `u32` byte length followed by UTF-8.
//! A map is a `u32` entry count followed by `(string key, tagged value)` pairs.

use serde_json::{Map, Number, Value};

use crate::action::VariantMap;
use crate::error::{BrokerError, Result};

/// Nesting limit for lists and maps inside a value, enforced on both sides.
/// Matches serde_json's recursion limit.
pub const MAX_DEPTH: usize = 128;

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_I64: u8 = 2;
const TAG_U64: u8 = 3;
const TAG_F64: u8 = 4;
const TAG_STRING: u8 = 5;
const TAG_LIST: u8 = 6;
const TAG_MAP: u8 = 7;

/// Append-only writer
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_str(&mut self, value: &str) {
        self.put_u32(value.len() as u32);
        self.buf.extend_from_slice(value.as_bytes());
    }

    pub fn put_map(&mut self, map: &VariantMap) -> Result<()> {
        self.put_u32(map.len() as u32);
        for (key, value) in map {
            self.put_str(key);
            self.put_value(value)?;
        }
        Ok(())
    }

    /// Fails for values nested deeper than the decoder accepts
    pub fn put_value(&mut self, value: &Value) -> Result<()> {
        self.put_value_at(value, 0)
    }

    fn put_value_at(&mut self, value: &Value, depth: usize) -> Result<()> {
        if depth > MAX_DEPTH {
            return Err(BrokerError::Codec("value nested too deeply".to_string()));
        }
        match value {
            Value::Null => self.put_u8(TAG_NULL),
            Value::Bool(b) => {
                self.put_u8(TAG_BOOL);
                self.put_u8(u8::from(*b));
            }
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    self.put_u8(TAG_I64);
                    self.buf.extend_from_slice(&i.to_be_bytes());
                } else if let Some(u) = n.as_u64() {
                    self.put_u8(TAG_U64);
                    self.buf.extend_from_slice(&u.to_be_bytes());
                } else {
                    self.put_u8(TAG_F64);
                    let f = n.as_f64().unwrap_or_default();
                    self.buf.extend_from_slice(&f.to_bits().to_be_bytes());
                }
            }
            Value::String(s) => {
                self.put_u8(TAG_STRING);
                self.put_str(s);
            }
            Value::Array(items) => {
                self.put_u8(TAG_LIST);
                self.put_u32(items.len() as u32);
                for item in items {
                    self.put_value_at(item, depth + 1)?;
                }
            }
            Value::Object(entries) => {
                self.put_u8(TAG_MAP);
                self.put_u32(entries.len() as u32);
                for (key, item) in entries {
                    self.put_str(key);
                    self.put_value_at(item, depth + 1)?;
                }
            }
        }
        Ok(())
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over an encoded buffer
#[derive(Debug)]
pub struct Decoder<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let remaining = self.bytes.len() - self.pos;
        if remaining < len {
            return Err(BrokerError::Codec(format!(
                "truncated input: needed {} bytes at offset {}, {} left",
                len, self.pos, remaining
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    pub fn get_str(&mut self) -> Result<String> {
        let len = self.get_u32()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| BrokerError::Codec(format!("invalid UTF-8 in string: {}", e)))
    }

    pub fn get_map(&mut self) -> Result<VariantMap> {
        let count = self.get_u32()?;
        let mut map = VariantMap::new();
        for _ in 0..count {
            let key = self.get_str()?;
            let value = self.get_value(0)?;
            map.insert(key, value);
        }
        Ok(map)
    }

    fn get_value(&mut self, depth: usize) -> Result<Value> {
        if depth > MAX_DEPTH {
            return Err(BrokerError::Codec("value nested too deeply".to_string()));
        }
        let tag = self.get_u8()?;
        let value = match tag {
            TAG_NULL => Value::Null,
            TAG_BOOL => Value::Bool(self.get_u8()? != 0),
            TAG_I64 => Value::from(i64::from_be_bytes(self.take_array()?)),
            TAG_U64 => Value::from(u64::from_be_bytes(self.take_array()?)),
            TAG_F64 => {
                let f = f64::from_bits(u64::from_be_bytes(self.take_array()?));
                let n = Number::from_f64(f).ok_or_else(|| {
                    BrokerError::Codec(format!("non-finite float {} is not representable", f))
                })?;
                Value::Number(n)
            }
            TAG_STRING => Value::String(self.get_str()?),
            TAG_LIST => {
                let count = self.get_u32()?;
                let mut items = Vec::new();
                for _ in 0..count {
                    items.push(self.get_value(depth + 1)?);
                }
                Value::Array(items)
            }
            TAG_MAP => {
                let count = self.get_u32()?;
                let mut entries = Map::new();
                for _ in 0..count {
                    let key = self.get_str()?;
                    entries.insert(key, self.get_value(depth + 1)?);
                }
                Value::Object(entries)
            }
            other => {
                return Err(BrokerError::Codec(format!("unknown value tag {}", other)));
            }
        };
        Ok(value)
    }

    /// Fails if any bytes were left unread
    pub fn finish(self) -> Result<()> {
        if self.pos != self.bytes.len() {
            return Err(BrokerError::Codec(format!(
                "{} trailing bytes after payload",
                self.bytes.len() - self.pos
            )));
        }
        Ok(())
    }
}

pub fn encode_map(map: &VariantMap) -> Result<Vec<u8>> {
    let mut enc = Encoder::new();
    enc.put_map(map)?;
    Ok(enc.finish())
}

pub fn decode_map(bytes: &[u8]) -> Result<VariantMap> {
    let mut dec = Decoder::new(bytes);
    let map = dec.get_map()?;
    dec.finish()?;
    Ok(map)
}
