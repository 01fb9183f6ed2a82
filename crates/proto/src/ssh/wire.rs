//! SSH data type encoding (RFC 4251 Section 5).
//!
//! ```text
//! byte, boolean, uint32, uint64   fixed-size big-endian
//! string                          uint32 length + bytes
//! mpint                           uint32 length + two's complement, minimal
//! name-list                       string of comma-separated ASCII names
//! ```
//!
//! Writers append to a [`BytesMut`]; [`Reader`] walks a borrowed payload and
//! reports truncation as a protocol violation, so every message decoder gets
//! bounds checking for free.

use crate::ssh::error::{Error, Result};
use bytes::{BufMut, BytesMut};

/// Appends a `string` (length-prefixed byte sequence).
pub fn put_string(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

/// Appends a `boolean`.
pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

/// Appends a `name-list`.
pub fn put_name_list<S: AsRef<str>>(buf: &mut BytesMut, names: &[S]) {
    let joined = names
        .iter()
        .map(|n| n.as_ref())
        .collect::<Vec<_>>()
        .join(",");
    put_string(buf, joined.as_bytes());
}

/// Appends an unsigned big-endian integer as an `mpint`.
pub fn put_mpint(buf: &mut BytesMut, magnitude: &[u8]) {
    buf.put_slice(&encode_mpint(magnitude));
}

/// Encodes an unsigned big-endian integer as an `mpint`.
///
/// Leading zero bytes are stripped and a zero byte is prepended when the
/// high bit is set, so the value stays positive.
pub fn encode_mpint(magnitude: &[u8]) -> Vec<u8> {
    let start = magnitude
        .iter()
        .position(|&b| b != 0)
        .unwrap_or(magnitude.len());
    let trimmed = &magnitude[start..];

    if trimmed.is_empty() {
        return vec![0, 0, 0, 0];
    }

    let pad = trimmed[0] & 0x80 != 0;
    let len = trimmed.len() + usize::from(pad);
    let mut out = Vec::with_capacity(4 + len);
    out.extend_from_slice(&(len as u32).to_be_bytes());
    if pad {
        out.push(0);
    }
    out.extend_from_slice(trimmed);
    out
}

/// Cursor over an SSH-encoded payload.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Creates a reader positioned at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Returns `true` once every byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::protocol(format!(
                "truncated {}: need {} bytes, have {}",
                what,
                n,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Reads a `byte`.
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1, "byte")?[0])
    }

    /// Reads a `boolean`; any non-zero value is true.
    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a `uint32`.
    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4, "uint32")?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads `n` raw bytes.
    pub fn read_raw(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n, "raw bytes")
    }

    /// Reads a `string` as raw bytes.
    pub fn read_string(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.take(len, "string")
    }

    /// Reads a `string` that must be valid UTF-8.
    pub fn read_utf8(&mut self) -> Result<String> {
        let raw = self.read_string()?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| Error::protocol("string field is not valid UTF-8"))
    }

    /// Reads a `name-list`. An empty string yields an empty list.
    pub fn read_name_list(&mut self) -> Result<Vec<String>> {
        let raw = self.read_string()?;
        if raw.is_empty() {
            return Ok(Vec::new());
        }
        let text = std::str::from_utf8(raw)
            .map_err(|_| Error::protocol("name-list is not valid ASCII"))?;
        if !text.is_ascii() {
            return Err(Error::protocol("name-list is not valid ASCII"));
        }
        text.split(',')
            .map(|name| {
                if name.is_empty() {
                    Err(Error::protocol("name-list contains an empty name"))
                } else {
                    Ok(name.to_string())
                }
            })
            .collect()
    }

    /// Reads an `mpint` and returns its unsigned big-endian magnitude.
    ///
    /// Negative values never occur in the key exchange and are rejected.
    pub fn read_mpint(&mut self) -> Result<&'a [u8]> {
        let raw = self.read_string()?;
        if raw.first().map_or(false, |b| b & 0x80 != 0) {
            return Err(Error::protocol("negative mpint"));
        }
        let start = raw.iter().position(|&b| b != 0).unwrap_or(raw.len());
        Ok(&raw[start..])
    }

    /// Consumes and returns everything left.
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }

    /// Fails unless the payload has been fully consumed.
    pub fn finish(&self, what: &str) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::protocol(format!(
                "{} has {} trailing bytes",
                what,
                self.remaining()
            )))
        }
    }
}
