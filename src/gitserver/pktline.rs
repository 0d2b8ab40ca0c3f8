//! Packet-line framing
//!
//! Every line is prefixed by its total length as four hex digits; `0000`
//! is a flush packet.

use crate::error::{PorchError, Result};

pub const FLUSH: &[u8] = b"0000";

const MAX_LEN: usize = 65520;

/// Append `data` as one packet line
pub fn write(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(format!("{:04x}", data.len() + 4).as_bytes());
    out.extend_from_slice(data);
}

/// Append a text line, newline-terminated
pub fn write_line(out: &mut Vec<u8>, line: &str) {
    let mut data = Vec::with_capacity(line.len() + 1);
    data.extend_from_slice(line.as_bytes());
    data.push(b'\n');
    write(out, &data);
}

pub fn flush(out: &mut Vec<u8>) {
    out.extend_from_slice(FLUSH);
}

/// One decoded packet
#[derive(Debug, PartialEq, Eq)]
pub enum Packet<'a> {
    Flush,
    Data(&'a [u8]),
}

/// Iterates packets of a request body, leaving the unframed tail (a
/// packfile) in [`Reader::rest`]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Next packet, or `None` at end of input
    pub fn next_packet(&mut self) -> Result<Option<Packet<'a>>> {
        let remaining = &self.buf[self.pos..];
        if remaining.is_empty() {
            return Ok(None);
        }
        let header = remaining
            .get(..4)
            .ok_or_else(|| malformed("truncated length header"))?;
        let header = std::str::from_utf8(header).map_err(|_| malformed("non-hex length header"))?;
        let len = usize::from_str_radix(header, 16).map_err(|_| malformed("non-hex length header"))?;
        if len == 0 {
            self.pos += 4;
            return Ok(Some(Packet::Flush));
        }
        if !(4..=MAX_LEN).contains(&len) || len > remaining.len() {
            return Err(malformed(&format!("bad packet length {len}")));
        }
        self.pos += len;
        Ok(Some(Packet::Data(&remaining[4..len])))
    }

    /// Bytes following the last packet read
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

/// Strip one trailing newline
pub fn trim(data: &[u8]) -> &[u8] {
    data.strip_suffix(b"\n").unwrap_or(data)
}

fn malformed(reason: &str) -> PorchError {
    PorchError::GitOperationFailed {
        message: format!("malformed packet line: {reason}"),
    }
}
