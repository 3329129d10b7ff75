//! RESP (Redis Serialization Protocol) framing
//!
//! Used for both Sentinel queries and store commands. Only RESP2 types are
//! understood, which is what Sentinel and Redis speak unless `HELLO 3` is sent.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::str;

/// Largest bulk string accepted from a peer
const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Deepest array nesting accepted from a peer; Sentinel and store replies
/// never go past two levels
const MAX_DEPTH: usize = 32;

/// RESP data types
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// Simple String (+OK\r\n)
    SimpleString(String),
    /// Error (-ERR message\r\n)
    Error(String),
    /// Integer (:123\r\n)
    Integer(i64),
    /// Bulk String ($5\r\nhello\r\n)
    BulkString(Option<Bytes>), // None represents NULL
    /// Array (*2\r\n$5\r\nhello\r\n$5\r\nworld\r\n)
    Array(Option<Vec<RespValue>>), // None represents NULL array
}

impl RespValue {
    /// Text content of a simple or bulk string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RespValue::SimpleString(s) => Some(s),
            RespValue::BulkString(Some(b)) => str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Raw content of a bulk or simple string
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::SimpleString(s) => Some(s.as_bytes()),
            RespValue::BulkString(Some(b)) => Some(b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<RespValue>> {
        match self {
            RespValue::Array(Some(items)) => Some(items),
            _ => None,
        }
    }

    /// NULL bulk string or NULL array
    pub fn is_null(&self) -> bool {
        matches!(self, RespValue::BulkString(None) | RespValue::Array(None))
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, RespValue::SimpleString(s) if s == "OK")
    }
}

/// RESP parser for reading Redis protocol messages.
///
/// A parser instance remembers how far it has validated the frame at the
/// front of the buffer, so feeding a large reply in many reads costs linear
/// time. Use one instance per stream and [`RespParser::parse`] for one-off
/// buffers.
#[derive(Debug, Default)]
pub struct RespParser {
    /// Offset just past the last complete element of the pending frame
    scanned: usize,
    /// Elements still missing from each array opened so far, outermost first
    open: Vec<usize>,
}

/// RESP encoder for writing Redis protocol messages
pub struct RespEncoder;

/// Parse error types
#[derive(Debug, thiserror::Error)]
pub enum RespParseError {
    #[error("Invalid RESP format: {0}")]
    InvalidFormat(String),
    #[error("Invalid UTF-8: {0}")]
    InvalidUtf8(#[from] str::Utf8Error),
    #[error("Invalid integer: {0}")]
    InvalidInteger(String),
}

impl RespParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one RESP value from the front of `buf` with a fresh parser.
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold a complete value; in
    /// that case nothing is consumed.
    pub fn parse(buf: &mut BytesMut) -> Result<Option<RespValue>, RespParseError> {
        Self::new().decode(buf)
    }

    /// Parse the next value from `buf`, resuming the scan of an earlier call.
    ///
    /// Nothing is consumed until a whole value is available. After an error
    /// the stream is out of sync and the parser must not be reused.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RespValue>, RespParseError> {
        let Some(end) = self.scan(buf)? else {
            return Ok(None);
        };
        self.scanned = 0;

        let decoded = Self::decode_at(&buf[..end], 0)?;
        buf.advance(end);
        match decoded {
            Some((value, _)) => Ok(Some(value)),
            None => Err(RespParseError::InvalidFormat(
                "frame ended early".to_string(),
            )),
        }
    }

    /// Validate framing iteratively up to the end of the first complete
    /// value. Nesting deeper than [`MAX_DEPTH`] is rejected.
    fn scan(&mut self, data: &[u8]) -> Result<Option<usize>, RespParseError> {
        loop {
            let pos = self.scanned;
            let Some(&kind) = data.get(pos) else {
                return Ok(None);
            };
            let Some((line, next)) = Self::read_line(data, pos + 1) else {
                return Ok(None);
            };

            match kind {
                b'+' | b'-' => self.scanned = next,
                b':' => {
                    Self::parse_int(line)?;
                    self.scanned = next;
                }
                b'$' => {
                    let len = Self::parse_int(line)?;
                    if len == -1 {
                        self.scanned = next;
                    } else {
                        let len = Self::bulk_len(len)?;
                        let end = next + len;
                        if data.len() < end + 2 {
                            return Ok(None);
                        }
                        Self::expect_crlf(data, end)?;
                        self.scanned = end + 2;
                    }
                }
                b'*' => {
                    let len = Self::parse_int(line)?;
                    self.scanned = next;
                    if len > 0 {
                        if self.open.len() >= MAX_DEPTH {
                            self.open.clear();
                            return Err(RespParseError::InvalidFormat(format!(
                                "Arrays nested deeper than {MAX_DEPTH}"
                            )));
                        }
                        self.open.push(Self::checked_len(len, "array")?);
                        continue;
                    }
                    if len < -1 {
                        return Err(RespParseError::InvalidFormat(format!(
                            "Invalid array size: {len}"
                        )));
                    }
                }
                other => {
                    return Err(RespParseError::InvalidFormat(format!(
                        "Unknown RESP type: {}",
                        other as char
                    )))
                }
            }

            // one element completed; close every array it finished
            loop {
                match self.open.last_mut() {
                    None => return Ok(Some(self.scanned)),
                    Some(missing) => {
                        *missing -= 1;
                        if *missing > 0 {
                            break;
                        }
                        self.open.pop();
                    }
                }
            }
        }
    }

    /// Build the value of a frame [`scan`](Self::scan) accepted, so the
    /// recursion depth is bounded by [`MAX_DEPTH`]
    fn decode_at(data: &[u8], pos: usize) -> Result<Option<(RespValue, usize)>, RespParseError> {
        let Some(&kind) = data.get(pos) else {
            return Ok(None);
        };
        let Some((line, next)) = Self::read_line(data, pos + 1) else {
            return Ok(None);
        };

        match kind {
            b'+' => Ok(Some((
                RespValue::SimpleString(str::from_utf8(line)?.to_string()),
                next,
            ))),
            b'-' => Ok(Some((RespValue::Error(str::from_utf8(line)?.to_string()), next))),
            b':' => Ok(Some((RespValue::Integer(Self::parse_int(line)?), next))),
            b'$' => {
                let len = Self::parse_int(line)?;
                if len == -1 {
                    return Ok(Some((RespValue::BulkString(None), next)));
                }
                let end = next + Self::bulk_len(len)?;
                if data.len() < end + 2 {
                    return Ok(None);
                }
                Self::expect_crlf(data, end)?;
                let content = Bytes::copy_from_slice(&data[next..end]);
                Ok(Some((RespValue::BulkString(Some(content)), end + 2)))
            }
            b'*' => {
                let len = Self::parse_int(line)?;
                if len == -1 {
                    return Ok(Some((RespValue::Array(None), next)));
                }
                let len = Self::checked_len(len, "array")?;
                let mut elements = Vec::with_capacity(len.min(1024));
                let mut cursor = next;
                for _ in 0..len {
                    match Self::decode_at(data, cursor)? {
                        Some((element, after)) => {
                            elements.push(element);
                            cursor = after;
                        }
                        None => return Ok(None),
                    }
                }
                Ok(Some((RespValue::Array(Some(elements)), cursor)))
            }
            other => Err(RespParseError::InvalidFormat(format!(
                "Unknown RESP type: {}",
                other as char
            ))),
        }
    }

    fn parse_int(line: &[u8]) -> Result<i64, RespParseError> {
        btoi::btoi::<i64>(line).map_err(|_| {
            RespParseError::InvalidInteger(String::from_utf8_lossy(line).into_owned())
        })
    }

    fn checked_len(len: i64, what: &str) -> Result<usize, RespParseError> {
        usize::try_from(len)
            .map_err(|_| RespParseError::InvalidFormat(format!("Invalid {what} size: {len}")))
    }

    fn bulk_len(len: i64) -> Result<usize, RespParseError> {
        let len = Self::checked_len(len, "bulk string")?;
        if len > MAX_BULK_LEN {
            return Err(RespParseError::InvalidFormat(format!(
                "Bulk string too large: {len}"
            )));
        }
        Ok(len)
    }

    fn expect_crlf(data: &[u8], at: usize) -> Result<(), RespParseError> {
        if &data[at..at + 2] != b"\r\n" {
            return Err(RespParseError::InvalidFormat(
                "Bulk string not terminated by CRLF".to_string(),
            ));
        }
        Ok(())
    }

    /// Line content starting at `start` and the offset just past its \r\n
    fn read_line(data: &[u8], start: usize) -> Option<(&[u8], usize)> {
        let rest = data.get(start..)?;
        let idx = rest.windows(2).position(|w| w == b"\r\n")?;
        Some((&rest[..idx], start + idx + 2))
    }
}

impl RespEncoder {
    /// Encode a RESP value into an existing buffer
    pub fn encode_into(buf: &mut BytesMut, value: &RespValue) {
        match value {
            RespValue::SimpleString(s) => {
                buf.put_u8(b'+');
                buf.extend_from_slice(s.as_bytes());
                buf.put_slice(b"\r\n");
            }
            RespValue::Error(s) => {
                buf.put_u8(b'-');
                buf.extend_from_slice(s.as_bytes());
                buf.put_slice(b"\r\n");
            }
            RespValue::Integer(n) => {
                buf.put_u8(b':');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.put_slice(b"\r\n");
            }
            RespValue::BulkString(Some(data)) => Self::put_bulk(buf, data),
            RespValue::BulkString(None) => {
                buf.extend_from_slice(b"$-1\r\n");
            }
            RespValue::Array(Some(elements)) => {
                buf.put_u8(b'*');
                buf.extend_from_slice(elements.len().to_string().as_bytes());
                buf.put_slice(b"\r\n");
                for element in elements {
                    Self::encode_into(buf, element);
                }
            }
            RespValue::Array(None) => {
                buf.extend_from_slice(b"*-1\r\n");
            }
        }
    }

    /// Encode a command given as raw arguments (name first) into `buf`
    pub fn encode_command(buf: &mut BytesMut, args: &[&[u8]]) {
        buf.put_u8(b'*');
        buf.extend_from_slice(args.len().to_string().as_bytes());
        buf.put_slice(b"\r\n");
        for arg in args {
            Self::put_bulk(buf, arg);
        }
    }

    fn put_bulk(buf: &mut BytesMut, data: &[u8]) {
        buf.put_u8(b'$');
        buf.extend_from_slice(data.len().to_string().as_bytes());
        buf.put_slice(b"\r\n");
        buf.extend_from_slice(data);
        buf.put_slice(b"\r\n");
    }
}
