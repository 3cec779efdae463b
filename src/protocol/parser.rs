//! Incremental RESP Parser
//!
//! The parser works on whatever bytes the connection has buffered so far and
//! returns one of:
//!
//! - `Ok(Some((value, consumed)))` - a full frame was decoded from the first
//!   `consumed` bytes
//! - `Ok(None)` - the frame is incomplete, read more and try again
//! - `Err(ParseError)` - the bytes can never become a valid frame
//!
//! Besides regular RESP frames, a line that does not start with a type prefix
//! is read as an inline command (`PING\r\n`, `SET app.log hello\r\n`) the way
//! `redis-cli` and `telnet` sessions send them.

use crate::protocol::types::{prefix, RespValue, CRLF};
use bytes::Bytes;
use thiserror::Error;

/// Errors raised for bytes that cannot form a valid frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Length or integer field is not a number
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// Status or error line is not valid UTF-8
    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    /// Negative bulk length other than -1
    #[error("invalid bulk length: {0}")]
    InvalidBulkLength(i64),

    /// Negative multi-bulk length other than -1
    #[error("invalid multibulk length: {0}")]
    InvalidArrayLength(i64),

    /// Any other framing violation
    #[error("{0}")]
    Protocol(String),

    /// The frame exceeds a size limit
    #[error("frame too large: {size} bytes (max: {max})")]
    TooLarge { size: usize, max: usize },
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Largest accepted bulk string
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Most elements accepted in one multibulk request
pub const MAX_MULTIBULK_LEN: usize = 1024 * 1024;

/// Largest accepted inline command line
pub const MAX_INLINE_SIZE: usize = 64 * 1024;

/// Deepest accepted array nesting
pub const MAX_NESTING_DEPTH: usize = 32;

/// A stateless-between-frames RESP parser.
#[derive(Debug, Default)]
pub struct RespParser {
    depth: usize,
}

impl RespParser {
    pub fn new() -> Self {
        Self { depth: 0 }
    }

    /// Attempts to decode one frame from the front of `buf`.
    pub fn parse(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        self.depth = 0;
        self.parse_value(buf)
    }

    fn parse_value(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        let Some(&first) = buf.first() else {
            return Ok(None);
        };

        if self.depth > MAX_NESTING_DEPTH {
            return Err(ParseError::Protocol(format!(
                "nesting deeper than {} levels",
                MAX_NESTING_DEPTH
            )));
        }

        match first {
            prefix::SIMPLE_STRING => Ok(read_line(buf, "status")?
                .map(|(s, used)| (RespValue::SimpleString(s.to_string()), used))),
            prefix::ERROR => Ok(read_line(buf, "error")?
                .map(|(s, used)| (RespValue::Error(s.to_string()), used))),
            prefix::INTEGER => match read_number(buf)? {
                Some((n, used)) => Ok(Some((RespValue::Integer(n), used))),
                None => Ok(None),
            },
            prefix::BULK_STRING => self.parse_bulk(buf),
            prefix::ARRAY => self.parse_array(buf),
            _ if self.depth == 0 => parse_inline(buf),
            other => Err(ParseError::Protocol(format!(
                "unexpected byte {:#04x} inside multibulk",
                other
            ))),
        }
    }

    /// `$<len>\r\n<data>\r\n`
    fn parse_bulk(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        let Some((len, header)) = read_number(buf)? else {
            return Ok(None);
        };

        if len == -1 {
            return Ok(Some((RespValue::Null, header)));
        }
        if len < 0 {
            return Err(ParseError::InvalidBulkLength(len));
        }

        let len = len as usize;
        if len > MAX_BULK_SIZE {
            return Err(ParseError::TooLarge {
                size: len,
                max: MAX_BULK_SIZE,
            });
        }

        let total = header + len + CRLF.len();
        if buf.len() < total {
            return Ok(None);
        }
        if &buf[header + len..total] != CRLF {
            return Err(ParseError::Protocol(
                "bulk string not terminated by CRLF".to_string(),
            ));
        }

        let data = Bytes::copy_from_slice(&buf[header..header + len]);
        Ok(Some((RespValue::BulkString(data), total)))
    }

    /// `*<count>\r\n<element>...`
    fn parse_array(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        let Some((count, header)) = read_number(buf)? else {
            return Ok(None);
        };

        if count == -1 {
            return Ok(Some((RespValue::Null, header)));
        }
        if count < 0 {
            return Err(ParseError::InvalidArrayLength(count));
        }

        let count = count as usize;
        if count > MAX_MULTIBULK_LEN {
            return Err(ParseError::TooLarge {
                size: count,
                max: MAX_MULTIBULK_LEN,
            });
        }

        // Every element needs at least 3 bytes, so a huge count cannot
        // reserve more memory than the buffer justifies.
        let mut elements = Vec::with_capacity(count.min(buf.len() / 3 + 1));
        let mut consumed = header;

        self.depth += 1;
        for _ in 0..count {
            match self.parse_value(&buf[consumed..])? {
                Some((value, used)) => {
                    elements.push(value);
                    consumed += used;
                }
                None => {
                    self.depth -= 1;
                    return Ok(None);
                }
            }
        }
        self.depth -= 1;

        Ok(Some((RespValue::Array(elements), consumed)))
    }
}

/// Reads a `<prefix><text>\r\n` line, returning the text and bytes used.
fn read_line<'a>(buf: &'a [u8], what: &'static str) -> ParseResult<Option<(&'a str, usize)>> {
    match find_crlf(&buf[1..]) {
        Some(pos) => {
            let text = std::str::from_utf8(&buf[1..1 + pos])
                .map_err(|_| ParseError::InvalidUtf8(what))?;
            Ok(Some((text, 1 + pos + CRLF.len())))
        }
        None => Ok(None),
    }
}

/// Reads a `<prefix><integer>\r\n` header.
fn read_number(buf: &[u8]) -> ParseResult<Option<(i64, usize)>> {
    let Some((text, used)) = read_line(buf, "length")? else {
        return Ok(None);
    };
    text.parse::<i64>()
        .map(|n| Some((n, used)))
        .map_err(|_| ParseError::InvalidInteger(text.to_string()))
}

/// Splits an inline command line on whitespace.
fn parse_inline(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    let Some(pos) = find_crlf(buf) else {
        if buf.len() > MAX_INLINE_SIZE {
            return Err(ParseError::TooLarge {
                size: buf.len(),
                max: MAX_INLINE_SIZE,
            });
        }
        return Ok(None);
    };

    let line = std::str::from_utf8(&buf[..pos]).map_err(|_| ParseError::InvalidUtf8("inline command"))?;
    let parts: Vec<RespValue> = line
        .split_whitespace()
        .map(|part| RespValue::BulkString(Bytes::copy_from_slice(part.as_bytes())))
        .collect();

    if parts.is_empty() {
        return Err(ParseError::Protocol("empty inline command".to_string()));
    }

    Ok(Some((RespValue::Array(parts), pos + CRLF.len())))
}

/// Position of the first `\r\n` in `buf`.
#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}

/// Parses a single frame with a fresh parser.
pub fn parse_message(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    RespParser::new().parse(buf)
}
