// src/core/protocol/resp_frame.rs

//! Implements the RESP (REdis Serialization Protocol) frame structure and the
//! corresponding `Encoder` and `Decoder` used on every client connection.

use crate::core::commands::Command;
use crate::core::errors::{ClientError, ServerError};
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// The CRLF (Carriage Return, Line Feed) sequence used to terminate lines in RESP.
const CRLF: &[u8] = b"\r\n";
const CRLF_LEN: usize = 2;

// Protocol-level limits. A reply exceeding them is treated as a malformed frame.
const MAX_FRAME_ELEMENTS: usize = 1_024 * 1_024 * 16;
const MAX_BULK_STRING_SIZE: usize = 512 * 1024 * 1024;
const MAX_RECURSION_DEPTH: usize = 256;

/// A single frame of the RESP protocol, as read from or written to a server.
#[derive(Debug, Clone, PartialEq)]
pub enum RespFrame {
    SimpleString(String),
    /// An error reply, classified by its code word.
    Error(ServerError),
    Integer(i64),
    BulkString(Bytes),
    /// The null bulk string (`$-1`).
    Null,
    /// The null array (`*-1`), returned by `EXEC` when a WATCHed key changed.
    NullArray,
    Array(Vec<RespFrame>),
    /// A RESP3 out-of-band push (`>`), e.g. a pub/sub message.
    Push(Vec<RespFrame>),
}

impl RespFrame {
    /// Builds an error frame from a raw message such as `MOVED 1 127.0.0.1:7001`.
    pub fn error(message: impl AsRef<str>) -> Self {
        RespFrame::Error(ServerError::parse(message.as_ref()))
    }

    /// Returns the raw bytes of a simple or bulk string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespFrame::SimpleString(s) => Some(s.as_bytes()),
            RespFrame::BulkString(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the integer payload, accepting integers encoded as strings.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespFrame::Integer(i) => Some(*i),
            other => std::str::from_utf8(other.as_bytes()?).ok()?.parse().ok(),
        }
    }

    /// Converts an error frame into a `ClientError`, leaving other frames untouched.
    pub fn into_result(self) -> Result<RespFrame, ClientError> {
        match self {
            RespFrame::Error(e) => Err(ClientError::Server(e)),
            other => Ok(other),
        }
    }
}

/// A `tokio_util::codec` implementation for encoding and decoding `RespFrame`s.
#[derive(Debug, Default, Clone, Copy)]
pub struct RespFrameCodec;

/// Writes `<prefix><n>\r\n` using a stack buffer for the integer.
fn put_header(dst: &mut BytesMut, prefix: u8, n: impl itoa::Integer) {
    let mut buf = itoa::Buffer::new();
    dst.extend_from_slice(&[prefix]);
    dst.extend_from_slice(buf.format(n).as_bytes());
    dst.extend_from_slice(CRLF);
}

fn put_bulk(dst: &mut BytesMut, data: &[u8]) {
    put_header(dst, b'$', data.len());
    dst.extend_from_slice(data);
    dst.extend_from_slice(CRLF);
}

impl Encoder<RespFrame> for RespFrameCodec {
    type Error = ClientError;

    fn encode(&mut self, item: RespFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            RespFrame::SimpleString(s) => {
                dst.extend_from_slice(b"+");
                dst.extend_from_slice(s.as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Error(e) => {
                dst.extend_from_slice(b"-");
                dst.extend_from_slice(e.message.as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Integer(i) => put_header(dst, b':', i),
            RespFrame::BulkString(b) => put_bulk(dst, &b),
            RespFrame::Null => dst.extend_from_slice(b"$-1\r\n"),
            RespFrame::NullArray => dst.extend_from_slice(b"*-1\r\n"),
            RespFrame::Array(arr) => {
                put_header(dst, b'*', arr.len());
                for frame in arr {
                    self.encode(frame, dst)?;
                }
            }
            RespFrame::Push(arr) => {
                put_header(dst, b'>', arr.len());
                for frame in arr {
                    self.encode(frame, dst)?;
                }
            }
        }
        Ok(())
    }
}

/// Requests are always sent as an array of bulk strings, which keeps every
/// argument binary-safe.
impl<'a> Encoder<&'a Command> for RespFrameCodec {
    type Error = ClientError;

    fn encode(&mut self, item: &'a Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let args = item.parts();
        let reserve: usize = args.iter().map(|a| a.len() + 16).sum::<usize>() + 16;
        dst.reserve(reserve);
        put_header(dst, b'*', args.len());
        for arg in args {
            put_bulk(dst, arg);
        }
        Ok(())
    }
}

/// Internal parse outcome; `Incomplete` never escapes the decoder.
enum ParseError {
    Incomplete,
    Invalid(String),
}

type ParseResult<T> = Result<T, ParseError>;

impl Decoder for RespFrameCodec {
    type Item = RespFrame;
    type Error = ClientError;

    /// Decodes one frame. Partial frames stay buffered in `src` until more bytes arrive.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut bytes = &src[..];
        match decode_recursive(&mut bytes, 0) {
            Ok(frame) => {
                let len = src.len() - bytes.len();
                src.advance(len);
                Ok(Some(frame))
            }
            Err(ParseError::Incomplete) => Ok(None),
            Err(ParseError::Invalid(msg)) => Err(ClientError::Protocol(msg)),
        }
    }
}

fn decode_recursive(bytes: &mut &[u8], depth: usize) -> ParseResult<RespFrame> {
    if depth > MAX_RECURSION_DEPTH {
        return Err(ParseError::Invalid(
            "RESP recursion depth limit exceeded".to_string(),
        ));
    }

    let Some(&prefix) = bytes.first() else {
        return Err(ParseError::Incomplete);
    };
    *bytes = &bytes[1..];

    match prefix {
        b'+' => {
            let line = parse_line(bytes)?;
            Ok(RespFrame::SimpleString(
                String::from_utf8_lossy(line).into_owned(),
            ))
        }
        b'-' => {
            let line = parse_line(bytes)?;
            Ok(RespFrame::Error(ServerError::parse(&String::from_utf8_lossy(
                line,
            ))))
        }
        b':' => Ok(RespFrame::Integer(parse_number(bytes)?)),
        b'$' => parse_bulk_string(bytes),
        b'*' => match parse_aggregate(bytes, depth)? {
            Some(frames) => Ok(RespFrame::Array(frames)),
            None => Ok(RespFrame::NullArray),
        },
        b'>' => match parse_aggregate(bytes, depth)? {
            Some(frames) => Ok(RespFrame::Push(frames)),
            None => Err(ParseError::Invalid("null push frame".to_string())),
        },
        other => Err(ParseError::Invalid(format!(
            "unexpected type byte {:?}",
            other as char
        ))),
    }
}

/// Returns the next line without its CRLF and advances past it.
fn parse_line<'a>(bytes: &mut &'a [u8]) -> ParseResult<&'a [u8]> {
    match find_crlf(bytes) {
        Some(pos) => {
            let line = &bytes[..pos];
            *bytes = &bytes[pos + CRLF_LEN..];
            Ok(line)
        }
        None => Err(ParseError::Incomplete),
    }
}

fn parse_number(bytes: &mut &[u8]) -> ParseResult<i64> {
    let line = parse_line(bytes)?;
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            ParseError::Invalid(format!(
                "invalid integer {:?}",
                String::from_utf8_lossy(line)
            ))
        })
}

fn parse_bulk_string(bytes: &mut &[u8]) -> ParseResult<RespFrame> {
    let len = parse_number(bytes)?;
    if len == -1 {
        return Ok(RespFrame::Null);
    }
    if len < 0 || len as usize > MAX_BULK_STRING_SIZE {
        return Err(ParseError::Invalid(format!("invalid bulk length {len}")));
    }

    let len = len as usize;
    if bytes.len() < len + CRLF_LEN {
        return Err(ParseError::Incomplete);
    }
    if &bytes[len..len + CRLF_LEN] != CRLF {
        return Err(ParseError::Invalid(
            "bulk string not terminated by CRLF".to_string(),
        ));
    }

    let data = Bytes::copy_from_slice(&bytes[..len]);
    *bytes = &bytes[len + CRLF_LEN..];
    Ok(RespFrame::BulkString(data))
}

/// Parses the element list of an array or push frame. `None` is the null aggregate.
fn parse_aggregate(bytes: &mut &[u8], depth: usize) -> ParseResult<Option<Vec<RespFrame>>> {
    let len = parse_number(bytes)?;
    if len == -1 {
        return Ok(None);
    }
    if len < 0 || len as usize > MAX_FRAME_ELEMENTS {
        return Err(ParseError::Invalid(format!("invalid array length {len}")));
    }

    // The header is untrusted until the elements arrive.
    let mut frames = Vec::with_capacity((len as usize).min(1024));
    for _ in 0..len {
        frames.push(decode_recursive(bytes, depth + 1)?);
    }
    Ok(Some(frames))
}

fn find_crlf(src: &[u8]) -> Option<usize> {
    src.windows(CRLF_LEN).position(|window| window == CRLF)
}
