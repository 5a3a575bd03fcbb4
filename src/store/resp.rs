//! RESP2 reply framing for the dedicated subscriber socket.

use crate::{Error, ErrorContext, Result};
use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

/// One decoded server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<Frame>>),
}

impl Frame {
    pub(crate) fn as_text(&self) -> Option<&str> {
        match self {
            Frame::Simple(s) => Some(s),
            Frame::Bulk(Some(bytes)) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }
}

/// Decodes complete frames and leaves partial ones buffered, so a reader
/// built on it can be dropped between frames without losing data.
#[derive(Debug, Default)]
pub(crate) struct RespCodec;

impl Decoder for RespCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match parse(src, 0)? {
            Some((frame, used)) => {
                src.advance(used);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}

fn malformed(details: impl Into<String>) -> Error {
    Error::store_with_context(
        "malformed RESP frame",
        ErrorContext::new()
            .with_details(details)
            .with_source("redis_subscriber"),
    )
}

/// The line starting at `start` without its CRLF, and the offset after it.
fn line(buf: &[u8], start: usize) -> Option<(&[u8], usize)> {
    let rest = buf.get(start..)?;
    let end = rest.windows(2).position(|w| w == b"\r\n")?;
    Some((&rest[..end], start + end + 2))
}

fn number(body: &[u8]) -> Result<i64> {
    std::str::from_utf8(body)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| malformed(format!("bad length {:?}", String::from_utf8_lossy(body))))
}

/// `Ok(None)` means more bytes are needed.
fn parse(buf: &[u8], start: usize) -> Result<Option<(Frame, usize)>> {
    let Some(&tag) = buf.get(start) else {
        return Ok(None);
    };
    let Some((body, next)) = line(buf, start + 1) else {
        return Ok(None);
    };
    let parsed = match tag {
        b'+' => (Frame::Simple(String::from_utf8_lossy(body).into_owned()), next),
        b'-' => (Frame::Error(String::from_utf8_lossy(body).into_owned()), next),
        b':' => (Frame::Integer(number(body)?), next),
        b'$' => {
            let len = number(body)?;
            if len < 0 {
                (Frame::Bulk(None), next)
            } else {
                let end = next + len as usize;
                if buf.len() < end + 2 {
                    return Ok(None);
                }
                if &buf[end..end + 2] != b"\r\n" {
                    return Err(malformed("bulk string not terminated by CRLF"));
                }
                (Frame::Bulk(Some(buf[next..end].to_vec())), end + 2)
            }
        }
        // `>` is the RESP3 push header; same layout as an array.
        b'*' | b'>' => {
            let count = number(body)?;
            if count < 0 {
                (Frame::Array(None), next)
            } else {
                let mut items = Vec::with_capacity((count as usize).min(64));
                let mut pos = next;
                for _ in 0..count {
                    match parse(buf, pos)? {
                        Some((item, after)) => {
                            items.push(item);
                            pos = after;
                        }
                        None => return Ok(None),
                    }
                }
                (Frame::Array(Some(items)), pos)
            }
        }
        other => return Err(malformed(format!("unknown type byte {:?}", other as char))),
    };
    Ok(Some(parsed))
}
