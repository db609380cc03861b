//! Minimal RESP (REdis Serialization Protocol) codec.
//!
//! spec.md §6 scopes the wire protocol's command dispatcher out of
//! `cachegrand-core` entirely ("the core only sees parsed key bytes and
//! value chunk sequences"); this module is the thin dispatcher the spec
//! names, parsing just enough RESP to drive PING/GET/SET/DEL and nothing
//! else, the way `summit-api`'s handlers are thin translators in front of
//! `summit-services` rather than a protocol implementation of their own.

use bytes::{Buf, Bytes, BytesMut};

#[derive(Debug, thiserror::Error)]
pub enum RespError {
    #[error("protocol error: {0}")]
    Protocol(&'static str),
}

/// Parse one full inline command (an array of bulk strings) from `buf`,
/// advancing past it on success. Returns `Ok(None)` if `buf` does not yet
/// contain a complete command.
pub fn parse_command(buf: &mut BytesMut) -> Result<Option<Vec<Bytes>>, RespError> {
    let mut cursor = 0usize;

    let array_len = match read_line_prefixed(buf, &mut cursor, b'*')? {
        Some(n) => n,
        None => return Ok(None),
    };
    if array_len < 0 {
        return Err(RespError::Protocol("negative array length"));
    }

    let mut parts = Vec::with_capacity(array_len as usize);
    for _ in 0..array_len {
        let bulk_len = match read_line_prefixed(buf, &mut cursor, b'$')? {
            Some(n) => n,
            None => return Ok(None),
        };
        if bulk_len < 0 {
            parts.push(Bytes::new());
            continue;
        }
        let bulk_len = bulk_len as usize;
        if buf.len() < cursor + bulk_len + 2 {
            return Ok(None);
        }
        let data = Bytes::copy_from_slice(&buf[cursor..cursor + bulk_len]);
        cursor += bulk_len;
        if &buf[cursor..cursor + 2] != b"\r\n" {
            return Err(RespError::Protocol("bulk string missing trailing CRLF"));
        }
        cursor += 2;
        parts.push(data);
    }

    buf.advance(cursor);
    Ok(Some(parts))
}

/// Reads a line of the form `<prefix><integer>\r\n` starting at `*cursor`
/// without consuming `buf` (the caller advances once the whole command is
/// known to be complete). Returns `Ok(None)` if the line isn't fully
/// buffered yet.
fn read_line_prefixed(buf: &BytesMut, cursor: &mut usize, prefix: u8) -> Result<Option<i64>, RespError> {
    let start = *cursor;
    if buf.len() <= start {
        return Ok(None);
    }
    if buf[start] != prefix {
        return Err(RespError::Protocol("unexpected type prefix"));
    }
    let Some(eol) = find_crlf(&buf[start..]) else {
        return Ok(None);
    };
    let line = std::str::from_utf8(&buf[start + 1..start + eol]).map_err(|_| RespError::Protocol("non-utf8 length"))?;
    let value: i64 = line.parse().map_err(|_| RespError::Protocol("malformed length"))?;
    *cursor = start + eol + 2;
    Ok(Some(value))
}

fn find_crlf(slice: &[u8]) -> Option<usize> {
    slice.windows(2).position(|w| w == b"\r\n")
}

/// A reply value the dispatcher can write back.
pub enum RespReply {
    Simple(&'static str),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    Nil,
}

pub fn encode_reply(out: &mut BytesMut, reply: &RespReply) {
    use bytes::BufMut;
    match reply {
        RespReply::Simple(s) => {
            out.put_u8(b'+');
            out.put_slice(s.as_bytes());
            out.put_slice(b"\r\n");
        }
        RespReply::Error(s) => {
            out.put_u8(b'-');
            out.put_slice(s.as_bytes());
            out.put_slice(b"\r\n");
        }
        RespReply::Integer(n) => {
            out.put_u8(b':');
            out.put_slice(n.to_string().as_bytes());
            out.put_slice(b"\r\n");
        }
        RespReply::Bulk(data) => {
            out.put_u8(b'$');
            out.put_slice(data.len().to_string().as_bytes());
            out.put_slice(b"\r\n");
            out.put_slice(data);
            out.put_slice(b"\r\n");
        }
        RespReply::Nil => {
            out.put_slice(b"$-1\r\n");
        }
    }
}
