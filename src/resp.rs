use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::config::{DEFAULT_MAX_RESP_ARGS, DEFAULT_MAX_RESP_BULK_LEN, DEFAULT_MAX_RESP_INLINE_LEN};
use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RespLimits {
    pub max_array_len: usize,
    pub max_bulk_len: usize,
    pub max_inline_len: usize,
}

impl Default for RespLimits {
    fn default() -> Self {
        Self {
            max_array_len: DEFAULT_MAX_RESP_ARGS,
            max_bulk_len: DEFAULT_MAX_RESP_BULK_LEN,
            max_inline_len: DEFAULT_MAX_RESP_INLINE_LEN,
        }
    }
}

/// One decoded server reply. RESP3 sets decode as `Array`.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Vec<u8>),
    Nil,
    Array(Vec<Reply>),
    Map(Vec<(Reply, Reply)>),
    Push(Vec<Reply>),
    Boolean(bool),
    Double(f64),
    BigNumber(String),
}

impl Reply {
    /// Turn an error reply into `Err`, pass anything else through.
    pub fn into_result(self) -> Result<Reply> {
        match self {
            Reply::Error(line) => Err(Error::from_reply(&line)),
            other => Ok(other),
        }
    }

    pub fn into_ok(self) -> Result<()> {
        match self.into_result()? {
            Reply::Simple(_) => Ok(()),
            other => Err(unexpected("status", &other)),
        }
    }

    pub fn into_integer(self) -> Result<i64> {
        match self.into_result()? {
            Reply::Integer(n) => Ok(n),
            Reply::Boolean(b) => Ok(i64::from(b)),
            other => Err(unexpected("integer", &other)),
        }
    }

    pub fn into_u64(self) -> Result<u64> {
        let n = self.into_integer()?;
        u64::try_from(n).map_err(|_| Error::Protocol(format!("negative count {n}")))
    }

    /// Bulk string or nil.
    pub fn into_bulk(self) -> Result<Option<Vec<u8>>> {
        match self.into_result()? {
            Reply::Bulk(data) => Ok(Some(data)),
            Reply::Simple(s) => Ok(Some(s.into_bytes())),
            Reply::Nil => Ok(None),
            other => Err(unexpected("bulk string", &other)),
        }
    }

    /// Array (nil arrays decode as empty).
    pub fn into_array(self) -> Result<Vec<Reply>> {
        match self.into_result()? {
            Reply::Array(items) | Reply::Push(items) => Ok(items),
            Reply::Nil => Ok(Vec::new()),
            other => Err(unexpected("array", &other)),
        }
    }

    /// Array of non-nil bulk strings.
    pub fn into_bulk_array(self) -> Result<Vec<Vec<u8>>> {
        self.into_array()?
            .into_iter()
            .map(|item| {
                item.into_bulk()?
                    .ok_or_else(|| Error::Protocol("nil inside array".to_owned()))
            })
            .collect()
    }

    pub fn into_string(self) -> Result<String> {
        let bytes = self
            .into_bulk()?
            .ok_or_else(|| Error::Protocol("expected string, got nil".to_owned()))?;
        String::from_utf8(bytes).map_err(|_| Error::Protocol("reply is not UTF-8".to_owned()))
    }
}

fn unexpected(wanted: &str, got: &Reply) -> Error {
    Error::Protocol(format!("expected {wanted} reply, got {got:?}"))
}

fn invalid_data(msg: &'static str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg)
}

fn unexpected_eof() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "unexpected EOF")
}

fn parse_i64(bytes: &[u8], err_msg: &'static str) -> std::io::Result<i64> {
    let s = std::str::from_utf8(bytes).map_err(|_| invalid_data(err_msg))?;
    s.parse::<i64>().map_err(|_| invalid_data(err_msg))
}

fn parse_count(bytes: &[u8], max: usize) -> std::io::Result<Option<usize>> {
    let count = parse_i64(bytes, "bad count")?;
    if count < 0 {
        return Ok(None);
    }
    let count = usize::try_from(count).map_err(|_| invalid_data("bad count"))?;
    if count > max {
        return Err(invalid_data("aggregate too large"));
    }
    Ok(Some(count))
}

async fn read_resp_line<'a, R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &'a mut Vec<u8>,
    max_line_len: usize,
) -> std::io::Result<Option<&'a [u8]>> {
    buf.clear();
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(unexpected_eof());
        }
        if let Some(pos) = chunk.iter().position(|&b| b == b'\n') {
            let take = pos + 1;
            if buf.len().saturating_add(take) > max_line_len.saturating_add(2) {
                return Err(invalid_data("line too long"));
            }
            buf.extend_from_slice(&chunk[..take]);
            reader.consume(take);
            break;
        }
        if buf.len().saturating_add(chunk.len()) > max_line_len.saturating_add(2) {
            return Err(invalid_data("line too long"));
        }
        let take = chunk.len();
        buf.extend_from_slice(chunk);
        reader.consume(take);
    }
    if buf.ends_with(b"\n") {
        buf.pop();
        if buf.ends_with(b"\r") {
            buf.pop();
        }
    }
    if buf.len() > max_line_len {
        return Err(invalid_data("line too long"));
    }
    Ok(Some(buf.as_slice()))
}

/// Read a length-prefixed payload plus its trailing CRLF.
async fn read_blob<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    len: usize,
    limits: RespLimits,
) -> std::io::Result<Vec<u8>> {
    if len > limits.max_bulk_len {
        return Err(invalid_data("bulk string too large"));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf).await?;
    if &crlf != b"\r\n" {
        return Err(invalid_data("missing CRLF after bulk string"));
    }
    Ok(buf)
}

/// Aggregates deeper than this are rejected. Real replies nest a handful
/// of levels at most.
const MAX_REPLY_DEPTH: usize = 64;

/// Upper bound on the slots reserved when an aggregate header arrives. The
/// rest grows as members are actually read.
const MAX_FRAME_PREALLOC: usize = 1024;

#[derive(Clone, Copy)]
enum Aggregate {
    Array,
    Map,
    Push,
}

struct Frame {
    kind: Aggregate,
    expected: usize,
    items: Vec<Reply>,
}

impl Frame {
    fn finish(self) -> Reply {
        match self.kind {
            Aggregate::Array => Reply::Array(self.items),
            Aggregate::Push => Reply::Push(self.items),
            Aggregate::Map => {
                let mut pairs = Vec::with_capacity(self.items.len() / 2);
                let mut it = self.items.into_iter();
                while let (Some(k), Some(v)) = (it.next(), it.next()) {
                    pairs.push((k, v));
                }
                Reply::Map(pairs)
            }
        }
    }
}

enum Parsed {
    Leaf(Reply),
    Open(Aggregate, usize),
}

fn open_or_empty(kind: Aggregate, count: usize) -> Parsed {
    if count == 0 {
        Parsed::Leaf(Frame { kind, expected: 0, items: Vec::new() }.finish())
    } else {
        Parsed::Open(kind, count)
    }
}

/// Read one complete reply. Returns `Ok(None)` on a clean EOF before any byte.
pub async fn read_reply<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    limits: RespLimits,
) -> std::io::Result<Option<Reply>> {
    let mut stack: Vec<Frame> = Vec::new();
    let mut line = Vec::new();
    loop {
        let Some(header) = read_resp_line(reader, &mut line, limits.max_inline_len).await? else {
            if stack.is_empty() {
                return Ok(None);
            }
            return Err(unexpected_eof());
        };
        let Some((&marker, rest)) = header.split_first() else {
            return Err(invalid_data("empty reply line"));
        };
        let text = || String::from_utf8_lossy(rest).into_owned();

        let parsed = match marker {
            b'+' => Parsed::Leaf(Reply::Simple(text())),
            b'-' => Parsed::Leaf(Reply::Error(text())),
            b':' => Parsed::Leaf(Reply::Integer(parse_i64(rest, "bad integer")?)),
            b'_' => Parsed::Leaf(Reply::Nil),
            b'#' => Parsed::Leaf(Reply::Boolean(rest == b"t")),
            b'(' => Parsed::Leaf(Reply::BigNumber(text())),
            b',' => {
                let s = text();
                let f = match s.as_str() {
                    "inf" => f64::INFINITY,
                    "-inf" => f64::NEG_INFINITY,
                    other => other.parse().map_err(|_| invalid_data("bad double"))?,
                };
                Parsed::Leaf(Reply::Double(f))
            }
            b'$' | b'=' | b'!' => {
                let len = parse_i64(rest, "bad len")?;
                if len < 0 {
                    Parsed::Leaf(Reply::Nil)
                } else {
                    let len = usize::try_from(len).map_err(|_| invalid_data("bad len"))?;
                    let data = read_blob(reader, len, limits).await?;
                    match marker {
                        // Verbatim strings carry a 3-byte format prefix and ':'.
                        b'=' => Parsed::Leaf(Reply::Bulk(data.get(4..).unwrap_or_default().to_vec())),
                        b'!' => Parsed::Leaf(Reply::Error(String::from_utf8_lossy(&data).into_owned())),
                        _ => Parsed::Leaf(Reply::Bulk(data)),
                    }
                }
            }
            b'*' | b'~' => match parse_count(rest, limits.max_array_len)? {
                None => Parsed::Leaf(Reply::Nil),
                Some(n) => open_or_empty(Aggregate::Array, n),
            },
            b'>' => match parse_count(rest, limits.max_array_len)? {
                None => return Err(invalid_data("bad count")),
                Some(n) => open_or_empty(Aggregate::Push, n),
            },
            b'%' => match parse_count(rest, limits.max_array_len / 2)? {
                None => return Err(invalid_data("bad count")),
                Some(n) => open_or_empty(Aggregate::Map, n * 2),
            },
            _ => return Err(invalid_data("unknown reply type")),
        };

        let mut value = match parsed {
            Parsed::Open(kind, expected) => {
                if stack.len() >= MAX_REPLY_DEPTH {
                    return Err(invalid_data("reply nested too deeply"));
                }
                let items = Vec::with_capacity(expected.min(MAX_FRAME_PREALLOC));
                stack.push(Frame { kind, expected, items });
                continue;
            }
            Parsed::Leaf(reply) => reply,
        };

        // Fold the finished value into its parents, closing every frame it completes.
        loop {
            let Some(frame) = stack.last_mut() else {
                return Ok(Some(value));
            };
            frame.items.push(value);
            if frame.items.len() < frame.expected {
                break;
            }
            match stack.pop() {
                Some(done) => value = done.finish(),
                None => return Err(invalid_data("reply stack underflow")),
            }
        }
    }
}

// ── Command encoding ─────────────────────────────────────────────────────────

pub(crate) fn append_array_header(out: &mut Vec<u8>, len: usize) {
    out.push(b'*');
    out.extend_from_slice(len.to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
}

pub(crate) fn append_bulk(out: &mut Vec<u8>, data: &[u8]) {
    out.push(b'$');
    out.extend_from_slice(data.len().to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

/// Append one command (array of bulk strings) to `out`.
pub fn append_command(out: &mut Vec<u8>, args: &[&[u8]]) {
    append_array_header(out, args.len());
    for arg in args {
        append_bulk(out, arg);
    }
}

pub fn encode_command(args: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(args.iter().map(|a| a.len() + 16).sum::<usize>() + 16);
    append_command(&mut out, args);
    out
}

/// Read one client command (array of bulk strings). Used by the scripted
/// peers in tests that stand in for a server.
#[cfg(test)]
pub(crate) async fn read_command<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<Vec<Vec<u8>>>> {
    match read_reply(reader, RespLimits::default()).await? {
        None => Ok(None),
        Some(Reply::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Reply::Bulk(data) => Ok(data),
                _ => Err(invalid_data("command argument is not a bulk string")),
            })
            .collect::<std::io::Result<Vec<_>>>()
            .map(Some),
        Some(_) => Err(invalid_data("command is not an array")),
    }
}
