//! HTTP/1.1 message heads and body framing
//!
//! Heads are parsed line by line from a buffered reader into `http` parts
//! and serialized back to wire form. Bodies are decoded into chunk streams
//! so the engine can either buffer them or pass them through.

use std::io;

use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream, StreamExt};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{request, response, Method, StatusCode, Uri, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::{Error, Result};

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];

/// Largest slice handed out by a body stream at once
const READ_CHUNK: usize = 16 * 1024;
/// Cap on a chunk-size line or a trailer line
const CHUNK_LINE_LIMIT: usize = 4 * 1024;
/// Blank lines tolerated before a request line
const MAX_LEADING_BLANK_LINES: usize = 8;

/// Headers that describe one hop and are never forwarded
const HOP_BY_HOP: [&str; 8] = [
  "connection",
  "keep-alive",
  "proxy-connection",
  "proxy-authorization",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
];

/// How a message body is delimited on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
  Empty,
  Length(u64),
  Chunked,
  UntilClose,
}

fn invalid(msg: impl Into<String>) -> io::Error {
  io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn trim_crlf(line: &[u8]) -> &[u8] {
  let line = line.strip_suffix(b"\n").unwrap_or(line);
  line.strip_suffix(b"\r").unwrap_or(line)
}

/// Read one `\n`-terminated line, charging it against `budget`.
async fn read_line<R>(reader: &mut R, line: &mut Vec<u8>, budget: &mut usize) -> io::Result<usize>
where
  R: AsyncBufRead + Unpin,
{
  line.clear();
  let n = (&mut *reader)
    .take(*budget as u64)
    .read_until(b'\n', line)
    .await?;
  if n > 0 && !line.ends_with(b"\n") {
    if n >= *budget {
      return Err(invalid("message head too large"));
    }
    return Err(io::Error::new(
      io::ErrorKind::UnexpectedEof,
      "connection closed inside message head",
    ));
  }
  *budget -= n;
  Ok(n)
}

fn parse_header_line(line: &[u8]) -> io::Result<(HeaderName, HeaderValue)> {
  let mut split = line.splitn(2, |b| *b == b':');
  let (name, value) = match (split.next(), split.next()) {
    (Some(name), Some(value)) => (name, value),
    _ => return Err(invalid("header line without colon")),
  };
  let name = HeaderName::from_bytes(name).map_err(|e| invalid(e.to_string()))?;
  let value = HeaderValue::from_bytes(value.trim_ascii()).map_err(|e| invalid(e.to_string()))?;
  Ok((name, value))
}

async fn read_headers<R>(reader: &mut R, budget: &mut usize) -> io::Result<HeaderMap>
where
  R: AsyncBufRead + Unpin,
{
  let mut headers = HeaderMap::new();
  let mut line = Vec::new();
  loop {
    if read_line(reader, &mut line, budget).await? == 0 {
      return Err(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "connection closed inside message head",
      ));
    }
    let line = trim_crlf(&line);
    if line.is_empty() {
      return Ok(headers);
    }
    if line[0] == b' ' || line[0] == b'\t' {
      return Err(invalid("obsolete header folding"));
    }
    let (name, value) = parse_header_line(line)?;
    headers.append(name, value);
  }
}

fn parse_version(token: &[u8]) -> io::Result<Version> {
  match token {
    b"HTTP/1.0" => Ok(Version::HTTP_10),
    b"HTTP/1.1" => Ok(Version::HTTP_11),
    _ => Err(invalid("unsupported http version")),
  }
}

fn parse_request_line(line: &[u8]) -> io::Result<(Method, Uri, Version)> {
  let mut parts = line.splitn(3, |b| *b == b' ');
  let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
    (Some(m), Some(t), Some(v)) if !m.is_empty() && !t.is_empty() => (m, t, v),
    _ => return Err(invalid("malformed request line")),
  };
  let method = Method::from_bytes(method).map_err(|e| invalid(e.to_string()))?;
  let uri = Uri::try_from(target).map_err(|e| invalid(e.to_string()))?;
  Ok((method, uri, parse_version(version)?))
}

fn parse_status_line(line: &[u8]) -> io::Result<(Version, StatusCode)> {
  let mut parts = line.splitn(3, |b| *b == b' ');
  let (version, status) = match (parts.next(), parts.next()) {
    (Some(v), Some(s)) if !s.is_empty() => (v, s),
    _ => return Err(invalid("invalid http version and status_code data")),
  };
  let version = parse_version(version)?;
  let status = StatusCode::from_bytes(status).map_err(|e| invalid(e.to_string()))?;
  Ok((version, status))
}

/// Read a request head. `Ok(None)` means the peer closed the connection
/// cleanly before sending anything.
pub(crate) async fn read_request_head<R>(
  reader: &mut R,
  max: usize,
) -> Result<Option<request::Parts>>
where
  R: AsyncBufRead + Unpin,
{
  let to_error = |e: io::Error| match e.kind() {
    io::ErrorKind::InvalidData => Error::invalid_request(e.to_string()),
    _ => Error::Io(e),
  };
  let mut budget = max;
  let mut line = Vec::new();
  let mut blank = 0;
  loop {
    if read_line(reader, &mut line, &mut budget).await.map_err(to_error)? == 0 {
      return Ok(None);
    }
    if !trim_crlf(&line).is_empty() {
      break;
    }
    blank += 1;
    if blank > MAX_LEADING_BLANK_LINES {
      return Err(Error::invalid_request("too many blank lines before request"));
    }
  }
  let (method, uri, version) = parse_request_line(trim_crlf(&line)).map_err(to_error)?;
  let headers = read_headers(reader, &mut budget).await.map_err(to_error)?;

  let (mut parts, _) = http::Request::builder()
    .method(method)
    .uri(uri)
    .version(version)
    .body(())?
    .into_parts();
  parts.headers = headers;
  Ok(Some(parts))
}

/// Read a response head from the origin
pub(crate) async fn read_response_head<R>(reader: &mut R, max: usize) -> Result<response::Parts>
where
  R: AsyncBufRead + Unpin,
{
  let to_error = |e: io::Error| Error::upstream(format!("bad response from origin: {}", e));
  let mut budget = max;
  let mut line = Vec::new();
  if read_line(reader, &mut line, &mut budget).await.map_err(to_error)? == 0 {
    return Err(Error::upstream("origin closed connection before responding"));
  }
  let (version, status) = parse_status_line(trim_crlf(&line)).map_err(to_error)?;
  let headers = read_headers(reader, &mut budget).await.map_err(to_error)?;

  let (mut parts, _) = http::Response::builder()
    .version(version)
    .status(status)
    .body(())?
    .into_parts();
  parts.headers = headers;
  Ok(parts)
}

fn is_chunked(headers: &HeaderMap) -> Option<bool> {
  let mut last = None;
  for value in headers.get_all(header::TRANSFER_ENCODING) {
    let value = value.to_str().ok()?;
    for coding in value.split(',') {
      let coding = coding.trim();
      if !coding.is_empty() {
        last = Some(coding.eq_ignore_ascii_case("chunked"));
      }
    }
  }
  last
}

fn content_length(headers: &HeaderMap) -> io::Result<Option<u64>> {
  let mut length = None;
  for value in headers.get_all(header::CONTENT_LENGTH) {
    let value = value
      .to_str()
      .ok()
      .and_then(|v| v.trim().parse::<u64>().ok())
      .ok_or_else(|| invalid("invalid content-length"))?;
    if length.is_some_and(|l| l != value) {
      return Err(invalid("conflicting content-length"));
    }
    length = Some(value);
  }
  Ok(length)
}

/// Framing of a request body
pub(crate) fn request_framing(headers: &HeaderMap) -> Result<BodyFraming> {
  match is_chunked(headers) {
    Some(true) => return Ok(BodyFraming::Chunked),
    Some(false) => return Err(Error::invalid_request("unsupported transfer-encoding")),
    None => {}
  }
  match content_length(headers).map_err(|e| Error::invalid_request(e.to_string()))? {
    Some(0) | None => Ok(BodyFraming::Empty),
    Some(n) => Ok(BodyFraming::Length(n)),
  }
}

/// Framing of a response body, given the method it answers
pub(crate) fn response_framing(
  method: &Method,
  status: StatusCode,
  headers: &HeaderMap,
) -> Result<BodyFraming> {
  if method == Method::HEAD
    || status.is_informational()
    || status == StatusCode::NO_CONTENT
    || status == StatusCode::NOT_MODIFIED
  {
    return Ok(BodyFraming::Empty);
  }
  match is_chunked(headers) {
    Some(true) => return Ok(BodyFraming::Chunked),
    Some(false) => return Ok(BodyFraming::UntilClose),
    None => {}
  }
  match content_length(headers).map_err(|e| Error::upstream(e.to_string()))? {
    Some(0) => Ok(BodyFraming::Empty),
    Some(n) => Ok(BodyFraming::Length(n)),
    None => Ok(BodyFraming::UntilClose),
  }
}

enum Decode {
  Length(u64),
  ChunkHeader,
  ChunkData(u64),
  UntilClose,
  Done,
}

async fn read_some<R>(reader: &mut R, max: u64) -> io::Result<Bytes>
where
  R: AsyncBufRead + Unpin,
{
  let buf = reader.fill_buf().await?;
  let n = std::cmp::min(buf.len() as u64, max) as usize;
  let chunk = Bytes::copy_from_slice(&buf[..n]);
  reader.consume(n);
  Ok(chunk)
}

async fn read_chunk_size<R>(reader: &mut R) -> io::Result<u64>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = Vec::new();
  let mut budget = CHUNK_LINE_LIMIT;
  if read_line(reader, &mut line, &mut budget).await? == 0 {
    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "missing chunk size"));
  }
  let line = trim_crlf(&line);
  // chunk extensions are ignored
  let size = line.split(|b| *b == b';').next().unwrap_or_default();
  let size = std::str::from_utf8(size.trim_ascii()).map_err(|_| invalid("invalid chunk size"))?;
  u64::from_str_radix(size, 16).map_err(|_| invalid("invalid chunk size"))
}

async fn expect_crlf<R>(reader: &mut R) -> io::Result<()>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = Vec::new();
  let mut budget = CHUNK_LINE_LIMIT;
  read_line(reader, &mut line, &mut budget).await?;
  if !trim_crlf(&line).is_empty() || line.is_empty() {
    return Err(invalid("missing CRLF after chunk data"));
  }
  Ok(())
}

async fn skip_trailers<R>(reader: &mut R) -> io::Result<()>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = Vec::new();
  loop {
    let mut budget = CHUNK_LINE_LIMIT;
    if read_line(reader, &mut line, &mut budget).await? == 0 || trim_crlf(&line).is_empty() {
      return Ok(());
    }
  }
}

/// Decode a body from `reader` into a stream of chunks, stopping at the end
/// of the body so the reader can be reused for the next message.
pub(crate) fn decode<R>(reader: R, framing: BodyFraming) -> impl Stream<Item = io::Result<Bytes>>
where
  R: AsyncBufRead + Unpin,
{
  let state = match framing {
    BodyFraming::Empty => Decode::Done,
    BodyFraming::Length(n) => Decode::Length(n),
    BodyFraming::Chunked => Decode::ChunkHeader,
    BodyFraming::UntilClose => Decode::UntilClose,
  };
  stream::try_unfold((reader, state), |(mut reader, mut state)| async move {
    loop {
      match state {
        Decode::Done | Decode::Length(0) => return Ok(None),
        Decode::Length(n) => {
          let chunk = read_some(&mut reader, std::cmp::min(n, READ_CHUNK as u64)).await?;
          if chunk.is_empty() {
            return Err(io::Error::new(
              io::ErrorKind::UnexpectedEof,
              "body shorter than content-length",
            ));
          }
          let left = n - chunk.len() as u64;
          return Ok(Some((chunk, (reader, Decode::Length(left)))));
        }
        Decode::ChunkHeader => {
          let size = read_chunk_size(&mut reader).await?;
          if size == 0 {
            skip_trailers(&mut reader).await?;
            return Ok(None);
          }
          state = Decode::ChunkData(size);
        }
        Decode::ChunkData(n) => {
          let chunk = read_some(&mut reader, std::cmp::min(n, READ_CHUNK as u64)).await?;
          if chunk.is_empty() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated chunk"));
          }
          let left = n - chunk.len() as u64;
          let next = if left == 0 {
            expect_crlf(&mut reader).await?;
            Decode::ChunkHeader
          } else {
            Decode::ChunkData(left)
          };
          return Ok(Some((chunk, (reader, next))));
        }
        Decode::UntilClose => {
          let chunk = read_some(&mut reader, READ_CHUNK as u64).await?;
          if chunk.is_empty() {
            return Ok(None);
          }
          return Ok(Some((chunk, (reader, Decode::UntilClose))));
        }
      }
    }
  })
}

/// Read a whole body into memory, refusing anything over `limit`
pub(crate) async fn read_body<R>(
  reader: &mut R,
  framing: BodyFraming,
  limit: usize,
) -> Result<Bytes>
where
  R: AsyncBufRead + Unpin,
{
  if let BodyFraming::Length(n) = framing {
    if n > limit as u64 {
      return Err(Error::BodyTooLarge { limit });
    }
  }
  let mut body = std::pin::pin!(decode(reader, framing));
  let mut buf = BytesMut::new();
  while let Some(chunk) = body.next().await {
    let chunk = chunk.map_err(Error::BodyRead)?;
    if buf.len() + chunk.len() > limit {
      return Err(Error::BodyTooLarge { limit });
    }
    buf.extend_from_slice(&chunk);
  }
  Ok(buf.freeze())
}

/// Remove hop-by-hop headers, including any listed in `Connection`
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
  let listed: Vec<HeaderName> = headers
    .get_all(header::CONNECTION)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
    .collect();
  for name in listed {
    headers.remove(name);
  }
  for name in HOP_BY_HOP {
    headers.remove(name);
  }
}

fn connection_has(headers: &HeaderMap, token: &str) -> bool {
  [header::CONNECTION, HeaderName::from_static("proxy-connection")]
    .iter()
    .flat_map(|name| headers.get_all(name))
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Whether the client wants the connection kept open after this exchange
pub(crate) fn wants_keep_alive(version: Version, headers: &HeaderMap) -> bool {
  match version {
    Version::HTTP_11 => !connection_has(headers, "close"),
    _ => connection_has(headers, "keep-alive"),
  }
}

fn write_headers(buf: &mut Vec<u8>, headers: &HeaderMap) {
  for (k, v) in headers.iter() {
    buf.extend(k.as_str().as_bytes());
    buf.extend(COLON_SPACE);
    buf.extend(v.as_bytes());
    buf.extend(CR_LF);
  }
}

/// Serialize a request head in origin-form for the upstream hop.
///
/// The proxy does not reuse origin connections, so every forwarded request
/// carries `Connection: close`.
pub(crate) fn encode_request_head(parts: &request::Parts, body_len: usize) -> Vec<u8> {
  let mut buf = Vec::new();
  buf.extend(parts.method.as_str().as_bytes());
  buf.extend(SPACE);
  match parts.uri.path_and_query() {
    Some(pq) if !pq.as_str().is_empty() => buf.extend(pq.as_str().as_bytes()),
    _ => buf.extend(b"/"),
  }
  buf.extend(SPACE);
  buf.extend(b"HTTP/1.1");
  buf.extend(CR_LF);

  let mut headers = parts.headers.clone();
  strip_hop_by_hop(&mut headers);
  if !headers.contains_key(header::HOST) {
    if let Some(authority) = parts.uri.authority() {
      if let Ok(host) = HeaderValue::from_str(authority.as_str()) {
        headers.insert(header::HOST, host);
      }
    }
  }
  headers.remove(header::CONTENT_LENGTH);
  if body_len > 0 || matches!(parts.method, Method::POST | Method::PUT | Method::PATCH) {
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body_len));
  }
  headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
  write_headers(&mut buf, &headers);
  buf.extend(CR_LF);
  buf
}

/// How a response body is delimited towards the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
  /// No body is allowed (HEAD, 1xx, 204, 304)
  NoBody,
  Length(usize),
  Chunked,
  Close,
}

/// Serialize a response head for the client
pub(crate) fn encode_response_head(
  parts: &response::Parts,
  version: Version,
  delivery: Delivery,
  keep_alive: bool,
) -> Vec<u8> {
  let mut buf = Vec::new();
  buf.extend(if version == Version::HTTP_10 {
    &b"HTTP/1.0"[..]
  } else {
    &b"HTTP/1.1"[..]
  });
  buf.extend(SPACE);
  buf.extend(parts.status.as_str().as_bytes());
  buf.extend(SPACE);
  buf.extend(parts.status.canonical_reason().unwrap_or("").as_bytes());
  buf.extend(CR_LF);

  let mut headers = parts.headers.clone();
  strip_hop_by_hop(&mut headers);
  match delivery {
    Delivery::NoBody => {}
    Delivery::Length(n) => {
      headers.insert(header::CONTENT_LENGTH, HeaderValue::from(n));
    }
    Delivery::Chunked => {
      headers.remove(header::CONTENT_LENGTH);
      headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
    }
    Delivery::Close => {
      headers.remove(header::CONTENT_LENGTH);
    }
  }
  let keep_alive = keep_alive && delivery != Delivery::Close;
  match (keep_alive, version) {
    (false, _) => {
      headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    }
    (true, Version::HTTP_10) => {
      headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    }
    (true, _) => {}
  }
  write_headers(&mut buf, &headers);
  buf.extend(CR_LF);
  buf
}

/// Frame one chunk of a chunked body
pub(crate) fn encode_chunk(chunk: &[u8]) -> Vec<u8> {
  let mut buf = Vec::with_capacity(chunk.len() + 12);
  buf.extend(format!("{:x}", chunk.len()).as_bytes());
  buf.extend(CR_LF);
  buf.extend(chunk);
  buf.extend(CR_LF);
  buf
}

/// Terminating chunk of a chunked body
pub(crate) const LAST_CHUNK: &[u8] = b"0\r\n\r\n";
