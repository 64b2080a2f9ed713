//! Message bodies

use std::fmt;
use std::io;

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, Stream, StreamExt};

use crate::error::{Error, Result};

/// A single-read message body.
///
/// A body is either fully buffered or a stream of chunks that can be read
/// once. [`Body::collect`] turns a streamed body into a buffered one in place,
/// so decorators can inspect it and leave something replayable behind.
pub struct Body {
  kind: Kind,
}

enum Kind {
  Empty,
  Full(Bytes),
  Stream {
    chunks: BoxStream<'static, io::Result<Bytes>>,
    len: Option<u64>,
  },
}

impl Body {
  /// An empty body
  pub fn empty() -> Self {
    Body { kind: Kind::Empty }
  }

  /// A body produced by a stream of chunks
  pub fn from_stream<S>(stream: S) -> Self
  where
    S: Stream<Item = io::Result<Bytes>> + Send + 'static,
  {
    Body {
      kind: Kind::Stream {
        chunks: stream.boxed(),
        len: None,
      },
    }
  }

  /// A streamed body that yields exactly `len` bytes
  pub fn from_sized_stream<S>(len: u64, stream: S) -> Self
  where
    S: Stream<Item = io::Result<Bytes>> + Send + 'static,
  {
    Body {
      kind: Kind::Stream {
        chunks: stream.boxed(),
        len: Some(len),
      },
    }
  }

  /// Buffered content, if the body is not a stream
  pub fn as_bytes(&self) -> Option<&Bytes> {
    match &self.kind {
      Kind::Full(bytes) => Some(bytes),
      Kind::Empty | Kind::Stream { .. } => None,
    }
  }

  /// Exact length when known without reading
  pub fn size_hint(&self) -> Option<usize> {
    match &self.kind {
      Kind::Empty => Some(0),
      Kind::Full(bytes) => Some(bytes.len()),
      Kind::Stream { len, .. } => len.and_then(|n| usize::try_from(n).ok()),
    }
  }

  /// Whether the body is known to be empty
  pub fn is_empty(&self) -> bool {
    self.size_hint() == Some(0)
  }

  /// Read the whole body into memory and replace it with the buffered copy.
  ///
  /// On `BodyTooLarge` the body is left readable from the start: chunks
  /// already pulled are put back in front of the rest of the stream. On
  /// `BodyRead` the body keeps failing with the same error.
  pub async fn collect(&mut self, limit: usize) -> Result<Bytes> {
    match std::mem::replace(&mut self.kind, Kind::Empty) {
      Kind::Empty => Ok(Bytes::new()),
      Kind::Full(bytes) => {
        let oversized = bytes.len() > limit;
        self.kind = Kind::Full(bytes.clone());
        if oversized {
          return Err(Error::BodyTooLarge { limit });
        }
        Ok(bytes)
      }
      Kind::Stream {
        chunks: mut stream,
        len,
      } => {
        let mut chunks: Vec<Bytes> = Vec::new();
        let mut total = 0;
        while let Some(item) = stream.next().await {
          match item {
            Ok(chunk) => {
              total += chunk.len();
              chunks.push(chunk);
              if total > limit {
                let head = stream::iter(chunks.into_iter().map(Ok));
                self.kind = Kind::Stream {
                  chunks: head.chain(stream).boxed(),
                  len,
                };
                return Err(Error::BodyTooLarge { limit });
              }
            }
            Err(err) => {
              let replay = io::Error::new(err.kind(), err.to_string());
              self.kind = Kind::Stream {
                chunks: stream::once(async move { Err(replay) }).boxed(),
                len: None,
              };
              return Err(Error::BodyRead(err));
            }
          }
        }
        let bytes = concat(chunks, total);
        self.kind = Kind::Full(bytes.clone());
        Ok(bytes)
      }
    }
  }

  /// Consume the body as a stream of chunks
  pub fn into_stream(self) -> BoxStream<'static, io::Result<Bytes>> {
    match self.kind {
      Kind::Empty => stream::empty().boxed(),
      Kind::Full(bytes) => stream::once(async move { Ok(bytes) }).boxed(),
      Kind::Stream { chunks, .. } => chunks,
    }
  }
}

fn concat(mut chunks: Vec<Bytes>, total: usize) -> Bytes {
  match chunks.len() {
    0 => Bytes::new(),
    1 => chunks.remove(0),
    _ => {
      let mut buf = BytesMut::with_capacity(total);
      for chunk in chunks {
        buf.extend_from_slice(&chunk);
      }
      buf.freeze()
    }
  }
}

impl Default for Body {
  fn default() -> Self {
    Body::empty()
  }
}

impl From<Bytes> for Body {
  #[inline]
  fn from(b: Bytes) -> Body {
    if b.is_empty() {
      return Body::empty();
    }
    Body {
      kind: Kind::Full(b),
    }
  }
}

impl From<String> for Body {
  #[inline]
  fn from(s: String) -> Body {
    Bytes::from(s).into()
  }
}

impl From<&'static str> for Body {
  #[inline]
  fn from(s: &'static str) -> Body {
    Bytes::from_static(s.as_bytes()).into()
  }
}

impl From<&'static [u8]> for Body {
  #[inline]
  fn from(s: &'static [u8]) -> Body {
    Bytes::from_static(s).into()
  }
}

impl From<Vec<u8>> for Body {
  #[inline]
  fn from(v: Vec<u8>) -> Body {
    Bytes::from(v).into()
  }
}

impl fmt::Debug for Body {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match &self.kind {
      Kind::Empty => f.write_str("Body(empty)"),
      Kind::Full(bytes) => match std::str::from_utf8(bytes) {
        Ok(s) => write!(f, "Body({:?})", s),
        Err(_err) => write!(f, "Body({:?})", bytes),
      },
      Kind::Stream { .. } => f.write_str("Body(stream)"),
    }
  }
}

#[cfg(feature = "serde")]
pub(crate) mod bytes_serde {
  use bytes::Bytes;
  use serde::{Deserializer, Serializer};

  pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_bytes(v)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
    let bytes: Vec<u8> = serde::Deserialize::deserialize(d)?;
    Ok(Bytes::from(bytes))
  }
}
