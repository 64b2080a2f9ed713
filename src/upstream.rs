//! Forwarding requests to the origin
//!
//! Every request gets its own origin connection. The response body streams
//! straight off that connection, which is dropped once the body is consumed.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use http::{Request, Response, StatusCode};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

use crate::body::Body;
use crate::codec::{self, BodyFraming};
use crate::config::MitmConfig;
use crate::correlation::ForwardedRequest;
use crate::error::{Error, Result};
use crate::socket::{self, MaybeTlsStream};
use crate::tls;

/// Dials origins and relays one request/response exchange
pub struct Upstream {
  tls: TlsConnector,
  overrides: HashMap<String, SocketAddr>,
  connect_timeout: Duration,
  response_timeout: Duration,
  body_timeout: Duration,
  max_header_size: usize,
  max_request_body: usize,
}

impl Upstream {
  /// Create an upstream client from the proxy configuration
  pub fn new(config: &MitmConfig) -> Result<Self> {
    let tls = tls::client_config(config)?;
    Ok(Self {
      tls: TlsConnector::from(Arc::new(tls)),
      overrides: config.upstream_overrides.clone(),
      connect_timeout: config.connect_timeout,
      response_timeout: config.upstream_timeout,
      body_timeout: config.read_timeout,
      max_header_size: config.max_header_size,
      max_request_body: config.max_request_body,
    })
  }

  /// Send `req` to the origin named by its absolute URI and return the
  /// origin's final (non-1xx) response.
  ///
  /// The response carries a [`ForwardedRequest`] with the request parts as
  /// sent.
  pub async fn forward(&self, req: Request<Body>) -> Result<Response<Body>> {
    let (parts, mut body) = req.into_parts();
    let host = parts
      .uri
      .host()
      .ok_or_else(|| Error::invalid_request(format!("request URI has no host: {}", parts.uri)))?
      .to_string();
    let https = parts.uri.scheme() == Some(&http::uri::Scheme::HTTPS);
    let port = parts
      .uri
      .port_u16()
      .unwrap_or(if https { 443 } else { 80 });
    let body = body.collect(self.max_request_body).await?;

    let stream = tokio::time::timeout(self.connect_timeout, self.connect(&host, port, https))
      .await
      .map_err(|_| Error::Timeout("connecting to origin"))??;
    let mut reader = BufReader::new(stream);

    let head = codec::encode_request_head(&parts, body.len());
    let stream = reader.get_mut();
    stream.write_all(&head).await?;
    if !body.is_empty() {
      stream.write_all(&body).await?;
    }
    stream.flush().await?;

    let response = tokio::time::timeout(self.response_timeout, async {
      loop {
        let head = codec::read_response_head(&mut reader, self.max_header_size).await?;
        if head.status == StatusCode::SWITCHING_PROTOCOLS {
          return Err(Error::upstream("origin switched protocols"));
        }
        if !head.status.is_informational() {
          return Ok(head);
        }
        tracing::trace!(status = %head.status, "skipping interim response");
      }
    })
    .await
    .map_err(|_| Error::Timeout("waiting for origin response"))??;

    let framing = codec::response_framing(&parts.method, response.status, &response.headers)?;
    let chunks = idle_deadline(Box::pin(codec::decode(reader, framing)), self.body_timeout);
    let body = match framing {
      BodyFraming::Empty => Body::empty(),
      BodyFraming::Length(n) => Body::from_sized_stream(n, chunks),
      BodyFraming::Chunked | BodyFraming::UntilClose => Body::from_stream(chunks),
    };

    let mut res = Response::from_parts(response, body);
    res
      .extensions_mut()
      .insert(ForwardedRequest(Arc::new(parts)));
    Ok(res)
  }

  async fn connect(&self, host: &str, port: u16, https: bool) -> Result<MaybeTlsStream> {
    let authority = format!("{}:{}", host.to_ascii_lowercase(), port);
    // `Uri::host` keeps the brackets of an IPv6 literal
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let addrs: Vec<SocketAddr> = match self.overrides.get(&authority) {
      Some(addr) => vec![*addr],
      None => tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| Error::upstream(format!("Failed to resolve {}: {}", authority, e)))?
        .collect(),
    };

    let mut last_error = None;
    let mut tcp = None;
    for addr in addrs {
      match socket::connect_with_addr(addr).await {
        Ok(stream) => {
          tcp = Some(stream);
          break;
        }
        Err(e) => last_error = Some(e),
      }
    }
    let tcp = match (tcp, last_error) {
      (Some(tcp), _) => tcp,
      (None, Some(e)) => {
        return Err(Error::upstream(format!("Failed to connect to {}: {}", authority, e)))
      }
      (None, None) => return Err(Error::upstream(format!("No address for {}", authority))),
    };
    tracing::debug!(origin = %authority, https, "connected to origin");

    if !https {
      return Ok(MaybeTlsStream::Tcp(tcp));
    }
    let server_name = ServerName::try_from(host.to_string())
      .map_err(|e| Error::upstream(format!("Invalid server name {}: {}", host, e)))?;
    let tls = self
      .tls
      .connect(server_name, tcp)
      .await
      .map_err(|e| Error::upstream(format!("TLS handshake with {} failed: {}", authority, e)))?;
    Ok(MaybeTlsStream::Tls(Box::new(tls)))
  }
}

/// Fail the body once the origin stays silent for `idle` between chunks
fn idle_deadline<S>(chunks: S, idle: Duration) -> impl Stream<Item = io::Result<Bytes>>
where
  S: Stream<Item = io::Result<Bytes>> + Unpin,
{
  stream::unfold(Some(chunks), move |chunks| async move {
    let mut chunks = chunks?;
    match tokio::time::timeout(idle, chunks.next()).await {
      Ok(Some(chunk)) => Some((chunk, Some(chunks))),
      Ok(None) => None,
      // dropping the stream releases the origin connection
      Err(_) => Some((
        Err(io::Error::new(io::ErrorKind::TimedOut, "origin stalled mid-body")),
        None,
      )),
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{AsyncBufReadExt, AsyncReadExt};
  use tokio::net::TcpListener;

  /// Serve one connection: read the request head, reply with `response`
  async fn origin(response: &'static [u8]) -> (SocketAddr, tokio::task::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
      let (stream, _) = listener.accept().await.unwrap();
      let mut reader = BufReader::new(stream);
      let mut head = String::new();
      loop {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        head.push_str(&line);
        if line == "\r\n" || line.is_empty() {
          break;
        }
      }
      reader.get_mut().write_all(response).await.unwrap();
      reader.get_mut().shutdown().await.ok();
      head
    });
    (addr, handle)
  }

  fn upstream_for(addr: SocketAddr) -> Upstream {
    let config = MitmConfig {
      accept_invalid_upstream_certs: true,
      ..MitmConfig::default()
    }
    .override_upstream("example.test:80", addr);
    Upstream::new(&config).unwrap()
  }

  #[tokio::test]
  async fn forwards_and_streams_response() {
    let (addr, handle) = origin(
      b"HTTP/1.1 100 Continue\r\n\r\n\
        HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n",
    )
    .await;
    let upstream = upstream_for(addr);
    let req = Request::builder()
      .uri("http://example.test/path?q=1")
      .header("x-marker", "m1")
      .body(Body::empty())
      .unwrap();
    let mut res = upstream.forward(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.body_mut().collect(1024).await.unwrap(), "abc");
    let forwarded = res.extensions().get::<ForwardedRequest>().unwrap();
    assert_eq!(forwarded.0.uri.path(), "/path");

    let head = handle.await.unwrap();
    assert!(head.starts_with("GET /path?q=1 HTTP/1.1\r\n"));
    assert!(head.contains("host: example.test\r\n"));
    assert!(head.contains("x-marker: m1\r\n"));
  }

  #[tokio::test]
  async fn sized_response_keeps_its_length() {
    let (addr, handle) = origin(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello").await;
    let upstream = upstream_for(addr);
    let req = Request::builder()
      .uri("http://example.test/")
      .body(Body::empty())
      .unwrap();
    let mut res = upstream.forward(req).await.unwrap();
    assert_eq!(res.body().size_hint(), Some(5));
    assert_eq!(res.body_mut().collect(1024).await.unwrap(), "hello");
    handle.await.unwrap();
  }

  #[tokio::test]
  async fn stalled_body_times_out_and_releases_origin() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let origin = tokio::spawn(async move {
      let (mut stream, _) = listener.accept().await.unwrap();
      let mut buf = [0u8; 1024];
      stream.read(&mut buf).await.unwrap();
      stream
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n0123456789")
        .await
        .unwrap();
      // resolves once the proxy drops its end
      tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .is_ok()
    });
    let config = MitmConfig {
      read_timeout: Duration::from_millis(100),
      accept_invalid_upstream_certs: true,
      ..MitmConfig::default()
    }
    .override_upstream("example.test:80", addr);
    let upstream = Upstream::new(&config).unwrap();
    let req = Request::builder()
      .uri("http://example.test/")
      .body(Body::empty())
      .unwrap();
    let mut res = upstream.forward(req).await.unwrap();
    let err = res.body_mut().collect(1024).await.unwrap_err();
    assert!(matches!(err, Error::BodyRead(ref e) if e.kind() == io::ErrorKind::TimedOut));
    drop(res);
    assert!(origin.await.unwrap());
  }

  #[tokio::test]
  async fn refused_connection_is_upstream_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let upstream = upstream_for(addr);
    let req = Request::builder()
      .uri("http://example.test/")
      .body(Body::empty())
      .unwrap();
    assert!(matches!(upstream.forward(req).await, Err(Error::Upstream(_))));
  }

  #[tokio::test]
  async fn silent_origin_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hold = tokio::spawn(async move {
      let (mut stream, _) = listener.accept().await.unwrap();
      let mut buf = Vec::new();
      stream.read_to_end(&mut buf).await.ok();
    });
    let config = MitmConfig {
      upstream_timeout: Duration::from_millis(100),
      accept_invalid_upstream_certs: true,
      ..MitmConfig::default()
    }
    .override_upstream("example.test:80", addr);
    let upstream = Upstream::new(&config).unwrap();
    let req = Request::builder()
      .uri("http://example.test/")
      .body(Body::empty())
      .unwrap();
    assert!(matches!(upstream.forward(req).await, Err(Error::Timeout(_))));
    hold.abort();
  }
}
