//! The intercepting proxy engine
//!
//! One [`MitmProxy`] serves any number of client connections. A connection
//! carries plain proxy requests in absolute form, or a `CONNECT` that turns
//! it into an intercepted TLS tunnel whose decrypted requests are served
//! the same way. Every request runs through the request chain, whose
//! terminal handler forwards to the origin, and its response runs through
//! the response chain, whose terminal handler writes to the client.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use http::header::{self, HeaderValue};
use http::uri::Authority;
use http::{Method, Request, Response, StatusCode, Uri, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::rustls::server::Acceptor;
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;

use crate::body::Body;
use crate::ca::CertificateAuthority;
use crate::codec::{self, BodyFraming, Delivery};
use crate::config::MitmConfig;
use crate::correlation::{ClientInfo, CorrelationStore, ForwardedRequest};
use crate::error::{Error, Result};
use crate::modifier::{handler_fn, ModifierChain, RequestHandler, ResponseHandler};
use crate::tls;
use crate::upstream::Upstream;

/// Delivery progress of one response towards the client
const NOT_STARTED: u8 = 0;
const WRITING: u8 = 1;
const DONE_KEEP_ALIVE: u8 = 2;
const DONE_CLOSE: u8 = 3;

/// Client connection shared between the read loop and the delivering handler
type Conn<S> = Arc<Mutex<BufReader<S>>>;

/// How serving a client stream ended
enum Exit<S> {
  Closed,
  Connect {
    authority: Authority,
    conn: BufReader<S>,
  },
}

/// What the delivering handler needs to know about the request it answers
#[derive(Clone, Copy)]
struct Exchange {
  head_only: bool,
  version: Version,
  keep_alive: bool,
}

/// TLS-intercepting HTTP/1.1 forward proxy
pub struct MitmProxy {
  ca: Arc<CertificateAuthority>,
  config: MitmConfig,
  upstream: Arc<Upstream>,
  correlation: Arc<CorrelationStore>,
  request_chain: ModifierChain<Request<Body>, Response<Body>>,
  response_chain: ModifierChain<Response<Body>, ()>,
}

impl MitmProxy {
  /// Create a proxy signing leaves with `ca`
  pub fn new(ca: Arc<CertificateAuthority>, config: MitmConfig) -> Result<Self> {
    let upstream = Arc::new(Upstream::new(&config)?);
    let correlation = Arc::new(CorrelationStore::from_config(&config));
    Ok(Self {
      ca,
      config,
      upstream,
      correlation,
      request_chain: ModifierChain::new(),
      response_chain: ModifierChain::new(),
    })
  }

  /// Create a proxy whose root CA is loaded from `config.ca_key_path` and
  /// `config.ca_cert_path`, or generated there when missing
  pub async fn from_config(config: MitmConfig) -> Result<Self> {
    let ca = CertificateAuthority::load_or_create(&config.ca_key_path, &config.ca_cert_path).await?;
    Self::new(Arc::new(ca), config)
  }

  /// Register a request decorator.
  ///
  /// Decorators registered first are outermost: they see the request
  /// before, and the response after, every decorator registered later. The
  /// innermost handler forwards to the origin.
  pub fn use_request_modifier<F>(&mut self, modifier: F)
  where
    F: Fn(RequestHandler) -> RequestHandler + Send + Sync + 'static,
  {
    self.request_chain.push(modifier);
  }

  /// Register a response decorator.
  ///
  /// Same ordering as [`MitmProxy::use_request_modifier`]; the innermost
  /// handler writes the response to the client.
  pub fn use_response_modifier<F>(&mut self, modifier: F)
  where
    F: Fn(ResponseHandler) -> ResponseHandler + Send + Sync + 'static,
  {
    self.response_chain.push(modifier);
  }

  /// The store shared by this proxy's request and response phases
  pub fn correlation_store(&self) -> Arc<CorrelationStore> {
    self.correlation.clone()
  }

  /// The authority issuing this proxy's leaf certificates
  pub fn certificate_authority(&self) -> Arc<CertificateAuthority> {
    self.ca.clone()
  }

  /// Proxy configuration
  pub fn config(&self) -> &MitmConfig {
    &self.config
  }

  /// Serve one accepted client connection until it closes
  pub async fn handle_connection(
    self: Arc<Self>,
    stream: TcpStream,
    peer: SocketAddr,
  ) -> Result<()> {
    tracing::debug!(%peer, "connection opened");
    let result = match self.serve_stream(stream, peer, None).await {
      Ok(Exit::Closed) => Ok(()),
      Ok(Exit::Connect { authority, conn }) => self.intercept_tunnel(conn, peer, authority).await,
      Err(e) => Err(e),
    };
    tracing::debug!(%peer, "connection closed");
    result
  }

  /// Answer a CONNECT, terminate TLS with a leaf for the target and serve
  /// the decrypted stream
  async fn intercept_tunnel(
    &self,
    mut conn: BufReader<TcpStream>,
    peer: SocketAddr,
    authority: Authority,
  ) -> Result<()> {
    let stream = conn.get_mut();
    stream
      .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
      .await?;
    stream.flush().await?;

    let handshake = self.accept_tls(conn, &authority);
    let tls = tokio::time::timeout(self.config.handshake_timeout, handshake)
      .await
      .map_err(|_| {
        Error::handshake(format!("handshake with {} for {} timed out", peer, authority))
      })??;
    tracing::debug!(%peer, target = %authority, "tunnel intercepted");

    self.serve_stream(tls, peer, Some(authority)).await?;
    Ok(())
  }

  async fn accept_tls(
    &self,
    conn: BufReader<TcpStream>,
    authority: &Authority,
  ) -> Result<TlsStream<BufReader<TcpStream>>> {
    let start = LazyConfigAcceptor::new(Acceptor::default(), conn)
      .await
      .map_err(|e| {
        Error::handshake(format!("failed to read ClientHello for {}: {}", authority, e))
      })?;
    let host = start
      .client_hello()
      .server_name()
      .map(str::to_string)
      .unwrap_or_else(|| authority.host().to_string());
    let leaf = self.ca.issue_leaf(&host).await?;
    let config = tls::server_config(&leaf)?;
    start
      .into_stream(Arc::new(config))
      .await
      .map_err(|e| Error::handshake(format!("TLS handshake for {} failed: {}", host, e)))
  }

  /// Serve HTTP/1.1 requests from `stream` one after another.
  ///
  /// `tunnel` is the CONNECT target when `stream` is a decrypted tunnel.
  async fn serve_stream<S>(
    &self,
    stream: S,
    peer: SocketAddr,
    tunnel: Option<Authority>,
  ) -> Result<Exit<S>>
  where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
  {
    let conn: Conn<S> = Arc::new(Mutex::new(BufReader::new(stream)));
    let tunneled = tunnel.is_some();

    loop {
      let (mut parts, body, keep_alive) = {
        let mut reader = conn.lock().await;
        let head = match tokio::time::timeout(
          self.config.read_timeout,
          codec::read_request_head(&mut *reader, self.config.max_header_size),
        )
        .await
        {
          Err(_) => {
            tracing::debug!(%peer, "idle timeout");
            return Ok(Exit::Closed);
          }
          Ok(Ok(None)) => return Ok(Exit::Closed),
          Ok(Ok(Some(head))) => head,
          Ok(Err(e @ Error::InvalidRequest(_))) => {
            reply(reader.get_mut(), Version::HTTP_11, StatusCode::BAD_REQUEST, false).await;
            return Err(e);
          }
          Ok(Err(e)) => return Err(e),
        };

        if head.method == Method::CONNECT {
          if tunneled {
            reply(reader.get_mut(), head.version, StatusCode::METHOD_NOT_ALLOWED, false).await;
            return Err(Error::invalid_request("CONNECT inside an intercepted tunnel"));
          }
          let authority = match head.uri.authority() {
            Some(authority) if head.uri.scheme().is_none() => authority.clone(),
            _ => {
              reply(reader.get_mut(), head.version, StatusCode::BAD_REQUEST, false).await;
              return Err(Error::invalid_request(format!("invalid CONNECT target: {}", head.uri)));
            }
          };
          drop(reader);
          let conn = Arc::try_unwrap(conn)
            .map_err(|_| Error::invalid_request("connection still in use"))?
            .into_inner();
          return Ok(Exit::Connect { authority, conn });
        }

        let mut head = head;
        match &tunnel {
          Some(authority) => head.uri = tunneled_uri(authority, &head.uri)?,
          None if head.uri.scheme().is_none() || head.uri.authority().is_none() => {
            reply(reader.get_mut(), head.version, StatusCode::BAD_REQUEST, false).await;
            return Err(Error::invalid_request(format!(
              "proxy request must use an absolute URI: {}",
              head.uri
            )));
          }
          None => {}
        }

        let framing = match codec::request_framing(&head.headers) {
          Ok(framing) => framing,
          Err(e) => {
            reply(reader.get_mut(), head.version, StatusCode::BAD_REQUEST, false).await;
            return Err(e);
          }
        };
        if framing != BodyFraming::Empty && expects_continue(&head.headers) {
          let stream = reader.get_mut();
          stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
          stream.flush().await?;
        }
        head.headers.remove(header::EXPECT);

        let limit = self.config.max_request_body;
        let read = codec::read_body(&mut *reader, framing, limit);
        let body = match tokio::time::timeout(self.config.read_timeout, read).await {
          Err(_) => {
            reply(reader.get_mut(), head.version, StatusCode::REQUEST_TIMEOUT, false).await;
            return Err(Error::Timeout("reading request body"));
          }
          Ok(Ok(body)) => body,
          Ok(Err(e @ Error::BodyTooLarge { .. })) => {
            reply(reader.get_mut(), head.version, StatusCode::PAYLOAD_TOO_LARGE, false).await;
            return Err(e);
          }
          Ok(Err(e)) => return Err(e),
        };
        let keep_alive = codec::wants_keep_alive(head.version, &head.headers);
        (head, body, keep_alive)
      };

      parts.extensions.insert(ClientInfo { peer, tunneled });
      let exchange = Exchange {
        head_only: parts.method == Method::HEAD,
        version: parts.version,
        keep_alive,
      };
      let method = parts.method.clone();
      let uri = parts.uri.clone();
      let req = Request::from_parts(parts, Body::from(body));

      if !self.transact(&conn, req, exchange, peer, &method, &uri).await {
        // sends close_notify on intercepted tunnels
        conn.lock().await.get_mut().shutdown().await.ok();
        return Ok(Exit::Closed);
      }
    }
  }

  /// Run one request through both chains. Returns whether the connection
  /// can carry another request.
  async fn transact<S>(
    &self,
    conn: &Conn<S>,
    req: Request<Body>,
    exchange: Exchange,
    peer: SocketAddr,
    method: &Method,
    uri: &Uri,
  ) -> bool
  where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
  {
    let upstream = self.upstream.clone();
    let forward = self
      .request_chain
      .wrap(handler_fn(move |req: Request<Body>| {
        let upstream = upstream.clone();
        async move { upstream.forward(req).await }
      }));

    let (parts, body) = req.into_parts();
    let context = Arc::new(parts.clone());
    let mut res = match forward(Request::from_parts(parts, body)).await {
      Ok(res) => res,
      Err(e) => {
        let status = status_for(&e);
        tracing::warn!(%peer, %method, %uri, status = status.as_u16(), "request failed: {}", e);
        let mut guard = conn.lock().await;
        return reply(guard.get_mut(), exchange.version, status, exchange.keep_alive).await
          && exchange.keep_alive;
      }
    };
    // a decorator answered without reaching the origin
    if res.extensions().get::<ForwardedRequest>().is_none() {
      res.extensions_mut().insert(ForwardedRequest(context));
    }
    tracing::info!(%peer, %method, %uri, status = res.status().as_u16(), "exchange");

    let state = Arc::new(AtomicU8::new(NOT_STARTED));
    let deliver = {
      let conn = conn.clone();
      let state = state.clone();
      handler_fn(move |res: Response<Body>| deliver(conn.clone(), res, exchange, state.clone()))
    };
    let result = self.response_chain.wrap(deliver)(res).await;

    match (result, state.load(Ordering::Acquire)) {
      (Ok(()), DONE_KEEP_ALIVE) => true,
      (Ok(()), DONE_CLOSE) => false,
      (Ok(()), _) => {
        tracing::debug!(%peer, %uri, "response was not delivered, closing connection");
        false
      }
      (Err(e), NOT_STARTED) => {
        tracing::warn!(%peer, %method, %uri, "response relay failed: {}", e);
        let mut guard = conn.lock().await;
        reply(guard.get_mut(), exchange.version, StatusCode::BAD_GATEWAY, false).await;
        false
      }
      (Err(e), _) => {
        tracing::warn!(%peer, %method, %uri, "response relay aborted: {}", e);
        false
      }
    }
  }
}

/// Terminal response handler: write `res` to the client.
///
/// While waiting for body chunks the client side is watched, so a client
/// hanging up releases the response body and its origin connection.
async fn deliver<S>(
  conn: Conn<S>,
  res: Response<Body>,
  exchange: Exchange,
  state: Arc<AtomicU8>,
) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin + Send,
{
  let (parts, body) = res.into_parts();
  let status = parts.status;
  let delivery = if exchange.head_only
    || status.is_informational()
    || status == StatusCode::NO_CONTENT
    || status == StatusCode::NOT_MODIFIED
  {
    Delivery::NoBody
  } else {
    match body.size_hint() {
      Some(n) => Delivery::Length(n),
      None if exchange.version == Version::HTTP_11 => Delivery::Chunked,
      None => Delivery::Close,
    }
  };
  let keep_alive = exchange.keep_alive && delivery != Delivery::Close;
  let head = codec::encode_response_head(&parts, exchange.version, delivery, keep_alive);

  let mut guard = conn.lock().await;
  state.store(WRITING, Ordering::Release);
  guard.get_mut().write_all(&head).await?;
  if delivery != Delivery::NoBody {
    let mut chunks = body.into_stream();
    let mut written = 0;
    // pipelined bytes end the watch, only EOF or a read error mean the client left
    let mut watch_client = true;
    loop {
      let next = tokio::select! {
        next = chunks.next() => next,
        gone = client_gone(&mut *guard), if watch_client => {
          if gone {
            return Err(Error::Io(io::Error::new(
              io::ErrorKind::ConnectionAborted,
              "client closed the connection mid-response",
            )));
          }
          watch_client = false;
          continue;
        }
      };
      let Some(chunk) = next else {
        break;
      };
      let chunk = chunk.map_err(Error::BodyRead)?;
      if chunk.is_empty() {
        continue;
      }
      written += chunk.len();
      let writer = guard.get_mut();
      match delivery {
        Delivery::Chunked => writer.write_all(&codec::encode_chunk(&chunk)).await?,
        Delivery::Length(n) if written > n => return Err(length_mismatch(n)),
        _ => writer.write_all(&chunk).await?,
      }
    }
    match delivery {
      Delivery::Chunked => guard.get_mut().write_all(codec::LAST_CHUNK).await?,
      Delivery::Length(n) if written != n => return Err(length_mismatch(n)),
      _ => {}
    }
  }
  guard.get_mut().flush().await?;
  state.store(
    if keep_alive { DONE_KEEP_ALIVE } else { DONE_CLOSE },
    Ordering::Release,
  );
  Ok(())
}

/// Whether the client hung up, judged by a read that hits EOF or fails
async fn client_gone<R>(reader: &mut R) -> bool
where
  R: AsyncBufRead + Unpin,
{
  match reader.fill_buf().await {
    Ok(buf) => buf.is_empty(),
    Err(_) => true,
  }
}

fn length_mismatch(declared: usize) -> Error {
  Error::Io(io::Error::new(
    io::ErrorKind::InvalidData,
    format!("response body does not match its length of {} bytes", declared),
  ))
}

/// Write a short plain-text response generated by the proxy itself.
/// Returns whether the write went through.
async fn reply<W>(writer: &mut W, version: Version, status: StatusCode, keep_alive: bool) -> bool
where
  W: AsyncWrite + Unpin,
{
  let body = format!("{}\n", status);
  let mut res = Response::new(());
  *res.status_mut() = status;
  res.headers_mut().insert(
    header::CONTENT_TYPE,
    HeaderValue::from_static("text/plain; charset=utf-8"),
  );
  let (parts, _) = res.into_parts();
  let delivery = Delivery::Length(body.len());
  let mut raw = codec::encode_response_head(&parts, version, delivery, keep_alive);
  raw.extend(body.as_bytes());
  let written = async {
    writer.write_all(&raw).await?;
    writer.flush().await
  };
  written.await.is_ok()
}

/// Status sent to the client when the request phase fails
fn status_for(error: &Error) -> StatusCode {
  match error {
    Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
    Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
    Error::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
    _ => StatusCode::BAD_GATEWAY,
  }
}

fn expects_continue(headers: &http::HeaderMap) -> bool {
  headers
    .get(header::EXPECT)
    .and_then(|v| v.to_str().ok())
    .is_some_and(|v| v.trim().eq_ignore_ascii_case("100-continue"))
}

/// Absolute `https` URI for a request read from the tunnel to `authority`
fn tunneled_uri(authority: &Authority, uri: &Uri) -> Result<Uri> {
  let target = match authority.port_u16() {
    None | Some(443) => authority.host(),
    Some(_) => authority.as_str(),
  };
  let path = uri
    .path_and_query()
    .map(|pq| pq.as_str())
    .filter(|pq| !pq.is_empty())
    .unwrap_or("/");
  Ok(
    Uri::builder()
      .scheme("https")
      .authority(target)
      .path_and_query(path)
      .build()?,
  )
}
