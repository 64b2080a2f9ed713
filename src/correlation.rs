//! Request/response correlation
//!
//! The request phase captures a snapshot of the inbound request and stores
//! it under a fresh [`CorrelationId`]; the id travels with the request in
//! its extensions and reaches the response phase through
//! [`ForwardedRequest`]. The response phase takes the snapshot back out.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, Uri, Version};
use moka::sync::Cache;
use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[cfg(feature = "serde")]
use crate::body::bytes_serde;
use crate::body::Body;
use crate::config::MitmConfig;
use crate::error::Result;

/// Length of a generated correlation id
pub const ID_LEN: usize = 24;

/// Opaque per-transaction identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct CorrelationId(String);

impl CorrelationId {
  /// The id as a string
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for CorrelationId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for CorrelationId {
  fn from(value: &str) -> Self {
    CorrelationId(value.to_string())
  }
}

/// Request extension: response-phase logging must not run for this exchange
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LogBypassed(pub bool);

/// Request extension describing the client connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClientInfo {
  /// Address of the connected client
  pub peer: SocketAddr,
  /// Whether the request arrived inside an intercepted CONNECT tunnel
  pub tunneled: bool,
}

/// Response extension: the request as it was sent to the origin,
/// extensions included
#[derive(Clone, Debug)]
pub struct ForwardedRequest(pub Arc<http::request::Parts>);

/// The original request of a transaction, captured before forwarding
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RequestSnapshot {
  /// Request method
  #[cfg_attr(feature = "serde", serde(with = "http_serde::method"))]
  pub method: Method,
  /// Full request URI
  #[cfg_attr(feature = "serde", serde(with = "http_serde::uri"))]
  pub uri: Uri,
  /// HTTP version
  #[cfg_attr(feature = "serde", serde(with = "http_serde::version"))]
  pub version: Version,
  /// Request headers
  #[cfg_attr(feature = "serde", serde(with = "http_serde::header_map"))]
  pub headers: HeaderMap,
  /// Request body
  #[cfg_attr(feature = "serde", serde(with = "bytes_serde"))]
  pub body: Bytes,
}

impl RequestSnapshot {
  /// Capture `req`, reading its body up to `limit` bytes and putting a
  /// replayable copy back in its place.
  pub async fn capture(req: &mut Request<Body>, limit: usize) -> Result<Self> {
    let body = req.body_mut().collect(limit).await?;
    Ok(RequestSnapshot {
      method: req.method().clone(),
      uri: req.uri().clone(),
      version: req.version(),
      headers: req.headers().clone(),
      body,
    })
  }
}

/// Accessors for the per-transaction context datum.
///
/// On a request they read its own extensions; on a response they read the
/// extensions of the request it answers.
pub trait TransactionExt {
  /// Extensions of the request this exchange belongs to
  fn request_extensions(&self) -> Option<&http::Extensions>;

  /// Correlation id attached during the request phase
  fn correlation_id(&self) -> Option<&CorrelationId> {
    self.request_extensions()?.get::<CorrelationId>()
  }

  /// Whether response-phase logging was disabled for this exchange
  fn log_bypassed(&self) -> bool {
    self
      .request_extensions()
      .and_then(|ext| ext.get::<LogBypassed>())
      .is_some_and(|bypassed| bypassed.0)
  }

  /// Client connection the request arrived on
  fn client_info(&self) -> Option<&ClientInfo> {
    self.request_extensions()?.get::<ClientInfo>()
  }
}

impl<T> TransactionExt for Request<T> {
  fn request_extensions(&self) -> Option<&http::Extensions> {
    Some(self.extensions())
  }
}

impl<T> TransactionExt for Response<T> {
  fn request_extensions(&self) -> Option<&http::Extensions> {
    self
      .extensions()
      .get::<ForwardedRequest>()
      .map(|forwarded| &forwarded.0.extensions)
  }
}

/// Concurrency-safe map from correlation id to request snapshot.
///
/// Entries expire after a time-to-live and the map is bounded in size, so
/// transactions whose response phase never runs do not accumulate.
pub struct CorrelationStore {
  entries: Cache<CorrelationId, Arc<RequestSnapshot>>,
  rng: Mutex<StdRng>,
}

impl CorrelationStore {
  /// Create a store whose entries live at most `ttl`
  pub fn new(ttl: Duration, capacity: u64) -> Self {
    Self {
      entries: Cache::builder()
        .max_capacity(capacity)
        .time_to_live(ttl)
        .build(),
      rng: Mutex::new(StdRng::from_entropy()),
    }
  }

  /// Create a store with the bounds from `config`
  pub fn from_config(config: &MitmConfig) -> Self {
    Self::new(config.correlation_ttl, config.correlation_capacity)
  }

  /// Draw a fresh id
  pub fn next_id(&self) -> CorrelationId {
    let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
    let id: String = (0..ID_LEN)
      .map(|_| rng.sample(Alphanumeric) as char)
      .collect();
    CorrelationId(id)
  }

  /// Store `snapshot` under `id`, replacing any previous entry
  pub fn put(&self, id: CorrelationId, snapshot: RequestSnapshot) {
    self.entries.insert(id, Arc::new(snapshot));
  }

  /// Store `snapshot` under a newly drawn id that is not already in use
  pub fn register(&self, snapshot: RequestSnapshot) -> CorrelationId {
    let snapshot = Arc::new(snapshot);
    loop {
      let id = self.next_id();
      let entry = self
        .entries
        .entry(id.clone())
        .or_insert_with(|| snapshot.clone());
      if entry.is_fresh() {
        return id;
      }
      tracing::warn!(%id, "correlation id collision, drawing another");
    }
  }

  /// Look up the snapshot stored under `id`
  pub fn get(&self, id: &CorrelationId) -> Option<Arc<RequestSnapshot>> {
    self.entries.get(id)
  }

  /// Remove the entry for `id`
  pub fn delete(&self, id: &CorrelationId) {
    self.entries.invalidate(id);
  }

  /// Remove and return the entry for `id`
  pub fn take(&self, id: &CorrelationId) -> Option<Arc<RequestSnapshot>> {
    self.entries.remove(id)
  }

  /// Approximate number of live entries
  pub fn len(&self) -> u64 {
    self.entries.run_pending_tasks();
    self.entries.entry_count()
  }

  /// Whether the store holds no entries
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl Default for CorrelationStore {
  fn default() -> Self {
    Self::from_config(&MitmConfig::default())
  }
}

impl fmt::Debug for CorrelationStore {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CorrelationStore")
      .field("entries", &self.entries.entry_count())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;

  fn snapshot(marker: &'static str) -> RequestSnapshot {
    RequestSnapshot {
      method: Method::POST,
      uri: Uri::from_static("http://example.test/"),
      version: Version::HTTP_11,
      headers: HeaderMap::new(),
      body: Bytes::from_static(marker.as_bytes()),
    }
  }

  #[test]
  fn ids_are_long_alphanumeric_and_distinct() {
    let store = CorrelationStore::default();
    let mut seen = HashSet::new();
    for _ in 0..10_000 {
      let id = store.next_id();
      assert_eq!(id.as_str().len(), ID_LEN);
      assert!(id.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
      assert!(seen.insert(id));
    }
  }

  #[test]
  fn put_get_take_delete() {
    let store = CorrelationStore::default();
    let id = store.next_id();
    store.put(id.clone(), snapshot("one"));
    assert_eq!(store.get(&id).unwrap().body, Bytes::from_static(b"one"));
    // get does not consume
    assert!(store.get(&id).is_some());
    assert_eq!(store.take(&id).unwrap().body, Bytes::from_static(b"one"));
    assert!(store.get(&id).is_none());

    let other = store.register(snapshot("two"));
    assert!(store.get(&other).is_some());
    store.delete(&other);
    assert!(store.get(&other).is_none());
    assert!(store.is_empty());
  }

  #[test]
  fn stores_are_isolated() {
    let a = CorrelationStore::default();
    let b = CorrelationStore::default();
    let id = a.register(snapshot("a"));
    assert!(b.get(&id).is_none());
  }

  #[test]
  fn entries_expire() {
    let store = CorrelationStore::new(Duration::from_millis(50), 100);
    let id = store.register(snapshot("short-lived"));
    std::thread::sleep(Duration::from_millis(150));
    assert!(store.get(&id).is_none());
  }

  #[tokio::test]
  async fn capture_leaves_body_replayable() {
    let mut req = Request::builder()
      .method(Method::PUT)
      .uri("http://example.test/upload")
      .body(Body::from("payload"))
      .unwrap();
    let snap = RequestSnapshot::capture(&mut req, 1024).await.unwrap();
    assert_eq!(snap.method, Method::PUT);
    assert_eq!(snap.body, Bytes::from_static(b"payload"));
    assert_eq!(req.body().as_bytes(), Some(&Bytes::from_static(b"payload")));
  }

  #[test]
  fn response_reads_context_of_forwarded_request() {
    let id = CorrelationId::from("abc");
    let (mut parts, _) = Request::builder()
      .uri("http://example.test/")
      .body(())
      .unwrap()
      .into_parts();
    parts.extensions.insert(id.clone());
    parts.extensions.insert(LogBypassed(true));

    let mut res = Response::new(Body::empty());
    assert!(res.correlation_id().is_none());
    assert!(!res.log_bypassed());
    res.extensions_mut().insert(ForwardedRequest(Arc::new(parts)));
    assert_eq!(res.correlation_id(), Some(&id));
    assert!(res.log_bypassed());
  }

  #[cfg(feature = "serde")]
  #[test]
  fn snapshot_serializes_for_export() {
    let mut snap = snapshot("body");
    snap.headers.insert("x-marker", http::HeaderValue::from_static("m1"));
    let json = serde_json::to_value(&snap).unwrap();
    assert_eq!(json["method"], "POST");
    assert_eq!(json["uri"], "http://example.test/");

    let back: RequestSnapshot = serde_json::from_value(json).unwrap();
    assert_eq!(back.body, snap.body);
    assert_eq!(back.headers["x-marker"], "m1");
  }
}
