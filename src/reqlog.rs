//! Request/response logging built on the modifier chains
//!
//! The request half snapshots each request into the proxy's
//! [`CorrelationStore`]; the response half takes the snapshot back out and
//! logs the pair. Register both halves with [`RequestLog::install`].

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Request, Response, StatusCode};

use crate::body::Body;
use crate::correlation::{
  CorrelationId, CorrelationStore, ForwardedRequest, LogBypassed, RequestSnapshot, TransactionExt,
};
use crate::error::Error;
use crate::modifier::{handler_fn, RequestHandler, ResponseHandler};
use crate::proxy::MitmProxy;

/// Default cap on captured request and response bodies
pub const DEFAULT_CAPTURE_LIMIT: usize = 10 * 1024 * 1024;

/// One logged request/response pair
#[derive(Clone, Debug)]
pub struct LoggedExchange {
  /// Correlation id the pair was matched by
  pub id: CorrelationId,
  /// Request as it arrived, before forwarding
  pub request: Arc<RequestSnapshot>,
  /// Response status
  pub status: StatusCode,
  /// Response headers
  pub headers: HeaderMap,
  /// Response body
  pub body: Bytes,
}

type Sink = Arc<dyn Fn(LoggedExchange) + Send + Sync>;

/// Logs every exchange that passes through the proxy
#[derive(Clone)]
pub struct RequestLog {
  store: Arc<CorrelationStore>,
  capture_limit: usize,
  sink: Option<Sink>,
}

impl RequestLog {
  /// Log into `store`, normally [`MitmProxy::correlation_store`]
  pub fn new(store: Arc<CorrelationStore>) -> Self {
    Self {
      store,
      capture_limit: DEFAULT_CAPTURE_LIMIT,
      sink: None,
    }
  }

  /// Cap captured bodies at `limit` bytes
  pub fn capture_limit(mut self, limit: usize) -> Self {
    self.capture_limit = limit;
    self
  }

  /// Hand every logged exchange to `sink` as well
  pub fn with_sink<F>(mut self, sink: F) -> Self
  where
    F: Fn(LoggedExchange) + Send + Sync + 'static,
  {
    self.sink = Some(Arc::new(sink));
    self
  }

  /// Register both halves on `proxy`
  pub fn install(&self, proxy: &mut MitmProxy) {
    proxy.use_request_modifier(self.request_modifier());
    proxy.use_response_modifier(self.response_modifier());
  }

  /// Request half: snapshot, register and tag the request.
  ///
  /// A request whose body cannot be captured is forwarded untouched with
  /// [`LogBypassed`] set.
  pub fn request_modifier(
    &self,
  ) -> impl Fn(RequestHandler) -> RequestHandler + Send + Sync + 'static {
    let log = self.clone();
    move |next: RequestHandler| {
      let log = log.clone();
      handler_fn(move |mut req: Request<Body>| {
        let next = next.clone();
        let log = log.clone();
        async move {
          match RequestSnapshot::capture(&mut req, log.capture_limit).await {
            Ok(snapshot) => {
              let id = log.store.register(snapshot);
              req.extensions_mut().insert(id);
            }
            Err(e) => {
              tracing::warn!(uri = %req.uri(), "request not logged: {}", e);
              req.extensions_mut().insert(LogBypassed(true));
            }
          }

          let (parts, body) = req.into_parts();
          let context = parts.clone();
          let mut res = next(Request::from_parts(parts, body)).await?;
          // responses made up by inner decorators never reached the origin
          if res.extensions().get::<ForwardedRequest>().is_none() {
            res
              .extensions_mut()
              .insert(ForwardedRequest(Arc::new(context)));
          }
          Ok(res)
        }
      })
    }
  }

  /// Response half: match the response to its request and log the pair.
  ///
  /// A response answered by a decorator registered ahead of this log never
  /// had its request registered and passes through unlogged. A response
  /// with no request context, or whose id has no stored snapshot, fails the
  /// relay with [`Error::CorrelationMiss`], as does a response body that
  /// cannot be captured.
  pub fn response_modifier(
    &self,
  ) -> impl Fn(ResponseHandler) -> ResponseHandler + Send + Sync + 'static {
    let log = self.clone();
    move |next: ResponseHandler| {
      let log = log.clone();
      handler_fn(move |mut res: Response<Body>| {
        let next = next.clone();
        let log = log.clone();
        async move {
          if res.log_bypassed() {
            return next(res).await;
          }
          if res.request_extensions().is_none() {
            return Err(Error::correlation_miss("response has no request context"));
          }
          let Some(id) = res.correlation_id().cloned() else {
            tracing::warn!(status = res.status().as_u16(), "response bypassed the request log");
            return next(res).await;
          };
          let request = log
            .store
            .take(&id)
            .ok_or_else(|| Error::correlation_miss(format!("no request stored under {}", id)))?;
          let body = res.body_mut().collect(log.capture_limit).await?;

          tracing::info!(%id, "{} {}", request.uri, res.status().as_u16());
          if let Some(sink) = &log.sink {
            sink(LoggedExchange {
              id,
              request,
              status: res.status(),
              headers: res.headers().clone(),
              body,
            });
          }
          next(res).await
        }
      })
    }
  }
}

impl fmt::Debug for RequestLog {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RequestLog")
      .field("capture_limit", &self.capture_limit)
      .field("sink", &self.sink.is_some())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::modifier::ModifierChain;
  use futures::stream;
  use std::io;
  use std::sync::Mutex;

  /// Request chain whose terminal plays the origin: echo the request body
  fn request_chain(log: &RequestLog) -> RequestHandler {
    let mut chain = ModifierChain::new();
    chain.push(log.request_modifier());
    chain.wrap(handler_fn(|req: Request<Body>| async move {
      let (parts, mut body) = req.into_parts();
      let echoed = body.collect(1024).await?;
      let mut res = Response::new(Body::from(echoed));
      res.extensions_mut().insert(ForwardedRequest(Arc::new(parts)));
      Ok(res)
    }))
  }

  fn response_chain(log: &RequestLog, delivered: Arc<Mutex<Vec<Bytes>>>) -> ResponseHandler {
    let mut chain = ModifierChain::new();
    chain.push(log.response_modifier());
    chain.wrap(handler_fn(move |mut res: Response<Body>| {
      let delivered = delivered.clone();
      async move {
        let body = res.body_mut().collect(1024).await?;
        delivered.lock().unwrap().push(body);
        Ok(())
      }
    }))
  }

  #[tokio::test]
  async fn logs_pair_and_consumes_entry() {
    let store = Arc::new(CorrelationStore::default());
    let logged = Arc::new(Mutex::new(Vec::new()));
    let sink = logged.clone();
    let log =
      RequestLog::new(store.clone()).with_sink(move |exchange| sink.lock().unwrap().push(exchange));
    let delivered = Arc::new(Mutex::new(Vec::new()));

    let req = Request::builder()
      .method("POST")
      .uri("http://example.test/echo")
      .body(Body::from("marker-1"))
      .unwrap();
    let res = request_chain(&log)(req).await.unwrap();
    assert_eq!(store.len(), 1);
    response_chain(&log, delivered.clone())(res).await.unwrap();

    assert!(store.is_empty());
    let logged = logged.lock().unwrap();
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].request.body, Bytes::from_static(b"marker-1"));
    assert_eq!(logged[0].request.uri, "http://example.test/echo");
    assert_eq!(logged[0].body, Bytes::from_static(b"marker-1"));
    // the downstream handler still sees the whole body
    assert_eq!(delivered.lock().unwrap()[0], Bytes::from_static(b"marker-1"));
  }

  #[tokio::test]
  async fn unreadable_request_body_bypasses_logging() {
    let store = Arc::new(CorrelationStore::default());
    let log = RequestLog::new(store.clone());
    let chunks: Vec<io::Result<Bytes>> = vec![Err(io::Error::new(io::ErrorKind::Other, "boom"))];
    let req = Request::builder()
      .uri("http://example.test/")
      .body(Body::from_stream(stream::iter(chunks)))
      .unwrap();

    let mut chain = ModifierChain::new();
    chain.push(log.request_modifier());
    let res = chain
      .wrap(handler_fn(|req: Request<Body>| async move {
        assert_eq!(req.extensions().get::<LogBypassed>(), Some(&LogBypassed(true)));
        Ok(Response::new(Body::from("ok")))
      }))(req)
      .await
      .unwrap();
    assert!(store.is_empty());
    assert!(res.log_bypassed());

    let delivered = Arc::new(Mutex::new(Vec::new()));
    response_chain(&log, delivered.clone())(res).await.unwrap();
    assert_eq!(delivered.lock().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn response_without_request_context_is_a_correlation_miss() {
    let log = RequestLog::new(Arc::new(CorrelationStore::default()));
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let result = response_chain(&log, delivered.clone())(Response::new(Body::from("orphan"))).await;
    assert!(matches!(result, Err(Error::CorrelationMiss(_))));
    assert!(delivered.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn unregistered_request_passes_through() {
    let log = RequestLog::new(Arc::new(CorrelationStore::default()));
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let (parts, _) = Request::new(()).into_parts();
    let mut res = Response::new(Body::from("blocked"));
    res.extensions_mut().insert(ForwardedRequest(Arc::new(parts)));
    response_chain(&log, delivered.clone())(res).await.unwrap();
    assert_eq!(delivered.lock().unwrap()[0], Bytes::from_static(b"blocked"));
  }

  #[tokio::test]
  async fn stale_id_is_a_correlation_miss() {
    let log = RequestLog::new(Arc::new(CorrelationStore::default()));
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let mut req = Request::new(());
    req.extensions_mut().insert(CorrelationId::from("gone"));
    let (parts, _) = req.into_parts();
    let mut res = Response::new(Body::from("late"));
    res.extensions_mut().insert(ForwardedRequest(Arc::new(parts)));
    let result = response_chain(&log, delivered.clone())(res).await;
    assert!(matches!(result, Err(Error::CorrelationMiss(_))));
    assert!(delivered.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn oversized_response_fails_relay() {
    let store = Arc::new(CorrelationStore::default());
    let log = RequestLog::new(store).capture_limit(4);
    let req = Request::builder()
      .uri("http://example.test/")
      .body(Body::from("tiny"))
      .unwrap();
    let mut chain = ModifierChain::new();
    chain.push(log.request_modifier());
    let res = chain
      .wrap(handler_fn(|_req: Request<Body>| async move {
        Ok(Response::new(Body::from("much too long")))
      }))(req)
      .await
      .unwrap();
    // short-circuited responses still carry the request context
    assert!(res.correlation_id().is_some());

    let delivered = Arc::new(Mutex::new(Vec::new()));
    let result = response_chain(&log, delivered.clone())(res).await;
    assert!(matches!(result, Err(Error::BodyTooLarge { limit: 4 })));
    assert!(delivered.lock().unwrap().is_empty());
  }
}
