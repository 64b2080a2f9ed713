#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]
//! # interpose
//!
//! A TLS-intercepting HTTP/1.1 forward proxy with composable request and
//! response modifiers.
//!
//! Clients point at the proxy as their HTTP proxy. Plain requests arrive in
//! absolute form and are forwarded directly; `CONNECT` tunnels are
//! answered, terminated with a leaf certificate issued on the fly by a local
//! [`CertificateAuthority`], and the decrypted requests are forwarded to the
//! origin over a fresh TLS connection.
//!
//! Every request runs through a chain of request modifiers and every
//! response through a chain of response modifiers. A modifier receives the
//! next handler and returns a new one, so it can inspect, rewrite,
//! short-circuit or fail the exchange.
//!
//! ## Features
//!
//! - Root CA loaded from disk or generated and persisted on first run
//! - Per-host leaf certificates, cached and issued once per host under concurrency
//! - Onion-style request and response modifier chains
//! - Request/response correlation with a TTL-bounded store
//! - Streaming response bodies with chunked and close-delimited framing
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use interpose::{MitmConfig, MitmProxy, ProxyServer, RequestLog};
//!
//! #[tokio::main]
//! async fn main() -> interpose::Result<()> {
//!   let mut proxy = MitmProxy::from_config(MitmConfig::default()).await?;
//!   RequestLog::new(proxy.correlation_store()).install(&mut proxy);
//!
//!   let server = ProxyServer::bind("127.0.0.1:8080", Arc::new(proxy)).await?;
//!   server
//!     .serve(async {
//!       tokio::signal::ctrl_c().await.ok();
//!     })
//!     .await
//! }
//! ```
//!
//! ## Modifiers
//!
//! ```
//! use http::{Request, Response};
//! use interpose::{handler_fn, Body, RequestHandler};
//!
//! fn tag_requests(next: RequestHandler) -> RequestHandler {
//!   handler_fn(move |mut req: Request<Body>| {
//!     let next = next.clone();
//!     async move {
//!       req.headers_mut().insert("x-intercepted", "1".parse()?);
//!       next(req).await
//!     }
//!   })
//! }
//! # let _ = tag_requests;
//! ```

pub mod body;
pub mod ca;
mod codec;
pub mod config;
pub mod correlation;
pub mod error;
pub mod modifier;
pub mod proxy;
pub mod reqlog;
pub mod server;
mod socket;
mod tls;
pub mod upstream;

pub use body::Body;
pub use ca::{CertificateAuthority, LeafCredential, RootCredential};
pub use config::MitmConfig;
pub use correlation::{
  ClientInfo, CorrelationId, CorrelationStore, ForwardedRequest, LogBypassed, RequestSnapshot,
  TransactionExt,
};
pub use error::{Error, Result};
pub use modifier::{handler_fn, Handler, Modifier, ModifierChain, RequestHandler, ResponseHandler};
pub use proxy::MitmProxy;
pub use reqlog::{LoggedExchange, RequestLog};
pub use server::ProxyServer;
pub use upstream::Upstream;
