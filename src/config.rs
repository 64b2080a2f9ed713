//! Proxy configuration

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio_rustls::rustls::pki_types::CertificateDer;

/// Configuration for the intercepting proxy
#[derive(Clone, Debug)]
pub struct MitmConfig {
  /// PEM private key of the root CA
  pub ca_key_path: PathBuf,
  /// PEM certificate of the root CA
  pub ca_cert_path: PathBuf,
  /// Maximum size of a request or response head
  pub max_header_size: usize,
  /// Request bodies are buffered up to this size; larger ones get `413`
  pub max_request_body: usize,
  /// Idle deadline for reading the next request head on a connection
  pub read_timeout: Duration,
  /// Deadline for the client-side TLS handshake of an intercepted tunnel
  pub handshake_timeout: Duration,
  /// Deadline for dialing the origin, TLS included
  pub connect_timeout: Duration,
  /// Deadline for the origin's response head once the request is written
  pub upstream_timeout: Duration,
  /// Extra roots trusted when connecting to origins over TLS
  pub upstream_trust_anchors: Vec<CertificateDer<'static>>,
  /// Skip origin certificate verification entirely
  pub accept_invalid_upstream_certs: bool,
  /// `host:port` dial overrides, consulted before DNS
  pub upstream_overrides: HashMap<String, SocketAddr>,
  /// How long a correlation entry survives without being consumed
  pub correlation_ttl: Duration,
  /// Maximum number of in-flight correlation entries
  pub correlation_capacity: u64,
}

impl Default for MitmConfig {
  fn default() -> Self {
    Self {
      ca_key_path: PathBuf::from("./key"),
      ca_cert_path: PathBuf::from("./cert"),
      max_header_size: 64 * 1024,
      max_request_body: 16 * 1024 * 1024,
      read_timeout: Duration::from_secs(60),
      handshake_timeout: Duration::from_secs(10),
      connect_timeout: Duration::from_secs(10),
      upstream_timeout: Duration::from_secs(60),
      upstream_trust_anchors: Vec::new(),
      accept_invalid_upstream_certs: false,
      upstream_overrides: HashMap::new(),
      correlation_ttl: Duration::from_secs(300),
      correlation_capacity: 100_000,
    }
  }
}

impl MitmConfig {
  /// Route connections for `authority` (`host:port`) to `addr` instead of resolving it.
  pub fn override_upstream(mut self, authority: impl Into<String>, addr: SocketAddr) -> Self {
    self
      .upstream_overrides
      .insert(authority.into().to_ascii_lowercase(), addr);
    self
  }

  /// Trust `cert` as an additional root for origin connections.
  pub fn trust_upstream_root(mut self, cert: CertificateDer<'static>) -> Self {
    self.upstream_trust_anchors.push(cert);
    self
  }
}
