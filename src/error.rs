//! Error types for the intercepting proxy

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for proxy operations
#[derive(Error, Debug)]
pub enum Error {
  /// The root key or certificate could not be read or written
  #[error("CA I/O error at {}: {source}", .path.display())]
  CaIo {
    /// File that failed
    path: PathBuf,
    /// Underlying failure
    #[source]
    source: io::Error,
  },

  /// The root key or certificate on disk is corrupt
  #[error("CA parse error: {0}")]
  CaParse(String),

  /// Key generation or certificate signing failed
  #[error("CA sign error: {0}")]
  CaSign(String),

  /// The client-side MITM handshake failed
  #[error("TLS handshake failed: {0}")]
  Handshake(String),

  /// A body stream failed while being captured
  #[error("body read error: {0}")]
  BodyRead(#[source] io::Error),

  /// A body exceeded the capture limit
  #[error("body exceeds capture limit of {limit} bytes")]
  BodyTooLarge {
    /// Configured limit
    limit: usize,
  },

  /// A response was observed with no matching stored request
  #[error("correlation miss: {0}")]
  CorrelationMiss(String),

  /// IO error
  #[error("IO error: {0}")]
  Io(#[from] io::Error),

  /// HTTP construction error
  #[error("HTTP error: {0}")]
  Http(#[from] http::Error),

  /// Malformed or unsupported request from the client
  #[error("Invalid request: {0}")]
  InvalidRequest(String),

  /// The origin could not be reached or answered badly
  #[error("Upstream error: {0}")]
  Upstream(String),

  /// A deadline expired
  #[error("timed out: {0}")]
  Timeout(&'static str),

  /// The server was shut down on request
  #[error("server closed")]
  ServerClosed,
}

impl Error {
  /// Create a CA I/O error and log it
  pub fn ca_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
    let error = Error::CaIo {
      path: path.into(),
      source,
    };
    tracing::error!("{}", error);
    error
  }

  /// Create a CA parse error and log it
  pub fn ca_parse(msg: impl Into<String>) -> Self {
    let error = Error::CaParse(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a CA signing error and log it
  pub fn ca_sign(msg: impl Into<String>) -> Self {
    let error = Error::CaSign(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a handshake error and log it
  pub fn handshake(msg: impl Into<String>) -> Self {
    let error = Error::Handshake(msg.into());
    tracing::warn!("{}", error);
    error
  }

  /// Create a correlation miss and log it
  pub fn correlation_miss(msg: impl Into<String>) -> Self {
    let error = Error::CorrelationMiss(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create an invalid request error
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create an upstream error
  pub fn upstream(msg: impl Into<String>) -> Self {
    let error = Error::Upstream(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Whether this error only concerns the connection or request it happened on.
  ///
  /// Everything except CA failures and the server-level sentinel is isolated
  /// to one connection. CA failures are connection-scoped too once the root
  /// is loaded; callers of `load_or_create` treat them as fatal.
  pub fn is_connection_scoped(&self) -> bool {
    !matches!(
      self,
      Error::CaIo { .. } | Error::CaParse(_) | Error::ServerClosed
    )
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::uri::InvalidUri> for Error {
  fn from(value: http::uri::InvalidUri) -> Self {
    Error::Http(http::Error::from(value))
  }
}
