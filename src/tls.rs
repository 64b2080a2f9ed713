//! rustls configuration for both sides of an intercepted connection
use std::sync::Arc;

use tokio_rustls::rustls::{
  self,
  client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
  crypto::CryptoProvider,
  pki_types::{CertificateDer, ServerName, UnixTime},
  ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme,
};

use crate::ca::LeafCredential;
use crate::config::MitmConfig;
use crate::error::{Error, Result};

/// Only HTTP/1.1 is ever negotiated, on either side
pub(crate) const ALPN_HTTP11: &[u8] = b"http/1.1";

/// The process-wide provider if one is installed, ring otherwise
pub(crate) fn tls_provider() -> Arc<CryptoProvider> {
  CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, rustls::Error> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::RSA_PKCS1_SHA1,
      SignatureScheme::ECDSA_SHA1_Legacy,
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
      SignatureScheme::ED448,
    ]
  }
}

/// Client config for origin connections: native roots plus configured
/// anchors, or no verification at all when asked for
pub(crate) fn client_config(config: &MitmConfig) -> Result<ClientConfig> {
  let builder = ClientConfig::builder_with_provider(tls_provider())
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::upstream(format!("Failed to create TLS client config: {}", e)))?;

  let mut tls = if config.accept_invalid_upstream_certs {
    tracing::warn!("origin certificate verification is disabled");
    builder
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(NoVerifier))
      .with_no_client_auth()
  } else {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
      tracing::debug!("failed to load a native root: {}", err);
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    tracing::debug!(added, ignored, "loaded native roots");
    for anchor in &config.upstream_trust_anchors {
      roots
        .add(anchor.clone())
        .map_err(|e| Error::upstream(format!("Invalid upstream trust anchor: {}", e)))?;
    }
    builder.with_root_certificates(roots).with_no_client_auth()
  };
  tls.alpn_protocols = vec![ALPN_HTTP11.to_vec()];
  Ok(tls)
}

/// Server config presenting `leaf` to an intercepted client
pub(crate) fn server_config(leaf: &LeafCredential) -> Result<ServerConfig> {
  let mut config = ServerConfig::builder_with_provider(tls_provider())
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::handshake(format!("Failed to create TLS config: {}", e)))?
    .with_no_client_auth()
    .with_single_cert(leaf.chain(), leaf.private_key())
    .map_err(|e| Error::handshake(format!("Failed to create TLS config: {}", e)))?;
  config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];
  Ok(config)
}
