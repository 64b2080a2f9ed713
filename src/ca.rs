//! Certificate Authority (CA) management for the intercepting proxy
//!
//! The root key pair is loaded from (or generated into) two PEM files and
//! never changes afterwards. Leaf certificates are issued per hostname on
//! first interception and cached; concurrent first requests for the same
//! hostname share one signing operation.

use crate::error::{Error, Result};
use moka::future::Cache;
use rand::RngCore;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, PublicKeyData, SanType, SerialNumber,
};
use std::fmt;
use std::io::ErrorKind;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

/// Root validity period (10 years)
const ROOT_TTL_DAYS: i64 = 3650;
/// Leaf validity ceiling in seconds (1 year)
const LEAF_TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Cache time-to-live in seconds (half the leaf lifetime)
const CACHE_TTL: u64 = (LEAF_TTL_SECS / 2) as u64;
/// Maximum number of cached leaves
const CACHE_CAPACITY: u64 = 10_000;
/// Offset for not_before timestamp to handle clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;

/// The proxy's trust root.
///
/// The private half lives inside the authority's issuer and is never
/// handed out; this type carries what clients need to trust the root.
#[derive(Clone)]
pub struct RootCredential {
  certificate: CertificateDer<'static>,
  certificate_pem: String,
  public_key_der: Vec<u8>,
  not_after: OffsetDateTime,
}

impl RootCredential {
  /// Root certificate in DER form
  pub fn certificate(&self) -> &CertificateDer<'static> {
    &self.certificate
  }

  /// Root certificate in PEM form, for installing into client trust stores
  pub fn certificate_pem(&self) -> &str {
    &self.certificate_pem
  }

  /// SubjectPublicKeyInfo of the root key, DER encoded
  pub fn public_key_der(&self) -> &[u8] {
    &self.public_key_der
  }

  /// End of the root's validity window
  pub fn not_after(&self) -> OffsetDateTime {
    self.not_after
  }
}

impl fmt::Debug for RootCredential {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RootCredential")
      .field("not_after", &self.not_after)
      .finish_non_exhaustive()
  }
}

/// A host-specific certificate signed by the root.
pub struct LeafCredential {
  hostname: String,
  certificate: CertificateDer<'static>,
  private_key: PrivatePkcs8KeyDer<'static>,
  chain: Vec<CertificateDer<'static>>,
  not_after: OffsetDateTime,
}

impl LeafCredential {
  /// Hostname the certificate was issued for
  pub fn hostname(&self) -> &str {
    &self.hostname
  }

  /// Leaf certificate in DER form
  pub fn certificate(&self) -> &CertificateDer<'static> {
    &self.certificate
  }

  /// Certificate chain to serve: `[leaf, root]`
  pub fn chain(&self) -> Vec<CertificateDer<'static>> {
    self.chain.clone()
  }

  /// Leaf private key
  pub fn private_key(&self) -> PrivateKeyDer<'static> {
    PrivateKeyDer::Pkcs8(self.private_key.clone_key())
  }

  /// End of the leaf's validity window
  pub fn not_after(&self) -> OffsetDateTime {
    self.not_after
  }
}

impl fmt::Debug for LeafCredential {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LeafCredential")
      .field("hostname", &self.hostname)
      .field("not_after", &self.not_after)
      .finish_non_exhaustive()
  }
}

/// What was found on disk when loading the root
enum Stored {
  Usable(Issuer<'static, KeyPair>, RootCredential),
  Stale(&'static str),
}

/// Certificate Authority for issuing per-host certificates
pub struct CertificateAuthority {
  /// Root CA issuer
  issuer: Issuer<'static, KeyPair>,
  root: RootCredential,
  /// Issued leaves keyed by normalized hostname
  leaves: Cache<String, Arc<LeafCredential>>,
}

impl CertificateAuthority {
  /// Load the root from `key_path`/`cert_path`, or generate and persist a new one.
  ///
  /// Existing files are reused when both parse, the key matches the
  /// certificate, the certificate is a CA and it is currently valid. Missing,
  /// expired or mismatched files are overwritten with a fresh root. Files
  /// that exist but cannot be parsed are reported as [`Error::CaParse`]
  /// rather than silently replaced.
  pub async fn load_or_create(
    key_path: impl AsRef<Path>,
    cert_path: impl AsRef<Path>,
  ) -> Result<Self> {
    let key_path = key_path.as_ref();
    let cert_path = cert_path.as_ref();

    let key_pem = read_optional(key_path).await?;
    let cert_pem = read_optional(cert_path).await?;

    let (issuer, root) = match (key_pem, cert_pem) {
      (Some(key_pem), Some(cert_pem)) => match Self::load_root(&key_pem, &cert_pem)? {
        Stored::Usable(issuer, root) => {
          tracing::info!(cert = %cert_path.display(), "loaded root CA");
          (issuer, root)
        }
        Stored::Stale(reason) => {
          tracing::warn!(cert = %cert_path.display(), reason, "regenerating root CA");
          Self::generate_root(key_path, cert_path).await?
        }
      },
      _ => {
        tracing::info!(cert = %cert_path.display(), "no root CA on disk, generating one");
        Self::generate_root(key_path, cert_path).await?
      }
    };

    Ok(Self::from_parts(issuer, root))
  }

  fn from_parts(issuer: Issuer<'static, KeyPair>, root: RootCredential) -> Self {
    let leaves = Cache::builder()
      .max_capacity(CACHE_CAPACITY)
      .time_to_live(std::time::Duration::from_secs(CACHE_TTL))
      .build();
    Self {
      issuer,
      root,
      leaves,
    }
  }

  /// Parse a stored root
  fn load_root(key_pem: &str, cert_pem: &str) -> Result<Stored> {
    let key_pair = KeyPair::from_pem(key_pem)
      .map_err(|e| Error::ca_parse(format!("Failed to parse CA key: {}", e)))?;

    let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::ca_parse("No certificate found in PEM"))?
      .map_err(|e| Error::ca_parse(format!("Failed to parse PEM: {}", e)))?;

    let (_, cert) = x509_parser::parse_x509_certificate(cert_der.as_ref())
      .map_err(|e| Error::ca_parse(format!("Failed to parse CA certificate: {}", e)))?;

    let public_key_der = key_pair.subject_public_key_info();
    if cert.public_key().raw != public_key_der.as_slice() {
      return Ok(Stored::Stale("key does not match certificate"));
    }
    if !cert.is_ca() {
      return Ok(Stored::Stale("certificate is not a CA"));
    }
    if !cert.validity().is_valid() {
      return Ok(Stored::Stale("certificate is outside its validity window"));
    }
    let not_after = OffsetDateTime::from_unix_timestamp(cert.validity().not_after.timestamp())
      .map_err(|e| Error::ca_parse(format!("Invalid CA expiry: {}", e)))?;

    let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
      .map_err(|e| Error::ca_parse(format!("Failed to create issuer from CA cert: {}", e)))?;

    let root = RootCredential {
      certificate: CertificateDer::from(cert_der.to_vec()),
      certificate_pem: cert_pem.to_string(),
      public_key_der,
      not_after,
    };
    Ok(Stored::Usable(issuer, root))
  }

  /// Generate a new root and write it to disk, overwriting what is there
  async fn generate_root(
    key_path: &Path,
    cert_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, RootCredential)> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Interpose Proxy CA");
    dn.push(DnType::OrganizationName, "Interpose");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
      KeyUsagePurpose::KeyCertSign,
      KeyUsagePurpose::CrlSign,
      KeyUsagePurpose::DigitalSignature,
    ];
    params.serial_number = Some(next_serial());

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::days(ROOT_TTL_DAYS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::ca_sign(format!("Failed to generate key pair: {}", e)))?;

    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::ca_sign(format!("Failed to generate CA: {}", e)))?;

    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();

    write_pem(key_path, &key_pem, true).await?;
    write_pem(cert_path, &cert_pem, false).await?;

    let root = RootCredential {
      certificate: CertificateDer::from(cert.der().to_vec()),
      certificate_pem: cert_pem.clone(),
      public_key_der: key_pair.subject_public_key_info(),
      not_after: params.not_after,
    };

    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::ca_sign(format!("Failed to create issuer: {}", e)))?;

    Ok((issuer, root))
  }

  /// The root this authority signs with
  pub fn root(&self) -> &RootCredential {
    &self.root
  }

  /// Return the leaf for `hostname`, issuing it on first use.
  ///
  /// Only one issuance runs per hostname at a time; callers racing on a new
  /// hostname all receive the credential produced by the first of them.
  pub async fn issue_leaf(&self, hostname: &str) -> Result<Arc<LeafCredential>> {
    let hostname = normalize_hostname(hostname)?;
    self
      .leaves
      .try_get_with(hostname.clone(), async { self.sign_leaf(&hostname).map(Arc::new) })
      .await
      .map_err(|e| match &*e {
        Error::CaSign(msg) => Error::CaSign(msg.clone()),
        other => Error::CaSign(other.to_string()),
      })
  }

  /// Number of leaves currently cached
  pub fn cached_leaves(&self) -> u64 {
    self.leaves.entry_count()
  }

  fn sign_leaf(&self, hostname: &str) -> Result<LeafCredential> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(next_serial());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    params.distinguished_name = dn;

    params.subject_alt_names = vec![match hostname.parse::<IpAddr>() {
      Ok(ip) => SanType::IpAddress(ip),
      Err(_) => SanType::DnsName(
        hostname
          .try_into()
          .map_err(|_| Error::ca_sign(format!("Invalid domain name: {}", hostname)))?,
      ),
    }];
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.use_authority_key_identifier_extension = true;

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = std::cmp::min(now + Duration::seconds(LEAF_TTL_SECS), self.root.not_after);
    if params.not_after <= now {
      return Err(Error::ca_sign("root CA has expired"));
    }

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::ca_sign(format!("Failed to generate key pair: {}", e)))?;

    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::ca_sign(format!("Failed to sign server cert: {}", e)))?;

    let certificate = CertificateDer::from(cert.der().to_vec());
    tracing::debug!(host = hostname, "issued leaf certificate");

    Ok(LeafCredential {
      hostname: hostname.to_string(),
      chain: vec![certificate.clone(), self.root.certificate.clone()],
      certificate,
      private_key: PrivatePkcs8KeyDer::from(key_pair.serialize_der()),
      not_after: params.not_after,
    })
  }
}

impl fmt::Debug for CertificateAuthority {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CertificateAuthority")
      .field("root", &self.root)
      .field("cached_leaves", &self.leaves.entry_count())
      .finish()
  }
}

/// Lowercase, drop a trailing dot and IPv6 brackets
fn normalize_hostname(hostname: &str) -> Result<String> {
  let host = hostname.trim().trim_end_matches('.');
  let host = host
    .strip_prefix('[')
    .and_then(|h| h.strip_suffix(']'))
    .unwrap_or(host);
  if host.is_empty() {
    return Err(Error::ca_sign("empty hostname"));
  }
  Ok(host.to_ascii_lowercase())
}

/// Serial numbers are a random per-process prefix followed by a counter,
/// so no two certificates issued by one process share a serial.
fn next_serial() -> SerialNumber {
  static PREFIX: OnceLock<[u8; 8]> = OnceLock::new();
  static COUNTER: AtomicU64 = AtomicU64::new(1);

  let prefix = PREFIX.get_or_init(|| {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    // positive and of fixed length once DER encoded
    bytes[0] = (bytes[0] & 0x7f) | 0x40;
    bytes
  });
  let mut serial = [0u8; 16];
  serial[..8].copy_from_slice(prefix);
  serial[8..].copy_from_slice(&COUNTER.fetch_add(1, Ordering::Relaxed).to_be_bytes());
  SerialNumber::from_slice(&serial)
}

async fn read_optional(path: &Path) -> Result<Option<String>> {
  match fs::read_to_string(path).await {
    Ok(pem) => Ok(Some(pem)),
    Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
    Err(e) => Err(Error::ca_io(path, e)),
  }
}

async fn write_pem(path: &Path, pem: &str, private: bool) -> Result<()> {
  if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
    fs::create_dir_all(parent)
      .await
      .map_err(|e| Error::ca_io(parent, e))?;
  }
  fs::write(path, pem.as_bytes())
    .await
    .map_err(|e| Error::ca_io(path, e))?;
  if private {
    restrict_to_owner(path).await?;
  }
  Ok(())
}

#[cfg(unix)]
async fn restrict_to_owner(path: &Path) -> Result<()> {
  use std::os::unix::fs::PermissionsExt;
  fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
    .await
    .map_err(|e| Error::ca_io(path, e))
}

#[cfg(not(unix))]
async fn restrict_to_owner(_path: &Path) -> Result<()> {
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::path::PathBuf;
  use tokio_rustls::rustls::client::danger::ServerCertVerifier;
  use tokio_rustls::rustls::client::WebPkiServerVerifier;
  use tokio_rustls::rustls::pki_types::{ServerName, UnixTime};
  use tokio_rustls::rustls::RootCertStore;
  use x509_parser::extensions::GeneralName;

  fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("interpose-ca-{}-{}", name, std::process::id()));
    if dir.exists() {
      std::fs::remove_dir_all(&dir).ok();
    }
    dir
  }

  async fn authority(name: &str) -> (CertificateAuthority, PathBuf) {
    let dir = temp_dir(name);
    let ca = CertificateAuthority::load_or_create(dir.join("key"), dir.join("cert"))
      .await
      .unwrap();
    (ca, dir)
  }

  fn sans(der: &CertificateDer<'_>) -> Vec<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der.as_ref()).unwrap();
    let ext = cert.subject_alternative_name().unwrap().unwrap();
    ext
      .value
      .general_names
      .iter()
      .map(|name| match name {
        GeneralName::DNSName(dns) => dns.to_string(),
        GeneralName::IPAddress(ip) => match ip.len() {
          4 => IpAddr::from(<[u8; 4]>::try_from(*ip).unwrap()).to_string(),
          _ => IpAddr::from(<[u8; 16]>::try_from(*ip).unwrap()).to_string(),
        },
        other => format!("{:?}", other),
      })
      .collect()
  }

  #[tokio::test]
  async fn generates_and_persists_root() {
    let (ca, dir) = authority("generate").await;
    let key = std::fs::read_to_string(dir.join("key")).unwrap();
    let cert = std::fs::read_to_string(dir.join("cert")).unwrap();
    assert!(key.contains("BEGIN PRIVATE KEY"));
    assert!(cert.contains("BEGIN CERTIFICATE"));
    assert_eq!(cert, ca.root().certificate_pem());

    let root_der = ca.root().certificate().as_ref();
    let (_, parsed) = x509_parser::parse_x509_certificate(root_der).unwrap();
    assert!(parsed.is_ca());
    assert!(parsed.validity().is_valid());
    // a trust root lives for years
    assert!(ca.root().not_after() > OffsetDateTime::now_utc() + Duration::days(365 * 5));

    std::fs::remove_dir_all(&dir).ok();
  }

  #[tokio::test]
  async fn reload_returns_persisted_root() {
    let (first, dir) = authority("reload").await;
    let second = CertificateAuthority::load_or_create(dir.join("key"), dir.join("cert"))
      .await
      .unwrap();
    assert_eq!(first.root().public_key_der(), second.root().public_key_der());
    assert_eq!(first.root().certificate(), second.root().certificate());
    std::fs::remove_dir_all(&dir).ok();
  }

  #[tokio::test]
  async fn corrupt_key_is_a_parse_error() {
    let dir = temp_dir("corrupt");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("key"), "not a key").unwrap();
    std::fs::write(dir.join("cert"), "not a cert").unwrap();
    let result = CertificateAuthority::load_or_create(dir.join("key"), dir.join("cert")).await;
    assert!(matches!(result, Err(Error::CaParse(_))));
    // the operator's files are left alone
    assert_eq!(std::fs::read_to_string(dir.join("key")).unwrap(), "not a key");
    std::fs::remove_dir_all(&dir).ok();
  }

  #[tokio::test]
  async fn unwritable_path_is_an_io_error() {
    let dir = temp_dir("unwritable");
    std::fs::create_dir_all(&dir).unwrap();
    let blocker = dir.join("file");
    std::fs::write(&blocker, "x").unwrap();
    let result =
      CertificateAuthority::load_or_create(blocker.join("key"), blocker.join("cert")).await;
    assert!(matches!(result, Err(Error::CaIo { .. })));
    std::fs::remove_dir_all(&dir).ok();
  }

  #[tokio::test]
  async fn expired_root_is_replaced() {
    let dir = temp_dir("expired");
    std::fs::create_dir_all(&dir).unwrap();

    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.not_before = OffsetDateTime::now_utc() - Duration::days(30);
    params.not_after = OffsetDateTime::now_utc() - Duration::days(1);
    let key = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    std::fs::write(dir.join("key"), key.serialize_pem()).unwrap();
    std::fs::write(dir.join("cert"), cert.pem()).unwrap();

    let ca = CertificateAuthority::load_or_create(dir.join("key"), dir.join("cert"))
      .await
      .unwrap();
    assert_ne!(ca.root().public_key_der(), key.subject_public_key_info().as_slice());
    assert_eq!(
      std::fs::read_to_string(dir.join("cert")).unwrap(),
      ca.root().certificate_pem()
    );
    std::fs::remove_dir_all(&dir).ok();
  }

  #[tokio::test]
  async fn leaf_is_cached_and_names_exactly_the_host() {
    let (ca, dir) = authority("leaf").await;
    let first = ca.issue_leaf("example.test").await.unwrap();
    let second = ca.issue_leaf("example.test").await.unwrap();
    assert_eq!(first.certificate(), second.certificate());
    assert_eq!(sans(first.certificate()), vec!["example.test".to_string()]);
    assert_eq!(first.chain().len(), 2);
    assert!(first.not_after() <= ca.root().not_after());

    // normalization folds case and trailing dots onto the same entry
    let folded = ca.issue_leaf("Example.Test.").await.unwrap();
    assert_eq!(first.certificate(), folded.certificate());
    std::fs::remove_dir_all(&dir).ok();
  }

  #[tokio::test]
  async fn leaf_for_ip_and_wildcard() {
    let (ca, dir) = authority("leaf-forms").await;
    let ip = ca.issue_leaf("127.0.0.1").await.unwrap();
    assert_eq!(sans(ip.certificate()), vec!["127.0.0.1".to_string()]);
    let v6 = ca.issue_leaf("[::1]").await.unwrap();
    assert_eq!(sans(v6.certificate()), vec!["::1".to_string()]);
    let wildcard = ca.issue_leaf("*.example.test").await.unwrap();
    assert_eq!(sans(wildcard.certificate()), vec!["*.example.test".to_string()]);
    assert!(ca.issue_leaf("").await.is_err());
    std::fs::remove_dir_all(&dir).ok();
  }

  #[tokio::test]
  async fn failed_issuance_reports_the_signing_error_once() {
    let (ca, dir) = authority("leaf-invalid").await;
    let err = ca.issue_leaf("bücher.test").await.unwrap_err();
    assert!(matches!(err, Error::CaSign(_)));
    assert_eq!(err.to_string(), "CA sign error: Invalid domain name: bücher.test");
    assert_eq!(ca.cached_leaves(), 0);
    std::fs::remove_dir_all(&dir).ok();
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn concurrent_first_issuance_yields_one_leaf() {
    let (ca, dir) = authority("race").await;
    let ca = Arc::new(ca);
    let mut tasks = Vec::new();
    for _ in 0..16 {
      let ca = ca.clone();
      tasks.push(tokio::spawn(async move {
        ca.issue_leaf("race.example.test").await.unwrap()
      }));
    }
    let mut leaves = Vec::new();
    for task in tasks {
      leaves.push(task.await.unwrap());
    }
    for leaf in &leaves[1..] {
      assert_eq!(leaf.certificate(), leaves[0].certificate());
    }
    ca.leaves.run_pending_tasks().await;
    assert_eq!(ca.cached_leaves(), 1);
    std::fs::remove_dir_all(&dir).ok();
  }

  #[tokio::test]
  async fn leaf_verifies_against_root() {
    let (ca, dir) = authority("verify").await;
    let leaf = ca.issue_leaf("example.test").await.unwrap();

    let mut roots = RootCertStore::empty();
    roots.add(ca.root().certificate().clone()).unwrap();
    let provider = Arc::new(tokio_rustls::rustls::crypto::ring::default_provider());
    let verifier = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider)
      .build()
      .unwrap();
    let name = ServerName::try_from("example.test").unwrap();
    verifier
      .verify_server_cert(leaf.certificate(), &[], &name, &[], UnixTime::now())
      .unwrap();

    // a leaf from another authority does not chain to this root
    let (other, other_dir) = authority("verify-other").await;
    let foreign = other.issue_leaf("example.test").await.unwrap();
    assert!(verifier
      .verify_server_cert(foreign.certificate(), &[], &name, &[], UnixTime::now())
      .is_err());
    std::fs::remove_dir_all(&dir).ok();
    std::fs::remove_dir_all(&other_dir).ok();
  }
}
