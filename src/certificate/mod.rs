//! Certificate authority for intercepting TLS
//!
//! A root is loaded from (or written to) a [`CertificateCache`] and leaves are
//! minted on demand for every intercepted host. Leaves live in an in-memory
//! cache with single-flight creation, so a burst of tunnels to the same host
//! signs exactly one certificate.
//!
mod engine;
mod store;

pub use engine::{Minted, SignerEngine, Validity};
pub use store::{CertificateCache, DiskCertificateCache, NoopCertificateCache};

use crate::config::CertificateConfig;
use crate::errors::{default_exception_handler, Error, ExceptionHandler, Result};
use moka::future::Cache;
use rcgen::{Issuer, KeyPair};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use time::{Duration, OffsetDateTime};
use tokio_rustls::rustls;
use tokio_rustls::rustls::ServerConfig;
use tokio_util::sync::CancellationToken;

/// Offset for the leaf not_before to handle clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;
/// Grace period in the past for the root
const ROOT_GRACE_DAYS: i64 = 1;
const MAX_CACHED_CERTIFICATES: u64 = 10_000;

fn pem_section(container: &str, label: &str) -> Option<String> {
  let begin = format!("-----BEGIN {}-----", label);
  let end = format!("-----END {}-----", label);
  let start = container.find(&begin)?;
  let stop = container[start..].find(&end)? + start + end.len();
  Some(format!("{}\n", &container[start..stop]))
}

fn first_certificate_der(pem: &str) -> Result<CertificateDer<'static>> {
  rustls_pemfile::certs(&mut pem.as_bytes())
    .next()
    .ok_or_else(|| Error::certificate("No certificate found in PEM"))?
    .map_err(|e| Error::certificate(format!("Failed to parse PEM: {}", e)))
}

fn not_after_of(cert_pem: &str) -> Result<OffsetDateTime> {
  let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
    .map_err(|e| Error::certificate(format!("Failed to parse PEM: {}", e)))?;
  let cert = pem
    .parse_x509()
    .map_err(|e| Error::certificate(format!("Failed to parse certificate: {}", e)))?;
  Ok(cert.validity().not_after.to_datetime())
}

/// The signing root.
pub struct RootAuthority {
  issuer: Issuer<'static, KeyPair>,
  der: CertificateDer<'static>,
  cert_pem: String,
  key_pem: String,
  not_after: OffsetDateTime,
}

impl Debug for RootAuthority {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RootAuthority")
      .field("not_after", &self.not_after)
      .finish()
  }
}

impl RootAuthority {
  fn from_minted(minted: Minted) -> Result<Self> {
    let key_pem = minted.key_pair.serialize_pem();
    let issuer = Issuer::from_ca_cert_pem(&minted.pem, minted.key_pair)?;
    Ok(RootAuthority {
      issuer,
      der: minted.der,
      cert_pem: minted.pem,
      key_pem,
      not_after: minted.not_after,
    })
  }

  /// Parse a PEM container holding the certificate and its private key.
  pub fn from_pem(container: &str) -> Result<Self> {
    let cert_pem = pem_section(container, "CERTIFICATE")
      .ok_or_else(|| Error::certificate("No certificate found in root PEM"))?;
    let key_pem = pem_section(container, "PRIVATE KEY")
      .ok_or_else(|| Error::certificate("No private key found in root PEM"))?;
    let key_pair = KeyPair::from_pem(&key_pem)
      .map_err(|e| Error::certificate(format!("Failed to parse CA key: {}", e)))?;
    let not_after = not_after_of(&cert_pem)?;
    let der = first_certificate_der(&cert_pem)?;
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::certificate(format!("Failed to create issuer from CA cert: {}", e)))?;
    Ok(RootAuthority {
      issuer,
      der,
      cert_pem,
      key_pem,
      not_after,
    })
  }

  /// Certificate followed by key, the stored form.
  pub fn pem_container(&self) -> String {
    format!("{}{}", self.cert_pem, self.key_pem)
  }
  /// Certificate in PEM, for installing on clients.
  pub fn certificate_pem(&self) -> &str {
    &self.cert_pem
  }
  /// Certificate in DER.
  pub fn certificate_der(&self) -> &CertificateDer<'static> {
    &self.der
  }
  /// End of validity.
  pub fn not_after(&self) -> OffsetDateTime {
    self.not_after
  }
}

/// A minted server certificate with its chain and key.
pub struct CertifiedLeaf {
  name: String,
  chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
  cert_pem: String,
  key_pem: String,
  not_after: OffsetDateTime,
}

impl Debug for CertifiedLeaf {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CertifiedLeaf")
      .field("name", &self.name)
      .field("not_after", &self.not_after)
      .finish()
  }
}

impl CertifiedLeaf {
  fn from_minted(name: &str, minted: Minted, root: &RootAuthority) -> Result<Self> {
    let key = PrivateKeyDer::try_from(minted.key_pair.serialize_der())
      .map_err(|_| Error::certificate("Failed to serialize server key"))?;
    Ok(CertifiedLeaf {
      name: name.to_string(),
      chain: vec![minted.der, root.der.clone()],
      key,
      cert_pem: minted.pem,
      key_pem: minted.key_pair.serialize_pem(),
      not_after: minted.not_after,
    })
  }

  fn from_pem(name: &str, container: &str, root: &RootAuthority) -> Result<Self> {
    let cert_pem = pem_section(container, "CERTIFICATE")
      .ok_or_else(|| Error::certificate(format!("No certificate stored for {}", name)))?;
    let key_pem = pem_section(container, "PRIVATE KEY")
      .ok_or_else(|| Error::certificate(format!("No private key stored for {}", name)))?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())?
      .ok_or_else(|| Error::certificate(format!("No private key stored for {}", name)))?;
    Ok(CertifiedLeaf {
      name: name.to_string(),
      chain: vec![first_certificate_der(&cert_pem)?, root.der.clone()],
      key,
      not_after: not_after_of(&cert_pem)?,
      cert_pem,
      key_pem,
    })
  }

  /// Subject the leaf was minted for, possibly a wildcard.
  pub fn name(&self) -> &str {
    &self.name
  }
  /// `[leaf, root]`.
  pub fn chain(&self) -> &[CertificateDer<'static>] {
    &self.chain
  }
  /// A copy of the private key.
  pub fn key(&self) -> PrivateKeyDer<'static> {
    self.key.clone_key()
  }
  /// End of validity.
  pub fn not_after(&self) -> OffsetDateTime {
    self.not_after
  }
  /// Whether `not_after` has passed.
  pub fn is_expired(&self) -> bool {
    self.not_after <= OffsetDateTime::now_utc()
  }
  /// Certificate followed by key, the stored form.
  pub fn pem_container(&self) -> String {
    format!("{}{}", self.cert_pem, self.key_pem)
  }
}

/// The name a certificate is minted for when `host` is intercepted.
///
/// `foo.example.com` becomes `*.example.com`. IP literals and two-label names
/// stay as they are. So does a name whose first label has a hyphen, or whose
/// second label is at most 3 characters unless the first label is `www`
/// (`shop.co.uk` stays, `www.abc.com` becomes `*.abc.com`).
pub fn wildcard_domain_name(host: &str, disable_wildcard: bool) -> String {
  if host.parse::<IpAddr>().is_ok() || disable_wildcard {
    return host.to_string();
  }
  let labels: Vec<&str> = host.split('.').collect();
  if labels.len() > 2 {
    if labels[0] != "www" && labels[1].len() <= 3 {
      return host.to_string();
    }
    if labels[0].contains('-') {
      return host.to_string();
    }
    if let Some((_, rest)) = host.split_once('.') {
      return format!("*.{}", rest);
    }
  }
  host.to_string()
}

struct ManagerInner {
  config: CertificateConfig,
  root: RootAuthority,
  cache: Cache<String, Arc<CertifiedLeaf>>,
  store: Arc<dyn CertificateCache>,
  save_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
  exception_handler: ExceptionHandler,
  sweeper: CancellationToken,
}

impl Drop for ManagerInner {
  fn drop(&mut self) {
    self.sweeper.cancel();
  }
}

/// Mints, caches and persists server certificates.
#[derive(Clone)]
pub struct CertificateManager {
  inner: Arc<ManagerInner>,
}

impl Debug for CertificateManager {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CertificateManager")
      .field("root", &self.inner.root)
      .field("cached", &self.inner.cache.entry_count())
      .finish()
  }
}

impl CertificateManager {
  /// Create a manager storing to `storage_path` when one is configured.
  pub async fn new(config: CertificateConfig) -> Result<Self> {
    let store: Arc<dyn CertificateCache> = match &config.storage_path {
      Some(path) => Arc::new(DiskCertificateCache::new(path.clone())),
      None => Arc::new(NoopCertificateCache),
    };
    Self::with_store(config, store, default_exception_handler()).await
  }

  /// Create a manager over an explicit store and error sink.
  pub async fn with_store(
    config: CertificateConfig,
    store: Arc<dyn CertificateCache>,
    exception_handler: ExceptionHandler,
  ) -> Result<Self> {
    let root = load_or_create_root(&config, store.as_ref(), &exception_handler).await?;
    let cache = Cache::builder()
      .max_capacity(MAX_CACHED_CERTIFICATES)
      .time_to_idle(config.cache_timeout)
      .build();
    Ok(CertificateManager {
      inner: Arc::new(ManagerInner {
        config,
        root,
        cache,
        store,
        save_locks: Mutex::new(HashMap::new()),
        exception_handler,
        sweeper: CancellationToken::new(),
      }),
    })
  }

  /// The signing root.
  pub fn root(&self) -> &RootAuthority {
    &self.inner.root
  }

  /// Root certificate in PEM for client installation.
  pub fn root_certificate_pem(&self) -> String {
    self.inner.root.cert_pem.clone()
  }

  /// Normalized, wildcard-promoted subject for `host`.
  pub fn subject_name(&self, host: &str) -> String {
    let host = host
      .trim()
      .trim_end_matches('.')
      .trim_start_matches('[')
      .trim_end_matches(']')
      .to_ascii_lowercase();
    wildcard_domain_name(&host, self.inner.config.disable_wildcard_certificates)
  }

  /// A certificate valid for `host`, from cache or freshly minted.
  ///
  /// Concurrent callers for the same subject share one creation.
  pub async fn server_certificate(&self, host: &str) -> Result<Arc<CertifiedLeaf>> {
    let subject = self.subject_name(host);
    if let Some(leaf) = self.inner.cache.get(&subject).await {
      if !leaf.is_expired() {
        return Ok(leaf);
      }
      tracing::debug!("cached certificate for {} expired", subject);
      self.inner.cache.invalidate(&subject).await;
    }
    let inner = self.inner.clone();
    let name = subject.clone();
    self
      .inner
      .cache
      .try_get_with(subject, async move { ManagerInner::create(&inner, &name).await })
      .await
      .map_err(|e| Error::Certificate(e.to_string()))
  }

  /// Server side TLS configuration presenting a leaf for `host`.
  pub async fn tls_server_config(&self, host: &str) -> Result<Arc<ServerConfig>> {
    let leaf = self.server_certificate(host).await?;
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
      .with_safe_default_protocol_versions()?
      .with_no_client_auth()
      .with_single_cert(leaf.chain().to_vec(), leaf.key())?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
  }

  /// Number of cached leaves, after applying pending evictions.
  pub async fn cached_count(&self) -> u64 {
    self.inner.cache.run_pending_tasks().await;
    self.inner.cache.entry_count()
  }

  /// Drop every cached leaf.
  pub async fn clear_cache(&self) {
    self.inner.cache.invalidate_all();
    self.inner.cache.run_pending_tasks().await;
  }

  /// Spawn the idle eviction loop.
  pub fn start_sweeper(&self) {
    let cache = self.inner.cache.clone();
    let token = self.inner.sweeper.clone();
    let interval = self.inner.config.sweep_interval;
    tokio::spawn(async move {
      loop {
        tokio::select! {
          _ = token.cancelled() => break,
          _ = tokio::time::sleep(interval) => {
            cache.run_pending_tasks().await;
            tracing::debug!("certificate cache swept, {} entries left", cache.entry_count());
          }
        }
      }
    });
  }

  /// Stop the idle eviction loop.
  pub fn stop(&self) {
    self.inner.sweeper.cancel();
  }
}

impl ManagerInner {
  async fn create(self: &Arc<Self>, subject: &str) -> Result<Arc<CertifiedLeaf>> {
    if self.config.save_fake_certificates {
      match self.store.load_leaf(subject).await {
        Ok(Some(pem)) => match CertifiedLeaf::from_pem(subject, &pem, &self.root) {
          Ok(leaf) if !leaf.is_expired() => return Ok(Arc::new(leaf)),
          Ok(_) => (self.exception_handler)(&Error::Certificate(format!(
            "stored certificate for {} expired, minting a new one",
            subject
          ))),
          Err(e) => (self.exception_handler)(&e),
        },
        Ok(None) => {}
        Err(e) => (self.exception_handler)(&e),
      }
    }
    let validity = Validity::days_from_now(
      self.config.valid_days,
      Duration::seconds(NOT_BEFORE_OFFSET),
    );
    let minted = self.config.engine.mint(
      subject,
      &self.config.issuer,
      Some(&self.root.issuer),
      validity,
    )?;
    let leaf = Arc::new(CertifiedLeaf::from_minted(subject, minted, &self.root)?);
    tracing::debug!("minted certificate for {}", subject);
    if self.config.save_fake_certificates {
      self.persist(leaf.clone());
    }
    Ok(leaf)
  }

  fn save_lock(&self, subject: &str) -> Arc<tokio::sync::Mutex<()>> {
    let mut locks = self.save_locks.lock().unwrap_or_else(|e| e.into_inner());
    locks.entry(subject.to_string()).or_default().clone()
  }

  // 没有其他写入者在等时删掉这把锁
  fn release_save_lock(&self, subject: &str, lock: Arc<tokio::sync::Mutex<()>>) {
    let mut locks = self.save_locks.lock().unwrap_or_else(|e| e.into_inner());
    if Arc::strong_count(&lock) == 2 {
      locks.remove(subject);
    }
  }

  fn persist(self: &Arc<Self>, leaf: Arc<CertifiedLeaf>) {
    let inner = self.clone();
    tokio::spawn(async move {
      let lock = inner.save_lock(leaf.name());
      {
        let _guard = lock.lock().await;
        if let Err(e) = inner.store.save_leaf(leaf.name(), &leaf.pem_container()).await {
          tracing::warn!("failed to save certificate for {}: {}", leaf.name(), e);
          (inner.exception_handler)(&e);
        }
      }
      inner.release_save_lock(leaf.name(), lock);
    });
  }
}

async fn load_or_create_root(
  config: &CertificateConfig,
  store: &dyn CertificateCache,
  exception_handler: &ExceptionHandler,
) -> Result<RootAuthority> {
  match store.load_root().await {
    Ok(Some(pem)) => match RootAuthority::from_pem(&pem) {
      Ok(root) if root.not_after > OffsetDateTime::now_utc() => return Ok(root),
      Ok(_) => tracing::warn!("stored root certificate expired, generating a new one"),
      Err(e) => exception_handler(&e),
    },
    Ok(None) => {}
    Err(e) => exception_handler(&e),
  }
  let validity = Validity::days_from_now(config.valid_days, Duration::days(ROOT_GRACE_DAYS));
  let minted = config
    .engine
    .mint(&config.root_name, &config.issuer, None, validity)?;
  let root = RootAuthority::from_minted(minted)?;
  tracing::debug!("generated root certificate {}", config.root_name);
  // 旧的叶子证书都是旧根签的
  if let Err(e) = store.clear().await {
    tracing::warn!("failed to clear certificate store: {}", e);
    exception_handler(&e);
  }
  if let Err(e) = store.save_root(&root.pem_container()).await {
    tracing::warn!("failed to save root certificate: {}", e);
    exception_handler(&e);
  }
  Ok(root)
}
