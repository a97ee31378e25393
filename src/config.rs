//! Immutable proxy configuration
//!
use crate::buffer_pool::DEFAULT_BUFFER_SIZE;
use crate::certificate::SignerEngine;
use crate::compression::supported_encodings;
use crate::errors::Result;
use crate::proxy::ExternalProxy;
use crate::tls::{Certificate, Identity};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Settings of the certificate authority.
#[derive(Clone, Debug)]
pub struct CertificateConfig {
  pub(crate) issuer: String,
  pub(crate) root_name: String,
  pub(crate) valid_days: i64,
  pub(crate) cache_timeout: Duration,
  pub(crate) sweep_interval: Duration,
  pub(crate) disable_wildcard_certificates: bool,
  pub(crate) save_fake_certificates: bool,
  pub(crate) engine: SignerEngine,
  pub(crate) storage_path: Option<PathBuf>,
}

impl Default for CertificateConfig {
  fn default() -> Self {
    CertificateConfig {
      issuer: "T2".to_string(),
      root_name: "T2 Root Certification Authority".to_string(),
      valid_days: 365,
      cache_timeout: Duration::from_secs(60 * 60),
      sweep_interval: Duration::from_secs(60),
      disable_wildcard_certificates: false,
      save_fake_certificates: false,
      engine: SignerEngine::EcdsaP256,
      storage_path: None,
    }
  }
}

impl CertificateConfig {
  /// Organization written into every certificate.
  ///
  /// Default is `T2`.
  pub fn issuer(mut self, value: impl Into<String>) -> Self {
    self.issuer = value.into();
    self
  }
  /// Common name of the root.
  ///
  /// Default is `T2 Root Certification Authority`.
  pub fn root_name(mut self, value: impl Into<String>) -> Self {
    self.root_name = value.into();
    self
  }
  /// Validity of the root and of minted leaves.
  ///
  /// Default is 365 days.
  pub fn valid_days(mut self, value: i64) -> Self {
    self.valid_days = value;
    self
  }
  /// Idle time after which a cached leaf is evicted.
  ///
  /// Default is 60 minutes.
  pub fn cache_timeout(mut self, value: Duration) -> Self {
    self.cache_timeout = value;
    self
  }
  /// Period of the idle eviction sweep.
  ///
  /// Default is 60 seconds.
  pub fn sweep_interval(mut self, value: Duration) -> Self {
    self.sweep_interval = value;
    self
  }
  /// Mint one certificate per host instead of promoting to `*.domain`.
  ///
  /// Default is `false`.
  pub fn disable_wildcard_certificates(mut self, value: bool) -> Self {
    self.disable_wildcard_certificates = value;
    self
  }
  /// Persist minted leaves to the certificate cache.
  ///
  /// Default is `false`.
  pub fn save_fake_certificates(mut self, value: bool) -> Self {
    self.save_fake_certificates = value;
    self
  }
  /// Key algorithm used for the root and leaves.
  ///
  /// Default is [`SignerEngine::EcdsaP256`].
  pub fn engine(mut self, value: SignerEngine) -> Self {
    self.engine = value;
    self
  }
  /// Directory for the disk certificate cache. Without one nothing is stored.
  pub fn storage_path(mut self, value: impl Into<PathBuf>) -> Self {
    self.storage_path = Some(value.into());
    self
  }
  /// Whether minted leaves are promoted to wildcards.
  pub fn wildcard_enabled(&self) -> bool {
    !self.disable_wildcard_certificates
  }
}

/// Everything a [`crate::ProxyServer`] needs, fixed at construction.
#[derive(Clone)]
pub struct ProxyConfig {
  pub(crate) buffer_size: usize,
  pub(crate) decrypt_ssl: bool,
  pub(crate) enable_connection_pool: bool,
  pub(crate) max_cached_connections: usize,
  pub(crate) connection_timeout: Duration,
  pub(crate) connect_timeout: Duration,
  pub(crate) pool_sweep_interval: Duration,
  pub(crate) network_failure_retry_attempts: usize,
  pub(crate) upstream_proxy: Option<ExternalProxy>,
  pub(crate) upstream_endpoint: Option<SocketAddr>,
  pub(crate) nodelay: bool,
  pub(crate) enable_tcp_server_connection_prefetch: bool,
  pub(crate) authentication_realm: String,
  pub(crate) supported_encodings: Vec<String>,
  pub(crate) upstream_certs_verification: bool,
  pub(crate) root_certificates: Vec<Certificate>,
  pub(crate) client_identity: Option<Identity>,
  pub(crate) certificate: CertificateConfig,
  pub(crate) transparent_https_port: u16,
  pub(crate) transparent_certificate_name: String,
}

impl std::fmt::Debug for ProxyConfig {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ProxyConfig")
      .field("buffer_size", &self.buffer_size)
      .field("decrypt_ssl", &self.decrypt_ssl)
      .field("enable_connection_pool", &self.enable_connection_pool)
      .field("max_cached_connections", &self.max_cached_connections)
      .field("connection_timeout", &self.connection_timeout)
      .field("connect_timeout", &self.connect_timeout)
      .field("upstream_proxy", &self.upstream_proxy)
      .field("upstream_endpoint", &self.upstream_endpoint)
      .field("certificate", &self.certificate)
      .field("transparent_https_port", &self.transparent_https_port)
      .finish()
  }
}

impl Default for ProxyConfig {
  fn default() -> Self {
    ProxyConfig {
      buffer_size: DEFAULT_BUFFER_SIZE,
      decrypt_ssl: true,
      enable_connection_pool: true,
      max_cached_connections: 4,
      connection_timeout: Duration::from_secs(60),
      connect_timeout: Duration::from_secs(20),
      pool_sweep_interval: Duration::from_secs(3),
      network_failure_retry_attempts: 1,
      upstream_proxy: None,
      upstream_endpoint: None,
      nodelay: true,
      enable_tcp_server_connection_prefetch: true,
      authentication_realm: "T2Proxy".to_string(),
      supported_encodings: supported_encodings(),
      upstream_certs_verification: false,
      root_certificates: vec![],
      client_identity: None,
      certificate: CertificateConfig::default(),
      transparent_https_port: 443,
      transparent_certificate_name: "localhost".to_string(),
    }
  }
}

impl ProxyConfig {
  /// Start from the defaults.
  pub fn builder() -> ProxyConfigBuilder {
    ProxyConfigBuilder::default()
  }
  /// Size of every pooled read buffer, which is also the maximum lookahead.
  pub fn buffer_size(&self) -> usize {
    self.buffer_size
  }
  /// Whether tunnels are decrypted.
  pub fn decrypt_ssl(&self) -> bool {
    self.decrypt_ssl
  }
  /// Whether upstream connections are reused.
  pub fn enable_connection_pool(&self) -> bool {
    self.enable_connection_pool
  }
  /// Pooled connections kept per cache key.
  pub fn max_cached_connections(&self) -> usize {
    self.max_cached_connections
  }
  /// Idle timeout of pooled connections.
  pub fn connection_timeout(&self) -> Duration {
    self.connection_timeout
  }
  /// Timeout of a single TCP connect.
  pub fn connect_timeout(&self) -> Duration {
    self.connect_timeout
  }
  /// Retries after a network failure. Total attempts are one more.
  pub fn network_failure_retry_attempts(&self) -> usize {
    self.network_failure_retry_attempts
  }
  /// Proxy every upstream connection goes through.
  pub fn upstream_proxy(&self) -> Option<&ExternalProxy> {
    self.upstream_proxy.as_ref()
  }
  /// Local address upstream sockets bind to.
  pub fn upstream_endpoint(&self) -> Option<SocketAddr> {
    self.upstream_endpoint
  }
  /// Realm sent in Basic challenges.
  pub fn authentication_realm(&self) -> &str {
    &self.authentication_realm
  }
  /// Encodings left in `Accept-Encoding`.
  pub fn supported_encodings(&self) -> &[String] {
    &self.supported_encodings
  }
  /// Certificate authority settings.
  pub fn certificate(&self) -> &CertificateConfig {
    &self.certificate
  }
  /// Upstream port of TLS connections accepted transparently.
  pub fn transparent_https_port(&self) -> u16 {
    self.transparent_https_port
  }
  /// Certificate subject for transparent clients that send no SNI.
  pub fn transparent_certificate_name(&self) -> &str {
    &self.transparent_certificate_name
  }
}

/// Builder for [`ProxyConfig`].
#[derive(Default)]
pub struct ProxyConfigBuilder {
  config: ProxyConfig,
}

impl ProxyConfigBuilder {
  /// Size of the pooled read buffers.
  ///
  /// Default is 8192.
  pub fn buffer_size(mut self, value: usize) -> Self {
    self.config.buffer_size = value;
    self
  }
  /// Decrypt CONNECT tunnels carrying TLS.
  ///
  /// Default is `true`.
  pub fn decrypt_ssl(mut self, value: bool) -> Self {
    self.config.decrypt_ssl = value;
    self
  }
  /// Reuse upstream connections across sessions.
  ///
  /// Default is `true`.
  pub fn enable_connection_pool(mut self, value: bool) -> Self {
    self.config.enable_connection_pool = value;
    self
  }
  /// Pooled connections kept per cache key.
  ///
  /// Default is 4.
  pub fn max_cached_connections(mut self, value: usize) -> Self {
    self.config.max_cached_connections = value;
    self
  }
  /// Idle timeout of pooled connections.
  ///
  /// Default is 60 seconds.
  pub fn connection_timeout(mut self, value: Duration) -> Self {
    self.config.connection_timeout = value;
    self
  }
  /// Set a timeout for the connect phase of each upstream candidate.
  ///
  /// Default is 20 seconds.
  pub fn connect_timeout(mut self, value: Duration) -> Self {
    self.config.connect_timeout = value;
    self
  }
  /// Period of the pool idle sweep.
  ///
  /// Default is 3 seconds.
  pub fn pool_sweep_interval(mut self, value: Duration) -> Self {
    self.config.pool_sweep_interval = value;
    self
  }
  /// Retries after a network failure on a stale connection.
  ///
  /// Default is 1.
  pub fn network_failure_retry_attempts(mut self, value: usize) -> Self {
    self.config.network_failure_retry_attempts = value;
    self
  }
  /// Send every upstream connection through an external proxy.
  pub fn upstream_proxy(mut self, value: Option<ExternalProxy>) -> Self {
    self.config.upstream_proxy = value;
    self
  }
  /// Bind upstream sockets to this local address.
  pub fn upstream_endpoint(mut self, value: Option<SocketAddr>) -> Self {
    self.config.upstream_endpoint = value;
    self
  }
  /// Set `TCP_NODELAY` on upstream sockets.
  ///
  /// Default is `true`.
  pub fn nodelay(mut self, value: bool) -> Self {
    self.config.nodelay = value;
    self
  }
  /// Open the upstream connection while the client handshake is running.
  ///
  /// Default is `true`.
  pub fn enable_tcp_server_connection_prefetch(mut self, value: bool) -> Self {
    self.config.enable_tcp_server_connection_prefetch = value;
    self
  }
  /// Realm sent in Basic challenges.
  ///
  /// Default is `T2Proxy`.
  pub fn authentication_realm(mut self, value: impl Into<String>) -> Self {
    self.config.authentication_realm = value.into();
    self
  }
  /// Encodings the proxy can decode for inspection.
  ///
  /// Default is gzip and deflate when the `gzip` feature is on.
  pub fn supported_encodings(mut self, value: Vec<String>) -> Self {
    self.config.supported_encodings = value;
    self
  }
  /// Verify upstream certificates against the trust anchors.
  ///
  /// Default is `false`.
  pub fn upstream_certs_verification(mut self, value: bool) -> Self {
    self.config.upstream_certs_verification = value;
    self
  }
  /// Extra trust anchors for upstream verification.
  pub fn root_certificates(mut self, value: Vec<Certificate>) -> Self {
    self.config.root_certificates = value;
    self
  }
  /// Client certificate offered to upstream servers.
  pub fn client_identity(mut self, value: Option<Identity>) -> Self {
    self.config.client_identity = value;
    self
  }
  /// Certificate authority settings.
  pub fn certificate(mut self, value: CertificateConfig) -> Self {
    self.config.certificate = value;
    self
  }
  /// Port TLS connections accepted on a transparent endpoint are forwarded
  /// to. The host comes from the ClientHello SNI.
  ///
  /// Default is 443.
  pub fn transparent_https_port(mut self, value: u16) -> Self {
    self.config.transparent_https_port = value;
    self
  }
  /// Name the leaf is minted for when a transparent client sends no SNI.
  ///
  /// Default is `localhost`.
  pub fn transparent_certificate_name(mut self, value: impl Into<String>) -> Self {
    self.config.transparent_certificate_name = value.into();
    self
  }
  /// Validate and freeze the configuration.
  pub fn build(self) -> Result<ProxyConfig> {
    if self.config.buffer_size < 64 {
      return Err(crate::errors::builder("buffer size too small"));
    }
    if self.config.certificate.valid_days <= 0 {
      return Err(crate::errors::builder("certificate validity must be positive"));
    }
    Ok(self.config)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults() {
    let config = ProxyConfig::builder().build().unwrap();
    assert_eq!(config.buffer_size(), 8192);
    assert!(config.decrypt_ssl());
    assert_eq!(config.max_cached_connections(), 4);
    assert_eq!(config.connect_timeout(), Duration::from_secs(20));
    assert_eq!(config.connection_timeout(), Duration::from_secs(60));
    assert_eq!(config.network_failure_retry_attempts(), 1);
    assert_eq!(config.authentication_realm(), "T2Proxy");
    assert_eq!(config.certificate().root_name, "T2 Root Certification Authority");
    assert!(config.certificate().wildcard_enabled());
    assert_eq!(config.transparent_https_port(), 443);
    assert_eq!(config.transparent_certificate_name(), "localhost");
  }

  #[test]
  fn tiny_buffer_is_rejected() {
    assert!(ProxyConfig::builder().buffer_size(8).build().is_err());
  }
}
