//! Upstream connection factory
//!
//! Resolves, connects, optionally tunnels through the external proxy and
//! finally upgrades to TLS. The pool calls [`Connector::connect`] on a miss.
use crate::config::ProxyConfig;
use crate::errors::{new_io_error, Error, Result};
use crate::proxy::ExternalProxy;
use crate::socket::MaybeTlsStream;
use crate::tls::TlsClientSettings;
use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::AlertDescription;
use tokio_rustls::TlsConnector;

/// Where an upstream connection goes and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
  /// Destination host name or IP literal.
  pub host: String,
  /// Destination port.
  pub port: u16,
  /// Whether to run a client TLS handshake.
  pub is_https: bool,
  /// ALPN protocols to offer.
  pub alpn: Vec<Vec<u8>>,
  /// External proxy chosen for this target instead of the configured one.
  pub proxy: Option<ExternalProxy>,
}

impl UpstreamTarget {
  /// A target offering `http/1.1` when TLS is used.
  pub fn new(host: impl Into<String>, port: u16, is_https: bool) -> Self {
    UpstreamTarget {
      host: host.into(),
      port,
      is_https,
      alpn: if is_https {
        vec![b"http/1.1".to_vec()]
      } else {
        Vec::new()
      },
      proxy: None,
    }
  }
  /// A raw TCP target for tunnel relay.
  pub fn raw(host: impl Into<String>, port: u16) -> Self {
    UpstreamTarget {
      host: host.into(),
      port,
      is_https: false,
      alpn: Vec::new(),
      proxy: None,
    }
  }
  /// Go through `proxy` instead of the configured upstream proxy.
  pub fn via(mut self, proxy: Option<ExternalProxy>) -> Self {
    self.proxy = proxy;
    self
  }
}

/// Opens upstream connections.
#[derive(Clone)]
pub struct Connector {
  connect_timeout: Duration,
  nodelay: bool,
  upstream_endpoint: Option<SocketAddr>,
  proxy: Option<ExternalProxy>,
  tls: TlsClientSettings,
}

impl std::fmt::Debug for Connector {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Connector")
      .field("connect_timeout", &self.connect_timeout)
      .field("nodelay", &self.nodelay)
      .field("upstream_endpoint", &self.upstream_endpoint)
      .field("proxy", &self.proxy)
      .finish()
  }
}

impl Connector {
  /// A connector for `config`, using `tls` for the client handshake.
  pub fn new(config: &ProxyConfig, tls: TlsClientSettings) -> Self {
    Connector {
      connect_timeout: config.connect_timeout(),
      nodelay: config.nodelay,
      upstream_endpoint: config.upstream_endpoint(),
      proxy: config.upstream_proxy().cloned(),
      tls,
    }
  }

  /// Local address upstream sockets bind to.
  pub fn upstream_endpoint(&self) -> Option<SocketAddr> {
    self.upstream_endpoint
  }

  /// The external proxy used for `host`, if any.
  pub fn proxy_for(&self, host: &str) -> Option<&ExternalProxy> {
    self.proxy.as_ref().filter(|p| !p.bypasses(host))
  }

  /// The external proxy `target` goes through. A per-target proxy wins over
  /// the configured one, both honour the localhost bypass.
  pub fn proxy_for_target<'a>(&'a self, target: &'a UpstreamTarget) -> Option<&'a ExternalProxy> {
    match &target.proxy {
      Some(proxy) => Some(proxy).filter(|p| !p.bypasses(&target.host)),
      None => self.proxy_for(&target.host),
    }
  }

  /// Connect to `target`.
  ///
  /// A handshake the server rejected for its version or parameters is
  /// retried once on a fresh socket, restricted to TLS 1.2. Certificate and
  /// transport failures are returned as they are.
  pub async fn connect(&self, target: &UpstreamTarget) -> Result<MaybeTlsStream> {
    let tcp = self.open_tunnel(target).await?;
    if !target.is_https {
      return Ok(MaybeTlsStream::Tcp(tcp));
    }
    match self.upgrade_to_tls(tcp, target, false).await {
      Ok(stream) => Ok(stream),
      Err(err) if is_version_mismatch(&err) => {
        tracing::debug!(
          "tls handshake with {}:{} failed, retrying with TLS 1.2: {}",
          target.host,
          target.port,
          err
        );
        let tcp = self.open_tunnel(target).await?;
        self.upgrade_to_tls(tcp, target, true).await
      }
      Err(err) => Err(err),
    }
  }

  // 连接目标或代理，必要时完成代理协商
  async fn open_tunnel(&self, target: &UpstreamTarget) -> Result<TcpStream> {
    match self.proxy_for_target(target) {
      None => self.connect_host(&target.host, target.port).await,
      Some(proxy) => {
        let mut tcp = self.connect_host(proxy.host(), proxy.port()).await?;
        proxy.negotiate(&mut tcp, &target.host, target.port).await?;
        Ok(tcp)
      }
    }
  }

  /// Resolve `host` and try each address, IPv4 first, each attempt bounded
  /// by the connect timeout.
  pub async fn connect_host(&self, host: &str, port: u16) -> Result<TcpStream> {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    let mut candidates: Vec<SocketAddr> = tokio::net::lookup_host((bare, port)).await?.collect();
    candidates.sort_by_key(|addr| addr.is_ipv6());
    let mut last_error = None;
    for addr in candidates {
      match self.connect_with_addr(addr).await {
        Ok(stream) => {
          tracing::debug!("connected to {} ({})", host, addr);
          return Ok(stream);
        }
        Err(err) => {
          tracing::debug!("connect to {} failed: {}", addr, err);
          last_error = Some(err);
        }
      }
    }
    Err(last_error.unwrap_or_else(|| {
      new_io_error(
        std::io::ErrorKind::NotFound,
        &format!("no address found for {}", host),
      )
    }))
  }

  /// Connect to a remote endpoint with addr
  pub async fn connect_with_addr(&self, addr: SocketAddr) -> Result<TcpStream> {
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if let Some(endpoint) = self.upstream_endpoint {
      if endpoint.is_ipv4() == addr.is_ipv4() {
        raw_socket.bind(&endpoint.into())?;
      }
    }
    raw_socket.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    if self.nodelay {
      socket.set_nodelay(true)?;
    }
    let stream = tokio::time::timeout(self.connect_timeout, socket.connect(addr))
      .await
      .map_err(|x| new_io_error(std::io::ErrorKind::TimedOut, &x.to_string()))??;
    Ok(stream)
  }

  /// A `Connector` will use transport layer security (TLS) by default to connect to destinations.
  async fn upgrade_to_tls(
    &self,
    stream: TcpStream,
    target: &UpstreamTarget,
    tls12_only: bool,
  ) -> Result<MaybeTlsStream> {
    let host = target.host.trim_start_matches('[').trim_end_matches(']');
    let config = self.tls.client_config(host, &target.alpn, tls12_only)?;
    let domain = ServerName::try_from(host.to_owned()).map_err(|e| Error::Other(e.to_string()))?;
    let tls = TlsConnector::from(config).connect(domain, stream).await?;
    Ok(MaybeTlsStream::Tls(Box::new(tls)))
  }
}

fn rejects_the_offer(err: &rustls::Error) -> bool {
  matches!(
    err,
    rustls::Error::PeerIncompatible(_)
      | rustls::Error::InappropriateHandshakeMessage { .. }
      | rustls::Error::InappropriateMessage { .. }
      | rustls::Error::AlertReceived(
        AlertDescription::ProtocolVersion
          | AlertDescription::HandshakeFailure
          | AlertDescription::IllegalParameter
          | AlertDescription::InsufficientSecurity
      )
  )
}

/// Whether a failed handshake is worth another try with TLS 1.2 only.
fn is_version_mismatch(err: &Error) -> bool {
  match err {
    Error::Tls(tls) => rejects_the_offer(tls),
    // tokio-rustls 把 rustls 错误包在 io::Error 里
    Error::IO(io) => io
      .get_ref()
      .and_then(|inner| inner.downcast_ref::<rustls::Error>())
      .is_some_and(rejects_the_offer),
    _ => false,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener;

  #[test]
  fn only_rejected_offers_fall_back_to_tls12() {
    let wrapped = |e: rustls::Error| Error::IO(std::io::Error::new(std::io::ErrorKind::InvalidData, e));
    assert!(is_version_mismatch(&wrapped(rustls::Error::AlertReceived(
      AlertDescription::ProtocolVersion
    ))));
    assert!(is_version_mismatch(&Error::Tls(rustls::Error::AlertReceived(
      AlertDescription::HandshakeFailure
    ))));
    assert!(is_version_mismatch(&wrapped(rustls::Error::PeerIncompatible(
      rustls::PeerIncompatible::Tls12NotOffered
    ))));
    assert!(!is_version_mismatch(&wrapped(rustls::Error::InvalidCertificate(
      rustls::CertificateError::UnknownIssuer
    ))));
    assert!(!is_version_mismatch(&wrapped(rustls::Error::AlertReceived(
      AlertDescription::BadCertificate
    ))));
    assert!(!is_version_mismatch(&Error::IO(std::io::Error::from(
      std::io::ErrorKind::ConnectionReset
    ))));
    assert!(!is_version_mismatch(&Error::Other("boom".into())));
  }

  #[tokio::test]
  async fn plain_connect_to_loopback() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
      let (mut s, _) = listener.accept().await.unwrap();
      s.write_all(b"hello").await.unwrap();
    });
    let config = ProxyConfig::builder().build().unwrap();
    let connector = Connector::new(&config, TlsClientSettings::default());
    let mut stream = connector
      .connect(&UpstreamTarget::raw("localhost", port))
      .await
      .unwrap();
    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");
    assert!(stream.negotiated_alpn().is_none());
  }

  #[tokio::test]
  async fn refused_connection_surfaces_io_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let config = ProxyConfig::builder().build().unwrap();
    let connector = Connector::new(&config, TlsClientSettings::default());
    let err = connector.connect_host("127.0.0.1", port).await.unwrap_err();
    assert!(matches!(err, Error::IO(_)));
  }

  #[test]
  fn bypassed_hosts_skip_the_proxy() {
    let proxy = ExternalProxy::parse("http://10.0.0.1:3128")
      .unwrap()
      .with_bypass_localhost(true);
    let config = ProxyConfig::builder()
      .upstream_proxy(Some(proxy))
      .build()
      .unwrap();
    let connector = Connector::new(&config, TlsClientSettings::default());
    assert!(connector.proxy_for("localhost").is_none());
    assert!(connector.proxy_for("example.com").is_some());
  }
}
