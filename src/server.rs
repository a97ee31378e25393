//! Proxy server implementation
use crate::auth::{BasicAuthenticator, ProxyAuthorization, SchemeAuthenticator};
use crate::buffer_pool::BufferPool;
use crate::certificate::{CertificateCache, CertificateManager, DiskCertificateCache, NoopCertificateCache};
use crate::config::ProxyConfig;
use crate::connector::Connector;
use crate::errors::{default_exception_handler, Error, ExceptionHandler, Result};
use crate::interceptor::{
  panic_message, InterceptorHandler, Leg, RequestInterceptor, ResponseInterceptor, TrafficObserver, TunnelInterceptor,
  UpstreamAuthenticator, UpstreamProxySelector,
};
use crate::pool::ConnectionPool;
use crate::session::{handle_client, handle_transparent, ProxyContext};
use crate::socket::BoxedIo;
use crate::stream::HttpStream;
use futures::FutureExt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio_util::sync::CancellationToken;

/// Called after a client connection is gone, with the client address.
pub type ClientClosedHandler = Arc<dyn Fn(Option<SocketAddr>) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
enum Endpoint {
  Explicit,
  Transparent,
}

impl Endpoint {
  fn as_str(&self) -> &'static str {
    match self {
      Endpoint::Explicit => "explicit",
      Endpoint::Transparent => "transparent",
    }
  }
}

/// A programmable intercepting proxy.
///
/// Cloning is cheap, clones drive the same listener state.
#[derive(Clone)]
pub struct ProxyServer {
  context: Arc<ProxyContext>,
  shutdown: CancellationToken,
  clients: Arc<AtomicUsize>,
  on_client_closed: Option<ClientClosedHandler>,
}

impl std::fmt::Debug for ProxyServer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ProxyServer")
      .field("config", &self.context.config)
      .field("clients", &self.client_count())
      .finish()
  }
}

/// Builder for [`ProxyServer`].
#[derive(Default)]
pub struct ProxyServerBuilder {
  config: Option<ProxyConfig>,
  interceptors: InterceptorHandler,
  basic: Option<Arc<dyn BasicAuthenticator>>,
  scheme: Option<Arc<dyn SchemeAuthenticator>>,
  certificate_store: Option<Arc<dyn CertificateCache>>,
  exception_handler: Option<ExceptionHandler>,
  on_client_closed: Option<ClientClosedHandler>,
}

impl ProxyServerBuilder {
  /// Set the `ProxyConfig` to use.
  pub fn config(mut self, config: ProxyConfig) -> Self {
    self.config = Some(config);
    self
  }
  /// Replace every interceptor at once.
  pub fn interceptors(mut self, interceptors: InterceptorHandler) -> Self {
    self.interceptors = interceptors;
    self
  }
  /// Add a request interceptor.
  pub fn request_interceptor(mut self, interceptor: Arc<dyn RequestInterceptor>) -> Self {
    self.interceptors.add_request_interceptor(interceptor);
    self
  }
  /// Add a response interceptor.
  pub fn response_interceptor(mut self, interceptor: Arc<dyn ResponseInterceptor>) -> Self {
    self.interceptors.add_response_interceptor(interceptor);
    self
  }
  /// Add a tunnel interceptor.
  pub fn tunnel_interceptor(mut self, interceptor: Arc<dyn TunnelInterceptor>) -> Self {
    self.interceptors.add_tunnel_interceptor(interceptor);
    self
  }
  /// Answer upstream `401` challenges of integrated schemes.
  pub fn upstream_authenticator(mut self, authenticator: Arc<dyn UpstreamAuthenticator>) -> Self {
    self.interceptors.set_upstream_authenticator(authenticator);
    self
  }
  /// Observe raw traffic on every leg.
  pub fn traffic_observer(mut self, observer: Arc<dyn TrafficObserver>) -> Self {
    self.interceptors.set_traffic_observer(observer);
    self
  }
  /// Choose the external proxy per session, with failover.
  pub fn upstream_proxy_selector(mut self, selector: Arc<dyn UpstreamProxySelector>) -> Self {
    self.interceptors.set_upstream_proxy_selector(selector);
    self
  }
  /// Require Basic proxy credentials.
  pub fn basic_authenticator(mut self, authenticator: Arc<dyn BasicAuthenticator>) -> Self {
    self.basic = Some(authenticator);
    self
  }
  /// Require scheme based proxy credentials.
  pub fn scheme_authenticator(mut self, authenticator: Arc<dyn SchemeAuthenticator>) -> Self {
    self.scheme = Some(authenticator);
    self
  }
  /// Persist the root and leaf certificates through `store`.
  pub fn certificate_store(mut self, store: Arc<dyn CertificateCache>) -> Self {
    self.certificate_store = Some(store);
    self
  }
  /// Where connection and background errors go. Defaults to `tracing`.
  pub fn exception_handler(mut self, handler: ExceptionHandler) -> Self {
    self.exception_handler = Some(handler);
    self
  }
  /// Run `handler` after every client connection closed.
  pub fn on_client_closed(mut self, handler: ClientClosedHandler) -> Self {
    self.on_client_closed = Some(handler);
    self
  }

  /// Build the `ProxyServer`, loading or creating the root certificate.
  pub async fn build(self) -> Result<ProxyServer> {
    let config = match self.config {
      Some(config) => config,
      None => ProxyConfig::builder().build()?,
    };
    let exception_handler = self.exception_handler.unwrap_or_else(default_exception_handler);
    let store: Arc<dyn CertificateCache> = match (self.certificate_store, &config.certificate.storage_path) {
      (Some(store), _) => store,
      (None, Some(path)) => Arc::new(DiskCertificateCache::new(path.clone())),
      (None, None) => Arc::new(NoopCertificateCache),
    };
    let certificates =
      CertificateManager::with_store(config.certificate.clone(), store, exception_handler.clone()).await?;
    let buffer_pool = BufferPool::new(config.buffer_size);
    let tls = self.interceptors.tls_settings(
      config.upstream_certs_verification,
      config.root_certificates.clone(),
      config.client_identity.clone(),
    );
    let connector = Connector::new(&config, tls);
    let pool = ConnectionPool::new(&config, connector, buffer_pool.clone());
    let mut authorization = ProxyAuthorization::new(config.authentication_realm.clone());
    if let Some(basic) = self.basic {
      authorization = authorization.with_basic(basic);
    }
    if let Some(scheme) = self.scheme {
      authorization = authorization.with_scheme(scheme);
    }
    Ok(ProxyServer {
      context: Arc::new(ProxyContext {
        config,
        buffer_pool,
        pool,
        certificates,
        interceptors: self.interceptors,
        authorization,
        exception_handler,
        next_session_id: AtomicU64::new(1),
      }),
      shutdown: CancellationToken::new(),
      clients: Arc::new(AtomicUsize::new(0)),
      on_client_closed: self.on_client_closed,
    })
  }
}

impl ProxyServer {
  /// Start building a server.
  pub fn builder() -> ProxyServerBuilder {
    ProxyServerBuilder::default()
  }

  /// The configuration the server runs with.
  pub fn config(&self) -> &ProxyConfig {
    &self.context.config
  }
  /// Root and leaf certificate management.
  pub fn certificates(&self) -> &CertificateManager {
    &self.context.certificates
  }
  /// Upstream connection pool.
  pub fn pool(&self) -> &ConnectionPool {
    &self.context.pool
  }
  /// Client connections currently open.
  pub fn client_count(&self) -> usize {
    self.clients.load(Ordering::SeqCst)
  }

  /// Bind `addr` and serve until [`ProxyServer::shutdown`].
  pub async fn run(&self, addr: impl ToSocketAddrs) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    self.serve(listener).await
  }

  /// Serve clients accepted from `listener` until [`ProxyServer::shutdown`].
  pub async fn serve(&self, listener: TcpListener) -> Result<()> {
    self.accept_loop(listener, Endpoint::Explicit).await
  }

  /// Bind `addr` as a transparent endpoint and serve until
  /// [`ProxyServer::shutdown`].
  pub async fn run_transparent(&self, addr: impl ToSocketAddrs) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    self.serve_transparent(listener).await
  }

  /// Serve redirected clients that never send CONNECT. TLS is decrypted
  /// for the SNI host, plain HTTP is routed by its `Host` header.
  pub async fn serve_transparent(&self, listener: TcpListener) -> Result<()> {
    self.accept_loop(listener, Endpoint::Transparent).await
  }

  async fn accept_loop(&self, listener: TcpListener, endpoint: Endpoint) -> Result<()> {
    self.context.pool.start_sweeper();
    self.context.certificates.start_sweeper();
    if let Ok(addr) = listener.local_addr() {
      tracing::info!("{} proxy listening on {}", endpoint.as_str(), addr);
    }
    loop {
      tokio::select! {
        _ = self.shutdown.cancelled() => break,
        accepted = listener.accept() => match accepted {
          Ok((stream, peer_addr)) => {
            if self.context.config.nodelay {
              if let Err(err) = stream.set_nodelay(true) {
                tracing::debug!("set_nodelay failed for {}: {}", peer_addr, err);
              }
            }
            let server = self.clone();
            tokio::spawn(async move {
              server.drive(stream, Some(peer_addr), endpoint).await;
            });
          }
          Err(err) => {
            tracing::error!("failed to accept connection: {}", err);
          }
        }
      }
    }
    tracing::info!("{} proxy stopped accepting connections", endpoint.as_str());
    Ok(())
  }

  /// Serve one client connection to completion.
  ///
  /// Every error ends up in the exception handler. The connection count is
  /// decremented and the closed handler called whatever the outcome.
  pub async fn handle_connection<S>(&self, stream: S, client_addr: Option<SocketAddr>)
  where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
  {
    self.drive(stream, client_addr, Endpoint::Explicit).await
  }

  /// Like [`ProxyServer::handle_connection`] for a client redirected to a
  /// transparent endpoint.
  pub async fn handle_transparent_connection<S>(&self, stream: S, client_addr: Option<SocketAddr>)
  where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
  {
    self.drive(stream, client_addr, Endpoint::Transparent).await
  }

  async fn drive<S>(&self, stream: S, client_addr: Option<SocketAddr>, endpoint: Endpoint)
  where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
  {
    self.clients.fetch_add(1, Ordering::SeqCst);
    let ctx = &self.context;
    let io: BoxedIo = Box::new(stream);
    let mut client = HttpStream::new(io, &ctx.buffer_pool, true);
    client.set_observer(ctx.interceptors.observer(Leg::Client));
    let cancel = self.shutdown.child_token();
    let session = async {
      match endpoint {
        Endpoint::Explicit => handle_client(ctx, client, client_addr).await,
        Endpoint::Transparent => handle_transparent(ctx, client, client_addr).await,
      }
    };
    // 客户端任务里的 panic 也要走到下面的计数和回调
    let session = AssertUnwindSafe(session).catch_unwind();
    let result = tokio::select! {
      _ = cancel.cancelled() => Ok(()),
      result = session => result.unwrap_or_else(|panic| {
        Err(Error::Other(format!("client session {}", panic_message(panic))))
      }),
    };
    if let Err(err) = result {
      ctx.report(&err);
    }
    self.clients.fetch_sub(1, Ordering::SeqCst);
    if let Some(handler) = &self.on_client_closed {
      handler(client_addr);
    }
  }

  /// Stop accepting, cancel every client and both sweepers, and close the
  /// idle upstream connections.
  pub fn shutdown(&self) {
    self.shutdown.cancel();
    self.context.pool.stop();
    self.context.certificates.stop();
  }
}
