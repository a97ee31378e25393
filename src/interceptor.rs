//! Traffic interception and modification interfaces
//!
//! Every hook point holds an ordered list of interceptors. Each call is its
//! own fault boundary: an error or a panic is wrapped in [`Error::Hook`],
//! sent to the exception handler, and the remaining interceptors still run.
use crate::errors::{Error, ExceptionHandler, Result};
use crate::proxy::ExternalProxy;
use crate::session::{HookContext, Session, TunnelSession};
use crate::stream::StreamObserver;
use crate::tls::{ClientCertificateSelector, ServerCertificateValidator, TlsClientSettings};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Runs before a request is forwarded.
#[async_trait::async_trait]
pub trait RequestInterceptor: Send + Sync {
  /// Inspect or change the request, or answer it through `ctx`.
  async fn before_request(&self, ctx: &mut HookContext<'_>) -> Result<()>;
}

/// Runs after the response head arrived and before it is relayed.
#[async_trait::async_trait]
pub trait ResponseInterceptor: Send + Sync {
  /// Inspect or change the response, or ask for a re-request through `ctx`.
  async fn before_response(&self, ctx: &mut HookContext<'_>) -> Result<()>;
  /// Once the exchange is over, whether it succeeded or not. The response
  /// was already sent, [`Session::error`] tells why when it failed.
  async fn after_response(&self, _session: &Session) -> Result<()> {
    Ok(())
  }
}

/// Runs around CONNECT handling.
#[async_trait::async_trait]
pub trait TunnelInterceptor: Send + Sync {
  /// Before the tunnel is accepted. [`TunnelSession::deny`] refuses it and
  /// [`TunnelSession::set_decrypt_ssl`] turns decryption on or off.
  async fn before_tunnel_request(&self, _tunnel: &mut TunnelSession) -> Result<()> {
    Ok(())
  }
  /// After the ClientHello was sniffed. [`TunnelSession::force_passthrough`]
  /// forces a raw relay.
  async fn before_tunnel_response(&self, _tunnel: &mut TunnelSession) -> Result<()> {
    Ok(())
  }
}

/// Answers `401` challenges of integrated schemes (NTLM, Negotiate,
/// Kerberos) on behalf of the client.
#[async_trait::async_trait]
pub trait UpstreamAuthenticator: Send + Sync {
  /// The `Authorization` value to resend with, or `None` to give up.
  /// `challenge` is the token the server sent with `scheme`, if any.
  async fn respond(&self, session: &Session, scheme: &str, challenge: Option<&str>) -> Result<Option<String>>;
}

/// Chooses the external proxy of each session.
#[async_trait::async_trait]
pub trait UpstreamProxySelector: Send + Sync {
  /// The proxy `session` goes through, or `None` for the configured one.
  async fn select(&self, session: &Session) -> Result<Option<ExternalProxy>>;
  /// Connecting through `failed` did not work. Another proxy to try, or
  /// `None` to give up with a `502`.
  async fn on_failure(&self, _session: &Session, _failed: &ExternalProxy) -> Result<Option<ExternalProxy>> {
    Ok(None)
  }
}

/// Which connection some bytes travelled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
  /// The client socket, before any decryption.
  Client,
  /// Plaintext inside a decrypted tunnel.
  DecryptedClient,
  /// The upstream connection.
  Server,
}

/// Which way some bytes travelled, from the proxy's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
  /// Read by the proxy.
  Received,
  /// Written by the proxy.
  Sent,
}

/// Sees raw bytes on every leg.
pub trait TrafficObserver: Send + Sync {
  /// `data` went through `leg` in `direction`.
  fn on_data(&self, leg: Leg, direction: Direction, data: &[u8]);
}

struct LegObserver {
  leg: Leg,
  observer: Arc<dyn TrafficObserver>,
}

impl StreamObserver for LegObserver {
  fn on_read(&self, data: &[u8]) {
    self.observer.on_data(self.leg, Direction::Received, data);
  }
  fn on_write(&self, data: &[u8]) {
    self.observer.on_data(self.leg, Direction::Sent, data);
  }
}

/// Combined interceptor handler for every hook point
#[derive(Clone, Default)]
pub struct InterceptorHandler {
  request_interceptors: Vec<Arc<dyn RequestInterceptor>>,
  response_interceptors: Vec<Arc<dyn ResponseInterceptor>>,
  tunnel_interceptors: Vec<Arc<dyn TunnelInterceptor>>,
  validators: Vec<Arc<dyn ServerCertificateValidator>>,
  selectors: Vec<Arc<dyn ClientCertificateSelector>>,
  upstream_authenticator: Option<Arc<dyn UpstreamAuthenticator>>,
  proxy_selector: Option<Arc<dyn UpstreamProxySelector>>,
  traffic_observer: Option<Arc<dyn TrafficObserver>>,
}

impl std::fmt::Debug for InterceptorHandler {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("InterceptorHandler")
      .field("request_interceptors", &self.request_interceptors.len())
      .field("response_interceptors", &self.response_interceptors.len())
      .field("tunnel_interceptors", &self.tunnel_interceptors.len())
      .field("validators", &self.validators.len())
      .field("selectors", &self.selectors.len())
      .finish()
  }
}

impl InterceptorHandler {
  /// Create a new interceptor handler
  pub fn new() -> Self {
    Self::default()
  }
  /// Add a request interceptor
  pub fn add_request_interceptor(&mut self, interceptor: Arc<dyn RequestInterceptor>) {
    self.request_interceptors.push(interceptor);
  }
  /// Add a response interceptor
  pub fn add_response_interceptor(&mut self, interceptor: Arc<dyn ResponseInterceptor>) {
    self.response_interceptors.push(interceptor);
  }
  /// Add a tunnel interceptor
  pub fn add_tunnel_interceptor(&mut self, interceptor: Arc<dyn TunnelInterceptor>) {
    self.tunnel_interceptors.push(interceptor);
  }
  /// Add an upstream certificate validator
  pub fn add_server_certificate_validator(&mut self, validator: Arc<dyn ServerCertificateValidator>) {
    self.validators.push(validator);
  }
  /// Add a client certificate selector
  pub fn add_client_certificate_selector(&mut self, selector: Arc<dyn ClientCertificateSelector>) {
    self.selectors.push(selector);
  }
  /// Set the upstream `401` responder
  pub fn set_upstream_authenticator(&mut self, authenticator: Arc<dyn UpstreamAuthenticator>) {
    self.upstream_authenticator = Some(authenticator);
  }
  /// Set the per-session upstream proxy selector
  pub fn set_upstream_proxy_selector(&mut self, selector: Arc<dyn UpstreamProxySelector>) {
    self.proxy_selector = Some(selector);
  }
  /// Set the raw traffic observer
  pub fn set_traffic_observer(&mut self, observer: Arc<dyn TrafficObserver>) {
    self.traffic_observer = Some(observer);
  }
  /// Check if any interceptors are registered
  pub fn has_interceptors(&self) -> bool {
    !self.request_interceptors.is_empty()
      || !self.response_interceptors.is_empty()
      || !self.tunnel_interceptors.is_empty()
  }

  pub(crate) fn upstream_authenticator(&self) -> Option<&Arc<dyn UpstreamAuthenticator>> {
    self.upstream_authenticator.as_ref()
  }

  /// The proxy picked for `session`. Selector failures fall back to the
  /// configured proxy.
  pub(crate) async fn select_proxy(&self, session: &Session, sink: &ExceptionHandler) -> Option<ExternalProxy> {
    let selector = self.proxy_selector.as_ref()?;
    guarded("select_upstream_proxy", selector.select(session), sink)
      .await
      .flatten()
  }

  pub(crate) async fn proxy_failed(
    &self,
    session: &Session,
    failed: &ExternalProxy,
    sink: &ExceptionHandler,
  ) -> Option<ExternalProxy> {
    let selector = self.proxy_selector.as_ref()?;
    guarded("upstream_proxy_failure", selector.on_failure(session, failed), sink)
      .await
      .flatten()
  }

  pub(crate) fn observer(&self, leg: Leg) -> Option<Arc<dyn StreamObserver>> {
    self.traffic_observer.as_ref().map(|observer| {
      Arc::new(LegObserver {
        leg,
        observer: observer.clone(),
      }) as Arc<dyn StreamObserver>
    })
  }

  pub(crate) fn tls_settings(
    &self,
    certs_verification: bool,
    root_certificates: Vec<crate::tls::Certificate>,
    identity: Option<crate::tls::Identity>,
  ) -> TlsClientSettings {
    TlsClientSettings {
      certs_verification,
      root_certificates,
      identity,
      validators: self.validators.clone(),
      selectors: self.selectors.clone(),
    }
  }

  pub(crate) async fn before_request(&self, ctx: &mut HookContext<'_>, sink: &ExceptionHandler) {
    for interceptor in &self.request_interceptors {
      guarded("before_request", interceptor.before_request(ctx), sink).await;
    }
  }

  pub(crate) async fn before_response(&self, ctx: &mut HookContext<'_>, sink: &ExceptionHandler) {
    for interceptor in &self.response_interceptors {
      guarded("before_response", interceptor.before_response(ctx), sink).await;
    }
  }

  pub(crate) async fn after_response(&self, session: &Session, sink: &ExceptionHandler) {
    for interceptor in &self.response_interceptors {
      guarded("after_response", interceptor.after_response(session), sink).await;
    }
  }

  pub(crate) async fn before_tunnel_request(&self, tunnel: &mut TunnelSession, sink: &ExceptionHandler) {
    for interceptor in &self.tunnel_interceptors {
      guarded("before_tunnel_request", interceptor.before_tunnel_request(tunnel), sink).await;
    }
  }

  pub(crate) async fn before_tunnel_response(&self, tunnel: &mut TunnelSession, sink: &ExceptionHandler) {
    for interceptor in &self.tunnel_interceptors {
      guarded("before_tunnel_response", interceptor.before_tunnel_response(tunnel), sink).await;
    }
  }
}

/// Await one hook call, turning an error or a panic into a reported
/// [`Error::Hook`]. Returns the hook's value when it succeeded.
pub(crate) async fn guarded<F, T>(stage: &'static str, hook: F, sink: &ExceptionHandler) -> Option<T>
where
  F: Future<Output = Result<T>>,
{
  match contained(stage, hook).await {
    Ok(value) => Some(value),
    Err(err) => {
      sink(&err);
      None
    }
  }
}

/// Like [`guarded`] but hands the [`Error::Hook`] back to the caller.
pub(crate) async fn contained<F, T>(stage: &'static str, hook: F) -> Result<T>
where
  F: Future<Output = Result<T>>,
{
  let message = match AssertUnwindSafe(hook).catch_unwind().await {
    Ok(Ok(value)) => return Ok(value),
    Ok(Err(err)) => err.to_string(),
    Err(panic) => panic_message(panic),
  };
  Err(Error::Hook { stage, message })
}

pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> String {
  if let Some(s) = panic.downcast_ref::<&str>() {
    format!("panicked: {}", s)
  } else if let Some(s) = panic.downcast_ref::<String>() {
    format!("panicked: {}", s)
  } else {
    "panicked".to_string()
  }
}
