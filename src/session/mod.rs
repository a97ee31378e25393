//! Per-client session state machine
//!
//! One task drives one client connection: plain requests go through the HTTP
//! loop in [`exchange`], a CONNECT switches to [`tunnel`] which either relays raw
//! bytes or decrypts and re-enters the HTTP loop once.
mod exchange;
mod tunnel;

pub use tunnel::TunnelSession;
pub(crate) use tunnel::handle_transparent;

use crate::auth::ProxyAuthorization;
use crate::body::Body;
use crate::buffer_pool::BufferPool;
use crate::certificate::CertificateManager;
use crate::config::ProxyConfig;
use crate::errors::{Error, ExceptionHandler, Result};
use crate::header::BodyFraming;
use crate::interceptor::InterceptorHandler;
use crate::pool::{ConnectionPool, PooledConnection};
use crate::proxy::ExternalProxy;
use crate::request::Request;
use crate::response::{decode_body, encode_body, Response};
use crate::socket::BoxedIo;
use crate::stream::HttpStream;
use bytes::Bytes;
use http::header::CONTENT_ENCODING;
use http::{HeaderMap, StatusCode};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// One request/response exchange and its bookkeeping.
#[derive(Debug, Clone)]
pub struct Session {
  id: u64,
  client_addr: Option<SocketAddr>,
  pub(crate) request: Request,
  pub(crate) response: Response,
  timeline: HashMap<String, SystemTime>,
  pub(crate) terminate_session: bool,
  pub(crate) terminate_server_connection: bool,
  pub(crate) re_request: bool,
  pub(crate) server_authenticated: bool,
  // 尚未从客户端读出的请求体
  pub(crate) client_body_pending: Option<BodyFraming>,
  pub(crate) server_body_pending: Option<BodyFraming>,
  pub(crate) upstream_proxy: Option<ExternalProxy>,
  pub(crate) error: Option<String>,
}

impl Session {
  /// A session for `request`, with an empty response.
  pub fn new(request: Request) -> Self {
    let mut session = Session {
      id: 0,
      client_addr: None,
      request,
      response: Response::default(),
      timeline: HashMap::new(),
      terminate_session: false,
      terminate_server_connection: false,
      re_request: false,
      server_authenticated: false,
      client_body_pending: None,
      server_body_pending: None,
      upstream_proxy: None,
      error: None,
    };
    session.stamp("Session Created");
    session
  }
  /// Session id, unique per server.
  pub fn id(&self) -> u64 {
    self.id
  }
  /// Address of the client, when known.
  pub fn client_addr(&self) -> Option<SocketAddr> {
    self.client_addr
  }
  /// The request.
  pub fn request(&self) -> &Request {
    &self.request
  }
  /// The response, empty until the server answered or a hook responded.
  pub fn response(&self) -> &Response {
    &self.response
  }
  /// Named points in time of this exchange.
  pub fn timeline(&self) -> &HashMap<String, SystemTime> {
    &self.timeline
  }
  /// Whether the client connection closes after this exchange.
  pub fn is_terminated(&self) -> bool {
    self.terminate_session
  }
  /// Whether the server answered an upstream authentication round.
  pub fn is_server_authenticated(&self) -> bool {
    self.server_authenticated
  }
  /// The proxy chosen by the upstream proxy selector, after any failover.
  pub fn upstream_proxy(&self) -> Option<&ExternalProxy> {
    self.upstream_proxy.as_ref()
  }
  /// Why the exchange failed, set before `after_response` runs.
  pub fn error(&self) -> Option<&str> {
    self.error.as_deref()
  }
  /// Record `name` at the current time.
  pub fn stamp(&mut self, name: &str) {
    self.timeline.insert(name.to_string(), SystemTime::now());
  }
}

/// What a request or response interceptor can see and change.
pub struct HookContext<'a> {
  session: &'a mut Session,
  client: &'a mut HttpStream<BoxedIo>,
  server: Option<&'a mut PooledConnection>,
}

impl<'a> HookContext<'a> {
  pub(crate) fn new(
    session: &'a mut Session,
    client: &'a mut HttpStream<BoxedIo>,
    server: Option<&'a mut PooledConnection>,
  ) -> Self {
    HookContext {
      session,
      client,
      server,
    }
  }

  /// The whole session.
  pub fn session(&self) -> &Session {
    self.session
  }
  /// The request.
  pub fn request(&self) -> &Request {
    &self.session.request
  }
  /// The request for editing. Its setters fail once it was sent.
  pub fn request_mut(&mut self) -> &mut Request {
    &mut self.session.request
  }
  /// The response.
  pub fn response(&self) -> &Response {
    &self.session.response
  }
  /// The response for editing. Its setters fail once it is locked.
  pub fn response_mut(&mut self) -> &mut Response {
    &mut self.session.response
  }
  /// Named points in time of this exchange.
  pub fn timeline(&self) -> &HashMap<String, SystemTime> {
    &self.session.timeline
  }
  /// The upstream connection, present in the response stage.
  pub fn server(&self) -> Option<&PooledConnection> {
    self.server.as_deref()
  }

  /// The request body, decoded per `Content-Encoding`. Read from the client
  /// on first use.
  pub async fn request_body(&mut self) -> Result<Bytes> {
    if let Some(framing) = self.session.client_body_pending.take() {
      if self.session.request.expect_continue() {
        continue_client(self.client).await?;
      }
      let raw = self.client.read_body(framing).await?;
      self.session.request.store_body(raw);
      self.session.request.reframe_body();
    }
    let raw = self
      .session
      .request
      .body()
      .map(|b| b.bytes().clone())
      .unwrap_or_default();
    decode_body(raw, content_encoding(self.session.request.headers()).as_deref())
  }

  /// The response body, decoded per `Content-Encoding`. Read from the server
  /// on first use.
  pub async fn response_body(&mut self) -> Result<Bytes> {
    if let Some(framing) = self.session.server_body_pending {
      let server = self
        .server
        .as_deref_mut()
        .ok_or_else(|| Error::Other("no server connection to read the response body from".to_string()))?;
      let raw = server.stream.read_body(framing).await?;
      self.session.server_body_pending = None;
      self.session.response.store_body(raw);
    }
    let raw = self
      .session
      .response
      .body()
      .map(|b| b.bytes().clone())
      .unwrap_or_default();
    decode_body(raw, content_encoding(self.session.response.headers()).as_deref())
  }

  /// Replace the request body. It is encoded back with the request's
  /// `Content-Encoding` and framed by `Content-Length`.
  pub async fn set_request_body(&mut self, body: impl Into<Body>) -> Result<()> {
    if self.session.request.is_locked() {
      return Err(Error::Other("request is locked, it has already been sent to the server".to_string()));
    }
    if let Some(framing) = self.session.client_body_pending.take() {
      if self.session.request.expect_continue() {
        continue_client(self.client).await?;
      }
      self.client.drain_body(framing).await?;
    }
    let encoded = encode_body(
      body.into().into_bytes(),
      content_encoding(self.session.request.headers()).as_deref(),
    )?;
    self.session.request.set_body(encoded)?;
    self.session.request.reframe_body();
    Ok(())
  }

  /// Replace the response body. It is encoded back with the response's
  /// `Content-Encoding` and framed by `Content-Length`.
  pub async fn set_response_body(&mut self, body: impl Into<Body>) -> Result<()> {
    if self.session.response.is_locked() {
      return Err(Error::Other("response is locked".to_string()));
    }
    if let (Some(framing), Some(server)) = (self.session.server_body_pending, self.server.as_deref_mut()) {
      server.stream.drain_body(framing).await?;
      self.session.server_body_pending = None;
    }
    let encoded = encode_body(
      body.into().into_bytes(),
      content_encoding(self.session.response.headers()).as_deref(),
    )?;
    self.session.response.set_body(encoded)?;
    self.session.response.reframe_body();
    Ok(())
  }

  /// Answer with `200 OK` and `body`, the request is not forwarded.
  pub fn ok(&mut self, body: impl Into<Body>) {
    self.respond(Response::ok(body));
  }
  /// Answer with `status` and `body`, the request is not forwarded.
  pub fn generic_response(&mut self, status: StatusCode, body: impl Into<Body>) {
    self.respond(Response::generic(status, body));
  }
  /// Answer with a `302` to `url`, the request is not forwarded.
  pub fn redirect(&mut self, url: &str) -> Result<()> {
    self.respond(Response::redirect(url)?);
    Ok(())
  }
  /// Answer with `response`. Before forwarding this cancels the request,
  /// afterwards it replaces the server's response.
  pub fn respond(&mut self, mut response: Response) {
    response.locked = true;
    self.session.response = response;
    self.session.request.cancel_request = true;
  }

  /// Close the client connection after this exchange.
  pub fn terminate_session(&mut self) {
    self.session.terminate_session = true;
  }
  /// Close the server connection after this exchange.
  pub fn terminate_server_connection(&mut self) {
    self.session.terminate_server_connection = true;
  }
  /// Send the (possibly edited) request again once this response is done.
  pub fn re_request(&mut self) {
    self.session.re_request = true;
  }
  /// Mark the server connection as bound to this client's credentials. It
  /// will never be shared through the pool.
  pub fn mark_server_authenticated(&mut self) {
    self.session.server_authenticated = true;
    if let Some(server) = self.server.as_deref_mut() {
      server.set_authenticated(true);
    }
  }
}

/// Tell a client waiting on `Expect: 100-continue` to send its body.
pub(crate) async fn continue_client(client: &mut HttpStream<BoxedIo>) -> Result<()> {
  client.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
  client.flush().await
}

fn content_encoding(headers: &HeaderMap) -> Option<String> {
  headers
    .get(CONTENT_ENCODING)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.trim().to_string())
}

/// Everything shared by the sessions of one server.
pub(crate) struct ProxyContext {
  pub(crate) config: ProxyConfig,
  pub(crate) buffer_pool: BufferPool,
  pub(crate) pool: ConnectionPool,
  pub(crate) certificates: CertificateManager,
  pub(crate) interceptors: InterceptorHandler,
  pub(crate) authorization: ProxyAuthorization,
  pub(crate) exception_handler: ExceptionHandler,
  pub(crate) next_session_id: AtomicU64,
}

impl ProxyContext {
  pub(crate) fn new_session(&self, request: Request, client_addr: Option<SocketAddr>) -> Session {
    let mut session = Session::new(request);
    session.id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
    session.client_addr = client_addr;
    session
  }

  pub(crate) fn report(&self, error: &Error) {
    (self.exception_handler)(error);
  }
}

/// Serve one client until it closes. Requests are handled in order, a
/// CONNECT hands the connection over to the tunnel.
pub(crate) async fn handle_client(
  ctx: &ProxyContext,
  mut client: HttpStream<BoxedIo>,
  client_addr: Option<SocketAddr>,
) -> Result<()> {
  loop {
    match exchange::handle_http(ctx, &mut client, client_addr, None, None).await {
      Ok(exchange::HttpExit::Closed) => break,
      Ok(exchange::HttpExit::Connect(connect)) => {
        match tunnel::handle_connect(ctx, client, client_addr, connect).await? {
          // 407 续传，继续在同一连接上读请求
          Some(returned) => client = returned,
          None => return Ok(()),
        }
      }
      Err(err) => {
        let _ = client.shutdown().await;
        return Err(err);
      }
    }
  }
  client.shutdown().await
}
