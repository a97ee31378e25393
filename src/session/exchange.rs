use super::{continue_client, HookContext, ProxyContext, Session};
use crate::body::Body;
use crate::connector::UpstreamTarget;
use crate::errors::{new_io_error, Error, Result};
use crate::header::{contains_token, fix_proxy_headers, prepare_request_headers, BodyFraming, PROXY_CONNECTION};
use crate::interceptor::{guarded, Leg};
use crate::pool::{PoolSource, PooledConnection, RetryAction, RetryPolicy, RetryResult};
use crate::request::{read_request, Request};
use crate::response::{read_response, Response};
use crate::socket::{BoxedIo, MaybeTlsStream};
use crate::stream::{HttpStream, StreamObserver};
use async_trait::async_trait;
use http::header::{AUTHORIZATION, CONNECTION, WWW_AUTHENTICATE};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;

// 同一请求最多重发次数
const MAX_RE_REQUESTS: usize = 8;
const MAX_PROXY_FALLBACKS: usize = 4;
const INTEGRATED_SCHEMES: [&str; 3] = ["NTLM", "Negotiate", "Kerberos"];

/// An upstream connection opened while the client TLS handshake runs.
pub(super) type Prefetch = JoinHandle<Result<PooledConnection>>;

/// How the HTTP loop ended.
pub(super) enum HttpExit {
  Closed,
  Connect(Request),
}

enum Step {
  Continue,
  Close,
  Connect(Request),
}

/// Destination of the tunnel a nested HTTP loop runs in.
pub(super) struct TunnelTarget {
  pub(super) host: String,
  pub(super) port: u16,
  pub(super) is_https: bool,
  // 透明模式下没有 SNI，目标只能取 Host 头
  pub(super) authority_from_host: bool,
}

impl TunnelTarget {
  fn authority(&self) -> String {
    if self.host.contains(':') {
      format!("[{}]:{}", self.host, self.port)
    } else {
      format!("{}:{}", self.host, self.port)
    }
  }
}

/// Read and serve requests until the client closes, an exchange ends the
/// connection or a CONNECT arrives. Inside a tunnel a CONNECT is an error.
pub(super) async fn handle_http(
  ctx: &ProxyContext,
  client: &mut HttpStream<BoxedIo>,
  client_addr: Option<SocketAddr>,
  tunnel: Option<&TunnelTarget>,
  mut prefetch: Option<Prefetch>,
) -> Result<HttpExit> {
  let mut held: Option<PooledConnection> = None;
  let result = loop {
    match exchange(ctx, client, client_addr, tunnel, &mut held, &mut prefetch).await {
      Ok(Step::Continue) => continue,
      Ok(Step::Close) => break Ok(HttpExit::Closed),
      Ok(Step::Connect(request)) => break Ok(HttpExit::Connect(request)),
      Err(err) => break Err(err),
    }
  };
  if let Some(connection) = held.take() {
    ctx.pool.release(connection, result.is_err());
  }
  if let Some(handle) = prefetch.take() {
    handle.abort();
  }
  result
}

async fn exchange(
  ctx: &ProxyContext,
  client: &mut HttpStream<BoxedIo>,
  client_addr: Option<SocketAddr>,
  tunnel: Option<&TunnelTarget>,
  held: &mut Option<PooledConnection>,
  prefetch: &mut Option<Prefetch>,
) -> Result<Step> {
  let request = match tokio::time::timeout(ctx.config.connection_timeout, read_request(client)).await {
    Ok(read) => match read? {
      Some(request) => request,
      None => return Ok(Step::Close),
    },
    Err(_) => {
      tracing::debug!("client idle for {:?}, closing", ctx.config.connection_timeout);
      return Ok(Step::Close);
    }
  };
  if request.method() == Method::CONNECT {
    if tunnel.is_some() {
      return Err(Error::protocol("CONNECT inside a tunnel"));
    }
    return Ok(Step::Connect(request));
  }

  let mut session = ctx.new_session(request, client_addr);
  match tunnel {
    Some(tunnel) => {
      if !tunnel.authority_from_host {
        session.request.set_authority(Some(tunnel.authority()));
      }
      session.request.set_https(tunnel.is_https);
    }
    None => {
      let https = session
        .request
        .target()
        .get(..8)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("https://"));
      session.request.set_https(https);
    }
  }
  session.stamp("Request Received");
  let framing = session.request.framing();
  if framing.has_body() {
    session.client_body_pending = Some(framing);
  }
  tracing::debug!(
    "session #{} {} {}",
    session.id(),
    session.request.method(),
    session.request.url()
  );

  let step = serve(ctx, client, &mut session, tunnel, held, prefetch).await;
  if let Err(err) = &step {
    session.error = Some(err.to_string());
  }
  ctx.interceptors.after_response(&session, &ctx.exception_handler).await;
  step
}

async fn serve(
  ctx: &ProxyContext,
  client: &mut HttpStream<BoxedIo>,
  session: &mut Session,
  tunnel: Option<&TunnelTarget>,
  held: &mut Option<PooledConnection>,
  prefetch: &mut Option<Prefetch>,
) -> Result<Step> {
  {
    let mut hook = HookContext::new(session, client, None);
    ctx.interceptors.before_request(&mut hook, &ctx.exception_handler).await;
  }

  // 隧道内的请求已随 CONNECT 认证
  if tunnel.is_none() {
    let (denied, err) = ctx.authorization.check(session).await;
    if let Some(err) = err {
      ctx.report(&err);
    }
    if let Some(response) = denied {
      let keep_alive =
        contains_token(response.headers(), PROXY_CONNECTION, "keep-alive") && session.request.keep_alive();
      session.response = response;
      session.response.locked = true;
      return finish_local(client, session, keep_alive).await;
    }
  }

  prepare_request_headers(session.request.headers_unchecked(), &ctx.config.supported_encodings);

  if session.request.cancel_request {
    let keep_alive = session.request.keep_alive() && session.response.keep_alive();
    return finish_local(client, session, keep_alive).await;
  }
  forward(ctx, client, session, held, prefetch).await
}

/// Write a response the proxy produced itself.
async fn finish_local(client: &mut HttpStream<BoxedIo>, session: &mut Session, keep_alive: bool) -> Result<Step> {
  let mut keep_alive = keep_alive && !session.terminate_session;
  if let Some(framing) = session.client_body_pending.take() {
    if keep_alive && !session.request.expect_continue() {
      client.drain_body(framing).await?;
    } else {
      keep_alive = false;
    }
  }
  session.response.reframe_body();
  client.write_response(&session.response).await?;
  session.stamp("Response Sent");
  tracing::debug!(
    "session #{} answered locally with {}",
    session.id(),
    session.response.status_code()
  );
  if keep_alive && !client.is_write_closed() {
    Ok(Step::Continue)
  } else {
    Ok(Step::Close)
  }
}

async fn forward(
  ctx: &ProxyContext,
  client: &mut HttpStream<BoxedIo>,
  session: &mut Session,
  held: &mut Option<PooledConnection>,
  prefetch: &mut Option<Prefetch>,
) -> Result<Step> {
  let (host, port) = session.request.host_port()?;
  let custom_proxy = ctx.interceptors.select_proxy(session, &ctx.exception_handler).await;
  session.upstream_proxy = custom_proxy.clone();
  let mut target = UpstreamTarget::new(host, port, session.request.is_https()).via(custom_proxy);
  let key = ctx.pool.key_for(&target);
  let mut connection = take_held(ctx, held, &key);
  if connection.is_none() {
    connection = take_prefetched(ctx, prefetch, &key).await;
  }
  let connection = match connection {
    Some(connection) => connection,
    None => match connect_with_failover(ctx, session, &mut target).await {
      Ok(connection) => connection,
      Err(err) => {
        bad_gateway(client, &err).await;
        return Err(err);
      }
    },
  };
  session.stamp("Connection Ready");

  if let Some(framing) = session.client_body_pending {
    if !session.request.expect_continue() {
      let body = client.read_body(framing).await?;
      session.request.store_body(body);
      session.request.reframe_body();
      session.client_body_pending = None;
    }
  }

  let policy = RetryPolicy::new(ctx.config.network_failure_retry_attempts + 1);
  let source = PoolSource::new(&ctx.pool, &target);
  let mut initial = Some(connection);
  let mut rounds = 0;
  let mut streamed_body = false;
  let (mut connection, server_keep_alive) = loop {
    let target_form = session.request.origin_form();
    let mut action = SendRequest {
      request: &mut session.request,
      client: &mut *client,
      client_body: &mut session.client_body_pending,
      target_form,
      observer: ctx.interceptors.observer(Leg::Server),
      timeout: ctx.config.connection_timeout,
      streamed: false,
      sent_at: None,
    };
    let RetryResult { connection, outcome } = policy.execute(&source, initial.take(), &mut action).await;
    let streamed = action.streamed;
    let sent_at = action.sent_at;
    streamed_body |= streamed;
    let response = match (outcome, connection) {
      (Ok(response), Some(connection)) => {
        initial = Some(connection);
        response
      }
      (Ok(_), None) => return Err(Error::Other("retry ended without a connection".to_string())),
      (Err(err), connection) => {
        if let Some(connection) = connection {
          ctx.pool.release(connection, true);
        }
        if !streamed {
          bad_gateway(client, &err).await;
        }
        return Err(err);
      }
    };
    let Some(mut connection) = initial.take() else {
      return Err(Error::Other("retry ended without a connection".to_string()));
    };
    if let Some(at) = sent_at {
      session.timeline.insert("Request Sent".to_string(), at);
    }
    session.stamp("Response Received");
    let server_keep_alive = response.keep_alive();
    let framing = response.framing(session.request.method());
    session.server_body_pending = framing.has_body().then_some(framing);
    session.response = response;

    {
      let mut hook = HookContext::new(session, client, Some(&mut connection));
      ctx.interceptors.before_response(&mut hook, &ctx.exception_handler).await;
    }
    authenticate_upstream(ctx, session, &mut connection).await;

    if !session.re_request {
      break (connection, server_keep_alive);
    }
    session.re_request = false;
    if streamed_body || rounds >= MAX_RE_REQUESTS {
      tracing::debug!("session #{} cannot re-request, relaying the response", session.id());
      break (connection, server_keep_alive);
    }
    rounds += 1;
    let mut reusable = server_keep_alive && !session.terminate_server_connection;
    if let Some(framing) = session.server_body_pending.take() {
      if framing == BodyFraming::UntilClose {
        reusable = false;
      } else {
        connection.stream.drain_body(framing).await?;
      }
    }
    if reusable {
      initial = Some(connection);
    } else {
      ctx.pool.release(connection, true);
    }
    session.response = Response::default();
    session.request.locked = false;
    session.request.cancel_request = false;
    tracing::debug!("session #{} re-requesting {}", session.id(), session.request.url());
  };

  let mut server_reusable = server_keep_alive && !session.terminate_server_connection;
  let mut client_keep_alive = session.request.keep_alive() && !session.terminate_session;
  if session.response.is_locked() {
    session.response.reframe_body();
    client.write_response(&session.response).await?;
    client_keep_alive &= session.response.keep_alive();
    if let Some(framing) = session.server_body_pending.take() {
      if framing == BodyFraming::UntilClose {
        server_reusable = false;
      } else {
        connection.stream.drain_body(framing).await?;
      }
    }
  } else {
    session.response.locked = true;
    fix_proxy_headers(session.response.headers_unchecked());
    client_keep_alive &= session.response.keep_alive();
    match session.server_body_pending.take() {
      Some(framing) => {
        client.write_headers(&session.response.head_bytes()).await?;
        connection.stream.copy_body_to(client, framing).await?;
        if framing == BodyFraming::UntilClose {
          server_reusable = false;
          client_keep_alive = false;
        }
      }
      None => {
        if session.response.body_read {
          session.response.reframe_body();
        }
        client.write_response(&session.response).await?;
      }
    }
  }
  session.stamp("Response Sent");
  tracing::debug!(
    "session #{} {} {} -> {}",
    session.id(),
    session.request.method(),
    session.request.url(),
    session.response.status_code()
  );

  if session.response.status_code() == StatusCode::SWITCHING_PROTOCOLS && session.request.upgrade_to_websocket() {
    relay_websocket(ctx, client, connection, session.id()).await;
    return Ok(Step::Close);
  }

  // Expect: 100-continue 被最终响应拒绝，请求体无法再可靠地跳过
  if session.client_body_pending.take().is_some() {
    client_keep_alive = false;
  }
  if server_reusable && !connection.stream.is_read_closed() {
    *held = Some(connection);
  } else {
    ctx.pool.release(connection, true);
  }
  if client_keep_alive && !client.is_write_closed() {
    Ok(Step::Continue)
  } else {
    Ok(Step::Close)
  }
}

async fn relay_websocket(
  ctx: &ProxyContext,
  client: &mut HttpStream<BoxedIo>,
  mut connection: PooledConnection,
  session_id: u64,
) {
  tracing::debug!("session #{} switched to websocket", session_id);
  match tokio::io::copy_bidirectional(client, &mut connection.stream).await {
    Ok((up, down)) => tracing::debug!(
      "session #{} websocket closed, {} bytes up, {} bytes down",
      session_id,
      up,
      down
    ),
    Err(err) => tracing::debug!("session #{} websocket relay ended: {}", session_id, err),
  }
  ctx.pool.release(connection, true);
}

/// A fresh connection for `target`. When a selected proxy fails the
/// selector may name another one, which is then recorded on the session.
async fn connect_with_failover(
  ctx: &ProxyContext,
  session: &mut Session,
  target: &mut UpstreamTarget,
) -> Result<PooledConnection> {
  let mut fallbacks = 0;
  loop {
    let err = match ctx.pool.get_connection(target, true).await {
      Ok(connection) => return Ok(connection),
      Err(err) => err,
    };
    let Some(failed) = target.proxy.clone() else {
      return Err(err);
    };
    if fallbacks >= MAX_PROXY_FALLBACKS {
      return Err(err);
    }
    tracing::debug!("session #{} upstream proxy {} failed: {}", session.id(), failed, err);
    let Some(next) = ctx.interceptors.proxy_failed(session, &failed, &ctx.exception_handler).await else {
      return Err(err);
    };
    fallbacks += 1;
    session.upstream_proxy = Some(next.clone());
    session.stamp("Retrying Upstream Proxy Connection");
    target.proxy = Some(next);
  }
}

/// Keep the held connection only when it serves the same key and is alive.
fn take_held(ctx: &ProxyContext, held: &mut Option<PooledConnection>, key: &str) -> Option<PooledConnection> {
  let connection = held.take()?;
  let alive = connection.is_alive();
  if alive && connection.cache_key() == key {
    return Some(connection);
  }
  ctx.pool.release(connection, !alive);
  None
}

async fn take_prefetched(
  ctx: &ProxyContext,
  prefetch: &mut Option<Prefetch>,
  key: &str,
) -> Option<PooledConnection> {
  let handle = prefetch.take()?;
  match handle.await {
    Ok(Ok(connection)) if connection.cache_key() == key => Some(connection),
    Ok(Ok(connection)) => {
      ctx.pool.release(connection, false);
      None
    }
    Ok(Err(err)) => {
      tracing::debug!("prefetched connection failed: {}", err);
      None
    }
    Err(err) => {
      tracing::debug!("prefetch task ended: {}", err);
      None
    }
  }
}

async fn bad_gateway(client: &mut HttpStream<BoxedIo>, err: &Error) {
  let mut response = Response::generic(StatusCode::BAD_GATEWAY, Body::from(err.to_string()));
  response
    .headers_unchecked()
    .insert(CONNECTION, HeaderValue::from_static("close"));
  if let Err(err) = client.write_response(&response).await {
    tracing::debug!("failed to write 502 to the client: {}", err);
  }
}

/// Answer a `401` carrying an integrated challenge through the configured
/// upstream authenticator.
async fn authenticate_upstream(ctx: &ProxyContext, session: &mut Session, connection: &mut PooledConnection) {
  if session.response.status_code() != StatusCode::UNAUTHORIZED || session.response.is_locked() {
    return;
  }
  let Some(authenticator) = ctx.interceptors.upstream_authenticator().cloned() else {
    return;
  };
  let Some((scheme, challenge)) = integrated_challenge(session.response.headers()) else {
    return;
  };
  let answer = guarded(
    "upstream_authenticate",
    authenticator.respond(session, &scheme, challenge.as_deref()),
    &ctx.exception_handler,
  )
  .await;
  if let Some(Some(value)) = answer {
    match HeaderValue::from_str(&value) {
      Ok(value) => {
        session.request.headers_unchecked().insert(AUTHORIZATION, value);
        session.server_authenticated = true;
        connection.set_authenticated(true);
        session.re_request = true;
      }
      Err(err) => ctx.report(&Error::from(err)),
    }
  }
}

/// First `WWW-Authenticate` of an integrated scheme and its token.
fn integrated_challenge(headers: &HeaderMap) -> Option<(String, Option<String>)> {
  headers
    .get_all(WWW_AUTHENTICATE)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .find_map(|value| {
      let value = value.trim();
      let (scheme, token) = match value.split_once(' ') {
        Some((scheme, token)) => (scheme, Some(token.trim())),
        None => (value, None),
      };
      INTEGRATED_SCHEMES
        .iter()
        .find(|known| known.eq_ignore_ascii_case(scheme))
        .map(|known| {
          (
            known.to_string(),
            token.filter(|t| !t.is_empty()).map(str::to_string),
          )
        })
    })
}

/// One attempt at sending the request and reading the response head.
struct SendRequest<'a> {
  request: &'a mut Request,
  client: &'a mut HttpStream<BoxedIo>,
  client_body: &'a mut Option<BodyFraming>,
  target_form: String,
  observer: Option<Arc<dyn StreamObserver>>,
  timeout: Duration,
  streamed: bool,
  sent_at: Option<SystemTime>,
}

#[async_trait]
impl<'a> RetryAction<PooledConnection> for SendRequest<'a> {
  type Output = Response;

  async fn run(&mut self, connection: &mut PooledConnection) -> Result<Response> {
    match self.send(connection).await {
      // 请求体已经流式转发，不能再重试
      Err(err) if err.is_retryable() && self.streamed => Err(Error::Other(format!(
        "{} after the request body was streamed",
        err
      ))),
      result => result,
    }
  }
}

impl SendRequest<'_> {
  async fn send(&mut self, connection: &mut PooledConnection) -> Result<Response> {
    let stream = &mut connection.stream;
    stream.set_observer(self.observer.clone());
    self.request.locked = true;
    stream
      .write_headers(&self.request.head_bytes(&self.target_form))
      .await?;
    if stream.is_write_closed() {
      return Err(Error::retryable("server connection closed while sending the request"));
    }
    self.sent_at = Some(SystemTime::now());
    if let Some(framing) = *self.client_body {
      let interim = read_head(stream, self.timeout).await?;
      if interim.status_code() != StatusCode::CONTINUE {
        return Ok(interim);
      }
      self.streamed = true;
      *self.client_body = None;
      continue_client(self.client).await?;
      self.client.copy_body_to(stream, framing).await?;
    } else if let Some(body) = self.request.body() {
      if !body.is_empty() {
        stream.write_body(body, false).await?;
      }
    }
    if stream.is_write_closed() {
      return Err(Error::retryable("server connection closed while sending the request body"));
    }
    loop {
      let response = read_head(stream, self.timeout).await?;
      if response.status_code() != StatusCode::CONTINUE {
        return Ok(response);
      }
    }
  }
}

async fn read_head(stream: &mut HttpStream<MaybeTlsStream>, timeout: Duration) -> Result<Response> {
  tokio::time::timeout(timeout, read_response(stream))
    .await
    .map_err(|_| new_io_error(ErrorKind::TimedOut, "timed out waiting for the server response"))?
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn picks_the_integrated_scheme() {
    let mut headers = HeaderMap::new();
    headers.append(WWW_AUTHENTICATE, HeaderValue::from_static("Basic realm=\"x\""));
    headers.append(WWW_AUTHENTICATE, HeaderValue::from_static("negotiate abc=="));
    assert_eq!(
      integrated_challenge(&headers),
      Some(("Negotiate".to_string(), Some("abc==".to_string())))
    );
    let mut bare = HeaderMap::new();
    bare.insert(WWW_AUTHENTICATE, HeaderValue::from_static("NTLM"));
    assert_eq!(integrated_challenge(&bare), Some(("NTLM".to_string(), None)));
    let mut basic = HeaderMap::new();
    basic.insert(WWW_AUTHENTICATE, HeaderValue::from_static("Basic realm=\"x\""));
    assert_eq!(integrated_challenge(&basic), None);
  }

  #[test]
  fn tunnel_authority_brackets_ipv6() {
    let v6 = TunnelTarget {
      host: "::1".to_string(),
      port: 8443,
      is_https: true,
      authority_from_host: false,
    };
    assert_eq!(v6.authority(), "[::1]:8443");
    let name = TunnelTarget {
      host: "example.com".to_string(),
      port: 443,
      is_https: true,
      authority_from_host: false,
    };
    assert_eq!(name.authority(), "example.com:443");
  }
}
