use super::exchange::{handle_http, HttpExit, Prefetch, TunnelTarget};
use super::{ProxyContext, Session};
use crate::connector::UpstreamTarget;
use crate::errors::{Error, Result};
use crate::header::{contains_token, PROXY_CONNECTION};
use crate::interceptor::Leg;
use crate::pool::PooledConnection;
use crate::request::{peek_method, split_host_port, KnownMethod, Request};
use crate::response::Response;
use crate::sniffer::{peek_client_hello, peek_server_hello, ClientHello, ServerHello};
use crate::socket::BoxedIo;
use crate::stream::HttpStream;
use http::{Method, Version};
use std::net::SocketAddr;
use tokio_rustls::TlsAcceptor;

/// A CONNECT request and the decisions tunnel interceptors take on it.
#[derive(Debug)]
pub struct TunnelSession {
  session: Session,
  host: String,
  port: u16,
  client_hello: Option<ClientHello>,
  server_hello: Option<ServerHello>,
  decrypt_ssl: bool,
  denied: bool,
  deny_response: Option<Response>,
  passthrough: bool,
  transparent: bool,
}

impl TunnelSession {
  pub(crate) fn new(session: Session, host: String, port: u16, decrypt_ssl: bool) -> Self {
    TunnelSession {
      session,
      host,
      port,
      client_hello: None,
      server_hello: None,
      decrypt_ssl,
      denied: false,
      deny_response: None,
      passthrough: false,
      transparent: false,
    }
  }

  #[cfg(test)]
  pub(crate) fn for_test(host: &str, port: u16) -> Self {
    let request = Request::new(http::Method::CONNECT, format!("{}:{}", host, port), http::Version::HTTP_11);
    TunnelSession::new(Session::new(request), host.to_string(), port, true)
  }

  /// The session of the CONNECT request.
  pub fn session(&self) -> &Session {
    &self.session
  }
  /// The CONNECT request.
  pub fn request(&self) -> &Request {
    &self.session.request
  }
  /// Tunnel destination host.
  pub fn host(&self) -> &str {
    &self.host
  }
  /// Tunnel destination port.
  pub fn port(&self) -> u16 {
    self.port
  }
  /// The sniffed ClientHello, available to `before_tunnel_response`.
  pub fn client_hello(&self) -> Option<&ClientHello> {
    self.client_hello.as_ref()
  }
  /// The sniffed ServerHello of a relayed tunnel.
  pub fn server_hello(&self) -> Option<&ServerHello> {
    self.server_hello.as_ref()
  }
  /// Whether the tunnel will be decrypted.
  pub fn decrypt_ssl(&self) -> bool {
    self.decrypt_ssl
  }
  /// Turn decryption of this tunnel on or off.
  pub fn set_decrypt_ssl(&mut self, decrypt_ssl: bool) {
    self.decrypt_ssl = decrypt_ssl;
  }
  /// Refuse the tunnel with `403 Forbidden`.
  pub fn deny(&mut self) {
    self.denied = true;
  }
  /// Refuse the tunnel with `response`.
  pub fn deny_with(&mut self, response: Response) {
    self.denied = true;
    self.deny_response = Some(response);
  }
  /// Whether the tunnel was refused.
  pub fn is_denied(&self) -> bool {
    self.denied
  }
  /// Relay the tunnel without decrypting, whatever `decrypt_ssl` says.
  pub fn force_passthrough(&mut self) {
    self.passthrough = true;
  }
  /// Whether the tunnel is relayed raw.
  pub fn is_passthrough(&self) -> bool {
    self.passthrough
  }
  /// Whether the connection arrived on a transparent endpoint, without a
  /// CONNECT. Its request is synthesized from the SNI.
  pub fn is_transparent(&self) -> bool {
    self.transparent
  }
}

/// Handle a CONNECT. Returns the client back when a keep-alive `407` asks
/// for another authentication round on the same connection.
pub(super) async fn handle_connect(
  ctx: &ProxyContext,
  mut client: HttpStream<BoxedIo>,
  client_addr: Option<SocketAddr>,
  connect: Request,
) -> Result<Option<HttpStream<BoxedIo>>> {
  let (host, port) = split_host_port(connect.target(), 443)?;
  let version = connect.version();
  let mut session = ctx.new_session(connect, client_addr);
  session.stamp("Request Received");
  tracing::debug!("session #{} CONNECT {}:{}", session.id(), host, port);

  let (denied, err) = ctx.authorization.check(&session).await;
  if let Some(err) = err {
    ctx.report(&err);
  }
  if let Some(response) = denied {
    client.write_response(&response).await?;
    let keep_alive =
      contains_token(response.headers(), PROXY_CONNECTION, "keep-alive") && session.request.keep_alive();
    if keep_alive && !client.is_write_closed() {
      return Ok(Some(client));
    }
    client.shutdown().await?;
    return Ok(None);
  }

  let mut tunnel = TunnelSession::new(session, host, port, ctx.config.decrypt_ssl);
  ctx
    .interceptors
    .before_tunnel_request(&mut tunnel, &ctx.exception_handler)
    .await;
  if tunnel.denied {
    let response = tunnel.deny_response.take().unwrap_or_else(Response::forbidden);
    tracing::debug!("tunnel to {}:{} denied", tunnel.host, tunnel.port);
    client.write_response(&response).await?;
    client.shutdown().await?;
    return Ok(None);
  }

  client
    .write_response(&Response::connection_established(version))
    .await?;
  tunnel.session.stamp("Response Sent");

  tunnel.client_hello = match peek_client_hello(&mut client).await {
    Ok(hello) => hello,
    Err(err) => {
      tracing::debug!("no client hello on tunnel to {}: {}", tunnel.host, err);
      None
    }
  };
  ctx
    .interceptors
    .before_tunnel_response(&mut tunnel, &ctx.exception_handler)
    .await;

  if tunnel.passthrough {
    return relay(ctx, client, &mut tunnel).await;
  }
  if tunnel.client_hello.is_some() {
    if tunnel.decrypt_ssl {
      return decrypt(ctx, client, client_addr, tunnel).await;
    }
    return relay(ctx, client, &mut tunnel).await;
  }
  if client.available() == 0 && client.is_read_closed() {
    return Ok(None);
  }
  // 隧道里是明文 HTTP
  match peek_method(&mut client).await? {
    KnownMethod::Other | KnownMethod::Unknown => {
      let target = TunnelTarget {
        host: tunnel.host.clone(),
        port: tunnel.port,
        is_https: false,
        authority_from_host: false,
      };
      plain_http(ctx, &mut client, client_addr, &target).await?;
      client.shutdown().await?;
      Ok(None)
    }
    _ => relay(ctx, client, &mut tunnel).await,
  }
}

async fn plain_http(
  ctx: &ProxyContext,
  client: &mut HttpStream<BoxedIo>,
  client_addr: Option<SocketAddr>,
  target: &TunnelTarget,
) -> Result<()> {
  match handle_http(ctx, client, client_addr, Some(target), None).await? {
    HttpExit::Closed => Ok(()),
    HttpExit::Connect(_) => Err(Error::protocol("CONNECT inside a tunnel")),
  }
}

/// Terminate the client TLS with a minted leaf and serve the decrypted
/// requests.
async fn decrypt(
  ctx: &ProxyContext,
  client: HttpStream<BoxedIo>,
  client_addr: Option<SocketAddr>,
  tunnel: TunnelSession,
) -> Result<Option<HttpStream<BoxedIo>>> {
  let sni = tunnel.client_hello.as_ref().and_then(|hello| hello.sni_host());
  let authority_from_host = tunnel.transparent && sni.is_none();
  let sni = sni.unwrap_or_else(|| tunnel.host.clone());
  let mut prefetch: Option<Prefetch> = None;
  if ctx.config.enable_tcp_server_connection_prefetch && !authority_from_host {
    let pool = ctx.pool.clone();
    let target = UpstreamTarget::new(tunnel.host.clone(), tunnel.port, true);
    prefetch = Some(tokio::spawn(async move { pool.get_connection(&target, true).await }));
  }
  let accepted = async {
    let server_config = ctx.certificates.tls_server_config(&sni).await?;
    let tls = TlsAcceptor::from(server_config).accept(client).await?;
    Ok::<_, Error>(tls)
  }
  .await;
  let tls = match accepted {
    Ok(tls) => tls,
    Err(err) => {
      if let Some(handle) = prefetch {
        handle.abort();
      }
      return Err(err);
    }
  };
  let io: BoxedIo = Box::new(tls);
  let mut inner = HttpStream::new(io, &ctx.buffer_pool, true);
  inner.set_observer(ctx.interceptors.observer(Leg::DecryptedClient));

  let method = peek_method(&mut inner).await?;
  if method == KnownMethod::Invalid {
    if inner.available() == 0 && inner.is_read_closed() {
      return Ok(None);
    }
    // 解密后不是 HTTP，原样转发到 https 上游
    let connection = match prefetch {
      Some(handle) => match handle.await {
        Ok(Ok(connection)) => connection,
        _ => {
          ctx
            .pool
            .get_connection(&UpstreamTarget::new(tunnel.host.clone(), tunnel.port, true), false)
            .await?
        }
      },
      None => {
        ctx
          .pool
          .get_connection(&UpstreamTarget::new(tunnel.host.clone(), tunnel.port, true), false)
          .await?
      }
    };
    splice(ctx, &mut inner, connection).await;
    return Ok(None);
  }

  let target = TunnelTarget {
    host: tunnel.host.clone(),
    port: tunnel.port,
    is_https: true,
    authority_from_host,
  };
  let result = match handle_http(ctx, &mut inner, client_addr, Some(&target), prefetch).await {
    Ok(HttpExit::Closed) => Ok(None),
    Ok(HttpExit::Connect(_)) => Err(Error::protocol("CONNECT inside a tunnel")),
    Err(err) => Err(err),
  };
  let _ = inner.shutdown().await;
  result
}

/// Serve a connection accepted on a transparent endpoint.
///
/// A ClientHello makes it a TLS tunnel to its SNI host on the configured
/// port, handled like a CONNECT that was already accepted. Anything else is
/// plain HTTP routed by the `Host` header.
pub(crate) async fn handle_transparent(
  ctx: &ProxyContext,
  mut client: HttpStream<BoxedIo>,
  client_addr: Option<SocketAddr>,
) -> Result<()> {
  let hello = match peek_client_hello(&mut client).await {
    Ok(hello) => hello,
    Err(err) => {
      tracing::debug!("no client hello on transparent connection: {}", err);
      None
    }
  };
  let Some(hello) = hello else {
    if client.available() == 0 && client.is_read_closed() {
      return Ok(());
    }
    let target = TunnelTarget {
      host: String::new(),
      port: 80,
      is_https: false,
      authority_from_host: true,
    };
    let served = plain_http(ctx, &mut client, client_addr, &target).await;
    let _ = client.shutdown().await;
    return served;
  };
  let host = hello
    .sni_host()
    .unwrap_or_else(|| ctx.config.transparent_certificate_name.clone());
  let port = ctx.config.transparent_https_port;
  let authority = if host.contains(':') {
    format!("[{}]:{}", host, port)
  } else {
    format!("{}:{}", host, port)
  };
  let request = Request::new(Method::CONNECT, authority, Version::HTTP_11);
  let mut session = ctx.new_session(request, client_addr);
  session.stamp("Request Received");
  tracing::debug!("session #{} transparent tls to {}:{}", session.id(), host, port);

  let mut tunnel = TunnelSession::new(session, host, port, ctx.config.decrypt_ssl);
  tunnel.transparent = true;
  tunnel.client_hello = Some(hello);
  ctx
    .interceptors
    .before_tunnel_request(&mut tunnel, &ctx.exception_handler)
    .await;
  // 还没有 TLS 会话，拒绝只能直接断开
  if tunnel.denied {
    tracing::debug!("transparent tunnel to {}:{} denied", tunnel.host, tunnel.port);
    client.shutdown().await?;
    return Ok(());
  }
  ctx
    .interceptors
    .before_tunnel_response(&mut tunnel, &ctx.exception_handler)
    .await;
  if tunnel.passthrough || !tunnel.decrypt_ssl {
    relay(ctx, client, &mut tunnel).await?;
  } else {
    decrypt(ctx, client, client_addr, tunnel).await?;
  }
  Ok(())
}

/// Relay the tunnel raw, forwarding whatever the client already sent.
async fn relay(
  ctx: &ProxyContext,
  mut client: HttpStream<BoxedIo>,
  tunnel: &mut TunnelSession,
) -> Result<Option<HttpStream<BoxedIo>>> {
  let mut connection = ctx
    .pool
    .get_connection(&UpstreamTarget::raw(tunnel.host.clone(), tunnel.port), false)
    .await?;
  connection
    .stream
    .set_observer(ctx.interceptors.observer(Leg::Server));
  if client.available() > 0 {
    let mut early = vec![0u8; client.available()];
    let n = client.read(&mut early).await?;
    connection.stream.write_all(&early[..n]).await?;
    connection.stream.flush().await?;
  }
  if tunnel.client_hello.is_some() {
    match peek_server_hello(&mut connection.stream).await {
      Ok(hello) => {
        if let Some(hello) = &hello {
          tracing::debug!(
            "tunnel to {}:{} negotiated cipher suite {:#06x}",
            tunnel.host,
            tunnel.port,
            hello.cipher_suite
          );
        }
        tunnel.server_hello = hello;
      }
      Err(err) => tracing::debug!("no server hello from {}: {}", tunnel.host, err),
    }
  }
  splice(ctx, &mut client, connection).await;
  Ok(None)
}

async fn splice<S>(ctx: &ProxyContext, client: &mut HttpStream<S>, mut connection: PooledConnection)
where
  S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
  match tokio::io::copy_bidirectional(client, &mut connection.stream).await {
    Ok((up, down)) => tracing::debug!(
      "tunnel to {}:{} closed, {} bytes up, {} bytes down",
      connection.host(),
      connection.port(),
      up,
      down
    ),
    Err(err) => tracing::debug!("tunnel to {}:{} ended: {}", connection.host(), connection.port(), err),
  }
  ctx.pool.release(connection, true);
}
