mod common;

use async_trait::async_trait;
use common::*;
use slinger_mitm::{
  CertificateConfig, CertificateManager, HookContext, ProxyServer, RequestInterceptor, Result, TunnelInterceptor,
  TunnelSession,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::crypto::ring::default_provider;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// A TLS origin with its own authority, answering `body` to every request.
async fn start_tls_origin(body: &'static str) -> (SocketAddr, CertificateManager) {
  let authority = CertificateManager::new(CertificateConfig::default()).await.unwrap();
  let acceptor = TlsAcceptor::from(authority.tls_server_config("127.0.0.1").await.unwrap());
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    loop {
      let Ok((stream, _)) = listener.accept().await else {
        return;
      };
      let acceptor = acceptor.clone();
      tokio::spawn(async move {
        let Ok(mut tls) = acceptor.accept(stream).await else {
          return;
        };
        let _ = read_message(&mut tls).await;
        send(&mut tls, &plain_response("200 OK", body)).await;
      });
    }
  });
  (addr, authority)
}

fn connector_trusting(root: &CertificateDer<'static>) -> TlsConnector {
  let mut roots = RootCertStore::empty();
  roots.add(root.clone()).unwrap();
  let config = ClientConfig::builder_with_provider(Arc::new(default_provider()))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
  TlsConnector::from(Arc::new(config))
}

async fn open_tunnel(proxy: SocketAddr, origin: SocketAddr) -> (TcpStream, Message) {
  let mut client = TcpStream::connect(proxy).await.unwrap();
  send(
    &mut client,
    &format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n", origin),
  )
  .await;
  let reply = read_message(&mut client).await;
  (client, reply)
}

#[derive(Default)]
struct RecordUrls(Mutex<Vec<String>>);

#[async_trait]
impl RequestInterceptor for RecordUrls {
  async fn before_request(&self, ctx: &mut HookContext<'_>) -> Result<()> {
    self.0.lock().unwrap().push(ctx.request().url());
    Ok(())
  }
}

#[tokio::test]
async fn decrypted_tunnel_is_served_with_a_minted_leaf() {
  let (origin, _) = start_tls_origin("secure").await;
  let urls = Arc::new(RecordUrls::default());
  let builder = ProxyServer::builder()
    .config(test_config().build().unwrap())
    .request_interceptor(urls.clone());
  let (server, proxy) = start_proxy(builder).await;

  let (client, reply) = open_tunnel(proxy, origin).await;
  assert!(reply.start_line().starts_with("HTTP/1.1 200"));

  let connector = connector_trusting(server.certificates().root().certificate_der());
  let name = ServerName::try_from("127.0.0.1").unwrap();
  let mut tls = connector.connect(name, client).await.unwrap();
  send(
    &mut tls,
    &format!("GET /secret HTTP/1.1\r\nHost: {}\r\n\r\n", origin),
  )
  .await;
  let response = read_message(&mut tls).await;
  assert_eq!(response.start_line(), "HTTP/1.1 200 OK");
  assert_eq!(response.body_text(), "secure");
  assert_eq!(
    urls.0.lock().unwrap().as_slice(),
    &[format!("https://{}/secret", origin)]
  );
}

struct DenyAll;

#[async_trait]
impl TunnelInterceptor for DenyAll {
  async fn before_tunnel_request(&self, tunnel: &mut TunnelSession) -> Result<()> {
    tunnel.deny();
    Ok(())
  }
}

#[tokio::test]
async fn denied_tunnel_gets_forbidden() {
  let (origin, _) = start_tls_origin("unreachable").await;
  let builder = ProxyServer::builder()
    .config(test_config().build().unwrap())
    .tunnel_interceptor(Arc::new(DenyAll));
  let (_server, proxy) = start_proxy(builder).await;

  let (_client, reply) = open_tunnel(proxy, origin).await;
  assert!(reply.start_line().starts_with("HTTP/1.1 403"));
}

#[derive(Default)]
struct SeenHello(Mutex<Option<bool>>);

#[async_trait]
impl TunnelInterceptor for SeenHello {
  async fn before_tunnel_response(&self, tunnel: &mut TunnelSession) -> Result<()> {
    *self.0.lock().unwrap() = Some(tunnel.client_hello().is_some());
    Ok(())
  }
}

#[tokio::test]
async fn undecrypted_tunnel_relays_the_origin_certificate() {
  let (origin, authority) = start_tls_origin("end to end").await;
  let seen = Arc::new(SeenHello::default());
  let builder = ProxyServer::builder()
    .config(test_config().decrypt_ssl(false).build().unwrap())
    .tunnel_interceptor(seen.clone());
  let (_server, proxy) = start_proxy(builder).await;

  let (client, reply) = open_tunnel(proxy, origin).await;
  assert!(reply.start_line().starts_with("HTTP/1.1 200"));

  // 只信任源站自己的根证书，握手成功说明没有被解密
  let connector = connector_trusting(authority.root().certificate_der());
  let name = ServerName::try_from("127.0.0.1").unwrap();
  let mut tls = connector.connect(name, client).await.unwrap();
  send(&mut tls, "GET / HTTP/1.1\r\nHost: origin\r\n\r\n").await;
  let response = read_message(&mut tls).await;
  assert_eq!(response.body_text(), "end to end");
  assert_eq!(*seen.0.lock().unwrap(), Some(true));
}

#[derive(Default)]
struct DenyTransparent(Mutex<Vec<(String, u16, bool)>>);

#[async_trait]
impl TunnelInterceptor for DenyTransparent {
  async fn before_tunnel_request(&self, tunnel: &mut TunnelSession) -> Result<()> {
    self
      .0
      .lock()
      .unwrap()
      .push((tunnel.host().to_string(), tunnel.port(), tunnel.is_transparent()));
    tunnel.deny();
    Ok(())
  }
}

#[tokio::test]
async fn transparent_tls_is_decrypted_for_the_sni_host() {
  let (origin, _) = start_tls_origin("transparent").await;
  let urls = Arc::new(RecordUrls::default());
  let config = test_config().transparent_https_port(origin.port()).build().unwrap();
  let builder = ProxyServer::builder().config(config).request_interceptor(urls.clone());
  let (server, proxy) = start_transparent_proxy(builder).await;

  let client = TcpStream::connect(proxy).await.unwrap();
  let connector = connector_trusting(server.certificates().root().certificate_der());
  let name = ServerName::try_from("localhost").unwrap();
  let mut tls = connector.connect(name, client).await.unwrap();
  send(&mut tls, "GET /redirected HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
  let response = read_message(&mut tls).await;
  assert_eq!(response.start_line(), "HTTP/1.1 200 OK");
  assert_eq!(response.body_text(), "transparent");
  assert_eq!(
    urls.0.lock().unwrap().as_slice(),
    &[format!("https://localhost:{}/redirected", origin.port())]
  );
}

#[tokio::test]
async fn transparent_plain_http_follows_the_host_header() {
  let (origin, _) = start_origin(|request| plain_response("200 OK", request.start_line())).await;
  let builder = ProxyServer::builder().config(test_config().build().unwrap());
  let (_server, proxy) = start_transparent_proxy(builder).await;

  let mut client = TcpStream::connect(proxy).await.unwrap();
  send(
    &mut client,
    &format!("GET /plain?q=1 HTTP/1.1\r\nHost: {}\r\n\r\n", origin),
  )
  .await;
  let response = read_message(&mut client).await;
  assert_eq!(response.start_line(), "HTTP/1.1 200 OK");
  assert_eq!(response.body_text(), "GET /plain?q=1 HTTP/1.1");
}

#[tokio::test]
async fn denied_transparent_tunnel_is_dropped() {
  let interceptor = Arc::new(DenyTransparent::default());
  let config = test_config().transparent_https_port(8443).build().unwrap();
  let builder = ProxyServer::builder().config(config).tunnel_interceptor(interceptor.clone());
  let (server, proxy) = start_transparent_proxy(builder).await;

  let client = TcpStream::connect(proxy).await.unwrap();
  let connector = connector_trusting(server.certificates().root().certificate_der());
  let name = ServerName::try_from("blocked.example").unwrap();
  assert!(connector.connect(name, client).await.is_err());
  assert_eq!(
    interceptor.0.lock().unwrap().as_slice(),
    &[("blocked.example".to_string(), 8443, true)]
  );
}
