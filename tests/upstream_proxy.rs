mod common;

use async_trait::async_trait;
use common::*;
use slinger_mitm::{
  ExternalProxy, HookContext, ProxyKind, ProxyServer, RequestInterceptor, ResponseInterceptor, Result, Session,
  UpstreamProxySelector,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;

#[derive(Default)]
struct RecordUrls(Mutex<Vec<String>>);

#[async_trait]
impl RequestInterceptor for RecordUrls {
  async fn before_request(&self, ctx: &mut HookContext<'_>) -> Result<()> {
    self.0.lock().unwrap().push(ctx.request().url());
    Ok(())
  }
}

/// A second proxy the first one chains through, recording what it serves.
async fn start_chained_proxy() -> (SocketAddr, Arc<RecordUrls>) {
  let urls = Arc::new(RecordUrls::default());
  let builder = ProxyServer::builder()
    .config(test_config().build().unwrap())
    .request_interceptor(urls.clone());
  let (_server, addr) = start_proxy(builder).await;
  (addr, urls)
}

fn http_proxy(addr: SocketAddr) -> ExternalProxy {
  ExternalProxy::new(addr.ip().to_string(), addr.port(), ProxyKind::Http)
}

struct ByPath {
  chain: ExternalProxy,
}

#[async_trait]
impl UpstreamProxySelector for ByPath {
  async fn select(&self, session: &Session) -> Result<Option<ExternalProxy>> {
    Ok(session.request().url().contains("/via-chain").then(|| self.chain.clone()))
  }
}

#[tokio::test]
async fn selector_routes_single_sessions_through_a_proxy() {
  let (origin, _) = start_origin(|request| {
    let path = request.start_line().split(' ').nth(1).unwrap_or_default().to_string();
    plain_response("200 OK", &path)
  })
  .await;
  let (chain, chained) = start_chained_proxy().await;
  let builder = ProxyServer::builder()
    .config(test_config().build().unwrap())
    .upstream_proxy_selector(Arc::new(ByPath {
      chain: http_proxy(chain),
    }));
  let (_server, proxy) = start_proxy(builder).await;

  let mut client = TcpStream::connect(proxy).await.unwrap();
  for path in ["/via-chain", "/direct"] {
    send(
      &mut client,
      &format!("GET http://{0}{1} HTTP/1.1\r\nHost: {0}\r\n\r\n", origin, path),
    )
    .await;
    let response = read_message(&mut client).await;
    assert_eq!(response.body_text(), path);
  }
  assert_eq!(
    chained.0.lock().unwrap().as_slice(),
    &[format!("http://{}/via-chain", origin)]
  );
}

struct Failover {
  dead: ExternalProxy,
  backup: Option<ExternalProxy>,
  failures: AtomicUsize,
}

#[async_trait]
impl UpstreamProxySelector for Failover {
  async fn select(&self, _session: &Session) -> Result<Option<ExternalProxy>> {
    Ok(Some(self.dead.clone()))
  }
  async fn on_failure(&self, _session: &Session, failed: &ExternalProxy) -> Result<Option<ExternalProxy>> {
    assert_eq!(failed, &self.dead);
    self.failures.fetch_add(1, Ordering::SeqCst);
    Ok(self.backup.clone())
  }
}

#[derive(Default)]
struct UsedProxy(Mutex<Vec<Option<u16>>>);

#[async_trait]
impl ResponseInterceptor for UsedProxy {
  async fn before_response(&self, _ctx: &mut HookContext<'_>) -> Result<()> {
    Ok(())
  }
  async fn after_response(&self, session: &Session) -> Result<()> {
    self
      .0
      .lock()
      .unwrap()
      .push(session.upstream_proxy().map(|p| p.port()));
    Ok(())
  }
}

#[tokio::test]
async fn failed_proxy_falls_back_to_the_one_the_selector_names() {
  let (origin, _) = start_origin(|_| plain_response("200 OK", "through backup")).await;
  let (chain, chained) = start_chained_proxy().await;
  let selector = Arc::new(Failover {
    dead: http_proxy(closed_port().await),
    backup: Some(http_proxy(chain)),
    failures: AtomicUsize::new(0),
  });
  let used = Arc::new(UsedProxy::default());
  let builder = ProxyServer::builder()
    .config(test_config().build().unwrap())
    .upstream_proxy_selector(selector.clone())
    .response_interceptor(used.clone());
  let (_server, proxy) = start_proxy(builder).await;

  let mut client = TcpStream::connect(proxy).await.unwrap();
  send(
    &mut client,
    &format!("GET http://{0}/ HTTP/1.1\r\nHost: {0}\r\n\r\n", origin),
  )
  .await;
  let response = read_message(&mut client).await;
  assert_eq!(response.start_line(), "HTTP/1.1 200 OK");
  assert_eq!(response.body_text(), "through backup");
  assert_eq!(selector.failures.load(Ordering::SeqCst), 1);
  assert_eq!(chained.0.lock().unwrap().len(), 1);
  for _ in 0..100 {
    if !used.0.lock().unwrap().is_empty() {
      break;
    }
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
  }
  assert_eq!(used.0.lock().unwrap().as_slice(), &[Some(chain.port())]);
}

#[tokio::test]
async fn no_fallback_is_a_bad_gateway() {
  let (origin, accepted) = start_origin(|_| plain_response("200 OK", "unreachable")).await;
  let selector = Arc::new(Failover {
    dead: http_proxy(closed_port().await),
    backup: None,
    failures: AtomicUsize::new(0),
  });
  let builder = ProxyServer::builder()
    .config(test_config().build().unwrap())
    .upstream_proxy_selector(selector.clone());
  let (_server, proxy) = start_proxy(builder).await;

  let mut client = TcpStream::connect(proxy).await.unwrap();
  send(
    &mut client,
    &format!("GET http://{0}/ HTTP/1.1\r\nHost: {0}\r\n\r\n", origin),
  )
  .await;
  let response = read_message(&mut client).await;
  assert!(response.start_line().starts_with("HTTP/1.1 502"));
  assert_eq!(selector.failures.load(Ordering::SeqCst), 1);
  assert_eq!(accepted.load(Ordering::SeqCst), 0);
}
