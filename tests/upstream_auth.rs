mod common;

use async_trait::async_trait;
use common::*;
use slinger_mitm::interceptor::UpstreamAuthenticator;
use slinger_mitm::{ProxyServer, Result, Session};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;

#[derive(Default)]
struct NtlmResponder {
  challenges: Mutex<Vec<(String, Option<String>)>>,
}

#[async_trait]
impl UpstreamAuthenticator for NtlmResponder {
  async fn respond(&self, _session: &Session, scheme: &str, challenge: Option<&str>) -> Result<Option<String>> {
    self
      .challenges
      .lock()
      .unwrap()
      .push((scheme.to_string(), challenge.map(str::to_string)));
    Ok(Some("NTLM token".to_string()))
  }
}

#[tokio::test]
async fn integrated_challenge_is_answered_on_the_same_connection() {
  let requests = Arc::new(AtomicUsize::new(0));
  let seen = requests.clone();
  let (origin, accepted) = start_origin(move |request| {
    seen.fetch_add(1, Ordering::SeqCst);
    match request.header("authorization").as_deref() {
      Some("NTLM token") => plain_response("200 OK", "welcome"),
      _ => "HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: NTLM\r\nContent-Length: 6\r\n\r\ndenied".to_string(),
    }
  })
  .await;
  let responder = Arc::new(NtlmResponder::default());
  let builder = ProxyServer::builder()
    .config(test_config().build().unwrap())
    .upstream_authenticator(responder.clone());
  let (_server, proxy) = start_proxy(builder).await;

  let mut client = TcpStream::connect(proxy).await.unwrap();
  send(
    &mut client,
    &format!("GET http://{0}/private HTTP/1.1\r\nHost: {0}\r\n\r\n", origin),
  )
  .await;
  let response = read_message(&mut client).await;
  assert_eq!(response.start_line(), "HTTP/1.1 200 OK");
  assert_eq!(response.body_text(), "welcome");
  assert_eq!(accepted.load(Ordering::SeqCst), 1);
  assert_eq!(requests.load(Ordering::SeqCst), 2);
  assert_eq!(
    responder.challenges.lock().unwrap().as_slice(),
    &[("NTLM".to_string(), None)]
  );
}

#[tokio::test]
async fn challenge_without_authenticator_reaches_the_client() {
  let (origin, _) = start_origin(|_| {
    "HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: Negotiate\r\nContent-Length: 6\r\n\r\ndenied".to_string()
  })
  .await;
  let (_server, proxy) = start_proxy(ProxyServer::builder().config(test_config().build().unwrap())).await;

  let mut client = TcpStream::connect(proxy).await.unwrap();
  send(
    &mut client,
    &format!("GET http://{0}/private HTTP/1.1\r\nHost: {0}\r\n\r\n", origin),
  )
  .await;
  let response = read_message(&mut client).await;
  assert!(response.start_line().starts_with("HTTP/1.1 401"));
  assert_eq!(response.header("www-authenticate").as_deref(), Some("Negotiate"));
  assert_eq!(response.body_text(), "denied");
}
