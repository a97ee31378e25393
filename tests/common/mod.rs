#![allow(dead_code)]
use slinger_mitm::{ProxyConfig, ProxyServer, ProxyServerBuilder};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// A response or request as the test peers see it.
#[derive(Debug)]
pub struct Message {
  pub head: String,
  pub body: Vec<u8>,
}

impl Message {
  pub fn start_line(&self) -> &str {
    self.head.lines().next().unwrap_or_default()
  }

  pub fn header(&self, name: &str) -> Option<String> {
    self.head.lines().skip(1).find_map(|line| {
      let (key, value) = line.split_once(':')?;
      key
        .trim()
        .eq_ignore_ascii_case(name)
        .then(|| value.trim().to_string())
    })
  }

  pub fn body_text(&self) -> String {
    String::from_utf8_lossy(&self.body).to_string()
  }
}

pub fn test_config() -> slinger_mitm::ProxyConfigBuilder {
  ProxyConfig::builder()
    .connection_timeout(Duration::from_secs(5))
    .connect_timeout(Duration::from_secs(5))
}

/// Serve `builder` on an ephemeral port.
pub async fn start_proxy(builder: ProxyServerBuilder) -> (ProxyServer, SocketAddr) {
  let server = builder.build().await.unwrap();
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let serving = server.clone();
  tokio::spawn(async move {
    serving.serve(listener).await.unwrap();
  });
  (server, addr)
}

/// Serve `builder` as a transparent endpoint on an ephemeral port.
pub async fn start_transparent_proxy(builder: ProxyServerBuilder) -> (ProxyServer, SocketAddr) {
  let server = builder.build().await.unwrap();
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let serving = server.clone();
  tokio::spawn(async move {
    serving.serve_transparent(listener).await.unwrap();
  });
  (server, addr)
}

/// Read raw bytes until they end with `suffix`.
pub async fn read_until<S: AsyncRead + Unpin>(stream: &mut S, suffix: &[u8]) -> Vec<u8> {
  let mut data = Vec::new();
  let mut byte = [0u8; 1];
  while !data.ends_with(suffix) {
    let n = stream.read(&mut byte).await.unwrap();
    assert_ne!(n, 0, "eof before {:?}: {:?}", suffix, String::from_utf8_lossy(&data));
    data.push(byte[0]);
  }
  data
}

/// Read one message framed by `Content-Length`, or an empty body without it.
pub async fn read_message<S: AsyncRead + Unpin>(stream: &mut S) -> Message {
  let mut head = Vec::new();
  let mut byte = [0u8; 1];
  while !head.ends_with(b"\r\n\r\n") {
    let n = stream.read(&mut byte).await.unwrap();
    assert_ne!(n, 0, "eof inside head: {:?}", String::from_utf8_lossy(&head));
    head.push(byte[0]);
  }
  let head = String::from_utf8(head).unwrap();
  let mut message = Message { head, body: Vec::new() };
  let length = message
    .header("content-length")
    .and_then(|v| v.parse::<usize>().ok())
    .unwrap_or(0);
  message.body = vec![0u8; length];
  stream.read_exact(&mut message.body).await.unwrap();
  message
}

pub async fn send<S: AsyncWrite + Unpin>(stream: &mut S, raw: &str) {
  stream.write_all(raw.as_bytes()).await.unwrap();
  stream.flush().await.unwrap();
}

pub fn plain_response(status: &str, body: &str) -> String {
  format!("HTTP/1.1 {}\r\nContent-Length: {}\r\n\r\n{}", status, body.len(), body)
}

/// An origin that answers every request on every connection through
/// `answer`. Returns its address and the number of accepted connections.
pub async fn start_origin<F>(answer: F) -> (SocketAddr, Arc<AtomicUsize>)
where
  F: Fn(&Message) -> String + Send + Sync + 'static,
{
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let accepted = Arc::new(AtomicUsize::new(0));
  let counter = accepted.clone();
  let answer = Arc::new(answer);
  tokio::spawn(async move {
    loop {
      let Ok((mut stream, _)) = listener.accept().await else {
        return;
      };
      counter.fetch_add(1, Ordering::SeqCst);
      let answer = answer.clone();
      tokio::spawn(async move {
        loop {
          let Some(request) = try_read_message(&mut stream).await else {
            return;
          };
          if stream.write_all(answer(&request).as_bytes()).await.is_err() {
            return;
          }
        }
      });
    }
  });
  (addr, accepted)
}

/// Like [`read_message`] but `None` when the peer closed before a head.
pub async fn try_read_message(stream: &mut TcpStream) -> Option<Message> {
  let mut first = [0u8; 1];
  match stream.peek(&mut first).await {
    Ok(0) | Err(_) => None,
    Ok(_) => Some(read_message(stream).await),
  }
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  listener.local_addr().unwrap()
}
