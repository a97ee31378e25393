use crate::body::Body;
use crate::errors::{Error, Result};
use crate::header::{self, BodyFraming};
use crate::stream::HttpStream;
use crate::{CR_LF, SPACE};
use bytes::Bytes;
use http::header::{EXPECT, HOST, UPGRADE};
use http::{HeaderMap, Method, Version};
use std::fmt::{Debug, Formatter};
use tokio::io::{AsyncRead, AsyncWrite};

/// A request read from a client, possibly rewritten by interceptors.
#[derive(Clone)]
pub struct Request {
  method: Method,
  target: String,
  version: Version,
  headers: HeaderMap,
  body: Option<Body>,
  pub(crate) body_read: bool,
  pub(crate) locked: bool,
  pub(crate) cancel_request: bool,
  is_https: bool,
  authority: Option<String>,
}

impl Debug for Request {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Request")
      .field("method", &self.method)
      .field("target", &self.target)
      .field("version", &self.version)
      .field("headers", &self.headers)
      .field("body", &self.body)
      .field("is_https", &self.is_https)
      .finish()
  }
}

impl Request {
  /// Build a request from its start line parts.
  pub fn new(method: Method, target: impl Into<String>, version: Version) -> Self {
    Request {
      method,
      target: target.into(),
      version,
      headers: HeaderMap::new(),
      body: None,
      body_read: false,
      locked: false,
      cancel_request: false,
      is_https: false,
      authority: None,
    }
  }
  /// Get the method.
  pub fn method(&self) -> &Method {
    &self.method
  }
  /// The request target exactly as it appeared on the request line.
  pub fn target(&self) -> &str {
    &self.target
  }
  /// Replace the request target.
  pub fn set_target(&mut self, target: impl Into<String>) -> Result<()> {
    self.ensure_unlocked()?;
    self.target = target.into();
    Ok(())
  }
  /// Get the http version.
  pub fn version(&self) -> Version {
    self.version
  }
  /// Get the headers.
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }
  /// Get a mutable reference to the headers, refused once the request was sent.
  pub fn headers_mut(&mut self) -> Result<&mut HeaderMap> {
    self.ensure_unlocked()?;
    Ok(&mut self.headers)
  }
  pub(crate) fn headers_unchecked(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }
  /// Materialized body, if it has been read or replaced.
  pub fn body(&self) -> Option<&Body> {
    self.body.as_ref()
  }
  /// Replace the body; `Content-Length` is recomputed when written.
  pub fn set_body(&mut self, body: impl Into<Body>) -> Result<()> {
    self.ensure_unlocked()?;
    self.body = Some(body.into());
    self.body_read = true;
    Ok(())
  }
  pub(crate) fn store_body(&mut self, body: Bytes) {
    self.body = Some(body.into());
    self.body_read = true;
  }
  /// Whether the request has been sent upstream.
  pub fn is_locked(&self) -> bool {
    self.locked
  }
  /// Whether the request travels inside a decrypted tunnel.
  pub fn is_https(&self) -> bool {
    self.is_https
  }
  pub(crate) fn set_https(&mut self, is_https: bool) {
    self.is_https = is_https;
  }
  /// `host:port` of the tunnel this request arrived on, if any.
  pub fn authority(&self) -> Option<&str> {
    self.authority.as_deref()
  }
  pub(crate) fn set_authority(&mut self, authority: Option<String>) {
    self.authority = authority;
  }
  fn ensure_unlocked(&self) -> Result<()> {
    if self.locked {
      return Err(Error::Other(
        "request is locked, it has already been sent to the server".to_string(),
      ));
    }
    Ok(())
  }

  /// Destination host and port, from the tunnel, an absolute target or `Host`.
  pub fn host_port(&self) -> Result<(String, u16)> {
    let default_port = if self.is_https { 443 } else { 80 };
    if let Some(authority) = &self.authority {
      return split_host_port(authority, default_port);
    }
    if let Ok(uri) = self.target.parse::<http::Uri>() {
      if let Some(host) = uri.host() {
        let port = uri.port_u16().unwrap_or(match uri.scheme_str() {
          Some("https") => 443,
          _ => default_port,
        });
        return Ok((host.trim_matches(|c| c == '[' || c == ']').to_string(), port));
      }
    }
    let host = self
      .headers
      .get(HOST)
      .and_then(|h| h.to_str().ok())
      .ok_or_else(|| Error::protocol("request has no host"))?;
    split_host_port(host, default_port)
  }

  /// The target in origin form (`/path?query`).
  pub fn origin_form(&self) -> String {
    if self.target.starts_with('/') || self.method == Method::OPTIONS && self.target == "*" {
      return self.target.clone();
    }
    match self.target.parse::<http::Uri>() {
      Ok(uri) if uri.scheme().is_some() => uri
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "/".to_string()),
      _ => self.target.clone(),
    }
  }

  /// Full URL, used for logging and by interceptors.
  pub fn url(&self) -> String {
    if self.target.contains("://") {
      return self.target.clone();
    }
    let scheme = if self.is_https { "https" } else { "http" };
    match self.host_port() {
      Ok((host, port)) if port == 80 && !self.is_https || port == 443 && self.is_https => {
        format!("{}://{}{}", scheme, host, self.origin_form())
      }
      Ok((host, port)) => format!("{}://{}:{}{}", scheme, host, port, self.origin_form()),
      Err(_) => self.target.clone(),
    }
  }

  /// Whether the client keeps the connection open after this exchange.
  pub fn keep_alive(&self) -> bool {
    header::keep_alive(&self.headers, self.version)
  }
  /// Whether the client waits for `100 Continue` before sending the body.
  pub fn expect_continue(&self) -> bool {
    header::contains_token(&self.headers, EXPECT, "100-continue")
  }
  /// Whether this request asks to switch to the websocket protocol.
  pub fn upgrade_to_websocket(&self) -> bool {
    header::contains_token(&self.headers, UPGRADE, "websocket")
  }
  /// Whether the body uses chunked transfer coding.
  pub fn is_chunked(&self) -> bool {
    header::is_chunked(&self.headers)
  }
  /// Declared `Content-Length`.
  pub fn content_length(&self) -> Option<u64> {
    header::content_length(&self.headers)
  }
  /// How the request body is delimited.
  pub fn framing(&self) -> BodyFraming {
    if self.is_chunked() {
      BodyFraming::Chunked
    } else {
      match self.content_length() {
        Some(n) if n > 0 => BodyFraming::Length(n),
        _ => BodyFraming::None,
      }
    }
  }
  /// Whether body bytes follow the head.
  pub fn has_body(&self) -> bool {
    self.framing().has_body()
  }

  /// Serialize the request line and headers.
  pub(crate) fn head_bytes(&self, target: &str) -> Bytes {
    let mut buf = Vec::with_capacity(256);
    buf.extend(self.method.as_str().as_bytes());
    buf.extend(SPACE);
    buf.extend(target.as_bytes());
    buf.extend(SPACE);
    buf.extend(header::version_str(self.version).as_bytes());
    buf.extend(CR_LF);
    header::write_headers(&mut buf, &self.headers);
    buf.into()
  }

  /// Re-frame a materialized body with an exact `Content-Length`.
  pub(crate) fn reframe_body(&mut self) {
    if let Some(body) = &self.body {
      let len = body.len();
      self.headers.remove(http::header::TRANSFER_ENCODING);
      self
        .headers
        .insert(http::header::CONTENT_LENGTH, http::HeaderValue::from(len));
    }
  }
}

pub(crate) fn split_host_port(authority: &str, default_port: u16) -> Result<(String, u16)> {
  let authority = authority.trim();
  if authority.is_empty() {
    return Err(Error::protocol("empty host"));
  }
  // [::1]:443
  if let Some(rest) = authority.strip_prefix('[') {
    let (host, tail) = rest
      .split_once(']')
      .ok_or_else(|| Error::protocol(format!("invalid host `{}`", authority)))?;
    let port = match tail.strip_prefix(':') {
      Some(p) => p.parse::<u16>().map_err(|_| Error::protocol("invalid port"))?,
      None => default_port,
    };
    return Ok((host.to_string(), port));
  }
  match authority.rsplit_once(':') {
    Some((host, port)) if !host.contains(':') => Ok((
      host.to_string(),
      port.parse::<u16>().map_err(|_| Error::protocol("invalid port"))?,
    )),
    _ => Ok((authority.to_string(), default_port)),
  }
}

/// Request method class, decided from a peek at the first bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownMethod {
  /// Not an HTTP request line.
  Invalid,
  /// A token method this proxy does not special-case.
  Unknown,
  /// `CONNECT`
  Connect,
  /// `PRI`, the HTTP/2 preface.
  Pri,
  /// Any other well formed method.
  Other,
}

/// Peek up to 20 bytes to classify the request method without consuming it.
pub async fn peek_method<S>(stream: &mut HttpStream<S>) -> Result<KnownMethod>
where
  S: AsyncRead + AsyncWrite + Unpin + Send,
{
  const LENGTH_TO_CHECK: usize = 20;
  let mut method = Vec::with_capacity(LENGTH_TO_CHECK);
  for i in 0..LENGTH_TO_CHECK {
    let b = match stream.peek_byte(i).await? {
      Some(b) => b,
      None => return Ok(KnownMethod::Invalid),
    };
    if b == b' ' && i > 2 {
      return Ok(match &method[..] {
        b"CONNECT" => KnownMethod::Connect,
        b"PRI" => KnownMethod::Pri,
        m if Method::from_bytes(m).is_ok() && is_standard(m) => KnownMethod::Other,
        _ => KnownMethod::Unknown,
      });
    }
    if !(b.is_ascii_alphabetic() || b == b'-') {
      return Ok(KnownMethod::Invalid);
    }
    method.push(b);
  }
  Ok(KnownMethod::Invalid)
}

fn is_standard(method: &[u8]) -> bool {
  matches!(
    method,
    b"GET" | b"PUT" | b"HEAD" | b"POST" | b"TRACE" | b"DELETE" | b"OPTIONS" | b"PATCH"
  )
}

/// Read a request line and its headers. `None` means the client closed cleanly.
pub async fn read_request<S>(stream: &mut HttpStream<S>) -> Result<Option<Request>>
where
  S: AsyncRead + AsyncWrite + Unpin + Send,
{
  let line = match stream.read_line().await? {
    Some(line) => line,
    None => return Ok(None),
  };
  let (method, target, version) = parse_request_line(&line)?;
  let mut request = Request::new(method, target, version);
  read_headers(stream, &mut request.headers).await?;
  Ok(Some(request))
}

pub(crate) fn parse_request_line(line: &str) -> Result<(Method, String, Version)> {
  let mut parts = line.splitn(3, ' ');
  let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
    (Some(m), Some(t), Some(v)) if !m.is_empty() && !t.is_empty() => (m, t, v),
    _ => {
      return Err(Error::protocol(format!("invalid request line `{}`", line)));
    }
  };
  let method = Method::from_bytes(method.as_bytes())
    .map_err(|_| Error::protocol(format!("invalid method `{}`", method)))?;
  let version = header::parse_version(version.trim())?;
  Ok((method, target.to_string(), version))
}

pub(crate) async fn read_headers<S>(stream: &mut HttpStream<S>, headers: &mut HeaderMap) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Unpin + Send,
{
  loop {
    let line = stream
      .read_line_bytes()
      .await?
      .ok_or_else(|| Error::protocol("connection closed while reading headers"))?;
    if line.is_empty() {
      return Ok(());
    }
    let (k, v) = header::parser_headers(&line)?;
    headers.append(k, v);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::buffer_pool::BufferPool;
  use std::io::Cursor;

  fn stream(data: &[u8]) -> HttpStream<Cursor<Vec<u8>>> {
    HttpStream::new(Cursor::new(data.to_vec()), &BufferPool::new(128), false)
  }

  #[tokio::test]
  async fn read_absolute_form_request() {
    let mut s = stream(b"GET http://example.com/a?b=1 HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\nAccept: text/html\r\n\r\n");
    let request = read_request(&mut s).await.unwrap().unwrap();
    assert_eq!(request.method(), Method::GET);
    assert_eq!(request.host_port().unwrap(), ("example.com".to_string(), 80));
    assert_eq!(request.origin_form(), "/a?b=1");
    assert_eq!(request.headers().get_all("accept").iter().count(), 2);
    assert_eq!(request.url(), "http://example.com/a?b=1");
  }

  #[tokio::test]
  async fn peek_classifies_methods() {
    let mut s = stream(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n");
    assert_eq!(peek_method(&mut s).await.unwrap(), KnownMethod::Connect);
    // peek left the line in place
    assert!(read_request(&mut s).await.unwrap().is_some());
    let mut tls = stream(&[0x16, 0x03, 0x01, 0x00]);
    assert_eq!(peek_method(&mut tls).await.unwrap(), KnownMethod::Invalid);
    let mut custom = stream(b"PROPFIND / HTTP/1.1\r\n\r\n");
    assert_eq!(peek_method(&mut custom).await.unwrap(), KnownMethod::Unknown);
  }

  #[tokio::test]
  async fn malformed_request_line_is_rejected() {
    let mut s = stream(b"GARBAGE\r\n\r\n");
    assert!(matches!(
      read_request(&mut s).await.unwrap_err(),
      Error::Protocol(_)
    ));
  }

  #[test]
  fn locked_request_refuses_mutation() {
    let mut request = Request::new(Method::GET, "/", Version::HTTP_11);
    request.locked = true;
    assert!(request.headers_mut().is_err());
    assert!(request.set_body("x").is_err());
  }

  #[test]
  fn host_port_splitting() {
    assert_eq!(split_host_port("a.com:8080", 80).unwrap(), ("a.com".to_string(), 8080));
    assert_eq!(split_host_port("[::1]:443", 80).unwrap(), ("::1".to_string(), 443));
    assert_eq!(split_host_port("a.com", 443).unwrap(), ("a.com".to_string(), 443));
  }
}
