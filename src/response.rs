use crate::body::Body;
use crate::errors::{Error, Result};
use crate::header::{self, BodyFraming, PROXY_CONNECTION};
use crate::request::{read_headers, Request};
use crate::stream::HttpStream;
use crate::{CR_LF, SPACE};
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION, PROXY_AUTHENTICATE, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue, Method, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncWrite};

/// A response received from upstream or produced by the proxy itself.
#[derive(Clone, Debug)]
pub struct Response {
  version: Version,
  status: StatusCode,
  reason: String,
  headers: HeaderMap,
  body: Option<Body>,
  pub(crate) body_read: bool,
  pub(crate) locked: bool,
}

impl Default for Response {
  fn default() -> Self {
    Response::new(StatusCode::OK)
  }
}

impl Response {
  /// A bodiless HTTP/1.1 response with the canonical reason phrase.
  pub fn new(status: StatusCode) -> Self {
    Response {
      version: Version::HTTP_11,
      status,
      reason: status.canonical_reason().unwrap_or_default().to_string(),
      headers: HeaderMap::new(),
      body: None,
      body_read: false,
      locked: false,
    }
  }
  /// `200 OK` with `body`.
  pub fn ok(body: impl Into<Body>) -> Self {
    Self::generic(StatusCode::OK, body)
  }
  /// A response with the given status and body, framed by `Content-Length`.
  pub fn generic(status: StatusCode, body: impl Into<Body>) -> Self {
    let mut response = Response::new(status);
    let body = body.into();
    response.headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    response.body = Some(body);
    response.body_read = true;
    response
  }
  /// `302 Found` pointing at `url`.
  pub fn redirect(url: &str) -> Result<Self> {
    let mut response = Response::generic(StatusCode::FOUND, Body::empty());
    response.headers.insert(LOCATION, HeaderValue::from_str(url)?);
    Ok(response)
  }
  /// The reply to an accepted CONNECT.
  pub fn connection_established(version: Version) -> Self {
    let mut response = Response::new(StatusCode::OK);
    response.version = version;
    response.reason = "Connection Established".to_string();
    response.body_read = true;
    response
  }
  /// `407` carrying the given challenges.
  pub fn proxy_authentication_required(reason: &str, challenges: &[String], keep_alive: bool) -> Self {
    let mut response = Response::generic(StatusCode::PROXY_AUTHENTICATION_REQUIRED, Body::empty());
    response.reason = reason.to_string();
    for challenge in challenges {
      if let Ok(v) = HeaderValue::from_str(challenge) {
        response.headers.append(PROXY_AUTHENTICATE, v);
      }
    }
    response.headers.insert(
      PROXY_CONNECTION,
      HeaderValue::from_static(if keep_alive { "keep-alive" } else { "close" }),
    );
    response
  }
  /// `403 Forbidden` used when a tunnel is denied.
  pub fn forbidden() -> Self {
    let mut response = Response::generic(StatusCode::FORBIDDEN, Body::empty());
    response
      .headers
      .insert(http::header::CONNECTION, HeaderValue::from_static("close"));
    response
  }

  /// Get the status code.
  pub fn status_code(&self) -> StatusCode {
    self.status
  }
  /// Set the status code, refused once the response is locked.
  pub fn set_status_code(&mut self, status: StatusCode) -> Result<()> {
    self.ensure_unlocked()?;
    self.status = status;
    self.reason = status.canonical_reason().unwrap_or_default().to_string();
    Ok(())
  }
  /// Reason phrase from the status line.
  pub fn reason(&self) -> &str {
    &self.reason
  }
  /// Get the http version.
  pub fn version(&self) -> Version {
    self.version
  }
  /// Set the http version.
  pub fn set_version(&mut self, version: Version) {
    self.version = version;
  }
  /// Get the headers.
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }
  /// Get a mutable reference to the headers, refused once the response is locked.
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
  /// Replace the body, refused once the response is locked.
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
  /// Whether the response can no longer be changed.
  pub fn is_locked(&self) -> bool {
    self.locked
  }
  /// Set a `Content-Type`, refused once the response is locked.
  pub fn set_content_type(&mut self, content_type: &str) -> Result<()> {
    let value = HeaderValue::from_str(content_type)?;
    self.headers_mut()?.insert(CONTENT_TYPE, value);
    Ok(())
  }
  fn ensure_unlocked(&self) -> Result<()> {
    if self.locked {
      return Err(Error::Other("response is locked".to_string()));
    }
    Ok(())
  }

  /// Whether the server keeps the connection open.
  pub fn keep_alive(&self) -> bool {
    header::keep_alive(&self.headers, self.version)
  }
  /// Whether the body uses chunked transfer coding.
  pub fn is_chunked(&self) -> bool {
    header::is_chunked(&self.headers)
  }
  /// Declared `Content-Length`.
  pub fn content_length(&self) -> Option<u64> {
    header::content_length(&self.headers)
  }
  /// How the body is delimited, given the method of the request it answers.
  pub fn framing(&self, method: &Method) -> BodyFraming {
    if method == Method::HEAD
      || self.status.is_informational()
      || self.status == StatusCode::NO_CONTENT
      || self.status == StatusCode::NOT_MODIFIED
    {
      return BodyFraming::None;
    }
    if self.is_chunked() {
      return BodyFraming::Chunked;
    }
    match self.content_length() {
      Some(0) => BodyFraming::None,
      Some(n) => BodyFraming::Length(n),
      None => BodyFraming::UntilClose,
    }
  }
  /// Whether body bytes follow the head for a request made with `method`.
  pub fn has_body(&self, method: &Method) -> bool {
    self.framing(method).has_body()
  }

  pub(crate) fn head_bytes(&self) -> Bytes {
    let mut buf = Vec::with_capacity(256);
    buf.extend(header::version_str(self.version).as_bytes());
    buf.extend(SPACE);
    buf.extend(self.status.as_str().as_bytes());
    buf.extend(SPACE);
    buf.extend(self.reason.as_bytes());
    buf.extend(CR_LF);
    header::write_headers(&mut buf, &self.headers);
    buf.into()
  }

  pub(crate) fn reframe_body(&mut self) {
    if let Some(body) = &self.body {
      let len = body.len();
      self.headers.remove(TRANSFER_ENCODING);
      self.headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
    }
  }
}

/// Read a status line and headers. EOF before the status line is retryable,
/// a stale pooled connection looks exactly like that.
pub async fn read_response<S>(stream: &mut HttpStream<S>) -> Result<Response>
where
  S: AsyncRead + AsyncWrite + Unpin + Send,
{
  let line = match stream.read_line().await {
    Ok(Some(line)) if !line.is_empty() => line,
    Ok(_) => return Err(Error::retryable("server closed before sending a status line")),
    Err(Error::IO(e)) => return Err(Error::retryable(e.to_string())),
    Err(e) => return Err(e),
  };
  let (version, status, reason) = parse_status_line(&line)?;
  let mut response = Response::new(status);
  response.version = version;
  response.reason = reason;
  read_headers(stream, &mut response.headers).await?;
  Ok(response)
}

pub(crate) fn parse_status_line(line: &str) -> Result<(Version, StatusCode, String)> {
  let mut parts = line.splitn(3, ' ');
  let version = parts
    .next()
    .ok_or_else(|| Error::protocol("empty status line"))?;
  let version = header::parse_version(version)?;
  let status = parts
    .next()
    .and_then(|s| s.parse::<u16>().ok())
    .and_then(|s| StatusCode::from_u16(s).ok())
    .ok_or_else(|| Error::protocol(format!("invalid status line `{}`", line)))?;
  let reason = parts.next().unwrap_or_default().trim().to_string();
  Ok((version, status, reason))
}

/// Decode a materialized body according to its `Content-Encoding`.
pub fn decode_body(body: Bytes, content_encoding: Option<&str>) -> Result<Bytes> {
  crate::compression::decompress(content_encoding, body)
}

/// Re-encode a body with `Content-Encoding`, the inverse of [`decode_body`].
pub fn encode_body(body: Bytes, content_encoding: Option<&str>) -> Result<Bytes> {
  crate::compression::compress(content_encoding, body)
}

// 请求和响应的写出
impl<S> HttpStream<S>
where
  S: AsyncRead + AsyncWrite + Unpin + Send,
{
  /// Write a request with the given target form, and its materialized body when present.
  pub async fn write_request(&mut self, request: &Request, target: &str) -> Result<()> {
    let head = request.head_bytes(target);
    self.write_headers(&head).await?;
    if let Some(body) = request.body() {
      if !body.is_empty() {
        self.write_body(body, false).await?;
      }
    }
    self.flush().await
  }

  /// Write a response head and its materialized body when present.
  pub async fn write_response(&mut self, response: &Response) -> Result<()> {
    let head = response.head_bytes();
    self.write_headers(&head).await?;
    if let Some(body) = response.body() {
      if !body.is_empty() {
        self.write_body(body, response.is_chunked()).await?;
      }
    }
    self.flush().await
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
  async fn parse_response_and_framing() {
    let mut s = stream(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n");
    let response = read_response(&mut s).await.unwrap();
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.reason(), "OK");
    assert_eq!(response.framing(&Method::GET), BodyFraming::Chunked);
    assert_eq!(response.framing(&Method::HEAD), BodyFraming::None);
    let body = s.read_body(response.framing(&Method::GET)).await.unwrap();
    assert_eq!(&body[..], b"abc");
  }

  #[tokio::test]
  async fn eof_before_status_line_is_retryable() {
    let mut s = stream(b"");
    assert!(read_response(&mut s).await.unwrap_err().is_retryable());
  }

  #[test]
  fn no_length_means_until_close() {
    let response = Response::new(StatusCode::OK);
    assert_eq!(response.framing(&Method::GET), BodyFraming::UntilClose);
    let response = Response::new(StatusCode::NOT_MODIFIED);
    assert!(!response.has_body(&Method::GET));
  }

  #[test]
  fn locked_response_refuses_mutation() {
    let mut response = Response::ok("hello");
    response.locked = true;
    assert!(matches!(response.set_body("x"), Err(Error::Other(m)) if m == "response is locked"));
    assert!(response.headers_mut().is_err());
    assert_eq!(response.body().unwrap().text(), "hello");
  }

  #[test]
  fn canned_responses() {
    let response = Response::proxy_authentication_required(
      "Proxy Authentication Required",
      &["Basic realm=\"T2Proxy\"".to_string()],
      false,
    );
    assert_eq!(response.status_code(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);
    assert_eq!(response.headers().get(PROXY_CONNECTION).unwrap(), "close");
    let head = Response::connection_established(Version::HTTP_11).head_bytes();
    assert_eq!(&head[..], b"HTTP/1.1 200 Connection Established\r\n\r\n");
    let redirect = Response::redirect("http://example.com/").unwrap();
    assert_eq!(redirect.headers().get(LOCATION).unwrap(), "http://example.com/");
  }

  #[tokio::test]
  async fn write_response_emits_head_and_body() {
    let mut s = HttpStream::new(Cursor::new(Vec::new()), &BufferPool::new(64), false);
    s.write_response(&Response::ok("hi")).await.unwrap();
    let written = s.get_ref().get_ref().clone();
    assert_eq!(written, b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nhi".to_vec());
  }
}
