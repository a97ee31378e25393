//! Header helpers shared by requests and responses
use crate::errors::{Error, Result};
use crate::{COLON_SPACE, CR_LF, SPACE};
use http::header::{HeaderName, HeaderValue, ACCEPT_ENCODING, CONNECTION, PROXY_AUTHORIZATION};
use http::{HeaderMap, Version};

/// `Proxy-Connection`, not part of the http crate's well known names.
pub const PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
  /// No body follows the head.
  None,
  /// Exactly this many bytes follow.
  Length(u64),
  /// `Transfer-Encoding: chunked`.
  Chunked,
  /// The body ends when the peer closes.
  UntilClose,
}

impl BodyFraming {
  /// Whether any body bytes are expected.
  pub fn has_body(&self) -> bool {
    !matches!(self, BodyFraming::None | BodyFraming::Length(0))
  }
}

pub(crate) fn parser_headers(buffer: &[u8]) -> Result<(HeaderName, HeaderValue)> {
  let buffer = buffer.strip_suffix(CR_LF).unwrap_or(buffer);
  let mut parts = buffer.splitn(2, |s| s == &b':');
  let name = parts.next().unwrap_or_default();
  let value = parts
    .next()
    .ok_or_else(|| Error::protocol("header line without colon"))?;
  let value = trim_ascii(value);
  let name = HeaderName::from_bytes(name).map_err(|e| Error::protocol(e.to_string()))?;
  let value = HeaderValue::from_bytes(value).map_err(|e| Error::protocol(e.to_string()))?;
  Ok((name, value))
}

fn trim_ascii(mut value: &[u8]) -> &[u8] {
  while let Some(v) = value.strip_prefix(SPACE).or_else(|| value.strip_prefix(b"\t")) {
    value = v;
  }
  while let Some(v) = value.strip_suffix(SPACE).or_else(|| value.strip_suffix(b"\t")) {
    value = v;
  }
  value
}

pub(crate) fn write_headers(buf: &mut Vec<u8>, headers: &HeaderMap) {
  for (k, v) in headers.iter() {
    buf.extend(k.as_str().as_bytes());
    buf.extend(COLON_SPACE);
    buf.extend(v.as_bytes());
    buf.extend(CR_LF);
  }
  buf.extend(CR_LF);
}

pub(crate) fn version_str(version: Version) -> &'static str {
  match version {
    Version::HTTP_09 => "HTTP/0.9",
    Version::HTTP_10 => "HTTP/1.0",
    Version::HTTP_2 => "HTTP/2.0",
    Version::HTTP_3 => "HTTP/3.0",
    _ => "HTTP/1.1",
  }
}

pub(crate) fn parse_version(version: &str) -> Result<Version> {
  match version {
    "HTTP/0.9" => Ok(Version::HTTP_09),
    "HTTP/1.0" => Ok(Version::HTTP_10),
    "HTTP/1.1" => Ok(Version::HTTP_11),
    "HTTP/2.0" | "HTTP/2" => Ok(Version::HTTP_2),
    _ => Err(Error::protocol(format!("invalid http version `{}`", version))),
  }
}

/// Whether a comma separated header carries `token`, case-insensitively.
pub fn contains_token(headers: &HeaderMap, name: impl http::header::AsHeaderName, token: &str) -> bool {
  headers.get_all(name).iter().any(|v| {
    v.to_str()
      .map(|s| s.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
      .unwrap_or_default()
  })
}

pub(crate) fn content_length(headers: &HeaderMap) -> Option<u64> {
  headers
    .get(http::header::CONTENT_LENGTH)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.trim().parse::<u64>().ok())
}

pub(crate) fn is_chunked(headers: &HeaderMap) -> bool {
  contains_token(headers, http::header::TRANSFER_ENCODING, "chunked")
}

pub(crate) fn keep_alive(headers: &HeaderMap, version: Version) -> bool {
  if contains_token(headers, CONNECTION, "close") {
    return false;
  }
  if version == Version::HTTP_10 || version == Version::HTTP_09 {
    return contains_token(headers, CONNECTION, "keep-alive");
  }
  true
}

/// Moves `Proxy-Connection` into `Connection`.
pub fn fix_proxy_headers(headers: &mut HeaderMap) {
  if let Some(value) = headers.remove(PROXY_CONNECTION) {
    headers.insert(CONNECTION, value);
  }
}

/// Keeps only the encodings this proxy can decode (plus `identity`) and
/// strips credentials meant for the proxy itself.
pub fn prepare_request_headers(headers: &mut HeaderMap, supported_encodings: &[String]) {
  let accepted: Vec<String> = headers
    .get_all(ACCEPT_ENCODING)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .map(|e| e.trim().to_string())
    .filter(|e| {
      let name = e.split(';').next().unwrap_or_default().trim();
      name.eq_ignore_ascii_case("identity")
        || supported_encodings
          .iter()
          .any(|s| s.eq_ignore_ascii_case(name))
    })
    .collect();
  if headers.contains_key(ACCEPT_ENCODING) {
    headers.remove(ACCEPT_ENCODING);
    let joined = if accepted.is_empty() {
      "identity".to_string()
    } else {
      accepted.join(", ")
    };
    if let Ok(value) = HeaderValue::from_str(&joined) {
      headers.insert(ACCEPT_ENCODING, value);
    }
  }
  headers.remove(PROXY_AUTHORIZATION);
  fix_proxy_headers(headers);
}
