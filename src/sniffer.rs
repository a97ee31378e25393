//! Passive inspection of TLS handshakes
//!
//! The sniffer only peeks: nothing is consumed from the stream, so the same
//! bytes are later handed intact to a TLS acceptor or to a raw relay.
//!
use crate::errors::Result;
use crate::stream::HttpStream;
use bytes::Bytes;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncWrite};

const SERVER_NAME: u16 = 0;
const ALPN: u16 = 16;

/// A cursor over the unconsumed bytes of an [`HttpStream`].
pub struct PeekReader<'a, S> {
  stream: &'a mut HttpStream<S>,
  position: usize,
}

impl<'a, S> PeekReader<'a, S>
where
  S: AsyncRead + AsyncWrite + Unpin + Send,
{
  /// Start peeking at `position`.
  pub fn new(stream: &'a mut HttpStream<S>, position: usize) -> Self {
    PeekReader { stream, position }
  }
  /// Bytes skipped so far, relative to the start of the stream buffer.
  pub fn position(&self) -> usize {
    self.position
  }
  /// Wait until `len` more bytes past the cursor are buffered.
  ///
  /// Returns `false` on EOF or when the lookahead would not fit the buffer.
  pub async fn ensure(&mut self, len: usize) -> Result<bool> {
    if len == 0 {
      return Ok(true);
    }
    let end = self.position + len;
    if end > self.stream.capacity() {
      return Ok(false);
    }
    Ok(self.stream.peek_byte(end - 1).await?.is_some())
  }
  /// Next byte.
  pub fn u8(&mut self) -> Option<u8> {
    let b = *self.stream.buffered().get(self.position)?;
    self.position += 1;
    Some(b)
  }
  /// Next big endian u16.
  pub fn u16(&mut self) -> Option<u16> {
    let b = self.bytes(2)?;
    Some(u16::from_be_bytes([b[0], b[1]]))
  }
  /// Next big endian u24.
  pub fn u24(&mut self) -> Option<u32> {
    let b = self.bytes(3)?;
    Some(u32::from_be_bytes([0, b[0], b[1], b[2]]))
  }
  /// Next `len` bytes.
  pub fn bytes(&mut self, len: usize) -> Option<Bytes> {
    let end = self.position + len;
    let b = self.stream.buffered().get(self.position..end)?;
    self.position = end;
    Some(Bytes::copy_from_slice(b))
  }
}

/// One entry of the hello extension list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SslExtension {
  /// Extension type.
  pub value: u16,
  /// Registry name of the type.
  pub name: &'static str,
  /// Raw payload.
  pub data: Bytes,
  /// Index in the list.
  pub position: usize,
}

impl SslExtension {
  fn new(value: u16, data: Bytes, position: usize) -> Self {
    SslExtension {
      value,
      name: extension_name(value),
      data,
      position,
    }
  }

  /// Host names carried by a `server_name` extension.
  pub fn server_names(&self) -> Vec<String> {
    let mut names = Vec::new();
    if self.value != SERVER_NAME || self.data.len() < 2 {
      return names;
    }
    let mut rest = &self.data[2..];
    while rest.len() >= 3 {
      let kind = rest[0];
      let len = u16::from_be_bytes([rest[1], rest[2]]) as usize;
      let Some(name) = rest.get(3..3 + len) else {
        break;
      };
      // host_name
      if kind == 0 {
        names.push(String::from_utf8_lossy(name).to_string());
      }
      rest = &rest[3 + len..];
    }
    names
  }

  /// Protocol names carried by an ALPN extension.
  pub fn protocols(&self) -> Vec<String> {
    let mut protocols = Vec::new();
    if self.value != ALPN || self.data.len() < 2 {
      return protocols;
    }
    let mut rest = &self.data[2..];
    while let Some((&len, tail)) = rest.split_first() {
      let Some(name) = tail.get(..len as usize) else {
        break;
      };
      protocols.push(String::from_utf8_lossy(name).to_string());
      rest = &tail[len as usize..];
    }
    protocols
  }
}

fn extension_name(value: u16) -> &'static str {
  match value {
    0 => "server_name",
    1 => "max_fragment_length",
    5 => "status_request",
    10 => "supported_groups",
    11 => "ec_point_formats",
    13 => "signature_algorithms",
    16 => "application_layer_protocol_negotiation",
    18 => "signed_certificate_timestamp",
    21 => "padding",
    23 => "extended_master_secret",
    27 => "compress_certificate",
    35 => "session_ticket",
    41 => "pre_shared_key",
    42 => "early_data",
    43 => "supported_versions",
    45 => "psk_key_exchange_modes",
    51 => "key_share",
    65281 => "renegotiation_info",
    _ => "unknown",
  }
}

/// Parameters of a ClientHello seen on the wire.
#[derive(Debug, Clone)]
pub struct ClientHello {
  /// 2 for an SSLv2-style hello, 3 for a TLS record.
  pub handshake_version: u8,
  /// Protocol major version offered.
  pub major_version: u8,
  /// Protocol minor version offered.
  pub minor_version: u8,
  /// Client random (SSLv2 challenge).
  pub random: Bytes,
  /// Session id.
  pub session_id: Bytes,
  /// Offered cipher suites.
  pub cipher_suites: Vec<u32>,
  /// Compression methods.
  pub compression_data: Bytes,
  /// Offset where the extension block starts.
  pub extensions_start: usize,
  /// Extensions in wire order, `None` when the hello carries none.
  pub extensions: Option<Vec<SslExtension>>,
  /// Bytes covered by the hello.
  pub hello_length: usize,
}

impl ClientHello {
  /// Extension by type.
  pub fn extension(&self, value: u16) -> Option<&SslExtension> {
    self.extensions.as_ref()?.iter().find(|e| e.value == value)
  }
  /// First SNI host name.
  pub fn sni_host(&self) -> Option<String> {
    self.extension(SERVER_NAME)?.server_names().into_iter().next()
  }
  /// Offered ALPN protocols.
  pub fn alpn(&self) -> Vec<String> {
    self
      .extension(ALPN)
      .map(|e| e.protocols())
      .unwrap_or_default()
  }
  /// gmt_unix_time from the first 4 bytes of random, for SSLv3 and later.
  pub fn timestamp(&self) -> Option<SystemTime> {
    if self.major_version < 3 || self.random.len() < 4 {
      return None;
    }
    let secs = u32::from_be_bytes([self.random[0], self.random[1], self.random[2], self.random[3]]);
    Some(UNIX_EPOCH + Duration::from_secs(secs as u64))
  }
}

/// Parameters of a ServerHello seen on the wire.
#[derive(Debug, Clone)]
pub struct ServerHello {
  /// 2 for an SSLv2-style hello, 3 for a TLS record.
  pub handshake_version: u8,
  /// Negotiated major version.
  pub major_version: u8,
  /// Negotiated minor version.
  pub minor_version: u8,
  /// Server random.
  pub random: Bytes,
  /// Session id.
  pub session_id: Bytes,
  /// The cipher suite picked by the server.
  pub cipher_suite: u16,
  /// Compression method.
  pub compression_method: u8,
  /// Offset where the extension block starts.
  pub extensions_start: usize,
  /// Extensions in wire order.
  pub extensions: Option<Vec<SslExtension>>,
  /// Bytes covered by the hello.
  pub hello_length: usize,
}

macro_rules! need {
  ($reader:expr, $len:expr) => {
    if !$reader.ensure($len).await? {
      return Ok(None);
    }
  };
}

macro_rules! take {
  ($e:expr) => {
    match $e {
      Some(v) => v,
      None => return Ok(None),
    }
  };
}

/// Peek a ClientHello. `Ok(None)` when the stream does not start with one.
pub async fn peek_client_hello<S>(stream: &mut HttpStream<S>) -> Result<Option<ClientHello>>
where
  S: AsyncRead + AsyncWrite + Unpin + Send,
{
  let record_type = match stream.peek_byte(0).await? {
    Some(b) => b,
    None => return Ok(None),
  };
  let mut reader = PeekReader::new(stream, 1);
  if record_type & 0x80 == 0x80 {
    need!(reader, 10);
    let record_length = ((record_type as usize & 0x7f) << 8) + take!(reader.u8()) as usize;
    if record_length < 9 {
      return Ok(None);
    }
    if take!(reader.u8()) != 0x01 {
      return Ok(None);
    }
    let major_version = take!(reader.u8());
    let minor_version = take!(reader.u8());
    let ciphers_count = take!(reader.u16()) as usize / 3;
    let session_id_length = take!(reader.u16()) as usize;
    let random_length = take!(reader.u16()) as usize;
    need!(reader, ciphers_count * 3 + session_id_length + random_length);
    let mut cipher_suites = Vec::with_capacity(ciphers_count);
    for _ in 0..ciphers_count {
      cipher_suites.push(take!(reader.u24()));
    }
    let session_id = take!(reader.bytes(session_id_length));
    let random = take!(reader.bytes(random_length));
    let hello_length = reader.position();
    return Ok(Some(ClientHello {
      handshake_version: 2,
      major_version,
      minor_version,
      random,
      session_id,
      cipher_suites,
      compression_data: Bytes::new(),
      extensions_start: hello_length,
      extensions: None,
      hello_length,
    }));
  }
  if record_type != 0x16 {
    return Ok(None);
  }
  need!(reader, 43);
  // record header version, the hello carries its own below
  take!(reader.u16());
  let record_length = take!(reader.u16()) as usize;
  if take!(reader.u8()) != 0x01 {
    return Ok(None);
  }
  take!(reader.u24());
  let major_version = take!(reader.u8());
  let minor_version = take!(reader.u8());
  let random = take!(reader.bytes(32));
  let length = take!(reader.u8()) as usize;
  need!(reader, length + 2);
  let session_id = take!(reader.bytes(length));
  let length = take!(reader.u16()) as usize;
  need!(reader, length + 1);
  let mut cipher_suites = Vec::with_capacity(length / 2);
  for _ in 0..length / 2 {
    cipher_suites.push(take!(reader.u16()) as u32);
  }
  let length = take!(reader.u8()) as usize;
  if length < 1 {
    return Ok(None);
  }
  need!(reader, length);
  let compression_data = take!(reader.bytes(length));
  let extensions_start = reader.position();
  let extensions = if extensions_start < record_length + 5 {
    read_extensions(major_version, minor_version, &mut reader).await?
  } else {
    None
  };
  Ok(Some(ClientHello {
    handshake_version: 3,
    major_version,
    minor_version,
    random,
    session_id,
    cipher_suites,
    compression_data,
    extensions_start,
    extensions,
    hello_length: reader.position(),
  }))
}

/// Peek a ServerHello. `Ok(None)` when the stream does not start with one.
pub async fn peek_server_hello<S>(stream: &mut HttpStream<S>) -> Result<Option<ServerHello>>
where
  S: AsyncRead + AsyncWrite + Unpin + Send,
{
  let record_type = match stream.peek_byte(0).await? {
    Some(b) => b,
    None => return Ok(None),
  };
  let mut reader = PeekReader::new(stream, 1);
  if record_type & 0x80 == 0x80 {
    need!(reader, 39);
    let record_length = ((record_type as usize & 0x7f) << 8) + take!(reader.u8()) as usize;
    if record_length < 38 {
      return Ok(None);
    }
    if take!(reader.u8()) != 0x04 {
      return Ok(None);
    }
    let major_version = take!(reader.u8());
    let minor_version = take!(reader.u8());
    need!(reader, 35);
    let random = take!(reader.bytes(32));
    let session_id = take!(reader.bytes(1));
    let cipher_suite = take!(reader.u16());
    let hello_length = reader.position();
    return Ok(Some(ServerHello {
      handshake_version: 2,
      major_version,
      minor_version,
      random,
      session_id,
      cipher_suite,
      compression_method: 0,
      extensions_start: hello_length,
      extensions: None,
      hello_length,
    }));
  }
  if record_type != 0x16 {
    return Ok(None);
  }
  need!(reader, 43);
  take!(reader.u16());
  let record_length = take!(reader.u16()) as usize;
  if take!(reader.u8()) != 0x02 {
    return Ok(None);
  }
  take!(reader.u24());
  let major_version = take!(reader.u8());
  let minor_version = take!(reader.u8());
  let random = take!(reader.bytes(32));
  let length = take!(reader.u8()) as usize;
  need!(reader, length + 3);
  let session_id = take!(reader.bytes(length));
  let cipher_suite = take!(reader.u16());
  let compression_method = take!(reader.u8());
  let extensions_start = reader.position();
  let extensions = if extensions_start < record_length + 5 {
    read_extensions(major_version, minor_version, &mut reader).await?
  } else {
    None
  };
  Ok(Some(ServerHello {
    handshake_version: 3,
    major_version,
    minor_version,
    random,
    session_id,
    cipher_suite,
    compression_method,
    extensions_start,
    extensions,
    hello_length: reader.position(),
  }))
}

async fn read_extensions<S>(
  major_version: u8,
  minor_version: u8,
  reader: &mut PeekReader<'_, S>,
) -> Result<Option<Vec<SslExtension>>>
where
  S: AsyncRead + AsyncWrite + Unpin + Send,
{
  if !(major_version > 3 || major_version == 3 && minor_version >= 1) {
    return Ok(None);
  }
  need!(reader, 2);
  let length = take!(reader.u16()) as usize;
  need!(reader, length);
  let data = take!(reader.bytes(length));
  let mut extensions = Vec::new();
  let mut rest = &data[..];
  while rest.len() > 3 {
    let value = u16::from_be_bytes([rest[0], rest[1]]);
    let len = u16::from_be_bytes([rest[2], rest[3]]) as usize;
    let Some(payload) = rest.get(4..4 + len) else {
      break;
    };
    extensions.push(SslExtension::new(
      value,
      data.slice_ref(payload),
      extensions.len(),
    ));
    rest = &rest[4 + len..];
  }
  Ok(Some(extensions))
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::buffer_pool::BufferPool;
  use std::io::Cursor;

  /// A TLS 1.2 record carrying a ClientHello with SNI and ALPN.
  pub(crate) fn client_hello_bytes(host: &str, alpn: &[&str]) -> Vec<u8> {
    let mut extensions = Vec::new();
    let mut sni = Vec::new();
    sni.push(0u8);
    sni.extend((host.len() as u16).to_be_bytes());
    sni.extend(host.as_bytes());
    let mut sni_list = (sni.len() as u16).to_be_bytes().to_vec();
    sni_list.extend(sni);
    extensions.extend(0u16.to_be_bytes());
    extensions.extend((sni_list.len() as u16).to_be_bytes());
    extensions.extend(sni_list);
    let mut protocols = Vec::new();
    for p in alpn {
      protocols.push(p.len() as u8);
      protocols.extend(p.as_bytes());
    }
    let mut alpn_list = (protocols.len() as u16).to_be_bytes().to_vec();
    alpn_list.extend(protocols);
    extensions.extend(16u16.to_be_bytes());
    extensions.extend((alpn_list.len() as u16).to_be_bytes());
    extensions.extend(alpn_list);

    let mut hello = vec![0x03, 0x03];
    hello.extend([0x5f, 0x00, 0x00, 0x01]);
    hello.extend([7u8; 28]);
    hello.push(0);
    hello.extend(4u16.to_be_bytes());
    hello.extend([0x13, 0x01, 0xc0, 0x2f]);
    hello.extend([1, 0]);
    hello.extend((extensions.len() as u16).to_be_bytes());
    hello.extend(extensions);

    let mut handshake = vec![0x01];
    handshake.extend(&(hello.len() as u32).to_be_bytes()[1..]);
    handshake.extend(hello);
    let mut record = vec![0x16, 0x03, 0x01];
    record.extend((handshake.len() as u16).to_be_bytes());
    record.extend(handshake);
    record
  }

  fn stream(data: Vec<u8>) -> HttpStream<Cursor<Vec<u8>>> {
    HttpStream::new(Cursor::new(data), &BufferPool::new(4096), false)
  }

  #[tokio::test]
  async fn client_hello_sni_and_alpn() {
    let wire = client_hello_bytes("example.com", &["h2", "http/1.1"]);
    let mut s = stream(wire.clone());
    let hello = peek_client_hello(&mut s).await.unwrap().unwrap();
    assert_eq!(hello.handshake_version, 3);
    assert_eq!(hello.sni_host().as_deref(), Some("example.com"));
    assert_eq!(hello.alpn(), vec!["h2".to_string(), "http/1.1".to_string()]);
    assert_eq!(hello.cipher_suites, vec![0x1301, 0xc02f]);
    assert_eq!(hello.hello_length, wire.len());
    assert_eq!(
      hello.timestamp(),
      Some(UNIX_EPOCH + Duration::from_secs(0x5f00_0001))
    );
    // nothing consumed
    assert_eq!(s.available(), wire.len());
    assert_eq!(s.read_byte().await.unwrap(), Some(0x16));
  }

  #[tokio::test]
  async fn plain_http_is_not_a_hello() {
    let mut s = stream(b"GET / HTTP/1.1\r\n\r\n".to_vec());
    assert!(peek_client_hello(&mut s).await.unwrap().is_none());
    assert!(peek_server_hello(&mut s).await.unwrap().is_none());
    assert_eq!(s.available(), 18);
  }

  #[tokio::test]
  async fn truncated_hello_is_none() {
    let mut wire = client_hello_bytes("example.com", &[]);
    wire.truncate(30);
    let mut s = stream(wire);
    assert!(peek_client_hello(&mut s).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn sslv2_client_hello() {
    // length 9 + 3 cipher bytes + 16 challenge
    let mut wire = vec![0x80, 0x25, 0x01, 0x03, 0x01];
    wire.extend(3u16.to_be_bytes());
    wire.extend(0u16.to_be_bytes());
    wire.extend(16u16.to_be_bytes());
    wire.extend([0x00, 0x00, 0x04]);
    wire.extend([9u8; 16]);
    let mut s = stream(wire);
    let hello = peek_client_hello(&mut s).await.unwrap().unwrap();
    assert_eq!(hello.handshake_version, 2);
    assert_eq!(hello.cipher_suites, vec![4]);
    assert_eq!(hello.random.len(), 16);
    assert!(hello.sni_host().is_none());
  }

  #[tokio::test]
  async fn server_hello_cipher() {
    let mut hello = vec![0x03, 0x03];
    hello.extend([1u8; 32]);
    hello.push(0);
    hello.extend([0xc0, 0x2f]);
    hello.push(0);
    let mut wire = vec![0x16, 0x03, 0x03];
    wire.extend(((hello.len() + 4) as u16).to_be_bytes());
    wire.push(0x02);
    wire.extend(&(hello.len() as u32).to_be_bytes()[1..]);
    wire.extend(hello);
    // pad so the fixed 43 byte lookahead is satisfied by the next record
    wire.extend([0x14, 0x03, 0x03, 0x00, 0x01, 0x01]);
    let mut s = stream(wire);
    let hello = peek_server_hello(&mut s).await.unwrap().unwrap();
    assert_eq!(hello.cipher_suite, 0xc02f);
    assert!(hello.extensions.is_none());
  }
}
