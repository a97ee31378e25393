use crate::socket::MaybeTlsStream;
use crate::stream::HttpStream;
use std::time::{Duration, Instant};

/// An upstream connection owned by exactly one session until released.
#[derive(Debug)]
pub struct PooledConnection {
  pub(crate) stream: HttpStream<MaybeTlsStream>,
  pub(crate) host: String,
  pub(crate) port: u16,
  pub(crate) is_https: bool,
  pub(crate) negotiated_alpn: Option<Vec<u8>>,
  pub(crate) last_access: Instant,
  pub(crate) cache_key: String,
  pub(crate) authenticated: bool,
  pub(crate) id: u64,
}

impl PooledConnection {
  /// Buffered stream to the server.
  pub fn stream(&mut self) -> &mut HttpStream<MaybeTlsStream> {
    &mut self.stream
  }
  /// Destination host.
  pub fn host(&self) -> &str {
    &self.host
  }
  /// Destination port.
  pub fn port(&self) -> u16 {
    self.port
  }
  /// Whether the connection runs over TLS.
  pub fn is_https(&self) -> bool {
    self.is_https
  }
  /// Protocol chosen by the server, if any.
  pub fn negotiated_alpn(&self) -> Option<&[u8]> {
    self.negotiated_alpn.as_deref()
  }
  /// Key under which this connection is pooled.
  pub fn cache_key(&self) -> &str {
    &self.cache_key
  }
  /// Unique id of this connection.
  pub fn id(&self) -> u64 {
    self.id
  }
  /// Whether the server authenticated this connection, which pins it to
  /// the session that did the handshake.
  pub fn is_authenticated(&self) -> bool {
    self.authenticated
  }
  /// Flag the connection as authenticated.
  pub fn set_authenticated(&mut self, value: bool) {
    self.authenticated = value;
  }
  /// When the connection last went back to the pool.
  pub fn last_access(&self) -> Instant {
    self.last_access
  }
  pub(crate) fn is_expired(&self, idle_timeout: Duration) -> bool {
    self.last_access.elapsed() >= idle_timeout
  }
  /// Whether either side of the stream was closed.
  pub fn is_closed(&self) -> bool {
    self.stream.is_read_closed() || self.stream.is_write_closed()
  }
  /// Whether the connection is provably usable: nothing buffered, nothing
  /// closed and a socket peek reports it quiet and open.
  pub fn is_alive(&self) -> bool {
    !self.is_closed() && self.stream.available() == 0 && self.stream.get_ref().is_alive()
  }
  /// Close the connection.
  pub(crate) fn dispose(self) {
    tracing::debug!(
      "disposing upstream connection #{} to {}:{}",
      self.id,
      self.host,
      self.port
    );
    drop(self);
  }
}
