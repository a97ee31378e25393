use std::io::{Error, ErrorKind};
use std::mem::MaybeUninit;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

/// Any byte channel a session can run over: a raw socket, a decrypted tunnel
/// or an in-memory pipe in tests.
pub trait ClientIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ClientIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Boxed client channel, so a decrypted tunnel can re-enter the same loop.
pub type BoxedIo = Box<dyn ClientIo>;

/// An upstream connection, plain or wrapped in client TLS.
#[derive(Debug)]
pub enum MaybeTlsStream {
  /// TCP
  Tcp(TcpStream),
  /// TLS
  Tls(Box<TlsStream<TcpStream>>),
}

impl MaybeTlsStream {
  /// The underlying TCP socket.
  pub fn tcp(&self) -> &TcpStream {
    match self {
      MaybeTlsStream::Tcp(stream) => stream,
      MaybeTlsStream::Tls(stream) => stream.get_ref().0,
    }
  }
  /// Protocol picked by the server during the TLS handshake.
  pub fn negotiated_alpn(&self) -> Option<Vec<u8>> {
    match self {
      MaybeTlsStream::Tcp(_) => None,
      MaybeTlsStream::Tls(stream) => stream.get_ref().1.alpn_protocol().map(|p| p.to_vec()),
    }
  }
  /// DER of the server's end-entity certificate.
  pub fn peer_certificate(&self) -> Option<Vec<u8>> {
    match self {
      MaybeTlsStream::Tcp(_) => None,
      MaybeTlsStream::Tls(stream) => stream
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|x| x.to_vec()),
    }
  }
  /// Whether the socket is provably still usable.
  ///
  /// A non-blocking peek that would block means the peer is quiet and the
  /// connection open. EOF, unsolicited bytes or an error mean it is not.
  pub fn is_alive(&self) -> bool {
    let socket = socket2::SockRef::from(self.tcp());
    let mut buf = [MaybeUninit::<u8>::uninit(); 1];
    match socket.peek(&mut buf) {
      Ok(_) => false,
      Err(e) if e.kind() == ErrorKind::WouldBlock => true,
      Err(_) => false,
    }
  }
}

// 实现socket的读写
impl AsyncRead for MaybeTlsStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for MaybeTlsStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::AsyncWriteExt;
  use tokio::net::TcpListener;

  #[tokio::test]
  async fn liveness_reflects_socket_state() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (mut server, _) = listener.accept().await.unwrap();
    let stream = MaybeTlsStream::Tcp(client);
    assert!(stream.is_alive());
    // unsolicited bytes
    server.write_all(b"x").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(!stream.is_alive());
    drop(server);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(!stream.is_alive());
  }
}
