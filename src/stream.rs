//! Buffered duplex HTTP transport
//!
//! [`HttpStream`] wraps a raw byte channel and adds the operations the proxy
//! needs on both legs of a session: non-destructive lookahead for sniffing,
//! line reads for start lines and headers, and body relay for
//! length-delimited, chunked and read-until-close framing.
//!
use crate::buffer_pool::{BufferPool, PooledBuffer};
use crate::errors::{new_io_error, Error, Result};
use crate::header::BodyFraming;
use crate::CR_LF;
use bytes::Bytes;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

// 单行最长长度，超过视为协议错误
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Receives every raw chunk read from or written to a stream.
pub trait StreamObserver: Send + Sync {
  /// Bytes that came in from the underlying channel.
  fn on_read(&self, _data: &[u8]) {}
  /// Bytes that went out to the underlying channel.
  fn on_write(&self, _data: &[u8]) {}
}

/// A buffered stream with lookahead, line reads and body framing.
pub struct HttpStream<S> {
  inner: S,
  buffer: PooledBuffer,
  pool: BufferPool,
  offset: usize,
  available: usize,
  closed_read: bool,
  closed_write: bool,
  is_network: bool,
  observer: Option<Arc<dyn StreamObserver>>,
}

impl<S> std::fmt::Debug for HttpStream<S> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("HttpStream")
      .field("available", &self.available)
      .field("closed_read", &self.closed_read)
      .field("closed_write", &self.closed_write)
      .field("is_network", &self.is_network)
      .finish()
  }
}

enum Sink<'a, T> {
  Stream(&'a mut HttpStream<T>),
  Memory(&'a mut Vec<u8>),
  Discard,
}

impl<T> Sink<'_, T>
where
  T: AsyncRead + AsyncWrite + Unpin + Send,
{
  async fn put(&mut self, data: &[u8]) -> Result<()> {
    match self {
      Sink::Stream(s) => HttpStream::write_all(&mut **s, data).await,
      Sink::Memory(v) => {
        v.extend_from_slice(data);
        Ok(())
      }
      Sink::Discard => Ok(()),
    }
  }
}

impl<S> HttpStream<S>
where
  S: AsyncRead + AsyncWrite + Unpin + Send,
{
  /// Wrap `inner`. `is_network` marks a socket-backed channel whose write
  /// faults close the write side silently instead of failing the caller.
  pub fn new(inner: S, pool: &BufferPool, is_network: bool) -> Self {
    Self {
      inner,
      buffer: pool.lease(),
      pool: pool.clone(),
      offset: 0,
      available: 0,
      closed_read: false,
      closed_write: false,
      is_network,
      observer: None,
    }
  }
  /// Install the observer notified of raw traffic.
  pub fn set_observer(&mut self, observer: Option<Arc<dyn StreamObserver>>) {
    self.observer = observer;
  }
  /// Underlying channel.
  pub fn get_ref(&self) -> &S {
    &self.inner
  }
  /// Underlying channel, mutably. Buffered bytes stay in the stream.
  pub fn get_mut(&mut self) -> &mut S {
    &mut self.inner
  }
  /// Buffer pool this stream leases from.
  pub fn buffer_pool(&self) -> &BufferPool {
    &self.pool
  }
  /// Bytes buffered and not yet consumed.
  pub fn available(&self) -> usize {
    self.available
  }
  /// Maximum lookahead.
  pub fn capacity(&self) -> usize {
    self.buffer.len()
  }
  /// Whether the peer closed its side.
  pub fn is_read_closed(&self) -> bool {
    self.closed_read
  }
  /// Whether a write fault has closed the write side.
  pub fn is_write_closed(&self) -> bool {
    self.closed_write
  }
  /// Whether this stream sits directly on a socket.
  pub fn is_network(&self) -> bool {
    self.is_network
  }
  /// Unconsumed buffered bytes.
  pub fn buffered(&self) -> &[u8] {
    &self.buffer[self.offset..self.offset + self.available]
  }

  /// Read once from the channel into the internal buffer, sliding any unread
  /// remainder to the front first.
  ///
  /// Returns `false` when the buffer is already full or the channel hit EOF.
  pub async fn fill_buffer(&mut self) -> Result<bool> {
    if self.closed_read {
      return Ok(false);
    }
    if self.offset > 0 {
      if self.available > 0 {
        self
          .buffer
          .copy_within(self.offset..self.offset + self.available, 0);
      }
      self.offset = 0;
    }
    if self.available == self.buffer.len() {
      return Ok(false);
    }
    let start = self.available;
    let n = match self.inner.read(&mut self.buffer[start..]).await {
      Ok(n) => n,
      Err(err) => {
        self.closed_read = true;
        return Err(err.into());
      }
    };
    if n == 0 {
      self.closed_read = true;
      return Ok(false);
    }
    if let Some(observer) = &self.observer {
      observer.on_read(&self.buffer[start..start + n]);
    }
    self.available += n;
    Ok(true)
  }

  /// Look at the byte `index` positions ahead without consuming anything.
  ///
  /// Waits for more data when fewer bytes are buffered; `None` means the
  /// channel ended first.
  pub async fn peek_byte(&mut self, index: usize) -> Result<Option<u8>> {
    if index >= self.buffer.len() {
      return Err(Error::protocol(format!(
        "peek index {} exceeds buffer size {}",
        index,
        self.buffer.len()
      )));
    }
    while self.available <= index {
      if !self.fill_buffer().await? {
        return Ok(None);
      }
    }
    Ok(Some(self.buffer[self.offset + index]))
  }

  /// Look at up to `len` bytes starting `index` positions ahead.
  ///
  /// The returned slice is shorter than `len` only when the channel ended.
  pub async fn peek_bytes(&mut self, index: usize, len: usize) -> Result<&[u8]> {
    if index + len > self.buffer.len() {
      return Err(Error::protocol(format!(
        "peek range {}..{} exceeds buffer size {}",
        index,
        index + len,
        self.buffer.len()
      )));
    }
    while self.available < index + len {
      if !self.fill_buffer().await? {
        break;
      }
    }
    let start = self.offset + index.min(self.available);
    let end = self.offset + (index + len).min(self.available);
    Ok(&self.buffer[start..end])
  }

  fn consume(&mut self, n: usize) {
    let n = n.min(self.available);
    self.offset += n;
    self.available -= n;
  }

  /// Consume one byte.
  pub async fn read_byte(&mut self) -> Result<Option<u8>> {
    match self.peek_byte(0).await? {
      Some(b) => {
        self.consume(1);
        Ok(Some(b))
      }
      None => Ok(None),
    }
  }

  /// Consume up to `buf.len()` bytes, returning how many were read.
  pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
    if buf.is_empty() {
      return Ok(0);
    }
    if self.available == 0 {
      if buf.len() >= self.buffer.len() && !self.closed_read {
        let n = self.inner.read(buf).await?;
        if n == 0 {
          self.closed_read = true;
        } else if let Some(observer) = &self.observer {
          observer.on_read(&buf[..n]);
        }
        return Ok(n);
      }
      if !self.fill_buffer().await? {
        return Ok(0);
      }
    }
    let n = buf.len().min(self.available);
    buf[..n].copy_from_slice(&self.buffer[self.offset..self.offset + n]);
    self.consume(n);
    Ok(n)
  }

  /// Consume one line, returning it without its `\r\n` terminator.
  ///
  /// `None` means EOF before any byte of the line.
  pub async fn read_line_bytes(&mut self) -> Result<Option<Vec<u8>>> {
    let mut line = Vec::new();
    loop {
      if self.available == 0 && !self.fill_buffer().await? {
        if line.is_empty() {
          return Ok(None);
        }
        break;
      }
      let window = &self.buffer[self.offset..self.offset + self.available];
      match window.iter().position(|b| *b == b'\n') {
        Some(pos) => {
          line.extend_from_slice(&window[..pos]);
          self.consume(pos + 1);
          break;
        }
        None => {
          line.extend_from_slice(window);
          let n = self.available;
          self.consume(n);
        }
      }
      if line.len() > MAX_LINE_LENGTH {
        return Err(Error::protocol("line exceeds maximum length"));
      }
    }
    if line.last() == Some(&b'\r') {
      line.pop();
    }
    Ok(Some(line))
  }

  /// [`read_line_bytes`](Self::read_line_bytes) decoded as lossy UTF-8.
  pub async fn read_line(&mut self) -> Result<Option<String>> {
    Ok(
      self
        .read_line_bytes()
        .await?
        .map(|l| String::from_utf8_lossy(&l).to_string()),
    )
  }

  /// Relay a body framed as `framing` into `dest`, keeping the framing intact.
  pub async fn copy_body_to<T>(&mut self, dest: &mut HttpStream<T>, framing: BodyFraming) -> Result<()>
  where
    T: AsyncRead + AsyncWrite + Unpin + Send,
  {
    self.copy_body(Sink::Stream(dest), framing).await?;
    dest.flush().await
  }

  /// Read and discard a body.
  pub async fn drain_body(&mut self, framing: BodyFraming) -> Result<()> {
    self.copy_body(Sink::<S>::Discard, framing).await
  }

  /// Read a whole body into memory, removing chunked framing.
  pub async fn read_body(&mut self, framing: BodyFraming) -> Result<Bytes> {
    let mut raw = Vec::new();
    match framing {
      BodyFraming::Chunked => {
        self.read_chunked_into(&mut raw).await?;
      }
      _ => {
        self.copy_body(Sink::<S>::Memory(&mut raw), framing).await?;
      }
    }
    Ok(raw.into())
  }

  async fn copy_body<T>(&mut self, mut sink: Sink<'_, T>, framing: BodyFraming) -> Result<()>
  where
    T: AsyncRead + AsyncWrite + Unpin + Send,
  {
    match framing {
      BodyFraming::None => Ok(()),
      BodyFraming::Length(n) => self.copy_exact(&mut sink, n).await,
      BodyFraming::UntilClose => self.copy_until_close(&mut sink).await,
      BodyFraming::Chunked => self.copy_chunked(&mut sink).await,
    }
  }

  async fn copy_exact<T>(&mut self, sink: &mut Sink<'_, T>, mut remaining: u64) -> Result<()>
  where
    T: AsyncRead + AsyncWrite + Unpin + Send,
  {
    while remaining > 0 {
      if self.available == 0 && !self.fill_buffer().await? {
        return Err(new_io_error(
          std::io::ErrorKind::UnexpectedEof,
          "connection closed in the middle of a body",
        ));
      }
      let n = (self.available as u64).min(remaining) as usize;
      sink
        .put(&self.buffer[self.offset..self.offset + n])
        .await?;
      self.consume(n);
      remaining -= n as u64;
    }
    Ok(())
  }

  async fn copy_until_close<T>(&mut self, sink: &mut Sink<'_, T>) -> Result<()>
  where
    T: AsyncRead + AsyncWrite + Unpin + Send,
  {
    loop {
      if self.available == 0 && !self.fill_buffer().await? {
        return Ok(());
      }
      let n = self.available;
      sink
        .put(&self.buffer[self.offset..self.offset + n])
        .await?;
      self.consume(n);
    }
  }

  // ReadChunkSize -> ReadChunkData -> ReadChunkTrailer
  async fn copy_chunked<T>(&mut self, sink: &mut Sink<'_, T>) -> Result<()>
  where
    T: AsyncRead + AsyncWrite + Unpin + Send,
  {
    loop {
      let head = self
        .read_line_bytes()
        .await?
        .ok_or_else(|| Error::protocol("connection closed while reading chunk size"))?;
      let size = parse_chunk_size(&head)?;
      sink.put(&head).await?;
      sink.put(CR_LF).await?;
      if size > 0 {
        self.copy_exact(sink, size).await?;
      }
      if size == 0 {
        return self.copy_trailer(sink).await;
      }
      self.read_chunk_terminator().await?;
      sink.put(CR_LF).await?;
    }
  }

  // 块数据之后必须紧跟空行
  async fn read_chunk_terminator(&mut self) -> Result<()> {
    let tail = self
      .read_line_bytes()
      .await?
      .ok_or_else(|| Error::protocol("connection closed while reading chunk terminator"))?;
    if !tail.is_empty() {
      return Err(Error::protocol("chunk data not followed by CRLF"));
    }
    Ok(())
  }

  async fn copy_trailer<T>(&mut self, sink: &mut Sink<'_, T>) -> Result<()>
  where
    T: AsyncRead + AsyncWrite + Unpin + Send,
  {
    loop {
      let line = match self.read_line_bytes().await? {
        Some(line) => line,
        None => return Ok(()),
      };
      sink.put(&line).await?;
      sink.put(CR_LF).await?;
      if line.is_empty() {
        return Ok(());
      }
    }
  }

  async fn read_chunked_into(&mut self, out: &mut Vec<u8>) -> Result<()> {
    loop {
      let head = self
        .read_line_bytes()
        .await?
        .ok_or_else(|| Error::protocol("connection closed while reading chunk size"))?;
      let size = parse_chunk_size(&head)?;
      if size == 0 {
        return self.copy_trailer(&mut Sink::<S>::Discard).await;
      }
      self.copy_exact(&mut Sink::<S>::Memory(out), size).await?;
      self.read_chunk_terminator().await?;
    }
  }

  /// Write raw bytes. Faults on a network stream close the write side quietly.
  pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
    if self.closed_write {
      return Ok(());
    }
    match self.inner.write_all(data).await {
      Ok(()) => {
        if let Some(observer) = &self.observer {
          observer.on_write(data);
        }
        Ok(())
      }
      Err(err) => self.write_failed(err),
    }
  }

  /// Flush the underlying channel.
  pub async fn flush(&mut self) -> Result<()> {
    if self.closed_write {
      return Ok(());
    }
    match self.inner.flush().await {
      Ok(()) => Ok(()),
      Err(err) => self.write_failed(err),
    }
  }

  fn write_failed(&mut self, err: std::io::Error) -> Result<()> {
    self.closed_write = true;
    if self.is_network {
      tracing::debug!("write side closed: {}", err);
      Ok(())
    } else {
      Err(err.into())
    }
  }

  /// Write a serialized head and flush it.
  pub async fn write_headers(&mut self, head: &[u8]) -> Result<()> {
    self.write_all(head).await?;
    self.flush().await
  }

  /// Write an in-memory body, framed as chunked when `chunked` is set.
  pub async fn write_body(&mut self, body: &[u8], chunked: bool) -> Result<()> {
    if chunked {
      if !body.is_empty() {
        self
          .write_all(format!("{:x}\r\n", body.len()).as_bytes())
          .await?;
        self.write_all(body).await?;
        self.write_all(CR_LF).await?;
      }
      self.write_all(b"0\r\n\r\n").await?;
    } else {
      self.write_all(body).await?;
    }
    self.flush().await
  }

  /// Shut down the write side of the channel.
  pub async fn shutdown(&mut self) -> Result<()> {
    if self.closed_write {
      return Ok(());
    }
    self.closed_write = true;
    match self.inner.shutdown().await {
      Ok(()) => Ok(()),
      Err(err) if self.is_network => {
        tracing::debug!("shutdown failed: {}", err);
        Ok(())
      }
      Err(err) => Err(err.into()),
    }
  }
}

/// Parse a chunk-size line, ignoring any `;` extension.
pub fn parse_chunk_size(line: &[u8]) -> Result<u64> {
  let size = line.split(|b| *b == b';').next().unwrap_or_default();
  let size = std::str::from_utf8(size)
    .map_err(|_| Error::protocol("Invalid chunk length"))?
    .trim();
  if size.is_empty() {
    return Err(Error::protocol("Invalid chunk length"));
  }
  u64::from_str_radix(size, 16).map_err(|_| Error::protocol(format!("Invalid chunk length `{}`", size)))
}

// 实现stream的读写，先吐出缓冲里的数据
impl<S> AsyncRead for HttpStream<S>
where
  S: AsyncRead + AsyncWrite + Unpin + Send,
{
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    let this = self.get_mut();
    if this.available > 0 {
      let n = this.available.min(buf.remaining());
      buf.put_slice(&this.buffer[this.offset..this.offset + n]);
      this.consume(n);
      return Poll::Ready(Ok(()));
    }
    if this.closed_read {
      return Poll::Ready(Ok(()));
    }
    let before = buf.filled().len();
    ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
    let read = &buf.filled()[before..];
    if read.is_empty() {
      this.closed_read = true;
    } else if let Some(observer) = &this.observer {
      observer.on_read(read);
    }
    Poll::Ready(Ok(()))
  }
}

impl<S> AsyncWrite for HttpStream<S>
where
  S: AsyncRead + AsyncWrite + Unpin + Send,
{
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<std::io::Result<usize>> {
    let this = self.get_mut();
    let n = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
    if let Some(observer) = &this.observer {
      observer.on_write(&buf[..n]);
    }
    Poll::Ready(Ok(n))
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Cursor;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn stream(data: &[u8], size: usize) -> HttpStream<Cursor<Vec<u8>>> {
    HttpStream::new(Cursor::new(data.to_vec()), &BufferPool::new(size), false)
  }

  #[tokio::test]
  async fn peek_does_not_consume() {
    let mut s = stream(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n", 64);
    assert_eq!(s.peek_byte(0).await.unwrap(), Some(b'G'));
    assert_eq!(s.peek_bytes(0, 3).await.unwrap(), b"GET");
    assert_eq!(s.read_line().await.unwrap().unwrap(), "GET / HTTP/1.1");
    assert_eq!(s.read_line().await.unwrap().unwrap(), "Host: a");
    assert_eq!(s.read_line().await.unwrap().unwrap(), "");
    assert_eq!(s.read_line().await.unwrap(), None);
  }

  #[tokio::test]
  async fn peek_beyond_capacity_fails() {
    let mut s = stream(b"abc", 4);
    assert!(s.peek_byte(4).await.is_err());
    assert_eq!(s.peek_byte(3).await.unwrap(), None);
  }

  #[tokio::test]
  async fn read_line_grows_past_buffer() {
    let long = "x".repeat(100);
    let mut s = stream(format!("{}\r\nnext\n", long).as_bytes(), 8);
    assert_eq!(s.read_line().await.unwrap().unwrap(), long);
    assert_eq!(s.read_line().await.unwrap().unwrap(), "next");
  }

  #[tokio::test]
  async fn chunked_body_round_trip() {
    let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    let pool = BufferPool::new(512);
    let mut writer = HttpStream::new(Cursor::new(Vec::new()), &pool, false);
    writer.write_body(&payload, true).await.unwrap();
    let mut wire = writer.get_ref().get_ref().clone();
    wire.extend_from_slice(b"tail");
    let mut reader = HttpStream::new(Cursor::new(wire), &pool, false);
    let body = reader.read_body(BodyFraming::Chunked).await.unwrap();
    assert_eq!(&body[..], &payload[..]);
    // terminal chunk fully consumed
    assert_eq!(reader.peek_bytes(0, 4).await.unwrap(), b"tail");
  }

  #[tokio::test]
  async fn chunk_extension_is_ignored_and_relayed() {
    let wire = b"5;name=value\r\nhello\r\n0\r\n\r\n".to_vec();
    let pool = BufferPool::new(64);
    let mut reader = HttpStream::new(Cursor::new(wire.clone()), &pool, false);
    let mut out = HttpStream::new(Cursor::new(Vec::new()), &pool, false);
    reader
      .copy_body_to(&mut out, BodyFraming::Chunked)
      .await
      .unwrap();
    assert_eq!(out.get_ref().get_ref(), &wire);
  }

  #[tokio::test]
  async fn invalid_chunk_size_is_protocol_error() {
    let mut s = stream(b"zz\r\nhello\r\n0\r\n\r\n", 64);
    let err = s.read_body(BodyFraming::Chunked).await.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
  }

  #[tokio::test]
  async fn length_delimited_copy_reads_exactly() {
    let mut s = stream(b"hello worldGET", 4);
    let body = s.read_body(BodyFraming::Length(11)).await.unwrap();
    assert_eq!(&body[..], b"hello world");
    assert_eq!(s.peek_bytes(0, 3).await.unwrap(), b"GET");
    let mut short = stream(b"abc", 16);
    assert!(short.read_body(BodyFraming::Length(10)).await.is_err());
  }

  struct Counter(AtomicUsize, AtomicUsize);

  impl StreamObserver for Counter {
    fn on_read(&self, data: &[u8]) {
      self.0.fetch_add(data.len(), Ordering::SeqCst);
    }
    fn on_write(&self, data: &[u8]) {
      self.1.fetch_add(data.len(), Ordering::SeqCst);
    }
  }

  #[tokio::test]
  async fn observer_sees_raw_traffic() {
    let counter = Arc::new(Counter(AtomicUsize::new(0), AtomicUsize::new(0)));
    let mut s = stream(b"0123456789", 4);
    s.set_observer(Some(counter.clone()));
    s.read_body(BodyFraming::UntilClose).await.unwrap();
    s.write_all(b"abc").await.unwrap();
    assert_eq!(counter.0.load(Ordering::SeqCst), 10);
    assert_eq!(counter.1.load(Ordering::SeqCst), 3);
  }

  struct Broken;

  impl AsyncRead for Broken {
    fn poll_read(
      self: Pin<&mut Self>,
      _cx: &mut Context<'_>,
      _buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
      Poll::Ready(Ok(()))
    }
  }

  impl AsyncWrite for Broken {
    fn poll_write(
      self: Pin<&mut Self>,
      _cx: &mut Context<'_>,
      _buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
      Poll::Ready(Err(std::io::ErrorKind::ConnectionReset.into()))
    }
    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
      Poll::Ready(Ok(()))
    }
    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
      Poll::Ready(Ok(()))
    }
  }

  #[tokio::test]
  async fn write_faults_depend_on_channel_kind() {
    let pool = BufferPool::new(16);
    let mut network = HttpStream::new(Broken, &pool, true);
    assert!(network.write_all(b"x").await.is_ok());
    assert!(network.is_write_closed());
    assert!(network.write_all(b"y").await.is_ok());

    let mut memory = HttpStream::new(Broken, &pool, false);
    assert!(memory.write_all(b"x").await.is_err());
    assert!(memory.is_write_closed());
  }

  #[tokio::test]
  async fn chunk_without_terminator_is_protocol_error() {
    let mut s = stream(b"5\r\nhelloXX\r\n0\r\n\r\n", 64);
    let err = s.read_body(BodyFraming::Chunked).await.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));

    let pool = BufferPool::new(64);
    let mut reader = HttpStream::new(Cursor::new(b"5\r\nhelloXX\r\n0\r\n\r\n".to_vec()), &pool, false);
    let mut out = HttpStream::new(Cursor::new(Vec::new()), &pool, false);
    let err = reader
      .copy_body_to(&mut out, BodyFraming::Chunked)
      .await
      .unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
  }

  #[tokio::test]
  async fn relay_into_a_broken_destination() {
    let pool = BufferPool::new(64);
    let mut reader = stream(b"hello world", 64);
    let counter = Arc::new(Counter(AtomicUsize::new(0), AtomicUsize::new(0)));
    let mut network = HttpStream::new(Broken, &pool, true);
    network.set_observer(Some(counter.clone()));
    reader
      .copy_body_to(&mut network, BodyFraming::Length(11))
      .await
      .unwrap();
    assert!(network.is_write_closed());
    assert_eq!(counter.1.load(Ordering::SeqCst), 0);
    // 源端的数据仍然被完整读完
    assert_eq!(reader.available(), 0);

    let mut reader = stream(b"hello world", 64);
    let mut memory = HttpStream::new(Broken, &pool, false);
    assert!(reader
      .copy_body_to(&mut memory, BodyFraming::Length(11))
      .await
      .is_err());
  }

  #[tokio::test]
  async fn relay_reports_to_the_destination_observer() {
    let pool = BufferPool::new(8);
    let counter = Arc::new(Counter(AtomicUsize::new(0), AtomicUsize::new(0)));
    let mut reader = stream(b"3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n", 8);
    let mut out = HttpStream::new(Cursor::new(Vec::new()), &pool, false);
    out.set_observer(Some(counter.clone()));
    reader
      .copy_body_to(&mut out, BodyFraming::Chunked)
      .await
      .unwrap();
    assert_eq!(out.get_ref().get_ref().as_slice(), b"3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n");
    assert_eq!(counter.1.load(Ordering::SeqCst), 20);
  }

  #[tokio::test]
  async fn async_read_drains_buffer_first() {
    let mut s = stream(b"\x16\x03\x01rest", 64);
    assert_eq!(s.peek_byte(0).await.unwrap(), Some(0x16));
    let mut all = Vec::new();
    AsyncReadExt::read_to_end(&mut s, &mut all).await.unwrap();
    assert_eq!(all, b"\x16\x03\x01rest");
  }

  #[test]
  fn chunk_size_parsing() {
    assert_eq!(parse_chunk_size(b"1f").unwrap(), 31);
    assert_eq!(parse_chunk_size(b"A;ext=1").unwrap(), 10);
    assert!(parse_chunk_size(b"").is_err());
    assert!(parse_chunk_size(b"-1").is_err());
  }
}
