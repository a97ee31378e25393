//! proxy error
use std::io::ErrorKind;
use std::num::ParseIntError;
use thiserror::Error as ThisError;
/// A `Result` alias where the `Err` case is `slinger_mitm::Error`.
pub type Result<T> = std::result::Result<T, Error>;
/// The Errors that may occur while proxying a connection.
#[derive(ThisError, Debug)]
pub enum Error {
  /// tls Error
  #[error(transparent)]
  Tls(#[from] tokio_rustls::rustls::Error),
  /// Transport fault, broken pipe, reset and friends
  #[error(transparent)]
  IO(#[from] std::io::Error),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
  /// ParseIntError
  #[error(transparent)]
  IntError(#[from] ParseIntError),
  /// SOCKS ReplyError
  #[error(transparent)]
  ReplyError(#[from] ReplyError),
  /// Malformed start line, invalid chunk size, truncated headers
  #[error("protocol violation: {0}")]
  Protocol(String),
  /// Upstream fault worth another try on a fresh connection
  #[error("retryable server connection error: {0}")]
  Retryable(String),
  /// Certificate could not be minted, loaded or saved
  #[error("certificate error: {0}")]
  Certificate(String),
  /// External proxy refused or failed the tunnel
  #[error("proxy error: {0}")]
  Proxy(String),
  /// An interceptor failed, caught at its invocation boundary
  #[error("hook `{stage}` failed: {message}")]
  Hook {
    /// hook point name
    stage: &'static str,
    /// wrapped failure
    message: String,
  },
  /// Unknown Error
  #[error("{0}")]
  Other(String),
}

/// SOCKS reply codes
#[derive(ThisError, Debug)]
pub enum ReplyError {
  /// reply 0x00
  #[error("Succeeded")]
  Succeeded,
  /// reply 0x01
  #[error("General failure")]
  GeneralFailure,
  /// reply 0x02
  #[error("Connection not allowed by ruleset")]
  ConnectionNotAllowed,
  /// reply 0x03
  #[error("Network unreachable")]
  NetworkUnreachable,
  /// reply 0x04
  #[error("Host unreachable")]
  HostUnreachable,
  /// reply 0x05
  #[error("Connection refused")]
  ConnectionRefused,
  /// reply 0x06
  #[error("TTL expired")]
  TtlExpired,
  /// reply 0x07
  #[error("Command not supported")]
  CommandNotSupported,
  /// reply 0x08
  #[error("Address type not supported")]
  AddressTypeNotSupported,
  /// any other reply code
  #[error("Unknown reply {0:#04x}")]
  Unknown(u8),
}

impl Error {
  /// Create a protocol violation error and log it
  pub fn protocol(msg: impl Into<String>) -> Self {
    let error = Error::Protocol(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create a retryable upstream error and log it
  pub fn retryable(msg: impl Into<String>) -> Self {
    let error = Error::Retryable(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create a certificate error and log it
  pub fn certificate(msg: impl Into<String>) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a proxy error and log it
  pub fn proxy(msg: impl Into<String>) -> Self {
    let error = Error::Proxy(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Whether the failure should trigger the retry policy.
  pub fn is_retryable(&self) -> bool {
    matches!(self, Error::Retryable(_))
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::header::InvalidHeaderName> for Error {
  fn from(value: http::header::InvalidHeaderName) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<rcgen::Error> for Error {
  fn from(value: rcgen::Error) -> Self {
    Error::certificate(value.to_string())
  }
}

/// Sink for errors that end a connection or a background task.
pub type ExceptionHandler = std::sync::Arc<dyn Fn(&Error) + Send + Sync>;

/// The default sink, logging through `tracing`.
pub fn default_exception_handler() -> ExceptionHandler {
  std::sync::Arc::new(|error: &Error| {
    tracing::error!("{}", error);
  })
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::IO(std::io::Error::new(error_kind, msg))
}

pub(crate) fn builder<E: Into<Box<dyn std::error::Error + Send + Sync>>>(e: E) -> Error {
  Error::Other(e.into().to_string())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn only_retryable_kind_is_retryable() {
    assert!(Error::Retryable("closed".to_string()).is_retryable());
    assert!(!Error::Protocol("bad".to_string()).is_retryable());
    assert!(!new_io_error(ErrorKind::BrokenPipe, "pipe").is_retryable());
  }
}
