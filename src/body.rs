use bytes::Bytes;
use std::fmt;
use std::ops::Deref;

// Debug 输出的最大字节数
const DEBUG_PREVIEW: usize = 256;

/// A materialized message body.
///
/// Bodies are read lazily by the session; once read they live here and are
/// re-framed with a fresh `Content-Length` when written back out.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Body(Bytes);

impl Body {
  /// An empty body.
  pub fn empty() -> Self {
    Body(Bytes::new())
  }
  /// The underlying bytes.
  pub fn bytes(&self) -> &Bytes {
    &self.0
  }
  /// Consume the body returning its bytes.
  pub fn into_bytes(self) -> Bytes {
    self.0
  }
  /// Lossy UTF-8 view of the body.
  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.0).into_owned()
  }
}

impl Deref for Body {
  type Target = Bytes;

  fn deref(&self) -> &Bytes {
    &self.0
  }
}

impl From<Body> for Bytes {
  fn from(body: Body) -> Bytes {
    body.0
  }
}

impl From<Bytes> for Body {
  fn from(bytes: Bytes) -> Body {
    Body(bytes)
  }
}

impl From<Vec<u8>> for Body {
  fn from(v: Vec<u8>) -> Body {
    Body(Bytes::from(v))
  }
}

impl From<String> for Body {
  fn from(s: String) -> Body {
    Body(Bytes::from(s))
  }
}

impl From<&'static str> for Body {
  fn from(s: &'static str) -> Body {
    Body(Bytes::from_static(s.as_bytes()))
  }
}

impl From<&'static [u8]> for Body {
  fn from(s: &'static [u8]) -> Body {
    Body(Bytes::from_static(s))
  }
}

impl fmt::Debug for Body {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let preview = &self.0[..self.0.len().min(DEBUG_PREVIEW)];
    match std::str::from_utf8(preview) {
      Ok(s) if preview.len() == self.0.len() => fmt::Debug::fmt(s, f),
      Ok(s) => write!(f, "{:?}... ({} bytes)", s, self.0.len()),
      Err(_) => write!(f, "<{} bytes>", self.0.len()),
    }
  }
}

impl fmt::Display for Body {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.write_str(&String::from_utf8_lossy(&self.0))
  }
}
