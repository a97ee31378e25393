//! Content-Encoding filters for bodies read out for inspection
use crate::errors::{Error, Result};
use bytes::Bytes;

/// Encodings this build can decode and re-encode.
pub fn supported_encodings() -> Vec<String> {
  if cfg!(feature = "gzip") {
    vec!["gzip".to_string(), "deflate".to_string()]
  } else {
    Vec::new()
  }
}

/// Decode `data` according to a `Content-Encoding` value.
///
/// `identity` and an absent encoding pass through untouched.
pub fn decompress(encoding: Option<&str>, data: Bytes) -> Result<Bytes> {
  let encoding = match encoding.map(|e| e.trim().to_ascii_lowercase()) {
    None => return Ok(data),
    Some(e) if e.is_empty() || e == "identity" => return Ok(data),
    Some(e) => e,
  };
  decode_with(&encoding, data)
}

/// Encode `data` with the given `Content-Encoding`, the inverse of [`decompress`].
pub fn compress(encoding: Option<&str>, data: Bytes) -> Result<Bytes> {
  let encoding = match encoding.map(|e| e.trim().to_ascii_lowercase()) {
    None => return Ok(data),
    Some(e) if e.is_empty() || e == "identity" => return Ok(data),
    Some(e) => e,
  };
  encode_with(&encoding, data)
}

#[cfg(feature = "gzip")]
fn decode_with(encoding: &str, data: Bytes) -> Result<Bytes> {
  use std::io::Read;
  let mut out = Vec::new();
  match encoding {
    "gzip" | "x-gzip" => {
      flate2::read::MultiGzDecoder::new(&data[..]).read_to_end(&mut out)?;
    }
    "deflate" => {
      // 有的服务器发裸deflate，不带zlib头
      if flate2::read::ZlibDecoder::new(&data[..])
        .read_to_end(&mut out)
        .is_err()
      {
        out.clear();
        flate2::read::DeflateDecoder::new(&data[..]).read_to_end(&mut out)?;
      }
    }
    other => return Err(Error::Other(format!("unsupported content encoding `{}`", other))),
  }
  Ok(out.into())
}

#[cfg(feature = "gzip")]
fn encode_with(encoding: &str, data: Bytes) -> Result<Bytes> {
  use std::io::Write;
  let out = match encoding {
    "gzip" | "x-gzip" => {
      let mut e = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
      e.write_all(&data)?;
      e.finish()?
    }
    "deflate" => {
      let mut e = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
      e.write_all(&data)?;
      e.finish()?
    }
    other => return Err(Error::Other(format!("unsupported content encoding `{}`", other))),
  };
  Ok(out.into())
}

#[cfg(not(feature = "gzip"))]
fn decode_with(encoding: &str, _data: Bytes) -> Result<Bytes> {
  Err(Error::Other(format!("unsupported content encoding `{}`", encoding)))
}

#[cfg(not(feature = "gzip"))]
fn encode_with(encoding: &str, _data: Bytes) -> Result<Bytes> {
  Err(Error::Other(format!("unsupported content encoding `{}`", encoding)))
}

#[cfg(all(test, feature = "gzip"))]
mod tests {
  use super::*;

  #[test]
  fn gzip_and_deflate_are_reversible() {
    let body = Bytes::from_static(b"hello hello hello hello");
    for encoding in ["gzip", "deflate"] {
      let packed = compress(Some(encoding), body.clone()).unwrap();
      assert_ne!(packed, body);
      assert_eq!(decompress(Some(encoding), packed).unwrap(), body);
    }
  }

  #[test]
  fn identity_passes_through() {
    let body = Bytes::from_static(b"plain");
    assert_eq!(decompress(None, body.clone()).unwrap(), body);
    assert_eq!(decompress(Some("identity"), body.clone()).unwrap(), body);
    assert!(decompress(Some("br"), body).is_err());
  }
}
