use crate::proxy::ExternalProxy;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;

/// Key deciding whether a pooled connection may serve a request.
///
/// Two requests share a key only when they go to the same destination, with
/// the same TLS and ALPN offer, from the same local endpoint and through the
/// same proxy identity. ALPN order does not matter. The proxy password only
/// enters the key as a fingerprint, so keys are safe to log.
pub fn cache_key(
  host: &str,
  port: u16,
  is_https: bool,
  alpn: &[Vec<u8>],
  upstream_endpoint: Option<SocketAddr>,
  proxy: Option<&ExternalProxy>,
) -> String {
  let mut parts = vec![
    host.to_ascii_lowercase(),
    port.to_string(),
    if is_https { "https" } else { "http" }.to_string(),
  ];
  let mut protocols: Vec<String> = alpn
    .iter()
    .map(|p| String::from_utf8_lossy(p).to_string())
    .collect();
  protocols.sort();
  parts.extend(protocols);
  if let Some(endpoint) = upstream_endpoint {
    parts.push(endpoint.ip().to_string());
    parts.push(endpoint.port().to_string());
  }
  if let Some(proxy) = proxy {
    parts.push(proxy.host().to_string());
    parts.push(proxy.port().to_string());
    parts.push(proxy.kind().as_str().to_string());
    if let Some(username) = proxy.username() {
      parts.push(username.to_string());
    }
    if let Some(password) = proxy.password() {
      parts.push(secret_fingerprint(password));
    }
  }
  parts.join("-")
}

fn secret_fingerprint(secret: &str) -> String {
  let mut hasher = DefaultHasher::new();
  secret.hash(&mut hasher);
  format!("pw:{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::proxy::ProxyKind;

  #[test]
  fn alpn_order_does_not_matter() {
    let a = cache_key(
      "example.com",
      443,
      true,
      &[b"h2".to_vec(), b"http/1.1".to_vec()],
      None,
      None,
    );
    let b = cache_key(
      "example.com",
      443,
      true,
      &[b"http/1.1".to_vec(), b"h2".to_vec()],
      None,
      None,
    );
    assert_eq!(a, b);
    assert_eq!(a, "example.com-443-https-h2-http/1.1");
  }

  #[test]
  fn distinct_destinations_and_proxies() {
    let plain = cache_key("example.com", 443, true, &[], None, None);
    assert_ne!(plain, cache_key("example.com", 443, false, &[], None, None));
    assert_ne!(plain, cache_key("example.com", 8443, true, &[], None, None));
    assert_ne!(plain, cache_key("example.org", 443, true, &[], None, None));
    let endpoint: SocketAddr = "10.0.0.2:0".parse().unwrap();
    assert_ne!(
      plain,
      cache_key("example.com", 443, true, &[], Some(endpoint), None)
    );
    let alice = ExternalProxy::new("10.0.0.1", 1080, ProxyKind::Socks5).with_credentials("alice", "x");
    let bob = ExternalProxy::new("10.0.0.1", 1080, ProxyKind::Socks5).with_credentials("bob", "x");
    let with_alice = cache_key("example.com", 443, true, &[], None, Some(&alice));
    let with_bob = cache_key("example.com", 443, true, &[], None, Some(&bob));
    assert_ne!(plain, with_alice);
    assert_ne!(with_alice, with_bob);
  }

  #[test]
  fn proxy_password_never_appears_in_key() {
    let proxy = ExternalProxy::new("10.0.0.1", 8080, ProxyKind::Http).with_credentials("alice", "hunter2");
    let rotated = ExternalProxy::new("10.0.0.1", 8080, ProxyKind::Http).with_credentials("alice", "swordfish");
    let key = cache_key("example.com", 443, true, &[], None, Some(&proxy));
    assert!(!key.contains("hunter2"));
    assert!(key.contains("alice"));
    assert!(key.contains("pw:"));
    assert_eq!(key, cache_key("example.com", 443, true, &[], None, Some(&proxy)));
    assert_ne!(key, cache_key("example.com", 443, true, &[], None, Some(&rotated)));
  }
}
