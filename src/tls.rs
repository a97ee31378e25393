//! TLS settings for the server leg
//!
//! Upstream connections are verified (or not) by a [`HookVerifier`] that lets
//! registered [`ServerCertificateValidator`]s overrule the base verdict, and
//! client certificates can be picked per host by [`ClientCertificateSelector`]s.
//!
use std::fmt::{Debug, Formatter};
use std::io::BufRead;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio_rustls::rustls;
use tokio_rustls::rustls::client::danger::{
  HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::client::{ResolvesClientCert, WebPkiServerVerifier};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::sign::CertifiedKey;
use tokio_rustls::rustls::{
  ClientConfig, DigitallySignedStruct, Error as TLSError, RootCertStore, SignatureScheme,
};

/// Represents a X509 trust anchor for upstream verification.
#[derive(Clone, Debug)]
pub struct Certificate {
  original: Cert,
}
#[derive(Clone, Debug)]
enum Cert {
  Der(Vec<u8>),
  Pem(Vec<u8>),
}
impl Certificate {
  /// Create a `Certificate` from a binary DER encoded certificate
  pub fn from_der(der: &[u8]) -> crate::Result<Certificate> {
    Ok(Certificate {
      original: Cert::Der(der.to_owned()),
    })
  }

  /// Create a `Certificate` from a PEM encoded certificate
  pub fn from_pem(pem: &[u8]) -> crate::Result<Certificate> {
    Ok(Certificate {
      original: Cert::Pem(pem.to_owned()),
    })
  }

  /// Create a collection of `Certificate`s from a PEM encoded certificate bundle.
  /// Example byte sources may be `.crt`, `.cer` or `.pem` files.
  pub fn from_pem_bundle(pem_bundle: &[u8]) -> crate::Result<Vec<Certificate>> {
    let mut reader = pem_bundle;
    Self::read_pem_certs(&mut reader)?
      .iter()
      .map(|cert_vec| Certificate::from_der(cert_vec))
      .collect::<crate::Result<Vec<Certificate>>>()
  }

  pub(crate) fn add_to_tls(&self, root_cert_store: &mut RootCertStore) -> crate::Result<()> {
    match &self.original {
      Cert::Der(buf) => root_cert_store
        .add(buf.clone().into())
        .map_err(crate::errors::builder)?,
      Cert::Pem(buf) => {
        let mut reader = &buf[..];
        for c in Self::read_pem_certs(&mut reader)? {
          root_cert_store
            .add(c.into())
            .map_err(crate::errors::builder)?;
        }
      }
    }
    Ok(())
  }

  fn read_pem_certs(reader: &mut impl BufRead) -> crate::Result<Vec<Vec<u8>>> {
    rustls_pemfile::certs(reader)
      .map(|result| match result {
        Ok(cert) => Ok(cert.as_ref().to_vec()),
        Err(_) => Err(crate::errors::builder("invalid certificate encoding")),
      })
      .collect()
  }
}

/// Represents a private key and X509 cert as a client certificate.
pub struct Identity {
  key: PrivateKeyDer<'static>,
  certs: Vec<CertificateDer<'static>>,
}

impl Clone for Identity {
  fn clone(&self) -> Self {
    Identity {
      key: self.key.clone_key(),
      certs: self.certs.clone(),
    }
  }
}

impl Debug for Identity {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Identity")
      .field("certs", &self.certs.len())
      .finish()
  }
}

impl Identity {
  /// Parses PEM encoded private key and certificate.
  ///
  /// The input should contain a PEM encoded private key
  /// and at least one PEM encoded certificate.
  ///
  /// Note: The private key must be in RSA, SEC1 Elliptic Curve or PKCS#8 format.
  pub fn from_pem(buf: &[u8]) -> crate::Result<Identity> {
    use rustls_pemfile::Item;

    let mut pem = buf;
    let mut sk = Vec::<PrivateKeyDer>::new();
    let mut certs = Vec::<CertificateDer>::new();
    for result in rustls_pemfile::read_all(&mut pem) {
      match result {
        Ok(Item::X509Certificate(cert)) => certs.push(cert),
        Ok(Item::Pkcs1Key(key)) => sk.push(key.into()),
        Ok(Item::Pkcs8Key(key)) => sk.push(key.into()),
        Ok(Item::Sec1Key(key)) => sk.push(key.into()),
        Ok(_) => {
          return Err(crate::errors::builder(TLSError::General(String::from(
            "No valid certificate was found",
          ))))
        }
        Err(_) => {
          return Err(crate::errors::builder(TLSError::General(String::from(
            "Invalid identity PEM file",
          ))))
        }
      }
    }
    match (sk.pop(), certs.is_empty()) {
      (Some(key), false) => Ok(Identity { key, certs }),
      _ => Err(crate::errors::builder(TLSError::General(String::from(
        "private key or certificate not found",
      )))),
    }
  }

  fn certified_key(&self) -> Option<Arc<CertifiedKey>> {
    let key = rustls::crypto::ring::sign::any_supported_type(&self.key).ok()?;
    Some(Arc::new(CertifiedKey::new(self.certs.clone(), key)))
  }
}

/// Decides whether an upstream certificate is accepted.
pub trait ServerCertificateValidator: Send + Sync {
  /// `valid` is the verdict so far; return the new verdict.
  fn validate(
    &self,
    host: &str,
    end_entity: &CertificateDer<'_>,
    intermediates: &[CertificateDer<'_>],
    valid: bool,
  ) -> bool;
}

/// Picks the client certificate offered to an upstream server.
pub trait ClientCertificateSelector: Send + Sync {
  /// `acceptable_issuers` are the DER subjects the server hinted at.
  fn select(&self, host: &str, acceptable_issuers: &[&[u8]]) -> Option<Identity>;
}

/// Everything needed to build the client side TLS configuration.
#[derive(Clone, Default)]
pub struct TlsClientSettings {
  pub(crate) certs_verification: bool,
  pub(crate) root_certificates: Vec<Certificate>,
  pub(crate) identity: Option<Identity>,
  pub(crate) validators: Vec<Arc<dyn ServerCertificateValidator>>,
  pub(crate) selectors: Vec<Arc<dyn ClientCertificateSelector>>,
}

impl TlsClientSettings {
  /// Client configuration for one upstream `host`.
  ///
  /// `tls12_only` narrows the handshake for servers that choke on TLS 1.3.
  pub(crate) fn client_config(
    &self,
    host: &str,
    alpn: &[Vec<u8>],
    tls12_only: bool,
  ) -> crate::Result<Arc<ClientConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let versions: &[&'static rustls::SupportedProtocolVersion] = if tls12_only {
      &[&rustls::version::TLS12]
    } else {
      rustls::ALL_VERSIONS
    };
    let config_builder = ClientConfig::builder_with_provider(provider.clone())
      .with_protocol_versions(versions)
      .map_err(|_| crate::errors::builder("invalid TLS versions"))?;
    let base: Arc<dyn ServerCertVerifier> = if self.certs_verification {
      let mut root_cert_store = RootCertStore::empty();
      for cert in &self.root_certificates {
        cert.add_to_tls(&mut root_cert_store)?;
      }
      WebPkiServerVerifier::builder_with_provider(Arc::new(root_cert_store), provider)
        .build()
        .map_err(crate::errors::builder)?
    } else {
      Arc::new(NoVerifier)
    };
    let verifier = HookVerifier {
      host: host.to_string(),
      base,
      validators: self.validators.clone(),
    };
    let config_builder = config_builder
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(verifier));
    let mut config = if !self.selectors.is_empty() {
      config_builder.with_client_cert_resolver(Arc::new(SelectorResolver {
        host: host.to_string(),
        selectors: self.selectors.clone(),
        fallback: self.identity.clone(),
      }))
    } else if let Some(id) = &self.identity {
      config_builder
        .with_client_auth_cert(id.certs.clone(), id.key.clone_key())
        .map_err(crate::errors::builder)?
    } else {
      config_builder.with_no_client_auth()
    };
    config.alpn_protocols = alpn.to_vec();
    Ok(Arc::new(config))
  }
}

/// Runs the base verification and then every registered validator.
pub(crate) struct HookVerifier {
  host: String,
  base: Arc<dyn ServerCertVerifier>,
  validators: Vec<Arc<dyn ServerCertificateValidator>>,
}

impl Debug for HookVerifier {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("HookVerifier")
      .field("host", &self.host)
      .field("validators", &self.validators.len())
      .finish()
  }
}

impl ServerCertVerifier for HookVerifier {
  fn verify_server_cert(
    &self,
    end_entity: &CertificateDer<'_>,
    intermediates: &[CertificateDer<'_>],
    server_name: &ServerName<'_>,
    ocsp_response: &[u8],
    now: UnixTime,
  ) -> Result<ServerCertVerified, TLSError> {
    let verdict =
      self
        .base
        .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now);
    if self.validators.is_empty() {
      return verdict;
    }
    let mut valid = verdict.is_ok();
    for validator in &self.validators {
      let decided = catch_unwind(AssertUnwindSafe(|| {
        validator.validate(&self.host, end_entity, intermediates, valid)
      }));
      match decided {
        Ok(v) => valid = v,
        Err(_) => tracing::error!("certificate validator panicked for {}", self.host),
      }
    }
    match (valid, verdict) {
      (true, _) => Ok(ServerCertVerified::assertion()),
      (false, Err(e)) => Err(e),
      (false, Ok(_)) => Err(TLSError::General(format!(
        "certificate for {} rejected by validator",
        self.host
      ))),
    }
  }

  fn verify_tls12_signature(
    &self,
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &DigitallySignedStruct,
  ) -> Result<HandshakeSignatureValid, TLSError> {
    self.base.verify_tls12_signature(message, cert, dss)
  }

  fn verify_tls13_signature(
    &self,
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &DigitallySignedStruct,
  ) -> Result<HandshakeSignatureValid, TLSError> {
    self.base.verify_tls13_signature(message, cert, dss)
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    self.base.supported_verify_schemes()
  }
}

struct SelectorResolver {
  host: String,
  selectors: Vec<Arc<dyn ClientCertificateSelector>>,
  fallback: Option<Identity>,
}

impl Debug for SelectorResolver {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SelectorResolver")
      .field("host", &self.host)
      .finish()
  }
}

impl ResolvesClientCert for SelectorResolver {
  fn resolve(
    &self,
    root_hint_subjects: &[&[u8]],
    _sigschemes: &[SignatureScheme],
  ) -> Option<Arc<CertifiedKey>> {
    let selected = self.selectors.iter().find_map(|selector| {
      catch_unwind(AssertUnwindSafe(|| {
        selector.select(&self.host, root_hint_subjects)
      }))
      .ok()
      .flatten()
    });
    selected.or_else(|| self.fallback.clone())?.certified_key()
  }

  fn has_certs(&self) -> bool {
    true
  }
}

#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> Result<ServerCertVerified, TLSError> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::RSA_PKCS1_SHA1,
      SignatureScheme::ECDSA_SHA1_Legacy,
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
      SignatureScheme::ED448,
    ]
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct Reject;
  impl ServerCertificateValidator for Reject {
    fn validate(&self, _: &str, _: &CertificateDer<'_>, _: &[CertificateDer<'_>], _: bool) -> bool {
      false
    }
  }

  struct Panics;
  impl ServerCertificateValidator for Panics {
    fn validate(&self, _: &str, _: &CertificateDer<'_>, _: &[CertificateDer<'_>], _: bool) -> bool {
      panic!("validator bug")
    }
  }

  fn verify(validators: Vec<Arc<dyn ServerCertificateValidator>>) -> bool {
    let verifier = HookVerifier {
      host: "example.com".to_string(),
      base: Arc::new(NoVerifier),
      validators,
    };
    let cert = CertificateDer::from(vec![0u8; 4]);
    let name = ServerName::try_from("example.com").unwrap();
    verifier
      .verify_server_cert(&cert, &[], &name, &[], UnixTime::now())
      .is_ok()
  }

  #[test]
  fn validators_overrule_the_base_verdict() {
    assert!(verify(vec![]));
    assert!(!verify(vec![Arc::new(Reject)]));
    // a panicking validator keeps the verdict it was handed
    assert!(verify(vec![Arc::new(Panics)]));
  }

  #[test]
  fn tls12_only_config_builds() {
    let settings = TlsClientSettings::default();
    let config = settings
      .client_config("example.com", &[b"http/1.1".to_vec()], true)
      .unwrap();
    assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
  }

  #[test]
  fn identity_requires_key_and_cert() {
    assert!(Identity::from_pem(b"").is_err());
  }
}
