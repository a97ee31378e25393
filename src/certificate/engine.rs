use crate::errors::{Error, Result};
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType, SignatureAlgorithm,
};
use rustls_pki_types::CertificateDer;
use std::net::IpAddr;
use time::{Duration, OffsetDateTime};

/// Key algorithm used to sign the root and every minted leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignerEngine {
  /// ECDSA over P-256 with SHA-256.
  #[default]
  EcdsaP256,
  /// ECDSA over P-384 with SHA-384.
  EcdsaP384,
  /// Ed25519.
  Ed25519,
}

/// Validity window of a certificate.
#[derive(Debug, Clone, Copy)]
pub struct Validity {
  /// Start of validity.
  pub not_before: OffsetDateTime,
  /// End of validity.
  pub not_after: OffsetDateTime,
}

impl Validity {
  /// `days` from now, starting `backdate` in the past to absorb clock skew.
  pub fn days_from_now(days: i64, backdate: Duration) -> Self {
    let now = OffsetDateTime::now_utc();
    Validity {
      not_before: now - backdate,
      not_after: now + Duration::days(days),
    }
  }
}

/// Output of a mint: the certificate and the key that signs for it.
pub struct Minted {
  /// DER certificate.
  pub der: CertificateDer<'static>,
  /// PEM certificate.
  pub pem: String,
  /// Key pair of the certificate.
  pub key_pair: KeyPair,
  /// End of validity.
  pub not_after: OffsetDateTime,
}

impl SignerEngine {
  fn algorithm(&self) -> &'static SignatureAlgorithm {
    match self {
      SignerEngine::EcdsaP256 => &rcgen::PKCS_ECDSA_P256_SHA256,
      SignerEngine::EcdsaP384 => &rcgen::PKCS_ECDSA_P384_SHA384,
      SignerEngine::Ed25519 => &rcgen::PKCS_ED25519,
    }
  }

  /// Generate a fresh key pair for this engine.
  pub fn generate_key(&self) -> Result<KeyPair> {
    KeyPair::generate_for(self.algorithm())
      .map_err(|e| Error::certificate(format!("Failed to generate key pair: {}", e)))
  }

  /// Mint a certificate for `name`.
  ///
  /// Without an issuer the result is a self-signed certificate authority,
  /// otherwise a server leaf signed by `issuer`.
  pub fn mint(
    &self,
    name: &str,
    organization: &str,
    issuer: Option<&Issuer<'_, KeyPair>>,
    validity: Validity,
  ) -> Result<Minted> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, name);
    dn.push(DnType::OrganizationName, organization);
    params.not_before = validity.not_before;
    params.not_after = validity.not_after;
    let key_pair = self.generate_key()?;
    let cert = match issuer {
      None => {
        dn.push(DnType::OrganizationalUnitName, organization);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
          KeyUsagePurpose::KeyCertSign,
          KeyUsagePurpose::CrlSign,
          KeyUsagePurpose::DigitalSignature,
        ];
        params
          .self_signed(&key_pair)
          .map_err(|e| Error::certificate(format!("Failed to generate CA: {}", e)))?
      }
      Some(issuer) => {
        params.distinguished_name = dn;
        params.subject_alt_names = subject_alt_names(name)?;
        params.key_usages = vec![
          KeyUsagePurpose::DigitalSignature,
          KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params
          .signed_by(&key_pair, issuer)
          .map_err(|e| Error::certificate(format!("Failed to sign server cert: {}", e)))?
      }
    };
    Ok(Minted {
      der: cert.der().clone(),
      pem: cert.pem(),
      key_pair,
      not_after: validity.not_after,
    })
  }
}

fn subject_alt_names(name: &str) -> Result<Vec<SanType>> {
  if let Ok(ip) = name.parse::<IpAddr>() {
    return Ok(vec![SanType::IpAddress(ip)]);
  }
  Ok(vec![SanType::DnsName(name.try_into().map_err(|_| {
    Error::certificate(format!("Invalid domain name: {}", name))
  })?)])
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn every_engine_signs_a_leaf() {
    for engine in [
      SignerEngine::EcdsaP256,
      SignerEngine::EcdsaP384,
      SignerEngine::Ed25519,
    ] {
      let validity = Validity::days_from_now(1, Duration::minutes(10));
      let root = engine.mint("Test Root", "T2", None, validity).unwrap();
      let issuer = Issuer::from_ca_cert_pem(&root.pem, root.key_pair).unwrap();
      let leaf = engine
        .mint("*.example.com", "T2", Some(&issuer), validity)
        .unwrap();
      assert!(leaf.pem.starts_with("-----BEGIN CERTIFICATE-----"));
      assert_eq!(leaf.not_after, validity.not_after);
    }
  }

  #[test]
  fn ip_literal_gets_ip_san() {
    let sans = subject_alt_names("203.0.113.5").unwrap();
    assert!(matches!(sans[0], SanType::IpAddress(_)));
  }
}
