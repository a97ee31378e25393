//! Proxy authorization
//!
//! Checks the `Proxy-Authorization` header of plain requests and CONNECT
//! requests. Requests inside a tunnel were authorized with the CONNECT.
use crate::errors::Result;
use crate::interceptor::contained;
use crate::response::Response;
use crate::session::Session;
use async_trait::async_trait;
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use http::header::PROXY_AUTHORIZATION;
use std::sync::Arc;

const REQUIRED: &str = "Proxy Authentication Required";
const INVALID: &str = "Proxy Authentication Invalid";

/// Checks Basic credentials.
#[async_trait]
pub trait BasicAuthenticator: Send + Sync {
  /// Whether `username` and `password` are accepted.
  async fn authenticate(&self, session: &Session, username: &str, password: &str) -> Result<bool>;
}

/// Result of a scheme based authentication round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
  /// Credentials accepted.
  Success,
  /// Credentials rejected.
  Failure,
  /// Another round is needed, the value is sent back as the challenge.
  ContinuationNeeded(String),
}

/// Multi-round schemes such as NTLM or Negotiate.
#[async_trait]
pub trait SchemeAuthenticator: Send + Sync {
  /// Scheme names offered in challenges.
  fn schemes(&self) -> Vec<String>;
  /// Check `token` sent with `scheme`.
  async fn authenticate(&self, scheme: &str, token: &str, session: &Session) -> Result<AuthOutcome>;
}

/// The authorization step of a session.
#[derive(Clone, Default)]
pub struct ProxyAuthorization {
  realm: String,
  basic: Option<Arc<dyn BasicAuthenticator>>,
  scheme: Option<Arc<dyn SchemeAuthenticator>>,
}

impl std::fmt::Debug for ProxyAuthorization {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ProxyAuthorization")
      .field("realm", &self.realm)
      .field("basic", &self.basic.is_some())
      .field("scheme", &self.scheme.is_some())
      .finish()
  }
}

impl ProxyAuthorization {
  /// No authenticators yet, challenges use `realm`.
  pub fn new(realm: impl Into<String>) -> Self {
    ProxyAuthorization {
      realm: realm.into(),
      basic: None,
      scheme: None,
    }
  }
  /// Use `authenticator` for Basic credentials.
  pub fn with_basic(mut self, authenticator: Arc<dyn BasicAuthenticator>) -> Self {
    self.basic = Some(authenticator);
    self
  }
  /// Use `authenticator` for scheme based credentials.
  pub fn with_scheme(mut self, authenticator: Arc<dyn SchemeAuthenticator>) -> Self {
    self.scheme = Some(authenticator);
    self
  }
  /// Whether any authenticator is installed.
  pub fn is_enabled(&self) -> bool {
    self.basic.is_some() || self.scheme.is_some()
  }

  /// `Proxy-Authenticate` values of a fresh challenge.
  pub fn challenges(&self) -> Vec<String> {
    let mut challenges = Vec::new();
    if self.basic.is_some() {
      challenges.push(format!("Basic realm=\"{}\"", self.realm));
    }
    if let Some(scheme) = &self.scheme {
      challenges.extend(scheme.schemes());
    }
    challenges
  }

  fn reject(&self, reason: &str) -> Response {
    Response::proxy_authentication_required(reason, &self.challenges(), false)
  }

  /// Check the request of `session`.
  ///
  /// `None` lets the request through. Otherwise the returned 407 goes back to
  /// the client. An authenticator failure also becomes a 407 and is returned
  /// as the error so it can be reported.
  pub async fn check(&self, session: &Session) -> (Option<Response>, Option<crate::Error>) {
    if !self.is_enabled() {
      return (None, None);
    }
    // 认证器是外部回调，panic 也只算一次失败
    match contained("authenticate", self.verify(session)).await {
      Ok(verdict) => (verdict, None),
      Err(err) => (Some(self.reject(INVALID)), Some(err)),
    }
  }

  async fn verify(&self, session: &Session) -> Result<Option<Response>> {
    let header = match session.request().headers().get(PROXY_AUTHORIZATION) {
      None => return Ok(Some(self.reject(REQUIRED))),
      Some(value) => value.to_str().unwrap_or_default().trim().to_string(),
    };
    // 只允许 "类型 凭据" 两段
    let (kind, credentials) = match header.split_once(' ') {
      Some((kind, credentials)) if !credentials.is_empty() && !credentials.contains(' ') => (kind, credentials),
      _ => return Ok(Some(self.reject(INVALID))),
    };
    if let Some(basic) = &self.basic {
      if !kind.eq_ignore_ascii_case("Basic") {
        return Ok(Some(self.reject(INVALID)));
      }
      let decoded = match BASE64_STANDARD.decode(credentials) {
        Ok(decoded) => String::from_utf8_lossy(&decoded).to_string(),
        Err(_) => return Ok(Some(self.reject(INVALID))),
      };
      let (username, password) = match decoded.split_once(':') {
        Some(pair) => pair,
        None => return Ok(Some(self.reject(INVALID))),
      };
      return if basic.authenticate(session, username, password).await? {
        Ok(None)
      } else {
        Ok(Some(self.reject(INVALID)))
      };
    }
    if let Some(scheme) = &self.scheme {
      return match scheme.authenticate(kind, credentials, session).await? {
        AuthOutcome::Success => Ok(None),
        AuthOutcome::Failure => Ok(Some(self.reject(INVALID))),
        AuthOutcome::ContinuationNeeded(continuation) => Ok(Some(
          Response::proxy_authentication_required(INVALID, &[continuation], true),
        )),
      };
    }
    Ok(None)
  }
}
