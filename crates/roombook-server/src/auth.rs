//! Bearer token verification.
//!
//! The server never decides on its own who a caller is. Tokens are either
//! matched against a configured key list or handed to the accounts service,
//! which answers with the user behind them.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use roombook_providers::BoxFuture;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::config::{AuthMode, AuthSettings};
use crate::error::ConfigError;

/// The caller behind an accepted token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
    /// Set for people; API keys have none.
    pub email: Option<String>,
}

impl Identity {
    /// A caller that is a service holding an API key.
    pub fn service(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            email: None,
        }
    }

    /// A person known by email.
    pub fn person(email: impl Into<String>) -> Self {
        let email = email.into();
        Self {
            subject: email.clone(),
            email: Some(email),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    Missing,

    #[error("token rejected: {0}")]
    Rejected(String),

    /// The verifier could not reach a decision.
    #[error("accounts service unavailable: {0}")]
    Unavailable(String),
}

/// Decides whether a bearer token belongs to a known caller.
pub trait IdentityVerifier: Send + Sync {
    fn verify<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<Identity, AuthError>>;
}

/// Accepts a fixed set of API keys.
#[derive(Debug, Clone)]
pub struct StaticTokenVerifier {
    tokens: HashSet<String>,
}

impl StaticTokenVerifier {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens
                .into_iter()
                .map(Into::into)
                .filter(|t: &String| !t.trim().is_empty())
                .collect(),
        }
    }
}

impl IdentityVerifier for StaticTokenVerifier {
    fn verify<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<Identity, AuthError>> {
        let result = if self.tokens.contains(token) {
            Ok(Identity::service("api-key"))
        } else {
            Err(AuthError::Rejected("unknown API key".to_string()))
        };
        Box::pin(async move { result })
    }
}

/// Asks the accounts service who owns the token.
#[derive(Debug, Clone)]
pub struct AccountsVerifier {
    http: reqwest::Client,
    me_url: Url,
}

#[derive(Debug, Deserialize)]
struct AccountsUser {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    innopolis_sso: Option<SsoProfile>,
}

#[derive(Debug, Deserialize)]
struct SsoProfile {
    #[serde(default)]
    email: Option<String>,
}

impl AccountsUser {
    fn identity(self) -> Option<Identity> {
        match self.innopolis_sso.and_then(|sso| sso.email).or(self.email) {
            Some(email) => Some(Identity::person(email)),
            None => self.id.map(Identity::service),
        }
    }
}

impl AccountsVerifier {
    pub fn new(api_url: &Url, timeout: Duration) -> Result<Self, ConfigError> {
        let me_url = Url::parse(&format!(
            "{}/users/me",
            api_url.as_str().trim_end_matches('/')
        ))
        .map_err(|e| ConfigError::invalid("auth.api_url", e.to_string()))?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("roombook/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfigError::invalid("auth.api_url", e.to_string()))?;
        Ok(Self { http, me_url })
    }

    pub fn me_url(&self) -> &Url {
        &self.me_url
    }
}

impl IdentityVerifier for AccountsVerifier {
    fn verify<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<Identity, AuthError>> {
        Box::pin(async move {
            let response = self
                .http
                .get(self.me_url.clone())
                .bearer_auth(token)
                .send()
                .await
                .map_err(|e| {
                    warn!(error = %e, "accounts service request failed");
                    AuthError::Unavailable(e.to_string())
                })?;

            match response.status() {
                StatusCode::OK => {}
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                    debug!(status = %response.status(), "accounts service rejected token");
                    return Err(AuthError::Rejected(format!(
                        "accounts service answered {}",
                        response.status()
                    )));
                }
                status => {
                    warn!(%status, "unexpected accounts service status");
                    return Err(AuthError::Unavailable(format!("HTTP {status}")));
                }
            }

            let user: AccountsUser = response
                .json()
                .await
                .map_err(|e| AuthError::Unavailable(format!("unreadable user profile: {e}")))?;
            user.identity()
                .ok_or_else(|| AuthError::Rejected("user profile has no identity".to_string()))
        })
    }
}

/// Builds the verifier selected by `[auth]`.
pub fn verifier_from_settings(
    settings: &AuthSettings,
    timeout: Duration,
) -> Result<Arc<dyn IdentityVerifier>, ConfigError> {
    match settings.mode {
        AuthMode::Static => Ok(Arc::new(StaticTokenVerifier::new(settings.tokens.clone()))),
        AuthMode::Accounts => {
            let raw = settings
                .api_url
                .as_deref()
                .ok_or_else(|| ConfigError::invalid("auth.api_url", "required in accounts mode"))?;
            let api_url =
                Url::parse(raw).map_err(|e| ConfigError::invalid("auth.api_url", e.to_string()))?;
            Ok(Arc::new(AccountsVerifier::new(&api_url, timeout)?))
        }
    }
}

/// Extracts the token from an `Authorization: Bearer ...` value.
pub fn bearer_token(header: Option<&str>) -> Result<&str, AuthError> {
    let value = header.ok_or(AuthError::Missing)?;
    let (scheme, token) = value.split_once(' ').ok_or(AuthError::Missing)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::Missing);
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::Missing);
    }
    Ok(token)
}
