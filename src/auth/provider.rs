use std::time::Duration;

use anyhow::Context;
use axum::http::{header, HeaderMap};
use tracing::debug;

use super::AuthError;
use crate::config::{IdentityConfig, IdentityProviderKind};

/// Source of the caller's real identity.
pub trait IdentityProvider: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &'static str;

    /// Returns the real identity of the caller that sent `headers`.
    fn current_identity(
        &self,
        headers: &HeaderMap,
    ) -> impl std::future::Future<Output = Result<String, AuthError>> + Send;
}

/// Resolves identity by forwarding the caller's bearer token to an
/// OpenID Connect userinfo endpoint.
pub struct OAuthProvider {
    http: reqwest::Client,
    endpoint: String,
    identity_field: String,
}

impl OAuthProvider {
    /// Creates a provider for the given userinfo endpoint.
    pub fn new(endpoint: &str, identity_field: &str, timeout: Duration) -> anyhow::Result<Self> {
        let timeout = if timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building userinfo HTTP client")?;

        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
            identity_field: identity_field.to_string(),
        })
    }
}

impl IdentityProvider for OAuthProvider {
    fn name(&self) -> &'static str {
        "oauth"
    }

    async fn current_identity(&self, headers: &HeaderMap) -> Result<String, AuthError> {
        let token = bearer_token(headers).ok_or_else(|| AuthError::Unauthenticated {
            reason: "missing bearer token".to_string(),
        })?;

        let response = self
            .http
            .get(&self.endpoint)
            .bearer_auth(token)
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| {
                debug!(error = %e, "userinfo request failed");
                AuthError::Unauthenticated {
                    reason: "identity provider unreachable".to_string(),
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::Unauthenticated {
                reason: format!("identity provider returned {status}"),
            });
        }

        let body: serde_json::Value =
            response
                .json()
                .await
                .map_err(|_| AuthError::Unauthenticated {
                    reason: "undecodable userinfo response".to_string(),
                })?;

        identity_from_userinfo(&body, &self.identity_field)
    }
}

/// Reads the real identity from a header set by a trusted fronting proxy.
pub struct HeaderProvider {
    header: String,
}

impl HeaderProvider {
    /// Creates a provider reading `header`.
    pub fn new(header: &str) -> Self {
        Self {
            header: header.to_ascii_lowercase(),
        }
    }
}

impl IdentityProvider for HeaderProvider {
    fn name(&self) -> &'static str {
        "header"
    }

    async fn current_identity(&self, headers: &HeaderMap) -> Result<String, AuthError> {
        let value = headers
            .get(self.header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .unwrap_or_default();

        if value.is_empty() {
            return Err(AuthError::Unauthenticated {
                reason: format!("missing {} header", self.header),
            });
        }

        Ok(value.to_string())
    }
}

/// Identity provider selected by configuration.
pub enum Provider {
    OAuth(OAuthProvider),
    Header(HeaderProvider),
}

impl Provider {
    /// Builds the configured provider.
    pub fn from_config(cfg: &IdentityConfig) -> anyhow::Result<Self> {
        match cfg.provider {
            IdentityProviderKind::OAuth => Ok(Self::OAuth(OAuthProvider::new(
                &cfg.userinfo_endpoint,
                &cfg.identity_field,
                cfg.timeout,
            )?)),
            IdentityProviderKind::Header => Ok(Self::Header(HeaderProvider::new(&cfg.header))),
        }
    }
}

impl IdentityProvider for Provider {
    fn name(&self) -> &'static str {
        match self {
            Self::OAuth(p) => p.name(),
            Self::Header(p) => p.name(),
        }
    }

    async fn current_identity(&self, headers: &HeaderMap) -> Result<String, AuthError> {
        match self {
            Self::OAuth(p) => p.current_identity(headers).await,
            Self::Header(p) => p.current_identity(headers).await,
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

fn identity_from_userinfo(body: &serde_json::Value, field: &str) -> Result<String, AuthError> {
    match body.get(field).and_then(|v| v.as_str()) {
        Some(identity) if !identity.is_empty() => Ok(identity.to_string()),
        _ => Err(AuthError::Unauthenticated {
            reason: format!("userinfo response has no {field}"),
        }),
    }
}
