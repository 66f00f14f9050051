//! Bearer token acquisition (OAuth2 resource-owner password grant).
//!
//! One token is obtained per run and reused for every FHIR and archive call. Failure to obtain
//! it is fatal: nothing else can be done without it.

use crate::config::TokenSettings;
use crate::{SyncError, SyncResult};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info};

/// Opaque bearer credential. The [`Debug`] impl never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccessToken([REDACTED])")
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
}

pub struct TokenProvider {
    http: Client,
    settings: TokenSettings,
}

impl TokenProvider {
    pub fn new(http: Client, settings: TokenSettings) -> Self {
        Self { http, settings }
    }

    /// Request a token from the identity provider.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Auth`] when the request fails, the provider refuses it, or the
    /// response carries no usable `access_token`.
    pub async fn obtain(&self) -> SyncResult<AccessToken> {
        let settings = &self.settings;
        debug!("requesting access token from {}", settings.token_url);

        let form = [
            ("grant_type", "password"),
            ("client_id", settings.client_id.as_str()),
            ("client_secret", settings.client_secret.as_str()),
            ("username", settings.username.as_str()),
            ("password", settings.password.as_str()),
            ("scope", settings.scope.as_str()),
        ];

        let response = self
            .http
            .post(settings.token_url.as_str())
            .form(&form)
            .send()
            .await
            .map_err(|e| SyncError::Auth(format!("token request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<no body>".to_string());
            return Err(SyncError::Auth(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| SyncError::Auth(format!("failed to parse token response: {e}")))?;

        match parsed.access_token {
            Some(token) if !token.trim().is_empty() && token != "null" => {
                info!("access token obtained for {}", settings.username);
                Ok(AccessToken(token))
            }
            _ => Err(SyncError::Auth(
                "token response carried no access_token".into(),
            )),
        }
    }
}
