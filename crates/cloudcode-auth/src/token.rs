//! OAuth refresh-token grant
//!
//! Accounts only ever store a long-lived refresh token. Every quota probe
//! starts by exchanging it for a short-lived access token at the Google token
//! endpoint. Access tokens are never persisted.

use std::time::Duration;

use common::Secret;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::constants::{DEFAULT_CLIENT_ID, TOKEN_ENDPOINT};
use crate::error::{Error, Result};

/// OAuth client identity used for refresh grants.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: Option<Secret<String>>,
    pub token_url: String,
}

impl Default for OAuthClient {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID.to_string(),
            client_secret: None,
            token_url: TOKEN_ENDPOINT.to_string(),
        }
    }
}

/// Token endpoint response. Only the access token is consumed.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: Secret<String>,
    /// Seconds until the access token expires
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// Exchange a refresh token for an access token.
///
/// 400/401/403 mean the refresh token (or the client registration) was
/// rejected and come back as `InvalidCredentials`. Every other failure is
/// transient from the caller's point of view.
pub async fn refresh_token(
    http: &reqwest::Client,
    client: &OAuthClient,
    refresh: &str,
    timeout: Duration,
) -> Result<TokenResponse> {
    let mut form: Vec<(&str, &str)> = vec![
        ("client_id", client.client_id.as_str()),
        ("refresh_token", refresh),
        ("grant_type", "refresh_token"),
    ];
    if let Some(secret) = &client.client_secret {
        form.push(("client_secret", secret.expose().as_str()));
    }

    let response = http
        .post(&client.token_url)
        .form(&form)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| Error::from_reqwest("token refresh request failed", e))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        warn!(status = status.as_u16(), "token refresh rejected");

        if matches!(status.as_u16(), 400 | 401 | 403) {
            return Err(Error::InvalidCredentials(format!(
                "refresh token rejected ({status}): {body}"
            )));
        }

        return Err(Error::TokenExchange(format!(
            "token endpoint returned {status}: {body}"
        )));
    }

    let token = response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid refresh response: {e}")))?;
    debug!(expires_in = ?token.expires_in, "access token refreshed");
    Ok(token)
}
