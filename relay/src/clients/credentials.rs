use chrono::{DateTime, Utc};
use relay_config::shared::CredentialConfig;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use crate::bail;
use crate::classifier::{CallCategory, classify_status};
use crate::error::{ErrorKind, RelayResult};
use crate::relay_error;

const METADATA_API_VERSION: &str = "2018-02-01";
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// A short-lived bearer token for one audience.
#[derive(Clone)]
pub struct AccessToken {
    token: SecretString,
    expires_on: Option<DateTime<Utc>>,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_on: Option<DateTime<Utc>>) -> Self {
        Self {
            token: SecretString::from(token.into()),
            expires_on,
        }
    }

    pub fn expires_on(&self) -> Option<DateTime<Utc>> {
        self.expires_on
    }

    /// `Authorization` header value.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token.expose_secret())
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"[REDACTED]")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

/// Issues bearer tokens for an audience.
///
/// Callers ask for a token right before every outbound call; tokens are never shared between
/// call categories.
pub trait TokenProvider {
    fn token(&self, audience: &str) -> impl Future<Output = RelayResult<AccessToken>> + Send;
}

#[derive(Deserialize)]
struct MetadataTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_on: Option<String>,
}

/// Workload identity tokens from the local instance metadata endpoint.
#[derive(Debug, Clone)]
pub struct WorkloadIdentityProvider {
    client: Client,
    endpoint: String,
    client_id: Option<String>,
}

impl WorkloadIdentityProvider {
    pub fn new(config: &CredentialConfig) -> RelayResult<Self> {
        let client = Client::builder()
            .timeout(METADATA_TIMEOUT)
            .build()
            .map_err(|err| relay_error!(ErrorKind::ConfigError, "Failed to build HTTP client", err))?;

        Ok(Self {
            client,
            endpoint: config.metadata_endpoint.clone(),
            client_id: config.client_id.clone(),
        })
    }
}

impl TokenProvider for WorkloadIdentityProvider {
    async fn token(&self, audience: &str) -> RelayResult<AccessToken> {
        let mut query = vec![("api-version", METADATA_API_VERSION), ("resource", audience)];
        if let Some(client_id) = &self.client_id {
            query.push(("client_id", client_id.as_str()));
        }

        let response = self
            .client
            .get(&self.endpoint)
            .header("Metadata", "true")
            .query(&query)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let kind = classify_status(status, &body, CallCategory::Credentials);
            bail!(
                kind,
                "Workload identity token request failed",
                format!("{status} for audience {audience}: {body}")
            );
        }

        let body: MetadataTokenResponse = response.json().await?;
        if body.access_token.is_empty() {
            bail!(
                ErrorKind::MalformedCredential,
                "Metadata endpoint returned an empty token",
                audience
            );
        }

        let expires_on = body
            .expires_on
            .and_then(|seconds| seconds.parse::<i64>().ok())
            .and_then(|seconds| DateTime::from_timestamp(seconds, 0));

        Ok(AccessToken::new(body.access_token, expires_on))
    }
}
