use reqwest::Client;
use std::future::Future;
use std::time::Duration;

use crate::bail;
use crate::classifier::{CallCategory, classify_status};
use crate::clients::credentials::TokenProvider;
use crate::error::{ErrorKind, RelayResult};
use crate::relay_error;

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(60);
const NAMESPACE_SUFFIX: &str = "servicebus.windows.net";

/// Streaming sink addressed by namespace and name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventStreamTarget {
    pub namespace: String,
    pub name: String,
}

impl EventStreamTarget {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// A namespace given as a bare name is expanded to its fully qualified host.
    fn host(&self) -> String {
        if self.namespace.contains('.') {
            self.namespace.clone()
        } else {
            format!("{}.{NAMESPACE_SUFFIX}", self.namespace)
        }
    }

    fn publish_url(&self) -> String {
        format!("https://{}/{}/messages", self.host(), self.name)
    }
}

/// Streaming event sink. Every call publishes one message holding a JSON array of records.
pub trait EventStreamClient {
    fn publish(
        &self,
        target: &EventStreamTarget,
        payload: String,
    ) -> impl Future<Output = RelayResult<()>> + Send;
}

#[derive(Debug, Clone)]
pub struct HttpEventStreamClient<T> {
    client: Client,
    audience: String,
    tokens: T,
}

impl<T> HttpEventStreamClient<T>
where
    T: TokenProvider + Sync,
{
    pub fn new(audience: impl Into<String>, tokens: T) -> RelayResult<Self> {
        let client = Client::builder()
            .timeout(PUBLISH_TIMEOUT)
            .build()
            .map_err(|err| relay_error!(ErrorKind::ConfigError, "Failed to build HTTP client", err))?;

        Ok(Self {
            client,
            audience: audience.into(),
            tokens,
        })
    }
}

impl<T> EventStreamClient for HttpEventStreamClient<T>
where
    T: TokenProvider + Sync,
{
    async fn publish(&self, target: &EventStreamTarget, payload: String) -> RelayResult<()> {
        let token = self.tokens.token(&self.audience).await?;

        let response = self
            .client
            .post(target.publish_url())
            .header(reqwest::header::AUTHORIZATION, token.bearer())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let kind = classify_status(status, &body, CallCategory::EventStream);
            bail!(
                kind,
                "Event stream publish failed",
                format!("{status} for {}/{}: {body}", target.namespace, target.name)
            );
        }

        Ok(())
    }
}
