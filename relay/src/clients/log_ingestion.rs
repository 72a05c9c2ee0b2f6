use reqwest::Client;
use std::future::Future;
use std::time::Duration;

use crate::bail;
use crate::classifier::{CallCategory, classify_status};
use crate::clients::credentials::TokenProvider;
use crate::error::{ErrorKind, RelayResult};
use crate::relay_error;
use crate::types::Record;

const INGESTION_API_VERSION: &str = "2023-01-01";
const INGESTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Where log-ingestion uploads of one table go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogIngestionTarget {
    pub endpoint: String,
    pub rule_id: String,
    pub stream: String,
}

impl LogIngestionTarget {
    /// Custom tables are written through a stream named after the table.
    pub fn for_table(endpoint: impl Into<String>, rule_id: impl Into<String>, table: &str) -> Self {
        Self {
            endpoint: endpoint.into(),
            rule_id: rule_id.into(),
            stream: format!("Custom-{table}"),
        }
    }

    fn upload_url(&self) -> String {
        format!(
            "{}/dataCollectionRules/{}/streams/{}?api-version={INGESTION_API_VERSION}",
            self.endpoint.trim_end_matches('/'),
            self.rule_id,
            self.stream
        )
    }
}

/// Structured log-ingestion sink.
pub trait LogIngestionClient {
    fn upload(
        &self,
        target: &LogIngestionTarget,
        records: &[Record],
    ) -> impl Future<Output = RelayResult<()>> + Send;
}

#[derive(Debug, Clone)]
pub struct HttpLogIngestionClient<T> {
    client: Client,
    audience: String,
    tokens: T,
}

impl<T> HttpLogIngestionClient<T>
where
    T: TokenProvider + Sync,
{
    pub fn new(audience: impl Into<String>, tokens: T) -> RelayResult<Self> {
        let client = Client::builder()
            .timeout(INGESTION_TIMEOUT)
            .build()
            .map_err(|err| relay_error!(ErrorKind::ConfigError, "Failed to build HTTP client", err))?;

        Ok(Self {
            client,
            audience: audience.into(),
            tokens,
        })
    }
}

impl<T> LogIngestionClient for HttpLogIngestionClient<T>
where
    T: TokenProvider + Sync,
{
    async fn upload(&self, target: &LogIngestionTarget, records: &[Record]) -> RelayResult<()> {
        // A fresh token for every upload; ingestion tokens are never reused across calls.
        let token = self.tokens.token(&self.audience).await?;

        let response = self
            .client
            .post(target.upload_url())
            .header(reqwest::header::AUTHORIZATION, token.bearer())
            .json(records)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let kind = classify_status(status, &body, CallCategory::LogIngestion);
            bail!(
                kind,
                "Log ingestion upload failed",
                format!("{status} for stream {}: {body}", target.stream)
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::credentials::StaticTokenProvider;
    use crate::test_utils::fixtures::record;
    use crate::test_utils::http::serve_once;
    use serde_json::json;

    #[test]
    fn upload_url_names_rule_and_stream() {
        let target = LogIngestionTarget::for_table("https://dce.example.com/", "dcr-123", "Orders");

        assert_eq!(
            target.upload_url(),
            "https://dce.example.com/dataCollectionRules/dcr-123/streams/Custom-Orders?api-version=2023-01-01"
        );
    }

    #[tokio::test]
    async fn upload_posts_a_json_array_with_a_fresh_token() {
        let (url, request) = serve_once(204, "").await.unwrap();
        let tokens = StaticTokenProvider::new("ingest-token");
        let client = HttpLogIngestionClient::new("https://monitor.azure.com", tokens.clone()).unwrap();
        let target = LogIngestionTarget::for_table(url, "dcr-1", "Orders");

        client
            .upload(&target, &[record(json!({"Id": 1}))])
            .await
            .unwrap();

        let request = request.await.unwrap().unwrap();
        assert!(request.starts_with(
            "POST /dataCollectionRules/dcr-1/streams/Custom-Orders?api-version=2023-01-01 "
        ));
        assert!(request.to_lowercase().contains("authorization: bearer ingest-token"));
        assert!(request.ends_with(r#"[{"Id":1}]"#));
        assert_eq!(tokens.requests().await, vec!["https://monitor.azure.com"]);
    }

    #[tokio::test]
    async fn rejected_rule_is_a_sink_configuration_error() {
        let (url, _request) = serve_once(404, r#"{"error":"rule not found"}"#).await.unwrap();
        let client =
            HttpLogIngestionClient::new("audience", StaticTokenProvider::new("t")).unwrap();
        let target = LogIngestionTarget::for_table(url, "dcr-missing", "Orders");

        let err = client
            .upload(&target, &[record(json!({"Id": 1}))])
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::SinkConfigurationError);
        assert!(!err.is_retryable());
    }
}
