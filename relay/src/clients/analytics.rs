use relay_config::shared::AnalyticsConfig;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::bail;
use crate::classifier::{CallCategory, classify_status};
use crate::clients::credentials::TokenProvider;
use crate::error::{ErrorKind, RelayResult};
use crate::relay_error;
use crate::types::Record;

/// Query used to probe that the workspace answers at all.
const CONNECTIVITY_QUERY: &str = "print connectivity = 'ok'";

/// Read side of the analytical log store.
pub trait AnalyticsStore {
    /// Runs `query` and returns its primary result as records keyed by column name.
    fn execute_query(&self, query: &str) -> impl Future<Output = RelayResult<Vec<Record>>> + Send;

    /// Fails when the store cannot be reached or refuses our credentials.
    fn check_connectivity(&self) -> impl Future<Output = RelayResult<()>> + Send;
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    tables: Vec<ResultTable>,
}

#[derive(Debug, Deserialize)]
struct ResultTable {
    #[serde(default)]
    columns: Vec<ResultColumn>,
    #[serde(default)]
    rows: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct ResultColumn {
    name: String,
}

/// Query client of a log analytics workspace.
#[derive(Debug, Clone)]
pub struct LogAnalyticsClient<T> {
    client: Client,
    query_url: String,
    audience: String,
    server_timeout: Duration,
    tokens: T,
}

impl<T> LogAnalyticsClient<T>
where
    T: TokenProvider + Sync,
{
    pub fn new(config: &AnalyticsConfig, audience: impl Into<String>, tokens: T) -> RelayResult<Self> {
        let server_timeout = Duration::from_secs(config.query_timeout_secs);
        let client = Client::builder()
            // Leave the server time to report its own timeout before we give up on the socket.
            .timeout(server_timeout + Duration::from_secs(30))
            .build()
            .map_err(|err| relay_error!(ErrorKind::ConfigError, "Failed to build HTTP client", err))?;

        Ok(Self {
            client,
            query_url: format!(
                "{}/v1/workspaces/{}/query",
                config.base_url.trim_end_matches('/'),
                config.workspace_id
            ),
            audience: audience.into(),
            server_timeout,
            tokens,
        })
    }
}

impl<T> AnalyticsStore for LogAnalyticsClient<T>
where
    T: TokenProvider + Sync,
{
    async fn execute_query(&self, query: &str) -> RelayResult<Vec<Record>> {
        let token = self.tokens.token(&self.audience).await?;

        let response = self
            .client
            .post(&self.query_url)
            .header(reqwest::header::AUTHORIZATION, token.bearer())
            .header("Prefer", format!("wait={}", self.server_timeout.as_secs()))
            .json(&json!({ "query": query }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let kind = classify_status(status, &body, CallCategory::Analytics);
            bail!(kind, "Analytics query failed", format!("{status}: {body}"));
        }

        let body: QueryResponse = response.json().await?;
        let records = primary_result_records(body)?;
        debug!(rows = records.len(), "analytics query returned");

        Ok(records)
    }

    async fn check_connectivity(&self) -> RelayResult<()> {
        self.execute_query(CONNECTIVITY_QUERY).await.map(|_| ())
    }
}

fn primary_result_records(response: QueryResponse) -> RelayResult<Vec<Record>> {
    let Some(table) = response.tables.into_iter().next() else {
        return Ok(Vec::new());
    };

    let mut records = Vec::with_capacity(table.rows.len());
    for row in table.rows {
        if row.len() != table.columns.len() {
            bail!(
                ErrorKind::DeserializationError,
                "Analytics row does not match its columns",
                format!("{} values for {} columns", row.len(), table.columns.len())
            );
        }

        let record = table
            .columns
            .iter()
            .map(|column| column.name.clone())
            .zip(row)
            .collect::<Record>();
        records.push(record);
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::credentials::StaticTokenProvider;
    use crate::test_utils::http::serve_once;

    fn config(base_url: String) -> AnalyticsConfig {
        AnalyticsConfig {
            workspace_id: "ws-1".to_owned(),
            base_url,
            query_timeout_secs: 5,
        }
    }

    #[test]
    fn primary_result_is_zipped_with_column_names() {
        let response: QueryResponse = serde_json::from_value(json!({
            "tables": [{
                "name": "PrimaryResult",
                "columns": [{"name": "TimeGenerated", "type": "datetime"}, {"name": "Amount", "type": "real"}],
                "rows": [["2024-05-01T08:01:00Z", 12.5], ["2024-05-01T08:02:00Z", 3.0]]
            }]
        }))
        .unwrap();

        let records = primary_result_records(response).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["Amount"], json!(12.5));
        assert_eq!(records[1]["TimeGenerated"], json!("2024-05-01T08:02:00Z"));
    }

    #[test]
    fn missing_tables_mean_no_records() {
        let response: QueryResponse = serde_json::from_value(json!({})).unwrap();
        assert!(primary_result_records(response).unwrap().is_empty());
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let response: QueryResponse = serde_json::from_value(json!({
            "tables": [{"columns": [{"name": "A"}], "rows": [[1, 2]]}]
        }))
        .unwrap();

        let err = primary_result_records(response).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeserializationError);
    }

    #[tokio::test]
    async fn query_is_posted_to_the_workspace() {
        let body = r#"{"tables":[{"name":"PrimaryResult","columns":[{"name":"Id","type":"int"}],"rows":[[7]]}]}"#;
        let (url, request) = serve_once(200, body).await.unwrap();
        let client = LogAnalyticsClient::new(
            &config(url),
            "https://api.loganalytics.io",
            StaticTokenProvider::new("query-token"),
        )
        .unwrap();

        let records = client.execute_query("Orders | take 1").await.unwrap();

        assert_eq!(records[0]["Id"], json!(7));
        let request = request.await.unwrap().unwrap();
        assert!(request.starts_with("POST /v1/workspaces/ws-1/query "));
        assert!(request.contains(r#""query":"Orders | take 1""#));
    }

    #[tokio::test]
    async fn bad_query_is_terminal() {
        let (url, _request) = serve_once(400, r#"{"error":{"code":"BadArgumentError"}}"#)
            .await
            .unwrap();
        let client =
            LogAnalyticsClient::new(&config(url), "aud", StaticTokenProvider::new("t")).unwrap();

        let err = client.execute_query("Orders |").await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::QueryFailed);
    }
}
