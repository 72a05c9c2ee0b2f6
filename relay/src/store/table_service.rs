//! HTTP client for the key-value table service.
//!
//! Requests are authorized with the `SharedKeyLite` scheme: an HMAC-SHA256 of the request date
//! and the canonical resource, keyed with the base64 decoded account key. Conditional writes use
//! `If-Match` with the entity's ETag.

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use chrono::Utc;
use hmac::{Hmac, Mac};
use relay_config::shared::StoreConfig;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, ETAG, HeaderMap, IF_MATCH};
use reqwest::{Client, Method, RequestBuilder, Response, Url};
use secrecy::{ExposeSecret, SecretSlice};
use serde_json::Value;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::classifier::{CallCategory, classify_status};
use crate::error::{ErrorKind, RelayResult};
use crate::relay_error;
use crate::store::base::{Entity, KeyValueStore};

type HmacSha256 = Hmac<Sha256>;

const API_VERSION: &str = "2019-02-02";
const JSON_MINIMAL_METADATA: &str = "application/json;odata=minimalmetadata";
const CONTINUATION_PARTITION: &str = "x-ms-continuation-NextPartitionKey";
const CONTINUATION_ROW: &str = "x-ms-continuation-NextRowKey";

const PARTITION_KEY: &str = "PartitionKey";
const ROW_KEY: &str = "RowKey";
const TIMESTAMP: &str = "Timestamp";
const ODATA_ETAG: &str = "odata.etag";

/// Signs `SharedKeyLite` authorization headers for one storage account.
#[derive(Clone)]
pub struct SharedKeySigner {
    account_name: String,
    key: Arc<SecretSlice<u8>>,
}

impl SharedKeySigner {
    pub fn new(account_name: impl Into<String>, base64_key: &str) -> RelayResult<Self> {
        let key = BASE64_STANDARD.decode(base64_key.trim())?;

        Ok(Self {
            account_name: account_name.into(),
            key: Arc::new(key.into()),
        })
    }

    /// Builds the `Authorization` header value for a request to `canonical_path`.
    ///
    /// `canonical_path` is the URL-encoded path of the request without the leading slash.
    pub fn authorization(&self, date: &str, canonical_path: &str) -> RelayResult<String> {
        let string_to_sign = format!("{date}\n/{}/{canonical_path}", self.account_name);

        let mut mac = HmacSha256::new_from_slice(self.key.expose_secret()).map_err(|err| {
            relay_error!(
                ErrorKind::MalformedCredential,
                "Shared key cannot be used for signing",
                err
            )
        })?;
        mac.update(string_to_sign.as_bytes());
        let signature = BASE64_STANDARD.encode(mac.finalize().into_bytes());

        Ok(format!("SharedKeyLite {}:{signature}", self.account_name))
    }
}

/// [`KeyValueStore`] backed by the table service REST API.
#[derive(Clone)]
pub struct TableServiceClient {
    client: Client,
    endpoint: Url,
    signer: SharedKeySigner,
}

impl TableServiceClient {
    pub fn new(config: &StoreConfig) -> RelayResult<Self> {
        let signer = SharedKeySigner::new(&config.account_name, config.account_key.expose_secret())?;

        let endpoint = Url::parse(&format!("{}/", config.endpoint())).map_err(|err| {
            relay_error!(ErrorKind::ConfigError, "Invalid table service endpoint", err)
        })?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|err| relay_error!(ErrorKind::ConfigError, "Failed to build HTTP client", err))?;

        Ok(Self {
            client,
            endpoint,
            signer,
        })
    }

    fn url(&self, path: &str) -> RelayResult<Url> {
        self.endpoint.join(path).map_err(|err| {
            relay_error!(ErrorKind::InvalidState, "Invalid table service path", err)
        })
    }

    fn request(&self, method: Method, url: Url) -> RelayResult<RequestBuilder> {
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let canonical_path = url.path().trim_start_matches('/').to_owned();
        let authorization = self.signer.authorization(&date, &canonical_path)?;

        Ok(self
            .client
            .request(method, url)
            .header("x-ms-date", date)
            .header("x-ms-version", API_VERSION)
            .header("DataServiceVersion", "3.0;NetFx")
            .header("MaxDataServiceVersion", "3.0;NetFx")
            .header(ACCEPT, JSON_MINIMAL_METADATA)
            .header(AUTHORIZATION, authorization))
    }

    async fn send(&self, request: RequestBuilder, operation: &'static str) -> RelayResult<Response> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let kind = classify_status(status, &body, CallCategory::Store);
        debug!(operation, %status, ?kind, "table service request rejected");

        Err(relay_error!(
            kind,
            "Table service request failed",
            format!("{operation} returned {status}: {body}")
        ))
    }

    async fn write_entity(
        &self,
        table: &str,
        entity: Entity,
        if_match: Option<String>,
        operation: &'static str,
    ) -> RelayResult<Entity> {
        let url = self.url(&entity_path(table, &entity.partition_key, &entity.row_key))?;
        let mut request = self
            .request(Method::PUT, url)?
            .header(CONTENT_TYPE, "application/json")
            .json(&entity_body(&entity));
        if let Some(etag) = if_match {
            request = request.header(IF_MATCH, etag);
        }

        let response = self.send(request, operation).await?;
        let etag = etag_header(response.headers());

        Ok(entity.with_etag(etag))
    }
}

impl KeyValueStore for TableServiceClient {
    async fn create_table(&self, table: &str) -> RelayResult<()> {
        let request = self
            .request(Method::POST, self.url("Tables")?)?
            .header(CONTENT_TYPE, "application/json")
            .header("Prefer", "return-no-content")
            .json(&serde_json::json!({ "TableName": table }));

        self.send(request, "create_table").await?;

        Ok(())
    }

    async fn insert_entity(&self, table: &str, entity: Entity) -> RelayResult<Entity> {
        let request = self
            .request(Method::POST, self.url(&escape_segment(table))?)?
            .header(CONTENT_TYPE, "application/json")
            .header("Prefer", "return-no-content")
            .json(&entity_body(&entity));

        let response = self.send(request, "insert_entity").await?;
        let etag = etag_header(response.headers());

        Ok(entity.with_etag(etag))
    }

    async fn upsert_entity(&self, table: &str, entity: Entity) -> RelayResult<Entity> {
        self.write_entity(table, entity, None, "upsert_entity").await
    }

    async fn update_entity(&self, table: &str, entity: Entity) -> RelayResult<Entity> {
        let if_match = entity.etag.clone().unwrap_or_else(|| "*".to_owned());
        self.write_entity(table, entity, Some(if_match), "update_entity")
            .await
    }

    async fn get_entity(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> RelayResult<Entity> {
        let url = self.url(&entity_path(table, partition_key, row_key))?;
        let response = self
            .send(self.request(Method::GET, url)?, "get_entity")
            .await?;

        let header_etag = etag_header(response.headers());
        let body: Value = response.json().await?;
        let mut entity = entity_from_json(body)?;
        if entity.etag.is_none() {
            entity.etag = header_etag;
        }

        Ok(entity)
    }

    async fn query_partition(&self, table: &str, partition_key: &str) -> RelayResult<Vec<Entity>> {
        let filter = format!("PartitionKey eq '{}'", partition_key.replace('\'', "''"));
        let mut entities = Vec::new();
        let mut continuation: Option<(String, String)> = None;

        loop {
            let mut url = self.url(&format!("{}()", escape_segment(table)))?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("$filter", &filter);
                if let Some((next_partition, next_row)) = &continuation {
                    query.append_pair("NextPartitionKey", next_partition);
                    query.append_pair("NextRowKey", next_row);
                }
            }

            let response = self
                .send(self.request(Method::GET, url)?, "query_partition")
                .await?;
            continuation = continuation_token(response.headers());

            let body: QueryResponse = response.json().await?;
            for value in body.value {
                entities.push(entity_from_json(value)?);
            }

            if continuation.is_none() {
                return Ok(entities);
            }
        }
    }
}

#[derive(serde::Deserialize)]
struct QueryResponse {
    #[serde(default)]
    value: Vec<Value>,
}

fn escape_segment(segment: &str) -> String {
    segment
        .chars()
        .map(|c| match c {
            '/' | '?' | '#' | '%' | ' ' => format!("%{:02X}", c as u32),
            c => c.to_string(),
        })
        .collect()
}

fn entity_path(table: &str, partition_key: &str, row_key: &str) -> String {
    let key = |value: &str| escape_segment(&value.replace('\'', "''"));
    format!(
        "{}(PartitionKey='{}',RowKey='{}')",
        escape_segment(table),
        key(partition_key),
        key(row_key)
    )
}

fn entity_body(entity: &Entity) -> Value {
    let mut body = entity.properties.clone();
    body.insert(PARTITION_KEY.to_owned(), entity.partition_key.clone().into());
    body.insert(ROW_KEY.to_owned(), entity.row_key.clone().into());
    Value::Object(body)
}

fn entity_from_json(value: Value) -> RelayResult<Entity> {
    let Value::Object(mut properties) = value else {
        return Err(relay_error!(
            ErrorKind::DeserializationError,
            "Table service returned a non-object entity"
        ));
    };

    let mut take_string = |name: &str| match properties.remove(name) {
        Some(Value::String(value)) => Ok(value),
        _ => Err(relay_error!(
            ErrorKind::DeserializationError,
            "Entity is missing a key",
            name
        )),
    };
    let partition_key = take_string(PARTITION_KEY)?;
    let row_key = take_string(ROW_KEY)?;

    let etag = match properties.remove(ODATA_ETAG) {
        Some(Value::String(etag)) => Some(etag),
        _ => None,
    };
    properties.remove(TIMESTAMP);
    properties.retain(|name, _| !name.starts_with("odata.") && !name.ends_with("@odata.type"));

    Ok(Entity {
        partition_key,
        row_key,
        etag,
        properties,
    })
}

fn etag_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(ETAG)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

fn continuation_token(headers: &HeaderMap) -> Option<(String, String)> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
    };

    header(CONTINUATION_PARTITION)
        .map(|partition| (partition, header(CONTINUATION_ROW).unwrap_or_default()))
}
