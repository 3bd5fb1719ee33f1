//! Hosted search index client for CRIS.
//!
//! The external index holds a denormalized projection of the catalog, keyed
//! by SKU as `objectID`. Writes use the service's merge-semantics partial
//! updates, so re-running any sync is safe; the batcher chunks updates at a
//! single configurable size and applies one failure policy for the whole
//! run.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use cris_core::pricing::parse_money;
use cris_core::CatalogRecord;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "cris-index";

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("index returned status {status} for {path}: {body}")]
    Http {
        status: u16,
        path: String,
        body: String,
    },
    #[error("encoding index payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("batch chunk {chunk} rejected: {source}")]
    ChunkFailed {
        chunk: usize,
        #[source]
        source: Box<IndexError>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// What to do when a batch chunk is rejected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    AbortOnFirstError,
    /// Keep pushing the remaining chunks and report failures at the end.
    /// Partial progress is still progress: partial updates merge, so the
    /// failed chunks can simply be re-run.
    #[default]
    ContinueAndReport,
}

#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub app_id: String,
    pub admin_api_key: String,
    pub search_api_key: String,
    pub index_name: String,
    pub timeout: Duration,
    pub chunk_size: usize,
    pub chunk_delay: Duration,
    pub failure_policy: FailurePolicy,
    pub backoff: BackoffPolicy,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            admin_api_key: String::new(),
            search_api_key: String::new(),
            index_name: "products".to_string(),
            timeout: Duration::from_secs(20),
            chunk_size: 100,
            chunk_delay: Duration::from_millis(100),
            failure_policy: FailurePolicy::default(),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Merge-semantics update for one index document.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialUpdate {
    pub object_id: String,
    pub fields: JsonMap<String, JsonValue>,
}

impl PartialUpdate {
    pub fn new(object_id: impl Into<String>) -> Self {
        Self {
            object_id: object_id.into(),
            fields: JsonMap::new(),
        }
    }

    pub fn set(mut self, field: impl Into<String>, value: JsonValue) -> Self {
        self.fields.insert(field.into(), value);
        self
    }

    fn into_body(self) -> JsonValue {
        let mut body = self.fields;
        body.insert("objectID".to_string(), JsonValue::String(self.object_id));
        JsonValue::Object(body)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierPricing {
    pub bronze: f64,
    pub gold: f64,
    pub platinum: f64,
}

/// Full denormalized projection of a catalog record, as the index sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDocument {
    #[serde(rename = "objectID")]
    pub object_id: String,
    pub name: String,
    pub description: Option<String>,
    pub sku: String,
    pub manufacturer_name: Option<String>,
    pub category_name: Option<String>,
    pub department_number: Option<String>,
    pub tier_pricing: TierPricing,
    pub in_stock: bool,
    pub quantity: i64,
    pub caliber: Option<String>,
    pub capacity: Option<i32>,
    pub receiver_type: Option<String>,
}

impl IndexDocument {
    pub fn from_record(record: &CatalogRecord) -> Self {
        let tier = |price: &Option<String>| {
            price.as_deref().and_then(parse_money).unwrap_or(0.0)
        };
        Self {
            object_id: record.sku.clone(),
            name: record.name.clone(),
            description: record.description.clone(),
            sku: record.sku.clone(),
            manufacturer_name: record.manufacturer.clone(),
            category_name: record.category.clone(),
            department_number: record.department_number.clone(),
            tier_pricing: TierPricing {
                bronze: tier(&record.price_bronze),
                gold: tier(&record.price_gold),
                platinum: tier(&record.price_platinum),
            },
            in_stock: record.in_stock,
            quantity: i64::from(record.stock_quantity.unwrap_or(0)),
            caliber: record.caliber.clone(),
            capacity: record.capacity,
            receiver_type: record.receiver_type.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchQuery {
    pub query: String,
    pub filters: Option<String>,
    pub facets: Vec<String>,
    pub hits_per_page: u32,
    pub page: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub nb_hits: i64,
    #[serde(default)]
    pub facets: BTreeMap<String, BTreeMap<String, i64>>,
    #[serde(default)]
    pub hits: Vec<JsonValue>,
}

/// Faceting and ranking configuration for the hosted index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSettings {
    #[serde(default)]
    pub searchable_attributes: Vec<String>,
    #[serde(default)]
    pub attributes_for_faceting: Vec<String>,
    #[serde(default)]
    pub custom_ranking: Vec<String>,
}

/// Accounting for one batched push.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    pub chunks_sent: usize,
    pub chunks_failed: usize,
    pub records_sent: usize,
    pub records_failed: usize,
    pub errors: Vec<String>,
}

impl SyncReport {
    pub fn succeeded(&self) -> bool {
        self.chunks_failed == 0
    }
}

/// Transport seam between the client and the wire, so the batching and
/// policy logic is testable without a network.
#[async_trait]
pub trait IndexTransport: Send + Sync {
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&JsonValue>,
    ) -> Result<JsonValue, IndexError>;
}

/// Real transport: keys in headers, application id in the hostname, retries
/// with capped exponential backoff on transient failures.
#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    host: String,
    app_id: String,
    api_key: String,
    backoff: BackoffPolicy,
}

impl HttpTransport {
    pub fn new(config: &IndexConfig) -> Result<Self, IndexError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            host: format!("https://{}-dsn.algolia.net", config.app_id),
            app_id: config.app_id.clone(),
            api_key: config.admin_api_key.clone(),
            backoff: config.backoff,
        })
    }
}

#[async_trait]
impl IndexTransport for HttpTransport {
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&JsonValue>,
    ) -> Result<JsonValue, IndexError> {
        debug!(%method, path, "sending index request");

        let url = format!("{}{}", self.host, path);
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let mut request = self
                .client
                .request(method.clone(), &url)
                .header("X-Algolia-API-Key", &self.api_key)
                .header("X-Algolia-Application-Id", &self.app_id);
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.json().await?);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    let body = response.text().await.unwrap_or_default();
                    return Err(IndexError::Http {
                        status: status.as_u16(),
                        path: path.to_string(),
                        body,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(IndexError::Request(err));
                }
            }
        }

        Err(IndexError::Request(
            last_request_error.expect("retry loop captures a request error"),
        ))
    }
}

pub struct IndexClient {
    transport: Box<dyn IndexTransport>,
    config: IndexConfig,
}

impl IndexClient {
    pub fn new(config: IndexConfig) -> Result<Self, IndexError> {
        let transport = HttpTransport::new(&config)?;
        Ok(Self {
            transport: Box::new(transport),
            config,
        })
    }

    pub fn with_transport(config: IndexConfig, transport: Box<dyn IndexTransport>) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    fn index_path(&self, suffix: &str) -> String {
        format!("/1/indexes/{}{}", self.config.index_name, suffix)
    }

    /// Push merge-semantics updates in chunks of the configured size.
    pub async fn push_partial_updates(
        &self,
        updates: Vec<PartialUpdate>,
    ) -> Result<SyncReport, IndexError> {
        let bodies = updates
            .into_iter()
            .map(PartialUpdate::into_body)
            .collect::<Vec<_>>();
        self.push_batches("partialUpdateObject", bodies).await
    }

    /// Push full documents (replace semantics) in chunks.
    pub async fn push_documents(
        &self,
        documents: &[IndexDocument],
    ) -> Result<SyncReport, IndexError> {
        let bodies = documents
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        self.push_batches("addObject", bodies).await
    }

    async fn push_batches(
        &self,
        action: &str,
        bodies: Vec<JsonValue>,
    ) -> Result<SyncReport, IndexError> {
        let mut report = SyncReport::default();
        let chunk_size = self.config.chunk_size.max(1);
        let chunk_count = bodies.len().div_ceil(chunk_size);
        let path = self.index_path("/batch");

        for (chunk_index, chunk) in bodies.chunks(chunk_size).enumerate() {
            let payload = json!({
                "requests": chunk
                    .iter()
                    .map(|body| json!({ "action": action, "body": body }))
                    .collect::<Vec<_>>(),
            });

            match self
                .transport
                .send(Method::POST, &path, Some(&payload))
                .await
            {
                Ok(_) => {
                    report.chunks_sent += 1;
                    report.records_sent += chunk.len();
                }
                Err(err) => match self.config.failure_policy {
                    FailurePolicy::AbortOnFirstError => {
                        return Err(IndexError::ChunkFailed {
                            chunk: chunk_index,
                            source: Box::new(err),
                        });
                    }
                    FailurePolicy::ContinueAndReport => {
                        warn!(chunk = chunk_index, error = %err, "batch chunk rejected");
                        report.chunks_failed += 1;
                        report.records_failed += chunk.len();
                        report.errors.push(err.to_string());
                    }
                },
            }

            let is_last = chunk_index + 1 == chunk_count;
            if !is_last && !self.config.chunk_delay.is_zero() {
                tokio::time::sleep(self.config.chunk_delay).await;
            }
        }

        Ok(report)
    }

    pub async fn query(&self, query: &SearchQuery) -> Result<SearchResponse, IndexError> {
        let payload = json!({
            "query": query.query,
            "filters": query.filters.clone().unwrap_or_default(),
            "facets": query.facets,
            "hitsPerPage": query.hits_per_page,
            "page": query.page,
        });
        let value = self
            .transport
            .send(Method::POST, &self.index_path("/query"), Some(&payload))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Number of index records matching `filters` (all records when `None`).
    pub async fn count(&self, filters: Option<&str>) -> Result<i64, IndexError> {
        let response = self
            .query(&SearchQuery {
                filters: filters.map(str::to_string),
                ..SearchQuery::default()
            })
            .await?;
        Ok(response.nb_hits)
    }

    pub async fn get_settings(&self) -> Result<IndexSettings, IndexError> {
        let value = self
            .transport
            .send(Method::GET, &self.index_path("/settings"), None)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn set_settings(&self, settings: &IndexSettings) -> Result<(), IndexError> {
        let payload = serde_json::to_value(settings)?;
        self.transport
            .send(Method::PUT, &self.index_path("/settings"), Some(&payload))
            .await?;
        Ok(())
    }

    pub async fn get_object(&self, object_id: &str) -> Result<JsonValue, IndexError> {
        self.transport
            .send(Method::GET, &self.index_path(&format!("/{object_id}")), None)
            .await
    }

    /// Merge-update a single document.
    pub async fn partial_update_object(&self, update: PartialUpdate) -> Result<(), IndexError> {
        let path = self.index_path(&format!("/{}/partial", update.object_id));
        let body = JsonValue::Object(update.fields);
        self.transport.send(Method::POST, &path, Some(&body)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    type CallLog = Arc<Mutex<Vec<(String, JsonValue)>>>;

    #[derive(Default)]
    struct RecordingTransport {
        calls: CallLog,
        fail_on: Vec<usize>,
    }

    impl RecordingTransport {
        fn failing_on(fail_on: Vec<usize>) -> Self {
            Self {
                calls: CallLog::default(),
                fail_on,
            }
        }
    }

    fn request_counts(calls: &CallLog) -> Vec<usize> {
        calls
            .lock()
            .expect("lock")
            .iter()
            .map(|(_, payload)| payload["requests"].as_array().map(Vec::len).unwrap_or(0))
            .collect()
    }

    #[async_trait]
    impl IndexTransport for RecordingTransport {
        async fn send(
            &self,
            _method: Method,
            path: &str,
            body: Option<&JsonValue>,
        ) -> Result<JsonValue, IndexError> {
            let mut calls = self.calls.lock().expect("lock");
            let call_index = calls.len();
            calls.push((path.to_string(), body.cloned().unwrap_or(JsonValue::Null)));
            if self.fail_on.contains(&call_index) {
                return Err(IndexError::Http {
                    status: 500,
                    path: path.to_string(),
                    body: "server melted".to_string(),
                });
            }
            Ok(json!({ "taskID": 1 }))
        }
    }

    fn updates(n: usize) -> Vec<PartialUpdate> {
        (0..n)
            .map(|i| PartialUpdate::new(format!("SKU{i}")).set("departmentNumber", json!("01")))
            .collect()
    }

    fn client_with(transport: RecordingTransport, policy: FailurePolicy) -> (IndexClient, CallLog) {
        let calls = transport.calls.clone();
        let config = IndexConfig {
            chunk_size: 100,
            chunk_delay: Duration::ZERO,
            failure_policy: policy,
            ..IndexConfig::default()
        };
        (IndexClient::with_transport(config, Box::new(transport)), calls)
    }

    #[tokio::test]
    async fn chunking_splits_250_updates_into_3_calls() {
        let (client, calls) = client_with(
            RecordingTransport::default(),
            FailurePolicy::ContinueAndReport,
        );
        let report = client.push_partial_updates(updates(250)).await.expect("push");
        assert_eq!(report.chunks_sent, 3);
        assert_eq!(report.records_sent, 250);
        assert_eq!(request_counts(&calls), vec![100, 100, 50]);
    }

    #[tokio::test]
    async fn continue_policy_reports_failures_and_keeps_going() {
        let (client, calls) = client_with(
            RecordingTransport::failing_on(vec![0]),
            FailurePolicy::ContinueAndReport,
        );
        let report = client.push_partial_updates(updates(250)).await.expect("push");
        assert_eq!(report.chunks_sent, 2);
        assert_eq!(report.chunks_failed, 1);
        assert_eq!(report.records_failed, 100);
        assert_eq!(report.errors.len(), 1);
        assert!(!report.succeeded());
        assert_eq!(request_counts(&calls).len(), 3);
    }

    #[tokio::test]
    async fn abort_policy_stops_at_first_failure() {
        let (client, calls) = client_with(
            RecordingTransport::failing_on(vec![0]),
            FailurePolicy::AbortOnFirstError,
        );
        let err = client
            .push_partial_updates(updates(250))
            .await
            .expect_err("abort");
        assert!(matches!(err, IndexError::ChunkFailed { chunk: 0, .. }));
        assert_eq!(request_counts(&calls).len(), 1);
    }

    #[tokio::test]
    async fn partial_update_bodies_carry_object_id() {
        let (client, calls) = client_with(
            RecordingTransport::default(),
            FailurePolicy::ContinueAndReport,
        );
        let update = PartialUpdate::new("MFG456")
            .set("categoryName", json!("Uppers/Lowers"))
            .set("receiverType", json!("Upper"));
        client.push_partial_updates(vec![update]).await.expect("push");

        let calls = calls.lock().expect("lock");
        let (path, payload) = &calls[0];
        assert_eq!(path, "/1/indexes/products/batch");
        let request = &payload["requests"][0];
        assert_eq!(request["action"], "partialUpdateObject");
        assert_eq!(request["body"]["objectID"], "MFG456");
        assert_eq!(request["body"]["receiverType"], "Upper");
    }

    #[test]
    fn index_document_serializes_camel_case_with_object_id() {
        let record = CatalogRecord {
            id: 7,
            sku: "MFG456".into(),
            name: "GLOCK 19 GEN5 9MM 15RD".into(),
            description: None,
            category: Some("Handguns".into()),
            department_number: Some("01".into()),
            manufacturer: Some("Glock Inc".into()),
            rsr_stock_number: Some("RSR123".into()),
            manufacturer_part_number: Some("MFG456".into()),
            price_wholesale: Some("430.00".into()),
            price_map: Some("499.00".into()),
            price_msrp: Some("599.00".into()),
            price_bronze: Some("599.00".into()),
            price_gold: Some("499.00".into()),
            price_platinum: Some("438.60".into()),
            caliber: Some("9mm".into()),
            capacity: Some(15),
            barrel_length: None,
            receiver_type: None,
            requires_ffl: true,
            in_stock: true,
            stock_quantity: Some(12),
            updated_at: None,
        };
        let value = serde_json::to_value(IndexDocument::from_record(&record)).expect("encode");
        assert_eq!(value["objectID"], "MFG456");
        assert_eq!(value["categoryName"], "Handguns");
        assert_eq!(value["departmentNumber"], "01");
        assert_eq!(value["tierPricing"]["gold"], 499.0);
        assert_eq!(value["inStock"], true);
        assert!(value.get("object_id").is_none());
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn status_classification_matches_retry_policy() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST),
            RetryDisposition::NonRetryable
        );
    }
}
