//! Authenticated raw-SQL / named-view client for the remote DDO protocol endpoint.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};
use vmsync_core::Credentials;

pub const QUERY_PROTOCOL: &str = "GETQUERY";
pub const VIEW_PROTOCOL: &str = "GETVIEWDATA";
pub const DATASET_PROTOCOL: &str = "DATASET";
pub const ERROR_PROTOCOL: &str = "ERROR";

/// SQL longer than this is cut before it reaches logs or error messages.
pub const SQL_LOG_LIMIT: usize = 500;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote rejected credentials for user `{user_id}`")]
    Authentication { user_id: String },
    #[error("remote connectivity failure: {message}")]
    Connectivity {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },
    #[error("remote query failed: {message} [sql: {sql}]")]
    RemoteQuery { message: String, sql: String },
    #[error("remote request failed after {attempts} attempts")]
    ExhaustedRetries {
        attempts: usize,
        #[source]
        last: Box<RemoteError>,
    },
    #[error("unexpected http status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },
    #[error("malformed remote response: {0}")]
    MalformedResponse(String),
    #[error("no remote credentials available: {0}")]
    Credentials(String),
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connectivity { .. })
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }
}

/// Cuts `sql` to [`SQL_LOG_LIMIT`] characters on a char boundary.
pub fn truncate_sql(sql: &str) -> String {
    match sql.char_indices().nth(SQL_LOG_LIMIT) {
        Some((idx, _)) => format!("{}...", &sql[..idx]),
        None => sql.to_string(),
    }
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
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
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

/// Source of remote credential sets, with success/failure signalling so a
/// refresh collaborator can rotate a failing set.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get_credentials(&self, user_id: Option<&str>) -> Result<Credentials, RemoteError>;
    async fn mark_success(&self, user_id: &str);
    async fn mark_failed(&self, user_id: &str);
}

/// Fixed credential sets with an in-process health flag per user.
#[derive(Debug, Default)]
pub struct StaticCredentialProvider {
    sets: Vec<Credentials>,
    health: Mutex<HashMap<String, bool>>,
}

impl StaticCredentialProvider {
    pub fn new(sets: Vec<Credentials>) -> Self {
        Self {
            sets,
            health: Mutex::new(HashMap::new()),
        }
    }

    pub fn single(username: impl Into<String>, password: impl Into<String>) -> Self {
        let username = username.into();
        Self::new(vec![Credentials {
            user_id: username.clone(),
            username,
            password: password.into(),
        }])
    }

    /// `None` until the set has been used at least once.
    pub fn is_healthy(&self, user_id: &str) -> Option<bool> {
        self.health
            .lock()
            .ok()
            .and_then(|health| health.get(user_id).copied())
    }

    fn set_health(&self, user_id: &str, healthy: bool) {
        if let Ok(mut health) = self.health.lock() {
            health.insert(user_id.to_string(), healthy);
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn get_credentials(&self, user_id: Option<&str>) -> Result<Credentials, RemoteError> {
        if let Some(user_id) = user_id {
            return self
                .sets
                .iter()
                .find(|c| c.user_id == user_id)
                .cloned()
                .ok_or_else(|| RemoteError::Credentials(format!("unknown user `{user_id}`")));
        }

        self.sets
            .iter()
            .find(|c| self.is_healthy(&c.user_id) != Some(false))
            .or_else(|| self.sets.first())
            .cloned()
            .ok_or_else(|| RemoteError::Credentials("no credential sets configured".to_string()))
    }

    async fn mark_success(&self, user_id: &str) {
        self.set_health(user_id, true);
    }

    async fn mark_failed(&self, user_id: &str) {
        self.set_health(user_id, false);
    }
}

/// The `Heading` / `Data` table carried inside a `DATASET` response.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DataTable {
    #[serde(rename = "Heading", default)]
    pub heading: Vec<String>,
    #[serde(rename = "Data", default)]
    pub data: Vec<Vec<JsonValue>>,
}

impl DataTable {
    pub fn new(heading: Vec<String>, data: Vec<Vec<JsonValue>>) -> Self {
        Self { heading, data }
    }

    /// Lenient decode: missing or mistyped parts become empty rather than errors.
    pub fn from_value(value: &JsonValue) -> Self {
        let heading = field_ci(value, "Heading")
            .and_then(JsonValue::as_array)
            .map(|items| {
                items
                    .iter()
                    .map(|h| match h {
                        JsonValue::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let data = field_ci(value, "Data")
            .and_then(JsonValue::as_array)
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| row.as_array().cloned())
                    .collect()
            })
            .unwrap_or_default();
        Self { heading, data }
    }

    pub fn is_empty(&self) -> bool {
        self.heading.is_empty() || self.data.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResponse {
    pub protocol: String,
    pub data_set: DataTable,
}

impl RemoteResponse {
    /// Interprets a decoded response body, turning the error shape into [`RemoteError::RemoteQuery`].
    pub fn from_body(body: &JsonValue, sql: &str) -> Result<Self, RemoteError> {
        if !body.is_object() {
            return Err(RemoteError::MalformedResponse(
                "response body is not a JSON object".to_string(),
            ));
        }

        let protocol = field_ci(body, "Protocol")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string();
        let error_message = field_ci(body, "errorMessage").and_then(JsonValue::as_str);

        if protocol.eq_ignore_ascii_case(ERROR_PROTOCOL) || error_message.is_some() {
            return Err(RemoteError::RemoteQuery {
                message: error_message.unwrap_or("unspecified remote error").to_string(),
                sql: truncate_sql(sql),
            });
        }

        let data_set = field_ci(body, "DataSet")
            .map(DataTable::from_value)
            .unwrap_or_default();
        Ok(Self { protocol, data_set })
    }
}

fn field_ci<'a>(value: &'a JsonValue, name: &str) -> Option<&'a JsonValue> {
    let object = value.as_object()?;
    object.get(name).or_else(|| {
        object
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    })
}

/// Filter applied to a named-view request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewFilter {
    #[serde(rename = "FilterName")]
    pub name: String,
    #[serde(rename = "FilterValue")]
    pub value: String,
    #[serde(rename = "PersistFilter")]
    pub persist: bool,
}

impl ViewFilter {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            persist: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RemoteClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for RemoteClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/DDOProtocol".to_string(),
            timeout: Duration::from_secs(60),
            user_agent: None,
            max_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

pub struct RemoteQueryClient {
    client: reqwest::Client,
    base_url: String,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
    credentials: Arc<dyn CredentialProvider>,
}

impl std::fmt::Debug for RemoteQueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteQueryClient")
            .field("base_url", &self.base_url)
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl RemoteQueryClient {
    pub fn new(
        config: RemoteClientConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> anyhow::Result<Self> {
        use anyhow::Context;

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            limit: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            backoff: config.backoff,
            credentials,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn credential_provider(&self) -> &Arc<dyn CredentialProvider> {
        &self.credentials
    }

    fn endpoint(&self, protocol: &str) -> String {
        format!("{}/{}", self.base_url, protocol)
    }

    /// Runs raw SQL with explicit credentials.
    pub async fn execute(
        &self,
        sql: &str,
        credentials: &Credentials,
    ) -> Result<RemoteResponse, RemoteError> {
        let body = json!({
            "Protocol": QUERY_PROTOCOL,
            "SQL": sql,
        });
        self.send_with_retry(QUERY_PROTOCOL, &body, sql, credentials)
            .await
    }

    /// Fetches rows from a named view definition.
    pub async fn execute_view(
        &self,
        view_guid: &str,
        filter: &ViewFilter,
        credentials: &Credentials,
    ) -> Result<RemoteResponse, RemoteError> {
        let body = json!({
            "Protocol": VIEW_PROTOCOL,
            "ViewDefinitionGuid": view_guid,
            "ViewFilter": filter,
            "ResultFormat": "DDOTable",
        });
        let label = format!("view {view_guid} where {} = {}", filter.name, filter.value);
        self.send_with_retry(VIEW_PROTOCOL, &body, &label, credentials)
            .await
    }

    /// Runs raw SQL with credentials obtained from the provider.
    pub async fn query(
        &self,
        sql: &str,
        user_id: Option<&str>,
    ) -> Result<RemoteResponse, RemoteError> {
        let credentials = self.credentials.get_credentials(user_id).await?;
        self.execute(sql, &credentials).await
    }

    /// Plain GET against the base path; anything below 500 counts as up.
    pub async fn health_check(&self) -> bool {
        match self.client.get(&self.base_url).send().await {
            Ok(resp) => !resp.status().is_server_error(),
            Err(err) => {
                warn!(base_url = %self.base_url, error = %err, "remote health check failed");
                false
            }
        }
    }

    async fn send_with_retry(
        &self,
        protocol: &'static str,
        body: &JsonValue,
        sql: &str,
        credentials: &Credentials,
    ) -> Result<RemoteResponse, RemoteError> {
        let _permit = self
            .limit
            .acquire()
            .await
            .map_err(|_| RemoteError::Connectivity {
                message: "remote client is shutting down".to_string(),
                source: None,
            })?;

        let span = info_span!("remote_query", protocol, user_id = %credentials.user_id);
        async move {
            let url = self.endpoint(protocol);
            let attempts = self.backoff.max_retries + 1;
            let mut last_error = None;

            for attempt in 0..attempts {
                match self.send_once(&url, body, sql, credentials).await {
                    Ok(response) => {
                        self.credentials.mark_success(&credentials.user_id).await;
                        debug!(attempt = attempt + 1, rows = response.data_set.data.len(), "remote query succeeded");
                        return Ok(response);
                    }
                    Err(err @ RemoteError::Authentication { .. }) => {
                        self.credentials.mark_failed(&credentials.user_id).await;
                        warn!(attempt = attempt + 1, sql = %truncate_sql(sql), "remote authentication failed");
                        return Err(err);
                    }
                    Err(err) if err.is_retryable() => {
                        warn!(
                            attempt = attempt + 1,
                            max_retries = self.backoff.max_retries,
                            sql = %truncate_sql(sql),
                            error = %err,
                            "remote request failed"
                        );
                        last_error = Some(err);
                        if attempt + 1 < attempts {
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        }
                    }
                    Err(err) => {
                        warn!(
                            attempt = attempt + 1,
                            sql = %truncate_sql(sql),
                            error = %err,
                            "remote request failed without retry"
                        );
                        return Err(err);
                    }
                }
            }

            let last = last_error.unwrap_or_else(|| RemoteError::Connectivity {
                message: "no attempt was made".to_string(),
                source: None,
            });
            Err(RemoteError::ExhaustedRetries {
                attempts,
                last: Box::new(last),
            })
        }
        .instrument(span)
        .await
    }

    async fn send_once(
        &self,
        url: &str,
        body: &JsonValue,
        sql: &str,
        credentials: &Credentials,
    ) -> Result<RemoteResponse, RemoteError> {
        let resp = self
            .client
            .post(url)
            .basic_auth(&credentials.username, Some(&credentials.password))
            .json(body)
            .send()
            .await
            .map_err(request_error)?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(RemoteError::Authentication {
                user_id: credentials.user_id.clone(),
            });
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(match classify_status(status) {
                RetryDisposition::Retryable => RemoteError::Connectivity {
                    message: format!("http status {status}"),
                    source: None,
                },
                RetryDisposition::NonRetryable => RemoteError::UnexpectedStatus {
                    status: status.as_u16(),
                    body: truncate_sql(&text),
                },
            });
        }

        let text = resp.text().await.map_err(request_error)?;
        let value: JsonValue = serde_json::from_str(&text).map_err(|err| {
            RemoteError::MalformedResponse(format!("{err} ({} bytes)", text.len()))
        })?;
        RemoteResponse::from_body(&value, sql)
    }
}

fn request_error(err: reqwest::Error) -> RemoteError {
    match classify_reqwest_error(&err) {
        RetryDisposition::Retryable => RemoteError::Connectivity {
            message: err.to_string(),
            source: Some(err),
        },
        RetryDisposition::NonRetryable => RemoteError::MalformedResponse(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_config(base_url: String, max_retries: usize) -> RemoteClientConfig {
        RemoteClientConfig {
            base_url,
            timeout: Duration::from_secs(5),
            user_agent: None,
            max_concurrency: 2,
            backoff: BackoffPolicy {
                max_retries,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
        }
    }

    fn client_for(server: &MockServer, max_retries: usize) -> (RemoteQueryClient, Arc<StaticCredentialProvider>) {
        let provider = Arc::new(StaticCredentialProvider::single("svc-sync", "secret"));
        let client = RemoteQueryClient::new(
            fast_config(format!("{}/DDOProtocol", server.uri()), max_retries),
            provider.clone(),
        )
        .expect("client");
        (client, provider)
    }

    fn dataset_body() -> JsonValue {
        json!({
            "Protocol": "DATASET",
            "DataSet": {
                "Heading": ["SS_WO", "SS_EXT"],
                "Data": [["2026-0001", "@"], ["2026-0002", "A"]]
            }
        })
    }

    #[test]
    fn backoff_doubles_from_one_second_and_caps_at_thirty() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(16));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(30));
    }

    #[test]
    fn truncate_sql_respects_limit_and_char_boundaries() {
        let long = "é".repeat(SQL_LOG_LIMIT + 20);
        let cut = truncate_sql(&long);
        assert!(cut.ends_with("..."));
        assert_eq!(cut.chars().count(), SQL_LOG_LIMIT + 3);
        assert_eq!(truncate_sql("SELECT 1"), "SELECT 1");
    }

    #[test]
    fn error_payload_maps_to_remote_query_error() {
        let body = json!({"protocol": "ERROR", "errorMessage": "Invalid column name 'FOO'"});
        let err = RemoteResponse::from_body(&body, "SELECT FOO FROM VEGUNIT").unwrap_err();
        match err {
            RemoteError::RemoteQuery { message, sql } => {
                assert_eq!(message, "Invalid column name 'FOO'");
                assert_eq!(sql, "SELECT FOO FROM VEGUNIT");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn execute_posts_raw_sql_with_basic_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/DDOProtocol/GETQUERY"))
            .and(header_exists("authorization"))
            .and(body_partial_json(json!({"Protocol": "GETQUERY", "SQL": "SELECT 1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(dataset_body()))
            .expect(1)
            .mount(&server)
            .await;

        let (client, provider) = client_for(&server, 2);
        let response = client.query("SELECT 1", None).await.expect("query");

        assert_eq!(response.protocol, "DATASET");
        assert_eq!(response.data_set.heading, vec!["SS_WO", "SS_EXT"]);
        assert_eq!(response.data_set.data.len(), 2);
        assert_eq!(provider.is_healthy("svc-sync"), Some(true));
    }

    #[tokio::test]
    async fn unauthorized_fails_immediately_and_marks_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/DDOProtocol/GETQUERY"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let (client, provider) = client_for(&server, 3);
        let err = client.query("SELECT 1", None).await.unwrap_err();

        assert!(err.is_authentication());
        assert_eq!(provider.is_healthy("svc-sync"), Some(false));
    }

    #[tokio::test]
    async fn error_payload_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/DDOProtocol/GETQUERY"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"protocol": "ERROR", "errorMessage": "syntax error"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let (client, _provider) = client_for(&server, 3);
        let err = client.query("SELEC 1", None).await.unwrap_err();
        assert!(matches!(err, RemoteError::RemoteQuery { .. }));
    }

    #[tokio::test]
    async fn transient_server_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/DDOProtocol/GETQUERY"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/DDOProtocol/GETQUERY"))
            .respond_with(ResponseTemplate::new(200).set_body_json(dataset_body()))
            .expect(1)
            .mount(&server)
            .await;

        let (client, _provider) = client_for(&server, 3);
        let response = client.query("SELECT 1", None).await.expect("recovers");
        assert_eq!(response.data_set.data.len(), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_preserve_last_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/DDOProtocol/GETQUERY"))
            .respond_with(ResponseTemplate::new(502))
            .expect(3)
            .mount(&server)
            .await;

        let (client, _provider) = client_for(&server, 2);
        let err = client.query("SELECT 1", None).await.unwrap_err();
        match err {
            RemoteError::ExhaustedRetries { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(last.is_retryable());
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn named_view_request_uses_view_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/DDOProtocol/GETVIEWDATA"))
            .and(body_partial_json(json!({
                "Protocol": "GETVIEWDATA",
                "ViewDefinitionGuid": "{VIEW-1}",
                "ViewFilter": {"FilterName": "WO", "FilterValue": "2026-0001"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(dataset_body()))
            .expect(1)
            .mount(&server)
            .await;

        let (client, provider) = client_for(&server, 0);
        let creds = provider.get_credentials(None).await.expect("creds");
        let response = client
            .execute_view("{VIEW-1}", &ViewFilter::new("WO", "2026-0001"), &creds)
            .await
            .expect("view");
        assert_eq!(response.data_set.data.len(), 2);
    }

    #[tokio::test]
    async fn health_check_accepts_any_non_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/DDOProtocol"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let (client, _provider) = client_for(&server, 0);
        assert!(client.health_check().await);

        let down = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&down)
            .await;
        let (client, _provider) = client_for(&down, 0);
        assert!(!client.health_check().await);
    }

    #[tokio::test]
    async fn static_provider_prefers_healthy_sets() {
        let provider = StaticCredentialProvider::new(vec![
            Credentials {
                username: "a".into(),
                password: "pa".into(),
                user_id: "a".into(),
            },
            Credentials {
                username: "b".into(),
                password: "pb".into(),
                user_id: "b".into(),
            },
        ]);
        provider.mark_failed("a").await;
        let chosen = provider.get_credentials(None).await.expect("creds");
        assert_eq!(chosen.user_id, "b");
        assert!(provider.get_credentials(Some("zzz")).await.is_err());
    }

    #[derive(Clone, Default)]
    struct ArrivalLog(Arc<Mutex<Vec<std::time::Instant>>>);

    impl wiremock::Respond for ArrivalLog {
        fn respond(&self, _request: &wiremock::Request) -> ResponseTemplate {
            self.0
                .lock()
                .expect("arrival log")
                .push(std::time::Instant::now());
            ResponseTemplate::new(200)
                .set_body_json(dataset_body())
                .set_delay(Duration::from_millis(200))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn in_flight_requests_never_exceed_the_limit() {
        let server = MockServer::start().await;
        let arrivals = ArrivalLog::default();
        Mock::given(method("POST"))
            .and(path("/DDOProtocol/GETQUERY"))
            .respond_with(arrivals.clone())
            .expect(6)
            .mount(&server)
            .await;

        // fast_config allows two requests in flight
        let (client, _) = client_for(&server, 0);
        let client = Arc::new(client);
        let started = std::time::Instant::now();
        let mut calls = tokio::task::JoinSet::new();
        for i in 0..6 {
            let client = client.clone();
            calls.spawn(async move { client.query(&format!("SELECT {i}"), None).await });
        }
        while let Some(result) = calls.join_next().await {
            result.expect("join").expect("query");
        }

        // Three waves of two 200ms responses.
        assert!(started.elapsed() >= Duration::from_millis(600));
        let mut seen = arrivals.0.lock().expect("arrival log").clone();
        seen.sort();
        assert_eq!(seen.len(), 6);
        // A third request can only start once one of the two before it has finished.
        for window in seen.windows(3) {
            assert!(window[2] - window[0] >= Duration::from_millis(190));
        }
    }
}
