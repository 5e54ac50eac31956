//! HTTP transport to the collector
//!
//! One call carries a whole [`Batch`]:
//!
//! ```text
//! POST <api_server>/api/v1/events/<app_id>
//! Authorization: <api_write_key>
//! Content-Type: application/json
//!
//! {"load": [{"a": 1, "keen": {"timestamp": "..."}}], ...}
//! ```
//!
//! Any 2xx is an acknowledgement. A [`TransportError`] without a status
//! means the request never reached the server; with a status, the
//! server answered and refused.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};

use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::queue::Batch;

/// Successful delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// HTTP status the collector answered with
    pub status: u16,
    /// Number of events in the delivered batch
    pub events: usize,
}

/// Failed delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    /// Response status, absent when no response was received
    pub status: Option<u16>,
    /// Error detail (connection error or response body)
    pub message: String,
}

impl TransportError {
    /// The request never reached the server (DNS, refused, timeout)
    pub fn unreached(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    /// The server answered with a non-success status
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn is_unreached(&self) -> bool {
        self.status.is_none()
    }

    pub fn is_rejected(&self) -> bool {
        self.status.is_some()
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "collector responded with {}: {}", status, self.message),
            None => write!(f, "collector unreachable: {}", self.message),
        }
    }
}

impl std::error::Error for TransportError {}

/// Batch submission to a collector
pub trait Transport: Send + Sync {
    /// Submit a batch in a single call
    fn send(&self, batch: &Batch) -> impl Future<Output = SendResult> + Send;
}

/// Outcome of one [`Transport::send`]
pub type SendResult = std::result::Result<Ack, TransportError>;

impl<T: Transport> Transport for Arc<T> {
    fn send(&self, batch: &Batch) -> impl Future<Output = SendResult> + Send {
        (**self).send(batch)
    }
}

/// HTTP client for the collector events API
pub struct HttpTransport {
    http_client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    /// Create a transport from the application identity
    ///
    /// Returns a configuration error if the app id or write key is
    /// missing, or the key is not a valid header value.
    pub fn new(app: &AppConfig, timeout: Duration) -> Result<Self> {
        app.validate()?;

        let app_id = app.require_app_id()?;
        let endpoint = events_endpoint(&app.api_server, app_id);

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(write_key) = &app.api_write_key {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(write_key)
                    .map_err(|e| Error::Config(format!("invalid api_write_key: {}", e)))?,
            );
        }

        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            endpoint,
        })
    }

    /// Full URL events are posted to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Transport for HttpTransport {
    async fn send(&self, batch: &Batch) -> SendResult {
        let response = self
            .http_client
            .post(&self.endpoint)
            .json(batch)
            .send()
            .await
            .map_err(|e| TransportError::unreached(format!("HTTP request failed: {}", e)))?;

        let status = response.status();

        if status.is_success() {
            Ok(Ack {
                status: status.as_u16(),
                events: batch.len(),
            })
        } else {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            Err(TransportError::rejected(status.as_u16(), error_text))
        }
    }
}

/// `<api_server>/api/v1/events/<app_id>`
fn events_endpoint(api_server: &str, app_id: &str) -> String {
    format!(
        "{}/api/v1/events/{}",
        api_server.trim_end_matches('/'),
        urlencoding::encode(app_id)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Event;
    use axum::extract::{Path, State};
    use axum::http::{HeaderMap as AxumHeaders, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Map, Value};
    use std::sync::Mutex;

    #[derive(Clone)]
    struct Collector {
        status: StatusCode,
        received: Arc<Mutex<Vec<(String, Option<String>, Value)>>>,
    }

    async fn record(
        State(collector): State<Collector>,
        Path(app_id): Path<String>,
        headers: AxumHeaders,
        Json(body): Json<Value>,
    ) -> StatusCode {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        collector.received.lock().unwrap().push((app_id, auth, body));
        collector.status
    }

    async fn spawn_collector(status: StatusCode) -> (String, Collector) {
        let collector = Collector {
            status,
            received: Arc::new(Mutex::new(Vec::new())),
        };
        let app = Router::new()
            .route("/api/v1/events/{app_id}", post(record))
            .with_state(collector.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), collector)
    }

    fn app_config(server: &str) -> AppConfig {
        AppConfig {
            app_id: Some("app 1".to_string()),
            api_write_key: Some("wk_test".to_string()),
            api_server: server.to_string(),
        }
    }

    fn batch() -> Batch {
        let mut batch = Batch::new();
        for a in [1, 2] {
            let mut payload = Map::new();
            payload.insert("a".to_string(), json!(a));
            batch.push("load", Event::new(payload));
        }
        batch
    }

    #[test]
    fn test_transport_requires_credentials() {
        assert!(HttpTransport::new(&AppConfig::default(), Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_endpoint_encodes_app_id() {
        let transport =
            HttpTransport::new(&app_config("https://collector.example.com/"), Duration::from_secs(1))
                .unwrap();
        assert_eq!(
            transport.endpoint(),
            "https://collector.example.com/api/v1/events/app%201"
        );
    }

    #[test]
    fn test_error_classification() {
        let unreached = TransportError::unreached("connection refused");
        assert!(unreached.is_unreached());
        assert!(!unreached.is_rejected());
        assert!(unreached.to_string().contains("unreachable"));

        let rejected = TransportError::rejected(400, "bad request");
        assert!(rejected.is_rejected());
        assert_eq!(
            rejected.to_string(),
            "collector responded with 400: bad request"
        );
    }

    #[tokio::test]
    async fn test_send_posts_batch_with_write_key() {
        let (server, collector) = spawn_collector(StatusCode::OK).await;
        let transport = HttpTransport::new(&app_config(&server), Duration::from_secs(5)).unwrap();
        let batch = batch();

        let ack = transport.send(&batch).await.unwrap();

        assert_eq!(ack, Ack { status: 200, events: 2 });
        let received = collector.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        let (app_id, auth, body) = &received[0];
        assert_eq!(app_id, "app 1");
        assert_eq!(auth.as_deref(), Some("wk_test"));
        assert_eq!(body, &serde_json::to_value(&batch).unwrap());
        assert_eq!(body["load"][1]["a"], json!(2));
        assert!(body["load"][0]["keen"]["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_non_success_status_is_rejection() {
        let (server, _collector) = spawn_collector(StatusCode::SERVICE_UNAVAILABLE).await;
        let transport = HttpTransport::new(&app_config(&server), Duration::from_secs(5)).unwrap();

        let err = transport.send(&batch()).await.unwrap_err();

        assert_eq!(err.status, Some(503));
    }

    #[tokio::test]
    async fn test_connection_failure_has_no_status() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport =
            HttpTransport::new(&app_config(&format!("http://{addr}")), Duration::from_secs(5))
                .unwrap();
        let err = transport.send(&batch()).await.unwrap_err();

        assert!(err.is_unreached());
    }
}
