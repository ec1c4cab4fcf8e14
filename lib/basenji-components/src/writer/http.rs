use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable as _};
use basenji_error::{ErrorContext as _, GenericError};
use reqwest::{header::CONTENT_TYPE, Client, StatusCode};
use tracing::{debug, warn};
use url::Url;

use super::{PayloadKind, PayloadWriter, WriteError};

const DEFAULT_MIN_BACKOFF: Duration = Duration::from_millis(500);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Writes payloads to the intake over HTTP.
///
/// Server errors, timeouts and connection failures are retried with exponential backoff. Client errors drop the
/// payload right away.
#[derive(Clone, Debug)]
pub struct HttpPayloadWriter {
    client: Client,
    endpoint: Url,
    api_key: String,
    min_backoff: Duration,
    max_backoff: Duration,
    max_retries: usize,
}

impl HttpPayloadWriter {
    /// Creates a new `HttpPayloadWriter` posting to `endpoint`.
    ///
    /// A zero `timeout` disables the per-attempt timeout.
    ///
    /// # Errors
    ///
    /// If `endpoint` is not a valid URL, or the HTTP client cannot be built, an error is returned.
    pub fn new(endpoint: &str, api_key: &str, timeout: Duration, max_retries: usize) -> Result<Self, GenericError> {
        let endpoint = Url::parse(endpoint).with_error_context(|| format!("Invalid intake endpoint '{}'.", endpoint))?;

        let mut builder = Client::builder();
        if !timeout.is_zero() {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().error_context("Failed to build HTTP client.")?;

        Ok(Self {
            client,
            endpoint,
            api_key: api_key.to_string(),
            min_backoff: DEFAULT_MIN_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            max_retries,
        })
    }

    /// Overrides the bounds of the retry backoff.
    pub fn with_backoff(mut self, min_delay: Duration, max_delay: Duration) -> Self {
        self.min_backoff = min_delay;
        self.max_backoff = max_delay;
        self
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_backoff)
            .with_max_delay(self.max_backoff)
            .with_max_times(self.max_retries)
    }

    fn url(&self, kind: PayloadKind) -> Url {
        let mut url = self.endpoint.clone();
        url.set_path(kind.path());
        url.query_pairs_mut().clear().append_pair("api_key", &self.api_key);
        url
    }

    async fn send_once(&self, kind: PayloadKind, body: &[u8]) -> Result<(), WriteError> {
        let response = self
            .client
            .post(self.url(kind))
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| WriteError::Transient { reason: e.to_string() })?;

        let status = response.status();
        if status.is_success() {
            debug!(kind = kind.as_str(), %status, bytes = body.len(), "Payload accepted.");
            return Ok(());
        }
        if status.is_client_error() && status != StatusCode::REQUEST_TIMEOUT {
            return Err(WriteError::Permanent { status: status.as_u16() });
        }
        Err(WriteError::Transient {
            reason: format!("intake answered {}", status),
        })
    }
}

#[async_trait]
impl PayloadWriter for HttpPayloadWriter {
    async fn write(&self, kind: PayloadKind, body: Vec<u8>) -> Result<(), WriteError> {
        (|| self.send_once(kind, &body))
            .retry(self.backoff())
            .when(WriteError::is_transient)
            .notify(|e, delay| {
                warn!(kind = kind.as_str(), error = %e, "Failed to submit payload. Retrying in {:?}...", delay);
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    use axum::{
        extract::{RawQuery, State},
        http::StatusCode as AxumStatus,
        routing::post,
        Router,
    };

    use super::*;

    #[derive(Clone, Default)]
    struct Intake {
        statuses: Arc<Mutex<VecDeque<u16>>>,
        received: Arc<Mutex<Vec<(String, String)>>>,
    }

    async fn handle(State(intake): State<Intake>, RawQuery(query): RawQuery, body: String) -> AxumStatus {
        intake.received.lock().unwrap().push((query.unwrap_or_default(), body));
        let status = intake.statuses.lock().unwrap().pop_front().unwrap_or(200);
        AxumStatus::from_u16(status).unwrap()
    }

    async fn serve(statuses: &[u16]) -> (String, Intake) {
        let intake = Intake::default();
        intake.statuses.lock().unwrap().extend(statuses.iter().copied());

        let app = Router::new()
            .route("/api/v0.2/traces", post(handle))
            .with_state(intake.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        (format!("http://{}", addr), intake)
    }

    fn writer(endpoint: &str, max_retries: usize) -> HttpPayloadWriter {
        HttpPayloadWriter::new(endpoint, "secret", Duration::from_secs(5), max_retries)
            .unwrap()
            .with_backoff(Duration::from_millis(1), Duration::from_millis(5))
    }

    #[test]
    fn url_carries_api_key() {
        let writer = writer("https://intake.example.com/ignored?x=1", 0);
        assert_eq!(
            writer.url(PayloadKind::Stats).as_str(),
            "https://intake.example.com/api/v0.2/stats?api_key=secret"
        );
        assert!(HttpPayloadWriter::new("not a url", "", Duration::ZERO, 0).is_err());
    }

    #[tokio::test]
    async fn posts_json_with_api_key() {
        let (endpoint, intake) = serve(&[]).await;
        writer(&endpoint, 0)
            .write(PayloadKind::Traces, br#"{"traces":[]}"#.to_vec())
            .await
            .unwrap();

        let received = intake.received.lock().unwrap().clone();
        assert_eq!(received, vec![("api_key=secret".to_string(), r#"{"traces":[]}"#.to_string())]);
    }

    #[tokio::test]
    async fn server_errors_are_retried() {
        let (endpoint, intake) = serve(&[503, 500]).await;
        writer(&endpoint, 3)
            .write(PayloadKind::Traces, b"{}".to_vec())
            .await
            .unwrap();
        assert_eq!(intake.received.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn retry_budget_is_bounded() {
        let (endpoint, intake) = serve(&[500, 500, 500, 500]).await;
        let err = writer(&endpoint, 2)
            .write(PayloadKind::Traces, b"{}".to_vec())
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(intake.received.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let (endpoint, intake) = serve(&[403]).await;
        let err = writer(&endpoint, 3)
            .write(PayloadKind::Traces, b"{}".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, WriteError::Permanent { status: 403 }));
        assert_eq!(intake.received.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unreachable_intake_is_transient() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let err = writer(&endpoint, 0)
            .write(PayloadKind::Stats, b"{}".to_vec())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
