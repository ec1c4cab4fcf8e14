//! HTTP intake for tracers.

use std::time::Duration;

use axum::{routing::post, Router};
use basenji_error::{ErrorContext as _, GenericError};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::pipeline::PipelineInputs;

mod handlers;
use self::handlers::*;

/// Shared state of the request handlers.
#[derive(Clone)]
pub struct ReceiverState {
    inputs: PipelineInputs,
    backpressure_timeout: Duration,
}

impl ReceiverState {
    pub fn new(inputs: PipelineInputs, backpressure_timeout: Duration) -> Self {
        Self {
            inputs,
            backpressure_timeout,
        }
    }
}

/// Builds the router serving every supported API version.
///
/// Tracers use either `POST` or `PUT`, so both are accepted.
pub fn build_router(state: ReceiverState) -> Router {
    Router::new()
        .route("/v0.1/spans", post(handle_v01_spans).put(handle_v01_spans))
        .route("/v0.2/traces", post(handle_traces).put(handle_traces))
        .route("/v0.3/traces", post(handle_traces).put(handle_traces))
        .route("/v0.4/traces", post(handle_v04_traces).put(handle_v04_traces))
        .route("/v0.1/services", post(handle_services).put(handle_services))
        .route("/v0.2/services", post(handle_services).put(handle_services))
        .route("/v0.3/services", post(handle_services).put(handle_services))
        .route("/v0.4/services", post(handle_services).put(handle_services))
        .with_state(state)
}

/// Serves `router` on `listener` until `shutdown` is triggered.
///
/// In-flight requests are completed before returning. The router, and with it the pipeline inputs it holds, is dropped
/// on return.
pub async fn serve(listener: TcpListener, router: Router, shutdown: CancellationToken) -> Result<(), GenericError> {
    let address = listener.local_addr().error_context("Failed to get listener address.")?;
    info!(%address, "Receiver listening.");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .error_context("Receiver failed.")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use basenji_components::{presampler::PreSampler, sampler::RateByService};
    use tokio::sync::mpsc;

    use super::*;
    use crate::pipeline::IncomingTrace;

    #[tokio::test]
    async fn routes_versions_and_methods() {
        let (traces_tx, mut traces_rx) = mpsc::channel::<IncomingTrace>(16);
        let (services_tx, mut services_rx) = mpsc::channel(16);
        let inputs = PipelineInputs {
            traces: traces_tx,
            services: services_tx,
            presampler: Arc::new(PreSampler::new(1.0, 100)),
            rate_by_service: RateByService::new(),
        };
        let router = build_router(ReceiverState::new(inputs, Duration::from_millis(100)));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve(listener, router, shutdown.clone()));

        let client = reqwest::Client::new();
        let trace = r#"[[{"trace_id":1,"span_id":1,"service":"web","name":"request","resource":"GET /","start":1,"duration":1}]]"#;

        let response = client
            .put(format!("{}/v0.3/traces", base))
            .body(trace)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);

        let response = client
            .post(format!("{}/v0.4/traces", base))
            .body(trace)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert!(response.text().await.unwrap().contains("rate_by_service"));

        let response = client
            .post(format!("{}/v0.2/services", base))
            .body(r#"{"web":{"app_type":"web"}}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);

        let response = client.post(format!("{}/v0.5/traces", base)).body("[]").send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

        drop(client);
        shutdown.cancel();
        server.await.unwrap().unwrap();

        assert_eq!(traces_rx.recv().await.unwrap().trace.len(), 1);
        assert_eq!(traces_rx.recv().await.unwrap().trace.len(), 1);
        assert!(services_rx.recv().await.unwrap().get("web").is_some());
    }
}
