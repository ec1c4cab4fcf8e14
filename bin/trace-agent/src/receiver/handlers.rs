use std::collections::BTreeMap;

use axum::{
    body::Bytes,
    extract::State,
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use basenji_common::collections::FastHashMap;
use basenji_components::presampler::TRACE_COUNT_HEADER;
use basenji_core::{ServicesMetadata, Span, Trace};
use basenji_error::GenericError;
use metrics::counter;
use serde::{de::DeserializeOwned, Serialize};
use tokio::{sync::mpsc::error::SendTimeoutError, time::timeout};
use tracing::debug;

use super::ReceiverState;
use crate::pipeline::IncomingTrace;

const MSGPACK_CONTENT_TYPE: &str = "application/msgpack";

// API versions that predate MessagePack payloads.
const JSON_ONLY_VERSIONS: &[&str] = &["/v0.1/", "/v0.2/"];

#[derive(Serialize)]
struct RatesResponse {
    rate_by_service: BTreeMap<String, f64>,
}

/// Encoding of a request body.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum PayloadFormat {
    Json,
    MsgPack,
}

/// Why a payload was refused.
#[derive(Debug)]
enum Rejection {
    UnsupportedMediaType,
    Decode(GenericError),
    PayloadTooLarge,
    QueueFull,
    ShuttingDown,
}

impl Rejection {
    fn reason(&self) -> &'static str {
        match self {
            Self::UnsupportedMediaType => "unsupported_media_type",
            Self::Decode(_) => "decode_error",
            Self::PayloadTooLarge => "payload_too_large",
            Self::QueueFull => "queue_full",
            Self::ShuttingDown => "shutting_down",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::Decode(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::QueueFull => StatusCode::TOO_MANY_REQUESTS,
            Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn message(&self) -> String {
        match self {
            Self::UnsupportedMediaType => format!("{} is only supported from v0.3 on\n", MSGPACK_CONTENT_TYPE),
            Self::Decode(e) => format!("unable to decode payload: {}\n", e),
            Self::PayloadTooLarge => "payload holds more traces than the intake queue, split it\n".to_string(),
            Self::QueueFull => "intake queue is full, retry later\n".to_string(),
            Self::ShuttingDown => "agent is shutting down\n".to_string(),
        }
    }
}

impl<T> From<SendTimeoutError<T>> for Rejection {
    fn from(e: SendTimeoutError<T>) -> Self {
        match e {
            SendTimeoutError::Timeout(_) => Self::QueueFull,
            SendTimeoutError::Closed(_) => Self::ShuttingDown,
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        counter!("receiver_payloads_rejected_total", "reason" => self.reason()).increment(1);
        debug!(reason = self.reason(), error = ?self, "Rejected payload.");
        (self.status(), self.message()).into_response()
    }
}

fn ok() -> Response {
    (StatusCode::OK, "OK\n").into_response()
}

/// Picks the body encoding from the `Content-Type` header.
///
/// Anything but MessagePack is decoded as JSON.
fn payload_format(uri: &Uri, headers: &HeaderMap) -> Result<PayloadFormat, Rejection> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !content_type.starts_with(MSGPACK_CONTENT_TYPE) {
        return Ok(PayloadFormat::Json);
    }

    let path = uri.path();
    if JSON_ONLY_VERSIONS.iter().any(|version| path.starts_with(version)) {
        return Err(Rejection::UnsupportedMediaType);
    }
    Ok(PayloadFormat::MsgPack)
}

fn decode<T: DeserializeOwned>(format: PayloadFormat, body: &[u8]) -> Result<T, Rejection> {
    match format {
        PayloadFormat::Json => serde_json::from_slice(body).map_err(|e| Rejection::Decode(e.into())),
        PayloadFormat::MsgPack => rmp_serde::from_slice(body).map_err(|e| Rejection::Decode(e.into())),
    }
}

fn count_payload(uri: &Uri, body: &[u8]) {
    let endpoint = uri.path().to_string();
    counter!("receiver_payloads_total", "endpoint" => endpoint.clone()).increment(1);
    counter!("receiver_bytes_total", "endpoint" => endpoint).increment(body.len() as u64);
}

/// Groups a flat list of spans into traces, keeping the order in which trace IDs first appear.
fn group_by_trace(spans: Vec<Span>) -> Vec<Trace> {
    let mut index: FastHashMap<u64, usize> = FastHashMap::default();
    let mut grouped: Vec<Vec<Span>> = Vec::new();
    for span in spans {
        let idx = *index.entry(span.trace_id()).or_insert_with(|| {
            grouped.push(Vec::new());
            grouped.len() - 1
        });
        grouped[idx].push(span);
    }
    grouped.into_iter().map(Trace::new).collect()
}

fn decode_spans(format: PayloadFormat, body: &[u8]) -> Result<Vec<Trace>, Rejection> {
    decode::<Vec<Span>>(format, body).map(group_by_trace)
}

fn decode_traces(format: PayloadFormat, body: &[u8]) -> Result<Vec<Trace>, Rejection> {
    decode(format, body)
}

/// Admits a traces payload into the pipeline.
///
/// The pre-sampler decides on the declared trace count before the body is decoded. A payload it drops is still
/// acknowledged, since the tracer cannot do anything better with it.
///
/// A payload is queued as a whole or not at all: a refused payload can be retried without duplicating traces.
async fn receive_traces(
    state: &ReceiverState, uri: &Uri, headers: &HeaderMap, body: &[u8],
    decode: fn(PayloadFormat, &[u8]) -> Result<Vec<Trace>, Rejection>,
) -> Result<(), Rejection> {
    count_payload(uri, body);
    let format = payload_format(uri, headers)?;

    let presampler = &state.inputs.presampler;
    let presampler_rate = presampler.rate();
    let declared = headers.get(TRACE_COUNT_HEADER).and_then(|value| value.to_str().ok());
    if !presampler.sample(declared) {
        return Ok(());
    }

    let traces = decode(format, body)?;
    let total = traces.len();
    counter!("receiver_traces_received_total").increment(total as u64);
    counter!("receiver_spans_received_total").increment(traces.iter().map(Trace::len).sum::<usize>() as u64);
    if total == 0 {
        return Ok(());
    }

    let queue = &state.inputs.traces;
    let reserved = if total > queue.max_capacity() {
        Err(Rejection::PayloadTooLarge)
    } else {
        match timeout(state.backpressure_timeout, queue.reserve_many(total)).await {
            Ok(Ok(permits)) => Ok(permits),
            Ok(Err(_)) => Err(Rejection::ShuttingDown),
            Err(_) => Err(Rejection::QueueFull),
        }
    };
    let permits = match reserved {
        Ok(permits) => permits,
        Err(rejection) => {
            counter!("receiver_traces_dropped_total", "reason" => rejection.reason()).increment(total as u64);
            return Err(rejection);
        }
    };

    for (permit, trace) in permits.zip(traces) {
        permit.send(IncomingTrace { trace, presampler_rate });
    }
    Ok(())
}

/// Handles a flat list of spans.
pub async fn handle_v01_spans(
    State(state): State<ReceiverState>, uri: Uri, headers: HeaderMap, body: Bytes,
) -> Response {
    match receive_traces(&state, &uri, &headers, &body, decode_spans).await {
        Ok(()) => ok(),
        Err(rejection) => rejection.into_response(),
    }
}

/// Handles a list of traces.
pub async fn handle_traces(State(state): State<ReceiverState>, uri: Uri, headers: HeaderMap, body: Bytes) -> Response {
    match receive_traces(&state, &uri, &headers, &body, decode_traces).await {
        Ok(()) => ok(),
        Err(rejection) => rejection.into_response(),
    }
}

/// Handles a list of traces, answering with the current sample rate of every service.
pub async fn handle_v04_traces(
    State(state): State<ReceiverState>, uri: Uri, headers: HeaderMap, body: Bytes,
) -> Response {
    if let Err(rejection) = receive_traces(&state, &uri, &headers, &body, decode_traces).await {
        return rejection.into_response();
    }

    let rates = state.inputs.rate_by_service.get_all();
    let response = RatesResponse {
        rate_by_service: rates.iter().map(|(key, rate)| (key.clone(), *rate)).collect(),
    };
    Json(response).into_response()
}

/// Handles service metadata.
pub async fn handle_services(
    State(state): State<ReceiverState>, uri: Uri, headers: HeaderMap, body: Bytes,
) -> Response {
    count_payload(&uri, &body);
    let metadata = match payload_format(&uri, &headers).and_then(|format| decode::<ServicesMetadata>(format, &body)) {
        Ok(metadata) => metadata,
        Err(rejection) => return rejection.into_response(),
    };

    match state
        .inputs
        .services
        .send_timeout(metadata, state.backpressure_timeout)
        .await
    {
        Ok(()) => ok(),
        Err(e) => Rejection::from(e).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use axum::http::{HeaderName, HeaderValue};
    use basenji_components::{presampler::PreSampler, sampler::RateByService};
    use tokio::sync::mpsc;

    use super::*;
    use crate::pipeline::PipelineInputs;

    struct Fixture {
        state: ReceiverState,
        traces: mpsc::Receiver<IncomingTrace>,
        services: mpsc::Receiver<ServicesMetadata>,
    }

    fn fixture(capacity: usize, presampler: PreSampler) -> Fixture {
        let (traces_tx, traces) = mpsc::channel(capacity);
        let (services_tx, services) = mpsc::channel(capacity);
        let inputs = PipelineInputs {
            traces: traces_tx,
            services: services_tx,
            presampler: Arc::new(presampler),
            rate_by_service: RateByService::new(),
        };
        Fixture {
            state: ReceiverState::new(inputs, Duration::from_millis(50)),
            traces,
            services,
        }
    }

    fn span_json(trace_id: u64, span_id: u64) -> String {
        format!(
            r#"{{"trace_id":{},"span_id":{},"service":"web","name":"request","resource":"GET /","start":1,"duration":1}}"#,
            trace_id, span_id
        )
    }

    fn traces_body(traces: &[&[(u64, u64)]]) -> Bytes {
        let traces = traces
            .iter()
            .map(|spans| {
                let spans = spans.iter().map(|(t, s)| span_json(*t, *s)).collect::<Vec<_>>();
                format!("[{}]", spans.join(","))
            })
            .collect::<Vec<_>>();
        Bytes::from(format!("[{}]", traces.join(",")))
    }

    fn uri() -> Uri {
        Uri::from_static("/v0.3/traces")
    }

    fn with_trace_count(count: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let name = HeaderName::from_bytes(TRACE_COUNT_HEADER.as_bytes()).unwrap();
        headers.insert(name, HeaderValue::from_static(count));
        headers
    }

    #[tokio::test]
    async fn traces_are_queued() {
        let mut fixture = fixture(8, PreSampler::new(1.0, 100));
        let body = traces_body(&[&[(1, 1), (1, 2)], &[(2, 3)]]);

        let response = handle_traces(State(fixture.state.clone()), uri(), HeaderMap::new(), body).await;
        assert_eq!(response.status(), StatusCode::OK);

        let first = fixture.traces.recv().await.unwrap();
        assert_eq!(first.trace.len(), 2);
        assert_eq!(first.presampler_rate, 1.0);
        assert_eq!(fixture.traces.recv().await.unwrap().trace.spans()[0].trace_id(), 2);
    }

    #[tokio::test]
    async fn flat_spans_are_grouped_by_trace() {
        let mut fixture = fixture(8, PreSampler::new(1.0, 100));
        let body = Bytes::from(format!("[{},{},{}]", span_json(5, 1), span_json(9, 2), span_json(5, 3)));

        let response = handle_v01_spans(State(fixture.state.clone()), uri(), HeaderMap::new(), body).await;
        assert_eq!(response.status(), StatusCode::OK);

        let first = fixture.traces.recv().await.unwrap().trace;
        let span_ids = first.spans().iter().map(Span::span_id).collect::<Vec<_>>();
        assert_eq!(span_ids, vec![1, 3]);
        assert_eq!(fixture.traces.recv().await.unwrap().trace.len(), 1);
    }

    fn msgpack_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(MSGPACK_CONTENT_TYPE));
        headers
    }

    fn msgpack_traces(trace_ids: &[u64]) -> Bytes {
        let traces = trace_ids
            .iter()
            .map(|id| Trace::new(vec![Span::new("web", "request", "GET /", "web", *id, *id, 0, 1, 1, 0)]))
            .collect::<Vec<_>>();
        Bytes::from(rmp_serde::to_vec_named(&traces).unwrap())
    }

    #[tokio::test]
    async fn msgpack_is_unsupported_before_v03() {
        let mut fixture = fixture(8, PreSampler::new(1.0, 100));

        let response = handle_traces(
            State(fixture.state.clone()),
            Uri::from_static("/v0.2/traces"),
            msgpack_headers(),
            msgpack_traces(&[1]),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

        let response = handle_v01_spans(
            State(fixture.state.clone()),
            Uri::from_static("/v0.1/spans"),
            msgpack_headers(),
            Bytes::from_static(b"\x90"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert!(fixture.traces.try_recv().is_err());
    }

    #[tokio::test]
    async fn msgpack_traces_are_decoded() {
        let mut fixture = fixture(8, PreSampler::new(1.0, 100));

        let body = msgpack_traces(&[3, 4]);
        let response = handle_traces(State(fixture.state.clone()), uri(), msgpack_headers(), body).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(fixture.traces.recv().await.unwrap().trace.spans()[0].trace_id(), 3);
        assert_eq!(fixture.traces.recv().await.unwrap().trace.spans()[0].trace_id(), 4);

        let response = handle_v04_traces(
            State(fixture.state.clone()),
            Uri::from_static("/v0.4/traces"),
            msgpack_headers(),
            msgpack_traces(&[5]),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(body["rate_by_service"].is_object());
        let incoming = fixture.traces.recv().await.unwrap();
        assert_eq!(incoming.trace.spans()[0].service(), "web");
        assert_eq!(incoming.trace.spans()[0].trace_id(), 5);
    }

    #[tokio::test]
    async fn malformed_msgpack_is_rejected() {
        let fixture = fixture(8, PreSampler::new(1.0, 100));
        let response = handle_traces(
            State(fixture.state.clone()),
            uri(),
            msgpack_headers(),
            Bytes::from_static(b"\x91\xc1"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn msgpack_services_are_decoded() {
        let mut fixture = fixture(8, PreSampler::new(1.0, 100));
        let mut metadata = ServicesMetadata::default();
        metadata.insert("web", "app_type", "web");
        let body = Bytes::from(rmp_serde::to_vec_named(&metadata).unwrap());

        let response = handle_services(
            State(fixture.state.clone()),
            Uri::from_static("/v0.3/services"),
            msgpack_headers(),
            body,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let received = fixture.services.recv().await.unwrap();
        assert_eq!(received.get("web").and_then(|m| m.get("app_type")).map(String::as_str), Some("web"));
    }

    #[tokio::test]
    async fn malformed_payloads_are_rejected() {
        let fixture = fixture(8, PreSampler::new(1.0, 100));
        let response = handle_traces(State(fixture.state.clone()), uri(), HeaderMap::new(), Bytes::from_static(b"[{")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = handle_services(
            State(fixture.state.clone()),
            uri(),
            HeaderMap::new(),
            Bytes::from_static(b"[]"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn presampled_payloads_are_acknowledged_but_dropped() {
        let mut fixture = fixture(8, PreSampler::new(0.5, 100));
        let body = traces_body(&[&[(1, 1)]]);

        let response = handle_traces(State(fixture.state.clone()), uri(), with_trace_count("10"), body.clone()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let admitted = fixture.traces.recv().await.unwrap();
        assert_eq!(admitted.presampler_rate, 0.5);

        // 10 of 10 declared traces kept so far, above the 0.5 target.
        let response = handle_traces(State(fixture.state.clone()), uri(), with_trace_count("10"), body).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(fixture.traces.try_recv().is_err());
        assert_eq!(fixture.state.inputs.presampler.stats().traces_dropped, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_refuses_the_whole_payload() {
        let mut fixture = fixture(2, PreSampler::new(1.0, 100));

        let body = traces_body(&[&[(1, 1)]]);
        let response = handle_traces(State(fixture.state.clone()), uri(), HeaderMap::new(), body).await;
        assert_eq!(response.status(), StatusCode::OK);

        // One slot left for two traces: nothing from the second payload may be queued.
        let body = traces_body(&[&[(2, 2)], &[(3, 3)]]);
        let response = handle_traces(State(fixture.state.clone()), uri(), HeaderMap::new(), body).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        assert_eq!(fixture.traces.recv().await.unwrap().trace.spans()[0].trace_id(), 1);
        assert!(fixture.traces.try_recv().is_err());
    }

    #[tokio::test]
    async fn payload_larger_than_queue_is_refused() {
        let mut fixture = fixture(1, PreSampler::new(1.0, 100));
        let body = traces_body(&[&[(1, 1)], &[(2, 2)]]);

        let response = handle_traces(State(fixture.state.clone()), uri(), HeaderMap::new(), body).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(fixture.traces.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_pipeline_answers_unavailable() {
        let Fixture { state, traces, .. } = fixture(1, PreSampler::new(1.0, 100));
        drop(traces);

        let response = handle_traces(State(state), uri(), HeaderMap::new(), traces_body(&[&[(1, 1)]])).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn v04_answers_with_rates() {
        let fixture = fixture(8, PreSampler::new(1.0, 100));
        let mut rates = FastHashMap::default();
        rates.insert("service:web,env:prod".to_string(), 0.25);
        fixture.state.inputs.rate_by_service.set_all(rates);

        let response = handle_v04_traces(
            State(fixture.state.clone()),
            Uri::from_static("/v0.4/traces"),
            HeaderMap::new(),
            traces_body(&[&[(1, 1)]]),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["rate_by_service"]["service:web,env:prod"], 0.25);
    }

    #[tokio::test]
    async fn services_are_forwarded() {
        let mut fixture = fixture(8, PreSampler::new(1.0, 100));
        let body = Bytes::from_static(br#"{"web":{"app_type":"web","app":"django"}}"#);

        let response = handle_services(
            State(fixture.state.clone()),
            Uri::from_static("/v0.3/services"),
            HeaderMap::new(),
            body,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let metadata = fixture.services.recv().await.unwrap();
        assert_eq!(metadata.get("web").and_then(|m| m.get("app")).map(String::as_str), Some("django"));
    }
}
