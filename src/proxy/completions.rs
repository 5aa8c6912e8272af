// Anthropic completions handler - forwards one completion request upstream
// and derives usage metrics without touching the relayed response.
//
// The inbound body is decoded into the documented provider request shape and
// re-marshaled before forwarding, which doubles as an allow-list: fields the
// gateway does not know about are dropped, and the caller-supplied metadata
// field is cleared outright. `CompletionsStarted` fires before any upstream
// byte is sent; `CompletionsFinished` fires exactly once on every exit path
// after it, carried by a guard that survives into the detached accounting
// task so even a cancelled request gets its final event.

use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, Response, StatusCode};
use axum::response::IntoResponse;
use axum::Extension;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::actor::Actor;
use crate::events::{Event, EventDispatcher, EventName};

use super::error::GatewayError;
use super::relay;
use super::usage::{self, UNKNOWN_COMPLETION_CHARS};
use super::ProxyState;

/// Upstream path for the Anthropic completions API.
const UPSTREAM_COMPLETIONS_PATH: &str = "/v1/complete";

/// Response headers that must not be forwarded verbatim.
const SKIPPED_RESPONSE_HEADERS: &[&str] = &["connection", "keep-alive", "transfer-encoding", "upgrade"];

/// The documented Anthropic completion request shape. Deserializing into
/// this struct and re-serializing drops anything else the caller sent.
#[derive(Debug, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens_to_sample: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    /// Opaque caller metadata; always stripped before forwarding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Clear fields the caller must not control.
fn transform_request(mut request: CompletionRequest) -> CompletionRequest {
    request.metadata = None;
    request
}

/// Emits `CompletionsFinished` once, whenever it is dropped.
struct FinishGuard {
    events: EventDispatcher,
    source: String,
    identifier: String,
    model: String,
    stream: bool,
    started: Instant,
    upstream_status: Option<u16>,
    completion_characters: i64,
}

impl FinishGuard {
    fn new(events: EventDispatcher, actor: &Actor, model: &str, stream: bool) -> Self {
        Self {
            events,
            source: actor.source_name.clone(),
            identifier: actor.id.clone(),
            model: model.to_string(),
            stream,
            started: Instant::now(),
            upstream_status: None,
            completion_characters: UNKNOWN_COMPLETION_CHARS,
        }
    }

    fn set_upstream_status(&mut self, status: u16) {
        self.upstream_status = Some(status);
    }

    fn set_completion_characters(&mut self, count: i64) {
        self.completion_characters = count;
    }
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        let event = Event::new(EventName::CompletionsFinished, &self.source, &self.identifier)
            .with("model", self.model.as_str())
            .with("stream", self.stream)
            .with("upstream_latency_ms", self.started.elapsed().as_millis() as i64)
            .with(
                "upstream_status_code",
                self.upstream_status.map(i64::from).unwrap_or(0),
            )
            .with("completion_character_count", self.completion_characters);
        self.events.dispatch(event);
    }
}

/// POST /v1/completions/anthropic
pub async fn anthropic_completions(
    State(state): State<ProxyState>,
    Extension(actor): Extension<Actor>,
    body: Bytes,
) -> Response<Body> {
    let request: CompletionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return GatewayError::BadRequest(format!("invalid completion request: {err}"))
                .into_response()
        }
    };
    let request = transform_request(request);
    let payload = match serde_json::to_vec(&request) {
        Ok(payload) => payload,
        Err(err) => {
            return GatewayError::Internal(format!("could not encode upstream request: {err}"))
                .into_response()
        }
    };

    // "The call is about to start" - not an acknowledgement of success.
    state.events.dispatch(
        Event::new(EventName::CompletionsStarted, &actor.source_name, &actor.id)
            .with("provider", "anthropic")
            .with("model", request.model.as_str())
            .with("stream", request.stream)
            .with(
                "prompt_character_count",
                request.prompt.chars().count() as i64,
            ),
    );
    let mut finish = FinishGuard::new(state.events.clone(), &actor, &request.model, request.stream);

    let url = format!(
        "{}{}",
        state.upstream.api_url.trim_end_matches('/'),
        UPSTREAM_COMPLETIONS_PATH
    );
    let upstream = match state
        .client
        .post(&url)
        .header("x-api-key", &state.upstream.api_key)
        .header("anthropic-version", &state.upstream.api_version)
        .header(
            header::USER_AGENT,
            concat!("tokengate/", env!("CARGO_PKG_VERSION")),
        )
        .header(header::CONTENT_TYPE, "application/json")
        .body(payload)
        .send()
        .await
    {
        Ok(response) => response,
        Err(err) => {
            // Fail fast; the guard drop still emits the finished event.
            finish.set_upstream_status(StatusCode::INTERNAL_SERVER_ERROR.as_u16());
            return GatewayError::Upstream(format!("upstream request failed: {err}"))
                .into_response();
        }
    };

    let status = upstream.status();
    finish.set_upstream_status(status.as_u16());
    let upstream_headers = upstream.headers().clone();

    // Refresh the cached actor off the hot path; debounced by the source.
    {
        let sources = state.sources.clone();
        let actor = actor.clone();
        tokio::spawn(async move { sources.update(&actor).await });
    }

    // Fan the body out: verbatim relay to the client, capped capture for
    // accounting. Only 2xx bodies are analyzed; everything else is still
    // forwarded untouched.
    let analyze = status.is_success();
    let streaming = request.stream;
    let relayed = relay::relay_with_capture(
        upstream.bytes_stream(),
        state.upstream.capture_limit,
        move |captured| {
            if analyze {
                if captured.truncated {
                    tracing::warn!(
                        "completion body exceeded capture limit; character count unknown"
                    );
                } else {
                    finish.set_completion_characters(usage::completion_characters(
                        &captured.body,
                        streaming,
                    ));
                }
            }
            // Guard drops here: CompletionsFinished is the last event for
            // this request.
        },
    );

    // Forward the upstream status and headers unchanged.
    let mut builder = Response::builder().status(status.as_u16());
    for (key, value) in upstream_headers.iter() {
        if SKIPPED_RESPONSE_HEADERS.contains(&key.as_str()) {
            continue;
        }
        builder = builder.header(key.as_str(), value.as_bytes());
    }

    match builder.body(relayed) {
        Ok(response) => response,
        Err(err) => {
            GatewayError::Internal(format!("could not build response: {err}")).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{RateLimit, Sources};
    use crate::config::UpstreamSettings;
    use crate::events::tests::RecordingLogger;
    use axum::routing::post;
    use axum::Router;
    use chrono::Utc;
    use httpmock::prelude::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_actor() -> Actor {
        Actor {
            key: "sgs_valid".to_string(),
            id: "sub-1".to_string(),
            access_enabled: true,
            rate_limit: RateLimit::new(60, Duration::from_secs(3600)),
            last_updated: Utc::now(),
            source_name: "subscriptions".to_string(),
        }
    }

    fn test_state(api_url: String, sink: Arc<RecordingLogger>) -> ProxyState {
        ProxyState {
            client: reqwest::Client::new(),
            upstream: Arc::new(UpstreamSettings {
                api_url,
                api_key: "test-key".to_string(),
                api_version: "2023-06-01".to_string(),
                capture_limit: 1024 * 1024,
            }),
            events: EventDispatcher::new(sink, Duration::from_secs(1)),
            sources: Arc::new(Sources::new()),
        }
    }

    fn test_router(state: ProxyState) -> Router {
        Router::new()
            .route("/v1/completions/anthropic", post(anthropic_completions))
            .layer(Extension(test_actor()))
            .with_state(state)
    }

    async fn send(
        router: Router,
        body: &str,
    ) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/v1/completions/anthropic")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, headers, bytes.to_vec())
    }

    /// Wait for detached event tasks to land.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn forwards_buffered_completion_and_accounts_characters() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/complete")
                    .header("x-api-key", "test-key")
                    .header("anthropic-version", "2023-06-01");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"completion":"hello"}"#);
            })
            .await;

        let sink = RecordingLogger::new();
        let router = test_router(test_state(server.base_url(), sink.clone()));

        let (status, headers, body) = send(
            router,
            r#"{"prompt":"hi","model":"claude-2","stream":false,"metadata":{"user_id":"spoofed"}}"#,
        )
        .await;

        mock.assert_async().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["content-type"], "application/json");
        // Byte-for-byte passthrough of the upstream body.
        assert_eq!(body, br#"{"completion":"hello"}"#);

        settle().await;
        let events = sink.recorded();
        assert_eq!(events.len(), 2);

        let started = &events[0];
        assert_eq!(started.name, EventName::CompletionsStarted);
        assert_eq!(started.identifier, "sub-1");
        assert_eq!(started.metadata["prompt_character_count"], 2);
        assert_eq!(started.metadata["model"], "claude-2");
        assert_eq!(started.metadata["stream"], false);

        let finished = &events[1];
        assert_eq!(finished.name, EventName::CompletionsFinished);
        assert_eq!(finished.metadata["upstream_status_code"], 200);
        assert_eq!(finished.metadata["completion_character_count"], 5);
    }

    #[tokio::test]
    async fn strips_caller_metadata_before_forwarding() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/complete")
                    .json_body(serde_json::json!({
                        "prompt": "hi",
                        "model": "claude-2",
                        "stream": false
                    }));
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"completion":"ok"}"#);
            })
            .await;

        let sink = RecordingLogger::new();
        let router = test_router(test_state(server.base_url(), sink));

        // metadata and unknown fields are both dropped by the re-marshal.
        let (status, _, _) = send(
            router,
            r#"{"prompt":"hi","model":"claude-2","stream":false,"metadata":{"x":1},"unknown_field":true}"#,
        )
        .await;

        mock.assert_async().await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn relays_sse_stream_and_counts_last_cumulative_frame() {
        let sse_body = concat!(
            "data: {\"completion\":\"Hel\"}\n\n",
            "data: keepalive\n\n",
            "data: {\"completion\":\"Hello!\"}\n\n",
        );

        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/complete");
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body(sse_body);
            })
            .await;

        let sink = RecordingLogger::new();
        let router = test_router(test_state(server.base_url(), sink.clone()));

        let (status, headers, body) = send(
            router,
            r#"{"prompt":"hi","model":"claude-2","stream":true}"#,
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["content-type"], "text/event-stream");
        assert_eq!(body, sse_body.as_bytes());

        settle().await;
        let events = sink.recorded();
        let finished = events
            .iter()
            .find(|e| e.name == EventName::CompletionsFinished)
            .unwrap();
        assert_eq!(finished.metadata["completion_character_count"], 6);
        assert_eq!(finished.metadata["stream"], true);
    }

    #[tokio::test]
    async fn malformed_body_is_rejected_before_any_upstream_call() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/complete");
                then.status(200).body("{}");
            })
            .await;

        let sink = RecordingLogger::new();
        let router = test_router(test_state(server.base_url(), sink.clone()));

        let (status, _, body) = send(router, "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let err: Value = serde_json::from_slice(&body).unwrap();
        assert!(err["error"].as_str().unwrap().contains("invalid completion request"));

        mock.assert_hits_async(0).await;
        settle().await;
        // No started event means no finished event either.
        assert!(sink.recorded().is_empty());
    }

    #[tokio::test]
    async fn upstream_errors_are_forwarded_without_analysis() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/complete");
                then.status(529)
                    .header("content-type", "application/json")
                    .body(r#"{"error":{"type":"overloaded_error"}}"#);
            })
            .await;

        let sink = RecordingLogger::new();
        let router = test_router(test_state(server.base_url(), sink.clone()));

        let (status, _, body) = send(
            router,
            r#"{"prompt":"hi","model":"claude-2","stream":false}"#,
        )
        .await;

        // Status and body are relayed untouched.
        assert_eq!(status.as_u16(), 529);
        assert_eq!(body, br#"{"error":{"type":"overloaded_error"}}"#);

        settle().await;
        let events = sink.recorded();
        let finished = events
            .iter()
            .find(|e| e.name == EventName::CompletionsFinished)
            .unwrap();
        assert_eq!(finished.metadata["upstream_status_code"], 529);
        assert_eq!(
            finished.metadata["completion_character_count"],
            UNKNOWN_COMPLETION_CHARS
        );
    }

    #[tokio::test]
    async fn unreachable_upstream_yields_500_and_still_finishes() {
        let sink = RecordingLogger::new();
        // Nothing listens on this port.
        let router = test_router(test_state("http://127.0.0.1:9".to_string(), sink.clone()));

        let (status, _, body) = send(
            router,
            r#"{"prompt":"hi","model":"claude-2","stream":false}"#,
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let err: Value = serde_json::from_slice(&body).unwrap();
        assert!(err["error"].as_str().unwrap().contains("upstream request failed"));

        settle().await;
        let events = sink.recorded();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].name, EventName::CompletionsFinished);
        assert_eq!(events[1].metadata["upstream_status_code"], 500);
        assert_eq!(
            events[1].metadata["completion_character_count"],
            UNKNOWN_COMPLETION_CHARS
        );
    }
}
