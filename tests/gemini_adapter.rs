use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Path, RawQuery, State},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use bytes::Bytes;
use chat_bridge::config::{AskMode, OutputFormat};
use chat_bridge::provider::{GeminiClient, GeminiConfig, GenerationProvider, ProviderError};
use chat_bridge::{build_app, AppState};
use futures_util::stream::{self, StreamExt};
use http::{Method, Request};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

const HELLO: &str = r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hello"},{"text":" world"}]},"finishReason":"STOP"}]}"#;

const HELLO_SSE: &str = concat!(
    "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hello\"}]}}]}\r\n\r\n",
    "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\" world\"}]},\"finishReason\":\"STOP\"}]}\r\n\r\n",
);

#[derive(Debug, Clone)]
struct Seen {
    target: String,
    query: Option<String>,
    api_key: Option<String>,
    body: Value,
}

struct MockGemini {
    status: StatusCode,
    generate_body: &'static str,
    stream_body: &'static str,
    delay: Option<Duration>,
    /// Send the first stream line, then hold the body open without data.
    stall_stream: bool,
    seen: Mutex<Vec<Seen>>,
}

impl MockGemini {
    fn new(status: StatusCode, generate_body: &'static str, stream_body: &'static str) -> Self {
        Self {
            status,
            generate_body,
            stream_body,
            delay: None,
            stall_stream: false,
            seen: Mutex::new(Vec::new()),
        }
    }

    fn replying(
        status: StatusCode,
        generate_body: &'static str,
        stream_body: &'static str,
    ) -> Arc<Self> {
        Arc::new(Self::new(status, generate_body, stream_body))
    }
}

async fn model_action(
    State(mock): State<Arc<MockGemini>>,
    Path(target): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    mock.seen.lock().unwrap().push(Seen {
        target: target.clone(),
        query: query.clone(),
        api_key: headers
            .get("x-goog-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body,
    });

    if let Some(delay) = mock.delay {
        tokio::time::sleep(delay).await;
    }

    if target.ends_with(":streamGenerateContent") {
        // Without alt=sse the real API answers with a JSON array, not events.
        if query.as_deref() != Some("alt=sse") {
            return (StatusCode::BAD_REQUEST, "expected alt=sse").into_response();
        }
        if mock.stall_stream {
            let first = mock.stream_body.lines().next().unwrap_or_default();
            let body = stream::once(async move {
                Ok::<_, Infallible>(Bytes::from(format!("{first}\n\n")))
            })
            .chain(stream::pending());
            return (
                mock.status,
                [(CONTENT_TYPE, "text/event-stream")],
                Body::from_stream(body),
            )
                .into_response();
        }
        (mock.status, [(CONTENT_TYPE, "text/event-stream")], mock.stream_body).into_response()
    } else {
        (mock.status, [(CONTENT_TYPE, "application/json")], mock.generate_body).into_response()
    }
}

async fn spawn_mock_gemini(mock: Arc<MockGemini>) -> String {
    let app = Router::new()
        .route("/v1beta/models/{target}", post(model_action))
        .with_state(mock);
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{}/v1beta", addr)
}

fn client(base_url: String, timeout: Duration) -> GeminiClient {
    GeminiClient::new(GeminiConfig {
        api_key: "test-key".to_string(),
        model: "gemini-test".to_string(),
        base_url,
        timeout,
    })
    .unwrap()
}

#[tokio::test]
async fn generate_returns_candidate_text_and_raw_payload() {
    let mock = MockGemini::replying(StatusCode::OK, HELLO, "");
    let base_url = spawn_mock_gemini(mock.clone()).await;

    let generation = client(base_url, Duration::from_secs(5))
        .generate("Say hello")
        .await
        .unwrap();

    assert_eq!(generation.text.as_deref(), Some("Hello world"));
    assert_eq!(generation.raw["candidates"][0]["finishReason"], "STOP");

    let seen = mock.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].target, "gemini-test:generateContent");
    assert_eq!(seen[0].api_key.as_deref(), Some("test-key"));
    assert_eq!(seen[0].body["contents"][0]["parts"][0]["text"], "Say hello");
}

#[tokio::test]
async fn generate_maps_error_status() {
    let mock = MockGemini::replying(
        StatusCode::FORBIDDEN,
        r#"{"error":{"message":"API key not valid"}}"#,
        "",
    );
    let base_url = spawn_mock_gemini(mock).await;

    let err = client(base_url, Duration::from_secs(5))
        .generate("hi")
        .await
        .unwrap_err();

    match err {
        ProviderError::Status { status, body } => {
            assert_eq!(status, 403);
            assert!(body.contains("API key not valid"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn generate_maps_blocked_prompt() {
    let mock = MockGemini::replying(
        StatusCode::OK,
        r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#,
        "",
    );
    let base_url = spawn_mock_gemini(mock).await;

    let err = client(base_url, Duration::from_secs(5))
        .generate("hi")
        .await
        .unwrap_err();

    assert!(matches!(err, ProviderError::Blocked(reason) if reason == "SAFETY"));
}

#[tokio::test]
async fn generate_times_out() {
    let mock = Arc::new(MockGemini {
        delay: Some(Duration::from_secs(2)),
        ..MockGemini::new(StatusCode::OK, HELLO, "")
    });
    let base_url = spawn_mock_gemini(mock).await;

    let err = client(base_url, Duration::from_millis(100))
        .generate("hi")
        .await
        .unwrap_err();

    assert!(matches!(err, ProviderError::Timeout));
}

#[tokio::test]
async fn generate_stream_yields_sse_fragments() {
    let mock = MockGemini::replying(StatusCode::OK, "", HELLO_SSE);
    let base_url = spawn_mock_gemini(mock.clone()).await;

    let fragments: Vec<String> = client(base_url, Duration::from_secs(5))
        .generate_stream("Say hello")
        .await
        .unwrap()
        .map(|item| item.unwrap())
        .collect()
        .await;

    assert_eq!(fragments, vec!["Hello", " world"]);
    let seen = mock.seen.lock().unwrap().clone();
    assert_eq!(seen[0].target, "gemini-test:streamGenerateContent");
    assert_eq!(seen[0].query.as_deref(), Some("alt=sse"));
}

#[tokio::test]
async fn generate_stream_times_out_waiting_for_headers() {
    let mock = Arc::new(MockGemini {
        delay: Some(Duration::from_secs(2)),
        ..MockGemini::new(StatusCode::OK, "", HELLO_SSE)
    });
    let base_url = spawn_mock_gemini(mock).await;

    let result = client(base_url, Duration::from_millis(100))
        .generate_stream("hi")
        .await;

    assert!(matches!(result, Err(ProviderError::Timeout)));
}

#[tokio::test]
async fn generate_stream_fails_when_body_stalls() {
    let mock = Arc::new(MockGemini {
        stall_stream: true,
        ..MockGemini::new(StatusCode::OK, "", HELLO_SSE)
    });
    let base_url = spawn_mock_gemini(mock).await;

    let fragments = client(base_url, Duration::from_millis(300))
        .generate_stream("hi")
        .await
        .unwrap();
    let items = tokio::time::timeout(Duration::from_secs(5), fragments.collect::<Vec<_>>())
        .await
        .expect("stalled body was never cut off");

    assert_eq!(items.len(), 2);
    assert_eq!(items[0].as_deref().unwrap(), "Hello");
    assert!(matches!(items[1], Err(ProviderError::Stream(_))));
}

#[tokio::test]
async fn generate_stream_rejects_error_status_before_streaming() {
    let mock = MockGemini::replying(StatusCode::TOO_MANY_REQUESTS, "", "quota exhausted");
    let base_url = spawn_mock_gemini(mock).await;

    let result = client(base_url, Duration::from_secs(5))
        .generate_stream("hi")
        .await;

    assert!(matches!(
        result,
        Err(ProviderError::Status { status: 429, .. })
    ));
}

#[tokio::test]
async fn ask_streams_gemini_reply_end_to_end() {
    let mock = MockGemini::replying(StatusCode::OK, HELLO, HELLO_SSE);
    let base_url = spawn_mock_gemini(mock.clone()).await;
    let provider = Arc::new(client(base_url, Duration::from_secs(5)));

    for (mode, expected) in [
        (AskMode::Stream, "Hello world"),
        (AskMode::Atomic, r#"{"response":"Hello world"}"#),
    ] {
        let app = build_app(AppState::new(provider.clone(), mode, OutputFormat::Json));
        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/ask")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"message":"Say hello"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], expected.as_bytes());
    }

    assert_eq!(mock.seen.lock().unwrap().len(), 2);
}
