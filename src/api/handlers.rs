use std::convert::Infallible;

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::config::{AskMode, OutputFormat};
use crate::provider::{FragmentStream, GenerationProvider, ProviderError};
use crate::AppState;

use super::models::{AskRequest, AskResponse, ErrorResponse, HealthResponse};

/// Prefix of the final fragment emitted when the provider fails mid-stream.
pub const STREAM_ERROR_PREFIX: &str = "\n[stream error] ";

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
const PREVIEW_CHARS: usize = 80;

pub async fn root() -> &'static str {
    "service running"
}

pub async fn health(State(state): State<AppState>) -> Response {
    match &state.provider {
        Some(provider) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                configured: true,
                model: Some(provider.model().to_string()),
            }),
        )
            .into_response(),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(HealthResponse {
                status: "unconfigured",
                configured: false,
                model: None,
            }),
        )
            .into_response(),
    }
}

pub async fn preflight() -> StatusCode {
    StatusCode::OK
}

pub async fn ask(
    State(state): State<AppState>,
    payload: Result<Json<AskRequest>, JsonRejection>,
) -> Response {
    let message = match validate(payload) {
        Ok(message) => message,
        Err(reason) => {
            debug!(%reason, "rejecting ask request");
            return error_response(StatusCode::BAD_REQUEST, reason);
        }
    };

    let Some(provider) = state.provider.as_deref() else {
        warn!("ask received but no generation provider is configured");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "generation provider is not configured".to_string(),
        );
    };

    info!(
        chars = message.chars().count(),
        preview = %preview(&message),
        mode = ?state.mode,
        "ask received"
    );

    match state.mode {
        AskMode::Atomic => ask_atomic(provider, &message, state.output).await,
        AskMode::Stream => ask_stream(provider, &message).await,
    }
}

pub async fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "route not found".to_string())
}

fn validate(payload: Result<Json<AskRequest>, JsonRejection>) -> Result<String, String> {
    let Json(request) =
        payload.map_err(|rejection| format!("invalid request body: {}", rejection.body_text()))?;

    match request.message {
        Some(message) if !message.trim().is_empty() => Ok(message),
        _ => Err("Field \"message\" must be a non-empty string".to_string()),
    }
}

async fn ask_atomic(
    provider: &dyn GenerationProvider,
    message: &str,
    output: OutputFormat,
) -> Response {
    let generation = match provider.generate(message).await {
        Ok(generation) => generation,
        Err(err) => return provider_failure(err),
    };

    let Some(text) = generation.non_empty_text() else {
        return empty_response();
    };
    info!(chars = text.chars().count(), "ask answered");

    match output {
        OutputFormat::Json => (
            StatusCode::OK,
            Json(AskResponse {
                response: text.to_string(),
            }),
        )
            .into_response(),
        OutputFormat::Text => {
            (StatusCode::OK, [(CONTENT_TYPE, TEXT_PLAIN)], text.to_string()).into_response()
        }
    }
}

async fn ask_stream(provider: &dyn GenerationProvider, message: &str) -> Response {
    let mut fragments = match provider.generate_stream(message).await {
        Ok(fragments) => fragments,
        Err(err) => return provider_failure(err),
    };

    // Status is only committed once the first fragment is in hand.
    let first = loop {
        match fragments.next().await {
            Some(Ok(text)) if text.is_empty() => continue,
            Some(Ok(text)) => break text,
            Some(Err(err)) => return provider_failure(err),
            None => return empty_response(),
        }
    };
    info!("streaming ask response");

    (
        StatusCode::OK,
        [(CONTENT_TYPE, TEXT_PLAIN)],
        Body::from_stream(relay(first, fragments)),
    )
        .into_response()
}

/// Forwards fragments one body frame at a time. An upstream error becomes a
/// single trailing fragment and ends the body.
fn relay(
    first: String,
    rest: FragmentStream,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    let tail = stream::unfold(Some(rest), |rest| async move {
        let mut rest = rest?;
        loop {
            match rest.next().await {
                Some(Ok(text)) if text.is_empty() => continue,
                Some(Ok(text)) => return Some((Bytes::from(text), Some(rest))),
                Some(Err(err)) => {
                    warn!(error = %err, "provider stream failed after output was sent");
                    return Some((Bytes::from(format!("{STREAM_ERROR_PREFIX}{err}")), None));
                }
                None => {
                    debug!("provider stream finished");
                    return None;
                }
            }
        }
    });

    stream::once(async move { Bytes::from(first) })
        .chain(tail)
        .map(Ok::<_, Infallible>)
}

fn provider_failure(err: ProviderError) -> Response {
    warn!(error = %err, "provider call failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

fn empty_response() -> Response {
    warn!("provider returned no text");
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "provider returned an empty response".to_string(),
    )
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorResponse { error })).into_response()
}

fn preview(message: &str) -> String {
    let mut preview: String = message.chars().take(PREVIEW_CHARS).collect();
    if message.chars().count() > PREVIEW_CHARS {
        preview.push('…');
    }
    preview
}
