// POST /v1/messages — the translation path.
//
// credential -> access token -> request translation -> upstream streaming
// call -> frame decode -> Claude SSE (or one aggregated JSON body).
// Downstream SSE headers are only sent after the upstream call succeeds,
// so pre-stream failures surface as plain HTTP errors and mid-stream
// failures as SSE error events.

use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{CODEWHISPERER_URL, NON_STREAM_TIMEOUT_SECS};
use crate::errors::{error_response, map_upstream_error, ErrorCode};
use crate::mappers::claude::content::walk_content;
use crate::mappers::claude::models::{ClaudeRequest, CountTokensRequest, Tool};
use crate::mappers::codewhisperer::{build_codewhisperer_request, TranslateError};
use crate::mappers::codewhisperer::builder::ConversationContext;
use crate::parser::EventStreamParser;
use crate::prompt_cache::{self, CacheResult};
use crate::server::{AppState, AuthContext, RequestId};
use crate::stream::events;
use crate::stream::writer::ResponseWriter;
use crate::stream::StreamStateMachine;
use crate::token_manager::credential_hash;
use crate::tokenizer::TokenEstimator;

pub async fn handle_messages(
    State(state): State<AppState>,
    axum::Extension(auth): axum::Extension<AuthContext>,
    axum::Extension(request_id): axum::Extension<RequestId>,
    Json(body): Json<Value>,
) -> Response {
    let request: ClaudeRequest = match parse_request(body) {
        Ok(req) => req,
        Err(message) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                ErrorCode::InvalidRequestError,
                &message,
            );
        }
    };

    if request.messages.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            ErrorCode::BadRequest,
            "messages array must not be empty",
        );
    }
    if let Err(reason) = validate_last_message(&request) {
        return error_response(StatusCode::BAD_REQUEST, ErrorCode::BadRequest, &reason);
    }

    let trace_id: String = rand::Rng::sample_iter(rand::thread_rng(), &rand::distributions::Alphanumeric)
        .take(6)
        .map(char::from)
        .collect::<String>()
        .to_lowercase();

    info!(
        trace_id = %trace_id,
        request_id = %request_id.id,
        model = %request.model,
        stream = request.stream,
        messages = request.messages.len(),
        tools = request.tools.as_ref().map(|t| t.len()).unwrap_or(0),
        "claude request"
    );

    // Input tokens reflect what actually goes upstream: unsupported tools
    // are already gone.
    let estimator = TokenEstimator::new();
    let input_tokens = estimator.estimate_request(&CountTokensRequest {
        model: request.model.clone(),
        system: request.system.clone(),
        messages: request.messages.clone(),
        tools: request.tools.as_ref().map(|tools| filter_tools(tools)),
    });

    let cache_result = prompt_cache::global_cache()
        .map(|cache| cache.process_request(&request, input_tokens))
        .unwrap_or_else(|| CacheResult {
            total_tokens: input_tokens,
            ..Default::default()
        });

    let ctx = ConversationContext {
        credential_hash: credential_hash(&auth.credential),
        client_request_id: request_id.client_provided.then(|| request_id.id.clone()),
    };
    let cw_request =
        match build_codewhisperer_request(&request, &ctx, auth.profile_arn.as_deref()) {
            Ok(req) => req,
            Err(TranslateError::ModelNotFound(model)) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    ErrorCode::ModelNotFound,
                    &format!("model '{model}' not found"),
                );
            }
            Err(err) => {
                error!(%err, "request translation failed");
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorCode::InternalError,
                    &format!("failed to build upstream request: {err}"),
                );
            }
        };

    debug!(
        history = cw_request.conversation_state.history.len(),
        trigger = %cw_request.conversation_state.chat_trigger_type,
        "upstream request assembled"
    );

    let upstream = match send_upstream(&state, &auth.access_token, &cw_request).await {
        Ok(resp) => resp,
        Err(err) => {
            error!(%err, "upstream request failed");
            return error_response(StatusCode::BAD_GATEWAY, ErrorCode::UpstreamError, &err);
        }
    };

    let status = upstream.status();
    if !status.is_success() {
        let body = upstream.text().await.unwrap_or_default();
        warn!(status = status.as_u16(), "upstream rejected request");

        // 403 means the access token died early; evict so the next
        // request re-exchanges the refresh credential.
        if status.as_u16() == 403 {
            state.token_manager.invalidate(&auth.credential);
        }

        let mapped = map_upstream_error(status.as_u16(), &body);
        let http = StatusCode::from_u16(mapped.status).unwrap_or(StatusCode::BAD_GATEWAY);
        return error_response(http, mapped.code, &mapped.message);
    }

    let sm = StreamStateMachine::new(&request.model, input_tokens, &cache_result);

    if request.stream {
        stream_response(upstream, sm, cache_result).await
    } else {
        aggregate_response(upstream, sm, cache_result).await
    }
}

/// Normalize the raw body before typed parsing: tools entries that carry
/// the full triple are reduced to it, everything else passes through.
fn parse_request(mut body: Value) -> Result<ClaudeRequest, String> {
    if let Some(Value::Array(tools)) = body.get_mut("tools") {
        for tool in tools.iter_mut() {
            let Value::Object(map) = &*tool else { continue };
            if map.contains_key("name")
                && map.contains_key("description")
                && map.contains_key("input_schema")
            {
                let reduced = serde_json::json!({
                    "name": map["name"],
                    "description": map["description"],
                    "input_schema": map["input_schema"],
                });
                *tool = reduced;
            }
        }
    }

    serde_json::from_value(body).map_err(|err| format!("Invalid request body: {err}"))
}

/// The final message must carry something: text, images, tool results or
/// tool uses. A known placeholder probe is rejected outright. Requests
/// declaring tools pass through; the translator injects a placeholder for
/// their empty turns.
fn validate_last_message(request: &ClaudeRequest) -> Result<(), String> {
    let last = request.messages.last().expect("checked non-empty");
    let parts = walk_content(&last.content);
    let trimmed = parts.text.trim();

    if trimmed == "answer for user question" {
        return Err("message content must not be empty".to_string());
    }

    let has_tools = request
        .tools
        .as_ref()
        .map(|tools| !tools.is_empty())
        .unwrap_or(false);
    if trimmed.is_empty()
        && parts.images.is_empty()
        && parts.tool_results.is_empty()
        && parts.tool_uses.is_empty()
        && !has_tools
    {
        return Err("message content must not be empty".to_string());
    }
    Ok(())
}

fn filter_tools(tools: &[Tool]) -> Vec<Tool> {
    tools
        .iter()
        .filter(|tool| {
            tool.name
                .as_deref()
                .map(|name| !Tool::is_unsupported_name(name))
                .unwrap_or(true)
        })
        .cloned()
        .collect()
}

async fn send_upstream(
    state: &AppState,
    access_token: &str,
    cw_request: &crate::mappers::codewhisperer::models::CodeWhispererRequest,
) -> Result<reqwest::Response, String> {
    state
        .http_client
        .post(CODEWHISPERER_URL)
        .header(header::AUTHORIZATION, format!("Bearer {access_token}"))
        .header(header::CONTENT_TYPE, "application/x-amz-json-1.0")
        .header(header::ACCEPT, "*/*")
        .header(
            "X-Amz-Target",
            "AmazonCodeWhispererStreamingService.GenerateAssistantResponse",
        )
        .header(
            header::USER_AGENT,
            "aws-sdk-rust/1.3.9 os/macos lang/rust/1.87.0",
        )
        .header(
            "X-Amz-User-Agent",
            "aws-sdk-rust/1.3.9 ua/2.1 api/codewhispererstreaming/1.0.0 os/macos lang/rust/1.87.0 m/E",
        )
        .json(cw_request)
        .send()
        .await
        .map_err(|err| err.to_string())
}

/// Relay the upstream EventStream as Claude SSE. Frames are processed
/// synchronously on this request's task; the channel only decouples the
/// downstream socket.
async fn stream_response(
    upstream: reqwest::Response,
    mut sm: StreamStateMachine,
    cache_result: CacheResult,
) -> Response {
    let (tx, rx) = mpsc::channel::<Result<bytes::Bytes, std::convert::Infallible>>(32);

    tokio::spawn(async move {
        let mut writer = ResponseWriter::new(tx);
        let parser = EventStreamParser::new();
        let mut body = upstream.bytes_stream();

        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    warn!(%err, "upstream body read failed mid-stream");
                    break;
                }
            };

            parser.feed(&chunk);
            let (messages, parse_error) = parser.poll();

            for message in &messages {
                let (sse, terminate) = sm.process_message(message);
                if !sse.is_empty() && writer.write(sse.as_bytes()).await.is_err() {
                    debug!("client disconnected, aborting stream");
                    return;
                }
                if terminate {
                    return;
                }
            }

            if let Some(err) = parse_error {
                error!(%err, "frame parser gave up");
                let sse = format!(
                    "{}{}",
                    events::error(ErrorCode::ParsingError.sse_type(), &err.to_string()),
                    events::message_stop()
                );
                let _ = writer.write(sse.as_bytes()).await;
                return;
            }
        }

        let tail = sm.finalize();
        if writer.write(tail.as_bytes()).await.is_ok() {
            info!(
                output_tokens = sm.output_tokens(),
                stop_reason = sm.stop_reason(),
                cache_creation = cache_result.cache_creation_tokens,
                cache_read = cache_result.cache_read_tokens,
                "stream complete"
            );
        }
    });

    let body_stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Same bookkeeping, one JSON body. A watchdog bounds runaway parses.
async fn aggregate_response(
    upstream: reqwest::Response,
    mut sm: StreamStateMachine,
    cache_result: CacheResult,
) -> Response {
    let aggregation = tokio::time::timeout(
        Duration::from_secs(NON_STREAM_TIMEOUT_SECS),
        async {
            let bytes = upstream
                .bytes()
                .await
                .map_err(|err| format!("failed to read upstream body: {err}"))?;

            let parser = EventStreamParser::new();
            parser.feed(&bytes);
            let (messages, parse_error) = parser.poll();

            for message in &messages {
                let (_, terminate) = sm.process_message(message);
                if terminate {
                    break;
                }
            }

            if let Some(err) = parse_error {
                return Err(format!("event stream undecodable: {err}"));
            }
            Ok(())
        },
    )
    .await;

    match aggregation {
        Err(_) => error_response(
            StatusCode::REQUEST_TIMEOUT,
            ErrorCode::ParsingError,
            "response parsing timed out",
        ),
        Ok(Err(reason)) => {
            error!(%reason, "non-streaming aggregation failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorCode::ParsingError,
                &reason,
            )
        }
        Ok(Ok(())) => {
            sm.finalize();
            info!(
                output_tokens = sm.output_tokens(),
                stop_reason = sm.stop_reason(),
                cache_creation = cache_result.cache_creation_tokens,
                cache_read = cache_result.cache_read_tokens,
                "non-streaming request complete"
            );
            Json(sm.non_stream_message()).into_response()
        }
    }
}
