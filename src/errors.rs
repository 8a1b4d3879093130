// Error envelope and upstream error translation.
// Non-SSE responses use {"error": {"message": string, "code": string}}.
// Mid-stream errors become SSE `error` events carrying Claude-shaped
// {type, message} pairs; the mapping table lives here so both paths agree.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    AuthenticationError,
    BadRequest,
    InvalidRequestError,
    ModelNotFound,
    Forbidden,
    RateLimited,
    UpstreamError,
    ParsingError,
    InternalError,
    Banned,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthenticationError => "authentication_error",
            Self::BadRequest => "bad_request",
            Self::InvalidRequestError => "invalid_request_error",
            Self::ModelNotFound => "model_not_found",
            Self::Forbidden => "forbidden",
            Self::RateLimited => "rate_limited",
            Self::UpstreamError => "upstream_error",
            Self::ParsingError => "parsing_error",
            Self::InternalError => "internal_error",
            Self::Banned => "banned",
        }
    }

    /// Claude SSE error-event type for this code.
    pub fn sse_type(&self) -> &'static str {
        match self {
            Self::AuthenticationError | Self::Forbidden | Self::Banned => "authentication_error",
            Self::BadRequest | Self::InvalidRequestError | Self::ModelNotFound => {
                "invalid_request_error"
            }
            Self::RateLimited => "rate_limit_error",
            Self::UpstreamError => "overloaded_error",
            Self::ParsingError | Self::InternalError => "api_error",
        }
    }
}

/// Build a JSON error response with the standard envelope.
pub fn error_response(status: StatusCode, code: ErrorCode, message: &str) -> Response {
    let body = json!({
        "error": {
            "message": message,
            "code": code.as_str(),
        }
    });
    (status, Json(body)).into_response()
}

/// Upstream failure translated into the Claude-facing vocabulary.
#[derive(Debug, Clone)]
pub struct UpstreamError {
    pub status: u16,
    pub code: ErrorCode,
    pub message: String,
    /// The upstream cut the response for length; finalize with
    /// stop_reason max_tokens instead of surfacing an error.
    pub max_tokens: bool,
}

/// Map an upstream status + body onto the error table.
/// The body substring checks catch CodeWhisperer's exception names, which
/// arrive both as HTTP error bodies and as exception-frame payloads.
pub fn map_upstream_error(status: u16, body: &str) -> UpstreamError {
    let message = extract_upstream_message(body);

    if status == 423 || body.contains("AccountSuspendedException") {
        return UpstreamError {
            status: 403,
            code: ErrorCode::Banned,
            message,
            max_tokens: false,
        };
    }

    if body.contains("CONTENT_LENGTH_EXCEEDS_THRESHOLD") {
        return UpstreamError {
            status,
            code: ErrorCode::UpstreamError,
            message,
            max_tokens: true,
        };
    }

    let code = match status {
        403 => ErrorCode::Forbidden,
        429 => ErrorCode::RateLimited,
        _ => ErrorCode::UpstreamError,
    };

    // upstream_error mirrors the upstream status when it is a valid HTTP
    // code, 502 otherwise
    let http = match code {
        ErrorCode::UpstreamError if !(400..=599).contains(&status) => 502,
        _ => status,
    };

    UpstreamError {
        status: http,
        code,
        message,
        max_tokens: false,
    }
}

/// Pull a human-readable message out of an upstream error body, which may
/// be JSON with a `message` field or raw text.
fn extract_upstream_message(body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(msg) = parsed.get("message").and_then(|m| m.as_str()) {
            if !msg.is_empty() {
                return msg.to_string();
            }
        }
    }
    body.to_string()
}
