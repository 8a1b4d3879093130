// POST /v1/messages/count_tokens — local estimate, no upstream call.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;

use crate::errors::{error_response, ErrorCode};
use crate::mappers::claude::models::{CountTokensRequest, Tool};
use crate::tokenizer::{is_valid_claude_model, TokenEstimator};

pub async fn handle_count_tokens(Json(body): Json<serde_json::Value>) -> Response {
    let request: CountTokensRequest = match serde_json::from_value(body) {
        Ok(req) => req,
        Err(err) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                ErrorCode::InvalidRequestError,
                &format!("Invalid request body: {err}"),
            );
        }
    };

    if !is_valid_claude_model(&request.model) {
        return error_response(
            StatusCode::BAD_REQUEST,
            ErrorCode::InvalidRequestError,
            &format!("Invalid model: {}", request.model),
        );
    }

    let input_tokens = count_request_tokens(request);
    Json(json!({ "input_tokens": input_tokens })).into_response()
}

/// Billing matches the upstream request, so tools elided there are elided
/// here too.
fn count_request_tokens(mut request: CountTokensRequest) -> usize {
    if let Some(tools) = request.tools.take() {
        let filtered: Vec<Tool> = tools
            .into_iter()
            .filter(|tool| {
                tool.name
                    .as_deref()
                    .map(|name| !Tool::is_unsupported_name(name))
                    .unwrap_or(true)
            })
            .collect();
        request.tools = Some(filtered);
    }

    TokenEstimator::new().estimate_request(&request)
}
