// Runtime configuration: environment overrides, model map, upstream endpoints.

use std::collections::HashMap;

use once_cell::sync::Lazy;

/// Kiro refresh-token exchange endpoint.
pub const KIRO_REFRESH_URL: &str = "https://prod.us-east-1.auth.desktop.kiro.dev/refreshToken";

/// AmazonQ OIDC refresh endpoint.
pub const AMAZONQ_TOKEN_URL: &str = "https://oidc.us-east-1.amazonaws.com/token";

/// CodeWhisperer streaming RPC endpoint.
pub const CODEWHISPERER_URL: &str =
    "https://codewhisperer.us-east-1.amazonaws.com/generateAssistantResponse";

/// Fixed AWS-SDK identification headers for the AmazonQ OIDC exchange.
/// `amz-sdk-invocation-id` is generated per request and not part of this set.
pub const AMAZONQ_OIDC_HEADERS: &[(&str, &str)] = &[
    ("content-type", "application/json"),
    ("user-agent", "aws-sdk-rust/1.3.9 os/windows lang/rust/1.87.0"),
    (
        "x-amz-user-agent",
        "aws-sdk-rust/1.3.9 ua/2.1 api/ssooidc/1.88.0 os/windows lang/rust/1.87.0 m/E app/AmazonQ-For-CLI",
    ),
    ("amz-sdk-request", "attempt=1; max=3"),
];

/// AWS EventStream framing bounds.
pub const EVENT_STREAM_MIN_MESSAGE_SIZE: usize = 16;
pub const EVENT_STREAM_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Frame parser gives up after this many recoverable errors.
pub const PARSER_MAX_ERRORS: usize = 30;

/// Hard cap for non-streaming response aggregation.
pub const NON_STREAM_TIMEOUT_SECS: u64 = 600;

/// Interval between full token-cache refresh sweeps.
pub const TOKEN_REFRESH_INTERVAL_SECS: u64 = 45 * 60;

/// Message id shape: msg_YYYYMMDDhhmmss.
pub const MESSAGE_ID_TIME_FORMAT: &str = "%Y%m%d%H%M%S";

/// Model aliases accepted on the Anthropic surface, mapped to the ids the
/// upstream expects. Unmapped models pass through unchanged.
pub static MODEL_MAP: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("claude-opus-4-5", "claude-opus-4.5"),
        ("claude-opus-4-5-20251101", "claude-opus-4.5"),
        ("claude-sonnet-4-5", "claude-sonnet-4.5"),
        ("claude-sonnet-4-5-20250929", "claude-sonnet-4.5"),
        ("claude-haiku-4-5", "claude-haiku-4.5"),
        ("claude-haiku-4-5-20251001", "claude-haiku-4.5"),
    ])
});

/// Resolve a client model id through the map, passing unknown ids through.
pub fn resolve_model_id(model: &str) -> String {
    MODEL_MAP
        .get(model)
        .map(|id| id.to_string())
        .unwrap_or_else(|| model.to_string())
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Cap on tool description characters sent upstream.
pub fn max_tool_description_length() -> usize {
    env_usize("MAX_TOOL_DESCRIPTION_LENGTH", 10000)
}

/// Listen port.
pub fn port() -> u16 {
    std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1188)
}

/// `GET /` redirect target.
pub fn landing_url() -> String {
    std::env::var("LANDING_URL")
        .unwrap_or_else(|_| "https://www.bilibili.com/video/BV1cp4y1Q7yn".to_string())
}

/// Prompt-cache sweeper period.
pub fn prompt_cache_clean_interval_secs() -> u64 {
    env_usize("PROMPT_CACHE_CLEAN_INTERVAL_SECS", 300) as u64
}
