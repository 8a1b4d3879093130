// HTTP surface: router, shared state, authentication and request-id
// middleware, CORS.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::{HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config;
use crate::errors::{error_response, ErrorCode};
use crate::handlers::{count_tokens, messages, models};
use crate::token_manager::TokenManager;

#[derive(Clone)]
pub struct AppState {
    pub token_manager: Arc<TokenManager>,
    pub http_client: reqwest::Client,
}

/// Authenticated identity attached to each request: the raw credential
/// (needed for 403-driven invalidation) and its exchanged access token.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub credential: String,
    pub access_token: String,
    pub profile_arn: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RequestId {
    pub id: String,
    /// True when the client supplied X-Request-ID itself; only then is the
    /// id stable enough to key conversation identity on.
    pub client_provided: bool,
}

/// One shared connection-pooled client per process.
pub fn build_http_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .pool_max_idle_per_host(10)
        .connect_timeout(Duration::from_secs(30))
        .build()
}

pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/v1/models", get(models::handle_list_models))
        .route("/v1/messages", post(messages::handle_messages))
        .route(
            "/v1/messages/count_tokens",
            post(count_tokens::handle_count_tokens),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/", get(landing_redirect))
        .merge(api_routes)
        .fallback(not_found)
        .layer(middleware::from_fn(request_id_middleware))
        .layer(cors_layer())
        .with_state(state)
}

pub async fn run(state: AppState, port: u16) -> Result<(), String> {
    let app = build_router(state);
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|err| format!("failed to bind {addr}: {err}"))?;

    info!("proxy server listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown signal received");
        })
        .await
        .map_err(|err| err.to_string())
}

async fn landing_redirect() -> Response {
    // 301; axum's Redirect::permanent would send 308
    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(axum::http::header::LOCATION, config::landing_url())
        .body(axum::body::Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, ErrorCode::BadRequest, "404 not found")
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Honor a client X-Request-ID or mint one, and echo it back.
async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let (id, client_provided) = match request
        .headers()
        .get("X-Request-ID")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
    {
        Some(id) => (id.to_string(), true),
        None => (format!("req_{}", Uuid::new_v4()), false),
    };

    request.extensions_mut().insert(RequestId {
        id: id.clone(),
        client_provided,
    });

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert("X-Request-ID", value);
    }
    response
}

/// x-api-key preferred, Authorization: Bearer accepted. The credential is
/// exchanged for an access token before the handler runs; a failed
/// exchange is an authentication failure.
async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let headers = request.headers();
    let credential = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| {
            headers
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.strip_prefix("Bearer "))
                .map(str::to_string)
        })
        .unwrap_or_default();

    if credential.is_empty() {
        return error_response(
            StatusCode::UNAUTHORIZED,
            ErrorCode::AuthenticationError,
            "Missing authentication. Provide Authorization header or x-api-key",
        );
    }

    match state.token_manager.get_or_refresh(&credential).await {
        Ok(token) => {
            request.extensions_mut().insert(AuthContext {
                credential,
                access_token: token.token,
                profile_arn: token.profile_arn,
            });
            next.run(request).await
        }
        Err(err) => {
            warn!(%err, "credential exchange failed");
            error_response(
                StatusCode::UNAUTHORIZED,
                ErrorCode::AuthenticationError,
                "Identity verification fails, please check its validity",
            )
        }
    }
}
