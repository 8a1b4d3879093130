mod config;
mod errors;
mod handlers;
mod logger;
mod mappers;
mod parser;
mod prompt_cache;
mod server;
mod stream;
mod token_manager;
mod tokenizer;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use server::AppState;
use token_manager::TokenManager;

#[tokio::main]
async fn main() {
    logger::init_logger();

    let http_client = server::build_http_client().expect("failed to build HTTP client");

    let token_manager = Arc::new(TokenManager::new(http_client.clone()));
    token_manager.start_refresher();

    let _cache_sweeper = prompt_cache::init_global_cache(Duration::from_secs(
        config::prompt_cache_clean_interval_secs(),
    ));

    let state = AppState {
        token_manager: token_manager.clone(),
        http_client,
    };

    let port = config::port();
    info!("kiro-relay starting on port {port}");

    if let Err(err) = server::run(state, port).await {
        error!(%err, "server failed");
        std::process::exit(1);
    }

    token_manager.shutdown();
    info!("shutting down");
}
