// Tracing setup. Log level is driven by GIN_MODE / DEBUG for parity with
// the environment contract: GIN_MODE=release silences INFO, DEBUG=1 opens
// debug-level output, default is info.

use tracing_subscriber::EnvFilter;

pub fn init_logger() {
    let debug_enabled = std::env::var("DEBUG")
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true"))
        .unwrap_or(false);
    let release_mode = std::env::var("GIN_MODE")
        .map(|v| v.eq_ignore_ascii_case("release"))
        .unwrap_or(false);

    let default_level = if debug_enabled {
        "debug"
    } else if release_mode {
        "warn"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("kiro_relay={default_level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
