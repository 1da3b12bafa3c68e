use std::sync::Once;

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

static INIT: Once = Once::new();

/// Installs the global subscriber. Filter comes from `STEAM_SALE_LOG`
/// (falls back to `steam_sale_forecast=info`); output is one JSON object per
/// line unless `LOG_FORMAT=text`. Safe to call more than once.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env("STEAM_SALE_LOG")
            .unwrap_or_else(|_| EnvFilter::new("steam_sale_forecast=info"));
        let text = std::env::var("LOG_FORMAT")
            .map(|v| v.trim().eq_ignore_ascii_case("text"))
            .unwrap_or(false);

        let registry = tracing_subscriber::registry().with(filter);
        let result = if text {
            registry
                .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
                .try_init()
        } else {
            registry
                .with(
                    fmt::layer()
                        .json()
                        .with_writer(std::io::stderr)
                        .with_current_span(false)
                        .with_file(true)
                        .with_line_number(true),
                )
                .try_init()
        };
        if let Err(err) = result {
            eprintln!("warning: logging already initialised: {err}");
        }
    });
}
