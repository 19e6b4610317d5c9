//! Logging setup shared by the server and the CLI binaries.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "ctms_payments_api=debug,tower_http=debug";

/// Installs the global `tracing` subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Like [`init_tracing`] but writes to stderr, so stdout stays free for program output.
pub fn init_cli_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ctms_payments_api=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
