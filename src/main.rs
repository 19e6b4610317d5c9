use axum::{
    routing::{get, post, put},
    Router,
};
use ctms_payments_api::analytics::PlaceholderAnalytics;
use ctms_payments_api::config::Config;
use ctms_payments_api::db::Database;
use ctms_payments_api::event_bus::{EventPublisher, HttpEventPublisher, LogEventPublisher};
use ctms_payments_api::handlers::{self, AppState};
use ctms_payments_api::obs;
use ctms_payments_api::services::PaymentService;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};

/// Events republished per sweep tick.
const OUTBOX_SWEEP_BATCH: i64 = 100;

/// Main entry point for the application.
///
/// Loads configuration, connects to Postgres, picks an event publisher, starts the
/// outbox sweep, and serves the HTTP API.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    obs::init_tracing();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize database connection pool
    let db = Database::new(&config.database_url).await?;
    tracing::info!("Database connection pool established");

    let publisher: Arc<dyn EventPublisher> = match &config.event_bus_url {
        Some(url) => {
            let client = HttpEventPublisher::new(url.clone(), config.event_bus_token.clone())
                .map_err(|e| anyhow::anyhow!("Failed to initialize event bus client: {}", e))?;
            tracing::info!("✓ Event bus publisher initialized: {}", url);
            Arc::new(client)
        }
        None => Arc::new(LogEventPublisher),
    };

    let service = PaymentService::new(
        db.pool.clone(),
        publisher,
        Arc::new(PlaceholderAnalytics),
        config.analytics_cache_capacity,
        config.base_currency.clone(),
    );
    tracing::info!(
        "Payment service ready (base currency {}, analytics cache {} entries)",
        config.base_currency,
        config.analytics_cache_capacity
    );

    spawn_outbox_sweep(
        service.clone(),
        Duration::from_secs(config.outbox_sweep_interval_secs),
        config.outbox_retention_days,
    );

    // Build application state
    let app_state = Arc::new(AppState {
        service,
        config: config.clone(),
    });

    // Configure rate limiter: 10 requests/second per IP, burst of 20
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("Invalid rate limiter configuration"))?,
    );

    // Build protected routes with security layers
    let protected_routes = Router::new()
        // Study setup
        .route(
            "/api/v1/studies/:study_id/payment-config",
            put(handlers::setup_global_payment_config).get(handlers::get_global_payment_config),
        )
        .route(
            "/api/v1/studies/:study_id/site-payments",
            put(handlers::setup_site_payments),
        )
        // Forecasting
        .route(
            "/api/v1/studies/:study_id/forecasts",
            post(handlers::generate_forecast),
        )
        .route("/api/v1/forecasts/:id", get(handlers::get_forecast))
        // EDC-driven payments
        .route(
            "/api/v1/visits/:visit_id/payments",
            post(handlers::process_edc_payment),
        )
        .route("/api/v1/payments/:id", get(handlers::get_payment))
        // Contracts
        .route(
            "/api/v1/contracts/:id/amendments",
            post(handlers::process_amendment),
        )
        // Analytics
        .route(
            "/api/v1/analytics/:level/:entity_id",
            post(handlers::generate_analytics),
        )
        .route(
            "/api/v1/analytics/:level/:entity_id/latest",
            get(handlers::latest_analytics),
        )
        // Reference data
        .route(
            "/api/v1/reference/exchange-rates",
            put(handlers::upsert_exchange_rate),
        )
        .route(
            "/api/v1/reference/visit-rates",
            put(handlers::upsert_visit_rate),
        )
        .route(
            "/api/v1/reference/procedure-rates",
            put(handlers::upsert_procedure_rate),
        )
        .layer(
            ServiceBuilder::new()
                // Request size limit: 2MB max payload
                .layer(RequestBodyLimitLayer::new(2 * 1024 * 1024))
                // Rate limiting: 10 req/sec per IP, burst of 20
                .layer(GovernorLayer {
                    config: governor_conf,
                }),
        );

    // Health check bypasses rate limiting
    let app = Router::new()
        .route("/health", get(handlers::health))
        .merge(protected_routes)
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// Periodically republishes outbox events whose post-commit publish failed, and
/// drops published ones past the retention window.
fn spawn_outbox_sweep(service: PaymentService, every: Duration, retention_days: i32) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(e) = service.sweep_outbox(OUTBOX_SWEEP_BATCH).await {
                tracing::error!("Outbox sweep failed: {}", e);
            }
            if let Err(e) = service.prune_outbox(retention_days).await {
                tracing::error!("Outbox prune failed: {}", e);
            }
        }
    });
    tracing::info!(
        "Outbox sweep scheduled every {:?}, keeping published events {} days",
        every,
        retention_days
    );
}
