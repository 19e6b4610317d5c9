use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    /// Ledger currency every site payment is computed in before conversion.
    pub base_currency: String,
    pub event_bus_url: Option<String>,
    pub event_bus_token: Option<String>,
    pub outbox_sweep_interval_secs: u64,
    /// Days a published outbox event is kept before the sweep deletes it.
    pub outbox_retention_days: i32,
    pub analytics_cache_capacity: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DB_URL")
                .or_else(|_| std::env::var("DATABASE_URL"))
                .map_err(|_| {
                    anyhow::anyhow!("DB_URL or DATABASE_URL environment variable required")
                })
                .and_then(|url| {
                    if url.trim().is_empty() {
                        anyhow::bail!("DB_URL cannot be empty");
                    }
                    if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
                        anyhow::bail!("DB_URL must start with postgresql:// or postgres://");
                    }
                    Ok(url)
                })?,
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            base_currency: std::env::var("BASE_CURRENCY")
                .unwrap_or_else(|_| "USD".to_string())
                .trim()
                .to_uppercase(),
            event_bus_url: std::env::var("EVENT_BUS_URL")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(|raw| {
                    let parsed = url::Url::parse(&raw)
                        .map_err(|e| anyhow::anyhow!("EVENT_BUS_URL is not a valid URL: {}", e))?;
                    if parsed.scheme() != "http" && parsed.scheme() != "https" {
                        anyhow::bail!("EVENT_BUS_URL must start with http:// or https://");
                    }
                    Ok(raw.trim_end_matches('/').to_string())
                })
                .transpose()?,
            event_bus_token: std::env::var("EVENT_BUS_TOKEN")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            outbox_sweep_interval_secs: std::env::var("OUTBOX_SWEEP_INTERVAL_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("OUTBOX_SWEEP_INTERVAL_SECS must be a number"))?,
            outbox_retention_days: std::env::var("OUTBOX_RETENTION_DAYS")
                .unwrap_or_else(|_| "7".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("OUTBOX_RETENTION_DAYS must be a number"))?,
            analytics_cache_capacity: std::env::var("ANALYTICS_CACHE_CAPACITY")
                .unwrap_or_else(|_| "10000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("ANALYTICS_CACHE_CAPACITY must be a number"))?,
        };

        if !is_currency_code(&config.base_currency) {
            anyhow::bail!(
                "BASE_CURRENCY must be a three-letter ISO 4217 code, got '{}'",
                config.base_currency
            );
        }
        if config.outbox_sweep_interval_secs == 0 {
            anyhow::bail!("OUTBOX_SWEEP_INTERVAL_SECS must be greater than zero");
        }
        if config.outbox_retention_days < 1 {
            anyhow::bail!("OUTBOX_RETENTION_DAYS must be at least 1");
        }

        // Log successful configuration load (without sensitive values)
        tracing::info!("Configuration loaded successfully");
        tracing::debug!("Database host: {}", database_host(&config.database_url));
        tracing::debug!("Base currency: {}", config.base_currency);
        match config.event_bus_url {
            Some(ref bus) => tracing::info!("Event bus configured: {}", bus),
            None => tracing::warn!("EVENT_BUS_URL not set, domain events will only be logged"),
        }
        tracing::debug!("Server Port: {}", config.port);

        Ok(config)
    }
}

/// Whether `code` has the shape of an ISO 4217 currency code (three upper-case letters).
pub fn is_currency_code(code: &str) -> bool {
    CURRENCY_CODE
        .as_ref()
        .is_some_and(|re| re.is_match(code))
}

static CURRENCY_CODE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"^[A-Z]{3}$").ok());

/// Host part of a database URL, for logging without credentials.
pub fn database_host(database_url: &str) -> String {
    url::Url::parse(database_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| "<unparseable>".to_string())
}
