//! Service configuration.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use sprout_billing_core::DEFAULT_WELCOME_BONUS;

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address to listen on (default: "0.0.0.0:8080").
    pub listen_addr: String,

    /// Path to `RocksDB` data directory (default: "/data/sprout-billing").
    pub data_dir: String,

    /// PostgreSQL connection string. Takes precedence over `data_dir`.
    pub database_url: Option<String>,

    /// HS256 secret used to verify end-user JWTs.
    pub auth_jwt_secret: Option<String>,

    /// Expected JWT audience (default: "authenticated").
    pub auth_audience: String,

    /// Service API key for service-to-service auth.
    pub service_api_key: Option<String>,

    /// Admin API key for manual grants.
    pub admin_api_key: Option<String>,

    /// Dodo Payments API base URL.
    pub dodo_api_url: String,

    /// Dodo Payments API key (optional; payments disabled without it).
    pub dodo_api_key: Option<String>,

    /// Dodo webhook signing secret (optional; webhooks rejected without it).
    pub dodo_webhook_secret: Option<String>,

    /// Pay-what-you-want product used for credit packs.
    pub dodo_product_id: Option<String>,

    /// Currency for charges (default: "USD").
    pub payment_currency: String,

    /// Frontend URL for checkout redirects.
    pub frontend_url: String,

    /// CORS allowed origins.
    pub cors_origins: Vec<String>,

    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,

    /// Request timeout in seconds.
    pub request_timeout_seconds: u64,

    /// How long a payment may stay pending before it expires.
    pub payment_timeout_seconds: u64,

    /// Delay between provider status polls.
    pub poll_interval_seconds: u64,

    /// Retries for transient provider failures.
    pub provider_max_retries: u32,

    /// Maximum accepted age of a webhook timestamp.
    pub webhook_tolerance_seconds: u64,

    /// Credits granted when an account is opened.
    pub welcome_bonus_credits: i64,

    /// Interval of the background expiry sweep.
    pub expiry_sweep_seconds: u64,
}

/// Dodo secrets file structure.
#[derive(Debug, Deserialize)]
struct DodoSecrets {
    api_key: String,
    #[serde(default)]
    webhook_secret: Option<String>,
    #[serde(default)]
    product_id: Option<String>,
    #[serde(default)]
    api_url: Option<String>,
}

impl ServiceConfig {
    /// Load configuration from environment variables and secrets files.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let dodo = load_dodo_secrets();

        Self {
            listen_addr: env_or("LISTEN_ADDR", defaults.listen_addr),
            data_dir: env_or("DATA_DIR", defaults.data_dir),
            database_url: std::env::var("DATABASE_URL").ok(),
            auth_jwt_secret: std::env::var("AUTH_JWT_SECRET").ok(),
            auth_audience: env_or("AUTH_AUDIENCE", defaults.auth_audience),
            service_api_key: std::env::var("SERVICE_API_KEY").ok(),
            admin_api_key: std::env::var("ADMIN_API_KEY").ok(),
            dodo_api_url: dodo.api_url.unwrap_or(defaults.dodo_api_url),
            dodo_api_key: dodo.api_key,
            dodo_webhook_secret: dodo.webhook_secret,
            dodo_product_id: dodo.product_id,
            payment_currency: env_or("PAYMENT_CURRENCY", defaults.payment_currency),
            frontend_url: env_or("FRONTEND_URL", defaults.frontend_url),
            cors_origins: std::env::var("CORS_ORIGINS")
                .unwrap_or_else(|_| "*".into())
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
            max_body_bytes: env_parse("MAX_BODY_BYTES", defaults.max_body_bytes),
            request_timeout_seconds: env_parse(
                "REQUEST_TIMEOUT_SECONDS",
                defaults.request_timeout_seconds,
            ),
            payment_timeout_seconds: env_parse(
                "PAYMENT_TIMEOUT_SECONDS",
                defaults.payment_timeout_seconds,
            ),
            poll_interval_seconds: env_parse(
                "POLL_INTERVAL_SECONDS",
                defaults.poll_interval_seconds,
            ),
            provider_max_retries: env_parse("PROVIDER_MAX_RETRIES", defaults.provider_max_retries),
            webhook_tolerance_seconds: env_parse(
                "WEBHOOK_TOLERANCE_SECONDS",
                defaults.webhook_tolerance_seconds,
            ),
            welcome_bonus_credits: env_parse(
                "WELCOME_BONUS_CREDITS",
                defaults.welcome_bonus_credits,
            ),
            expiry_sweep_seconds: env_parse("EXPIRY_SWEEP_SECONDS", defaults.expiry_sweep_seconds),
        }
    }

    /// Payment window as a `Duration`.
    #[must_use]
    pub const fn payment_timeout(&self) -> Duration {
        Duration::from_secs(self.payment_timeout_seconds)
    }

    /// Poll interval as a `Duration`.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }
}

fn env_or(name: &str, default: String) -> String {
    std::env::var(name).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Dodo settings resolved from a secrets file or the environment.
#[derive(Debug, Default)]
struct ResolvedDodo {
    api_url: Option<String>,
    api_key: Option<String>,
    webhook_secret: Option<String>,
    product_id: Option<String>,
}

/// Load Dodo secrets from file or environment.
fn load_dodo_secrets() -> ResolvedDodo {
    let secret_paths = [
        ".secrets/dodo.json",
        "sprout-billing/.secrets/dodo.json",
        "crates/sprout-billing-service/.secrets/dodo.json",
        "../.secrets/dodo.json",
    ];

    for path in &secret_paths {
        if let Ok(secrets) = load_secrets_file::<DodoSecrets>(path) {
            tracing::info!(path = %path, "Loaded Dodo secrets from file");
            return ResolvedDodo {
                api_url: secrets.api_url.or_else(|| std::env::var("DODO_API_URL").ok()),
                api_key: Some(secrets.api_key),
                webhook_secret: secrets.webhook_secret,
                product_id: secrets
                    .product_id
                    .or_else(|| std::env::var("DODO_PRODUCT_ID").ok()),
            };
        }
    }

    tracing::debug!("Dodo secrets file not found, using environment variables");
    ResolvedDodo {
        api_url: std::env::var("DODO_API_URL").ok(),
        api_key: std::env::var("DODO_API_KEY").ok(),
        webhook_secret: std::env::var("DODO_WEBHOOK_SECRET").ok(),
        product_id: std::env::var("DODO_PRODUCT_ID").ok(),
    }
}

/// Load secrets from a JSON file.
fn load_secrets_file<T: serde::de::DeserializeOwned>(path: &str) -> Result<T, std::io::Error> {
    let path = Path::new(path);
    if !path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Secrets file not found",
        ));
    }
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            data_dir: "/data/sprout-billing".into(),
            database_url: None,
            auth_jwt_secret: None,
            auth_audience: "authenticated".into(),
            service_api_key: None,
            admin_api_key: None,
            dodo_api_url: "https://test.dodopayments.com".into(),
            dodo_api_key: None,
            dodo_webhook_secret: None,
            dodo_product_id: None,
            payment_currency: "USD".into(),
            frontend_url: "http://localhost:3000".into(),
            cors_origins: vec!["*".into()],
            max_body_bytes: 1024 * 1024,
            request_timeout_seconds: 30,
            payment_timeout_seconds: 300,
            poll_interval_seconds: 5,
            provider_max_retries: 3,
            webhook_tolerance_seconds: 300,
            welcome_bonus_credits: DEFAULT_WELCOME_BONUS,
            expiry_sweep_seconds: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ServiceConfig::default();
        assert_eq!(config.payment_timeout(), Duration::from_secs(300));
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.welcome_bonus_credits, 5);
        assert!(config.dodo_webhook_secret.is_none());
    }

    #[test]
    fn missing_secrets_file_is_not_found() {
        let err = load_secrets_file::<DodoSecrets>("does/not/exist.json").unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
