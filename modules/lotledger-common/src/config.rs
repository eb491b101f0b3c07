use std::env;
use std::time::Duration;

/// Application configuration loaded from environment variables.
///
/// Built once at process start and passed by reference into every component.
/// Pipeline code never reads the environment directly.
#[derive(Debug, Clone)]
pub struct Config {
    // Postgres
    pub database_url: String,

    // Render pool
    pub render_base_url: String,
    pub render_token: Option<String>,

    // Outbound HTTP
    pub fetch_timeout_secs: u64,

    // Matching
    pub allow_fuzzy_match: bool,

    // Health/requeue monitor
    pub requeue_enabled: bool,
    pub requeue_cooldown_hours: i64,
    pub audit_batch_size: i64,
    pub audit_min_age_hours: i64,

    // Downstream collaborators (absent = no-op)
    pub image_service_url: Option<String>,
    pub comment_service_url: Option<String>,

    // Image backfill
    pub image_batch_size: usize,

    // Web server
    pub web_host: String,
    pub web_port: u16,
}

impl Config {
    /// Load configuration from environment variables.
    /// Panics with a clear message if required vars are missing.
    pub fn from_env() -> Self {
        Self {
            database_url: required_env("DATABASE_URL"),
            render_base_url: required_env("RENDER_POOL_URL"),
            render_token: env::var("RENDER_POOL_TOKEN").ok(),
            fetch_timeout_secs: parsed_env("FETCH_TIMEOUT_SECS", 30),
            allow_fuzzy_match: env::var("ALLOW_FUZZY_MATCH")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            requeue_enabled: env::var("REQUEUE_ENABLED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(true),
            requeue_cooldown_hours: parsed_env("REQUEUE_COOLDOWN_HOURS", 24),
            audit_batch_size: parsed_env("AUDIT_BATCH_SIZE", 200),
            audit_min_age_hours: parsed_env("AUDIT_MIN_AGE_HOURS", 6),
            image_service_url: env::var("IMAGE_SERVICE_URL").ok(),
            comment_service_url: env::var("COMMENT_SERVICE_URL").ok(),
            image_batch_size: parsed_env("IMAGE_BATCH_SIZE", 50),
            web_host: env::var("WEB_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            web_port: parsed_env("WEB_PORT", 3000),
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

fn required_env(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| panic!("{key} environment variable is required"))
}

fn parsed_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(v) => v
            .parse()
            .unwrap_or_else(|_| panic!("{key} must be a number")),
        Err(_) => default,
    }
}
