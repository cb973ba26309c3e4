use dotenvy::dotenv;
use std::env;
use std::time::Duration;

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub port: u16,
    /// Prefix for connection-state keys (`{prefix}:state:{id}`).
    pub state_key_prefix: String,
    /// Age after which a connection-state entry is eligible for the sweep.
    pub stale_threshold: Duration,
    pub sweep_interval: Duration,
    /// Grace window an unauthenticated connection gets before force-close.
    pub auth_timeout: Duration,
    pub redis_pool_size: usize,
    /// When set, authenticating a user evicts their previous connections.
    pub single_session_per_user: bool,
    pub jwt_secret: String,
    /// Bounded recent-message window kept per topic.
    pub topic_history_limit: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();

        let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let port = env_parse("PORT", 8181);
        let state_key_prefix = env::var("STATE_KEY_PREFIX").unwrap_or_else(|_| "ws".into());
        let stale_threshold = env_duration_secs("STALE_THRESHOLD_SECS", 24 * 60 * 60);
        let sweep_interval = env_duration_secs("SWEEP_INTERVAL_SECS", 60 * 60);
        let auth_timeout = env_duration_secs("AUTH_TIMEOUT_SECS", 30);
        let redis_pool_size = env_parse("REDIS_POOL_SIZE", 3usize).max(1);
        let single_session_per_user = env::var("SINGLE_SESSION_PER_USER")
            .map(|v| parse_bool(&v))
            .unwrap_or(false);
        let topic_history_limit = env_parse("TOPIC_HISTORY_LIMIT", 100usize).max(1);

        let jwt_secret = env::var("JWT_SECRET")
            .map_err(|_| AppError::Config("JWT_SECRET missing".into()))?;

        Ok(Self {
            redis_url,
            port,
            state_key_prefix,
            stale_threshold,
            sweep_interval,
            auth_timeout,
            redis_pool_size,
            single_session_per_user,
            jwt_secret,
            topic_history_limit,
        })
    }

    /// Defaults for integration tests: short timers, throwaway secret.
    pub fn for_tests(redis_url: &str) -> Self {
        Self {
            redis_url: redis_url.to_string(),
            port: 0,
            state_key_prefix: "ws".into(),
            stale_threshold: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
            auth_timeout: Duration::from_millis(300),
            redis_pool_size: 2,
            single_session_per_user: false,
            jwt_secret: "test-secret".into(),
            topic_history_limit: 100,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_duration_secs(name: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_parse(name, default_secs))
}

fn parse_bool(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}
