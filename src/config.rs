use std::env;
use tokio::time::Duration;

use crate::client::{ClientConfig, DEFAULT_USER_AGENT};
use crate::utils::{parse_bool_flag, parse_duration_string};

/// Per-session settings shared by every simulated user.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Deadline for a single physical attempt. Hitting it retires the user.
    pub attempt_timeout: Duration,
    /// Budget for one logical request, retries and back-off included.
    pub retirement_threshold: Duration,
    /// Sleep between attempts after a 5xx.
    pub retry_interval: Duration,
    /// Answer GETs from a locally fresh cache entry without touching the network.
    pub allow_local_freshness: bool,
    pub user_agent: String,
    pub resolve_target_addr: Option<String>,
    pub custom_headers: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(5),
            retirement_threshold: Duration::from_secs(10),
            retry_interval: Duration::from_millis(500),
            allow_local_freshness: false,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            resolve_target_addr: None,
            custom_headers: None,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_retirement_threshold(mut self, threshold: Duration) -> Self {
        self.retirement_threshold = threshold;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_local_freshness(mut self, allow: bool) -> Self {
        self.allow_local_freshness = allow;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Creates the transport configuration for one session.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            attempt_timeout: self.attempt_timeout,
            user_agent: self.user_agent.clone(),
            resolve_target_addr: self.resolve_target_addr.clone(),
            custom_headers: self.custom_headers.clone(),
            ..ClientConfig::default()
        }
    }
}

/// Endpoints handed to the service under test by `POST /initialize`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializeParams {
    pub bank_endpoint: String,
    pub bank_appid: String,
    pub log_endpoint: String,
    pub log_appid: String,
}

/// Main configuration for a benchmark run.
#[derive(Debug, Clone)]
pub struct Config {
    pub target_url: String,
    pub num_users: usize,
    pub test_duration: Duration,
    pub poll_interval: Duration,
    pub share_cache: bool,
    pub metrics_port: u16,
    pub json_logs: bool,
    pub initialize: Option<InitializeParams>,
    pub session: SessionConfig,
}

type ConfigResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> ConfigResult<Self> {
        let target_url = env::var("TARGET_URL")
            .map_err(|_| "TARGET_URL environment variable must be set")?;
        if !target_url.starts_with("http://") && !target_url.starts_with("https://") {
            return Err(format!(
                "TARGET_URL must start with http:// or https:// (got '{}')",
                target_url
            )
            .into());
        }

        let num_users: usize = env_or("NUM_USERS", "10")
            .parse()
            .map_err(|e| format!("NUM_USERS must be a valid number: {}", e))?;
        if num_users == 0 {
            return Err("NUM_USERS must be greater than 0".into());
        }

        let session = SessionConfig {
            attempt_timeout: env_duration("ATTEMPT_TIMEOUT", "5s")?,
            retirement_threshold: env_duration("RETIRE_TIMEOUT", "10s")?,
            retry_interval: env_duration("RETRY_INTERVAL", "500ms")?,
            allow_local_freshness: env_bool("ALLOW_LOCAL_FRESHNESS")?,
            user_agent: env_or("USER_AGENT", DEFAULT_USER_AGENT),
            resolve_target_addr: env::var("RESOLVE_TARGET_ADDR").ok(),
            custom_headers: env::var("CUSTOM_HEADERS").ok(),
        };
        if session.attempt_timeout.is_zero() || session.retirement_threshold.is_zero() {
            return Err("ATTEMPT_TIMEOUT and RETIRE_TIMEOUT must be greater than 0".into());
        }

        let metrics_port: u16 = env_or("METRICS_PORT", "9090")
            .parse()
            .map_err(|e| format!("METRICS_PORT must be a valid port: {}", e))?;

        Ok(Config {
            target_url,
            num_users,
            test_duration: env_duration("TEST_DURATION", "1m")?,
            poll_interval: env_duration("POLL_INTERVAL", "1s")?,
            share_cache: env_bool("SHARE_CACHE")?,
            metrics_port,
            json_logs: env_or("LOG_FORMAT", "text").eq_ignore_ascii_case("json"),
            initialize: Self::parse_initialize()?,
            session,
        })
    }

    fn parse_initialize() -> ConfigResult<Option<InitializeParams>> {
        let vars = ["BANK_ENDPOINT", "BANK_APPID", "LOG_ENDPOINT", "LOG_APPID"];
        let values: Vec<Option<String>> = vars.iter().map(|v| env::var(v).ok()).collect();

        match values.as_slice() {
            [Some(bank_endpoint), Some(bank_appid), Some(log_endpoint), Some(log_appid)] => {
                Ok(Some(InitializeParams {
                    bank_endpoint: bank_endpoint.clone(),
                    bank_appid: bank_appid.clone(),
                    log_endpoint: log_endpoint.clone(),
                    log_appid: log_appid.clone(),
                }))
            }
            _ if values.iter().all(Option::is_none) => Ok(None),
            _ => Err(format!("{} must be set together", vars.join(", ")).into()),
        }
    }

    /// Prints the configuration summary.
    pub fn print_summary(&self) {
        println!("Starting benchmark:");
        println!("  Target URL: {}", self.target_url);
        println!("  Simulated users: {}", self.num_users);
        println!("  Test duration: {:?}", self.test_duration);
        println!("  Attempt timeout: {:?}", self.session.attempt_timeout);
        println!("  Retire timeout: {:?}", self.session.retirement_threshold);
        println!("  Retry interval: {:?}", self.session.retry_interval);
        println!("  Local freshness: {}", self.session.allow_local_freshness);
        println!("  Shared cache: {}", self.share_cache);
        println!(
            "  Initialize: {}",
            if self.initialize.is_some() { "Yes" } else { "No" }
        );
    }
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_duration(name: &str, default: &str) -> ConfigResult<Duration> {
    let raw = env_or(name, default);
    parse_duration_string(&raw)
        .map_err(|e| format!("Invalid {} format: '{}'. {}", name, raw, e).into())
}

fn env_bool(name: &str) -> ConfigResult<bool> {
    let raw = env_or(name, "false");
    parse_bool_flag(&raw).map_err(|e| format!("Invalid {}: {}", name, e).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_builders() {
        let config = SessionConfig::new()
            .with_attempt_timeout(Duration::from_secs(1))
            .with_retirement_threshold(Duration::from_secs(3))
            .with_retry_interval(Duration::from_millis(100))
            .with_local_freshness(true)
            .with_user_agent("Isutrader/0.0.1");

        assert_eq!(config.attempt_timeout, Duration::from_secs(1));
        assert_eq!(config.retirement_threshold, Duration::from_secs(3));
        assert_eq!(config.retry_interval, Duration::from_millis(100));
        assert!(config.allow_local_freshness);

        let client = config.to_client_config();
        assert_eq!(client.attempt_timeout, Duration::from_secs(1));
        assert_eq!(client.user_agent, "Isutrader/0.0.1");
    }

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert!(!config.allow_local_freshness);
        assert!(config.attempt_timeout < config.retirement_threshold);
    }
}
