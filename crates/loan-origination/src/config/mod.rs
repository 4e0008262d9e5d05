use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

const DEFAULT_EVALUATOR_TIMEOUT_SECS: u64 = 30;

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Top-level configuration for the origination service.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub evaluators: EvaluatorConfig,
    pub institutions: InstitutionConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let log_format = match env::var("APP_LOG_FORMAT") {
            Ok(raw) => LogFormat::parse(&raw).ok_or(ConfigError::InvalidLogFormat(raw))?,
            Err(_) => LogFormat::Compact,
        };

        let timeout_secs = match env::var("APP_EVALUATOR_TIMEOUT_SECS") {
            Ok(raw) => raw
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .ok_or(ConfigError::InvalidTimeout(raw))?,
            Err(_) => DEFAULT_EVALUATOR_TIMEOUT_SECS,
        };

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig {
                log_level,
                format: log_format,
            },
            evaluators: EvaluatorConfig {
                eligibility_url: non_empty_var("APP_ELIGIBILITY_URL"),
                matching_url: non_empty_var("APP_MATCHING_URL"),
                api_key: non_empty_var("APP_EVALUATOR_API_KEY"),
                timeout: Duration::from_secs(timeout_secs),
            },
            institutions: InstitutionConfig {
                api_key: non_empty_var("APP_INSTITUTION_API_KEY"),
            },
        })
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Settings controlling the HTTP server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Output shape for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl LogFormat {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "compact" | "text" => Some(Self::Compact),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Tracing controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub format: LogFormat,
}

/// Endpoints of the external eligibility and matching services.
#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    pub eligibility_url: Option<String>,
    pub matching_url: Option<String>,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl EvaluatorConfig {
    pub fn require_eligibility_url(&self) -> Result<&str, ConfigError> {
        self.eligibility_url
            .as_deref()
            .ok_or(ConfigError::MissingSetting("APP_ELIGIBILITY_URL"))
    }

    pub fn require_matching_url(&self) -> Result<&str, ConfigError> {
        self.matching_url
            .as_deref()
            .ok_or(ConfigError::MissingSetting("APP_MATCHING_URL"))
    }
}

/// Credential lenders present when reporting loan status changes.
#[derive(Debug, Clone, Default)]
pub struct InstitutionConfig {
    /// Unset means lender updates are refused.
    pub api_key: Option<String>,
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    InvalidLogFormat(String),
    InvalidTimeout(String),
    MissingSetting(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::InvalidLogFormat(value) => {
                write!(f, "APP_LOG_FORMAT must be 'compact' or 'json', found '{value}'")
            }
            ConfigError::InvalidTimeout(value) => write!(
                f,
                "APP_EVALUATOR_TIMEOUT_SECS must be a positive number of seconds, found '{value}'"
            ),
            ConfigError::MissingSetting(name) => write!(f, "{name} must be set"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidHost { source } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::{Mutex, OnceLock};

    fn env_guard() -> &'static Mutex<()> {
        static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
        GUARD.get_or_init(|| Mutex::new(()))
    }

    fn reset_env() {
        for name in [
            "APP_ENV",
            "APP_HOST",
            "APP_PORT",
            "APP_LOG_LEVEL",
            "APP_LOG_FORMAT",
            "APP_ELIGIBILITY_URL",
            "APP_MATCHING_URL",
            "APP_EVALUATOR_API_KEY",
            "APP_EVALUATOR_TIMEOUT_SECS",
            "APP_INSTITUTION_API_KEY",
        ] {
            env::remove_var(name);
        }
    }

    #[test]
    fn load_uses_defaults_when_env_missing() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        let config = AppConfig::load().expect("config loads with defaults");
        assert_eq!(config.environment, AppEnvironment::Development);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.telemetry.log_level, "info");
        assert_eq!(config.telemetry.format, LogFormat::Compact);
        assert_eq!(config.evaluators.timeout, Duration::from_secs(30));
        assert!(config.evaluators.eligibility_url.is_none());
        assert!(config.institutions.api_key.is_none());
    }

    #[test]
    fn reads_evaluator_endpoints_and_timeout() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("APP_ELIGIBILITY_URL", "http://scoring.internal/eligibility");
        env::set_var("APP_MATCHING_URL", "  ");
        env::set_var("APP_EVALUATOR_TIMEOUT_SECS", "12");
        env::set_var("APP_LOG_FORMAT", "JSON");
        env::set_var("APP_INSTITUTION_API_KEY", " lender-secret ");

        let config = AppConfig::load().expect("config loads");
        assert_eq!(
            config.evaluators.require_eligibility_url().expect("set"),
            "http://scoring.internal/eligibility"
        );
        assert!(matches!(
            config.evaluators.require_matching_url(),
            Err(ConfigError::MissingSetting("APP_MATCHING_URL"))
        ));
        assert_eq!(config.evaluators.timeout, Duration::from_secs(12));
        assert_eq!(config.telemetry.format, LogFormat::Json);
        assert_eq!(config.institutions.api_key.as_deref(), Some("lender-secret"));
        reset_env();
    }

    #[test]
    fn rejects_zero_timeout() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("APP_EVALUATOR_TIMEOUT_SECS", "0");
        assert!(matches!(
            AppConfig::load(),
            Err(ConfigError::InvalidTimeout(_))
        ));
        reset_env();
    }

    #[test]
    fn accepts_localhost_host() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("APP_HOST", "localhost");
        let config = AppConfig::load().expect("config loads");
        let addr = config.server.socket_addr().expect("localhost resolves");
        assert_eq!(addr, SocketAddr::new(IpAddr::from([127, 0, 0, 1]), 3000));
        reset_env();
    }
}
