use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{KraError, Result};

/// Default remote API endpoint.
pub const DEFAULT_API_URL: &str = "https://api.kraudcloud.com";

/// Push pipeline configuration.
///
/// Built once by the CLI and passed to every pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    /// Base URL of the remote API
    pub api_url: String,

    /// Bearer token for the remote API
    #[serde(skip_serializing)]
    pub token: Option<String>,

    /// User-Agent header sent with every request
    pub user_agent: String,

    /// Container runtime CLI used to inspect and export images
    pub docker_bin: String,

    /// Directory for per-run temporary files (system temp dir if unset)
    pub work_dir: Option<PathBuf>,

    /// Maximum number of layers compressed and uploaded at once
    pub max_concurrent_uploads: usize,

    /// Gzip level for layer compression (0-9)
    pub compression_level: u32,

    /// Per-request timeout in seconds (0 = none)
    pub request_timeout_secs: u64,

    /// Log level
    pub log_level: LogLevel,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            token: None,
            user_agent: format!("kra v{}", crate::VERSION),
            docker_bin: "docker".to_string(),
            work_dir: None,
            max_concurrent_uploads: 8,
            compression_level: 6,
            request_timeout_secs: 0,
            log_level: LogLevel::Warn,
        }
    }
}

impl PushConfig {
    /// Defaults overlaid with environment variables.
    ///
    /// Reads `KRA_API_URL`, `KR_ACCESS_TOKEN`, `KRA_DOCKER`, `KRA_MAX_UPLOADS`
    /// and `KRA_LOG_LEVEL`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup("KRA_API_URL") {
            self.api_url = url;
        }
        if let Some(token) = lookup("KR_ACCESS_TOKEN").filter(|t| !t.is_empty()) {
            self.token = Some(token);
        }
        if let Some(bin) = lookup("KRA_DOCKER") {
            self.docker_bin = bin;
        }
        if let Some(max) = lookup("KRA_MAX_UPLOADS") {
            self.max_concurrent_uploads = max.trim().parse().map_err(|_| {
                KraError::ConfigError(format!("KRA_MAX_UPLOADS is not a number: {max}"))
            })?;
        }
        if let Some(level) = lookup("KRA_LOG_LEVEL") {
            self.log_level = level
                .parse()
                .map_err(|e| KraError::ConfigError(format!("KRA_LOG_LEVEL: {e}")))?;
        }
        Ok(())
    }

    /// Check the configuration before building a pipeline from it.
    pub fn validate(&self) -> Result<()> {
        if self.api_url.trim().is_empty() {
            return Err(KraError::ConfigError("api_url must not be empty".to_string()));
        }
        if !self.api_url.starts_with("http://") && !self.api_url.starts_with("https://") {
            return Err(KraError::ConfigError(format!(
                "api_url must be an http(s) URL: {}",
                self.api_url
            )));
        }
        if self.max_concurrent_uploads == 0 {
            return Err(KraError::ConfigError(
                "max_concurrent_uploads must be at least 1".to_string(),
            ));
        }
        if self.compression_level > 9 {
            return Err(KraError::ConfigError(format!(
                "compression_level must be 0-9, got {}",
                self.compression_level
            )));
        }
        if self.docker_bin.trim().is_empty() {
            return Err(KraError::ConfigError("docker_bin must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!(
                "unknown log level: '{}' (supported: debug, info, warn, error)",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = PushConfig::default();
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.docker_bin, "docker");
        assert_eq!(config.max_concurrent_uploads, 8);
        assert!(config.token.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overlay() {
        let mut config = PushConfig::default();
        config
            .apply_env(env(&[
                ("KRA_API_URL", "http://localhost:3804"),
                ("KR_ACCESS_TOKEN", "secret"),
                ("KRA_MAX_UPLOADS", "3"),
            ]))
            .unwrap();
        assert_eq!(config.api_url, "http://localhost:3804");
        assert_eq!(config.token.as_deref(), Some("secret"));
        assert_eq!(config.max_concurrent_uploads, 3);
        assert_eq!(config.docker_bin, "docker");
    }

    #[test]
    fn test_env_empty_token_ignored() {
        let mut config = PushConfig::default();
        config.apply_env(env(&[("KR_ACCESS_TOKEN", "")])).unwrap();
        assert!(config.token.is_none());
    }

    #[test]
    fn test_env_bad_max_uploads() {
        let mut config = PushConfig::default();
        let err = config
            .apply_env(env(&[("KRA_MAX_UPLOADS", "many")]))
            .unwrap_err();
        assert!(matches!(err, KraError::ConfigError(_)));
    }

    #[test]
    fn test_env_log_level() {
        let mut config = PushConfig::default();
        assert_eq!(config.log_level, LogLevel::Warn);
        config.apply_env(env(&[("KRA_LOG_LEVEL", "Info")])).unwrap();
        assert_eq!(config.log_level, LogLevel::Info);

        let err = config
            .apply_env(env(&[("KRA_LOG_LEVEL", "loud")]))
            .unwrap_err();
        assert!(matches!(err, KraError::ConfigError(_)));
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = PushConfig {
            max_concurrent_uploads: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_compression_level() {
        let config = PushConfig {
            compression_level: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_non_http_url() {
        let config = PushConfig {
            api_url: "ftp://example.com".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_token_not_serialized() {
        let config = PushConfig {
            token: Some("secret".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret"));
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!("debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("WARN".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
        assert_eq!(tracing::Level::from(LogLevel::Info), tracing::Level::INFO);
    }
}
