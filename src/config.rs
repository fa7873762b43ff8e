//! Configuration module for hostspeed.
//!
//! Loads an optional JSON file over built-in defaults, then applies
//! environment overrides.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metrics::StabilityWeights;

/// Default composite-score weights.
pub const DEFAULT_JITTER_WEIGHT: f64 = 1.5;
pub const DEFAULT_STABILITY_WEIGHT: f64 = 2.0;
pub const DEFAULT_TLS_BONUS: f64 = 15.0;

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    pub port: u16,
    pub attempts: u32,
    #[serde(alias = "timeout")]
    pub timeout_s: f64,
    #[serde(alias = "interval")]
    pub inter_attempt_delay_s: f64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            port: 443,
            attempts: 5,
            timeout_s: 2.0,
            inter_attempt_delay_s: 0.02,
        }
    }
}

impl TcpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_s)
    }

    pub fn inter_attempt_delay(&self) -> Duration {
        Duration::from_secs_f64(self.inter_attempt_delay_s.max(0.0))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    #[serde(alias = "timeout")]
    pub timeout_s: f64,
    pub verify_hostname: bool,
    /// Treat a failed SNI check as a failed attempt instead of a qualified success.
    pub strict: bool,
    pub try_hosts_limit: usize,
    pub preferred_hosts: Vec<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_s: 2.5,
            verify_hostname: false,
            strict: false,
            try_hosts_limit: 3,
            preferred_hosts: vec![
                "github.com".to_string(),
                "api.github.com".to_string(),
                "raw.githubusercontent.com".to_string(),
                "githubusercontent.com".to_string(),
                "github.githubassets.com".to_string(),
            ],
        }
    }
}

impl TlsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IcmpConfig {
    pub enabled: bool,
    pub timeout_ms: u64,
    /// Only ping IPs that gave no TCP answer at all.
    pub fallback_only: bool,
}

impl Default for IcmpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: 2000,
            fallback_only: true,
        }
    }
}

impl IcmpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,
    pub max_retries: u32,
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 2,
            backoff_factor: 1.5,
        }
    }
}

impl RetryConfig {
    /// Retries actually allowed, zero when retrying is switched off.
    pub fn effective_retries(&self) -> u32 {
        if self.enabled {
            self.max_retries
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvancedConfig {
    pub measure_jitter: bool,
    pub calculate_stability: bool,
    pub stability: StabilityWeights,
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            measure_jitter: true,
            calculate_stability: true,
            stability: StabilityWeights::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub max_workers: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self { max_workers: 60 }
    }
}

/// Composite ranking weights.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingConfig {
    pub jitter_weight: f64,
    pub stability_weight: f64,
    pub tls_bonus: f64,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            jitter_weight: DEFAULT_JITTER_WEIGHT,
            stability_weight: DEFAULT_STABILITY_WEIGHT,
            tls_bonus: DEFAULT_TLS_BONUS,
        }
    }
}

/// `secs` is above zero and fits in a `Duration`.
fn positive_duration(secs: f64) -> bool {
    secs > 0.0 && Duration::try_from_secs_f64(secs).is_ok()
}

/// Full speed-test configuration snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeedTestConfig {
    pub tcp: TcpConfig,
    pub tls: TlsConfig,
    pub icmp: IcmpConfig,
    pub retry: RetryConfig,
    pub advanced: AdvancedConfig,
    pub concurrency: ConcurrencyConfig,
    pub ranking: RankingConfig,
}

impl SpeedTestConfig {
    /// Load configuration.
    ///
    /// Sources, later wins:
    /// - built-in defaults
    /// - JSON file at `path`, or at `HOSTSPEED_CONFIG` when `path` is `None`
    /// - `HOSTSPEED_MAX_WORKERS`, `HOSTSPEED_TLS_ENABLED`, `HOSTSPEED_TCP_PORT`
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = path
            .map(Path::to_path_buf)
            .or_else(|| env::var_os("HOSTSPEED_CONFIG").map(PathBuf::from));

        let mut cfg = match file {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_env(&mut self) {
        if let Ok(v) = env::var("HOSTSPEED_MAX_WORKERS") {
            if let Ok(n) = v.parse() {
                self.concurrency.max_workers = n;
            }
        }

        if let Ok(v) = env::var("HOSTSPEED_TLS_ENABLED") {
            match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.tls.enabled = true,
                "0" | "false" | "no" | "off" => self.tls.enabled = false,
                _ => tracing::warn!("ignoring HOSTSPEED_TLS_ENABLED={}", v),
            }
        }

        if let Ok(v) = env::var("HOSTSPEED_TCP_PORT") {
            if let Ok(port) = v.parse() {
                self.tcp.port = port;
            }
        }
    }

    /// Reject values that would make a run meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| -> Result<(), ConfigError> { Err(ConfigError::Invalid(msg.to_string())) };

        if self.tcp.port == 0 {
            return invalid("tcp.port cannot be 0");
        }
        if self.tcp.attempts == 0 {
            return invalid("tcp.attempts must be at least 1");
        }
        if !positive_duration(self.tcp.timeout_s) {
            return invalid("tcp.timeout_s must be a positive number of seconds");
        }
        if !(self.tcp.inter_attempt_delay_s.is_finite()
            && Duration::try_from_secs_f64(self.tcp.inter_attempt_delay_s.max(0.0)).is_ok())
        {
            return invalid("tcp.inter_attempt_delay_s is out of range");
        }
        if self.tls.enabled && !positive_duration(self.tls.timeout_s) {
            return invalid("tls.timeout_s must be a positive number of seconds");
        }
        if self.tls.try_hosts_limit == 0 {
            return invalid("tls.try_hosts_limit must be at least 1");
        }
        if self.icmp.enabled && self.icmp.timeout_ms == 0 {
            return invalid("icmp.timeout_ms must be at least 1");
        }
        if !(self.retry.backoff_factor >= 1.0 && self.retry.backoff_factor.is_finite()) {
            return invalid("retry.backoff_factor must be >= 1");
        }
        if self.concurrency.max_workers == 0 {
            return invalid("concurrency.max_workers must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let cfg = SpeedTestConfig::default();
        assert_eq!(cfg.tcp.port, 443);
        assert_eq!(cfg.tcp.attempts, 5);
        assert_eq!(cfg.tcp.timeout(), Duration::from_secs(2));
        assert!(cfg.tls.enabled);
        assert!(!cfg.tls.verify_hostname);
        assert!(!cfg.tls.strict);
        assert_eq!(cfg.tls.try_hosts_limit, 3);
        assert_eq!(cfg.tls.preferred_hosts[0], "github.com");
        assert_eq!(cfg.icmp.timeout_ms, 2000);
        assert!(cfg.icmp.fallback_only);
        assert_eq!(cfg.retry.max_retries, 2);
        assert_eq!(cfg.retry.backoff_factor, 1.5);
        assert_eq!(cfg.concurrency.max_workers, 60);
        assert_eq!(cfg.ranking.tls_bonus, DEFAULT_TLS_BONUS);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_file_overlays_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"tcp": {{"attempts": 10, "timeout": 1.5, "interval": 0.05}},
                "tls": {{"strict": true}},
                "retry": {{"enabled": false}}}}"#
        )
        .unwrap();

        let cfg = SpeedTestConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.tcp.attempts, 10);
        assert_eq!(cfg.tcp.timeout_s, 1.5);
        assert_eq!(cfg.tcp.inter_attempt_delay_s, 0.05);
        assert_eq!(cfg.tcp.port, 443);
        assert!(cfg.tls.strict);
        assert!(cfg.tls.enabled);
        assert_eq!(cfg.retry.effective_retries(), 0);
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();

        let err = SpeedTestConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = SpeedTestConfig::from_file(Path::new("/nonexistent/hostspeed.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn validation_rejects_nonsense() {
        let mut cfg = SpeedTestConfig::default();
        cfg.tcp.attempts = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let mut cfg = SpeedTestConfig::default();
        cfg.concurrency.max_workers = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = SpeedTestConfig::default();
        cfg.retry.backoff_factor = 0.5;
        assert!(cfg.validate().is_err());

        let mut cfg = SpeedTestConfig::default();
        cfg.tls.enabled = false;
        cfg.tls.timeout_s = 0.0;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validation_rejects_durations_that_overflow() {
        let mut cfg = SpeedTestConfig::default();
        cfg.tcp.timeout_s = 1e20;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let mut cfg = SpeedTestConfig::default();
        cfg.tcp.inter_attempt_delay_s = 1e20;
        assert!(cfg.validate().is_err());

        let mut cfg = SpeedTestConfig::default();
        cfg.tcp.inter_attempt_delay_s = f64::NAN;
        assert!(cfg.validate().is_err());

        let mut cfg = SpeedTestConfig::default();
        cfg.tls.timeout_s = 1e20;
        assert!(cfg.validate().is_err());

        let mut cfg = SpeedTestConfig::default();
        cfg.tcp.inter_attempt_delay_s = -1.0;
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.tcp.inter_attempt_delay(), Duration::ZERO);
    }

    #[test]
    fn huge_timeout_in_file_fails_validation() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"tcp": {{"timeout_s": 1e20}}}}"#).unwrap();

        let cfg = SpeedTestConfig::from_file(file.path()).unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }
}
