use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the aggregation server.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Listener configuration.
    #[serde(default)]
    pub listen: ListenConfig,

    /// Snapshot persistence configuration.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Liveness window and sweeper cadence.
    #[serde(default)]
    pub expiry: ExpiryConfig,

    /// Per-connection limits.
    #[serde(default)]
    pub server: ServerConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    /// Bind host. Default: "0.0.0.0".
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port. Default: 4567.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Snapshot persistence configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Canonical snapshot path. Default: "weather_data.json".
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,

    /// Sync file data and the parent directory on every flush. Default: true.
    #[serde(default = "default_true")]
    pub fsync: bool,
}

/// Liveness window configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ExpiryConfig {
    /// Producers silent for longer than this are evicted. Default: 30s.
    #[serde(default = "default_ttl", with = "humantime_serde")]
    pub ttl: Duration,

    /// How often the sweeper checks for stale producers. Default: 5s.
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,
}

/// Per-connection limits.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Timeout for each read phase (request line, headers, body). Default: 30s.
    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,

    /// Largest accepted PUT body. Default: 1MiB.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Largest accepted number of header lines. Default: 64.
    #[serde(default = "default_max_header_lines")]
    pub max_header_lines: usize,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics and /healthz. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    4567
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("weather_data.json")
}

fn default_true() -> bool {
    true
}

fn default_ttl() -> Duration {
    Duration::from_secs(30)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_body_bytes() -> usize {
    1024 * 1024 // 1MiB
}

fn default_max_header_lines() -> usize {
    64
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            fsync: true,
        }
    }
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            ttl: default_ttl(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            read_timeout: default_read_timeout(),
            max_body_bytes: default_max_body_bytes(),
            max_header_lines: default_max_header_lines(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.listen.host.is_empty() {
            bail!("listen.host is required");
        }

        if self.storage.path.as_os_str().is_empty() {
            bail!("storage.path is required");
        }

        if self.expiry.ttl.is_zero() {
            bail!("expiry.ttl must be positive");
        }

        if self.expiry.sweep_interval.is_zero() {
            bail!("expiry.sweep_interval must be positive");
        }

        if self.server.read_timeout.is_zero() {
            bail!("server.read_timeout must be positive");
        }

        if self.server.max_body_bytes == 0 {
            bail!("server.max_body_bytes must be positive");
        }

        if self.server.max_header_lines == 0 {
            bail!("server.max_header_lines must be positive");
        }

        if self.health.enabled && self.health.addr.is_empty() {
            bail!("health.addr is required when enabled");
        }

        Ok(())
    }

    /// Socket address string the aggregator binds to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.listen.host, self.listen.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.listen.port, 4567);
        assert_eq!(cfg.bind_addr(), "0.0.0.0:4567");
        assert_eq!(cfg.storage.path, PathBuf::from("weather_data.json"));
        assert!(cfg.storage.fsync);
        assert_eq!(cfg.expiry.ttl, Duration::from_secs(30));
        assert_eq!(cfg.expiry.sweep_interval, Duration::from_secs(5));
        assert_eq!(cfg.server.max_body_bytes, 1024 * 1024);
        assert!(!cfg.health.enabled);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml_with_durations() {
        let yaml = r#"
listen:
  port: 8080
storage:
  path: /var/lib/weatherhub/data.json
  fsync: false
expiry:
  ttl: 5m
  sweep_interval: 500ms
server:
  read_timeout: 2s
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parse yaml");
        assert_eq!(cfg.listen.port, 8080);
        assert_eq!(cfg.listen.host, "0.0.0.0");
        assert_eq!(
            cfg.storage.path,
            PathBuf::from("/var/lib/weatherhub/data.json")
        );
        assert!(!cfg.storage.fsync);
        assert_eq!(cfg.expiry.ttl, Duration::from_secs(300));
        assert_eq!(cfg.expiry.sweep_interval, Duration::from_millis(500));
        assert_eq!(cfg.server.read_timeout, Duration::from_secs(2));
        assert_eq!(cfg.server.max_header_lines, 64);
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let cfg: Config = serde_yaml::from_str("{}").expect("parse yaml");
        assert_eq!(cfg.listen.port, 4567);
        assert_eq!(cfg.expiry.ttl, Duration::from_secs(30));
    }

    #[test]
    fn test_validation_zero_ttl() {
        let mut cfg = Config::default();
        cfg.expiry.ttl = Duration::ZERO;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("expiry.ttl"));
    }

    #[test]
    fn test_validation_zero_sweep_interval() {
        let mut cfg = Config::default();
        cfg.expiry.sweep_interval = Duration::ZERO;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("sweep_interval"));
    }

    #[test]
    fn test_validation_empty_storage_path() {
        let mut cfg = Config::default();
        cfg.storage.path = PathBuf::new();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("storage.path"));
    }

    #[test]
    fn test_validation_body_limit_zero() {
        let mut cfg = Config::default();
        cfg.server.max_body_bytes = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("max_body_bytes"));

        cfg.server.max_body_bytes = 1;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validation_health_addr_required_when_enabled() {
        let mut cfg = Config::default();
        cfg.health.addr = String::new();
        assert!(cfg.validate().is_ok());

        cfg.health.enabled = true;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("health.addr"));
    }

    #[test]
    fn test_load_missing_file_fails() {
        let err = Config::load(Path::new("/nonexistent/weatherhub.yaml")).unwrap_err();
        assert!(err.to_string().contains("reading config file"));
    }
}
