//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file named by BAAS_CONFIG, if set
//! 3. Environment variables

use crate::hasher::DEFAULT_BCRYPT_COST;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default listening port.
pub const DEFAULT_PORT: u16 = baas_protocol::DEFAULT_PORT;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Worker pool configuration.
    pub workers: WorkersConfig,
    /// TLS configuration.
    pub tls: TlsConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("BAAS_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies `BAAS_*` overrides read through `var`.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        self.network.apply_overrides(&var);
        self.workers.apply_overrides(&var);
        self.tls.apply_overrides(&var);
        self.metrics.apply_overrides(&var);
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.workers.validate()?;
        self.tls.validate()
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Host or address to listen on.
    pub hostname: String,
    /// Port to listen on; 0 picks a free port.
    pub port: u16,
    /// Idle connection timeout in milliseconds (0 = never).
    pub socket_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            hostname: Ipv4Addr::UNSPECIFIED.to_string(),
            port: DEFAULT_PORT,
            socket_timeout_ms: 2000,
        }
    }
}

impl NetworkConfig {
    fn apply_overrides(&mut self, var: &impl Fn(&str) -> Option<String>) {
        if let Some(bind) = var("BAAS_BIND") {
            match bind.rsplit_once(':') {
                Some((host, port)) => {
                    if let Ok(port) = port.parse() {
                        self.hostname = host.trim_matches(&['[', ']'][..]).to_string();
                        self.port = port;
                    }
                }
                None => self.hostname = bind,
            }
        }

        if let Some(timeout) = var("BAAS_SOCKET_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.socket_timeout_ms = ms;
            }
        }
    }

    /// Returns the idle timeout, or `None` when disabled.
    pub fn socket_timeout(&self) -> Option<Duration> {
        (self.socket_timeout_ms > 0).then(|| Duration::from_millis(self.socket_timeout_ms))
    }

    /// Returns the `host:port` string to bind.
    pub fn bind_addr(&self) -> String {
        if self.hostname.contains(':') {
            format!("[{}]:{}", self.hostname, self.port)
        } else {
            format!("{}:{}", self.hostname, self.port)
        }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    /// Worker thread count. Unset means available parallelism minus one.
    pub count: Option<usize>,
    /// Bound on the wait queue. Unset means unbounded.
    pub max_queue_length: Option<usize>,
    /// bcrypt work factor (4..=31).
    pub bcrypt_cost: u32,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: None,
            max_queue_length: None,
            bcrypt_cost: DEFAULT_BCRYPT_COST,
        }
    }
}

impl WorkersConfig {
    fn apply_overrides(&mut self, var: &impl Fn(&str) -> Option<String>) {
        if let Some(n) = var("BAAS_WORKERS").and_then(|v| v.parse().ok()) {
            self.count = Some(n);
        }
        if let Some(max) = var("BAAS_MAX_QUEUE") {
            // An empty value clears a bound set in the file.
            self.max_queue_length = max.parse().ok();
        }
        if let Some(cost) = var("BAAS_BCRYPT_COST").and_then(|v| v.parse().ok()) {
            self.bcrypt_cost = cost;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.count == Some(0) {
            return Err(ConfigError::ValidationError(
                "workers.count must be at least 1".to_string(),
            ));
        }
        if !(4..=31).contains(&self.bcrypt_cost) {
            return Err(ConfigError::ValidationError(format!(
                "workers.bcrypt_cost must be within 4..=31, got {}",
                self.bcrypt_cost
            )));
        }
        Ok(())
    }
}

/// TLS configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Serve `baass://` instead of `baas://`.
    pub enabled: bool,
    /// Path to PEM-encoded server certificate file.
    pub cert_path: Option<PathBuf>,
    /// Path to PEM-encoded private key file.
    pub key_path: Option<PathBuf>,
}

impl TlsConfig {
    fn apply_overrides(&mut self, var: &impl Fn(&str) -> Option<String>) {
        if let Some(enabled) = var("BAAS_TLS_ENABLED") {
            self.enabled = parse_flag(&enabled);
        }
        if let Some(path) = var("BAAS_TLS_CERT") {
            self.cert_path = Some(PathBuf::from(path));
        }
        if let Some(path) = var("BAAS_TLS_KEY") {
            self.key_path = Some(PathBuf::from(path));
        }
    }

    /// Validates TLS configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }

        if self.cert_path.is_none() {
            return Err(ConfigError::ValidationError(
                "TLS enabled but cert_path not set".to_string(),
            ));
        }
        if self.key_path.is_none() {
            return Err(ConfigError::ValidationError(
                "TLS enabled but key_path not set".to_string(),
            ));
        }

        Ok(())
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_overrides(&mut self, var: &impl Fn(&str) -> Option<String>) {
        if let Some(enabled) = var("BAAS_METRICS_ENABLED") {
            self.enabled = parse_flag(&enabled);
        }
        if let Some(parsed) = var("BAAS_METRICS_BIND").and_then(|a| a.parse().ok()) {
            self.bind_addr = parsed;
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// SocketAddr as a plain string in YAML.
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.port, 9485);
        assert_eq!(config.network.bind_addr(), "0.0.0.0:9485");
        assert_eq!(
            config.network.socket_timeout(),
            Some(Duration::from_millis(2000))
        );
        assert_eq!(config.workers.count, None);
        assert_eq!(config.workers.max_queue_length, None);
        assert_eq!(config.workers.bcrypt_cost, 10);
        assert!(!config.tls.enabled);
        assert!(!config.metrics.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.network.bind_addr(), config.network.bind_addr());
        assert_eq!(parsed.metrics.bind_addr, config.metrics.bind_addr);
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "network:\n  port: 7000\nworkers:\n  count: 3\n  max_queue_length: 50"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.network.port, 7000);
        assert_eq!(config.network.hostname, "0.0.0.0");
        assert_eq!(config.workers.count, Some(3));
        assert_eq!(config.workers.max_queue_length, Some(50));
        assert_eq!(config.workers.bcrypt_cost, 10);
    }

    #[test]
    fn test_from_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.yaml");
        assert!(matches!(
            Config::from_file(&missing),
            Err(ConfigError::IoError(_, _))
        ));

        let bad = dir.path().join("bad.yaml");
        std::fs::write(&bad, "network: 42").unwrap();
        assert!(matches!(
            Config::from_file(&bad),
            Err(ConfigError::ParseError(_, _))
        ));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("baas.yaml");

        let mut config = Config::default();
        config.workers.bcrypt_cost = 12;
        config.network.socket_timeout_ms = 0;
        config.save(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.workers.bcrypt_cost, 12);
        assert_eq!(loaded.network.socket_timeout(), None);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(env(&[
            ("BAAS_BIND", "127.0.0.1:7777"),
            ("BAAS_SOCKET_TIMEOUT_MS", "500"),
            ("BAAS_WORKERS", "2"),
            ("BAAS_MAX_QUEUE", "8"),
            ("BAAS_BCRYPT_COST", "6"),
            ("BAAS_METRICS_ENABLED", "true"),
            ("BAAS_METRICS_BIND", "127.0.0.1:9999"),
        ]));

        assert_eq!(config.network.bind_addr(), "127.0.0.1:7777");
        assert_eq!(config.network.socket_timeout_ms, 500);
        assert_eq!(config.workers.count, Some(2));
        assert_eq!(config.workers.max_queue_length, Some(8));
        assert_eq!(config.workers.bcrypt_cost, 6);
        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.bind_addr.port(), 9999);
    }

    #[test]
    fn test_env_bind_ipv6_and_bare_host() {
        let mut config = Config::default();
        config.apply_overrides(env(&[("BAAS_BIND", "[::1]:9000")]));
        assert_eq!(config.network.hostname, "::1");
        assert_eq!(config.network.bind_addr(), "[::1]:9000");

        let mut config = Config::default();
        config.apply_overrides(env(&[("BAAS_BIND", "localhost")]));
        assert_eq!(config.network.bind_addr(), "localhost:9485");
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.workers.count = Some(0);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.workers.bcrypt_cost = 3;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.apply_overrides(env(&[("BAAS_TLS_ENABLED", "1")]));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cert_path"));

        config.apply_overrides(env(&[
            ("BAAS_TLS_CERT", "/tmp/cert.pem"),
            ("BAAS_TLS_KEY", "/tmp/key.pem"),
        ]));
        assert!(config.validate().is_ok());
    }
}
