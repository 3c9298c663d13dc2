//! Proxy configuration
//!
//! Validated, immutable-after-load configuration for the proxy server.
//! Loaded from YAML by the CLI layer; this module owns the shape, the
//! defaults, and the validation rules — not the file-system glue.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// A wire dialect that can be enabled in the `protocols` list.
///
/// `Https` is accepted as a distinct token for configuration-file
/// compatibility, but it does not gate anything separately from `Http` on
/// the data path: a `CONNECT` request is honored whenever HTTP parsing
/// succeeds, regardless of whether `https` appears in `protocols` (see the
/// "https token" open question in the design notes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
    Socks5,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Socks5 => "socks5",
        };
        write!(f, "{s}")
    }
}

// Custom Deserialize so `protocols` accepts any casing (`HTTP`, `Http`,
// `http`).
impl<'de> Deserialize<'de> for Protocol {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        match raw.to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            "socks5" => Ok(Protocol::Socks5),
            other => Err(serde::de::Error::custom(format!(
                "unsupported protocol: {other} (expected http, https, or socks5)"
            ))),
        }
    }
}

/// Logging verbosity, as exposed in the configuration file and `--log-level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }
}

/// Authentication configuration (`auth:` block).
///
/// `type` is kept as a string rather than folded into `enabled` because a
/// disabled block with a populated user table is valid (operators toggle
/// auth without losing their user list).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_auth_type")]
    pub r#type: String,
    #[serde(default)]
    pub users: HashMap<String, String>,
    #[serde(default = "default_realm")]
    pub realm: String,
}

fn default_auth_type() -> String {
    "basic".to_string()
}

fn default_realm() -> String {
    "Triproxy".to_string()
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            r#type: default_auth_type(),
            users: HashMap::new(),
            realm: default_realm(),
        }
    }
}

/// Top-level proxy configuration, as read from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_protocols")]
    pub protocols: Vec<Protocol>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default = "default_true")]
    pub access_log: bool,
    #[serde(default)]
    pub log_file: Option<String>,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    7899
}
fn default_protocols() -> Vec<Protocol> {
    vec![Protocol::Http, Protocol::Https, Protocol::Socks5]
}
fn default_max_connections() -> usize {
    1000
}
fn default_connection_timeout() -> u64 {
    30
}
fn default_idle_timeout() -> u64 {
    300
}
fn default_buffer_size() -> usize {
    8192
}
fn default_true() -> bool {
    true
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            protocols: default_protocols(),
            max_connections: default_max_connections(),
            connection_timeout: default_connection_timeout(),
            idle_timeout: default_idle_timeout(),
            buffer_size: default_buffer_size(),
            log_level: LogLevel::default(),
            access_log: true,
            log_file: None,
            auth: None,
        }
    }
}

/// Configuration validation failures, reported before any socket opens.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(String),
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("port must be between 1 and 65535")]
    InvalidPort,
    #[error("protocols list must not be empty")]
    EmptyProtocols,
    #[error("max_connections must be at least 1")]
    InvalidMaxConnections,
    #[error("connection_timeout must be at least 1 second")]
    InvalidConnectionTimeout,
    #[error("idle_timeout must be at least 1 second")]
    InvalidIdleTimeout,
    #[error("buffer_size must be at least 512 bytes")]
    InvalidBufferSize,
    #[error("auth is enabled but no users are configured")]
    AuthNoUsers,
    #[error("auth user \"{0}\" has an empty username or password")]
    AuthBlankCredential(String),
}

impl ProxyConfig {
    /// Load and validate a configuration file.
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: ProxyConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the configuration to a YAML file, creating parent directories.
    pub fn to_yaml(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
            }
        }
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(())
    }

    /// Structural validation, independent of how the config was constructed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.protocols.is_empty() {
            return Err(ConfigError::EmptyProtocols);
        }
        if self.max_connections < 1 {
            return Err(ConfigError::InvalidMaxConnections);
        }
        if self.connection_timeout < 1 {
            return Err(ConfigError::InvalidConnectionTimeout);
        }
        if self.idle_timeout < 1 {
            return Err(ConfigError::InvalidIdleTimeout);
        }
        if self.buffer_size < 512 {
            return Err(ConfigError::InvalidBufferSize);
        }
        if let Some(auth) = &self.auth {
            if auth.enabled {
                if auth.users.is_empty() {
                    return Err(ConfigError::AuthNoUsers);
                }
                for (user, pass) in &auth.users {
                    if user.is_empty() || pass.is_empty() {
                        return Err(ConfigError::AuthBlankCredential(user.clone()));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn socks5_enabled(&self) -> bool {
        self.protocols.contains(&Protocol::Socks5)
    }

    pub fn http_enabled(&self) -> bool {
        self.protocols.contains(&Protocol::Http) || self.protocols.contains(&Protocol::Https)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ProxyConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.port, 7899);
        assert_eq!(config.buffer_size, 8192);
    }

    #[test]
    fn round_trip_default_config() {
        let config = ProxyConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: ProxyConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config.host, parsed.host);
        assert_eq!(config.port, parsed.port);
        assert_eq!(config.protocols, parsed.protocols);
        assert_eq!(config.max_connections, parsed.max_connections);
        assert_eq!(config.buffer_size, parsed.buffer_size);
    }

    #[test]
    fn rejects_zero_port() {
        let mut config = ProxyConfig::default();
        config.port = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidPort)));
    }

    #[test]
    fn rejects_undersized_buffer() {
        let mut config = ProxyConfig::default();
        config.buffer_size = 511;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBufferSize)
        ));
    }

    #[test]
    fn rejects_auth_enabled_without_users() {
        let mut config = ProxyConfig::default();
        config.auth = Some(AuthConfig {
            enabled: true,
            ..Default::default()
        });
        assert!(matches!(config.validate(), Err(ConfigError::AuthNoUsers)));
    }

    #[test]
    fn accepts_populated_auth() {
        let mut config = ProxyConfig::default();
        let mut users = HashMap::new();
        users.insert("alice".to_string(), "hunter2".to_string());
        config.auth = Some(AuthConfig {
            enabled: true,
            users,
            ..Default::default()
        });
        assert!(config.validate().is_ok());
    }
}
