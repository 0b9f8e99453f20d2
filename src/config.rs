//! Configuration loading and types for corral.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! system: networking, the cluster data directory, and logging.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Cluster settings.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            cluster: ClusterConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Per-request network timeout in seconds.  Every outbound call
    /// (peer dial, forwarded request) carries a deadline derived from
    /// this value.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout: default_request_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Cluster configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Data directory holding `server.crt`, `server.key` and the
    /// consensus state under `raft/`.
    #[serde(default = "default_var_dir")]
    pub var_dir: PathBuf,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            var_dir: default_var_dir(),
        }
    }
}

impl ClusterConfig {
    /// Path of a file directly under the data directory.
    pub fn var_path(&self, name: &str) -> PathBuf {
        self.var_dir.join(name)
    }

    /// The consensus state directory, removed wholesale on cluster-leave.
    pub fn raft_dir(&self) -> PathBuf {
        self.var_dir.join("raft")
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8443
}

fn default_request_timeout() -> u64 {
    30
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_var_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8443);
        assert_eq!(config.server.request_timeout, 30);
        assert_eq!(config.cluster.var_dir, PathBuf::from("./data"));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_override() {
        let yaml = "
server:
  port: 9443
cluster:
  var_dir: /var/lib/corral
";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.port, 9443);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(
            config.cluster.raft_dir(),
            PathBuf::from("/var/lib/corral/raft")
        );
        assert_eq!(
            config.cluster.var_path("server.crt"),
            PathBuf::from("/var/lib/corral/server.crt")
        );
    }
}
