//! Configuration file support for tracerouted
//!
//! Loads and validates daemon configuration from TOML files.
//! Default location: /etc/sonic/tracerouted.toml

use crate::error::{Result, TraceError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/sonic/tracerouted.toml";

/// How an intercepted probe is sent on toward the next hop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ForwardingMode {
    /// Re-emit at the upstream switch with an explicit egress port toward
    /// the switch that intercepted it.
    #[default]
    EgressPort,
    /// Re-emit at the intercepting switch through its normal pipeline.
    Pipeline,
}

/// Trace session tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceConfig {
    /// Quiet period that ends a session, in milliseconds
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    #[serde(default)]
    pub forwarding_mode: ForwardingMode,

    /// Restarts allowed per request before giving up (0 = unbounded)
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Capacity of the interception and topology event queues
    #[serde(default = "default_event_queue_depth")]
    pub event_queue_depth: usize,
}

/// REST front-end settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Prefix for every route, without a trailing slash
    #[serde(default = "default_base_path")]
    pub base_path: String,
}

/// Complete tracerouted configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracerouteConfig {
    #[serde(default)]
    pub trace: TraceConfig,

    #[serde(default)]
    pub rest: RestConfig,

    /// Default log filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// Default functions
fn default_idle_timeout_ms() -> u64 {
    1000
}

fn default_max_restarts() -> u32 {
    16
}

fn default_event_queue_depth() -> usize {
    1024
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_base_path() -> String {
    "/wm/traceroute".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout_ms(),
            forwarding_mode: ForwardingMode::default(),
            max_restarts: default_max_restarts(),
            event_queue_depth: default_event_queue_depth(),
        }
    }
}

impl TraceConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            base_path: default_base_path(),
        }
    }
}

impl Default for TracerouteConfig {
    fn default() -> Self {
        Self {
            trace: TraceConfig::default(),
            rest: RestConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl TracerouteConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        Ok(Self::load(path)?.unwrap_or_else(|| {
            warn!(path = %path.display(), "Config file not found, using defaults");
            Self::default()
        }))
    }

    /// Load configuration from file. `None` when the file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => Self::from_toml_str(&content).map(Some).map_err(|e| match e {
                TraceError::Configuration(msg) => {
                    TraceError::configuration(format!("{}: {}", path.display(), msg))
                }
                other => other,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TraceError::Io(e)),
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| TraceError::configuration(format!("failed to parse: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.trace.idle_timeout_ms == 0 {
            return Err(TraceError::configuration("idle_timeout_ms must be > 0"));
        }

        if self.trace.event_queue_depth == 0 {
            return Err(TraceError::configuration("event_queue_depth must be > 0"));
        }

        let base = &self.rest.base_path;
        if !base.starts_with('/') || (base.len() > 1 && base.ends_with('/')) {
            return Err(TraceError::configuration(format!(
                "base_path must start with '/' and not end with one: {}",
                base
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = TracerouteConfig::default();
        assert_eq!(config.trace.idle_timeout(), Duration::from_secs(1));
        assert_eq!(config.trace.forwarding_mode, ForwardingMode::EgressPort);
        assert_eq!(config.trace.max_restarts, 16);
        assert_eq!(config.rest.listen_addr.port(), 8080);
        assert_eq!(config.rest.base_path, "/wm/traceroute");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_deserialization() {
        let toml_str = r#"
log_level = "debug"

[trace]
forwarding_mode = "pipeline"
idle_timeout_ms = 250
"#;
        let config = TracerouteConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.trace.forwarding_mode, ForwardingMode::Pipeline);
        assert_eq!(config.trace.idle_timeout(), Duration::from_millis(250));
        // Unspecified values should use defaults
        assert_eq!(config.trace.event_queue_depth, 1024);
        assert_eq!(config.rest.base_path, "/wm/traceroute");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = TracerouteConfig::default();
        config.trace.idle_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = TracerouteConfig::default();
        config.rest.base_path = "wm/traceroute/".to_string();
        assert!(config.validate().is_err());

        assert!(TracerouteConfig::from_toml_str("[trace]\nforwarding_mode = \"flood\"").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[rest]\nlisten_addr = \"0.0.0.0:9000\"").unwrap();

        let config = TracerouteConfig::load_or_default(file.path()).unwrap();
        assert_eq!(config.rest.listen_addr, "0.0.0.0:9000".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_load_reports_missing_file() {
        assert!(TracerouteConfig::load("/nonexistent/tracerouted.toml")
            .unwrap()
            .is_none());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "log_level = \"warn\"").unwrap();
        let config = TracerouteConfig::load(file.path()).unwrap().unwrap();
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_load_nonexistent_file_defaults() {
        let config = TracerouteConfig::load_or_default("/nonexistent/tracerouted.toml").unwrap();
        assert_eq!(config.trace.max_restarts, 16);
    }
}
