//! Configuration handling for the reliable messaging node.
//!
//! Settings come from an optional YAML file, then `RM_*` environment
//! variables, then command-line flags (applied by `main`).

use anyhow::{Context, Result};
use rm_session::{ListenerConfig, ReliableSessionConfig};
use rm_wire::{EndpointAddress, ProtocolVersion};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address `listen` binds
    pub listen: SocketAddr,
    /// Address `send` dials
    pub connect: SocketAddr,
    /// Protocol version: "1.1" or "2005"
    pub version: String,
    /// Deliver in order
    pub ordered: bool,
    /// Transfer window size
    pub window: usize,
    /// Retransmissions before a session faults
    pub max_retry_count: u32,
    /// First retransmission delay, e.g. "200ms"
    pub retry_interval: String,
    /// Acknowledgement batching delay
    pub ack_interval: String,
    /// Fault a silent session after this long
    pub inactivity_timeout: String,
    /// Concurrent sessions accepted by `listen`
    pub max_sessions: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 9400)),
            connect: SocketAddr::from(([127, 0, 0, 1], 9400)),
            version: "1.1".to_string(),
            ordered: true,
            window: 32,
            max_retry_count: 8,
            retry_interval: "200ms".to_string(),
            ack_interval: "200ms".to_string(),
            inactivity_timeout: "10m".to_string(),
            max_sessions: 1024,
        }
    }
}

fn parse_duration(name: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).with_context(|| format!("invalid {} {:?}", name, value))
}

impl NodeConfig {
    /// Load from `path` (if given) and apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let config = serde_yaml::from_str(&content)
                    .with_context(|| format!("failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                Ok(config)
            }
            Err(e) => {
                warn!("Config file {:?} not readable ({}), using defaults", path, e);
                Ok(Self::default())
            }
        }
    }

    /// Apply `RM_*` overrides; values that do not parse are ignored
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup("RM_LISTEN").and_then(|v| v.parse().ok()) {
            self.listen = addr;
            info!("Listen address overridden by environment: {}", addr);
        }
        if let Some(addr) = lookup("RM_CONNECT").and_then(|v| v.parse().ok()) {
            self.connect = addr;
            info!("Connect address overridden by environment: {}", addr);
        }
        if let Some(version) = lookup("RM_VERSION") {
            info!("Protocol version overridden by environment: {}", version);
            self.version = version;
        }
        if let Some(ordered) = lookup("RM_ORDERED").and_then(|v| v.to_lowercase().parse().ok()) {
            self.ordered = ordered;
        }
        if let Some(window) = lookup("RM_WINDOW").and_then(|v| v.parse().ok()) {
            self.window = window;
            info!("Transfer window overridden by environment: {}", window);
        }
    }

    /// Session settings derived from the node configuration
    pub fn session_config(&self) -> Result<ReliableSessionConfig> {
        let version: ProtocolVersion = self
            .version
            .parse()
            .with_context(|| format!("unknown protocol version {:?}", self.version))?;

        let config = ReliableSessionConfig {
            version,
            ordered: self.ordered,
            max_transfer_window_size: self.window,
            max_retry_count: self.max_retry_count,
            initial_retry_interval: parse_duration("retry_interval", &self.retry_interval)?,
            acknowledgement_interval: parse_duration("ack_interval", &self.ack_interval)?,
            inactivity_timeout: parse_duration("inactivity_timeout", &self.inactivity_timeout)?,
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Listener settings for `listen`
    pub fn listener_config(&self) -> Result<ListenerConfig> {
        Ok(ListenerConfig {
            session: self.session_config()?,
            local_address: EndpointAddress::new(format!("rm://{}", self.listen)),
            max_sessions: self.max_sessions,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.listen.port(), 9400);
        assert_eq!(config.window, 32);

        let session = config.session_config().unwrap();
        assert_eq!(session.version, ProtocolVersion::WsReliableMessaging11);
        assert_eq!(session.inactivity_timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
listen: "0.0.0.0:9500"
version: "2005"
ordered: false
retry_interval: 50ms
"#;
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = NodeConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(config.listen.port(), 9500);
        assert!(!config.ordered);
        assert_eq!(config.window, 32);

        let session = config.session_config().unwrap();
        assert_eq!(session.version, ProtocolVersion::WsrmFebruary2005);
        assert_eq!(session.initial_retry_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("RM_CONNECT", "10.0.0.2:9401"),
            ("RM_ORDERED", "FALSE"),
            ("RM_WINDOW", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = NodeConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.connect.port(), 9401);
        assert!(!config.ordered);
        assert_eq!(config.window, 32);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let config = NodeConfig {
            window: 0,
            ..Default::default()
        };
        assert!(config.session_config().is_err());

        let config = NodeConfig {
            retry_interval: "soon".to_string(),
            ..Default::default()
        };
        assert!(config.session_config().is_err());
    }
}
