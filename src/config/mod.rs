//! Configuration management
//!
//! Layered: built-in defaults, then an optional TOML file, then
//! `SIPBRIDGE__`-prefixed environment variables (`__` separates sections,
//! e.g. `SIPBRIDGE__MEDIA__MODE=local`).

use crate::application::CallBridgeConfig;
use crate::infrastructure::media::RtpMediaServerConfig;
use crate::infrastructure::protocols::sip::SipServerConfig;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sip: SipConfig,
    pub registrar: RegistrarConfig,
    pub bridge: BridgeConfig,
    pub media: MediaConfig,
    pub metrics: MetricsConfig,
    /// Filter used when `RUST_LOG` is unset
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sip: SipConfig::default(),
            registrar: RegistrarConfig::default(),
            bridge: BridgeConfig::default(),
            media: MediaConfig::default(),
            metrics: MetricsConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SipConfig {
    pub bind: SocketAddr,
    pub advertised_host: Option<String>,
    pub domain: String,
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 5060)),
            advertised_host: None,
            domain: "localhost".to_string(),
        }
    }
}

impl SipConfig {
    pub fn server_config(&self) -> SipServerConfig {
        SipServerConfig {
            bind: self.bind,
            advertised_host: self.advertised_host.clone(),
            domain: self.domain.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrarConfig {
    pub sweep_interval_secs: u64,
    pub max_expires: u32,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 30,
            max_expires: 3600,
        }
    }
}

impl RegistrarConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub ring_timeout_secs: u64,
    pub late_answer_grace_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let defaults = CallBridgeConfig::default();
        Self {
            ring_timeout_secs: defaults.ring_timeout.as_secs(),
            late_answer_grace_secs: defaults.late_answer_grace.as_secs(),
        }
    }
}

impl BridgeConfig {
    pub fn bridge_config(&self) -> CallBridgeConfig {
        CallBridgeConfig {
            ring_timeout: Duration::from_secs(self.ring_timeout_secs),
            late_answer_grace: Duration::from_secs(self.late_answer_grace_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaMode {
    /// Forward SDP to an external relay over the ng protocol
    #[default]
    Relay,
    /// Terminate media on local RTP endpoints
    Local,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub mode: MediaMode,
    pub relay: RelayConfig,
    pub local: LocalMediaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub address: SocketAddr,
    pub timeout_ms: u64,
    pub strip_ice: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([127, 0, 0, 1], 2223)),
            timeout_ms: 1000,
            strip_ice: true,
        }
    }
}

impl RelayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalMediaConfig {
    pub bind_ip: IpAddr,
    pub advertise_ip: IpAddr,
    pub port_min: u16,
    pub port_max: u16,
}

impl Default for LocalMediaConfig {
    fn default() -> Self {
        let defaults = RtpMediaServerConfig::default();
        Self {
            bind_ip: defaults.bind_ip,
            advertise_ip: defaults.advertise_ip,
            port_min: defaults.port_min,
            port_max: defaults.port_max,
        }
    }
}

impl LocalMediaConfig {
    pub fn server_config(&self) -> RtpMediaServerConfig {
        RtpMediaServerConfig {
            bind_ip: self.bind_ip,
            advertise_ip: self.advertise_ip,
            port_min: self.port_min,
            port_max: self.port_max,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus scrape address; no exporter when unset
    pub listen: Option<SocketAddr>,
}

impl Config {
    /// Defaults, overlaid by `path` (if any) and the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ::config::ConfigError> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        let config: Config = builder
            .add_source(
                ::config::Environment::with_prefix("SIPBRIDGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ::config::ConfigError> {
        let invalid = |msg: &str| Err(::config::ConfigError::Message(msg.to_string()));

        if self.local_port_range_is_empty() {
            return invalid("media.local.port_min must not exceed media.local.port_max");
        }
        if self.bridge.ring_timeout_secs == 0 {
            return invalid("bridge.ring_timeout_secs must be positive");
        }
        if self.registrar.max_expires == 0 {
            return invalid("registrar.max_expires must be positive");
        }
        Ok(())
    }

    fn local_port_range_is_empty(&self) -> bool {
        self.media.mode == MediaMode::Local && self.media.local.port_min > self.media.local.port_max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.sip.bind.port(), 5060);
        assert_eq!(config.media.mode, MediaMode::Relay);
        assert_eq!(config.bridge.bridge_config().ring_timeout, Duration::from_secs(60));
        assert_eq!(config.log_level, "info");
        assert!(config.metrics.listen.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("sipbridge-{}.toml", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
log_level = "debug"

[sip]
bind = "127.0.0.1:5070"
domain = "example.com"

[bridge]
ring_timeout_secs = 20

[media]
mode = "local"

[media.local]
port_min = 40000
port_max = 40100
"#
        )
        .unwrap();
        drop(file);

        let config = Config::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.sip.bind, "127.0.0.1:5070".parse().unwrap());
        assert_eq!(config.sip.domain, "example.com");
        assert_eq!(config.bridge.ring_timeout_secs, 20);
        // Untouched keys keep their defaults
        assert_eq!(config.bridge.late_answer_grace_secs, 32);
        assert_eq!(config.media.mode, MediaMode::Local);
        assert_eq!(config.media.local.server_config().port_min, 40000);
        assert_eq!(config.registrar.max_expires, 3600);
    }

    #[test]
    fn test_rejects_inverted_port_range() {
        let path = std::env::temp_dir().join(format!("sipbridge-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            "[media]\nmode = \"local\"\n[media.local]\nport_min = 5000\nport_max = 4000\n",
        )
        .unwrap();

        let result = Config::load(Some(&path));
        std::fs::remove_file(&path).ok();
        assert!(result.is_err());
    }
}
