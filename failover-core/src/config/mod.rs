//! Configuration for the failover engine
//!
//! Loaded from TOML, overridable through environment variables and validated
//! before the engine is built. Every section uses `#[serde(default)]`, so a
//! config file only needs to name what differs from the defaults.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{FailoverError, FailoverResult};

pub mod defaults;

pub use defaults::*;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Name of this node as it appears in cluster messages
    pub node_name: String,

    /// Other cluster members (the negotiating peer plus any ping nodes)
    pub nodes: Vec<PeerNodeConfig>,

    /// When false the engine only relays notifications and never runs
    /// resource scripts
    pub manage_resources: bool,

    pub failback: FailbackConfig,

    pub scripts: ScriptConfig,

    /// Fencing device; `None` means shared storage is unprotected
    pub fencing: Option<FencingConfig>,

    pub timing: TimingConfig,

    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerNodeConfig {
    pub name: String,

    /// Ping nodes only witness connectivity; they never hold resources
    #[serde(default)]
    pub ping: bool,

    /// Whether the node has resource groups assigned to it (legacy mode
    /// uses this to decide if fencing is needed)
    #[serde(default = "default_true")]
    pub has_resources: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailbackConfig {
    /// Negotiated takeover instead of unconditional takeover on start
    pub nice_failback: bool,

    /// Return foreign resources to their owner once it is stable again
    pub auto_failback: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptConfig {
    /// Resource manager entry point (listkeys/ourkeys/otherkeys/allkeys/
    /// takegroup/givegroup)
    pub resource_manager: PathBuf,

    /// Notification entry point, invoked with the lower-cased message type
    pub notify_script: PathBuf,

    /// Directory whose entries name the message types worth notifying
    pub notify_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FencingConfig {
    /// Human readable device identifier for logs
    #[serde(default = "default_device_id")]
    pub device_id: String,

    /// Program driving the fencing device
    pub command: PathBuf,

    /// Leading arguments; the operation (`reset <node>` or `status`) is
    /// appended
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_device_id() -> String {
    "fencing-device".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Deadline for the peer to answer our own standby request
    #[serde(with = "humantime_serde")]
    pub standby_request_timeout: Duration,

    /// Deadline while resources are being released or acquired for standby
    #[serde(with = "humantime_serde")]
    pub standby_resource_timeout: Duration,

    /// How long to wait after the peer's first report before taking our
    /// local resources without the peer becoming stable
    #[serde(with = "humantime_serde")]
    pub local_takeover_delay: Duration,

    #[serde(with = "humantime_serde")]
    pub fence_retry_delay: Duration,

    #[serde(with = "humantime_serde")]
    pub fence_status_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub failback_retry_delay: Duration,

    #[serde(with = "humantime_serde")]
    pub final_shutdown_delay: Duration,

    /// Granularity of the node driver's timer checks
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            nodes: Vec::new(),
            manage_resources: DEFAULT_MANAGE_RESOURCES,
            failback: FailbackConfig::default(),
            scripts: ScriptConfig::default(),
            fencing: None,
            timing: TimingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for FailbackConfig {
    fn default() -> Self {
        Self {
            nice_failback: DEFAULT_NICE_FAILBACK,
            auto_failback: DEFAULT_AUTO_FAILBACK,
        }
    }
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            resource_manager: PathBuf::from(DEFAULT_RESOURCE_MANAGER),
            notify_script: PathBuf::from(DEFAULT_NOTIFY_SCRIPT),
            notify_dir: PathBuf::from(DEFAULT_NOTIFY_DIR),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            standby_request_timeout: duration_ms(DEFAULT_STANDBY_REQUEST_TIMEOUT_MS),
            standby_resource_timeout: duration_secs(DEFAULT_STANDBY_RESOURCE_TIMEOUT_SECS),
            local_takeover_delay: duration_secs(DEFAULT_LOCAL_TAKEOVER_DELAY_SECS),
            fence_retry_delay: duration_secs(DEFAULT_FENCE_RETRY_DELAY_SECS),
            fence_status_interval: duration_secs(DEFAULT_FENCE_STATUS_INTERVAL_SECS),
            failback_retry_delay: duration_ms(DEFAULT_FAILBACK_RETRY_DELAY_MS),
            final_shutdown_delay: duration_ms(DEFAULT_FINAL_SHUTDOWN_DELAY_MS),
            tick_interval: duration_ms(DEFAULT_TICK_INTERVAL_MS),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl FailoverConfig {
    /// Load configuration from a TOML file, apply environment overrides and
    /// validate the result
    pub fn from_file<P: AsRef<Path>>(path: P) -> FailoverResult<Self> {
        let contents = fs::read_to_string(path.as_ref()).map_err(|e| {
            FailoverError::configuration(
                "file",
                format!("Failed to read {}: {}", path.as_ref().display(), e),
            )
        })?;
        let mut config: FailoverConfig = toml::from_str(&contents)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) -> FailoverResult<()> {
        if let Ok(name) = std::env::var("FAILOVER_NODE_NAME") {
            self.node_name = name;
        }
        if let Ok(level) = std::env::var("FAILOVER_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(value) = std::env::var("FAILOVER_NICE_FAILBACK") {
            self.failback.nice_failback = parse_bool_env("FAILOVER_NICE_FAILBACK", &value)?;
        }
        if let Ok(value) = std::env::var("FAILOVER_AUTO_FAILBACK") {
            self.failback.auto_failback = parse_bool_env("FAILOVER_AUTO_FAILBACK", &value)?;
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> FailoverResult<()> {
        if self.node_name.trim().is_empty() {
            return Err(FailoverError::configuration(
                "node_name",
                "node name must not be empty",
            ));
        }

        if self.nodes.iter().any(|n| n.name == self.node_name) {
            return Err(FailoverError::configuration(
                "nodes",
                format!("node '{}' cannot be listed as its own peer", self.node_name),
            ));
        }

        let peers = self.nodes.iter().filter(|n| !n.ping).count();
        if peers > 1 {
            return Err(FailoverError::configuration(
                "nodes",
                format!(
                    "resource negotiation supports a single peer, {} configured",
                    peers
                ),
            ));
        }

        let timing = &self.timing;
        for (name, value) in [
            ("standby_request_timeout", timing.standby_request_timeout),
            ("standby_resource_timeout", timing.standby_resource_timeout),
            ("local_takeover_delay", timing.local_takeover_delay),
            ("fence_retry_delay", timing.fence_retry_delay),
            ("fence_status_interval", timing.fence_status_interval),
            ("tick_interval", timing.tick_interval),
        ] {
            if value.is_zero() {
                return Err(FailoverError::configuration(
                    format!("timing.{}", name),
                    "must be greater than zero",
                ));
            }
        }

        if timing.standby_request_timeout >= timing.standby_resource_timeout {
            return Err(FailoverError::configuration(
                "timing.standby_request_timeout",
                "must be shorter than standby_resource_timeout",
            ));
        }

        if let Some(fencing) = &self.fencing {
            if fencing.command.as_os_str().is_empty() {
                return Err(FailoverError::configuration(
                    "fencing.command",
                    "fencing command must not be empty",
                ));
            }
        }

        Ok(())
    }

    /// The peer this node negotiates resources with, if any
    pub fn peer(&self) -> Option<&PeerNodeConfig> {
        self.nodes.iter().find(|n| !n.ping)
    }

    pub fn nice_failback(&self) -> bool {
        self.failback.nice_failback
    }

    pub fn auto_failback(&self) -> bool {
        self.failback.auto_failback
    }

    /// Create a test configuration for `node` negotiating with `peer`
    pub fn test(node: &str, peer: &str) -> Self {
        let mut config = Self::default();
        config.node_name = node.to_string();
        config.nodes = vec![PeerNodeConfig {
            name: peer.to_string(),
            ping: false,
            has_resources: true,
        }];
        config.scripts.resource_manager = PathBuf::from("/bin/true");
        config.scripts.notify_script = PathBuf::from("/bin/true");
        config.scripts.notify_dir = PathBuf::from("/nonexistent");
        config
    }
}

fn parse_bool_env(key: &str, value: &str) -> FailoverResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(FailoverError::configuration(
            key,
            format!("expected a boolean, got '{}'", other),
        )),
    }
}

/// Builder for FailoverConfig
pub struct FailoverConfigBuilder {
    config: FailoverConfig,
}

impl FailoverConfigBuilder {
    pub fn new(node_name: impl Into<String>) -> Self {
        let mut config = FailoverConfig::default();
        config.node_name = node_name.into();
        Self { config }
    }

    pub fn peer(mut self, name: impl Into<String>) -> Self {
        self.config.nodes.push(PeerNodeConfig {
            name: name.into(),
            ping: false,
            has_resources: true,
        });
        self
    }

    pub fn ping_node(mut self, name: impl Into<String>) -> Self {
        self.config.nodes.push(PeerNodeConfig {
            name: name.into(),
            ping: true,
            has_resources: false,
        });
        self
    }

    pub fn nice_failback(mut self, enabled: bool) -> Self {
        self.config.failback.nice_failback = enabled;
        self
    }

    pub fn auto_failback(mut self, enabled: bool) -> Self {
        self.config.failback.auto_failback = enabled;
        self
    }

    pub fn fencing(mut self, fencing: FencingConfig) -> Self {
        self.config.fencing = Some(fencing);
        self
    }

    pub fn scripts(mut self, scripts: ScriptConfig) -> Self {
        self.config.scripts = scripts;
        self
    }

    pub fn timing(mut self, timing: TimingConfig) -> Self {
        self.config.timing = timing;
        self
    }

    pub fn build(self) -> FailoverResult<FailoverConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
