//! RelayMesh configuration
//!
//! Layered TOML configuration with CLI overrides, mirroring the teacher's
//! `WolfScaleConfig` shape: one struct per concern, `serde(default = "fn")`
//! for every tunable, and a thin `from_file`/`from_str`/`validate` surface.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Full node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier; orders peers for Bully election.
    pub node_id: u64,

    /// Port the node binds for client/broker request traffic.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Address to bind for client/broker request traffic.
    #[serde(default)]
    pub bind_address: Option<String>,

    /// Address other nodes/clients should use to reach this node, if
    /// different from `bind_address` (NAT / container setups).
    #[serde(default)]
    pub advertise_address: Option<String>,

    /// Data directory for the four snapshot files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub registry: RegistryClientConfig,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub proxy: ProxyFabricConfig,

    #[serde(default)]
    pub replication: ReplicationConfig,

    #[serde(default)]
    pub timing: TimingConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How a node reaches the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryClientConfig {
    #[serde(default = "default_registry_host")]
    pub host: String,
    #[serde(default = "default_registry_port")]
    pub port: u16,
}

impl Default for RegistryClientConfig {
    fn default() -> Self {
        Self {
            host: default_registry_host(),
            port: default_registry_port(),
        }
    }
}

/// The standalone registry process's own configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_port")]
    pub port: u16,

    /// Eviction threshold (T_evict in SPEC_FULL.md §4.1).
    #[serde(default = "default_heartbeat_timeout_s")]
    pub heartbeat_timeout_s: u64,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            port: default_registry_port(),
            heartbeat_timeout_s: default_heartbeat_timeout_s(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Request fabric (broker) connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_host")]
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
        }
    }
}

/// Publish fabric (XSUB/XPUB proxy) connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyFabricConfig {
    #[serde(default = "default_proxy_host")]
    pub host: String,
    #[serde(default = "default_proxy_port")]
    pub port: u16,
}

impl Default for ProxyFabricConfig {
    fn default() -> Self {
        Self {
            host: default_proxy_host(),
            port: default_proxy_port(),
        }
    }
}

/// Peer replication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Publish bind port for this node's replication stream.
    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default = "default_pull_sync_interval_s")]
    pub pull_sync_interval_s: u64,

    #[serde(default = "default_pull_sync_startup_delay_s")]
    pub pull_sync_startup_delay_s: u64,

    /// Below this cardinality, message/publication logs participate in pull-sync.
    #[serde(default = "default_log_sync_watermark")]
    pub log_sync_watermark: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            port: None,
            pull_sync_interval_s: default_pull_sync_interval_s(),
            pull_sync_startup_delay_s: default_pull_sync_startup_delay_s(),
            log_sync_watermark: default_log_sync_watermark(),
        }
    }
}

/// Timing knobs for heartbeat, election, and Berkeley sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_timeout_s")]
    pub heartbeat_timeout_s: u64,
    #[serde(default = "default_leader_dead_s")]
    pub leader_dead_s: u64,
    #[serde(default = "default_election_reply_ms")]
    pub election_reply_ms: u64,
    #[serde(default = "default_await_coordinator_s")]
    pub await_coordinator_s: u64,
    #[serde(default = "default_coordinator_suppress_s")]
    pub coordinator_suppress_s: u64,
    #[serde(default = "default_berkeley_every_n")]
    pub berkeley_every_n: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_s: default_heartbeat_timeout_s(),
            leader_dead_s: default_leader_dead_s(),
            election_reply_ms: default_election_reply_ms(),
            await_coordinator_s: default_await_coordinator_s(),
            coordinator_suppress_s: default_coordinator_suppress_s(),
            berkeley_every_n: default_berkeley_every_n(),
        }
    }
}

/// Ambient HTTP status surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_address")]
    pub bind_address: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_port() -> u16 {
    5555
}
fn default_registry_host() -> String {
    "127.0.0.1".to_string()
}
fn default_registry_port() -> u16 {
    5559
}
fn default_broker_host() -> String {
    "127.0.0.1".to_string()
}
fn default_broker_port() -> u16 {
    5570
}
fn default_proxy_host() -> String {
    "127.0.0.1".to_string()
}
fn default_proxy_port() -> u16 {
    5580
}
fn default_heartbeat_interval_ms() -> u64 {
    3000
}
fn default_heartbeat_timeout_s() -> u64 {
    10
}
fn default_leader_dead_s() -> u64 {
    10
}
fn default_election_reply_ms() -> u64 {
    1500
}
fn default_await_coordinator_s() -> u64 {
    3
}
fn default_coordinator_suppress_s() -> u64 {
    2
}
fn default_berkeley_every_n() -> u64 {
    10
}
fn default_pull_sync_interval_s() -> u64 {
    30
}
fn default_pull_sync_startup_delay_s() -> u64 {
    15
}
fn default_log_sync_watermark() -> usize {
    1000
}
fn default_true() -> bool {
    true
}
fn default_api_address() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl NodeConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string.
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: NodeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.node_id == 0 {
            return Err(crate::Error::Config("node_id must be non-zero".into()));
        }
        Ok(())
    }

    /// Minimal default config for a given node id and port, used by `config init`.
    pub fn default_for(node_id: u64, port: u16) -> Self {
        Self {
            node_id,
            port,
            bind_address: None,
            advertise_address: None,
            data_dir: PathBuf::from(format!("./data/{node_id}")),
            registry: RegistryClientConfig::default(),
            broker: BrokerConfig::default(),
            proxy: ProxyFabricConfig::default(),
            replication: ReplicationConfig::default(),
            timing: TimingConfig::default(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn bind_address(&self) -> String {
        self.bind_address
            .clone()
            .unwrap_or_else(|| format!("0.0.0.0:{}", self.port))
    }

    pub fn advertise_address(&self) -> String {
        self.advertise_address
            .clone()
            .unwrap_or_else(|| self.bind_address())
    }

    pub fn replication_port(&self) -> u16 {
        self.replication.port.unwrap_or(self.port + 1000)
    }

    pub fn data_dir(&self) -> &PathBuf {
        &self.data_dir
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.timing.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.timing.heartbeat_timeout_s)
    }

    pub fn leader_dead(&self) -> Duration {
        Duration::from_secs(self.timing.leader_dead_s)
    }

    pub fn election_reply_timeout(&self) -> Duration {
        Duration::from_millis(self.timing.election_reply_ms)
    }

    pub fn await_coordinator(&self) -> Duration {
        Duration::from_secs(self.timing.await_coordinator_s)
    }

    pub fn coordinator_suppress(&self) -> Duration {
        Duration::from_secs(self.timing.coordinator_suppress_s)
    }

    pub fn pull_sync_interval(&self) -> Duration {
        Duration::from_secs(self.replication.pull_sync_interval_s)
    }

    pub fn pull_sync_startup_delay(&self) -> Duration {
        Duration::from_secs(self.replication.pull_sync_startup_delay_s)
    }
}
