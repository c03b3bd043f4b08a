//! Configuration management for peerwarden.
//!
//! Settings are read from a TOML file. Every field has a serde default so a
//! partial file (or no file at all) yields a usable configuration; `load`
//! validates what it reads. Address ranges and CIDRs are carried as strings
//! here and parsed into typed values by the engine.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] io::Error),

    /// Error parsing TOML configuration
    #[error("Failed to parse TOML config: {0}")]
    TomlError(#[from] toml::de::Error),

    /// Error serializing configuration to TOML
    #[error("Failed to serialize config to TOML: {0}")]
    TomlSerError(#[from] toml::ser::Error),

    /// Missing required configuration value
    #[error("Missing required configuration value: {0}")]
    MissingValue(String),

    /// Invalid configuration value
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    FileNotFound(PathBuf),
}

impl ConfigError {
    fn invalid(key: &str, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// One class-owned slice of the overlay network.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ClassRangeConfig {
    /// Node class name ("control-plane", "worker")
    pub class: String,

    /// Inclusive address range, e.g. "10.100.1.1-10.100.1.253"
    pub range: String,
}

/// Overlay addressing settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Whole overlay network (default: "10.100.0.0/16")
    #[serde(default = "default_overlay_cidr")]
    pub overlay_cidr: String,

    /// Address of the server side of the tunnel (default: "10.100.0.1")
    #[serde(default = "default_server_address")]
    pub server_address: String,

    /// Per-class address ranges
    #[serde(default = "default_classes")]
    pub classes: Vec<ClassRangeConfig>,

    /// Peers inside this range get an explicit host route on the interface
    #[serde(default = "default_routed_range")]
    pub routed_range: Option<String>,
}

fn default_overlay_cidr() -> String {
    "10.100.0.0/16".to_string()
}

fn default_server_address() -> String {
    "10.100.0.1".to_string()
}

fn default_classes() -> Vec<ClassRangeConfig> {
    vec![
        ClassRangeConfig {
            class: "control-plane".to_string(),
            range: "10.100.0.2-10.100.0.254".to_string(),
        },
        ClassRangeConfig {
            class: "worker".to_string(),
            range: "10.100.1.1-10.100.1.253".to_string(),
        },
    ]
}

fn default_routed_range() -> Option<String> {
    Some("10.100.1.1-10.100.1.253".to_string())
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            overlay_cidr: default_overlay_cidr(),
            server_address: default_server_address(),
            classes: default_classes(),
            routed_range: default_routed_range(),
        }
    }
}

/// Tunnel interface and control utility settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TunnelConfig {
    /// Interface name (default: "wg0")
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Persisted interface definition (default: "/config/wg0.conf")
    #[serde(default = "default_definition_path")]
    pub definition_path: String,

    /// `wg` executable
    #[serde(default = "default_wg_binary")]
    pub wg_binary: String,

    /// `wg-quick` executable
    #[serde(default = "default_wg_quick_binary")]
    pub wg_quick_binary: String,

    /// `ip` executable
    #[serde(default = "default_ip_binary")]
    pub ip_binary: String,

    /// Prepended to every control command, e.g. ["docker", "exec", "wireguard-server"]
    #[serde(default)]
    pub exec_prefix: Vec<String>,

    /// Upper bound for a single control command, in seconds (default: 10)
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

fn default_interface() -> String {
    "wg0".to_string()
}

fn default_definition_path() -> String {
    "/config/wg0.conf".to_string()
}

fn default_wg_binary() -> String {
    "wg".to_string()
}

fn default_wg_quick_binary() -> String {
    "wg-quick".to_string()
}

fn default_ip_binary() -> String {
    "ip".to_string()
}

fn default_command_timeout_secs() -> u64 {
    10
}

impl Default for TunnelConfig {
    fn default() -> Self {
        TunnelConfig {
            interface: default_interface(),
            definition_path: default_definition_path(),
            wg_binary: default_wg_binary(),
            wg_quick_binary: default_wg_quick_binary(),
            ip_binary: default_ip_binary(),
            exec_prefix: Vec::new(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

impl TunnelConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Settings used when rendering a peer's client configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PeerConfig {
    /// Server endpoint host, or "auto" to detect the routable address (default: "auto")
    #[serde(default = "default_server_endpoint")]
    pub server_endpoint: String,

    /// Server listen port (default: 51820)
    #[serde(default = "default_endpoint_port")]
    pub endpoint_port: u16,

    /// Host used when "auto" cannot be resolved and nothing resolved before (default: "localhost")
    #[serde(default = "default_fallback_host")]
    pub fallback_host: String,

    /// DNS servers pushed to peers
    #[serde(default = "default_dns")]
    pub dns: Vec<String>,

    /// Tunnel MTU (default: 1420)
    #[serde(default = "default_mtu")]
    pub mtu: u32,

    /// Persistent keepalive in seconds (default: 25)
    #[serde(default = "default_keepalive")]
    pub persistent_keepalive: u32,
}

fn default_server_endpoint() -> String {
    "auto".to_string()
}

fn default_endpoint_port() -> u16 {
    51820
}

fn default_fallback_host() -> String {
    "localhost".to_string()
}

fn default_dns() -> Vec<String> {
    vec!["8.8.8.8".to_string(), "8.8.4.4".to_string()]
}

fn default_mtu() -> u32 {
    1420
}

fn default_keepalive() -> u32 {
    25
}

impl Default for PeerConfig {
    fn default() -> Self {
        PeerConfig {
            server_endpoint: default_server_endpoint(),
            endpoint_port: default_endpoint_port(),
            fallback_host: default_fallback_host(),
            dns: default_dns(),
            mtu: default_mtu(),
            persistent_keepalive: default_keepalive(),
        }
    }
}

/// How reachability of a peer is decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    /// ICMP echo to the peer's overlay address
    #[default]
    Ping,
    /// Age of the latest handshake reported by the interface
    Handshake,
}

/// Upper bound accepted for `supervisor.max_attempts`.
pub const MAX_ATTEMPTS_LIMIT: u32 = 20;

/// Upper bound accepted for `supervisor.backoff_multiplier`.
pub const MAX_BACKOFF_MULTIPLIER: f64 = 10.0;

/// Connection supervision settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SupervisorConfig {
    /// Activation attempts before giving up (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay after the first failed attempt, in milliseconds (default: 5000)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Growth factor applied to the delay after every failed attempt (default: 1.5)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Longest pause between attempts, in milliseconds (default: 60000)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Wait between adding a peer and probing it, in milliseconds (default: 2000)
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Pause after stale-peer cleanup, in milliseconds (default: 1000)
    #[serde(default = "default_cleanup_delay_ms")]
    pub cleanup_delay_ms: u64,

    /// Minimum spacing of health checks for one node, in seconds (default: 30)
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,

    /// Reachability probe
    #[serde(default)]
    pub probe: ProbeKind,

    /// Ping timeout in seconds (default: 2)
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    /// Handshake age under which a peer counts as live, in seconds (default: 180)
    #[serde(default = "default_handshake_max_age_secs")]
    pub handshake_max_age_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    5_000
}

fn default_backoff_multiplier() -> f64 {
    1.5
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_settle_delay_ms() -> u64 {
    2_000
}

fn default_cleanup_delay_ms() -> u64 {
    1_000
}

fn default_health_check_interval_secs() -> u64 {
    30
}

fn default_probe_timeout_secs() -> u64 {
    2
}

fn default_handshake_max_age_secs() -> u64 {
    180
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            cleanup_delay_ms: default_cleanup_delay_ms(),
            health_check_interval_secs: default_health_check_interval_secs(),
            probe: ProbeKind::default(),
            probe_timeout_secs: default_probe_timeout_secs(),
            handshake_max_age_secs: default_handshake_max_age_secs(),
        }
    }
}

impl SupervisorConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.cleanup_delay_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn handshake_max_age(&self) -> Duration {
        Duration::from_secs(self.handshake_max_age_secs)
    }
}

/// Background monitor settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitorConfig {
    /// Class swept by the monitor; unset sweeps every class (default: "worker")
    #[serde(default = "default_monitor_class")]
    pub class: Option<String>,

    /// Node sweep period in seconds (default: 30)
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Stale-state reaper period in seconds (default: 60)
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,

    /// Time a node may stay in a transitional state, in seconds (default: 120)
    #[serde(default = "default_connecting_timeout_secs")]
    pub connecting_timeout_secs: u64,

    /// Reconnect disconnected/errored nodes after each sweep (default: false)
    #[serde(default)]
    pub auto_reconnect: bool,
}

fn default_monitor_class() -> Option<String> {
    Some("worker".to_string())
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_reap_interval_secs() -> u64 {
    60
}

fn default_connecting_timeout_secs() -> u64 {
    120
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            class: default_monitor_class(),
            sweep_interval_secs: default_sweep_interval_secs(),
            reap_interval_secs: default_reap_interval_secs(),
            connecting_timeout_secs: default_connecting_timeout_secs(),
            auto_reconnect: false,
        }
    }
}

impl MonitorConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn connecting_timeout(&self) -> Duration {
        Duration::from_secs(self.connecting_timeout_secs)
    }
}

/// Node store settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    /// JSON file holding nodes and tokens; unset keeps everything in memory
    #[serde(default = "default_store_path")]
    pub path: Option<String>,
}

fn default_store_path() -> Option<String> {
    Some("/var/lib/peerwarden/state.json".to_string())
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            path: default_store_path(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (default: "info")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of text (default: false)
    #[serde(default)]
    pub json: bool,

    /// Also write daily-rotated files into this directory
    #[serde(default)]
    pub directory: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            json: false,
            directory: None,
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub tunnel: TunnelConfig,

    #[serde(default)]
    pub peer: PeerConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Create a new default configuration
    pub fn new() -> Self {
        Config::default()
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        Ok(config)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_pool()?;

        if self.tunnel.interface.trim().is_empty() {
            return Err(ConfigError::MissingValue("tunnel.interface".to_string()));
        }
        if self.tunnel.definition_path.trim().is_empty() {
            return Err(ConfigError::MissingValue(
                "tunnel.definition_path".to_string(),
            ));
        }

        if self.peer.server_endpoint.trim().is_empty() {
            return Err(ConfigError::MissingValue("peer.server_endpoint".to_string()));
        }
        if !(576..=9000).contains(&self.peer.mtu) {
            return Err(ConfigError::invalid("peer.mtu", "must be between 576 and 9000"));
        }

        if self.supervisor.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "supervisor.max_attempts",
                "at least one attempt is required",
            ));
        }
        if self.supervisor.max_attempts > MAX_ATTEMPTS_LIMIT {
            return Err(ConfigError::invalid(
                "supervisor.max_attempts",
                format!("must be at most {MAX_ATTEMPTS_LIMIT}"),
            ));
        }
        if !(1.0..=MAX_BACKOFF_MULTIPLIER).contains(&self.supervisor.backoff_multiplier) {
            return Err(ConfigError::invalid(
                "supervisor.backoff_multiplier",
                format!("must be between 1.0 and {MAX_BACKOFF_MULTIPLIER}"),
            ));
        }
        if self.supervisor.max_delay_ms < self.supervisor.base_delay_ms {
            return Err(ConfigError::invalid(
                "supervisor.max_delay_ms",
                "must not be below supervisor.base_delay_ms",
            ));
        }

        if self.monitor.sweep_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "monitor.sweep_interval_secs",
                "must be greater than zero",
            ));
        }
        if self.monitor.reap_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "monitor.reap_interval_secs",
                "must be greater than zero",
            ));
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ConfigError::invalid(
                    "logging.level",
                    format!("unknown level {other}"),
                ))
            }
        }

        Ok(())
    }

    fn validate_pool(&self) -> Result<(), ConfigError> {
        let pool = &self.pool;

        if !pool.overlay_cidr.contains('/') {
            return Err(ConfigError::invalid(
                "pool.overlay_cidr",
                format!("{} is not in CIDR notation", pool.overlay_cidr),
            ));
        }
        pool.server_address.parse::<Ipv4Addr>().map_err(|e| {
            ConfigError::invalid("pool.server_address", format!("{}: {e}", pool.server_address))
        })?;

        if pool.classes.is_empty() {
            return Err(ConfigError::MissingValue("pool.classes".to_string()));
        }

        let mut seen = Vec::with_capacity(pool.classes.len());
        for entry in &pool.classes {
            if seen.contains(&entry.class) {
                return Err(ConfigError::invalid(
                    "pool.classes",
                    format!("class {} is listed twice", entry.class),
                ));
            }
            seen.push(entry.class.clone());
            parse_range(&entry.range)
                .map_err(|message| ConfigError::invalid("pool.classes.range", message))?;
        }

        if let Some(range) = &pool.routed_range {
            parse_range(range)
                .map_err(|message| ConfigError::invalid("pool.routed_range", message))?;
        }

        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("peerwarden").join("config.toml")
        } else {
            PathBuf::from("config.toml")
        }
    }
}

/// Parse an inclusive "first-last" IPv4 range.
pub fn parse_range(range: &str) -> Result<(Ipv4Addr, Ipv4Addr), String> {
    let (first, last) = range
        .split_once('-')
        .ok_or_else(|| format!("{range} is not of the form first-last"))?;
    let first: Ipv4Addr = first
        .trim()
        .parse()
        .map_err(|e| format!("{range}: {e}"))?;
    let last: Ipv4Addr = last
        .trim()
        .parse()
        .map_err(|e| format!("{range}: {e}"))?;
    if u32::from(first) > u32::from(last) {
        return Err(format!("{range}: first address is above last address"));
    }
    Ok((first, last))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.pool.overlay_cidr, "10.100.0.0/16");
        assert_eq!(config.pool.classes.len(), 2);
        assert_eq!(config.tunnel.interface, "wg0");
        assert_eq!(config.supervisor.max_attempts, 3);
        assert_eq!(config.supervisor.backoff_multiplier, 1.5);
        assert_eq!(config.monitor.class.as_deref(), Some("worker"));
        assert!(!config.monitor.auto_reconnect);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config() {
        let mut file = NamedTempFile::new().unwrap();

        let config_str = r#"
            [pool]
            overlay_cidr = "10.0.0.0/16"
            server_address = "10.0.0.1"
            routed_range = "10.0.1.2-10.0.1.5"

            [[pool.classes]]
            class = "worker"
            range = "10.0.1.2-10.0.1.5"

            [tunnel]
            interface = "wg1"
            exec_prefix = ["docker", "exec", "wireguard-server"]

            [supervisor]
            max_attempts = 5
            probe = "handshake"

            [logging]
            level = "debug"
        "#;

        file.write_all(config_str.as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.pool.overlay_cidr, "10.0.0.0/16");
        assert_eq!(config.pool.classes[0].class, "worker");
        assert_eq!(config.tunnel.interface, "wg1");
        assert_eq!(config.tunnel.exec_prefix.len(), 3);
        assert_eq!(config.tunnel.wg_binary, "wg");
        assert_eq!(config.supervisor.max_attempts, 5);
        assert_eq!(config.supervisor.probe, ProbeKind::Handshake);
        assert_eq!(config.supervisor.settle_delay(), Duration::from_secs(2));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_save_config() {
        let mut config = Config::default();
        config.tunnel.interface = "wg7".to_string();
        config.monitor.auto_reconnect = true;

        let file = NamedTempFile::new().unwrap();
        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.tunnel.interface, "wg7");
        assert!(loaded.monitor.auto_reconnect);
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.supervisor.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.supervisor.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pool.classes.push(ClassRangeConfig {
            class: "worker".to_string(),
            range: "10.100.2.1-10.100.2.9".to_string(),
        });
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_range() {
        let (first, last) = parse_range("10.0.1.2 - 10.0.1.5").unwrap();
        assert_eq!(first, Ipv4Addr::new(10, 0, 1, 2));
        assert_eq!(last, Ipv4Addr::new(10, 0, 1, 5));

        assert!(parse_range("10.0.1.5-10.0.1.2").is_err());
        assert!(parse_range("10.0.1.5").is_err());
        assert!(parse_range("10.0.1.x-10.0.1.9").is_err());
    }
}
