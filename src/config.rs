use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use log::info;

use crate::transport::{BindPolicy, PeerId, TransportError};

/// Runtime settings of a hole punching peer
#[derive(Debug, Clone, PartialEq)]
pub struct HolePunchConfig {
    /// Channels an initiator binds per attempt
    pub number_of_holes: usize,
    /// Upper bound on channels a responder binds for one offer
    pub max_holes: usize,
    /// Channels close after this long without inbound traffic
    pub idle_timeout: Duration,
    /// Delay before the responder's punch attempt
    pub retry_delay: Duration,
    /// How long an initiator waits for the relay reply
    pub relay_reply_timeout: Duration,
    pub broadcast: bool,
    pub bind_policy: BindPolicy,
}

impl Default for HolePunchConfig {
    fn default() -> Self {
        Self {
            number_of_holes: default_number_of_holes(),
            max_holes: default_max_holes(),
            idle_timeout: Duration::from_millis(default_idle_timeout_ms()),
            retry_delay: Duration::from_millis(default_retry_delay_ms()),
            relay_reply_timeout: Duration::from_millis(default_relay_reply_timeout_ms()),
            broadcast: false,
            bind_policy: BindPolicy::default(),
        }
    }
}

impl HolePunchConfig {
    /// Reject settings a session cannot run with
    pub fn validate(&self) -> Result<(), TransportError> {
        let invalid = |field: &str, reason: &str| TransportError::ConfigurationError {
            field: field.to_string(),
            reason: reason.to_string(),
        };

        if self.number_of_holes == 0 {
            return Err(invalid("number_of_holes", "must be at least 1"));
        }
        if self.number_of_holes > self.max_holes {
            return Err(invalid("number_of_holes", "must not exceed max_holes"));
        }
        if self.idle_timeout.is_zero() {
            return Err(invalid("idle_timeout", "must be greater than 0"));
        }
        if self.relay_reply_timeout.is_zero() {
            return Err(invalid("relay_reply_timeout", "must be greater than 0"));
        }
        Ok(())
    }
}

/// Configuration file format
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HolePunchConfigFile {
    #[serde(default)]
    pub punch: PunchSection,
    #[serde(default)]
    pub network: NetworkSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PunchSection {
    #[serde(default = "default_number_of_holes")]
    pub number_of_holes: usize,
    #[serde(default = "default_max_holes")]
    pub max_holes: usize,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_relay_reply_timeout_ms")]
    pub relay_reply_timeout_ms: u64,
    #[serde(default)]
    pub broadcast: bool,
    /// What to do when every bind of an attempt fails
    #[serde(default)]
    pub bind_policy: BindPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkSection {
    /// Address channels are bound on
    #[serde(default = "default_bind_ip")]
    pub bind_ip: IpAddr,
    /// Identity announced to other peers
    pub peer_id: Option<PeerId>,
}

impl NetworkSection {
    /// Address other peers are told to send to: the bind address, or
    /// loopback when binding on every interface
    pub fn advertised_ip(&self) -> IpAddr {
        match self.bind_ip {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        }
    }

    pub fn peer_id_or(&self, fallback: &str) -> PeerId {
        self.peer_id.clone().unwrap_or_else(|| fallback.to_string())
    }
}

fn default_number_of_holes() -> usize { 3 }
fn default_max_holes() -> usize { 16 }
fn default_idle_timeout_ms() -> u64 { 30_000 }
fn default_retry_delay_ms() -> u64 { 10_000 }
fn default_relay_reply_timeout_ms() -> u64 { 10_000 }
fn default_bind_ip() -> IpAddr { IpAddr::V4(Ipv4Addr::UNSPECIFIED) }

impl Default for PunchSection {
    fn default() -> Self {
        Self::from(&HolePunchConfig::default())
    }
}

impl From<&HolePunchConfig> for PunchSection {
    fn from(config: &HolePunchConfig) -> Self {
        Self {
            number_of_holes: config.number_of_holes,
            max_holes: config.max_holes,
            idle_timeout_ms: config.idle_timeout.as_millis() as u64,
            retry_delay_ms: config.retry_delay.as_millis() as u64,
            relay_reply_timeout_ms: config.relay_reply_timeout.as_millis() as u64,
            broadcast: config.broadcast,
            bind_policy: config.bind_policy,
        }
    }
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            bind_ip: default_bind_ip(),
            peer_id: None,
        }
    }
}

impl HolePunchConfigFile {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: HolePunchConfigFile = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Load configuration from JSON file
    pub fn load_from_json<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: HolePunchConfigFile = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to JSON file
    pub fn save_to_json<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Convert to the runtime format
    pub fn to_punch_config(&self) -> HolePunchConfig {
        HolePunchConfig {
            number_of_holes: self.punch.number_of_holes,
            max_holes: self.punch.max_holes,
            idle_timeout: Duration::from_millis(self.punch.idle_timeout_ms),
            retry_delay: Duration::from_millis(self.punch.retry_delay_ms),
            relay_reply_timeout: Duration::from_millis(self.punch.relay_reply_timeout_ms),
            broadcast: self.punch.broadcast,
            bind_policy: self.punch.bind_policy,
        }
    }

    /// Create from the runtime format, with default network settings
    pub fn from_punch_config(config: &HolePunchConfig) -> Self {
        Self {
            punch: PunchSection::from(config),
            network: NetworkSection::default(),
        }
    }

    /// Generate a sample configuration file content
    pub fn generate_sample_config() -> String {
        let mut sample = Self::default();
        sample.network.peer_id = Some("my-peer".to_string());
        toml::to_string_pretty(&sample).unwrap_or_else(|_| {
            "# Failed to generate sample configuration".to_string()
        })
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.punch.number_of_holes == 0 {
            errors.push("Number of holes must be greater than 0".to_string());
        }
        if self.punch.max_holes == 0 {
            errors.push("Max holes must be greater than 0".to_string());
        }
        if self.punch.number_of_holes > self.punch.max_holes {
            errors.push(format!(
                "Number of holes ({}) exceeds max holes ({})",
                self.punch.number_of_holes, self.punch.max_holes
            ));
        }
        if self.punch.idle_timeout_ms == 0 {
            errors.push("Idle timeout must be greater than 0".to_string());
        }
        if self.punch.relay_reply_timeout_ms == 0 {
            errors.push("Relay reply timeout must be greater than 0".to_string());
        }
        if let BindPolicy::RetryWithFewerHoles { max_rounds: 0 } = self.punch.bind_policy {
            errors.push("Bind retry policy needs at least one round".to_string());
        }

        if let Some(peer_id) = &self.network.peer_id {
            if peer_id.trim().is_empty() {
                errors.push("Peer id must not be blank".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Merge with another configuration (other takes precedence)
    pub fn merge(&mut self, other: HolePunchConfigFile) {
        self.punch = other.punch;
        self.network.bind_ip = other.network.bind_ip;
        if other.network.peer_id.is_some() {
            self.network.peer_id = other.network.peer_id;
        }
    }

    /// Get the default configuration file paths
    pub fn default_config_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        paths.push("holepunch.toml".into());

        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("holepunch").join("holepunch.toml"));
        }

        paths.push("/etc/holepunch/holepunch.toml".into());

        paths
    }

    /// Try to load configuration from default locations
    pub fn load_from_default_locations() -> crate::Result<Self> {
        for path in Self::default_config_paths() {
            if path.exists() {
                info!("Loading hole punch configuration from: {}", path.display());
                return Self::load_from_file(&path);
            }
        }

        info!("No hole punch configuration file found, using defaults");
        Ok(Self::default())
    }
}

/// Configuration management utilities
pub struct ConfigManager;

impl ConfigManager {
    /// Write the default configuration to `path`
    pub fn init_config<P: AsRef<Path>>(path: P, force: bool) -> crate::Result<()> {
        let path = path.as_ref();
        if path.exists() && !force {
            return Err("Configuration file already exists. Use --force to overwrite.".into());
        }

        HolePunchConfigFile::default().save_to_file(path)?;
        println!("Created default hole punch configuration at: {}", path.display());
        Ok(())
    }

    /// Validate configuration file
    pub fn validate_config<P: AsRef<Path>>(path: P) -> crate::Result<()> {
        let config = HolePunchConfigFile::load_from_file(path)?;

        match config.validate() {
            Ok(()) => {
                println!("Configuration is valid");
                Ok(())
            }
            Err(errors) => {
                eprintln!("Configuration validation failed:");
                for error in errors {
                    eprintln!("  - {}", error);
                }
                Err("Configuration validation failed".into())
            }
        }
    }

    /// Show current configuration
    pub fn show_config<P: AsRef<Path>>(path: P) -> crate::Result<()> {
        let config = HolePunchConfigFile::load_from_file(path)?;
        let content = toml::to_string_pretty(&config)?;
        println!("{}", content);
        Ok(())
    }

    pub fn generate_sample() -> String {
        HolePunchConfigFile::generate_sample_config()
    }
}
