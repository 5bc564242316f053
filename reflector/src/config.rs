//! Reflector configuration
//!
//! Loaded from an optional JSON file; command line flags override single
//! fields afterwards. Every field has a default, so an empty object (or no
//! file at all) is a valid configuration apart from the device list.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Deserializer};
use smoltcp::wire::EthernetAddress;
use thiserror::Error;

use crate::dataplane::buffer::POOL_SIZE;
use crate::dataplane::vxlan::VXLAN_PORT;

pub const DEFAULT_BURST_SIZE: usize = 256;
pub const MAX_BURST_SIZE: usize = 4096;
pub const DEFAULT_TX_BUFFER_SIZE: usize = 128;
pub const DEFAULT_STATS_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_RESPONDER_MAC: EthernetAddress =
    EthernetAddress([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid MAC address {0:?}")]
    InvalidMac(String),

    #[error("invalid device spec {0:?}, expected NAME[:QUEUES[:NUMA_NODE]]")]
    InvalidDevice(String),

    #[error("burst size must be between 1 and 4096, got {0}")]
    BurstSize(usize),

    #[error("tx buffer size must be at least 1")]
    TxBufferSize,

    #[error("buffer pool needs at least one buffer per device")]
    PoolSize,

    #[error("device {0} has no queues")]
    NoQueues(String),

    #[error("device {0} is configured twice")]
    DuplicateDevice(String),

    #[error("no devices configured")]
    NoDevices,
}

/// Parse `aa:bb:cc:dd:ee:ff` (or `-` separated).
pub fn parse_mac(s: &str) -> Result<EthernetAddress, ConfigError> {
    let invalid = || ConfigError::InvalidMac(s.to_string());
    let mut mac = [0u8; 6];
    let mut parts = s.split([':', '-']);
    for byte in mac.iter_mut() {
        let part = parts.next().ok_or_else(invalid)?;
        if part.len() != 2 {
            return Err(invalid());
        }
        *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
    }
    if parts.next().is_some() {
        return Err(invalid());
    }
    Ok(EthernetAddress(mac))
}

fn deserialize_mac<'de, D: Deserializer<'de>>(d: D) -> Result<EthernetAddress, D::Error> {
    let s = String::deserialize(d)?;
    parse_mac(&s).map_err(serde::de::Error::custom)
}

fn default_queues() -> u16 {
    1
}

/// One device to reflect on
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub name: String,
    #[serde(default = "default_queues")]
    pub queues: u16,
    /// Overrides the NUMA node read from sysfs
    #[serde(default)]
    pub numa_node: Option<i32>,
}

impl FromStr for DeviceConfig {
    type Err = ConfigError;

    /// `NAME[:QUEUES[:NUMA_NODE]]`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidDevice(s.to_string());
        let mut parts = s.split(':');
        let name = parts.next().filter(|n| !n.is_empty()).ok_or_else(invalid)?;
        let queues = match parts.next() {
            Some(q) => q.parse().map_err(|_| invalid())?,
            None => default_queues(),
        };
        let numa_node = match parts.next() {
            Some(n) => Some(n.parse().map_err(|_| invalid())?),
            None => None,
        };
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self {
            name: name.to_string(),
            queues,
            numa_node,
        })
    }
}

impl fmt::Display for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.queues)?;
        if let Some(node) = self.numa_node {
            write!(f, ":{node}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReflectorConfig {
    /// Maximum frames per receive burst
    pub burst_size: usize,
    /// MAC address claimed in ARP replies and Neighbor Advertisements
    #[serde(deserialize_with = "deserialize_mac")]
    pub responder_mac: EthernetAddress,
    /// Forward frames unchanged without parsing them
    pub dry_run: bool,
    /// Log every frame before and after rewrite at debug level
    pub trace_packets: bool,
    /// UDP destination port that marks VXLAN traffic
    pub vxlan_port: u16,
    /// Frames buffered per worker before a transmit burst
    pub tx_buffer_size: usize,
    /// Seconds between stats reports; 0 disables the reporter
    pub stats_interval_secs: u64,
    /// Packet buffers per device
    pub pool_buffers: usize,
    pub devices: Vec<DeviceConfig>,
    /// Worker CPUs; defaults to the affinity mask without its first CPU
    pub cpus: Option<Vec<usize>>,
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        Self {
            burst_size: DEFAULT_BURST_SIZE,
            responder_mac: DEFAULT_RESPONDER_MAC,
            dry_run: false,
            trace_packets: false,
            vxlan_port: VXLAN_PORT,
            tx_buffer_size: DEFAULT_TX_BUFFER_SIZE,
            stats_interval_secs: DEFAULT_STATS_INTERVAL_SECS,
            pool_buffers: POOL_SIZE,
            devices: Vec::new(),
            cpus: None,
        }
    }
}

impl ReflectorConfig {
    /// Load a JSON config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: display.clone(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.burst_size == 0 || self.burst_size > MAX_BURST_SIZE {
            return Err(ConfigError::BurstSize(self.burst_size));
        }
        if self.tx_buffer_size == 0 {
            return Err(ConfigError::TxBufferSize);
        }
        if self.pool_buffers == 0 {
            return Err(ConfigError::PoolSize);
        }
        if self.devices.is_empty() {
            return Err(ConfigError::NoDevices);
        }
        for (i, dev) in self.devices.iter().enumerate() {
            if dev.queues == 0 {
                return Err(ConfigError::NoQueues(dev.name.clone()));
            }
            if self.devices[..i].iter().any(|d| d.name == dev.name) {
                return Err(ConfigError::DuplicateDevice(dev.name.clone()));
            }
        }
        Ok(())
    }
}
