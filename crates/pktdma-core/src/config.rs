//! Engine configuration.
//!
//! Loaded from TOML; every field has a default so a partial file is valid.
//!
//! ```toml
//! [device]
//! rx_queues = 4
//! tx_queues = 4
//! page_buffer_mode = true
//!
//! [encap]
//! pkt_sig = 0x0c00
//!
//! [[netifs]]
//! id = 1
//! kind = "vlan"
//! vlan = 10
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Complete engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    /// Device and queue configuration
    #[serde(default)]
    pub device: DeviceConfig,
    /// Control-plane encapsulation overrides
    #[serde(default)]
    pub encap: EncapConfig,
    /// Virtual network interfaces
    #[serde(default)]
    pub netifs: Vec<NetifConfig>,
    /// Debug switches
    #[serde(default)]
    pub debug: DebugConfig,
}

/// Device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Number of receive queues
    #[serde(default = "default_queues")]
    pub rx_queues: u32,
    /// Number of transmit queues
    #[serde(default = "default_queues")]
    pub tx_queues: u32,
    /// Receive buffer payload size
    #[serde(default = "default_rx_buf_size")]
    pub rx_buf_size: usize,
    /// Use paged flip buffers for receive
    #[serde(default)]
    pub page_buffer_mode: bool,
    /// Metadata bytes the hardware writes inline (0 = reserve room for it)
    #[serde(default)]
    pub rx_meta_inline: usize,
    /// Receive header adjustment for devices carrying metadata out of band
    #[serde(default)]
    pub rx_adj: usize,
    /// Transmit metadata travels out of band
    #[serde(default)]
    pub tx_meta_out_of_band: bool,
    /// Hardware strips the FCS
    #[serde(default)]
    pub no_fcs: bool,
    /// Drain zero-copy transmit from the poll path instead of a worker
    #[serde(default)]
    pub napi_tx: bool,
    /// Rx and Tx completions share one interrupt group
    #[serde(default)]
    pub group_intr: bool,
    /// Base page size
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Maximum live receive pages
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    /// Pages at the top of the arena treated as emergency reserve
    #[serde(default = "default_reserve_pages")]
    pub reserve_pages: usize,
    /// Pin the zero-copy transmit worker to the last CPU
    #[serde(default = "default_true")]
    pub pin_tx_worker: bool,
}

/// Control-plane encapsulation overrides
///
/// Zero MAC addresses keep the addresses found in the packet.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncapConfig {
    /// Destination MAC override
    #[serde(default)]
    pub dst_mac: [u8; 6],
    /// Source MAC override
    #[serde(default)]
    pub src_mac: [u8; 6],
    /// VLAN tag protocol id
    #[serde(default)]
    pub vlan_tpid: u16,
    /// VLAN tag control
    #[serde(default)]
    pub vlan_tci: u16,
    /// Ethertype
    #[serde(default)]
    pub eth_type: u16,
    /// Packet signature (0 disables signature checks)
    #[serde(default)]
    pub pkt_sig: u16,
    /// Transaction id
    #[serde(default)]
    pub trans_id: u16,
}

/// Virtual network interface kind
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetifKind {
    /// Switched through the device pipeline, optionally VLAN tagged
    #[default]
    Vlan,
    /// Sent straight to a physical port using metadata
    Port,
    /// Sent with caller-supplied metadata
    Meta,
}

/// Virtual network interface configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetifConfig {
    /// Interface id
    pub id: u32,
    /// Interface kind
    #[serde(default)]
    pub kind: NetifKind,
    /// VLAN id inserted on egress (0 = none)
    #[serde(default)]
    pub vlan: u16,
    /// Metadata length for port and meta interfaces
    #[serde(default)]
    pub meta_len: usize,
    /// Bytes of the frame placed in front of the metadata
    #[serde(default)]
    pub meta_off: usize,
    /// Metadata bytes
    #[serde(default)]
    pub meta_data: Vec<u8>,
    /// Exchange packets with the control plane in encapsulated form
    #[serde(default)]
    pub encap: bool,
    /// Insert the VLAN tag even when metadata carries a module header
    #[serde(default)]
    pub add_tag: bool,
    /// Receive channel bound to this interface
    #[serde(default)]
    pub bind_chan: Option<u32>,
}

impl NetifConfig {
    /// Plain interface with the given id
    pub fn new(id: u32) -> Self {
        Self {
            id,
            kind: NetifKind::Vlan,
            vlan: 0,
            meta_len: 0,
            meta_off: 0,
            meta_data: Vec::new(),
            encap: false,
            add_tag: false,
            bind_chan: None,
        }
    }
}

/// Debug configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugConfig {
    /// Hex dump transmitted filter frames
    #[serde(default)]
    pub pkt_dump: bool,
}

// Default values

fn default_queues() -> u32 {
    1
}

fn default_rx_buf_size() -> usize {
    1536
}

fn default_page_size() -> usize {
    4096
}

fn default_max_pages() -> usize {
    4096
}

fn default_reserve_pages() -> usize {
    0
}

fn default_true() -> bool {
    true
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            rx_queues: default_queues(),
            tx_queues: default_queues(),
            rx_buf_size: default_rx_buf_size(),
            page_buffer_mode: false,
            rx_meta_inline: 0,
            rx_adj: 0,
            tx_meta_out_of_band: false,
            no_fcs: false,
            napi_tx: false,
            group_intr: false,
            page_size: default_page_size(),
            max_pages: default_max_pages(),
            reserve_pages: default_reserve_pages(),
            pin_tx_worker: true,
        }
    }
}

impl DeviceConfig {
    /// FCS bytes the engine accounts for
    pub fn fcs_len(&self) -> usize {
        if self.no_fcs { 0 } else { crate::ETH_FCS_LEN }
    }
}

impl EngineConfig {
    /// Parse configuration from a TOML string
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed or the result fails validation.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let dev = &self.device;

        if dev.rx_queues == 0 || dev.tx_queues == 0 {
            return Err(ConfigError::Invalid("queue counts must be non-zero".into()));
        }
        if dev.rx_queues > u8::MAX as u32 + 1 || dev.tx_queues > u8::MAX as u32 + 1 {
            return Err(ConfigError::Invalid("at most 256 queues per direction".into()));
        }
        if !dev.page_size.is_power_of_two() {
            return Err(ConfigError::Invalid("page_size must be a power of 2".into()));
        }
        if dev.rx_buf_size == 0 || dev.rx_buf_size > u16::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "rx_buf_size {} out of range",
                dev.rx_buf_size
            )));
        }
        if dev.reserve_pages > dev.max_pages {
            return Err(ConfigError::Invalid(
                "reserve_pages exceeds max_pages".into(),
            ));
        }

        let mut ids = std::collections::HashSet::new();
        for netif in &self.netifs {
            if !ids.insert(netif.id) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate netif id {}",
                    netif.id
                )));
            }
            if netif.meta_data.len() != netif.meta_len {
                return Err(ConfigError::Invalid(format!(
                    "netif {}: meta_data length {} != meta_len {}",
                    netif.id,
                    netif.meta_data.len(),
                    netif.meta_len
                )));
            }
            if netif.meta_len > u8::MAX as usize {
                return Err(ConfigError::Invalid(format!(
                    "netif {}: meta_len too large",
                    netif.id
                )));
            }
        }

        Ok(())
    }
}
