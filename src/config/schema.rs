use serde::{Deserialize, Serialize};

use crate::error::{IngestError, Result};
use crate::net::ether::ETH_P_AVTP_EXPERIMENTAL;
use crate::net::MacAddr;

/// Largest compressed frame a camera may deliver (512 KiB).
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 512 << 10;

/// Main ingestion configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IngestConfig {
    /// Network interface the cameras are attached to (e.g. eth0).
    pub interface: String,
    /// Ethertype carrying the camera streams.
    pub ethertype: u16,
    /// Cameras, in identifier order.
    pub cameras: Vec<CameraConfig>,
    /// Per-camera packet ring geometry.
    pub ring: RingConfig,
    /// JPEG decoder settings.
    pub decoder: DecoderConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            interface: "eth0".to_string(),
            ethertype: ETH_P_AVTP_EXPERIMENTAL,
            cameras: Vec::new(),
            ring: RingConfig::default(),
            decoder: DecoderConfig::default(),
        }
    }
}

impl IngestConfig {
    /// Check the configuration before any resource is opened.
    pub fn validate(&self) -> Result<()> {
        if self.interface.is_empty() {
            return Err(IngestError::Config("network interface is not set".into()));
        }
        if self.cameras.is_empty() {
            return Err(IngestError::Config("no cameras configured".into()));
        }
        if self.cameras.len() > u8::MAX as usize {
            return Err(IngestError::Config(format!(
                "too many cameras: {}",
                self.cameras.len()
            )));
        }
        if self.ethertype == 0 {
            return Err(IngestError::Config("ethertype must be non-zero".into()));
        }
        for (id, camera) in self.cameras.iter().enumerate() {
            if let Some(vlan) = camera.vlan {
                if vlan == 0 || vlan > 0xFFF {
                    return Err(IngestError::Config(format!(
                        "camera {}: invalid VLAN id {}",
                        id, vlan
                    )));
                }
            }
        }
        self.ring.validate()?;
        self.decoder.validate()
    }
}

/// Single camera endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CameraConfig {
    /// Display name used in logs.
    pub name: String,
    /// MAC address the camera transmits from.
    pub source_mac: MacAddr,
    /// Destination address; multicast groups are joined automatically.
    pub dest_mac: Option<MacAddr>,
    /// 802.1Q VLAN the stream is tagged with.
    pub vlan: Option<u16>,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            source_mac: MacAddr::ZERO,
            dest_mac: None,
            vlan: Some(0x56),
        }
    }
}

impl CameraConfig {
    pub fn new(source_mac: MacAddr) -> Self {
        Self {
            source_mac,
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_dest(mut self, dest_mac: MacAddr) -> Self {
        self.dest_mac = Some(dest_mac);
        self
    }

    pub fn with_vlan(mut self, vlan: Option<u16>) -> Self {
        self.vlan = vlan;
        self
    }
}

/// Packet ring geometry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RingConfig {
    /// Receive slots (power of two).
    pub rx_slots: u32,
    /// Transmit slots (power of two, 0 disables transmission).
    pub tx_slots: u32,
    /// Largest frame the ring must hold, excluding ring headers.
    pub frame_size: u32,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            rx_slots: 64,
            tx_slots: 0,
            frame_size: 1544,
        }
    }
}

impl RingConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, slots) in [("rx_slots", self.rx_slots), ("tx_slots", self.tx_slots)] {
            // zero is a power of two here: the direction is simply disabled
            if slots & slots.wrapping_sub(1) != 0 || slots > 1 << 15 {
                return Err(IngestError::Config(format!(
                    "invalid ring size {}: {}",
                    name, slots
                )));
            }
        }
        if self.rx_slots == 0 && self.tx_slots == 0 {
            return Err(IngestError::Config("ring has no slots".into()));
        }
        if self.frame_size == 0 || self.frame_size > 1 << 16 {
            return Err(IngestError::Config(format!(
                "invalid ring frame size: {}",
                self.frame_size
            )));
        }
        Ok(())
    }
}

/// Behaviour of input acquisition when a camera has no free buffer.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AcquirePolicy {
    /// Wait until a buffer is returned or the session stops.
    ///
    /// Only for producers with a thread of their own; live network
    /// ingestion never waits.
    Block,
    /// Report the buffer as unavailable immediately.
    #[default]
    Drop,
}

/// JPEG decoder configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DecoderConfig {
    /// Decoder device path.
    pub device: String,
    /// Decoded frame width.
    pub width: u32,
    /// Decoded frame height.
    pub height: u32,
    /// Capacity of each compressed input buffer.
    pub max_frame_length: usize,
    /// Input/output buffer pairs reserved per camera.
    pub buffers_per_camera: usize,
    /// What an exhausted camera does on acquisition.
    pub acquire_policy: AcquirePolicy,
    /// Export decoded buffers as DMA-buf descriptors.
    pub export_dmabuf: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video1".to_string(),
            width: 1280,
            height: 800,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            buffers_per_camera: 4,
            acquire_policy: AcquirePolicy::Drop,
            export_dmabuf: false,
        }
    }
}

impl DecoderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(IngestError::Config(format!(
                "invalid decoder geometry: {}x{}",
                self.width, self.height
            )));
        }
        // payloads shorter than 3 bytes never reach the buffer
        if self.max_frame_length < 4 {
            return Err(IngestError::Config(format!(
                "max frame length too small: {}",
                self.max_frame_length
            )));
        }
        if self.buffers_per_camera == 0 {
            return Err(IngestError::Config(
                "at least one buffer per camera is required".into(),
            ));
        }
        Ok(())
    }

    /// Total number of buffer pairs for `cameras` cameras.
    pub fn pool_size(&self, cameras: usize) -> usize {
        cameras * self.buffers_per_camera
    }
}
