//! Network interface lookup.

use nix::ifaddrs::getifaddrs;
use nix::net::if_::if_nametoindex;
use tracing::info;

use super::MacAddr;
use crate::error::{IngestError, Result};

/// A resolved network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetInterface {
    name: String,
    index: u32,
    mac: MacAddr,
}

impl NetInterface {
    /// Resolve interface index and hardware address by name.
    pub fn open(name: &str) -> Result<Self> {
        let index = if_nametoindex(name).map_err(|e| {
            IngestError::Config(format!("Unknown network interface '{}': {}", name, e))
        })?;

        let mac = getifaddrs()?
            .filter(|ifa| ifa.interface_name == name)
            .find_map(|ifa| ifa.address.and_then(|addr| addr.as_link_addr()?.addr()))
            .map(MacAddr::new)
            .ok_or_else(|| {
                IngestError::Config(format!("Interface '{}' has no hardware address", name))
            })?;

        info!("Network interface '{}' opened (index {}, {})", name, index, mac);

        Ok(Self {
            name: name.to_string(),
            index,
            mac,
        })
    }

    /// Describe an interface without querying the system.
    pub fn from_parts(name: impl Into<String>, index: u32, mac: MacAddr) -> Self {
        Self {
            name: name.into(),
            index,
            mac,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn mac(&self) -> MacAddr {
        self.mac
    }
}
