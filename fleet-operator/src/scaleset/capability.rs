//! Platform capability data of VM size classes.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;

pub const CAPABILITY_VCPUS: &str = "vCPUs";
pub const CAPABILITY_MEMORY_GB: &str = "MemoryGB";
pub const CAPABILITY_EPHEMERAL_OS_DISK: &str = "EphemeralOSDiskSupported";
pub const CAPABILITY_ENCRYPTION_AT_HOST: &str = "EncryptionAtHostSupported";
pub const CAPABILITY_ACCELERATED_NETWORKING: &str = "AcceleratedNetworkingEnabled";
pub const CAPABILITY_ULTRA_SSD: &str = "UltraSSDAvailable";

/// The capability record of a VM size class in one location.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SkuRecord {
    pub name: String,
    pub capabilities: BTreeMap<String, String>,
    pub location_info: Vec<LocationInfo>,
}

/// Zonal availability of a size class in one location.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LocationInfo {
    pub location: String,
    pub zones: Vec<String>,
    pub zone_details: Vec<ZoneDetail>,
}

/// Capabilities which only hold in a subset of a location's zones.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ZoneDetail {
    pub zones: Vec<String>,
    pub capabilities: BTreeMap<String, String>,
}

impl SkuRecord {
    /// Check if the given boolean capability is set to `True`.
    pub fn has_capability(&self, name: &str) -> bool {
        matches!(self.capabilities.get(name), Some(val) if val.eq_ignore_ascii_case("true"))
    }

    /// Check if the given numeric capability is at least `min`.
    ///
    /// Returns an error if the capability is present but not numeric.
    pub fn has_capability_with_capacity(&self, name: &str, min: f64) -> Result<bool> {
        let val = match self.capabilities.get(name) {
            Some(val) => val,
            None => return Ok(false),
        };
        let parsed: f64 = val
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid value {:?} for capability {}: {}", val, name, err))?;
        Ok(parsed >= min)
    }

    /// Check if the given boolean capability is set to `True` for the given zone of a location.
    pub fn has_location_capability(&self, name: &str, location: &str, zone: &str) -> bool {
        self.location_info
            .iter()
            .filter(|info| info.location.eq_ignore_ascii_case(location))
            .flat_map(|info| info.zone_details.iter())
            .filter(|detail| detail.zones.iter().any(|z| z == zone))
            .any(|detail| matches!(detail.capabilities.get(name), Some(val) if val.eq_ignore_ascii_case("true")))
    }
}

/// A lookup of size class capability records.
#[async_trait]
pub trait CapabilityLookup: Send + Sync {
    /// Get the capability record of the given size class in the given location.
    ///
    /// An unknown size class yields a `CloudError::NotFound`.
    async fn get(&self, size: &str, location: &str) -> Result<SkuRecord>;

    /// Get all availability zones of the given location.
    async fn zones(&self, location: &str) -> Result<Vec<String>>;

    /// Get the availability zones of the given location in which the given size class is offered.
    async fn zones_for_size(&self, size: &str, location: &str) -> Result<Vec<String>>;
}
