//! Preflight validation of a scale set spec against platform capability data.
//!
//! Validation runs before any mutating cloud call. Failures which can only be fixed by changing
//! the spec are terminal.

use anyhow::{Context, Result};
use fleet_core::error::is_not_found;
use fleet_core::ReconcileError;

use crate::scaleset::capability::{
    CapabilityLookup, SkuRecord, CAPABILITY_EPHEMERAL_OS_DISK, CAPABILITY_ENCRYPTION_AT_HOST, CAPABILITY_MEMORY_GB, CAPABILITY_ULTRA_SSD, CAPABILITY_VCPUS,
};
use crate::scaleset::spec::FleetSpec;

/// The minimum number of vCPUs of a node.
pub const MIN_VCPUS: f64 = 2.0;
/// The minimum memory of a node in GiB.
pub const MIN_MEMORY_GB: f64 = 2.0;
/// The storage account type of ultra SSD disks.
pub const STORAGE_ULTRA_SSD: &str = "UltraSSD_LRS";

/// The capability record of a size class which passed validation.
///
/// Only obtainable through `validate`, which makes it proof that validation passed.
#[derive(Clone, Debug)]
pub struct ValidatedSku(SkuRecord);

impl ValidatedSku {
    pub fn sku(&self) -> &SkuRecord {
        &self.0
    }
}

/// Validate the given spec, returning its validated capability record.
#[tracing::instrument(level = "debug", skip(spec, lookup), fields(name = %spec.name, size = %spec.vm_size()))]
pub async fn validate(spec: &FleetSpec, lookup: &dyn CapabilityLookup) -> Result<ValidatedSku> {
    let size = spec.vm_size();
    let location = spec.location();
    let template = &spec.pool.template;

    let sku = match lookup.get(size, location).await {
        Ok(sku) => sku,
        Err(err) if is_not_found(&err) => {
            return Err(ReconcileError::terminal(format!("failed to get SKU {} in compute api: {:#}", size, err)));
        }
        Err(err) => return Err(err.context(format!("failed to get SKU {} in compute api", size))),
    };

    let has_vcpus = sku
        .has_capability_with_capacity(CAPABILITY_VCPUS, MIN_VCPUS)
        .map_err(|err| ReconcileError::terminal(format!("failed to validate the vCPU capability: {:#}", err)))?;
    if !has_vcpus {
        return Err(ReconcileError::terminal("vm size should be bigger or equal to at least 2 vCPUs"));
    }

    let has_memory = sku
        .has_capability_with_capacity(CAPABILITY_MEMORY_GB, MIN_MEMORY_GB)
        .map_err(|err| ReconcileError::terminal(format!("failed to validate the memory capability: {:#}", err)))?;
    if !has_memory {
        return Err(ReconcileError::terminal("vm memory should be bigger or equal to at least 2Gi"));
    }

    if template.os_disk.diff_disk_settings.is_some() && !sku.has_capability(CAPABILITY_EPHEMERAL_OS_DISK) {
        return Err(ReconcileError::terminal(format!(
            "vm size {} does not support ephemeral os. select a different vm size or disable ephemeral os",
            size
        )));
    }

    if requests_encryption_at_host(spec) && !sku.has_capability(CAPABILITY_ENCRYPTION_AT_HOST) {
        return Err(ReconcileError::terminal(format!("encryption at host is not supported for VM type {}", size)));
    }

    let zones = lookup
        .zones(location)
        .await
        .map_err(|err| ReconcileError::terminal(format!("failed to get zones for location {}: {:#}", location, err)))?;
    if requests_ultra_ssd(spec) {
        for zone in zones.iter() {
            if !sku.has_location_capability(CAPABILITY_ULTRA_SSD, location, zone) {
                return Err(ReconcileError::terminal(format!(
                    "vm size {} does not support ultra disks in location {}. select a different vm size or disable ultra disks",
                    size, location
                )));
            }
        }
    }

    if !spec.pool.failure_domains.is_empty() {
        let available = lookup
            .zones_for_size(size, location)
            .await
            .with_context(|| format!("failed to get zones for VM type {} in location {}", size, location))?;
        for domain in spec.pool.failure_domains.iter() {
            if !available.iter().any(|zone| zone == domain) {
                return Err(ReconcileError::terminal(format!(
                    "availability zone {} is not available for VM type {} in location {}",
                    domain, size, location
                )));
            }
        }
    }

    Ok(ValidatedSku(sku))
}

/// Check if the spec requests encryption at host.
pub fn requests_encryption_at_host(spec: &FleetSpec) -> bool {
    matches!(
        spec.pool.template.security_profile.as_ref().and_then(|profile| profile.encryption_at_host),
        Some(true)
    )
}

/// Check if any data disk, or the explicit capability override, requests ultra SSD.
pub fn requests_ultra_ssd(spec: &FleetSpec) -> bool {
    let explicit = spec
        .pool
        .template
        .additional_capabilities
        .as_ref()
        .and_then(|caps| caps.ultra_ssd_enabled)
        .unwrap_or(false);
    explicit || has_ultra_ssd_data_disk(spec)
}

/// Check if any data disk uses the ultra SSD storage tier.
pub fn has_ultra_ssd_data_disk(spec: &FleetSpec) -> bool {
    spec.pool
        .template
        .data_disks
        .iter()
        .filter_map(|disk| disk.managed_disk.as_ref())
        .any(|disk| disk.storage_account_type == STORAGE_ULTRA_SSD)
}
