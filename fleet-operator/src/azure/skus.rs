//! A capability lookup backed by the resource SKUs API.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use fleet_core::CloudError;
use tokio::sync::Mutex;

use crate::azure::{convert, wire, ArmClient, SKUS_API_VERSION};
use crate::scaleset::capability::{CapabilityLookup, SkuRecord};

/// The period after which a location's SKU list is fetched again.
const SKU_CACHE_TTL: Duration = Duration::from_secs(60 * 60);
const RESOURCE_TYPE_VMS: &str = "virtualMachines";

struct CacheEntry {
    fetched_at: Instant,
    skus: Arc<Vec<wire::ResourceSku>>,
}

/// A per-location cache of VM size class capability records.
pub struct SkuCache {
    arm: ArmClient,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl SkuCache {
    pub fn new(arm: ArmClient) -> Self {
        Self {
            arm,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Get the VM size classes offered in the given location, fetching them if not cached.
    async fn skus(&self, location: &str) -> Result<Arc<Vec<wire::ResourceSku>>> {
        let key = location.to_ascii_lowercase();
        // Held across the fetch, so a cold cache is only filled once.
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get(&key) {
            if entry.fetched_at.elapsed() < SKU_CACHE_TTL {
                return Ok(entry.skus.clone());
            }
        }

        let filter = format!("location eq '{}'", location);
        let url = self
            .arm
            .versioned_url("/providers/Microsoft.Compute/skus", SKUS_API_VERSION, &[("$filter", filter.as_str())])?;
        let skus: Vec<wire::ResourceSku> = self
            .arm
            .get_pages(url)
            .await
            .with_context(|| format!("error listing resource skus of location {}", location))?;
        let skus: Arc<Vec<_>> = Arc::new(
            skus.into_iter()
                .filter(|sku| sku.resource_type.eq_ignore_ascii_case(RESOURCE_TYPE_VMS))
                .collect(),
        );
        tracing::debug!(location, count = skus.len(), "fetched resource skus");
        entries.insert(
            key,
            CacheEntry {
                fetched_at: Instant::now(),
                skus: skus.clone(),
            },
        );
        Ok(skus)
    }
}

#[async_trait]
impl CapabilityLookup for SkuCache {
    async fn get(&self, size: &str, location: &str) -> Result<SkuRecord> {
        let skus = self.skus(location).await?;
        let sku = skus
            .iter()
            .find(|sku| sku.name.eq_ignore_ascii_case(size))
            .ok_or_else(|| CloudError::NotFound(format!("vm size {} in location {}", size, location)))?;
        Ok(convert::sku_from_wire(sku.clone(), location))
    }

    async fn zones(&self, location: &str) -> Result<Vec<String>> {
        let skus = self.skus(location).await?;
        let zones: BTreeSet<String> = skus
            .iter()
            .map(|sku| convert::sku_from_wire(sku.clone(), location))
            .flat_map(|record| record.location_info.into_iter())
            .flat_map(|info| info.zones.into_iter())
            .collect();
        Ok(zones.into_iter().collect())
    }

    async fn zones_for_size(&self, size: &str, location: &str) -> Result<Vec<String>> {
        let record = self.get(size, location).await?;
        let mut zones: Vec<String> = record.location_info.into_iter().flat_map(|info| info.zones.into_iter()).collect();
        zones.sort();
        zones.dedup();
        Ok(zones)
    }
}
