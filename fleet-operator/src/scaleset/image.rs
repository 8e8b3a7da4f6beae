//! Boot image resolution.

use anyhow::Result;
use async_trait::async_trait;
use fleet_core::crd::{Image, MarketplaceImage, OsType};
use fleet_core::ReconcileError;

use crate::scaleset::spec::FleetSpec;

const DEFAULT_PUBLISHER: &str = "cncf-upstream";
const DEFAULT_LINUX_OFFER: &str = "capi";
const DEFAULT_WINDOWS_OFFER: &str = "capi-windows";
const DEFAULT_LINUX_OS: &str = "ubuntu-2004";
const DEFAULT_WINDOWS_OS: &str = "windows-2019";
const DEFAULT_IMAGE_VERSION: &str = "latest";

/// A resolver of the boot image of a fleet.
#[async_trait]
pub trait ImageResolver: Send + Sync {
    async fn resolve(&self, spec: &FleetSpec) -> Result<Image>;
}

/// Resolves the spec's explicit image, falling back to the default marketplace image of the
/// pool's Kubernetes version.
#[derive(Clone, Debug, Default)]
pub struct DefaultImageResolver;

#[async_trait]
impl ImageResolver for DefaultImageResolver {
    async fn resolve(&self, spec: &FleetSpec) -> Result<Image> {
        if let Some(image) = spec.pool.template.image.as_ref() {
            return Ok(image.clone());
        }
        let version = match spec.pool.version.as_deref() {
            Some(version) if !version.trim().is_empty() => version,
            _ => return Err(ReconcileError::terminal("unable to pick a default image as the pool has no kubernetes version")),
        };
        let image = default_image(spec.pool.template.os_disk.os_type, version)?;
        tracing::debug!(pool = %spec.pool_name, ?image, "no image specified for pool, using default image");
        Ok(image)
    }
}

/// Build the default marketplace image of the given OS & Kubernetes version.
pub fn default_image(os_type: OsType, version: &str) -> Result<Image> {
    let (major, minor, patch) = parse_version(version)?;
    let (offer, os) = match os_type {
        OsType::Linux => (DEFAULT_LINUX_OFFER, DEFAULT_LINUX_OS),
        OsType::Windows => (DEFAULT_WINDOWS_OFFER, DEFAULT_WINDOWS_OS),
    };
    Ok(Image {
        id: None,
        shared_gallery: None,
        marketplace: Some(MarketplaceImage {
            publisher: DEFAULT_PUBLISHER.into(),
            offer: offer.into(),
            sku: format!("k8s-{}dot{}dot{}-{}", major, minor, patch, os),
            version: DEFAULT_IMAGE_VERSION.into(),
            third_party_image: false,
        }),
    })
}

/// Parse a Kubernetes version such as `v1.22.1` into its numeric components.
///
/// Pre-release & build metadata suffixes are ignored.
fn parse_version(version: &str) -> Result<(u64, u64, u64)> {
    let trimmed = version.trim().trim_start_matches('v');
    let core = trimmed.split(&['-', '+'][..]).next().unwrap_or_default();
    let parts: Vec<&str> = core.split('.').collect();
    if parts.len() != 3 {
        return Err(ReconcileError::terminal(format!("unable to parse kubernetes version {:?}", version)));
    }
    let mut nums = [0u64; 3];
    for (idx, part) in parts.iter().enumerate() {
        nums[idx] = part
            .parse()
            .map_err(|_| ReconcileError::terminal(format!("unable to parse kubernetes version {:?}", version)))?;
    }
    Ok((nums[0], nums[1], nums[2]))
}
