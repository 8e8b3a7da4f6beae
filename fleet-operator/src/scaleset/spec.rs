use std::collections::BTreeMap;

use fleet_core::crd::{FleetPool, FleetPoolSpec, OsType, RequiredMetadata};

use crate::scaleset::strategy::DeploymentStrategy;

/// Windows computer names are limited in length, so long pool names are shortened.
const WINDOWS_MAX_NAME_LEN: usize = 9;
/// The tag value marking a resource as owned by the cluster.
pub const TAG_OWNED: &str = "owned";

/// The desired state of a scale set, derived from a FleetPool.
///
/// Immutable for the duration of a reconciliation pass.
#[derive(Clone, Debug, PartialEq)]
pub struct FleetSpec {
    /// The name of the scale set, which differs from the pool name for long Windows pool names.
    pub name: String,
    /// The name of the owning pool.
    pub pool_name: String,
    pub capacity: i64,
    pub pool: FleetPoolSpec,
    pub strategy: DeploymentStrategy,
}

impl FleetSpec {
    /// Build a new instance from the given pool.
    pub fn from_pool(pool: &FleetPool) -> Self {
        let pool_name = pool.name().to_string();
        Self {
            name: scale_set_name(&pool_name, pool.spec.template.os_disk.os_type),
            capacity: i64::from(pool.spec.replicas),
            strategy: DeploymentStrategy::from_spec(pool.spec.strategy.as_ref()),
            pool: pool.spec.clone(),
            pool_name,
        }
    }

    pub fn resource_group(&self) -> &str {
        &self.pool.resource_group
    }

    pub fn location(&self) -> &str {
        &self.pool.location
    }

    pub fn vm_size(&self) -> &str {
        &self.pool.template.vm_size
    }

    pub fn cluster_name(&self) -> &str {
        &self.pool.cluster_name
    }

    /// The tags which the cluster & pool request for the scale set.
    ///
    /// Pool tags take precedence over cluster tags. The cloud provider ownership tag is always set.
    pub fn additional_tags(&self) -> BTreeMap<String, String> {
        let mut tags = self.pool.cluster_tags.clone();
        tags.extend(self.pool.additional_tags.clone());
        tags.insert(cloud_provider_tag_key(self.cluster_name()), TAG_OWNED.into());
        tags
    }
}

/// The name of the scale set backing the given pool.
pub fn scale_set_name(pool_name: &str, os_type: OsType) -> String {
    let chars: Vec<char> = pool_name.chars().collect();
    if os_type == OsType::Windows && chars.len() > WINDOWS_MAX_NAME_LEN {
        let suffix: String = chars[chars.len() - 5..].iter().collect();
        return format!("win-{}", suffix);
    }
    pool_name.to_string()
}

/// The tag key used by the in-cluster cloud provider to identify cluster owned resources.
pub fn cloud_provider_tag_key(cluster_name: &str) -> String {
    format!("kubernetes.io_cluster_{}", cluster_name)
}
