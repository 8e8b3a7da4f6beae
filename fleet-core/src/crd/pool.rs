//! FleetPool CRD.
//!
//! A FleetPool declares a cloud VM scale set backing one pool of cluster nodes. The code here is
//! used to generate the actual CRD used in K8s. See examples/crd.rs.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::{Condition, OperationCheckpoint, ProvisioningState};

pub type FleetPool = FleetPoolCRD; // Mostly to resolve a Rust Analyzer issue.

/// The strategy type discriminator which enables rolling updates.
pub const STRATEGY_ROLLING_UPDATE: &str = "RollingUpdate";

/// CRD spec for the FleetPool resource.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    struct = "FleetPoolCRD",
    status = "FleetPoolStatus",
    group = "fleet.rs",
    version = "v1beta1",
    kind = "FleetPool",
    namespaced,
    derive = "PartialEq",
    apiextensions = "v1",
    shortname = "fleetpool",
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".status.replicas"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.provisioningState"}"#,
    printcolumn = r#"{"name":"VM Size","type":"string","jsonPath":".spec.template.vmSize"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FleetPoolSpec {
    /// The desired number of instances in the scale set.
    pub replicas: u32,
    /// The cloud region in which the scale set lives.
    pub location: String,
    /// The resource group in which the scale set lives.
    pub resource_group: String,
    /// The name of the cluster to which this pool belongs.
    pub cluster_name: String,
    /// The Kubernetes version of the pool's nodes, used to pick a default image.
    #[serde(default)]
    pub version: Option<String>,
    /// The name of the secret holding the bootstrap payload under its `value` key.
    #[serde(default)]
    pub bootstrap_data_secret_name: Option<String>,

    /// The template of each instance of the scale set.
    pub template: MachineTemplate,
    /// The network to which instances are attached.
    pub network: NetworkAttachment,
    /// The availability zones across which instances are spread.
    #[serde(default)]
    pub failure_domains: Vec<String>,

    /// The identity assigned to the scale set.
    #[serde(default)]
    pub identity: IdentityMode,
    /// The resource IDs of user assigned identities, used with the `UserAssigned` identity.
    #[serde(default)]
    pub user_assigned_identities: Vec<String>,

    /// Tags applied to all resources of the cluster.
    #[serde(default)]
    pub cluster_tags: BTreeMap<String, String>,
    /// Tags applied to the scale set. These take precedence over cluster tags.
    #[serde(default)]
    pub additional_tags: BTreeMap<String, String>,

    /// The deployment strategy used to roll out model changes & to shrink the pool.
    #[serde(default)]
    pub strategy: Option<DeploymentStrategySpec>,
}

/// The template of each instance of the scale set.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineTemplate {
    /// The size class of each instance.
    pub vm_size: String,
    pub os_disk: OsDisk,
    #[serde(default)]
    pub data_disks: Vec<DataDisk>,
    /// Base64 encoded SSH public key installed for the admin user of Linux instances.
    #[serde(default)]
    pub ssh_public_key: String,
    /// An explicit image to use. When absent a default image is derived from the pool's version.
    #[serde(default)]
    pub image: Option<Image>,
    /// Override of accelerated networking. Defaults to the size class's capability.
    #[serde(default)]
    pub accelerated_networking: Option<bool>,
    #[serde(default)]
    pub security_profile: Option<SecurityProfile>,
    #[serde(default)]
    pub spot_vm_options: Option<SpotVmOptions>,
    /// Minutes to wait on a termination notification before an instance is deleted.
    #[serde(default)]
    pub terminate_notification_timeout: Option<u32>,
    #[serde(default)]
    pub additional_capabilities: Option<AdditionalCapabilities>,
    /// The subnet of the pool's virtual network in which instances are placed.
    pub subnet_name: String,
}

/// The OS disk of each instance.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OsDisk {
    #[serde(default)]
    pub os_type: OsType,
    #[serde(default)]
    pub disk_size_gb: Option<u32>,
    #[serde(default)]
    pub managed_disk: Option<ManagedDisk>,
    #[serde(default)]
    pub diff_disk_settings: Option<DiffDiskSettings>,
    #[serde(default)]
    pub caching_type: Option<String>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum OsType {
    Linux,
    Windows,
}

impl Default for OsType {
    fn default() -> Self {
        Self::Linux
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagedDisk {
    pub storage_account_type: String,
    #[serde(default)]
    pub disk_encryption_set_id: Option<String>,
}

/// Ephemeral OS disk settings.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DiffDiskSettings {
    /// The ephemeral disk placement, currently only `Local`.
    pub option: String,
}

/// A data disk attached to each instance.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataDisk {
    /// Suffix appended to the scale set name to build the disk name.
    pub name_suffix: String,
    pub disk_size_gb: u32,
    #[serde(default)]
    pub lun: Option<i32>,
    #[serde(default)]
    pub managed_disk: Option<ManagedDisk>,
    #[serde(default)]
    pub caching_type: Option<String>,
}

/// The boot image of each instance. Exactly one option should be set.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    /// A full resource ID of an image.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub shared_gallery: Option<SharedGalleryImage>,
    #[serde(default)]
    pub marketplace: Option<MarketplaceImage>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SharedGalleryImage {
    pub subscription_id: String,
    pub resource_group: String,
    pub gallery: String,
    pub name: String,
    pub version: String,
    /// Purchase plan publisher, set for images built from third party marketplace images.
    #[serde(default)]
    pub publisher: Option<String>,
    #[serde(default)]
    pub offer: Option<String>,
    #[serde(default)]
    pub sku: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MarketplaceImage {
    pub publisher: String,
    pub offer: String,
    pub sku: String,
    pub version: String,
    /// Third party images require a purchase plan to be attached to the scale set.
    #[serde(default)]
    pub third_party_image: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecurityProfile {
    #[serde(default)]
    pub encryption_at_host: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SpotVmOptions {
    /// The maximum hourly price, `-1` meaning up to the on-demand price.
    #[serde(default)]
    pub max_price: Option<f64>,
    #[serde(default)]
    pub eviction_policy: Option<EvictionPolicy>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum EvictionPolicy {
    Deallocate,
    Delete,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalCapabilities {
    /// Explicitly enable or disable ultra SSD support, overriding what the data disks imply.
    #[serde(default)]
    pub ultra_ssd_enabled: Option<bool>,
}

/// The network to which instances are attached.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAttachment {
    pub vnet_name: String,
    pub vnet_resource_group: String,
    /// The outbound load balancer of the cluster's nodes.
    #[serde(default)]
    pub public_lb_name: Option<String>,
    #[serde(default)]
    pub public_lb_address_pool_name: Option<String>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum IdentityMode {
    None,
    SystemAssigned,
    UserAssigned,
}

impl Default for IdentityMode {
    fn default() -> Self {
        Self::None
    }
}

/// The deployment strategy of a pool.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStrategySpec {
    /// The strategy discriminator. Only `RollingUpdate` is currently recognized.
    #[serde(rename = "type", default)]
    pub type_: Option<String>,
    #[serde(default)]
    pub rolling_update: Option<RollingUpdateSpec>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RollingUpdateSpec {
    /// Instances which may be created above the desired count during an update. Defaults to 1.
    #[serde(default)]
    pub max_surge: Option<IntOrPercent>,
    /// Instances which may be unavailable during an update. Defaults to 0.
    #[serde(default)]
    pub max_unavailable: Option<IntOrPercent>,
    #[serde(default)]
    pub delete_policy: Option<DeletePolicy>,
}

/// An absolute count, or a percentage such as `"25%"`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
#[serde(untagged)]
pub enum IntOrPercent {
    Int(i32),
    Percent(String),
}

/// The order in which machines are picked for deletion.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum DeletePolicy {
    Oldest,
    Newest,
    Random,
}

impl Default for DeletePolicy {
    fn default() -> Self {
        Self::Oldest
    }
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FleetPoolStatus {
    /// True when the scale set is provisioned with the desired number of ready replicas.
    #[serde(default)]
    pub ready: bool,
    /// The number of ready machines.
    #[serde(default)]
    pub replicas: u32,
    #[serde(default)]
    pub provisioning_state: Option<ProvisioningState>,
    /// The canonical provider ID of the scale set.
    #[serde(default)]
    pub provider_id: Option<String>,
    /// The provider IDs of all machines of the pool.
    #[serde(default)]
    pub provider_id_list: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Outstanding long-running cloud operations.
    #[serde(default)]
    pub long_running_operation_states: Vec<OperationCheckpoint>,
    /// The image most recently resolved for the pool.
    #[serde(default)]
    pub image: Option<Image>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub failure_message: Option<String>,
}
