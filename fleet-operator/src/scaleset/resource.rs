//! Canonical scale set representation.
//!
//! These types are what the reconciliation engine compiles, diffs and observes. They are
//! independent of any cloud wire format; conversion to and from the wire happens only inside of
//! the `azure` adapter.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use fleet_core::crd::{EvictionPolicy, IdentityMode, OsType, ProvisioningState};

/// The prefix of all canonical provider IDs.
pub const PROVIDER_ID_PREFIX: &str = "azure://";

/// A virtual machine scale set.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScaleSet {
    /// The resource ID, only known for scale sets returned by the cloud.
    pub id: Option<String>,
    pub name: String,
    pub location: String,
    pub sku: Sku,
    pub zones: Vec<String>,
    pub tags: BTreeMap<String, String>,
    pub plan: Option<Plan>,
    pub identity: Option<ScaleSetIdentity>,
    pub single_placement_group: bool,
    pub overprovision: bool,
    pub upgrade_mode: UpgradeMode,
    pub ultra_ssd_enabled: Option<bool>,
    pub vm_profile: VmProfile,
    /// The provisioning state, only known for scale sets returned by the cloud.
    pub provisioning_state: Option<ProvisioningState>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sku {
    pub name: String,
    pub tier: String,
    pub capacity: i64,
}

/// A marketplace purchase plan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Plan {
    pub name: String,
    pub publisher: String,
    pub product: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScaleSetIdentity {
    pub mode: IdentityMode,
    pub user_assigned_identities: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpgradeMode {
    Manual,
    Automatic,
    Rolling,
}

impl Default for UpgradeMode {
    fn default() -> Self {
        Self::Manual
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Priority {
    Regular,
    Spot,
}

/// The model applied to each instance of a scale set.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VmProfile {
    pub os_profile: Option<OsProfile>,
    pub storage: StorageProfile,
    /// Never part of an outgoing patch, as other components own fields of it.
    pub network: Option<NetworkProfile>,
    pub encryption_at_host: Option<bool>,
    pub priority: Option<Priority>,
    pub eviction_policy: Option<EvictionPolicy>,
    pub max_price: Option<f64>,
    pub terminate_notification: Option<TerminateNotification>,
    pub boot_diagnostics: bool,
    pub extensions: Vec<Extension>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OsProfile {
    pub computer_name_prefix: String,
    pub admin_username: String,
    pub admin_password: Option<String>,
    /// Base64 encoded bootstrap payload. Never returned by the cloud.
    pub custom_data: Option<String>,
    pub linux: Option<LinuxConfiguration>,
    pub windows: Option<WindowsConfiguration>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LinuxConfiguration {
    pub disable_password_authentication: bool,
    pub ssh_public_keys: Vec<SshPublicKey>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SshPublicKey {
    pub path: String,
    pub key_data: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WindowsConfiguration {
    pub enable_automatic_updates: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct StorageProfile {
    pub image: Option<ImageReference>,
    pub os_disk: OsDiskProfile,
    pub data_disks: Vec<DataDiskProfile>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImageReference {
    /// A full resource ID of an image or a shared gallery image version.
    Id(String),
    Marketplace {
        publisher: String,
        offer: String,
        sku: String,
        version: String,
    },
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct OsDiskProfile {
    pub os_type: OsType,
    pub disk_size_gb: Option<u32>,
    pub caching: Option<String>,
    pub storage_account_type: Option<String>,
    pub disk_encryption_set_id: Option<String>,
    pub diff_disk_option: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DataDiskProfile {
    pub name: String,
    pub lun: i32,
    pub disk_size_gb: u32,
    pub caching: Option<String>,
    pub storage_account_type: Option<String>,
    pub disk_encryption_set_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NetworkProfile {
    pub interfaces: Vec<NetworkInterface>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NetworkInterface {
    pub name: String,
    pub primary: bool,
    pub accelerated_networking: bool,
    pub ip_forwarding: bool,
    pub ip_configurations: Vec<IpConfiguration>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IpConfiguration {
    pub name: String,
    pub primary: bool,
    pub subnet_id: String,
    pub load_balancer_backend_pool_ids: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TerminateNotification {
    /// ISO 8601 duration, such as `PT5M`.
    pub not_before_timeout: String,
    pub enable: bool,
}

/// A VM extension installed on every instance.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Extension {
    pub name: String,
    pub publisher: String,
    pub kind: String,
    pub type_handler_version: String,
    pub provisioning_state: Option<ProvisioningState>,
}

/// The body of a scale set update.
///
/// Built from a fully compiled scale set; the network profile is always dropped.
#[derive(Clone, Debug, PartialEq)]
pub struct ScaleSetPatch {
    pub sku: Sku,
    pub tags: BTreeMap<String, String>,
    pub plan: Option<Plan>,
    pub identity: Option<ScaleSetIdentity>,
    pub single_placement_group: bool,
    pub overprovision: bool,
    pub upgrade_mode: UpgradeMode,
    pub ultra_ssd_enabled: Option<bool>,
    pub vm_profile: VmProfile,
}

impl From<&ScaleSet> for ScaleSetPatch {
    fn from(desired: &ScaleSet) -> Self {
        let mut vm_profile = desired.vm_profile.clone();
        vm_profile.network = None;
        Self {
            sku: desired.sku.clone(),
            tags: desired.tags.clone(),
            plan: desired.plan.clone(),
            identity: desired.identity.clone(),
            single_placement_group: desired.single_placement_group,
            overprovision: desired.overprovision,
            upgrade_mode: desired.upgrade_mode,
            ultra_ssd_enabled: desired.ultra_ssd_enabled,
            vm_profile,
        }
    }
}

/// An instance of a scale set.
#[derive(Clone, Debug, PartialEq)]
pub struct Instance {
    pub id: String,
    pub instance_id: String,
    pub name: String,
    pub state: ProvisioningState,
    pub latest_model_applied: bool,
}

impl Instance {
    /// The canonical provider ID of this instance.
    pub fn provider_id(&self) -> String {
        provider_id(&self.id)
    }
}

/// The observed state of a scale set and its instances.
///
/// Built fresh from each fetch and replaced wholesale, never mutated in place.
#[derive(Clone, Debug, PartialEq)]
pub struct ObservedFleet {
    pub id: String,
    pub name: String,
    pub state: ProvisioningState,
    pub capacity: i64,
    pub zones: Vec<String>,
    pub image: Option<ImageReference>,
    pub identity: Option<ScaleSetIdentity>,
    pub tags: BTreeMap<String, String>,
    /// The model as returned by the cloud.
    pub model: ScaleSet,
    pub instances: Vec<Instance>,
}

impl ObservedFleet {
    /// Build a new instance from a fetched scale set and its instances.
    pub fn new(model: ScaleSet, instances: Vec<Instance>) -> Self {
        Self {
            id: model.id.clone().unwrap_or_default(),
            name: model.name.clone(),
            // The cloud always reports a state; a missing one is treated as still in flight.
            state: model.provisioning_state.unwrap_or(ProvisioningState::Updating),
            capacity: model.sku.capacity,
            zones: model.zones.clone(),
            image: model.vm_profile.storage.image.clone(),
            identity: model.identity.clone(),
            tags: model.tags.clone(),
            model,
            instances,
        }
    }

    /// Check if every instance runs the latest model of the scale set.
    pub fn has_latest_model_applied_to_all(&self) -> bool {
        self.instances.iter().all(|instance| instance.latest_model_applied)
    }

    /// All instances keyed by their canonical provider ID.
    pub fn instances_by_provider_id(&self) -> BTreeMap<String, &Instance> {
        self.instances.iter().map(|instance| (instance.provider_id(), instance)).collect()
    }

    /// The canonical provider ID of the scale set.
    pub fn provider_id(&self) -> String {
        provider_id(&self.id)
    }
}

/// Build the canonical provider ID of the given resource ID.
///
/// Resource group names are case-insensitive in the cloud API, and the cloud provider running in
/// the cluster reports them lower-cased, so the resource group segment is normalized.
pub fn provider_id(resource_id: &str) -> String {
    let mut segments: Vec<String> = resource_id.split('/').map(String::from).collect();
    if let Some(idx) = segments.iter().position(|seg| seg.eq_ignore_ascii_case("resourceGroups")) {
        if let Some(group) = segments.get_mut(idx + 1) {
            *group = group.to_lowercase();
        }
    }
    format!("{}{}", PROVIDER_ID_PREFIX, segments.join("/"))
}

/// The location of a scale set instance, as parsed from its provider ID.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceRef {
    pub resource_group: String,
    pub scale_set: String,
    pub instance_id: String,
}

/// Parse the provider ID of a scale set instance.
///
/// Expects `azure:///subscriptions/{sub}/resourceGroups/{rg}/providers/Microsoft.Compute/virtualMachineScaleSets/{name}/virtualMachines/{id}`.
pub fn parse_instance_provider_id(provider_id: &str) -> Result<InstanceRef> {
    let resource_id = provider_id
        .strip_prefix(PROVIDER_ID_PREFIX)
        .with_context(|| format!("provider id {:?} does not start with {}", provider_id, PROVIDER_ID_PREFIX))?;
    let segments: Vec<&str> = resource_id.split('/').filter(|seg| !seg.is_empty()).collect();
    let after = |key: &str| -> Option<String> {
        segments
            .iter()
            .position(|seg| seg.eq_ignore_ascii_case(key))
            .and_then(|idx| segments.get(idx + 1))
            .map(|seg| seg.to_string())
    };
    match (after("resourceGroups"), after("virtualMachineScaleSets"), after("virtualMachines")) {
        (Some(resource_group), Some(scale_set), Some(instance_id)) => Ok(InstanceRef {
            resource_group,
            scale_set,
            instance_id,
        }),
        _ => anyhow::bail!("provider id {:?} is not the id of a scale set instance", provider_id),
    }
}
