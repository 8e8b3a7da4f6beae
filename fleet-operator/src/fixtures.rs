//! Shared test data & in-memory fakes of the engine's collaborators.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use fleet_core::crd::{
    DeploymentStrategySpec, FleetMachine, FleetMachineSpec, FleetMachineStatus, FleetPool, FleetPoolSpec, FleetPoolStatus, Image, MachineTemplate,
    ManagedDisk, MarketplaceImage, NetworkAttachment, OperationCheckpoint, OperationKind, OsDisk, OsType, ProvisioningState, RequiredMetadata,
    STRATEGY_ROLLING_UPDATE,
};
use fleet_core::{CloudError, FINALIZER_MACHINE, FINALIZER_POOL, SERVICE_SCALE_SETS, SERVICE_SCALE_SET_VMS};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::Resource;
use maplit::btreemap;

use crate::scaleset::bootstrap::BootstrapDataSource;
use crate::scaleset::capability::{
    CapabilityLookup, LocationInfo, SkuRecord, ZoneDetail, CAPABILITY_ACCELERATED_NETWORKING, CAPABILITY_MEMORY_GB, CAPABILITY_ULTRA_SSD,
    CAPABILITY_VCPUS,
};
use crate::scaleset::cloud::ScaleSetClient;
use crate::scaleset::compiler::{bootstrap_extension, DEFAULT_USER_NAME, SKU_TIER_STANDARD};
use crate::scaleset::image::DefaultImageResolver;
use crate::scaleset::pass::Collaborators;
use crate::scaleset::resource::{
    ImageReference, Instance, IpConfiguration, LinuxConfiguration, NetworkInterface, NetworkProfile, OsDiskProfile, OsProfile, ScaleSet, ScaleSetPatch,
    Sku, SshPublicKey, StorageProfile, UpgradeMode, VmProfile,
};
use crate::scaleset::spec::FleetSpec;
use crate::scaleset::store::{MachineStore, PoolStore};
use crate::scaleset::validation::{validate, ValidatedSku};

pub const RESOURCE_GROUP: &str = "Cluster0-RG";
pub const LOCATION: &str = "westus2";
pub const CLUSTER_NAME: &str = "cluster0";
pub const NAMESPACE: &str = "default";
pub const SUBSCRIPTION_ID: &str = "6b8a4c63-0f64-4f0e-9d2e-3f2a1c0d5e7b";
pub const VM_SIZE: &str = "Standard_D4s_v3";
pub const VNET_NAME: &str = "cluster0-vnet";
pub const VNET_RESOURCE_GROUP: &str = "cluster0-network";
pub const SUBNET_NAME: &str = "cluster0-node-subnet";
pub const SSH_PUBLIC_KEY: &str = "ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABAQC7fleet fleet@cluster0";
/// Base64 of a small cloud-init script.
pub const BOOTSTRAP_DATA: &str = "I2Nsb3VkLWNvbmZpZwpydW5jbWQ6CiAgLSBrdWJlYWRtIGpvaW4K";

const DEFAULT_ZONES: [&str; 3] = ["1", "2", "3"];

/// A pool of the given size in the default cluster, with a rolling update strategy.
pub fn pool(name: &str, replicas: u32) -> FleetPool {
    let mut pool = FleetPool::new(
        name,
        FleetPoolSpec {
            replicas,
            location: LOCATION.into(),
            resource_group: RESOURCE_GROUP.into(),
            cluster_name: CLUSTER_NAME.into(),
            version: Some("v1.22.1".into()),
            bootstrap_data_secret_name: Some(format!("{}-bootstrap", name)),
            template: MachineTemplate {
                vm_size: VM_SIZE.into(),
                os_disk: OsDisk {
                    os_type: OsType::Linux,
                    disk_size_gb: Some(30),
                    managed_disk: Some(ManagedDisk {
                        storage_account_type: "Premium_LRS".into(),
                        disk_encryption_set_id: None,
                    }),
                    diff_disk_settings: None,
                    caching_type: Some("ReadWrite".into()),
                },
                data_disks: vec![],
                ssh_public_key: base64::encode(SSH_PUBLIC_KEY),
                image: None,
                accelerated_networking: None,
                security_profile: None,
                spot_vm_options: None,
                terminate_notification_timeout: None,
                additional_capabilities: None,
                subnet_name: SUBNET_NAME.into(),
            },
            network: NetworkAttachment {
                vnet_name: VNET_NAME.into(),
                vnet_resource_group: VNET_RESOURCE_GROUP.into(),
                public_lb_name: Some(format!("{}-outbound", CLUSTER_NAME)),
                public_lb_address_pool_name: Some(format!("{}-outboundBackendPool", CLUSTER_NAME)),
            },
            failure_domains: vec![],
            identity: Default::default(),
            user_assigned_identities: vec![],
            cluster_tags: BTreeMap::new(),
            additional_tags: BTreeMap::new(),
            strategy: Some(DeploymentStrategySpec {
                type_: Some(STRATEGY_ROLLING_UPDATE.into()),
                rolling_update: None,
            }),
        },
    );
    let meta = pool.meta_mut();
    meta.namespace = Some(NAMESPACE.into());
    meta.uid = Some(format!("{}-uid", name));
    pool
}

/// A tracking record in state `Succeeded`, created `offset` minutes after a fixed base time.
pub fn machine(name: &str, ready: bool, latest: bool, offset: i64) -> FleetMachine {
    let mut machine = FleetMachine::new(
        name,
        FleetMachineSpec {
            provider_id: format!("azure://{}/virtualMachines/{}", scale_set_id("pool0").to_lowercase(), name),
            instance_id: name.into(),
        },
    );
    let meta = machine.meta_mut();
    meta.namespace = Some(NAMESPACE.into());
    meta.creation_timestamp = Some(Time(Utc.ymd(2021, 10, 1).and_hms(0, 0, 0) + Duration::minutes(offset)));
    machine.status = Some(FleetMachineStatus {
        ready,
        latest_model_applied: latest,
        provisioning_state: Some(ProvisioningState::Succeeded),
        instance_name: Some(name.into()),
        ..Default::default()
    });
    machine
}

/// The resource ID of the scale set of the given name.
pub fn scale_set_id(name: &str) -> String {
    format!(
        "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/virtualMachineScaleSets/{}",
        SUBSCRIPTION_ID, RESOURCE_GROUP, name
    )
}

/// The default image of the pools built by `pool`.
pub fn image() -> Image {
    Image {
        id: None,
        shared_gallery: None,
        marketplace: Some(MarketplaceImage {
            publisher: "cncf-upstream".into(),
            offer: "capi".into(),
            sku: "k8s-1dot22dot1-ubuntu-2004".into(),
            version: "latest".into(),
            third_party_image: false,
        }),
    }
}

/// A fully populated desired scale set, shaped like compiler output.
pub fn scale_set(name: &str, capacity: i64) -> ScaleSet {
    ScaleSet {
        id: None,
        name: name.into(),
        location: LOCATION.into(),
        sku: Sku {
            name: VM_SIZE.into(),
            tier: SKU_TIER_STANDARD.into(),
            capacity,
        },
        zones: vec![],
        tags: btreemap! {
            "Name".to_string() => name.to_string(),
            format!("fleet.rs_cluster_{}", CLUSTER_NAME) => "owned".to_string(),
        },
        plan: None,
        identity: None,
        single_placement_group: false,
        overprovision: false,
        upgrade_mode: UpgradeMode::Manual,
        ultra_ssd_enabled: None,
        vm_profile: VmProfile {
            os_profile: Some(OsProfile {
                computer_name_prefix: name.into(),
                admin_username: DEFAULT_USER_NAME.into(),
                admin_password: None,
                custom_data: Some(BOOTSTRAP_DATA.into()),
                linux: Some(LinuxConfiguration {
                    disable_password_authentication: true,
                    ssh_public_keys: vec![SshPublicKey {
                        path: format!("/home/{}/.ssh/authorized_keys", DEFAULT_USER_NAME),
                        key_data: SSH_PUBLIC_KEY.into(),
                    }],
                }),
                windows: None,
            }),
            storage: StorageProfile {
                image: Some(ImageReference::Marketplace {
                    publisher: "cncf-upstream".into(),
                    offer: "capi".into(),
                    sku: "k8s-1dot22dot1-ubuntu-2004".into(),
                    version: "latest".into(),
                }),
                os_disk: OsDiskProfile {
                    os_type: OsType::Linux,
                    disk_size_gb: Some(30),
                    caching: Some("ReadWrite".into()),
                    storage_account_type: Some("Premium_LRS".into()),
                    disk_encryption_set_id: None,
                    diff_disk_option: None,
                },
                data_disks: vec![],
            },
            network: Some(NetworkProfile {
                interfaces: vec![NetworkInterface {
                    name: name.into(),
                    primary: true,
                    accelerated_networking: true,
                    ip_forwarding: true,
                    ip_configurations: vec![IpConfiguration {
                        name: name.into(),
                        primary: true,
                        subnet_id: format!(
                            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/virtualNetworks/{}/subnets/{}",
                            SUBSCRIPTION_ID, VNET_RESOURCE_GROUP, VNET_NAME, SUBNET_NAME
                        ),
                        load_balancer_backend_pool_ids: vec![],
                    }],
                }],
            }),
            encryption_at_host: None,
            priority: None,
            eviction_policy: None,
            max_price: None,
            terminate_notification: None,
            boot_diagnostics: true,
            extensions: vec![bootstrap_extension(OsType::Linux)],
        },
        provisioning_state: None,
    }
}

/// A scale set as returned by the cloud.
pub fn observed_scale_set(name: &str, capacity: i64, state: ProvisioningState) -> ScaleSet {
    let mut scale_set = scale_set(name, capacity);
    scale_set.id = Some(scale_set_id(name));
    scale_set.provisioning_state = Some(state);
    scale_set
}

/// A running instance of the given scale set.
pub fn instance(scale_set: &str, instance_id: &str, latest: bool) -> Instance {
    Instance {
        id: format!("{}/virtualMachines/{}", scale_set_id(scale_set), instance_id),
        instance_id: instance_id.into(),
        name: format!("{}_{}", scale_set, instance_id),
        state: ProvisioningState::Succeeded,
        latest_model_applied: latest,
    }
}

/// A capability record of `VM_SIZE` offered in all zones of `LOCATION`.
pub fn sku(vcpus: &str, memory_gb: &str) -> SkuRecord {
    SkuRecord {
        name: VM_SIZE.into(),
        capabilities: btreemap! {
            CAPABILITY_VCPUS.to_string() => vcpus.to_string(),
            CAPABILITY_MEMORY_GB.to_string() => memory_gb.to_string(),
            CAPABILITY_ACCELERATED_NETWORKING.to_string() => "True".to_string(),
        },
        location_info: vec![LocationInfo {
            location: LOCATION.into(),
            zones: DEFAULT_ZONES.iter().map(|zone| zone.to_string()).collect(),
            zone_details: vec![],
        }],
    }
}

/// Same as `sku`, with ultra SSD support in every zone.
pub fn sku_with_ultra_ssd(vcpus: &str, memory_gb: &str) -> SkuRecord {
    let mut record = sku(vcpus, memory_gb);
    for info in record.location_info.iter_mut() {
        info.zone_details.push(ZoneDetail {
            zones: info.zones.clone(),
            capabilities: btreemap! { CAPABILITY_ULTRA_SSD.to_string() => "True".to_string() },
        });
    }
    record
}

/// Validate the given spec against the given capability record.
pub async fn validated_sku(spec: &FleetSpec, sku: SkuRecord) -> Result<ValidatedSku> {
    validate(spec, &FakeCapabilities::new(sku)).await
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

//////////////////////////////////////////////////////////////////////////////
// Capabilities //////////////////////////////////////////////////////////////

/// A capability lookup knowing at most a single size class.
#[derive(Default)]
pub struct FakeCapabilities {
    pub sku: Option<SkuRecord>,
    /// The number of zone lookups made.
    pub zone_calls: AtomicUsize,
    pub zones_unavailable: bool,
    pub lookup_unavailable: bool,
}

impl FakeCapabilities {
    pub fn new(sku: SkuRecord) -> Self {
        Self {
            sku: Some(sku),
            ..Default::default()
        }
    }
}

#[async_trait]
impl CapabilityLookup for FakeCapabilities {
    async fn get(&self, size: &str, _location: &str) -> Result<SkuRecord> {
        if self.lookup_unavailable {
            return Err(CloudError::Transport("connection reset by peer".into()).into());
        }
        match self.sku.as_ref() {
            Some(sku) if sku.name.eq_ignore_ascii_case(size) => Ok(sku.clone()),
            _ => Err(CloudError::NotFound(format!("sku {}", size)).into()),
        }
    }

    async fn zones(&self, _location: &str) -> Result<Vec<String>> {
        self.zone_calls.fetch_add(1, Ordering::SeqCst);
        if self.zones_unavailable {
            return Err(CloudError::Transport("connection reset by peer".into()).into());
        }
        Ok(DEFAULT_ZONES.iter().map(|zone| zone.to_string()).collect())
    }

    async fn zones_for_size(&self, _size: &str, location: &str) -> Result<Vec<String>> {
        self.zone_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .sku
            .iter()
            .flat_map(|sku| sku.location_info.iter())
            .filter(|info| info.location.eq_ignore_ascii_case(location))
            .flat_map(|info| info.zones.iter().cloned())
            .collect())
    }
}

//////////////////////////////////////////////////////////////////////////////
// Cloud /////////////////////////////////////////////////////////////////////

#[derive(Default)]
struct CloudState {
    scale_set: Option<ScaleSet>,
    instances: Vec<Instance>,
    next_instance_id: u32,
    calls: Vec<String>,
    pending: bool,
    failed: bool,
    conflict: bool,
    last_create: Option<ScaleSet>,
    last_patch: Option<ScaleSetPatch>,
}

impl CloudState {
    fn add_instances(&mut self, name: &str, count: usize) {
        for _ in 0..count {
            let id = self.next_instance_id.to_string();
            self.next_instance_id += 1;
            self.instances.push(instance(name, &id, true));
        }
    }
}

/// An in-memory cloud holding at most a single scale set.
///
/// Operations are accepted immediately and complete on their first poll, unless the cloud is set
/// to be pending or failing.
#[derive(Default)]
pub struct FakeCloud {
    state: Mutex<CloudState>,
}

const MUTATING_CALLS: [&str; 4] = ["create_or_update", "update", "delete", "delete_instance"];

impl FakeCloud {
    /// Seed the cloud with the given scale set & instances.
    pub fn seed(&self, scale_set: ScaleSet, instances: Vec<Instance>) {
        let mut state = lock(&self.state);
        state.next_instance_id = instances.len() as u32;
        state.scale_set = Some(scale_set);
        state.instances = instances;
    }

    /// All calls made, in order.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    /// All mutating calls made, in order.
    pub fn mutating_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.split(' ').next().map(|op| MUTATING_CALLS.contains(&op)).unwrap_or(false))
            .collect()
    }

    pub fn clear_calls(&self) {
        lock(&self.state).calls.clear();
    }

    pub fn last_create(&self) -> Option<ScaleSet> {
        lock(&self.state).last_create.clone()
    }

    pub fn last_patch(&self) -> Option<ScaleSetPatch> {
        lock(&self.state).last_patch.clone()
    }

    /// Keep all operations in flight.
    pub fn set_pending(&self, val: bool) {
        lock(&self.state).pending = val;
    }

    /// Fail all operations on their next poll.
    pub fn set_failed(&self, val: bool) {
        lock(&self.state).failed = val;
    }

    /// Reject all patches with a conflict.
    pub fn set_conflict(&self, val: bool) {
        lock(&self.state).conflict = val;
    }
}

#[async_trait]
impl ScaleSetClient for FakeCloud {
    async fn get(&self, _resource_group: &str, name: &str) -> Result<ScaleSet, CloudError> {
        let mut state = lock(&self.state);
        state.calls.push(format!("get {}", name));
        state.scale_set.clone().ok_or_else(|| CloudError::NotFound(format!("scale set {}", name)))
    }

    async fn list_instances(&self, _resource_group: &str, name: &str) -> Result<Vec<Instance>, CloudError> {
        let mut state = lock(&self.state);
        state.calls.push(format!("list_instances {}", name));
        match state.scale_set {
            Some(_) => Ok(state.instances.clone()),
            None => Err(CloudError::NotFound(format!("scale set {}", name))),
        }
    }

    async fn create_or_update_async(&self, resource_group: &str, name: &str, scale_set: &ScaleSet) -> Result<OperationCheckpoint, CloudError> {
        let mut state = lock(&self.state);
        state.calls.push(format!("create_or_update {}", name));
        state.last_create = Some(scale_set.clone());

        let mut created = scale_set.clone();
        created.id = Some(scale_set_id(name));
        created.provisioning_state = Some(ProvisioningState::Creating);
        state.scale_set = Some(created);
        state.instances.clear();
        state.add_instances(name, scale_set.sku.capacity.max(0) as usize);
        Ok(OperationCheckpoint::new(
            OperationKind::Create,
            SERVICE_SCALE_SETS,
            resource_group,
            name,
            format!("operations/create-{}", name),
        ))
    }

    async fn update_async(&self, resource_group: &str, name: &str, patch: &ScaleSetPatch) -> Result<OperationCheckpoint, CloudError> {
        let mut state = lock(&self.state);
        state.calls.push(format!("update {}", name));
        if state.conflict {
            return Err(CloudError::Conflict(format!("scale set {} was modified concurrently", name)));
        }
        state.last_patch = Some(patch.clone());
        let mut current = state.scale_set.clone().ok_or_else(|| CloudError::NotFound(format!("scale set {}", name)))?;

        let network = current.vm_profile.network.take();
        let model_changed = current.vm_profile.storage != patch.vm_profile.storage || current.tags != patch.tags;
        current.sku = patch.sku.clone();
        current.tags = patch.tags.clone();
        current.plan = patch.plan.clone();
        current.identity = patch.identity.clone();
        current.ultra_ssd_enabled = patch.ultra_ssd_enabled;
        current.vm_profile = patch.vm_profile.clone();
        current.vm_profile.network = network;
        current.provisioning_state = Some(ProvisioningState::Updating);

        if model_changed {
            state.instances.iter_mut().for_each(|instance| instance.latest_model_applied = false);
        }
        let target = patch.sku.capacity.max(0) as usize;
        if target > state.instances.len() {
            let missing = target - state.instances.len();
            state.add_instances(name, missing);
        } else {
            state.instances.truncate(target);
        }
        state.scale_set = Some(current);
        Ok(OperationCheckpoint::new(
            OperationKind::Update,
            SERVICE_SCALE_SETS,
            resource_group,
            name,
            format!("operations/update-{}", name),
        ))
    }

    async fn delete_async(&self, resource_group: &str, name: &str) -> Result<OperationCheckpoint, CloudError> {
        let mut state = lock(&self.state);
        state.calls.push(format!("delete {}", name));
        if state.scale_set.take().is_none() {
            return Err(CloudError::NotFound(format!("scale set {}", name)));
        }
        state.instances.clear();
        Ok(OperationCheckpoint::new(
            OperationKind::Delete,
            SERVICE_SCALE_SETS,
            resource_group,
            name,
            format!("operations/delete-{}", name),
        ))
    }

    async fn get_result_if_done(&self, checkpoint: &OperationCheckpoint) -> Result<Option<ScaleSet>, CloudError> {
        let mut state = lock(&self.state);
        state.calls.push(format!("get_result_if_done {}", checkpoint.name));
        if state.failed {
            return Err(CloudError::OperationFailed(format!("{:?} of {} failed", checkpoint.kind, checkpoint.name)));
        }
        if state.pending {
            return Err(CloudError::OperationNotDone(checkpoint.data.clone()));
        }
        if checkpoint.kind == OperationKind::Delete {
            return Ok(None);
        }
        match state.scale_set.as_mut() {
            Some(scale_set) => {
                scale_set.provisioning_state = Some(ProvisioningState::Succeeded);
                Ok(Some(scale_set.clone()))
            }
            None => Err(CloudError::NotFound(format!("scale set {}", checkpoint.name))),
        }
    }

    async fn get_instance(&self, _resource_group: &str, name: &str, instance_id: &str) -> Result<Instance, CloudError> {
        let mut state = lock(&self.state);
        state.calls.push(format!("get_instance {}/{}", name, instance_id));
        state
            .instances
            .iter()
            .find(|instance| instance.instance_id == instance_id)
            .cloned()
            .ok_or_else(|| CloudError::NotFound(format!("instance {} of scale set {}", instance_id, name)))
    }

    async fn delete_instance_async(&self, resource_group: &str, name: &str, instance_id: &str) -> Result<OperationCheckpoint, CloudError> {
        let mut state = lock(&self.state);
        state.calls.push(format!("delete_instance {}/{}", name, instance_id));
        let idx = state
            .instances
            .iter()
            .position(|instance| instance.instance_id == instance_id)
            .ok_or_else(|| CloudError::NotFound(format!("instance {} of scale set {}", instance_id, name)))?;
        state.instances.remove(idx);
        if let Some(scale_set) = state.scale_set.as_mut() {
            scale_set.sku.capacity -= 1;
        }
        Ok(OperationCheckpoint::new(
            OperationKind::Delete,
            SERVICE_SCALE_SET_VMS,
            resource_group,
            instance_id,
            format!("operations/delete-{}-{}", name, instance_id),
        ))
    }
}

//////////////////////////////////////////////////////////////////////////////
// Stores ////////////////////////////////////////////////////////////////////

/// An in-memory store of tracking records, recording all mutating calls.
#[derive(Default)]
pub struct FakeMachineStore {
    records: Mutex<BTreeMap<String, FleetMachine>>,
    calls: Mutex<Vec<String>>,
}

impl FakeMachineStore {
    /// Insert the given record without recording a call.
    pub fn insert(&self, machine: FleetMachine) {
        lock(&self.records).insert(machine.name().to_string(), machine);
    }

    pub fn stored(&self, name: &str) -> Option<FleetMachine> {
        lock(&self.records).get(name).cloned()
    }

    /// The names of all stored records.
    pub fn names(&self) -> Vec<String> {
        lock(&self.records).keys().cloned().collect()
    }

    /// All mutating calls made, in order.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    fn record(&self, call: String) {
        lock(&self.calls).push(call);
    }
}

#[async_trait]
impl MachineStore for FakeMachineStore {
    async fn get(&self, _namespace: &str, name: &str) -> Result<Option<FleetMachine>> {
        Ok(self.stored(name))
    }

    async fn list(&self, namespace: &str, labels: &BTreeMap<String, String>) -> Result<Vec<FleetMachine>> {
        Ok(lock(&self.records)
            .values()
            .filter(|machine| machine.namespace() == namespace)
            .filter(|machine| {
                let actual = machine.meta().labels.as_ref();
                labels.iter().all(|(key, val)| actual.and_then(|all| all.get(key)) == Some(val))
            })
            .cloned()
            .collect())
    }

    async fn create(&self, machine: &FleetMachine) -> Result<FleetMachine> {
        self.record(format!("create {}", machine.name()));
        let mut created = machine.clone();
        created.meta_mut().creation_timestamp = Some(Time(Utc::now()));
        self.insert(created.clone());
        Ok(created)
    }

    async fn delete(&self, _namespace: &str, name: &str) -> Result<()> {
        self.record(format!("delete {}", name));
        lock(&self.records).remove(name);
        Ok(())
    }

    async fn update_status(&self, machine: &FleetMachine) -> Result<()> {
        self.record(format!("update_status {}", machine.name()));
        let mut records = lock(&self.records);
        let stored = records.entry(machine.name().to_string()).or_insert_with(|| machine.clone());
        stored.status = machine.status.clone();
        Ok(())
    }

    async fn remove_finalizer(&self, machine: &FleetMachine) -> Result<()> {
        self.record(format!("remove_finalizer {}", machine.name()));
        if let Some(stored) = lock(&self.records).get_mut(machine.name()) {
            if let Some(finalizers) = stored.meta_mut().finalizers.as_mut() {
                finalizers.retain(|f| f != FINALIZER_MACHINE);
            }
        }
        Ok(())
    }
}

/// A pool store recording all calls & written statuses.
#[derive(Default)]
pub struct FakePoolStore {
    pools: Mutex<BTreeMap<String, FleetPool>>,
    calls: Mutex<Vec<String>>,
    statuses: Mutex<Vec<FleetPoolStatus>>,
}

impl FakePoolStore {
    /// Insert the given pool without recording a call.
    pub fn insert(&self, pool: FleetPool) {
        lock(&self.pools).insert(pool.name().to_string(), pool);
    }

    pub fn stored(&self, name: &str) -> Option<FleetPool> {
        lock(&self.pools).get(name).cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// The most recently written status.
    pub fn last_status(&self) -> Option<FleetPoolStatus> {
        lock(&self.statuses).last().cloned()
    }
}

#[async_trait]
impl PoolStore for FakePoolStore {
    async fn get(&self, _namespace: &str, name: &str) -> Result<Option<FleetPool>> {
        Ok(self.stored(name))
    }

    async fn add_finalizer(&self, pool: &FleetPool) -> Result<()> {
        lock(&self.calls).push(format!("add_finalizer {}", pool.name()));
        if let Some(stored) = lock(&self.pools).get_mut(pool.name()) {
            let finalizers = stored.meta_mut().finalizers.get_or_insert_with(Vec::new);
            if !finalizers.iter().any(|f| f == FINALIZER_POOL) {
                finalizers.push(FINALIZER_POOL.into());
            }
        }
        Ok(())
    }

    async fn remove_finalizer(&self, pool: &FleetPool) -> Result<()> {
        lock(&self.calls).push(format!("remove_finalizer {}", pool.name()));
        if let Some(stored) = lock(&self.pools).get_mut(pool.name()) {
            if let Some(finalizers) = stored.meta_mut().finalizers.as_mut() {
                finalizers.retain(|f| f != FINALIZER_POOL);
            }
        }
        Ok(())
    }

    async fn update_status(&self, pool: &FleetPool, status: &FleetPoolStatus) -> Result<()> {
        lock(&self.calls).push(format!("update_status {}", pool.name()));
        lock(&self.statuses).push(status.clone());
        if let Some(stored) = lock(&self.pools).get_mut(pool.name()) {
            stored.status = Some(status.clone());
        }
        Ok(())
    }
}

/// A bootstrap source which hands out `BOOTSTRAP_DATA` for every secret.
pub struct FakeBootstrap;

#[async_trait]
impl BootstrapDataSource for FakeBootstrap {
    async fn get(&self, _namespace: &str, _secret_name: &str) -> Result<String> {
        Ok(BOOTSTRAP_DATA.into())
    }
}

//////////////////////////////////////////////////////////////////////////////
// Harness ///////////////////////////////////////////////////////////////////

/// A set of collaborators backed by fakes, with handles on the fakes for inspection.
pub struct Harness {
    pub deps: Collaborators,
    pub cloud: Arc<FakeCloud>,
    pub machines: Arc<FakeMachineStore>,
    pub pools: Arc<FakePoolStore>,
}

impl Harness {
    pub fn new(capabilities: FakeCapabilities) -> Self {
        let cloud = Arc::new(FakeCloud::default());
        let machines = Arc::new(FakeMachineStore::default());
        let pools = Arc::new(FakePoolStore::default());
        let deps = Collaborators {
            cloud: cloud.clone(),
            capabilities: Arc::new(capabilities),
            images: Arc::new(DefaultImageResolver),
            bootstrap: Arc::new(FakeBootstrap),
            machines: machines.clone(),
            pools: pools.clone(),
            subscription_id: SUBSCRIPTION_ID.into(),
        };
        Self { deps, cloud, machines, pools }
    }
}
