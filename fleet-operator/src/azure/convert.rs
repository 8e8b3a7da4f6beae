//! Conversion between the canonical scale set model and the compute API's wire types.

use std::collections::BTreeMap;

use fleet_core::crd::{EvictionPolicy, IdentityMode, OsType, ProvisioningState};

use crate::azure::wire;
use crate::scaleset::capability::{LocationInfo, SkuRecord, ZoneDetail};
use crate::scaleset::resource::{
    DataDiskProfile, Extension, ImageReference, Instance, IpConfiguration, LinuxConfiguration, NetworkInterface, NetworkProfile,
    OsDiskProfile, OsProfile, Plan, Priority, ScaleSet, ScaleSetIdentity, ScaleSetPatch, Sku, SshPublicKey, StorageProfile,
    TerminateNotification, UpgradeMode, VmProfile, WindowsConfiguration,
};

/// Build the body of a create or replace request.
pub fn scale_set_to_wire(scale_set: &ScaleSet) -> wire::VirtualMachineScaleSet {
    wire::VirtualMachineScaleSet {
        id: None,
        name: None,
        location: Some(scale_set.location.clone()),
        sku: Some(sku_to_wire(&scale_set.sku)),
        zones: if scale_set.zones.is_empty() { None } else { Some(scale_set.zones.clone()) },
        tags: Some(scale_set.tags.clone()),
        plan: scale_set.plan.as_ref().map(plan_to_wire),
        identity: scale_set.identity.as_ref().map(identity_to_wire),
        properties: Some(properties_to_wire(
            scale_set.upgrade_mode,
            scale_set.single_placement_group,
            scale_set.overprovision,
            scale_set.ultra_ssd_enabled,
            &scale_set.vm_profile,
        )),
    }
}

/// Build the body of a PATCH request. Location, zones & network are never patched.
pub fn patch_to_wire(patch: &ScaleSetPatch) -> wire::VirtualMachineScaleSet {
    let mut vm_profile = patch.vm_profile.clone();
    vm_profile.network = None;
    wire::VirtualMachineScaleSet {
        sku: Some(sku_to_wire(&patch.sku)),
        tags: Some(patch.tags.clone()),
        plan: patch.plan.as_ref().map(plan_to_wire),
        identity: patch.identity.as_ref().map(identity_to_wire),
        properties: Some(properties_to_wire(
            patch.upgrade_mode,
            patch.single_placement_group,
            patch.overprovision,
            patch.ultra_ssd_enabled,
            &vm_profile,
        )),
        ..Default::default()
    }
}

fn sku_to_wire(sku: &Sku) -> wire::Sku {
    wire::Sku {
        name: Some(sku.name.clone()),
        tier: Some(sku.tier.clone()),
        capacity: Some(sku.capacity),
    }
}

fn plan_to_wire(plan: &Plan) -> wire::Plan {
    wire::Plan {
        name: plan.name.clone(),
        publisher: plan.publisher.clone(),
        product: plan.product.clone(),
    }
}

fn identity_to_wire(identity: &ScaleSetIdentity) -> wire::Identity {
    let type_ = match identity.mode {
        IdentityMode::None => "None",
        IdentityMode::SystemAssigned => "SystemAssigned",
        IdentityMode::UserAssigned => "UserAssigned",
    };
    let user_assigned_identities = if identity.user_assigned_identities.is_empty() {
        None
    } else {
        Some(
            identity
                .user_assigned_identities
                .iter()
                .map(|id| (id.clone(), serde_json::json!({})))
                .collect(),
        )
    };
    wire::Identity {
        type_: type_.into(),
        user_assigned_identities,
    }
}

fn properties_to_wire(
    upgrade_mode: UpgradeMode, single_placement_group: bool, overprovision: bool, ultra_ssd_enabled: Option<bool>, vm: &VmProfile,
) -> wire::ScaleSetProperties {
    let mode = match upgrade_mode {
        UpgradeMode::Manual => "Manual",
        UpgradeMode::Automatic => "Automatic",
        UpgradeMode::Rolling => "Rolling",
    };
    wire::ScaleSetProperties {
        upgrade_policy: Some(wire::UpgradePolicy { mode: mode.into() }),
        single_placement_group: Some(single_placement_group),
        overprovision: Some(overprovision),
        additional_capabilities: ultra_ssd_enabled.map(|enabled| wire::AdditionalCapabilities {
            ultra_ssd_enabled: Some(enabled),
        }),
        virtual_machine_profile: Some(vm_profile_to_wire(vm)),
        provisioning_state: None,
    }
}

fn vm_profile_to_wire(vm: &VmProfile) -> wire::VmProfile {
    wire::VmProfile {
        os_profile: vm.os_profile.as_ref().map(|os| wire::OsProfile {
            computer_name_prefix: Some(os.computer_name_prefix.clone()),
            admin_username: Some(os.admin_username.clone()),
            admin_password: os.admin_password.clone(),
            custom_data: os.custom_data.clone(),
            linux_configuration: os.linux.as_ref().map(|linux| wire::LinuxConfiguration {
                disable_password_authentication: linux.disable_password_authentication,
                ssh: Some(wire::SshConfiguration {
                    public_keys: linux
                        .ssh_public_keys
                        .iter()
                        .map(|key| wire::SshPublicKey {
                            path: key.path.clone(),
                            key_data: key.key_data.clone(),
                        })
                        .collect(),
                }),
            }),
            windows_configuration: os.windows.as_ref().map(|windows| wire::WindowsConfiguration {
                enable_automatic_updates: windows.enable_automatic_updates,
            }),
        }),
        storage_profile: Some(storage_to_wire(&vm.storage)),
        network_profile: vm.network.as_ref().map(network_to_wire),
        security_profile: vm.encryption_at_host.map(|enabled| wire::SecurityProfile {
            encryption_at_host: Some(enabled),
        }),
        priority: vm.priority.map(|priority| match priority {
            Priority::Regular => "Regular".to_string(),
            Priority::Spot => "Spot".to_string(),
        }),
        eviction_policy: vm.eviction_policy.map(|policy| match policy {
            EvictionPolicy::Deallocate => "Deallocate".to_string(),
            EvictionPolicy::Delete => "Delete".to_string(),
        }),
        billing_profile: vm.max_price.map(|max_price| wire::BillingProfile { max_price: Some(max_price) }),
        scheduled_events_profile: vm.terminate_notification.as_ref().map(|notification| wire::ScheduledEventsProfile {
            terminate_notification_profile: Some(wire::TerminateNotificationProfile {
                not_before_timeout: notification.not_before_timeout.clone(),
                enable: notification.enable,
            }),
        }),
        diagnostics_profile: Some(wire::DiagnosticsProfile {
            boot_diagnostics: wire::BootDiagnostics {
                enabled: vm.boot_diagnostics,
            },
        }),
        extension_profile: Some(wire::ExtensionProfile {
            extensions: vm
                .extensions
                .iter()
                .map(|ext| wire::Extension {
                    name: ext.name.clone(),
                    properties: wire::ExtensionProperties {
                        publisher: ext.publisher.clone(),
                        type_: ext.kind.clone(),
                        type_handler_version: ext.type_handler_version.clone(),
                        provisioning_state: None,
                    },
                })
                .collect(),
        }),
    }
}

fn storage_to_wire(storage: &StorageProfile) -> wire::StorageProfile {
    let disk = &storage.os_disk;
    wire::StorageProfile {
        image_reference: storage.image.as_ref().map(image_to_wire),
        os_disk: Some(wire::OsDisk {
            os_type: Some(os_type_str(disk.os_type).into()),
            disk_size_gb: disk.disk_size_gb,
            caching: disk.caching.clone(),
            create_option: Some("FromImage".into()),
            managed_disk: managed_disk_to_wire(disk.storage_account_type.as_ref(), disk.disk_encryption_set_id.as_ref()),
            diff_disk_settings: disk.diff_disk_option.as_ref().map(|option| wire::DiffDiskSettings { option: option.clone() }),
        }),
        data_disks: Some(
            storage
                .data_disks
                .iter()
                .map(|dd| wire::DataDisk {
                    name: Some(dd.name.clone()),
                    lun: dd.lun,
                    disk_size_gb: Some(dd.disk_size_gb),
                    caching: dd.caching.clone(),
                    create_option: Some("Empty".into()),
                    managed_disk: managed_disk_to_wire(dd.storage_account_type.as_ref(), dd.disk_encryption_set_id.as_ref()),
                })
                .collect(),
        ),
    }
}

fn managed_disk_to_wire(storage_account_type: Option<&String>, encryption_set_id: Option<&String>) -> Option<wire::ManagedDisk> {
    if storage_account_type.is_none() && encryption_set_id.is_none() {
        return None;
    }
    Some(wire::ManagedDisk {
        storage_account_type: storage_account_type.cloned(),
        disk_encryption_set: encryption_set_id.map(|id| wire::SubResource { id: id.clone() }),
    })
}

fn image_to_wire(image: &ImageReference) -> wire::ImageReference {
    match image {
        ImageReference::Id(id) => wire::ImageReference {
            id: Some(id.clone()),
            ..Default::default()
        },
        ImageReference::Marketplace {
            publisher,
            offer,
            sku,
            version,
        } => wire::ImageReference {
            id: None,
            publisher: Some(publisher.clone()),
            offer: Some(offer.clone()),
            sku: Some(sku.clone()),
            version: Some(version.clone()),
        },
    }
}

fn network_to_wire(network: &NetworkProfile) -> wire::NetworkProfile {
    wire::NetworkProfile {
        network_interface_configurations: network
            .interfaces
            .iter()
            .map(|nic| wire::NetworkInterfaceConfiguration {
                name: nic.name.clone(),
                properties: wire::NetworkInterfaceProperties {
                    primary: nic.primary,
                    enable_accelerated_networking: nic.accelerated_networking,
                    enable_ip_forwarding: nic.ip_forwarding,
                    ip_configurations: nic
                        .ip_configurations
                        .iter()
                        .map(|ip| wire::IpConfiguration {
                            name: ip.name.clone(),
                            properties: wire::IpConfigurationProperties {
                                primary: ip.primary,
                                subnet: Some(wire::SubResource { id: ip.subnet_id.clone() }),
                                load_balancer_backend_address_pools: ip
                                    .load_balancer_backend_pool_ids
                                    .iter()
                                    .map(|id| wire::SubResource { id: id.clone() })
                                    .collect(),
                            },
                        })
                        .collect(),
                },
            })
            .collect(),
    }
}

fn os_type_str(os_type: OsType) -> &'static str {
    match os_type {
        OsType::Linux => "Linux",
        OsType::Windows => "Windows",
    }
}

/// Parse a provisioning state as reported by the cloud. Unknown states are treated as in flight.
pub fn provisioning_state(state: Option<&str>) -> Option<ProvisioningState> {
    state.map(|state| state.parse().unwrap_or(ProvisioningState::Updating))
}

/// Build the canonical form of a scale set returned by the cloud.
pub fn scale_set_from_wire(ss: wire::VirtualMachineScaleSet) -> ScaleSet {
    let props = ss.properties.unwrap_or_default();
    let vm = props.virtual_machine_profile.unwrap_or_default();
    let sku = ss.sku.unwrap_or_default();
    let upgrade_mode = match props.upgrade_policy.as_ref().map(|policy| policy.mode.to_ascii_lowercase()).as_deref() {
        Some("automatic") => UpgradeMode::Automatic,
        Some("rolling") => UpgradeMode::Rolling,
        _ => UpgradeMode::Manual,
    };
    ScaleSet {
        id: ss.id,
        name: ss.name.unwrap_or_default(),
        location: ss.location.unwrap_or_default(),
        sku: Sku {
            name: sku.name.unwrap_or_default(),
            tier: sku.tier.unwrap_or_default(),
            capacity: sku.capacity.unwrap_or_default(),
        },
        zones: ss.zones.unwrap_or_default(),
        tags: ss.tags.unwrap_or_default(),
        plan: ss.plan.map(|plan| Plan {
            name: plan.name,
            publisher: plan.publisher,
            product: plan.product,
        }),
        identity: ss.identity.map(identity_from_wire),
        single_placement_group: props.single_placement_group.unwrap_or_default(),
        overprovision: props.overprovision.unwrap_or_default(),
        upgrade_mode,
        ultra_ssd_enabled: props.additional_capabilities.and_then(|caps| caps.ultra_ssd_enabled),
        vm_profile: vm_profile_from_wire(vm),
        provisioning_state: provisioning_state(props.provisioning_state.as_deref()),
    }
}

fn identity_from_wire(identity: wire::Identity) -> ScaleSetIdentity {
    // System & user assigned identities combined are reported as a comma separated type.
    let mode = if identity.type_.contains("UserAssigned") {
        IdentityMode::UserAssigned
    } else if identity.type_.contains("SystemAssigned") {
        IdentityMode::SystemAssigned
    } else {
        IdentityMode::None
    };
    ScaleSetIdentity {
        mode,
        user_assigned_identities: identity
            .user_assigned_identities
            .map(|ids| ids.into_keys().collect())
            .unwrap_or_default(),
    }
}

fn vm_profile_from_wire(vm: wire::VmProfile) -> VmProfile {
    VmProfile {
        os_profile: vm.os_profile.map(|os| OsProfile {
            computer_name_prefix: os.computer_name_prefix.unwrap_or_default(),
            admin_username: os.admin_username.unwrap_or_default(),
            admin_password: None,
            custom_data: None,
            linux: os.linux_configuration.map(|linux| LinuxConfiguration {
                disable_password_authentication: linux.disable_password_authentication,
                ssh_public_keys: linux
                    .ssh
                    .map(|ssh| ssh.public_keys)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|key| SshPublicKey {
                        path: key.path,
                        key_data: key.key_data,
                    })
                    .collect(),
            }),
            windows: os.windows_configuration.map(|windows| WindowsConfiguration {
                enable_automatic_updates: windows.enable_automatic_updates,
            }),
        }),
        storage: vm.storage_profile.map(storage_from_wire).unwrap_or_default(),
        network: vm.network_profile.map(network_from_wire),
        encryption_at_host: vm.security_profile.and_then(|sec| sec.encryption_at_host),
        priority: vm.priority.as_deref().map(|priority| {
            if priority.eq_ignore_ascii_case("spot") {
                Priority::Spot
            } else {
                Priority::Regular
            }
        }),
        eviction_policy: vm.eviction_policy.as_deref().map(|policy| {
            if policy.eq_ignore_ascii_case("delete") {
                EvictionPolicy::Delete
            } else {
                EvictionPolicy::Deallocate
            }
        }),
        max_price: vm.billing_profile.and_then(|billing| billing.max_price),
        terminate_notification: vm
            .scheduled_events_profile
            .and_then(|events| events.terminate_notification_profile)
            .map(|notification| TerminateNotification {
                not_before_timeout: notification.not_before_timeout,
                enable: notification.enable,
            }),
        boot_diagnostics: vm.diagnostics_profile.map(|diag| diag.boot_diagnostics.enabled).unwrap_or_default(),
        extensions: vm
            .extension_profile
            .map(|profile| profile.extensions)
            .unwrap_or_default()
            .into_iter()
            .map(|ext| Extension {
                name: ext.name,
                publisher: ext.properties.publisher,
                kind: ext.properties.type_,
                type_handler_version: ext.properties.type_handler_version,
                provisioning_state: provisioning_state(ext.properties.provisioning_state.as_deref()),
            })
            .collect(),
    }
}

fn storage_from_wire(storage: wire::StorageProfile) -> StorageProfile {
    let os_disk = storage.os_disk.unwrap_or_default();
    let os_type = match os_disk.os_type.as_deref() {
        Some(os) if os.eq_ignore_ascii_case("windows") => OsType::Windows,
        _ => OsType::Linux,
    };
    let (storage_account_type, disk_encryption_set_id) = managed_disk_from_wire(os_disk.managed_disk);
    StorageProfile {
        image: storage.image_reference.and_then(image_from_wire),
        os_disk: OsDiskProfile {
            os_type,
            disk_size_gb: os_disk.disk_size_gb,
            caching: os_disk.caching,
            storage_account_type,
            disk_encryption_set_id,
            diff_disk_option: os_disk.diff_disk_settings.map(|settings| settings.option),
        },
        data_disks: storage
            .data_disks
            .unwrap_or_default()
            .into_iter()
            .map(|dd| {
                let (storage_account_type, disk_encryption_set_id) = managed_disk_from_wire(dd.managed_disk);
                DataDiskProfile {
                    name: dd.name.unwrap_or_default(),
                    lun: dd.lun,
                    disk_size_gb: dd.disk_size_gb.unwrap_or_default(),
                    caching: dd.caching,
                    storage_account_type,
                    disk_encryption_set_id,
                }
            })
            .collect(),
    }
}

fn managed_disk_from_wire(disk: Option<wire::ManagedDisk>) -> (Option<String>, Option<String>) {
    match disk {
        Some(disk) => (disk.storage_account_type, disk.disk_encryption_set.map(|set| set.id)),
        None => (None, None),
    }
}

fn image_from_wire(image: wire::ImageReference) -> Option<ImageReference> {
    if let Some(id) = image.id {
        return Some(ImageReference::Id(id));
    }
    match (image.publisher, image.offer, image.sku, image.version) {
        (Some(publisher), Some(offer), Some(sku), Some(version)) => Some(ImageReference::Marketplace {
            publisher,
            offer,
            sku,
            version,
        }),
        _ => None,
    }
}

fn network_from_wire(network: wire::NetworkProfile) -> NetworkProfile {
    NetworkProfile {
        interfaces: network
            .network_interface_configurations
            .into_iter()
            .map(|nic| NetworkInterface {
                name: nic.name,
                primary: nic.properties.primary,
                accelerated_networking: nic.properties.enable_accelerated_networking,
                ip_forwarding: nic.properties.enable_ip_forwarding,
                ip_configurations: nic
                    .properties
                    .ip_configurations
                    .into_iter()
                    .map(|ip| IpConfiguration {
                        name: ip.name,
                        primary: ip.properties.primary,
                        subnet_id: ip.properties.subnet.map(|subnet| subnet.id).unwrap_or_default(),
                        load_balancer_backend_pool_ids: ip
                            .properties
                            .load_balancer_backend_address_pools
                            .into_iter()
                            .map(|pool| pool.id)
                            .collect(),
                    })
                    .collect(),
            })
            .collect(),
    }
}

/// Build the canonical form of a scale set instance returned by the cloud.
pub fn instance_from_wire(vm: wire::VirtualMachineScaleSetVm) -> Instance {
    let props = vm.properties.unwrap_or_default();
    Instance {
        id: vm.id,
        instance_id: vm.instance_id,
        name: vm.name,
        state: provisioning_state(props.provisioning_state.as_deref()).unwrap_or(ProvisioningState::Updating),
        latest_model_applied: props.latest_model_applied,
    }
}

/// Build the capability record of a size class in the given location.
///
/// Zones in which the size class is restricted for the subscription are dropped.
pub fn sku_from_wire(sku: wire::ResourceSku, location: &str) -> SkuRecord {
    let restricted: Vec<String> = sku
        .restrictions
        .iter()
        .filter(|restriction| restriction.type_.eq_ignore_ascii_case("zone"))
        .filter_map(|restriction| restriction.restriction_info.as_ref())
        .flat_map(|info| info.zones.iter().cloned())
        .collect();
    let location_info = sku
        .location_info
        .into_iter()
        .filter(|info| info.location.eq_ignore_ascii_case(location))
        .map(|info| LocationInfo {
            location: info.location,
            zones: info.zones.into_iter().filter(|zone| !restricted.contains(zone)).collect(),
            zone_details: info
                .zone_details
                .into_iter()
                .map(|detail| ZoneDetail {
                    zones: detail.zones,
                    capabilities: capabilities_from_wire(detail.capabilities),
                })
                .collect(),
        })
        .collect();
    SkuRecord {
        name: sku.name,
        capabilities: capabilities_from_wire(sku.capabilities),
        location_info,
    }
}

fn capabilities_from_wire(caps: Vec<wire::SkuCapability>) -> BTreeMap<String, String> {
    caps.into_iter().map(|cap| (cap.name, cap.value)).collect()
}
