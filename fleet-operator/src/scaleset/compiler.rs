//! Compilation of a fleet spec into its canonical desired scale set.
//!
//! The output of `compile` is the desired resource used by both the create and the diff paths, so
//! it must be deterministic for a given spec and set of resolved inputs. The only exception is the
//! random admin password of Windows instances, which lives in the OS profile and is never diffed.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use fleet_core::crd::{EvictionPolicy, IdentityMode, Image, OsType};
use fleet_core::ReconcileError;
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::scaleset::capability::{CAPABILITY_ACCELERATED_NETWORKING, CAPABILITY_ENCRYPTION_AT_HOST};
use crate::scaleset::resource::{
    DataDiskProfile, Extension, ImageReference, IpConfiguration, LinuxConfiguration, NetworkInterface, NetworkProfile, OsDiskProfile, OsProfile, Plan,
    Priority, ScaleSet, ScaleSetIdentity, Sku, SshPublicKey, StorageProfile, TerminateNotification, UpgradeMode, VmProfile, WindowsConfiguration,
};
use crate::scaleset::spec::{FleetSpec, TAG_OWNED};
use crate::scaleset::validation::{has_ultra_ssd_data_disk, requests_encryption_at_host, ValidatedSku};

/// The admin user of all instances.
pub const DEFAULT_USER_NAME: &str = "capi";
/// The sku tier of all scale sets.
pub const SKU_TIER_STANDARD: &str = "Standard";
/// The role tag value of node scale sets.
pub const ROLE_NODE: &str = "node";
/// The tag holding the resource's name.
pub const TAG_NAME: &str = "Name";
/// The tag holding the resource's role.
pub const TAG_ROLE: &str = "fleet.rs_role";

const WINDOWS_PASSWORD_LEN: usize = 123;
const BOOTSTRAP_EXTENSION_PUBLISHER: &str = "Microsoft.Azure.ContainerUpstream";
const BOOTSTRAP_EXTENSION_VERSION: &str = "1.0";

/// Inputs resolved outside of the spec which the compiler needs.
pub struct CompileInputs<'a> {
    /// The subscription of the cluster's network resources.
    pub subscription_id: &'a str,
    /// The resolved boot image.
    pub image: &'a Image,
    /// The base64 encoded bootstrap payload.
    pub bootstrap_data: &'a str,
    /// The capability record of the spec's size class, proving that validation passed.
    pub sku: &'a ValidatedSku,
}

/// Compile the desired scale set of the given spec.
#[tracing::instrument(level = "debug", skip(spec, inputs), fields(name = %spec.name))]
pub fn compile(spec: &FleetSpec, inputs: &CompileInputs<'_>) -> Result<ScaleSet> {
    let sku = inputs.sku.sku();
    let template = &spec.pool.template;

    let accelerated_networking = template
        .accelerated_networking
        .unwrap_or_else(|| sku.has_capability(CAPABILITY_ACCELERATED_NETWORKING));

    let encryption_at_host = match template.security_profile.as_ref() {
        None => None,
        Some(_) if requests_encryption_at_host(spec) && !sku.has_capability(CAPABILITY_ENCRYPTION_AT_HOST) => {
            return Err(ReconcileError::terminal(format!("encryption at host is not supported for VM type {}", spec.vm_size())));
        }
        Some(profile) => profile.encryption_at_host,
    };

    let (priority, eviction_policy, max_price) = match template.spot_vm_options.as_ref() {
        Some(spot) => (Some(Priority::Spot), Some(spot.eviction_policy.unwrap_or(EvictionPolicy::Deallocate)), spot.max_price),
        None => (None, None, None),
    };

    let terminate_notification = template.terminate_notification_timeout.map(|minutes| TerminateNotification {
        not_before_timeout: format!("PT{}M", minutes),
        enable: true,
    });

    let mut ultra_ssd_enabled = if has_ultra_ssd_data_disk(spec) { Some(true) } else { None };
    if let Some(explicit) = template.additional_capabilities.as_ref().and_then(|caps| caps.ultra_ssd_enabled) {
        ultra_ssd_enabled = Some(explicit);
    }

    let vm_profile = VmProfile {
        os_profile: Some(os_profile(spec, inputs.bootstrap_data)?),
        storage: storage_profile(spec, inputs.image)?,
        network: Some(network_profile(spec, inputs.subscription_id, accelerated_networking)),
        encryption_at_host,
        priority,
        eviction_policy,
        max_price,
        terminate_notification,
        boot_diagnostics: true,
        extensions: vec![bootstrap_extension(template.os_disk.os_type)],
    };

    Ok(ScaleSet {
        id: None,
        name: spec.name.clone(),
        location: spec.location().into(),
        sku: Sku {
            name: spec.vm_size().into(),
            tier: SKU_TIER_STANDARD.into(),
            capacity: spec.capacity,
        },
        zones: spec.pool.failure_domains.clone(),
        tags: tags(spec),
        plan: image_plan(inputs.image),
        identity: identity(spec)?,
        single_placement_group: false,
        overprovision: false,
        upgrade_mode: UpgradeMode::Manual,
        ultra_ssd_enabled,
        vm_profile,
        provisioning_state: None,
    })
}

/// Build the tags of the scale set.
///
/// The fixed ownership, role & name tags are applied last and can not be overridden.
pub fn tags(spec: &FleetSpec) -> BTreeMap<String, String> {
    let mut tags = spec.additional_tags();
    tags.insert(ownership_tag_key(spec.cluster_name()), TAG_OWNED.into());
    tags.insert(TAG_ROLE.into(), ROLE_NODE.into());
    tags.insert(TAG_NAME.into(), spec.name.clone());
    tags
}

/// The tag key marking a resource as belonging to the given cluster.
pub fn ownership_tag_key(cluster_name: &str) -> String {
    format!("fleet.rs_cluster_{}", cluster_name)
}

/// Convert the given image into an image reference.
pub fn image_reference(image: &Image) -> Result<ImageReference> {
    if let Some(id) = image.id.as_ref() {
        return Ok(ImageReference::Id(id.clone()));
    }
    if let Some(gallery) = image.shared_gallery.as_ref() {
        return Ok(ImageReference::Id(format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/galleries/{}/images/{}/versions/{}",
            gallery.subscription_id, gallery.resource_group, gallery.gallery, gallery.name, gallery.version
        )));
    }
    if let Some(marketplace) = image.marketplace.as_ref() {
        return Ok(ImageReference::Marketplace {
            publisher: marketplace.publisher.clone(),
            offer: marketplace.offer.clone(),
            sku: marketplace.sku.clone(),
            version: marketplace.version.clone(),
        });
    }
    Err(ReconcileError::terminal("unable to convert image as no options set"))
}

/// The purchase plan required by the given image, if any.
pub fn image_plan(image: &Image) -> Option<Plan> {
    if let Some(gallery) = image.shared_gallery.as_ref() {
        if let (Some(publisher), Some(offer), Some(sku)) = (gallery.publisher.as_ref(), gallery.offer.as_ref(), gallery.sku.as_ref()) {
            return Some(Plan {
                name: sku.clone(),
                publisher: publisher.clone(),
                product: offer.clone(),
            });
        }
    }
    let marketplace = image.marketplace.as_ref().filter(|m| m.third_party_image)?;
    if marketplace.publisher.is_empty() || marketplace.offer.is_empty() || marketplace.sku.is_empty() {
        return None;
    }
    Some(Plan {
        name: marketplace.sku.clone(),
        publisher: marketplace.publisher.clone(),
        product: marketplace.offer.clone(),
    })
}

fn identity(spec: &FleetSpec) -> Result<Option<ScaleSetIdentity>> {
    match spec.pool.identity {
        IdentityMode::None => Ok(None),
        IdentityMode::SystemAssigned => Ok(Some(ScaleSetIdentity {
            mode: IdentityMode::SystemAssigned,
            user_assigned_identities: vec![],
        })),
        IdentityMode::UserAssigned => {
            if spec.pool.user_assigned_identities.is_empty() {
                return Err(ReconcileError::terminal(format!(
                    "failed to assign identity {:?}: no user assigned identities given",
                    spec.name
                )));
            }
            Ok(Some(ScaleSetIdentity {
                mode: IdentityMode::UserAssigned,
                user_assigned_identities: spec.pool.user_assigned_identities.clone(),
            }))
        }
    }
}

fn storage_profile(spec: &FleetSpec, image: &Image) -> Result<StorageProfile> {
    let os_disk = &spec.pool.template.os_disk;
    let data_disks = spec
        .pool
        .template
        .data_disks
        .iter()
        .enumerate()
        .map(|(idx, disk)| DataDiskProfile {
            name: format!("{}_{}", spec.name, disk.name_suffix),
            lun: disk.lun.unwrap_or(idx as i32),
            disk_size_gb: disk.disk_size_gb,
            caching: disk.caching_type.clone(),
            storage_account_type: disk.managed_disk.as_ref().map(|md| md.storage_account_type.clone()),
            disk_encryption_set_id: disk.managed_disk.as_ref().and_then(|md| md.disk_encryption_set_id.clone()),
        })
        .collect();

    Ok(StorageProfile {
        image: Some(image_reference(image).context("failed to convert image")?),
        os_disk: OsDiskProfile {
            os_type: os_disk.os_type,
            disk_size_gb: os_disk.disk_size_gb,
            caching: os_disk.caching_type.clone(),
            storage_account_type: os_disk
                .managed_disk
                .as_ref()
                .map(|md| md.storage_account_type.clone())
                .filter(|val| !val.is_empty()),
            disk_encryption_set_id: os_disk.managed_disk.as_ref().and_then(|md| md.disk_encryption_set_id.clone()),
            diff_disk_option: os_disk.diff_disk_settings.as_ref().map(|settings| settings.option.clone()),
        },
        data_disks,
    })
}

fn os_profile(spec: &FleetSpec, bootstrap_data: &str) -> Result<OsProfile> {
    let mut profile = OsProfile {
        computer_name_prefix: spec.name.clone(),
        admin_username: DEFAULT_USER_NAME.into(),
        admin_password: None,
        custom_data: Some(bootstrap_data.into()),
        linux: None,
        windows: None,
    };
    match spec.pool.template.os_disk.os_type {
        // The password is never used for access, it only satisfies the API. Access goes through
        // the SSH key installed during bootstrap.
        OsType::Windows => {
            let password: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(WINDOWS_PASSWORD_LEN)
                .map(char::from)
                .collect();
            profile.admin_password = Some(password);
            profile.windows = Some(WindowsConfiguration {
                enable_automatic_updates: false,
            });
        }
        OsType::Linux => {
            let decoded = base64::decode(spec.pool.template.ssh_public_key.as_bytes()).context("failed to decode ssh public key")?;
            let key_data = String::from_utf8(decoded).context("ssh public key is not valid utf-8")?;
            profile.linux = Some(LinuxConfiguration {
                disable_password_authentication: true,
                ssh_public_keys: vec![SshPublicKey {
                    path: format!("/home/{}/.ssh/authorized_keys", DEFAULT_USER_NAME),
                    key_data,
                }],
            });
        }
    }
    Ok(profile)
}

fn network_profile(spec: &FleetSpec, subscription_id: &str, accelerated_networking: bool) -> NetworkProfile {
    let network = &spec.pool.network;
    let backend_pools = match (network.public_lb_name.as_ref(), network.public_lb_address_pool_name.as_ref()) {
        (Some(lb), Some(pool)) if !lb.is_empty() && !pool.is_empty() => vec![format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/loadBalancers/{}/backendAddressPools/{}",
            subscription_id,
            spec.resource_group(),
            lb,
            pool
        )],
        _ => vec![],
    };
    NetworkProfile {
        interfaces: vec![NetworkInterface {
            name: spec.name.clone(),
            primary: true,
            accelerated_networking,
            ip_forwarding: true,
            ip_configurations: vec![IpConfiguration {
                name: spec.name.clone(),
                primary: true,
                subnet_id: format!(
                    "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/virtualNetworks/{}/subnets/{}",
                    subscription_id, network.vnet_resource_group, network.vnet_name, spec.pool.template.subnet_name
                ),
                load_balancer_backend_pool_ids: backend_pools,
            }],
        }],
    }
}

/// The VM extension which reports the outcome of node bootstrapping.
pub fn bootstrap_extension(os_type: OsType) -> Extension {
    let (name, kind) = match os_type {
        OsType::Linux => ("Fleet.Linux.Bootstrapping", "linux-bootstrapping"),
        OsType::Windows => ("Fleet.Windows.Bootstrapping", "windows-bootstrapping"),
    };
    Extension {
        name: name.into(),
        publisher: BOOTSTRAP_EXTENSION_PUBLISHER.into(),
        kind: kind.into(),
        type_handler_version: BOOTSTRAP_EXTENSION_VERSION.into(),
        provisioning_state: None,
    }
}
