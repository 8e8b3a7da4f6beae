//! Diff & surge engine.
//!
//! Decides whether an existing scale set needs to be patched and, during rolling updates, by how
//! much its capacity should temporarily surge above the desired count.

use crate::scaleset::resource::{DataDiskProfile, ObservedFleet, OsDiskProfile, ScaleSet, ScaleSetPatch};

/// The outcome of comparing an observed scale set with its desired state.
#[derive(Clone, Debug, PartialEq)]
pub enum UpdatePlan {
    /// Nothing to change.
    NoOp,
    /// The scale set should be patched with the given body.
    Patch(ScaleSetPatch),
}

/// Plan the update of the observed scale set towards the desired one.
///
/// `surge` is the number of instances the deployment strategy allows above the desired capacity.
/// Decreases in capacity never produce a patch on their own; those are driven by deleting machines.
pub fn plan_update(observed: &ObservedFleet, desired: &ScaleSet, surge: i64) -> UpdatePlan {
    let model_changed = has_model_changes(observed, desired);
    let mut patch = ScaleSetPatch::from(desired);
    patch.sku.capacity = target_capacity(desired.sku.capacity, surge, model_changed, observed.has_latest_model_applied_to_all());

    if patch.sku.capacity <= observed.capacity && !model_changed {
        tracing::debug!(
            name = %desired.name,
            target = patch.sku.capacity,
            observed = observed.capacity,
            "nothing to update on scale set"
        );
        return UpdatePlan::NoOp;
    }
    tracing::debug!(name = %desired.name, target = patch.sku.capacity, model_changed, "scale set needs to be patched");
    UpdatePlan::Patch(patch)
}

/// Compute the capacity a patch should request.
///
/// Surges above the desired capacity only while a model change is being rolled out.
pub fn target_capacity(desired: i64, surge: i64, model_changed: bool, all_latest: bool) -> i64 {
    if surge > 0 && (model_changed || !all_latest) {
        desired + surge
    } else {
        desired
    }
}

/// Check if the desired scale set differs from the observed one in any field which changes the
/// model of its instances.
///
/// Capacity, the network profile, the OS profile & extensions are never compared. The cloud does
/// not return custom data, and the network profile is co-owned by the in-cluster cloud provider.
/// Optional disk fields which the desired state leaves unset are left to the cloud's defaults.
pub fn has_model_changes(observed: &ObservedFleet, desired: &ScaleSet) -> bool {
    let model = &observed.model;
    let (ovm, dvm) = (&model.vm_profile, &desired.vm_profile);
    let mut observed_zones = observed.zones.clone();
    let mut desired_zones = desired.zones.clone();
    observed_zones.sort();
    desired_zones.sort();

    model.sku.name != desired.sku.name
        || !model.sku.tier.eq_ignore_ascii_case(&desired.sku.tier)
        || observed.image != dvm.storage.image
        || observed.identity != desired.identity
        || observed_zones != desired_zones
        || observed.tags != desired.tags
        || !os_disk_matches(&ovm.storage.os_disk, &dvm.storage.os_disk)
        || !data_disks_match(&ovm.storage.data_disks, &dvm.storage.data_disks)
        || !unset_or_eq(&dvm.encryption_at_host, &ovm.encryption_at_host)
        || ovm.priority != dvm.priority
        || ovm.eviction_policy != dvm.eviction_policy
        || ovm.max_price != dvm.max_price
        || !unset_or_eq(&desired.ultra_ssd_enabled, &model.ultra_ssd_enabled)
        || ovm.terminate_notification != dvm.terminate_notification
}

fn unset_or_eq<T: PartialEq>(desired: &Option<T>, observed: &Option<T>) -> bool {
    desired.is_none() || desired == observed
}

fn os_disk_matches(observed: &OsDiskProfile, desired: &OsDiskProfile) -> bool {
    observed.os_type == desired.os_type
        && unset_or_eq(&desired.disk_size_gb, &observed.disk_size_gb)
        && unset_or_eq(&desired.caching, &observed.caching)
        && unset_or_eq(&desired.storage_account_type, &observed.storage_account_type)
        && unset_or_eq(&desired.disk_encryption_set_id, &observed.disk_encryption_set_id)
        && desired.diff_disk_option == observed.diff_disk_option
}

fn data_disks_match(observed: &[DataDiskProfile], desired: &[DataDiskProfile]) -> bool {
    if observed.len() != desired.len() {
        return false;
    }
    desired.iter().all(|want| {
        observed.iter().any(|have| {
            have.lun == want.lun
                && have.name == want.name
                && have.disk_size_gb == want.disk_size_gb
                && unset_or_eq(&want.caching, &have.caching)
                && unset_or_eq(&want.storage_account_type, &have.storage_account_type)
                && unset_or_eq(&want.disk_encryption_set_id, &have.disk_encryption_set_id)
        })
    })
}
