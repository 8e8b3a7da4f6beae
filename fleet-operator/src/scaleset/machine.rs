//! Machine reconciler.
//!
//! Keeps each tracking record's status in line with its backing instance, and turns the deletion
//! of a record into the deletion of its instance. The instance delete is checkpointed in the
//! record's status the same way scale set operations are checkpointed in the pool's status; the
//! record's finalizer is only released once the instance is gone.

use anyhow::{Context, Result};
use fleet_core::crd::checkpoint;
use fleet_core::crd::condition::{self, REASON_CREATING, REASON_DELETING, REASON_FAILED, REASON_UPDATING, VM_RUNNING};
use fleet_core::crd::{ConditionSeverity, FleetMachine, FleetMachineStatus, OperationCheckpoint, ProvisioningState};
use fleet_core::error::{RETRY_DEFAULT, RETRY_OPERATION_NOT_DONE};
use fleet_core::{CloudError, ReconcileError, FINALIZER_MACHINE, SERVICE_SCALE_SET_VMS};
use kube::Resource;

use crate::scaleset::pass::Collaborators;
use crate::scaleset::resource::{parse_instance_provider_id, Instance, InstanceRef};

/// Reconciles a single tracking record.
pub struct MachineReconciler<'a> {
    deps: &'a Collaborators,
}

impl<'a> MachineReconciler<'a> {
    pub fn new(deps: &'a Collaborators) -> Self {
        Self { deps }
    }

    /// Refresh the status of the given record from its instance.
    ///
    /// Returns `true` while the instance is still in a non-terminal provisioning state.
    #[tracing::instrument(level = "debug", skip(self, machine), fields(provider_id = %machine.spec.provider_id))]
    pub async fn reconcile(&self, machine: &FleetMachine) -> Result<bool> {
        let target = parse_instance_provider_id(&machine.spec.provider_id).map_err(ReconcileError::Terminal)?;
        let instance = match self
            .deps
            .cloud
            .get_instance(&target.resource_group, &target.scale_set, &target.instance_id)
            .await
        {
            Ok(instance) => instance,
            Err(CloudError::NotFound(_)) => {
                // The synchronizer removes records of vanished instances.
                tracing::debug!("instance of tracking record no longer exists");
                return Ok(false);
            }
            Err(err) => return Err(anyhow::Error::from(err).context("failed to get instance of tracking record")),
        };

        let converging = !instance.state.is_terminal();
        let current = machine.status.clone().unwrap_or_default();
        let mut status = current.clone();
        apply_instance(&mut status, &instance);
        if status != current {
            self.write_status(machine, status).await?;
        }
        Ok(converging)
    }

    /// Delete the instance of the given record, releasing the record once the instance is gone.
    ///
    /// Returns `Ok` once the finalizer has been released.
    #[tracing::instrument(level = "debug", skip(self, machine), fields(provider_id = %machine.spec.provider_id))]
    pub async fn delete(&self, machine: &FleetMachine) -> Result<()> {
        if !has_finalizer(machine) {
            return Ok(());
        }
        let target = match parse_instance_provider_id(&machine.spec.provider_id) {
            Ok(target) => target,
            Err(err) => {
                // Nothing in the cloud can be addressed by this record, so it only blocks its own deletion.
                tracing::warn!(error = ?err, "releasing tracking record with an invalid provider id");
                return self.release(machine).await;
            }
        };
        let mut status = machine.status.clone().unwrap_or_default();

        if let Some(cp) = checkpoint::get(&status.long_running_operation_states, &target.instance_id, SERVICE_SCALE_SET_VMS).cloned() {
            return match self.deps.cloud.get_result_if_done(&cp).await {
                Ok(_) | Err(CloudError::NotFound(_)) => {
                    tracing::debug!(instance_id = %target.instance_id, "instance deleted");
                    self.release(machine).await
                }
                Err(err @ CloudError::OperationFailed(_)) => {
                    checkpoint::clear(&mut status.long_running_operation_states, &target.instance_id, SERVICE_SCALE_SET_VMS);
                    condition::mark_false(
                        &mut status.conditions,
                        VM_RUNNING,
                        REASON_FAILED,
                        ConditionSeverity::Error,
                        format!("failed to delete instance: {}", err),
                    );
                    self.write_status(machine, status).await?;
                    Err(ReconcileError::transient(
                        anyhow::Error::from(err).context("deleting instance failed"),
                        RETRY_DEFAULT,
                    ))
                }
                Err(err) => Err(anyhow::Error::from(err).context("failed to get result of instance delete")),
            };
        }

        tracing::info!(instance_id = %target.instance_id, scale_set = %target.scale_set, "deleting instance");
        let cp = match self.begin_delete(&target).await {
            Ok(Some(cp)) => cp,
            Ok(None) => return self.release(machine).await,
            Err(err) => return Err(err),
        };
        let err = ReconcileError::transient(
            CloudError::OperationNotDone(format!("delete of instance {} is in progress", target.instance_id)),
            RETRY_OPERATION_NOT_DONE,
        );
        checkpoint::set(&mut status.long_running_operation_states, cp);
        condition::mark_false(&mut status.conditions, VM_RUNNING, REASON_DELETING, ConditionSeverity::Info, "");
        status.ready = false;
        status.provisioning_state = Some(ProvisioningState::Deleting);
        self.write_status(machine, status).await?;
        Err(err)
    }

    /// Begin deleting the given instance, yielding `None` if it is already gone.
    async fn begin_delete(&self, target: &InstanceRef) -> Result<Option<OperationCheckpoint>> {
        match self
            .deps
            .cloud
            .delete_instance_async(&target.resource_group, &target.scale_set, &target.instance_id)
            .await
        {
            Ok(cp) => Ok(Some(cp)),
            Err(CloudError::NotFound(_)) => Ok(None),
            Err(err) => Err(anyhow::Error::from(err).context(format!(
                "failed to delete instance {} of scale set {}",
                target.instance_id, target.scale_set
            ))),
        }
    }

    async fn write_status(&self, machine: &FleetMachine, status: FleetMachineStatus) -> Result<()> {
        let mut updated = machine.clone();
        updated.status = Some(status);
        self.deps
            .machines
            .update_status(&updated)
            .await
            .context("failed to update tracking record status")
    }

    async fn release(&self, machine: &FleetMachine) -> Result<()> {
        self.deps
            .machines
            .remove_finalizer(machine)
            .await
            .context("failed to remove finalizer from tracking record")
    }
}

fn has_finalizer(machine: &FleetMachine) -> bool {
    machine
        .meta()
        .finalizers
        .as_ref()
        .map(|finalizers| finalizers.iter().any(|f| f == FINALIZER_MACHINE))
        .unwrap_or(false)
}

/// Copy the observed state of an instance onto a record's status.
fn apply_instance(status: &mut FleetMachineStatus, instance: &Instance) {
    status.provisioning_state = Some(instance.state);
    status.latest_model_applied = instance.latest_model_applied;
    status.ready = instance.state == ProvisioningState::Succeeded;
    status.instance_name = Some(instance.name.clone());

    let conditions = &mut status.conditions;
    match instance.state {
        ProvisioningState::Succeeded => condition::mark_true(conditions, VM_RUNNING),
        ProvisioningState::Creating => condition::mark_false(conditions, VM_RUNNING, REASON_CREATING, ConditionSeverity::Info, ""),
        ProvisioningState::Updating => condition::mark_false(conditions, VM_RUNNING, REASON_UPDATING, ConditionSeverity::Info, ""),
        ProvisioningState::Deleting => condition::mark_false(conditions, VM_RUNNING, REASON_DELETING, ConditionSeverity::Warning, ""),
        ProvisioningState::Failed => condition::mark_false(conditions, VM_RUNNING, REASON_FAILED, ConditionSeverity::Error, ""),
        other => condition::mark_false(conditions, VM_RUNNING, other.as_str(), ConditionSeverity::Info, ""),
    }
    condition::set_summary(conditions);
}
