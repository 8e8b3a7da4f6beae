//! Pool scope.
//!
//! A `PoolScope` is the context of a single reconciliation pass over one FleetPool. It owns a
//! working copy of the pool's status; every mutation made during the pass goes through one of its
//! methods, and the resulting status is produced exactly once when the scope is closed.

use anyhow::{Context, Result};
use fleet_core::crd::checkpoint;
use fleet_core::crd::condition::{
    self, REASON_CREATING, REASON_DELETED, REASON_DELETING, REASON_DELETION_FAILED, REASON_FAILED, REASON_MODEL_OUT_OF_DATE, REASON_SCALE_DOWN,
    REASON_SCALE_UP, REASON_UPDATING, SCALE_SET_DESIRED_REPLICAS, SCALE_SET_MODEL_UPDATED, SCALE_SET_RUNNING,
};
use fleet_core::crd::{ConditionSeverity, FleetPool, FleetPoolStatus, Image, OperationCheckpoint, ProvisioningState};
use fleet_core::error::{is_operation_not_done, is_terminal};

use crate::scaleset::resource::ObservedFleet;
use crate::scaleset::spec::FleetSpec;
use crate::scaleset::store::{MachineStore, PoolIdentity};
use crate::scaleset::sync::{synchronize, SyncInput};

/// The failure reason recorded for errors which require a change to the pool.
pub const FAILURE_REASON_INVALID_CONFIGURATION: &str = "InvalidConfiguration";

/// The context of one reconciliation pass over a pool.
#[derive(Debug)]
pub struct PoolScope {
    spec: FleetSpec,
    identity: PoolIdentity,
    status: FleetPoolStatus,
    observed: Option<ObservedFleet>,
}

/// The result of closing a scope.
#[derive(Debug)]
pub struct Closed {
    /// The status to write back to the pool.
    pub status: FleetPoolStatus,
    /// Whether the pool should be revisited soon, even though the pass succeeded.
    pub needs_requeue: bool,
    /// The result of the pass, including any errors hit while closing the scope.
    pub result: Result<()>,
}

impl PoolScope {
    /// Create a new scope for the given pool.
    pub fn new(pool: &FleetPool) -> Self {
        Self {
            spec: FleetSpec::from_pool(pool),
            identity: PoolIdentity::from_pool(pool),
            status: pool.status.clone().unwrap_or_default(),
            observed: None,
        }
    }

    pub fn spec(&self) -> &FleetSpec {
        &self.spec
    }

    pub fn identity(&self) -> &PoolIdentity {
        &self.identity
    }

    /// The name of the pool's scale set.
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn namespace(&self) -> &str {
        &self.identity.namespace
    }

    pub fn resource_group(&self) -> &str {
        self.spec.resource_group()
    }

    pub fn desired_replicas(&self) -> u32 {
        self.spec.pool.replicas
    }

    /// The working copy of the pool's status.
    pub fn status(&self) -> &FleetPoolStatus {
        &self.status
    }

    pub fn provisioning_state(&self) -> Option<ProvisioningState> {
        self.status.provisioning_state
    }

    /// Get the checkpoint of the scale set for the given service.
    pub fn checkpoint(&self, service: &str) -> Option<&OperationCheckpoint> {
        checkpoint::get(&self.status.long_running_operation_states, &self.spec.name, service)
    }

    pub fn set_checkpoint(&mut self, cp: OperationCheckpoint) {
        checkpoint::set(&mut self.status.long_running_operation_states, cp);
    }

    pub fn clear_checkpoint(&mut self, service: &str) {
        checkpoint::clear(&mut self.status.long_running_operation_states, &self.spec.name, service);
    }

    pub fn set_provider_id(&mut self, provider_id: String) {
        self.status.provider_id = Some(provider_id);
    }

    /// Replace the observed state of the scale set.
    pub fn set_observed(&mut self, observed: ObservedFleet) {
        self.observed = Some(observed);
    }

    pub fn observed(&self) -> Option<&ObservedFleet> {
        self.observed.as_ref()
    }

    pub fn set_image(&mut self, image: Image) {
        self.status.image = Some(image);
    }

    /// Update the given condition after a create or replace of the given service.
    pub fn update_put_status(&mut self, cond: &str, service: &str, err: Option<&anyhow::Error>) {
        let conditions = &mut self.status.conditions;
        match err {
            None => condition::mark_true(conditions, cond),
            Some(err) if is_operation_not_done(err) => condition::mark_false(
                conditions,
                cond,
                REASON_CREATING,
                ConditionSeverity::Info,
                format!("{} creating or updating", service),
            ),
            Some(err) => condition::mark_false(
                conditions,
                cond,
                REASON_FAILED,
                ConditionSeverity::Error,
                format!("{} failed to create or update. err: {:#}", service, err),
            ),
        }
    }

    /// Update the given condition after a patch of the given service.
    pub fn update_patch_status(&mut self, cond: &str, service: &str, err: Option<&anyhow::Error>) {
        let conditions = &mut self.status.conditions;
        match err {
            None => condition::mark_true(conditions, cond),
            Some(err) if is_operation_not_done(err) => {
                condition::mark_false(conditions, cond, REASON_UPDATING, ConditionSeverity::Info, format!("{} updating", service))
            }
            Some(err) => condition::mark_false(
                conditions,
                cond,
                REASON_FAILED,
                ConditionSeverity::Error,
                format!("{} failed to update. err: {:#}", service, err),
            ),
        }
    }

    /// Update the given condition after a delete of the given service.
    pub fn update_delete_status(&mut self, cond: &str, service: &str, err: Option<&anyhow::Error>) {
        let conditions = &mut self.status.conditions;
        match err {
            None => condition::mark_false(
                conditions,
                cond,
                REASON_DELETED,
                ConditionSeverity::Info,
                format!("{} successfully deleted", service),
            ),
            Some(err) if is_operation_not_done(err) => {
                condition::mark_false(conditions, cond, REASON_DELETING, ConditionSeverity::Info, format!("{} deleting", service))
            }
            Some(err) => condition::mark_false(
                conditions,
                cond,
                REASON_DELETION_FAILED,
                ConditionSeverity::Error,
                format!("{} failed to delete. err: {:#}", service, err),
            ),
        }
    }

    /// Record a terminal failure on the pool.
    pub fn set_failure(&mut self, err: &anyhow::Error) {
        self.status.failure_reason = Some(FAILURE_REASON_INVALID_CONFIGURATION.into());
        self.status.failure_message = Some(format!("{:#}", err));
    }

    /// Check if the pool should be revisited even though the pass succeeded.
    ///
    /// This is the case while instances are not on the latest model, while the scale set is in a
    /// non-terminal state, or while its instance count differs from the desired count.
    pub fn needs_requeue(&self) -> bool {
        let state_is_terminal = self.status.provisioning_state.map(|state| state.is_terminal());
        let observed = match self.observed.as_ref() {
            Some(observed) => observed,
            None => return state_is_terminal == Some(false),
        };
        if !observed.has_latest_model_applied_to_all() {
            return true;
        }
        let desired_matches_actual = observed.instances.len() == self.desired_replicas() as usize;
        !(state_is_terminal == Some(true) && desired_matches_actual)
    }

    /// Close this scope, producing the status to be written back to the pool.
    ///
    /// When the scale set was observed during the pass, the pool's tracking records are
    /// synchronized first and the replica counters are derived from them.
    #[tracing::instrument(level = "debug", skip(self, store, result), fields(pool = %self.identity.name))]
    pub async fn close(mut self, store: &dyn MachineStore, mut result: Result<()>) -> Closed {
        if let Some(observed) = self.observed.clone() {
            if let Err(err) = self.apply_observed(&observed, store).await {
                tracing::error!(error = ?err, "error while closing pool scope");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }

        condition::set_summary(&mut self.status.conditions);
        match result.as_ref() {
            Ok(_) => {
                self.status.failure_reason = None;
                self.status.failure_message = None;
            }
            Err(err) if is_terminal(err) => {
                self.set_failure(err);
                condition::mark_false(
                    &mut self.status.conditions,
                    condition::READY,
                    REASON_FAILED,
                    ConditionSeverity::Error,
                    format!("{:#}", err),
                );
            }
            Err(_) => (),
        }

        Closed {
            needs_requeue: self.needs_requeue(),
            status: self.status,
            result,
        }
    }

    async fn apply_observed(&mut self, observed: &ObservedFleet, store: &dyn MachineStore) -> Result<()> {
        let operation_in_flight = checkpoint::has(&self.status.long_running_operation_states, &self.spec.name, fleet_core::SERVICE_SCALE_SETS);
        synchronize(
            SyncInput {
                pool: &self.identity,
                observed,
                strategy: &self.spec.strategy,
                desired_replicas: self.desired_replicas(),
                operation_in_flight,
            },
            store,
        )
        .await
        .context("failed to apply changes to tracking records")?;

        self.set_provisioning_state_and_conditions(observed.state);
        self.update_replicas_and_provider_ids(store)
            .await
            .context("failed to update replicas and provider IDs")
    }

    /// Derive the provisioning state & the scale set conditions from the observed state.
    ///
    /// Replicas are compared against the ready count of the previous pass, as the counters are
    /// only refreshed afterwards.
    fn set_provisioning_state_and_conditions(&mut self, state: ProvisioningState) {
        let desired = self.desired_replicas();
        let status = &mut self.status;
        status.provisioning_state = Some(state);
        status.ready = false;
        let conditions = &mut status.conditions;
        match state {
            ProvisioningState::Succeeded if desired == status.replicas => {
                condition::mark_true(conditions, SCALE_SET_RUNNING);
                condition::mark_true(conditions, SCALE_SET_MODEL_UPDATED);
                condition::mark_true(conditions, SCALE_SET_DESIRED_REPLICAS);
                status.ready = true;
            }
            ProvisioningState::Succeeded => {
                status.provisioning_state = Some(ProvisioningState::Updating);
                let reason = if desired > status.replicas { REASON_SCALE_UP } else { REASON_SCALE_DOWN };
                condition::mark_false(conditions, SCALE_SET_DESIRED_REPLICAS, reason, ConditionSeverity::Info, "");
            }
            ProvisioningState::Updating => {
                condition::mark_false(conditions, SCALE_SET_MODEL_UPDATED, REASON_MODEL_OUT_OF_DATE, ConditionSeverity::Info, "");
            }
            ProvisioningState::Creating => {
                condition::mark_false(conditions, SCALE_SET_RUNNING, REASON_CREATING, ConditionSeverity::Info, "");
            }
            ProvisioningState::Deleting => {
                condition::mark_false(conditions, SCALE_SET_RUNNING, REASON_DELETING, ConditionSeverity::Info, "");
            }
            other => {
                condition::mark_false(conditions, SCALE_SET_RUNNING, other.as_str(), ConditionSeverity::Info, "");
            }
        }
    }

    async fn update_replicas_and_provider_ids(&mut self, store: &dyn MachineStore) -> Result<()> {
        let machines = store
            .list(&self.identity.namespace, &self.identity.labels())
            .await
            .context("failed to get pool machines")?;
        let ready = machines.iter().filter(|m| m.status.as_ref().map(|s| s.ready).unwrap_or(false)).count();
        self.status.replicas = ready as u32;
        self.status.provider_id_list = machines.into_iter().map(|m| m.spec.provider_id).collect();
        Ok(())
    }
}
