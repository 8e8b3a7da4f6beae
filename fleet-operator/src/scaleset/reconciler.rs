//! Fleet reconciler.
//!
//! Drives the scale set of a pool towards its desired state through a series of short passes.
//! A pass never waits on the cloud: every accepted mutation is recorded as a checkpoint in the
//! pool's status and the pass returns a transient error, to be picked up again by a later pass
//! which polls the checkpoint.
//!
//! At most one mutating cloud call is made per pass, and a checkpoint is only written after the
//! cloud accepted the call.

use anyhow::{Context, Result};
use fleet_core::crd::condition::BOOTSTRAP_SUCCEEDED;
use fleet_core::crd::{OperationCheckpoint, OperationKind};
use fleet_core::error::{is_not_found, is_operation_failed, RETRY_CONFLICT, RETRY_DEFAULT, RETRY_OPERATION_NOT_DONE};
use fleet_core::{CloudError, ReconcileError, SERVICE_SCALE_SETS};

use crate::scaleset::compiler::{compile, CompileInputs};
use crate::scaleset::diff::{plan_update, UpdatePlan};
use crate::scaleset::pass::Collaborators;
use crate::scaleset::resource::{ObservedFleet, ScaleSet};
use crate::scaleset::scope::PoolScope;
use crate::scaleset::validation::{validate, ValidatedSku};

/// Reconciles the scale set of a pool.
pub struct FleetReconciler<'a> {
    deps: &'a Collaborators,
}

impl<'a> FleetReconciler<'a> {
    pub fn new(deps: &'a Collaborators) -> Self {
        Self { deps }
    }

    /// Run one reconciliation pass of the scale set.
    ///
    /// A spec which fails validation aborts the pass before any cloud call is made. On every other
    /// path the observed state of the scale set is published to the scope, fetching it once more
    /// if the pass did not already do so.
    #[tracing::instrument(level = "debug", skip(self, scope), fields(name = %scope.name()))]
    pub async fn reconcile(&self, scope: &mut PoolScope) -> Result<()> {
        let sku = validate(scope.spec(), self.deps.capabilities.as_ref()).await?;

        let mut fetched = None;
        let res = self.reconcile_scale_set(scope, &sku, &mut fetched).await;

        let observed = match fetched {
            Some(observed) => Some(observed),
            None => self.fetch_for_publish(scope).await,
        };
        if let Some(observed) = observed {
            scope.set_provider_id(observed.provider_id());
            scope.set_observed(observed);
        }
        res
    }

    /// Run one deletion pass of the scale set.
    ///
    /// Returns `Ok` once the scale set is gone.
    #[tracing::instrument(level = "debug", skip(self, scope), fields(name = %scope.name()))]
    pub async fn delete(&self, scope: &mut PoolScope) -> Result<()> {
        let res = self.delete_scale_set(scope).await;
        if let Some(observed) = self.fetch_for_publish(scope).await {
            scope.set_observed(observed);
        }
        res
    }

    async fn reconcile_scale_set(&self, scope: &mut PoolScope, sku: &ValidatedSku, fetched: &mut Option<ObservedFleet>) -> Result<()> {
        let name = scope.name().to_string();
        let resource_group = scope.resource_group().to_string();

        let existing = match scope.checkpoint(SERVICE_SCALE_SETS).cloned() {
            Some(checkpoint) => match self.poll(&checkpoint).await {
                Ok(observed) => {
                    tracing::debug!(%name, kind = ?checkpoint.kind, "scale set operation is complete");
                    scope.clear_checkpoint(SERVICE_SCALE_SETS);
                    *fetched = observed.clone();
                    observed
                }
                Err(err) if is_operation_failed(&err) => {
                    // Drop the checkpoint, so that the next pass starts over from a fresh fetch.
                    tracing::warn!(error = ?err, %name, "scale set operation failed");
                    scope.clear_checkpoint(SERVICE_SCALE_SETS);
                    return Err(ReconcileError::transient(
                        err.context(format!("operation on scale set {} failed", name)),
                        RETRY_DEFAULT,
                    ));
                }
                Err(err) if is_not_found(&err) => {
                    scope.clear_checkpoint(SERVICE_SCALE_SETS);
                    None
                }
                Err(err) => return Err(err.context(format!("failed to get scale set {}", name))),
            },
            None => match self.fetch(&resource_group, &name).await {
                Ok(observed) => {
                    *fetched = Some(observed.clone());
                    Some(observed)
                }
                Err(err) if is_not_found(&err) => None,
                Err(err) => return Err(err.context(format!("failed to get scale set {}", name))),
            },
        };

        let desired = self.build(scope, sku).await.context("failed building scale set from spec")?;
        match existing {
            None => {
                let checkpoint = self
                    .deps
                    .cloud
                    .create_or_update_async(&resource_group, &name, &desired)
                    .await
                    .context("cannot create scale set")?;
                tracing::info!(%name, capacity = desired.sku.capacity, "starting to create scale set");
                let err = operation_not_done(&checkpoint);
                scope.set_checkpoint(checkpoint);
                scope.update_put_status(BOOTSTRAP_SUCCEEDED, SERVICE_SCALE_SETS, Some(&err));
                return Err(err);
            }
            Some(observed) => {
                let surge = scope
                    .spec()
                    .strategy
                    .surge(scope.desired_replicas())
                    .context("failed to calculate max surge")?;
                if let UpdatePlan::Patch(patch) = plan_update(&observed, &desired, surge) {
                    let checkpoint = match self.deps.cloud.update_async(&resource_group, &name, &patch).await {
                        Ok(checkpoint) => checkpoint,
                        Err(err @ CloudError::Conflict(_)) => return Err(ReconcileError::transient(err, RETRY_CONFLICT)),
                        Err(err) => return Err(anyhow::Error::from(err).context("failed updating scale set")),
                    };
                    tracing::info!(%name, capacity = patch.sku.capacity, "successfully started to update scale set");
                    let err = operation_not_done(&checkpoint);
                    scope.set_checkpoint(checkpoint);
                    scope.update_patch_status(BOOTSTRAP_SUCCEEDED, SERVICE_SCALE_SETS, Some(&err));
                    return Err(err);
                }
            }
        }

        // Nothing is in flight anymore, which also means the bootstrap extension was installed.
        scope.clear_checkpoint(SERVICE_SCALE_SETS);
        scope.update_put_status(BOOTSTRAP_SUCCEEDED, SERVICE_SCALE_SETS, None);
        Ok(())
    }

    async fn delete_scale_set(&self, scope: &mut PoolScope) -> Result<()> {
        let name = scope.name().to_string();
        let resource_group = scope.resource_group().to_string();

        if let Some(checkpoint) = scope.checkpoint(SERVICE_SCALE_SETS).cloned() {
            match self.deps.cloud.get_result_if_done(&checkpoint).await {
                Ok(_) | Err(CloudError::NotFound(_)) => (),
                Err(err @ CloudError::OperationFailed(_)) => {
                    let err = anyhow::Error::from(err).context(format!("operation on scale set {} failed", name));
                    scope.clear_checkpoint(SERVICE_SCALE_SETS);
                    scope.update_delete_status(BOOTSTRAP_SUCCEEDED, SERVICE_SCALE_SETS, Some(&err));
                    return Err(ReconcileError::transient(err, RETRY_DEFAULT));
                }
                Err(err) => {
                    let err = anyhow::Error::from(err).context("failed to get result from operation");
                    scope.update_delete_status(BOOTSTRAP_SUCCEEDED, SERVICE_SCALE_SETS, Some(&err));
                    return Err(err);
                }
            }
            scope.clear_checkpoint(SERVICE_SCALE_SETS);
            if checkpoint.kind == OperationKind::Delete {
                scope.update_delete_status(BOOTSTRAP_SUCCEEDED, SERVICE_SCALE_SETS, None);
                return Ok(());
            }
            // A create or update finished underneath the deletion; the delete call is still owed.
            tracing::debug!(%name, kind = ?checkpoint.kind, "outstanding operation completed, proceeding with deletion");
        }

        tracing::info!(%name, "deleting scale set");
        let checkpoint = match self.deps.cloud.delete_async(&resource_group, &name).await {
            Ok(checkpoint) => checkpoint,
            Err(CloudError::NotFound(_)) => {
                tracing::debug!(%name, "scale set already deleted");
                scope.update_delete_status(BOOTSTRAP_SUCCEEDED, SERVICE_SCALE_SETS, None);
                return Ok(());
            }
            Err(err) => {
                return Err(anyhow::Error::from(err).context(format!("failed to delete scale set {} in resource group {}", name, resource_group)))
            }
        };
        let err = operation_not_done(&checkpoint);
        scope.set_checkpoint(checkpoint);
        scope.update_delete_status(BOOTSTRAP_SUCCEEDED, SERVICE_SCALE_SETS, Some(&err));
        Err(err)
    }

    /// Build the desired scale set of the scope's spec.
    async fn build(&self, scope: &mut PoolScope, sku: &ValidatedSku) -> Result<ScaleSet> {
        let image = self.deps.images.resolve(scope.spec()).await.context("failed to get VM image")?;
        scope.set_image(image.clone());

        let secret_name = scope
            .spec()
            .pool
            .bootstrap_data_secret_name
            .clone()
            .context("error retrieving bootstrap data: the pool's bootstrap data secret name is not set")?;
        let bootstrap_data = self
            .deps
            .bootstrap
            .get(scope.namespace(), &secret_name)
            .await
            .with_context(|| format!("failed to retrieve bootstrap data for pool {}/{}", scope.namespace(), scope.identity().name))?;

        compile(
            scope.spec(),
            &CompileInputs {
                subscription_id: &self.deps.subscription_id,
                image: &image,
                bootstrap_data: &bootstrap_data,
                sku,
            },
        )
    }

    /// Fetch the scale set and its instances.
    async fn fetch(&self, resource_group: &str, name: &str) -> Result<ObservedFleet> {
        let model = self.deps.cloud.get(resource_group, name).await.context("failed to get existing scale set")?;
        let instances = self
            .deps
            .cloud
            .list_instances(resource_group, name)
            .await
            .context("failed to list instances")?;
        Ok(ObservedFleet::new(model, instances))
    }

    /// Fetch the scale set for publication, tolerating its absence.
    async fn fetch_for_publish(&self, scope: &PoolScope) -> Option<ObservedFleet> {
        match self.fetch(scope.resource_group(), scope.name()).await {
            Ok(observed) => Some(observed),
            Err(err) if is_not_found(&err) => None,
            Err(err) => {
                tracing::error!(error = ?err, name = scope.name(), "failed to get scale set in deferred update");
                None
            }
        }
    }

    /// Poll the given checkpoint, fetching the scale set's instances once the operation is done.
    async fn poll(&self, checkpoint: &OperationCheckpoint) -> Result<Option<ObservedFleet>> {
        let model = self
            .deps
            .cloud
            .get_result_if_done(checkpoint)
            .await
            .context("failed to get result from operation")?;
        let model = match model {
            Some(model) => model,
            None => return Ok(None),
        };
        let instances = self
            .deps
            .cloud
            .list_instances(&checkpoint.resource_group, &checkpoint.name)
            .await
            .context("failed to list instances")?;
        Ok(Some(ObservedFleet::new(model, instances)))
    }
}

/// The error returned after a mutation was accepted, signaling that the pass should be retried
/// once the operation had time to progress.
fn operation_not_done(checkpoint: &OperationCheckpoint) -> anyhow::Error {
    ReconcileError::transient(
        CloudError::OperationNotDone(format!("{:?} of {} {} is in progress", checkpoint.kind, checkpoint.service_name, checkpoint.name)),
        RETRY_OPERATION_NOT_DONE,
    )
}
