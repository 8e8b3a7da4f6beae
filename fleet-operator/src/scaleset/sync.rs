//! Instance synchronizer.
//!
//! Reconciles the tracking records of a pool against the instances observed in its scale set,
//! then applies the pool's deployment strategy to bring the number of records down to the desired
//! count. Deleting a record is what eventually deletes its instance, see `machine.rs`.
//!
//! The steps are strictly ordered and later steps only run when earlier ones made no deletions,
//! so that at most one kind of deletion happens per pass.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use fleet_core::crd::{FleetMachine, RequiredMetadata};

use crate::scaleset::resource::ObservedFleet;
use crate::scaleset::store::{new_machine_record, MachineStore, PoolIdentity};
use crate::scaleset::strategy::DeploymentStrategy;

/// The inputs of one synchronization.
pub struct SyncInput<'a> {
    pub pool: &'a PoolIdentity,
    pub observed: &'a ObservedFleet,
    pub strategy: &'a DeploymentStrategy,
    pub desired_replicas: u32,
    /// Whether a scale set operation is still outstanding.
    pub operation_in_flight: bool,
}

/// The step at which a synchronization finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncStage {
    /// Records of vanished instances were deleted.
    RemovedVanished,
    /// A scale set operation is outstanding.
    OperationInFlight,
    /// The pool has no deployment strategy.
    NoStrategy,
    /// The deployment strategy was applied.
    StrategyApplied,
}

/// The outcome of one synchronization.
#[derive(Clone, Debug, PartialEq)]
pub struct SyncOutcome {
    pub stage: SyncStage,
    /// Names of the records created.
    pub created: Vec<String>,
    /// Names of the records deleted.
    pub deleted: Vec<String>,
}

/// Synchronize the tracking records of a pool with its observed scale set.
#[tracing::instrument(level = "debug", skip(input, store), fields(pool = %input.pool.name))]
pub async fn synchronize(input: SyncInput<'_>, store: &dyn MachineStore) -> Result<SyncOutcome> {
    let records = store
        .list(&input.pool.namespace, &input.pool.labels())
        .await
        .context("failed to list tracking records")?;
    let mut existing: BTreeMap<String, FleetMachine> = records.into_iter().map(|m| (m.spec.provider_id.clone(), m)).collect();
    let instances = input.observed.instances_by_provider_id();
    let mut outcome = SyncOutcome {
        stage: SyncStage::StrategyApplied,
        created: vec![],
        deleted: vec![],
    };

    // Step 1: track every instance which has no record yet.
    for (provider_id, instance) in instances.iter() {
        if existing.contains_key(provider_id) {
            continue;
        }
        tracing::debug!(%provider_id, "creating tracking record for instance");
        let record = new_machine_record(input.pool, instance)?;
        let created = store
            .create(&record)
            .await
            .with_context(|| format!("failed creating tracking record for instance {}", instance.id))?;
        outcome.created.push(created.name().into());
    }

    // Step 2: drop records whose instance is gone.
    let vanished: Vec<String> = existing.keys().filter(|key| !instances.contains_key(*key)).cloned().collect();
    for provider_id in vanished {
        if let Some(record) = existing.remove(&provider_id) {
            tracing::debug!(%provider_id, "deleting tracking record as its instance no longer exists");
            store
                .delete(record.namespace(), record.name())
                .await
                .context("failed deleting tracking record of vanished instance")?;
            outcome.deleted.push(record.name().into());
        }
    }
    if !outcome.deleted.is_empty() {
        tracing::debug!("exiting early as tracking records of vanished instances were deleted");
        outcome.stage = SyncStage::RemovedVanished;
        return Ok(outcome);
    }

    // Step 3: never shrink while the scale set is changing underneath.
    if input.operation_in_flight {
        tracing::debug!("exiting early due to an in-flight scale set operation");
        outcome.stage = SyncStage::OperationInFlight;
        return Ok(outcome);
    }

    // Steps 4 & 5: let the strategy pick its victims.
    let machines: Vec<FleetMachine> = existing.into_values().collect();
    let victims = match input
        .strategy
        .select_machines_to_delete(input.desired_replicas, &machines)
        .context("failed selecting tracking records to delete")?
    {
        Some(victims) => victims,
        None => {
            tracing::debug!("no deployment strategy specified, not selecting records to delete");
            outcome.stage = SyncStage::NoStrategy;
            return Ok(outcome);
        }
    };
    for victim in victims {
        tracing::info!(provider_id = %victim.spec.provider_id, "deleting selected tracking record");
        store
            .delete(victim.namespace(), victim.name())
            .await
            .context("failed deleting tracking record to reduce replica count")?;
        outcome.deleted.push(victim.name().into());
    }
    Ok(outcome)
}
