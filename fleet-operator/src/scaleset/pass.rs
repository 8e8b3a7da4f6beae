//! Reconciliation passes.
//!
//! A pass is one invocation of a reconciler over one object, from finalizer handling through to
//! the single status write at its end. The outcome of a pass is reduced to a `Requeue` decision
//! for the scheduler.

use std::sync::Arc;
use std::time::Duration;

use fleet_core::crd::{FleetMachine, FleetPool, RequiredMetadata};
use fleet_core::error::{classify, is_operation_not_done};
use fleet_core::{FINALIZER_MACHINE, FINALIZER_POOL};
use kube::Resource;

use crate::scaleset::bootstrap::BootstrapDataSource;
use crate::scaleset::capability::CapabilityLookup;
use crate::scaleset::cloud::ScaleSetClient;
use crate::scaleset::image::ImageResolver;
use crate::scaleset::machine::MachineReconciler;
use crate::scaleset::reconciler::FleetReconciler;
use crate::scaleset::scope::PoolScope;
use crate::scaleset::store::{MachineStore, PoolStore};

const METRIC_RECONCILE_PASSES: &str = "fleet_reconcile_passes";
const METRIC_RECONCILE_TERMINAL_ERRORS: &str = "fleet_reconcile_terminal_errors";

/// The delay after which an object which is still converging is looked at again.
pub const REQUEUE_CONVERGING: Duration = Duration::from_secs(30);

/// The collaborators shared by all reconciliation passes.
#[derive(Clone)]
pub struct Collaborators {
    pub cloud: Arc<dyn ScaleSetClient>,
    pub capabilities: Arc<dyn CapabilityLookup>,
    pub images: Arc<dyn ImageResolver>,
    pub bootstrap: Arc<dyn BootstrapDataSource>,
    pub machines: Arc<dyn MachineStore>,
    pub pools: Arc<dyn PoolStore>,
    /// The subscription of the cluster's network resources.
    pub subscription_id: String,
}

/// When an object should be reconciled again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Requeue {
    /// After the given delay.
    After(Duration),
    /// On the next periodic resync only.
    Resync,
    /// Only once the object changes.
    Never,
}

/// Register the metrics emitted by reconciliation passes.
pub fn register_metrics() {
    metrics::register_counter!(METRIC_RECONCILE_PASSES, metrics::Unit::Count, "reconciliation passes by kind & outcome");
    metrics::register_counter!(
        METRIC_RECONCILE_TERMINAL_ERRORS,
        metrics::Unit::Count,
        "reconciliation passes which ended in an error requiring a spec change"
    );
}

/// Run one reconciliation pass over the pool of the given name.
///
/// The pass works on the pool as currently stored, not on a cached copy, so that it observes the
/// status written by any earlier pass, including its operation checkpoints.
pub async fn run_pool(deps: &Collaborators, namespace: &str, name: &str) -> Requeue {
    match deps.pools.get(namespace, name).await {
        Ok(Some(pool)) => reconcile_pool(deps, &pool).await,
        Ok(None) => Requeue::Never,
        Err(err) => outcome("pool", err.context("error fetching pool")),
    }
}

/// Run one reconciliation pass over the tracking record of the given name.
pub async fn run_machine(deps: &Collaborators, namespace: &str, name: &str) -> Requeue {
    match deps.machines.get(namespace, name).await {
        Ok(Some(machine)) => reconcile_machine(deps, &machine).await,
        Ok(None) => Requeue::Never,
        Err(err) => outcome("machine", err.context("error fetching tracking record")),
    }
}

/// Run one reconciliation pass over the given pool.
#[tracing::instrument(level = "debug", skip(deps, pool), fields(namespace = pool.namespace(), name = pool.name()))]
pub async fn reconcile_pool(deps: &Collaborators, pool: &FleetPool) -> Requeue {
    let deleting = pool.meta().deletion_timestamp.is_some();
    let holds_finalizer = has_finalizer(pool.meta().finalizers.as_deref(), FINALIZER_POOL);
    if deleting && !holds_finalizer {
        return Requeue::Never;
    }
    if !deleting && !holds_finalizer {
        if let Err(err) = deps.pools.add_finalizer(pool).await {
            return outcome("pool", err.context("error adding finalizer to pool"));
        }
    }

    let mut scope = PoolScope::new(pool);
    let reconciler = FleetReconciler::new(deps);
    let res = if deleting {
        reconciler.delete(&mut scope).await
    } else {
        reconciler.reconcile(&mut scope).await
    };
    let closed = scope.close(deps.machines.as_ref(), res).await;

    if pool.status.as_ref() != Some(&closed.status) {
        if let Err(err) = deps.pools.update_status(pool, &closed.status).await {
            // The outcome of the pass is kept, the status write is retried on the next pass.
            tracing::error!(error = ?err, "error updating pool status");
        }
    }

    match closed.result {
        Ok(()) if deleting => match deps.pools.remove_finalizer(pool).await {
            Ok(()) => {
                tracing::info!("scale set deleted, released pool");
                record("pool", "ok");
                Requeue::Never
            }
            Err(err) => outcome("pool", err.context("error removing finalizer from pool")),
        },
        Ok(()) => {
            record("pool", "ok");
            if closed.needs_requeue {
                Requeue::After(REQUEUE_CONVERGING)
            } else {
                Requeue::Resync
            }
        }
        Err(err) => outcome("pool", err),
    }
}

/// Run one reconciliation pass over the given tracking record.
#[tracing::instrument(level = "debug", skip(deps, machine), fields(namespace = machine.namespace(), name = machine.name()))]
pub async fn reconcile_machine(deps: &Collaborators, machine: &FleetMachine) -> Requeue {
    let reconciler = MachineReconciler::new(deps);
    if machine.meta().deletion_timestamp.is_some() {
        if !has_finalizer(machine.meta().finalizers.as_deref(), FINALIZER_MACHINE) {
            return Requeue::Never;
        }
        return match reconciler.delete(machine).await {
            Ok(()) => {
                record("machine", "ok");
                Requeue::Never
            }
            Err(err) => outcome("machine", err),
        };
    }
    match reconciler.reconcile(machine).await {
        Ok(true) => {
            record("machine", "ok");
            Requeue::After(REQUEUE_CONVERGING)
        }
        Ok(false) => {
            record("machine", "ok");
            Requeue::Resync
        }
        Err(err) => outcome("machine", err),
    }
}

/// Reduce a failed pass to its requeue decision, logging terminal errors exactly once.
fn outcome(kind: &'static str, err: anyhow::Error) -> Requeue {
    match classify(&err) {
        None => {
            tracing::error!(error = %format!("{:#}", err), "reconciliation failed, will not retry until the object changes");
            record(kind, "terminal");
            metrics::increment_counter!(METRIC_RECONCILE_TERMINAL_ERRORS, "kind" => kind);
            Requeue::Never
        }
        Some(delay) if is_operation_not_done(&err) => {
            tracing::debug!(?delay, "operation in flight, requeueing");
            record(kind, "in_flight");
            Requeue::After(delay)
        }
        Some(delay) => {
            tracing::error!(error = ?err, ?delay, "reconciliation failed, requeueing");
            record(kind, "transient");
            Requeue::After(delay)
        }
    }
}

fn record(kind: &'static str, outcome: &'static str) {
    metrics::increment_counter!(METRIC_RECONCILE_PASSES, "kind" => kind, "outcome" => outcome);
}

fn has_finalizer(finalizers: Option<&[String]>, finalizer: &str) -> bool {
    finalizers.map(|all| all.iter().any(|f| f == finalizer)).unwrap_or(false)
}
