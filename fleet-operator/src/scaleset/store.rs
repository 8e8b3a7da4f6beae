//! Persistence of pools and their tracking records.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use fleet_core::crd::condition::{self, REASON_CREATING, VM_RUNNING};
use fleet_core::crd::{ConditionSeverity, FleetMachine, FleetMachineSpec, FleetMachineStatus, FleetPool, FleetPoolStatus, RequiredMetadata};
use fleet_core::{ReconcileError, FINALIZER_MACHINE, LABEL_CLUSTER_NAME, LABEL_POOL_NAME};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;

use crate::scaleset::resource::Instance;

/// A store of FleetMachine tracking records.
#[async_trait]
pub trait MachineStore: Send + Sync {
    /// Read the current state of the given record, `None` if it does not exist.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<FleetMachine>>;

    /// List all records in the given namespace carrying all of the given labels.
    async fn list(&self, namespace: &str, labels: &BTreeMap<String, String>) -> Result<Vec<FleetMachine>>;

    /// Create the given record, including its status.
    async fn create(&self, machine: &FleetMachine) -> Result<FleetMachine>;

    /// Delete the given record. A record which does not exist is not an error.
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;

    /// Write the status of the given record.
    async fn update_status(&self, machine: &FleetMachine) -> Result<()>;

    /// Remove this operator's finalizer from the given record.
    async fn remove_finalizer(&self, machine: &FleetMachine) -> Result<()>;
}

/// A store of FleetPool objects.
#[async_trait]
pub trait PoolStore: Send + Sync {
    /// Read the current state of the given pool, `None` if it does not exist.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<FleetPool>>;

    /// Add this operator's finalizer to the given pool, if not already present.
    async fn add_finalizer(&self, pool: &FleetPool) -> Result<()>;

    /// Remove this operator's finalizer from the given pool.
    async fn remove_finalizer(&self, pool: &FleetPool) -> Result<()>;

    /// Write the given status to the given pool.
    async fn update_status(&self, pool: &FleetPool, status: &FleetPoolStatus) -> Result<()>;
}

/// The identity of a pool, as needed to own and find its tracking records.
#[derive(Clone, Debug, PartialEq)]
pub struct PoolIdentity {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub cluster_name: String,
}

impl PoolIdentity {
    pub fn from_pool(pool: &FleetPool) -> Self {
        Self {
            namespace: pool.namespace().into(),
            name: pool.name().into(),
            uid: pool.uid().into(),
            cluster_name: pool.spec.cluster_name.clone(),
        }
    }

    /// The labels carried by every tracking record of this pool.
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_CLUSTER_NAME.into(), self.cluster_name.clone());
        labels.insert(LABEL_POOL_NAME.into(), self.name.clone());
        labels
    }

    fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: FleetPool::api_version(&()).into(),
            kind: FleetPool::kind(&()).into(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }
}

/// Build a new tracking record for the given instance of the given pool.
pub fn new_machine_record(pool: &PoolIdentity, instance: &Instance) -> Result<FleetMachine> {
    if instance.instance_id.is_empty() {
        return Err(ReconcileError::terminal(format!("instance {} of pool {} has no instance ID", instance.id, pool.name)));
    }
    if instance.name.is_empty() {
        return Err(ReconcileError::terminal(format!("instance {} of pool {} has no name", instance.id, pool.name)));
    }

    let mut machine = FleetMachine::new(
        &format!("{}-{}", pool.name, instance.instance_id),
        FleetMachineSpec {
            provider_id: instance.provider_id(),
            instance_id: instance.instance_id.clone(),
        },
    );
    let meta = machine.meta_mut();
    meta.namespace = Some(pool.namespace.clone());
    meta.labels = Some(pool.labels());
    meta.owner_references = Some(vec![pool.owner_reference()]);
    meta.finalizers = Some(vec![FINALIZER_MACHINE.into()]);

    let mut status = FleetMachineStatus {
        ready: false,
        latest_model_applied: instance.latest_model_applied,
        provisioning_state: Some(instance.state),
        instance_name: Some(instance.name.clone()),
        ..Default::default()
    };
    condition::mark_false(&mut status.conditions, VM_RUNNING, REASON_CREATING, ConditionSeverity::Info, "");
    machine.status = Some(status);
    Ok(machine)
}
