//! Kubernetes backed stores of pools & tracking records.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use fleet_core::crd::{FleetMachine, FleetPool, FleetPoolStatus, RequiredMetadata};
use fleet_core::{FINALIZER_MACHINE, FINALIZER_POOL};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::client::Client;
use kube::Resource;
use serde_json::json;
use tokio::time::timeout;

use crate::k8s::{API_TIMEOUT, APP_NAME};
use crate::scaleset::store::{MachineStore, PoolStore};

/// A store of pools & tracking records backed by the K8s API.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn machines(&self, namespace: &str) -> Api<FleetMachine> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pools(&self, namespace: &str) -> Api<FleetPool> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl MachineStore for KubeStore {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<FleetMachine>> {
        let res = timeout(API_TIMEOUT, self.machines(namespace).get(name))
            .await
            .context("timeout while fetching machine")?;
        match res {
            Ok(machine) => Ok(Some(machine)),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(err).context("error fetching machine"),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, labels))]
    async fn list(&self, namespace: &str, labels: &BTreeMap<String, String>) -> Result<Vec<FleetMachine>> {
        let params = ListParams {
            label_selector: Some(label_selector(labels)),
            ..Default::default()
        };
        let list = timeout(API_TIMEOUT, self.machines(namespace).list(&params))
            .await
            .context("timeout while listing machines")?
            .context("error listing machines")?;
        Ok(list.items)
    }

    #[tracing::instrument(level = "debug", skip(self, machine), fields(name = machine.name()))]
    async fn create(&self, machine: &FleetMachine) -> Result<FleetMachine> {
        tracing::info!("creating machine");
        let api = self.machines(machine.namespace());
        let created = timeout(API_TIMEOUT, api.create(&PostParams::default(), machine))
            .await
            .context("timeout while creating machine")?
            .context("error creating machine")?;
        // The status subresource is ignored on create.
        let patch = Patch::Merge(json!({ "status": machine.status }));
        timeout(API_TIMEOUT, api.patch_status(created.name(), &PatchParams::default(), &patch))
            .await
            .context("timeout while writing status of new machine")?
            .context("error writing status of new machine")
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        tracing::info!("deleting machine");
        let res = timeout(API_TIMEOUT, self.machines(namespace).delete(name, &DeleteParams::default()))
            .await
            .context("timeout while deleting machine")?;
        match res {
            Ok(_val) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(err).context("error deleting machine"),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, machine), fields(name = machine.name()))]
    async fn update_status(&self, machine: &FleetMachine) -> Result<()> {
        let patch = Patch::Merge(json!({ "status": machine.status }));
        timeout(
            API_TIMEOUT,
            self.machines(machine.namespace())
                .patch_status(machine.name(), &PatchParams::default(), &patch),
        )
        .await
        .context("timeout while updating machine status")?
        .context("error updating machine status")
        .map(|_| ())
    }

    #[tracing::instrument(level = "debug", skip(self, machine), fields(name = machine.name()))]
    async fn remove_finalizer(&self, machine: &FleetMachine) -> Result<()> {
        let patch = finalizers_patch(machine.meta(), FINALIZER_MACHINE, false);
        let res = timeout(
            API_TIMEOUT,
            self.machines(machine.namespace())
                .patch(machine.name(), &PatchParams::default(), &patch),
        )
        .await
        .context("timeout while removing machine finalizer")?;
        match res {
            Ok(_val) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(err).context("error removing machine finalizer"),
        }
    }
}

#[async_trait]
impl PoolStore for KubeStore {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<FleetPool>> {
        let res = timeout(API_TIMEOUT, self.pools(namespace).get(name))
            .await
            .context("timeout while fetching pool")?;
        match res {
            Ok(pool) => Ok(Some(pool)),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(err).context("error fetching pool"),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, pool), fields(name = pool.name()))]
    async fn add_finalizer(&self, pool: &FleetPool) -> Result<()> {
        let patch = finalizers_patch(pool.meta(), FINALIZER_POOL, true);
        timeout(
            API_TIMEOUT,
            self.pools(pool.namespace()).patch(pool.name(), &PatchParams::default(), &patch),
        )
        .await
        .context("timeout while adding pool finalizer")?
        .context("error adding pool finalizer")
        .map(|_| ())
    }

    #[tracing::instrument(level = "debug", skip(self, pool), fields(name = pool.name()))]
    async fn remove_finalizer(&self, pool: &FleetPool) -> Result<()> {
        let patch = finalizers_patch(pool.meta(), FINALIZER_POOL, false);
        let res = timeout(
            API_TIMEOUT,
            self.pools(pool.namespace()).patch(pool.name(), &PatchParams::default(), &patch),
        )
        .await
        .context("timeout while removing pool finalizer")?;
        match res {
            Ok(_val) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(err).context("error removing pool finalizer"),
        }
    }

    /// Write the given status using Server-Side Apply.
    #[tracing::instrument(level = "debug", skip(self, pool, status), fields(name = pool.name()))]
    async fn update_status(&self, pool: &FleetPool, status: &FleetPoolStatus) -> Result<()> {
        let patch = Patch::Apply(json!({
            "apiVersion": FleetPool::api_version(&()),
            "kind": FleetPool::kind(&()),
            "metadata": { "name": pool.name(), "namespace": pool.namespace() },
            "status": status,
        }));
        let params = PatchParams::apply(APP_NAME).force();
        timeout(API_TIMEOUT, self.pools(pool.namespace()).patch_status(pool.name(), &params, &patch))
            .await
            .context("timeout while updating pool status")?
            .context("error updating pool status")
            .map(|_| ())
    }
}

/// Build a label selector matching all of the given labels.
pub(crate) fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(key, val)| format!("{}={}", key, val))
        .collect::<Vec<_>>()
        .join(",")
}

/// Build a merge patch adding or removing the given finalizer.
///
/// The patch carries the resource version it was computed from, so that the API server rejects it
/// if the finalizers were concurrently modified.
pub(crate) fn finalizers_patch(
    meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta, finalizer: &str, add: bool,
) -> Patch<serde_json::Value> {
    let mut finalizers: Vec<String> = meta
        .finalizers
        .iter()
        .flatten()
        .filter(|f| f.as_str() != finalizer)
        .cloned()
        .collect();
    if add {
        finalizers.push(finalizer.into());
    }
    Patch::Merge(json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": meta.resource_version,
        }
    }))
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(api_err) if api_err.code == http::StatusCode::NOT_FOUND)
}
