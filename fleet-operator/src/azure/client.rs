use async_trait::async_trait;
use fleet_core::crd::{OperationCheckpoint, OperationKind};
use fleet_core::{CloudError, SERVICE_SCALE_SETS, SERVICE_SCALE_SET_VMS};
use reqwest::{Method, Url};

use crate::azure::{convert, wire, ArmClient, PollStatus};
use crate::scaleset::cloud::ScaleSetClient;
use crate::scaleset::resource::{Instance, ScaleSet, ScaleSetPatch};

/// A scale set client backed by the resource manager's compute API.
#[derive(Clone)]
pub struct ArmScaleSetClient {
    arm: ArmClient,
}

impl ArmScaleSetClient {
    pub fn new(arm: ArmClient) -> Self {
        Self { arm }
    }

    fn scale_set_url(&self, resource_group: &str, name: &str) -> Result<Url, CloudError> {
        self.arm.url(&scale_set_path(resource_group, name))
    }

    fn instance_url(&self, resource_group: &str, name: &str, instance_id: &str) -> Result<Url, CloudError> {
        self.arm
            .url(&format!("{}/virtualMachines/{}", scale_set_path(resource_group, name), instance_id))
    }
}

fn scale_set_path(resource_group: &str, name: &str) -> String {
    format!(
        "/resourceGroups/{}/providers/Microsoft.Compute/virtualMachineScaleSets/{}",
        resource_group, name
    )
}

#[async_trait]
impl ScaleSetClient for ArmScaleSetClient {
    async fn get(&self, resource_group: &str, name: &str) -> Result<ScaleSet, CloudError> {
        let url = self.scale_set_url(resource_group, name)?;
        let scale_set: wire::VirtualMachineScaleSet = self.arm.get_json(url).await?;
        Ok(convert::scale_set_from_wire(scale_set))
    }

    async fn list_instances(&self, resource_group: &str, name: &str) -> Result<Vec<Instance>, CloudError> {
        let url = self
            .arm
            .url(&format!("{}/virtualMachines", scale_set_path(resource_group, name)))?;
        let instances: Vec<wire::VirtualMachineScaleSetVm> = self.arm.get_pages(url).await?;
        Ok(instances.into_iter().map(convert::instance_from_wire).collect())
    }

    #[tracing::instrument(level = "debug", skip(self, scale_set))]
    async fn create_or_update_async(&self, resource_group: &str, name: &str, scale_set: &ScaleSet) -> Result<OperationCheckpoint, CloudError> {
        let url = self.scale_set_url(resource_group, name)?;
        let body = convert::scale_set_to_wire(scale_set);
        let token = self.arm.begin(Method::PUT, url, Some(&body)).await?;
        Ok(OperationCheckpoint::new(OperationKind::Create, SERVICE_SCALE_SETS, resource_group, name, token))
    }

    #[tracing::instrument(level = "debug", skip(self, patch))]
    async fn update_async(&self, resource_group: &str, name: &str, patch: &ScaleSetPatch) -> Result<OperationCheckpoint, CloudError> {
        let url = self.scale_set_url(resource_group, name)?;
        let body = convert::patch_to_wire(patch);
        let token = self.arm.begin(Method::PATCH, url, Some(&body)).await?;
        Ok(OperationCheckpoint::new(OperationKind::Update, SERVICE_SCALE_SETS, resource_group, name, token))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn delete_async(&self, resource_group: &str, name: &str) -> Result<OperationCheckpoint, CloudError> {
        let url = self.scale_set_url(resource_group, name)?;
        let token = self.arm.begin(Method::DELETE, url, None::<&()>).await?;
        Ok(OperationCheckpoint::new(OperationKind::Delete, SERVICE_SCALE_SETS, resource_group, name, token))
    }

    async fn get_result_if_done(&self, checkpoint: &OperationCheckpoint) -> Result<Option<ScaleSet>, CloudError> {
        let deleting = checkpoint.kind == OperationKind::Delete;
        let status = match self.arm.poll(&checkpoint.data).await {
            Ok(status) => status,
            // Deletes without an operation URL are polled through the resource, which is gone once done.
            Err(CloudError::NotFound(_)) if deleting => return Ok(None),
            Err(err) => return Err(err),
        };
        match status {
            PollStatus::InProgress => Err(CloudError::OperationNotDone(format!(
                "{:?} of {}/{} is in progress",
                checkpoint.kind, checkpoint.resource_group, checkpoint.name
            ))),
            PollStatus::Failed(reason) => Err(CloudError::OperationFailed(format!(
                "{:?} of {}/{} failed: {}",
                checkpoint.kind, checkpoint.resource_group, checkpoint.name, reason
            ))),
            PollStatus::Succeeded if deleting || checkpoint.service_name != SERVICE_SCALE_SETS => Ok(None),
            PollStatus::Succeeded => self.get(&checkpoint.resource_group, &checkpoint.name).await.map(Some),
        }
    }

    async fn get_instance(&self, resource_group: &str, name: &str, instance_id: &str) -> Result<Instance, CloudError> {
        let url = self.instance_url(resource_group, name, instance_id)?;
        let instance: wire::VirtualMachineScaleSetVm = self.arm.get_json(url).await?;
        Ok(convert::instance_from_wire(instance))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn delete_instance_async(&self, resource_group: &str, name: &str, instance_id: &str) -> Result<OperationCheckpoint, CloudError> {
        let url = self.instance_url(resource_group, name, instance_id)?;
        let token = self.arm.begin(Method::DELETE, url, None::<&()>).await?;
        Ok(OperationCheckpoint::new(
            OperationKind::Delete,
            SERVICE_SCALE_SET_VMS,
            resource_group,
            instance_id,
            token,
        ))
    }
}
