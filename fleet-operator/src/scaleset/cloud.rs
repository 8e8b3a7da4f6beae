//! The cloud client abstraction used by the reconciliation engine.

use async_trait::async_trait;
use fleet_core::crd::OperationCheckpoint;
use fleet_core::CloudError;

use crate::scaleset::resource::{Instance, ScaleSet, ScaleSetPatch};

/// A thin client of the cloud compute API's scale set operations.
///
/// Mutations never wait for completion. They return a checkpoint once the cloud has accepted the
/// operation, which is later handed back to `get_result_if_done`.
#[async_trait]
pub trait ScaleSetClient: Send + Sync {
    /// Get the scale set of the given name.
    async fn get(&self, resource_group: &str, name: &str) -> Result<ScaleSet, CloudError>;

    /// List the instances of the given scale set.
    async fn list_instances(&self, resource_group: &str, name: &str) -> Result<Vec<Instance>, CloudError>;

    /// Begin creating or replacing the given scale set.
    async fn create_or_update_async(&self, resource_group: &str, name: &str, scale_set: &ScaleSet) -> Result<OperationCheckpoint, CloudError>;

    /// Begin patching the given scale set.
    async fn update_async(&self, resource_group: &str, name: &str, patch: &ScaleSetPatch) -> Result<OperationCheckpoint, CloudError>;

    /// Begin deleting the given scale set.
    async fn delete_async(&self, resource_group: &str, name: &str) -> Result<OperationCheckpoint, CloudError>;

    /// Poll the operation of the given checkpoint.
    ///
    /// Yields `CloudError::OperationNotDone` while the operation is in flight and
    /// `CloudError::OperationFailed` once it failed. A completed create or update yields the
    /// resulting scale set; a completed delete yields `None`.
    async fn get_result_if_done(&self, checkpoint: &OperationCheckpoint) -> Result<Option<ScaleSet>, CloudError>;

    /// Get a single instance of the given scale set.
    async fn get_instance(&self, resource_group: &str, name: &str, instance_id: &str) -> Result<Instance, CloudError>;

    /// Begin deleting a single instance of the given scale set.
    ///
    /// The returned checkpoint is keyed by the instance ID under the `scalesetvms` service.
    async fn delete_instance_async(&self, resource_group: &str, name: &str, instance_id: &str) -> Result<OperationCheckpoint, CloudError>;
}
