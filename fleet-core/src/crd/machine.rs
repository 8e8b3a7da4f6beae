//! FleetMachine CRD.
//!
//! FleetMachines are created by the operator, one per instance of a pool's scale set. They are
//! never expected to be created by hand.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::{Condition, OperationCheckpoint, ProvisioningState};

pub type FleetMachine = FleetMachineCRD; // Mostly to resolve a Rust Analyzer issue.

/// CRD spec for the FleetMachine resource.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    struct = "FleetMachineCRD",
    status = "FleetMachineStatus",
    group = "fleet.rs",
    version = "v1beta1",
    kind = "FleetMachine",
    namespaced,
    derive = "PartialEq",
    apiextensions = "v1",
    shortname = "fleetmachine",
    printcolumn = r#"{"name":"Instance","type":"string","jsonPath":".spec.instanceId"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.provisioningState"}"#,
    printcolumn = r#"{"name":"Latest","type":"boolean","jsonPath":".status.latestModelApplied"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FleetMachineSpec {
    /// The canonical provider ID of the backing instance. Immutable.
    pub provider_id: String,
    /// The ID of the backing instance within its scale set.
    pub instance_id: String,
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FleetMachineStatus {
    #[serde(default)]
    pub ready: bool,
    /// Whether the backing instance runs the latest model of its scale set.
    #[serde(default)]
    pub latest_model_applied: bool,
    #[serde(default)]
    pub provisioning_state: Option<ProvisioningState>,
    /// The cloud name of the backing instance.
    #[serde(default)]
    pub instance_name: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub long_running_operation_states: Vec<OperationCheckpoint>,
}
