//! Fleet CRDs.
//!
//! References:
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/#additional-printer-columns

pub mod checkpoint;
#[cfg(test)]
mod checkpoint_test;
pub mod condition;
mod machine;
mod pool;

use std::fmt;
use std::str::FromStr;

use kube::Resource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use checkpoint::{OperationCheckpoint, OperationKind};
pub use condition::{Condition, ConditionSeverity, ConditionStatus};
pub use machine::{FleetMachine, FleetMachineSpec, FleetMachineStatus};
pub use pool::{
    AdditionalCapabilities, DataDisk, DeletePolicy, DeploymentStrategySpec, DiffDiskSettings, EvictionPolicy, FleetPool, FleetPoolSpec, FleetPoolStatus,
    IdentityMode, Image, IntOrPercent, MachineTemplate, ManagedDisk, MarketplaceImage, NetworkAttachment, OsDisk, OsType, RollingUpdateSpec,
    SecurityProfile, SharedGalleryImage, SpotVmOptions, STRATEGY_ROLLING_UPDATE,
};

/// A convenience trait built around the fact that all implementors
/// must have the following attributes.
pub trait RequiredMetadata {
    /// The namespace of this object.
    fn namespace(&self) -> &str;

    /// The name of this object.
    fn name(&self) -> &str;

    /// The UID of this object.
    fn uid(&self) -> &str;
}

impl RequiredMetadata for FleetPool {
    fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    fn uid(&self) -> &str {
        self.meta().uid.as_deref().unwrap_or_default()
    }
}

impl RequiredMetadata for FleetMachine {
    fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    fn uid(&self) -> &str {
        self.meta().uid.as_deref().unwrap_or_default()
    }
}

/// The provisioning state of a cloud resource.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum ProvisioningState {
    Creating,
    Updating,
    Deleting,
    Succeeded,
    Failed,
    Canceled,
}

impl ProvisioningState {
    /// Check if this state is one in which no further transitions are expected without a new
    /// mutation being issued.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "Creating",
            Self::Updating => "Updating",
            Self::Deleting => "Deleting",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Canceled => "Canceled",
        }
    }
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProvisioningState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "creating" => Ok(Self::Creating),
            "updating" => Ok(Self::Updating),
            "deleting" => Ok(Self::Deleting),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "canceled" | "cancelled" => Ok(Self::Canceled),
            _ => anyhow::bail!("unknown provisioning state {:?}", s),
        }
    }
}
