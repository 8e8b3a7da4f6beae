//! Operation checkpoints.
//!
//! A checkpoint is the persisted token of an accepted, still outstanding, long-running cloud
//! operation. It lives in the status of the object which issued the operation and is keyed by
//! `(name, service_name)`. Its presence is the only signal that a mutation is in flight.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The kind of a long-running operation.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

/// A durable record of an in-flight asynchronous cloud operation.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperationCheckpoint {
    /// The kind of operation.
    #[serde(rename = "type")]
    pub kind: OperationKind,
    /// The subsystem which issued the operation.
    pub service_name: String,
    /// The name of the target resource.
    pub name: String,
    /// The resource group of the target resource.
    pub resource_group: String,
    /// Opaque polling token handed out by the cloud API.
    pub data: String,
    /// The time at which the operation was accepted.
    pub created_at: DateTime<Utc>,
}

impl OperationCheckpoint {
    /// Create a new checkpoint stamped with the current time.
    pub fn new(kind: OperationKind, service_name: &str, resource_group: &str, name: &str, data: String) -> Self {
        Self {
            kind,
            service_name: service_name.into(),
            name: name.into(),
            resource_group: resource_group.into(),
            data,
            created_at: Utc::now(),
        }
    }

    fn matches(&self, name: &str, service_name: &str) -> bool {
        self.name == name && self.service_name == service_name
    }
}

/// Get the checkpoint for the given resource & subsystem.
pub fn get<'a>(checkpoints: &'a [OperationCheckpoint], name: &str, service_name: &str) -> Option<&'a OperationCheckpoint> {
    checkpoints.iter().find(|cp| cp.matches(name, service_name))
}

/// Check if a checkpoint exists for the given resource & subsystem.
pub fn has(checkpoints: &[OperationCheckpoint], name: &str, service_name: &str) -> bool {
    get(checkpoints, name, service_name).is_some()
}

/// Store the given checkpoint, replacing any checkpoint with the same key.
pub fn set(checkpoints: &mut Vec<OperationCheckpoint>, checkpoint: OperationCheckpoint) {
    checkpoints.retain(|cp| !cp.matches(&checkpoint.name, &checkpoint.service_name));
    checkpoints.push(checkpoint);
}

/// Remove the checkpoint for the given resource & subsystem, if any.
pub fn clear(checkpoints: &mut Vec<OperationCheckpoint>, name: &str, service_name: &str) {
    checkpoints.retain(|cp| !cp.matches(name, service_name));
}
