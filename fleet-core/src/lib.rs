pub mod crd;
pub mod error;

pub use error::{CloudError, ReconcileError};

/// The subsystem name under which scale set operations are checkpointed.
pub const SERVICE_SCALE_SETS: &str = "scalesets";
/// The subsystem name under which scale set instance operations are checkpointed.
pub const SERVICE_SCALE_SET_VMS: &str = "scalesetvms";

/// The canonical label identifying the cluster to which an object belongs.
pub const LABEL_CLUSTER_NAME: &str = "cluster.x-k8s.io/cluster-name";
/// The canonical label identifying the pool to which a machine belongs.
pub const LABEL_POOL_NAME: &str = "fleet.rs/pool";

/// The finalizer placed on FleetPool objects.
pub const FINALIZER_POOL: &str = "fleetpool.fleet.rs";
/// The finalizer placed on FleetMachine objects.
pub const FINALIZER_MACHINE: &str = "fleetmachine.fleet.rs";
