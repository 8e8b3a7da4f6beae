//! A script used to generate the CRDs used by this project.
//!
//! Any time a CRD spec changes, this script can be run to ensure that the CRDs are up-to-date and
//! ready to be synced with the cluster.

use anyhow::{Context, Result};
use fleet_core::crd::{FleetMachine, FleetPool};
use kube::CustomResourceExt;

fn main() -> Result<()> {
    let canon = std::fs::canonicalize("..").context("error getting canonical path of current dir")?;
    let crds_path = canon.join("k8s").join("crds");
    std::fs::create_dir_all(&crds_path).with_context(|| format!("error creating CRD dir {:?}", &crds_path))?;

    let pool = FleetPool::crd();
    let pool_yaml = serde_yaml::to_string(&pool).context("error serializing FleetPool CRD to yaml")?;
    std::fs::write(crds_path.join("fleetpool.yaml"), &pool_yaml).with_context(|| format!("error writing FleetPool CRD to {:?}", &crds_path))?;
    println!("FleetPool CRD written to {:?}", &crds_path);

    let machine = FleetMachine::crd();
    let machine_yaml = serde_yaml::to_string(&machine).context("error serializing FleetMachine CRD to yaml")?;
    std::fs::write(crds_path.join("fleetmachine.yaml"), &machine_yaml)
        .with_context(|| format!("error writing FleetMachine CRD to {:?}", &crds_path))?;
    println!("FleetMachine CRD written to {:?}", &crds_path);

    Ok(())
}
