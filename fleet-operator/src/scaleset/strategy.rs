//! Deployment strategies.
//!
//! A strategy computes how many instances may surge above the desired count during a model update,
//! and picks which machines to delete to bring the pool back down to its desired count.

use std::cmp::Reverse;

use anyhow::{Context, Result};
use fleet_core::crd::{DeletePolicy, DeploymentStrategySpec, FleetMachine, IntOrPercent, ProvisioningState, STRATEGY_ROLLING_UPDATE};
use kube::Resource;
use rand::seq::SliceRandom;

/// A deployment strategy, selected by the `type` of a pool's strategy spec.
#[derive(Clone, Debug, PartialEq)]
pub enum DeploymentStrategy {
    RollingUpdate(RollingUpdate),
    /// No strategy, or an unrecognized one. Surge is zero and no machines are selected for deletion.
    Disabled,
}

/// Rolling update parameters with defaults applied.
#[derive(Clone, Debug, PartialEq)]
pub struct RollingUpdate {
    pub max_surge: IntOrPercent,
    pub max_unavailable: IntOrPercent,
    pub delete_policy: DeletePolicy,
}

impl Default for RollingUpdate {
    fn default() -> Self {
        Self {
            max_surge: IntOrPercent::Int(1),
            max_unavailable: IntOrPercent::Int(0),
            delete_policy: DeletePolicy::Oldest,
        }
    }
}

impl DeploymentStrategy {
    /// Select the strategy described by the given spec.
    pub fn from_spec(spec: Option<&DeploymentStrategySpec>) -> Self {
        let spec = match spec {
            Some(spec) => spec,
            None => return Self::Disabled,
        };
        if spec.type_.as_deref() != Some(STRATEGY_ROLLING_UPDATE) {
            return Self::Disabled;
        }
        let mut rolling = RollingUpdate::default();
        if let Some(params) = spec.rolling_update.as_ref() {
            if let Some(max_surge) = params.max_surge.clone() {
                rolling.max_surge = max_surge;
            }
            if let Some(max_unavailable) = params.max_unavailable.clone() {
                rolling.max_unavailable = max_unavailable;
            }
            if let Some(delete_policy) = params.delete_policy {
                rolling.delete_policy = delete_policy;
            }
        }
        Self::RollingUpdate(rolling)
    }

    /// The number of instances which may be created above the desired count.
    pub fn surge(&self, desired: u32) -> Result<i64> {
        match self {
            Self::RollingUpdate(rolling) => {
                let surge = scaled_value(&rolling.max_surge, desired, true).context("failed to calculate surge for the pool")?;
                Ok(i64::from(surge.max(0)))
            }
            Self::Disabled => Ok(0),
        }
    }

    /// Select the machines to delete in order to converge on the desired count.
    ///
    /// Returns `None` when this strategy does not select machines at all.
    pub fn select_machines_to_delete(&self, desired: u32, machines: &[FleetMachine]) -> Result<Option<Vec<FleetMachine>>> {
        match self {
            Self::RollingUpdate(rolling) => rolling.select_machines_to_delete(desired, machines).map(Some),
            Self::Disabled => Ok(None),
        }
    }
}

impl RollingUpdate {
    fn select_machines_to_delete(&self, desired: u32, machines: &[FleetMachine]) -> Result<Vec<FleetMachine>> {
        let max_unavailable = scaled_value(&self.max_unavailable, desired, false).context("failed to calculate max unavailable")?;
        let desired = i64::from(desired);

        let failed = self.ordered(machines.iter().filter(|m| machine_state(m) == Some(ProvisioningState::Failed)));
        let deleting = self.ordered(machines.iter().filter(|m| machine_state(m) == Some(ProvisioningState::Deleting)));
        let ready = self.ordered(machines.iter().filter(|m| is_ready(m)));
        let without_latest = self.ordered(machines.iter().filter(|m| !is_latest_model(m)));

        let ready_count = ready.len() as i64;
        let over_provisioned = ready_count - desired;
        let disruption_budget = if i64::from(max_unavailable) > desired {
            desired
        } else {
            ready_count - desired + i64::from(max_unavailable)
        };

        if !failed.is_empty() {
            tracing::debug!(failed = failed.len(), "selecting failed machines for deletion");
            return Ok(failed);
        }
        if !deleting.is_empty() {
            tracing::debug!(deleting = deleting.len(), "machines are already deleting, no further selection");
            return Ok(deleting);
        }
        if ready_count < desired {
            tracing::debug!(ready = ready_count, desired, "not enough ready machines to select any for deletion");
            return Ok(vec![]);
        }

        if over_provisioned > 0 {
            let limit = over_provisioned as usize;
            let mut to_delete: Vec<FleetMachine> = Vec::with_capacity(limit);
            for machine in without_latest.into_iter().chain(ready.into_iter()) {
                if to_delete.len() >= limit {
                    break;
                }
                if to_delete.iter().any(|m| m.spec.provider_id == machine.spec.provider_id) {
                    continue;
                }
                to_delete.push(machine);
            }
            tracing::debug!(over_provisioned, selected = to_delete.len(), "selecting over-provisioned machines for deletion");
            return Ok(to_delete);
        }

        if without_latest.is_empty() {
            return Ok(vec![]);
        }
        if disruption_budget <= 0 {
            tracing::debug!(disruption_budget, "no disruption budget available to replace outdated machines");
            return Ok(vec![]);
        }
        let mut to_delete: Vec<FleetMachine> = without_latest.into_iter().filter(is_ready).collect();
        to_delete.truncate(disruption_budget as usize);
        tracing::debug!(disruption_budget, selected = to_delete.len(), "selecting outdated machines for deletion");
        Ok(to_delete)
    }

    /// Order the given machines according to this strategy's delete policy.
    fn ordered<'a>(&self, machines: impl Iterator<Item = &'a FleetMachine>) -> Vec<FleetMachine> {
        let mut machines: Vec<FleetMachine> = machines.cloned().collect();
        match self.delete_policy {
            DeletePolicy::Oldest => machines.sort_by_key(|m| m.meta().creation_timestamp.as_ref().map(|ts| ts.0)),
            DeletePolicy::Newest => machines.sort_by_key(|m| Reverse(m.meta().creation_timestamp.as_ref().map(|ts| ts.0))),
            DeletePolicy::Random => machines.shuffle(&mut rand::thread_rng()),
        }
        machines
    }
}

fn machine_state(machine: &FleetMachine) -> Option<ProvisioningState> {
    machine.status.as_ref().and_then(|status| status.provisioning_state)
}

fn is_ready(machine: &FleetMachine) -> bool {
    machine.status.as_ref().map(|status| status.ready).unwrap_or(false)
}

fn is_latest_model(machine: &FleetMachine) -> bool {
    machine.status.as_ref().map(|status| status.latest_model_applied).unwrap_or(false)
}

/// Resolve an int-or-percent value against the given total.
///
/// Percentages are rounded up when `round_up` is set, else truncated.
pub fn scaled_value(val: &IntOrPercent, total: u32, round_up: bool) -> Result<i32> {
    match val {
        IntOrPercent::Int(val) => Ok(*val),
        IntOrPercent::Percent(raw) => {
            let pct: f64 = raw
                .trim()
                .strip_suffix('%')
                .with_context(|| format!("invalid value {:?}: percentages must end with %", raw))?
                .parse()
                .with_context(|| format!("invalid percentage value {:?}", raw))?;
            let scaled = pct * f64::from(total) / 100.0;
            Ok(if round_up { scaled.ceil() as i32 } else { scaled.floor() as i32 })
        }
    }
}
