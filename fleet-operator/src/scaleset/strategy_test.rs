use anyhow::{Context, Result};
use fleet_core::crd::{
    DeletePolicy, DeploymentStrategySpec, FleetMachine, IntOrPercent, ProvisioningState, RollingUpdateSpec, STRATEGY_ROLLING_UPDATE,
};
use kube::Resource;

use crate::fixtures;
use crate::scaleset::strategy::*;

fn rolling(max_surge: IntOrPercent, max_unavailable: IntOrPercent, delete_policy: DeletePolicy) -> DeploymentStrategy {
    DeploymentStrategy::RollingUpdate(RollingUpdate {
        max_surge,
        max_unavailable,
        delete_policy,
    })
}

fn names(machines: &[FleetMachine]) -> Vec<String> {
    machines.iter().map(|m| m.meta().name.clone().unwrap_or_default()).collect()
}

#[test]
fn absent_or_unknown_strategy_is_disabled() -> Result<()> {
    assert!(DeploymentStrategy::from_spec(None) == DeploymentStrategy::Disabled, "expected absent strategy to be disabled");
    let unknown = DeploymentStrategySpec {
        type_: Some("BlueGreen".into()),
        rolling_update: None,
    };
    assert!(
        DeploymentStrategy::from_spec(Some(&unknown)) == DeploymentStrategy::Disabled,
        "expected unknown strategy to be disabled"
    );
    let surge = DeploymentStrategy::Disabled.surge(10)?;
    assert!(surge == 0, "expected zero surge for disabled strategy, got {}", surge);
    let selected = DeploymentStrategy::Disabled.select_machines_to_delete(1, &[fixtures::machine("m0", true, true, 0)])?;
    assert!(selected.is_none(), "expected disabled strategy to select nothing, got {:?}", selected.map(|s| names(&s)));
    Ok(())
}

#[test]
fn rolling_update_defaults_are_applied() -> Result<()> {
    let spec = DeploymentStrategySpec {
        type_: Some(STRATEGY_ROLLING_UPDATE.into()),
        rolling_update: Some(RollingUpdateSpec {
            delete_policy: Some(DeletePolicy::Newest),
            ..Default::default()
        }),
    };
    let strategy = DeploymentStrategy::from_spec(Some(&spec));
    let expected = rolling(IntOrPercent::Int(1), IntOrPercent::Int(0), DeletePolicy::Newest);
    assert!(strategy == expected, "unexpected strategy, got {:?}, expected {:?}", strategy, expected);
    Ok(())
}

#[test]
fn surge_rounds_percentages_up() -> Result<()> {
    let cases = vec![(IntOrPercent::Int(2), 5, 2), (IntOrPercent::Percent("25%".into()), 5, 2), (IntOrPercent::Percent("10%".into()), 3, 1)];
    for (max_surge, desired, expected) in cases {
        let strategy = rolling(max_surge.clone(), IntOrPercent::Int(0), DeletePolicy::Oldest);
        let surge = strategy.surge(desired)?;
        assert!(surge == expected, "unexpected surge for {:?} of {}, got {}, expected {}", max_surge, desired, surge, expected);
    }
    Ok(())
}

#[test]
fn invalid_percentages_are_rejected() -> Result<()> {
    let strategy = rolling(IntOrPercent::Percent("lots".into()), IntOrPercent::Int(0), DeletePolicy::Oldest);
    assert!(strategy.surge(3).is_err(), "expected invalid percentage to be rejected");
    Ok(())
}

#[test]
fn failed_machines_are_selected_first() -> Result<()> {
    let strategy = rolling(IntOrPercent::Int(1), IntOrPercent::Int(0), DeletePolicy::Oldest);
    let mut failed = fixtures::machine("m-failed", false, true, 3);
    if let Some(status) = failed.status.as_mut() {
        status.provisioning_state = Some(ProvisioningState::Failed);
    }
    let machines = vec![fixtures::machine("m0", true, true, 0), fixtures::machine("m1", true, false, 1), failed];

    let selected = strategy.select_machines_to_delete(2, &machines)?.context("expected a selection")?;
    assert!(names(&selected) == vec!["m-failed"], "expected only failed machine, got {:?}", names(&selected));
    Ok(())
}

#[test]
fn nothing_is_selected_while_under_provisioned() -> Result<()> {
    let strategy = rolling(IntOrPercent::Int(1), IntOrPercent::Int(1), DeletePolicy::Oldest);
    let machines = vec![fixtures::machine("m0", true, false, 0), fixtures::machine("m1", false, false, 1)];
    let selected = strategy.select_machines_to_delete(2, &machines)?.context("expected a selection")?;
    assert!(selected.is_empty(), "expected no selection, got {:?}", names(&selected));
    Ok(())
}

#[test]
fn over_provisioned_prefers_outdated_then_oldest() -> Result<()> {
    let strategy = rolling(IntOrPercent::Int(1), IntOrPercent::Int(0), DeletePolicy::Oldest);
    let machines = vec![
        fixtures::machine("m0", true, true, 0),
        fixtures::machine("m1", true, true, 1),
        fixtures::machine("m2", true, false, 2),
        fixtures::machine("m3", true, true, 3),
    ];
    let selected = strategy.select_machines_to_delete(2, &machines)?.context("expected a selection")?;
    assert!(names(&selected) == vec!["m2", "m0"], "unexpected selection, got {:?}", names(&selected));
    Ok(())
}

#[test]
fn newest_policy_orders_by_creation_descending() -> Result<()> {
    let strategy = rolling(IntOrPercent::Int(1), IntOrPercent::Int(0), DeletePolicy::Newest);
    let machines = vec![
        fixtures::machine("m0", true, true, 0),
        fixtures::machine("m1", true, true, 1),
        fixtures::machine("m2", true, true, 2),
    ];
    let selected = strategy.select_machines_to_delete(2, &machines)?.context("expected a selection")?;
    assert!(names(&selected) == vec!["m2"], "unexpected selection, got {:?}", names(&selected));
    Ok(())
}

#[test]
fn outdated_machines_are_replaced_within_disruption_budget() -> Result<()> {
    let machines = vec![
        fixtures::machine("m0", true, false, 0),
        fixtures::machine("m1", true, false, 1),
        fixtures::machine("m2", true, false, 2),
    ];

    let strict = rolling(IntOrPercent::Int(1), IntOrPercent::Int(0), DeletePolicy::Oldest);
    let selected = strict.select_machines_to_delete(3, &machines)?.context("expected a selection")?;
    assert!(selected.is_empty(), "expected no selection with zero budget, got {:?}", names(&selected));

    let relaxed = rolling(IntOrPercent::Int(1), IntOrPercent::Int(2), DeletePolicy::Oldest);
    let selected = relaxed.select_machines_to_delete(3, &machines)?.context("expected a selection")?;
    assert!(names(&selected) == vec!["m0", "m1"], "unexpected selection, got {:?}", names(&selected));
    Ok(())
}

#[test]
fn converged_pool_selects_nothing() -> Result<()> {
    let strategy = rolling(IntOrPercent::Int(1), IntOrPercent::Int(1), DeletePolicy::Oldest);
    let machines = vec![fixtures::machine("m0", true, true, 0), fixtures::machine("m1", true, true, 1)];
    let selected = strategy.select_machines_to_delete(2, &machines)?.context("expected a selection")?;
    assert!(selected.is_empty(), "expected no selection, got {:?}", names(&selected));
    Ok(())
}
