use anyhow::Result;

use crate::crd::checkpoint::*;
use crate::{SERVICE_SCALE_SETS, SERVICE_SCALE_SET_VMS};

#[test]
fn set_replaces_checkpoint_with_same_key() -> Result<()> {
    let mut cps = vec![];
    set(&mut cps, OperationCheckpoint::new(OperationKind::Create, SERVICE_SCALE_SETS, "rg", "pool0", "token-a".into()));
    set(&mut cps, OperationCheckpoint::new(OperationKind::Update, SERVICE_SCALE_SETS, "rg", "pool0", "token-b".into()));

    assert!(cps.len() == 1, "expected exactly one checkpoint per key, got {}", cps.len());
    let cp = get(&cps, "pool0", SERVICE_SCALE_SETS);
    assert!(
        matches!(cp, Some(cp) if cp.kind == OperationKind::Update && cp.data == "token-b"),
        "expected the latest checkpoint to win, got {:?}",
        cp
    );
    Ok(())
}

#[test]
fn checkpoints_are_keyed_by_name_and_service() -> Result<()> {
    let mut cps = vec![];
    set(&mut cps, OperationCheckpoint::new(OperationKind::Create, SERVICE_SCALE_SETS, "rg", "pool0", "a".into()));
    set(&mut cps, OperationCheckpoint::new(OperationKind::Delete, SERVICE_SCALE_SET_VMS, "rg", "pool0", "b".into()));
    set(&mut cps, OperationCheckpoint::new(OperationKind::Create, SERVICE_SCALE_SETS, "rg", "pool1", "c".into()));
    assert!(cps.len() == 3, "expected 3 distinct checkpoints, got {}", cps.len());

    clear(&mut cps, "pool0", SERVICE_SCALE_SETS);
    assert!(!has(&cps, "pool0", SERVICE_SCALE_SETS), "expected pool0/scalesets to be cleared");
    assert!(has(&cps, "pool0", SERVICE_SCALE_SET_VMS), "expected pool0/scalesetvms to be retained");
    assert!(has(&cps, "pool1", SERVICE_SCALE_SETS), "expected pool1/scalesets to be retained");
    Ok(())
}

#[test]
fn checkpoint_serializes_with_camel_case_keys() -> Result<()> {
    let cp = OperationCheckpoint::new(OperationKind::Delete, SERVICE_SCALE_SETS, "rg", "pool0", "https://poll".into());
    let val = serde_json::to_value(&cp)?;
    assert!(val["type"] == "Delete", "expected type field to be Delete, got {}", val["type"]);
    assert!(val["serviceName"] == SERVICE_SCALE_SETS, "expected serviceName field, got {}", val);
    assert!(val["resourceGroup"] == "rg", "expected resourceGroup field, got {}", val);
    Ok(())
}
