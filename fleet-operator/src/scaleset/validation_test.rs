use std::sync::atomic::Ordering;

use anyhow::Result;
use fleet_core::crd::{AdditionalCapabilities, DataDisk, DiffDiskSettings, ManagedDisk, SecurityProfile};
use fleet_core::error::{classify, is_terminal};

use crate::fixtures::{self, FakeCapabilities};
use crate::scaleset::capability::CAPABILITY_EPHEMERAL_OS_DISK;
use crate::scaleset::spec::FleetSpec;
use crate::scaleset::validation::*;

fn spec() -> FleetSpec {
    FleetSpec::from_pool(&fixtures::pool("pool0", 2))
}

fn ultra_disk() -> DataDisk {
    DataDisk {
        name_suffix: "ultra".into(),
        disk_size_gb: 128,
        lun: Some(0),
        managed_disk: Some(ManagedDisk {
            storage_account_type: STORAGE_ULTRA_SSD.into(),
            disk_encryption_set_id: None,
        }),
        caching_type: None,
    }
}

#[tokio::test]
async fn valid_spec_yields_validated_sku() -> Result<()> {
    let caps = FakeCapabilities::new(fixtures::sku("4", "16"));
    let validated = validate(&spec(), &caps).await?;
    assert!(validated.sku().name == fixtures::VM_SIZE, "unexpected sku returned, got {}", validated.sku().name);
    Ok(())
}

#[tokio::test]
async fn single_vcpu_size_is_rejected_as_terminal() -> Result<()> {
    let caps = FakeCapabilities::new(fixtures::sku("1", "16"));
    let err = match validate(&spec(), &caps).await {
        Ok(_) => anyhow::bail!("expected validation to fail for a 1 vCPU size"),
        Err(err) => err,
    };
    assert!(is_terminal(&err), "expected terminal error, got {:?}", err);
    assert!(
        format!("{:#}", err) == "vm size should be bigger or equal to at least 2 vCPUs",
        "unexpected error message, got {:#}",
        err
    );
    let zone_calls = caps.zone_calls.load(Ordering::SeqCst);
    assert!(zone_calls == 0, "expected validation to stop at the vCPU check, got {} zone lookups", zone_calls);
    Ok(())
}

#[tokio::test]
async fn small_memory_is_rejected_as_terminal() -> Result<()> {
    let caps = FakeCapabilities::new(fixtures::sku("2", "1.5"));
    let err = match validate(&spec(), &caps).await {
        Ok(_) => anyhow::bail!("expected validation to fail for 1.5Gi of memory"),
        Err(err) => err,
    };
    assert!(is_terminal(&err), "expected terminal error, got {:?}", err);
    assert!(
        format!("{:#}", err).contains("at least 2Gi"),
        "unexpected error message, got {:#}",
        err
    );
    Ok(())
}

#[tokio::test]
async fn non_numeric_capability_is_terminal() -> Result<()> {
    let caps = FakeCapabilities::new(fixtures::sku("many", "16"));
    let err = match validate(&spec(), &caps).await {
        Ok(_) => anyhow::bail!("expected validation to fail for a non-numeric vCPU capability"),
        Err(err) => err,
    };
    assert!(is_terminal(&err), "expected terminal error, got {:?}", err);
    Ok(())
}

#[tokio::test]
async fn ephemeral_os_requires_capability() -> Result<()> {
    let mut spec = spec();
    spec.pool.template.os_disk.diff_disk_settings = Some(DiffDiskSettings { option: "Local".into() });

    let caps = FakeCapabilities::new(fixtures::sku("4", "16"));
    let err = match validate(&spec, &caps).await {
        Ok(_) => anyhow::bail!("expected validation to fail without ephemeral os support"),
        Err(err) => err,
    };
    assert!(is_terminal(&err), "expected terminal error, got {:?}", err);
    assert!(format!("{:#}", err).contains("does not support ephemeral os"), "unexpected error message, got {:#}", err);

    let mut sku = fixtures::sku("4", "16");
    sku.capabilities.insert(CAPABILITY_EPHEMERAL_OS_DISK.into(), "True".into());
    let caps = FakeCapabilities::new(sku);
    validate(&spec, &caps).await?;
    Ok(())
}

#[tokio::test]
async fn encryption_at_host_requires_capability() -> Result<()> {
    let mut spec = spec();
    spec.pool.template.security_profile = Some(SecurityProfile { encryption_at_host: Some(true) });

    let caps = FakeCapabilities::new(fixtures::sku("4", "16"));
    let err = match validate(&spec, &caps).await {
        Ok(_) => anyhow::bail!("expected validation to fail without encryption at host support"),
        Err(err) => err,
    };
    assert!(is_terminal(&err), "expected terminal error, got {:?}", err);
    assert!(
        format!("{:#}", err) == format!("encryption at host is not supported for VM type {}", fixtures::VM_SIZE),
        "unexpected error message, got {:#}",
        err
    );
    Ok(())
}

#[tokio::test]
async fn ultra_disks_require_zonal_capability() -> Result<()> {
    let mut spec = spec();
    spec.pool.template.data_disks = vec![ultra_disk()];

    let caps = FakeCapabilities::new(fixtures::sku("4", "16"));
    let err = match validate(&spec, &caps).await {
        Ok(_) => anyhow::bail!("expected validation to fail without ultra disk support"),
        Err(err) => err,
    };
    assert!(is_terminal(&err), "expected terminal error, got {:?}", err);
    assert!(format!("{:#}", err).contains("does not support ultra disks"), "unexpected error message, got {:#}", err);

    let caps = FakeCapabilities::new(fixtures::sku_with_ultra_ssd("4", "16"));
    validate(&spec, &caps).await?;
    Ok(())
}

#[tokio::test]
async fn explicit_ultra_override_is_validated() -> Result<()> {
    let mut spec = spec();
    spec.pool.template.additional_capabilities = Some(AdditionalCapabilities { ultra_ssd_enabled: Some(true) });
    let caps = FakeCapabilities::new(fixtures::sku("4", "16"));
    assert!(validate(&spec, &caps).await.is_err(), "expected explicit ultra override to be validated");

    spec.pool.template.additional_capabilities = Some(AdditionalCapabilities { ultra_ssd_enabled: Some(false) });
    validate(&spec, &caps).await?;
    Ok(())
}

#[tokio::test]
async fn zone_lookup_failure_is_terminal() -> Result<()> {
    let mut caps = FakeCapabilities::new(fixtures::sku("4", "16"));
    caps.zones_unavailable = true;
    let err = match validate(&spec(), &caps).await {
        Ok(_) => anyhow::bail!("expected validation to fail when zones can not be fetched"),
        Err(err) => err,
    };
    assert!(is_terminal(&err), "expected terminal error, got {:?}", err);
    Ok(())
}

#[tokio::test]
async fn failure_domains_must_offer_the_size() -> Result<()> {
    let mut spec = spec();
    spec.pool.failure_domains = vec!["1".into(), "4".into()];
    let caps = FakeCapabilities::new(fixtures::sku("4", "16"));
    let err = match validate(&spec, &caps).await {
        Ok(_) => anyhow::bail!("expected validation to fail for an unknown zone"),
        Err(err) => err,
    };
    assert!(is_terminal(&err), "expected terminal error, got {:?}", err);
    assert!(
        format!("{:#}", err).starts_with("availability zone 4 is not available"),
        "unexpected error message, got {:#}",
        err
    );

    spec.pool.failure_domains = vec!["1".into(), "3".into()];
    validate(&spec, &caps).await?;
    Ok(())
}

#[tokio::test]
async fn unknown_size_is_terminal_and_lookup_failure_is_transient() -> Result<()> {
    let caps = FakeCapabilities::default();
    let err = match validate(&spec(), &caps).await {
        Ok(_) => anyhow::bail!("expected validation to fail for an unknown size"),
        Err(err) => err,
    };
    assert!(is_terminal(&err), "expected terminal error for unknown size, got {:?}", err);
    assert!(format!("{:#}", err).starts_with("failed to get SKU"), "unexpected error message, got {:#}", err);

    let mut caps = FakeCapabilities::new(fixtures::sku("4", "16"));
    caps.lookup_unavailable = true;
    let err = match validate(&spec(), &caps).await {
        Ok(_) => anyhow::bail!("expected validation to fail when the lookup is unavailable"),
        Err(err) => err,
    };
    assert!(classify(&err).is_some(), "expected transient error for lookup failure, got {:?}", err);
    Ok(())
}
