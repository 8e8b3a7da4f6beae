use std::time::Duration;

use anyhow::Result;

use crate::config::Config;

#[test]
fn config_deserializes_from_full_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("HTTP_PORT".into(), "8080".into()),
        ("NAMESPACE".into(), "fleet-system".into()),
        ("AZURE_SUBSCRIPTION_ID".into(), "sub0".into()),
        ("AZURE_ACCESS_TOKEN".into(), "token0".into()),
        ("AZURE_RESOURCE_MANAGER_ENDPOINT".into(), "https://management.usgovcloudapi.net".into()),
        ("RESYNC_SECONDS".into(), "120".into()),
        ("CLOUD_TIMEOUT_SECONDS".into(), "5".into()),
    ])?;

    assert!(config.rust_log == "error", "unexpected value parsed for RUST_LOG, got {}, expected {}", config.rust_log, "error");
    assert!(config.http_port == 8080, "unexpected value parsed for HTTP_PORT, got {}, expected {}", config.http_port, 8080);
    assert!(config.namespace == "fleet-system", "unexpected value parsed for NAMESPACE, got {}, expected {}", config.namespace, "fleet-system");
    assert!(
        config.azure_subscription_id == "sub0",
        "unexpected value parsed for AZURE_SUBSCRIPTION_ID, got {}, expected {}",
        config.azure_subscription_id,
        "sub0"
    );
    assert!(
        config.azure_resource_manager_endpoint == "https://management.usgovcloudapi.net",
        "unexpected value parsed for AZURE_RESOURCE_MANAGER_ENDPOINT, got {}",
        config.azure_resource_manager_endpoint
    );
    assert!(
        config.resync_period() == Duration::from_secs(120),
        "unexpected resync period, got {:?}",
        config.resync_period()
    );
    assert!(
        config.cloud_timeout() == Duration::from_secs(5),
        "unexpected cloud timeout, got {:?}",
        config.cloud_timeout()
    );
    Ok(())
}

#[test]
fn config_applies_defaults() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "info".into()),
        ("NAMESPACE".into(), "default".into()),
        ("AZURE_SUBSCRIPTION_ID".into(), "sub0".into()),
        ("AZURE_ACCESS_TOKEN".into(), "token0".into()),
    ])?;

    assert!(config.http_port == 7000, "unexpected default for HTTP_PORT, got {}", config.http_port);
    assert!(
        config.azure_resource_manager_endpoint == "https://management.azure.com",
        "unexpected default for AZURE_RESOURCE_MANAGER_ENDPOINT, got {}",
        config.azure_resource_manager_endpoint
    );
    assert!(config.resync_seconds == 600, "unexpected default for RESYNC_SECONDS, got {}", config.resync_seconds);
    assert!(config.cloud_timeout_seconds == 30, "unexpected default for CLOUD_TIMEOUT_SECONDS, got {}", config.cloud_timeout_seconds);
    Ok(())
}

#[test]
fn config_requires_cloud_credentials() -> Result<()> {
    let res: std::result::Result<Config, _> = envy::from_iter(vec![
        ("RUST_LOG".into(), "info".into()),
        ("NAMESPACE".into(), "default".into()),
    ]);
    assert!(res.is_err(), "expected missing AZURE_SUBSCRIPTION_ID to be rejected");
    Ok(())
}
