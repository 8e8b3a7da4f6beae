//! Runtime configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The port used for metrics scraping and healthchecks.
    #[serde(default = "Config::default_http_port")]
    pub http_port: u16,

    /// The Kubernetes namespace watched by this operator.
    pub namespace: String,

    /// The subscription of the cluster's cloud resources.
    pub azure_subscription_id: String,
    /// The bearer token used against the cloud resource manager.
    pub azure_access_token: String,
    /// The base URL of the cloud resource manager.
    #[serde(default = "Config::default_resource_manager_endpoint")]
    pub azure_resource_manager_endpoint: String,

    /// The period in seconds after which every object is reconciled again.
    #[serde(default = "Config::default_resync_seconds")]
    pub resync_seconds: u64,
    /// The bound in seconds on every cloud API call.
    #[serde(default = "Config::default_cloud_timeout_seconds")]
    pub cloud_timeout_seconds: u64,
}

impl Config {
    /// Create a new config instance from the runtime environment.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        envy::from_env().context("error building config from env")
    }

    /// The periodic resync interval.
    pub fn resync_period(&self) -> Duration {
        Duration::from_secs(self.resync_seconds)
    }

    /// The bound on every cloud API call.
    pub fn cloud_timeout(&self) -> Duration {
        Duration::from_secs(self.cloud_timeout_seconds)
    }

    fn default_http_port() -> u16 {
        7000
    }

    fn default_resource_manager_endpoint() -> String {
        "https://management.azure.com".into()
    }

    fn default_resync_seconds() -> u64 {
        600
    }

    fn default_cloud_timeout_seconds() -> u64 {
        30
    }
}
