use anyhow::Result;
use async_trait::async_trait;

/// The key of the bootstrap secret which holds the payload.
pub const BOOTSTRAP_SECRET_KEY: &str = "value";

/// A source of the bootstrap payload handed to new instances as custom data.
#[async_trait]
pub trait BootstrapDataSource: Send + Sync {
    /// Get the payload stored in the given secret, base64 encoded.
    async fn get(&self, namespace: &str, secret_name: &str) -> Result<String>;
}
