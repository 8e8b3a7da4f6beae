use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::client::Client;
use tokio::time::timeout;

use crate::k8s::API_TIMEOUT;
use crate::scaleset::bootstrap::{BootstrapDataSource, BOOTSTRAP_SECRET_KEY};

/// A bootstrap payload source reading K8s secrets.
#[derive(Clone)]
pub struct SecretBootstrap {
    client: Client,
}

impl SecretBootstrap {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BootstrapDataSource for SecretBootstrap {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn get(&self, namespace: &str, secret_name: &str) -> Result<String> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = timeout(API_TIMEOUT, api.get(secret_name))
            .await
            .context("timeout while fetching bootstrap secret")?
            .with_context(|| format!("error fetching bootstrap secret {}/{}", namespace, secret_name))?;
        encode_payload(&secret).with_context(|| format!("invalid bootstrap secret {}/{}", namespace, secret_name))
    }
}

/// Base64 encode the payload of the given secret.
pub(crate) fn encode_payload(secret: &Secret) -> Result<String> {
    let payload = secret
        .data
        .as_ref()
        .and_then(|data| data.get(BOOTSTRAP_SECRET_KEY))
        .with_context(|| format!("secret has no {:?} key", BOOTSTRAP_SECRET_KEY))?;
    Ok(base64::encode(&payload.0))
}
