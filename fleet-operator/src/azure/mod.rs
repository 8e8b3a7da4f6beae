//! A REST adapter for the Azure Resource Manager compute API.
//!
//! Wire types & their conversion to and from the canonical model never leave this module.

pub mod client;
mod convert;
pub mod skus;
mod wire;

use std::time::Duration;

use anyhow::{Context, Result};
use fleet_core::CloudError;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::Config;

/// The API version of the compute resource provider.
pub const API_VERSION: &str = "2021-11-01";
/// The API version of the resource SKUs API.
pub const SKUS_API_VERSION: &str = "2021-07-01";

const HEADER_ASYNC_OPERATION: &str = "azure-asyncoperation";

/// The status of a polled long-running operation.
#[derive(Clone, Debug, PartialEq)]
pub enum PollStatus {
    InProgress,
    Succeeded,
    Failed(String),
}

/// A resource manager client bound to a single subscription.
#[derive(Clone)]
pub struct ArmClient {
    http: reqwest::Client,
    endpoint: String,
    subscription_id: String,
    token: String,
}

impl ArmClient {
    /// Create a new client from the given config.
    pub fn new(config: &Config) -> Result<Self> {
        Self::new_with(
            &config.azure_resource_manager_endpoint,
            &config.azure_subscription_id,
            &config.azure_access_token,
            config.cloud_timeout(),
        )
    }

    pub(crate) fn new_with(endpoint: &str, subscription_id: &str, token: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("error building resource manager http client")?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').into(),
            subscription_id: subscription_id.into(),
            token: token.into(),
        })
    }

    /// The subscription of this client.
    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    /// Build the compute API URL of the given subscription scoped path.
    pub(crate) fn url(&self, path: &str) -> Result<Url, CloudError> {
        self.versioned_url(path, API_VERSION, &[])
    }

    /// Build the URL of the given subscription scoped path, with the given query pairs.
    pub(crate) fn versioned_url(&self, path: &str, api_version: &str, query: &[(&str, &str)]) -> Result<Url, CloudError> {
        let raw = format!("{}/subscriptions/{}{}", self.endpoint, self.subscription_id, path);
        let mut url = Url::parse(&raw).map_err(|err| CloudError::Transport(format!("invalid url {}: {}", raw, err)))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("api-version", api_version);
            for (key, val) in query {
                pairs.append_pair(key, val);
            }
        }
        Ok(url)
    }

    /// GET the given URL and decode its JSON body.
    pub(crate) async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, CloudError> {
        let res = self.send(Method::GET, url, None::<&()>).await?;
        let res = ensure_success(res).await?;
        res.json::<T>()
            .await
            .map_err(|err| CloudError::Transport(format!("invalid response body: {}", err)))
    }

    /// GET all pages of the given list URL.
    pub(crate) async fn get_pages<T: DeserializeOwned>(&self, url: Url) -> Result<Vec<T>, CloudError> {
        let mut items = Vec::new();
        let mut next = Some(url);
        while let Some(url) = next.take() {
            let page: wire::Page<T> = self.get_json(url).await?;
            items.extend(page.value);
            if let Some(link) = page.next_link.filter(|link| !link.is_empty()) {
                next = Some(Url::parse(&link).map_err(|err| CloudError::Transport(format!("invalid next link {}: {}", link, err)))?);
            }
        }
        Ok(items)
    }

    /// Begin a long-running mutation, returning the URL by which its completion is polled.
    ///
    /// The async operation header is preferred over the location header. A mutation which
    /// reports neither is polled through the resource itself.
    pub(crate) async fn begin<B: Serialize>(&self, method: Method, url: Url, body: Option<&B>) -> Result<String, CloudError> {
        let res = self.send(method, url.clone(), body).await?;
        let res = ensure_success(res).await?;
        Ok(polling_url(res.headers()).unwrap_or_else(|| url.to_string()))
    }

    /// Poll the given operation URL.
    pub(crate) async fn poll(&self, url: &str) -> Result<PollStatus, CloudError> {
        let url = Url::parse(url).map_err(|err| CloudError::Transport(format!("invalid polling url {}: {}", url, err)))?;
        let res = self.send(Method::GET, url, None::<&()>).await?;
        let res = ensure_success(res).await?;
        if res.status() == StatusCode::ACCEPTED {
            return Ok(PollStatus::InProgress);
        }
        let bytes = res
            .bytes()
            .await
            .map_err(|err| CloudError::Transport(format!("error reading operation status: {}", err)))?;
        if bytes.is_empty() {
            return Ok(PollStatus::Succeeded);
        }
        let body: wire::OperationStatus =
            serde_json::from_slice(&bytes).map_err(|err| CloudError::Transport(format!("invalid operation status: {}", err)))?;
        Ok(poll_status(&body))
    }

    async fn send<B: Serialize>(&self, method: Method, url: Url, body: Option<&B>) -> Result<reqwest::Response, CloudError> {
        tracing::trace!(%method, %url, "sending resource manager request");
        let mut req = self.http.request(method, url).bearer_auth(&self.token);
        if let Some(body) = body {
            req = req.json(body);
        }
        req.send().await.map_err(|err| CloudError::Transport(err.to_string()))
    }
}

/// Map a non-success response onto its error.
async fn ensure_success(res: reqwest::Response) -> Result<reqwest::Response, CloudError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let url = res.url().to_string();
    let body = res
        .bytes()
        .await
        .map_err(|err| CloudError::Transport(format!("error reading error body: {}", err)))?;
    let detail = serde_json::from_slice::<wire::ErrorResponse>(&body).ok().and_then(|res| res.error);
    let message = detail
        .as_ref()
        .map(|detail| detail.message.clone())
        .unwrap_or_else(|| String::from_utf8_lossy(&body).to_string());
    match status {
        StatusCode::NOT_FOUND => Err(CloudError::NotFound(url)),
        StatusCode::CONFLICT => Err(CloudError::Conflict(message)),
        _ => Err(CloudError::Api {
            status: status.as_u16(),
            code: detail.map(|detail| detail.code).unwrap_or_default(),
            message,
        }),
    }
}

fn polling_url(headers: &HeaderMap) -> Option<String> {
    [HEADER_ASYNC_OPERATION, reqwest::header::LOCATION.as_str()]
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|val| val.to_str().ok())
        .find(|val| !val.is_empty())
        .map(String::from)
}

/// Reduce an operation status body, or a polled resource, to its poll status.
fn poll_status(body: &wire::OperationStatus) -> PollStatus {
    let status = body
        .status
        .as_deref()
        .or_else(|| body.properties.as_ref().and_then(|props| props.provisioning_state.as_deref()));
    match status.map(str::to_ascii_lowercase).as_deref() {
        None | Some("succeeded") => PollStatus::Succeeded,
        Some("failed") | Some("canceled") => {
            let reason = body
                .error
                .as_ref()
                .map(|err| format!("{}: {}", err.code, err.message))
                .unwrap_or_else(|| status.unwrap_or_default().to_string());
            PollStatus::Failed(reason)
        }
        Some(_) => PollStatus::InProgress,
    }
}
