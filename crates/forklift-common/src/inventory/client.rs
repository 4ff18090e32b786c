//! HTTP client of the inventory service

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use super::{classify, Inventory, InventoryKind, InventoryProvider, Lookup, Resource, Vm};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{Error, Result};

/// Inventory service client.
///
/// Objects live at `{base}/providers/{type}/{uid}/{kind}/{id}`. A 404 on a
/// single object is [`Lookup::NotFound`]; other failures are classified and
/// retried up to three times, each attempt bounded by the call deadline.
#[derive(Clone, Debug)]
pub struct InventoryClient {
    http: reqwest::Client,
    base: Url,
    token: Option<String>,
    timeout: Duration,
    retry: RetryConfig,
}

impl InventoryClient {
    /// Create a client for the service at `base_url`
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url).map_err(|e| {
            Error::internal_with_context("inventory", format!("invalid url {base_url}: {e}"))
        })?;
        if base.cannot_be_a_base() {
            return Err(Error::internal_with_context(
                "inventory",
                format!("url {base_url} cannot be a base"),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                Error::internal_with_context("inventory", format!("http client: {e}"))
            })?;
        Ok(Self {
            http,
            base,
            token: None,
            timeout,
            retry: RetryConfig::inventory(),
        })
    }

    /// Authenticate with a bearer token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Override the retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// URL of a collection, or of one object when `id` is given
    pub fn url(&self, provider: &InventoryProvider, kind: InventoryKind, id: Option<&str>) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend([
                "providers",
                provider.type_.as_str(),
                provider.uid.as_str(),
                kind.path(provider.type_),
            ]);
            if let Some(id) = id {
                segments.push(id);
            }
        }
        url
    }

    async fn fetch_once<T: DeserializeOwned>(
        &self,
        url: &Url,
    ) -> std::result::Result<Option<T>, String> {
        let mut request = self.http.get(url.clone());
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| format!("GET failed. request timeout url: {url}"))?
            .map_err(|e| format!("GET failed. connection error: {e} url: {url}"))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(format!("GET failed. status: {} url: {url}", status.as_u16()));
        }
        response
            .json::<T>()
            .await
            .map(Some)
            .map_err(|e| format!("GET failed. invalid body: {e} url: {url}"))
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        provider: &InventoryProvider,
        kind: InventoryKind,
        url: Url,
    ) -> Result<Option<T>> {
        debug!(provider = %provider, kind = %kind, url = %url, "inventory request");
        retry_with_backoff(
            &self.retry,
            "inventory_get",
            |e: &String| classify(e).retryable,
            || self.fetch_once::<T>(&url),
        )
        .await
        .map_err(|message| {
            let class = classify(&message);
            let message = format!("{}: {message}", class.reason);
            if class.retryable {
                Error::inventory(&provider.name, kind.to_string(), message)
            } else {
                Error::inventory_permanent(&provider.name, kind.to_string(), message)
            }
        })
    }

    async fn fetch_list<T: DeserializeOwned>(
        &self,
        provider: &InventoryProvider,
        kind: InventoryKind,
    ) -> Result<Vec<T>> {
        let url = self.url(provider, kind, None);
        match self.fetch::<Vec<T>>(provider, kind, url.clone()).await? {
            Some(list) => Ok(list),
            // The collection itself is missing: the provider is not loaded yet.
            None => Err(Error::inventory(
                &provider.name,
                kind.to_string(),
                format!("inventory service unavailable: GET failed. status: 404 url: {url}"),
            )),
        }
    }
}

#[async_trait]
impl Inventory for InventoryClient {
    async fn get(
        &self,
        provider: &InventoryProvider,
        kind: InventoryKind,
        id: &str,
    ) -> Result<Lookup<Resource>> {
        let url = self.url(provider, kind, Some(id));
        Ok(match self.fetch(provider, kind, url).await? {
            Some(r) => Lookup::Found(r),
            None => Lookup::NotFound,
        })
    }

    async fn list(
        &self,
        provider: &InventoryProvider,
        kind: InventoryKind,
    ) -> Result<Vec<Resource>> {
        self.fetch_list(provider, kind).await
    }

    async fn get_vm(&self, provider: &InventoryProvider, id: &str) -> Result<Lookup<Vm>> {
        let url = self.url(provider, InventoryKind::Vm, Some(id));
        Ok(match self.fetch(provider, InventoryKind::Vm, url).await? {
            Some(vm) => Lookup::Found(vm),
            None => Lookup::NotFound,
        })
    }

    async fn list_vms(&self, provider: &InventoryProvider) -> Result<Vec<Vm>> {
        self.fetch_list(provider, InventoryKind::Vm).await
    }
}
