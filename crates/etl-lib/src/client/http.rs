//! Generic HTTP/JSON backend client
//!
//! Built from a [`Connector`]: timeouts, proxy, basic credentials and an
//! optional PEM client identity for mutual TLS. Reads return a list of
//! series documents; writes post JSON bodies.

use super::BackendClient;
use crate::connector::{Connector, Secret};
use crate::error::ClientError;
use crate::models::{Cacheable, SeriesDocument};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

/// Result of a read against a report endpoint
#[derive(Debug)]
pub enum FetchOutcome {
    Ready(Vec<SeriesDocument>),
    /// The backend accepted the request but the report is not built yet
    Pending,
}

/// HTTP client for one endpoint
pub struct HttpClient {
    endpoint_id: String,
    base: url::Url,
    client: reqwest::Client,
    username: Option<String>,
    password: Option<Secret>,
}

impl HttpClient {
    /// Build a client applying the connector's network settings
    pub fn from_connector(connector: &Connector) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(connector.connect_timeout())
            .timeout(connector.request_timeout());

        if let Some(proxy) = connector.proxy_url() {
            builder = builder.proxy(
                reqwest::Proxy::all(&proxy).with_context(|| format!("Invalid proxy {proxy}"))?,
            );
        }

        // The keystore is a PEM bundle holding the client certificate and key
        if let Some(path) = &connector.keystore_path {
            let pem = std::fs::read(path)
                .with_context(|| format!("Failed to read keystore from {:?}", path))?;
            let identity = reqwest::Identity::from_pem(&pem)
                .with_context(|| format!("Invalid client identity in {:?}", path))?;
            builder = builder.identity(identity);
        }

        let client = builder
            .build()
            .with_context(|| format!("Failed to build HTTP client for {}", connector.id))?;

        Ok(Self {
            endpoint_id: connector.id.clone(),
            base: connector.endpoint.clone(),
            client,
            username: connector.username.clone(),
            password: connector.password.clone(),
        })
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    /// Resolve a path relative to the endpoint's base URL
    pub fn url(&self, path: &str) -> Result<url::Url, ClientError> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|e| ClientError::Transport(format!("invalid path '{path}': {e}")))
    }

    fn with_credentials(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.username {
            Some(user) => request.basic_auth(user, self.password.as_ref().map(Secret::expose)),
            None => request,
        }
    }

    /// Read series from `path`, treating `202 Accepted` as a pending report
    pub async fn fetch_series(
        &self,
        path: &str,
        query: &BTreeMap<String, String>,
    ) -> Result<FetchOutcome, ClientError> {
        let url = self.url(path)?;
        debug!(endpoint = %self.endpoint_id, url = %url, "Fetching series");

        let response = self
            .with_credentials(self.client.get(url.clone()).query(query))
            .send()
            .await?;

        match response.status() {
            StatusCode::ACCEPTED => Ok(FetchOutcome::Pending),
            status if status.is_success() => {
                let series: Vec<SeriesDocument> = response
                    .json()
                    .await
                    .map_err(|e| ClientError::Decode(e.to_string()))?;
                Ok(FetchOutcome::Ready(series))
            }
            status => Err(status_error(status, &url)),
        }
    }

    /// Post a JSON body to `path`
    pub async fn post_json<B: Serialize + ?Sized + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<(), ClientError> {
        let url = self.url(path)?;
        let response = self
            .with_credentials(self.client.post(url.clone()).json(body))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(status_error(status, &url))
        }
    }
}

fn status_error(status: StatusCode, url: &url::Url) -> ClientError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ClientError::Unauthorized(format!("{} returned {}", url, status.as_u16()))
        }
        _ => ClientError::Status {
            status: status.as_u16(),
            url: url.to_string(),
        },
    }
}

impl Cacheable for HttpClient {
    fn cache_key(&self) -> String {
        self.endpoint_id.clone()
    }
}

#[async_trait]
impl BackendClient for HttpClient {
    async fn authenticate(&self) -> Result<(), ClientError> {
        let response = self
            .with_credentials(self.client.get(self.base.clone()))
            .send()
            .await?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ClientError::Unauthorized(
                format!("credentials rejected by {}", self.endpoint_id),
            )),
            _ => Ok(()),
        }
    }
}
