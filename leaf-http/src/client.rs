//! reqwest-backed byte fetchers for the document loader.

use std::io::ErrorKind;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use leaf_core::{ByteFetcher, FetchError};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response};
use tracing::{debug, instrument};
use url::Url;

use crate::proxy::{PROXY_ROUTE, UPSTREAM_CONTENT_TYPE};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (compatible; PDF-Viewer/1.0)";

pub fn build_client(user_agent: &str) -> Result<Client> {
    Client::builder()
        .user_agent(user_agent)
        .build()
        .context("failed to build HTTP client")
}

/// Plain GET for `http(s)` URLs and a filesystem read for `file` URLs.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ByteFetcher for HttpFetcher {
    #[instrument(skip(self), fields(url = %url))]
    async fn fetch(&self, url: &Url) -> Result<Bytes, FetchError> {
        if url.scheme() == "file" {
            return read_file_url(url).await;
        }
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(transport_error)?;
        let response = ensure_success(response)?;
        let bytes = response.bytes().await.map_err(transport_error)?;
        debug!(len = bytes.len(), "fetched document directly");
        Ok(bytes)
    }
}

/// Fetches through a leaf server's `/api/pdf-proxy` endpoint.
#[derive(Clone)]
pub struct ProxyFetcher {
    client: Client,
    base: Url,
}

impl ProxyFetcher {
    pub fn new(client: Client, base: Url) -> Self {
        Self { client, base }
    }

    pub fn proxy_url(&self, target: &Url) -> Result<Url, FetchError> {
        let mut url = self
            .base
            .join(PROXY_ROUTE)
            .map_err(|err| FetchError::Network(err.to_string()))?;
        url.query_pairs_mut().append_pair("url", target.as_str());
        Ok(url)
    }
}

#[async_trait]
impl ByteFetcher for ProxyFetcher {
    #[instrument(skip(self), fields(url = %url))]
    async fn fetch(&self, url: &Url) -> Result<Bytes, FetchError> {
        let proxied = self.proxy_url(url)?;
        let response = self
            .client
            .get(proxied)
            .send()
            .await
            .map_err(transport_error)?;

        if let Some(upstream) = response.headers().get(UPSTREAM_CONTENT_TYPE) {
            let content_type = upstream.to_str().ok().map(str::to_owned);
            return Err(FetchError::NotPdf(content_type));
        }
        let response = ensure_success(response)?;
        let content_type = content_type(&response);
        if !content_type
            .as_deref()
            .is_some_and(|ct| ct.contains("application/pdf"))
        {
            return Err(FetchError::NotPdf(content_type));
        }
        let bytes = response.bytes().await.map_err(transport_error)?;
        debug!(len = bytes.len(), "fetched document through proxy");
        Ok(bytes)
    }
}

fn ensure_success(response: Response) -> Result<Response, FetchError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(FetchError::Status(status.as_u16()))
    }
}

fn content_type(response: &Response) -> Option<String> {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

fn transport_error(err: reqwest::Error) -> FetchError {
    match err.status() {
        Some(status) => FetchError::Status(status.as_u16()),
        None => FetchError::Network(err.to_string()),
    }
}

async fn read_file_url(url: &Url) -> Result<Bytes, FetchError> {
    let path = url
        .to_file_path()
        .map_err(|_| FetchError::Network(format!("unsupported file URL {url}")))?;
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(Bytes::from(bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => Err(FetchError::Status(404)),
        Err(err) => Err(FetchError::Network(format!("{}: {err}", path.display()))),
    }
}
