use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use tracing::{debug, info, instrument};
use url::Url;

use crate::document::{looks_like_pdf, DocumentBackend, DocumentInfo, DocumentOpener, PageAccessor};
use crate::error::{DocumentLoadError, FetchError, LoadErrorKind};
use crate::locator::{SourceLocator, UPLOAD_ROUTE};
use crate::PageNumber;

pub const UNTITLED: &str = "Untitled PDF";

#[async_trait::async_trait]
pub trait ByteFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<Bytes, FetchError>;
}

/// An opened document. Dropping the handle releases the backend.
pub struct DocumentHandle {
    pub locator: SourceLocator,
    pub info: DocumentInfo,
    pub title: String,
    backend: Arc<dyn DocumentBackend>,
}

impl DocumentHandle {
    pub fn new(
        locator: SourceLocator,
        title: String,
        backend: Arc<dyn DocumentBackend>,
    ) -> Self {
        Self {
            locator,
            info: backend.info().clone(),
            title,
            backend,
        }
    }

    pub fn page_count(&self) -> usize {
        self.info.page_count
    }

    pub fn page(&self, number: PageNumber) -> Result<Arc<dyn PageAccessor>> {
        self.backend.page(number)
    }

    pub fn backend(&self) -> Arc<dyn DocumentBackend> {
        Arc::clone(&self.backend)
    }
}

pub struct DocumentLoader {
    direct: Arc<dyn ByteFetcher>,
    proxy: Option<Arc<dyn ByteFetcher>>,
    upload_base: Option<Url>,
    opener: Arc<dyn DocumentOpener>,
}

impl DocumentLoader {
    pub fn new(direct: Arc<dyn ByteFetcher>, opener: Arc<dyn DocumentOpener>) -> Self {
        Self {
            direct,
            proxy: None,
            upload_base: None,
            opener,
        }
    }

    pub fn with_proxy(mut self, proxy: Arc<dyn ByteFetcher>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Origin serving `/api/pdf-upload/<id>` for uploaded documents.
    pub fn with_upload_base(mut self, base: Url) -> Self {
        self.upload_base = Some(base);
        self
    }

    #[instrument(skip(self), fields(locator = %locator))]
    pub async fn load(&self, locator: &SourceLocator) -> Result<DocumentHandle, DocumentLoadError> {
        let bytes = self.fetch_bytes(locator).await?;
        let backend = self
            .opener
            .open(bytes)
            .await
            .map_err(|err| DocumentLoadError::new(LoadErrorKind::Malformed, format!("{err:#}")))?;

        let title = resolve_title(backend.info(), locator);
        let handle = DocumentHandle::new(locator.clone(), title, backend);
        info!(pages = handle.page_count(), title = %handle.title, "document loaded");
        Ok(handle)
    }

    async fn fetch_bytes(&self, locator: &SourceLocator) -> Result<Bytes, DocumentLoadError> {
        match locator {
            SourceLocator::Uploaded(id) => {
                let url = self.upload_url(id)?;
                fetch_pdf(self.direct.as_ref(), &url)
                    .await
                    .map_err(|err| classify(&err, None))
            }
            SourceLocator::Remote(url) => {
                let direct_err = match fetch_pdf(self.direct.as_ref(), url).await {
                    Ok(bytes) => return Ok(bytes),
                    Err(err) => err,
                };
                let Some(proxy) = &self.proxy else {
                    return Err(classify(&direct_err, None));
                };
                debug!(error = %direct_err, "direct fetch failed, retrying through proxy");
                fetch_pdf(proxy.as_ref(), url)
                    .await
                    .map_err(|proxy_err| classify(&direct_err, Some(&proxy_err)))
            }
        }
    }

    fn upload_url(&self, id: &str) -> Result<Url, DocumentLoadError> {
        let base = self.upload_base.as_ref().ok_or_else(|| {
            DocumentLoadError::new(
                LoadErrorKind::NetworkError,
                "no upload server configured for uploaded documents",
            )
        })?;
        base.join(&format!("{UPLOAD_ROUTE}/{}", urlencoding::encode(id)))
            .map_err(|err| DocumentLoadError::new(LoadErrorKind::NetworkError, err.to_string()))
    }
}

async fn fetch_pdf(fetcher: &dyn ByteFetcher, url: &Url) -> Result<Bytes, FetchError> {
    let bytes = fetcher.fetch(url).await?;
    if looks_like_pdf(&bytes) {
        Ok(bytes)
    } else {
        Err(FetchError::NotPdf(None))
    }
}

/// Maps the direct (and optional proxy) failure onto a user-facing category.
pub fn classify(direct: &FetchError, proxy: Option<&FetchError>) -> DocumentLoadError {
    let errors: Vec<&FetchError> = std::iter::once(direct).chain(proxy).collect();

    let kind = if errors.iter().any(|e| matches!(e, FetchError::Status(404))) {
        LoadErrorKind::NotFound
    } else if errors.iter().any(|e| matches!(e, FetchError::NotPdf(Some(_)))) {
        LoadErrorKind::NotAPdf
    } else if errors.iter().any(|e| matches!(e, FetchError::NotPdf(None))) {
        LoadErrorKind::Malformed
    } else if matches!(direct, FetchError::Cors) {
        LoadErrorKind::CorsBlocked
    } else {
        LoadErrorKind::NetworkError
    };

    let message = match proxy {
        Some(proxy) => format!("direct fetch: {direct}; proxy fetch: {proxy}"),
        None => direct.to_string(),
    };
    DocumentLoadError::new(kind, message)
}

fn resolve_title(info: &DocumentInfo, locator: &SourceLocator) -> String {
    info.metadata
        .title
        .as_deref()
        .map(str::trim)
        .filter(|title| !title.is_empty())
        .map(str::to_owned)
        .or_else(|| locator.fallback_title())
        .unwrap_or_else(|| UNTITLED.to_owned())
}
