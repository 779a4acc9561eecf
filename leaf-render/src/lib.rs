//! Pdfium-backed implementation of the leaf document traits.

use std::convert::TryFrom;
use std::env;
use std::mem;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use leaf_core::{
    DocumentBackend, DocumentInfo, DocumentMetadata, DocumentOpener, PageAccessor, PageMetrics,
    PageNumber, RenderImage, TextRun,
};
use parking_lot::Mutex;
use pdfium_render::prelude::*;
use tracing::{debug, instrument, warn};

pub const LIBRARY_PATH_ENV: &str = "LEAF_PDFIUM_LIBRARY_PATH";

pub struct PdfiumOpener {
    pdfium: Arc<Pdfium>,
}

impl PdfiumOpener {
    pub fn new() -> Result<Self> {
        let pdfium = match bind_pdfium_from_env() {
            Some(pdfium) => pdfium,
            None => bind_pdfium_default()?,
        };
        Ok(Self {
            pdfium: Arc::new(pdfium),
        })
    }
}

#[async_trait]
impl DocumentOpener for PdfiumOpener {
    async fn open(&self, bytes: Bytes) -> Result<Arc<dyn DocumentBackend>> {
        let pdfium = Arc::clone(&self.pdfium);
        let document = tokio::task::spawn_blocking(move || SharedDocument::load(pdfium, bytes))
            .await
            .context("document parser task failed")??;
        Ok(Arc::new(PdfiumDocument::new(document)))
    }
}

/// A parsed document plus the bindings it borrows from.
struct SharedDocument {
    document: Mutex<PdfDocument<'static>>,
    info: DocumentInfo,
    _pdfium: Arc<Pdfium>,
}

impl SharedDocument {
    #[instrument(skip_all, fields(len = bytes.len()))]
    fn load(pdfium: Arc<Pdfium>, bytes: Bytes) -> Result<Self> {
        let document = pdfium
            .load_pdf_from_byte_vec(bytes.to_vec(), None)
            .context("failed to parse PDF bytes")?;
        // SAFETY: the document borrows the bindings owned by `_pdfium`. Both live in this
        // struct and `document` is declared first, so it is dropped before the bindings.
        let document = unsafe { mem::transmute::<PdfDocument<'_>, PdfDocument<'static>>(document) };
        let info = build_document_info(&document);
        debug!(pages = info.page_count, "parsed document");
        Ok(Self {
            document: Mutex::new(document),
            info,
            _pdfium: pdfium,
        })
    }

    fn with_page<R, F>(&self, number: PageNumber, f: F) -> Result<R>
    where
        F: FnOnce(&PdfPage<'_>) -> Result<R>,
    {
        let index = page_index(number)?;
        let document = self.document.lock();
        let page = document
            .pages()
            .get(index)
            .with_context(|| format!("page {number} out of range"))?;
        f(&page)
    }
}

struct PdfiumDocument {
    shared: Arc<SharedDocument>,
}

impl PdfiumDocument {
    fn new(shared: SharedDocument) -> Self {
        Self {
            shared: Arc::new(shared),
        }
    }
}

impl DocumentBackend for PdfiumDocument {
    fn info(&self) -> &DocumentInfo {
        &self.shared.info
    }

    fn page(&self, number: PageNumber) -> Result<Arc<dyn PageAccessor>> {
        let metrics = self.shared.with_page(number, |page| {
            Ok(PageMetrics {
                width: page.width().value,
                height: page.height().value,
            })
        })?;
        Ok(Arc::new(PdfiumPage {
            shared: Arc::clone(&self.shared),
            number,
            metrics,
        }))
    }
}

struct PdfiumPage {
    shared: Arc<SharedDocument>,
    number: PageNumber,
    metrics: PageMetrics,
}

impl PageAccessor for PdfiumPage {
    fn number(&self) -> PageNumber {
        self.number
    }

    fn metrics(&self) -> PageMetrics {
        self.metrics
    }

    fn text_runs(&self) -> Result<Vec<TextRun>> {
        self.shared.with_page(self.number, |page| {
            let text = page
                .text()
                .with_context(|| format!("failed to extract text for page {}", self.number))?;
            let runs = text
                .segments()
                .iter()
                .map(|segment| {
                    let bounds = segment.bounds();
                    TextRun {
                        text: segment.text(),
                        x: bounds.left().value,
                        y: bounds.bottom().value,
                        width: bounds.width().value,
                        font_size: bounds.height().value,
                        font_name: None,
                    }
                })
                .collect();
            Ok(runs)
        })
    }

    #[instrument(skip(self), fields(page = self.number))]
    fn rasterize(&self, scale: f32) -> Result<RenderImage> {
        self.shared.with_page(self.number, |page| {
            let config = PdfRenderConfig::new().scale_page_by_factor(scale.max(0.1));
            let bitmap = page
                .render_with_config(&config)
                .with_context(|| format!("failed to render page {}", self.number))?;
            let image = bitmap.as_image().to_rgba8();
            Ok(RenderImage {
                width: u32::try_from(bitmap.width()).unwrap_or_default(),
                height: u32::try_from(bitmap.height()).unwrap_or_default(),
                pixels: image.into_raw(),
            })
        })
    }
}

fn page_index(number: PageNumber) -> Result<PdfPageIndex> {
    number
        .checked_sub(1)
        .and_then(|idx| PdfPageIndex::try_from(idx).ok())
        .ok_or_else(|| anyhow!("page {number} is out of supported range"))
}

fn build_document_info(document: &PdfDocument<'_>) -> DocumentInfo {
    let page_count = usize::try_from(document.pages().len()).unwrap_or_default();
    let metadata = document.metadata();

    let title = metadata
        .get(PdfDocumentMetadataTagType::Title)
        .map(|t| t.value().trim().to_owned())
        .filter(|t| !t.is_empty());
    let author = metadata
        .get(PdfDocumentMetadataTagType::Author)
        .map(|t| t.value().to_owned());
    let keywords = metadata
        .get(PdfDocumentMetadataTagType::Keywords)
        .map(|t| split_keywords(t.value()))
        .unwrap_or_default();

    DocumentInfo {
        page_count,
        metadata: DocumentMetadata {
            title,
            author,
            keywords,
        },
    }
}

fn split_keywords(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

fn bind_pdfium_from_env() -> Option<Pdfium> {
    match env::var(LIBRARY_PATH_ENV) {
        Ok(path) if !path.is_empty() => match Pdfium::bind_to_library(&path) {
            Ok(bindings) => Some(Pdfium::new(bindings)),
            Err(err) => {
                warn!("failed to load Pdfium from {}: {}", path, err);
                None
            }
        },
        _ => None,
    }
}

fn bind_pdfium_default() -> Result<Pdfium> {
    let mut errors = Vec::new();

    let cwd_path = Pdfium::pdfium_platform_library_name_at_path("./");
    match Pdfium::bind_to_library(&cwd_path) {
        Ok(bindings) => return Ok(Pdfium::new(bindings)),
        Err(err) => errors.push(format!("{}: {}", cwd_path.display(), err)),
    }

    match Pdfium::bind_to_system_library() {
        Ok(bindings) => Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("system: {err}"));
            Err(anyhow!(
                "failed to bind to a pdfium library; set {LIBRARY_PATH_ENV} or install it ({})",
                errors.join(", ")
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_numbers_map_to_zero_based_indices() {
        assert_eq!(page_index(1).unwrap(), 0);
        assert_eq!(page_index(12).unwrap(), 11);
        assert!(page_index(0).is_err());
        assert!(page_index(usize::MAX).is_err());
    }

    #[test]
    fn keywords_are_trimmed_and_blank_entries_dropped() {
        assert_eq!(
            split_keywords(" rust, pdf ,,reader "),
            vec!["rust".to_owned(), "pdf".to_owned(), "reader".to_owned()]
        );
        assert!(split_keywords("").is_empty());
    }
}
