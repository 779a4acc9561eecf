use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

use crate::document::DocumentBackend;
use crate::error::ExtractionError;
use crate::text_format::{formatted_text, plain_text};
use crate::PageNumber;

/// Extracted text for every page of one document. Built once per load and
/// never mutated afterwards.
#[derive(Debug, Clone, Default)]
pub struct TextCorpus {
    pages: Vec<String>,
    formatted: Vec<String>,
}

impl TextCorpus {
    pub fn from_pages(pages: Vec<String>) -> Self {
        let formatted = pages.clone();
        Self { pages, formatted }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Plain text of a page, or an empty string for unknown pages.
    pub fn page_text(&self, page: PageNumber) -> &str {
        page.checked_sub(1)
            .and_then(|idx| self.pages.get(idx))
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Paragraph-formatted text for reader display.
    pub fn formatted_text(&self, page: PageNumber) -> &str {
        page.checked_sub(1)
            .and_then(|idx| self.formatted.get(idx))
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn iter(&self) -> impl Iterator<Item = (PageNumber, &str)> {
        self.pages
            .iter()
            .enumerate()
            .map(|(idx, text)| (idx + 1, text.as_str()))
    }
}

struct ExtractedPage {
    plain: String,
    formatted: String,
}

fn extract_page(
    backend: &dyn DocumentBackend,
    page: PageNumber,
) -> Result<ExtractedPage, ExtractionError> {
    let runs = backend
        .page(page)
        .and_then(|accessor| accessor.text_runs())
        .map_err(|err| ExtractionError {
            page,
            message: format!("{err:#}"),
        })?;
    Ok(ExtractedPage {
        plain: plain_text(&runs),
        formatted: formatted_text(&runs),
    })
}

/// Extracts every page concurrently and joins them all. A page that fails
/// contributes empty text.
#[instrument(skip(backend))]
pub async fn extract_corpus(backend: Arc<dyn DocumentBackend>) -> TextCorpus {
    let page_count = backend.info().page_count;
    let mut pages = vec![String::new(); page_count];
    let mut formatted = vec![String::new(); page_count];

    let mut tasks = JoinSet::new();
    for page in 1..=page_count {
        let backend = Arc::clone(&backend);
        tasks.spawn_blocking(move || (page, extract_page(backend.as_ref(), page)));
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((page, Ok(extracted))) => {
                pages[page - 1] = extracted.plain;
                formatted[page - 1] = extracted.formatted;
            }
            Ok((_, Err(err))) => warn!(error = %err, "text extraction failed"),
            Err(err) => warn!(error = %err, "text extraction task aborted"),
        }
    }

    debug!(page_count, "text corpus ready");
    TextCorpus { pages, formatted }
}
