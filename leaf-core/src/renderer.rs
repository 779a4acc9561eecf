//! Lazy page rasterization over the page table.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

use crate::cancel::CancellationToken;
use crate::corpus::TextCorpus;
use crate::document::{DocumentBackend, PageMetrics, Raster};
use crate::error::PageRenderError;
use crate::page::{PageRecord, PageState, PageTable};
use crate::progress::ReadingProgressStore;
use crate::PageNumber;

pub const BASE_SCALE: f32 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    Rendered,
    /// The page was already loading or loaded, or the renderer was cancelled.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderEvent {
    PageLoaded(PageNumber),
    PageFailed(PageNumber),
}

/// Pages `center - radius ..= center + radius`, clamped to the document.
pub fn window(center: PageNumber, radius: usize, total: usize) -> Vec<PageNumber> {
    let lo = center.saturating_sub(radius).max(1);
    let hi = center.saturating_add(radius).min(total);
    (lo..=hi).collect()
}

#[derive(Clone)]
pub struct PageRenderer {
    backend: Arc<dyn DocumentBackend>,
    table: Arc<Mutex<PageTable>>,
    progress: Option<Arc<ReadingProgressStore>>,
    base_scale: f32,
    token: CancellationToken,
    events: Arc<Mutex<Vec<RenderEvent>>>,
}

impl PageRenderer {
    pub fn new(backend: Arc<dyn DocumentBackend>, base_scale: f32) -> Self {
        let table = PageTable::new(backend.info().page_count);
        Self {
            backend,
            table: Arc::new(Mutex::new(table)),
            progress: None,
            base_scale,
            token: CancellationToken::new(),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Forwards the first page's raster to `store` as the cover preview.
    pub fn with_progress(mut self, store: Arc<ReadingProgressStore>) -> Self {
        self.progress = Some(store);
        self
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn page_count(&self) -> usize {
        self.table.lock().len()
    }

    pub fn state(&self, page: PageNumber) -> Option<PageState> {
        self.table.lock().state(page)
    }

    pub fn record(&self, page: PageNumber) -> Option<PageRecord> {
        self.table.lock().get(page).cloned()
    }

    pub fn metrics(&self) -> Vec<Option<PageMetrics>> {
        self.table.lock().iter().map(|r| r.metrics).collect()
    }

    pub fn count_in(&self, state: PageState) -> usize {
        self.table.lock().count_in(state)
    }

    pub fn events(&self) -> Arc<Mutex<Vec<RenderEvent>>> {
        Arc::clone(&self.events)
    }

    pub fn attach_corpus(&self, corpus: &TextCorpus) {
        let mut table = self.table.lock();
        if self.token.is_cancelled() {
            return;
        }
        for (page, text) in corpus.iter() {
            table.set_text(page, text.to_owned());
        }
    }

    /// Cancels the renderer and waits out any table update already in
    /// progress. Once this returns the page table no longer changes.
    pub fn stop(&self) {
        self.token.cancel();
        drop(self.table.lock());
    }

    /// Rasterizes `page` unless it is already loading or loaded. A failure
    /// returns the page to `NotRequested`. After [`stop`](Self::stop) the
    /// table is left as it was.
    #[instrument(skip(self))]
    pub async fn request_page(&self, page: PageNumber) -> Result<RenderOutcome, PageRenderError> {
        {
            let mut table = self.table.lock();
            if self.token.is_cancelled() || !table.begin_loading(page) {
                return Ok(RenderOutcome::Skipped);
            }
        }
        let mut pending = PendingLoad {
            renderer: self,
            page,
            armed: true,
        };

        let backend = Arc::clone(&self.backend);
        let scale = self.base_scale;
        let rendered = tokio::task::spawn_blocking(move || -> anyhow::Result<(Raster, PageMetrics)> {
            let accessor = backend.page(page)?;
            let metrics = accessor.metrics().scaled(scale);
            let image = accessor.rasterize(scale)?;
            Ok((Raster::encode(&image)?, metrics))
        })
        .await;
        pending.armed = false;

        let rendered = match rendered {
            Ok(Ok(rendered)) => Ok(rendered),
            Ok(Err(err)) => Err(format!("{err:#}")),
            Err(err) => Err(err.to_string()),
        };

        let finished = {
            let mut table = self.table.lock();
            if self.token.is_cancelled() {
                return Ok(RenderOutcome::Skipped);
            }
            match rendered {
                Ok((raster, metrics)) => {
                    let png = raster.png.clone();
                    table.finish_loading(page, Some(raster), Some(metrics));
                    self.events.lock().push(RenderEvent::PageLoaded(page));
                    Ok((png, metrics))
                }
                Err(message) => {
                    table.revert(page);
                    self.events.lock().push(RenderEvent::PageFailed(page));
                    Err(PageRenderError { page, message })
                }
            }
        };
        let (png, metrics) = match finished {
            Ok(finished) => finished,
            Err(err) => {
                warn!(error = %err, "page render failed");
                return Err(err);
            }
        };
        debug!(width = metrics.width, height = metrics.height, "page rendered");

        if page == 1 && !self.token.is_cancelled() {
            if let Some(progress) = &self.progress {
                if let Err(err) = progress.update_preview(png).await {
                    warn!(error = %err, "failed to store cover preview");
                }
            }
        }
        Ok(RenderOutcome::Rendered)
    }

    /// Requests several pages concurrently. Results come back in page order.
    pub async fn request_many(
        &self,
        pages: impl IntoIterator<Item = PageNumber>,
    ) -> Vec<(PageNumber, Result<RenderOutcome, PageRenderError>)> {
        let mut tasks = JoinSet::new();
        for page in pages {
            let renderer = self.clone();
            tasks.spawn(async move { (page, renderer.request_page(page).await) });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(err) => debug!(error = %err, "render task did not complete"),
            }
        }
        results.sort_by_key(|(page, _)| *page);
        results
    }

    pub async fn request_window(
        &self,
        center: PageNumber,
        radius: usize,
    ) -> Vec<(PageNumber, Result<RenderOutcome, PageRenderError>)> {
        let pages = window(center, radius, self.page_count());
        self.request_many(pages).await
    }
}

/// Returns an abandoned request to `NotRequested` so it stays retryable.
struct PendingLoad<'a> {
    renderer: &'a PageRenderer,
    page: PageNumber,
    armed: bool,
}

impl Drop for PendingLoad<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut table = self.renderer.table.lock();
        if !self.renderer.token.is_cancelled() {
            table.revert(self.page);
        }
    }
}
