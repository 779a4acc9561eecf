//! A headless viewer session wiring loader, renderer, prefetcher, visibility
//! and search together for one open document.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancellationToken;
use crate::config::{LeafConfig, SearchConfig, ViewerConfig};
use crate::corpus::{extract_corpus, TextCorpus};
use crate::error::DocumentLoadError;
use crate::loader::{DocumentHandle, DocumentLoader};
use crate::locator::SourceLocator;
use crate::page::PageRecord;
use crate::prefetch::{PrefetchPlan, Prefetcher};
use crate::progress::ReadingProgressStore;
use crate::renderer::PageRenderer;
use crate::search::SearchController;
use crate::visibility::{ObserverOptions, PageLayout, VisibilityObserver};
use crate::PageNumber;

pub const DEFAULT_VIEWPORT_HEIGHT: f32 = 900.0;
pub const RESET_ZOOM: f32 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ViewerCommand {
    NextPage,
    PrevPage,
    FirstPage,
    LastPage,
    GotoPage { page: PageNumber },
    ZoomIn,
    ZoomOut,
    ResetZoom,
    Scroll { top: f32 },
    ResizeViewport { height: f32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ViewerEvent {
    CurrentPageChanged(PageNumber),
    ScrolledTo { page: PageNumber, top: f32 },
    ZoomChanged(f32),
    CorpusReady,
}

#[derive(Debug, Clone, Copy)]
struct ViewState {
    current_page: PageNumber,
    zoom: f32,
    scroll_top: f32,
    viewport_height: f32,
}

struct ViewerInner {
    handle: DocumentHandle,
    renderer: PageRenderer,
    observer: VisibilityObserver,
    layout: PageLayout,
    progress: Arc<ReadingProgressStore>,
    config: ViewerConfig,
    token: CancellationToken,
    state: Mutex<ViewState>,
    events: Arc<Mutex<Vec<ViewerEvent>>>,
    /// Window renders started by visibility changes.
    renders: Mutex<Vec<JoinHandle<()>>>,
}

impl ViewerInner {
    fn push(&self, event: ViewerEvent) {
        self.events.lock().push(event);
    }

    /// Re-registers every anchor from current page metrics and zoom.
    fn relayout(&self) -> Vec<(PageNumber, f32, f32)> {
        let zoom = self.state.lock().zoom;
        let anchors = self.layout.anchors(&self.renderer.metrics(), zoom);
        self.observer.set_layout(&anchors);
        anchors
    }

    fn scroll_to(&self, top: f32) {
        if self.token.is_cancelled() {
            return;
        }
        self.relayout();
        let height = {
            let mut state = self.state.lock();
            state.scroll_top = top.max(0.0);
            state.viewport_height
        };
        self.observer.update_viewport(top.max(0.0), height);
    }

    fn scroll_to_page(&self, page: PageNumber) {
        if self.token.is_cancelled() {
            return;
        }
        let anchors = self.relayout();
        let Some(&(_, top, _)) = page.checked_sub(1).and_then(|idx| anchors.get(idx)) else {
            return;
        };
        self.push(ViewerEvent::ScrolledTo { page, top });
        self.scroll_to(top);
    }

    /// A page anchor became visible: it is the current page, and it and its
    /// neighbours are requested.
    fn page_became_visible(&self, page: PageNumber) {
        if self.token.is_cancelled() {
            return;
        }
        let changed = {
            let mut state = self.state.lock();
            let changed = state.current_page != page;
            state.current_page = page;
            changed
        };
        if changed {
            self.push(ViewerEvent::CurrentPageChanged(page));
        }
        if let Err(err) = self.progress.update_current_page(page) {
            warn!(error = %err, page, "failed to record reading position");
        }

        let renderer = self.renderer.clone();
        let radius = self.config.visible_radius;
        let pending = tokio::spawn(async move {
            renderer.request_window(page, radius).await;
        });
        let mut renders = self.renders.lock();
        renders.retain(|task| !task.is_finished());
        renders.push(pending);
    }
}

pub struct ViewerSession {
    inner: Arc<ViewerInner>,
    corpus: watch::Receiver<Option<Arc<TextCorpus>>>,
    search_config: SearchConfig,
    search: OnceCell<SearchController>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ViewerSession {
    /// Loads `locator` and starts a session on it.
    #[instrument(skip(loader, progress, config), fields(locator = %locator))]
    pub async fn open(
        loader: &DocumentLoader,
        locator: SourceLocator,
        start_page: PageNumber,
        progress: Arc<ReadingProgressStore>,
        config: &LeafConfig,
    ) -> Result<Self, DocumentLoadError> {
        let handle = loader.load(&locator).await?;
        Ok(Self::start(handle, start_page, progress, config))
    }

    /// Starts text extraction, the visibility consumer and the prefetcher for
    /// an already opened document, then scrolls to `start_page`.
    pub fn start(
        handle: DocumentHandle,
        start_page: PageNumber,
        progress: Arc<ReadingProgressStore>,
        config: &LeafConfig,
    ) -> Self {
        let total = handle.page_count();
        let start_page = start_page.clamp(1, total.max(1));
        let identity = handle.locator.identity();
        if let Err(err) = progress.start_session(&identity, &handle.title, total) {
            warn!(error = %err, "failed to persist new reading session");
        }

        let token = CancellationToken::new();
        let renderer = PageRenderer::new(handle.backend(), config.viewer.base_scale)
            .with_progress(Arc::clone(&progress))
            .with_token(token.clone());
        let observer = VisibilityObserver::new(ObserverOptions {
            threshold: config.viewer.intersection_threshold,
            root_margin: config.viewer.root_margin,
        });

        let inner = Arc::new(ViewerInner {
            handle,
            renderer: renderer.clone(),
            observer: observer.clone(),
            layout: PageLayout::default(),
            progress,
            config: config.viewer.clone(),
            token: token.clone(),
            state: Mutex::new(ViewState {
                current_page: start_page,
                zoom: config.viewer.default_zoom,
                scroll_top: 0.0,
                viewport_height: DEFAULT_VIEWPORT_HEIGHT,
            }),
            events: Arc::new(Mutex::new(Vec::new())),
            renders: Mutex::new(Vec::new()),
        });

        let (corpus_tx, corpus_rx) = watch::channel(None);
        let extraction = {
            let inner = Arc::clone(&inner);
            let backend = inner.handle.backend();
            tokio::spawn(async move {
                let corpus = Arc::new(extract_corpus(backend).await);
                if inner.token.is_cancelled() {
                    return;
                }
                inner.renderer.attach_corpus(&corpus);
                let _ = corpus_tx.send(Some(corpus));
                inner.push(ViewerEvent::CorpusReady);
            })
        };

        let mut subscription = observer.subscribe();
        let consumer = {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                while let Some(event) = subscription.recv().await {
                    if inner.token.is_cancelled() {
                        break;
                    }
                    inner.page_became_visible(event.page);
                }
                debug!("visibility consumer stopped");
            })
        };

        let prefetch =
            Prefetcher::new(renderer, PrefetchPlan::from(&config.viewer), token).spawn(start_page);

        inner.scroll_to_page(start_page);
        info!(identity = %identity, total, start_page, "viewer session started");

        Self {
            inner,
            corpus: corpus_rx,
            search_config: config.search.clone(),
            search: OnceCell::new(),
            tasks: Mutex::new(vec![extraction, consumer, prefetch]),
            closed: AtomicBool::new(false),
        }
    }

    pub fn title(&self) -> &str {
        &self.inner.handle.title
    }

    pub fn locator(&self) -> &SourceLocator {
        &self.inner.handle.locator
    }

    pub fn page_count(&self) -> usize {
        self.inner.handle.page_count()
    }

    pub fn current_page(&self) -> PageNumber {
        self.inner.state.lock().current_page
    }

    pub fn zoom(&self) -> f32 {
        self.inner.state.lock().zoom
    }

    pub fn scroll_top(&self) -> f32 {
        self.inner.state.lock().scroll_top
    }

    pub fn page(&self, page: PageNumber) -> Option<PageRecord> {
        self.inner.renderer.record(page)
    }

    pub fn renderer(&self) -> &PageRenderer {
        &self.inner.renderer
    }

    pub fn drain_events(&self) -> Vec<ViewerEvent> {
        std::mem::take(&mut *self.inner.events.lock())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once every page's text is extracted, or `None` if the session
    /// closed first.
    pub async fn wait_for_corpus(&self) -> Option<Arc<TextCorpus>> {
        let mut corpus = self.corpus.clone();
        loop {
            let current = corpus.borrow_and_update().clone();
            if current.is_some() {
                return current;
            }
            if corpus.changed().await.is_err() {
                return None;
            }
        }
    }

    /// The document's search controller, created once the corpus is ready.
    /// Result navigation scrolls the viewer.
    pub async fn search(&self) -> Option<&SearchController> {
        let corpus = self.wait_for_corpus().await?;
        let controller = self
            .search
            .get_or_init(|| async {
                let controller = SearchController::new(corpus, self.search_config.clone());
                if let Some(mut navigation) = controller.take_navigation() {
                    let inner = Arc::clone(&self.inner);
                    let follower = tokio::spawn(async move {
                        while let Some(nav) = navigation.recv().await {
                            inner.scroll_to_page(nav.page);
                        }
                    });
                    self.tasks.lock().push(follower);
                }
                controller
            })
            .await;
        Some(controller)
    }

    pub fn apply(&self, command: ViewerCommand) -> Result<()> {
        if self.is_closed() {
            bail!("viewer session is closed");
        }
        let total = self.page_count();
        let (current, zoom) = {
            let state = self.inner.state.lock();
            (state.current_page, state.zoom)
        };
        let config = &self.inner.config;

        match command {
            ViewerCommand::NextPage => self.goto(current.saturating_add(1).min(total)),
            ViewerCommand::PrevPage => self.goto(current.saturating_sub(1).max(1)),
            ViewerCommand::FirstPage => self.goto(1),
            ViewerCommand::LastPage => self.goto(total),
            ViewerCommand::GotoPage { page } => self.goto(page.clamp(1, total.max(1))),
            ViewerCommand::ZoomIn => self.set_zoom((zoom + config.zoom_step).min(config.max_zoom)),
            ViewerCommand::ZoomOut => self.set_zoom((zoom - config.zoom_step).max(config.min_zoom)),
            ViewerCommand::ResetZoom => self.set_zoom(RESET_ZOOM),
            ViewerCommand::Scroll { top } => self.inner.scroll_to(top),
            ViewerCommand::ResizeViewport { height } => {
                let top = {
                    let mut state = self.inner.state.lock();
                    state.viewport_height = height.max(1.0);
                    state.scroll_top
                };
                self.inner.scroll_to(top);
            }
        }
        Ok(())
    }

    fn goto(&self, page: PageNumber) {
        if page >= 1 {
            self.inner.scroll_to_page(page);
        }
    }

    /// Zoom only rescales the layout; rasters are never redrawn for it.
    fn set_zoom(&self, zoom: f32) {
        let zoom = (zoom * 100.0).round() / 100.0;
        let current = {
            let mut state = self.inner.state.lock();
            if (state.zoom - zoom).abs() <= f32::EPSILON {
                return;
            }
            state.zoom = zoom;
            state.current_page
        };
        self.inner.push(ViewerEvent::ZoomChanged(zoom));
        self.inner.scroll_to_page(current);
    }

    /// Tears down background work and commits reading time. After this returns
    /// no task touches the session.
    pub async fn close(self) {
        self.teardown();
        let mut tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        tasks.append(&mut *self.inner.renders.lock());
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
    }

    fn teardown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.renderer.stop();
        self.inner.observer.disconnect();
        if let Some(search) = self.search.get() {
            search.clear();
        }
        for task in self.tasks.lock().iter().chain(self.inner.renders.lock().iter()) {
            task.abort();
        }
        if let Err(err) = self.inner.progress.end_session() {
            warn!(error = %err, "failed to commit reading time");
        }
        info!(identity = %self.inner.handle.locator.identity(), "viewer session closed");
    }
}

impl Drop for ViewerSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProgressConfig;
    use crate::corpus::tests::FakeBackend;
    use crate::page::PageState;
    use crate::storage::MemoryStateStore;
    use std::time::Duration;
    use url::Url;

    fn progress() -> Arc<ReadingProgressStore> {
        Arc::new(ReadingProgressStore::new(
            Arc::new(MemoryStateStore::new()),
            ProgressConfig::default(),
        ))
    }

    fn handle(backend: FakeBackend) -> DocumentHandle {
        let locator = SourceLocator::Remote(Url::parse("https://example.com/book.pdf").unwrap());
        DocumentHandle::new(locator, "Book".into(), Arc::new(backend))
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..2000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn opening_starts_a_session_on_the_first_page() {
        let progress = progress();
        let viewer = ViewerSession::start(handle(FakeBackend::blank(12)), 1, progress.clone(), &LeafConfig::default());

        wait_until(|| viewer.page(1).map(|r| r.state) == Some(PageState::Loaded)).await;
        wait_until(|| {
            progress
                .current_session()
                .is_some_and(|s| s.pages_read.contains(&1))
        })
        .await;
        let session = progress.current_session().unwrap();
        assert_eq!(session.url, "https://example.com/book.pdf");
        assert_eq!(session.total_pages, 12);
        assert!(session.pages_read.contains(&1));
        assert_eq!(viewer.current_page(), 1);
        viewer.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn navigation_updates_current_page_and_loads_neighbours() {
        let progress = progress();
        let viewer = ViewerSession::start(handle(FakeBackend::blank(30)), 1, progress.clone(), &LeafConfig::default());

        viewer.apply(ViewerCommand::GotoPage { page: 20 }).unwrap();
        wait_until(|| viewer.current_page() == 20).await;
        wait_until(|| (17..=23).all(|p| viewer.page(p).unwrap().state == PageState::Loaded)).await;

        let session = progress.current_session().unwrap();
        assert_eq!(session.current_page, 20);
        assert!(session.pages_read.contains(&20));
        assert!(viewer
            .drain_events()
            .contains(&ViewerEvent::CurrentPageChanged(20)));

        viewer.apply(ViewerCommand::NextPage).unwrap();
        wait_until(|| viewer.current_page() == 21).await;
        viewer.apply(ViewerCommand::GotoPage { page: 99 }).unwrap();
        wait_until(|| viewer.current_page() == 30).await;
        viewer.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_page_seeds_the_initial_position() {
        let viewer = ViewerSession::start(handle(FakeBackend::blank(40)), 25, progress(), &LeafConfig::default());
        wait_until(|| viewer.page(25).map(|r| r.state) == Some(PageState::Loaded)).await;
        assert_eq!(viewer.current_page(), 25);
        viewer.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn zoom_is_clamped_and_never_rerenders() {
        let backend = Arc::new(FakeBackend::blank(3));
        let locator = SourceLocator::Remote(Url::parse("https://example.com/z.pdf").unwrap());
        let handle = DocumentHandle::new(locator, "Z".into(), backend.clone());
        let viewer = ViewerSession::start(handle, 1, progress(), &LeafConfig::default());
        wait_until(|| viewer.renderer().count_in(PageState::Loaded) == 3).await;

        viewer.apply(ViewerCommand::ZoomIn).unwrap();
        assert_eq!(viewer.zoom(), 1.8);
        for _ in 0..20 {
            viewer.apply(ViewerCommand::ZoomIn).unwrap();
        }
        assert_eq!(viewer.zoom(), 3.0);
        for _ in 0..20 {
            viewer.apply(ViewerCommand::ZoomOut).unwrap();
        }
        assert_eq!(viewer.zoom(), 0.5);
        viewer.apply(ViewerCommand::ResetZoom).unwrap();
        assert_eq!(viewer.zoom(), 1.0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        for page in 1..=3 {
            assert_eq!(backend.renders_of(page), 1);
        }
        viewer.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn search_results_drive_navigation() {
        let mut texts = vec!["filler"; 15];
        texts[11] = "the hidden needle is here";
        let viewer = ViewerSession::start(
            handle(FakeBackend::with_texts(&texts)),
            1,
            progress(),
            &LeafConfig::default(),
        );

        let search = viewer.search().await.unwrap();
        let results = search.search_now("NEEDLE").await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].page_number, 12);

        wait_until(|| viewer.current_page() == 12).await;
        assert!(viewer.drain_events().contains(&ViewerEvent::CorpusReady));
        assert_eq!(viewer.page(12).unwrap().text, "the hidden needle is here");
        viewer.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn closing_commits_time_and_stops_background_work() {
        let progress = progress();
        let backend = Arc::new(FakeBackend::blank(50));
        let locator = SourceLocator::Remote(Url::parse("https://example.com/long.pdf").unwrap());
        let handle = DocumentHandle::new(locator, "Long".into(), backend.clone());
        let viewer = ViewerSession::start(handle, 1, progress.clone(), &LeafConfig::default());
        let renderer = viewer.renderer().clone();

        tokio::time::sleep(Duration::from_millis(500)).await;
        viewer.close().await;
        assert!(progress.current_session().is_none());
        assert!(progress.get_session("https://example.com/long.pdf").is_some());

        tokio::time::sleep(Duration::from_secs(1)).await;
        let rendered: usize = (1..=50).map(|p| backend.renders_of(p)).sum();
        tokio::time::sleep(Duration::from_secs(30)).await;
        let after: usize = (1..=50).map(|p| backend.renders_of(p)).sum();
        assert_eq!(rendered, after);
        assert_eq!(renderer.state(50), Some(PageState::NotRequested));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn page_table_is_frozen_once_close_returns() {
        let backend = FakeBackend::blank(60);
        let viewer = ViewerSession::start(handle(backend), 1, progress(), &LeafConfig::default());
        let renderer = viewer.renderer().clone();

        viewer.apply(ViewerCommand::GotoPage { page: 40 }).unwrap();
        wait_until(|| renderer.state(40) != Some(PageState::NotRequested)).await;
        viewer.close().await;

        let snapshot: Vec<_> = (1..=60).map(|page| renderer.state(page)).collect();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let after: Vec<_> = (1..=60).map(|page| renderer.state(page)).collect();
        assert_eq!(snapshot, after);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_viewer_rejects_commands() {
        let viewer = ViewerSession::start(handle(FakeBackend::blank(2)), 1, progress(), &LeafConfig::default());
        viewer.teardown();
        assert!(viewer.apply(ViewerCommand::NextPage).is_err());
        assert!(viewer.is_closed());
    }
}
