//! Background fill of pages the reader has not reached yet.

use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, instrument};

use crate::cancel::CancellationToken;
use crate::config::ViewerConfig;
use crate::page::PageState;
use crate::renderer::PageRenderer;
use crate::PageNumber;

/// `start ± radius` followed by the first `leading` pages, clamped to the
/// document and deduplicated in order.
pub fn priority_window(
    start: PageNumber,
    total: usize,
    radius: usize,
    leading: usize,
) -> Vec<PageNumber> {
    let around = start.saturating_sub(radius)..=start.saturating_add(radius);
    let mut pages: Vec<PageNumber> = Vec::new();
    for page in around.chain(1..=leading) {
        if page >= 1 && page <= total && !pages.contains(&page) {
            pages.push(page);
        }
    }
    pages
}

/// Every page outside `exclude`, nearest to `start` first. Ties go to the
/// lower page.
pub fn background_order(total: usize, start: PageNumber, exclude: &[PageNumber]) -> Vec<PageNumber> {
    let mut pages: Vec<PageNumber> = (1..=total).filter(|p| !exclude.contains(p)).collect();
    pages.sort_by_key(|page| (page.abs_diff(start), *page));
    pages
}

#[derive(Debug, Clone, Copy)]
pub struct PrefetchPlan {
    pub priority_radius: usize,
    pub leading_pages: usize,
    pub settle_delay: Duration,
    pub stagger: Duration,
}

impl From<&ViewerConfig> for PrefetchPlan {
    fn from(config: &ViewerConfig) -> Self {
        Self {
            priority_radius: config.priority_radius,
            leading_pages: config.leading_pages,
            settle_delay: config.settle_delay,
            stagger: config.prefetch_stagger,
        }
    }
}

pub struct Prefetcher {
    renderer: PageRenderer,
    plan: PrefetchPlan,
    token: CancellationToken,
}

impl Prefetcher {
    pub fn new(renderer: PageRenderer, plan: PrefetchPlan, token: CancellationToken) -> Self {
        Self {
            renderer,
            plan,
            token,
        }
    }

    pub fn spawn(self, start: PageNumber) -> JoinHandle<()> {
        tokio::spawn(self.run(start))
    }

    /// Issues the priority window at once, waits for the settle delay, then
    /// trickles in the rest. Pages already past `NotRequested` are skipped
    /// without consuming a stagger slot. Returns once every issued request has
    /// finished, or promptly after cancellation.
    #[instrument(skip(self))]
    pub async fn run(self, start: PageNumber) {
        let total = self.renderer.page_count();
        let priority = priority_window(
            start,
            total,
            self.plan.priority_radius,
            self.plan.leading_pages,
        );
        debug!(?priority, "requesting priority pages");

        let mut tasks = JoinSet::new();
        for &page in &priority {
            self.issue(&mut tasks, page);
        }

        if !self.pause(self.plan.settle_delay).await {
            tasks.detach_all();
            return;
        }

        let remaining = background_order(total, start, &priority);
        debug!(pages = remaining.len(), "starting background prefetch");
        for page in remaining {
            if self.token.is_cancelled() {
                tasks.detach_all();
                return;
            }
            if self.renderer.state(page) != Some(PageState::NotRequested) {
                continue;
            }
            self.issue(&mut tasks, page);
            if !self.pause(self.plan.stagger).await {
                tasks.detach_all();
                return;
            }
        }

        while tasks.join_next().await.is_some() {}
        debug!("background prefetch finished");
    }

    fn issue(&self, tasks: &mut JoinSet<()>, page: PageNumber) {
        let renderer = self.renderer.clone();
        tasks.spawn(async move {
            if let Err(err) = renderer.request_page(page).await {
                debug!(error = %err, "prefetch request failed");
            }
        });
    }

    /// Sleeps for `delay`; `false` when cancelled first.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => !self.token.is_cancelled(),
            _ = self.token.cancelled() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::tests::FakeBackend;
    use crate::renderer::BASE_SCALE;
    use std::sync::Arc;

    fn plan() -> PrefetchPlan {
        PrefetchPlan {
            priority_radius: 5,
            leading_pages: 5,
            settle_delay: Duration::from_millis(2000),
            stagger: Duration::from_millis(100),
        }
    }

    fn renderer(pages: usize, token: &CancellationToken) -> (PageRenderer, Arc<FakeBackend>) {
        let backend = Arc::new(FakeBackend::blank(pages));
        let renderer = PageRenderer::new(backend.clone(), BASE_SCALE).with_token(token.clone());
        (renderer, backend)
    }

    #[test]
    fn priority_window_unions_start_range_with_leading_pages() {
        assert_eq!(
            priority_window(20, 30, 5, 5),
            vec![15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 1, 2, 3, 4, 5]
        );
        assert_eq!(priority_window(2, 30, 5, 5), vec![1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(priority_window(1, 3, 5, 5), vec![1, 2, 3]);
        assert_eq!(priority_window(30, 30, 5, 5), vec![25, 26, 27, 28, 29, 30, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn background_order_is_nearest_first_with_low_page_ties() {
        assert_eq!(
            background_order(10, 5, &[4, 5, 6]),
            vec![3, 7, 2, 8, 1, 9, 10]
        );
        assert!(background_order(3, 1, &[1, 2, 3]).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn prefetch_eventually_loads_every_page() {
        let token = CancellationToken::new();
        let (renderer, backend) = renderer(20, &token);
        Prefetcher::new(renderer.clone(), plan(), token)
            .run(1)
            .await;

        assert_eq!(renderer.count_in(PageState::Loaded), 20);
        for page in 1..=20 {
            assert_eq!(backend.renders_of(page), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pages_loaded_by_scrolling_are_not_requested_again() {
        let token = CancellationToken::new();
        let (renderer, backend) = renderer(15, &token);
        renderer.request_page(12).await.unwrap();

        Prefetcher::new(renderer.clone(), plan(), token)
            .run(1)
            .await;
        assert_eq!(backend.renders_of(12), 1);
        assert_eq!(renderer.count_in(PageState::Loaded), 15);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_settle_stops_background_work() {
        let token = CancellationToken::new();
        let (renderer, backend) = renderer(30, &token);
        let handle = Prefetcher::new(renderer.clone(), plan(), token.clone()).spawn(1);

        tokio::time::sleep(Duration::from_millis(500)).await;
        token.cancel();
        handle.await.unwrap();

        for page in 12..=30 {
            assert_eq!(backend.renders_of(page), 0, "page {page} was prefetched");
            assert_eq!(renderer.state(page), Some(PageState::NotRequested));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_mid_stagger_halts_the_trickle() {
        let token = CancellationToken::new();
        let (renderer, backend) = renderer(40, &token);
        let handle = Prefetcher::new(renderer.clone(), plan(), token.clone()).spawn(1);

        tokio::time::sleep(Duration::from_millis(2250)).await;
        token.cancel();
        handle.await.unwrap();

        assert_eq!(backend.renders_of(40), 0);
        assert_eq!(renderer.state(40), Some(PageState::NotRequested));
    }
}
