//! Viewport observation for page anchors laid out in a vertical scroll.
//!
//! Anchors are registered with their vertical extent. Each viewport update
//! computes how much of every anchor falls inside the root, grown by a margin
//! above and below, and publishes one event per anchor that newly crosses the
//! threshold.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::trace;

use crate::document::PageMetrics;
use crate::PageNumber;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisibilityEvent {
    pub page: PageNumber,
    pub ratio: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct ObserverOptions {
    pub threshold: f32,
    pub root_margin: f32,
}

impl Default for ObserverOptions {
    fn default() -> Self {
        Self {
            threshold: 0.3,
            root_margin: 200.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Anchor {
    top: f32,
    height: f32,
    intersecting: bool,
}

#[derive(Debug, Clone, Copy)]
struct Viewport {
    scroll_top: f32,
    height: f32,
}

#[derive(Default)]
struct ObserverInner {
    anchors: BTreeMap<PageNumber, Anchor>,
    subscribers: Vec<(u64, UnboundedSender<VisibilityEvent>)>,
    next_subscriber: u64,
    viewport: Option<Viewport>,
    disconnected: bool,
}

impl ObserverInner {
    fn publish(&mut self, events: &[VisibilityEvent]) {
        if events.is_empty() {
            return;
        }
        self.subscribers
            .retain(|(_, tx)| events.iter().all(|event| tx.send(*event).is_ok()));
    }
}

/// Fraction of an anchor's height inside the margin-expanded root.
pub fn intersection_ratio(
    top: f32,
    height: f32,
    scroll_top: f32,
    viewport_height: f32,
    root_margin: f32,
) -> f32 {
    if height <= 0.0 {
        return 0.0;
    }
    let root_top = scroll_top - root_margin;
    let root_bottom = scroll_top + viewport_height + root_margin;
    let overlap = (top + height).min(root_bottom) - top.max(root_top);
    (overlap.max(0.0) / height).min(1.0)
}

#[derive(Clone)]
pub struct VisibilityObserver {
    inner: Arc<Mutex<ObserverInner>>,
    options: ObserverOptions,
}

impl VisibilityObserver {
    pub fn new(options: ObserverOptions) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ObserverInner::default())),
            options,
        }
    }

    /// Registers or moves an anchor. A newly placed anchor that already
    /// intersects the last known viewport is reported straight away.
    pub fn observe(&self, page: PageNumber, top: f32, height: f32) {
        let mut inner = self.inner.lock();
        if inner.disconnected {
            return;
        }
        let was_intersecting = inner
            .anchors
            .get(&page)
            .is_some_and(|anchor| anchor.intersecting);
        let mut anchor = Anchor {
            top,
            height,
            intersecting: false,
        };
        let mut events = Vec::new();
        if let Some(viewport) = inner.viewport {
            let ratio = self.ratio_for(&anchor, viewport);
            anchor.intersecting = ratio >= self.options.threshold;
            if anchor.intersecting && !was_intersecting {
                events.push(VisibilityEvent { page, ratio });
            }
        }
        inner.anchors.insert(page, anchor);
        inner.publish(&events);
    }

    /// Moves anchors without reporting anything. Transitions caused by the new
    /// positions surface on the next `update_viewport`.
    pub fn set_layout(&self, anchors: &[(PageNumber, f32, f32)]) {
        let mut inner = self.inner.lock();
        if inner.disconnected {
            return;
        }
        for &(page, top, height) in anchors {
            inner
                .anchors
                .entry(page)
                .and_modify(|anchor| {
                    anchor.top = top;
                    anchor.height = height;
                })
                .or_insert(Anchor {
                    top,
                    height,
                    intersecting: false,
                });
        }
    }

    pub fn subscribe(&self) -> VisibilitySubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let id = inner.next_subscriber;
        inner.next_subscriber += 1;
        if !inner.disconnected {
            inner.subscribers.push((id, tx));
        }
        VisibilitySubscription {
            id,
            receiver: rx,
            observer: Arc::downgrade(&self.inner),
        }
    }

    /// Recomputes intersections for a scroll position and returns the anchors
    /// that became visible, in page order.
    pub fn update_viewport(&self, scroll_top: f32, viewport_height: f32) -> Vec<VisibilityEvent> {
        let mut inner = self.inner.lock();
        if inner.disconnected {
            return Vec::new();
        }
        let viewport = Viewport {
            scroll_top,
            height: viewport_height,
        };
        inner.viewport = Some(viewport);

        let mut events = Vec::new();
        let threshold = self.options.threshold;
        let margin = self.options.root_margin;
        for (page, anchor) in inner.anchors.iter_mut() {
            let ratio = intersection_ratio(
                anchor.top,
                anchor.height,
                viewport.scroll_top,
                viewport.height,
                margin,
            );
            let now_intersecting = ratio >= threshold;
            if now_intersecting && !anchor.intersecting {
                events.push(VisibilityEvent { page: *page, ratio });
            }
            anchor.intersecting = now_intersecting;
        }

        trace!(scroll_top, newly_visible = events.len(), "viewport updated");
        inner.publish(&events);
        events
    }

    /// Drops every anchor and subscriber. Later calls are ignored.
    pub fn disconnect(&self) {
        let mut inner = self.inner.lock();
        inner.disconnected = true;
        inner.anchors.clear();
        inner.subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    fn ratio_for(&self, anchor: &Anchor, viewport: Viewport) -> f32 {
        intersection_ratio(
            anchor.top,
            anchor.height,
            viewport.scroll_top,
            viewport.height,
            self.options.root_margin,
        )
    }
}

/// Stream of visibility events. Dropping it unsubscribes.
pub struct VisibilitySubscription {
    id: u64,
    receiver: UnboundedReceiver<VisibilityEvent>,
    observer: Weak<Mutex<ObserverInner>>,
}

impl VisibilitySubscription {
    /// Next event, or `None` once the observer disconnects.
    pub async fn recv(&mut self) -> Option<VisibilityEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<VisibilityEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for VisibilitySubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.observer.upgrade() {
            inner.lock().subscribers.retain(|(id, _)| *id != self.id);
        }
    }
}

/// Vertical placement of page slots at a given zoom.
#[derive(Debug, Clone, Copy)]
pub struct PageLayout {
    pub display_width: f32,
    pub placeholder_height: f32,
    pub min_slot_height: f32,
    pub slot_gap: f32,
}

impl Default for PageLayout {
    fn default() -> Self {
        Self {
            display_width: 800.0,
            placeholder_height: 1131.0,
            min_slot_height: 1000.0,
            slot_gap: 50.0,
        }
    }
}

impl PageLayout {
    pub fn content_height(&self, metrics: Option<PageMetrics>) -> f32 {
        metrics
            .and_then(|m| m.aspect_ratio())
            .map(|ratio| self.display_width * ratio)
            .unwrap_or(self.placeholder_height)
    }

    pub fn slot_height(&self, metrics: Option<PageMetrics>, zoom: f32) -> f32 {
        self.content_height(metrics).max(self.min_slot_height) * zoom + self.slot_gap * zoom
    }

    /// `(page, top, height)` for every page, stacked from offset zero.
    pub fn anchors(
        &self,
        metrics: &[Option<PageMetrics>],
        zoom: f32,
    ) -> Vec<(PageNumber, f32, f32)> {
        let mut top = 0.0;
        metrics
            .iter()
            .enumerate()
            .map(|(idx, m)| {
                let height = self.content_height(*m).max(self.min_slot_height) * zoom;
                let anchor = (idx + 1, top, height);
                top += self.slot_height(*m, zoom);
                anchor
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stacked(observer: &VisibilityObserver, pages: usize, height: f32) {
        for page in 1..=pages {
            observer.observe(page, (page - 1) as f32 * height, height);
        }
    }

    #[test]
    fn ratio_accounts_for_the_root_margin() {
        assert_eq!(intersection_ratio(0.0, 1000.0, 0.0, 800.0, 0.0), 0.8);
        assert_eq!(intersection_ratio(0.0, 1000.0, 0.0, 800.0, 200.0), 1.0);
        assert_eq!(intersection_ratio(1200.0, 1000.0, 0.0, 800.0, 200.0), 0.0);
        assert_eq!(intersection_ratio(900.0, 1000.0, 0.0, 800.0, 200.0), 0.1);
        assert_eq!(intersection_ratio(0.0, 0.0, 0.0, 800.0, 200.0), 0.0);
    }

    #[test]
    fn only_newly_visible_anchors_are_reported() {
        let observer = VisibilityObserver::new(ObserverOptions::default());
        stacked(&observer, 5, 1000.0);

        let first: Vec<_> = observer
            .update_viewport(0.0, 800.0)
            .iter()
            .map(|e| e.page)
            .collect();
        assert_eq!(first, vec![1]);

        assert!(observer.update_viewport(10.0, 800.0).is_empty());

        let next: Vec<_> = observer
            .update_viewport(1700.0, 800.0)
            .iter()
            .map(|e| e.page)
            .collect();
        assert_eq!(next, vec![2, 3]);
    }

    #[test]
    fn below_threshold_does_not_fire() {
        let observer = VisibilityObserver::new(ObserverOptions {
            threshold: 0.3,
            root_margin: 0.0,
        });
        observer.observe(1, 0.0, 1000.0);
        observer.observe(2, 1000.0, 1000.0);
        let pages: Vec<_> = observer
            .update_viewport(0.0, 1200.0)
            .iter()
            .map(|e| e.page)
            .collect();
        assert_eq!(pages, vec![1]);
    }

    #[tokio::test]
    async fn subscribers_receive_events_until_disconnect() {
        let observer = VisibilityObserver::new(ObserverOptions::default());
        stacked(&observer, 3, 1000.0);
        let mut subscription = observer.subscribe();

        observer.update_viewport(0.0, 800.0);
        assert_eq!(subscription.recv().await.map(|e| e.page), Some(1));

        observer.disconnect();
        assert_eq!(subscription.recv().await, None);
        assert!(observer.update_viewport(2000.0, 800.0).is_empty());
    }

    #[test]
    fn dropping_a_subscription_unsubscribes() {
        let observer = VisibilityObserver::new(ObserverOptions::default());
        let subscription = observer.subscribe();
        assert_eq!(observer.subscriber_count(), 1);
        drop(subscription);
        assert_eq!(observer.subscriber_count(), 0);
    }

    #[test]
    fn anchors_observed_after_a_scroll_fire_immediately() {
        let observer = VisibilityObserver::new(ObserverOptions::default());
        let mut subscription = observer.subscribe();
        observer.update_viewport(0.0, 800.0);
        observer.observe(1, 0.0, 1000.0);
        assert_eq!(subscription.try_recv().map(|e| e.page), Some(1));

        observer.observe(1, 10.0, 1000.0);
        assert!(subscription.try_recv().is_none());
    }

    #[test]
    fn moving_anchors_defers_reporting_to_the_next_scroll() {
        let observer = VisibilityObserver::new(ObserverOptions::default());
        let mut subscription = observer.subscribe();
        observer.set_layout(&[(1, 0.0, 1000.0), (2, 1000.0, 1000.0)]);
        observer.update_viewport(0.0, 800.0);
        assert_eq!(subscription.try_recv().map(|e| e.page), Some(1));

        observer.set_layout(&[(1, -2000.0, 1000.0), (2, 0.0, 1000.0)]);
        assert!(subscription.try_recv().is_none());

        let events = observer.update_viewport(0.0, 800.0);
        assert_eq!(events.iter().map(|e| e.page).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn layout_uses_aspect_ratio_and_placeholder() {
        let layout = PageLayout::default();
        let letter = Some(PageMetrics {
            width: 612.0,
            height: 792.0,
        });
        assert!((layout.content_height(letter) - 1035.29).abs() < 0.01);
        assert_eq!(layout.content_height(None), 1131.0);

        let wide = Some(PageMetrics {
            width: 800.0,
            height: 400.0,
        });
        assert_eq!(layout.slot_height(wide, 1.0), 1050.0);

        let anchors = layout.anchors(&[None, wide, None], 2.0);
        assert_eq!(anchors[0], (1, 0.0, 2262.0));
        assert_eq!(anchors[1], (2, 2362.0, 2000.0));
        assert_eq!(anchors[2].1, 2362.0 + 2100.0);
    }
}
