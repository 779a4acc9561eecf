//! Per-page render state, stored as a dense 1-based arena.

use crate::document::{PageMetrics, Raster};
use crate::PageNumber;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    NotRequested,
    Loading,
    Loaded,
}

#[derive(Debug, Clone)]
pub struct PageRecord {
    pub number: PageNumber,
    pub state: PageState,
    pub text: String,
    pub raster: Option<Raster>,
    pub metrics: Option<PageMetrics>,
}

impl PageRecord {
    fn new(number: PageNumber) -> Self {
        Self {
            number,
            state: PageState::NotRequested,
            text: String::new(),
            raster: None,
            metrics: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PageTable {
    records: Vec<PageRecord>,
}

impl PageTable {
    pub fn new(page_count: usize) -> Self {
        Self {
            records: (1..=page_count).map(PageRecord::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, page: PageNumber) -> bool {
        page >= 1 && page <= self.records.len()
    }

    pub fn get(&self, page: PageNumber) -> Option<&PageRecord> {
        page.checked_sub(1).and_then(|idx| self.records.get(idx))
    }

    fn get_mut(&mut self, page: PageNumber) -> Option<&mut PageRecord> {
        page.checked_sub(1).and_then(|idx| self.records.get_mut(idx))
    }

    pub fn state(&self, page: PageNumber) -> Option<PageState> {
        self.get(page).map(|record| record.state)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageRecord> {
        self.records.iter()
    }

    /// Moves a page from `NotRequested` to `Loading`. Returns `false` when the
    /// page is unknown or already past `NotRequested`.
    pub fn begin_loading(&mut self, page: PageNumber) -> bool {
        match self.get_mut(page) {
            Some(record) if record.state == PageState::NotRequested => {
                record.state = PageState::Loading;
                true
            }
            _ => false,
        }
    }

    /// Completes a load. `raster` may be `None` only for an accepted
    /// text-only fallback.
    pub fn finish_loading(
        &mut self,
        page: PageNumber,
        raster: Option<Raster>,
        metrics: Option<PageMetrics>,
    ) -> bool {
        match self.get_mut(page) {
            Some(record) if record.state == PageState::Loading => {
                record.state = PageState::Loaded;
                record.raster = raster;
                if metrics.is_some() {
                    record.metrics = metrics;
                }
                true
            }
            _ => false,
        }
    }

    /// Returns a failed `Loading` page to `NotRequested` so it can be retried.
    pub fn revert(&mut self, page: PageNumber) -> bool {
        match self.get_mut(page) {
            Some(record) if record.state == PageState::Loading => {
                record.state = PageState::NotRequested;
                true
            }
            _ => false,
        }
    }

    pub fn set_text(&mut self, page: PageNumber, text: String) {
        if let Some(record) = self.get_mut(page) {
            record.text = text;
        }
    }

    pub fn count_in(&self, state: PageState) -> usize {
        self.records.iter().filter(|r| r.state == state).count()
    }
}
