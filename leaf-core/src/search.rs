//! Full-document text search over a [`TextCorpus`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, instrument};

use crate::config::SearchConfig;
use crate::corpus::TextCorpus;
use crate::PageNumber;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchMatch {
    pub page_number: PageNumber,
    pub matched_text: String,
    /// Character offsets into the page text.
    pub start_offset: usize,
    pub end_offset: usize,
    pub context_snippet: String,
}

fn fold(c: char) -> char {
    let mut lower = c.to_lowercase();
    match (lower.next(), lower.next()) {
        (Some(folded), None) => folded,
        _ => c,
    }
}

/// Case-insensitive, non-overlapping occurrences of `query` in `text`.
pub fn find_in_page(
    page_number: PageNumber,
    text: &str,
    query: &str,
    context_chars: usize,
) -> Vec<SearchMatch> {
    let original: Vec<char> = text.chars().collect();
    let haystack: Vec<char> = original.iter().copied().map(fold).collect();
    let needle: Vec<char> = query.chars().map(fold).collect();
    if needle.is_empty() || needle.len() > haystack.len() {
        return Vec::new();
    }

    let mut matches = Vec::new();
    let mut offset = 0;
    while offset + needle.len() <= haystack.len() {
        let end = offset + needle.len();
        if haystack[offset..end] != needle[..] {
            offset += 1;
            continue;
        }

        let context_start = offset.saturating_sub(context_chars);
        let context_end = (end + context_chars).min(original.len());
        let context: String = original[context_start..context_end].iter().collect();
        matches.push(SearchMatch {
            page_number,
            matched_text: original[offset..end].iter().collect(),
            start_offset: offset,
            end_offset: end,
            context_snippet: if context_start > 0 {
                format!("...{context}")
            } else {
                context
            },
        });
        offset = end;
    }
    matches
}

/// Scans the corpus in batches, yielding between them. Returns `None` as soon
/// as `is_current` reports the search is stale.
pub async fn search_corpus(
    corpus: &TextCorpus,
    query: &str,
    batch_size: usize,
    context_chars: usize,
    is_current: impl Fn() -> bool,
) -> Option<Vec<SearchMatch>> {
    if query.trim().is_empty() {
        return Some(Vec::new());
    }

    let total = corpus.page_count();
    let batch_size = batch_size.max(1);
    let mut results = Vec::new();
    let mut first = 1;
    while first <= total {
        if !is_current() {
            return None;
        }
        let last = (first + batch_size - 1).min(total);
        for page in first..=last {
            let text = corpus.page_text(page);
            if !text.is_empty() {
                results.extend(find_in_page(page, text, query, context_chars));
            }
        }
        first = last + 1;
        if first <= total {
            tokio::task::yield_now().await;
        }
    }
    is_current().then_some(results)
}

/// Request to show a result's page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchNavigation {
    pub page: PageNumber,
    pub query: String,
    pub index: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchSnapshot {
    pub query: String,
    pub results: Vec<SearchMatch>,
    pub selected: Option<usize>,
    pub searching: bool,
}

struct SearchShared {
    corpus: Arc<TextCorpus>,
    config: SearchConfig,
    generation: AtomicU64,
    snapshot: watch::Sender<SearchSnapshot>,
    navigation: mpsc::UnboundedSender<SearchNavigation>,
}

impl SearchShared {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    async fn execute(&self, generation: u64, query: String) {
        if !self.is_current(generation) {
            return;
        }
        let found = search_corpus(
            &self.corpus,
            &query,
            self.config.batch_size,
            self.config.context_chars,
            || self.is_current(generation),
        )
        .await;
        let Some(results) = found else {
            debug!(%query, "discarding stale search");
            return;
        };

        // Queries bump the generation under the same watch lock.
        let mut navigate_to = None;
        self.snapshot.send_if_modified(|snapshot| {
            if !self.is_current(generation) {
                return false;
            }
            snapshot.selected = if results.is_empty() { None } else { Some(0) };
            navigate_to = results.first().map(|first| first.page_number);
            snapshot.results = results;
            snapshot.query = query.clone();
            snapshot.searching = false;
            true
        });
        if let Some(page) = navigate_to {
            let _ = self.navigation.send(SearchNavigation {
                page,
                query,
                index: 0,
            });
        }
    }
}

/// Debounced search with a single live query. Only the latest query ever
/// publishes results.
pub struct SearchController {
    shared: Arc<SearchShared>,
    pending: Mutex<Option<JoinHandle<()>>>,
    navigation: Mutex<Option<mpsc::UnboundedReceiver<SearchNavigation>>>,
}

impl SearchController {
    pub fn new(corpus: Arc<TextCorpus>, config: SearchConfig) -> Self {
        let (snapshot, _) = watch::channel(SearchSnapshot::default());
        let (navigation_tx, navigation_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(SearchShared {
                corpus,
                config,
                generation: AtomicU64::new(0),
                snapshot,
                navigation: navigation_tx,
            }),
            pending: Mutex::new(None),
            navigation: Mutex::new(Some(navigation_rx)),
        }
    }

    /// Replaces the pending query. The scan starts after the debounce delay.
    #[instrument(skip(self))]
    pub fn set_query(&self, query: &str) {
        let (generation, blank) = self.begin(query);
        if blank {
            self.replace_pending(None);
            return;
        }

        let shared = Arc::clone(&self.shared);
        let debounce = self.shared.config.debounce;
        let query = query.to_owned();
        let task = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            shared.execute(generation, query).await;
        });
        self.replace_pending(Some(task));
    }

    /// Runs `query` immediately, bypassing the debounce, and returns what was
    /// published.
    pub async fn search_now(&self, query: &str) -> Vec<SearchMatch> {
        let (generation, blank) = self.begin(query);
        self.replace_pending(None);
        if blank {
            return Vec::new();
        }
        self.shared.execute(generation, query.to_owned()).await;
        self.snapshot().results
    }

    pub fn next(&self) -> Option<SearchNavigation> {
        self.step(|current, len| (current + 1) % len)
    }

    pub fn previous(&self) -> Option<SearchNavigation> {
        self.step(|current, len| if current == 0 { len - 1 } else { current - 1 })
    }

    /// Resets query, results and selection, and drops any pending scan.
    pub fn clear(&self) {
        self.shared.snapshot.send_modify(|snapshot| {
            self.bump();
            *snapshot = SearchSnapshot::default();
        });
        self.replace_pending(None);
    }

    pub fn snapshot(&self) -> SearchSnapshot {
        self.shared.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SearchSnapshot> {
        self.shared.snapshot.subscribe()
    }

    /// Navigation requests. Can be taken once.
    pub fn take_navigation(&self) -> Option<mpsc::UnboundedReceiver<SearchNavigation>> {
        self.navigation.lock().take()
    }

    /// Starts a new generation and resets the published results.
    fn begin(&self, query: &str) -> (u64, bool) {
        let blank = query.trim().is_empty();
        let mut generation = 0;
        self.shared.snapshot.send_modify(|snapshot| {
            generation = self.bump();
            snapshot.query = query.to_owned();
            snapshot.results.clear();
            snapshot.selected = None;
            snapshot.searching = !blank;
        });
        (generation, blank)
    }

    fn bump(&self) -> u64 {
        self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn replace_pending(&self, task: Option<JoinHandle<()>>) {
        if let Some(previous) = std::mem::replace(&mut *self.pending.lock(), task) {
            previous.abort();
        }
    }

    fn step(&self, advance: impl Fn(usize, usize) -> usize) -> Option<SearchNavigation> {
        let mut navigation = None;
        self.shared.snapshot.send_if_modified(|snapshot| {
            if snapshot.results.is_empty() {
                return false;
            }
            let len = snapshot.results.len();
            let index = advance(snapshot.selected.unwrap_or(0), len);
            snapshot.selected = Some(index);
            navigation = Some(SearchNavigation {
                page: snapshot.results[index].page_number,
                query: snapshot.query.clone(),
                index,
            });
            true
        });
        if let Some(nav) = &navigation {
            let _ = self.shared.navigation.send(nav.clone());
        }
        navigation
    }
}

impl Drop for SearchController {
    fn drop(&mut self) {
        self.bump();
        self.replace_pending(None);
    }
}
