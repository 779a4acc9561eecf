//! Per-document reading sessions, bookmarks and their durable persistence.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crate::config::ProgressConfig;
use crate::error::{PersistenceError, ProgressError};
use crate::preview::{compress_preview, PreviewSpec};
use crate::storage::StateStore;
use crate::PageNumber;

pub const STORAGE_KEY: &str = "leaf-reading-progress";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bookmark {
    pub id: String,
    pub page_number: PageNumber,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingSession {
    pub url: String,
    pub title: String,
    pub total_pages: usize,
    pub current_page: PageNumber,
    pub last_read_at: DateTime<Utc>,
    /// Accumulated seconds across finished sessions.
    pub total_time_spent: u64,
    #[serde(default)]
    pub pages_read: BTreeSet<PageNumber>,
    #[serde(default)]
    pub bookmarks: Vec<Bookmark>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_page_preview: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingStats {
    /// Whole percent of distinct pages visited.
    pub progress: u32,
    pub pages_read: usize,
    pub total_pages: usize,
    pub time_spent_seconds: u64,
    pub time_spent: String,
    pub estimated_time_remaining: Option<String>,
    pub last_read_at: DateTime<Utc>,
    pub bookmarks_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageInfo {
    pub size_in_bytes: usize,
    pub size_in_mb: f64,
    pub session_count: usize,
    pub preview_count: usize,
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

struct ActiveSession {
    id: String,
    started_at: DateTime<Utc>,
}

#[derive(Default)]
struct ProgressState {
    sessions: BTreeMap<String, ReadingSession>,
    active: Option<ActiveSession>,
}

impl ProgressState {
    fn active_session_mut(&mut self) -> Option<&mut ReadingSession> {
        let id = &self.active.as_ref()?.id;
        self.sessions.get_mut(id)
    }

    /// Session ids, most recently read first.
    fn ids_by_recency(&self) -> Vec<String> {
        let mut sessions: Vec<&ReadingSession> = self.sessions.values().collect();
        sessions.sort_by(|a, b| {
            b.last_read_at
                .cmp(&a.last_read_at)
                .then_with(|| a.url.cmp(&b.url))
        });
        sessions.into_iter().map(|s| s.url.clone()).collect()
    }

    fn drop_previews_except(&mut self, keep: usize) {
        for id in self.ids_by_recency().into_iter().skip(keep) {
            if let Some(session) = self.sessions.get_mut(&id) {
                session.first_page_preview = None;
            }
        }
    }

    fn keep_most_recent(&mut self, keep: usize) {
        let evicted: Vec<String> = self.ids_by_recency().into_iter().skip(keep).collect();
        for id in &evicted {
            self.sessions.remove(id);
        }
        for session in self.sessions.values_mut() {
            session.first_page_preview = None;
        }
        if self
            .active
            .as_ref()
            .is_some_and(|active| !self.sessions.contains_key(&active.id))
        {
            self.active = None;
        }
    }

    fn encode(&self) -> Result<String, PersistenceError> {
        Ok(serde_json::to_string(&self.sessions)?)
    }
}

/// Owner and sole writer of the reading-progress storage key. Every mutation
/// runs under one lock, so writes are sequenced.
pub struct ReadingProgressStore {
    state: Mutex<ProgressState>,
    storage: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    config: ProgressConfig,
}

impl ReadingProgressStore {
    pub fn new(storage: Arc<dyn StateStore>, config: ProgressConfig) -> Self {
        Self::with_clock(storage, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        storage: Arc<dyn StateStore>,
        config: ProgressConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let sessions = load_sessions(storage.as_ref());
        Self {
            state: Mutex::new(ProgressState {
                sessions,
                active: None,
            }),
            storage,
            clock,
            config,
        }
    }

    #[instrument(skip(self, title))]
    pub fn start_session(
        &self,
        id: &str,
        title: &str,
        total_pages: usize,
    ) -> Result<ReadingSession, ProgressError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let session = state
            .sessions
            .entry(id.to_owned())
            .and_modify(|session| {
                session.title = title.to_owned();
                session.total_pages = total_pages;
                session.last_read_at = now;
            })
            .or_insert_with(|| ReadingSession {
                url: id.to_owned(),
                title: title.to_owned(),
                total_pages,
                current_page: 1,
                last_read_at: now,
                total_time_spent: 0,
                pages_read: BTreeSet::new(),
                bookmarks: Vec::new(),
                first_page_preview: None,
            })
            .clone();
        state.active = Some(ActiveSession {
            id: id.to_owned(),
            started_at: now,
        });
        self.persist(&mut state)?;
        Ok(session)
    }

    pub fn update_current_page(&self, page: PageNumber) -> Result<(), ProgressError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let Some(session) = state.active_session_mut() else {
            return Ok(());
        };
        session.current_page = page;
        session.pages_read.insert(page);
        session.last_read_at = now;
        self.persist(&mut state)?;
        Ok(())
    }

    /// Compresses a rendered first page and stores it as the active session's
    /// cover. Compression failures leave the preview unset.
    pub async fn update_preview(&self, encoded: Bytes) -> Result<(), ProgressError> {
        let Some(target) = self.active_id() else {
            return Ok(());
        };

        let spec = PreviewSpec {
            max_width: self.config.preview_max_width,
            max_height: self.config.preview_max_height,
            quality: self.config.preview_quality,
        };
        let compressed =
            match tokio::task::spawn_blocking(move || compress_preview(&encoded, spec)).await {
                Ok(Ok(data_url)) => data_url,
                Ok(Err(err)) => {
                    debug!(error = %err, "skipping cover preview");
                    return Ok(());
                }
                Err(err) => {
                    debug!(error = %err, "preview compression task aborted");
                    return Ok(());
                }
            };

        let mut state = self.state.lock();
        if state.active.as_ref().map(|a| a.id.as_str()) != Some(target.as_str()) {
            return Ok(());
        }
        if let Some(session) = state.active_session_mut() {
            session.first_page_preview = Some(compressed);
        }
        self.persist(&mut state)?;
        Ok(())
    }

    pub fn add_bookmark(
        &self,
        page: PageNumber,
        title: &str,
        note: Option<String>,
    ) -> Result<String, ProgressError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(ProgressError::EmptyTitle);
        }
        let now = self.clock.now();
        let mut state = self.state.lock();
        let session = state
            .active_session_mut()
            .ok_or(ProgressError::NoActiveSession)?;
        let id = Uuid::new_v4().to_string();
        session.bookmarks.push(Bookmark {
            id: id.clone(),
            page_number: page,
            title: title.to_owned(),
            note: note.filter(|n| !n.trim().is_empty()),
            created_at: now,
        });
        self.persist(&mut state)?;
        Ok(id)
    }

    /// Returns whether a bookmark with `id` existed on the active session.
    pub fn remove_bookmark(&self, id: &str) -> Result<bool, ProgressError> {
        let mut state = self.state.lock();
        let session = state
            .active_session_mut()
            .ok_or(ProgressError::NoActiveSession)?;
        let before = session.bookmarks.len();
        session.bookmarks.retain(|bookmark| bookmark.id != id);
        let removed = session.bookmarks.len() != before;
        self.persist(&mut state)?;
        Ok(removed)
    }

    /// Commits elapsed whole seconds to the active session and deactivates it.
    #[instrument(skip(self))]
    pub fn end_session(&self) -> Result<(), ProgressError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let Some(active) = state.active.take() else {
            return Ok(());
        };
        let elapsed = (now - active.started_at).num_seconds().max(0) as u64;
        if let Some(session) = state.sessions.get_mut(&active.id) {
            session.total_time_spent += elapsed;
            session.last_read_at = now;
        }
        self.persist(&mut state)?;
        Ok(())
    }

    pub fn get_session(&self, id: &str) -> Option<ReadingSession> {
        self.state.lock().sessions.get(id).cloned()
    }

    pub fn current_session(&self) -> Option<ReadingSession> {
        let mut state = self.state.lock();
        state.active_session_mut().map(|session| session.clone())
    }

    /// All sessions, most recently read first.
    pub fn list_sessions(&self) -> Vec<ReadingSession> {
        let state = self.state.lock();
        state
            .ids_by_recency()
            .iter()
            .filter_map(|id| state.sessions.get(id).cloned())
            .collect()
    }

    /// Deletes a session. An active session is dropped without committing time.
    pub fn remove_session(&self, id: &str) -> Result<bool, ProgressError> {
        let mut state = self.state.lock();
        let removed = state.sessions.remove(id).is_some();
        if state.active.as_ref().is_some_and(|active| active.id == id) {
            state.active = None;
        }
        self.persist(&mut state)?;
        Ok(removed)
    }

    pub fn stats(&self, id: &str) -> Option<ReadingStats> {
        let state = self.state.lock();
        let session = state.sessions.get(id)?;

        let pages_read = session.pages_read.len();
        let fraction = if session.total_pages > 0 {
            pages_read as f64 / session.total_pages as f64
        } else {
            0.0
        };
        let minutes_read = session.total_time_spent / 60;
        let estimated = (minutes_read > 0 && pages_read > 0)
            .then(|| {
                let unread = session.total_pages.saturating_sub(pages_read) as u64;
                minutes_read * unread / pages_read as u64
            })
            .filter(|minutes| *minutes > 0);

        Some(ReadingStats {
            progress: (fraction * 100.0).round() as u32,
            pages_read,
            total_pages: session.total_pages,
            time_spent_seconds: session.total_time_spent,
            time_spent: format_duration(session.total_time_spent),
            estimated_time_remaining: estimated.map(|minutes| format_duration(minutes * 60)),
            last_read_at: session.last_read_at,
            bookmarks_count: session.bookmarks.len(),
        })
    }

    pub fn storage_info(&self) -> StorageInfo {
        let state = self.state.lock();
        let size_in_bytes = match self.storage.load(STORAGE_KEY) {
            Ok(stored) => stored.map_or(2, |payload| payload.len()),
            Err(err) => {
                warn!(error = %err, "failed to read stored reading progress");
                0
            }
        };
        let size_in_mb = (size_in_bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0;
        StorageInfo {
            size_in_bytes,
            size_in_mb,
            session_count: state.sessions.len(),
            preview_count: state
                .sessions
                .values()
                .filter(|s| s.first_page_preview.is_some())
                .count(),
        }
    }

    pub fn clear_all_previews(&self) -> Result<(), ProgressError> {
        let mut state = self.state.lock();
        for session in state.sessions.values_mut() {
            session.first_page_preview = None;
        }
        self.persist(&mut state)?;
        Ok(())
    }

    pub fn clear_all(&self) -> Result<(), ProgressError> {
        let mut state = self.state.lock();
        state.sessions.clear();
        state.active = None;
        self.storage.remove(STORAGE_KEY)?;
        Ok(())
    }

    fn active_id(&self) -> Option<String> {
        self.state.lock().active.as_ref().map(|a| a.id.clone())
    }

    /// Writes every session, shedding previews and then whole sessions when
    /// the payload is oversized or the store rejects it.
    fn persist(&self, state: &mut ProgressState) -> Result<(), PersistenceError> {
        let mut payload = state.encode()?;
        if payload.len() > self.config.size_ceiling_bytes {
            debug!(
                bytes = payload.len(),
                "reading progress over size ceiling, trimming previews"
            );
            state.drop_previews_except(self.config.keep_previews);
            payload = state.encode()?;
        }

        match self.storage.save(STORAGE_KEY, &payload) {
            Err(PersistenceError::QuotaExceeded) => {}
            other => return other,
        }

        warn!("storage quota exceeded, dropping all previews");
        for session in state.sessions.values_mut() {
            session.first_page_preview = None;
        }
        match self.storage.save(STORAGE_KEY, &state.encode()?) {
            Err(PersistenceError::QuotaExceeded) => {}
            other => return other,
        }

        warn!(
            keep = self.config.keep_sessions,
            "storage still full, keeping only the most recent sessions"
        );
        state.keep_most_recent(self.config.keep_sessions);
        self.storage
            .save(STORAGE_KEY, &state.encode()?)
            .map_err(|err| {
                error!(error = %err, "cannot save reading progress at all");
                err
            })
    }
}

fn load_sessions(storage: &dyn StateStore) -> BTreeMap<String, ReadingSession> {
    let raw = match storage.load(STORAGE_KEY) {
        Ok(Some(raw)) => raw,
        Ok(None) => return BTreeMap::new(),
        Err(err) => {
            warn!(error = %err, "failed to load reading progress");
            return BTreeMap::new();
        }
    };
    serde_json::from_str(&raw).unwrap_or_else(|err| {
        warn!(error = %err, "stored reading progress is malformed, starting empty");
        BTreeMap::new()
    })
}

/// `1h 5m`, `12m` or `42s`.
pub fn format_duration(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m")
    } else {
        format!("{seconds}s")
    }
}
