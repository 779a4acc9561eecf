//! Core of the leaf PDF reader: document loading, lazy page rendering,
//! background prefetch, full-text search and persisted reading progress.

pub mod cancel;
pub mod config;
pub mod corpus;
pub mod document;
pub mod error;
pub mod loader;
pub mod locator;
pub mod page;
pub mod prefetch;
pub mod preview;
pub mod progress;
pub mod renderer;
pub mod search;
pub mod storage;
pub mod text_format;
pub mod viewer;
pub mod visibility;

/// 1-based page index.
pub type PageNumber = usize;

pub use cancel::CancellationToken;
pub use config::LeafConfig;
pub use corpus::{extract_corpus, TextCorpus};
pub use document::{
    DocumentBackend, DocumentInfo, DocumentMetadata, DocumentOpener, PageAccessor, PageMetrics,
    Raster, RenderImage, TextRun,
};
pub use error::{
    DocumentLoadError, ExtractionError, FetchError, LoadErrorKind, LocatorError, PageRenderError,
    PersistenceError, ProgressError,
};
pub use loader::{ByteFetcher, DocumentHandle, DocumentLoader};
pub use locator::{parse_navigation_path, NavigationTarget, SourceLocator};
pub use page::{PageRecord, PageState};
pub use progress::{Bookmark, ReadingProgressStore, ReadingSession, ReadingStats, StorageInfo};
pub use renderer::PageRenderer;
pub use search::{SearchController, SearchMatch, SearchSnapshot};
pub use storage::{FileStateStore, MemoryStateStore, StateStore};
pub use viewer::{ViewerCommand, ViewerEvent, ViewerSession};
