use serde::Serialize;
use thiserror::Error;

use crate::PageNumber;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoadErrorKind {
    NotFound,
    CorsBlocked,
    NetworkError,
    NotAPdf,
    Malformed,
}

impl LoadErrorKind {
    pub fn user_message(&self) -> &'static str {
        match self {
            LoadErrorKind::NotFound => "PDF not found. Please check the URL and try again.",
            LoadErrorKind::CorsBlocked => {
                "The PDF URL does not allow cross-origin access. Please check the URL and try again."
            }
            LoadErrorKind::NetworkError => {
                "Network error. Please check your internet connection and try again."
            }
            LoadErrorKind::NotAPdf => "The URL does not point to a PDF file.",
            LoadErrorKind::Malformed => "Failed to load PDF. The file appears to be damaged.",
        }
    }
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct DocumentLoadError {
    pub kind: LoadErrorKind,
    pub message: String,
}

impl DocumentLoadError {
    pub fn new(kind: LoadErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn user_message(&self) -> &'static str {
        self.kind.user_message()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("upstream responded with status {0}")]
    Status(u16),
    #[error("cross-origin request was rejected")]
    Cors,
    #[error("response is not a PDF (content type {0:?})")]
    NotPdf(Option<String>),
    #[error("network error: {0}")]
    Network(String),
}

#[derive(Debug, Error)]
#[error("failed to render page {page}: {message}")]
pub struct PageRenderError {
    pub page: PageNumber,
    pub message: String,
}

#[derive(Debug, Error)]
#[error("failed to extract text from page {page}: {message}")]
pub struct ExtractionError {
    pub page: PageNumber,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("storage quota exceeded")]
    QuotaExceeded,
    #[error("failed to encode reading sessions: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("storage i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("no active reading session")]
    NoActiveSession,
    #[error("bookmark title must not be empty")]
    EmptyTitle,
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LocatorError {
    #[error("empty document path")]
    Empty,
    #[error("invalid document URL {0:?}")]
    InvalidUrl(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}
