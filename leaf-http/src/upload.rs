//! Upload ingestion and retrieval backed by a flat directory.

use std::io::ErrorKind;
use std::path::{Path as FsPath, PathBuf};

use anyhow::{Context, Result};
use axum::extract::{Multipart, Path, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::proxy::PDF_CACHE_CONTROL;
use crate::{ApiError, AppState};

pub use leaf_core::locator::UPLOAD_ROUTE;

pub const ORIGINAL_FILENAME: HeaderName = HeaderName::from_static("x-original-filename");

static UUID_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}-")
        .expect("valid uuid prefix pattern")
});

/// Replaces every character outside `[A-Za-z0-9.-]` with `_`.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub fn original_filename(stored: &str) -> &str {
    UUID_PREFIX
        .find(stored)
        .map_or(stored, |prefix| &stored[prefix.end()..])
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredUpload {
    pub success: bool,
    pub file_id: String,
    pub filename: String,
    pub size: usize,
    pub upload_path: String,
}

#[derive(Debug, Clone)]
pub struct UploadStore {
    dir: PathBuf,
}

impl UploadStore {
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create upload directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &FsPath {
        &self.dir
    }

    /// Writes `bytes` as `<uuid>-<sanitized name>`.
    pub async fn save(&self, name: &str, bytes: &[u8]) -> Result<StoredUpload> {
        let file_id = Uuid::new_v4().to_string();
        let filename = sanitize_filename(name);
        let path = self.dir.join(format!("{file_id}-{filename}"));
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write upload {}", path.display()))?;
        Ok(StoredUpload {
            success: true,
            upload_path: format!("{UPLOAD_ROUTE}/{file_id}"),
            file_id,
            filename,
            size: bytes.len(),
        })
    }

    /// Finds the stored file whose name starts with `<id>-`. Only a full
    /// hyphenated UUID is accepted as an id.
    pub async fn find(&self, id: &str) -> Result<Option<PathBuf>> {
        if id.len() != 36 || Uuid::try_parse(id).is_err() {
            return Ok(None);
        }
        let prefix = format!("{id}-");
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).context("failed to list uploads"),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                return Ok(Some(entry.path()));
            }
        }
        Ok(None)
    }
}

struct IncomingFile {
    name: String,
    content_type: Option<String>,
    bytes: Bytes,
}

#[instrument(skip_all)]
pub async fn upload_pdf(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<StoredUpload>, ApiError> {
    let mut incoming = None;
    while let Some(field) = multipart.next_field().await.map_err(|err| {
        error!(error = %err, "failed to read multipart field");
        ApiError::new(StatusCode::BAD_REQUEST, "Failed to read upload")
    })? {
        if field.name() != Some("file") {
            continue;
        }
        let name = field.file_name().unwrap_or("upload.pdf").to_owned();
        let content_type = field.content_type().map(str::to_owned);
        let bytes = field.bytes().await.map_err(|err| {
            error!(error = %err, "failed to read upload body");
            ApiError::new(StatusCode::BAD_REQUEST, "Failed to read upload")
        })?;
        incoming = Some(IncomingFile {
            name,
            content_type,
            bytes,
        });
        break;
    }

    let Some(file) = incoming else {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "No file provided"));
    };
    if file.content_type.as_deref() != Some("application/pdf") {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "File must be a PDF"));
    }
    if file.bytes.len() > state.max_upload_bytes {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "File size must be less than 50MB",
        ));
    }

    let stored = state
        .uploads
        .save(&file.name, &file.bytes)
        .await
        .map_err(|err| {
            error!(error = %err, "failed to store upload");
            ApiError::internal("Failed to upload file")
        })?;
    info!(file_id = %stored.file_id, size = stored.size, "stored upload");
    Ok(Json(stored))
}

#[instrument(skip(state))]
pub async fn serve_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let not_found = || ApiError::new(StatusCode::NOT_FOUND, "File not found");
    let path = state
        .uploads
        .find(&id)
        .await
        .map_err(|err| {
            error!(error = %err, "failed to look up upload");
            ApiError::internal("Failed to serve file")
        })?
        .ok_or_else(not_found)?;
    let bytes = tokio::fs::read(&path).await.map_err(|err| {
        error!(error = %err, path = %path.display(), "failed to read upload");
        ApiError::internal("Failed to serve file")
    })?;

    let stored = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let original = original_filename(&stored).to_owned();
    let disposition = HeaderValue::from_str(&format!("inline; filename=\"{original}\""))
        .map_err(|_| ApiError::internal("Failed to serve file"))?;
    let original = HeaderValue::from_str(&original)
        .map_err(|_| ApiError::internal("Failed to serve file"))?;

    Ok((
        [
            (CONTENT_TYPE, HeaderValue::from_static("application/pdf")),
            (CONTENT_LENGTH, HeaderValue::from(bytes.len())),
            (CACHE_CONTROL, HeaderValue::from_static(PDF_CACHE_CONTROL)),
            (CONTENT_DISPOSITION, disposition),
            (ORIGINAL_FILENAME, original),
        ],
        bytes,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router;
    use crate::tests::{body_json, test_state};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    const BOUNDARY: &str = "leaf-test-boundary";

    fn multipart_request(field: &str, filename: &str, content_type: &str, body: &[u8]) -> Request<Body> {
        let mut payload = Vec::new();
        payload.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n"
            )
            .as_bytes(),
        );
        payload.extend_from_slice(body);
        payload.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        Request::post(UPLOAD_ROUTE)
            .header(
                CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(payload))
            .unwrap()
    }

    #[test]
    fn filenames_are_sanitized() {
        assert_eq!(sanitize_filename("My Book (1).pdf"), "My_Book__1_.pdf");
        assert_eq!(sanitize_filename("../etc/passwd"), ".._etc_passwd");
        assert_eq!(sanitize_filename("plain-name.pdf"), "plain-name.pdf");
    }

    #[test]
    fn stored_names_lose_their_uuid_prefix() {
        assert_eq!(
            original_filename("0f8fad5b-d9cb-469f-a165-70867728950e-report.pdf"),
            "report.pdf"
        );
        assert_eq!(original_filename("report.pdf"), "report.pdf");
    }

    #[tokio::test]
    async fn uploaded_file_can_be_served_back() {
        let (state, _dir) = test_state();
        let app = router(state);

        let response = app
            .clone()
            .oneshot(multipart_request("file", "My Book.pdf", "application/pdf", b"%PDF-1.4 body"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["filename"], "My_Book.pdf");
        assert_eq!(json["size"], 13);
        let id = json["fileId"].as_str().unwrap().to_owned();
        assert_eq!(json["uploadPath"], format!("/api/pdf-upload/{id}"));

        let response = app
            .oneshot(
                Request::get(format!("/api/pdf-upload/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/pdf");
        assert_eq!(
            response.headers()[CONTENT_DISPOSITION],
            "inline; filename=\"My_Book.pdf\""
        );
        assert_eq!(response.headers()[&ORIGINAL_FILENAME], "My_Book.pdf");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"%PDF-1.4 body");
    }

    #[tokio::test]
    async fn uploads_are_validated() {
        let (state, _dir) = test_state();
        let app = router(state);

        let response = app
            .clone()
            .oneshot(multipart_request("file", "notes.txt", "text/plain", b"hello"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "File must be a PDF");

        let response = app
            .oneshot(multipart_request("other", "a.pdf", "application/pdf", b"%PDF-"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "No file provided");
    }

    #[tokio::test]
    async fn oversized_uploads_are_rejected() {
        let (mut state, _dir) = test_state();
        state.max_upload_bytes = 4;
        let response = router(state)
            .oneshot(multipart_request("file", "big.pdf", "application/pdf", b"%PDF-1.7"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await["error"],
            "File size must be less than 50MB"
        );
    }

    #[tokio::test]
    async fn lookup_requires_the_whole_file_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path().to_path_buf()).unwrap();
        let stored = store.save("paper.pdf", b"%PDF-1.4").await.unwrap();

        let found = store.find(&stored.file_id).await.unwrap().unwrap();
        assert!(found.ends_with(format!("{}-paper.pdf", stored.file_id)));

        let first_group = &stored.file_id[..8];
        assert!(store.find(first_group).await.unwrap().is_none());
        assert!(store.find(&stored.file_id[..35]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let (state, _dir) = test_state();
        let response = router(state)
            .oneshot(
                Request::get("/api/pdf-upload/does-not-exist")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
