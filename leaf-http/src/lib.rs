//! HTTP surfaces for leaf: byte fetchers used by the loader and the axum
//! server exposing the PDF proxy and upload endpoints.

pub mod client;
pub mod proxy;
pub mod upload;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use leaf_core::config::ServerConfig;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub use client::{build_client, HttpFetcher, ProxyFetcher, DEFAULT_USER_AGENT};
pub use upload::UploadStore;

/// Multipart framing allowance on top of the file size limit.
const MULTIPART_SLACK: usize = 1024 * 1024;

#[derive(Debug, Error)]
#[error("{message}")]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub client: reqwest::Client,
    pub user_agent: Arc<str>,
    pub uploads: UploadStore,
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn new(config: &ServerConfig, upload_dir: PathBuf) -> Result<Self> {
        Ok(Self {
            client: build_client(&config.user_agent)?,
            user_agent: Arc::from(config.user_agent.as_str()),
            uploads: UploadStore::new(upload_dir)?,
            max_upload_bytes: config.max_upload_bytes,
        })
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let body_limit = state.max_upload_bytes.saturating_add(MULTIPART_SLACK);

    Router::new()
        .route("/health", get(health))
        .route(proxy::PROXY_ROUTE, get(proxy::proxy_pdf))
        .route(
            upload::UPLOAD_ROUTE,
            axum::routing::post(upload::upload_pdf).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route(
            &format!("{}/:id", upload::UPLOAD_ROUTE),
            get(upload::serve_upload),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// Serves until Ctrl+C (or SIGTERM on unix).
pub async fn serve(config: &ServerConfig, upload_dir: PathBuf) -> Result<()> {
    let addr: SocketAddr = config
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {:?}", config.bind))?;
    let state = AppState::new(config, upload_dir)?;
    let uploads = state.uploads.dir().display().to_string();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, %uploads, "leaf server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server terminated unexpectedly")?;
    info!("leaf server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::header::CONTENT_TYPE;
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;
    use url::Url;

    pub(crate) fn test_state() -> (AppState, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(&ServerConfig::default(), dir.path().join("uploads")).unwrap();
        (state, dir)
    }

    pub(crate) async fn body_json(response: Response) -> serde_json::Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    /// Local stand-in for a remote host: `/doc.pdf`, `/page.html`, and 404
    /// for everything else.
    pub(crate) async fn spawn_upstream() -> Url {
        let app = Router::new()
            .route(
                "/doc.pdf",
                get(|| async { ([(CONTENT_TYPE, "application/pdf")], "%PDF-1.4 upstream") }),
            )
            .route(
                "/page.html",
                get(|| async { ([(CONTENT_TYPE, "text/html; charset=utf-8")], "<html></html>") }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Url::parse(&format!("http://{addr}/")).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_answers() {
        let (state, _dir) = test_state();
        let response = router(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn proxy_fetcher_round_trips_through_the_server() {
        use leaf_core::{ByteFetcher, FetchError};

        let upstream = spawn_upstream().await;
        let (state, _dir) = test_state();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });

        let fetcher = ProxyFetcher::new(
            build_client(DEFAULT_USER_AGENT).unwrap(),
            Url::parse(&format!("http://{addr}/")).unwrap(),
        );
        let bytes = fetcher.fetch(&upstream.join("/doc.pdf").unwrap()).await.unwrap();
        assert_eq!(&bytes[..], b"%PDF-1.4 upstream");

        assert_eq!(
            fetcher.fetch(&upstream.join("/gone.pdf").unwrap()).await,
            Err(FetchError::Status(404))
        );
        assert!(matches!(
            fetcher.fetch(&upstream.join("/page.html").unwrap()).await,
            Err(FetchError::NotPdf(Some(ct))) if ct.starts_with("text/html")
        ));
    }
}
