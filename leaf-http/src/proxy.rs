//! Server-side fetch of remote PDFs on behalf of clients that cannot reach
//! them directly.

use axum::extract::{Query, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use reqwest::header as upstream_header;
use serde::Deserialize;
use tracing::{error, info, instrument, warn};
use url::Url;

use crate::{ApiError, AppState};

pub const PROXY_ROUTE: &str = "/api/pdf-proxy";
/// Set on a rejection caused by a non-PDF upstream response.
pub const UPSTREAM_CONTENT_TYPE: &str = "x-upstream-content-type";
pub const PDF_CACHE_CONTROL: &str = "public, max-age=3600";

#[derive(Debug, Deserialize)]
pub struct ProxyQuery {
    url: Option<String>,
}

/// Decodes a target once more and collapses the double-prefixed forms that
/// clients produce when they re-encode an already proxied URL.
pub fn repair_target(raw: &str) -> String {
    let mut decoded = urlencoding::decode(raw)
        .map(|cow| cow.into_owned())
        .unwrap_or_else(|_| raw.to_owned());
    for broken in ["https://https:/", "https:///https%3A", "https:////https%253A/"] {
        if decoded.contains(broken) {
            decoded = decoded.replacen(broken, "https://", 1);
        }
    }
    decoded
}

#[instrument(skip(state, query))]
pub async fn proxy_pdf(
    State(state): State<AppState>,
    Query(query): Query<ProxyQuery>,
) -> Result<Response, ApiError> {
    let Some(raw) = query.url.filter(|url| !url.is_empty()) else {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "URL parameter is required"));
    };
    let target = repair_target(&raw);
    let target = Url::parse(&target)
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "Invalid URL"))?;

    let upstream = state
        .client
        .get(target.clone())
        .header(upstream_header::USER_AGENT, &*state.user_agent)
        .send()
        .await
        .map_err(|err| {
            error!(error = %err, %target, "proxy fetch failed");
            ApiError::internal("Failed to fetch PDF from the provided URL")
        })?;

    let status = upstream.status();
    if !status.is_success() {
        warn!(%target, status = status.as_u16(), "upstream rejected proxy fetch");
        let code = StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        return Err(ApiError::new(
            code,
            format!(
                "Failed to fetch PDF: {} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or_default()
            ),
        ));
    }

    let content_type = upstream
        .headers()
        .get(upstream_header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    if !content_type
        .as_deref()
        .is_some_and(|ct| ct.contains("application/pdf"))
    {
        let mut response =
            ApiError::new(StatusCode::BAD_REQUEST, "URL does not point to a PDF file")
                .into_response();
        if let Some(value) = content_type.and_then(|ct| HeaderValue::from_str(&ct).ok()) {
            response.headers_mut().insert(UPSTREAM_CONTENT_TYPE, value);
        } else {
            response
                .headers_mut()
                .insert(UPSTREAM_CONTENT_TYPE, HeaderValue::from_static("unknown"));
        }
        return Ok(response);
    }

    let bytes = upstream.bytes().await.map_err(|err| {
        error!(error = %err, %target, "failed to read upstream body");
        ApiError::internal("Failed to fetch PDF from the provided URL")
    })?;
    info!(%target, len = bytes.len(), "proxied document");

    Ok((
        [
            (CONTENT_TYPE, HeaderValue::from_static("application/pdf")),
            (CONTENT_LENGTH, HeaderValue::from(bytes.len())),
            (CACHE_CONTROL, HeaderValue::from_static(PDF_CACHE_CONTROL)),
        ],
        bytes,
    )
        .into_response())
}
