//! Upstream registry protocol plumbing: the preflight `HEAD` that drives
//! token negotiation, and packing unexpected responses into errors.

use std::time::Duration;

use anyhow::{Context as _, Result};
use reqwest::{header, StatusCode, Url};
use thiserror::Error;
use tracing::debug;

use crate::auth::challenge;
use crate::auth::token::{self, TokenCache};

/// How much of an error response body is kept as the error message.
const ERROR_BODY_CAP: usize = 4 * 1024;

/// An upstream response with an unexpected status. The caller has already
/// decided the status is an error; this captures it with a bounded slice of
/// the body as context.
#[derive(Debug, Error)]
#[error("http status {status}: {message}")]
pub struct UpstreamError {
    pub status: StatusCode,
    pub message: String,
}

/// Consume `resp` into an [`UpstreamError`], reading at most 4 KiB of body.
pub async fn response_as_error(resp: reqwest::Response) -> UpstreamError {
    let status = resp.status();
    let message = match resp.bytes().await {
        Ok(body) => String::from_utf8_lossy(&body[..body.len().min(ERROR_BODY_CAP)]).into_owned(),
        Err(_) => String::from("<unreadable>"),
    };
    UpstreamError { status, message }
}

/// Probe `url` with a `HEAD` to find out whether the upstream wants a bearer
/// token, acquiring one (via the challenge's realm endpoint) when it does.
///
/// Returns `Ok(None)` when anonymous access is accepted; any status other
/// than 200 or 401 is an upstream error.
pub async fn preflight(
    client: &reqwest::Client,
    url: &Url,
    timeout: Duration,
    tokens: &TokenCache,
) -> Result<Option<String>> {
    let resp = client
        .head(url.clone())
        .timeout(timeout)
        .send()
        .await
        .with_context(|| format!("preflight HEAD {url}"))?;

    match resp.status() {
        StatusCode::OK => Ok(None),
        StatusCode::UNAUTHORIZED => {
            let header_value = resp
                .headers()
                .get(header::WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_owned();
            let parsed = challenge::parse(&header_value)
                .with_context(|| format!("parse www-authenticate {header_value:?}"))?;
            debug!(realm = %parsed.realm, scope = %parsed.scope, "acquiring bearer token");
            let bearer = token::acquire(client, tokens, &parsed, timeout).await?;
            Ok(Some(bearer))
        }
        _ => Err(response_as_error(resp).await).context("preflight status not ok"),
    }
}
