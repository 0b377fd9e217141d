//! Axum router and request handlers for the registry caching proxy.
//!
//! Routes:
//! - `GET /v2/`                   - Registry API discovery (empty 200)
//! - `GET /v2/{registry}/{*path}` - Caching proxy for manifests and blobs
//! - `GET /healthz`               - Health check
//! - `GET /metrics`               - Prometheus metrics
//!
//! The proxy handler decides per request between serving a fresh cache hit,
//! revalidating a stale one with `If-None-Match`, and a full upstream fetch
//! that is streamed to the client while being staged into the cache. While a
//! cached copy exists, every upstream failure during revalidation degrades to
//! serving the stale copy.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context as _};
use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use chrono::{TimeDelta, Utc};
use futures::StreamExt;
use reqwest::Url;
use tokio_stream::wrappers::ReceiverStream;
use tokio::io::AsyncWriteExt;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::{debug, error, instrument, warn};

use crate::cache::{CachedObject, TempObject};
use crate::http::upstream;
use crate::metrics::{CacheStatus, RequestLabels, UpstreamLabels, UpstreamMethod};
use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
///
/// Streaming routes carry opaque (often already compressed) registry bytes,
/// so no compression layer is mounted anywhere.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v2/", get(handle_api_discovery))
        .route("/v2/{registry}/{*path}", get(handle_proxy))
        .route("/healthz", get(crate::health::handle_health))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /v2/` - Docker Registry API discovery endpoint.
async fn handle_api_discovery() -> StatusCode {
    StatusCode::OK
}

/// `GET /v2/{registry}/{*path}` - the caching proxy.
#[instrument(skip(state, req), fields(%registry, %path))]
async fn handle_proxy(
    State(state): State<Arc<AppState>>,
    Path((registry, path)): Path<(String, String)>,
    req: Request,
) -> Result<Response, AppError> {
    let start = Instant::now();
    let result = proxy_request(&state, &registry, &path, req.headers()).await;
    state
        .metrics
        .metrics
        .request_duration_seconds
        .observe(start.elapsed().as_secs_f64());
    result
}

async fn proxy_request(
    state: &Arc<AppState>,
    registry: &str,
    path: &str,
    client_headers: &HeaderMap,
) -> Result<Response, AppError> {
    let key = format!("{registry}/{path}");
    let cached = state.cache.get(&key).map_err(AppError::Store)?;

    let max_age = TimeDelta::seconds(state.config.unconditional_cache_time as i64);
    let revalidate = cached
        .as_ref()
        .is_some_and(|c| Utc::now() - c.validated_at > max_age);

    if let Some(cached) = &cached {
        if !revalidate {
            debug!(key, "serving fresh object from cache");
            state.count_request(CacheStatus::Hit);
            return serve_from_cache(state, &key, cached, client_headers).await;
        }
    }

    let host = state
        .registries
        .get(registry)
        .ok_or_else(|| AppError::RegistryNotFound(registry.to_string()))?;
    let upstream_url = Url::parse(&format!("https://{host}/v2/{path}"))
        .map_err(|e| AppError::Upstream(anyhow!("build upstream url: {e}")))?;
    let timeout = Duration::from_secs(state.config.upstream_timeout);

    // Preflight HEAD; a 401 challenge yields a bearer token. While a stale
    // copy exists, upstream trouble never reaches the client.
    state.count_upstream(UpstreamMethod::Head);
    let token = match upstream::preflight(&state.http_client, &upstream_url, timeout, &state.tokens)
        .await
    {
        Ok(token) => token,
        Err(e) => {
            if let (true, Some(cached)) = (revalidate, &cached) {
                warn!(key, error = %format!("{e:#}"), "preflight failed, serving stale object");
                state.count_request(CacheStatus::Degraded);
                return serve_from_cache(state, &key, cached, client_headers).await;
            }
            return Err(AppError::Upstream(e));
        }
    };

    let mut upstream_req = state
        .http_client
        .get(upstream_url.clone())
        .timeout(timeout);
    if revalidate {
        if let Some(cached) = &cached {
            upstream_req = upstream_req.header(header::IF_NONE_MATCH, cached.etag.as_str());
        }
    }
    // The client's own If-None-Match is deliberately not forwarded: docker
    // and podman never send one and treat the proxy as an opaque origin.
    for value in client_headers.get_all(header::ACCEPT) {
        upstream_req = upstream_req.header(header::ACCEPT, value);
    }
    if let Some(token) = &token {
        upstream_req = upstream_req.bearer_auth(token);
    }

    state.count_upstream(UpstreamMethod::Get);
    let resp = match upstream_req.send().await {
        Ok(resp) => resp,
        Err(e) => {
            if let (true, Some(cached)) = (revalidate, &cached) {
                warn!(key, error = %e, "upstream request failed, serving stale object");
                state.count_request(CacheStatus::Degraded);
                return serve_from_cache(state, &key, cached, client_headers).await;
            }
            return Err(AppError::Upstream(
                anyhow::Error::new(e).context("upstream request"),
            ));
        }
    };

    match resp.status() {
        StatusCode::NOT_MODIFIED => {
            let Some(cached) = &cached else {
                return Err(AppError::Upstream(anyhow!(
                    "unexpected 304 from upstream without a cached copy"
                )));
            };
            debug!(key, "revalidated cached object");
            state.cache.touch_validated(&key).map_err(AppError::Store)?;
            state.count_request(CacheStatus::Revalidated);
            serve_from_cache(state, &key, cached, client_headers).await
        }
        StatusCode::OK => {
            if revalidate {
                debug!(key, "cached object changed upstream, refetching");
            } else {
                debug!(key, "cache miss, fetching from upstream");
            }
            state.count_request(CacheStatus::Miss);
            fetch_and_store(state, &key, resp).await
        }
        _ => {
            let err = upstream::response_as_error(resp).await;
            if let (true, Some(cached)) = (revalidate, &cached) {
                warn!(key, error = %err, "upstream status not ok, serving stale object");
                state.count_request(CacheStatus::Degraded);
                return serve_from_cache(state, &key, cached, client_headers).await;
            }
            Err(AppError::Upstream(
                anyhow::Error::new(err).context("upstream status not ok"),
            ))
        }
    }
}

// ---------------------------------------------------------------------------
// Serving
// ---------------------------------------------------------------------------

/// Stream a cached object from disk, with the cached media type and entity
/// tag. The file service handles range requests, client-side conditional
/// headers and `Last-Modified`.
async fn serve_from_cache(
    state: &AppState,
    key: &str,
    cached: &CachedObject,
    client_headers: &HeaderMap,
) -> Result<Response, AppError> {
    let file = state.cache.object_path(key);
    let mime_type = cached
        .media_type
        .parse::<mime::Mime>()
        .unwrap_or(mime::APPLICATION_OCTET_STREAM);

    let mut file_req = Request::new(Body::empty());
    for name in [
        header::RANGE,
        header::IF_RANGE,
        header::IF_MODIFIED_SINCE,
        header::IF_UNMODIFIED_SINCE,
    ] {
        for value in client_headers.get_all(&name) {
            file_req.headers_mut().append(name.clone(), value.clone());
        }
    }

    let resp = match ServeFile::new_with_mime(&file, &mime_type)
        .oneshot(file_req)
        .await
    {
        Ok(resp) => resp,
        Err(e) => {
            return Err(AppError::Store(anyhow!(
                "serve cached file {}: {e}",
                file.display()
            )))
        }
    };

    let mut resp = resp.into_response();
    if !cached.etag.is_empty() {
        if let Ok(value) = cached.etag.parse() {
            resp.headers_mut().insert(header::ETAG, value);
        }
    }
    Ok(resp)
}

/// Stream the upstream body to the client while staging every byte into the
/// cache, publishing the staged object once the body completes.
async fn fetch_and_store(
    state: &Arc<AppState>,
    key: &str,
    resp: reqwest::Response,
) -> Result<Response, AppError> {
    let etag = header_str(resp.headers(), header::ETAG);
    let content_type = header_str(resp.headers(), header::CONTENT_TYPE);
    let content_length: u64 = resp
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| {
            AppError::Upstream(anyhow!("upstream response lacks a parseable Content-Length"))
        })?;

    let tmp = state
        .cache
        .create(&content_type, &etag)
        .map_err(AppError::Store)?;

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, io::Error>>(32);
    {
        let state = Arc::clone(state);
        let key = key.to_owned();
        tokio::spawn(async move {
            if let Err(e) = tee_to_cache(&state, &key, resp, tmp, content_length, tx).await {
                warn!(key, error = %format!("{e:#}"), "caching upstream response failed");
            }
        });
    }

    let mut response = Response::new(Body::from_stream(ReceiverStream::new(rx)));
    let headers = response.headers_mut();
    if let Ok(value) = etag.parse() {
        headers.insert(header::ETAG, value);
    }
    if let Ok(value) = content_type.parse() {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(header::CONTENT_LENGTH, content_length.into());
    Ok(response)
}

/// Forward upstream chunks to the client channel, writing each one to the
/// staged file first. The staged object is published only after the body
/// completed; on any failure its drop guard reclaims the temp file.
async fn tee_to_cache(
    state: &AppState,
    key: &str,
    resp: reqwest::Response,
    mut tmp: TempObject,
    size: u64,
    tx: tokio::sync::mpsc::Sender<Result<Bytes, io::Error>>,
) -> anyhow::Result<()> {
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = tx.send(Err(io::Error::other(e.to_string()))).await;
                return Err(e).context("read upstream body");
            }
        };
        tmp.file_mut()
            .write_all(&chunk)
            .await
            .context("write staged chunk")?;
        if tx.send(Ok(chunk)).await.is_err() {
            anyhow::bail!("client disconnected mid-stream");
        }
    }
    tmp.file_mut().flush().await.context("flush staged object")?;
    state
        .cache
        .publish(tmp, key, size)
        .context("publish cached object")?;
    debug!(key, size, "cached upstream object");
    Ok(())
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned()
}

/// `GET /metrics` - Prometheus metrics in OpenMetrics text format.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    // Capacity gauges are sampled at scrape time.
    state
        .metrics
        .metrics
        .cache_used_bytes
        .set(state.cache.used_bytes() as i64);
    state
        .metrics
        .metrics
        .cache_objects
        .set(state.cache.object_count() as i64);

    let mut buf = String::new();
    prometheus_client::encoding::text::encode(&mut buf, &state.metrics.registry)
        .map_err(|e| AppError::Store(anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Metrics shorthand
// ---------------------------------------------------------------------------

impl AppState {
    fn count_request(&self, cache_status: CacheStatus) {
        self.metrics
            .metrics
            .requests
            .get_or_create(&RequestLabels { cache_status })
            .inc();
    }

    fn count_upstream(&self, method: UpstreamMethod) {
        self.metrics
            .metrics
            .upstream_requests
            .get_or_create(&UpstreamLabels { method })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Handler-level error that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// The registry alias in the URL is not configured.
    RegistryNotFound(String),
    /// The upstream registry could not satisfy a cold-miss request.
    Upstream(anyhow::Error),
    /// Cache or object-store failure.
    Store(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::RegistryNotFound(registry) => {
                debug!(%registry, "registry not found");
                (StatusCode::NOT_FOUND, "registry not found").into_response()
            }
            AppError::Upstream(err) => {
                error!(error = %format!("{err:#}"), "upstream error");
                (StatusCode::BAD_GATEWAY, format!("upstream error: {err:#}")).into_response()
            }
            AppError::Store(err) => {
                error!(error = %format!("{err:#}"), "cache store error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("internal server error: {err:#}"),
                )
                    .into_response()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, LogConfig};
    use crate::metrics::MetricsRegistry;
    use axum::body::to_bytes;
    use tempfile::TempDir;

    fn test_state(registries: &[&str], unconditional_cache_time: u64) -> (TempDir, Arc<AppState>) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            registries: registries.iter().map(|s| s.to_string()).collect(),
            cache_dir: dir.path().to_path_buf(),
            cache_size: 1 << 20,
            unconditional_cache_time,
            upstream_timeout: 1,
            token_ttl: 300,
            http_listen: "127.0.0.1:0".to_string(),
            log: LogConfig::default(),
        };
        let registries = config.registry_aliases();
        let state = AppState {
            cache: Arc::new(crate::cache::Cache::open(dir.path(), config.cache_size).unwrap()),
            config: Arc::new(config),
            http_client: reqwest::Client::new(),
            registries,
            tokens: crate::auth::TokenCache::new(Duration::from_secs(300)),
            metrics: MetricsRegistry::new(),
        };
        (dir, Arc::new(state))
    }

    async fn seed_object(state: &AppState, key: &str, media_type: &str, etag: &str, body: &[u8]) {
        let mut tmp = state.cache.create(media_type, etag).unwrap();
        tmp.file_mut().write_all(body).await.unwrap();
        tmp.file_mut().flush().await.unwrap();
        state.cache.publish(tmp, key, body.len() as u64).unwrap();
    }

    fn request(uri: &str) -> Request {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn api_discovery_returns_empty_ok() {
        let (_dir, state) = test_state(&["docker.io"], 300);
        let resp = create_router(state).oneshot(request("/v2/")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn unknown_registry_is_404() {
        let (_dir, state) = test_state(&["docker.io"], 300);
        let resp = create_router(state)
            .oneshot(request("/v2/evil.example/foo/manifests/latest"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"registry not found");
    }

    #[tokio::test]
    async fn fresh_hit_serves_cached_headers_and_body() {
        let (_dir, state) = test_state(&["docker.io"], 300);
        seed_object(
            &state,
            "docker.io/library/ubuntu/manifests/latest",
            "application/vnd.docker.distribution.manifest.v2+json",
            "\"sha256:abc\"",
            b"manifest body",
        )
        .await;

        let resp = create_router(state)
            .oneshot(request("/v2/docker.io/library/ubuntu/manifests/latest"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/vnd.docker.distribution.manifest.v2+json"
        );
        assert_eq!(resp.headers().get(header::ETAG).unwrap(), "\"sha256:abc\"");
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"manifest body");
    }

    #[tokio::test]
    async fn fresh_hit_supports_range_requests() {
        let (_dir, state) = test_state(&["docker.io"], 300);
        seed_object(
            &state,
            "docker.io/library/ubuntu/blobs/sha256:aa",
            "application/octet-stream",
            "\"sha256:aa\"",
            b"0123456789",
        )
        .await;

        let req = Request::builder()
            .uri("/v2/docker.io/library/ubuntu/blobs/sha256:aa")
            .header(header::RANGE, "bytes=2-5")
            .body(Body::empty())
            .unwrap();
        let resp = create_router(state).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"2345");
    }

    #[tokio::test]
    async fn stale_object_is_served_when_upstream_is_down() {
        // The alias passes through, so the upstream host is a closed local
        // port and the preflight fails immediately.
        let (_dir, state) = test_state(&["127.0.0.1:1"], 0);
        seed_object(
            &state,
            "127.0.0.1:1/library/thing/manifests/latest",
            "application/vnd.oci.image.manifest.v1+json",
            "\"sha256:stale\"",
            b"stale but served",
        )
        .await;

        let resp = create_router(state)
            .oneshot(request("/v2/127.0.0.1:1/library/thing/manifests/latest"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::ETAG).unwrap(),
            "\"sha256:stale\""
        );
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"stale but served");
    }

    #[tokio::test]
    async fn cold_miss_with_unreachable_upstream_is_bad_gateway() {
        let (_dir, state) = test_state(&["127.0.0.1:1"], 300);
        let resp = create_router(state)
            .oneshot(request("/v2/127.0.0.1:1/library/thing/manifests/latest"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn metrics_endpoint_reports_cache_gauges() {
        let (_dir, state) = test_state(&["docker.io"], 300);
        seed_object(&state, "docker.io/x/blobs/sha256:bb", "text/plain", "", b"12345").await;

        let resp = create_router(state)
            .oneshot(request("/metrics"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("cachistry_cache_used_bytes 5"));
        assert!(text.contains("cachistry_cache_objects 1"));
    }
}
