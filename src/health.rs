use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::AppState;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub cache_dir: CheckResult,
    pub quota: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn healthy_with(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: Some(detail.into()),
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

fn check_cache_dir(state: &AppState) -> CheckResult {
    let dir = &state.config.cache_dir;
    if dir.is_dir() {
        CheckResult::healthy()
    } else {
        CheckResult::unhealthy(format!("cache dir missing: {}", dir.display()))
    }
}

fn check_quota(state: &AppState) -> CheckResult {
    let used = state.cache.used_bytes();
    let max = state.cache.max_bytes();
    let pct = if max > 0 {
        used as f64 / max as f64 * 100.0
    } else {
        0.0
    };
    // A single oversize object may legitimately exceed the quota; that is a
    // degraded state, not a failure.
    if used > max {
        CheckResult::unhealthy(format!("used {used} exceeds quota {max} ({pct:.1}%)"))
    } else {
        CheckResult::healthy_with(format!("used {used} / {max} ({pct:.1}%)"))
    }
}

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    if !checks.cache_dir.ok {
        HealthStatus::Unhealthy
    } else if !checks.quota.ok {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler. Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let checks = HealthChecks {
        cache_dir: check_cache_dir(&state),
        quota: check_quota(&state),
    };
    let status = aggregate_status(&checks);
    let body = HealthResponse { status, checks };

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degraded_quota_keeps_overall_ok() {
        let checks = HealthChecks {
            cache_dir: CheckResult::healthy(),
            quota: CheckResult::unhealthy("over quota"),
        };
        assert_eq!(aggregate_status(&checks), HealthStatus::Degraded);
    }

    #[test]
    fn missing_cache_dir_is_unhealthy() {
        let checks = HealthChecks {
            cache_dir: CheckResult::unhealthy("gone"),
            quota: CheckResult::healthy(),
        };
        assert_eq!(aggregate_status(&checks), HealthStatus::Unhealthy);
    }
}
