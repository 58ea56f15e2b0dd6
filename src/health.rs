use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::factory::{FactoryStats, Phase, ResourceFactory};
use crate::git::BareRepoBuilder;
use crate::lifecycle::{ContextState, ExecutionContext};

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
    pub factory: FactoryStats,
    pub context: ContextState,
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
    pub repos_path: CheckResult,
    pub factory: CheckResult,
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

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state expected by the handler
// ---------------------------------------------------------------------------

/// Subset of `AppState` required by the health-check handler.
#[derive(Clone)]
pub struct HealthState {
    pub repos_path: PathBuf,
    pub factory: Arc<ResourceFactory<BareRepoBuilder>>,
    pub context: Arc<ExecutionContext>,
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

async fn check_repos_path(path: &Path) -> CheckResult {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => CheckResult::healthy(),
        Ok(_) => CheckResult::unhealthy(format!("{} is not a directory", path.display())),
        Err(e) => CheckResult::unhealthy(format!("{}: {e}", path.display())),
    }
}

fn check_factory(stats: &FactoryStats) -> CheckResult {
    match stats.phase {
        Phase::Shutdown => CheckResult::unhealthy("resource factory is shut down"),
        Phase::Invalidating => CheckResult {
            ok: true,
            detail: Some("invalidation in progress".to_string()),
        },
        Phase::Uninitialized | Phase::Active => CheckResult::healthy(),
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    if !checks.factory.ok {
        // Nothing can be served without the factory.
        HealthStatus::Unhealthy
    } else if !checks.repos_path.ok {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let factory = state.factory.stats().await;
    let checks = HealthChecks {
        repos_path: check_repos_path(&state.repos_path).await,
        factory: check_factory(&factory),
    };
    let status = aggregate_status(&checks);
    let body = HealthResponse {
        status,
        checks,
        factory,
        context: state.context.state(),
    };

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}
