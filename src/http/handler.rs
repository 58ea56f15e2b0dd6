//! Main axum router and HTTP request handlers for the packgate server.
//!
//! Routes:
//! - `GET  /{*path}/info/refs?service=git-upload-pack` - Ref advertisement
//! - `POST /{*path}/git-upload-pack`                   - Pack negotiation / data transfer
//! - `*    /{*path}/git-receive-pack`                  - Always rejected (403)
//! - `GET  /healthz`                                   - Health check
//! - `GET  /metrics`                                   - Prometheus metrics
//! - `POST /admin/refresh`                             - Fire a context refresh
//!
//! Any number of path segments may precede the `<name>.git` segment.

use std::sync::Arc;

use anyhow::Context as _;
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, instrument, warn};

use crate::error::FactoryError;
use crate::git::RepositoryHandle;
use crate::metrics::ServiceLabels;
use crate::resolver::{resolve, split_service_path, RepositoryIdentifier};
use crate::AppState;

use super::pktline;

const UPLOAD_PACK: &str = "git-upload-pack";
const RECEIVE_PACK: &str = "git-receive-pack";

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health, metrics, admin
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .route("/admin/refresh", post(handle_refresh))
        // Git smart HTTP protocol endpoints
        .route("/{*path}", get(handle_git_get).post(handle_git_post))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query parameter types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct InfoRefsQuery {
    service: Option<String>,
}

#[derive(Debug, Serialize)]
struct RefreshResponse {
    epoch: u64,
    notified: usize,
}

// ---------------------------------------------------------------------------
// Git handlers
// ---------------------------------------------------------------------------

/// `GET /{*path}/info/refs?service=git-upload-pack`
///
/// Resolves the repository, rejects pushes, and returns the ref
/// advertisement from a local `git upload-pack --advertise-refs`.
#[instrument(skip(state), fields(%path))]
async fn handle_git_get(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    Query(query): Query<InfoRefsQuery>,
) -> Result<Response, AppError> {
    let (_, rest) = split_service_path(&path)
        .ok_or_else(|| AppError::Factory(FactoryError::invalid_identifier(Some(&path))))?;
    if rest != "info/refs" {
        return Ok(not_found(&path));
    }

    let service = query.service.unwrap_or_default();
    if service == RECEIVE_PACK {
        return Ok(reject_push(&path));
    }
    if service != UPLOAD_PACK {
        return Ok((
            StatusCode::BAD_REQUEST,
            format!("Unsupported service: {service:?} (dumb HTTP is not served)"),
        )
            .into_response());
    }
    if !state.config().services.upload_pack {
        return Ok(service_disabled());
    }

    count_request(&state, "info-refs");
    let handle = open_repository(&state, &path).await?;

    let refs = crate::git::advertise_refs(handle.path()).await?;
    let body = pktline::advertisement(UPLOAD_PACK, &refs);
    debug!(repo = %handle.id(), bytes = body.len(), "serving ref advertisement");

    Ok((
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                "application/x-git-upload-pack-advertisement",
            ),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}

/// `POST /{*path}/git-upload-pack`
///
/// Runs a local `git upload-pack --stateless-rpc` against the cached
/// repository handle and streams its output back.
#[instrument(skip(state, headers, body), fields(%path))]
async fn handle_git_post(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let (_, rest) = split_service_path(&path)
        .ok_or_else(|| AppError::Factory(FactoryError::invalid_identifier(Some(&path))))?;

    match rest {
        UPLOAD_PACK => {}
        RECEIVE_PACK => return Ok(reject_push(&path)),
        _ => return Ok(not_found(&path)),
    }
    if !state.config().services.upload_pack {
        return Ok(service_disabled());
    }
    if is_compressed(&headers) {
        return Ok((
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Compressed request bodies are not supported",
        )
            .into_response());
    }

    count_request(&state, UPLOAD_PACK);
    let handle = open_repository(&state, &path).await?;
    info!(repo = %handle.id(), request_bytes = body.len(), "serving upload-pack");

    serve_upload_pack(&handle, body).await
}

// ---------------------------------------------------------------------------
// Service handlers
// ---------------------------------------------------------------------------

/// `GET /healthz`
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health_state = crate::health::HealthState {
        repos_path: state.config().storage.repos_path,
        factory: Arc::clone(&state.factory),
        context: Arc::clone(&state.context),
    };
    crate::health::health_handler(State(health_state)).await
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the server.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let text = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        text,
    )
        .into_response())
}

/// `POST /admin/refresh`
///
/// Reloads the configuration file and fires one context refresh event,
/// exactly like SIGHUP.
#[instrument(skip(state))]
async fn handle_refresh(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let notified = state.reload().await?;
    let epoch = state.context.state().epoch;
    Ok((StatusCode::OK, Json(RefreshResponse { epoch, notified })).into_response())
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Resolve `path` to a repository and fetch its handle from the factory.
///
/// A handle released between the cache lookup and this check (evicted or
/// invalidated by a concurrent request) is traded for a fresh one once.
async fn open_repository(
    state: &AppState,
    path: &str,
) -> Result<Arc<RepositoryHandle>, AppError> {
    let id: RepositoryIdentifier = resolve(Some(path))?;
    let handle = state.factory.get(&id).await?;
    if !handle.is_released() {
        return Ok(handle);
    }

    debug!(repo = %id, age = ?handle.age(), "handle released before use; reopening");
    Ok(state.factory.get(&id).await?)
}

fn count_request(state: &AppState, service: &str) {
    state
        .metrics
        .metrics
        .requests
        .get_or_create(&ServiceLabels {
            service: service.to_string(),
        })
        .inc();
}

fn is_compressed(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| !v.eq_ignore_ascii_case("identity"))
}

fn reject_push(path: &str) -> Response {
    warn!(%path, "rejected git-receive-pack (push)");
    (
        StatusCode::FORBIDDEN,
        "Push (git-receive-pack) is not supported; this server is read-only.",
    )
        .into_response()
}

fn service_disabled() -> Response {
    (
        StatusCode::FORBIDDEN,
        "git-upload-pack is disabled on this server",
    )
        .into_response()
}

fn not_found(path: &str) -> Response {
    debug!(%path, "no git service at path");
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

/// Run a local `git upload-pack` process and stream its output as the HTTP
/// response body.
async fn serve_upload_pack(
    handle: &RepositoryHandle,
    request_body: Bytes,
) -> Result<Response, AppError> {
    let mut child = crate::git::upload_pack_streamed(handle.path())?;

    let mut stdin = child
        .stdin
        .take()
        .context("failed to capture git upload-pack stdin")?;
    let stdout = child
        .stdout
        .take()
        .context("failed to capture git upload-pack stdout")?;

    // Feed the request in the background so a large negotiation cannot
    // deadlock against a full stdout pipe.  Dropping stdin signals EOF.
    tokio::spawn(async move {
        if let Err(e) = stdin.write_all(&request_body).await {
            warn!(error = %e, "failed to write request to git upload-pack");
        }
    });

    let body = Body::from_stream(ReaderStream::new(stdout));

    // Reap the child in the background so we don't leak processes.
    let repo = handle.id().clone();
    tokio::spawn(async move {
        match child.wait_with_output().await {
            Ok(output) if !output.status.success() => {
                warn!(
                    %repo,
                    status = %output.status,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "git upload-pack exited with non-zero status"
                );
            }
            Err(e) => {
                error!(%repo, error = %e, "failed to wait on git upload-pack");
            }
            _ => {}
        }
    });

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/x-git-upload-pack-result"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Resolving or building the repository failed.
    Factory(FactoryError),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Factory(err) => factory_error_response(err),
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {err:#}"),
                )
                    .into_response()
            }
        }
    }
}

fn factory_error_response(err: FactoryError) -> Response {
    match err {
        FactoryError::InvalidIdentifier { ref path } => {
            debug!(%path, "no repository in request path");
            (StatusCode::NOT_FOUND, err.to_string()).into_response()
        }
        FactoryError::ConstructionTimeout { ref repo, timeout } => {
            warn!(%repo, ?timeout, "repository open timed out");
            let retry_after = timeout.as_secs().max(1).to_string();
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [(header::RETRY_AFTER, retry_after)],
                err.to_string(),
            )
                .into_response()
        }
        FactoryError::ConstructionFailure {
            ref repo,
            not_found: true,
            ..
        } => {
            debug!(%repo, "repository does not exist");
            (StatusCode::NOT_FOUND, err.to_string()).into_response()
        }
        FactoryError::ConstructionFailure { .. } | FactoryError::Closed => {
            error!(error = %err, "repository unavailable");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

impl From<FactoryError> for AppError {
    fn from(err: FactoryError) -> Self {
        AppError::Factory(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::to_bytes;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::config::parse_config;
    use crate::git::bare_repo::tests::fake_bare_repo;

    async fn test_state(repos: &std::path::Path, upload_pack: bool) -> Arc<AppState> {
        let yaml = format!(
            "storage:\n  repos_path: {}\nservices:\n  upload_pack: {upload_pack}\n",
            repos.display()
        );
        let config = parse_config(&yaml).unwrap();
        Arc::new(
            AppState::new(repos.join("config.yaml"), config)
                .await
                .unwrap(),
        )
    }

    async fn send(state: Arc<AppState>, req: Request<Body>) -> (StatusCode, HeaderMap, String) {
        let resp = create_router(state).oneshot(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, headers, String::from_utf8_lossy(&body).into_owned())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    fn post(uri: &str) -> Request<Body> {
        Request::post(uri).body(Body::from("0000")).unwrap()
    }

    #[tokio::test]
    async fn path_without_repository_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path(), true).await;

        let (status, _, body) = send(state, get("/org/widgets/info/refs?service=git-upload-pack")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.contains("no repository identifier"));
    }

    #[tokio::test]
    async fn missing_repository_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path(), true).await;

        let (status, _, body) = send(
            Arc::clone(&state),
            get("/org/ghost.git/info/refs?service=git-upload-pack"),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.contains("ghost.git"));
        assert_eq!(state.factory.stats().await.cached, 0);
    }

    #[tokio::test]
    async fn push_is_forbidden() {
        let tmp = tempfile::tempdir().unwrap();
        fake_bare_repo(&tmp.path().join("widgets.git"));
        let state = test_state(tmp.path(), true).await;

        let (status, _, _) = send(
            Arc::clone(&state),
            get("/widgets.git/info/refs?service=git-receive-pack"),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _, _) = send(Arc::clone(&state), post("/widgets.git/git-receive-pack")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        // Rejected before the repository is opened.
        assert_eq!(state.factory.stats().await.cached, 0);
    }

    #[tokio::test]
    async fn dumb_http_is_bad_request() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path(), true).await;

        let (status, _, _) = send(state, get("/widgets.git/info/refs")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_service_path_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path(), true).await;

        let (status, _, _) = send(Arc::clone(&state), get("/widgets.git/HEAD")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _, _) = send(state, post("/widgets.git/objects")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn disabled_upload_pack_is_forbidden() {
        let tmp = tempfile::tempdir().unwrap();
        fake_bare_repo(&tmp.path().join("widgets.git"));
        let state = test_state(tmp.path(), false).await;

        let (status, _, body) = send(state, post("/widgets.git/git-upload-pack")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body.contains("disabled"));
    }

    #[tokio::test]
    async fn compressed_request_is_unsupported() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path(), true).await;

        let req = Request::post("/widgets.git/git-upload-pack")
            .header(header::CONTENT_ENCODING, "gzip")
            .body(Body::from("0000"))
            .unwrap();
        let (status, _, _) = send(state, req).await;
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn health_reports_factory_stats() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path(), true).await;

        let (status, _, body) = send(state, get("/healthz")).await;
        assert_eq!(status, StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["factory"]["phase"], "active");
        assert_eq!(json["factory"]["capacity"], 64);
        assert_eq!(json["context"]["epoch"], 0);
    }

    #[tokio::test]
    async fn metrics_are_exposed() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path(), true).await;
        send(
            Arc::clone(&state),
            get("/ghost.git/info/refs?service=git-upload-pack"),
        )
        .await;

        let (status, headers, body) = send(state, get("/metrics")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(headers[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("application/openmetrics-text"));
        assert!(body.contains("packgate_requests_total{service=\"info-refs\"} 1"));
        assert!(body.contains("packgate_cache_misses_total 1"));
    }

    #[tokio::test]
    async fn admin_refresh_bumps_epoch() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path(), true).await;
        std::fs::write(
            tmp.path().join("config.yaml"),
            format!("storage:\n  repos_path: {}\n", tmp.path().display()),
        )
        .unwrap();

        let (status, _, body) = send(Arc::clone(&state), post("/admin/refresh")).await;
        assert_eq!(status, StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["epoch"], 1);
        assert_eq!(json["notified"], 1);
        assert_eq!(state.factory.stats().await.generation, 1);
    }

    #[tokio::test]
    async fn admin_refresh_with_broken_config_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(tmp.path(), true).await;
        std::fs::write(tmp.path().join("config.yaml"), "cache: [").unwrap();

        let (status, _, _) = send(Arc::clone(&state), post("/admin/refresh")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(state.context.state().epoch, 0);
    }

    #[test]
    fn timeout_maps_to_retry_after() {
        let resp = AppError::Factory(FactoryError::ConstructionTimeout {
            repo: "widgets.git".into(),
            timeout: Duration::from_secs(30),
        })
        .into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.headers()[header::RETRY_AFTER], "30");
    }

    #[test]
    fn factory_errors_map_to_status_codes() {
        let status = |err| AppError::Factory(err).into_response().status();

        assert_eq!(
            status(FactoryError::invalid_identifier(None)),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status(FactoryError::ConstructionFailure {
                repo: "a.git".into(),
                reason: "gone".into(),
                not_found: true,
            }),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status(FactoryError::ConstructionFailure {
                repo: "a.git".into(),
                reason: "disk error".into(),
                not_found: false,
            }),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(status(FactoryError::Closed), StatusCode::INTERNAL_SERVER_ERROR);
    }

    fn git_init_bare(path: &std::path::Path) {
        let status = std::process::Command::new("git")
            .args(["init", "--bare", "--quiet"])
            .arg(path)
            .status()
            .unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn info_refs_advertises_and_caches_the_repository() {
        let tmp = tempfile::tempdir().unwrap();
        git_init_bare(&tmp.path().join("x.git"));
        let state = test_state(tmp.path(), true).await;

        let (status, headers, body) = send(
            Arc::clone(&state),
            get("/org/x.git/info/refs?service=git-upload-pack"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            headers[header::CONTENT_TYPE],
            "application/x-git-upload-pack-advertisement"
        );
        assert!(body.starts_with("001e# service=git-upload-pack\n0000"));

        let (status, _, _) = send(
            Arc::clone(&state),
            get("/mirror/x.git/info/refs?service=git-upload-pack"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let metrics = &state.metrics.metrics;
        let built = metrics
            .builds
            .get_or_create(&crate::metrics::BuildLabels {
                outcome: crate::metrics::BuildOutcome::Ok,
            })
            .get();
        assert_eq!(built, 1);
        assert_eq!(metrics.cache_hits.get(), 1);
        assert_eq!(state.factory.stats().await.cached, 1);
    }

    #[tokio::test]
    async fn upload_pack_streams_git_output() {
        let tmp = tempfile::tempdir().unwrap();
        git_init_bare(&tmp.path().join("x.git"));
        let state = test_state(tmp.path(), true).await;

        let (status, headers, _) = send(Arc::clone(&state), post("/x.git/git-upload-pack")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            headers[header::CONTENT_TYPE],
            "application/x-git-upload-pack-result"
        );
        assert_eq!(state.factory.stats().await.cached, 1);
    }

    #[tokio::test]
    async fn refresh_hands_out_a_fresh_handle() {
        let tmp = tempfile::tempdir().unwrap();
        fake_bare_repo(&tmp.path().join("widgets.git"));
        let state = test_state(tmp.path(), true).await;

        let before = open_repository(&state, "org/widgets.git/info/refs")
            .await
            .unwrap();
        state.factory.invalidate().await;
        assert!(before.is_released());

        let after = open_repository(&state, "org/widgets.git/info/refs")
            .await
            .unwrap();
        assert!(!after.is_released());
        assert!(!Arc::ptr_eq(&before, &after));
    }
}
