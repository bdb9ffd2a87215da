//! Angus HTTP 控制面
//!
//! 启动: cargo run --bin angus-web --features web
//! 端口默认 8080，可通过 ANGUS_WEB_PORT 覆盖。
//!
//! - GET  /api/status
//! - GET  /api/quota
//! - GET  /api/pending?limit=10
//! - GET  /api/videos?limit=10
//! - POST /api/upload      { "limit": 5 }
//! - POST /api/comments    { "video_limit": 10, "reply_limit": 10 }

#![cfg(feature = "web")]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use angus::adapters::{GenerativeText, MockGenerator, MockPlatform, OpenAiGenerator};
use angus::core::orchestrator::{EngineStatus, QuotaReport};
use angus::core::{Orchestrator, SchedulerLoop, ShutdownPlan, ShutdownSignal};
use angus::mediator::MAX_REQUEST_LIMIT;
use angus::model::{CatalogItem, PublishedVideo};
use angus::quota::SystemClock;
use angus::store::EntityStore;
use angus::workflow::WorkflowRun;
use angus::{load_config, observability, ControlHandle, EngineError};

type ApiError = (StatusCode, String);

fn api_error(e: EngineError) -> ApiError {
    let status = match e {
        EngineError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct UploadRequest {
    limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct CommentsRequest {
    video_limit: Option<usize>,
    reply_limit: Option<usize>,
}

struct AppState {
    control: ControlHandle,
    upload_limit: usize,
    video_limit: usize,
    reply_limit: usize,
}

fn clamp_limit(requested: Option<usize>, default: usize) -> usize {
    requested.unwrap_or(default).clamp(1, MAX_REQUEST_LIMIT)
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(|| async { "OK" }))
        .route("/api/status", get(api_status))
        .route("/api/quota", get(api_quota))
        .route("/api/pending", get(api_pending))
        .route("/api/videos", get(api_videos))
        .route("/api/upload", post(api_upload))
        .route("/api/comments", post(api_comments))
        .with_state(state)
}

async fn api_status(State(state): State<Arc<AppState>>) -> Json<EngineStatus> {
    Json(state.control.get_status().await)
}

async fn api_quota(State(state): State<Arc<AppState>>) -> Json<QuotaReport> {
    Json(state.control.query_quota().await)
}

async fn api_pending(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<Vec<CatalogItem>>, ApiError> {
    let items = state
        .control
        .list_pending(clamp_limit(q.limit, 10))
        .await
        .map_err(api_error)?;
    Ok(Json(items))
}

async fn api_videos(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<Vec<PublishedVideo>>, ApiError> {
    let videos = state
        .control
        .list_videos(clamp_limit(q.limit, 10))
        .await
        .map_err(api_error)?;
    Ok(Json(videos))
}

/// POST /api/upload：排队一次上传运行并等待其结束
async fn api_upload(
    State(state): State<Arc<AppState>>,
    body: Option<Json<UploadRequest>>,
) -> Result<Json<WorkflowRun>, ApiError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let run = state
        .control
        .trigger_upload(clamp_limit(req.limit, state.upload_limit))
        .await
        .map_err(api_error)?;
    Ok(Json(run))
}

/// POST /api/comments：排队一次评论运行并等待其结束
async fn api_comments(
    State(state): State<Arc<AppState>>,
    body: Option<Json<CommentsRequest>>,
) -> Result<Json<WorkflowRun>, ApiError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let run = state
        .control
        .trigger_comment_processing(
            clamp_limit(req.video_limit, state.video_limit),
            clamp_limit(req.reply_limit, state.reply_limit),
        )
        .await
        .map_err(api_error)?;
    Ok(Json(run))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::var("ANGUS_CONFIG").ok().map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;
    let engine_config = cfg.engine_config();

    #[cfg(feature = "async-sqlite")]
    let store: Arc<dyn EntityStore> = Arc::new(
        angus::store::SqliteStore::open(cfg.storage.database_path())
            .await
            .context("Failed to open database")?,
    );
    #[cfg(not(feature = "async-sqlite"))]
    let store: Arc<dyn EntityStore> = Arc::new(angus::store::MemoryStore::new());

    let generator: Arc<dyn GenerativeText> = if std::env::var("OPENAI_API_KEY").is_ok() {
        Arc::new(OpenAiGenerator::from_config(&cfg.llm))
    } else {
        Arc::new(MockGenerator::new())
    };

    let shutdown = Arc::new(ShutdownSignal::new());
    shutdown.listen_for_signals();

    let orchestrator = Arc::new(Orchestrator::new(
        &engine_config,
        store.clone(),
        Arc::new(MockPlatform::new()),
        generator,
        Arc::new(SystemClock),
        shutdown.token(),
    ));
    let (scheduler, control) = SchedulerLoop::new(orchestrator);
    let scheduler_task = tokio::spawn(scheduler.run());

    let state = Arc::new(AppState {
        control,
        upload_limit: engine_config.scheduler.upload_limit,
        video_limit: engine_config.scheduler.video_limit,
        reply_limit: engine_config.scheduler.reply_limit,
    });

    let port = std::env::var("ANGUS_WEB_PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Angus control API: http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let token = shutdown.token();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;

    ShutdownPlan::new()
        .scheduler(scheduler_task)
        .store(store)
        .execute()
        .await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::Utc;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use angus::config::EngineConfig;

    async fn test_state() -> (Arc<AppState>, CancellationToken) {
        let store = Arc::new(angus::store::MemoryStore::new());
        store
            .save_item(&CatalogItem::new("song-1", "s3://bucket/song-1.mp3", Utc::now()))
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        let orchestrator = Arc::new(Orchestrator::new(
            &EngineConfig::default(),
            store,
            Arc::new(MockPlatform::new()),
            Arc::new(MockGenerator::new()),
            Arc::new(SystemClock),
            cancel.clone(),
        ));
        let (scheduler, control) = SchedulerLoop::new(orchestrator);
        tokio::spawn(scheduler.run());
        let state = Arc::new(AppState {
            control,
            upload_limit: 5,
            video_limit: 10,
            reply_limit: 10,
        });
        (state, cancel)
    }

    #[tokio::test]
    async fn test_pending_then_upload() {
        let (state, cancel) = test_state().await;

        let response = router(state.clone())
            .oneshot(Request::get("/api/pending").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let items: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(items.as_array().unwrap().len(), 1);

        let response = router(state)
            .oneshot(
                Request::post("/api/upload")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"limit":1}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let run: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(run["summary"], "1 of 1 uploaded");

        cancel.cancel();
    }

    #[test]
    fn test_limits_are_clamped() {
        assert_eq!(clamp_limit(None, 5), 5);
        assert_eq!(clamp_limit(Some(0), 5), 1);
        assert_eq!(clamp_limit(Some(500), 5), MAX_REQUEST_LIMIT);
    }
}
