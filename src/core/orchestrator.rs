//! 统一执行路径
//!
//! 节拍触发、提及触发和控制接口触发的运行都经过 [`Orchestrator`]：每类工作流一把互斥闸门，
//! 所有运行共享同一个配额账本，结果写入有界运行历史。

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::adapters::{GenerativeText, PlatformQuota, VideoPlatform};
use crate::config::{EngineConfig, SchedulerConfig};
use crate::core::EngineError;
use crate::model::{CatalogItem, PublishedVideo};
use crate::quota::{Clock, QuotaKind, QuotaLedger, QuotaStatus};
use crate::store::EntityStore;
use crate::workflow::{
    bounded, CommentExecutor, RecoveryReport, RunHistory, RunTrigger, UploadExecutor,
    WorkflowKind, WorkflowRun,
};

/// 一次运行请求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunRequest {
    Upload { limit: usize },
    Comments { video_limit: usize, reply_limit: usize },
}

impl RunRequest {
    pub fn kind(&self) -> WorkflowKind {
        match self {
            RunRequest::Upload { .. } => WorkflowKind::Upload,
            RunRequest::Comments { .. } => WorkflowKind::Comments,
        }
    }

    /// 节拍触发时使用的默认上限
    pub fn cadence(kind: WorkflowKind, config: &SchedulerConfig) -> Self {
        match kind {
            WorkflowKind::Upload => RunRequest::Upload {
                limit: config.upload_limit,
            },
            WorkflowKind::Comments => RunRequest::Comments {
                video_limit: config.video_limit,
                reply_limit: config.reply_limit,
            },
        }
    }
}

/// get_status 的返回
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    /// 最近的运行，新的在前
    pub last_runs: Vec<WorkflowRun>,
    pub running: Vec<WorkflowRun>,
    pub quota: Vec<QuotaStatus>,
}

/// 本地账本与平台报告的配额
#[derive(Debug, Clone, Serialize)]
pub struct QuotaReport {
    pub ledger: Vec<QuotaStatus>,
    pub platform: Option<PlatformQuota>,
    pub platform_error: Option<String>,
}

pub struct Orchestrator {
    config: SchedulerConfig,
    uploads: UploadExecutor,
    comments: CommentExecutor,
    ledger: Arc<QuotaLedger>,
    store: Arc<dyn EntityStore>,
    platform: Arc<dyn VideoPlatform>,
    history: RunHistory,
    upload_gate: Arc<Mutex<()>>,
    comment_gate: Arc<Mutex<()>>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        config: &EngineConfig,
        store: Arc<dyn EntityStore>,
        platform: Arc<dyn VideoPlatform>,
        generator: Arc<dyn GenerativeText>,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Self {
        let ledger = Arc::new(QuotaLedger::new(config.quotas.clone(), clock));
        let scheduler = &config.scheduler;
        let uploads = UploadExecutor::new(
            store.clone(),
            platform.clone(),
            generator.clone(),
            ledger.clone(),
            config.retry.clone(),
            scheduler.call_timeout,
        );
        let comments = CommentExecutor::new(
            store.clone(),
            platform.clone(),
            generator,
            ledger.clone(),
            scheduler.call_timeout,
            scheduler.max_comments_per_video,
        );
        Self {
            config: scheduler.clone(),
            uploads,
            comments,
            ledger,
            store,
            platform,
            history: RunHistory::new(scheduler.history_size),
            upload_gate: Arc::new(Mutex::new(())),
            comment_gate: Arc::new(Mutex::new(())),
            cancel,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<QuotaLedger> {
        &self.ledger
    }

    pub fn history(&self) -> &RunHistory {
        &self.history
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn gate(&self, kind: WorkflowKind) -> Arc<Mutex<()>> {
        match kind {
            WorkflowKind::Upload => self.upload_gate.clone(),
            WorkflowKind::Comments => self.comment_gate.clone(),
        }
    }

    /// 排队等待同类运行结束后执行（FIFO）
    pub async fn execute(
        &self,
        run_id: String,
        request: RunRequest,
        trigger: RunTrigger,
    ) -> WorkflowRun {
        let guard = self.gate(request.kind()).lock_owned().await;
        self.execute_locked(guard, run_id, request, trigger).await
    }

    /// 在已持有闸门的情况下执行；返回时释放闸门
    pub async fn execute_locked(
        &self,
        _guard: OwnedMutexGuard<()>,
        run_id: String,
        request: RunRequest,
        trigger: RunTrigger,
    ) -> WorkflowRun {
        let run = self.history.begin(&run_id, request.kind(), trigger).await;
        tracing::info!(run_id = %run_id, kind = %request.kind(), "Workflow run started");

        let result = match request {
            RunRequest::Upload { limit } => self.uploads.run(limit, &self.cancel).await,
            RunRequest::Comments {
                video_limit,
                reply_limit,
            } => {
                self.comments
                    .run(video_limit, reply_limit, &self.cancel)
                    .await
            }
        };

        let run = self.history.finish(run, &result).await;
        tracing::info!(
            run_id = %run.id,
            outcome = ?run.outcome,
            "Workflow run finished: {}",
            run.summary.as_deref().unwrap_or_default()
        );
        run
    }

    /// 启动时恢复上次中断的条目
    pub async fn recover(&self) -> Result<RecoveryReport, EngineError> {
        self.uploads.recover_interrupted().await
    }

    pub async fn status(&self) -> EngineStatus {
        EngineStatus {
            last_runs: self.history.recent(self.config.history_size).await,
            running: self.history.running().await,
            quota: self.ledger.snapshot(),
        }
    }

    /// 查询平台配额并据此收紧本地上传预算
    pub async fn query_quota(&self) -> QuotaReport {
        let (platform, platform_error) = match bounded(
            self.config.call_timeout,
            "query_quota",
            self.platform.query_quota(),
        )
        .await
        {
            Ok(q) => {
                self.ledger.sync_remaining(QuotaKind::UploadUnits, q.remaining);
                (Some(q), None)
            }
            Err(e) => {
                tracing::warn!("Platform quota query failed: {}", e);
                (None, Some(e.to_string()))
            }
        };
        QuotaReport {
            ledger: self.ledger.snapshot(),
            platform,
            platform_error,
        }
    }

    pub async fn list_pending(&self, limit: usize) -> Result<Vec<CatalogItem>, EngineError> {
        self.store.list_pending(limit).await
    }

    pub async fn list_videos(&self, limit: usize) -> Result<Vec<PublishedVideo>, EngineError> {
        self.store.list_videos(limit).await
    }
}
