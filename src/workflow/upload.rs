//! 上传工作流执行器
//!
//! 每个条目：预留上传配额 → 内容分析 → 生成元数据 → 提交 uploading → 上传 → 提交 uploaded。
//! 每一步的状态都在下一个外部调用之前提交，崩溃后能从存储中判断上传是否可能已经发生。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::adapters::{GenerativeText, UploadRequest, VideoPlatform};
use crate::core::{EngineError, ExternalError};
use crate::model::{CatalogItem, PipelineState, PublishedVideo};
use crate::quota::{QuotaKind, QuotaLedger, Reservation};
use crate::retry::{ErrorClass, RetryContext, RetryDecision, RetryPolicy};
use crate::store::EntityStore;
use crate::workflow::{bounded, RunResult, WorkflowKind};

/// 单个条目处理中的失败
enum StepError {
    External(ExternalError),
    Engine(EngineError),
}

impl From<EngineError> for StepError {
    fn from(err: EngineError) -> Self {
        StepError::Engine(err)
    }
}

enum Flow {
    Continue,
    Stop,
}

/// 启动恢复的结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// 上传前中断，已转为 failed 等待重试
    pub requeued: Vec<String>,
    /// 上传中中断，上传可能已发生，转为 abandoned 留待人工核对
    pub abandoned: Vec<String>,
    /// 状态值无法识别的条目（未改动）
    pub corrupt: Vec<String>,
}

/// 源地址过期的上传失败不可重试
fn effective_class(err: &ExternalError) -> ErrorClass {
    let expired = err.to_string().to_lowercase().contains("expired");
    if expired {
        ErrorClass::Permanent
    } else {
        err.class()
    }
}

fn to_chrono(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(365))
}

pub struct UploadExecutor {
    store: Arc<dyn EntityStore>,
    platform: Arc<dyn VideoPlatform>,
    generator: Arc<dyn GenerativeText>,
    ledger: Arc<QuotaLedger>,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl UploadExecutor {
    pub fn new(
        store: Arc<dyn EntityStore>,
        platform: Arc<dyn VideoPlatform>,
        generator: Arc<dyn GenerativeText>,
        ledger: Arc<QuotaLedger>,
        retry: RetryPolicy,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            platform,
            generator,
            ledger,
            retry,
            call_timeout,
        }
    }

    /// 处理最多 limit 个 pending 条目；取消时完成当前条目后停止
    pub async fn run(&self, limit: usize, cancel: &CancellationToken) -> RunResult {
        let mut result = RunResult::new(WorkflowKind::Upload);
        if let Err(e) = self.execute(limit, cancel, &mut result).await {
            tracing::error!("Upload run aborted: {}", e);
            result.aborted = Some(e.to_string());
        }
        tracing::info!("Upload run finished: {}", result.summary());
        result
    }

    async fn execute(
        &self,
        limit: usize,
        cancel: &CancellationToken,
        result: &mut RunResult,
    ) -> Result<(), EngineError> {
        let reset = self.reset_due_retries().await?;
        if reset > 0 {
            tracing::info!("Reset {} failed items back to pending", reset);
        }

        let items = self.store.list_pending(limit).await?;
        result.selected = items.len();

        for item in items {
            if cancel.is_cancelled() {
                result.interrupted = true;
                break;
            }
            let reservation = self.ledger.reserve(QuotaKind::UploadUnits, 1);
            if !reservation.granted {
                tracing::info!(
                    item = %item.id,
                    "Upload quota exhausted, leaving remaining items pending"
                );
                result.quota_limited = true;
                break;
            }
            if let Flow::Stop = self.process_item(item, &reservation, result).await? {
                break;
            }
        }
        Ok(())
    }

    /// retry_at 已到的 failed 条目重置为 pending
    async fn reset_due_retries(&self) -> Result<usize, EngineError> {
        let now = Utc::now();
        let mut reset = 0;
        for mut item in self.store.list_retry_due(now).await? {
            match item.retry_reset(now) {
                Ok(()) => {
                    self.store.save_item(&item).await?;
                    reset += 1;
                }
                Err(e) => tracing::warn!("Skipping retry reset: {}", e),
            }
        }
        Ok(reset)
    }

    async fn process_item(
        &self,
        mut item: CatalogItem,
        reservation: &Reservation,
        result: &mut RunResult,
    ) -> Result<Flow, EngineError> {
        let id = item.id.clone();
        result.touch(&id);
        let mut upload_attempted = false;

        match self.advance(&mut item, &mut upload_attempted).await {
            Ok(publish_id) => {
                tracing::info!(item = %id, publish_id = %publish_id, "Item uploaded");
                result.succeeded += 1;
                Ok(Flow::Continue)
            }
            Err(StepError::External(err)) => {
                if !(upload_attempted && !err.rejected_without_effect()) {
                    self.ledger.release_reservation(reservation);
                }
                tracing::warn!(item = %id, state = %item.state, "Item step failed: {}", err);
                self.record_failure(&mut item, &err).await?;
                result.record_failure(&id, &err);
                if err.is_quota() {
                    result.quota_limited = true;
                    return Ok(Flow::Stop);
                }
                Ok(Flow::Continue)
            }
            Err(StepError::Engine(err)) if err.is_entity_scoped() => {
                if !upload_attempted {
                    self.ledger.release_reservation(reservation);
                }
                tracing::warn!(item = %id, "Item skipped: {}", err);
                result.record_failure(&id, &err);
                Ok(Flow::Continue)
            }
            Err(StepError::Engine(err)) => {
                if !upload_attempted {
                    self.ledger.release_reservation(reservation);
                }
                Err(err)
            }
        }
    }

    /// 推进一个条目直到 uploaded，返回发布 id
    async fn advance(
        &self,
        item: &mut CatalogItem,
        upload_attempted: &mut bool,
    ) -> Result<String, StepError> {
        item.transition(PipelineState::Analyzing, Utc::now())?;
        self.store.save_item(item).await?;

        let metadata = match item.metadata.clone() {
            Some(existing) => existing,
            None => {
                let analysis = bounded(
                    self.call_timeout,
                    "analyze_content",
                    self.generator.analyze_content(&item.source),
                )
                .await
                .map_err(StepError::External)?;
                let metadata = bounded(
                    self.call_timeout,
                    "generate_metadata",
                    self.generator
                        .generate_metadata(&analysis, item.style.as_deref()),
                )
                .await
                .map_err(StepError::External)?;
                item.metadata = Some(metadata.clone());
                metadata
            }
        };
        item.transition(PipelineState::MetadataReady, Utc::now())?;
        self.store.save_item(item).await?;

        item.transition(PipelineState::Uploading, Utc::now())?;
        self.store.save_item(item).await?;

        let request = UploadRequest {
            item_id: item.id.clone(),
            source: item.source.clone(),
            metadata,
        };
        *upload_attempted = true;
        let publish_id = bounded(self.call_timeout, "upload", self.platform.upload(&request))
            .await
            .map_err(StepError::External)?;

        let now = Utc::now();
        item.publish_id = Some(publish_id.clone());
        item.last_error = None;
        item.transition(PipelineState::Uploaded, now)?;
        self.store.save_item(item).await?;
        self.store
            .save_video(&PublishedVideo::from_item(item, &publish_id, now))
            .await?;
        Ok(publish_id)
    }

    /// 计一次失败并按重试策略转为 failed 或 abandoned
    async fn record_failure(
        &self,
        item: &mut CatalogItem,
        err: &ExternalError,
    ) -> Result<(), EngineError> {
        let now = Utc::now();
        item.attempts += 1;
        item.last_error = Some(err.to_string());

        let class = effective_class(err);
        let ctx = RetryContext {
            until_window_reset: match class {
                ErrorClass::RateLimited => self.ledger.until_reset(QuotaKind::UploadUnits),
                _ => None,
            },
            jitter: rand::random::<f64>(),
        };
        match self.retry.decide(item.attempts, class, ctx) {
            RetryDecision::Retry { delay } => {
                item.transition(PipelineState::Failed, now)?;
                item.retry_at = Some(now + to_chrono(delay));
                tracing::info!(
                    item = %item.id,
                    attempts = item.attempts,
                    delay_secs = delay.as_secs(),
                    "Item will be retried"
                );
            }
            RetryDecision::Abandon => {
                item.transition(PipelineState::Abandoned, now)?;
                item.retry_at = None;
                tracing::warn!(item = %item.id, attempts = item.attempts, "Item abandoned");
            }
        }
        self.store.save_item(item).await
    }

    /// 启动时处理上次进程留下的进行中条目
    pub async fn recover_interrupted(&self) -> Result<RecoveryReport, EngineError> {
        let mut report = RecoveryReport::default();
        let now = Utc::now();

        for entry in self.store.list_unsettled().await? {
            let mut item = match entry {
                Ok(item) => item,
                Err(EngineError::CorruptState { entity, value }) => {
                    tracing::error!(
                        item = %entity,
                        "Stored state {:?} is not recognised, leaving for manual review",
                        value
                    );
                    report.corrupt.push(entity);
                    continue;
                }
                Err(e) => return Err(e),
            };

            match item.state {
                PipelineState::Uploading => {
                    item.last_error =
                        Some("interrupted during upload, verify on the platform".to_string());
                    item.transition(PipelineState::Abandoned, now)?;
                    self.store.save_item(&item).await?;
                    tracing::warn!(item = %item.id, "Interrupted upload marked abandoned");
                    report.abandoned.push(item.id);
                }
                PipelineState::Analyzing | PipelineState::MetadataReady => {
                    item.last_error = Some("interrupted before upload".to_string());
                    item.transition(PipelineState::Failed, now)?;
                    item.retry_at = Some(now);
                    self.store.save_item(&item).await?;
                    tracing::info!(item = %item.id, "Interrupted item queued for retry");
                    report.requeued.push(item.id);
                }
                _ => {}
            }
        }
        Ok(report)
    }
}
