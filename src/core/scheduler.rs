//! 调度循环与控制接口
//!
//! 两个固定节拍分别触发上传与评论运行：闸门空闲则启动，否则跳过本次节拍。外部请求（控制接口、
//! 消息中介）经 mpsc 进入循环，在闸门上排队执行。取消后不再接收新请求，等待进行中的运行结束再返回。

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::core::orchestrator::{EngineStatus, Orchestrator, QuotaReport, RunRequest};
use crate::core::EngineError;
use crate::model::{CatalogItem, PublishedVideo};
use crate::workflow::run::new_run_id;
use crate::workflow::{RunTrigger, WorkflowKind, WorkflowRun};

/// 排队中的运行请求
pub struct QueuedRequest {
    pub run_id: String,
    pub request: RunRequest,
    pub trigger: RunTrigger,
    pub reply: oneshot::Sender<WorkflowRun>,
}

/// 控制接口：触发运行、查询状态
#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::UnboundedSender<QueuedRequest>,
    orchestrator: Arc<Orchestrator>,
}

impl ControlHandle {
    /// 提交请求，立即返回预分配的运行 id 与完成通知
    pub fn submit(
        &self,
        request: RunRequest,
        trigger: RunTrigger,
    ) -> Result<(String, oneshot::Receiver<WorkflowRun>), EngineError> {
        if self.orchestrator.cancel_token().is_cancelled() {
            return Err(EngineError::ShuttingDown);
        }
        let run_id = new_run_id();
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(QueuedRequest {
                run_id: run_id.clone(),
                request,
                trigger,
                reply,
            })
            .map_err(|_| EngineError::ShuttingDown)?;
        Ok((run_id, rx))
    }

    pub async fn trigger_upload(&self, limit: usize) -> Result<WorkflowRun, EngineError> {
        let (_, rx) = self.submit(RunRequest::Upload { limit }, RunTrigger::Control)?;
        rx.await.map_err(|_| EngineError::ShuttingDown)
    }

    pub async fn trigger_comment_processing(
        &self,
        video_limit: usize,
        reply_limit: usize,
    ) -> Result<WorkflowRun, EngineError> {
        let (_, rx) = self.submit(
            RunRequest::Comments {
                video_limit,
                reply_limit,
            },
            RunTrigger::Control,
        )?;
        rx.await.map_err(|_| EngineError::ShuttingDown)
    }

    pub async fn get_status(&self) -> EngineStatus {
        self.orchestrator.status().await
    }

    pub async fn query_quota(&self) -> QuotaReport {
        self.orchestrator.query_quota().await
    }

    pub async fn list_pending(&self, limit: usize) -> Result<Vec<CatalogItem>, EngineError> {
        self.orchestrator.list_pending(limit).await
    }

    pub async fn list_videos(&self, limit: usize) -> Result<Vec<PublishedVideo>, EngineError> {
        self.orchestrator.list_videos(limit).await
    }
}

pub struct SchedulerLoop {
    orchestrator: Arc<Orchestrator>,
    rx: mpsc::UnboundedReceiver<QueuedRequest>,
}

impl SchedulerLoop {
    pub fn new(orchestrator: Arc<Orchestrator>) -> (Self, ControlHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ControlHandle {
            tx,
            orchestrator: orchestrator.clone(),
        };
        (Self { orchestrator, rx }, handle)
    }

    /// 运行到取消为止；返回前等待所有进行中的运行结束
    pub async fn run(mut self) {
        let cancel = self.orchestrator.cancel_token();
        let config = self.orchestrator.config().clone();

        match self.orchestrator.recover().await {
            Ok(report) => {
                if !(report.requeued.is_empty() && report.abandoned.is_empty()) {
                    tracing::info!(
                        "Recovered interrupted items: {} requeued, {} abandoned",
                        report.requeued.len(),
                        report.abandoned.len()
                    );
                }
                if !report.corrupt.is_empty() {
                    tracing::error!("Items with unreadable state: {:?}", report.corrupt);
                }
            }
            Err(e) => tracing::error!("Startup recovery failed: {}", e),
        }

        let now = Instant::now();
        let (upload_start, comment_start) = if config.run_on_start {
            (now, now)
        } else {
            (now + config.upload_every, now + config.comment_every)
        };
        let mut upload_tick = interval_at(upload_start, config.upload_every);
        upload_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut comment_tick = interval_at(comment_start, config.comment_every);
        comment_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut runs: JoinSet<()> = JoinSet::new();
        tracing::info!(
            "Scheduler started (upload every {}s, comments every {}s)",
            config.upload_every.as_secs(),
            config.comment_every.as_secs()
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = upload_tick.tick() => self.on_tick(WorkflowKind::Upload, &mut runs),
                _ = comment_tick.tick() => self.on_tick(WorkflowKind::Comments, &mut runs),
                Some(queued) = self.rx.recv() => {
                    let orchestrator = self.orchestrator.clone();
                    runs.spawn(async move {
                        let run = orchestrator
                            .execute(queued.run_id, queued.request, queued.trigger)
                            .await;
                        let _ = queued.reply.send(run);
                    });
                }
                Some(joined) = runs.join_next(), if !runs.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!("Workflow run task failed: {}", e);
                    }
                }
            }
        }

        // 拒绝尚未开始的请求
        self.rx.close();
        while self.rx.try_recv().is_ok() {}

        tracing::info!("Scheduler stopping, waiting for {} in-flight runs", runs.len());
        while let Some(joined) = runs.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Workflow run task failed: {}", e);
            }
        }
        tracing::info!("Scheduler stopped");
    }

    /// 节拍：闸门空闲则启动，否则跳过
    fn on_tick(&self, kind: WorkflowKind, runs: &mut JoinSet<()>) {
        let gate = self.orchestrator.gate(kind);
        match gate.try_lock_owned() {
            Ok(guard) => {
                let orchestrator = self.orchestrator.clone();
                let request = RunRequest::cadence(kind, orchestrator.config());
                runs.spawn(async move {
                    orchestrator
                        .execute_locked(guard, new_run_id(), request, RunTrigger::Cadence)
                        .await;
                });
            }
            Err(_) => {
                tracing::info!("Previous {} run still in progress, skipping tick", kind);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;
    use tokio_util::sync::CancellationToken;

    use crate::adapters::{MockGenerator, MockPlatform};
    use crate::config::EngineConfig;
    use crate::quota::SystemClock;
    use crate::store::{EntityStore, MemoryStore};
    use crate::workflow::RunOutcome;

    fn engine(
        platform: Arc<MockPlatform>,
        store: Arc<MemoryStore>,
    ) -> (Arc<Orchestrator>, CancellationToken) {
        let cancel = CancellationToken::new();
        let orch = Arc::new(Orchestrator::new(
            &EngineConfig::default(),
            store,
            platform,
            Arc::new(MockGenerator::new()),
            Arc::new(SystemClock),
            cancel.clone(),
        ));
        (orch, cancel)
    }

    #[tokio::test]
    async fn test_control_trigger_runs_through_loop() {
        let store = Arc::new(MemoryStore::new());
        store
            .save_item(&CatalogItem::new("song-1", "s", Utc::now()))
            .await
            .unwrap();
        let (orch, cancel) = engine(Arc::new(MockPlatform::new()), store);
        let (scheduler, handle) = SchedulerLoop::new(orch);
        let task = tokio::spawn(scheduler.run());

        let run = handle.trigger_upload(5).await.unwrap();
        assert_eq!(run.outcome, Some(RunOutcome::Success));
        assert_eq!(run.trigger, RunTrigger::Control);

        cancel.cancel();
        task.await.unwrap();
        assert!(matches!(
            handle.trigger_upload(1).await,
            Err(EngineError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_same_kind_requests_are_serialized() {
        let store = Arc::new(MemoryStore::new());
        for id in ["a", "b"] {
            store
                .save_item(&CatalogItem::new(id, "s", Utc::now()))
                .await
                .unwrap();
        }
        let platform = Arc::new(MockPlatform::new().with_upload_delay(Duration::from_millis(50)));
        let (orch, cancel) = engine(platform.clone(), store);
        let (scheduler, handle) = SchedulerLoop::new(orch);
        let task = tokio::spawn(scheduler.run());

        let (first, second) = tokio::join!(handle.trigger_upload(2), handle.trigger_upload(2));
        let (first, second) = (first.unwrap(), second.unwrap());
        // 第二次运行在第一次结束之后才开始，不会重复上传
        let (earlier, later) = if first.started_at <= second.started_at {
            (first, second)
        } else {
            (second, first)
        };
        assert!(later.started_at >= earlier.finished_at.unwrap());
        assert_eq!(platform.upload_calls(), 2);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_tick_is_skipped_while_gate_is_held() {
        let (orch, _cancel) = engine(Arc::new(MockPlatform::new()), Arc::new(MemoryStore::new()));
        let gate = orch.gate(WorkflowKind::Upload);
        let _held = gate.lock().await;
        let (scheduler, _handle) = SchedulerLoop::new(orch.clone());

        let mut runs = JoinSet::new();
        scheduler.on_tick(WorkflowKind::Upload, &mut runs);
        assert!(runs.is_empty());

        scheduler.on_tick(WorkflowKind::Comments, &mut runs);
        assert_eq!(runs.len(), 1);
        while runs.join_next().await.is_some() {}
        assert_eq!(orch.history().recent(10).await.len(), 1);
    }
}
