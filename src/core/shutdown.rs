//! 有序关闭
//!
//! 关闭信号（Ctrl+C / SIGTERM / 致命错误）取消引擎共享的 CancellationToken，执行器完成当前实体后停止选取。
//! 随后 [`ShutdownPlan`] 按固定顺序收尾：
//!
//! 1. 调度循环：等待进行中的运行结束，排队的请求以 ShuttingDown 拒绝
//! 2. 消息中介：运行结束后线程才能发出最后的回复
//! 3. 存储：前两个阶段都不再写入后关闭连接
//!
//! 顺序由阶段决定而不是由注册顺序决定。每个阶段有超时，超时的任务被中止，后续阶段照常执行。

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::store::EntityStore;

const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    FatalError(String),
}

/// 关闭信号：共享的取消 token 加上第一次请求关闭的原因
pub struct ShutdownSignal {
    token: CancellationToken,
    reason: watch::Sender<Option<ShutdownReason>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    pub fn with_token(token: CancellationToken) -> Self {
        let (reason, _) = watch::channel(None);
        Self { token, reason }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 请求关闭；只记录第一次的原因
    pub fn trigger(&self, reason: ShutdownReason) {
        let first = self.reason.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason.clone());
            true
        });
        if first {
            tracing::info!("Shutdown requested: {:?}", reason);
        } else {
            tracing::debug!("Shutdown already in progress, ignoring {:?}", reason);
        }
        self.token.cancel();
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.borrow().clone()
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn triggered(&self) {
        self.token.cancelled().await;
    }

    /// 监听 Ctrl+C 与 SIGTERM
    pub fn listen_for_signals(self: &Arc<Self>) {
        let signal = Arc::clone(self);
        tokio::spawn(async move {
            let reason = wait_for_os_signal().await;
            signal.trigger(reason);
        });
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_os_signal() -> ShutdownReason {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("Cannot listen for SIGTERM: {}", e);
            return wait_for_ctrl_c().await;
        }
    };
    tokio::select! {
        reason = wait_for_ctrl_c() => reason,
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, shutting down");
            ShutdownReason::Signal
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_os_signal() -> ShutdownReason {
    wait_for_ctrl_c().await
}

async fn wait_for_ctrl_c() -> ShutdownReason {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C, shutting down");
            ShutdownReason::UserInitiated
        }
        Err(e) => {
            tracing::error!("Ctrl+C handler failed: {}", e);
            ShutdownReason::FatalError(e.to_string())
        }
    }
}

/// 关闭阶段，按声明顺序执行
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownStage {
    Scheduler,
    Mediator,
    Store,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Completed,
    /// 没有注册该阶段
    Skipped,
    TimedOut,
    Failed(String),
}

/// 引擎的收尾计划
pub struct ShutdownPlan {
    scheduler: Option<JoinHandle<()>>,
    mediator: Option<JoinHandle<()>>,
    store: Option<Arc<dyn EntityStore>>,
    stage_timeout: Duration,
}

impl ShutdownPlan {
    pub fn new() -> Self {
        Self {
            scheduler: None,
            mediator: None,
            store: None,
            stage_timeout: DEFAULT_STAGE_TIMEOUT,
        }
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    pub fn scheduler(mut self, handle: JoinHandle<()>) -> Self {
        self.scheduler = Some(handle);
        self
    }

    pub fn mediator(mut self, handle: JoinHandle<()>) -> Self {
        self.mediator = Some(handle);
        self
    }

    pub fn store(mut self, store: Arc<dyn EntityStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 依次执行各阶段，返回每个阶段的结果
    pub async fn execute(self) -> Vec<(ShutdownStage, StageOutcome)> {
        let timeout = self.stage_timeout;
        let mut report = Vec::with_capacity(3);

        report.push((
            ShutdownStage::Scheduler,
            drain_task(ShutdownStage::Scheduler, self.scheduler, timeout).await,
        ));
        report.push((
            ShutdownStage::Mediator,
            drain_task(ShutdownStage::Mediator, self.mediator, timeout).await,
        ));

        let store_outcome = match self.store {
            None => StageOutcome::Skipped,
            Some(store) => match tokio::time::timeout(timeout, store.close()).await {
                Ok(()) => StageOutcome::Completed,
                Err(_) => StageOutcome::TimedOut,
            },
        };
        log_stage(ShutdownStage::Store, &store_outcome, timeout);
        report.push((ShutdownStage::Store, store_outcome));

        tracing::info!("Shutdown complete");
        report
    }
}

impl Default for ShutdownPlan {
    fn default() -> Self {
        Self::new()
    }
}

async fn drain_task(
    stage: ShutdownStage,
    handle: Option<JoinHandle<()>>,
    timeout: Duration,
) -> StageOutcome {
    let Some(mut handle) = handle else {
        return StageOutcome::Skipped;
    };
    let outcome = match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(())) => StageOutcome::Completed,
        Ok(Err(e)) => StageOutcome::Failed(e.to_string()),
        Err(_) => {
            handle.abort();
            StageOutcome::TimedOut
        }
    };
    log_stage(stage, &outcome, timeout);
    outcome
}

fn log_stage(stage: ShutdownStage, outcome: &StageOutcome, timeout: Duration) {
    match outcome {
        StageOutcome::Completed => tracing::info!("Shutdown stage {:?} completed", stage),
        StageOutcome::Skipped => tracing::debug!("Shutdown stage {:?} not registered", stage),
        StageOutcome::TimedOut => tracing::warn!(
            "Shutdown stage {:?} timed out after {}s",
            stage,
            timeout.as_secs_f64()
        ),
        StageOutcome::Failed(e) => tracing::warn!("Shutdown stage {:?} failed: {}", stage, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_first_reason_wins() {
        let token = CancellationToken::new();
        let signal = ShutdownSignal::with_token(token.clone());
        assert!(!signal.is_triggered());
        assert_eq!(signal.reason(), None);

        signal.trigger(ShutdownReason::Signal);
        signal.trigger(ShutdownReason::FatalError("store unreachable".into()));

        assert!(token.is_cancelled());
        assert_eq!(signal.reason(), Some(ShutdownReason::Signal));
    }

    fn worker(token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { token.cancelled().await })
    }

    #[tokio::test]
    async fn test_stages_follow_fixed_order_regardless_of_registration() {
        let signal = ShutdownSignal::new();
        let plan = ShutdownPlan::new()
            .store(Arc::new(MemoryStore::new()))
            .mediator(worker(signal.token()))
            .scheduler(worker(signal.token()));
        signal.trigger(ShutdownReason::UserInitiated);
        let report = plan.execute().await;

        assert_eq!(
            report,
            vec![
                (ShutdownStage::Scheduler, StageOutcome::Completed),
                (ShutdownStage::Mediator, StageOutcome::Completed),
                (ShutdownStage::Store, StageOutcome::Completed),
            ]
        );
    }

    #[tokio::test]
    async fn test_hung_stage_is_aborted_and_later_stages_still_run() {
        let signal = ShutdownSignal::new();
        let hung = tokio::spawn(std::future::pending::<()>());

        let plan = ShutdownPlan::new()
            .with_stage_timeout(Duration::from_millis(20))
            .mediator(hung)
            .store(Arc::new(MemoryStore::new()));
        signal.trigger(ShutdownReason::Signal);
        let report = plan.execute().await;

        assert_eq!(report[0], (ShutdownStage::Scheduler, StageOutcome::Skipped));
        assert_eq!(report[1], (ShutdownStage::Mediator, StageOutcome::TimedOut));
        assert_eq!(report[2], (ShutdownStage::Store, StageOutcome::Completed));
    }
}
