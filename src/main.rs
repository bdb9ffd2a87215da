//! Angus - 音乐发布工作流编排引擎
//!
//! 入口：加载配置、打开存储、启动调度循环与消息中介，收到关闭信号后依次清理。
//! 平台与消息通道目前使用 Mock 实现；设置 OPENAI_API_KEY 时生成式文本走 OpenAI 兼容接口。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use angus::adapters::{GenerativeText, MockChannel, MockGenerator, MockPlatform, OpenAiGenerator};
use angus::core::{Orchestrator, SchedulerLoop, ShutdownPlan, ShutdownSignal};
use angus::quota::SystemClock;
use angus::store::EntityStore;
use angus::{load_config, observability, MessageMediator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::var("ANGUS_CONFIG").ok().map(PathBuf::from);
    let app_config = load_config(config_path).context("Failed to load config")?;
    let engine_config = app_config.engine_config();

    #[cfg(feature = "async-sqlite")]
    let store: Arc<dyn EntityStore> = {
        let path = app_config.storage.database_path();
        let store = angus::store::SqliteStore::open(&path)
            .await
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        tracing::info!("Using SQLite store at {}", path.display());
        Arc::new(store)
    };
    #[cfg(not(feature = "async-sqlite"))]
    let store: Arc<dyn EntityStore> = Arc::new(angus::store::MemoryStore::new());

    let generator: Arc<dyn GenerativeText> = if std::env::var("OPENAI_API_KEY").is_ok() {
        tracing::info!("Using OpenAI-compatible model {}", app_config.llm.model);
        Arc::new(OpenAiGenerator::from_config(&app_config.llm))
    } else {
        tracing::warn!("OPENAI_API_KEY not set, using mock generator");
        Arc::new(MockGenerator::new())
    };
    let platform = Arc::new(MockPlatform::new());
    let channel = Arc::new(MockChannel::new());

    let shutdown = Arc::new(ShutdownSignal::new());
    shutdown.listen_for_signals();

    let orchestrator = Arc::new(Orchestrator::new(
        &engine_config,
        store.clone(),
        platform,
        generator.clone(),
        Arc::new(SystemClock),
        shutdown.token(),
    ));
    let (scheduler, control) = SchedulerLoop::new(orchestrator);
    let scheduler_task = tokio::spawn(scheduler.run());

    let mut plan = ShutdownPlan::new().scheduler(scheduler_task).store(store);

    if app_config.mediator.enabled {
        let mediator = MessageMediator::new(engine_config.mediator.clone(), channel, generator, control);
        let token = shutdown.token();
        plan = plan.mediator(tokio::spawn(async move { mediator.run(token).await }));
    }

    tracing::info!(agent = %app_config.agent.id, "Angus started, press Ctrl+C to stop");
    shutdown.triggered().await;
    plan.execute().await;

    Ok(())
}
