//! Angus - 音乐发布工作流编排引擎
//!
//! 模块划分：
//! - **adapters**: 视频平台、生成式文本、消息通道的 trait 与实现（OpenAI 兼容 / Mock）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 编排器、调度循环、错误类型、优雅关闭
//! - **mediator**: 消息中介（提及 → 意图 → 回复）
//! - **model**: 目录条目、已发布视频、评论及其状态
//! - **observability**: 日志初始化
//! - **quota**: 配额账本
//! - **retry**: 重试策略
//! - **store**: 实体状态存储（内存 / SQLite）
//! - **workflow**: 上传与评论执行器、运行记录

pub mod adapters;
pub mod config;
pub mod core;
pub mod mediator;
pub mod model;
pub mod observability;
pub mod quota;
pub mod retry;
pub mod store;
pub mod workflow;

pub use crate::config::{load_config, AppConfig, EngineConfig};
pub use crate::core::{ControlHandle, EngineError, Orchestrator, SchedulerLoop};
pub use crate::mediator::MessageMediator;
pub use crate::quota::{QuotaKind, QuotaLedger};
