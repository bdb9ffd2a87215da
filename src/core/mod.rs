//! 核心编排层：错误类型、统一执行路径、调度循环、优雅关闭

pub mod error;
pub mod orchestrator;
pub mod scheduler;
pub mod shutdown;

pub use error::{EngineError, ExternalError};
pub use orchestrator::{EngineStatus, Orchestrator, QuotaReport, RunRequest};
pub use scheduler::{ControlHandle, QueuedRequest, SchedulerLoop};
pub use shutdown::{ShutdownPlan, ShutdownReason, ShutdownSignal, ShutdownStage, StageOutcome};
