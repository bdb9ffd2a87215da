//! 工作流执行器与运行记录
//!
//! - **upload**: 目录条目的 分析 → 元数据 → 上传 流水线
//! - **comment**: 已发布视频的评论分页、情感分析与回复
//! - **run**: WorkflowRun 记录与有界历史

pub mod comment;
pub mod run;
pub mod upload;

use std::future::Future;
use std::time::Duration;

use crate::core::ExternalError;

pub use comment::CommentExecutor;
pub use run::{
    EntityFailure, RunHistory, RunOutcome, RunResult, RunTrigger, WorkflowKind, WorkflowRun,
};
pub use upload::{RecoveryReport, UploadExecutor};

/// 为外部调用加超时；超时视为暂时性错误
pub(crate) async fn bounded<T, F>(timeout: Duration, op: &str, fut: F) -> Result<T, ExternalError>
where
    F: Future<Output = Result<T, ExternalError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ExternalError::Transient(format!(
            "{op} timed out after {}s",
            timeout.as_secs_f64()
        ))),
    }
}
