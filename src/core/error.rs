//! 引擎错误类型与外部调用错误
//!
//! 实体级错误（单个条目/评论）记录在实体上，不会中断整轮运行；运行级错误（如数据库不可达）
//! 结束当前 WorkflowRun，调度循环在下一个节拍继续。

use thiserror::Error;

use crate::model::PipelineState;
use crate::quota::QuotaKind;
use crate::retry::ErrorClass;

/// 外部协作方（平台、生成式文本、消息通道）返回的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExternalError {
    /// 平台配额耗尽（如上传次数上限）
    #[error("Quota exceeded: {0}")]
    Quota(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    /// 输入非法、源地址过期等，重试无意义
    #[error("Permanent failure: {0}")]
    Permanent(String),
}

impl ExternalError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ExternalError::Quota(_) | ExternalError::RateLimited(_) => ErrorClass::RateLimited,
            ExternalError::Transient(_) => ErrorClass::Transient,
            ExternalError::Permanent(_) => ErrorClass::Permanent,
        }
    }

    /// 对端明确拒绝：调用没有产生远端效果，预留的配额可以归还
    pub fn rejected_without_effect(&self) -> bool {
        !matches!(self, ExternalError::Transient(_))
    }

    pub fn is_quota(&self) -> bool {
        matches!(self, ExternalError::Quota(_))
    }
}

/// 引擎错误
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// 本轮不再选取新实体，不致命
    #[error("Quota exhausted: {0}")]
    QuotaExhausted(QuotaKind),

    #[error("Transient external error: {0}")]
    TransientExternal(String),

    #[error("Permanent validation error: {0}")]
    PermanentValidation(String),

    /// 消息通道不可用，中介退避后继续轮询
    #[error("Channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// 实体记录的状态不是可识别的值：只对该实体致命，留待人工处理
    #[error("Corrupt state for {entity}: {value:?}")]
    CorruptState { entity: String, value: String },

    #[error("Invalid transition for {entity}: {from} -> {to}")]
    InvalidTransition {
        entity: String,
        from: PipelineState,
        to: PipelineState,
    },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Engine is shutting down")]
    ShuttingDown,
}

impl EngineError {
    /// 只影响单个实体的错误；其余错误中止整轮运行
    pub fn is_entity_scoped(&self) -> bool {
        matches!(
            self,
            EngineError::TransientExternal(_)
                | EngineError::PermanentValidation(_)
                | EngineError::CorruptState { .. }
                | EngineError::InvalidTransition { .. }
        )
    }
}

impl From<ExternalError> for EngineError {
    fn from(err: ExternalError) -> Self {
        match err {
            ExternalError::Quota(msg) | ExternalError::RateLimited(msg) | ExternalError::Transient(msg) => {
                EngineError::TransientExternal(msg)
            }
            ExternalError::Permanent(msg) => EngineError::PermanentValidation(msg),
        }
    }
}

#[cfg(feature = "async-sqlite")]
impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Store(err.to_string())
    }
}
