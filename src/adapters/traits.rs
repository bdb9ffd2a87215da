//! 外部协作方接口
//!
//! 视频平台、生成式文本、Agent 消息通道均为无内部状态机的 I/O 适配器；核心只通过这些 trait 访问。

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::ExternalError;
use crate::model::{ItemMetadata, RemoteComment, Sentiment};

/// 内容分析结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentAnalysis {
    pub themes: Vec<String>,
    pub genre: String,
    pub mood: String,
}

/// 上传请求
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub item_id: String,
    pub source: String,
    pub metadata: ItemMetadata,
}

/// 一页评论
#[derive(Debug, Clone, Default)]
pub struct CommentPage {
    pub items: Vec<RemoteComment>,
    /// 本页之后的位置；处理完整页后写回视频
    pub cursor: Option<String>,
    pub has_more: bool,
}

/// 平台报告的配额
#[derive(Debug, Clone, Serialize)]
pub struct PlatformQuota {
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

/// 生成回复时的上下文
#[derive(Debug, Clone)]
pub struct ReplyContext {
    pub title: String,
    pub style: Option<String>,
}

/// 通道上收到的提及
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mention {
    /// 消息 id（重复投递时相同）
    pub id: String,
    pub thread_id: String,
    pub sender: String,
    pub content: String,
}

/// 视频平台
#[async_trait]
pub trait VideoPlatform: Send + Sync {
    /// 上传并返回发布 id
    async fn upload(&self, request: &UploadRequest) -> Result<String, ExternalError>;

    /// 获取游标之后的一页评论
    async fn fetch_comments(
        &self,
        publish_id: &str,
        cursor: Option<&str>,
    ) -> Result<CommentPage, ExternalError>;

    async fn post_reply(&self, comment_id: &str, text: &str) -> Result<(), ExternalError>;

    async fn query_quota(&self) -> Result<PlatformQuota, ExternalError>;
}

/// 生成式文本服务
#[async_trait]
pub trait GenerativeText: Send + Sync {
    async fn analyze_content(&self, source: &str) -> Result<ContentAnalysis, ExternalError>;

    async fn generate_metadata(
        &self,
        analysis: &ContentAnalysis,
        style: Option<&str>,
    ) -> Result<ItemMetadata, ExternalError>;

    async fn analyze_sentiment(&self, text: &str) -> Result<Sentiment, ExternalError>;

    async fn generate_reply(
        &self,
        text: &str,
        sentiment: Sentiment,
        context: &ReplyContext,
    ) -> Result<String, ExternalError>;

    /// 将自由文本归类为一个意图标签（upload / comments / quota / status / pending / videos / help / unclear）
    /// 默认不做归类
    async fn classify_intent(&self, _text: &str) -> Result<String, ExternalError> {
        Ok("unclear".to_string())
    }
}

/// Agent 间消息通道
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// 等待提及；超时返回空列表（正常情况，不是错误）
    async fn await_mentions(&self, timeout: Duration) -> Result<Vec<Mention>, ExternalError>;

    /// 在线程中回复，mentions 为需要 @ 的 Agent
    async fn send_reply(
        &self,
        thread_id: &str,
        text: &str,
        mentions: &[String],
    ) -> Result<(), ExternalError>;

    /// 向其他 Agent 发起新消息
    async fn send_message(&self, target: &str, text: &str) -> Result<(), ExternalError>;
}
