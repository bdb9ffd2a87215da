//! 领域实体：目录条目、已发布视频、评论
//!
//! 目录条目的流水线状态只能单调前进；唯一的回退是重试策略批准后的 `failed → pending`。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::EngineError;

/// 上传流水线状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Pending,
    Analyzing,
    MetadataReady,
    Uploading,
    /// 终态：成功
    Uploaded,
    /// 等待重试（attempts 记录失败次数）
    Failed,
    /// 终态：重试耗尽或永久错误
    Abandoned,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Pending => "pending",
            PipelineState::Analyzing => "analyzing",
            PipelineState::MetadataReady => "metadata_ready",
            PipelineState::Uploading => "uploading",
            PipelineState::Uploaded => "uploaded",
            PipelineState::Failed => "failed",
            PipelineState::Abandoned => "abandoned",
        }
    }

    /// 解析持久化的状态值；无法识别的值由调用方作为 CorruptState 上报，不做强制转换
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "pending" => PipelineState::Pending,
            "analyzing" => PipelineState::Analyzing,
            "metadata_ready" => PipelineState::MetadataReady,
            "uploading" => PipelineState::Uploading,
            "uploaded" => PipelineState::Uploaded,
            "failed" => PipelineState::Failed,
            "abandoned" => PipelineState::Abandoned,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Uploaded | PipelineState::Abandoned)
    }

    /// 流水线中的「进行中」状态（崩溃后需要恢复）
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            PipelineState::Analyzing | PipelineState::MetadataReady | PipelineState::Uploading
        )
    }

    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;
        match (*self, next) {
            (Pending, Analyzing)
            | (Analyzing, MetadataReady)
            | (MetadataReady, Uploading)
            | (Uploading, Uploaded) => true,
            (Failed, Pending) | (Failed, Abandoned) => true,
            (from, Failed) | (from, Abandoned) => !from.is_terminal() && from != Failed,
            _ => false,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 生成的视频元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMetadata {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
}

/// 目录条目（一首待发布或已发布的歌曲）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: String,
    /// 源媒体定位（视频/音频 URL 或路径）
    pub source: String,
    /// 原始风格描述（逗号分隔），用于生成标签与回复语气
    pub style: Option<String>,
    pub metadata: Option<ItemMetadata>,
    pub state: PipelineState,
    pub publish_id: Option<String>,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// failed 状态下最早可重置为 pending 的时间
    pub retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CatalogItem {
    pub fn new(id: impl Into<String>, source: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            style: None,
            metadata: None,
            state: PipelineState::Pending,
            publish_id: None,
            attempts: 0,
            last_error: None,
            retry_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.style = Some(style.into());
        self
    }

    /// 按状态机前进一步；非法跳转返回 InvalidTransition，实体保持原状
    pub fn transition(&mut self, next: PipelineState, now: DateTime<Utc>) -> Result<(), EngineError> {
        if next == PipelineState::Pending && self.state == PipelineState::Failed {
            return Err(EngineError::InvalidTransition {
                entity: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.apply(next, now)
    }

    /// 显式的重试重置：failed → pending，要求 retry_at 已到
    pub fn retry_reset(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        let due = self.retry_at.map(|at| at <= now).unwrap_or(false);
        if self.state != PipelineState::Failed || !due {
            return Err(EngineError::InvalidTransition {
                entity: self.id.clone(),
                from: self.state,
                to: PipelineState::Pending,
            });
        }
        self.apply(PipelineState::Pending, now)?;
        self.retry_at = None;
        Ok(())
    }

    fn apply(&mut self, next: PipelineState, now: DateTime<Utc>) -> Result<(), EngineError> {
        if !self.state.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                entity: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = now;
        Ok(())
    }

    /// 标签：优先生成的元数据，否则从 style 拆分
    pub fn tags(&self) -> Vec<String> {
        match &self.metadata {
            Some(m) if !m.tags.is_empty() => m.tags.clone(),
            _ => self
                .style
                .as_deref()
                .map(|s| {
                    s.split(',')
                        .map(|t| t.trim().to_string())
                        .filter(|t| !t.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

/// 已上传的视频及其评论游标
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedVideo {
    pub publish_id: String,
    pub item_id: String,
    pub title: String,
    pub style: Option<String>,
    /// 平台返回的不透明游标，标记最后一个已完整处理的评论页
    pub cursor: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub published_at: DateTime<Utc>,
}

impl PublishedVideo {
    pub fn from_item(item: &CatalogItem, publish_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            publish_id: publish_id.into(),
            item_id: item.id.clone(),
            title: item
                .metadata
                .as_ref()
                .map(|m| m.title.clone())
                .unwrap_or_else(|| "Untitled Song".to_string()),
            style: item.style.clone(),
            cursor: None,
            last_synced_at: None,
            published_at: now,
        }
    }
}

/// 评论情感
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
    Question,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sentiment::Positive => "positive",
            Sentiment::Neutral => "neutral",
            Sentiment::Negative => "negative",
            Sentiment::Question => "question",
        }
    }

    /// 宽松解析模型输出；无法识别时归为 neutral
    pub fn from_label(label: &str) -> Self {
        let label = label.trim().to_lowercase();
        if label.contains("pos") {
            Sentiment::Positive
        } else if label.contains("neg") {
            Sentiment::Negative
        } else if label.contains("question") || label.ends_with('?') {
            Sentiment::Question
        } else {
            Sentiment::Neutral
        }
    }
}

/// 回复状态：replied / skipped 为终态，每条评论最多写入一次
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Unreplied,
    Replied,
    Skipped,
}

impl ReplyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyStatus::Unreplied => "unreplied",
            ReplyStatus::Replied => "replied",
            ReplyStatus::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "unreplied" => ReplyStatus::Unreplied,
            "replied" => ReplyStatus::Replied,
            "skipped" => ReplyStatus::Skipped,
            _ => return None,
        })
    }
}

/// 平台返回的原始评论
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteComment {
    pub id: String,
    pub author: String,
    pub text: String,
    pub published_at: DateTime<Utc>,
    /// 频道自己发的评论（不回复自己）
    #[serde(default)]
    pub by_channel: bool,
}

/// 已入库的评论
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub video_id: String,
    pub author: String,
    pub text: String,
    pub published_at: DateTime<Utc>,
    pub sentiment: Option<Sentiment>,
    pub reply_status: ReplyStatus,
    pub reply_text: Option<String>,
}

impl Comment {
    pub fn from_remote(video_id: &str, remote: &RemoteComment) -> Self {
        Self {
            id: remote.id.clone(),
            video_id: video_id.to_string(),
            author: remote.author.clone(),
            text: remote.text.clone(),
            published_at: remote.published_at,
            sentiment: None,
            reply_status: ReplyStatus::Unreplied,
            reply_text: None,
        }
    }

    /// 内容指纹：作者 + 文本 + 发布时间，平台分页漂移导致 id 变化时仍能去重
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.author, &self.text, self.published_at)
    }

    pub fn is_resolved(&self) -> bool {
        self.reply_status != ReplyStatus::Unreplied
    }

    /// 已起草回复但未确认发布：上次发布结果未知，不能再发
    pub fn has_unconfirmed_draft(&self) -> bool {
        self.reply_status == ReplyStatus::Unreplied && self.reply_text.is_some()
    }
}

pub fn fingerprint(author: &str, text: &str, published_at: DateTime<Utc>) -> String {
    format!(
        "{}|{}|{}",
        author.trim(),
        text.trim(),
        published_at.timestamp_millis()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> CatalogItem {
        CatalogItem::new("song-1", "https://cdn.example/song-1.mp4", Utc::now())
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut item = item();
        let now = Utc::now();
        for next in [
            PipelineState::Analyzing,
            PipelineState::MetadataReady,
            PipelineState::Uploading,
            PipelineState::Uploaded,
        ] {
            item.transition(next, now).unwrap();
        }
        assert!(item.state.is_terminal());
    }

    #[test]
    fn test_pending_cannot_jump_to_uploaded() {
        let mut item = item();
        let err = item.transition(PipelineState::Uploaded, Utc::now()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
        assert_eq!(item.state, PipelineState::Pending);
    }

    #[test]
    fn test_failed_reachable_from_any_non_terminal() {
        for from in [
            PipelineState::Pending,
            PipelineState::Analyzing,
            PipelineState::MetadataReady,
            PipelineState::Uploading,
        ] {
            assert!(from.can_transition_to(PipelineState::Failed), "{from}");
            assert!(from.can_transition_to(PipelineState::Abandoned), "{from}");
        }
        assert!(!PipelineState::Uploaded.can_transition_to(PipelineState::Failed));
        assert!(!PipelineState::Abandoned.can_transition_to(PipelineState::Pending));
    }

    #[test]
    fn test_retry_reset_requires_due_time() {
        let now = Utc::now();
        let mut item = item();
        item.transition(PipelineState::Failed, now).unwrap();
        item.retry_at = Some(now + chrono::Duration::seconds(30));

        assert!(item.transition(PipelineState::Pending, now).is_err());
        assert!(item.retry_reset(now).is_err());

        item.retry_reset(now + chrono::Duration::seconds(30)).unwrap();
        assert_eq!(item.state, PipelineState::Pending);
        assert!(item.retry_at.is_none());
    }

    #[test]
    fn test_state_round_trip_and_unknown_value() {
        assert_eq!(PipelineState::parse("metadata_ready"), Some(PipelineState::MetadataReady));
        assert_eq!(PipelineState::parse("url_expired"), None);
    }

    #[test]
    fn test_tags_fall_back_to_style() {
        let item = item().with_style("synthwave, retro , ");
        assert_eq!(item.tags(), vec!["synthwave".to_string(), "retro".to_string()]);
    }

    #[test]
    fn test_sentiment_labels() {
        assert_eq!(Sentiment::from_label("Positive"), Sentiment::Positive);
        assert_eq!(Sentiment::from_label("very negative"), Sentiment::Negative);
        assert_eq!(Sentiment::from_label("question"), Sentiment::Question);
        assert_eq!(Sentiment::from_label("meh"), Sentiment::Neutral);
    }
}
