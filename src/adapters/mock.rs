//! Mock 适配器（用于测试与 dry-run，无需外部服务）
//!
//! 平台：内存中的上传计数、评论分页、回复记录；生成式文本：确定性输出；通道：脚本化的提及队列。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::adapters::{
    CommentPage, ContentAnalysis, GenerativeText, Mention, MessageChannel, PlatformQuota,
    ReplyContext, UploadRequest, VideoPlatform,
};
use crate::core::ExternalError;
use crate::model::{ItemMetadata, RemoteComment, Sentiment};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Mock 视频平台
#[derive(Debug)]
pub struct MockPlatform {
    upload_calls: AtomicUsize,
    uploaded: Mutex<Vec<String>>,
    upload_failures: Mutex<HashMap<String, VecDeque<ExternalError>>>,
    upload_delay: Duration,
    comments: Mutex<HashMap<String, Vec<RemoteComment>>>,
    page_size: usize,
    fetch_failures: Mutex<HashSet<String>>,
    replies: Mutex<Vec<(String, String)>>,
    reply_failures: Mutex<HashSet<String>>,
    remaining_quota: Mutex<u64>,
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self {
            upload_calls: AtomicUsize::new(0),
            uploaded: Mutex::new(Vec::new()),
            upload_failures: Mutex::new(HashMap::new()),
            upload_delay: Duration::ZERO,
            comments: Mutex::new(HashMap::new()),
            page_size: 20,
            fetch_failures: Mutex::new(HashSet::new()),
            replies: Mutex::new(Vec::new()),
            reply_failures: Mutex::new(HashSet::new()),
            remaining_quota: Mutex::new(10_000),
        }
    }
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_upload_delay(mut self, delay: Duration) -> Self {
        self.upload_delay = delay;
        self
    }

    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size.max(1);
        self
    }

    /// 让指定条目的下一次上传失败（可多次排队）
    pub fn fail_upload(&self, item_id: &str, err: ExternalError) {
        lock(&self.upload_failures)
            .entry(item_id.to_string())
            .or_default()
            .push_back(err);
    }

    pub fn add_comments(&self, publish_id: &str, comments: Vec<RemoteComment>) {
        lock(&self.comments)
            .entry(publish_id.to_string())
            .or_default()
            .extend(comments);
    }

    /// 模拟平台分页漂移：替换某视频的全部评论
    pub fn replace_comments(&self, publish_id: &str, comments: Vec<RemoteComment>) {
        lock(&self.comments).insert(publish_id.to_string(), comments);
    }

    pub fn fail_fetch(&self, publish_id: &str) {
        lock(&self.fetch_failures).insert(publish_id.to_string());
    }

    pub fn fail_reply(&self, comment_id: &str) {
        lock(&self.reply_failures).insert(comment_id.to_string());
    }

    pub fn set_remaining_quota(&self, remaining: u64) {
        *lock(&self.remaining_quota) = remaining;
    }

    /// upload() 被调用的次数（含失败）
    pub fn upload_calls(&self) -> usize {
        self.upload_calls.load(Ordering::SeqCst)
    }

    pub fn uploaded(&self) -> Vec<String> {
        lock(&self.uploaded).clone()
    }

    /// 已发布的回复：(comment_id, text)
    pub fn replies(&self) -> Vec<(String, String)> {
        lock(&self.replies).clone()
    }
}

#[async_trait]
impl VideoPlatform for MockPlatform {
    async fn upload(&self, request: &UploadRequest) -> Result<String, ExternalError> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        if !self.upload_delay.is_zero() {
            tokio::time::sleep(self.upload_delay).await;
        }
        let scripted = lock(&self.upload_failures)
            .get_mut(&request.item_id)
            .and_then(|q| q.pop_front());
        if let Some(err) = scripted {
            return Err(err);
        }
        lock(&self.uploaded).push(request.item_id.clone());
        Ok(format!("vid-{}", request.item_id))
    }

    async fn fetch_comments(
        &self,
        publish_id: &str,
        cursor: Option<&str>,
    ) -> Result<CommentPage, ExternalError> {
        if lock(&self.fetch_failures).contains(publish_id) {
            return Err(ExternalError::Transient(format!(
                "comment listing unavailable for {publish_id}"
            )));
        }
        let comments = lock(&self.comments);
        let all = comments.get(publish_id).map(Vec::as_slice).unwrap_or(&[]);
        let start = cursor
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0)
            .min(all.len());
        let end = (start + self.page_size).min(all.len());
        Ok(CommentPage {
            items: all[start..end].to_vec(),
            cursor: Some(end.to_string()),
            has_more: end < all.len(),
        })
    }

    async fn post_reply(&self, comment_id: &str, text: &str) -> Result<(), ExternalError> {
        if lock(&self.reply_failures).contains(comment_id) {
            return Err(ExternalError::Permanent(format!(
                "comment {comment_id} no longer accepts replies"
            )));
        }
        lock(&self.replies).push((comment_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn query_quota(&self) -> Result<PlatformQuota, ExternalError> {
        let reset_at = (Utc::now() + chrono::Duration::days(1))
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|t| t.and_utc())
            .unwrap_or_else(Utc::now);
        Ok(PlatformQuota {
            remaining: *lock(&self.remaining_quota),
            reset_at,
        })
    }
}

/// Mock 生成式文本：确定性输出，可按输入注入失败
#[derive(Debug, Default)]
pub struct MockGenerator {
    analysis_failures: Mutex<HashMap<String, ExternalError>>,
    sentiment_failures: Mutex<HashSet<String>>,
    reply_failures: Mutex<HashSet<String>>,
    intent_labels: Mutex<HashMap<String, String>>,
}

impl MockGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_analysis(&self, source: &str, err: ExternalError) {
        lock(&self.analysis_failures).insert(source.to_string(), err);
    }

    pub fn fail_sentiment(&self, text: &str) {
        lock(&self.sentiment_failures).insert(text.to_string());
    }

    pub fn fail_reply(&self, text: &str) {
        lock(&self.reply_failures).insert(text.to_string());
    }

    /// 为自由文本指定归类结果
    pub fn label_intent(&self, text: &str, label: &str) {
        lock(&self.intent_labels).insert(text.to_string(), label.to_string());
    }
}

#[async_trait]
impl GenerativeText for MockGenerator {
    async fn analyze_content(&self, source: &str) -> Result<ContentAnalysis, ExternalError> {
        if let Some(err) = lock(&self.analysis_failures).get(source) {
            return Err(err.clone());
        }
        Ok(ContentAnalysis {
            themes: vec!["night drive".to_string()],
            genre: "synthwave".to_string(),
            mood: "nostalgic".to_string(),
        })
    }

    async fn generate_metadata(
        &self,
        analysis: &ContentAnalysis,
        style: Option<&str>,
    ) -> Result<ItemMetadata, ExternalError> {
        let mut tags = vec![analysis.genre.clone(), analysis.mood.clone()];
        if let Some(style) = style {
            tags.extend(style.split(',').map(|t| t.trim().to_string()).filter(|t| !t.is_empty()));
        }
        Ok(ItemMetadata {
            title: format!("{} ({})", analysis.themes.join(", "), analysis.genre),
            description: format!("A {} {} track.", analysis.mood, analysis.genre),
            tags,
        })
    }

    async fn analyze_sentiment(&self, text: &str) -> Result<Sentiment, ExternalError> {
        if lock(&self.sentiment_failures).contains(text) {
            return Err(ExternalError::Transient("sentiment model unavailable".to_string()));
        }
        let lower = text.to_lowercase();
        Ok(if lower.contains('?') {
            Sentiment::Question
        } else if lower.contains("love") || lower.contains("great") {
            Sentiment::Positive
        } else if lower.contains("bad") || lower.contains("hate") {
            Sentiment::Negative
        } else {
            Sentiment::Neutral
        })
    }

    async fn generate_reply(
        &self,
        text: &str,
        sentiment: Sentiment,
        context: &ReplyContext,
    ) -> Result<String, ExternalError> {
        if lock(&self.reply_failures).contains(text) {
            return Err(ExternalError::Permanent("reply generation refused".to_string()));
        }
        Ok(match sentiment {
            Sentiment::Positive => format!("Thanks for listening to {}!", context.title),
            Sentiment::Negative => format!("Sorry {} missed the mark for you.", context.title),
            Sentiment::Question => format!("Good question about {}. More soon!", context.title),
            Sentiment::Neutral => format!("Thanks for stopping by {}.", context.title),
        })
    }

    async fn classify_intent(&self, text: &str) -> Result<String, ExternalError> {
        Ok(lock(&self.intent_labels)
            .get(text)
            .cloned()
            .unwrap_or_else(|| "unclear".to_string()))
    }
}

/// 通道上发出的回复
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentReply {
    pub thread_id: String,
    pub text: String,
    pub mentions: Vec<String>,
}

/// Mock 消息通道：按顺序返回脚本化的轮询结果，脚本耗尽后每次等待满超时返回空
#[derive(Debug, Default)]
pub struct MockChannel {
    inbox: Mutex<VecDeque<Result<Vec<Mention>, ExternalError>>>,
    polls: AtomicUsize,
    replies: Mutex<Vec<SentReply>>,
    messages: Mutex<Vec<(String, String)>>,
    unresponsive: AtomicBool,
}

impl MockChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_mentions(&self, mentions: Vec<Mention>) {
        lock(&self.inbox).push_back(Ok(mentions));
    }

    pub fn push_error(&self, err: ExternalError) {
        lock(&self.inbox).push_back(Err(err));
    }

    /// 模拟挂起的连接：脚本耗尽后的轮询与所有发送都不再返回
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.unresponsive.store(unresponsive, Ordering::SeqCst);
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    async fn stall_if_unresponsive(&self) {
        if self.unresponsive.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }

    pub fn replies(&self) -> Vec<SentReply> {
        lock(&self.replies).clone()
    }

    /// send_message 发出的消息：(target, text)
    pub fn messages(&self) -> Vec<(String, String)> {
        lock(&self.messages).clone()
    }
}

#[async_trait]
impl MessageChannel for MockChannel {
    async fn await_mentions(&self, timeout: Duration) -> Result<Vec<Mention>, ExternalError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let next = lock(&self.inbox).pop_front();
        match next {
            Some(batch) => batch,
            None => {
                self.stall_if_unresponsive().await;
                tokio::time::sleep(timeout).await;
                Ok(Vec::new())
            }
        }
    }

    async fn send_reply(
        &self,
        thread_id: &str,
        text: &str,
        mentions: &[String],
    ) -> Result<(), ExternalError> {
        self.stall_if_unresponsive().await;
        lock(&self.replies).push(SentReply {
            thread_id: thread_id.to_string(),
            text: text.to_string(),
            mentions: mentions.to_vec(),
        });
        Ok(())
    }

    async fn send_message(&self, target: &str, text: &str) -> Result<(), ExternalError> {
        self.stall_if_unresponsive().await;
        lock(&self.messages).push((target.to_string(), text.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comment(id: &str) -> RemoteComment {
        RemoteComment {
            id: id.to_string(),
            author: "fan".to_string(),
            text: format!("comment {id}"),
            published_at: Utc::now(),
            by_channel: false,
        }
    }

    #[tokio::test]
    async fn test_comment_paging_with_cursor() {
        let platform = MockPlatform::new().with_page_size(2);
        platform.add_comments("vid-1", vec![comment("a"), comment("b"), comment("c")]);

        let first = platform.fetch_comments("vid-1", None).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert!(first.has_more);

        let second = platform
            .fetch_comments("vid-1", first.cursor.as_deref())
            .await
            .unwrap();
        assert_eq!(second.items.len(), 1);
        assert!(!second.has_more);
        assert_eq!(second.cursor.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn test_scripted_upload_failure_is_consumed_once() {
        let platform = MockPlatform::new();
        platform.fail_upload("song-1", ExternalError::Transient("503".into()));
        let request = UploadRequest {
            item_id: "song-1".into(),
            source: "src".into(),
            metadata: ItemMetadata {
                title: "t".into(),
                description: "d".into(),
                tags: vec![],
            },
        };
        assert!(platform.upload(&request).await.is_err());
        assert_eq!(platform.upload(&request).await.unwrap(), "vid-song-1");
        assert_eq!(platform.upload_calls(), 2);
    }

    #[tokio::test]
    async fn test_channel_returns_empty_after_script() {
        let channel = MockChannel::new();
        channel.push_error(ExternalError::Transient("disconnected".into()));
        assert!(channel.await_mentions(Duration::from_millis(1)).await.is_err());
        assert!(channel
            .await_mentions(Duration::from_millis(1))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(channel.polls(), 2);
    }
}
