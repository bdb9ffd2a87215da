//! 内存存储（测试与 dry-run）

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::core::EngineError;
use crate::model::{CatalogItem, Comment, PipelineState, PublishedVideo};
use crate::store::{EntityStore, StoreResult};

#[derive(Default)]
struct Tables {
    items: HashMap<String, CatalogItem>,
    /// 状态值无法识别的条目：id → 原始值
    corrupt: HashMap<String, String>,
    videos: HashMap<String, PublishedVideo>,
    /// (video_id, comment_id) → comment
    comments: HashMap<(String, String), Comment>,
    /// 回复状态无法识别的评论：(video_id, comment_id) → 原始值
    corrupt_comments: HashMap<(String, String), String>,
    /// 每个条目被提交过的状态序列
    history: HashMap<String, Vec<PipelineState>>,
}

/// 基于 RwLock<HashMap> 的 EntityStore
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟数据库不可达：之后所有操作返回 Store 错误
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// 写入一条状态值无法识别的条目记录
    pub async fn insert_corrupt(&self, id: &str, raw_state: &str) {
        let mut t = self.tables.write().await;
        t.items.remove(id);
        t.corrupt.insert(id.to_string(), raw_state.to_string());
    }

    /// 写入一条回复状态无法识别的评论记录
    pub async fn insert_corrupt_comment(&self, video_id: &str, comment_id: &str, raw_status: &str) {
        let key = (video_id.to_string(), comment_id.to_string());
        let mut t = self.tables.write().await;
        t.comments.remove(&key);
        t.corrupt_comments.insert(key, raw_status.to_string());
    }

    /// 条目被提交过的状态（按提交顺序）
    pub async fn state_history(&self, id: &str) -> Vec<PipelineState> {
        self.tables
            .read()
            .await
            .history
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn all_items(&self) -> Vec<CatalogItem> {
        let mut items: Vec<_> = self.tables.read().await.items.values().cloned().collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        items
    }

    pub async fn comments_for(&self, video_id: &str) -> Vec<Comment> {
        let mut out: Vec<_> = self
            .tables
            .read()
            .await
            .comments
            .values()
            .filter(|c| c.video_id == video_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub async fn get_video(&self, publish_id: &str) -> Option<PublishedVideo> {
        self.tables.read().await.videos.get(publish_id).cloned()
    }

    fn check(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EngineError::Store("memory store marked unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn list_pending(&self, limit: usize) -> StoreResult<Vec<CatalogItem>> {
        self.check()?;
        let t = self.tables.read().await;
        let mut items: Vec<_> = t
            .items
            .values()
            .filter(|i| i.state == PipelineState::Pending)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        items.truncate(limit);
        Ok(items)
    }

    async fn list_retry_due(&self, now: DateTime<Utc>) -> StoreResult<Vec<CatalogItem>> {
        self.check()?;
        let t = self.tables.read().await;
        let mut items: Vec<_> = t
            .items
            .values()
            .filter(|i| i.state == PipelineState::Failed && i.retry_at.is_some_and(|at| at <= now))
            .cloned()
            .collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(items)
    }

    async fn list_unsettled(&self) -> StoreResult<Vec<Result<CatalogItem, EngineError>>> {
        self.check()?;
        let t = self.tables.read().await;
        let mut out: Vec<Result<CatalogItem, EngineError>> = t
            .items
            .values()
            .filter(|i| i.state.is_in_flight())
            .cloned()
            .map(Ok)
            .collect();
        out.extend(t.corrupt.iter().map(|(id, value)| {
            Err(EngineError::CorruptState {
                entity: id.clone(),
                value: value.clone(),
            })
        }));
        Ok(out)
    }

    async fn get_item(&self, id: &str) -> StoreResult<Option<CatalogItem>> {
        self.check()?;
        Ok(self.tables.read().await.items.get(id).cloned())
    }

    async fn save_item(&self, item: &CatalogItem) -> StoreResult<()> {
        self.check()?;
        let mut t = self.tables.write().await;
        let history = t.history.entry(item.id.clone()).or_default();
        if history.last() != Some(&item.state) {
            history.push(item.state);
        }
        t.items.insert(item.id.clone(), item.clone());
        Ok(())
    }

    async fn save_video(&self, video: &PublishedVideo) -> StoreResult<()> {
        self.check()?;
        self.tables
            .write()
            .await
            .videos
            .insert(video.publish_id.clone(), video.clone());
        Ok(())
    }

    async fn list_stale_videos(&self, limit: usize) -> StoreResult<Vec<PublishedVideo>> {
        self.check()?;
        let t = self.tables.read().await;
        let mut videos: Vec<_> = t.videos.values().cloned().collect();
        // None 排在 Some 之前
        videos.sort_by(|a, b| {
            a.last_synced_at
                .cmp(&b.last_synced_at)
                .then_with(|| a.published_at.cmp(&b.published_at))
                .then_with(|| a.publish_id.cmp(&b.publish_id))
        });
        videos.truncate(limit);
        Ok(videos)
    }

    async fn list_videos(&self, limit: usize) -> StoreResult<Vec<PublishedVideo>> {
        self.check()?;
        let t = self.tables.read().await;
        let mut videos: Vec<_> = t.videos.values().cloned().collect();
        videos.sort_by(|a, b| {
            b.published_at
                .cmp(&a.published_at)
                .then_with(|| a.publish_id.cmp(&b.publish_id))
        });
        videos.truncate(limit);
        Ok(videos)
    }

    async fn find_comment(
        &self,
        video_id: &str,
        comment_id: &str,
        fingerprint: &str,
    ) -> StoreResult<Option<Comment>> {
        self.check()?;
        let t = self.tables.read().await;
        let key = (video_id.to_string(), comment_id.to_string());
        if let Some(c) = t.comments.get(&key) {
            return Ok(Some(c.clone()));
        }
        if let Some(raw) = t.corrupt_comments.get(&key) {
            return Err(EngineError::CorruptState {
                entity: comment_id.to_string(),
                value: raw.clone(),
            });
        }
        Ok(t
            .comments
            .values()
            .find(|c| c.video_id == video_id && c.fingerprint() == fingerprint)
            .cloned())
    }

    async fn save_comment(&self, comment: &Comment) -> StoreResult<()> {
        self.check()?;
        let key = (comment.video_id.clone(), comment.id.clone());
        let mut t = self.tables.write().await;
        t.corrupt_comments.remove(&key);
        t.comments.insert(key, comment.clone());
        Ok(())
    }
}
