//! 实体状态存储
//!
//! 目录条目、已发布视频、评论的持久化接口。执行器在每个外部调用之前先提交状态，
//! 重启后依据已提交的状态判断副作用是否可能已经发生。

pub mod memory;
#[cfg(feature = "async-sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::core::EngineError;
use crate::model::{CatalogItem, Comment, PublishedVideo};

pub use memory::MemoryStore;
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteStore;

pub type StoreResult<T> = Result<T, EngineError>;

#[async_trait]
pub trait EntityStore: Send + Sync {
    /// pending 条目，按创建时间升序，同时间按 id
    async fn list_pending(&self, limit: usize) -> StoreResult<Vec<CatalogItem>>;

    /// retry_at 已到的 failed 条目
    async fn list_retry_due(&self, now: DateTime<Utc>) -> StoreResult<Vec<CatalogItem>>;

    /// 处于进行中状态或状态无法识别的条目；无法识别的以 CorruptState 返回
    async fn list_unsettled(&self) -> StoreResult<Vec<Result<CatalogItem, EngineError>>>;

    async fn get_item(&self, id: &str) -> StoreResult<Option<CatalogItem>>;

    async fn save_item(&self, item: &CatalogItem) -> StoreResult<()>;

    async fn save_video(&self, video: &PublishedVideo) -> StoreResult<()>;

    /// 最久未同步评论的视频在前（从未同步的最先）
    async fn list_stale_videos(&self, limit: usize) -> StoreResult<Vec<PublishedVideo>>;

    /// 最近发布的视频在前
    async fn list_videos(&self, limit: usize) -> StoreResult<Vec<PublishedVideo>>;

    /// 按 id 或内容指纹查找同一视频下已入库的评论
    async fn find_comment(
        &self,
        video_id: &str,
        comment_id: &str,
        fingerprint: &str,
    ) -> StoreResult<Option<Comment>>;

    async fn save_comment(&self, comment: &Comment) -> StoreResult<()>;

    /// 关闭底层连接；之后不再使用该存储
    async fn close(&self) {}
}
