//! SQLite 存储（sqlx，`async-sqlite` feature）
//!
//! 时间戳以毫秒整数存储，元数据以 JSON 文本存储。状态列保存原始字符串，读取时无法识别的值
//! 以 CorruptState 上报而不是强制转换。

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use crate::core::EngineError;
use crate::model::{
    CatalogItem, Comment, ItemMetadata, PipelineState, PublishedVideo, ReplyStatus, Sentiment,
};
use crate::store::{EntityStore, StoreResult};

const SETTLED_STATES: &str = "('pending', 'uploaded', 'failed', 'abandoned')";

fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

/// 解码一行目录条目；状态值无法识别时返回 CorruptState
fn item_from_row(row: &SqliteRow) -> Result<CatalogItem, EngineError> {
    let id: String = row.try_get("id")?;
    let raw_state: String = row.try_get("state")?;
    let state = PipelineState::parse(&raw_state).ok_or_else(|| EngineError::CorruptState {
        entity: id.clone(),
        value: raw_state.clone(),
    })?;
    let metadata: Option<String> = row.try_get("metadata")?;
    let metadata = match metadata {
        Some(json) => Some(serde_json::from_str::<ItemMetadata>(&json).map_err(|e| {
            EngineError::CorruptState {
                entity: id.clone(),
                value: format!("metadata: {e}"),
            }
        })?),
        None => None,
    };
    let attempts: i64 = row.try_get("attempts")?;
    let retry_at: Option<i64> = row.try_get("retry_at")?;

    Ok(CatalogItem {
        id,
        source: row.try_get("source")?,
        style: row.try_get("style")?,
        metadata,
        state,
        publish_id: row.try_get("publish_id")?,
        attempts: attempts.max(0) as u32,
        last_error: row.try_get("last_error")?,
        retry_at: retry_at.map(from_millis),
        created_at: from_millis(row.try_get("created_at")?),
        updated_at: from_millis(row.try_get("updated_at")?),
    })
}

fn video_from_row(row: &SqliteRow) -> Result<PublishedVideo, EngineError> {
    let last_synced_at: Option<i64> = row.try_get("last_synced_at")?;
    Ok(PublishedVideo {
        publish_id: row.try_get("publish_id")?,
        item_id: row.try_get("item_id")?,
        title: row.try_get("title")?,
        style: row.try_get("style")?,
        cursor: row.try_get("cursor")?,
        last_synced_at: last_synced_at.map(from_millis),
        published_at: from_millis(row.try_get("published_at")?),
    })
}

fn comment_from_row(row: &SqliteRow) -> Result<Comment, EngineError> {
    let id: String = row.try_get("id")?;
    let raw_status: String = row.try_get("reply_status")?;
    let reply_status = ReplyStatus::parse(&raw_status).ok_or_else(|| EngineError::CorruptState {
        entity: id.clone(),
        value: raw_status.clone(),
    })?;
    let sentiment: Option<String> = row.try_get("sentiment")?;
    Ok(Comment {
        id,
        video_id: row.try_get("video_id")?,
        author: row.try_get("author")?,
        text: row.try_get("text")?,
        published_at: from_millis(row.try_get("published_at")?),
        sentiment: sentiment.as_deref().map(Sentiment::from_label),
        reply_status,
        reply_text: row.try_get("reply_text")?,
    })
}

/// 基于 sqlx 连接池的 EntityStore
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// 打开（必要时创建）数据库并初始化表
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, EngineError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| EngineError::Store(format!("create {}: {e}", parent.display())))?;
            }
        }
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;
        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// 逐行解码；无法解码的条目被隔离，其余照常返回。第二个值为隔离的行数
    async fn decode_items(&self, rows: &[SqliteRow]) -> StoreResult<(Vec<CatalogItem>, usize)> {
        let mut items = Vec::with_capacity(rows.len());
        let mut quarantined = 0;
        for row in rows {
            match item_from_row(row) {
                Ok(item) => items.push(item),
                Err(EngineError::CorruptState { entity, value }) => {
                    self.quarantine_item(&entity, &value).await?;
                    quarantined += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok((items, quarantined))
    }

    /// 把无法解码的条目标记为 failed 且不安排重试，留待人工处理
    async fn quarantine_item(&self, id: &str, reason: &str) -> StoreResult<()> {
        tracing::error!(item = %id, "Corrupt catalog record ({}), marking failed", reason);
        sqlx::query(
            "UPDATE catalog_items SET state = 'failed', retry_at = NULL, last_error = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(format!("corrupt record: {reason}"))
        .bind(to_millis(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn init_tables(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS catalog_items (
                id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                style TEXT,
                metadata TEXT,
                state TEXT NOT NULL,
                publish_id TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                retry_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS published_videos (
                publish_id TEXT PRIMARY KEY,
                item_id TEXT NOT NULL,
                title TEXT NOT NULL,
                style TEXT,
                cursor TEXT,
                last_synced_at INTEGER,
                published_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS comments (
                video_id TEXT NOT NULL,
                id TEXT NOT NULL,
                author TEXT NOT NULL,
                text TEXT NOT NULL,
                published_at INTEGER NOT NULL,
                fingerprint TEXT NOT NULL,
                sentiment TEXT,
                reply_status TEXT NOT NULL,
                reply_text TEXT,
                PRIMARY KEY (video_id, id)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_state ON catalog_items(state)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_comments_fingerprint ON comments(video_id, fingerprint)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl EntityStore for SqliteStore {
    async fn list_pending(&self, limit: usize) -> StoreResult<Vec<CatalogItem>> {
        loop {
            let rows = sqlx::query(
                "SELECT * FROM catalog_items WHERE state = 'pending'
                 ORDER BY created_at ASC, id ASC LIMIT ?",
            )
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
            let (items, quarantined) = self.decode_items(&rows).await?;
            // 隔离的行已离开 pending，重新查询以补足 limit
            if quarantined == 0 || rows.len() < limit {
                return Ok(items);
            }
        }
    }

    async fn list_retry_due(&self, now: DateTime<Utc>) -> StoreResult<Vec<CatalogItem>> {
        let rows = sqlx::query(
            "SELECT * FROM catalog_items
             WHERE state = 'failed' AND retry_at IS NOT NULL AND retry_at <= ?
             ORDER BY id ASC",
        )
        .bind(to_millis(now))
        .fetch_all(&self.pool)
        .await?;
        let (items, _) = self.decode_items(&rows).await?;
        Ok(items)
    }

    async fn list_unsettled(&self) -> StoreResult<Vec<Result<CatalogItem, EngineError>>> {
        let sql = format!(
            "SELECT * FROM catalog_items WHERE state NOT IN {SETTLED_STATES} ORDER BY id ASC"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(item_from_row).collect())
    }

    async fn get_item(&self, id: &str) -> StoreResult<Option<CatalogItem>> {
        let row = sqlx::query("SELECT * FROM catalog_items WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(item_from_row).transpose()
    }

    async fn save_item(&self, item: &CatalogItem) -> StoreResult<()> {
        let metadata = item
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| EngineError::Store(e.to_string()))?;
        sqlx::query(
            "INSERT OR REPLACE INTO catalog_items
             (id, source, style, metadata, state, publish_id, attempts, last_error, retry_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&item.id)
        .bind(&item.source)
        .bind(&item.style)
        .bind(metadata)
        .bind(item.state.as_str())
        .bind(&item.publish_id)
        .bind(item.attempts as i64)
        .bind(&item.last_error)
        .bind(item.retry_at.map(to_millis))
        .bind(to_millis(item.created_at))
        .bind(to_millis(item.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_video(&self, video: &PublishedVideo) -> StoreResult<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO published_videos
             (publish_id, item_id, title, style, cursor, last_synced_at, published_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&video.publish_id)
        .bind(&video.item_id)
        .bind(&video.title)
        .bind(&video.style)
        .bind(&video.cursor)
        .bind(video.last_synced_at.map(to_millis))
        .bind(to_millis(video.published_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_stale_videos(&self, limit: usize) -> StoreResult<Vec<PublishedVideo>> {
        let rows = sqlx::query(
            "SELECT * FROM published_videos
             ORDER BY last_synced_at IS NOT NULL, last_synced_at ASC, published_at ASC, publish_id ASC
             LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(video_from_row).collect()
    }

    async fn list_videos(&self, limit: usize) -> StoreResult<Vec<PublishedVideo>> {
        let rows = sqlx::query(
            "SELECT * FROM published_videos ORDER BY published_at DESC, publish_id ASC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(video_from_row).collect()
    }

    async fn find_comment(
        &self,
        video_id: &str,
        comment_id: &str,
        fingerprint: &str,
    ) -> StoreResult<Option<Comment>> {
        let rows = sqlx::query(
            "SELECT * FROM comments WHERE video_id = ? AND (id = ? OR fingerprint = ?)
             ORDER BY id = ? DESC, id ASC",
        )
        .bind(video_id)
        .bind(comment_id)
        .bind(fingerprint)
        .bind(comment_id)
        .fetch_all(&self.pool)
        .await?;

        let mut first_corrupt = None;
        for row in &rows {
            match comment_from_row(row) {
                Ok(comment) => return Ok(Some(comment)),
                Err(e @ EngineError::CorruptState { .. }) => {
                    tracing::error!(video = %video_id, "Unreadable comment row: {}", e);
                    first_corrupt.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }
        first_corrupt.map_or(Ok(None), Err)
    }

    async fn save_comment(&self, comment: &Comment) -> StoreResult<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO comments
             (video_id, id, author, text, published_at, fingerprint, sentiment, reply_status, reply_text)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&comment.video_id)
        .bind(&comment.id)
        .bind(&comment.author)
        .bind(&comment.text)
        .bind(to_millis(comment.published_at))
        .bind(comment.fingerprint())
        .bind(comment.sentiment.map(|s| s.as_str()))
        .bind(comment.reply_status.as_str())
        .bind(&comment.reply_text)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open() -> (TempDir, SqliteStore) {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(dir.path().join("angus.db")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_item_round_trip_with_metadata() {
        let (_dir, store) = open().await;
        let now = Utc::now();
        let mut item = CatalogItem::new("song-1", "https://cdn.example/1.mp4", now).with_style("lofi");
        item.metadata = Some(ItemMetadata {
            title: "Rainy Window".into(),
            description: "lofi beats".into(),
            tags: vec!["lofi".into()],
        });
        item.transition(PipelineState::Analyzing, now).unwrap();
        store.save_item(&item).await.unwrap();

        let loaded = store.get_item("song-1").await.unwrap().unwrap();
        assert_eq!(loaded.state, PipelineState::Analyzing);
        assert_eq!(loaded.metadata, item.metadata);
        assert_eq!(loaded.created_at.timestamp_millis(), now.timestamp_millis());
        assert_eq!(store.list_unsettled().await.unwrap().len(), 1);
        assert!(store.list_pending(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_state_is_reported_not_coerced() {
        let (_dir, store) = open().await;
        let now = Utc::now();
        store.save_item(&CatalogItem::new("song-1", "s", now)).await.unwrap();
        store.save_item(&CatalogItem::new("song-2", "s", now)).await.unwrap();
        sqlx::query("UPDATE catalog_items SET state = 'url_expired' WHERE id = 'song-2'")
            .execute(&store.pool)
            .await
            .unwrap();

        let pending = store.list_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);

        let unsettled = store.list_unsettled().await.unwrap();
        assert_eq!(unsettled.len(), 1);
        assert!(matches!(
            &unsettled[0],
            Err(EngineError::CorruptState { entity, value }) if entity == "song-2" && value == "url_expired"
        ));
    }

    #[tokio::test]
    async fn test_corrupt_pending_row_is_quarantined_and_healthy_row_uploads() {
        use std::collections::HashMap;
        use std::sync::Arc;
        use std::time::Duration;

        use tokio_util::sync::CancellationToken;

        use crate::adapters::{MockGenerator, MockPlatform};
        use crate::quota::{ManualClock, QuotaKind, QuotaLedger, QuotaLimit};
        use crate::retry::RetryPolicy;
        use crate::workflow::upload::UploadExecutor;

        let (_dir, store) = open().await;
        let now = Utc::now();
        store.save_item(&CatalogItem::new("song-1", "s3://b/1.mp3", now)).await.unwrap();
        store
            .save_item(&CatalogItem::new("song-2", "s3://b/2.mp3", now + chrono::Duration::seconds(1)))
            .await
            .unwrap();
        sqlx::query("UPDATE catalog_items SET metadata = '{bad' WHERE id = 'song-2'")
            .execute(&store.pool)
            .await
            .unwrap();

        let pending = store.list_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "song-1");

        let row = sqlx::query("SELECT state, retry_at, last_error FROM catalog_items WHERE id = 'song-2'")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(row.get::<String, _>("state"), "failed");
        assert_eq!(row.get::<Option<i64>, _>("retry_at"), None);
        assert!(row.get::<String, _>("last_error").starts_with("corrupt record"));
        assert!(store.list_retry_due(now + chrono::Duration::days(1)).await.unwrap().is_empty());

        let mut limits = HashMap::new();
        limits.insert(QuotaKind::UploadUnits, QuotaLimit::new(10, Duration::from_secs(86_400)));
        let store = Arc::new(store);
        let platform = Arc::new(MockPlatform::new());
        let executor = UploadExecutor::new(
            store.clone(),
            platform.clone(),
            Arc::new(MockGenerator::new()),
            Arc::new(QuotaLedger::new(limits, Arc::new(ManualClock::at_secs(0)))),
            RetryPolicy::new(Duration::from_secs(5), Duration::from_secs(60), 3),
            Duration::from_secs(5),
        );
        let result = executor.run(5, &CancellationToken::new()).await;
        assert_eq!(result.succeeded, 1);
        assert_eq!(platform.uploaded(), vec!["song-1".to_string()]);
    }

    #[tokio::test]
    async fn test_unreadable_comment_row_is_reported_per_entity() {
        let (_dir, store) = open().await;
        let remote = crate::model::RemoteComment {
            id: "c1".into(),
            author: "fan".into(),
            text: "love it".into(),
            published_at: Utc::now(),
            by_channel: false,
        };
        store.save_comment(&Comment::from_remote("vid-1", &remote)).await.unwrap();
        sqlx::query("UPDATE comments SET reply_status = 'maybe' WHERE id = 'c1'")
            .execute(&store.pool)
            .await
            .unwrap();

        let err = store.find_comment("vid-1", "c1", "unrelated").await.unwrap_err();
        assert!(err.is_entity_scoped());
        assert!(store.find_comment("vid-2", "c1", "unrelated").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_videos_never_synced_first() {
        let (_dir, store) = open().await;
        let now = Utc::now();
        let item = CatalogItem::new("song-1", "s", now);
        let mut synced = PublishedVideo::from_item(&item, "vid-a", now);
        synced.last_synced_at = Some(now);
        let fresh = PublishedVideo::from_item(&item, "vid-b", now);
        store.save_video(&synced).await.unwrap();
        store.save_video(&fresh).await.unwrap();

        let ids: Vec<_> = store
            .list_stale_videos(10)
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.publish_id)
            .collect();
        assert_eq!(ids, vec!["vid-b", "vid-a"]);
    }

    #[tokio::test]
    async fn test_comment_lookup_by_fingerprint() {
        let (_dir, store) = open().await;
        let remote = crate::model::RemoteComment {
            id: "c1".into(),
            author: "fan".into(),
            text: "what synth is that?".into(),
            published_at: Utc::now(),
            by_channel: false,
        };
        let mut comment = Comment::from_remote("vid-1", &remote);
        comment.sentiment = Some(Sentiment::Question);
        comment.reply_status = ReplyStatus::Replied;
        comment.reply_text = Some("A Juno-60!".into());
        store.save_comment(&comment).await.unwrap();

        let found = store
            .find_comment("vid-1", "c9", &comment.fingerprint())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.reply_status, ReplyStatus::Replied);
        assert_eq!(found.sentiment, Some(Sentiment::Question));
    }
}
