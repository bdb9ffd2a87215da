//! 评论工作流执行器
//!
//! 按同步陈旧度选取视频，逐页拉取游标之后的评论，对每条未解决的评论做情感分析、生成回复并发布。
//! 回复发布前先提交草稿：若发现一条评论带有草稿但仍是 unreplied，说明上次发布结果未知，
//! 直接标记 skipped，不再发布。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::adapters::{GenerativeText, ReplyContext, VideoPlatform};
use crate::core::{EngineError, ExternalError};
use crate::model::{fingerprint, Comment, PublishedVideo, RemoteComment, ReplyStatus};
use crate::quota::{QuotaKind, QuotaLedger, Reservation};
use crate::store::EntityStore;
use crate::workflow::{bounded, RunResult, WorkflowKind};

enum Resolution {
    /// 评论已到达终态（或无需处理）
    Resolved,
    /// API 配额不足，评论保持原状
    QuotaDenied,
}

enum Flow {
    Continue,
    Stop,
}

pub struct CommentExecutor {
    store: Arc<dyn EntityStore>,
    platform: Arc<dyn VideoPlatform>,
    generator: Arc<dyn GenerativeText>,
    ledger: Arc<QuotaLedger>,
    call_timeout: Duration,
    max_comments_per_video: usize,
}

impl CommentExecutor {
    pub fn new(
        store: Arc<dyn EntityStore>,
        platform: Arc<dyn VideoPlatform>,
        generator: Arc<dyn GenerativeText>,
        ledger: Arc<QuotaLedger>,
        call_timeout: Duration,
        max_comments_per_video: usize,
    ) -> Self {
        Self {
            store,
            platform,
            generator,
            ledger,
            call_timeout,
            max_comments_per_video: max_comments_per_video.max(1),
        }
    }

    /// 处理最多 video_limit 个视频，整轮最多发布 reply_limit 条回复
    pub async fn run(
        &self,
        video_limit: usize,
        reply_limit: usize,
        cancel: &CancellationToken,
    ) -> RunResult {
        let mut result = RunResult::new(WorkflowKind::Comments);
        if let Err(e) = self.execute(video_limit, reply_limit, cancel, &mut result).await {
            tracing::error!("Comment run aborted: {}", e);
            result.aborted = Some(e.to_string());
        }
        tracing::info!("Comment run finished: {}", result.summary());
        result
    }

    async fn execute(
        &self,
        video_limit: usize,
        reply_limit: usize,
        cancel: &CancellationToken,
        result: &mut RunResult,
    ) -> Result<(), EngineError> {
        let videos = self.store.list_stale_videos(video_limit).await?;
        let mut replies_left = reply_limit;

        for mut video in videos {
            if cancel.is_cancelled() {
                result.interrupted = true;
                break;
            }
            if replies_left == 0 {
                break;
            }
            let flow = self
                .process_video(&mut video, &mut replies_left, cancel, result)
                .await?;
            if let Flow::Stop = flow {
                break;
            }
        }
        Ok(())
    }

    async fn process_video(
        &self,
        video: &mut PublishedVideo,
        replies_left: &mut usize,
        cancel: &CancellationToken,
        result: &mut RunResult,
    ) -> Result<Flow, EngineError> {
        result.touch(&video.publish_id);
        let mut examined = 0usize;
        let mut flow = Flow::Continue;
        let mut fetch_failed = false;

        loop {
            let page = match bounded(
                self.call_timeout,
                "fetch_comments",
                self.platform
                    .fetch_comments(&video.publish_id, video.cursor.as_deref()),
            )
            .await
            {
                Ok(page) => page,
                Err(e) => {
                    tracing::warn!(video = %video.publish_id, "Failed to fetch comments: {}", e);
                    result.record_failure(&video.publish_id, &e);
                    fetch_failed = true;
                    break;
                }
            };

            let mut page_resolved = true;
            for remote in &page.items {
                if cancel.is_cancelled() {
                    result.interrupted = true;
                    page_resolved = false;
                    flow = Flow::Stop;
                    break;
                }
                if *replies_left == 0 || examined >= self.max_comments_per_video {
                    page_resolved = false;
                    break;
                }
                examined += 1;
                match self.resolve_comment(video, remote, replies_left, result).await? {
                    Resolution::Resolved => {}
                    Resolution::QuotaDenied => {
                        tracing::info!(
                            video = %video.publish_id,
                            "API quota exhausted, stopping comment run"
                        );
                        result.quota_limited = true;
                        page_resolved = false;
                        flow = Flow::Stop;
                        break;
                    }
                }
            }

            if !page_resolved {
                break;
            }
            if page.cursor.is_some() {
                video.cursor = page.cursor.clone();
                self.store.save_video(video).await?;
            }
            if !page.has_more || page.items.is_empty() {
                break;
            }
        }

        // 拉取失败的视频保持原有的同步时间，下一轮仍优先处理
        if !fetch_failed {
            video.last_synced_at = Some(Utc::now());
            self.store.save_video(video).await?;
        }
        Ok(flow)
    }

    async fn resolve_comment(
        &self,
        video: &PublishedVideo,
        remote: &RemoteComment,
        replies_left: &mut usize,
        result: &mut RunResult,
    ) -> Result<Resolution, EngineError> {
        if remote.by_channel {
            result.skipped += 1;
            return Ok(Resolution::Resolved);
        }

        let fp = fingerprint(&remote.author, &remote.text, remote.published_at);
        let found = match self.store.find_comment(&video.publish_id, &remote.id, &fp).await {
            Ok(found) => found,
            Err(e) if e.is_entity_scoped() => {
                tracing::error!(comment = %remote.id, "Stored comment is unreadable, skipping: {}", e);
                let mut comment = Comment::from_remote(&video.publish_id, remote);
                comment.reply_status = ReplyStatus::Skipped;
                self.store.save_comment(&comment).await?;
                result.record_failure(&remote.id, &e);
                return Ok(Resolution::Resolved);
            }
            Err(e) => return Err(e),
        };
        let mut comment = match found {
            Some(stored) if stored.is_resolved() => {
                result.skipped += 1;
                return Ok(Resolution::Resolved);
            }
            Some(mut stored) if stored.has_unconfirmed_draft() => {
                tracing::warn!(
                    comment = %stored.id,
                    "Found a drafted reply with unknown outcome, marking skipped"
                );
                stored.reply_status = ReplyStatus::Skipped;
                self.store.save_comment(&stored).await?;
                result.skipped += 1;
                return Ok(Resolution::Resolved);
            }
            Some(stored) => stored,
            None => Comment::from_remote(&video.publish_id, remote),
        };

        let analysis = self.ledger.reserve(QuotaKind::ApiCalls, 1);
        if !analysis.granted {
            return Ok(Resolution::QuotaDenied);
        }
        result.selected += 1;
        result.touch(&comment.id);

        let sentiment = match bounded(
            self.call_timeout,
            "analyze_sentiment",
            self.generator.analyze_sentiment(&comment.text),
        )
        .await
        {
            Ok(s) => s,
            Err(e) => return self.skip(comment, &analysis, e, result).await,
        };
        comment.sentiment = Some(sentiment);

        let context = ReplyContext {
            title: video.title.clone(),
            style: video.style.clone(),
        };
        let reply = match bounded(
            self.call_timeout,
            "generate_reply",
            self.generator
                .generate_reply(&comment.text, sentiment, &context),
        )
        .await
        {
            Ok(r) => r,
            Err(e) => return self.skip(comment, &analysis, e, result).await,
        };

        let post = self.ledger.reserve(QuotaKind::ApiCalls, 1);
        if !post.granted {
            return Ok(Resolution::QuotaDenied);
        }

        // 草稿先落库，再发布
        comment.reply_text = Some(reply.clone());
        self.store.save_comment(&comment).await?;

        match bounded(
            self.call_timeout,
            "post_reply",
            self.platform.post_reply(&comment.id, &reply),
        )
        .await
        {
            Ok(()) => {
                comment.reply_status = ReplyStatus::Replied;
                self.store.save_comment(&comment).await?;
                *replies_left = replies_left.saturating_sub(1);
                result.succeeded += 1;
                tracing::debug!(comment = %comment.id, "Reply posted");
                Ok(Resolution::Resolved)
            }
            Err(e) => self.skip(comment, &post, e, result).await,
        }
    }

    /// 分析、生成或发布失败：评论标记为 skipped（终态）
    async fn skip(
        &self,
        mut comment: Comment,
        reservation: &Reservation,
        err: ExternalError,
        result: &mut RunResult,
    ) -> Result<Resolution, EngineError> {
        if err.rejected_without_effect() {
            self.ledger.release_reservation(reservation);
        }
        tracing::warn!(comment = %comment.id, "Skipping comment: {}", err);
        comment.reply_status = ReplyStatus::Skipped;
        self.store.save_comment(&comment).await?;
        result.record_failure(&comment.id, &err);
        Ok(Resolution::Resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MockGenerator, MockPlatform};
    use crate::model::CatalogItem;
    use crate::quota::{ManualClock, QuotaLimit};
    use crate::store::MemoryStore;
    use std::collections::HashMap;

    struct Fixture {
        store: Arc<MemoryStore>,
        platform: Arc<MockPlatform>,
        generator: Arc<MockGenerator>,
        executor: CommentExecutor,
    }

    fn fixture(api_budget: u64, page_size: usize) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let platform = Arc::new(MockPlatform::new().with_page_size(page_size));
        let generator = Arc::new(MockGenerator::new());
        let mut limits = HashMap::new();
        limits.insert(
            QuotaKind::ApiCalls,
            QuotaLimit::new(api_budget, Duration::from_secs(60)),
        );
        let ledger = Arc::new(QuotaLedger::new(limits, Arc::new(ManualClock::at_secs(0))));
        let executor = CommentExecutor::new(
            store.clone(),
            platform.clone(),
            generator.clone(),
            ledger,
            Duration::from_secs(5),
            100,
        );
        Fixture {
            store,
            platform,
            generator,
            executor,
        }
    }

    fn remote(id: &str, text: &str) -> RemoteComment {
        RemoteComment {
            id: id.to_string(),
            author: format!("fan-{id}"),
            text: text.to_string(),
            published_at: Utc::now(),
            by_channel: false,
        }
    }

    async fn publish(store: &MemoryStore, publish_id: &str) {
        let item = CatalogItem::new("song-1", "s", Utc::now());
        store
            .save_video(&PublishedVideo::from_item(&item, publish_id, Utc::now()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_replies_once_and_advances_cursor() {
        let f = fixture(100, 2);
        publish(&f.store, "vid-1").await;
        f.platform.add_comments(
            "vid-1",
            vec![remote("c1", "love this"), remote("c2", "what synth?"), remote("c3", "ok")],
        );

        let first = f.executor.run(10, 10, &CancellationToken::new()).await;
        assert_eq!(first.succeeded, 3);
        assert_eq!(f.platform.replies().len(), 3);
        let video = f.store.get_video("vid-1").await.unwrap();
        assert_eq!(video.cursor.as_deref(), Some("3"));
        assert!(video.last_synced_at.is_some());

        let second = f.executor.run(10, 10, &CancellationToken::new()).await;
        assert_eq!(second.succeeded, 0);
        assert_eq!(f.platform.replies().len(), 3);
    }

    #[tokio::test]
    async fn test_reply_limit_keeps_cursor_on_partial_page() {
        let f = fixture(100, 10);
        publish(&f.store, "vid-1").await;
        f.platform
            .add_comments("vid-1", vec![remote("c1", "a"), remote("c2", "b"), remote("c3", "c")]);

        let result = f.executor.run(10, 2, &CancellationToken::new()).await;
        assert_eq!(result.succeeded, 2);
        assert!(f.store.get_video("vid-1").await.unwrap().cursor.is_none());

        // 下一轮从同一页开始，已回复的评论被跳过
        f.executor.run(10, 2, &CancellationToken::new()).await;
        assert_eq!(f.platform.replies().len(), 3);
    }

    #[tokio::test]
    async fn test_renumbered_comment_is_deduplicated_by_fingerprint() {
        let f = fixture(100, 10);
        publish(&f.store, "vid-1").await;
        let original = remote("c1", "love it");
        f.platform.add_comments("vid-1", vec![original.clone()]);
        f.executor.run(10, 10, &CancellationToken::new()).await;

        let mut renumbered = original;
        renumbered.id = "c1-v2".into();
        f.platform.replace_comments("vid-1", vec![renumbered]);
        f.store
            .save_video(&PublishedVideo {
                cursor: None,
                ..f.store.get_video("vid-1").await.unwrap()
            })
            .await
            .unwrap();

        f.executor.run(10, 10, &CancellationToken::new()).await;
        assert_eq!(f.platform.replies().len(), 1);
    }

    #[tokio::test]
    async fn test_unconfirmed_draft_is_never_posted() {
        let f = fixture(100, 10);
        publish(&f.store, "vid-1").await;
        let c = remote("c1", "nice");
        let mut drafted = Comment::from_remote("vid-1", &c);
        drafted.reply_text = Some("thanks!".into());
        f.store.save_comment(&drafted).await.unwrap();
        f.platform.add_comments("vid-1", vec![c]);

        f.executor.run(10, 10, &CancellationToken::new()).await;
        assert!(f.platform.replies().is_empty());
        let stored = f.store.comments_for("vid-1").await;
        assert_eq!(stored[0].reply_status, ReplyStatus::Skipped);
    }

    #[tokio::test]
    async fn test_generation_failure_skips_comment() {
        let f = fixture(100, 10);
        publish(&f.store, "vid-1").await;
        f.generator.fail_sentiment("spam spam");
        f.platform
            .add_comments("vid-1", vec![remote("c1", "spam spam"), remote("c2", "great")]);

        let result = f.executor.run(10, 10, &CancellationToken::new()).await;
        assert_eq!(result.failed, 1);
        assert_eq!(result.succeeded, 1);
        let stored = f.store.comments_for("vid-1").await;
        assert_eq!(stored[0].reply_status, ReplyStatus::Skipped);
        assert_eq!(stored[1].reply_status, ReplyStatus::Replied);
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_video_stale() {
        let f = fixture(100, 10);
        publish(&f.store, "vid-a").await;
        publish(&f.store, "vid-b").await;
        f.platform.fail_fetch("vid-a");
        f.platform.add_comments("vid-b", vec![remote("c1", "nice")]);

        let result = f.executor.run(10, 10, &CancellationToken::new()).await;
        assert_eq!(result.failed, 1);
        assert!(f.store.get_video("vid-a").await.unwrap().last_synced_at.is_none());
        assert!(f.store.get_video("vid-b").await.unwrap().last_synced_at.is_some());

        let stale = f.store.list_stale_videos(1).await.unwrap();
        assert_eq!(stale[0].publish_id, "vid-a");
    }

    #[tokio::test]
    async fn test_unreadable_stored_comment_is_skipped() {
        let f = fixture(100, 10);
        publish(&f.store, "vid-1").await;
        f.store.insert_corrupt_comment("vid-1", "c1", "maybe").await;
        f.platform
            .add_comments("vid-1", vec![remote("c1", "hello"), remote("c2", "great")]);

        let result = f.executor.run(10, 10, &CancellationToken::new()).await;
        assert_eq!(result.failed, 1);
        assert_eq!(result.succeeded, 1);
        let replies = f.platform.replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].0, "c2");
        let stored = f.store.comments_for("vid-1").await;
        assert_eq!(stored[0].reply_status, ReplyStatus::Skipped);
        assert_eq!(stored[1].reply_status, ReplyStatus::Replied);
    }

    #[tokio::test]
    async fn test_own_comments_are_ignored() {
        let f = fixture(100, 10);
        publish(&f.store, "vid-1").await;
        let mut own = remote("c1", "pinned: lyrics below");
        own.by_channel = true;
        f.platform.add_comments("vid-1", vec![own]);

        let result = f.executor.run(10, 10, &CancellationToken::new()).await;
        assert_eq!(result.skipped, 1);
        assert!(f.platform.replies().is_empty());
    }

    #[tokio::test]
    async fn test_quota_denial_stops_without_advancing_cursor() {
        // 每条评论需要 2 个单位：预算 3 只够回复一条
        let f = fixture(3, 10);
        publish(&f.store, "vid-1").await;
        f.platform
            .add_comments("vid-1", vec![remote("c1", "a"), remote("c2", "b")]);

        let result = f.executor.run(10, 10, &CancellationToken::new()).await;
        assert!(result.quota_limited);
        assert_eq!(result.succeeded, 1);
        assert!(f.store.get_video("vid-1").await.unwrap().cursor.is_none());
        // 第二条评论未起草，窗口重置后可以正常回复
        let stored = f.store.comments_for("vid-1").await;
        assert_eq!(stored.len(), 1);
    }
}
