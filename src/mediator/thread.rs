//! 提及线程
//!
//! 每条入站提及（按消息 id）对应一个 MentionThread；重复投递的消息 id 被忽略。
//! 一个线程最多发出一次回复，由 [`ThreadRegistry::claim_reply`] 原子地保证。
//! 已见过的消息 id 单独保存，清理已关闭的线程不会让旧消息被再次处理。

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::adapters::Mention;
use crate::mediator::Intent;

/// 超过此数量时清理已关闭的线程
const MAX_TRACKED_THREADS: usize = 10_000;

/// 记住的消息 id 数量上限，超出后最早的先被遗忘
const MAX_SEEN_MENTIONS: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadPhase {
    Received,
    Dispatched,
    AwaitingRunCompletion,
    ReplySent,
    /// 运行未在会话超时内完成，已发出进行中回复
    TimedOut,
}

impl ThreadPhase {
    pub fn is_closed(&self) -> bool {
        matches!(self, ThreadPhase::ReplySent | ThreadPhase::TimedOut)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MentionThread {
    /// 入站消息 id
    pub mention_id: String,
    /// 通道上的线程 id（回复目标）
    pub thread_id: String,
    pub sender: String,
    pub request: String,
    pub intent: Intent,
    pub run_id: Option<String>,
    pub phase: ThreadPhase,
    pub reply_sent: bool,
    pub opened_at: DateTime<Utc>,
}

#[derive(Default)]
struct SeenMentions {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl SeenMentions {
    /// 记录消息 id；已见过时返回 false
    fn insert(&mut self, id: &str, cap: usize) -> bool {
        if !self.ids.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > cap {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }
}

pub struct ThreadRegistry {
    threads: RwLock<HashMap<String, MentionThread>>,
    seen: RwLock<SeenMentions>,
    max_threads: usize,
    max_seen: usize,
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::with_capacity(MAX_TRACKED_THREADS, MAX_SEEN_MENTIONS)
    }
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(max_threads: usize, max_seen: usize) -> Self {
        Self {
            threads: RwLock::new(HashMap::new()),
            seen: RwLock::new(SeenMentions::default()),
            max_threads: max_threads.max(1),
            max_seen: max_seen.max(max_threads).max(1),
        }
    }

    /// 为新提及建立线程；该消息 id 已经见过时返回 None
    pub async fn open(&self, mention: &Mention, intent: Intent) -> Option<MentionThread> {
        if !self.seen.write().await.insert(&mention.id, self.max_seen) {
            return None;
        }
        let mut threads = self.threads.write().await;
        if threads.len() >= self.max_threads {
            threads.retain(|_, t| !t.phase.is_closed());
        }
        let thread = MentionThread {
            mention_id: mention.id.clone(),
            thread_id: mention.thread_id.clone(),
            sender: mention.sender.clone(),
            request: mention.content.clone(),
            intent,
            run_id: None,
            phase: ThreadPhase::Received,
            reply_sent: false,
            opened_at: Utc::now(),
        };
        threads.insert(mention.id.clone(), thread.clone());
        Some(thread)
    }

    pub async fn attach_run(&self, mention_id: &str, run_id: &str) {
        if let Some(t) = self.threads.write().await.get_mut(mention_id) {
            t.run_id = Some(run_id.to_string());
            t.phase = ThreadPhase::Dispatched;
        }
    }

    /// 关闭后的线程不再改变阶段
    pub async fn set_phase(&self, mention_id: &str, phase: ThreadPhase) {
        if let Some(t) = self.threads.write().await.get_mut(mention_id) {
            if !t.phase.is_closed() {
                t.phase = phase;
            }
        }
    }

    /// 取得唯一一次回复的权利
    pub async fn claim_reply(&self, mention_id: &str) -> bool {
        match self.threads.write().await.get_mut(mention_id) {
            Some(t) if !t.reply_sent => {
                t.reply_sent = true;
                true
            }
            _ => false,
        }
    }

    pub async fn get(&self, mention_id: &str) -> Option<MentionThread> {
        self.threads.read().await.get(mention_id).cloned()
    }

    pub async fn all(&self) -> Vec<MentionThread> {
        let mut out: Vec<_> = self.threads.read().await.values().cloned().collect();
        out.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mention(id: &str) -> Mention {
        Mention {
            id: id.to_string(),
            thread_id: "thread-1".into(),
            sender: "yona_agent".into(),
            content: "status".into(),
        }
    }

    #[tokio::test]
    async fn test_redelivered_mention_is_ignored() {
        let registry = ThreadRegistry::new();
        assert!(registry.open(&mention("m1"), Intent::Status).await.is_some());
        assert!(registry.open(&mention("m1"), Intent::Status).await.is_none());
        assert_eq!(registry.all().await.len(), 1);
    }

    #[tokio::test]
    async fn test_evicted_thread_is_still_deduplicated() {
        let registry = ThreadRegistry::with_capacity(2, 10);
        for id in ["m1", "m2"] {
            registry.open(&mention(id), Intent::Status).await;
            registry.claim_reply(id).await;
            registry.set_phase(id, ThreadPhase::ReplySent).await;
        }
        // 第三条提及触发清理，m1 与 m2 的线程被移除
        assert!(registry.open(&mention("m3"), Intent::Status).await.is_some());
        assert!(registry.get("m1").await.is_none());

        assert!(registry.open(&mention("m1"), Intent::Status).await.is_none());
        assert_eq!(registry.all().await.len(), 1);
    }

    #[tokio::test]
    async fn test_reply_can_be_claimed_once() {
        let registry = ThreadRegistry::new();
        registry.open(&mention("m1"), Intent::Status).await;
        assert!(registry.claim_reply("m1").await);
        assert!(!registry.claim_reply("m1").await);
        assert!(!registry.claim_reply("unknown").await);
    }

    #[tokio::test]
    async fn test_closed_thread_keeps_phase() {
        let registry = ThreadRegistry::new();
        registry.open(&mention("m1"), Intent::Upload { limit: 1 }).await;
        registry.attach_run("m1", "run_1").await;
        registry.set_phase("m1", ThreadPhase::TimedOut).await;
        registry.set_phase("m1", ThreadPhase::ReplySent).await;

        let thread = registry.get("m1").await.unwrap();
        assert_eq!(thread.phase, ThreadPhase::TimedOut);
        assert_eq!(thread.run_id.as_deref(), Some("run_1"));
    }
}
