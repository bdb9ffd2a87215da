//! 消息中介会话循环
//!
//! 轮询通道上的提及，每条提及解析为意图并在独立任务中处理，轮询从不等待运行结束。
//! 只读意图直接回答；运行类意图经控制接口排队执行，会话超时内未完成则发一条进行中回复并关闭线程，
//! 之后的完成只记录日志。

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::adapters::{GenerativeText, Mention, MessageChannel};
use crate::config::MediatorConfig;
use crate::core::orchestrator::{EngineStatus, QuotaReport, RunRequest};
use crate::core::{ControlHandle, EngineError};
use crate::mediator::{parse_intent, Intent, IntentDefaults, MentionThread, ThreadPhase, ThreadRegistry};
use crate::workflow::{bounded, RunOutcome, RunTrigger, WorkflowRun};

const LIST_LIMIT: usize = 10;

const HELP_TEXT: &str = "I can: `upload [n]` pending songs, process `comments [videos] [replies]`, \
show `quota`, `status`, `pending` or `videos`, and `create <prompt>` to ask for a new song.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    AwaitingMentions,
    Dispatch,
}

struct Inner {
    config: MediatorConfig,
    channel: Arc<dyn MessageChannel>,
    generator: Arc<dyn GenerativeText>,
    control: ControlHandle,
    threads: Arc<ThreadRegistry>,
}

pub struct MessageMediator {
    inner: Arc<Inner>,
    phase_tx: watch::Sender<SessionPhase>,
}

impl MessageMediator {
    pub fn new(
        config: MediatorConfig,
        channel: Arc<dyn MessageChannel>,
        generator: Arc<dyn GenerativeText>,
        control: ControlHandle,
    ) -> Self {
        let (phase_tx, _) = watch::channel(SessionPhase::Idle);
        Self {
            inner: Arc::new(Inner {
                config,
                channel,
                generator,
                control,
                threads: Arc::new(ThreadRegistry::new()),
            }),
            phase_tx,
        }
    }

    pub fn threads(&self) -> Arc<ThreadRegistry> {
        self.inner.threads.clone()
    }

    pub fn phase(&self) -> watch::Receiver<SessionPhase> {
        self.phase_tx.subscribe()
    }

    /// 轮询直到取消（或达到 max_polls）；返回前等待所有提及处理完毕
    pub async fn run(&self, cancel: CancellationToken) {
        let config = &self.inner.config;
        let mut handlers: JoinSet<()> = JoinSet::new();
        let mut polls: u64 = 0;

        tracing::info!(agent = %config.agent_id, "Message mediator started");

        loop {
            if cancel.is_cancelled() {
                break;
            }
            if config.max_polls.is_some_and(|max| polls >= max) {
                break;
            }
            polls += 1;

            self.phase_tx.send_replace(SessionPhase::AwaitingMentions);
            let batch = tokio::select! {
                _ = cancel.cancelled() => break,
                batch = bounded(
                    config.poll_timeout + config.call_timeout,
                    "await_mentions",
                    self.inner.channel.await_mentions(config.poll_timeout),
                ) => batch,
            };

            match batch {
                Ok(mentions) => {
                    if !mentions.is_empty() {
                        self.phase_tx.send_replace(SessionPhase::Dispatch);
                        for mention in mentions {
                            self.dispatch(mention, &mut handlers).await;
                        }
                    }
                }
                Err(e) => {
                    let err = EngineError::ChannelUnavailable(e.to_string());
                    tracing::warn!(
                        "{}, retrying in {}s",
                        err,
                        config.channel_cooldown.as_secs_f64()
                    );
                    self.phase_tx.send_replace(SessionPhase::Idle);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(config.channel_cooldown) => {}
                    }
                }
            }

            self.phase_tx.send_replace(SessionPhase::Idle);
            while let Some(joined) = handlers.try_join_next() {
                if let Err(e) = joined {
                    tracing::error!("Mention handler failed: {}", e);
                }
            }
        }

        self.phase_tx.send_replace(SessionPhase::Idle);
        while let Some(joined) = handlers.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Mention handler failed: {}", e);
            }
        }
        tracing::info!("Message mediator stopped after {} polls", polls);
    }

    async fn dispatch(&self, mention: Mention, handlers: &mut JoinSet<()>) {
        let intent = parse_intent(&mention.content, &self.inner.defaults());
        let Some(thread) = self.inner.threads.open(&mention, intent).await else {
            tracing::debug!(mention = %mention.id, "Ignoring redelivered mention");
            return;
        };
        tracing::info!(
            mention = %thread.mention_id,
            sender = %thread.sender,
            intent = ?thread.intent,
            "Mention received"
        );
        let inner = self.inner.clone();
        handlers.spawn(async move { inner.handle(thread).await });
    }
}

impl Inner {
    fn defaults(&self) -> IntentDefaults {
        IntentDefaults {
            upload_limit: self.config.default_upload_limit,
            video_limit: self.config.default_video_limit,
            reply_limit: self.config.default_reply_limit,
        }
    }

    async fn handle(&self, thread: MentionThread) {
        let intent = match &thread.intent {
            Intent::Freeform(text) => self.resolve_freeform(text).await,
            other => other.clone(),
        };

        if intent.is_read_only() {
            let text = self.answer(&intent).await;
            self.reply(&thread, &text, ThreadPhase::ReplySent).await;
            return;
        }

        match intent {
            Intent::Upload { limit } => {
                self.run_and_reply(&thread, RunRequest::Upload { limit }).await
            }
            Intent::ProcessComments {
                video_limit,
                reply_limit,
            } => {
                self.run_and_reply(
                    &thread,
                    RunRequest::Comments {
                        video_limit,
                        reply_limit,
                    },
                )
                .await
            }
            Intent::RequestSong { prompt } => {
                let text = self.request_song(&prompt).await;
                self.reply(&thread, &text, ThreadPhase::ReplySent).await;
            }
            _ => self.reply(&thread, HELP_TEXT, ThreadPhase::ReplySent).await,
        }
    }

    /// 自由文本交给生成式文本服务归类；无法归类时按 help 处理
    async fn resolve_freeform(&self, text: &str) -> Intent {
        match bounded(
            self.config.call_timeout,
            "classify_intent",
            self.generator.classify_intent(text),
        )
        .await
        {
            Ok(label) => Intent::from_label(&label, text, &self.defaults()).unwrap_or(Intent::Help),
            Err(e) => {
                tracing::warn!("Intent classification failed: {}", e);
                Intent::Help
            }
        }
    }

    async fn answer(&self, intent: &Intent) -> String {
        match intent {
            Intent::CheckQuota => format_quota(&self.control.query_quota().await),
            Intent::Status => format_status(&self.control.get_status().await),
            Intent::ListPending => match self.control.list_pending(LIST_LIMIT).await {
                Ok(items) if items.is_empty() => "No pending songs.".to_string(),
                Ok(items) => format!(
                    "{} pending: {}",
                    items.len(),
                    items.iter().map(|i| i.id.as_str()).collect::<Vec<_>>().join(", ")
                ),
                Err(e) => format!("Could not list pending songs: {e}"),
            },
            Intent::ListVideos => match self.control.list_videos(LIST_LIMIT).await {
                Ok(videos) if videos.is_empty() => "No published videos yet.".to_string(),
                Ok(videos) => format!(
                    "Recent videos: {}",
                    videos
                        .iter()
                        .map(|v| format!("{} ({})", v.title, v.publish_id))
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
                Err(e) => format!("Could not list videos: {e}"),
            },
            _ => HELP_TEXT.to_string(),
        }
    }

    async fn request_song(&self, prompt: &str) -> String {
        let partner = &self.config.partner_agent;
        let message = format!("@{partner} create {prompt}");
        match bounded(
            self.config.call_timeout,
            "send_message",
            self.channel.send_message(partner, &message),
        )
        .await
        {
            Ok(()) => format!("Asked {partner} to create: {prompt}"),
            Err(e) => {
                tracing::warn!("Failed to reach {}: {}", partner, e);
                format!("Could not reach {partner}: {e}")
            }
        }
    }

    async fn run_and_reply(&self, thread: &MentionThread, request: RunRequest) {
        let trigger = RunTrigger::Mention {
            thread_id: thread.thread_id.clone(),
        };
        let (run_id, mut done) = match self.control.submit(request, trigger) {
            Ok(submitted) => submitted,
            Err(e) => {
                let text = format!("Cannot start the {} run: {e}", request.kind());
                self.reply(thread, &text, ThreadPhase::ReplySent).await;
                return;
            }
        };
        self.threads.attach_run(&thread.mention_id, &run_id).await;
        self.threads
            .set_phase(&thread.mention_id, ThreadPhase::AwaitingRunCompletion)
            .await;

        match tokio::time::timeout(self.config.session_timeout, &mut done).await {
            Ok(Ok(run)) => {
                self.reply(thread, &format_run(&run), ThreadPhase::ReplySent)
                    .await
            }
            Ok(Err(_)) => {
                let text = format!("Run {run_id} was dropped because the engine is shutting down.");
                self.reply(thread, &text, ThreadPhase::ReplySent).await;
            }
            Err(_) => {
                let text = format!(
                    "The {} run is still in progress (run {run_id}). Ask for `status` later.",
                    request.kind()
                );
                self.reply(thread, &text, ThreadPhase::TimedOut).await;
                if let Ok(run) = done.await {
                    tracing::info!(
                        run_id = %run.id,
                        mention = %thread.mention_id,
                        "Run finished after the thread timed out: {}",
                        run.summary.as_deref().unwrap_or_default()
                    );
                }
            }
        }
    }

    /// 每个线程只回复一次
    async fn reply(&self, thread: &MentionThread, text: &str, phase: ThreadPhase) {
        if !self.threads.claim_reply(&thread.mention_id).await {
            tracing::debug!(mention = %thread.mention_id, "Reply already sent, dropping");
            return;
        }
        self.threads.set_phase(&thread.mention_id, phase).await;
        if let Err(e) = bounded(
            self.config.call_timeout,
            "send_reply",
            self.channel
                .send_reply(&thread.thread_id, text, &[thread.sender.clone()]),
        )
        .await
        {
            tracing::warn!(mention = %thread.mention_id, "Failed to send reply: {}", e);
        }
    }
}

fn format_run(run: &WorkflowRun) -> String {
    let summary = run.summary.as_deref().unwrap_or("no result");
    match run.outcome {
        Some(RunOutcome::Failed) => format!("The {} run failed: {summary}", run.kind),
        _ => format!("Done with {}: {summary}", run.kind),
    }
}

fn format_quota(report: &QuotaReport) -> String {
    let mut parts: Vec<String> = report
        .ledger
        .iter()
        .map(|q| {
            format!(
                "{} {}/{} left (resets {})",
                q.kind,
                q.remaining,
                q.budget,
                q.reset_at.format("%Y-%m-%d %H:%M UTC")
            )
        })
        .collect();
    match (&report.platform, &report.platform_error) {
        (Some(p), _) => parts.push(format!("platform reports {} remaining", p.remaining)),
        (None, Some(e)) => parts.push(format!("platform quota unavailable: {e}")),
        _ => {}
    }
    format!("Quota: {}", parts.join("; "))
}

fn format_status(status: &EngineStatus) -> String {
    let running = if status.running.is_empty() {
        "nothing running".to_string()
    } else {
        format!(
            "running: {}",
            status
                .running
                .iter()
                .map(|r| r.kind.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )
    };
    let last = status
        .last_runs
        .iter()
        .filter(|r| !r.is_running())
        .take(3)
        .map(|r| format!("{} {}", r.kind, r.summary.as_deref().unwrap_or_default()))
        .collect::<Vec<_>>();
    if last.is_empty() {
        format!("Status: {running}, no finished runs yet")
    } else {
        format!("Status: {running}; last runs: {}", last.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;

    use crate::adapters::{MockChannel, MockGenerator, MockPlatform};
    use crate::config::EngineConfig;
    use crate::core::{Orchestrator, SchedulerLoop};
    use crate::model::CatalogItem;
    use crate::quota::SystemClock;
    use crate::store::{EntityStore, MemoryStore};

    struct Harness {
        channel: Arc<MockChannel>,
        generator: Arc<MockGenerator>,
        mediator: MessageMediator,
        cancel: CancellationToken,
        scheduler: tokio::task::JoinHandle<()>,
    }

    async fn harness(max_polls: u64, pending: &[&str]) -> Harness {
        harness_with_call_timeout(max_polls, pending, Duration::from_secs(5)).await
    }

    async fn harness_with_call_timeout(
        max_polls: u64,
        pending: &[&str],
        call_timeout: Duration,
    ) -> Harness {
        let store = Arc::new(MemoryStore::new());
        for id in pending {
            store
                .save_item(&CatalogItem::new(*id, "s", Utc::now()))
                .await
                .unwrap();
        }
        let generator = Arc::new(MockGenerator::new());
        let cancel = CancellationToken::new();
        let orch = Arc::new(Orchestrator::new(
            &EngineConfig::default(),
            store,
            Arc::new(MockPlatform::new()),
            generator.clone(),
            Arc::new(SystemClock),
            cancel.clone(),
        ));
        let (scheduler, control) = SchedulerLoop::new(orch);
        let scheduler = tokio::spawn(scheduler.run());

        let channel = Arc::new(MockChannel::new());
        let config = MediatorConfig {
            poll_timeout: Duration::from_millis(5),
            channel_cooldown: Duration::from_millis(1),
            call_timeout,
            max_polls: Some(max_polls),
            ..MediatorConfig::default()
        };
        let mediator = MessageMediator::new(config, channel.clone(), generator.clone(), control);
        Harness {
            channel,
            generator,
            mediator,
            cancel,
            scheduler,
        }
    }

    fn mention(id: &str, content: &str) -> Mention {
        Mention {
            id: id.to_string(),
            thread_id: format!("thread-{id}"),
            sender: "yona_agent".into(),
            content: content.to_string(),
        }
    }

    impl Harness {
        async fn run(self) -> Arc<MockChannel> {
            self.mediator.run(self.cancel.clone()).await;
            self.cancel.cancel();
            self.scheduler.await.unwrap();
            self.channel
        }
    }

    #[tokio::test]
    async fn test_status_is_answered_directly() {
        let h = harness(2, &[]).await;
        h.channel.push_mentions(vec![mention("m1", "@angus_agent status")]);
        let channel = h.run().await;

        let replies = channel.replies();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].text.starts_with("Status:"));
        assert_eq!(replies[0].mentions, vec!["yona_agent".to_string()]);
    }

    #[tokio::test]
    async fn test_channel_errors_do_not_stop_polling() {
        let h = harness(3, &[]).await;
        h.channel
            .push_error(crate::core::ExternalError::Transient("socket closed".into()));
        h.channel.push_mentions(vec![mention("m1", "help")]);
        let channel = h.run().await;

        assert_eq!(channel.polls(), 3);
        assert_eq!(channel.replies().len(), 1);
    }

    #[tokio::test]
    async fn test_hung_channel_calls_are_bounded() {
        let h = harness_with_call_timeout(3, &[], Duration::from_millis(20)).await;
        h.channel.push_mentions(vec![
            mention("m1", "status"),
            mention("m2", "create a song about rain"),
        ]);
        h.channel.set_unresponsive(true);
        let threads = h.mediator.threads();

        let channel = tokio::time::timeout(Duration::from_secs(5), h.run())
            .await
            .expect("mediator stopped despite a hung channel");

        assert_eq!(channel.polls(), 3);
        assert!(channel.replies().is_empty());
        assert!(channel.messages().is_empty());
        for id in ["m1", "m2"] {
            let thread = threads.get(id).await.unwrap();
            assert_eq!(thread.phase, ThreadPhase::ReplySent);
        }
    }

    #[tokio::test]
    async fn test_freeform_is_classified() {
        let h = harness(2, &["song-1"]).await;
        h.generator
            .label_intent("could you list what is waiting?", "pending");
        h.channel
            .push_mentions(vec![mention("m1", "could you list what is waiting?")]);
        let channel = h.run().await;

        assert_eq!(channel.replies()[0].text, "1 pending: song-1");
    }

    #[tokio::test]
    async fn test_song_request_goes_to_partner() {
        let h = harness(2, &[]).await;
        h.channel
            .push_mentions(vec![mention("m1", "create a lullaby for robots")]);
        let channel = h.run().await;

        let messages = channel.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, "yona_agent");
        assert!(messages[0].1.ends_with("create a lullaby for robots"));
        assert_eq!(channel.replies().len(), 1);
    }
}
