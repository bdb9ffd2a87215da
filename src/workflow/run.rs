//! WorkflowRun 记录
//!
//! 每次执行（节拍、提及或控制接口触发）生成一条记录，保存在容量固定的环形历史中。

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

/// 工作流类别；同类运行互斥，不同类可以并行
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    Upload,
    Comments,
}

impl WorkflowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowKind::Upload => "upload",
            WorkflowKind::Comments => "comments",
        }
    }
}

impl fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 触发来源
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunTrigger {
    Cadence,
    Mention { thread_id: String },
    Control,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Partial,
    QuotaLimited,
    Failed,
}

/// 单个实体上的失败（不中断整轮运行）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityFailure {
    pub entity: String,
    pub error: String,
}

/// 一次执行的统计
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub kind: WorkflowKind,
    /// 本轮选中处理的实体数（上传：条目；评论：需要回复的评论）
    pub selected: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// 无需处理而跳过的实体（已解决、频道自己的评论等）
    pub skipped: usize,
    pub quota_limited: bool,
    /// 收到关闭信号，提前停止选取
    pub interrupted: bool,
    /// 运行级错误（如存储不可达），整轮以 failed 结束
    pub aborted: Option<String>,
    pub entities: Vec<String>,
    pub errors: Vec<EntityFailure>,
}

impl RunResult {
    pub fn new(kind: WorkflowKind) -> Self {
        Self {
            kind,
            selected: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            quota_limited: false,
            interrupted: false,
            aborted: None,
            entities: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub(crate) fn touch(&mut self, entity: &str) {
        if !self.entities.iter().any(|e| e == entity) {
            self.entities.push(entity.to_string());
        }
    }

    pub(crate) fn record_failure(&mut self, entity: &str, error: impl ToString) {
        self.failed += 1;
        self.touch(entity);
        self.errors.push(EntityFailure {
            entity: entity.to_string(),
            error: error.to_string(),
        });
    }

    pub fn outcome(&self) -> RunOutcome {
        if self.aborted.is_some() {
            RunOutcome::Failed
        } else if self.quota_limited {
            RunOutcome::QuotaLimited
        } else if self.failed == 0 && !self.interrupted {
            RunOutcome::Success
        } else if self.succeeded > 0 || self.failed == 0 {
            RunOutcome::Partial
        } else {
            RunOutcome::Failed
        }
    }

    /// 面向人的一句话总结，如 "2 of 5 uploaded, quota exhausted"
    pub fn summary(&self) -> String {
        let mut parts = vec![match self.kind {
            WorkflowKind::Upload => format!("{} of {} uploaded", self.succeeded, self.selected),
            WorkflowKind::Comments => format!("{} of {} comments replied", self.succeeded, self.selected),
        }];
        if self.failed > 0 {
            parts.push(format!("{} failed", self.failed));
        }
        if self.quota_limited {
            parts.push("quota exhausted".to_string());
        }
        if self.interrupted {
            parts.push("interrupted by shutdown".to_string());
        }
        if let Some(err) = &self.aborted {
            parts.push(format!("aborted: {err}"));
        }
        parts.join(", ")
    }
}

/// 一次工作流运行
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowRun {
    pub id: String,
    pub kind: WorkflowKind,
    pub trigger: RunTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub entities: Vec<String>,
    /// 运行结束前为 None
    pub outcome: Option<RunOutcome>,
    pub summary: Option<String>,
    pub error: Option<String>,
}

impl WorkflowRun {
    pub fn is_running(&self) -> bool {
        self.finished_at.is_none()
    }
}

pub fn new_run_id() -> String {
    format!("run_{}", uuid::Uuid::new_v4())
}

/// 最近 N 次运行
pub struct RunHistory {
    capacity: usize,
    runs: RwLock<VecDeque<WorkflowRun>>,
}

impl RunHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            runs: RwLock::new(VecDeque::new()),
        }
    }

    /// 记录一次开始的运行
    pub async fn begin(&self, id: &str, kind: WorkflowKind, trigger: RunTrigger) -> WorkflowRun {
        let run = WorkflowRun {
            id: id.to_string(),
            kind,
            trigger,
            started_at: Utc::now(),
            finished_at: None,
            entities: Vec::new(),
            outcome: None,
            summary: None,
            error: None,
        };
        let mut runs = self.runs.write().await;
        runs.push_back(run.clone());
        while runs.len() > self.capacity {
            runs.pop_front();
        }
        run
    }

    /// 用执行结果补全运行记录；记录已被挤出历史时只返回补全后的副本
    pub async fn finish(&self, mut run: WorkflowRun, result: &RunResult) -> WorkflowRun {
        run.finished_at = Some(Utc::now());
        run.entities = result.entities.clone();
        run.outcome = Some(result.outcome());
        run.summary = Some(result.summary());
        run.error = result.aborted.clone().or_else(|| {
            if result.errors.is_empty() {
                None
            } else {
                Some(
                    result
                        .errors
                        .iter()
                        .map(|e| format!("{}: {}", e.entity, e.error))
                        .collect::<Vec<_>>()
                        .join("; "),
                )
            }
        });

        let mut runs = self.runs.write().await;
        if let Some(slot) = runs.iter_mut().find(|r| r.id == run.id) {
            *slot = run.clone();
        }
        run
    }

    pub async fn get(&self, id: &str) -> Option<WorkflowRun> {
        self.runs.read().await.iter().find(|r| r.id == id).cloned()
    }

    /// 最近的运行，新的在前
    pub async fn recent(&self, n: usize) -> Vec<WorkflowRun> {
        self.runs.read().await.iter().rev().take(n).cloned().collect()
    }

    pub async fn running(&self) -> Vec<WorkflowRun> {
        self.runs
            .read()
            .await
            .iter()
            .filter(|r| r.is_running())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_for_quota_limited_upload() {
        let mut r = RunResult::new(WorkflowKind::Upload);
        r.selected = 5;
        r.succeeded = 2;
        r.quota_limited = true;
        assert_eq!(r.summary(), "2 of 5 uploaded, quota exhausted");
        assert_eq!(r.outcome(), RunOutcome::QuotaLimited);
    }

    #[test]
    fn test_outcomes() {
        let mut r = RunResult::new(WorkflowKind::Comments);
        assert_eq!(r.outcome(), RunOutcome::Success);
        r.succeeded = 1;
        r.record_failure("c2", "model unavailable");
        assert_eq!(r.outcome(), RunOutcome::Partial);
        r.succeeded = 0;
        assert_eq!(r.outcome(), RunOutcome::Failed);
        r.aborted = Some("db down".into());
        assert_eq!(r.outcome(), RunOutcome::Failed);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let history = RunHistory::new(2);
        let mut begun = Vec::new();
        for i in 0..3 {
            begun.push(
                history
                    .begin(&format!("run_{i}"), WorkflowKind::Upload, RunTrigger::Cadence)
                    .await,
            );
        }
        let recent = history.recent(10).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, "run_2");
        assert!(history.get("run_0").await.is_none());

        let last = begun.pop().unwrap();
        let finished = history
            .finish(last, &RunResult::new(WorkflowKind::Upload))
            .await;
        assert_eq!(finished.outcome, Some(RunOutcome::Success));
        assert_eq!(history.get("run_2").await.unwrap().outcome, Some(RunOutcome::Success));
        assert_eq!(history.running().await.len(), 1);

        // 已被挤出的运行仍能补全
        let evicted = history
            .finish(begun.remove(0), &RunResult::new(WorkflowKind::Upload))
            .await;
        assert!(!evicted.is_running());
    }
}
