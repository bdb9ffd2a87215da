//! 配额账本：按资源类型的时间窗口预算
//!
//! 所有外部调用前先 `reserve` 扣减（失败关闭）；调用确定未产生远端效果时再 `release` 归还。
//! 窗口按墙钟边界对齐（窗口长度的整数倍），重置与预留在同一把锁内完成，
//! 恰好在边界到达的请求直接使用新窗口的完整预算。

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

/// 资源类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuotaKind {
    /// 平台上传单位
    UploadUnits,
    /// 生成式分析与评论回复等 API 调用
    ApiCalls,
}

impl QuotaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaKind::UploadUnits => "upload-units",
            QuotaKind::ApiCalls => "api-calls",
        }
    }
}

impl fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 时钟抽象：测试中可手动推进
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// 系统墙钟
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 手动时钟（测试与回放用）
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// 从 Unix 秒创建
    pub fn at_secs(secs: i64) -> Self {
        Self::new(Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now))
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// 单个资源类型的预算配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLimit {
    pub budget: u64,
    pub window: Duration,
}

impl QuotaLimit {
    pub fn new(budget: u64, window: Duration) -> Self {
        Self { budget, window }
    }
}

/// 一次预留的结果；release 时据此判断是否仍属于当前窗口
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub kind: QuotaKind,
    pub amount: u64,
    pub granted: bool,
    pub remaining: u64,
    window_start: DateTime<Utc>,
}

/// 对外展示的配额状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaStatus {
    pub kind: QuotaKind,
    pub budget: u64,
    pub reserved: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Budget {
    limit: QuotaLimit,
    reserved: u64,
    window_start: DateTime<Utc>,
}

impl Budget {
    fn window(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.limit.window).unwrap_or_else(|_| chrono::Duration::days(1))
    }

    fn reset_at(&self) -> DateTime<Utc> {
        self.window_start + self.window()
    }

    fn remaining(&self) -> u64 {
        self.limit.budget.saturating_sub(self.reserved)
    }

    /// 到达窗口边界时切换到新窗口；调用方必须持有账本锁
    fn roll(&mut self, now: DateTime<Utc>) {
        if now >= self.reset_at() {
            self.window_start = window_start(now, self.limit.window);
            self.reserved = 0;
        }
    }
}

/// 将时间对齐到所在窗口的起点
fn window_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    let window_ms = (window.as_millis() as i64).max(1);
    let now_ms = now.timestamp_millis();
    let aligned = now_ms - now_ms.rem_euclid(window_ms);
    Utc.timestamp_millis_opt(aligned).single().unwrap_or(now)
}

/// 配额账本：上传与评论两个工作流共享的唯一串行化点
pub struct QuotaLedger {
    budgets: Mutex<HashMap<QuotaKind, Budget>>,
    clock: Arc<dyn Clock>,
}

impl QuotaLedger {
    pub fn new(limits: HashMap<QuotaKind, QuotaLimit>, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        let budgets = limits
            .into_iter()
            .map(|(kind, limit)| {
                (
                    kind,
                    Budget {
                        limit,
                        reserved: 0,
                        window_start: window_start(now, limit.window),
                    },
                )
            })
            .collect();
        Self {
            budgets: Mutex::new(budgets),
            clock,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<QuotaKind, Budget>> {
        self.budgets.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 预留 amount 个单位；未配置的资源类型一律拒绝
    pub fn reserve(&self, kind: QuotaKind, amount: u64) -> Reservation {
        let now = self.clock.now();
        let mut budgets = self.lock();
        let Some(budget) = budgets.get_mut(&kind) else {
            tracing::warn!("Quota kind {} is not configured, denying reservation", kind);
            return Reservation {
                kind,
                amount,
                granted: false,
                remaining: 0,
                window_start: now,
            };
        };

        budget.roll(now);
        let granted = budget.remaining() >= amount;
        if granted {
            budget.reserved += amount;
        }
        tracing::debug!(
            kind = %kind,
            amount,
            granted,
            remaining = budget.remaining(),
            "quota reservation"
        );
        Reservation {
            kind,
            amount,
            granted,
            remaining: budget.remaining(),
            window_start: budget.window_start,
        }
    }

    /// 归还未消费的单位（调用在产生网络效果之前失败）
    pub fn release(&self, kind: QuotaKind, amount: u64) {
        let now = self.clock.now();
        let mut budgets = self.lock();
        if let Some(budget) = budgets.get_mut(&kind) {
            budget.roll(now);
            budget.reserved = budget.reserved.saturating_sub(amount);
        }
    }

    /// 按预留归还：窗口已经切换时旧预留随旧窗口作废，不再抵扣新窗口
    pub fn release_reservation(&self, reservation: &Reservation) {
        if !reservation.granted {
            return;
        }
        let now = self.clock.now();
        let mut budgets = self.lock();
        if let Some(budget) = budgets.get_mut(&reservation.kind) {
            budget.roll(now);
            if budget.window_start == reservation.window_start {
                budget.reserved = budget.reserved.saturating_sub(reservation.amount);
            }
        }
    }

    /// 用平台报告的剩余额度收紧本地预算（只降不升）
    pub fn sync_remaining(&self, kind: QuotaKind, remaining: u64) {
        let now = self.clock.now();
        let mut budgets = self.lock();
        if let Some(budget) = budgets.get_mut(&kind) {
            budget.roll(now);
            let floor = budget.limit.budget.saturating_sub(remaining);
            if floor > budget.reserved {
                tracing::info!(
                    kind = %kind,
                    remaining,
                    "Platform reports less quota than the local ledger, tightening"
                );
                budget.reserved = floor;
            }
        }
    }

    /// 距离当前窗口重置还有多久
    pub fn until_reset(&self, kind: QuotaKind) -> Option<Duration> {
        let now = self.clock.now();
        let mut budgets = self.lock();
        let budget = budgets.get_mut(&kind)?;
        budget.roll(now);
        (budget.reset_at() - now).to_std().ok()
    }

    pub fn status(&self, kind: QuotaKind) -> Option<QuotaStatus> {
        let now = self.clock.now();
        let mut budgets = self.lock();
        let budget = budgets.get_mut(&kind)?;
        budget.roll(now);
        Some(QuotaStatus {
            kind,
            budget: budget.limit.budget,
            reserved: budget.reserved,
            remaining: budget.remaining(),
            reset_at: budget.reset_at(),
        })
    }

    /// 所有资源类型的状态，按类型排序
    pub fn snapshot(&self) -> Vec<QuotaStatus> {
        let now = self.clock.now();
        let mut budgets = self.lock();
        let mut out: Vec<QuotaStatus> = budgets
            .iter_mut()
            .map(|(kind, budget)| {
                budget.roll(now);
                QuotaStatus {
                    kind: *kind,
                    budget: budget.limit.budget,
                    reserved: budget.reserved,
                    remaining: budget.remaining(),
                    reset_at: budget.reset_at(),
                }
            })
            .collect();
        out.sort_by_key(|s| s.kind);
        out
    }
}
