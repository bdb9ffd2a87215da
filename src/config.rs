//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `ANGUS__*` 覆盖（双下划线表示嵌套，如 `ANGUS__SCHEDULER__UPLOAD_LIMIT=3`）。
//! 运行时组件只接收 [`EngineConfig`]：构造后不可变，不读全局状态。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::quota::{QuotaKind, QuotaLimit};
use crate::retry::RetryPolicy;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub quota: QuotaSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub mediator: MediatorSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub llm: LlmSection,
}

/// [agent] 段：本 Agent 在协作网络中的身份
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_agent_id")]
    pub id: String,
    /// 负责创作歌曲的协作 Agent（create 指令转发目标）
    #[serde(default = "default_partner_agent")]
    pub partner_agent: String,
}

fn default_agent_id() -> String {
    "angus_agent".to_string()
}

fn default_partner_agent() -> String {
    "yona_agent".to_string()
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            id: default_agent_id(),
            partner_agent: default_partner_agent(),
        }
    }
}

/// [scheduler] 段：两个工作流的节奏与批量上限
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "default_hourly")]
    pub upload_interval_secs: u64,
    #[serde(default = "default_hourly")]
    pub comment_interval_secs: u64,
    /// 启动时立即跑一轮，而不是等第一个周期
    #[serde(default)]
    pub run_on_start: bool,
    #[serde(default = "default_upload_limit")]
    pub upload_limit: usize,
    #[serde(default = "default_video_limit")]
    pub video_limit: usize,
    #[serde(default = "default_reply_limit")]
    pub reply_limit: usize,
    #[serde(default = "default_max_comments_per_video")]
    pub max_comments_per_video: usize,
    /// 保留最近多少条 WorkflowRun
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    /// 单次外部调用超时（秒）
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

fn default_hourly() -> u64 {
    3600
}

fn default_upload_limit() -> usize {
    5
}

fn default_video_limit() -> usize {
    10
}

fn default_reply_limit() -> usize {
    10
}

fn default_max_comments_per_video() -> usize {
    100
}

fn default_history_size() -> usize {
    32
}

fn default_call_timeout_secs() -> u64 {
    120
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            upload_interval_secs: default_hourly(),
            comment_interval_secs: default_hourly(),
            run_on_start: false,
            upload_limit: default_upload_limit(),
            video_limit: default_video_limit(),
            reply_limit: default_reply_limit(),
            max_comments_per_video: default_max_comments_per_video(),
            history_size: default_history_size(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

/// [quota] 段：每种资源的窗口预算
#[derive(Debug, Clone, Deserialize)]
pub struct QuotaSection {
    /// 每窗口上传单位（平台每日上传上限）
    #[serde(default = "default_upload_units")]
    pub upload_units: u64,
    #[serde(default = "default_day_secs")]
    pub upload_window_secs: u64,
    #[serde(default = "default_api_calls")]
    pub api_calls: u64,
    #[serde(default = "default_minute_secs")]
    pub api_window_secs: u64,
}

fn default_upload_units() -> u64 {
    6
}

fn default_day_secs() -> u64 {
    86_400
}

fn default_api_calls() -> u64 {
    100
}

fn default_minute_secs() -> u64 {
    60
}

impl Default for QuotaSection {
    fn default() -> Self {
        Self {
            upload_units: default_upload_units(),
            upload_window_secs: default_day_secs(),
            api_calls: default_api_calls(),
            api_window_secs: default_minute_secs(),
        }
    }
}

/// [retry] 段：退避参数
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 抖动比例：0.25 表示在退避基础上最多再加 25%
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

fn default_base_delay_secs() -> u64 {
    5
}

fn default_max_delay_secs() -> u64 {
    3600
}

fn default_max_attempts() -> u32 {
    3
}

fn default_jitter_ratio() -> f64 {
    0.25
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            max_attempts: default_max_attempts(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

/// [mediator] 段：消息通道轮询
#[derive(Debug, Clone, Deserialize)]
pub struct MediatorSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// wait_for_mentions 超时（毫秒）
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// 等待工作流完成的会话超时（秒），超时发送「处理中」回复
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    /// 通道失败后再次轮询前的冷却时间（秒），至少 1 秒
    #[serde(default = "default_channel_cooldown_secs")]
    pub channel_cooldown_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_poll_timeout_ms() -> u64 {
    8000
}

fn default_session_timeout_secs() -> u64 {
    300
}

fn default_channel_cooldown_secs() -> u64 {
    5
}

impl Default for MediatorSection {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_timeout_ms: default_poll_timeout_ms(),
            session_timeout_secs: default_session_timeout_secs(),
            channel_cooldown_secs: default_channel_cooldown_secs(),
        }
    }
}

/// [storage] 段：SQLite 文件位置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StorageSection {
    /// 未设置时用 ./data/angus.db
    pub database_path: Option<PathBuf>,
}

impl StorageSection {
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("data/angus.db"))
    }
}

/// [llm] 段：生成式文本后端
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            model: default_model(),
            base_url: None,
        }
    }
}

/// 调度循环与执行器使用的不可变配置
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub upload_every: Duration,
    pub comment_every: Duration,
    pub run_on_start: bool,
    pub upload_limit: usize,
    pub video_limit: usize,
    pub reply_limit: usize,
    pub max_comments_per_video: usize,
    pub history_size: usize,
    pub call_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        AppConfig::default().engine_config().scheduler
    }
}

/// 消息中介使用的不可变配置
#[derive(Debug, Clone)]
pub struct MediatorConfig {
    pub agent_id: String,
    pub partner_agent: String,
    pub poll_timeout: Duration,
    pub session_timeout: Duration,
    pub channel_cooldown: Duration,
    /// 单次通道调用与意图归类的超时；轮询的上限为 poll_timeout + call_timeout
    pub call_timeout: Duration,
    /// 最多轮询次数；None 表示一直运行到取消（测试中注入有限次数）
    pub max_polls: Option<u64>,
    pub default_upload_limit: usize,
    pub default_video_limit: usize,
    pub default_reply_limit: usize,
}

impl Default for MediatorConfig {
    fn default() -> Self {
        AppConfig::default().engine_config().mediator
    }
}

/// 引擎配置：构造时传入调度循环与中介，之后不再变化
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub scheduler: SchedulerConfig,
    pub mediator: MediatorConfig,
    pub retry: RetryPolicy,
    pub quotas: HashMap<QuotaKind, QuotaLimit>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        AppConfig::default().engine_config()
    }
}

impl AppConfig {
    /// 将文件/环境变量形式的配置转换为运行时使用的 EngineConfig
    pub fn engine_config(&self) -> EngineConfig {
        let s = &self.scheduler;
        let scheduler = SchedulerConfig {
            upload_every: Duration::from_secs(s.upload_interval_secs.max(1)),
            comment_every: Duration::from_secs(s.comment_interval_secs.max(1)),
            run_on_start: s.run_on_start,
            upload_limit: s.upload_limit,
            video_limit: s.video_limit,
            reply_limit: s.reply_limit,
            max_comments_per_video: s.max_comments_per_video.max(1),
            history_size: s.history_size.max(1),
            call_timeout: Duration::from_secs(s.call_timeout_secs.max(1)),
        };

        let m = &self.mediator;
        let mediator = MediatorConfig {
            agent_id: self.agent.id.clone(),
            partner_agent: self.agent.partner_agent.clone(),
            poll_timeout: Duration::from_millis(m.poll_timeout_ms.max(1)),
            session_timeout: Duration::from_secs(m.session_timeout_secs.max(1)),
            channel_cooldown: Duration::from_secs(m.channel_cooldown_secs.max(1)),
            call_timeout: scheduler.call_timeout,
            max_polls: None,
            default_upload_limit: s.upload_limit,
            default_video_limit: s.video_limit,
            default_reply_limit: s.reply_limit,
        };

        let r = &self.retry;
        let retry = RetryPolicy::new(
            Duration::from_secs(r.base_delay_secs),
            Duration::from_secs(r.max_delay_secs),
            r.max_attempts,
        )
        .with_jitter_ratio(r.jitter_ratio);

        let q = &self.quota;
        let mut quotas = HashMap::new();
        quotas.insert(
            QuotaKind::UploadUnits,
            QuotaLimit::new(q.upload_units, Duration::from_secs(q.upload_window_secs.max(1))),
        );
        quotas.insert(
            QuotaKind::ApiCalls,
            QuotaLimit::new(q.api_calls, Duration::from_secs(q.api_window_secs.max(1))),
        );

        EngineConfig {
            scheduler,
            mediator,
            retry,
            quotas,
        }
    }
}

/// 从 config 目录加载配置，环境变量 ANGUS__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 ANGUS__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("ANGUS")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
