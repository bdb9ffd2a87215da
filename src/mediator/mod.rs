//! 消息中介
//!
//! 把 Agent 消息通道上的提及转换为意图：只读查询直接回答，运行请求交给调度循环，
//! 每条提及对应一个线程、最多一次回复。

pub mod intent;
pub mod session;
pub mod thread;

pub use intent::{parse_intent, strip_mentions, Intent, IntentDefaults, MAX_REQUEST_LIMIT};
pub use session::{MessageMediator, SessionPhase};
pub use thread::{MentionThread, ThreadPhase, ThreadRegistry};
