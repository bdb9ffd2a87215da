//! 提及文本 → 意图
//!
//! 识别的命令（不区分大小写，@ 提及会先被去掉）：
//! - `upload [n]`：上传最多 n 个待发布条目
//! - `comments [videos] [replies]`：处理评论
//! - `quota` / `check quota`、`status`、`pending`、`videos`、`help`
//! - `create <prompt>`：请合作 Agent 创作一首歌
//!
//! 其他文本作为 [`Intent::Freeform`]，交给生成式文本服务归类。

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

/// 请求中的数量上限
pub const MAX_REQUEST_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Upload { limit: usize },
    ProcessComments { video_limit: usize, reply_limit: usize },
    CheckQuota,
    Status,
    ListPending,
    ListVideos,
    Help,
    RequestSong { prompt: String },
    Freeform(String),
}

impl Intent {
    /// 只读意图直接回答，不经过调度
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            Intent::CheckQuota
                | Intent::Status
                | Intent::ListPending
                | Intent::ListVideos
                | Intent::Help
        )
    }

    /// 由归类标签构造意图；无法识别的标签返回 None
    pub fn from_label(label: &str, text: &str, defaults: &IntentDefaults) -> Option<Intent> {
        Some(match label.trim().to_lowercase().as_str() {
            "upload" => Intent::Upload {
                limit: defaults.upload_limit,
            },
            "comments" | "reply" | "replies" => Intent::ProcessComments {
                video_limit: defaults.video_limit,
                reply_limit: defaults.reply_limit,
            },
            "quota" => Intent::CheckQuota,
            "status" => Intent::Status,
            "pending" => Intent::ListPending,
            "videos" => Intent::ListVideos,
            "help" => Intent::Help,
            "song" | "create" => Intent::RequestSong {
                prompt: text.trim().to_string(),
            },
            _ => return None,
        })
    }
}

/// 未指定数量时使用的默认值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntentDefaults {
    pub upload_limit: usize,
    pub video_limit: usize,
    pub reply_limit: usize,
}

fn mention_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(<at[^>]*>.*?</at>|@[\w.-]+)").unwrap())
}

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(\d{1,6})\b").unwrap())
}

/// 去掉 @ 提及与多余空白
pub fn strip_mentions(text: &str) -> String {
    mention_re()
        .replace_all(text, " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn numbers(text: &str) -> Vec<usize> {
    number_re()
        .captures_iter(text)
        .filter_map(|c| c.get(1)?.as_str().parse().ok())
        .map(|n: usize| n.clamp(1, MAX_REQUEST_LIMIT))
        .collect()
}

pub fn parse_intent(text: &str, defaults: &IntentDefaults) -> Intent {
    let cleaned = strip_mentions(text);
    let lower = cleaned.to_lowercase();
    let mut words = lower.split_whitespace();
    let Some(mut command) = words.next() else {
        return Intent::Help;
    };
    if command == "check" || command == "show" || command == "list" {
        command = words.next().unwrap_or(command);
    }

    match command.trim_end_matches(&['?', '!', '.', ':'][..]) {
        "help" | "commands" | "?" => Intent::Help,
        "upload" | "publish" => Intent::Upload {
            limit: numbers(&lower)
                .first()
                .copied()
                .unwrap_or(defaults.upload_limit),
        },
        "comments" | "comment" | "reply" | "replies" | "process" => {
            let n = numbers(&lower);
            Intent::ProcessComments {
                video_limit: n.first().copied().unwrap_or(defaults.video_limit),
                reply_limit: n.get(1).copied().unwrap_or(defaults.reply_limit),
            }
        }
        "quota" | "check-quota" => Intent::CheckQuota,
        "status" => Intent::Status,
        "pending" | "queue" => Intent::ListPending,
        "videos" | "uploads" => Intent::ListVideos,
        "create" | "make" => {
            let prompt = cleaned
                .split_once(char::is_whitespace)
                .map(|(_, rest)| rest.trim().to_string())
                .unwrap_or_default();
            if prompt.is_empty() {
                Intent::Help
            } else {
                Intent::RequestSong { prompt }
            }
        }
        _ => Intent::Freeform(cleaned),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULTS: IntentDefaults = IntentDefaults {
        upload_limit: 5,
        video_limit: 10,
        reply_limit: 10,
    };

    #[test]
    fn test_upload_with_count() {
        assert_eq!(
            parse_intent("@angus_agent upload 2 songs", &DEFAULTS),
            Intent::Upload { limit: 2 }
        );
        assert_eq!(parse_intent("Upload", &DEFAULTS), Intent::Upload { limit: 5 });
        assert_eq!(
            parse_intent("upload 9999", &DEFAULTS),
            Intent::Upload {
                limit: MAX_REQUEST_LIMIT
            }
        );
    }

    #[test]
    fn test_comments_limits() {
        assert_eq!(
            parse_intent("comments 3 20", &DEFAULTS),
            Intent::ProcessComments {
                video_limit: 3,
                reply_limit: 20
            }
        );
        assert_eq!(
            parse_intent("process comments", &DEFAULTS),
            Intent::ProcessComments {
                video_limit: 10,
                reply_limit: 10
            }
        );
    }

    #[test]
    fn test_read_only_commands() {
        assert_eq!(parse_intent("check quota", &DEFAULTS), Intent::CheckQuota);
        assert_eq!(parse_intent("status?", &DEFAULTS), Intent::Status);
        assert_eq!(parse_intent("list pending", &DEFAULTS), Intent::ListPending);
        assert_eq!(parse_intent("videos", &DEFAULTS), Intent::ListVideos);
        assert_eq!(parse_intent("@angus_agent", &DEFAULTS), Intent::Help);
        assert!(Intent::Status.is_read_only());
        assert!(!Intent::Upload { limit: 1 }.is_read_only());
    }

    #[test]
    fn test_create_keeps_prompt_case() {
        assert_eq!(
            parse_intent("@angus_agent create A Song About Rain", &DEFAULTS),
            Intent::RequestSong {
                prompt: "A Song About Rain".into()
            }
        );
        assert_eq!(parse_intent("create", &DEFAULTS), Intent::Help);
    }

    #[test]
    fn test_freeform_and_labels() {
        let intent = parse_intent("could you put the new tracks online?", &DEFAULTS);
        assert_eq!(
            intent,
            Intent::Freeform("could you put the new tracks online?".into())
        );
        assert_eq!(
            Intent::from_label("Upload", "x", &DEFAULTS),
            Some(Intent::Upload { limit: 5 })
        );
        assert_eq!(Intent::from_label("unclear", "x", &DEFAULTS), None);
    }

    #[test]
    fn test_lark_style_at_tags_are_stripped() {
        assert_eq!(
            strip_mentions("<at user_id=\"ou_1\">@Angus</at> status"),
            "status"
        );
    }
}
