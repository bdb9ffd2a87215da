//! OpenAI 兼容的生成式文本适配器
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）。需要结构化结果的调用要求模型输出 JSON，
//! 从回复中截取第一个 JSON 对象再用 serde_json 解析。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::adapters::{ContentAnalysis, GenerativeText, ReplyContext};
use crate::config::LlmSection;
use crate::core::ExternalError;
use crate::model::{ItemMetadata, Sentiment};

const PERSONA: &str = "You are Angus, the assistant of an independent music channel. \
Be warm, brief and never promise release dates.";

fn json_object_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\{.*\}").unwrap())
}

/// 将 API 错误映射为外部错误类别
fn classify_error(message: String) -> ExternalError {
    let lower = message.to_lowercase();
    if lower.contains("insufficient_quota") || lower.contains("quota") {
        ExternalError::Quota(message)
    } else if lower.contains("rate limit") || lower.contains("429") {
        ExternalError::RateLimited(message)
    } else if lower.contains("invalid_request") || lower.contains("400") {
        ExternalError::Permanent(message)
    } else {
        ExternalError::Transient(message)
    }
}

fn parse_json<T: DeserializeOwned>(raw: &str) -> Result<T, ExternalError> {
    let body = json_object_re()
        .find(raw)
        .map(|m| m.as_str())
        .unwrap_or(raw);
    serde_json::from_str(body)
        .map_err(|e| ExternalError::Transient(format!("unparseable model output: {e}")))
}

#[derive(Deserialize)]
struct MetadataOutput {
    title: String,
    description: String,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Deserialize)]
struct LabelOutput {
    label: String,
}

/// OpenAI 兼容客户端
pub struct OpenAiGenerator {
    client: Client<OpenAIConfig>,
    model: String,
    total_tokens: AtomicU64,
}

impl OpenAiGenerator {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            total_tokens: AtomicU64::new(0),
        }
    }

    pub fn from_config(section: &LlmSection) -> Self {
        Self::new(section.base_url.as_deref(), &section.model, None)
    }

    /// 累计 token 使用量
    pub fn total_tokens(&self) -> u64 {
        self.total_tokens.load(Ordering::Relaxed)
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String, ExternalError> {
        let messages = vec![
            ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(system.to_string())
                    .build()
                    .map_err(|e| ExternalError::Permanent(e.to_string()))?,
            ),
            ChatCompletionRequestMessage::User(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(user.to_string())
                    .build()
                    .map_err(|e| ExternalError::Permanent(e.to_string()))?,
            ),
        ];
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .build()
            .map_err(|e| ExternalError::Permanent(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| classify_error(e.to_string()))?;

        if let Some(usage) = &response.usage {
            self.total_tokens
                .fetch_add(usage.total_tokens as u64, Ordering::Relaxed);
        }

        Ok(response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl GenerativeText for OpenAiGenerator {
    async fn analyze_content(&self, source: &str) -> Result<ContentAnalysis, ExternalError> {
        let raw = self
            .complete(
                "Describe the song at the given location. Answer with JSON only: \
                 {\"themes\": [string], \"genre\": string, \"mood\": string}",
                source,
            )
            .await?;
        parse_json(&raw)
    }

    async fn generate_metadata(
        &self,
        analysis: &ContentAnalysis,
        style: Option<&str>,
    ) -> Result<ItemMetadata, ExternalError> {
        let prompt = format!(
            "Themes: {}\nGenre: {}\nMood: {}\nStyle: {}",
            analysis.themes.join(", "),
            analysis.genre,
            analysis.mood,
            style.unwrap_or("-"),
        );
        let raw = self
            .complete(
                "Write a video title (max 100 chars), a short description and up to 10 tags. \
                 Answer with JSON only: {\"title\": string, \"description\": string, \"tags\": [string]}",
                &prompt,
            )
            .await?;
        let out: MetadataOutput = parse_json(&raw)?;
        if out.title.trim().is_empty() {
            return Err(ExternalError::Transient("model returned an empty title".to_string()));
        }
        Ok(ItemMetadata {
            title: out.title.chars().take(100).collect(),
            description: out.description,
            tags: out.tags.into_iter().take(10).collect(),
        })
    }

    async fn analyze_sentiment(&self, text: &str) -> Result<Sentiment, ExternalError> {
        let raw = self
            .complete(
                "Classify the comment as positive, neutral, negative or question. \
                 Answer with JSON only: {\"label\": string}",
                text,
            )
            .await?;
        let out: LabelOutput = parse_json(&raw)?;
        Ok(Sentiment::from_label(&out.label))
    }

    async fn generate_reply(
        &self,
        text: &str,
        sentiment: Sentiment,
        context: &ReplyContext,
    ) -> Result<String, ExternalError> {
        let prompt = format!(
            "Video: {}\nStyle: {}\nComment ({}): {}",
            context.title,
            context.style.as_deref().unwrap_or("-"),
            sentiment.as_str(),
            text,
        );
        let system = format!("{PERSONA} Reply to the viewer comment in one or two sentences.");
        let reply = self.complete(&system, &prompt).await?;
        let reply = reply.trim();
        if reply.is_empty() {
            return Err(ExternalError::Transient("model returned an empty reply".to_string()));
        }
        Ok(reply.to_string())
    }

    async fn classify_intent(&self, text: &str) -> Result<String, ExternalError> {
        let raw = self
            .complete(
                "Classify the request for a music channel assistant as one of: upload, comments, \
                 quota, status, pending, videos, help, song, unclear. Answer with JSON only: {\"label\": string}",
                text,
            )
            .await?;
        let out: LabelOutput = parse_json(&raw)?;
        Ok(out.label.trim().to_lowercase())
    }
}
