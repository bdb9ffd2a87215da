//! 外部协作方适配器：视频平台、生成式文本、Agent 消息通道

pub mod mock;
pub mod openai;
pub mod traits;

pub use mock::{MockChannel, MockGenerator, MockPlatform, SentReply};
pub use openai::OpenAiGenerator;
pub use traits::{
    CommentPage, ContentAnalysis, GenerativeText, Mention, MessageChannel, PlatformQuota,
    ReplyContext, UploadRequest, VideoPlatform,
};
