//! 媒体：类型与标签、处理流水线、消息解析、后台解析监督

pub mod parser;
pub mod processor;
pub mod resolver;
pub mod types;

pub use parser::{MessageParser, ParsedMessage, Segment};
pub use processor::{AttachmentFetcher, HttpFetcher, LlmTranscriber, MediaProcessor, MediaTrimmer, Transcriber};
pub use resolver::{MediaResolver, PendingResolution, ResolutionOutcome};
pub use types::{
    bare_tag, described_tag, error_tag, loading_tag, timeout_tag, unresolved_tag, Attachment,
    AttachmentSource, MediaKind, Resolution, ResolutionMode,
};
