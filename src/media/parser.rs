//! 消息解析：把传输层的消息段转成正文 + 内容块 + 待解析附件
//!
//! 小附件（大小已知且不超过同步阈值）在入队前就地解析，失败时正文写入 `error="unresolved"` 标签；
//! 其余附件写入 loading 占位标签并交给 [`MediaResolver`] 在后台解析。

use std::sync::Arc;

use super::resolver::{MediaResolver, PendingResolution};
use super::types::{bare_tag, unresolved_tag, Attachment, Resolution, ResolutionMode};
use crate::memory::ContentBlock;

/// 传输层消息段
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    /// @某人；有备注名时用备注名，否则用 id
    Mention { id: String, name: Option<String> },
    MentionAll,
    /// 表情；传输层能识别时带表情名
    Face { name: Option<String> },
    /// 引用回复；取不到原消息时为 None
    Reply { content: Option<String> },
    Media(Attachment),
    /// 不支持的消息段；传输层能给出摘要时用摘要
    Unsupported { kind: String, summary: Option<String> },
}

#[derive(Debug, Default)]
pub struct ParsedMessage {
    pub text: String,
    /// 同一条消息内所有就地解析的内容块，合并为一个列表
    pub content_blocks: Vec<ContentBlock>,
    pub pending: Vec<PendingResolution>,
}

const DEFAULT_REPLY_MAX_LENGTH: usize = 50;

pub struct MessageParser {
    resolver: Arc<MediaResolver>,
    reply_max_length: usize,
}

fn face_tag(name: Option<&str>) -> String {
    match name {
        Some(name) if !name.is_empty() => format!("<face name=\"{name}\" />"),
        _ => "<face />".to_string(),
    }
}

/// 按字符截断引用原文
fn reply_tag(content: Option<&str>, max_chars: usize) -> String {
    let Some(content) = content else {
        return "<reply_to>无法获取原消息</reply_to>".to_string();
    };
    match content.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("<reply_to>{}...</reply_to>", &content[..cut]),
        None => format!("<reply_to>{content}</reply_to>"),
    }
}

impl MessageParser {
    pub fn new(resolver: Arc<MediaResolver>) -> Self {
        Self {
            resolver,
            reply_max_length: DEFAULT_REPLY_MAX_LENGTH,
        }
    }

    pub fn with_reply_max_length(mut self, max_chars: usize) -> Self {
        self.reply_max_length = max_chars;
        self
    }

    /// 大小已知且不超过阈值；未配置阈值时一律后台解析
    fn is_small(&self, attachment: &Attachment) -> bool {
        let threshold = self.resolver.processor().settings().sync_threshold_bytes();
        matches!(
            (threshold, attachment.size_bytes),
            (Some(limit), Some(size)) if size <= limit
        )
    }

    pub async fn parse(&self, segments: Vec<Segment>, origin_key: &str) -> ParsedMessage {
        let mut parsed = ParsedMessage::default();
        for segment in segments {
            match segment {
                Segment::Text(text) => parsed.text.push_str(&text),
                Segment::Mention { id, name } => {
                    parsed.text.push('@');
                    parsed.text.push_str(name.as_deref().unwrap_or(&id));
                }
                Segment::MentionAll => parsed.text.push_str("@全体成员"),
                Segment::Face { name } => parsed.text.push_str(&face_tag(name.as_deref())),
                Segment::Reply { content } => parsed
                    .text
                    .push_str(&reply_tag(content.as_deref(), self.reply_max_length)),
                Segment::Unsupported { kind, summary } => match summary {
                    Some(summary) => parsed.text.push_str(&summary),
                    None => parsed
                        .text
                        .push_str(&format!("<unsupported type=\"{kind}\" />")),
                },
                Segment::Media(attachment) => {
                    self.parse_media(attachment, origin_key, &mut parsed).await
                }
            }
        }
        parsed
    }

    async fn parse_media(&self, attachment: Attachment, origin_key: &str, parsed: &mut ParsedMessage) {
        let kind = attachment.normalized_kind();
        let processor = self.resolver.processor();
        let mode = processor.mode_for(kind);
        if mode == ResolutionMode::Disabled {
            parsed.text.push_str(&bare_tag(kind, &attachment.filename));
            return;
        }

        if !self.is_small(&attachment) {
            let pending = self.resolver.begin(attachment, mode, origin_key);
            tracing::debug!(
                placeholder = %pending.placeholder_id,
                origin = %origin_key,
                "attachment deferred"
            );
            parsed.text.push_str(&pending.placeholder_tag());
            parsed.pending.push(pending);
            return;
        }

        match processor.resolve(&attachment, mode).await {
            Ok(Resolution::Text(text)) => parsed.text.push_str(&text),
            Ok(Resolution::Block(block)) => {
                parsed.text.push_str(&bare_tag(kind, &attachment.filename));
                parsed.content_blocks.push(block);
            }
            Err(e) => {
                tracing::warn!(filename = %attachment.filename, error = %e, "inline media resolution failed");
                parsed.text.push_str(&unresolved_tag(kind, &attachment.filename));
            }
        }
    }
}
