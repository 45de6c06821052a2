//! 入站消息处理：格式化发送者 → 解析消息段 → 立即入队 → 把待解析附件交给后台监督
//!
//! 入队从不等待附件解析；后台解析结果以独立的追加消息回到同一来源。

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::dispatch::{Dispatcher, ReplySink, PRIORITY_USER_MESSAGE};
use crate::media::{MediaResolver, MessageParser, ResolutionOutcome, Segment};

/// 消息来源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Group { id: String, name: Option<String> },
    Private { id: String },
}

impl Origin {
    /// 队列中的来源键：`group_<id>` / `private_<id>`
    pub fn key(&self) -> String {
        match self {
            Origin::Group { id, .. } => format!("group_{id}"),
            Origin::Private { id } => format!("private_{id}"),
        }
    }

    fn group_label(&self) -> Option<&str> {
        match self {
            Origin::Group { id, name } => Some(name.as_deref().unwrap_or(id)),
            Origin::Private { .. } => None,
        }
    }
}

/// 传输层交来的一条消息
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub origin: Origin,
    pub sender: String,
    pub segments: Vec<Segment>,
}

/// 带发送者标签的正文
pub fn format_message(content: &str, sender: &str, group_name: Option<&str>) -> String {
    match group_name {
        Some(group) => format!("<sender>{sender} [群聊-{group}]</sender>{content}"),
        None => format!("<sender>{sender}</sender>{content}"),
    }
}

/// handle 的结果：原消息序号与各附件的监督任务
#[derive(Debug)]
pub struct HandledMessage {
    pub sequence: u64,
    pub follow_ups: Vec<JoinHandle<ResolutionOutcome>>,
}

pub struct MessageHandler {
    dispatcher: Arc<Dispatcher>,
    resolver: Arc<MediaResolver>,
    parser: MessageParser,
}

impl MessageHandler {
    pub fn new(dispatcher: Arc<Dispatcher>, resolver: Arc<MediaResolver>) -> Self {
        let parser = MessageParser::new(Arc::clone(&resolver));
        Self {
            dispatcher,
            resolver,
            parser,
        }
    }

    /// 引用回复原文的截断长度（字符数）
    pub fn with_reply_max_length(mut self, max_chars: usize) -> Self {
        self.parser = self.parser.with_reply_max_length(max_chars);
        self
    }

    pub async fn handle(&self, message: InboundMessage, reply: Arc<dyn ReplySink>) -> HandledMessage {
        let origin_key = message.origin.key();
        let parsed = self.parser.parse(message.segments, &origin_key).await;
        let text = format_message(&parsed.text, &message.sender, message.origin.group_label());

        let sequence = self.dispatcher.enqueue(
            PRIORITY_USER_MESSAGE,
            origin_key.as_str(),
            text,
            parsed.content_blocks,
            Arc::clone(&reply),
        );

        let follow_ups = parsed
            .pending
            .into_iter()
            .map(|pending| self.resolver.supervise(pending, Arc::clone(&reply)))
            .collect();

        HandledMessage {
            sequence,
            follow_ups,
        }
    }
}
