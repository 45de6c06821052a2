//! 响应引擎接口
//!
//! 调度循环是引擎的唯一调用方（一次一个批次）；会话超时控制器另外调用摘要与清空入口。

use std::fmt;

use async_trait::async_trait;

use super::item::{PRIORITY_AUTO_CONVERSATION, PRIORITY_SCHEDULED};
use crate::core::EngineError;
use crate::memory::ContentBlock;

/// 调用原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeReason {
    UserMessage,
    ScheduledTask,
    AutoConversation,
}

impl InvokeReason {
    /// 由批次内最小优先级推出
    pub fn for_priority(priority: i32) -> Self {
        match priority {
            PRIORITY_SCHEDULED => InvokeReason::ScheduledTask,
            PRIORITY_AUTO_CONVERSATION => InvokeReason::AutoConversation,
            _ => InvokeReason::UserMessage,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InvokeReason::UserMessage => "user_message",
            InvokeReason::ScheduledTask => "scheduled_task",
            InvokeReason::AutoConversation => "auto_conversation",
        }
    }
}

impl fmt::Display for InvokeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 引擎输入：纯文本，或 `[文本块, ...内容块]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineInput {
    Text(String),
    Structured(Vec<ContentBlock>),
}

impl EngineInput {
    pub fn new(text: String, blocks: Vec<ContentBlock>) -> Self {
        if blocks.is_empty() {
            EngineInput::Text(text)
        } else {
            let mut content = Vec::with_capacity(blocks.len() + 1);
            content.push(ContentBlock::Text { text });
            content.extend(blocks);
            EngineInput::Structured(content)
        }
    }

    /// 拆回文本与附加块（Structured 的首个文本块视为正文）
    pub fn into_parts(self) -> (String, Vec<ContentBlock>) {
        match self {
            EngineInput::Text(text) => (text, Vec::new()),
            EngineInput::Structured(mut blocks) => match blocks.first() {
                Some(ContentBlock::Text { .. }) => {
                    let text = match blocks.remove(0) {
                        ContentBlock::Text { text } => text,
                        ContentBlock::ImageUrl { .. } => String::new(),
                    };
                    (text, blocks)
                }
                _ => (String::new(), blocks),
            },
        }
    }

    pub fn text(&self) -> &str {
        match self {
            EngineInput::Text(text) => text,
            EngineInput::Structured(blocks) => match blocks.first() {
                Some(ContentBlock::Text { text }) => text,
                _ => "",
            },
        }
    }
}

#[async_trait]
pub trait ResponseEngine: Send + Sync {
    /// 把合并后的内容交给引擎，返回回复文本
    async fn invoke(&self, reason: InvokeReason, input: EngineInput)
        -> Result<String, EngineError>;

    /// 对共享历史做摘要（空闲超时第一阶段）
    async fn summarize(&self) -> Result<(), EngineError>;

    /// 清空共享历史（空闲超时第二阶段）
    async fn clear_history(&self);

    async fn has_history(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_for_priority() {
        assert_eq!(InvokeReason::for_priority(0), InvokeReason::ScheduledTask);
        assert_eq!(InvokeReason::for_priority(1), InvokeReason::UserMessage);
        assert_eq!(InvokeReason::for_priority(2), InvokeReason::AutoConversation);
        assert_eq!(InvokeReason::for_priority(7), InvokeReason::UserMessage);
    }

    #[test]
    fn test_input_without_blocks_is_text() {
        let input = EngineInput::new("A\nB".into(), Vec::new());
        assert_eq!(input, EngineInput::Text("A\nB".into()));
    }

    #[test]
    fn test_structured_input_round_trips_parts() {
        let block = ContentBlock::data_url("image/png", "abc");
        let input = EngineInput::new("look".into(), vec![block.clone()]);
        assert_eq!(input.text(), "look");
        let (text, blocks) = input.into_parts();
        assert_eq!(text, "look");
        assert_eq!(blocks, vec![block]);
    }
}
