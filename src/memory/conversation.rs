//! 短期记忆：对话历史
//!
//! 保留最近 N 轮对话；一轮从一条 user 消息开始，包含其后的回复与附注。
//! 剪枝由调用方在一轮成功结束后显式执行，失败回滚时历史不受影响。
//! 历史是全进程唯一的共享资源，统一经 [`SharedHistory`] 的互斥锁访问：
//! 调度循环与会话超时摘要都会写它。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
    System,
}

/// data URL 形式的媒体引用
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// 结构化多媒体内容块，随消息一起交给多模态模型
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// `data:{mime};base64,{data}`
    pub fn data_url(mime: &str, base64_data: &str) -> Self {
        Self::ImageUrl {
            image_url: ImageUrl {
                url: format!("data:{mime};base64,{base64_data}"),
            },
        }
    }
}

/// 单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// 附带的多媒体块（仅 user 消息使用）
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<ContentBlock>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            blocks: Vec::new(),
        }
    }

    pub fn user_with_blocks(content: impl Into<String>, blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            blocks,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            blocks: Vec::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            blocks: Vec::new(),
        }
    }
}

/// 短期记忆：最近 N 轮对话（max_turns 为 0 时不剪枝）
#[derive(Clone, Debug)]
pub struct ConversationMemory {
    messages: Vec<Message>,
    max_turns: usize,
}

impl ConversationMemory {
    pub fn new(max_turns: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_turns,
        }
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
    }

    /// 撤回最后一条消息（模型调用失败时回滚本轮 user 消息）
    pub fn pop(&mut self) -> Option<Message> {
        self.messages.pop()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// 用一条摘要替换全部历史
    pub fn replace_with(&mut self, msg: Message) {
        self.messages.clear();
        self.messages.push(msg);
    }

    /// 超出 max_turns 轮时从最旧的一轮开始整轮丢弃
    pub fn prune(&mut self) {
        let starts: Vec<usize> = self
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.role == Role::User)
            .map(|(i, _)| i)
            .collect();
        let cut = starts
            .len()
            .checked_sub(self.max_turns)
            .and_then(|i| starts.get(i));
        if let Some(&cut) = cut {
            self.messages.drain(..cut);
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// 全局共享的对话历史句柄
pub type SharedHistory = Arc<Mutex<ConversationMemory>>;

pub fn shared_history(max_turns: usize) -> SharedHistory {
    Arc::new(Mutex::new(ConversationMemory::new(max_turns)))
}
