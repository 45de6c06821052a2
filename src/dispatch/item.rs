//! 队列条目与回复通道
//!
//! 队列按 `(priority, sequence)` 升序出队：priority 越小越先处理，
//! 同优先级按入队顺序（sequence 单调递增）。

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::memory::ContentBlock;

/// 定时任务
pub const PRIORITY_SCHEDULED: i32 = 0;
/// 用户消息（含媒体解析的后续消息）
pub const PRIORITY_USER_MESSAGE: i32 = 1;
/// 主动对话
pub const PRIORITY_AUTO_CONVERSATION: i32 = 2;

/// 回复投递句柄，由传输层提供；调度器只调用 deliver，不做其他检查
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn deliver(&self, text: String) -> Result<(), String>;
}

/// 基于 mpsc 的回复通道（控制台与测试使用）
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }

    pub fn pair() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl ReplySink for ChannelSink {
    async fn deliver(&self, text: String) -> Result<(), String> {
        self.tx.send(text).map_err(|_| "reply channel closed".to_string())
    }
}

/// 队列中的一条待处理消息；出队后参与一次引擎调用即被丢弃
pub struct DispatchItem {
    pub priority: i32,
    pub sequence: u64,
    pub origin_key: String,
    pub text: String,
    pub content_blocks: Vec<ContentBlock>,
    pub reply: Arc<dyn ReplySink>,
}

impl fmt::Debug for DispatchItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchItem")
            .field("priority", &self.priority)
            .field("sequence", &self.sequence)
            .field("origin_key", &self.origin_key)
            .field("text", &self.text)
            .field("content_blocks", &self.content_blocks.len())
            .finish()
    }
}

impl PartialEq for DispatchItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for DispatchItem {}

impl PartialOrd for DispatchItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DispatchItem {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.priority, self.sequence).cmp(&(other.priority, other.sequence))
    }
}

/// 队列快照中的只读视图（不含回复句柄）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedItem {
    pub priority: i32,
    pub sequence: u64,
    pub origin_key: String,
    pub text: String,
    pub content_blocks: Vec<ContentBlock>,
}

impl From<&DispatchItem> for QueuedItem {
    fn from(item: &DispatchItem) -> Self {
        Self {
            priority: item.priority,
            sequence: item.sequence,
            origin_key: item.origin_key.clone(),
            text: item.text.clone(),
            content_blocks: item.content_blocks.clone(),
        }
    }
}

/// 来源类型：`group_<id>` / `private_<id>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginRef {
    pub kind: String,
    pub id: String,
}

impl OriginRef {
    /// 解析 origin key；不含 `_` 的 key 返回 None
    pub fn parse(origin_key: &str) -> Option<Self> {
        let (kind, id) = origin_key.split_once('_')?;
        Some(Self {
            kind: kind.to_string(),
            id: id.to_string(),
        })
    }
}
