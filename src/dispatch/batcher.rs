//! 按来源合批
//!
//! 输入是一次 drain 得到的、已按优先级排好序的条目；同一 origin 的条目合为一批。
//! 批次顺序取各 origin 在输入中首次出现的位置，批内保持遇到的顺序；
//! 不相邻的同源条目同样并入首次出现的那一批。

use std::collections::HashMap;
use std::sync::Arc;

use super::engine::EngineInput;
use super::item::{DispatchItem, ReplySink};
use crate::memory::ContentBlock;

/// 一次引擎调用对应的批次
pub struct Batch {
    pub origin_key: String,
    /// 批内最小的优先级
    pub priority: i32,
    pub texts: Vec<String>,
    pub content_blocks: Vec<ContentBlock>,
    pub replies: Vec<Arc<dyn ReplySink>>,
}

impl Batch {
    fn start(item: DispatchItem) -> Self {
        Self {
            origin_key: item.origin_key,
            priority: item.priority,
            texts: vec![item.text],
            content_blocks: item.content_blocks,
            replies: vec![item.reply],
        }
    }

    fn absorb(&mut self, item: DispatchItem) {
        self.priority = self.priority.min(item.priority);
        self.texts.push(item.text);
        self.content_blocks.extend(item.content_blocks);
        self.replies.push(item.reply);
    }

    pub fn len(&self) -> usize {
        self.texts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }

    /// 按到达顺序以换行拼接
    pub fn merged_text(&self) -> String {
        self.texts.join("\n")
    }

    /// 只有最后一条消息的回复通道会收到回复
    pub fn reply_target(&self) -> Option<&Arc<dyn ReplySink>> {
        self.replies.last()
    }

    pub fn into_input(self) -> EngineInput {
        EngineInput::new(self.texts.join("\n"), self.content_blocks)
    }
}

pub fn batch_by_origin(items: Vec<DispatchItem>) -> Vec<Batch> {
    let mut batches: Vec<Batch> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for item in items {
        match index.get(&item.origin_key) {
            Some(&i) => batches[i].absorb(item),
            None => {
                index.insert(item.origin_key.clone(), batches.len());
                batches.push(Batch::start(item));
            }
        }
    }

    batches
}
