//! 消息调度：优先级队列、按来源合批、单消费者调度循环
//!
//! 入队 → 唤醒消费者 → 整体取空 → 按 origin 合批 → 每批一次引擎调用 → 回复投递给批内最后一条消息。

pub mod batcher;
pub mod engine;
pub mod item;
pub mod queue;

pub use batcher::{batch_by_origin, Batch};
pub use engine::{EngineInput, InvokeReason, ResponseEngine};
pub use item::{
    ChannelSink, DispatchItem, OriginRef, QueuedItem, ReplySink, PRIORITY_AUTO_CONVERSATION,
    PRIORITY_SCHEDULED, PRIORITY_USER_MESSAGE,
};
pub use queue::{Dispatcher, LoopPhase};
