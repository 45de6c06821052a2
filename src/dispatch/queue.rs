//! 优先级队列与单消费者调度循环
//!
//! - 入队（push、序号递增、状态检查）与出队共用一把互斥锁
//! - 消费者只有一个：`spawn` 在锁内检查并标记，重复启动返回 `DispatchError::AlreadyRunning`
//! - 唤醒使用 `Notify`：入队后 `notify_one`，消费者空闲时等待许可，不会漏掉唤醒
//! - 每轮先把队列整体取空，再按来源合批，逐批串行调用引擎；
//!   处理期间新到的消息留到下一轮，同源突发消息因此合并为一次调用
//! - 关闭信号在批次之间检查：当前批次结束后退出，本轮剩余批次与队列中的条目不再处理

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::FutureExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::batcher::{batch_by_origin, Batch};
use super::engine::{InvokeReason, ResponseEngine};
use super::item::{DispatchItem, OriginRef, QueuedItem, ReplySink};
use crate::core::{DispatchError, EngineError};
use crate::memory::ContentBlock;
use crate::session::SessionTimeout;

/// 消费循环状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    /// 队列已空，等待入队信号
    Idle,
    /// 正在取空队列并处理批次
    Draining,
}

struct QueueState {
    heap: BinaryHeap<Reverse<DispatchItem>>,
    next_sequence: u64,
    phase: LoopPhase,
    worker_started: bool,
    current_origin: Option<String>,
}

pub struct Dispatcher {
    state: Mutex<QueueState>,
    wake: Notify,
    engine: Arc<dyn ResponseEngine>,
    session_timeout: Option<Arc<SessionTimeout>>,
}

impl Dispatcher {
    pub fn new(engine: Arc<dyn ResponseEngine>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_sequence: 0,
                phase: LoopPhase::Idle,
                worker_started: false,
                current_origin: None,
            }),
            wake: Notify::new(),
            engine,
            session_timeout: None,
        }
    }

    /// 每次入队都会重置会话空闲计时
    pub fn with_session_timeout(mut self, timeout: Arc<SessionTimeout>) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 入队并唤醒消费者，立即返回分配的序号。
    ///
    /// 不等待任何处理；配置了会话超时时需在 Tokio 运行时内调用。
    pub fn enqueue(
        &self,
        priority: i32,
        origin_key: impl Into<String>,
        text: impl Into<String>,
        content_blocks: Vec<ContentBlock>,
        reply: Arc<dyn ReplySink>,
    ) -> u64 {
        let origin_key = origin_key.into();
        let sequence = {
            let mut state = self.lock_state();
            state.next_sequence += 1;
            let sequence = state.next_sequence;
            if state.phase == LoopPhase::Draining {
                tracing::info!(
                    origin = %origin_key,
                    priority,
                    depth = state.heap.len() + 1,
                    "queued"
                );
            } else {
                tracing::debug!(origin = %origin_key, priority, sequence, "enqueued");
            }
            state.heap.push(Reverse(DispatchItem {
                priority,
                sequence,
                origin_key,
                text: text.into(),
                content_blocks,
                reply,
            }));
            sequence
        };

        self.wake.notify_one();
        if let Some(timeout) = &self.session_timeout {
            timeout.touch();
        }
        sequence
    }

    pub fn len(&self) -> usize {
        self.lock_state().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_state().heap.is_empty()
    }

    pub fn phase(&self) -> LoopPhase {
        self.lock_state().phase
    }

    /// 正在处理的批次来源；空闲时为 None
    pub fn current_origin(&self) -> Option<OriginRef> {
        self.lock_state()
            .current_origin
            .as_deref()
            .and_then(OriginRef::parse)
    }

    /// 按出队顺序列出当前排队的条目
    pub fn snapshot(&self) -> Vec<QueuedItem> {
        let state = self.lock_state();
        let mut items: Vec<QueuedItem> = state
            .heap
            .iter()
            .map(|Reverse(item)| QueuedItem::from(item))
            .collect();
        items.sort_by_key(|q| (q.priority, q.sequence));
        items
    }

    /// 启动唯一的消费者任务；shutdown 取消后在当前批次结束时退出
    pub fn spawn(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> Result<JoinHandle<()>, DispatchError> {
        {
            let mut state = self.lock_state();
            if state.worker_started {
                return Err(DispatchError::AlreadyRunning);
            }
            state.worker_started = true;
        }
        let this = Arc::clone(self);
        Ok(tokio::spawn(async move { this.run(shutdown).await }))
    }

    async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!("Dispatch worker started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = self.wake.notified() => self.drain_until_empty(&shutdown).await,
            }
        }

        let remaining = {
            let mut state = self.lock_state();
            state.phase = LoopPhase::Idle;
            state.worker_started = false;
            state.current_origin = None;
            state.heap.len()
        };
        tracing::info!(remaining, "Dispatch worker stopped");
    }

    async fn drain_until_empty(&self, shutdown: &CancellationToken) {
        while !shutdown.is_cancelled() {
            let items = self.take_all();
            if items.is_empty() {
                return;
            }
            let mut batches = batch_by_origin(items).into_iter();
            for batch in batches.by_ref() {
                self.dispatch_batch(batch).await;
                if shutdown.is_cancelled() {
                    break;
                }
            }
            let skipped: usize = batches.map(|b| b.len()).sum();
            if skipped > 0 {
                tracing::warn!(skipped, "Shutdown during drain, remaining batches dropped");
            }
        }
    }

    /// 一次取空队列（按优先级顺序）；队列为空时在同一把锁内回到 Idle
    fn take_all(&self) -> Vec<DispatchItem> {
        let mut state = self.lock_state();
        if state.heap.is_empty() {
            state.phase = LoopPhase::Idle;
            state.current_origin = None;
            return Vec::new();
        }
        state.phase = LoopPhase::Draining;
        let mut items = Vec::with_capacity(state.heap.len());
        while let Some(Reverse(item)) = state.heap.pop() {
            items.push(item);
        }
        items
    }

    async fn dispatch_batch(&self, batch: Batch) {
        let origin = batch.origin_key.clone();
        let count = batch.len();
        let reason = InvokeReason::for_priority(batch.priority);
        let reply = batch.reply_target().cloned();

        self.lock_state().current_origin = Some(origin.clone());
        tracing::info!(origin = %origin, batch = count, reason = %reason, "processing");

        let result = AssertUnwindSafe(self.engine.invoke(reason, batch.into_input()))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(EngineError::Unavailable("engine panicked".to_string())));

        match result {
            Ok(text) => {
                if let Some(reply) = reply {
                    if let Err(e) = reply.deliver(text).await {
                        tracing::warn!(origin = %origin, error = %e, "reply delivery failed");
                    }
                }
            }
            Err(e) => {
                tracing::error!(
                    origin = %origin,
                    items = count,
                    error = %e,
                    "engine invocation failed, batch abandoned"
                );
            }
        }
    }
}
