//! 会话空闲超时
//!
//! 每次入队调用 [`SessionTimeout::touch`]：重新调度 `session_summarize` 并取消待执行的 `session_clear`。
//! 摘要任务触发时（空闲窗口内没有新消息）对共享历史做摘要，再调度清空任务；
//! 清空任务触发时仍无新消息则清空历史。
//! 摘要进行中到来的新消息会推进活动计数，此时不再调度清空。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::jobs::JobScheduler;
use crate::dispatch::ResponseEngine;

pub const SUMMARIZE_JOB: &str = "session_summarize";
pub const CLEAR_JOB: &str = "session_clear";

pub struct SessionTimeout {
    scheduler: Arc<dyn JobScheduler>,
    engine: Arc<dyn ResponseEngine>,
    summarize_after: Duration,
    clear_after: Duration,
    activity: AtomicU64,
}

impl SessionTimeout {
    pub fn new(
        scheduler: Arc<dyn JobScheduler>,
        engine: Arc<dyn ResponseEngine>,
        summarize_after: Duration,
        clear_after: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            scheduler,
            engine,
            summarize_after,
            clear_after,
            activity: AtomicU64::new(0),
        })
    }

    pub fn touch(self: &Arc<Self>) {
        let epoch = self.activity.fetch_add(1, Ordering::SeqCst) + 1;
        let this = Arc::clone(self);
        self.scheduler.schedule_once(
            SUMMARIZE_JOB,
            self.summarize_after,
            Box::new(move || Box::pin(async move { this.on_summarize(epoch).await })),
        );
        if self.scheduler.cancel(CLEAR_JOB) {
            tracing::debug!("Pending session clear cancelled by new activity");
        }
    }

    /// `epoch` 为调度本任务时的活动计数；之后再有入队则不调度清空
    async fn on_summarize(self: Arc<Self>, epoch: u64) {
        if !self.engine.has_history().await {
            tracing::debug!("Session idle with empty history, nothing to summarize");
            return;
        }

        tracing::info!(
            idle_secs = self.summarize_after.as_secs(),
            "Session idle, summarizing history"
        );
        if let Err(e) = self.engine.summarize().await {
            tracing::warn!(error = %e, "Session summarize failed");
        }

        if self.activity.load(Ordering::SeqCst) != epoch {
            tracing::debug!("Activity during summarize, session clear not scheduled");
            return;
        }

        let this = Arc::clone(&self);
        self.scheduler.schedule_once(
            CLEAR_JOB,
            self.clear_after,
            Box::new(move || Box::pin(async move { this.on_clear().await })),
        );
    }

    async fn on_clear(self: Arc<Self>) {
        self.engine.clear_history().await;
        tracing::info!("Session abandoned, history cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EngineError;
    use crate::dispatch::{EngineInput, InvokeReason};
    use crate::session::TokioJobScheduler;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct CountingEngine {
        summarized: AtomicUsize,
        cleared: AtomicUsize,
        has_history: AtomicBool,
        summarize_delay: Duration,
    }

    impl CountingEngine {
        fn new(has_history: bool) -> Arc<Self> {
            Self::with_delay(has_history, Duration::ZERO)
        }

        fn with_delay(has_history: bool, summarize_delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                summarized: AtomicUsize::new(0),
                cleared: AtomicUsize::new(0),
                has_history: AtomicBool::new(has_history),
                summarize_delay,
            })
        }
    }

    #[async_trait]
    impl ResponseEngine for CountingEngine {
        async fn invoke(
            &self,
            _reason: InvokeReason,
            _input: EngineInput,
        ) -> Result<String, EngineError> {
            Ok(String::new())
        }

        async fn summarize(&self) -> Result<(), EngineError> {
            tokio::time::sleep(self.summarize_delay).await;
            self.summarized.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn clear_history(&self) {
            self.cleared.fetch_add(1, Ordering::SeqCst);
        }

        async fn has_history(&self) -> bool {
            self.has_history.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_touch_twice_leaves_one_summarize_job() {
        let scheduler = Arc::new(TokioJobScheduler::new());
        let engine = CountingEngine::new(true);
        let timeout = SessionTimeout::new(
            scheduler.clone(),
            engine.clone(),
            Duration::from_secs(60),
            Duration::from_secs(60),
        );
        timeout.touch();
        timeout.touch();
        assert_eq!(scheduler.pending_jobs(), vec![SUMMARIZE_JOB.to_string()]);
    }

    #[tokio::test]
    async fn test_summarize_then_clear() {
        let scheduler = Arc::new(TokioJobScheduler::new());
        let engine = CountingEngine::new(true);
        let timeout = SessionTimeout::new(
            scheduler.clone(),
            engine.clone(),
            Duration::from_millis(20),
            Duration::from_millis(20),
        );
        timeout.touch();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(engine.summarized.load(Ordering::SeqCst), 1);
        assert_eq!(engine.cleared.load(Ordering::SeqCst), 1);
        assert!(scheduler.pending_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_activity_cancels_pending_clear() {
        let scheduler = Arc::new(TokioJobScheduler::new());
        let engine = CountingEngine::new(true);
        let timeout = SessionTimeout::new(
            scheduler.clone(),
            engine.clone(),
            Duration::from_millis(10),
            Duration::from_secs(60),
        );
        timeout.touch();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.summarized.load(Ordering::SeqCst), 1);
        assert!(scheduler.is_pending(CLEAR_JOB));

        timeout.touch();
        assert!(!scheduler.is_pending(CLEAR_JOB));
        assert!(scheduler.is_pending(SUMMARIZE_JOB));
        assert_eq!(engine.cleared.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_history_skips_summarize() {
        let scheduler = Arc::new(TokioJobScheduler::new());
        let engine = CountingEngine::new(false);
        let timeout = SessionTimeout::new(
            scheduler.clone(),
            engine.clone(),
            Duration::from_millis(10),
            Duration::from_millis(10),
        );
        timeout.touch();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.summarized.load(Ordering::SeqCst), 0);
        assert!(scheduler.pending_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_activity_during_summarize_skips_clear() {
        let scheduler = Arc::new(TokioJobScheduler::new());
        let engine = CountingEngine::with_delay(true, Duration::from_millis(50));
        let timeout = SessionTimeout::new(
            scheduler.clone(),
            engine.clone(),
            Duration::from_millis(100),
            Duration::from_millis(20),
        );
        timeout.touch();

        // 摘要在 t=100 开始，持续到 t=150；t=120 到来新消息
        tokio::time::sleep(Duration::from_millis(120)).await;
        timeout.touch();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(engine.summarized.load(Ordering::SeqCst), 1);
        assert_eq!(engine.cleared.load(Ordering::SeqCst), 0);
        assert!(!scheduler.is_pending(CLEAR_JOB));
        assert!(scheduler.is_pending(SUMMARIZE_JOB));
    }
}
