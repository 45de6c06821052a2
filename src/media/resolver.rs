//! 媒体解析监督
//!
//! 大附件不阻塞入队：解析阶段只得到一个 [`PendingResolution`]（后台任务 + 取消令牌 + 截止时间），
//! 消息正文先带着 loading 标签入队；随后 [`MediaResolver::supervise`] 独立等待结果，
//! 成功、超时或失败都以一条新的、独立的消息追加到同一来源，从不修改原消息。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::processor::MediaProcessor;
use super::types::{bare_tag, error_tag, loading_tag, timeout_tag, Attachment, MediaKind, Resolution, ResolutionMode};
use crate::core::ResolutionError;
use crate::dispatch::{Dispatcher, ReplySink, PRIORITY_USER_MESSAGE};
use crate::memory::ContentBlock;

/// 一个进行中的附件解析
pub struct PendingResolution {
    pub placeholder_id: String,
    pub kind: MediaKind,
    pub filename: String,
    pub origin_key: String,
    pub deadline: Instant,
    cancel: CancellationToken,
    task: JoinHandle<Result<Resolution, ResolutionError>>,
}

impl PendingResolution {
    /// 写入原消息正文的占位标签
    pub fn placeholder_tag(&self) -> String {
        loading_tag(self.kind, &self.filename)
    }

    /// 取消只影响本任务，不影响同批其他解析
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for PendingResolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingResolution")
            .field("placeholder_id", &self.placeholder_id)
            .field("kind", &self.kind)
            .field("filename", &self.filename)
            .field("origin_key", &self.origin_key)
            .finish_non_exhaustive()
    }
}

/// 监督任务的最终结果（追加消息已入队）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionOutcome {
    Resolved,
    TimedOut,
    Failed(ResolutionError),
}

pub struct MediaResolver {
    dispatcher: Arc<Dispatcher>,
    processor: Arc<MediaProcessor>,
    timeout: Duration,
    root: CancellationToken,
}

impl MediaResolver {
    /// `root` 取消时（进程关闭）所有进行中的解析一并取消
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        processor: Arc<MediaProcessor>,
        timeout: Duration,
        root: CancellationToken,
    ) -> Self {
        Self {
            dispatcher,
            processor,
            timeout,
            root,
        }
    }

    pub fn processor(&self) -> &Arc<MediaProcessor> {
        &self.processor
    }

    /// 启动附件的后台解析
    pub fn begin(
        &self,
        attachment: Attachment,
        mode: ResolutionMode,
        origin_key: impl Into<String>,
    ) -> PendingResolution {
        let kind = attachment.normalized_kind();
        let filename = attachment.filename.clone();
        let processor = Arc::clone(&self.processor);
        self.track(kind, filename, origin_key, async move {
            processor.resolve(&attachment, mode).await
        })
    }

    /// 把任意解析 future 包装成可取消、带截止时间的后台任务
    pub fn track<F>(
        &self,
        kind: MediaKind,
        filename: impl Into<String>,
        origin_key: impl Into<String>,
        resolution: F,
    ) -> PendingResolution
    where
        F: Future<Output = Result<Resolution, ResolutionError>> + Send + 'static,
    {
        let cancel = self.root.child_token();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(ResolutionError::Cancelled),
                result = resolution => result,
            }
        });
        let mut placeholder_id = uuid::Uuid::new_v4().simple().to_string();
        placeholder_id.truncate(12);

        PendingResolution {
            placeholder_id,
            kind,
            filename: filename.into(),
            origin_key: origin_key.into(),
            deadline: Instant::now() + self.timeout,
            cancel,
            task,
        }
    }

    /// 独立等待解析结果并把追加消息入队；`reply` 为追加消息的回复通道
    pub fn supervise(
        &self,
        pending: PendingResolution,
        reply: Arc<dyn ReplySink>,
    ) -> JoinHandle<ResolutionOutcome> {
        let dispatcher = Arc::clone(&self.dispatcher);
        tokio::spawn(async move {
            let PendingResolution {
                placeholder_id,
                kind,
                filename,
                origin_key,
                deadline,
                cancel,
                mut task,
            } = pending;

            let result = match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(join_err)) if join_err.is_cancelled() => {
                    Ok(Err(ResolutionError::Cancelled))
                }
                Ok(Err(join_err)) => Ok(Err(ResolutionError::Io(format!(
                    "resolution task panicked: {join_err}"
                )))),
                Err(_) => {
                    cancel.cancel();
                    task.abort();
                    Err(())
                }
            };

            let (text, blocks, outcome): (String, Vec<ContentBlock>, ResolutionOutcome) =
                match result {
                    Ok(Ok(Resolution::Text(text))) => (text, Vec::new(), ResolutionOutcome::Resolved),
                    Ok(Ok(Resolution::Block(block))) => (
                        bare_tag(kind, &filename),
                        vec![block],
                        ResolutionOutcome::Resolved,
                    ),
                    Ok(Err(e)) => {
                        tracing::warn!(
                            placeholder = %placeholder_id,
                            origin = %origin_key,
                            error = %e,
                            "media resolution failed"
                        );
                        let tag = error_tag(kind, &filename, e.code());
                        (tag, Vec::new(), ResolutionOutcome::Failed(e))
                    }
                    Err(()) => {
                        tracing::warn!(
                            placeholder = %placeholder_id,
                            origin = %origin_key,
                            "media resolution timed out"
                        );
                        (timeout_tag(kind, &filename), Vec::new(), ResolutionOutcome::TimedOut)
                    }
                };

            if outcome == ResolutionOutcome::Resolved {
                tracing::info!(placeholder = %placeholder_id, origin = %origin_key, "media resolved");
            }
            dispatcher.enqueue(PRIORITY_USER_MESSAGE, origin_key, text, blocks, reply);
            outcome
        })
    }

    /// 取消所有进行中的解析；各自的监督任务仍会追加 `cancelled` 标签
    pub fn cancel_all(&self) {
        self.root.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MediaSection;
    use crate::core::EngineError;
    use crate::dispatch::{ChannelSink, EngineInput, InvokeReason, ResponseEngine};
    use crate::media::processor::{HttpFetcher, LlmTranscriber};
    use crate::llm::MockLlmClient;
    use async_trait::async_trait;

    struct SilentEngine;

    #[async_trait]
    impl ResponseEngine for SilentEngine {
        async fn invoke(&self, _: InvokeReason, _: EngineInput) -> Result<String, EngineError> {
            Ok(String::new())
        }
        async fn summarize(&self) -> Result<(), EngineError> {
            Ok(())
        }
        async fn clear_history(&self) {}
    }

    fn resolver(timeout: Duration) -> (Arc<Dispatcher>, MediaResolver) {
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(SilentEngine)));
        let processor = Arc::new(MediaProcessor::new(
            Arc::new(HttpFetcher::default()),
            Arc::new(LlmTranscriber::new(Arc::new(MockLlmClient))),
            MediaSection::default(),
        ));
        let resolver = MediaResolver::new(
            Arc::clone(&dispatcher),
            processor,
            timeout,
            CancellationToken::new(),
        );
        (dispatcher, resolver)
    }

    #[tokio::test]
    async fn test_success_enqueues_standalone_follow_up() {
        let (dispatcher, resolver) = resolver(Duration::from_secs(5));
        let pending = resolver.track(MediaKind::Image, "cat.jpg", "g1", async {
            Ok(Resolution::Block(ContentBlock::data_url("image/png", "abc")))
        });
        assert_eq!(pending.placeholder_id.len(), 12);
        assert_eq!(pending.placeholder_tag(), r#"<image status="loading" filename="cat.jpg" />"#);

        let (sink, _rx) = ChannelSink::pair();
        let outcome = resolver.supervise(pending, sink).await.unwrap();
        assert_eq!(outcome, ResolutionOutcome::Resolved);

        let queued = dispatcher.snapshot();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].origin_key, "g1");
        assert_eq!(queued[0].priority, PRIORITY_USER_MESSAGE);
        assert_eq!(queued[0].text, r#"<image filename="cat.jpg" />"#);
        assert_eq!(queued[0].content_blocks.len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_enqueues_timeout_tag() {
        let (dispatcher, resolver) = resolver(Duration::from_millis(10));
        let pending = resolver.track(MediaKind::Audio, "", "p1", async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(Resolution::Text("late".to_string()))
        });
        let (sink, _rx) = ChannelSink::pair();
        let outcome = resolver.supervise(pending, sink).await.unwrap();
        assert_eq!(outcome, ResolutionOutcome::TimedOut);
        assert_eq!(dispatcher.snapshot()[0].text, r#"<audio error="timeout" />"#);
    }

    #[tokio::test]
    async fn test_failure_tag_differs_from_timeout_tag() {
        let (dispatcher, resolver) = resolver(Duration::from_secs(5));
        let pending = resolver.track(MediaKind::Video, "clip.mp4", "p1", async {
            Err(ResolutionError::Download("404".to_string()))
        });
        let (sink, _rx) = ChannelSink::pair();
        let outcome = resolver.supervise(pending, sink).await.unwrap();
        assert!(matches!(outcome, ResolutionOutcome::Failed(ResolutionError::Download(_))));
        assert_eq!(
            dispatcher.snapshot()[0].text,
            r#"<video filename="clip.mp4" error="download_failed" />"#
        );
    }

    #[tokio::test]
    async fn test_cancel_affects_only_its_own_task() {
        let (dispatcher, resolver) = resolver(Duration::from_secs(5));
        let slow = resolver.track(MediaKind::Image, "a.png", "g1", async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Resolution::Text("never".to_string()))
        });
        let fast = resolver.track(MediaKind::Image, "b.png", "g1", async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(Resolution::Text("<image>b</image>".to_string()))
        });
        slow.cancel();

        let (sink, _rx) = ChannelSink::pair();
        let slow_outcome = resolver.supervise(slow, sink.clone()).await.unwrap();
        let fast_outcome = resolver.supervise(fast, sink).await.unwrap();
        assert_eq!(slow_outcome, ResolutionOutcome::Failed(ResolutionError::Cancelled));
        assert_eq!(fast_outcome, ResolutionOutcome::Resolved);

        let texts: Vec<_> = dispatcher.snapshot().into_iter().map(|q| q.text).collect();
        assert_eq!(
            texts,
            [r#"<image filename="a.png" error="cancelled" />"#, "<image>b</image>"]
        );
    }
}
