//! Antler 控制台入口
//!
//! 初始化日志与配置，组装调度器、会话超时、媒体解析与响应引擎；
//! 从 stdin 逐行读取消息作为一个私聊会话，`/attach <path>` 附加本地文件，回复打印到 stdout。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use antler::{
    agent::{load_system_prompt, AgentEngine},
    config::{load_config, AppConfig},
    core::{ShutdownManager, ShutdownReason},
    dispatch::{ChannelSink, Dispatcher, LoopPhase, ResponseEngine},
    handler::{InboundMessage, MessageHandler, Origin},
    llm::{create_llm_from_config, create_transcription_llm},
    media::{Attachment, AttachmentSource, HttpFetcher, LlmTranscriber, MediaKind, MediaProcessor, MediaResolver, Segment},
    memory::shared_history,
    observability,
    session::{SessionTimeout, TokioJobScheduler},
};
use tokio::io::{AsyncBufReadExt, BufReader};

fn console_segments(line: &str) -> Vec<Segment> {
    let Some(path) = line.strip_prefix("/attach ") else {
        return vec![Segment::Text(line.to_string())];
    };
    let path = PathBuf::from(path.trim());
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();
    let size_bytes = std::fs::metadata(&path).ok().map(|m| m.len());
    vec![Segment::Media(Attachment {
        kind: MediaKind::Document,
        filename,
        source: AttachmentSource::Path(path),
        size_bytes,
    })]
}

/// 等待队列取空且当前批次处理完
async fn wait_idle(dispatcher: &Dispatcher) {
    while !dispatcher.is_empty() || dispatcher.phase() == LoopPhase::Draining {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cfg = load_config(None).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    let shutdown = Arc::new(ShutdownManager::new());
    let mut reasons = shutdown.subscribe();
    shutdown.install_signal_handlers();

    // 引擎：主 LLM + 共享历史
    let llm = create_llm_from_config(&cfg);
    let history = shared_history(cfg.app.max_context_turns);
    let engine: Arc<dyn ResponseEngine> = Arc::new(AgentEngine::new(
        Arc::clone(&llm),
        history,
        load_system_prompt(&cfg),
    ));

    // 调度器：每次入队重置会话空闲计时
    let session_timeout = SessionTimeout::new(
        Arc::new(TokioJobScheduler::new()),
        Arc::clone(&engine),
        cfg.session.summarize_after(),
        cfg.session.clear_after(),
    );
    let dispatcher = Arc::new(Dispatcher::new(engine).with_session_timeout(session_timeout));
    let worker = dispatcher
        .spawn(shutdown.child_token())
        .context("Failed to start dispatch worker")?;

    // 媒体：转述可用单独模型
    let processor = Arc::new(MediaProcessor::new(
        Arc::new(HttpFetcher::default()),
        Arc::new(LlmTranscriber::new(create_transcription_llm(&cfg, llm))),
        cfg.media.clone(),
    ));
    let resolver = Arc::new(MediaResolver::new(
        Arc::clone(&dispatcher),
        processor,
        cfg.media.resolve_timeout(),
        shutdown.child_token(),
    ));
    let handler = MessageHandler::new(Arc::clone(&dispatcher), resolver)
        .with_reply_max_length(cfg.message.reply_max_length);

    let (reply, mut replies) = ChannelSink::pair();
    let printer = tokio::spawn(async move {
        while let Some(text) = replies.recv().await {
            println!("{text}");
        }
    });

    let name = cfg.app.name.clone().unwrap_or_else(|| "antler".to_string());
    tracing::info!("{} ready, reading messages from stdin", name);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = shutdown.wait_for_shutdown() => break,
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        tokio::select! {
                            _ = wait_idle(&dispatcher) => {}
                            _ = shutdown.wait_for_shutdown() => {}
                        }
                        shutdown.shutdown(ShutdownReason::UserInitiated);
                        break;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "stdin read failed");
                        shutdown.shutdown(ShutdownReason::FatalError(e.to_string()));
                        break;
                    }
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let message = InboundMessage {
                    origin: Origin::Private { id: "console".to_string() },
                    sender: "console".to_string(),
                    segments: console_segments(line),
                };
                handler.handle(message, reply.clone()).await;
            }
        }
    }

    if let Ok(reason) = reasons.try_recv() {
        tracing::info!(?reason, "Shutting down");
    }
    worker.await.context("Dispatch worker panicked")?;
    drop(handler);
    drop(reply);
    drop(dispatcher);
    if tokio::time::timeout(Duration::from_millis(200), printer).await.is_err() {
        tracing::debug!("reply printer still has live senders, exiting anyway");
    }
    tracing::info!("Shutdown complete");
    Ok(())
}
